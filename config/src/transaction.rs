//! Transaction scopes.
//!
//! An editing transaction pulls a fresh working copy from origin, hands it
//! to the caller, and on success pushes it back - passing the origin
//! checksum recorded on entry so a concurrent edit is detected instead of
//! overwritten. The staging flavor skips the origin entirely and only
//! writes the local source.
//!
//! Scopes don't nest; a process-wide flag enforces this.

use crate::backends::create_backend;
use crate::error::{ConfigError, Result};
use crate::reconcile::{pull_from_origin, push_to_origin};
use crate::resolve::get_default_config_and_source;
use relib::TableStore;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

static TRANSACTION_OPEN: AtomicBool = AtomicBool::new(false);

struct ScopeGuard;

impl ScopeGuard {
    fn acquire() -> Result<Self> {
        if TRANSACTION_OPEN.swap(true, Ordering::SeqCst) {
            return Err(ConfigError::Transaction {
                message: "Transactions can't nest.".to_string(),
                push: None,
            });
        }
        Ok(Self)
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        TRANSACTION_OPEN.store(false, Ordering::SeqCst);
    }
}

/// Force-release the transaction flag. Test isolation hook.
pub fn reset_transaction_state() {
    TRANSACTION_OPEN.store(false, Ordering::SeqCst);
}

/// An editing transaction committing to origin.
///
/// ```no_run
/// use drift_config::TsTransaction;
/// use serde_json::json;
///
/// TsTransaction::execute(|ts| {
///     ts.add_row("tiers", json!({"tier_name": "LIVENORTH", "is_live": true}))?;
///     Ok(())
/// }).unwrap();
/// ```
pub struct TsTransaction;

impl TsTransaction {
    /// Pull from origin, run `body` on the working copy, push back to
    /// origin and update the local source.
    ///
    /// If `body` fails, nothing is written anywhere. If the push is
    /// rejected (origin changed underneath), the error carries the
    /// reconciliation result so the caller can rebase and retry.
    pub fn execute<T>(body: impl FnOnce(&mut TableStore) -> Result<T>) -> Result<T> {
        run_scope(true, body)
    }
}

/// A staging scope that writes only the local source, leaving origin
/// untouched.
pub struct TsLocal;

impl TsLocal {
    /// Run `body` on the default store and write it back to its source.
    pub fn execute<T>(body: impl FnOnce(&mut TableStore) -> Result<T>) -> Result<T> {
        run_scope(false, body)
    }
}

fn run_scope<T>(
    commit_to_origin: bool,
    body: impl FnOnce(&mut TableStore) -> Result<T>,
) -> Result<T> {
    let _guard = ScopeGuard::acquire()?;

    let (mut ts, source_url) = get_default_config_and_source()?;

    if commit_to_origin {
        let result = pull_from_origin(&mut ts, false, false)?;
        if !result.pulled {
            return Err(ConfigError::Transaction {
                message: format!("Can't pull latest table store: {}", result.reason),
                push: None,
            });
        }
    }

    let expected_checksum = ts.checksum()?;
    ts.lock_meta();

    // On failure the working copy is simply dropped; neither origin nor
    // the local source have been touched yet.
    let value = body(&mut ts)?;

    ts.unlock_meta();

    if commit_to_origin {
        let result = push_to_origin(&mut ts, false, Some(&expected_checksum))?;
        if !result.pushed {
            return Err(ConfigError::Transaction {
                message: format!("Can't push to origin: {}", result.reason),
                push: Some(result),
            });
        }
        debug!("Transaction committed to origin.");
    }

    let mut source_backend = create_backend(&source_url)?;
    source_backend.save_table_store(&mut ts)?;

    Ok(value)
}
