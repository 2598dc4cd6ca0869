//! Reconciliation protocol tests over in-memory and filesystem origins.

mod common;

use drift_config::{
    create_backend, pull_from_origin, push_to_origin, ConfigError, PullReason, PushReason,
    TsLocal, TsTransaction,
};
use once_cell::sync::Lazy;
use relib::TableStore;
use serde_json::json;
use std::sync::Mutex;

/// Serializes the tests that touch process-wide state (sticky config and
/// the transaction flag).
static PROCESS_STATE: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

fn bump_display_name(ts: &mut TableStore, suffix: &str) {
    let domain = ts.get_table_mut("domain").unwrap().get_single_mut().unwrap();
    let name = format!(
        "{} {}",
        domain["display_name"].as_str().unwrap_or_default(),
        suffix
    );
    domain["display_name"] = json!(name);
}

#[test]
fn push_is_idempotent() {
    let origin = "memory://push-idempotent-origin";
    let mut local = common::create_test_domain(origin);

    let result = push_to_origin(&mut local, false, None).unwrap();
    assert!(result.pushed);
    assert_eq!(result.reason, PushReason::PushedToOrigin);

    let result = push_to_origin(&mut local, false, None).unwrap();
    assert!(result.pushed);
    assert_eq!(result.reason, PushReason::PushSkippedCrcMatch);
}

#[test]
fn pull_is_idempotent() {
    let origin = "memory://pull-idempotent-origin";
    let mut local = common::create_test_domain(origin);
    push_to_origin(&mut local, false, None).unwrap();

    // A fresh working copy with nothing in it yet pulls everything.
    let mut working = common::create_test_domain(origin);
    bump_display_name(&mut working, "local-edit");
    let result = pull_from_origin(&mut working, true, false).unwrap();
    assert_eq!(result.reason, PullReason::PulledFromOrigin);

    let result = pull_from_origin(&mut working, false, false).unwrap();
    assert_eq!(result.reason, PullReason::PullSkippedCrcMatch);
}

#[test]
fn push_detects_divergence() {
    let origin = "memory://divergence-origin";
    let mut local = common::create_test_domain(origin);
    push_to_origin(&mut local, false, None).unwrap();

    // Someone else edits the origin out of band.
    let mut other = create_backend(origin).unwrap().load_table_store().unwrap();
    bump_display_name(&mut other, "intruder");
    {
        let mut origin_backend = create_backend(origin).unwrap();
        origin_backend.save_table_store(&mut other).unwrap();
    }

    // Our own edit can no longer be pushed blindly.
    bump_display_name(&mut local, "mine");
    let result = push_to_origin(&mut local, false, None).unwrap();
    assert!(!result.pushed);
    assert_eq!(result.reason, PushReason::ChecksumDiffer);
    assert!(result.local_meta.is_some());
    assert!(result.origin_meta.is_some());
    assert_ne!(
        result.local_meta.as_ref().unwrap()["checksum"],
        result.origin_meta.as_ref().unwrap()["checksum"]
    );

    // Force overwrites the diverged origin.
    let result = push_to_origin(&mut local, true, None).unwrap();
    assert!(result.pushed);
    assert_eq!(result.reason, PushReason::PushedToOrigin);

    let origin_ts = create_backend(origin).unwrap().load_table_store().unwrap();
    assert_eq!(origin_ts.checksum().unwrap(), local.checksum().unwrap());
}

#[test]
fn pull_respects_local_edits() {
    let origin = "memory://local-edits-origin";
    let mut local = common::create_test_domain(origin);
    push_to_origin(&mut local, false, None).unwrap();

    bump_display_name(&mut local, "unsaved");
    let result = pull_from_origin(&mut local, false, false).unwrap();
    assert!(!result.pulled);
    assert_eq!(result.reason, PullReason::LocalIsModified);

    // Overriding drops the local edit.
    let result = pull_from_origin(&mut local, true, false).unwrap();
    assert!(result.pulled);
    assert_eq!(result.reason, PullReason::PulledFromOrigin);
    let display_name = local
        .get_table("domain")
        .unwrap()
        .single_field("display_name")
        .unwrap()
        .clone();
    assert_eq!(display_name, json!("Unit Test Domain"));
}

#[test]
fn first_push_to_empty_origin() {
    let origin = "memory://first-push-origin";
    let mut local = common::create_test_domain(origin);

    let result = push_to_origin(&mut local, false, None).unwrap();
    assert_eq!(result.reason, PushReason::PushedToOrigin);

    let origin_ts = create_backend(origin).unwrap().load_table_store().unwrap();
    assert_eq!(
        origin_ts.get_table("tenants").unwrap().len(),
        local.get_table("tenants").unwrap().len()
    );
}

#[test]
fn file_and_archive_forms_roundtrip_identically() {
    let mut ts = common::create_test_domain("memory://unused-origin");

    let tree_dir = tempfile::tempdir().unwrap();
    let archive_dir = tempfile::tempdir().unwrap();
    let tree_url = format!("file://{}", tree_dir.path().display());
    let archive_url = format!("file+zip://{}", archive_dir.path().display());

    create_backend(&tree_url)
        .unwrap()
        .save_table_store(&mut ts)
        .unwrap();
    create_backend(&archive_url)
        .unwrap()
        .save_table_store(&mut ts)
        .unwrap();

    // The archive form is a single artifact.
    assert!(archive_dir.path().join(drift_config::ARCHIVE_FILENAME).is_file());
    assert!(tree_dir.path().join("tenants").is_dir());

    let from_tree = create_backend(&tree_url).unwrap().load_table_store().unwrap();
    let from_archive = create_backend(&archive_url)
        .unwrap()
        .load_table_store()
        .unwrap();

    assert_eq!(from_tree.checksum().unwrap(), from_archive.checksum().unwrap());
    for table in from_tree.tables() {
        let other = from_archive.get_table(table.name()).unwrap();
        let a: Vec<_> = table.iter().collect();
        let b: Vec<_> = other.iter().collect();
        assert_eq!(a, b, "table '{}' differs", table.name());
    }
}

#[test]
fn cache_update_follows_tier_config() {
    let origin = "memory://cache-origin";
    let mut ts = common::create_test_domain(origin);

    // No cache configured on the tier.
    assert!(drift_config::update_cache(&mut ts, common::TIER_NAME).unwrap().is_none());

    let cache_url = "memory://tier-cache";
    if let Some(tier) = ts
        .get_table_mut("tiers")
        .unwrap()
        .get_mut(&json!({"tier_name": common::TIER_NAME}))
        .unwrap()
    {
        tier["cache"] = json!(cache_url);
    }

    let updated = drift_config::update_cache(&mut ts, common::TIER_NAME).unwrap();
    assert_eq!(updated.as_deref(), Some(cache_url));

    let cached = create_backend(cache_url).unwrap().load_table_store().unwrap();
    assert_eq!(cached.checksum().unwrap(), ts.checksum().unwrap());

    let err = drift_config::get_cache_backend(&ts, "NOTIER").unwrap_err();
    assert!(matches!(err, ConfigError::ConfigNotFound(_)));
}

#[test]
fn transaction_commits_to_origin_and_source() {
    let _lock = PROCESS_STATE.lock().unwrap_or_else(|p| p.into_inner());
    drift_config::reset_transaction_state();

    let origin = "memory://txn-origin";
    let mut local = common::create_test_domain(origin);
    push_to_origin(&mut local, false, None).unwrap();
    drift_config::set_sticky_config(local);

    TsTransaction::execute(|ts| {
        bump_display_name(ts, "edited-in-txn");

        // The metadata table is read-only inside the scope.
        assert!(ts.get_table_mut(relib::TS_META_TABLENAME).is_err());
        Ok(())
    })
    .unwrap();
    drift_config::clear_sticky_config();

    let origin_ts = create_backend(origin).unwrap().load_table_store().unwrap();
    let display_name = origin_ts
        .get_table("domain")
        .unwrap()
        .single_field("display_name")
        .unwrap()
        .clone();
    assert_eq!(display_name, json!("Unit Test Domain edited-in-txn"));

    // The local source (the sticky stand-in backend) was updated too.
    let source_ts = create_backend("memory://sticky").unwrap().load_table_store().unwrap();
    assert_eq!(source_ts.checksum().unwrap(), origin_ts.checksum().unwrap());
}

#[test]
fn transaction_aborts_cleanly_and_detects_divergence() {
    let _lock = PROCESS_STATE.lock().unwrap_or_else(|p| p.into_inner());
    drift_config::reset_transaction_state();

    let origin = "memory://txn-abort-origin";
    let mut local = common::create_test_domain(origin);
    push_to_origin(&mut local, false, None).unwrap();
    let pristine_checksum = local.checksum().unwrap();
    drift_config::set_sticky_config(local);

    // A failing body leaves the origin untouched.
    let result: drift_config::Result<()> = TsTransaction::execute(|ts| {
        bump_display_name(ts, "never-lands");
        Err(ConfigError::ConfigNotFound("simulated failure".into()))
    });
    assert!(result.is_err());
    let origin_ts = create_backend(origin).unwrap().load_table_store().unwrap();
    assert_eq!(origin_ts.checksum().unwrap(), pristine_checksum);

    // Nesting is refused.
    let result: drift_config::Result<()> = TsTransaction::execute(|_ts| {
        let nested: drift_config::Result<()> = TsLocal::execute(|_| Ok(()));
        match nested {
            Err(ConfigError::Transaction { message, .. }) => {
                assert!(message.contains("nest"));
                Ok(())
            }
            other => panic!("nesting was not refused: {:?}", other.is_ok()),
        }
    });
    result.unwrap();

    // Origin diverging between pull and push fails the commit with the
    // reconciliation result attached.
    let result: drift_config::Result<()> = TsTransaction::execute(|ts| {
        bump_display_name(ts, "mine");

        let mut other = create_backend(origin).unwrap().load_table_store().unwrap();
        bump_display_name(&mut other, "intruder");
        let mut origin_backend = create_backend(origin).unwrap();
        origin_backend.save_table_store(&mut other).unwrap();
        Ok(())
    });
    match result {
        Err(ConfigError::Transaction { push: Some(push), .. }) => {
            assert_eq!(push.reason, PushReason::ChecksumDiffer);
        }
        other => panic!("expected a transaction error, got ok={}", other.is_ok()),
    }

    drift_config::clear_sticky_config();
}
