//! Integrity check switches.
//!
//! Five independently togglable checks gate row validation: primary key
//! duplication (`pk`), foreign key resolution (`fk`), unique field sets
//! (`unique`), schema validation (`schema`) and key field presence
//! (`constraints`). All are on by default. Reads may relax them to load a
//! partially broken store for repair; writes to an origin force all of them
//! back on for the duration of the write.
//!
//! The store is single threaded by contract, so the switches live in
//! thread-local storage; every thread starts with the default set and test
//! threads can't trip each other up.

use std::cell::Cell;

/// The set of integrity checks applied when rows are added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityChecks {
    /// Reject duplicate canonical primary keys.
    pub pk: bool,
    /// Require foreign keys to resolve to an existing row.
    pub fk: bool,
    /// Reject duplicate unique field sets.
    pub unique: bool,
    /// Validate rows against the table schema.
    pub schema: bool,
    /// Require primary key and unique constraint fields to be present.
    pub constraints: bool,
}

impl IntegrityChecks {
    /// Every check enabled.
    pub const ALL: Self = Self {
        pk: true,
        fk: true,
        unique: true,
        schema: true,
        constraints: true,
    };

    /// Every check disabled.
    pub const NONE: Self = Self {
        pk: false,
        fk: false,
        unique: false,
        schema: false,
        constraints: false,
    };

    /// True when no check is enabled at all.
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl Default for IntegrityChecks {
    fn default() -> Self {
        Self::ALL
    }
}

thread_local! {
    static CHECKS: Cell<IntegrityChecks> = const { Cell::new(IntegrityChecks::ALL) };
}

/// The currently active check set.
pub fn current() -> IntegrityChecks {
    CHECKS.with(Cell::get)
}

/// Replace the active check set, returning the previous one.
pub fn set(checks: IntegrityChecks) -> IntegrityChecks {
    CHECKS.with(|cell| cell.replace(checks))
}

/// Restore the default check set. Test isolation hook.
pub fn reset() {
    set(IntegrityChecks::ALL);
}

/// Force all checks on until the returned guard is dropped.
///
/// Used by origin writes: whatever a repair session relaxed, bytes leaving
/// for the authoritative backend are always fully validated.
pub fn force_all() -> ForceAllGuard {
    ForceAllGuard {
        previous: set(IntegrityChecks::ALL),
    }
}

/// Restores the previous check set on drop.
pub struct ForceAllGuard {
    previous: IntegrityChecks,
}

impl Drop for ForceAllGuard {
    fn drop(&mut self) {
        set(self.previous);
    }
}
