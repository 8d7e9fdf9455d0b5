//! Condition lifecycle state machine
//!
//! Tracks each condition key through:
//! UNSEEN → NEW → ONGOING → CLEARED → UNSEEN (removed)
//!
//! The watcher reports a transition computed from its in-memory diff. The
//! persisted state is authoritative, so the reported transition is confirmed
//! or overridden against it:
//! - UNSEEN + present → NEW
//! - NEW/ONGOING + present → ONGOING
//! - NEW/ONGOING + cleared → CLEARED (record removed)
//! - UNSEEN + cleared → nothing to report

use crate::condition::LifecycleState;

/// What the state store must do for a reconciled transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    /// Write the record with the given state
    Put(LifecycleState),
    /// Remove the record
    Delete,
    /// Leave the store untouched
    Keep,
}

/// Reconciled transition for one condition key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTransition {
    /// Persisted state before this observation (`None` = unseen)
    pub from: Option<LifecycleState>,
    /// Event to report, if any
    pub emit: Option<LifecycleState>,
    /// Store update to apply before reporting
    pub store: StoreAction,
    /// Whether the persisted state contradicted the reported transition
    pub overridden: bool,
}

impl LifecycleTransition {
    /// Whether the persisted lifecycle state changes
    pub fn changed(&self) -> bool {
        match self.store {
            StoreAction::Put(state) => self.from != Some(state),
            StoreAction::Delete => true,
            StoreAction::Keep => false,
        }
    }
}

/// Reconcile the watcher's reported transition with the persisted state
pub fn reconcile(persisted: Option<LifecycleState>, reported: LifecycleState) -> LifecycleTransition {
    // A CLEARED record is never kept; treat a stray one as unseen
    let from = persisted.filter(LifecycleState::is_active);

    match (from, reported) {
        (None, LifecycleState::New | LifecycleState::Ongoing) => LifecycleTransition {
            from,
            emit: Some(LifecycleState::New),
            store: StoreAction::Put(LifecycleState::New),
            overridden: reported != LifecycleState::New,
        },
        (Some(_), LifecycleState::New | LifecycleState::Ongoing) => LifecycleTransition {
            from,
            emit: Some(LifecycleState::Ongoing),
            store: StoreAction::Put(LifecycleState::Ongoing),
            overridden: reported != LifecycleState::Ongoing,
        },
        (Some(_), LifecycleState::Cleared) => LifecycleTransition {
            from,
            emit: Some(LifecycleState::Cleared),
            store: StoreAction::Delete,
            overridden: false,
        },
        (None, LifecycleState::Cleared) => LifecycleTransition {
            from,
            emit: None,
            store: StoreAction::Keep,
            overridden: true,
        },
    }
}
