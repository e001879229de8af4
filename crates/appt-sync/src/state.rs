//! Sync state transitions
//!
//! Maps a change to a private record onto the task it requires.

use appt_core::{Appointment, SyncState};

use crate::task::SyncOperation;

/// Task required by a change from `before` to `after`.
///
/// `before == None` is a creation, `after == None` a deletion.
pub fn plan(before: Option<&Appointment>, after: Option<&Appointment>) -> Option<SyncOperation> {
    match (before, after) {
        (None, Some(created)) => created.partner_relevant.then_some(SyncOperation::Create),
        (Some(deleted), None) => has_mirror_claim(deleted).then_some(SyncOperation::Delete),
        (Some(old), Some(new)) => match (old.partner_relevant, new.partner_relevant) {
            (false, true) => Some(SyncOperation::Create),
            (true, false) => Some(SyncOperation::Delete),
            (true, true) if new.content_differs(old) => Some(edit_operation(new.tracking.sync_state)),
            _ => None,
        },
        (None, None) => None,
    }
}

/// Task for an explicit re-sync of `record`
pub fn plan_resync(record: &Appointment) -> Option<SyncOperation> {
    if record.partner_relevant {
        Some(edit_operation(record.tracking.sync_state))
    } else if record.tracking.synced_peer_id.is_some() {
        Some(SyncOperation::Delete)
    } else {
        None
    }
}

/// Edits of a linked record update the mirror; otherwise the mirror is (re)created
fn edit_operation(state: SyncState) -> SyncOperation {
    match state {
        SyncState::Synced | SyncState::Syncing => SyncOperation::Update,
        SyncState::Unsynced | SyncState::SyncFailed => SyncOperation::Create,
    }
}

/// A deleted record may have a mirror to remove
fn has_mirror_claim(record: &Appointment) -> bool {
    record.partner_relevant || record.tracking.synced_peer_id.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn record(partner_relevant: bool, state: SyncState) -> Appointment {
        let tz = FixedOffset::east_opt(0).unwrap();
        let mut appt = Appointment::new(
            "Movie night",
            tz.with_ymd_and_hms(2025, 2, 7, 20, 0, 0).unwrap(),
            tz.with_ymd_and_hms(2025, 2, 7, 22, 0, 0).unwrap(),
        )
        .with_partner_relevant(partner_relevant);
        appt.tracking.sync_state = state;
        if state == SyncState::Synced {
            appt.tracking.synced_peer_id = Some("m-1".to_string());
        }
        appt
    }

    #[test]
    fn test_create_transitions() {
        let relevant = record(true, SyncState::Unsynced);
        let private = record(false, SyncState::Unsynced);

        assert_eq!(plan(None, Some(&relevant)), Some(SyncOperation::Create));
        assert_eq!(plan(None, Some(&private)), None);
        assert_eq!(plan(Some(&private), Some(&relevant)), Some(SyncOperation::Create));
    }

    #[test]
    fn test_toggle_off_and_delete() {
        let synced = record(true, SyncState::Synced);
        let mut toggled = synced.clone();
        toggled.partner_relevant = false;

        assert_eq!(plan(Some(&synced), Some(&toggled)), Some(SyncOperation::Delete));
        assert_eq!(plan(Some(&synced), None), Some(SyncOperation::Delete));
        assert_eq!(plan(Some(&record(false, SyncState::Unsynced)), None), None);
    }

    #[test]
    fn test_content_edits() {
        let synced = record(true, SyncState::Synced);
        let mut edited = synced.clone();
        edited.title = "Movie night (moved)".to_string();
        assert_eq!(plan(Some(&synced), Some(&edited)), Some(SyncOperation::Update));

        // Marker-only changes need nothing
        let mut marker = synced.clone();
        marker.tracking.sync_state = SyncState::Syncing;
        assert_eq!(plan(Some(&synced), Some(&marker)), None);

        // An edit after exhausted retries drives a fresh create
        let failed = record(true, SyncState::SyncFailed);
        let mut edited = failed.clone();
        edited.location = Some("Cinema".to_string());
        assert_eq!(plan(Some(&failed), Some(&edited)), Some(SyncOperation::Create));

        let plain = record(false, SyncState::Unsynced);
        let mut edited = plain.clone();
        edited.title = "Solo".to_string();
        assert_eq!(plan(Some(&plain), Some(&edited)), None);
    }

    #[test]
    fn test_resync() {
        assert_eq!(
            plan_resync(&record(true, SyncState::SyncFailed)),
            Some(SyncOperation::Create)
        );
        assert_eq!(
            plan_resync(&record(true, SyncState::Synced)),
            Some(SyncOperation::Update)
        );
        let mut stale = record(true, SyncState::Synced);
        stale.partner_relevant = false;
        assert_eq!(plan_resync(&stale), Some(SyncOperation::Delete));
        assert_eq!(plan_resync(&record(false, SyncState::Unsynced)), None);
    }
}
