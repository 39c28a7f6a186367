//! Purpose: Derived "did the current identity create this record" attribute.
//! Exports: `is_creator`, `Ownership`.
//! Invariants: Never stored; recomputed from the identity and record cells on every read.
//! Invariants: False when no record is loaded or nobody is signed in.

use tokio::sync::watch;

use super::auth::AuthState;
use super::doc::RecordState;

pub fn is_creator(uid: Option<&str>, state: &RecordState) -> bool {
    match (uid, state.exists, state.created_by()) {
        (Some(uid), true, Some(creator)) => uid == creator,
        _ => false,
    }
}

/// Reactive view over (identity, record) answering [`is_creator`].
#[derive(Clone, Debug)]
pub struct Ownership {
    identity: watch::Receiver<AuthState>,
    record: watch::Receiver<RecordState>,
}

impl Ownership {
    pub(crate) fn new(
        identity: watch::Receiver<AuthState>,
        record: watch::Receiver<RecordState>,
    ) -> Self {
        Self { identity, record }
    }

    pub fn get(&self) -> bool {
        let uid = self.identity.borrow().uid.clone();
        is_creator(uid.as_deref(), &self.record.borrow())
    }

    /// Waits until either input changes, then returns the recomputed value.
    ///
    /// Returns `None` once either input's writer is gone.
    pub async fn changed(&mut self) -> Option<bool> {
        let result = tokio::select! {
            result = self.identity.changed() => result,
            result = self.record.changed() => result,
        };
        result.ok()?;
        Some(self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::{Ownership, is_creator};
    use crate::api::auth::AuthState;
    use crate::api::doc::RecordState;
    use crate::core::record::Fields;
    use serde_json::json;
    use tokio::sync::watch;

    fn loaded(created_by: &str) -> RecordState {
        let mut doc = Fields::new();
        doc.insert("createdBy".to_string(), json!(created_by));
        RecordState {
            exists: true,
            doc: Some(doc),
            id: Some("a".to_string()),
            ..RecordState::default()
        }
    }

    #[test]
    fn creator_matches_identity() {
        assert!(is_creator(Some("u1"), &loaded("u1")));
        assert!(!is_creator(Some("u2"), &loaded("u1")));
    }

    #[test]
    fn false_without_record_or_identity() {
        assert!(!is_creator(Some("u1"), &RecordState::default()));
        assert!(!is_creator(None, &loaded("u1")));

        let missing = RecordState {
            exists: false,
            doc: Some(Fields::new()),
            ..RecordState::default()
        };
        assert!(!is_creator(Some("u1"), &missing));
    }

    #[tokio::test]
    async fn recomputes_when_identity_changes() {
        let (identity_tx, identity_rx) = watch::channel(AuthState::default());
        let (_record_tx, record_rx) = watch::channel(loaded("u1"));
        let mut ownership = Ownership::new(identity_rx, record_rx);
        assert!(!ownership.get());

        identity_tx.send_modify(|state| state.uid = Some("u1".to_string()));
        assert_eq!(ownership.changed().await, Some(true));

        identity_tx.send_modify(|state| state.uid = Some("u2".to_string()));
        assert_eq!(ownership.changed().await, Some(false));
    }
}
