//! Purpose: Define the backend store seam consumed by the reactive layer.
//! Exports: `Store`, `Subscription`, `DocSnapshot`, `QuerySnapshot`, `validate_collection_name`.
//! Role: Keyed-collection handle; implementations own transport and consistency.
//! Invariants: Subscriptions deliver the state at registration first, then one item per change.
//! Invariants: Query results come back in the backend's order; callers never re-sort.
//! Invariants: Failures are passed through unchanged; the seam defines no retry policy.

use std::future::Future;

use tokio::sync::mpsc;

use crate::core::error::{Error, ErrorKind};
use crate::core::record::{Fields, Filter, Record};

pub type DocSnapshot = Option<Record>;
pub type QuerySnapshot = Vec<Record>;

pub trait Store: Send + Sync + 'static {
    fn get(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<DocSnapshot, Error>> + Send;

    fn query(
        &self,
        collection: &str,
        filter: Option<&Filter>,
    ) -> impl Future<Output = Result<QuerySnapshot, Error>> + Send;

    /// Writes a new record under a generated id and returns that id.
    fn add(
        &self,
        collection: &str,
        fields: Fields,
    ) -> impl Future<Output = Result<String, Error>> + Send;

    /// Shallow-merges `changes` into an existing record.
    fn update(
        &self,
        collection: &str,
        id: &str,
        changes: Fields,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Replaces (or creates) the record at `id`.
    fn set(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn delete(&self, collection: &str, id: &str) -> impl Future<Output = Result<(), Error>> + Send;

    fn watch(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<Subscription<DocSnapshot>, Error>> + Send;

    fn watch_query(
        &self,
        collection: &str,
        filter: Option<&Filter>,
    ) -> impl Future<Output = Result<Subscription<QuerySnapshot>, Error>> + Send;
}

/// Receiving end of a backend push channel.
///
/// Dropping it unregisters interest; stores prune the sender on their next push.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<Result<T, Error>>,
}

impl<T> Subscription<T> {
    pub fn channel() -> (mpsc::UnboundedSender<Result<T, Error>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    pub async fn next(&mut self) -> Option<Result<T, Error>> {
        self.rx.recv().await
    }
}

pub fn validate_collection_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("collection name must not be empty")
            .with_hint("Use a name like `posts`."));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("collection name must not contain path separators")
            .with_collection(name));
    }
    Ok(())
}

pub(crate) fn validate_record_id(collection: &str, id: &str) -> Result<(), Error> {
    if id.is_empty() || id.contains('/') {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("record id must be non-empty and free of `/`")
            .with_collection(collection)
            .with_id(id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Subscription, validate_collection_name, validate_record_id};
    use crate::core::error::ErrorKind;

    #[test]
    fn collection_names_reject_separators() {
        assert!(validate_collection_name("posts").is_ok());
        for bad in ["", "a/b", r"a\b"] {
            let err = validate_collection_name(bad).expect_err("bad name");
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
    }

    #[test]
    fn record_ids_reject_empty() {
        let err = validate_record_id("posts", "").expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(err.collection(), Some("posts"));
    }

    #[tokio::test]
    async fn subscription_yields_in_order_then_ends() {
        let (tx, mut sub) = Subscription::<u32>::channel();
        tx.send(Ok(1)).expect("send");
        tx.send(Ok(2)).expect("send");
        drop(tx);
        assert_eq!(sub.next().await.map(|r| r.expect("ok")), Some(1));
        assert_eq!(sub.next().await.map(|r| r.expect("ok")), Some(2));
        assert!(sub.next().await.is_none());
    }
}
