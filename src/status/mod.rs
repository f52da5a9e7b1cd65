//! Persisted job status records.
//!
//! Every job the queue sees gets a [`StatusRecord`] that follows it through
//! its lifecycle and is kept after it reaches a terminal state. The same
//! database holds a scoped key-value map used by the notification scheduler.

mod models;
mod schema;
mod sqlite_status_store;

pub use models::*;
pub use schema::STATUS_VERSIONED_SCHEMAS;
pub use sqlite_status_store::SqliteStatusStore;

use anyhow::Result;

/// An open store transaction.
///
/// Transactions nest: an inner `begin` on the same thread joins the outer
/// one, and only the outermost commit reaches the database. Dropping a
/// transaction without committing rolls back the whole outermost scope.
pub trait StoreTransaction {
    fn commit(self: Box<Self>) -> Result<()>;
}

pub trait StatusStore: Send + Sync {
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>>;

    fn insert(&self, record: NewStatusRecord) -> Result<StatusRecord>;
    fn get(&self, status_ref: &StatusRef) -> Result<Option<StatusRecord>>;
    /// Applies a sparse patch and returns the stored result.
    fn update(&self, status_ref: &StatusRef, update: StatusUpdate) -> Result<StatusRecord>;
    fn list(&self, filter: &StatusFilter) -> Result<Vec<StatusRecord>>;
    /// Children of `parent_guid` in `container_id` whose status is not COMPLETE.
    fn count_incomplete_children(&self, parent_guid: &str, container_id: &str) -> Result<usize>;
}

pub trait PropertyStore: Send + Sync {
    fn get_property(&self, scope: &str, key: &str) -> Result<Option<String>>;
    fn set_property(&self, scope: &str, key: &str, value: &str) -> Result<()>;
    fn delete_property(&self, scope: &str, key: &str) -> Result<bool>;
    fn list_properties(&self, scope: &str) -> Result<Vec<(String, String)>>;
}
