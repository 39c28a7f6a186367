//! Purpose: Define the public reactive API for livedoc.
//! Exports: Session, synchronizers, state cells, identity source, and the store seam.
//! Role: Public, additive-only surface; internal cell bookkeeping stays private.
//! Invariants: Every state cell is written only by its synchronizer or mutation operations.
//! Invariants: Only the identity source writes `AuthState`.

mod auth;
mod cell;
mod collection;
mod doc;
mod mutate;
mod ownership;
mod session;
mod subscription;

pub use crate::core::error::{Error, ErrorKind, to_exit_code};
pub use crate::core::file_store::{FileStore, FileStoreOptions};
pub use crate::core::memory::MemoryStore;
pub use crate::core::record::{Fields, Filter, Record, fields_from_value};
pub use crate::core::store::{DocSnapshot, QuerySnapshot, Store, Subscription};
pub use auth::{Auth, AuthBackend, AuthState, LinkSettings, LocalAuth, Provider, User};
pub use cell::OverlapPolicy;
pub use collection::{CollectionRef, CollectionState};
pub use doc::{Acquired, Doc, RecordState};
pub use mutate::Pending;
pub use ownership::{Ownership, is_creator};
pub use session::{Session, SessionConfig};
pub use subscription::SyncHandle;
