// Core modules implementing records, stamping, identifiers, errors, and the store backends.
pub mod error;
pub mod file_store;
pub mod ids;
pub mod memory;
pub mod record;
pub mod store;
