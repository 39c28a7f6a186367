//! Purpose: Library crate backing the `livedoc` CLI and embedding applications.
//! Exports: `api` (sessions, reactive synchronizers, identity source) and `core` (records, stores, errors).
//! Role: Reactive client-side state over a keyed document store.
//! Invariants: State cells are explicit values handed out by a `Session`; there is no ambient state.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
