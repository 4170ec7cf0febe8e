//! Purpose: Shared library crate behind the `pagewise` CLI, server, and tests.
//! Exports: `core` (store, fetcher, bounds, errors), `api` (wire contract, list cache,
//! page sources, remote client), `catalog` (hosted collection config), `notice`.
//! Role: Server-side page fetching and client-side incremental list loading.
//! Invariants: Core modules are synchronous and perform no I/O beyond the store.
//! Invariants: Every cross-process payload goes through `api::wire`.
pub mod api;
pub mod catalog;
pub mod core;
pub mod notice;
