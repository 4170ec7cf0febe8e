//! Purpose: Define the stable public Rust API boundary for pagewise.
//! Exports: Core types plus the list cache, page sources, remote client and wire types.
//! Role: Public, additive-only surface used by the CLI, the server and tests.
//! Invariants: The list cache is reachable only through this module.
//! Invariants: Wire types are the sole definition of request/response field names.

mod cache;
mod loader;
mod remote;
mod source;
pub mod wire;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::fetcher::{FetcherOptions, Page, PageFetcher, PaginationState};
pub use crate::core::period::{Period, PeriodKey, PeriodOf};
pub use crate::core::query::{Direction, Query, RangeBounds, SortField};
pub use crate::core::store::{MemoryStore, OrderedStore, Record, Schema};
pub use crate::core::value::FieldType;
pub use crate::core::window::{AccessWindow, OpenWindow, RetentionWindow};
pub use cache::{
    Applied, DEFAULT_PAGE_SIZE, Dispatch, FetchKind, ListCache, ListSnapshot, Phase,
    RefreshOptions, Ticket,
};
pub use loader::{CacheOptions, PaginatedListCache};
pub use remote::{DEFAULT_TIMEOUT, RemoteClient, RemoteCollection};
pub use source::{LocalSource, PageSource};
