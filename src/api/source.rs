//! Purpose: Abstract where pages come from so the list cache can run over any transport.
//! Exports: `PageSource`, `LocalSource`.
//! Role: Seam between `PaginatedListCache` and an in-process fetcher or a remote server.
//! Invariants: A source performs exactly one page request per call; no retries.
use std::future::Future;
use std::sync::Arc;

use crate::api::wire::ListRequest;
use crate::core::error::Error;
use crate::core::fetcher::{Page, PageFetcher};
use crate::core::query::{Query, RangeBounds};

pub trait PageSource: Send + Sync + 'static {
    fn fetch_page(
        &self,
        query: &Query,
        bounds: &RangeBounds,
        limit: u32,
    ) -> impl Future<Output = Result<Page, Error>> + Send;
}

impl<S: PageSource> PageSource for Arc<S> {
    fn fetch_page(
        &self,
        query: &Query,
        bounds: &RangeBounds,
        limit: u32,
    ) -> impl Future<Output = Result<Page, Error>> + Send {
        self.as_ref().fetch_page(query, bounds, limit)
    }
}

impl PageFetcher {
    /// Serve one wire request: decode it, validate it against the schema, fetch.
    pub fn fetch_request(&self, request: &ListRequest) -> Result<Page, Error> {
        self.fetch(&request.query(), &request.bounds(), request.limit)
    }
}

/// In-process source over a `PageFetcher`. Store calls are synchronous and short.
#[derive(Clone, Debug)]
pub struct LocalSource {
    fetcher: Arc<PageFetcher>,
}

impl LocalSource {
    pub fn new(fetcher: Arc<PageFetcher>) -> Self {
        Self { fetcher }
    }

    pub fn fetcher(&self) -> &PageFetcher {
        &self.fetcher
    }
}

impl PageSource for LocalSource {
    fn fetch_page(
        &self,
        query: &Query,
        bounds: &RangeBounds,
        limit: u32,
    ) -> impl Future<Output = Result<Page, Error>> + Send {
        let result = self.fetcher.fetch(query, bounds, limit);
        async move { result }
    }
}
