// Stateless page fetcher: bounded range reads with a one-record lookahead.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::query::{Direction, Query, RangeBounds};
use crate::core::store::{OrderedStore, RangeScan, Record, ScanFrom, Scanned};
use crate::core::value::SortKey;
use crate::core::window::{AccessWindow, OpenWindow};

pub const DEFAULT_MAX_LIMIT: u32 = 1000;

/// Highest `max_limit` a hosted collection may configure.
pub const MAX_LIMIT_CEILING: u32 = 10_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaginationState {
    /// More records may exist past `last`.
    Continue,
    /// No further records.
    End,
    /// Further records exist but the access window withholds them.
    Limited,
}

impl PaginationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PaginationState::Continue)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaginationState::Continue => "CONTINUE",
            PaginationState::End => "END",
            PaginationState::Limited => "LIMITED",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Page {
    pub records: Vec<Record>,
    pub state: PaginationState,
    /// Bound for the next request; the prior bound when the page is empty.
    pub last: Option<String>,
    /// Commit sequence the first page was read at; lets callers pin later pages.
    pub state_at: Option<u64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FetcherOptions {
    /// Limit used when a request asks for `0`. Without one, `0` is rejected.
    pub default_limit: Option<u32>,
    /// Requests above this are clamped.
    pub max_limit: u32,
}

impl FetcherOptions {
    pub fn new() -> Self {
        Self {
            default_limit: None,
            max_limit: DEFAULT_MAX_LIMIT,
        }
    }

    pub fn with_default_limit(mut self, limit: u32) -> Self {
        self.default_limit = Some(limit);
        self
    }

    pub fn with_max_limit(mut self, limit: u32) -> Self {
        self.max_limit = limit;
        self
    }

    pub fn resolve_limit(&self, requested: u32) -> Result<u32, Error> {
        let limit = if requested == 0 {
            self.default_limit.ok_or_else(|| {
                Error::new(ErrorKind::InvalidQuery)
                    .with_message("limit must be greater than zero")
                    .with_hint("Pass an explicit limit; no default page size is configured.")
            })?
        } else {
            requested
        };
        if limit == 0 || self.max_limit == 0 {
            return Err(Error::new(ErrorKind::InvalidQuery).with_message("page size resolves to zero"));
        }
        if limit > self.max_limit {
            debug!(requested = limit, max_limit = self.max_limit, "clamping page size");
            return Ok(self.max_limit);
        }
        Ok(limit)
    }
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct PageFetcher {
    store: Arc<dyn OrderedStore>,
    window: Arc<dyn AccessWindow>,
    options: FetcherOptions,
}

impl std::fmt::Debug for PageFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFetcher")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl PageFetcher {
    pub fn new(store: Arc<dyn OrderedStore>) -> Self {
        Self {
            store,
            window: Arc::new(OpenWindow),
            options: FetcherOptions::new(),
        }
    }

    pub fn with_window(mut self, window: Arc<dyn AccessWindow>) -> Self {
        self.window = window;
        self
    }

    pub fn with_options(mut self, options: FetcherOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> FetcherOptions {
        self.options
    }

    pub fn store(&self) -> &Arc<dyn OrderedStore> {
        &self.store
    }

    pub fn fetch(&self, query: &Query, bounds: &RangeBounds, limit: u32) -> Result<Page, Error> {
        let field_type = self.store.schema().validate_query(query)?;
        let limit = self.options.resolve_limit(limit)?;
        let after = bounds
            .after
            .as_deref()
            .map(|raw| field_type.parse_bound(raw))
            .transpose()?;
        let before = bounds
            .before
            .as_deref()
            .map(|raw| field_type.parse_bound(raw))
            .transpose()?;

        // `before` alone walks away from the bound, against the query's order.
        let backward = after.is_none() && before.is_some();
        let (order, from, until, prior) = if backward {
            (
                query.direction().reverse(),
                before.map(ScanFrom::PastKey).unwrap_or(ScanFrom::Start),
                None,
                bounds.before.clone(),
            )
        } else {
            (
                query.direction(),
                after.map(ScanFrom::PastKey).unwrap_or(ScanFrom::Start),
                before,
                bounds.after.clone(),
            )
        };

        let state_at = match query.state_at() {
            Some(state_at) => Some(state_at),
            None if bounds.is_empty() => Some(self.store.commit_seq()?),
            None => None,
        };

        let want = limit as usize + 1;
        let (mut admitted, withheld) = self.collect(query, order, from, until, state_at, want)?;

        let state = if admitted.len() > limit as usize {
            admitted.truncate(limit as usize);
            PaginationState::Continue
        } else if withheld {
            PaginationState::Limited
        } else {
            PaginationState::End
        };

        if backward {
            admitted.reverse();
        }
        let boundary = if backward {
            admitted.first()
        } else {
            admitted.last()
        };
        let last = boundary.map(|scanned| scanned.key.render()).or(prior);

        debug!(
            order = %query.sort(),
            desc = query.direction().is_desc(),
            limit,
            returned = admitted.len(),
            state = state.as_str(),
            "fetched page"
        );

        Ok(Page {
            records: admitted.into_iter().map(|scanned| scanned.record).collect(),
            state,
            last,
            state_at: if bounds.is_empty() { state_at } else { None },
        })
    }

    /// Scan in chunks until `want` admitted records are found or the store runs dry.
    fn collect(
        &self,
        query: &Query,
        order: Direction,
        mut from: ScanFrom,
        until: Option<SortKey>,
        state_at: Option<u64>,
        want: usize,
    ) -> Result<(Vec<Scanned>, bool), Error> {
        // Grows with what the store returns, never with the requested size.
        let mut admitted = Vec::new();
        let mut withheld = false;
        loop {
            let chunk = self.store.scan(&RangeScan {
                query,
                order,
                from: from.clone(),
                until: until.clone(),
                state_at,
                limit: want,
            })?;
            let exhausted = chunk.len() < want;
            let resume = chunk
                .last()
                .map(|scanned| ScanFrom::PastRecord(scanned.key.clone(), scanned.record.id.clone()));

            for scanned in chunk {
                if admitted.len() == want {
                    break;
                }
                if self.window.admits(query, &scanned.record) {
                    admitted.push(scanned);
                } else {
                    withheld = true;
                }
            }

            if admitted.len() == want || exhausted {
                return Ok((admitted, withheld));
            }
            match resume {
                Some(next) => from = next,
                None => return Ok((admitted, withheld)),
            }
        }
    }
}
