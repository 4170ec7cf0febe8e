//! Purpose: Async front end for `ListCache` that runs fetches against a `PageSource`.
//! Exports: `PaginatedListCache`, `CacheOptions`.
//! Role: Owns the single in-flight fetch per query and fans its outcome out to every
//! caller that attached while it ran.
//! Invariants: The cache lock is never held across an await point.
//! Invariants: A dropped driving future abandons its ticket; attached callers get `Cancelled`.
//! Invariants: Superseded or cancelled callers get `Cancelled`, never another query's data.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::api::cache::{
    Applied, DEFAULT_PAGE_SIZE, Dispatch, ListCache, ListSnapshot, RefreshOptions, Ticket,
};
use crate::api::source::PageSource;
use crate::core::error::{Error, ErrorKind};
use crate::core::fetcher::Page;
use crate::core::period::PeriodOf;
use crate::core::query::Query;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CacheOptions {
    /// Page size requested for every fetch.
    pub limit: u32,
    /// Default for `refresh`; `refresh_with` overrides per call.
    pub clear_on_refresh: bool,
    /// Upper bound on one page request. Expiry counts as `StoreUnavailable`.
    pub fetch_timeout: Option<Duration>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            clear_on_refresh: false,
            fetch_timeout: None,
        }
    }
}

type Outcome = Option<Result<ListSnapshot, Error>>;

struct Pending {
    generation: u64,
    tx: watch::Sender<Outcome>,
}

struct Shared {
    cache: ListCache,
    waiters: HashMap<Query, Pending>,
}

impl Shared {
    /// Deliver the outcome of `ticket` to attached callers if it is still the current fetch.
    fn finish(&mut self, ticket: &Ticket, outcome: Result<ListSnapshot, Error>) {
        let current = self
            .waiters
            .get(ticket.query())
            .is_some_and(|pending| pending.generation == ticket.generation());
        if current {
            if let Some(pending) = self.waiters.remove(ticket.query()) {
                pending.tx.send_replace(Some(outcome));
            }
        }
    }

    fn drop_waiters(&mut self, query: &Query, generation: Option<u64>) {
        let matches = self
            .waiters
            .get(query)
            .is_some_and(|pending| generation.is_none_or(|generation| pending.generation == generation));
        if matches {
            // Dropping the sender wakes every receiver with a closed channel.
            self.waiters.remove(query);
        }
    }
}

enum Step {
    Drive(Ticket),
    Wait(watch::Receiver<Outcome>),
}

/// Shared handle; clones drive the same cache.
pub struct PaginatedListCache<S> {
    source: Arc<S>,
    options: CacheOptions,
    shared: Arc<Mutex<Shared>>,
}

impl<S> Clone for PaginatedListCache<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            options: self.options,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: PageSource> PaginatedListCache<S> {
    pub fn new(source: S) -> Self {
        Self::with_options(source, CacheOptions::default())
    }

    pub fn with_options(source: S, options: CacheOptions) -> Self {
        Self {
            source: Arc::new(source),
            options,
            shared: Arc::new(Mutex::new(Shared {
                cache: ListCache::new(options.limit),
                waiters: HashMap::new(),
            })),
        }
    }

    pub fn options(&self) -> CacheOptions {
        self.options
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub async fn load(&self, query: &Query) -> Result<ListSnapshot, Error> {
        self.run(query, |cache| cache.load(query)).await
    }

    pub async fn load_more(&self, query: &Query) -> Result<ListSnapshot, Error> {
        self.run(query, |cache| cache.load_more(query)).await
    }

    pub async fn refresh(&self, query: &Query) -> Result<ListSnapshot, Error> {
        let options = RefreshOptions {
            clear_on_refresh: self.options.clear_on_refresh,
        };
        self.refresh_with(query, options).await
    }

    pub async fn refresh_with(
        &self,
        query: &Query,
        options: RefreshOptions,
    ) -> Result<ListSnapshot, Error> {
        self.run(query, |cache| cache.refresh(query, options)).await
    }

    /// Load the first page and keep topping up until the leading record's period is complete.
    pub async fn load_period(
        &self,
        query: &Query,
        period: Arc<dyn PeriodOf>,
    ) -> Result<ListSnapshot, Error> {
        self.run(query, |cache| cache.load_period(query, period)).await
    }

    pub fn cancel(&self, query: &Query) -> bool {
        let Ok(mut shared) = self.lock() else {
            return false;
        };
        let cancelled = shared.cache.cancel(query);
        if cancelled {
            shared.drop_waiters(query, None);
        }
        cancelled
    }

    pub fn evict(&self, query: &Query) -> bool {
        let Ok(mut shared) = self.lock() else {
            return false;
        };
        shared.drop_waiters(query, None);
        shared.cache.evict(query)
    }

    pub fn snapshot(&self, query: &Query) -> Option<ListSnapshot> {
        self.lock().ok()?.cache.snapshot(query)
    }

    async fn run(
        &self,
        query: &Query,
        op: impl FnOnce(&mut ListCache) -> Dispatch,
    ) -> Result<ListSnapshot, Error> {
        let step = {
            let mut shared = self.lock()?;
            match op(&mut shared.cache) {
                Dispatch::Ready(snapshot) => return Ok(snapshot),
                Dispatch::Attach(generation) => {
                    let rx = shared
                        .waiters
                        .get(query)
                        .filter(|pending| pending.generation == generation)
                        .map(|pending| pending.tx.subscribe())
                        .ok_or_else(|| {
                            Error::new(ErrorKind::Internal)
                                .with_message("in-flight fetch has no waiter slot")
                        })?;
                    debug!(query = %query, generation, "attached to in-flight fetch");
                    Step::Wait(rx)
                }
                Dispatch::Issue(ticket) => {
                    let (tx, _) = watch::channel(None);
                    // Replacing a superseded slot closes its channel.
                    shared.waiters.insert(
                        query.clone(),
                        Pending {
                            generation: ticket.generation(),
                            tx,
                        },
                    );
                    Step::Drive(ticket)
                }
            }
        };
        match step {
            Step::Drive(ticket) => self.drive(ticket).await,
            Step::Wait(rx) => wait(rx).await,
        }
    }

    async fn drive(&self, ticket: Ticket) -> Result<ListSnapshot, Error> {
        let mut guard = AbandonGuard {
            shared: Arc::clone(&self.shared),
            ticket: Some(ticket.clone()),
        };
        let mut ticket = ticket;
        loop {
            let result = self.fetch(&ticket).await;
            let applied = {
                let mut shared = self.lock()?;
                let applied = shared.cache.complete(&ticket, result);
                match &applied {
                    Applied::Settled(snapshot) => shared.finish(&ticket, Ok(snapshot.clone())),
                    Applied::Failed(err, _) => shared.finish(&ticket, Err(err.clone())),
                    Applied::Next(_) | Applied::Stale => {}
                }
                applied
            };
            match applied {
                Applied::Next(next) => {
                    guard.ticket = Some(next.clone());
                    ticket = next;
                }
                Applied::Settled(snapshot) => {
                    guard.ticket = None;
                    return Ok(snapshot);
                }
                Applied::Failed(err, _) => {
                    guard.ticket = None;
                    return Err(err);
                }
                Applied::Stale => {
                    guard.ticket = None;
                    return Err(cancelled(ticket.query()));
                }
            }
        }
    }

    async fn fetch(&self, ticket: &Ticket) -> Result<Page, Error> {
        let pending = self
            .source
            .fetch_page(ticket.query(), ticket.bounds(), ticket.limit());
        match self.options.fetch_timeout {
            None => pending.await,
            Some(limit) => match tokio::time::timeout(limit, pending).await {
                Ok(result) => result,
                Err(_) => Err(Error::new(ErrorKind::StoreUnavailable)
                    .with_message(format!("page fetch timed out after {}ms", limit.as_millis()))),
            },
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Shared>, Error> {
        self.shared
            .lock()
            .map_err(|_| Error::new(ErrorKind::Internal).with_message("list cache lock poisoned"))
    }
}

async fn wait(mut rx: watch::Receiver<Outcome>) -> Result<ListSnapshot, Error> {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => match outcome.as_ref() {
            Some(result) => result.clone(),
            None => Err(Error::new(ErrorKind::Internal).with_message("empty fetch outcome")),
        },
        Err(_) => Err(Error::new(ErrorKind::Cancelled).with_message("fetch was superseded or cancelled")),
    }
}

fn cancelled(query: &Query) -> Error {
    Error::new(ErrorKind::Cancelled).with_message(format!("fetch for {query} was superseded or cancelled"))
}

/// Abandons the ticket if the driving future is dropped before the fetch settles.
struct AbandonGuard {
    shared: Arc<Mutex<Shared>>,
    ticket: Option<Ticket>,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        let Ok(mut shared) = self.shared.lock() else {
            return;
        };
        if shared.cache.abandon(&ticket) {
            warn!(query = %ticket.query(), generation = ticket.generation(), "fetch abandoned");
        }
        shared.drop_waiters(ticket.query(), Some(ticket.generation()));
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheOptions, PaginatedListCache};
    use crate::api::cache::Phase;
    use crate::api::source::{LocalSource, PageSource};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::fetcher::{Page, PageFetcher, PaginationState};
    use crate::core::period::Period;
    use crate::core::query::{Query, RangeBounds};
    use crate::core::store::{MemoryStore, Record, Schema};
    use crate::core::value::FieldType;
    use serde_json::json;
    use std::future::Future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct SlowSource {
        fetcher: PageFetcher,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl PageSource for SlowSource {
        fn fetch_page(
            &self,
            query: &Query,
            bounds: &RangeBounds,
            limit: u32,
        ) -> impl Future<Output = Result<Page, Error>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = self.fetcher.fetch(query, bounds, limit);
            let delay = self.delay;
            async move {
                tokio::time::sleep(delay).await;
                result
            }
        }
    }

    fn numbered_store(count: i64) -> Arc<MemoryStore> {
        let store = MemoryStore::new(Schema::new().with_field("n", FieldType::Integer));
        store
            .insert_many((1..=count).map(|n| {
                let data = json!({ "n": n });
                Record::new(format!("r{n}"), data.as_object().cloned().unwrap_or_default())
            }))
            .expect("insert");
        Arc::new(store)
    }

    fn slow_cache(delay_ms: u64, options: CacheOptions) -> PaginatedListCache<SlowSource> {
        PaginatedListCache::with_options(
            SlowSource {
                fetcher: PageFetcher::new(numbered_store(10)),
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
            },
            options,
        )
    }

    fn small_pages() -> CacheOptions {
        CacheOptions {
            limit: 3,
            ..CacheOptions::default()
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let cache = slow_cache(30, small_pages());
        let query = Query::new("n");
        let (a, b, c) = tokio::join!(cache.load(&query), cache.load(&query), cache.load_more(&query));
        let a = a.expect("driver");
        let b = b.expect("waiter");
        let c = c.expect("waiter");
        assert_eq!(cache.source().calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.ids(), ["r1", "r2", "r3"]);
        assert_eq!(b.ids(), a.ids());
        assert_eq!(c.ids(), a.ids());

        let served = cache.load(&query).await.expect("cached");
        assert_eq!(served.ids(), a.ids());
        assert_eq!(cache.source().calls.load(Ordering::SeqCst), 1);
    }

    /// Holds every load-more page until the test releases it; first pages return at once.
    struct GatedSource {
        fetcher: PageFetcher,
        gate: Arc<Notify>,
    }

    impl PageSource for GatedSource {
        fn fetch_page(
            &self,
            query: &Query,
            bounds: &RangeBounds,
            limit: u32,
        ) -> impl Future<Output = Result<Page, Error>> + Send {
            let result = self.fetcher.fetch(query, bounds, limit);
            let gate = bounds.after.is_some().then(|| Arc::clone(&self.gate));
            async move {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                result
            }
        }
    }

    #[tokio::test]
    async fn refresh_supersedes_an_in_flight_load_more() {
        let gate = Arc::new(Notify::new());
        let cache = PaginatedListCache::with_options(
            GatedSource {
                fetcher: PageFetcher::new(numbered_store(10)),
                gate: Arc::clone(&gate),
            },
            small_pages(),
        );
        let query = Query::new("n");
        cache.load(&query).await.expect("first page");

        let (more, refreshed) = tokio::join!(cache.load_more(&query), async {
            let refreshed = cache.refresh(&query).await;
            gate.notify_one();
            refreshed
        });
        let err = more.expect_err("superseded");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let refreshed = refreshed.expect("refresh");
        assert_eq!(refreshed.ids(), ["r1", "r2", "r3"]);
        assert_eq!(refreshed.phase, Phase::Loaded(PaginationState::Continue));
        let current = cache.snapshot(&query).expect("entry");
        assert_eq!(current.ids(), ["r1", "r2", "r3"]);
    }

    #[tokio::test]
    async fn dropped_driver_cancels_attached_callers() {
        let cache = slow_cache(200, small_pages());
        let query = Query::new("n");

        let driver = {
            let cache = cache.clone();
            let query = query.clone();
            tokio::spawn(async move { cache.load(&query).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let waiter = {
            let cache = cache.clone();
            let query = query.clone();
            tokio::spawn(async move { cache.load(&query).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        driver.abort();

        let err = waiter.await.expect("join").expect_err("cancelled");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let snapshot = cache.snapshot(&query).expect("entry");
        assert_eq!(snapshot.phase, Phase::Idle);
        assert_eq!(cache.source().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn explicit_cancel_restores_the_list() {
        let cache = slow_cache(5, small_pages());
        let query = Query::new("n");
        cache.load(&query).await.expect("first page");

        let (more, cancelled) = tokio::join!(cache.load_more(&query), async {
            tokio::task::yield_now().await;
            cache.cancel(&query)
        });
        assert!(cancelled);
        assert_eq!(more.expect_err("cancelled").kind(), ErrorKind::Cancelled);
        let snapshot = cache.snapshot(&query).expect("entry");
        assert_eq!(snapshot.ids(), ["r1", "r2", "r3"]);
        assert_eq!(snapshot.phase, Phase::Loaded(PaginationState::Continue));
    }

    #[tokio::test]
    async fn timeouts_surface_as_store_unavailable() {
        let cache = slow_cache(
            200,
            CacheOptions {
                fetch_timeout: Some(Duration::from_millis(10)),
                ..small_pages()
            },
        );
        let query = Query::new("n");
        let err = cache.load(&query).await.expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        let snapshot = cache.snapshot(&query).expect("entry");
        assert_eq!(snapshot.phase, Phase::Idle);
        assert_eq!(
            snapshot.error.map(|err| err.kind()),
            Some(ErrorKind::StoreUnavailable)
        );
    }

    #[tokio::test]
    async fn period_loads_drive_top_up_to_completion() {
        let store = MemoryStore::new(Schema::new().with_field("created_at", FieldType::Timestamp));
        store
            .insert_many((1..=40).map(|i| {
                let month = if i <= 25 { 1 } else { 2 };
                let day = if i <= 25 { i } else { i - 25 };
                let data = json!({ "created_at": format!("2024-{month:02}-{day:02}T00:00:00Z") });
                Record::new(format!("e{i}"), data.as_object().cloned().unwrap_or_default())
            }))
            .expect("insert");
        let source = LocalSource::new(Arc::new(PageFetcher::new(Arc::new(store))));
        let cache = PaginatedListCache::with_options(
            source,
            CacheOptions {
                limit: 10,
                ..CacheOptions::default()
            },
        );
        let query = Query::new("created_at");
        let snapshot = cache
            .load_period(&query, Arc::new(Period::Month))
            .await
            .expect("period");
        assert_eq!(snapshot.records.len(), 25);
        assert_eq!(snapshot.last.as_deref(), Some("2024-01-25T00:00:00Z"));
        assert_eq!(snapshot.state, Some(PaginationState::Continue));
    }
}
