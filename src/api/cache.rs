//! Purpose: Per-query pagination state machine for client-side list caches.
//! Exports: `ListCache`, `ListSnapshot`, `Phase`, `Ticket`, `Dispatch`, `Applied`, `RefreshOptions`.
//! Role: Pure, synchronous core; callers run the fetch a `Ticket` describes and hand the
//! result back through `ListCache::complete`.
//! Invariants: At most one fetch per query is in flight; duplicates attach to it.
//! Invariants: A result is applied only if its ticket generation is still current.
//! Invariants: Load-more appends in arrival order; existing ids are never reordered.
//! Invariants: A failed or abandoned fetch restores the pre-fetch phase and data.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::error::Error;
use crate::core::fetcher::{Page, PaginationState};
use crate::core::period::{PeriodKey, PeriodOf};
use crate::core::query::{Query, RangeBounds};
use crate::core::store::Record;

pub const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,
    LoadingFirstPage,
    LoadingMore,
    ToppingUp,
    Loaded(PaginationState),
}

impl Phase {
    pub fn is_fetching(self) -> bool {
        matches!(
            self,
            Phase::LoadingFirstPage | Phase::LoadingMore | Phase::ToppingUp
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchKind {
    FirstPage,
    More,
    TopUp,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RefreshOptions {
    /// Drop the visible records immediately instead of keeping them until the new page lands.
    pub clear_on_refresh: bool,
}

/// One fetch the caller must perform on behalf of the cache.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ticket {
    query: Query,
    generation: u64,
    kind: FetchKind,
    bounds: RangeBounds,
    limit: u32,
}

impl Ticket {
    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn kind(&self) -> FetchKind {
        self.kind
    }

    pub fn bounds(&self) -> &RangeBounds {
        &self.bounds
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[derive(Clone, Debug)]
pub enum Dispatch {
    /// Run this fetch, then call `complete`.
    Issue(Ticket),
    /// A fetch for this query is already in flight under this generation.
    Attach(u64),
    /// Nothing to fetch.
    Ready(ListSnapshot),
}

#[derive(Clone, Debug)]
pub enum Applied {
    /// The ticket was superseded, cancelled, or evicted; nothing changed.
    Stale,
    Settled(ListSnapshot),
    /// Top-up needs another page under the same generation.
    Next(Ticket),
    /// The fetch failed; the entry is back in its pre-fetch state.
    Failed(Error, ListSnapshot),
}

#[derive(Clone, Debug)]
pub struct ListSnapshot {
    pub query: Query,
    pub records: Vec<Record>,
    pub state: Option<PaginationState>,
    pub last: Option<String>,
    pub phase: Phase,
    pub generation: u64,
    pub error: Option<Error>,
}

impl ListSnapshot {
    pub fn ids(&self) -> Vec<&str> {
        self.records.iter().map(|record| record.id.as_str()).collect()
    }

    /// True once the tail is `END` or `LIMITED`.
    pub fn is_complete(&self) -> bool {
        self.state.is_some_and(PaginationState::is_terminal)
    }
}

#[derive(Clone, Debug)]
struct Restore {
    ids: Vec<String>,
    state: Option<PaginationState>,
    last: Option<String>,
    phase: Phase,
}

struct TopUp {
    period: Arc<dyn PeriodOf>,
    anchor: Option<PeriodKey>,
}

struct ListEntry {
    ids: Vec<String>,
    state: Option<PaginationState>,
    last: Option<String>,
    phase: Phase,
    generation: u64,
    in_flight: Option<FetchKind>,
    restore: Option<Restore>,
    top_up: Option<TopUp>,
    error: Option<Error>,
}

impl ListEntry {
    fn new() -> Self {
        Self {
            ids: Vec::new(),
            state: None,
            last: None,
            phase: Phase::Idle,
            generation: 0,
            in_flight: None,
            restore: None,
            top_up: None,
            error: None,
        }
    }

    fn capture(&self) -> Restore {
        Restore {
            ids: self.ids.clone(),
            state: self.state,
            last: self.last.clone(),
            phase: self.phase,
        }
    }

    /// Remember the state to return to if the fetch being started fails. A fetch that
    /// supersedes another keeps the older restore point: the superseded fetch never landed.
    fn arm_restore(&mut self) {
        let captured = self.capture();
        let restore = if self.in_flight.is_some() {
            self.restore.take().unwrap_or(captured)
        } else {
            captured
        };
        self.restore = Some(restore);
    }

    fn rollback(&mut self) {
        if let Some(restore) = self.restore.take() {
            self.ids = restore.ids;
            self.state = restore.state;
            self.last = restore.last;
            self.phase = restore.phase;
        } else if self.phase.is_fetching() {
            self.phase = self.state.map(Phase::Loaded).unwrap_or(Phase::Idle);
        }
        self.in_flight = None;
        self.top_up = None;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Status {
    Missing,
    Idle,
    InFlight {
        generation: u64,
        kind: FetchKind,
        topping_up: bool,
    },
    Loaded(PaginationState),
}

/// Client-side list cache keyed by `Query`, sharing one record-by-id map across lists.
pub struct ListCache {
    limit: u32,
    next_generation: u64,
    entries: HashMap<Query, ListEntry>,
    records: HashMap<String, Record>,
}

impl ListCache {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: if limit == 0 { DEFAULT_PAGE_SIZE } else { limit },
            next_generation: 0,
            entries: HashMap::new(),
            records: HashMap::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn snapshot(&self, query: &Query) -> Option<ListSnapshot> {
        self.entries
            .get(query)
            .map(|entry| snapshot_of(query, entry, &self.records))
    }

    /// First page if the query has none yet; otherwise serve or attach.
    pub fn load(&mut self, query: &Query) -> Dispatch {
        match self.status(query) {
            Status::Missing | Status::Idle => self.issue_first_page(query, None, RefreshOptions::default()),
            Status::InFlight { generation, .. } => Dispatch::Attach(generation),
            Status::Loaded(_) => self.ready(query),
        }
    }

    pub fn load_more(&mut self, query: &Query) -> Dispatch {
        match self.status(query) {
            Status::Missing | Status::Idle => self.issue_first_page(query, None, RefreshOptions::default()),
            Status::InFlight { generation, .. } => Dispatch::Attach(generation),
            Status::Loaded(PaginationState::Continue) => self.issue_more(query),
            Status::Loaded(_) => self.ready(query),
        }
    }

    /// Re-read from the top. A refresh supersedes an in-flight load-more or top-up; a
    /// refresh arriving during a first-page fetch attaches to it.
    pub fn refresh(&mut self, query: &Query, options: RefreshOptions) -> Dispatch {
        match self.status(query) {
            Status::InFlight {
                generation,
                kind: FetchKind::FirstPage,
                ..
            } => Dispatch::Attach(generation),
            _ => self.issue_first_page(query, None, options),
        }
    }

    /// Fresh first page, then keep loading while pages stay inside the leading record's period.
    pub fn load_period(&mut self, query: &Query, period: Arc<dyn PeriodOf>) -> Dispatch {
        match self.status(query) {
            Status::InFlight {
                generation,
                topping_up: true,
                ..
            } => Dispatch::Attach(generation),
            _ => self.issue_first_page(query, Some(period), RefreshOptions::default()),
        }
    }

    /// Abandon whatever is in flight for the query. Returns false when nothing was.
    pub fn cancel(&mut self, query: &Query) -> bool {
        let generation = self.bump();
        let Some(entry) = self.entries.get_mut(query) else {
            return false;
        };
        if entry.in_flight.is_none() {
            return false;
        }
        entry.rollback();
        entry.generation = generation;
        debug!(query = %query, generation, "cancelled in-flight fetch");
        true
    }

    /// Cancel only if `ticket` is still the current fetch for its query.
    pub fn abandon(&mut self, ticket: &Ticket) -> bool {
        let current = self
            .entries
            .get(&ticket.query)
            .is_some_and(|entry| entry.generation == ticket.generation && entry.in_flight.is_some());
        current && self.cancel(&ticket.query)
    }

    pub fn evict(&mut self, query: &Query) -> bool {
        let removed = self.entries.remove(query).is_some();
        if removed {
            self.collect_garbage();
        }
        removed
    }

    pub fn complete(&mut self, ticket: &Ticket, result: Result<Page, Error>) -> Applied {
        let ListCache {
            entries, records, ..
        } = self;
        let Some(entry) = entries.get_mut(&ticket.query) else {
            warn!(query = %ticket.query, generation = ticket.generation, "discarding page for evicted query");
            return Applied::Stale;
        };
        if entry.generation != ticket.generation || entry.in_flight.is_none() {
            warn!(
                query = %ticket.query,
                generation = ticket.generation,
                current = entry.generation,
                "discarding stale page"
            );
            return Applied::Stale;
        }

        let page = match result {
            Ok(page) => page,
            Err(err) => {
                entry.rollback();
                entry.error = Some(err.clone());
                warn!(query = %ticket.query, kind = ?err.kind(), "fetch failed; restored previous state");
                return Applied::Failed(err, snapshot_of(&ticket.query, entry, records));
            }
        };

        let applied = apply_page(ticket, entry, records, page);
        if ticket.kind == FetchKind::FirstPage && matches!(applied, Applied::Settled(_) | Applied::Next(_)) {
            self.collect_garbage();
        }
        match applied {
            // Re-read after collection so the snapshot reflects the final map.
            Applied::Settled(_) => match self.snapshot(&ticket.query) {
                Some(snapshot) => Applied::Settled(snapshot),
                None => Applied::Stale,
            },
            other => other,
        }
    }

    fn status(&self, query: &Query) -> Status {
        match self.entries.get(query) {
            None => Status::Missing,
            Some(entry) => match (entry.in_flight, entry.phase) {
                (Some(kind), _) => Status::InFlight {
                    generation: entry.generation,
                    kind,
                    topping_up: entry.top_up.is_some(),
                },
                (None, Phase::Loaded(state)) => Status::Loaded(state),
                (None, _) => Status::Idle,
            },
        }
    }

    fn ready(&self, query: &Query) -> Dispatch {
        match self.snapshot(query) {
            Some(snapshot) => Dispatch::Ready(snapshot),
            None => Dispatch::Attach(0),
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn issue_first_page(
        &mut self,
        query: &Query,
        period: Option<Arc<dyn PeriodOf>>,
        options: RefreshOptions,
    ) -> Dispatch {
        let generation = self.bump();
        let limit = self.limit;
        let entry = self
            .entries
            .entry(query.clone())
            .or_insert_with(ListEntry::new);
        entry.arm_restore();
        if options.clear_on_refresh {
            entry.ids.clear();
        }
        entry.phase = Phase::LoadingFirstPage;
        entry.in_flight = Some(FetchKind::FirstPage);
        entry.generation = generation;
        entry.error = None;
        entry.top_up = period.map(|period| TopUp {
            period,
            anchor: None,
        });
        debug!(query = %query, generation, "issuing first page");
        Dispatch::Issue(Ticket {
            query: query.clone(),
            generation,
            kind: FetchKind::FirstPage,
            bounds: RangeBounds::none(),
            limit,
        })
    }

    fn issue_more(&mut self, query: &Query) -> Dispatch {
        let generation = self.bump();
        let limit = self.limit;
        let Some(entry) = self.entries.get_mut(query) else {
            return self.issue_first_page(query, None, RefreshOptions::default());
        };
        entry.arm_restore();
        entry.phase = Phase::LoadingMore;
        entry.in_flight = Some(FetchKind::More);
        entry.generation = generation;
        entry.error = None;
        debug!(query = %query, generation, last = ?entry.last, "issuing load-more");
        Dispatch::Issue(Ticket {
            query: query.clone(),
            generation,
            kind: FetchKind::More,
            bounds: RangeBounds {
                after: entry.last.clone(),
                before: None,
            },
            limit,
        })
    }

    fn collect_garbage(&mut self) {
        let live = self
            .entries
            .values()
            .flat_map(|entry| {
                let restored = entry.restore.iter().flat_map(|restore| restore.ids.iter());
                entry.ids.iter().chain(restored)
            })
            .cloned()
            .collect::<HashSet<_>>();
        self.records.retain(|id, _| live.contains(id));
    }
}

/// Merge one page into an entry whose ticket is known to be current.
fn apply_page(
    ticket: &Ticket,
    entry: &mut ListEntry,
    records: &mut HashMap<String, Record>,
    mut page: Page,
) -> Applied {
    let sort = ticket.query.sort().as_str();
    let mut state = page.state;
    let mut last = page.last.take();
    let mut follow = false;

    if let Some(top_up) = entry.top_up.as_mut() {
        if ticket.kind == FetchKind::FirstPage {
            top_up.anchor = page
                .records
                .first()
                .and_then(|record| record.sort_value(sort))
                .and_then(|value| top_up.period.period_of(&value));
        }
        if let Some(anchor) = top_up.anchor.clone() {
            let crossing = page.records.iter().position(|record| {
                record
                    .sort_value(sort)
                    .and_then(|value| top_up.period.period_of(&value))
                    .as_ref()
                    != Some(&anchor)
            });
            match crossing {
                Some(cut) => {
                    // Keep only the anchor period; the rest is re-read by the next load-more.
                    page.records.truncate(cut);
                    state = PaginationState::Continue;
                    last = page
                        .records
                        .last()
                        .and_then(|record| record.sort_value(sort))
                        .or_else(|| ticket.bounds.after.clone());
                }
                None => {
                    follow = state == PaginationState::Continue && !page.records.is_empty();
                }
            }
        }
    }

    let ids = page
        .records
        .iter()
        .map(|record| record.id.clone())
        .collect::<Vec<_>>();
    for record in page.records {
        records.insert(record.id.clone(), record);
    }
    match ticket.kind {
        FetchKind::FirstPage => entry.ids = ids,
        FetchKind::More | FetchKind::TopUp => entry.ids.extend(ids),
    }
    entry.last = last.or_else(|| ticket.bounds.after.clone());
    entry.state = Some(state);
    entry.error = None;

    if follow {
        entry.phase = Phase::Loaded(state);
        entry.restore = Some(entry.capture());
        entry.phase = Phase::ToppingUp;
        entry.in_flight = Some(FetchKind::TopUp);
        debug!(query = %ticket.query, generation = ticket.generation, last = ?entry.last, "topping up");
        return Applied::Next(Ticket {
            query: ticket.query.clone(),
            generation: ticket.generation,
            kind: FetchKind::TopUp,
            bounds: RangeBounds {
                after: entry.last.clone(),
                before: None,
            },
            limit: ticket.limit,
        });
    }

    entry.phase = Phase::Loaded(state);
    entry.in_flight = None;
    entry.restore = None;
    entry.top_up = None;
    debug!(
        query = %ticket.query,
        generation = ticket.generation,
        state = state.as_str(),
        count = entry.ids.len(),
        "list settled"
    );
    Applied::Settled(snapshot_of(&ticket.query, entry, records))
}

fn snapshot_of(query: &Query, entry: &ListEntry, records: &HashMap<String, Record>) -> ListSnapshot {
    ListSnapshot {
        query: query.clone(),
        records: entry
            .ids
            .iter()
            .filter_map(|id| records.get(id).cloned())
            .collect(),
        state: entry.state,
        last: entry.last.clone(),
        phase: entry.phase,
        generation: entry.generation,
        error: entry.error.clone(),
    }
}
