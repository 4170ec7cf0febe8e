// Ordered record store: the range-scan collaborator behind the page fetcher,
// plus an in-memory implementation backed by one ordered index per sort field.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::{Error, ErrorKind};
use crate::core::query::{Direction, Query};
use crate::core::value::{FieldType, SortKey};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Raw sort value as it travels on the wire (strings verbatim, numbers in decimal).
    pub fn sort_value(&self, field: &str) -> Option<String> {
        match self.data.get(field)? {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    }

    fn matches_filter(&self, field: &str, expected: &str) -> bool {
        match self.data.get(field) {
            Some(Value::String(text)) => text == expected,
            Some(Value::Number(number)) => number.to_string() == expected,
            Some(Value::Bool(flag)) => flag.to_string() == expected,
            _ => false,
        }
    }
}

/// Declared sort fields (with their comparable types) and allowed equality filters.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Schema {
    fields: BTreeMap<String, FieldType>,
    filters: BTreeSet<String>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(name.into(), field_type);
        self
    }

    pub fn with_filter(mut self, name: impl Into<String>) -> Self {
        self.filters.insert(name.into());
        self
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields.get(name).copied()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldType)> {
        self.fields.iter().map(|(name, ty)| (name.as_str(), *ty))
    }

    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(String::as_str)
    }

    pub fn allows_filter(&self, name: &str) -> bool {
        self.filters.contains(name)
    }

    /// Resolve the query's sort type, rejecting fields and filters the store cannot serve.
    pub fn validate_query(&self, query: &Query) -> Result<FieldType, Error> {
        let sort = query.sort().as_str();
        let field_type = self.field_type(sort).ok_or_else(|| {
            Error::new(ErrorKind::InvalidQuery)
                .with_message(format!("unsupported sort field `{sort}`"))
                .with_hint(format!("Sortable fields: {}.", join(self.fields.keys())))
        })?;
        for field in query.filters().keys() {
            if !self.allows_filter(field) {
                return Err(Error::new(ErrorKind::InvalidQuery)
                    .with_message(format!("unsupported filter field `{field}`"))
                    .with_hint(format!("Filterable fields: {}.", join(self.filters.iter()))));
            }
        }
        Ok(field_type)
    }
}

fn join<'a>(names: impl Iterator<Item = &'a String>) -> String {
    let names = names.map(String::as_str).collect::<Vec<_>>();
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

/// Where a scan resumes. Both forms are exclusive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScanFrom {
    Start,
    /// Strictly past every record carrying this sort key.
    PastKey(SortKey),
    /// Strictly past one record; used to continue a scan without losing equal keys.
    PastRecord(SortKey, String),
}

#[derive(Clone, Debug)]
pub struct RangeScan<'a> {
    pub query: &'a Query,
    /// Key-space scan direction; may be the reverse of the query's own direction.
    pub order: Direction,
    pub from: ScanFrom,
    /// Exclusive stop key in scan order.
    pub until: Option<SortKey>,
    pub state_at: Option<u64>,
    pub limit: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Scanned {
    pub key: SortKey,
    pub record: Record,
}

pub trait OrderedStore: Send + Sync {
    fn schema(&self) -> &Schema;

    /// Sequence of the latest committed write.
    fn commit_seq(&self) -> Result<u64, Error>;

    /// At most `scan.limit` records matching the query's filters, in scan order.
    fn scan(&self, scan: &RangeScan<'_>) -> Result<Vec<Scanned>, Error>;
}

#[derive(Debug)]
pub struct MemoryStore {
    schema: Schema,
    inner: RwLock<MemoryInner>,
}

/// Index entry: sort key, record id, then the commit that wrote that version.
type IndexEntry = (SortKey, String, u64);

#[derive(Debug, Default)]
struct MemoryInner {
    /// Every version of each id, oldest first; only the last one is live.
    records: HashMap<String, Vec<Version>>,
    indexes: BTreeMap<String, BTreeSet<IndexEntry>>,
    commit_seq: u64,
}

#[derive(Debug)]
struct Version {
    record: Record,
    committed: u64,
    superseded: Option<u64>,
}

impl Version {
    /// Live now, or live at the pinned sequence: `committed <= N < superseded`.
    fn visible_at(&self, state_at: Option<u64>) -> bool {
        match state_at {
            None => self.superseded.is_none(),
            Some(state_at) => {
                self.committed <= state_at && self.superseded.is_none_or(|seq| seq > state_at)
            }
        }
    }
}

impl MemoryStore {
    pub fn new(schema: Schema) -> Self {
        let indexes = schema
            .fields()
            .map(|(name, _)| (name.to_string(), BTreeSet::new()))
            .collect();
        Self {
            schema,
            inner: RwLock::new(MemoryInner {
                indexes,
                ..MemoryInner::default()
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.records.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace one record; returns its commit sequence. A replaced version stays
    /// readable by queries pinned before the replacement.
    pub fn insert(&self, record: Record) -> Result<u64, Error> {
        self.insert_many(std::iter::once(record))
    }

    /// Validate every record first, then commit them in order. Returns the last sequence.
    pub fn insert_many(&self, records: impl IntoIterator<Item = Record>) -> Result<u64, Error> {
        let mut prepared = Vec::new();
        for record in records {
            let keys = self.index_keys(&record)?;
            prepared.push((record, keys));
        }

        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        for (record, keys) in prepared {
            inner.commit_seq += 1;
            let committed = inner.commit_seq;
            for (field, key) in keys {
                if let Some(index) = inner.indexes.get_mut(&field) {
                    index.insert((key, record.id.clone(), committed));
                }
            }
            let versions = inner.records.entry(record.id.clone()).or_default();
            if let Some(previous) = versions.last_mut() {
                previous.superseded = Some(committed);
            }
            versions.push(Version {
                record,
                committed,
                superseded: None,
            });
        }
        Ok(inner.commit_seq)
    }

    fn index_keys(&self, record: &Record) -> Result<BTreeMap<String, SortKey>, Error> {
        if record.id.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("record id must not be empty"));
        }
        let mut keys = BTreeMap::new();
        for (field, field_type) in self.schema.fields() {
            let Some(value) = record.data.get(field) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let key = field_type.extract(value).ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!(
                        "record `{}` field `{field}` is not a valid {}",
                        record.id,
                        field_type.as_str()
                    ))
            })?;
            keys.insert(field.to_string(), key);
        }
        Ok(keys)
    }
}

impl MemoryInner {
    fn version(&self, id: &str, committed: u64) -> Option<&Version> {
        self.records
            .get(id)?
            .iter()
            .find(|version| version.committed == committed)
    }
}

impl OrderedStore for MemoryStore {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn commit_seq(&self) -> Result<u64, Error> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.commit_seq)
    }

    fn scan(&self, scan: &RangeScan<'_>) -> Result<Vec<Scanned>, Error> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let field = scan.query.sort().as_str();
        let Some(index) = inner.indexes.get(field) else {
            return Err(Error::new(ErrorKind::InvalidQuery)
                .with_message(format!("unsupported sort field `{field}`")));
        };

        let entries: Box<dyn Iterator<Item = &IndexEntry> + '_> = match (&scan.order, &scan.from) {
            (Direction::Ascending, ScanFrom::Start) => Box::new(index.iter()),
            (Direction::Ascending, ScanFrom::PastKey(key)) => {
                let key = key.clone();
                Box::new(
                    index
                        .range((key.clone(), String::new(), 0)..)
                        .skip_while(move |(entry, _, _)| *entry == key),
                )
            }
            (Direction::Ascending, ScanFrom::PastRecord(key, id)) => Box::new(index.range((
                Bound::Excluded((key.clone(), id.clone(), u64::MAX)),
                Bound::Unbounded,
            ))),
            (Direction::Descending, ScanFrom::Start) => Box::new(index.iter().rev()),
            (Direction::Descending, ScanFrom::PastKey(key)) => {
                Box::new(index.range(..(key.clone(), String::new(), 0)).rev())
            }
            (Direction::Descending, ScanFrom::PastRecord(key, id)) => {
                Box::new(index.range(..(key.clone(), id.clone(), 0)).rev())
            }
        };

        let mut out = Vec::new();
        for (key, id, committed) in entries {
            if out.len() >= scan.limit {
                break;
            }
            if let Some(until) = &scan.until {
                let reached = match scan.order {
                    Direction::Ascending => key >= until,
                    Direction::Descending => key <= until,
                };
                if reached {
                    break;
                }
            }
            let Some(stored) = inner.version(id, *committed) else {
                continue;
            };
            if !stored.visible_at(scan.state_at) {
                continue;
            }
            let matches = scan
                .query
                .filters()
                .iter()
                .all(|(field, expected)| stored.record.matches_filter(field, expected));
            if !matches {
                continue;
            }
            out.push(Scanned {
                key: key.clone(),
                record: stored.record.clone(),
            });
        }
        Ok(out)
    }
}

fn poisoned() -> Error {
    Error::new(ErrorKind::StoreUnavailable).with_message("memory store lock poisoned")
}
