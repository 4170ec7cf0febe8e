//! Purpose: Load and validate the JSON catalog of collections a server hosts.
//! Exports: `Catalog`, `Collection`, `CatalogFile`, `CollectionSpec`, `RetentionSpec`.
//! Role: Turns configuration into ready-to-serve `PageFetcher`s over in-memory stores.
//! Invariants: Validation failures are `Usage` errors carrying a hint; nothing is served
//! from a catalog that failed validation.
//! Invariants: Seed files resolve relative to the catalog file's directory.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;

use crate::api::wire::{AppendReceipt, CollectionInfo, RESERVED_FIELDS};
use crate::core::error::{Error, ErrorKind};
use crate::core::fetcher::{DEFAULT_MAX_LIMIT, FetcherOptions, MAX_LIMIT_CEILING, PageFetcher};
use crate::core::store::{MemoryStore, OrderedStore, Record, Schema};
use crate::core::value::FieldType;
use crate::core::window::RetentionWindow;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogFile {
    pub collections: Vec<CollectionSpec>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectionSpec {
    pub name: String,
    pub fields: BTreeMap<String, FieldType>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub default_limit: Option<u32>,
    #[serde(default)]
    pub max_limit: Option<u32>,
    #[serde(default)]
    pub retention: Option<RetentionSpec>,
    /// JSONL seed file, one `{"id", "data"}` record per line.
    #[serde(default)]
    pub records: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionSpec {
    pub field: String,
    #[serde(default)]
    pub max_age_secs: Option<u64>,
    #[serde(default)]
    pub not_before: Option<String>,
}

pub struct Collection {
    name: String,
    store: Arc<MemoryStore>,
    fetcher: Arc<PageFetcher>,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn fetcher(&self) -> &Arc<PageFetcher> {
        &self.fetcher
    }

    pub fn info(&self) -> CollectionInfo {
        let schema = self.store.schema();
        let options = self.fetcher.options();
        CollectionInfo {
            name: self.name.clone(),
            fields: schema
                .fields()
                .map(|(name, field_type)| (name.to_string(), field_type))
                .collect(),
            filters: schema.filters().map(str::to_string).collect(),
            default_limit: options.default_limit,
            max_limit: options.max_limit,
            records: self.store.len(),
        }
    }

    pub fn append(&self, records: Vec<Record>) -> Result<AppendReceipt, Error> {
        let inserted = records.len();
        let state_at = self
            .store
            .insert_many(records)
            .map_err(|err| err.with_collection(self.name.clone()))?;
        Ok(AppendReceipt { inserted, state_at })
    }
}

pub struct Catalog {
    collections: BTreeMap<String, Collection>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to read catalog {}", path.display()))
                .with_source(err)
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json_str(&text, base_dir)
    }

    pub fn from_json_str(text: &str, base_dir: &Path) -> Result<Self, Error> {
        let file: CatalogFile = serde_json::from_str(text).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid catalog json: {err}"))
                .with_hint("Expected {\"collections\":[{\"name\",\"fields\",...}]}.")
        })?;
        Self::from_file(file, base_dir)
    }

    pub fn from_file(file: CatalogFile, base_dir: &Path) -> Result<Self, Error> {
        if file.collections.is_empty() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("catalog declares no collections")
                .with_hint("Add at least one entry under \"collections\"."));
        }
        let mut collections = BTreeMap::new();
        for spec in file.collections {
            let collection = build_collection(spec, base_dir)?;
            if collections.contains_key(collection.name()) {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("duplicate collection `{}`", collection.name()))
                    .with_collection(collection.name().to_string()));
            }
            info!(
                collection = collection.name(),
                records = collection.store().len(),
                "collection ready"
            );
            collections.insert(collection.name().to_string(), collection);
        }
        Ok(Self { collections })
    }

    pub fn get(&self, name: &str) -> Result<&Collection, Error> {
        self.collections.get(name).ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message("unknown collection")
                .with_collection(name.to_string())
        })
    }

    pub fn collections(&self) -> impl Iterator<Item = &Collection> {
        self.collections.values()
    }

    pub fn info(&self) -> Vec<CollectionInfo> {
        self.collections().map(Collection::info).collect()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

fn build_collection(spec: CollectionSpec, base_dir: &Path) -> Result<Collection, Error> {
    let name = spec.name;
    let usage = |message: String| {
        Error::new(ErrorKind::Usage)
            .with_message(message)
            .with_collection(name.clone())
    };

    if name.is_empty() || name.contains('/') {
        return Err(usage("collection name must be non-empty without `/`".to_string()));
    }
    if spec.fields.is_empty() {
        return Err(usage("collection declares no sortable fields".to_string())
            .with_hint("Declare at least one field, e.g. {\"created_at\":\"timestamp\"}."));
    }
    for field in spec.fields.keys().chain(spec.filters.iter()) {
        if RESERVED_FIELDS.contains(&field.as_str()) {
            return Err(usage(format!("`{field}` is a reserved request key"))
                .with_hint(format!("Reserved keys: {}.", RESERVED_FIELDS.join(", "))));
        }
    }

    let max_limit = spec.max_limit.unwrap_or(DEFAULT_MAX_LIMIT);
    if max_limit == 0 || max_limit > MAX_LIMIT_CEILING {
        return Err(usage(format!(
            "max_limit must be between 1 and {MAX_LIMIT_CEILING}"
        )));
    }
    let mut options = FetcherOptions::new().with_max_limit(max_limit);
    if let Some(default_limit) = spec.default_limit {
        if default_limit == 0 || default_limit > max_limit {
            return Err(usage(format!(
                "default_limit must be between 1 and max_limit ({max_limit})"
            )));
        }
        options = options.with_default_limit(default_limit);
    }

    let mut schema = Schema::new();
    for (field, field_type) in &spec.fields {
        schema = schema.with_field(field.clone(), *field_type);
    }
    for filter in &spec.filters {
        schema = schema.with_filter(filter.clone());
    }

    let store = Arc::new(MemoryStore::new(schema));
    if let Some(path) = &spec.records {
        let path = base_dir.join(path);
        let records = read_seed(&path).map_err(|err| err.with_collection(name.clone()))?;
        store
            .insert_many(records)
            .map_err(|err| err.with_collection(name.clone()))?;
    }

    let mut fetcher = PageFetcher::new(store.clone()).with_options(options);
    if let Some(retention) = &spec.retention {
        let window = retention_window(retention, &spec.fields).map_err(|err| err.with_collection(name.clone()))?;
        fetcher = fetcher.with_window(Arc::new(window));
    }

    Ok(Collection {
        name,
        store,
        fetcher: Arc::new(fetcher),
    })
}

fn retention_window(
    spec: &RetentionSpec,
    fields: &BTreeMap<String, FieldType>,
) -> Result<RetentionWindow, Error> {
    if fields.get(&spec.field) != Some(&FieldType::Timestamp) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("retention field `{}` is not a declared timestamp", spec.field)));
    }
    match (spec.max_age_secs, spec.not_before.as_deref()) {
        (Some(secs), None) => Ok(RetentionWindow::max_age(
            spec.field.clone(),
            Duration::from_secs(secs),
        )),
        (None, Some(raw)) => {
            let cutoff = OffsetDateTime::parse(raw, &Rfc3339).map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("retention not_before `{raw}` is not RFC 3339"))
                    .with_source(err)
            })?;
            Ok(RetentionWindow::not_before(spec.field.clone(), cutoff))
        }
        _ => Err(Error::new(ErrorKind::Usage)
            .with_message("retention needs exactly one of max_age_secs or not_before")),
    }
}

/// Parse a JSONL seed file. Blank lines are skipped.
pub fn read_seed(path: &Path) -> Result<Vec<Record>, Error> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message(format!("failed to read records file {}", path.display()))
            .with_source(err)
    })?;
    parse_records(&text).map_err(|err| err.with_hint(format!("In {}.", path.display())))
}

pub fn parse_records(text: &str) -> Result<Vec<Record>, Error> {
    let mut records = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(line).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("line {}: invalid record: {err}", index + 1))
        })?;
        records.push(record);
    }
    Ok(records)
}
