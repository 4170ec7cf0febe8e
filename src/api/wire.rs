//! Purpose: Define the JSON wire contract shared by the server and remote clients.
//! Exports: `ListRequest`, `ListResponse`, `Pagination`, `ErrorEnvelope`, collection envelopes.
//! Role: Single source of truth for field names; both ends serialize through these types.
//! Invariants: Request fields are `limit`, `order`, `order_desc`, `before`, `after`, plus
//! flattened string-valued domain filters.
//! Invariants: `pagination.last` is omitted only when the page is empty and no prior bound exists.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::fetcher::{Page, PaginationState};
use crate::core::query::{Direction, Query, RangeBounds};
use crate::core::store::Record;
use crate::core::value::FieldType;

/// Request keys that can never be used as filter names.
pub const RESERVED_FIELDS: [&str; 6] = ["limit", "order", "order_desc", "before", "after", "state_at"];

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub limit: u32,
    pub order: String,
    #[serde(default)]
    pub order_desc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_at: Option<u64>,
    #[serde(flatten)]
    pub filters: BTreeMap<String, String>,
}

impl ListRequest {
    pub fn new(query: &Query, bounds: &RangeBounds, limit: u32) -> Self {
        Self {
            limit,
            order: query.sort().as_str().to_string(),
            order_desc: query.direction().is_desc(),
            before: bounds.before.clone(),
            after: bounds.after.clone(),
            state_at: query.state_at(),
            filters: query.filters().clone(),
        }
    }

    pub fn query(&self) -> Query {
        let mut query = Query::new(self.order.clone())
            .with_direction(Direction::from_desc(self.order_desc));
        for (field, value) in &self.filters {
            query = query.with_filter(field.clone(), value.clone());
        }
        if let Some(state_at) = self.state_at {
            query = query.at_state(state_at);
        }
        query
    }

    pub fn bounds(&self) -> RangeBounds {
        RangeBounds {
            after: self.after.clone(),
            before: self.before.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
    pub state: PaginationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_at: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    pub records: Vec<Record>,
    pub pagination: Pagination,
}

impl From<Page> for ListResponse {
    fn from(page: Page) -> Self {
        Self {
            records: page.records,
            pagination: Pagination {
                state: page.state,
                last: page.last,
                state_at: page.state_at,
            },
        }
    }
}

impl From<ListResponse> for Page {
    fn from(response: ListResponse) -> Self {
        Self {
            records: response.records,
            state: response.pagination.state,
            last: response.pagination.last,
            state_at: response.pagination.state_at,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub fields: BTreeMap<String, FieldType>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_limit: Option<u32>,
    pub max_limit: u32,
    #[serde(default)]
    pub records: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionsEnvelope {
    pub collections: Vec<CollectionInfo>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub records: Vec<Record>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AppendReceipt {
    pub inserted: usize,
    pub state_at: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound: Option<String>,
}

impl ErrorEnvelope {
    pub fn from_error(err: &Error) -> Self {
        Self {
            error: ErrorBody {
                kind: err.kind().as_str().to_string(),
                message: err.message().unwrap_or("error").to_string(),
                hint: err.hint().map(str::to_string),
                collection: err.collection().map(str::to_string),
                bound: err.bound().map(str::to_string),
            },
        }
    }

    pub fn into_error(self) -> Error {
        let body = self.error;
        let kind = ErrorKind::parse(&body.kind).unwrap_or(ErrorKind::Internal);
        let mut err = Error::new(kind).with_message(body.message);
        if let Some(hint) = body.hint {
            err = err.with_hint(hint);
        }
        if let Some(collection) = body.collection {
            err = err.with_collection(collection);
        }
        if let Some(bound) = body.bound {
            err = err.with_bound(bound);
        }
        err
    }
}
