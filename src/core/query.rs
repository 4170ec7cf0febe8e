// Query identity (the cache key) and the exclusive range bounds that position a page.
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SortField(String);

impl SortField {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

impl Direction {
    pub fn from_desc(desc: bool) -> Self {
        if desc {
            Direction::Descending
        } else {
            Direction::Ascending
        }
    }

    pub fn is_desc(self) -> bool {
        self == Direction::Descending
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

/// Identity of a paginated record set. Limit and bounds are deliberately absent:
/// two requests for different pages of the same list share one `Query`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Query {
    sort: SortField,
    direction: Direction,
    filters: BTreeMap<String, String>,
    state_at: Option<u64>,
}

impl Query {
    pub fn new(sort: impl Into<String>) -> Self {
        Self {
            sort: SortField::new(sort),
            direction: Direction::Ascending,
            filters: BTreeMap::new(),
            state_at: None,
        }
    }

    pub fn descending(self) -> Self {
        self.with_direction(Direction::Descending)
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    /// Pin the query to a store commit sequence (records committed later stay hidden).
    pub fn at_state(mut self, state_at: u64) -> Self {
        self.state_at = Some(state_at);
        self
    }

    pub fn sort(&self) -> &SortField {
        &self.sort
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn filters(&self) -> &BTreeMap<String, String> {
        &self.filters
    }

    pub fn state_at(&self) -> Option<u64> {
        self.state_at
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sort)?;
        if self.direction.is_desc() {
            f.write_str(" desc")?;
        }
        for (field, value) in &self.filters {
            write!(f, " {field}={value}")?;
        }
        if let Some(state_at) = self.state_at {
            write!(f, " @{state_at}")?;
        }
        Ok(())
    }
}

/// Exclusive bounds expressed in the sort field's value domain, in query order:
/// `after` means "later in this query's ordering", whatever the direction.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct RangeBounds {
    pub after: Option<String>,
    pub before: Option<String>,
}

impl RangeBounds {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn after(bound: impl Into<String>) -> Self {
        Self {
            after: Some(bound.into()),
            before: None,
        }
    }

    pub fn before(bound: impl Into<String>) -> Self {
        Self {
            after: None,
            before: Some(bound.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.after.is_none() && self.before.is_none()
    }
}
