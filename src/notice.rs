// Non-fatal CLI notices, written to stderr as one JSON line: {"notice": {...}}.
use serde::Serialize;
use serde_json::{Value, json};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// The list ended at the access window; older records exist but are withheld.
    Limited,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NoticeDetails {
    Limited {
        returned: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        last: Option<String>,
    },
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub time: String,
    pub cmd: String,
    pub collection: String,
    pub message: String,
    pub details: NoticeDetails,
}

impl Notice {
    /// A browse ended `LIMITED` after `returned` records; `last` is the committed bound.
    pub fn limited(
        cmd: impl Into<String>,
        collection: impl Into<String>,
        returned: usize,
        last: Option<String>,
        time: String,
    ) -> Self {
        Self {
            kind: NoticeKind::Limited,
            time,
            cmd: cmd.into(),
            collection: collection.into(),
            message: "list ends at the access window; older records are withheld".to_string(),
            details: NoticeDetails::Limited { returned, last },
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "notice": self })
    }

    /// Single-line form for terminals.
    pub fn to_text(&self) -> String {
        match &self.details {
            NoticeDetails::Limited { returned, .. } => format!(
                "notice: {} (collection: {}, returned: {returned})",
                self.message, self.collection
            ),
        }
    }
}
