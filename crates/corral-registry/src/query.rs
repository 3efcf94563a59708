use crate::backend::StoredDocument;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured query over one namespace. All set fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPredicate {
    /// Match the envelope `kind` field exactly.
    #[serde(default)]
    pub kind: Option<String>,
    /// Match the payload's `status` field (string compare).
    #[serde(default)]
    pub status: Option<String>,
    /// Envelope must carry this tag.
    #[serde(default)]
    pub tag: Option<String>,
    /// Payload `health` must be at least this.
    #[serde(default)]
    pub min_health: Option<f64>,
    /// Glob over the payload `name` field; `*` matches any run of characters.
    #[serde(default)]
    pub name_pattern: Option<String>,
    #[serde(default)]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_active_after: Option<DateTime<Utc>>,
}

impl QueryPredicate {
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn min_health(mut self, min: f64) -> Self {
        self.min_health = Some(min);
        self
    }

    pub fn name_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.name_pattern = Some(pattern.into());
        self
    }

    pub fn matches(&self, doc: &StoredDocument) -> bool {
        if let Some(kind) = &self.kind {
            if doc.kind != *kind {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !doc.has_tag(tag) {
                return false;
            }
        }
        if let Some(status) = &self.status {
            match doc.payload.get("status").and_then(|v| v.as_str()) {
                Some(s) if s == status => {}
                _ => return false,
            }
        }
        if let Some(min) = self.min_health {
            match doc.payload.get("health").and_then(|v| v.as_f64()) {
                Some(h) if h >= min => {}
                _ => return false,
            }
        }
        if let Some(pattern) = &self.name_pattern {
            match doc.payload.get("name").and_then(|v| v.as_str()) {
                Some(name) if glob_match(pattern, name) => {}
                _ => return false,
            }
        }
        if let Some(after) = self.created_after {
            match timestamp_field(doc, "created_at") {
                Some(t) if t > after => {}
                _ => return false,
            }
        }
        if let Some(after) = self.last_active_after {
            match timestamp_field(doc, "last_activity_at") {
                Some(t) if t > after => {}
                _ => return false,
            }
        }
        true
    }
}

fn timestamp_field(doc: &StoredDocument, field: &str) -> Option<DateTime<Utc>> {
    doc.payload
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
}

/// Minimal `*`-wildcard matcher. Case-sensitive, no escapes; enough for
/// the name patterns the registry accepts.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with '*'.
    true
}
