//! Subscription filters.

use super::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Selects envelopes by id, author, kind, time window and tag values.
///
/// Tag conditions serialize as `"#<name>": [values…]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    /// Require a tag `name` whose value is one of `values`.
    pub fn tag<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .insert(format!("#{}", name), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check whether an envelope satisfies every condition.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        self.tags.iter().all(|(key, values)| match key.strip_prefix('#') {
            Some(name) => event.tag_values(name).any(|v| values.iter().any(|want| want == v)),
            None => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{UnsignedEvent, kinds};
    use crate::identity::Keys;

    #[test]
    fn test_serializes_tag_keys() {
        let filter = Filter::new()
            .kind(kinds::CANVAS_CHECKPOINT)
            .tag("d", ["c1"])
            .limit(1);
        let json = serde_json::to_value(&filter).unwrap();

        assert_eq!(json["kinds"], serde_json::json!([30078]));
        assert_eq!(json["#d"], serde_json::json!(["c1"]));
        assert_eq!(json["limit"], 1);
        assert!(json.get("authors").is_none());

        let parsed: Filter = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, filter);
    }

    #[test]
    fn test_matches() {
        let keys = Keys::generate();
        let event = UnsignedEvent::new(kinds::CANVAS_ACTION, "{}")
            .tag("canvas", "c1")
            .created_at(100)
            .sign(&keys);

        assert!(Filter::new().matches(&event));
        assert!(Filter::new().kind(kinds::CANVAS_ACTION).tag("canvas", ["c1", "c2"]).matches(&event));
        assert!(!Filter::new().tag("canvas", ["c2"]).matches(&event));
        assert!(!Filter::new().kind(kinds::CURSOR_POSITION).matches(&event));
        assert!(Filter::new().authors([keys.public_key_hex()]).matches(&event));
        assert!(!Filter::new().authors(["someone"]).matches(&event));
        assert!(Filter::new().since(100).until(100).matches(&event));
        assert!(!Filter::new().since(101).matches(&event));
        assert!(!Filter::new().ids(["nope"]).matches(&event));
    }
}
