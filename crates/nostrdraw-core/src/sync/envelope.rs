//! Action envelope content.

use super::SyncError;
use crate::elements::{CanvasElement, ElementId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of change carried by an action envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

/// Outgoing action content: `{action, element, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionEnvelope<'a> {
    pub action: Action,
    pub element: &'a CanvasElement,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// A decoded inbound action.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteAction {
    Add(CanvasElement),
    Update(CanvasElement),
    /// Deletes need only the element id.
    Delete(ElementId),
}

impl RemoteAction {
    pub fn action(&self) -> Action {
        match self {
            RemoteAction::Add(_) => Action::Add,
            RemoteAction::Update(_) => Action::Update,
            RemoteAction::Delete(_) => Action::Delete,
        }
    }

    pub fn element_id(&self) -> &str {
        match self {
            RemoteAction::Add(element) | RemoteAction::Update(element) => &element.id,
            RemoteAction::Delete(id) => id,
        }
    }
}

#[derive(Deserialize)]
struct RawEnvelope {
    action: Action,
    element: Value,
    #[serde(default)]
    timestamp: i64,
}

/// Decode action content, checking the discriminant and required fields.
///
/// Returns the action and its embedded timestamp.
pub fn decode(content: &str) -> Result<(RemoteAction, i64), SyncError> {
    let raw: RawEnvelope = serde_json::from_str(content).map_err(|e| SyncError::Malformed(e.to_string()))?;
    let action = match raw.action {
        Action::Add => RemoteAction::Add(element_from(raw.element)?),
        Action::Update => RemoteAction::Update(element_from(raw.element)?),
        Action::Delete => {
            let id = raw
                .element
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| SyncError::Malformed("delete without element id".to_string()))?;
            RemoteAction::Delete(id.to_string())
        }
    };
    Ok((action, raw.timestamp))
}

fn element_from(value: Value) -> Result<CanvasElement, SyncError> {
    let element: CanvasElement = serde_json::from_value(value).map_err(|e| SyncError::Malformed(e.to_string()))?;
    if element.id.is_empty() {
        return Err(SyncError::Malformed("element without id".to_string()));
    }
    Ok(element)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let rect = CanvasElement::rectangle(1.0, 2.0, 30.0, 40.0, "ab");
        let json = serde_json::to_value(ActionEnvelope {
            action: Action::Add,
            element: &rect,
            timestamp: 99,
        })
        .unwrap();

        assert_eq!(json["action"], "add");
        assert_eq!(json["timestamp"], 99);
        assert_eq!(json["element"]["type"], "rectangle");
        assert_eq!(json["element"]["id"], rect.id.as_str());
    }

    #[test]
    fn test_decode_update() {
        let rect = CanvasElement::rectangle(1.0, 2.0, 30.0, 40.0, "ab");
        let content = serde_json::to_string(&ActionEnvelope {
            action: Action::Update,
            element: &rect,
            timestamp: 7,
        })
        .unwrap();

        let (action, timestamp) = decode(&content).unwrap();
        assert_eq!(action, RemoteAction::Update(rect));
        assert_eq!(timestamp, 7);
    }

    #[test]
    fn test_decode_delete_needs_only_id() {
        let (action, _) = decode(r#"{"action":"delete","element":{"id":"e1"},"timestamp":1}"#).unwrap();
        assert_eq!(action, RemoteAction::Delete("e1".to_string()));
        assert_eq!(action.element_id(), "e1");
    }

    #[test]
    fn test_decode_fails_closed() {
        for bad in [
            "not json",
            r#"{"action":"move","element":{"id":"e1"},"timestamp":1}"#,
            r#"{"element":{"id":"e1"},"timestamp":1}"#,
            r#"{"action":"add","element":{"id":"e1"},"timestamp":1}"#,
            r#"{"action":"delete","element":{},"timestamp":1}"#,
            r#"{"action":"delete","element":{"id":""},"timestamp":1}"#,
        ] {
            assert!(matches!(decode(bad), Err(SyncError::Malformed(_))), "accepted {}", bad);
        }
    }
}
