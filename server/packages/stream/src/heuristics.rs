//! Pure shape and text predicates used by the reclassifier.
//!
//! These are deliberately standalone functions over normalized input so the
//! fragile keyword/shape matching stays independently testable instead of
//! living inline in the stream loop.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::{ClassifierConfig, MetadataKind};

/// Keys that mark a payload as internal planner/recommendation output even
/// when no `confidence` field is present.
const PLANNER_KEYS: [&str; 8] = [
    "recommendation",
    "next_agent",
    "target_agent",
    "route_to",
    "supervisor",
    "decision",
    "workflow_context",
    "reasoning",
];

const ROUTING_KEYS: [&str; 4] = ["next_agent", "target_agent", "route_to", "next"];

/// Routing targets that mean "stop", not "hand off".
const TERMINAL_TARGETS: [&str; 4] = ["finish", "end", "done", "stop"];

#[derive(Debug, Clone, PartialEq)]
pub enum PlanClassification {
    /// The payload only communicates a workflow-context string; the caller
    /// decides whether it changed since the last one seen.
    WorkflowContext(String),
    Kind(MetadataKind),
}

/// An object with an `action` field plus either a `confidence` field or any
/// known planner key is internal coordination output, never chat content.
pub fn is_plan_like(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    if !object.contains_key("action") {
        return false;
    }
    object.contains_key("confidence") || PLANNER_KEYS.iter().any(|key| object.contains_key(*key))
}

pub fn plan_classification(value: &Value) -> Option<PlanClassification> {
    if !is_plan_like(value) {
        return None;
    }
    let object = value.as_object()?;

    if object.contains_key("from_agent") && object.contains_key("to_agent") {
        return Some(PlanClassification::Kind(MetadataKind::AgentTransition));
    }

    let routing_target = ROUTING_KEYS
        .iter()
        .filter_map(|key| object.get(*key).and_then(Value::as_str))
        .next();
    if let Some(target) = routing_target {
        let terminal = TERMINAL_TARGETS
            .iter()
            .any(|candidate| target.eq_ignore_ascii_case(candidate));
        if !terminal {
            let kind = if object.contains_key("supervisor") || object.contains_key("decision") {
                MetadataKind::SupervisorDecision
            } else {
                MetadataKind::AgentRoutingDecision
            };
            return Some(PlanClassification::Kind(kind));
        }
    }

    if let Some(context) = object.get("workflow_context").and_then(Value::as_str) {
        return Some(PlanClassification::WorkflowContext(context.to_string()));
    }

    Some(PlanClassification::Kind(MetadataKind::PlannerRecommendation))
}

/// Extract every plausible human-readable text from a structured chunk,
/// paired with the owning agent name when one is evident.
pub fn extract_texts(value: &Value) -> Vec<(Option<String>, String)> {
    let mut texts = Vec::new();
    match value {
        Value::Object(object) => {
            if let Some(content) = object.get("content").and_then(Value::as_str) {
                if !content.trim().is_empty() {
                    texts.push((None, content.trim().to_string()));
                }
                return texts;
            }
            if let Some(content) = object
                .get("message")
                .and_then(|message| message.get("content"))
                .and_then(Value::as_str)
            {
                if !content.trim().is_empty() {
                    texts.push((None, content.trim().to_string()));
                }
                return texts;
            }
            // A map of per-agent sub-objects, each carrying its own content.
            for (agent, entry) in object {
                if let Some(content) = entry.get("content").and_then(Value::as_str) {
                    if !content.trim().is_empty() {
                        texts.push((Some(agent.clone()), content.trim().to_string()));
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                texts.extend(extract_texts(item));
            }
        }
        Value::String(text) => {
            if !text.trim().is_empty() {
                texts.push((None, text.trim().to_string()));
            }
        }
        _ => {}
    }
    texts
}

/// Best-effort recovery of a `"content":"..."` fragment from serialized JSON
/// that did not match any structured shape.
pub fn content_fragment(serialized: &str) -> Option<String> {
    static CONTENT_RE: OnceLock<Regex> = OnceLock::new();
    let re = CONTENT_RE.get_or_init(|| {
        Regex::new(r#""content"\s*:\s*"([^"]*)""#).expect("static content regex")
    });

    // Escaped quotes appear when the fragment lives inside a nested
    // serialized string; normalize them away before matching.
    let normalized = serialized.replace("\\\"", "\"");
    let captured = re.captures(&normalized)?.get(1)?.as_str();
    let unescaped = captured.replace("\\n", "\n").replace("\\\\", "\\");
    let trimmed = unescaped.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Find the first balanced `{...}` object embedded in free text that parses
/// as JSON. String literals and escapes inside the object are respected.
pub fn extract_embedded_json(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (index, &byte) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' if start.is_some() => in_string = true,
            b'{' => {
                if start.is_none() {
                    start = Some(index);
                }
                depth += 1;
            }
            b'}' if start.is_some() => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start.unwrap_or(0)..=index];
                    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                        return Some(value);
                    }
                    start = None;
                }
            }
            _ => {}
        }
    }
    None
}

/// Short, non-empty text containing a progress keyword reads as transient
/// status; everything else is a durable message.
pub fn is_status_text(text: &str, config: &ClassifierConfig) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.chars().count() > config.status_max_chars {
        return false;
    }
    let lowered = trimmed.to_lowercase();
    config
        .status_keywords
        .iter()
        .any(|keyword| lowered.contains(keyword.as_str()))
}

/// An explicit ephemeral marker on the chunk itself. Returns
/// `Some(auto_remove_ms)` when marked, where the inner option is the
/// chunk-supplied expiry override.
pub fn ephemeral_marker(value: &Value) -> Option<Option<u64>> {
    let object = value.as_object()?;
    let marked = object
        .get("ephemeral")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !marked {
        return None;
    }
    let expiry = object
        .get("auto_remove_ms")
        .or_else(|| object.get("autoRemoveMs"))
        .and_then(Value::as_u64);
    Some(expiry)
}
