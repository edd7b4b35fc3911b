//! Reclassifies raw agent output chunks into a small typed event vocabulary.
//!
//! The remote execution service emits a loose mix of full message snapshots,
//! partial deltas, internal coordination payloads, and free text. Consumers
//! only ever see [`StreamEvent`]s: durable messages, ephemeral status lines,
//! internal metadata (never rendered as chat), errors, and raw passthrough.

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

pub mod heuristics;

use heuristics::PlanClassification;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Message {
        content: String,
    },
    Status {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        ephemeral: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_remove_ms: Option<u64>,
    },
    Metadata {
        kind: MetadataKind,
        data: Value,
        timestamp: i64,
    },
    Error {
        message: String,
    },
    Raw {
        text: String,
    },
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKind {
    PlannerRecommendation,
    AgentRoutingDecision,
    SupervisorDecision,
    WorkflowContext,
    AgentTransition,
}

/// One raw chunk from the gateway stream or an equivalent source.
#[derive(Debug, Clone)]
pub enum RawChunk {
    Text(String),
    Binary(Vec<u8>),
    Json(Value),
}

/// Keyword lists and thresholds are deployment tuning, not contract.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub status_max_chars: usize,
    pub status_keywords: Vec<String>,
    pub default_auto_remove_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            status_max_chars: 200,
            status_keywords: [
                "thinking",
                "processing",
                "searching",
                "completed",
                "analyzing",
                "routing",
                "retrieving",
                "loading",
                "working",
                "waiting",
            ]
            .iter()
            .map(|keyword| keyword.to_string())
            .collect(),
            default_auto_remove_ms: 5_000,
        }
    }
}

/// Stateful only in the last-seen workflow-context value; everything else is
/// a pure function of the chunk.
#[derive(Debug, Default)]
pub struct Reclassifier {
    config: ClassifierConfig,
    last_workflow_context: Option<String>,
}

impl Reclassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            last_workflow_context: None,
        }
    }

    /// Produce zero or more events for one raw chunk, in source order.
    /// Never fails; malformed input degrades to [`StreamEvent::Raw`].
    pub fn reclassify(&mut self, chunk: RawChunk) -> Vec<StreamEvent> {
        match chunk {
            RawChunk::Json(value) => self.classify_value(value),
            RawChunk::Text(text) => self.classify_text(&text),
            RawChunk::Binary(bytes) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                self.classify_text(&text)
            }
        }
    }

    fn classify_value(&mut self, value: Value) -> Vec<StreamEvent> {
        // Rule 1: an explicit event discriminator passes through unchanged.
        if value
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| KNOWN_DISCRIMINATORS.contains(&t))
        {
            if let Ok(event) = serde_json::from_value::<StreamEvent>(value.clone()) {
                return vec![event];
            }
        }

        // Rule 2: plan-like coordination payloads become metadata, never text.
        if heuristics::is_plan_like(&value) {
            return self.plan_events(&value);
        }

        // Rule 3: extract every plausible human-readable text.
        let extracted = heuristics::extract_texts(&value);
        if !extracted.is_empty() {
            let ephemeral_marker = heuristics::ephemeral_marker(&value);
            return extracted
                .into_iter()
                .map(|(agent, text)| self.text_event(text, agent, ephemeral_marker))
                .collect();
        }

        // Rule 3 fallback: a `"content":"..."` fragment inside serialized JSON.
        let serialized = value.to_string();
        if let Some(fragment) = heuristics::content_fragment(&serialized) {
            return vec![self.text_event(fragment, None, None)];
        }

        // Rule 5: unparseable, non-plan-like input is surfaced raw.
        vec![StreamEvent::Raw { text: serialized }]
    }

    fn classify_text(&mut self, text: &str) -> Vec<StreamEvent> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            if value.is_object() || value.is_array() {
                return self.classify_value(value);
            }
        }

        // Plan-like JSON embedded inside free text must still be filtered out.
        if let Some(embedded) = heuristics::extract_embedded_json(trimmed) {
            if heuristics::is_plan_like(&embedded) {
                return self.plan_events(&embedded);
            }
        }

        vec![self.text_event(trimmed.to_string(), None, None)]
    }

    fn plan_events(&mut self, value: &Value) -> Vec<StreamEvent> {
        match heuristics::plan_classification(value) {
            Some(PlanClassification::WorkflowContext(context)) => {
                if self.last_workflow_context.as_deref() == Some(context.as_str()) {
                    // Unchanged context is noise; suppress it.
                    return Vec::new();
                }
                self.last_workflow_context = Some(context);
                vec![self.metadata_event(MetadataKind::WorkflowContext, value.clone())]
            }
            Some(PlanClassification::Kind(kind)) => {
                vec![self.metadata_event(kind, value.clone())]
            }
            None => Vec::new(),
        }
    }

    fn metadata_event(&self, kind: MetadataKind, data: Value) -> StreamEvent {
        StreamEvent::Metadata {
            kind,
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    fn text_event(
        &self,
        text: String,
        agent: Option<String>,
        ephemeral_marker: Option<Option<u64>>,
    ) -> StreamEvent {
        let status = ephemeral_marker.is_some()
            || heuristics::is_status_text(&text, &self.config);
        if status {
            let auto_remove_ms = ephemeral_marker
                .flatten()
                .unwrap_or(self.config.default_auto_remove_ms);
            StreamEvent::Status {
                text,
                agent,
                ephemeral: true,
                auto_remove_ms: Some(auto_remove_ms),
            }
        } else {
            StreamEvent::Message { content: text }
        }
    }
}

const KNOWN_DISCRIMINATORS: [&str; 6] = ["message", "status", "metadata", "error", "raw", "done"];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify(value: Value) -> Vec<StreamEvent> {
        Reclassifier::new(ClassifierConfig::default()).reclassify(RawChunk::Json(value))
    }

    #[test]
    fn plan_like_payload_never_becomes_a_message() {
        let events = classify(json!({"action": "delegate", "confidence": 0.9}));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            StreamEvent::Metadata {
                kind: MetadataKind::PlannerRecommendation,
                ..
            }
        ));
    }

    #[test]
    fn short_progress_text_is_status() {
        let mut reclassifier = Reclassifier::new(ClassifierConfig::default());
        let events =
            reclassifier.reclassify(RawChunk::Text("✅ Processing your request".to_string()));
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Status {
                text,
                ephemeral,
                auto_remove_ms,
                ..
            } => {
                assert_eq!(text, "✅ Processing your request");
                assert!(ephemeral);
                assert_eq!(*auto_remove_ms, Some(5_000));
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn long_text_is_a_durable_message() {
        let long = "word ".repeat(60);
        let mut reclassifier = Reclassifier::new(ClassifierConfig::default());
        let events = reclassifier.reclassify(RawChunk::Text(long.clone()));
        assert_eq!(
            events,
            vec![StreamEvent::Message {
                content: long.trim().to_string()
            }]
        );
    }

    #[test]
    fn explicit_discriminator_passes_through() {
        let events = classify(json!({"type": "error", "message": "boom"}));
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                message: "boom".to_string()
            }]
        );
    }

    #[test]
    fn routing_decision_with_target_is_metadata() {
        let events = classify(json!({
            "action": "route",
            "next_agent": "order-agent",
            "confidence": 0.7
        }));
        assert!(matches!(
            events[0],
            StreamEvent::Metadata {
                kind: MetadataKind::AgentRoutingDecision,
                ..
            }
        ));
    }

    #[test]
    fn unchanged_workflow_context_is_suppressed() {
        let mut reclassifier = Reclassifier::new(ClassifierConfig::default());
        let payload = json!({"action": "update", "workflow_context": "checkout"});
        let first = reclassifier.reclassify(RawChunk::Json(payload.clone()));
        assert!(matches!(
            first[0],
            StreamEvent::Metadata {
                kind: MetadataKind::WorkflowContext,
                ..
            }
        ));
        let second = reclassifier.reclassify(RawChunk::Json(payload));
        assert!(second.is_empty());

        let changed = reclassifier.reclassify(RawChunk::Json(
            json!({"action": "update", "workflow_context": "payment"}),
        ));
        assert_eq!(changed.len(), 1);
    }

    #[test]
    fn plan_like_json_embedded_in_free_text_is_filtered() {
        let mut reclassifier = Reclassifier::new(ClassifierConfig::default());
        let events = reclassifier.reclassify(RawChunk::Text(
            "routing update {\"action\":\"delegate\",\"confidence\":0.4} applied".to_string(),
        ));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Metadata { .. }));
    }

    #[test]
    fn nested_message_content_is_extracted() {
        let events = classify(json!({"message": {"content": "Here is your order summary, with every line item and the delivery estimate you asked about, spelled out in full detail so nothing is left ambiguous for the confirmation step ahead."}}));
        assert!(matches!(events[0], StreamEvent::Message { .. }));
    }

    #[test]
    fn per_agent_sub_objects_keep_their_agent_labels() {
        let events = classify(json!({
            "planner": {"content": "thinking about the catalog"},
            "shopper": {"content": "searching inventory"}
        }));
        assert_eq!(events.len(), 2);
        for event in &events {
            match event {
                StreamEvent::Status { agent, .. } => assert!(agent.is_some()),
                other => panic!("expected status, got {other:?}"),
            }
        }
    }

    #[test]
    fn explicit_ephemeral_marker_forces_status() {
        let events = classify(json!({
            "content": "This would normally be far too long and keyword-free to classify as progress text, but the chunk carries an explicit ephemeral marker so it must expire on the client side regardless of length or vocabulary choices.",
            "ephemeral": true,
            "auto_remove_ms": 1500
        }));
        match &events[0] {
            StreamEvent::Status { auto_remove_ms, .. } => {
                assert_eq!(*auto_remove_ms, Some(1_500));
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn garbage_binary_degrades_to_raw_or_message_never_panics() {
        let mut reclassifier = Reclassifier::new(ClassifierConfig::default());
        let events = reclassifier.reclassify(RawChunk::Binary(vec![0xff, 0xfe, 0x00, 0x41]));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn content_fragment_fallback_recovers_text_from_odd_shapes() {
        let events = classify(json!({
            "wrapper": [{"payload": "{\"content\":\"thinking hard\"}"}]
        }));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Status { .. }));
    }

    #[test]
    fn keyword_threshold_is_configuration() {
        let config = ClassifierConfig {
            status_max_chars: 5,
            ..ClassifierConfig::default()
        };
        let mut reclassifier = Reclassifier::new(config);
        // Keyword match but over the configured length cap.
        let events = reclassifier.reclassify(RawChunk::Text("processing".to_string()));
        assert!(matches!(events[0], StreamEvent::Message { .. }));
    }
}
