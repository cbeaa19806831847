//! Queue-name grammar and the message payload envelope
//!
//! Callers enqueue onto `__wkf_workflow_<id>` or `__wkf_step_<id>`; the id
//! portion is opaque. Each caller prefix maps to one stable job-queue name
//! (`{job_prefix}flows` / `{job_prefix}steps`) that the workers poll, and
//! the worker reconstructs the caller-side name before dispatching.

use serde::{Deserialize, Serialize};

use world_core::{Result, WorldError};

/// Caller-side prefix for workflow dispatch queues
pub const WORKFLOW_QUEUE_PREFIX: &str = "__wkf_workflow_";
/// Caller-side prefix for step dispatch queues
pub const STEP_QUEUE_PREFIX: &str = "__wkf_step_";

/// The two job queues backing the caller-side name space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Workflow,
    Step,
}

impl QueueKind {
    pub const ALL: [QueueKind; 2] = [QueueKind::Workflow, QueueKind::Step];

    /// The caller-side prefix this queue serves
    pub fn caller_prefix(&self) -> &'static str {
        match self {
            Self::Workflow => WORKFLOW_QUEUE_PREFIX,
            Self::Step => STEP_QUEUE_PREFIX,
        }
    }

    /// The stable job-queue name stored on job rows
    pub fn job_queue_name(&self, job_prefix: &str) -> String {
        match self {
            Self::Workflow => format!("{job_prefix}flows"),
            Self::Step => format!("{job_prefix}steps"),
        }
    }
}

/// A caller-side queue name split into its prefix and opaque id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQueueName {
    pub kind: QueueKind,
    pub queue_id: String,
}

/// Parse a caller-side queue name; anything outside the two known
/// prefixes is a validation error
pub fn parse_queue_name(name: &str) -> Result<ParsedQueueName> {
    if let Some(id) = name.strip_prefix(WORKFLOW_QUEUE_PREFIX) {
        return Ok(ParsedQueueName {
            kind: QueueKind::Workflow,
            queue_id: id.to_string(),
        });
    }
    if let Some(id) = name.strip_prefix(STEP_QUEUE_PREFIX) {
        return Ok(ParsedQueueName {
            kind: QueueKind::Step,
            queue_id: id.to_string(),
        });
    }
    Err(WorldError::InvalidQueueName(name.to_string()))
}

/// Envelope serialized into the job row's payload column.
///
/// Field names are part of the wire format shared with the engine, hence
/// the camelCase rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    /// Opaque id portion of the caller-side queue name
    pub id: String,
    /// The serialized caller message
    pub data: serde_json::Value,
    /// Delivery attempt, starting at 1
    pub attempt: u32,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_workflow_queue_name() {
        let parsed = parse_queue_name("__wkf_workflow_abc").unwrap();
        assert_eq!(parsed.kind, QueueKind::Workflow);
        assert_eq!(parsed.queue_id, "abc");
    }

    #[test]
    fn test_parse_step_queue_name() {
        let parsed = parse_queue_name("__wkf_step_xyz-1").unwrap();
        assert_eq!(parsed.kind, QueueKind::Step);
        assert_eq!(parsed.queue_id, "xyz-1");
    }

    #[test]
    fn test_parse_rejects_unknown_prefix() {
        let err = parse_queue_name("jobs_abc").unwrap_err();
        assert!(matches!(err, WorldError::InvalidQueueName(_)));
    }

    #[test]
    fn test_job_queue_names() {
        assert_eq!(QueueKind::Workflow.job_queue_name("workflow_"), "workflow_flows");
        assert_eq!(QueueKind::Step.job_queue_name("workflow_"), "workflow_steps");
    }

    #[test]
    fn test_roundtrip_caller_name() {
        let parsed = parse_queue_name("__wkf_workflow_w1").unwrap();
        let rebuilt = format!("{}{}", parsed.kind.caller_prefix(), parsed.queue_id);
        assert_eq!(rebuilt, "__wkf_workflow_w1");
    }

    #[test]
    fn test_message_data_wire_format() {
        let message = MessageData {
            id: "w1".into(),
            data: json!({"x": 1}),
            attempt: 1,
            message_id: "msg_01ABC".into(),
            idempotency_key: Some("K".into()),
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["messageId"], "msg_01ABC");
        assert_eq!(value["idempotencyKey"], "K");
        assert_eq!(value["attempt"], 1);

        let back: MessageData = serde_json::from_value(value).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_message_data_omits_absent_idempotency_key() {
        let message = MessageData {
            id: "w1".into(),
            data: json!([]),
            attempt: 1,
            message_id: "msg_01ABC".into(),
            idempotency_key: None,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("idempotencyKey").is_none());
    }
}
