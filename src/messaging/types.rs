//! Message correlation data model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of catching construct parked on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitingEventKind {
    StartEvent,
    IntermediateCatchEvent,
    BoundaryEvent,
    EventSubProcess,
    ReceiveTask,
}

impl WaitingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitingEventKind::StartEvent => "START_EVENT",
            WaitingEventKind::IntermediateCatchEvent => "INTERMEDIATE_CATCH_EVENT",
            WaitingEventKind::BoundaryEvent => "BOUNDARY_EVENT",
            WaitingEventKind::EventSubProcess => "EVENT_SUB_PROCESS",
            WaitingEventKind::ReceiveTask => "RECEIVE_TASK",
        }
    }
}

impl std::fmt::Display for WaitingEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A catching flow node parked until a correlated message arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingMessageEvent {
    /// Assigned by the store on insert.
    pub id: i64,
    pub kind: WaitingEventKind,
    pub message_name: String,
    /// Name of the process the catching node belongs to.
    pub process_name: String,
    pub flow_node_name: String,
    /// Parked flow node instance. `None` for start events, which create the
    /// instance when fired.
    pub flow_node_instance_id: Option<i64>,
    pub root_process_instance_id: Option<i64>,
    /// Correlation key/value pairs the message must carry.
    pub correlations: BTreeMap<String, String>,
    /// Claimed by a matching pass and waiting for its work to run.
    pub in_progress: bool,
}

impl WaitingMessageEvent {
    pub fn new(
        kind: WaitingEventKind,
        message_name: impl Into<String>,
        process_name: impl Into<String>,
        flow_node_name: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            kind,
            message_name: message_name.into(),
            process_name: process_name.into(),
            flow_node_name: flow_node_name.into(),
            flow_node_instance_id: None,
            root_process_instance_id: None,
            correlations: BTreeMap::new(),
            in_progress: false,
        }
    }

    pub fn with_correlation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.correlations.insert(key.into(), value.into());
        self
    }

    pub fn for_instance(mut self, root_process_instance_id: i64, flow_node_instance_id: i64) -> Self {
        self.root_process_instance_id = Some(root_process_instance_id);
        self.flow_node_instance_id = Some(flow_node_instance_id);
        self
    }
}

/// A message thrown by a send task or end event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInstance {
    /// Assigned by the store on insert.
    pub id: i64,
    pub message_name: String,
    pub target_process: String,
    /// Restricts delivery to one flow node of the target process.
    pub target_flow_node: Option<String>,
    pub correlations: BTreeMap<String, String>,
    /// Message content handed to the catching node.
    pub payload: BTreeMap<String, String>,
    /// Claimed by a matching pass.
    pub handled: bool,
    pub created_at: DateTime<Utc>,
}

impl MessageInstance {
    pub fn new(message_name: impl Into<String>, target_process: impl Into<String>) -> Self {
        Self {
            id: 0,
            message_name: message_name.into(),
            target_process: target_process.into(),
            target_flow_node: None,
            correlations: BTreeMap::new(),
            payload: BTreeMap::new(),
            handled: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_target_flow_node(mut self, flow_node: impl Into<String>) -> Self {
        self.target_flow_node = Some(flow_node.into());
        self
    }

    pub fn with_correlation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.correlations.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Whether this message can fire `waiting`.
    ///
    /// Name, target process and (when set) target flow node must agree, and
    /// every correlation the waiting event expects must be carried with the
    /// same value.
    pub fn correlates_with(&self, waiting: &WaitingMessageEvent) -> bool {
        if self.message_name != waiting.message_name || self.target_process != waiting.process_name
        {
            return false;
        }
        if let Some(target) = &self.target_flow_node {
            if *target != waiting.flow_node_name {
                return false;
            }
        }
        waiting
            .correlations
            .iter()
            .all(|(k, v)| self.correlations.get(k) == Some(v))
    }
}

/// Candidate pairing of one message with one waiting event.
///
/// Produced per matching pass and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageEventCouple {
    pub message_instance_id: i64,
    pub waiting_message_event_kind: WaitingEventKind,
    pub waiting_message_id: i64,
}

impl MessageEventCouple {
    pub fn new(
        message_instance_id: i64,
        waiting_message_event_kind: WaitingEventKind,
        waiting_message_id: i64,
    ) -> Self {
        Self {
            message_instance_id,
            waiting_message_event_kind,
            waiting_message_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiting() -> WaitingMessageEvent {
        WaitingMessageEvent::new(
            WaitingEventKind::ReceiveTask,
            "order-paid",
            "fulfilment",
            "wait-payment",
        )
        .with_correlation("order_id", "42")
    }

    #[test]
    fn test_correlates_on_name_process_and_keys() {
        let msg = MessageInstance::new("order-paid", "fulfilment")
            .with_correlation("order_id", "42")
            .with_correlation("extra", "ignored");
        assert!(msg.correlates_with(&waiting()));
    }

    #[test]
    fn test_correlation_value_mismatch() {
        let msg = MessageInstance::new("order-paid", "fulfilment").with_correlation("order_id", "7");
        assert!(!msg.correlates_with(&waiting()));
    }

    #[test]
    fn test_missing_correlation_key() {
        let msg = MessageInstance::new("order-paid", "fulfilment");
        assert!(!msg.correlates_with(&waiting()));
    }

    #[test]
    fn test_target_flow_node_restricts() {
        let base = MessageInstance::new("order-paid", "fulfilment").with_correlation("order_id", "42");
        assert!(base
            .clone()
            .with_target_flow_node("wait-payment")
            .correlates_with(&waiting()));
        assert!(!base
            .with_target_flow_node("other-node")
            .correlates_with(&waiting()));
    }

    #[test]
    fn test_wrong_process_or_name() {
        let w = waiting();
        let msg = MessageInstance::new("order-paid", "billing").with_correlation("order_id", "42");
        assert!(!msg.correlates_with(&w));
        let msg =
            MessageInstance::new("order-cancelled", "fulfilment").with_correlation("order_id", "42");
        assert!(!msg.correlates_with(&w));
    }

    #[test]
    fn test_kind_serde_names() {
        let yaml = serde_yaml::to_string(&WaitingEventKind::EventSubProcess).unwrap();
        assert_eq!(yaml.trim(), "EVENT_SUB_PROCESS");
        let parsed: WaitingEventKind = serde_yaml::from_str("START_EVENT").unwrap();
        assert_eq!(parsed, WaitingEventKind::StartEvent);
        assert_eq!(WaitingEventKind::ReceiveTask.to_string(), "RECEIVE_TASK");
    }
}
