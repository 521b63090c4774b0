//! Wire message envelope and the closed message-type catalogue.
//!
//! Every IPC exchange is one [`Envelope`]: a UUID id, a [`MessageType`], an
//! RFC3339 timestamp, and an optional undecoded JSON payload. Successive
//! envelopes on a stream are concatenated JSON documents with no length
//! prefix — see [`super::connection`] for the framing contract.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::IpcError;

/// Message type carried in the envelope `type` field.
///
/// The wire strings (`list_agents`, `update_available`, ...) are a stable
/// contract between independently-built CLI and helper binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Requests (helper-bound)
    /// List all known agents.
    ListAgents,
    /// Fetch a single agent by id.
    GetAgent,
    /// Install an agent.
    InstallAgent,
    /// Update an installed agent.
    UpdateAgent,
    /// Uninstall an agent.
    UninstallAgent,
    /// Refresh the agent catalog.
    RefreshCatalog,
    /// Check all installed agents for available updates.
    CheckUpdates,
    /// Query helper status.
    GetStatus,
    /// Ask the helper to shut down.
    Shutdown,

    // Responses (CLI-bound, correlated to a request)
    /// Request completed successfully.
    Success,
    /// Request failed.
    Error,
    /// Intermediate progress report for a long-running request.
    Progress,

    // Notifications (helper-initiated, uncorrelated)
    /// An update is available for an installed agent.
    UpdateAvailable,
    /// An agent was installed.
    AgentInstalled,
    /// An agent was updated.
    AgentUpdated,
    /// An agent was removed.
    AgentRemoved,
}

impl MessageType {
    /// The exact wire string for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ListAgents => "list_agents",
            Self::GetAgent => "get_agent",
            Self::InstallAgent => "install_agent",
            Self::UpdateAgent => "update_agent",
            Self::UninstallAgent => "uninstall_agent",
            Self::RefreshCatalog => "refresh_catalog",
            Self::CheckUpdates => "check_updates",
            Self::GetStatus => "get_status",
            Self::Shutdown => "shutdown",
            Self::Success => "success",
            Self::Error => "error",
            Self::Progress => "progress",
            Self::UpdateAvailable => "update_available",
            Self::AgentInstalled => "agent_installed",
            Self::AgentUpdated => "agent_updated",
            Self::AgentRemoved => "agent_removed",
        }
    }

    /// True for helper-bound request types.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::ListAgents
                | Self::GetAgent
                | Self::InstallAgent
                | Self::UpdateAgent
                | Self::UninstallAgent
                | Self::RefreshCatalog
                | Self::CheckUpdates
                | Self::GetStatus
                | Self::Shutdown
        )
    }

    /// True for CLI-bound response types.
    pub fn is_response(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Progress)
    }

    /// True for helper-initiated notification types.
    pub fn is_notification(self) -> bool {
        matches!(
            self,
            Self::UpdateAvailable | Self::AgentInstalled | Self::AgentUpdated | Self::AgentRemoved
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One framed IPC message.
///
/// The payload stays an undecoded JSON value until [`Envelope::decode_payload`]
/// is called; decoding is side-effect-free and repeatable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message id (UUID v4). Responses echo the id of the request
    /// they answer, which is what the client's demultiplexer keys on.
    pub id: String,
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Creation time, serialized as an RFC3339 string.
    pub timestamp: DateTime<Utc>,
    /// Optional payload, opaque to the transport layers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Envelope {
    /// Create an envelope with no payload.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            timestamp: Utc::now(),
            payload: None,
        }
    }

    /// Create an envelope carrying a serialized payload.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Serialization`] if the payload cannot be encoded
    /// as JSON (e.g. a map with non-string keys).
    pub fn with_payload<T: Serialize>(
        message_type: MessageType,
        payload: &T,
    ) -> Result<Self, IpcError> {
        let value = serde_json::to_value(payload).map_err(IpcError::Serialization)?;
        let mut envelope = Self::new(message_type);
        envelope.payload = Some(value);
        Ok(envelope)
    }

    /// Create an `error`-typed response envelope.
    pub fn error_response(code: &str, message: &str) -> Self {
        let mut envelope = Self::new(MessageType::Error);
        envelope.payload = Some(serde_json::json!({
            "code": code,
            "message": message,
        }));
        envelope
    }

    /// Decode the payload into `T`.
    ///
    /// Returns `Ok(None)` when the envelope carries no payload. Unknown and
    /// missing fields are tolerated (loose interchange); a fatally
    /// incompatible target shape fails with [`IpcError::Decode`].
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<Option<T>, IpcError> {
        match &self.payload {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(IpcError::Decode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::payload::{ErrorResponse, StatusResponse};

    #[test]
    fn test_wire_strings_are_stable() {
        let cases = [
            (MessageType::ListAgents, "list_agents"),
            (MessageType::GetAgent, "get_agent"),
            (MessageType::InstallAgent, "install_agent"),
            (MessageType::UpdateAgent, "update_agent"),
            (MessageType::UninstallAgent, "uninstall_agent"),
            (MessageType::RefreshCatalog, "refresh_catalog"),
            (MessageType::CheckUpdates, "check_updates"),
            (MessageType::GetStatus, "get_status"),
            (MessageType::Shutdown, "shutdown"),
            (MessageType::Success, "success"),
            (MessageType::Error, "error"),
            (MessageType::Progress, "progress"),
            (MessageType::UpdateAvailable, "update_available"),
            (MessageType::AgentInstalled, "agent_installed"),
            (MessageType::AgentUpdated, "agent_updated"),
            (MessageType::AgentRemoved, "agent_removed"),
        ];
        for (message_type, expected) in cases {
            assert_eq!(message_type.as_str(), expected);
            let json = serde_json::to_string(&message_type).unwrap();
            assert_eq!(json, format!("\"{expected}\""));
        }
    }

    #[test]
    fn test_family_partition_is_total() {
        let all = [
            MessageType::ListAgents,
            MessageType::GetAgent,
            MessageType::InstallAgent,
            MessageType::UpdateAgent,
            MessageType::UninstallAgent,
            MessageType::RefreshCatalog,
            MessageType::CheckUpdates,
            MessageType::GetStatus,
            MessageType::Shutdown,
            MessageType::Success,
            MessageType::Error,
            MessageType::Progress,
            MessageType::UpdateAvailable,
            MessageType::AgentInstalled,
            MessageType::AgentUpdated,
            MessageType::AgentRemoved,
        ];
        for message_type in all {
            let families = [
                message_type.is_request(),
                message_type.is_response(),
                message_type.is_notification(),
            ];
            assert_eq!(
                families.iter().filter(|&&f| f).count(),
                1,
                "{message_type} must belong to exactly one family"
            );
        }
    }

    #[test]
    fn test_payload_round_trip() {
        let status = StatusResponse {
            running: true,
            pid: 4242,
            uptime_seconds: 17,
            agent_count: 5,
            updates_available: 1,
            last_catalog_refresh: Some(Utc::now()),
            last_update_check: None,
        };
        let envelope = Envelope::with_payload(MessageType::Success, &status).unwrap();
        let decoded: StatusResponse = envelope.decode_payload().unwrap().unwrap();
        assert_eq!(decoded, status);
    }

    #[test]
    fn test_decode_is_repeatable() {
        let error = ErrorResponse {
            code: "nope".to_string(),
            message: "still nope".to_string(),
            details: None,
        };
        let envelope = Envelope::with_payload(MessageType::Error, &error).unwrap();
        let first: ErrorResponse = envelope.decode_payload().unwrap().unwrap();
        let second: ErrorResponse = envelope.decode_payload().unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_absent_payload_decodes_to_none() {
        let envelope = Envelope::new(MessageType::GetStatus);
        let decoded: Option<StatusResponse> = envelope.decode_payload().unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let mut envelope = Envelope::new(MessageType::Error);
        envelope.payload = Some(serde_json::json!({
            "code": "handler_error",
            "message": "boom",
            "some_future_field": [1, 2, 3],
        }));
        let decoded: ErrorResponse = envelope.decode_payload().unwrap().unwrap();
        assert_eq!(decoded.code, "handler_error");
        assert_eq!(decoded.message, "boom");
    }

    #[test]
    fn test_incompatible_shape_fails_with_decode_error() {
        let mut envelope = Envelope::new(MessageType::Success);
        envelope.payload = Some(serde_json::json!("just a string"));
        let result: Result<Option<StatusResponse>, _> = envelope.decode_payload();
        assert!(matches!(result, Err(IpcError::Decode(_))));
    }

    #[test]
    fn test_unencodable_payload_fails_with_serialization_error() {
        // Maps with non-string keys have no JSON representation.
        let mut bad = std::collections::HashMap::new();
        bad.insert(vec![1u8, 2], "value");
        let result = Envelope::with_payload(MessageType::Success, &bad);
        assert!(matches!(result, Err(IpcError::Serialization(_))));
    }

    #[test]
    fn test_ids_are_unique() {
        let ids: std::collections::HashSet<String> = (0..1000)
            .map(|_| Envelope::new(MessageType::GetStatus).id)
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_timestamp_serializes_as_rfc3339() {
        let envelope = Envelope::new(MessageType::GetStatus);
        let value = serde_json::to_value(&envelope).unwrap();
        let timestamp = value["timestamp"].as_str().expect("timestamp is a string");
        assert!(
            DateTime::parse_from_rfc3339(timestamp).is_ok(),
            "not RFC3339: {timestamp}"
        );
    }

    #[test]
    fn test_envelope_without_payload_omits_field() {
        let envelope = Envelope::new(MessageType::Shutdown);
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("payload").is_none());
        assert_eq!(value["type"], "shutdown");
    }
}
