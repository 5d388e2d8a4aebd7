//! Control protocol
//!
//! Every operation exchanged between coordinator and members is one variant
//! of `ControlCommand`, wrapped in a `ControlMessage` envelope carrying the
//! sender and the view it was sent in.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TopologyError};
use crate::topology::{
    AvailabilityMode, CacheJoinInfo, CacheStatusResponse, CacheTopology, ManagerStatusResponse,
    NodeId, TopologyId, ViewId,
};

/// Which ownership a topology update changes on the members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyUpdateKind {
    /// Plain topology bump (prunes, joins, cancellations)
    Ch,
    /// Rebalance moved to a phase changing the read ownership
    ReadCh,
    /// Rebalance finished, pending ownership promoted to current
    WriteCh,
}

impl TopologyUpdateKind {
    pub fn name(&self) -> &'static str {
        match self {
            TopologyUpdateKind::Ch => "CH_UPDATE",
            TopologyUpdateKind::ReadCh => "READ_CH_UPDATE",
            TopologyUpdateKind::WriteCh => "WRITE_CH_UPDATE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// member -> coordinator
    Join {
        cache_name: String,
        join_info: CacheJoinInfo,
    },
    /// member -> coordinator, fire-and-forget
    Leave { cache_name: String },
    /// member -> coordinator, fire-and-forget
    RebalanceConfirm {
        cache_name: String,
        topology_id: TopologyId,
        error: Option<String>,
    },
    /// coordinator -> members
    TopologyUpdate {
        cache_name: String,
        kind: TopologyUpdateKind,
        topology: CacheTopology,
        availability_mode: AvailabilityMode,
    },
    /// coordinator -> members
    RebalanceStart {
        cache_name: String,
        topology: CacheTopology,
        availability_mode: AvailabilityMode,
    },
    /// coordinator -> members
    StableTopologyUpdate {
        cache_name: String,
        topology: CacheTopology,
    },
    /// coordinator -> all members
    GetStatus,
    PolicyGetStatus { cache_name: Option<String> },
    PolicyEnable { cache_name: Option<String> },
    PolicyDisable { cache_name: Option<String> },
    /// coordinator -> members, mirrors the cluster-wide rebalancing flag
    RebalancePolicyUpdate { enabled: bool },
    AvailabilityModeChange {
        cache_name: String,
        mode: AvailabilityMode,
    },
    ForceRebalance { cache_name: String },
    /// member -> coordinator
    ShutdownRequest { cache_name: String },
    /// coordinator -> members
    ShutdownPerform {
        cache_name: String,
        topology: Option<CacheTopology>,
    },
    Heartbeat,
}

impl ControlCommand {
    /// Name used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Join { .. } => "JOIN",
            ControlCommand::Leave { .. } => "LEAVE",
            ControlCommand::RebalanceConfirm { .. } => "REBALANCE_CONFIRM",
            ControlCommand::TopologyUpdate { kind, .. } => kind.name(),
            ControlCommand::RebalanceStart { .. } => "REBALANCE_START",
            ControlCommand::StableTopologyUpdate { .. } => "STABLE_TOPOLOGY_UPDATE",
            ControlCommand::GetStatus => "GET_STATUS",
            ControlCommand::PolicyGetStatus { .. } => "POLICY_GET_STATUS",
            ControlCommand::PolicyEnable { .. } => "POLICY_ENABLE",
            ControlCommand::PolicyDisable { .. } => "POLICY_DISABLE",
            ControlCommand::RebalancePolicyUpdate { .. } => "REBALANCE_POLICY_UPDATE",
            ControlCommand::AvailabilityModeChange { .. } => "AVAILABILITY_MODE_CHANGE",
            ControlCommand::ForceRebalance { .. } => "FORCE_REBALANCE",
            ControlCommand::ShutdownRequest { .. } => "SHUTDOWN_REQUEST",
            ControlCommand::ShutdownPerform { .. } => "SHUTDOWN_PERFORM",
            ControlCommand::Heartbeat => "HEARTBEAT",
        }
    }

    pub fn cache_name(&self) -> Option<&str> {
        match self {
            ControlCommand::Join { cache_name, .. }
            | ControlCommand::Leave { cache_name }
            | ControlCommand::RebalanceConfirm { cache_name, .. }
            | ControlCommand::TopologyUpdate { cache_name, .. }
            | ControlCommand::RebalanceStart { cache_name, .. }
            | ControlCommand::StableTopologyUpdate { cache_name, .. }
            | ControlCommand::AvailabilityModeChange { cache_name, .. }
            | ControlCommand::ForceRebalance { cache_name }
            | ControlCommand::ShutdownRequest { cache_name }
            | ControlCommand::ShutdownPerform { cache_name, .. } => Some(cache_name),
            ControlCommand::PolicyGetStatus { cache_name }
            | ControlCommand::PolicyEnable { cache_name }
            | ControlCommand::PolicyDisable { cache_name } => cache_name.as_deref(),
            ControlCommand::GetStatus
            | ControlCommand::RebalancePolicyUpdate { .. }
            | ControlCommand::Heartbeat => None,
        }
    }
}

/// Envelope of every control command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub sender: NodeId,
    pub view_id: ViewId,
    pub command: ControlCommand,
}

impl ControlMessage {
    pub fn new(sender: NodeId, view_id: ViewId, command: ControlCommand) -> Self {
        Self {
            sender,
            view_id,
            command,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlResponse {
    Ack,
    Join(CacheStatusResponse),
    Status(ManagerStatusResponse),
    Bool(bool),
    Error(TopologyError),
}

impl ControlResponse {
    /// Turn a remote error back into a local one
    pub fn into_result(self) -> Result<ControlResponse> {
        match self {
            ControlResponse::Error(e) => Err(e),
            other => Ok(other),
        }
    }

    pub fn into_join(self) -> Result<CacheStatusResponse> {
        match self.into_result()? {
            ControlResponse::Join(status) => Ok(status),
            other => Err(unexpected("JOIN", &other)),
        }
    }

    pub fn into_status(self) -> Result<ManagerStatusResponse> {
        match self.into_result()? {
            ControlResponse::Status(status) => Ok(status),
            other => Err(unexpected("GET_STATUS", &other)),
        }
    }

    pub fn into_bool(self) -> Result<bool> {
        match self.into_result()? {
            ControlResponse::Bool(value) => Ok(value),
            other => Err(unexpected("policy", &other)),
        }
    }
}

fn unexpected(operation: &str, response: &ControlResponse) -> TopologyError {
    TopologyError::Internal(format!(
        "unexpected response to {}: {:?}",
        operation, response
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_metadata() {
        let confirm = ControlCommand::RebalanceConfirm {
            cache_name: "users".to_string(),
            topology_id: 4,
            error: None,
        };
        assert_eq!(confirm.name(), "REBALANCE_CONFIRM");
        assert_eq!(confirm.cache_name(), Some("users"));
        assert_eq!(ControlCommand::GetStatus.cache_name(), None);
        assert_eq!(
            ControlCommand::PolicyEnable { cache_name: None }.name(),
            "POLICY_ENABLE"
        );
    }

    #[test]
    fn test_remote_error_surfaces_locally() {
        let response = ControlResponse::Error(TopologyError::NotCoordinator {
            node: NodeId::from("b"),
        });
        let err = response.into_join().unwrap_err();
        assert!(err.is_retriable());

        let err = ControlResponse::Ack.into_bool().unwrap_err();
        assert!(matches!(err, TopologyError::Internal(_)));
    }

    #[test]
    fn test_envelope_encoding() {
        let message = ControlMessage::new(
            NodeId::from("a"),
            3,
            ControlCommand::Leave {
                cache_name: "users".to_string(),
            },
        );
        let decoded = ControlMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }
}
