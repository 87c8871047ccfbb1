// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Verification intent carried by a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueAction {
    #[serde(rename = "flavor-verify")]
    FlavorVerify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyParams {
    pub host_id: Uuid,
    pub fetch_host_data: bool,
    pub prefer_hash_match: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueState {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl QueueState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueueState::New | QueueState::Pending)
    }
}

/// Persistent unit of verification work processed by the manager's workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub action: QueueAction,
    pub params: VerifyParams,
    pub state: QueueState,
    /// Failure reason for ERROR and TIMEOUT entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl QueueEntry {
    pub fn flavor_verify(host_id: Uuid, fetch_host_data: bool, prefer_hash_match: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            action: QueueAction::FlavorVerify,
            params: VerifyParams {
                host_id,
                fetch_host_data,
                prefer_hash_match,
            },
            state: QueueState::New,
            message: None,
            created: now,
            updated: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!QueueState::New.is_terminal());
        assert!(!QueueState::Pending.is_terminal());
        for state in [
            QueueState::Completed,
            QueueState::Error,
            QueueState::Timeout,
            QueueState::Cancelled,
        ] {
            assert!(state.is_terminal());
        }
    }

    #[test]
    fn test_wire_shape() {
        let entry = QueueEntry::flavor_verify(Uuid::new_v4(), true, false);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""action":"flavor-verify""#));
        assert!(json.contains(r#""state":"NEW""#));
        let back: QueueEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, QueueState::New);
        assert!(back.params.fetch_host_data);
    }
}
