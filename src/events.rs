//! Governance Events
//!
//! Lock and change request notifications fanned out to cache invalidation and
//! notification collaborators. Publishing never fails the operation that triggered it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Identity of a lock holder as carried in lock events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderIdentity {
    pub user_id: String,
    pub user_name: String,
    pub user_email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GovernanceEvent {
    #[serde(rename = "lock.taken_over")]
    LockTakenOver {
        key: String,
        previous: HolderIdentity,
        current: HolderIdentity,
        at: DateTime<Utc>,
    },
    #[serde(rename = "lock.released")]
    LockReleased {
        key: String,
        user_id: String,
        at: DateTime<Utc>,
    },
    #[serde(rename = "change_request.created")]
    ChangeRequestCreated {
        change_request_id: String,
        environment: String,
        requester_id: String,
    },
    #[serde(rename = "change_request.submitted")]
    ChangeRequestSubmitted {
        change_request_id: String,
        environment: String,
        requester_id: String,
    },
    #[serde(rename = "change_request.approval_recorded")]
    ApprovalRecorded {
        change_request_id: String,
        approver_id: String,
        approvals: u32,
        required: u32,
    },
    #[serde(rename = "change_request.approved")]
    ChangeRequestApproved {
        change_request_id: String,
        environment: String,
    },
    #[serde(rename = "change_request.rejected")]
    ChangeRequestRejected {
        change_request_id: String,
        rejected_by: String,
        reason: String,
    },
    #[serde(rename = "change_request.reopened")]
    ChangeRequestReopened { change_request_id: String },
    #[serde(rename = "change_request.applied")]
    ChangeRequestApplied {
        change_request_id: String,
        environment: String,
        executed_by: String,
    },
    #[serde(rename = "change_request.rolled_back")]
    ChangeRequestRolledBack {
        change_request_id: String,
        environment: String,
        rolled_back_by: String,
    },
    #[serde(rename = "change_request.deleted")]
    ChangeRequestDeleted { change_request_id: String },
}

impl GovernanceEvent {
    /// Wire name of the event, as used in the serialized `type` tag
    pub fn name(&self) -> &'static str {
        match self {
            GovernanceEvent::LockTakenOver { .. } => "lock.taken_over",
            GovernanceEvent::LockReleased { .. } => "lock.released",
            GovernanceEvent::ChangeRequestCreated { .. } => "change_request.created",
            GovernanceEvent::ChangeRequestSubmitted { .. } => "change_request.submitted",
            GovernanceEvent::ApprovalRecorded { .. } => "change_request.approval_recorded",
            GovernanceEvent::ChangeRequestApproved { .. } => "change_request.approved",
            GovernanceEvent::ChangeRequestRejected { .. } => "change_request.rejected",
            GovernanceEvent::ChangeRequestReopened { .. } => "change_request.reopened",
            GovernanceEvent::ChangeRequestApplied { .. } => "change_request.applied",
            GovernanceEvent::ChangeRequestRolledBack { .. } => "change_request.rolled_back",
            GovernanceEvent::ChangeRequestDeleted { .. } => "change_request.deleted",
        }
    }
}

/// In-process fan-out of governance events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GovernanceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Fire and forget
    pub fn publish(&self, event: GovernanceEvent) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => debug!("Published {} to {} subscribers", name, receivers),
            Err(_) => debug!("Published {} with no subscribers", name),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GovernanceEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_tags() {
        let event = GovernanceEvent::LockReleased {
            key: "prod:g_ip_whitelist:42".to_string(),
            user_id: "7".to_string(),
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "lock.released");
        assert_eq!(json["type"], event.name());

        let event = GovernanceEvent::ChangeRequestRolledBack {
            change_request_id: "cr".to_string(),
            environment: "prod".to_string(),
            rolled_back_by: "7".to_string(),
        };
        assert_eq!(serde_json::to_value(&event).unwrap()["type"], "change_request.rolled_back");
    }

    #[test]
    fn test_publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::new(4);
        bus.publish(GovernanceEvent::ChangeRequestDeleted {
            change_request_id: "cr".to_string(),
        });
    }

    #[test]
    fn test_subscriber_receives_event() {
        let bus = EventBus::new(4);
        let mut receiver = bus.subscribe();

        bus.publish(GovernanceEvent::ChangeRequestReopened {
            change_request_id: "cr-1".to_string(),
        });

        let event = tokio_test::block_on(receiver.recv()).unwrap();
        assert_eq!(
            event,
            GovernanceEvent::ChangeRequestReopened {
                change_request_id: "cr-1".to_string()
            }
        );
    }
}
