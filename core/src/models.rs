use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use strum::{Display, EnumString, VariantNames};
use uuid::Uuid;

/// Lifecycle of a delivery task.
///
/// `Succeeded` and `Failed` are absorbing: once a task reaches one of them,
/// the worker never touches it again.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, VariantNames,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Retrying,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Result of a single outbound POST, as recorded in the attempt log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, VariantNames,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    FailedAttempt,
    PermanentlyFailed,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub target_url: String,
    pub secret: Option<String>,
    pub event_type_filter: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The subset of a subscription that the hot paths (ingestion and delivery)
/// need; this is what gets serialized into the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedSubscription {
    pub target_url: String,
    pub secret: Option<String>,
    pub event_type_filter: Option<String>,
}

impl From<&Subscription> for CachedSubscription {
    fn from(subscription: &Subscription) -> Self {
        Self {
            target_url: subscription.target_url.to_owned(),
            secret: subscription.secret.to_owned(),
            event_type_filter: subscription.event_type_filter.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryTask {
    pub delivery_task_id: Uuid,
    pub subscription_id: Uuid,
    pub payload: Value,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub attempts_count: i32,
    pub last_http_status: Option<i32>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryAttempt {
    pub delivery_attempt_id: Uuid,
    pub delivery_task_id: Uuid,
    pub attempt_number: i32,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub http_status: Option<i32>,
    pub error_details: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn task_status_round_trips_through_text() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Retrying,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::from_str(&status.to_string()).unwrap(), status);
        }
    }

    #[test]
    fn only_succeeded_and_failed_are_terminal() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
    }

    #[test]
    fn attempt_outcome_uses_snake_case_everywhere() {
        assert_eq!(AttemptOutcome::FailedAttempt.to_string(), "failed_attempt");
        assert_eq!(
            serde_json::to_value(AttemptOutcome::PermanentlyFailed).unwrap(),
            serde_json::json!("permanently_failed")
        );
    }
}
