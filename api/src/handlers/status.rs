use actix_web::web::{Data, Json, Path};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use hookline_core::models::{AttemptOutcome, DeliveryAttempt, DeliveryTask, TaskStatus};

use crate::problems::ApiProblem;

/// How many attempts the per-subscription listing returns at most
const RECENT_ATTEMPTS_LIMIT: i64 = 20;

#[derive(Debug, Serialize)]
pub struct AttemptInfo {
    pub delivery_attempt_id: Uuid,
    pub delivery_task_id: Uuid,
    pub attempt_number: i32,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub http_status: Option<i32>,
    pub error_details: Option<String>,
}

impl From<DeliveryAttempt> for AttemptInfo {
    fn from(attempt: DeliveryAttempt) -> Self {
        Self {
            delivery_attempt_id: attempt.delivery_attempt_id,
            delivery_task_id: attempt.delivery_task_id,
            attempt_number: attempt.attempt_number,
            timestamp: attempt.timestamp,
            outcome: attempt.outcome,
            http_status: attempt.http_status,
            error_details: attempt.error_details,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeliveryTaskStatus {
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
    pub attempts: Vec<AttemptInfo>,
}

impl DeliveryTaskStatus {
    fn new(task: DeliveryTask, attempts: Vec<DeliveryAttempt>) -> Self {
        Self {
            delivery_task_id: task.delivery_task_id,
            subscription_id: task.subscription_id,
            payload: task.payload,
            status: task.status,
            created_at: task.created_at,
            last_attempt_at: task.last_attempt_at,
            next_attempt_at: task.next_attempt_at,
            attempts_count: task.attempts_count,
            last_http_status: task.last_http_status,
            last_error: task.last_error,
            attempts: attempts.into_iter().map(AttemptInfo::from).collect(),
        }
    }
}

/// Task projection plus its attempt log, ordered by attempt number.
pub async fn delivery_task(
    state: Data<crate::State>,
    task_id: Path<Uuid>,
) -> Result<Json<DeliveryTaskStatus>, ApiProblem> {
    let task_id = task_id.into_inner();

    let task = state
        .store
        .load_task(&task_id)
        .await?
        .ok_or(ApiProblem::NotFound)?;
    let attempts = state.store.attempts_for_task(&task_id).await?;

    Ok(Json(DeliveryTaskStatus::new(task, attempts)))
}

/// Most recent attempts across all tasks of a subscription, newest first.
pub async fn subscription_attempts(
    state: Data<crate::State>,
    subscription_id: Path<Uuid>,
) -> Result<Json<Vec<AttemptInfo>>, ApiProblem> {
    let subscription_id = subscription_id.into_inner();

    if state
        .store
        .get_subscription(&subscription_id)
        .await?
        .is_none()
    {
        return Err(ApiProblem::NotFound);
    }

    let attempts = state
        .store
        .recent_attempts_for_subscription(&subscription_id, RECENT_ATTEMPTS_LIMIT)
        .await?;

    Ok(Json(attempts.into_iter().map(AttemptInfo::from).collect()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn task_status_projection_serializes_attempts_in_order() {
        let task_id = Uuid::new_v4();
        let subscription_id = Uuid::new_v4();
        let now = Utc::now();

        let attempts = (1..=2)
            .map(|n| DeliveryAttempt {
                delivery_attempt_id: Uuid::new_v4(),
                delivery_task_id: task_id,
                attempt_number: n,
                timestamp: now,
                outcome: if n == 1 {
                    AttemptOutcome::FailedAttempt
                } else {
                    AttemptOutcome::Success
                },
                http_status: Some(if n == 1 { 500 } else { 200 }),
                error_details: None,
            })
            .collect::<Vec<_>>();
        let task = DeliveryTask {
            delivery_task_id: task_id,
            subscription_id,
            payload: json!({"event": "x"}),
            status: TaskStatus::Succeeded,
            created_at: now,
            last_attempt_at: Some(now),
            next_attempt_at: None,
            attempts_count: 2,
            last_http_status: Some(200),
            last_error: None,
        };

        let projection = serde_json::to_value(DeliveryTaskStatus::new(task, attempts)).unwrap();
        assert_eq!(projection["status"], json!("succeeded"));
        assert_eq!(projection["attempts_count"], json!(2));
        assert_eq!(projection["attempts"][0]["attempt_number"], json!(1));
        assert_eq!(projection["attempts"][0]["outcome"], json!("failed_attempt"));
        assert_eq!(projection["attempts"][1]["outcome"], json!("success"));
        assert_eq!(projection["next_attempt_at"], json!(null));
    }
}
