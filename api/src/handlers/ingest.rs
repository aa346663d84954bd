use actix_web::web::{Bytes, Data, Path};
use actix_web::{HttpMessage, HttpRequest, HttpResponse};
use log::debug;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use hookline_core::models::CachedSubscription;
use hookline_core::signature;

use crate::problems::ApiProblem;

#[derive(Debug, Serialize)]
struct IngestAccepted {
    message: &'static str,
    task_id: Uuid,
}

#[derive(Debug, Serialize)]
struct IngestSkipped {
    message: String,
}

/// Ingest an event addressed to a subscription and queue it for delivery.
///
/// The signature, when the subscription carries a secret, is verified against
/// the raw request body bytes, before any JSON round-trip.
pub async fn ingest(
    state: Data<crate::State>,
    subscription_id: Path<Uuid>,
    req: HttpRequest,
    body: Bytes,
) -> Result<HttpResponse, ApiProblem> {
    let subscription_id = subscription_id.into_inner();

    if req.content_type() != "application/json" {
        return Err(ApiProblem::BodyNotJson);
    }
    let payload =
        serde_json::from_slice::<Value>(&body).map_err(|_| ApiProblem::BodyNotJson)?;

    let subscription = resolve_subscription(&state, &subscription_id).await?;

    if let Some(secret) = subscription.secret.as_deref().filter(|s| !s.is_empty()) {
        let header = req
            .headers()
            .get(state.signature_header.as_str())
            .ok_or(ApiProblem::SignatureHeaderMissing)?
            .to_str()
            .map_err(|_| ApiProblem::SignatureHeaderMalformed)?;
        signature::verify(secret, &body, header)?;
        debug!("Subscription {subscription_id}: signature verified successfully");
    }

    if let Some(filter) = subscription
        .event_type_filter
        .as_deref()
        .filter(|f| !f.is_empty())
    {
        let event_type = req
            .headers()
            .get(state.event_type_header.as_str())
            .and_then(|v| v.to_str().ok());
        if let Some(message) = filter_verdict(filter, &state.event_type_header, event_type) {
            debug!("Subscription {subscription_id}: {message}");
            return Ok(HttpResponse::Accepted().json(IngestSkipped { message }));
        }
    }

    let task_id = state.store.create_task(&subscription_id, &payload).await?;
    debug!("Subscription {subscription_id}: delivery task {task_id} created and queued");

    Ok(HttpResponse::Accepted().json(IngestAccepted {
        message: "Webhook received and queued",
        task_id,
    }))
}

/// Look the subscription up through the cache, falling back to (and
/// repopulating from) the database on a miss.
async fn resolve_subscription(
    state: &Data<crate::State>,
    subscription_id: &Uuid,
) -> Result<CachedSubscription, ApiProblem> {
    if let Some(entry) = state.cache.get(subscription_id).await {
        return Ok(entry);
    }

    let subscription = state
        .store
        .get_subscription(subscription_id)
        .await?
        .ok_or(ApiProblem::NotFound)?;

    let entry = CachedSubscription::from(&subscription);
    state.cache.put(subscription_id, &entry).await;
    Ok(entry)
}

/// Decide whether an event passes the subscription's event-type filter.
/// Returns the skip message when delivery must not be queued.
fn filter_verdict(
    filter: &str,
    header_name: &str,
    event_type: Option<&str>,
) -> Option<String> {
    match event_type {
        Some(event_type) if event_type == filter => None,
        Some(event_type) => Some(format!(
            "Event type '{event_type}' filtered, delivery skipped"
        )),
        None => Some(format!(
            "Subscription has an event type filter, but no '{header_name}' header was provided. Delivery skipped"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_event_type_passes_the_filter() {
        assert_eq!(
            filter_verdict("order.created", "X-Event-Type", Some("order.created")),
            None
        );
    }

    #[test]
    fn mismatching_event_type_is_skipped() {
        let verdict = filter_verdict("order.created", "X-Event-Type", Some("order.updated"));
        assert_eq!(
            verdict.as_deref(),
            Some("Event type 'order.updated' filtered, delivery skipped")
        );
    }

    #[test]
    fn missing_event_type_header_is_skipped() {
        let verdict = filter_verdict("order.created", "X-Event-Type", None);
        assert!(verdict.unwrap().contains("no 'X-Event-Type' header"));
    }
}
