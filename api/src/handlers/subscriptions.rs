use actix_web::HttpResponse;
use actix_web::web::{Data, Json, Path};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::ops::Deref;
use url::Url;
use uuid::Uuid;
use validator::Validate;

use hookline_core::models::{CachedSubscription, Subscription};

use crate::problems::ApiProblem;

/// Longest accepted target URL, matching the width of the database column
const TARGET_URL_MAX_LENGTH: usize = 255;

#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    pub subscription_id: Uuid,
    pub target_url: String,
    pub secret: Option<String>,
    pub event_type_filter: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Subscription> for SubscriptionInfo {
    fn from(subscription: Subscription) -> Self {
        Self {
            subscription_id: subscription.subscription_id,
            target_url: subscription.target_url,
            secret: subscription.secret,
            event_type_filter: subscription.event_type_filter,
            created_at: subscription.created_at,
            updated_at: subscription.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetUrl(Url);

impl Deref for TargetUrl {
    type Target = Url;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn deserialize_target_url<'de, D>(deserializer: D) -> Result<TargetUrl, D::Error>
where
    D: Deserializer<'de>,
{
    const ALLOWED_SCHEMES: &[&str] = &["http", "https"];
    let url = Url::deserialize(deserializer)?;

    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        Err(serde::de::Error::custom(format!(
            "'{}' URLs are not allowed; use one of the following schemes: {}",
            url.scheme(),
            ALLOWED_SCHEMES.join(", ")
        )))
    } else if !url.has_host() {
        Err(serde::de::Error::custom(
            "URL must contain a host (domain or IP address)",
        ))
    } else if url.as_str().len() > TARGET_URL_MAX_LENGTH {
        Err(serde::de::Error::custom(format!(
            "URL cannot be longer than {TARGET_URL_MAX_LENGTH} characters"
        )))
    } else {
        Ok(TargetUrl(url))
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubscriptionPost {
    #[serde(deserialize_with = "deserialize_target_url")]
    target_url: TargetUrl,
    #[validate(length(max = 255))]
    secret: Option<String>,
    #[validate(length(max = 255))]
    event_type_filter: Option<String>,
}

pub async fn list(state: Data<crate::State>) -> Result<Json<Vec<SubscriptionInfo>>, ApiProblem> {
    let subscriptions = state.store.list_subscriptions().await?;

    Ok(Json(
        subscriptions
            .into_iter()
            .map(SubscriptionInfo::from)
            .collect(),
    ))
}

pub async fn get(
    state: Data<crate::State>,
    subscription_id: Path<Uuid>,
) -> Result<Json<SubscriptionInfo>, ApiProblem> {
    let subscription = state
        .store
        .get_subscription(&subscription_id)
        .await?
        .ok_or(ApiProblem::NotFound)?;

    Ok(Json(SubscriptionInfo::from(subscription)))
}

pub async fn create(
    state: Data<crate::State>,
    body: Json<SubscriptionPost>,
) -> Result<HttpResponse, ApiProblem> {
    if let Err(e) = body.validate() {
        return Err(ApiProblem::Validation(e));
    }

    let subscription = state
        .store
        .create_subscription(
            body.target_url.as_str(),
            body.secret.as_deref(),
            body.event_type_filter.as_deref(),
        )
        .await?;

    // Write-through after the commit so the ingestion hot path starts warm
    state
        .cache
        .put(
            &subscription.subscription_id,
            &CachedSubscription::from(&subscription),
        )
        .await;

    Ok(HttpResponse::Created().json(SubscriptionInfo::from(subscription)))
}

pub async fn edit(
    state: Data<crate::State>,
    subscription_id: Path<Uuid>,
    body: Json<SubscriptionPost>,
) -> Result<Json<SubscriptionInfo>, ApiProblem> {
    if let Err(e) = body.validate() {
        return Err(ApiProblem::Validation(e));
    }

    let subscription = state
        .store
        .update_subscription(
            &subscription_id,
            body.target_url.as_str(),
            body.secret.as_deref(),
            body.event_type_filter.as_deref(),
        )
        .await?
        .ok_or(ApiProblem::NotFound)?;

    // The cache entry is refreshed only after the database commit; deliveries
    // in flight may still observe the previous target for up to one round-trip
    state
        .cache
        .put(
            &subscription.subscription_id,
            &CachedSubscription::from(&subscription),
        )
        .await;

    Ok(Json(SubscriptionInfo::from(subscription)))
}

#[derive(Debug, Serialize)]
struct DeletedBody {
    message: &'static str,
}

pub async fn delete(
    state: Data<crate::State>,
    subscription_id: Path<Uuid>,
) -> Result<HttpResponse, ApiProblem> {
    let subscription_id = subscription_id.into_inner();

    if !state.store.delete_subscription(&subscription_id).await? {
        return Err(ApiProblem::NotFound);
    }

    state.cache.invalidate(&subscription_id).await;

    Ok(HttpResponse::Ok().json(DeletedBody {
        message: "Subscription deleted",
    }))
}

#[cfg(test)]
mod tests {
    use serde_json::{from_value, json};

    use super::*;

    #[test]
    fn test_deserialize_subscription_valid() {
        let input = json!({
            "target_url": "https://example.com/hooks",
            "secret": "s3cret",
            "event_type_filter": "order.created",
        });
        let subscription = from_value::<SubscriptionPost>(input).unwrap();
        assert_eq!(subscription.target_url.as_str(), "https://example.com/hooks");
        assert_eq!(subscription.secret.as_deref(), Some("s3cret"));
        assert_eq!(
            subscription.event_type_filter.as_deref(),
            Some("order.created")
        );
    }

    #[test]
    fn test_deserialize_subscription_optional_fields_default_to_none() {
        let input = json!({ "target_url": "http://example.com/hooks" });
        let subscription = from_value::<SubscriptionPost>(input).unwrap();
        assert_eq!(subscription.secret, None);
        assert_eq!(subscription.event_type_filter, None);
    }

    #[test]
    fn test_deserialize_target_url_wrong_scheme() {
        let input = json!({ "target_url": "ftp://example.com/hooks" });
        assert!(
            from_value::<SubscriptionPost>(input)
                .unwrap_err()
                .to_string()
                .contains("scheme")
        );
    }

    #[test]
    fn test_deserialize_target_url_no_host() {
        let input = json!({ "target_url": "http://" });
        assert!(
            from_value::<SubscriptionPost>(input)
                .unwrap_err()
                .to_string()
                .contains("host")
        );
    }

    #[test]
    fn test_deserialize_target_url_too_long() {
        let input = json!({
            "target_url": format!("https://example.com/{}", "a".repeat(TARGET_URL_MAX_LENGTH)),
        });
        assert!(
            from_value::<SubscriptionPost>(input)
                .unwrap_err()
                .to_string()
                .contains("longer")
        );
    }

    #[test]
    fn test_validate_secret_length() {
        let input = json!({
            "target_url": "https://example.com/hooks",
            "secret": "s".repeat(256),
        });
        let subscription = from_value::<SubscriptionPost>(input).unwrap();
        assert!(subscription.validate().is_err());
    }
}
