use log::debug;
use reqwest::Client;
use serde_json::Value;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Upper bound of the response body excerpt kept in `error_details`
const ERROR_BODY_EXCERPT_MAX: usize = 200;

#[derive(Debug, Clone)]
pub struct Response {
    pub http_code: Option<u16>,
    pub error_details: Option<String>,
    pub elapsed_time: Duration,
}

impl Response {
    pub fn is_success(&self) -> bool {
        matches!(self.http_code, Some(code) if (200..300).contains(&code))
    }

    pub fn http_status(&self) -> Option<i32> {
        self.http_code.map(i32::from)
    }

    pub fn elapsed_time_ms(&self) -> u128 {
        self.elapsed_time.as_millis()
    }
}

/// POST the payload to the subscription target and classify what came back.
///
/// Transport failures never bubble up as errors; they are folded into the
/// response classification so the caller can run the retry state machine on
/// every outcome the same way.
pub async fn work(
    client: &Client,
    delivery_task_id: &Uuid,
    target_url: &str,
    payload: &Value,
    timeout: Duration,
) -> Response {
    debug!("Posting delivery task {delivery_task_id} to {target_url}");
    let start = Instant::now();

    let result = client
        .post(target_url)
        .timeout(timeout)
        .json(payload)
        .send()
        .await;

    match result {
        Ok(response) => {
            let http_code = response.status().as_u16();
            if response.status().is_success() {
                Response {
                    http_code: Some(http_code),
                    error_details: None,
                    elapsed_time: start.elapsed(),
                }
            } else {
                let body = response.text().await.unwrap_or_default();
                Response {
                    http_code: Some(http_code),
                    error_details: Some(non_2xx_details(http_code, &body)),
                    elapsed_time: start.elapsed(),
                }
            }
        }
        Err(e) => Response {
            http_code: None,
            error_details: Some(transport_details(&e, timeout)),
            elapsed_time: start.elapsed(),
        },
    }
}

fn non_2xx_details(http_code: u16, body: &str) -> String {
    format!(
        "Non-2xx status code: {http_code}. Response: {}",
        excerpt(body)
    )
}

fn transport_details(e: &reqwest::Error, timeout: Duration) -> String {
    if e.is_timeout() {
        format!("Delivery timeout after {} seconds", timeout.as_secs())
    } else if e.is_connect() {
        format!("Connection error: {e}")
    } else {
        format!("Request error: {e}")
    }
}

fn excerpt(body: &str) -> String {
    body.chars().take(ERROR_BODY_EXCERPT_MAX).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(http_code: Option<u16>) -> Response {
        Response {
            http_code,
            error_details: None,
            elapsed_time: Duration::from_millis(12),
        }
    }

    #[test]
    fn only_2xx_codes_are_successful() {
        assert!(response(Some(200)).is_success());
        assert!(response(Some(204)).is_success());
        assert!(response(Some(299)).is_success());
        assert!(!response(Some(199)).is_success());
        assert!(!response(Some(301)).is_success());
        assert!(!response(Some(500)).is_success());
        assert!(!response(None).is_success());
    }

    #[test]
    fn error_details_keep_the_status_and_a_body_excerpt() {
        let details = non_2xx_details(503, "upstream unavailable");
        assert_eq!(
            details,
            "Non-2xx status code: 503. Response: upstream unavailable"
        );
    }

    #[test]
    fn body_excerpt_is_bounded() {
        let body = "x".repeat(1000);
        let details = non_2xx_details(500, &body);
        assert!(details.ends_with(&"x".repeat(ERROR_BODY_EXCERPT_MAX)));
        assert!(details.len() < 300);
    }

    #[test]
    fn body_excerpt_counts_characters_not_bytes() {
        let body = "é".repeat(300);
        assert_eq!(excerpt(&body).chars().count(), ERROR_BODY_EXCERPT_MAX);
    }
}
