use actix_web::error::JsonPayloadError;
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, ResponseError};
use log::error;
use serde::Serialize;
use std::borrow::Cow;
use std::fmt::Display;

use hookline_core::signature::SignatureError;
use hookline_core::store::StoreError;

/// Every error a handler can surface, mapped to a fixed HTTP status code and
/// a JSON body carrying a `message` field.
#[derive(Debug, Clone, strum::Display)]
pub enum ApiProblem {
    // Producer faults
    BodyNotJson,
    JsonPayload(JsonPayloadProblem),
    Validation(validator::ValidationErrors),
    SignatureHeaderMissing,
    SignatureHeaderMalformed,
    SignatureMethodUnsupported(String),
    SignatureMismatch,

    // Generic errors
    NotFound,
    InternalServerError,
    ServiceUnavailable,
}

impl From<StoreError> for ApiProblem {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Database(sqlx::Error::RowNotFound) => ApiProblem::NotFound,
            StoreError::Database(sqlx::Error::Database(db_error)) => {
                // A vanished subscription surfaces as a foreign key violation
                // when its delivery task is inserted
                if db_error.constraint() == Some("delivery_task_subscription_fk") {
                    ApiProblem::NotFound
                } else {
                    error!("Database error: {db_error}");
                    ApiProblem::InternalServerError
                }
            }
            e => {
                error!("{e}");
                ApiProblem::InternalServerError
            }
        }
    }
}

impl From<SignatureError> for ApiProblem {
    fn from(e: SignatureError) -> Self {
        match e {
            SignatureError::MalformedHeader => ApiProblem::SignatureHeaderMalformed,
            SignatureError::UnsupportedMethod(method) => {
                ApiProblem::SignatureMethodUnsupported(method)
            }
            SignatureError::Mismatch => ApiProblem::SignatureMismatch,
        }
    }
}

impl std::error::Error for ApiProblem {}

#[derive(Debug, Clone)]
pub struct Problem {
    pub detail: Cow<'static, str>,
    pub status: StatusCode,
}

impl From<&ApiProblem> for Problem {
    fn from(problem: &ApiProblem) -> Self {
        match problem {
            ApiProblem::BodyNotJson => Problem {
                detail: "Request body must be JSON".into(),
                status: StatusCode::UNSUPPORTED_MEDIA_TYPE,
            },
            ApiProblem::JsonPayload(e) => Problem {
                detail: e.to_string().into(),
                status: match e {
                    JsonPayloadProblem::ContentType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    _ => StatusCode::BAD_REQUEST,
                },
            },
            ApiProblem::Validation(e) => Problem {
                detail: e.to_string().into(),
                status: StatusCode::BAD_REQUEST,
            },
            ApiProblem::SignatureHeaderMissing => Problem {
                detail: "Signature header missing".into(),
                status: StatusCode::UNAUTHORIZED,
            },
            ApiProblem::SignatureHeaderMalformed => Problem {
                detail: "Invalid signature header format".into(),
                status: StatusCode::BAD_REQUEST,
            },
            ApiProblem::SignatureMethodUnsupported(method) => Problem {
                detail: format!("Unsupported signature hash method '{method}'").into(),
                status: StatusCode::BAD_REQUEST,
            },
            ApiProblem::SignatureMismatch => Problem {
                detail: "Invalid signature".into(),
                status: StatusCode::UNAUTHORIZED,
            },
            ApiProblem::NotFound => Problem {
                detail: "Could not find the requested item; check the identifier".into(),
                status: StatusCode::NOT_FOUND,
            },
            ApiProblem::InternalServerError => Problem {
                detail: "An internal error occurred while handling your request".into(),
                status: StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiProblem::ServiceUnavailable => Problem {
                detail: "Database is unreachable".into(),
                status: StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ProblemBody<'a> {
    message: &'a str,
}

impl ResponseError for ApiProblem {
    fn status_code(&self) -> StatusCode {
        Problem::from(self).status
    }

    fn error_response(&self) -> HttpResponse {
        let problem = Problem::from(self);
        HttpResponse::build(problem.status).json(ProblemBody {
            message: &problem.detail,
        })
    }
}

/// Simplified error type for the JSON body parser
#[derive(Debug, Clone)]
pub enum JsonPayloadProblem {
    Overflow { limit: usize },
    ContentType,
    Deserialize(String),
    Payload(String),
    Other(String),
}

impl Display for JsonPayloadProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overflow { limit } => write!(f, "Body is too big (maximum is {limit} bytes)"),
            Self::ContentType => {
                write!(f, "Content-Type header should be set to 'application/json'")
            }
            Self::Deserialize(e) => write!(f, "JSON deserialization error: {e}"),
            Self::Payload(e) => write!(f, "Payload error: {e}"),
            Self::Other(e) => write!(f, "{e}"),
        }
    }
}

impl From<JsonPayloadError> for JsonPayloadProblem {
    fn from(e: JsonPayloadError) -> Self {
        match e {
            JsonPayloadError::OverflowKnownLength { length: _, limit } => Self::Overflow { limit },
            JsonPayloadError::Overflow { limit } => Self::Overflow { limit },
            JsonPayloadError::ContentType => Self::ContentType,
            JsonPayloadError::Deserialize(e) => Self::Deserialize(e.to_string()),
            JsonPayloadError::Payload(e) => Self::Payload(e.to_string()),
            e => Self::Other(e.to_string()),
        }
    }
}

pub fn json_error_handler(e: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    ApiProblem::JsonPayload(JsonPayloadProblem::from(e)).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_problems_map_to_the_documented_status_codes() {
        assert_eq!(
            ApiProblem::SignatureHeaderMissing.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiProblem::SignatureHeaderMalformed.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiProblem::SignatureMethodUnsupported("sha1".to_owned()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiProblem::SignatureMismatch.status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn signature_errors_convert_to_the_matching_problem() {
        assert!(matches!(
            ApiProblem::from(SignatureError::Mismatch),
            ApiProblem::SignatureMismatch
        ));
        assert!(matches!(
            ApiProblem::from(SignatureError::UnsupportedMethod("md5".to_owned())),
            ApiProblem::SignatureMethodUnsupported(m) if m == "md5"
        ));
    }

    #[test]
    fn non_json_bodies_are_unsupported_media_type() {
        assert_eq!(
            ApiProblem::BodyNotJson.status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            ApiProblem::JsonPayload(JsonPayloadProblem::ContentType).status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            ApiProblem::JsonPayload(JsonPayloadProblem::Deserialize("oops".to_owned()))
                .status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
