pub mod ingest;
pub mod status;
pub mod subscriptions;

use actix_web::HttpResponse;
use actix_web::web::Data;
use serde::Serialize;

use crate::problems::ApiProblem;

#[derive(Debug, Serialize)]
struct HealthBody {
    message: &'static str,
}

/// Liveness probe: answers 200 once the database does.
pub async fn health(state: Data<crate::State>) -> Result<HttpResponse, ApiProblem> {
    state
        .store
        .ping()
        .await
        .map_err(|_| ApiProblem::ServiceUnavailable)?;

    Ok(HttpResponse::Ok().json(HealthBody { message: "ok" }))
}
