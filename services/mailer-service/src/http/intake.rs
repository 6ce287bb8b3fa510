//! Minimal JSON intake adapter (§4.1, §6). The full multipart/OpenAPI
//! upload surface is out of scope; this accepts the CSV body inline as
//! base64 so the pipeline is reachable over HTTP without that surface.

use actix_web::{web, HttpResponse};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;

use error_types::{MailerError, MailerResult};

use crate::app_state::AppState;
use crate::shutdown;

#[derive(Debug, Deserialize)]
pub struct SubmitMailingRequest {
    pub filename: String,
    /// Base64-encoded CSV bytes.
    pub content: String,
}

pub async fn submit_mailing(
    state: web::Data<AppState>,
    body: web::Json<SubmitMailingRequest>,
) -> MailerResult<HttpResponse> {
    if !shutdown::is_accepting_work() {
        return Err(MailerError::ServiceUnavailable);
    }

    let csv_bytes = BASE64.decode(body.content.as_bytes()).map_err(|e| MailerError::InvalidInput {
        message: format!("content is not valid base64: {e}"),
        source: None,
    })?;

    if body.filename.trim().is_empty() {
        return Err(MailerError::InvalidInput {
            message: "filename must not be empty".to_string(),
            source: None,
        });
    }

    let result = state.intake.submit(&body.filename, &csv_bytes).await?;
    Ok(HttpResponse::Accepted().json(result))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::scope("/api/v1/mailings").route("", web::post().to(submit_mailing)));
}
