//! Status/entry-query surface (§7 "User-visible failure behavior"):
//! a Mailing's lifecycle status, progress, and counts by
//! (PENDING, SENDING, SENT, FAILED, INVALID).

use actix_web::{web, HttpResponse};
use serde::Serialize;
use uuid::Uuid;

use error_types::{MailerError, MailerResult};

use crate::app_state::AppState;
use crate::db::StatusCounts;
use crate::models::Mailing;

#[derive(Debug, Serialize)]
pub struct MailingStatusResponse {
    #[serde(flatten)]
    pub mailing: Mailing,
    pub counts: StatusCounts,
}

pub async fn get_mailing_status(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> MailerResult<HttpResponse> {
    let mailing_id = path.into_inner();

    let mailing = state
        .mailings
        .get(mailing_id)
        .await?
        .ok_or(MailerError::NotFound { resource: "mailing", id: mailing_id.to_string() })?;

    let counts = state.entries.count_by_status(mailing_id).await?;

    Ok(HttpResponse::Ok().json(MailingStatusResponse { mailing, counts }))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::scope("/api/v1/mailings").route("/{id}", web::get().to(get_mailing_status)));
}
