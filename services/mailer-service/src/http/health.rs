//! Liveness/readiness probes (§4.13, §8 "`/health` returns 200 whenever
//! the process is accepting work; returns 503 once the shutdown flag
//! is flipped").

use actix_web::{web, HttpResponse};
use serde::Serialize;

use crate::app_state::AppState;
use crate::shutdown;

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
}

pub async fn health() -> HttpResponse {
    if shutdown::is_accepting_work() {
        HttpResponse::Ok().json(HealthBody { status: "ok" })
    } else {
        HttpResponse::ServiceUnavailable().json(HealthBody { status: "shutting_down" })
    }
}

#[derive(Debug, Serialize)]
struct ReadyBody {
    status: &'static str,
    recovery_needed: bool,
}

/// Readiness also reports whether crash recovery (§4.9) would find
/// stale state right now, without mutating anything.
pub async fn ready(state: web::Data<AppState>) -> HttpResponse {
    if !shutdown::is_accepting_work() {
        return HttpResponse::ServiceUnavailable().json(ReadyBody { status: "shutting_down", recovery_needed: false });
    }

    match state.crash_recovery.check_recovery_needed().await {
        Ok(recovery_needed) => HttpResponse::Ok().json(ReadyBody { status: "ok", recovery_needed }),
        Err(e) => {
            e.log();
            HttpResponse::ServiceUnavailable().json(ReadyBody { status: "database_unreachable", recovery_needed: false })
        }
    }
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health));
    cfg.route("/ready", web::get().to(ready));
}
