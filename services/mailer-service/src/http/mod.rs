//! Thin HTTP surface (§4 "Thin HTTP surface"): health/readiness/metrics
//! plus a minimal JSON intake/status adapter calling straight into the
//! Job Intake component. The full multipart/OpenAPI surface is out of
//! scope.

pub mod health;
pub mod intake;
pub mod status;

use actix_web::web;

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    health::register_routes(cfg);
    intake::register_routes(cfg);
    status::register_routes(cfg);
    cfg.route("/metrics", web::get().to(crate::metrics::serve_metrics));
}
