//! External HTTP API.
//!
//! Read-only views of the shared state plus the two command injections:
//! kill and run-now. The UI consumes these; the scheduler only ever sees
//! the resulting queue entries.

use actix_web::{web, HttpResponse, Responder};
use serde_json::json;
use tracing::info;

use crate::state::Command;

use super::ServerContext;

pub async fn get_version() -> impl Responder {
    HttpResponse::Ok().json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

pub async fn get_config(ctx: web::Data<ServerContext>) -> impl Responder {
    let snapshot = ctx.loader.snapshot();
    HttpResponse::Ok().json(json!({
        "jobs": snapshot.jobs,
        "maintenance": snapshot.maintenance,
        "runtime": snapshot.runtime,
    }))
}

pub async fn get_running(ctx: web::Data<ServerContext>) -> impl Responder {
    HttpResponse::Ok().json(ctx.state.running_snapshot())
}

pub async fn get_state(ctx: web::Data<ServerContext>) -> impl Responder {
    HttpResponse::Ok().json(ctx.state.state_snapshot())
}

pub async fn post_kill(
    path: web::Path<String>,
    ctx: web::Data<ServerContext>,
) -> impl Responder {
    let job_name = path.into_inner();
    info!(job = %job_name, "kill requested");
    ctx.state.push_command(Command::Kill {
        job_name: job_name.clone(),
    });
    HttpResponse::Accepted().json(json!({ "queued": "kill", "job": job_name }))
}

pub async fn post_run(
    path: web::Path<String>,
    ctx: web::Data<ServerContext>,
) -> impl Responder {
    let job_name = path.into_inner();
    info!(job = %job_name, "run-now requested");
    ctx.state.push_command(Command::RunNow {
        job_name: job_name.clone(),
    });
    HttpResponse::Accepted().json(json!({ "queued": "run", "job": job_name }))
}
