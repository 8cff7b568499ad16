//! Network surfaces of the scheduler: the agent channel server and the
//! external HTTP API. Both are actix `HttpServer`s sharing one
//! [`ServerContext`].

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::ConfigLoader;
use crate::state::StateStore;

pub mod api;
pub mod registry;
pub mod session;

pub use registry::{run_kill_poller, ConnectionRegistry};

#[derive(Clone)]
pub struct ServerContext {
    pub state: Arc<StateStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub loader: Arc<ConfigLoader>,
}

/// The persistent bidirectional channel agents dial back to. Failure to
/// bind is fatal to the daemon.
pub async fn run_channel_server(bind_addr: &str, port: u16, ctx: ServerContext) -> Result<()> {
    let bind = format!("{bind_addr}:{port}");
    tracing::info!(%bind, "starting agent channel server");
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(ctx.clone()))
            .route("/ws", web::get().to(session::agent_ws))
    })
    .bind(&bind)
    .with_context(|| format!("binding agent channel server to {bind}"))?
    .run()
    .await
    .context("agent channel server error")
}

/// The external API: state reads plus kill/run-now command injection.
pub async fn run_api_server(bind_addr: &str, port: u16, ctx: ServerContext) -> Result<()> {
    let bind = format!("{bind_addr}:{port}");
    tracing::info!(%bind, "starting http api");
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(ctx.clone()))
            .route("/version", web::get().to(api::get_version))
            .route("/config", web::get().to(api::get_config))
            .route("/running", web::get().to(api::get_running))
            .route("/state", web::get().to(api::get_state))
            .route("/kill/{job_name}", web::post().to(api::post_kill))
            .route("/run/{job_name}", web::post().to(api::post_run))
    })
    .bind(&bind)
    .with_context(|| format!("binding http api to {bind}"))?
    .run()
    .await
    .context("http api error")
}
