//! upload-gateway server binary.
//!
//! Accepts authenticated `POST` uploads and writes them either to the local
//! filesystem under the caller's own uid (through a re-executed copy of this
//! binary) or to an FTP server with the caller's FTP login. The same binary
//! doubles as the privilege-dropped write helper, see [`helper`].

mod auth;
mod body;
mod config;
mod error;
mod ftp;
mod helper;
mod logging;
mod privsep;
mod remote;
mod routes;
mod template;
mod upload;

use anyhow::Context;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::any;
use axum_server::Handle;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, info_span, warn};

use crate::auth::SqlCredentialStore;
use crate::config::{Args, BackendSettings, GatewayConfig};
use crate::ftp::FtpDialer;
use crate::privsep::{ExecutableImage, LocalWriter};
use crate::remote::RemoteWriter;
use crate::upload::{Backend, Gateway, LocalBackend};

fn main() -> ExitCode {
    logging::init_logging();

    if let Some(target) = helper::helper_target(std::env::args_os()) {
        return helper::run(&target);
    }

    match serve() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Starts the gateway and blocks until shutdown.
#[tokio::main]
async fn serve() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("could not load config {}", args.config.display()))?;
    let port = args.port.unwrap_or(config.port);

    let (backend, sql_store) = build_backend(config.backend).await?;
    let gateway = Arc::new(Gateway::new(backend));
    info!(backend = gateway.kind(), "backend ready");

    let host = args
        .host
        .parse::<IpAddr>()
        .with_context(|| format!("invalid bind address {}", args.host))?;
    let addr = SocketAddr::new(host, port);
    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    info!("listening on {}", addr);
    axum_server::bind(addr)
        .handle(handle)
        .serve(build_router(gateway).into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("http server failed")?;

    if let Some(store) = sql_store {
        store.close().await;
    }
    Ok(())
}

async fn build_backend(
    settings: BackendSettings,
) -> anyhow::Result<(Backend, Option<Arc<SqlCredentialStore>>)> {
    match settings {
        BackendSettings::Local(local) => {
            let image = ExecutableImage::current(local.copy_exe)
                .context("could not prepare executable image for write helper")?;
            let store = Arc::new(
                SqlCredentialStore::connect(&local.sql)
                    .await
                    .context("could not connect to credential database")?,
            );
            info!(
                root = %local.root.display(),
                helper = %image.path().display(),
                "local backend"
            );
            let writer = LocalWriter::new(image, local.root, local.write_timeout);
            let backend =
                LocalBackend::new(store.clone(), writer, local.uid_offset, local.url_prefix);
            Ok((Backend::Local(backend), Some(store)))
        }
        BackendSettings::Ftp(ftp) => {
            info!(host = %ftp.host, port = ftp.port, routes = ftp.routes.len(), "ftp backend");
            if ftp.routes.is_empty() {
                warn!("no url routes configured, every upload answers with an empty body");
            }
            let dialer = Arc::new(FtpDialer::new(ftp.host, ftp.port, ftp.timeout));
            Ok((Backend::Remote(RemoteWriter::new(dialer, ftp.routes)), None))
        }
    }
}

fn build_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/", any(upload::handle_upload))
        .route("/{*path}", any(upload::handle_upload))
        .layer(DefaultBodyLimit::disable())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip().to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(gateway))
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
