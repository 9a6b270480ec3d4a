// SPDX-License-Identifier: AGPL-3.0-only
use crate::config::{Args, LogFormat};
use crate::http::{ServerState, serve_http};
use crate::server::{Shared, serve};
use crate::telemetry::{TelemetryConfig, init_telemetry, shutdown_telemetry};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tacplus_core::StateStore;
use tacplus_policy::{PolicyEngine, validate_policy};
use tacplus_proto::MIN_SECRET_LEN;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() -> Result<()> {
    let args = Args::parse();

    let otel_enabled = args.otlp_endpoint.is_some();
    match (&args.log_format, &args.otlp_endpoint) {
        (LogFormat::Text, None) => {
            tracing_subscriber::fmt()
                .with_timer(UtcTime::rfc_3339())
                .finish()
                .init();
        }
        (LogFormat::Json, None) => {
            tracing_subscriber::fmt()
                .with_timer(UtcTime::rfc_3339())
                .json()
                .flatten_event(true)
                .finish()
                .init();
        }
        (format, Some(endpoint)) => {
            let telemetry_config = TelemetryConfig {
                otlp_endpoint: endpoint.clone(),
                service_name: args.otel_service_name.clone(),
                location: args.location.clone(),
            };
            let otel_layer = init_telemetry(&telemetry_config)?;
            let registry = tracing_subscriber::registry().with(otel_layer);
            match format {
                LogFormat::Text => registry
                    .with(tracing_subscriber::fmt::layer().with_timer(UtcTime::rfc_3339()))
                    .init(),
                LogFormat::Json => registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_timer(UtcTime::rfc_3339())
                            .json()
                            .flatten_event(true),
                    )
                    .init(),
            }
            info!(otlp_endpoint = %endpoint, "OpenTelemetry tracing enabled");
        }
    }

    if let Some(policy_path) = args.check_policy.as_ref() {
        validate_policy(policy_path, args.schema.as_ref())?;
        println!("policy validated");
        return Ok(());
    }

    let policy_path = args
        .policy
        .as_ref()
        .context("a --policy path is required to start the server")?;
    let engine = Arc::new(PolicyEngine::from_path(policy_path, args.schema.as_ref())?);
    info!(
        sections = engine.section_count(),
        policy = %policy_path.display(),
        "policy compiled"
    );

    let secret = args
        .secret
        .as_ref()
        .context("--secret is required to start the server")?;
    if secret.len() < MIN_SECRET_LEN {
        bail!("shared secret must be at least {MIN_SECRET_LEN} bytes");
    }
    let secret: Arc<Vec<u8>> = Arc::new(secret.clone().into_bytes());

    let store = Arc::new(StateStore::new(
        args.max_sessions,
        Duration::from_secs(args.session_timeout_secs),
        args.state_seed,
    ));

    // spawn_workers selects the threading model; the store locks regardless.
    let mut builder = if args.spawn_workers {
        tokio::runtime::Builder::new_multi_thread()
    } else {
        tokio::runtime::Builder::new_current_thread()
    };
    let runtime = builder.enable_all().build()?;

    runtime.block_on(async move {
        let shared = Shared {
            store,
            engine,
            secret,
        };
        let server_state = ServerState::new();
        let mut handles = Vec::new();

        if let Some(addr) = args.listen_http {
            let state = server_state.clone();
            handles.push(tokio::spawn(async move {
                if let Err(err) = serve_http(addr, state).await {
                    error!(error = %err, "HTTP server stopped");
                }
            }));
        }

        let listen = args.listen;
        handles.push(tokio::spawn(async move {
            if let Err(err) = serve(listen, shared).await {
                error!(error = %err, "TACACS+ listener stopped");
            }
        }));

        server_state.set_ready(true);
        info!("server ready");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                server_state.set_ready(false);
            }
            _ = async {
                for handle in handles {
                    let _ = handle.await;
                }
            } => {}
        }
    });

    if otel_enabled {
        shutdown_telemetry();
    }

    Ok(())
}

mod config;
mod http;
mod metrics;
mod server;
mod telemetry;
