use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use k8s_openapi::api::core::v1::Service;
use kube::Api;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use nlb_controller::cli::{format_dry_run, Args, ProviderKind};
use nlb_controller::cluster::KubeServices;
use nlb_controller::config::{load_config_file, Settings};
use nlb_controller::driver;
use nlb_controller::ledger::Ledger;
use nlb_controller::provider::MemoryProvider;
use nlb_controller::reconciler::Reconciler;
use nlb_controller::server::{create_router, StatusState};

#[tokio::main]
async fn main() {
    let mut args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified, then parse again so env-backed flags see it
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
        args = Args::parse();
    }

    let file = match args.config.as_deref().map(load_config_file).transpose() {
        Ok(file) => file,
        Err(e) => {
            let path = args.config.as_deref().unwrap_or(Path::new(""));
            error!("Failed to load config file {}: {}", path.display(), e);
            process::exit(1);
        }
    };

    let settings = match Settings::resolve(args.overrides(), file) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    let provider = match args.provider_kind() {
        Ok(provider) => provider,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    // Dry-run mode: print the resolved pool and exit
    if args.dry_run {
        println!("{}", format_dry_run(&settings, &args));
        return;
    }

    if let Err(e) = run(args, settings, provider).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args, settings: Settings, provider: ProviderKind) -> anyhow::Result<()> {
    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let ledger = Arc::new(Ledger::new(settings.pool.clone()));
    let provider = match provider {
        ProviderKind::Memory => {
            warn!(
                "SIMULATION: the {} gateway creates no load balancer listeners; \
                 bindings written to services route no traffic and are re-issued after a restart",
                provider
            );
            Arc::new(
                MemoryProvider::new(settings.scope.clone()).with_load_balancers(
                    settings
                        .pool
                        .load_balancers
                        .iter()
                        .map(|lb| lb.name.clone()),
                ),
            )
        }
    };
    let cluster = Arc::new(KubeServices::new(client.clone()));
    let reconciler = Arc::new(Reconciler::new(ledger.clone(), provider, cluster));
    let ctx = Arc::new(driver::Context::new(reconciler, args.retry_policy()));

    let services: Api<Service> = match args.namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    let app = create_router(StatusState::new(ledger, ctx.incidents()));
    let listener = tokio::net::TcpListener::bind(args.status_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", args.status_addr))?;

    info!(
        "Managing {} load balancer(s), ports {}-{}",
        settings.pool.load_balancers.len(),
        settings.pool.ports.start,
        settings.pool.ports.end
    );
    info!(
        "Watching services in {}",
        args.namespace.as_deref().unwrap_or("all namespaces")
    );
    info!("Status endpoint listening on {}", args.status_addr);
    info!("Endpoints:");
    info!("  GET  /health          - Health check");
    info!("  GET  /v1/allocations  - Ledger contents and incidents");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await
    });

    // Returns once a termination signal has drained the controller.
    driver::run(services, ctx).await;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    server.await.context("Status server panicked")??;
    Ok(())
}
