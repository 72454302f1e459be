use anyhow::Context;
use axum::Router;
use query_task_storage::backend::Backends;
use query_task_storage::cluster::membership::MembershipService;
use query_task_storage::config::{Config, StorageBackend};
use query_task_storage::executor::QueryExecutor;
use query_task_storage::logic::builtin::SequenceLogic;
use query_task_storage::logic::registry::QueryLogicRegistry;
use query_task_storage::monitor::QueryMonitor;
use query_task_storage::service::{self, QueryService};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct Args {
    bind_addr: SocketAddr,
    seed_nodes: Vec<SocketAddr>,
    config_path: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--seed <addr:port>] [--config <file.toml>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:5000", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000 --config node.toml",
            args[0]
        );
        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--bind" => {
                let raw = value.context("--bind needs an address")?;
                bind_addr = Some(raw.parse().with_context(|| format!("bad --bind {}", raw))?);
                i += 2;
            }
            "--seed" => {
                let raw = value.context("--seed needs an address")?;
                seed_nodes.push(raw.parse().with_context(|| format!("bad --seed {}", raw))?);
                i += 2;
            }
            "--config" => {
                config_path = Some(PathBuf::from(value.context("--config needs a path")?));
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    Ok(Args {
        bind_addr: bind_addr.context("--bind is required")?,
        seed_nodes,
        config_path,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let config = match &args.config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(config.log_level))
        .init();

    let http_addr = SocketAddr::new(args.bind_addr.ip(), args.bind_addr.port() + 1000);
    tracing::info!("Starting node on {} (http {})", args.bind_addr, http_addr);

    // 1. Membership, only when state is spread over the cluster:
    let membership = match config.storage.backend {
        StorageBackend::Distributed => {
            if args.seed_nodes.is_empty() {
                tracing::info!("Starting as seed node (founder)");
            } else {
                tracing::info!("Seed nodes: {:?}", args.seed_nodes);
            }
            let membership =
                MembershipService::new(args.bind_addr, http_addr, args.seed_nodes.clone()).await?;
            tracing::info!("Node ID: {:?}", membership.local_node.id);
            Some(membership)
        }
        StorageBackend::Synchronous => None,
    };

    // 2. Storage and queue:
    let backends = Arc::new(Backends::from_config(&config, membership.clone())?);

    // 3. Query logics:
    let registry = QueryLogicRegistry::new();
    registry.register("sequence", Arc::new(SequenceLogic::new()));
    tracing::info!("Registered query logics: {:?}", registry.list());

    // 4. Background workers:
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let executor = QueryExecutor::new(
        backends.storage.clone(),
        backends.queue.clone(),
        registry.clone(),
        &config,
    );
    let mut workers = executor.start(shutdown_rx.clone());

    let monitor = QueryMonitor::new(
        backends.storage.clone(),
        backends.queue.clone(),
        config.monitor.clone(),
    );
    workers.push(monitor.start(shutdown_rx));

    let query_service = QueryService::new(
        backends.storage.clone(),
        backends.queue.clone(),
        registry,
        config.service.clone(),
    );

    // 5. HTTP router:
    let app = Router::new()
        .merge(backends.internal_router())
        .merge(service::handlers::router(query_service));

    if let Some(membership) = membership.clone() {
        tokio::spawn(async move {
            membership.start().await;
        });
    }

    // 6. Stats reporter:
    let stats_backends = backends.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            if let Some(membership) = stats_backends.membership() {
                let alive = membership.get_alive_members();
                tracing::info!("Cluster stats: {} alive nodes", alive.len());
                for node in alive {
                    tracing::debug!(
                        "  - {:?} gossip={} http={} (inc={})",
                        node.id,
                        node.gossip_addr,
                        node.http_addr,
                        node.incarnation
                    );
                }
            }
            tracing::info!("Node stats: {}", stats_backends.describe().await);
        }
    });

    // 7. HTTP server:
    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await?;

    tracing::info!("Shutting down workers");
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!("Worker ended abnormally: {}", e);
        }
    }

    Ok(())
}
