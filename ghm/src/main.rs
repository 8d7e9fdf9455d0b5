//! GPU Health Monitor (GHM)
//!
//! Polls a GPU diagnostic source, tracks each health condition through its
//! NEW / ONGOING / CLEARED lifecycle and forwards categorized health events
//! to the node's platform connector. Runs as a DaemonSet on GPU nodes.

mod cli;
mod config;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::Config;
use ghm_core::source::{
    AddressResolver, DnsResolver, MockSource, PciTopology, RemoteSource, XidLogSource,
};
use ghm_core::{
    CategorizationTables, DiagnosticSource, EventProcessor, HealthCondition, MetricsRegistry,
    ProcessorContext, ProcessorRegistry, SourceKind, Watcher,
};
use ghm_k8s::{K8sClient, ServiceResolver, ServiceTarget};

/// Initialize the tracing/logging subsystem
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Build the configured diagnostic source
async fn build_source(config: &Config, node_name: &str) -> Result<Arc<dyn DiagnosticSource>> {
    let source: Arc<dyn DiagnosticSource> = match config.source.kind {
        SourceKind::Remote => {
            let resolver: Arc<dyn AddressResolver> = if config.source.discovery {
                let target = ServiceTarget::parse(&config.source.address)
                    .context("Invalid source address for service discovery")?;
                let client = K8sClient::new().await?;
                if let Err(e) = client.health_check(&target.namespace).await {
                    warn!(error = %e, "Cannot read services yet, discovery will keep retrying");
                }
                Arc::new(ServiceResolver::new(client, target))
            } else {
                Arc::new(DnsResolver::new(config.source.address.clone()))
            };
            Arc::new(RemoteSource::new(
                node_name,
                resolver,
                config.source.connect_timeout,
                config.source.query_timeout,
            ))
        }
        SourceKind::XidLog => {
            let topology = PciTopology::from_nvml_or_empty();
            info!(gpus = topology.len(), "Loaded PCI topology");
            Arc::new(
                XidLogSource::new(node_name, topology, config.source.query_timeout)
                    .with_command(config.source.xid_command.clone()),
            )
        }
        SourceKind::Mock => {
            warn!("Using mock diagnostic source, no conditions will be reported");
            Arc::new(MockSource::new(node_name))
        }
    };

    info!(kind = %config.source.kind, source = %source.describe(), "Diagnostic source ready");
    Ok(source)
}

/// Union of the conditions every processor still tracks as active
async fn seed_conditions(processors: &[Arc<dyn EventProcessor>]) -> Vec<HealthCondition> {
    let mut seeded = HashMap::new();
    for processor in processors {
        for condition in processor.tracked_conditions().await {
            seeded.entry(condition.key()).or_insert(condition);
        }
    }
    seeded.into_values().collect()
}

/// Query once and log what the source reports
async fn run_once(
    config: &Config,
    source: Arc<dyn DiagnosticSource>,
    tables: &CategorizationTables,
) -> Result<()> {
    info!("Running single poll (--once mode)");

    let conditions = tokio::time::timeout(config.source.query_timeout, source.query())
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "Diagnostic query timed out after {}",
                humantime::format_duration(config.source.query_timeout)
            )
        })?
        .context("Diagnostic query failed")?;

    if conditions.is_empty() {
        info!("No health conditions reported");
    }
    for condition in &conditions {
        let category = tables.categorize(&condition.error_code, &condition.system);
        warn!(
            device = %condition.device_id,
            code = %condition.error_code,
            system = %condition.system,
            error_name = %category.error_name,
            severity = %category.severity_class,
            action = %category.recommended_action,
            message = %condition.raw_message,
            "Health condition"
        );
    }
    Ok(())
}

/// Run the poll loop until shutdown
async fn run(config: Config, once: bool, shutdown: CancellationToken) -> Result<()> {
    let node_name = config
        .node_name
        .clone()
        .context("Node name must be specified via config, --node-name, or NODE_NAME env")?;

    info!(node = %node_name, "Starting GHM on node");

    let tables = CategorizationTables::load(
        &config.categorization.error_mapping_file,
        config.categorization.severity_classes.clone(),
        &config.categorization.default_class,
    )
    .with_context(|| {
        format!(
            "Failed to load categorization tables from {:?}",
            config.categorization.error_mapping_file
        )
    })?;
    info!(
        codes = tables.errors().len(),
        severity_classes = config.categorization.severity_classes.len(),
        default_class = %tables.severity().default_class(),
        "Categorization tables loaded"
    );

    let source = build_source(&config, &node_name).await?;

    if once {
        return run_once(&config, source, &tables).await;
    }

    let metrics = MetricsRegistry::new();
    let ctx = ProcessorContext {
        node_name: node_name.clone(),
        tables,
        shutdown: shutdown.clone(),
        metrics,
        default_state_file: config.state_file.clone(),
    };
    let processors = ProcessorRegistry::with_builtin()
        .build_all(&ctx, &config.processors)
        .await
        .context("Failed to set up event processors")?;

    let initial = seed_conditions(&processors).await;
    if !initial.is_empty() {
        info!(count = initial.len(), "Restored active conditions from state");
    }

    // Start metrics server if enabled
    if config.metrics.enabled {
        let port = config.metrics.port;
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port, token).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let watcher_config = config.watcher_config();
    info!(
        poll_interval = %humantime::format_duration(watcher_config.poll_interval),
        query_timeout = %humantime::format_duration(watcher_config.query_timeout),
        drain_timeout = %humantime::format_duration(watcher_config.drain_timeout),
        queue_capacity = watcher_config.queue_capacity,
        "Configuration loaded"
    );

    let watcher = Watcher::new(
        source,
        processors,
        watcher_config,
        node_name,
        metrics,
        shutdown,
    );
    watcher.start(initial).await;

    info!("GHM shutdown complete");
    Ok(())
}

/// Start the Prometheus metrics HTTP server
async fn start_metrics_server(port: u16, shutdown: CancellationToken) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    info!(port = port, "Metrics server listening");

    loop {
        let (mut socket, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..n]);

            let response = if request.starts_with("GET /metrics") {
                let metrics_output = prometheus::TextEncoder::new()
                    .encode_to_string(&prometheus::gather())
                    .unwrap_or_default();
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                    metrics_output.len(),
                    metrics_output
                )
            } else {
                "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
            };

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }

    info!("Metrics server stopped");
    Ok(())
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.log_level(), cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "GHM starting");

    // Load configuration
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        warn!(path = ?cli.config, "Config file not found, using defaults");
        Config::default()
    };

    // Apply CLI overrides
    if cli.node_name.is_some() {
        config.node_name = cli.node_name.clone();
    }
    if let Some(address) = &cli.source_address {
        config.source.kind = SourceKind::Remote;
        config.source.address = address.clone();
    }
    if cli.source_discovery {
        config.source.discovery = true;
    }
    if let Some(path) = &cli.error_mapping_file {
        config.categorization.error_mapping_file = path.clone();
    }
    if let Some(path) = &cli.state_file {
        config.state_file = path.clone();
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }

    // Load node name from environment if not set
    config = config.with_node_name_from_env();

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    // Setup shutdown signal handler
    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    run(config, cli.once, shutdown).await
}
