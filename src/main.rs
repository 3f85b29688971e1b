//! fleetops operator
//!
//! Manages and autoscales fleets of self-hosted CI runners on Kubernetes.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig and a Provider token)
//! GITHUB_TOKEN=ghp_xxx fleetops-operator
//!
//! # Run with custom log level
//! RUST_LOG=debug fleetops-operator
//! ```

use clap::Parser;
use fleetops_operator::controllers::{
    AutoscalerController, RunnerController, RunnerDefaults, RunnerDeploymentController,
    RunnerReplicaSetController, RunnerSetController,
};
use fleetops_operator::leader_election::{self, LeaseLock};
use fleetops_operator::provider::{GitHubClient, GitHubConfig};
use fleetops_operator::webhook::{webhook_router, WebhookState};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// fleetops operator
#[derive(Parser, Debug)]
#[command(name = "fleetops-operator")]
#[command(version, about = "Kubernetes operator for self-hosted CI runner fleets")]
struct Args {
    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    leader_election: bool,

    /// Lease name used for leader election
    #[arg(long, default_value = "fleetops-operator")]
    leader_election_id: String,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    leader_election_namespace: String,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, default_value = "")]
    watch_namespace: String,

    /// Metrics and health probe bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_bind_address: String,

    /// Webhook receiver bind address
    #[arg(long, default_value = "0.0.0.0:8000")]
    webhook_bind_address: String,

    /// Shared secret for webhook signature verification (empty disables)
    #[arg(long, default_value = "", env = "WEBHOOK_SECRET")]
    webhook_secret: String,

    /// Minimum frequency at which managed resources are reconciled, in seconds
    #[arg(long, default_value = "60")]
    sync_period_seconds: u64,

    /// Delay before a scale-up may be followed by a scale-down, in seconds
    #[arg(long, default_value = "600")]
    default_scale_down_delay_seconds: u64,

    /// How long Provider metric values are cached, in seconds
    #[arg(long, default_value = "50")]
    provider_api_cache_duration_seconds: u64,

    /// Runner container image used when a template doesn't set one
    #[arg(long, default_value = "fleetops/runner:latest")]
    runner_image: String,

    /// Docker sidecar image used when a template doesn't set one
    #[arg(long, default_value = "docker:dind")]
    docker_image: String,

    /// Default image-pull secret names for runner pods (repeatable)
    #[arg(long = "runner-image-pull-secret")]
    runner_image_pull_secrets: Vec<String>,

    /// Docker registry mirror URL passed to runner daemons
    #[arg(long, default_value = "")]
    docker_registry_mirror: String,

    /// Registration labels inherited by all runners, comma separated
    #[arg(long, default_value = "", value_delimiter = ',')]
    common_runner_labels: Vec<String>,

    /// Storage class for runner hook volumes
    #[arg(long, default_value = "default")]
    runner_hook_storage_class: String,

    /// Size of runner hook volumes
    #[arg(long, default_value = "5Gi")]
    runner_hook_storage_size: String,

    /// Provider personal access token
    #[arg(long, default_value = "", env = "GITHUB_TOKEN")]
    github_token: String,

    /// Provider API base URL (empty for api.github.com)
    #[arg(long, default_value = "", env = "GITHUB_URL")]
    github_url: String,

    /// Log verbosity: debug, info, warn or error
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleetops operator");
    info!("Leader election: {}", args.leader_election);
    info!(
        "Watching namespace: {}",
        if args.watch_namespace.is_empty() {
            "all"
        } else {
            &args.watch_namespace
        }
    );

    let provider = Arc::new(GitHubClient::new(GitHubConfig {
        token: args.github_token.clone(),
        base_url: args.github_url.clone(),
    })?);

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Leader election — acquire lease before starting controllers
    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!("Leader election namespace: {}", ns);
        let lock = LeaseLock::new(client.clone(), &ns, &args.leader_election_id);
        lock.acquire().await;
        Some(Arc::new(lock))
    } else {
        None
    };

    let namespace = if args.watch_namespace.is_empty() {
        None
    } else {
        Some(args.watch_namespace.clone())
    };
    let sync_period = Duration::from_secs(args.sync_period_seconds);
    let defaults = RunnerDefaults {
        runner_image: args.runner_image.clone(),
        docker_image: args.docker_image.clone(),
        image_pull_secrets: args.runner_image_pull_secrets.clone(),
        hook_storage_class: args.runner_hook_storage_class.clone(),
        hook_storage_size: args.runner_hook_storage_size.clone(),
        sync_period,
        ..Default::default()
    };
    let common_runner_labels: Vec<String> = args
        .common_runner_labels
        .iter()
        .filter(|l| !l.is_empty())
        .cloned()
        .collect();

    info!(
        sync_period_seconds = args.sync_period_seconds,
        scale_down_delay_seconds = args.default_scale_down_delay_seconds,
        cache_duration_seconds = args.provider_api_cache_duration_seconds,
        runner_image = %args.runner_image,
        docker_image = %args.docker_image,
        "Operator configuration"
    );

    // Create controllers
    let runner_controller = Arc::new(RunnerController::new(
        client.clone(),
        provider.clone(),
        namespace.clone(),
        defaults.clone(),
    ));
    let replica_set_controller = Arc::new(RunnerReplicaSetController::new(
        client.clone(),
        namespace.clone(),
        sync_period,
    ));
    let deployment_controller = Arc::new(RunnerDeploymentController::new(
        client.clone(),
        namespace.clone(),
        common_runner_labels,
        sync_period,
    ));
    let runner_set_controller = Arc::new(RunnerSetController::new(
        client.clone(),
        provider.clone(),
        namespace.clone(),
        defaults.clone(),
    ));
    let autoscaler_controller = Arc::new(AutoscalerController::new(
        client.clone(),
        provider.clone(),
        namespace.clone(),
        Duration::from_secs(args.provider_api_cache_duration_seconds),
        sync_period,
    ));

    // Run controllers concurrently
    let runner_handle = spawn_controller("runner", {
        let controller = Arc::clone(&runner_controller);
        async move { controller.run().await }
    });
    let replica_set_handle = spawn_controller("runnerreplicaset", {
        let controller = Arc::clone(&replica_set_controller);
        async move { controller.run().await }
    });
    let deployment_handle = spawn_controller("runnerdeployment", {
        let controller = Arc::clone(&deployment_controller);
        async move { controller.run().await }
    });
    let runner_set_handle = spawn_controller("runnerset", {
        let controller = Arc::clone(&runner_set_controller);
        async move { controller.run().await }
    });
    let autoscaler_handle = spawn_controller("horizontalrunnerautoscaler", {
        let controller = Arc::clone(&autoscaler_controller);
        async move { controller.run().await }
    });

    // Webhook receiver
    let webhook_state = WebhookState::new(
        client.clone(),
        namespace.clone(),
        Some(args.webhook_secret.clone()),
    );
    let webhook_addr = args.webhook_bind_address.clone();
    let webhook_handle = tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&webhook_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind webhook address {}: {}", webhook_addr, e);
                return;
            }
        };
        info!("Webhook receiver listening on {}", webhook_addr);
        if let Err(e) = axum::serve(listener, webhook_router(webhook_state)).await {
            error!("Webhook server error: {}", e);
        }
    });

    // Health/metrics endpoint
    let metrics_addr = args.metrics_bind_address.clone();
    let metrics_handle = tokio::spawn(async move {
        let router = axum::Router::new()
            .route("/healthz", axum::routing::get(|| async { "ok" }))
            .route("/readyz", axum::routing::get(|| async { "ok" }));
        let listener = match tokio::net::TcpListener::bind(&metrics_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind metrics address {}: {}", metrics_addr, e);
                return;
            }
        };
        info!("Health endpoint listening on {}", metrics_addr);
        if let Err(e) = axum::serve(listener, router).await {
            error!("Health endpoint error: {}", e);
        }
    });

    // Periodic lease renewal (no-op future when leader election is disabled)
    let elector_for_renew = elector.clone();
    let renew_handle = tokio::spawn(async move {
        match elector_for_renew {
            Some(e) => e.keep_renewing().await,
            None => std::future::pending::<()>().await,
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = runner_handle => {}
        _ = replica_set_handle => {}
        _ = deployment_handle => {}
        _ = runner_set_handle => {}
        _ = autoscaler_handle => {}
        _ = webhook_handle => {
            error!("Webhook server exited");
        }
        _ = metrics_handle => {
            error!("Health endpoint exited");
        }
        _ = renew_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    // Release the lease before exiting so a standby replica can take over immediately
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("fleetops operator shutting down");
    Ok(())
}

fn spawn_controller<F>(name: &'static str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: std::future::Future<Output = fleetops_operator::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!("{} controller error: {}", name, e);
        }
    })
}
