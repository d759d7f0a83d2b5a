use futures::StreamExt;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use kvela::config::ControllerConfig;
use kvela::controller::cluster::KubeCluster;
use kvela::controller::events::KubeEventRecorder;
use kvela::controller::plan::BatchPlanExecutor;
use kvela::controller::{error_policy, reconcile, Context};
use kvela::crd::app_rollout::AppRollout;
use kvela::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting kvela AppRollout controller");

    let config = ControllerConfig::from_env();
    info!(
        reconcile_timeout = ?config.reconcile_timeout,
        status_retries = config.status_retries,
        health_port = config.health_port,
        namespace = ?config.namespace,
        "Loaded controller configuration"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics()?;

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_port = config.health_port;
    let health_handle = tokio::spawn(async move {
        if let Err(e) =
            run_health_server(health_port, health_readiness, health_metrics, shutdown_signal).await
        {
            warn!(error = %e, "Health server failed");
        }
    });

    let rollouts = match &config.namespace {
        Some(ns) => {
            info!(namespace = %ns, "Watching AppRollouts in a single namespace");
            Api::<AppRollout>::namespaced(client.clone(), ns)
        }
        None => Api::<AppRollout>::all(client.clone()),
    };

    let cluster = Arc::new(KubeCluster::new(client.clone()));
    let executor = Arc::new(BatchPlanExecutor::new(cluster.clone()));
    let recorder = Arc::new(KubeEventRecorder::new(client.clone()));
    let ctx = Arc::new(Context::new(
        cluster,
        executor,
        recorder,
        config,
        Some(metrics),
    ));

    readiness.set_ready();
    info!("Controller ready, starting reconciliation loop");

    // error_policy already logs failures
    let controller = Controller::new(rollouts, watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok((rollout, _)) = res {
                info!(rollout = %rollout.name, namespace = ?rollout.namespace, "Reconciled");
            }
        });

    tokio::select! {
        _ = controller => {
            info!("Controller stream ended");
        }
        signal = wait_for_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "Initiating graceful shutdown"),
                Err(e) => error!(error = %e, "Cannot listen for termination signals, shutting down"),
            }
            readiness.set_not_ready();
        }
    }

    shutdown_controller.shutdown();
    if let Err(e) = health_handle.await {
        warn!(error = %e, "Health server task failed");
    }

    info!("kvela controller shut down gracefully");
    Ok(())
}
