use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};

use portainer_operator::health::{run_health_server, HealthState};
use portainer_operator::resources::read_namespace;
use portainer_operator::run_operator_scoped;

/// Lease configuration
const LEASE_NAME: &str = "portainer-operator-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install the TLS crypto provider before any TLS operations
    // Note: install_default() may fail if called multiple times (e.g., in tests),
    // but a single failure during startup is fatal since TLS won't work
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(
            "Failed to install rustls crypto provider and no provider is available".into(),
        );
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("portainer_operator=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    info!("Starting portainer-operator");

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let app_name = std::env::var("APP_NAME").unwrap_or_else(|_| "portainer".to_string());

    // Get pod identity for leader election
    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = match std::env::var("POD_NAMESPACE") {
        Ok(ns) => ns,
        Err(_) => read_namespace()?,
    };

    info!(
        holder_id = %pod_name,
        namespace = %namespace,
        lease_name = LEASE_NAME,
        "Initializing leader election"
    );

    // Create shared health state and start the health server immediately
    // (probes should work even as non-leader)
    let health_state = Arc::new(HealthState::new());
    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!("Health server error: {}", e);
            }
        })
    };

    // Track leadership status. Losing or lacking leadership is not fatal:
    // cluster-wide mutations defer until the lease is held, while per-unit
    // work (the workload itself) continues.
    let is_leader = Arc::new(AtomicBool::new(false));
    let lease_handle = {
        let is_leader = is_leader.clone();
        let lease_lock = LeaseLock::new(
            client.clone(),
            &namespace,
            LeaseLockParams {
                holder_id: pod_name,
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
            },
        );

        tokio::spawn(async move {
            loop {
                match lease_lock.try_acquire_or_renew().await {
                    Ok(result) => {
                        let was_leader = is_leader.swap(result.acquired_lease, Ordering::SeqCst);
                        if result.acquired_lease && !was_leader {
                            info!("Acquired leadership");
                        } else if !result.acquired_lease && was_leader {
                            warn!("Lost leadership");
                        }
                    }
                    Err(e) => {
                        warn!("Failed to acquire or renew lease: {}", e);
                        is_leader.store(false, Ordering::SeqCst);
                    }
                }
                tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
            }
        })
    };

    // Start the charm event loop
    let operator_handle = {
        let operator_client = client.clone();
        let health_state = health_state.clone();
        let is_leader = is_leader.clone();
        let ns = namespace.clone();
        tokio::spawn(async move {
            if let Err(e) = run_operator_scoped(
                operator_client,
                &app_name,
                &ns,
                is_leader,
                Some(health_state),
            )
            .await
            {
                error!("Operator error: {}", e);
            }
        })
    };

    // Wait for any task to complete (or fail), or shutdown signal
    tokio::select! {
        result = operator_handle => {
            if let Err(e) = result {
                error!("Operator task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        result = lease_handle => {
            if let Err(e) = result {
                error!("Lease renewal task panicked: {}", e);
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, shutting down");
            health_state.set_ready(false).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
