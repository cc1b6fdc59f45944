//! OSRM Kubernetes Operator
//!
//! This operator manages OSRM routing clusters on Kubernetes.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! osrm-operator
//!
//! # Run with custom log level
//! RUST_LOG=debug osrm-operator
//! ```

use clap::Parser;
use kube::Client;
use osrm_operator::leader_election::LeaderLease;
use osrm_operator::ClusterController;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// OSRM Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "osrm-operator")]
#[command(version, about = "Kubernetes Operator for OSRM routing clusters")]
struct Args {
    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    leader_election_namespace: String,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, default_value = "")]
    namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    info!("Starting OSRM Kubernetes Operator");
    info!("Leader election: {}", args.leader_election);
    info!(
        "Watching namespace: {}",
        if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        }
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Leader election: block until this replica holds the lease before
    // starting the controller
    let lease = if args.leader_election {
        let lease = Arc::new(LeaderLease::new(
            client.clone(),
            &args.leader_election_namespace,
        ));
        lease.acquire().await?;
        Some(lease)
    } else {
        None
    };

    // Create the controller
    let cluster_controller = if args.namespace.is_empty() {
        Arc::new(ClusterController::new(client.clone()))
    } else {
        Arc::new(ClusterController::namespaced(client.clone(), &args.namespace))
    };

    let cluster_handle = {
        let controller = Arc::clone(&cluster_controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!("Cluster controller error: {}", e);
            }
        })
    };

    // Hold the lease for the life of the process; the future resolves only
    // when leadership is lost (never, when leader election is disabled)
    let lease_for_hold = lease.clone();
    let leadership = async move {
        match lease_for_hold {
            Some(l) => l.hold().await,
            None => std::future::pending::<()>().await,
        }
    };

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = cluster_handle => {
            if let Err(e) = result {
                error!("Cluster controller task failed: {}", e);
            }
        }
        _ = leadership => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    // Release the lease before exiting so a standby replica can take over immediately
    if let Some(l) = &lease {
        l.release().await;
    }

    info!("OSRM Operator shutting down");
    Ok(())
}
