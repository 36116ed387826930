// HiveDB Platform server.
//
// One binary, four modes: control-plane, tenant-node, gateway, and
// all-in-one for development. Exit code 0 on clean shutdown, non-zero on
// fatal bootstrap errors.

use std::sync::Arc;

use hivedb::config::{Mode, PlatformConfig};
use hivedb::controlplane::ControlPlane;
use hivedb::gateway::Gateway;
use hivedb::objectstore::{FsObjectStore, ObjectStore};
use hivedb::worker::WorkerNode;
use hivedb::VERSION;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match PlatformConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    info!(version = VERSION, mode = %config.mode, node = %config.node_id, "starting hivedb");

    if let Err(e) = run(config).await {
        error!(error = %e, "fatal error");
        std::process::exit(1);
    }
    info!("clean shutdown");
}

/// Local object store root. Deployments with a real S3 endpoint point the
/// external replicator at it; the in-process store always has a local
/// filesystem root to work against.
fn build_object_store(config: &PlatformConfig) -> Arc<dyn ObjectStore> {
    if !config.s3.endpoint.is_empty() {
        info!(endpoint = %config.s3.endpoint, bucket = %config.s3.bucket, "object store target configured");
    }
    Arc::new(FsObjectStore::new(config.data_dir.join("objects")))
}

async fn run(config: PlatformConfig) -> hivedb::Result<()> {
    let mut control_plane: Option<ControlPlane> = None;
    let mut worker: Option<WorkerNode> = None;
    let mut gateway: Option<Gateway> = None;

    match config.mode {
        Mode::ControlPlane => {
            control_plane = Some(ControlPlane::start(&config).await?);
        }
        Mode::TenantNode => {
            let store = build_object_store(&config);
            worker = Some(WorkerNode::start(&config, store).await?);
        }
        Mode::Gateway => {
            gateway = Some(Gateway::start(&config).await?);
        }
        Mode::AllInOne => {
            control_plane = Some(ControlPlane::start(&config).await?);
            let store = build_object_store(&config);
            worker = Some(WorkerNode::start(&config, store).await?);
            gateway = Some(Gateway::start(&config).await?);
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // Stop edge-first so nothing routes into a stopping worker.
    if let Some(mut g) = gateway.take() {
        g.stop().await;
    }
    if let Some(mut w) = worker.take() {
        w.stop().await;
    }
    if let Some(mut cp) = control_plane.take() {
        cp.stop().await;
    }
    Ok(())
}
