// End-to-end: a single-peer control plane, one worker, and a gateway,
// wired over real sockets. Covers create -> assign -> route -> serve, the
// 400 on missing tenant identity, and circuit breaking toward a dead
// worker.

use std::sync::Arc;

use hivedb::config::{Mode, PlatformConfig};
use hivedb::controlplane::ControlPlane;
use hivedb::gateway::Gateway;
use hivedb::objectstore::FsObjectStore;
use hivedb::registry::types::{NodeInfo, PlacementDecision, Tenant};
use hivedb::worker::WorkerNode;

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

struct Cluster {
    cp: ControlPlane,
    worker: WorkerNode,
    gateway: Gateway,
    gateway_port: u16,
    _cp_dir: tempfile::TempDir,
    worker_dir: tempfile::TempDir,
}

async fn start_cluster() -> Cluster {
    let cp_dir = tempfile::tempdir().unwrap();
    let worker_dir = tempfile::tempdir().unwrap();
    let ipc_port = free_port().await;
    let worker_port = free_port().await;
    let gateway_port = free_port().await;
    let ipc_addr = format!("127.0.0.1:{}", ipc_port);

    let cp_cfg = PlatformConfig {
        mode: Mode::ControlPlane,
        node_id: "cp-1".to_string(),
        ipc_bind_addr: ipc_addr.clone(),
        data_dir: cp_dir.path().to_path_buf(),
        control_plane_addrs: vec![ipc_addr.clone()],
        jwt_secret: "secret".to_string(),
        ..PlatformConfig::default()
    };
    let cp = ControlPlane::start(&cp_cfg).await.unwrap();

    let worker_cfg = PlatformConfig {
        mode: Mode::TenantNode,
        node_id: "n_a".to_string(),
        data_dir: worker_dir.path().to_path_buf(),
        control_plane_addrs: vec![ipc_addr.clone()],
        node_address: format!("http://127.0.0.1:{}", worker_port),
        max_tenants: 100,
        ..PlatformConfig::default()
    };
    let object_store = Arc::new(FsObjectStore::new(worker_dir.path().join("objects")));
    let worker = WorkerNode::start(&worker_cfg, object_store).await.unwrap();

    let gateway_cfg = PlatformConfig {
        mode: Mode::Gateway,
        node_id: "g-1".to_string(),
        control_plane_addrs: vec![ipc_addr],
        http_bind_addr: format!("127.0.0.1:{}", gateway_port),
        jwt_secret: "secret".to_string(),
        ..PlatformConfig::default()
    };
    let gateway = Gateway::start(&gateway_cfg).await.unwrap();

    Cluster {
        cp,
        worker,
        gateway,
        gateway_port,
        _cp_dir: cp_dir,
        worker_dir,
    }
}

async fn stop_cluster(mut cluster: Cluster) {
    cluster.gateway.stop().await;
    cluster.worker.stop().await;
    cluster.cp.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_assign_route_and_serve() {
    let cluster = start_cluster().await;

    cluster
        .cp
        .store()
        .create_tenant(Tenant::new("ten_1", "t1.example.com", "u_1"))
        .await
        .unwrap();

    // Seed the tenant database locally so the load skips the restore.
    let db_path = cluster
        .worker_dir
        .path()
        .join("tenants")
        .join("ten_1")
        .join("data.db");
    tokio::fs::create_dir_all(db_path.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&db_path, b"").await.unwrap();

    let http = reqwest::Client::new();
    let response = http
        .post(format!(
            "http://127.0.0.1:{}/api/items",
            cluster.gateway_port
        ))
        .header("X-Tenant-ID", "ten_1")
        .body("insert hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["result"], "ok");

    // The first request forced placement onto the only worker.
    let tenant = cluster.cp.store().get_tenant(&"ten_1".to_string()).unwrap();
    assert_eq!(tenant.assigned_node_id.as_deref(), Some("n_a"));
    let placement = cluster
        .cp
        .store()
        .get_placement(&"ten_1".to_string())
        .unwrap();
    assert_eq!(placement.node_id, "n_a");
    assert_eq!(placement.reason, "least-loaded");

    // The statement landed in the tenant database.
    let contents = tokio::fs::read_to_string(&db_path).await.unwrap();
    assert!(contents.contains("insert hello"));

    stop_cluster(cluster).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_without_identity_is_400() {
    let cluster = start_cluster().await;

    let http = reqwest::Client::new();
    let response = http
        .get(format!("http://127.0.0.1:{}/", cluster.gateway_port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    stop_cluster(cluster).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_breaker_opens_toward_dead_worker() {
    let cluster = start_cluster().await;
    let dead_port = free_port().await;

    cluster
        .cp
        .store()
        .create_tenant(Tenant::new("ten_dead", "dead.example.com", "u_1"))
        .await
        .unwrap();
    let mut dead_node = NodeInfo::new("n_dead", format!("http://127.0.0.1:{}", dead_port), 100);
    dead_node.last_heartbeat = hivedb::common::now();
    cluster.cp.store().save_node(dead_node).await.unwrap();
    cluster
        .cp
        .store()
        .save_placement(PlacementDecision {
            tenant_id: "ten_dead".to_string(),
            node_id: "n_dead".to_string(),
            node_address: format!("http://127.0.0.1:{}", dead_port),
            reason: "least-loaded".to_string(),
            decided_at: hivedb::common::now(),
        })
        .await
        .unwrap();

    let http = reqwest::Client::new();
    let mut saw_bad_gateway = false;
    let mut saw_circuit_open = false;
    for _ in 0..8 {
        let response = http
            .get(format!("http://127.0.0.1:{}/", cluster.gateway_port))
            .header("X-Tenant-ID", "ten_dead")
            .send()
            .await
            .unwrap();
        match response.status().as_u16() {
            502 => saw_bad_gateway = true,
            503 => {
                saw_circuit_open = true;
                break;
            }
            other => panic!("unexpected status {}", other),
        }
    }
    assert!(saw_bad_gateway, "expected forward failures first");
    assert!(saw_circuit_open, "breaker never opened");

    stop_cluster(cluster).await;
}
