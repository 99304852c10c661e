use std::sync::Arc;
use std::time::Duration as StdDuration;

use fabric_api::fabric::supervisor_service_client::SupervisorServiceClient;
use fabric_api::fabric::{
    CancelQueryRequest, ContainerDescriptor, ContainerHealth, ContainerRole, GetResultRequest,
    HeartbeatInfo, ListContainersRequest, QueryStatus, SubmitQueryRequest,
};
use fabric_common::{CombineStrategy, CompiledPlan, MemoryCatalog};
use fabric_coordinator::config::Settings as SupervisorSettings;
use fabric_coordinator::{run_server, Coordinator, GrpcWorkerTransport};
use tokio::sync::oneshot;
use tokio::time::sleep;
use tonic::{Code, Request};
use uuid::Uuid;

// Short heartbeat interval so eviction happens within the test.
fn test_settings(port: u16) -> SupervisorSettings {
    SupervisorSettings {
        host: "127.0.0.1".to_string(),
        port,
        heartbeat_interval_ms: 200,
        prune_interval_secs: 1,
        ..SupervisorSettings::default()
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port for test server");
    let port = listener
        .local_addr()
        .expect("Failed to get local address from test listener")
        .port();
    // Released before the server binds it.
    drop(listener);
    port
}

#[tokio::test]
async fn container_registration_heartbeat_and_eviction() {
    let port = free_port();
    let settings = test_settings(port);
    let coordinator = Arc::new(Coordinator::new(
        &settings,
        Arc::new(MemoryCatalog::new()),
        Arc::new(GrpcWorkerTransport::new()),
    ));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = tokio::spawn(run_server(
        settings.clone(),
        Arc::clone(&coordinator),
        shutdown_rx,
    ));
    sleep(StdDuration::from_millis(100)).await;

    let mut client = SupervisorServiceClient::connect(format!("http://127.0.0.1:{port}"))
        .await
        .expect("Failed to connect to test supervisor server");

    // Registration
    let container_id = Uuid::new_v4().to_string();
    let descriptor = ContainerDescriptor {
        id: container_id.clone(),
        role: ContainerRole::Worker as i32,
        address: "127.0.0.1:50000".to_string(),
        capacity: 4,
    };
    let ack = client
        .register_container(Request::new(descriptor.clone()))
        .await
        .expect("RegisterContainer RPC failed")
        .into_inner();
    assert!(ack.accepted, "{}", ack.message);
    assert!(coordinator.registry().get(&container_id).await.is_some());

    let duplicate = client
        .register_container(Request::new(descriptor.clone()))
        .await
        .unwrap()
        .into_inner();
    assert!(!duplicate.accepted);

    let unspecified = client
        .register_container(Request::new(ContainerDescriptor {
            role: ContainerRole::Unspecified as i32,
            ..descriptor.clone()
        }))
        .await
        .unwrap_err();
    assert_eq!(unspecified.code(), Code::InvalidArgument);

    // Heartbeats
    let heartbeat = HeartbeatInfo {
        container_id: container_id.clone(),
        load: 2,
        timestamp: 0,
    };
    assert!(client
        .send_heartbeat(Request::new(heartbeat.clone()))
        .await
        .unwrap()
        .into_inner()
        .ok);
    assert_eq!(coordinator.registry().get(&container_id).await.unwrap().load, 2);

    let unknown = client
        .send_heartbeat(Request::new(HeartbeatInfo {
            container_id: "ghost".to_string(),
            ..heartbeat.clone()
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(!unknown.ok, "unknown containers are told to re-register");

    let listed = client
        .list_containers(Request::new(ListContainersRequest {}))
        .await
        .unwrap()
        .into_inner()
        .containers;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].health, ContainerHealth::Healthy as i32);
    assert_eq!(listed[0].descriptor.as_ref().unwrap().id, container_id);

    // Without heartbeats the container is evicted after three missed sweeps.
    sleep(StdDuration::from_millis(1_200)).await;
    assert!(coordinator.registry().get(&container_id).await.is_none());
    let listed = client
        .list_containers(Request::new(ListContainersRequest {}))
        .await
        .unwrap()
        .into_inner()
        .containers;
    assert!(listed.is_empty());

    shutdown_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
    assert!(coordinator.registry().is_empty().await);
}

#[tokio::test]
async fn query_submission_over_grpc() {
    let port = free_port();
    let settings = test_settings(port);
    let coordinator = Arc::new(Coordinator::new(
        &settings,
        Arc::new(MemoryCatalog::new()),
        Arc::new(GrpcWorkerTransport::new()),
    ));
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = tokio::spawn(run_server(settings, Arc::clone(&coordinator), shutdown_rx));
    sleep(StdDuration::from_millis(100)).await;

    let mut client = SupervisorServiceClient::connect(format!("http://127.0.0.1:{port}"))
        .await
        .unwrap();

    let garbage = client
        .submit_query(Request::new(SubmitQueryRequest {
            plan: vec![0xde, 0xad],
            deadline_ms: 0,
        }))
        .await
        .unwrap_err();
    assert_eq!(garbage.code(), Code::InvalidArgument);

    let empty = CompiledPlan::new("nothing", Vec::<String>::new(), CombineStrategy::Sum);
    let rejected = client
        .submit_query(Request::new(SubmitQueryRequest {
            plan: empty.encode().unwrap(),
            deadline_ms: 0,
        }))
        .await
        .unwrap_err();
    assert_eq!(rejected.code(), Code::InvalidArgument);

    // No workers: the query stays pending until cancelled.
    let plan = CompiledPlan::new("count", ["a", "b"], CombineStrategy::Count);
    let query_id = client
        .submit_query(Request::new(SubmitQueryRequest {
            plan: plan.encode().unwrap(),
            deadline_ms: 10_000,
        }))
        .await
        .unwrap()
        .into_inner()
        .query_id;

    let status = client
        .get_result(Request::new(GetResultRequest {
            query_id: query_id.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.status, QueryStatus::Running as i32);
    assert_eq!(status.progress.unwrap().pending, 2);

    let cancelled = client
        .cancel_query(Request::new(CancelQueryRequest {
            query_id: query_id.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(cancelled.cancelled);
    sleep(StdDuration::from_millis(100)).await;

    let status = client
        .get_result(Request::new(GetResultRequest {
            query_id: query_id.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.status, QueryStatus::Cancelled as i32);
    assert!(status.failure.is_some());

    let missing = client
        .get_result(Request::new(GetResultRequest {
            query_id: "missing".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(missing.code(), Code::NotFound);

    shutdown_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}
