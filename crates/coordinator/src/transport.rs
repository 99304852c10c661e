//! The RPC channel from the supervisor to its workers.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use fabric_api::fabric::worker_service_client::WorkerServiceClient;
use fabric_api::fabric::{CancelParticleRequest, ParticleRequest};
use fabric_common::{ParticleError, PartialResult, PartitionKey};
use tonic::transport::Channel;
use tracing::{debug, warn};

/// Where to reach a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    pub id: String,
    pub address: String,
}

/// Everything a worker needs to run one particle attempt.
#[derive(Debug, Clone)]
pub struct ParticleAssignment {
    pub query_id: String,
    pub partition_key: PartitionKey,
    pub attempt: u32,
    /// bincode-encoded compiled plan, shared by every particle of the query.
    pub plan: Arc<Vec<u8>>,
}

/// Sends particles to workers.
///
/// Implementations must report failures to reach the worker as
/// [`ParticleErrorKind::Transport`](fabric_common::ParticleErrorKind) and
/// failures reported by the worker as `WorkerExecution`.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn execute_particle(
        &self,
        worker: &WorkerEndpoint,
        assignment: ParticleAssignment,
    ) -> Result<PartialResult, ParticleError>;

    /// Best effort; callers never wait on the outcome for correctness.
    async fn cancel_particle(
        &self,
        worker: &WorkerEndpoint,
        query_id: &str,
        partition_key: &PartitionKey,
        attempt: u32,
    ) -> Result<(), ParticleError>;
}

/// [`WorkerTransport`] over the generated tonic client, one cached channel
/// per worker address.
#[derive(Default)]
pub struct GrpcWorkerTransport {
    clients: DashMap<String, WorkerServiceClient<Channel>>,
}

impl GrpcWorkerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self, address: &str) -> Result<WorkerServiceClient<Channel>, ParticleError> {
        if let Some(client) = self.clients.get(address) {
            return Ok(client.clone());
        }
        let client = WorkerServiceClient::connect(endpoint_uri(address))
            .await
            .map_err(|e| ParticleError::transport(format!("connect to {address}: {e}")))?;
        self.clients.insert(address.to_string(), client.clone());
        Ok(client)
    }

    fn forget(&self, address: &str) {
        self.clients.remove(address);
    }
}

fn endpoint_uri(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

#[async_trait]
impl WorkerTransport for GrpcWorkerTransport {
    async fn execute_particle(
        &self,
        worker: &WorkerEndpoint,
        assignment: ParticleAssignment,
    ) -> Result<PartialResult, ParticleError> {
        let mut client = self.client(&worker.address).await?;
        let request = ParticleRequest {
            query_id: assignment.query_id.clone(),
            partition_key: assignment.partition_key.to_string(),
            plan: assignment.plan.as_ref().clone(),
            attempt: assignment.attempt,
        };
        let response = match client.execute_particle(request).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                // The channel may be stale; reconnect on the next attempt.
                self.forget(&worker.address);
                return Err(ParticleError::transport(format!(
                    "{}: {}",
                    worker.id,
                    status.message()
                )));
            }
        };
        if response.attempt != assignment.attempt {
            warn!(
                worker_id = %worker.id,
                expected = assignment.attempt,
                got = response.attempt,
                "worker echoed a different attempt"
            );
        }
        if !response.success {
            return Err(ParticleError::worker(response.error));
        }
        PartialResult::decode(&response.partial)
            .map_err(|e| ParticleError::worker(format!("undecodable partial result: {e}")))
    }

    async fn cancel_particle(
        &self,
        worker: &WorkerEndpoint,
        query_id: &str,
        partition_key: &PartitionKey,
        attempt: u32,
    ) -> Result<(), ParticleError> {
        let mut client = self.client(&worker.address).await?;
        let response = client
            .cancel_particle(CancelParticleRequest {
                query_id: query_id.to_string(),
                partition_key: partition_key.to_string(),
                attempt,
            })
            .await
            .map_err(|status| ParticleError::transport(status.message().to_string()))?;
        debug!(
            worker_id = %worker.id,
            %query_id,
            partition = %partition_key,
            attempt,
            cancelled = response.into_inner().cancelled,
            "cancel sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_addresses_get_a_scheme() {
        assert_eq!(endpoint_uri("127.0.0.1:7000"), "http://127.0.0.1:7000");
        assert_eq!(endpoint_uri("http://w:1"), "http://w:1");
    }

    #[tokio::test]
    async fn unreachable_worker_is_a_transport_error() {
        let transport = GrpcWorkerTransport::new();
        let worker = WorkerEndpoint {
            id: "w-1".to_string(),
            address: "127.0.0.1:1".to_string(),
        };
        let err = transport
            .execute_particle(
                &worker,
                ParticleAssignment {
                    query_id: "q".to_string(),
                    partition_key: PartitionKey::from("a"),
                    attempt: 1,
                    plan: Arc::new(Vec::new()),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, fabric_common::ParticleErrorKind::Transport);
    }
}
