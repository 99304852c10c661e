use std::sync::Arc;
use std::time::Duration;

use fabric_api::fabric as pb;
use fabric_api::fabric::supervisor_service_server::SupervisorService;
use fabric_common::ContainerDescriptor;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::error::CoordinatorError;
use crate::query::{FailureReason, QueryState, QueryStatus, StructuredFailure};
use crate::registry::Container;
use crate::supervisor::Coordinator;

pub struct SupervisorServiceImpl {
    coordinator: Arc<Coordinator>,
}

impl SupervisorServiceImpl {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[tonic::async_trait]
impl SupervisorService for SupervisorServiceImpl {
    async fn register_container(
        &self,
        request: Request<pb::ContainerDescriptor>,
    ) -> Result<Response<pb::RegistrationAck>, Status> {
        let descriptor = ContainerDescriptor::try_from(request.into_inner())
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let id = descriptor.id.clone();
        let ack = match self.coordinator.registry().register(descriptor).await {
            Ok(()) => pb::RegistrationAck {
                accepted: true,
                message: format!("container {id} registered"),
            },
            Err(err @ CoordinatorError::DuplicateId(_)) => pb::RegistrationAck {
                accepted: false,
                message: err.to_string(),
            },
            Err(err) => return Err(err.into()),
        };
        Ok(Response::new(ack))
    }

    async fn send_heartbeat(
        &self,
        request: Request<pb::HeartbeatInfo>,
    ) -> Result<Response<pb::HeartbeatResponse>, Status> {
        let info = request.into_inner();
        let ok = match self
            .coordinator
            .registry()
            .heartbeat(&info.container_id, info.load)
            .await
        {
            Ok(()) => true,
            Err(CoordinatorError::UnknownContainer(id)) => {
                warn!(container_id = %id, "heartbeat from unregistered container");
                false
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Response::new(pb::HeartbeatResponse { ok }))
    }

    async fn submit_query(
        &self,
        request: Request<pb::SubmitQueryRequest>,
    ) -> Result<Response<pb::SubmitQueryResponse>, Status> {
        let req = request.into_inner();
        let deadline = (req.deadline_ms > 0).then(|| Duration::from_millis(req.deadline_ms));
        let query_id = self.coordinator.submit(&req.plan, deadline).await?;
        Ok(Response::new(pb::SubmitQueryResponse { query_id }))
    }

    async fn get_result(
        &self,
        request: Request<pb::GetResultRequest>,
    ) -> Result<Response<pb::GetResultResponse>, Status> {
        let query_id = request.into_inner().query_id;
        let status = self.coordinator.get_result(&query_id)?;
        debug!(%query_id, state = %status.state(), "result polled");
        Ok(Response::new(result_response(query_id, &status)?))
    }

    async fn cancel_query(
        &self,
        request: Request<pb::CancelQueryRequest>,
    ) -> Result<Response<pb::CancelQueryResponse>, Status> {
        let query_id = request.into_inner().query_id;
        let cancelled = self.coordinator.cancel(&query_id)?;
        Ok(Response::new(pb::CancelQueryResponse { cancelled }))
    }

    async fn list_containers(
        &self,
        _request: Request<pb::ListContainersRequest>,
    ) -> Result<Response<pb::ListContainersResponse>, Status> {
        let containers = self
            .coordinator
            .list_containers()
            .await
            .iter()
            .map(container_status)
            .collect::<Vec<_>>();
        info!(count = containers.len(), "listing containers");
        Ok(Response::new(pb::ListContainersResponse { containers }))
    }
}

fn result_response(query_id: String, status: &QueryStatus) -> Result<pb::GetResultResponse, Status> {
    let mut response = pb::GetResultResponse {
        query_id,
        status: query_state(status.state()) as i32,
        result: Vec::new(),
        failure: None,
        progress: None,
    };
    match status {
        QueryStatus::Running(progress) => {
            response.progress = Some(pb::QueryProgress {
                total: progress.total,
                succeeded: progress.succeeded,
                in_flight: progress.in_flight,
                pending: progress.pending,
            });
        }
        QueryStatus::Succeeded(result) => {
            response.result = result
                .encode()
                .map_err(|e| Status::internal(e.to_string()))?;
        }
        QueryStatus::Failed(failure) => response.failure = Some(structured_failure(failure)),
    }
    Ok(response)
}

fn query_state(state: QueryState) -> pb::QueryStatus {
    match state {
        QueryState::Running => pb::QueryStatus::Running,
        QueryState::Succeeded => pb::QueryStatus::Succeeded,
        QueryState::Failed => pb::QueryStatus::Failed,
        QueryState::Cancelled => pb::QueryStatus::Cancelled,
    }
}

fn structured_failure(failure: &StructuredFailure) -> pb::StructuredFailure {
    let reason = match failure.reason {
        FailureReason::RetryLimitExceeded => pb::FailureReason::RetryLimitExceeded,
        FailureReason::DeadlineExceeded => pb::FailureReason::DeadlineExceeded,
        FailureReason::Cancelled => pb::FailureReason::Cancelled,
        FailureReason::Internal => pb::FailureReason::Internal,
    };
    pb::StructuredFailure {
        query_id: failure.query_id.clone(),
        reason: reason as i32,
        partitions: failure
            .partitions
            .iter()
            .map(|p| pb::PartitionFailure {
                partition_key: p.partition_key.to_string(),
                attempts: p.attempts,
                last_error: p.last_error.clone().unwrap_or_default(),
            })
            .collect(),
        message: failure.message.clone(),
    }
}

fn container_status(container: &Container) -> pb::ContainerStatus {
    pb::ContainerStatus {
        descriptor: Some(pb::ContainerDescriptor::from(&container.descriptor)),
        load: container.load,
        health: pb::ContainerHealth::from(container.health) as i32,
        missed_heartbeats: container.missed_heartbeats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{PartitionFailure, QueryProgress};
    use fabric_common::{ExecutionMetrics, PartitionKey, QueryResult, ResultValue};

    #[test]
    fn running_status_carries_progress() {
        let progress = QueryProgress {
            total: 3,
            succeeded: 1,
            in_flight: 1,
            pending: 1,
        };
        let response = result_response("q".to_string(), &QueryStatus::Running(progress)).unwrap();
        assert_eq!(response.status, pb::QueryStatus::Running as i32);
        assert_eq!(response.progress.unwrap().succeeded, 1);
        assert!(response.failure.is_none());
    }

    #[test]
    fn succeeded_status_carries_encoded_result() {
        let result = QueryResult {
            value: ResultValue::Scalar(Some(42)),
            metrics: ExecutionMetrics::default(),
        };
        let response = result_response(
            "q".to_string(),
            &QueryStatus::Succeeded(Arc::new(result.clone())),
        )
        .unwrap();
        assert_eq!(response.status, pb::QueryStatus::Succeeded as i32);
        assert_eq!(QueryResult::decode(&response.result).unwrap(), result);
    }

    #[test]
    fn failure_names_partitions() {
        let failure = StructuredFailure {
            query_id: "q".to_string(),
            reason: FailureReason::DeadlineExceeded,
            partitions: vec![PartitionFailure {
                partition_key: PartitionKey::from("c"),
                attempts: 1,
                last_error: None,
            }],
            message: "late".to_string(),
        };
        let response = result_response("q".to_string(), &QueryStatus::Failed(failure)).unwrap();
        assert_eq!(response.status, pb::QueryStatus::Failed as i32);
        let failure = response.failure.unwrap();
        assert_eq!(failure.reason, pb::FailureReason::DeadlineExceeded as i32);
        assert_eq!(failure.partitions[0].partition_key, "c");
        assert_eq!(failure.partitions[0].last_error, "");
    }
}
