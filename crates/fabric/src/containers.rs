use anyhow::{Context, Result};
use fabric_api::fabric as pb;
use fabric_api::fabric::supervisor_service_client::SupervisorServiceClient;

/// Prints the supervisor's registry membership.
pub async fn execute(supervisor: &str) -> Result<()> {
    let mut client = SupervisorServiceClient::connect(supervisor.to_string())
        .await
        .with_context(|| format!("failed to connect to supervisor at {supervisor}"))?;
    let response = client
        .list_containers(pb::ListContainersRequest {})
        .await
        .context("ListContainers failed")?
        .into_inner();

    if response.containers.is_empty() {
        println!("no containers registered");
        return Ok(());
    }
    println!(
        "{:<24} {:<10} {:<24} {:>8} {:>5} {:<8} {:>6}",
        "ID", "ROLE", "ADDRESS", "CAPACITY", "LOAD", "HEALTH", "MISSED"
    );
    for status in &response.containers {
        println!("{}", format_row(status));
    }
    Ok(())
}

fn format_row(status: &pb::ContainerStatus) -> String {
    let (id, role, address, capacity) = match &status.descriptor {
        Some(d) => (d.id.as_str(), role_label(d.role()), d.address.as_str(), d.capacity),
        None => ("?", "?", "?", 0),
    };
    format!(
        "{:<24} {:<10} {:<24} {:>8} {:>5} {:<8} {:>6}",
        id,
        role,
        address,
        capacity,
        status.load,
        health_label(status.health()),
        status.missed_heartbeats
    )
}

fn role_label(role: pb::ContainerRole) -> &'static str {
    match role {
        pb::ContainerRole::Supervisor => "supervisor",
        pb::ContainerRole::Worker => "worker",
        pb::ContainerRole::Unspecified => "unknown",
    }
}

fn health_label(health: pb::ContainerHealth) -> &'static str {
    match health {
        pb::ContainerHealth::Healthy => "healthy",
        pb::ContainerHealth::Suspect => "suspect",
        pb::ContainerHealth::Dead => "dead",
        pb::ContainerHealth::Unspecified => "unknown",
    }
}
