//! Canonical topic builders and SSE event-type labels.
//!
//! Producers never assemble dotted topic strings by hand; the builders here
//! are the only authorized source. Each builder validates its segments so a
//! malformed resource id fails the producing call instead of polluting the
//! subject space.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Legacy system topics kept for existing consumers.
pub const SYSTEM_NOTIFICATION: &str = "system.notification";
pub const SYSTEM_ALERT: &str = "system.alert";
pub const TOPIC_VM_STATUS: &str = "vm.status.update";
pub const TOPIC_VM_RESOURCE: &str = "vm.resource.update";
pub const TOPIC_PROVIDER_STATUS: &str = "provider.status.update";
pub const TOPIC_PROVIDER_INSTANCE: &str = "provider.instance.update";

/// Errors raised by topic builder misuse. These are producer bugs and are
/// surfaced synchronously to the failing REST call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("empty topic segment: {name}")]
    EmptySegment { name: &'static str },

    #[error("invalid character in topic segment {name}: {value:?}")]
    InvalidSegment { name: &'static str, value: String },
}

/// Lifecycle action suffix of every structured topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Updated,
    Deleted,
    List,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
            Action::List => "list",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn check(name: &'static str, value: &str) -> Result<(), TopicError> {
    if value.is_empty() {
        return Err(TopicError::EmptySegment { name });
    }
    if value.contains(['.', '*', '>', ' ']) {
        return Err(TopicError::InvalidSegment {
            name,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// `kubernetes.{provider}.{credential_id}.{region}.clusters.{action}`
pub fn kubernetes_cluster(
    provider: &str,
    credential_id: &str,
    region: &str,
    action: Action,
) -> Result<String, TopicError> {
    check("provider", provider)?;
    check("credential_id", credential_id)?;
    check("region", region)?;
    Ok(format!(
        "kubernetes.{provider}.{credential_id}.{region}.clusters.{action}"
    ))
}

/// `kubernetes.{provider}.{credential_id}.clusters.{cluster_id}.nodepools.{action}`
pub fn kubernetes_nodepool(
    provider: &str,
    credential_id: &str,
    cluster_id: &str,
    action: Action,
) -> Result<String, TopicError> {
    check("provider", provider)?;
    check("credential_id", credential_id)?;
    check("cluster_id", cluster_id)?;
    Ok(format!(
        "kubernetes.{provider}.{credential_id}.clusters.{cluster_id}.nodepools.{action}"
    ))
}

/// `kubernetes.{provider}.{credential_id}.clusters.{cluster_id}.nodes.{action}`
pub fn kubernetes_node(
    provider: &str,
    credential_id: &str,
    cluster_id: &str,
    action: Action,
) -> Result<String, TopicError> {
    check("provider", provider)?;
    check("credential_id", credential_id)?;
    check("cluster_id", cluster_id)?;
    Ok(format!(
        "kubernetes.{provider}.{credential_id}.clusters.{cluster_id}.nodes.{action}"
    ))
}

/// `network.{provider}.{credential_id}.{region}.vpcs.{action}`
pub fn network_vpc(
    provider: &str,
    credential_id: &str,
    region: &str,
    action: Action,
) -> Result<String, TopicError> {
    check("provider", provider)?;
    check("credential_id", credential_id)?;
    check("region", region)?;
    Ok(format!(
        "network.{provider}.{credential_id}.{region}.vpcs.{action}"
    ))
}

/// `network.{provider}.{credential_id}.vpcs.{vpc_id}.subnets.{action}`
pub fn network_subnet(
    provider: &str,
    credential_id: &str,
    vpc_id: &str,
    action: Action,
) -> Result<String, TopicError> {
    check("provider", provider)?;
    check("credential_id", credential_id)?;
    check("vpc_id", vpc_id)?;
    Ok(format!(
        "network.{provider}.{credential_id}.vpcs.{vpc_id}.subnets.{action}"
    ))
}

/// `network.{provider}.{credential_id}.{region}.security-groups.{action}`
pub fn network_security_group(
    provider: &str,
    credential_id: &str,
    region: &str,
    action: Action,
) -> Result<String, TopicError> {
    check("provider", provider)?;
    check("credential_id", credential_id)?;
    check("region", region)?;
    Ok(format!(
        "network.{provider}.{credential_id}.{region}.security-groups.{action}"
    ))
}

/// `vm.{provider}.{credential_id}[.{region}].{action}`
///
/// Omitted region means process-wide scope for the VM class.
pub fn vm(
    provider: &str,
    credential_id: &str,
    region: Option<&str>,
    action: Action,
) -> Result<String, TopicError> {
    check("provider", provider)?;
    check("credential_id", credential_id)?;
    match region {
        Some(region) => {
            check("region", region)?;
            Ok(format!("vm.{provider}.{credential_id}.{region}.{action}"))
        }
        None => Ok(format!("vm.{provider}.{credential_id}.{action}")),
    }
}

/// `workspace.{workspace_id}.{action}`
pub fn workspace(workspace_id: &str, action: Action) -> Result<String, TopicError> {
    check("workspace_id", workspace_id)?;
    Ok(format!("workspace.{workspace_id}.{action}"))
}

/// `credential.{workspace_id}.{provider}.{action}`
pub fn credential(
    workspace_id: &str,
    provider: &str,
    action: Action,
) -> Result<String, TopicError> {
    check("workspace_id", workspace_id)?;
    check("provider", provider)?;
    Ok(format!("credential.{workspace_id}.{provider}.{action}"))
}

/// Resource family of an event type, used by the SSE matching rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFamily {
    /// `system.notification` / `system.alert`: delivered unconditionally
    System,
    /// VM lifecycle and the legacy `vm.status.update` / `vm.resource.update`
    Vm,
    /// Legacy `provider.status.update` / `provider.instance.update`
    Provider,
    /// Cluster, node pool, and node events: filter sets apply
    Kubernetes,
    /// VPC, subnet, and security group events: filter sets apply
    Network,
    /// Workspace, credential, and anything else
    Other,
}

impl EventFamily {
    /// Classify an event type. Works on both dotted topics and the dashed
    /// SSE labels derived from them, since the leading segment is shared.
    pub fn of(event_type: &str) -> Self {
        let head = event_type
            .split(['.', '-'])
            .next()
            .unwrap_or(event_type);
        match head {
            "system" => EventFamily::System,
            "vm" => EventFamily::Vm,
            "provider" => EventFamily::Provider,
            "kubernetes" => EventFamily::Kubernetes,
            "network" => EventFamily::Network,
            _ => EventFamily::Other,
        }
    }
}

fn singular(sub_resource: &str) -> &str {
    match sub_resource {
        "clusters" => "cluster",
        "nodepools" => "nodepool",
        "nodes" => "node",
        "vpcs" => "vpc",
        "subnets" => "subnet",
        "security-groups" => "security-group",
        other => other,
    }
}

/// Derive the SSE `event:` label for a topic.
///
/// Structured resource topics collapse to `{class}-{resource}-{action}`
/// (e.g. `network.aws.cred-1.us-east-1.vpcs.created` ⇒ `network-vpc-created`);
/// legacy system topics pass through unchanged so existing subscribers keep
/// working.
pub fn sse_event_label(topic: &str) -> String {
    match topic {
        SYSTEM_NOTIFICATION | SYSTEM_ALERT | TOPIC_VM_STATUS | TOPIC_VM_RESOURCE
        | TOPIC_PROVIDER_STATUS | TOPIC_PROVIDER_INSTANCE => return topic.to_string(),
        _ => {}
    }

    let segments: Vec<&str> = topic.split('.').collect();
    let (Some(&class), Some(&action)) = (segments.first(), segments.last()) else {
        return topic.to_string();
    };

    match class {
        "kubernetes" | "network" if segments.len() >= 3 => {
            let sub = segments[segments.len() - 2];
            format!("{class}-{}-{action}", singular(sub))
        }
        "vm" => format!("vm-{action}"),
        "workspace" => format!("workspace-{action}"),
        "credential" => format!("credential-{action}"),
        _ => topic.to_string(),
    }
}
