//! Container runtime capability — the seam through which the daemon starts,
//! drives, and tears down agent containers.
//!
//! The runtime client itself (talking to Docker, containerd, a sandboxing
//! VMM, or whatever actually hosts agents) is out of scope here: it is
//! treated as an opaque capability with exactly three scoped verbs. This
//! module defines that capability's shape, mirroring the trait-object seam
//! used for [`crate::event_sink::EventSink`] and [`crate::audit::AuditBackend`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::ContainerError;

/// Parameters for starting a new agent container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Caller-chosen agent id.
    pub agent_id: String,
    /// Agent type/image tag.
    pub agent_type: String,
    /// Room the agent is scoped to.
    pub room_id: String,
    /// Credential id the agent is authorized to use.
    pub key_id: String,
    /// Capability flags granted to this agent.
    pub capabilities: Vec<String>,
}

/// Capability for managing agent container lifecycles.
///
/// Implementations must be safe to share across async tasks.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// The runtime's name, for diagnostics.
    fn name(&self) -> &str;

    /// Create and start a container per `spec`. Returns a runtime-assigned
    /// container id.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::OperationFailed`] if the runtime refuses or
    /// fails the request.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError>;

    /// Execute a command inside a running container, returning its combined
    /// output.
    ///
    /// # Errors
    ///
    /// - [`ContainerError::NotFound`] if no such container exists.
    /// - [`ContainerError::OperationFailed`] if execution fails.
    async fn exec(&self, container_id: &str, command: &[String]) -> Result<String, ContainerError>;

    /// Stop and remove a container. Idempotent — removing an already-removed
    /// container is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::OperationFailed`] if the runtime fails the
    /// removal for a reason other than the container already being gone.
    async fn remove(&self, container_id: &str) -> Result<(), ContainerError>;
}

/// In-memory stand-in runtime for local development and tests. Tracks
/// container ids and specs but performs no real process isolation.
pub struct LocalStubRuntime {
    containers: RwLock<HashMap<String, ContainerSpec>>,
}

impl LocalStubRuntime {
    /// Construct an empty stub runtime.
    #[must_use]
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for LocalStubRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for LocalStubRuntime {
    fn name(&self) -> &str {
        "local-stub"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.containers.write().await.insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn exec(&self, container_id: &str, _command: &[String]) -> Result<String, ContainerError> {
        let guard = self.containers.read().await;
        if !guard.contains_key(container_id) {
            return Err(ContainerError::NotFound {
                id: container_id.to_owned(),
            });
        }
        Ok(String::new())
    }

    async fn remove(&self, container_id: &str) -> Result<(), ContainerError> {
        self.containers.write().await.remove(container_id);
        Ok(())
    }
}

/// Shared handle alias used throughout the daemon.
pub type SharedContainerRuntime = Arc<dyn ContainerRuntime>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            agent_id: "agent-1".to_owned(),
            agent_type: "claude".to_owned(),
            room_id: "!r:h".to_owned(),
            key_id: "openai-default".to_owned(),
            capabilities: vec!["turn".to_owned()],
        }
    }

    #[tokio::test]
    async fn create_then_exec_succeeds() {
        let runtime = LocalStubRuntime::new();
        let id = runtime.create(&spec()).await.unwrap();
        assert!(runtime.exec(&id, &["echo".to_owned()]).await.is_ok());
    }

    #[tokio::test]
    async fn exec_on_unknown_container_is_not_found() {
        let runtime = LocalStubRuntime::new();
        let result = runtime.exec("missing", &[]).await;
        assert!(matches!(result, Err(ContainerError::NotFound { .. })));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let runtime = LocalStubRuntime::new();
        let id = runtime.create(&spec()).await.unwrap();
        runtime.remove(&id).await.unwrap();
        runtime.remove(&id).await.unwrap();
    }
}
