// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External service contracts consumed by the engine.
//!
//! The engine talks to three collaborators through trait objects: the flow
//! service (resume and action-result reporting, kept as a service seam for
//! cross-node parity), the isolate service (fire-and-forget container
//! actions), and the cluster sync channel (cancellation broadcasts). The
//! shipped implementations loop back into the local engine.

use std::collections::HashMap;
use std::sync::{OnceLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::{EngineError, Result};

/// Result payload delivered to a waiting action state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResultPayload {
    /// Id of the completed action; a subflow's instance id.
    pub action_id: String,
    /// Error code, empty on success.
    #[serde(default)]
    pub error_code: String,
    /// Error message, empty on success.
    #[serde(default)]
    pub error_message: String,
    /// JSON output bytes on success.
    #[serde(default)]
    pub output: Option<Vec<u8>>,
}

/// An action result addressed to a suspended instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResultMessage {
    /// Instance waiting on the result.
    pub instance_id: String,
    /// State id the instance is suspended in.
    pub state: String,
    /// Step the instance is suspended at.
    pub step: usize,
    /// The result itself.
    pub payload: ActionResultPayload,
}

/// Fire-and-forget request to run a container action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolateRequest {
    /// Unique id for this action execution.
    pub action_id: String,
    /// Namespace of the owning instance.
    pub namespace: String,
    /// Owning instance id.
    pub instance_id: String,
    /// Step of the owning instance.
    pub step: usize,
    /// Action timeout in seconds.
    pub timeout: i64,
    /// Container image.
    pub image: String,
    /// Container command.
    pub command: String,
    /// Container size class.
    pub size: i32,
    /// Input data handed to the container.
    pub data: Vec<u8>,
    /// Registry credentials by registry host.
    pub registries: HashMap<String, String>,
}

/// Cluster-wide synchronization broadcasts.
#[derive(Debug, Clone)]
pub enum SyncMessage {
    /// Ask whichever node holds the lock to drop a subflow instance.
    CancelSubflow {
        /// The instance to cancel.
        instance_id: String,
    },
    /// Ask whichever node runs an action to cancel it.
    CancelIsolate {
        /// The action to cancel.
        action_id: String,
    },
}

/// Flow service contract: re-entering the run loop and waking parents.
#[async_trait]
pub trait FlowService: Send + Sync {
    /// Re-enter the run loop for an instance at a step.
    async fn resume(&self, instance_id: &str, step: usize) -> Result<()>;

    /// Deliver an action result to a waiting instance.
    async fn report_action_results(&self, msg: ActionResultMessage) -> Result<()>;
}

/// Isolate service contract: runs container actions out of process.
#[async_trait]
pub trait IsolateService: Send + Sync {
    /// Request execution of a container action. Completion is reported
    /// back asynchronously as an action result.
    async fn run_isolate(&self, request: IsolateRequest) -> Result<()>;
}

/// Cluster synchronization channel.
#[async_trait]
pub trait ClusterBus: Send + Sync {
    /// Broadcast a message to every node.
    async fn publish(&self, msg: SyncMessage) -> Result<()>;
}

/// In-process flow service that loops back into the local engine.
#[derive(Default)]
pub struct LoopbackFlow {
    engine: OnceLock<Weak<Engine>>,
}

impl LoopbackFlow {
    /// Create a detached loopback; call [`attach`](Self::attach) once the
    /// engine exists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the loopback at an engine. Only the first call takes effect.
    pub fn attach(&self, engine: &std::sync::Arc<Engine>) {
        let _ = self.engine.set(std::sync::Arc::downgrade(engine));
    }

    fn engine(&self) -> Result<std::sync::Arc<Engine>> {
        self.engine
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| EngineError::internal_msg("flow service is not attached to an engine"))
    }
}

#[async_trait]
impl FlowService for LoopbackFlow {
    async fn resume(&self, instance_id: &str, step: usize) -> Result<()> {
        self.engine()?.resume(instance_id, step).await
    }

    async fn report_action_results(&self, msg: ActionResultMessage) -> Result<()> {
        self.engine()?.report_action_results(msg).await
    }
}

/// In-process cluster bus: broadcasts are delivered to the local engine.
#[derive(Default)]
pub struct LocalBus {
    engine: OnceLock<Weak<Engine>>,
}

impl LocalBus {
    /// Create a detached bus; call [`attach`](Self::attach) once the engine
    /// exists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the bus at an engine. Only the first call takes effect.
    pub fn attach(&self, engine: &std::sync::Arc<Engine>) {
        let _ = self.engine.set(std::sync::Arc::downgrade(engine));
    }
}

#[async_trait]
impl ClusterBus for LocalBus {
    async fn publish(&self, msg: SyncMessage) -> Result<()> {
        let Some(engine) = self.engine.get().and_then(Weak::upgrade) else {
            return Ok(());
        };
        match msg {
            SyncMessage::CancelSubflow { instance_id } => {
                engine.local_cancel(&instance_id).await;
            }
            SyncMessage::CancelIsolate { action_id } => {
                tracing::debug!(action = %action_id, "no local isolate to cancel");
            }
        }
        Ok(())
    }
}

/// Placeholder isolate service for deployments without a container runner.
pub struct DisconnectedIsolate;

#[async_trait]
impl IsolateService for DisconnectedIsolate {
    async fn run_isolate(&self, request: IsolateRequest) -> Result<()> {
        Err(EngineError::internal_msg(format!(
            "no isolate service is configured; cannot run action {}",
            request.action_id
        )))
    }
}
