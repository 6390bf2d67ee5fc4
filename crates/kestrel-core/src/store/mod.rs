//! Persistence interfaces and backends for kestrel-core.
//!
//! The persistent record is the source of truth for every instance; the
//! engine treats its in-memory copy as a snapshot, which is why every
//! update here returns the refreshed record. The cluster-wide advisory
//! instance lock is part of this contract as well: at most one logic
//! instance may hold the lock for a given instance id at any moment across
//! the cluster.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;

use std::any::Any;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kestrel_model::ConsumeEventDefinition;
use uuid::Uuid;

use crate::error::Result;

/// Instance status strings as persisted.
pub mod status {
    /// Created, not yet entered its first state.
    pub const PENDING: &str = "pending";
    /// Actively executing or suspended mid-flow.
    pub const RUNNING: &str = "running";
    /// Terminated successfully.
    pub const COMPLETE: &str = "complete";
    /// Terminated with an uncaught or uncatchable error.
    pub const FAILED: &str = "failed";
    /// Terminated by an internal error.
    pub const CRASHED: &str = "crashed";
    /// Terminated by cancellation.
    pub const CANCELLED: &str = "cancelled";

    /// Whether an instance with this status may still be resumed.
    pub fn is_live(status: &str) -> bool {
        status == PENDING || status == RUNNING
    }
}

/// Persistent record of one workflow instance.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRecord {
    /// Globally unique id: `<namespace>/<name>/<6 random letters>`.
    pub instance_id: String,
    /// Namespace the instance runs in.
    pub namespace: String,
    /// Name of the workflow this instance executes.
    pub workflow_ref: String,
    /// Lifecycle status; see [`status`].
    pub status: String,
    /// Ordered sequence of state ids visited; its length is the current step.
    pub flow: Vec<String>,
    /// JSON-encoded current state document.
    pub state_data: String,
    /// Base64-encoded logic-owned scratch persisted by suspended states.
    pub memory: Option<String>,
    /// Retry counter for the current state.
    pub attempts: i32,
    /// Absolute deadline of the current state.
    pub deadline: Option<DateTime<Utc>>,
    /// Serialized subflow caller, when invoked as a subflow.
    pub invoked_by: Option<String>,
    /// First error code recorded; written at most once.
    pub error_code: Option<String>,
    /// Message accompanying `error_code`.
    pub error_message: Option<String>,
    /// Final JSON document at completion.
    pub output: Option<String>,
    /// When the instance was created.
    pub start_time: DateTime<Utc>,
    /// When the instance reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// Whether an error code has been recorded on this instance.
    pub fn has_error_code(&self) -> bool {
        self.error_code.as_deref().is_some_and(|c| !c.is_empty())
    }
}

/// Persistent record of a stored workflow definition.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkflowRecord {
    /// Stable workflow id.
    pub id: Uuid,
    /// Namespace the workflow belongs to.
    pub namespace: String,
    /// Workflow name, unique within the namespace.
    pub name: String,
    /// JSON definition, parsed by `kestrel-model`.
    pub definition: String,
}

/// A registered event waiter for a consume-event style state.
#[derive(Debug, Clone)]
pub struct EventListenerRecord {
    /// Workflow the waiting instance belongs to.
    pub workflow_id: Uuid,
    /// Event definitions with context values already interpolated.
    pub events: Vec<ConsumeEventDefinition>,
    /// JSON `{instance_id, step}` used to wake the waiter.
    pub signature: Vec<u8>,
    /// Whether all listed events must arrive before waking.
    pub all_of: bool,
}

/// Opaque handle to a held advisory instance lock.
///
/// Backends stash whatever they need to release the lock (a pool
/// connection, an owned guard); dropping the handle without calling
/// `unlock_instance` leaks the lock only for backends that require an
/// explicit release.
pub struct LockHandle {
    key: i64,
    guard: Option<Box<dyn Any + Send + Sync>>,
}

impl LockHandle {
    /// Wrap a backend-specific guard.
    pub fn new(key: i64, guard: impl Any + Send + Sync) -> Self {
        Self {
            key,
            guard: Some(Box::new(guard)),
        }
    }

    /// The advisory-lock key this handle holds.
    pub fn key(&self) -> i64 {
        self.key
    }

    /// Take the backend guard back out, if it is of type `T`.
    pub fn take_guard<T: 'static>(&mut self) -> Option<Box<T>> {
        match self.guard.take() {
            Some(guard) => match guard.downcast::<T>() {
                Ok(guard) => Some(guard),
                Err(guard) => {
                    self.guard = Some(guard);
                    None
                }
            },
            None => None,
        }
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle").field("key", &self.key).finish()
    }
}

/// Persistence contract consumed by the engine.
#[allow(missing_docs)]
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_workflow(
        &self,
        namespace: &str,
        name: &str,
        definition: &str,
    ) -> Result<WorkflowRecord>;

    async fn get_workflow(&self, namespace: &str, name: &str) -> Result<Option<WorkflowRecord>>;

    async fn get_workflow_by_id(&self, id: Uuid) -> Result<Option<WorkflowRecord>>;

    async fn create_instance(&self, record: &InstanceRecord) -> Result<()>;

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>>;

    /// Persist a state transition: new deadline, attempts, flow, and state
    /// data; clears `memory` and moves the instance to `running`.
    async fn update_transition(
        &self,
        instance_id: &str,
        deadline: DateTime<Utc>,
        attempts: i32,
        flow: &[String],
        state_data: &str,
    ) -> Result<InstanceRecord>;

    async fn update_memory(
        &self,
        instance_id: &str,
        memory: Option<&str>,
    ) -> Result<InstanceRecord>;

    async fn update_deadline(
        &self,
        instance_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<InstanceRecord>;

    async fn update_attempts(&self, instance_id: &str, attempts: i32) -> Result<InstanceRecord>;

    async fn set_invoked_by(&self, instance_id: &str, invoked_by: &str) -> Result<InstanceRecord>;

    async fn complete_instance(
        &self,
        instance_id: &str,
        output: &str,
        end_time: DateTime<Utc>,
    ) -> Result<InstanceRecord>;

    /// Record a terminal failure (`failed` or `crashed`) or an error raised
    /// mid-flight (no `end_time`).
    async fn fail_instance(
        &self,
        instance_id: &str,
        status: &str,
        error_code: &str,
        error_message: &str,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<InstanceRecord>;

    /// Atomically cancel the instance if it is still live. Returns the
    /// updated record, or `None` when the instance was already terminal.
    async fn cancel_if_live(
        &self,
        instance_id: &str,
        error_code: &str,
        error_message: &str,
        end_time: DateTime<Utc>,
    ) -> Result<Option<InstanceRecord>>;

    async fn add_event_listener(&self, listener: &EventListenerRecord) -> Result<()>;

    /// Acquire the cluster-wide advisory lock for `key`, waiting at most
    /// `wait`.
    async fn lock_instance(&self, key: i64, wait: Duration) -> Result<LockHandle>;

    /// Release a lock previously acquired with `lock_instance`.
    async fn unlock_instance(&self, handle: LockHandle) -> Result<()>;
}
