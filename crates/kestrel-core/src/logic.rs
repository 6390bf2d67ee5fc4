// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State logic capability and registry.
//!
//! A state logic implements one state type's behavior: run a single atomic
//! step, expose error catchers, and report external work still believed to
//! be running. The engine owns only dispatch and transition plumbing; it
//! resolves the logic for a state through the [`LogicRegistry`], a closed
//! map from state type to factory with extension registration.
//!
//! Two logics ship with the core because the run loop itself needs them
//! exercised: `noop` and `delay`. Everything else is pluggable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kestrel_model::{ErrorCatcher, StateDefinition, StateType, Workflow};
use tokio_util::sync::CancellationToken;

use crate::duration;
use crate::engine::{Engine, SLEEP_WAKEDATA};
use crate::error::{EngineError, Result};
use crate::instance::LogicInstance;

/// What a successful state run does next.
#[derive(Debug, Clone)]
pub struct StateTransition {
    /// jq transform to apply to the state document; `""` and `"."` mean
    /// identity.
    pub transform: String,
    /// Next state id; empty means the workflow completes.
    pub next_state: String,
}

/// Kinds of external work a state can own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    /// A container action.
    Isolate,
    /// A nested workflow instance.
    Subflow,
}

/// A piece of external work believed to still be running.
#[derive(Debug, Clone)]
pub struct ChildInfo {
    /// What kind of work this is.
    pub kind: ChildKind,
    /// Action id or subflow instance id.
    pub id: String,
}

/// Context handed to a state logic's run.
pub struct LogicContext {
    /// The engine, for scheduling wakeups, invoking subflows, and
    /// registering event waiters.
    pub engine: Arc<Engine>,
    /// Fired when the instance lock is released or the instance is
    /// cancelled; long-running logics must honor it.
    pub cancel: CancellationToken,
}

/// Pluggable implementation of one state kind.
#[async_trait]
pub trait StateLogic: Send + Sync {
    /// The state's id within its workflow.
    fn id(&self) -> &str;

    /// The state type this logic implements.
    fn state_type(&self) -> StateType;

    /// Absolute deadline for this state, used for the soft timeout.
    fn deadline(&self) -> DateTime<Utc>;

    /// Error catchers declared on the state, in declaration order.
    fn error_catchers(&self) -> &[ErrorCatcher];

    /// External work believed still running, recovered from the persisted
    /// memory; used for cancellation propagation.
    fn living_children(&self, _memory: &[u8]) -> Vec<ChildInfo> {
        Vec::new()
    }

    /// Execute one atomic step.
    ///
    /// Returns `Ok(Some(transition))` to advance, `Ok(None)` to suspend
    /// (the logic has scheduled its own wakeup and persisted any memory it
    /// needs), or an error for the run loop to classify.
    async fn run(
        &self,
        ctx: &LogicContext,
        instance: &mut LogicInstance,
        savedata: Option<&[u8]>,
        wakedata: Option<&[u8]>,
    ) -> Result<Option<StateTransition>>;
}

/// Deadline for a state: its declared timeout plus grace, or a short
/// default.
pub fn state_deadline(timeout: Option<&str>) -> DateTime<Utc> {
    let now = Utc::now();
    match timeout.and_then(|t| duration::parse(t).ok()) {
        Some(d) => duration::shift(&d, now) + ChronoDuration::seconds(5),
        None => now + ChronoDuration::seconds(5),
    }
}

/// Factory producing a state logic from a workflow and state definition.
pub type LogicFactory =
    Arc<dyn Fn(&Workflow, &StateDefinition) -> Result<Arc<dyn StateLogic>> + Send + Sync>;

/// Map from state type to logic factory.
pub struct LogicRegistry {
    factories: HashMap<StateType, LogicFactory>,
}

impl LogicRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in logics registered.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            StateType::Noop,
            Arc::new(|_, state| Ok(Arc::new(NoopLogic::new(state.clone())) as Arc<dyn StateLogic>)),
        );
        registry.register(
            StateType::Delay,
            Arc::new(|_, state| {
                Ok(Arc::new(DelayLogic::new(state.clone())?) as Arc<dyn StateLogic>)
            }),
        );
        registry
    }

    /// Register or replace the factory for a state type.
    pub fn register(&mut self, state_type: StateType, factory: LogicFactory) {
        self.factories.insert(state_type, factory);
    }

    /// Construct the logic for a state.
    pub fn init(&self, workflow: &Workflow, state: &StateDefinition) -> Result<Arc<dyn StateLogic>> {
        let factory = self.factories.get(&state.state_type).ok_or_else(|| {
            EngineError::internal_msg(format!(
                "engine cannot resolve state type: {}",
                state.state_type
            ))
        })?;
        factory(workflow, state)
    }
}

impl Default for LogicRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Pass-through state: transform and transition only.
pub struct NoopLogic {
    state: StateDefinition,
}

impl NoopLogic {
    /// Build a noop logic from its state definition.
    pub fn new(state: StateDefinition) -> Self {
        Self { state }
    }
}

#[async_trait]
impl StateLogic for NoopLogic {
    fn id(&self) -> &str {
        &self.state.id
    }

    fn state_type(&self) -> StateType {
        StateType::Noop
    }

    fn deadline(&self) -> DateTime<Utc> {
        state_deadline(self.state.timeout.as_deref())
    }

    fn error_catchers(&self) -> &[ErrorCatcher] {
        &self.state.catch
    }

    async fn run(
        &self,
        _ctx: &LogicContext,
        _instance: &mut LogicInstance,
        savedata: Option<&[u8]>,
        wakedata: Option<&[u8]>,
    ) -> Result<Option<StateTransition>> {
        if savedata.is_some_and(|d| !d.is_empty()) {
            return Err(EngineError::internal_msg("unexpected savedata for noop state"));
        }
        if wakedata.is_some_and(|d| !d.is_empty()) {
            return Err(EngineError::internal_msg("unexpected wakedata for noop state"));
        }
        Ok(Some(StateTransition {
            transform: self.state.transform_or_default().to_string(),
            next_state: self.state.transition_or_default().to_string(),
        }))
    }
}

/// Sleeps for a fixed ISO-8601 duration, then transitions.
pub struct DelayLogic {
    state: StateDefinition,
    duration: String,
}

impl DelayLogic {
    /// Build a delay logic; the state definition must carry a `duration`.
    pub fn new(state: StateDefinition) -> Result<Self> {
        let duration = state
            .extra
            .get("duration")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                EngineError::internal_msg(format!(
                    "delay state '{}' does not define a duration",
                    state.id
                ))
            })?
            .to_string();
        Ok(Self { state, duration })
    }
}

#[async_trait]
impl StateLogic for DelayLogic {
    fn id(&self) -> &str {
        &self.state.id
    }

    fn state_type(&self) -> StateType {
        StateType::Delay
    }

    fn deadline(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match duration::parse(&self.duration) {
            Ok(d) => duration::shift(&d, now) + ChronoDuration::seconds(5),
            Err(_) => now + ChronoDuration::seconds(5),
        }
    }

    fn error_catchers(&self) -> &[ErrorCatcher] {
        &self.state.catch
    }

    async fn run(
        &self,
        ctx: &LogicContext,
        instance: &mut LogicInstance,
        _savedata: Option<&[u8]>,
        wakedata: Option<&[u8]>,
    ) -> Result<Option<StateTransition>> {
        match wakedata {
            None => {
                let wake_at = duration::shift(&duration::parse(&self.duration)?, Utc::now());
                ctx.engine
                    .sleep(instance.id(), self.id(), instance.step(), wake_at)
                    .await?;
                instance.log(format!("Sleeping until {}.", wake_at.to_rfc3339()));
                Ok(None)
            }
            Some(data) if data == SLEEP_WAKEDATA => Ok(Some(StateTransition {
                transform: self.state.transform_or_default().to_string(),
                next_state: self.state.transition_or_default().to_string(),
            })),
            Some(_) => Err(EngineError::internal_msg(
                "unexpected wakedata for delay state",
            )),
        }
    }
}
