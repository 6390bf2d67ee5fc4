// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared harness for engine integration tests: an engine over the
//! in-memory store and in-process timers, plus the test state logics the
//! pluggable types are exercised with.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use kestrel_core::engine::{Engine, EngineBuilder, SubflowCaller};
use kestrel_core::error::{EngineError, Result};
use kestrel_core::instance::LogicInstance;
use kestrel_core::logic::{
    state_deadline, ChildInfo, ChildKind, LogicContext, LogicFactory, StateLogic, StateTransition,
};
use kestrel_core::services::{ActionResultMessage, ActionResultPayload, FlowService};
use kestrel_core::store::{InstanceRecord, MemoryStore};
use kestrel_core::timers::InProcessTimers;
use kestrel_model::{ConsumeEventDefinition, ErrorCatcher, StateDefinition, StateType};

/// Namespace every test workflow lives in.
pub const NS: &str = "test";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: MemoryStore,
    pub timers: InProcessTimers,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_builder(|b| b).await
    }

    pub async fn with_builder(customize: impl FnOnce(EngineBuilder) -> EngineBuilder) -> Self {
        init_tracing();
        let store = MemoryStore::new();
        let timers = InProcessTimers::new();
        let builder = Engine::builder()
            .store(Arc::new(store.clone()))
            .timers(Arc::new(timers.clone()));
        let engine = customize(builder).start().await.expect("engine start");
        Self {
            engine,
            store,
            timers,
        }
    }

    pub async fn put_workflow(&self, name: &str, definition: Value) -> Uuid {
        use kestrel_core::store::Store;
        self.store
            .put_workflow(NS, name, &definition.to_string())
            .await
            .expect("put workflow")
            .id
    }

    pub async fn instance(&self, instance_id: &str) -> InstanceRecord {
        use kestrel_core::store::Store;
        self.store
            .get_instance(instance_id)
            .await
            .expect("get instance")
            .expect("instance exists")
    }

    pub async fn wait_for(
        &self,
        instance_id: &str,
        what: &str,
        predicate: impl Fn(&InstanceRecord) -> bool,
    ) -> InstanceRecord {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let record = self.instance(instance_id).await;
            if predicate(&record) {
                return record;
            }
            if Instant::now() > deadline {
                panic!(
                    "timed out waiting for {what} on {instance_id}; status={} flow={:?} error={:?}",
                    record.status, record.flow, record.error_code
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_status(&self, instance_id: &str, status: &str) -> InstanceRecord {
        self.wait_for(instance_id, status, |r| r.status == status)
            .await
    }
}

// ============================================================================
// Test state logics
// ============================================================================

fn success_transition(state: &StateDefinition) -> Option<StateTransition> {
    Some(StateTransition {
        transform: state.transform_or_default().to_string(),
        next_state: state.transition_or_default().to_string(),
    })
}

/// Fails with a catchable error until the persisted attempt counter reaches
/// the state's `succeedAfter`. Registered over the `validate` type.
pub struct FlakyLogic {
    state: StateDefinition,
}

pub fn flaky_factory() -> LogicFactory {
    Arc::new(|_, state| {
        Ok(Arc::new(FlakyLogic {
            state: state.clone(),
        }) as Arc<dyn StateLogic>)
    })
}

#[async_trait]
impl StateLogic for FlakyLogic {
    fn id(&self) -> &str {
        &self.state.id
    }

    fn state_type(&self) -> StateType {
        StateType::Validate
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
        instance: &mut LogicInstance,
        _savedata: Option<&[u8]>,
        _wakedata: Option<&[u8]>,
    ) -> Result<Option<StateTransition>> {
        let succeed_after = self
            .state
            .extra
            .get("succeedAfter")
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32;
        let code = self
            .state
            .extra
            .get("errorCode")
            .and_then(Value::as_str)
            .unwrap_or("direktiv.test.x");
        if instance.record().attempts < succeed_after {
            return Err(EngineError::catchable(code, "flaky state failed"));
        }
        Ok(success_transition(&self.state))
    }
}

/// Raises an error on the instance record twice, recording what the second
/// raise produced, then fails. Registered over the `error` type.
pub struct DoubleRaiseLogic {
    state: StateDefinition,
    second_raise: Arc<Mutex<Option<String>>>,
}

pub fn double_raise_factory(second_raise: Arc<Mutex<Option<String>>>) -> LogicFactory {
    Arc::new(move |_, state| {
        Ok(Arc::new(DoubleRaiseLogic {
            state: state.clone(),
            second_raise: second_raise.clone(),
        }) as Arc<dyn StateLogic>)
    })
}

#[async_trait]
impl StateLogic for DoubleRaiseLogic {
    fn id(&self) -> &str {
        &self.state.id
    }

    fn state_type(&self) -> StateType {
        StateType::Error
    }

    fn deadline(&self) -> DateTime<Utc> {
        state_deadline(None)
    }

    fn error_catchers(&self) -> &[ErrorCatcher] {
        &self.state.catch
    }

    async fn run(
        &self,
        _ctx: &LogicContext,
        instance: &mut LogicInstance,
        _savedata: Option<&[u8]>,
        _wakedata: Option<&[u8]>,
    ) -> Result<Option<StateTransition>> {
        instance.raise("direktiv.test.first", "the first error").await?;
        let second = instance.raise("direktiv.test.second", "the second error").await;
        *self.second_raise.lock().unwrap() = second.err().map(|e| e.code().to_string());
        Err(EngineError::catchable("direktiv.test.first", "the first error"))
    }
}

/// Launches a subflow, suspends on its result, and stores the output.
/// Registered over the `action` type.
pub struct SubflowActionLogic {
    state: StateDefinition,
}

pub fn subflow_action_factory() -> LogicFactory {
    Arc::new(|_, state| {
        Ok(Arc::new(SubflowActionLogic {
            state: state.clone(),
        }) as Arc<dyn StateLogic>)
    })
}

#[async_trait]
impl StateLogic for SubflowActionLogic {
    fn id(&self) -> &str {
        &self.state.id
    }

    fn state_type(&self) -> StateType {
        StateType::Action
    }

    fn deadline(&self) -> DateTime<Utc> {
        state_deadline(Some("PT1H"))
    }

    fn error_catchers(&self) -> &[ErrorCatcher] {
        &self.state.catch
    }

    fn living_children(&self, memory: &[u8]) -> Vec<ChildInfo> {
        if memory.is_empty() {
            return Vec::new();
        }
        vec![ChildInfo {
            kind: ChildKind::Subflow,
            id: String::from_utf8_lossy(memory).into_owned(),
        }]
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
                let workflow = self
                    .state
                    .extra
                    .get("workflow")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        EngineError::internal_msg("action state does not name a workflow")
                    })?;
                let caller = SubflowCaller {
                    instance_id: instance.id().to_string(),
                    state: self.state.id.clone(),
                    step: instance.step(),
                    depth: 0,
                };
                let callers_caller = instance.record().invoked_by.clone();
                let child = ctx
                    .engine
                    .subflow_invoke(
                        caller,
                        callers_caller.as_deref(),
                        instance.namespace(),
                        workflow,
                        b"{}",
                    )
                    .await?;
                instance.save_memory(child.as_bytes()).await?;
                Ok(None)
            }
            Some(wakedata) => {
                let payload: ActionResultPayload = serde_json::from_slice(wakedata)?;
                if !payload.error_code.is_empty() {
                    return Err(EngineError::catchable(
                        &payload.error_code,
                        &payload.error_message,
                    ));
                }
                let output: Value = match payload.output {
                    Some(bytes) => serde_json::from_slice(&bytes)?,
                    None => Value::Null,
                };
                instance.store_data("result", output)?;
                Ok(success_transition(&self.state))
            }
        }
    }
}

/// Registers an event waiter on first entry and stores the delivered
/// events on wake. Registered over the `eventsAnd` type.
pub struct EventsWaitLogic {
    state: StateDefinition,
}

pub fn events_wait_factory() -> LogicFactory {
    Arc::new(|_, state| {
        Ok(Arc::new(EventsWaitLogic {
            state: state.clone(),
        }) as Arc<dyn StateLogic>)
    })
}

#[async_trait]
impl StateLogic for EventsWaitLogic {
    fn id(&self) -> &str {
        &self.state.id
    }

    fn state_type(&self) -> StateType {
        StateType::EventsAnd
    }

    fn deadline(&self) -> DateTime<Utc> {
        state_deadline(Some("PT1H"))
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
                let defs: Vec<ConsumeEventDefinition> = serde_json::from_value(
                    self.state
                        .extra
                        .get("events")
                        .cloned()
                        .unwrap_or_else(|| Value::Array(Vec::new())),
                )?;
                let all = self
                    .state
                    .extra
                    .get("all")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                ctx.engine.listen_for_events(instance, &defs, all).await?;
                instance.save_memory(b"waiting").await?;
                Ok(None)
            }
            Some(wakedata) => {
                let events: Value = serde_json::from_slice(wakedata)?;
                instance.store_data("received", events)?;
                Ok(success_transition(&self.state))
            }
        }
    }
}

/// Flow service wrapper that records every action-result report before
/// forwarding it to the engine.
pub struct RecordingFlow {
    engine: OnceLock<Weak<Engine>>,
    reports: Mutex<Vec<ActionResultMessage>>,
}

impl RecordingFlow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            engine: OnceLock::new(),
            reports: Mutex::new(Vec::new()),
        })
    }

    pub fn attach(&self, engine: &Arc<Engine>) {
        let _ = self.engine.set(Arc::downgrade(engine));
    }

    pub fn reports(&self) -> Vec<ActionResultMessage> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl FlowService for RecordingFlow {
    async fn resume(&self, instance_id: &str, step: usize) -> Result<()> {
        match self.engine.get().and_then(Weak::upgrade) {
            Some(engine) => engine.resume(instance_id, step).await,
            None => Ok(()),
        }
    }

    async fn report_action_results(&self, msg: ActionResultMessage) -> Result<()> {
        self.reports.lock().unwrap().push(msg.clone());
        if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
            // the target may already be terminal; that is the caller's
            // problem to log, not ours to fail on
            let _ = engine.report_action_results(msg).await;
        }
        Ok(())
    }
}
