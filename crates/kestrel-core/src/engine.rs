// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The workflow engine: invocation, the run loop, retry, cancellation, and
//! wake callbacks.
//!
//! Every run pass, transition, cancellation, and wake handler runs as an
//! independent task; the cluster-wide per-instance advisory lock serializes
//! all mutation for one instance. Handlers that load an instance revalidate
//! its status and step, which makes duplicate timer deliveries harmless.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use cloudevents::event::Data;
use cloudevents::{AttributesReader, Event};
use kestrel_model::{ConsumeEventDefinition, ErrorCatcher, StartType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::error::{
    EngineError, Result, ERR_CODE_CANCELLED_BY_PARENT, ERR_CODE_DEPTH_LIMIT,
    ERR_CODE_INVALID_START, ERR_CODE_NO_SUCH_WORKFLOW, ERR_CODE_STEP_LIMIT, ERR_CODE_TIMEOUT,
    INTERNAL_ERROR_MESSAGE,
};
use crate::instance::LogicInstance;
use crate::locks::CancelRegistry;
use crate::logic::{ChildKind, LogicContext, LogicRegistry, StateLogic, StateTransition};
use crate::services::{
    ActionResultMessage, ActionResultPayload, ClusterBus, DisconnectedIsolate, FlowService,
    IsolateRequest, IsolateService, LocalBus, LoopbackFlow, SyncMessage,
};
use crate::store::{status, EventListenerRecord, InstanceRecord, Store};
use crate::timers::{InProcessTimers, TimerCallback, TimerService};
use crate::{CATCH_LOOP_LIMIT, MAX_SUBFLOW_DEPTH, MAX_WORKFLOW_STEPS};

/// Timer function name for sleep wakeups.
pub const SLEEP_WAKEUP_FUNCTION: &str = "sleepWakeup";
/// Timer function name for retry wakeups.
pub const RETRY_WAKEUP_FUNCTION: &str = "retryWakeup";
/// Timer function name for soft and hard timeouts.
pub const TIMEOUT_FUNCTION: &str = "timeoutFunction";
/// Timer function name for cron-scheduled workflow starts.
pub const WF_CRON_FUNCTION: &str = "wfcron";
/// Function name the event bus wakes event waiters through.
pub const EVENTS_WAKEUP_FUNCTION: &str = "eventsWakeup";
/// Wakedata marking a sleep wakeup.
pub const SLEEP_WAKEDATA: &[u8] = b"sleep";

/// Coordinates of the parent recorded on a subflow's instance record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubflowCaller {
    /// Parent instance id.
    pub instance_id: String,
    /// Parent state id waiting on the subflow.
    pub state: String,
    /// Parent step waiting on the subflow.
    pub step: usize,
    /// Transitive subflow depth of the child.
    #[serde(default)]
    pub depth: i32,
}

/// Signature identifying a registered event waiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsWaiterSignature {
    /// The waiting instance.
    pub instance_id: String,
    /// The step it suspended at.
    pub step: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct SleepMessage {
    instance_id: String,
    state: String,
    step: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct RetryMessage {
    instance_id: String,
    state: String,
    step: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct TimeoutArgs {
    instance_id: String,
    step: usize,
    soft: bool,
}

/// What the run loop asks its caller to do once the lock is released.
pub(crate) enum AfterUnlock {
    /// Nothing further; the pass is over.
    Nothing,
    /// Launch a transition into `next_state`.
    Transition {
        /// State to transition into.
        next_state: String,
        /// Attempt counter to persist with the transition.
        attempt: i32,
    },
    /// Re-run the current step (in-process retry).
    Resume,
}

/// The engine: instance lifecycle manager and run-loop owner.
pub struct Engine {
    store: Arc<dyn Store>,
    timers: Arc<dyn TimerService>,
    isolate: Arc<dyn IsolateService>,
    flow: Arc<dyn FlowService>,
    sync: Arc<dyn ClusterBus>,
    registry: LogicRegistry,
    cancels: CancelRegistry,
    self_ref: OnceLock<Weak<Engine>>,
}

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    store: Option<Arc<dyn Store>>,
    timers: Option<Arc<dyn TimerService>>,
    isolate: Option<Arc<dyn IsolateService>>,
    flow: Option<Arc<dyn FlowService>>,
    sync: Option<Arc<dyn ClusterBus>>,
    registry: LogicRegistry,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("timers", &self.timers.as_ref().map(|_| "..."))
            .field("isolate", &self.isolate.as_ref().map(|_| "..."))
            .field("flow", &self.flow.as_ref().map(|_| "..."))
            .field("sync", &self.sync.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            store: None,
            timers: None,
            isolate: None,
            flow: None,
            sync: None,
            registry: LogicRegistry::builtin(),
        }
    }
}

impl EngineBuilder {
    /// Create a builder with default settings and the built-in logic
    /// registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence backend (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the timer service. Defaults to [`InProcessTimers`].
    pub fn timers(mut self, timers: Arc<dyn TimerService>) -> Self {
        self.timers = Some(timers);
        self
    }

    /// Set the isolate service. Defaults to [`DisconnectedIsolate`].
    pub fn isolate(mut self, isolate: Arc<dyn IsolateService>) -> Self {
        self.isolate = Some(isolate);
        self
    }

    /// Set the flow service. Defaults to an in-process loopback.
    pub fn flow(mut self, flow: Arc<dyn FlowService>) -> Self {
        self.flow = Some(flow);
        self
    }

    /// Set the cluster sync channel. Defaults to an in-process loopback.
    pub fn sync(mut self, sync: Arc<dyn ClusterBus>) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Register or replace a state-logic factory.
    pub fn logic(
        mut self,
        state_type: kestrel_model::StateType,
        factory: crate::logic::LogicFactory,
    ) -> Self {
        self.registry.register(state_type, factory);
        self
    }

    /// Build the engine and register its timer functions.
    pub async fn start(self) -> Result<Arc<Engine>> {
        let store = self
            .store
            .ok_or_else(|| EngineError::internal_msg("a store is required"))?;
        let timers: Arc<dyn TimerService> = self
            .timers
            .unwrap_or_else(|| Arc::new(InProcessTimers::new()));
        let isolate: Arc<dyn IsolateService> =
            self.isolate.unwrap_or_else(|| Arc::new(DisconnectedIsolate));

        let mut loopback: Option<Arc<LoopbackFlow>> = None;
        let flow: Arc<dyn FlowService> = match self.flow {
            Some(flow) => flow,
            None => {
                let lb = Arc::new(LoopbackFlow::new());
                loopback = Some(lb.clone());
                lb
            }
        };

        let mut local_bus: Option<Arc<LocalBus>> = None;
        let sync: Arc<dyn ClusterBus> = match self.sync {
            Some(sync) => sync,
            None => {
                let bus = Arc::new(LocalBus::new());
                local_bus = Some(bus.clone());
                bus
            }
        };

        let engine = Arc::new(Engine {
            store,
            timers,
            isolate,
            flow,
            sync,
            registry: self.registry,
            cancels: CancelRegistry::new(),
            self_ref: OnceLock::new(),
        });
        let _ = engine.self_ref.set(Arc::downgrade(&engine));
        if let Some(lb) = loopback {
            lb.attach(&engine);
        }
        if let Some(bus) = local_bus {
            bus.attach(&engine);
        }

        engine.register_timer_functions().await?;
        info!("workflow engine started");
        Ok(engine)
    }
}

impl Engine {
    /// Create an [`EngineBuilder`].
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) fn cancels(&self) -> &CancelRegistry {
        &self.cancels
    }

    pub(crate) fn registry(&self) -> &LogicRegistry {
        &self.registry
    }

    fn handle(&self) -> Arc<Engine> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("engine used before start")
    }

    async fn register_timer_functions(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.handle());
        self.timers
            .register_function(
                SLEEP_WAKEUP_FUNCTION,
                Arc::new(SleepWakeupCallback {
                    engine: weak.clone(),
                }),
            )
            .await?;
        self.timers
            .register_function(
                RETRY_WAKEUP_FUNCTION,
                Arc::new(RetryWakeupCallback {
                    engine: weak.clone(),
                }),
            )
            .await?;
        self.timers
            .register_function(
                TIMEOUT_FUNCTION,
                Arc::new(TimeoutCallback {
                    engine: weak.clone(),
                }),
            )
            .await?;
        self.timers
            .register_function(WF_CRON_FUNCTION, Arc::new(WfCronCallback { engine: weak }))
            .await?;
        Ok(())
    }

    // ========================================================================
    // Invocation API
    // ========================================================================

    /// Invoke a workflow directly. The workflow's start must be `default`.
    /// Returns the new instance id.
    #[instrument(skip(self, input), fields(namespace = %namespace, name = %name))]
    pub async fn direct_invoke(&self, namespace: &str, name: &str, input: &[u8]) -> Result<String> {
        let wli = LogicInstance::new(self.handle(), namespace, name, input)
            .await
            .map_err(|e| sanitize_invoke_error(e, "DirectInvoke"))?;

        let start_type = wli.workflow().start_type();
        if start_type != StartType::Default {
            return Err(EngineError::uncatchable(
                ERR_CODE_INVALID_START,
                format!("cannot directly invoke workflows with '{start_type}' starts"),
            ));
        }

        self.launch(wli, "Beginning workflow triggered by API.")
            .await
    }

    /// Invoke a workflow on behalf of its cron schedule. The workflow's
    /// start must be `scheduled`. Returns the new instance id.
    #[instrument(skip(self))]
    pub async fn cron_invoke(&self, workflow_id: Uuid) -> Result<String> {
        let wf_rec = self
            .store
            .get_workflow_by_id(workflow_id)
            .await
            .map_err(|e| sanitize_invoke_error(e, "CronInvoke"))?
            .ok_or_else(|| {
                EngineError::uncatchable(
                    ERR_CODE_NO_SUCH_WORKFLOW,
                    format!("workflow '{workflow_id}' does not exist"),
                )
            })?;

        let wli = LogicInstance::new(self.handle(), &wf_rec.namespace, &wf_rec.name, b"{}")
            .await
            .map_err(|e| sanitize_invoke_error(e, "CronInvoke"))?;

        let start_type = wli.workflow().start_type();
        if start_type != StartType::Scheduled {
            return Err(EngineError::uncatchable(
                ERR_CODE_INVALID_START,
                format!("cannot cron invoke workflows with '{start_type}' starts"),
            ));
        }

        self.launch(wli, "Beginning workflow triggered by the scheduler.")
            .await
    }

    /// Invoke a workflow from one or more delivered events. The workflow's
    /// start must be event-based. Failures are logged, not returned; event
    /// delivery has nobody to report to.
    pub async fn events_invoke(&self, workflow_id: Uuid, events: Vec<Event>) {
        if let Err(e) = self.events_invoke_inner(workflow_id, events).await {
            error!(workflow = %workflow_id, "cannot invoke workflow from events: {e:#}");
        }
    }

    async fn events_invoke_inner(&self, workflow_id: Uuid, events: Vec<Event>) -> Result<String> {
        let wf_rec = self
            .store
            .get_workflow_by_id(workflow_id)
            .await?
            .ok_or_else(|| {
                EngineError::uncatchable(
                    ERR_CODE_NO_SUCH_WORKFLOW,
                    format!("workflow '{workflow_id}' does not exist"),
                )
            })?;

        let mut input = serde_json::Map::new();
        for event in &events {
            input.insert(event.ty().to_string(), event_payload(event)?);
        }
        let input = serde_json::to_vec(&Value::Object(input))?;

        let wli =
            LogicInstance::new(self.handle(), &wf_rec.namespace, &wf_rec.name, &input).await?;

        let start_type = wli.workflow().start_type();
        match start_type {
            StartType::Event | StartType::EventsAnd | StartType::EventsXor => {}
            _ => {
                return Err(EngineError::uncatchable(
                    ERR_CODE_INVALID_START,
                    format!("cannot event invoke workflows with '{start_type}' starts"),
                ));
            }
        }

        let banner = if events.len() == 1 {
            format!("Beginning workflow triggered by event: {}.", events[0].id())
        } else {
            let ids: Vec<&str> = events.iter().map(|e| e.id()).collect();
            format!("Beginning workflow triggered by events: {ids:?}.")
        };
        self.launch(wli, &banner).await
    }

    /// Invoke a workflow as a subflow of `caller`. The workflow's start
    /// must be `default`; the recursion depth is validated before the child
    /// record is created. Returns the child instance id.
    #[instrument(skip(self, caller, callers_caller, input), fields(namespace = %namespace, name = %name))]
    pub async fn subflow_invoke(
        &self,
        mut caller: SubflowCaller,
        callers_caller: Option<&str>,
        namespace: &str,
        name: &str,
        input: &[u8],
    ) -> Result<String> {
        if let Some(cc) = callers_caller.filter(|s| !s.is_empty()) {
            let cc: SubflowCaller = serde_json::from_str(cc)
                .map_err(|e| sanitize_invoke_error(e.into(), "subflowInvoke"))?;
            caller.depth = cc.depth + 1;
            if caller.depth > MAX_SUBFLOW_DEPTH {
                return Err(EngineError::uncatchable(
                    ERR_CODE_DEPTH_LIMIT,
                    format!(
                        "instance aborted for exceeding the maximum subflow depth ({MAX_SUBFLOW_DEPTH})"
                    ),
                ));
            }
        }

        let mut wli = LogicInstance::new(self.handle(), namespace, name, input)
            .await
            .map_err(|e| sanitize_invoke_error(e, "subflowInvoke"))?;

        let start_type = wli.workflow().start_type();
        if start_type != StartType::Default {
            return Err(EngineError::uncatchable(
                ERR_CODE_INVALID_START,
                format!("cannot subflow invoke workflows with '{start_type}' starts"),
            ));
        }

        self.store
            .create_instance(wli.record())
            .await
            .map_err(|e| sanitize_invoke_error(e, "subflowInvoke"))?;
        let invoked_by = serde_json::to_string(&caller)?;
        wli.rec = self
            .store
            .set_invoked_by(wli.id(), &invoked_by)
            .await
            .map_err(|e| sanitize_invoke_error(e, "subflowInvoke"))?;

        let start = wli
            .workflow()
            .start_state()
            .map(|s| s.id.clone())
            .ok_or_else(|| EngineError::internal_msg("workflow has no start state"))?;
        wli.log(format!(
            "Beginning workflow triggered as subflow to caller: {}.",
            caller.instance_id
        ));
        let id = wli.id().to_string();
        spawn_transition(wli, start, 0);
        Ok(id)
    }

    /// Shared tail of the non-subflow entry points: persist the pending
    /// record and fire the first transition on a fresh task.
    async fn launch(&self, wli: LogicInstance, banner: &str) -> Result<String> {
        self.store
            .create_instance(wli.record())
            .await
            .map_err(|e| sanitize_invoke_error(e, "invoke"))?;

        let start = wli
            .workflow()
            .start_state()
            .map(|s| s.id.clone())
            .ok_or_else(|| EngineError::internal_msg("workflow has no start state"))?;
        wli.log(banner);
        let id = wli.id().to_string();
        spawn_transition(wli, start, 0);
        Ok(id)
    }

    // ========================================================================
    // Run loop
    // ========================================================================

    /// Execute one run pass for a loaded, locked instance.
    pub(crate) async fn run_state(
        &self,
        mut wli: LogicInstance,
        savedata: Option<Vec<u8>>,
        wakedata: Option<Vec<u8>>,
    ) {
        debug!(instance = %wli.id(), step = wli.step(), "running state logic");
        if savedata.is_none() && wakedata.is_none() {
            if let Some(logic) = wli.logic.clone() {
                wli.log(format!(
                    "Running state logic -- {}:{} ({})",
                    logic.id(),
                    wli.step(),
                    logic.state_type()
                ));
            }
        }

        let after = self.run_state_inner(&mut wli, savedata, wakedata).await;
        wli.unlock().await;
        match after {
            AfterUnlock::Nothing => {}
            AfterUnlock::Transition { next_state, attempt } => {
                spawn_transition(wli, next_state, attempt);
            }
            AfterUnlock::Resume => {
                spawn_resume(self.handle(), wli.id().to_string(), wli.step(), None, None);
            }
        }
    }

    async fn run_state_inner(
        &self,
        wli: &mut LogicInstance,
        savedata: Option<Vec<u8>>,
        wakedata: Option<Vec<u8>>,
    ) -> AfterUnlock {
        let mut breaker = 0;

        let mut outcome: Result<Option<StateTransition>> =
            if wli.step() > MAX_WORKFLOW_STEPS {
                Err(EngineError::uncatchable(
                    ERR_CODE_STEP_LIMIT,
                    format!(
                        "instance aborted for exceeding the maximum number of state executions ({MAX_WORKFLOW_STEPS})"
                    ),
                ))
            } else if let Some(logic) = wli.logic.clone() {
                let ctx = LogicContext {
                    engine: self.handle(),
                    cancel: wli.cancel.clone(),
                };
                logic
                    .run(&ctx, wli, savedata.as_deref(), wakedata.as_deref())
                    .await
            } else {
                Err(EngineError::internal_msg("no state logic loaded"))
            };

        loop {
            match outcome {
                Ok(Some(transition)) => {
                    if !transition.transform.is_empty() && transition.transform != "." {
                        wli.log("Transforming state data.");
                        if let Err(e) = wli.transform(&transition.transform).await {
                            outcome = Err(e);
                            continue;
                        }
                    }

                    if transition.next_state.is_empty() {
                        return self.complete_instance_pass(wli).await;
                    }

                    wli.log(format!(
                        "Transitioning to next state: {} ({}).",
                        transition.next_state,
                        wli.step()
                    ));
                    return AfterUnlock::Transition {
                        next_state: transition.next_state,
                        attempt: 0,
                    };
                }

                // suspension: the logic scheduled its own wakeup
                Ok(None) => return AfterUnlock::Nothing,

                Err(err) => {
                    if let Some(logic) = wli.logic.clone() {
                        self.cancel_living_children(logic.as_ref(), wli.record())
                            .await;
                    }

                    match err {
                        EngineError::Uncatchable { code, message } => {
                            if !wli.rec.has_error_code() {
                                match self
                                    .store
                                    .fail_instance(
                                        wli.id(),
                                        status::FAILED,
                                        &code,
                                        &message,
                                        Some(Utc::now()),
                                    )
                                    .await
                                {
                                    Ok(rec) => wli.rec = rec,
                                    Err(e) => {
                                        outcome = Err(e);
                                        continue;
                                    }
                                }
                            }
                            wli.log(format!(
                                "Workflow failed with uncatchable error: {message}"
                            ));
                            if wli.rec.invoked_by.is_some() {
                                wli.log("Reporting failure to calling workflow.");
                            }
                            self.wake_caller(wli.record(), None).await;
                            return AfterUnlock::Nothing;
                        }

                        EngineError::Catchable { code, message } => {
                            let catchers: Vec<ErrorCatcher> = wli
                                .logic
                                .as_ref()
                                .map(|l| l.error_catchers().to_vec())
                                .unwrap_or_default();

                            let mut caught: Option<(usize, ErrorCatcher)> = None;
                            for (i, catcher) in catchers.into_iter().enumerate() {
                                let matched = Regex::new(&catcher.error)
                                    .map(|re| re.is_match(&code))
                                    .unwrap_or(false);
                                if matched {
                                    caught = Some((i, catcher));
                                    break;
                                }
                            }

                            if let Some((i, catcher)) = caught {
                                wli.log(format!("State failed with error '{code}': {message}"));
                                wli.log(format!(
                                    "Error caught by error definition {i}: {}",
                                    catcher.error
                                ));

                                if let Some(retry) = catcher.retry.as_ref() {
                                    if wli.rec.attempts < retry.max_attempts {
                                        match wli.retry(&retry.delay, retry.multiplier).await {
                                            Ok(directive) => return directive,
                                            Err(e) => {
                                                outcome = Err(e);
                                                continue;
                                            }
                                        }
                                    }
                                    wli.log("Maximum retry attempts exceeded.");
                                }

                                breaker += 1;
                                if breaker > CATCH_LOOP_LIMIT {
                                    outcome = Err(EngineError::internal_msg(
                                        "somehow ended up in a catchable error loop",
                                    ));
                                    continue;
                                }

                                outcome = Ok(Some(StateTransition {
                                    transform: String::new(),
                                    next_state: catcher.transition.clone(),
                                }));
                                continue;
                            }

                            // no catcher matched
                            if !wli.rec.has_error_code() {
                                match self
                                    .store
                                    .fail_instance(
                                        wli.id(),
                                        status::FAILED,
                                        &code,
                                        &message,
                                        Some(Utc::now()),
                                    )
                                    .await
                                {
                                    Ok(rec) => wli.rec = rec,
                                    Err(e) => {
                                        outcome = Err(e);
                                        continue;
                                    }
                                }
                            }
                            wli.log(format!(
                                "Workflow failed with uncaught error '{code}': {message}"
                            ));
                            if wli.rec.invoked_by.is_some() {
                                wli.log("Reporting failure to calling workflow.");
                            }
                            self.wake_caller(wli.record(), None).await;
                            return AfterUnlock::Nothing;
                        }

                        EngineError::Internal(detail) => {
                            error!(
                                instance = %wli.id(),
                                "workflow failed with internal error: {detail:#}"
                            );
                            if !wli.rec.has_error_code() {
                                match self
                                    .store
                                    .fail_instance(
                                        wli.id(),
                                        status::CRASHED,
                                        "",
                                        INTERNAL_ERROR_MESSAGE,
                                        Some(Utc::now()),
                                    )
                                    .await
                                {
                                    Ok(rec) => wli.rec = rec,
                                    Err(e) => {
                                        error!(
                                            instance = %wli.id(),
                                            "workflow failed with internal error and the database couldn't be updated: {e:#}"
                                        );
                                        return AfterUnlock::Nothing;
                                    }
                                }
                            }
                            wli.log("Workflow crashed due to an internal error.");
                            if wli.rec.invoked_by.is_some() {
                                wli.log("Reporting failure to calling workflow.");
                            }
                            self.wake_caller(wli.record(), None).await;
                            return AfterUnlock::Nothing;
                        }
                    }
                }
            }
        }
    }

    async fn complete_instance_pass(&self, wli: &mut LogicInstance) -> AfterUnlock {
        let output = match serde_json::to_string(wli.data()) {
            Ok(output) => output,
            Err(e) => {
                error!(instance = %wli.id(), "engine cannot marshal state data for storage: {e}");
                return AfterUnlock::Nothing;
            }
        };

        match self
            .store
            .complete_instance(wli.id(), &output, Utc::now())
            .await
        {
            Ok(rec) => wli.rec = rec,
            Err(e) => {
                error!(instance = %wli.id(), "cannot record workflow completion: {e:#}");
                return AfterUnlock::Nothing;
            }
        }

        debug!(instance = %wli.id(), "workflow instance completed");
        wli.log("Workflow completed.");

        match self.timers.delete_timers_for_instance(wli.id()).await {
            Ok(deleted) => debug!(instance = %wli.id(), deleted, "deleted timers for instance"),
            Err(e) => error!(instance = %wli.id(), "cannot delete instance timers: {e:#}"),
        }

        if wli.rec.invoked_by.is_some() {
            wli.log("Reporting results to calling workflow.");
        }
        self.wake_caller(wli.record(), Some(output.into_bytes()))
            .await;
        AfterUnlock::Nothing
    }

    /// Deliver this instance's terminal result to its subflow caller, if
    /// any. This is the sole coupling from subflow completion back to
    /// parent action states.
    async fn wake_caller(&self, rec: &InstanceRecord, output: Option<Vec<u8>>) {
        let Some(invoked_by) = rec.invoked_by.as_deref().filter(|s| !s.is_empty()) else {
            return;
        };
        let caller: SubflowCaller = match serde_json::from_str(invoked_by) {
            Ok(caller) => caller,
            Err(e) => {
                error!(instance = %rec.instance_id, "cannot decode subflow caller: {e}");
                return;
            }
        };

        let msg = ActionResultMessage {
            instance_id: caller.instance_id,
            state: caller.state,
            step: caller.step,
            payload: ActionResultPayload {
                action_id: rec.instance_id.clone(),
                error_code: rec.error_code.clone().unwrap_or_default(),
                error_message: rec.error_message.clone().unwrap_or_default(),
                output,
            },
        };

        if let Err(e) = self.flow.report_action_results(msg).await {
            error!(instance = %rec.instance_id, "cannot report results to calling workflow: {e:#}");
        }
    }

    async fn cancel_living_children(&self, logic: &dyn StateLogic, rec: &InstanceRecord) {
        let memory = match decode_memory(rec) {
            Ok(memory) => memory.unwrap_or_default(),
            Err(e) => {
                error!(instance = %rec.instance_id, "cannot decode instance memory: {e:#}");
                Vec::new()
            }
        };
        for child in logic.living_children(&memory) {
            match child.kind {
                ChildKind::Isolate => {
                    if let Err(e) = self
                        .sync
                        .publish(SyncMessage::CancelIsolate {
                            action_id: child.id.clone(),
                        })
                        .await
                    {
                        error!(action = %child.id, "cannot broadcast isolate cancellation: {e:#}");
                    }
                }
                ChildKind::Subflow => {
                    spawn_hard_cancel(self.handle(), child.id);
                }
            }
        }
    }

    async fn cancel_children(&self, rec: &InstanceRecord) -> Result<()> {
        let Some(state_id) = rec.flow.last() else {
            return Ok(());
        };
        let wf_rec = self
            .store
            .get_workflow(&rec.namespace, &rec.workflow_ref)
            .await?
            .ok_or_else(|| {
                EngineError::internal_msg(format!(
                    "cannot resolve instance workflow: {}",
                    rec.workflow_ref
                ))
            })?;
        let wf = kestrel_model::Workflow::load(&wf_rec.definition)?;
        let state = wf.state(state_id).ok_or_else(|| {
            EngineError::internal_msg(format!("workflow cannot resolve state: {state_id}"))
        })?;
        let logic = self.registry.init(&wf, state)?;
        self.cancel_living_children(logic.as_ref(), rec).await;
        Ok(())
    }

    // ========================================================================
    // Cancellation & timeouts
    // ========================================================================

    /// Unconditionally cancel an instance.
    pub async fn hard_cancel(&self, instance_id: &str, code: &str, message: &str) -> Result<()> {
        self.cancel_instance(instance_id, code, message, false).await
    }

    /// Cancel an instance at a step boundary. The step is carried for
    /// future use; the record update is identical to a hard cancel.
    pub async fn soft_cancel(
        &self,
        instance_id: &str,
        _step: usize,
        code: &str,
        message: &str,
    ) -> Result<()> {
        self.cancel_instance(instance_id, code, message, true).await
    }

    async fn cancel_instance(
        &self,
        instance_id: &str,
        code: &str,
        message: &str,
        _soft: bool,
    ) -> Result<()> {
        // Broadcast the cancellation on a tight loop until this function
        // returns, so a remote lock holder observes it quickly.
        let stop = CancellationToken::new();
        {
            let bus = self.sync.clone();
            let id = instance_id.to_string();
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(1));
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = ticker.tick() => {
                            if let Err(e) = bus
                                .publish(SyncMessage::CancelSubflow { instance_id: id.clone() })
                                .await
                            {
                                debug!(instance = %id, "cancel broadcast failed: {e:#}");
                            }
                        }
                    }
                }
            });
        }
        let _broadcast = stop.drop_guard();

        let Some(rec) = self
            .store
            .cancel_if_live(instance_id, code, message, Utc::now())
            .await?
        else {
            return Ok(());
        };

        if let Err(e) = self.cancel_children(&rec).await {
            error!(instance = %instance_id, "cannot cancel instance children: {e:#}");
        }

        let step = rec.flow.len();
        let per_step = if step == 0 {
            format!("timeout:{instance_id}")
        } else {
            format!("timeout:{instance_id}:{step}")
        };
        for name in [
            instance_id.to_string(),
            per_step,
            format!("timeout:{instance_id}"),
            format!("timeout:{instance_id}:hard"),
        ] {
            if let Err(e) = self.timers.delete_timer(&name).await {
                debug!(timer = %name, "cannot delete timer: {e:#}");
            }
        }

        info!(
            target: "kestrel::instance",
            instance = %instance_id,
            "Workflow {message}."
        );

        if rec.invoked_by.is_some() {
            info!(
                target: "kestrel::instance",
                instance = %instance_id,
                "Reporting failure to calling workflow."
            );
        }
        self.wake_caller(&rec, None).await;

        Ok(())
    }

    /// Drop whatever this node is doing for an instance: delete its named
    /// timer and fire its local cancellation signal. Invoked when a
    /// cancellation broadcast arrives.
    pub(crate) async fn local_cancel(&self, instance_id: &str) {
        if let Err(e) = self.timers.delete_timer(instance_id).await {
            debug!(instance = %instance_id, "cannot delete instance timer: {e:#}");
        }
        self.cancels.cancel(instance_id);
    }

    /// Handle a fired timeout timer.
    pub async fn timeout_handler(&self, payload: &[u8]) {
        let args: TimeoutArgs = match serde_json::from_slice(payload) {
            Ok(args) => args,
            Err(e) => {
                error!("cannot handle timeout: {e}");
                return;
            }
        };
        let result = if args.soft {
            self.soft_cancel(
                &args.instance_id,
                args.step,
                ERR_CODE_TIMEOUT,
                "operation timed out",
            )
            .await
        } else {
            self.hard_cancel(&args.instance_id, ERR_CODE_TIMEOUT, "workflow timed out")
                .await
        };
        if let Err(e) = result {
            error!(instance = %args.instance_id, "timeout cancellation failed: {e:#}");
        }
    }

    /// (Re)schedule a soft or hard timeout timer for an instance step.
    pub(crate) async fn schedule_timeout(
        &self,
        instance_id: &str,
        step: usize,
        at: DateTime<Utc>,
        soft: bool,
    ) {
        if step > 0 {
            let old = format!("timeout:{instance_id}:{}", step - 1);
            if let Err(e) = self.timers.delete_timer(&old).await {
                debug!(timer = %old, "cannot delete timer: {e:#}");
            }
        }

        let name = if !soft {
            format!("timeout:{instance_id}:hard")
        } else if step == 0 {
            format!("timeout:{instance_id}")
        } else {
            format!("timeout:{instance_id}:{step}")
        };

        let args = TimeoutArgs {
            instance_id: instance_id.to_string(),
            step,
            soft,
        };
        match serde_json::to_vec(&args) {
            Ok(payload) => {
                if let Err(e) = self
                    .timers
                    .add_one_shot(&name, TIMEOUT_FUNCTION, at, payload)
                    .await
                {
                    error!(timer = %name, "cannot schedule timeout: {e:#}");
                }
            }
            Err(e) => error!(timer = %name, "cannot encode timeout payload: {e}"),
        }
    }

    // ========================================================================
    // Sleep, retry, and wake callbacks
    // ========================================================================

    /// Schedule a sleep wakeup for a suspended state.
    pub async fn sleep(
        &self,
        instance_id: &str,
        state: &str,
        step: usize,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let payload = serde_json::to_vec(&SleepMessage {
            instance_id: instance_id.to_string(),
            state: state.to_string(),
            step,
        })?;
        self.timers
            .add_one_shot(instance_id, SLEEP_WAKEUP_FUNCTION, at, payload)
            .await
    }

    /// Handle a fired sleep timer.
    pub async fn sleep_wakeup(&self, payload: &[u8]) {
        let msg: SleepMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(e) => {
                error!("cannot handle sleep wakeup: {e}");
                return;
            }
        };
        let wli = match LogicInstance::load(self.handle(), &msg.instance_id, msg.step).await {
            Ok(wli) => wli,
            Err(e) => {
                error!(instance = %msg.instance_id, "cannot load workflow logic instance: {e:#}");
                return;
            }
        };
        wli.log("Waking up from sleep.");
        spawn_run(self.handle(), wli, None, Some(SLEEP_WAKEDATA.to_vec()));
    }

    pub(crate) async fn schedule_retry(
        &self,
        instance_id: &str,
        state: &str,
        step: usize,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let payload = serde_json::to_vec(&RetryMessage {
            instance_id: instance_id.to_string(),
            state: state.to_string(),
            step,
        })?;
        self.timers
            .add_one_shot(instance_id, RETRY_WAKEUP_FUNCTION, at, payload)
            .await
    }

    /// Handle a fired retry timer.
    pub async fn retry_wakeup(&self, payload: &[u8]) {
        let msg: RetryMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(e) => {
                error!("cannot handle retry wakeup: {e}");
                return;
            }
        };
        let wli = match LogicInstance::load(self.handle(), &msg.instance_id, msg.step).await {
            Ok(wli) => wli,
            Err(e) => {
                error!(instance = %msg.instance_id, "cannot load workflow logic instance: {e:#}");
                return;
            }
        };
        wli.log("Retrying failed state.");
        spawn_run(self.handle(), wli, None, None);
    }

    /// Wake an event waiter with its delivered events. Called by the event
    /// bus once a registered listener is satisfied.
    pub async fn wake_events_waiter(&self, signature: &[u8], events: Vec<Event>) -> Result<()> {
        let sig: EventsWaiterSignature =
            serde_json::from_slice(signature).map_err(|e| EngineError::internal(e))?;

        let mut wli = LogicInstance::load(self.handle(), &sig.instance_id, sig.step).await?;

        let wakedata = match serde_json::to_vec(&events) {
            Ok(wakedata) => wakedata,
            Err(e) => {
                wli.unlock().await;
                return Err(EngineError::internal_msg(format!(
                    "cannot marshal the events payload: {e}"
                )));
            }
        };

        let savedata = match decode_memory(wli.record()) {
            Ok(savedata) => savedata,
            Err(e) => {
                wli.unlock().await;
                return Err(e);
            }
        };

        spawn_run(self.handle(), wli, savedata, Some(wakedata));
        Ok(())
    }

    /// Deliver an action result to the instance waiting on it.
    pub async fn report_action_results(&self, msg: ActionResultMessage) -> Result<()> {
        let mut wli = LogicInstance::load(self.handle(), &msg.instance_id, msg.step).await?;

        let wakedata = match serde_json::to_vec(&msg.payload) {
            Ok(wakedata) => wakedata,
            Err(e) => {
                wli.unlock().await;
                return Err(EngineError::internal_msg(format!(
                    "cannot marshal the action results payload: {e}"
                )));
            }
        };

        let savedata = match decode_memory(wli.record()) {
            Ok(savedata) => savedata,
            Err(e) => {
                wli.unlock().await;
                return Err(e);
            }
        };

        spawn_run(self.handle(), wli, savedata, Some(wakedata));
        Ok(())
    }

    /// Re-enter the run loop for an instance at a step.
    pub async fn resume(&self, instance_id: &str, step: usize) -> Result<()> {
        let wli = LogicInstance::load(self.handle(), instance_id, step).await?;
        spawn_run(self.handle(), wli, None, None);
        Ok(())
    }

    async fn wf_cron(&self, payload: &[u8]) {
        let uid = match std::str::from_utf8(payload) {
            Ok(uid) => uid.trim(),
            Err(e) => {
                error!("cannot handle cron wakeup: {e}");
                return;
            }
        };
        let uid = match Uuid::parse_str(uid) {
            Ok(uid) => uid,
            Err(e) => {
                error!(payload = %uid, "cannot handle cron wakeup: {e}");
                return;
            }
        };
        if let Err(e) = self.cron_invoke(uid).await {
            error!(workflow = %uid, "cron invocation failed: {e:#}");
        }
    }

    // ========================================================================
    // External work
    // ========================================================================

    /// Register an event waiter for a consume-event style state.
    ///
    /// Context values of the form `"{{ query }}"` are replaced by
    /// evaluating the inner jq query against the state document; the result
    /// must be a boolean, number, or string.
    pub async fn listen_for_events(
        &self,
        wli: &LogicInstance,
        events: &[ConsumeEventDefinition],
        all_of: bool,
    ) -> Result<()> {
        let signature = serde_json::to_vec(&EventsWaiterSignature {
            instance_id: wli.id().to_string(),
            step: wli.step(),
        })?;

        let mut transformed = Vec::with_capacity(events.len());
        for (i, def) in events.iter().enumerate() {
            let mut ev = def.clone();
            for (key, value) in def.context.iter() {
                let Some(s) = value.as_str() else { continue };
                let Some(query) = s
                    .strip_prefix("{{")
                    .and_then(|rest| rest.strip_suffix("}}"))
                else {
                    continue;
                };
                let result = wli.jq_one(query).await.map_err(|e| {
                    EngineError::internal_msg(format!(
                        "failed to execute jq query for key '{key}' on event definition {i}: {e}"
                    ))
                })?;
                match &result {
                    Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
                    _ => {
                        return Err(EngineError::internal_msg(format!(
                            "jq query on key '{key}' for event definition {i} returned an unacceptable type"
                        )));
                    }
                }
                ev.context.insert(key.clone(), result);
            }
            transformed.push(ev);
        }

        self.store
            .add_event_listener(&EventListenerRecord {
                workflow_id: wli.workflow_id(),
                events: transformed,
                signature,
                all_of,
            })
            .await?;

        wli.log("Registered to receive events.");
        Ok(())
    }

    /// Fire-and-forget request to run a container action. Completion is
    /// reported back asynchronously as an action result.
    pub async fn do_action_request(&self, request: IsolateRequest) -> Result<()> {
        self.isolate
            .run_isolate(request)
            .await
            .map_err(|e| match e {
                internal @ EngineError::Internal(_) => internal,
                other => EngineError::internal(other),
            })
    }
}

fn sanitize_invoke_error(err: EngineError, operation: &str) -> EngineError {
    match err {
        EngineError::Internal(detail) => {
            error!(operation, "internal error: {detail:#}");
            EngineError::internal_msg(INTERNAL_ERROR_MESSAGE)
        }
        other => other,
    }
}

fn decode_memory(rec: &InstanceRecord) -> Result<Option<Vec<u8>>> {
    match rec.memory.as_deref() {
        None | Some("") => Ok(None),
        Some(memory) => Ok(Some(BASE64.decode(memory).map_err(|e| {
            EngineError::internal_msg(format!("cannot decode the savedata: {e}"))
        })?)),
    }
}

fn event_payload(event: &Event) -> Result<Value> {
    let is_json = event
        .datacontenttype()
        .map(|ct| ct == "application/json")
        .unwrap_or(true);
    let payload = match event.data() {
        None => Value::Null,
        Some(Data::Json(v)) => v.clone(),
        Some(Data::String(s)) => {
            if is_json {
                serde_json::from_str(s).map_err(|e| {
                    EngineError::internal_msg(format!("invalid json payload for event: {e}"))
                })?
            } else {
                Value::String(BASE64.encode(s.as_bytes()))
            }
        }
        Some(Data::Binary(b)) => {
            if is_json {
                serde_json::from_slice(b).map_err(|e| {
                    EngineError::internal_msg(format!("invalid json payload for event: {e}"))
                })?
            } else {
                Value::String(BASE64.encode(b))
            }
        }
    };
    Ok(payload)
}

/// Launch a run pass for an already-loaded instance on a fresh task.
fn spawn_run(
    engine: Arc<Engine>,
    wli: LogicInstance,
    savedata: Option<Vec<u8>>,
    wakedata: Option<Vec<u8>>,
) {
    tokio::spawn(async move {
        engine.run_state(wli, savedata, wakedata).await;
    });
}

/// Load an instance under its lock and run it, on a fresh task.
pub(crate) fn spawn_resume(
    engine: Arc<Engine>,
    instance_id: String,
    step: usize,
    savedata: Option<Vec<u8>>,
    wakedata: Option<Vec<u8>>,
) {
    tokio::spawn(async move {
        match LogicInstance::load(engine.clone(), &instance_id, step).await {
            Ok(wli) => engine.run_state(wli, savedata, wakedata).await,
            Err(e) => {
                error!(instance = %instance_id, "cannot load workflow logic instance: {e:#}");
            }
        }
    });
}

/// Launch a transition on a fresh task.
fn spawn_transition(wli: LogicInstance, next_state: String, attempt: i32) {
    tokio::spawn(async move {
        wli.transition(next_state, attempt).await;
    });
}

/// Cancel a child subflow on a fresh task.
fn spawn_hard_cancel(engine: Arc<Engine>, instance_id: String) {
    tokio::spawn(async move {
        if let Err(e) = engine
            .hard_cancel(
                &instance_id,
                ERR_CODE_CANCELLED_BY_PARENT,
                "cancelled by parent workflow",
            )
            .await
        {
            error!(instance = %instance_id, "cannot cancel child workflow: {e:#}");
        }
    });
}

// ============================================================================
// Timer callbacks
// ============================================================================

struct SleepWakeupCallback {
    engine: Weak<Engine>,
}

#[async_trait]
impl TimerCallback for SleepWakeupCallback {
    async fn fire(&self, payload: Vec<u8>) {
        if let Some(engine) = self.engine.upgrade() {
            engine.sleep_wakeup(&payload).await;
        }
    }
}

struct RetryWakeupCallback {
    engine: Weak<Engine>,
}

#[async_trait]
impl TimerCallback for RetryWakeupCallback {
    async fn fire(&self, payload: Vec<u8>) {
        if let Some(engine) = self.engine.upgrade() {
            engine.retry_wakeup(&payload).await;
        }
    }
}

struct TimeoutCallback {
    engine: Weak<Engine>,
}

#[async_trait]
impl TimerCallback for TimeoutCallback {
    async fn fire(&self, payload: Vec<u8>) {
        if let Some(engine) = self.engine.upgrade() {
            engine.timeout_handler(&payload).await;
        }
    }
}

struct WfCronCallback {
    engine: Weak<Engine>,
}

#[async_trait]
impl TimerCallback for WfCronCallback {
    async fn fire(&self, payload: Vec<u8>) {
        if let Some(engine) = self.engine.upgrade() {
            engine.wf_cron(&payload).await;
        }
    }
}
