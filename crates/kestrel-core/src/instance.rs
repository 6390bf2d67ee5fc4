// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The logic instance: mutable per-run view of one workflow instance.
//!
//! A [`LogicInstance`] is transient: one exists per execution pass, holding
//! the decoded state document, the persisted record snapshot, the resolved
//! state logic, and (once acquired) the advisory lock handle. The record is
//! the source of truth; every persisted update refreshes the snapshot.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kestrel_model::Workflow;
use rand::rngs::OsRng;
use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::engine::{spawn_resume, AfterUnlock, Engine};
use crate::error::{
    EngineError, Result, ERR_CODE_MULTIPLE_ERRORS, ERR_CODE_NO_SUCH_WORKFLOW,
};
use crate::jq;
use crate::locks::lock_key;
use crate::logic::StateLogic;
use crate::store::{status, InstanceRecord, LockHandle};
use crate::{
    duration, DEFAULT_SOFT_TIMEOUT, HARD_TIMEOUT_GRACE, INSTANCE_ID_SUFFIX_LEN, LOCK_WAIT,
    RETRY_INLINE_THRESHOLD,
};

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Random instance-id suffix drawn from `[A-Za-z]` with a CSPRNG.
pub(crate) fn rand_suffix(n: usize) -> String {
    let mut rng = OsRng;
    (0..n)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

/// Normalize raw invocation input into the initial state document.
///
/// The bytes are JSON-parsed; unparseable input is re-encoded as base64 and
/// wrapped as `{"input": "<b64>"}`; a parsed non-object is wrapped as
/// `{"input": value}`.
pub(crate) fn normalize_input(input: &[u8]) -> Value {
    let parsed: Value = match serde_json::from_slice(input) {
        Ok(v) => v,
        Err(_) => Value::String(BASE64.encode(input)),
    };
    match parsed {
        Value::Object(_) => parsed,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("input".to_string(), other);
            Value::Object(map)
        }
    }
}

/// Mutable per-run view of one workflow instance.
pub struct LogicInstance {
    pub(crate) engine: Arc<Engine>,
    wf: Arc<Workflow>,
    workflow_id: Uuid,
    pub(crate) rec: InstanceRecord,
    data: Value,
    step: usize,
    namespace: String,
    id: String,
    pub(crate) logic: Option<Arc<dyn StateLogic>>,
    lock: Option<LockHandle>,
    pub(crate) cancel: CancellationToken,
}

struct LoadedParts {
    wf: Arc<Workflow>,
    workflow_id: Uuid,
    rec: InstanceRecord,
    data: Value,
    namespace: String,
    logic: Arc<dyn StateLogic>,
}

impl LogicInstance {
    /// Build a fresh, unpersisted instance for an invocation.
    pub(crate) async fn new(
        engine: Arc<Engine>,
        namespace: &str,
        name: &str,
        input: &[u8],
    ) -> Result<Self> {
        let data = normalize_input(input);

        let wf_rec = engine
            .store()
            .get_workflow(namespace, name)
            .await?
            .ok_or_else(|| {
                EngineError::uncatchable(
                    ERR_CODE_NO_SUCH_WORKFLOW,
                    format!("workflow '{name}' does not exist"),
                )
            })?;
        let wf = Workflow::load(&wf_rec.definition)?;

        let id = format!(
            "{namespace}/{name}/{}",
            rand_suffix(INSTANCE_ID_SUFFIX_LEN)
        );
        let state_data = serde_json::to_string(&data)?;

        let rec = InstanceRecord {
            instance_id: id.clone(),
            namespace: namespace.to_string(),
            workflow_ref: name.to_string(),
            status: status::PENDING.to_string(),
            flow: Vec::new(),
            state_data,
            memory: None,
            attempts: 0,
            deadline: None,
            invoked_by: None,
            error_code: None,
            error_message: None,
            output: None,
            start_time: Utc::now(),
            end_time: None,
        };

        Ok(Self {
            engine,
            wf: Arc::new(wf),
            workflow_id: wf_rec.id,
            rec,
            data,
            step: 0,
            namespace: namespace.to_string(),
            id,
            logic: None,
            lock: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Load an instance under its advisory lock for a run pass at `step`.
    ///
    /// Revalidates what duplicate timer deliveries would otherwise break:
    /// the instance must still be live and its persisted flow must be
    /// exactly `step` states long.
    pub(crate) async fn load(engine: Arc<Engine>, id: &str, step: usize) -> Result<Self> {
        let key = lock_key(id);
        let handle = engine
            .store()
            .lock_instance(key, LOCK_WAIT)
            .await
            .map_err(|e| {
                EngineError::internal_msg(format!(
                    "cannot assume control of workflow instance lock: {e}"
                ))
            })?;
        let cancel = engine.cancels().register(id);

        match Self::load_parts(&engine, id, step).await {
            Ok(parts) => Ok(Self {
                engine,
                wf: parts.wf,
                workflow_id: parts.workflow_id,
                rec: parts.rec,
                data: parts.data,
                step,
                namespace: parts.namespace,
                id: id.to_string(),
                logic: Some(parts.logic),
                lock: Some(handle),
                cancel,
            }),
            Err(e) => {
                engine.cancels().cancel(id);
                if let Err(unlock_err) = engine.store().unlock_instance(handle).await {
                    error!(instance = %id, "failed to unlock instance after aborted load: {unlock_err:#}");
                }
                Err(e)
            }
        }
    }

    async fn load_parts(engine: &Arc<Engine>, id: &str, step: usize) -> Result<LoadedParts> {
        let rec = engine
            .store()
            .get_instance(id)
            .await?
            .ok_or_else(|| EngineError::internal_msg(format!("no such instance: {id}")))?;

        let wf_rec = engine
            .store()
            .get_workflow(&rec.namespace, &rec.workflow_ref)
            .await?
            .ok_or_else(|| {
                EngineError::internal_msg(format!(
                    "cannot resolve instance workflow: {}",
                    rec.workflow_ref
                ))
            })?;
        let wf = Workflow::load(&wf_rec.definition)?;

        let data: Value = serde_json::from_str(&rec.state_data).map_err(|e| {
            EngineError::internal_msg(format!("cannot load saved workflow state data: {e}"))
        })?;

        if !status::is_live(&rec.status) {
            return Err(EngineError::internal_msg(
                "aborting workflow logic: database records instance terminated",
            ));
        }

        if step == 0 || rec.flow.len() != step {
            return Err(EngineError::internal_msg(format!(
                "aborting workflow logic: steps out of sync (expect/actual - {}/{})",
                step,
                rec.flow.len()
            )));
        }

        let state_id = rec.flow[step - 1].clone();
        let state = wf.state(&state_id).ok_or_else(|| {
            EngineError::internal_msg(format!("workflow cannot resolve state: {state_id}"))
        })?;
        let logic = engine.registry().init(&wf, state)?;

        Ok(LoadedParts {
            wf: Arc::new(wf),
            workflow_id: wf_rec.id,
            namespace: rec.namespace.clone(),
            rec,
            data,
            logic,
        })
    }

    /// The instance id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current step: the count of states entered.
    pub fn step(&self) -> usize {
        self.step
    }

    /// The namespace the instance runs in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The persisted record snapshot.
    pub fn record(&self) -> &InstanceRecord {
        &self.rec
    }

    /// The workflow model this instance executes.
    pub fn workflow(&self) -> &Workflow {
        &self.wf
    }

    /// The stored workflow's stable id.
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// The decoded state document.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Emit a line to the per-instance log stream.
    pub fn log(&self, msg: impl AsRef<str>) {
        info!(
            target: "kestrel::instance",
            instance = %self.id,
            step = self.step,
            "{}",
            msg.as_ref()
        );
    }

    /// Run a jq query against the state document.
    pub async fn jq(&self, command: &str) -> Result<Vec<Value>> {
        jq::jq(&self.data, command).await
    }

    /// Run a jq query that must produce exactly one result.
    pub async fn jq_one(&self, command: &str) -> Result<Value> {
        jq::jq_one(&self.data, command).await
    }

    /// Run a jq query that must produce exactly one object.
    pub async fn jq_object(&self, command: &str) -> Result<serde_json::Map<String, Value>> {
        jq::jq_object(&self.data, command).await
    }

    /// Replace the state document with the result of a jq transform. The
    /// result must be an object.
    pub async fn transform(&mut self, transform: &str) -> Result<()> {
        let map = jq::jq_object(&self.data, transform)
            .await
            .map_err(|e| match e {
                EngineError::Catchable { code, message } => EngineError::Catchable {
                    code,
                    message: format!("unable to apply transform: {message}"),
                },
                other => other,
            })?;
        self.data = Value::Object(map);
        Ok(())
    }

    /// Insert a top-level key into the state document.
    pub fn store_data(&mut self, key: &str, value: Value) -> Result<()> {
        match &mut self.data {
            Value::Object(map) => {
                map.insert(key.to_string(), value);
                Ok(())
            }
            _ => Err(EngineError::internal_msg(
                "unable to store data because state data isn't a valid JSON object",
            )),
        }
    }

    /// Record an error on the instance.
    ///
    /// The error code is written at most once per instance lifetime; a
    /// second raise yields `direktiv.workflow.multipleErrors`.
    pub async fn raise(&mut self, code: &str, message: &str) -> Result<()> {
        if self.rec.has_error_code() {
            return Err(EngineError::catchable(
                ERR_CODE_MULTIPLE_ERRORS,
                "the workflow instance tried to throw multiple errors",
            ));
        }
        self.rec = self
            .engine
            .store()
            .fail_instance(&self.id, status::FAILED, code, message, None)
            .await?;
        Ok(())
    }

    /// Persist opaque scratch bytes for a suspended state.
    pub async fn save_memory(&mut self, data: &[u8]) -> Result<()> {
        let encoded = BASE64.encode(data);
        self.rec = self
            .engine
            .store()
            .update_memory(&self.id, Some(&encoded))
            .await?;
        Ok(())
    }

    /// Acquire the advisory lock and register the cancellation token.
    pub(crate) async fn lock(&mut self) -> Result<()> {
        let key = lock_key(&self.id);
        let handle = self
            .engine
            .store()
            .lock_instance(key, LOCK_WAIT)
            .await
            .map_err(|e| {
                EngineError::internal_msg(format!(
                    "cannot assume control of workflow instance lock: {e}"
                ))
            })?;
        self.cancel = self.engine.cancels().register(&self.id);
        self.lock = Some(handle);
        Ok(())
    }

    /// Release the advisory lock; fires the local cancellation signal.
    pub(crate) async fn unlock(&mut self) {
        if let Some(handle) = self.lock.take() {
            self.engine.cancels().cancel(&self.id);
            if let Err(e) = self.engine.store().unlock_instance(handle).await {
                error!(instance = %self.id, "failed to unlock instance: {e:#}");
            }
        }
    }

    pub(crate) async fn schedule_soft_timeout(&self, at: DateTime<Utc>) {
        self.engine
            .schedule_timeout(&self.id, self.step, at, true)
            .await;
    }

    pub(crate) async fn schedule_hard_timeout(&self, at: DateTime<Utc>) {
        self.engine
            .schedule_timeout(&self.id, self.step, at, false)
            .await;
    }

    /// Re-arm the current state after a caught failure.
    ///
    /// Restores the state document from the persisted `state_data`
    /// (discarding mutations from the failed pass), bumps the attempt
    /// counter, and either sleeps in-process (short delays) or schedules a
    /// retry wakeup timer.
    pub(crate) async fn retry(&mut self, delay: &str, multiplier: f64) -> Result<AfterUnlock> {
        let restored: Value = serde_json::from_str(&self.rec.state_data)?;
        self.data = restored;

        let attempt = self.rec.attempts + 1;
        let now = Utc::now();
        let base = duration::span(delay, now)?;
        let effective = duration::backoff(base, multiplier, attempt);
        let schedule = now
            + ChronoDuration::from_std(effective)
                .map_err(|e| EngineError::internal_msg(format!("retry delay overflow: {e}")))?;

        let logic = self
            .logic
            .clone()
            .ok_or_else(|| EngineError::internal_msg("no state logic loaded"))?;
        let deadline = schedule + ChronoDuration::seconds(5) + (logic.deadline() - now);

        self.rec = self.engine.store().update_deadline(&self.id, deadline).await?;
        self.rec = self.engine.store().update_attempts(&self.id, attempt).await?;
        self.schedule_soft_timeout(deadline).await;

        if effective < RETRY_INLINE_THRESHOLD {
            tokio::time::sleep(effective).await;
            self.log("Retrying failed workflow state.");
            Ok(AfterUnlock::Resume)
        } else {
            self.log(format!(
                "Scheduling a retry for the failed workflow state at approximate time: {}.",
                schedule.to_rfc3339()
            ));
            let state = self.rec.flow.last().cloned().unwrap_or_default();
            self.engine
                .schedule_retry(&self.id, &state, self.step, schedule)
                .await?;
            Ok(AfterUnlock::Nothing)
        }
    }

    /// Advance the persisted flow into `next_state` and launch the next run
    /// pass.
    ///
    /// Acquires the lock if not already held; releases it before returning.
    pub(crate) async fn transition(mut self, next_state: String, attempt: i32) {
        if self.lock.is_none() {
            if let Err(e) = self.lock().await {
                error!(instance = %self.id, "cannot lock instance for transition: {e:#}");
                return;
            }
        }
        let result = self.transition_inner(&next_state, attempt).await;
        self.unlock().await;
        if let Err(e) = result {
            error!(instance = %self.id, next_state = %next_state, "transition aborted: {e:#}");
        }
    }

    async fn transition_inner(&mut self, next_state: &str, attempt: i32) -> Result<()> {
        if next_state.is_empty() {
            // caller bug, not a runtime condition
            panic!("transition called with an empty next state");
        }

        if self.step == 0 {
            let now = Utc::now();
            let mut t_soft = now
                + ChronoDuration::from_std(DEFAULT_SOFT_TIMEOUT).expect("constant duration fits");
            let mut t_hard =
                t_soft + ChronoDuration::from_std(HARD_TIMEOUT_GRACE).expect("constant duration fits");
            if let Some(timeouts) = self.wf.timeouts.clone() {
                if let Some(interrupt) = timeouts.interrupt.as_deref() {
                    t_soft = duration::shift(&duration::parse(interrupt)?, now);
                    t_hard = t_soft
                        + ChronoDuration::from_std(HARD_TIMEOUT_GRACE)
                            .expect("constant duration fits");
                }
                if let Some(kill) = timeouts.kill.as_deref() {
                    t_hard = duration::shift(&duration::parse(kill)?, now);
                }
            }
            self.schedule_soft_timeout(t_soft).await;
            self.schedule_hard_timeout(t_hard).await;
        }

        if self.rec.flow.len() != self.step {
            return Err(EngineError::internal_msg(
                "workflow logic instance aborted for being tardy",
            ));
        }

        let state_data = serde_json::to_string(&self.data)?;

        let state = self.wf.state(next_state).ok_or_else(|| {
            EngineError::internal_msg(format!("workflow cannot resolve transition: {next_state}"))
        })?;
        let logic = self.engine.registry().init(&self.wf, state)?;
        let deadline = logic.deadline();
        self.logic = Some(logic);

        let mut flow = self.rec.flow.clone();
        flow.push(next_state.to_string());
        self.step += 1;

        self.rec = self
            .engine
            .store()
            .update_transition(&self.id, deadline, attempt, &flow, &state_data)
            .await?;
        self.schedule_soft_timeout(deadline).await;

        spawn_resume(self.engine.clone(), self.id.clone(), self.step, None, None);

        Ok(())
    }
}
