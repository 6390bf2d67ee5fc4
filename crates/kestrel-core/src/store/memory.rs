// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store backend.
//!
//! Backs tests and embedded single-process deployments. Advisory locks are
//! per-key tokio mutexes, which gives the same mutual-exclusion semantics
//! as the PostgreSQL backend within one process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::{EngineError, Result};

use super::{
    status, EventListenerRecord, InstanceRecord, LockHandle, Store, WorkflowRecord,
};

/// In-memory store backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    workflows: Mutex<Vec<WorkflowRecord>>,
    instances: Mutex<HashMap<String, InstanceRecord>>,
    listeners: Mutex<Vec<EventListenerRecord>>,
    locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instance records held. Test helper.
    pub fn instance_count(&self) -> usize {
        self.inner.instances.lock().expect("instance table poisoned").len()
    }

    /// Ids of all instance records held. Test helper.
    pub fn instance_ids(&self) -> Vec<String> {
        self.inner
            .instances
            .lock()
            .expect("instance table poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of all registered event listeners. Test helper.
    pub fn event_listeners(&self) -> Vec<EventListenerRecord> {
        self.inner
            .listeners
            .lock()
            .expect("listener table poisoned")
            .clone()
    }

    fn with_instance<F>(&self, instance_id: &str, mutate: F) -> Result<InstanceRecord>
    where
        F: FnOnce(&mut InstanceRecord),
    {
        let mut instances = self.inner.instances.lock().expect("instance table poisoned");
        let record = instances
            .get_mut(instance_id)
            .ok_or_else(|| EngineError::internal_msg(format!("no such instance: {instance_id}")))?;
        mutate(record);
        Ok(record.clone())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_workflow(
        &self,
        namespace: &str,
        name: &str,
        definition: &str,
    ) -> Result<WorkflowRecord> {
        let mut workflows = self.inner.workflows.lock().expect("workflow table poisoned");
        if let Some(existing) = workflows
            .iter_mut()
            .find(|w| w.namespace == namespace && w.name == name)
        {
            existing.definition = definition.to_string();
            return Ok(existing.clone());
        }
        let record = WorkflowRecord {
            id: Uuid::new_v4(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            definition: definition.to_string(),
        };
        workflows.push(record.clone());
        Ok(record)
    }

    async fn get_workflow(&self, namespace: &str, name: &str) -> Result<Option<WorkflowRecord>> {
        let workflows = self.inner.workflows.lock().expect("workflow table poisoned");
        Ok(workflows
            .iter()
            .find(|w| w.namespace == namespace && w.name == name)
            .cloned())
    }

    async fn get_workflow_by_id(&self, id: Uuid) -> Result<Option<WorkflowRecord>> {
        let workflows = self.inner.workflows.lock().expect("workflow table poisoned");
        Ok(workflows.iter().find(|w| w.id == id).cloned())
    }

    async fn create_instance(&self, record: &InstanceRecord) -> Result<()> {
        let mut instances = self.inner.instances.lock().expect("instance table poisoned");
        if instances.contains_key(&record.instance_id) {
            return Err(EngineError::internal_msg(format!(
                "instance already exists: {}",
                record.instance_id
            )));
        }
        instances.insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let instances = self.inner.instances.lock().expect("instance table poisoned");
        Ok(instances.get(instance_id).cloned())
    }

    async fn update_transition(
        &self,
        instance_id: &str,
        deadline: DateTime<Utc>,
        attempts: i32,
        flow: &[String],
        state_data: &str,
    ) -> Result<InstanceRecord> {
        self.with_instance(instance_id, |record| {
            record.status = status::RUNNING.to_string();
            record.deadline = Some(deadline);
            record.attempts = attempts;
            record.flow = flow.to_vec();
            record.state_data = state_data.to_string();
            record.memory = None;
        })
    }

    async fn update_memory(
        &self,
        instance_id: &str,
        memory: Option<&str>,
    ) -> Result<InstanceRecord> {
        self.with_instance(instance_id, |record| {
            record.memory = memory.map(str::to_string);
        })
    }

    async fn update_deadline(
        &self,
        instance_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<InstanceRecord> {
        self.with_instance(instance_id, |record| {
            record.deadline = Some(deadline);
        })
    }

    async fn update_attempts(&self, instance_id: &str, attempts: i32) -> Result<InstanceRecord> {
        self.with_instance(instance_id, |record| {
            record.attempts = attempts;
        })
    }

    async fn set_invoked_by(&self, instance_id: &str, invoked_by: &str) -> Result<InstanceRecord> {
        self.with_instance(instance_id, |record| {
            record.invoked_by = Some(invoked_by.to_string());
        })
    }

    async fn complete_instance(
        &self,
        instance_id: &str,
        output: &str,
        end_time: DateTime<Utc>,
    ) -> Result<InstanceRecord> {
        self.with_instance(instance_id, |record| {
            record.status = status::COMPLETE.to_string();
            record.output = Some(output.to_string());
            record.end_time = Some(end_time);
        })
    }

    async fn fail_instance(
        &self,
        instance_id: &str,
        new_status: &str,
        error_code: &str,
        error_message: &str,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<InstanceRecord> {
        self.with_instance(instance_id, |record| {
            record.status = new_status.to_string();
            record.error_code = Some(error_code.to_string());
            record.error_message = Some(error_message.to_string());
            if end_time.is_some() {
                record.end_time = end_time;
            }
        })
    }

    async fn cancel_if_live(
        &self,
        instance_id: &str,
        error_code: &str,
        error_message: &str,
        end_time: DateTime<Utc>,
    ) -> Result<Option<InstanceRecord>> {
        let mut instances = self.inner.instances.lock().expect("instance table poisoned");
        let record = instances
            .get_mut(instance_id)
            .ok_or_else(|| EngineError::internal_msg(format!("no such instance: {instance_id}")))?;
        if !status::is_live(&record.status) {
            return Ok(None);
        }
        record.status = status::CANCELLED.to_string();
        record.error_code = Some(error_code.to_string());
        record.error_message = Some(error_message.to_string());
        record.end_time = Some(end_time);
        Ok(Some(record.clone()))
    }

    async fn add_event_listener(&self, listener: &EventListenerRecord) -> Result<()> {
        self.inner
            .listeners
            .lock()
            .expect("listener table poisoned")
            .push(listener.clone());
        Ok(())
    }

    async fn lock_instance(&self, key: i64, wait: Duration) -> Result<LockHandle> {
        let mutex = {
            let mut locks = self.inner.locks.lock().expect("lock table poisoned");
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        match tokio::time::timeout(wait, mutex.lock_owned()).await {
            Ok(guard) => Ok(LockHandle::new(key, guard)),
            Err(_) => Err(EngineError::internal_msg(format!(
                "timed out waiting for instance lock {key}"
            ))),
        }
    }

    async fn unlock_instance(&self, mut handle: LockHandle) -> Result<()> {
        match handle.take_guard::<OwnedMutexGuard<()>>() {
            Some(guard) => {
                drop(guard);
                Ok(())
            }
            None => Err(EngineError::internal_msg(
                "lock handle does not belong to this store",
            )),
        }
    }
}
