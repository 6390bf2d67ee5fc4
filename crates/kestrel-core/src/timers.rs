// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timer facade: named, idempotent one-shot timers.
//!
//! The engine consumes timers through the [`TimerService`] trait so a
//! distributed timer service can be swapped in; [`InProcessTimers`] is the
//! shipped implementation over tokio tasks. Delivery is at-least-once with
//! a single firing per scheduled occurrence - handlers must tolerate double
//! delivery, which the instance loader's step check enforces downstream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// A function that can be scheduled by name.
#[async_trait]
pub trait TimerCallback: Send + Sync {
    /// Invoked with the payload the timer was scheduled with.
    async fn fire(&self, payload: Vec<u8>);
}

/// Named one-shot timer service.
#[async_trait]
pub trait TimerService: Send + Sync {
    /// Register a named function timers can be scheduled against.
    async fn register_function(&self, fn_name: &str, callback: Arc<dyn TimerCallback>)
        -> Result<()>;

    /// Schedule a one-shot timer. If a timer with this id already exists it
    /// is replaced.
    async fn add_one_shot(
        &self,
        id: &str,
        fn_name: &str,
        at: DateTime<Utc>,
        payload: Vec<u8>,
    ) -> Result<()>;

    /// Delete a timer by name. Returns whether a timer existed.
    async fn delete_timer(&self, id: &str) -> Result<bool>;

    /// Delete every timer whose name refers to an instance. Returns the
    /// number of timers deleted.
    async fn delete_timers_for_instance(&self, instance_id: &str) -> Result<usize>;
}

/// In-process timer service over tokio tasks.
#[derive(Clone, Default)]
pub struct InProcessTimers {
    inner: Arc<TimersInner>,
}

#[derive(Default)]
struct TimersInner {
    functions: RwLock<HashMap<String, Arc<dyn TimerCallback>>>,
    timers: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl InProcessTimers {
    /// Create an empty timer service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently scheduled timers.
    pub fn scheduled(&self) -> usize {
        self.inner.timers.lock().expect("timer table poisoned").len()
    }
}

#[async_trait]
impl TimerService for InProcessTimers {
    async fn register_function(
        &self,
        fn_name: &str,
        callback: Arc<dyn TimerCallback>,
    ) -> Result<()> {
        let mut functions = self
            .inner
            .functions
            .write()
            .expect("timer function table poisoned");
        if functions.insert(fn_name.to_string(), callback).is_some() {
            return Err(EngineError::internal_msg(format!(
                "timer function registered twice: {fn_name}"
            )));
        }
        Ok(())
    }

    async fn add_one_shot(
        &self,
        id: &str,
        fn_name: &str,
        at: DateTime<Utc>,
        payload: Vec<u8>,
    ) -> Result<()> {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let inner = self.inner.clone();
        let timer_id = id.to_string();
        let fn_name = fn_name.to_string();

        // the task must not fire before its handle is registered below
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();

        let task_id = timer_id.clone();
        let task = tokio::spawn(async move {
            let _ = ready_rx.await;
            tokio::time::sleep(delay).await;
            // single firing: deregister before invoking
            inner
                .timers
                .lock()
                .expect("timer table poisoned")
                .remove(&task_id);
            let callback = inner
                .functions
                .read()
                .expect("timer function table poisoned")
                .get(&fn_name)
                .cloned();
            match callback {
                Some(callback) => callback.fire(payload).await,
                None => warn!(timer = %task_id, function = %fn_name, "timer fired for unregistered function"),
            }
        });

        let replaced = self
            .inner
            .timers
            .lock()
            .expect("timer table poisoned")
            .insert(timer_id.clone(), task);
        if let Some(replaced) = replaced {
            debug!(timer = %timer_id, "replacing existing timer");
            replaced.abort();
        }
        let _ = ready_tx.send(());

        Ok(())
    }

    async fn delete_timer(&self, id: &str) -> Result<bool> {
        let task = self
            .inner
            .timers
            .lock()
            .expect("timer table poisoned")
            .remove(id);
        match task {
            Some(task) => {
                task.abort();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_timers_for_instance(&self, instance_id: &str) -> Result<usize> {
        let mut timers = self.inner.timers.lock().expect("timer table poisoned");
        let doomed: Vec<String> = timers
            .keys()
            .filter(|id| id.as_str() == instance_id || id.contains(instance_id))
            .cloned()
            .collect();
        for id in &doomed {
            if let Some(task) = timers.remove(id) {
                task.abort();
            }
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Recorder {
        fired: AtomicUsize,
        last_payload: Mutex<Vec<u8>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fired: AtomicUsize::new(0),
                last_payload: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TimerCallback for Recorder {
        async fn fire(&self, payload: Vec<u8>) {
            *self.last_payload.lock().unwrap() = payload;
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn soon() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(20)
    }

    #[tokio::test]
    async fn test_one_shot_fires_once() {
        let timers = InProcessTimers::new();
        let recorder = Recorder::new();
        timers
            .register_function("wake", recorder.clone())
            .await
            .unwrap();
        timers
            .add_one_shot("t1", "wake", soon(), b"hello".to_vec())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.fired.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.last_payload.lock().unwrap(), b"hello");
        assert_eq!(timers.scheduled(), 0);
    }

    #[tokio::test]
    async fn test_add_one_shot_replaces_existing_id() {
        let timers = InProcessTimers::new();
        let recorder = Recorder::new();
        timers
            .register_function("wake", recorder.clone())
            .await
            .unwrap();
        timers
            .add_one_shot("t1", "wake", soon(), b"first".to_vec())
            .await
            .unwrap();
        timers
            .add_one_shot("t1", "wake", soon(), b"second".to_vec())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.fired.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.last_payload.lock().unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_delete_timer_prevents_firing() {
        let timers = InProcessTimers::new();
        let recorder = Recorder::new();
        timers
            .register_function("wake", recorder.clone())
            .await
            .unwrap();
        timers
            .add_one_shot("t1", "wake", soon(), Vec::new())
            .await
            .unwrap();
        assert!(timers.delete_timer("t1").await.unwrap());
        assert!(!timers.delete_timer("t1").await.unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delete_timers_for_instance_matches_derived_names() {
        let timers = InProcessTimers::new();
        let recorder = Recorder::new();
        timers
            .register_function("wake", recorder.clone())
            .await
            .unwrap();
        let id = "ns/wf/AbCdEf";
        let far = Utc::now() + chrono::Duration::hours(1);
        timers
            .add_one_shot(id, "wake", far, Vec::new())
            .await
            .unwrap();
        timers
            .add_one_shot(&format!("timeout:{id}"), "wake", far, Vec::new())
            .await
            .unwrap();
        timers
            .add_one_shot(&format!("timeout:{id}:3"), "wake", far, Vec::new())
            .await
            .unwrap();
        timers
            .add_one_shot("ns/other/XyZabc", "wake", far, Vec::new())
            .await
            .unwrap();

        let deleted = timers.delete_timers_for_instance(id).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(timers.scheduled(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_function_registration_rejected() {
        let timers = InProcessTimers::new();
        let recorder = Recorder::new();
        timers
            .register_function("wake", recorder.clone())
            .await
            .unwrap();
        assert!(timers.register_function("wake", recorder).await.is_err());
    }
}
