// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kestrel Core - Workflow Engine Execution Core
//!
//! This crate is the instance lifecycle manager of a declarative workflow
//! engine: it creates instances, runs them state by state under a
//! cluster-wide per-instance lock, suspends them on timers and event
//! waiters, classifies failures against state-level catchers with
//! exponential retry, propagates cancellation to children, and reports
//! terminal results back up the subflow call chain.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Invocation API                                │
//! │        direct / cron / events / subflow  (engine.rs)                 │
//! └──────────────────────────────────────────────────────────────────────┘
//!                │ new LogicInstance + pending record
//!                ▼
//! ┌──────────────────────┐   transition    ┌───────────────────────────┐
//! │      Run Loop        │───────────────► │  Transition               │
//! │  run → classify →    │                 │  append flow, step++,     │
//! │  complete/fail/retry │ ◄───────────────│  persist, re-arm timeout  │
//! └──────────────────────┘  load-under-lock└───────────────────────────┘
//!        │          ▲
//!   suspend         │ wake (timer fire, event delivery, action result)
//!        ▼          │
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │   Timer Facade (timers.rs)  ·  Event Waiters  ·  Flow Service        │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │
//!        ▼
//! ┌──────────────────────┐
//! │   Store (store/)     │  advisory locks + instance records
//! └──────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: deployment configuration from environment variables
//! - [`duration`]: ISO-8601 duration parsing and retry backoff
//! - [`engine`]: invocation API, run loop, retry, cancellation, wakers
//! - [`error`]: the three-kind error model and reserved error codes
//! - [`instance`]: the mutable per-run logic instance
//! - [`jq`]: bounded jq evaluation over the state document
//! - [`locks`]: lock keys and the per-instance cancellation registry
//! - [`logic`]: the state-logic capability, registry, and built-in logics
//! - [`services`]: flow, isolate, and cluster-sync service contracts
//! - [`store`]: persistence contract with in-memory and PostgreSQL backends
//! - [`timers`]: named one-shot timer facade

#![deny(missing_docs)]

/// Deployment configuration from environment variables.
pub mod config;

/// ISO-8601 duration parsing, shifting, and retry backoff.
pub mod duration;

/// The engine: invocation API, run loop, retry, cancellation, wakers.
pub mod engine;

/// Error types and reserved error codes.
pub mod error;

/// The mutable per-run logic instance.
pub mod instance;

/// Bounded jq evaluation over the state document.
pub mod jq;

/// Lock keys and the per-instance cancellation registry.
pub mod locks;

/// State-logic capability, registry, and built-in logics.
pub mod logic;

/// External service contracts (flow, isolate, cluster sync).
pub mod services;

/// Persistence contract and backends.
pub mod store;

/// Named one-shot timer facade.
pub mod timers;

pub use engine::{Engine, EngineBuilder, SubflowCaller};
pub use error::{EngineError, Result};

use std::time::Duration;

/// Maximum number of state executions per instance.
pub const MAX_WORKFLOW_STEPS: usize = 10;

/// Maximum transitive subflow depth.
pub const MAX_SUBFLOW_DEPTH: i32 = 5;

/// How long to wait for an instance's advisory lock.
pub const LOCK_WAIT: Duration = Duration::from_secs(5);

/// Retry delays below this threshold sleep in-process instead of
/// scheduling a timer.
pub const RETRY_INLINE_THRESHOLD: Duration = Duration::from_secs(5);

/// Default workflow-level soft (interrupt) timeout.
pub const DEFAULT_SOFT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Grace period between the soft and hard timeouts.
pub const HARD_TIMEOUT_GRACE: Duration = Duration::from_secs(5 * 60);

/// Length of the random instance-id suffix.
pub const INSTANCE_ID_SUFFIX_LEN: usize = 6;

/// Maximum catcher passes per run before degrading to an internal error.
pub const CATCH_LOOP_LIMIT: u32 = 10;
