// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow Model Types - Single Source of Truth
//!
//! This crate defines the declarative workflow model consumed by the kestrel
//! engine: a workflow is a directed graph of states, each of a closed set of
//! state types, plus a start definition, workflow-level timeouts, and
//! per-state error catchers with optional retry policies.
//!
//! The model is deserialized once from JSON and is immutable afterwards; the
//! engine shares it freely between concurrent run passes. Parsing and
//! validating workflow source documents (YAML frontends etc.) is out of
//! scope here - callers hand this crate the already-JSON-shaped definition.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors produced while loading a workflow definition.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// The definition is not valid JSON for the workflow schema.
    #[error("cannot parse workflow definition: {0}")]
    Parse(#[from] serde_json::Error),

    /// The definition parsed but violates a structural rule.
    #[error("invalid workflow definition: {0}")]
    Invalid(String),
}

/// The closed set of state types understood by the engine.
///
/// The engine dispatches each type through its state-logic registry; adding
/// a variant here requires registering a matching logic factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateType {
    /// Pass-through state: transform and transition only.
    Noop,
    /// Runs an out-of-process action (container or subflow).
    Action,
    /// Waits for a single matching event.
    ConsumeEvent,
    /// Sleeps for a fixed ISO-8601 duration.
    Delay,
    /// Raises a catchable error.
    Error,
    /// Waits for all of a set of events.
    EventsAnd,
    /// Waits for the first of a set of events.
    EventsXor,
    /// Fans an action out over a collection.
    Foreach,
    /// Emits an event.
    GenerateEvent,
    /// Runs branches concurrently.
    Parallel,
    /// Conditional branching on the state document.
    Switch,
    /// Validates the state document against a schema.
    Validate,
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateType::Noop => "noop",
            StateType::Action => "action",
            StateType::ConsumeEvent => "consumeEvent",
            StateType::Delay => "delay",
            StateType::Error => "error",
            StateType::EventsAnd => "eventsAnd",
            StateType::EventsXor => "eventsXor",
            StateType::Foreach => "foreach",
            StateType::GenerateEvent => "generateEvent",
            StateType::Parallel => "parallel",
            StateType::Switch => "switch",
            StateType::Validate => "validate",
        };
        f.write_str(s)
    }
}

/// How a workflow may be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StartType {
    /// Direct invocation through the API (also required for subflows).
    #[default]
    Default,
    /// Invoked on a cron schedule.
    Scheduled,
    /// Triggered by a single event.
    Event,
    /// Triggered once all listed events have arrived.
    EventsAnd,
    /// Triggered by the first of the listed events.
    EventsXor,
}

impl fmt::Display for StartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StartType::Default => "default",
            StartType::Scheduled => "scheduled",
            StartType::Event => "event",
            StartType::EventsAnd => "eventsAnd",
            StartType::EventsXor => "eventsXor",
        };
        f.write_str(s)
    }
}

/// Start definition of a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartDefinition {
    /// Start type; `default` when absent.
    #[serde(rename = "type", default)]
    pub start_type: StartType,
    /// Explicit start state id; the first listed state when absent.
    #[serde(default)]
    pub state: Option<String>,
}

/// Retry policy attached to an error catcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDefinition {
    /// Maximum number of retry attempts before falling through to the
    /// catcher's transition.
    #[serde(rename = "maxAttempts")]
    pub max_attempts: i32,
    /// Base delay between attempts, ISO-8601 (`PT5S`).
    pub delay: String,
    /// Exponential backoff multiplier; `0` means `1.0`.
    #[serde(default)]
    pub multiplier: f64,
}

/// An error catcher on a state.
///
/// Catchers are evaluated top-down against a catchable error's code; the
/// first matching regex wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCatcher {
    /// Regex matched against the error code.
    pub error: String,
    /// Optional retry policy applied before the transition.
    #[serde(default)]
    pub retry: Option<RetryDefinition>,
    /// State to transition to once the error is caught (and retries, if
    /// any, are exhausted).
    #[serde(default)]
    pub transition: String,
}

/// Workflow-level timeouts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutsDefinition {
    /// Soft (interrupt) timeout, ISO-8601 duration.
    #[serde(default)]
    pub interrupt: Option<String>,
    /// Hard (kill) timeout, ISO-8601 duration.
    #[serde(default)]
    pub kill: Option<String>,
}

/// A single event a consume-event style state waits for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeEventDefinition {
    /// CloudEvents `type` attribute to match.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Context attribute filters. String values of the form `"{{ query }}"`
    /// are evaluated as jq against the state document at registration time.
    #[serde(default)]
    pub context: serde_json::Map<String, Value>,
}

/// One state in the workflow graph.
///
/// Fields common to every state type are modelled here; type-specific
/// configuration (a delay's `duration`, a switch's conditions, ...) is kept
/// in `extra` and interpreted by the matching state logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDefinition {
    /// Unique state id within the workflow.
    pub id: String,
    /// State type, dispatched through the logic registry.
    #[serde(rename = "type")]
    pub state_type: StateType,
    /// Optional jq transform applied to the state document on success.
    #[serde(default)]
    pub transform: Option<String>,
    /// Next state id; empty or absent means the workflow completes here.
    #[serde(default)]
    pub transition: Option<String>,
    /// Error catchers, evaluated in declaration order.
    #[serde(default)]
    pub catch: Vec<ErrorCatcher>,
    /// Optional per-state deadline, ISO-8601 duration.
    #[serde(default)]
    pub timeout: Option<String>,
    /// Type-specific configuration, owned by the state logic.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl StateDefinition {
    /// The transform to apply on success; empty string when unset.
    pub fn transform_or_default(&self) -> &str {
        self.transform.as_deref().unwrap_or("")
    }

    /// The transition target; empty string means terminal.
    pub fn transition_or_default(&self) -> &str {
        self.transition.as_deref().unwrap_or("")
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow id, unique within its namespace.
    #[serde(default)]
    pub id: String,
    /// Start definition; a default start when absent.
    #[serde(default)]
    pub start: Option<StartDefinition>,
    /// The workflow's states. The first state is the default start state.
    pub states: Vec<StateDefinition>,
    /// Workflow-level timeouts.
    #[serde(default)]
    pub timeouts: Option<TimeoutsDefinition>,
}

impl Workflow {
    /// Load a workflow from its JSON definition and validate its structure.
    pub fn load(definition: &str) -> Result<Self, ModelError> {
        let wf: Workflow = serde_json::from_str(definition)?;
        wf.validate()?;
        Ok(wf)
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.states.is_empty() {
            return Err(ModelError::Invalid("workflow defines no states".into()));
        }
        let mut seen = HashMap::new();
        for state in &self.states {
            if state.id.is_empty() {
                return Err(ModelError::Invalid("state with empty id".into()));
            }
            if seen.insert(state.id.as_str(), ()).is_some() {
                return Err(ModelError::Invalid(format!(
                    "duplicate state id: {}",
                    state.id
                )));
            }
        }
        if let Some(start) = &self.start {
            if let Some(state) = &start.state {
                if !seen.contains_key(state.as_str()) {
                    return Err(ModelError::Invalid(format!(
                        "start references unknown state: {state}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Map of state id to state definition.
    pub fn states_map(&self) -> HashMap<&str, &StateDefinition> {
        self.states.iter().map(|s| (s.id.as_str(), s)).collect()
    }

    /// Look up a state by id.
    pub fn state(&self, id: &str) -> Option<&StateDefinition> {
        self.states.iter().find(|s| s.id == id)
    }

    /// The workflow's start type; `default` when no start is declared.
    pub fn start_type(&self) -> StartType {
        self.start.as_ref().map(|s| s.start_type).unwrap_or_default()
    }

    /// The state the workflow begins in.
    pub fn start_state(&self) -> Option<&StateDefinition> {
        match self.start.as_ref().and_then(|s| s.state.as_deref()) {
            Some(id) => self.state(id),
            None => self.states.first(),
        }
    }
}
