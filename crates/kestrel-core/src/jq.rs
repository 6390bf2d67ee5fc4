// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded jq evaluation over the state document.
//!
//! Three shapes: [`jq`] yields every result of a query, [`jq_one`] requires
//! exactly one result, and [`jq_object`] additionally requires that result
//! to be an object. Queries that fail to parse raise a catchable
//! `direktiv.jq.badCommand`; errors raised while iterating results are
//! uncatchable with the same code. Every evaluation runs on a blocking
//! thread bounded by a ten second budget; exhausting the budget is an
//! internal error.

use std::time::Duration;

use jaq_interpret::{Ctx, FilterT, ParseCtx, RcIter, Val};
use serde_json::Value;

use crate::error::{EngineError, Result, ERR_CODE_JQ_BAD_QUERY, ERR_CODE_JQ_NOT_OBJECT};

/// Wall-clock budget for a single jq evaluation.
pub const JQ_BUDGET: Duration = Duration::from_secs(10);

/// Run a jq query against a JSON document, yielding every result.
pub async fn jq(input: &Value, command: &str) -> Result<Vec<Value>> {
    let input = input.clone();
    let command = command.to_string();
    let task = tokio::task::spawn_blocking(move || evaluate(&input, &command));
    match tokio::time::timeout(JQ_BUDGET, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(EngineError::internal_msg(format!(
            "jq evaluation panicked: {join}"
        ))),
        Err(_) => Err(EngineError::internal_msg(
            "jq evaluation exceeded its time budget",
        )),
    }
}

/// Run a jq query that must produce exactly one result.
pub async fn jq_one(input: &Value, command: &str) -> Result<Value> {
    let mut output = jq(input, command).await?;
    if output.len() != 1 {
        return Err(EngineError::catchable(
            ERR_CODE_JQ_NOT_OBJECT,
            "the jq query produced multiple outputs",
        ));
    }
    Ok(output.remove(0))
}

/// Run a jq query that must produce exactly one object.
pub async fn jq_object(input: &Value, command: &str) -> Result<serde_json::Map<String, Value>> {
    match jq_one(input, command).await? {
        Value::Object(map) => Ok(map),
        _ => Err(EngineError::catchable(
            ERR_CODE_JQ_NOT_OBJECT,
            "the jq query produced a non-object output",
        )),
    }
}

fn evaluate(input: &Value, command: &str) -> Result<Vec<Value>> {
    let mut defs = ParseCtx::new(Vec::new());
    defs.insert_natives(jaq_core::core());
    defs.insert_defs(jaq_std::std());

    let (main, errs) = jaq_parse::parse(command, jaq_parse::main());
    if !errs.is_empty() {
        let detail = errs
            .iter()
            .map(|e| format!("{e:?}"))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(EngineError::catchable(ERR_CODE_JQ_BAD_QUERY, detail));
    }
    let Some(main) = main else {
        return Err(EngineError::catchable(
            ERR_CODE_JQ_BAD_QUERY,
            "the jq query could not be parsed",
        ));
    };

    let filter = defs.compile(main);
    if !defs.errs.is_empty() {
        return Err(EngineError::catchable(
            ERR_CODE_JQ_BAD_QUERY,
            "the jq query references undefined filters",
        ));
    }

    let inputs = RcIter::new(core::iter::empty());
    let mut output = Vec::new();
    for result in filter.run((Ctx::new([], &inputs), Val::from(input.clone()))) {
        match result {
            Ok(v) => output.push(Value::from(v)),
            Err(e) => {
                return Err(EngineError::uncatchable(ERR_CODE_JQ_BAD_QUERY, e.to_string()));
            }
        }
    }

    Ok(output)
}
