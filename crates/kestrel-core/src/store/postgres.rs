// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed store implementation.
//!
//! Advisory instance locks use `pg_advisory_lock` on a dedicated pooled
//! connection; the connection is carried inside the [`LockHandle`] until
//! release so the session holding the lock stays alive.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::error::{EngineError, Result};

use super::{status, EventListenerRecord, InstanceRecord, LockHandle, Store, WorkflowRecord};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const INSTANCE_COLUMNS: &str = "instance_id, namespace, workflow_ref, status, flow, state_data, \
     memory, attempts, deadline, invoked_by, error_code, error_message, output, start_time, end_time";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool. Migrations are the caller's responsibility.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to a database and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| EngineError::internal_msg(format!("cannot run migrations: {e}")))?;
        Ok(Self { pool })
    }

    async fn fetch_instance(&self, instance_id: &str) -> Result<InstanceRecord> {
        let query = format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE instance_id = $1");
        sqlx::query_as::<_, InstanceRecord>(&query)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::internal_msg(format!("no such instance: {instance_id}")))
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn put_workflow(
        &self,
        namespace: &str,
        name: &str,
        definition: &str,
    ) -> Result<WorkflowRecord> {
        let record = sqlx::query_as::<_, WorkflowRecord>(
            r#"
            INSERT INTO workflows (id, namespace, name, definition)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (namespace, name)
            DO UPDATE SET definition = EXCLUDED.definition
            RETURNING id, namespace, name, definition
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(namespace)
        .bind(name)
        .bind(definition)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_workflow(&self, namespace: &str, name: &str) -> Result<Option<WorkflowRecord>> {
        let record = sqlx::query_as::<_, WorkflowRecord>(
            "SELECT id, namespace, name, definition FROM workflows WHERE namespace = $1 AND name = $2",
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_workflow_by_id(&self, id: Uuid) -> Result<Option<WorkflowRecord>> {
        let record = sqlx::query_as::<_, WorkflowRecord>(
            "SELECT id, namespace, name, definition FROM workflows WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn create_instance(&self, record: &InstanceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO instances (instance_id, namespace, workflow_ref, status, flow, state_data,
                                   memory, attempts, deadline, invoked_by, error_code,
                                   error_message, output, start_time, end_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(&record.instance_id)
        .bind(&record.namespace)
        .bind(&record.workflow_ref)
        .bind(&record.status)
        .bind(&record.flow)
        .bind(&record.state_data)
        .bind(&record.memory)
        .bind(record.attempts)
        .bind(record.deadline)
        .bind(&record.invoked_by)
        .bind(&record.error_code)
        .bind(&record.error_message)
        .bind(&record.output)
        .bind(record.start_time)
        .bind(record.end_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceRecord>> {
        let query = format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE instance_id = $1");
        let record = sqlx::query_as::<_, InstanceRecord>(&query)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn update_transition(
        &self,
        instance_id: &str,
        deadline: DateTime<Utc>,
        attempts: i32,
        flow: &[String],
        state_data: &str,
    ) -> Result<InstanceRecord> {
        sqlx::query(
            r#"
            UPDATE instances
            SET status = $2, deadline = $3, attempts = $4, flow = $5, state_data = $6, memory = NULL
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .bind(status::RUNNING)
        .bind(deadline)
        .bind(attempts)
        .bind(flow.to_vec())
        .bind(state_data)
        .execute(&self.pool)
        .await?;
        self.fetch_instance(instance_id).await
    }

    async fn update_memory(
        &self,
        instance_id: &str,
        memory: Option<&str>,
    ) -> Result<InstanceRecord> {
        sqlx::query("UPDATE instances SET memory = $2 WHERE instance_id = $1")
            .bind(instance_id)
            .bind(memory)
            .execute(&self.pool)
            .await?;
        self.fetch_instance(instance_id).await
    }

    async fn update_deadline(
        &self,
        instance_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<InstanceRecord> {
        sqlx::query("UPDATE instances SET deadline = $2 WHERE instance_id = $1")
            .bind(instance_id)
            .bind(deadline)
            .execute(&self.pool)
            .await?;
        self.fetch_instance(instance_id).await
    }

    async fn update_attempts(&self, instance_id: &str, attempts: i32) -> Result<InstanceRecord> {
        sqlx::query("UPDATE instances SET attempts = $2 WHERE instance_id = $1")
            .bind(instance_id)
            .bind(attempts)
            .execute(&self.pool)
            .await?;
        self.fetch_instance(instance_id).await
    }

    async fn set_invoked_by(&self, instance_id: &str, invoked_by: &str) -> Result<InstanceRecord> {
        sqlx::query("UPDATE instances SET invoked_by = $2 WHERE instance_id = $1")
            .bind(instance_id)
            .bind(invoked_by)
            .execute(&self.pool)
            .await?;
        self.fetch_instance(instance_id).await
    }

    async fn complete_instance(
        &self,
        instance_id: &str,
        output: &str,
        end_time: DateTime<Utc>,
    ) -> Result<InstanceRecord> {
        sqlx::query(
            "UPDATE instances SET status = $2, output = $3, end_time = $4 WHERE instance_id = $1",
        )
        .bind(instance_id)
        .bind(status::COMPLETE)
        .bind(output)
        .bind(end_time)
        .execute(&self.pool)
        .await?;
        self.fetch_instance(instance_id).await
    }

    async fn fail_instance(
        &self,
        instance_id: &str,
        new_status: &str,
        error_code: &str,
        error_message: &str,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<InstanceRecord> {
        sqlx::query(
            r#"
            UPDATE instances
            SET status = $2, error_code = $3, error_message = $4,
                end_time = COALESCE($5, end_time)
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .bind(new_status)
        .bind(error_code)
        .bind(error_message)
        .bind(end_time)
        .execute(&self.pool)
        .await?;
        self.fetch_instance(instance_id).await
    }

    async fn cancel_if_live(
        &self,
        instance_id: &str,
        error_code: &str,
        error_message: &str,
        end_time: DateTime<Utc>,
    ) -> Result<Option<InstanceRecord>> {
        let query = format!(
            r#"
            UPDATE instances
            SET status = $2, error_code = $3, error_message = $4, end_time = $5
            WHERE instance_id = $1 AND status IN ('pending', 'running')
            RETURNING {INSTANCE_COLUMNS}
            "#
        );
        let record = sqlx::query_as::<_, InstanceRecord>(&query)
            .bind(instance_id)
            .bind(status::CANCELLED)
            .bind(error_code)
            .bind(error_message)
            .bind(end_time)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn add_event_listener(&self, listener: &EventListenerRecord) -> Result<()> {
        let events = serde_json::to_string(&listener.events)?;
        sqlx::query(
            r#"
            INSERT INTO event_listeners (workflow_id, events, signature, all_of)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(listener.workflow_id)
        .bind(events)
        .bind(&listener.signature)
        .bind(listener.all_of)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lock_instance(&self, key: i64, wait: Duration) -> Result<LockHandle> {
        let mut conn = self.pool.acquire().await?;
        let acquire = sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(&mut *conn);
        match tokio::time::timeout(wait, acquire).await {
            Ok(Ok(_)) => Ok(LockHandle::new(key, conn)),
            Ok(Err(e)) => Err(e.into()),
            // dropping the connection mid-query abandons the lock request
            Err(_) => Err(EngineError::internal_msg(format!(
                "timed out waiting for instance lock {key}"
            ))),
        }
    }

    async fn unlock_instance(&self, mut handle: LockHandle) -> Result<()> {
        let key = handle.key();
        match handle.take_guard::<PoolConnection<Postgres>>() {
            Some(mut conn) => {
                sqlx::query("SELECT pg_advisory_unlock($1)")
                    .bind(key)
                    .execute(&mut **conn)
                    .await?;
                Ok(())
            }
            None => Err(EngineError::internal_msg(
                "lock handle does not belong to this store",
            )),
        }
    }
}
