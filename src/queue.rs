//! Task queue: Postgres-backed at-least-once delivery using
//! `FOR UPDATE SKIP LOCKED` dequeue, a shutdown-aware poll loop, and a
//! retry-with-backoff-then-dead-letter policy.
//!
//! Scheduling model: parallel worker-pool threads, each
//! task instance a single-shot receive/work/ack. At-least-once
//! delivery means every [`TaskHandler`] must be idempotent — the
//! metadata store's `create_job`/`create_page` and the status cache's
//! `put_status` already are.

#[cfg(feature = "database")]
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, TaskError};

#[cfg(feature = "database")]
use std::collections::HashMap;
#[cfg(feature = "database")]
use std::sync::Arc;
#[cfg(feature = "database")]
use chrono::{DateTime, Utc};
#[cfg(feature = "database")]
use sqlx::PgPool;
#[cfg(feature = "database")]
use tokio::sync::watch;

#[cfg(feature = "database")]
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum TaskRowStatus {
    Pending,
    Processing,
    Done,
    DeadLetter,
}

#[cfg(feature = "database")]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: Uuid,
    pub task_name: String,
    pub arguments: serde_json::Value,
    pub status: TaskRowStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `enqueue`/`enqueue_periodic` plus at-least-once delivery.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(
        &self,
        task_name: &str,
        arguments: serde_json::Value,
        max_attempts: i32,
    ) -> Result<Uuid, QueueError>;

    /// Registers a named periodic schedule. Firing on the
    /// `cron_expression` cadence is the monitor binary's
    /// responsibility (sweeps already run on their own
    /// configured intervals); this call only persists the
    /// registration so it survives a restart.
    async fn enqueue_periodic(&self, task_name: &str, cron_expression: &str) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicSchedule {
    pub task_name: String,
    pub cron_expression: String,
}

#[cfg(feature = "database")]
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
}

#[cfg(feature = "database")]
impl PostgresQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_tasks (
                id UUID PRIMARY KEY,
                task_name TEXT NOT NULL,
                arguments JSONB NOT NULL,
                status TEXT NOT NULL,
                attempts INT NOT NULL DEFAULT 0,
                max_attempts INT NOT NULL,
                available_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_periodic_schedules (
                task_name TEXT PRIMARY KEY,
                cron_expression TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl Queue for PostgresQueue {
    async fn enqueue(
        &self,
        task_name: &str,
        arguments: serde_json::Value,
        max_attempts: i32,
    ) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO queue_tasks (id, task_name, arguments, status, attempts, max_attempts, available_at, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, $5, $5, $5)
            "#,
        )
        .bind(id)
        .bind(task_name)
        .bind(&arguments)
        .bind(max_attempts)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn enqueue_periodic(&self, task_name: &str, cron_expression: &str) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO queue_periodic_schedules (task_name, cron_expression)
            VALUES ($1, $2)
            ON CONFLICT (task_name) DO UPDATE SET cron_expression = EXCLUDED.cron_expression
            "#,
        )
        .bind(task_name)
        .bind(cron_expression)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(feature = "database")]
impl PostgresQueue {
    async fn dequeue_one(&self) -> Result<Option<TaskRow>, QueueError> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            WITH next AS (
                SELECT id FROM queue_tasks
                WHERE status = 'pending' AND available_at <= $1
                ORDER BY created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE queue_tasks
            SET status = 'processing', updated_at = $1
            WHERE id IN (SELECT id FROM next)
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn mark_done(&self, id: Uuid) -> Result<(), QueueError> {
        sqlx::query("UPDATE queue_tasks SET status = 'done', updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_dead_letter(&self, id: Uuid) -> Result<(), QueueError> {
        sqlx::query("UPDATE queue_tasks SET status = 'dead_letter', updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reschedule(&self, id: Uuid, attempts: i32, delay: Duration) -> Result<(), QueueError> {
        let available_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        sqlx::query(
            r#"
            UPDATE queue_tasks
            SET status = 'pending', attempts = $2, available_at = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(available_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// One registered task type (dispatch table: `main`, `split`,
/// `page`, `merge`).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, arguments: serde_json::Value) -> Result<(), TaskError>;

    /// Backoff before attempt `attempt` (1-indexed) is redelivered.
    /// Each handler's per-type base and cap come from its own
    /// contract (MAIN `60*2^a`/3 attempts, SPLIT/PAGE/MERGE
    /// `30*2^a`/2-3 attempts).
    fn backoff_seconds(&self, attempt: u32) -> u64 {
        2u64.saturating_pow(attempt)
    }
}

/// Drives [`PostgresQueue::dequeue_one`] in a loop, dispatching each
/// row to the handler registered under its `task_name`.
#[cfg(feature = "database")]
pub struct TaskQueueListener {
    queue: PostgresQueue,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    poll_interval: Duration,
}

#[cfg(feature = "database")]
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[cfg(feature = "database")]
impl TaskQueueListener {
    pub fn new(queue: PostgresQueue, poll_interval: Duration) -> Self {
        Self { queue, handlers: HashMap::new(), poll_interval }
    }

    pub fn register(&mut self, task_name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_name.into(), handler);
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ListenerError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.process_one().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(error = %e, "queue listener iteration failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Dequeues and processes a single task. Returns `Ok(true)` if a
    /// task was found (caller should immediately poll again without
    /// sleeping), `Ok(false)` if the queue was empty.
    pub async fn process_one(&self) -> Result<bool, ListenerError> {
        let Some(row) = self.queue.dequeue_one().await? else {
            return Ok(false);
        };

        let Some(handler) = self.handlers.get(&row.task_name) else {
            tracing::error!(task_name = %row.task_name, "no handler registered, moving to dead letter");
            self.queue.mark_dead_letter(row.id).await?;
            return Ok(true);
        };

        let span = tracing::info_span!("task", task_id = %row.id, task_name = %row.task_name, attempt = row.attempts + 1);
        let _enter = span.enter();

        match handler.handle(row.arguments.clone()).await {
            Ok(()) => {
                self.queue.mark_done(row.id).await?;
            }
            Err(e) if e.is_retryable() && row.attempts + 1 < row.max_attempts => {
                let attempts = row.attempts + 1;
                let backoff = Duration::from_secs(handler.backoff_seconds(attempts as u32));
                tracing::warn!(error = %e, attempts, "task failed, rescheduling with backoff");
                self.queue.reschedule(row.id, attempts, backoff).await?;
            }
            Err(e) => {
                tracing::error!(error = %e, attempts = row.attempts + 1, "task failed, moving to dead letter");
                self.queue.mark_dead_letter(row.id).await?;
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let delays: Vec<u64> = (1..=4).map(|a| 2u64.saturating_pow(a)).collect();
        assert_eq!(delays, vec![2, 4, 8, 16]);
    }
}
