//! Scheduler bridge.
//!
//! Turns cron firings into emitted events. `schedule_task` persists the
//! task and registers a pg_cron job whose SQL body sends the stored
//! envelope to the namespace ingress queue; the envelope's `emitted_at` is
//! stamped by the database at fire time. From the ingress queue onward a
//! scheduled emission is indistinguishable from a normal `emit`.

use serde_json::Value;

use crate::db::Db;
use crate::envelope::EventEnvelope;
use crate::error::{BrokerError, BrokerResult};
use crate::queue::ingress_queue;
use crate::repos::schedule_repo;

/// Producer recorded on scheduled emissions when the caller names none.
pub const SCHEDULER_NODE_ID: &str = "scheduler";

/// A scheduled emission, unique per (namespace, name).
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub name: String,
    /// Standard 5-field cron expression. Extension-specific forms are
    /// passed through; only the field count is checked here.
    pub cron_expression: String,
    pub event_type: String,
    pub payload: Value,
    /// Defaults to the scheduling node, or [`SCHEDULER_NODE_ID`].
    pub producer_node_id: Option<String>,
}

impl ScheduledTask {
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            name: name.into(),
            cron_expression: cron_expression.into(),
            event_type: event_type.into(),
            payload,
            producer_node_id: None,
        }
    }

    pub fn with_producer(mut self, producer_node_id: impl Into<String>) -> Self {
        self.producer_node_id = Some(producer_node_id.into());
        self
    }
}

#[derive(Clone, Debug)]
pub(crate) struct SchedulerBridge {
    db: Db,
    namespace: String,
}

impl SchedulerBridge {
    pub fn new(db: Db, namespace: impl Into<String>) -> Self {
        Self {
            db,
            namespace: namespace.into(),
        }
    }

    /// Persist a task and register its cron job. Upserting an existing
    /// name replaces both the row and the job body.
    pub async fn schedule(&self, task: &ScheduledTask) -> BrokerResult<()> {
        validate_cron_expression(&task.cron_expression)?;
        if task.name.is_empty() {
            return Err(BrokerError::Configuration(
                "schedule name cannot be empty".to_string(),
            ));
        }
        if task.event_type.is_empty() {
            return Err(BrokerError::Configuration(
                "schedule event_type cannot be empty".to_string(),
            ));
        }

        let producer = task
            .producer_node_id
            .clone()
            .unwrap_or_else(|| SCHEDULER_NODE_ID.to_string());

        schedule_repo::upsert(
            self.db.pool(),
            &self.namespace,
            &task.name,
            &task.cron_expression,
            &task.event_type,
            &task.payload,
            Some(producer.as_str()),
        )
        .await?;

        let command = build_send_command(
            &self.namespace,
            &EventEnvelope::new(
                &self.namespace,
                producer,
                &task.event_type,
                task.payload.clone(),
            ),
        )?;

        sqlx::query_scalar::<_, i64>("SELECT cron.schedule($1, $2, $3)")
            .bind(job_name(&self.namespace, &task.name))
            .bind(&task.cron_expression)
            .bind(command)
            .fetch_one(self.db.pool())
            .await
            .map_err(|e| BrokerError::Schedule(format!("cron registration failed: {e}")))?;

        tracing::info!(
            namespace = %self.namespace,
            name = %task.name,
            cron = %task.cron_expression,
            event_type = %task.event_type,
            "Scheduled task registered"
        );
        Ok(())
    }

    /// Remove a task's row and cron job. Idempotent; returns whether
    /// anything existed to remove.
    pub async fn unschedule(&self, name: &str) -> BrokerResult<bool> {
        let jobs_removed = sqlx::query_scalar::<_, bool>(
            "SELECT cron.unschedule(jobid) FROM cron.job WHERE jobname = $1",
        )
        .bind(job_name(&self.namespace, name))
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| BrokerError::Schedule(format!("cron removal failed: {e}")))?;

        let row_removed = schedule_repo::delete(self.db.pool(), &self.namespace, name).await?;

        if row_removed || !jobs_removed.is_empty() {
            tracing::info!(
                namespace = %self.namespace,
                name = %name,
                "Scheduled task removed"
            );
        }
        Ok(row_removed || !jobs_removed.is_empty())
    }
}

/// Name of the pg_cron job backing a task.
fn job_name(namespace: &str, task_name: &str) -> String {
    format!("event_broker_{namespace}_{task_name}")
}

/// SQL executed by the cron job: send the stored envelope to ingress with
/// `emitted_at` replaced by the database clock at fire time.
fn build_send_command(namespace: &str, envelope: &EventEnvelope) -> BrokerResult<String> {
    let body = serde_json::to_string(envelope)?;
    Ok(format!(
        "SELECT pgmq.send('{queue}', jsonb_set('{body}'::jsonb, '{{emitted_at}}', to_jsonb(now())))",
        queue = ingress_queue(namespace),
        body = quote_literal(&body),
    ))
}

/// Escape a string for inclusion in a single-quoted SQL literal.
fn quote_literal(s: &str) -> String {
    s.replace('\'', "''")
}

/// Check the standard 5-field cron form. Anything deeper (ranges, steps,
/// names) is delegated to the cron extension.
pub fn validate_cron_expression(expression: &str) -> BrokerResult<()> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(BrokerError::Configuration(format!(
            "cron expression must have 5 fields, got {}: {:?}",
            fields.len(),
            expression
        )));
    }
    Ok(())
}
