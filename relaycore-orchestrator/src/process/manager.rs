//! Process manager (§4.L): the saga state machine.
//!
//! §5 ordering guarantee: "reply handling and step execution both begin
//! with `SELECT … FOR UPDATE` on `process_instance`" — every public entry
//! point here opens exactly one transaction, takes the row lock via
//! [`ProcessStore::lock_for_update`] (or inserts the not-yet-visible row,
//! for `start_process`), and holds it for every `process_instance` /
//! `process_log` write that follows, so two replies for the same process
//! id can never interleave.

use std::sync::Arc;

use relaycore_shared::config::ProcessManagerConfig;
use relaycore_shared::db::{ProcessInstanceRow, ProcessLogEvent, ProcessStatus, ProcessStore};
use relaycore_shared::envelope::{header_keys, Headers, ReplyEnvelope, ReplyStatus};
use relaycore_shared::errors::{PlatformError, PlatformResult};
use serde_json::{json, Value};
use sqlx::PgConnection;
use sqlx::{Connection, PgPool};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::bus::CommandBus;
use crate::process::config::ProcessConfiguration;
use crate::process::graph::Transition;
use crate::process::ProcessRegistry;

fn parallel_data_key(step: &str) -> String {
    format!("_parallel_{step}")
}

/// Find the in-flight parallel fan-out, if any: at most one can be
/// outstanding per process at a time (§4.L fail-fast protocol assumes a
/// single active fan-out).
fn find_parallel_fanout(data: &Value) -> Option<(String, serde_json::Map<String, Value>)> {
    let object = data.as_object()?;
    for (key, value) in object {
        if let Some(step) = key.strip_prefix("_parallel_") {
            if let Some(branches) = value.as_object() {
                return Some((step.to_string(), branches.clone()));
            }
        }
    }
    None
}

fn merge_reply_data(data: &mut Value, reply_data: &std::collections::HashMap<String, Value>) {
    let object = data.as_object_mut().expect("process data is always a JSON object");
    for (key, value) in reply_data {
        if key == header_keys::PARALLEL_BRANCH {
            continue;
        }
        object.insert(key.clone(), value.clone());
    }
}

#[derive(Debug, Clone)]
pub struct ProcessManager {
    pool: PgPool,
    bus: CommandBus,
    registry: Arc<ProcessRegistry>,
    defaults: ProcessManagerConfig,
}

impl ProcessManager {
    pub fn new(pool: PgPool, bus: CommandBus, registry: Arc<ProcessRegistry>, defaults: ProcessManagerConfig) -> Self {
        Self {
            pool,
            bus,
            registry,
            defaults,
        }
    }

    #[instrument(skip(self, initial_data))]
    pub async fn start_process(&self, process_type: &str, business_key: &str, initial_data: Value) -> PlatformResult<Uuid> {
        let configuration = self.registry.get(process_type)?.clone();
        let process_id = Uuid::now_v7();
        let initial_step = configuration.graph.initial_step().to_string();

        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;
        ProcessStore::insert(&mut tx, process_id, process_type, business_key, &initial_step, &initial_data).await?;
        ProcessStore::append_log(&mut tx, process_id, 1, ProcessLogEvent::ProcessStarted, &json!({})).await?;
        let result = self.execute_step(&mut tx, process_id, &configuration, &initial_step, initial_data, 0).await;

        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(process_id)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    /// Issue the command(s) for `step` and write the resulting
    /// `process_instance` / `process_log` state into the caller's
    /// transaction (§4.L "Sequential step" / "Parallel step"). The caller
    /// is responsible for holding the process's row lock for the duration.
    #[instrument(skip(self, conn, data))]
    async fn execute_step(
        &self,
        conn: &mut PgConnection,
        process_id: Uuid,
        configuration: &ProcessConfiguration,
        step: &str,
        mut data: Value,
        retries: i32,
    ) -> PlatformResult<()> {
        let process_step = configuration
            .graph
            .step(step)
            .ok_or_else(|| PlatformError::UnknownProcessType(step.to_string()))?
            .clone();

        match &process_step.transition {
            Transition::Parallel { branches, join_step } => {
                if branches.is_empty() {
                    return Err(PlatformError::InvalidParallelStep {
                        step: step.to_string(),
                        reason: "no branches declared".to_string(),
                    });
                }

                // Branch commands get the step's input data, same as a
                // sequential step would; the reserved fan-out bookkeeping
                // key below is internal to this process instance and must
                // not leak into what a branch handler sees.
                let branch_payload = data.clone();

                let mut branch_state = serde_json::Map::new();
                for branch in branches {
                    branch_state.insert(branch.clone(), json!("PENDING"));
                }
                data.as_object_mut()
                    .expect("process data is always a JSON object")
                    .insert(parallel_data_key(step), Value::Object(branch_state));

                for branch in branches {
                    let idempotency_key = format!("{process_id}:{step}:{branch}");
                    let mut extra_headers = Headers::new();
                    extra_headers.insert(header_keys::PARALLEL_BRANCH.to_string(), branch.clone());
                    self.bus
                        .submit_correlated(branch, &idempotency_key, None, branch_payload.clone(), Some(process_id), extra_headers)
                        .await?;
                }

                let sequence = ProcessStore::next_sequence(conn, process_id).await?;
                ProcessStore::save(conn, process_id, ProcessStatus::Running, join_step, &data, retries).await?;
                for (offset, branch) in branches.iter().enumerate() {
                    ProcessStore::append_log(
                        conn,
                        process_id,
                        sequence + offset as i64,
                        ProcessLogEvent::StepStarted,
                        &json!({ "step": step, "branch": branch }),
                    )
                    .await?;
                }
                Ok(())
            }
            Transition::Terminal | Transition::Linear { .. } | Transition::Conditional { .. } => {
                let idempotency_key = if retries == 0 {
                    format!("{process_id}:{step}")
                } else {
                    format!("{process_id}:{step}:retry{retries}")
                };
                let command_id = self
                    .bus
                    .submit_correlated(step, &idempotency_key, None, data.clone(), Some(process_id), Headers::new())
                    .await?;

                let sequence = ProcessStore::next_sequence(conn, process_id).await?;
                ProcessStore::save(conn, process_id, ProcessStatus::Running, step, &data, retries).await?;
                ProcessStore::append_log(
                    conn,
                    process_id,
                    sequence,
                    ProcessLogEvent::StepStarted,
                    &json!({ "step": step, "commandId": command_id }),
                )
                .await?;
                Ok(())
            }
        }
    }

    /// Route a reply to sequential or parallel-branch handling (§4.L
    /// `handleReply`), under the process's row lock for the whole
    /// operation.
    #[instrument(skip(self, reply))]
    pub async fn handle_reply(&self, process_id: Uuid, reply: ReplyEnvelope) -> PlatformResult<()> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;

        let instance = match ProcessStore::lock_for_update(&mut tx, process_id).await? {
            Some(instance) => instance,
            None => {
                tx.rollback().await?;
                warn!(%process_id, "reply arrived for unknown process, dropping");
                return Ok(());
            }
        };

        if instance.status.is_terminal() {
            tx.rollback().await?;
            info!(%process_id, status = ?instance.status, "dropping reply, process already terminal");
            return Ok(());
        }

        let configuration = match self.registry.get(&instance.process_type) {
            Ok(c) => c.clone(),
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };

        let result = if reply.parallel_branch().is_some() && find_parallel_fanout(&instance.data).is_some() {
            self.handle_parallel_reply(&mut tx, instance, &configuration, reply).await
        } else {
            self.handle_sequential_reply(&mut tx, instance, &configuration, reply).await
        };

        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    async fn handle_sequential_reply(
        &self,
        conn: &mut PgConnection,
        instance: ProcessInstanceRow,
        configuration: &ProcessConfiguration,
        reply: ReplyEnvelope,
    ) -> PlatformResult<()> {
        let process_id = instance.process_id;
        let step = instance.current_step.clone();

        match reply.status {
            ReplyStatus::Completed => {
                let mut data = instance.data.clone();
                merge_reply_data(&mut data, &reply.data);
                self.log_transition(conn, process_id, ProcessLogEvent::StepCompleted, &json!({ "step": step })).await?;

                match configuration.graph.next_step(&step, &data)? {
                    Some(next) => self.execute_step(conn, process_id, configuration, &next, data, 0).await,
                    None => self.finish(conn, process_id, ProcessStatus::Succeeded, &step, &data, instance.retries, true).await,
                }
            }
            ReplyStatus::Failed | ReplyStatus::TimedOut => {
                let event = if reply.status == ReplyStatus::TimedOut {
                    ProcessLogEvent::StepTimedOut
                } else {
                    ProcessLogEvent::StepFailed
                };
                self.log_transition(conn, process_id, event, &json!({ "step": step, "error": reply.error })).await?;

                let max_retries = configuration.max_retries(self.defaults.max_retries_per_step) as i32;
                let retryable = reply.status == ReplyStatus::Failed
                    && configuration.is_retryable.as_ref()(&step, reply.error.as_deref().unwrap_or(""))
                    && instance.retries < max_retries;

                if retryable {
                    self.execute_step(conn, process_id, configuration, &step, instance.data.clone(), instance.retries + 1)
                        .await
                } else if configuration.graph.step(&step).map(|s| s.requires_compensation()).unwrap_or(false) {
                    self.start_compensation(conn, process_id, configuration, &instance.data, instance.retries).await
                } else {
                    self.finish(conn, process_id, ProcessStatus::Failed, &step, &instance.data, instance.retries, false)
                        .await
                }
            }
        }
    }

    /// Fail-fast completion protocol (§4.L): a single FAILED/TIMED_OUT
    /// branch reply fails the whole fan-out; late COMPLETED replies for
    /// other branches are absorbed silently once the process has moved on.
    async fn handle_parallel_reply(
        &self,
        conn: &mut PgConnection,
        instance: ProcessInstanceRow,
        configuration: &ProcessConfiguration,
        reply: ReplyEnvelope,
    ) -> PlatformResult<()> {
        let process_id = instance.process_id;
        let branch = reply.parallel_branch().unwrap_or_default().to_string();
        let (fanout_step, mut branches) = match find_parallel_fanout(&instance.data) {
            Some(found) => found,
            None => {
                info!(%process_id, branch, "late parallel-branch reply, fan-out already resolved");
                return Ok(());
            }
        };

        if branches.get(&branch).and_then(Value::as_str) != Some("PENDING") {
            info!(%process_id, branch, "late or duplicate parallel-branch reply, ignoring");
            return Ok(());
        }

        match reply.status {
            ReplyStatus::Failed | ReplyStatus::TimedOut => {
                self.log_transition(
                    conn,
                    process_id,
                    ProcessLogEvent::StepFailed,
                    &json!({ "step": fanout_step, "branch": branch, "error": reply.error }),
                )
                .await?;

                if configuration.graph.step(&fanout_step).map(|s| s.requires_compensation()).unwrap_or(false) {
                    self.start_compensation(conn, process_id, configuration, &instance.data, instance.retries).await
                } else {
                    self.finish(
                        conn,
                        process_id,
                        ProcessStatus::Failed,
                        &instance.current_step,
                        &instance.data,
                        instance.retries,
                        false,
                    )
                    .await
                }
            }
            ReplyStatus::Completed => {
                let mut data = instance.data.clone();
                merge_reply_data(&mut data, &reply.data);
                branches.insert(branch.clone(), json!("COMPLETED"));

                let all_completed = branches.values().all(|status| status == "COMPLETED");
                self.log_transition(
                    conn,
                    process_id,
                    ProcessLogEvent::StepCompleted,
                    &json!({ "step": fanout_step, "branch": branch }),
                )
                .await?;

                if all_completed {
                    data.as_object_mut().unwrap().remove(&parallel_data_key(&fanout_step));
                    let join_step = instance.current_step.clone();
                    match configuration.graph.next_step(&join_step, &data)? {
                        Some(next) => self.execute_step(conn, process_id, configuration, &next, data, 0).await,
                        None => {
                            self.finish(conn, process_id, ProcessStatus::Succeeded, &join_step, &data, instance.retries, true)
                                .await
                        }
                    }
                } else {
                    data.as_object_mut()
                        .unwrap()
                        .insert(parallel_data_key(&fanout_step), Value::Object(branches));
                    ProcessStore::save(conn, process_id, ProcessStatus::Running, &instance.current_step, &data, instance.retries).await
                }
            }
        }
    }

    /// Walk completed steps backwards issuing compensation commands
    /// (§4.L). Simplified to one compensation step per call — a full
    /// multi-step chain is driven by repeated `handleReply` calls against
    /// `COMPENSATING` status as each compensation reply arrives.
    async fn start_compensation(
        &self,
        conn: &mut PgConnection,
        process_id: Uuid,
        configuration: &ProcessConfiguration,
        data: &Value,
        retries: i32,
    ) -> PlatformResult<()> {
        let log = ProcessStore::log_for(conn, process_id).await?;

        let completed_steps: Vec<String> = log
            .iter()
            .filter(|row| row.event == ProcessLogEvent::StepCompleted)
            .filter_map(|row| row.payload.get("step").and_then(Value::as_str).map(str::to_string))
            .collect();

        let next_to_compensate = completed_steps
            .iter()
            .rev()
            .find(|step| configuration.graph.step(step).map(|s| s.requires_compensation()).unwrap_or(false));

        match next_to_compensate {
            Some(step) => {
                let compensation_step = configuration
                    .graph
                    .step(step)
                    .and_then(|s| s.compensation.clone())
                    .expect("requires_compensation implies compensation is Some");

                let idempotency_key = format!("{process_id}:COMPENSATE:{step}");
                let result = self
                    .bus
                    .submit_correlated(&compensation_step, &idempotency_key, None, data.clone(), Some(process_id), Headers::new())
                    .await;

                match result {
                    Ok(command_id) => {
                        let sequence = ProcessStore::next_sequence(conn, process_id).await?;
                        ProcessStore::save(conn, process_id, ProcessStatus::Compensating, step, data, retries).await?;
                        ProcessStore::append_log(
                            conn,
                            process_id,
                            sequence,
                            ProcessLogEvent::CompensationStarted,
                            &json!({ "step": step, "commandId": command_id }),
                        )
                        .await?;
                        Ok(())
                    }
                    Err(e) => {
                        let sequence = ProcessStore::next_sequence(conn, process_id).await?;
                        ProcessStore::save(conn, process_id, ProcessStatus::Failed, step, data, retries).await?;
                        ProcessStore::append_log(
                            conn,
                            process_id,
                            sequence,
                            ProcessLogEvent::ProcessFailed,
                            &json!({ "reason": format!("compensation failed: {e}") }),
                        )
                        .await?;
                        Err(PlatformError::CompensationFailure {
                            process_id,
                            step: step.clone(),
                            reason: e.to_string(),
                        })
                    }
                }
            }
            None => self.finish(conn, process_id, ProcessStatus::Compensated, "", data, retries, true).await,
        }
    }

    async fn log_transition(&self, conn: &mut PgConnection, process_id: Uuid, event: ProcessLogEvent, payload: &Value) -> PlatformResult<()> {
        let sequence = ProcessStore::next_sequence(conn, process_id).await?;
        ProcessStore::append_log(conn, process_id, sequence, event, payload).await
    }

    async fn finish(
        &self,
        conn: &mut PgConnection,
        process_id: Uuid,
        status: ProcessStatus,
        current_step: &str,
        data: &Value,
        retries: i32,
        succeeded: bool,
    ) -> PlatformResult<()> {
        let event = if succeeded {
            ProcessLogEvent::ProcessCompleted
        } else {
            ProcessLogEvent::ProcessFailed
        };
        let sequence = ProcessStore::next_sequence(conn, process_id).await?;
        ProcessStore::save(conn, process_id, status, current_step, data, retries).await?;
        ProcessStore::append_log(conn, process_id, sequence, event, &json!({})).await?;
        info!(%process_id, ?status, "process reached terminal state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_data_key_matches_naming_convention() {
        assert_eq!(parallel_data_key("Start"), "_parallel_Start");
    }

    #[test]
    fn find_parallel_fanout_reads_the_reserved_key() {
        let data = json!({ "_parallel_Start": { "A": "PENDING", "B": "COMPLETED" } });
        let (step, branches) = find_parallel_fanout(&data).unwrap();
        assert_eq!(step, "Start");
        assert_eq!(branches.get("B").unwrap(), "COMPLETED");
    }

    #[test]
    fn merge_reply_data_skips_the_parallel_branch_marker() {
        let mut data = json!({});
        let mut reply_data = std::collections::HashMap::new();
        reply_data.insert(header_keys::PARALLEL_BRANCH.to_string(), json!("A"));
        reply_data.insert("amount".to_string(), json!(42));
        merge_reply_data(&mut data, &reply_data);
        assert_eq!(data.get("amount").unwrap(), 42);
        assert!(data.get(header_keys::PARALLEL_BRANCH).is_none());
    }
}
