//! KN-006: Executor — orchestration loop for deploy.
//!
//! resolve → plan → for each descriptor: reuse | verify | pending → create → completed
//!
//! The plan is computed up front so drift between the module and the journal
//! aborts before any creator call. Execution within a module is sequential;
//! the first creation failure is journaled and halts the run.

use super::config::TargetEnvironment;
use super::error::{KilnError, ProvisioningError, Result};
use super::journal::Journal;
use super::planner;
use super::resolver;
use super::types::*;
use crate::creators::Creator;
use crate::tripwire::eventlog;
use indexmap::IndexMap;
use serde_json::Value;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, info_span, warn};

/// Configuration for a deploy run.
pub struct ExecuteConfig<'a> {
    pub module: &'a Module,
    pub journal: &'a Journal,
    pub creator: &'a mut dyn Creator,
    pub target: &'a TargetEnvironment,
    /// JSONL provenance log; `None` disables event logging
    pub event_log: Option<&'a Path>,
}

/// Execute a module until every descriptor is Completed or one fails.
pub fn execute(cfg: &mut ExecuteConfig) -> Result<ExecutionReport> {
    let start = Instant::now();
    let module = cfg.module;
    let span = info_span!("execute", module = %module.name, network = %cfg.target.network);
    let _guard = span.enter();

    let order = resolver::build_execution_order(module)?;
    let plan = planner::plan(module, &order, cfg.journal)?;
    debug!(
        create = plan.to_create,
        retry = plan.to_retry,
        recover = plan.to_recover,
        reuse = plan.reused,
        "plan ready"
    );

    let mut run = RunProgress {
        run_id: eventlog::generate_run_id(),
        start,
        completed: Vec::new(),
        reused: 0,
    };
    log_event(
        cfg.event_log,
        ProvenanceEvent::RunStarted {
            module: module.name.clone(),
            run_id: run.run_id.clone(),
            network: cfg.target.network.clone(),
            kiln_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    );

    let mut results: IndexMap<String, String> = IndexMap::new();

    for step in &plan.steps {
        let Some(descriptor) = module.descriptor(&step.descriptor) else {
            continue;
        };

        if let PlanAction::Reuse { result } = &step.action {
            debug!(descriptor = %descriptor.id, %result, "reusing journaled result");
            results.insert(descriptor.id.clone(), result.clone());
            run.reused += 1;
            log_event(
                cfg.event_log,
                ProvenanceEvent::DescriptorReused {
                    module: module.name.clone(),
                    descriptor: descriptor.id.clone(),
                    result: result.clone(),
                },
            );
            continue;
        }

        let args = evaluate_args(descriptor, &results)?;

        if step.action == PlanAction::Recover {
            if let Some(result) = recover(cfg, descriptor, &args, &run.completed)? {
                results.insert(descriptor.id.clone(), result);
                run.reused += 1;
                continue;
            }
        }

        let result = create(cfg, descriptor, &step.action, &args, &run)?;
        results.insert(descriptor.id.clone(), result);
        run.completed.push(descriptor.id.clone());
    }

    let outputs = project_outputs(module, &results)?;
    let created = run.created();
    let reused = run.reused;

    log_event(
        cfg.event_log,
        ProvenanceEvent::RunCompleted {
            module: module.name.clone(),
            run_id: run.run_id,
            created,
            reused,
            failed: 0,
            total_seconds: start.elapsed().as_secs_f64(),
        },
    );
    info!(created, reused, "module deployed");

    Ok(ExecutionReport {
        module: module.name.clone(),
        outputs,
        results,
        created,
        reused,
        total_duration: start.elapsed(),
    })
}

/// Counters for the run in progress.
struct RunProgress {
    run_id: String,
    start: Instant,
    /// Descriptors created by this run, in order
    completed: Vec<String>,
    reused: u32,
}

impl RunProgress {
    fn created(&self) -> u32 {
        self.completed.len() as u32
    }
}

/// Ask the creator whether an interrupted creation actually landed.
fn recover(
    cfg: &mut ExecuteConfig,
    descriptor: &Descriptor,
    args: &[Value],
    completed: &[String],
) -> Result<Option<String>> {
    let module = cfg.module;
    let found = cfg
        .creator
        .verify(cfg.target, &descriptor.kind, args)
        .map_err(|cause| ProvisioningError {
            module: module.name.clone(),
            descriptor: descriptor.id.clone(),
            kind: descriptor.kind.clone(),
            completed: completed.to_vec(),
            cause,
        })?;

    let Some(result) = found else {
        warn!(descriptor = %descriptor.id, "interrupted creation not found, re-creating");
        return Ok(None);
    };

    cfg.journal
        .mark_completed(&module.name, &descriptor.id, &result)?;
    info!(descriptor = %descriptor.id, %result, "recovered interrupted creation");
    log_event(
        cfg.event_log,
        ProvenanceEvent::DescriptorReused {
            module: module.name.clone(),
            descriptor: descriptor.id.clone(),
            result: result.clone(),
        },
    );
    Ok(Some(result))
}

/// Claim, create and record one descriptor.
fn create(
    cfg: &mut ExecuteConfig,
    descriptor: &Descriptor,
    action: &PlanAction,
    args: &[Value],
    run: &RunProgress,
) -> Result<String> {
    let module = cfg.module;
    cfg.journal.mark_pending(&module.name, descriptor)?;

    log_event(
        cfg.event_log,
        ProvenanceEvent::DescriptorStarted {
            module: module.name.clone(),
            descriptor: descriptor.id.clone(),
            kind: descriptor.kind.clone(),
            action: action.to_string(),
        },
    );

    let started = Instant::now();
    match cfg.creator.create(cfg.target, &descriptor.kind, args) {
        Ok(result) => {
            if let Err(e) = cfg.journal.mark_completed(&module.name, &descriptor.id, &result) {
                warn!(
                    descriptor = %descriptor.id,
                    kind = %descriptor.kind,
                    %result,
                    error = %e,
                    "created but not journaled"
                );
                return Err(KilnError::Unrecorded {
                    key: entry_key(&module.name, &descriptor.id),
                    result,
                    source: Box::new(e),
                });
            }
            let duration = started.elapsed().as_secs_f64();
            info!(descriptor = %descriptor.id, kind = %descriptor.kind, %result, duration, "created");
            log_event(
                cfg.event_log,
                ProvenanceEvent::DescriptorCompleted {
                    module: module.name.clone(),
                    descriptor: descriptor.id.clone(),
                    result: result.clone(),
                    duration_seconds: duration,
                },
            );
            Ok(result)
        }
        Err(cause) => {
            cfg.journal
                .mark_failed(&module.name, &descriptor.id, &cause.message)?;
            warn!(descriptor = %descriptor.id, error = %cause, "creation failed, halting");
            log_event(
                cfg.event_log,
                ProvenanceEvent::DescriptorFailed {
                    module: module.name.clone(),
                    descriptor: descriptor.id.clone(),
                    error: cause.message.clone(),
                },
            );
            log_event(
                cfg.event_log,
                ProvenanceEvent::RunCompleted {
                    module: module.name.clone(),
                    run_id: run.run_id.clone(),
                    created: run.created(),
                    reused: run.reused,
                    failed: 1,
                    total_seconds: run.start.elapsed().as_secs_f64(),
                },
            );
            Err(ProvisioningError {
                module: module.name.clone(),
                descriptor: descriptor.id.clone(),
                kind: descriptor.kind.clone(),
                completed: run.completed.clone(),
                cause,
            }
            .into())
        }
    }
}

/// Substitute future references with the results resolved so far.
fn evaluate_args(descriptor: &Descriptor, results: &IndexMap<String, String>) -> Result<Vec<Value>> {
    descriptor
        .args
        .iter()
        .map(|arg| match arg {
            ArgValue::Literal(v) => Ok(v.clone()),
            ArgValue::Future(r) => results
                .get(&r.future)
                .map(|res| Value::String(res.clone()))
                .ok_or_else(|| KilnError::UnknownReference {
                    from: descriptor.id.clone(),
                    to: r.future.clone(),
                }),
        })
        .collect()
}

/// Map exposed output names to materialized results.
fn project_outputs(
    module: &Module,
    results: &IndexMap<String, String>,
) -> Result<IndexMap<String, String>> {
    module
        .outputs
        .iter()
        .map(|(name, id)| {
            results
                .get(id)
                .map(|r| (name.clone(), r.clone()))
                .ok_or_else(|| KilnError::UnknownOutput {
                    name: name.clone(),
                    id: id.clone(),
                })
        })
        .collect()
}

/// Append a provenance event; a failed write never fails the run.
fn log_event(path: Option<&Path>, event: ProvenanceEvent) {
    if let Some(path) = path {
        if let Err(e) = eventlog::append_event(path, event) {
            warn!(path = %path.display(), error = %e, "event log write failed");
        }
    }
}
