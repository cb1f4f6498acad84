//! Transient actor dedicated to running exactly one standard job.
//!
//! The executor stages pre-copies, schedules the job's tasks over its
//! allocated resources as their intra-job predecessors complete, runs each
//! task in a work-unit child actor on the chosen host, then runs post-copies
//! and cleanups. It owns no cores itself: the service that spawned it does
//! the pool accounting when the executor reports back.

use std::collections::{HashMap, HashSet};

use crate::failure::FailureCause;
use crate::jobs::{FileLocation, StandardJobRef};
use crate::messages::{msg, Message};
use crate::services::{storage, CoreAllocationPolicy};
use crate::sim::{ActorId, SimHandle};
use crate::types::Duration;
use crate::utils::prelude::*;
use crate::workflow::{TaskRef, TaskState};

#[derive(Debug, Clone)]
pub(crate) struct ExecutorSpec {
    pub job: StandardJobRef,
    /// (host, cores, ram) the owning service allocated to this job
    pub allocation: Vec<(String, u64, f64)>,
    /// the owning service's mailbox
    pub callback_mailbox: String,
    pub core_allocation_policy: CoreAllocationPolicy,
    pub thread_startup_overhead: f64,
    pub task_startup_overhead: f64,
    pub simulate_computation_as_sleep: bool,
    pub default_location: Option<FileLocation>,
}

/// Spawn an executor; returns its actor id and command mailbox.
pub(crate) fn start(ctx: &SimHandle, name: &str, host: &str, spec: ExecutorSpec) -> (ActorId, String) {
    let mailbox = format!("{}_mailbox", name);
    let actor_name = name.to_owned();
    let mb = mailbox.clone();
    let id = ctx.spawn(name, host, false, Some(&mailbox), move |actor| {
        executor_main(actor, actor_name, mb, spec)
    });
    (id, mailbox)
}

struct RunningUnit {
    actor: ActorId,
    host: String,
    cores: u64,
    ram: f64,
    task: TaskRef,
}

async fn executor_main(
    ctx: SimHandle,
    name: String,
    mailbox: String,
    spec: ExecutorSpec,
) -> std::result::Result<(), FailureCause> {
    let job = spec.job.clone();
    debug!(executor = %name, job = %job.borrow().name, tasks = job.borrow().num_tasks(), "executor starting");

    let pre_copies = job.borrow().pre_copies.clone();
    for copy in &pre_copies {
        if let Err(cause) = storage::copy_file_between(&ctx, &copy.file, &copy.src, &copy.dst).await {
            warn!(executor = %name, file = %copy.file.id, %cause, "pre-copy failed");
            reset_tasks(&job);
            return report_failure(&ctx, &name, &spec, cause).await;
        }
    }

    if let Err(cause) = run_tasks(&ctx, &name, &mailbox, &spec).await {
        return report_failure(&ctx, &name, &spec, cause).await;
    }

    let post_copies = job.borrow().post_copies.clone();
    for copy in &post_copies {
        if let Err(cause) = storage::copy_file_between(&ctx, &copy.file, &copy.src, &copy.dst).await {
            warn!(executor = %name, file = %copy.file.id, %cause, "post-copy failed");
            return report_failure(&ctx, &name, &spec, cause).await;
        }
    }

    let cleanups = job.borrow().cleanup.clone();
    for (file, location) in &cleanups {
        if let Err(cause) = storage::delete_file_at(&ctx, location, file).await {
            warn!(executor = %name, file = %file.id, %cause, "cleanup delete failed");
        }
    }

    debug!(executor = %name, job = %job.borrow().name, "executor done");
    ctx.send(
        &spec.callback_mailbox,
        msg::ExecutorDone {
            executor: name,
            job: job.clone(),
        },
    )
    .await
}

async fn run_tasks(
    ctx: &SimHandle,
    name: &str,
    mailbox: &str,
    spec: &ExecutorSpec,
) -> std::result::Result<(), FailureCause> {
    let job = spec.job.clone();
    let tasks: Vec<TaskRef> = job.borrow().tasks.clone();
    let in_job: HashSet<String> = tasks.iter().map(|t| t.borrow().id.clone()).collect();

    // (host, free cores, free ram) within this job's allocation
    let mut free: Vec<(String, u64, f64)> = spec.allocation.clone();
    let mut completed: HashSet<String> = HashSet::new();
    let mut started: HashSet<String> = HashSet::new();
    let mut running: HashMap<String, RunningUnit> = HashMap::new();

    loop {
        // dispatch every task whose intra-job predecessors are done and that fits
        loop {
            let candidate = tasks.iter().find(|t| {
                let t = t.borrow();
                !started.contains(&t.id)
                    && t.parents
                        .iter()
                        .filter(|p| in_job.contains(*p))
                        .all(|p| completed.contains(p))
                    && free
                        .iter()
                        .any(|(_, c, r)| *c >= t.min_cores && *r >= t.ram)
            });
            let task = match candidate {
                Some(t) => t.clone(),
                None => break,
            };
            dispatch_task(ctx, name, mailbox, spec, &task, &mut free, &mut running)?;
            started.insert(task.borrow().id.clone());
        }

        if running.is_empty() {
            if completed.len() == tasks.len() {
                return Ok(());
            }
            // nothing running and nothing placeable: the allocation can never fit
            let stuck: Vec<String> = tasks
                .iter()
                .filter(|t| !started.contains(&t.borrow().id))
                .map(|t| t.borrow().id.clone())
                .collect();
            return Err(FailureCause::not_enough_resources(
                name,
                format!("allocation cannot fit tasks {:?}", stuck),
            ));
        }

        let message = ctx.recv(mailbox).await?;
        match message {
            Message::WorkUnitDone(m) => {
                if let Some(unit) = running.remove(&m.task_id) {
                    {
                        let mut t = unit.task.borrow_mut();
                        t.state = TaskState::Completed;
                        t.end_date = Some(ctx.now());
                    }
                    release(&mut free, &unit);
                    completed.insert(m.task_id);
                }
            }
            Message::WorkUnitFailed(m) => {
                warn!(executor = %name, task = %m.task_id, cause = %m.cause, "task failed, aborting job");
                if let Some(unit) = running.remove(&m.task_id) {
                    unit.task.borrow_mut().state = TaskState::Failed;
                    release(&mut free, &unit);
                }
                abort_running(ctx, &mut free, &mut running);
                return Err(m.cause);
            }
            Message::TerminateExecutor(m) => {
                debug!(executor = %name, cause = %m.cause, "executor terminating on request");
                abort_running(ctx, &mut free, &mut running);
                return Err(m.cause);
            }
            other => {
                warn!(executor = %name, kind = other.kind(), "executor ignoring message");
            }
        }
    }
}

fn dispatch_task(
    ctx: &SimHandle,
    name: &str,
    mailbox: &str,
    spec: &ExecutorSpec,
    task: &TaskRef,
    free: &mut Vec<(String, u64, f64)>,
    running: &mut HashMap<String, RunningUnit>,
) -> std::result::Result<(), FailureCause> {
    let (task_id, min_cores, max_cores, ram) = {
        let t = task.borrow();
        (t.id.clone(), t.min_cores, t.max_cores, t.ram)
    };
    let slot = free
        .iter_mut()
        .find(|(_, c, r)| *c >= min_cores && *r >= ram)
        .expect("dispatch_task called without a fitting host");
    let cores = match spec.core_allocation_policy {
        CoreAllocationPolicy::Aggressive => max_cores.min(slot.1),
        CoreAllocationPolicy::Minimum => min_cores,
    };
    let host = slot.0.clone();
    slot.1 -= cores;
    slot.2 -= ram;

    {
        let mut t = task.borrow_mut();
        t.state = TaskState::Running;
        t.start_date = Some(ctx.now());
    }

    let unit_spec = WorkUnitSpec {
        task: task.clone(),
        cores,
        inputs: resolve_locations(spec, &task.borrow().inputs)?,
        outputs: resolve_locations(spec, &task.borrow().outputs)?,
        thread_startup_overhead: spec.thread_startup_overhead,
        task_startup_overhead: spec.task_startup_overhead,
        simulate_computation_as_sleep: spec.simulate_computation_as_sleep,
        reply_mailbox: mailbox.to_owned(),
    };
    let unit_name = format!("{}_wu_{}", name, task_id);
    let actor = ctx.spawn(&unit_name, &host, false, None, move |actor| {
        work_unit_main(actor, unit_spec)
    });
    running.insert(
        task_id,
        RunningUnit {
            actor,
            host,
            cores,
            ram,
            task: task.clone(),
        },
    );
    Ok(())
}

fn resolve_locations(
    spec: &ExecutorSpec,
    files: &[crate::workflow::FileRef],
) -> std::result::Result<Vec<(crate::workflow::FileRef, FileLocation)>, FailureCause> {
    files
        .iter()
        .map(|f| {
            let loc = spec
                .job
                .borrow()
                .location_of(&f.id)
                .cloned()
                .or_else(|| spec.default_location.clone())
                .ok_or_else(|| FailureCause::FileNotFound {
                    file: f.id.clone(),
                    service: "no storage location".to_owned(),
                })?;
            Ok((f.clone(), loc))
        })
        .collect()
}

fn release(free: &mut [(String, u64, f64)], unit: &RunningUnit) {
    let slot = free
        .iter_mut()
        .find(|(h, _, _)| *h == unit.host)
        .expect("released host not in allocation");
    slot.1 += unit.cores;
    slot.2 += unit.ram;
}

fn abort_running(ctx: &SimHandle, free: &mut Vec<(String, u64, f64)>, running: &mut HashMap<String, RunningUnit>) {
    for (_, unit) in running.drain() {
        ctx.kill(unit.actor);
        unit.task.borrow_mut().state = TaskState::Ready;
        release(free, &unit);
    }
}

fn reset_tasks(job: &StandardJobRef) {
    for task in &job.borrow().tasks {
        let mut t = task.borrow_mut();
        if t.state != TaskState::Completed {
            t.state = TaskState::Ready;
        }
    }
}

async fn report_failure(
    ctx: &SimHandle,
    name: &str,
    spec: &ExecutorSpec,
    cause: FailureCause,
) -> std::result::Result<(), FailureCause> {
    ctx.send(
        &spec.callback_mailbox,
        msg::ExecutorFailed {
            executor: name.to_owned(),
            job: spec.job.clone(),
            cause,
        },
    )
    .await
}

#[derive(Debug, Clone)]
struct WorkUnitSpec {
    task: TaskRef,
    cores: u64,
    inputs: Vec<(crate::workflow::FileRef, FileLocation)>,
    outputs: Vec<(crate::workflow::FileRef, FileLocation)>,
    thread_startup_overhead: f64,
    task_startup_overhead: f64,
    simulate_computation_as_sleep: bool,
    reply_mailbox: String,
}

async fn work_unit_main(ctx: SimHandle, spec: WorkUnitSpec) -> std::result::Result<(), FailureCause> {
    let task_id = spec.task.borrow().id.clone();
    let outcome = run_work_unit(&ctx, &spec).await;
    let message: Message = match outcome {
        Ok(()) => msg::WorkUnitDone { task_id }.into(),
        Err(cause) => msg::WorkUnitFailed { task_id, cause }.into(),
    };
    ctx.send(&spec.reply_mailbox, message).await
}

async fn run_work_unit(ctx: &SimHandle, spec: &WorkUnitSpec) -> std::result::Result<(), FailureCause> {
    for (file, location) in &spec.inputs {
        storage::read_file_at(ctx, location, file).await?;
    }

    let (flops, efficiency) = {
        let t = spec.task.borrow();
        (t.flops, t.efficiency(spec.cores))
    };
    let overhead = spec.task_startup_overhead + spec.thread_startup_overhead * spec.cores as f64;
    if overhead > 0.0 {
        ctx.sleep(Duration(overhead)).await;
    }
    if spec.simulate_computation_as_sleep {
        let rate = ctx.flop_rate()?;
        ctx.sleep(Duration(flops / (rate * spec.cores as f64 * efficiency))).await;
    } else {
        ctx.compute(flops, spec.cores, efficiency).await?;
    }

    for (file, location) in &spec.outputs {
        storage::write_file_at(ctx, location, file).await?;
    }
    Ok(())
}
