//! A simple workflow-manager engine: picks compute services for ready tasks
//! and drives a workflow to completion through a job manager.

use std::collections::HashMap;

use rand::Rng;
use rand_seeder::{Seeder, SipRng};

use crate::failure::FailureCause;
use crate::jobs::WorkflowJob;
use crate::managers::JobManager;
use crate::messages::Message;
use crate::services::storage::StorageServiceHandle;
use crate::services::{ComputeServiceHandle, JobKind};
use crate::sim::SimHandle;
use crate::utils::prelude::*;
use crate::workflow::{TaskRef, Workflow};

/// Decides which compute service runs which ready tasks.
/// Entries are (tasks bundled into one standard job, service index).
pub trait TaskScheduler {
    fn schedule_tasks(&mut self, ready: &[TaskRef], services: &[ComputeServiceHandle]) -> Vec<(Vec<TaskRef>, usize)>;
}

/// Sends every ready task to a uniformly random service, one job per task.
pub struct RandomScheduler {
    rng: SipRng,
}

impl RandomScheduler {
    pub fn new(seed: &str) -> Self {
        RandomScheduler {
            rng: Seeder::from(seed).make_rng(),
        }
    }
}

impl TaskScheduler for RandomScheduler {
    fn schedule_tasks(&mut self, ready: &[TaskRef], services: &[ComputeServiceHandle]) -> Vec<(Vec<TaskRef>, usize)> {
        if services.is_empty() {
            return vec![];
        }
        ready
            .iter()
            .map(|t| (vec![t.clone()], self.rng.gen_range(0..services.len())))
            .collect()
    }
}

/// Rotates over the services in order, one job per task.
#[derive(Default)]
pub struct RoundRobinScheduler {
    cursor: usize,
}

impl TaskScheduler for RoundRobinScheduler {
    fn schedule_tasks(&mut self, ready: &[TaskRef], services: &[ComputeServiceHandle]) -> Vec<(Vec<TaskRef>, usize)> {
        if services.is_empty() {
            return vec![];
        }
        ready
            .iter()
            .map(|t| {
                let idx = self.cursor % services.len();
                self.cursor += 1;
                (vec![t.clone()], idx)
            })
            .collect()
    }
}

/// Give up on a task after this many failed attempts.
const MAX_TASK_FAILURES: u64 = 3;

/// Walltime padding for batch submissions: twice the predicted runtime plus
/// a minute of slack.
fn requested_walltime(flops: f64, flop_rate: f64) -> f64 {
    2.0 * flops / flop_rate + 60.0
}

/// Drive `workflow` to completion: submit ready tasks as single-task (or
/// scheduler-grouped) standard jobs, wait on the unified event stream, stop
/// every compute service when done. Returns the number of completed jobs.
pub async fn run_workflow(
    ctx: &SimHandle,
    my_mailbox: &str,
    workflow: &Workflow,
    scheduler: &mut dyn TaskScheduler,
    services: &[ComputeServiceHandle],
    default_storage: Option<StorageServiceHandle>,
) -> std::result::Result<usize, FailureCause> {
    let job_manager = JobManager::new(ctx, my_mailbox);
    let services: Vec<ComputeServiceHandle> = services
        .iter()
        .filter(|s| s.supports(JobKind::Standard))
        .cloned()
        .collect();
    if services.is_empty() {
        warn!("aborting: no compute services accept standard jobs");
        return Ok(0);
    }

    // flop rates are needed to size batch walltime requests
    let mut flop_rates = Vec::with_capacity(services.len());
    for service in &services {
        flop_rates.push(service.core_flop_rate(ctx).await?);
    }

    // stage source files (inputs produced by no task) onto the default storage
    if let Some(storage) = &default_storage {
        for file in workflow.input_files() {
            storage.write_file(ctx, &file).await?;
        }
    }

    info!(tasks = workflow.num_tasks(), "workflow execution starting");
    let mut outstanding = 0usize;
    let mut completions = 0usize;

    loop {
        let ready: Vec<TaskRef> = workflow
            .ready_tasks()
            .into_iter()
            .filter(|t| t.borrow().failure_count < MAX_TASK_FAILURES)
            .collect();
        for (tasks, idx) in scheduler.schedule_tasks(&ready, &services) {
            let service = &services[idx];
            let flops: f64 = tasks.iter().map(|t| t.borrow().flops).sum();
            let min_cores = tasks.iter().map(|t| t.borrow().min_cores).max().unwrap_or(1);
            let job = job_manager.create_standard_job(tasks, HashMap::new(), vec![], vec![]);
            let mut args = HashMap::new();
            if service.kind == crate::services::ComputeServiceKind::Batch {
                args.insert("-N".to_owned(), "1".to_owned());
                args.insert("-c".to_owned(), min_cores.to_string());
                args.insert("-t".to_owned(), requested_walltime(flops, flop_rates[idx]).to_string());
            }
            match job_manager
                .submit_job(ctx, &WorkflowJob::Standard(job.clone()), service, args)
                .await
            {
                Ok(()) => outstanding += 1,
                Err(cause) => {
                    warn!(job = %job.borrow().name, service = %service.name, %cause, "submission rejected");
                }
            }
        }

        if outstanding == 0 {
            break;
        }

        match ctx.recv(my_mailbox).await {
            Ok(Message::WorkflowEvent(m)) => {
                info!(event = %m.event, "workflow execution event");
                match m.event {
                    crate::events::ExecutionEvent::StandardJobCompleted { .. } => {
                        outstanding -= 1;
                        completions += 1;
                    }
                    crate::events::ExecutionEvent::StandardJobFailed { .. } => {
                        outstanding -= 1;
                    }
                    _ => {}
                }
            }
            Ok(other) => {
                warn!(kind = other.kind(), "workflow manager ignoring message");
            }
            Err(e) => return Err(e.into()),
        }
    }

    if workflow.is_done() {
        info!(completions, "workflow execution complete");
    } else {
        warn!(completions, "workflow execution incomplete, no more schedulable tasks");
    }

    for service in &services {
        if let Err(cause) = service
            .stop(ctx, FailureCause::service_down(&service.name))
            .await
        {
            debug!(service = %service.name, %cause, "service did not acknowledge stop");
        }
    }
    job_manager.stop(ctx).await?;
    Ok(completions)
}
