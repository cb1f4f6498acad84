//! The client-side job manager that lives alongside a workflow manager.
//!
//! Job factory, submission and termination proxy, and the completion-event
//! demultiplexer: a single receive loop that turns service notifications into
//! the unified [`ExecutionEvent`] stream delivered to the workflow manager's
//! mailbox.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::events::ExecutionEvent;
use crate::failure::FailureCause;
use crate::jobs::{
    FileCopySpec, FileLocation, JobId, PilotJobRef, StandardJob, StandardJobRef, StandardJobState, PilotJob,
    PilotJobState, WorkflowJob,
};
use crate::messages::{msg, Message};
use crate::services::{request_answer, ComputeServiceHandle};
use crate::sim::SimHandle;
use crate::types::Duration;
use crate::utils::prelude::*;
use crate::workflow::{TaskRef, TaskState};

pub struct JobManager {
    name: String,
    mailbox: String,
    ctx: SimHandle,
}

impl JobManager {
    /// Spawn the demultiplexer actor next to the calling workflow manager.
    /// Events are forwarded to `wms_mailbox`.
    pub fn new(ctx: &SimHandle, wms_mailbox: &str) -> JobManager {
        let name = format!("job_manager_{}", ctx.unique_id());
        let mailbox = format!("{}_mailbox", name);
        let mb = mailbox.clone();
        let wms = wms_mailbox.to_owned();
        ctx.spawn(&name, ctx.host(), true, Some(&mailbox), move |actor| {
            demux_main(actor, mb, wms)
        });
        JobManager {
            name,
            mailbox,
            ctx: ctx.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The mailbox services call back on.
    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    /// Job ids come from the simulation-wide counter so that jobs from
    /// different managers never collide inside a service.
    fn next_id(&self) -> JobId {
        self.ctx.unique_id()
    }

    pub fn create_standard_job(
        &self,
        tasks: Vec<TaskRef>,
        file_locations: HashMap<String, FileLocation>,
        pre_copies: Vec<FileCopySpec>,
        post_copies: Vec<FileCopySpec>,
    ) -> StandardJobRef {
        let mut job = StandardJob::new(self.next_id(), tasks, file_locations);
        job.pre_copies = pre_copies;
        job.post_copies = post_copies;
        Rc::new(RefCell::new(job))
    }

    pub fn create_pilot_job(
        &self,
        num_hosts: u64,
        cores_per_host: u64,
        ram_per_host: f64,
        duration: Duration,
    ) -> PilotJobRef {
        Rc::new(RefCell::new(PilotJob::new(
            self.next_id(),
            num_hosts,
            cores_per_host,
            ram_per_host,
            duration,
        )))
    }

    /// Submit a job; on success the job manager tracks it and will forward
    /// exactly one completion or failure event to the workflow manager.
    pub async fn submit_job(
        &self,
        ctx: &SimHandle,
        job: &WorkflowJob,
        service: &ComputeServiceHandle,
        service_specific_args: HashMap<String, String>,
    ) -> std::result::Result<(), FailureCause> {
        match job {
            WorkflowJob::Standard(j) => {
                for task in &j.borrow().tasks {
                    task.borrow_mut().state = TaskState::Pending;
                }
                let submitted = service
                    .submit_standard_job(ctx, j, service_specific_args, &self.mailbox)
                    .await;
                if let Err(cause) = submitted {
                    for task in &j.borrow().tasks {
                        task.borrow_mut().state = TaskState::Ready;
                    }
                    return Err(cause);
                }
            }
            WorkflowJob::Pilot(j) => {
                service
                    .submit_pilot_job(ctx, j, service_specific_args, &self.mailbox)
                    .await?;
            }
        }
        ctx.dsend(&self.mailbox, msg::TrackJob { job: job.clone() });
        Ok(())
    }

    /// Terminate a job: it ends in state TERMINATED whether or not it had
    /// started. A running job additionally produces its one
    /// `Failed(JobKilled)` event.
    pub async fn terminate_job(&self, ctx: &SimHandle, job: &WorkflowJob) -> std::result::Result<(), FailureCause> {
        match job {
            WorkflowJob::Standard(j) => {
                let (id, target) = {
                    let j = j.borrow();
                    (j.id, j.submitted_to.clone())
                };
                let target = target.ok_or_else(|| FailureCause::network("terminating unsubmitted job"))?;
                let reply = request_answer(ctx, &target, |answer_mailbox| {
                    msg::TerminateStandardJob { job_id: id, answer_mailbox }.into()
                })
                .await?;
                match reply {
                    Message::TerminateStandardJobAnswer(a) => a.result?,
                    other => return Err(crate::services::unexpected_reply("TerminateStandardJobAnswer", &other)),
                }
                {
                    let mut j = j.borrow_mut();
                    j.state = StandardJobState::Terminated;
                    for task in &j.tasks {
                        let mut t = task.borrow_mut();
                        if t.state != TaskState::Completed {
                            t.state = TaskState::Ready;
                        }
                    }
                }
            }
            WorkflowJob::Pilot(j) => {
                let (id, target) = {
                    let j = j.borrow();
                    (j.id, j.submitted_to.clone())
                };
                let target = target.ok_or_else(|| FailureCause::network("terminating unsubmitted job"))?;
                let reply = request_answer(ctx, &target, |answer_mailbox| {
                    msg::TerminatePilotJob { job_id: id, answer_mailbox }.into()
                })
                .await?;
                match reply {
                    Message::TerminatePilotJobAnswer(a) => a.result?,
                    other => return Err(crate::services::unexpected_reply("TerminatePilotJobAnswer", &other)),
                }
                j.borrow_mut().state = PilotJobState::Terminated;
            }
        }
        Ok(())
    }

    /// Drop tracking for a job without touching it.
    pub fn forget_job(&self, ctx: &SimHandle, job_id: JobId) {
        ctx.dsend(&self.mailbox, msg::ForgetJob { job_id });
    }

    /// Stop the demultiplexer; outstanding jobs are terminated first.
    pub async fn stop(&self, ctx: &SimHandle) -> std::result::Result<(), FailureCause> {
        let reply = request_answer(ctx, &self.mailbox, |ack_mailbox| {
            msg::StopDaemon {
                ack_mailbox,
                cause: FailureCause::service_down(&self.name),
            }
            .into()
        })
        .await?;
        match reply {
            Message::DaemonStopped(_) => Ok(()),
            other => Err(crate::services::unexpected_reply("DaemonStopped", &other)),
        }
    }
}

async fn demux_main(ctx: SimHandle, mailbox: String, wms_mailbox: String) -> std::result::Result<(), FailureCause> {
    let mut tracked: HashMap<JobId, WorkflowJob> = HashMap::new();
    debug!(job_manager = %ctx.name(), "job manager starting");

    loop {
        let message = ctx.recv(&mailbox).await?;
        match message {
            Message::TrackJob(m) => {
                // an instantaneous job may already have reported back
                let terminal = match &m.job {
                    WorkflowJob::Standard(j) => matches!(
                        j.borrow().state,
                        StandardJobState::Completed | StandardJobState::Failed | StandardJobState::Terminated
                    ),
                    WorkflowJob::Pilot(j) => matches!(
                        j.borrow().state,
                        PilotJobState::Expired | PilotJobState::Failed | PilotJobState::Terminated
                    ),
                };
                if !terminal {
                    tracked.insert(m.job.id(), m.job);
                }
            }
            Message::ForgetJob(m) => {
                tracked.remove(&m.job_id);
            }
            Message::StandardJobDone(m) => {
                tracked.remove(&m.job.borrow().id);
                forward(&ctx, &wms_mailbox, ExecutionEvent::StandardJobCompleted { job: m.job });
            }
            Message::StandardJobFailed(m) => {
                tracked.remove(&m.job.borrow().id);
                requeue_tasks(&m.job);
                forward(
                    &ctx,
                    &wms_mailbox,
                    ExecutionEvent::StandardJobFailed { job: m.job, cause: m.cause },
                );
            }
            Message::PilotJobStarted(m) => {
                forward(&ctx, &wms_mailbox, ExecutionEvent::PilotJobStarted { job: m.job });
            }
            Message::PilotJobExpired(m) => {
                tracked.remove(&m.job.borrow().id);
                forward(&ctx, &wms_mailbox, ExecutionEvent::PilotJobExpired { job: m.job });
            }
            Message::PilotJobFailed(m) => {
                tracked.remove(&m.job.borrow().id);
                forward(
                    &ctx,
                    &wms_mailbox,
                    ExecutionEvent::PilotJobFailed { job: m.job, cause: m.cause },
                );
            }
            Message::StopDaemon(m) => {
                cancel_outstanding(&ctx, &mut tracked).await;
                ctx.dsend(&m.ack_mailbox, msg::DaemonStopped { service: ctx.name().to_owned() });
                return Ok(());
            }
            other => {
                warn!(job_manager = %ctx.name(), kind = other.kind(), "job manager ignoring message");
            }
        }
    }
}

/// Failed standard jobs return their tasks to READY with the failure count
/// incremented; completed tasks are left alone.
fn requeue_tasks(job: &StandardJobRef) {
    for task in &job.borrow().tasks {
        let mut t = task.borrow_mut();
        match t.state {
            TaskState::Completed => {}
            TaskState::Failed => {
                t.failure_count += 1;
                t.state = TaskState::Ready;
            }
            _ => t.state = TaskState::Ready,
        }
    }
}

fn forward(ctx: &SimHandle, wms_mailbox: &str, event: ExecutionEvent) {
    debug!(job_manager = %ctx.name(), %event, "forwarding execution event");
    ctx.dsend(wms_mailbox, msg::WorkflowEvent { event });
}

/// On shutdown, cancel whatever is still in flight so no executor keeps
/// burning simulated time for a dead client.
async fn cancel_outstanding(ctx: &SimHandle, tracked: &mut HashMap<JobId, WorkflowJob>) {
    let jobs: Vec<WorkflowJob> = tracked.drain().map(|(_, j)| j).collect();
    for job in jobs {
        let (id, target, message): (JobId, Option<String>, fn(JobId, String) -> Message) = match &job {
            WorkflowJob::Standard(j) => (j.borrow().id, j.borrow().submitted_to.clone(), |job_id, answer_mailbox| {
                msg::TerminateStandardJob { job_id, answer_mailbox }.into()
            }),
            WorkflowJob::Pilot(j) => (j.borrow().id, j.borrow().submitted_to.clone(), |job_id, answer_mailbox| {
                msg::TerminatePilotJob { job_id, answer_mailbox }.into()
            }),
        };
        let target = match target {
            Some(t) => t,
            None => continue,
        };
        if let Err(cause) = request_answer(ctx, &target, |answer| message(id, answer)).await {
            debug!(job = id, %cause, "could not cancel job during shutdown");
        }
    }
}
