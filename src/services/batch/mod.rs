//! Batch-scheduled compute service.
//!
//! Owns a uniform fleet and controls access through a batch queue. Jobs carry
//! `-N`/`-c`/`-t` arguments; a pluggable scheduler picks start times and
//! hosts; an alarm enforces every job's walltime. Pilot jobs become nested
//! bare-metal services over their allocated nodes, torn down when their
//! walltime alarm fires.
//!
//! Memory is deliberately not partitioned among co-located jobs: each job
//! runs as if it had the host's full ram.

use std::collections::{HashMap, VecDeque};

use crate::failure::FailureCause;
use crate::jobs::{JobId, PilotJobRef, PilotJobState, StandardJobRef, StandardJobState, WorkflowJob};
use crate::messages::{msg, Message, ResourceInfo};
use crate::services::alarm;
use crate::services::bare_metal::{self, BareMetalServiceSpec};
use crate::services::executor::{self, ExecutorSpec};
use crate::services::storage::StorageServiceHandle;
use crate::services::{ComputeServiceHandle, ComputeServiceKind, CorePool, ServiceConfig, TaskSelectionAlgorithm};
use crate::sim::{Kernel, SimHandle};
use crate::utils::prelude::*;

mod batch_job;
mod schedulers;
pub mod trace;

pub use batch_job::{parse_batch_args, BatchJob};

use schedulers::{BatchScheduler, QueuedView, RunningView, SchedulingContext};

#[derive(Debug, Clone)]
pub struct BatchServiceSpec {
    pub name: String,
    /// host the daemon runs on
    pub host: String,
    /// the uniform fleet, in declared order
    pub compute_hosts: Vec<String>,
    pub cores_per_host: u64,
    pub ram_per_host: f64,
    pub config: ServiceConfig,
    pub default_storage: Option<StorageServiceHandle>,
    /// pre-loaded workload trace to replay, if any
    pub trace: Vec<trace::TraceEntry>,
}

pub fn start(kernel: &Kernel, spec: BatchServiceSpec) -> ComputeServiceHandle {
    let mailbox = format!("{}_mailbox", spec.name);
    let handle = ComputeServiceHandle {
        kind: ComputeServiceKind::Batch,
        name: spec.name.clone(),
        mailbox: mailbox.clone(),
        host: spec.host.clone(),
        supports_standard_jobs: spec.config.supports_standard_jobs,
        supports_pilot_jobs: spec.config.supports_pilot_jobs,
    };
    let (name, host, mb) = (spec.name.clone(), spec.host.clone(), mailbox.clone());
    let self_handle = handle.clone();
    kernel.spawn(&name, &host, true, Some(&mailbox), move |ctx| {
        service_main(ctx, mb, self_handle, spec)
    });
    handle
}

enum RunningBody {
    Standard { executor_mailbox: String },
    Pilot { nested: ComputeServiceHandle },
}

struct RunningBatch {
    job: BatchJob,
    body: RunningBody,
}

struct Batch {
    ctx: SimHandle,
    name: String,
    mailbox: String,
    host: String,
    cfg: ServiceConfig,
    hosts: Vec<String>,
    cores_per_host: u64,
    ram_per_host: f64,
    pool: CorePool,
    scheduler: Box<dyn BatchScheduler>,
    queue: VecDeque<BatchJob>,
    running: HashMap<u64, RunningBatch>,
    /// workflow job id -> batch job id
    by_workflow_job: HashMap<JobId, u64>,
    next_batch_id: u64,
    default_storage: Option<StorageServiceHandle>,
}

async fn service_main(
    ctx: SimHandle,
    mailbox: String,
    self_handle: ComputeServiceHandle,
    spec: BatchServiceSpec,
) -> std::result::Result<(), FailureCause> {
    let scheduler = schedulers::make_scheduler(spec.config.batch_scheduling_algorithm, spec.config.host_selection_algorithm);
    let mut svc = Batch {
        name: spec.name,
        mailbox,
        host: spec.host,
        hosts: spec.compute_hosts.clone(),
        cores_per_host: spec.cores_per_host,
        ram_per_host: spec.ram_per_host,
        pool: CorePool::new(
            spec.compute_hosts
                .iter()
                .map(|h| (h.clone(), spec.cores_per_host, spec.ram_per_host)),
        ),
        scheduler,
        cfg: spec.config,
        queue: VecDeque::new(),
        running: HashMap::new(),
        by_workflow_job: HashMap::new(),
        next_batch_id: 0,
        default_storage: spec.default_storage,
        ctx,
    };
    info!(
        service = %svc.name,
        nodes = svc.hosts.len(),
        cores_per_node = svc.cores_per_host,
        algorithm = %svc.cfg.batch_scheduling_algorithm,
        "batch service starting"
    );

    if !spec.trace.is_empty() {
        let rate = svc.ctx.flop_rate_of(&svc.hosts[0])?;
        trace::start_replayer(&svc.ctx, self_handle, rate, spec.trace);
    }

    loop {
        let message = match svc.ctx.recv(&svc.mailbox).await {
            Ok(m) => m,
            Err(e) => return Err(e.into()),
        };
        if svc.process_message(message).await? {
            return Ok(());
        }
        // observe everything already delivered at this timestamp before
        // making a placement decision
        while let Ok(m) = svc.ctx.recv_timeout(&svc.mailbox, crate::types::Duration::ZERO).await {
            if svc.process_message(m).await? {
                return Ok(());
            }
        }
        svc.schedule();
    }
}

impl Batch {
    /// Detached send with this service's payload-size overrides applied.
    fn post(&self, mailbox: &str, message: impl Into<Message>) {
        let message = message.into();
        let bytes = self.cfg.payloads.payload_of(&message);
        self.ctx.dsend_sized(mailbox, message, bytes);
    }

    async fn process_message(&mut self, message: Message) -> std::result::Result<bool, FailureCause> {
        match message {
            Message::SubmitStandardJob(m) => self.handle_submit_standard(m),
            Message::SubmitPilotJob(m) => self.handle_submit_pilot(m),
            Message::TerminateStandardJob(m) => self.handle_terminate_standard(m).await,
            Message::TerminatePilotJob(m) => self.handle_terminate_pilot(m).await,
            Message::ExecutorDone(m) => self.handle_executor_done(m),
            Message::ExecutorFailed(m) => self.handle_executor_failed(m),
            Message::BatchJobTimeout(m) => self.handle_job_timeout(m.batch_job_id).await,
            Message::BatchEstimateRequest(m) => self.handle_estimate(m),
            Message::ResourceInfoRequest(m) => self.answer_resource_info(&m.answer_mailbox),
            Message::StopDaemon(m) => {
                self.shut_down(m.cause).await?;
                self.post(&m.ack_mailbox, msg::DaemonStopped { service: self.name.clone() });
                return Ok(true);
            }
            other => {
                warn!(service = %self.name, kind = other.kind(), "batch service ignoring message");
            }
        }
        Ok(false)
    }

    fn admit(&mut self, job: WorkflowJob, args: &HashMap<String, String>) -> std::result::Result<(), FailureCause> {
        let (nodes, cores_per_node, walltime, priority) = parse_batch_args(&self.name, args)?;
        if nodes == 0 || cores_per_node == 0 {
            return Err(FailureCause::not_enough_resources(&self.name, "zero nodes or cores requested"));
        }
        if nodes as usize > self.hosts.len() || cores_per_node > self.cores_per_host {
            return Err(FailureCause::not_enough_resources(
                &self.name,
                format!(
                    "{} nodes x {} cores requested, fleet is {} x {}",
                    nodes,
                    cores_per_node,
                    self.hosts.len(),
                    self.cores_per_host
                ),
            ));
        }
        self.next_batch_id += 1;
        let batch_job = BatchJob {
            id: self.next_batch_id,
            job: job.clone(),
            nodes,
            cores_per_node,
            walltime,
            priority,
            from_trace: job.id() >= trace::TRACE_JOB_ID_BASE,
            arrival: self.ctx.now(),
            begin: None,
            allocation: vec![],
        };
        self.by_workflow_job.insert(job.id(), batch_job.id);
        self.scheduler.on_submit(&QueuedView {
            id: batch_job.id,
            nodes,
            cores_per_node,
            walltime,
        });
        debug!(service = %self.name, batch_id = batch_job.id, job = %job.name(), nodes, cores_per_node, %walltime, "batch job queued");
        self.queue.push_back(batch_job);
        Ok(())
    }

    fn handle_submit_standard(&mut self, m: msg::SubmitStandardJob) {
        let result = if !self.cfg.supports_standard_jobs {
            Err(FailureCause::job_type_not_supported(&self.name, "standard"))
        } else {
            self.admit(WorkflowJob::Standard(m.job.clone()), &m.args)
        };
        if result.is_ok() {
            let mut job = m.job.borrow_mut();
            job.state = StandardJobState::Pending;
            job.callback_mailbox = Some(m.callback_mailbox.clone());
            job.submitted_to = Some(self.mailbox.clone());
        }
        let job_id = m.job.borrow().id;
        self.post(&m.answer_mailbox, msg::SubmitStandardJobAnswer { job_id, result });
    }

    fn handle_submit_pilot(&mut self, m: msg::SubmitPilotJob) {
        let result = if !self.cfg.supports_pilot_jobs {
            Err(FailureCause::job_type_not_supported(&self.name, "pilot"))
        } else {
            self.admit(WorkflowJob::Pilot(m.job.clone()), &m.args)
        };
        if result.is_ok() {
            let mut job = m.job.borrow_mut();
            job.state = PilotJobState::Pending;
            job.callback_mailbox = Some(m.callback_mailbox.clone());
            job.submitted_to = Some(self.mailbox.clone());
        }
        let job_id = m.job.borrow().id;
        self.post(&m.answer_mailbox, msg::SubmitPilotJobAnswer { job_id, result });
    }

    /// Start every job the scheduler wants running now.
    fn schedule(&mut self) {
        loop {
            let queue_views = self.queue_views();
            let running_views = self.running_views();
            let cx = SchedulingContext {
                now: self.ctx.now(),
                num_hosts: self.hosts.len(),
                cores_per_host: self.cores_per_host,
                queue: &queue_views,
                running: &running_views,
            };
            let starts = self.scheduler.choose_next(&cx);
            if starts.is_empty() {
                break;
            }
            for (batch_id, host_indices) in starts {
                self.start_job(batch_id, &host_indices);
            }
        }
    }

    /// Queue snapshot in scheduling order. The queue stays FIFO by arrival;
    /// an explicit priority reorders it, and the task-selection algorithm
    /// breaks ties only among trace-replayed jobs of equal rank.
    fn queue_views(&self) -> Vec<QueuedView> {
        let mut jobs: Vec<&BatchJob> = self.queue.iter().collect();
        let selection = self.cfg.task_selection_algorithm;
        jobs.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then_with(|| {
                if !(a.from_trace && b.from_trace) {
                    return std::cmp::Ordering::Equal;
                }
                match selection {
                    TaskSelectionAlgorithm::MaximumFlops => b.total_flops().total_cmp(&a.total_flops()),
                    TaskSelectionAlgorithm::MinimumFlops => a.total_flops().total_cmp(&b.total_flops()),
                    TaskSelectionAlgorithm::SubmissionTime => std::cmp::Ordering::Equal,
                }
            })
        });
        jobs.into_iter()
            .map(|j| QueuedView {
                id: j.id,
                nodes: j.nodes,
                cores_per_node: j.cores_per_node,
                walltime: j.walltime,
            })
            .collect()
    }

    fn running_views(&self) -> Vec<RunningView> {
        self.running
            .values()
            .map(|r| RunningView {
                hosts: r
                    .job
                    .allocation
                    .iter()
                    .map(|h| self.host_index(h))
                    .collect(),
                cores_per_node: r.job.cores_per_node,
                end: r.job.begin.expect("running job has begun") + r.job.walltime,
            })
            .collect()
    }

    fn host_index(&self, host: &str) -> usize {
        self.hosts
            .iter()
            .position(|h| h == host)
            .expect("allocated host belongs to the fleet")
    }

    fn start_job(&mut self, batch_id: u64, host_indices: &[usize]) {
        let pos = self
            .queue
            .iter()
            .position(|j| j.id == batch_id)
            .expect("scheduler starts a queued job");
        let mut batch_job = self.queue.remove(pos).unwrap();
        let hosts: Vec<String> = host_indices.iter().map(|&i| self.hosts[i].clone()).collect();
        for host in &hosts {
            self.pool.allocate(host, batch_job.cores_per_node, 0.0);
        }
        let now = self.ctx.now();
        batch_job.begin = Some(now);
        batch_job.allocation = hosts.clone();

        let body = match batch_job.job.clone() {
            WorkflowJob::Standard(job) => self.start_standard_body(&batch_job, &job, &hosts),
            WorkflowJob::Pilot(job) => self.start_pilot_body(&batch_job, &job, &hosts),
        };
        // walltime enforcement; the alarm is created after the executor so a
        // job finishing exactly at its walltime completes rather than times out
        alarm::start(
            &self.ctx,
            now + batch_job.walltime,
            &self.host,
            &self.mailbox,
            msg::BatchJobTimeout { batch_job_id: batch_id },
            &format!("{}_job_{}", self.name, batch_id),
        );
        info!(
            service = %self.name,
            batch_id,
            job = %batch_job.job.name(),
            hosts = ?batch_job.allocation,
            walltime = %batch_job.walltime,
            "batch job started"
        );
        self.running.insert(batch_id, RunningBatch { job: batch_job, body });
    }

    fn start_standard_body(&mut self, batch_job: &BatchJob, job: &StandardJobRef, hosts: &[String]) -> RunningBody {
        let allocation: Vec<(String, u64, f64)> = hosts
            .iter()
            .map(|h| (h.clone(), batch_job.cores_per_node, 0.0))
            .collect();
        let exec_name = format!("{}_executor_{}", self.name, batch_job.id);
        let spec = ExecutorSpec {
            job: job.clone(),
            allocation,
            callback_mailbox: self.mailbox.clone(),
            core_allocation_policy: self.cfg.core_allocation_policy,
            thread_startup_overhead: self.cfg.thread_startup_overhead,
            task_startup_overhead: self.cfg.task_startup_overhead,
            simulate_computation_as_sleep: self.cfg.simulate_computation_as_sleep,
            default_location: self.default_storage.as_ref().map(|s| s.location()),
        };
        let (_, executor_mailbox) = executor::start(&self.ctx, &exec_name, &hosts[0], spec);
        job.borrow_mut().state = StandardJobState::Running;
        RunningBody::Standard { executor_mailbox }
    }

    fn start_pilot_body(&mut self, batch_job: &BatchJob, job: &PilotJobRef, hosts: &[String]) -> RunningBody {
        let nested_name = format!("{}_pilot_{}", self.name, batch_job.id);
        let nested = bare_metal::start_nested(
            &self.ctx,
            BareMetalServiceSpec {
                name: nested_name,
                host: hosts[0].clone(),
                compute_hosts: hosts
                    .iter()
                    .map(|h| (h.clone(), batch_job.cores_per_node, self.ram_per_host))
                    .collect(),
                config: ServiceConfig {
                    supports_standard_jobs: true,
                    supports_pilot_jobs: false,
                    ..self.cfg.clone()
                },
                default_storage: self.default_storage.clone(),
                // the batch walltime alarm bounds the lease, not a TTL
                ttl: None,
                containing_pilot_job: Some(job.clone()),
                parent_mailbox: None,
            },
        );
        {
            let mut j = job.borrow_mut();
            j.state = PilotJobState::Running;
            j.start_date = Some(self.ctx.now());
            j.nested_service_mailbox = Some(nested.mailbox.clone());
        }
        let callback = job.borrow().callback_mailbox.clone();
        if let Some(callback) = callback {
            self.post(
                &callback,
                msg::PilotJobStarted { job: job.clone(), service: self.name.clone() },
            );
        }
        RunningBody::Pilot { nested }
    }

    fn free_allocation(&mut self, batch_job: &BatchJob) {
        for host in &batch_job.allocation {
            self.pool.free(host, batch_job.cores_per_node, 0.0);
        }
    }

    fn handle_executor_done(&mut self, m: msg::ExecutorDone) {
        let workflow_id = m.job.borrow().id;
        let batch_id = match self.by_workflow_job.remove(&workflow_id) {
            Some(id) => id,
            None => return,
        };
        if let Some(running) = self.running.remove(&batch_id) {
            self.free_allocation(&running.job);
            m.job.borrow_mut().state = StandardJobState::Completed;
            let callback = m.job.borrow().callback_mailbox.clone();
            if let Some(callback) = callback {
                self.post(
                    &callback,
                    msg::StandardJobDone { job: m.job.clone(), service: self.name.clone() },
                );
            }
            self.scheduler.on_completion(batch_id);
            info!(service = %self.name, batch_id, "batch job completed");
        }
    }

    fn handle_executor_failed(&mut self, m: msg::ExecutorFailed) {
        let workflow_id = m.job.borrow().id;
        let batch_id = match self.by_workflow_job.remove(&workflow_id) {
            Some(id) => id,
            None => return,
        };
        if let Some(running) = self.running.remove(&batch_id) {
            self.free_allocation(&running.job);
            {
                let mut job = m.job.borrow_mut();
                if job.state != StandardJobState::Terminated {
                    job.state = StandardJobState::Failed;
                }
            }
            let callback = m.job.borrow().callback_mailbox.clone();
            if let Some(callback) = callback {
                self.post(
                    &callback,
                    msg::StandardJobFailed {
                        job: m.job.clone(),
                        service: self.name.clone(),
                        cause: m.cause.clone(),
                    },
                );
            }
            self.scheduler.on_completion(batch_id);
            info!(service = %self.name, batch_id, cause = %m.cause, "batch job failed");
        }
    }

    async fn handle_job_timeout(&mut self, batch_id: u64) {
        let body = match self.running.get(&batch_id) {
            Some(r) => &r.body,
            None => return, // already finished; the alarm outlived the job
        };
        match body {
            RunningBody::Standard { executor_mailbox } => {
                let mb = executor_mailbox.clone();
                debug!(service = %self.name, batch_id, "walltime reached, killing standard job");
                if self
                    .ctx
                    .send(&mb, msg::TerminateExecutor { cause: FailureCause::JobTimeout })
                    .await
                    .is_err()
                {
                    // executor finished in this very instant; its completion
                    // report is already on its way
                    debug!(service = %self.name, batch_id, "executor gone, completion in flight");
                    return;
                }
                self.scheduler.on_timeout(batch_id);
                // resources are freed when the executor reports back
            }
            RunningBody::Pilot { nested } => {
                let nested = nested.clone();
                let running = self.running.remove(&batch_id).expect("checked above");
                info!(service = %self.name, batch_id, "pilot walltime reached, expiring lease");
                self.stop_nested(&nested, FailureCause::JobKilled).await;
                self.free_allocation(&running.job);
                if let WorkflowJob::Pilot(job) = &running.job.job {
                    self.by_workflow_job.remove(&job.borrow().id);
                    {
                        let mut j = job.borrow_mut();
                        j.state = PilotJobState::Expired;
                        j.nested_service_mailbox = None;
                    }
                    let callback = job.borrow().callback_mailbox.clone();
                    if let Some(callback) = callback {
                        self.post(
                            &callback,
                            msg::PilotJobExpired { job: job.clone(), service: self.name.clone() },
                        );
                    }
                }
                self.scheduler.on_timeout(batch_id);
            }
        }
    }

    async fn stop_nested(&self, nested: &ComputeServiceHandle, cause: FailureCause) {
        let reply = super::request_answer(&self.ctx, &nested.mailbox, |ack_mailbox| {
            msg::StopDaemon { ack_mailbox, cause }.into()
        })
        .await;
        if let Err(cause) = reply {
            warn!(service = %self.name, nested = %nested.name, %cause, "could not stop nested service");
        }
    }

    async fn handle_terminate_standard(&mut self, m: msg::TerminateStandardJob) {
        if let Some(&batch_id) = self.by_workflow_job.get(&m.job_id) {
            if let Some(pos) = self.queue.iter().position(|j| j.id == batch_id) {
                let batch_job = self.queue.remove(pos).unwrap();
                self.by_workflow_job.remove(&m.job_id);
                if let WorkflowJob::Standard(job) = &batch_job.job {
                    job.borrow_mut().state = StandardJobState::Terminated;
                    self.notify_standard_failed(job, FailureCause::JobKilled);
                }
            } else if let Some(running) = self.running.get(&batch_id) {
                if let RunningBody::Standard { executor_mailbox } = &running.body {
                    let mb = executor_mailbox.clone();
                    let _ = self
                        .ctx
                        .send(&mb, msg::TerminateExecutor { cause: FailureCause::JobKilled })
                        .await;
                }
            }
        } else {
            debug!(service = %self.name, job_id = m.job_id, "terminate for unknown standard job, ignoring");
        }
        self.post(
            &m.answer_mailbox,
            msg::TerminateStandardJobAnswer { job_id: m.job_id, result: Ok(()) },
        );
    }

    async fn handle_terminate_pilot(&mut self, m: msg::TerminatePilotJob) {
        if let Some(&batch_id) = self.by_workflow_job.get(&m.job_id) {
            if let Some(pos) = self.queue.iter().position(|j| j.id == batch_id) {
                let batch_job = self.queue.remove(pos).unwrap();
                self.by_workflow_job.remove(&m.job_id);
                if let WorkflowJob::Pilot(job) = &batch_job.job {
                    job.borrow_mut().state = PilotJobState::Terminated;
                    self.notify_pilot_failed(job, FailureCause::JobKilled);
                }
            } else if let Some(running) = self.running.remove(&batch_id) {
                self.by_workflow_job.remove(&m.job_id);
                if let RunningBody::Pilot { nested } = &running.body {
                    self.stop_nested(nested, FailureCause::JobKilled).await;
                }
                self.free_allocation(&running.job);
                if let WorkflowJob::Pilot(job) = &running.job.job {
                    {
                        let mut j = job.borrow_mut();
                        j.state = PilotJobState::Terminated;
                        j.nested_service_mailbox = None;
                    }
                    self.notify_pilot_failed(job, FailureCause::JobKilled);
                }
            }
        } else {
            debug!(service = %self.name, job_id = m.job_id, "terminate for unknown pilot job, ignoring");
        }
        self.post(
            &m.answer_mailbox,
            msg::TerminatePilotJobAnswer { job_id: m.job_id, result: Ok(()) },
        );
    }

    fn handle_estimate(&mut self, m: msg::BatchEstimateRequest) {
        let queue_views = self.queue_views();
        let running_views = self.running_views();
        let cx = SchedulingContext {
            now: self.ctx.now(),
            num_hosts: self.hosts.len(),
            cores_per_host: self.cores_per_host,
            queue: &queue_views,
            running: &running_views,
        };
        let tentative: Vec<(String, u64, u64, crate::types::Duration)> = m
            .requests
            .iter()
            .map(|(id, n, c, t)| (id.clone(), *n, *c, crate::types::Duration(*t)))
            .collect();
        let estimates = self.scheduler.estimate_start_times(&cx, &tentative);
        self.post(&m.answer_mailbox, msg::BatchEstimateAnswer { estimates });
    }

    fn answer_resource_info(&self, answer_mailbox: &str) {
        let info = ResourceInfo {
            service: self.name.clone(),
            per_host: self
                .pool
                .slots()
                .iter()
                .map(|s| (s.host.clone(), s.cores, s.free_cores))
                .collect(),
            ram_per_host: self.ram_per_host,
            core_flop_rate: self
                .hosts
                .first()
                .and_then(|h| self.ctx.flop_rate_of(h).ok())
                .unwrap_or(0.0),
            ttl_remaining: None,
            supports_standard_jobs: self.cfg.supports_standard_jobs,
            supports_pilot_jobs: self.cfg.supports_pilot_jobs,
        };
        self.post(answer_mailbox, msg::ResourceInfoAnswer { info });
    }

    fn notify_standard_failed(&self, job: &StandardJobRef, cause: FailureCause) {
        let callback = job.borrow().callback_mailbox.clone();
        if let Some(callback) = callback {
            self.post(
                &callback,
                msg::StandardJobFailed {
                    job: job.clone(),
                    service: self.name.clone(),
                    cause,
                },
            );
        }
    }

    fn notify_pilot_failed(&self, job: &PilotJobRef, cause: FailureCause) {
        let callback = job.borrow().callback_mailbox.clone();
        if let Some(callback) = callback {
            self.post(
                &callback,
                msg::PilotJobFailed {
                    job: job.clone(),
                    service: self.name.clone(),
                    cause,
                },
            );
        }
    }

    async fn shut_down(&mut self, cause: FailureCause) -> std::result::Result<(), FailureCause> {
        info!(service = %self.name, %cause, "batch service stopping");
        let queued: Vec<BatchJob> = self.queue.drain(..).collect();
        for batch_job in queued {
            self.by_workflow_job.remove(&batch_job.job.id());
            match &batch_job.job {
                WorkflowJob::Standard(job) => {
                    job.borrow_mut().state = StandardJobState::Failed;
                    self.notify_standard_failed(job, cause.clone());
                }
                WorkflowJob::Pilot(job) => {
                    job.borrow_mut().state = PilotJobState::Failed;
                    self.notify_pilot_failed(job, cause.clone());
                }
            }
        }

        // terminate running standard jobs and wait for their executors
        let executor_mailboxes: Vec<String> = self
            .running
            .values()
            .filter_map(|r| match &r.body {
                RunningBody::Standard { executor_mailbox } => Some(executor_mailbox.clone()),
                RunningBody::Pilot { .. } => None,
            })
            .collect();
        for mb in executor_mailboxes {
            if let Err(err) = self.ctx.send(&mb, msg::TerminateExecutor { cause: cause.clone() }).await {
                debug!(service = %self.name, cause = %err, "executor already gone");
            }
        }
        while self
            .running
            .values()
            .any(|r| matches!(r.body, RunningBody::Standard { .. }))
        {
            let message = self.ctx.recv(&self.mailbox).await?;
            match message {
                Message::ExecutorDone(m) => self.handle_executor_done(m),
                Message::ExecutorFailed(m) => self.handle_executor_failed(m),
                Message::SubmitStandardJob(m) => {
                    let job_id = m.job.borrow().id;
                    self.post(
                        &m.answer_mailbox,
                        msg::SubmitStandardJobAnswer {
                            job_id,
                            result: Err(FailureCause::service_down(&self.name)),
                        },
                    );
                }
                Message::SubmitPilotJob(m) => {
                    let job_id = m.job.borrow().id;
                    self.post(
                        &m.answer_mailbox,
                        msg::SubmitPilotJobAnswer {
                            job_id,
                            result: Err(FailureCause::service_down(&self.name)),
                        },
                    );
                }
                other => {
                    debug!(service = %self.name, kind = other.kind(), "ignored while stopping");
                }
            }
        }

        // then the running pilots
        let pilot_ids: Vec<u64> = self
            .running
            .iter()
            .filter(|(_, r)| matches!(r.body, RunningBody::Pilot { .. }))
            .map(|(&id, _)| id)
            .collect();
        for batch_id in pilot_ids {
            if let Some(running) = self.running.remove(&batch_id) {
                if let RunningBody::Pilot { nested } = &running.body {
                    self.stop_nested(nested, cause.clone()).await;
                }
                self.free_allocation(&running.job);
                if let WorkflowJob::Pilot(job) = &running.job.job {
                    self.by_workflow_job.remove(&job.borrow().id);
                    job.borrow_mut().state = PilotJobState::Failed;
                    self.notify_pilot_failed(job, cause.clone());
                }
            }
        }
        Ok(())
    }
}
