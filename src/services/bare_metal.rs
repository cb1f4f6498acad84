//! Multi-host bare-metal compute service.
//!
//! Generalizes the multicore service across a set of hosts with per-host,
//! per-core accounting. A standard job's allocation is found by greedy
//! first-fit over the hosts in declared order; pilot jobs lease
//! `cores_per_host` on each of `num_hosts` hosts and run a nested bare-metal
//! service over the leased slice. Also serves as the pilot body inside the
//! batch service, where the batch walltime alarm bounds its life instead of
//! a TTL.

use std::collections::{HashMap, VecDeque};

use crate::failure::FailureCause;
use crate::jobs::{JobId, PilotJobRef, PilotJobState, StandardJobRef, StandardJobState, WorkflowJob};
use crate::messages::{msg, Message, ResourceInfo};
use crate::services::executor::{self, ExecutorSpec};
use crate::services::storage::StorageServiceHandle;
use crate::services::{ComputeServiceHandle, ComputeServiceKind, CorePool, ServiceConfig};
use crate::sim::{Kernel, RecvError, SimHandle};
use crate::types::{Duration, Time};
use crate::utils::prelude::*;

#[derive(Debug, Clone)]
pub struct BareMetalServiceSpec {
    pub name: String,
    /// daemon host; also the first compute host by convention
    pub host: String,
    /// (host, cores, ram) in declared order
    pub compute_hosts: Vec<(String, u64, f64)>,
    pub config: ServiceConfig,
    pub default_storage: Option<StorageServiceHandle>,
    pub ttl: Option<Duration>,
    pub containing_pilot_job: Option<PilotJobRef>,
    pub parent_mailbox: Option<String>,
}

pub fn start(kernel: &Kernel, spec: BareMetalServiceSpec) -> ComputeServiceHandle {
    let mailbox = format!("{}_mailbox", spec.name);
    let handle = make_handle(&spec, &mailbox);
    let (name, host, mb) = (spec.name.clone(), spec.host.clone(), mailbox.clone());
    kernel.spawn(&name, &host, true, Some(&mailbox), move |ctx| service_main(ctx, mb, spec));
    handle
}

pub(crate) fn start_nested(ctx: &SimHandle, spec: BareMetalServiceSpec) -> ComputeServiceHandle {
    let mailbox = format!("{}_mailbox", spec.name);
    let handle = make_handle(&spec, &mailbox);
    let (name, host, mb) = (spec.name.clone(), spec.host.clone(), mailbox.clone());
    ctx.spawn(&name, &host, true, Some(&mailbox), move |actor| service_main(actor, mb, spec));
    handle
}

fn make_handle(spec: &BareMetalServiceSpec, mailbox: &str) -> ComputeServiceHandle {
    ComputeServiceHandle {
        kind: if spec.containing_pilot_job.is_some() {
            ComputeServiceKind::PilotNested
        } else {
            ComputeServiceKind::BareMetal
        },
        name: spec.name.clone(),
        mailbox: mailbox.to_owned(),
        host: spec.host.clone(),
        supports_standard_jobs: spec.config.supports_standard_jobs,
        supports_pilot_jobs: spec.config.supports_pilot_jobs,
    }
}

struct RunningExecutor {
    job: StandardJobRef,
    mailbox: String,
    /// (host, cores, ram) to give back
    allocation: Vec<(String, u64, f64)>,
}

struct RunningPilot {
    job: PilotJobRef,
    nested: ComputeServiceHandle,
    hosts: Vec<String>,
    cores_per_host: u64,
    ram_per_host: f64,
}

struct BareMetal {
    ctx: SimHandle,
    name: String,
    mailbox: String,
    cfg: ServiceConfig,
    pool: CorePool,
    death_date: Option<Time>,
    pending: VecDeque<WorkflowJob>,
    executors: HashMap<JobId, RunningExecutor>,
    pilots: HashMap<JobId, RunningPilot>,
    default_storage: Option<StorageServiceHandle>,
    containing_pilot_job: Option<PilotJobRef>,
    parent_mailbox: Option<String>,
    next_executor: u64,
}

async fn service_main(ctx: SimHandle, mailbox: String, spec: BareMetalServiceSpec) -> std::result::Result<(), FailureCause> {
    let death_date = spec.ttl.map(|ttl| ctx.now() + ttl);
    let mut svc = BareMetal {
        name: spec.name,
        mailbox,
        cfg: spec.config,
        pool: CorePool::new(spec.compute_hosts),
        death_date,
        pending: VecDeque::new(),
        executors: HashMap::new(),
        pilots: HashMap::new(),
        default_storage: spec.default_storage,
        containing_pilot_job: spec.containing_pilot_job,
        parent_mailbox: spec.parent_mailbox,
        next_executor: 0,
        ctx,
    };
    info!(
        service = %svc.name,
        hosts = svc.pool.slots().len(),
        cores = svc.pool.total_cores(),
        ttl = ?svc.death_date,
        "bare-metal service starting"
    );

    loop {
        let message = match svc.death_date {
            Some(date) => match svc.ctx.recv_timeout(&svc.mailbox, date - svc.ctx.now()).await {
                Ok(m) => Some(m),
                Err(RecvError::Timeout) => None,
                Err(e) => return Err(e.into()),
            },
            None => match svc.ctx.recv(&svc.mailbox).await {
                Ok(m) => Some(m),
                Err(e) => return Err(e.into()),
            },
        };
        match message {
            None => {
                svc.expire().await?;
                return Ok(());
            }
            Some(m) => {
                if svc.process_message(m).await? {
                    return Ok(());
                }
            }
        }
        svc.dispatch_pending();
    }
}

impl BareMetal {
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
            Message::PilotLeaseExpired(m) => self.handle_lease_expired(m.pilot_job_id),
            Message::ResourceInfoRequest(m) => self.answer_resource_info(&m.answer_mailbox),
            Message::StopDaemon(m) => {
                self.shut_down(m.cause).await?;
                self.post(&m.ack_mailbox, msg::DaemonStopped { service: self.name.clone() });
                return Ok(true);
            }
            other => {
                warn!(service = %self.name, kind = other.kind(), "bare-metal service ignoring message");
            }
        }
        Ok(false)
    }

    fn handle_submit_standard(&mut self, m: msg::SubmitStandardJob) {
        let result = self.validate_standard(&m.job);
        if result.is_ok() {
            {
                let mut job = m.job.borrow_mut();
                job.state = StandardJobState::Pending;
                job.callback_mailbox = Some(m.callback_mailbox.clone());
                job.submitted_to = Some(self.mailbox.clone());
            }
            self.pending.push_back(WorkflowJob::Standard(m.job.clone()));
        }
        let job_id = m.job.borrow().id;
        self.post(&m.answer_mailbox, msg::SubmitStandardJobAnswer { job_id, result });
    }

    fn validate_standard(&self, job: &StandardJobRef) -> std::result::Result<(), FailureCause> {
        if !self.cfg.supports_standard_jobs {
            return Err(FailureCause::job_type_not_supported(&self.name, "standard"));
        }
        let job = job.borrow();
        if job.min_required_cores() > self.pool.total_cores() {
            return Err(FailureCause::not_enough_resources(
                &self.name,
                format!(
                    "{} cores requested, {} total",
                    job.min_required_cores(),
                    self.pool.total_cores()
                ),
            ));
        }
        let max_host_ram = self
            .pool
            .slots()
            .iter()
            .map(|s| s.ram)
            .fold(0.0, f64::max);
        if job.min_required_ram() > max_host_ram {
            return Err(FailureCause::not_enough_resources(&self.name, "insufficient ram"));
        }
        Ok(())
    }

    fn handle_submit_pilot(&mut self, m: msg::SubmitPilotJob) {
        let result = self.validate_pilot(&m.job);
        if result.is_ok() {
            {
                let mut job = m.job.borrow_mut();
                job.state = PilotJobState::Pending;
                job.callback_mailbox = Some(m.callback_mailbox.clone());
                job.submitted_to = Some(self.mailbox.clone());
            }
            self.pending.push_back(WorkflowJob::Pilot(m.job.clone()));
        }
        let job_id = m.job.borrow().id;
        self.post(&m.answer_mailbox, msg::SubmitPilotJobAnswer { job_id, result });
    }

    fn validate_pilot(&self, job: &PilotJobRef) -> std::result::Result<(), FailureCause> {
        if !self.cfg.supports_pilot_jobs {
            return Err(FailureCause::job_type_not_supported(&self.name, "pilot"));
        }
        let job = job.borrow();
        let capable = self
            .pool
            .slots()
            .iter()
            .filter(|s| s.cores >= job.cores_per_host && s.ram >= job.ram_per_host)
            .count() as u64;
        if job.num_hosts > capable {
            return Err(FailureCause::not_enough_resources(
                &self.name,
                format!("{} capable hosts, {} requested", capable, job.num_hosts),
            ));
        }
        Ok(())
    }

    async fn handle_terminate_standard(&mut self, m: msg::TerminateStandardJob) {
        if let Some(pos) = self
            .pending
            .iter()
            .position(|j| matches!(j, WorkflowJob::Standard(s) if s.borrow().id == m.job_id))
        {
            let job = match self.pending.remove(pos) {
                Some(WorkflowJob::Standard(job)) => job,
                _ => unreachable!(),
            };
            job.borrow_mut().state = StandardJobState::Terminated;
            self.notify_standard_failed(&job, FailureCause::JobKilled);
        } else if let Some(running) = self.executors.get(&m.job_id) {
            let _ = self
                .ctx
                .send(&running.mailbox, msg::TerminateExecutor { cause: FailureCause::JobKilled })
                .await;
        } else {
            debug!(service = %self.name, job_id = m.job_id, "terminate for unknown standard job, ignoring");
        }
        self.post(
            &m.answer_mailbox,
            msg::TerminateStandardJobAnswer { job_id: m.job_id, result: Ok(()) },
        );
    }

    async fn handle_terminate_pilot(&mut self, m: msg::TerminatePilotJob) {
        if let Some(pos) = self
            .pending
            .iter()
            .position(|j| matches!(j, WorkflowJob::Pilot(p) if p.borrow().id == m.job_id))
        {
            let job = match self.pending.remove(pos) {
                Some(WorkflowJob::Pilot(job)) => job,
                _ => unreachable!(),
            };
            job.borrow_mut().state = PilotJobState::Terminated;
            self.notify_pilot_failed(&job, FailureCause::JobKilled);
        } else if let Some(running) = self.pilots.remove(&m.job_id) {
            self.stop_nested(&running, FailureCause::JobKilled).await;
            self.free_pilot(&running);
            {
                let mut job = running.job.borrow_mut();
                job.state = PilotJobState::Terminated;
                job.nested_service_mailbox = None;
            }
            self.notify_pilot_failed(&running.job, FailureCause::JobKilled);
        } else {
            debug!(service = %self.name, job_id = m.job_id, "terminate for unknown pilot job, ignoring");
        }
        self.post(
            &m.answer_mailbox,
            msg::TerminatePilotJobAnswer { job_id: m.job_id, result: Ok(()) },
        );
    }

    async fn stop_nested(&self, running: &RunningPilot, cause: FailureCause) {
        let reply = super::request_answer(&self.ctx, &running.nested.mailbox, |ack_mailbox| {
            msg::StopDaemon { ack_mailbox, cause }.into()
        })
        .await;
        if let Err(cause) = reply {
            warn!(service = %self.name, nested = %running.nested.name, %cause, "could not stop nested service");
        }
    }

    fn free_pilot(&mut self, running: &RunningPilot) {
        for host in &running.hosts {
            self.pool.free(host, running.cores_per_host, running.ram_per_host);
        }
    }

    fn handle_executor_done(&mut self, m: msg::ExecutorDone) {
        let job_id = m.job.borrow().id;
        if let Some(running) = self.executors.remove(&job_id) {
            for (host, cores, ram) in &running.allocation {
                self.pool.free(host, *cores, *ram);
            }
            m.job.borrow_mut().state = StandardJobState::Completed;
            let callback = m.job.borrow().callback_mailbox.clone();
            if let Some(callback) = callback {
                self.post(
                    &callback,
                    msg::StandardJobDone { job: m.job.clone(), service: self.name.clone() },
                );
            }
            info!(service = %self.name, job = %m.job.borrow().name, "standard job completed");
        }
    }

    fn handle_executor_failed(&mut self, m: msg::ExecutorFailed) {
        let job_id = m.job.borrow().id;
        if let Some(running) = self.executors.remove(&job_id) {
            for (host, cores, ram) in &running.allocation {
                self.pool.free(host, *cores, *ram);
            }
            {
                let mut job = m.job.borrow_mut();
                if job.state != StandardJobState::Terminated {
                    job.state = StandardJobState::Failed;
                }
            }
            self.notify_standard_failed(&m.job, m.cause.clone());
            info!(service = %self.name, job = %m.job.borrow().name, cause = %m.cause, "standard job failed");
        }
    }

    fn handle_lease_expired(&mut self, pilot_job_id: JobId) {
        if let Some(running) = self.pilots.remove(&pilot_job_id) {
            self.free_pilot(&running);
            {
                let mut job = running.job.borrow_mut();
                job.state = PilotJobState::Expired;
                job.nested_service_mailbox = None;
            }
            let callback = running.job.borrow().callback_mailbox.clone();
            if let Some(callback) = callback {
                self.post(
                    &callback,
                    msg::PilotJobExpired { job: running.job.clone(), service: self.name.clone() },
                );
            }
            info!(service = %self.name, pilot = pilot_job_id, "pilot job expired");
        }
    }

    fn answer_resource_info(&self, answer_mailbox: &str) {
        let slots = self.pool.slots();
        let info = ResourceInfo {
            service: self.name.clone(),
            per_host: slots.iter().map(|s| (s.host.clone(), s.cores, s.free_cores)).collect(),
            ram_per_host: slots.first().map(|s| s.ram).unwrap_or(0.0),
            core_flop_rate: slots
                .first()
                .and_then(|s| self.ctx.flop_rate_of(&s.host).ok())
                .unwrap_or(0.0),
            ttl_remaining: self.death_date.map(|d| (d - self.ctx.now()).non_negative()),
            supports_standard_jobs: self.cfg.supports_standard_jobs,
            supports_pilot_jobs: self.cfg.supports_pilot_jobs,
        };
        self.post(answer_mailbox, msg::ResourceInfoAnswer { info });
    }

    fn dispatch_pending(&mut self) {
        loop {
            let head = match self.pending.front() {
                Some(job) => job.clone(),
                None => break,
            };
            let started = match &head {
                WorkflowJob::Standard(job) => self.try_start_standard(job),
                WorkflowJob::Pilot(job) => self.try_start_pilot(job),
            };
            if started {
                self.pending.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_start_standard(&mut self, job: &StandardJobRef) -> bool {
        let cores = job.borrow().min_required_cores();
        let ram = job.borrow().min_required_ram();
        let picks = match self.pool.greedy_spread(cores, ram) {
            Some(p) => p,
            None => return false,
        };
        let allocation: Vec<(String, u64, f64)> = picks.into_iter().map(|(h, c)| (h, c, ram)).collect();
        for (host, cores, ram) in &allocation {
            self.pool.allocate(host, *cores, *ram);
        }
        self.next_executor += 1;
        let exec_name = format!("{}_executor_{}", self.name, self.next_executor);
        let exec_host = allocation[0].0.clone();
        let spec = ExecutorSpec {
            job: job.clone(),
            allocation: allocation.clone(),
            callback_mailbox: self.mailbox.clone(),
            core_allocation_policy: self.cfg.core_allocation_policy,
            thread_startup_overhead: self.cfg.thread_startup_overhead,
            task_startup_overhead: self.cfg.task_startup_overhead,
            simulate_computation_as_sleep: self.cfg.simulate_computation_as_sleep,
            default_location: self.default_storage.as_ref().map(|s| s.location()),
        };
        let (_, exec_mailbox) = executor::start(&self.ctx, &exec_name, &exec_host, spec);
        job.borrow_mut().state = StandardJobState::Running;
        self.executors.insert(
            job.borrow().id,
            RunningExecutor {
                job: job.clone(),
                mailbox: exec_mailbox,
                allocation,
            },
        );
        true
    }

    fn try_start_pilot(&mut self, job: &PilotJobRef) -> bool {
        let (num_hosts, cores, ram, duration, job_id) = {
            let j = job.borrow();
            (j.num_hosts, j.cores_per_host, j.ram_per_host, j.duration, j.id)
        };
        let hosts: Vec<String> = self
            .pool
            .slots()
            .iter()
            .filter(|s| s.free_cores >= cores && s.free_ram >= ram)
            .take(num_hosts as usize)
            .map(|s| s.host.clone())
            .collect();
        if (hosts.len() as u64) < num_hosts {
            return false;
        }
        for host in &hosts {
            self.pool.allocate(host, cores, ram);
        }
        let nested_name = format!("{}_pilot_{}", self.name, self.ctx.unique_id());
        let nested = start_nested(
            &self.ctx,
            BareMetalServiceSpec {
                name: nested_name,
                host: hosts[0].clone(),
                compute_hosts: hosts.iter().map(|h| (h.clone(), cores, ram)).collect(),
                config: ServiceConfig {
                    supports_standard_jobs: true,
                    supports_pilot_jobs: false,
                    ..self.cfg.clone()
                },
                default_storage: self.default_storage.clone(),
                ttl: Some(duration),
                containing_pilot_job: Some(job.clone()),
                parent_mailbox: Some(self.mailbox.clone()),
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
        self.pilots.insert(
            job_id,
            RunningPilot {
                job: job.clone(),
                nested,
                hosts,
                cores_per_host: cores,
                ram_per_host: ram,
            },
        );
        info!(service = %self.name, pilot = job_id, num_hosts, cores, "pilot job started");
        true
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

    async fn expire(&mut self) -> std::result::Result<(), FailureCause> {
        info!(service = %self.name, "TTL expired, terminating");
        self.fail_pending(FailureCause::JobKilled);
        self.drain_executors(FailureCause::JobKilled).await?;
        self.stop_all_pilots(FailureCause::JobKilled).await;
        if let (Some(pilot), Some(parent)) = (self.containing_pilot_job.as_ref(), self.parent_mailbox.as_ref()) {
            self.post(parent, msg::PilotLeaseExpired { pilot_job_id: pilot.borrow().id });
        }
        Ok(())
    }

    async fn shut_down(&mut self, cause: FailureCause) -> std::result::Result<(), FailureCause> {
        info!(service = %self.name, %cause, "bare-metal service stopping");
        self.fail_pending(cause.clone());
        self.drain_executors(cause.clone()).await?;
        self.stop_all_pilots(cause).await;
        Ok(())
    }

    async fn stop_all_pilots(&mut self, cause: FailureCause) {
        let ids: Vec<JobId> = self.pilots.keys().copied().collect();
        for id in ids {
            if let Some(running) = self.pilots.remove(&id) {
                self.stop_nested(&running, cause.clone()).await;
                self.free_pilot(&running);
                running.job.borrow_mut().state = PilotJobState::Failed;
                self.notify_pilot_failed(&running.job, cause.clone());
            }
        }
    }

    fn fail_pending(&mut self, cause: FailureCause) {
        let pending: Vec<WorkflowJob> = self.pending.drain(..).collect();
        for job in pending {
            match job {
                WorkflowJob::Standard(job) => {
                    job.borrow_mut().state = StandardJobState::Failed;
                    self.notify_standard_failed(&job, cause.clone());
                }
                WorkflowJob::Pilot(job) => {
                    job.borrow_mut().state = PilotJobState::Failed;
                    self.notify_pilot_failed(&job, cause.clone());
                }
            }
        }
    }

    async fn drain_executors(&mut self, cause: FailureCause) -> std::result::Result<(), FailureCause> {
        let mailboxes: Vec<String> = self.executors.values().map(|e| e.mailbox.clone()).collect();
        for mb in mailboxes {
            if let Err(err) = self.ctx.send(&mb, msg::TerminateExecutor { cause: cause.clone() }).await {
                debug!(service = %self.name, cause = %err, "executor already gone");
            }
        }
        while !self.executors.is_empty() {
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
                Message::ResourceInfoRequest(m) => self.answer_resource_info(&m.answer_mailbox),
                other => {
                    debug!(service = %self.name, kind = other.kind(), "ignored while draining executors");
                }
            }
        }
        Ok(())
    }
}
