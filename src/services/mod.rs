use std::collections::HashMap;
use std::path::PathBuf;

use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};

use crate::failure::FailureCause;
use crate::jobs::{JobId, PilotJobRef, StandardJobRef};
use crate::messages::{msg, Message, PayloadTable, ResourceInfo};
use crate::sim::SimHandle;
use crate::types::Duration;
use crate::utils::prelude::*;

pub mod alarm;
pub mod bare_metal;
pub mod batch;
pub mod executor;
pub mod multicore;
pub mod storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromStr, Serialize, Deserialize)]
pub enum CoreAllocationPolicy {
    #[display("aggressive")]
    #[serde(rename = "aggressive")]
    Aggressive,
    #[display("minimum")]
    #[serde(rename = "minimum")]
    Minimum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromStr, Serialize, Deserialize)]
pub enum BatchSchedulingAlgorithm {
    #[display("FCFS")]
    #[serde(rename = "FCFS")]
    Fcfs,
    #[display("CONSERVATIVE_BF")]
    #[serde(rename = "CONSERVATIVE_BF")]
    ConservativeBf,
    #[display("EASY_BF")]
    #[serde(rename = "EASY_BF")]
    EasyBf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromStr, Serialize, Deserialize)]
pub enum HostSelectionAlgorithm {
    #[display("FIRSTFIT")]
    #[serde(rename = "FIRSTFIT")]
    FirstFit,
    #[display("BESTFIT")]
    #[serde(rename = "BESTFIT")]
    BestFit,
    #[display("ROUNDROBIN")]
    #[serde(rename = "ROUNDROBIN")]
    RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromStr, Serialize, Deserialize)]
pub enum TaskSelectionAlgorithm {
    #[display("maximum_flops")]
    #[serde(rename = "maximum_flops")]
    MaximumFlops,
    #[display("minimum_flops")]
    #[serde(rename = "minimum_flops")]
    MinimumFlops,
    #[display("submission_time")]
    #[serde(rename = "submission_time")]
    SubmissionTime,
}

/// Typed view of the recognized service property keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub supports_standard_jobs: bool,
    pub supports_pilot_jobs: bool,
    pub core_allocation_policy: CoreAllocationPolicy,
    pub thread_startup_overhead: f64,
    pub task_startup_overhead: f64,
    pub batch_scheduling_algorithm: BatchSchedulingAlgorithm,
    pub host_selection_algorithm: HostSelectionAlgorithm,
    pub task_selection_algorithm: TaskSelectionAlgorithm,
    pub simulated_workload_trace_file: Option<PathBuf>,
    pub simulate_computation_as_sleep: bool,
    #[serde(skip)]
    pub payloads: PayloadTable,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            supports_standard_jobs: true,
            supports_pilot_jobs: true,
            core_allocation_policy: CoreAllocationPolicy::Aggressive,
            thread_startup_overhead: 0.0,
            task_startup_overhead: 0.0,
            batch_scheduling_algorithm: BatchSchedulingAlgorithm::Fcfs,
            host_selection_algorithm: HostSelectionAlgorithm::FirstFit,
            task_selection_algorithm: TaskSelectionAlgorithm::MaximumFlops,
            simulated_workload_trace_file: None,
            simulate_computation_as_sleep: false,
            payloads: PayloadTable::default(),
        }
    }
}

impl ServiceConfig {
    /// Parse a string-keyed property list, as services are configured in the
    /// original property-map style. Unknown keys are rejected.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let mut cfg = ServiceConfig::default();
        for (key, value) in properties {
            match key.as_str() {
                "supports_standard_jobs" => cfg.supports_standard_jobs = parse_bool(key, value)?,
                "supports_pilot_jobs" => cfg.supports_pilot_jobs = parse_bool(key, value)?,
                "core_allocation_policy" => {
                    cfg.core_allocation_policy = value
                        .parse()
                        .map_err(|_| Error::invalid_config(format!("bad {}: {}", key, value)))?
                }
                "thread_startup_overhead" => cfg.thread_startup_overhead = parse_seconds(key, value)?,
                "task_startup_overhead" => cfg.task_startup_overhead = parse_seconds(key, value)?,
                "batch_scheduling_algorithm" => {
                    cfg.batch_scheduling_algorithm = value
                        .parse()
                        .map_err(|_| Error::invalid_config(format!("bad {}: {}", key, value)))?
                }
                "host_selection_algorithm" => {
                    cfg.host_selection_algorithm = value
                        .parse()
                        .map_err(|_| Error::invalid_config(format!("bad {}: {}", key, value)))?
                }
                "task_selection_algorithm" => {
                    cfg.task_selection_algorithm = value
                        .parse()
                        .map_err(|_| Error::invalid_config(format!("bad {}: {}", key, value)))?
                }
                "simulated_workload_trace_file" => {
                    cfg.simulated_workload_trace_file = if value.is_empty() {
                        None
                    } else {
                        Some(PathBuf::from(value))
                    }
                }
                "simulate_computation_as_sleep" => {
                    cfg.simulate_computation_as_sleep = parse_bool(key, value)?
                }
                _ => return Err(Error::invalid_config(format!("unknown service property {}", key))),
            }
        }
        Ok(cfg)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    value
        .parse()
        .map_err(|_| Error::invalid_config(format!("bad {}: {}", key, value)))
}

fn parse_seconds(key: &str, value: &str) -> Result<f64> {
    let v: f64 = value
        .parse()
        .map_err(|_| Error::invalid_config(format!("bad {}: {}", key, value)))?;
    if v < 0.0 {
        return Err(Error::invalid_config(format!("{} must be >= 0", key)));
    }
    Ok(v)
}

/// Integer-exact per-host core and ram accounting.
///
/// The owning service actor is the sole authority over this pool; a free that
/// would exceed declared capacity is a logic bug and panics.
#[derive(Debug, Clone)]
pub struct CorePool {
    slots: Vec<HostSlot>,
}

#[derive(Debug, Clone)]
pub struct HostSlot {
    pub host: String,
    pub cores: u64,
    pub free_cores: u64,
    pub ram: f64,
    pub free_ram: f64,
}

impl CorePool {
    pub fn new(hosts: impl IntoIterator<Item = (String, u64, f64)>) -> Self {
        CorePool {
            slots: hosts
                .into_iter()
                .map(|(host, cores, ram)| HostSlot {
                    host,
                    cores,
                    free_cores: cores,
                    ram,
                    free_ram: ram,
                })
                .collect(),
        }
    }

    fn slot_mut(&mut self, host: &str) -> &mut HostSlot {
        self.slots
            .iter_mut()
            .find(|s| s.host == host)
            .unwrap_or_else(|| panic!("unknown host {} in core pool", host))
    }

    pub fn allocate(&mut self, host: &str, cores: u64, ram: f64) {
        let slot = self.slot_mut(host);
        assert!(
            slot.free_cores >= cores && slot.free_ram >= ram,
            "over-allocation on {}: {} cores / {} ram requested, {} / {} free",
            host,
            cores,
            ram,
            slot.free_cores,
            slot.free_ram
        );
        slot.free_cores -= cores;
        slot.free_ram -= ram;
    }

    pub fn free(&mut self, host: &str, cores: u64, ram: f64) {
        let slot = self.slot_mut(host);
        assert!(
            slot.free_cores + cores <= slot.cores,
            "double free on {}: freeing {} cores with {}/{} already free",
            host,
            cores,
            slot.free_cores,
            slot.cores
        );
        assert!(
            slot.free_ram + ram <= slot.ram + f64::EPSILON * slot.ram.abs().max(1.0),
            "double free of ram on {}",
            host
        );
        slot.free_cores += cores;
        slot.free_ram += ram;
    }

    pub fn idle_cores(&self) -> u64 {
        self.slots.iter().map(|s| s.free_cores).sum()
    }

    pub fn total_cores(&self) -> u64 {
        self.slots.iter().map(|s| s.cores).sum()
    }

    pub fn slots(&self) -> &[HostSlot] {
        &self.slots
    }

    pub fn host_free(&self, host: &str) -> Option<(u64, f64)> {
        self.slots
            .iter()
            .find(|s| s.host == host)
            .map(|s| (s.free_cores, s.free_ram))
    }

    /// First host (in declared order) with at least `cores` free and `ram` free.
    pub fn first_fit(&self, cores: u64, ram: f64) -> Option<String> {
        self.slots
            .iter()
            .find(|s| s.free_cores >= cores && s.free_ram >= ram)
            .map(|s| s.host.clone())
    }

    /// Greedy spread in declared host order until `cores` are gathered.
    /// Hosts that contribute cores also reserve `ram` each.
    pub fn greedy_spread(&self, cores: u64, ram: f64) -> Option<Vec<(String, u64)>> {
        let mut remaining = cores;
        let mut picks = vec![];
        for slot in &self.slots {
            if remaining == 0 {
                break;
            }
            if slot.free_cores == 0 || slot.free_ram < ram {
                continue;
            }
            let take = slot.free_cores.min(remaining);
            picks.push((slot.host.clone(), take));
            remaining -= take;
        }
        if remaining == 0 {
            Some(picks)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ComputeServiceKind {
    Multicore,
    BareMetal,
    Batch,
    PilotNested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Standard,
    Pilot,
}

/// Client-side handle to a compute service: the capability set
/// {submit, terminate, query resources, supports-job-type} over messages.
#[derive(Debug, Clone)]
pub struct ComputeServiceHandle {
    pub kind: ComputeServiceKind,
    pub name: String,
    pub mailbox: String,
    pub host: String,
    pub supports_standard_jobs: bool,
    pub supports_pilot_jobs: bool,
}

impl ComputeServiceHandle {
    pub fn supports(&self, kind: JobKind) -> bool {
        match kind {
            JobKind::Standard => self.supports_standard_jobs,
            JobKind::Pilot => self.supports_pilot_jobs,
        }
    }

    pub async fn submit_standard_job(
        &self,
        ctx: &SimHandle,
        job: &StandardJobRef,
        args: HashMap<String, String>,
        callback_mailbox: &str,
    ) -> std::result::Result<(), FailureCause> {
        let reply = request_answer(ctx, &self.mailbox, |answer_mailbox| {
            msg::SubmitStandardJob {
                job: job.clone(),
                args,
                callback_mailbox: callback_mailbox.to_owned(),
                answer_mailbox,
            }
            .into()
        })
        .await?;
        match reply {
            Message::SubmitStandardJobAnswer(a) => a.result,
            other => Err(unexpected_reply("SubmitStandardJobAnswer", &other)),
        }
    }

    pub async fn submit_pilot_job(
        &self,
        ctx: &SimHandle,
        job: &PilotJobRef,
        args: HashMap<String, String>,
        callback_mailbox: &str,
    ) -> std::result::Result<(), FailureCause> {
        let reply = request_answer(ctx, &self.mailbox, |answer_mailbox| {
            msg::SubmitPilotJob {
                job: job.clone(),
                args,
                callback_mailbox: callback_mailbox.to_owned(),
                answer_mailbox,
            }
            .into()
        })
        .await?;
        match reply {
            Message::SubmitPilotJobAnswer(a) => a.result,
            other => Err(unexpected_reply("SubmitPilotJobAnswer", &other)),
        }
    }

    pub async fn terminate_standard_job(&self, ctx: &SimHandle, job_id: JobId) -> std::result::Result<(), FailureCause> {
        let reply = request_answer(ctx, &self.mailbox, |answer_mailbox| {
            msg::TerminateStandardJob { job_id, answer_mailbox }.into()
        })
        .await?;
        match reply {
            Message::TerminateStandardJobAnswer(a) => a.result,
            other => Err(unexpected_reply("TerminateStandardJobAnswer", &other)),
        }
    }

    pub async fn terminate_pilot_job(&self, ctx: &SimHandle, job_id: JobId) -> std::result::Result<(), FailureCause> {
        let reply = request_answer(ctx, &self.mailbox, |answer_mailbox| {
            msg::TerminatePilotJob { job_id, answer_mailbox }.into()
        })
        .await?;
        match reply {
            Message::TerminatePilotJobAnswer(a) => a.result,
            other => Err(unexpected_reply("TerminatePilotJobAnswer", &other)),
        }
    }

    pub async fn resource_info(&self, ctx: &SimHandle) -> std::result::Result<ResourceInfo, FailureCause> {
        let reply = request_answer(ctx, &self.mailbox, |answer_mailbox| {
            msg::ResourceInfoRequest { answer_mailbox }.into()
        })
        .await?;
        match reply {
            Message::ResourceInfoAnswer(a) => Ok(a.info),
            other => Err(unexpected_reply("ResourceInfoAnswer", &other)),
        }
    }

    pub async fn num_cores(&self, ctx: &SimHandle) -> std::result::Result<u64, FailureCause> {
        Ok(self.resource_info(ctx).await?.num_cores())
    }

    pub async fn num_idle_cores(&self, ctx: &SimHandle) -> std::result::Result<u64, FailureCause> {
        Ok(self.resource_info(ctx).await?.num_idle_cores())
    }

    pub async fn ttl(&self, ctx: &SimHandle) -> std::result::Result<Option<Duration>, FailureCause> {
        Ok(self.resource_info(ctx).await?.ttl_remaining)
    }

    pub async fn core_flop_rate(&self, ctx: &SimHandle) -> std::result::Result<f64, FailureCause> {
        Ok(self.resource_info(ctx).await?.core_flop_rate)
    }

    /// Predicted start times for tentative batch requests
    /// (id, num_nodes, cores_per_node, walltime_seconds). Batch services only.
    pub async fn start_time_estimates(
        &self,
        ctx: &SimHandle,
        requests: Vec<(String, u64, u64, f64)>,
    ) -> std::result::Result<HashMap<String, crate::types::Time>, FailureCause> {
        let reply = request_answer(ctx, &self.mailbox, |answer_mailbox| {
            msg::BatchEstimateRequest { requests, answer_mailbox }.into()
        })
        .await?;
        match reply {
            Message::BatchEstimateAnswer(a) => Ok(a.estimates),
            other => Err(unexpected_reply("BatchEstimateAnswer", &other)),
        }
    }

    /// Stop the service daemon; pending and running jobs fail with `cause`.
    pub async fn stop(&self, ctx: &SimHandle, cause: FailureCause) -> std::result::Result<(), FailureCause> {
        let reply = request_answer(ctx, &self.mailbox, |ack_mailbox| {
            msg::StopDaemon { ack_mailbox, cause }.into()
        })
        .await?;
        match reply {
            Message::DaemonStopped(_) => Ok(()),
            other => Err(unexpected_reply("DaemonStopped", &other)),
        }
    }
}

/// One synchronous request/answer exchange over a private answer mailbox.
pub(crate) async fn request_answer(
    ctx: &SimHandle,
    target: &str,
    build: impl FnOnce(String) -> Message,
) -> std::result::Result<Message, FailureCause> {
    let answer = ctx.temp_mailbox("answer");
    ctx.send(target, build(answer.name().to_owned())).await?;
    let reply = ctx.recv(answer.name()).await?;
    Ok(reply)
}

pub(crate) fn unexpected_reply(expected: &str, got: &Message) -> FailureCause {
    FailureCause::FatalFailure {
        message: format!("expected {} reply, got {}", expected, got.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_parsing() {
        let mut props = HashMap::new();
        props.insert("core_allocation_policy".to_owned(), "minimum".to_owned());
        props.insert("batch_scheduling_algorithm".to_owned(), "EASY_BF".to_owned());
        props.insert("supports_pilot_jobs".to_owned(), "false".to_owned());
        props.insert("thread_startup_overhead".to_owned(), "0.25".to_owned());
        let cfg = ServiceConfig::from_properties(&props).unwrap();
        assert_eq!(cfg.core_allocation_policy, CoreAllocationPolicy::Minimum);
        assert_eq!(cfg.batch_scheduling_algorithm, BatchSchedulingAlgorithm::EasyBf);
        assert!(!cfg.supports_pilot_jobs);
        assert_eq!(cfg.thread_startup_overhead, 0.25);
    }

    #[test]
    fn property_parsing_rejects_unknown_key() {
        let mut props = HashMap::new();
        props.insert("no_such_property".to_owned(), "1".to_owned());
        assert!(ServiceConfig::from_properties(&props).is_err());
    }

    #[test]
    fn property_parsing_rejects_negative_overhead() {
        let mut props = HashMap::new();
        props.insert("task_startup_overhead".to_owned(), "-1".to_owned());
        assert!(ServiceConfig::from_properties(&props).is_err());
    }

    #[test]
    fn pool_allocation_roundtrip() {
        let mut pool = CorePool::new(vec![("a".to_owned(), 4, 100.0), ("b".to_owned(), 2, 100.0)]);
        assert_eq!(pool.idle_cores(), 6);
        pool.allocate("a", 3, 50.0);
        assert_eq!(pool.idle_cores(), 3);
        assert_eq!(pool.host_free("a"), Some((1, 50.0)));
        pool.free("a", 3, 50.0);
        assert_eq!(pool.idle_cores(), 6);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn pool_detects_double_free() {
        let mut pool = CorePool::new(vec![("a".to_owned(), 4, 0.0)]);
        pool.allocate("a", 2, 0.0);
        pool.free("a", 2, 0.0);
        pool.free("a", 2, 0.0);
    }

    #[test]
    #[should_panic(expected = "over-allocation")]
    fn pool_detects_over_allocation() {
        let mut pool = CorePool::new(vec![("a".to_owned(), 4, 0.0)]);
        pool.allocate("a", 5, 0.0);
    }

    #[test]
    fn greedy_spread_across_hosts() {
        let pool = CorePool::new(vec![
            ("a".to_owned(), 2, 100.0),
            ("b".to_owned(), 2, 100.0),
            ("c".to_owned(), 2, 100.0),
        ]);
        let picks = pool.greedy_spread(5, 0.0).unwrap();
        assert_eq!(
            picks,
            vec![("a".to_owned(), 2), ("b".to_owned(), 2), ("c".to_owned(), 1)]
        );
        assert!(pool.greedy_spread(7, 0.0).is_none());
    }
}
