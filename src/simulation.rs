//! Simulation lifecycle: build the platform, add services, launch, inspect.
//!
//! The `Simulation` is the single owner of the kernel and of every compute
//! service; actors hold handles (mailbox names), never the services
//! themselves.

use std::future::Future;
use std::rc::Rc;

use crate::config::{ServiceDef, SimConfig, WmsSchedulerKind, WorkflowFormat};
use crate::failure::FailureCause;
use crate::services::batch::{self, trace, BatchServiceSpec};
use crate::services::storage::{self, StorageServiceHandle};
use crate::services::{bare_metal, multicore, ComputeServiceHandle, ServiceConfig};
use crate::sim::{ActorId, EndCondition, Host, Kernel, NetworkConfig, SimHandle};
use crate::types::Time;
use crate::utils::prelude::*;
use crate::wms::{self, RandomScheduler, RoundRobinScheduler, TaskScheduler};
use crate::workflow::{parser, Workflow};

pub struct Simulation {
    kernel: Kernel,
    compute_services: Vec<ComputeServiceHandle>,
    storage_services: Vec<StorageServiceHandle>,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulation {
    pub fn new() -> Self {
        Self::with_network(NetworkConfig::default())
    }

    pub fn with_network(network: NetworkConfig) -> Self {
        Simulation {
            kernel: Kernel::new(network),
            compute_services: vec![],
            storage_services: vec![],
        }
    }

    pub fn add_host(&mut self, host: Host) {
        self.kernel.add_host(host);
    }

    pub fn hostname_list(&self) -> Vec<String> {
        self.kernel.hostnames()
    }

    fn require_host(&self, host: &str) -> Result<Host> {
        self.kernel
            .host_record(host)
            .ok_or_else(|| Error::invalid_config(format!("unknown host {}", host)))
    }

    pub fn add_multicore_service(
        &mut self,
        name: &str,
        host: &str,
        config: ServiceConfig,
        default_storage: Option<StorageServiceHandle>,
    ) -> Result<ComputeServiceHandle> {
        let record = self.require_host(host)?;
        let handle = multicore::start(
            &self.kernel,
            multicore::MulticoreServiceSpec {
                name: name.to_owned(),
                host: host.to_owned(),
                cores: record.cores,
                ram: record.ram,
                config,
                default_storage,
                ttl: None,
                containing_pilot_job: None,
                parent_mailbox: None,
            },
        );
        self.compute_services.push(handle.clone());
        Ok(handle)
    }

    pub fn add_bare_metal_service(
        &mut self,
        name: &str,
        hosts: &[String],
        config: ServiceConfig,
        default_storage: Option<StorageServiceHandle>,
    ) -> Result<ComputeServiceHandle> {
        if hosts.is_empty() {
            return Err(Error::invalid_config("bare-metal service needs at least one host"));
        }
        let mut compute_hosts = vec![];
        for host in hosts {
            let record = self.require_host(host)?;
            compute_hosts.push((host.clone(), record.cores, record.ram));
        }
        let handle = bare_metal::start(
            &self.kernel,
            bare_metal::BareMetalServiceSpec {
                name: name.to_owned(),
                host: hosts[0].clone(),
                compute_hosts,
                config,
                default_storage,
                ttl: None,
                containing_pilot_job: None,
                parent_mailbox: None,
            },
        );
        self.compute_services.push(handle.clone());
        Ok(handle)
    }

    /// Add a batch service over a uniform fleet. All hosts must declare the
    /// same core count; a workload trace configured in `config` is loaded
    /// here and replayed after launch.
    pub fn add_batch_service(
        &mut self,
        name: &str,
        hosts: &[String],
        config: ServiceConfig,
        default_storage: Option<StorageServiceHandle>,
    ) -> Result<ComputeServiceHandle> {
        if hosts.is_empty() {
            return Err(Error::invalid_config("batch service needs at least one host"));
        }
        let mut cores_per_host = None;
        let mut ram_per_host = 0.0;
        for host in hosts {
            let record = self.require_host(host)?;
            match cores_per_host {
                None => {
                    cores_per_host = Some(record.cores);
                    ram_per_host = record.ram;
                }
                Some(c) if c == record.cores => {}
                Some(c) => {
                    return Err(Error::invalid_config(format!(
                        "batch fleet is not uniform: {} has {} cores, expected {}",
                        host, record.cores, c
                    )));
                }
            }
        }
        let trace_entries = match &config.simulated_workload_trace_file {
            Some(path) => trace::load_trace(path)?,
            None => vec![],
        };
        let handle = batch::start(
            &self.kernel,
            BatchServiceSpec {
                name: name.to_owned(),
                host: hosts[0].clone(),
                compute_hosts: hosts.to_vec(),
                cores_per_host: cores_per_host.expect("at least one host"),
                ram_per_host,
                config,
                default_storage,
                trace: trace_entries,
            },
        );
        self.compute_services.push(handle.clone());
        Ok(handle)
    }

    pub fn add_storage_service(
        &mut self,
        name: &str,
        host: &str,
        mount_point: &str,
        capacity: f64,
        bandwidth: f64,
    ) -> Result<StorageServiceHandle> {
        self.require_host(host)?;
        let handle = storage::start(&self.kernel, name, host, mount_point, capacity, bandwidth);
        self.storage_services.push(handle.clone());
        Ok(handle)
    }

    /// Spawn an arbitrary actor (typically the workflow manager) with its
    /// own mailbox named `<name>_mailbox`.
    pub fn add_actor<F, Fut>(&mut self, name: &str, host: &str, f: F) -> Result<ActorId>
    where
        F: FnOnce(SimHandle, String) -> Fut,
        Fut: Future<Output = std::result::Result<(), FailureCause>> + 'static,
    {
        self.require_host(host)?;
        let mailbox = format!("{}_mailbox", name);
        let mb = mailbox.clone();
        Ok(self
            .kernel
            .spawn(name, host, false, Some(&mailbox), move |ctx| f(ctx, mb)))
    }

    pub fn compute_services(&self) -> &[ComputeServiceHandle] {
        &self.compute_services
    }

    pub fn storage_services(&self) -> &[StorageServiceHandle] {
        &self.storage_services
    }

    pub fn now(&self) -> Time {
        self.kernel.now()
    }

    /// Run until no simulation events remain.
    pub fn launch(&mut self) {
        self.kernel.run(EndCondition::NoEvents);
    }

    pub fn run_until(&mut self, until: EndCondition) {
        self.kernel.run(until);
    }

    /// Messages delivered so far, `(time, variant, mailbox)`.
    pub fn delivered_log(&self) -> Vec<(Time, &'static str, String)> {
        self.kernel.delivered_log()
    }

    /// Build a simulation (and optionally its workflow run) from a config.
    /// Returns the simulation and the workflow, if one was configured.
    pub fn from_config(cfg: &SimConfig) -> Result<(Simulation, Option<Rc<Workflow>>)> {
        let mut sim = Simulation::with_network(cfg.network.clone());
        for host in &cfg.platform {
            sim.add_host(host.clone());
        }
        for s in &cfg.storage {
            sim.add_storage_service(&s.name, &s.host, &s.mount_point, s.capacity, s.bandwidth)?;
        }

        let find_storage = |sim: &Simulation, name: &Option<String>| -> Result<Option<StorageServiceHandle>> {
            match name {
                None => Ok(None),
                Some(n) => sim
                    .storage_services
                    .iter()
                    .find(|s| &s.name == n)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| Error::invalid_config(format!("unknown storage service {}", n))),
            }
        };

        for service in &cfg.services {
            match service {
                ServiceDef::Multicore { name, host, config, default_storage } => {
                    let ds = find_storage(&sim, default_storage)?;
                    sim.add_multicore_service(name, host, config.clone(), ds)?;
                }
                ServiceDef::BareMetal { name, hosts, config, default_storage } => {
                    let ds = find_storage(&sim, default_storage)?;
                    sim.add_bare_metal_service(name, hosts, config.clone(), ds)?;
                }
                ServiceDef::Batch { name, hosts, config, default_storage } => {
                    let ds = find_storage(&sim, default_storage)?;
                    sim.add_batch_service(name, hosts, config.clone(), ds)?;
                }
            }
        }

        let workflow = match &cfg.workflow {
            None => None,
            Some(def) => {
                let workflow = Rc::new(match def.format {
                    WorkflowFormat::Dax => parser::from_dax_file(&def.path, def.reference_flop_rate)?,
                    WorkflowFormat::PegasusJson => {
                        parser::from_pegasus_json_file(&def.path, def.reference_flop_rate, false)?
                    }
                });
                let services = sim.compute_services.clone();
                let default_storage = sim.storage_services.first().cloned();
                let scheduler_kind = def.scheduler;
                let seed = cfg.seed.clone();
                let wf = workflow.clone();
                let wms_host = cfg
                    .platform
                    .first()
                    .map(|h| h.name.clone())
                    .ok_or_else(|| Error::invalid_config("empty platform"))?;
                sim.add_actor("wms", &wms_host, move |ctx, mailbox| async move {
                    let mut scheduler: Box<dyn TaskScheduler> = match scheduler_kind {
                        WmsSchedulerKind::Random => Box::new(RandomScheduler::new(&seed)),
                        WmsSchedulerKind::RoundRobin => Box::new(RoundRobinScheduler::default()),
                    };
                    wms::run_workflow(&ctx, &mailbox, &wf, scheduler.as_mut(), &services, default_storage).await?;
                    Ok(())
                })?;
                Some(workflow)
            }
        };

        Ok((sim, workflow))
    }
}
