use std::path::Path;

use anyhow::Context;

use batchsim::workflow::TaskState;
use batchsim::{EndCondition, Simulation, Time};

use batchsim::utils::prelude::*;

pub fn run(config_path: &Path, until: Option<f64>, print_events: bool) -> Result<()> {
    let cfg = batchsim::config::load(config_path)?;
    let (mut sim, workflow) = Simulation::from_config(&cfg)?;

    match until {
        Some(t) => sim.run_until(EndCondition::Time(Time(t))),
        None => sim.launch(),
    }

    println!("simulation ended at t={}", sim.now());
    if let Some(workflow) = workflow {
        let completed = workflow
            .tasks()
            .filter(|t| t.borrow().state == TaskState::Completed)
            .count();
        println!("workflow: {}/{} tasks completed", completed, workflow.num_tasks());
        for task in workflow.tasks() {
            let t = task.borrow();
            match (t.start_date, t.end_date) {
                (Some(start), Some(end)) => println!("  {}: {} .. {}", t.id, start, end),
                _ => println!("  {}: {}", t.id, t.state),
            }
        }
    }
    if print_events {
        for (time, kind, mailbox) in sim.delivered_log() {
            println!("@{} {} -> {}", time, kind, mailbox);
        }
    }
    Ok(())
}

pub fn dump_config(config_path: &Path) -> Result<()> {
    let cfg = batchsim::config::load(config_path)?;
    let rendered = serde_yaml::to_string(&cfg).context("rendering config")?;
    println!("{}", rendered);
    Ok(())
}
