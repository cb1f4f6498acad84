//! Batch service scenarios: strict FCFS ordering, EASY backfilling,
//! walltime enforcement, start-time estimation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use approx::assert_relative_eq;

use batchsim::events::ExecutionEvent;
use batchsim::jobs::WorkflowJob;
use batchsim::managers::JobManager;
use batchsim::messages::Message;
use batchsim::services::{BatchSchedulingAlgorithm, ServiceConfig};
use batchsim::sim::Host;
use batchsim::workflow::Workflow;
use batchsim::{Duration, FailureCause, Simulation, Time};

fn fleet(sim: &mut Simulation, hosts: u64, cores: u64) -> Vec<String> {
    let names: Vec<String> = (0..hosts).map(|i| format!("node{}", i)).collect();
    for name in &names {
        sim.add_host(Host {
            name: name.clone(),
            cores,
            flop_rate: 1e9,
            ram: 16e9,
        });
    }
    names
}

fn batch_config(algorithm: BatchSchedulingAlgorithm) -> ServiceConfig {
    ServiceConfig {
        batch_scheduling_algorithm: algorithm,
        ..Default::default()
    }
}

fn batch_args(nodes: u64, cores: u64, walltime: f64) -> HashMap<String, String> {
    let mut args = HashMap::new();
    args.insert("-N".to_owned(), nodes.to_string());
    args.insert("-c".to_owned(), cores.to_string());
    args.insert("-t".to_owned(), walltime.to_string());
    args
}

type EventLog = Rc<RefCell<Vec<(f64, String, ExecutionEvent)>>>;

async fn wait_events(
    ctx: &batchsim::sim::SimHandle,
    mailbox: &str,
    log: &EventLog,
    count: usize,
) {
    let mut seen = 0;
    while seen < count {
        if let Message::WorkflowEvent(m) = ctx.recv(mailbox).await.unwrap() {
            let job_name = match &m.event {
                ExecutionEvent::StandardJobCompleted { job } => job.borrow().name.clone(),
                ExecutionEvent::StandardJobFailed { job, .. } => job.borrow().name.clone(),
                ExecutionEvent::PilotJobStarted { job }
                | ExecutionEvent::PilotJobExpired { job } => job.borrow().name.clone(),
                ExecutionEvent::PilotJobFailed { job, .. } => job.borrow().name.clone(),
                _ => String::new(),
            };
            log.borrow_mut().push((ctx.now().0, job_name, m.event.clone()));
            seen += 1;
        }
    }
}

fn completion_time(log: &EventLog, job_name: &str) -> f64 {
    log.borrow()
        .iter()
        .find(|(_, name, e)| name == job_name && matches!(e, ExecutionEvent::StandardJobCompleted { .. }))
        .map(|(t, _, _)| *t)
        .unwrap_or_else(|| panic!("no completion for {}", job_name))
}

#[test]
fn fcfs_runs_jobs_in_arrival_order() {
    // 3 hosts x 2 cores; J1 takes the whole fleet for 10s, J2 follows
    let mut sim = Simulation::new();
    let hosts = fleet(&mut sim, 3, 2);
    let cs = sim
        .add_batch_service("cluster", &hosts, batch_config(BatchSchedulingAlgorithm::Fcfs), None)
        .unwrap();

    let mut workflow = Workflow::new();
    let t1 = workflow.add_task("t1", 10e9, 1, 1, 1.0, 0.0).unwrap();
    let t2 = workflow.add_task("t2", 5e9, 1, 1, 1.0, 0.0).unwrap();

    let log: EventLog = Default::default();
    let l = log.clone();
    let names: Rc<RefCell<Vec<String>>> = Default::default();
    let n = names.clone();
    sim.add_actor("wms", "node0", move |ctx, mailbox| async move {
        let jm = JobManager::new(&ctx, &mailbox);
        let j1 = jm.create_standard_job(vec![t1], HashMap::new(), vec![], vec![]);
        let j2 = jm.create_standard_job(vec![t2], HashMap::new(), vec![], vec![]);
        n.borrow_mut().push(j1.borrow().name.clone());
        n.borrow_mut().push(j2.borrow().name.clone());

        jm.submit_job(&ctx, &WorkflowJob::Standard(j1), &cs, batch_args(3, 2, 10.0))
            .await?;
        ctx.sleep(Duration(1.0)).await;
        jm.submit_job(&ctx, &WorkflowJob::Standard(j2), &cs, batch_args(1, 2, 5.0))
            .await?;
        wait_events(&ctx, &mailbox, &l, 2).await;
        Ok(())
    })
    .unwrap();
    sim.launch();

    let names = names.borrow();
    assert_relative_eq!(completion_time(&log, &names[0]), 10.0);
    // J2 waits for the full fleet to free up at t=10, runs 5s
    assert_relative_eq!(completion_time(&log, &names[1]), 15.0);
}

#[test]
fn fcfs_does_not_skip_a_blocked_head() {
    // J1 holds one core per host; J2 (head of queue) wants the whole fleet;
    // J3 would fit right now but strict FCFS makes it wait behind J2
    let mut sim = Simulation::new();
    let hosts = fleet(&mut sim, 3, 2);
    let cs = sim
        .add_batch_service("cluster", &hosts, batch_config(BatchSchedulingAlgorithm::Fcfs), None)
        .unwrap();

    let mut workflow = Workflow::new();
    let t1 = workflow.add_task("t1", 100e9, 1, 1, 1.0, 0.0).unwrap();
    let t2 = workflow.add_task("t2", 50e9, 1, 1, 1.0, 0.0).unwrap();
    let t3 = workflow.add_task("t3", 5e9, 1, 1, 1.0, 0.0).unwrap();

    let log: EventLog = Default::default();
    let l = log.clone();
    let names: Rc<RefCell<Vec<String>>> = Default::default();
    let n = names.clone();
    sim.add_actor("wms", "node0", move |ctx, mailbox| async move {
        let jm = JobManager::new(&ctx, &mailbox);
        let j1 = jm.create_standard_job(vec![t1], HashMap::new(), vec![], vec![]);
        let j2 = jm.create_standard_job(vec![t2], HashMap::new(), vec![], vec![]);
        let j3 = jm.create_standard_job(vec![t3], HashMap::new(), vec![], vec![]);
        for j in [&j1, &j2, &j3] {
            n.borrow_mut().push(j.borrow().name.clone());
        }

        jm.submit_job(&ctx, &WorkflowJob::Standard(j1), &cs, batch_args(3, 1, 100.0))
            .await?;
        ctx.sleep(Duration(1.0)).await;
        jm.submit_job(&ctx, &WorkflowJob::Standard(j2), &cs, batch_args(3, 2, 100.0))
            .await?;
        ctx.sleep(Duration(1.0)).await;
        jm.submit_job(&ctx, &WorkflowJob::Standard(j3), &cs, batch_args(1, 1, 10.0))
            .await?;
        wait_events(&ctx, &mailbox, &l, 3).await;
        Ok(())
    })
    .unwrap();
    sim.launch();

    let names = names.borrow();
    // J1 runs 0..100; J2 needs all cores so starts at 100, runs 50s
    assert_relative_eq!(completion_time(&log, &names[0]), 100.0);
    assert_relative_eq!(completion_time(&log, &names[1]), 150.0);
    // under FCFS J3 is stuck behind J2 even though a core is free at t=2
    assert_relative_eq!(completion_time(&log, &names[2]), 155.0);
}

#[test]
fn fifo_order_is_kept_even_when_flops_differ() {
    // 1 host x 1 core; while a blocker runs, a small job arrives before a
    // large one. Arrival order must win: the task-selection algorithm only
    // reorders trace-replayed jobs, never ordinary submissions.
    let mut sim = Simulation::new();
    let hosts = fleet(&mut sim, 1, 1);
    let cs = sim
        .add_batch_service("cluster", &hosts, batch_config(BatchSchedulingAlgorithm::Fcfs), None)
        .unwrap();

    let mut workflow = Workflow::new();
    let blocker = workflow.add_task("blocker", 2e9, 1, 1, 1.0, 0.0).unwrap();
    let small = workflow.add_task("small", 5e9, 1, 1, 1.0, 0.0).unwrap();
    let big = workflow.add_task("big", 10e9, 1, 1, 1.0, 0.0).unwrap();

    let log: EventLog = Default::default();
    let l = log.clone();
    let names: Rc<RefCell<Vec<String>>> = Default::default();
    let n = names.clone();
    sim.add_actor("wms", "node0", move |ctx, mailbox| async move {
        let jm = JobManager::new(&ctx, &mailbox);
        let j0 = jm.create_standard_job(vec![blocker], HashMap::new(), vec![], vec![]);
        let j1 = jm.create_standard_job(vec![small], HashMap::new(), vec![], vec![]);
        let j2 = jm.create_standard_job(vec![big], HashMap::new(), vec![], vec![]);
        for j in [&j0, &j1, &j2] {
            n.borrow_mut().push(j.borrow().name.clone());
        }

        jm.submit_job(&ctx, &WorkflowJob::Standard(j0), &cs, batch_args(1, 1, 100.0))
            .await?;
        jm.submit_job(&ctx, &WorkflowJob::Standard(j1), &cs, batch_args(1, 1, 100.0))
            .await?;
        jm.submit_job(&ctx, &WorkflowJob::Standard(j2), &cs, batch_args(1, 1, 100.0))
            .await?;
        wait_events(&ctx, &mailbox, &l, 3).await;
        Ok(())
    })
    .unwrap();
    sim.launch();

    let names = names.borrow();
    assert_relative_eq!(completion_time(&log, &names[0]), 2.0);
    // the small job was submitted first and runs first, despite having
    // fewer flops than the job behind it
    assert_relative_eq!(completion_time(&log, &names[1]), 7.0);
    assert_relative_eq!(completion_time(&log, &names[2]), 17.0);
}

#[test]
fn easy_backfills_a_small_job_before_the_head_reservation() {
    // same shape as the FCFS test, but EASY lets J3 start at t=2
    let mut sim = Simulation::new();
    let hosts = fleet(&mut sim, 3, 2);
    let cs = sim
        .add_batch_service(
            "cluster",
            &hosts,
            batch_config(BatchSchedulingAlgorithm::EasyBf),
            None,
        )
        .unwrap();

    let mut workflow = Workflow::new();
    let t1 = workflow.add_task("t1", 100e9, 1, 1, 1.0, 0.0).unwrap();
    let t2 = workflow.add_task("t2", 50e9, 1, 1, 1.0, 0.0).unwrap();
    let t3 = workflow.add_task("t3", 5e9, 1, 1, 1.0, 0.0).unwrap();

    let log: EventLog = Default::default();
    let l = log.clone();
    let names: Rc<RefCell<Vec<String>>> = Default::default();
    let n = names.clone();
    sim.add_actor("wms", "node0", move |ctx, mailbox| async move {
        let jm = JobManager::new(&ctx, &mailbox);
        let j1 = jm.create_standard_job(vec![t1], HashMap::new(), vec![], vec![]);
        let j2 = jm.create_standard_job(vec![t2], HashMap::new(), vec![], vec![]);
        let j3 = jm.create_standard_job(vec![t3], HashMap::new(), vec![], vec![]);
        for j in [&j1, &j2, &j3] {
            n.borrow_mut().push(j.borrow().name.clone());
        }

        jm.submit_job(&ctx, &WorkflowJob::Standard(j1), &cs, batch_args(3, 1, 100.0))
            .await?;
        ctx.sleep(Duration(1.0)).await;
        jm.submit_job(&ctx, &WorkflowJob::Standard(j2), &cs, batch_args(3, 2, 100.0))
            .await?;
        ctx.sleep(Duration(1.0)).await;
        jm.submit_job(&ctx, &WorkflowJob::Standard(j3), &cs, batch_args(1, 1, 10.0))
            .await?;
        wait_events(&ctx, &mailbox, &l, 3).await;
        Ok(())
    })
    .unwrap();
    sim.launch();

    let names = names.borrow();
    // J3 backfills at t=2 on a spare core and finishes at 7,
    // long before J2's reserved start at t=100
    assert_relative_eq!(completion_time(&log, &names[2]), 7.0);
    assert_relative_eq!(completion_time(&log, &names[0]), 100.0);
    assert_relative_eq!(completion_time(&log, &names[1]), 150.0);
}

#[test]
fn walltime_is_enforced() {
    let mut sim = Simulation::new();
    let hosts = fleet(&mut sim, 1, 2);
    let cs = sim
        .add_batch_service("cluster", &hosts, batch_config(BatchSchedulingAlgorithm::Fcfs), None)
        .unwrap();

    let mut workflow = Workflow::new();
    // 20 seconds of work against a 10 second walltime
    let t = workflow.add_task("t", 20e9, 1, 1, 1.0, 0.0).unwrap();

    let log: EventLog = Default::default();
    let l = log.clone();
    sim.add_actor("wms", "node0", move |ctx, mailbox| async move {
        let jm = JobManager::new(&ctx, &mailbox);
        let job = jm.create_standard_job(vec![t], HashMap::new(), vec![], vec![]);
        jm.submit_job(&ctx, &WorkflowJob::Standard(job), &cs, batch_args(1, 1, 10.0))
            .await?;
        wait_events(&ctx, &mailbox, &l, 1).await;
        Ok(())
    })
    .unwrap();
    sim.launch();

    let log2 = log.borrow();
    assert_eq!(log2.len(), 1);
    assert_relative_eq!(log2[0].0, 10.0);
    match &log2[0].2 {
        ExecutionEvent::StandardJobFailed { cause, .. } => {
            assert_eq!(*cause, FailureCause::JobTimeout);
        }
        other => panic!("unexpected event {}", other),
    }
}

#[test]
fn conservative_estimates_account_for_queue_and_running_jobs() {
    let mut sim = Simulation::new();
    let hosts = fleet(&mut sim, 3, 2);
    let cs = sim
        .add_batch_service(
            "cluster",
            &hosts,
            batch_config(BatchSchedulingAlgorithm::ConservativeBf),
            None,
        )
        .unwrap();

    let mut workflow = Workflow::new();
    let t1 = workflow.add_task("t1", 100e9, 1, 1, 1.0, 0.0).unwrap();
    let t2 = workflow.add_task("t2", 50e9, 1, 1, 1.0, 0.0).unwrap();

    let estimate: Rc<RefCell<Option<Time>>> = Default::default();
    let e = estimate.clone();
    let log: EventLog = Default::default();
    let l = log.clone();
    sim.add_actor("wms", "node0", move |ctx, mailbox| async move {
        let jm = JobManager::new(&ctx, &mailbox);
        let j1 = jm.create_standard_job(vec![t1], HashMap::new(), vec![], vec![]);
        let j2 = jm.create_standard_job(vec![t2], HashMap::new(), vec![], vec![]);
        // J1 occupies the whole fleet until t=100; J2 is reserved 100..150
        jm.submit_job(&ctx, &WorkflowJob::Standard(j1), &cs, batch_args(3, 2, 100.0))
            .await?;
        jm.submit_job(&ctx, &WorkflowJob::Standard(j2), &cs, batch_args(3, 2, 50.0))
            .await?;

        let estimates = cs
            .start_time_estimates(&ctx, vec![("probe".to_owned(), 3, 2, 20.0)])
            .await?;
        e.borrow_mut().replace(estimates["probe"]);
        wait_events(&ctx, &mailbox, &l, 2).await;
        Ok(())
    })
    .unwrap();
    sim.launch();

    assert_eq!(*estimate.borrow(), Some(Time(150.0)));
}

#[test]
fn workload_trace_is_replayed_as_synthetic_jobs() {
    let mut sim = Simulation::new();
    let hosts = fleet(&mut sim, 1, 2);
    let mut config = batch_config(BatchSchedulingAlgorithm::Fcfs);
    config.simulated_workload_trace_file = Some("resources/example_trace.txt".into());
    sim.add_batch_service("cluster", &hosts, config, None).unwrap();
    sim.launch();

    // both trace jobs (5s at t=0, 3s at t=1) complete on the two cores
    let completions: Vec<f64> = sim
        .delivered_log()
        .iter()
        .filter(|(_, kind, _)| *kind == "StandardJobDone")
        .map(|(t, _, _)| t.0)
        .collect();
    assert_eq!(completions.len(), 2);
    assert!(completions.contains(&5.0));
    assert!(completions.contains(&4.0));
}

#[test]
fn malformed_batch_arguments_are_rejected() {
    let mut sim = Simulation::new();
    let hosts = fleet(&mut sim, 1, 2);
    let cs = sim
        .add_batch_service("cluster", &hosts, batch_config(BatchSchedulingAlgorithm::Fcfs), None)
        .unwrap();

    let mut workflow = Workflow::new();
    let t = workflow.add_task("t", 1e9, 1, 1, 1.0, 0.0).unwrap();

    let outcome: Rc<RefCell<Option<FailureCause>>> = Default::default();
    let o = outcome.clone();
    sim.add_actor("wms", "node0", move |ctx, mailbox| async move {
        let jm = JobManager::new(&ctx, &mailbox);
        let job = jm.create_standard_job(vec![t], HashMap::new(), vec![], vec![]);
        // no -t argument
        let mut args = HashMap::new();
        args.insert("-N".to_owned(), "1".to_owned());
        args.insert("-c".to_owned(), "1".to_owned());
        let err = jm
            .submit_job(&ctx, &WorkflowJob::Standard(job), &cs, args)
            .await
            .unwrap_err();
        o.borrow_mut().replace(err);
        Ok(())
    })
    .unwrap();
    sim.launch();

    assert!(matches!(
        outcome.borrow().clone(),
        Some(FailureCause::NotEnoughResources { .. })
    ));
}
