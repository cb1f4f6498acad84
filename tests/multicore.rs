//! Multicore compute service scenarios: single task timing, core
//! saturation, in-flight termination, resource queries.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use approx::assert_relative_eq;

use batchsim::events::ExecutionEvent;
use batchsim::jobs::WorkflowJob;
use batchsim::managers::JobManager;
use batchsim::messages::Message;
use batchsim::services::ServiceConfig;
use batchsim::sim::Host;
use batchsim::workflow::Workflow;
use batchsim::{Duration, FailureCause, Simulation};

fn gigahost(name: &str, cores: u64) -> Host {
    Host {
        name: name.to_owned(),
        cores,
        flop_rate: 1e9,
        ram: 16e9,
    }
}

type EventLog = Rc<RefCell<Vec<(f64, ExecutionEvent)>>>;

async fn next_event(ctx: &batchsim::sim::SimHandle, mailbox: &str, log: &EventLog) -> ExecutionEvent {
    loop {
        if let Message::WorkflowEvent(m) = ctx.recv(mailbox).await.unwrap() {
            log.borrow_mut().push((ctx.now().0, m.event.clone()));
            return m.event;
        }
    }
}

#[test]
fn single_task_completes_after_one_second() {
    let mut sim = Simulation::new();
    sim.add_host(gigahost("h1", 4));
    let cs = sim
        .add_multicore_service("mc", "h1", ServiceConfig::default(), None)
        .unwrap();

    let mut workflow = Workflow::new();
    let task = workflow.add_task("t", 1e9, 1, 1, 1.0, 0.0).unwrap();

    let log: EventLog = Default::default();
    let l = log.clone();
    sim.add_actor("wms", "h1", move |ctx, mailbox| async move {
        let jm = JobManager::new(&ctx, &mailbox);
        let job = jm.create_standard_job(vec![task], HashMap::new(), vec![], vec![]);
        jm.submit_job(&ctx, &WorkflowJob::Standard(job), &cs, HashMap::new())
            .await?;
        next_event(&ctx, &mailbox, &l).await;
        Ok(())
    })
    .unwrap();
    sim.launch();

    let log = log.borrow();
    assert_eq!(log.len(), 1);
    assert_relative_eq!(log[0].0, 1.0);
    assert!(matches!(log[0].1, ExecutionEvent::StandardJobCompleted { .. }));
}

#[test]
fn five_single_core_jobs_saturate_four_cores() {
    let mut sim = Simulation::new();
    sim.add_host(gigahost("h1", 4));
    let cs = sim
        .add_multicore_service("mc", "h1", ServiceConfig::default(), None)
        .unwrap();

    let mut workflow = Workflow::new();
    let tasks: Vec<_> = (0..5)
        .map(|i| workflow.add_task(format!("t{}", i), 1e9, 1, 1, 1.0, 0.0).unwrap())
        .collect();

    let log: EventLog = Default::default();
    let l = log.clone();
    sim.add_actor("wms", "h1", move |ctx, mailbox| async move {
        let jm = JobManager::new(&ctx, &mailbox);
        for task in tasks {
            let job = jm.create_standard_job(vec![task], HashMap::new(), vec![], vec![]);
            jm.submit_job(&ctx, &WorkflowJob::Standard(job), &cs, HashMap::new())
                .await?;
        }
        for _ in 0..5 {
            next_event(&ctx, &mailbox, &l).await;
        }
        Ok(())
    })
    .unwrap();
    sim.launch();

    let mut times: Vec<f64> = log.borrow().iter().map(|(t, _)| *t).collect();
    times.sort_by(f64::total_cmp);
    assert_eq!(times.len(), 5);
    for t in &times[..4] {
        assert_relative_eq!(*t, 1.0);
    }
    assert_relative_eq!(times[4], 2.0);
    assert!(log
        .borrow()
        .iter()
        .all(|(_, e)| matches!(e, ExecutionEvent::StandardJobCompleted { .. })));
}

#[test]
fn terminate_in_flight_job_frees_cores_and_fails_with_job_killed() {
    let mut sim = Simulation::new();
    sim.add_host(gigahost("h1", 4));
    let cs = sim
        .add_multicore_service("mc", "h1", ServiceConfig::default(), None)
        .unwrap();

    let mut workflow = Workflow::new();
    let task = workflow.add_task("long", 100e9, 1, 1, 1.0, 0.0).unwrap();

    let log: EventLog = Default::default();
    let l = log.clone();
    let idle_after: Rc<RefCell<Option<u64>>> = Default::default();
    let idle = idle_after.clone();
    sim.add_actor("wms", "h1", move |ctx, mailbox| async move {
        let jm = JobManager::new(&ctx, &mailbox);
        let job = jm.create_standard_job(vec![task], HashMap::new(), vec![], vec![]);
        let wjob = WorkflowJob::Standard(job.clone());
        jm.submit_job(&ctx, &wjob, &cs, HashMap::new()).await?;
        ctx.sleep(Duration(5.0)).await;
        jm.terminate_job(&ctx, &wjob).await?;
        idle.borrow_mut().replace(cs.num_idle_cores(&ctx).await?);
        next_event(&ctx, &mailbox, &l).await;
        assert_eq!(job.borrow().state, batchsim::jobs::StandardJobState::Terminated);
        Ok(())
    })
    .unwrap();
    sim.launch();

    assert_eq!(*idle_after.borrow(), Some(4));
    let log = log.borrow();
    assert_eq!(log.len(), 1);
    assert_relative_eq!(log[0].0, 5.0);
    match &log[0].1 {
        ExecutionEvent::StandardJobFailed { cause, .. } => assert_eq!(*cause, FailureCause::JobKilled),
        other => panic!("unexpected event {}", other),
    }
}

#[test]
fn resource_queries_report_capacity() {
    let mut sim = Simulation::new();
    sim.add_host(gigahost("h1", 4));
    let cs = sim
        .add_multicore_service("mc", "h1", ServiceConfig::default(), None)
        .unwrap();

    let seen: Rc<RefCell<Option<(u64, u64, f64)>>> = Default::default();
    let s = seen.clone();
    sim.add_actor("wms", "h1", move |ctx, _mailbox| async move {
        let cores = cs.num_cores(&ctx).await?;
        let idle = cs.num_idle_cores(&ctx).await?;
        let rate = cs.core_flop_rate(&ctx).await?;
        assert_eq!(cs.ttl(&ctx).await?, None);
        s.borrow_mut().replace((cores, idle, rate));
        Ok(())
    })
    .unwrap();
    sim.launch();

    assert_eq!(*seen.borrow(), Some((4, 4, 1e9)));
}

#[test]
fn standard_jobs_rejected_when_unsupported() {
    let mut sim = Simulation::new();
    sim.add_host(gigahost("h1", 4));
    let cs = sim
        .add_multicore_service(
            "pilot_only",
            "h1",
            ServiceConfig {
                supports_standard_jobs: false,
                ..Default::default()
            },
            None,
        )
        .unwrap();

    let mut workflow = Workflow::new();
    let task = workflow.add_task("t", 1e9, 1, 1, 1.0, 0.0).unwrap();

    let outcome: Rc<RefCell<Option<FailureCause>>> = Default::default();
    let o = outcome.clone();
    sim.add_actor("wms", "h1", move |ctx, mailbox| async move {
        let jm = JobManager::new(&ctx, &mailbox);
        let job = jm.create_standard_job(vec![task], HashMap::new(), vec![], vec![]);
        let err = jm
            .submit_job(&ctx, &WorkflowJob::Standard(job.clone()), &cs, HashMap::new())
            .await
            .unwrap_err();
        // the job never left the submitter
        assert_eq!(job.borrow().state, batchsim::jobs::StandardJobState::NotSubmitted);
        o.borrow_mut().replace(err);
        Ok(())
    })
    .unwrap();
    sim.launch();

    assert!(matches!(
        outcome.borrow().clone(),
        Some(FailureCause::JobTypeNotSupported { .. })
    ));
}

#[test]
fn oversized_job_rejected_with_not_enough_resources() {
    let mut sim = Simulation::new();
    sim.add_host(gigahost("h1", 4));
    let cs = sim
        .add_multicore_service("mc", "h1", ServiceConfig::default(), None)
        .unwrap();

    let mut workflow = Workflow::new();
    let task = workflow.add_task("wide", 1e9, 8, 8, 1.0, 0.0).unwrap();

    let outcome: Rc<RefCell<Option<FailureCause>>> = Default::default();
    let o = outcome.clone();
    sim.add_actor("wms", "h1", move |ctx, mailbox| async move {
        let jm = JobManager::new(&ctx, &mailbox);
        let job = jm.create_standard_job(vec![task], HashMap::new(), vec![], vec![]);
        let err = jm
            .submit_job(&ctx, &WorkflowJob::Standard(job), &cs, HashMap::new())
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

#[test]
fn minimum_core_policy_runs_tasks_narrow() {
    // a 2..4-core task under the minimum policy gets exactly 2 cores:
    // 8e9 flops / (1e9 * 2 cores) = 4 seconds
    let mut sim = Simulation::new();
    sim.add_host(gigahost("h1", 4));
    let cs = sim
        .add_multicore_service(
            "mc",
            "h1",
            ServiceConfig {
                core_allocation_policy: batchsim::services::CoreAllocationPolicy::Minimum,
                ..Default::default()
            },
            None,
        )
        .unwrap();

    let mut workflow = Workflow::new();
    let task = workflow.add_task("t", 8e9, 2, 4, 1.0, 0.0).unwrap();

    let log: EventLog = Default::default();
    let l = log.clone();
    sim.add_actor("wms", "h1", move |ctx, mailbox| async move {
        let jm = JobManager::new(&ctx, &mailbox);
        let job = jm.create_standard_job(vec![task], HashMap::new(), vec![], vec![]);
        jm.submit_job(&ctx, &WorkflowJob::Standard(job), &cs, HashMap::new())
            .await?;
        next_event(&ctx, &mailbox, &l).await;
        Ok(())
    })
    .unwrap();
    sim.launch();

    assert_relative_eq!(log.borrow()[0].0, 4.0);
}
