//! Batch scheduling policies: strict FCFS, conservative backfilling, and
//! EASY backfilling, over an availability timeline of a uniform fleet.
//!
//! The scheduler is a pure planner: it never touches the pool. The batch
//! service feeds it a snapshot (queue order, running jobs with their
//! walltime-based release times) and starts exactly the jobs the policy
//! returns for "now". Ties on equal reserved start times keep submission
//! order, which the queue snapshot already encodes.

use std::collections::HashMap;

use itertools::Itertools;

use crate::services::{BatchSchedulingAlgorithm, HostSelectionAlgorithm};
use crate::types::{Duration, Time};

/// What the planner needs to know about one waiting job.
#[derive(Debug, Clone)]
pub(crate) struct QueuedView {
    pub id: u64,
    pub nodes: u64,
    pub cores_per_node: u64,
    pub walltime: Duration,
}

/// A job that currently holds resources, releasing them at `end`.
#[derive(Debug, Clone)]
pub(crate) struct RunningView {
    pub hosts: Vec<usize>,
    pub cores_per_node: u64,
    pub end: Time,
}

pub(crate) struct SchedulingContext<'a> {
    pub now: Time,
    pub num_hosts: usize,
    pub cores_per_host: u64,
    pub queue: &'a [QueuedView],
    pub running: &'a [RunningView],
}

pub(crate) trait BatchScheduler {
    fn on_submit(&mut self, _job: &QueuedView) {}
    fn on_completion(&mut self, _job_id: u64) {}
    fn on_timeout(&mut self, _job_id: u64) {}

    /// Which queued jobs start now, and on which hosts (by index).
    fn choose_next(&mut self, cx: &SchedulingContext) -> Vec<(u64, Vec<usize>)>;

    /// Predicted start per tentative request, against a copy of the
    /// current availability timeline. Pure with respect to queue state.
    fn estimate_start_times(
        &self,
        cx: &SchedulingContext,
        tentative: &[(String, u64, u64, Duration)],
    ) -> HashMap<String, Time>;
}

pub(crate) fn make_scheduler(
    algorithm: BatchSchedulingAlgorithm,
    host_selection: HostSelectionAlgorithm,
) -> Box<dyn BatchScheduler> {
    match algorithm {
        BatchSchedulingAlgorithm::Fcfs => Box::new(Fcfs { host_selection, rr_cursor: 0 }),
        BatchSchedulingAlgorithm::ConservativeBf => {
            Box::new(ConservativeBf { host_selection, rr_cursor: 0 })
        }
        BatchSchedulingAlgorithm::EasyBf => Box::new(EasyBf { host_selection, rr_cursor: 0 }),
    }
}

/// Per-host core claims over future time.
#[derive(Debug, Clone)]
struct Timeline {
    num_hosts: usize,
    cores_per_host: u64,
    /// (host, start, end, cores)
    claims: Vec<(usize, Time, Time, u64)>,
}

impl Timeline {
    fn new(cx: &SchedulingContext) -> Self {
        let mut claims = vec![];
        for r in cx.running {
            for &h in &r.hosts {
                claims.push((h, cx.now, r.end, r.cores_per_node));
            }
        }
        Timeline {
            num_hosts: cx.num_hosts,
            cores_per_host: cx.cores_per_host,
            claims,
        }
    }

    /// Minimum free cores on `host` over the window `[start, end)`.
    fn free_on(&self, host: usize, start: Time, end: Time) -> u64 {
        let mut points = vec![start];
        for &(h, s, e, _) in &self.claims {
            if h == host && s < end && e > start {
                if s > start {
                    points.push(s);
                }
                if e < end {
                    points.push(e);
                }
            }
        }
        let max_used = points
            .into_iter()
            .map(|t| {
                self.claims
                    .iter()
                    .filter(|&&(h, s, e, _)| h == host && s <= t && e > t)
                    .map(|&(_, _, _, c)| c)
                    .sum::<u64>()
            })
            .max()
            .unwrap_or(0);
        self.cores_per_host.saturating_sub(max_used)
    }

    /// Candidate decision times: `after` plus every claim release after it.
    fn candidates(&self, after: Time) -> Vec<Time> {
        let mut ts = vec![after];
        ts.extend(self.claims.iter().map(|&(_, _, e, _)| e).filter(|&e| e > after));
        ts.into_iter().sorted().dedup().collect()
    }

    /// Earliest time at or after `after` where `nodes` hosts each hold
    /// `cores_per_node` free for the whole walltime; hosts by sub-policy.
    fn earliest_start(
        &self,
        after: Time,
        nodes: u64,
        cores_per_node: u64,
        walltime: Duration,
        host_selection: HostSelectionAlgorithm,
        rr_cursor: usize,
    ) -> Option<(Time, Vec<usize>)> {
        if nodes as usize > self.num_hosts || cores_per_node > self.cores_per_host {
            return None;
        }
        for t in self.candidates(after) {
            let end = t + walltime;
            let free: Vec<(usize, u64)> = (0..self.num_hosts)
                .map(|h| (h, self.free_on(h, t, end)))
                .filter(|&(_, f)| f >= cores_per_node)
                .collect();
            if free.len() >= nodes as usize {
                let picked = pick_hosts(&free, nodes as usize, host_selection, rr_cursor);
                return Some((t, picked));
            }
        }
        None
    }

    fn claim(&mut self, hosts: &[usize], start: Time, end: Time, cores: u64) {
        for &h in hosts {
            self.claims.push((h, start, end, cores));
        }
    }
}

fn pick_hosts(
    free: &[(usize, u64)],
    nodes: usize,
    host_selection: HostSelectionAlgorithm,
    rr_cursor: usize,
) -> Vec<usize> {
    match host_selection {
        HostSelectionAlgorithm::FirstFit => free.iter().take(nodes).map(|&(h, _)| h).collect(),
        HostSelectionAlgorithm::BestFit => free
            .iter()
            .sorted_by_key(|&&(h, f)| (f, h))
            .take(nodes)
            .map(|&(h, _)| h)
            .collect(),
        HostSelectionAlgorithm::RoundRobin => {
            let start = rr_cursor % free.len();
            (0..free.len())
                .map(|i| free[(start + i) % free.len()].0)
                .take(nodes)
                .collect()
        }
    }
}

/// Strict first-come-first-served: scan the queue head-to-tail against the
/// currently free cores, never skipping a job that cannot be placed.
struct Fcfs {
    host_selection: HostSelectionAlgorithm,
    rr_cursor: usize,
}

impl BatchScheduler for Fcfs {
    fn choose_next(&mut self, cx: &SchedulingContext) -> Vec<(u64, Vec<usize>)> {
        let mut timeline = Timeline::new(cx);
        let mut starts = vec![];
        for job in cx.queue {
            match timeline.earliest_start(
                cx.now,
                job.nodes,
                job.cores_per_node,
                job.walltime,
                self.host_selection,
                self.rr_cursor,
            ) {
                Some((t, hosts)) if t == cx.now => {
                    timeline.claim(&hosts, t, t + job.walltime, job.cores_per_node);
                    starts.push((job.id, hosts));
                    self.rr_cursor += 1;
                }
                // the head cannot run now: strict FCFS stops scanning
                _ => break,
            }
        }
        starts
    }

    fn estimate_start_times(
        &self,
        cx: &SchedulingContext,
        tentative: &[(String, u64, u64, Duration)],
    ) -> HashMap<String, Time> {
        // simulate the strict queue: each job starts no earlier than its
        // predecessor
        let mut estimates = HashMap::new();
        let mut timeline = Timeline::new(cx);
        let mut floor = cx.now;
        for job in cx.queue {
            if let Some((t, hosts)) = timeline.earliest_start(
                floor,
                job.nodes,
                job.cores_per_node,
                job.walltime,
                self.host_selection,
                self.rr_cursor,
            ) {
                timeline.claim(&hosts, t, t + job.walltime, job.cores_per_node);
                floor = t;
            }
        }
        for (id, nodes, cores, walltime) in tentative {
            let predicted = timeline
                .earliest_start(floor, *nodes, *cores, Duration(walltime.0), self.host_selection, self.rr_cursor)
                .map(|(t, _)| t);
            if let Some(t) = predicted {
                estimates.insert(id.clone(), t);
            }
        }
        estimates
    }
}

/// Conservative backfilling: every queued job holds a reservation, rebuilt
/// from scratch on each event by planning the queue in order. A later job
/// lands earlier than an earlier one only when it fits a gap that delays no
/// already-planned reservation.
struct ConservativeBf {
    host_selection: HostSelectionAlgorithm,
    rr_cursor: usize,
}

impl ConservativeBf {
    fn plan(&self, cx: &SchedulingContext) -> (Timeline, Vec<(u64, Time, Vec<usize>)>) {
        let mut timeline = Timeline::new(cx);
        let mut reservations = vec![];
        for job in cx.queue {
            if let Some((t, hosts)) = timeline.earliest_start(
                cx.now,
                job.nodes,
                job.cores_per_node,
                job.walltime,
                self.host_selection,
                self.rr_cursor,
            ) {
                timeline.claim(&hosts, t, t + job.walltime, job.cores_per_node);
                reservations.push((job.id, t, hosts));
            }
        }
        (timeline, reservations)
    }
}

impl BatchScheduler for ConservativeBf {
    fn choose_next(&mut self, cx: &SchedulingContext) -> Vec<(u64, Vec<usize>)> {
        let (_, reservations) = self.plan(cx);
        let starts: Vec<(u64, Vec<usize>)> = reservations
            .into_iter()
            .filter(|(_, t, _)| *t == cx.now)
            .map(|(id, _, hosts)| (id, hosts))
            .collect();
        self.rr_cursor += starts.len();
        starts
    }

    fn estimate_start_times(
        &self,
        cx: &SchedulingContext,
        tentative: &[(String, u64, u64, Duration)],
    ) -> HashMap<String, Time> {
        let (timeline, _) = self.plan(cx);
        tentative
            .iter()
            .filter_map(|(id, nodes, cores, walltime)| {
                timeline
                    .earliest_start(cx.now, *nodes, *cores, *walltime, self.host_selection, self.rr_cursor)
                    .map(|(t, _)| (id.clone(), t))
            })
            .collect()
    }
}

/// EASY backfilling: only the queue head holds a reservation; any later job
/// may start immediately if doing so cannot delay the head's start.
struct EasyBf {
    host_selection: HostSelectionAlgorithm,
    rr_cursor: usize,
}

impl BatchScheduler for EasyBf {
    fn choose_next(&mut self, cx: &SchedulingContext) -> Vec<(u64, Vec<usize>)> {
        let mut timeline = Timeline::new(cx);
        let mut starts = vec![];
        let mut head_reserved = false;
        for job in cx.queue {
            let placement = timeline.earliest_start(
                cx.now,
                job.nodes,
                job.cores_per_node,
                job.walltime,
                self.host_selection,
                self.rr_cursor,
            );
            let (t, hosts) = match placement {
                Some(p) => p,
                None => continue,
            };
            if t == cx.now {
                // starts immediately; claims either way, so the head's
                // shadow reservation is respected by everyone after it
                timeline.claim(&hosts, t, t + job.walltime, job.cores_per_node);
                starts.push((job.id, hosts));
                self.rr_cursor += 1;
            } else if !head_reserved {
                // first job that cannot start holds the only reservation
                timeline.claim(&hosts, t, t + job.walltime, job.cores_per_node);
                head_reserved = true;
            }
            // later jobs keep being considered for backfill against the
            // head's reservation, ties broken by submission order
        }
        starts
    }

    fn estimate_start_times(
        &self,
        cx: &SchedulingContext,
        tentative: &[(String, u64, u64, Duration)],
    ) -> HashMap<String, Time> {
        let mut timeline = Timeline::new(cx);
        if let Some(head) = cx.queue.first() {
            if let Some((t, hosts)) = timeline.earliest_start(
                cx.now,
                head.nodes,
                head.cores_per_node,
                head.walltime,
                self.host_selection,
                self.rr_cursor,
            ) {
                timeline.claim(&hosts, t, t + head.walltime, head.cores_per_node);
            }
        }
        tentative
            .iter()
            .filter_map(|(id, nodes, cores, walltime)| {
                timeline
                    .earliest_start(cx.now, *nodes, *cores, *walltime, self.host_selection, self.rr_cursor)
                    .map(|(t, _)| (id.clone(), t))
            })
            .collect()
    }
}
