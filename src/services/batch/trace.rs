//! Workload-trace replay: parse `(submit_time, walltime, requested_walltime,
//! requested_nodes, requested_cores_per_node, user_id)` rows and re-submit
//! them as synthetic batch jobs at their submit times.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use crate::jobs::StandardJob;
use crate::messages::Message;
use crate::services::ComputeServiceHandle;
use crate::sim::SimHandle;
use crate::types::Time;
use crate::utils::prelude::*;
use crate::workflow::Workflow;

/// Synthetic trace job ids start here so they never collide with ids handed
/// out by a job manager. The batch service also uses this to recognize
/// trace-replayed submissions.
pub(crate) const TRACE_JOB_ID_BASE: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    pub submit_time: f64,
    pub walltime: f64,
    pub requested_walltime: f64,
    pub nodes: u64,
    pub cores_per_node: u64,
    pub user_id: String,
}

/// Parse a workload trace. Rows are comma- or whitespace-separated; lines
/// starting with `#` or `;` are comments.
pub fn parse_trace(content: &str) -> Result<Vec<TraceEntry>> {
    let body: String = content
        .lines()
        .filter(|l| {
            let t = l.trim();
            !t.is_empty() && !t.starts_with('#') && !t.starts_with(';')
        })
        .collect::<Vec<_>>()
        .join("\n");
    if body.is_empty() {
        return Ok(vec![]);
    }

    let mut entries = vec![];
    if body.contains(',') {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_reader(body.as_bytes());
        for record in reader.records() {
            let record = record?;
            let fields: Vec<&str> = record.iter().collect();
            entries.push(entry_from_fields(&fields)?);
        }
    } else {
        for line in body.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            entries.push(entry_from_fields(&fields)?);
        }
    }
    entries.sort_by(|a, b| a.submit_time.total_cmp(&b.submit_time));
    Ok(entries)
}

pub fn load_trace(path: impl AsRef<Path>) -> Result<Vec<TraceEntry>> {
    let content = fs::read_to_string(path)?;
    parse_trace(&content)
}

fn entry_from_fields(fields: &[&str]) -> Result<TraceEntry> {
    if fields.len() < 6 {
        return Err(Error::workflow_input(format!(
            "trace row has {} fields, 6 expected",
            fields.len()
        )));
    }
    let bad = |what: &str| Error::workflow_input(format!("bad trace field {}", what));
    Ok(TraceEntry {
        submit_time: fields[0].parse().map_err(|_| bad("submit_time"))?,
        walltime: fields[1].parse().map_err(|_| bad("walltime"))?,
        requested_walltime: fields[2].parse().map_err(|_| bad("requested_walltime"))?,
        nodes: fields[3].parse().map_err(|_| bad("requested_nodes"))?,
        cores_per_node: fields[4].parse().map_err(|_| bad("requested_cores_per_node"))?,
        user_id: fields[5].to_owned(),
    })
}

/// Spawn the replayer actor next to a batch service.
pub(crate) fn start_replayer(
    ctx: &SimHandle,
    service: ComputeServiceHandle,
    reference_flop_rate: f64,
    entries: Vec<TraceEntry>,
) {
    let name = format!("{}_trace_replayer", service.name);
    let mailbox = format!("{}_mailbox", name);
    let host = service.host.clone();
    let mb = mailbox.clone();
    ctx.spawn(&name, &host, true, Some(&mailbox), move |actor| {
        replayer_main(actor, mb, service, reference_flop_rate, entries)
    });
}

async fn replayer_main(
    ctx: SimHandle,
    mailbox: String,
    service: ComputeServiceHandle,
    reference_flop_rate: f64,
    entries: Vec<TraceEntry>,
) -> std::result::Result<(), crate::failure::FailureCause> {
    info!(replayer = %ctx.name(), jobs = entries.len(), "workload trace replay starting");
    let mut workflow = Workflow::new();
    let mut outstanding = 0usize;

    for (i, entry) in entries.iter().enumerate() {
        ctx.sleep_until(Time(entry.submit_time)).await;

        let task_id = format!("trace_task_{}", i);
        // one single-core task sized so its runtime equals the traced walltime
        let task = match workflow.add_task(&task_id, entry.walltime * reference_flop_rate, 1, 1, 1.0, 0.0) {
            Ok(t) => t,
            Err(err) => {
                warn!(%err, "skipping malformed trace entry");
                continue;
            }
        };
        let job = Rc::new(RefCell::new(StandardJob::new(
            TRACE_JOB_ID_BASE + i as u64,
            vec![task],
            HashMap::new(),
        )));
        let mut args = HashMap::new();
        args.insert("-N".to_owned(), entry.nodes.to_string());
        args.insert("-c".to_owned(), entry.cores_per_node.to_string());
        args.insert("-t".to_owned(), entry.requested_walltime.to_string());

        match service.submit_standard_job(&ctx, &job, args, &mailbox).await {
            Ok(()) => outstanding += 1,
            Err(cause) => {
                warn!(user = %entry.user_id, %cause, "trace job rejected");
            }
        }
    }

    // absorb the completion stream so the batch service's callbacks land
    while outstanding > 0 {
        match ctx.recv(&mailbox).await {
            Ok(Message::StandardJobDone(m)) => {
                outstanding -= 1;
                debug!(job = %m.job.borrow().name, "trace job completed");
            }
            Ok(Message::StandardJobFailed(m)) => {
                outstanding -= 1;
                debug!(job = %m.job.borrow().name, cause = %m.cause, "trace job failed");
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    info!(replayer = %ctx.name(), "workload trace replay finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_separated() {
        let trace = "# comment\n0.0 10 12 2 1 alice\n5 20 30 1 2 bob\n";
        let entries = parse_trace(trace).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].nodes, 2);
        assert_eq!(entries[1].user_id, "bob");
        assert_eq!(entries[1].requested_walltime, 30.0);
    }

    #[test]
    fn comma_separated() {
        let trace = "0.0, 10, 12, 2, 1, alice\n5, 20, 30, 1, 2, bob\n";
        let entries = parse_trace(trace).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].user_id, "alice");
        assert_eq!(entries[1].cores_per_node, 2);
    }

    #[test]
    fn rows_sorted_by_submit_time() {
        let trace = "9 1 1 1 1 u\n3 1 1 1 1 v\n";
        let entries = parse_trace(trace).unwrap();
        assert_eq!(entries[0].user_id, "v");
    }

    #[test]
    fn short_row_rejected() {
        assert!(parse_trace("1 2 3 4\n").is_err());
    }
}
