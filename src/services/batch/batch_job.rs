use std::collections::HashMap;

use crate::failure::FailureCause;
use crate::jobs::WorkflowJob;
use crate::types::{Duration, Time};

/// The scheduler-visible wrapper around a workflow job.
///
/// Once `begin` is set the allocation is fixed until completion or
/// termination.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub id: u64,
    pub job: WorkflowJob,
    pub nodes: u64,
    pub cores_per_node: u64,
    pub walltime: Duration,
    pub priority: i64,
    /// whether this submission came from workload-trace replay
    pub from_trace: bool,
    pub arrival: Time,
    pub begin: Option<Time>,
    pub allocation: Vec<String>,
}

impl BatchJob {
    pub fn total_flops(&self) -> f64 {
        match &self.job {
            WorkflowJob::Standard(j) => j.borrow().total_flops(),
            WorkflowJob::Pilot(_) => 0.0,
        }
    }
}

/// Parse the required batch arguments `-N` (nodes), `-c` (cores per node),
/// `-t` (walltime seconds), plus an optional `-p` (priority).
pub fn parse_batch_args(
    service: &str,
    args: &HashMap<String, String>,
) -> std::result::Result<(u64, u64, Duration, i64), FailureCause> {
    let nodes = parse_u64(service, args, "-N")?;
    let cores = parse_u64(service, args, "-c")?;
    let walltime: f64 = args
        .get("-t")
        .ok_or_else(|| missing(service, "-t"))?
        .parse()
        .map_err(|_| invalid(service, "-t"))?;
    if walltime < 0.0 {
        return Err(invalid(service, "-t"));
    }
    let priority = match args.get("-p") {
        Some(v) => v.parse().map_err(|_| invalid(service, "-p"))?,
        None => 0,
    };
    Ok((nodes, cores, Duration(walltime), priority))
}

fn parse_u64(service: &str, args: &HashMap<String, String>, key: &str) -> std::result::Result<u64, FailureCause> {
    args.get(key)
        .ok_or_else(|| missing(service, key))?
        .parse()
        .map_err(|_| invalid(service, key))
}

fn missing(service: &str, key: &str) -> FailureCause {
    FailureCause::not_enough_resources(service, format!("missing batch argument {}", key))
}

fn invalid(service: &str, key: &str) -> FailureCause {
    FailureCause::not_enough_resources(service, format!("invalid batch argument {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_required_arguments() {
        let (n, c, t, p) = parse_batch_args("cs", &args(&[("-N", "3"), ("-c", "2"), ("-t", "10.5")])).unwrap();
        assert_eq!((n, c), (3, 2));
        assert_eq!(t, Duration(10.5));
        assert_eq!(p, 0);
    }

    #[test]
    fn rejects_missing_and_malformed() {
        assert!(parse_batch_args("cs", &args(&[("-N", "3"), ("-c", "2")])).is_err());
        assert!(parse_batch_args("cs", &args(&[("-N", "x"), ("-c", "2"), ("-t", "1")])).is_err());
        assert!(parse_batch_args("cs", &args(&[("-N", "1"), ("-c", "2"), ("-t", "-5")])).is_err());
    }

    #[test]
    fn optional_priority() {
        let (_, _, _, p) =
            parse_batch_args("cs", &args(&[("-N", "1"), ("-c", "1"), ("-t", "1"), ("-p", "7")])).unwrap();
        assert_eq!(p, 7);
    }
}
