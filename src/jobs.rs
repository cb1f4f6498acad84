use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use parse_display::Display;

use crate::types::{Duration, Time};
use crate::workflow::{FileRef, TaskRef};

pub type JobId = u64;
pub type StandardJobRef = Rc<RefCell<StandardJob>>;
pub type PilotJobRef = Rc<RefCell<PilotJob>>;

/// Where a file lives: a storage service mailbox plus a mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub storage_mailbox: String,
    pub mount_point: String,
}

/// A copy directive attached to a standard job (pre- or post-execution).
#[derive(Debug, Clone)]
pub struct FileCopySpec {
    pub file: FileRef,
    pub src: FileLocation,
    pub dst: FileLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "SNAKE_CASE")]
pub enum StandardJobState {
    NotSubmitted,
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

/// A static bundle of tasks submitted together and billed as a single unit.
///
/// The job references tasks, it does not own them; the workflow does.
#[derive(Debug)]
pub struct StandardJob {
    pub id: JobId,
    pub name: String,
    pub tasks: Vec<TaskRef>,
    pub file_locations: HashMap<String, FileLocation>,
    pub pre_copies: Vec<FileCopySpec>,
    pub post_copies: Vec<FileCopySpec>,
    pub cleanup: Vec<(FileRef, FileLocation)>,
    pub state: StandardJobState,
    /// where completion/failure notifications go, set at submission
    pub callback_mailbox: Option<String>,
    /// mailbox of the service the job was submitted to
    pub submitted_to: Option<String>,
}

impl StandardJob {
    pub fn new(id: JobId, tasks: Vec<TaskRef>, file_locations: HashMap<String, FileLocation>) -> Self {
        StandardJob {
            id,
            name: format!("standard_job_{}", id),
            tasks,
            file_locations,
            pre_copies: vec![],
            post_copies: vec![],
            cleanup: vec![],
            state: StandardJobState::NotSubmitted,
            callback_mailbox: None,
            submitted_to: None,
        }
    }

    /// The fewest cores that allow every task in the job to run.
    pub fn min_required_cores(&self) -> u64 {
        self.tasks
            .iter()
            .map(|t| t.borrow().min_cores)
            .max()
            .unwrap_or(1)
    }

    /// The largest single-task ram requirement in the job.
    pub fn min_required_ram(&self) -> f64 {
        self.tasks
            .iter()
            .map(|t| t.borrow().ram)
            .fold(0.0, f64::max)
    }

    pub fn total_flops(&self) -> f64 {
        self.tasks.iter().map(|t| t.borrow().flops).sum()
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn location_of(&self, file_id: &str) -> Option<&FileLocation> {
        self.file_locations.get(file_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display(style = "SNAKE_CASE")]
pub enum PilotJobState {
    NotSubmitted,
    Pending,
    Running,
    Expired,
    Failed,
    Terminated,
}

/// A resource lease request: when granted it hosts a nested compute service
/// for at most `duration` of simulated time.
#[derive(Debug)]
pub struct PilotJob {
    pub id: JobId,
    pub name: String,
    pub num_hosts: u64,
    pub cores_per_host: u64,
    pub ram_per_host: f64,
    pub duration: Duration,
    pub state: PilotJobState,
    pub callback_mailbox: Option<String>,
    pub submitted_to: Option<String>,
    /// mailbox of the nested compute service, valid while the lease runs
    pub nested_service_mailbox: Option<String>,
    pub start_date: Option<Time>,
}

impl PilotJob {
    pub fn new(id: JobId, num_hosts: u64, cores_per_host: u64, ram_per_host: f64, duration: Duration) -> Self {
        PilotJob {
            id,
            name: format!("pilot_job_{}", id),
            num_hosts,
            cores_per_host,
            ram_per_host,
            duration,
            state: PilotJobState::NotSubmitted,
            callback_mailbox: None,
            submitted_to: None,
            nested_service_mailbox: None,
            start_date: None,
        }
    }
}

/// Either kind of workflow job, as tracked by managers and batch wrappers.
#[derive(Debug, Clone)]
pub enum WorkflowJob {
    Standard(StandardJobRef),
    Pilot(PilotJobRef),
}

impl WorkflowJob {
    pub fn id(&self) -> JobId {
        match self {
            WorkflowJob::Standard(j) => j.borrow().id,
            WorkflowJob::Pilot(j) => j.borrow().id,
        }
    }

    pub fn name(&self) -> String {
        match self {
            WorkflowJob::Standard(j) => j.borrow().name.clone(),
            WorkflowJob::Pilot(j) => j.borrow().name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Workflow;

    #[test]
    fn min_required_cores_is_max_of_task_minimums() {
        let mut w = Workflow::new();
        let a = w.add_task("a", 1e9, 2, 4, 1.0, 0.0).unwrap();
        let b = w.add_task("b", 1e9, 3, 3, 1.0, 0.0).unwrap();
        let job = StandardJob::new(1, vec![a, b], HashMap::new());
        assert_eq!(job.min_required_cores(), 3);
    }

    #[test]
    fn empty_job_needs_one_core() {
        let job = StandardJob::new(1, vec![], HashMap::new());
        assert_eq!(job.min_required_cores(), 1);
    }
}
