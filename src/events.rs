use std::fmt;

use crate::failure::FailureCause;
use crate::jobs::{PilotJobRef, StandardJobRef};
use crate::workflow::FileRef;

/// The unified execution-event stream a workflow manager consumes.
///
/// The job manager and the data movement manager translate service-level
/// notifications into these.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    StandardJobCompleted { job: StandardJobRef },
    StandardJobFailed { job: StandardJobRef, cause: FailureCause },
    PilotJobStarted { job: PilotJobRef },
    PilotJobExpired { job: PilotJobRef },
    PilotJobFailed { job: PilotJobRef, cause: FailureCause },
    FileCopyCompleted { file: FileRef, dst_mailbox: String },
    FileCopyFailed { file: FileRef, dst_mailbox: String, cause: FailureCause },
}

impl fmt::Display for ExecutionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionEvent::StandardJobCompleted { job } => {
                write!(f, "StandardJobCompleted({})", job.borrow().name)
            }
            ExecutionEvent::StandardJobFailed { job, cause } => {
                write!(f, "StandardJobFailed({}, {})", job.borrow().name, cause)
            }
            ExecutionEvent::PilotJobStarted { job } => write!(f, "PilotJobStarted({})", job.borrow().name),
            ExecutionEvent::PilotJobExpired { job } => write!(f, "PilotJobExpired({})", job.borrow().name),
            ExecutionEvent::PilotJobFailed { job, cause } => {
                write!(f, "PilotJobFailed({}, {})", job.borrow().name, cause)
            }
            ExecutionEvent::FileCopyCompleted { file, .. } => write!(f, "FileCopyCompleted({})", file.id),
            ExecutionEvent::FileCopyFailed { file, cause, .. } => {
                write!(f, "FileCopyFailed({}, {})", file.id, cause)
            }
        }
    }
}
