//! Messages exchanged between actors.
//!
//! One tagged enum for the whole crate; each variant is a payload struct in
//! [`msg`]. Every variant carries a serialized payload size used for
//! transfer-delay simulation; control messages default to 1024 bytes and any
//! size can be overridden per service through a [`PayloadTable`].

use std::collections::HashMap;

use crate::events::ExecutionEvent;
use crate::failure::FailureCause;
use crate::jobs::{JobId, PilotJobRef, StandardJobRef, WorkflowJob};
use crate::workflow::FileRef;

/// Default serialized size of a control message, in bytes.
pub const DEFAULT_CONTROL_PAYLOAD: u64 = 1024;

/// Payload structs, one per message variant.
pub mod msg {
    use super::*;

    // ---- service lifecycle ----

    /// Ask a service daemon to stop; running/pending jobs fail with `cause`.
    #[derive(Debug, Clone)]
    pub struct StopDaemon {
        pub ack_mailbox: String,
        pub cause: FailureCause,
    }

    #[derive(Debug, Clone)]
    pub struct DaemonStopped {
        pub service: String,
    }

    // ---- compute service API ----

    #[derive(Debug, Clone)]
    pub struct SubmitStandardJob {
        pub job: StandardJobRef,
        pub args: HashMap<String, String>,
        pub callback_mailbox: String,
        pub answer_mailbox: String,
    }

    #[derive(Debug, Clone)]
    pub struct SubmitStandardJobAnswer {
        pub job_id: JobId,
        pub result: std::result::Result<(), FailureCause>,
    }

    #[derive(Debug, Clone)]
    pub struct SubmitPilotJob {
        pub job: PilotJobRef,
        pub args: HashMap<String, String>,
        pub callback_mailbox: String,
        pub answer_mailbox: String,
    }

    #[derive(Debug, Clone)]
    pub struct SubmitPilotJobAnswer {
        pub job_id: JobId,
        pub result: std::result::Result<(), FailureCause>,
    }

    #[derive(Debug, Clone)]
    pub struct TerminateStandardJob {
        pub job_id: JobId,
        pub answer_mailbox: String,
    }

    #[derive(Debug, Clone)]
    pub struct TerminateStandardJobAnswer {
        pub job_id: JobId,
        pub result: std::result::Result<(), FailureCause>,
    }

    #[derive(Debug, Clone)]
    pub struct TerminatePilotJob {
        pub job_id: JobId,
        pub answer_mailbox: String,
    }

    #[derive(Debug, Clone)]
    pub struct TerminatePilotJobAnswer {
        pub job_id: JobId,
        pub result: std::result::Result<(), FailureCause>,
    }

    #[derive(Debug, Clone)]
    pub struct ResourceInfoRequest {
        pub answer_mailbox: String,
    }

    #[derive(Debug, Clone)]
    pub struct ResourceInfoAnswer {
        pub info: super::ResourceInfo,
    }

    // ---- submitter callbacks ----

    #[derive(Debug, Clone)]
    pub struct StandardJobDone {
        pub job: StandardJobRef,
        pub service: String,
    }

    #[derive(Debug, Clone)]
    pub struct StandardJobFailed {
        pub job: StandardJobRef,
        pub service: String,
        pub cause: FailureCause,
    }

    #[derive(Debug, Clone)]
    pub struct PilotJobStarted {
        pub job: PilotJobRef,
        pub service: String,
    }

    #[derive(Debug, Clone)]
    pub struct PilotJobExpired {
        pub job: PilotJobRef,
        pub service: String,
    }

    #[derive(Debug, Clone)]
    pub struct PilotJobFailed {
        pub job: PilotJobRef,
        pub service: String,
        pub cause: FailureCause,
    }

    // ---- executor internals ----

    #[derive(Debug, Clone)]
    pub struct ExecutorDone {
        pub executor: String,
        pub job: StandardJobRef,
    }

    #[derive(Debug, Clone)]
    pub struct ExecutorFailed {
        pub executor: String,
        pub job: StandardJobRef,
        pub cause: FailureCause,
    }

    /// Graceful kill: the executor cancels its work units and reports
    /// `ExecutorFailed` with this cause.
    #[derive(Debug, Clone)]
    pub struct TerminateExecutor {
        pub cause: FailureCause,
    }

    #[derive(Debug, Clone)]
    pub struct WorkUnitDone {
        pub task_id: String,
    }

    #[derive(Debug, Clone)]
    pub struct WorkUnitFailed {
        pub task_id: String,
        pub cause: FailureCause,
    }

    // ---- alarms ----

    /// A batch job reached its requested walltime.
    #[derive(Debug, Clone)]
    pub struct BatchJobTimeout {
        pub batch_job_id: u64,
    }

    /// A multicore pilot lease reached its duration.
    #[derive(Debug, Clone)]
    pub struct PilotLeaseExpired {
        pub pilot_job_id: JobId,
    }

    // ---- storage ----

    #[derive(Debug, Clone)]
    pub struct FileRead {
        pub file: FileRef,
        pub answer_mailbox: String,
    }

    #[derive(Debug, Clone)]
    pub struct FileReadAnswer {
        pub file: FileRef,
        pub result: std::result::Result<(), FailureCause>,
    }

    #[derive(Debug, Clone)]
    pub struct FileWrite {
        pub file: FileRef,
        pub answer_mailbox: String,
    }

    #[derive(Debug, Clone)]
    pub struct FileWriteAnswer {
        pub file: FileRef,
        pub result: std::result::Result<(), FailureCause>,
    }

    #[derive(Debug, Clone)]
    pub struct FileDelete {
        pub file: FileRef,
        pub answer_mailbox: String,
    }

    #[derive(Debug, Clone)]
    pub struct FileDeleteAnswer {
        pub file: FileRef,
        pub result: std::result::Result<(), FailureCause>,
    }

    #[derive(Debug, Clone)]
    pub struct FileLookup {
        pub file: FileRef,
        pub answer_mailbox: String,
    }

    #[derive(Debug, Clone)]
    pub struct FileLookupAnswer {
        pub file: FileRef,
        pub found: bool,
    }

    /// Sent to the destination storage service.
    #[derive(Debug, Clone)]
    pub struct FileCopy {
        pub file: FileRef,
        pub src_mailbox: String,
        pub answer_mailbox: String,
    }

    #[derive(Debug, Clone)]
    pub struct FileCopyAnswer {
        pub file: FileRef,
        /// mailbox of the destination service that performed the copy
        pub dst_mailbox: String,
        pub result: std::result::Result<(), FailureCause>,
    }

    // ---- batch queries ----

    /// Ask a batch service to predict start times for tentative requests
    /// of shape (id, num_nodes, cores_per_node, walltime_seconds).
    #[derive(Debug, Clone)]
    pub struct BatchEstimateRequest {
        pub requests: Vec<(String, u64, u64, f64)>,
        pub answer_mailbox: String,
    }

    #[derive(Debug, Clone)]
    pub struct BatchEstimateAnswer {
        pub estimates: HashMap<String, crate::types::Time>,
    }

    // ---- manager internals ----

    /// The job manager starts tracking a submitted job.
    #[derive(Debug, Clone)]
    pub struct TrackJob {
        pub job: WorkflowJob,
    }

    /// The job manager drops tracking for a job.
    #[derive(Debug, Clone)]
    pub struct ForgetJob {
        pub job_id: JobId,
    }

    /// An execution event delivered to the workflow manager mailbox.
    #[derive(Debug, Clone)]
    pub struct WorkflowEvent {
        pub event: ExecutionEvent,
    }
}

/// A snapshot of a compute service's resources, answered on request.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub service: String,
    /// (host, total cores, idle cores) in declared order
    pub per_host: Vec<(String, u64, u64)>,
    pub ram_per_host: f64,
    pub core_flop_rate: f64,
    /// remaining time-to-live if this service is leased
    pub ttl_remaining: Option<crate::types::Duration>,
    pub supports_standard_jobs: bool,
    pub supports_pilot_jobs: bool,
}

impl ResourceInfo {
    pub fn num_hosts(&self) -> u64 {
        self.per_host.len() as u64
    }

    pub fn num_cores(&self) -> u64 {
        self.per_host.iter().map(|(_, c, _)| c).sum()
    }

    pub fn num_idle_cores(&self) -> u64 {
        self.per_host.iter().map(|(_, _, i)| i).sum()
    }
}

macro_rules! define_message {
    ( $( $name:ident ),+ $(,)? ) => {
        /// Every message the simulation can carry, as a tagged variant.
        #[derive(Debug, Clone)]
        pub enum Message {
            $( $name(msg::$name) ),+
        }

        $(
            impl From<msg::$name> for Message {
                fn from(v: msg::$name) -> Self {
                    Self::$name(v)
                }
            }
        )+

        impl Message {
            /// Stable variant name, used for payload overrides and tracing.
            pub fn kind(&self) -> &'static str {
                match self {
                    $( Self::$name(_) => stringify!($name) ),+
                }
            }
        }
    };
}

define_message![
    StopDaemon,
    DaemonStopped,
    SubmitStandardJob,
    SubmitStandardJobAnswer,
    SubmitPilotJob,
    SubmitPilotJobAnswer,
    TerminateStandardJob,
    TerminateStandardJobAnswer,
    TerminatePilotJob,
    TerminatePilotJobAnswer,
    ResourceInfoRequest,
    ResourceInfoAnswer,
    StandardJobDone,
    StandardJobFailed,
    PilotJobStarted,
    PilotJobExpired,
    PilotJobFailed,
    ExecutorDone,
    ExecutorFailed,
    TerminateExecutor,
    WorkUnitDone,
    WorkUnitFailed,
    BatchJobTimeout,
    PilotLeaseExpired,
    FileRead,
    FileReadAnswer,
    FileWrite,
    FileWriteAnswer,
    FileDelete,
    FileDeleteAnswer,
    FileLookup,
    FileLookupAnswer,
    FileCopy,
    FileCopyAnswer,
    BatchEstimateRequest,
    BatchEstimateAnswer,
    TrackJob,
    ForgetJob,
    WorkflowEvent,
];

impl Message {
    /// Default serialized payload size for this variant.
    pub fn default_payload(&self) -> u64 {
        DEFAULT_CONTROL_PAYLOAD
    }
}

/// Per-service payload size overrides, keyed by message variant name.
#[derive(Debug, Clone, Default)]
pub struct PayloadTable {
    overrides: HashMap<String, u64>,
}

impl PayloadTable {
    pub fn set(&mut self, kind: impl Into<String>, bytes: u64) {
        self.overrides.insert(kind.into(), bytes);
    }

    pub fn payload_of(&self, message: &Message) -> u64 {
        self.overrides
            .get(message.kind())
            .copied()
            .unwrap_or_else(|| message.default_payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_override() {
        let mut table = PayloadTable::default();
        let m: Message = msg::DaemonStopped { service: "cs".into() }.into();
        assert_eq!(table.payload_of(&m), DEFAULT_CONTROL_PAYLOAD);
        table.set("DaemonStopped", 4096);
        assert_eq!(table.payload_of(&m), 4096);
    }
}
