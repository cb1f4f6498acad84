use thiserror::Error;

/// Why a job, an operation, or a whole service went wrong.
///
/// Carried inside failure notifications so that every failure reaches the
/// submitter as exactly one event with a machine-readable cause.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FailureCause {
    /// Mailbox transport failed (receiver gone, send/recv aborted)
    #[error("network error while {operation}")]
    NetworkError { operation: String },
    /// A simulated host is down or unknown
    #[error("host {host} has failed or is unknown")]
    HostFailure { host: String },
    /// Walltime exhausted
    #[error("job exceeded its requested walltime")]
    JobTimeout,
    /// Explicit terminate, or an ancestor pilot job expired
    #[error("job was killed")]
    JobKilled,
    /// Target compute/storage service is stopped
    #[error("service {service} is down")]
    ServiceDown { service: String },
    /// The service does not accept this kind of job
    #[error("service {service} does not support {job_kind} jobs")]
    JobTypeNotSupported { service: String, job_kind: String },
    /// Requested cores/ram exceed what the service can ever provide
    #[error("not enough resources on {service}: {reason}")]
    NotEnoughResources { service: String, reason: String },
    /// Storage layer: file absent
    #[error("file {file} not found on {service}")]
    FileNotFound { file: String, service: String },
    /// Storage layer: capacity exhausted
    #[error("storage {service} is full")]
    StorageFull { service: String },
    /// An invariant was violated; the simulation should abort
    #[error("fatal failure: {message}")]
    FatalFailure { message: String },
}

impl FailureCause {
    pub fn network(operation: impl Into<String>) -> Self {
        FailureCause::NetworkError { operation: operation.into() }
    }

    pub fn service_down(service: impl Into<String>) -> Self {
        FailureCause::ServiceDown { service: service.into() }
    }

    pub fn job_type_not_supported(service: impl Into<String>, job_kind: impl Into<String>) -> Self {
        FailureCause::JobTypeNotSupported {
            service: service.into(),
            job_kind: job_kind.into(),
        }
    }

    pub fn not_enough_resources(service: impl Into<String>, reason: impl Into<String>) -> Self {
        FailureCause::NotEnoughResources {
            service: service.into(),
            reason: reason.into(),
        }
    }
}
