//! Asynchronous file-copy coordinator co-located with a workflow manager.
//!
//! Copies are submitted fire-and-forget; the storage services do the work and
//! enforce their own backpressure. Completions come back here and are
//! forwarded to the workflow manager as execution events.

use crate::events::ExecutionEvent;
use crate::failure::FailureCause;
use crate::messages::{msg, Message};
use crate::services::request_answer;
use crate::services::storage::StorageServiceHandle;
use crate::sim::SimHandle;
use crate::utils::prelude::*;
use crate::workflow::FileRef;

pub struct DataMovementManager {
    name: String,
    mailbox: String,
}

impl DataMovementManager {
    pub fn new(ctx: &SimHandle, wms_mailbox: &str) -> DataMovementManager {
        let name = format!("data_movement_manager_{}", ctx.unique_id());
        let mailbox = format!("{}_mailbox", name);
        let mb = mailbox.clone();
        let wms = wms_mailbox.to_owned();
        ctx.spawn(&name, ctx.host(), true, Some(&mailbox), move |actor| {
            dmm_main(actor, mb, wms)
        });
        DataMovementManager { name, mailbox }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit an asynchronous copy of `file` from `src` to `dst`.
    /// Completion arrives at the workflow manager as a file-copy event.
    pub fn submit_file_copy(
        &self,
        ctx: &SimHandle,
        file: &FileRef,
        src: &StorageServiceHandle,
        dst: &StorageServiceHandle,
    ) {
        debug!(manager = %self.name, file = %file.id, src = %src.name, dst = %dst.name, "submitting file copy");
        dst.initiate_file_copy(ctx, file, src, &self.mailbox);
    }

    pub async fn stop(&self, ctx: &SimHandle) -> std::result::Result<(), FailureCause> {
        let reply = request_answer(ctx, &self.mailbox, |ack_mailbox| {
            msg::StopDaemon {
                ack_mailbox,
                cause: FailureCause::service_down(&self.name),
            }
            .into()
        })
        .await?;
        match reply {
            Message::DaemonStopped(_) => Ok(()),
            other => Err(crate::services::unexpected_reply("DaemonStopped", &other)),
        }
    }
}

async fn dmm_main(ctx: SimHandle, mailbox: String, wms_mailbox: String) -> std::result::Result<(), FailureCause> {
    debug!(manager = %ctx.name(), "data movement manager starting");
    loop {
        let message = ctx.recv(&mailbox).await?;
        match message {
            Message::FileCopyAnswer(m) => {
                let event = match m.result {
                    Ok(()) => ExecutionEvent::FileCopyCompleted {
                        file: m.file,
                        dst_mailbox: m.dst_mailbox,
                    },
                    Err(cause) => ExecutionEvent::FileCopyFailed {
                        file: m.file,
                        dst_mailbox: m.dst_mailbox,
                        cause,
                    },
                };
                debug!(manager = %ctx.name(), %event, "file copy finished");
                ctx.dsend(&wms_mailbox, msg::WorkflowEvent { event });
            }
            Message::StopDaemon(m) => {
                ctx.dsend(&m.ack_mailbox, msg::DaemonStopped { service: ctx.name().to_owned() });
                return Ok(());
            }
            other => {
                warn!(manager = %ctx.name(), kind = other.kind(), "data movement manager ignoring message");
            }
        }
    }
}
