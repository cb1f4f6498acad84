//! A simple simulated storage service.
//!
//! One mount point, bounded capacity, a fixed transfer bandwidth. Requests
//! are served one at a time by the owning actor, which is what gives storage
//! its natural backpressure. Answers go out detached so a dead client can
//! never wedge the service.

use std::collections::HashSet;

use crate::failure::FailureCause;
use crate::jobs::FileLocation;
use crate::messages::{msg, Message};
use crate::sim::{Kernel, SimHandle};
use crate::types::Duration;
use crate::utils::prelude::*;
use crate::workflow::FileRef;

#[derive(Debug, Clone)]
pub struct StorageServiceHandle {
    pub name: String,
    pub mailbox: String,
    pub host: String,
    pub mount_point: String,
}

impl StorageServiceHandle {
    pub fn location(&self) -> FileLocation {
        FileLocation {
            storage_mailbox: self.mailbox.clone(),
            mount_point: self.mount_point.clone(),
        }
    }

    pub async fn read_file(&self, ctx: &SimHandle, file: &FileRef) -> std::result::Result<(), FailureCause> {
        read_file_at(ctx, &self.location(), file).await
    }

    pub async fn write_file(&self, ctx: &SimHandle, file: &FileRef) -> std::result::Result<(), FailureCause> {
        write_file_at(ctx, &self.location(), file).await
    }

    pub async fn delete_file(&self, ctx: &SimHandle, file: &FileRef) -> std::result::Result<(), FailureCause> {
        delete_file_at(ctx, &self.location(), file).await
    }

    pub async fn lookup_file(&self, ctx: &SimHandle, file: &FileRef) -> std::result::Result<bool, FailureCause> {
        let reply = super::request_answer(ctx, &self.mailbox, |answer_mailbox| {
            msg::FileLookup {
                file: file.clone(),
                answer_mailbox,
            }
            .into()
        })
        .await?;
        match reply {
            Message::FileLookupAnswer(a) => Ok(a.found),
            other => Err(super::unexpected_reply("FileLookupAnswer", &other)),
        }
    }

    /// Copy `file` from `src` onto this service, blocking until done.
    pub async fn copy_file(
        &self,
        ctx: &SimHandle,
        file: &FileRef,
        src: &StorageServiceHandle,
    ) -> std::result::Result<(), FailureCause> {
        copy_file_between(ctx, file, &src.location(), &self.location()).await
    }

    /// Fire-and-forget copy initiation; the answer goes to `answer_mailbox`.
    pub fn initiate_file_copy(
        &self,
        ctx: &SimHandle,
        file: &FileRef,
        src: &StorageServiceHandle,
        answer_mailbox: &str,
    ) {
        ctx.dsend(
            &self.mailbox,
            msg::FileCopy {
                file: file.clone(),
                src_mailbox: src.mailbox.clone(),
                answer_mailbox: answer_mailbox.to_owned(),
            },
        );
    }
}

/// Blocking read against whatever storage service owns `location`.
pub async fn read_file_at(ctx: &SimHandle, location: &FileLocation, file: &FileRef) -> std::result::Result<(), FailureCause> {
    let reply = super::request_answer(ctx, &location.storage_mailbox, |answer_mailbox| {
        msg::FileRead {
            file: file.clone(),
            answer_mailbox,
        }
        .into()
    })
    .await?;
    match reply {
        Message::FileReadAnswer(a) => a.result,
        other => Err(super::unexpected_reply("FileReadAnswer", &other)),
    }
}

pub async fn write_file_at(ctx: &SimHandle, location: &FileLocation, file: &FileRef) -> std::result::Result<(), FailureCause> {
    let reply = super::request_answer(ctx, &location.storage_mailbox, |answer_mailbox| {
        msg::FileWrite {
            file: file.clone(),
            answer_mailbox,
        }
        .into()
    })
    .await?;
    match reply {
        Message::FileWriteAnswer(a) => a.result,
        other => Err(super::unexpected_reply("FileWriteAnswer", &other)),
    }
}

pub async fn delete_file_at(ctx: &SimHandle, location: &FileLocation, file: &FileRef) -> std::result::Result<(), FailureCause> {
    let reply = super::request_answer(ctx, &location.storage_mailbox, |answer_mailbox| {
        msg::FileDelete {
            file: file.clone(),
            answer_mailbox,
        }
        .into()
    })
    .await?;
    match reply {
        Message::FileDeleteAnswer(a) => a.result,
        other => Err(super::unexpected_reply("FileDeleteAnswer", &other)),
    }
}

/// Blocking copy: the destination service pulls from the source.
pub async fn copy_file_between(
    ctx: &SimHandle,
    file: &FileRef,
    src: &FileLocation,
    dst: &FileLocation,
) -> std::result::Result<(), FailureCause> {
    let reply = super::request_answer(ctx, &dst.storage_mailbox, |answer_mailbox| {
        msg::FileCopy {
            file: file.clone(),
            src_mailbox: src.storage_mailbox.clone(),
            answer_mailbox,
        }
        .into()
    })
    .await?;
    match reply {
        Message::FileCopyAnswer(a) => a.result,
        other => Err(super::unexpected_reply("FileCopyAnswer", &other)),
    }
}

/// Start a storage service on `host` with `capacity` bytes behind a
/// `bandwidth` bytes/s link.
pub fn start(
    kernel: &Kernel,
    name: &str,
    host: &str,
    mount_point: &str,
    capacity: f64,
    bandwidth: f64,
) -> StorageServiceHandle {
    let mailbox = format!("{}_mailbox", name);
    let handle = StorageServiceHandle {
        name: name.to_owned(),
        mailbox: mailbox.clone(),
        host: host.to_owned(),
        mount_point: mount_point.to_owned(),
    };
    let service_name = name.to_owned();
    kernel.spawn(name, host, true, Some(&mailbox.clone()), move |ctx| {
        service_main(ctx, service_name, mailbox, capacity, bandwidth)
    });
    handle
}

async fn service_main(
    ctx: SimHandle,
    name: String,
    mailbox: String,
    capacity: f64,
    bandwidth: f64,
) -> std::result::Result<(), FailureCause> {
    let mut files: HashSet<String> = HashSet::new();
    let mut used = 0.0_f64;
    info!(service = %name, capacity, bandwidth, "storage service starting");

    loop {
        let message = match ctx.recv(&mailbox).await {
            Ok(m) => m,
            Err(_) => break,
        };
        match message {
            Message::FileRead(m) => {
                let result = if files.contains(&m.file.id) {
                    ctx.sleep(transfer_time(m.file.size, bandwidth)).await;
                    Ok(())
                } else {
                    Err(FailureCause::FileNotFound {
                        file: m.file.id.clone(),
                        service: name.clone(),
                    })
                };
                ctx.dsend(&m.answer_mailbox, msg::FileReadAnswer { file: m.file, result });
            }
            Message::FileWrite(m) => {
                let result = store(&ctx, &name, &mut files, &mut used, capacity, bandwidth, &m.file).await;
                ctx.dsend(&m.answer_mailbox, msg::FileWriteAnswer { file: m.file, result });
            }
            Message::FileDelete(m) => {
                let result = if files.remove(&m.file.id) {
                    used -= m.file.size;
                    Ok(())
                } else {
                    Err(FailureCause::FileNotFound {
                        file: m.file.id.clone(),
                        service: name.clone(),
                    })
                };
                ctx.dsend(&m.answer_mailbox, msg::FileDeleteAnswer { file: m.file, result });
            }
            Message::FileLookup(m) => {
                let found = files.contains(&m.file.id);
                ctx.dsend(&m.answer_mailbox, msg::FileLookupAnswer { file: m.file, found });
            }
            Message::FileCopy(m) => {
                let result = if m.src_mailbox == mailbox {
                    // local copy is a no-op as long as the file is here
                    if files.contains(&m.file.id) {
                        Ok(())
                    } else {
                        Err(FailureCause::FileNotFound {
                            file: m.file.id.clone(),
                            service: name.clone(),
                        })
                    }
                } else {
                    copy_from(&ctx, &name, &m, &mut files, &mut used, capacity, bandwidth).await
                };
                ctx.dsend(
                    &m.answer_mailbox,
                    msg::FileCopyAnswer {
                        file: m.file,
                        dst_mailbox: mailbox.clone(),
                        result,
                    },
                );
            }
            Message::StopDaemon(m) => {
                ctx.dsend(&m.ack_mailbox, msg::DaemonStopped { service: name.clone() });
                break;
            }
            other => {
                warn!(service = %name, kind = other.kind(), "storage service ignoring message");
            }
        }
    }
    info!(service = %name, "storage service terminated");
    Ok(())
}

async fn store(
    ctx: &SimHandle,
    name: &str,
    files: &mut HashSet<String>,
    used: &mut f64,
    capacity: f64,
    bandwidth: f64,
    file: &FileRef,
) -> std::result::Result<(), FailureCause> {
    if !files.contains(&file.id) && *used + file.size > capacity {
        return Err(FailureCause::StorageFull { service: name.to_owned() });
    }
    ctx.sleep(transfer_time(file.size, bandwidth)).await;
    if files.insert(file.id.clone()) {
        *used += file.size;
    }
    Ok(())
}

async fn copy_from(
    ctx: &SimHandle,
    name: &str,
    m: &msg::FileCopy,
    files: &mut HashSet<String>,
    used: &mut f64,
    capacity: f64,
    bandwidth: f64,
) -> std::result::Result<(), FailureCause> {
    // confirm the source actually holds the file before charging transfer time
    let reply = super::request_answer(ctx, &m.src_mailbox, |answer_mailbox| {
        msg::FileLookup {
            file: m.file.clone(),
            answer_mailbox,
        }
        .into()
    })
    .await?;
    let found = match reply {
        Message::FileLookupAnswer(a) => a.found,
        other => return Err(super::unexpected_reply("FileLookupAnswer", &other)),
    };
    if !found {
        return Err(FailureCause::FileNotFound {
            file: m.file.id.clone(),
            service: m.src_mailbox.clone(),
        });
    }
    store(ctx, name, files, used, capacity, bandwidth, &m.file).await
}

fn transfer_time(bytes: f64, bandwidth: f64) -> Duration {
    if bandwidth > 0.0 {
        Duration(bytes / bandwidth)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::sim::{EndCondition, Host, Kernel, NetworkConfig};
    use crate::workflow::WorkflowFile;

    fn setup() -> (Kernel, StorageServiceHandle) {
        let kernel = Kernel::new(NetworkConfig::default());
        kernel.add_host(Host {
            name: "h".into(),
            cores: 1,
            flop_rate: 1e9,
            ram: 0.0,
        });
        let handle = start(&kernel, "store", "h", "/", 1000.0, 100.0);
        (kernel, handle)
    }

    fn file(id: &str, size: f64) -> FileRef {
        Rc::new(WorkflowFile { id: id.into(), size })
    }

    #[test]
    fn write_then_read() {
        let (mut kernel, store) = setup();
        let log: Rc<RefCell<Vec<f64>>> = Default::default();
        let l = log.clone();
        kernel.spawn("client", "h", false, None, move |ctx| async move {
            let f = file("data", 500.0);
            store.write_file(&ctx, &f).await?;
            l.borrow_mut().push(ctx.now().0);
            store.read_file(&ctx, &f).await?;
            l.borrow_mut().push(ctx.now().0);
            Ok(())
        });
        kernel.run(EndCondition::NoEvents);
        // 500 bytes at 100 B/s, once for the write and once for the read
        assert_eq!(*log.borrow(), vec![5.0, 10.0]);
    }

    #[test]
    fn read_missing_file_fails() {
        let (mut kernel, store) = setup();
        let out: Rc<RefCell<Vec<bool>>> = Default::default();
        let o = out.clone();
        kernel.spawn("client", "h", false, None, move |ctx| async move {
            let r = store.read_file(&ctx, &file("ghost", 1.0)).await;
            o.borrow_mut().push(matches!(r, Err(FailureCause::FileNotFound { .. })));
            Ok(())
        });
        kernel.run(EndCondition::NoEvents);
        assert_eq!(*out.borrow(), vec![true]);
    }

    #[test]
    fn capacity_is_enforced() {
        let (mut kernel, store) = setup();
        let out: Rc<RefCell<Vec<bool>>> = Default::default();
        let o = out.clone();
        kernel.spawn("client", "h", false, None, move |ctx| async move {
            store.write_file(&ctx, &file("big", 900.0)).await?;
            let r = store.write_file(&ctx, &file("more", 200.0)).await;
            o.borrow_mut().push(matches!(r, Err(FailureCause::StorageFull { .. })));
            Ok(())
        });
        kernel.run(EndCondition::NoEvents);
        assert_eq!(*out.borrow(), vec![true]);
    }

    #[test]
    fn copy_between_services() {
        let (mut kernel, src) = setup();
        let dst = start(&kernel, "other", "h", "/scratch", 1000.0, 100.0);
        let out: Rc<RefCell<Vec<bool>>> = Default::default();
        let o = out.clone();
        kernel.spawn("client", "h", false, None, move |ctx| async move {
            let f = file("data", 300.0);
            src.write_file(&ctx, &f).await?;
            dst.copy_file(&ctx, &f, &src).await?;
            o.borrow_mut().push(dst.lookup_file(&ctx, &f).await?);
            Ok(())
        });
        kernel.run(EndCondition::NoEvents);
        assert_eq!(*out.borrow(), vec![true]);
    }
}
