//! The actor-side facade: `SimHandle` is what an actor's `main` future holds.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::FutureExt;
use thiserror::Error;

use super::{ActorId, EventKind, SimState};
use crate::failure::FailureCause;
use crate::messages::Message;
use crate::types::{Duration, Time};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecvError {
    #[error("receive timed out")]
    Timeout,
    #[error("mailbox {0} is gone")]
    MailboxGone(String),
}

impl From<RecvError> for FailureCause {
    fn from(err: RecvError) -> Self {
        FailureCause::network(format!("receiving: {}", err))
    }
}

/// An actor's capability handle into the kernel.
///
/// Cheap to clone; all suspension points of the concurrency model go through
/// here: `send`, `dsend`, `recv`, `sleep`, `compute`.
#[derive(Clone)]
pub struct SimHandle {
    pub(crate) state: Rc<RefCell<SimState>>,
    id: ActorId,
    name: String,
    host: String,
}

pub(crate) fn spawn_in<F, Fut>(
    state: &Rc<RefCell<SimState>>,
    name: &str,
    host: &str,
    daemon: bool,
    mailbox: Option<&str>,
    f: F,
) -> ActorId
where
    F: FnOnce(SimHandle) -> Fut,
    Fut: Future<Output = std::result::Result<(), FailureCause>> + 'static,
{
    let id = state.borrow_mut().stage_spawn(name, host, daemon, mailbox);
    let handle = SimHandle {
        state: state.clone(),
        id,
        name: name.to_owned(),
        host: host.to_owned(),
    };
    let fut = f(handle).boxed_local();
    state.borrow_mut().spawned.push((id, fut));
    id
}

impl SimHandle {
    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn now(&self) -> Time {
        self.state.borrow().time
    }

    /// Per-core flop rate of the host this actor runs on.
    pub fn flop_rate(&self) -> std::result::Result<f64, FailureCause> {
        self.flop_rate_of(&self.host)
    }

    pub fn flop_rate_of(&self, host: &str) -> std::result::Result<f64, FailureCause> {
        self.state
            .borrow()
            .host(host)
            .map(|h| h.flop_rate)
            .ok_or_else(|| FailureCause::HostFailure { host: host.to_owned() })
    }

    pub fn host_cores(&self, host: &str) -> std::result::Result<u64, FailureCause> {
        self.state
            .borrow()
            .host(host)
            .map(|h| h.cores)
            .ok_or_else(|| FailureCause::HostFailure { host: host.to_owned() })
    }

    pub fn host_ram(&self, host: &str) -> std::result::Result<f64, FailureCause> {
        self.state
            .borrow()
            .host(host)
            .map(|h| h.ram)
            .ok_or_else(|| FailureCause::HostFailure { host: host.to_owned() })
    }

    /// Spawn a child actor. Its mailbox, if given, exists before its first poll.
    pub fn spawn<F, Fut>(&self, name: &str, host: &str, daemon: bool, mailbox: Option<&str>, f: F) -> ActorId
    where
        F: FnOnce(SimHandle) -> Fut,
        Fut: Future<Output = std::result::Result<(), FailureCause>> + 'static,
    {
        spawn_in(&self.state, name, host, daemon, mailbox, f)
    }

    /// Forcibly terminate an actor: its future is dropped, cancelling
    /// in-flight compute and I/O, and its mailboxes disappear.
    pub fn kill(&self, id: ActorId) {
        self.state.borrow_mut().killed.push(id);
    }

    pub fn register_mailbox(&self, name: &str) {
        self.state.borrow_mut().register_mailbox(name, Some(self.id));
    }

    pub fn mailbox_exists(&self, name: &str) -> bool {
        self.state.borrow().mailbox_exists(name)
    }

    /// A fresh simulation-wide unique number, for naming helper actors.
    pub fn unique_id(&self) -> u64 {
        self.state.borrow_mut().unique_suffix()
    }

    /// A uniquely-named mailbox owned by this actor, removed on drop.
    pub fn temp_mailbox(&self, prefix: &str) -> TempMailbox {
        let mut st = self.state.borrow_mut();
        let name = format!("{}_{}", prefix, st.unique_suffix());
        st.register_mailbox(&name, Some(self.id));
        TempMailbox {
            state: self.state.clone(),
            name,
        }
    }

    /// Synchronous send: resumes after the simulated transfer delay.
    pub fn send(&self, mailbox: &str, message: impl Into<Message>) -> Send {
        let message = message.into();
        let bytes = message.default_payload();
        self.send_sized(mailbox, message, bytes)
    }

    pub fn send_sized(&self, mailbox: &str, message: impl Into<Message>, payload_bytes: u64) -> Send {
        Send {
            state: self.state.clone(),
            id: self.id,
            mailbox: mailbox.to_owned(),
            message: Some(message.into()),
            payload_bytes,
            arrival: None,
        }
    }

    /// Detached send: fire and forget, delivery ordering w.r.t. this actor's
    /// subsequent operations is preserved.
    pub fn dsend(&self, mailbox: &str, message: impl Into<Message>) {
        let message = message.into();
        let bytes = message.default_payload();
        self.dsend_sized(mailbox, message, bytes)
    }

    pub fn dsend_sized(&self, mailbox: &str, message: impl Into<Message>, payload_bytes: u64) {
        let mut st = self.state.borrow_mut();
        let arrival = st.time + st.network.transfer_delay(payload_bytes);
        st.schedule(
            arrival,
            EventKind::Deliver {
                mailbox: mailbox.to_owned(),
                message: message.into(),
            },
        );
    }

    /// Block until the next message on `mailbox`.
    pub fn recv(&self, mailbox: &str) -> Recv {
        Recv {
            state: self.state.clone(),
            id: self.id,
            mailbox: mailbox.to_owned(),
            deadline: None,
            timer_registered: false,
        }
    }

    /// Block for at most `timeout` of simulated time.
    pub fn recv_timeout(&self, mailbox: &str, timeout: Duration) -> Recv {
        let deadline = self.now() + timeout.non_negative();
        Recv {
            state: self.state.clone(),
            id: self.id,
            mailbox: mailbox.to_owned(),
            deadline: Some(deadline),
            timer_registered: false,
        }
    }

    pub fn sleep(&self, duration: Duration) -> Sleep {
        self.sleep_until(self.now() + duration.non_negative())
    }

    pub fn sleep_until(&self, until: Time) -> Sleep {
        Sleep {
            state: self.state.clone(),
            id: self.id,
            until,
            registered: false,
        }
    }

    /// Consume simulated CPU: `flops` of work spread over `cores` cores at
    /// the given parallel efficiency, on this actor's host.
    pub async fn compute(&self, flops: f64, cores: u64, efficiency: f64) -> std::result::Result<(), FailureCause> {
        let rate = self.flop_rate()?;
        let cores = cores.max(1) as f64;
        let eff = if efficiency > 0.0 { efficiency } else { 1.0 };
        self.sleep(Duration(flops / (rate * cores * eff))).await;
        Ok(())
    }
}

/// Guard for a temporary (answer) mailbox.
pub struct TempMailbox {
    state: Rc<RefCell<SimState>>,
    name: String,
}

impl TempMailbox {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TempMailbox {
    fn drop(&mut self) {
        self.state.borrow_mut().remove_mailbox(&self.name);
    }
}

pub struct Sleep {
    state: Rc<RefCell<SimState>>,
    id: ActorId,
    until: Time,
    registered: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let mut st = this.state.borrow_mut();
        if st.time >= this.until {
            return Poll::Ready(());
        }
        if !this.registered {
            st.schedule(this.until, EventKind::Wake(this.id));
            this.registered = true;
        }
        Poll::Pending
    }
}

pub struct Recv {
    state: Rc<RefCell<SimState>>,
    id: ActorId,
    mailbox: String,
    deadline: Option<Time>,
    timer_registered: bool,
}

impl Future for Recv {
    type Output = Result<Message, RecvError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut st = this.state.borrow_mut();
        let now = st.time;

        let slot = match st.waiter_slot(&this.mailbox) {
            None => return Poll::Ready(Err(RecvError::MailboxGone(this.mailbox.clone()))),
            Some(slot) => slot,
        };
        if let Some(message) = slot.pop() {
            slot.clear_waiter(this.id);
            return Poll::Ready(Ok(message));
        }
        if let Some(deadline) = this.deadline {
            if now >= deadline {
                slot.clear_waiter(this.id);
                return Poll::Ready(Err(RecvError::Timeout));
            }
        }
        slot.set_waiter(this.id);
        if let Some(deadline) = this.deadline {
            if !this.timer_registered {
                st.schedule(deadline, EventKind::Wake(this.id));
                this.timer_registered = true;
            }
        }
        Poll::Pending
    }
}

pub struct Send {
    state: Rc<RefCell<SimState>>,
    id: ActorId,
    mailbox: String,
    message: Option<Message>,
    payload_bytes: u64,
    arrival: Option<Time>,
}

impl Future for Send {
    type Output = std::result::Result<(), FailureCause>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut st = this.state.borrow_mut();

        match this.arrival {
            None => {
                if !st.mailbox_exists(&this.mailbox) {
                    return Poll::Ready(Err(FailureCause::network(format!(
                        "sending to {}",
                        this.mailbox
                    ))));
                }
                let delay = st.network.transfer_delay(this.payload_bytes);
                let arrival = st.time + delay;
                if arrival <= st.time {
                    let message = this.message.take().expect("send polled after completion");
                    return if st.deliver(&this.mailbox, message) {
                        Poll::Ready(Ok(()))
                    } else {
                        Poll::Ready(Err(FailureCause::network(format!("sending to {}", this.mailbox))))
                    };
                }
                st.schedule(arrival, EventKind::Wake(this.id));
                this.arrival = Some(arrival);
                Poll::Pending
            }
            Some(arrival) => {
                if st.time < arrival {
                    return Poll::Pending;
                }
                let message = this.message.take().expect("send polled after completion");
                if st.deliver(&this.mailbox, message) {
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Ready(Err(FailureCause::network(format!("sending to {}", this.mailbox))))
                }
            }
        }
    }
}
