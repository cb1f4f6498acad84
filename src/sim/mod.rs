//! The deterministic cooperative kernel every actor runs on.
//!
//! Actors are futures polled with a no-op waker; the kernel multiplexes them
//! over simulated time through a future-event list. Every `Pending` poll has
//! registered a wake condition first (a timer event or a mailbox arrival), so
//! a run is fully determined by the event order: events tie-break by creation
//! sequence, which gives per-mailbox FIFO and creation-ordered alarms.

use std::cell::RefCell;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;

use crate::messages::Message;
use crate::types::Time;
use crate::utils::prelude::*;

mod context;
mod platform;

pub use context::{RecvError, SimHandle, TempMailbox};
pub use platform::{Host, NetworkConfig};

pub type ActorId = u64;

/// When to stop driving the event loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EndCondition {
    /// Run until the future-event list is exhausted
    NoEvents,
    /// Run until simulated time would pass this point
    Time(Time),
}

pub(crate) enum EventKind {
    /// Wake a suspended actor (timer expiry, send completion)
    Wake(ActorId),
    /// Detached message delivery
    Deliver { mailbox: String, message: Message },
}

pub(crate) struct TimedEvent {
    pub(crate) time: Time,
    pub(crate) seq: u64,
    pub(crate) kind: EventKind,
}

impl PartialEq for TimedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for TimedEvent {}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.time, self.seq).cmp(&(other.time, other.seq))
    }
}

struct MailboxSlot {
    owner: Option<ActorId>,
    queue: VecDeque<Message>,
    waiter: Option<ActorId>,
}

struct ActorMeta {
    name: String,
    #[allow(dead_code)]
    host: String,
    #[allow(dead_code)]
    daemon: bool,
    alive: bool,
}

type ActorFuture = LocalBoxFuture<'static, std::result::Result<(), crate::failure::FailureCause>>;

pub(crate) struct SimState {
    pub(crate) time: Time,
    seq: u64,
    events: BinaryHeap<Reverse<TimedEvent>>,
    mailboxes: HashMap<String, MailboxSlot>,
    actors: HashMap<ActorId, ActorMeta>,
    runnable: VecDeque<ActorId>,
    in_runnable: HashSet<ActorId>,
    next_actor_id: ActorId,
    next_unique: u64,
    spawned: Vec<(ActorId, ActorFuture)>,
    killed: Vec<ActorId>,
    hosts: Vec<platform::Host>,
    host_index: HashMap<String, usize>,
    pub(crate) network: platform::NetworkConfig,
    delivered: Vec<(Time, &'static str, String)>,
}

impl SimState {
    pub(crate) fn schedule(&mut self, time: Time, kind: EventKind) {
        self.seq += 1;
        self.events.push(Reverse(TimedEvent { time, seq: self.seq, kind }));
    }

    pub(crate) fn make_runnable(&mut self, id: ActorId) {
        let alive = self.actors.get(&id).map(|a| a.alive).unwrap_or(false);
        if alive && self.in_runnable.insert(id) {
            self.runnable.push_back(id);
        }
    }

    /// Push a message onto a mailbox and wake its waiter, if any.
    /// Returns false when the mailbox no longer exists.
    pub(crate) fn deliver(&mut self, mailbox: &str, message: Message) -> bool {
        let time = self.time;
        let kind = message.kind();
        let waiter = match self.mailboxes.get_mut(mailbox) {
            None => {
                debug!(%time, mailbox, kind, "dropping message to gone mailbox");
                return false;
            }
            Some(slot) => {
                slot.queue.push_back(message);
                slot.waiter.take()
            }
        };
        self.delivered.push((time, kind, mailbox.to_owned()));
        if let Some(w) = waiter {
            self.make_runnable(w);
        }
        true
    }

    pub(crate) fn mailbox_exists(&self, name: &str) -> bool {
        self.mailboxes.contains_key(name)
    }

    pub(crate) fn register_mailbox(&mut self, name: &str, owner: Option<ActorId>) {
        assert!(
            !self.mailboxes.contains_key(name),
            "mailbox {} registered twice",
            name
        );
        self.mailboxes.insert(
            name.to_owned(),
            MailboxSlot {
                owner,
                queue: VecDeque::new(),
                waiter: None,
            },
        );
    }

    pub(crate) fn remove_mailbox(&mut self, name: &str) {
        self.mailboxes.remove(name);
    }

    pub(crate) fn unique_suffix(&mut self) -> u64 {
        self.next_unique += 1;
        self.next_unique
    }

    pub(crate) fn host(&self, name: &str) -> Option<&platform::Host> {
        self.host_index.get(name).map(|&i| &self.hosts[i])
    }

    pub(crate) fn stage_spawn(
        &mut self,
        name: &str,
        host: &str,
        daemon: bool,
        mailbox: Option<&str>,
    ) -> ActorId {
        self.next_actor_id += 1;
        let id = self.next_actor_id;
        self.actors.insert(
            id,
            ActorMeta {
                name: name.to_owned(),
                host: host.to_owned(),
                daemon,
                alive: true,
            },
        );
        if let Some(mb) = mailbox {
            self.register_mailbox(mb, Some(id));
        }
        id
    }

    fn cleanup_actor(&mut self, id: ActorId) {
        if let Some(meta) = self.actors.get_mut(&id) {
            meta.alive = false;
        }
        self.mailboxes.retain(|_, slot| slot.owner != Some(id));
        for slot in self.mailboxes.values_mut() {
            if slot.waiter == Some(id) {
                slot.waiter = None;
            }
        }
    }

    pub(crate) fn waiter_slot(&mut self, mailbox: &str) -> Option<&mut MailboxSlot> {
        self.mailboxes.get_mut(mailbox)
    }
}

impl MailboxSlot {
    pub(crate) fn pop(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    pub(crate) fn set_waiter(&mut self, id: ActorId) {
        match self.waiter {
            None => self.waiter = Some(id),
            Some(w) if w == id => {}
            Some(w) => panic!("mailbox already has waiter {} (second: {})", w, id),
        }
    }

    pub(crate) fn clear_waiter(&mut self, id: ActorId) {
        if self.waiter == Some(id) {
            self.waiter = None;
        }
    }
}

/// The simulation kernel: owns the shared state and the actor futures.
pub struct Kernel {
    state: Rc<RefCell<SimState>>,
    tasks: HashMap<ActorId, ActorFuture>,
}

impl Kernel {
    pub fn new(network: platform::NetworkConfig) -> Self {
        Kernel {
            state: Rc::new(RefCell::new(SimState {
                time: Time::ZERO,
                seq: 0,
                events: BinaryHeap::new(),
                mailboxes: HashMap::new(),
                actors: HashMap::new(),
                runnable: VecDeque::new(),
                in_runnable: HashSet::new(),
                next_actor_id: 0,
                next_unique: 0,
                spawned: vec![],
                killed: vec![],
                hosts: vec![],
                host_index: HashMap::new(),
                network,
                delivered: vec![],
            })),
            tasks: HashMap::new(),
        }
    }

    pub fn add_host(&self, host: platform::Host) {
        let mut st = self.state.borrow_mut();
        assert!(
            !st.host_index.contains_key(&host.name),
            "host {} declared twice",
            host.name
        );
        let index = st.hosts.len();
        st.host_index.insert(host.name.clone(), index);
        st.hosts.push(host);
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.state.borrow().hosts.iter().map(|h| h.name.clone()).collect()
    }

    pub fn host_record(&self, name: &str) -> Option<platform::Host> {
        self.state.borrow().host(name).cloned()
    }

    pub fn now(&self) -> Time {
        self.state.borrow().time
    }

    /// Spawn an actor bound to a host, registering `mailbox` for it up front
    /// so messages sent before its first poll are not lost.
    pub fn spawn<F, Fut>(&self, name: &str, host: &str, daemon: bool, mailbox: Option<&str>, f: F) -> ActorId
    where
        F: FnOnce(SimHandle) -> Fut,
        Fut: Future<Output = std::result::Result<(), crate::failure::FailureCause>> + 'static,
    {
        context::spawn_in(&self.state, name, host, daemon, mailbox, f)
    }

    /// Messages delivered so far, as `(time, variant, mailbox)` triples.
    pub fn delivered_log(&self) -> Vec<(Time, &'static str, String)> {
        self.state.borrow().delivered.clone()
    }

    fn drain_staged(&mut self) {
        loop {
            let (spawned, killed) = {
                let mut st = self.state.borrow_mut();
                (std::mem::take(&mut st.spawned), std::mem::take(&mut st.killed))
            };
            if spawned.is_empty() && killed.is_empty() {
                break;
            }
            for (id, fut) in spawned {
                self.tasks.insert(id, fut);
                self.state.borrow_mut().make_runnable(id);
            }
            for id in killed {
                // dropping the future cancels anything in flight
                let fut = self.tasks.remove(&id);
                drop(fut);
                let mut st = self.state.borrow_mut();
                if let Some(meta) = st.actors.get(&id) {
                    if meta.alive {
                        let name = meta.name.clone();
                        debug!(time = %st.time, actor = %name, "actor killed");
                    }
                }
                st.cleanup_actor(id);
            }
        }
    }

    fn next_runnable(&mut self) -> Option<ActorId> {
        let mut st = self.state.borrow_mut();
        while let Some(id) = st.runnable.pop_front() {
            st.in_runnable.remove(&id);
            if st.actors.get(&id).map(|a| a.alive).unwrap_or(false) {
                return Some(id);
            }
        }
        None
    }

    fn poll_actor(&mut self, id: ActorId) {
        let mut fut = match self.tasks.remove(&id) {
            Some(f) => f,
            None => return,
        };
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        match fut.as_mut().poll(&mut cx) {
            Poll::Pending => {
                self.tasks.insert(id, fut);
            }
            Poll::Ready(result) => {
                drop(fut);
                let mut st = self.state.borrow_mut();
                let name = st.actors.get(&id).map(|a| a.name.clone()).unwrap_or_default();
                match result {
                    Ok(()) => debug!(time = %st.time, actor = %name, "actor terminated"),
                    Err(cause) => warn!(time = %st.time, actor = %name, %cause, "actor failed"),
                }
                st.cleanup_actor(id);
            }
        }
    }

    /// Drive the simulation until the end condition holds.
    pub fn run(&mut self, until: EndCondition) {
        loop {
            self.drain_staged();
            while let Some(id) = self.next_runnable() {
                self.poll_actor(id);
                self.drain_staged();
            }

            let popped = self.state.borrow_mut().events.pop();
            let Reverse(event) = match popped {
                Some(e) => e,
                None => break,
            };
            if let EndCondition::Time(max) = until {
                if event.time > max {
                    let mut st = self.state.borrow_mut();
                    st.time = max;
                    st.events.push(Reverse(event));
                    break;
                }
            }
            let mut st = self.state.borrow_mut();
            debug_assert!(event.time >= st.time, "event time went backwards");
            st.time = event.time;
            match event.kind {
                EventKind::Wake(id) => st.make_runnable(id),
                EventKind::Deliver { mailbox, message } => {
                    st.deliver(&mailbox, message);
                }
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::msg;
    use crate::types::Duration;

    #[test]
    fn sleep_advances_time() {
        let mut kernel = Kernel::new(NetworkConfig::default());
        kernel.add_host(Host {
            name: "h".into(),
            cores: 1,
            flop_rate: 1e9,
            ram: 0.0,
        });
        let done: Rc<RefCell<Vec<f64>>> = Default::default();
        let d = done.clone();
        kernel.spawn("sleeper", "h", false, None, move |ctx| async move {
            ctx.sleep(Duration(2.5)).await;
            d.borrow_mut().push(ctx.now().0);
            Ok(())
        });
        kernel.run(EndCondition::NoEvents);
        assert_eq!(*done.borrow(), vec![2.5]);
        assert_eq!(kernel.now(), Time(2.5));
    }

    #[test]
    fn send_recv_roundtrip() {
        let mut kernel = Kernel::new(NetworkConfig::default());
        kernel.add_host(Host {
            name: "h".into(),
            cores: 1,
            flop_rate: 1e9,
            ram: 0.0,
        });
        let got: Rc<RefCell<Vec<String>>> = Default::default();
        let g = got.clone();
        kernel.spawn("receiver", "h", false, Some("inbox"), move |ctx| async move {
            let m = ctx.recv("inbox").await.unwrap();
            g.borrow_mut().push(m.kind().to_owned());
            Ok(())
        });
        kernel.spawn("sender", "h", false, None, |ctx| async move {
            ctx.send("inbox", msg::DaemonStopped { service: "x".into() }).await?;
            Ok(())
        });
        kernel.run(EndCondition::NoEvents);
        assert_eq!(*got.borrow(), vec!["DaemonStopped".to_owned()]);
    }

    #[test]
    fn recv_timeout_fires() {
        let mut kernel = Kernel::new(NetworkConfig::default());
        kernel.add_host(Host {
            name: "h".into(),
            cores: 1,
            flop_rate: 1e9,
            ram: 0.0,
        });
        let out: Rc<RefCell<Vec<(f64, bool)>>> = Default::default();
        let o = out.clone();
        kernel.spawn("waiter", "h", false, Some("mb"), move |ctx| async move {
            let r = ctx.recv_timeout("mb", Duration(3.0)).await;
            o.borrow_mut().push((ctx.now().0, r.is_err()));
            Ok(())
        });
        kernel.run(EndCondition::NoEvents);
        assert_eq!(*out.borrow(), vec![(3.0, true)]);
    }

    #[test]
    fn messages_are_fifo_per_mailbox() {
        let mut kernel = Kernel::new(NetworkConfig::default());
        kernel.add_host(Host {
            name: "h".into(),
            cores: 1,
            flop_rate: 1e9,
            ram: 0.0,
        });
        let got: Rc<RefCell<Vec<String>>> = Default::default();
        let g = got.clone();
        kernel.spawn("receiver", "h", false, Some("inbox"), move |ctx| async move {
            for _ in 0..2 {
                let m = ctx.recv("inbox").await.unwrap();
                match m {
                    Message::DaemonStopped(inner) => g.borrow_mut().push(inner.service),
                    _ => unreachable!(),
                }
            }
            Ok(())
        });
        kernel.spawn("sender", "h", false, None, |ctx| async move {
            ctx.dsend("inbox", msg::DaemonStopped { service: "first".into() });
            ctx.dsend("inbox", msg::DaemonStopped { service: "second".into() });
            Ok(())
        });
        kernel.run(EndCondition::NoEvents);
        assert_eq!(*got.borrow(), vec!["first".to_owned(), "second".to_owned()]);
    }

    #[test]
    fn transfer_delay_applies() {
        let mut kernel = Kernel::new(NetworkConfig {
            latency: 0.0,
            bandwidth: Some(1024.0),
        });
        kernel.add_host(Host {
            name: "h".into(),
            cores: 1,
            flop_rate: 1e9,
            ram: 0.0,
        });
        let at: Rc<RefCell<Vec<f64>>> = Default::default();
        let a = at.clone();
        kernel.spawn("receiver", "h", false, Some("inbox"), move |ctx| async move {
            ctx.recv("inbox").await.unwrap();
            a.borrow_mut().push(ctx.now().0);
            Ok(())
        });
        kernel.spawn("sender", "h", false, None, |ctx| async move {
            // 1024 bytes over 1024 B/s takes one simulated second
            ctx.send("inbox", msg::DaemonStopped { service: "x".into() }).await?;
            Ok(())
        });
        kernel.run(EndCondition::NoEvents);
        assert_eq!(*at.borrow(), vec![1.0]);
    }

    #[test]
    fn end_condition_time_stops_early() {
        let mut kernel = Kernel::new(NetworkConfig::default());
        kernel.add_host(Host {
            name: "h".into(),
            cores: 1,
            flop_rate: 1e9,
            ram: 0.0,
        });
        kernel.spawn("sleeper", "h", false, None, |ctx| async move {
            ctx.sleep(Duration(100.0)).await;
            Ok(())
        });
        kernel.run(EndCondition::Time(Time(10.0)));
        assert_eq!(kernel.now(), Time(10.0));
    }

    #[test]
    fn kill_cancels_sleep() {
        let mut kernel = Kernel::new(NetworkConfig::default());
        kernel.add_host(Host {
            name: "h".into(),
            cores: 1,
            flop_rate: 1e9,
            ram: 0.0,
        });
        let finished: Rc<RefCell<bool>> = Default::default();
        let f = finished.clone();
        let victim = kernel.spawn("victim", "h", false, None, move |ctx| async move {
            ctx.sleep(Duration(100.0)).await;
            *f.borrow_mut() = true;
            Ok(())
        });
        kernel.spawn("killer", "h", false, None, move |ctx| async move {
            ctx.sleep(Duration(1.0)).await;
            ctx.kill(victim);
            Ok(())
        });
        kernel.run(EndCondition::NoEvents);
        assert!(!*finished.borrow());
    }
}
