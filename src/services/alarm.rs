//! One-shot alarm actor: sleep until a simulated date, then post a payload.
//!
//! Used for walltime enforcement and pilot-lease expiration. Alarms created
//! at the same date fire in creation order.

use crate::messages::Message;
use crate::sim::{ActorId, SimHandle};
use crate::types::Time;
use crate::utils::prelude::*;

/// Start an alarm on `host` that sends `payload` to `reply_mailbox` at `date`.
///
/// A date at or before the current time fires immediately. If the reply
/// mailbox is gone by then, the failure is logged and swallowed.
pub fn start(
    ctx: &SimHandle,
    date: Time,
    host: &str,
    reply_mailbox: &str,
    payload: impl Into<Message>,
    suffix: &str,
) -> ActorId {
    let name = format!("alarm_{}", suffix);
    let reply_mailbox = reply_mailbox.to_owned();
    let payload = payload.into();
    ctx.spawn(&name, host, true, None, move |actor| async move {
        if date <= actor.now() {
            info!(%date, now = %actor.now(), "alarm date already passed, notifying immediately");
        }
        actor.sleep_until(date).await;
        if let Err(cause) = actor.send(&reply_mailbox, payload).await {
            warn!(mailbox = %reply_mailbox, %cause, "alarm could not deliver its notification");
        }
        Ok(())
    })
}
