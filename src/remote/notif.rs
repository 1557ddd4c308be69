//! Asynchronous notifications and the queue of not yet delivered stop replies.

use crate::remote::error::Error;
use crate::remote::ptid::ThreadId;
use crate::remote::session::Session;
use crate::remote::stop::StopReply;
use crate::{rsp_debug, rsp_warn};
use std::collections::{HashSet, VecDeque};

/// Acknowledgement request of the `Stop` notification, asks for the next pending event.
const STOP_ACK: &[u8] = b"vStopped";
const STOP_NOTIFICATION: &[u8] = b"Stop:";

/// FIFO of stop replies. Order is preserved per thread.
#[derive(Default, Debug)]
pub struct StopQueue {
    entries: VecDeque<StopReply>,
    /// A `Stop` notification was received and the `vStopped` sequence is not finished.
    ack_pending: bool,
    /// Edge-triggered readiness, set when entries remain after a poll.
    wake: bool,
}

impl StopQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reply: StopReply) {
        rsp_debug!(target: "notif", "queue stop reply: {reply}");
        self.entries.push_back(reply);
        self.wake = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StopReply> {
        self.entries.iter()
    }

    /// Parse an out-of-band notification. Unknown notifications are ignored.
    pub fn handle_notification(
        &mut self,
        payload: &[u8],
        default_pid: Option<i64>,
    ) -> Result<(), Error> {
        let Some(body) = payload.strip_prefix(STOP_NOTIFICATION) else {
            rsp_warn!(target: "notif", "unknown notification ignored: {}", String::from_utf8_lossy(payload));
            return Ok(());
        };

        if self.ack_pending {
            // the stub repeats an event already in the acknowledgement sequence
            rsp_debug!(target: "notif", "stop notification while ack is pending, ignored");
            return Ok(());
        }

        let reply = StopReply::parse(body, default_pid)?;
        self.push(reply);
        self.ack_pending = true;
        Ok(())
    }

    /// Process received notifications and acknowledge them. Every pending event
    /// is requested with `vStopped` until the stub answers `OK`.
    pub fn drain(&mut self, session: &mut Session, default_pid: Option<i64>) -> Result<(), Error> {
        while let Some(raw) = session.take_notification() {
            self.handle_notification(&raw, default_pid)?;
        }

        while self.ack_pending {
            let reply = session.exchange(STOP_ACK)?;
            if reply == "OK" {
                self.ack_pending = false;
                break;
            }
            match StopReply::parse(&reply, default_pid) {
                Ok(stop) => self.push(stop),
                Err(e) => {
                    self.ack_pending = false;
                    return Err(e);
                }
            }
        }

        // repeated notifications of events that `vStopped` already reported
        while let Some(raw) = session.take_notification() {
            rsp_debug!(target: "notif", "drop repeated notification: {}", String::from_utf8_lossy(&raw));
        }
        Ok(())
    }

    /// Remove and return the oldest reply matching `filter` (thread, process or wildcard).
    /// If entries remain, wake flag is set.
    pub fn queued_for(&mut self, filter: ThreadId) -> Option<StopReply> {
        let idx = self
            .entries
            .iter()
            .position(|r| r.ptid.is_null() || filter.matches(r.ptid))?;
        let reply = self.entries.remove(idx);
        self.wake = !self.entries.is_empty();
        reply
    }

    /// True if a reply matching `filter` is queued.
    pub fn has_queued_for(&self, filter: ThreadId) -> bool {
        self.entries
            .iter()
            .any(|r| r.ptid.is_null() || filter.matches(r.ptid))
    }

    /// Return true once after the queue became non-empty.
    pub fn take_wake(&mut self) -> bool {
        std::mem::take(&mut self.wake)
    }

    /// Pids of processes with a queued fork or vfork event.
    pub fn pending_fork_pids(&self) -> HashSet<i64> {
        self.entries
            .iter()
            .filter(|r| r.fork_child().is_some())
            .map(|r| r.ptid.pid)
            .collect()
    }

    /// Children of queued fork and vfork events.
    pub fn pending_fork_children(&self) -> HashSet<ThreadId> {
        self.entries.iter().filter_map(StopReply::fork_child).collect()
    }

    /// Drop replies of a process, used when it is killed or detached.
    pub fn discard(&mut self, pid: i64) {
        let before = self.entries.len();
        self.entries.retain(|r| r.ptid.pid != pid);
        if before != self.entries.len() {
            rsp_debug!(target: "notif", "discard {} stop replies of process {pid}", before - self.entries.len());
        }
    }
}
