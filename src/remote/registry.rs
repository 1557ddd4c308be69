//! Local model of remote threads and processes (inferiors).

use crate::remote::ptid::{ThreadId, MAGIC_PID};
use crate::remote::stop::{ExpeditedRegister, StopKind, StopReason, StopReply};
use indexmap::IndexMap;
use crate::rsp_debug;
use std::collections::HashSet;
use std::ops::Range;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadState {
    Stopped,
    Running,
}

/// Resumption request of a single thread.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ResumeRequest {
    pub step: bool,
    pub signal: Option<u8>,
    /// Address range for range-stepping.
    pub range: Option<Range<u64>>,
}

/// Thread known to the client.
#[derive(Clone, Debug)]
pub struct ThreadInfo {
    pub ptid: ThreadId,
    /// Local thread number, unique for the session lifetime.
    pub num: u32,
    pub state: ThreadState,
    /// Resumption requested but not yet sent (non-stop mode).
    pub resume_pending: Option<ResumeRequest>,
    /// Parameters of the last sent resumption.
    pub last_resume: ResumeRequest,
    /// Signal to deliver on the next resume.
    pub pending_signal: Option<u8>,
    pub stop_reason: Option<StopReason>,
    pub watch_addr: Option<u64>,
    pub core: Option<u32>,
    pub name: Option<String>,
    pub extra_info: Option<String>,
    /// Opaque thread handle reported by the stub.
    pub handle: Option<Vec<u8>>,
    /// Registers reported with the last stop.
    pub expedited: Vec<ExpeditedRegister>,
}

impl ThreadInfo {
    pub fn pid(&self) -> i64 {
        self.ptid.pid
    }

    pub fn is_stopped(&self) -> bool {
        self.state == ThreadState::Stopped
    }
}

/// Fork or vfork event reported but not followed yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingFollow {
    /// Forking thread.
    pub parent: ThreadId,
    pub child: ThreadId,
    pub vfork: bool,
}

/// Process known to the client.
#[derive(Clone, Debug)]
pub struct InferiorInfo {
    pub pid: i64,
    /// False if some threads of the process must not be resumed by a wildcard action.
    pub may_wildcard: bool,
    /// Reported forks of the process in order of arrival.
    pub pending_follows: Vec<PendingFollow>,
    /// True if process was attached rather than spawned.
    pub attached: bool,
    pub exec_path: Option<String>,
}

/// What [`Registry::notice`] created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoticeFlags {
    pub new_inferior: bool,
    pub new_thread: bool,
}

/// Threads and inferiors of a session, in order of appearance.
#[derive(Default, Debug)]
pub struct Registry {
    threads: IndexMap<ThreadId, ThreadInfo>,
    inferiors: IndexMap<i64, InferiorInfo>,
    next_num: u32,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a thread if it is unseen. An inferior is created before the thread.
    ///
    /// # Arguments
    ///
    /// * `ptid`: thread id, wildcards and null id are ignored
    /// * `running`: initial state of a new thread
    pub fn notice(&mut self, ptid: ThreadId, running: bool) -> NoticeFlags {
        let mut flags = NoticeFlags::default();
        if ptid.is_null() || ptid.is_all() || ptid == ThreadId::ANY {
            return flags;
        }

        if ptid.tid == -1 && !ptid.is_magic() {
            return flags;
        }

        if !self.inferiors.contains_key(&ptid.pid) {
            rsp_debug!(target: "registry", "add new inferior, process: {}", ptid.pid);
            self.inferiors.insert(
                ptid.pid,
                InferiorInfo {
                    pid: ptid.pid,
                    may_wildcard: true,
                    pending_follows: vec![],
                    attached: false,
                    exec_path: None,
                },
            );
            flags.new_inferior = true;
        }

        if !self.threads.contains_key(&ptid) {
            self.next_num += 1;
            rsp_debug!(target: "registry", "add new thread {ptid}, num: {}", self.next_num);
            self.threads.insert(
                ptid,
                ThreadInfo {
                    ptid,
                    num: self.next_num,
                    state: if running {
                        ThreadState::Running
                    } else {
                        ThreadState::Stopped
                    },
                    resume_pending: None,
                    last_resume: ResumeRequest::default(),
                    pending_signal: None,
                    stop_reason: None,
                    watch_addr: None,
                    core: None,
                    name: None,
                    extra_info: None,
                    handle: None,
                    expedited: vec![],
                },
            );
            flags.new_thread = true;
        }
        flags
    }

    pub fn thread(&self, ptid: ThreadId) -> Option<&ThreadInfo> {
        self.threads.get(&ptid)
    }

    pub fn thread_mut(&mut self, ptid: ThreadId) -> Option<&mut ThreadInfo> {
        self.threads.get_mut(&ptid)
    }

    pub fn inferior(&self, pid: i64) -> Option<&InferiorInfo> {
        self.inferiors.get(&pid)
    }

    pub fn inferior_mut(&mut self, pid: i64) -> Option<&mut InferiorInfo> {
        self.inferiors.get_mut(&pid)
    }

    pub fn threads(&self) -> impl Iterator<Item = &ThreadInfo> {
        self.threads.values()
    }

    pub fn threads_mut(&mut self) -> impl Iterator<Item = &mut ThreadInfo> {
        self.threads.values_mut()
    }

    /// Threads covered by `filter` (a thread, a process or a wildcard).
    pub fn matching(&self, filter: ThreadId) -> impl Iterator<Item = &ThreadInfo> {
        self.threads.values().filter(move |t| filter.matches(t.ptid))
    }

    pub fn threads_of(&self, pid: i64) -> impl Iterator<Item = &ThreadInfo> {
        self.threads.values().filter(move |t| t.pid() == pid)
    }

    pub fn inferiors(&self) -> impl Iterator<Item = &InferiorInfo> {
        self.inferiors.values()
    }

    pub fn inferiors_mut(&mut self) -> impl Iterator<Item = &mut InferiorInfo> {
        self.inferiors.values_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Process for bare thread ids of a stub without multiprocess extensions.
    pub fn default_pid(&self) -> Option<i64> {
        self.inferiors
            .keys()
            .copied()
            .find(|&pid| pid != MAGIC_PID && pid > 0)
    }

    /// Find a thread by the stub provided handle instead of thread id.
    pub fn find_by_handle(&self, handle: &[u8]) -> Option<&ThreadInfo> {
        self.threads
            .values()
            .find(|t| t.handle.as_deref() == Some(handle))
    }

    pub fn remove_thread(&mut self, ptid: ThreadId) -> Option<ThreadInfo> {
        rsp_debug!(target: "registry", "remove thread {ptid}");
        self.threads.shift_remove(&ptid)
    }

    /// Remove inferior and all its threads.
    pub fn remove_inferior(&mut self, pid: i64) -> Option<InferiorInfo> {
        rsp_debug!(target: "registry", "remove inferior, process: {pid}");
        self.threads.retain(|ptid, _| ptid.pid != pid);
        self.inferiors.shift_remove(&pid)
    }

    /// Synchronize registry with a full thread listing.
    /// Threads in `protected` (not followed fork children) are never removed.
    ///
    /// # Arguments
    ///
    /// * `observed`: listed threads
    /// * `protected`: threads that are kept even if not listed
    /// * `running`: state of added threads
    ///
    /// Return removed and added threads.
    pub fn reconcile(
        &mut self,
        observed: &[ThreadId],
        protected: &HashSet<ThreadId>,
        running: bool,
    ) -> (Vec<ThreadId>, Vec<ThreadId>) {
        let observed_set: HashSet<ThreadId> = observed.iter().copied().collect();

        let removed: Vec<ThreadId> = self
            .threads
            .keys()
            .filter(|ptid| !observed_set.contains(ptid) && !protected.contains(ptid))
            .copied()
            .collect();
        for ptid in &removed {
            self.remove_thread(*ptid);
        }

        let mut added = vec![];
        for &ptid in observed {
            if self.notice(ptid, running).new_thread {
                added.push(ptid);
            }
        }
        (removed, added)
    }

    /// Apply stop reply to the stopped thread. Return false if thread is unknown.
    pub fn apply_stop(&mut self, reply: &StopReply) -> bool {
        let Some(thread) = self.threads.get_mut(&reply.ptid) else {
            return false;
        };

        thread.state = ThreadState::Stopped;
        thread.resume_pending = None;
        thread.core = reply.core.or(thread.core);
        thread.expedited = reply.registers.clone();
        thread.watch_addr = reply.watch_addr();
        thread.stop_reason = match &reply.kind {
            StopKind::Stopped { reason, .. } => Some(reason.clone()),
            _ => None,
        };
        true
    }

    /// Mark threads matching `filter` as running, expedited registers become stale.
    pub fn set_running(&mut self, filter: ThreadId) {
        for thread in self.threads.values_mut() {
            if filter.matches(thread.ptid) {
                thread.state = ThreadState::Running;
                thread.expedited.clear();
            }
        }
    }

    /// Remember a fork event, the parent process is excluded from wildcard resumption
    /// until every fork of it is followed.
    pub fn record_fork(&mut self, parent: ThreadId, child: ThreadId, vfork: bool) {
        let Some(inferior) = self.inferiors.get_mut(&parent.pid) else {
            return;
        };
        if inferior.pending_follows.iter().any(|f| f.child == child) {
            return;
        }
        rsp_debug!(target: "registry", "{parent} forked {child}, follow pending");
        inferior.pending_follows.push(PendingFollow {
            parent,
            child,
            vfork,
        });
        inferior.may_wildcard = false;
    }

    /// Forget the oldest fork event of a process, return its record.
    pub fn clear_follow(&mut self, parent_pid: i64) -> Option<PendingFollow> {
        let inferior = self.inferiors.get_mut(&parent_pid)?;
        if inferior.pending_follows.is_empty() {
            return None;
        }
        let follow = inferior.pending_follows.remove(0);
        inferior.may_wildcard = inferior.pending_follows.is_empty();
        Some(follow)
    }

    /// Children of not yet followed forks.
    pub fn pending_fork_children(&self) -> HashSet<ThreadId> {
        self.inferiors
            .values()
            .flat_map(|inf| inf.pending_follows.iter().map(|f| f.child))
            .collect()
    }

    /// True if `pid` is a child of a not yet followed fork.
    pub fn is_pending_fork_child(&self, pid: i64) -> bool {
        self.inferiors
            .values()
            .flat_map(|inf| inf.pending_follows.iter())
            .any(|f| f.child.pid == pid)
    }
}
