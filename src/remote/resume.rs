//! Execution control: resumption of threads with `vCont` (or legacy `c`/`s`) packets.
//!
//! In all-stop mode a resumption is a single packet and the target answers with a stop
//! reply once something happens. In non-stop mode resumption requests are recorded per
//! thread and sent later by [`ExecutionController::commit_resume`], compatible requests
//! are coalesced into wildcard actions.

use crate::remote::error::{Error, RemoteError};
use crate::remote::feature::{Feature, Support};
use crate::remote::notif::StopQueue;
use crate::remote::packet::hex_decode;
use crate::remote::ptid::ThreadId;
use crate::remote::registry::{Registry, ResumeRequest, ThreadState};
use crate::remote::session::{Session, Wait};
use crate::remote::stop::StopReply;
use crate::{rsp_debug, rsp_warn};
use std::collections::HashSet;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    /// All-stop target is resumed, exactly one stop reply is expected.
    AwaitingStopReply,
    /// Non-stop target, threads run and stop independently.
    NonStopActive,
}

/// Actions accepted by a `vCont` packet, as reported by `vCont?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VContSupport {
    pub cont: bool,
    pub cont_signal: bool,
    pub step: bool,
    pub step_signal: bool,
    pub stop: bool,
    pub range_step: bool,
}

impl VContSupport {
    /// Parse `vCont?` reply: `vCont[;action...]`.
    pub fn parse(reply: &[u8]) -> Result<Self, Error> {
        let actions = reply
            .strip_prefix(b"vCont")
            .ok_or_else(|| Error::unexpected(b"vCont?", reply))?;

        let mut support = VContSupport::default();
        for action in actions.split(|&b| b == b';').filter(|a| !a.is_empty()) {
            match action {
                b"c" => support.cont = true,
                b"C" => support.cont_signal = true,
                b"s" => support.step = true,
                b"S" => support.step_signal = true,
                b"t" => support.stop = true,
                b"r" => support.range_step = true,
                _ => {}
            }
        }
        Ok(support)
    }

    /// `vCont` is usable only if basic continue and step are supported.
    fn usable(&self) -> bool {
        self.cont && self.cont_signal && self.step && self.step_signal
    }
}

/// Single action of a `vCont` packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VContAction {
    /// Thread, all threads of a process or [`ThreadId::ALL`].
    pub scope: ThreadId,
    pub step: bool,
    pub signal: Option<u8>,
    /// Range for range-stepping, used only together with `step`.
    pub range: Option<Range<u64>>,
}

impl VContAction {
    pub fn cont(scope: ThreadId) -> Self {
        Self {
            scope,
            step: false,
            signal: None,
            range: None,
        }
    }

    pub fn signal(scope: ThreadId, signal: u8) -> Self {
        Self {
            signal: Some(signal),
            ..Self::cont(scope)
        }
    }

    /// Encode action as `<action>[:<thread>]`.
    ///
    /// A step with signal wins over range-stepping, range-stepping over plain step.
    pub fn encode(&self, multiprocess: bool) -> String {
        let mut action = match (self.step, self.signal, &self.range) {
            (true, Some(sig), _) => format!("S{sig:02x}"),
            (true, None, Some(range)) => format!("r{:x},{:x}", range.start, range.end),
            (true, None, None) => "s".to_string(),
            (false, Some(sig), _) => format!("C{sig:02x}"),
            (false, None, _) => "c".to_string(),
        };
        if !self.scope.is_all() {
            action.push(':');
            action.push_str(&self.scope.encode(multiprocess));
        }
        action
    }
}

/// Accumulates `vCont` actions into packets that fit the negotiated packet size.
/// Each full packet is sent and must be answered with `OK` (non-stop mode).
pub struct VContBuilder<'a> {
    session: &'a mut Session,
    buf: String,
    /// Scopes of actions in `buf`.
    scopes: Vec<ThreadId>,
    packets: usize,
}

impl<'a> VContBuilder<'a> {
    const PREFIX: &'static str = "vCont";

    pub fn new(session: &'a mut Session) -> Self {
        let capacity = session.max_payload();
        let mut buf = String::with_capacity(capacity);
        buf.push_str(Self::PREFIX);
        Self {
            session,
            buf,
            scopes: vec![],
            packets: 0,
        }
    }

    /// Add an action. If it does not fit, the current packet is flushed first.
    ///
    /// Return scopes of the actions sent by this call.
    pub fn push(&mut self, action: &VContAction) -> Result<Vec<ThreadId>, Error> {
        let entry = format!(";{}", action.encode(self.session.multiprocess()));
        let limit = self.session.max_payload();
        if Self::PREFIX.len() + entry.len() > limit {
            return Err(Error::PacketTooLong {
                size: Self::PREFIX.len() + entry.len(),
                limit,
            });
        }

        let mut sent = vec![];
        if !self.scopes.is_empty() && self.buf.len() + entry.len() > limit {
            sent = self.flush()?;
        }
        self.buf.push_str(&entry);
        self.scopes.push(action.scope);
        Ok(sent)
    }

    /// Send the current packet, return scopes of its actions.
    pub fn flush(&mut self) -> Result<Vec<ThreadId>, Error> {
        if self.scopes.is_empty() {
            return Ok(vec![]);
        }
        self.session.exchange_ok(self.buf.as_bytes())?;
        self.buf.truncate(Self::PREFIX.len());
        self.packets += 1;
        Ok(std::mem::take(&mut self.scopes))
    }

    /// Number of packets sent so far.
    pub fn packets(&self) -> usize {
        self.packets
    }
}

/// Resumption state machine of a session.
#[derive(Debug)]
pub struct ExecutionController {
    state: ControllerState,
    /// `None` if `vCont` is not probed yet or not supported.
    vcont: Option<VContSupport>,
    range_stepping: bool,
}

impl ExecutionController {
    pub fn new(range_stepping: bool) -> Self {
        Self {
            state: ControllerState::Idle,
            vcont: None,
            range_stepping,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn vcont(&self) -> Option<VContSupport> {
        self.vcont
    }

    /// Ask which `vCont` actions the stub supports.
    pub fn probe_vcont(&mut self, session: &mut Session) -> Result<(), Error> {
        self.vcont = match session.request(Feature::VCont, b"vCont?") {
            Ok(reply) => {
                let support = VContSupport::parse(&reply)?;
                if support.usable() {
                    Some(support)
                } else {
                    rsp_warn!(target: "resume", "vCont without basic actions, legacy packets are used");
                    session
                        .features_mut()
                        .observe(Feature::VCont, Support::Disabled);
                    None
                }
            }
            Err(Error::PacketUnsupported(_)) => None,
            Err(e) => return Err(e),
        };
        rsp_debug!(target: "resume", "vCont support: {:?}", self.vcont);
        Ok(())
    }

    /// Switch to non-stop operation, all threads are handled independently.
    pub fn enter_non_stop(&mut self) {
        self.state = ControllerState::NonStopActive;
    }

    /// All-stop target reported a stop (or queued one was taken).
    pub fn stopped(&mut self) {
        if self.state == ControllerState::AwaitingStopReply {
            self.state = ControllerState::Idle;
        }
    }

    /// Record resumption request for stopped threads matching `filter`, nothing is sent.
    pub fn request_resume(&self, registry: &mut Registry, filter: ThreadId, request: &ResumeRequest) {
        for thread in registry.threads_mut() {
            if filter.matches(thread.ptid) && thread.state == ThreadState::Stopped {
                thread.resume_pending = Some(request.clone());
            }
        }
    }

    fn action_for(&self, ptid: ThreadId, request: &ResumeRequest) -> VContAction {
        let range_allowed = self.range_stepping
            && self.vcont.map(|v| v.range_step).unwrap_or_default()
            && request.range.as_ref().is_some_and(|r| r.start < r.end);
        VContAction {
            scope: ptid,
            step: request.step,
            signal: request.signal,
            range: if range_allowed {
                request.range.clone()
            } else {
                None
            },
        }
    }

    /// Make a list of actions covering all pending resumption requests.
    ///
    /// Threads with a step or a signal come first, then threads with an undelivered
    /// pending signal. The rest is resumed by a process-wide wildcard when every
    /// stopped thread of a process is going to continue, and by a single global wildcard
    /// if every process qualifies. Children of not followed forks are never resumed and
    /// their parents are never resumed by wildcard.
    pub fn plan(&self, registry: &Registry, queue: &StopQueue, multiprocess: bool) -> Vec<VContAction> {
        let mut fork_children = registry.pending_fork_children();
        fork_children.extend(queue.pending_fork_children());
        let child_pids: HashSet<i64> = fork_children.iter().map(|c| c.pid).collect();

        let mut no_wildcard = queue.pending_fork_pids();
        no_wildcard.extend(
            registry
                .inferiors()
                .filter(|inf| !inf.may_wildcard)
                .map(|inf| inf.pid),
        );

        let mut actions = vec![];
        let mut individual = HashSet::new();

        for thread in registry.threads() {
            if child_pids.contains(&thread.pid()) {
                continue;
            }
            if let Some(request) = &thread.resume_pending {
                if request.step || request.signal.is_some() {
                    actions.push(self.action_for(thread.ptid, request));
                    individual.insert(thread.ptid);
                }
            }
        }

        for thread in registry.threads() {
            if child_pids.contains(&thread.pid()) || individual.contains(&thread.ptid) {
                continue;
            }
            if let (Some(_), Some(signal)) = (&thread.resume_pending, thread.pending_signal) {
                actions.push(VContAction::signal(thread.ptid, signal));
                individual.insert(thread.ptid);
            }
        }

        let mut all_qualify = true;
        let mut process_wide = vec![];
        let mut single = vec![];
        for inferior in registry.inferiors() {
            if child_pids.contains(&inferior.pid) {
                continue;
            }
            let remaining: Vec<_> = registry
                .threads_of(inferior.pid)
                .filter(|t| !individual.contains(&t.ptid))
                .collect();
            let continuing: Vec<ThreadId> = remaining
                .iter()
                .filter(|t| t.resume_pending.is_some())
                .map(|t| t.ptid)
                .collect();

            let qualifies = !no_wildcard.contains(&inferior.pid)
                && remaining
                    .iter()
                    .all(|t| t.resume_pending.is_some() || !t.is_stopped());
            if !qualifies {
                all_qualify = false;
                single.extend(continuing);
            } else if !continuing.is_empty() {
                process_wide.push((inferior.pid, continuing));
            }
        }

        if all_qualify && !process_wide.is_empty() {
            actions.push(VContAction::cont(ThreadId::ALL));
            return actions;
        }

        for (pid, threads) in process_wide {
            if multiprocess {
                actions.push(VContAction::cont(ThreadId::all_of(pid)));
            } else {
                single.extend(threads);
            }
        }
        actions.extend(single.into_iter().map(VContAction::cont));
        actions
    }

    /// Mark threads covered by sent actions as running.
    fn mark_resumed(registry: &mut Registry, scopes: &[ThreadId], child_pids: &HashSet<i64>) {
        for thread in registry.threads_mut() {
            if child_pids.contains(&thread.ptid.pid)
                || !scopes.iter().any(|scope| scope.matches(thread.ptid))
            {
                continue;
            }
            if let Some(request) = thread.resume_pending.take() {
                thread.pending_signal = None;
                thread.state = ThreadState::Running;
                thread.expedited.clear();
                thread.last_resume = request;
            }
        }
    }

    /// Drop resumption requests that were not sent.
    fn cancel_requests(registry: &mut Registry) {
        for thread in registry.threads_mut() {
            thread.resume_pending = None;
        }
    }

    fn fork_child_pids(registry: &Registry, queue: &StopQueue) -> HashSet<i64> {
        registry
            .pending_fork_children()
            .into_iter()
            .chain(queue.pending_fork_children())
            .map(|c| c.pid)
            .collect()
    }

    /// Send all pending resumption requests (non-stop mode).
    /// Pending notifications are processed first, so that queued fork events are known.
    ///
    /// Return number of sent packets.
    pub fn commit_resume(
        &mut self,
        session: &mut Session,
        registry: &mut Registry,
        queue: &mut StopQueue,
    ) -> Result<usize, Error> {
        if !registry.threads().any(|t| t.resume_pending.is_some()) {
            return Ok(0);
        }
        queue.drain(session, registry.default_pid())?;

        let actions = self.plan(registry, queue, session.multiprocess());
        let child_pids = Self::fork_child_pids(registry, queue);
        let mut builder = VContBuilder::new(session);
        for action in &actions {
            let sent = builder.push(action)?;
            Self::mark_resumed(registry, &sent, &child_pids);
        }
        let sent = builder.flush()?;
        Self::mark_resumed(registry, &sent, &child_pids);
        let packets = builder.packets();
        rsp_debug!(target: "resume", "commit {} actions in {packets} packets", actions.len());
        Ok(packets)
    }

    /// Resume an all-stop target.
    ///
    /// # Arguments
    ///
    /// * `ptid`: thread that gets the `request`
    /// * `request`: step/signal for `ptid`
    /// * `scope`: threads resumed with a plain continue along with `ptid`
    pub fn resume(
        &mut self,
        session: &mut Session,
        registry: &mut Registry,
        queue: &StopQueue,
        ptid: ThreadId,
        request: ResumeRequest,
        scope: ThreadId,
    ) -> Result<(), Error> {
        if self.state == ControllerState::AwaitingStopReply {
            return Err(Error::TargetRunning);
        }

        // an event is already waiting for delivery, target is not resumed
        if queue.has_queued_for(ThreadId::ALL) {
            rsp_debug!(target: "resume", "stop reply is queued, resume skipped");
            self.state = ControllerState::AwaitingStopReply;
            return Ok(());
        }

        self.request_resume(registry, scope, &ResumeRequest::default());
        self.request_resume(registry, ptid, &request);

        let vcont = self
            .vcont
            .filter(|_| !session.features().is_disabled(Feature::VCont));
        if vcont.is_some() {
            let mut actions = self.plan(registry, queue, session.multiprocess());
            if actions.is_empty() {
                actions.push(self.action_for(ptid, &request));
            }
            let payload = actions.iter().fold("vCont".to_string(), |mut p, a| {
                p.push(';');
                p.push_str(&a.encode(session.multiprocess()));
                p
            });
            // all-stop target accepts a single resumption packet
            if payload.len() > session.max_payload() {
                Self::cancel_requests(registry);
                return Err(Error::PacketTooLong {
                    size: payload.len(),
                    limit: session.max_payload(),
                });
            }
            if let Err(e) = session.send(payload.as_bytes()) {
                Self::cancel_requests(registry);
                return Err(e);
            }
        } else if let Err(e) = self.resume_legacy(session, registry, ptid, &request, scope) {
            Self::cancel_requests(registry);
            return Err(e);
        }

        let child_pids = Self::fork_child_pids(registry, queue);
        Self::mark_resumed(registry, &[ThreadId::ALL], &child_pids);
        self.state = ControllerState::AwaitingStopReply;
        Ok(())
    }

    /// Resume with `c`, `s`, `C` or `S` packets, the resumed thread is selected by `Hc`.
    fn resume_legacy(
        &self,
        session: &mut Session,
        registry: &Registry,
        ptid: ThreadId,
        request: &ResumeRequest,
        scope: ThreadId,
    ) -> Result<(), Error> {
        let signal = request.signal.or_else(|| {
            registry
                .thread(ptid)
                .and_then(|t| t.pending_signal)
        });

        let hc = if ptid.is_wildcard() || (scope != ptid && !request.step && signal.is_none()) {
            ThreadId::ANY
        } else {
            ptid
        };
        session.set_continue_thread(hc)?;

        let payload = match (request.step, signal) {
            (true, Some(sig)) => format!("S{sig:02x}"),
            (true, None) => "s".to_string(),
            (false, Some(sig)) => format!("C{sig:02x}"),
            (false, None) => "c".to_string(),
        };
        session.send(payload.as_bytes())
    }

    /// Wait for the stop reply of a resumed all-stop target.
    /// Console output (`O` packets) is passed to the session hook meanwhile.
    pub fn receive_stop(
        &mut self,
        session: &mut Session,
        default_pid: Option<i64>,
    ) -> Result<StopReply, Error> {
        if self.state != ControllerState::AwaitingStopReply {
            return Err(Error::TargetNotRunning);
        }

        loop {
            let reply = session.receive(Wait::Forever)?;
            if reply == "OK" {
                rsp_warn!(target: "resume", "unexpected `OK` while waiting for stop reply");
                continue;
            }
            if let Some(hex) = reply.strip_prefix(b"O") {
                let output = hex_decode(hex)?;
                session
                    .hook()
                    .on_console_output(&String::from_utf8_lossy(&output));
                continue;
            }

            self.state = ControllerState::Idle;
            if let Some(e) = RemoteError::parse(&reply) {
                return Err(Error::PacketRejected(e));
            }
            return StopReply::parse(&reply, default_pid);
        }
    }

    /// Stop threads of a non-stop target (`vCont;t`), stops are reported by notifications.
    pub fn stop(&mut self, session: &mut Session, ptid: ThreadId) -> Result<(), Error> {
        let action = if ptid.is_all() {
            "vCont;t".to_string()
        } else {
            format!("vCont;t:{}", ptid.encode(session.multiprocess()))
        };
        session.exchange_ok(action.as_bytes())
    }
}
