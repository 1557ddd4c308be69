//! Remote target: a connection with its thread registry, stop reply queue and
//! execution controller.

use crate::config::SessionConfig;
use crate::remote::breakpoint::{Breakpoint, BreakpointKind};
use crate::remote::error::Error;
use crate::remote::feature::Feature;
use crate::remote::notif::StopQueue;
use crate::remote::packet::hex_encode;
use crate::remote::ptid::ThreadId;
use crate::remote::register::{Architecture, RegisterSet};
use crate::remote::registry::{Registry, ResumeRequest, ThreadState};
use crate::remote::resume::{ControllerState, ExecutionController};
use crate::remote::session::Session;
use crate::remote::stop::{StopKind, StopReason, StopReply};
use crate::remote::transport::Transport;
use crate::{rsp_debug, rsp_info, rsp_warn};
use itertools::Itertools;
use std::collections::HashSet;
use strum_macros::Display;

/// Observer of target events. All methods have empty default implementations.
pub trait EventHook: Send {
    fn on_new_inferior(&self, _pid: i64) {}

    fn on_new_thread(&self, _ptid: ThreadId) {}

    fn on_thread_exit(&self, _ptid: ThreadId) {}

    /// Output of the target program forwarded by the stub.
    fn on_console_output(&self, _text: &str) {}

    /// Called on a second interrupt while the first one is unanswered.
    /// Return `true` to close the connection.
    fn abandon_on_interrupt(&self) -> bool {
        false
    }
}

pub struct NoopHook;

impl EventHook for NoopHook {}

/// Connection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TargetKind {
    /// Attached to an already running target, connection ends with the target.
    #[strum(serialize = "remote")]
    Remote,
    /// Stub can spawn and attach processes, connection outlives them.
    #[strum(serialize = "extended-remote")]
    Extended,
}

/// What to do with a child of a reported fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowFork {
    /// Child stays under control.
    KeepChild,
    /// Child is detached and runs freely.
    DetachChild,
}

pub struct RemoteTarget {
    kind: TargetKind,
    session: Session,
    registry: Registry,
    queue: StopQueue,
    controller: ExecutionController,
    /// Stop status reported at connection.
    initial_stop: Option<StopReply>,
    current: Option<ThreadId>,
}

impl RemoteTarget {
    /// Connect to a stub over `transport` and bring the connection to a usable state:
    /// negotiate features and modes, fetch initial stop status and threads.
    pub fn connect(
        kind: TargetKind,
        transport: Box<dyn Transport>,
        config: SessionConfig,
        hook: Box<dyn EventHook>,
    ) -> Result<Self, Error> {
        let mut session = Session::new(transport, config);
        session.set_hook(hook);
        let controller = ExecutionController::new(session.config().range_stepping);

        let mut target = Self {
            kind,
            session,
            registry: Registry::new(),
            queue: StopQueue::new(),
            controller,
            initial_stop: None,
            current: None,
        };
        target.start()?;
        Ok(target)
    }

    fn start(&mut self) -> Result<(), Error> {
        if self.kind == TargetKind::Extended {
            self.session.exchange_ok(b"!")?;
        }

        self.negotiate()?;

        if self.session.config().no_ack
            && self.session.features().is_enabled(Feature::StartNoAckMode)
        {
            self.session.exchange_ok(b"QStartNoAckMode")?;
            self.session.set_ack_mode(false);
        }

        let non_stop = self.session.config().non_stop;
        if self.session.features().is_enabled(Feature::NonStop) {
            let request = if non_stop { "QNonStop:1" } else { "QNonStop:0" };
            self.session.exchange_ok(request.as_bytes())?;
        } else if non_stop {
            return Err(Error::NonStopUnsupported);
        }
        self.session.set_non_stop(non_stop);
        if non_stop {
            self.controller.enter_non_stop();
        }

        self.controller.probe_vcont(&mut self.session)?;
        self.pass_signals()?;
        self.query_stop_status()?;
        self.update_thread_list()?;

        self.current = self.session.current_thread()?.or(self.current);
        rsp_info!(
            target: "remote",
            "connected ({}), packet size {}, {} threads",
            self.kind,
            self.session.packet_size(),
            self.registry.threads().count()
        );
        Ok(())
    }

    fn negotiate(&mut self) -> Result<(), Error> {
        let query = self.session.features().query();
        let reply = self.session.exchange(query.as_bytes())?;
        if reply.is_empty() {
            rsp_warn!(target: "remote", "qSupported is not supported, defaults are used");
        }
        if let Some(size) = self.session.features_mut().apply_reply(&reply) {
            self.session.set_packet_size(size);
        }
        Ok(())
    }

    fn pass_signals(&mut self) -> Result<(), Error> {
        let signals = &self.session.config().pass_signals;
        if signals.is_empty() || !self.session.features().is_enabled(Feature::PassSignals) {
            return Ok(());
        }
        let request = format!(
            "QPassSignals:{}",
            signals.iter().map(|s| format!("{s:x}")).join(";")
        );
        self.session.exchange_ok(request.as_bytes())
    }

    /// Ask for the current stop status (`?`).
    fn query_stop_status(&mut self) -> Result<(), Error> {
        let reply = self.session.exchange_checked(b"?")?;
        if self.session.non_stop() {
            // stop of every thread is reported, the rest is fetched with `vStopped`
            if reply != "OK" {
                let stop = StopReply::parse(&reply, self.registry.default_pid())?;
                self.queue.push(stop);
                loop {
                    let next = self.session.exchange_checked(b"vStopped")?;
                    if next == "OK" {
                        break;
                    }
                    let stop = StopReply::parse(&next, self.registry.default_pid())?;
                    self.queue.push(stop);
                }
            }
            while let Some(stop) = self.queue.queued_for(ThreadId::ALL) {
                self.process_stop(stop);
            }
            return Ok(());
        }

        let stop = StopReply::parse(&reply, self.registry.default_pid())?;
        if stop.is_process_exit() {
            rsp_debug!(target: "remote", "no process on the target");
            return Ok(());
        }
        self.initial_stop = Some(self.process_stop(stop));
        Ok(())
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn controller(&self) -> &ExecutionController {
        &self.controller
    }

    pub fn initial_stop(&self) -> Option<&StopReply> {
        self.initial_stop.as_ref()
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        self.current
    }

    fn ensure_stopped(&self) -> Result<(), Error> {
        if self.controller.state() == ControllerState::AwaitingStopReply {
            return Err(Error::TargetRunning);
        }
        Ok(())
    }

    fn ensure_extended(&self) -> Result<(), Error> {
        if self.kind != TargetKind::Extended {
            return Err(Error::NotExtended);
        }
        Ok(())
    }

    /// Synchronize the registry with the thread listing of the stub.
    pub fn update_thread_list(&mut self) -> Result<(), Error> {
        let listed = match self.session.list_threads() {
            Ok(listed) => listed,
            Err(Error::PacketUnsupported(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut protected = self.registry.pending_fork_children();
        protected.extend(self.queue.pending_fork_children());
        let known_pids: HashSet<i64> = self.registry.inferiors().map(|inf| inf.pid).collect();

        let observed = listed.iter().map(|t| t.ptid).collect::<Vec<_>>();
        // stub without thread support lists nothing
        if observed.is_empty() {
            protected.insert(ThreadId::MAGIC_NULL);
        }
        let (removed, added) =
            self.registry
                .reconcile(&observed, &protected, self.session.non_stop());

        for thread in listed {
            if let Some(info) = self.registry.thread_mut(thread.ptid) {
                info.core = thread.core.or(info.core);
                info.name = thread.name.or(info.name.take());
                info.handle = thread.handle.or(info.handle.take());
            }
        }

        let hook = self.session.hook();
        for pid in added.iter().map(|t| t.pid).unique() {
            if !known_pids.contains(&pid) {
                hook.on_new_inferior(pid);
            }
        }
        removed.iter().for_each(|&ptid| hook.on_thread_exit(ptid));
        added.iter().for_each(|&ptid| hook.on_new_thread(ptid));
        Ok(())
    }

    fn notice(&mut self, ptid: ThreadId, running: bool) {
        let flags = self.registry.notice(ptid, running);
        let hook = self.session.hook();
        if flags.new_inferior {
            hook.on_new_inferior(ptid.pid);
        }
        if flags.new_thread {
            hook.on_new_thread(ptid);
        }
    }

    /// Apply a stop reply to the registry. Return the reply with the stopped thread resolved.
    fn process_stop(&mut self, mut stop: StopReply) -> StopReply {
        if stop.ptid.is_null() && !stop.is_process_exit() {
            stop.ptid = self.current.unwrap_or(ThreadId::MAGIC_NULL);
        }
        rsp_debug!(target: "remote", "stop: {stop}");

        if !self.session.non_stop() {
            self.controller.stopped();
            for thread in self.registry.threads_mut() {
                thread.state = ThreadState::Stopped;
            }
        }

        match stop.kind {
            StopKind::Exited { .. } | StopKind::Signalled { .. } => {
                let pid = match stop.ptid.pid {
                    pid if pid > 0 => Some(pid),
                    _ => self.registry.default_pid(),
                };
                if let Some(pid) = pid {
                    self.registry.remove_inferior(pid);
                    self.queue.discard(pid);
                    self.session.reset_thread_selection();
                    if self.current.is_some_and(|c| c.pid == pid) {
                        self.current = None;
                    }
                }
                return stop;
            }
            StopKind::ThreadExited { .. } => {
                if self.registry.remove_thread(stop.ptid).is_some() {
                    self.session.hook().on_thread_exit(stop.ptid);
                }
                return stop;
            }
            StopKind::NoResumed => return stop,
            StopKind::Stopped { .. } => {}
        }

        self.notice(stop.ptid, false);
        self.registry.apply_stop(&stop);
        self.current = Some(stop.ptid);

        if let StopKind::Stopped { signal, reason } = &stop.kind {
            match reason {
                StopReason::Fork { child } => self.registry.record_fork(stop.ptid, *child, false),
                StopReason::VFork { child } => self.registry.record_fork(stop.ptid, *child, true),
                StopReason::Exec { path } => {
                    // other threads are gone after exec
                    let gone: Vec<_> = self
                        .registry
                        .threads_of(stop.ptid.pid)
                        .map(|t| t.ptid)
                        .filter(|&t| t != stop.ptid)
                        .collect();
                    for ptid in gone {
                        self.registry.remove_thread(ptid);
                    }
                    if let Some(inferior) = self.registry.inferior_mut(stop.ptid.pid) {
                        inferior.exec_path = Some(path.clone());
                    }
                }
                _ => {}
            }

            if self.session.config().pass_signals.contains(signal) {
                if let Some(thread) = self.registry.thread_mut(stop.ptid) {
                    thread.pending_signal = Some(*signal);
                }
            }
        }
        stop
    }

    /// Resume threads.
    ///
    /// # Arguments
    ///
    /// * `ptid`: thread that gets the `request`
    /// * `request`: step/signal for `ptid`
    /// * `scope`: threads resumed with a plain continue along with `ptid`
    pub fn resume(
        &mut self,
        ptid: ThreadId,
        request: ResumeRequest,
        scope: ThreadId,
    ) -> Result<(), Error> {
        if self.session.non_stop() {
            self.controller
                .request_resume(&mut self.registry, scope, &ResumeRequest::default());
            self.controller
                .request_resume(&mut self.registry, ptid, &request);
            return self.commit_resume().map(|_| ());
        }

        self.controller.resume(
            &mut self.session,
            &mut self.registry,
            &self.queue,
            ptid,
            request,
            scope,
        )
    }

    /// Record a resumption request (non-stop mode), sent by [`RemoteTarget::commit_resume`].
    pub fn request_resume(&mut self, filter: ThreadId, request: ResumeRequest) {
        self.controller
            .request_resume(&mut self.registry, filter, &request);
    }

    /// Send recorded resumption requests. Return number of sent packets.
    pub fn commit_resume(&mut self) -> Result<usize, Error> {
        self.controller
            .commit_resume(&mut self.session, &mut self.registry, &mut self.queue)
    }

    /// Wait until the target reports a stop.
    pub fn wait(&mut self) -> Result<StopReply, Error> {
        if self.session.non_stop() {
            loop {
                if let Some(stop) = self.poll()? {
                    return Ok(stop);
                }
                let notification = self.session.wait_notification()?;
                self.queue
                    .handle_notification(&notification, self.registry.default_pid())?;
            }
        }

        if let Some(stop) = self.queue.queued_for(ThreadId::ALL) {
            return Ok(self.process_stop(stop));
        }
        let stop = self
            .controller
            .receive_stop(&mut self.session, self.registry.default_pid())?;
        Ok(self.process_stop(stop))
    }

    /// Take a queued stop without blocking (non-stop mode).
    pub fn poll(&mut self) -> Result<Option<StopReply>, Error> {
        self.queue
            .drain(&mut self.session, self.registry.default_pid())?;
        match self.queue.queued_for(ThreadId::ALL) {
            Some(stop) => Ok(Some(self.process_stop(stop))),
            None => Ok(None),
        }
    }

    /// True once after a stop reply was queued, a signal to call [`RemoteTarget::poll`].
    pub fn take_wake(&mut self) -> bool {
        self.queue.take_wake()
    }

    /// Interrupt the target. In all-stop mode the interrupt is delivered by a pending
    /// [`RemoteTarget::wait`].
    pub fn interrupt(&mut self) -> Result<(), Error> {
        if self.session.non_stop() {
            return self.session.interrupt_target();
        }
        self.session.interrupt_flag().raise();
        Ok(())
    }

    /// Stop threads of a non-stop target.
    pub fn stop(&mut self, ptid: ThreadId) -> Result<(), Error> {
        self.controller.stop(&mut self.session, ptid)
    }

    /// Decide about the child of the oldest unfollowed fork of `parent_pid`. Wildcard
    /// resumption of the parent becomes possible again once no fork of it is pending.
    pub fn follow_fork(&mut self, parent_pid: i64, mode: FollowFork) -> Result<(), Error> {
        let follow = self
            .registry
            .clear_follow(parent_pid)
            .ok_or(Error::ThreadNotFound(ThreadId::process(parent_pid)))?;

        match mode {
            FollowFork::KeepChild => {
                self.notice(follow.child, false);
            }
            FollowFork::DetachChild => {
                let request = format!("D;{:x}", follow.child.pid);
                self.session.request_ok(Feature::Detach, request.as_bytes())?;
                self.registry.remove_inferior(follow.child.pid);
            }
        }
        rsp_debug!(target: "remote", "fork {} -> {} followed: {mode:?}", follow.parent, follow.child);
        Ok(())
    }

    /// Attach to a process (extended mode).
    pub fn attach(&mut self, pid: i64) -> Result<StopReply, Error> {
        self.ensure_extended()?;
        let request = format!("vAttach;{pid:x}");
        let reply = self.session.request(Feature::Attach, request.as_bytes())?;
        let stop = self.stop_reply_of(&reply)?;
        if let Some(inferior) = self.registry.inferior_mut(pid) {
            inferior.attached = true;
        }
        self.update_thread_list()?;
        Ok(stop)
    }

    /// Spawn a program (extended mode), it is stopped at the first instruction.
    pub fn run(&mut self, program: &str, args: &[&str]) -> Result<StopReply, Error> {
        self.ensure_extended()?;
        let request = std::iter::once(program)
            .chain(args.iter().copied())
            .fold("vRun".to_string(), |mut request, arg| {
                request.push(';');
                request.push_str(&hex_encode(arg.as_bytes()));
                request
            });
        let reply = self.session.request(Feature::Run, request.as_bytes())?;
        let stop = self.stop_reply_of(&reply)?;
        self.update_thread_list()?;
        Ok(stop)
    }

    fn stop_reply_of(&mut self, reply: &[u8]) -> Result<StopReply, Error> {
        if self.session.non_stop() && reply == b"OK" {
            // stop is reported by a notification
            return self.wait();
        }
        let stop = StopReply::parse(reply, self.registry.default_pid())?;
        Ok(self.process_stop(stop))
    }

    /// Kill a process. A plain remote connection ends with the process.
    pub fn kill(&mut self, pid: i64) -> Result<(), Error> {
        match self.kind {
            TargetKind::Remote => {
                self.session.send(b"k")?;
                self.registry.remove_inferior(pid);
                self.session.close();
            }
            TargetKind::Extended => {
                let request = format!("vKill;{pid:x}");
                self.session.request_ok(Feature::Kill, request.as_bytes())?;
                self.registry.remove_inferior(pid);
                self.queue.discard(pid);
            }
        }
        self.session.reset_thread_selection();
        Ok(())
    }

    /// Detach from a process and let it run. A plain remote connection is closed.
    pub fn detach(&mut self, pid: i64) -> Result<(), Error> {
        self.ensure_stopped()?;
        let request = if self.session.multiprocess() {
            format!("D;{pid:x}")
        } else {
            "D".to_string()
        };
        self.session.request_ok(Feature::Detach, request.as_bytes())?;
        self.registry.remove_inferior(pid);
        self.queue.discard(pid);
        self.session.reset_thread_selection();
        if self.kind == TargetKind::Remote {
            self.session.close();
        }
        Ok(())
    }

    pub fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.ensure_stopped()?;
        self.session.read_memory(addr, buf)
    }

    pub fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), Error> {
        self.ensure_stopped()?;
        self.session.write_memory(addr, data)
    }

    /// Read registers of a thread, values reported with the last stop are reused.
    pub fn fetch_registers(
        &mut self,
        arch: &dyn Architecture,
        ptid: ThreadId,
    ) -> Result<RegisterSet, Error> {
        self.ensure_stopped()?;
        let thread = self
            .registry
            .thread(ptid)
            .ok_or(Error::ThreadNotFound(ptid))?;
        if !thread.is_stopped() {
            return Err(Error::TargetRunning);
        }
        let expedited = thread.expedited.clone();
        self.session.fetch_registers(arch, ptid, &expedited)
    }

    pub fn store_register(
        &mut self,
        arch: &dyn Architecture,
        ptid: ThreadId,
        regnum: u32,
        value: &[u8],
    ) -> Result<(), Error> {
        self.ensure_stopped()?;
        if let Some(thread) = self.registry.thread_mut(ptid) {
            thread.expedited.clear();
        }
        self.session.store_register(arch, ptid, regnum, value)
    }

    pub fn insert_breakpoint(&mut self, bp: &Breakpoint) -> Result<bool, Error> {
        self.ensure_stopped()?;
        self.session.insert_breakpoint(bp)
    }

    pub fn remove_breakpoint(
        &mut self,
        kind: BreakpointKind,
        addr: u64,
        len: usize,
    ) -> Result<(), Error> {
        self.ensure_stopped()?;
        self.session.remove_breakpoint(kind, addr, len)
    }

    /// Read auxiliary vector of the current process.
    pub fn read_auxv(&mut self) -> Result<Vec<u8>, Error> {
        self.session.xfer_read(Feature::XferAuxv, "auxv", "")
    }

    /// Read target description document, `annex` is a document name like `target.xml`.
    pub fn read_target_description(&mut self, annex: &str) -> Result<String, Error> {
        let data = self
            .session
            .xfer_read(Feature::XferFeatures, "features", annex)?;
        Ok(String::from_utf8(data)?)
    }

    /// Close the connection.
    pub fn disconnect(&mut self) {
        self.session.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Detect;
    use crate::remote::testing::FakeStub;
    use std::sync::{Arc, Mutex};

    const SUPPORTED: &str = "qSupported:multiprocess+;swbreak+;hwbreak+;fork-events+;vfork-events+;exec-events+;vContSupported+;QThreadEvents+;no-resumed+";

    #[derive(Clone, Default)]
    struct Events(Arc<Mutex<Vec<String>>>);

    impl EventHook for Events {
        fn on_new_inferior(&self, pid: i64) {
            self.0.lock().unwrap().push(format!("new process {pid}"));
        }

        fn on_new_thread(&self, ptid: ThreadId) {
            self.0.lock().unwrap().push(format!("new {ptid}"));
        }

        fn on_thread_exit(&self, ptid: ThreadId) {
            self.0.lock().unwrap().push(format!("exit {ptid}"));
        }
    }

    impl Events {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.0.lock().unwrap())
        }
    }

    fn connect(
        stub: &FakeStub,
        kind: TargetKind,
        config: SessionConfig,
        events: &Events,
    ) -> RemoteTarget {
        RemoteTarget::connect(
            kind,
            Box::new(stub.clone()),
            config,
            Box::new(events.clone()),
        )
        .unwrap()
    }

    #[test]
    fn test_connect_all_stop() {
        let stub = FakeStub::with_acks();
        stub.expect(
            SUPPORTED,
            &["PacketSize=3fff;QStartNoAckMode+;multiprocess+;swbreak+;fork-events+;QPassSignals+"],
        )
        .expect("QStartNoAckMode", &["OK"])
        .expect("vCont?", &["vCont;c;C;s;S;t"])
        .expect("QPassSignals:e;1d", &["OK"])
        .expect("?", &["T05thread:p2a.2a;"])
        .expect("qfThreadInfo", &["mp2a.2a,p2a.2b"])
        .expect("qsThreadInfo", &["l"])
        .expect("qC", &["QCp2a.2a"]);
        let config = SessionConfig {
            pass_signals: vec![14, 29],
            ..SessionConfig::default()
        };
        let events = Events::default();
        let target = connect(&stub, TargetKind::Remote, config, &events);

        assert_eq!(target.session().packet_size(), 0x3fff);
        assert!(!target.session().ack_mode());
        assert!(target.session().multiprocess());
        assert_eq!(target.current_thread(), Some(ThreadId::new(0x2a, 0x2a)));
        assert_eq!(
            target.initial_stop().unwrap().ptid,
            ThreadId::new(0x2a, 0x2a)
        );
        assert_eq!(target.registry().threads().count(), 2);
        assert!(target
            .registry()
            .threads()
            .all(|t| t.state == ThreadState::Stopped));
        assert_eq!(
            events.take(),
            vec!["new process 42", "new thread 42.42", "new thread 42.43"]
        );
        assert!(stub.script_done());
    }

    #[test]
    fn test_non_stop_unsupported() {
        let stub = FakeStub::with_acks();
        stub.expect(SUPPORTED, &["QStartNoAckMode+"])
            .expect("QStartNoAckMode", &["OK"]);
        let config = SessionConfig {
            non_stop: true,
            ..SessionConfig::default()
        };
        let result = RemoteTarget::connect(
            TargetKind::Remote,
            Box::new(stub.clone()),
            config,
            Box::new(NoopHook),
        );
        assert!(matches!(result, Err(Error::NonStopUnsupported)));
    }

    fn connect_extended(stub: &FakeStub, events: &Events) -> RemoteTarget {
        stub.expect("!", &["OK"])
            .expect(SUPPORTED, &["PacketSize=400;multiprocess+;fork-events+"])
            .expect("vCont?", &["vCont;c;C;s;S"])
            .expect("?", &["W00"])
            .expect("qfThreadInfo", &["l"])
            .expect("qC", &[""]);
        connect(stub, TargetKind::Extended, SessionConfig::default(), events)
    }

    #[test]
    fn test_extended_run_fork_and_follow() {
        let stub = FakeStub::with_acks();
        let events = Events::default();
        let mut target = connect_extended(&stub, &events);
        assert!(target.session().ack_mode());
        assert!(target.registry().is_empty());
        assert!(target.initial_stop().is_none());

        stub.expect("vRun;2f62696e2f6c73;2d6c", &["T05thread:p10.10;"])
            .expect("qfThreadInfo", &["mp10.10"])
            .expect("qsThreadInfo", &["l"]);
        let stop = target.run("/bin/ls", &["-l"]).unwrap();
        assert_eq!(stop.ptid, ThreadId::new(0x10, 0x10));
        assert_eq!(events.take(), vec!["new process 16", "new thread 16.16"]);

        stub.expect("vCont;c", &["T05fork:p11.11;thread:p10.10;"]);
        target
            .resume(ThreadId::ALL, ResumeRequest::default(), ThreadId::ALL)
            .unwrap();
        let stop = target.wait().unwrap();
        assert_eq!(stop.fork_child(), Some(ThreadId::new(0x11, 0x11)));
        assert!(!target.registry().inferior(0x10).unwrap().may_wildcard);

        // parent is resumed alone until the fork is followed
        stub.expect("vCont;c:p10.10", &["T05thread:p10.10;"]);
        target
            .resume(ThreadId::ALL, ResumeRequest::default(), ThreadId::ALL)
            .unwrap();
        target.wait().unwrap();

        stub.expect("D;11", &["OK"]);
        target.follow_fork(0x10, FollowFork::DetachChild).unwrap();
        assert!(target.registry().inferior(0x10).unwrap().may_wildcard);
        assert!(matches!(
            target.follow_fork(0x10, FollowFork::KeepChild),
            Err(Error::ThreadNotFound(_))
        ));

        stub.expect("vKill;10", &["OK"]);
        target.kill(0x10).unwrap();
        assert!(target.registry().is_empty());
        assert!(!target.session().is_closed());
        assert!(stub.script_done());
    }

    #[test]
    fn test_remote_kind_restrictions() {
        let stub = FakeStub::with_acks();
        stub.expect(SUPPORTED, &[""])
            .expect("vCont?", &[""])
            .expect("?", &["S05"])
            .expect("qfThreadInfo", &[""])
            .expect("qC", &[""]);
        let events = Events::default();
        let mut target = connect(&stub, TargetKind::Remote, SessionConfig::default(), &events);

        // target without threads
        assert_eq!(target.initial_stop().unwrap().ptid, ThreadId::MAGIC_NULL);
        assert!(target.registry().thread(ThreadId::MAGIC_NULL).is_some());
        assert!(matches!(target.attach(1), Err(Error::NotExtended)));
        assert!(matches!(
            target.run("/bin/true", &[]),
            Err(Error::NotExtended)
        ));

        stub.expect("D", &["OK"]);
        target.detach(ThreadId::MAGIC_NULL.pid).unwrap();
        assert!(target.session().is_closed());
        assert!(target.registry().is_empty());
    }

    #[test]
    fn test_empty_thread_listing_keeps_placeholder() {
        let stub = FakeStub::with_acks();
        stub.expect(SUPPORTED, &[""])
            .expect("vCont?", &[""])
            .expect("?", &["S05"])
            .expect("qfThreadInfo", &["l"])
            .expect("qC", &[""]);
        let events = Events::default();
        let mut target = connect(&stub, TargetKind::Remote, SessionConfig::default(), &events);
        assert!(target.registry().thread(ThreadId::MAGIC_NULL).is_some());

        stub.expect("qfThreadInfo", &["l"]);
        target.update_thread_list().unwrap();
        assert!(target.registry().thread(ThreadId::MAGIC_NULL).is_some());
        assert!(!events.take().iter().any(|e| e.starts_with("exit")));
        assert!(stub.script_done());
    }

    #[test]
    fn test_exit_and_thread_events() {
        let stub = FakeStub::with_acks();
        let events = Events::default();
        let mut target = connect_extended(&stub, &events);

        stub.expect("vAttach;20", &["T13thread:p20.1;"])
            .expect("qfThreadInfo", &["mp20.1,p20.2"])
            .expect("qsThreadInfo", &["l"]);
        target.attach(0x20).unwrap();
        assert!(target.registry().inferior(0x20).unwrap().attached);
        assert_eq!(
            events.take(),
            vec!["new process 32", "new thread 32.1", "new thread 32.2"]
        );

        stub.expect("vCont;c", &["w0;p20.2"]);
        target
            .resume(ThreadId::ALL, ResumeRequest::default(), ThreadId::ALL)
            .unwrap();
        target.wait().unwrap();
        assert!(target.registry().thread(ThreadId::new(0x20, 2)).is_none());
        assert_eq!(events.take(), vec!["exit thread 32.2"]);

        stub.expect("vCont;c", &["W01;process:20"]);
        target
            .resume(ThreadId::ALL, ResumeRequest::default(), ThreadId::ALL)
            .unwrap();
        let stop = target.wait().unwrap();
        assert!(matches!(stop.kind, StopKind::Exited { status: 1 }));
        assert!(target.registry().inferior(0x20).is_none());
        assert_eq!(target.current_thread(), None);
        assert!(stub.script_done());
    }

    #[test]
    fn test_running_target_guards() {
        let stub = FakeStub::with_acks();
        let events = Events::default();
        let mut target = connect_extended(&stub, &events);

        stub.expect("vAttach;5", &["T05thread:p5.5;"])
            .expect("qfThreadInfo", &["mp5.5"])
            .expect("qsThreadInfo", &["l"]);
        target.attach(5).unwrap();
        assert_eq!(target.current_thread(), Some(ThreadId::new(5, 5)));

        stub.expect("vCont;s:p5.5", &[]);
        let step = ResumeRequest {
            step: true,
            ..ResumeRequest::default()
        };
        target
            .resume(ThreadId::new(5, 5), step, ThreadId::new(5, 5))
            .unwrap();

        let mut buf = [0; 4];
        assert!(matches!(
            target.read_memory(0x1000, &mut buf),
            Err(Error::TargetRunning)
        ));
        assert!(matches!(
            target.insert_breakpoint(&Breakpoint::new(BreakpointKind::Software, 0x1000, 1)),
            Err(Error::TargetRunning)
        ));
        assert!(matches!(target.detach(5), Err(Error::TargetRunning)));
        assert!(matches!(
            target.resume(ThreadId::ALL, ResumeRequest::default(), ThreadId::ALL),
            Err(Error::TargetRunning)
        ));
        assert!(stub.script_done());
    }

    #[test]
    fn test_non_stop_wait() {
        let stub = FakeStub::with_acks();
        stub.expect(SUPPORTED, &["PacketSize=400;QStartNoAckMode+;multiprocess+"])
            .expect("QStartNoAckMode", &["OK"])
            .expect("QNonStop:1", &["OK"])
            .expect("vCont?", &["vCont;c;C;s;S;t"])
            .expect("?", &["T00thread:p1.1;"])
            .expect("vStopped", &["T00thread:p1.2;"])
            .expect("vStopped", &["OK"])
            .expect("qfThreadInfo", &["mp1.1,p1.2"])
            .expect("qsThreadInfo", &["l"])
            .expect("qC", &["QCp1.1"]);
        // the stub does not announce `QNonStop`, support is forced
        let mut config = SessionConfig {
            non_stop: true,
            ..SessionConfig::default()
        };
        config.packets.insert("QNonStop".to_string(), Detect::On);
        let events = Events::default();
        let mut target = connect(&stub, TargetKind::Remote, config, &events);
        assert_eq!(target.controller().state(), ControllerState::NonStopActive);
        assert!(target
            .registry()
            .threads()
            .all(|t| t.state == ThreadState::Stopped));

        stub.expect("vCont;c", &["OK", "%Stop:T05thread:p1.2;"])
            .expect("vStopped", &["OK"]);
        target
            .resume(ThreadId::ALL, ResumeRequest::default(), ThreadId::ALL)
            .unwrap();
        let stop = target.wait().unwrap();
        assert_eq!(stop.ptid, ThreadId::new(1, 2));
        let registry = target.registry();
        assert!(registry.thread(ThreadId::new(1, 2)).unwrap().is_stopped());
        assert!(!registry.thread(ThreadId::new(1, 1)).unwrap().is_stopped());
        assert!(target.poll().unwrap().is_none());
        assert!(stub.script_done());
    }
}
