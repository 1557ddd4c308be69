//! Per-connection protocol state and the send/acknowledge/retry cycle.

use crate::config::{InterruptSequence, SessionConfig};
use crate::remote::error::{Error, RemoteError};
use crate::remote::feature::{Feature, FeatureSet, Support};
use crate::remote::io::{FrameReader, LinkEvent};
use crate::remote::packet;
use crate::remote::packet::{ACK, FRAME_OVERHEAD, INTERRUPT, NACK};
use crate::remote::ptid::ThreadId;
use crate::remote::register::RegisterLayout;
use crate::remote::target::{EventHook, NoopHook};
use crate::remote::transport::{InterruptFlag, Transport};
use bytes::Bytes;
use crate::{rsp_debug, rsp_error, rsp_warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

/// Retry ceiling for a single packet exchange.
pub const MAX_TRIES: u32 = 3;
/// Packet size assumed until the stub reports its own.
pub const DEFAULT_PACKET_SIZE: usize = 399;
/// Upper bound for a negotiated packet size.
pub const MAX_PACKET_SIZE: usize = 16384;

/// How long to wait for an incoming packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Ordinary reply to a request, bounded by reply timeout.
    Reply,
    /// Stop reply of a resumed target, bounded only by watchdog.
    Forever,
}

enum Incoming {
    Packet(Bytes),
    Notification(Bytes),
}

/// Protocol state of one connection.
pub struct Session {
    transport: Box<dyn Transport>,
    reader: FrameReader,
    config: SessionConfig,
    ack_mode: bool,
    non_stop: bool,
    packet_size: usize,
    features: FeatureSet,
    /// Notifications received out of band, not yet processed.
    notifications: VecDeque<Bytes>,
    interrupt: InterruptFlag,
    hook: Box<dyn EventHook>,
    closed: bool,
    /// Register layouts by architecture name.
    pub(super) layouts: HashMap<String, Arc<RegisterLayout>>,
    /// Last `Hg` selection.
    pub(super) general_thread: Option<ThreadId>,
    /// Last `Hc` selection.
    pub(super) continue_thread: Option<ThreadId>,
}

impl Session {
    pub fn new(transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        let features = FeatureSet::new(&config.packets);
        let mut session = Self {
            transport,
            reader: FrameReader::new(),
            config,
            ack_mode: true,
            non_stop: false,
            packet_size: 0,
            features,
            notifications: VecDeque::new(),
            interrupt: InterruptFlag::default(),
            hook: Box::new(NoopHook),
            closed: false,
            layouts: HashMap::new(),
            general_thread: None,
            continue_thread: None,
        };
        session.set_packet_size(DEFAULT_PACKET_SIZE);
        session
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn features_mut(&mut self) -> &mut FeatureSet {
        &mut self.features
    }

    /// True if thread ids are sent in `p<pid>.<tid>` form.
    pub fn multiprocess(&self) -> bool {
        self.features.is_enabled(Feature::Multiprocess)
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Maximum payload length that fits a single frame.
    pub fn max_payload(&self) -> usize {
        self.packet_size - FRAME_OVERHEAD
    }

    /// Set a negotiated packet size, buffers grow to fit it.
    pub fn set_packet_size(&mut self, size: usize) {
        let limit = self
            .config
            .max_packet_size
            .unwrap_or(MAX_PACKET_SIZE)
            .min(MAX_PACKET_SIZE);
        let size = size.min(limit).max(FRAME_OVERHEAD + 1);
        if size != self.packet_size {
            rsp_debug!(target: "remote", "packet size set to {size}");
        }
        self.packet_size = size;
        self.reader.reserve(size);
    }

    pub fn ack_mode(&self) -> bool {
        self.ack_mode
    }

    pub(crate) fn set_ack_mode(&mut self, on: bool) {
        rsp_debug!(target: "remote", "ack mode {}", if on { "on" } else { "off" });
        self.ack_mode = on;
    }

    pub fn non_stop(&self) -> bool {
        self.non_stop
    }

    pub(crate) fn set_non_stop(&mut self, on: bool) {
        self.non_stop = on;
    }

    /// Flag that interrupts a blocking wait for a stop reply.
    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    pub fn hook(&self) -> &dyn EventHook {
        self.hook.as_ref()
    }

    pub fn set_hook(&mut self, hook: Box<dyn EventHook>) {
        self.hook = hook;
    }

    /// Pop the oldest out-of-band notification.
    pub fn take_notification(&mut self) -> Option<Bytes> {
        self.notifications.pop_front()
    }

    pub fn has_notifications(&self) -> bool {
        !self.notifications.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Mark session as unusable, subsequent operations fail with [`Error::LinkClosed`].
    pub fn close(&mut self) {
        if !self.closed {
            rsp_debug!(target: "remote", "session closed");
        }
        self.closed = true;
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::LinkClosed);
        }
        Ok(())
    }

    /// Close the session on fatal errors.
    fn guard<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(ref e) = result {
            if e.is_fatal() {
                rsp_error!(target: "remote", "{e}");
                self.close();
            }
        }
        result
    }

    fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let result = self.transport.write_all(data);
        self.guard(result)
    }

    fn next_event(&mut self, wait: Wait) -> Result<LinkEvent, Error> {
        let deadline = match wait {
            Wait::Reply => Some(Instant::now() + self.config.reply_timeout()),
            Wait::Forever => self.config.watchdog().map(|w| Instant::now() + w),
        };
        let interrupt = (wait == Wait::Forever).then_some(&self.interrupt);
        let event = self
            .reader
            .next_event(self.transport.as_mut(), deadline, interrupt);
        self.guard(event)
    }

    /// Send a packet, in ack mode wait for acknowledgement and retransmit if needed.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.check_open()?;
        if payload.len() > self.max_payload() {
            rsp_warn!(target: "remote", "packet of {} bytes exceeds packet size {}", payload.len(), self.packet_size);
        }
        rsp_debug!(target: "remote", "-> {}", String::from_utf8_lossy(payload));

        let frame = packet::encode(payload);
        for _ in 0..MAX_TRIES {
            self.write(&frame)?;
            if !self.ack_mode {
                return Ok(());
            }

            loop {
                match self.next_event(Wait::Reply)? {
                    LinkEvent::Ack => return Ok(()),
                    LinkEvent::Nack => {
                        rsp_warn!(target: "remote", "packet rejected by remote side, retransmit");
                        break;
                    }
                    LinkEvent::Timeout => {
                        rsp_warn!(target: "remote", "no acknowledgement, retransmit");
                        break;
                    }
                    LinkEvent::Packet(stale) => {
                        rsp_debug!(target: "remote", "stale reply dropped: {}", String::from_utf8_lossy(&stale));
                        self.write(&[ACK])?;
                    }
                    LinkEvent::Notification(n) => self.notifications.push_back(n),
                    LinkEvent::BadChecksum { .. }
                    | LinkEvent::Malformed(_)
                    | LinkEvent::Interrupted => {}
                }
            }
        }
        Err(Error::PacketLost(MAX_TRIES))
    }

    /// Ask for retransmission of a damaged frame, give up after [`MAX_TRIES`].
    fn reject_frame(&mut self, tries: u32) -> Result<(), Error> {
        if tries >= MAX_TRIES {
            self.write(&[ACK])?;
            return Err(Error::PacketLost(tries));
        }
        self.write(&[NACK])
    }

    fn read_incoming(&mut self, wait: Wait, notifications: bool) -> Result<Incoming, Error> {
        self.check_open()?;
        let mut tries = 0;
        let mut interrupts = 0;

        loop {
            if notifications {
                if let Some(n) = self.notifications.pop_front() {
                    return Ok(Incoming::Notification(n));
                }
            }

            match self.next_event(wait)? {
                LinkEvent::Packet(payload) => {
                    if self.ack_mode {
                        self.write(&[ACK])?;
                    }
                    rsp_debug!(target: "remote", "<- {}", String::from_utf8_lossy(&payload));
                    return Ok(Incoming::Packet(payload));
                }
                LinkEvent::Notification(payload) => {
                    rsp_debug!(target: "notif", "<- %{}", String::from_utf8_lossy(&payload));
                    if notifications {
                        return Ok(Incoming::Notification(payload));
                    }
                    self.notifications.push_back(payload);
                }
                LinkEvent::BadChecksum { expected, computed } => {
                    rsp_warn!(target: "remote", "bad checksum: expected {expected:#04x}, computed {computed:#04x}");
                    if !self.ack_mode {
                        return Err(Error::Checksum { expected, computed });
                    }
                    tries += 1;
                    self.reject_frame(tries)?;
                }
                LinkEvent::Malformed(reason) => {
                    if !self.ack_mode {
                        return Err(Error::MalformedPacket(reason));
                    }
                    tries += 1;
                    self.reject_frame(tries)?;
                }
                LinkEvent::Timeout => match wait {
                    Wait::Forever => {
                        rsp_error!(target: "remote", "watchdog timeout has expired");
                        self.close();
                        return Err(Error::WatchdogTimeout);
                    }
                    Wait::Reply => {
                        tries += 1;
                        rsp_warn!(target: "remote", "reply timeout ({tries}/{MAX_TRIES})");
                        if tries >= MAX_TRIES {
                            return Err(Error::PacketLost(tries));
                        }
                    }
                },
                LinkEvent::Ack | LinkEvent::Nack => {
                    rsp_debug!(target: "remote", "stray acknowledgement ignored")
                }
                LinkEvent::Interrupted => {
                    self.interrupt.take();
                    interrupts += 1;
                    if interrupts == 1 {
                        self.interrupt_target()?;
                    } else if self.hook.abandon_on_interrupt() {
                        self.close();
                        return Err(Error::Abandoned);
                    }
                }
            }
        }
    }

    /// Receive a packet, notifications that arrive meanwhile are queued.
    pub fn receive(&mut self, wait: Wait) -> Result<Bytes, Error> {
        match self.read_incoming(wait, false)? {
            Incoming::Packet(payload) => Ok(payload),
            Incoming::Notification(_) => unreachable!("notifications are queued"),
        }
    }

    /// Block until a notification arrives (non-stop mode).
    pub fn wait_notification(&mut self) -> Result<Bytes, Error> {
        loop {
            match self.read_incoming(Wait::Forever, true)? {
                Incoming::Notification(n) => return Ok(n),
                Incoming::Packet(p) => {
                    rsp_warn!(target: "notif", "unexpected packet while waiting for notification: {}", String::from_utf8_lossy(&p))
                }
            }
        }
    }

    /// Send a request and wait for its reply.
    pub fn exchange(&mut self, payload: &[u8]) -> Result<Bytes, Error> {
        self.send(payload)?;
        self.receive(Wait::Reply)
    }

    /// Send a request, failure reply is turned into [`Error::PacketRejected`].
    pub fn exchange_checked(&mut self, payload: &[u8]) -> Result<Bytes, Error> {
        let reply = self.exchange(payload)?;
        if let Some(e) = RemoteError::parse(&reply) {
            return Err(Error::PacketRejected(e));
        }
        if reply.is_empty() {
            return Err(Error::unexpected(payload, &reply));
        }
        Ok(reply)
    }

    /// Send a request that must be answered with `OK`.
    pub fn exchange_ok(&mut self, payload: &[u8]) -> Result<(), Error> {
        let reply = self.exchange_checked(payload)?;
        expect_ok(payload, &reply)
    }

    /// Send a request guarded by a capability.
    ///
    /// A disabled feature fails without sending. Empty reply marks feature as disabled,
    /// any other reply marks it enabled.
    pub fn request(&mut self, feature: Feature, payload: &[u8]) -> Result<Bytes, Error> {
        if self.features.support(feature) == Support::Disabled {
            return Err(Error::PacketUnsupported(feature.name()));
        }

        let reply = self.exchange(payload)?;
        if reply.is_empty() {
            self.features.observe(feature, Support::Disabled);
            return Err(Error::PacketUnsupported(feature.name()));
        }
        self.features.observe(feature, Support::Enabled);
        if let Some(e) = RemoteError::parse(&reply) {
            return Err(Error::PacketRejected(e));
        }
        Ok(reply)
    }

    /// Capability guarded request that must be answered with `OK`.
    pub fn request_ok(&mut self, feature: Feature, payload: &[u8]) -> Result<(), Error> {
        let reply = self.request(feature, payload)?;
        expect_ok(payload, &reply)
    }

    /// Read a whole `qXfer` object in packet sized chunks.
    pub fn xfer_read(&mut self, feature: Feature, object: &str, annex: &str) -> Result<Vec<u8>, Error> {
        let mut data = vec![];
        loop {
            let request = format!(
                "qXfer:{object}:read:{annex}:{:x},{:x}",
                data.len(),
                self.max_payload()
            );
            let reply = self.request(feature, request.as_bytes())?;
            let (last, chunk) = match reply.split_first() {
                Some((b'l', chunk)) => (true, chunk),
                Some((b'm', chunk)) => (false, chunk),
                _ => return Err(Error::unexpected(request.as_bytes(), &reply)),
            };
            let chunk = packet::unescape_binary(chunk)?;
            if !last && chunk.is_empty() {
                return Err(Error::unexpected(request.as_bytes(), &reply));
            }
            data.extend_from_slice(&chunk);
            if last {
                return Ok(data);
            }
        }
    }

    /// Deliver an interrupt to a running target.
    pub fn interrupt_target(&mut self) -> Result<(), Error> {
        if self.non_stop {
            return match self.request_ok(Feature::VCtrlC, b"vCtrlC") {
                Err(Error::PacketUnsupported(_)) => self.exchange_ok(b"vCont;t"),
                result => result,
            };
        }

        rsp_debug!(target: "remote", "send interrupt sequence `{}`", self.config.interrupt_sequence);
        match self.config.interrupt_sequence {
            InterruptSequence::CtrlC => self.write(&[INTERRUPT]),
            InterruptSequence::Break => self.send_break(),
            InterruptSequence::BreakG => {
                self.send_break()?;
                self.write(b"g")
            }
        }
    }

    fn send_break(&mut self) -> Result<(), Error> {
        let result = self.transport.send_break();
        self.guard(result)
    }
}

pub(crate) fn expect_ok(request: &[u8], reply: &[u8]) -> Result<(), Error> {
    if reply == b"OK" {
        return Ok(());
    }
    if let Some(e) = RemoteError::parse(reply) {
        return Err(Error::PacketRejected(e));
    }
    Err(Error::unexpected(request, reply))
}
