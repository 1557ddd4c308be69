//! Demultiplexing of the incoming byte stream into acknowledgements, packets and notifications.

use crate::remote::error::Error;
use crate::remote::packet;
use crate::remote::packet::{
    ACK, CHECKSUM_START, ESCAPE, NACK, NOTIFICATION_START, PACKET_START, RLE_MARKER,
};
use crate::remote::transport::{InterruptFlag, ReadChar, Transport};
use bytes::{Bytes, BytesMut};
use crate::{rsp_debug, rsp_warn};
use std::time::Instant;

/// Something that arrived over the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Ack,
    Nack,
    /// Payload of a `$` frame, run-length sequences expanded.
    Packet(Bytes),
    /// Payload of a `%` frame.
    Notification(Bytes),
    BadChecksum { expected: u8, computed: u8 },
    /// Checksum matched but the payload could not be unpacked.
    Malformed(String),
    /// Deadline expired, a partially received frame is discarded.
    Timeout,
    /// External interrupt was raised, a partially received frame is kept.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Scanning for a frame start or an ack character.
    Idle,
    Payload,
    /// Next payload byte is taken literally (after `}` or `*`).
    Literal,
    Checksum1,
    Checksum2(u8),
}

/// Incremental frame parser, keeps partial frame between calls.
pub struct FrameReader {
    state: State,
    notification: bool,
    raw: BytesMut,
    expanded: BytesMut,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            notification: false,
            raw: BytesMut::with_capacity(512),
            expanded: BytesMut::with_capacity(512),
        }
    }

    /// Grow frame buffers, they never shrink.
    pub fn reserve(&mut self, size: usize) {
        if self.raw.capacity() < size {
            self.raw.reserve(size - self.raw.len());
        }
        if self.expanded.capacity() < size {
            self.expanded.reserve(size - self.expanded.len());
        }
    }

    /// Drop a partially received frame, wait for next frame start.
    pub fn resync(&mut self) {
        if self.state != State::Idle {
            rsp_debug!(target: "transport", "discard partial frame ({} bytes)", self.raw.len());
        }
        self.state = State::Idle;
        self.raw.clear();
    }

    /// Wait for the next link event.
    ///
    /// Return [`LinkEvent::Timeout`] if `deadline` is reached and [`LinkEvent::Interrupted`]
    /// if `interrupt` flag is raised, flag is not reset here.
    pub fn next_event(
        &mut self,
        transport: &mut dyn Transport,
        deadline: Option<Instant>,
        interrupt: Option<&InterruptFlag>,
    ) -> Result<LinkEvent, Error> {
        loop {
            if interrupt.map(|flag| flag.is_raised()).unwrap_or_default() {
                return Ok(LinkEvent::Interrupted);
            }

            match transport.read_char()? {
                ReadChar::Byte(b) => {
                    if let Some(event) = self.feed(b)? {
                        return Ok(event);
                    }
                }
                ReadChar::Timeout => {}
                ReadChar::Eof => return Err(Error::LinkClosed),
            }

            if deadline.map(|d| Instant::now() >= d).unwrap_or_default() {
                self.resync();
                return Ok(LinkEvent::Timeout);
            }
        }
    }

    /// Feed single byte into parser, return an event when complete.
    pub fn feed(&mut self, b: u8) -> Result<Option<LinkEvent>, Error> {
        match self.state {
            State::Idle => match b {
                ACK => return Ok(Some(LinkEvent::Ack)),
                NACK => return Ok(Some(LinkEvent::Nack)),
                PACKET_START | NOTIFICATION_START => {
                    self.notification = b == NOTIFICATION_START;
                    self.raw.clear();
                    self.state = State::Payload;
                }
                _ => rsp_debug!(target: "transport", "skip junk byte {b:#04x}"),
            },
            State::Payload => match b {
                CHECKSUM_START => self.state = State::Checksum1,
                PACKET_START => {
                    rsp_warn!(target: "transport", "frame start inside a frame, restart");
                    self.notification = false;
                    self.raw.clear();
                }
                ESCAPE | RLE_MARKER => {
                    self.raw.extend_from_slice(&[b]);
                    self.state = State::Literal;
                }
                _ => self.raw.extend_from_slice(&[b]),
            },
            State::Literal => {
                self.raw.extend_from_slice(&[b]);
                self.state = State::Payload;
            }
            State::Checksum1 => self.state = State::Checksum2(b),
            State::Checksum2(hi) => {
                self.state = State::Idle;
                let expected = match packet::hex_byte(hi, b) {
                    Ok(cs) => cs,
                    Err(_) => {
                        rsp_warn!(target: "transport", "invalid checksum digits, frame dropped");
                        return Ok(Some(LinkEvent::BadChecksum {
                            expected: 0,
                            computed: packet::checksum(&self.raw),
                        }));
                    }
                };
                let computed = packet::checksum(&self.raw);
                if expected != computed {
                    return Ok(Some(LinkEvent::BadChecksum { expected, computed }));
                }

                self.expanded.clear();
                if let Err(e) = packet::expand(&self.raw, &mut self.expanded) {
                    self.expanded.clear();
                    rsp_warn!(target: "transport", "{e}, frame dropped");
                    return Ok(Some(LinkEvent::Malformed(e.to_string())));
                }
                let payload = self.expanded.split().freeze();
                let event = if self.notification {
                    LinkEvent::Notification(payload)
                } else {
                    LinkEvent::Packet(payload)
                };
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}
