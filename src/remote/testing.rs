//! Scripted in-memory stub for engine tests.

use crate::remote::error::Error;
use crate::remote::io::{FrameReader, LinkEvent};
use crate::remote::packet;
use crate::remote::transport::{ReadChar, Transport};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    incoming: VecDeque<u8>,
    script: VecDeque<(String, Vec<u8>)>,
    requests: Vec<String>,
    acks: usize,
    nacks: usize,
    interrupts: usize,
    breaks: usize,
    on_interrupt: Vec<u8>,
    ack_mode: bool,
    closed: bool,
}

/// Fake stub: answers client packets from a script of `(request, raw reply bytes)`.
///
/// Clones share state, so a test keeps one clone for assertions and gives another
/// to a session.
#[derive(Clone, Default)]
pub struct FakeStub {
    inner: Arc<Mutex<Inner>>,
    parser: Arc<Mutex<FrameReader>>,
}

impl FakeStub {
    /// Stub that acknowledges every received packet with `+`.
    pub fn with_acks() -> Self {
        let stub = Self::default();
        stub.inner.lock().unwrap().ack_mode = true;
        stub
    }

    pub fn set_ack_mode(&self, on: bool) {
        self.inner.lock().unwrap().ack_mode = on;
    }

    /// Queue raw bytes for the client.
    pub fn push_raw(&self, data: &[u8]) {
        self.inner.lock().unwrap().incoming.extend(data);
    }

    /// Expect `request` and answer with `replies`. Replies starting with `%` are
    /// sent as notifications.
    pub fn expect(&self, request: &str, replies: &[&str]) -> &Self {
        let mut raw = vec![];
        for reply in replies {
            match reply.strip_prefix('%') {
                Some(notification) => {
                    raw.extend(packet::encode_notification(notification.as_bytes()))
                }
                None => raw.extend(packet::encode(reply.as_bytes())),
            }
        }
        self.expect_raw(request, &raw)
    }

    /// Expect `request` and answer with raw bytes.
    pub fn expect_raw(&self, request: &str, raw: &[u8]) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .script
            .push_back((request.to_string(), raw.to_vec()));
        self
    }

    /// Answer the next interrupt byte (or BREAK) with `reply` packet.
    pub fn reply_to_interrupt(&self, reply: &str) {
        self.inner.lock().unwrap().on_interrupt = packet::encode(reply.as_bytes());
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
    }

    /// Packets received from the client.
    pub fn requests(&self) -> Vec<String> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn acks(&self) -> usize {
        self.inner.lock().unwrap().acks
    }

    pub fn nacks(&self) -> usize {
        self.inner.lock().unwrap().nacks
    }

    pub fn interrupts(&self) -> usize {
        self.inner.lock().unwrap().interrupts
    }

    pub fn breaks(&self) -> usize {
        self.inner.lock().unwrap().breaks
    }

    /// True if every scripted exchange happened.
    pub fn script_done(&self) -> bool {
        self.inner.lock().unwrap().script.is_empty()
    }

    fn on_packet(inner: &mut Inner, payload: &[u8]) {
        let request = String::from_utf8_lossy(payload).into_owned();
        if inner.ack_mode {
            inner.incoming.push_back(packet::ACK);
        }
        let expected = inner.script.front().map(|(expected, _)| expected.clone());
        match expected {
            Some(expected) if expected == request => {
                if let Some((_, raw)) = inner.script.pop_front() {
                    inner.incoming.extend(raw);
                }
            }
            Some(expected) => {
                panic!("fake stub: expected request `{expected}`, got `{request}`")
            }
            None => panic!("fake stub: unexpected request `{request}`"),
        }
        inner.requests.push(request);
    }
}

impl Transport for FakeStub {
    fn read_char(&mut self) -> Result<ReadChar, Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.incoming.pop_front() {
            Some(b) => Ok(ReadChar::Byte(b)),
            None if inner.closed => Ok(ReadChar::Eof),
            None => Ok(ReadChar::Timeout),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(Error::LinkClosed);
        }
        let mut parser = self.parser.lock().unwrap();
        for &b in data {
            if b == packet::INTERRUPT {
                inner.interrupts += 1;
                let reply = std::mem::take(&mut inner.on_interrupt);
                inner.incoming.extend(reply);
                continue;
            }
            match parser.feed(b)? {
                Some(LinkEvent::Ack) => inner.acks += 1,
                Some(LinkEvent::Nack) => inner.nacks += 1,
                Some(LinkEvent::Packet(payload)) => Self::on_packet(&mut inner, &payload),
                _ => {}
            }
        }
        Ok(())
    }

    fn send_break(&mut self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.breaks += 1;
        let reply = std::mem::take(&mut inner.on_interrupt);
        inner.incoming.extend(reply);
        Ok(())
    }
}
