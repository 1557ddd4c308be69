//! Trace experiment control: tracepoint download, start/stop, status and frame selection.

use crate::remote::error::Error;
use crate::remote::feature::Feature;
use crate::remote::packet::{hex_encode, parse_hex_i64, split_hex};
use crate::remote::session::Session;
use indexmap::IndexMap;
use crate::rsp_debug;
use std::fmt::Write;

/// Data collected when a tracepoint is hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceAction {
    /// Collect registers by bit mask.
    Registers(u64),
    /// Collect memory at `basereg + offset`, `basereg` -1 means an absolute address.
    Memory { basereg: i32, offset: u64, len: u64 },
    /// Evaluate agent expression and collect what it touches.
    Expression(Vec<u8>),
}

impl TraceAction {
    fn encode(&self, buf: &mut String) {
        match self {
            TraceAction::Registers(mask) => {
                _ = write!(buf, "R{mask:x}");
            }
            TraceAction::Memory {
                basereg,
                offset,
                len,
            } => {
                let sign = if *basereg < 0 { "-" } else { "" };
                _ = write!(
                    buf,
                    "M{sign}{:x},{offset:x},{len:x}",
                    basereg.unsigned_abs()
                );
            }
            TraceAction::Expression(bytecode) => {
                _ = write!(buf, "X{:x},{}", bytecode.len(), hex_encode(bytecode));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracepoint {
    pub number: u32,
    pub addr: u64,
    pub enabled: bool,
    /// Single steps to collect after hit.
    pub step_count: u64,
    /// Stop the experiment after this number of hits, 0 means never.
    pub pass_count: u64,
    /// Condition bytecode.
    pub condition: Option<Vec<u8>>,
    pub actions: Vec<TraceAction>,
}

/// Trace experiment status from `qTStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TraceStatus {
    pub running: bool,
    /// Status fields, like `tframes` or `tstop`, in reported order.
    pub fields: IndexMap<String, String>,
}

impl TraceStatus {
    pub fn parse(reply: &[u8]) -> Result<Self, Error> {
        let reply = std::str::from_utf8(reply)?;
        let mut parts = reply.split(';');
        let running = match parts.next() {
            Some("T1") => true,
            Some("T0") => false,
            _ => return Err(Error::malformed(format!("trace status `{reply}`"))),
        };

        let fields = parts
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once(':') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (p.to_string(), String::new()),
            })
            .collect();
        Ok(Self { running, fields })
    }

    /// Number of collected frames.
    pub fn frames(&self) -> Option<u64> {
        self.fields
            .get("tframes")
            .and_then(|v| u64::from_str_radix(v, 16).ok())
    }
}

/// Result of a trace frame selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFrame {
    Found { frame: i64, tracepoint: i64 },
    /// No such frame, target is back to live state.
    NotFound,
}

impl TraceFrame {
    fn parse(request: &[u8], reply: &[u8]) -> Result<Self, Error> {
        let body = reply
            .strip_prefix(b"F")
            .ok_or_else(|| Error::unexpected(request, reply))?;
        let (frame, rest) = split_hex(body);
        let frame = parse_hex_i64(frame)?;
        if frame == -1 {
            return Ok(TraceFrame::NotFound);
        }
        let tracepoint = match rest.strip_prefix(b"T") {
            Some(tp) => parse_hex_i64(tp)?,
            None => -1,
        };
        Ok(TraceFrame::Found { frame, tracepoint })
    }
}

impl Session {
    /// Clear tracepoints and collected data on the target.
    pub fn trace_init(&mut self) -> Result<(), Error> {
        self.request_ok(Feature::Trace, b"QTinit")
    }

    /// Download a tracepoint definition followed by its actions.
    pub fn trace_define(&mut self, tp: &Tracepoint) -> Result<(), Error> {
        let more = !tp.actions.is_empty();
        let mut request = format!(
            "QTDP:{:x}:{:x}:{}:{:x}:{:x}",
            tp.number,
            tp.addr,
            if tp.enabled { 'E' } else { 'D' },
            tp.step_count,
            tp.pass_count
        );
        if let Some(cond) = &tp.condition {
            if !self
                .features()
                .is_enabled(Feature::ConditionalTracepoints)
            {
                return Err(Error::PacketUnsupported(
                    Feature::ConditionalTracepoints.name(),
                ));
            }
            _ = write!(request, ":X{:x},{}", cond.len(), hex_encode(cond));
        }
        if more {
            request.push('-');
        }
        self.exchange_ok(request.as_bytes())?;

        for (i, action) in tp.actions.iter().enumerate() {
            let mut request = format!("QTDP:-{:x}:{:x}:", tp.number, tp.addr);
            action.encode(&mut request);
            if i + 1 < tp.actions.len() {
                request.push('-');
            }
            self.exchange_ok(request.as_bytes())?;
        }
        rsp_debug!(target: "remote", "tracepoint {} downloaded with {} actions", tp.number, tp.actions.len());
        Ok(())
    }

    pub fn trace_start(&mut self) -> Result<(), Error> {
        self.exchange_ok(b"QTStart")
    }

    pub fn trace_stop(&mut self) -> Result<(), Error> {
        self.exchange_ok(b"QTStop")
    }

    pub fn trace_status(&mut self) -> Result<TraceStatus, Error> {
        let reply = self.request(Feature::Trace, b"qTStatus")?;
        TraceStatus::parse(&reply)
    }

    /// Select a trace frame by number, `-1` returns to the live target.
    pub fn trace_select_frame(&mut self, frame: i64) -> Result<TraceFrame, Error> {
        let request = if frame < 0 {
            "QTFrame:-1".to_string()
        } else {
            format!("QTFrame:{frame:x}")
        };
        let reply = self.exchange_checked(request.as_bytes())?;
        // some stubs answer `OK` to a return to the live target
        if reply == "OK" {
            return Ok(TraceFrame::NotFound);
        }
        TraceFrame::parse(request.as_bytes(), &reply)
    }
}
