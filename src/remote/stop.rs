//! Stop reply model and parser.

use crate::remote::error::Error;
use crate::remote::packet::{hex_byte, hex_decode, parse_hex_i64, parse_hex_u64};
use crate::remote::ptid::ThreadId;
use crate::rsp_debug;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Write,
    Read,
    Access,
}

/// Why a thread stopped with a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// No special reason, just a signal.
    Signal,
    Watchpoint { kind: WatchKind, addr: u64 },
    SwBreak,
    HwBreak,
    /// Shared library list changed.
    Library,
    /// Replay reached the beginning or the end of the execution log.
    ReplayLog { begin: bool },
    Fork { child: ThreadId },
    VFork { child: ThreadId },
    VForkDone,
    Exec { path: String },
    ThreadCreated,
    SyscallEntry(u64),
    SyscallReturn(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopKind {
    Stopped { signal: u8, reason: StopReason },
    /// Process exited normally.
    Exited { status: u8 },
    /// Process terminated by a signal.
    Signalled { signal: u8 },
    ThreadExited { status: u32 },
    /// No resumed threads left to wait for.
    NoResumed,
}

/// Register value reported directly in a stop reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpeditedRegister {
    pub regnum: u32,
    /// `None` if the stub reports the value as unavailable.
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReply {
    /// Stopped thread, [`ThreadId::NULL`] if the reply names none.
    pub ptid: ThreadId,
    pub kind: StopKind,
    pub core: Option<u32>,
    pub registers: Vec<ExpeditedRegister>,
}

impl StopReply {
    /// Parse a stop reply payload (`T`, `S`, `W`, `X`, `w` or `N` packet).
    /// Bare thread ids are attributed to `default_pid`.
    pub fn parse(payload: &[u8], default_pid: Option<i64>) -> Result<Self, Error> {
        let (&kind, body) = payload
            .split_first()
            .ok_or_else(|| Error::malformed("empty stop reply"))?;

        let mut reply = StopReply {
            ptid: ThreadId::NULL,
            kind: StopKind::NoResumed,
            core: None,
            registers: vec![],
        };

        match kind {
            b'S' => {
                reply.kind = StopKind::Stopped {
                    signal: parse_code(body)?,
                    reason: StopReason::Signal,
                };
            }
            b'T' => {
                let signal = parse_code(body)?;
                let reason = reply.parse_pairs(&body[2..], default_pid)?;
                reply.kind = StopKind::Stopped { signal, reason };
            }
            b'W' | b'X' => {
                let code = parse_code(body)?;
                if let Some(pid) = body[2..].strip_prefix(b";process:") {
                    reply.ptid = ThreadId::process(parse_hex_i64(pid)?);
                }
                reply.kind = if kind == b'W' {
                    StopKind::Exited { status: code }
                } else {
                    StopKind::Signalled { signal: code }
                };
            }
            b'w' => {
                let (status, ptid) = body
                    .iter()
                    .position(|&b| b == b';')
                    .map(|sep| (&body[..sep], &body[sep + 1..]))
                    .ok_or_else(|| Error::malformed("thread exit reply without thread id"))?;
                reply.ptid = ThreadId::parse_exact(ptid, default_pid)?;
                let status = u32::try_from(parse_hex_u64(status)?)
                    .map_err(|_| Error::malformed("thread exit status out of range"))?;
                reply.kind = StopKind::ThreadExited { status };
            }
            b'N' => reply.kind = StopKind::NoResumed,
            _ => {
                return Err(Error::malformed(format!(
                    "unknown stop reply `{}`",
                    String::from_utf8_lossy(payload)
                )))
            }
        }
        Ok(reply)
    }

    fn parse_pairs(&mut self, body: &[u8], default_pid: Option<i64>) -> Result<StopReason, Error> {
        let mut reason = StopReason::Signal;

        for pair in body.split(|&b| b == b';').filter(|p| !p.is_empty()) {
            let Some(sep) = pair.iter().position(|&b| b == b':') else {
                rsp_debug!(target: "remote", "stop reply item without value: `{}`", String::from_utf8_lossy(pair));
                continue;
            };
            let (key, value) = (&pair[..sep], &pair[sep + 1..]);

            match key {
                b"thread" => self.ptid = ThreadId::parse_exact(value, default_pid)?,
                b"core" => self.core = Some(parse_hex_u64(value)? as u32),
                b"watch" | b"rwatch" | b"awatch" => {
                    let kind = match key {
                        b"watch" => WatchKind::Write,
                        b"rwatch" => WatchKind::Read,
                        _ => WatchKind::Access,
                    };
                    reason = StopReason::Watchpoint {
                        kind,
                        addr: parse_hex_u64(value)?,
                    };
                }
                b"swbreak" => reason = StopReason::SwBreak,
                b"hwbreak" => reason = StopReason::HwBreak,
                b"library" => reason = StopReason::Library,
                b"replaylog" => {
                    reason = StopReason::ReplayLog {
                        begin: value == b"begin",
                    }
                }
                b"fork" => {
                    reason = StopReason::Fork {
                        child: ThreadId::parse_exact(value, default_pid)?,
                    }
                }
                b"vfork" => {
                    reason = StopReason::VFork {
                        child: ThreadId::parse_exact(value, default_pid)?,
                    }
                }
                b"vforkdone" => reason = StopReason::VForkDone,
                b"exec" => {
                    reason = StopReason::Exec {
                        path: String::from_utf8(hex_decode(value)?)?,
                    }
                }
                b"create" => reason = StopReason::ThreadCreated,
                b"syscall_entry" => reason = StopReason::SyscallEntry(parse_hex_u64(value)?),
                b"syscall_return" => reason = StopReason::SyscallReturn(parse_hex_u64(value)?),
                _ if key.iter().all(u8::is_ascii_hexdigit) => {
                    let regnum = parse_hex_u64(key)? as u32;
                    let value = if value.iter().all(|&b| b == b'x') {
                        None
                    } else {
                        Some(hex_decode(value)?)
                    };
                    self.registers.push(ExpeditedRegister { regnum, value });
                }
                _ => rsp_debug!(
                    target: "remote",
                    "unknown stop reply key `{}` ignored",
                    String::from_utf8_lossy(key)
                ),
            }
        }

        Ok(reason)
    }

    /// Return child of a fork or vfork event.
    pub fn fork_child(&self) -> Option<ThreadId> {
        match &self.kind {
            StopKind::Stopped {
                reason: StopReason::Fork { child } | StopReason::VFork { child },
                ..
            } => Some(*child),
            _ => None,
        }
    }

    pub fn signal(&self) -> Option<u8> {
        match self.kind {
            StopKind::Stopped { signal, .. } | StopKind::Signalled { signal } => Some(signal),
            _ => None,
        }
    }

    /// True if the reply reports a whole process end.
    pub fn is_process_exit(&self) -> bool {
        matches!(
            self.kind,
            StopKind::Exited { .. } | StopKind::Signalled { .. }
        )
    }

    pub fn watch_addr(&self) -> Option<u64> {
        match self.kind {
            StopKind::Stopped {
                reason: StopReason::Watchpoint { addr, .. },
                ..
            } => Some(addr),
            _ => None,
        }
    }
}

fn parse_code(body: &[u8]) -> Result<u8, Error> {
    match body {
        [hi, lo, ..] => hex_byte(*hi, *lo),
        _ => Err(Error::malformed("stop reply without signal or status code")),
    }
}

impl Display for StopReply {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            StopKind::Stopped { signal, reason } => {
                write!(f, "{} stopped with signal {signal} ({reason:?})", self.ptid)
            }
            StopKind::Exited { status } => write!(f, "{} exited with status {status}", self.ptid),
            StopKind::Signalled { signal } => {
                write!(f, "{} terminated by signal {signal}", self.ptid)
            }
            StopKind::ThreadExited { status } => {
                write!(f, "{} exited with status {status}", self.ptid)
            }
            StopKind::NoResumed => f.write_str("no resumed threads"),
        }
    }
}
