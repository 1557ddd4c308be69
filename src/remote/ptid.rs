use crate::remote::error::Error;
use crate::remote::packet::{parse_hex_i64, split_hex};
use std::fmt::{Display, Formatter};

/// Process id used for threads of a target that reports no process concept.
pub const MAGIC_PID: i64 = 42000;

/// Identity of a thread or process on the remote target (`ptid` in wire terms).
///
/// `tid == 0` denotes a whole process, `tid == -1` means all threads of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId {
    pub pid: i64,
    pub tid: i64,
    synthetic: bool,
}

impl ThreadId {
    /// No thread.
    pub const NULL: ThreadId = ThreadId::new(0, 0);
    /// All threads of all processes.
    pub const ALL: ThreadId = ThreadId::new(-1, 0);
    /// Thread of a target that has no threads at all.
    pub const MAGIC_NULL: ThreadId = ThreadId {
        pid: MAGIC_PID,
        tid: -1,
        synthetic: true,
    };
    /// Any single thread, stub picks one.
    pub const ANY: ThreadId = ThreadId {
        pid: MAGIC_PID,
        tid: 0,
        synthetic: true,
    };

    pub const fn new(pid: i64, tid: i64) -> Self {
        Self {
            pid,
            tid,
            synthetic: false,
        }
    }

    /// Id that denotes a whole process.
    pub const fn process(pid: i64) -> Self {
        Self::new(pid, 0)
    }

    /// Wildcard for all threads of a single process.
    pub const fn all_of(pid: i64) -> Self {
        Self::new(pid, -1)
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn is_all(&self) -> bool {
        *self == Self::ALL
    }

    pub fn is_magic(&self) -> bool {
        *self == Self::MAGIC_NULL
    }

    /// True for an id that names a process or all threads of a process.
    pub fn is_process_wide(&self) -> bool {
        !self.synthetic && self.pid > 0 && (self.tid == 0 || self.tid == -1)
    }

    /// True if the id matches more than one thread.
    pub fn is_wildcard(&self) -> bool {
        self.is_all() || self.is_process_wide()
    }

    /// Return true if `other` thread is covered by this id.
    pub fn matches(&self, other: ThreadId) -> bool {
        if self.is_all() {
            return true;
        }
        if self.is_process_wide() {
            return self.pid == other.pid;
        }
        *self == other
    }

    /// Encode the id for the wire. With `multiprocess` support the
    /// `p<pid>.<tid>` form is used, otherwise only thread id is written.
    pub fn encode(&self, multiprocess: bool) -> String {
        let tid = if *self == Self::ANY {
            "0".to_string()
        } else if self.is_all() || self.tid == -1 {
            "-1".to_string()
        } else {
            hex_signed(self.tid)
        };

        if multiprocess && !self.synthetic {
            if self.is_all() {
                return "p-1".to_string();
            }
            return format!("p{}.{tid}", hex_signed(self.pid));
        }
        tid
    }

    /// Parse an id at the beginning of input, returns id and the rest of input.
    /// A bare thread id is attributed to `default_pid` (or [`MAGIC_PID`] when unknown).
    pub fn parse(input: &[u8], default_pid: Option<i64>) -> Result<(ThreadId, &[u8]), Error> {
        if let Some(rest) = input.strip_prefix(b"p") {
            let (pid_hex, rest) = split_hex(rest);
            let pid = parse_hex_i64(pid_hex)?;
            return match rest.strip_prefix(b".") {
                Some(rest) => {
                    let (tid_hex, rest) = split_hex(rest);
                    let tid = parse_hex_i64(tid_hex)?;
                    Ok((ThreadId::new(pid, tid), rest))
                }
                None if pid == -1 => Ok((ThreadId::ALL, rest)),
                None => Ok((ThreadId::process(pid), rest)),
            };
        }

        let (tid_hex, rest) = split_hex(input);
        let tid = parse_hex_i64(tid_hex)?;
        let id = match (tid, default_pid) {
            (-1, _) => ThreadId::ALL,
            (0, _) => ThreadId::ANY,
            (tid, Some(pid)) => ThreadId::new(pid, tid),
            (tid, None) => ThreadId::new(MAGIC_PID, tid),
        };
        Ok((id, rest))
    }

    /// Parse a whole input as an id.
    pub fn parse_exact(input: &[u8], default_pid: Option<i64>) -> Result<ThreadId, Error> {
        let (id, rest) = Self::parse(input, default_pid)?;
        if !rest.is_empty() {
            return Err(Error::malformed(format!(
                "trailing garbage after thread id: `{}`",
                String::from_utf8_lossy(rest)
            )));
        }
        Ok(id)
    }
}

fn hex_signed(v: i64) -> String {
    if v < 0 {
        format!("-{:x}", v.unsigned_abs())
    } else {
        format!("{v:x}")
    }
}

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            ThreadId::NULL => f.write_str("null"),
            ThreadId::ALL => f.write_str("all"),
            ThreadId::MAGIC_NULL => f.write_str("main"),
            ThreadId::ANY => f.write_str("any"),
            ThreadId { pid, tid: 0, .. } => write!(f, "process {pid}"),
            ThreadId { pid, tid: -1, .. } => write!(f, "process {pid} (all threads)"),
            ThreadId { pid, tid, .. } => write!(f, "thread {pid}.{tid}"),
        }
    }
}
