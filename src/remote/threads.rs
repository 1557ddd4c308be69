//! Thread listing and thread related queries.

use crate::remote::error::Error;
use crate::remote::feature::Feature;
use crate::remote::packet::{hex_decode, parse_hex_u64};
use crate::remote::ptid::ThreadId;
use crate::remote::session::Session;
use crate::weak_error;
use crate::rsp_debug;
use once_cell::sync;
use regex::Regex;

/// Thread as reported by a thread listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedThread {
    pub ptid: ThreadId,
    pub core: Option<u32>,
    pub name: Option<String>,
    pub handle: Option<Vec<u8>>,
}

impl ListedThread {
    fn new(ptid: ThreadId) -> Self {
        Self {
            ptid,
            core: None,
            name: None,
            handle: None,
        }
    }
}

/// Parse `qXfer:threads:read` document.
pub fn parse_threads_xml(xml: &str, default_pid: Option<i64>) -> Result<Vec<ListedThread>, Error> {
    static THREAD_RE: sync::Lazy<Regex> =
        sync::Lazy::new(|| Regex::new(r"<thread\s([^>]*?)/?>").expect("must compile"));
    static ATTR_RE: sync::Lazy<Regex> =
        sync::Lazy::new(|| Regex::new(r#"([\w-]+)\s*=\s*"([^"]*)""#).expect("must compile"));

    let mut threads = vec![];
    for (_, [attrs]) in THREAD_RE.captures_iter(xml).map(|c| c.extract()) {
        let mut thread = None;
        let mut core = None;
        let mut name = None;
        let mut handle = None;

        for (_, [key, value]) in ATTR_RE.captures_iter(attrs).map(|c| c.extract()) {
            match key {
                "id" => thread = Some(ThreadId::parse_exact(value.as_bytes(), default_pid)?),
                "core" => core = weak_error!(parse_hex_u64(value.as_bytes())).map(|c| c as u32),
                "name" => name = Some(unescape_xml(value)),
                "handle" => handle = weak_error!(hex_decode(value.as_bytes())),
                _ => {}
            }
        }

        let ptid = thread.ok_or_else(|| Error::malformed("thread element without id"))?;
        threads.push(ListedThread {
            ptid,
            core,
            name,
            handle,
        });
    }
    Ok(threads)
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

impl Session {
    fn default_pid(&self) -> Option<i64> {
        self.general_thread
            .filter(|t| !t.is_wildcard() && !t.is_null() && t.pid > 0)
            .map(|t| t.pid)
    }

    /// Select thread for register and memory operations (`Hg`), sent only on change.
    pub fn set_general_thread(&mut self, ptid: ThreadId) -> Result<(), Error> {
        if self.general_thread == Some(ptid) {
            return Ok(());
        }
        let request = format!("Hg{}", ptid.encode(self.multiprocess()));
        self.exchange_ok(request.as_bytes())?;
        self.general_thread = Some(ptid);
        Ok(())
    }

    /// Select thread for legacy `c`/`s` resumption (`Hc`), sent only on change.
    pub fn set_continue_thread(&mut self, ptid: ThreadId) -> Result<(), Error> {
        if self.continue_thread == Some(ptid) {
            return Ok(());
        }
        let request = format!("Hc{}", ptid.encode(self.multiprocess()));
        self.exchange_ok(request.as_bytes())?;
        self.continue_thread = Some(ptid);
        Ok(())
    }

    /// Forget thread selections, a stub resets them after a process change.
    pub fn reset_thread_selection(&mut self) {
        self.general_thread = None;
        self.continue_thread = None;
    }

    /// List all threads of the target.
    /// `qXfer:threads:read` is used when enabled, otherwise `qfThreadInfo`/`qsThreadInfo`.
    pub fn list_threads(&mut self) -> Result<Vec<ListedThread>, Error> {
        let default_pid = self.default_pid();
        if self.features().is_enabled(Feature::XferThreads) {
            let xml = self.xfer_read(Feature::XferThreads, "threads", "")?;
            return parse_threads_xml(&String::from_utf8_lossy(&xml), default_pid);
        }

        let mut threads = vec![];
        let mut reply = self.request(Feature::ThreadInfo, b"qfThreadInfo")?;
        loop {
            match reply.split_first() {
                Some((b'm', ids)) => {
                    for id in ids.split(|&b| b == b',').filter(|id| !id.is_empty()) {
                        threads.push(ListedThread::new(ThreadId::parse_exact(id, default_pid)?));
                    }
                }
                Some((b'l', _)) => break,
                _ => return Err(Error::unexpected(b"qsThreadInfo", &reply)),
            }
            reply = self.exchange_checked(b"qsThreadInfo")?;
        }
        rsp_debug!(target: "remote", "thread listing: {} threads", threads.len());
        Ok(threads)
    }

    /// Ask for the current thread (`qC`). Return `None` if the stub doesn't tell.
    pub fn current_thread(&mut self) -> Result<Option<ThreadId>, Error> {
        let default_pid = self.default_pid();
        let reply = match self.request(Feature::CurrentThread, b"qC") {
            Ok(reply) => reply,
            Err(Error::PacketUnsupported(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        match reply.strip_prefix(b"QC") {
            Some(id) => Ok(Some(ThreadId::parse_exact(id, default_pid)?)),
            None => Ok(None),
        }
    }

    /// Check that thread still exists (`T`).
    pub fn thread_alive(&mut self, ptid: ThreadId) -> Result<bool, Error> {
        if ptid.is_magic() {
            return Ok(true);
        }
        let request = format!("T{}", ptid.encode(self.multiprocess()));
        match self.request(Feature::ThreadAlive, request.as_bytes()) {
            Ok(reply) => Ok(reply == "OK"),
            Err(Error::PacketRejected(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Human readable thread description (`qThreadExtraInfo`).
    pub fn thread_extra_info(&mut self, ptid: ThreadId) -> Result<Option<String>, Error> {
        let request = format!("qThreadExtraInfo,{}", ptid.encode(self.multiprocess()));
        match self.request(Feature::ThreadExtraInfo, request.as_bytes()) {
            Ok(reply) => Ok(Some(String::from_utf8(hex_decode(&reply)?)?)),
            Err(Error::PacketUnsupported(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
