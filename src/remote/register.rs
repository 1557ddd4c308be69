//! Register transfer: bulk `g`/`G` packets with per-register `p`/`P` fallback.

use crate::remote::error::Error;
use crate::remote::feature::Feature;
use crate::remote::packet::{hex_decode, hex_encode};
use crate::remote::ptid::ThreadId;
use crate::remote::session::{expect_ok, Session};
use crate::remote::stop::ExpeditedRegister;
use crate::rsp_debug;
use std::collections::HashMap;
use std::sync::Arc;

/// Register description supplied by an architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDesc {
    /// Local register number.
    pub regnum: u32,
    /// Register number on the wire.
    pub pnum: u32,
    /// Size in bytes.
    pub size: usize,
    /// True if register is a part of the `g` packet.
    pub in_g_packet: bool,
}

/// Source of register layout for a target architecture.
pub trait Architecture {
    /// Unique architecture name, a key for layout cache.
    fn name(&self) -> &str;

    fn registers(&self) -> Vec<RegisterDesc>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutEntry {
    pub regnum: u32,
    pub pnum: u32,
    pub size: usize,
    /// Byte offset in `g` packet, `None` for registers outside of it.
    pub offset: Option<usize>,
}

/// Register to `g` packet offset map of an architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterLayout {
    entries: Vec<LayoutEntry>,
    g_size: usize,
}

impl RegisterLayout {
    /// Build a layout, `g` packet offsets are assigned in wire number order.
    pub fn new(arch: &dyn Architecture) -> Self {
        let mut registers = arch.registers();
        registers.sort_by_key(|r| r.pnum);

        let mut offset = 0;
        let entries = registers
            .into_iter()
            .map(|r| {
                let entry_offset = r.in_g_packet.then_some(offset);
                if r.in_g_packet {
                    offset += r.size;
                }
                LayoutEntry {
                    regnum: r.regnum,
                    pnum: r.pnum,
                    size: r.size,
                    offset: entry_offset,
                }
            })
            .collect();

        Self {
            entries,
            g_size: offset,
        }
    }

    pub fn get(&self, regnum: u32) -> Option<&LayoutEntry> {
        self.entries.iter().find(|e| e.regnum == regnum)
    }

    pub fn by_pnum(&self, pnum: u32) -> Option<&LayoutEntry> {
        self.entries.iter().find(|e| e.pnum == pnum)
    }

    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    /// Size of the full `g` packet register block in bytes.
    pub fn g_size(&self) -> usize {
        self.g_size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterValue {
    Value(Vec<u8>),
    Unavailable,
}

/// Register values of a single thread, by local register number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterSet {
    values: HashMap<u32, RegisterValue>,
}

impl RegisterSet {
    pub fn get(&self, regnum: u32) -> Option<&RegisterValue> {
        self.values.get(&regnum)
    }

    /// Value of available register.
    pub fn value(&self, regnum: u32) -> Result<&[u8], Error> {
        match self.values.get(&regnum) {
            Some(RegisterValue::Value(v)) => Ok(v),
            Some(RegisterValue::Unavailable) => Err(Error::RegisterUnavailable(regnum)),
            None => Err(Error::RegisterNotFound(regnum)),
        }
    }

    pub fn set(&mut self, regnum: u32, value: RegisterValue) {
        self.values.insert(regnum, value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn decode_value(hex: &[u8]) -> Result<RegisterValue, Error> {
    if hex.iter().any(|&b| b == b'x') {
        return Ok(RegisterValue::Unavailable);
    }
    Ok(RegisterValue::Value(hex_decode(hex)?))
}

impl Session {
    /// Get layout of architecture, calculated once per architecture name.
    pub fn layout(&mut self, arch: &dyn Architecture) -> Arc<RegisterLayout> {
        self.layouts
            .entry(arch.name().to_string())
            .or_insert_with(|| {
                rsp_debug!(target: "remote", "calculate register layout for `{}`", arch.name());
                Arc::new(RegisterLayout::new(arch))
            })
            .clone()
    }

    /// Read all registers of a thread.
    ///
    /// # Arguments
    ///
    /// * `expedited`: values reported with the last stop, used without a round trip
    pub fn fetch_registers(
        &mut self,
        arch: &dyn Architecture,
        ptid: ThreadId,
        expedited: &[ExpeditedRegister],
    ) -> Result<RegisterSet, Error> {
        let layout = self.layout(arch);
        let mut set = RegisterSet::default();

        for reg in expedited {
            if let Some(entry) = layout.by_pnum(reg.regnum) {
                let value = match &reg.value {
                    Some(v) => RegisterValue::Value(v.clone()),
                    None => RegisterValue::Unavailable,
                };
                set.set(entry.regnum, value);
            }
        }
        if set.len() == layout.entries().len() {
            return Ok(set);
        }

        self.set_general_thread(ptid)?;
        match self.exchange_checked(b"g") {
            Ok(reply) => {
                if reply.len() % 2 != 0 {
                    return Err(Error::malformed("odd length of `g` reply"));
                }
                for entry in layout.entries() {
                    let Some(offset) = entry.offset else {
                        continue;
                    };
                    let (start, end) = (offset * 2, (offset + entry.size) * 2);
                    // short reply, the rest is fetched one by one
                    if end > reply.len() {
                        break;
                    }
                    if set.get(entry.regnum).is_none() {
                        set.set(entry.regnum, decode_value(&reply[start..end])?);
                    }
                }
            }
            Err(Error::PacketRejected(e)) => {
                rsp_debug!(target: "remote", "`g` rejected ({e}), fallback to `p`");
            }
            Err(e) => return Err(e),
        }

        for entry in layout.entries() {
            if set.get(entry.regnum).is_some() {
                continue;
            }
            let value = match self.read_register_packet(entry.pnum) {
                Ok(value) => value,
                Err(Error::PacketUnsupported(_)) | Err(Error::PacketRejected(_)) => {
                    RegisterValue::Unavailable
                }
                Err(e) => return Err(e),
            };
            set.set(entry.regnum, value);
        }
        Ok(set)
    }

    /// Read a single register, fallback to the bulk packet if `p` is unsupported.
    pub fn fetch_register(
        &mut self,
        arch: &dyn Architecture,
        ptid: ThreadId,
        regnum: u32,
    ) -> Result<RegisterValue, Error> {
        let layout = self.layout(arch);
        let entry = *layout.get(regnum).ok_or(Error::RegisterNotFound(regnum))?;

        self.set_general_thread(ptid)?;
        match self.read_register_packet(entry.pnum) {
            Err(Error::PacketUnsupported(_)) => {}
            result => return result,
        }

        let set = self.fetch_registers(arch, ptid, &[])?;
        set.get(regnum).cloned().ok_or(Error::RegisterNotFound(regnum))
    }

    fn read_register_packet(&mut self, pnum: u32) -> Result<RegisterValue, Error> {
        let reply = self.request(Feature::ReadRegister, format!("p{pnum:x}").as_bytes())?;
        decode_value(&reply)
    }

    /// Write a single register, fallback to read-modify-write of the `g` block.
    pub fn store_register(
        &mut self,
        arch: &dyn Architecture,
        ptid: ThreadId,
        regnum: u32,
        value: &[u8],
    ) -> Result<(), Error> {
        let layout = self.layout(arch);
        let entry = *layout.get(regnum).ok_or(Error::RegisterNotFound(regnum))?;
        if value.len() != entry.size {
            return Err(Error::malformed(format!(
                "register {regnum} takes {} bytes, got {}",
                entry.size,
                value.len()
            )));
        }

        self.set_general_thread(ptid)?;
        let request = format!("P{:x}={}", entry.pnum, hex_encode(value));
        match self.request(Feature::WriteRegister, request.as_bytes()) {
            Ok(reply) => return expect_ok(request.as_bytes(), &reply),
            Err(Error::PacketUnsupported(_)) => {}
            Err(e) => return Err(e),
        }

        let Some(offset) = entry.offset else {
            return Err(Error::PacketUnsupported(Feature::WriteRegister.name()));
        };
        let mut block = hex_decode(&self.exchange_checked(b"g")?)?;
        if block.len() < offset + entry.size {
            return Err(Error::RegisterUnavailable(regnum));
        }
        block[offset..offset + entry.size].copy_from_slice(value);
        self.exchange_ok(format!("G{}", hex_encode(&block)).as_bytes())
    }

    /// Write all `g` packet registers at once. Registers missing in `set` keep
    /// their current values.
    pub fn store_registers(
        &mut self,
        arch: &dyn Architecture,
        ptid: ThreadId,
        set: &RegisterSet,
    ) -> Result<(), Error> {
        let layout = self.layout(arch);
        self.set_general_thread(ptid)?;

        let mut block = hex_decode(&self.exchange_checked(b"g")?)?;
        block.resize(block.len().max(layout.g_size()), 0);
        for entry in layout.entries() {
            let (Some(offset), Some(RegisterValue::Value(v))) = (entry.offset, set.get(entry.regnum))
            else {
                continue;
            };
            if v.len() == entry.size {
                block[offset..offset + entry.size].copy_from_slice(v);
            }
        }
        self.exchange_ok(format!("G{}", hex_encode(&block)).as_bytes())
    }
}
