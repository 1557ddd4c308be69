//! Memory transfer: `m` reads, `X` (binary) and `M` (hex) writes.
//!
//! Large transfers are split into packet sized pieces. When more than one packet
//! is needed, a piece is shortened so that the next one starts at an aligned address.

use crate::remote::error::Error;
use crate::remote::feature::{Feature, Support};
use crate::remote::packet::{escape_binary, hex_decode, hex_encode};
use crate::remote::session::Session;
use crate::rsp_debug;

/// Alignment of the start address of the following piece in a multi-packet transfer.
const TRANSFER_ALIGN: u128 = 16;

/// Shorten `len` so that `addr + len` is aligned, if the result is not empty.
fn snap_len(addr: u64, len: usize) -> usize {
    let start = addr as u128;
    let aligned_end = (start + len as u128) & !(TRANSFER_ALIGN - 1);
    if aligned_end > start {
        (aligned_end - start) as usize
    } else {
        len
    }
}

/// Reject a range that runs past the end of the address space.
fn check_range(addr: u64, len: usize) -> Result<(), Error> {
    if len == 0 {
        return Ok(());
    }
    addr.checked_add(len as u64 - 1)
        .map(|_| ())
        .ok_or(Error::AddressOverflow { addr, len })
}

/// Number of hex digits in `value`.
fn hex_len(value: usize) -> usize {
    format!("{value:x}").len()
}

fn partial(transferred: usize, e: Error) -> Error {
    if transferred == 0 {
        return e;
    }
    Error::PartialTransfer {
        transferred,
        source: Box::new(e),
    }
}

impl Session {
    /// Max data bytes in a packet where the data is encoded as hex.
    fn hex_units(&self, header: usize) -> usize {
        (self.max_payload().saturating_sub(header) / 2).max(1)
    }

    /// Read target memory into `buf`.
    ///
    /// On failure after some data was read, [`Error::PartialTransfer`] holds the number of
    /// bytes already placed at the start of `buf`.
    pub fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        check_range(addr, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let cur = addr + done as u64;
            let remaining = buf.len() - done;
            let max = self.hex_units(0);
            let len = if remaining > max {
                snap_len(cur, max)
            } else {
                remaining
            };

            let data = self
                .read_memory_packet(cur, len)
                .map_err(|e| partial(done, e))?;
            buf[done..done + data.len()].copy_from_slice(&data);
            done += data.len();
        }
        Ok(())
    }

    fn read_memory_packet(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
        let request = format!("m{addr:x},{len:x}");
        let reply = self.exchange_checked(request.as_bytes())?;
        let mut data = hex_decode(&reply)?;
        // a stub may return less than requested, but never nothing
        if data.is_empty() {
            return Err(Error::unexpected(request.as_bytes(), &reply));
        }
        data.truncate(len);
        Ok(data)
    }

    /// Write `data` to target memory.
    ///
    /// On failure after some data was written, [`Error::PartialTransfer`] holds the number
    /// of bytes already written.
    pub fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        check_range(addr, data.len())?;
        let binary = self.probe_binary_download(addr)?;

        let mut done = 0;
        while done < data.len() {
            let cur = addr + done as u64;
            let written = if binary {
                self.write_memory_binary(cur, &data[done..])
            } else {
                self.write_memory_hex(cur, &data[done..])
            };
            done += written.map_err(|e| partial(done, e))?;
        }
        Ok(())
    }

    /// Check `X` packet support with an empty write, the stub may misinterpret
    /// binary data if it doesn't know the packet.
    fn probe_binary_download(&mut self, addr: u64) -> Result<bool, Error> {
        match self.features().support(Feature::BinaryDownload) {
            Support::Enabled => return Ok(true),
            Support::Disabled => return Ok(false),
            Support::Unknown => {}
        }

        match self.request_ok(Feature::BinaryDownload, format!("X{addr:x},0:").as_bytes()) {
            Ok(()) => Ok(true),
            Err(Error::PacketUnsupported(_)) => {
                rsp_debug!(target: "remote", "binary download unsupported, use `M` packets");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn write_memory_binary(&mut self, addr: u64, data: &[u8]) -> Result<usize, Error> {
        // header is `X<addr>,<len>:`, length field is never longer than the remaining count
        let header = format!("X{addr:x},").len() + hex_len(data.len()) + 1;
        let budget = self.max_payload().saturating_sub(header).max(2);

        let mut body = Vec::with_capacity(budget);
        let mut len = escape_binary(data, &mut body, budget);
        if len < data.len() {
            let snapped = snap_len(addr, len);
            if snapped != len {
                body.clear();
                len = escape_binary(&data[..snapped], &mut body, budget);
            }
        }

        let mut request = format!("X{addr:x},{len:x}:").into_bytes();
        request.extend_from_slice(&body);
        self.exchange_ok(&request)?;
        Ok(len)
    }

    fn write_memory_hex(&mut self, addr: u64, data: &[u8]) -> Result<usize, Error> {
        let header = format!("M{addr:x},").len() + hex_len(data.len()) + 1;
        let max = self.hex_units(header);
        let len = if data.len() > max {
            snap_len(addr, max)
        } else {
            data.len()
        };

        let request = format!("M{addr:x},{len:x}:{}", hex_encode(&data[..len]));
        self.exchange_ok(request.as_bytes())?;
        Ok(len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SessionConfig;
    use crate::remote::error::RemoteError;
    use crate::remote::testing::FakeStub;

    fn session(stub: &FakeStub, packet_size: usize) -> Session {
        let mut session = Session::new(Box::new(stub.clone()), SessionConfig::default());
        session.set_ack_mode(false);
        session.set_packet_size(packet_size);
        session
    }

    #[test]
    fn test_snap_len() {
        struct TestCase {
            addr: u64,
            len: usize,
            expected: usize,
        }
        let test_cases = vec![
            TestCase {
                addr: 0x1004,
                len: 16,
                expected: 12,
            },
            TestCase {
                addr: 0x1000,
                len: 16,
                expected: 16,
            },
            TestCase {
                addr: 0x1000,
                len: 197,
                expected: 192,
            },
            // end can't be aligned without an empty piece
            TestCase {
                addr: 0x1001,
                len: 8,
                expected: 8,
            },
            TestCase {
                addr: u64::MAX - 19,
                len: 8,
                expected: 4,
            },
            TestCase {
                addr: u64::MAX - 15,
                len: 16,
                expected: 16,
            },
        ];

        for tc in test_cases {
            assert_eq!(snap_len(tc.addr, tc.len), tc.expected, "{:#x}", tc.addr);
        }
    }

    #[test]
    fn test_read_split_and_aligned() {
        let stub = FakeStub::default();
        stub.expect("m1004,c", &["000102030405060708090a0b"])
            .expect("m1010,8", &["0c0d0e0f10111213"]);
        // 32 bytes of payload, 16 bytes of memory per packet
        let mut session = session(&stub, 36);

        let mut buf = [0u8; 20];
        session.read_memory(0x1004, &mut buf).unwrap();
        assert_eq!(buf.to_vec(), (0..20).collect::<Vec<u8>>());
        assert!(stub.script_done());
    }

    #[test]
    fn test_read_short_reply() {
        let stub = FakeStub::default();
        stub.expect("m2000,4", &["aabb"])
            .expect("m2002,2", &["ccdd"]);
        let mut session = session(&stub, 36);

        let mut buf = [0u8; 4];
        session.read_memory(0x2000, &mut buf).unwrap();
        assert_eq!(buf, [0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn test_read_partial_transfer() {
        let stub = FakeStub::default();
        stub.expect("m1004,c", &["000102030405060708090a0b"])
            .expect("m1010,8", &["E14"]);
        let mut session = session(&stub, 36);

        let mut buf = [0u8; 20];
        let err = session.read_memory(0x1004, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::PartialTransfer { transferred: 12, ref source }
                if matches!(**source, Error::PacketRejected(RemoteError::Code(0x14)))
        ));
        assert!(!err.is_fatal());
        assert_eq!(buf[11], 0x0b);

        // error on the first piece is reported as is
        stub.expect("m3000,1", &["E01"]);
        let mut one = [0u8; 1];
        assert!(matches!(
            session.read_memory(0x3000, &mut one),
            Err(Error::PacketRejected(_))
        ));
    }

    #[test]
    fn test_range_at_end_of_address_space() {
        let stub = FakeStub::default();
        stub.expect("mffffffffffffffff,1", &["7f"]);
        let mut session = session(&stub, 36);

        let mut last = [0u8; 1];
        session.read_memory(u64::MAX, &mut last).unwrap();
        assert_eq!(last, [0x7f]);

        let mut two = [0u8; 2];
        assert!(matches!(
            session.read_memory(u64::MAX, &mut two),
            Err(Error::AddressOverflow { len: 2, .. })
        ));
        assert!(matches!(
            session.write_memory(u64::MAX - 1, &[0; 3]),
            Err(Error::AddressOverflow { .. })
        ));
        assert_eq!(stub.requests().len(), 1);
    }

    #[test]
    fn test_write_binary() {
        let stub = FakeStub::default();
        stub.expect("X2000,0:", &["OK"])
            .expect("X2000,4:}\u{4}\u{1}\u{2}\u{4}", &["OK"])
            .expect("X3000,1:}]", &["OK"]);
        let mut session = session(&stub, 36);

        session.write_memory(0x2000, &[b'$', 1, 2, 4]).unwrap();
        // probed once
        session.write_memory(0x3000, &[b'}']).unwrap();
        assert!(stub.script_done());
        assert!(session.features().is_enabled(Feature::BinaryDownload));
    }

    #[test]
    fn test_write_binary_split() {
        let stub = FakeStub::default();
        // `X1008,18:` header takes 9 bytes of 32, the first piece ends at 0x1010
        stub.expect("X1008,0:", &["OK"])
            .expect("X1008,8:aaaaaaaa", &["OK"])
            .expect("X1010,10:aaaaaaaaaaaaaaaa", &["OK"]);
        let mut session = session(&stub, 36);

        session.write_memory(0x1008, &[b'a'; 0x18]).unwrap();
        assert!(stub.script_done());
    }

    #[test]
    fn test_write_hex_fallback() {
        let stub = FakeStub::default();
        stub.expect("X1000,0:", &[""])
            .expect("M1000,4:01020304", &["OK"])
            .expect("M1004,2:0506", &["E03"]);
        let mut session = session(&stub, 36);

        session.write_memory(0x1000, &[1, 2, 3, 4]).unwrap();
        assert!(session.features().is_disabled(Feature::BinaryDownload));
        assert!(matches!(
            session.write_memory(0x1004, &[5, 6]),
            Err(Error::PacketRejected(RemoteError::Code(3)))
        ));
    }

    #[test]
    fn test_write_hex_split() {
        let stub = FakeStub::default();
        // 11 bytes fit after `M1000,14:`, the end can't be aligned
        stub.expect("X1000,0:", &[""])
            .expect("M1000,b:0000000000000000000000", &["OK"])
            .expect("M100b,9:000000000000000000", &["OK"]);
        let mut session = session(&stub, 36);

        session.write_memory(0x1000, &[0; 0x14]).unwrap();
        assert!(stub.script_done());
    }
}
