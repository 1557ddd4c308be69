//! Byte-stream link to the remote stub.
//! Supports TCP sockets and serial lines.

use crate::remote::error::Error;
use crate::rsp_debug;
use nix::sys::termios;
use nix::sys::termios::{BaudRate, SetArg};
use std::fs::{File, OpenOptions};
use std::io;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use timeout_readwrite::TimeoutReader;

/// Telnet `IAC BRK`, a BREAK for network links.
const TELNET_BREAK: [u8; 2] = [0xff, 0xf3];

/// Result of a single character read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadChar {
    Byte(u8),
    /// Nothing arrived during a poll quantum.
    Timeout,
    /// Link closed by the remote side.
    Eof,
}

/// Trait for remote protocol transports (serial line or socket).
pub trait Transport: Send {
    /// Read a single byte, waiting at most one poll quantum.
    fn read_char(&mut self) -> Result<ReadChar, Error>;

    /// Write all bytes and flush.
    fn write_all(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Send an out-of-band BREAK condition.
    fn send_break(&mut self) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Socket,
    Serial,
}

/// Transport over a pair of read/write handles of the same stream.
pub struct StreamTransport<R: Read + AsRawFd, W: Write + AsFd> {
    reader: BufReader<TimeoutReader<R>>,
    writer: W,
    kind: LineKind,
}

pub type TcpTransport = StreamTransport<TcpStream, TcpStream>;
pub type SerialTransport = StreamTransport<File, File>;

impl TcpTransport {
    /// Connect to a stub listening at `addr` (`host:port`).
    pub fn connect(addr: &str, poll: Duration) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream, poll)
    }

    pub fn from_stream(stream: TcpStream, poll: Duration) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        rsp_debug!(target: "transport", "connected to {:?}", stream.peer_addr().ok());
        Ok(Self {
            reader: BufReader::new(TimeoutReader::new(reader, poll)),
            writer: stream,
            kind: LineKind::Socket,
        })
    }
}

impl SerialTransport {
    /// Open serial device in raw mode with a given baud rate.
    pub fn open(path: &str, baud: u32, poll: Duration) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut attrs = termios::tcgetattr(&file).map_err(Error::Termios)?;
        termios::cfmakeraw(&mut attrs);
        termios::cfsetspeed(&mut attrs, baud_rate(baud)?).map_err(Error::Termios)?;
        termios::tcsetattr(&file, SetArg::TCSANOW, &attrs).map_err(Error::Termios)?;

        let reader = file.try_clone()?;
        rsp_debug!(target: "transport", "serial line {path} opened at {baud} baud");
        Ok(Self {
            reader: BufReader::new(TimeoutReader::new(reader, poll)),
            writer: file,
            kind: LineKind::Serial,
        })
    }
}

fn baud_rate(baud: u32) -> Result<BaudRate, Error> {
    let rate = match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        460800 => BaudRate::B460800,
        921600 => BaudRate::B921600,
        _ => {
            return Err(Error::IO(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {baud}"),
            )))
        }
    };
    Ok(rate)
}

impl<R: Read + AsRawFd + Send, W: Write + AsFd + Send> Transport for StreamTransport<R, W> {
    fn read_char(&mut self) -> Result<ReadChar, Error> {
        let buf = match self.reader.fill_buf() {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(ReadChar::Timeout),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(ReadChar::Timeout),
            Err(e) => return Err(e.into()),
        };
        let Some(&b) = buf.first() else {
            return Ok(ReadChar::Eof);
        };
        self.reader.consume(1);
        Ok(ReadChar::Byte(b))
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn send_break(&mut self) -> Result<(), Error> {
        match self.kind {
            LineKind::Socket => self.write_all(&TELNET_BREAK),
            LineKind::Serial => termios::tcsendbreak(&self.writer, 0).map_err(Error::Termios),
        }
    }
}

/// User interrupt request, raised asynchronously (for example from a SIGINT handler)
/// and consumed by the session at well-defined points.
#[derive(Default, Clone, Debug)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
}

impl InterruptFlag {
    /// Raise the flag on every SIGINT delivered to the process.
    pub fn register_sigint(&self) -> Result<(), Error> {
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.flag))?;
        Ok(())
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Reset the flag, return true if it was raised.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}
