//! Binary protocol over TCP between the host and a board agent (or a
//! co-simulation) that owns the real [`Soc`].
//!
//! Every request is a one-byte command followed by little-endian `u32`
//! fields. Every response starts with a `u32` status word (0 on success),
//! followed by the command's payload.

use crate::{HwError, Soc};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;
use tproc_common::dmem::PMEM_DEPTH;
use tracing::{debug, info};

/// Reads one data memory word. Request: address. Payload: value.
const CMD_READ: u8 = 0x03;

/// Writes one data memory word. Request: address, value.
const CMD_WRITE: u8 = 0x02;

/// Reads accumulated samples. Request: channel, address, length, timeout in
/// milliseconds. Payload: `length` little-endian `u64` words.
const CMD_TRANSFER: u8 = 0x04;

const CMD_START: u8 = 0x05;

const CMD_STOP: u8 = 0x06;

/// Writes program memory. Request: word count, then the low and high 32-bit
/// half of every word.
const CMD_LOAD: u8 = 0x07;

/// Queries the accumulation buffer depth. Payload: capacity.
const CMD_CAPACITY: u8 = 0x08;

const STATUS_OK: u32 = 0;
const STATUS_ADDRESS: u32 = 1;
const STATUS_CHANNEL: u32 = 2;
const STATUS_RANGE: u32 = 3;
const STATUS_TIMEOUT: u32 = 4;
const STATUS_FAILED: u32 = 5;

/// Socket slack on top of the transfer deadline.
const IO_MARGIN: Duration = Duration::from_millis(500);

/// [`Soc`] backed by a remote board agent.
///
/// Requests are serialized over a single connection. After a timeout the
/// connection may hold a stale response and should be reopened.
pub struct BridgeSoc {
    stream: Mutex<TcpStream>,
    capacity: usize,
}

impl BridgeSoc {
    /// Connects to a board agent and queries its buffer capacity.
    ///
    /// # Arguments
    ///
    /// * `addr` - Agent address in "host:port" format (e.g., "127.0.0.1:8000")
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, HwError> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(IO_MARGIN))?;

        stream.write_all(&[CMD_CAPACITY])?;
        expect_ok(&mut stream)?;
        let capacity = read_u32(&mut stream)? as usize;
        info!(peer = ?stream.peer_addr().ok(), capacity, "connected to board agent");

        Ok(Self {
            stream: Mutex::new(stream),
            capacity,
        })
    }

    fn with_stream<T>(
        &self,
        f: impl FnOnce(&mut TcpStream) -> Result<T, HwError>,
    ) -> Result<T, HwError> {
        let mut stream = self.stream.lock().map_err(|_| HwError::Poisoned)?;
        f(&mut stream)
    }
}

impl Soc for BridgeSoc {
    fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    fn read_mem(&self, addr: u32) -> Result<u32, HwError> {
        self.with_stream(|s| {
            s.write_all(&[CMD_READ])?;
            s.write_all(&addr.to_le_bytes())?;
            expect_ok(s)?;
            Ok(read_u32(s)?)
        })
    }

    fn write_mem(&self, addr: u32, value: u32) -> Result<(), HwError> {
        self.with_stream(|s| {
            s.write_all(&[CMD_WRITE])?;
            s.write_all(&addr.to_le_bytes())?;
            s.write_all(&value.to_le_bytes())?;
            expect_ok(s)
        })
    }

    fn start(&self) -> Result<(), HwError> {
        self.with_stream(|s| {
            s.write_all(&[CMD_START])?;
            expect_ok(s)
        })
    }

    fn stop(&self) -> Result<(), HwError> {
        self.with_stream(|s| {
            s.write_all(&[CMD_STOP])?;
            expect_ok(s)
        })
    }

    fn transfer(
        &self,
        ch: usize,
        address: usize,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u64>, HwError> {
        self.with_stream(|s| {
            s.set_read_timeout(Some(timeout + IO_MARGIN))?;
            let mut request = vec![CMD_TRANSFER];
            for field in [ch, address, length, timeout.as_millis() as usize] {
                request.extend_from_slice(&(field as u32).to_le_bytes());
            }
            s.write_all(&request)?;

            let result = expect_ok(s).and_then(|()| {
                let mut bytes = vec![0u8; length * 8];
                s.read_exact(&mut bytes)?;
                Ok(bytes
                    .chunks_exact(8)
                    .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                    .collect())
            });
            s.set_read_timeout(Some(IO_MARGIN))?;
            result.map_err(|err| match err {
                HwError::Io(e) if is_timeout(&e) => HwError::Timeout(timeout),
                HwError::Timeout(_) => HwError::Timeout(timeout),
                HwError::UnknownChannel(_) => HwError::UnknownChannel(ch),
                HwError::TransferOutOfRange { .. } => HwError::TransferOutOfRange {
                    address,
                    length,
                    capacity: self.capacity,
                },
                other => other,
            })
        })
    }

    fn load_program(&self, words: &[u64]) -> Result<(), HwError> {
        self.with_stream(|s| {
            let mut request = Vec::with_capacity(5 + words.len() * 8);
            request.push(CMD_LOAD);
            request.extend_from_slice(&(words.len() as u32).to_le_bytes());
            for word in words {
                request.extend_from_slice(&(*word as u32).to_le_bytes());
                request.extend_from_slice(&((word >> 32) as u32).to_le_bytes());
            }
            s.write_all(&request)?;
            expect_ok(s)
        })
    }
}

/// Answers bridge requests on `stream` with `soc` until the peer hangs up.
pub fn serve_connection<S: Soc + ?Sized>(mut stream: TcpStream, soc: &S) -> Result<(), HwError> {
    stream.set_nodelay(true)?;
    loop {
        let mut cmd = [0u8; 1];
        match stream.read_exact(&mut cmd) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let response = match cmd[0] {
            CMD_READ => {
                let addr = read_u32(&mut stream)?;
                soc.read_mem(addr).map(|v| v.to_le_bytes().to_vec())
            }
            CMD_WRITE => {
                let addr = read_u32(&mut stream)?;
                let value = read_u32(&mut stream)?;
                soc.write_mem(addr, value).map(|()| Vec::new())
            }
            CMD_TRANSFER => {
                let ch = read_u32(&mut stream)? as usize;
                let address = read_u32(&mut stream)? as usize;
                let length = read_u32(&mut stream)? as usize;
                let timeout = Duration::from_millis(u64::from(read_u32(&mut stream)?));
                soc.transfer(ch, address, length, timeout)
                    .map(|words| words.iter().flat_map(|w| w.to_le_bytes()).collect())
            }
            CMD_START => soc.start().map(|()| Vec::new()),
            CMD_STOP => soc.stop().map(|()| Vec::new()),
            CMD_LOAD => {
                let count = read_u32(&mut stream)? as usize;
                // the stream cannot be resynchronized past an oversized load
                if count > PMEM_DEPTH {
                    return Err(HwError::Protocol(format!(
                        "load of {count} words exceeds program memory"
                    )));
                }
                let mut words = Vec::with_capacity(count);
                for _ in 0..count {
                    let low = read_u32(&mut stream)?;
                    let high = read_u32(&mut stream)?;
                    words.push(u64::from(high) << 32 | u64::from(low));
                }
                soc.load_program(&words).map(|()| Vec::new())
            }
            CMD_CAPACITY => Ok((soc.buffer_capacity() as u32).to_le_bytes().to_vec()),
            other => return Err(HwError::Protocol(format!("unknown command {other:#04x}"))),
        };
        debug!(cmd = cmd[0], ok = response.is_ok(), "served request");

        let mut reply = Vec::new();
        match response {
            Ok(payload) => {
                reply.extend_from_slice(&STATUS_OK.to_le_bytes());
                reply.extend_from_slice(&payload);
            }
            Err(err) => reply.extend_from_slice(&status_of(&err).to_le_bytes()),
        }
        stream.write_all(&reply)?;
    }
}

fn status_of(err: &HwError) -> u32 {
    match err {
        HwError::AddressOutOfRange(_) => STATUS_ADDRESS,
        HwError::UnknownChannel(_) => STATUS_CHANNEL,
        HwError::TransferOutOfRange { .. } => STATUS_RANGE,
        HwError::Timeout(_) => STATUS_TIMEOUT,
        _ => STATUS_FAILED,
    }
}

fn expect_ok(stream: &mut TcpStream) -> Result<(), HwError> {
    match read_u32(stream)? {
        STATUS_OK => Ok(()),
        STATUS_ADDRESS => Err(HwError::AddressOutOfRange(0)),
        STATUS_CHANNEL => Err(HwError::UnknownChannel(0)),
        STATUS_RANGE => Err(HwError::TransferOutOfRange {
            address: 0,
            length: 0,
            capacity: 0,
        }),
        STATUS_TIMEOUT => Err(HwError::Timeout(Duration::ZERO)),
        status => Err(HwError::Protocol(format!("board reported failure {status}"))),
    }
}

fn read_u32(stream: &mut TcpStream) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}
