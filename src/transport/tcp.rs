use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, warn};

use super::{Arrival, PathHandle, Transport, TransportError};
use crate::wire::{self, Header};
use crate::ProcessId;

/// Payload limit of a TCP frame
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Unflushed bytes a connection may hold before senders see back-pressure
const HIGH_WATER: usize = 4 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

struct Connection {
    stream: TcpStream,
    peer: Option<ProcessId>,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
}

impl Connection {
    fn new(stream: TcpStream, peer: Option<ProcessId>) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Connection {
            stream,
            peer,
            inbound: Vec::new(),
            outbound: Vec::new(),
        })
    }

    /// Write as much of the outbound buffer as the socket takes.
    fn flush(&mut self) -> io::Result<()> {
        let mut written = 0;
        while written < self.outbound.len() {
            match self.stream.write(&self.outbound[written..]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.outbound.drain(..written);
        Ok(())
    }

    /// Read everything available. Returns false once the peer has closed the stream.
    fn fill(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Split complete frames off the inbound buffer.
    fn frames(&mut self, arrivals: &mut Vec<Arrival>) -> Result<(), TransportError> {
        let mut consumed = 0;
        if self.peer.is_none() {
            if self.inbound.len() < 4 {
                return Ok(());
            }
            let peer = BigEndian::read_u32(&self.inbound);
            debug!(peer, "tcp peer identified");
            self.peer = Some(peer);
            consumed = 4;
        }
        loop {
            let rest = &self.inbound[consumed..];
            if rest.len() < 4 {
                break;
            }
            let len = BigEndian::read_u32(rest) as usize;
            if rest.len() < 4 + len {
                break;
            }
            let (header, payload) = wire::decode(&rest[4..4 + len])?;
            arrivals.push(Arrival {
                header,
                payload: payload.to_vec(),
            });
            consumed += 4 + len;
        }
        self.inbound.drain(..consumed);
        Ok(())
    }
}

/// Stream driver. TCP already delivers in order and exactly once, so the engine skips its
/// acknowledgement protocol on these paths.
///
/// Each process listens on one socket and dials every peer it sends to. A dialled
/// connection starts with the dialling process id as a big-endian `u32`; every frame after
/// that is prefixed with its length as a big-endian `u32`.
pub struct TcpTransport {
    me: ProcessId,
    listener: TcpListener,
    peers: HashMap<ProcessId, SocketAddr>,
    outgoing: HashMap<ProcessId, Connection>,
    incoming: Vec<Connection>,
    max_payload: usize,
}

impl TcpTransport {
    /// Listen on `addr` as process `me`.
    pub fn bind<A: ToSocketAddrs>(me: ProcessId, addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(TcpTransport {
            me,
            listener,
            peers: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: Vec::new(),
            max_payload: DEFAULT_MAX_PAYLOAD,
        })
    }

    /// The listening address, to be handed to peers.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Tell the driver where `process` listens.
    pub fn add_peer(&mut self, process: ProcessId, addr: SocketAddr) {
        self.peers.insert(process, addr);
    }

    /// Change the payload limit.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload.max(1);
        self
    }

    fn accept(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, from)) => {
                    debug!(%from, "tcp connection accepted");
                    self.incoming.push(Connection::new(stream, None)?);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn is_reliable(&self) -> bool {
        true
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn can_reach(&self, dest: ProcessId) -> bool {
        self.peers.contains_key(&dest)
    }

    fn open(&mut self, dest: ProcessId) -> Result<PathHandle, TransportError> {
        if self.outgoing.contains_key(&dest) {
            return Ok(PathHandle(dest));
        }
        let addr = *self
            .peers
            .get(&dest)
            .ok_or(TransportError::Unreachable(dest))?;
        let stream = TcpStream::connect(addr)?;
        let mut conn = Connection::new(stream, Some(dest))?;
        let mut hello = [0u8; 4];
        BigEndian::write_u32(&mut hello, self.me);
        conn.outbound.extend_from_slice(&hello);
        conn.flush()?;
        debug!(dest, %addr, "tcp connection established");
        self.outgoing.insert(dest, conn);
        Ok(PathHandle(dest))
    }

    fn send_fragment(
        &mut self,
        path: PathHandle,
        header: &Header,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let conn = self
            .outgoing
            .get_mut(&path.0)
            .ok_or(TransportError::Closed(path.0))?;
        if conn.outbound.len() >= HIGH_WATER {
            conn.flush()?;
            if conn.outbound.len() >= HIGH_WATER {
                return Err(TransportError::Busy);
            }
        }
        let mut frame = Vec::with_capacity(wire::HEADER_LEN + payload.len());
        wire::encode(header, payload, &mut frame);
        let mut prefix = [0u8; 4];
        BigEndian::write_u32(&mut prefix, frame.len() as u32);
        conn.outbound.extend_from_slice(&prefix);
        conn.outbound.extend_from_slice(&frame);
        conn.flush()?;
        Ok(())
    }

    fn poll_for_arrivals(&mut self, arrivals: &mut Vec<Arrival>) -> Result<(), TransportError> {
        self.accept()?;
        for conn in self.outgoing.values_mut() {
            conn.flush()?;
        }
        let mut result = Ok(());
        self.incoming.retain_mut(|conn| {
            let open = match conn.fill() {
                Ok(open) => open,
                Err(e) => {
                    warn!(peer = ?conn.peer, "tcp read failed: {}", e);
                    false
                }
            };
            if let Err(e) = conn.frames(arrivals) {
                result = Err(e);
                return false;
            }
            if !open {
                debug!(peer = ?conn.peer, "tcp connection closed by peer");
            }
            open
        });
        result
    }

    fn close(&mut self, path: PathHandle) {
        if let Some(mut conn) = self.outgoing.remove(&path.0) {
            if let Err(e) = conn.flush() {
                warn!(dest = path.0, "dropping unflushed tcp data: {}", e);
            }
            let _ = conn.stream.shutdown(Shutdown::Write);
        }
    }
}
