use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use tracing::{trace, warn};

use super::{Arrival, PathHandle, Transport, TransportError};
use crate::wire::{self, Header, HEADER_LEN};
use crate::ProcessId;

/// Payload limit of a UDP frame
pub const DEFAULT_MAX_PAYLOAD: usize = 8 * 1024;

const RECV_BUFFER: usize = 64 * 1024;

/// Datagram driver. Frames may be lost, duplicated or reordered, so the engine runs its
/// acknowledgement and retransmission protocol on top of it.
pub struct UdpTransport {
    socket: UdpSocket,
    peers: HashMap<ProcessId, SocketAddr>,
    max_payload: usize,
    scratch: Vec<u8>,
    recv_buf: Vec<u8>,
}

impl UdpTransport {
    /// Bind a non-blocking socket.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(UdpTransport {
            socket,
            peers: HashMap::new(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            scratch: Vec::with_capacity(HEADER_LEN + DEFAULT_MAX_PAYLOAD),
            recv_buf: vec![0; RECV_BUFFER],
        })
    }

    /// The bound address, to be handed to peers.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Tell the driver where `process` listens.
    pub fn add_peer(&mut self, process: ProcessId, addr: SocketAddr) {
        self.peers.insert(process, addr);
    }

    /// Change the payload limit. It is capped so that a frame fits in one datagram.
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload.clamp(1, RECV_BUFFER - HEADER_LEN);
        self
    }
}

impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn is_reliable(&self) -> bool {
        false
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn can_reach(&self, dest: ProcessId) -> bool {
        self.peers.contains_key(&dest)
    }

    fn open(&mut self, dest: ProcessId) -> Result<PathHandle, TransportError> {
        if !self.can_reach(dest) {
            return Err(TransportError::Unreachable(dest));
        }
        Ok(PathHandle(dest))
    }

    fn send_fragment(
        &mut self,
        path: PathHandle,
        header: &Header,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let addr = *self
            .peers
            .get(&path.0)
            .ok_or(TransportError::Unreachable(path.0))?;
        self.scratch.clear();
        wire::encode(header, payload, &mut self.scratch);
        match self.socket.send_to(&self.scratch, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(TransportError::Busy),
            Err(e) => Err(e.into()),
        }
    }

    fn poll_for_arrivals(&mut self, arrivals: &mut Vec<Arrival>) -> Result<(), TransportError> {
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((len, from)) => match wire::decode(&self.recv_buf[..len]) {
                    Ok((header, payload)) => {
                        trace!(%from, kind = ?header.kind(), "datagram");
                        arrivals.push(Arrival {
                            header,
                            payload: payload.to_vec(),
                        });
                    }
                    Err(e) => warn!(%from, "dropping datagram: {}", e),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                // ICMP port unreachable from an earlier send on some platforms
                Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self, _path: PathHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::DataHeader;

    #[test]
    fn datagram_roundtrip_over_localhost() {
        let mut a = UdpTransport::bind("127.0.0.1:0").unwrap();
        let mut b = UdpTransport::bind("127.0.0.1:0").unwrap();
        a.add_peer(1, b.local_addr().unwrap());
        b.add_peer(0, a.local_addr().unwrap());
        assert!(a.can_reach(1));
        assert!(!a.can_reach(2));

        let mut header = DataHeader {
            flags: 0,
            context: 0,
            tag: 1,
            src: 0,
            dst: 1,
            frag_len: 3,
            msg_len: 3,
            frag_seq: 1,
            msg_seq: 1,
            offset: 0,
            checksum: 0,
        };
        header.seal(b"abc");
        let path = a.open(1).unwrap();
        a.send_fragment(path, &Header::Data(header), b"abc").unwrap();

        let mut arrivals = Vec::new();
        for _ in 0..1000 {
            b.poll_for_arrivals(&mut arrivals).unwrap();
            if !arrivals.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(arrivals.len(), 1);
        assert_eq!(arrivals[0].header, Header::Data(header));
        assert_eq!(arrivals[0].payload, b"abc");
    }
}
