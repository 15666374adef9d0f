//! Fragment headers and their canonical wire encoding
//!
//! Two frame kinds travel between processes: data fragments and acknowledgements. Both
//! headers are 60 bytes long, start with the kind discriminator and end with a CRC-32 over
//! the bytes before it. All fields are big-endian.
//!
//! ```text
//! DATA  kind:u32 flags:u32 context:u32 tag:i32 src:u32 dst:u32 frag_len:u32 msg_len:u32
//!       frag_seq:u64 msg_seq:u64 offset:u64 checksum:u32
//! ACK   kind:u32 status:u32 flags:u32 context:u32 src:u32 dst:u32
//!       acked_frag_seq:u64 acked_msg_seq:u64 received_seq:u64 delivered_seq:u64 checksum:u32
//! ```
//!
//! A data fragment's checksum also covers its payload when [`DATA_PAYLOAD_CHECKSUM`] is set.
//! Transports that move frames between address spaces use [`encode`] and [`decode`]; the
//! in-process transports hand [`Header`] values over as they are.

use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;
use thiserror::Error;

use crate::{ContextId, ProcessId, Tag};

/// Encoded size of either header
pub const HEADER_LEN: usize = 60;

const CHECKSUMMED_LEN: usize = HEADER_LEN - 4;

/// The message was sent in synchronous mode.
pub const DATA_SYNCHRONOUS: u32 = 0x1;
/// The message was sent in ready mode.
pub const DATA_READY: u32 = 0x2;
/// The checksum covers the payload as well as the header.
pub const DATA_PAYLOAD_CHECKSUM: u32 = 0x4;

/// The acknowledged message has been matched by a receive.
pub const ACK_MATCHED: u32 = 0x1;

/// Frame kind discriminator, always the first header field
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// A data fragment
    Data = 1,
    /// An acknowledgement
    Ack = 2,
}

impl TryFrom<u32> for FrameKind {
    type Error = WireError;

    fn try_from(raw: u32) -> Result<Self, WireError> {
        match raw {
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::Ack),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Whether an acknowledgement accepts or rejects a fragment
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AckStatus {
    /// The fragment arrived intact.
    Accept = 1,
    /// The fragment failed its checksum and must be sent again.
    Reject = 2,
}

impl TryFrom<u32> for AckStatus {
    type Error = WireError;

    fn try_from(raw: u32) -> Result<Self, WireError> {
        match raw {
            1 => Ok(AckStatus::Accept),
            2 => Ok(AckStatus::Reject),
            other => Err(WireError::UnknownStatus(other)),
        }
    }
}

/// Malformed frames. These never reach users; the frame is dropped and logged.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than a header or the declared payload
    #[error("frame truncated: {needed} bytes needed, {got} available")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes present
        got: usize,
    },
    /// The kind discriminator is not known
    #[error("unknown frame kind {0}")]
    UnknownKind(u32),
    /// The acknowledgement status is not known
    #[error("unknown acknowledgement status {0}")]
    UnknownStatus(u32),
}

/// Header of a data fragment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataHeader {
    /// `DATA_*` flag bits
    pub flags: u32,
    /// Communicator context id
    pub context: ContextId,
    /// Message tag
    pub tag: Tag,
    /// Sending process
    pub src: ProcessId,
    /// Receiving process
    pub dst: ProcessId,
    /// Payload bytes in this fragment
    pub frag_len: u32,
    /// Payload bytes in the whole message
    pub msg_len: u32,
    /// Per (sender, destination) fragment sequence number, starting at 1
    pub frag_seq: u64,
    /// Per (context, sender, destination) message sequence number, starting at 1
    pub msg_seq: u64,
    /// Byte offset of this fragment within the message
    pub offset: u64,
    /// CRC-32 of the preceding fields, and of the payload if flagged
    pub checksum: u32,
}

/// Header of an acknowledgement.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AckHeader {
    /// Accept or reject
    pub status: AckStatus,
    /// `ACK_*` flag bits
    pub flags: u32,
    /// Context of the acknowledged message
    pub context: ContextId,
    /// The acknowledging process
    pub src: ProcessId,
    /// The process that sent the acknowledged fragment
    pub dst: ProcessId,
    /// Fragment being acknowledged, 0 if none
    pub acked_frag_seq: u64,
    /// Message the fragment belongs to, 0 if none
    pub acked_msg_seq: u64,
    /// Highest fragment sequence number up to which everything was received
    pub received_seq: u64,
    /// Highest fragment sequence number up to which everything was delivered
    pub delivered_seq: u64,
    /// CRC-32 of the preceding fields
    pub checksum: u32,
}

/// Either kind of header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Header {
    /// A data fragment
    Data(DataHeader),
    /// An acknowledgement
    Ack(AckHeader),
}

impl Header {
    /// The frame kind
    pub fn kind(&self) -> FrameKind {
        match self {
            Header::Data(_) => FrameKind::Data,
            Header::Ack(_) => FrameKind::Ack,
        }
    }

    /// The sending process
    pub fn src(&self) -> ProcessId {
        match self {
            Header::Data(data) => data.src,
            Header::Ack(ack) => ack.src,
        }
    }

    /// The receiving process
    pub fn dst(&self) -> ProcessId {
        match self {
            Header::Data(data) => data.dst,
            Header::Ack(ack) => ack.dst,
        }
    }
}

struct FieldWriter {
    buf: [u8; HEADER_LEN],
    pos: usize,
}

impl FieldWriter {
    fn new() -> Self {
        FieldWriter {
            buf: [0; HEADER_LEN],
            pos: 0,
        }
    }

    fn u32(&mut self, value: u32) -> &mut Self {
        BigEndian::write_u32(&mut self.buf[self.pos..self.pos + 4], value);
        self.pos += 4;
        self
    }

    fn i32(&mut self, value: i32) -> &mut Self {
        BigEndian::write_i32(&mut self.buf[self.pos..self.pos + 4], value);
        self.pos += 4;
        self
    }

    fn u64(&mut self, value: u64) -> &mut Self {
        BigEndian::write_u64(&mut self.buf[self.pos..self.pos + 8], value);
        self.pos += 8;
        self
    }
}

struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn u32(&mut self) -> u32 {
        let value = BigEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        value
    }

    fn i32(&mut self) -> i32 {
        let value = BigEndian::read_i32(&self.buf[self.pos..]);
        self.pos += 4;
        value
    }

    fn u64(&mut self) -> u64 {
        let value = BigEndian::read_u64(&self.buf[self.pos..]);
        self.pos += 8;
        value
    }
}

impl DataHeader {
    fn fields(&self) -> FieldWriter {
        let mut w = FieldWriter::new();
        w.u32(FrameKind::Data as u32)
            .u32(self.flags)
            .u32(self.context)
            .i32(self.tag)
            .u32(self.src)
            .u32(self.dst)
            .u32(self.frag_len)
            .u32(self.msg_len)
            .u64(self.frag_seq)
            .u64(self.msg_seq)
            .u64(self.offset);
        w
    }

    /// The checksum this header should carry for `payload`.
    pub fn compute_checksum(&self, payload: &[u8]) -> u32 {
        let fields = self.fields();
        let mut hasher = Hasher::new();
        hasher.update(&fields.buf[..CHECKSUMMED_LEN]);
        if self.flags & DATA_PAYLOAD_CHECKSUM != 0 {
            hasher.update(payload);
        }
        hasher.finalize()
    }

    /// Fill in the checksum field.
    pub fn seal(&mut self, payload: &[u8]) {
        self.checksum = self.compute_checksum(payload);
    }

    /// Whether the header and payload match the carried checksum.
    pub fn verify(&self, payload: &[u8]) -> bool {
        payload.len() == self.frag_len as usize && self.checksum == self.compute_checksum(payload)
    }

    fn read(r: &mut FieldReader<'_>) -> Self {
        DataHeader {
            flags: r.u32(),
            context: r.u32(),
            tag: r.i32(),
            src: r.u32(),
            dst: r.u32(),
            frag_len: r.u32(),
            msg_len: r.u32(),
            frag_seq: r.u64(),
            msg_seq: r.u64(),
            offset: r.u64(),
            checksum: r.u32(),
        }
    }
}

impl AckHeader {
    fn fields(&self) -> FieldWriter {
        let mut w = FieldWriter::new();
        w.u32(FrameKind::Ack as u32)
            .u32(self.status as u32)
            .u32(self.flags)
            .u32(self.context)
            .u32(self.src)
            .u32(self.dst)
            .u64(self.acked_frag_seq)
            .u64(self.acked_msg_seq)
            .u64(self.received_seq)
            .u64(self.delivered_seq);
        w
    }

    /// The checksum this header should carry.
    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.fields().buf[..CHECKSUMMED_LEN])
    }

    /// Fill in the checksum field.
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Whether the header matches its checksum.
    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    fn read(r: &mut FieldReader<'_>) -> Result<Self, WireError> {
        Ok(AckHeader {
            status: AckStatus::try_from(r.u32())?,
            flags: r.u32(),
            context: r.u32(),
            src: r.u32(),
            dst: r.u32(),
            acked_frag_seq: r.u64(),
            acked_msg_seq: r.u64(),
            received_seq: r.u64(),
            delivered_seq: r.u64(),
            checksum: r.u32(),
        })
    }
}

/// Append the canonical encoding of a frame to `out`.
///
/// Acknowledgements carry no payload; `payload` is ignored for them.
pub fn encode(header: &Header, payload: &[u8], out: &mut Vec<u8>) {
    let mut fields = match header {
        Header::Data(data) => data.fields(),
        Header::Ack(ack) => ack.fields(),
    };
    let checksum = match header {
        Header::Data(data) => data.checksum,
        Header::Ack(ack) => ack.checksum,
    };
    fields.u32(checksum);
    out.extend_from_slice(&fields.buf);
    if let Header::Data(_) = header {
        out.extend_from_slice(payload);
    }
}

/// Decode one frame, returning its header and payload.
///
/// Checksums are not verified here; that is the receiver's reliability layer's job, which
/// turns a mismatch into a negative acknowledgement.
pub fn decode(bytes: &[u8]) -> Result<(Header, &[u8]), WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::Truncated {
            needed: HEADER_LEN,
            got: bytes.len(),
        });
    }
    let mut r = FieldReader { buf: bytes, pos: 0 };
    match FrameKind::try_from(r.u32())? {
        FrameKind::Data => {
            let data = DataHeader::read(&mut r);
            let end = HEADER_LEN + data.frag_len as usize;
            if bytes.len() < end {
                return Err(WireError::Truncated {
                    needed: end,
                    got: bytes.len(),
                });
            }
            Ok((Header::Data(data), &bytes[HEADER_LEN..end]))
        }
        FrameKind::Ack => Ok((Header::Ack(AckHeader::read(&mut r)?), &[])),
    }
}

/// Total encoded length of a frame whose header starts `bytes`, if enough of it is present.
pub fn frame_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    match BigEndian::read_u32(bytes) {
        k if k == FrameKind::Data as u32 => Some(HEADER_LEN + BigEndian::read_u32(&bytes[24..]) as usize),
        _ => Some(HEADER_LEN),
    }
}
