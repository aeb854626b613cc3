//! Wire header encoding and decoding.
//!
//! Every stream packet starts with a fixed 20-byte header:
//!
//! ```text
//!  0        1        2        3
//! ┌────────┬────────┬────────┬────────┐
//! │ magic  │version │ flags  │ offset │
//! ├────────┴────────┴────────┴────────┤
//! │          remote id (LE)           │
//! ├───────────────────────────────────┤
//! │        receive window (LE)        │
//! ├───────────────────────────────────┤
//! │              seq (LE)             │
//! ├───────────────────────────────────┤
//! │              ack (LE)             │
//! └───────────────────────────────────┘
//! ```
//!
//! The offset byte has two uses. On packets carrying a SACK list it marks
//! where the list ends and application data begins. On MTU probes it is the
//! length of the zero padding placed between header and data.

use crate::error::HeaderError;

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 20;

/// First byte of every stream packet
pub const MAGIC: u8 = 0xFF;

/// Protocol version
pub const VERSION: u8 = 1;

/// Advertised receive window (flow control is not negotiated)
pub const RECV_WINDOW: u32 = 0xFFFF_FFFF;

/// Size of one encoded SACK range
pub const SACK_RANGE_SIZE: usize = 8;

/// Header flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    /// Packet carries in-order stream data
    pub const DATA: u8 = 0b0000_0001;
    /// Packet ends the sender's write side
    pub const END: u8 = 0b0000_0010;
    /// Payload starts with a SACK range list
    pub const SACK: u8 = 0b0000_0100;
    /// Packet is an unordered message
    pub const MESSAGE: u8 = 0b0000_1000;
    /// Sender destroyed the stream
    pub const DESTROY: u8 = 0b0001_0000;

    /// No flags set
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Wrap raw flag bits
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw flag bits
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Any of `bits` is set
    #[must_use]
    pub const fn intersects(self, bits: u8) -> bool {
        self.0 & bits != 0
    }

    /// Return a copy with `bits` set
    #[must_use]
    pub const fn with(self, bits: u8) -> Self {
        Self(self.0 | bits)
    }

    /// Set `bits`
    pub fn insert(&mut self, bits: u8) {
        self.0 |= bits;
    }

    /// DATA is set
    #[must_use]
    pub const fn is_data(self) -> bool {
        self.intersects(Self::DATA)
    }

    /// END is set
    #[must_use]
    pub const fn is_end(self) -> bool {
        self.intersects(Self::END)
    }

    /// SACK is set
    #[must_use]
    pub const fn is_sack(self) -> bool {
        self.intersects(Self::SACK)
    }

    /// MESSAGE is set
    #[must_use]
    pub const fn is_message(self) -> bool {
        self.intersects(Self::MESSAGE)
    }

    /// DESTROY is set
    #[must_use]
    pub const fn is_destroy(self) -> bool {
        self.intersects(Self::DESTROY)
    }
}

/// Decoded fixed header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Flag bits
    pub flags: HeaderFlags,
    /// SACK list length or probe padding length
    pub data_offset: u8,
    /// Receiver's local stream id
    pub remote_id: u32,
    /// Advertised receive window
    pub recv_window: u32,
    /// Sequence number of this packet
    pub seq: u32,
    /// Next sequence number the sender expects
    pub ack: u32,
}

impl Header {
    /// Header addressed to `remote_id` with the default window
    #[must_use]
    pub fn new(flags: HeaderFlags, remote_id: u32, seq: u32, ack: u32) -> Self {
        Self {
            flags,
            data_offset: 0,
            remote_id,
            recv_window: RECV_WINDOW,
            seq,
            ack,
        }
    }

    /// Encode into a fresh array
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = MAGIC;
        out[1] = VERSION;
        out[2] = self.flags.bits();
        out[3] = self.data_offset;
        out[4..8].copy_from_slice(&self.remote_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.recv_window.to_le_bytes());
        out[12..16].copy_from_slice(&self.seq.to_le_bytes());
        out[16..20].copy_from_slice(&self.ack.to_le_bytes());
        out
    }

    /// Decode the fixed header at the start of `buf`.
    ///
    /// # Errors
    /// Returns an error for short input or an unknown magic byte or version.
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_SIZE {
            return Err(HeaderError::TooShort {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }
        if buf[0] != MAGIC {
            return Err(HeaderError::BadMagic(buf[0]));
        }
        if buf[1] != VERSION {
            return Err(HeaderError::BadVersion(buf[1]));
        }
        Ok(Self {
            flags: HeaderFlags::from_bits(buf[2]),
            data_offset: buf[3],
            remote_id: read_u32(&buf[4..8]),
            recv_window: read_u32(&buf[8..12]),
            seq: read_u32(&buf[12..16]),
            ack: read_u32(&buf[16..20]),
        })
    }
}

/// Zero-copy view of a received stream packet
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    /// Fixed header
    pub header: Header,
    /// Encoded SACK ranges (empty unless the SACK flag is set)
    pub sack_area: &'a [u8],
    /// Application payload after the offset area, empty when the offset
    /// points past the end of the datagram
    pub payload: &'a [u8],
    body: &'a [u8],
}

impl<'a> PacketView<'a> {
    /// Split a datagram into header, SACK list and payload.
    ///
    /// A zero offset (or one covering the whole body) makes the entire body
    /// the SACK list; the payload then also starts right after the header.
    /// An offset past the end still yields the SACK list so acknowledgements
    /// are not lost; [`checked_payload`](Self::checked_payload) reports it.
    ///
    /// # Errors
    /// Returns an error if the fixed header is invalid.
    pub fn parse(buf: &'a [u8]) -> Result<Self, HeaderError> {
        let header = Header::decode(buf)?;
        let body = &buf[HEADER_SIZE..];
        let offset = usize::from(header.data_offset);

        let area_len = if offset > 0 && offset < body.len() {
            offset
        } else {
            body.len()
        };

        let sack_area = if header.flags.is_sack() {
            &body[..area_len]
        } else {
            &[]
        };

        Ok(Self {
            header,
            sack_area,
            payload: body.get(offset..).unwrap_or(&[]),
            body,
        })
    }

    /// Payload, or an error if the data offset points past the datagram
    ///
    /// # Errors
    /// Returns `HeaderError::OffsetOverflow`.
    pub fn checked_payload(&self) -> Result<&'a [u8], HeaderError> {
        let offset = usize::from(self.header.data_offset);
        if offset > self.body.len() {
            return Err(HeaderError::OffsetOverflow {
                offset,
                available: self.body.len(),
            });
        }
        Ok(self.payload)
    }

    /// Decoded `[start, end)` SACK ranges. A trailing partial range is ignored.
    pub fn sack_ranges(&self) -> impl Iterator<Item = (u32, u32)> + 'a {
        self.sack_area
            .chunks_exact(SACK_RANGE_SIZE)
            .map(|c| (read_u32(&c[0..4]), read_u32(&c[4..8])))
    }
}

/// Append `[start, end)` to an encoded SACK list
pub fn push_sack_range(out: &mut Vec<u8>, start: u32, end: u32) {
    out.extend_from_slice(&start.to_le_bytes());
    out.extend_from_slice(&end.to_le_bytes());
}

#[inline]
fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
