//! Message framing
//!
//! Every frame is `type u16 | session-id u32 | payload-size u32`, a fixed
//! header block whose meaning depends on the type, then the payload. All
//! integers are little endian.

use crate::domain::TransportError;
use hookprof_common::{MessageType, FRAME_PREFIX_SIZE, HEADER_BLOCK_SIZE, MAX_PAYLOAD_SIZE};

/// Type-specific fixed header block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    /// Single address (or process id for `StartCapture`)
    Generic { address: u64 },
    /// `GetData` / `SetData`: where the bytes come from and how to read them
    DataTransfer { address: u64, kind: u32, size: u32 },
    /// Argument read descriptors for one function
    ArgTracking { address: u64, num_args: u32 },
    /// Engine metadata for actor-name resolution
    UnrealInfo { names_address: u64, actor_name_address: u64, entry_size: u32 },
}

impl Default for Header {
    fn default() -> Self {
        Header::Generic { address: 0 }
    }
}

impl Header {
    fn encode(&self) -> [u8; HEADER_BLOCK_SIZE] {
        let mut block = [0u8; HEADER_BLOCK_SIZE];
        match *self {
            Header::Generic { address } => {
                block[0..8].copy_from_slice(&address.to_le_bytes());
            }
            Header::DataTransfer { address, kind, size } => {
                block[0..8].copy_from_slice(&address.to_le_bytes());
                block[8..12].copy_from_slice(&kind.to_le_bytes());
                block[12..16].copy_from_slice(&size.to_le_bytes());
            }
            Header::ArgTracking { address, num_args } => {
                block[0..8].copy_from_slice(&address.to_le_bytes());
                block[8..12].copy_from_slice(&num_args.to_le_bytes());
            }
            Header::UnrealInfo { names_address, actor_name_address, entry_size } => {
                block[0..8].copy_from_slice(&names_address.to_le_bytes());
                block[8..16].copy_from_slice(&actor_name_address.to_le_bytes());
                block[16..20].copy_from_slice(&entry_size.to_le_bytes());
            }
        }
        block
    }

    fn decode(kind: MessageType, block: &[u8]) -> Result<Self, TransportError> {
        let mut reader = WireReader::new(block);
        let header = match kind {
            MessageType::GetData | MessageType::SetData => Header::DataTransfer {
                address: reader.u64()?,
                kind: reader.u32()?,
                size: reader.u32()?,
            },
            MessageType::ArgTracking => {
                Header::ArgTracking { address: reader.u64()?, num_args: reader.u32()? }
            }
            MessageType::OrbitUnrealInfo => Header::UnrealInfo {
                names_address: reader.u64()?,
                actor_name_address: reader.u64()?,
                entry_size: reader.u32()?,
            },
            _ => Header::Generic { address: reader.u64()? },
        };
        Ok(header)
    }

    /// Address carried by any header variant
    #[must_use]
    pub fn address(&self) -> u64 {
        match *self {
            Header::Generic { address }
            | Header::DataTransfer { address, .. }
            | Header::ArgTracking { address, .. } => address,
            Header::UnrealInfo { names_address, .. } => names_address,
        }
    }
}

/// One transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub session_id: u32,
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    #[must_use]
    pub fn new(kind: MessageType, session_id: u32) -> Self {
        Self { kind, session_id, header: Header::default(), payload: Vec::new() }
    }

    #[must_use]
    pub fn with_header(mut self, header: Header) -> Self {
        self.header = header;
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Payload-only array of 8-byte little-endian addresses
    #[must_use]
    pub fn with_addresses(self, addresses: &[u64]) -> Self {
        self.with_payload(encode_addresses(addresses))
    }

    /// Total encoded size in bytes
    #[must_use]
    pub fn wire_size(&self) -> usize {
        FRAME_PREFIX_SIZE + HEADER_BLOCK_SIZE + self.payload.len()
    }

    /// Encode into a contiguous frame
    ///
    /// # Errors
    /// Returns [`TransportError::FrameTooLarge`] when the payload exceeds the frame limit.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let mut out = Vec::with_capacity(self.wire_size());
        out.extend_from_slice(&(self.kind as u16).to_le_bytes());
        out.extend_from_slice(&self.session_id.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_PAYLOAD_SIZE
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode the payload as an address list
    ///
    /// # Errors
    /// Returns [`TransportError::Truncated`] when the payload is not a multiple of 8 bytes.
    pub fn addresses(&self) -> Result<Vec<u64>, TransportError> {
        decode_addresses(&self.payload)
    }
}

#[must_use]
pub fn encode_addresses(addresses: &[u64]) -> Vec<u8> {
    addresses.iter().flat_map(|a| a.to_le_bytes()).collect()
}

/// # Errors
/// Returns [`TransportError::Truncated`] when `bytes` is not a multiple of 8.
pub fn decode_addresses(bytes: &[u8]) -> Result<Vec<u64>, TransportError> {
    if bytes.len() % 8 != 0 {
        return Err(TransportError::Truncated {
            expected: bytes.len().next_multiple_of(8),
            actual: bytes.len(),
        });
    }
    let mut reader = WireReader::new(bytes);
    (0..bytes.len() / 8).map(|_| reader.u64()).collect()
}

/// Thread scheduling event reported by the stub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSwitch {
    pub tid: u32,
    pub processor: u16,
    pub is_switch_in: bool,
    pub timestamp: u64,
}

impl ContextSwitch {
    pub const WIRE_SIZE: usize = 16;

    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.extend_from_slice(&self.tid.to_le_bytes());
        out.extend_from_slice(&self.processor.to_le_bytes());
        out.push(u8::from(self.is_switch_in));
        out.push(0);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    /// # Errors
    /// Returns [`TransportError::Truncated`] on short payloads.
    pub fn from_payload(bytes: &[u8]) -> Result<Self, TransportError> {
        let mut reader = WireReader::new(bytes);
        let tid = reader.u32()?;
        let processor = reader.u16()?;
        let is_switch_in = reader.u8()? != 0;
        reader.u8()?;
        let timestamp = reader.u64()?;
        Ok(Self { tid, processor, is_switch_in, timestamp })
    }
}

/// Little-endian cursor over a payload
pub struct WireReader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> WireReader<'a> {
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, at: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], TransportError> {
        let end = self.at + N;
        let slice = self.bytes.get(self.at..end).ok_or(TransportError::Truncated {
            expected: end,
            actual: self.bytes.len(),
        })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.at = end;
        Ok(out)
    }

    /// # Errors
    /// Returns [`TransportError::Truncated`] past the end of the payload.
    pub fn u8(&mut self) -> Result<u8, TransportError> {
        Ok(self.take::<1>()?[0])
    }

    /// # Errors
    /// Returns [`TransportError::Truncated`] past the end of the payload.
    pub fn u16(&mut self) -> Result<u16, TransportError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    /// # Errors
    /// Returns [`TransportError::Truncated`] past the end of the payload.
    pub fn u32(&mut self) -> Result<u32, TransportError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    /// # Errors
    /// Returns [`TransportError::Truncated`] past the end of the payload.
    pub fn u64(&mut self) -> Result<u64, TransportError> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.at)
    }
}

/// Incremental frame assembly from a byte stream
///
/// Bytes arrive in arbitrary chunks; complete frames are handed out in
/// arrival order. Oversized frames are skipped without buffering their
/// payload, and frames of unknown type are consumed and reported.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    skip_remaining: usize,
    max_payload: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(MAX_PAYLOAD_SIZE)
    }

    #[must_use]
    pub fn with_limit(max_payload: usize) -> Self {
        Self { buffer: Vec::new(), skip_remaining: 0, max_payload }
    }

    pub fn push(&mut self, mut bytes: &[u8]) {
        if self.skip_remaining > 0 {
            let skipped = self.skip_remaining.min(bytes.len());
            self.skip_remaining -= skipped;
            bytes = &bytes[skipped..];
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as a frame
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Next complete frame, `None` when more bytes are needed
    pub fn next_frame(&mut self) -> Option<Result<Message, TransportError>> {
        const FIXED: usize = FRAME_PREFIX_SIZE + HEADER_BLOCK_SIZE;
        if self.buffer.len() < FIXED {
            return None;
        }

        let raw_type = u16::from_le_bytes([self.buffer[0], self.buffer[1]]);
        let session_id =
            u32::from_le_bytes([self.buffer[2], self.buffer[3], self.buffer[4], self.buffer[5]]);
        let payload_size =
            u32::from_le_bytes([self.buffer[6], self.buffer[7], self.buffer[8], self.buffer[9]])
                as usize;

        if payload_size > self.max_payload {
            let available = self.buffer.len() - FIXED;
            let dropped = available.min(payload_size);
            self.buffer.drain(..FIXED + dropped);
            self.skip_remaining = payload_size - dropped;
            return Some(Err(TransportError::FrameTooLarge {
                size: payload_size,
                max: self.max_payload,
            }));
        }

        let total = FIXED + payload_size;
        if self.buffer.len() < total {
            return None;
        }

        let frame: Vec<u8> = self.buffer.drain(..total).collect();
        let Some(kind) = MessageType::from_u16(raw_type) else {
            return Some(Err(TransportError::UnknownMessageType(raw_type)));
        };

        Some(Header::decode(kind, &frame[FRAME_PREFIX_SIZE..FIXED]).map(|header| Message {
            kind,
            session_id,
            header,
            payload: frame[FIXED..].to_vec(),
        }))
    }
}
