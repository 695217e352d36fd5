//! Fixed-layout frame header and payload encode/decode.
//!
//! Wire layout (32-byte header, all integers big-endian):
//!
//! ```text
//! offset 0   channel_id      16 bytes
//! offset 16  flow_type       1 byte
//! offset 17  data_length     4 bytes
//! offset 21  reserved        11 bytes (zero, except the PING marker)
//! offset 32  data            data_length bytes
//! ```

use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};

/// Total size of the frame header, before any data bytes.
pub const HEADER_LENGTH: usize = 32;

/// Default cap on `data_length`.
pub const DEFAULT_MAX_DATA_LENGTH: u32 = 4 * 1024 * 1024;

const OFFSET_FLOW_TYPE: usize = 16;
const OFFSET_DATA_LENGTH: usize = 17;
const OFFSET_RESERVED: usize = 21;
const PING_MARKER: &[u8; 4] = b"ping";

/// The kind of operation a frame carries.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FlowType {
    /// Open a new channel.
    New,
    /// Carry payload bytes for an existing channel.
    Data,
    /// Close an existing channel.
    Close,
    /// Keepalive; carries no channel-addressed payload.
    Ping,
}

impl FlowType {
    const NEW: u8 = 0x01;
    const DATA: u8 = 0x02;
    const CLOSE: u8 = 0x04;
    const PING: u8 = 0x08;

    fn as_byte(self) -> u8 {
        match self {
            FlowType::New => Self::NEW,
            FlowType::Data => Self::DATA,
            FlowType::Close => Self::CLOSE,
            FlowType::Ping => Self::PING,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            Self::NEW => Ok(FlowType::New),
            Self::DATA => Ok(FlowType::Data),
            Self::CLOSE => Ok(FlowType::Close),
            Self::PING => Ok(FlowType::Ping),
            _ => Err(Error::new(ErrorKind::Protocol)),
        }
    }

    /// Whether this flow type must be addressed to a real (non-zero) channel.
    fn requires_channel(self) -> bool {
        !matches!(self, FlowType::Ping)
    }
}

/// A logical frame exchanged over a multiplexer.
#[derive(Clone, Debug)]
pub struct MultiplexerMessage {
    pub id: Uuid,
    pub flow_type: FlowType,
    pub data: Vec<u8>,
}

impl MultiplexerMessage {
    /// Build a `NEW` frame for `id`.
    pub fn new(id: Uuid) -> Self {
        MultiplexerMessage {
            id,
            flow_type: FlowType::New,
            data: Vec::new(),
        }
    }

    /// Build a `DATA` frame for `id` carrying `data`.
    pub fn data(id: Uuid, data: Vec<u8>) -> Self {
        MultiplexerMessage {
            id,
            flow_type: FlowType::Data,
            data,
        }
    }

    /// Build a `CLOSE` frame for `id`.
    pub fn close(id: Uuid) -> Self {
        MultiplexerMessage {
            id,
            flow_type: FlowType::Close,
            data: Vec::new(),
        }
    }

    /// Build a `PING` frame; not addressed to any channel.
    pub fn ping() -> Self {
        MultiplexerMessage {
            id: Uuid::nil(),
            flow_type: FlowType::Ping,
            data: Vec::new(),
        }
    }

    /// Encode this frame into its on-the-wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LENGTH + self.data.len());
        buf.extend_from_slice(self.id.as_bytes());
        buf.push(self.flow_type.as_byte());

        let data_len = self.data.len() as u32;
        buf.extend_from_slice(&data_len.to_be_bytes());

        let mut reserved = [0u8; HEADER_LENGTH - OFFSET_RESERVED];
        if matches!(self.flow_type, FlowType::Ping) {
            reserved[..PING_MARKER.len()].copy_from_slice(PING_MARKER);
        }
        buf.extend_from_slice(&reserved);

        buf.extend_from_slice(&self.data);
        buf
    }

    /// Parse the fixed 32-byte header, returning the channel id, flow type
    /// and the length of the data that follows on the wire.
    pub fn decode_header(header: &[u8]) -> Result<(Uuid, FlowType, u32)> {
        if header.len() < HEADER_LENGTH {
            return Err(Error::new(ErrorKind::Protocol));
        }

        let id = Uuid::from_slice(&header[..OFFSET_FLOW_TYPE])
            .map_err(|e| Error::wrap(ErrorKind::Protocol, e))?;
        let flow_type = FlowType::from_byte(header[OFFSET_FLOW_TYPE])?;

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[OFFSET_DATA_LENGTH..OFFSET_DATA_LENGTH + 4]);
        let data_length = u32::from_be_bytes(len_bytes);

        if data_length > DEFAULT_MAX_DATA_LENGTH {
            return Err(Error::new(ErrorKind::Protocol));
        }
        if flow_type.requires_channel() && id.is_nil() {
            return Err(Error::new(ErrorKind::Protocol));
        }

        Ok((id, flow_type, data_length))
    }

    /// Combine a decoded header with its trailing data bytes into a full
    /// message.
    pub fn from_parts(id: Uuid, flow_type: FlowType, data: Vec<u8>) -> Self {
        MultiplexerMessage { id, flow_type, data }
    }
}
