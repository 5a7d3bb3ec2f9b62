//! Frame encoding/decoding for the tunnel protocol
//!
//! Frames use the WebSocket binary layout:
//! ```text
//! +--------+--------+----------------+------------------+---------+
//! | opcode |  len0  | ext len (0/2/8)| mask key (0/4)   | payload |
//! +--------+--------+----------------+------------------+---------+
//! ```
//! `opcode` is `0x80 | content code`. Client frames set `0x80` in `len0`
//! and carry a random 4-byte mask key XOR-ed over the payload; server
//! frames are never masked. A 7-bit length of 126 or 127 selects a 2- or
//! 8-byte big-endian extended length.

use super::TunnelError;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// FIN bit, always set: every message is a single frame
const FIN_BIT: u8 = 0x80;

/// Mask bit in the second header byte of client frames
const MASK_BIT: u8 = 0x80;

/// Largest length that fits in the 7-bit field
const MAX_SHORT_LEN: usize = 125;

/// `len0` marker for a 2-byte extended length
const EXT_LEN_16: u8 = 126;

/// `len0` marker for an 8-byte extended length
const EXT_LEN_64: u8 = 127;

/// Mask key length
pub const MASK_KEY_LEN: usize = 4;

/// Largest payload accepted by the decoder (16 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Which side produced a frame, which decides masking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Client to server, always masked
    Client,
    /// Server to client, never masked
    Server,
}

/// Frame content types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    /// Control message (carries the encrypted "fin")
    Text = 0x1,
    /// Data frame, also used for the IV exchange
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl ContentType {
    /// Parse the first header byte
    fn from_opcode(opcode: u8) -> Result<Self, TunnelError> {
        if opcode & FIN_BIT == 0 {
            return Err(TunnelError::InvalidFrame(format!(
                "Fragmented frames are not supported: opcode {:#04x}",
                opcode
            )));
        }

        match opcode & 0x7F {
            0x1 => Ok(ContentType::Text),
            0x2 => Ok(ContentType::Binary),
            0x8 => Ok(ContentType::Close),
            0x9 => Ok(ContentType::Ping),
            0xA => Ok(ContentType::Pong),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown opcode: {:#04x}",
                opcode
            ))),
        }
    }

    fn opcode(self) -> u8 {
        FIN_BIT | self as u8
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Producing side
    pub frame_type: FrameType,
    /// Content type
    pub content_type: ContentType,
    /// Unmasked payload
    pub payload: Bytes,
    /// Mask key (client frames only)
    pub mask_key: Option<[u8; MASK_KEY_LEN]>,
}

impl Frame {
    /// Create a frame, choosing a random mask key for client frames
    pub fn new(frame_type: FrameType, content_type: ContentType, payload: Bytes) -> Self {
        let mask_key = match frame_type {
            FrameType::Client => Some(rand::random::<[u8; MASK_KEY_LEN]>()),
            FrameType::Server => None,
        };

        Self {
            frame_type,
            content_type,
            payload,
            mask_key,
        }
    }

    /// Create a binary frame
    pub fn binary(frame_type: FrameType, payload: Bytes) -> Self {
        Self::new(frame_type, ContentType::Binary, payload)
    }

    /// Create a text (control) frame
    pub fn text(frame_type: FrameType, payload: Bytes) -> Self {
        Self::new(frame_type, ContentType::Text, payload)
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let payload_len = self.payload.len();
        let mut buf = BytesMut::with_capacity(self.encoded_size());

        buf.put_u8(self.content_type.opcode());

        let mask_flag = match self.frame_type {
            FrameType::Client => MASK_BIT,
            FrameType::Server => 0,
        };

        if payload_len <= MAX_SHORT_LEN {
            buf.put_u8(mask_flag | payload_len as u8);
        } else if payload_len <= u16::MAX as usize {
            buf.put_u8(mask_flag | EXT_LEN_16);
            buf.put_u16(payload_len as u16);
        } else {
            buf.put_u8(mask_flag | EXT_LEN_64);
            buf.put_u64(payload_len as u64);
        }

        match (self.frame_type, self.mask_key) {
            (FrameType::Client, key) => {
                let key = key.unwrap_or_else(rand::random);
                buf.put_slice(&key);
                let start = buf.len();
                buf.put_slice(&self.payload);
                mask(&key, &mut buf[start..]);
            }
            (FrameType::Server, _) => buf.put_slice(&self.payload),
        }

        buf
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        let len = self.payload.len();
        let ext_len = if len <= MAX_SHORT_LEN {
            0
        } else if len <= u16::MAX as usize {
            2
        } else {
            8
        };
        let mask_len = match self.frame_type {
            FrameType::Client => MASK_KEY_LEN,
            FrameType::Server => 0,
        };

        2 + ext_len + mask_len + len
    }
}

/// Read exactly one frame from `reader`, suspending until it is complete
pub async fn read_frame<R>(reader: &mut R, frame_type: FrameType) -> Result<Frame, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    read_exact(reader, &mut header).await?;

    let content_type = ContentType::from_opcode(header[0])?;

    let payload_len = match length_code(header[1], frame_type)? {
        EXT_LEN_16 => {
            let mut raw = [0u8; 2];
            read_exact(reader, &mut raw).await?;
            u16::from_be_bytes(raw) as u64
        }
        EXT_LEN_64 => {
            let mut raw = [0u8; 8];
            read_exact(reader, &mut raw).await?;
            u64::from_be_bytes(raw)
        }
        short => short as u64,
    };
    let payload_len = checked_payload_len(payload_len)?;

    let mask_key = match frame_type {
        FrameType::Client => {
            let mut key = [0u8; MASK_KEY_LEN];
            read_exact(reader, &mut key).await?;
            Some(key)
        }
        FrameType::Server => None,
    };

    let mut payload = vec![0u8; payload_len];
    read_exact(reader, &mut payload).await?;

    if let Some(key) = &mask_key {
        mask(key, &mut payload);
    }

    Ok(Frame {
        frame_type,
        content_type,
        payload: Bytes::from(payload),
        mask_key,
    })
}

/// XOR `data` in place with the repeating 4-byte mask key
///
/// Applying the same key twice restores the original bytes.
pub fn mask(key: &[u8; MASK_KEY_LEN], data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % MASK_KEY_LEN];
    }
}

/// Extract the 7-bit length code from the second header byte
fn length_code(len0: u8, frame_type: FrameType) -> Result<u8, TunnelError> {
    match frame_type {
        FrameType::Client if len0 & MASK_BIT == 0 => Err(TunnelError::InvalidFrame(format!(
            "Unmasked client frame: length code {}",
            len0
        ))),
        FrameType::Client => Ok(len0 & !MASK_BIT),
        FrameType::Server if len0 & MASK_BIT != 0 => Err(TunnelError::InvalidFrame(format!(
            "Invalid length code for server frame: {}",
            len0
        ))),
        FrameType::Server => Ok(len0),
    }
}

fn checked_payload_len(len: u64) -> Result<usize, TunnelError> {
    if len > MAX_PAYLOAD_SIZE as u64 {
        return Err(TunnelError::FrameTooLarge(len, MAX_PAYLOAD_SIZE));
    }
    Ok(len as usize)
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TunnelError::UnexpectedEof),
        Err(e) => Err(TunnelError::Io(e)),
    }
}
