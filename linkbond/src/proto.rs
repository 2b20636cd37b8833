//! Wire protocol of the demo overlay.
//!
//! Every packet is a single sealed frame:
//!
//! - Magic number (4 bytes): protocol identifier
//! - Version (1 byte)
//! - Verb (1 byte): engine verb code
//! - Packet id (8 bytes): per-node monotone counter
//! - Flow id (4 bytes, signed): `-1` for unclassified traffic
//! - Payload length (2 bytes)
//! - Authentication tag (16 bytes): ChaCha20-Poly1305, header as AAD
//! - Payload (variable, encrypted)
//!
//! All multi-byte fields are network byte order. Nonces are derived from the
//! sender's domain and the packet id, so a shared key never reuses a nonce
//! across directions.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use linkbond_core::Verb;

/// Magic number identifying demo frames (ASCII: "LBND").
pub const PROTOCOL_MAGIC: u32 = 0x4C42_4E44;

/// Current protocol version.
pub const CURRENT_VERSION: u8 = 1;

/// Size of the AEAD authentication tag.
pub const AUTH_TAG_SIZE: usize = 16;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 20;

/// Minimum frame size (header + tag, no payload).
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + AUTH_TAG_SIZE;

/// Flow id stamped on traffic that belongs to no particular flow.
pub const NO_FLOW: i32 = -1;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

pub type FrameKey = [u8; KEY_SIZE];

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("invalid magic number: 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown verb code: {0}")]
    UnknownVerb(u8),

    #[error("invalid frame length: expected at least {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("authentication failed")]
    Crypto,
}

/// Plaintext frame header, authenticated as AEAD associated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub verb: Verb,
    pub packet_id: u64,
    pub flow_id: i32,
    pub payload_len: u16,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        buf[4] = CURRENT_VERSION;
        buf[5] = self.verb.code();
        buf[6..14].copy_from_slice(&self.packet_id.to_be_bytes());
        buf[14..18].copy_from_slice(&self.flow_id.to_be_bytes());
        buf[18..20].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtoError::InvalidLength {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != PROTOCOL_MAGIC {
            return Err(ProtoError::InvalidMagic(magic));
        }
        if buf[4] != CURRENT_VERSION {
            return Err(ProtoError::UnsupportedVersion(buf[4]));
        }
        let verb = Verb::from_code(buf[5]).ok_or(ProtoError::UnknownVerb(buf[5]))?;
        let packet_id = u64::from_be_bytes(buf[6..14].try_into().unwrap());
        let flow_id = i32::from_be_bytes(buf[14..18].try_into().unwrap());
        let payload_len = u16::from_be_bytes(buf[18..20].try_into().unwrap());
        Ok(Self {
            verb,
            packet_id,
            flow_id,
            payload_len,
        })
    }
}

/// A decoded (still sealed) frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub auth_tag: [u8; AUTH_TAG_SIZE],
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_FRAME_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.auth_tag);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < MIN_FRAME_SIZE {
            return Err(ProtoError::InvalidLength {
                expected: MIN_FRAME_SIZE,
                actual: buf.len(),
            });
        }
        let header = FrameHeader::decode(&buf[..HEADER_SIZE])?;
        let mut auth_tag = [0u8; AUTH_TAG_SIZE];
        auth_tag.copy_from_slice(&buf[HEADER_SIZE..MIN_FRAME_SIZE]);
        let expected = MIN_FRAME_SIZE + header.payload_len as usize;
        if buf.len() < expected {
            return Err(ProtoError::InvalidLength {
                expected,
                actual: buf.len(),
            });
        }
        let payload = buf[MIN_FRAME_SIZE..expected].to_vec();
        Ok(Self {
            header,
            auth_tag,
            payload,
        })
    }
}

/// Seals and opens frames with a pre-shared key.
pub struct FrameCrypto {
    cipher: ChaCha20Poly1305,
}

impl FrameCrypto {
    pub fn new(key: &FrameKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn generate_key() -> FrameKey {
        rand::random()
    }

    /// Scope each direction to its own nonce domain so a shared key never
    /// sees the same (nonce, id) twice.
    fn nonce(domain: u32, packet_id: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0..4].copy_from_slice(&domain.to_be_bytes());
        nonce[4..12].copy_from_slice(&packet_id.to_be_bytes());
        nonce
    }

    /// Build and seal a frame, returning the wire bytes.
    pub fn seal(
        &self,
        domain: u32,
        verb: Verb,
        packet_id: u64,
        flow_id: i32,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtoError> {
        let header = FrameHeader {
            verb,
            packet_id,
            flow_id,
            payload_len: payload.len() as u16,
        };
        let aad = header.encode();
        let nonce_bytes = Self::nonce(domain, packet_id);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut buf = payload.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce, &aad, &mut buf)
            .map_err(|_| ProtoError::Crypto)?;
        let mut auth_tag = [0u8; AUTH_TAG_SIZE];
        auth_tag.copy_from_slice(tag.as_slice());
        Ok(Frame {
            header,
            auth_tag,
            payload: buf,
        }
        .encode())
    }

    /// Verify and decrypt a frame's payload.
    pub fn open(&self, domain: u32, frame: &Frame) -> Result<Vec<u8>, ProtoError> {
        if frame.header.payload_len as usize != frame.payload.len() {
            return Err(ProtoError::Crypto);
        }
        let aad = frame.header.encode();
        let nonce_bytes = Self::nonce(domain, frame.header.packet_id);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut buf = frame.payload.clone();
        self.cipher
            .decrypt_in_place_detached(nonce, &aad, &mut buf, Tag::from_slice(&frame.auth_tag))
            .map_err(|_| ProtoError::Crypto)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN_A: u32 = 0xA1;
    const DOMAIN_B: u32 = 0xB2;

    #[test]
    fn test_header_round_trip() {
        let header = FrameHeader {
            verb: Verb::QosMeasurement,
            packet_id: 0x1234_5678_9ABC_DEF0,
            flow_id: -1,
            payload_len: 300,
        };
        let decoded = FrameHeader::decode(&header.encode()).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut buf = FrameHeader {
            verb: Verb::Frame,
            packet_id: 1,
            flow_id: NO_FLOW,
            payload_len: 0,
        }
        .encode();
        buf[0] = 0xFF;
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(ProtoError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_header_rejects_unknown_verb() {
        let mut buf = FrameHeader {
            verb: Verb::Frame,
            packet_id: 1,
            flow_id: NO_FLOW,
            payload_len: 0,
        }
        .encode();
        buf[5] = 0x7F;
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(ProtoError::UnknownVerb(0x7F))
        ));
    }

    #[test]
    fn test_seal_open_round_trip() {
        let key = FrameCrypto::generate_key();
        let crypto = FrameCrypto::new(&key);
        let wire = crypto
            .seal(DOMAIN_A, Verb::Frame, 7, 42, b"demo payload")
            .unwrap();
        let frame = Frame::decode(&wire).unwrap();
        assert_eq!(frame.header.verb, Verb::Frame);
        assert_eq!(frame.header.flow_id, 42);
        let payload = crypto.open(DOMAIN_A, &frame).unwrap();
        assert_eq!(payload, b"demo payload");
    }

    #[test]
    fn test_open_wrong_domain_fails() {
        let key = FrameCrypto::generate_key();
        let crypto = FrameCrypto::new(&key);
        let wire = crypto.seal(DOMAIN_A, Verb::Echo, 9, NO_FLOW, b"").unwrap();
        let frame = Frame::decode(&wire).unwrap();
        assert!(crypto.open(DOMAIN_B, &frame).is_err());
    }

    #[test]
    fn test_tampered_header_fails() {
        let key = FrameCrypto::generate_key();
        let crypto = FrameCrypto::new(&key);
        let wire = crypto.seal(DOMAIN_A, Verb::Frame, 11, 5, b"x").unwrap();
        let mut frame = Frame::decode(&wire).unwrap();
        frame.header.flow_id = 6;
        assert!(crypto.open(DOMAIN_A, &frame).is_err());
    }

    #[test]
    fn test_frame_too_short() {
        assert!(matches!(
            Frame::decode(&[0u8; 8]),
            Err(ProtoError::InvalidLength { .. })
        ));
    }
}
