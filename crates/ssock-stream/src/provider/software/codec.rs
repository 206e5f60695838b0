//! Wire format of the software provider: record framing and handshake
//! messages.

use ssock_types::SecurityError;

use crate::identity::SIGNATURE_LEN;

/// Record header: content_type(1) || version(2) || length(2).
pub const RECORD_HEADER_LEN: usize = 5;

pub const RECORD_VERSION: u16 = 0x0303;

/// AES-GCM tag appended to every protected record.
pub const TAG_LEN: usize = 16;

/// Largest payload a single record may carry.
pub const MAX_MESSAGE_LEN: usize = 16384;

/// Largest length field accepted in a record header.
pub const MAX_RECORD_BODY_LEN: usize = MAX_MESSAGE_LEN + TAG_LEN;

const HANDSHAKE_HEADER_LEN: usize = 4;
pub const RANDOM_LEN: usize = 32;
pub const KEY_SHARE_LEN: usize = 32;
pub const MAC_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl ContentType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            21 => Some(ContentType::Alert),
            22 => Some(ContentType::Handshake),
            23 => Some(ContentType::ApplicationData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: ContentType,
    pub length: usize,
}

impl RecordHeader {
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_LEN + self.length
    }
}

// ---------------------------------------------------------------------------
// Record framing
// ---------------------------------------------------------------------------

/// Parse the record header at the start of `data`.
///
/// Returns `Ok(None)` when fewer than [`RECORD_HEADER_LEN`] bytes are
/// available.
pub fn parse_record_header(data: &[u8]) -> Result<Option<RecordHeader>, SecurityError> {
    if data.len() < RECORD_HEADER_LEN {
        return Ok(None);
    }
    let content_type = ContentType::from_u8(data[0]).ok_or(SecurityError::IllegalMessage)?;
    if u16::from_be_bytes([data[1], data[2]]) != RECORD_VERSION {
        return Err(SecurityError::UnsupportedVersion);
    }
    let length = u16::from_be_bytes([data[3], data[4]]) as usize;
    if length > MAX_RECORD_BODY_LEN {
        return Err(SecurityError::RecordOverflow);
    }
    Ok(Some(RecordHeader {
        content_type,
        length,
    }))
}

pub fn encode_record_header(content_type: ContentType, length: usize) -> [u8; RECORD_HEADER_LEN] {
    let len = (length as u16).to_be_bytes();
    let version = RECORD_VERSION.to_be_bytes();
    [content_type as u8, version[0], version[1], len[0], len[1]]
}

// ---------------------------------------------------------------------------
// Handshake messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    HelloRequest = 0,
    ClientHello = 1,
    ServerHello = 2,
    ClientFinished = 20,
}

impl HandshakeType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(HandshakeType::HelloRequest),
            1 => Some(HandshakeType::ClientHello),
            2 => Some(HandshakeType::ServerHello),
            20 => Some(HandshakeType::ClientFinished),
            _ => None,
        }
    }
}

/// A complete handshake message found at the start of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeMessage<'a> {
    pub msg_type: HandshakeType,
    pub body: &'a [u8],
    /// Bytes of the buffer the enclosing record occupies.
    pub consumed: usize,
}

/// Frame a handshake body as a plaintext handshake record.
pub fn encode_handshake(msg_type: HandshakeType, body: &[u8]) -> Vec<u8> {
    let len = body.len();
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN + len);
    out.extend_from_slice(&encode_record_header(
        ContentType::Handshake,
        HANDSHAKE_HEADER_LEN + len,
    ));
    out.push(msg_type as u8);
    out.push((len >> 16) as u8);
    out.push((len >> 8) as u8);
    out.push(len as u8);
    out.extend_from_slice(body);
    out
}

/// Parse one handshake record. `Ok(None)` means more bytes are needed.
pub fn parse_handshake(data: &[u8]) -> Result<Option<HandshakeMessage<'_>>, SecurityError> {
    let Some(header) = parse_record_header(data)? else {
        return Ok(None);
    };
    if header.content_type != ContentType::Handshake {
        return Err(SecurityError::IllegalMessage);
    }
    let total = header.record_len();
    if data.len() < total {
        return Ok(None);
    }
    let fragment = &data[RECORD_HEADER_LEN..total];
    if fragment.len() < HANDSHAKE_HEADER_LEN {
        return Err(SecurityError::IllegalMessage);
    }
    let msg_type = HandshakeType::from_u8(fragment[0]).ok_or(SecurityError::IllegalMessage)?;
    let length =
        ((fragment[1] as usize) << 16) | ((fragment[2] as usize) << 8) | (fragment[3] as usize);
    if length != fragment.len() - HANDSHAKE_HEADER_LEN {
        return Err(SecurityError::IllegalMessage);
    }
    Ok(Some(HandshakeMessage {
        msg_type,
        body: &fragment[HANDSHAKE_HEADER_LEN..],
        consumed: total,
    }))
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], SecurityError> {
    let end = pos.checked_add(len).ok_or(SecurityError::IllegalMessage)?;
    let out = data.get(*pos..end).ok_or(SecurityError::IllegalMessage)?;
    *pos = end;
    Ok(out)
}

fn take_array<const N: usize>(data: &[u8], pos: &mut usize) -> Result<[u8; N], SecurityError> {
    let mut out = [0u8; N];
    out.copy_from_slice(take(data, pos, N)?);
    Ok(out)
}

fn take_u16_prefixed<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8], SecurityError> {
    let len = take_array::<2>(data, pos)?;
    take(data, pos, u16::from_be_bytes(len) as usize)
}

fn finish(data: &[u8], pos: usize) -> Result<(), SecurityError> {
    if pos == data.len() {
        Ok(())
    } else {
        Err(SecurityError::IllegalMessage)
    }
}

/// ClientHello: random(32) || x25519 share(32).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub random: [u8; RANDOM_LEN],
    pub key_share: [u8; KEY_SHARE_LEN],
}

impl ClientHello {
    pub fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(RANDOM_LEN + KEY_SHARE_LEN);
        body.extend_from_slice(&self.random);
        body.extend_from_slice(&self.key_share);
        body
    }

    pub fn decode(body: &[u8]) -> Result<Self, SecurityError> {
        let mut pos = 0;
        let random = take_array(body, &mut pos)?;
        let key_share = take_array(body, &mut pos)?;
        finish(body, pos)?;
        Ok(Self { random, key_share })
    }
}

/// ServerHello: random || share || u16-prefixed certificate || signature || finished MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub random: [u8; RANDOM_LEN],
    pub key_share: [u8; KEY_SHARE_LEN],
    pub certificate: Vec<u8>,
    pub signature: [u8; SIGNATURE_LEN],
    pub finished: [u8; MAC_LEN],
}

impl ServerHello {
    /// The part of the message covered by the first transcript hash.
    pub fn core(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RANDOM_LEN + KEY_SHARE_LEN + 2 + self.certificate.len());
        out.extend_from_slice(&self.random);
        out.extend_from_slice(&self.key_share);
        out.extend_from_slice(&(self.certificate.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.certificate);
        out
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut body = self.core();
        body.extend_from_slice(&self.signature);
        body.extend_from_slice(&self.finished);
        body
    }

    pub fn decode(body: &[u8]) -> Result<Self, SecurityError> {
        let mut pos = 0;
        let random = take_array(body, &mut pos)?;
        let key_share = take_array(body, &mut pos)?;
        let certificate = take_u16_prefixed(body, &mut pos)?.to_vec();
        let signature = take_array(body, &mut pos)?;
        let finished = take_array(body, &mut pos)?;
        finish(body, pos)?;
        Ok(Self {
            random,
            key_share,
            certificate,
            signature,
            finished,
        })
    }
}

/// Client certificate and its signature over the handshake transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAuth {
    pub certificate: Vec<u8>,
    pub signature: [u8; SIGNATURE_LEN],
}

/// ClientFinished: has_cert(1) || [u16-prefixed certificate || signature] || finished MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFinished {
    pub auth: Option<ClientAuth>,
    pub finished: [u8; MAC_LEN],
}

impl ClientFinished {
    /// The part of the message the finished MAC covers.
    pub fn core(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match &self.auth {
            None => out.push(0),
            Some(auth) => {
                out.push(1);
                out.extend_from_slice(&(auth.certificate.len() as u16).to_be_bytes());
                out.extend_from_slice(&auth.certificate);
                out.extend_from_slice(&auth.signature);
            }
        }
        out
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut body = self.core();
        body.extend_from_slice(&self.finished);
        body
    }

    pub fn decode(body: &[u8]) -> Result<Self, SecurityError> {
        let mut pos = 0;
        let [has_cert] = take_array::<1>(body, &mut pos)?;
        let auth = match has_cert {
            0 => None,
            1 => {
                let certificate = take_u16_prefixed(body, &mut pos)?.to_vec();
                let signature = take_array(body, &mut pos)?;
                Some(ClientAuth {
                    certificate,
                    signature,
                })
            }
            _ => return Err(SecurityError::IllegalMessage),
        };
        let finished = take_array(body, &mut pos)?;
        finish(body, pos)?;
        Ok(Self { auth, finished })
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

pub const ALERT_LEVEL_WARNING: u8 = 1;
pub const ALERT_LEVEL_FATAL: u8 = 2;
pub const ALERT_CLOSE_NOTIFY: u8 = 0;
