//! PEM armor: base64 bodies between `-----BEGIN <label>-----` and
//! `-----END <label>-----` lines, wrapped at 64 columns.

use ssock_types::SessionError;

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
const LINE_LEN: usize = 64;

fn invalid(msg: &str) -> SessionError {
    SessionError::CertificateInvalid(format!("bad armor: {msg}"))
}

fn base64_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let mut group = [0u8; 3];
        group[..chunk.len()].copy_from_slice(chunk);
        let bits = u32::from_be_bytes([0, group[0], group[1], group[2]]);
        for i in 0..4 {
            if i <= chunk.len() {
                out.push(ALPHABET[((bits >> (18 - 6 * i)) & 0x3F) as usize] as char);
            } else {
                out.push('=');
            }
        }
    }
    out
}

fn sextet(c: u8) -> Result<u32, SessionError> {
    ALPHABET
        .iter()
        .position(|&a| a == c)
        .map(|p| p as u32)
        .ok_or_else(|| invalid("unexpected character"))
}

/// Strict decode: padding only at the very end, length a multiple of four.
fn base64_decode(text: &str) -> Result<Vec<u8>, SessionError> {
    let bytes = text.as_bytes();
    if bytes.len() % 4 != 0 {
        return Err(invalid("length is not a multiple of four"));
    }
    let groups = bytes.len() / 4;
    let mut out = Vec::with_capacity(groups * 3);
    for (index, group) in bytes.chunks(4).enumerate() {
        let padding = group.iter().rev().take_while(|&&c| c == b'=').count();
        if padding > 2 || (padding > 0 && index + 1 != groups) {
            return Err(invalid("misplaced padding"));
        }
        let mut bits = 0u32;
        for &c in &group[..4 - padding] {
            bits = (bits << 6) | sextet(c)?;
        }
        bits <<= 6 * padding as u32;
        out.extend_from_slice(&bits.to_be_bytes()[1..4 - padding]);
    }
    Ok(out)
}

pub(crate) fn encode(label: &str, data: &[u8]) -> String {
    let body = base64_encode(data);
    let mut out = String::with_capacity(body.len() + body.len() / LINE_LEN + 2 * label.len() + 40);
    out.push_str(&format!("-----BEGIN {label}-----\n"));
    // The alphabet is ASCII, so every slice boundary is a char boundary.
    let mut rest = body.as_str();
    while !rest.is_empty() {
        let (line, tail) = rest.split_at(rest.len().min(LINE_LEN));
        out.push_str(line);
        out.push('\n');
        rest = tail;
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

/// Decode every `label` block in `text`. Blocks with other labels and
/// text between blocks are skipped.
pub(crate) fn parse(text: &str, label: &str) -> Result<Vec<Vec<u8>>, SessionError> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let mut blocks = Vec::new();
    let mut body: Option<String> = None;
    for line in text.lines().map(str::trim) {
        match body.as_mut() {
            None if line == begin => body = Some(String::new()),
            None => {}
            Some(b64) if line == end => {
                blocks.push(base64_decode(b64)?);
                body = None;
            }
            Some(b64) => b64.push_str(line),
        }
    }
    if body.is_some() {
        return Err(invalid("unterminated block"));
    }
    Ok(blocks)
}
