//! Record layer: decrypting inbound ciphertext and sealing outbound
//! plaintext for an established session.

mod decoder;
mod encoder;

/// Outcome of one [`Session::decrypt`](crate::Session::decrypt) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// Zero or more bytes were delivered and the stream is still open.
    Data,
    /// The peer closed the stream with a close-notify.
    SessionEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub delivered: usize,
    pub status: DecodeStatus,
}

impl Decoded {
    pub(crate) fn data(delivered: usize) -> Self {
        Self {
            delivered,
            status: DecodeStatus::Data,
        }
    }

    pub(crate) fn ended() -> Self {
        Self {
            delivered: 0,
            status: DecodeStatus::SessionEnded,
        }
    }
}
