//! Fixed-size message headers
//!
//! Layout of every message on the wire:
//! ┌─────────────────────────────────────────────────────┐
//! │ Header (fixed size, contains the body size)         │
//! ├─────────────────────────────────────────────────────┤
//! │ Body (exactly `size` bytes, may be empty)           │
//! └─────────────────────────────────────────────────────┘
//!
//! There is no checksum and no length prefix beyond `size`.

use super::wire_int::NUInt32;

/// A fixed-size header that declares the length of the body following it
pub trait MessageHeader: Copy + Default + std::fmt::Debug {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Decode from exactly `SIZE` bytes
    fn decode(bytes: &[u8]) -> Self;

    /// Encode into `out[..SIZE]`
    fn encode(&self, out: &mut [u8]);

    /// Body byte count, excluding the header itself
    fn body_size(&self) -> usize;
}

/// The common `{ size, command }` header
#[repr(C, packed(4))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommonHeader {
    /// Body byte count, excluding the header
    pub size: NUInt32,
    /// Command word
    pub command: NUInt32,
}

pub const COMMON_HEADER_SIZE: usize = std::mem::size_of::<CommonHeader>();

impl CommonHeader {
    #[inline(always)]
    pub fn new(command: u32, size: u32) -> Self {
        Self {
            size: NUInt32::from_host(size),
            command: NUInt32::from_host(command),
        }
    }

    #[inline(always)]
    pub fn command(&self) -> u32 {
        let command = self.command;
        command.to_host()
    }

    #[inline(always)]
    pub fn size(&self) -> u32 {
        let size = self.size;
        size.to_host()
    }

    /// Total message size (header + body)
    #[inline(always)]
    pub fn total_size(&self) -> usize {
        COMMON_HEADER_SIZE + self.size() as usize
    }
}

impl MessageHeader for CommonHeader {
    const SIZE: usize = COMMON_HEADER_SIZE;

    #[inline(always)]
    fn decode(bytes: &[u8]) -> Self {
        Self {
            size: NUInt32::from_wire_bytes(&bytes[0..4]),
            command: NUInt32::from_wire_bytes(&bytes[4..8]),
        }
    }

    #[inline(always)]
    fn encode(&self, out: &mut [u8]) {
        let (size, command) = (self.size, self.command);
        size.write_wire_bytes(&mut out[0..4]);
        command.write_wire_bytes(&mut out[4..8]);
    }

    #[inline(always)]
    fn body_size(&self) -> usize {
        self.size() as usize
    }
}

/// Encode `header` followed by `body` into a fresh buffer
///
/// The header's size field is taken as given, so callers that want a
/// consistent message should build it with `body.len()`.
pub fn encode_message<H: MessageHeader>(header: &H, body: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; H::SIZE + body.len()];
    header.encode(&mut out[..H::SIZE]);
    out[H::SIZE..].copy_from_slice(body);
    out
}

/// Encode a common-header message for `command` carrying `body`
pub fn encode_common(command: u32, body: &[u8]) -> Vec<u8> {
    encode_message(&CommonHeader::new(command, body.len() as u32), body)
}
