//! Per-connection request/response bookkeeping

use std::fmt;
use std::fs::File;
use std::os::unix::io::AsRawFd;

use mio::Interest;

/// What the engine should do after a handler callback returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Indicator {
    /// Reset the handler (and the engine's sending state) before going on
    pub reset: bool,
    /// Worker thread that should own the connection next
    pub thread_index: u16,
    /// Readiness to wait for next
    pub interest: Interest,
}

impl Indicator {
    /// Defaults handed to `handle_request`: no reset, same thread, wait for
    /// write readiness.
    pub fn for_request(thread_index: u16) -> Self {
        Self {
            reset: false,
            thread_index,
            interest: Interest::WRITABLE,
        }
    }

    /// Defaults handed to `response_completed`: reset, same thread, wait
    /// for the next request.
    pub fn for_response(thread_index: u16) -> Self {
        Self {
            reset: true,
            thread_index,
            interest: Interest::READABLE,
        }
    }
}

/// Receive-side buffer of a connection
///
/// The engine reads into `spare_mut()`, i.e. `buffer[offset..]`, and then
/// tells the handler how many bytes landed there. Advancing `offset` (or
/// swapping the buffer) is the handler's business.
#[derive(Default)]
pub struct RequestContext {
    buffer: Vec<u8>,
    offset: usize,
}

impl RequestContext {
    /// Buffer of exactly `size` bytes, offset 0
    pub fn with_size(size: usize) -> Self {
        Self {
            buffer: vec![0u8; size],
            offset: 0,
        }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes still free after `offset`
    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.offset
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    /// Region the next read lands in
    #[inline(always)]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.offset..]
    }

    /// Bytes already filled in
    #[inline(always)]
    pub fn filled(&self) -> &[u8] {
        &self.buffer[..self.offset]
    }

    /// `len` bytes starting at the current offset
    #[inline(always)]
    pub fn received(&self, len: usize) -> &[u8] {
        &self.buffer[self.offset..self.offset + len]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Mark `n` more bytes as filled
    ///
    /// # Panics
    /// Panics if that would run past the buffer.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.remaining(), "advance past end of request buffer");
        self.offset += n;
    }

    pub fn set_offset(&mut self, offset: usize) {
        assert!(offset <= self.buffer.len(), "offset past end of request buffer");
        self.offset = offset;
    }

    /// Replace the buffer with a zeroed one of `size` bytes, offset 0
    pub fn resize(&mut self, size: usize) {
        self.buffer.clear();
        self.buffer.resize(size, 0);
        self.offset = 0;
    }

    /// Extend the buffer by `additional` zeroed bytes, keeping what was filled
    pub fn grow(&mut self, additional: usize) {
        self.buffer.resize(self.buffer.len() + additional, 0);
    }

    /// Take the buffer out, leaving an empty context behind
    pub fn take(&mut self) -> Vec<u8> {
        self.offset = 0;
        std::mem::take(&mut self.buffer)
    }

    /// Forget received bytes, keep the allocation
    pub fn rewind(&mut self) {
        self.offset = 0;
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request_context://{}|{}", self.buffer.len(), self.offset)
    }
}

/// What a response consists of
#[derive(Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    Buffer(Vec<u8>),
    /// Streamed with `sendfile`, starting at the context's offset
    File(File),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty"),
            Self::Buffer(b) => write!(f, "buffer({})", b.len()),
            Self::File(file) => write!(f, "file(fd={})", file.as_raw_fd()),
        }
    }
}

/// Send-side state of a connection
#[derive(Default)]
pub struct ResponseContext {
    body: ResponseBody,
    size: usize,
    offset: usize,
}

impl ResponseContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond with an in-memory buffer
    pub fn set_buffer(&mut self, buffer: Vec<u8>) {
        self.size = buffer.len();
        self.offset = 0;
        self.body = ResponseBody::Buffer(buffer);
    }

    /// Respond with `size` bytes of `file`, starting at `offset`
    pub fn set_file(&mut self, file: File, offset: usize, size: usize) {
        self.size = offset + size;
        self.offset = offset;
        self.body = ResponseBody::File(file);
    }

    /// Append to the in-memory buffer, creating it if needed
    ///
    /// A pending file response is replaced.
    pub fn append(&mut self, bytes: &[u8]) {
        match &mut self.body {
            ResponseBody::Buffer(buf) => buf.extend_from_slice(bytes),
            body => *body = ResponseBody::Buffer(bytes.to_vec()),
        }
        if let ResponseBody::Buffer(buf) = &self.body {
            self.size = buf.len();
        }
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Total bytes to send (for files: end offset)
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes already sent (for files: current file offset)
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline(always)]
    pub fn pending(&self) -> usize {
        self.size.saturating_sub(self.offset)
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn move_offset(&mut self, n: usize) {
        self.offset += n;
    }

    /// Unsent part of an in-memory response
    pub fn unsent(&self) -> &[u8] {
        match &self.body {
            ResponseBody::Buffer(buf) if self.offset < buf.len() => &buf[self.offset..],
            _ => &[],
        }
    }

    /// Drop the body (closing a response file) and zero the counters
    pub fn reset(&mut self) {
        self.body = ResponseBody::Empty;
        self.size = 0;
        self.offset = 0;
    }
}

impl fmt::Debug for ResponseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "response_context://{:?}|{}|{}",
            self.body, self.size, self.offset
        )
    }
}
