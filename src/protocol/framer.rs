//! Byte stream to message state machine
//!
//! `MessageFramer` accepts arbitrary chunks of a TCP stream and reports
//! header and body boundaries to a `Processor`:
//!
//! ```text
//! AwaitingHeader -> AwaitingBody -> AwaitingHeader
//! AwaitingHeader (size == 0)     -> AwaitingHeader
//! any state      -> Error        -> AwaitingHeader
//! ```
//!
//! Body bytes are never copied: each `on_message` call borrows a slice of the
//! chunk passed to `feed`. Only the header is assembled in a scratch area,
//! because it may be split across reads.

use super::message::MessageHeader;

/// Receiver of framing events
pub trait Processor<H: MessageHeader> {
    /// A complete header was decoded. Return `false` to reject it.
    fn on_header(&mut self, header: &H) -> bool;

    /// Part of a body arrived.
    ///
    /// `finished_size` is how many body bytes were delivered before `chunk`.
    /// A zero-size body produces one call with `finished_size == 0` and an
    /// empty chunk. Return `false` to reject the message.
    fn on_message(&mut self, header: &H, finished_size: usize, chunk: &[u8]) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerState {
    AwaitingHeader,
    AwaitingBody,
}

/// Result of a framing step
///
/// `feed` only ever returns `PacketBoundary` or `Error`. `NeedMoreData` is
/// what a single step reports when bytes remain in the chunk and the loop
/// inside `feed` must continue with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Malformed input or a rejected callback; the framer has been reset
    Error,
    /// All bytes of this chunk were consumed
    PacketBoundary,
    /// Bytes remain in the chunk
    NeedMoreData,
}

pub struct MessageFramer<H: MessageHeader> {
    header: H,
    scratch: Box<[u8]>,
    state: FramerState,
    /// Bytes finished in the current state (header bytes or body bytes)
    finished_size: usize,
}

impl<H: MessageHeader> Default for MessageFramer<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: MessageHeader> MessageFramer<H> {
    pub fn new() -> Self {
        Self {
            header: H::default(),
            scratch: vec![0u8; H::SIZE].into_boxed_slice(),
            state: FramerState::AwaitingHeader,
            finished_size: 0,
        }
    }

    #[inline(always)]
    pub fn state(&self) -> FramerState {
        self.state
    }

    /// Last decoded header
    #[inline(always)]
    pub fn header(&self) -> &H {
        &self.header
    }

    /// Bytes already consumed of the header or body being assembled
    #[inline(always)]
    pub fn finished_size(&self) -> usize {
        self.finished_size
    }

    /// `true` when no partial header or body is pending
    #[inline(always)]
    pub fn is_idle(&self) -> bool {
        self.state == FramerState::AwaitingHeader && self.finished_size == 0
    }

    /// Start over with a fresh header
    pub fn reset(&mut self) {
        self.set_state(FramerState::AwaitingHeader);
    }

    #[inline(always)]
    fn set_state(&mut self, state: FramerState) {
        self.state = state;
        self.finished_size = 0;
    }

    /// Consume one chunk of the stream
    pub fn feed<P: Processor<H>>(&mut self, processor: &mut P, buffer: &[u8]) -> Outcome {
        if buffer.is_empty() {
            return Outcome::PacketBoundary;
        }
        let mut rest = buffer;

        let outcome = loop {
            let step = match self.state {
                FramerState::AwaitingHeader => self.handle_header(processor, &mut rest),
                FramerState::AwaitingBody => self.handle_body(processor, &mut rest),
            };
            if step != Outcome::NeedMoreData {
                break step;
            }
        };

        if outcome == Outcome::Error {
            self.reset();
        }
        outcome
    }

    fn handle_header<P: Processor<H>>(&mut self, processor: &mut P, rest: &mut &[u8]) -> Outcome {
        let chunk = *rest;

        if self.finished_size + chunk.len() < H::SIZE {
            self.scratch[self.finished_size..self.finished_size + chunk.len()]
                .copy_from_slice(chunk);
            self.finished_size += chunk.len();
            return Outcome::PacketBoundary;
        }

        let need = H::SIZE - self.finished_size;
        self.scratch[self.finished_size..].copy_from_slice(&chunk[..need]);
        self.header = H::decode(&self.scratch);
        self.finished_size = H::SIZE;

        if !processor.on_header(&self.header) {
            return Outcome::Error;
        }

        *rest = &chunk[need..];

        if self.header.body_size() > 0 {
            self.set_state(FramerState::AwaitingBody);
        } else {
            self.set_state(FramerState::AwaitingHeader);
            if !processor.on_message(&self.header, 0, &[]) {
                return Outcome::Error;
            }
        }

        if rest.is_empty() {
            Outcome::PacketBoundary
        } else {
            Outcome::NeedMoreData
        }
    }

    fn handle_body<P: Processor<H>>(&mut self, processor: &mut P, rest: &mut &[u8]) -> Outcome {
        let chunk = *rest;
        let body_size = self.header.body_size();

        if self.finished_size + chunk.len() < body_size {
            if !processor.on_message(&self.header, self.finished_size, chunk) {
                return Outcome::Error;
            }
            self.finished_size += chunk.len();
            return Outcome::PacketBoundary;
        }

        let need = body_size - self.finished_size;
        if !processor.on_message(&self.header, self.finished_size, &chunk[..need]) {
            return Outcome::Error;
        }

        self.set_state(FramerState::AwaitingHeader);
        *rest = &chunk[need..];

        if rest.is_empty() {
            Outcome::PacketBoundary
        } else {
            Outcome::NeedMoreData
        }
    }
}
