//! Ready-made handler for the common `{ size, command }` header
//!
//! The request buffer never extends past the section being received: first
//! the header, then the declared body. A read therefore never crosses a
//! message boundary, which keeps `reset` and thread hand-off lossless. The
//! body buffer grows in `BODY_STEP` increments as bytes land, so a header
//! alone never commits the full declared size. The completed body buffer is
//! handed to the observer without a copy.

use mio::Interest;
use tracing::{debug, trace, warn};

use super::{Indicator, PacketHandler, RequestContext, RequestResult, ResponseContext, ResponseResult};
use crate::error::ProtocolError;
use crate::protocol::{
    CommonHeader, FramerState, MessageFramer, MessageHeader, Outcome, Processor, COMMON_HEADER_SIZE,
};

pub const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Body bytes allocated at a time
pub const BODY_STEP: usize = 64 * 1024;

/// Application hooks for whole messages
pub trait MessageObserver: Send {
    /// A complete message arrived.
    ///
    /// Return the reply to send, `None` for no reply, or an error to close
    /// the connection.
    fn on_message(
        &mut self,
        header: &CommonHeader,
        body: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, ProtocolError>;

    fn on_closed(&mut self) {}

    /// See `PacketHandler::on_timeout`
    fn on_timeout(&mut self) -> bool {
        true
    }

    /// `KeepAlive` for long connections, `CloseConnection` for short ones.
    ///
    /// Set `indicator.thread_index` and return `HandoffRequested` to move
    /// the connection to another worker.
    fn on_response_completed(&mut self, _indicator: &mut Indicator) -> ResponseResult {
        ResponseResult::KeepAlive
    }
}

/// Framing events seen during one `feed`
struct Progress {
    max_body_size: usize,
    header_ready: bool,
    complete: bool,
    rejected: Option<ProtocolError>,
}

impl Processor<CommonHeader> for Progress {
    fn on_header(&mut self, header: &CommonHeader) -> bool {
        trace!(command = header.command(), size = header.size(), "header");
        let size = header.body_size();
        if size > self.max_body_size {
            self.rejected = Some(ProtocolError::BodyTooLarge {
                size,
                limit: self.max_body_size,
            });
            return false;
        }
        self.header_ready = true;
        true
    }

    fn on_message(&mut self, header: &CommonHeader, finished_size: usize, chunk: &[u8]) -> bool {
        if finished_size + chunk.len() == header.body_size() {
            self.complete = true;
        }
        true
    }
}

pub struct BuiltinPacketHandler<O: MessageObserver> {
    observer: O,
    framer: MessageFramer<CommonHeader>,
    progress: Progress,
    request: RequestContext,
    response: ResponseContext,
}

impl<O: MessageObserver> BuiltinPacketHandler<O> {
    pub fn new(observer: O) -> Self {
        Self {
            observer,
            framer: MessageFramer::new(),
            progress: Progress {
                max_body_size: DEFAULT_MAX_BODY_SIZE,
                header_ready: false,
                complete: false,
                rejected: None,
            },
            request: RequestContext::with_size(COMMON_HEADER_SIZE),
            response: ResponseContext::new(),
        }
    }

    /// Reject messages whose body exceeds `limit` bytes
    pub fn with_max_body_size(mut self, limit: usize) -> Self {
        self.progress.max_body_size = limit;
        self
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    fn complete_message(&mut self) -> RequestResult {
        let header = *self.framer.header();
        let body = if header.body_size() == 0 {
            Vec::new()
        } else {
            self.request.take()
        };
        self.request.resize(COMMON_HEADER_SIZE);

        match self.observer.on_message(&header, body) {
            Ok(Some(reply)) if !reply.is_empty() => {
                self.response.append(&reply);
                debug!(response = ?self.response, "reply ready");
                RequestResult::ReadyToRespond
            }
            Ok(_) => RequestResult::NeedMoreData,
            Err(err) => {
                debug!(command = header.command(), error = %err, "message rejected");
                RequestResult::Fatal
            }
        }
    }
}

impl<O: MessageObserver> PacketHandler for BuiltinPacketHandler<O> {
    fn request_context(&self) -> &RequestContext {
        &self.request
    }

    fn request_context_mut(&mut self) -> &mut RequestContext {
        &mut self.request
    }

    fn response_context(&self) -> &ResponseContext {
        &self.response
    }

    fn response_context_mut(&mut self) -> &mut ResponseContext {
        &mut self.response
    }

    fn handle_request(&mut self, received: usize, indicator: &mut Indicator) -> RequestResult {
        trace!(received, request = ?self.request, "handle_request");

        let chunk = self.request.received(received);
        if self.framer.feed(&mut self.progress, chunk) == Outcome::Error {
            match self.progress.rejected.take() {
                Some(err) => warn!(error = %err, "protocol error"),
                None => warn!("protocol error"),
            }
            return RequestResult::Fatal;
        }
        self.request.advance(received);

        if self.progress.complete {
            self.progress.complete = false;
            self.progress.header_ready = false;
            let result = self.complete_message();
            if result == RequestResult::NeedMoreData {
                indicator.interest = Interest::READABLE;
            }
            return result;
        }

        let body_size = self.framer.header().body_size();
        if self.progress.header_ready {
            self.progress.header_ready = false;
            self.request.resize(body_size.min(BODY_STEP));
        } else if self.request.is_full() && self.framer.state() == FramerState::AwaitingBody {
            self.request.grow((body_size - self.request.size()).min(BODY_STEP));
        }
        RequestResult::NeedMoreData
    }

    fn response_completed(&mut self, indicator: &mut Indicator) -> ResponseResult {
        self.observer.on_response_completed(indicator)
    }

    fn reset(&mut self) {
        self.framer.reset();
        self.progress.header_ready = false;
        self.progress.complete = false;
        self.request.resize(COMMON_HEADER_SIZE);
        self.response.reset();
    }

    fn on_timeout(&mut self) -> bool {
        self.observer.on_timeout()
    }

    fn on_closed(&mut self) {
        self.observer.on_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_common;

    #[derive(Default)]
    struct Echo {
        seen: Vec<(u32, Vec<u8>)>,
        silent: bool,
        closed: bool,
    }

    impl MessageObserver for Echo {
        fn on_message(
            &mut self,
            header: &CommonHeader,
            body: Vec<u8>,
        ) -> Result<Option<Vec<u8>>, ProtocolError> {
            if header.command() == 99 {
                return Err(ProtocolError::MessageRejected("bad command".into()));
            }
            self.seen.push((header.command(), body.clone()));
            if self.silent {
                return Ok(None);
            }
            Ok(Some(encode_common(header.command(), &body)))
        }

        fn on_closed(&mut self) {
            self.closed = true;
        }
    }

    /// Feed `bytes` the way the engine would, `max_read` bytes per read
    fn push<O: MessageObserver>(
        handler: &mut BuiltinPacketHandler<O>,
        bytes: &[u8],
        max_read: usize,
    ) -> Vec<RequestResult> {
        let mut results = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let ctx = handler.request_context_mut();
            let n = ctx.remaining().min(max_read).min(bytes.len() - pos);
            ctx.spare_mut()[..n].copy_from_slice(&bytes[pos..pos + n]);
            pos += n;
            let mut indicator = Indicator::for_request(0);
            let result = handler.handle_request(n, &mut indicator);
            results.push(result);
            if result == RequestResult::Fatal {
                break;
            }
        }
        results
    }

    #[test]
    fn test_reads_are_bounded_to_sections() {
        let mut handler = BuiltinPacketHandler::new(Echo::default());
        assert_eq!(handler.request_context().size(), COMMON_HEADER_SIZE);

        let msg = encode_common(7, b"hello world");
        let results = push(&mut handler, &msg, 5);
        assert_eq!(results.last(), Some(&RequestResult::ReadyToRespond));
        assert!(results[..results.len() - 1]
            .iter()
            .all(|r| *r == RequestResult::NeedMoreData));

        assert_eq!(handler.observer().seen, vec![(7, b"hello world".to_vec())]);
        assert_eq!(handler.response_context().unsent(), &msg[..]);
        assert_eq!(handler.request_context().size(), COMMON_HEADER_SIZE);
        assert_eq!(handler.request_context().offset(), 0);
    }

    #[test]
    fn test_zero_body_message() {
        let mut handler = BuiltinPacketHandler::new(Echo {
            silent: true,
            ..Default::default()
        });
        let results = push(&mut handler, &encode_common(3, b""), 64);
        assert_eq!(results, vec![RequestResult::NeedMoreData]);
        assert_eq!(handler.observer().seen, vec![(3, Vec::new())]);
        assert!(handler.response_context().is_empty());
    }

    #[test]
    fn test_message_without_reply_keeps_reading() {
        let mut handler = BuiltinPacketHandler::new(Echo {
            silent: true,
            ..Default::default()
        });
        let mut indicator = Indicator::for_request(0);
        let msg = encode_common(1, b"abc");
        handler.request_context_mut().spare_mut().copy_from_slice(&msg[..8]);
        assert_eq!(handler.handle_request(8, &mut indicator), RequestResult::NeedMoreData);
        handler.request_context_mut().spare_mut().copy_from_slice(&msg[8..]);
        assert_eq!(handler.handle_request(3, &mut indicator), RequestResult::NeedMoreData);
        assert_eq!(indicator.interest, Interest::READABLE);
        assert_eq!(handler.observer().seen.len(), 1);
    }

    #[test]
    fn test_oversized_body_is_fatal() {
        let mut handler = BuiltinPacketHandler::new(Echo::default()).with_max_body_size(4);
        let results = push(&mut handler, &encode_common(1, b"too long"), 64);
        assert_eq!(results, vec![RequestResult::Fatal]);
    }

    #[test]
    fn test_zero_body_reply_is_header_only() {
        let mut handler = BuiltinPacketHandler::new(Echo::default());
        let msg = encode_common(3, b"");
        let results = push(&mut handler, &msg, 64);
        assert_eq!(results, vec![RequestResult::ReadyToRespond]);
        assert_eq!(handler.response_context().unsent(), &msg[..]);
        assert_eq!(handler.response_context().size(), COMMON_HEADER_SIZE);
    }

    #[test]
    fn test_body_buffer_grows_in_steps() {
        let mut handler = BuiltinPacketHandler::new(Echo::default());
        let body: Vec<u8> = (0..BODY_STEP * 2 + 100).map(|i| i as u8).collect();
        let msg = encode_common(4, &body);

        let results = push(&mut handler, &msg[..COMMON_HEADER_SIZE], 64);
        assert_eq!(results, vec![RequestResult::NeedMoreData]);
        assert_eq!(handler.request_context().size(), BODY_STEP);

        let results = push(&mut handler, &msg[COMMON_HEADER_SIZE..COMMON_HEADER_SIZE + BODY_STEP], BODY_STEP);
        assert_eq!(results, vec![RequestResult::NeedMoreData]);
        assert_eq!(handler.request_context().size(), BODY_STEP * 2);
        assert_eq!(handler.request_context().offset(), BODY_STEP);

        let results = push(&mut handler, &msg[COMMON_HEADER_SIZE + BODY_STEP..], 4096);
        assert_eq!(results.last(), Some(&RequestResult::ReadyToRespond));
        assert_eq!(handler.observer().seen, vec![(4, body)]);
        assert_eq!(handler.request_context().size(), COMMON_HEADER_SIZE);
    }

    #[test]
    fn test_observer_rejection_is_fatal() {
        let mut handler = BuiltinPacketHandler::new(Echo::default());
        let results = push(&mut handler, &encode_common(99, b"x"), 64);
        assert_eq!(results.last(), Some(&RequestResult::Fatal));
    }

    #[test]
    fn test_reset_between_messages() {
        let mut handler = BuiltinPacketHandler::new(Echo::default());
        let first = encode_common(1, b"partial body");
        push(&mut handler, &first[..12], 64);
        assert_eq!(handler.request_context().size(), 12);

        handler.reset();
        assert_eq!(handler.request_context().size(), COMMON_HEADER_SIZE);

        let results = push(&mut handler, &encode_common(2, b"ok"), 64);
        assert_eq!(results.last(), Some(&RequestResult::ReadyToRespond));
        assert_eq!(handler.observer().seen, vec![(2, b"ok".to_vec())]);
    }

    #[test]
    fn test_lifecycle_forwarded() {
        let mut handler = BuiltinPacketHandler::new(Echo::default());
        assert!(handler.on_timeout());
        let mut indicator = Indicator::for_response(0);
        assert_eq!(handler.response_completed(&mut indicator), ResponseResult::KeepAlive);
        handler.on_closed();
        assert!(handler.observer().closed);
    }
}
