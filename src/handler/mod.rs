//! Connection handler contract
//!
//! One `PacketHandler` is bound to each live connection. The engine owns the
//! socket and calls into the handler at each phase of the request/response
//! cycle; the handler decides what is complete, what to send back and whether
//! the connection should move to another worker thread.
//!
//! All recoverable-vs-fatal judgment lives in the handler. Anything other than
//! the success paths makes the engine tear the connection down.

mod builtin;
mod context;

pub use builtin::{BuiltinPacketHandler, MessageObserver, DEFAULT_MAX_BODY_SIZE};
pub use context::{Indicator, RequestContext, ResponseBody, ResponseContext};

use crate::error::{ChannelError, SwitchFailure};

/// Result of `handle_request`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestResult {
    /// Keep receiving
    NeedMoreData,
    /// Request complete, start the response phase
    ReadyToRespond,
    /// Move the connection to `Indicator::thread_index`
    HandoffRequested,
    /// Close the connection
    Fatal,
}

/// Result of `response_completed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseResult {
    KeepAlive,
    /// Move the connection to `Indicator::thread_index`
    HandoffRequested,
    CloseConnection,
}

pub trait PacketHandler: Send {
    fn request_context(&self) -> &RequestContext;

    fn request_context_mut(&mut self) -> &mut RequestContext;

    fn response_context(&self) -> &ResponseContext;

    fn response_context_mut(&mut self) -> &mut ResponseContext;

    /// `received` new bytes landed at the request context's offset.
    ///
    /// `indicator` starts as `Indicator::for_request`.
    fn handle_request(&mut self, received: usize, indicator: &mut Indicator) -> RequestResult;

    /// Called once per response cycle, right before the first send attempt
    fn before_response(&mut self) {}

    /// Advance the response offset after a partial send
    fn move_response_offset(&mut self, sent: usize) {
        self.response_context_mut().move_offset(sent);
    }

    /// The whole response was sent.
    ///
    /// `indicator` starts as `Indicator::for_response`.
    fn response_completed(&mut self, _indicator: &mut Indicator) -> ResponseResult {
        ResponseResult::KeepAlive
    }

    /// Called whenever an indicator asks for a reset
    fn reset(&mut self) {}

    /// The connection was idle past the deadline.
    ///
    /// `true` closes it, `false` refreshes the idle timer.
    fn on_timeout(&mut self) -> bool {
        true
    }

    /// Connection is being torn down; no further calls follow
    fn on_closed(&mut self) {}

    /// A syscall failed fatally; the connection is closed without a
    /// subsequent `on_closed`
    fn on_io_error(&mut self, _err: &ChannelError) {}

    /// A requested hand-off could not be delivered; `on_closed` follows
    fn on_switch_failure(&mut self, _reason: SwitchFailure) {}
}

/// Produces one handler per accepted connection
pub trait HandlerFactory: Send + Sync {
    fn create(&self, peer: std::net::SocketAddr) -> Box<dyn PacketHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn(std::net::SocketAddr) -> Box<dyn PacketHandler> + Send + Sync,
{
    fn create(&self, peer: std::net::SocketAddr) -> Box<dyn PacketHandler> {
        self(peer)
    }
}
