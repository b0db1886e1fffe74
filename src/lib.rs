//! mooon - multi-threaded TCP server core
//!
//! Architecture:
//! - Protocol: wire-order integers, fixed headers, a resumable message framer
//! - Network: non-blocking socket I/O and per-thread mio event loops
//! - Handler: the per-connection callback contract and a builtin handler
//!
//! Connections can move between worker threads at message boundaries
//! without ever being driven by two threads at once.

pub mod config;
pub mod error;
pub mod handler;
pub mod network;
pub mod protocol;

pub use config::ServerConfig;
pub use error::{ChannelError, ConfigError, ProtocolError, ServerError, SwitchFailure};
pub use handler::{
    BuiltinPacketHandler, HandlerFactory, Indicator, MessageObserver, PacketHandler,
    RequestContext, RequestResult, ResponseBody, ResponseContext, ResponseResult,
};
pub use network::{DataChannel, IoCounters, Server, ServerStats};
pub use protocol::{CommonHeader, MessageFramer, MessageHeader, Outcome, Processor, WireInt};
