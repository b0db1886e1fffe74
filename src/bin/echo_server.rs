//! Echo server
//!
//! Framed mode (default) echoes every `{size, command}` message back with the
//! same command. Raw mode echoes whatever each read returns and closes the
//! connection after a line starting with `quit`.
//!
//! Usage:
//!   cargo run --release --bin echo_server -- [--config FILE] [--listen ADDR]... [--threads N] [--raw]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use mooon::error::ProtocolError;
use mooon::handler::{
    BuiltinPacketHandler, Indicator, MessageObserver, PacketHandler, RequestContext,
    RequestResult, ResponseContext, ResponseResult,
};
use mooon::protocol::{encode_common, CommonHeader};
use mooon::{Server, ServerConfig};

const RAW_BUFFER_SIZE: usize = 4096;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,

    /// Listen address, repeatable; replaces the configured list
    #[clap(short, long, value_parser)]
    listen: Vec<SocketAddr>,

    /// Worker thread count
    #[clap(short, long, value_parser)]
    threads: Option<u16>,

    /// Idle timeout in seconds, 0 disables
    #[clap(long, value_parser)]
    timeout: Option<u64>,

    /// Echo raw bytes instead of framed messages
    #[clap(long)]
    raw: bool,
}

struct FramedEcho;

impl MessageObserver for FramedEcho {
    fn on_message(
        &mut self,
        header: &CommonHeader,
        body: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        Ok(Some(encode_common(header.command(), &body)))
    }
}

struct RawEcho {
    request: RequestContext,
    response: ResponseContext,
    quit: bool,
}

impl RawEcho {
    fn new() -> Self {
        Self {
            request: RequestContext::with_size(RAW_BUFFER_SIZE),
            response: ResponseContext::new(),
            quit: false,
        }
    }
}

impl PacketHandler for RawEcho {
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

    fn handle_request(&mut self, received: usize, _indicator: &mut Indicator) -> RequestResult {
        let data = self.request.received(received);
        self.quit = data.starts_with(b"quit");
        self.response.set_buffer(data.to_vec());
        RequestResult::ReadyToRespond
    }

    fn response_completed(&mut self, _indicator: &mut Indicator) -> ResponseResult {
        if self.quit {
            ResponseResult::CloseConnection
        } else {
            ResponseResult::KeepAlive
        }
    }

    fn reset(&mut self) {
        self.response.reset();
    }
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if !args.listen.is_empty() {
        config.listen = args.listen.clone();
    }
    if let Some(threads) = args.threads {
        config.thread_count = threads;
    }
    if let Some(timeout) = args.timeout {
        config.connection_timeout_seconds = timeout;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let max_body_size = config.max_body_size;
    tracing::info!(threads = config.thread_count, raw = args.raw, "starting echo server");

    let server = if args.raw {
        Server::start(config, |_peer: SocketAddr| -> Box<dyn PacketHandler> {
            Box::new(RawEcho::new())
        })?
    } else {
        Server::start(config, move |_peer: SocketAddr| -> Box<dyn PacketHandler> {
            Box::new(BuiltinPacketHandler::new(FramedEcho).with_max_body_size(max_body_size))
        })?
    };

    for addr in server.local_addrs() {
        tracing::info!(%addr, "echo server ready");
    }
    server.join();
    Ok(())
}
