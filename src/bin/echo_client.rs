//! Echo client - round-trip latency against `echo_server`
//!
//! Sends framed messages one at a time over a single TCP_NODELAY
//! connection, checks every echoed reply and reports latency percentiles.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin echo_client -- --host 127.0.0.1:9999 --count 10000 --size 64
//! ```

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use mooon::protocol::{encode_common, CommonHeader, MessageHeader, COMMON_HEADER_SIZE};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Server address
    #[clap(long, value_parser, default_value = "127.0.0.1:9999")]
    host: SocketAddr,

    /// Number of round trips
    #[clap(short = 'n', long, value_parser, default_value_t = 10_000)]
    count: u32,

    /// Body size in bytes
    #[clap(short, long, value_parser, default_value_t = 64)]
    size: usize,

    /// Command number carried in the header
    #[clap(long, value_parser, default_value_t = 1)]
    command: u32,
}

/// Send one message and wait for its echo
fn round_trip(stream: &mut TcpStream, request: &[u8], reply: &mut Vec<u8>) -> Result<()> {
    stream.write_all(request).context("send")?;

    let mut head = [0u8; COMMON_HEADER_SIZE];
    stream.read_exact(&mut head).context("receive header")?;
    let header = CommonHeader::decode(&head);

    reply.clear();
    reply.extend_from_slice(&head);
    reply.resize(COMMON_HEADER_SIZE + header.body_size(), 0);
    stream
        .read_exact(&mut reply[COMMON_HEADER_SIZE..])
        .context("receive body")?;
    Ok(())
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64 * p / 100.0) as usize).min(sorted.len() - 1);
    sorted[idx]
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
    let mut stream =
        TcpStream::connect(args.host).with_context(|| format!("connecting to {}", args.host))?;
    stream.set_nodelay(true)?;
    tracing::info!(host = %args.host, count = args.count, size = args.size, "connected");

    let body: Vec<u8> = (0..args.size).map(|i| (i % 251) as u8).collect();
    let request = encode_common(args.command, &body);
    let mut reply = Vec::with_capacity(request.len());
    let mut samples = Vec::with_capacity(args.count as usize);

    let started = Instant::now();
    for i in 0..args.count {
        let sent = Instant::now();
        round_trip(&mut stream, &request, &mut reply)?;
        samples.push(sent.elapsed());
        if reply != request {
            bail!("reply {i} differs from request");
        }
    }
    let elapsed = started.elapsed();

    samples.sort_unstable();
    let rate = args.count as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!("Round trips: {} in {:.2?} ({:.0}/sec)", args.count, elapsed, rate);
    println!("  P50:   {:.2?}", percentile(&samples, 50.0));
    println!("  P99:   {:.2?}", percentile(&samples, 99.0));
    println!("  P99.9: {:.2?}", percentile(&samples, 99.9));
    if let Some(max) = samples.last() {
        println!("  Max:   {:.2?}", max);
    }
    Ok(())
}
