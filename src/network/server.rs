//! Listener thread plus worker pool
//!
//! The acceptor owns every listening socket. Accepted connections get a
//! handler from the factory and are dealt round-robin to the workers
//! through the same intake queues used for hand-off.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::TcpListener as MioTcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use super::stats::{IoCounters, ServerStats};
use super::switch::{intake, Switchboard, Takeover};
use super::waiter::Waiter;
use super::worker::Worker;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::handler::HandlerFactory;

const STOP_TOKEN: Token = Token(usize::MAX);
const ACCEPT_EVENTS: usize = 256;
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Running server; dropping it stops every thread
pub struct Server {
    local_addrs: Vec<SocketAddr>,
    stats: Arc<ServerStats>,
    stop: Arc<AtomicBool>,
    acceptor_waker: Arc<Waker>,
    switchboard: Switchboard,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bind the listen addresses and start the acceptor and workers
    pub fn start<F>(config: ServerConfig, factory: F) -> Result<Self, ServerError>
    where
        F: HandlerFactory + 'static,
    {
        config.validate()?;

        let acceptor_poll =
            Poll::new().map_err(|e| ServerError::io("cannot create acceptor poll", e))?;
        let acceptor_waker = Arc::new(
            Waker::new(acceptor_poll.registry(), STOP_TOKEN)
                .map_err(|e| ServerError::io("cannot create acceptor waker", e))?,
        );

        let mut listeners = Vec::with_capacity(config.listen.len());
        let mut local_addrs = Vec::with_capacity(config.listen.len());
        for (index, addr) in config.listen.iter().enumerate() {
            let listener = bind(*addr)?;
            let mut listener = MioTcpListener::from_std(listener);
            acceptor_poll
                .registry()
                .register(&mut listener, Token(index), Interest::READABLE)
                .map_err(|e| ServerError::io(format!("cannot watch listener {addr}"), e))?;
            let local = listener
                .local_addr()
                .map_err(|e| ServerError::io(format!("cannot query listener {addr}"), e))?;
            info!(%local, "listening");
            local_addrs.push(local);
            listeners.push(listener);
        }

        let mut server = Self::with_workers(&config, local_addrs, acceptor_waker)?;

        let acceptor = Acceptor {
            poll: acceptor_poll,
            listeners,
            factory,
            switchboard: server.switchboard.clone(),
            stats: Arc::clone(&server.stats),
            stop: Arc::clone(&server.stop),
            next_thread: 0,
            poll_timeout: config.epoll_timeout(),
        };
        server.spawn("mooon-acceptor".into(), move || acceptor.run())?;
        Ok(server)
    }

    /// Create and start the worker pool.
    ///
    /// Threads are owned by the returned value as soon as they run, so an
    /// error part way through stops and joins the ones already started.
    fn with_workers(
        config: &ServerConfig,
        local_addrs: Vec<SocketAddr>,
        acceptor_waker: Arc<Waker>,
    ) -> Result<Self, ServerError> {
        let mut workers = Vec::with_capacity(config.thread_count as usize);
        let mut lanes = Vec::with_capacity(config.thread_count as usize);
        for index in 0..config.thread_count {
            let (tx, rx) = intake(config.takeover_queue_size);
            let (worker, waker) = Worker::new(index, config, rx)
                .map_err(|e| ServerError::io(format!("cannot create worker {index}"), e))?;
            workers.push(worker);
            lanes.push((tx, waker));
        }

        let mut server = Self {
            local_addrs,
            stats: Arc::new(ServerStats::new(IoCounters::shared())),
            stop: Arc::new(AtomicBool::new(false)),
            acceptor_waker,
            switchboard: Switchboard::new(lanes),
            threads: Vec::with_capacity(workers.len() + 1),
        };
        for (index, worker) in workers.into_iter().enumerate() {
            let (switchboard, stats, stop) = (
                server.switchboard.clone(),
                Arc::clone(&server.stats),
                Arc::clone(&server.stop),
            );
            server.spawn(format!("mooon-worker-{index}"), move || {
                if let Err(err) = worker.run(switchboard, stats, stop) {
                    error!(thread = index, error = %err, "worker exited");
                }
            })?;
        }
        Ok(server)
    }

    fn spawn<T>(&mut self, name: String, body: T) -> Result<(), ServerError>
    where
        T: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|e| ServerError::io(format!("cannot spawn {name}"), e))?;
        self.threads.push(handle);
        Ok(())
    }

    /// Bound addresses, in `listen` order (resolves port 0)
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Stop accepting, close every connection and join all threads
    pub fn shutdown(mut self) {
        self.stop_threads();
    }

    /// Block until the server is stopped from another thread or a thread dies
    pub fn join(mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("server thread panicked");
            }
        }
    }

    fn stop_threads(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.stop.store(true, Ordering::Release);
        if let Err(err) = self.acceptor_waker.wake() {
            warn!(error = %err, "failed to wake acceptor");
        }
        self.switchboard.wake_all();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("server thread panicked");
            }
        }
        self.stats.log_summary();
        info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let listener =
        TcpListener::bind(addr).map_err(|e| ServerError::io(format!("cannot bind {addr}"), e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| ServerError::io(format!("cannot configure {addr}"), e))?;
    Ok(listener)
}

struct Acceptor<F> {
    poll: Poll,
    listeners: Vec<MioTcpListener>,
    factory: F,
    switchboard: Switchboard,
    stats: Arc<ServerStats>,
    stop: Arc<AtomicBool>,
    next_thread: usize,
    poll_timeout: Duration,
}

impl<F: HandlerFactory> Acceptor<F> {
    fn run(mut self) {
        let mut events = Events::with_capacity(ACCEPT_EVENTS);
        let mut last_report = Instant::now();

        while !self.stop.load(Ordering::Acquire) {
            if let Err(err) = self.poll.poll(&mut events, Some(self.poll_timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %err, "acceptor poll failed");
                return;
            }

            for event in events.iter() {
                if event.token() != STOP_TOKEN {
                    self.accept_all(event.token().0);
                }
            }

            if last_report.elapsed() >= STATS_INTERVAL {
                last_report = Instant::now();
                self.stats.log_summary();
            }
        }
        debug!("acceptor stopped");
    }

    fn accept_all(&mut self, index: usize) {
        loop {
            let Some(listener) = self.listeners.get(index) else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer)) => self.place(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // e.g. EMFILE; the next readiness event retries
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn place(&mut self, stream: mio::net::TcpStream, peer: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = %err, "cannot set TCP_NODELAY");
        }

        let thread_index = (self.next_thread % self.switchboard.len()) as u16;
        self.next_thread = self.next_thread.wrapping_add(1);

        let handler = self.factory.create(peer);
        let waiter = Waiter::new(stream, peer, handler, Arc::clone(&self.stats.io));
        self.stats.connection_opened();

        let takeover = Takeover {
            waiter,
            interest: Interest::READABLE,
        };
        match self.switchboard.transfer(thread_index, takeover) {
            Ok(()) => debug!(%peer, thread = thread_index, "connection accepted"),
            Err((reason, takeover)) => {
                warn!(%peer, thread = thread_index, %reason, "connection rejected");
                self.stats.connection_rejected();
                takeover.waiter.switch_failed(reason);
                self.stats.connection_closed();
            }
        }
    }
}
