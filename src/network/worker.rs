//! Worker thread: one mio poll serving many connections
//!
//! New and handed-over connections arrive through the intake queue. Each
//! loop iteration dispatches readiness events, drains the intake and, at
//! most once a second, offers idle connections to `on_timeout`.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use mio::event::Event;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use super::stats::ServerStats;
use super::switch::{Switchboard, Takeover};
use super::waiter::{Next, Waiter};
use crate::config::ServerConfig;
use crate::error::SwitchFailure;

const WAKE_TOKEN: Token = Token(0);
const SCAN_INTERVAL: Duration = Duration::from_secs(1);

pub(crate) struct Worker {
    index: u16,
    poll: Poll,
    intake: Receiver<Takeover>,
    waiters: HashMap<Token, Waiter>,
    next_token: usize,
    events_capacity: usize,
    capacity: usize,
    poll_timeout: Duration,
    idle_timeout: Option<Duration>,
    last_scan: Instant,
}

impl Worker {
    /// Build a worker and the waker other threads use to rouse it
    pub(crate) fn new(
        index: u16,
        config: &ServerConfig,
        intake: Receiver<Takeover>,
    ) -> io::Result<(Self, Arc<Waker>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let worker = Self {
            index,
            poll,
            intake,
            waiters: HashMap::with_capacity(config.connection_pool_size.min(1024)),
            next_token: WAKE_TOKEN.0,
            events_capacity: config.epoll_size,
            capacity: config.connection_pool_size,
            poll_timeout: config.epoll_timeout(),
            idle_timeout: config.connection_timeout(),
            last_scan: Instant::now(),
        };
        Ok((worker, waker))
    }

    pub(crate) fn run(
        mut self,
        switchboard: Switchboard,
        stats: Arc<ServerStats>,
        stop: Arc<AtomicBool>,
    ) -> io::Result<()> {
        info!(thread = self.index, "worker started");
        let mut events = Events::with_capacity(self.events_capacity);

        while !stop.load(Ordering::Acquire) {
            if let Err(err) = self.poll.poll(&mut events, Some(self.poll_timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(thread = self.index, error = %err, "poll failed");
                self.close_all(&stats);
                return Err(err);
            }

            for event in events.iter() {
                if event.token() != WAKE_TOKEN {
                    self.dispatch(event, &switchboard, &stats);
                }
            }

            self.drain_intake(&stats);
            self.scan_idle(&stats);
        }

        self.close_all(&stats);
        info!(thread = self.index, "worker stopped");
        Ok(())
    }

    fn dispatch(&mut self, event: &Event, switchboard: &Switchboard, stats: &ServerStats) {
        let token = event.token();
        let Some(waiter) = self.waiters.get_mut(&token) else {
            return;
        };
        let next = waiter.on_event(event);
        self.apply(token, next, switchboard, stats);
    }

    fn apply(&mut self, token: Token, next: Next, switchboard: &Switchboard, stats: &ServerStats) {
        match next {
            Next::Rearm(interest) => {
                let Some(waiter) = self.waiters.get_mut(&token) else {
                    return;
                };
                if let Err(err) = waiter.reregister(self.poll.registry(), token, interest) {
                    warn!(peer = %waiter.peer(), error = %err, "cannot rearm connection");
                    self.close(token, stats);
                }
            }
            Next::Handover {
                thread_index,
                interest,
            } => self.handover(token, thread_index, interest, switchboard, stats),
            Next::Close => self.close(token, stats),
            Next::Abort => {
                if let Some(mut waiter) = self.waiters.remove(&token) {
                    // on_io_error was the last callback
                    let _ = waiter.deregister(self.poll.registry());
                    stats.connection_closed();
                }
            }
        }
    }

    fn handover(
        &mut self,
        token: Token,
        thread_index: u16,
        interest: Interest,
        switchboard: &Switchboard,
        stats: &ServerStats,
    ) {
        let Some(mut waiter) = self.waiters.remove(&token) else {
            return;
        };
        let (peer, from) = (waiter.peer(), waiter.thread_index());

        if let Err(err) = waiter.deregister(self.poll.registry()) {
            warn!(%peer, error = %err, "cannot release connection");
            waiter.close();
            stats.connection_closed();
            return;
        }

        match switchboard.transfer(thread_index, Takeover { waiter, interest }) {
            Ok(()) => {
                debug!(%peer, from, to = thread_index, "connection handed over");
                stats.handoff();
            }
            Err((reason, takeover)) => {
                warn!(%peer, from, to = thread_index, %reason, "hand-off failed");
                stats.handoff_failed();
                takeover.waiter.switch_failed(reason);
                stats.connection_closed();
            }
        }
    }

    fn drain_intake(&mut self, stats: &ServerStats) {
        while let Ok(Takeover { mut waiter, interest }) = self.intake.try_recv() {
            if self.waiters.len() >= self.capacity {
                warn!(thread = self.index, peer = %waiter.peer(), "connection pool exhausted");
                stats.connection_rejected();
                waiter.switch_failed(SwitchFailure::Overflow {
                    thread_index: self.index,
                });
                stats.connection_closed();
                continue;
            }

            let token = self.allocate_token();
            waiter.set_thread_index(self.index);
            waiter.touch();
            if let Err(err) = waiter.register(self.poll.registry(), token, interest) {
                warn!(peer = %waiter.peer(), error = %err, "cannot watch connection");
                waiter.close();
                stats.connection_closed();
                continue;
            }
            debug!(thread = self.index, peer = %waiter.peer(), ?token, "connection taken over");
            self.waiters.insert(token, waiter);
        }
    }

    fn allocate_token(&mut self) -> Token {
        loop {
            self.next_token = self.next_token.wrapping_add(1);
            let token = Token(self.next_token);
            if token != WAKE_TOKEN && !self.waiters.contains_key(&token) {
                return token;
            }
        }
    }

    fn scan_idle(&mut self, stats: &ServerStats) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        let now = Instant::now();
        if now.saturating_duration_since(self.last_scan) < SCAN_INTERVAL {
            return;
        }
        self.last_scan = now;

        let idle: Vec<Token> = self
            .waiters
            .iter()
            .filter(|(_, waiter)| waiter.is_idle(now, timeout))
            .map(|(token, _)| *token)
            .collect();

        for token in idle {
            let Some(waiter) = self.waiters.get_mut(&token) else {
                continue;
            };
            if waiter.on_timeout() {
                debug!(peer = %waiter.peer(), "connection timed out");
                stats.timed_out();
                self.close(token, stats);
            } else {
                waiter.touch();
            }
        }
    }

    fn close(&mut self, token: Token, stats: &ServerStats) {
        if let Some(mut waiter) = self.waiters.remove(&token) {
            if let Err(err) = waiter.deregister(self.poll.registry()) {
                debug!(peer = %waiter.peer(), error = %err, "deregister failed");
            }
            waiter.close();
            stats.connection_closed();
        }
    }

    fn close_all(&mut self, stats: &ServerStats) {
        let tokens: Vec<Token> = self.waiters.keys().copied().collect();
        for token in tokens {
            self.close(token, stats);
        }
        while let Ok(takeover) = self.intake.try_recv() {
            takeover.waiter.close();
            stats.connection_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{BuiltinPacketHandler, MessageObserver};
    use crate::network::stats::IoCounters;
    use crate::network::switch::intake;
    use crate::protocol::{encode_common, CommonHeader};
    use crate::error::ProtocolError;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        closed: Arc<AtomicUsize>,
    }

    impl MessageObserver for Counting {
        fn on_message(
            &mut self,
            header: &CommonHeader,
            body: Vec<u8>,
        ) -> Result<Option<Vec<u8>>, ProtocolError> {
            Ok(Some(encode_common(header.command() + 1, &body)))
        }

        fn on_closed(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn accepted(listener: &std::net::TcpListener) -> (mio::net::TcpStream, std::net::SocketAddr) {
        let (stream, peer) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        (mio::net::TcpStream::from_std(stream), peer)
    }

    #[test]
    fn test_worker_serves_and_times_out() {
        let config = ServerConfig {
            connection_timeout_seconds: 1,
            epoll_timeout_milliseconds: 50,
            ..ServerConfig::default()
        };
        let (tx, rx) = intake(8);
        let (worker, waker) = Worker::new(0, &config, rx).unwrap();
        let switchboard = Switchboard::new(vec![(tx, waker)]);
        let stats = Arc::new(ServerStats::new(IoCounters::shared()));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let (switchboard, stats, stop) = (switchboard.clone(), Arc::clone(&stats), Arc::clone(&stop));
            std::thread::spawn(move || worker.run(switchboard, stats, stop))
        };

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = accepted(&listener);
        let closed = Arc::new(AtomicUsize::new(0));
        let handler = BuiltinPacketHandler::new(Counting {
            closed: Arc::clone(&closed),
        });
        let waiter = Waiter::new(stream, peer, Box::new(handler), Arc::clone(&stats.io));
        stats.connection_opened();
        assert!(switchboard
            .transfer(0, Takeover { waiter, interest: Interest::READABLE })
            .is_ok());

        let msg = encode_common(1, b"ping");
        client.write_all(&msg).unwrap();
        let mut reply = vec![0u8; msg.len()];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, encode_common(2, b"ping"));

        // Idle past the deadline: the worker closes the socket
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut rest = [0u8; 1];
        assert_eq!(client.read(&mut rest).unwrap(), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(stats.timeouts(), 1);

        stop.store(true, Ordering::Release);
        switchboard.wake_all();
        handle.join().unwrap().unwrap();
        assert_eq!(stats.connections_active(), 0);
    }

    /// Declines every timeout
    struct Patient {
        offered: Arc<AtomicUsize>,
    }

    impl MessageObserver for Patient {
        fn on_message(
            &mut self,
            header: &CommonHeader,
            body: Vec<u8>,
        ) -> Result<Option<Vec<u8>>, ProtocolError> {
            Ok(Some(encode_common(header.command(), &body)))
        }

        fn on_timeout(&mut self) -> bool {
            self.offered.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    #[test]
    fn test_declined_timeout_keeps_serving() {
        let config = ServerConfig {
            connection_timeout_seconds: 1,
            epoll_timeout_milliseconds: 50,
            ..ServerConfig::default()
        };
        let (tx, rx) = intake(8);
        let (worker, waker) = Worker::new(0, &config, rx).unwrap();
        let switchboard = Switchboard::new(vec![(tx, waker)]);
        let stats = Arc::new(ServerStats::new(IoCounters::shared()));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let (switchboard, stats, stop) = (switchboard.clone(), Arc::clone(&stats), Arc::clone(&stop));
            std::thread::spawn(move || worker.run(switchboard, stats, stop))
        };

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (stream, peer) = accepted(&listener);
        let offered = Arc::new(AtomicUsize::new(0));
        let handler = BuiltinPacketHandler::new(Patient {
            offered: Arc::clone(&offered),
        });
        let waiter = Waiter::new(stream, peer, Box::new(handler), Arc::clone(&stats.io));
        stats.connection_opened();
        assert!(switchboard
            .transfer(0, Takeover { waiter, interest: Interest::READABLE })
            .is_ok());

        let deadline = Instant::now() + Duration::from_secs(5);
        while offered.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(offered.load(Ordering::SeqCst) >= 1);

        // Past the deadline and still served
        let msg = encode_common(5, b"still here");
        client.write_all(&msg).unwrap();
        let mut reply = vec![0u8; msg.len()];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(reply, msg);
        assert_eq!(stats.timeouts(), 0);
        assert_eq!(stats.connections_active(), 1);

        stop.store(true, Ordering::Release);
        switchboard.wake_all();
        handle.join().unwrap().unwrap();
        assert_eq!(stats.connections_active(), 0);
    }

    #[test]
    fn test_full_pool_rejects_with_notification() {
        let config = ServerConfig {
            connection_pool_size: 1,
            ..ServerConfig::default()
        };
        let (tx, rx) = intake(8);
        let (mut worker, waker) = Worker::new(3, &config, rx).unwrap();
        let switchboard = Switchboard::new(vec![(tx, waker)]);
        let stats = ServerStats::new(IoCounters::shared());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed = Arc::new(AtomicUsize::new(0));
        let mut clients = Vec::new();
        for _ in 0..2 {
            clients.push(std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap());
            let (stream, peer) = accepted(&listener);
            let handler = BuiltinPacketHandler::new(Counting {
                closed: Arc::clone(&closed),
            });
            let waiter = Waiter::new(stream, peer, Box::new(handler), Arc::clone(&stats.io));
            stats.connection_opened();
            assert!(switchboard
                .transfer(0, Takeover { waiter, interest: Interest::READABLE })
                .is_ok());
        }

        worker.drain_intake(&stats);
        assert_eq!(worker.waiters.len(), 1);
        assert_eq!(stats.connections_rejected(), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(worker.waiters.values().all(|w| w.thread_index() == 3));

        worker.close_all(&stats);
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert_eq!(stats.connections_active(), 0);
    }

    #[test]
    fn test_tokens_skip_waker_and_live_entries() {
        let (_tx, rx) = intake(1);
        let (mut worker, _waker) = Worker::new(0, &ServerConfig::default(), rx).unwrap();
        worker.next_token = usize::MAX;
        assert_eq!(worker.allocate_token(), Token(1));
    }
}
