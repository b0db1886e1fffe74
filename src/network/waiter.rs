//! One live connection: socket, handler and the read/send phases
//!
//! A `Waiter` is owned by exactly one worker at a time. Hand-off moves the
//! whole value (socket, handler and both contexts) to the next owner.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, error, trace, warn};

use super::channel::{set_cork, DataChannel, ReadOutcome, WriteOutcome};
use super::stats::IoCounters;
use crate::error::{ChannelError, SwitchFailure};
use crate::handler::{Indicator, PacketHandler, RequestResult, ResponseBody, ResponseResult};

/// What the owning worker should do with the connection next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    /// Stay on this thread and wait for `Interest`
    Rearm(Interest),
    /// Move to another worker
    Handover { thread_index: u16, interest: Interest },
    /// Close, notifying the handler with `on_closed`
    Close,
    /// Close without further callbacks
    Abort,
}

/// Result of one phase
enum Step {
    /// Switch phase right away
    Ready(Interest),
    Done(Next),
}

pub(crate) struct Waiter {
    stream: TcpStream,
    peer: SocketAddr,
    handler: Box<dyn PacketHandler>,
    channel: DataChannel,
    thread_index: u16,
    interest: Interest,
    sending: bool,
    last_active: Instant,
}

impl Waiter {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        handler: Box<dyn PacketHandler>,
        counters: Arc<IoCounters>,
    ) -> Self {
        let channel = DataChannel::new(stream.as_raw_fd(), counters);
        Self {
            stream,
            peer,
            handler,
            channel,
            thread_index: 0,
            interest: Interest::READABLE,
            sending: false,
            last_active: Instant::now(),
        }
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn thread_index(&self) -> u16 {
        self.thread_index
    }

    pub(crate) fn set_thread_index(&mut self, thread_index: u16) {
        self.thread_index = thread_index;
    }

    pub(crate) fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub(crate) fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_active) >= timeout
    }

    pub(crate) fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        registry.register(&mut self.stream, token, interest)?;
        self.interest = interest;
        Ok(())
    }

    pub(crate) fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        if interest != self.interest {
            registry.reregister(&mut self.stream, token, interest)?;
            self.interest = interest;
        }
        Ok(())
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    /// Handle one readiness event
    pub(crate) fn on_event(&mut self, event: &Event) -> Next {
        self.touch();

        if event.is_error() {
            debug!(peer = %self.peer, "socket error");
            return Next::Close;
        }
        if event.is_read_closed() && event.is_write_closed() {
            debug!(peer = %self.peer, "hang up");
            return Next::Close;
        }
        if event.is_writable() && self.sending {
            return self.on_ready(Interest::WRITABLE);
        }
        if event.is_readable() {
            return self.on_ready(Interest::READABLE);
        }
        if event.is_writable() {
            return self.on_ready(Interest::WRITABLE);
        }
        Next::Rearm(self.interest)
    }

    /// Run read and send phases until one has to wait
    pub(crate) fn on_ready(&mut self, mut ready: Interest) -> Next {
        loop {
            let step = if ready.is_readable() {
                self.receive()
            } else {
                self.send()
            };
            match step {
                Step::Ready(interest) => ready = interest,
                Step::Done(next) => return next,
            }
        }
    }

    fn receive(&mut self) -> Step {
        loop {
            let request = self.handler.request_context_mut();
            if request.is_full() {
                error!(peer = %self.peer, ?request, "no room left in request buffer");
                return Step::Done(Next::Close);
            }

            let received = match self.channel.try_read(request.spare_mut()) {
                Ok(ReadOutcome::Read(n)) => n,
                Ok(ReadOutcome::WouldBlock) => return Step::Done(Next::Rearm(Interest::READABLE)),
                Ok(ReadOutcome::Closed) => {
                    debug!(peer = %self.peer, "closed by peer");
                    return Step::Done(Next::Close);
                }
                Err(err) => return self.io_failed(err),
            };

            let mut indicator = Indicator::for_request(self.thread_index);
            let result = self.handler.handle_request(received, &mut indicator);
            trace!(peer = %self.peer, received, ?result, "request handled");
            if indicator.reset {
                self.reset();
            }

            match result {
                RequestResult::NeedMoreData => continue,
                RequestResult::ReadyToRespond => return Step::Ready(Interest::WRITABLE),
                RequestResult::HandoffRequested => return self.release(indicator),
                RequestResult::Fatal => {
                    debug!(peer = %self.peer, "request rejected");
                    return Step::Done(Next::Close);
                }
            }
        }
    }

    fn send(&mut self) -> Step {
        if !self.sending {
            self.sending = true;
            self.handler.before_response();
        }

        loop {
            let response = self.handler.response_context();
            let (size, offset) = (response.size(), response.offset());
            if offset > size {
                warn!(peer = %self.peer, ?response, "response offset past its size");
                break;
            }
            if offset == size {
                break;
            }

            let written = match response.body() {
                ResponseBody::Buffer(_) => self.channel.try_write(response.unsent()),
                ResponseBody::File(file) => self.send_file(file.as_raw_fd(), offset, size - offset),
                ResponseBody::Empty => {
                    error!(peer = %self.peer, ?response, "response has a size but no body");
                    return Step::Done(Next::Close);
                }
            };

            match written {
                Ok(WriteOutcome::Written(n)) => self.handler.move_response_offset(n),
                Ok(WriteOutcome::WouldBlock) => {
                    return Step::Done(Next::Rearm(Interest::WRITABLE))
                }
                Err(err) => return self.io_failed(err),
            }
        }

        self.sending = false;
        let mut indicator = Indicator::for_response(self.thread_index);
        let result = self.handler.response_completed(&mut indicator);
        trace!(peer = %self.peer, ?result, "response completed");
        if indicator.reset {
            self.reset();
        }

        match result {
            ResponseResult::KeepAlive => Step::Ready(indicator.interest),
            ResponseResult::HandoffRequested => self.release(indicator),
            ResponseResult::CloseConnection => {
                debug!(peer = %self.peer, "closing after response");
                Step::Done(Next::Close)
            }
        }
    }

    fn send_file(
        &self,
        file_fd: RawFd,
        offset: usize,
        count: usize,
    ) -> Result<WriteOutcome, ChannelError> {
        let fd = self.channel.fd();
        set_cork(fd, true)?;
        let mut file_offset = offset as u64;
        let sent = self.channel.send_file(file_fd, &mut file_offset, count);
        set_cork(fd, false)?;
        sent
    }

    /// Hand-off to the current thread only switches phase
    fn release(&self, indicator: Indicator) -> Step {
        if indicator.thread_index == self.thread_index {
            return Step::Ready(indicator.interest);
        }
        Step::Done(Next::Handover {
            thread_index: indicator.thread_index,
            interest: indicator.interest,
        })
    }

    fn io_failed(&mut self, err: ChannelError) -> Step {
        error!(peer = %self.peer, error = %err, "connection i/o failed");
        self.handler.on_io_error(&err);
        Step::Done(Next::Abort)
    }

    fn reset(&mut self) {
        self.sending = false;
        self.handler.reset();
    }

    /// `true` closes the connection
    pub(crate) fn on_timeout(&mut self) -> bool {
        self.handler.on_timeout()
    }

    /// Tear down, notifying the handler
    pub(crate) fn close(mut self) {
        debug!(peer = %self.peer, thread = self.thread_index, "connection closed");
        self.handler.on_closed();
    }

    /// A hand-off (or initial placement) could not be delivered
    pub(crate) fn switch_failed(mut self, reason: SwitchFailure) {
        self.handler.on_switch_failure(reason);
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{RequestContext, ResponseContext};
    use crate::protocol::{encode_common, CommonHeader};
    use crate::handler::{BuiltinPacketHandler, MessageObserver};
    use crate::error::ProtocolError;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn connected() -> (TcpStream, SocketAddr, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), peer, client)
    }

    /// Drive until `done` holds or the peer stops talking
    fn drive(waiter: &mut Waiter, mut done: impl FnMut(Next) -> bool) -> Next {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let next = waiter.on_ready(Interest::READABLE);
            if done(next) || Instant::now() > deadline {
                return next;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    struct Echo;

    impl MessageObserver for Echo {
        fn on_message(
            &mut self,
            header: &CommonHeader,
            body: Vec<u8>,
        ) -> Result<Option<Vec<u8>>, ProtocolError> {
            Ok(Some(encode_common(header.command(), &body)))
        }
    }

    #[test]
    fn test_framed_echo_round_trip() {
        let (stream, peer, mut client) = connected();
        let mut waiter = Waiter::new(
            stream,
            peer,
            Box::new(BuiltinPacketHandler::new(Echo)),
            IoCounters::shared(),
        );

        let msg = encode_common(7, b"hello world");
        client.write_all(&msg).unwrap();

        let mut reply = vec![0u8; msg.len()];
        let mut got = 0;
        drive(&mut waiter, |_| {
            client.set_nonblocking(true).unwrap();
            if let Ok(n) = client.read(&mut reply[got..]) {
                got += n;
            }
            got == msg.len()
        });
        assert_eq!(reply, msg);
        assert_eq!(waiter.channel.counters().recv_buffer_bytes(), msg.len() as u64);
    }

    #[test]
    fn test_peer_close_closes() {
        let (stream, peer, client) = connected();
        let mut waiter = Waiter::new(
            stream,
            peer,
            Box::new(BuiltinPacketHandler::new(Echo)),
            IoCounters::shared(),
        );
        drop(client);
        assert_eq!(drive(&mut waiter, |n| n == Next::Close), Next::Close);
    }

    type Events = Arc<Mutex<Vec<String>>>;

    /// Fixed-size requests, answered from a file, then hands off
    struct FileResponder {
        request: RequestContext,
        response: ResponseContext,
        path: std::path::PathBuf,
        range: (usize, usize),
        before: Arc<AtomicUsize>,
        target: u16,
        events: Events,
    }

    impl FileResponder {
        fn new(path: &std::path::Path, range: (usize, usize), target: u16) -> Self {
            Self {
                request: RequestContext::with_size(3),
                response: ResponseContext::new(),
                path: path.to_path_buf(),
                range,
                before: Arc::new(AtomicUsize::new(0)),
                target,
                events: Events::default(),
            }
        }
    }

    impl PacketHandler for FileResponder {
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
            self.request.advance(received);
            if !self.request.is_full() {
                return RequestResult::NeedMoreData;
            }
            let file = std::fs::File::open(&self.path).unwrap();
            self.response.set_file(file, self.range.0, self.range.1);
            RequestResult::ReadyToRespond
        }

        fn before_response(&mut self) {
            self.before.fetch_add(1, Ordering::SeqCst);
        }

        fn response_completed(&mut self, indicator: &mut Indicator) -> ResponseResult {
            indicator.thread_index = self.target;
            ResponseResult::HandoffRequested
        }

        fn reset(&mut self) {
            self.request.rewind();
            self.response.reset();
        }

        fn on_closed(&mut self) {
            self.events.lock().unwrap().push("closed".to_owned());
        }

        fn on_io_error(&mut self, err: &ChannelError) {
            self.events.lock().unwrap().push(format!("io_error:{}", err.syscall()));
        }
    }

    #[test]
    fn test_file_response_then_handoff() {
        let path = std::env::temp_dir().join(format!("mooon_waiter_{}.dat", std::process::id()));
        std::fs::write(&path, b"abcdefgh").unwrap();

        let (stream, peer, mut client) = connected();
        let handler = FileResponder::new(&path, (1, 4), 2);
        let before = Arc::clone(&handler.before);
        let counters = IoCounters::shared();
        let mut waiter = Waiter::new(stream, peer, Box::new(handler), Arc::clone(&counters));

        client.write_all(b"get").unwrap();
        let next = drive(&mut waiter, |n| matches!(n, Next::Handover { .. }));
        assert_eq!(
            next,
            Next::Handover {
                thread_index: 2,
                interest: Interest::READABLE
            }
        );

        let mut got = [0u8; 4];
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"bcde");
        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(counters.send_file_bytes(), 4);
        assert!(waiter.handler.response_context().is_empty());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_file_shorter_than_response_is_io_error() {
        let path = std::env::temp_dir().join(format!("mooon_short_waiter_{}.dat", std::process::id()));
        std::fs::write(&path, b"abcdefgh").unwrap();

        let (stream, peer, mut client) = connected();
        let handler = FileResponder::new(&path, (0, 100), 0);
        let events = Arc::clone(&handler.events);
        let mut waiter = Waiter::new(stream, peer, Box::new(handler), IoCounters::shared());

        client.write_all(b"get").unwrap();
        assert_eq!(drive(&mut waiter, |n| n == Next::Abort), Next::Abort);
        drop(waiter);

        let mut got = [0u8; 8];
        client.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"abcdefgh");
        assert_eq!(*events.lock().unwrap(), vec!["io_error:sendfile".to_owned()]);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_reset_by_peer_is_io_error_without_close() {
        let (stream, peer, client) = connected();
        let handler = FileResponder::new(std::path::Path::new("/dev/null"), (0, 1), 0);
        let events = Arc::clone(&handler.events);
        let mut waiter = Waiter::new(stream, peer, Box::new(handler), IoCounters::shared());

        // Linger of zero turns close into a reset
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        // SAFETY: linger outlives the call and the size matches
        let ret = unsafe {
            libc::setsockopt(
                client.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const libc::linger as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            )
        };
        assert_eq!(ret, 0);
        drop(client);
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(waiter.on_ready(Interest::READABLE), Next::Abort);
        drop(waiter);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with("io_error:"));
        assert!(!events.contains(&"closed".to_owned()));
    }

    #[test]
    fn test_release_to_same_thread_switches_phase() {
        let (stream, peer, _client) = connected();
        let mut waiter = Waiter::new(
            stream,
            peer,
            Box::new(BuiltinPacketHandler::new(Echo)),
            IoCounters::shared(),
        );
        waiter.set_thread_index(1);
        let mut indicator = Indicator::for_response(1);
        indicator.interest = Interest::WRITABLE;
        assert!(matches!(waiter.release(indicator), Step::Ready(i) if i == Interest::WRITABLE));

        indicator.thread_index = 4;
        assert!(matches!(
            waiter.release(indicator),
            Step::Done(Next::Handover { thread_index: 4, .. })
        ));
    }

    #[test]
    fn test_idle_detection() {
        let (stream, peer, _client) = connected();
        let waiter = Waiter::new(
            stream,
            peer,
            Box::new(BuiltinPacketHandler::new(Echo)),
            IoCounters::shared(),
        );
        let now = Instant::now();
        assert!(!waiter.is_idle(now, Duration::from_secs(10)));
        assert!(waiter.is_idle(now + Duration::from_secs(11), Duration::from_secs(10)));
    }
}
