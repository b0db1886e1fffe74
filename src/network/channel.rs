//! Raw non-blocking socket I/O
//!
//! Every primitive here makes exactly one attempt per call (retrying only on
//! `EINTR`) and never waits for readiness: would-block is a normal result,
//! not an error. Waiting is the event loop's job.
//!
//! The `*_fully` variants loop until the whole request moved or the socket
//! stops making progress, and report how far they got.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use super::stats::IoCounters;
use crate::error::ChannelError;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Read(usize),
    WouldBlock,
    /// Peer performed an orderly shutdown
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(usize),
    WouldBlock,
}

/// Progress of a `*_fully` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drained {
    /// Bytes moved by this call
    pub moved: usize,
    /// `true` when the whole request moved
    pub complete: bool,
    /// `true` when the peer closed the stream (read side only)
    pub closed: bool,
}

type SyscallResult = Result<Option<usize>, ChannelError>;

/// Run `op` until it does not fail with `EINTR`.
///
/// `Ok(None)` means would-block.
#[inline(always)]
fn retry_syscall(syscall: &'static str, mut op: impl FnMut() -> isize) -> SyscallResult {
    loop {
        let ret = op();
        if ret >= 0 {
            return Ok(Some(ret as usize));
        }
        let err = ChannelError::last_os_error(syscall);
        match err.errno() {
            libc::EINTR => continue,
            libc::EAGAIN => return Ok(None),
            #[allow(unreachable_patterns)]
            libc::EWOULDBLOCK => return Ok(None),
            _ => return Err(err),
        }
    }
}

/// Non-owning I/O handle over a connected socket descriptor
#[derive(Debug, Clone)]
pub struct DataChannel {
    fd: RawFd,
    counters: Arc<IoCounters>,
}

impl DataChannel {
    pub fn new(fd: RawFd, counters: Arc<IoCounters>) -> Self {
        Self { fd, counters }
    }

    /// Point the channel at another descriptor
    pub fn attach(&mut self, fd: RawFd) {
        self.fd = fd;
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn counters(&self) -> &Arc<IoCounters> {
        &self.counters
    }

    /// One `recv` attempt
    pub fn try_read(&self, buf: &mut [u8]) -> Result<ReadOutcome, ChannelError> {
        if buf.is_empty() {
            return Err(ChannelError::EmptyBuffer { syscall: "recv" });
        }

        // SAFETY: buf is a valid writable region of buf.len() bytes
        let ret = retry_syscall("recv", || unsafe {
            libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        })?;

        Ok(match ret {
            None => ReadOutcome::WouldBlock,
            Some(0) => ReadOutcome::Closed,
            Some(n) => {
                self.counters.add_recv_buffer(n);
                ReadOutcome::Read(n)
            }
        })
    }

    /// One `send` attempt
    pub fn try_write(&self, buf: &[u8]) -> Result<WriteOutcome, ChannelError> {
        if buf.is_empty() {
            return Err(ChannelError::EmptyBuffer { syscall: "send" });
        }

        // SAFETY: buf is a valid readable region of buf.len() bytes
        let ret = retry_syscall("send", || unsafe {
            libc::send(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                SEND_FLAGS,
            )
        })?;

        Ok(match ret {
            None | Some(0) => WriteOutcome::WouldBlock,
            Some(n) => {
                self.counters.add_send_buffer(n);
                WriteOutcome::Written(n)
            }
        })
    }

    /// Read until `buf` is full, the peer closes, or the socket would block
    pub fn read_fully(&self, buf: &mut [u8]) -> Result<Drained, ChannelError> {
        let mut moved = 0;
        while moved < buf.len() {
            match self.try_read(&mut buf[moved..])? {
                ReadOutcome::Read(n) => moved += n,
                ReadOutcome::WouldBlock => {
                    return Ok(Drained {
                        moved,
                        complete: false,
                        closed: false,
                    })
                }
                ReadOutcome::Closed => {
                    return Ok(Drained {
                        moved,
                        complete: false,
                        closed: true,
                    })
                }
            }
        }
        Ok(Drained {
            moved,
            complete: true,
            closed: false,
        })
    }

    /// Write until all of `buf` is sent or the socket would block
    pub fn write_fully(&self, buf: &[u8]) -> Result<Drained, ChannelError> {
        let mut moved = 0;
        while moved < buf.len() {
            match self.try_write(&buf[moved..])? {
                WriteOutcome::Written(n) => moved += n,
                WriteOutcome::WouldBlock => {
                    return Ok(Drained {
                        moved,
                        complete: false,
                        closed: false,
                    })
                }
            }
        }
        Ok(Drained {
            moved,
            complete: true,
            closed: false,
        })
    }

    /// One zero-copy transfer of up to `count` bytes of `file_fd`
    /// starting at `*offset`; `*offset` advances by the bytes sent.
    #[cfg(target_os = "linux")]
    pub fn send_file(
        &self,
        file_fd: RawFd,
        offset: &mut u64,
        count: usize,
    ) -> Result<WriteOutcome, ChannelError> {
        if count == 0 {
            return Err(ChannelError::EmptyBuffer { syscall: "sendfile" });
        }

        let mut off = *offset as libc::off_t;
        // SAFETY: off is a valid off_t owned by this frame
        let ret = retry_syscall("sendfile", || unsafe {
            libc::sendfile(self.fd, file_fd, &mut off, count)
        })?;

        Ok(match ret {
            None => WriteOutcome::WouldBlock,
            Some(0) => return Err(ChannelError::FileEnded { offset: *offset }),
            Some(n) => {
                *offset = off as u64;
                self.counters.add_send_file(n);
                WriteOutcome::Written(n)
            }
        })
    }

    /// Portable fallback: `pread` into a bounce buffer, then `send`
    #[cfg(not(target_os = "linux"))]
    pub fn send_file(
        &self,
        file_fd: RawFd,
        offset: &mut u64,
        count: usize,
    ) -> Result<WriteOutcome, ChannelError> {
        if count == 0 {
            return Err(ChannelError::EmptyBuffer { syscall: "sendfile" });
        }

        let mut bounce = vec![0u8; count.min(64 * 1024)];
        // SAFETY: bounce is a valid writable region
        let got = retry_syscall("pread", || unsafe {
            libc::pread(
                file_fd,
                bounce.as_mut_ptr() as *mut libc::c_void,
                bounce.len(),
                *offset as libc::off_t,
            )
        })?
        .unwrap_or(0);
        if got == 0 {
            return Err(ChannelError::FileEnded { offset: *offset });
        }

        // SAFETY: bounce[..got] is initialised
        let ret = retry_syscall("send", || unsafe {
            libc::send(
                self.fd,
                bounce.as_ptr() as *const libc::c_void,
                got,
                SEND_FLAGS,
            )
        })?;

        Ok(match ret {
            None | Some(0) => WriteOutcome::WouldBlock,
            Some(n) => {
                *offset += n as u64;
                self.counters.add_send_file(n);
                WriteOutcome::Written(n)
            }
        })
    }

    /// Send `count` bytes of a file or stop at would-block
    pub fn send_file_fully(
        &self,
        file_fd: RawFd,
        offset: &mut u64,
        count: usize,
    ) -> Result<Drained, ChannelError> {
        let mut moved = 0;
        while moved < count {
            match self.send_file(file_fd, offset, count - moved)? {
                WriteOutcome::Written(n) => moved += n,
                WriteOutcome::WouldBlock => {
                    return Ok(Drained {
                        moved,
                        complete: false,
                        closed: false,
                    })
                }
            }
        }
        Ok(Drained {
            moved,
            complete: true,
            closed: false,
        })
    }

    /// One scatter read over `bufs`
    pub fn readv(&self, bufs: &mut [&mut [u8]]) -> Result<ReadOutcome, ChannelError> {
        let iov: Vec<libc::iovec> = bufs
            .iter_mut()
            .map(|b| libc::iovec {
                iov_base: b.as_mut_ptr() as *mut libc::c_void,
                iov_len: b.len(),
            })
            .collect();
        if iov.iter().all(|v| v.iov_len == 0) {
            return Err(ChannelError::EmptyBuffer { syscall: "readv" });
        }

        // SAFETY: every iovec points into a live, exclusively borrowed slice
        let ret = retry_syscall("readv", || unsafe {
            libc::readv(self.fd, iov.as_ptr(), iov.len() as libc::c_int)
        })?;

        Ok(match ret {
            None => ReadOutcome::WouldBlock,
            Some(0) => ReadOutcome::Closed,
            Some(n) => {
                self.counters.add_recv_buffer(n);
                ReadOutcome::Read(n)
            }
        })
    }

    /// One gather write of `bufs`, e.g. a header and a body kept apart
    pub fn writev(&self, bufs: &[&[u8]]) -> Result<WriteOutcome, ChannelError> {
        let iov: Vec<libc::iovec> = bufs
            .iter()
            .map(|b| libc::iovec {
                iov_base: b.as_ptr() as *mut libc::c_void,
                iov_len: b.len(),
            })
            .collect();
        if iov.iter().all(|v| v.iov_len == 0) {
            return Err(ChannelError::EmptyBuffer { syscall: "writev" });
        }

        // SAFETY: every iovec points into a live slice; writev only reads
        let ret = retry_syscall("writev", || unsafe {
            libc::writev(self.fd, iov.as_ptr(), iov.len() as libc::c_int)
        })?;

        Ok(match ret {
            None | Some(0) => WriteOutcome::WouldBlock,
            Some(n) => {
                self.counters.add_send_buffer(n);
                WriteOutcome::Written(n)
            }
        })
    }

    /// Gather-write all of `bufs` or stop at would-block
    pub fn writev_fully(&self, bufs: &[&[u8]]) -> Result<Drained, ChannelError> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut moved = 0;

        while moved < total {
            let pending = remaining_slices(bufs, moved);
            match self.writev(&pending)? {
                WriteOutcome::Written(n) => moved += n,
                WriteOutcome::WouldBlock => {
                    return Ok(Drained {
                        moved,
                        complete: false,
                        closed: false,
                    })
                }
            }
        }
        Ok(Drained {
            moved,
            complete: true,
            closed: false,
        })
    }
}

/// The parts of `bufs` not yet covered by the first `skip` bytes
fn remaining_slices<'a>(bufs: &[&'a [u8]], mut skip: usize) -> Vec<&'a [u8]> {
    let mut out = Vec::with_capacity(bufs.len());
    for b in bufs {
        if skip >= b.len() {
            skip -= b.len();
            continue;
        }
        out.push(&b[skip..]);
        skip = 0;
    }
    out
}

/// Toggle `TCP_CORK` so a file is sent in full segments
#[cfg(target_os = "linux")]
pub fn set_cork(fd: RawFd, on: bool) -> Result<(), ChannelError> {
    let value: libc::c_int = on as libc::c_int;
    // SAFETY: value outlives the call and the length matches its type
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(ChannelError::last_os_error("setsockopt"));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_cork(_fd: RawFd, _on: bool) -> Result<(), ChannelError> {
    Ok(())
}
