//! Passing an open file descriptor between processes over a `UNIX` socket
//! pair (spec §4.8, "acceptor pool").
//!
//! None of the example repos in this pack depend on `mio`/`nix`/`polling`,
//! so rather than pull in a new dependency for one `sendmsg`/`recvmsg` pair,
//! this calls the same handful of `libc` functions the pack already uses
//! elsewhere for low-level POSIX plumbing (`catenacyber-libhtp-rs` links
//! `libc` directly for this kind of C-interop work). The wire format is the
//! standard `SCM_RIGHTS` ancillary message: one dummy data byte plus a
//! control message carrying the descriptor.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Creates a connected pair of `UNIX` domain sockets suitable for FD passing
/// between a forked parent and child.
pub fn socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Sends `fd` across `channel`, preceded by one marker byte.
pub fn send_fd(channel: &OwnedFd, fd: RawFd) -> io::Result<()> {
    let marker = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: marker.as_ptr() as *mut libc::c_void,
        iov_len: marker.len(),
    };

    let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize };
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::new(io::ErrorKind::Other, "no room for SCM_RIGHTS cmsg"));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        std::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
    }

    let rc = unsafe { libc::sendmsg(channel.as_raw_fd(), &msg, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receives one file descriptor sent by [`send_fd`] over `channel`.
pub fn recv_fd(channel: &OwnedFd) -> io::Result<OwnedFd> {
    let mut marker = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: marker.as_mut_ptr() as *mut libc::c_void,
        iov_len: marker.len(),
    };

    let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize };
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    let rc = unsafe { libc::recvmsg(channel.as_raw_fd(), &mut msg, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(io::Error::new(io::ErrorKind::Other, "no SCM_RIGHTS cmsg received"));
        }
        let fd = std::ptr::read(libc::CMSG_DATA(cmsg) as *const RawFd);
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

/// Forks the current process. `Ok(Some(pid))` in the parent, `Ok(None)` in
/// the child.
///
/// # Safety
/// Caller must uphold the usual `fork(2)` constraints: avoid taking locks
/// across the fork that the child might need (Rust's allocator and most std
/// types are fork-safe as long as no other thread holds a lock at fork time,
/// so this is only safe to call before spawning worker threads).
pub unsafe fn fork() -> io::Result<Option<libc::pid_t>> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid == 0 {
        Ok(None)
    } else {
        Ok(Some(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::fd::IntoRawFd;

    #[test]
    fn passes_a_listening_socket_fd_across_a_socketpair() {
        let (a, b) = socketpair().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let raw = listener.into_raw_fd();

        send_fd(&a, raw).unwrap();
        let received = recv_fd(&b).unwrap();

        // The duplicate descriptor refers to the same listening socket: a
        // connection to the original address should be acceptable on it.
        let listener2 = unsafe { std::net::TcpListener::from_raw_fd(received.as_raw_fd()) };
        let addr = listener2.local_addr().unwrap();
        let _client = std::net::TcpStream::connect(addr).unwrap();
        listener2.accept().unwrap();

        unsafe { libc::close(raw) };
    }
}
