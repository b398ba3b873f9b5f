//! Thin `libc` wrappers for the message-oriented socket calls `socket2`
//! does not cover: `recvmsg`/`sendmsg` with an `IP_TOS` control message,
//! and batched `recvmmsg`/`sendmmsg`.

use std::io::{self, IoSlice, IoSliceMut};
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;
use std::ptr;

use libc::{c_int, c_void};
use transit_packet::clock;

use crate::backend::{RecvMsg, SendMsg};

const SOCKADDR_IN_LEN: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

/// Retry a syscall interrupted by a signal.
fn retry(mut f: impl FnMut() -> isize) -> io::Result<usize> {
    loop {
        let rc = f();
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub(crate) fn to_sockaddr(addr: &SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    sin
}

pub(crate) fn from_sockaddr(sin: &libc::sockaddr_in, len: libc::socklen_t) -> Option<SocketAddrV4> {
    if len < SOCKADDR_IN_LEN || c_int::from(sin.sin_family) != libc::AF_INET {
        return None;
    }
    Some(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    ))
}

/// Control buffer holding one `IP_TOS` message, aligned for `cmsghdr`.
struct TosControl {
    buf: [u64; 4],
}

impl TosControl {
    /// Attach a TOS control message to `msg`.
    fn attach(&mut self, msg: &mut libc::msghdr, tos: u8) {
        // SAFETY: buf is large enough and aligned for one cmsghdr carrying a
        // c_int; CMSG_FIRSTHDR is non-null once msg_controllen covers it.
        unsafe {
            let space = libc::CMSG_SPACE(mem::size_of::<c_int>() as u32) as usize;
            msg.msg_control = self.buf.as_mut_ptr() as *mut c_void;
            msg.msg_controllen = space as _;
            let cmsg = libc::CMSG_FIRSTHDR(msg);
            (*cmsg).cmsg_level = libc::IPPROTO_IP;
            (*cmsg).cmsg_type = libc::IP_TOS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<c_int>() as u32) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut c_int, c_int::from(tos));
        }
    }
}

/// Scatter read; returns the byte count and the sender address.
pub(crate) fn recv_msg(
    fd: RawFd,
    iov: &mut [IoSliceMut<'_>],
) -> io::Result<(usize, Option<SocketAddrV4>)> {
    // SAFETY: zeroed msghdr/sockaddr_in are valid; the pointers set below
    // outlive the call.
    let mut name: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut name as *mut _ as *mut c_void;
    msg.msg_namelen = SOCKADDR_IN_LEN;
    // IoSliceMut is ABI-compatible with iovec on unix.
    msg.msg_iov = iov.as_mut_ptr() as *mut libc::iovec;
    msg.msg_iovlen = iov.len() as _;

    let n = retry(|| unsafe { libc::recvmsg(fd, &mut msg, 0) as isize })?;
    Ok((n, from_sockaddr(&name, msg.msg_namelen)))
}

/// Gather write to `dest` (or the connected peer), optionally marking the
/// datagram with a TOS byte.
pub(crate) fn send_msg(
    fd: RawFd,
    iov: &[IoSlice<'_>],
    dest: Option<&SocketAddrV4>,
    tos: Option<u8>,
) -> io::Result<usize> {
    let mut name = dest.map(to_sockaddr);
    let mut control = TosControl { buf: [0; 4] };
    // SAFETY: as in recv_msg.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    if let Some(name) = name.as_mut() {
        msg.msg_name = name as *mut _ as *mut c_void;
        msg.msg_namelen = SOCKADDR_IN_LEN;
    }
    msg.msg_iov = iov.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = iov.len() as _;
    if let Some(tos) = tos {
        control.attach(&mut msg, tos);
    }
    retry(|| unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) as isize })
}

/// Receive up to `msgs.len()` datagrams in one call.
#[cfg(target_os = "linux")]
pub(crate) fn recv_mmsg(fd: RawFd, msgs: &mut [RecvMsg<'_, '_>]) -> io::Result<usize> {
    if msgs.is_empty() {
        return Ok(0);
    }
    // SAFETY: zeroed sockaddr_in/mmsghdr are valid.
    let mut names: Vec<libc::sockaddr_in> = vec![unsafe { mem::zeroed() }; msgs.len()];
    let mut hdrs: Vec<libc::mmsghdr> = msgs
        .iter_mut()
        .zip(names.iter_mut())
        .map(|(m, name)| {
            let mut hdr: libc::mmsghdr = unsafe { mem::zeroed() };
            hdr.msg_hdr.msg_name = name as *mut _ as *mut c_void;
            hdr.msg_hdr.msg_namelen = SOCKADDR_IN_LEN;
            hdr.msg_hdr.msg_iov = m.iov.as_mut_ptr() as *mut libc::iovec;
            hdr.msg_hdr.msg_iovlen = m.iov.len() as _;
            hdr
        })
        .collect();

    let n = retry(|| unsafe {
        libc::recvmmsg(fd, hdrs.as_mut_ptr(), hdrs.len() as _, 0, ptr::null_mut()) as isize
    })?;
    let ts = clock::now_us();
    for ((m, hdr), name) in msgs.iter_mut().zip(&hdrs).zip(&names).take(n) {
        m.len = hdr.msg_len as usize;
        m.addr = from_sockaddr(name, hdr.msg_hdr.msg_namelen);
        m.ts_us = ts;
    }
    Ok(n)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn recv_mmsg(fd: RawFd, msgs: &mut [RecvMsg<'_, '_>]) -> io::Result<usize> {
    let mut count = 0;
    for m in msgs.iter_mut() {
        match recv_msg(fd, m.iov) {
            Ok((len, addr)) => {
                m.len = len;
                m.addr = addr;
                m.ts_us = clock::now_us();
                count += 1;
            }
            Err(e) if count > 0 && e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(count)
}

/// Send up to `msgs.len()` datagrams in one call, all to `dest` (or the
/// connected peer).
#[cfg(target_os = "linux")]
pub(crate) fn send_mmsg(
    fd: RawFd,
    msgs: &mut [SendMsg<'_, '_>],
    dest: Option<&SocketAddrV4>,
) -> io::Result<usize> {
    if msgs.is_empty() {
        return Ok(0);
    }
    let mut name = dest.map(to_sockaddr);
    let name_ptr = name
        .as_mut()
        .map_or(ptr::null_mut(), |n| n as *mut _ as *mut c_void);
    let mut hdrs: Vec<libc::mmsghdr> = msgs
        .iter()
        .map(|m| {
            // SAFETY: zeroed mmsghdr is valid.
            let mut hdr: libc::mmsghdr = unsafe { mem::zeroed() };
            if !name_ptr.is_null() {
                hdr.msg_hdr.msg_name = name_ptr;
                hdr.msg_hdr.msg_namelen = SOCKADDR_IN_LEN;
            }
            hdr.msg_hdr.msg_iov = m.iov.as_ptr() as *mut libc::iovec;
            hdr.msg_hdr.msg_iovlen = m.iov.len() as _;
            hdr
        })
        .collect();

    let n = retry(|| unsafe {
        libc::sendmmsg(
            fd,
            hdrs.as_mut_ptr(),
            hdrs.len() as _,
            libc::MSG_NOSIGNAL as _,
        ) as isize
    })?;
    for (m, hdr) in msgs.iter_mut().zip(&hdrs).take(n) {
        m.len = hdr.msg_len as usize;
    }
    Ok(n)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn send_mmsg(
    fd: RawFd,
    msgs: &mut [SendMsg<'_, '_>],
    dest: Option<&SocketAddrV4>,
) -> io::Result<usize> {
    let mut count = 0;
    for m in msgs.iter_mut() {
        match send_msg(fd, m.iov, dest, None) {
            Ok(len) => {
                m.len = len;
                count += 1;
            }
            Err(e) if count > 0 && e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(count)
}

/// Dissolve a datagram socket's association with its peer.
pub(crate) fn disconnect(fd: RawFd) -> io::Result<()> {
    // SAFETY: zeroed sockaddr is valid; AF_UNSPEC asks the kernel to
    // disconnect.
    let mut sa: libc::sockaddr = unsafe { mem::zeroed() };
    sa.sa_family = libc::AF_UNSPEC as libc::sa_family_t;
    let rc = unsafe { libc::connect(fd, &sa, mem::size_of::<libc::sockaddr>() as libc::socklen_t) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        // BSDs disconnect but still report EAFNOSUPPORT.
        if err.raw_os_error() != Some(libc::EAFNOSUPPORT) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_conversion() {
        let addr: SocketAddrV4 = "192.168.1.20:5004".parse().unwrap();
        let sin = to_sockaddr(&addr);
        assert_eq!(from_sockaddr(&sin, SOCKADDR_IN_LEN), Some(addr));
        assert_eq!(from_sockaddr(&sin, 0), None);
    }
}
