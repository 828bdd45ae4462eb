//! SCM_RIGHTS descriptor transfer over the RPC socket.
//!
//! Each transfer carries a short textual payload (the command that
//! announced it) so the receiver can confirm sender and receiver agree on
//! what the descriptor is for. Kernels consume the payload byte count
//! whether or not a descriptor actually arrives, which is what makes the
//! placeholder-write trick in the client possible.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg,
};

use crate::{Error, Result};

/// Send one descriptor with the given payload.
pub fn send_fd(stream: &UnixStream, fd: BorrowedFd<'_>, payload: &[u8]) -> Result<()> {
    let fds = [fd.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(payload)];
    loop {
        match sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None) {
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(Error::Os(e)),
            Ok(_) => return Ok(()),
        }
    }
}

/// Receive one descriptor, insisting the payload matches `expected`.
pub fn recv_fd(stream: &UnixStream, expected: &[u8]) -> Result<OwnedFd> {
    let mut buf = vec![0u8; expected.len().max(1)];
    let mut cmsg_space = nix::cmsg_space!([std::os::fd::RawFd; 1]);
    let mut iov = [IoSliceMut::new(&mut buf)];
    let msg = loop {
        match recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::empty(),
        ) {
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(Error::Os(e)),
            Ok(msg) => break msg,
        }
    };

    let mut received = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            received = fds
                .first()
                .map(|&fd| unsafe { OwnedFd::from_raw_fd(fd) });
        }
    }

    let n = msg.bytes;
    let payload = buf.get(..n).unwrap_or_default();
    if payload != expected {
        return Err(Error::Protocol(format!(
            "descriptor payload mismatch: {:?}",
            String::from_utf8_lossy(payload)
        )));
    }
    received.ok_or_else(|| Error::Protocol(String::from("no descriptor attached")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, Write};
    use std::os::fd::AsFd;

    #[test]
    fn fd_roundtrip() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"through the wormhole").unwrap();
        file.rewind().unwrap();

        send_fd(&a, file.as_fd(), b"PROC SIN").unwrap();
        let received = recv_fd(&b, b"PROC SIN").unwrap();

        let mut out = String::new();
        std::fs::File::from(received).read_to_string(&mut out).unwrap();
        assert_eq!(out, "through the wormhole");
    }

    #[test]
    fn payload_mismatch_rejected() {
        let (a, b) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        send_fd(&a, file.as_fd(), b"PROC SIN").unwrap();
        assert!(recv_fd(&b, b"PROC SOUT").is_err());
    }

    #[test]
    fn placeholder_without_fd_rejected() {
        let (mut a, b) = UnixStream::pair().unwrap();
        // a plain write of the right length, no control message
        a.write_all(b"PROC SIN").unwrap();
        assert!(recv_fd(&b, b"PROC SIN").is_err());
    }
}
