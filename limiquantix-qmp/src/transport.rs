//! File descriptor passing over the monitor socket.
//!
//! QEMU picks up descriptors sent as SCM_RIGHTS ancillary data together with
//! the `getfd` / `add-fd` command that names them. The descriptor must ride
//! on the same `sendmsg` call as the first byte of the command line.

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use std::io::{self, IoSlice};
use std::os::fd::{AsRawFd, RawFd};
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::unix::OwnedWriteHalf;
use tracing::trace;

/// Write `data` to the socket with `fd` attached.
///
/// The kernel duplicates the descriptor into the receiving process; the
/// caller keeps its own copy.
pub async fn send_with_fd(writer: &mut OwnedWriteHalf, data: &[u8], fd: RawFd) -> io::Result<()> {
    let sent = {
        let stream = writer.as_ref();
        let sock_fd = stream.as_raw_fd();
        let fds = [fd];

        loop {
            stream.writable().await?;

            let result = stream.try_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(data)];
                let cmsg = [ControlMessage::ScmRights(&fds)];
                sendmsg::<()>(sock_fd, &iov, &cmsg, MsgFlags::empty(), None).map_err(io::Error::from)
            });

            match result {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    };

    trace!(fd, sent, total = data.len(), "sent command with descriptor");

    // The descriptor went out with the first chunk; finish the line normally.
    if sent < data.len() {
        writer.write_all(&data[sent..]).await?;
    }
    writer.flush().await
}
