//! Outbound connection establishment
//!
//! The resolver never opens stream connections for TCP Fast Open upstreams
//! itself; it hands the address and the first payload to a [`Dialer`]. A
//! camouflage layer can plug in its own dialer to shape the handshake, while
//! [`DirectDialer`] simply connects.

use crate::hints::HintFlags;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpSocket;

/// Byte stream returned by a [`Dialer`]
pub trait DialedStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DialedStream for T {}

pub type BoxedStream = Box<dyn DialedStream>;

/// Transport hints passed along with a dial request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialHints {
    pub hint: HintFlags,
    /// Hop limit for packets a camouflage dialer injects, 0 for none
    pub ttl: u8,
}

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr` and send `first_data` as the opening payload
    async fn dial(
        &self,
        addr: SocketAddr,
        hints: DialHints,
        first_data: &[u8],
    ) -> io::Result<BoxedStream>;
}

/// Plain TCP dialer, with TCP Fast Open on Linux when hinted
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(
        &self,
        addr: SocketAddr,
        hints: DialHints,
        first_data: &[u8],
    ) -> io::Result<BoxedStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if hints.hint.contains(HintFlags::TFO) {
            enable_fastopen_connect(&socket);
        }

        let mut stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        if !first_data.is_empty() {
            // with TCP_FASTOPEN_CONNECT the kernel puts this write in the SYN
            stream.write_all(first_data).await?;
        }
        log::debug!("Dialed {} ({})", addr, hints.hint);
        Ok(Box::new(stream))
    }
}

#[cfg(target_os = "linux")]
fn enable_fastopen_connect(socket: &TcpSocket) {
    use std::os::unix::io::AsRawFd;

    let fd = socket.as_raw_fd();
    let optval: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN_CONNECT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of_val(&optval) as libc::socklen_t,
        )
    };
    if ret != 0 {
        log::debug!(
            "TCP_FASTOPEN_CONNECT unavailable, using a regular handshake: {}",
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn enable_fastopen_connect(_socket: &TcpSocket) {}
