use anyhow::Result;
use std::net::SocketAddr;

const MAX_UDP_SIZE: usize = 65536;

/// A thin wrapper around [`tokio::net::UdpSocket`] that owns its receive
/// buffer, so callers get back a borrowed slice instead of managing one.
pub struct UdpSocket {
    inner: tokio::net::UdpSocket,
    recv_buf: Box<[u8; MAX_UDP_SIZE]>,
}

impl UdpSocket {
    pub async fn bind(addr: impl Into<SocketAddr>) -> Result<Self> {
        Ok(Self {
            inner: tokio::net::UdpSocket::bind(addr.into()).await?,
            recv_buf: Box::new([0u8; MAX_UDP_SIZE]),
        })
    }

    pub async fn recv(&mut self) -> Result<(&[u8], SocketAddr)> {
        let (length, sender) = self.inner.recv_from(self.recv_buf.as_mut_slice()).await?;

        Ok((&self.recv_buf[..length], sender))
    }

    pub async fn send_to(&mut self, buf: &[u8], target: SocketAddr) -> Result<()> {
        self.inner.send_to(buf, target).await?;

        Ok(())
    }
}
