use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use util::Conn;

use crate::error::*;

/// Any duplex byte stream that can stand in for a TCP, TLS/DTLS or proxy-tunnelled
/// socket. Not `Sync`: TLS session types generally aren't, and every user of a boxed
/// stream serializes access through a [`Mutex`] anyway, which is `Sync` regardless of
/// whether the value it guards is.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Reads one length-prefixed STUN/TURN message from a stream transport.
///
/// Per RFC 6062 section 3 / RFC 6544 section 3, messages exchanged over a stream
/// transport are each preceded by a 2-octet length field so the STUN/TURN framing
/// that was designed for datagrams can be recovered from a byte stream.
pub async fn read_two_byte_framed<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes one length-prefixed STUN/TURN message to a stream transport. See
/// [`read_two_byte_framed`].
pub async fn write_two_byte_framed<S: AsyncWrite + Unpin>(stream: &mut S, buf: &[u8]) -> Result<()> {
    if buf.len() > u16::MAX as usize {
        return Err(Error::ErrSendPacket);
    }
    let len = (buf.len() as u16).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Presents a single-peer, length-framed byte stream (a plain TCP connection, a TLS
/// session, or a stream handed back by a caller-supplied proxy dialer) as a packet
/// oriented [`Conn`], so the rest of the gatherer and the TURN client never need to
/// know the relay transport isn't UDP.
///
/// `send_to`/`recv_from` ignore/synthesize the peer address since the underlying
/// stream already has exactly one fixed remote endpoint.
pub struct StreamFramedConn {
    stream: Mutex<Box<dyn AsyncStream>>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl StreamFramedConn {
    pub fn new(stream: Box<dyn AsyncStream>, local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            stream: Mutex::new(stream),
            local_addr,
            remote_addr,
        }
    }
}

#[async_trait]
impl Conn for StreamFramedConn {
    async fn connect(&self, _addr: SocketAddr) -> std::result::Result<(), util::Error> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "Not applicable").into())
    }

    async fn recv(&self, buf: &mut [u8]) -> std::result::Result<usize, util::Error> {
        let (n, _) = self.recv_from(buf).await?;
        Ok(n)
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> std::result::Result<(usize, SocketAddr), util::Error> {
        let mut stream = self.stream.lock().await;
        let msg = read_two_byte_framed(&mut *stream)
            .await
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;

        if msg.len() > buf.len() {
            return Err(
                std::io::Error::new(std::io::ErrorKind::Other, "buffer too small").into(),
            );
        }
        buf[..msg.len()].copy_from_slice(&msg);
        Ok((msg.len(), self.remote_addr))
    }

    async fn send(&self, buf: &[u8]) -> std::result::Result<usize, util::Error> {
        self.send_to(buf, self.remote_addr).await
    }

    async fn send_to(
        &self,
        buf: &[u8],
        _target: SocketAddr,
    ) -> std::result::Result<usize, util::Error> {
        let mut stream = self.stream.lock().await;
        write_two_byte_framed(&mut *stream, buf)
            .await
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> std::result::Result<SocketAddr, util::Error> {
        Ok(self.local_addr)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }

    async fn close(&self) -> std::result::Result<(), util::Error> {
        let mut stream = self.stream.lock().await;
        let _ = stream.shutdown().await;
        Ok(())
    }

    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
        self
    }
}
