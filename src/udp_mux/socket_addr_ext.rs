use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Upper bound on the space reserved for an encoded [`SocketAddr`] in
/// [`super::UDPMuxConn`]'s packet buffer. The actual encoding only ever uses
/// 7 (IPv4) or 19 (IPv6) bytes; the rest is slack.
pub(crate) const MAX_ADDR_SIZE: usize = 27;

const TAG_V4: u8 = 4;
const TAG_V6: u8 = 6;

/// Encodes and decodes a [`SocketAddr`] to/from the wire format used to tag
/// packets that travel through [`super::UDPMuxConn`]'s internal channel:
/// `| tag(1) | ip bytes(4 or 16) | port(2) |`.
pub(crate) trait SocketAddrExt: Sized {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, io::Error>;
    fn decode(buf: &[u8]) -> Result<Self, io::Error>;
}

impl SocketAddrExt for SocketAddr {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, io::Error> {
        match self {
            SocketAddr::V4(addr) => {
                if buf.len() < 7 {
                    return Err(io::Error::new(io::ErrorKind::Other, "buffer too small"));
                }
                buf[0] = TAG_V4;
                buf[1..5].copy_from_slice(&addr.ip().octets());
                buf[5..7].copy_from_slice(&addr.port().to_be_bytes());
                Ok(7)
            }
            SocketAddr::V6(addr) => {
                if buf.len() < 19 {
                    return Err(io::Error::new(io::ErrorKind::Other, "buffer too small"));
                }
                buf[0] = TAG_V6;
                buf[1..17].copy_from_slice(&addr.ip().octets());
                buf[17..19].copy_from_slice(&addr.port().to_be_bytes());
                Ok(19)
            }
        }
    }

    fn decode(buf: &[u8]) -> Result<SocketAddr, io::Error> {
        if buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::Other, "empty address buffer"));
        }

        match buf[0] {
            TAG_V4 => {
                if buf.len() < 7 {
                    return Err(io::Error::new(io::ErrorKind::Other, "short ipv4 address"));
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok(SocketAddr::new(IpAddr::V4(ip), port))
            }
            TAG_V6 => {
                if buf.len() < 19 {
                    return Err(io::Error::new(io::ErrorKind::Other, "short ipv6 address"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok(SocketAddr::new(IpAddr::V6(ip), port))
            }
            tag => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("unknown address tag: {tag}"),
            )),
        }
    }
}
