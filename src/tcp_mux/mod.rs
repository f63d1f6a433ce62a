
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use stun::attributes::ATTR_USERNAME;
use stun::message::{is_message as is_stun_message, Message as StunMessage};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use util::Conn;

use crate::error::*;
use crate::util::{read_two_byte_framed, write_two_byte_framed};

/// A shared, passive TCP listener demultiplexed by ICE username fragment, the TCP
/// analogue of [`crate::udp_mux::UDPMux`]. Host-over-TCP candidates are advertised on
/// the listener's single port; inbound connections are routed to the right ufrag by
/// reading the ICE username in the first STUN Binding request that arrives on them.
#[async_trait]
pub trait TcpMux {
    /// Closes the mux and every connection it has handed out.
    async fn close(&self) -> Result<()>;

    /// Gets (pre-registering if necessary) the virtual connection for `(ufrag,
    /// is_ipv6)`. The returned [`Conn`]'s `local_addr` is the listener's bound
    /// address; candidates built from it are of TCP type Passive.
    async fn get_conn_by_ufrag(
        self: Arc<Self>,
        ufrag: &str,
        is_ipv6: bool,
    ) -> Result<Arc<dyn Conn + Send + Sync>>;

    /// Removes the virtual connection for `ufrag`.
    async fn remove_conn_by_ufrag(&self, ufrag: &str);
}

fn ufrag_from_stun_message(buf: &[u8]) -> Option<String> {
    if !is_stun_message(buf) {
        return None;
    }
    let mut m = StunMessage::new();
    m.unmarshal_binary(buf).ok()?;
    let (attr, found) = m.attributes.get(ATTR_USERNAME);
    if !found {
        return None;
    }
    let s = String::from_utf8(attr.value).ok()?;
    s.split(':').next().map(|u| u.to_owned())
}

pub struct TcpMuxDefault {
    local_addr: SocketAddr,
    conns: Mutex<HashMap<(String, bool), Arc<TcpMuxConn>>>,
    closed: Mutex<bool>,
}

impl TcpMuxDefault {
    /// Spawns the accept loop over `listener` and returns the mux handle.
    pub fn new(listener: TcpListener) -> Result<Arc<Self>> {
        let local_addr = listener.local_addr()?;
        let mux = Arc::new(Self {
            local_addr,
            conns: Mutex::new(HashMap::new()),
            closed: Mutex::new(false),
        });

        let cloned = Arc::clone(&mux);
        tokio::spawn(async move {
            cloned.start_accept_worker(listener).await;
        });

        Ok(mux)
    }

    async fn start_accept_worker(self: Arc<Self>, listener: TcpListener) {
        loop {
            if *self.closed.lock().await {
                return;
            }

            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::warn!("tcp_mux: accept failed: {}", err);
                    continue;
                }
            };

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.handle_incoming(stream, peer_addr).await;
            });
        }
    }

    async fn handle_incoming(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let (mut rd, wr) = tokio::io::split(stream);

        let first_msg = match read_two_byte_framed(&mut rd).await {
            Ok(msg) => msg,
            Err(err) => {
                log::debug!("tcp_mux: dropping connection from {}: {}", peer_addr, err);
                return;
            }
        };

        let ufrag = match ufrag_from_stun_message(&first_msg) {
            Some(ufrag) => ufrag,
            None => {
                log::warn!(
                    "tcp_mux: first message from {} carried no ICE username, dropping",
                    peer_addr
                );
                return;
            }
        };

        let is_ipv6 = peer_addr.is_ipv6();
        let conn = {
            let mut conns = self.conns.lock().await;
            Arc::clone(
                conns
                    .entry((ufrag.clone(), is_ipv6))
                    .or_insert_with(|| TcpMuxConn::new(self.local_addr)),
            )
        };

        conn.register_stream(peer_addr, wr).await;
        conn.push_inbound(first_msg, peer_addr).await;
        conn.run_reader(rd, peer_addr).await;
    }
}

#[async_trait]
impl TcpMux for TcpMuxDefault {
    async fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Err(Error::ErrClosed);
        }
        *closed = true;

        let old_conns = {
            let mut conns = self.conns.lock().await;
            std::mem::take(&mut *conns)
        };
        for (_, conn) in old_conns {
            conn.close().await;
        }

        Ok(())
    }

    async fn get_conn_by_ufrag(
        self: Arc<Self>,
        ufrag: &str,
        is_ipv6: bool,
    ) -> Result<Arc<dyn Conn + Send + Sync>> {
        if *self.closed.lock().await {
            return Err(Error::ErrClosed);
        }

        let mut conns = self.conns.lock().await;
        let conn = Arc::clone(
            conns
                .entry((ufrag.to_owned(), is_ipv6))
                .or_insert_with(|| TcpMuxConn::new(self.local_addr)),
        );

        Ok(conn as Arc<dyn Conn + Send + Sync>)
    }

    async fn remove_conn_by_ufrag(&self, ufrag: &str) {
        let removed = {
            let mut conns = self.conns.lock().await;
            let keys: Vec<_> = conns
                .keys()
                .filter(|(u, _)| u == ufrag)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| conns.remove(&k))
                .collect::<Vec<_>>()
        };
        for conn in removed {
            conn.close().await;
        }
    }
}

/// One ufrag's worth of demultiplexed TCP traffic, possibly spread across several
/// physical connections (one per remote candidate pair that dialed in).
pub struct TcpMuxConn {
    local_addr: SocketAddr,
    writers: Mutex<HashMap<SocketAddr, WriteHalf<TcpStream>>>,
    inbound: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
    notify: Notify,
    closed: Mutex<bool>,
}

impl TcpMuxConn {
    fn new(local_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            local_addr,
            writers: Mutex::new(HashMap::new()),
            inbound: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: Mutex::new(false),
        })
    }

    async fn register_stream(&self, peer_addr: SocketAddr, wr: WriteHalf<TcpStream>) {
        self.writers.lock().await.insert(peer_addr, wr);
    }

    async fn push_inbound(&self, data: Vec<u8>, from: SocketAddr) {
        self.inbound.lock().await.push_back((data, from));
        self.notify.notify_one();
    }

    async fn run_reader(self: Arc<Self>, mut rd: ReadHalf<TcpStream>, peer_addr: SocketAddr) {
        loop {
            if *self.closed.lock().await {
                return;
            }
            match read_two_byte_framed(&mut rd).await {
                Ok(msg) => self.push_inbound(msg, peer_addr).await,
                Err(err) => {
                    log::debug!("tcp_mux: connection from {} closed: {}", peer_addr, err);
                    self.writers.lock().await.remove(&peer_addr);
                    return;
                }
            }
        }
    }

    async fn close(&self) {
        let mut closed = self.closed.lock().await;
        *closed = true;
        self.writers.lock().await.clear();
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Conn for TcpMuxConn {
    async fn connect(&self, _addr: SocketAddr) -> std::result::Result<(), util::Error> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "Not applicable").into())
    }

    async fn recv(&self, _buf: &mut [u8]) -> std::result::Result<usize, util::Error> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "Not applicable").into())
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> std::result::Result<(usize, SocketAddr), util::Error> {
        loop {
            {
                let mut inbound = self.inbound.lock().await;
                if let Some((data, from)) = inbound.pop_front() {
                    if data.len() > buf.len() {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "buffer too small",
                        )
                        .into());
                    }
                    buf[..data.len()].copy_from_slice(&data);
                    return Ok((data.len(), from));
                }
            }

            if *self.closed.lock().await {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "Conn is closed").into());
            }
            self.notify.notified().await;
        }
    }

    async fn send(&self, _buf: &[u8]) -> std::result::Result<usize, util::Error> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "Not applicable").into())
    }

    async fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> std::result::Result<usize, util::Error> {
        let mut writers = self.writers.lock().await;
        let wr = writers.get_mut(&target).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "no stream for target")
        })?;

        write_two_byte_framed(wr, buf)
            .await
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> std::result::Result<SocketAddr, util::Error> {
        Ok(self.local_addr)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn close(&self) -> std::result::Result<(), util::Error> {
        TcpMuxConn::close(self).await;
        Ok(())
    }

    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
        self
    }
}
