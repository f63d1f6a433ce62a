use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stun::xoraddr::XorMappedAddress;
use tokio::sync::Mutex;
use util::Conn;

use super::{UDPMux, UDPMuxDefault};
use crate::util::get_xormapped_addr;

/// A collaborator analogous to [`UDPMux`], but scoped to server-reflexive gathering:
/// it multiplexes STUN Binding probes for every URL over a single local socket per
/// ufrag, and remembers the resulting mapped address so repeated restarts don't
/// re-probe the server.
#[async_trait]
pub trait UDPMuxSrflx: UDPMux {
    /// Gets (creating if necessary) the muxed connection for `ufrag`, performs a STUN
    /// Binding transaction against `server_addr` over it, and returns the mapped
    /// address. Subsequent calls for the same `ufrag` return the cached result.
    async fn get_xor_mapped_addr(
        self: Arc<Self>,
        ufrag: &str,
        server_addr: SocketAddr,
        deadline: Duration,
    ) -> crate::error::Result<XorMappedAddress>;
}

pub struct UDPMuxSrflxDefault {
    udp_mux: Arc<UDPMuxDefault>,
    mapped_addrs: Mutex<HashMap<String, (IpAddr, u16)>>,
}

impl UDPMuxSrflxDefault {
    pub fn new(udp_mux: Arc<UDPMuxDefault>) -> Arc<Self> {
        Arc::new(Self {
            udp_mux,
            mapped_addrs: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl UDPMux for UDPMuxSrflxDefault {
    async fn close(&self) -> Result<(), util::Error> {
        self.udp_mux.close().await
    }

    async fn get_conn(
        self: Arc<Self>,
        ufrag: &str,
    ) -> Result<Arc<dyn Conn + Send + Sync>, util::Error> {
        Arc::clone(&self.udp_mux).get_conn(ufrag).await
    }

    async fn remove_conn_by_ufrag(&self, ufrag: &str) {
        self.udp_mux.remove_conn_by_ufrag(ufrag).await;
        self.mapped_addrs.lock().await.remove(ufrag);
    }
}

#[async_trait]
impl UDPMuxSrflx for UDPMuxSrflxDefault {
    async fn get_xor_mapped_addr(
        self: Arc<Self>,
        ufrag: &str,
        server_addr: SocketAddr,
        deadline: Duration,
    ) -> crate::error::Result<XorMappedAddress> {
        {
            let cached = self.mapped_addrs.lock().await;
            if let Some((ip, port)) = cached.get(ufrag) {
                return Ok(XorMappedAddress {
                    ip: *ip,
                    port: *port,
                });
            }
        }

        let conn = Arc::clone(&self.udp_mux).get_conn(ufrag).await?;
        let xoraddr = get_xormapped_addr(&conn, server_addr, deadline).await?;

        self.mapped_addrs
            .lock()
            .await
            .insert(ufrag.to_owned(), (xoraddr.ip, xoraddr.port));

        Ok(xoraddr)
    }
}
