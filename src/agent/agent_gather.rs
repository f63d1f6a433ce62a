use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use util::vnet::net::*;
use util::Conn;
use waitgroup::WaitGroup;

use super::*;
use crate::candidate::candidate_base::CandidateBaseConfig;
use crate::candidate::candidate_host::CandidateHostConfig;
use crate::candidate::candidate_relay::CandidateRelayConfig;
use crate::candidate::candidate_server_reflexive::CandidateServerReflexiveConfig;
use crate::candidate::*;
use crate::error::*;
use crate::network_type::*;
use crate::udp_network::UDPNetwork;
use crate::url::{ProtoType, SchemeType, Url};
use crate::util::*;

const STUN_GATHER_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct GatherCandidatesInternalParams {
    pub(crate) udp_network: UDPNetwork,
    pub(crate) candidate_types: Vec<CandidateType>,
    pub(crate) urls: Vec<Url>,
    pub(crate) network_types: Vec<NetworkType>,
    pub(crate) mdns_mode: MulticastDnsMode,
    pub(crate) mdns_name: String,
    pub(crate) net: Arc<Net>,
    pub(crate) interface_filter: Arc<Option<InterfaceFilterFn>>,
    pub(crate) ip_filter: Arc<Option<IpFilterFn>>,
    pub(crate) ext_ip_mapper: Arc<Option<ExternalIpMapper>>,
    pub(crate) agent_internal: Arc<AgentInternal>,
    pub(crate) gathering_state: Arc<AtomicU8>,
    pub(crate) chan_candidate_tx: ChanCandidateTx,
    pub(crate) include_loopback: bool,
    pub(crate) tcp_mux: Option<Arc<dyn TcpMux + Send + Sync>>,
    pub(crate) udp_mux_srflx: Option<Arc<dyn UDPMuxSrflx + Send + Sync>>,
    pub(crate) proxy_dialer: Option<Arc<dyn ProxyDialer + Send + Sync>>,
    /// Cancels every strategy spawned by this particular gathering session. A fresh
    /// call to `gather_candidates` cancels and replaces this before its own strategies
    /// start, so at most one session's worth of in-flight STUN/TURN transactions ever
    /// run concurrently.
    pub(crate) cancel: CancellationToken,
}

struct GatherCandidatesLocalParams {
    udp_network: UDPNetwork,
    network_types: Vec<NetworkType>,
    mdns_mode: MulticastDnsMode,
    mdns_name: String,
    interface_filter: Arc<Option<InterfaceFilterFn>>,
    ip_filter: Arc<Option<IpFilterFn>>,
    ext_ip_mapper: Arc<Option<ExternalIpMapper>>,
    net: Arc<Net>,
    agent_internal: Arc<AgentInternal>,
    include_loopback: bool,
    tcp_mux: Option<Arc<dyn TcpMux + Send + Sync>>,
}

struct GatherCandidatesLocalUDPMuxParams {
    network_types: Vec<NetworkType>,
    interface_filter: Arc<Option<InterfaceFilterFn>>,
    ip_filter: Arc<Option<IpFilterFn>>,
    ext_ip_mapper: Arc<Option<ExternalIpMapper>>,
    net: Arc<Net>,
    agent_internal: Arc<AgentInternal>,
    udp_mux: Arc<dyn UDPMux + Send + Sync>,
    include_loopback: bool,
}

struct GatherCandidatesSrflxMappedParasm {
    network_types: Vec<NetworkType>,
    port_max: u16,
    port_min: u16,
    ext_ip_mapper: Arc<Option<ExternalIpMapper>>,
    net: Arc<Net>,
    agent_internal: Arc<AgentInternal>,
}

struct GatherCandidatesSrflxParams {
    urls: Vec<Url>,
    network_types: Vec<NetworkType>,
    port_max: u16,
    port_min: u16,
    net: Arc<Net>,
    agent_internal: Arc<AgentInternal>,
    cancel: CancellationToken,
}

struct GatherCandidatesSrflxUDPMuxParams {
    urls: Vec<Url>,
    network_types: Vec<NetworkType>,
    net: Arc<Net>,
    agent_internal: Arc<AgentInternal>,
    udp_mux_srflx: Arc<dyn UDPMuxSrflx + Send + Sync>,
    cancel: CancellationToken,
}

pub(crate) struct GatherCandidatesRelayParams {
    pub(crate) urls: Vec<Url>,
    pub(crate) net: Arc<Net>,
    pub(crate) agent_internal: Arc<AgentInternal>,
    pub(crate) proxy_dialer: Option<Arc<dyn ProxyDialer + Send + Sync>>,
}

impl Agent {
    pub(crate) async fn gather_candidates_internal(params: GatherCandidatesInternalParams) {
        Self::set_gathering_state(
            &params.chan_candidate_tx,
            &params.gathering_state,
            GatheringState::Gathering,
        )
        .await;

        let wg = WaitGroup::new();

        for t in &params.candidate_types {
            match t {
                CandidateType::Host => {
                    let local_params = GatherCandidatesLocalParams {
                        udp_network: params.udp_network.clone(),
                        network_types: params.network_types.clone(),
                        mdns_mode: params.mdns_mode,
                        mdns_name: params.mdns_name.clone(),
                        interface_filter: Arc::clone(&params.interface_filter),
                        ip_filter: Arc::clone(&params.ip_filter),
                        ext_ip_mapper: Arc::clone(&params.ext_ip_mapper),
                        net: Arc::clone(&params.net),
                        agent_internal: Arc::clone(&params.agent_internal),
                        include_loopback: params.include_loopback,
                        tcp_mux: params.tcp_mux.clone(),
                    };

                    let w = wg.worker();
                    tokio::spawn(async move {
                        let _d = w;

                        Self::gather_candidates_local(local_params).await;
                    });
                }
                CandidateType::ServerReflexive => match &params.udp_network {
                    UDPNetwork::Ephemeral(ephemeral_config) => {
                        let srflx_params = GatherCandidatesSrflxParams {
                            urls: params.urls.clone(),
                            network_types: params.network_types.clone(),
                            port_max: ephemeral_config.port_max(),
                            port_min: ephemeral_config.port_min(),
                            net: Arc::clone(&params.net),
                            agent_internal: Arc::clone(&params.agent_internal),
                            cancel: params.cancel.clone(),
                        };
                        let w1 = wg.worker();
                        tokio::spawn(async move {
                            let _d = w1;

                            Self::gather_candidates_srflx(srflx_params).await;
                        });
                        if let Some(ext_ip_mapper) = &*params.ext_ip_mapper {
                            if ext_ip_mapper.candidate_type == CandidateType::ServerReflexive {
                                let srflx_mapped_params = GatherCandidatesSrflxMappedParasm {
                                    network_types: params.network_types.clone(),
                                    port_max: ephemeral_config.port_max(),
                                    port_min: ephemeral_config.port_min(),
                                    ext_ip_mapper: Arc::clone(&params.ext_ip_mapper),
                                    net: Arc::clone(&params.net),
                                    agent_internal: Arc::clone(&params.agent_internal),
                                };
                                let w2 = wg.worker();
                                tokio::spawn(async move {
                                    let _d = w2;

                                    Self::gather_candidates_srflx_mapped(srflx_mapped_params)
                                        .await;
                                });
                            }
                        }
                    }
                    UDPNetwork::Muxed(_) => {
                        if let Some(udp_mux_srflx) = params.udp_mux_srflx.clone() {
                            let srflx_mux_params = GatherCandidatesSrflxUDPMuxParams {
                                urls: params.urls.clone(),
                                network_types: params.network_types.clone(),
                                net: Arc::clone(&params.net),
                                agent_internal: Arc::clone(&params.agent_internal),
                                udp_mux_srflx,
                                cancel: params.cancel.clone(),
                            };
                            let w = wg.worker();
                            tokio::spawn(async move {
                                let _d = w;

                                Self::gather_candidates_srflx_udp_mux(srflx_mux_params).await;
                            });
                        }
                    }
                },
                CandidateType::Relay => {
                    let relay_params = GatherCandidatesRelayParams {
                        urls: params.urls.clone(),
                        net: Arc::clone(&params.net),
                        agent_internal: Arc::clone(&params.agent_internal),
                        proxy_dialer: params.proxy_dialer.clone(),
                    };
                    let w = wg.worker();
                    tokio::spawn(async move {
                        let _d = w;

                        Self::gather_candidates_relay(relay_params).await;
                    });
                }
                _ => {}
            }
        }

        // Block until all STUN and TURN URLs have been gathered (or timed out)
        wg.wait().await;

        Self::set_gathering_state(
            &params.chan_candidate_tx,
            &params.gathering_state,
            GatheringState::Complete,
        )
        .await;
    }

    async fn set_gathering_state(
        chan_candidate_tx: &ChanCandidateTx,
        gathering_state: &Arc<AtomicU8>,
        new_state: GatheringState,
    ) {
        if GatheringState::from(gathering_state.load(Ordering::SeqCst)) != new_state
            && new_state == GatheringState::Complete
        {
            let cand_tx = chan_candidate_tx.lock().await;
            if let Some(tx) = &*cand_tx {
                let _ = tx.send(None).await;
            }
        }

        gathering_state.store(new_state as u8, Ordering::SeqCst);
    }

    async fn gather_candidates_local(params: GatherCandidatesLocalParams) {
        let GatherCandidatesLocalParams {
            udp_network,
            network_types,
            mdns_mode,
            mdns_name,
            interface_filter,
            ip_filter,
            ext_ip_mapper,
            net,
            agent_internal,
            include_loopback,
            tcp_mux,
        } = params;

        let any_tcp_requested = network_types.iter().any(|n| n.is_tcp());

        // If we wanna use UDP mux, do so for the UDP half of the candidate set; the
        // mux strategy only produces UDP host candidates, so TCP (if requested) is
        // still gathered below via `tcp_mux` before returning (SPEC_FULL §4.2 step 1
        // removes only `udp` from the set of transports to gather here).
        if let UDPNetwork::Muxed(udp_mux) = udp_network {
            let result = Self::gather_candidates_local_udp_mux(GatherCandidatesLocalUDPMuxParams {
                network_types: network_types.clone(),
                interface_filter: Arc::clone(&interface_filter),
                ip_filter: Arc::clone(&ip_filter),
                ext_ip_mapper: Arc::clone(&ext_ip_mapper),
                net: Arc::clone(&net),
                agent_internal: Arc::clone(&agent_internal),
                udp_mux,
                include_loopback,
            })
            .await;

            if let Err(err) = result {
                log::error!("Failed to gather local candidates using UDP mux: {}", err);
            }

            if any_tcp_requested {
                if let Some(tcp_mux) = &tcp_mux {
                    let ips = local_interfaces(
                        &net,
                        &interface_filter,
                        &ip_filter,
                        &network_types,
                        include_loopback,
                    )
                    .await;

                    let local_ufrag = {
                        let ufrag_pwd = agent_internal.ufrag_pwd.lock().await;
                        ufrag_pwd.local_ufrag.clone()
                    };

                    for ip in ips {
                        let address = Self::host_candidate_address(
                            &agent_internal,
                            ip,
                            mdns_mode,
                            &mdns_name,
                            &ext_ip_mapper,
                        );

                        Self::gather_local_host_tcp_for_ip(
                            &agent_internal,
                            tcp_mux,
                            &local_ufrag,
                            address,
                            mdns_mode,
                            &ip,
                        )
                        .await;
                    }
                }
            }

            return;
        }

        let ips = local_interfaces(
            &net,
            &interface_filter,
            &ip_filter,
            &network_types,
            include_loopback,
        )
        .await;

        let local_ufrag = {
            let ufrag_pwd = agent_internal.ufrag_pwd.lock().await;
            ufrag_pwd.local_ufrag.clone()
        };

        for ip in ips {
            let address = Self::host_candidate_address(
                &agent_internal,
                ip,
                mdns_mode,
                &mdns_name,
                &ext_ip_mapper,
            );

            if any_tcp_requested {
                if let Some(tcp_mux) = &tcp_mux {
                    Self::gather_local_host_tcp_for_ip(
                        &agent_internal,
                        tcp_mux,
                        &local_ufrag,
                        address.clone(),
                        mdns_mode,
                        &ip,
                    )
                    .await;
                }
            }

            if let UDPNetwork::Ephemeral(ephemeral_config) = &udp_network {
                let conn: Arc<dyn Conn + Send + Sync> = match listen_udp_in_port_range(
                    &net,
                    ephemeral_config.port_max(),
                    ephemeral_config.port_min(),
                    SocketAddr::new(ip, 0),
                )
                .await
                {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::warn!(
                            "[{}]: could not listen {} {}: {}",
                            agent_internal.get_name(),
                            UDP,
                            ip,
                            err
                        );
                        continue;
                    }
                };

                Self::create_local_host_candidate(
                    &agent_internal,
                    UDP.to_owned(),
                    address.clone(),
                    conn,
                    TcpType::Unspecified,
                    mdns_mode,
                    &ip,
                )
                .await;
            }
        }
    }

    /// Computes the address string a host candidate for `ip` should advertise: the
    /// mDNS name in `queryAndGather` mode, else `ip` translated through the 1:1 NAT
    /// mapper (falling back to `ip` itself on translation failure), else `ip` as-is.
    /// Shared by the UDP-mux and per-IP host gathering paths so both transports
    /// advertise the same address for the same interface.
    fn host_candidate_address(
        agent_internal: &Arc<AgentInternal>,
        ip: IpAddr,
        mdns_mode: MulticastDnsMode,
        mdns_name: &str,
        ext_ip_mapper: &Option<ExternalIpMapper>,
    ) -> String {
        let mut mapped_ip = ip;

        if mdns_mode != MulticastDnsMode::QueryAndGather {
            if let Some(ext_ip_mapper2) = ext_ip_mapper {
                if ext_ip_mapper2.candidate_type == CandidateType::Host {
                    if let Ok(mi) = ext_ip_mapper2.find_external_ip(&ip.to_string()) {
                        mapped_ip = mi;
                    } else {
                        log::warn!(
                            "[{}]: 1:1 NAT mapping is enabled but no external IP is found for {}",
                            agent_internal.get_name(),
                            ip
                        );
                    }
                }
            }
        }

        if mdns_mode == MulticastDnsMode::QueryAndGather {
            mdns_name.to_owned()
        } else {
            mapped_ip.to_string()
        }
    }

    /// Gets a passive TCP connection for `ip`'s family from `tcp_mux` and, on
    /// success, builds and registers a host candidate from it. Shared by the
    /// UDP-mux host path (which has no UDP-bound candidates of its own to loop
    /// over) and the per-IP Ephemeral host path.
    async fn gather_local_host_tcp_for_ip(
        agent_internal: &Arc<AgentInternal>,
        tcp_mux: &Arc<dyn TcpMux + Send + Sync>,
        local_ufrag: &str,
        address: String,
        mdns_mode: MulticastDnsMode,
        ip: &IpAddr,
    ) {
        match Arc::clone(tcp_mux)
            .get_conn_by_ufrag(local_ufrag, ip.is_ipv6())
            .await
        {
            Ok(conn) => {
                Self::create_local_host_candidate(
                    agent_internal,
                    TCP.to_owned(),
                    address,
                    conn,
                    TcpType::Passive,
                    mdns_mode,
                    ip,
                )
                .await;
            }
            Err(Error::ErrTcpMuxNotInitialized) => {
                // No TCP mux configured; silently fall through to UDP only.
            }
            Err(err) => {
                log::warn!(
                    "[{}]: error getting tcp conn by ufrag: {} {} {}: {}",
                    agent_internal.get_name(),
                    TCP,
                    ip,
                    local_ufrag,
                    err
                );
            }
        }
    }

    /// Builds and registers a host candidate on `conn`, sharing the failure-handling
    /// and mDNS-rewrite logic needed by both the UDP and TCP host paths.
    async fn create_local_host_candidate(
        agent_internal: &Arc<AgentInternal>,
        network: String,
        address: String,
        conn: Arc<dyn Conn + Send + Sync>,
        tcp_type: TcpType,
        mdns_mode: MulticastDnsMode,
        ip: &IpAddr,
    ) {
        let port = match conn.local_addr() {
            Ok(addr) => addr.port(),
            Err(err) => {
                log::warn!(
                    "[{}]: could not get local addr: {}",
                    agent_internal.get_name(),
                    err
                );
                return;
            }
        };

        let host_config = CandidateHostConfig {
            base_config: CandidateBaseConfig {
                network: network.clone(),
                address,
                port,
                component: COMPONENT_RTP,
                conn: Some(conn),
                ..CandidateBaseConfig::default()
            },
            tcp_type,
        };

        let candidate: Arc<dyn Candidate + Send + Sync> = match host_config.new_candidate_host() {
            Ok(candidate) => {
                if mdns_mode == MulticastDnsMode::QueryAndGather {
                    if let Err(err) = candidate.set_ip(ip) {
                        log::warn!(
                            "[{}]: Failed to create host candidate: {} {} {}: {:?}",
                            agent_internal.get_name(),
                            network,
                            ip,
                            port,
                            err
                        );
                        return;
                    }
                }
                Arc::new(candidate)
            }
            Err(err) => {
                log::warn!(
                    "[{}]: Failed to create host candidate: {} {} {}: {}",
                    agent_internal.get_name(),
                    network,
                    ip,
                    port,
                    err
                );
                return;
            }
        };

        if let Err(err) = agent_internal.add_candidate(&candidate).await {
            if let Err(close_err) = candidate.close().await {
                log::warn!(
                    "[{}]: Failed to close candidate: {}",
                    agent_internal.get_name(),
                    close_err
                );
            }
            log::warn!(
                "[{}]: Failed to append to localCandidates and run onCandidateHdlr: {}",
                agent_internal.get_name(),
                err
            );
        }
    }

    async fn gather_candidates_local_udp_mux(
        params: GatherCandidatesLocalUDPMuxParams,
    ) -> Result<()> {
        let GatherCandidatesLocalUDPMuxParams {
            network_types,
            interface_filter,
            ip_filter,
            ext_ip_mapper,
            net,
            agent_internal,
            udp_mux,
            include_loopback,
        } = params;

        // Filter out non UDP network types
        let relevant_network_types: Vec<_> =
            network_types.into_iter().filter(|n| n.is_udp()).collect();

        let udp_mux = Arc::clone(&udp_mux);

        let local_ips = local_interfaces(
            &net,
            &interface_filter,
            &ip_filter,
            &relevant_network_types,
            include_loopback,
        )
        .await;

        let candidate_ips: Vec<std::net::IpAddr> = ext_ip_mapper
            .as_ref() // Arc
            .as_ref() // Option
            .and_then(|mapper| {
                if mapper.candidate_type != CandidateType::Host {
                    return None;
                }

                Some(
                    local_ips
                        .iter()
                        .filter_map(|ip| match mapper.find_external_ip(&ip.to_string()) {
                            Ok(ip) => Some(ip),
                            Err(err) => {
                                log::warn!(
                            "1:1 NAT mapping is enabled but not external IP is found for {}: {}",
                            ip,
                            err
                        );
                                None
                            }
                        })
                        .collect(),
                )
            })
            .unwrap_or_else(|| local_ips.iter().copied().collect());

        if candidate_ips.is_empty() {
            return Err(Error::ErrCandidateIpNotFound);
        }

        let ufrag = {
            let ufrag_pwd = agent_internal.ufrag_pwd.lock().await;

            ufrag_pwd.local_ufrag.clone()
        };

        let conn = udp_mux.get_conn(&ufrag).await?;
        let port = conn.local_addr()?.port();

        for candidate_ip in candidate_ips {
            let host_config = CandidateHostConfig {
                base_config: CandidateBaseConfig {
                    network: UDP.to_owned(),
                    address: candidate_ip.to_string(),
                    port,
                    conn: Some(conn.clone()),
                    component: COMPONENT_RTP,
                    ..Default::default()
                },
                tcp_type: TcpType::Unspecified,
            };

            let candidate: Arc<dyn Candidate + Send + Sync> =
                Arc::new(host_config.new_candidate_host()?);

            agent_internal.add_candidate(&candidate).await?;
        }

        Ok(())
    }

    async fn gather_candidates_srflx_mapped(params: GatherCandidatesSrflxMappedParasm) {
        let GatherCandidatesSrflxMappedParasm {
            network_types,
            port_max,
            port_min,
            ext_ip_mapper,
            net,
            agent_internal,
        } = params;

        let wg = WaitGroup::new();

        for network_type in network_types {
            if network_type.is_tcp() {
                continue;
            }

            let network = network_type.to_string();
            let net2 = Arc::clone(&net);
            let agent_internal2 = Arc::clone(&agent_internal);
            let ext_ip_mapper2 = Arc::clone(&ext_ip_mapper);

            let w = wg.worker();
            tokio::spawn(async move {
                let _d = w;

                let conn: Arc<dyn Conn + Send + Sync> = match listen_udp_in_port_range(
                    &net2,
                    port_max,
                    port_min,
                    if network_type.is_ipv4() {
                        SocketAddr::new(Ipv4Addr::new(0, 0, 0, 0).into(), 0)
                    } else {
                        SocketAddr::new(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0).into(), 0)
                    },
                )
                .await
                {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::warn!(
                            "[{}]: Failed to listen {}: {}",
                            agent_internal2.get_name(),
                            network,
                            err
                        );
                        return Ok(());
                    }
                };

                let laddr = conn.local_addr()?;
                let mapped_ip = {
                    if let Some(ext_ip_mapper3) = &*ext_ip_mapper2 {
                        match ext_ip_mapper3.find_external_ip(&laddr.ip().to_string()) {
                            Ok(ip) => ip,
                            Err(err) => {
                                log::warn!(
                                    "[{}]: 1:1 NAT mapping is enabled but no external IP is found for {}: {}",
                                    agent_internal2.get_name(),
                                    laddr,
                                    err
                                );
                                return Ok(());
                            }
                        }
                    } else {
                        log::error!(
                            "[{}]: ext_ip_mapper is None in gather_candidates_srflx_mapped",
                            agent_internal2.get_name(),
                        );
                        return Ok(());
                    }
                };

                let srflx_config = CandidateServerReflexiveConfig {
                    base_config: CandidateBaseConfig {
                        network: network.clone(),
                        address: mapped_ip.to_string(),
                        port: laddr.port(),
                        component: COMPONENT_RTP,
                        conn: Some(conn),
                        ..CandidateBaseConfig::default()
                    },
                    rel_addr: laddr.ip().to_string(),
                    rel_port: laddr.port(),
                };

                let candidate: Arc<dyn Candidate + Send + Sync> =
                    match srflx_config.new_candidate_server_reflexive() {
                        Ok(candidate) => Arc::new(candidate),
                        Err(err) => {
                            log::warn!(
                                "[{}]: Failed to create server reflexive candidate: {} {} {}: {}",
                                agent_internal2.get_name(),
                                network,
                                mapped_ip,
                                laddr.port(),
                                err
                            );
                            return Ok(());
                        }
                    };

                {
                    if let Err(err) = agent_internal2.add_candidate(&candidate).await {
                        if let Err(close_err) = candidate.close().await {
                            log::warn!(
                                "[{}]: Failed to close candidate: {}",
                                agent_internal2.get_name(),
                                close_err
                            );
                        }
                        log::warn!(
                            "[{}]: Failed to append to localCandidates and run onCandidateHdlr: {}",
                            agent_internal2.get_name(),
                            err
                        );
                    }
                }

                Result::<()>::Ok(())
            });
        }

        wg.wait().await;
    }

    /// Races a STUN Binding transaction on `conn` against the session-cancel and
    /// agent-close signals, closing `conn` the moment either fires. Since the
    /// transaction has no other way to be interrupted mid-flight, closing the socket
    /// is what unblocks the pending `recv_from`. The watchdog task is aborted once the
    /// transaction itself finishes (successfully or not) so it never outlives its
    /// caller.
    async fn stun_request_with_cancel(
        conn: Arc<dyn Conn + Send + Sync>,
        server_addr: SocketAddr,
        agent_internal: &Arc<AgentInternal>,
        cancel: &CancellationToken,
    ) -> Result<stun::xoraddr::XorMappedAddress> {
        let watch_conn = Arc::clone(&conn);
        let watch_cancel = cancel.clone();
        let watch_closed = agent_internal.closed_cancel.clone();
        let watchdog = tokio::spawn(async move {
            tokio::select! {
                _ = watch_cancel.cancelled() => {}
                _ = watch_closed.cancelled() => {}
            }
            let _ = watch_conn.close().await;
        });

        let result = get_xormapped_addr(&conn, server_addr, STUN_GATHER_TIMEOUT).await;
        watchdog.abort();
        result
    }

    async fn gather_candidates_srflx(params: GatherCandidatesSrflxParams) {
        let GatherCandidatesSrflxParams {
            urls,
            network_types,
            port_max,
            port_min,
            net,
            agent_internal,
            cancel,
        } = params;

        let wg = WaitGroup::new();
        for network_type in network_types {
            if network_type.is_tcp() {
                continue;
            }

            for url in &urls {
                let network = network_type.to_string();
                let is_ipv4 = network_type.is_ipv4();
                let url = url.clone();
                let net2 = Arc::clone(&net);
                let agent_internal2 = Arc::clone(&agent_internal);
                let cancel2 = cancel.clone();

                let w = wg.worker();
                tokio::spawn(async move {
                    let _d = w;

                    let host_port = format!("{}:{}", url.host, url.port);
                    let server_addr = match net2.resolve_addr(is_ipv4, &host_port).await {
                        Ok(addr) => addr,
                        Err(err) => {
                            log::warn!(
                                "[{}]: failed to resolve stun host: {}: {}",
                                agent_internal2.get_name(),
                                host_port,
                                err
                            );
                            return Ok(());
                        }
                    };

                    let conn: Arc<dyn Conn + Send + Sync> = match listen_udp_in_port_range(
                        &net2,
                        port_max,
                        port_min,
                        if is_ipv4 {
                            SocketAddr::new(Ipv4Addr::new(0, 0, 0, 0).into(), 0)
                        } else {
                            SocketAddr::new(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0).into(), 0)
                        },
                    )
                    .await
                    {
                        Ok(conn) => conn,
                        Err(err) => {
                            log::warn!(
                                "[{}]: Failed to listen for {}: {}",
                                agent_internal2.get_name(),
                                server_addr,
                                err
                            );
                            return Ok(());
                        }
                    };

                    let laddr = conn.local_addr()?;

                    let xoraddr = match Self::stun_request_with_cancel(
                        Arc::clone(&conn),
                        server_addr,
                        &agent_internal2,
                        &cancel2,
                    )
                    .await
                    {
                        Ok(xoraddr) => xoraddr,
                        Err(err) => {
                            log::warn!(
                                "[{}]: could not get server reflexive address {} {}: {}",
                                agent_internal2.get_name(),
                                network,
                                url,
                                err
                            );
                            return Ok(());
                        }
                    };

                    let (ip, port) = (xoraddr.ip, xoraddr.port);

                    let srflx_config = CandidateServerReflexiveConfig {
                        base_config: CandidateBaseConfig {
                            network: network.clone(),
                            address: ip.to_string(),
                            port,
                            component: COMPONENT_RTP,
                            conn: Some(conn),
                            ..CandidateBaseConfig::default()
                        },
                        rel_addr: laddr.ip().to_string(),
                        rel_port: laddr.port(),
                    };

                    let candidate: Arc<dyn Candidate + Send + Sync> =
                        match srflx_config.new_candidate_server_reflexive() {
                            Ok(candidate) => Arc::new(candidate),
                            Err(err) => {
                                log::warn!(
                                "[{}]: Failed to create server reflexive candidate: {} {} {}: {:?}",
                                agent_internal2.get_name(),
                                network,
                                ip,
                                port,
                                err
                            );
                                return Ok(());
                            }
                        };

                    {
                        if let Err(err) = agent_internal2.add_candidate(&candidate).await {
                            if let Err(close_err) = candidate.close().await {
                                log::warn!(
                                    "[{}]: Failed to close candidate: {}",
                                    agent_internal2.get_name(),
                                    close_err
                                );
                            }
                            log::warn!(
                                "[{}]: Failed to append to localCandidates and run onCandidateHdlr: {}",
                                agent_internal2.get_name(),
                                err
                            );
                        }
                    }

                    Result::<()>::Ok(())
                });
            }
        }

        wg.wait().await;
    }

    /// The srflx-mux counterpart of [`Agent::gather_candidates_srflx`]: instead of
    /// binding a fresh socket per URL, it probes each URL over the single socket a
    /// [`UDPMuxSrflx`] hands back for the local ufrag.
    async fn gather_candidates_srflx_udp_mux(params: GatherCandidatesSrflxUDPMuxParams) {
        let GatherCandidatesSrflxUDPMuxParams {
            urls,
            network_types,
            net,
            agent_internal,
            udp_mux_srflx,
            cancel,
        } = params;

        let ufrag = {
            let ufrag_pwd = agent_internal.ufrag_pwd.lock().await;
            ufrag_pwd.local_ufrag.clone()
        };

        let wg = WaitGroup::new();
        for network_type in network_types {
            if network_type.is_tcp() {
                continue;
            }

            for url in &urls {
                let network = network_type.to_string();
                let is_ipv4 = network_type.is_ipv4();
                let url = url.clone();
                let net2 = Arc::clone(&net);
                let agent_internal2 = Arc::clone(&agent_internal);
                let udp_mux_srflx2 = Arc::clone(&udp_mux_srflx);
                let ufrag2 = ufrag.clone();
                let cancel2 = cancel.clone();

                let w = wg.worker();
                tokio::spawn(async move {
                    let _d = w;

                    let host_port = format!("{}:{}", url.host, url.port);
                    let server_addr = match net2.resolve_addr(is_ipv4, &host_port).await {
                        Ok(addr) => addr,
                        Err(err) => {
                            log::warn!(
                                "[{}]: failed to resolve stun host: {}: {}",
                                agent_internal2.get_name(),
                                host_port,
                                err
                            );
                            return;
                        }
                    };

                    let xoraddr_fut = Arc::clone(&udp_mux_srflx2).get_xor_mapped_addr(
                        &ufrag2,
                        server_addr,
                        STUN_GATHER_TIMEOUT,
                    );
                    let xoraddr = tokio::select! {
                        result = xoraddr_fut => result,
                        _ = cancel2.cancelled() => return,
                        _ = agent_internal2.closed_cancel.cancelled() => return,
                    };

                    let xoraddr = match xoraddr {
                        Ok(xoraddr) => xoraddr,
                        Err(err) => {
                            log::warn!(
                                "[{}]: could not get server reflexive address via mux {} {}: {}",
                                agent_internal2.get_name(),
                                network,
                                url,
                                err
                            );
                            return;
                        }
                    };

                    let conn = match Arc::clone(&udp_mux_srflx2).get_conn(&ufrag2).await {
                        Ok(conn) => conn,
                        Err(err) => {
                            log::warn!(
                                "[{}]: failed to get muxed conn for ufrag {}: {}",
                                agent_internal2.get_name(),
                                ufrag2,
                                err
                            );
                            return;
                        }
                    };
                    let laddr = match conn.local_addr() {
                        Ok(addr) => addr,
                        Err(err) => {
                            log::warn!(
                                "[{}]: failed to get local addr of muxed conn: {}",
                                agent_internal2.get_name(),
                                err
                            );
                            return;
                        }
                    };

                    let srflx_config = CandidateServerReflexiveConfig {
                        base_config: CandidateBaseConfig {
                            network: network.clone(),
                            address: xoraddr.ip.to_string(),
                            port: xoraddr.port,
                            component: COMPONENT_RTP,
                            conn: Some(conn),
                            ..CandidateBaseConfig::default()
                        },
                        rel_addr: laddr.ip().to_string(),
                        rel_port: laddr.port(),
                    };

                    let candidate: Arc<dyn Candidate + Send + Sync> =
                        match srflx_config.new_candidate_server_reflexive() {
                            Ok(candidate) => Arc::new(candidate),
                            Err(err) => {
                                log::warn!(
                                    "[{}]: Failed to create server reflexive candidate: {} {}: {}",
                                    agent_internal2.get_name(),
                                    network,
                                    xoraddr.ip,
                                    err
                                );
                                return;
                            }
                        };

                    if let Err(err) = agent_internal2.add_candidate(&candidate).await {
                        if let Err(close_err) = candidate.close().await {
                            log::warn!(
                                "[{}]: Failed to close candidate: {}",
                                agent_internal2.get_name(),
                                close_err
                            );
                        }
                        log::warn!(
                            "[{}]: Failed to append to localCandidates and run onCandidateHdlr: {}",
                            agent_internal2.get_name(),
                            err
                        );
                    }
                });
            }
        }

        wg.wait().await;
    }

    pub(crate) async fn gather_candidates_relay(params: GatherCandidatesRelayParams) {
        let GatherCandidatesRelayParams {
            urls,
            net,
            agent_internal,
            proxy_dialer,
        } = params;

        let wg = WaitGroup::new();

        for url in urls {
            if url.scheme != SchemeType::Turn && url.scheme != SchemeType::Turns {
                continue;
            }
            if url.username.is_empty() {
                log::error!(
                    "[{}]:Failed to gather relay candidates: {:?}",
                    agent_internal.get_name(),
                    Error::ErrUsernameEmpty
                );
                return;
            }
            if url.password.is_empty() {
                log::error!(
                    "[{}]: Failed to gather relay candidates: {:?}",
                    agent_internal.get_name(),
                    Error::ErrPasswordEmpty
                );
                return;
            }

            let network = NetworkType::Udp4.to_string();
            let net2 = Arc::clone(&net);
            let agent_internal2 = Arc::clone(&agent_internal);
            let proxy_dialer2 = proxy_dialer.clone();

            let w = wg.worker();
            tokio::spawn(async move {
                let _d = w;

                let turn_server_addr = format!("{}:{}", url.host, url.port);

                let dial_result = Self::dial_relay_transport(
                    &url,
                    &turn_server_addr,
                    &net2,
                    &agent_internal2,
                    proxy_dialer2.as_deref(),
                )
                .await;

                let (loc_conn, rel_addr, rel_port, relay_protocol) = match dial_result {
                    Ok(Some(dialed)) => dialed,
                    Ok(None) => {
                        log::warn!(
                            "[{}]: Unable to handle URL in gather_candidates_relay {}",
                            agent_internal2.get_name(),
                            url
                        );
                        return Ok(());
                    }
                    Err(err) => {
                        log::warn!(
                            "[{}]: Failed to dial relay transport for {}: {}",
                            agent_internal2.get_name(),
                            url,
                            err
                        );
                        return Ok(());
                    }
                };

                let cfg = turn::client::ClientConfig {
                    stun_serv_addr: String::new(),
                    turn_serv_addr: turn_server_addr.clone(),
                    username: url.username,
                    password: url.password,
                    realm: String::new(),
                    software: String::new(),
                    rto_in_ms: 0,
                    conn: Arc::clone(&loc_conn),
                    vnet: Some(Arc::clone(&net2)),
                };
                let client = match turn::client::Client::new(cfg).await {
                    Ok(client) => Arc::new(client),
                    Err(err) => {
                        let _ = loc_conn.close().await;
                        log::warn!(
                            "[{}]: Failed to build new turn.Client {} {}\n",
                            agent_internal2.get_name(),
                            turn_server_addr,
                            err
                        );
                        return Ok(());
                    }
                };
                if let Err(err) = client.listen().await {
                    let _ = client.close().await;
                    let _ = loc_conn.close().await;
                    log::warn!(
                        "[{}]: Failed to listen on turn.Client {} {}",
                        agent_internal2.get_name(),
                        turn_server_addr,
                        err
                    );
                    return Ok(());
                }

                let relay_conn: Arc<dyn Conn + Send + Sync> = match client.allocate().await {
                    Ok(conn) => Arc::new(conn),
                    Err(err) => {
                        let _ = client.close().await;
                        let _ = loc_conn.close().await;
                        log::warn!(
                            "[{}]: Failed to allocate on turn.Client {} {}",
                            agent_internal2.get_name(),
                            turn_server_addr,
                            err
                        );
                        return Ok(());
                    }
                };

                let raddr = relay_conn.local_addr()?;
                log::debug!(
                    "[{}]: allocated relay candidate via {} transport",
                    agent_internal2.get_name(),
                    relay_protocol
                );
                let relay_config = CandidateRelayConfig {
                    base_config: CandidateBaseConfig {
                        network: network.clone(),
                        address: raddr.ip().to_string(),
                        port: raddr.port(),
                        component: COMPONENT_RTP,
                        conn: Some(Arc::clone(&relay_conn)),
                        ..CandidateBaseConfig::default()
                    },
                    rel_addr,
                    rel_port,
                    relay_client: Some(Arc::clone(&client)),
                    host_conn: Some(Arc::clone(&loc_conn)),
                    relay_protocol: relay_protocol.to_owned(),
                };

                let candidate: Arc<dyn Candidate + Send + Sync> =
                    match relay_config.new_candidate_relay() {
                        Ok(candidate) => Arc::new(candidate),
                        Err(err) => {
                            let _ = relay_conn.close().await;
                            let _ = client.close().await;
                            let _ = loc_conn.close().await;
                            log::warn!(
                                "[{}]: Failed to create relay candidate: {} {}: {}",
                                agent_internal2.get_name(),
                                network,
                                raddr,
                                err
                            );
                            return Ok(());
                        }
                    };

                {
                    if let Err(err) = agent_internal2.add_candidate(&candidate).await {
                        if let Err(close_err) = candidate.close().await {
                            log::warn!(
                                "[{}]: Failed to close candidate: {}",
                                agent_internal2.get_name(),
                                close_err
                            );
                        }
                        log::warn!(
                            "[{}]: Failed to append to localCandidates and run onCandidateHdlr: {}",
                            agent_internal2.get_name(),
                            err
                        );
                    }
                }

                Result::<()>::Ok(())
            });
        }

        wg.wait().await;
    }

    /// Dials the host-side transport a TURN client will speak to `url`'s server over,
    /// picking among the five relay transport profiles RFC 8656 and its TCP/TLS/DTLS
    /// companion RFCs describe. Returns `Ok(None)` for a scheme/transport/proxy
    /// combination this agent doesn't know how to dial (logged by the caller).
    async fn dial_relay_transport(
        url: &Url,
        turn_server_addr: &str,
        net: &Arc<Net>,
        agent_internal: &Arc<AgentInternal>,
        proxy_dialer: Option<&(dyn ProxyDialer + Send + Sync)>,
    ) -> Result<Option<(Arc<dyn Conn + Send + Sync>, String, u16, &'static str)>> {
        if url.proto == ProtoType::Udp && url.scheme == SchemeType::Turn {
            let loc_conn = net.bind(SocketAddr::from_str("0.0.0.0:0")?).await?;
            let local_addr = loc_conn.local_addr()?;
            return Ok(Some((
                loc_conn,
                local_addr.ip().to_string(),
                local_addr.port(),
                "udp",
            )));
        }

        if url.proto == ProtoType::Udp && url.scheme == SchemeType::Turns {
            let server_addr = net.resolve_addr(true, turn_server_addr).await?;
            let udp_conn = net.bind(SocketAddr::from_str("0.0.0.0:0")?).await?;
            let local_addr = udp_conn.local_addr()?;
            udp_conn.connect(server_addr).await?;

            let dtls_config = dtls::config::Config {
                server_name: url.host.clone(),
                insecure_skip_verify: agent_internal.insecure_skip_verify,
                ..Default::default()
            };
            let dtls_conn = dtls::conn::DTLSConn::new(udp_conn, dtls_config, true, None).await?;
            let loc_conn: Arc<dyn Conn + Send + Sync> = Arc::new(dtls_conn);
            return Ok(Some((
                loc_conn,
                local_addr.ip().to_string(),
                local_addr.port(),
                "dtls",
            )));
        }

        if url.proto == ProtoType::Tcp {
            if let Some(proxy_dialer) = proxy_dialer {
                let stream = proxy_dialer.dial("tcp", turn_server_addr).await?;
                let remote_addr = net
                    .resolve_addr(true, turn_server_addr)
                    .await
                    .unwrap_or_else(|_| SocketAddr::from_str("0.0.0.0:0").unwrap());
                let local_addr = SocketAddr::from_str("0.0.0.0:0").unwrap();

                let (stream, relay_protocol) = if url.scheme == SchemeType::Turns {
                    let stream = Self::tls_connect_client(
                        stream,
                        &url.host,
                        agent_internal.insecure_skip_verify,
                    )
                    .await?;
                    (stream, "tls")
                } else {
                    (stream, "tcp")
                };

                let loc_conn: Arc<dyn Conn + Send + Sync> =
                    Arc::new(StreamFramedConn::new(stream, local_addr, remote_addr));
                return Ok(Some((
                    loc_conn,
                    local_addr.ip().to_string(),
                    local_addr.port(),
                    relay_protocol,
                )));
            }

            if url.scheme == SchemeType::Turn {
                let tcp_stream = TcpStream::connect(turn_server_addr).await?;
                let local_addr = tcp_stream.local_addr()?;
                let remote_addr = tcp_stream.peer_addr()?;
                let stream: Box<dyn AsyncStream> = Box::new(tcp_stream);
                let loc_conn: Arc<dyn Conn + Send + Sync> =
                    Arc::new(StreamFramedConn::new(stream, local_addr, remote_addr));
                return Ok(Some((
                    loc_conn,
                    local_addr.ip().to_string(),
                    local_addr.port(),
                    "tcp",
                )));
            }

            if url.scheme == SchemeType::Turns {
                let tcp_stream = TcpStream::connect(turn_server_addr).await?;
                let local_addr = tcp_stream.local_addr()?;
                let remote_addr = tcp_stream.peer_addr()?;
                let stream: Box<dyn AsyncStream> = Box::new(tcp_stream);
                let stream = Self::tls_connect_client(
                    stream,
                    &url.host,
                    agent_internal.insecure_skip_verify,
                )
                .await?;
                let loc_conn: Arc<dyn Conn + Send + Sync> =
                    Arc::new(StreamFramedConn::new(stream, local_addr, remote_addr));
                return Ok(Some((
                    loc_conn,
                    local_addr.ip().to_string(),
                    local_addr.port(),
                    "tls",
                )));
            }
        }

        Ok(None)
    }

    /// Performs a client-side TLS handshake over an already-established duplex
    /// stream, used by the `turns/tcp` relay profile (direct and proxied alike).
    /// `insecure_skip_verify` installs a verifier that accepts any certificate,
    /// matching the agent-wide knob used for `turns/udp`'s DTLS handshake; otherwise
    /// the platform's native root store is used.
    async fn tls_connect_client(
        stream: Box<dyn AsyncStream>,
        server_name: &str,
        insecure_skip_verify: bool,
    ) -> Result<Box<dyn AsyncStream>> {
        let mut root_store = rustls::RootCertStore::empty();
        if !insecure_skip_verify {
            let native_certs = rustls_native_certs::load_native_certs();
            for err in native_certs.errors {
                log::warn!("failed to load a native root certificate: {}", err);
            }
            for cert in native_certs.certs {
                let _ = root_store.add(cert);
            }
        }

        let mut tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if insecure_skip_verify {
            tls_config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoCertificateVerification));
        }

        let connector = TlsConnector::from(Arc::new(tls_config));
        let dns_name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| Error::ErrAddressParseFailed)?;

        let tls_stream = connector.connect(dns_name, stream).await?;
        Ok(Box::new(tls_stream))
    }
}

/// Accepts any server certificate. Only installed when the caller explicitly opts
/// into `insecure_skip_verify`, mirroring the equivalent knob on the DTLS path.
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
