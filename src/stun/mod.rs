//! NAT classification by echo probes.
//!
//! The client sends echo requests from its main port and from fresh
//! ephemeral ports to one or two servers and compares the public endpoints
//! they report back:
//!
//! * main port to server 1 tells whether there is a NAT at all;
//! * main port to server 2 and to server 1's alternate port separates the
//!   mapping behaviours;
//! * change-server and change-port replies reveal the filtering;
//! * consecutive ephemeral ports show how public ports are allocated.
//!
//! [`classify`] turns the collected [`ProbeResults`] into a descriptor.

use async_trait::async_trait;
use natpunch_core::endpoint::{Endpoint, Transport};
use natpunch_core::nat::{AllocationPolicy, FilteringPolicy, MappingPolicy, NatDescriptor};
use natpunch_core::timer::TimeoutId;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::time::Instant;

use crate::config::StunClientConfig;
use crate::error::{Error, Result};
use crate::protocol::{Address, Body, EchoKind, Message};
use crate::self_model::SelfModel;

pub mod server;

pub use server::StunResponder;

/// Ephemeral ports probed to learn the allocation policy.
const ALLOCATION_PROBES: usize = 2;

/// Maps a local port on the gateway, e.g. through UPnP.
#[async_trait]
pub trait PortMapper: Send + Sync {
    /// Returns the public port now forwarded to `local`.
    async fn map_port(&self, local: SocketAddr) -> Result<u16>;
}

/// Public endpoints reported by the servers. `None` means no answer.
#[derive(Debug, Clone, Default)]
pub struct ProbeResults {
    pub local: Option<SocketAddr>,
    pub server1: Option<SocketAddr>,
    pub server2: Option<SocketAddr>,
    pub server1_alt: Option<SocketAddr>,
    pub change_server: bool,
    pub change_port: bool,
    /// (local port, observed public port) in the order the mappings were made.
    pub allocations: Vec<(u16, u16)>,
}

pub fn classify(results: &ProbeResults, delta_window: u16) -> Result<NatDescriptor> {
    let (Some(local), Some(observed)) = (results.local, results.server1) else {
        return Err(Error::Unreachable {
            node_id: 0,
            reason: "no answer from the stun server".into(),
        });
    };
    if observed == local {
        return Ok(NatDescriptor::open());
    }
    let port_changes = results.server1_alt.is_some_and(|alt| alt != observed);
    let mapping = match results.server2 {
        Some(other) if other != observed => {
            if results.server1_alt == Some(observed) {
                MappingPolicy::AddressDependent
            } else {
                MappingPolicy::AddressAndPortDependent
            }
        }
        _ if port_changes => MappingPolicy::AddressAndPortDependent,
        _ => MappingPolicy::EndpointIndependent,
    };
    let filtering = if results.change_server {
        FilteringPolicy::EndpointIndependent
    } else if results.change_port {
        FilteringPolicy::AddressDependent
    } else {
        FilteringPolicy::AddressAndPortDependent
    };
    let (allocation, delta) = allocation(&results.allocations, delta_window);
    Ok(NatDescriptor::natted(mapping, allocation, filtering).with_delta(delta))
}

fn allocation(samples: &[(u16, u16)], delta_window: u16) -> (AllocationPolicy, u8) {
    if samples.iter().all(|(local, public)| local == public) {
        return (AllocationPolicy::PortPreservation, 0);
    }
    let deltas: Vec<i32> = samples
        .windows(2)
        .map(|w| w[1].1 as i32 - w[0].1 as i32)
        .collect();
    match deltas.first() {
        Some(&delta)
            if delta > 0
                && delta <= delta_window as i32
                && delta <= u8::MAX as i32
                && deltas.iter().all(|d| *d == delta) =>
        {
            (AllocationPolicy::PortContiguity, delta as u8)
        }
        _ => (AllocationPolicy::Random, 0),
    }
}

/// A STUN response routed to the client.
#[derive(Debug)]
pub struct StunReply {
    pub msg: Message,
    pub remote: SocketAddr,
}

pub struct StunClient {
    config: StunClientConfig,
    me: SelfModel,
    endpoint: Endpoint<Message>,
    replies: Receiver<StunReply>,
    port_mapper: Option<Arc<dyn PortMapper>>,
}

impl StunClient {
    pub fn new(
        config: StunClientConfig,
        me: SelfModel,
        endpoint: Endpoint<Message>,
        replies: Receiver<StunReply>,
    ) -> Self {
        Self {
            config,
            me,
            endpoint,
            replies,
            port_mapper: None,
        }
    }

    pub fn set_port_mapper(mut self, port_mapper: Arc<dyn PortMapper>) -> Self {
        self.port_mapper = Some(port_mapper);
        self
    }

    /// Probes the configured servers and returns the local NAT type.
    pub async fn run(mut self) -> Result<NatDescriptor> {
        let Some(server1) = self.config.servers.first().copied() else {
            return Err(Error::Config("no stun servers".into()));
        };
        let server2 = self.config.servers.get(1).copied();
        let main = self.me.address();
        let mut results = ProbeResults {
            local: Some(main.socket_addr()),
            ..Default::default()
        };

        let Some((observed, alt_port)) = self.echo(main.port, server1, EchoKind::Plain).await else {
            return classify(&results, self.config.delta_window);
        };
        results.server1 = Some(observed);
        if observed == main.socket_addr() {
            log::info!("no nat between us and {server1}");
            return self.finish(NatDescriptor::open(), server1).await;
        }
        results.allocations.push((main.port, observed.port()));

        if let Some(server2) = server2 {
            results.server2 = self.echo(main.port, server2, EchoKind::Plain).await.map(|r| r.0);
        }
        if alt_port != 0 {
            let alt = Address::new(server1.ip, alt_port, server1.node_id);
            results.server1_alt = self.echo(main.port, alt, EchoKind::Plain).await.map(|r| r.0);
        }
        results.change_server = self
            .echo(main.port, server1, EchoKind::ChangeServer)
            .await
            .is_some();
        if !results.change_server {
            results.change_port = self
                .echo(main.port, server1, EchoKind::ChangePort)
                .await
                .is_some();
        }
        self.probe_allocation(server1, &mut results).await?;

        let mut nat = classify(&results, self.config.delta_window)?
            .with_binding_timeout(self.config.binding_timeout_ms);
        if self.config.upnp_enable {
            if let Some(mapper) = &self.port_mapper {
                match mapper.map_port(main.socket_addr()).await {
                    Ok(port) => nat = nat.with_upnp(port),
                    Err(e) => log::warn!("upnp mapping of {main} failed: {e}"),
                }
            }
        }
        self.finish(nat, server1).await
    }

    async fn probe_allocation(&mut self, server: Address, results: &mut ProbeResults) -> Result<()> {
        let ip = self.me.address().socket_addr().ip();
        let ports = self
            .endpoint
            .alloc_ephemeral(ip, ALLOCATION_PROBES, Transport::Udp)
            .await?;
        for port in &ports {
            if let Some((observed, _)) = self.echo(*port, server, EchoKind::Plain).await {
                results.allocations.push((*port, observed.port()));
            }
        }
        self.endpoint.release(ports, Transport::Udp).await?;
        Ok(())
    }

    async fn finish(&mut self, nat: NatDescriptor, server: Address) -> Result<NatDescriptor> {
        log::info!("nat classified as {nat}");
        let report = Body::StunReportRequest {
            report: format!("{} {nat}", self.me.node_id()),
        };
        if self.transact(self.me.address().port, server, report).await.is_none() {
            log::debug!("stun report to {server} not acknowledged");
        }
        Ok(nat)
    }

    async fn echo(&mut self, port: u16, server: Address, kind: EchoKind) -> Option<(SocketAddr, u16)> {
        let body = Body::StunEchoRequest {
            kind,
            reply_to: None,
        };
        match self.transact(port, server, body).await?.body {
            Body::StunEchoResponse {
                observed, alt_port, ..
            } => Some((observed.socket_addr(), alt_port)),
            _ => None,
        }
    }

    /// Sends `body` from `port` and waits for the reply carrying the same
    /// timeout id, retrying with a growing timeout.
    async fn transact(&mut self, port: u16, server: Address, body: Body) -> Option<Message> {
        let timeout_id = TimeoutId::random();
        let mut src = self.me.vod_address();
        src.addr.port = port;
        let msg = Message::new(src, server, body).with_timeout(timeout_id);
        let mut rto = self.config.rto();
        for _ in 0..self.config.rto_retries {
            if let Err(e) = self.endpoint.send(msg.clone()).await {
                log::warn!("stun request to {server}: {e}");
                return None;
            }
            let deadline = Instant::now() + rto;
            loop {
                match tokio::time::timeout_at(deadline, self.replies.recv()).await {
                    Ok(Some(reply)) if reply.msg.timeout_id == timeout_id => {
                        return Some(reply.msg)
                    }
                    Ok(Some(reply)) => {
                        log::debug!("drop stale stun reply from {}", reply.remote)
                    }
                    Ok(None) => return None,
                    Err(_) => break,
                }
            }
            rto = rto.mul_f64(self.config.rto_scale);
        }
        None
    }
}
