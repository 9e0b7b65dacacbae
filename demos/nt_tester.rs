use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use clap::{ArgAction, Parser};
use env_logger::Env;
use natpunch::config::{
    NatConfig, NatTraverserConfig, ParentMakerConfig, StunClientConfig, STUN_PORT,
};
use natpunch::protocol::{Address, Body, VodAddress};
use natpunch::{Builder, TraverserEvent};
use natpunch_core::nat::{AllocationPolicy, FilteringPolicy, MappingPolicy, NatDescriptor};
use natpunch_core::socket::pick_ipv4;
use natpunch_core::timer::TimeoutId;

/// How long a connection ping may wait for its pong.
const HOLE_PUNCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Ask the gateway for a port mapping.
    #[arg(action = ArgAction::Set)]
    upnp: bool,
    /// Node id.
    id: u32,
    /// 0: first public ip, 1: first private ip, 2: second private ip.
    bind_ip: u8,
    /// Host of the rendezvous/STUN server, reached on port 3478.
    bootstrap: String,
    /// Serve rendezvous and STUN requests.
    #[arg(action = ArgAction::Set)]
    open_server: Option<bool>,
    /// Listen port, 3478 for an open server and random otherwise.
    #[arg(short, long)]
    port: Option<u16>,
    /// Node id of the bootstrap server.
    #[arg(long, default_value_t = 0)]
    bootstrap_id: u32,
    /// Peer to ping.
    /// example: --peer 7@10.0.0.1:3000 --peer 9@10.0.0.2:3000/open
    #[arg(long)]
    peer: Vec<String>,
}

/// `id@ip:port`, with `/open` for peers that are not behind a NAT.
struct PeerArg {
    node_id: u32,
    addr: SocketAddr,
    open: bool,
}

impl FromStr for PeerArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (s, open) = match s.strip_suffix("/open") {
            Some(s) => (s, true),
            None => (s, false),
        };
        let (id, addr) = s
            .split_once('@')
            .ok_or_else(|| anyhow!("peer {s} is not id@ip:port"))?;
        Ok(Self {
            node_id: id.parse().with_context(|| format!("peer id {id}"))?,
            addr: addr.parse().with_context(|| format!("peer address {addr}"))?,
            open,
        })
    }
}

impl PeerArg {
    /// Natted peers are assumed to be registered with the bootstrap server.
    fn vod_address(&self, bootstrap: Address) -> VodAddress {
        let addr = Address::from_socket(self.addr, self.node_id);
        if self.open {
            return VodAddress::new(addr, 0, NatDescriptor::open());
        }
        let nat = NatDescriptor::natted(
            MappingPolicy::AddressAndPortDependent,
            AllocationPolicy::Random,
            FilteringPolicy::AddressAndPortDependent,
        );
        VodAddress::new(addr, 0, nat).with_parents([bootstrap])
    }
}

async fn resolve(host: &str, node_id: u32) -> anyhow::Result<Address> {
    let addr = tokio::net::lookup_host((host, STUN_PORT))
        .await
        .with_context(|| format!("resolve {host}"))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| anyhow!("{host} has no ipv4 address"))?;
    Ok(Address::from_socket(addr, node_id))
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let open_server = args.open_server.unwrap_or(false);
    let ip: Ipv4Addr = pick_ipv4(args.bind_ip).context("bind ip")?;
    let bootstrap = resolve(&args.bootstrap, args.bootstrap_id).await?;
    let peers = args
        .peer
        .iter()
        .map(|s| s.parse::<PeerArg>())
        .collect::<anyhow::Result<Vec<_>>>()?;
    let port = args
        .port
        .unwrap_or(if open_server { STUN_PORT } else { 0 });

    let config = NatConfig::default()
        .set_nat_traverser(NatTraverserConfig::default().set_open_server(open_server))
        .set_stun_client(
            StunClientConfig::default()
                .set_upnp_enable(args.upnp)
                .set_servers(vec![bootstrap]),
        )
        .set_parent_maker(ParentMakerConfig::default().set_servers(vec![bootstrap]));
    let (traverser, mut events) = Builder::new()
        .node_id(args.id)
        .bind(ip, port)
        .config(config)
        .build()
        .await
        .context("start node")?;
    log::info!("node {} started as {}", args.id, traverser.address());

    let peers: Vec<VodAddress> = peers.iter().map(|p| p.vod_address(bootstrap)).collect();
    let mut pending: HashMap<TimeoutId, (u32, Instant)> = HashMap::new();
    let (mut num_success, mut num_fail) = (0u32, 0u32);
    let mut interval = tokio::time::interval(HOLE_PUNCH_TIMEOUT);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {
                let before = pending.len();
                pending.retain(|_, (_, sent)| sent.elapsed() < HOLE_PUNCH_TIMEOUT);
                num_fail += (before - pending.len()) as u32;
                for peer in &peers {
                    let id = TimeoutId::random();
                    match traverser.send(peer.clone(), Body::ConnectionPing, id).await {
                        Ok(()) => {
                            pending.insert(id, (peer.node_id(), Instant::now()));
                        }
                        Err(e) => {
                            log::warn!("ping {peer}: {e}");
                            num_fail += 1;
                        }
                    }
                }
                log::info!("numSuccess/numFail {num_success}/{num_fail}");
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    TraverserEvent::Delivered(msg) => match msg.body {
                        Body::ConnectionPing => {
                            if let Err(e) = traverser
                                .send(msg.src.clone(), Body::ConnectionPong, msg.timeout_id)
                                .await
                            {
                                log::warn!("pong {}: {e}", msg.src);
                            }
                        }
                        Body::ConnectionPong => {
                            if let Some((node_id, sent)) = pending.remove(&msg.timeout_id) {
                                num_success += 1;
                                log::info!("pong from {node_id} after {:?}", sent.elapsed());
                            }
                        }
                        other => log::info!("data from {}: {:?}", msg.src, other),
                    },
                    TraverserEvent::Unreachable { dst, reason } => {
                        log::warn!("{dst} unreachable: {reason}")
                    }
                    TraverserEvent::Verified { dst, path } => {
                        log::info!("direct path to {dst}: {:?}", path)
                    }
                    TraverserEvent::NatClassified(nat) => log::info!("nat {nat}"),
                    TraverserEvent::ParentsChanged(parents) => log::info!("parents {parents:?}"),
                    TraverserEvent::ProbeSucceeded { dst, rtt } => {
                        log::info!("probe {dst} rtt {rtt:?}")
                    }
                    TraverserEvent::Fault(e) => log::warn!("fault: {e}"),
                    TraverserEvent::Bandwidth(stats) => log::debug!("{stats:?}"),
                }
            }
        }
    }
    log::info!("numSuccess/numFail {num_success}/{num_fail}");
    if let Err(e) = traverser.shutdown().await {
        log::warn!("shutdown: {e}");
    }
    Ok(())
}
