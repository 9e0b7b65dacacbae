use natpunch_core::endpoint::EndpointConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::Address;

/// Well-known STUN port; the harness reaches its bootstrap server here.
pub const STUN_PORT: u16 = 3478;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    pub nat_traverser: NatTraverserConfig,
    pub hp_client: HpClientConfig,
    pub rendezvous_server: RendezvousServerConfig,
    pub stun_client: StunClientConfig,
    pub stun_server: StunServerConfig,
    pub parent_maker: ParentMakerConfig,
    pub endpoint: EndpointConfig,
}

impl NatConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: NatConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn set_nat_traverser(mut self, nat_traverser: NatTraverserConfig) -> Self {
        self.nat_traverser = nat_traverser;
        self
    }
    pub fn set_hp_client(mut self, hp_client: HpClientConfig) -> Self {
        self.hp_client = hp_client;
        self
    }
    pub fn set_rendezvous_server(mut self, rendezvous_server: RendezvousServerConfig) -> Self {
        self.rendezvous_server = rendezvous_server;
        self
    }
    pub fn set_stun_client(mut self, stun_client: StunClientConfig) -> Self {
        self.stun_client = stun_client;
        self
    }
    pub fn set_stun_server(mut self, stun_server: StunServerConfig) -> Self {
        self.stun_server = stun_server;
        self
    }
    pub fn set_parent_maker(mut self, parent_maker: ParentMakerConfig) -> Self {
        self.parent_maker = parent_maker;
        self
    }
    pub fn set_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn check(&self) -> Result<()> {
        self.hp_client
            .check()
            .and_then(|_| self.stun_client.check())
            .and_then(|_| self.parent_maker.check())
            .and_then(|_| self.rendezvous_server.check())
            .and_then(|_| self.endpoint.check())
            .map_err(Error::Config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatTraverserConfig {
    /// Upper bound on the lifetime of one pending handshake.
    pub open_server_timeout_ms: u64,
    /// Consecutive failed handshakes after which a destination is reported
    /// unreachable without trying again.
    pub max_fail_before_giving_up: u32,
    /// Serve rendezvous and STUN requests. Only meaningful on open nodes.
    pub open_server: bool,
}

impl Default for NatTraverserConfig {
    fn default() -> Self {
        Self {
            open_server_timeout_ms: 30_000,
            max_fail_before_giving_up: 3,
            open_server: false,
        }
    }
}

impl NatTraverserConfig {
    pub fn set_open_server_timeout(mut self, open_server_timeout: Duration) -> Self {
        self.open_server_timeout_ms = open_server_timeout.as_millis() as u64;
        self
    }
    pub fn set_max_fail_before_giving_up(mut self, max_fail_before_giving_up: u32) -> Self {
        self.max_fail_before_giving_up = max_fail_before_giving_up;
        self
    }
    pub fn set_open_server(mut self, open_server: bool) -> Self {
        self.open_server = open_server;
        self
    }
    pub fn open_server_timeout(&self) -> Duration {
        Duration::from_millis(self.open_server_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HpClientConfig {
    pub rto_ms: u64,
    pub rto_scale: f64,
    /// Total number of transmissions of one request.
    pub rto_retries: u32,
    /// Lifetime of a verified direct path. A path is punched again after it.
    pub path_ttl_ms: u64,
}

impl Default for HpClientConfig {
    fn default() -> Self {
        Self {
            rto_ms: 500,
            rto_scale: 1.2,
            rto_retries: 8,
            path_ttl_ms: 120_000,
        }
    }
}

impl HpClientConfig {
    pub fn set_rto(mut self, rto: Duration) -> Self {
        self.rto_ms = rto.as_millis() as u64;
        self
    }
    pub fn set_rto_scale(mut self, rto_scale: f64) -> Self {
        self.rto_scale = rto_scale;
        self
    }
    pub fn set_rto_retries(mut self, rto_retries: u32) -> Self {
        self.rto_retries = rto_retries;
        self
    }
    pub fn set_path_ttl(mut self, path_ttl: Duration) -> Self {
        self.path_ttl_ms = path_ttl.as_millis() as u64;
        self
    }
    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto_ms)
    }
    pub fn path_ttl(&self) -> Duration {
        Duration::from_millis(self.path_ttl_ms)
    }
    /// Time until the last retry gives up: `rto * sum(scale^i for i < retries)`.
    pub fn retry_budget(&self) -> Duration {
        let total: f64 = (0..self.rto_retries)
            .map(|i| self.rto_ms as f64 * self.rto_scale.powi(i as i32))
            .sum();
        Duration::from_millis(total.round() as u64)
    }
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.rto_ms == 0 {
            return Err("hp_client.rto_ms must be positive".into());
        }
        if self.rto_scale.is_nan() || self.rto_scale < 1.0 {
            return Err(format!("hp_client.rto_scale {} below 1.0", self.rto_scale));
        }
        if self.rto_retries == 0 {
            return Err("hp_client.rto_retries must be positive".into());
        }
        if self.path_ttl_ms == 0 {
            return Err("hp_client.path_ttl_ms must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousServerConfig {
    pub session_expiration_time_ms: u64,
    pub sweep_period_ms: u64,
    pub max_sessions: usize,
}

impl Default for RendezvousServerConfig {
    fn default() -> Self {
        Self {
            session_expiration_time_ms: 120_000,
            sweep_period_ms: 10_000,
            max_sessions: 1024,
        }
    }
}

impl RendezvousServerConfig {
    pub fn set_session_expiration_time(mut self, session_expiration_time: Duration) -> Self {
        self.session_expiration_time_ms = session_expiration_time.as_millis() as u64;
        self
    }
    pub fn set_sweep_period(mut self, sweep_period: Duration) -> Self {
        self.sweep_period_ms = sweep_period.as_millis() as u64;
        self
    }
    pub fn set_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }
    pub fn session_expiration_time(&self) -> Duration {
        Duration::from_millis(self.session_expiration_time_ms)
    }
    pub fn sweep_period(&self) -> Duration {
        Duration::from_millis(self.sweep_period_ms)
    }
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.sweep_period_ms == 0 {
            return Err("rendezvous_server.sweep_period_ms must be positive".into());
        }
        if self.max_sessions == 0 {
            return Err("rendezvous_server.max_sessions must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StunClientConfig {
    pub upnp_enable: bool,
    /// Two servers are needed to tell mapping behaviours apart.
    pub servers: Vec<Address>,
    pub rto_ms: u64,
    pub rto_scale: f64,
    pub rto_retries: u32,
    /// Largest port delta still classified as port contiguity.
    pub delta_window: u16,
    pub binding_timeout_ms: u32,
}

impl Default for StunClientConfig {
    fn default() -> Self {
        Self {
            upnp_enable: false,
            servers: Vec::new(),
            rto_ms: 500,
            rto_scale: 1.5,
            rto_retries: 4,
            delta_window: 10,
            binding_timeout_ms: 30_000,
        }
    }
}

impl StunClientConfig {
    pub fn set_upnp_enable(mut self, upnp_enable: bool) -> Self {
        self.upnp_enable = upnp_enable;
        self
    }
    pub fn set_servers(mut self, servers: Vec<Address>) -> Self {
        self.servers = servers;
        self
    }
    pub fn set_rto(mut self, rto: Duration) -> Self {
        self.rto_ms = rto.as_millis() as u64;
        self
    }
    pub fn set_rto_retries(mut self, rto_retries: u32) -> Self {
        self.rto_retries = rto_retries;
        self
    }
    pub fn set_delta_window(mut self, delta_window: u16) -> Self {
        self.delta_window = delta_window;
        self
    }
    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto_ms)
    }
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.rto_ms == 0 || self.rto_retries == 0 {
            return Err("stun_client needs a positive rto and retry count".into());
        }
        if self.rto_scale.is_nan() || self.rto_scale < 1.0 {
            return Err(format!("stun_client.rto_scale {} below 1.0", self.rto_scale));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StunServerConfig {
    /// Second local port for change-port replies, 0 disables them.
    pub alt_port: u16,
    /// Server that answers change-server requests on our behalf.
    pub partner: Option<Address>,
}

impl StunServerConfig {
    pub fn set_alt_port(mut self, alt_port: u16) -> Self {
        self.alt_port = alt_port;
        self
    }
    pub fn set_partner(mut self, partner: Address) -> Self {
        self.partner = Some(partner);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParentMakerConfig {
    pub min_parents: usize,
    pub max_parents: usize,
    pub refresh_period_ms: u64,
    /// Open servers to register with.
    pub servers: Vec<Address>,
}

impl Default for ParentMakerConfig {
    fn default() -> Self {
        Self {
            min_parents: 1,
            max_parents: 3,
            refresh_period_ms: 10_000,
            servers: Vec::new(),
        }
    }
}

impl ParentMakerConfig {
    pub fn set_min_parents(mut self, min_parents: usize) -> Self {
        self.min_parents = min_parents;
        self
    }
    pub fn set_max_parents(mut self, max_parents: usize) -> Self {
        self.max_parents = max_parents;
        self
    }
    pub fn set_refresh_period(mut self, refresh_period: Duration) -> Self {
        self.refresh_period_ms = refresh_period.as_millis() as u64;
        self
    }
    pub fn set_servers(mut self, servers: Vec<Address>) -> Self {
        self.servers = servers;
        self
    }
    pub fn refresh_period(&self) -> Duration {
        Duration::from_millis(self.refresh_period_ms)
    }
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.max_parents == 0 || self.max_parents > u8::MAX as usize {
            return Err(format!("parent_maker.max_parents {} out of range", self.max_parents));
        }
        if self.min_parents > self.max_parents {
            return Err(format!(
                "parent_maker.min_parents {} exceeds max_parents {}",
                self.min_parents, self.max_parents
            ));
        }
        if self.refresh_period_ms == 0 {
            return Err("parent_maker.refresh_period_ms must be positive".into());
        }
        Ok(())
    }
}
