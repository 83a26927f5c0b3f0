//! Server configuration.
//!
//! Values resolve in order: defaults, then the TOML file, then env vars and
//! CLI flags (applied in `main`). The `[cluster]` table is passed through to
//! the cluster core as-is.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use cinder_cluster::{ClusterConfig, NodeAddr, NodeName, SlotRange, BUS_PORT_OFFSET};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the bus listener binds to.
    pub bind: String,
    /// Client port. The bus listens on `port + bus_port_offset`.
    pub port: u16,
    pub bus_port_offset: u16,
    /// Address advertised to peers. Empty means they use whatever address
    /// our connections come from.
    pub announce_ip: String,
    /// Fixed node name (40 hex chars). Empty generates a random one.
    pub node_name: String,
    /// Start as a one-node cluster serving every slot.
    pub bootstrap: bool,
    /// Slots to serve at startup, as `"0-5460"` or `"7"`.
    pub slots: Vec<String>,
    /// Client addresses (`host:port`) of nodes to meet at startup.
    pub seeds: Vec<String>,
    /// Name of the master to replicate once it is known.
    pub replicate_of: String,
    pub cluster: ClusterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7000,
            bus_port_offset: BUS_PORT_OFFSET,
            announce_ip: String::new(),
            node_name: String::new(),
            bootstrap: false,
            slots: Vec::new(),
            seeds: Vec::new(),
            replicate_of: String::new(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads a TOML config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file '{}': {e}", path.display()))?;
        toml::from_str(&text)
            .map_err(|e| format!("invalid config file '{}': {e}", path.display()))
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// The bus listener address.
    pub fn bus_bind_addr(&self) -> Result<SocketAddr, String> {
        let port = self
            .port
            .checked_add(self.bus_port_offset)
            .ok_or_else(|| format!("bus port offset {} overflows", self.bus_port_offset))?;
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|e| format!("invalid bind address '{}': {e}", self.bind))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// The address this node advertises for itself.
    pub fn announce_addr(&self) -> Result<NodeAddr, String> {
        let bus = self.bus_bind_addr()?;
        let ip = if self.announce_ip.is_empty() {
            Some(bus.ip()).filter(|ip| !ip.is_unspecified())
        } else {
            let ip = self
                .announce_ip
                .parse()
                .map_err(|e| format!("invalid announce ip '{}': {e}", self.announce_ip))?;
            Some(ip)
        };
        Ok(NodeAddr::new(ip, self.port, bus.port()))
    }

    /// The configured node name, or a fresh random one.
    pub fn node_name(&self) -> Result<NodeName, String> {
        if self.node_name.is_empty() {
            return Ok(NodeName::random());
        }
        self.node_name.parse().map_err(|e| format!("{e}"))
    }

    /// Every slot named by `slots`, in order.
    pub fn startup_slots(&self) -> Result<Vec<u16>, String> {
        let mut slots = Vec::new();
        for spec in &self.slots {
            let range: SlotRange = spec
                .parse()
                .map_err(|e| format!("invalid slot range '{spec}': {e}"))?;
            slots.extend(range.iter());
        }
        Ok(slots)
    }

    /// Seed nodes with their bus ports at our offset.
    pub fn seed_addrs(&self) -> Result<Vec<NodeAddr>, String> {
        self.seeds
            .iter()
            .map(|seed| {
                let addr: SocketAddr = seed
                    .parse()
                    .map_err(|e| format!("invalid seed address '{seed}': {e}"))?;
                let cport = addr
                    .port()
                    .checked_add(self.bus_port_offset)
                    .ok_or_else(|| format!("seed port {} overflows with offset", addr.port()))?;
                Ok(NodeAddr::new(Some(addr.ip()), addr.port(), cport))
            })
            .collect()
    }

    pub fn replicate_of(&self) -> Result<Option<NodeName>, String> {
        if self.replicate_of.is_empty() {
            return Ok(None);
        }
        self.replicate_of
            .parse()
            .map(Some)
            .map_err(|e| format!("invalid replicate-of: {e}"))
    }
}
