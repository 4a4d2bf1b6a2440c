//! Network configuration exchanged over the tunnel
//!
//! The server keeps one configuration document. `fetchConfiguration` serves
//! it without the `IPv4` section; an IP flow's open result carries a
//! personalized copy with the address assigned from the pool. The client turns
//! that mapping into [`NetworkSettings`].

use crate::protocol::{Map, Value};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Configuration document keys
pub mod keys {
    pub const IPV4: &str = "IPv4";
    pub const ADDRESS: &str = "Address";
    pub const NETMASK: &str = "Netmask";
    pub const ROUTES: &str = "Routes";
    pub const POOL: &str = "Pool";
    pub const START_ADDRESS: &str = "StartAddress";
    pub const END_ADDRESS: &str = "EndAddress";
    pub const DNS: &str = "DNS";
    pub const SERVERS: &str = "Servers";
    pub const SEARCH_DOMAINS: &str = "SearchDomains";
}

/// Per-packet overhead the tunnel adds, reported to the network stack
pub const TUNNEL_OVERHEAD_BYTES: u32 = 150;

/// Settings errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Missing setting: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },

    #[error("Unsupported value for {0}")]
    Unsupported(String),
}

/// One included IPv4 route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub destination: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl Route {
    /// 0.0.0.0/0
    pub fn default_route() -> Self {
        Self {
            destination: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// DNS settings for the tunnel interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsSettings {
    pub servers: Vec<String>,
    pub search_domains: Vec<String>,
    /// Only set for split tunnels
    pub match_domains: Vec<String>,
}

/// Interface settings the client applies once its IP flow is open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub tunnel_remote_address: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub included_routes: Vec<Route>,
    /// All traffic goes through the tunnel
    pub full_tunnel: bool,
    pub dns: Option<DnsSettings>,
    pub tunnel_overhead_bytes: u32,
}

impl NetworkSettings {
    /// Build settings from an open-result configuration
    ///
    /// `IPv4.Address` and `IPv4.Netmask` are required. Without `IPv4.Routes`
    /// the default route is used and the tunnel is full.
    pub fn from_configuration(
        configuration: &Map,
        remote_host: &str,
    ) -> Result<Self, SettingsError> {
        let address = required_addr(configuration, &[keys::IPV4, keys::ADDRESS])?;
        let netmask = required_addr(configuration, &[keys::IPV4, keys::NETMASK])?;

        let routes_path = [keys::IPV4, keys::ROUTES];
        let (included_routes, full_tunnel) = match configuration.get_path(&routes_path) {
            Some(Value::List(routes)) => (routes.iter().filter_map(parse_route).collect(), false),
            Some(_) => return Err(SettingsError::Unsupported(path(&routes_path))),
            None => (vec![Route::default_route()], true),
        };

        let dns = configuration.get_map(keys::DNS).and_then(|dns| {
            let servers = string_list(dns.get(keys::SERVERS)?)?;
            let search_domains = dns
                .get(keys::SEARCH_DOMAINS)
                .and_then(string_list)
                .unwrap_or_default();
            let match_domains = if full_tunnel {
                Vec::new()
            } else {
                search_domains.clone()
            };
            Some(DnsSettings {
                servers,
                search_domains,
                match_domains,
            })
        });

        Ok(Self {
            tunnel_remote_address: remote_host.to_string(),
            address,
            netmask,
            included_routes,
            full_tunnel,
            dns,
            tunnel_overhead_bytes: TUNNEL_OVERHEAD_BYTES,
        })
    }
}

/// Hands out IPv4 addresses from an inclusive range
#[derive(Debug)]
pub struct AddressPool {
    start: u32,
    end: u32,
    in_use: Mutex<HashSet<u32>>,
}

impl AddressPool {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, SettingsError> {
        let (start, end) = (u32::from(start), u32::from(end));
        if start > end {
            return Err(SettingsError::Invalid {
                key: path(&[keys::IPV4, keys::POOL]),
                value: format!("{} > {}", Ipv4Addr::from(start), Ipv4Addr::from(end)),
            });
        }
        Ok(Self {
            start,
            end,
            in_use: Mutex::new(HashSet::new()),
        })
    }

    /// Lowest free address, if any
    pub fn allocate(&self) -> Option<Ipv4Addr> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        let address = (self.start..=self.end).find(|a| !in_use.contains(a))?;
        in_use.insert(address);
        debug!("Allocated {}", Ipv4Addr::from(address));
        Some(Ipv4Addr::from(address))
    }

    pub fn release(&self, address: Ipv4Addr) {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        if in_use.remove(&u32::from(address)) {
            debug!("Released {}", address);
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// The server's configuration document and the pool derived from it
#[derive(Debug)]
pub struct ServerSettings {
    document: Map,
    pool: Option<AddressPool>,
}

impl ServerSettings {
    /// Validate a document
    ///
    /// An `IPv4` section needs `Netmask` and `Pool.StartAddress`/`EndAddress`;
    /// without it IP flows are refused.
    pub fn from_document(document: Map) -> Result<Self, SettingsError> {
        let pool = match document.get_map(keys::IPV4) {
            Some(_) => {
                required_addr(&document, &[keys::IPV4, keys::NETMASK])?;
                let start =
                    required_addr(&document, &[keys::IPV4, keys::POOL, keys::START_ADDRESS])?;
                let end = required_addr(&document, &[keys::IPV4, keys::POOL, keys::END_ADDRESS])?;
                Some(AddressPool::new(start, end)?)
            }
            None => None,
        };
        Ok(Self { document, pool })
    }

    /// Build from the `[server.settings]` table of the config file
    pub fn from_toml(table: &toml::Table) -> Result<Self, SettingsError> {
        Self::from_document(map_from_toml(table)?)
    }

    pub fn document(&self) -> &Map {
        &self.document
    }

    pub fn pool(&self) -> Option<&AddressPool> {
        self.pool.as_ref()
    }

    /// The document as served on `fetchConfiguration`
    pub fn public_document(&self) -> Map {
        let mut document = self.document.clone();
        document.remove(keys::IPV4);
        document
    }

    /// Configuration sent with a successful IP flow open
    pub fn client_configuration(&self, address: Ipv4Addr) -> Map {
        let mut ipv4 = Map::new().with(keys::ADDRESS, address.to_string());
        if let Some(netmask) = self.document.get_path(&[keys::IPV4, keys::NETMASK]) {
            ipv4.insert(keys::NETMASK, netmask.clone());
        }
        if let Some(routes) = self.document.get_path(&[keys::IPV4, keys::ROUTES]) {
            ipv4.insert(keys::ROUTES, routes.clone());
        }

        let mut configuration = Map::new().with(keys::IPV4, ipv4);
        if let Some(dns) = self.document.get(keys::DNS) {
            configuration.insert(keys::DNS, dns.clone());
        }
        configuration
    }
}

/// Convert a TOML table into a message map
///
/// Booleans become 0/1; floats and datetimes have no wire form.
pub fn map_from_toml(table: &toml::Table) -> Result<Map, SettingsError> {
    table
        .iter()
        .map(|(key, value)| Ok((key.clone(), value_from_toml(key, value)?)))
        .collect()
}

fn value_from_toml(key: &str, value: &toml::Value) -> Result<Value, SettingsError> {
    match value {
        toml::Value::String(s) => Ok(Value::String(s.clone())),
        toml::Value::Integer(i) => Ok(Value::Int(*i)),
        toml::Value::Boolean(b) => Ok(Value::Int(i64::from(*b))),
        toml::Value::Array(items) => items
            .iter()
            .map(|item| value_from_toml(key, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        toml::Value::Table(table) => map_from_toml(table).map(Value::Map),
        toml::Value::Float(_) | toml::Value::Datetime(_) => {
            Err(SettingsError::Unsupported(key.to_string()))
        }
    }
}

fn path(keys: &[&str]) -> String {
    keys.join(".")
}

fn required_addr(map: &Map, keys: &[&str]) -> Result<Ipv4Addr, SettingsError> {
    let value = map
        .get_path(keys)
        .ok_or_else(|| SettingsError::Missing(path(keys)))?;
    let text = value.as_str().ok_or_else(|| SettingsError::Invalid {
        key: path(keys),
        value: value.type_name().to_string(),
    })?;
    text.parse().map_err(|_| SettingsError::Invalid {
        key: path(keys),
        value: text.to_string(),
    })
}

fn parse_route(route: &Value) -> Option<Route> {
    let route = route.as_map()?;
    let parsed = route
        .get_str(keys::ADDRESS)
        .and_then(|a| a.parse().ok())
        .zip(route.get_str(keys::NETMASK).and_then(|m| m.parse().ok()));
    match parsed {
        Some((destination, netmask)) => Some(Route {
            destination,
            netmask,
        }),
        None => {
            debug!("Skipping incomplete route {:?}", route);
            None
        }
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_list()?
        .iter()
        .map(|v| v.as_str().map(str::to_owned))
        .collect()
}
