use std::collections::HashMap;

use rand::{RngExt, rng};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::rtunnel::net;
use crate::rtunnel::tunnel::msg::{NewProxy, PortsRange};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("proxy name is empty")]
    EmptyName,
    #[error("proxy [{0}] already exists")]
    Duplicate(String),
    #[error("proxy type [{0}] is not supported")]
    UnsupportedType(String),
    #[error("custom_domains and subdomain should set at least one of them")]
    MissingDomains,
    #[error("subdomain is not supported because the relay has no subdomain_host")]
    SubdomainUnsupported,
    #[error("domain [{0}] is already in use")]
    DomainInUse(String),
    #[error("port [{0}] is already in use")]
    PortInUse(u16),
    #[error("port [{0}] is not allowed")]
    PortNotAllowed(u16),
    #[error("no port available")]
    NoPortAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Tcp,
    Udp,
    Http,
    Https,
    Tcpmux,
    Stcp,
    Sudp,
    Xtcp,
}

impl ProxyType {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        Some(match s.as_str() {
            "" | "tcp" => ProxyType::Tcp,
            "udp" => ProxyType::Udp,
            "http" => ProxyType::Http,
            "https" => ProxyType::Https,
            "tcpmux" => ProxyType::Tcpmux,
            "stcp" => ProxyType::Stcp,
            "sudp" => ProxyType::Sudp,
            "xtcp" => ProxyType::Xtcp,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProxyType::Tcp => "tcp",
            ProxyType::Udp => "udp",
            ProxyType::Http => "http",
            ProxyType::Https => "https",
            ProxyType::Tcpmux => "tcpmux",
            ProxyType::Stcp => "stcp",
            ProxyType::Sudp => "sudp",
            ProxyType::Xtcp => "xtcp",
        }
    }

    /// Shared-secret kinds reachable only through visitors.
    pub fn is_private(self) -> bool {
        matches!(self, ProxyType::Stcp | ProxyType::Sudp | ProxyType::Xtcp)
    }

    fn is_vhost(self) -> bool {
        matches!(self, ProxyType::Http | ProxyType::Https | ProxyType::Tcpmux)
    }
}

#[derive(Debug, Clone)]
pub struct ProxyEntry {
    pub name: String,
    pub run_id: String,
    pub user: String,
    pub proxy_type: ProxyType,
    pub remote_port: u16,
    pub domains: Vec<String>,
    pub remote_addr: String,
    pub msg: NewProxy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct VhostKey {
    kind: ProxyType,
    domain: String,
    location: String,
}

#[derive(Default)]
struct State {
    proxies: HashMap<String, ProxyEntry>,
    vhosts: HashMap<VhostKey, String>,
    ports: HashMap<(bool, u16), String>,
}

/// ProxyName -> registration table shared by every control session.
pub struct ProxyRegistry {
    allow_ports: Vec<PortsRange>,
    subdomain_host: String,
    state: RwLock<State>,
}

impl std::fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRegistry").finish_non_exhaustive()
    }
}

impl ProxyRegistry {
    pub fn new(allow_ports: Vec<PortsRange>, subdomain_host: impl Into<String>) -> Self {
        Self {
            allow_ports,
            subdomain_host: subdomain_host.into().trim().to_ascii_lowercase(),
            state: RwLock::new(State::default()),
        }
    }

    pub async fn register(
        &self,
        run_id: &str,
        user: &str,
        m: &NewProxy,
    ) -> Result<ProxyEntry, RegistryError> {
        let name = m.proxy_name.trim().to_string();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let kind = ProxyType::parse(&m.proxy_type)
            .ok_or_else(|| RegistryError::UnsupportedType(m.proxy_type.clone()))?;

        let mut entry = ProxyEntry {
            name: name.clone(),
            run_id: run_id.to_string(),
            user: user.to_string(),
            proxy_type: kind,
            remote_port: 0,
            domains: Vec::new(),
            remote_addr: String::new(),
            msg: m.clone(),
        };

        let mut st = self.state.write().await;
        if st.proxies.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        let mut vhost_keys = Vec::new();
        match kind {
            ProxyType::Tcp | ProxyType::Udp => {
                let udp = kind == ProxyType::Udp;
                let port = self.claim_port(&st, udp, m.remote_port)?;
                st.ports.insert((udp, port), name.clone());
                entry.remote_port = port;
                entry.remote_addr = format!(":{port}");
            }
            k if k.is_vhost() => {
                entry.domains = self.domains_of(m)?;
                let locations = if m.locations.is_empty() {
                    vec![String::new()]
                } else {
                    m.locations.iter().map(|l| normalize_location(l)).collect()
                };
                for d in &entry.domains {
                    for loc in &locations {
                        let key = VhostKey {
                            kind,
                            domain: d.clone(),
                            location: loc.clone(),
                        };
                        if st.vhosts.contains_key(&key) {
                            return Err(RegistryError::DomainInUse(d.clone()));
                        }
                        vhost_keys.push(key);
                    }
                }
                entry.remote_addr = entry.domains.join(",");
            }
            _ => {}
        }

        for key in vhost_keys {
            st.vhosts.insert(key, name.clone());
        }
        st.proxies.insert(name, entry.clone());
        Ok(entry)
    }

    /// Removes `name` if it belongs to `run_id`.
    pub async fn unregister(&self, run_id: &str, name: &str) -> Option<ProxyEntry> {
        let mut st = self.state.write().await;
        let owned = st
            .proxies
            .get(name.trim())
            .is_some_and(|e| e.run_id == run_id);
        if !owned {
            return None;
        }
        let entry = st.proxies.remove(name.trim())?;
        st.vhosts.retain(|_, v| v != &entry.name);
        st.ports.retain(|_, v| v != &entry.name);
        Some(entry)
    }

    pub async fn unregister_run(&self, run_id: &str) -> Vec<String> {
        let mut st = self.state.write().await;
        let names: Vec<String> = st
            .proxies
            .values()
            .filter(|e| e.run_id == run_id)
            .map(|e| e.name.clone())
            .collect();
        for n in &names {
            st.proxies.remove(n);
        }
        st.vhosts.retain(|_, v| !names.contains(v));
        st.ports.retain(|_, v| !names.contains(v));
        names
    }

    pub async fn get(&self, name: &str) -> Option<ProxyEntry> {
        self.state.read().await.proxies.get(name.trim()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.proxies.len()
    }

    /// Resolves a vhost request to the proxy with the longest matching location.
    pub async fn find_by_host(&self, kind: ProxyType, host: &str, path: &str) -> Option<ProxyEntry> {
        let host = net::strip_port(host.trim()).to_ascii_lowercase();
        let st = self.state.read().await;
        let mut best: Option<(&VhostKey, &String)> = None;
        for (k, v) in &st.vhosts {
            if k.kind != kind || k.domain != host || !path.starts_with(&k.location) {
                continue;
            }
            if best.is_none_or(|(b, _)| k.location.len() > b.location.len()) {
                best = Some((k, v));
            }
        }
        best.and_then(|(_, name)| st.proxies.get(name).cloned())
    }

    fn domains_of(&self, m: &NewProxy) -> Result<Vec<String>, RegistryError> {
        let mut out: Vec<String> = m
            .custom_domains
            .iter()
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        let sub = m.sub_domain.trim().to_ascii_lowercase();
        if !sub.is_empty() {
            if self.subdomain_host.is_empty() {
                return Err(RegistryError::SubdomainUnsupported);
            }
            out.push(format!("{sub}.{}", self.subdomain_host));
        }
        if out.is_empty() {
            return Err(RegistryError::MissingDomains);
        }
        out.dedup();
        Ok(out)
    }

    fn port_allowed(&self, port: u16) -> bool {
        self.allow_ports.is_empty()
            || self
                .allow_ports
                .iter()
                .any(|r| port >= r.from && port <= r.to)
    }

    fn claim_port(&self, st: &State, udp: bool, want: u16) -> Result<u16, RegistryError> {
        if want != 0 {
            if !self.port_allowed(want) {
                return Err(RegistryError::PortNotAllowed(want));
            }
            if st.ports.contains_key(&(udp, want)) {
                return Err(RegistryError::PortInUse(want));
            }
            return Ok(want);
        }

        let ranges = if self.allow_ports.is_empty() {
            vec![PortsRange {
                from: 10000,
                to: 60000,
            }]
        } else {
            self.allow_ports.clone()
        };
        let mut r = rng();
        for _ in 0..64 {
            let range = ranges[r.random_range(0..ranges.len())];
            if range.from > range.to || range.from == 0 {
                continue;
            }
            let p = r.random_range(range.from..=range.to);
            if !st.ports.contains_key(&(udp, p)) {
                return Ok(p);
            }
        }
        for range in &ranges {
            for p in range.from.max(1)..=range.to {
                if !st.ports.contains_key(&(udp, p)) {
                    return Ok(p);
                }
            }
        }
        Err(RegistryError::NoPortAvailable)
    }
}

fn normalize_location(l: &str) -> String {
    let l = l.trim();
    if l == "/" { String::new() } else { l.to_string() }
}
