use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::rtunnel::tunnel::{msg::PortsRange, registry::ProxyType};

/// File names looked up inside a directory, in order of preference.
const CONFIG_NAMES: [&str; 3] = ["rtunnel.toml", "rtunnel.yaml", "rtunnel.yml"];

/// Where the config file was found, for the startup log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Flag,
    Env,
    WorkDir,
    SystemDefault,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Flag => "--config",
            ConfigSource::Env => "RTUNNEL_CONFIG",
            ConfigSource::WorkDir => "working directory",
            ConfigSource::SystemDefault => "system default",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigLocation {
    pub path: PathBuf,
    pub source: ConfigSource,
}

/// Picks the config file: `--config`, then `RTUNNEL_CONFIG`, then an `rtunnel.*` in the
/// working directory, then the system default. The file need not exist yet.
pub fn locate_config(flag: Option<PathBuf>) -> anyhow::Result<ConfigLocation> {
    let env = std::env::var_os("RTUNNEL_CONFIG")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    let named = flag
        .map(|p| (p, ConfigSource::Flag))
        .or_else(|| env.map(|p| (p, ConfigSource::Env)));
    if let Some((p, source)) = named {
        return Ok(ConfigLocation {
            path: expand_named_path(p)?,
            source,
        });
    }

    if let Some(path) = find_in_dir(Path::new(".")) {
        return Ok(ConfigLocation {
            path,
            source: ConfigSource::WorkDir,
        });
    }
    Ok(ConfigLocation {
        path: system_config_path()?,
        source: ConfigSource::SystemDefault,
    })
}

/// A named directory resolves to the config inside it; a bare name gets `.toml`.
fn expand_named_path(p: PathBuf) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    if p.is_dir() {
        return Ok(find_in_dir(&p).unwrap_or_else(|| p.join(CONFIG_NAMES[0])));
    }
    if !p.exists() && p.extension().is_none() {
        return Ok(p.with_extension("toml"));
    }
    Ok(p)
}

fn find_in_dir(dir: &Path) -> Option<PathBuf> {
    CONFIG_NAMES.iter().map(|n| dir.join(n)).find(|p| p.is_file())
}

#[cfg(target_os = "linux")]
fn system_config_path() -> anyhow::Result<PathBuf> {
    Ok(PathBuf::from("/etc/rtunnel").join(CONFIG_NAMES[0]))
}

#[cfg(not(target_os = "linux"))]
fn system_config_path() -> anyhow::Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("dev", "rtunnel", "rtunnel").context("config: no user config directory")?;
    Ok(dirs.config_dir().join(CONFIG_NAMES[0]))
}

/// Writes the default template when `path` does not exist yet. Returns whether it did.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = match extension_of(path).as_str() {
        "toml" => DEFAULT_CONFIG_TEMPLATE_TOML,
        "yaml" | "yml" => DEFAULT_CONFIG_TEMPLATE_YAML,
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match extension_of(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?,
        ext => anyhow::bail!("config: unsupported config extension {ext}"),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub auth_token: String,
    pub metrics_addr: String,
    pub logging: LoggingConfig,
    pub relay: Option<RelayConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub replay_window: Duration,
    pub authenticate_heartbeats: bool,
    pub trust_client_spec: bool,
    pub heartbeat_timeout: Duration,
    pub work_conn_timeout: Duration,
    pub nat_hole_timeout: Duration,
    pub max_pool_count: u32,
    pub allow_ports: Vec<PortsRange>,
    pub subdomain_host: String,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub user: String,
    pub pool_count: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub authenticate_heartbeats: bool,
    pub dial_timeout: Duration,
    pub nat_hole_timeout: Duration,
    pub proxies: Vec<ProxyConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub name: String,
    pub proxy_type: String,
    pub local_addr: String,
    pub remote_port: u16,
    pub custom_domains: Vec<String>,
    pub sub_domain: String,
    pub locations: Vec<String>,
    pub sk: String,
    pub allow_users: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    auth_token: String,
    #[serde(default)]
    metrics_addr: String,
    logging: Option<FileLogging>,
    relay: Option<FileRelay>,
    client: Option<FileClient>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileRelay {
    bind_addr: Option<String>,
    replay_window_ms: Option<i64>,
    #[serde(default)]
    authenticate_heartbeats: bool,
    #[serde(default)]
    trust_client_spec: bool,
    heartbeat_timeout_ms: Option<i64>,
    work_conn_timeout_ms: Option<i64>,
    nat_hole_timeout_ms: Option<i64>,
    max_pool_count: Option<u32>,
    #[serde(default)]
    allow_ports: Vec<String>,
    subdomain_host: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileClient {
    server_addr: String,
    user: Option<String>,
    pool_count: Option<u32>,
    heartbeat_interval_ms: Option<i64>,
    heartbeat_timeout_ms: Option<i64>,
    #[serde(default)]
    authenticate_heartbeats: bool,
    dial_timeout_ms: Option<i64>,
    nat_hole_timeout_ms: Option<i64>,
    #[serde(default)]
    proxies: Vec<FileProxy>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileProxy {
    name: String,
    #[serde(rename = "type")]
    proxy_type: Option<String>,
    #[serde(default)]
    local_addr: String,
    #[serde(default)]
    remote_port: u16,
    #[serde(default)]
    custom_domains: Vec<String>,
    sub_domain: Option<String>,
    #[serde(default)]
    locations: Vec<String>,
    sk: Option<String>,
    #[serde(default)]
    allow_users: Vec<String>,
}

fn ms(v: Option<i64>, default_ms: i64) -> Duration {
    Duration::from_millis(v.unwrap_or(default_ms).max(0) as u64)
}

fn trimmed(v: Option<String>) -> String {
    v.unwrap_or_default().trim().to_string()
}

/// Parses `"8000"` or `"10000-20000"`.
fn parse_ports_range(s: &str) -> anyhow::Result<PortsRange> {
    let s = s.trim();
    let (from, to) = match s.split_once('-') {
        Some((a, b)) => (a.trim(), b.trim()),
        None => (s, s),
    };
    let from: u16 = from.parse().with_context(|| format!("config: invalid port range {s:?}"))?;
    let to: u16 = to.parse().with_context(|| format!("config: invalid port range {s:?}"))?;
    if from == 0 || from > to {
        anyhow::bail!("config: invalid port range {s:?}");
    }
    Ok(PortsRange { from, to })
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let logging = match fc.logging {
            Some(l) => LoggingConfig {
                level: l.level.unwrap_or_else(|| "info".into()).trim().to_ascii_lowercase(),
                format: l.format.unwrap_or_else(|| "json".into()).trim().to_ascii_lowercase(),
                output: l.output.unwrap_or_else(|| "stderr".into()).trim().to_string(),
                add_source: l.add_source,
            },
            None => LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        let relay = match fc.relay {
            Some(r) => {
                let allow_ports = r
                    .allow_ports
                    .iter()
                    .map(|s| parse_ports_range(s))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Some(RelayConfig {
                    bind_addr: r.bind_addr.unwrap_or_else(|| ":7000".into()).trim().to_string(),
                    replay_window: ms(r.replay_window_ms, 15 * 60 * 1000),
                    authenticate_heartbeats: r.authenticate_heartbeats,
                    trust_client_spec: r.trust_client_spec,
                    heartbeat_timeout: ms(r.heartbeat_timeout_ms, 90_000),
                    work_conn_timeout: ms(r.work_conn_timeout_ms, 10_000),
                    nat_hole_timeout: ms(r.nat_hole_timeout_ms, 10_000),
                    max_pool_count: r.max_pool_count.unwrap_or(5),
                    allow_ports,
                    subdomain_host: trimmed(r.subdomain_host).to_ascii_lowercase(),
                })
            }
            None => None,
        };

        let client = match fc.client {
            Some(c) => {
                let mut proxies = Vec::with_capacity(c.proxies.len());
                for (i, p) in c.proxies.into_iter().enumerate() {
                    let name = p.name.trim().to_string();
                    if name.is_empty() {
                        anyhow::bail!("config: client.proxies[{i}] missing name");
                    }
                    let proxy_type = p.proxy_type.unwrap_or_else(|| "tcp".into()).trim().to_ascii_lowercase();
                    if ProxyType::parse(&proxy_type).is_none() {
                        anyhow::bail!("config: client.proxies[{i}] ({name}) has unsupported type {proxy_type:?}");
                    }
                    if proxies.iter().any(|q: &ProxyConfig| q.name == name) {
                        anyhow::bail!("config: duplicate proxy name {name:?}");
                    }
                    proxies.push(ProxyConfig {
                        name,
                        proxy_type,
                        local_addr: p.local_addr.trim().to_string(),
                        remote_port: p.remote_port,
                        custom_domains: p.custom_domains.iter().map(|d| d.trim().to_ascii_lowercase()).collect(),
                        sub_domain: trimmed(p.sub_domain),
                        locations: p.locations,
                        sk: p.sk.unwrap_or_default(),
                        allow_users: p.allow_users,
                    });
                }
                let server_addr = c.server_addr.trim().to_string();
                if server_addr.is_empty() {
                    anyhow::bail!("config: client.server_addr is required");
                }
                Some(ClientConfig {
                    server_addr,
                    user: trimmed(c.user),
                    pool_count: c.pool_count.unwrap_or(1),
                    heartbeat_interval: ms(c.heartbeat_interval_ms, 30_000),
                    heartbeat_timeout: ms(c.heartbeat_timeout_ms, 90_000),
                    authenticate_heartbeats: c.authenticate_heartbeats,
                    dial_timeout: ms(c.dial_timeout_ms, 10_000),
                    nat_hole_timeout: ms(c.nat_hole_timeout_ms, 10_000),
                    proxies,
                })
            }
            None => None,
        };

        Ok(Config {
            auth_token: fc.auth_token,
            metrics_addr: fc.metrics_addr.trim().to_string(),
            logging,
            relay,
            client,
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# rtunnel configuration.
# Relay and client sections may be used together or on their own.

auth_token = "change-me"
# metrics_addr = ":9100"

[logging]
level = "info"
format = "json"
output = "stderr"

[relay]
bind_addr = ":7000"
heartbeat_timeout_ms = 90000
work_conn_timeout_ms = 10000
max_pool_count = 5
allow_ports = ["10000-60000"]

# [client]
# server_addr = "relay.example.com:7000"
# pool_count = 1
#
# [[client.proxies]]
# name = "ssh"
# type = "tcp"
# local_addr = "127.0.0.1:22"
# remote_port = 6000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# rtunnel configuration.
# Relay and client sections may be used together or on their own.

auth_token: "change-me"
# metrics_addr: ":9100"

logging:
  level: info
  format: json
  output: stderr

relay:
  bind_addr: ":7000"
  heartbeat_timeout_ms: 90000
  work_conn_timeout_ms: 10000
  max_pool_count: 5
  allow_ports: ["10000-60000"]

# client:
#   server_addr: "relay.example.com:7000"
#   pool_count: 1
#   proxies:
#     - name: ssh
#       type: tcp
#       local_addr: "127.0.0.1:22"
#       remote_port: 6000
"#;
