//! Control-plane message catalog and wire codec.
//!
//! Every message travels as `tag:u8 | len:u64be | json body`. The catalog is closed:
//! the tag table below is the only place a kind is declared, and decoding a tag that
//! is not in it fails with [`ProtocolError::UnknownType`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_MSG_BYTES: u64 = 10240;
const HEADER_LEN: usize = 9;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("malformed message body: {0}")]
    MalformedBody(#[from] serde_json::Error),
    #[error("message too large: {0}")]
    PayloadTooLarge(u64),
    #[error("truncated frame")]
    Truncated,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

macro_rules! message_catalog {
    ($($kind:ident = $tag:literal,)+) => {
        /// Single-byte type tags of the message catalog.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum MsgType {
            $($kind = $tag,)+
        }

        impl MsgType {
            pub const ALL: &'static [MsgType] = &[$(MsgType::$kind,)+];

            pub fn tag(self) -> u8 {
                self as u8
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(MsgType::$kind => stringify!($kind),)+
                }
            }
        }

        impl TryFrom<u8> for MsgType {
            type Error = ProtocolError;

            fn try_from(tag: u8) -> Result<Self, ProtocolError> {
                match tag {
                    $($tag => Ok(MsgType::$kind),)+
                    other => Err(ProtocolError::UnknownType(other)),
                }
            }
        }

        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Message {
            $($kind($kind),)+
        }

        impl Message {
            pub fn msg_type(&self) -> MsgType {
                match self {
                    $(Message::$kind(_) => MsgType::$kind,)+
                }
            }

            fn body(&self) -> serde_json::Result<Vec<u8>> {
                match self {
                    $(Message::$kind(m) => serde_json::to_vec(m),)+
                }
            }

            fn from_body(ty: MsgType, body: &[u8]) -> serde_json::Result<Message> {
                match ty {
                    $(MsgType::$kind => serde_json::from_slice::<$kind>(body).map(Message::$kind),)+
                }
            }
        }

        $(
            impl From<$kind> for Message {
                fn from(m: $kind) -> Self {
                    Message::$kind(m)
                }
            }
        )+
    };
}

message_catalog! {
    Login = b'o',
    LoginResp = b'1',
    NewProxy = b'p',
    NewProxyResp = b'2',
    CloseProxy = b'c',
    NewWorkConn = b'w',
    ReqWorkConn = b'r',
    StartWorkConn = b's',
    NewVisitorConn = b'v',
    NewVisitorConnResp = b'3',
    Ping = b'h',
    Pong = b'4',
    UdpPacket = b'u',
    NatHoleVisitor = b'i',
    NatHoleClient = b'n',
    NatHoleResp = b'm',
    NatHoleSid = b'5',
    NatHoleReport = b'6',
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_default<T: Default + PartialEq>(v: &T) -> bool {
    *v == T::default()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSpec {
    /// Specialized client role (e.g. `ssh-tunnel`).
    #[serde(rename = "tp", skip_serializing_if = "String::is_empty")]
    pub client_type: String,
    #[serde(rename = "a_a_p", skip_serializing_if = "is_false")]
    pub always_auth_pass: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Login {
    #[serde(rename = "a", skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(rename = "b", skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(rename = "c", skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(rename = "d", skip_serializing_if = "String::is_empty")]
    pub arch: String,
    #[serde(rename = "e", skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(rename = "f", skip_serializing_if = "String::is_empty")]
    pub privilege_key: String,
    #[serde(rename = "t", skip_serializing_if = "is_default")]
    pub timestamp: i64,
    #[serde(rename = "r", skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    #[serde(rename = "c_i", skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(rename = "m", skip_serializing_if = "BTreeMap::is_empty")]
    pub metas: BTreeMap<String, String>,
    #[serde(rename = "cs", skip_serializing_if = "is_default")]
    pub client_spec: ClientSpec,
    #[serde(rename = "pc", skip_serializing_if = "is_default")]
    pub pool_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginResp {
    #[serde(rename = "a", skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(rename = "r", skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    #[serde(rename = "g", skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewProxy {
    #[serde(rename = "pn", skip_serializing_if = "String::is_empty")]
    pub proxy_name: String,
    #[serde(rename = "pt", skip_serializing_if = "String::is_empty")]
    pub proxy_type: String,
    #[serde(rename = "ue", skip_serializing_if = "is_false")]
    pub use_encryption: bool,
    #[serde(rename = "uc", skip_serializing_if = "is_false")]
    pub use_compression: bool,
    #[serde(rename = "bl", skip_serializing_if = "String::is_empty")]
    pub bandwidth_limit: String,
    #[serde(rename = "blm", skip_serializing_if = "String::is_empty")]
    pub bandwidth_limit_mode: String,
    #[serde(rename = "gg", skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(rename = "gk", skip_serializing_if = "String::is_empty")]
    pub group_key: String,
    #[serde(rename = "m", skip_serializing_if = "BTreeMap::is_empty")]
    pub metas: BTreeMap<String, String>,
    #[serde(rename = "an", skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    // tcp, udp
    #[serde(rename = "remote_port", skip_serializing_if = "is_default")]
    pub remote_port: u16,

    // http, https
    #[serde(rename = "cd", skip_serializing_if = "Vec::is_empty")]
    pub custom_domains: Vec<String>,
    #[serde(rename = "subd", skip_serializing_if = "String::is_empty")]
    pub sub_domain: String,
    #[serde(rename = "loc", skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<String>,
    #[serde(rename = "h_u", skip_serializing_if = "String::is_empty")]
    pub http_user: String,
    #[serde(rename = "h_p", skip_serializing_if = "String::is_empty")]
    pub http_pwd: String,
    #[serde(rename = "h_h_r", skip_serializing_if = "String::is_empty")]
    pub host_header_rewrite: String,
    #[serde(rename = "hdrs", skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(rename = "r_h", skip_serializing_if = "BTreeMap::is_empty")]
    pub response_headers: BTreeMap<String, String>,
    #[serde(rename = "r_b_h_u", skip_serializing_if = "String::is_empty")]
    pub route_by_http_user: String,

    // stcp, sudp, xtcp
    #[serde(rename = "sk", skip_serializing_if = "String::is_empty")]
    pub sk: String,
    #[serde(rename = "a_us", skip_serializing_if = "Vec::is_empty")]
    pub allow_users: Vec<String>,

    // tcpmux
    #[serde(rename = "mpl", skip_serializing_if = "String::is_empty")]
    pub multiplexer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewProxyResp {
    #[serde(rename = "pn", skip_serializing_if = "String::is_empty")]
    pub proxy_name: String,
    #[serde(rename = "r_a", skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
    #[serde(rename = "g", skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloseProxy {
    #[serde(rename = "pn", skip_serializing_if = "String::is_empty")]
    pub proxy_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewWorkConn {
    #[serde(rename = "r", skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    #[serde(rename = "f", skip_serializing_if = "String::is_empty")]
    pub privilege_key: String,
    #[serde(rename = "t", skip_serializing_if = "is_default")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqWorkConn {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartWorkConn {
    #[serde(rename = "pn", skip_serializing_if = "String::is_empty")]
    pub proxy_name: String,
    #[serde(rename = "s_a", skip_serializing_if = "String::is_empty")]
    pub src_addr: String,
    #[serde(rename = "d_a", skip_serializing_if = "String::is_empty")]
    pub dst_addr: String,
    #[serde(rename = "s_p", skip_serializing_if = "is_default")]
    pub src_port: u16,
    #[serde(rename = "d_p", skip_serializing_if = "is_default")]
    pub dst_port: u16,
    #[serde(rename = "g", skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewVisitorConn {
    #[serde(rename = "r", skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    #[serde(rename = "pn", skip_serializing_if = "String::is_empty")]
    pub proxy_name: String,
    #[serde(rename = "s_k", skip_serializing_if = "String::is_empty")]
    pub sign_key: String,
    #[serde(rename = "t", skip_serializing_if = "is_default")]
    pub timestamp: i64,
    #[serde(rename = "ue", skip_serializing_if = "is_false")]
    pub use_encryption: bool,
    #[serde(rename = "uc", skip_serializing_if = "is_false")]
    pub use_compression: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewVisitorConnResp {
    #[serde(rename = "pn", skip_serializing_if = "String::is_empty")]
    pub proxy_name: String,
    #[serde(rename = "g", skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ping {
    #[serde(rename = "f", skip_serializing_if = "String::is_empty")]
    pub privilege_key: String,
    #[serde(rename = "t", skip_serializing_if = "is_default")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pong {
    #[serde(rename = "g", skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// UDP endpoint in the shape peers already use on the wire (`{"IP":…,"Port":…}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpAddr {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Zone", skip_serializing_if = "String::is_empty")]
    pub zone: String,
}

impl From<std::net::SocketAddr> for UdpAddr {
    fn from(a: std::net::SocketAddr) -> Self {
        Self {
            ip: a.ip().to_string(),
            port: a.port(),
            zone: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpPacket {
    #[serde(rename = "c", skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(rename = "l", skip_serializing_if = "Option::is_none")]
    pub local_addr: Option<UdpAddr>,
    #[serde(rename = "r", skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<UdpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleVisitor {
    #[serde(rename = "tr_i", skip_serializing_if = "String::is_empty")]
    pub transaction_id: String,
    #[serde(rename = "pn", skip_serializing_if = "String::is_empty")]
    pub proxy_name: String,
    #[serde(rename = "p_c", skip_serializing_if = "is_false")]
    pub pre_check: bool,
    #[serde(rename = "pr", skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(rename = "s_k", skip_serializing_if = "String::is_empty")]
    pub sign_key: String,
    #[serde(rename = "t", skip_serializing_if = "is_default")]
    pub timestamp: i64,
    #[serde(rename = "m_a", skip_serializing_if = "Vec::is_empty")]
    pub mapped_addrs: Vec<String>,
    #[serde(rename = "a_a", skip_serializing_if = "Vec::is_empty")]
    pub assisted_addrs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleClient {
    #[serde(rename = "tr_i", skip_serializing_if = "String::is_empty")]
    pub transaction_id: String,
    #[serde(rename = "pn", skip_serializing_if = "String::is_empty")]
    pub proxy_name: String,
    #[serde(rename = "sid", skip_serializing_if = "String::is_empty")]
    pub sid: String,
    #[serde(rename = "m_a", skip_serializing_if = "Vec::is_empty")]
    pub mapped_addrs: Vec<String>,
    #[serde(rename = "a_a", skip_serializing_if = "Vec::is_empty")]
    pub assisted_addrs: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsRange {
    #[serde(skip_serializing_if = "is_default")]
    pub from: u16,
    #[serde(skip_serializing_if = "is_default")]
    pub to: u16,
}

pub const ROLE_SENDER: &str = "sender";
pub const ROLE_RECEIVER: &str = "receiver";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleDetectBehavior {
    /// `sender` or `receiver`.
    #[serde(rename = "rl", skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(rename = "md", skip_serializing_if = "is_default")]
    pub mode: u8,
    #[serde(rename = "ttl", skip_serializing_if = "is_default")]
    pub ttl: u32,
    #[serde(rename = "s_d_m", skip_serializing_if = "is_default")]
    pub send_delay_ms: u64,
    #[serde(rename = "r_t", skip_serializing_if = "is_default")]
    pub read_timeout_ms: u64,
    #[serde(rename = "c_p", skip_serializing_if = "Vec::is_empty")]
    pub candidate_ports: Vec<PortsRange>,
    #[serde(rename = "s_r_p", skip_serializing_if = "is_default")]
    pub send_random_ports: u32,
    #[serde(rename = "l_r_p", skip_serializing_if = "is_default")]
    pub listen_random_ports: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleResp {
    #[serde(rename = "tr_i", skip_serializing_if = "String::is_empty")]
    pub transaction_id: String,
    #[serde(rename = "sid", skip_serializing_if = "String::is_empty")]
    pub sid: String,
    #[serde(rename = "pr", skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(rename = "c_a", skip_serializing_if = "Vec::is_empty")]
    pub candidate_addrs: Vec<String>,
    #[serde(rename = "a_a", skip_serializing_if = "Vec::is_empty")]
    pub assisted_addrs: Vec<String>,
    #[serde(rename = "d_b", skip_serializing_if = "is_default")]
    pub detect_behavior: NatHoleDetectBehavior,
    #[serde(rename = "g", skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleSid {
    #[serde(rename = "tr_i", skip_serializing_if = "String::is_empty")]
    pub transaction_id: String,
    #[serde(rename = "sid", skip_serializing_if = "String::is_empty")]
    pub sid: String,
    #[serde(rename = "rsp", skip_serializing_if = "is_false")]
    pub response: bool,
    #[serde(rename = "nnc", skip_serializing_if = "String::is_empty")]
    pub nonce: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatHoleReport {
    #[serde(rename = "sid", skip_serializing_if = "String::is_empty")]
    pub sid: String,
    #[serde(rename = "suc", skip_serializing_if = "is_false")]
    pub success: bool,
}

/// Encodes a message into a complete frame (tag, length, body).
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let body = msg.body()?;
    let n = body.len() as u64;
    if n > MAX_MSG_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.push(msg.msg_type().tag());
    frame.extend_from_slice(&n.to_be_bytes());
    frame.extend(body);
    Ok(frame)
}

/// Decodes a message body for the given tag.
pub fn decode(tag: u8, body: &[u8]) -> Result<Message, ProtocolError> {
    let ty = MsgType::try_from(tag)?;
    Ok(Message::from_body(ty, body)?)
}

/// Decodes one frame held entirely in `buf`, e.g. a UDP datagram.
pub fn decode_datagram(buf: &[u8]) -> Result<Message, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated);
    }
    let mut len = [0u8; 8];
    len.copy_from_slice(&buf[1..HEADER_LEN]);
    let n = u64::from_be_bytes(len);
    if n > MAX_MSG_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let end = HEADER_LEN + n as usize;
    if buf.len() < end {
        return Err(ProtocolError::Truncated);
    }
    decode(buf[0], &buf[HEADER_LEN..end])
}

pub async fn write_msg<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<(), ProtocolError> {
    let frame = encode(msg)?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_msg<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, ProtocolError> {
    let tag = r.read_u8().await?;
    // Reject unknown tags before touching the body.
    let ty = MsgType::try_from(tag)?;
    let n = r.read_u64().await?;
    if n > MAX_MSG_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Ok(Message::from_body(ty, &buf)?)
}
