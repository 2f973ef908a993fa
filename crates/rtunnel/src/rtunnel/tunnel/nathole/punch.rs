//! Peer-side UDP probing for one negotiated hole-punch attempt.

use std::{
    collections::BTreeSet,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use rand::{RngExt, rng};
use thiserror::Error;
use tokio::{net::UdpSocket, task::JoinSet};

use crate::rtunnel::tunnel::msg::{self, Message, NatHoleResp, NatHoleSid};

const DEFAULT_RANDOM_PORTS: usize = 256;
const MAX_PROBE_TARGETS: usize = 2048;
const MAX_EXTRA_SOCKETS: usize = 256;
const DEFAULT_TTL: u32 = 64;
const RESEND_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum HolePunchError {
    #[error("{0}")]
    Rejected(String),
    #[error("no candidate address to probe")]
    NoCandidates,
    #[error("no viable pairing")]
    NoPairing,
    #[error("timeout waiting for peer probe")]
    Timeout,
    #[error("superseded by a newer attempt")]
    Superseded,
    #[error("session closed")]
    SessionClosed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A UDP path that has seen traffic in both directions.
#[derive(Debug)]
pub struct Punched {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
}

/// Probes the peer described by `resp` from `primary` (plus any extra sockets the
/// detect behavior asks for) until one probe is acknowledged.
pub async fn punch(primary: UdpSocket, resp: &NatHoleResp) -> Result<Punched, HolePunchError> {
    if !resp.error.is_empty() {
        return Err(HolePunchError::Rejected(resp.error.clone()));
    }
    let behavior = &resp.detect_behavior;
    let targets = Arc::new(probe_targets(resp));
    if targets.is_empty() {
        return Err(HolePunchError::NoCandidates);
    }

    let mut sockets = vec![Arc::new(primary)];
    let extra = (behavior.listen_random_ports as usize).min(MAX_EXTRA_SOCKETS);
    if extra > 0 {
        let ip = sockets[0].local_addr()?.ip();
        for _ in 0..extra {
            match UdpSocket::bind(SocketAddr::new(ip, 0)).await {
                Ok(s) => sockets.push(Arc::new(s)),
                Err(err) => {
                    tracing::debug!(err = %err, "tunnel: extra probe socket bind failed");
                    break;
                }
            }
        }
    }

    let probe = Arc::new(Probe {
        transaction_id: resp.transaction_id.clone(),
        sid: resp.sid.clone(),
        nonce: new_nonce(),
        ttl: behavior.ttl,
        send_delay: Duration::from_millis(behavior.send_delay_ms),
    });
    let read_timeout = match behavior.read_timeout_ms {
        0 => Duration::from_secs(3),
        ms => Duration::from_millis(ms),
    };

    let mut set = JoinSet::new();
    for sock in sockets {
        let probe = probe.clone();
        let targets = targets.clone();
        set.spawn(async move { probe.run(sock, &targets).await });
    }

    let res = tokio::time::timeout(read_timeout, async {
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(p)) => return Ok(p),
                Ok(Err(err)) => tracing::debug!(err = %err, "tunnel: probe socket failed"),
                Err(err) => tracing::debug!(err = %err, "tunnel: probe task failed"),
            }
        }
        Err(HolePunchError::NoPairing)
    })
    .await
    .unwrap_or(Err(HolePunchError::Timeout));
    set.abort_all();

    if let Ok(p) = &res {
        tracing::info!(sid = %resp.sid, peer = %p.peer, "tunnel: hole punched");
    }
    res
}

struct Probe {
    transaction_id: String,
    sid: String,
    nonce: String,
    ttl: u32,
    send_delay: Duration,
}

impl Probe {
    fn frame(&self, response: bool, nonce: &str) -> Result<Vec<u8>, msg::ProtocolError> {
        msg::encode(&Message::NatHoleSid(NatHoleSid {
            transaction_id: self.transaction_id.clone(),
            sid: self.sid.clone(),
            response,
            nonce: nonce.to_string(),
        }))
    }

    async fn spray(&self, sock: &UdpSocket, targets: &[SocketAddr], frame: &[u8]) {
        for t in targets {
            if let Err(err) = sock.send_to(frame, t).await {
                tracing::trace!(target = %t, err = %err, "tunnel: probe send failed");
            }
        }
    }

    async fn run(&self, sock: Arc<UdpSocket>, targets: &[SocketAddr]) -> Result<Punched, HolePunchError> {
        let probe = self.frame(false, &self.nonce).map_err(std::io::Error::other)?;

        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        if self.ttl > 0 {
            // Opens our own mapping without letting the packet reach the peer's NAT.
            sock.set_ttl(self.ttl)?;
            self.spray(&sock, targets, &probe).await;
            sock.set_ttl(DEFAULT_TTL)?;
        } else {
            self.spray(&sock, targets, &probe).await;
        }

        let mut resend = tokio::time::interval(RESEND_INTERVAL);
        resend.tick().await;
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                _ = resend.tick() => {
                    if self.ttl == 0 {
                        self.spray(&sock, targets, &probe).await;
                    }
                }
                got = sock.recv_from(&mut buf) => {
                    let (n, from) = got?;
                    let Ok(Message::NatHoleSid(m)) = msg::decode_datagram(&buf[..n]) else {
                        continue;
                    };
                    if m.sid != self.sid || m.transaction_id != self.transaction_id {
                        continue;
                    }
                    if !m.response {
                        let ack = self.frame(true, &m.nonce).map_err(std::io::Error::other)?;
                        sock.send_to(&ack, from).await?;
                        return Ok(Punched { socket: sock, peer: from });
                    }
                    if m.nonce == self.nonce {
                        return Ok(Punched { socket: sock, peer: from });
                    }
                }
            }
        }
    }
}

fn new_nonce() -> String {
    let n: u128 = rng().random();
    format!("{n:032x}")
}

/// Explicit candidate addresses first, then sampled ports from the predicted ranges
/// on each candidate IP.
fn probe_targets(resp: &NatHoleResp) -> Vec<SocketAddr> {
    let mut out: Vec<SocketAddr> = Vec::new();
    let mut seen = BTreeSet::new();
    for a in resp.candidate_addrs.iter().chain(resp.assisted_addrs.iter()) {
        if let Ok(addr) = a.parse::<SocketAddr>() {
            if seen.insert(addr) {
                out.push(addr);
            }
        }
    }

    let behavior = &resp.detect_behavior;
    if behavior.candidate_ports.is_empty() {
        return out;
    }
    let ips: BTreeSet<IpAddr> = resp
        .candidate_addrs
        .iter()
        .filter_map(|a| a.parse::<SocketAddr>().ok())
        .map(|a| a.ip())
        .collect();
    let budget = match behavior.send_random_ports as usize {
        0 => DEFAULT_RANDOM_PORTS,
        n => n,
    };

    let mut ports: Vec<u16> = behavior
        .candidate_ports
        .iter()
        .filter(|r| r.from <= r.to)
        .flat_map(|r| r.from..=r.to)
        .collect();
    ports.sort_unstable();
    ports.dedup();
    if ports.len() > budget {
        let mut r = rng();
        for i in 0..budget {
            let j = r.random_range(i..ports.len());
            ports.swap(i, j);
        }
        ports.truncate(budget);
    }

    for ip in ips {
        for &p in &ports {
            if out.len() >= MAX_PROBE_TARGETS {
                return out;
            }
            let addr = SocketAddr::new(ip, p);
            if seen.insert(addr) {
                out.push(addr);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtunnel::tunnel::msg::{NatHoleDetectBehavior, PortsRange, ROLE_RECEIVER, ROLE_SENDER};

    fn resp(peer: SocketAddr, role: &str) -> NatHoleResp {
        NatHoleResp {
            transaction_id: "t1".into(),
            sid: "s1".into(),
            protocol: "quic".into(),
            candidate_addrs: vec![peer.to_string()],
            detect_behavior: NatHoleDetectBehavior {
                role: role.into(),
                read_timeout_ms: 3000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn loopback_peers_punch_each_other() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let ra = resp(b_addr, ROLE_SENDER);
        let rb = resp(a_addr, ROLE_RECEIVER);
        let (pa, pb) = tokio::join!(punch(a, &ra), punch(b, &rb));
        let (pa, pb) = (pa.unwrap(), pb.unwrap());
        assert_eq!(pa.peer, b_addr);
        assert_eq!(pb.peer, a_addr);
    }

    #[tokio::test]
    async fn foreign_sid_is_ignored_until_timeout() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();

        let mut r = resp(b.local_addr().unwrap(), ROLE_SENDER);
        r.detect_behavior.read_timeout_ms = 400;
        let stranger = tokio::spawn(async move {
            let frame = msg::encode(&Message::NatHoleSid(NatHoleSid {
                transaction_id: "t1".into(),
                sid: "other".into(),
                response: false,
                nonce: "x".into(),
            }))
            .unwrap();
            b.send_to(&frame, a_addr).await.unwrap();
            b
        });
        assert!(matches!(punch(a, &r).await, Err(HolePunchError::Timeout)));
        drop(stranger.await.unwrap());
    }

    #[tokio::test]
    async fn relay_error_is_surfaced() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let r = NatHoleResp {
            error: "proxy not found".into(),
            ..Default::default()
        };
        match punch(a, &r).await {
            Err(HolePunchError::Rejected(e)) => assert_eq!(e, "proxy not found"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn targets_sample_predicted_ports_within_budget() {
        let r = NatHoleResp {
            candidate_addrs: vec!["198.51.100.4:40000".into()],
            detect_behavior: NatHoleDetectBehavior {
                candidate_ports: vec![PortsRange { from: 39000, to: 41000 }],
                send_random_ports: 100,
                ..Default::default()
            },
            ..Default::default()
        };
        let t = probe_targets(&r);
        assert_eq!(t[0], "198.51.100.4:40000".parse::<SocketAddr>().unwrap());
        assert!(t.len() <= 101);
        assert!(t.len() >= 100);
        assert!(t.iter().all(|a| (39000..=41000).contains(&a.port())));
    }
}
