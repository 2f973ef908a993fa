//! NAT classification from reported addresses, and the per-side probing plan.

use std::{collections::BTreeSet, net::SocketAddr};

use crate::rtunnel::tunnel::msg::{NatHoleDetectBehavior, PortsRange, ROLE_RECEIVER, ROLE_SENDER};

const DEFAULT_READ_TIMEOUT_MS: u64 = 3000;
const HARD_READ_TIMEOUT_MS: u64 = 5000;
const RECEIVER_SEND_DELAY_MS: u64 = 20;
const LOW_TTL: u32 = 7;
const MIN_PORT_WINDOW: u16 = 10;
const MAX_PORT_WINDOW: u16 = 500;

/// Ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NatClass {
    Public,
    Easy,
    Hard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatFeature {
    pub class: NatClass,
    /// Difference between the largest and smallest observed mapped port.
    pub port_spread: u16,
    pub mapped_ports: Vec<u16>,
}

impl NatFeature {
    pub fn is_hard(&self) -> bool {
        self.class == NatClass::Hard
    }

    fn restrictiveness(&self) -> (NatClass, u16) {
        (self.class, self.port_spread)
    }
}

pub fn classify(mapped: &[String], assisted: &[String]) -> NatFeature {
    let mapped: Vec<SocketAddr> = mapped.iter().filter_map(|a| a.parse().ok()).collect();
    if mapped.is_empty() {
        return NatFeature {
            class: NatClass::Hard,
            port_spread: 0,
            mapped_ports: Vec::new(),
        };
    }

    let ports: BTreeSet<u16> = mapped.iter().map(|a| a.port()).collect();
    let lo = ports.first().copied().unwrap_or_default();
    let hi = ports.last().copied().unwrap_or_default();

    let local_ips: BTreeSet<_> = assisted
        .iter()
        .filter_map(|a| a.parse::<SocketAddr>().ok())
        .map(|a| a.ip())
        .collect();
    let public = mapped.iter().any(|a| local_ips.contains(&a.ip()));

    let class = if public {
        NatClass::Public
    } else if ports.len() == 1 {
        NatClass::Easy
    } else {
        NatClass::Hard
    };
    NatFeature {
        class,
        port_spread: hi - lo,
        mapped_ports: ports.into_iter().collect(),
    }
}

/// Probing instructions for both sides of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub mode: u8,
    pub visitor: NatHoleDetectBehavior,
    pub client: NatHoleDetectBehavior,
}

pub fn plan(visitor: &NatFeature, client: &NatFeature) -> Plan {
    let mode = match (visitor.is_hard(), client.is_hard()) {
        (false, false) => 0,
        (true, true) => 2,
        _ => 1,
    };

    // The more restrictive side waits for probes; on a tie the visitor sends.
    let client_receives = client.restrictiveness() >= visitor.restrictiveness();
    let (sender, receiver) = if client_receives {
        (visitor, client)
    } else {
        (client, visitor)
    };

    let sender_behavior = sender_behavior(mode, receiver);
    let receiver_behavior = receiver_behavior(mode, sender);
    let (visitor, client) = if client_receives {
        (sender_behavior, receiver_behavior)
    } else {
        (receiver_behavior, sender_behavior)
    };
    Plan {
        mode,
        visitor,
        client,
    }
}

fn sender_behavior(mode: u8, peer: &NatFeature) -> NatHoleDetectBehavior {
    let mut b = NatHoleDetectBehavior {
        role: ROLE_SENDER.into(),
        mode,
        read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
        ..Default::default()
    };
    match mode {
        0 => {}
        1 => {
            b.read_timeout_ms = HARD_READ_TIMEOUT_MS;
            b.candidate_ports = predicted_ranges(peer);
            b.send_random_ports = 256;
        }
        _ => {
            b.read_timeout_ms = HARD_READ_TIMEOUT_MS;
            b.candidate_ports = predicted_ranges(peer);
            b.send_random_ports = 512;
            b.listen_random_ports = 16;
        }
    }
    b
}

fn receiver_behavior(mode: u8, peer: &NatFeature) -> NatHoleDetectBehavior {
    let mut b = NatHoleDetectBehavior {
        role: ROLE_RECEIVER.into(),
        mode,
        send_delay_ms: RECEIVER_SEND_DELAY_MS,
        read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
        ..Default::default()
    };
    match mode {
        0 => {}
        1 => {
            b.read_timeout_ms = HARD_READ_TIMEOUT_MS;
            b.ttl = LOW_TTL;
            b.listen_random_ports = 64;
        }
        _ => {
            b.read_timeout_ms = HARD_READ_TIMEOUT_MS;
            b.ttl = LOW_TTL;
            b.listen_random_ports = 128;
            b.candidate_ports = predicted_ranges(peer);
        }
    }
    b
}

/// Port windows around each mapped port the peer has been seen on.
fn predicted_ranges(peer: &NatFeature) -> Vec<PortsRange> {
    let window = peer.port_spread.clamp(MIN_PORT_WINDOW, MAX_PORT_WINDOW);
    let mut out: Vec<PortsRange> = Vec::new();
    for &p in &peer.mapped_ports {
        let from = p.saturating_sub(window).max(1);
        let to = p.saturating_add(window);
        match out.last_mut() {
            Some(last) if from <= last.to => last.to = last.to.max(to),
            _ => out.push(PortsRange { from, to }),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn feature(class: NatClass, spread: u16) -> NatFeature {
        NatFeature {
            class,
            port_spread: spread,
            mapped_ports: vec![40000, 40000 + spread],
        }
    }

    #[test]
    fn classifies_by_mapped_ports() {
        let easy = classify(&addrs(&["1.2.3.4:5000", "1.2.3.4:5000"]), &addrs(&["10.0.0.2:5000"]));
        assert_eq!(easy.class, NatClass::Easy);
        assert_eq!(easy.port_spread, 0);

        let hard = classify(&addrs(&["1.2.3.4:5000", "1.2.3.4:5040"]), &[]);
        assert_eq!(hard.class, NatClass::Hard);
        assert_eq!(hard.port_spread, 40);

        let public = classify(&addrs(&["1.2.3.4:5000"]), &addrs(&["1.2.3.4:5000"]));
        assert_eq!(public.class, NatClass::Public);

        let unknown = classify(&addrs(&["not-an-addr"]), &[]);
        assert_eq!(unknown.class, NatClass::Hard);
    }

    #[test]
    fn modes_follow_hard_sides() {
        let easy = feature(NatClass::Easy, 0);
        let hard = feature(NatClass::Hard, 30);
        assert_eq!(plan(&easy, &easy).mode, 0);
        assert_eq!(plan(&hard, &easy).mode, 1);
        assert_eq!(plan(&easy, &hard).mode, 1);
        assert_eq!(plan(&hard, &hard).mode, 2);
    }

    #[test]
    fn restrictive_side_receives_and_tie_lets_visitor_send() {
        let easy = feature(NatClass::Easy, 0);
        let hard = feature(NatClass::Hard, 30);

        let p = plan(&hard, &easy);
        assert_eq!(p.visitor.role, ROLE_RECEIVER);
        assert_eq!(p.client.role, ROLE_SENDER);
        assert_eq!(p.visitor.ttl, LOW_TTL);
        assert!(p.visitor.listen_random_ports > 0);
        assert!(!p.client.candidate_ports.is_empty());

        let tie = plan(&easy, &easy);
        assert_eq!(tie.visitor.role, ROLE_SENDER);
        assert_eq!(tie.client.role, ROLE_RECEIVER);
    }

    #[test]
    fn every_pairing_has_one_sender_and_one_receiver() {
        let classes = [NatClass::Public, NatClass::Easy, NatClass::Hard];
        for &vc in &classes {
            for &cc in &classes {
                for vs in [0u16, 5, 300, 4000] {
                    for cs in [0u16, 5, 300, 4000] {
                        let p = plan(&feature(vc, vs), &feature(cc, cs));
                        let roles = [p.visitor.role.as_str(), p.client.role.as_str()];
                        assert_eq!(
                            roles.iter().filter(|r| **r == ROLE_SENDER).count(),
                            1,
                            "{vc:?}/{vs} vs {cc:?}/{cs}"
                        );
                        assert!(roles.contains(&ROLE_RECEIVER));
                        assert_eq!(p.visitor.mode, p.client.mode);
                    }
                }
            }
        }
    }

    #[test]
    fn predicted_ranges_merge_and_clamp() {
        let f = NatFeature {
            class: NatClass::Hard,
            port_spread: 4,
            mapped_ports: vec![5, 12, 60000],
        };
        let r = predicted_ranges(&f);
        assert_eq!(
            r,
            vec![
                PortsRange { from: 1, to: 22 },
                PortsRange { from: 59990, to: 60010 },
            ]
        );
    }
}
