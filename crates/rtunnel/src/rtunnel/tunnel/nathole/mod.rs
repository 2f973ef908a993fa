//! Relay-side coordination of UDP hole punching between a visitor and a proxy owner.
//!
//! Attempts are keyed by transaction id on arrival and by sid once paired. At most one
//! unresolved attempt exists per proxy; a newer visitor request supersedes the older one.

pub mod analysis;
pub mod punch;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use rand::{RngExt, rng};
use tokio::{
    sync::{broadcast, oneshot},
    time::Instant,
};

use crate::rtunnel::tunnel::{
    auth::{self, AuthError},
    msg::{NatHoleClient, NatHoleReport, NatHoleResp, NatHoleVisitor},
    registry::ProxyType,
    server::{Control, RelayShared},
    session::SessionState,
};

pub use punch::HolePunchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchState {
    Requested,
    Paired,
    ExchangingCandidates,
    Probing,
    Resolved(Outcome),
}

impl PunchState {
    pub fn can_transition(self, next: PunchState) -> bool {
        use PunchState::*;
        match (self, next) {
            (Resolved(_), _) => false,
            (_, Resolved(_)) => true,
            (Requested, Paired) | (Paired, ExchangingCandidates) | (ExchangingCandidates, Probing) => true,
            _ => false,
        }
    }
}

/// Published once per attempt when it resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatHoleEvent {
    pub sid: String,
    pub transaction_id: String,
    pub proxy_name: String,
    pub outcome: Outcome,
    pub reason: String,
}

struct Attempt {
    transaction_id: String,
    proxy_name: String,
    visitor_run_id: String,
    client_run_id: String,
    state: PunchState,
    client_reply: Option<oneshot::Sender<NatHoleClient>>,
}

impl Attempt {
    fn advance(&mut self, next: PunchState) -> bool {
        if self.state.can_transition(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct Table {
    by_sid: HashMap<String, Attempt>,
    by_txn: HashMap<String, String>,
    by_proxy: HashMap<String, String>,
}

impl Table {
    fn remove(&mut self, sid: &str) -> Option<Attempt> {
        let a = self.by_sid.remove(sid)?;
        if self.by_txn.get(&a.transaction_id).is_some_and(|s| s == sid) {
            self.by_txn.remove(&a.transaction_id);
        }
        if self.by_proxy.get(&a.proxy_name).is_some_and(|s| s == sid) {
            self.by_proxy.remove(&a.proxy_name);
        }
        Some(a)
    }
}

pub struct NatHoleController {
    timeout: Duration,
    table: Mutex<Table>,
    events: broadcast::Sender<NatHoleEvent>,
}

impl NatHoleController {
    pub fn new(timeout: Duration) -> Self {
        let (events, _rx) = broadcast::channel(256);
        Self {
            timeout,
            table: Mutex::new(Table::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NatHoleEvent> {
        self.events.subscribe()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().by_sid.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs one visitor request to completion: validation, pairing with the proxy
    /// owner, and delivery of a probing plan to both sides.
    pub async fn handle_visitor(self: &Arc<Self>, shared: &RelayShared, visitor: &Control, m: NatHoleVisitor) {
        let reply_error = |error: String| NatHoleResp {
            transaction_id: m.transaction_id.clone(),
            error,
            ..Default::default()
        };

        let client = match self.validate(shared, visitor, &m).await {
            Ok(c) => c,
            Err(reason) => {
                tracing::warn!(run_id = %visitor.run_id(), proxy = %m.proxy_name, err = %reason, "tunnel: nat hole request rejected");
                let _ = visitor.writer().send(reply_error(reason)).await;
                return;
            }
        };
        if m.pre_check {
            let _ = visitor
                .writer()
                .send(NatHoleResp {
                    transaction_id: m.transaction_id.clone(),
                    ..Default::default()
                })
                .await;
            return;
        }
        if m.transaction_id.is_empty() {
            let _ = visitor.writer().send(reply_error("empty transaction id".into())).await;
            return;
        }

        let deadline = Instant::now() + self.timeout;
        let sid = new_sid();
        let (reply_tx, reply_rx) = oneshot::channel();
        let registered = {
            let mut t = self.lock();
            if t.by_txn.contains_key(&m.transaction_id) {
                Err(format!("transaction [{}] already in progress", m.transaction_id))
            } else {
                let superseded = t
                    .by_proxy
                    .get(&m.proxy_name)
                    .cloned()
                    .and_then(|old| t.remove(&old).map(|a| (old, a)));
                let mut attempt = Attempt {
                    transaction_id: m.transaction_id.clone(),
                    proxy_name: m.proxy_name.clone(),
                    visitor_run_id: visitor.run_id().to_string(),
                    client_run_id: client.run_id().to_string(),
                    state: PunchState::Requested,
                    client_reply: Some(reply_tx),
                };
                attempt.advance(PunchState::Paired);
                t.by_txn.insert(m.transaction_id.clone(), sid.clone());
                t.by_proxy.insert(m.proxy_name.clone(), sid.clone());
                t.by_sid.insert(sid.clone(), attempt);
                Ok(superseded)
            }
        };
        match registered {
            Ok(Some((old_sid, old))) => {
                self.publish(old_sid, old, Outcome::Failed, &HolePunchError::Superseded.to_string())
            }
            Ok(None) => {}
            Err(reason) => {
                let _ = visitor.writer().send(reply_error(reason)).await;
                return;
            }
        }
        self.spawn_purge(sid.clone(), deadline);

        tracing::info!(
            sid = %sid,
            txn = %m.transaction_id,
            proxy = %m.proxy_name,
            visitor = %visitor.run_id(),
            client = %client.run_id(),
            "tunnel: nat hole attempt paired"
        );

        let ask = NatHoleClient {
            transaction_id: m.transaction_id.clone(),
            proxy_name: m.proxy_name.clone(),
            sid: sid.clone(),
            mapped_addrs: m.mapped_addrs.clone(),
            assisted_addrs: m.assisted_addrs.clone(),
        };
        if client.writer().send(ask).await.is_err() {
            self.resolve(&sid, Outcome::Failed, "client session closed");
            let _ = visitor.writer().send(reply_error(HolePunchError::SessionClosed.to_string())).await;
            return;
        }

        let answer = match tokio::time::timeout_at(deadline, reply_rx).await {
            Ok(Ok(c)) => c,
            Ok(Err(_)) => {
                // Attempt was resolved elsewhere (superseded or session drained).
                let _ = visitor.writer().send(reply_error("hole punch attempt cancelled".into())).await;
                return;
            }
            Err(_) => {
                self.resolve(&sid, Outcome::Failed, "timeout waiting for client");
                let _ = visitor.writer().send(reply_error(HolePunchError::Timeout.to_string())).await;
                return;
            }
        };

        if !self.advance(&sid, PunchState::ExchangingCandidates) {
            return;
        }
        let vf = analysis::classify(&m.mapped_addrs, &m.assisted_addrs);
        let cf = analysis::classify(&answer.mapped_addrs, &answer.assisted_addrs);
        let plan = analysis::plan(&vf, &cf);
        tracing::debug!(
            sid = %sid,
            mode = plan.mode,
            visitor_nat = ?vf.class,
            client_nat = ?cf.class,
            "tunnel: nat hole plan"
        );

        let to_visitor = NatHoleResp {
            transaction_id: m.transaction_id.clone(),
            sid: sid.clone(),
            protocol: m.protocol.clone(),
            candidate_addrs: answer.mapped_addrs.clone(),
            assisted_addrs: answer.assisted_addrs.clone(),
            detect_behavior: plan.visitor,
            error: String::new(),
        };
        let to_client = NatHoleResp {
            transaction_id: m.transaction_id.clone(),
            sid: sid.clone(),
            protocol: m.protocol.clone(),
            candidate_addrs: m.mapped_addrs.clone(),
            assisted_addrs: m.assisted_addrs.clone(),
            detect_behavior: plan.client,
            error: String::new(),
        };
        let (a, b) = tokio::join!(visitor.writer().send(to_visitor), client.writer().send(to_client));
        if a.is_err() || b.is_err() {
            self.resolve(&sid, Outcome::Failed, "session closed during exchange");
            return;
        }
        self.advance(&sid, PunchState::Probing);
    }

    async fn validate(&self, shared: &RelayShared, visitor: &Control, m: &NatHoleVisitor) -> Result<Arc<Control>, String> {
        let not_found = || "proxy not found".to_string();
        let entry = shared.proxies.get(&m.proxy_name).await.ok_or_else(not_found)?;
        if entry.proxy_type != ProxyType::Xtcp {
            return Err(format!("proxy [{}] is not an xtcp proxy", m.proxy_name));
        }
        let client = shared
            .sessions
            .get(&entry.run_id)
            .filter(|c| c.state() == SessionState::Active)
            .ok_or_else(not_found)?;

        auth::verify_key(
            &entry.msg.sk,
            &m.sign_key,
            m.timestamp,
            auth::now_unix(),
            shared.opts.replay_window,
        )
        .map_err(|e| match e {
            AuthError::BadKey => "invalid sign key".to_string(),
            other => other.to_string(),
        })?;
        auth::check_allow_users(&entry.user, &entry.msg.allow_users, visitor.user()).map_err(|e| e.to_string())?;
        Ok(client)
    }

    /// The owning client's answer to NatHoleClient, carrying its own addresses.
    pub fn handle_client(&self, run_id: &str, m: NatHoleClient) {
        let tx = {
            let mut t = self.lock();
            match t.by_sid.get_mut(&m.sid) {
                Some(a) if a.client_run_id == run_id && a.transaction_id == m.transaction_id => a.client_reply.take(),
                _ => None,
            }
        };
        match tx {
            Some(tx) => {
                let _ = tx.send(m);
            }
            None => tracing::debug!(run_id = %run_id, sid = %m.sid, "tunnel: nat hole answer for unknown attempt"),
        }
    }

    pub fn handle_report(&self, run_id: &str, m: NatHoleReport) {
        let known = {
            let t = self.lock();
            t.by_sid
                .get(&m.sid)
                .is_some_and(|a| a.visitor_run_id == run_id || a.client_run_id == run_id)
        };
        if !known {
            tracing::debug!(run_id = %run_id, sid = %m.sid, "tunnel: nat hole report for unknown attempt");
            return;
        }
        let outcome = if m.success { Outcome::Success } else { Outcome::Failed };
        self.resolve(&m.sid, outcome, "reported by peer");
    }

    /// Fails every attempt that involves `run_id`.
    pub fn cancel_run(&self, run_id: &str) -> usize {
        let sids: Vec<String> = {
            let t = self.lock();
            t.by_sid
                .iter()
                .filter(|(_, a)| a.visitor_run_id == run_id || a.client_run_id == run_id)
                .map(|(sid, _)| sid.clone())
                .collect()
        };
        sids.iter()
            .filter(|sid| self.resolve(sid, Outcome::Failed, "session closed"))
            .count()
    }

    fn advance(&self, sid: &str, next: PunchState) -> bool {
        self.lock().by_sid.get_mut(sid).is_some_and(|a| a.advance(next))
    }

    fn resolve(&self, sid: &str, outcome: Outcome, reason: &str) -> bool {
        let Some(a) = self.lock().remove(sid) else {
            return false;
        };
        self.publish(sid.to_string(), a, outcome, reason);
        true
    }

    fn publish(&self, sid: String, mut a: Attempt, outcome: Outcome, reason: &str) {
        a.advance(PunchState::Resolved(outcome));
        metrics::counter!("rtunnel_nathole_attempts_total", "outcome" => outcome.as_str()).increment(1);
        tracing::info!(sid = %sid, proxy = %a.proxy_name, outcome = outcome.as_str(), reason = %reason, "tunnel: nat hole attempt resolved");
        let _ = self.events.send(NatHoleEvent {
            sid,
            transaction_id: a.transaction_id,
            proxy_name: a.proxy_name,
            outcome,
            reason: reason.to_string(),
        });
    }

    fn spawn_purge(self: &Arc<Self>, sid: String, deadline: Instant) {
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(this) = this.upgrade() {
                this.resolve(&sid, Outcome::Failed, "timeout");
            }
        });
    }
}

fn new_sid() -> String {
    let n: u64 = rng().random();
    format!("{}{n:016x}", auth::now_unix())
}
