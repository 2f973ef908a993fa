use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use dashmap::DashMap;
use rand::{RngExt, rng};
use tokio::{
    sync::{Mutex, broadcast, mpsc, watch},
    task::JoinSet,
};

use crate::rtunnel::net;
use crate::rtunnel::tunnel::{
    auth::{Authenticator, TokenAuth},
    broker::{self, BrokerError, WorkConnPool},
    msg::{self, CloseProxy, Login, LoginResp, Message, NewProxy, NewProxyResp, Ping, PortsRange, Pong},
    nathole::{NatHoleController, NatHoleEvent},
    registry::{ProxyRegistry, ProxyType},
    session::{self, ControlWriter, SessionError, SessionState, StateCell},
    transport::{BoxedStream, Listener, TcpTransportListener},
    visitor,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const DRAIN_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub bind_addr: String,
    pub auth_token: String,
    pub replay_window: Duration,
    pub authenticate_heartbeats: bool,
    pub trust_client_spec: bool,
    pub heartbeat_timeout: Duration,
    pub first_msg_timeout: Duration,
    pub work_conn_timeout: Duration,
    pub nat_hole_timeout: Duration,
    pub max_pool_count: u32,
    pub allow_ports: Vec<PortsRange>,
    pub subdomain_host: String,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            bind_addr: ":7000".into(),
            auth_token: String::new(),
            replay_window: Duration::from_secs(15 * 60),
            authenticate_heartbeats: false,
            trust_client_spec: false,
            heartbeat_timeout: Duration::from_secs(90),
            first_msg_timeout: Duration::from_secs(10),
            work_conn_timeout: Duration::from_secs(10),
            nat_hole_timeout: Duration::from_secs(10),
            max_pool_count: 5,
            allow_ports: Vec::new(),
            subdomain_host: String::new(),
        }
    }
}

/// Relay-side state of one authenticated control channel.
pub struct Control {
    run_id: String,
    login: Login,
    writer: ControlWriter,
    state: StateCell,
    pub pool: WorkConnPool,
    last_ping: Mutex<Instant>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("run_id", &self.run_id)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl Control {
    pub fn new(
        run_id: impl Into<String>,
        login: Login,
        writer: ControlWriter,
        pool_capacity: usize,
        work_conn_wait: Duration,
    ) -> Self {
        let run_id = run_id.into();
        let (closed, _rx) = watch::channel(false);
        Self {
            pool: WorkConnPool::new(run_id.clone(), writer.clone(), pool_capacity, work_conn_wait),
            run_id,
            login,
            writer,
            state: StateCell::new(SessionState::Authenticating),
            last_ping: Mutex::new(Instant::now()),
            closed,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn user(&self) -> &str {
        &self.login.user
    }

    pub fn writer(&self) -> &ControlWriter {
        &self.writer
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    fn activate(&self) -> Result<(), SessionError> {
        self.state.transition(SessionState::Active).map(|_| ())
    }

    async fn touch(&self) {
        *self.last_ping.lock().await = Instant::now();
    }

    async fn since_last_ping(&self) -> Duration {
        self.last_ping.lock().await.elapsed()
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    /// Active -> Draining -> Closed: fails pending work-connection waits and hole-punch
    /// attempts, then drops the session's proxies. Safe to call more than once.
    pub async fn drain(&self, shared: &RelayShared) {
        if self.state() == SessionState::Closed {
            return;
        }
        let _ = self.state.transition(SessionState::Draining);

        let cancelled = self.pool.close().await;
        shared.nathole.cancel_run(&self.run_id);
        let proxies = shared.proxies.unregister_run(&self.run_id).await;

        let _ = self.state.transition(SessionState::Closed);
        let _ = self.closed.send(true);
        tracing::info!(
            run_id = %self.run_id,
            cancelled_requests = cancelled,
            proxies = proxies.len(),
            "tunnel: session closed"
        );
    }
}

/// RunID -> control session. Each entry has a single writer: whoever installs a
/// session for a RunID drains the one it replaced before activating its own.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Control>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<Control>> {
        self.sessions.get(run_id).map(|e| e.value().clone())
    }

    fn register(&self, ctl: Arc<Control>) -> Option<Arc<Control>> {
        self.sessions.insert(ctl.run_id.clone(), ctl)
    }

    pub fn remove_if_same(&self, ctl: &Arc<Control>) -> bool {
        self.sessions
            .remove_if(&ctl.run_id, |_, v| Arc::ptr_eq(v, ctl))
            .is_some()
    }
}

pub struct RelayShared {
    pub opts: RelayOptions,
    pub auth: Arc<dyn Authenticator>,
    pub sessions: SessionRegistry,
    pub proxies: ProxyRegistry,
    pub nathole: Arc<NatHoleController>,
}

impl RelayShared {
    pub fn new(opts: RelayOptions) -> Self {
        let auth = TokenAuth::new(opts.auth_token.clone(), opts.replay_window)
            .with_heartbeats(opts.authenticate_heartbeats)
            .with_trusted_client_spec(opts.trust_client_spec);
        Self {
            auth: Arc::new(auth),
            sessions: SessionRegistry::new(),
            proxies: ProxyRegistry::new(opts.allow_ports.clone(), opts.subdomain_host.clone()),
            nathole: Arc::new(NatHoleController::new(opts.nat_hole_timeout)),
            opts,
        }
    }

    /// Makes `ctl` the session for its RunID and activates it.
    pub async fn install(&self, ctl: Arc<Control>) -> Result<(), SessionError> {
        if let Some(old) = self.sessions.register(ctl.clone()) {
            if !Arc::ptr_eq(&old, &ctl) {
                tracing::info!(run_id = %ctl.run_id, "tunnel: replacing previous session for run id");
                old.drain(self).await;
            }
        }
        ctl.activate()
    }
}

pub struct Relay {
    shared: Arc<RelayShared>,
}

impl Relay {
    pub fn new(opts: RelayOptions) -> Self {
        Self {
            shared: Arc::new(RelayShared::new(opts)),
        }
    }

    pub fn shared(&self) -> Arc<RelayShared> {
        self.shared.clone()
    }

    pub fn subscribe_nat_events(&self) -> broadcast::Receiver<NatHoleEvent> {
        self.shared.nathole.subscribe()
    }

    /// Entry point for external traffic addressed to a registered proxy.
    pub async fn open_work_conn(
        &self,
        proxy_name: &str,
        src: Option<SocketAddr>,
        dst: Option<SocketAddr>,
    ) -> Result<BoxedStream, BrokerError> {
        broker::open_work_conn(&self.shared, proxy_name, src, dst).await
    }

    /// Like [`Relay::open_work_conn`], resolving the proxy from a vhost request.
    pub async fn open_work_conn_for_host(
        &self,
        kind: ProxyType,
        host: &str,
        path: &str,
        src: Option<SocketAddr>,
        dst: Option<SocketAddr>,
    ) -> Result<BoxedStream, BrokerError> {
        let entry = self
            .shared
            .proxies
            .find_by_host(kind, host, path)
            .await
            .ok_or_else(|| BrokerError::ProxyNotFound(host.to_string()))?;
        broker::open_work_conn(&self.shared, &entry.name, src, dst).await
    }

    pub async fn listen_and_serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = net::normalize_bind_addr(&self.shared.opts.bind_addr);
        let ln = TcpTransportListener::bind(&addr)
            .await
            .with_context(|| format!("tunnel: bind {addr}"))?;
        tracing::info!(addr = %addr, "tunnel: relay listening");
        self.serve(ln, shutdown).await
    }

    pub async fn serve<L: Listener>(
        &self,
        ln: L,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut conns = JoinSet::new();
        let res = loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                // Reap finished handlers so the set stays small.
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
                conn = ln.accept() => {
                    let (stream, remote) = match conn {
                        Ok(c) => c,
                        Err(err) => break Err(err),
                    };
                    let shared = self.shared.clone();
                    let shutdown = shutdown.clone();
                    conns.spawn(async move {
                        if let Err(err) = handle_conn(shared, stream, remote, shutdown).await {
                            tracing::warn!(err = %err, "tunnel: connection ended with error");
                        }
                    });
                }
            }
        };

        // Control sessions drain on the same signal; spliced pipes are cut after a grace period.
        let drain = async { while conns.join_next().await.is_some() {} };
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            conns.abort_all();
        }
        res
    }
}

pub fn new_run_id() -> String {
    let n: u64 = rng().random();
    format!("{n:016x}")
}

async fn handle_conn(
    shared: Arc<RelayShared>,
    mut stream: BoxedStream,
    remote: Option<SocketAddr>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let first = tokio::time::timeout(shared.opts.first_msg_timeout, msg::read_msg(&mut stream))
        .await
        .context("tunnel: timeout waiting for first message")??;

    match first {
        Message::Login(m) => run_control(shared, m, stream, remote, shutdown).await,
        Message::NewWorkConn(m) => {
            broker::handle_new_work_conn(&shared, m, stream, remote).await;
            Ok(())
        }
        Message::NewVisitorConn(m) => {
            visitor::handle_new_visitor_conn(&shared, m, stream).await;
            Ok(())
        }
        other => {
            tracing::warn!(msg = %other.msg_type(), remote = ?remote, "tunnel: unexpected first message");
            Ok(())
        }
    }
}

async fn run_control(
    shared: Arc<RelayShared>,
    login: Login,
    stream: BoxedStream,
    remote: Option<SocketAddr>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (mut rd, wr) = tokio::io::split(stream);
    let (writer, mut write_task) = session::spawn_writer(wr);

    let reject = |error: String| LoginResp {
        version: VERSION.into(),
        run_id: String::new(),
        error,
    };

    if let Err(err) = shared.auth.verify_login(&login) {
        tracing::warn!(remote = ?remote, user = %login.user, err = %err, "tunnel: login rejected");
        let _ = writer.send(reject(err.to_string())).await;
        drop(writer);
        let _ = tokio::time::timeout(Duration::from_secs(1), write_task).await;
        return Ok(());
    }

    let run_id = match login.run_id.trim() {
        "" => new_run_id(),
        prior => prior.to_string(),
    };
    let capacity = login.pool_count.min(shared.opts.max_pool_count) as usize;
    let hostname = login.hostname.clone();
    let ctl = Arc::new(Control::new(
        run_id.clone(),
        login,
        writer.clone(),
        capacity,
        shared.opts.work_conn_timeout,
    ));

    if let Err(err) = shared.install(ctl.clone()).await {
        shared.sessions.remove_if_same(&ctl);
        let _ = writer.send(reject(err.to_string())).await;
        drop(writer);
        drop(ctl);
        let _ = tokio::time::timeout(Duration::from_secs(1), write_task).await;
        return Ok(());
    }

    writer
        .send(LoginResp {
            version: VERSION.into(),
            run_id: run_id.clone(),
            error: String::new(),
        })
        .await?;
    drop(writer);

    metrics::gauge!("rtunnel_sessions_active").increment(1.0);
    tracing::info!(run_id = %run_id, remote = ?remote, hostname = %hostname, pool = capacity, "tunnel: client login");

    // Reads happen in their own task so the select below never cancels a partial frame.
    let (msg_tx, mut msg_rx) = mpsc::channel::<Result<Message, msg::ProtocolError>>(64);
    let reader = tokio::spawn(async move {
        loop {
            let res = msg::read_msg(&mut rd).await;
            let failed = res.is_err();
            if msg_tx.send(res).await.is_err() || failed {
                break;
            }
        }
    });

    let res = control_loop(&shared, &ctl, &mut msg_rx, shutdown).await;
    if let Err(err) = &res {
        tracing::warn!(run_id = %run_id, err = %err, "tunnel: control channel failed");
    }

    reader.abort();
    shared.sessions.remove_if_same(&ctl);
    ctl.drain(&shared).await;
    drop(ctl);
    metrics::gauge!("rtunnel_sessions_active").decrement(1.0);

    if tokio::time::timeout(Duration::from_secs(1), &mut write_task).await.is_err() {
        write_task.abort();
    }
    Ok(())
}

async fn control_loop(
    shared: &Arc<RelayShared>,
    ctl: &Arc<Control>,
    msgs: &mut mpsc::Receiver<Result<Message, msg::ProtocolError>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SessionError> {
    let hb = shared.opts.heartbeat_timeout;
    let mut check = tokio::time::interval((hb / 3).max(Duration::from_millis(100)));

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = ctl.wait_closed() => return Ok(()),
            _ = check.tick() => {
                if !hb.is_zero() && ctl.since_last_ping().await > hb {
                    return Err(SessionError::HeartbeatTimeout);
                }
            }
            m = msgs.recv() => {
                let Some(m) = m else { return Err(SessionError::ChannelClosed) };
                let m = m.map_err(|err| match err {
                    msg::ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => SessionError::ChannelClosed,
                    other => SessionError::Protocol(other),
                })?;
                dispatch(shared, ctl, m).await?;
            }
        }
    }
}

async fn dispatch(shared: &Arc<RelayShared>, ctl: &Arc<Control>, m: Message) -> Result<(), SessionError> {
    match m {
        Message::NewProxy(m) => handle_new_proxy(shared, ctl, m).await,
        Message::CloseProxy(m) => {
            handle_close_proxy(shared, ctl, m).await;
            Ok(())
        }
        Message::Ping(m) => handle_ping(shared, ctl, m).await,
        Message::NatHoleVisitor(m) => {
            let shared = shared.clone();
            let ctl = ctl.clone();
            tokio::spawn(async move {
                let nathole = shared.nathole.clone();
                nathole.handle_visitor(&shared, &ctl, m).await;
            });
            Ok(())
        }
        Message::NatHoleClient(m) => {
            shared.nathole.handle_client(ctl.run_id(), m);
            Ok(())
        }
        Message::NatHoleReport(m) => {
            shared.nathole.handle_report(ctl.run_id(), m);
            Ok(())
        }
        other => {
            tracing::warn!(run_id = %ctl.run_id(), msg = %other.msg_type(), "tunnel: unexpected message on control channel");
            Ok(())
        }
    }
}

async fn handle_new_proxy(shared: &RelayShared, ctl: &Control, m: NewProxy) -> Result<(), SessionError> {
    let resp = match shared.proxies.register(ctl.run_id(), ctl.user(), &m).await {
        Ok(entry) => {
            tracing::info!(
                run_id = %ctl.run_id(),
                proxy = %entry.name,
                kind = entry.proxy_type.as_str(),
                remote = %entry.remote_addr,
                "tunnel: proxy registered"
            );
            NewProxyResp {
                proxy_name: entry.name,
                remote_addr: entry.remote_addr,
                error: String::new(),
            }
        }
        Err(err) => {
            tracing::warn!(run_id = %ctl.run_id(), proxy = %m.proxy_name, err = %err, "tunnel: proxy rejected");
            NewProxyResp {
                proxy_name: m.proxy_name,
                remote_addr: String::new(),
                error: err.to_string(),
            }
        }
    };
    ctl.writer().send(resp).await
}

async fn handle_close_proxy(shared: &RelayShared, ctl: &Control, m: CloseProxy) {
    match shared.proxies.unregister(ctl.run_id(), &m.proxy_name).await {
        Some(entry) => tracing::info!(run_id = %ctl.run_id(), proxy = %entry.name, "tunnel: proxy closed"),
        None => tracing::debug!(run_id = %ctl.run_id(), proxy = %m.proxy_name, "tunnel: close for unknown proxy"),
    }
}

async fn handle_ping(shared: &RelayShared, ctl: &Control, m: Ping) -> Result<(), SessionError> {
    if let Err(err) = shared.auth.verify_ping(&m) {
        tracing::warn!(run_id = %ctl.run_id(), err = %err, "tunnel: heartbeat rejected");
        let reason = err.to_string();
        ctl.writer()
            .send(Pong {
                error: reason.clone(),
            })
            .await?;
        return Err(SessionError::ForcedClose(reason));
    }
    ctl.touch().await;
    ctl.writer().send(Pong::default()).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rtunnel::tunnel::{
        auth::{auth_key, now_unix},
        msg::{NewWorkConn, ReqWorkConn, StartWorkConn},
        transport::{Dialer, memory},
    };
    use tokio::io::AsyncReadExt;

    pub(crate) const TOKEN: &str = "secret-token";

    pub(crate) fn test_opts() -> RelayOptions {
        RelayOptions {
            auth_token: TOKEN.into(),
            work_conn_timeout: Duration::from_secs(2),
            nat_hole_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Installs an active session backed by a plain channel instead of a socket.
    pub(crate) async fn fake_session(
        shared: &RelayShared,
        run_id: &str,
        user: &str,
    ) -> (Arc<Control>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        let login = Login {
            user: user.into(),
            ..Default::default()
        };
        let ctl = Arc::new(Control::new(
            run_id,
            login,
            ControlWriter::new(tx),
            1,
            shared.opts.work_conn_timeout,
        ));
        shared.install(ctl.clone()).await.unwrap();
        (ctl, rx)
    }

    fn login(run_id: &str, ts: i64) -> Message {
        Login {
            version: VERSION.into(),
            hostname: "edge".into(),
            privilege_key: auth_key(TOKEN, ts),
            timestamp: ts,
            run_id: run_id.into(),
            ..Default::default()
        }
        .into()
    }

    struct Harness {
        relay: Arc<Relay>,
        dialer: memory::MemoryDialer,
        _stop: watch::Sender<bool>,
    }

    fn start_relay(opts: RelayOptions) -> Harness {
        let (ln, dialer) = memory::pair();
        let relay = Arc::new(Relay::new(opts));
        let (stop, stop_rx) = watch::channel(false);
        let r = relay.clone();
        tokio::spawn(async move { r.serve(ln, stop_rx).await });
        Harness {
            relay,
            dialer,
            _stop: stop,
        }
    }

    #[tokio::test]
    async fn login_register_and_broker_scenario() {
        let h = start_relay(test_opts());

        let mut ctl = h.dialer.dial().await.unwrap();
        msg::write_msg(&mut ctl, &login("", now_unix())).await.unwrap();
        let Message::LoginResp(resp) = msg::read_msg(&mut ctl).await.unwrap() else {
            panic!("expected LoginResp");
        };
        assert!(resp.error.is_empty(), "{}", resp.error);
        assert!(!resp.run_id.is_empty());
        let run_id = resp.run_id;

        let np: Message = NewProxy {
            proxy_name: "web1".into(),
            proxy_type: "http".into(),
            custom_domains: vec!["a.example.com".into()],
            ..Default::default()
        }
        .into();
        msg::write_msg(&mut ctl, &np).await.unwrap();
        let Message::NewProxyResp(resp) = msg::read_msg(&mut ctl).await.unwrap() else {
            panic!("expected NewProxyResp");
        };
        assert_eq!(resp.proxy_name, "web1");
        assert_eq!(resp.error, "");

        // Duplicate registration is refused and the original stays routable.
        msg::write_msg(&mut ctl, &np).await.unwrap();
        let Message::NewProxyResp(dup) = msg::read_msg(&mut ctl).await.unwrap() else {
            panic!("expected NewProxyResp");
        };
        assert!(!dup.error.is_empty());

        let relay = h.relay.clone();
        let external = tokio::spawn(async move {
            let src: SocketAddr = "203.0.113.7:50000".parse().unwrap();
            relay
                .open_work_conn_for_host(ProxyType::Http, "a.example.com", "/", Some(src), None)
                .await
        });

        assert_eq!(
            msg::read_msg(&mut ctl).await.unwrap(),
            Message::ReqWorkConn(ReqWorkConn {})
        );

        let mut work = h.dialer.dial().await.unwrap();
        let ts = now_unix();
        let nwc: Message = NewWorkConn {
            run_id: run_id.clone(),
            privilege_key: auth_key(TOKEN, ts),
            timestamp: ts,
        }
        .into();
        msg::write_msg(&mut work, &nwc).await.unwrap();

        let Message::StartWorkConn(start) = msg::read_msg(&mut work).await.unwrap() else {
            panic!("expected StartWorkConn");
        };
        assert_eq!(start.proxy_name, "web1");
        assert_eq!(start.error, "");
        assert_eq!(start.src_addr, "203.0.113.7");
        assert_eq!(start.src_port, 50000);

        // The relay's end is now a raw pipe.
        let mut pipe = external.await.unwrap().unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut work, b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        pipe.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn expired_login_never_becomes_active() {
        let h = start_relay(test_opts());
        let mut ctl = h.dialer.dial().await.unwrap();
        msg::write_msg(&mut ctl, &login("R9", now_unix() - 24 * 3600)).await.unwrap();
        let Message::LoginResp(resp) = msg::read_msg(&mut ctl).await.unwrap() else {
            panic!("expected LoginResp");
        };
        assert!(!resp.error.is_empty());
        assert!(resp.run_id.is_empty());
        assert!(h.relay.shared().sessions.get("R9").is_none());
    }

    #[tokio::test]
    async fn work_conn_with_bad_key_is_refused() {
        let h = start_relay(test_opts());
        let mut work = h.dialer.dial().await.unwrap();
        let nwc: Message = NewWorkConn {
            run_id: "R1".into(),
            privilege_key: "forged".into(),
            timestamp: now_unix(),
        }
        .into();
        msg::write_msg(&mut work, &nwc).await.unwrap();
        let Message::StartWorkConn(StartWorkConn { error, .. }) = msg::read_msg(&mut work).await.unwrap() else {
            panic!("expected StartWorkConn");
        };
        assert!(!error.is_empty());
    }

    #[tokio::test]
    async fn work_conn_before_login_is_refused() {
        let h = start_relay(test_opts());
        let mut work = h.dialer.dial().await.unwrap();
        let ts = now_unix();
        let nwc: Message = NewWorkConn {
            run_id: "never-logged-in".into(),
            privilege_key: auth_key(TOKEN, ts),
            timestamp: ts,
        }
        .into();
        msg::write_msg(&mut work, &nwc).await.unwrap();
        let Message::StartWorkConn(start) = msg::read_msg(&mut work).await.unwrap() else {
            panic!("expected StartWorkConn");
        };
        assert!(start.error.contains("never-logged-in"));
    }

    #[tokio::test]
    async fn concurrent_logins_leave_one_active_session() {
        let shared = Arc::new(RelayShared::new(test_opts()));
        let mut handles = Vec::new();
        let mut ctls = Vec::new();
        for _ in 0..8 {
            let (tx, _rx) = mpsc::channel(8);
            let ctl = Arc::new(Control::new("R1", Login::default(), ControlWriter::new(tx), 0, Duration::from_secs(1)));
            ctls.push(ctl.clone());
            let shared = shared.clone();
            handles.push(tokio::spawn(async move { shared.install(ctl).await.is_ok() }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let active: Vec<_> = ctls.iter().filter(|c| c.state() == SessionState::Active).collect();
        assert_eq!(active.len(), 1);
        let current = shared.sessions.get("R1").unwrap();
        assert!(Arc::ptr_eq(&current, active[0]));
    }

    #[tokio::test]
    async fn resumed_run_id_replaces_old_session() {
        let h = start_relay(test_opts());

        let mut first = h.dialer.dial().await.unwrap();
        msg::write_msg(&mut first, &login("R1", now_unix())).await.unwrap();
        assert!(matches!(msg::read_msg(&mut first).await.unwrap(), Message::LoginResp(r) if r.run_id == "R1"));

        let mut second = h.dialer.dial().await.unwrap();
        msg::write_msg(&mut second, &login("R1", now_unix())).await.unwrap();
        assert!(matches!(msg::read_msg(&mut second).await.unwrap(), Message::LoginResp(r) if r.error.is_empty()));

        // The first channel is closed by the relay.
        assert!(msg::read_msg(&mut first).await.is_err());
        assert_eq!(h.relay.shared().sessions.get("R1").unwrap().state(), SessionState::Active);
    }

    #[tokio::test]
    async fn ping_gets_pong_and_bad_heartbeat_closes() {
        let mut opts = test_opts();
        opts.authenticate_heartbeats = true;
        let h = start_relay(opts);

        let mut ctl = h.dialer.dial().await.unwrap();
        msg::write_msg(&mut ctl, &login("", now_unix())).await.unwrap();
        let Message::LoginResp(resp) = msg::read_msg(&mut ctl).await.unwrap() else {
            panic!("expected LoginResp");
        };

        let ts = now_unix();
        let ping: Message = Ping {
            privilege_key: auth_key(TOKEN, ts),
            timestamp: ts,
        }
        .into();
        msg::write_msg(&mut ctl, &ping).await.unwrap();
        assert_eq!(msg::read_msg(&mut ctl).await.unwrap(), Message::Pong(Pong::default()));

        let bad: Message = Ping {
            privilege_key: "nope".into(),
            timestamp: ts,
        }
        .into();
        msg::write_msg(&mut ctl, &bad).await.unwrap();
        let Message::Pong(pong) = msg::read_msg(&mut ctl).await.unwrap() else {
            panic!("expected Pong");
        };
        assert!(!pong.error.is_empty());
        assert!(msg::read_msg(&mut ctl).await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.relay.shared().sessions.get(&resp.run_id).is_none());
    }

    #[tokio::test]
    async fn out_of_range_heartbeat_timestamp_closes_cleanly() {
        let mut opts = test_opts();
        opts.authenticate_heartbeats = true;
        let h = start_relay(opts);

        let mut ctl = h.dialer.dial().await.unwrap();
        msg::write_msg(&mut ctl, &login("", now_unix())).await.unwrap();
        let Message::LoginResp(resp) = msg::read_msg(&mut ctl).await.unwrap() else {
            panic!("expected LoginResp");
        };

        let ping: Message = Ping {
            privilege_key: "x".into(),
            timestamp: i64::MIN,
        }
        .into();
        msg::write_msg(&mut ctl, &ping).await.unwrap();
        let Message::Pong(pong) = tokio::time::timeout(Duration::from_secs(2), msg::read_msg(&mut ctl))
            .await
            .unwrap()
            .unwrap()
        else {
            panic!("expected Pong");
        };
        assert_eq!(pong.error, "authorization timeout");
        assert!(msg::read_msg(&mut ctl).await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.relay.shared().sessions.get(&resp.run_id).is_none());
    }

    #[tokio::test]
    async fn missing_heartbeat_closes_session() {
        let mut opts = test_opts();
        opts.heartbeat_timeout = Duration::from_millis(300);
        let h = start_relay(opts);

        let mut ctl = h.dialer.dial().await.unwrap();
        msg::write_msg(&mut ctl, &login("", now_unix())).await.unwrap();
        assert!(matches!(msg::read_msg(&mut ctl).await.unwrap(), Message::LoginResp(_)));
        assert!(msg::read_msg(&mut ctl).await.is_err());
    }

    #[tokio::test]
    async fn draining_fails_pending_work_requests() {
        let shared = Arc::new(RelayShared::new(RelayOptions {
            work_conn_timeout: Duration::from_secs(30),
            ..test_opts()
        }));
        let (ctl, mut rx) = fake_session(&shared, "R1", "").await;
        shared
            .proxies
            .register(
                "R1",
                "",
                &NewProxy {
                    proxy_name: "ssh".into(),
                    proxy_type: "tcp".into(),
                    remote_port: 6022,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let waiter = {
            let shared = shared.clone();
            tokio::spawn(async move { broker::open_work_conn(&shared, "ssh", None, None).await })
        };
        assert!(matches!(rx.recv().await, Some(Message::ReqWorkConn(_))));

        ctl.drain(&shared).await;
        assert_eq!(ctl.state(), SessionState::Closed);
        assert!(matches!(waiter.await.unwrap(), Err(BrokerError::SessionClosed)));
        assert!(shared.proxies.get("ssh").await.is_none());
    }
}
