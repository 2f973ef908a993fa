use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use tokio::{
    net::{TcpStream, UdpSocket},
    sync::{mpsc, watch},
    time::Instant,
};

use crate::rtunnel::tunnel::{
    auth::{auth_key, now_unix},
    msg::{
        self, CloseProxy, Login, Message, NatHoleClient, NatHoleReport, NatHoleResp, NewProxy,
        NewWorkConn, Ping,
    },
    nathole::punch::{self, Punched},
    registry::ProxyType,
    server::VERSION,
    session::{self, ControlWriter, SessionError, SessionState, StateCell},
    transport::{BoxedStream, Dialer},
};

/// One local service exposed through the relay.
#[derive(Debug, Clone, Default)]
pub struct ProxySpec {
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

impl ProxySpec {
    fn to_msg(&self) -> NewProxy {
        NewProxy {
            proxy_name: self.name.clone(),
            proxy_type: self.proxy_type.clone(),
            remote_port: self.remote_port,
            custom_domains: self.custom_domains.clone(),
            sub_domain: self.sub_domain.clone(),
            locations: self.locations.clone(),
            sk: self.sk.clone(),
            allow_users: self.allow_users.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub auth_token: String,
    pub user: String,
    pub pool_count: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub authenticate_heartbeats: bool,
    pub dial_timeout: Duration,
    pub nat_hole_timeout: Duration,
    pub proxies: Vec<ProxySpec>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            auth_token: String::new(),
            user: String::new(),
            pool_count: 1,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            authenticate_heartbeats: false,
            dial_timeout: Duration::from_secs(10),
            nat_hole_timeout: Duration::from_secs(10),
            proxies: Vec::new(),
        }
    }
}

/// A punched UDP path to a visitor, handed to whoever consumes [`Client::with_punch_sink`].
#[derive(Debug)]
pub struct PunchedPath {
    pub proxy_name: String,
    pub sid: String,
    pub path: Punched,
}

pub struct Client {
    opts: ClientOptions,
    dialer: Arc<dyn Dialer>,
    local_map: Arc<HashMap<String, ProxySpec>>,
    run_id: Mutex<String>,
    punch_sink: Option<mpsc::Sender<PunchedPath>>,
}

impl Client {
    pub fn new(mut opts: ClientOptions, dialer: Arc<dyn Dialer>) -> anyhow::Result<Self> {
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = Duration::from_secs(5);
        }
        if opts.heartbeat_interval.is_zero() {
            opts.heartbeat_interval = Duration::from_secs(30);
        }

        let mut map = HashMap::new();
        for p in &opts.proxies {
            let name = p.name.trim();
            if name.is_empty() {
                anyhow::bail!("tunnel: proxy name is required");
            }
            if ProxyType::parse(&p.proxy_type).is_none() {
                anyhow::bail!("tunnel: proxy [{name}] has unsupported type {:?}", p.proxy_type);
            }
            if map.insert(name.to_string(), p.clone()).is_some() {
                anyhow::bail!("tunnel: duplicate proxy name [{name}]");
            }
        }

        Ok(Self {
            opts,
            dialer,
            local_map: Arc::new(map),
            run_id: Mutex::new(String::new()),
            punch_sink: None,
        })
    }

    pub fn with_punch_sink(mut self, sink: mpsc::Sender<PunchedPath>) -> Self {
        self.punch_sink = Some(sink);
        self
    }

    pub fn run_id(&self) -> String {
        self.run_id.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Keeps a control session up until shutdown. Reconnects with backoff after
    /// transport failures; a login rejection ends the loop with an error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if self.opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server_addr is required");
        }

        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let mut was_active = false;
            match self.run_once(shutdown.clone(), &mut was_active).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if let Some(SessionError::LoginRejected(reason)) = err.downcast_ref::<SessionError>() {
                        tracing::error!(server = %self.opts.server_addr, reason = %reason, "tunnel: login rejected");
                        return Err(err);
                    }
                    if was_active {
                        backoff = Duration::from_secs(1);
                    }
                    tracing::warn!(
                        server = %self.opts.server_addr,
                        err = %err,
                        backoff = %humantime::format_duration(backoff),
                        "tunnel: disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(Duration::from_secs(10));
        }
    }

    async fn run_once(&self, mut shutdown: watch::Receiver<bool>, was_active: &mut bool) -> anyhow::Result<()> {
        let state = StateCell::new(SessionState::Disconnected);
        state.transition(SessionState::Connecting)?;

        let mut stream = tokio::time::timeout(self.opts.dial_timeout, self.dialer.dial())
            .await
            .context("tunnel: dial timeout")??;
        state.transition(SessionState::Authenticating)?;

        let ts = now_unix();
        let login = Login {
            version: VERSION.into(),
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            os: std::env::consts::OS.into(),
            arch: std::env::consts::ARCH.into(),
            user: self.opts.user.clone(),
            privilege_key: auth_key(&self.opts.auth_token, ts),
            timestamp: ts,
            run_id: self.run_id(),
            pool_count: self.opts.pool_count,
            ..Default::default()
        };
        msg::write_msg(&mut stream, &login.into()).await?;

        let resp = tokio::time::timeout(self.opts.dial_timeout, msg::read_msg(&mut stream))
            .await
            .context("tunnel: timeout waiting for login response")??;
        let resp = match resp {
            Message::LoginResp(r) => r,
            other => anyhow::bail!("tunnel: expected LoginResp, got {}", other.msg_type()),
        };
        if !resp.error.is_empty() {
            state.transition(SessionState::Closed)?;
            return Err(SessionError::LoginRejected(resp.error).into());
        }
        if let Ok(mut r) = self.run_id.lock() {
            *r = resp.run_id.clone();
        }
        state.transition(SessionState::Active)?;
        *was_active = true;
        tracing::info!(server = %self.opts.server_addr, run_id = %resp.run_id, proxies = self.local_map.len(), "tunnel: connected");

        let (mut rd, wr) = tokio::io::split(stream);
        let (writer, mut write_task) = session::spawn_writer(wr);
        let ctx = Arc::new(WorkCtx {
            dialer: self.dialer.clone(),
            auth_token: self.opts.auth_token.clone(),
            run_id: resp.run_id.clone(),
            local_map: self.local_map.clone(),
        });

        for p in self.local_map.values() {
            writer.send(p.to_msg()).await?;
        }
        for _ in 0..self.opts.pool_count {
            ctx.clone().spawn_work_conn();
        }

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

        let punches = Arc::new(Mutex::new(HashMap::new()));
        let mut ping = tokio::time::interval(self.opts.heartbeat_interval);
        let mut last_pong = Instant::now();

        let res: anyhow::Result<()> = loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        state.transition(SessionState::Draining)?;
                        for name in self.local_map.keys() {
                            let _ = writer.send(CloseProxy { proxy_name: name.clone() }).await;
                        }
                        break Ok(());
                    }
                }
                _ = ping.tick() => {
                    if !self.opts.heartbeat_timeout.is_zero() && last_pong.elapsed() > self.opts.heartbeat_timeout {
                        break Err(SessionError::HeartbeatTimeout.into());
                    }
                    let mut p = Ping::default();
                    if self.opts.authenticate_heartbeats {
                        p.timestamp = now_unix();
                        p.privilege_key = auth_key(&self.opts.auth_token, p.timestamp);
                    }
                    if let Err(err) = writer.send(p).await {
                        break Err(err.into());
                    }
                }
                m = msg_rx.recv() => {
                    let m = match m {
                        Some(Ok(m)) => m,
                        Some(Err(err)) => break Err(err.into()),
                        None => break Err(SessionError::ChannelClosed.into()),
                    };
                    match m {
                        Message::NewProxyResp(r) if r.error.is_empty() => {
                            tracing::info!(proxy = %r.proxy_name, remote = %r.remote_addr, "tunnel: proxy started");
                        }
                        Message::NewProxyResp(r) => {
                            tracing::warn!(proxy = %r.proxy_name, err = %r.error, "tunnel: proxy rejected by relay");
                        }
                        Message::ReqWorkConn(_) => ctx.clone().spawn_work_conn(),
                        Message::Pong(p) if p.error.is_empty() => last_pong = Instant::now(),
                        Message::Pong(p) => break Err(SessionError::ForcedClose(p.error).into()),
                        Message::NatHoleClient(m) => self.answer_nat_hole(&writer, &punches, m),
                        Message::NatHoleResp(m) => self.start_punch(&writer, &punches, m),
                        other => {
                            tracing::warn!(msg = %other.msg_type(), "tunnel: unexpected message from relay");
                        }
                    }
                }
            }
        };

        reader.abort();
        drop(writer);
        if tokio::time::timeout(Duration::from_secs(1), &mut write_task).await.is_err() {
            write_task.abort();
        }
        let _ = state.transition(SessionState::Closed);
        res
    }

    /// Binds the socket this side will punch from and reports its addresses.
    fn answer_nat_hole(&self, writer: &ControlWriter, punches: &PendingPunches, m: NatHoleClient) {
        let writer = writer.clone();
        let punches = punches.clone();
        let server_addr = self.opts.server_addr.clone();
        let ttl = self.opts.nat_hole_timeout * 2;
        tokio::spawn(async move {
            let sock = match UdpSocket::bind("0.0.0.0:0").await {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!(sid = %m.sid, err = %err, "tunnel: bind nat hole socket");
                    return;
                }
            };
            let addrs: Vec<String> = assisted_addr(&sock, &server_addr).await.into_iter().map(|a| a.to_string()).collect();
            if let Ok(mut p) = punches.lock() {
                p.insert(m.sid.clone(), (m.proxy_name.clone(), sock));
            }
            let answer = NatHoleClient {
                transaction_id: m.transaction_id,
                proxy_name: m.proxy_name,
                sid: m.sid.clone(),
                mapped_addrs: addrs.clone(),
                assisted_addrs: addrs,
            };
            if writer.send(answer).await.is_err() {
                return;
            }
            tokio::time::sleep(ttl).await;
            if let Ok(mut p) = punches.lock() {
                p.remove(&m.sid);
            }
        });
    }

    fn start_punch(&self, writer: &ControlWriter, punches: &PendingPunches, resp: NatHoleResp) {
        let Some((proxy_name, sock)) = punches.lock().ok().and_then(|mut p| p.remove(&resp.sid)) else {
            tracing::debug!(sid = %resp.sid, err = %resp.error, "tunnel: nat hole response without pending socket");
            return;
        };
        let writer = writer.clone();
        let sink = self.punch_sink.clone();
        tokio::spawn(async move {
            let res = punch::punch(sock, &resp).await;
            let success = res.is_ok();
            let _ = writer
                .send(NatHoleReport {
                    sid: resp.sid.clone(),
                    success,
                })
                .await;
            match res {
                Ok(path) => {
                    if let Some(sink) = sink {
                        let _ = sink
                            .send(PunchedPath {
                                proxy_name,
                                sid: resp.sid,
                                path,
                            })
                            .await;
                    }
                }
                Err(err) => tracing::warn!(sid = %resp.sid, proxy = %proxy_name, err = %err, "tunnel: hole punch failed"),
            }
        });
    }
}

type PendingPunches = Arc<Mutex<HashMap<String, (String, UdpSocket)>>>;

/// The local address of `sock` on the interface that routes to the relay.
async fn assisted_addr(sock: &UdpSocket, server_addr: &str) -> Option<SocketAddr> {
    let port = sock.local_addr().ok()?.port();
    let probe = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    probe.connect(server_addr).await.ok()?;
    let ip = probe.local_addr().ok()?.ip();
    Some(SocketAddr::new(ip, port))
}

struct WorkCtx {
    dialer: Arc<dyn Dialer>,
    auth_token: String,
    run_id: String,
    local_map: Arc<HashMap<String, ProxySpec>>,
}

impl WorkCtx {
    fn spawn_work_conn(self: Arc<Self>) {
        tokio::spawn(async move {
            if let Err(err) = self.work_conn().await {
                tracing::debug!(run_id = %self.run_id, err = %err, "tunnel: work connection ended");
            }
        });
    }

    async fn work_conn(&self) -> anyhow::Result<()> {
        let mut st = self.dialer.dial().await.context("tunnel: dial work connection")?;
        let ts = now_unix();
        let hello = NewWorkConn {
            run_id: self.run_id.clone(),
            privilege_key: auth_key(&self.auth_token, ts),
            timestamp: ts,
        };
        msg::write_msg(&mut st, &hello.into()).await?;

        // Pooled connections may sit here until traffic arrives.
        let Message::StartWorkConn(start) = msg::read_msg(&mut st).await? else {
            anyhow::bail!("tunnel: expected StartWorkConn");
        };
        if !start.error.is_empty() {
            anyhow::bail!("tunnel: work connection refused: {}", start.error);
        }
        let Some(p) = self.local_map.get(&start.proxy_name) else {
            tracing::warn!(proxy = %start.proxy_name, "tunnel: unknown proxy");
            return Ok(());
        };
        splice_local(st, p).await
    }
}

async fn splice_local(mut st: BoxedStream, p: &ProxySpec) -> anyhow::Result<()> {
    match ProxyType::parse(&p.proxy_type) {
        Some(ProxyType::Udp | ProxyType::Sudp) => {
            tracing::warn!(proxy = %p.name, "tunnel: datagram forwarding is not handled by this client");
            return Ok(());
        }
        None => return Ok(()),
        _ => {}
    }
    let local = p.local_addr.trim();
    if local.is_empty() {
        return Ok(());
    }
    let mut up = TcpStream::connect(local)
        .await
        .with_context(|| format!("tunnel: connect local {local}"))?;
    let _ = tokio::io::copy_bidirectional(&mut st, &mut up).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtunnel::tunnel::{
        msg::{LoginResp, NatHoleVisitor, Pong},
        nathole::Outcome,
        server::{
            Relay,
            tests::{TOKEN, fake_session, test_opts},
        },
        transport::memory,
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    async fn echo_server() -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut c, _)) = ln.accept().await else { return };
                tokio::spawn(async move {
                    let (mut r, mut w) = c.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn client_opts(proxies: Vec<ProxySpec>) -> ClientOptions {
        ClientOptions {
            server_addr: "127.0.0.1:7000".into(),
            auth_token: TOKEN.into(),
            proxies,
            ..Default::default()
        }
    }

    async fn wait_for_proxy(relay: &Relay, name: &str) {
        for _ in 0..100 {
            if relay.shared().proxies.get(name).await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("proxy {name} never registered");
    }

    #[tokio::test]
    async fn external_traffic_reaches_local_service() {
        let local = echo_server().await;
        let (ln, dialer) = memory::pair();
        let relay = Arc::new(Relay::new(test_opts()));
        let (stop, stop_rx) = watch::channel(false);
        {
            let relay = relay.clone();
            let stop_rx = stop_rx.clone();
            tokio::spawn(async move { relay.serve(ln, stop_rx).await });
        }

        let client = Arc::new(
            Client::new(
                client_opts(vec![ProxySpec {
                    name: "echo".into(),
                    proxy_type: "tcp".into(),
                    local_addr: local.to_string(),
                    ..Default::default()
                }]),
                Arc::new(dialer),
            )
            .unwrap(),
        );
        let run = {
            let client = client.clone();
            tokio::spawn(async move { client.run(stop_rx).await })
        };

        wait_for_proxy(&relay, "echo").await;
        for _ in 0..3 {
            let mut pipe = relay.open_work_conn("echo", None, None).await.unwrap();
            pipe.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            pipe.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
        }
        assert!(!client.run_id().is_empty());

        stop.send(true).unwrap();
        run.await.unwrap().unwrap();
    }

    /// A relay that accepts every login and answers pings with `pong_error`, or never
    /// answers them at all. Each accepted login is reported on `logins`.
    fn stub_relay(ln: memory::MemoryListener, pong_error: Option<&'static str>, logins: mpsc::Sender<()>) {
        tokio::spawn(async move {
            while let Ok((mut st, _)) = crate::rtunnel::tunnel::transport::Listener::accept(&ln).await {
                let logins = logins.clone();
                tokio::spawn(async move {
                    if !matches!(msg::read_msg(&mut st).await, Ok(Message::Login(_))) {
                        // Work connections are held open until the client drops them.
                        let _ = tokio::io::copy(&mut st, &mut tokio::io::sink()).await;
                        return;
                    }
                    let _ = logins.send(()).await;
                    let resp: Message = LoginResp {
                        version: VERSION.into(),
                        run_id: "R1".into(),
                        error: String::new(),
                    }
                    .into();
                    if msg::write_msg(&mut st, &resp).await.is_err() {
                        return;
                    }
                    while let Ok(m) = msg::read_msg(&mut st).await {
                        if let (Message::Ping(_), Some(e)) = (&m, pong_error) {
                            let pong: Message = Pong { error: e.into() }.into();
                            let _ = msg::write_msg(&mut st, &pong).await;
                        }
                    }
                });
            }
        });
    }

    fn keepalive_opts() -> ClientOptions {
        ClientOptions {
            heartbeat_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(250),
            ..client_opts(Vec::new())
        }
    }

    #[tokio::test]
    async fn pong_with_error_forces_close() {
        let (ln, dialer) = memory::pair();
        let (logins, _logins_rx) = mpsc::channel(8);
        stub_relay(ln, Some("bye"), logins);

        let client = Client::new(keepalive_opts(), Arc::new(dialer)).unwrap();
        let (_stop, stop_rx) = watch::channel(false);
        let mut was_active = false;
        let err = tokio::time::timeout(Duration::from_secs(5), client.run_once(stop_rx, &mut was_active))
            .await
            .unwrap()
            .unwrap_err();
        assert!(was_active);
        assert!(
            matches!(err.downcast_ref::<SessionError>(), Some(SessionError::ForcedClose(r)) if r == "bye"),
            "{err:#}"
        );
    }

    #[tokio::test]
    async fn silent_relay_trips_heartbeat_timeout() {
        let (ln, dialer) = memory::pair();
        let (logins, _logins_rx) = mpsc::channel(8);
        stub_relay(ln, None, logins);

        let client = Client::new(keepalive_opts(), Arc::new(dialer)).unwrap();
        let (_stop, stop_rx) = watch::channel(false);
        let mut was_active = false;
        let err = tokio::time::timeout(Duration::from_secs(5), client.run_once(stop_rx, &mut was_active))
            .await
            .unwrap()
            .unwrap_err();
        assert!(
            matches!(err.downcast_ref::<SessionError>(), Some(SessionError::HeartbeatTimeout)),
            "{err:#}"
        );
    }

    #[tokio::test]
    async fn forced_close_is_followed_by_reconnect() {
        let (ln, dialer) = memory::pair();
        let (logins, mut logins_rx) = mpsc::channel(8);
        stub_relay(ln, Some("bye"), logins);

        let client = Arc::new(Client::new(keepalive_opts(), Arc::new(dialer)).unwrap());
        let (stop, stop_rx) = watch::channel(false);
        let run = {
            let client = client.clone();
            tokio::spawn(async move { client.run(stop_rx).await })
        };

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(5), logins_rx.recv())
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(client.run_id(), "R1");

        stop.send(true).unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn login_rejection_stops_the_client() {
        let (ln, dialer) = memory::pair();
        let relay = Arc::new(Relay::new(test_opts()));
        let (_stop, stop_rx) = watch::channel(false);
        {
            let relay = relay.clone();
            let stop_rx = stop_rx.clone();
            tokio::spawn(async move { relay.serve(ln, stop_rx).await });
        }

        let mut opts = client_opts(Vec::new());
        opts.auth_token = "wrong".into();
        let client = Client::new(opts, Arc::new(dialer)).unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), client.run(stop_rx))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<SessionError>(), Some(SessionError::LoginRejected(_))));
    }

    #[test]
    fn duplicate_or_unknown_proxies_are_refused() {
        let (_ln, dialer) = memory::pair();
        let dialer: Arc<dyn Dialer> = Arc::new(dialer);
        let p = ProxySpec {
            name: "a".into(),
            proxy_type: "tcp".into(),
            ..Default::default()
        };
        assert!(Client::new(client_opts(vec![p.clone(), p.clone()]), dialer.clone()).is_err());
        let bad = ProxySpec {
            proxy_type: "carrier-pigeon".into(),
            ..p
        };
        assert!(Client::new(client_opts(vec![bad]), dialer).is_err());
    }

    #[tokio::test]
    async fn owner_punches_hole_with_visitor() {
        let (ln, dialer) = memory::pair();
        let relay = Arc::new(Relay::new(test_opts()));
        let shared = relay.shared();
        let mut events = relay.subscribe_nat_events();
        let (_stop, stop_rx) = watch::channel(false);
        {
            let relay = relay.clone();
            let stop_rx = stop_rx.clone();
            tokio::spawn(async move { relay.serve(ln, stop_rx).await });
        }

        let (sink_tx, mut sink_rx) = mpsc::channel(1);
        let client = Arc::new(
            Client::new(
                client_opts(vec![ProxySpec {
                    name: "p2p".into(),
                    proxy_type: "xtcp".into(),
                    sk: "shh".into(),
                    allow_users: vec!["*".into()],
                    ..Default::default()
                }]),
                Arc::new(dialer),
            )
            .unwrap()
            .with_punch_sink(sink_tx),
        );
        {
            let client = client.clone();
            tokio::spawn(async move { client.run(stop_rx).await });
        }
        wait_for_proxy(&relay, "p2p").await;

        // The visitor side is driven by hand over a channel-backed session.
        let (visitor, mut vrx) = fake_session(&shared, "VISITOR", "bob").await;
        let vsock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let vaddr = vsock.local_addr().unwrap().to_string();
        let ts = now_unix();
        let req = NatHoleVisitor {
            transaction_id: "t1".into(),
            proxy_name: "p2p".into(),
            protocol: "quic".into(),
            sign_key: auth_key("shh", ts),
            timestamp: ts,
            mapped_addrs: vec![vaddr.clone()],
            assisted_addrs: vec![vaddr],
            ..Default::default()
        };
        {
            let shared = shared.clone();
            let visitor = visitor.clone();
            tokio::spawn(async move {
                let nathole = shared.nathole.clone();
                nathole.handle_visitor(&shared, &visitor, req).await;
            });
        }

        let Some(Message::NatHoleResp(resp)) = vrx.recv().await else {
            panic!("expected NatHoleResp");
        };
        assert_eq!(resp.error, "");
        let punched = punch::punch(vsock, &resp).await.unwrap();

        let owner_side = tokio::time::timeout(Duration::from_secs(5), sink_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(owner_side.proxy_name, "p2p");
        assert_eq!(owner_side.path.peer, punched.socket.local_addr().unwrap());

        let ev = events.recv().await.unwrap();
        assert_eq!(ev.sid, resp.sid);
        assert_eq!(ev.outcome, Outcome::Success);
    }
}
