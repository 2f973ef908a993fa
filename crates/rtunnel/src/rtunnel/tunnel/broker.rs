//! On-demand work connections.
//!
//! Each control session owns a [`WorkConnPool`]: a FIFO of callers waiting for a
//! connection plus a small idle pool. Waiters are served strictly in arrival order;
//! a connection nobody is waiting for is parked until the pool is full.

use std::{collections::VecDeque, net::SocketAddr, time::Duration};

use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, oneshot},
};

use crate::rtunnel::tunnel::{
    msg::{self, Message, NewWorkConn, ReqWorkConn, StartWorkConn},
    server::RelayShared,
    session::{ControlWriter, SessionState},
    transport::BoxedStream,
};

/// Pooled connections can go stale while idle; skip at most this many before giving up.
const MAX_STALE_POOLED: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("timeout waiting for work connection")]
    Timeout,
    #[error("client session is closing")]
    SessionClosed,
    #[error("proxy [{0}] not found")]
    ProxyNotFound(String),
    #[error("no client control found for run id [{0}]")]
    NoSession(String),
    #[error("start work connection: {0}")]
    Io(String),
}

pub struct WorkConn {
    pub stream: BoxedStream,
    pub remote: Option<SocketAddr>,
    pooled: bool,
}

impl std::fmt::Debug for WorkConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkConn")
            .field("remote", &self.remote)
            .field("pooled", &self.pooled)
            .finish_non_exhaustive()
    }
}

impl WorkConn {
    pub fn new(stream: BoxedStream, remote: Option<SocketAddr>) -> Self {
        Self {
            stream,
            remote,
            pooled: false,
        }
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<WorkConn>,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<WorkConn>,
    waiting: VecDeque<Waiter>,
    closed: bool,
    next_id: u64,
}

pub struct WorkConnPool {
    run_id: String,
    writer: ControlWriter,
    capacity: usize,
    wait: Duration,
    state: Mutex<PoolState>,
}

impl std::fmt::Debug for WorkConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkConnPool")
            .field("run_id", &self.run_id)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl WorkConnPool {
    pub fn new(run_id: impl Into<String>, writer: ControlWriter, capacity: usize, wait: Duration) -> Self {
        Self {
            run_id: run_id.into(),
            writer,
            capacity,
            wait,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Takes an idle connection or asks the client for a new one and waits for it.
    pub async fn acquire(&self) -> Result<WorkConn, BrokerError> {
        let (id, mut rx) = {
            let mut st = self.state.lock().await;
            if st.closed {
                return Err(BrokerError::SessionClosed);
            }
            if let Some(mut c) = st.idle.pop_front() {
                drop(st);
                // Replenish what we just took.
                let _ = self.writer.send(ReqWorkConn {}).await;
                c.pooled = true;
                return Ok(c);
            }
            let id = st.next_id;
            st.next_id += 1;
            let (tx, rx) = oneshot::channel();
            st.waiting.push_back(Waiter { id, tx });
            (id, rx)
        };

        if self.writer.send(ReqWorkConn {}).await.is_err() {
            self.forget(id).await;
            return Err(BrokerError::SessionClosed);
        }

        match tokio::time::timeout(self.wait, &mut rx).await {
            Ok(Ok(c)) => Ok(c),
            Ok(Err(_)) => Err(BrokerError::SessionClosed),
            Err(_) => {
                if self.forget(id).await {
                    metrics::counter!("rtunnel_broker_timeouts_total").increment(1);
                    tracing::warn!(run_id = %self.run_id, wait = %humantime::format_duration(self.wait), "tunnel: no work connection arrived in time");
                    return Err(BrokerError::Timeout);
                }
                // Delivered or closed between the deadline and the removal.
                settle_late(&mut rx)
            }
        }
    }

    /// Hands a freshly authenticated connection to the oldest waiter, or parks it.
    /// Returns the connection when the pool is closed or full.
    pub async fn offer(&self, mut conn: WorkConn) -> Result<(), WorkConn> {
        let mut st = self.state.lock().await;
        if st.closed {
            return Err(conn);
        }
        while let Some(w) = st.waiting.pop_front() {
            match w.tx.send(conn) {
                Ok(()) => return Ok(()),
                // Waiter gave up; try the next one.
                Err(c) => conn = c,
            }
        }
        if st.idle.len() >= self.capacity {
            return Err(conn);
        }
        st.idle.push_back(conn);
        Ok(())
    }

    /// Fails every waiter and drops idle connections. Returns how many waiters were cancelled.
    pub async fn close(&self) -> usize {
        let mut st = self.state.lock().await;
        st.closed = true;
        let n = st.waiting.len();
        st.waiting.clear();
        st.idle.clear();
        n
    }

    pub async fn waiting(&self) -> usize {
        self.state.lock().await.waiting.len()
    }

    pub async fn idle(&self) -> usize {
        self.state.lock().await.idle.len()
    }

    async fn forget(&self, id: u64) -> bool {
        let mut st = self.state.lock().await;
        let before = st.waiting.len();
        st.waiting.retain(|w| w.id != id);
        st.waiting.len() != before
    }
}

fn settle_late(rx: &mut oneshot::Receiver<WorkConn>) -> Result<WorkConn, BrokerError> {
    rx.try_recv().map_err(|err| match err {
        oneshot::error::TryRecvError::Closed => BrokerError::SessionClosed,
        oneshot::error::TryRecvError::Empty => BrokerError::Timeout,
    })
}

/// Writes `StartWorkConn{error}` and closes the connection.
pub async fn reject_work_conn(mut stream: BoxedStream, reason: &str) {
    let m: Message = StartWorkConn {
        error: reason.to_string(),
        ..Default::default()
    }
    .into();
    let _ = tokio::time::timeout(Duration::from_secs(1), msg::write_msg(&mut stream, &m)).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), stream.shutdown()).await;
}

/// Obtains a work connection for `proxy_name` and starts it. The returned stream is the
/// raw pipe to the client's local service.
pub async fn open_work_conn(
    shared: &RelayShared,
    proxy_name: &str,
    src: Option<SocketAddr>,
    dst: Option<SocketAddr>,
) -> Result<BoxedStream, BrokerError> {
    let entry = shared
        .proxies
        .get(proxy_name)
        .await
        .ok_or_else(|| BrokerError::ProxyNotFound(proxy_name.to_string()))?;
    let ctl = shared
        .sessions
        .get(&entry.run_id)
        .ok_or_else(|| BrokerError::NoSession(entry.run_id.clone()))?;

    let start = StartWorkConn {
        proxy_name: entry.name.clone(),
        src_addr: src.map(|a| a.ip().to_string()).unwrap_or_default(),
        src_port: src.map(|a| a.port()).unwrap_or_default(),
        dst_addr: dst.map(|a| a.ip().to_string()).unwrap_or_default(),
        dst_port: dst.map(|a| a.port()).unwrap_or_default(),
        error: String::new(),
    };
    let start: Message = start.into();

    let mut stale = 0;
    loop {
        let mut conn = ctl.pool.acquire().await?;

        let still_ours = shared
            .proxies
            .get(&entry.name)
            .await
            .is_some_and(|e| e.run_id == entry.run_id);
        if !still_ours {
            reject_work_conn(conn.stream, "proxy removed").await;
            return Err(BrokerError::ProxyNotFound(entry.name.clone()));
        }

        match msg::write_msg(&mut conn.stream, &start).await {
            Ok(()) => {
                metrics::counter!("rtunnel_work_conns_total").increment(1);
                tracing::debug!(run_id = %entry.run_id, proxy = %entry.name, pooled = conn.pooled, "tunnel: work connection started");
                return Ok(conn.stream);
            }
            Err(err) if conn.pooled && stale < MAX_STALE_POOLED => {
                stale += 1;
                tracing::debug!(run_id = %entry.run_id, err = %err, "tunnel: dropping stale pooled work connection");
            }
            Err(err) => return Err(BrokerError::Io(err.to_string())),
        }
    }
}

/// Handles the first message of a connection dialed by a client in answer to ReqWorkConn.
pub async fn handle_new_work_conn(
    shared: &RelayShared,
    m: NewWorkConn,
    stream: BoxedStream,
    remote: Option<SocketAddr>,
) {
    if let Err(err) = shared.auth.verify_new_work_conn(&m) {
        tracing::warn!(run_id = %m.run_id, err = %err, "tunnel: work connection rejected");
        reject_work_conn(stream, &err.to_string()).await;
        return;
    }

    let Some(ctl) = shared.sessions.get(&m.run_id) else {
        let err = BrokerError::NoSession(m.run_id.clone());
        tracing::warn!(run_id = %m.run_id, "tunnel: work connection for unknown session");
        reject_work_conn(stream, &err.to_string()).await;
        return;
    };
    if ctl.state() != SessionState::Active {
        reject_work_conn(stream, &BrokerError::SessionClosed.to_string()).await;
        return;
    }

    if let Err(conn) = ctl.pool.offer(WorkConn::new(stream, remote)).await {
        tracing::debug!(run_id = %m.run_id, "tunnel: work connection pool full or closed");
        reject_work_conn(conn.stream, "work connection pool is full").await;
    }
}
