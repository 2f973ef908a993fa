use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use crate::rtunnel::tunnel::{
    auth::{self, AuthError},
    broker,
    msg::{self, NewVisitorConn, NewVisitorConnResp},
    server::{Control, RelayShared},
    session::SessionState,
    transport::BoxedStream,
};

/// Handles a connection whose first message is NewVisitorConn: verifies the visitor
/// against the private proxy, then splices it to a freshly brokered work connection.
pub async fn handle_new_visitor_conn(shared: &RelayShared, m: NewVisitorConn, mut stream: BoxedStream) {
    let proxy_name = m.proxy_name.clone();
    if let Err(reason) = check_visitor(shared, &m).await {
        tracing::warn!(run_id = %m.run_id, proxy = %proxy_name, err = %reason, "tunnel: visitor rejected");
        let resp = NewVisitorConnResp {
            proxy_name,
            error: reason,
        };
        let _ = msg::write_msg(&mut stream, &resp.into()).await;
        let _ = stream.shutdown().await;
        return;
    }

    let resp = NewVisitorConnResp {
        proxy_name: proxy_name.clone(),
        error: String::new(),
    };
    if msg::write_msg(&mut stream, &resp.into()).await.is_err() {
        return;
    }

    let mut work = match broker::open_work_conn(shared, &proxy_name, None, None).await {
        Ok(w) => w,
        Err(err) => {
            tracing::warn!(proxy = %proxy_name, err = %err, "tunnel: no work connection for visitor");
            let _ = stream.shutdown().await;
            return;
        }
    };

    tracing::debug!(run_id = %m.run_id, proxy = %proxy_name, "tunnel: visitor connected");
    match tokio::io::copy_bidirectional(&mut stream, &mut work).await {
        Ok((up, down)) => {
            tracing::debug!(proxy = %proxy_name, up, down, "tunnel: visitor connection closed")
        }
        Err(err) => tracing::debug!(proxy = %proxy_name, err = %err, "tunnel: visitor connection error"),
    }
}

async fn check_visitor(shared: &RelayShared, m: &NewVisitorConn) -> Result<Arc<Control>, String> {
    let visitor = shared
        .sessions
        .get(&m.run_id)
        .filter(|c| c.state() == SessionState::Active)
        .ok_or_else(|| format!("no active session for run id [{}]", m.run_id))?;

    let entry = shared
        .proxies
        .get(&m.proxy_name)
        .await
        .ok_or_else(|| format!("proxy [{}] not found", m.proxy_name))?;
    if !entry.proxy_type.is_private() {
        return Err(format!("proxy [{}] does not accept visitors", m.proxy_name));
    }

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
    Ok(visitor)
}
