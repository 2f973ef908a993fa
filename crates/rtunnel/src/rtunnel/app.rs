use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::rtunnel::{
    config::{self, ClientConfig, Config, RelayConfig},
    logging, telemetry,
    tunnel::{
        client::{Client, ClientOptions, ProxySpec},
        server::{Relay, RelayOptions},
        transport::TcpDialer,
    },
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::locate_config(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = resolved.source.as_str(), "config: created new config file");
    }
    if cfg.relay.is_none() && cfg.client.is_none() {
        anyhow::bail!("config: nothing to run (set [relay] and/or [client])");
    }
    if cfg.auth_token.is_empty() {
        tracing::warn!("config: auth_token is empty; any client can log in");
    }

    let metrics_addr = telemetry::init_metrics(&cfg.metrics_addr)?;

    tracing::info!(
        config = %resolved.path.display(),
        relay = cfg.relay.is_some(),
        client = cfg.client.is_some(),
        metrics_addr = ?metrics_addr,
        "rtunnel: starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    if let Some(rc) = &cfg.relay {
        let relay = Arc::new(Relay::new(relay_options(&cfg, rc)));

        let mut events = relay.subscribe_nat_events();
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                    ev = events.recv() => match ev {
                        Ok(ev) => tracing::debug!(sid = %ev.sid, proxy = %ev.proxy_name, outcome = ev.outcome.as_str(), "tunnel: nat hole event"),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(skipped = n, "tunnel: nat hole events lagged");
                        }
                        Err(_) => return Ok(()),
                    },
                }
            }
        });

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { relay.listen_and_serve(shutdown).await });
    }

    if let Some(cc) = &cfg.client {
        let client = Client::new(client_options(&cfg, cc), Arc::new(TcpDialer::new(cc.server_addr.clone())))?;
        let client = Arc::new(client);
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await });
    }

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                let _ = shutdown_tx.send(true);
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err),
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Sessions drain on the shutdown signal; only cap the wait if something hangs.
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

fn relay_options(cfg: &Config, rc: &RelayConfig) -> RelayOptions {
    RelayOptions {
        bind_addr: rc.bind_addr.clone(),
        auth_token: cfg.auth_token.clone(),
        replay_window: rc.replay_window,
        authenticate_heartbeats: rc.authenticate_heartbeats,
        trust_client_spec: rc.trust_client_spec,
        heartbeat_timeout: rc.heartbeat_timeout,
        work_conn_timeout: rc.work_conn_timeout,
        nat_hole_timeout: rc.nat_hole_timeout,
        max_pool_count: rc.max_pool_count,
        allow_ports: rc.allow_ports.clone(),
        subdomain_host: rc.subdomain_host.clone(),
        ..Default::default()
    }
}

fn client_options(cfg: &Config, cc: &ClientConfig) -> ClientOptions {
    ClientOptions {
        server_addr: cc.server_addr.clone(),
        auth_token: cfg.auth_token.clone(),
        user: cc.user.clone(),
        pool_count: cc.pool_count,
        heartbeat_interval: cc.heartbeat_interval,
        heartbeat_timeout: cc.heartbeat_timeout,
        authenticate_heartbeats: cc.authenticate_heartbeats,
        dial_timeout: cc.dial_timeout,
        nat_hole_timeout: cc.nat_hole_timeout,
        proxies: cc
            .proxies
            .iter()
            .map(|p| ProxySpec {
                name: p.name.clone(),
                proxy_type: p.proxy_type.clone(),
                local_addr: p.local_addr.clone(),
                remote_port: p.remote_port,
                custom_domains: p.custom_domains.clone(),
                sub_domain: p.sub_domain.clone(),
                locations: p.locations.clone(),
                sk: p.sk.clone(),
                allow_users: p.allow_users.clone(),
            })
            .collect(),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
