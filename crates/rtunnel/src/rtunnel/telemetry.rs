use std::net::SocketAddr;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::rtunnel::net;

/// Installs the process-wide `metrics` recorder. With a non-empty `metrics_addr` the
/// Prometheus exposition is also served over HTTP there.
///
/// Must run inside the Tokio runtime, once per process.
pub fn init_metrics(metrics_addr: &str) -> anyhow::Result<Option<SocketAddr>> {
    let builder = PrometheusBuilder::new();
    let bound = if metrics_addr.trim().is_empty() {
        builder
            .install_recorder()
            .context("metrics: install Prometheus recorder")?;
        None
    } else {
        let addr: SocketAddr = net::normalize_bind_addr(metrics_addr)
            .parse()
            .with_context(|| format!("invalid metrics_addr: {metrics_addr}"))?;
        builder
            .with_http_listener(addr)
            .install()
            .context("metrics: install Prometheus exporter")?;
        Some(addr)
    };
    describe();
    Ok(bound)
}

fn describe() {
    metrics::describe_gauge!("rtunnel_sessions_active", "Control sessions currently active on the relay.");
    metrics::describe_counter!("rtunnel_work_conns_total", "Work connections handed to proxied traffic.");
    metrics::describe_counter!(
        "rtunnel_broker_timeouts_total",
        "Requests that gave up waiting for a work connection."
    );
    metrics::describe_counter!(
        "rtunnel_nathole_attempts_total",
        "Resolved hole-punch attempts by outcome."
    );
}
