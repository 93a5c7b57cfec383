//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use std::net::SocketAddr;
use std::sync::OnceLock;

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let builder = PrometheusBuilder::new();
    let handle = builder.install_recorder()?;

    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_engine_metrics();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册引擎的业务指标描述
///
/// 描述会出现在 /metrics 端点的 HELP 注释中。
fn register_engine_metrics() {
    metrics::describe_counter!(
        "reward_grants_total",
        "Total number of reward grants, labeled by family"
    );
    metrics::describe_counter!(
        "reward_grants_duplicate_total",
        "Grant attempts short-circuited by the idempotent ledger"
    );
    metrics::describe_counter!(
        "reward_jobs_processed_total",
        "Jobs processed successfully, labeled by kind"
    );
    metrics::describe_counter!(
        "reward_jobs_failed_total",
        "Jobs that failed and were parked for retry, labeled by kind"
    );
    metrics::describe_counter!(
        "reward_jobs_dead_total",
        "Jobs archived after exhausting their retry budget, labeled by kind"
    );
    metrics::describe_counter!(
        "reward_events_enqueued_total",
        "Jobs enqueued from domain events, labeled by kind"
    );
    metrics::describe_histogram!(
        "reward_job_duration_seconds",
        "Job handler duration in seconds, labeled by kind"
    );
    metrics::describe_counter!(
        "reward_lock_timeouts_total",
        "User lock acquisitions that timed out"
    );
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "指标服务器已启动");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "指标服务器异常退出");
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于测试中读取指标快照）
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}
