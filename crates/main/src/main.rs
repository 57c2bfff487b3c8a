//! 主应用程序入口
//!
//! 加载配置，组装连接中枢与限流，启动 Axum Web API 服务和后台清理任务。

use std::net::SocketAddr;

use anyhow::Context;
use config::AppConfig;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use web_api::{build_application, drain_connections, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load().context("failed to load configuration")?;
    tracing::info!(
        outbound_buffer = config.hub.outbound_buffer,
        overflow_policy = ?config.hub.overflow_policy,
        max_connections_per_subject = config.hub.max_connections_per_subject,
        "配置加载完成"
    );

    let application = build_application(&config);
    let state = application.state;

    let background = CancellationToken::new();
    let scheduler = application.scheduler.spawn(background.clone());

    let app = router(state.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    tracing::info!("聊天室服务器启动在 http://{}", bind_addr);
    let shutdown_grace = config.hub.shutdown_grace();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        tracing::info!("收到停机信号");
        background.cancel();
        drain_connections(&state, shutdown_grace).await;
    })
    .await?;

    if let Err(err) = scheduler.await {
        tracing::warn!(error = %err, "cleanup scheduler did not exit cleanly");
    }
    tracing::info!("服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
