use std::time::Duration;

use application::BroadcastTarget;
use domain::Envelope;

use crate::state::AppState;

pub const SHUTDOWN_NOTICE: &str = "server is shutting down";

/// 停机顺序：向所有连接发送系统通知，等待宽限期让写任务排空，然后取消全部连接
pub async fn drain_connections(state: &AppState, grace: Duration) {
    let report = state.broadcaster.broadcast(
        &BroadcastTarget::All,
        Envelope::system(SHUTDOWN_NOTICE, state.hub().now()),
    );
    tracing::info!(
        delivered = report.delivered,
        grace_ms = grace.as_millis() as u64,
        "shutdown notice sent"
    );

    if report.delivered > 0 {
        tokio::time::sleep(grace).await;
    }

    let cancelled = state.hub().close_all();
    tracing::info!(cancelled, "all connections cancelled");
}
