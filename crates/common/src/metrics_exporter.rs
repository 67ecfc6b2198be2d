use std::io;
use std::net::SocketAddr;

use axum::{Router, routing::get};
use tokio::net::TcpListener;

use crate::metrics::global_metrics;

/// Serves the global metrics registry at `/metrics` on `addr` until the task
/// is dropped.
pub async fn run_metrics_exporter(addr: SocketAddr) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_metrics_listener(listener).await
}

/// Serves `/metrics` on an already-bound listener.
pub async fn serve_metrics_listener(listener: TcpListener) -> io::Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    axum::serve(listener, app).await.map_err(io::Error::other)
}

async fn metrics_handler() -> String {
    global_metrics().render_prometheus()
}

#[cfg(test)]
mod tests {
    use super::metrics_handler;
    use crate::metrics::global_metrics;

    #[tokio::test]
    async fn metrics_handler_returns_prometheus_text() {
        global_metrics().record_map_output(42, 3, 1, 512, 5);
        let body = metrics_handler().await;
        assert!(body.contains("capstan_shuffle_blocks_written_total"));
        assert!(body.contains("shuffle_id=\"42\""));
    }
}
