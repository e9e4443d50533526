//! Tracing subscriber and Prometheus metrics for the node service.
//!
//! Installs an `EnvFilter` + `fmt` subscriber and a Prometheus recorder, and
//! serves `/metrics`, `/live` and `/ready` over `axum`. In tests the recorder
//! is cached so repeated initialization does not fail.
use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Sets up logging and returns the handle used to render metrics.
pub fn init_observability() -> Result<PrometheusHandle> {
    // Default to "info" if RUST_LOG is unset or invalid.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    init_subscriber(registry)?;
    install_metrics_recorder()
}

pub fn metrics_router(handle: PrometheusHandle) -> axum::Router {
    axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }))
}

/// Serves Prometheus metrics and health endpoints on the given socket address.
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "metrics listener started");
    axum::serve(listener, metrics_router(handle).into_make_service()).await
}

fn install_metrics_recorder() -> Result<PrometheusHandle> {
    #[cfg(test)]
    {
        if let Some(handle) = METRICS_HANDLE.get() {
            return Ok(handle.clone());
        }
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("install metrics recorder")?;
        let _ = METRICS_HANDLE.set(handle.clone());
        Ok(handle)
    }
    #[cfg(not(test))]
    {
        PrometheusBuilder::new()
            .install_recorder()
            .context("install metrics recorder")
    }
}

fn init_subscriber<S>(subscriber: S) -> Result<()>
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    #[cfg(test)]
    {
        let _ = subscriber.try_init();
        Ok(())
    }
    #[cfg(not(test))]
    {
        subscriber.try_init().context("install tracing subscriber")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serial_test::serial;
    use tower::ServiceExt;

    async fn get(router: axum::Router, path: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::get(path).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    #[test]
    #[serial]
    fn init_observability_is_repeatable_in_tests() {
        let first = init_observability().expect("first init");
        let second = init_observability().expect("second init");
        let _ = (first.render(), second.render());
    }

    #[tokio::test]
    #[serial]
    async fn endpoints_respond() {
        let handle = init_observability().expect("init");
        metrics::counter!("ember_connect_attempts_total", "result" => "ok").increment(1);
        let router = metrics_router(handle);

        let (status, body) = get(router.clone(), "/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
        let (status, body) = get(router.clone(), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
        let (status, body) = get(router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("ember_connect_attempts_total"));
    }
}
