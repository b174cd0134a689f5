use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use common_kafka::metrics_consts::COMMIT_FLUSH_SIZE_HISTOGRAM;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const EXPONENTIAL_SECONDS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

// records per commit flush
const FLUSH_SIZES: &[f64] = &[1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0];

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add a `/metrics` endpoint to `router` and install the global Prometheus recorder.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    prometheus_builder()?.install_recorder()
}

/// Durations use second buckets; the commit flush size histogram counts records.
pub fn prometheus_builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .set_buckets_for_metric(
            Matcher::Full(COMMIT_FLUSH_SIZE_HISTOGRAM.to_string()),
            FLUSH_SIZES,
        )
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

#[cfg(test)]
mod tests {
    use common_kafka::metrics_consts::HANDLER_DURATION_HISTOGRAM;

    use super::*;

    fn bucket_lines(rendered: &str, name: &str) -> usize {
        let prefix = format!("{name}_bucket{{");
        rendered
            .lines()
            .filter(|line| line.starts_with(&prefix))
            .count()
    }

    #[test]
    fn test_histograms_get_their_own_buckets() {
        let recorder = prometheus_builder().unwrap().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            metrics::histogram!(HANDLER_DURATION_HISTOGRAM).record(0.2);
            metrics::histogram!("http_requests_duration_seconds").record(0.03);
            metrics::histogram!(COMMIT_FLUSH_SIZE_HISTOGRAM).record(250.0);
        });
        let rendered = handle.render();

        // one line per bucket plus +Inf
        assert_eq!(
            bucket_lines(&rendered, HANDLER_DURATION_HISTOGRAM),
            EXPONENTIAL_SECONDS.len() + 1
        );
        assert_eq!(
            bucket_lines(&rendered, "http_requests_duration_seconds"),
            EXPONENTIAL_SECONDS.len() + 1
        );
        assert_eq!(
            bucket_lines(&rendered, COMMIT_FLUSH_SIZE_HISTOGRAM),
            FLUSH_SIZES.len() + 1
        );
    }
}
