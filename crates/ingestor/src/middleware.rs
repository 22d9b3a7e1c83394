//! Request accounting and per-IP rate limiting for the ingress router.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum::Router;
use imgflow_bus::metrics::names;
use imgflow_bus::MetricsCollector;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::GovernorLayer;
use tracing::{debug, warn};

/// Count and time every routed request, and track how many are in flight.
pub async fn track_requests(
    State(metrics): State<MetricsCollector>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let _in_flight = metrics.track(names::HTTP_IN_FLIGHT);
    let started = Instant::now();
    let response = next.run(request).await;
    let elapsed = started.elapsed();

    let status = response.status().as_u16();
    metrics.incr(names::HTTP_REQUESTS, &format!("{method} {route} {status}"));
    metrics.observe(names::HTTP_REQUEST_DURATION, &format!("{method} {route}"), elapsed);
    debug!(%method, %route, status, elapsed_ms = elapsed.as_millis() as u64, "request served");
    response
}

/// Limit each client IP to `per_second` requests, with a burst of the same
/// size. Needs the server to run with `ConnectInfo<SocketAddr>`. 0 leaves
/// the router unlimited.
pub fn with_rate_limit(router: Router, per_second: u32) -> Router {
    if per_second == 0 {
        return router;
    }
    let replenish_ms = (1000 / u64::from(per_second)).max(1);
    let Some(config) = GovernorConfigBuilder::default()
        .per_millisecond(replenish_ms)
        .burst_size(per_second)
        .use_headers()
        .finish()
    else {
        warn!(per_second, "invalid rate limit, serving unlimited");
        return router;
    };
    router.layer(GovernorLayer {
        config: Arc::new(config),
    })
}
