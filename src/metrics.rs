// Metric registration for the engine. The binary installs a Prometheus
// recorder; library code emits through the `metrics` facade.
use metrics::{describe_counter, describe_gauge, describe_histogram};

pub const OPPORTUNITIES_RECEIVED: &str = "arbflow_opportunities_received_total";
pub const OPPORTUNITIES_QUEUED: &str = "arbflow_opportunities_queued_total";
pub const OPPORTUNITIES_REJECTED: &str = "arbflow_opportunities_rejected_total";
pub const OPPORTUNITIES_EXECUTED: &str = "arbflow_opportunities_executed_total";
pub const PIPELINE_STAGE_LATENCY: &str = "arbflow_pipeline_stage_latency_seconds";
pub const PIPELINE_IN_FLIGHT: &str = "arbflow_pipeline_in_flight";

pub const PRICES_AGGREGATED: &str = "arbflow_prices_aggregated_total";
pub const PRICE_OUTLIERS: &str = "arbflow_price_outliers_total";
pub const PRICE_ANOMALIES: &str = "arbflow_price_anomalies_total";

pub const CACHE_HITS: &str = "arbflow_cache_hits_total";
pub const CACHE_MISSES: &str = "arbflow_cache_misses_total";
pub const CACHE_EVICTIONS: &str = "arbflow_cache_evictions_total";

pub const TRANSPORT_REQUESTS: &str = "arbflow_transport_requests_total";
pub const TRANSPORT_FAILOVERS: &str = "arbflow_transport_failovers_total";
pub const TRANSPORT_RATE_LIMITED: &str = "arbflow_transport_rate_limited_total";

pub const ROUTER_EVENTS: &str = "arbflow_router_events_total";
pub const ROUTER_DROPPED: &str = "arbflow_router_dropped_total";
pub const ROUTER_HANDLER_ERRORS: &str = "arbflow_router_handler_errors_total";

pub const BREAKER_TRIPS: &str = "arbflow_breaker_trips_total";
pub const INCIDENTS_OPENED: &str = "arbflow_incidents_opened_total";
pub const INCIDENTS_RESOLVED: &str = "arbflow_incidents_resolved_total";
pub const TRADING_ALLOWED: &str = "arbflow_trading_allowed";

/// Describe every metric once at startup.
pub fn describe() {
    describe_counter!(OPPORTUNITIES_RECEIVED, "Opportunities submitted to the pipeline");
    describe_counter!(OPPORTUNITIES_QUEUED, "Opportunities queued for execution");
    describe_counter!(OPPORTUNITIES_REJECTED, "Opportunities rejected, labeled by reason");
    describe_counter!(OPPORTUNITIES_EXECUTED, "Opportunities released to the executor");
    describe_histogram!(PIPELINE_STAGE_LATENCY, "Per-stage pipeline processing latency");
    describe_gauge!(PIPELINE_IN_FLIGHT, "Pipeline contexts in a non-terminal stage");

    describe_counter!(PRICES_AGGREGATED, "Aggregated prices produced");
    describe_counter!(PRICE_OUTLIERS, "Price points discarded as outliers");
    describe_counter!(PRICE_ANOMALIES, "Price anomalies emitted to the pipeline");

    describe_counter!(CACHE_HITS, "Cache hits, labeled by tier");
    describe_counter!(CACHE_MISSES, "Cache misses");
    describe_counter!(CACHE_EVICTIONS, "Local-tier evictions");

    describe_counter!(TRANSPORT_REQUESTS, "Unary transport requests, labeled by endpoint");
    describe_counter!(TRANSPORT_FAILOVERS, "Primary endpoint failovers");
    describe_counter!(TRANSPORT_RATE_LIMITED, "Requests refused by the rate limiter");

    describe_counter!(ROUTER_EVENTS, "Events routed, labeled by priority");
    describe_counter!(ROUTER_DROPPED, "Events dropped on queue overflow");
    describe_counter!(ROUTER_HANDLER_ERRORS, "Handler errors absorbed by the router");

    describe_counter!(BREAKER_TRIPS, "Circuit breaker trips, labeled by breaker");
    describe_counter!(INCIDENTS_OPENED, "Incidents opened by the incident manager");
    describe_counter!(INCIDENTS_RESOLVED, "Incidents resolved");
    describe_gauge!(TRADING_ALLOWED, "1 when the safety plane allows trading");
}
