//! Metric names recorded through the `metrics` facade.
//!
//! The library installs no recorder; embedding applications choose an
//! exporter.

/// Connections accepted (counter).
pub const CONNECTIONS_TOTAL: &str = "hubwire_connections_total";
/// Active connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "hubwire_connections_active";
/// Disconnections (counter, labels: reason).
pub const DISCONNECTIONS_TOTAL: &str = "hubwire_disconnections_total";
/// Connection lifetime in seconds (histogram).
pub const CONNECTION_DURATION_SECONDS: &str = "hubwire_connection_duration_seconds";
/// Hub method invocations (counter, labels: method).
pub const METHOD_CALLS_TOTAL: &str = "hubwire_method_calls_total";
/// Hub method failures (counter, labels: method, `error_type`).
pub const METHOD_ERRORS_TOTAL: &str = "hubwire_method_errors_total";
/// Hub method duration in seconds (histogram, labels: method).
pub const METHOD_DURATION_SECONDS: &str = "hubwire_method_duration_seconds";
/// Requests for unknown method ids (counter).
pub const METHOD_NOT_FOUND_TOTAL: &str = "hubwire_method_not_found_total";
/// Frames queued by group broadcasts (counter).
pub const BROADCAST_DELIVERIES_TOTAL: &str = "hubwire_broadcast_deliveries_total";
/// Broadcast frames dropped on a full or closed queue (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "hubwire_broadcast_drops_total";
/// Connections closed for exceeding the drop threshold (counter).
pub const SLOW_CLIENT_DISCONNECTS_TOTAL: &str = "hubwire_slow_client_disconnects_total";
/// Server heartbeat ticks (counter).
pub const HEARTBEAT_TICKS_TOTAL: &str = "hubwire_heartbeat_ticks_total";
/// Heartbeat timeouts (counter).
pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "hubwire_heartbeat_timeouts_total";
/// Heartbeat round-trip latency in seconds (histogram).
pub const HEARTBEAT_LATENCY_SECONDS: &str = "hubwire_heartbeat_latency_seconds";
/// Client-result calls issued (counter).
pub const CLIENT_RESULT_CALLS_TOTAL: &str = "hubwire_client_result_calls_total";
/// Client-result calls that failed (counter, labels: `error_type`).
pub const CLIENT_RESULT_FAULTS_TOTAL: &str = "hubwire_client_result_faults_total";
/// Client-result round trip in seconds (histogram).
pub const CLIENT_RESULT_DURATION_SECONDS: &str = "hubwire_client_result_duration_seconds";
