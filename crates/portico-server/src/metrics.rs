//! Metric name constants.
//!
//! Recorded through the `metrics` facade; embedders install whichever
//! recorder they use. Without one every call is a no-op.

/// Sessions registered total (counter, labels: path).
pub const WS_SESSIONS_TOTAL: &str = "ws_sessions_total";
/// Live sessions (gauge, labels: path).
pub const WS_SESSIONS_ACTIVE: &str = "ws_sessions_active";
/// Sessions removed by a sweep (counter, labels: path).
pub const WS_SWEEP_EVICTIONS_TOTAL: &str = "ws_sweep_evictions_total";
/// Sweeps skipped because one was already running (counter, labels: path).
pub const WS_SWEEP_SKIPPED_TOTAL: &str = "ws_sweep_skipped_total";
/// Broadcast deliveries that failed (counter, labels: path).
pub const WS_BROADCAST_FAILURES_TOTAL: &str = "ws_broadcast_failures_total";
/// Upgrade requests rejected during the handshake (counter, labels: status).
pub const WS_HANDSHAKE_REJECTIONS_TOTAL: &str = "ws_handshake_rejections_total";
/// TCP connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Outbound frames dropped because a session's queue was full (counter).
pub const WS_MESSAGES_DROPPED_TOTAL: &str = "ws_messages_dropped_total";
/// Upgrades abandoned for taking longer than the handshake timeout (counter).
pub const WS_HANDSHAKE_TIMEOUTS_TOTAL: &str = "ws_handshake_timeouts_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_SESSIONS_TOTAL,
            WS_SESSIONS_ACTIVE,
            WS_SWEEP_EVICTIONS_TOTAL,
            WS_SWEEP_SKIPPED_TOTAL,
            WS_BROADCAST_FAILURES_TOTAL,
            WS_HANDSHAKE_REJECTIONS_TOTAL,
            WS_CONNECTIONS_TOTAL,
            WS_MESSAGES_DROPPED_TOTAL,
            WS_HANDSHAKE_TIMEOUTS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
