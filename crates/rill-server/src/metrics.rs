// Metrics module for observability
// Describes the counters and gauges the cluster core emits

use metrics::{describe_counter, describe_gauge};

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    // Membership
    describe_gauge!("rill_cloud_size", "Number of members in the current cloud");

    // Reliable RPC
    describe_counter!(
        "rill_rpc_resends_total",
        "Total number of task requests resent after a timeout"
    );
    describe_counter!(
        "rill_rpc_nacks_total",
        "Total number of NACKs received for tasks still running remotely"
    );

    // Key/value
    describe_counter!(
        "rill_kv_invalidations_total",
        "Total number of replica invalidations sent by home nodes"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_without_recorder() {
        // Descriptions go to the no-op recorder when none is installed
        init_metrics();
        init_metrics();
    }
}
