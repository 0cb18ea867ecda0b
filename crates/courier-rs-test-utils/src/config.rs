use courier_rs_config::{ClusterConfig, CourierConfig, QueueConfig, RefreshConfig};

/// Config with short timeouts for tests under paused time.
///
/// Queue size 4, read timeout 1s, write timeout 20ms, poll interval 10ms,
/// and a page size of 2 so paging is exercised. Lease and aging interval
/// keep their defaults.
pub fn fast_config(node_id: &str) -> CourierConfig {
    CourierConfig::builder()
        .queue(QueueConfig {
            size: 4,
            read_timeout_millis: 1_000,
            write_timeout_millis: 20,
            poll_interval_millis: 10,
            ..QueueConfig::default()
        })
        .pull(RefreshConfig {
            refresh_timeout_millis: 45_000,
            wait_min_millis: 2_000,
            wait_max_millis: 6_000,
        })
        .poll(RefreshConfig {
            refresh_timeout_millis: 60_000,
            wait_min_millis: 6_000,
            wait_max_millis: 10_000,
        })
        .cluster(ClusterConfig {
            page_size: 2,
            ..ClusterConfig::default()
        })
        .node_id(node_id)
        .build()
}
