use std::sync::Arc;

use uuid::Uuid;

use crate::config::Config;

/// A fresh bus namespace name, private to one test.
pub fn test_namespace() -> String {
    format!("test-{}", Uuid::new_v4())
}

/// Build a test config for the given instance on the given namespace, with millisecond-scale
/// timing so protocol rounds settle quickly under test.
pub fn test_config(namespace: &str, instance_id: &str) -> Arc<Config> {
    Arc::new(Config {
        rust_log: String::new(),
        namespace: namespace.to_string(),
        instance_id: instance_id.to_string(),
        election_min_delay_ms: 20,
        election_delay_range_ms: 20,
        startup_timeout_ms: 40,
        heartbeat_interval_ms: 50,
        heartbeat_timeout_ms: 25,
    })
}
