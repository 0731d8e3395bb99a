use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded probe loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessPolicy {
    #[serde(with = "humantime_serde_compat")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub interval: Duration,
}

impl ReadinessPolicy {
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_millis(500))
    }
}

/// Knobs of the cluster orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Prefix for every network, container, and volume name.
    pub name_prefix: String,
    /// PostgreSQL image repository; the requested version is used as tag.
    pub image: String,
    pub max_nodes: u32,
    pub admin_user: String,
    pub replication_user: String,
    /// Waiting for `pg_isready` after a container starts.
    pub readiness: ReadinessPolicy,
    /// Waiting for a promoted replica to leave recovery.
    pub promotion: ReadinessPolicy,
    #[serde(with = "humantime_serde_compat")]
    pub restart_settle: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub event_timeout: Duration,
    pub default_log_tail: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            name_prefix: "keelson".to_string(),
            image: "postgres".to_string(),
            max_nodes: 10,
            admin_user: "postgres".to_string(),
            replication_user: "replicator".to_string(),
            readiness: ReadinessPolicy::default(),
            promotion: ReadinessPolicy::new(
                Duration::from_secs(30),
                Duration::from_millis(500),
            ),
            restart_settle: Duration::from_secs(2),
            event_timeout: Duration::from_secs(5),
            default_log_tail: 100,
        }
    }
}

impl OrchestratorConfig {
    /// Short waits for driving the orchestrator against an in-memory runtime.
    pub fn fast() -> Self {
        let quick =
            ReadinessPolicy::new(Duration::from_millis(200), Duration::from_millis(5));
        Self {
            readiness: quick,
            promotion: quick,
            restart_settle: Duration::from_millis(1),
            event_timeout: Duration::from_millis(200),
            ..Self::default()
        }
    }
}

/// Durations travel as humantime strings ("30s", "500ms").
mod humantime_serde_compat {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_round_trip_as_humantime() {
        let config = OrchestratorConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["restart_settle"], "2s");
        assert_eq!(json["readiness"]["interval"], "500ms");
        let parsed: OrchestratorConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_documents_fill_defaults() {
        let parsed: OrchestratorConfig =
            serde_json::from_str(r#"{"max_nodes": 5, "restart_settle": "1s"}"#)
                .unwrap();
        assert_eq!(parsed.max_nodes, 5);
        assert_eq!(parsed.restart_settle, Duration::from_secs(1));
        assert_eq!(parsed.default_log_tail, 100);
    }
}
