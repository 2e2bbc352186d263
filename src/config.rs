use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, path::PathBuf, time::Duration};

use crate::{Error, InternalResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Used by [`crate::EventHub::register_response_listener_default`].
    #[serde(default = "default_response_timeout", with = "duration_ms")]
    pub default_response_timeout: Duration,

    /// Number of processed events kept for diagnostics. 0 disables history.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Number of most recent events whose sequence position stays known.
    /// Older events can no longer pin a shared state version and read as
    /// if no event had been given.
    #[serde(default = "default_event_number_capacity")]
    pub event_number_capacity: usize,

    /// Upper bound on an extension constructor.
    #[serde(default = "default_init_timeout", with = "duration_ms")]
    pub init_timeout: Duration,

    #[serde(default)]
    pub hit_queue: HitQueueConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            default_response_timeout: default_response_timeout(),
            history_capacity: default_history_capacity(),
            event_number_capacity: default_event_number_capacity(),
            init_timeout: default_init_timeout(),
            hit_queue: HitQueueConfig::default(),
        }
    }
}

impl HubConfig {
    pub fn from_file(path: &str) -> InternalResult<Self> {
        from_file(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitQueueConfig {
    /// Directory holding file backed data queues.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    #[serde(default = "default_file_extension")]
    pub file_extension: String,
}

impl Default for HitQueueConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            file_extension: default_file_extension(),
        }
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> InternalResult<T> {
    let file = File::open(path)
        .map_err(|e| Error::Internal(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::Internal(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> InternalResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| Error::Internal(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_history_capacity() -> usize {
    100
}

fn default_event_number_capacity() -> usize {
    10_000
}

fn default_init_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_storage_dir() -> PathBuf {
    std::env::temp_dir().join("extension-hub")
}

fn default_file_extension() -> String {
    "hits".to_string()
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: HubConfig = from_str(r#"{ "history_capacity": 3 }"#).unwrap();
        assert_eq!(config.history_capacity, 3);
        assert_eq!(config.event_number_capacity, 10_000);
        assert_eq!(config.default_response_timeout, Duration::from_secs(5));
        assert_eq!(config.hit_queue.file_extension, "hits");
    }

    #[test]
    fn test_durations_are_milliseconds() {
        let config: HubConfig = from_str(
            r#"{ "init_timeout": 250, "default_response_timeout": 1500 }"#,
        )
        .unwrap();
        assert_eq!(config.init_timeout, Duration::from_millis(250));
        assert_eq!(config.default_response_timeout, Duration::from_millis(1500));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["init_timeout"], serde_json::json!(250));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "hit_queue": {{ "storage_dir": "/tmp/hits" }} }}"#).unwrap();

        let config = HubConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.hit_queue.storage_dir, PathBuf::from("/tmp/hits"));
        assert!(matches!(
            HubConfig::from_file("/definitely/missing.json"),
            Err(Error::Internal(_))
        ));
    }
}
