//! Configuration loading. One JSON file next to the tracking state holds the
//! tracker credentials, the work schedule and the transition names.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{Duration, FixedOffset, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schedule::{InvalidSchedule, WorkSchedule};

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration found at {path:?}, create it with your tracker host and credentials")]
    Missing { path: PathBuf },
    #[error("failed to read configuration at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration at {path:?} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {field}")]
    InvalidField { field: &'static str, value: String },
    #[error(transparent)]
    Schedule(#[from] InvalidSchedule),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub username: String,
    pub password: String,

    #[serde(default = "default_day_start")]
    pub day_start: String,
    #[serde(default = "default_break_start")]
    pub break_start: String,
    #[serde(default = "default_break_end")]
    pub break_end: String,
    #[serde(default = "default_day_end")]
    pub day_end: String,
    #[serde(default = "default_working_weekdays")]
    pub working_weekdays: Vec<String>,
    /// Offset of the schedule's wall clock relative to UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,

    #[serde(default = "default_min_loggable_minutes")]
    pub min_loggable_minutes: i64,

    #[serde(default = "default_start_transition")]
    pub start_transition: String,
    #[serde(default = "default_stop_transition")]
    pub stop_transition: String,
    #[serde(default = "default_deselect_transition")]
    pub deselect_transition: String,
    #[serde(default = "default_next_status")]
    pub next_status: String,
    #[serde(default = "default_in_progress_status")]
    pub in_progress_status: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_day_start() -> String {
    "08:47".into()
}

fn default_break_start() -> String {
    "12:20".into()
}

fn default_break_end() -> String {
    "13:00".into()
}

fn default_day_end() -> String {
    "17:15".into()
}

fn default_working_weekdays() -> Vec<String> {
    ["Mon", "Tue", "Wed", "Thu", "Fri"]
        .map(String::from)
        .to_vec()
}

fn default_min_loggable_minutes() -> i64 {
    1
}

fn default_start_transition() -> String {
    "Start progress".into()
}

fn default_stop_transition() -> String {
    "Stop progress".into()
}

fn default_deselect_transition() -> String {
    "Deselect".into()
}

fn default_next_status() -> String {
    "Next".into()
}

fn default_in_progress_status() -> String {
    "In Progress".into()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Config {
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ConfigError::Missing { path })
            }
            Err(e) => return Err(ConfigError::Io { path, source: e }),
        };
        serde_json::from_str(&contents).map_err(|e| ConfigError::Malformed { path, source: e })
    }

    /// Builds the validated schedule out of the raw string fields.
    pub fn schedule(&self) -> Result<WorkSchedule, ConfigError> {
        let weekdays = self
            .working_weekdays
            .iter()
            .map(|day| {
                day.parse::<Weekday>().map_err(|_| ConfigError::InvalidField {
                    field: "working_weekdays",
                    value: day.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(WorkSchedule::new(
            parse_time(&self.day_start, "day_start")?,
            parse_time(&self.break_start, "break_start")?,
            parse_time(&self.break_end, "break_end")?,
            parse_time(&self.day_end, "day_end")?,
            weekdays,
        )?)
    }

    pub fn local_offset(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or(ConfigError::InvalidField {
            field: "utc_offset_minutes",
            value: self.utc_offset_minutes.to_string(),
        })
    }

    pub fn min_loggable(&self) -> Duration {
        Duration::minutes(self.min_loggable_minutes)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_time(value: &str, field: &'static str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| ConfigError::InvalidField {
            field,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::Weekday;
    use tempfile::tempdir;

    use super::{Config, ConfigError, CONFIG_FILE};

    fn minimal() -> Config {
        serde_json::from_str(
            r#"{
                "host": "https://jira.example.com",
                "username": "me",
                "password": "secret"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = minimal();
        assert_eq!(config.day_start, "08:47");
        assert_eq!(config.stop_transition, "Stop progress");
        assert_eq!(config.next_status, "Next");
        assert_eq!(config.min_loggable_minutes, 1);
        assert_eq!(config.utc_offset_minutes, 0);
    }

    #[test]
    fn test_schedule_from_defaults() {
        let schedule = minimal().schedule().unwrap();
        assert!(schedule.is_working_day(Weekday::Mon));
        assert!(!schedule.is_working_day(Weekday::Sat));
    }

    #[test]
    fn test_rejects_unparsable_time() {
        let mut config = minimal();
        config.day_start = "late".into();
        assert!(matches!(
            config.schedule(),
            Err(ConfigError::InvalidField {
                field: "day_start",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_unknown_weekday() {
        let mut config = minimal();
        config.working_weekdays = vec!["Funday".into()];
        assert!(matches!(
            config.schedule(),
            Err(ConfigError::InvalidField {
                field: "working_weekdays",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_unordered_schedule() {
        let mut config = minimal();
        config.break_start = "07:00".into();
        assert!(matches!(config.schedule(), Err(ConfigError::Schedule(_))));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(ConfigError::Missing { .. })
        ));
    }

    #[test]
    fn test_malformed_file() -> Result<()> {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{")?;
        assert!(matches!(
            Config::load(dir.path()),
            Err(ConfigError::Malformed { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_load_round_trip() -> Result<()> {
        let dir = tempdir().unwrap();
        let config = minimal();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            serde_json::to_string_pretty(&config)?,
        )?;

        let loaded = Config::load(dir.path())?;
        assert_eq!(loaded.host, "https://jira.example.com");
        assert_eq!(loaded.day_end, "17:15");
        Ok(())
    }
}
