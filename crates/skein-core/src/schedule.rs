//! Schedule intervals for DAGs.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// User-facing schedule configuration, as written in a DAG definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleConfig {
    /// Seconds-resolution cron expression, e.g. `"0 0 * * * *"` for hourly.
    Cron(String),
    /// Fixed interval between execution dates.
    EverySecs(u64),
    /// A single run at the DAG's start date.
    Once,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig::Once
    }
}

/// Parsed schedule interval.
#[derive(Debug, Clone)]
pub enum ScheduleInterval {
    Cron(Box<cron::Schedule>),
    Every(Duration),
    Once,
}

impl ScheduleInterval {
    /// Parse a schedule configuration, validating it up front so the
    /// scheduling loops never see a malformed interval.
    pub fn parse(dag_id: &str, config: &ScheduleConfig) -> Result<Self> {
        match config {
            ScheduleConfig::Cron(expr) => {
                let schedule =
                    cron::Schedule::from_str(expr).map_err(|e| Error::InvalidSchedule {
                        dag: dag_id.to_string(),
                        reason: format!("bad cron expression `{}`: {}", expr, e),
                    })?;
                Ok(ScheduleInterval::Cron(Box::new(schedule)))
            }
            ScheduleConfig::EverySecs(0) => Err(Error::InvalidSchedule {
                dag: dag_id.to_string(),
                reason: "interval must be at least one second".to_string(),
            }),
            ScheduleConfig::EverySecs(secs) => {
                Ok(ScheduleInterval::Every(Duration::seconds(*secs as i64)))
            }
            ScheduleConfig::Once => Ok(ScheduleInterval::Once),
        }
    }

    /// The next execution date strictly after `prev`, or `None` for a
    /// one-shot schedule.
    pub fn next_after(&self, prev: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ScheduleInterval::Cron(schedule) => schedule.after(&prev).next(),
            ScheduleInterval::Every(delta) => Some(prev + *delta),
            ScheduleInterval::Once => None,
        }
    }
}
