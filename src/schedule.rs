//! Cron schedule handling.
//!
//! A job's schedule is declared as up to seven cron-style fields in YAML
//! (`sec min hour dom mon dow year`), each accepting `*`, single values,
//! ranges, steps and lists. The fields are assembled into one expression
//! string and parsed with the `cron` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ConfigError;

/// The raw schedule fields of a job, exactly as written in the config file.
///
/// Everything defaults to `*` except seconds, which default to `0` so a job
/// declared with `min: '*'` fires once per minute rather than once per second.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSpec {
    #[serde(default = "default_sec", deserialize_with = "cron_field")]
    pub sec: String,
    #[serde(default = "default_star", deserialize_with = "cron_field")]
    pub min: String,
    #[serde(default = "default_star", deserialize_with = "cron_field")]
    pub hour: String,
    #[serde(default = "default_star", deserialize_with = "cron_field")]
    pub dom: String,
    #[serde(default = "default_star", deserialize_with = "cron_field")]
    pub mon: String,
    #[serde(default = "default_star", deserialize_with = "cron_field")]
    pub dow: String,
    #[serde(default = "default_star", deserialize_with = "cron_field")]
    pub year: String,
}

fn default_sec() -> String {
    "0".to_string()
}

fn default_star() -> String {
    "*".to_string()
}

/// YAML writes bare numbers for fields like `sec: 0`; accept both scalar
/// shapes.
fn cron_field<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Text(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Num(n) => n.to_string(),
        Raw::Text(s) => s,
    })
}

impl Default for CronSpec {
    fn default() -> Self {
        Self {
            sec: default_sec(),
            min: default_star(),
            hour: default_star(),
            dom: default_star(),
            mon: default_star(),
            dow: default_star(),
            year: default_star(),
        }
    }
}

impl CronSpec {
    /// Assemble the fields into a single expression and parse it.
    pub fn compile(&self) -> Result<cron::Schedule, ConfigError> {
        let expr = format!(
            "{} {} {} {} {} {} {}",
            self.sec, self.min, self.hour, self.dom, self.mon, self.dow, self.year
        );
        cron::Schedule::from_str(&expr).map_err(|e| ConfigError::BadSchedule {
            expr,
            source: e,
        })
    }

    /// Smallest firing time strictly greater than `after`.
    ///
    /// Returns `None` when the schedule has no future firing (e.g. a `year`
    /// field entirely in the past).
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ConfigError> {
        let schedule = self.compile()?;
        Ok(schedule.after(&after).next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn defaults_fire_on_the_minute() {
        let spec = CronSpec::default();
        let next = spec.next_after(at(2026, 1, 1, 10, 30, 15)).unwrap().unwrap();
        assert_eq!(next, at(2026, 1, 1, 10, 31, 0));
    }

    #[test]
    fn next_is_strictly_after_reference() {
        let spec = CronSpec {
            sec: "0".into(),
            min: "*/5".into(),
            ..CronSpec::default()
        };
        let boundary = at(2026, 1, 1, 10, 30, 0);
        let next = spec.next_after(boundary).unwrap().unwrap();
        assert_eq!(next, at(2026, 1, 1, 10, 35, 0));
    }

    #[test]
    fn next_after_advances_monotonically() {
        let spec = CronSpec {
            sec: "*/7".into(),
            min: "*".into(),
            ..CronSpec::default()
        };
        let t0 = at(2026, 3, 1, 0, 0, 0);
        let t1 = spec.next_after(t0).unwrap().unwrap();
        let t2 = spec.next_after(t1).unwrap().unwrap();
        assert!(t1 > t0);
        assert!(t2 > t1);
    }

    #[test]
    fn ranges_lists_and_steps_parse() {
        let spec = CronSpec {
            sec: "0".into(),
            min: "1-5,30,*/15".into(),
            hour: "8-18".into(),
            dow: "Mon-Fri".into(),
            ..CronSpec::default()
        };
        assert!(spec.compile().is_ok());
    }

    #[test]
    fn malformed_field_is_a_config_error() {
        let spec = CronSpec {
            min: "61".into(),
            ..CronSpec::default()
        };
        assert!(spec.compile().is_err());
    }

    #[test]
    fn year_constraint_in_the_past_yields_no_firing() {
        let spec = CronSpec {
            year: "2020".into(),
            ..CronSpec::default()
        };
        assert_eq!(spec.next_after(at(2026, 1, 1, 0, 0, 0)).unwrap(), None);
    }
}
