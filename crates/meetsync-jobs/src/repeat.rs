//! Cron recurrence for repeatable jobs.

use crate::error::{QueueError, QueueResult};
use crate::job::{JobId, JobOptions, NewJob, RepeatOptions};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Parsed cron schedule evaluated in its timezone.
#[derive(Debug, Clone)]
pub struct RepeatSchedule {
    schedule: Schedule,
    tz: Tz,
}

impl RepeatSchedule {
    /// Parse repeat options.
    ///
    /// Five-field patterns have minute precision and get a zero seconds
    /// field prepended; six and seven-field patterns are used as is.
    pub fn parse(repeat: &RepeatOptions) -> QueueResult<Self> {
        let expression = normalize_pattern(&repeat.pattern);
        let schedule = Schedule::from_str(&expression).map_err(|e| {
            QueueError::Validation(format!("Invalid cron expression '{}': {}", repeat.pattern, e))
        })?;

        let tz = match repeat.timezone.as_deref() {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| QueueError::Validation(format!("Invalid timezone: {}", name)))?,
            None => chrono_tz::UTC,
        };

        Ok(Self { schedule, tz })
    }

    /// Next fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let after_tz = after.with_timezone(&self.tz);
        let next_tz = self.schedule.after(&after_tz).next()?;
        Some(next_tz.with_timezone(&Utc))
    }
}

fn normalize_pattern(pattern: &str) -> String {
    let pattern = pattern.trim();
    if pattern.split_whitespace().count() == 5 {
        format!("0 {}", pattern)
    } else {
        pattern.to_string()
    }
}

/// Key identifying one recurrence within a queue.
pub fn repeat_key(job_type: &str, idempotency_key: &str, repeat: &RepeatOptions) -> String {
    format!(
        "{}:{}:{}:{}",
        job_type,
        idempotency_key,
        repeat.timezone.as_deref().unwrap_or(""),
        repeat.pattern.trim()
    )
}

/// Id of the job instance materialized for one fire time.
///
/// Deterministic, so that two schedulers firing the same recurrence
/// collide on insert instead of duplicating the job.
pub fn instance_id(repeat_key: &str, fire_at: DateTime<Utc>) -> JobId {
    JobId::from_string(format!("repeat:{}:{}", repeat_key, fire_at.timestamp_millis()))
}

/// A registered recurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatableJob {
    /// Repeat key.
    pub key: String,

    /// Job type of every instance.
    pub name: String,

    /// Job data template copied into every instance.
    pub data: Value,

    /// Options of every instance (without `repeat`).
    pub opts: JobOptions,

    /// Cron pattern.
    pub pattern: String,

    /// IANA timezone.
    pub timezone: Option<String>,

    /// Next fire time.
    pub next: DateTime<Utc>,
}

impl RepeatableJob {
    /// Build a recurrence, computing its first fire time after `now`.
    pub fn new(
        name: impl Into<String>,
        idempotency_key: &str,
        data: Value,
        opts: JobOptions,
        repeat: &RepeatOptions,
        now: DateTime<Utc>,
    ) -> QueueResult<Self> {
        let name = name.into();
        let schedule = RepeatSchedule::parse(repeat)?;
        let next = schedule.next_after(now).ok_or_else(|| {
            QueueError::Validation(format!("Cron expression '{}' never fires", repeat.pattern))
        })?;

        let mut opts = opts;
        opts.repeat = None;
        opts.job_id = None;
        opts.delay_ms = None;

        Ok(Self {
            key: repeat_key(&name, idempotency_key, repeat),
            name,
            data,
            opts,
            pattern: repeat.pattern.clone(),
            timezone: repeat.timezone.clone(),
            next,
        })
    }

    /// The job instance for the current fire time.
    ///
    /// Each instance gets its own idempotency key (the instance id) and a
    /// fresh creation time, so earlier fires neither short-circuit it nor
    /// make it look stale.
    pub fn instance(&self, now: DateTime<Utc>) -> NewJob {
        let id = instance_id(&self.key, self.next);
        let mut data = self.data.clone();
        if let Value::Object(fields) = &mut data {
            fields.insert("idempotencyKey".to_string(), Value::String(id.to_string()));
            fields.insert("createdAt".to_string(), Value::String(now.to_rfc3339()));
        }

        NewJob {
            id,
            name: self.name.clone(),
            data,
            opts: self.opts.clone(),
            created_at: now,
            scheduled_at: now,
            repeat_key: Some(self.key.clone()),
        }
    }

    /// Recurrence options.
    pub fn repeat_options(&self) -> RepeatOptions {
        RepeatOptions {
            pattern: self.pattern.clone(),
            timezone: self.timezone.clone(),
        }
    }

    /// Advance `next` past `now`. Missed fire times are skipped, not
    /// replayed. Returns false if the schedule is exhausted.
    pub fn advance(&mut self, now: DateTime<Utc>) -> bool {
        let schedule = match RepeatSchedule::parse(&self.repeat_options()) {
            Ok(schedule) => schedule,
            Err(_) => return false,
        };

        match schedule.next_after(now.max(self.next)) {
            Some(next) => {
                self.next = next;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use serde_json::json;

    #[test]
    fn test_five_field_pattern_has_minute_precision() {
        let schedule = RepeatSchedule::parse(&RepeatOptions::cron("*/5 * * * *")).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 10, 2, 30).unwrap();

        let next = schedule.next_after(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap());
    }

    #[test]
    fn test_timezone_is_applied() {
        let repeat = RepeatOptions::cron("0 0 9 * * *").in_timezone("Asia/Shanghai");
        let schedule = RepeatSchedule::parse(&repeat).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        let next = schedule.next_after(after).unwrap();
        // 09:00 in Shanghai is 01:00 UTC.
        assert_eq!(next.hour(), 1);
    }

    #[test]
    fn test_invalid_pattern_and_timezone() {
        assert!(matches!(
            RepeatSchedule::parse(&RepeatOptions::cron("not a cron")),
            Err(QueueError::Validation(_))
        ));
        assert!(matches!(
            RepeatSchedule::parse(&RepeatOptions::cron("* * * * *").in_timezone("Mars/Olympus")),
            Err(QueueError::Validation(_))
        ));
    }

    #[test]
    fn test_repeat_key_and_instance_id() {
        let repeat = RepeatOptions::cron("0 * * * *").in_timezone("UTC");
        let key = repeat_key("sync_record", "hourly-sync", &repeat);
        assert_eq!(key, "sync_record:hourly-sync:UTC:0 * * * *");

        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            instance_id(&key, at).as_str(),
            format!("repeat:{}:{}", key, at.timestamp_millis())
        );
    }

    #[test]
    fn test_advance_skips_missed_fires() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut job = RepeatableJob::new(
            "sync_record",
            "hourly",
            json!({}),
            JobOptions::new(),
            &RepeatOptions::cron("0 * * * *"),
            start,
        )
        .unwrap();
        assert_eq!(job.next, Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap());

        assert!(job.advance(Utc.with_ymd_and_hms(2024, 1, 1, 5, 30, 0).unwrap()));
        assert_eq!(job.next, Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap());
    }

    #[test]
    fn test_instance_gets_its_own_key_and_creation_time() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let job = RepeatableJob::new(
            "sync_record",
            "hourly",
            json!({"idempotencyKey": "hourly", "createdAt": start.to_rfc3339()}),
            JobOptions::new().attempts(2),
            &RepeatOptions::cron("0 * * * *"),
            start,
        )
        .unwrap();

        let fired_at = Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 3).unwrap();
        let instance = job.instance(fired_at);

        assert_eq!(instance.id, instance_id(&job.key, job.next));
        assert_eq!(instance.data["idempotencyKey"], instance.id.as_str());
        assert_eq!(instance.data["createdAt"], fired_at.to_rfc3339());
        assert_eq!(instance.repeat_key.as_deref(), Some(job.key.as_str()));
        assert_eq!(instance.opts.attempts, Some(2));
    }
}
