use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

use super::SchedulerError;

/// Dispatch priority; higher variants run first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = SchedulerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(SchedulerError::UnknownPriority(other.to_string())),
        }
    }
}

/// A recurring scraping target and its cadence policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRegistration {
    pub source_id: String,
    pub brand_id: String,
    pub url: String,
    pub source_type: String,
    pub base_frequency: Duration,
    pub min_frequency: Duration,
    pub max_frequency: Duration,
    pub priority: Priority,
    pub enabled: bool,
    pub country: Option<String>,
    pub keywords: Vec<String>,
    pub selectors: BTreeMap<String, String>,
}

impl SourceRegistration {
    pub fn new(
        source_id: impl Into<String>,
        brand_id: impl Into<String>,
        url: impl Into<String>,
        source_type: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            brand_id: brand_id.into(),
            url: url.into(),
            source_type: source_type.into(),
            base_frequency: Duration::from_secs(3600),
            min_frequency: Duration::from_secs(300),
            max_frequency: Duration::from_secs(86_400),
            priority: Priority::Normal,
            enabled: true,
            country: None,
            keywords: Vec::new(),
            selectors: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_frequency(mut self, base: Duration) -> Self {
        self.base_frequency = base;
        self
    }

    pub fn with_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_frequency = min;
        self.max_frequency = max;
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn with_selectors(mut self, selectors: BTreeMap<String, String>) -> Self {
        self.selectors = selectors;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Rejects inverted bounds and clamps the base frequency into them.
    pub(crate) fn normalized(mut self) -> Result<Self, SchedulerError> {
        if self.min_frequency > self.max_frequency {
            return Err(SchedulerError::InvalidFrequencyBounds {
                source_id: self.source_id,
                min: self.min_frequency,
                max: self.max_frequency,
            });
        }
        self.base_frequency = self
            .base_frequency
            .clamp(self.min_frequency, self.max_frequency);
        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One scheduled unit of work for a registered source.
#[derive(Debug, Clone)]
pub struct ScrapingJob {
    pub id: String,
    pub source_id: String,
    pub brand_id: String,
    pub url: String,
    pub source_type: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Instant,
    pub last_run: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub avg_duration: Option<Duration>,
}

impl ScrapingJob {
    pub(crate) fn for_source(source: &SourceRegistration, scheduled_at: Instant) -> Self {
        let created_at = Utc::now();
        Self {
            id: format!("job_{}_{}", source.source_id, created_at.timestamp_millis()),
            source_id: source.source_id.clone(),
            brand_id: source.brand_id.clone(),
            url: source.url.clone(),
            source_type: source.source_type.clone(),
            priority: source.priority,
            created_at,
            scheduled_at,
            last_run: None,
            status: JobStatus::Pending,
            last_error: None,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            avg_duration: None,
        }
    }

    pub(crate) fn record_run(&mut self, report: &JobReport, duration: Duration) {
        self.run_count += 1;
        if report.success {
            self.success_count += 1;
            self.consecutive_failures = 0;
            self.status = JobStatus::Succeeded;
            self.last_error = None;
            self.avg_duration = Some(match self.avg_duration {
                Some(avg) => avg.mul_f64(0.7) + duration.mul_f64(0.3),
                None => duration,
            });
        } else {
            self.failure_count += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.status = JobStatus::Failed;
            self.last_error = report.error.clone();
        }
    }

    pub fn snapshot(&self, now: Instant) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            source_id: self.source_id.clone(),
            url: self.url.clone(),
            source_type: self.source_type.clone(),
            priority: self.priority,
            status: self.status,
            scheduled_at: wall_clock(self.scheduled_at, now),
            last_run: self.last_run,
            run_count: self.run_count,
            success_count: self.success_count,
            failure_count: self.failure_count,
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only view of a job for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub source_id: String,
    pub url: String,
    pub source_type: String,
    pub priority: Priority,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_error: Option<String>,
}

/// What an executor reports back for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub success: bool,
    pub error: Option<String>,
}

impl JobReport {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

fn wall_clock(at: Instant, now: Instant) -> DateTime<Utc> {
    let to_delta = |d: Duration| chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero());
    let utc_now = Utc::now();
    if at >= now {
        utc_now + to_delta(at - now)
    } else {
        utc_now - to_delta(now - at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_order_and_parse() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn registration_clamps_base_frequency() {
        let source = SourceRegistration::new("s1", "b1", "https://example.com", "review")
            .with_frequency(Duration::from_secs(60))
            .normalized()
            .unwrap();
        assert_eq!(source.base_frequency, Duration::from_secs(300));

        let inverted = SourceRegistration::new("s2", "b1", "https://example.com", "review")
            .with_bounds(Duration::from_secs(600), Duration::from_secs(60))
            .normalized();
        assert!(matches!(inverted, Err(SchedulerError::InvalidFrequencyBounds { .. })));
    }

    #[test]
    fn consecutive_failures_reset_on_success() {
        let source = SourceRegistration::new("s1", "b1", "https://example.com", "review");
        let mut job = ScrapingJob::for_source(&source, Instant::now());
        job.record_run(&JobReport::failure("timeout"), Duration::from_secs(1));
        job.record_run(&JobReport::failure("timeout"), Duration::from_secs(1));
        assert_eq!(job.consecutive_failures, 2);
        assert_eq!(job.last_error.as_deref(), Some("timeout"));

        job.record_run(&JobReport::success(), Duration::from_secs(4));
        assert_eq!(job.consecutive_failures, 0);
        assert_eq!(job.failure_count, 2);
        assert_eq!(job.avg_duration, Some(Duration::from_secs(4)));
    }
}
