use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp layout used by the `uploadDt` field of the upload history.
pub const UPLOAD_DT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum WorkoutStatus {
    Complete,
    Other(String),
}

impl WorkoutStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, WorkoutStatus::Complete)
    }
}

impl From<String> for WorkoutStatus {
    fn from(status: String) -> Self {
        if status == "COMPLETE" {
            WorkoutStatus::Complete
        } else {
            WorkoutStatus::Other(status)
        }
    }
}

impl From<&str> for WorkoutStatus {
    fn from(status: &str) -> Self {
        WorkoutStatus::from(status.to_string())
    }
}

impl fmt::Display for WorkoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkoutStatus::Complete => write!(f, "COMPLETE"),
            WorkoutStatus::Other(status) => write!(f, "{status}"),
        }
    }
}

// Entry of the paged workout listing
#[derive(Debug, Clone, Deserialize)]
pub struct RecentWorkout {
    pub id: String,
    pub status: WorkoutStatus,
    #[serde(default)]
    pub fitness_discipline: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Instructor {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ride {
    pub title: Option<String>,
    pub duration: Option<i64>,
    pub instructor: Option<Instructor>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkoutDetail {
    pub id: String,
    pub fitness_discipline: Option<String>,
    /// Epoch seconds
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub ride: Option<Ride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkoutSummary {
    pub calories: Option<f64>,
    /// Miles
    pub distance: Option<f64>,
    pub avg_heart_rate: Option<f64>,
    pub max_heart_rate: Option<f64>,
    /// Miles per hour
    pub max_speed: Option<f64>,
    pub avg_cadence: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SampleMetric {
    pub slug: String,
    #[serde(default)]
    pub display_unit: Option<String>,
    #[serde(default)]
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SampleSummary {
    pub slug: String,
    #[serde(default)]
    pub display_unit: Option<String>,
    pub value: Option<f64>,
}

// Performance graph of a workout, one value per offset in each metric series
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkoutSamples {
    pub duration: Option<i64>,
    #[serde(default)]
    pub seconds_since_pedaling_start: Vec<i64>,
    #[serde(default)]
    pub metrics: Vec<SampleMetric>,
    #[serde(default)]
    pub summaries: Vec<SampleSummary>,
}

impl WorkoutSamples {
    pub fn metric(&self, slug: &str) -> Option<&SampleMetric> {
        self.metrics.iter().find(|metric| metric.slug == slug)
    }

    pub fn summary(&self, slug: &str) -> Option<&SampleSummary> {
        self.summaries.iter().find(|summary| summary.slug == slug)
    }
}

/// A complete workout with everything the converter needs.
#[derive(Debug, Clone)]
pub struct Workout {
    pub id: String,
    pub status: WorkoutStatus,
    pub detail: WorkoutDetail,
    pub summary: WorkoutSummary,
    pub samples: WorkoutSamples,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityType {
    Cycling,
    Running,
    Walking,
    Other,
}

impl ActivityType {
    pub fn from_discipline(discipline: Option<&str>) -> Self {
        match discipline {
            Some("cycling") | Some("bike_bootcamp") => ActivityType::Cycling,
            Some("running") => ActivityType::Running,
            Some("walking") => ActivityType::Walking,
            _ => ActivityType::Other,
        }
    }

    /// Value of the TCX `Sport` attribute, which only knows three sports.
    pub fn tcx_sport(&self) -> &'static str {
        match self {
            ActivityType::Cycling => "Biking",
            ActivityType::Running => "Running",
            ActivityType::Walking | ActivityType::Other => "Other",
        }
    }

    pub fn garmin_type_key(&self) -> String {
        self.to_string().to_lowercase()
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityType::Cycling => write!(f, "Cycling"),
            ActivityType::Running => write!(f, "Running"),
            ActivityType::Walking => write!(f, "Walking"),
            ActivityType::Other => write!(f, "Other"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionResult {
    pub title: String,
    pub filename: String,
    pub activity_type: ActivityType,
}

// garminUploadHistory table record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub workout_id: String,
    pub title: String,
    #[serde(with = "upload_dt")]
    pub upload_dt: NaiveDateTime,
}

impl UploadRecord {
    pub fn now(workout_id: &str, title: &str) -> Self {
        Self {
            workout_id: workout_id.to_string(),
            title: title.to_string(),
            upload_dt: Local::now().naive_local(),
        }
    }
}

mod upload_dt {
    use super::UPLOAD_DT_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &NaiveDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&value.format(UPLOAD_DT_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, UPLOAD_DT_FORMAT).map_err(serde::de::Error::custom)
    }
}
