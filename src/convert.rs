use crate::common::types::{
    ActivityType, ConversionResult, SampleMetric, Workout, WorkoutDetail, WorkoutSamples,
};
use chrono::DateTime;
use sanitize_filename::sanitize;
use serde::Serialize;
use std::fs;
use std::path::Path;

const METERS_PER_MILE: f64 = 1609.344;
const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

#[derive(Debug)]
pub enum ConvertError {
    MissingField(&'static str),
    Xml(String),
    Io(std::io::Error),
}

impl std::fmt::Display for ConvertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConvertError::MissingField(field) => write!(f, "workout has no {field}"),
            ConvertError::Xml(msg) => write!(f, "TCX serialization error: {msg}"),
            ConvertError::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for ConvertError {}

impl From<std::io::Error> for ConvertError {
    fn from(err: std::io::Error) -> Self {
        ConvertError::Io(err)
    }
}

pub trait WorkoutConverter {
    /// Writes the activity file for `workout` into `output_dir`.
    fn convert(
        &self,
        workout: &Workout,
        output_dir: &Path,
    ) -> Result<ConversionResult, ConvertError>;
}

impl<T: WorkoutConverter + ?Sized> WorkoutConverter for &T {
    fn convert(
        &self,
        workout: &Workout,
        output_dir: &Path,
    ) -> Result<ConversionResult, ConvertError> {
        (**self).convert(workout, output_dir)
    }
}

/// Writes workouts as Garmin Training Center (TCX) files.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcxConverter;

impl WorkoutConverter for TcxConverter {
    fn convert(
        &self,
        workout: &Workout,
        output_dir: &Path,
    ) -> Result<ConversionResult, ConvertError> {
        let start_time = workout
            .detail
            .start_time
            .ok_or(ConvertError::MissingField("start_time"))?;
        let title = workout_title(&workout.detail);
        let filename = tcx_filename(start_time, &title, &workout.id);
        let activity_type =
            ActivityType::from_discipline(workout.detail.fitness_discipline.as_deref());

        let xml = render_tcx(workout, start_time, activity_type)?;

        fs::create_dir_all(output_dir)?;
        fs::write(output_dir.join(&filename), xml)?;

        Ok(ConversionResult {
            title,
            filename,
            activity_type,
        })
    }
}

pub fn workout_title(detail: &WorkoutDetail) -> String {
    let ride = detail.ride.as_ref();
    let ride_title = ride.and_then(|ride| ride.title.as_deref());
    let instructor = ride
        .and_then(|ride| ride.instructor.as_ref())
        .and_then(|instructor| instructor.name.as_deref());

    match (ride_title, instructor) {
        (Some(title), Some(name)) => format!("{title} with {name}"),
        (Some(title), None) => title.to_string(),
        _ => "Peloton Workout".to_string(),
    }
}

pub fn tcx_filename(start_time: i64, title: &str, workout_id: &str) -> String {
    format!("{}-{}-{}.tcx", start_time, sanitize(title), sanitize(workout_id))
}

#[derive(Serialize)]
struct TrainingCenterDatabase {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "@xmlns:ns3")]
    xmlns_ns3: &'static str,
    #[serde(rename = "@xmlns:xsi")]
    xmlns_xsi: &'static str,
    #[serde(rename = "@xsi:schemaLocation")]
    schema_location: &'static str,
    #[serde(rename = "Activities")]
    activities: Activities,
}

#[derive(Serialize)]
struct Activities {
    #[serde(rename = "Activity")]
    activity: Activity,
}

#[derive(Serialize)]
struct Activity {
    #[serde(rename = "@Sport")]
    sport: &'static str,
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Lap")]
    lap: Lap,
}

// Element order follows the TCX v2 schema
#[derive(Serialize)]
struct Lap {
    #[serde(rename = "@StartTime")]
    start_time: String,
    #[serde(rename = "TotalTimeSeconds")]
    total_time_seconds: f64,
    #[serde(rename = "DistanceMeters")]
    distance_meters: f64,
    #[serde(rename = "MaximumSpeed", skip_serializing_if = "Option::is_none")]
    maximum_speed: Option<f64>,
    #[serde(rename = "Calories")]
    calories: u32,
    #[serde(rename = "AverageHeartRateBpm", skip_serializing_if = "Option::is_none")]
    average_heart_rate: Option<HeartRate>,
    #[serde(rename = "MaximumHeartRateBpm", skip_serializing_if = "Option::is_none")]
    maximum_heart_rate: Option<HeartRate>,
    #[serde(rename = "Intensity")]
    intensity: &'static str,
    #[serde(rename = "Cadence", skip_serializing_if = "Option::is_none")]
    cadence: Option<u32>,
    #[serde(rename = "TriggerMethod")]
    trigger_method: &'static str,
    // A Track must hold at least one Trackpoint
    #[serde(rename = "Track", skip_serializing_if = "Option::is_none")]
    track: Option<Track>,
}

#[derive(Serialize)]
struct HeartRate {
    #[serde(rename = "Value")]
    value: u32,
}

#[derive(Serialize)]
struct Track {
    #[serde(rename = "Trackpoint")]
    trackpoints: Vec<Trackpoint>,
}

#[derive(Serialize)]
struct Trackpoint {
    #[serde(rename = "Time")]
    time: String,
    #[serde(rename = "DistanceMeters", skip_serializing_if = "Option::is_none")]
    distance_meters: Option<f64>,
    #[serde(rename = "HeartRateBpm", skip_serializing_if = "Option::is_none")]
    heart_rate: Option<HeartRate>,
    #[serde(rename = "Cadence", skip_serializing_if = "Option::is_none")]
    cadence: Option<u32>,
    #[serde(rename = "Extensions", skip_serializing_if = "Option::is_none")]
    extensions: Option<Extensions>,
}

#[derive(Serialize)]
struct Extensions {
    #[serde(rename = "ns3:TPX")]
    tpx: Tpx,
}

#[derive(Serialize)]
struct Tpx {
    #[serde(rename = "ns3:Speed", skip_serializing_if = "Option::is_none")]
    speed: Option<f64>,
    #[serde(rename = "ns3:Watts", skip_serializing_if = "Option::is_none")]
    watts: Option<u32>,
}

fn render_tcx(
    workout: &Workout,
    start_time: i64,
    activity_type: ActivityType,
) -> Result<String, ConvertError> {
    let samples = &workout.samples;
    let (trackpoints, track_distance) = build_trackpoints(samples, start_time)?;

    let total_time_seconds = workout
        .detail
        .end_time
        .filter(|end| *end > start_time)
        .map(|end| end - start_time)
        .or(samples.duration)
        .or_else(|| samples.seconds_since_pedaling_start.last().copied())
        .unwrap_or(0) as f64;

    let distance_meters = samples
        .summary("distance")
        .and_then(|summary| {
            summary
                .value
                .map(|value| distance_to_meters(value, summary.display_unit.as_deref()))
        })
        .or_else(|| workout.summary.distance.map(|miles| miles * METERS_PER_MILE))
        .unwrap_or(track_distance);

    let calories = workout
        .summary
        .calories
        .or_else(|| samples.summary("calories").and_then(|summary| summary.value))
        .unwrap_or(0.0);

    let start = format_time(start_time)?;

    let database = TrainingCenterDatabase {
        xmlns: "http://www.garmin.com/xmlschemas/TrainingCenterDatabase/v2",
        xmlns_ns3: "http://www.garmin.com/xmlschemas/ActivityExtension/v2",
        xmlns_xsi: "http://www.w3.org/2001/XMLSchema-instance",
        schema_location: "http://www.garmin.com/xmlschemas/TrainingCenterDatabase/v2 http://www.garmin.com/xmlschemas/TrainingCenterDatabasev2.xsd",
        activities: Activities {
            activity: Activity {
                sport: activity_type.tcx_sport(),
                id: start.clone(),
                lap: Lap {
                    start_time: start,
                    total_time_seconds,
                    distance_meters,
                    maximum_speed: workout
                        .summary
                        .max_speed
                        .map(|mph| mph * METERS_PER_MILE / 3600.0),
                    calories: calories.round().max(0.0) as u32,
                    average_heart_rate: workout.summary.avg_heart_rate.map(heart_rate),
                    maximum_heart_rate: workout.summary.max_heart_rate.map(heart_rate),
                    intensity: "Active",
                    cadence: workout.summary.avg_cadence.map(cadence),
                    trigger_method: "Manual",
                    track: (!trackpoints.is_empty()).then_some(Track { trackpoints }),
                },
            },
        },
    };

    let body = quick_xml::se::to_string_with_root("TrainingCenterDatabase", &database)
        .map_err(|e| ConvertError::Xml(e.to_string()))?;

    Ok(format!("{XML_DECLARATION}\n{body}"))
}

/// Trackpoints plus the distance integrated from the speed series.
fn build_trackpoints(
    samples: &WorkoutSamples,
    start_time: i64,
) -> Result<(Vec<Trackpoint>, f64), ConvertError> {
    let heart_rates = samples.metric("heart_rate");
    let cadences = samples.metric("cadence");
    let outputs = samples.metric("output");
    let speeds = samples.metric("speed");

    let mut trackpoints = Vec::with_capacity(samples.seconds_since_pedaling_start.len());
    let mut distance = 0.0;
    let mut previous_offset = 0;

    for (index, offset) in samples.seconds_since_pedaling_start.iter().enumerate() {
        let speed_unit = speeds.and_then(|metric| metric.display_unit.as_deref());
        let speed =
            value_at(speeds, index).map(|value| speed_to_meters_per_second(value, speed_unit));
        if let Some(speed) = speed {
            distance += speed * (offset - previous_offset).max(0) as f64;
        }
        previous_offset = *offset;

        let watts = value_at(outputs, index).map(|value| value.round().max(0.0) as u32);
        let extensions = if speed.is_some() || watts.is_some() {
            Some(Extensions {
                tpx: Tpx { speed, watts },
            })
        } else {
            None
        };

        trackpoints.push(Trackpoint {
            time: format_time(start_time + offset)?,
            distance_meters: speeds.map(|_| distance),
            heart_rate: value_at(heart_rates, index).map(heart_rate),
            cadence: value_at(cadences, index).map(cadence),
            extensions,
        });
    }

    Ok((trackpoints, distance))
}

fn value_at(metric: Option<&SampleMetric>, index: usize) -> Option<f64> {
    metric.and_then(|metric| metric.values.get(index).copied().flatten())
}

fn heart_rate(bpm: f64) -> HeartRate {
    HeartRate {
        value: bpm.round().max(0.0) as u32,
    }
}

// TCX caps cadence at 254
fn cadence(rpm: f64) -> u32 {
    rpm.round().clamp(0.0, 254.0) as u32
}

fn distance_to_meters(value: f64, unit: Option<&str>) -> f64 {
    match unit {
        Some("km") => value * 1000.0,
        Some("m") => value,
        _ => value * METERS_PER_MILE,
    }
}

fn speed_to_meters_per_second(value: f64, unit: Option<&str>) -> f64 {
    match unit {
        Some("kph") | Some("km/h") => value * 1000.0 / 3600.0,
        _ => value * METERS_PER_MILE / 3600.0,
    }
}

fn format_time(epoch_seconds: i64) -> Result<String, ConvertError> {
    DateTime::from_timestamp(epoch_seconds, 0)
        .map(|time| time.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .ok_or(ConvertError::MissingField("valid start_time"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{
        Instructor, Ride, SampleSummary, WorkoutStatus, WorkoutSummary,
    };
    use tempdir::TempDir;

    fn metric(slug: &str, unit: Option<&str>, values: Vec<Option<f64>>) -> SampleMetric {
        SampleMetric {
            slug: slug.to_string(),
            display_unit: unit.map(str::to_string),
            values,
        }
    }

    fn cycling_workout() -> Workout {
        Workout {
            id: "f1e2d3".to_string(),
            status: WorkoutStatus::Complete,
            detail: WorkoutDetail {
                id: "f1e2d3".to_string(),
                fitness_discipline: Some("cycling".to_string()),
                start_time: Some(1_700_000_000),
                end_time: Some(1_700_001_800),
                ride: Some(Ride {
                    title: Some("30 min HIIT Ride".to_string()),
                    duration: Some(1800),
                    instructor: Some(Instructor {
                        name: Some("Robin Arzón".to_string()),
                    }),
                }),
            },
            summary: WorkoutSummary {
                calories: Some(412.4),
                distance: Some(10.0),
                avg_heart_rate: Some(141.2),
                max_heart_rate: Some(172.0),
                max_speed: Some(25.0),
                avg_cadence: Some(88.0),
            },
            samples: WorkoutSamples {
                duration: Some(1800),
                seconds_since_pedaling_start: vec![0, 1, 2],
                metrics: vec![
                    metric("heart_rate", Some("bpm"), vec![Some(120.0), Some(140.0), None]),
                    metric("cadence", Some("rpm"), vec![Some(80.0), Some(300.0), Some(90.0)]),
                    metric("output", Some("watts"), vec![Some(150.0), Some(210.4), Some(199.6)]),
                    metric("speed", Some("mph"), vec![Some(18.0), Some(18.0), Some(18.0)]),
                ],
                summaries: vec![SampleSummary {
                    slug: "distance".to_string(),
                    display_unit: Some("mi".to_string()),
                    value: Some(9.5),
                }],
            },
        }
    }

    #[test]
    fn test_title_includes_instructor() {
        let workout = cycling_workout();
        assert_eq!(workout_title(&workout.detail), "30 min HIIT Ride with Robin Arzón");

        let mut detail = workout.detail.clone();
        detail.ride = None;
        assert_eq!(workout_title(&detail), "Peloton Workout");
    }

    #[test]
    fn test_filename_is_deterministic_and_sanitized() {
        let name = tcx_filename(1_700_000_000, "Arms/Shoulders: Strength", "abc");
        assert_eq!(name, tcx_filename(1_700_000_000, "Arms/Shoulders: Strength", "abc"));
        assert!(name.starts_with("1700000000-"));
        assert!(name.ends_with("-abc.tcx"));
        assert!(!name.contains('/'));
    }

    #[test]
    fn test_convert_writes_tcx_file() {
        let dir = TempDir::new("tcx_convert").unwrap();
        let output_dir = dir.path().join("output");
        let workout = cycling_workout();

        let result = TcxConverter.convert(&workout, &output_dir).unwrap();

        assert_eq!(result.activity_type, ActivityType::Cycling);
        assert_eq!(result.title, "30 min HIIT Ride with Robin Arzón");
        assert!(result.filename.ends_with("-f1e2d3.tcx"));

        let xml = fs::read_to_string(output_dir.join(&result.filename)).unwrap();
        assert!(xml.starts_with(XML_DECLARATION));
        assert!(xml.contains("<TrainingCenterDatabase"));
        assert!(xml.contains("Sport=\"Biking\""));
        assert!(xml.contains("<Id>2023-11-14T22:13:20Z</Id>"));
        assert!(xml.contains("<TotalTimeSeconds>"));
        assert!(xml.contains("<Calories>412</Calories>"));
        assert!(xml.contains("<AverageHeartRateBpm><Value>141</Value></AverageHeartRateBpm>"));
        assert_eq!(xml.matches("<Trackpoint>").count(), 3);
        assert!(xml.contains("<Time>2023-11-14T22:13:21Z</Time>"));
        assert!(xml.contains("<Cadence>254</Cadence>"));
        assert!(xml.contains("<ns3:Watts>210</ns3:Watts>"));
    }

    #[test]
    fn test_convert_without_start_time_fails() {
        let dir = TempDir::new("tcx_convert").unwrap();
        let mut workout = cycling_workout();
        workout.detail.start_time = None;

        let result = TcxConverter.convert(&workout, dir.path());

        assert!(matches!(result, Err(ConvertError::MissingField("start_time"))));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_workout_without_samples_has_no_track() {
        let dir = TempDir::new("tcx_convert").unwrap();
        let mut workout = cycling_workout();
        workout.detail.fitness_discipline = Some("strength".to_string());
        workout.samples = WorkoutSamples::default();

        let result = TcxConverter.convert(&workout, dir.path()).unwrap();

        let xml = fs::read_to_string(dir.path().join(&result.filename)).unwrap();
        assert!(xml.contains("Sport=\"Other\""));
        assert!(xml.contains("<TriggerMethod>Manual</TriggerMethod></Lap>"));
        assert!(!xml.contains("<Track"));
    }

    #[test]
    fn test_distance_from_speed_series() {
        let samples = WorkoutSamples {
            seconds_since_pedaling_start: vec![0, 10, 20],
            metrics: vec![metric("speed", Some("kph"), vec![Some(36.0), Some(36.0), Some(36.0)])],
            ..Default::default()
        };

        let (trackpoints, distance) = build_trackpoints(&samples, 0).unwrap();

        assert_eq!(trackpoints.len(), 3);
        assert!((distance - 200.0).abs() < 1e-9);
        assert_eq!(trackpoints[2].distance_meters, Some(distance));
        assert!(trackpoints[0].heart_rate.is_none());
    }
}
