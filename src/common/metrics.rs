use metrics::counter;

/// Error/Reliability Metrics - Success/Failure pairs
pub fn increment_peloton_api_success() {
    counter!("peloton_api_total", "result" => "success").increment(1);
}

pub fn increment_peloton_api_failure() {
    counter!("peloton_api_total", "result" => "failure").increment(1);
}

pub fn increment_garmin_api_success() {
    counter!("garmin_api_total", "result" => "success").increment(1);
}

pub fn increment_garmin_api_failure() {
    counter!("garmin_api_total", "result" => "failure").increment(1);
}

/// Per-workout outcomes of a sync run
pub fn increment_workouts_skipped_incomplete() {
    counter!("workouts_total", "result" => "skipped_incomplete").increment(1);
}

pub fn increment_workouts_converted() {
    counter!("workouts_total", "result" => "converted").increment(1);
}

pub fn increment_workouts_conversion_failed() {
    counter!("workouts_total", "result" => "conversion_failed").increment(1);
}

pub fn increment_workouts_uploaded() {
    counter!("workouts_total", "result" => "uploaded").increment(1);
}

pub fn increment_workouts_already_uploaded() {
    counter!("workouts_total", "result" => "already_uploaded").increment(1);
}

pub fn increment_workouts_upload_failed() {
    counter!("workouts_total", "result" => "upload_failed").increment(1);
}
