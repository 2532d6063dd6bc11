use crate::common::metrics;
use crate::common::types::{ConversionResult, RecentWorkout, UploadRecord, Workout};
use crate::convert::WorkoutConverter;
use crate::garmin_client::{ActivityUploader, UploadError};
use crate::peloton_client::{PelotonError, WorkoutSource};
use crate::upload_history::{HistoryBackend, HistoryError, UploadHistory};
use function_timer::time;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Settings for one sync run.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub output_directory: PathBuf,
    pub upload_to_garmin: bool,
}

#[derive(Debug)]
pub enum SyncError {
    Source(PelotonError),
    History(HistoryError),
    Configuration(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Source(e) => write!(f, "Failed to fetch workouts: {e}"),
            SyncError::History(e) => write!(f, "Upload history unavailable: {e}"),
            SyncError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<PelotonError> for SyncError {
    fn from(err: PelotonError) -> Self {
        SyncError::Source(err)
    }
}

impl From<HistoryError> for SyncError {
    fn from(err: HistoryError) -> Self {
        SyncError::History(err)
    }
}

// Failure anywhere between the history lookup and recording the upload
#[derive(Debug)]
enum UploadPhaseError {
    History(HistoryError),
    Upload(UploadError),
}

impl std::fmt::Display for UploadPhaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadPhaseError::History(e) => write!(f, "{e}"),
            UploadPhaseError::Upload(e) => write!(f, "{e}"),
        }
    }
}

impl From<HistoryError> for UploadPhaseError {
    fn from(err: HistoryError) -> Self {
        UploadPhaseError::History(err)
    }
}

impl From<UploadError> for UploadPhaseError {
    fn from(err: UploadError) -> Self {
        UploadPhaseError::Upload(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkoutOutcome {
    /// Status other than COMPLETE, nothing was fetched
    SkippedIncomplete(String),
    ConversionFailed(String),
    /// File written, upload not requested
    Converted,
    Uploaded,
    AlreadyUploaded,
    UploadFailed(String),
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub outcomes: Vec<(String, WorkoutOutcome)>,
}

impl SyncReport {
    pub fn outcome(&self, workout_id: &str) -> Option<&WorkoutOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == workout_id)
            .map(|(_, outcome)| outcome)
    }

    pub fn uploaded(&self) -> usize {
        self.count(|outcome| matches!(outcome, WorkoutOutcome::Uploaded))
    }

    pub fn already_uploaded(&self) -> usize {
        self.count(|outcome| matches!(outcome, WorkoutOutcome::AlreadyUploaded))
    }

    pub fn skipped_incomplete(&self) -> usize {
        self.count(|outcome| matches!(outcome, WorkoutOutcome::SkippedIncomplete(_)))
    }

    /// Workouts whose activity file was written, whether or not they were uploaded.
    pub fn converted(&self) -> usize {
        self.count(|outcome| {
            matches!(
                outcome,
                WorkoutOutcome::Converted
                    | WorkoutOutcome::Uploaded
                    | WorkoutOutcome::AlreadyUploaded
                    | WorkoutOutcome::UploadFailed(_)
            )
        })
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| {
            matches!(
                outcome,
                WorkoutOutcome::ConversionFailed(_) | WorkoutOutcome::UploadFailed(_)
            )
        })
    }

    fn count(&self, predicate: impl Fn(&WorkoutOutcome) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| predicate(outcome))
            .count()
    }

    pub fn log_summary(&self) {
        info!("Sync summary:");
        info!("  Workouts processed: {}", self.outcomes.len());
        info!("  Skipped (not complete): {}", self.skipped_incomplete());
        info!("  TCX files written: {}", self.converted());
        info!("  Uploaded: {}", self.uploaded());
        info!("  Skipped (already uploaded): {}", self.already_uploaded());
        info!("  Errors: {}", self.failed());
    }
}

pub struct SyncJob<S, C, U, B> {
    source: S,
    converter: C,
    uploader: Option<U>,
    history: B,
    config: SyncConfig,
}

impl<S, C, U, B> SyncJob<S, C, U, B>
where
    S: WorkoutSource,
    C: WorkoutConverter,
    U: ActivityUploader,
    B: HistoryBackend,
{
    pub fn new(
        source: S,
        converter: C,
        uploader: Option<U>,
        history: B,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            converter,
            uploader,
            history,
            config,
        }
    }

    /// Processes the `count` most recent workouts, newest first.
    ///
    /// Only listing and fetching errors, or an upload history that cannot be opened,
    /// abort the run. Conversion and upload failures are logged per workout and
    /// reported through [`SyncReport`].
    #[time("sync_workouts_duration")]
    pub async fn run(&self, count: usize) -> Result<SyncReport, SyncError> {
        let uploader = match (self.config.upload_to_garmin, self.uploader.as_ref()) {
            (true, Some(uploader)) => Some(uploader),
            (true, None) => {
                return Err(SyncError::Configuration(
                    "upload requested without a Garmin client".to_string(),
                ));
            }
            (false, _) => None,
        };

        info!("Get latest {} workouts.", count);
        let workouts = self.source.list_recent_workouts(count).await?;

        let mut store = match uploader {
            Some(_) => Some(self.history.open()?),
            None => None,
        };

        let mut report = SyncReport::default();
        for recent in workouts {
            let outcome = self.process_workout(&recent, uploader, &mut store).await?;
            report.outcomes.push((recent.id, outcome));
        }

        if let Some(store) = store.take() {
            if let Err(e) = store.close() {
                warn!("Failed to close upload history: {}", e);
            }
        }

        info!("Done!");
        info!(
            "Your Garmin TCX files can be found in the Output directory: {}",
            self.config.output_directory.display()
        );

        Ok(report)
    }

    async fn process_workout(
        &self,
        recent: &RecentWorkout,
        uploader: Option<&U>,
        store: &mut Option<B::Store>,
    ) -> Result<WorkoutOutcome, SyncError> {
        let workout_id = &recent.id;
        info!("Get workout: {}", workout_id);

        if !recent.status.is_complete() {
            info!("Workout {} status: {} - skipping", workout_id, recent.status);
            metrics::increment_workouts_skipped_incomplete();
            return Ok(WorkoutOutcome::SkippedIncomplete(recent.status.to_string()));
        }

        let workout = self.fetch_workout(recent).await?;

        let conversion = match self
            .converter
            .convert(&workout, &self.config.output_directory)
        {
            Ok(conversion) => {
                info!(
                    "Writing TCX file for workout {}: {}",
                    workout_id, conversion.filename
                );
                metrics::increment_workouts_converted();
                conversion
            }
            Err(e) => {
                error!("Failed to write TCX file for workout {}: {}", workout_id, e);
                metrics::increment_workouts_conversion_failed();
                return Ok(WorkoutOutcome::ConversionFailed(e.to_string()));
            }
        };

        let Some(uploader) = uploader else {
            return Ok(WorkoutOutcome::Converted);
        };

        // A failed upload closed the previous handle
        let mut history = match store.take() {
            Some(history) => history,
            None => {
                info!("Reopening upload history for workout {}", workout_id);
                self.history.open()?
            }
        };

        match self
            .upload_workout(&workout, &conversion, uploader, &mut history)
            .await
        {
            Ok(outcome) => {
                *store = Some(history);
                Ok(outcome)
            }
            Err(e) => {
                error!("Failed to upload workout {} to Garmin: {}", workout_id, e);
                metrics::increment_workouts_upload_failed();
                if let Err(close_err) = history.close() {
                    warn!("Failed to close upload history: {}", close_err);
                }
                Ok(WorkoutOutcome::UploadFailed(e.to_string()))
            }
        }
    }

    async fn fetch_workout(&self, recent: &RecentWorkout) -> Result<Workout, SyncError> {
        let detail = self.source.get_workout_detail(&recent.id).await?;

        info!("Get workout samples for {}", recent.id);
        let samples = self.source.get_workout_samples(&recent.id).await?;

        info!("Get workout summary for {}", recent.id);
        let summary = self.source.get_workout_summary(&recent.id).await?;

        Ok(Workout {
            id: recent.id.clone(),
            status: recent.status.clone(),
            detail,
            summary,
            samples,
        })
    }

    async fn upload_workout(
        &self,
        workout: &Workout,
        conversion: &ConversionResult,
        uploader: &U,
        history: &mut B::Store,
    ) -> Result<WorkoutOutcome, UploadPhaseError> {
        if history.contains(&workout.id)? {
            info!(
                "Workout {} already uploaded to Garmin, skipping...",
                workout.id
            );
            metrics::increment_workouts_already_uploaded();
            return Ok(WorkoutOutcome::AlreadyUploaded);
        }

        info!("Uploading workout {} to Garmin", workout.id);
        let files = [self.config.output_directory.join(&conversion.filename)];
        uploader
            .upload(
                &files,
                &conversion.activity_type.garmin_type_key(),
                &conversion.title,
            )
            .await?;

        history.insert(UploadRecord::now(&workout.id, &conversion.title))?;
        metrics::increment_workouts_uploaded();
        Ok(WorkoutOutcome::Uploaded)
    }
}
