use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

use crate::convert::TcxConverter;
use crate::garmin_client::{self, GarminClient};
use crate::peloton_client::{self, PelotonClient, WorkoutSource};
use crate::sync::{SyncConfig, SyncJob};
use crate::upload_history::{HistoryBackend, JsonHistoryFile};

#[derive(Parser, Debug)]
#[command(
    name = "peloton-sync",
    version,
    about = "Convert Peloton workouts to TCX files and upload them to Garmin Connect"
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct LoggingArgs {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "JSON_LOGS")]
    pub json_logs: bool,
    /// Also append logs to this file
    #[arg(long, global = true, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct PelotonArgs {
    #[arg(long, env = "PELOTON_EMAIL")]
    pub peloton_email: String,
    #[arg(long, env = "PELOTON_PASSWORD", hide_env_values = true)]
    pub peloton_password: String,
    #[arg(long, env = "PELOTON_BASE_URL", default_value = peloton_client::DEFAULT_ENDPOINT)]
    pub peloton_base_url: String,
}

impl PelotonArgs {
    pub fn client(&self) -> PelotonClient {
        PelotonClient::with_base_url(
            &self.peloton_base_url,
            &self.peloton_email,
            &self.peloton_password,
        )
    }
}

#[derive(Args, Debug)]
pub struct GarminArgs {
    #[arg(long, env = "GARMIN_EMAIL")]
    pub garmin_email: Option<String>,
    #[arg(long, env = "GARMIN_PASSWORD", hide_env_values = true)]
    pub garmin_password: Option<String>,
    #[arg(long, env = "GARMIN_SSO_URL", default_value = garmin_client::DEFAULT_SSO_URL)]
    pub garmin_sso_url: String,
    #[arg(long, env = "GARMIN_CONNECT_URL", default_value = garmin_client::DEFAULT_CONNECT_URL)]
    pub garmin_connect_url: String,
}

impl GarminArgs {
    pub fn client(&self) -> Result<GarminClient> {
        let (Some(email), Some(password)) = (&self.garmin_email, &self.garmin_password) else {
            bail!("Uploading to Garmin requires GARMIN_EMAIL and GARMIN_PASSWORD");
        };

        GarminClient::with_urls(
            &self.garmin_sso_url,
            &self.garmin_connect_url,
            email,
            password,
        )
        .context("Failed to create Garmin Connect client")
    }
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    #[command(flatten)]
    pub peloton: PelotonArgs,
    #[command(flatten)]
    pub garmin: GarminArgs,
    /// Number of recent workouts to process; prompts when omitted
    #[arg(short = 'n', long, env = "NUM_ACTIVITIES")]
    pub num_activities: Option<usize>,
    /// Upload converted workouts to Garmin Connect
    #[arg(short = 'u', long, env = "UPLOAD_TO_GARMIN")]
    pub upload: bool,
    /// Directory for the TCX files
    #[arg(short, long, env = "OUTPUT_DIRECTORY", default_value = "output")]
    pub output_dir: PathBuf,
    /// Wait for <ENTER> before exiting
    #[arg(long, env = "PAUSE_ON_FINISH")]
    pub pause_on_finish: bool,
    #[arg(long, env = "HISTORY_DB", default_value = "database.json")]
    pub history_db: PathBuf,
}

impl SyncArgs {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            output_directory: self.output_dir.clone(),
            upload_to_garmin: self.upload,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Convert recent workouts to TCX files and optionally upload them to Garmin Connect
    Sync(SyncArgs),
    /// List recent workouts
    List {
        #[command(flatten)]
        peloton: PelotonArgs,
        #[arg(short = 'n', long, default_value_t = 10)]
        num_activities: usize,
    },
    /// Show workouts recorded in the upload history
    History {
        #[arg(long, env = "HISTORY_DB", default_value = "database.json")]
        history_db: PathBuf,
    },
}

fn init_tracing(logging: &LoggingArgs) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console = if logging.json_logs {
        fmt::layer().json().with_target(false).boxed()
    } else {
        fmt::layer().with_target(false).boxed()
    };

    let file = match &logging.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .with(filter)
        .try_init()
        .context("Failed to initialize logging")
}

fn prompt_num_activities(input: &mut impl BufRead, output: &mut impl Write) -> Result<usize> {
    write!(output, "How many past activities do you want to grab?  ")?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line)?;
    line.trim()
        .parse()
        .with_context(|| format!("'{}' is not a number of activities", line.trim()))
}

fn pause(input: &mut impl BufRead, output: &mut impl Write) -> Result<()> {
    write!(output, "Press the <ENTER> key to continue...")?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(())
}

async fn run_sync(args: SyncArgs) -> Result<()> {
    let config = args.sync_config();

    // Credential problems surface before any network traffic
    let uploader = if config.upload_to_garmin {
        Some(args.garmin.client()?)
    } else {
        None
    };

    let num_activities = match args.num_activities {
        Some(count) => count,
        None => prompt_num_activities(&mut io::stdin().lock(), &mut io::stdout())?,
    };

    let job = SyncJob::new(
        args.peloton.client(),
        TcxConverter,
        uploader,
        JsonHistoryFile::new(&args.history_db),
        config,
    );

    let report = job.run(num_activities).await?;
    report.log_summary();

    if args.pause_on_finish {
        pause(&mut io::stdin().lock(), &mut io::stdout())?;
    }

    Ok(())
}

async fn list_workouts(peloton: &PelotonArgs, num_activities: usize) -> Result<()> {
    let client = peloton.client();
    let workouts = client
        .list_recent_workouts(num_activities)
        .await
        .context("Error fetching workouts")?;

    if workouts.is_empty() {
        println!("No workouts found");
    }
    for workout in workouts {
        println!(
            "{}\t{}\t{}\t{}",
            workout.id,
            workout.status,
            workout.fitness_discipline.as_deref().unwrap_or("-"),
            workout.name.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn show_history(history_db: PathBuf) -> Result<()> {
    let backend = JsonHistoryFile::new(history_db);
    let store = backend
        .open()
        .with_context(|| format!("Failed to open {}", backend.path().display()))?;

    let records = store.records();
    info!("{} workouts in upload history", records.len());
    for record in records {
        println!(
            "{}\t{}\t{}",
            record.upload_dt.format(crate::common::types::UPLOAD_DT_FORMAT),
            record.workout_id,
            record.title
        );
    }
    Ok(())
}

pub async fn cli_main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Cli::parse();
    init_tracing(&args.logging)?;

    match args.command {
        Commands::Sync(sync_args) => run_sync(sync_args).await,
        Commands::List {
            peloton,
            num_activities,
        } => list_workouts(&peloton, num_activities).await,
        Commands::History { history_db } => show_history(history_db),
    }
}
