use crate::common::metrics;
use crate::common::types::{RecentWorkout, WorkoutDetail, WorkoutSamples, WorkoutSummary};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};

pub const DEFAULT_ENDPOINT: &str = "https://api.onepeloton.com";

// Largest page the workouts endpoint hands out
const PAGE_LIMIT: usize = 100;

#[derive(Debug)]
pub enum PelotonError {
    Http(StatusCode),
    Network(reqwest_middleware::Error),
    Authentication(String),
    Decode(String),
}

impl std::fmt::Display for PelotonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PelotonError::Http(status) => write!(f, "HTTP {status}"),
            PelotonError::Network(e) => write!(f, "Network error: {e}"),
            PelotonError::Authentication(msg) => write!(f, "Authentication error: {msg}"),
            PelotonError::Decode(msg) => write!(f, "Unexpected response: {msg}"),
        }
    }
}

impl std::error::Error for PelotonError {}

impl From<reqwest_middleware::Error> for PelotonError {
    fn from(err: reqwest_middleware::Error) -> Self {
        PelotonError::Network(err)
    }
}

impl From<reqwest::Error> for PelotonError {
    fn from(err: reqwest::Error) -> Self {
        PelotonError::Network(reqwest_middleware::Error::Reqwest(err))
    }
}

/// Read-only access to the workouts of one account.
#[async_trait]
pub trait WorkoutSource: Send + Sync {
    /// Most recent workouts first, at most `count` of them.
    async fn list_recent_workouts(&self, count: usize) -> Result<Vec<RecentWorkout>, PelotonError>;
    async fn get_workout_detail(&self, workout_id: &str) -> Result<WorkoutDetail, PelotonError>;
    async fn get_workout_samples(&self, workout_id: &str) -> Result<WorkoutSamples, PelotonError>;
    async fn get_workout_summary(&self, workout_id: &str) -> Result<WorkoutSummary, PelotonError>;
}

#[async_trait]
impl<T: WorkoutSource + ?Sized> WorkoutSource for &T {
    async fn list_recent_workouts(&self, count: usize) -> Result<Vec<RecentWorkout>, PelotonError> {
        (**self).list_recent_workouts(count).await
    }

    async fn get_workout_detail(&self, workout_id: &str) -> Result<WorkoutDetail, PelotonError> {
        (**self).get_workout_detail(workout_id).await
    }

    async fn get_workout_samples(&self, workout_id: &str) -> Result<WorkoutSamples, PelotonError> {
        (**self).get_workout_samples(workout_id).await
    }

    async fn get_workout_summary(&self, workout_id: &str) -> Result<WorkoutSummary, PelotonError> {
        (**self).get_workout_summary(workout_id).await
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username_or_email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    session_id: String,
    user_id: String,
}

#[derive(Deserialize)]
struct WorkoutPage {
    #[serde(default)]
    data: Vec<RecentWorkout>,
    #[serde(default)]
    page_count: Option<usize>,
}

struct Session {
    session_id: String,
    user_id: String,
}

pub struct PelotonClient {
    client: ClientWithMiddleware,
    base_url: String,
    email: String,
    password: String,
    session: OnceCell<Session>,
}

impl PelotonClient {
    pub fn new(email: &str, password: &str) -> Self {
        Self::with_base_url(DEFAULT_ENDPOINT, email, password)
    }

    pub fn with_base_url(base_url: &str, email: &str, password: &str) -> Self {
        // Create client with retry middleware
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(2);
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            email: email.to_string(),
            password: password.to_string(),
            session: OnceCell::new(),
        }
    }

    async fn session(&self) -> Result<&Session, PelotonError> {
        self.session.get_or_try_init(|| self.login()).await
    }

    async fn login(&self) -> Result<Session, PelotonError> {
        let path = format!("{}/auth/login", self.base_url);

        let response = self
            .client
            .post(path)
            .header("Peloton-Platform", "web")
            .json(&LoginRequest {
                username_or_email: &self.email,
                password: &self.password,
            })
            .send()
            .await
            .inspect_err(|_e| metrics::increment_peloton_api_failure())?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            metrics::increment_peloton_api_failure();
            return Err(PelotonError::Authentication(format!(
                "Peloton login rejected with {status}, check PELOTON_EMAIL and PELOTON_PASSWORD"
            )));
        }
        if !status.is_success() {
            metrics::increment_peloton_api_failure();
            return Err(PelotonError::Http(status));
        }

        let login: LoginResponse = response.json().await.map_err(|e| {
            metrics::increment_peloton_api_failure();
            PelotonError::Decode(format!("login response: {e}"))
        })?;

        metrics::increment_peloton_api_success();
        info!("Authenticated with Peloton as user {}", login.user_id);

        Ok(Session {
            session_id: login.session_id,
            user_id: login.user_id,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, PelotonError> {
        let session = self.session().await?;
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .query(query)
            .header("Cookie", format!("peloton_session_id={}", session.session_id))
            .header("Peloton-Platform", "web")
            .send()
            .await
            .inspect_err(|_e| metrics::increment_peloton_api_failure())?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            metrics::increment_peloton_api_failure();
            return Err(PelotonError::Authentication(format!(
                "{path} rejected the session with {status}"
            )));
        }
        if !status.is_success() {
            metrics::increment_peloton_api_failure();
            return Err(PelotonError::Http(status));
        }

        let body = response
            .text()
            .await
            .inspect_err(|_e| metrics::increment_peloton_api_failure())?;

        let parsed = serde_json::from_str(&body).map_err(|e| {
            metrics::increment_peloton_api_failure();
            PelotonError::Decode(format!("{path}: {e}"))
        })?;

        metrics::increment_peloton_api_success();
        Ok(parsed)
    }
}

#[async_trait]
impl WorkoutSource for PelotonClient {
    async fn list_recent_workouts(&self, count: usize) -> Result<Vec<RecentWorkout>, PelotonError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let user_id = self.session().await?.user_id.clone();
        let path = format!("/api/user/{user_id}/workouts");
        let limit = count.min(PAGE_LIMIT);

        let mut workouts = Vec::with_capacity(count);
        let mut page = 0;

        while workouts.len() < count {
            let result: WorkoutPage = self
                .get_json(
                    &path,
                    &[
                        ("sort_by", "-created".to_string()),
                        ("page", page.to_string()),
                        ("limit", limit.to_string()),
                    ],
                )
                .await?;

            let fetched = result.data.len();
            workouts.extend(result.data);
            page += 1;

            let last_page = result.page_count.is_some_and(|page_count| page >= page_count);
            if fetched < limit || last_page {
                break;
            }
        }

        workouts.truncate(count);
        info!("Fetched {} recent workouts", workouts.len());
        Ok(workouts)
    }

    async fn get_workout_detail(&self, workout_id: &str) -> Result<WorkoutDetail, PelotonError> {
        self.get_json(
            &format!("/api/workout/{workout_id}"),
            &[("joins", "ride,ride.instructor".to_string())],
        )
        .await
    }

    async fn get_workout_samples(&self, workout_id: &str) -> Result<WorkoutSamples, PelotonError> {
        self.get_json(
            &format!("/api/workout/{workout_id}/performance_graph"),
            &[("every_n", "1".to_string())],
        )
        .await
    }

    async fn get_workout_summary(&self, workout_id: &str) -> Result<WorkoutSummary, PelotonError> {
        self.get_json(&format!("/api/workout/{workout_id}/summary"), &[])
            .await
    }
}
