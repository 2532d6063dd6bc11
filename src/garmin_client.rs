use crate::common::metrics;
use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, OnceLock};
use tokio::sync::OnceCell;
use tracing::{info, warn};

pub const DEFAULT_SSO_URL: &str = "https://sso.garmin.com";
pub const DEFAULT_CONNECT_URL: &str = "https://connect.garmin.com";

static CSRF_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"name="_csrf"\s+value="([^"]+)""#).expect("valid csrf pattern"));
static TICKET_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ticket=([A-Za-z0-9\-]+)").expect("valid ticket pattern"));

#[derive(Debug)]
pub enum UploadError {
    Http(StatusCode),
    Network(reqwest::Error),
    Authentication(String),
    Rejected(String),
    Io(std::io::Error),
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::Http(status) => write!(f, "HTTP {status}"),
            UploadError::Network(e) => write!(f, "Network error: {e}"),
            UploadError::Authentication(msg) => write!(f, "Authentication error: {msg}"),
            UploadError::Rejected(msg) => write!(f, "Upload rejected: {msg}"),
            UploadError::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for UploadError {}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::Network(err)
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Io(err)
    }
}

/// Destination for converted activity files.
#[async_trait]
pub trait ActivityUploader: Send + Sync {
    /// Uploads every file as one activity named `title` of type `activity_type`.
    async fn upload(
        &self,
        files: &[PathBuf],
        activity_type: &str,
        title: &str,
    ) -> Result<(), UploadError>;
}

#[async_trait]
impl<T: ActivityUploader + ?Sized> ActivityUploader for &T {
    async fn upload(
        &self,
        files: &[PathBuf],
        activity_type: &str,
        title: &str,
    ) -> Result<(), UploadError> {
        (**self).upload(files, activity_type, title).await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    detailed_import_result: ImportResult,
}

#[derive(Deserialize)]
struct ImportResult {
    #[serde(default)]
    successes: Vec<ImportSuccess>,
    #[serde(default)]
    failures: Vec<ImportFailure>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportSuccess {
    internal_id: Option<u64>,
}

#[derive(Deserialize)]
struct ImportFailure {
    #[serde(default)]
    messages: Vec<ImportMessage>,
}

#[derive(Deserialize)]
struct ImportMessage {
    content: Option<String>,
}

impl ImportResult {
    fn failure_message(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        let messages: Vec<&str> = self
            .failures
            .iter()
            .flat_map(|failure| failure.messages.iter())
            .filter_map(|message| message.content.as_deref())
            .collect();
        if messages.is_empty() {
            Some("Garmin Connect reported an import failure".to_string())
        } else {
            Some(messages.join("; "))
        }
    }
}

pub struct GarminClient {
    client: reqwest::Client,
    sso_url: String,
    connect_url: String,
    email: String,
    password: String,
    signed_in: OnceCell<()>,
    sign_in_failure: OnceLock<String>,
}

impl GarminClient {
    pub fn new(email: &str, password: &str) -> Result<Self, UploadError> {
        Self::with_urls(DEFAULT_SSO_URL, DEFAULT_CONNECT_URL, email, password)
    }

    pub fn with_urls(
        sso_url: &str,
        connect_url: &str,
        email: &str,
        password: &str,
    ) -> Result<Self, UploadError> {
        // Session lives in cookies set during the SSO ticket exchange
        let client = reqwest::Client::builder().cookie_store(true).build()?;

        Ok(Self {
            client,
            sso_url: sso_url.trim_end_matches('/').to_string(),
            connect_url: connect_url.trim_end_matches('/').to_string(),
            email: email.to_string(),
            password: password.to_string(),
            signed_in: OnceCell::new(),
            sign_in_failure: OnceLock::new(),
        })
    }

    // Credentials are posted at most once per client
    async fn ensure_signed_in(&self) -> Result<(), UploadError> {
        if let Some(reason) = self.sign_in_failure.get() {
            return Err(UploadError::Authentication(format!(
                "Garmin sign-in already failed: {reason}"
            )));
        }

        match self.signed_in.get_or_try_init(|| self.sign_in()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let _ = self.sign_in_failure.set(e.to_string());
                Err(e)
            }
        }
    }

    async fn sign_in(&self) -> Result<(), UploadError> {
        let signin_url = format!("{}/sso/signin", self.sso_url);
        let service = format!("{}/modern", self.connect_url);
        let gauth_host = format!("{}/sso", self.sso_url);
        let params = [
            ("service", service.as_str()),
            ("gauthHost", gauth_host.as_str()),
            ("clientId", "GarminConnect"),
            ("consumeServiceTicket", "false"),
        ];

        let login_page = self
            .client
            .get(&signin_url)
            .query(&params)
            .send()
            .await
            .inspect_err(|_e| metrics::increment_garmin_api_failure())?;
        if !login_page.status().is_success() {
            metrics::increment_garmin_api_failure();
            return Err(UploadError::Http(login_page.status()));
        }
        let page = login_page.text().await?;

        let csrf = CSRF_PATTERN
            .captures(&page)
            .and_then(|captures| captures.get(1))
            .map(|token| token.as_str().to_string())
            .ok_or_else(|| {
                metrics::increment_garmin_api_failure();
                UploadError::Authentication(
                    "CSRF token not found on the Garmin sign-in page".to_string(),
                )
            })?;

        let form = [
            ("username", self.email.as_str()),
            ("password", self.password.as_str()),
            ("embed", "false"),
            ("_csrf", csrf.as_str()),
        ];
        let response = self
            .client
            .post(&signin_url)
            .query(&params)
            .header(reqwest::header::REFERER, signin_url.as_str())
            .form(&form)
            .send()
            .await
            .inspect_err(|_e| metrics::increment_garmin_api_failure())?;
        if !response.status().is_success() {
            metrics::increment_garmin_api_failure();
            return Err(UploadError::Authentication(format!(
                "Garmin sign-in failed with {}",
                response.status()
            )));
        }
        let body = response.text().await?;

        let ticket = TICKET_PATTERN
            .captures(&body)
            .and_then(|captures| captures.get(1))
            .map(|ticket| ticket.as_str().to_string())
            .ok_or_else(|| {
                metrics::increment_garmin_api_failure();
                UploadError::Authentication(
                    "Garmin sign-in returned no service ticket, check GARMIN_EMAIL and GARMIN_PASSWORD"
                        .to_string(),
                )
            })?;

        let exchange = self
            .client
            .get(&service)
            .query(&[("ticket", ticket.as_str())])
            .send()
            .await
            .inspect_err(|_e| metrics::increment_garmin_api_failure())?;
        if !exchange.status().is_success() {
            metrics::increment_garmin_api_failure();
            return Err(UploadError::Authentication(format!(
                "Garmin ticket exchange failed with {}",
                exchange.status()
            )));
        }

        metrics::increment_garmin_api_success();
        info!("Signed in to Garmin Connect");
        Ok(())
    }

    async fn upload_file(&self, file: &Path) -> Result<u64, UploadError> {
        let data = tokio::fs::read(file).await?;
        let file_name = file
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("activity.tcx")
            .to_string();
        let extension = file
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("tcx")
            .to_string();

        let form = Form::new().part("file", Part::bytes(data).file_name(file_name));
        let url = format!(
            "{}/modern/proxy/upload-service/upload/.{extension}",
            self.connect_url
        );

        let response = self
            .client
            .post(url)
            .header("NK", "NT")
            .multipart(form)
            .send()
            .await
            .inspect_err(|_e| metrics::increment_garmin_api_failure())?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            metrics::increment_garmin_api_failure();
            return Err(UploadError::Rejected(
                "activity already exists on Garmin Connect".to_string(),
            ));
        }
        if !status.is_success() {
            metrics::increment_garmin_api_failure();
            return Err(UploadError::Http(status));
        }

        let result: UploadResponse = response.json().await.inspect_err(|_e| {
            metrics::increment_garmin_api_failure();
        })?;
        let import = result.detailed_import_result;

        if let Some(message) = import.failure_message() {
            metrics::increment_garmin_api_failure();
            return Err(UploadError::Rejected(message));
        }

        let activity_id = import
            .successes
            .iter()
            .find_map(|success| success.internal_id)
            .ok_or_else(|| {
                metrics::increment_garmin_api_failure();
                UploadError::Rejected("Garmin Connect returned no activity id".to_string())
            })?;

        metrics::increment_garmin_api_success();
        Ok(activity_id)
    }

    async fn update_activity(
        &self,
        activity_id: u64,
        activity_type: &str,
        title: &str,
    ) -> Result<(), UploadError> {
        let url = format!(
            "{}/modern/proxy/activity-service/activity/{activity_id}",
            self.connect_url
        );
        let body = serde_json::json!({
            "activityId": activity_id,
            "activityName": title,
            "activityTypeDTO": { "typeKey": activity_type },
        });

        let response = self
            .client
            .put(url)
            .header("NK", "NT")
            .json(&body)
            .send()
            .await
            .inspect_err(|_e| metrics::increment_garmin_api_failure())?;

        if !response.status().is_success() {
            metrics::increment_garmin_api_failure();
            return Err(UploadError::Http(response.status()));
        }

        metrics::increment_garmin_api_success();
        Ok(())
    }
}

#[async_trait]
impl ActivityUploader for GarminClient {
    async fn upload(
        &self,
        files: &[PathBuf],
        activity_type: &str,
        title: &str,
    ) -> Result<(), UploadError> {
        self.ensure_signed_in().await?;

        for file in files {
            let activity_id = self.upload_file(file).await?;
            info!(
                "Uploaded {} as Garmin activity {}",
                file.display(),
                activity_id
            );

            // Activity already exists at this point, a failed rename is not an upload failure
            if let Err(e) = self.update_activity(activity_id, activity_type, title).await {
                warn!(
                    "Failed to set name/type of Garmin activity {}: {}",
                    activity_id, e
                );
            }
        }

        Ok(())
    }
}
