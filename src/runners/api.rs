//! HTTP client for the controller's runner endpoints.
//!
//! Registration is lazy: credentials are looked up in memory, then on disk,
//! and only then exchanged for the registration token. Transport failures are
//! retried on the next tick by the caller; only a missing token is fatal.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};

use crate::config::Config;
use crate::error::{Result, StagehandError};
use crate::runners::types::{RunnerCredentials, RunnerProgress, RunnerRegistration, RunnerState};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RunnerApiClient {
    http: reqwest::Client,
    config: Arc<Config>,
    credentials: Mutex<Option<RunnerCredentials>>,
}

impl RunnerApiClient {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            config,
            credentials: Mutex::new(None),
        })
    }

    /// Credentials from memory or the on-disk config file.
    pub fn load_credentials(&self) -> Result<Option<RunnerCredentials>> {
        if let Ok(guard) = self.credentials.lock() {
            if let Some(creds) = guard.as_ref() {
                return Ok(Some(creds.clone()));
            }
        }

        let path = &self.config.runner.config_file;
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(path)?;
        let creds: RunnerCredentials = serde_json::from_str(&contents)?;
        self.cache(creds.clone());
        Ok(Some(creds))
    }

    /// Write credentials to the config file (mode 0644) and cache them.
    pub fn save_credentials(&self, creds: &RunnerCredentials) -> Result<()> {
        let path = &self.config.runner.config_file;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string(creds)?)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
        self.cache(creds.clone());
        Ok(())
    }

    /// Make sure this runner holds credentials, registering if needed.
    ///
    /// `Ok(true)` means registered; `Ok(false)` means a transient failure the
    /// caller should retry on its next tick; `Err` means registration cannot
    /// ever succeed (no token).
    pub async fn ensure_registered(&self) -> Result<bool> {
        if self.load_credentials()?.is_some() {
            return Ok(true);
        }

        let token = &self.config.runner.registration_token;
        if token.is_empty() {
            return Err(StagehandError::Protocol(
                "registration token cannot be empty".to_string(),
            ));
        }

        let url = format!("{}/runners", self.config.runner.api_url);
        let response = match self
            .http
            .post(&url)
            .json(&RunnerRegistration {
                registration_token: token.clone(),
            })
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("runner registration request failed: {}", e);
                return Ok(false);
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            warn!("runner registration rejected: HTTP {}", response.status());
            return Ok(false);
        }

        let creds: RunnerCredentials = match response.json().await {
            Ok(creds) => creds,
            Err(e) => {
                warn!("could not parse registration response: {}", e);
                return Ok(false);
            }
        };

        self.save_credentials(&creds)?;
        info!("registered as runner {}", creds.runner_id);
        Ok(true)
    }

    /// `PUT /runners/{id}` with accumulated statuses and log records.
    pub async fn send_progress(&self, progress: &RunnerProgress) -> Result<()> {
        let creds = self.require_credentials()?;
        let url = format!("{}/runners/{}", self.config.runner.api_url, creds.runner_id);

        let response = self
            .http
            .put(&url)
            .bearer_auth(&creds.token)
            .json(progress)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StagehandError::Protocol(format!(
                "progress upload rejected: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// `GET /runners/{id}`: current job statuses plus new assignments.
    pub async fn fetch_state(&self) -> Result<RunnerState> {
        let creds = self.require_credentials()?;
        let url = format!("{}/runners/{}", self.config.runner.api_url, creds.runner_id);

        let response = self.http.get(&url).bearer_auth(&creds.token).send().await?;

        if !response.status().is_success() {
            return Err(StagehandError::Protocol(format!(
                "state poll rejected: HTTP {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    fn require_credentials(&self) -> Result<RunnerCredentials> {
        self.load_credentials()?.ok_or(StagehandError::Protocol(
            "runner is not registered".to_string(),
        ))
    }

    fn cache(&self, creds: RunnerCredentials) {
        if let Ok(mut guard) = self.credentials.lock() {
            *guard = Some(creds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerSettings;

    fn config_with_file(path: std::path::PathBuf, token: &str) -> Arc<Config> {
        Arc::new(Config {
            runner: RunnerSettings {
                config_file: path,
                registration_token: token.to_string(),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn test_credentials_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.json");
        let client = RunnerApiClient::new(config_with_file(path.clone(), "")).unwrap();

        let creds = RunnerCredentials {
            runner_id: 9,
            token: "bearer".to_string(),
        };
        client.save_credentials(&creds).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        // a fresh client reads them back from disk
        let fresh = RunnerApiClient::new(config_with_file(path, "")).unwrap();
        assert_eq!(fresh.load_credentials().unwrap(), Some(creds));
    }

    #[test]
    fn test_load_credentials_absent_file() {
        let dir = tempfile::tempdir().unwrap();
        let client =
            RunnerApiClient::new(config_with_file(dir.path().join("missing.json"), "")).unwrap();
        assert_eq!(client.load_credentials().unwrap(), None);
    }

    #[tokio::test]
    async fn test_ensure_registered_without_token_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let client =
            RunnerApiClient::new(config_with_file(dir.path().join("missing.json"), "")).unwrap();

        let err = client.ensure_registered().await.unwrap_err();
        assert!(matches!(err, StagehandError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_ensure_registered_uses_saved_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.json");
        fs::write(&path, r#"{"runner_id": 3, "token": "t"}"#).unwrap();

        let client = RunnerApiClient::new(config_with_file(path, "")).unwrap();
        assert!(client.ensure_registered().await.unwrap());
    }

    #[tokio::test]
    async fn test_progress_without_registration_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let client =
            RunnerApiClient::new(config_with_file(dir.path().join("missing.json"), "x")).unwrap();

        let err = client
            .send_progress(&RunnerProgress::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StagehandError::Protocol(_)));
    }
}
