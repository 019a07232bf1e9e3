use log::{info, error, warn, debug};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use std::sync::Arc;
use tokio::sync::Mutex;
use thiserror::Error;
use chrono::{DateTime, Utc};
use async_trait::async_trait;

use power_tracker::{PowerAction, PowerOperation, StatusSource, TrackerError};


// API error types
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("API error: {status} - {message}")]
    ApiResponseError { status: u16, message: String },

    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    #[error("Request timeout")]
    Timeout,

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Session token
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

// API client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiClientConfig {
    pub api_url: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub username: Option<String>,
    pub org: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8443".to_string(),
            timeout_ms: 5000,
            max_retries: 3,
            retry_delay_ms: 1000,
            username: None,
            org: None,
            password: None,
        }
    }
}

impl ApiClientConfig {
    // Session login name in user@org form
    fn login(&self) -> Option<String> {
        let username = self.username.as_ref()?;
        Some(match &self.org {
            Some(org) => format!("{}@{}", username, org),
            None => username.clone(),
        })
    }
}

// Cloud API client
#[derive(Debug, Clone)]
pub struct CloudApiClient {
    config: ApiClientConfig,
    client: Client,
    auth_token: Arc<Mutex<Option<AuthToken>>>,
}

impl CloudApiClient {
    // Create a new API client
    pub fn new(config: ApiClientConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();

        Self {
            config,
            client,
            auth_token: Arc::new(Mutex::new(None)),
        }
    }

    fn base_url(&self) -> &str {
        self.config.api_url.trim_end_matches('/')
    }

    async fn get_auth_token(&self) -> Option<String> {
        let token = self.auth_token.lock().await;
        token.as_ref().map(|t| t.token.clone())
    }

    async fn set_auth_token(&self, token: String, expires_at: DateTime<Utc>) {
        let mut auth_token = self.auth_token.lock().await;
        *auth_token = Some(AuthToken { token, expires_at });
    }

    async fn clear_auth_token(&self) {
        let mut auth_token = self.auth_token.lock().await;
        *auth_token = None;
    }

    async fn is_token_expired(&self) -> bool {
        let token = self.auth_token.lock().await;
        match &*token {
            Some(t) => t.expires_at <= Utc::now(),
            None => true,
        }
    }

    // Open a session. Without credentials the backend is assumed to be
    // unauthenticated and requests go out without a bearer token.
    pub async fn authenticate(&self) -> Result<(), ApiError> {
        // Skip if we already have a valid token
        if !self.is_token_expired().await {
            return Ok(());
        }

        let Some(login) = self.config.login() else {
            return Ok(());
        };

        let url = format!("{}/api/sessions", self.base_url());

        let response = self.client.post(&url)
            .basic_auth(login, self.config.password.as_ref())
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let data: Value = response.json().await?;

                if let (Some(token), Some(expires_str)) = (
                    data.get("token").and_then(|t| t.as_str()),
                    data.get("expires_at").and_then(|e| e.as_str())
                ) {
                    if let Ok(expires_at) = expires_str.parse::<DateTime<Utc>>() {
                        self.set_auth_token(token.to_string(), expires_at).await;
                        info!("Successfully authenticated with the API");
                        return Ok(());
                    }
                }

                Err(ApiError::AuthError("Invalid session response".to_string()))
            },
            status => {
                let error_text = response.text().await.unwrap_or_default();
                Err(ApiError::ApiResponseError {
                    status: status.as_u16(),
                    message: error_text,
                })
            }
        }
    }

    fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.config.retry_delay_ms.saturating_mul(2u64.saturating_pow(retry)))
    }

    // Make an authenticated API request with retries
    async fn request<T: for<'de> Deserialize<'de>, U: Serialize>(
        &self,
        method: reqwest::Method,
        path: &str,
        payload: Option<&U>,
    ) -> Result<T, ApiError> {
        // Ensure we have a valid token
        self.authenticate().await?;

        let url = format!("{}{}", self.base_url(), path);

        for retry in 0..self.config.max_retries {
            let last_attempt = retry + 1 >= self.config.max_retries;
            let mut request = self.client.request(method.clone(), &url);

            if let Some(token) = self.get_auth_token().await {
                request = request.header("Authorization", format!("Bearer {}", token));
            }

            if let Some(data) = payload {
                request = request.json(data);
            }

            match request.send().await {
                Ok(response) => {
                    match response.status() {
                        StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => {
                            let body = response.text().await?;
                            return serde_json::from_str::<T>(&body).map_err(|e| {
                                error!("Failed to parse API response: {}", e);
                                ApiError::SerializationError(e)
                            });
                        },
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                            if last_attempt || self.config.login().is_none() {
                                let status = response.status();
                                let error_text = response.text().await.unwrap_or_default();
                                return Err(ApiError::ApiResponseError {
                                    status: status.as_u16(),
                                    message: error_text,
                                });
                            }

                            // Session expired server-side, log in again
                            self.clear_auth_token().await;
                            if let Err(e) = self.authenticate().await {
                                error!("Failed to re-authenticate: {}", e);
                                return Err(e);
                            }
                            continue;
                        },
                        StatusCode::TOO_MANY_REQUESTS => {
                            let retry_after = response.headers()
                                .get("Retry-After")
                                .and_then(|h| h.to_str().ok())
                                .and_then(|s| s.parse::<u64>().ok())
                                .unwrap_or(self.config.retry_delay_ms / 1000);

                            warn!("Rate limit exceeded, retrying after {} seconds", retry_after);

                            if last_attempt {
                                return Err(ApiError::RateLimitExceeded { retry_after });
                            }
                            tokio::time::sleep(Duration::from_secs(retry_after)).await;
                            continue;
                        },
                        status => {
                            let error_text = response.text().await.unwrap_or_default();
                            error!("API error: {} - {}", status, error_text);

                            // Retry server errors
                            if status.is_server_error() && !last_attempt {
                                let delay = self.backoff(retry);
                                warn!("Server error, retrying in {} ms", delay.as_millis());
                                tokio::time::sleep(delay).await;
                                continue;
                            }

                            return Err(ApiError::ApiResponseError {
                                status: status.as_u16(),
                                message: error_text,
                            });
                        }
                    }
                },
                Err(e) => {
                    if e.is_timeout() {
                        warn!("Request timeout, retrying...");

                        if last_attempt {
                            return Err(ApiError::Timeout);
                        }
                        tokio::time::sleep(self.backoff(retry)).await;
                        continue;
                    } else if e.is_connect() && !last_attempt {
                        warn!("Connection error, retrying...");
                        tokio::time::sleep(self.backoff(retry)).await;
                        continue;
                    } else {
                        error!("Network error: {}", e);
                        return Err(ApiError::NetworkError(e));
                    }
                }
            }
        }

        Err(ApiError::Unknown("Maximum retries exceeded".to_string()))
    }

    // Ask the backend to change a VM's power state; the returned
    // operation carries the task to track
    pub async fn power_action(&self, vm_id: &str, action: PowerAction) -> Result<PowerOperation, ApiError> {
        let operation: PowerOperation = self.request(
            reqwest::Method::POST,
            &format!("/api/vms/{}/power/{}", vm_id, action),
            None::<&()>,
        ).await?;

        info!("Requested {} for VM {} (task {})", action, vm_id, operation.task.id);
        Ok(operation)
    }

    pub async fn get_operation_status(&self, vm_id: &str, operation_id: &str) -> Result<PowerOperation, ApiError> {
        debug!("Fetching status of operation {} on VM {}", operation_id, vm_id);

        self.request(
            reqwest::Method::GET,
            &format!("/api/vms/{}/power-operations/{}", vm_id, operation_id),
            None::<&()>,
        ).await
    }

    // Get health status of the API
    pub async fn health_check(&self) -> Result<bool, ApiError> {
        let url = format!("{}/health", self.base_url());

        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => Err(ApiError::NetworkError(e)),
        }
    }
}

#[async_trait]
impl StatusSource for CloudApiClient {
    async fn fetch_status(&self, vm_id: &str, operation_id: &str) -> power_tracker::Result<PowerOperation> {
        self.get_operation_status(vm_id, operation_id)
            .await
            .map_err(|e| TrackerError::StatusFetch(e.to_string()))
    }
}
