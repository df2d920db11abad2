//! API client for communicating with the attendance backend REST API.
//!
//! This module provides the `ApiClient` struct for making authenticated
//! requests for project tasks, task status commits, and attendance history.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{header, Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{AttendanceDay, TaskItem, TaskStatus};

use super::{ApiError, HistoryApi, TaskApi};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// The cache layer never cancels a request, so this is the only upper bound.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Serialize)]
struct StatusUpdateBody<'a> {
    company: &'a str,
    status: TaskStatus,
}

/// API client for the attendance backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a new API client rooted at `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Append `segments` to the base URL, percent-encoding each one so ids
    /// can never change the endpoint.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        if let Some(bad) = segments.iter().find(|s| s.is_empty() || **s == "." || **s == "..") {
            return Err(anyhow!("Invalid path segment: {:?}", bad));
        }
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid API base URL: {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("API base URL cannot take a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(ref token) = self.token {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body).into())
        }
    }

    /// Send a request, backing off and retrying while the server rate limits us.
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let attempt = request
                .try_clone()
                .ok_or_else(|| anyhow!("Request for {} cannot be retried", what))?;
            let response = attempt
                .send()
                .await
                .map_err(ApiError::from)
                .with_context(|| format!("Failed to send request for {}", what))?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited.into());
                    }
                    warn!(request = what, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    /// Read a response body and validate it against the expected schema.
    async fn parse_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        let text = response
            .text()
            .await
            .map_err(ApiError::from)
            .with_context(|| format!("Failed to read {} response body", what))?;
        serde_json::from_str(&text).map_err(|e| {
            ApiError::InvalidResponse(format!("Malformed {} payload: {}", what, e)).into()
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &[&str], query: &[(&str, &str)], what: &str) -> Result<T> {
        let request = self
            .client
            .get(self.endpoint(path)?)
            .headers(self.auth_headers()?)
            .query(query);
        let response = self.send(request, what).await?;
        Self::parse_json(response, what).await
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &[&str], body: &B, what: &str) -> Result<()> {
        let request = self
            .client
            .post(self.endpoint(path)?)
            .headers(self.auth_headers()?)
            .json(body);
        self.send(request, what).await?;
        Ok(())
    }
}

// ===== Remote Task API =====

#[async_trait]
impl TaskApi for ApiClient {
    async fn fetch_tasks(&self, company: &str, project: &str, employee: &str) -> Result<Vec<TaskItem>> {
        let tasks: Vec<TaskItem> = self
            .get(
                &["tasks"],
                &[("company", company), ("project", project), ("employee", employee)],
                "task list",
            )
            .await?;
        debug!(project = project, count = tasks.len(), "Fetched task list");
        Ok(tasks)
    }

    async fn update_task_status(&self, company: &str, task_id: &str, status: TaskStatus) -> Result<()> {
        let path = ["tasks", task_id, "status"];
        self.post(&path, &StatusUpdateBody { company, status }, "task status update")
            .await?;
        debug!(task_id = task_id, status = %status, "Committed task status");
        Ok(())
    }
}

// ===== Remote History API =====

#[async_trait]
impl HistoryApi for ApiClient {
    async fn fetch_history(
        &self,
        company: &str,
        employee: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AttendanceDay>> {
        let start = start.format("%Y-%m-%d").to_string();
        let end = end.format("%Y-%m-%d").to_string();
        let days: Vec<AttendanceDay> = self
            .get(
                &["attendance", "history"],
                &[
                    ("company", company),
                    ("employee", employee),
                    ("startDate", start.as_str()),
                    ("endDate", end.as_str()),
                ],
                "attendance history",
            )
            .await?;
        debug!(start = %start, end = %end, count = days.len(), "Fetched attendance history");
        Ok(days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let client = ApiClient::new("https://api.example.com/v1/").unwrap();
        assert_eq!(client.base_url(), "https://api.example.com/v1");
        assert_eq!(
            client.endpoint(&["tasks"]).unwrap().as_str(),
            "https://api.example.com/v1/tasks"
        );
        assert_eq!(
            client.endpoint(&["tasks", "9", "status"]).unwrap().as_str(),
            "https://api.example.com/v1/tasks/9/status"
        );
    }

    #[test]
    fn test_task_id_is_escaped_in_path() {
        let client = ApiClient::new("https://api.example.com").unwrap();
        let url = client.endpoint(&["tasks", "a/b?c#d", "status"]).unwrap();
        assert_eq!(url.path(), "/tasks/a%2Fb%3Fc%23d/status");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);

        assert!(client.endpoint(&["tasks", "..", "status"]).is_err());
        assert!(client.endpoint(&["tasks", ".", "status"]).is_err());
    }

    #[test]
    fn test_auth_headers() {
        let client = ApiClient::new("https://api.example.com").unwrap();
        let headers = client.auth_headers().unwrap();
        assert!(headers.get(header::AUTHORIZATION).is_none());

        let client = client.with_token("abc123".to_string());
        let headers = client.auth_headers().unwrap();
        assert_eq!(
            headers.get(header::AUTHORIZATION).unwrap(),
            "Bearer abc123"
        );
    }

    #[test]
    fn test_status_update_body() {
        let body = StatusUpdateBody {
            company: "acme",
            status: TaskStatus::InProgress,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"company": "acme", "status": "in-progress"})
        );
    }
}
