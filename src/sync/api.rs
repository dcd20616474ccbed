//! Quiz API Client - HTTP communication with the quiz backend
//!
//! Handles the REST calls the sync layer needs:
//! - Mutations replayed from the operation queue
//! - Read endpoints used to refresh cached resources
//! - Health probe for connectivity checks
//!
//! Every failure is classified into an `OperationError` so the queue can
//! decide between retry and terminal failure.

use super::models::OperationError;
use crate::cache::keys;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// API client for the quiz backend
#[derive(Clone)]
pub struct QuizApiClient {
    client: Client,
    base_url: Url,
}

impl QuizApiClient {
    /// Create new API client
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url.trim())?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Base URL plus path segments; each segment is percent-encoded, so ids
    /// cannot add segments or a query
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        if let Some(bad) = segments.iter().find(|s| matches!(**s, "" | "." | "..")) {
            return Err(ApiError::InvalidRequest(format!("Invalid path segment '{}'", bad)));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidRequest(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Submit a single answer
    pub async fn submit_answer(&self, answer: &AnswerSubmit, rating: Option<u8>) -> Result<Value, ApiError> {
        let mut request = self.client.post(self.endpoint(&["user_progress", "submit_answer"])?);
        if let Some(rating) = rating {
            request = request.query(&[("rating", rating)]);
        }
        let response = request.json(answer).send().await?;

        handle_response(response).await
    }

    /// Submit several answers; returns refreshed user stats
    pub async fn submit_answers(&self, batch: &BatchAnswersSubmit) -> Result<Value, ApiError> {
        let response = self
            .client
            .post(self.endpoint(&["user_progress", "submit_answers"])?)
            .json(batch)
            .send()
            .await?;

        handle_response(response).await
    }

    /// Patch user settings; returns the updated user
    pub async fn update_settings(&self, user_id: &str, update: &UserSettingsUpdate) -> Result<Value, ApiError> {
        let response = self
            .client
            .patch(self.endpoint(&["users", user_id])?)
            .json(update)
            .send()
            .await?;

        handle_response(response).await
    }

    /// Set exam date and daily goal
    pub async fn set_exam_settings(&self, user_id: &str, settings: &ExamSettingsUpdate) -> Result<Value, ApiError> {
        let response = self
            .client
            .post(self.endpoint(&["users", user_id, "exam-settings"])?)
            .json(settings)
            .send()
            .await?;

        handle_response(response).await
    }

    pub async fn get_user_stats(&self, user_id: &str) -> Result<Value, ApiError> {
        self.get_json(&["users", user_id, "stats"], &[]).await
    }

    pub async fn get_daily_progress(&self, user_id: &str) -> Result<Value, ApiError> {
        self.get_json(&["users", user_id, "daily-progress"], &[]).await
    }

    pub async fn get_exam_settings(&self, user_id: &str) -> Result<Value, ApiError> {
        self.get_json(&["users", user_id, "exam-settings"], &[]).await
    }

    pub async fn get_remaining_count(&self, user_id: &str, country: &str, language: &str) -> Result<Value, ApiError> {
        self.get_json(
            &["questions", "remaining-count"],
            &[("user_id", user_id), ("country", country), ("language", language)],
        )
        .await
    }

    /// Connectivity probe
    pub async fn health(&self) -> Result<(), ApiError> {
        let response = self.client.get(self.endpoint(&["health"])?).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }

    async fn get_json(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Value, ApiError> {
        let mut request = self.client.get(self.endpoint(segments)?);
        if !query.is_empty() {
            request = request.query(query);
        }
        let response = request.send().await?;

        handle_response(response).await
    }
}

// ============================================================================
// Read-side resources
// ============================================================================

/// A cached resource that can be re-fetched from the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    UserStats { user_id: String },
    DailyProgress { user_id: String },
    ExamSettings { user_id: String },
    RemainingCount { user_id: String, country: String, language: String },
}

impl Resource {
    /// Map a cache key to its endpoint. `profile` is the cached `user:<id>`
    /// value, needed for country/language scoped resources.
    pub fn from_key(key: &str, profile: Option<&Value>) -> Option<Self> {
        let (namespace, user_id) = keys::split(key)?;
        let user_id = user_id.to_string();

        match namespace {
            keys::USER_STATS => Some(Self::UserStats { user_id }),
            keys::DAILY_PROGRESS => Some(Self::DailyProgress { user_id }),
            keys::EXAM_SETTINGS => Some(Self::ExamSettings { user_id }),
            keys::REMAINING_COUNT => {
                let profile = profile?;
                let country = profile.get("exam_country")?.as_str()?.to_string();
                let language = profile.get("exam_language")?.as_str()?.to_string();
                Some(Self::RemainingCount {
                    user_id,
                    country,
                    language,
                })
            }
            _ => None,
        }
    }
}

/// Source of fresh data for cache refresh and connectivity probing
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, resource: &Resource) -> Result<Value, ApiError>;

    async fn health(&self) -> Result<(), ApiError>;
}

#[async_trait]
impl ResourceFetcher for QuizApiClient {
    async fn fetch(&self, resource: &Resource) -> Result<Value, ApiError> {
        match resource {
            Resource::UserStats { user_id } => self.get_user_stats(user_id).await,
            Resource::DailyProgress { user_id } => self.get_daily_progress(user_id).await,
            Resource::ExamSettings { user_id } => self.get_exam_settings(user_id).await,
            Resource::RemainingCount {
                user_id,
                country,
                language,
            } => self.get_remaining_count(user_id, country, language).await,
        }
    }

    async fn health(&self) -> Result<(), ApiError> {
        QuizApiClient::health(self).await
    }
}

// ============================================================================
// API Request Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerSubmit {
    pub user_id: String,
    pub question_id: i64,
    pub is_correct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAnswerItem {
    pub question_id: i64,
    pub is_correct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAnswersSubmit {
    pub user_id: String,
    pub answers: Vec<BatchAnswerItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserSettingsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam_country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_goal: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamSettingsUpdate {
    pub exam_date: NaiveDate,
    pub daily_goal: u32,
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Request not sent: {0}")]
    InvalidRequest(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Map to the retry taxonomy
    pub fn classify(&self) -> OperationError {
        match self {
            ApiError::Request(e) if e.is_decode() => OperationError::InvalidResponse {
                message: e.to_string(),
            },
            ApiError::Request(e) => OperationError::Network {
                message: e.to_string(),
            },
            ApiError::InvalidUrl(e) => OperationError::Validation {
                message: e.to_string(),
            },
            ApiError::InvalidRequest(message) => OperationError::Validation {
                message: message.clone(),
            },
            ApiError::Status { status, message } => {
                let retryable = *status >= 500
                    || *status == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || *status == StatusCode::TOO_MANY_REQUESTS.as_u16();
                if retryable {
                    OperationError::Server {
                        status: *status,
                        message: message.clone(),
                    }
                } else {
                    OperationError::Client {
                        status: *status,
                        message: message.clone(),
                    }
                }
            }
            ApiError::InvalidResponse(message) => OperationError::InvalidResponse {
                message: message.clone(),
            },
        }
    }
}

/// Handle successful JSON response; an empty body decodes to `null`
async fn handle_response(response: reqwest::Response) -> Result<Value, ApiError> {
    let status = response.status();

    if !status.is_success() {
        return Err(handle_error(response).await);
    }

    let body = response.text().await?;
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
}

/// Convert error response to ApiError
async fn handle_error(response: reqwest::Response) -> ApiError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    let message = serde_json::from_str::<ErrorResponse>(&body)
        .ok()
        .and_then(ErrorResponse::into_message)
        .unwrap_or_else(|| {
            if body.is_empty() {
                status.canonical_reason().unwrap_or("Unknown error").to_string()
            } else {
                body
            }
        });

    ApiError::Status {
        status: status.as_u16(),
        message,
    }
}

/// FastAPI uses `detail`; some proxies use `error`
#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    detail: Option<Value>,
    error: Option<String>,
}

impl ErrorResponse {
    fn into_message(self) -> Option<String> {
        match self.detail {
            Some(Value::String(detail)) => Some(detail),
            Some(other) => Some(other.to_string()),
            None => self.error,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn client(server: &Server) -> QuizApiClient {
        QuizApiClient::new(&server.url(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_invalid_base_url() {
        let result = QuizApiClient::new("not a url", Duration::from_secs(1));
        assert!(matches!(result, Err(ApiError::InvalidUrl(_))));
    }

    #[test]
    fn test_base_path_is_preserved() {
        let client = QuizApiClient::new("https://quiz.example.com/api", Duration::from_secs(1)).unwrap();
        let url = client.endpoint(&["users", "u1", "stats"]).unwrap();
        assert_eq!(url.as_str(), "https://quiz.example.com/api/users/u1/stats");

        let client = QuizApiClient::new("https://quiz.example.com/api/", Duration::from_secs(1)).unwrap();
        let url = client.endpoint(&["health"]).unwrap();
        assert_eq!(url.as_str(), "https://quiz.example.com/api/health");
    }

    #[test]
    fn test_user_id_stays_one_segment() {
        let client = QuizApiClient::new("https://quiz.example.com/api", Duration::from_secs(1)).unwrap();

        let url = client.endpoint(&["users", "u1/../admin?x=1", "stats"]).unwrap();
        assert_eq!(url.path(), "/api/users/u1%2F..%2Fadmin%3Fx=1/stats");
        assert_eq!(url.query(), None);

        assert!(matches!(
            client.endpoint(&["users", "..", "stats"]),
            Err(ApiError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_answer_sends_rating_and_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/user_progress/submit_answer")
            .match_query(Matcher::UrlEncoded("rating".into(), "4".into()))
            .match_body(Matcher::Json(json!({
                "user_id": "u1",
                "question_id": 42,
                "is_correct": true,
                "timestamp": 1_700_000_000_000i64
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"question_id": 42, "reps": 1}"#)
            .create_async()
            .await;

        let answer = AnswerSubmit {
            user_id: "u1".to_string(),
            question_id: 42,
            is_correct: true,
            timestamp: Some(1_700_000_000_000),
            response_time: None,
        };
        let value = client(&server).submit_answer(&answer, Some(4)).await.unwrap();

        assert_eq!(value["reps"], 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_update_settings_patch() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PATCH", "/users/u1")
            .match_body(Matcher::Json(json!({"daily_goal": 30})))
            .with_status(200)
            .with_body(r#"{"id": "u1", "daily_goal": 30}"#)
            .create_async()
            .await;

        let update = UserSettingsUpdate {
            daily_goal: Some(30),
            ..UserSettingsUpdate::default()
        };
        let value = client(&server).update_settings("u1", &update).await.unwrap();

        assert_eq!(value, json!({"id": "u1", "daily_goal": 30}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_remaining_count_query() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/questions/remaining-count")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("user_id".into(), "u1".into()),
                Matcher::UrlEncoded("country".into(), "de".into()),
                Matcher::UrlEncoded("language".into(), "en".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"remaining_count": 17}"#)
            .create_async()
            .await;

        let profile = json!({"exam_country": "de", "exam_language": "en"});
        let resource = Resource::from_key("remainingCount:u1", Some(&profile)).unwrap();
        let value = client(&server).fetch(&resource).await.unwrap();

        assert_eq!(value, json!({"remaining_count": 17}));
        mock.assert_async().await;
    }

    #[test]
    fn test_resource_from_key() {
        assert_eq!(
            Resource::from_key("userStats:u1", None),
            Some(Resource::UserStats { user_id: "u1".to_string() })
        );
        // Needs the user's exam country/language
        assert_eq!(Resource::from_key("remainingCount:u1", None), None);
        assert_eq!(Resource::from_key("remainingCount:u1", Some(&json!({"exam_country": "de"}))), None);
        // No read endpoint keyed by user id
        assert_eq!(Resource::from_key("user:u1", None), None);
        assert_eq!(Resource::from_key("garbage", None), None);
    }

    #[tokio::test]
    async fn test_empty_body_is_null() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/users/u1/exam-settings")
            .with_status(204)
            .create_async()
            .await;

        let settings = ExamSettingsUpdate {
            exam_date: NaiveDate::from_ymd_opt(2026, 12, 1).unwrap(),
            daily_goal: 20,
        };
        let value = client(&server).set_exam_settings("u1", &settings).await.unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn test_status_classification() {
        let mut server = Server::new_async().await;
        let _unavailable = server
            .mock("GET", "/users/a/stats")
            .with_status(503)
            .create_async()
            .await;
        let _rejected = server
            .mock("GET", "/users/b/stats")
            .with_status(422)
            .with_body(r#"{"detail": "daily_goal out of range"}"#)
            .create_async()
            .await;
        let _throttled = server
            .mock("GET", "/users/c/stats")
            .with_status(429)
            .create_async()
            .await;
        let _garbled = server
            .mock("GET", "/users/d/stats")
            .with_status(200)
            .with_body("<html>captive portal</html>")
            .create_async()
            .await;

        let api = client(&server);

        let err = api.get_user_stats("a").await.unwrap_err();
        assert!(matches!(err.classify(), OperationError::Server { status: 503, .. }));

        let err = api.get_user_stats("b").await.unwrap_err();
        assert_eq!(
            err.classify(),
            OperationError::Client {
                status: 422,
                message: "daily_goal out of range".to_string()
            }
        );

        let err = api.get_user_stats("c").await.unwrap_err();
        assert!(err.classify().is_retryable());

        let err = api.get_user_stats("d").await.unwrap_err();
        assert!(matches!(err.classify(), OperationError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network() {
        // Nothing listens on port 9 locally
        let api = QuizApiClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = api.health().await.unwrap_err();
        assert!(err.classify().is_network());
    }

    #[tokio::test]
    async fn test_health() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status": "ok"}"#)
            .create_async()
            .await;

        assert!(client(&server).health().await.is_ok());
    }
}
