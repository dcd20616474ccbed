//! Operation handlers
//!
//! One handler per `OperationType`. A handler validates payloads locally,
//! derives the dedup identity, performs the HTTP call, and names the cache
//! entries the call affects. The registry is built once and never mutated.

use super::api::{AnswerSubmit, ApiError, BatchAnswersSubmit, ExamSettingsUpdate, QuizApiClient, UserSettingsUpdate};
use super::models::{OperationError, OperationType};
use crate::cache::keys;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

const MIN_RATING: u8 = 1;
const MAX_RATING: u8 = 4;
const MIN_DAILY_GOAL: u32 = 1;
const MAX_DAILY_GOAL: u32 = 100;

#[async_trait]
pub trait OperationHandler: Send + Sync {
    fn op_type(&self) -> OperationType;

    /// Cheap local shape check; a failure is terminal
    fn validate(&self, payload: &Value) -> Result<(), OperationError>;

    /// Coalescing identity; `None` = never coalesced
    fn dedup_key(&self, payload: &Value) -> Option<String>;

    /// Perform the request; returns the server representation
    async fn execute(&self, payload: &Value) -> Result<Value, ApiError>;

    /// Cache key holding the entity the response describes
    fn entity_key(&self, _payload: &Value) -> Option<String> {
        None
    }

    /// Tags invalidated after success
    fn invalidation_tags(&self, payload: &Value) -> Vec<String>;

    /// Keys re-fetched after success
    fn refresh_keys(&self, payload: &Value) -> Vec<String>;
}

/// Handlers keyed by operation type
pub struct HandlerRegistry {
    handlers: HashMap<OperationType, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    pub fn new(handlers: Vec<Arc<dyn OperationHandler>>) -> Self {
        let mut map = HashMap::new();
        for handler in handlers {
            if map.insert(handler.op_type(), handler.clone()).is_some() {
                log::warn!("Duplicate handler for {}, keeping the last one", handler.op_type());
            }
        }
        Self { handlers: map }
    }

    /// The quiz backend handlers
    pub fn quiz(api: Arc<QuizApiClient>) -> Self {
        Self::new(vec![
            Arc::new(SubmitAnswerHandler::new(api.clone())),
            Arc::new(SubmitAnswersBatchHandler::new(api.clone())),
            Arc::new(UpdateSettingsHandler::new(api.clone())),
            Arc::new(SetExamSettingsHandler::new(api)),
        ])
    }

    pub fn get(&self, op_type: OperationType) -> Result<&Arc<dyn OperationHandler>, OperationError> {
        self.handlers
            .get(&op_type)
            .ok_or(OperationError::UnknownHandler { op_type })
    }

    pub fn contains(&self, op_type: OperationType) -> bool {
        self.handlers.contains_key(&op_type)
    }
}

fn parse<T: DeserializeOwned>(payload: &Value) -> Result<T, OperationError> {
    serde_json::from_value(payload.clone()).map_err(|e| OperationError::Validation {
        message: e.to_string(),
    })
}

fn invalid(message: impl Into<String>) -> OperationError {
    OperationError::Validation {
        message: message.into(),
    }
}

fn require_user(user_id: &str) -> Result<(), OperationError> {
    if user_id.trim().is_empty() {
        return Err(invalid("user_id must not be empty"));
    }
    // Used as a URL path segment and inside cache keys
    let token = user_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !matches!(user_id, "." | "..");
    if !token {
        return Err(invalid(format!("user_id '{}' contains unsupported characters", user_id)));
    }
    Ok(())
}

fn check_daily_goal(goal: u32) -> Result<(), OperationError> {
    if !(MIN_DAILY_GOAL..=MAX_DAILY_GOAL).contains(&goal) {
        return Err(invalid(format!(
            "daily_goal must be {}-{}, got {}",
            MIN_DAILY_GOAL, MAX_DAILY_GOAL, goal
        )));
    }
    Ok(())
}

/// Keys that change whenever an answer lands
fn progress_keys(user_id: &str) -> Vec<String> {
    vec![
        keys::user_stats(user_id),
        keys::daily_progress(user_id),
        keys::remaining_count(user_id),
    ]
}

fn user_id_of(payload: &Value) -> Option<&str> {
    payload.get("user_id").and_then(Value::as_str)
}

// ============================================================================
// SUBMIT_ANSWER
// ============================================================================

#[derive(Debug, Deserialize)]
struct SubmitAnswerPayload {
    #[serde(flatten)]
    answer: AnswerSubmit,
    #[serde(default)]
    rating: Option<u8>,
}

pub struct SubmitAnswerHandler {
    api: Arc<QuizApiClient>,
}

impl SubmitAnswerHandler {
    pub fn new(api: Arc<QuizApiClient>) -> Self {
        Self { api }
    }

    fn parse(payload: &Value) -> Result<SubmitAnswerPayload, OperationError> {
        let parsed: SubmitAnswerPayload = parse(payload)?;
        require_user(&parsed.answer.user_id)?;
        if let Some(rating) = parsed.rating {
            if !(MIN_RATING..=MAX_RATING).contains(&rating) {
                return Err(invalid(format!("rating must be {}-{}, got {}", MIN_RATING, MAX_RATING, rating)));
            }
        }
        Ok(parsed)
    }
}

#[async_trait]
impl OperationHandler for SubmitAnswerHandler {
    fn op_type(&self) -> OperationType {
        OperationType::SubmitAnswer
    }

    fn validate(&self, payload: &Value) -> Result<(), OperationError> {
        Self::parse(payload).map(|_| ())
    }

    fn dedup_key(&self, payload: &Value) -> Option<String> {
        let user_id = user_id_of(payload)?;
        let question_id = payload.get("question_id")?.as_i64()?;
        Some(format!("{}:{}", user_id, question_id))
    }

    async fn execute(&self, payload: &Value) -> Result<Value, ApiError> {
        let parsed = Self::parse(payload).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        self.api.submit_answer(&parsed.answer, parsed.rating).await
    }

    fn invalidation_tags(&self, payload: &Value) -> Vec<String> {
        user_id_of(payload).map(progress_keys).unwrap_or_default()
    }

    fn refresh_keys(&self, payload: &Value) -> Vec<String> {
        user_id_of(payload).map(progress_keys).unwrap_or_default()
    }
}

// ============================================================================
// SUBMIT_ANSWERS_BATCH
// ============================================================================

pub struct SubmitAnswersBatchHandler {
    api: Arc<QuizApiClient>,
}

impl SubmitAnswersBatchHandler {
    pub fn new(api: Arc<QuizApiClient>) -> Self {
        Self { api }
    }

    fn parse(payload: &Value) -> Result<BatchAnswersSubmit, OperationError> {
        let batch: BatchAnswersSubmit = parse(payload)?;
        require_user(&batch.user_id)?;
        if batch.answers.is_empty() {
            return Err(invalid("answers must not be empty"));
        }
        Ok(batch)
    }
}

#[async_trait]
impl OperationHandler for SubmitAnswersBatchHandler {
    fn op_type(&self) -> OperationType {
        OperationType::SubmitAnswersBatch
    }

    fn validate(&self, payload: &Value) -> Result<(), OperationError> {
        Self::parse(payload).map(|_| ())
    }

    fn dedup_key(&self, _payload: &Value) -> Option<String> {
        None
    }

    async fn execute(&self, payload: &Value) -> Result<Value, ApiError> {
        let batch = Self::parse(payload).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        self.api.submit_answers(&batch).await
    }

    /// The endpoint answers with fresh user stats
    fn entity_key(&self, payload: &Value) -> Option<String> {
        user_id_of(payload).map(keys::user_stats)
    }

    fn invalidation_tags(&self, payload: &Value) -> Vec<String> {
        user_id_of(payload).map(progress_keys).unwrap_or_default()
    }

    fn refresh_keys(&self, payload: &Value) -> Vec<String> {
        user_id_of(payload)
            .map(|user_id| vec![keys::daily_progress(user_id), keys::remaining_count(user_id)])
            .unwrap_or_default()
    }
}

// ============================================================================
// UPDATE_SETTINGS
// ============================================================================

#[derive(Debug, Deserialize)]
struct UpdateSettingsPayload {
    user_id: String,
    #[serde(flatten)]
    settings: UserSettingsUpdate,
}

pub struct UpdateSettingsHandler {
    api: Arc<QuizApiClient>,
}

impl UpdateSettingsHandler {
    pub fn new(api: Arc<QuizApiClient>) -> Self {
        Self { api }
    }

    fn parse(payload: &Value) -> Result<UpdateSettingsPayload, OperationError> {
        let parsed: UpdateSettingsPayload = parse(payload)?;
        require_user(&parsed.user_id)?;

        let settings = &parsed.settings;
        for (field, code) in [
            ("exam_country", &settings.exam_country),
            ("exam_language", &settings.exam_language),
            ("ui_language", &settings.ui_language),
        ] {
            if let Some(code) = code {
                if code.chars().count() != 2 {
                    return Err(invalid(format!("{} must be a 2-letter code, got '{}'", field, code)));
                }
            }
        }
        if let Some(goal) = settings.daily_goal {
            check_daily_goal(goal)?;
        }
        if *settings == UserSettingsUpdate::default() {
            return Err(invalid("no settings to update"));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl OperationHandler for UpdateSettingsHandler {
    fn op_type(&self) -> OperationType {
        OperationType::UpdateSettings
    }

    fn validate(&self, payload: &Value) -> Result<(), OperationError> {
        Self::parse(payload).map(|_| ())
    }

    /// `<user>:<changed fields>`; patches to different fields stay separate
    fn dedup_key(&self, payload: &Value) -> Option<String> {
        let user_id = user_id_of(payload)?;
        let mut fields: Vec<&str> = payload
            .as_object()?
            .iter()
            .filter(|(name, value)| name.as_str() != "user_id" && !value.is_null())
            .map(|(name, _)| name.as_str())
            .collect();
        fields.sort_unstable();
        Some(format!("{}:{}", user_id, fields.join(",")))
    }

    async fn execute(&self, payload: &Value) -> Result<Value, ApiError> {
        let parsed = Self::parse(payload).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        self.api.update_settings(&parsed.user_id, &parsed.settings).await
    }

    fn entity_key(&self, payload: &Value) -> Option<String> {
        user_id_of(payload).map(keys::user)
    }

    fn invalidation_tags(&self, payload: &Value) -> Vec<String> {
        user_id_of(payload)
            .map(|user_id| {
                vec![
                    keys::user(user_id),
                    keys::exam_settings(user_id),
                    keys::remaining_count(user_id),
                ]
            })
            .unwrap_or_default()
    }

    fn refresh_keys(&self, payload: &Value) -> Vec<String> {
        user_id_of(payload)
            .map(|user_id| vec![keys::exam_settings(user_id), keys::remaining_count(user_id)])
            .unwrap_or_default()
    }
}

// ============================================================================
// SET_EXAM_SETTINGS
// ============================================================================

#[derive(Debug, Deserialize)]
struct ExamSettingsPayload {
    user_id: String,
    #[serde(flatten)]
    settings: ExamSettingsUpdate,
}

pub struct SetExamSettingsHandler {
    api: Arc<QuizApiClient>,
}

impl SetExamSettingsHandler {
    pub fn new(api: Arc<QuizApiClient>) -> Self {
        Self { api }
    }

    fn parse(payload: &Value) -> Result<ExamSettingsPayload, OperationError> {
        let parsed: ExamSettingsPayload = parse(payload)?;
        require_user(&parsed.user_id)?;
        check_daily_goal(parsed.settings.daily_goal)?;
        Ok(parsed)
    }
}

#[async_trait]
impl OperationHandler for SetExamSettingsHandler {
    fn op_type(&self) -> OperationType {
        OperationType::SetExamSettings
    }

    fn validate(&self, payload: &Value) -> Result<(), OperationError> {
        Self::parse(payload).map(|_| ())
    }

    fn dedup_key(&self, payload: &Value) -> Option<String> {
        user_id_of(payload).map(str::to_string)
    }

    async fn execute(&self, payload: &Value) -> Result<Value, ApiError> {
        let parsed = Self::parse(payload).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        self.api.set_exam_settings(&parsed.user_id, &parsed.settings).await
    }

    fn entity_key(&self, payload: &Value) -> Option<String> {
        user_id_of(payload).map(keys::exam_settings)
    }

    fn invalidation_tags(&self, payload: &Value) -> Vec<String> {
        user_id_of(payload).map(|u| vec![keys::exam_settings(u)]).unwrap_or_default()
    }

    fn refresh_keys(&self, _payload: &Value) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> HandlerRegistry {
        let api = Arc::new(QuizApiClient::new("http://localhost:8000", Duration::from_secs(1)).unwrap());
        HandlerRegistry::quiz(api)
    }

    fn handler(op_type: OperationType) -> Arc<dyn OperationHandler> {
        registry().get(op_type).unwrap().clone()
    }

    #[test]
    fn test_registry_covers_all_types() {
        let registry = registry();
        for op_type in [
            OperationType::SubmitAnswer,
            OperationType::SubmitAnswersBatch,
            OperationType::UpdateSettings,
            OperationType::SetExamSettings,
        ] {
            assert_eq!(registry.get(op_type).unwrap().op_type(), op_type);
        }

        let empty = HandlerRegistry::new(Vec::new());
        assert_eq!(
            empty.get(OperationType::SubmitAnswer).err(),
            Some(OperationError::UnknownHandler {
                op_type: OperationType::SubmitAnswer
            })
        );
    }

    #[test]
    fn test_submit_answer_validation() {
        let h = handler(OperationType::SubmitAnswer);

        assert!(h.validate(&json!({"user_id": "u1", "question_id": 7, "is_correct": true})).is_ok());
        assert!(h
            .validate(&json!({"user_id": "u1", "question_id": 7, "is_correct": true, "rating": 3}))
            .is_ok());

        assert!(h.validate(&json!({"user_id": "u1", "question_id": "seven", "is_correct": true})).is_err());
        assert!(h.validate(&json!({"user_id": "", "question_id": 7, "is_correct": true})).is_err());
        for user_id in ["u1/../admin", "u1?x=1", "..", "u1:stats"] {
            assert!(h
                .validate(&json!({"user_id": user_id, "question_id": 7, "is_correct": true}))
                .is_err());
        }
        assert!(h
            .validate(&json!({"user_id": "u1", "question_id": 7, "is_correct": true, "rating": 5}))
            .is_err());
    }

    #[test]
    fn test_submit_answer_keys() {
        let h = handler(OperationType::SubmitAnswer);
        let payload = json!({"user_id": "u1", "question_id": 7, "is_correct": false});

        assert_eq!(h.dedup_key(&payload), Some("u1:7".to_string()));
        assert_eq!(h.entity_key(&payload), None);
        assert_eq!(
            h.invalidation_tags(&payload),
            vec!["userStats:u1", "dailyProgress:u1", "remainingCount:u1"]
        );
    }

    #[test]
    fn test_batch_never_dedups() {
        let h = handler(OperationType::SubmitAnswersBatch);
        let payload = json!({"user_id": "u1", "answers": [{"question_id": 1, "is_correct": true}]});

        assert!(h.validate(&payload).is_ok());
        assert!(h.validate(&json!({"user_id": "u1", "answers": []})).is_err());
        assert_eq!(h.dedup_key(&payload), None);
        assert_eq!(h.entity_key(&payload), Some("userStats:u1".to_string()));
        assert!(!h.refresh_keys(&payload).contains(&"userStats:u1".to_string()));
    }

    #[test]
    fn test_update_settings_validation() {
        let h = handler(OperationType::UpdateSettings);

        assert!(h.validate(&json!({"user_id": "u1", "ui_language": "en"})).is_ok());
        assert!(h
            .validate(&json!({"user_id": "u1", "exam_date": "2026-12-01", "daily_goal": 30}))
            .is_ok());

        assert!(h.validate(&json!({"user_id": "u1", "ui_language": "english"})).is_err());
        assert!(h.validate(&json!({"user_id": "u1", "daily_goal": 0})).is_err());
        assert!(h.validate(&json!({"user_id": "u1", "exam_date": "next week"})).is_err());
        assert!(h.validate(&json!({"user_id": "u1"})).is_err());
    }

    #[test]
    fn test_update_settings_dedup_by_fields() {
        let h = handler(OperationType::UpdateSettings);

        let a = h.dedup_key(&json!({"user_id": "u1", "ui_language": "en", "daily_goal": 10}));
        let b = h.dedup_key(&json!({"daily_goal": 20, "user_id": "u1", "ui_language": "de"}));
        let c = h.dedup_key(&json!({"user_id": "u1", "ui_language": "de"}));

        assert_eq!(a, Some("u1:daily_goal,ui_language".to_string()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_exam_settings() {
        let h = handler(OperationType::SetExamSettings);
        let payload = json!({"user_id": "u1", "exam_date": "2026-12-01", "daily_goal": 25});

        assert!(h.validate(&payload).is_ok());
        assert!(h
            .validate(&json!({"user_id": "u1", "exam_date": "2026-12-01", "daily_goal": 101}))
            .is_err());
        assert!(h.validate(&json!({"user_id": "u1", "daily_goal": 25})).is_err());
        assert_eq!(h.dedup_key(&payload), Some("u1".to_string()));
        assert_eq!(h.entity_key(&payload), Some("examSettings:u1".to_string()));
    }
}
