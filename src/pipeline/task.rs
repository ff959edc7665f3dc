use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

use crate::browser::selectors::Extraction;

/// Highest priority a task may carry
pub const MAX_PRIORITY: i64 = 100;

/// Reasons a fetch request is rejected before it enters the pipeline
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("malformed task payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported url scheme '{scheme}' in '{url}'")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("priority {0} is outside 0..=100")]
    PriorityOutOfRange(i64),

    #[error("task id must not be empty")]
    EmptyId,
}

/// Wire shape of a fetch request as it travels through the queue
#[derive(Debug, Deserialize)]
struct TaskMessage {
    url: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    priority: Option<i64>,
}

/// A validated request to fetch one page.
///
/// Only constructible through [`FetchTask::new`] or [`FetchTask::from_json`], so a
/// value of this type always carries an absolute http(s) URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchTask {
    url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<u8>,

    /// Stable id for an id-less queue message, derived from its payload
    #[serde(skip)]
    payload_id: Option<String>,
}

impl FetchTask {
    /// Validate the parts of a fetch request
    pub fn new(
        url: impl Into<String>,
        id: Option<String>,
        priority: Option<i64>,
    ) -> Result<Self, TaskError> {
        let url = url.into().trim().to_string();

        let parsed = Url::parse(&url).map_err(|e| TaskError::InvalidUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(TaskError::UnsupportedScheme {
                    url,
                    scheme: other.to_string(),
                })
            }
        }

        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(TaskError::InvalidUrl {
                url,
                reason: "missing host".to_string(),
            });
        }

        if matches!(&id, Some(id) if id.trim().is_empty()) {
            return Err(TaskError::EmptyId);
        }

        let priority = match priority {
            Some(p) if (0..=MAX_PRIORITY).contains(&p) => Some(p as u8),
            Some(p) => return Err(TaskError::PriorityOutOfRange(p)),
            None => None,
        };

        Ok(Self {
            url,
            id,
            priority,
            payload_id: None,
        })
    }

    /// Decode and validate one queue message payload.
    ///
    /// A message without an id gets one derived from its bytes, so a redelivered
    /// message maps to the same record.
    pub fn from_json(payload: &[u8]) -> Result<Self, TaskError> {
        let message: TaskMessage = serde_json::from_slice(payload)?;
        let mut task = Self::new(message.url, message.id, message.priority)?;
        if task.id.is_none() {
            task.payload_id = Some(payload_id(payload));
        }
        Ok(task)
    }

    /// Fill in a fresh id when the caller gave none
    pub fn with_generated_id(mut self) -> Self {
        if self.id.is_none() {
            self.id = Some(generate_id());
        }
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn priority(&self) -> Option<u8> {
        self.priority
    }

    /// Identifier for the page record: the caller's id, else the payload-derived
    /// one, else a fresh one
    pub fn record_id(&self) -> String {
        match self.id.as_ref().or(self.payload_id.as_ref()) {
            Some(id) => id.clone(),
            None => generate_id(),
        }
    }

    fn carryover_meta(&self) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert(
            "priority".to_string(),
            self.priority.map_or(Value::Null, Value::from),
        );
        meta
    }
}

/// Generate a unique record identifier
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn payload_id(payload: &[u8]) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, payload)
        .simple()
        .to_string()
}

/// Outcome of processing one task, as persisted to the document store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    /// Document key
    #[serde(rename = "_id")]
    pub id: String,

    pub url: String,

    /// HTTP status code, absent on transport failure
    pub status_code: Option<u16>,

    pub fetched_at: DateTime<Utc>,

    /// Time to response, or time to failure
    pub latency_ms: f64,

    /// Byte length of the response body
    pub content_length: u64,

    pub html: Option<String>,

    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,

    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl PageRecord {
    /// Record for a request that produced an HTTP response
    pub fn fetched(task: &FetchTask, status_code: u16, body: &[u8], latency_ms: f64) -> Self {
        Self {
            id: task.record_id(),
            url: task.url().to_string(),
            status_code: Some(status_code),
            fetched_at: Utc::now(),
            latency_ms: round_latency(latency_ms),
            content_length: body.len() as u64,
            html: Some(String::from_utf8_lossy(body).into_owned()),
            error: None,
            question: None,
            answer: None,
            meta: task.carryover_meta(),
        }
    }

    /// Record for a request that never produced a response
    pub fn failed(task: &FetchTask, error: impl Into<String>, latency_ms: f64) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "unknown fetch error".to_string();
        }

        Self {
            id: task.record_id(),
            url: task.url().to_string(),
            status_code: None,
            fetched_at: Utc::now(),
            latency_ms: round_latency(latency_ms),
            content_length: 0,
            html: None,
            error: Some(error),
            question: None,
            answer: None,
            meta: task.carryover_meta(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// `error` set <=> `status_code` absent <=> `html` absent
    pub fn is_consistent(&self) -> bool {
        self.error.is_some() == self.status_code.is_none()
            && self.error.is_some() == self.html.is_none()
    }

    /// Merge extracted fields. Fields are only ever added, never cleared.
    pub fn apply_extraction(&mut self, extraction: Extraction, extracted_by: &str) {
        if extraction.is_empty() {
            return;
        }

        if let Some(question) = extraction.question {
            self.question = Some(question);
        }
        if let Some(answer) = extraction.answer {
            self.answer = Some(answer);
        }
        self.meta
            .insert("extracted_by".to_string(), Value::from(extracted_by));
    }

    /// Parsed view published downstream, if anything was extracted
    pub fn parsed_page(&self) -> Option<ParsedPage> {
        if self.question.is_none() && self.answer.is_none() {
            return None;
        }

        Some(ParsedPage {
            url: self.url.clone(),
            id: Some(self.id.clone()),
            question: self.question.clone(),
            answer: self.answer.clone(),
        })
    }
}

/// Extracted question/answer pair published to the parsed topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedPage {
    pub url: String,
    pub id: Option<String>,
    pub question: Option<String>,
    pub answer: Option<String>,
}

fn round_latency(latency_ms: f64) -> f64 {
    if !latency_ms.is_finite() || latency_ms < 0.0 {
        return 0.0;
    }
    (latency_ms * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_accepts_minimal_payload() {
        let task =
            FetchTask::from_json(br#"{"url": "https://www.quora.com/What-is-Python"}"#).unwrap();

        assert_eq!(task.url(), "https://www.quora.com/What-is-Python");
        assert_eq!(task.id(), None);
        assert_eq!(task.priority(), None);
    }

    #[test]
    fn test_from_json_round_trips_optional_fields() {
        let payload = br#"{"url": "https://example.org", "id": "abc", "priority": 42}"#;
        let task = FetchTask::from_json(payload).unwrap();
        assert_eq!(task.id(), Some("abc"));
        assert_eq!(task.priority(), Some(42));

        let json: Value = serde_json::from_str(&task.to_json().unwrap()).unwrap();
        assert_eq!(json["url"], "https://example.org");
        assert_eq!(json["id"], "abc");
        assert_eq!(json["priority"], 42);
    }

    #[test]
    fn test_validation_rejects_bad_tasks() {
        assert!(matches!(FetchTask::from_json(b"not json"), Err(TaskError::Malformed(_))));
        assert!(matches!(FetchTask::from_json(br#"{"id": "x"}"#), Err(TaskError::Malformed(_))));
        assert!(matches!(
            FetchTask::new("/relative/path", None, None),
            Err(TaskError::InvalidUrl { .. })
        ));
        assert!(matches!(
            FetchTask::new("ftp://example.org/file", None, None),
            Err(TaskError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            FetchTask::new("https://example.org", None, Some(101)),
            Err(TaskError::PriorityOutOfRange(101))
        ));
        assert!(matches!(
            FetchTask::new("https://example.org", None, Some(-1)),
            Err(TaskError::PriorityOutOfRange(-1))
        ));
        assert!(matches!(
            FetchTask::new("https://example.org", Some("  ".to_string()), None),
            Err(TaskError::EmptyId)
        ));
    }

    #[test]
    fn test_record_id_is_generated_when_absent() {
        let task = FetchTask::new("https://example.org", None, None).unwrap();
        let first = task.record_id();
        let second = task.record_id();

        assert_eq!(first.len(), 32);
        assert_ne!(first, second);

        let task = FetchTask::new("https://example.org", Some("given".to_string()), None).unwrap();
        assert_eq!(task.record_id(), "given");
    }

    #[test]
    fn test_redelivered_payload_keeps_its_record_id() {
        let payload = br#"{"url": "https://www.quora.com/What-is-Python", "priority": 3}"#;
        let first = FetchTask::from_json(payload).unwrap();
        let second = FetchTask::from_json(payload).unwrap();

        assert_eq!(first.id(), None);
        assert_eq!(first.record_id(), second.record_id());
        assert_eq!(first.record_id(), first.record_id());
        assert_eq!(first.record_id().len(), 32);

        let other = FetchTask::from_json(br#"{"url": "https://www.quora.com/Other"}"#).unwrap();
        assert_ne!(first.record_id(), other.record_id());

        let explicit =
            FetchTask::from_json(br#"{"url": "https://example.org", "id": "mine"}"#).unwrap();
        assert_eq!(explicit.record_id(), "mine");
    }

    #[test]
    fn test_generated_id_travels_with_the_message() {
        let task = FetchTask::new("https://example.org", None, None)
            .unwrap()
            .with_generated_id();
        let id = task.id().unwrap().to_string();

        let decoded = FetchTask::from_json(task.to_json().unwrap().as_bytes()).unwrap();
        assert_eq!(decoded.id(), Some(id.as_str()));
        assert_eq!(decoded.record_id(), id);

        let kept = FetchTask::new("https://example.org", Some("fixed".to_string()), None)
            .unwrap()
            .with_generated_id();
        assert_eq!(kept.id(), Some("fixed"));
    }

    #[test]
    fn test_record_invariant_holds_for_both_outcomes() {
        let task = FetchTask::new("https://example.org", None, Some(7)).unwrap();

        let ok = PageRecord::fetched(&task, 200, b"<html></html>", 12.3456);
        assert!(ok.is_consistent());
        assert!(ok.is_success());
        assert_eq!(ok.content_length, 13);
        assert_eq!(ok.latency_ms, 12.35);
        assert_eq!(ok.meta["priority"], 7);

        let failed = PageRecord::failed(&task, "connection refused", 3.0);
        assert!(failed.is_consistent());
        assert!(!failed.is_success());
        assert_eq!(failed.status_code, None);
        assert_eq!(failed.html, None);
        assert_eq!(failed.content_length, 0);

        let blank = PageRecord::failed(&task, "", 1.0);
        assert!(blank.error.as_deref().is_some_and(|e| !e.is_empty()));
    }

    #[test]
    fn test_apply_extraction_only_adds_fields() {
        let task = FetchTask::new("https://www.quora.com/q", None, None).unwrap();
        let mut record = PageRecord::fetched(&task, 200, b"", 1.0);

        record.apply_extraction(
            Extraction {
                question: Some("Q?".to_string()),
                answer: None,
            },
            "html",
        );
        record.apply_extraction(
            Extraction {
                question: None,
                answer: Some("A".to_string()),
            },
            "browser",
        );

        assert_eq!(record.question.as_deref(), Some("Q?"));
        assert_eq!(record.answer.as_deref(), Some("A"));
        assert_eq!(record.meta["extracted_by"], "browser");

        let parsed = record.parsed_page().unwrap();
        assert_eq!(parsed.id.as_deref(), Some(record.id.as_str()));
    }

    #[test]
    fn test_record_serializes_id_as_document_key() {
        let task = FetchTask::new("https://example.org", Some("doc-1".to_string()), None).unwrap();
        let record = PageRecord::failed(&task, "timeout", 5.0);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["_id"], "doc-1");
        assert!(json.get("question").is_none());
        assert_eq!(json["meta"]["priority"], Value::Null);
    }
}
