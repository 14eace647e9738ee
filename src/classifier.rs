//! LLM classification of new messages into events and tasks.
//!
//! The model is held to a strict contract: a JSON object `{"items":[...]}`
//! with no surrounding prose. Everything that comes back is treated as
//! untrusted — parsed loosely into raw structs, then run through an explicit
//! validation pass that drops anything malformed with a logged warning.
//! Only a failed network call or an unparseable envelope fails the whole
//! classify operation; the orchestrator retries that batch next cycle.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::errors::ClassifyError;
use crate::http_client::build_http_client;
use crate::transcript::BOUNDARY_MARKER;

/// A validated calendar event extracted from the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct EventItem {
    pub title: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub all_day: bool,
}

/// A validated actionable task extracted from the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskItem {
    pub title: String,
    pub due_minutes: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedItem {
    Event(EventItem),
    Task(TaskItem),
}

impl ClassifiedItem {
    pub fn title(&self) -> &str {
        match self {
            ClassifiedItem::Event(e) => &e.title,
            ClassifiedItem::Task(t) => &t.title,
        }
    }
}

/// Classifier seam. The production implementation calls Ollama; tests
/// script this trait directly.
#[async_trait]
pub trait Classify: Send + Sync {
    async fn classify(
        &self,
        transcript: &str,
        now: NaiveDateTime,
    ) -> Result<Vec<ClassifiedItem>, ClassifyError>;
}

// ========================================================================
// Ollama wire types
// ========================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    format: String,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

// ========================================================================
// Raw (untrusted) item shape
// ========================================================================

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    items: Vec<RawItem>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    #[serde(rename = "type")]
    kind: Option<String>,
    title: Option<String>,
    start: Option<String>,
    end: Option<String>,
    #[serde(default)]
    all_day: Option<bool>,
    due_minutes: Option<i64>,
}

// ========================================================================
// Production classifier
// ========================================================================

pub struct LlmClassifier {
    api_url: String,
    model: String,
    client: reqwest::Client,
}

impl LlmClassifier {
    pub fn new(api_url: String, model: String, timeout: std::time::Duration) -> Self {
        Self {
            api_url,
            model,
            client: build_http_client(Some(timeout)),
        }
    }
}

#[async_trait]
impl Classify for LlmClassifier {
    async fn classify(
        &self,
        transcript: &str,
        now: NaiveDateTime,
    ) -> Result<Vec<ClassifiedItem>, ClassifyError> {
        let url = format!("{}/api/chat", self.api_url);
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: extraction_rules(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt(transcript, now),
                },
            ],
            format: "json".to_string(),
            stream: false,
            options: ChatOptions { temperature: 0.0 },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ClassifyError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read body".to_string());
            return Err(ClassifyError::Network(format!("{}: {}", status, body)));
        }

        let completion: ChatResponse = response
            .json()
            .await
            .map_err(|e| ClassifyError::Parse(format!("bad chat response: {}", e)))?;

        let items = parse_items(&completion.message.content)?;
        let (valid, warnings) = validate_items(items, now);
        for warning in &warnings {
            tracing::warn!("Dropping item: {}", warning);
        }
        Ok(valid)
    }
}

// ========================================================================
// Prompt construction
// ========================================================================

fn extraction_rules() -> String {
    format!(
        "You extract calendar events and actionable tasks from a chat transcript. \
         Lines are tagged [them] (the contact) or [me] (the user). \
         The marker \"{boundary}\" separates old context from new messages.\n\
         Rules:\n\
         - Extract ONLY from [them] lines AFTER the \"{boundary}\" marker. \
           Never extract from context lines or [me] lines.\n\
         - Casual conversation with no concrete date, plan, or request yields an empty list.\n\
         - Confirmed or stated plans are events. Questions (\"should we...?\") and \
           past-tense references are NOT events.\n\
         - A single message may yield multiple items.\n\
         - Events need: title, start as ISO-8601 local time with no timezone suffix \
           (YYYY-MM-DDTHH:MM:SS), end (default one hour after start), and all_day. \
           A bare date with no time means an all-day event starting at midnight. \
           Multi-day spans start at the first day's start and end at the last day's end.\n\
         - Tasks need: title and due_minutes (minutes from now; default 30).\n\
         Respond with ONLY a JSON object, no prose, of the shape:\n\
         {{\"items\":[{{\"type\":\"event\",\"title\":\"...\",\"start\":\"...\",\"end\":\"...\",\
         \"all_day\":false}},{{\"type\":\"task\",\"title\":\"...\",\"due_minutes\":30}}]}}\n\
         Return {{\"items\":[]}} when there is nothing to extract.",
        boundary = BOUNDARY_MARKER
    )
}

fn user_prompt(transcript: &str, now: NaiveDateTime) -> String {
    format!(
        "Current date/time: {} ({})\n\nTranscript:\n{}",
        now.format("%Y-%m-%dT%H:%M:%S"),
        now.format("%A"),
        transcript
    )
}

// ========================================================================
// Parse + validate
// ========================================================================

/// Parse the model's message content into raw items. Tolerates a Markdown
/// code fence around the JSON; anything else that fails to parse is a hard
/// failure for the whole call.
pub fn parse_items(content: &str) -> Result<Vec<RawItemOwned>, ClassifyError> {
    let cleaned = strip_code_fences(content);
    let envelope: RawEnvelope = serde_json::from_str(cleaned)
        .map_err(|e| ClassifyError::Parse(format!("{} in: {}", e, truncate(content, 300))))?;
    Ok(envelope.items.into_iter().map(RawItemOwned::from).collect())
}

/// Owned mirror of the raw wire item, exposed so tests and the validation
/// pass can build instances directly.
#[derive(Debug, Clone, Default)]
pub struct RawItemOwned {
    pub kind: Option<String>,
    pub title: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub all_day: Option<bool>,
    pub due_minutes: Option<i64>,
}

impl From<RawItem> for RawItemOwned {
    fn from(raw: RawItem) -> Self {
        Self {
            kind: raw.kind,
            title: raw.title,
            start: raw.start,
            end: raw.end,
            all_day: raw.all_day,
            due_minutes: raw.due_minutes,
        }
    }
}

fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        // Drop an optional language tag on the fence line.
        let body = match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => rest,
        };
        return body.trim_end().trim_end_matches("```").trim();
    }
    trimmed
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

enum ParsedStart {
    DateTime(NaiveDateTime),
    DateOnly(NaiveDate),
}

fn parse_timestamp(raw: &str) -> Option<ParsedStart> {
    let raw = raw.trim();
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ParsedStart::DateTime(dt));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(ParsedStart::DateOnly)
}

fn day_start(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).unwrap_or(NaiveDateTime::MIN)
}

fn day_end(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(23, 59, 59).unwrap_or(NaiveDateTime::MAX)
}

/// Validation pass: every raw item either becomes a typed item or a
/// rejection reason. Field presence is never trusted.
pub fn validate_items(
    raw_items: Vec<RawItemOwned>,
    now: NaiveDateTime,
) -> (Vec<ClassifiedItem>, Vec<String>) {
    let mut valid = Vec::new();
    let mut warnings = Vec::new();

    for raw in raw_items {
        let title = raw
            .title
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if title.is_empty() {
            warnings.push("item has an empty title".to_string());
            continue;
        }

        let kind = raw
            .kind
            .as_deref()
            .map(|k| k.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match kind.as_str() {
            "event" => {
                let start_raw = match raw.start.as_deref() {
                    Some(s) if !s.trim().is_empty() => s,
                    _ => {
                        warnings.push(format!("event '{}' has no start", title));
                        continue;
                    }
                };
                let parsed = match parse_timestamp(start_raw) {
                    Some(p) => p,
                    None => {
                        warnings.push(format!(
                            "event '{}' has unparseable start '{}'",
                            title, start_raw
                        ));
                        continue;
                    }
                };

                let (start, end, all_day) = match parsed {
                    ParsedStart::DateOnly(date) => {
                        // Bare date: all-day, midnight bounds; a later bare
                        // end date makes a multi-day span through its day end.
                        let end = match raw.end.as_deref().and_then(parse_timestamp) {
                            Some(ParsedStart::DateOnly(e)) if e > date => day_end(e),
                            _ => day_start(date),
                        };
                        (day_start(date), end, true)
                    }
                    ParsedStart::DateTime(start) => {
                        let end = match raw.end.as_deref().and_then(parse_timestamp) {
                            Some(ParsedStart::DateTime(e)) if e > start => e,
                            Some(ParsedStart::DateOnly(e)) if e > start.date() => day_end(e),
                            _ => start + Duration::hours(1),
                        };
                        if raw.all_day.unwrap_or(false) {
                            (day_start(start.date()), day_end(end.date()), true)
                        } else {
                            (start, end, false)
                        }
                    }
                };

                // Guard against the model inferring the wrong year.
                if (start - now).abs() > Duration::days(365) {
                    warnings.push(format!(
                        "event '{}' starts {} — more than a year from now",
                        title, start
                    ));
                    continue;
                }

                valid.push(ClassifiedItem::Event(EventItem {
                    title,
                    start,
                    end,
                    all_day,
                }));
            }
            "task" => {
                let due_minutes = raw.due_minutes.unwrap_or(30);
                if due_minutes < 0 {
                    warnings.push(format!("task '{}' has negative due_minutes", title));
                    continue;
                }
                valid.push(ClassifiedItem::Task(TaskItem { title, due_minutes }));
            }
            other => {
                warnings.push(format!("item '{}' has unknown type '{}'", title, other));
            }
        }
    }

    (valid, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> NaiveDateTime {
        // A known Monday.
        NaiveDate::from_ymd_opt(2026, 8, 24)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn raw_event(title: &str, start: Option<&str>, end: Option<&str>) -> RawItemOwned {
        RawItemOwned {
            kind: Some("event".to_string()),
            title: Some(title.to_string()),
            start: start.map(str::to_string),
            end: end.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn parses_plain_and_fenced_json() {
        let plain = r#"{"items":[{"type":"task","title":"grab milk"}]}"#;
        assert_eq!(parse_items(plain).unwrap().len(), 1);

        let fenced = "```json\n{\"items\":[{\"type\":\"task\",\"title\":\"grab milk\"}]}\n```";
        assert_eq!(parse_items(fenced).unwrap().len(), 1);

        let bare_fence = "```\n{\"items\":[]}\n```";
        assert!(parse_items(bare_fence).unwrap().is_empty());
    }

    #[test]
    fn bad_envelope_is_a_parse_failure() {
        let err = parse_items("Sure! Here are the items you asked for.").unwrap_err();
        assert!(matches!(err, ClassifyError::Parse(_)));
    }

    #[test]
    fn event_gets_default_one_hour_end() {
        let (valid, warnings) = validate_items(
            vec![raw_event("dinner", Some("2026-08-28T19:00:00"), None)],
            now(),
        );
        assert!(warnings.is_empty());
        let ClassifiedItem::Event(event) = &valid[0] else {
            panic!("expected event");
        };
        assert_eq!(event.title, "dinner");
        assert_eq!(
            event.start,
            NaiveDate::from_ymd_opt(2026, 8, 28)
                .unwrap()
                .and_hms_opt(19, 0, 0)
                .unwrap()
        );
        assert_eq!(event.end, event.start + Duration::hours(1));
        assert!(!event.all_day);
    }

    #[test]
    fn bare_date_is_all_day_with_midnight_bounds() {
        let (valid, _) = validate_items(vec![raw_event("conference", Some("2026-09-10"), None)], now());
        let ClassifiedItem::Event(event) = &valid[0] else {
            panic!("expected event");
        };
        assert!(event.all_day);
        assert_eq!(event.start, day_start(NaiveDate::from_ymd_opt(2026, 9, 10).unwrap()));
        assert_eq!(event.end, event.start);
    }

    #[test]
    fn multi_day_span_runs_to_last_day_end() {
        let (valid, _) = validate_items(
            vec![raw_event("ski trip", Some("2026-12-04"), Some("2026-12-06"))],
            now(),
        );
        let ClassifiedItem::Event(event) = &valid[0] else {
            panic!("expected event");
        };
        assert!(event.all_day);
        assert_eq!(event.start, day_start(NaiveDate::from_ymd_opt(2026, 12, 4).unwrap()));
        assert_eq!(event.end, day_end(NaiveDate::from_ymd_opt(2026, 12, 6).unwrap()));
    }

    #[test]
    fn end_before_start_falls_back_to_one_hour() {
        let (valid, _) = validate_items(
            vec![raw_event(
                "meeting",
                Some("2026-08-28T15:00:00"),
                Some("2026-08-28T14:00:00"),
            )],
            now(),
        );
        let ClassifiedItem::Event(event) = &valid[0] else {
            panic!("expected event");
        };
        assert_eq!(event.end, event.start + Duration::hours(1));
    }

    #[test]
    fn invalid_items_are_dropped_with_reasons() {
        let raw = vec![
            raw_event("", Some("2026-08-28T19:00:00"), None),
            raw_event("no start", None, None),
            raw_event("bad start", Some("next friday"), None),
            RawItemOwned {
                kind: Some("poem".to_string()),
                title: Some("roses".to_string()),
                ..Default::default()
            },
            RawItemOwned {
                kind: Some("task".to_string()),
                title: Some("negative".to_string()),
                due_minutes: Some(-5),
                ..Default::default()
            },
        ];
        let (valid, warnings) = validate_items(raw, now());
        assert!(valid.is_empty());
        assert_eq!(warnings.len(), 5);
    }

    #[test]
    fn far_future_event_is_rejected() {
        // 400 days out: the model probably inferred the wrong year.
        let (valid, warnings) = validate_items(
            vec![raw_event("reunion", Some("2027-09-28T12:00:00"), None)],
            now(),
        );
        assert!(valid.is_empty());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("more than a year"));
    }

    #[test]
    fn far_past_event_is_rejected_too() {
        let (valid, _) = validate_items(
            vec![raw_event("old thing", Some("2025-01-01T12:00:00"), None)],
            now(),
        );
        assert!(valid.is_empty());
    }

    #[test]
    fn task_defaults_to_thirty_minutes() {
        let raw = RawItemOwned {
            kind: Some("task".to_string()),
            title: Some("grab milk".to_string()),
            ..Default::default()
        };
        let (valid, _) = validate_items(vec![raw], now());
        assert_eq!(
            valid,
            vec![ClassifiedItem::Task(TaskItem {
                title: "grab milk".to_string(),
                due_minutes: 30,
            })]
        );
    }

    #[test]
    fn prompt_embeds_day_of_week_and_boundary_rule() {
        let prompt = user_prompt("[them] hi", now());
        assert!(prompt.contains("2026-08-24T09:00:00"));
        assert!(prompt.contains("Monday"));

        let rules = extraction_rules();
        assert!(rules.contains(BOUNDARY_MARKER));
        assert!(rules.contains("ONLY from [them] lines"));
        assert!(rules.contains("due_minutes"));
    }
}
