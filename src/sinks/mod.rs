//! Downstream sinks that materialize classified items.
//!
//! Each sink sits behind a trait so the dispatcher can be exercised with
//! mocks. The concrete implementations drive Calendar.app and Reminders
//! through `osascript`, fire URL-scheme reminders through `open(1)`, and
//! push notifications over HTTP.

pub mod calendar;
pub mod push;
pub mod reminders;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use tokio::process::Command;

use crate::classifier::EventItem;
use crate::errors::SinkError;

pub use calendar::AppleCalendar;
pub use push::NtfyPush;
pub use reminders::{AppleReminders, UrlSchemeReminder};

/// A calendar entry that already exists, for duplicate detection.
#[derive(Debug, Clone)]
pub struct ExistingEvent {
    pub title: String,
    pub start: NaiveDateTime,
}

#[async_trait]
pub trait CalendarSink: Send + Sync {
    /// Events starting on the given local day, across all calendars.
    async fn events_on_day(&self, day: NaiveDate) -> Result<Vec<ExistingEvent>, SinkError>;

    async fn create_event(&self, event: &EventItem) -> Result<(), SinkError>;
}

#[async_trait]
pub trait TaskSink: Send + Sync {
    /// Short name for logs and reports ("url-scheme", "reminders").
    fn name(&self) -> &str;

    async fn create_task(&self, title: &str, due: NaiveDateTime) -> Result<(), SinkError>;
}

#[async_trait]
pub trait PushSink: Send + Sync {
    async fn send(&self, report: &str) -> Result<(), SinkError>;
}

/// Run an AppleScript snippet and return its stdout.
pub(crate) async fn run_osascript(script: &str) -> Result<String, SinkError> {
    let output = Command::new("osascript")
        .arg("-e")
        .arg(script)
        .output()
        .await
        .map_err(|e| SinkError::WriteFailed(format!("osascript launch failed: {}", e)))?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    // -1743 is "Not authorized to send Apple events"; the user has to grant
    // Automation access before this sink can work.
    if stderr.contains("-1743") || stderr.to_ascii_lowercase().contains("not authorized") {
        Err(SinkError::AccessDenied(stderr))
    } else {
        Err(SinkError::WriteFailed(stderr))
    }
}

/// Escape a string for interpolation inside AppleScript double quotes.
pub(crate) fn escape_applescript(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Emit AppleScript statements that set `var` to the given local time.
/// Building the date field by field sidesteps locale-dependent `date "…"`
/// string parsing.
pub(crate) fn applescript_date_lines(var: &str, dt: NaiveDateTime) -> String {
    use chrono::{Datelike, Timelike};
    format!(
        "set {var} to current date\n\
         set year of {var} to {year}\n\
         set month of {var} to {month}\n\
         set day of {var} to {day}\n\
         set time of {var} to {secs}",
        var = var,
        year = dt.year(),
        month = dt.month(),
        day = dt.day(),
        secs = dt.hour() * 3600 + dt.minute() * 60 + dt.second(),
    )
}
