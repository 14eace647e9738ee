//! Task reminder sinks: an x-callback-url reminder app and native Reminders.

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use tokio::process::Command;

use super::{applescript_date_lines, escape_applescript, run_osascript, TaskSink};
use crate::errors::SinkError;

/// Fire-and-forget reminder creation through a URL scheme
/// (`<scheme>://x-callback-url/add?title=…&secs=…`). There is no success
/// signal beyond `open(1)` exiting cleanly.
pub struct UrlSchemeReminder {
    scheme: String,
}

impl UrlSchemeReminder {
    pub fn new(scheme: String) -> Self {
        Self { scheme }
    }

    fn build_url(&self, title: &str, seconds_until_due: i64) -> String {
        format!(
            "{}://x-callback-url/add?title={}&secs={}",
            self.scheme,
            percent_encode(title),
            seconds_until_due
        )
    }
}

#[async_trait]
impl TaskSink for UrlSchemeReminder {
    fn name(&self) -> &str {
        "url-scheme"
    }

    async fn create_task(&self, title: &str, due: NaiveDateTime) -> Result<(), SinkError> {
        let seconds = (due - Local::now().naive_local()).num_seconds().max(0);
        let url = self.build_url(title, seconds);

        let status = Command::new("open")
            .arg(&url)
            .status()
            .await
            .map_err(|e| SinkError::WriteFailed(format!("open launch failed: {}", e)))?;

        if !status.success() {
            return Err(SinkError::WriteFailed(format!(
                "open exited with {} for {}",
                status, url
            )));
        }
        tracing::info!("Fired URL-scheme reminder '{}' due in {}s", title, seconds);
        Ok(())
    }
}

/// Native Reminders sink. Creates the reminder in the configured list (or
/// the app default) with a remind-me date, which doubles as the alarm.
pub struct AppleReminders {
    list: Option<String>,
}

impl AppleReminders {
    pub fn new(list: Option<String>) -> Self {
        Self { list }
    }
}

#[async_trait]
impl TaskSink for AppleReminders {
    fn name(&self) -> &str {
        "reminders"
    }

    async fn create_task(&self, title: &str, due: NaiveDateTime) -> Result<(), SinkError> {
        let target = match &self.list {
            Some(list) => format!("list \"{}\"", escape_applescript(list)),
            None => "default list".to_string(),
        };
        let script = format!(
            "{due_lines}\n\
             tell application \"Reminders\"\n\
             tell {target}\n\
             make new reminder with properties {{name:\"{title}\", remind me date:dueDate}}\n\
             end tell\n\
             end tell",
            due_lines = applescript_date_lines("dueDate", due),
            target = target,
            title = escape_applescript(title),
        );

        run_osascript(&script).await?;
        tracing::info!("Created reminder '{}' due {}", title, due);
        Ok(())
    }
}

/// Minimal query-component percent encoding: unreserved characters pass
/// through, everything else (including space) is %XX-escaped.
fn percent_encode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                out.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encodes_query_values() {
        assert_eq!(percent_encode("grab milk"), "grab%20milk");
        assert_eq!(percent_encode("a&b=c"), "a%26b%3Dc");
        assert_eq!(percent_encode("caf\u{e9}"), "caf%C3%A9");
        assert_eq!(percent_encode("plain-text_1.0~x"), "plain-text_1.0~x");
    }

    #[test]
    fn builds_x_callback_url() {
        let sink = UrlSchemeReminder::new("due".to_string());
        assert_eq!(
            sink.build_url("grab milk", 1800),
            "due://x-callback-url/add?title=grab%20milk&secs=1800"
        );
    }
}
