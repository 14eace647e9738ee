//! Push notification sink: POST a plain-text report to a topic endpoint
//! (ntfy-style).

use async_trait::async_trait;

use super::PushSink;
use crate::errors::SinkError;
use crate::http_client::build_http_client;

pub struct NtfyPush {
    server: String,
    topic: String,
    client: reqwest::Client,
}

impl NtfyPush {
    pub fn new(server: String, topic: String) -> Self {
        Self {
            server,
            topic,
            client: build_http_client(Some(std::time::Duration::from_secs(30))),
        }
    }

    fn topic_url(&self) -> String {
        format!("{}/{}", self.server.trim_end_matches('/'), self.topic)
    }
}

#[async_trait]
impl PushSink for NtfyPush {
    async fn send(&self, report: &str) -> Result<(), SinkError> {
        let response = self
            .client
            .post(self.topic_url())
            .header("Title", "chatwatch")
            .body(report.to_string())
            .send()
            .await
            .map_err(|e| SinkError::WriteFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SinkError::WriteFailed(format!(
                "push endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
