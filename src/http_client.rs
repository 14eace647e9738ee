use std::time::Duration;

/// Build the shared reqwest client.
///
/// Proxy discovery is opt-in: a misconfigured system proxy must not take the
/// local Ollama endpoint offline, so the default client skips it entirely.
pub fn build_http_client(timeout: Option<Duration>) -> reqwest::Client {
    let allow_system_proxy = std::env::var("CHATWATCH_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    match attempt_build(timeout, !allow_system_proxy) {
        Ok(client) => client,
        Err(error) => {
            if allow_system_proxy {
                tracing::warn!(
                    "HTTP client init with system proxy discovery failed ({}); retrying with no_proxy",
                    error
                );
                if let Ok(client) = attempt_build(timeout, true) {
                    return client;
                }
            }
            panic!("Failed to initialize HTTP client: {}", error);
        }
    }
}

fn attempt_build(
    timeout: Option<Duration>,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
