use async_trait::async_trait;
use reqwest::{redirect, Client};
use std::error::Error as StdError;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::pipeline::task::{FetchTask, PageRecord};

/// Redirects followed before a fetch is reported as failed
pub const MAX_REDIRECTS: usize = 10;

/// Fetch stage: turns a task into a page record
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Retrieve the page. Never fails outward: transport problems become a
    /// record with `error` set.
    async fn fetch(&self, task: &FetchTask) -> PageRecord;

    /// Release the client. Callers drain in-flight fetches first.
    async fn close(&self);
}

/// reqwest-backed fetcher sharing one pooled client across all tasks.
///
/// Every request carries the configured `User-Agent` and is bounded by the
/// configured timeout (connect through end of body). Redirects are followed up
/// to [`MAX_REDIRECTS`] hops.
pub struct HttpFetcher {
    client: Mutex<Option<Client>>,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;

        Ok(Self {
            client: Mutex::new(Some(client)),
            timeout,
        })
    }

    fn client(&self) -> Option<Client> {
        self.client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn describe_error(&self, e: &reqwest::Error) -> String {
        let mut message = if e.is_timeout() {
            format!("request timed out after {:.1}s: {}", self.timeout.as_secs_f64(), e)
        } else {
            e.to_string()
        };

        let mut source = e.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }

        message
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, task: &FetchTask) -> PageRecord {
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_secs_f64() * 1000.0;

        let Some(client) = self.client() else {
            return PageRecord::failed(task, "http client is closed", elapsed_ms());
        };

        let response = match client.get(task.url()).send().await {
            Ok(response) => response,
            Err(e) => {
                let message = self.describe_error(&e);
                error!(url = %task.url(), error = %message, "fetch_failed");
                return PageRecord::failed(task, message, elapsed_ms());
            }
        };

        let status = response.status().as_u16();

        match response.bytes().await {
            Ok(body) => {
                let latency_ms = elapsed_ms();
                debug!(
                    url = %task.url(),
                    status_code = status,
                    bytes = body.len(),
                    latency_ms,
                    "Fetched page"
                );
                PageRecord::fetched(task, status, &body, latency_ms)
            }
            Err(e) => {
                let message = format!(
                    "failed to read body (status {}): {}",
                    status,
                    self.describe_error(&e)
                );
                error!(url = %task.url(), error = %message, "fetch_failed");
                PageRecord::failed(task, message, elapsed_ms())
            }
        }
    }

    async fn close(&self) {
        let client = self
            .client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if client.is_some() {
            debug!("HTTP client released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn task(url: String) -> FetchTask {
        FetchTask::new(url, None, None).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_success_populates_response_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .and(header("user-agent", "quorabroker-test/1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>hello</html>"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5), "quorabroker-test/1.0").unwrap();
        let record = fetcher.fetch(&task(format!("{}/page", server.uri()))).await;

        assert_eq!(record.status_code, Some(200));
        assert_eq!(record.error, None);
        assert_eq!(record.html.as_deref(), Some("<html>hello</html>"));
        assert_eq!(record.content_length, 18);
        assert!(record.latency_ms >= 0.0);
        assert!(record.is_consistent());
    }

    #[tokio::test]
    async fn test_error_status_is_still_a_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5), "test").unwrap();
        let record = fetcher.fetch(&task(format!("{}/gone", server.uri()))).await;

        assert_eq!(record.status_code, Some(404));
        assert!(record.error.is_none());
        assert!(record.is_consistent());
    }

    #[tokio::test]
    async fn test_unreachable_target_becomes_failed_record() {
        let fetcher = HttpFetcher::new(Duration::from_secs(5), "test").unwrap();
        let record = fetcher.fetch(&task("http://127.0.0.1:1/".to_string())).await;

        assert_eq!(record.status_code, None);
        assert!(record.error.as_deref().is_some_and(|e| !e.is_empty()));
        assert_eq!(record.html, None);
        assert!(record.latency_ms >= 0.0);
        assert!(record.is_consistent());
    }

    #[tokio::test]
    async fn test_timeout_is_a_normal_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(Duration::from_millis(200), "test").unwrap();
        let record = fetcher.fetch(&task(server.uri())).await;

        assert_eq!(record.status_code, None);
        assert!(record.error.as_deref().is_some_and(|e| e.contains("timed out")));
        assert!(record.latency_ms >= 150.0);
    }

    #[tokio::test]
    async fn test_fetch_after_close_fails_cleanly() {
        let fetcher = HttpFetcher::new(Duration::from_secs(1), "test").unwrap();
        fetcher.close().await;
        fetcher.close().await;

        let record = fetcher.fetch(&task("https://example.org".to_string())).await;
        assert_eq!(record.error.as_deref(), Some("http client is closed"));
    }
}
