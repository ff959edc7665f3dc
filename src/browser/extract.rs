use async_trait::async_trait;
use regex::Regex;
use std::time::{Duration, Instant};
use thirtyfour::prelude::*;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::browser::selectors::{Extraction, SelectorError, SelectorSet};

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error("failed to start browser session at {url}: {source}")]
    Session {
        url: String,
        #[source]
        source: WebDriverError,
    },
}

/// Decides which URLs need the extraction stage
#[derive(Debug, Clone)]
pub struct RenderPredicate {
    pattern: Regex,
}

impl RenderPredicate {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn matches(&self, url: &str) -> bool {
        self.pattern.is_match(url)
    }
}

/// Extraction stage: pulls question/answer text for a page
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract fields for `url`. `html` is the body the fetch stage produced, if any.
    /// Never fails; problems degrade to a partial or empty extraction.
    async fn extract(&self, url: &str, html: Option<&str>) -> Extraction;

    /// Whether this extractor loads the page itself and can work without fetched HTML
    fn renders_javascript(&self) -> bool;

    /// Short label recorded in the page meta
    fn kind(&self) -> &'static str;

    /// Release the extractor's resources. Best effort.
    async fn close(&self);
}

/// Applies the selectors to HTML the fetch stage already retrieved
pub struct HtmlExtractor {
    selectors: SelectorSet,
}

impl HtmlExtractor {
    pub fn new(question_selector: &str, answer_selector: &str) -> Result<Self, ExtractorError> {
        Ok(Self {
            selectors: SelectorSet::new(question_selector, answer_selector)?,
        })
    }
}

#[async_trait]
impl Extractor for HtmlExtractor {
    async fn extract(&self, url: &str, html: Option<&str>) -> Extraction {
        let Some(html) = html else {
            return Extraction::default();
        };

        let extraction = self.selectors.extract(html);
        debug!(
            url = %url,
            have_question = extraction.question.is_some(),
            have_answer = extraction.answer.is_some(),
            "html_extracted"
        );
        extraction
    }

    fn renders_javascript(&self) -> bool {
        false
    }

    fn kind(&self) -> &'static str {
        "html"
    }

    async fn close(&self) {}
}

/// Drives one long-lived headless Chrome session over WebDriver.
///
/// The session is opened once and guarded by a mutex, so at most one page is
/// loaded at a time; concurrent callers queue on the lock without holding up
/// other pipeline work.
pub struct BrowserExtractor {
    driver: Mutex<Option<WebDriver>>,
    question_selector: String,
    answer_selector: String,
}

impl BrowserExtractor {
    /// Open the browser session
    pub async fn connect(
        webdriver_url: &str,
        page_load_timeout: Duration,
        question_selector: &str,
        answer_selector: &str,
    ) -> Result<Self, ExtractorError> {
        // Compile once so a bad selector fails at startup rather than per page
        SelectorSet::new(question_selector, answer_selector)?;

        let session_error = |source| ExtractorError::Session {
            url: webdriver_url.to_string(),
            source,
        };

        let mut caps = DesiredCapabilities::chrome();
        caps.add_chrome_arg("--headless=new").map_err(session_error)?;
        caps.add_chrome_arg("--no-sandbox").map_err(session_error)?;
        caps.add_chrome_arg("--disable-dev-shm-usage").map_err(session_error)?;

        let driver = WebDriver::new(webdriver_url, caps).await.map_err(session_error)?;

        if let Err(e) = driver.set_page_load_timeout(page_load_timeout).await {
            warn!(error = %e, "Failed to set page load timeout");
        }

        info!(webdriver_url = %webdriver_url, "Browser session started");

        Ok(Self {
            driver: Mutex::new(Some(driver)),
            question_selector: question_selector.to_string(),
            answer_selector: answer_selector.to_string(),
        })
    }

    async fn find_text(driver: &WebDriver, selector: &str) -> Option<String> {
        let element = match driver.find(By::Css(selector)).await {
            Ok(element) => element,
            Err(e) => {
                debug!(selector = %selector, error = %e, "Selector did not match");
                return None;
            }
        };

        match element.text().await {
            Ok(text) => {
                let text = text.trim();
                (!text.is_empty()).then(|| text.to_string())
            }
            Err(e) => {
                warn!(selector = %selector, error = %e, "browser_extract_issue");
                None
            }
        }
    }
}

#[async_trait]
impl Extractor for BrowserExtractor {
    async fn extract(&self, url: &str, _html: Option<&str>) -> Extraction {
        let guard = self.driver.lock().await;
        let Some(driver) = guard.as_ref() else {
            warn!(url = %url, "Browser session already closed; skipping extraction");
            return Extraction::default();
        };

        let started = Instant::now();
        let mut extraction = Extraction::default();

        match driver.goto(url).await {
            Ok(()) => {
                extraction.question = Self::find_text(driver, &self.question_selector).await;
                extraction.answer = Self::find_text(driver, &self.answer_selector).await;
            }
            Err(e) => {
                warn!(url = %url, error = %e, "browser_extract_issue");
            }
        }

        info!(
            url = %url,
            latency_ms = started.elapsed().as_millis() as u64,
            have_question = extraction.question.is_some(),
            have_answer = extraction.answer.is_some(),
            "browser_extracted"
        );

        extraction
    }

    fn renders_javascript(&self) -> bool {
        true
    }

    fn kind(&self) -> &'static str {
        "browser"
    }

    async fn close(&self) {
        if let Some(driver) = self.driver.lock().await.take() {
            if let Err(e) = driver.quit().await {
                debug!(error = %e, "Error closing browser session");
            }
            debug!("Browser session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::selectors::{DEFAULT_ANSWER_SELECTOR, DEFAULT_QUESTION_SELECTOR};

    #[test]
    fn test_render_predicate() {
        let predicate = RenderPredicate::new(r"quora\.com").unwrap();

        assert!(predicate.matches("https://www.quora.com/What-is-Python"));
        assert!(!predicate.matches("https://example.org"));
        assert!(RenderPredicate::new("(").is_err());
    }

    #[tokio::test]
    async fn test_html_extractor_uses_fetched_body() {
        let extractor =
            HtmlExtractor::new(DEFAULT_QUESTION_SELECTOR, DEFAULT_ANSWER_SELECTOR).unwrap();
        let html = r#"<div class="puppeteer_test_question_title">What is Python?</div>"#;

        let extraction = extractor.extract("https://www.quora.com/q", Some(html)).await;
        assert_eq!(extraction.question.as_deref(), Some("What is Python?"));
        assert_eq!(extraction.answer, None);

        let nothing = extractor.extract("https://www.quora.com/q", None).await;
        assert!(nothing.is_empty());
        assert!(!extractor.renders_javascript());
    }

    #[test]
    fn test_html_extractor_rejects_bad_selector() {
        assert!(matches!(
            HtmlExtractor::new("div[", DEFAULT_ANSWER_SELECTOR),
            Err(ExtractorError::Selector(_))
        ));
    }
}
