use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Selector that locates the question title on a rendered Quora page
pub const DEFAULT_QUESTION_SELECTOR: &str = "div.puppeteer_test_question_title";

/// Selector that locates the first answer paragraph
pub const DEFAULT_ANSWER_SELECTOR: &str =
    "p.q-text.qu-display--block.qu-wordBreak--break-word.qu-textAlign--start";

#[derive(Debug, Error)]
#[error("invalid CSS selector '{selector}': {reason}")]
pub struct SelectorError {
    pub selector: String,
    pub reason: String,
}

/// Question/answer text pulled out of a page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    pub question: Option<String>,
    pub answer: Option<String>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.question.is_none() && self.answer.is_none()
    }
}

/// Compiled question and answer selectors
#[derive(Debug, Clone)]
pub struct SelectorSet {
    question: Selector,
    answer: Selector,
}

impl SelectorSet {
    pub fn new(question: &str, answer: &str) -> Result<Self, SelectorError> {
        Ok(Self {
            question: parse_selector(question)?,
            answer: parse_selector(answer)?,
        })
    }

    /// Apply both selectors to raw HTML.
    ///
    /// The question keeps its text nodes joined as-is; the answer keeps each
    /// non-blank text node on its own line. A selector without a match, or a
    /// match with no text, yields `None`.
    pub fn extract(&self, html: &str) -> Extraction {
        let document = Html::parse_document(html);

        let question = document
            .select(&self.question)
            .next()
            .and_then(|el| joined_text(el, ""));

        let answer = document
            .select(&self.answer)
            .next()
            .and_then(|el| joined_text(el, "\n"));

        Extraction { question, answer }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, SelectorError> {
    Selector::parse(selector).map_err(|e| SelectorError {
        selector: selector.to_string(),
        reason: format!("{:?}", e),
    })
}

fn joined_text(element: ElementRef<'_>, separator: &str) -> Option<String> {
    let text = element
        .text()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(separator);

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_HTML: &str = r#"
    <html><head><title>Example</title></head>
    <body>
      <div class="puppeteer_test_question_title">What is Python?</div>
      <p class="q-text qu-display--block qu-wordBreak--break-word qu-textAlign--start">Python is a programming language.</p>
    </body>
    </html>
    "#;

    fn defaults() -> SelectorSet {
        SelectorSet::new(DEFAULT_QUESTION_SELECTOR, DEFAULT_ANSWER_SELECTOR).unwrap()
    }

    #[test]
    fn test_extracts_question_and_answer() {
        let selectors = defaults();
        let extraction = selectors.extract(SAMPLE_HTML);

        assert_eq!(extraction.question.as_deref(), Some("What is Python?"));
        assert_eq!(extraction.answer.as_deref(), Some("Python is a programming language."));
    }

    #[test]
    fn test_fragment_without_document_wrapper() {
        let html = concat!(
            r#"<div class="puppeteer_test_question_title">What is Python?</div>"#,
            r#"<p class="q-text qu-display--block qu-wordBreak--break-word qu-textAlign--start">"#,
            "Python is a programming language.</p>",
        );
        let extraction = defaults().extract(html);

        assert_eq!(extraction.question.as_deref(), Some("What is Python?"));
        assert_eq!(extraction.answer.as_deref(), Some("Python is a programming language."));
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let selectors = defaults();
        assert_eq!(selectors.extract(SAMPLE_HTML), selectors.extract(SAMPLE_HTML));
    }

    #[test]
    fn test_missing_nodes_yield_none() {
        let extraction = defaults().extract("<html><body><p>nothing here</p></body></html>");
        assert!(extraction.is_empty());

        let blank = defaults().extract(r#"<div class="puppeteer_test_question_title">   </div>"#);
        assert_eq!(blank.question, None);
    }

    #[test]
    fn test_answer_keeps_text_nodes_on_separate_lines() {
        let html = r#"<p class="q-text qu-display--block qu-wordBreak--break-word qu-textAlign--start">
            First line. <b>Bold part</b>
        </p>"#;
        let extraction = defaults().extract(html);

        assert_eq!(extraction.answer.as_deref(), Some("First line.\nBold part"));
    }

    #[test]
    fn test_custom_selectors() {
        let selectors = SelectorSet::new("h1.title", "div.body").unwrap();
        let extraction =
            selectors.extract(r#"<h1 class="title"> Hello </h1><div class="body">World</div>"#);

        assert_eq!(extraction.question.as_deref(), Some("Hello"));
        assert_eq!(extraction.answer.as_deref(), Some("World"));
    }

    #[test]
    fn test_invalid_selector_is_rejected() {
        let err = SelectorSet::new("div[", "p").unwrap_err();
        assert_eq!(err.selector, "div[");
    }
}
