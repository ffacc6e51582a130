//! LLM relevance strategy.
//!
//! Papers are sent to an OpenAI-compatible chat endpoint in batches. Each batch
//! is a single request whose reply must carry one `{is_relevant, confidence,
//! explanation}` object per paper, in input order. Transport failures are
//! retried with exponential backoff; anything still failing degrades only the
//! affected batch or item to an unknown assessment.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use papermonitor_shared::{Assessment, EffectiveConfig, Paper, PaperMonitorError, Result};
use regex::Regex;
use serde_json::Value;
use tracing::{Instrument, Span, debug, info, info_span, instrument, warn};

use crate::chat::{ChatClient, ChatError};
use crate::{RelevanceEngine, all_unknown, pause};

const NAME: &str = "llm";

/// Reply tokens budgeted per paper in a batch.
const TOKENS_PER_PAPER: u32 = 150;

/// Upper bound on a single backoff wait.
const MAX_BACKOFF_SECS: f64 = 300.0;

const SYSTEM_PROMPT: &str = "You are an expert research assistant screening new academic papers. \
For every numbered paper in the user message, decide whether it is relevant to the stated research interest. \
Respond with a JSON object of the form {\"results\": [{\"is_relevant\": true, \"confidence\": 0.85, \"explanation\": \"...\"}]} \
containing exactly one result per paper, in the same order as the papers. \
`confidence` is a number between 0 and 1; `explanation` is one short sentence.";

static CODE_FENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*(.*?)\s*```\s*$").ok());

struct LlmState {
    chat: ChatClient,
    prompt: String,
    threshold: f64,
    batch_size: usize,
    batch_delay_secs: f64,
    max_retries: u32,
    retry_backoff_secs: f64,
}

/// Classifies papers with a chat model.
pub struct LlmStrategy {
    span: Span,
    state: Option<LlmState>,
}

impl LlmStrategy {
    pub fn new(run_span: Span) -> Self {
        Self {
            span: info_span!(parent: &run_span, "relevance", method = NAME),
            state: None,
        }
    }

    async fn assess_inner(&self, papers: &[Paper]) -> Vec<Assessment> {
        let Some(state) = &self.state else {
            return all_unknown(papers, "llm strategy used before configure");
        };

        let batches = papers.len().div_ceil(state.batch_size);
        info!(
            papers = papers.len(),
            batches,
            model = state.chat.model(),
            "assessing with LLM"
        );

        let mut assessments = Vec::with_capacity(papers.len());
        for (index, batch) in papers.chunks(state.batch_size).enumerate() {
            if index > 0 {
                pause(state.batch_delay_secs).await;
            }
            assessments.extend(assess_batch(state, index, batch).await);
        }

        let relevant = assessments.iter().filter(|a| a.relevant).count();
        let degraded = assessments.iter().filter(|a| a.is_degraded()).count();
        info!(relevant, degraded, "LLM assessment complete");
        assessments
    }
}

#[async_trait]
impl RelevanceEngine for LlmStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn configure(&mut self, config: &EffectiveConfig) -> Result<()> {
        let settings = config.llm()?;

        if settings.batch_size == 0 {
            return Err(PaperMonitorError::config(format!(
                "`relevance.llm.{}.batch_size` must be at least 1",
                settings.provider
            )));
        }
        if !(0.0..=1.0).contains(&settings.confidence_threshold) {
            return Err(PaperMonitorError::config(format!(
                "`relevance.llm.{}.confidence_threshold` must be within [0, 1]",
                settings.provider
            )));
        }
        if settings.prompt.trim().is_empty() {
            return Err(PaperMonitorError::config(format!(
                "`relevance.llm.{}.prompt` must not be empty",
                settings.provider
            )));
        }

        let chat = ChatClient::from_settings(&settings)?;
        debug!(provider = %settings.provider, model = chat.model(), "configured LLM strategy");

        self.state = Some(LlmState {
            chat,
            prompt: settings.prompt,
            threshold: settings.confidence_threshold,
            batch_size: settings.batch_size,
            batch_delay_secs: settings.batch_delay_seconds.max(0.0),
            max_retries: settings.max_retries,
            retry_backoff_secs: settings.retry_backoff_seconds.max(0.0),
        });
        Ok(())
    }

    async fn assess(&self, papers: &[Paper]) -> Vec<Assessment> {
        self.assess_inner(papers).instrument(self.span.clone()).await
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(batch = index, size = batch.len()))]
async fn assess_batch(state: &LlmState, index: usize, batch: &[Paper]) -> Vec<Assessment> {
    let user = user_message(&state.prompt, batch);
    let max_tokens = TOKENS_PER_PAPER.saturating_mul(batch.len() as u32);

    let content = match complete_with_retry(state, &user, max_tokens).await {
        Ok(content) => content,
        Err(e) => {
            warn!(error = %e, "LLM batch failed after retries");
            return all_unknown(batch, &format!("LLM request failed: {e}"));
        }
    };

    let items = match parse_reply(&content, batch.len()) {
        Ok(items) => items,
        Err(e) => {
            warn!(error = %e, "unparsable LLM reply");
            return all_unknown(batch, &e.to_string());
        }
    };

    if items.len() != batch.len() {
        warn!(
            expected = batch.len(),
            received = items.len(),
            "LLM reply size mismatch"
        );
    }

    batch
        .iter()
        .enumerate()
        .map(|(i, paper)| match items.get(i) {
            None => Assessment::unknown(paper, "missing from LLM reply"),
            Some(item) => match parse_item(item) {
                Some(verdict) => verdict.into_assessment(paper, state.threshold),
                None => Assessment::unknown(paper, "malformed item in LLM reply"),
            },
        })
        .collect()
}

async fn complete_with_retry(
    state: &LlmState,
    user: &str,
    max_tokens: u32,
) -> std::result::Result<String, ChatError> {
    let mut attempt = 0u32;
    loop {
        match state.chat.complete(SYSTEM_PROMPT, user, max_tokens).await {
            Ok(content) => return Ok(content),
            Err(e) if attempt < state.max_retries => {
                let mut wait = Duration::from_secs_f64(
                    (state.retry_backoff_secs * 2f64.powi(attempt as i32)).min(MAX_BACKOFF_SECS),
                );
                if let Some(requested) = e.retry_after() {
                    wait = wait.max(requested);
                }
                attempt += 1;
                warn!(
                    attempt,
                    max_retries = state.max_retries,
                    wait_ms = wait.as_millis() as u64,
                    rate_limited = e.is_rate_limited(),
                    error = %e,
                    "LLM request failed, retrying"
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn user_message(prompt: &str, batch: &[Paper]) -> String {
    let mut message = format!("Research interest: {}\n\n---\n", prompt.trim());
    for (i, paper) in batch.iter().enumerate() {
        message.push_str(&format!(
            "Paper {}:\nTitle: {}\nAbstract: {}\n\n---\n",
            i + 1,
            paper.title,
            paper.abstract_text
        ));
    }
    message
}

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

/// Extract the per-paper items from a model reply.
///
/// Accepts a bare JSON array, an object wrapping the array under `results`,
/// `abstracts` or `papers`, or a single result object when `expected == 1`.
/// Markdown code fences around the JSON are ignored.
pub fn parse_reply(content: &str, expected: usize) -> Result<Vec<Value>> {
    let text = strip_code_fence(content);
    let value: Value = serde_json::from_str(text)
        .or_else(|first_err| {
            // Some models wrap the array in prose; retry on the outermost brackets.
            match (text.find('['), text.rfind(']')) {
                (Some(start), Some(end)) if start < end => {
                    serde_json::from_str(&text[start..=end]).map_err(|_| first_err)
                }
                _ => Err(first_err),
            }
        })
        .map_err(|e| PaperMonitorError::parse(format!("reply is not valid JSON ({e})")))?;

    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for key in ["results", "abstracts", "papers"] {
                if let Some(Value::Array(items)) = map.remove(key) {
                    return Ok(items);
                }
            }
            if expected == 1 && map.contains_key("is_relevant") {
                return Ok(vec![Value::Object(map)]);
            }
            Err(PaperMonitorError::parse("reply object has no results array"))
        }
        other => Err(PaperMonitorError::parse(format!(
            "expected a JSON array in reply, got {}",
            type_name(&other)
        ))),
    }
}

fn strip_code_fence(content: &str) -> &str {
    CODE_FENCE
        .as_ref()
        .and_then(|re| re.captures(content))
        .and_then(|caps| caps.get(1))
        .map_or_else(|| content.trim(), |m| m.as_str())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

struct ItemVerdict {
    is_relevant: bool,
    confidence: f64,
    explanation: Option<String>,
}

impl ItemVerdict {
    fn into_assessment(self, paper: &Paper, threshold: f64) -> Assessment {
        Assessment {
            paper_id: paper.id.clone(),
            relevant: self.is_relevant && self.confidence >= threshold,
            confidence: Some(self.confidence),
            explanation: self.explanation,
            matched_keywords: None,
            error: None,
        }
    }
}

/// `None` when the item lacks a usable `is_relevant` flag or has a
/// non-numeric confidence. A missing confidence counts as 0.
fn parse_item(item: &Value) -> Option<ItemVerdict> {
    let obj = item.as_object()?;

    let is_relevant = match obj.get("is_relevant")? {
        Value::Bool(b) => *b,
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => true,
            "false" | "no" => false,
            _ => return None,
        },
        _ => return None,
    };

    let confidence = match obj.get("confidence") {
        None | Some(Value::Null) => 0.0,
        Some(Value::Number(n)) => n.as_f64()?,
        Some(Value::String(s)) => s.trim().parse::<f64>().ok()?,
        Some(_) => return None,
    };
    if !confidence.is_finite() {
        return None;
    }

    let explanation = obj
        .get("explanation")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);

    Some(ItemVerdict {
        is_relevant,
        confidence: confidence.clamp(0.0, 1.0),
        explanation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::paper;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, extra: &str) -> EffectiveConfig {
        EffectiveConfig::from_yaml(&format!(
            r#"
relevance:
  method: llm
  llm:
    provider: groq
    groq:
      api_key: test-key
      base_url: "{}"
      prompt: "Generative models for protein design"
      batch_delay_seconds: 0
      retry_backoff_seconds: 0
{extra}"#,
            server.uri()
        ))
        .unwrap()
    }

    fn strategy(config: &EffectiveConfig) -> LlmStrategy {
        let mut strategy = LlmStrategy::new(Span::none());
        strategy.configure(config).unwrap();
        strategy
    }

    fn completion(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
        }))
    }

    fn papers(n: usize) -> Vec<Paper> {
        (1..=n)
            .map(|i| paper(&format!("2405.0000{i}v1"), &format!("Paper {i}"), "An abstract."))
            .collect()
    }

    // -----------------------------------------------------------------------
    // parse_reply / parse_item
    // -----------------------------------------------------------------------

    #[test]
    fn parses_bare_array_and_wrapped_objects() {
        let items = parse_reply(r#"[{"is_relevant": true, "confidence": 0.9}]"#, 1).unwrap();
        assert_eq!(items.len(), 1);

        for key in ["results", "abstracts", "papers"] {
            let reply = format!(r#"{{"{key}": [{{"is_relevant": false}}, {{"is_relevant": true}}]}}"#);
            assert_eq!(parse_reply(&reply, 2).unwrap().len(), 2);
        }
    }

    #[test]
    fn single_object_only_for_single_paper_batch() {
        let reply = r#"{"is_relevant": true, "confidence": 0.8}"#;
        assert_eq!(parse_reply(reply, 1).unwrap().len(), 1);
        assert!(parse_reply(reply, 2).is_err());
    }

    #[test]
    fn strips_code_fences_and_prose() {
        let fenced = "```json\n[{\"is_relevant\": true, \"confidence\": 1}]\n```";
        assert_eq!(parse_reply(fenced, 1).unwrap().len(), 1);

        let prose = "Here you go: [{\"is_relevant\": false}] hope this helps";
        assert_eq!(parse_reply(prose, 1).unwrap().len(), 1);
    }

    #[test]
    fn rejects_non_json_and_scalars() {
        assert!(parse_reply("I cannot help with that.", 3).is_err());
        assert!(parse_reply("42", 1).is_err());
        assert!(parse_reply(r#"{"verdicts": []}"#, 2).is_err());
    }

    #[test]
    fn unparsable_reply_is_parse_error() {
        let err = parse_reply("no json here", 2).unwrap_err();
        assert!(matches!(err, PaperMonitorError::Parse { .. }));
        assert!(!err.is_fatal());
        assert!(err.to_string().starts_with("parse error: reply is not valid JSON"));
    }

    #[test]
    fn item_parsing_is_lenient_on_types() {
        let v = parse_item(&json!({"is_relevant": "yes", "confidence": "0.75"})).unwrap();
        assert!(v.is_relevant);
        assert_eq!(v.confidence, 0.75);

        let v = parse_item(&json!({"is_relevant": true, "confidence": 3.5})).unwrap();
        assert_eq!(v.confidence, 1.0);

        let v = parse_item(&json!({"is_relevant": true})).unwrap();
        assert_eq!(v.confidence, 0.0);

        assert!(parse_item(&json!({"confidence": 0.9})).is_none());
        assert!(parse_item(&json!({"is_relevant": true, "confidence": [1]})).is_none());
        assert!(parse_item(&json!("relevant")).is_none());
    }

    #[test]
    fn user_message_numbers_papers() {
        let msg = user_message("protein design", &papers(2));
        assert!(msg.starts_with("Research interest: protein design"));
        assert!(msg.contains("Paper 1:\nTitle: Paper 1"));
        assert!(msg.contains("Paper 2:\nTitle: Paper 2"));
    }

    // -----------------------------------------------------------------------
    // configure
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn invalid_settings_are_config_errors() {
        let server = MockServer::start().await;
        for extra in [
            "      batch_size: 0\n",
            "      confidence_threshold: 1.5\n",
            "      temperature: hot\n",
        ] {
            let mut strategy = LlmStrategy::new(Span::none());
            let err = strategy.configure(&config(&server, extra)).unwrap_err();
            assert!(err.is_fatal(), "expected config error for {extra:?}");
        }
    }

    // -----------------------------------------------------------------------
    // assess
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn batches_preserve_order_and_apply_threshold() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(completion(
                r#"{"results": [
                    {"is_relevant": true, "confidence": 0.9, "explanation": "on topic"},
                    {"is_relevant": true, "confidence": 0.5, "explanation": "tangential"}
                ]}"#,
            ))
            .expect(2)
            .mount(&server)
            .await;

        let strategy = strategy(&config(&server, "      batch_size: 2\n"));
        let papers = papers(4);
        let out = strategy.assess(&papers).await;

        assert_eq!(out.len(), 4);
        for (a, p) in out.iter().zip(&papers) {
            assert_eq!(a.paper_id, p.id);
        }
        assert!(out[0].relevant);
        assert!(!out[1].relevant, "0.5 is below the default 0.7 threshold");
        assert_eq!(out[1].confidence, Some(0.5));
        assert_eq!(out[0].explanation.as_deref(), Some("on topic"));
    }

    #[tokio::test]
    async fn never_relevant_below_threshold() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(completion(
                r#"[{"is_relevant": true, "confidence": 0.0},
                    {"is_relevant": true, "confidence": 0.2},
                    {"is_relevant": true, "confidence": 0.5},
                    {"is_relevant": true, "confidence": 0.69},
                    {"is_relevant": true, "confidence": 0.7},
                    {"is_relevant": true, "confidence": 0.95},
                    {"is_relevant": false, "confidence": 1.0}]"#,
            ))
            .mount(&server)
            .await;

        for threshold in [0.0, 0.3, 0.5, 0.7, 0.9, 1.0] {
            let extra = format!("      confidence_threshold: {threshold}\n");
            let strategy = strategy(&config(&server, &extra));
            let out = strategy.assess(&papers(7)).await;

            assert_eq!(out.len(), 7);
            for a in &out {
                if a.relevant {
                    assert!(a.confidence.unwrap() >= threshold);
                }
            }
            assert!(!out[6].relevant);
        }
    }

    #[tokio::test]
    async fn exhausted_retries_degrade_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
            .expect(3)
            .mount(&server)
            .await;

        let strategy = strategy(&config(&server, "      max_retries: 2\n"));
        let papers = papers(3);
        let out = strategy.assess(&papers).await;

        assert_eq!(out.len(), 3);
        for (a, p) in out.iter().zip(&papers) {
            assert_eq!(a.paper_id, p.id);
            assert!(!a.relevant);
            assert_eq!(a.confidence, Some(0.0));
            assert!(a.error.as_deref().unwrap().contains("500"));
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(completion(r#"[{"is_relevant": true, "confidence": 0.8}]"#))
            .mount(&server)
            .await;

        let strategy = strategy(&config(&server, ""));
        let out = strategy.assess(&papers(1)).await;
        assert!(out[0].relevant);
        assert!(!out[0].is_degraded());
    }

    #[tokio::test]
    async fn failed_batch_does_not_affect_others() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(completion(r#"[{"is_relevant": true, "confidence": 0.9}]"#))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let strategy = strategy(&config(
            &server,
            "      batch_size: 1\n      max_retries: 0\n",
        ));
        let out = strategy.assess(&papers(2)).await;
        assert!(out[0].relevant);
        assert!(out[1].is_degraded());
    }

    #[tokio::test]
    async fn malformed_and_missing_items_become_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(completion(
                r#"[{"is_relevant": true, "confidence": 0.9}, {"confidence": "high"}]"#,
            ))
            .mount(&server)
            .await;

        let strategy = strategy(&config(&server, ""));
        let out = strategy.assess(&papers(3)).await;

        assert_eq!(out.len(), 3);
        assert!(out[0].relevant);
        assert!(out[1].error.as_deref().unwrap().contains("malformed"));
        assert!(out[2].error.as_deref().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn extra_items_are_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(completion(
                r#"[{"is_relevant": false, "confidence": 0.9}, {"is_relevant": true, "confidence": 0.9}]"#,
            ))
            .mount(&server)
            .await;

        let strategy = strategy(&config(&server, ""));
        let out = strategy.assess(&papers(1)).await;
        assert_eq!(out.len(), 1);
        assert!(!out[0].relevant);
    }

    #[tokio::test]
    async fn unparsable_reply_degrades_batch_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(completion("Sorry, I can't classify these papers."))
            .expect(1)
            .mount(&server)
            .await;

        let strategy = strategy(&config(&server, ""));
        let out = strategy.assess(&papers(2)).await;
        assert!(out.iter().all(|a| a.is_degraded() && !a.relevant));
    }

    #[tokio::test]
    async fn empty_input_makes_no_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(completion("[]"))
            .expect(0)
            .mount(&server)
            .await;

        let strategy = strategy(&config(&server, ""));
        assert!(strategy.assess(&[]).await.is_empty());
    }
}
