//! Embedding-similarity relevance strategy.

use std::time::Duration;

use async_trait::async_trait;
use papermonitor_shared::{
    Assessment, EffectiveConfig, EmbeddingSettings, Paper, PaperMonitorError, Result,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::{RelevanceEngine, USER_AGENT, all_unknown};

const NAME: &str = "embedding";
const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Cosine similarity of two vectors; 0 for mismatched lengths or zero norms.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `/v1/embeddings` endpoint.
#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl EmbeddingClient {
    pub fn from_settings(settings: &EmbeddingSettings) -> Result<Self> {
        let base_url = settings.base_url.trim_end_matches('/');
        let api_key = settings.api_key.clone().filter(|k| !k.trim().is_empty());
        if api_key.is_none() && base_url == OPENAI_BASE_URL {
            return Err(PaperMonitorError::config(
                "missing API key for embeddings (set EMBEDDING_API_KEY or `api_key` in embedding.yaml)",
            ));
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| PaperMonitorError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{base_url}/v1/embeddings"),
            api_key,
            model: settings.model.clone(),
        })
    }

    /// One embedding per input text, in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut request = self.client.post(&self.endpoint).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PaperMonitorError::Assessment(format!("embedding request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PaperMonitorError::Assessment(format!(
                "embedding request failed: HTTP {status}"
            )));
        }

        let mut parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            PaperMonitorError::Assessment(format!("invalid embedding response: {e}"))
        })?;

        if parsed.data.len() != texts.len() {
            return Err(PaperMonitorError::Assessment(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        parsed.data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

struct EmbeddingState {
    client: EmbeddingClient,
    targets: Vec<String>,
    threshold: f64,
    batch_size: usize,
}

/// Marks a paper relevant when its abstract embeds close to any target text.
pub struct EmbeddingStrategy {
    span: Span,
    state: Option<EmbeddingState>,
}

impl EmbeddingStrategy {
    pub fn new(run_span: Span) -> Self {
        Self {
            span: info_span!(parent: &run_span, "relevance", method = NAME),
            state: None,
        }
    }

    async fn assess_inner(&self, papers: &[Paper]) -> Vec<Assessment> {
        let Some(state) = &self.state else {
            return all_unknown(papers, "embedding strategy used before configure");
        };
        if papers.is_empty() {
            return Vec::new();
        }

        let mut target_vectors = Vec::with_capacity(state.targets.len());
        for chunk in state.targets.chunks(state.batch_size) {
            match state.client.embed(chunk).await {
                Ok(vectors) => target_vectors.extend(vectors),
                Err(e) => {
                    warn!(error = %e, "failed to embed target texts");
                    return all_unknown(papers, &format!("target embedding failed: {e}"));
                }
            }
        }

        let mut assessments = Vec::with_capacity(papers.len());
        for (index, batch) in papers.chunks(state.batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(paper_text).collect();
            match state.client.embed(&texts).await {
                Ok(vectors) => {
                    debug!(batch = index, size = batch.len(), "embedded batch");
                    assessments.extend(
                        batch
                            .iter()
                            .zip(&vectors)
                            .map(|(paper, v)| score(state, &target_vectors, paper, v)),
                    );
                }
                Err(e) => {
                    warn!(batch = index, error = %e, "embedding batch failed");
                    assessments.extend(all_unknown(batch, &e.to_string()));
                }
            }
        }

        let relevant = assessments.iter().filter(|a| a.relevant).count();
        info!(papers = papers.len(), relevant, "embedding assessment complete");
        assessments
    }
}

fn paper_text(paper: &Paper) -> String {
    if paper.abstract_text.trim().is_empty() {
        paper.title.clone()
    } else {
        paper.abstract_text.clone()
    }
}

/// Index and similarity of the closest target, ignoring non-finite scores.
fn best_match(targets: &[Vec<f32>], v: &[f32]) -> Option<(usize, f64)> {
    targets
        .iter()
        .enumerate()
        .map(|(i, t)| (i, f64::from(cosine_similarity(v, t))))
        .filter(|(_, sim)| sim.is_finite())
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

fn score(state: &EmbeddingState, targets: &[Vec<f32>], paper: &Paper, v: &[f32]) -> Assessment {
    let Some((best_idx, best)) = best_match(targets, v) else {
        return Assessment {
            paper_id: paper.id.clone(),
            relevant: false,
            confidence: Some(0.0),
            explanation: Some("no comparable similarity to any target".into()),
            matched_keywords: None,
            error: None,
        };
    };

    let target = state.targets.get(best_idx).map(String::as_str).unwrap_or("?");
    Assessment {
        paper_id: paper.id.clone(),
        relevant: best >= state.threshold,
        confidence: Some(best.clamp(0.0, 1.0)),
        explanation: Some(format!("closest to \"{target}\" (similarity {best:.3})")),
        matched_keywords: None,
        error: None,
    }
}

#[async_trait]
impl RelevanceEngine for EmbeddingStrategy {
    fn name(&self) -> &str {
        NAME
    }

    fn configure(&mut self, config: &EffectiveConfig) -> Result<()> {
        let settings = config.embedding()?;

        let targets: Vec<String> = settings
            .target_texts
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if targets.is_empty() {
            return Err(PaperMonitorError::config(
                "`relevance.embedding.target_texts` must contain at least one text",
            ));
        }
        if settings.batch_size == 0 {
            return Err(PaperMonitorError::config(
                "`relevance.embedding.batch_size` must be at least 1",
            ));
        }

        self.state = Some(EmbeddingState {
            client: EmbeddingClient::from_settings(&settings)?,
            targets,
            threshold: settings.similarity_threshold,
            batch_size: settings.batch_size,
        });
        Ok(())
    }

    async fn assess(&self, papers: &[Paper]) -> Vec<Assessment> {
        self.assess_inner(papers).instrument(self.span.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::paper;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn strategy(server: &MockServer, extra: &str) -> EmbeddingStrategy {
        let config = EffectiveConfig::from_yaml(&format!(
            "relevance:\n  method: embedding\n  embedding:\n    base_url: \"{}\"\n    target_texts: [protein design]\n    similarity_threshold: 0.8\n{extra}",
            server.uri()
        ))
        .unwrap();
        let mut strategy = EmbeddingStrategy::new(Span::none());
        strategy.configure(&config).unwrap();
        strategy
    }

    #[test]
    fn cosine_similarity_edge_cases() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn default_openai_endpoint_requires_key() {
        let config = EffectiveConfig::from_yaml("relevance: {method: embedding}").unwrap();
        let mut strategy = EmbeddingStrategy::new(Span::none());
        assert!(strategy.configure(&config).unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn scores_against_targets() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(body_partial_json(json!({"input": ["protein design"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"index": 0, "embedding": [1.0, 0.0]}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(body_partial_json(json!({"input": ["Designing binders", "Galaxy surveys"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [0.9, 0.1]}
                ]
            })))
            .mount(&server)
            .await;

        let strategy = strategy(&server, "");
        let papers = vec![
            paper("a", "A", "Designing binders"),
            paper("b", "B", "Galaxy surveys"),
        ];
        let out = strategy.assess(&papers).await;

        assert_eq!(out.len(), 2);
        assert!(out[0].relevant);
        assert!(out[0].confidence.unwrap() > 0.9);
        assert!(out[0].explanation.as_deref().unwrap().contains("protein design"));
        assert!(!out[1].relevant);
    }

    #[tokio::test]
    async fn target_failure_degrades_everything() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let strategy = strategy(&server, "");
        let out = strategy
            .assess(&[paper("a", "A", "x"), paper("b", "B", "y")])
            .await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|a| a.is_degraded() && a.confidence == Some(0.0)));
    }

    #[tokio::test]
    async fn failed_batch_only_degrades_its_papers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"input": ["protein design"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"index": 0, "embedding": [1.0, 0.0]}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"input": ["first"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"index": 0, "embedding": [1.0, 0.0]}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"input": ["second"]})))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let strategy = strategy(&server, "    batch_size: 1\n");
        let out = strategy
            .assess(&[paper("a", "A", "first"), paper("b", "B", "second")])
            .await;
        assert!(out[0].relevant);
        assert!(out[1].is_degraded());
    }

    #[tokio::test]
    async fn target_texts_are_embedded_in_batches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"input": ["protein design", "enzyme engineering"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"index": 0, "embedding": [0.0, 1.0]},
                    {"index": 1, "embedding": [0.0, -1.0]}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"input": ["antibody maturation"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"index": 0, "embedding": [1.0, 0.0]}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"input": ["Affinity maturation"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"index": 0, "embedding": [1.0, 0.05]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = EffectiveConfig::from_yaml(&format!(
            "relevance:\n  method: embedding\n  embedding:\n    base_url: \"{}\"\n    target_texts: [protein design, enzyme engineering, antibody maturation]\n    similarity_threshold: 0.8\n    batch_size: 2\n",
            server.uri()
        ))
        .unwrap();
        let mut strategy = EmbeddingStrategy::new(Span::none());
        strategy.configure(&config).unwrap();

        let out = strategy.assess(&[paper("a", "A", "Affinity maturation")]).await;
        assert!(out[0].relevant);
        assert!(
            out[0]
                .explanation
                .as_deref()
                .unwrap()
                .contains("antibody maturation")
        );
    }

    #[test]
    fn non_finite_similarities_are_ignored() {
        let targets = vec![vec![f32::NAN, 0.0], vec![0.6, 0.8]];
        assert_eq!(best_match(&targets, &[0.6, 0.8]).map(|(i, _)| i), Some(1));

        let all_nan = vec![vec![f32::NAN, 1.0], vec![1.0, f32::NAN]];
        assert_eq!(best_match(&all_nan, &[1.0, 0.0]), None);
    }

    #[test]
    fn empty_abstract_falls_back_to_title() {
        assert_eq!(paper_text(&paper("a", "Only a title", " ")), "Only a title");
    }
}
