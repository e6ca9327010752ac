use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::cli::config::ClassifierSettings;
use crate::crawler::task::Classification;

/// Content snippet length sent to the model; the opening of a page usually
/// carries the essence and keeps token cost bounded.
const SNIPPET_LIMIT: usize = 2000;

/// Model responses can be slow; allow well beyond the fetch timeout.
const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(120);

/// Classification of page content, injected into the frontier engine so
/// tests can supply a deterministic implementation.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, content: &str, url: &str) -> Result<Classification>;
}

/// Classifier backed by a local Ollama generate endpoint.
pub struct OllamaClassifier {
    client: reqwest::Client,
    api_url: String,
    model: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct RawClassification {
    country: Option<String>,
    city: Option<String>,
    category: Option<String>,
}

impl OllamaClassifier {
    pub fn new(settings: &ClassifierSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(CLASSIFY_TIMEOUT)
            .build()
            .context("Failed to build classifier HTTP client")?;
        Ok(Self {
            client,
            api_url: settings.api_url.clone(),
            model: settings.model.clone(),
        })
    }

    fn prompt(content: &str, url: &str) -> String {
        let snippet: String = content.chars().take(SNIPPET_LIMIT).collect();
        format!(
            "Analyze the following website content and URL to determine the Country \
             (ISO 2-letter, e.g. DE, US), City (e.g. Coburg, Berlin), and Category.\n\n\
             URL: {url}\n\
             Content Snippet:\n{snippet}\n\n\
             Categories: [Government, Business, Tourism, News, Education, Other]\n\n\
             Return ONLY a JSON object with keys: \"country\", \"city\", \"category\".\n\
             Do not add any markdown formatting or explanation.\n\
             Example: {{\"country\": \"DE\", \"city\": \"Coburg\", \"category\": \"Government\"}}"
        )
    }
}

#[async_trait]
impl Classifier for OllamaClassifier {
    async fn classify(&self, content: &str, url: &str) -> Result<Classification> {
        let body = json!({
            "model": self.model,
            "prompt": Self::prompt(content, url),
            "stream": false,
            "format": "json",
        });

        let response = self
            .client
            .post(&self.api_url)
            .json(&body)
            .send()
            .await
            .context("Classifier request failed")?
            .error_for_status()
            .context("Classifier returned error status")?;

        let generated: GenerateResponse = response
            .json()
            .await
            .context("Classifier response was not valid JSON")?;

        let raw: RawClassification = serde_json::from_str(&generated.response)
            .context("Model output was not a classification object")?;

        let classification = normalize(raw);
        debug!(url, ?classification, "Classified page");
        Ok(classification)
    }
}

/// Normalize raw model output into the canonical token shape: uppercase
/// country, whitespace collapsed to hyphens in city and category.
fn normalize(raw: RawClassification) -> Classification {
    let hyphenate =
        |value: String| -> String { value.split_whitespace().collect::<Vec<_>>().join("-") };

    Classification {
        country: raw
            .country
            .unwrap_or_else(|| "Unknown".to_string())
            .to_uppercase(),
        city: hyphenate(raw.city.unwrap_or_else(|| "Unknown".to_string())),
        category: hyphenate(raw.category.unwrap_or_else(|| "Other".to_string())),
    }
}
