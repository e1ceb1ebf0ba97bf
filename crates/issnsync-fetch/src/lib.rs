//! Provider lookups against the two upstream bibliographic services.
//!
//! Both clients share the never-throws contract: any transport error,
//! unexpected status, or malformed body collapses into
//! [`FetchOutcome::Failed`] and the caller degrades the affected fields to
//! null. An upstream that genuinely has no record yields
//! [`FetchOutcome::Absent`].

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use issnsync_core::{FetchOutcome, Issn, JournalMeta, SourceMeta};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

pub const CRATE_NAME: &str = "issnsync-fetch";

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub crossref_base: String,
    pub openalex_base: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "issnsync/0.1".to_string(),
            crossref_base: "https://api.crossref.org".to_string(),
            openalex_base: "https://api.openalex.org".to_string(),
        }
    }
}

/// Builds the single shared HTTP client both providers use.
pub fn build_client(config: &HttpConfig) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout)
        .user_agent(config.user_agent.clone())
        .build()
        .context("building reqwest client")
}

#[async_trait]
pub trait JournalProvider: Send + Sync {
    async fn journal_meta(&self, issn: &Issn) -> FetchOutcome<JournalMeta>;
}

#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn source_meta(&self, issn: &Issn) -> FetchOutcome<SourceMeta>;
}

#[derive(Debug, Deserialize)]
struct CrossrefEnvelope {
    message: CrossrefJournal,
}

#[derive(Debug, Deserialize)]
struct CrossrefJournal {
    title: Option<String>,
    publisher: Option<String>,
    #[serde(default)]
    subjects: Vec<String>,
    prefix: Option<String>,
}

fn parse_journal_body(body: &[u8]) -> Result<JournalMeta, serde_json::Error> {
    let envelope: CrossrefEnvelope = serde_json::from_slice(body)?;
    Ok(JournalMeta {
        title: envelope.message.title,
        publisher: envelope.message.publisher,
        subjects: envelope.message.subjects,
        doi_prefix: envelope.message.prefix,
    })
}

/// Journal-metadata-by-identifier lookup against the Crossref journals API.
#[derive(Debug, Clone)]
pub struct CrossrefClient {
    client: reqwest::Client,
    base_url: String,
}

impl CrossrefClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl JournalProvider for CrossrefClient {
    async fn journal_meta(&self, issn: &Issn) -> FetchOutcome<JournalMeta> {
        let url = format!("{}/journals/{}", self.base_url, issn);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => return FetchOutcome::Failed(format!("crossref request: {err}")),
        };

        let status = response.status();
        // A 404 means the journal is not registered with Crossref at all.
        if status == StatusCode::NOT_FOUND {
            debug!(%issn, "crossref has no journal record");
            return FetchOutcome::Absent;
        }
        if !status.is_success() {
            return FetchOutcome::Failed(format!("crossref status {status}"));
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => return FetchOutcome::Failed(format!("reading crossref body: {err}")),
        };
        match parse_journal_body(&body) {
            Ok(meta) => FetchOutcome::Found(meta),
            Err(err) => FetchOutcome::Failed(format!("parsing crossref body: {err}")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAlexEnvelope {
    #[serde(default)]
    results: Vec<OpenAlexSource>,
}

#[derive(Debug, Deserialize)]
struct OpenAlexSource {
    country_code: Option<String>,
    is_oa: Option<bool>,
}

fn parse_sources_body(body: &[u8]) -> Result<Option<SourceMeta>, serde_json::Error> {
    let envelope: OpenAlexEnvelope = serde_json::from_slice(body)?;
    Ok(envelope.results.into_iter().next().map(|first| SourceMeta {
        country_code: first.country_code,
        is_oa: first.is_oa,
    }))
}

/// Source-metadata-by-identifier-filter lookup against the OpenAlex sources
/// API. Only the first matching result is read.
#[derive(Debug, Clone)]
pub struct OpenAlexClient {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAlexClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl SourceProvider for OpenAlexClient {
    async fn source_meta(&self, issn: &Issn) -> FetchOutcome<SourceMeta> {
        let url = format!("{}/sources", self.base_url);
        let request = self
            .client
            .get(&url)
            .query(&[("filter", format!("issn:{issn}"))]);

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return FetchOutcome::Failed(format!("openalex request: {err}")),
        };

        let status = response.status();
        if !status.is_success() {
            return FetchOutcome::Failed(format!("openalex status {status}"));
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => return FetchOutcome::Failed(format!("reading openalex body: {err}")),
        };
        match parse_sources_body(&body) {
            Ok(Some(meta)) => FetchOutcome::Found(meta),
            Ok(None) => {
                debug!(%issn, "openalex filter matched no sources");
                FetchOutcome::Absent
            }
            Err(err) => FetchOutcome::Failed(format!("parsing openalex body: {err}")),
        }
    }
}
