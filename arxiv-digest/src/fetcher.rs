use crate::parser::ArxivParser;
use crate::types::{DigestError, FetchConfig, PaperCandidate, PaperSource, Result, RunWindow, TopicQuery};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

/// HTTP client for the ArXiv export API.
///
/// One call fetches one page; retries and pagination belong to `SourceClient`.
pub struct ArxivFetcher {
    client: Client,
    config: FetchConfig,
    rate_limiter: Arc<Mutex<HashMap<String, Instant>>>,
}

impl ArxivFetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()
            .map_err(|e| DigestError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            rate_limiter: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Build the `search_query` expression for one topic.
    ///
    /// ArXiv date ranges are inclusive at minute precision, so the upper bound
    /// is the last minute before the exclusive window end.
    pub fn build_search_query(query: &TopicQuery, window: &RunWindow) -> String {
        let last_minute = window.end - ChronoDuration::minutes(1);
        let date_range = format!(
            "[{} TO {}]",
            window.start.format("%Y%m%d%H%M"),
            last_minute.format("%Y%m%d%H%M")
        );

        let topic = query.topic.replace('"', "");
        let mut parts = vec![format!("all:\"{}\"", topic), format!("submittedDate:{}", date_range)];

        if !query.categories.is_empty() {
            let categories = query
                .categories
                .iter()
                .map(|c| format!("cat:{}", c))
                .collect::<Vec<_>>()
                .join(" OR ");
            parts.push(format!("({})", categories));
        }

        parts.join(" AND ")
    }

    fn request_url(&self, search_query: &str, offset: usize, limit: usize) -> Result<Url> {
        Url::parse_with_params(
            &self.config.base_url,
            &[
                ("search_query", search_query.to_string()),
                ("start", offset.to_string()),
                ("max_results", limit.to_string()),
                ("sortBy", "submittedDate".to_string()),
                ("sortOrder", "descending".to_string()),
            ],
        )
        .map_err(|e| DigestError::config(format!("Invalid ArXiv API URL {}: {}", self.config.base_url, e)))
    }

    async fn apply_rate_limit(&self, url: &Url) {
        let host = url.host_str().unwrap_or("").to_string();
        let min_interval = Duration::from_millis(self.config.min_request_interval_ms);

        let mut rate_limiter = self.rate_limiter.lock().await;
        if let Some(last_request) = rate_limiter.get(&host) {
            let elapsed = last_request.elapsed();
            if elapsed < min_interval {
                let wait_time = min_interval - elapsed;
                debug!("Rate limiting {}: waiting {:?}", host, wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }
        rate_limiter.insert(host, Instant::now());
    }
}

/// Map an HTTP status onto the source error taxonomy.
pub fn classify_status(status: StatusCode, retry_after: Option<u64>) -> DigestError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::SERVICE_UNAVAILABLE && retry_after.is_some())
    {
        DigestError::SourceQuotaExceeded {
            retry_after_secs: retry_after,
        }
    } else {
        DigestError::source(format!(
            "HTTP {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        ))
    }
}

#[async_trait]
impl PaperSource for ArxivFetcher {
    fn source_name(&self) -> String {
        "arxiv".to_string()
    }

    async fn fetch_page(
        &self,
        query: &TopicQuery,
        window: &RunWindow,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PaperCandidate>> {
        let search_query = Self::build_search_query(query, window);
        let url = self.request_url(&search_query, offset, limit)?;

        self.apply_rate_limit(&url).await;

        let started = Instant::now();
        debug!("Querying ArXiv: {} (start={}, max_results={})", search_query, offset, limit);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DigestError::source(format!("ArXiv request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            return Err(classify_status(status, retry_after));
        }

        let content = response
            .text()
            .await
            .map_err(|e| DigestError::source(format!("Failed to read ArXiv response: {}", e)))?;

        let papers = ArxivParser::parse_feed(&content)?;
        info!(
            "ArXiv page for '{}' at offset {}: {} entries in {}ms",
            query.topic,
            offset,
            papers.len(),
            started.elapsed().as_millis()
        );
        Ok(papers)
    }
}
