use crate::types::{DigestError, PaperCandidate, Result};
use feed_rs::parser;
use tracing::{debug, info, warn};

/// Turns ArXiv API Atom responses into paper candidates.
pub struct ArxivParser;

impl ArxivParser {
    pub fn parse_feed(content: &str) -> Result<Vec<PaperCandidate>> {
        debug!("Parsing ArXiv response ({} bytes)", content.len());

        let feed = parser::parse(content.as_bytes())
            .map_err(|e| DigestError::source(format!("Failed to parse ArXiv feed: {}", e)))?;

        // The API reports query errors as a feed with a single error entry
        if let Some(error_entry) = feed.entries.iter().find(|e| e.id.contains("/api/errors")) {
            let detail = error_entry
                .summary
                .as_ref()
                .map(|s| s.content.clone())
                .unwrap_or_else(|| error_entry.id.clone());
            return Err(DigestError::source(format!("ArXiv rejected the query: {}", detail)));
        }

        let mut papers = Vec::with_capacity(feed.entries.len());
        for entry in feed.entries {
            if let Some(paper) = Self::parse_entry(entry) {
                papers.push(paper);
            }
        }

        info!("Parsed ArXiv page with {} entries", papers.len());
        Ok(papers)
    }

    fn parse_entry(entry: feed_rs::model::Entry) -> Option<PaperCandidate> {
        let id = Self::paper_id(&entry.id)?;

        let Some(published) = entry.published else {
            warn!("Skipping ArXiv entry {} without a publication date", id);
            return None;
        };

        let title = entry
            .title
            .map(|t| collapse_whitespace(&t.content))
            .unwrap_or_else(|| "Untitled".to_string());
        let summary = entry
            .summary
            .map(|s| collapse_whitespace(&s.content))
            .unwrap_or_default();

        let url = entry
            .links
            .iter()
            .find(|link| link.rel.as_deref() == Some("alternate"))
            .or_else(|| entry.links.first())
            .map(|link| link.href.clone())
            .unwrap_or_else(|| format!("https://arxiv.org/abs/{}", id));

        Some(PaperCandidate {
            id,
            title,
            summary,
            authors: entry.authors.into_iter().map(|a| a.name).collect(),
            published,
            updated: entry.updated,
            categories: entry.categories.into_iter().map(|c| c.term).collect(),
            url,
            matched_topics: Vec::new(),
        })
    }

    /// Version-independent identifier from an Atom entry id.
    ///
    /// `http://arxiv.org/abs/2401.01234v2` becomes `2401.01234` and old-style
    /// `http://arxiv.org/abs/hep-th/9901001v1` becomes `hep-th/9901001`.
    pub fn paper_id(entry_id: &str) -> Option<String> {
        let raw = match entry_id.split_once("/abs/") {
            Some((_, rest)) => rest,
            None => entry_id.rsplit('/').next().unwrap_or(entry_id),
        };
        let raw = raw.trim().trim_end_matches('/');
        if raw.is_empty() {
            return None;
        }

        let id = match raw.rfind('v') {
            Some(pos)
                if pos > 0
                    && pos + 1 < raw.len()
                    && raw[pos + 1..].chars().all(|c| c.is_ascii_digit()) =>
            {
                &raw[..pos]
            }
            _ => raw,
        };
        Some(id.to_string())
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
