mod common;

use arxiv_digest::{types::*, ArxivFetcher, ArxivParser};
use common::*;
use reqwest::StatusCode;
use tracing::info;

const ARXIV_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:opensearch="http://a9.com/-/spec/opensearch/1.1/" xmlns:arxiv="http://arxiv.org/schemas/atom">
  <link href="http://arxiv.org/api/query" rel="self" type="application/atom+xml"/>
  <title type="html">ArXiv Query: search_query=all:"electricity market"</title>
  <id>http://arxiv.org/api/abc123</id>
  <updated>2024-05-01T00:00:00-04:00</updated>
  <opensearch:totalResults>2</opensearch:totalResults>
  <opensearch:startIndex>0</opensearch:startIndex>
  <opensearch:itemsPerPage>50</opensearch:itemsPerPage>
  <entry>
    <id>http://arxiv.org/abs/2404.12345v2</id>
    <updated>2024-04-30T17:59:59Z</updated>
    <published>2024-04-29T10:00:00Z</published>
    <title>Bidding Strategies in
      Day-Ahead Electricity Markets</title>
    <summary>  We study   strategic bidding
      in day-ahead markets.
    </summary>
    <author><name>Jane Doe</name></author>
    <author><name>John Roe</name></author>
    <link href="http://arxiv.org/abs/2404.12345v2" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/2404.12345v2" rel="related" type="application/pdf"/>
    <category term="econ.EM" scheme="http://arxiv.org/schemas/atom"/>
    <category term="cs.GT" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/hep-th/9901001v1</id>
    <updated>1999-01-01T00:00:00Z</updated>
    <published>1999-01-01T00:00:00Z</published>
    <title>An Old-Style Identifier</title>
    <summary>Legacy paper.</summary>
    <author><name>A. Physicist</name></author>
    <category term="hep-th" scheme="http://arxiv.org/schemas/atom"/>
  </entry>
</feed>"#;

const ARXIV_ERROR: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>ArXiv Query: search_query=bad</title>
  <id>http://arxiv.org/api/err</id>
  <updated>2024-05-01T00:00:00-04:00</updated>
  <entry>
    <id>http://arxiv.org/api/errors#incorrect_id_format_for_1234</id>
    <title>Error</title>
    <summary>incorrect id format for 1234</summary>
    <updated>2024-05-01T00:00:00-04:00</updated>
    <author><name>arXiv api core</name></author>
  </entry>
</feed>"#;

#[test]
fn test_parse_arxiv_feed() -> Result<()> {
    init_tracing();

    let papers = ArxivParser::parse_feed(ARXIV_RESPONSE)?;
    info!("Parsed {} papers", papers.len());
    assert_eq!(papers.len(), 2);

    let first = &papers[0];
    assert_eq!(first.id, "2404.12345");
    assert_eq!(first.title, "Bidding Strategies in Day-Ahead Electricity Markets");
    assert_eq!(first.summary, "We study strategic bidding in day-ahead markets.");
    assert_eq!(first.authors, vec!["Jane Doe", "John Roe"]);
    assert_eq!(first.categories, vec!["econ.EM", "cs.GT"]);
    assert_eq!(first.url, "http://arxiv.org/abs/2404.12345v2");
    assert_eq!(first.published, at(2024, 4, 29, 10));
    assert!(first.matched_topics.is_empty());

    let second = &papers[1];
    assert_eq!(second.id, "hep-th/9901001");
    assert_eq!(second.url, "https://arxiv.org/abs/hep-th/9901001");
    Ok(())
}

#[test]
fn test_api_error_entry_is_a_source_error() {
    let result = ArxivParser::parse_feed(ARXIV_ERROR);
    match result {
        Err(DigestError::SourceUnavailable { reason }) => {
            assert!(reason.contains("incorrect id format"));
        }
        other => panic!("expected SourceUnavailable, got {:?}", other),
    }
}

#[test]
fn test_garbage_is_a_source_error() {
    let result = ArxivParser::parse_feed("<html>Service temporarily unavailable</html>");
    assert!(matches!(result, Err(DigestError::SourceUnavailable { .. })));
}

#[test]
fn test_paper_id_strips_version() {
    assert_eq!(ArxivParser::paper_id("http://arxiv.org/abs/2401.01234v1").as_deref(), Some("2401.01234"));
    assert_eq!(ArxivParser::paper_id("http://arxiv.org/abs/2401.01234v12").as_deref(), Some("2401.01234"));
    assert_eq!(ArxivParser::paper_id("http://arxiv.org/abs/2401.01234").as_deref(), Some("2401.01234"));
    assert_eq!(
        ArxivParser::paper_id("http://arxiv.org/abs/solv-int/9901001v3").as_deref(),
        Some("solv-int/9901001")
    );
    assert_eq!(ArxivParser::paper_id("http://arxiv.org/abs/"), None);
}

#[test]
fn test_search_query_format() -> Result<()> {
    let query = TopicQuery::new(
        "electricity market",
        vec!["econ.EM".to_string(), "eess.SY".to_string()],
    );
    let window = RunWindow::new(at(2024, 4, 29, 0), at(2024, 5, 2, 0))?;

    let search = ArxivFetcher::build_search_query(&query, &window);
    assert_eq!(
        search,
        "all:\"electricity market\" AND submittedDate:[202404290000 TO 202405012359] AND (cat:econ.EM OR cat:eess.SY)"
    );
    Ok(())
}

#[test]
fn test_status_classification() {
    assert!(matches!(
        arxiv_digest::fetcher::classify_status(StatusCode::TOO_MANY_REQUESTS, Some(7)),
        DigestError::SourceQuotaExceeded { retry_after_secs: Some(7) }
    ));
    assert!(matches!(
        arxiv_digest::fetcher::classify_status(StatusCode::SERVICE_UNAVAILABLE, Some(3)),
        DigestError::SourceQuotaExceeded { .. }
    ));

    let unavailable = arxiv_digest::fetcher::classify_status(StatusCode::SERVICE_UNAVAILABLE, None);
    assert!(matches!(unavailable, DigestError::SourceUnavailable { .. }));
    assert!(unavailable.is_retryable());

    let quota = arxiv_digest::fetcher::classify_status(StatusCode::TOO_MANY_REQUESTS, Some(7));
    assert_eq!(quota.retry_after(), Some(std::time::Duration::from_secs(7)));
}
