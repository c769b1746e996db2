use crate::retry::RetryPolicy;
use crate::types::{PaperCandidate, PaperSource, Result, RunWindow, TopicQuery};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// One paper returned by the query of one topic.
#[derive(Debug, Clone)]
pub struct TopicHit {
    pub topic: String,
    pub paper: PaperCandidate,
}

struct Cursor {
    topic_index: usize,
    offset: usize,
    exhausted: bool,
    buffer: VecDeque<PaperCandidate>,
}

/// Paginates a `PaperSource` per topic and merges the results of all topics.
pub struct SourceClient {
    source: Arc<dyn PaperSource>,
    retry: RetryPolicy,
    page_size: usize,
    max_results_per_topic: usize,
}

impl SourceClient {
    pub fn new(
        source: Arc<dyn PaperSource>,
        retry: RetryPolicy,
        page_size: usize,
        max_results_per_topic: usize,
    ) -> Self {
        Self {
            source,
            retry,
            page_size: page_size.max(1),
            max_results_per_topic,
        }
    }

    /// Lazy sequence of hits, topic by topic.
    ///
    /// A page is requested only when the previous one has been consumed.
    /// Papers published outside `window` are dropped even if the source
    /// returned them. The first error that outlives the retry budget ends
    /// the stream.
    pub fn stream<'a>(
        &'a self,
        topics: &'a [TopicQuery],
        window: &'a RunWindow,
    ) -> BoxStream<'a, Result<TopicHit>> {
        let cursor = Cursor {
            topic_index: 0,
            offset: 0,
            exhausted: false,
            buffer: VecDeque::new(),
        };

        stream::try_unfold(cursor, move |cursor| self.next_hit(topics, window, cursor)).boxed()
    }

    async fn next_hit(
        &self,
        topics: &[TopicQuery],
        window: &RunWindow,
        mut cursor: Cursor,
    ) -> Result<Option<(TopicHit, Cursor)>> {
        loop {
            if let Some(paper) = cursor.buffer.pop_front() {
                let topic = topics[cursor.topic_index].topic.clone();
                return Ok(Some((TopicHit { topic, paper }, cursor)));
            }

            let Some(query) = topics.get(cursor.topic_index) else {
                return Ok(None);
            };

            if cursor.exhausted || cursor.offset >= self.max_results_per_topic {
                debug!("Finished topic '{}' after {} results", query.topic, cursor.offset);
                cursor.topic_index += 1;
                cursor.offset = 0;
                cursor.exhausted = false;
                continue;
            }

            let offset = cursor.offset;
            let limit = self.page_size.min(self.max_results_per_topic - offset);
            let label = format!(
                "{} query '{}' at offset {}",
                self.source.source_name(),
                query.topic,
                offset
            );
            let page = self
                .retry
                .run(&label, || self.source.fetch_page(query, window, offset, limit))
                .await?;

            cursor.exhausted = page.len() < limit;
            cursor.offset += page.len();
            cursor
                .buffer
                .extend(page.into_iter().filter(|paper| window.contains(paper.published)));
        }
    }

    /// Drain the stream into unique candidates, tagging each with every topic that returned it.
    /// Candidates keep the order in which they were first seen.
    pub async fn fetch_candidates(
        &self,
        topics: &[TopicQuery],
        window: &RunWindow,
    ) -> Result<Vec<PaperCandidate>> {
        let mut hits = self.stream(topics, window);
        let mut order: Vec<String> = Vec::new();
        let mut by_id: HashMap<String, PaperCandidate> = HashMap::new();
        let mut hit_count = 0usize;

        while let Some(hit) = hits.try_next().await? {
            hit_count += 1;
            match by_id.get_mut(&hit.paper.id) {
                Some(existing) => {
                    if !existing.matched_topics.contains(&hit.topic) {
                        existing.matched_topics.push(hit.topic);
                    }
                }
                None => {
                    let mut paper = hit.paper;
                    paper.matched_topics = vec![hit.topic];
                    order.push(paper.id.clone());
                    by_id.insert(paper.id.clone(), paper);
                }
            }
        }

        let candidates: Vec<PaperCandidate> =
            order.into_iter().filter_map(|id| by_id.remove(&id)).collect();
        info!(
            "Fetched {} hits, {} unique candidates across {} topics",
            hit_count,
            candidates.len(),
            topics.len()
        );
        Ok(candidates)
    }
}
