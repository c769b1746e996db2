use crate::types::{
    BodyFormat, Digest, DigestEntry, DigestSection, PaperCandidate, RelevanceVerdict, RenderedDigest,
    RunWindow, TranslatedSummary,
};
use chrono::Duration;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write;
use tracing::{debug, info};

const MAX_LISTED_AUTHORS: usize = 3;
const CHAT_SUMMARY_CHARS: usize = 600;

/// Groups accepted papers into a digest and renders it per channel format.
///
/// Everything here is pure: the same digest always renders to the same bytes.
pub struct NotificationComposer;

impl NotificationComposer {
    /// Group accepted verdicts by topic in `topics` order.
    ///
    /// Within a topic, `max_per_topic` keeps the best-scored entries, then
    /// entries are ordered newest first with ties broken by paper id.
    pub fn build_digest(
        window: RunWindow,
        topics: &[String],
        candidates: &[PaperCandidate],
        verdicts: &[RelevanceVerdict],
        summaries: &HashMap<String, TranslatedSummary>,
        max_per_topic: Option<usize>,
    ) -> Digest {
        let papers: HashMap<&str, &PaperCandidate> =
            candidates.iter().map(|paper| (paper.id.as_str(), paper)).collect();

        let mut sections = Vec::new();
        for topic in topics {
            let mut entries: Vec<DigestEntry> = verdicts
                .iter()
                .filter(|verdict| verdict.accepted && &verdict.topic == topic)
                .filter_map(|verdict| {
                    let paper = papers.get(verdict.paper_id.as_str())?;
                    let summary = summaries.get(&paper.id).cloned().unwrap_or_else(|| TranslatedSummary {
                        text: paper.summary.clone(),
                        language: String::new(),
                        degraded: false,
                    });
                    Some(DigestEntry {
                        paper: (*paper).clone(),
                        topic: topic.clone(),
                        verdict: verdict.clone(),
                        summary,
                    })
                })
                .collect();

            if let Some(limit) = max_per_topic {
                if entries.len() > limit {
                    entries.sort_by(|a, b| compare_score(b, a).then_with(|| a.paper.id.cmp(&b.paper.id)));
                    debug!("Keeping {} of {} accepted papers for '{}'", limit, entries.len(), topic);
                    entries.truncate(limit);
                }
            }

            entries.sort_by(|a, b| {
                b.paper
                    .published
                    .cmp(&a.paper.published)
                    .then_with(|| a.paper.id.cmp(&b.paper.id))
            });

            if !entries.is_empty() {
                sections.push(DigestSection {
                    topic: topic.clone(),
                    entries,
                });
            }
        }

        Digest {
            window,
            topics: topics.to_vec(),
            sections,
        }
    }

    /// Subject line; a paper listed under several topics counts once.
    pub fn subject(digest: &Digest) -> String {
        let topics = digest.topics.join(", ");
        let date = last_day(&digest.window);
        let papers: HashSet<&str> = digest
            .sections
            .iter()
            .flat_map(|section| section.entries.iter())
            .map(|entry| entry.paper.id.as_str())
            .collect();
        match papers.len() {
            0 => format!("No new papers - {} ({})", topics, date),
            n => format!("{} new papers - {} ({})", n, topics, date),
        }
    }

    pub fn compose(digest: &Digest, formats: &[BodyFormat]) -> RenderedDigest {
        let mut bodies = BTreeMap::new();
        for format in formats {
            let body = match format {
                BodyFormat::PlainText => Self::render_text(digest),
                BodyFormat::Html => Self::render_html(digest),
                BodyFormat::AdaptiveCard => Self::render_adaptive_card(digest).to_string(),
                BodyFormat::Slack => Self::render_slack(digest).to_string(),
            };
            bodies.insert(*format, body);
        }

        info!(
            "Composed digest with {} entries in {} formats",
            digest.entry_count(),
            bodies.len()
        );
        RenderedDigest {
            subject: Self::subject(digest),
            bodies,
        }
    }

    /// Short notice sent when a run fails, rendered into the same formats as a digest.
    pub fn compose_failure(
        topics: &[String],
        stage: &str,
        error: &str,
        run_id: &str,
        formats: &[BodyFormat],
    ) -> RenderedDigest {
        let subject = format!("Paper digest run failed - {}", topics.join(", "));
        let text = format!(
            "The paper digest run {} failed during {}.\n\nError: {}\n\nNo papers were marked as seen; the next run will cover them.",
            run_id, stage, error
        );

        let mut bodies = BTreeMap::new();
        for format in formats {
            let body = match format {
                BodyFormat::PlainText => text.clone(),
                BodyFormat::Html => format!("<pre>{}</pre>", escape_html(&text)),
                BodyFormat::AdaptiveCard => teams_message(vec![
                    json!({"type": "TextBlock", "text": subject, "weight": "Bolder", "size": "Medium", "wrap": true}),
                    json!({"type": "TextBlock", "text": text, "wrap": true, "color": "Attention"}),
                ])
                .to_string(),
                BodyFormat::Slack => json!({
                    "text": subject,
                    "blocks": [
                        {"type": "header", "text": {"type": "plain_text", "text": subject}},
                        {"type": "section", "text": {"type": "mrkdwn", "text": text}},
                    ],
                })
                .to_string(),
            };
            bodies.insert(*format, body);
        }

        RenderedDigest { subject, bodies }
    }

    pub fn render_text(digest: &Digest) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", Self::subject(digest));
        let _ = writeln!(out, "Window: {}", describe_window(&digest.window));

        if digest.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", no_papers_line(digest));
            return out;
        }

        for section in &digest.sections {
            let _ = writeln!(out);
            let _ = writeln!(out, "== {} ({}) ==", section.topic, section.entries.len());
            for (i, entry) in section.entries.iter().enumerate() {
                let paper = &entry.paper;
                let _ = writeln!(out);
                let _ = writeln!(out, "{}. {}", i + 1, paper.title);
                let _ = writeln!(out, "   Authors: {}", format_authors(&paper.authors));
                let _ = writeln!(
                    out,
                    "   Published: {} | Categories: {}",
                    paper.published.format("%Y-%m-%d"),
                    paper.categories.join(", ")
                );
                let _ = writeln!(out, "   Relevance: {}", format_verdict(&entry.verdict));
                let _ = writeln!(out, "   {}", summary_text(&entry.summary));
                let _ = writeln!(out, "   {}", paper.url);
            }
        }
        out
    }

    pub fn render_html(digest: &Digest) -> String {
        let mut out = String::new();
        out.push_str("<html><body style=\"font-family: sans-serif;\">\n");
        let _ = writeln!(out, "<h2>{}</h2>", escape_html(&Self::subject(digest)));
        let _ = writeln!(out, "<p><small>{}</small></p>", escape_html(&describe_window(&digest.window)));

        if digest.is_empty() {
            let _ = writeln!(out, "<p>{}</p>", escape_html(&no_papers_line(digest)));
        }

        for section in &digest.sections {
            let _ = writeln!(
                out,
                "<h3>{} ({})</h3>\n<ol>",
                escape_html(&section.topic),
                section.entries.len()
            );
            for entry in &section.entries {
                let paper = &entry.paper;
                let _ = writeln!(
                    out,
                    "<li><p><a href=\"{}\"><strong>{}</strong></a><br>\n<small>{} &middot; {} &middot; {}</small><br>\n<small>Relevance: {}</small></p>\n<p>{}</p></li>",
                    escape_html(&paper.url),
                    escape_html(&paper.title),
                    escape_html(&format_authors(&paper.authors)),
                    paper.published.format("%Y-%m-%d"),
                    escape_html(&paper.categories.join(", ")),
                    escape_html(&format_verdict(&entry.verdict)),
                    escape_html(&summary_text(&entry.summary)),
                );
            }
            out.push_str("</ol>\n");
        }

        out.push_str("</body></html>\n");
        out
    }

    /// Teams incoming-webhook message carrying an Adaptive Card.
    pub fn render_adaptive_card(digest: &Digest) -> Value {
        let mut body = vec![
            json!({"type": "TextBlock", "text": Self::subject(digest), "weight": "Bolder", "size": "Medium", "wrap": true}),
            json!({"type": "TextBlock", "text": describe_window(&digest.window), "isSubtle": true, "spacing": "None", "wrap": true}),
        ];

        if digest.is_empty() {
            body.push(json!({"type": "TextBlock", "text": no_papers_line(digest), "wrap": true}));
        }

        for section in &digest.sections {
            body.push(json!({
                "type": "TextBlock",
                "text": format!("{} ({})", section.topic, section.entries.len()),
                "weight": "Bolder",
                "separator": true,
                "wrap": true,
            }));
            for entry in &section.entries {
                let paper = &entry.paper;
                body.push(json!({
                    "type": "Container",
                    "items": [
                        {"type": "TextBlock", "text": format!("[{}]({})", paper.title, paper.url), "weight": "Bolder", "wrap": true},
                        {"type": "TextBlock", "text": format!("{} | {}", format_authors(&paper.authors), paper.published.format("%Y-%m-%d")), "isSubtle": true, "spacing": "None", "wrap": true},
                        {"type": "TextBlock", "text": truncate_chars(&summary_text(&entry.summary), CHAT_SUMMARY_CHARS), "wrap": true},
                        {"type": "TextBlock", "text": format!("Relevance: {}", format_verdict(&entry.verdict)), "isSubtle": true, "size": "Small", "wrap": true},
                    ],
                }));
            }
        }

        teams_message(body)
    }

    pub fn render_slack(digest: &Digest) -> Value {
        let subject = Self::subject(digest);
        let mut blocks = vec![
            json!({"type": "header", "text": {"type": "plain_text", "text": truncate_chars(&subject, 150)}}),
            json!({"type": "context", "elements": [{"type": "mrkdwn", "text": describe_window(&digest.window)}]}),
        ];

        if digest.is_empty() {
            blocks.push(json!({"type": "section", "text": {"type": "mrkdwn", "text": no_papers_line(digest)}}));
        }

        for section in &digest.sections {
            blocks.push(json!({"type": "divider"}));
            blocks.push(json!({
                "type": "section",
                "text": {"type": "mrkdwn", "text": format!("*{}* ({})", section.topic, section.entries.len())},
            }));
            for entry in &section.entries {
                let paper = &entry.paper;
                let text = format!(
                    "*<{}|{}>*\n_{}_ | {}\n{}\nRelevance: {}",
                    paper.url,
                    slack_escape(&paper.title),
                    slack_escape(&format_authors(&paper.authors)),
                    paper.published.format("%Y-%m-%d"),
                    slack_escape(&truncate_chars(&summary_text(&entry.summary), CHAT_SUMMARY_CHARS)),
                    slack_escape(&format_verdict(&entry.verdict)),
                );
                blocks.push(json!({"type": "section", "text": {"type": "mrkdwn", "text": text}}));
            }
        }

        json!({"text": subject, "blocks": blocks})
    }
}

fn teams_message(body: Vec<Value>) -> Value {
    json!({
        "type": "message",
        "attachments": [{
            "contentType": "application/vnd.microsoft.card.adaptive",
            "content": {
                "$schema": "http://adaptivecards.io/schemas/adaptive-card.json",
                "type": "AdaptiveCard",
                "version": "1.4",
                "msteams": {"width": "Full"},
                "body": body,
            },
        }],
    })
}

fn compare_score(a: &DigestEntry, b: &DigestEntry) -> Ordering {
    let a = a.verdict.score.unwrap_or(0.0);
    let b = b.verdict.score.unwrap_or(0.0);
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Last calendar day covered by the exclusive window end.
fn last_day(window: &RunWindow) -> String {
    (window.end - Duration::seconds(1)).format("%Y-%m-%d").to_string()
}

fn describe_window(window: &RunWindow) -> String {
    format!(
        "{} to {} (UTC)",
        window.start.format("%Y-%m-%d %H:%M"),
        window.end.format("%Y-%m-%d %H:%M")
    )
}

fn no_papers_line(digest: &Digest) -> String {
    format!(
        "No new papers matched {} in this window.",
        digest.topics.join(", ")
    )
}

fn format_authors(authors: &[String]) -> String {
    if authors.is_empty() {
        return "Unknown authors".to_string();
    }
    let listed = authors
        .iter()
        .take(MAX_LISTED_AUTHORS)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if authors.len() > MAX_LISTED_AUTHORS {
        format!("{} +{} more", listed, authors.len() - MAX_LISTED_AUTHORS)
    } else {
        listed
    }
}

fn format_verdict(verdict: &RelevanceVerdict) -> String {
    let score = verdict
        .score
        .map(|score| format!("{:.2}", score))
        .unwrap_or_else(|| "n/a".to_string());
    if verdict.rationale.is_empty() {
        score
    } else {
        format!("{} - {}", score, verdict.rationale)
    }
}

fn summary_text(summary: &TranslatedSummary) -> String {
    if summary.degraded {
        format!("[translation unavailable] {}", summary.text)
    } else {
        summary.text.clone()
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn slack_escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
