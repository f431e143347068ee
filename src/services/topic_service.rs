use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::LlmError;
use crate::models::{CompanyProfile, RetrievedDocument, Topic, Urgency};
use crate::services::llm_service::{LlmService, LlmTask};

const SYSTEM_PROMPT: &str = "You are a financial news analyst. You group news documents into \
distinct business topics for one company and describe their business impact factually. \
Respond with JSON only.";

// Longest snippet passed to the model per document.
const MAX_SNIPPET_CHARS: usize = 1200;

#[derive(Debug, Deserialize)]
struct TopicResponse {
    #[serde(default)]
    topics: Vec<TopicData>,
}

#[derive(Debug, Deserialize)]
struct TopicData {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    business_impact: String,
    #[serde(default)]
    urgency: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    document_indices: Vec<usize>,
}

/// Turns retrieved documents into named topics
pub struct TopicExtractor {
    llm: Arc<LlmService>,
}

impl TopicExtractor {
    pub fn new(llm: Arc<LlmService>) -> Self {
        Self { llm }
    }

    /// Extract topics from one batch of documents.
    ///
    /// Every document is shown to the model separately, so documents that
    /// share a headline still contribute their own body text. An empty batch
    /// makes no LLM call.
    pub async fn extract(
        &self,
        profile: &CompanyProfile,
        documents: &[RetrievedDocument],
        iteration: usize,
    ) -> Result<Vec<Topic>, LlmError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            "Extracting topics from {} documents for {} (iteration {})",
            documents.len(),
            profile.name,
            iteration
        );

        let prompt = build_extraction_prompt(profile, documents);
        let request = self.llm.request(LlmTask::TopicExtraction, SYSTEM_PROMPT, prompt);
        let response: TopicResponse = self.llm.complete_json(&request).await?;

        let topics = into_topics(response, documents, iteration);
        info!("Extracted {} topics", topics.len());
        Ok(topics)
    }
}

fn build_extraction_prompt(profile: &CompanyProfile, documents: &[RetrievedDocument]) -> String {
    let documents_text = documents
        .iter()
        .enumerate()
        .map(|(i, doc)| {
            let date = doc
                .published_at
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let snippet: String = doc.snippet.chars().take(MAX_SNIPPET_CHARS).collect();
            format!(
                "[{}] {}\nURL: {} | Date: {}\n{}\n",
                i, doc.title, doc.url, date, snippet
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"{}
Identify the distinct business topics in these news documents. For each topic provide:
1. A concise topic name (3-6 words)
2. A 2-3 sentence factual description
3. A one-sentence summary of the business impact on the company
4. Urgency (low/medium/high/critical)
5. Confidence that the topic is real and relevant (0.0-1.0)
6. Indices of the documents that support it

DOCUMENTS:
{}

Format your response as valid JSON:
{{
  "topics": [
    {{
      "name": "...",
      "description": "...",
      "business_impact": "...",
      "urgency": "low|medium|high|critical",
      "confidence": 0.8,
      "document_indices": [0, 2]
    }}
  ]
}}

Guidelines:
- Merge documents about the same development into one topic
- Ignore documents unrelated to the company
- Keep descriptions factual; do not speculate"#,
        profile.as_context(),
        documents_text
    )
}

fn into_topics(
    response: TopicResponse,
    documents: &[RetrievedDocument],
    iteration: usize,
) -> Vec<Topic> {
    response
        .topics
        .into_iter()
        .filter_map(|data| {
            let name = collapse_whitespace(&data.name);
            if name.is_empty() {
                warn!("Dropping extracted topic without a name");
                return None;
            }
            let sources: BTreeSet<String> = data
                .document_indices
                .iter()
                .filter_map(|&idx| documents.get(idx).map(|d| d.url.clone()))
                .collect();
            let confidence = if data.confidence.is_finite() {
                data.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            };
            Some(Topic {
                name,
                description: data.description.trim().to_string(),
                business_impact: data.business_impact.trim().to_string(),
                urgency: Urgency::from_label(&data.urgency),
                confidence,
                sources: sources.into_iter().collect(),
                first_seen_iteration: iteration,
                last_seen_iteration: iteration,
            })
        })
        .collect()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case- and whitespace-insensitive topic name key
pub fn normalize_name(name: &str) -> String {
    collapse_whitespace(name).to_lowercase()
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Jaccard similarity of the word sets of two descriptions, in [0, 1]
pub fn description_similarity(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f64 / union as f64
}

pub fn topics_match(a: &Topic, b: &Topic, threshold: f64) -> bool {
    normalize_name(&a.name) == normalize_name(&b.name)
        || description_similarity(&a.description, &b.description) >= threshold
}

/// Which of two matching topics supplies name, description and impact text.
///
/// Longer description first, then the later iteration, then the
/// lexicographically greater description and name. The order is total, so
/// `merge_topics(a, b) == merge_topics(b, a)`.
fn preference(a: &Topic, b: &Topic) -> Ordering {
    a.description
        .chars()
        .count()
        .cmp(&b.description.chars().count())
        .then(a.last_seen_iteration.cmp(&b.last_seen_iteration))
        .then_with(|| a.description.cmp(&b.description))
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.business_impact.cmp(&b.business_impact))
}

/// Combine two topics that describe the same development
pub fn merge_topics(a: &Topic, b: &Topic) -> Topic {
    combine(a, [b])
}

/// Combine a group of matching topics; the text comes from the most
/// preferred member, so the result does not depend on member order.
fn combine<'a>(first: &'a Topic, rest: impl IntoIterator<Item = &'a Topic>) -> Topic {
    let mut preferred = first;
    let mut urgency = first.urgency;
    let mut confidence = first.confidence;
    let mut sources: BTreeSet<String> = first.sources.iter().cloned().collect();
    let mut first_seen = first.first_seen_iteration;
    let mut last_seen = first.last_seen_iteration;

    for topic in rest {
        if preference(preferred, topic) == Ordering::Less {
            preferred = topic;
        }
        urgency = urgency.max(topic.urgency);
        confidence = confidence.max(topic.confidence);
        sources.extend(topic.sources.iter().cloned());
        first_seen = first_seen.min(topic.first_seen_iteration);
        last_seen = last_seen.max(topic.last_seen_iteration);
    }

    Topic {
        name: preferred.name.clone(),
        description: preferred.description.clone(),
        business_impact: preferred.business_impact.clone(),
        urgency,
        confidence,
        sources: sources.into_iter().collect(),
        first_seen_iteration: first_seen,
        last_seen_iteration: last_seen,
    }
}

/// Result of folding one topic into a `TopicSet`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No existing topic matched; the topic was appended
    Added,
    /// Merged into an existing topic, which changed
    Merged,
    /// Merged into an existing topic, which was already a superset
    Unchanged,
}

/// The running, de-duplicated topic accumulator of one pipeline run.
///
/// Each entry keeps every topic folded into it. An incoming topic joins
/// every entry with a member it matches, and entries it bridges are united.
/// Entries are therefore the connected components of the match relation over
/// all topics seen, independent of arrival order, and no two entries can
/// share a case-insensitive name.
#[derive(Debug, Clone)]
pub struct TopicSet {
    topics: Vec<Topic>,
    members: Vec<Vec<Topic>>,
    threshold: f64,
}

impl TopicSet {
    pub fn new(threshold: f64) -> Self {
        Self {
            topics: Vec::new(),
            members: Vec::new(),
            threshold,
        }
    }

    pub fn merge(&mut self, incoming: Topic) -> MergeOutcome {
        let matched: Vec<usize> = self
            .members
            .iter()
            .enumerate()
            .filter(|(_, members)| {
                members
                    .iter()
                    .any(|member| topics_match(member, &incoming, self.threshold))
            })
            .map(|(idx, _)| idx)
            .collect();

        let Some(&target) = matched.first() else {
            self.topics.push(incoming.clone());
            self.members.push(vec![incoming]);
            return MergeOutcome::Added;
        };

        // Highest index first so earlier indices stay valid
        for &idx in matched[1..].iter().rev() {
            self.topics.remove(idx);
            let absorbed = self.members.remove(idx);
            self.members[target].extend(absorbed);
        }

        if !self.members[target].contains(&incoming) {
            self.members[target].push(incoming);
        }

        let members = &self.members[target];
        let merged = combine(&members[0], &members[1..]);

        if matched.len() == 1 && merged == self.topics[target] {
            MergeOutcome::Unchanged
        } else {
            self.topics[target] = merged;
            MergeOutcome::Merged
        }
    }

    /// Fold a batch in; returns how many topics were new to the set
    pub fn merge_all(&mut self, incoming: Vec<Topic>) -> usize {
        incoming
            .into_iter()
            .filter(|topic| self.merge(topic.clone()) == MergeOutcome::Added)
            .count()
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn into_topics(self) -> Vec<Topic> {
        self.topics
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm_service::testing::{self, FakeLlm};
    use crate::services::news_service::testing::doc;

    fn topic(name: &str, description: &str, iteration: usize) -> Topic {
        Topic {
            name: name.to_string(),
            description: description.to_string(),
            business_impact: format!("impact of {}", name),
            urgency: Urgency::Medium,
            confidence: 0.5,
            sources: Vec::new(),
            first_seen_iteration: iteration,
            last_seen_iteration: iteration,
        }
    }

    #[test]
    fn test_names_match_case_insensitively() {
        let a = topic("Widget Recall", "Acme is recalling widgets", 1);
        let b = topic("  widget   RECALL ", "Totally different words here", 2);
        assert!(topics_match(&a, &b, 0.9));
    }

    #[test]
    fn test_similar_descriptions_match() {
        let a = topic("Recall", "Acme recalls two million widgets over battery fires", 1);
        let b = topic("Battery fires", "Acme recalls two million widgets over battery fire risk", 1);
        assert!(description_similarity(&a.description, &b.description) > 0.6);
        assert!(topics_match(&a, &b, 0.6));
        assert!(!topics_match(&a, &b, 0.99));
    }

    #[test]
    fn test_empty_descriptions_never_match_by_similarity() {
        assert_eq!(description_similarity("", ""), 0.0);
        let a = topic("One", "", 1);
        let b = topic("Two", "", 1);
        assert!(!topics_match(&a, &b, 0.1));
    }

    #[test]
    fn test_merge_prefers_longer_description_and_max_confidence() {
        let mut a = topic("Recall", "short text", 1);
        a.confidence = 0.9;
        a.sources = vec!["https://a/1".to_string()];
        let mut b = topic("recall", "a considerably longer description", 2);
        b.confidence = 0.4;
        b.urgency = Urgency::High;
        b.sources = vec!["https://a/1".to_string(), "https://b/2".to_string()];

        let merged = merge_topics(&a, &b);
        assert_eq!(merged.name, "recall");
        assert_eq!(merged.description, "a considerably longer description");
        assert_eq!(merged.confidence, 0.9);
        assert_eq!(merged.urgency, Urgency::High);
        assert_eq!(merged.sources, vec!["https://a/1", "https://b/2"]);
        assert_eq!(merged.first_seen_iteration, 1);
        assert_eq!(merged.last_seen_iteration, 2);
    }

    #[test]
    fn test_merge_tie_prefers_most_recent_iteration() {
        let older = topic("Recall", "same length AAAA", 1);
        let newer = topic("RECALL", "same length BBBB", 3);
        let merged = merge_topics(&older, &newer);
        assert_eq!(merged.description, "same length BBBB");
        assert_eq!(merged.name, "RECALL");
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = topic("Recall", "equal size one", 2);
        let b = topic("recall", "equal size two", 2);
        assert_eq!(merge_topics(&a, &b), merge_topics(&b, &a));

        let c = topic("Recall", "longer description wins", 1);
        assert_eq!(merge_topics(&a, &c), merge_topics(&c, &a));
    }

    #[test]
    fn test_merge_with_self_is_identity() {
        let mut a = topic("Recall", "Acme recalls widgets", 1);
        a.sources = vec!["https://a/1".to_string(), "https://b/2".to_string()];
        assert_eq!(merge_topics(&a, &a), a);
    }

    #[test]
    fn test_topic_set_reports_outcomes() {
        let mut set = TopicSet::new(0.6);
        assert_eq!(set.merge(topic("Recall", "Acme recalls widgets", 1)), MergeOutcome::Added);
        assert_eq!(set.merge(topic("recall", "Acme recalls widgets", 1)), MergeOutcome::Merged);
        assert_eq!(set.merge(topic("recall", "Acme recalls widgets", 1)), MergeOutcome::Unchanged);
        assert_eq!(set.merge(topic("Layoffs", "Acme cuts 5% of staff", 2)), MergeOutcome::Added);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_topic_set_has_unique_names() {
        let mut set = TopicSet::new(0.6);
        let added = set.merge_all(vec![
            topic("Recall", "one", 1),
            topic("RECALL", "two", 1),
            topic("Guidance cut", "three", 1),
            topic("guidance  cut", "four", 2),
        ]);
        assert_eq!(added, 2);
        let names: HashSet<String> = set.topics().iter().map(|t| normalize_name(&t.name)).collect();
        assert_eq!(names.len(), set.len());
    }

    #[test]
    fn test_remerging_existing_topics_is_noop() {
        let mut set = TopicSet::new(0.6);
        set.merge_all(vec![
            topic("Recall", "Acme recalls widgets", 1),
            topic("Layoffs", "Acme cuts staff", 1),
        ]);
        let before = set.topics().to_vec();

        let added = set.merge_all(before.clone());
        assert_eq!(added, 0);
        assert_eq!(set.topics(), before.as_slice());
    }

    #[test]
    fn test_merge_order_does_not_change_result() {
        let items = vec![
            topic("Recall", "Acme recalls widgets", 1),
            topic("recall", "Acme recalls widgets after fires", 2),
            topic("Layoffs", "Acme cuts staff", 1),
        ];
        let mut forward = TopicSet::new(0.6);
        forward.merge_all(items.clone());
        let mut backward = TopicSet::new(0.6);
        backward.merge_all(items.into_iter().rev().collect());

        let mut f = forward.into_topics();
        let mut b = backward.into_topics();
        f.sort_by(|x, y| x.name.cmp(&y.name));
        b.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(f, b);
    }

    #[test]
    fn test_topic_matching_two_entries_unites_them() {
        let mut set = TopicSet::new(0.6);
        set.merge(topic("Alpha", "acme recalls widgets battery", 1));
        set.merge(topic("Beta", "layoffs announced", 1));

        // Same description as Alpha, same name as Beta
        let outcome = set.merge(topic("beta", "acme recalls widgets battery fires", 2));

        assert_eq!(outcome, MergeOutcome::Merged);
        assert_eq!(set.len(), 1);
        let names: HashSet<String> = set.topics().iter().map(|t| normalize_name(&t.name)).collect();
        assert_eq!(names.len(), set.len());
        assert_eq!(set.topics()[0].description, "acme recalls widgets battery fires");
        assert_eq!(set.topics()[0].first_seen_iteration, 1);
    }

    #[test]
    fn test_bridging_topic_gives_same_set_in_any_order() {
        let items = vec![
            topic("X", "alpha bravo charlie", 1),
            topic("Y", "delta echo foxtrot golf", 3),
            topic("x", "delta echo foxtrot golf hotel", 2),
        ];
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        let results: Vec<Vec<Topic>> = orders
            .iter()
            .map(|order| {
                let mut set = TopicSet::new(0.6);
                set.merge_all(order.iter().map(|&i| items[i].clone()).collect());
                let mut topics = set.into_topics();
                topics.sort_by(|a, b| a.name.cmp(&b.name));
                topics
            })
            .collect();

        assert_eq!(results[0].len(), 1);
        assert!(results.iter().all(|r| r == &results[0]));
    }

    #[test]
    fn test_merged_topic_still_matches_absorbed_description() {
        let mut set = TopicSet::new(0.6);
        set.merge(topic("Recall", "alpha bravo charlie", 1));
        // Name match replaces the description with a longer, unrelated one
        set.merge(topic("recall", "delta echo foxtrot golf hotel", 1));

        let outcome = set.merge(topic("Widget problems", "alpha bravo charlie", 2));
        assert_ne!(outcome, MergeOutcome::Added);
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn test_extract_maps_indices_to_sources() {
        let fake = Arc::new(FakeLlm::new(|_| {
            Ok(r#"{"topics": [
                {"name": " Widget  recall ", "description": "Acme recalls widgets.", "business_impact": "Costs rise.",
                 "urgency": "HIGH", "confidence": 1.3, "document_indices": [1, 0, 7]},
                {"name": "", "description": "nameless"}
            ]}"#
            .to_string())
        }));
        let extractor = TopicExtractor::new(testing::service(fake));
        let docs = vec![
            doc("Acme recall", "https://b.example/2", "body b"),
            doc("Acme recall", "https://a.example/1", "body a"),
        ];

        let topics = extractor
            .extract(&CompanyProfile::named("Acme"), &docs, 2)
            .await
            .unwrap();

        assert_eq!(topics.len(), 1);
        let t = &topics[0];
        assert_eq!(t.name, "Widget recall");
        assert_eq!(t.urgency, Urgency::High);
        assert_eq!(t.confidence, 1.0);
        assert_eq!(t.sources, vec!["https://a.example/1", "https://b.example/2"]);
        assert_eq!(t.first_seen_iteration, 2);
    }

    #[tokio::test]
    async fn test_extract_shows_every_body_for_shared_titles() {
        let fake = Arc::new(FakeLlm::new(|_| Ok(r#"{"topics": []}"#.to_string())));
        let extractor = TopicExtractor::new(testing::service(fake.clone()));
        let docs = vec![
            doc("Acme recalls widgets", "https://a.example/1", "Outlet A reports fires"),
            doc("Acme recalls widgets", "https://b.example/1", "Outlet B reports injuries"),
        ];

        extractor
            .extract(&CompanyProfile::named("Acme"), &docs, 1)
            .await
            .unwrap();

        let prompt = &fake.calls_for(LlmTask::TopicExtraction)[0].prompt;
        assert!(prompt.contains("Outlet A reports fires"));
        assert!(prompt.contains("Outlet B reports injuries"));
    }

    #[tokio::test]
    async fn test_extract_without_documents_makes_no_call() {
        let fake = Arc::new(FakeLlm::new(|_| Ok(r#"{"topics": []}"#.to_string())));
        let extractor = TopicExtractor::new(testing::service(fake.clone()));

        let topics = extractor
            .extract(&CompanyProfile::named("Acme"), &[], 1)
            .await
            .unwrap();

        assert!(topics.is_empty());
        assert!(fake.calls.lock().unwrap().is_empty());
    }
}
