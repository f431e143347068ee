use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::{stream, StreamExt};
use tracing::{info, warn};

use crate::config::ResearchConfig;
use crate::errors::{ResearchError, SearchError};
use crate::models::research::rank_order;
use crate::models::{
    CompanyProfile, PipelineRun, RankedTopic, ResearchReport, ResearchRequest, RetrievedDocument,
    RunState, Termination, Topic,
};
use crate::services::impact_ranking_service::ImpactRanker;
use crate::services::llm_service::LlmService;
use crate::services::news_service::{dedupe_by_url, normalize_url, NewsService};
use crate::services::query_generator_service::{
    fallback_questions, select_new_questions, QueryGenerator,
};
use crate::services::topic_service::{TopicExtractor, TopicSet};

/// Drives the retrieve / extract / merge loop for one company at a time
pub struct ResearchService {
    news: Arc<NewsService>,
    queries: QueryGenerator,
    extractor: TopicExtractor,
    ranker: ImpactRanker,
    config: ResearchConfig,
}

struct Retrieval {
    documents: Vec<RetrievedDocument>,
    succeeded: usize,
}

impl ResearchService {
    pub fn new(news: Arc<NewsService>, llm: Arc<LlmService>, config: ResearchConfig) -> Self {
        Self {
            news,
            queries: QueryGenerator::new(llm.clone()),
            extractor: TopicExtractor::new(llm.clone()),
            ranker: ImpactRanker::new(llm),
            config,
        }
    }

    /// Run the pipeline to completion.
    ///
    /// Only invalid input is an error. Once the run has started every
    /// retrieval and LLM failure is recorded on the report and the best
    /// topic list accumulated so far is returned.
    pub async fn run(&self, request: &ResearchRequest) -> Result<ResearchReport, ResearchError> {
        request.validate().map_err(ResearchError::ConfigurationError)?;

        let max_iterations = request.max_iterations.unwrap_or(self.config.max_iterations);
        let max_questions = request
            .max_questions_per_iteration
            .unwrap_or(self.config.max_questions_per_iteration);
        if max_iterations == 0 || max_questions == 0 {
            return Err(ResearchError::ConfigurationError(
                "iteration and question limits must be at least 1".to_string(),
            ));
        }

        let profile = request.profile();
        let mut run = PipelineRun::new(profile.clone());
        info!(
            "Starting research run {} for {} (max {} iterations, {} questions each)",
            run.id, profile.name, max_iterations, max_questions
        );

        let mut pending = self
            .prepare_seeds(&mut run, request.seed_questions.as_deref(), max_questions)
            .await;
        if pending.is_empty() {
            return Err(ResearchError::ConfigurationError(
                "no seed questions available".to_string(),
            ));
        }

        run.transition(RunState::Iterating)?;
        let mut topics = TopicSet::new(self.config.similarity_threshold);
        let mut processed_urls: HashSet<String> = HashSet::new();

        let termination = loop {
            run.iterations += 1;
            let iteration = run.iterations;
            info!(
                "Iteration {}/{} for {}: {} queries",
                iteration,
                max_iterations,
                profile.name,
                pending.len()
            );
            run.queries_issued.extend(pending.iter().cloned());

            let retrieval = self.retrieve(&mut run, &pending).await;
            if retrieval.succeeded == 0 {
                warn!("Every retrieval failed in iteration {}", iteration);
                break Termination::AllQueriesFailed;
            }

            let fresh: Vec<RetrievedDocument> = dedupe_by_url(retrieval.documents)
                .into_iter()
                .filter(|doc| processed_urls.insert(normalize_url(&doc.url)))
                .collect();

            let Some(extracted) = self.extract(&mut run, &profile, &fresh, iteration).await else {
                warn!("Every extraction batch failed in iteration {}", iteration);
                break Termination::AllQueriesFailed;
            };

            let added = topics.merge_all(extracted);
            info!(
                "Iteration {} finished: {} new documents, {} new topics, {} total",
                iteration,
                fresh.len(),
                added,
                topics.len()
            );

            if added == 0 {
                break Termination::Converged;
            }
            if iteration >= max_iterations {
                break Termination::BudgetExhausted;
            }

            let follow_ups = self
                .queries
                .follow_up_questions(&profile, topics.topics(), &run.queries_issued, max_questions)
                .await;
            match follow_ups {
                Ok(questions) if !questions.is_empty() => pending = questions,
                Ok(_) => {
                    info!("No new questions to explore after iteration {}", iteration);
                    break Termination::Converged;
                }
                Err(e) => {
                    warn!("Follow-up question generation failed: {}", e);
                    run.record_failure(ResearchError::llm("query_generation", &e));
                    break Termination::Converged;
                }
            }
        };

        run.topics = topics.into_topics();
        let ranked = self.rank_all(&mut run).await;
        run.finish(termination)?;

        info!(
            "Research run {} for {} finished: {} after {} iterations, {} topics, {} failures",
            run.id,
            profile.name,
            termination.as_str(),
            run.iterations,
            ranked.len(),
            run.failures.len()
        );

        Ok(ResearchReport {
            run_id: run.id,
            company: profile.name,
            ticker: profile.ticker,
            iterations: run.iterations,
            termination,
            topics: ranked,
            queries: run.queries_issued,
            failures: run.failures,
            started_at: run.started_at,
            finished_at: Utc::now(),
        })
    }

    /// Explicit seeds are used as given (blank-free, de-duplicated). Without
    /// them the generator is asked, then the templated fallback is used.
    async fn prepare_seeds(
        &self,
        run: &mut PipelineRun,
        explicit: Option<&[String]>,
        limit: usize,
    ) -> Vec<String> {
        if let Some(seeds) = explicit.filter(|s| !s.is_empty()) {
            return select_new_questions(seeds.to_vec(), &[], usize::MAX);
        }

        let generated = self.queries.initial_questions(&run.profile, limit).await;
        match generated {
            Ok(questions) if !questions.is_empty() => questions,
            Ok(_) => {
                warn!("Query generator returned no seeds; using fallback questions");
                fallback_questions(&run.profile, limit)
            }
            Err(e) => {
                warn!("Seed generation failed, using fallback questions: {}", e);
                run.record_failure(ResearchError::llm("query_generation", &e));
                fallback_questions(&run.profile, limit)
            }
        }
    }

    async fn retrieve(&self, run: &mut PipelineRun, queries: &[String]) -> Retrieval {
        let concurrency = self.config.retrieval_concurrency.max(1);
        let results: Vec<(String, Result<Vec<RetrievedDocument>, SearchError>)> =
            stream::iter(queries.iter().cloned())
                .map(|query| async move {
                    let result = self.news.search(&self.news.default_query(&query)).await;
                    (query, result)
                })
                .buffered(concurrency)
                .collect()
                .await;

        let mut retrieval = Retrieval {
            documents: Vec::new(),
            succeeded: 0,
        };
        for (query, result) in results {
            match result {
                Ok(documents) => {
                    info!("Retrieved {} documents for '{}'", documents.len(), query);
                    retrieval.succeeded += 1;
                    retrieval.documents.extend(documents);
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!("Skipping query '{}' after transient failure: {}", query, e);
                    } else {
                        tracing::error!("Skipping query '{}': {}", query, e);
                    }
                    run.record_failure(ResearchError::retrieval(&query, &e));
                }
            }
        }
        retrieval
    }

    /// `None` when at least one batch was attempted and all of them failed
    async fn extract(
        &self,
        run: &mut PipelineRun,
        profile: &CompanyProfile,
        documents: &[RetrievedDocument],
        iteration: usize,
    ) -> Option<Vec<Topic>> {
        let batch_size = self.config.extraction_batch_size.max(1);
        let mut topics = Vec::new();
        let mut attempted = 0;
        let mut failed = 0;

        for batch in documents.chunks(batch_size) {
            attempted += 1;
            let result = self.extractor.extract(profile, batch, iteration).await;
            match result {
                Ok(extracted) => topics.extend(extracted),
                Err(e) => {
                    warn!("Skipping extraction batch of {} documents: {}", batch.len(), e);
                    failed += 1;
                    run.record_failure(ResearchError::llm("topic_extraction", &e));
                }
            }
        }

        if attempted > 0 && failed == attempted {
            None
        } else {
            Some(topics)
        }
    }

    async fn rank_all(&self, run: &mut PipelineRun) -> Vec<RankedTopic> {
        let mut ranked = Vec::with_capacity(run.topics.len());
        let mut failures = Vec::new();

        for topic in &run.topics {
            let result = self.ranker.rank(topic, &run.profile).await;
            match result {
                Ok(assessment) => ranked.push(RankedTopic::new(topic.clone(), Some(assessment))),
                Err(e) => {
                    warn!("Impact ranking failed for '{}': {}", topic.name, e);
                    failures.push(ResearchError::llm(format!("impact_ranking: {}", topic.name), &e));
                    ranked.push(RankedTopic::new(topic.clone(), None));
                }
            }
        }

        for failure in failures {
            run.record_failure(failure);
        }
        ranked.sort_by(rank_order);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LlmError;
    use crate::services::llm_service::testing::{self as llm_testing, FakeLlm};
    use crate::services::llm_service::{CompletionRequest, LlmTask};
    use crate::services::news_service::testing::{doc, FakeSearch};
    use crate::services::topic_service::normalize_name;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One topic per document in the prompt, named after the document title.
    /// Descriptions stay empty so only names decide merging.
    fn topics_from_prompt(request: &CompletionRequest) -> String {
        let topics: Vec<serde_json::Value> = request
            .prompt
            .lines()
            .filter_map(|line| line.strip_prefix('['))
            .filter_map(|rest| rest.split_once("] "))
            .filter_map(|(idx, title)| idx.parse::<usize>().ok().map(|i| (i, title)))
            .map(|(i, title)| {
                json!({
                    "name": title,
                    "description": "",
                    "business_impact": "material",
                    "urgency": "medium",
                    "confidence": 0.7,
                    "document_indices": [i]
                })
            })
            .collect();
        json!({ "topics": topics }).to_string()
    }

    fn ranking_json() -> String {
        r#"{"financial": 1.4, "operational": 0.5, "strategic": -1.0, "urgency": 0.25, "reasoning": "ok"}"#
            .to_string()
    }

    /// LLM that extracts, ranks, and proposes `follow_up` for follow-ups
    fn scripted_llm(follow_up: fn(usize) -> Result<String, LlmError>) -> Arc<FakeLlm> {
        let counter = Arc::new(AtomicUsize::new(0));
        Arc::new(FakeLlm::new(move |request| match request.task {
            LlmTask::TopicExtraction => Ok(topics_from_prompt(request)),
            LlmTask::ImpactRanking => Ok(ranking_json()),
            LlmTask::QueryGeneration => follow_up(counter.fetch_add(1, Ordering::SeqCst)),
        }))
    }

    /// Every query yields one document whose title and URL derive from the query
    fn unique_search() -> Arc<FakeSearch> {
        Arc::new(FakeSearch::new(|query| {
            let slug = query.replace(' ', "-");
            Ok(vec![doc(
                &format!("Story about {}", query),
                &format!("https://news.example/{}", slug),
                "body",
            )])
        }))
    }

    fn service(search: Arc<FakeSearch>, llm: Arc<FakeLlm>, config: ResearchConfig) -> ResearchService {
        let news = Arc::new(NewsService::new(search, &config));
        ResearchService::new(news, llm_testing::service(llm), config)
    }

    fn request(seeds: &[&str], max_iterations: usize) -> ResearchRequest {
        ResearchRequest {
            company: "Acme".to_string(),
            seed_questions: Some(seeds.iter().map(|s| s.to_string()).collect()),
            max_iterations: Some(max_iterations),
            ..Default::default()
        }
    }

    fn numbered_follow_up(n: usize) -> Result<String, LlmError> {
        Ok(json!({ "questions": [format!("acme follow up {}", n)] }).to_string())
    }

    #[tokio::test]
    async fn test_single_iteration_retrieves_exactly_the_seeds() {
        let search = unique_search();
        let llm = scripted_llm(numbered_follow_up);
        let svc = service(search.clone(), llm.clone(), ResearchConfig::default());

        let seeds = ["acme earnings", "acme recall", "acme ceo", "acme lawsuit"];
        let report = svc.run(&request(&seeds, 1)).await.unwrap();

        assert_eq!(search.query_texts(), seeds);
        assert!(llm.calls_for(LlmTask::QueryGeneration).is_empty());
        assert_eq!(report.iterations, 1);
        assert_eq!(report.termination, Termination::BudgetExhausted);
        assert_eq!(report.topics.len(), 4);
    }

    #[tokio::test]
    async fn test_every_retrieval_failing_ends_all_queries_failed() {
        let search = Arc::new(FakeSearch::new(|_| Err(SearchError::Timeout)));
        let llm = scripted_llm(numbered_follow_up);
        let svc = service(search, llm.clone(), ResearchConfig::default());

        let report = svc.run(&request(&["a", "b"], 3)).await.unwrap();

        assert_eq!(report.termination, Termination::AllQueriesFailed);
        assert!(report.topics.is_empty());
        assert_eq!(report.iterations, 1);
        assert_eq!(report.failures.len(), 2);
        assert!(matches!(
            &report.failures[0],
            ResearchError::TransientRetrievalFailure { transient: true, .. }
        ));
        assert!(llm.calls_for(LlmTask::TopicExtraction).is_empty());
    }

    #[tokio::test]
    async fn test_one_failed_query_is_skipped() {
        let search = Arc::new(FakeSearch::new(|query| {
            if query == "broken" {
                Err(SearchError::Unauthorized)
            } else {
                Ok(vec![doc("Acme recall", "https://news.example/recall", "body")])
            }
        }));
        let svc = service(search, scripted_llm(numbered_follow_up), ResearchConfig::default());

        let report = svc.run(&request(&["broken", "acme recall"], 1)).await.unwrap();

        assert_eq!(report.termination, Termination::BudgetExhausted);
        assert_eq!(report.topics.len(), 1);
        assert!(matches!(
            &report.failures[0],
            ResearchError::TransientRetrievalFailure { transient: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_converges_when_nothing_new_is_found() {
        let search = Arc::new(FakeSearch::new(|_| {
            Ok(vec![doc("Acme recall", "https://news.example/recall", "body")])
        }));
        let svc = service(search.clone(), scripted_llm(numbered_follow_up), ResearchConfig::default());

        let report = svc.run(&request(&["acme recall"], 5)).await.unwrap();

        assert_eq!(report.termination, Termination::Converged);
        assert_eq!(report.iterations, 2);
        assert_eq!(report.topics.len(), 1);
        assert_eq!(search.query_texts(), vec!["acme recall", "acme follow up 0"]);
    }

    #[tokio::test]
    async fn test_budget_exhausted_after_max_iterations() {
        let search = unique_search();
        let llm = scripted_llm(numbered_follow_up);
        let svc = service(search.clone(), llm.clone(), ResearchConfig::default());

        let report = svc.run(&request(&["acme recall"], 3)).await.unwrap();

        assert_eq!(report.termination, Termination::BudgetExhausted);
        assert_eq!(report.iterations, 3);
        assert_eq!(report.queries.len(), 3);
        assert_eq!(llm.calls_for(LlmTask::QueryGeneration).len(), 2);
        assert_eq!(report.topics.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_follow_up_generation_converges() {
        fn failing(_: usize) -> Result<String, LlmError> {
            Err(LlmError::Timeout)
        }
        let svc = service(unique_search(), scripted_llm(failing), ResearchConfig::default());

        let report = svc.run(&request(&["acme recall"], 4)).await.unwrap();

        assert_eq!(report.termination, Termination::Converged);
        assert_eq!(report.iterations, 1);
        assert!(matches!(
            &report.failures[0],
            ResearchError::LlmCallFailure { stage, .. } if stage == "query_generation"
        ));
    }

    #[tokio::test]
    async fn test_topics_are_unique_and_scores_clamped() {
        let search = Arc::new(FakeSearch::new(|_| {
            Ok(vec![
                doc("Acme Recall", "https://a.example/1", "outlet a"),
                doc("acme recall", "https://b.example/1", "outlet b"),
                doc("Guidance cut", "https://c.example/1", "outlet c"),
            ])
        }));
        let svc = service(search, scripted_llm(numbered_follow_up), ResearchConfig::default());

        let report = svc.run(&request(&["acme news"], 1)).await.unwrap();

        let names: HashSet<String> = report
            .topics
            .iter()
            .map(|t| normalize_name(&t.topic.name))
            .collect();
        assert_eq!(names.len(), report.topics.len());
        assert_eq!(report.topics.len(), 2);

        for ranked in &report.topics {
            let impact = ranked.impact.unwrap();
            for v in [impact.financial, impact.operational, impact.strategic, impact.urgency] {
                assert!((0.0..=1.0).contains(&v));
            }
        }
        let recall = report
            .topics
            .iter()
            .find(|t| normalize_name(&t.topic.name) == "acme recall")
            .unwrap();
        assert_eq!(recall.topic.sources.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_ranking_leaves_impact_empty() {
        let llm = Arc::new(FakeLlm::new(|request| match request.task {
            LlmTask::TopicExtraction => Ok(topics_from_prompt(request)),
            LlmTask::ImpactRanking if request.prompt.contains("TOPIC: Story about bad") => {
                Err(LlmError::InvalidResponse("garbage".to_string()))
            }
            LlmTask::ImpactRanking => Ok(ranking_json()),
            LlmTask::QueryGeneration => Ok(r#"{"questions": []}"#.to_string()),
        }));
        let svc = service(unique_search(), llm, ResearchConfig::default());

        let report = svc.run(&request(&["good", "bad"], 1)).await.unwrap();

        assert_eq!(report.topics.len(), 2);
        assert!(report.topics[0].impact.is_some());
        assert!(report.topics[1].impact.is_none());
        assert_eq!(report.topics[1].topic.name, "Story about bad");
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_every_extraction_batch_failing_ends_all_queries_failed() {
        let llm = Arc::new(FakeLlm::new(|request| match request.task {
            LlmTask::TopicExtraction => Err(LlmError::RateLimited),
            _ => Ok(ranking_json()),
        }));
        let config = ResearchConfig {
            extraction_batch_size: 1,
            ..Default::default()
        };
        let svc = service(unique_search(), llm.clone(), config);

        let report = svc.run(&request(&["a", "b", "c"], 3)).await.unwrap();

        assert_eq!(report.termination, Termination::AllQueriesFailed);
        assert_eq!(llm.calls_for(LlmTask::TopicExtraction).len(), 3);
        assert_eq!(report.failures.len(), 3);
    }

    #[tokio::test]
    async fn test_generated_seeds_fall_back_to_templates() {
        fn failing(_: usize) -> Result<String, LlmError> {
            Err(LlmError::NetworkError("down".to_string()))
        }
        let search = unique_search();
        let config = ResearchConfig {
            max_questions_per_iteration: 2,
            ..Default::default()
        };
        let svc = service(search.clone(), scripted_llm(failing), config);

        let req = ResearchRequest {
            company: "Acme".to_string(),
            max_iterations: Some(1),
            ..Default::default()
        };
        let report = svc.run(&req).await.unwrap();

        assert_eq!(
            search.query_texts(),
            vec!["Acme latest news", "Acme earnings and guidance"]
        );
        assert_eq!(report.termination, Termination::BudgetExhausted);
    }

    #[tokio::test]
    async fn test_generated_seeds_are_used_when_omitted() {
        fn seeds(_: usize) -> Result<String, LlmError> {
            Ok(r#"{"questions": ["acme q3", "acme layoffs"]}"#.to_string())
        }
        let search = unique_search();
        let svc = service(search.clone(), scripted_llm(seeds), ResearchConfig::default());

        let req = ResearchRequest {
            company: "Acme".to_string(),
            max_iterations: Some(1),
            ..Default::default()
        };
        svc.run(&req).await.unwrap();

        assert_eq!(search.query_texts(), vec!["acme q3", "acme layoffs"]);
    }

    #[tokio::test]
    async fn test_concurrent_retrieval_keeps_results() {
        let config = ResearchConfig {
            retrieval_concurrency: 4,
            ..Default::default()
        };
        let svc = service(unique_search(), scripted_llm(numbered_follow_up), config);

        let report = svc.run(&request(&["a", "b", "c", "d", "e"], 1)).await.unwrap();

        assert_eq!(report.queries, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(report.topics.len(), 5);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let svc = service(unique_search(), scripted_llm(numbered_follow_up), ResearchConfig::default());

        let err = svc.run(&request(&["a"], 0)).await.unwrap_err();
        assert!(matches!(err, ResearchError::ConfigurationError(_)));

        let blank = ResearchRequest::default();
        assert!(svc.run(&blank).await.is_err());
    }
}
