use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::errors::LlmError;
use crate::models::{CompanyProfile, Topic};
use crate::services::llm_service::{LlmService, LlmTask};

const SYSTEM_PROMPT: &str = "You are a financial research analyst. You write short, specific \
news search queries that uncover developments material to a company's business. \
Respond with JSON only.";

#[derive(Debug, Deserialize)]
struct QuestionResponse {
    #[serde(default)]
    questions: Vec<String>,
}

/// Produces search queries for the research loop
pub struct QueryGenerator {
    llm: Arc<LlmService>,
}

impl QueryGenerator {
    pub fn new(llm: Arc<LlmService>) -> Self {
        Self { llm }
    }

    /// Opening queries for a company when the caller supplies none
    pub async fn initial_questions(
        &self,
        profile: &CompanyProfile,
        limit: usize,
    ) -> Result<Vec<String>, LlmError> {
        let prompt = format!(
            r#"{}
Write up to {} distinct news search queries that would surface the most
important recent developments for this company: earnings and guidance,
products, regulation and litigation, leadership, competition and supply chain.

Format your response as valid JSON:
{{"questions": ["query one", "query two"]}}"#,
            profile.as_context(),
            limit
        );

        let request = self.llm.request(LlmTask::QueryGeneration, SYSTEM_PROMPT, prompt);
        let response: QuestionResponse = self.llm.complete_json(&request).await?;
        let questions = select_new_questions(response.questions, &[], limit);
        info!("Generated {} initial questions for {}", questions.len(), profile.name);
        Ok(questions)
    }

    /// Follow-up queries that dig into what the run has found so far.
    ///
    /// Queries already issued in this run are never returned again.
    pub async fn follow_up_questions(
        &self,
        profile: &CompanyProfile,
        topics: &[Topic],
        issued: &[String],
        limit: usize,
    ) -> Result<Vec<String>, LlmError> {
        let findings = if topics.is_empty() {
            "(no topics identified yet)".to_string()
        } else {
            topics
                .iter()
                .map(|t| format!("- {}: {}", t.name, t.description))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let previous = issued
            .iter()
            .map(|q| format!("- {}", q))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            r#"{}
FINDINGS SO FAR:
{}

QUERIES ALREADY SEARCHED:
{}

Write up to {} NEW news search queries that fill gaps in the findings or
verify their business impact. Do not repeat earlier queries. Return an empty
list if the findings already cover the company well.

Format your response as valid JSON:
{{"questions": ["query one", "query two"]}}"#,
            profile.as_context(),
            findings,
            previous,
            limit
        );

        let request = self.llm.request(LlmTask::QueryGeneration, SYSTEM_PROMPT, prompt);
        let response: QuestionResponse = self.llm.complete_json(&request).await?;
        let questions = select_new_questions(response.questions, issued, limit);
        info!("Generated {} follow-up questions for {}", questions.len(), profile.name);
        Ok(questions)
    }
}

/// Deterministic opening queries used when query generation is unavailable
pub fn fallback_questions(profile: &CompanyProfile, limit: usize) -> Vec<String> {
    let subject = match &profile.ticker {
        Some(ticker) => format!("{} ({})", profile.name, ticker),
        None => profile.name.clone(),
    };
    [
        format!("{} latest news", subject),
        format!("{} earnings and guidance", subject),
        format!("{} regulatory and legal developments", subject),
    ]
    .into_iter()
    .take(limit)
    .collect()
}

/// Trim, drop blanks, drop case-insensitive repeats (within the candidates
/// and against `issued`) and cap at `limit`.
pub fn select_new_questions(candidates: Vec<String>, issued: &[String], limit: usize) -> Vec<String> {
    let mut seen: HashSet<String> = issued.iter().map(|q| q.trim().to_lowercase()).collect();
    candidates
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .filter(|q| seen.insert(q.to_lowercase()))
        .take(limit)
        .collect()
}
