use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::errors::LlmError;
use crate::models::{CompanyProfile, ImpactScore, Topic};
use crate::services::llm_service::{LlmService, LlmTask};

const SYSTEM_PROMPT: &str = "You are an equity research analyst who rates how strongly a news \
topic affects a company. Every score is a number between 0.0 and 1.0. Respond with JSON only.";

#[derive(Debug, Deserialize)]
struct RankingResponse {
    #[serde(default)]
    financial: f64,
    #[serde(default)]
    operational: f64,
    #[serde(default)]
    strategic: f64,
    #[serde(default)]
    urgency: f64,
    #[serde(default)]
    reasoning: String,
}

/// Scores topics along the four impact dimensions
pub struct ImpactRanker {
    llm: Arc<LlmService>,
}

impl ImpactRanker {
    pub fn new(llm: Arc<LlmService>) -> Self {
        Self { llm }
    }

    /// Rate one topic. Out-of-range scores are clamped, never rejected;
    /// the reasoning text is returned as the model wrote it.
    pub async fn rank(
        &self,
        topic: &Topic,
        profile: &CompanyProfile,
    ) -> Result<(ImpactScore, String), LlmError> {
        let prompt = format!(
            r#"{}
TOPIC: {}
DESCRIPTION: {}
BUSINESS IMPACT: {}
URGENCY LABEL: {}
SUPPORTING SOURCES: {}

Rate the impact of this topic on the company from 0.0 (none) to 1.0 (severe):
- financial: revenue, margins, cash flow, valuation
- operational: production, supply chain, workforce
- strategic: market position, competition, long-term direction
- urgency: how soon the company must respond

Format your response as valid JSON:
{{
  "financial": 0.0,
  "operational": 0.0,
  "strategic": 0.0,
  "urgency": 0.0,
  "reasoning": "2-3 sentences explaining the scores"
}}"#,
            profile.as_context(),
            topic.name,
            topic.description,
            topic.business_impact,
            topic.urgency,
            topic.sources.len()
        );

        let request = self.llm.request(LlmTask::ImpactRanking, SYSTEM_PROMPT, prompt);
        let response: RankingResponse = self.llm.complete_json(&request).await?;

        let score = ImpactScore::clamped(
            response.financial,
            response.operational,
            response.strategic,
            response.urgency,
        );
        debug!("Ranked '{}' with composite {:.2}", topic.name, score.composite());
        Ok((score, response.reasoning))
    }
}
