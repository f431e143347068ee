use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ResearchError;
use crate::models::research::{CompanyProfile, RankedTopic, Topic};

/// Lifecycle of a pipeline run.
///
/// `Seeded -> Iterating -> (Converged | BudgetExhausted | AllQueriesFailed) -> Done`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Seeded,
    Iterating,
    Converged,
    BudgetExhausted,
    AllQueriesFailed,
    Done,
}

impl RunState {
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Seeded, Iterating)
                | (Iterating, Converged)
                | (Iterating, BudgetExhausted)
                | (Iterating, AllQueriesFailed)
                | (Converged, Done)
                | (BudgetExhausted, Done)
                | (AllQueriesFailed, Done)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Seeded => "seeded",
            RunState::Iterating => "iterating",
            RunState::Converged => "converged",
            RunState::BudgetExhausted => "budget_exhausted",
            RunState::AllQueriesFailed => "all_queries_failed",
            RunState::Done => "done",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal run state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RunState,
    pub to: RunState,
}

/// Why a run stopped iterating
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Converged,
    BudgetExhausted,
    AllQueriesFailed,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Termination::Converged => "converged",
            Termination::BudgetExhausted => "budget_exhausted",
            Termination::AllQueriesFailed => "all_queries_failed",
        }
    }
}

impl From<Termination> for RunState {
    fn from(value: Termination) -> Self {
        match value {
            Termination::Converged => RunState::Converged,
            Termination::BudgetExhausted => RunState::BudgetExhausted,
            Termination::AllQueriesFailed => RunState::AllQueriesFailed,
        }
    }
}

/// Everything one research request accumulates.
///
/// Owned exclusively by the orchestrator for the duration of the request.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub id: Uuid,
    pub profile: CompanyProfile,
    pub state: RunState,
    pub iterations: usize,
    pub topics: Vec<Topic>,
    pub queries_issued: Vec<String>,
    pub failures: Vec<ResearchError>,
    pub termination: Option<Termination>,
    pub started_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(profile: CompanyProfile) -> Self {
        Self {
            id: Uuid::new_v4(),
            profile,
            state: RunState::Seeded,
            iterations: 0,
            topics: Vec::new(),
            queries_issued: Vec::new(),
            failures: Vec::new(),
            termination: None,
            started_at: Utc::now(),
        }
    }

    pub fn transition(&mut self, next: RunState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Move from `Iterating` to the terminal reason, then to `Done`.
    pub fn finish(&mut self, termination: Termination) -> Result<(), InvalidTransition> {
        self.transition(termination.into())?;
        self.termination = Some(termination);
        self.transition(RunState::Done)
    }

    pub fn record_failure(&mut self, failure: ResearchError) {
        self.failures.push(failure);
    }
}

/// Response body of a finished pipeline run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResearchReport {
    pub run_id: Uuid,
    pub company: String,
    pub ticker: Option<String>,
    pub iterations: usize,
    pub termination: Termination,
    pub topics: Vec<RankedTopic>,
    pub queries: Vec<String>,
    pub failures: Vec<ResearchError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Inbound body of `POST /api/research`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResearchRequest {
    // Missing company is reported by `validate`, not by the JSON extractor
    #[serde(default)]
    pub company: String,
    pub ticker: Option<String>,
    pub sector: Option<String>,
    pub description: Option<String>,
    pub seed_questions: Option<Vec<String>>,
    pub max_iterations: Option<usize>,
    pub max_questions_per_iteration: Option<usize>,
}

pub const MAX_ITERATIONS_LIMIT: usize = 10;
pub const MAX_QUESTIONS_LIMIT: usize = 10;
pub const MAX_COMPANY_LEN: usize = 200;

impl ResearchRequest {
    pub fn validate(&self) -> Result<(), String> {
        let company = self.company.trim();
        if company.is_empty() {
            return Err("company must not be empty".to_string());
        }
        if company.chars().count() > MAX_COMPANY_LEN {
            return Err(format!("company must be at most {} characters", MAX_COMPANY_LEN));
        }
        if let Some(n) = self.max_iterations {
            if n == 0 || n > MAX_ITERATIONS_LIMIT {
                return Err(format!("max_iterations must be between 1 and {}", MAX_ITERATIONS_LIMIT));
            }
        }
        if let Some(n) = self.max_questions_per_iteration {
            if n == 0 || n > MAX_QUESTIONS_LIMIT {
                return Err(format!(
                    "max_questions_per_iteration must be between 1 and {}",
                    MAX_QUESTIONS_LIMIT
                ));
            }
        }
        if let Some(seeds) = &self.seed_questions {
            if seeds.iter().any(|s| s.trim().is_empty()) {
                return Err("seed_questions must not contain blank entries".to_string());
            }
        }
        Ok(())
    }

    pub fn profile(&self) -> CompanyProfile {
        let clean = |v: &Option<String>| {
            v.as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        CompanyProfile {
            name: self.company.trim().to_string(),
            ticker: clean(&self.ticker).map(|t| t.to_uppercase()),
            sector: clean(&self.sector),
            description: clean(&self.description),
        }
    }
}
