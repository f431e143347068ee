use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single search hit returned by the retriever.
///
/// Immutable once fetched and scoped to the iteration that fetched it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedDocument {
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub relevance_score: f64,
    pub snippet: String,
}

/// The company a pipeline run researches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompanyProfile {
    pub name: String,
    pub ticker: Option<String>,
    pub sector: Option<String>,
    pub description: Option<String>,
}

impl CompanyProfile {
    #[cfg(test)]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ticker: None,
            sector: None,
            description: None,
        }
    }

    /// Multi-line summary used as prompt context
    pub fn as_context(&self) -> String {
        let mut context = format!("Company: {}\n", self.name);
        if let Some(ticker) = &self.ticker {
            context.push_str(&format!("Ticker: {}\n", ticker));
        }
        if let Some(sector) = &self.sector {
            context.push_str(&format!("Sector: {}\n", sector));
        }
        if let Some(description) = &self.description {
            context.push_str(&format!("Description: {}\n", description));
        }
        context
    }
}

/// How soon a topic is likely to matter to the business
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    /// Lenient parse of model output; anything unrecognised is `Medium`
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "low" => Urgency::Low,
            "high" => Urgency::High,
            "critical" | "urgent" => Urgency::Critical,
            _ => Urgency::Medium,
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Urgency::Low => write!(f, "low"),
            Urgency::Medium => write!(f, "medium"),
            Urgency::High => write!(f, "high"),
            Urgency::Critical => write!(f, "critical"),
        }
    }
}

/// A named cluster of findings about the company
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    pub name: String,
    pub description: String,
    pub business_impact: String,
    pub urgency: Urgency,
    pub confidence: f64,
    /// URLs of the documents this topic was drawn from, sorted and unique
    pub sources: Vec<String>,
    pub first_seen_iteration: usize,
    pub last_seen_iteration: usize,
}

/// Four-dimension impact rating, each dimension in [0.0, 1.0]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ImpactScore {
    pub financial: f64,
    pub operational: f64,
    pub strategic: f64,
    pub urgency: f64,
}

impl ImpactScore {
    /// Build a score, clamping every dimension into [0, 1].
    /// Non-finite values are treated as 0.
    pub fn clamped(financial: f64, operational: f64, strategic: f64, urgency: f64) -> Self {
        Self {
            financial: clamp_unit(financial),
            operational: clamp_unit(operational),
            strategic: clamp_unit(strategic),
            urgency: clamp_unit(urgency),
        }
    }

    pub fn composite(&self) -> f64 {
        (self.financial + self.operational + self.strategic + self.urgency) / 4.0
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// A topic together with its (write-once) impact assessment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedTopic {
    #[serde(flatten)]
    pub topic: Topic,
    pub impact: Option<ImpactScore>,
    pub composite_score: Option<f64>,
    pub reasoning: Option<String>,
}

impl RankedTopic {
    pub fn new(topic: Topic, assessment: Option<(ImpactScore, String)>) -> Self {
        match assessment {
            Some((impact, reasoning)) => Self {
                topic,
                composite_score: Some(impact.composite()),
                impact: Some(impact),
                reasoning: Some(reasoning),
            },
            None => Self {
                topic,
                impact: None,
                composite_score: None,
                reasoning: None,
            },
        }
    }
}

/// Highest composite first, unscored topics last, then by name
pub fn rank_order(a: &RankedTopic, b: &RankedTopic) -> Ordering {
    match (a.composite_score, b.composite_score) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.topic.name.to_lowercase().cmp(&b.topic.name.to_lowercase()))
}
