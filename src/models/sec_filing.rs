use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// SEC form types the filing search understands
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FilingType {
    #[serde(rename = "8-K")]
    EightK,
    #[serde(rename = "10-K")]
    TenK,
    #[serde(rename = "10-Q")]
    TenQ,
    #[serde(rename = "4")]
    Form4,
}

impl FilingType {
    /// Value of the `type` parameter EDGAR's company browser expects
    pub fn edgar_code(self) -> &'static str {
        match self {
            FilingType::EightK => "8-K",
            FilingType::TenK => "10-K",
            FilingType::TenQ => "10-Q",
            FilingType::Form4 => "4",
        }
    }
}

impl fmt::Display for FilingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.edgar_code())
    }
}

impl FromStr for FilingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace(' ', "").as_str() {
            "8-K" | "8K" => Ok(FilingType::EightK),
            "10-K" | "10K" => Ok(FilingType::TenK),
            "10-Q" | "10Q" => Ok(FilingType::TenQ),
            "4" | "FORM4" => Ok(FilingType::Form4),
            other => Err(format!("unsupported filing type '{}'", other)),
        }
    }
}

/// Raw SEC filing metadata from the EDGAR feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecFiling {
    pub ticker: String,
    pub filing_type: FilingType,
    pub filing_date: NaiveDate,
    pub accession_number: String,
    pub filing_url: String,
    pub description: Option<String>,
}

/// Query parameters for `GET /api/filings/:ticker`
#[derive(Debug, Clone, Deserialize)]
pub struct FilingSearchParams {
    /// Form type (default: 8-K)
    pub form: Option<String>,
    /// Number of days to look back (default: 90)
    pub days: Option<i64>,
    /// Maximum filings to return (default: 20)
    pub limit: Option<usize>,
}

/// Query parameters for `GET /api/filings/content`
#[derive(Debug, Clone, Deserialize)]
pub struct FilingContentParams {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilingContent {
    pub url: String,
    pub text: String,
}
