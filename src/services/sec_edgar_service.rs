use std::sync::LazyLock;
use std::time::Duration as StdDuration;

use chrono::{Duration, NaiveDate, Utc};
use regex::Regex;
use reqwest::Client;
use tracing::{info, warn};
use url::Url;

use crate::errors::AppError;
use crate::models::{FilingType, SecFiling};

const EDGAR_BROWSE_URL: &str = "https://www.sec.gov/cgi-bin/browse-edgar";
const MAX_FEED_ENTRIES: usize = 40;
const MAX_EXHIBIT_BYTES: usize = 50_000;
const MAX_SECTION_BYTES: usize = 20_000;
const HEADER_SKIP_BYTES: usize = 10_000;

static ENTRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<entry>(.*?)</entry>").expect("valid entry regex"));
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));
static ACCESSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:accession_number=|/)(\d{10}-\d{2}-\d{6})").expect("valid accession regex")
});

/// Client for SEC EDGAR company filing feeds and filing documents
pub struct SecEdgarService {
    client: Client,
    user_agent: String,
}

impl SecEdgarService {
    /// EDGAR rejects requests without a descriptive User-Agent
    /// (company name and contact email).
    pub fn new(user_agent: impl Into<String>) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .map_err(|e| AppError::External(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            user_agent: user_agent.into(),
        })
    }

    /// Recent filings of one form type for a ticker, newest first
    pub async fn search_filings(
        &self,
        ticker: &str,
        filing_type: FilingType,
        days_back: i64,
        limit: usize,
    ) -> Result<Vec<SecFiling>, AppError> {
        let ticker = ticker.trim().to_uppercase();
        info!(
            "Fetching {} filings for {} (last {} days)",
            filing_type, ticker, days_back
        );

        let count = MAX_FEED_ENTRIES.to_string();
        let response = self
            .client
            .get(EDGAR_BROWSE_URL)
            .query(&[
                ("action", "getcompany"),
                ("CIK", ticker.as_str()),
                ("type", filing_type.edgar_code()),
                ("count", count.as_str()),
                ("output", "atom"),
            ])
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .map_err(|e| AppError::External(format!("Failed to fetch {} filings: {}", filing_type, e)))?;

        if response.status().as_u16() == 429 {
            return Err(AppError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(AppError::External(format!(
                "SEC EDGAR returned status: {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AppError::External(format!("Failed to read response: {}", e)))?;

        let cutoff = Utc::now().date_naive() - Duration::days(days_back);
        let mut filings = parse_edgar_feed(&body, &ticker, filing_type, cutoff);
        filings.sort_by(|a, b| b.filing_date.cmp(&a.filing_date));
        filings.truncate(limit);

        info!("Found {} {} filings for {}", filings.len(), filing_type, ticker);
        Ok(filings)
    }

    /// Download a filing and reduce it to readable text.
    ///
    /// Only `sec.gov` URLs are fetched. Index pages are swapped for the
    /// full-submission `.txt` document.
    pub async fn fetch_filing_content(&self, filing_url: &str) -> Result<String, AppError> {
        let url = validate_sec_url(filing_url)?;
        let content_url = full_text_url(url.as_str());
        info!("Fetching filing content from: {}", content_url);

        let response = self
            .client
            .get(&content_url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .map_err(|e| AppError::External(format!("Failed to fetch filing: {}", e)))?;

        if response.status().as_u16() == 404 {
            return Err(AppError::NotFound);
        }
        if !response.status().is_success() {
            return Err(AppError::External(format!(
                "Filing URL returned status: {}",
                response.status()
            )));
        }

        let content = response
            .text()
            .await
            .map_err(|e| AppError::External(format!("Failed to read filing content: {}", e)))?;

        let text = extract_meaningful_content(&content);
        info!(
            "Reduced filing from {} to {} chars",
            content.len(),
            text.len()
        );
        Ok(text)
    }
}

/// Parse the EDGAR company-browse Atom feed, dropping entries filed before `cutoff`
pub fn parse_edgar_feed(
    feed_xml: &str,
    ticker: &str,
    filing_type: FilingType,
    cutoff: NaiveDate,
) -> Vec<SecFiling> {
    let mut filings = Vec::new();

    for entry_cap in ENTRY_RE.captures_iter(feed_xml) {
        let entry = &entry_cap[1];

        let Some(filing_date) = extract_xml_tag(entry, "filing-date")
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok())
        else {
            warn!("Skipping EDGAR entry without a filing date");
            continue;
        };
        if filing_date < cutoff {
            continue;
        }

        let link = extract_xml_attribute(entry, "link", "href").unwrap_or_default();
        let accession_number = extract_xml_tag(entry, "accession-number")
            .or_else(|| extract_accession_from_url(&link))
            .unwrap_or_else(|| "unknown".to_string());
        let description = extract_xml_tag(entry, "form-name")
            .or_else(|| extract_xml_tag(entry, "title"))
            .map(|d| decode_entities(&d));

        filings.push(SecFiling {
            ticker: ticker.to_string(),
            filing_type,
            filing_date,
            accession_number,
            filing_url: link,
            description,
        });
    }

    filings
}

/// Accept only http(s) URLs on `sec.gov` or one of its subdomains
pub fn validate_sec_url(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| AppError::Validation(format!("invalid filing url: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::Validation("filing url must use http or https".to_string()));
    }
    let host = url.host_str().unwrap_or_default().to_lowercase();
    if host != "sec.gov" && !host.ends_with(".sec.gov") {
        return Err(AppError::Validation(format!(
            "filing url host '{}' is not sec.gov",
            host
        )));
    }
    Ok(url)
}

fn full_text_url(url: &str) -> String {
    if url.contains("-index.htm") {
        url.replace("-index.html", ".txt").replace("-index.htm", ".txt")
    } else {
        url.to_string()
    }
}

/// Prefer a press-release exhibit (EX-99), then the Item 2.02 section, then
/// the body after the submission header.
pub fn extract_meaningful_content(content: &str) -> String {
    if let Some(exhibit_start) = content.find("<TYPE>EX-99") {
        if let Some(text_offset) = content[exhibit_start..].find("<TEXT>") {
            let body_start = exhibit_start + text_offset + "<TEXT>".len();
            let remaining = &content[body_start..];
            let end = remaining
                .find("</TEXT>")
                .or_else(|| remaining.find("<DOCUMENT>"))
                .unwrap_or_else(|| floor_boundary(remaining, MAX_EXHIBIT_BYTES));
            return extract_text_from_html(&remaining[..end]);
        }
    }

    if let Some(item_start) = content.find("Item 2.02") {
        let remaining = &content[item_start..];
        let end = floor_boundary(remaining, MAX_SECTION_BYTES);
        return extract_text_from_html(&remaining[..end]);
    }

    let skip = floor_boundary(content, HEADER_SKIP_BYTES);
    let rest = &content[skip..];
    let end = floor_boundary(rest, MAX_SECTION_BYTES);
    extract_text_from_html(&rest[..end])
}

/// Largest char boundary of `s` that is <= `max`
fn floor_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Strip markup, keeping line structure and dropping very short lines
pub fn extract_text_from_html(html: &str) -> String {
    let text = html
        .replace("<br>", "\n")
        .replace("<BR>", "\n")
        .replace("<br/>", "\n")
        .replace("<p>", "\n")
        .replace("<P>", "\n")
        .replace("</p>", "\n")
        .replace("</P>", "\n");
    let text = TAG_RE.replace_all(&text, " ");
    let text = decode_entities(&text);

    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| line.len() > 10)
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&#160;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

fn extract_xml_tag(xml: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"(?s)<{}[^>]*>(.*?)</{}>", regex::escape(tag), regex::escape(tag));
    let re = Regex::new(&pattern).ok()?;
    re.captures(xml)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn extract_xml_attribute(xml: &str, tag: &str, attr: &str) -> Option<String> {
    let pattern = format!(r#"<{}\s[^>]*{}="([^"]+)""#, regex::escape(tag), regex::escape(attr));
    let re = Regex::new(&pattern).ok()?;
    re.captures(xml)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().to_string())
}

fn extract_accession_from_url(url: &str) -> Option<String> {
    ACCESSION_RE
        .captures(url)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().to_string())
}
