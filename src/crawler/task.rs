use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::cli::config::SiteSettings;
use crate::crawler::errors::ErrorKind;

/// A scrape request as submitted by a producer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(default)]
    pub keyword: Option<String>,

    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub max_pages: Option<u32>,

    #[serde(default)]
    pub priority: Option<i32>,

    #[serde(default, rename = "delay_ms")]
    pub delay_ms: Option<u64>,
}

impl JobSpec {
    pub fn keyword(keyword: &str) -> Self {
        Self {
            keyword: Some(keyword.to_string()),
            ..Self::default()
        }
    }

    pub fn url(url: &str) -> Self {
        Self {
            url: Some(url.to_string()),
            ..Self::default()
        }
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = Some(max_pages);
        self
    }
}

/// Failure recorded on a job before it is rescheduled or finalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// Persisted job payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,

    /// Takes precedence over `keyword`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    pub max_pages: u32,

    pub created_at: DateTime<Utc>,

    /// Lower value is claimed first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(default, rename = "delay_ms", skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl Job {
    /// Validate a spec and fill in defaults. Returns a description of the
    /// problem when the spec names no target.
    pub fn from_spec(spec: &JobSpec, default_max_pages: u32) -> std::result::Result<Self, String> {
        let keyword = non_blank(&spec.keyword);
        let url = non_blank(&spec.url);

        if keyword.is_none() && url.is_none() {
            return Err("a job needs a keyword or a url".to_string());
        }
        if let Some(url) = &url {
            let parsed = Url::parse(url).map_err(|e| format!("invalid url {}: {}", url, e))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(format!("unsupported url scheme: {}", parsed.scheme()));
            }
        }

        let max_pages = spec.max_pages.unwrap_or(default_max_pages);
        if max_pages == 0 {
            return Err("maxPages must be at least 1".to_string());
        }

        Ok(Self {
            keyword,
            url,
            max_pages,
            created_at: Utc::now(),
            priority: spec.priority,
            delay_ms: spec.delay_ms,
            last_error: None,
        })
    }

    /// The single URL this job navigates to first
    pub fn target_url(&self, site: &SiteSettings) -> Result<String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }

        let keyword = self.keyword.as_deref().context("Job has neither url nor keyword")?;
        let base = Url::parse(&site.base_url)
            .context(format!("Invalid site base URL: {}", site.base_url))?;
        let mut url = base.join(&site.search_path)
            .context(format!("Invalid search path: {}", site.search_path))?;
        url.query_pairs_mut().append_pair(&site.search_param, keyword);

        Ok(url.to_string())
    }

    /// Short human-readable description for logs
    pub fn label(&self) -> String {
        match (&self.url, &self.keyword) {
            (Some(url), _) => url.clone(),
            (None, Some(keyword)) => format!("\"{}\"", keyword),
            (None, None) => "<empty job>".to_string(),
        }
    }
}

/// Payload stored on a completed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeResult {
    pub success: bool,
    pub keyword: Option<String>,
    pub url: String,
    pub total_products: usize,
    pub pages_scraped: u32,
    pub duration_ms: u64,
    pub scraped_at: DateTime<Utc>,
    pub products: Vec<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn job(keyword: Option<&str>, url: Option<&str>, last_error: Option<LastError>) -> Job {
        Job {
            keyword: keyword.map(str::to_string),
            url: url.map(str::to_string),
            max_pages: 3,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            priority: Some(5),
            delay_ms: None,
            last_error,
        }
    }

    #[test]
    fn wire_shape_round_trips_for_optional_combinations() {
        let error = LastError {
            kind: ErrorKind::RateLimited,
            message: "HTTP 429".to_string(),
            attempt: 2,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 0).unwrap(),
        };
        let cases = vec![
            job(Some("iphone 15"), None, None),
            job(None, Some("https://shop.example.com/c/phones"), None),
            job(Some("ps5"), None, Some(error.clone())),
            job(None, Some("https://shop.example.com/c/tv"), Some(error)),
        ];

        for original in cases {
            let encoded = serde_json::to_string(&original).unwrap();
            let decoded: Job = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn wire_field_names() {
        let mut with_delay = job(Some("ps5"), None, None);
        with_delay.delay_ms = Some(2_000);
        let value = serde_json::to_value(&with_delay).unwrap();
        assert_eq!(value["maxPages"], json!(3));
        assert_eq!(value["delay_ms"], json!(2_000));
        assert!(value.get("createdAt").is_some());
        assert!(value.get("url").is_none());
        assert!(value.get("lastError").is_none());
    }

    #[test]
    fn specs_need_a_target() {
        assert!(Job::from_spec(&JobSpec::default(), 1).is_err());
        assert!(Job::from_spec(&JobSpec::keyword("   "), 1).is_err());
        assert!(Job::from_spec(&JobSpec::url("ftp://shop.example.com"), 1).is_err());
        assert!(Job::from_spec(&JobSpec::keyword("tv").with_max_pages(0), 1).is_err());

        let job = Job::from_spec(&JobSpec::keyword(" tv "), 4).unwrap();
        assert_eq!(job.keyword.as_deref(), Some("tv"));
        assert_eq!(job.max_pages, 4);
    }

    #[test]
    fn url_takes_precedence_over_keyword() {
        let site = SiteSettings::default();
        let both = job(Some("iphone 15"), Some("https://shop.example.com/deals"), None);
        assert_eq!(both.target_url(&site).unwrap(), "https://shop.example.com/deals");

        let keyword_only = job(Some("iphone 15"), None, None);
        assert_eq!(
            keyword_only.target_url(&site).unwrap(),
            "https://shop.example.com/search?q=iphone+15"
        );
    }
}
