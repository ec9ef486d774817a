//! Built-in phase handlers.
//!
//! `robots` reads `/robots.txt`; `catalog`, `faculty` and `syllabi` download
//! the URLs discovery recorded under `<phase>_urls`. Discovery itself is
//! external and stays unconfigured.
//!
//! HTTP goes through a blocking `ureq` agent on tokio's blocking pool.

use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;

use scrapedu_core::url_utils::{host_of, origin_join};
use scrapedu_core::{Entity, Phase, Settings};
use scrapedu_pipeline::{async_trait, Outcome, PhaseContext, PhaseHandler, PhaseRegistry};

/// Largest response body kept in memory.
const MAX_BODY_BYTES: u64 = 50 * 1024 * 1024;

/// Crawl-delays above this are treated as bogus.
const MAX_CRAWL_DELAY_SECS: f64 = 600.0;

/// Registry with the built-in handlers for every phase except discovery.
pub fn build_registry(settings: &Settings) -> PhaseRegistry {
    let client = HttpClient::new(settings);
    let documents: Arc<dyn PhaseHandler> = Arc::new(DocumentFetch::new(client.clone()));
    PhaseRegistry::builder()
        .register(Phase::Robots, Arc::new(RobotsHandler::new(client)))
        .register(Phase::Catalog, Arc::clone(&documents))
        .register(Phase::Faculty, Arc::clone(&documents))
        .register(Phase::Syllabi, documents)
        .build()
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    Status(u16),
    Transport(String),
    Body(String),
    Task(String),
}

impl FetchError {
    pub fn into_outcome(self, url: &str) -> Outcome {
        match self {
            FetchError::Status(code) => classify_status(code, url),
            FetchError::Transport(reason) => Outcome::transient(format!("{url}: {reason}")),
            FetchError::Body(reason) => {
                Outcome::transient(format!("{url}: failed to read body: {reason}"))
            }
            FetchError::Task(reason) => Outcome::permanent(format!("{url}: {reason}")),
        }
    }

    fn is_not_found(&self) -> bool {
        matches!(self, FetchError::Status(404 | 410))
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Status(code) => write!(f, "HTTP {code}"),
            FetchError::Transport(reason) => write!(f, "transport error: {reason}"),
            FetchError::Body(reason) => write!(f, "failed to read body: {reason}"),
            FetchError::Task(reason) => write!(f, "fetch task failed: {reason}"),
        }
    }
}

/// 429 and 5xx are worth retrying; any other 4xx will not change.
pub fn classify_status(code: u16, url: &str) -> Outcome {
    let reason = format!("HTTP {code} from {url}");
    match code {
        429 | 500..=599 => Outcome::transient(reason),
        _ => Outcome::permanent(reason),
    }
}

#[derive(Clone)]
pub struct HttpClient {
    agent: ureq::Agent,
}

impl HttpClient {
    pub fn new(settings: &Settings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .user_agent(&settings.user_agent)
            .timeout_connect(settings.connect_timeout())
            .timeout_read(settings.read_timeout())
            .build();
        Self { agent }
    }

    pub async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let agent = self.agent.clone();
        let target = url.to_string();
        tokio::task::spawn_blocking(move || get_blocking(&agent, &target))
            .await
            .map_err(|e| FetchError::Task(e.to_string()))?
    }
}

fn get_blocking(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>, FetchError> {
    let response = match agent.get(url).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(code, _)) => return Err(FetchError::Status(code)),
        Err(ureq::Error::Transport(t)) => return Err(FetchError::Transport(t.to_string())),
    };
    let mut body = Vec::new();
    response
        .into_reader()
        .take(MAX_BODY_BYTES)
        .read_to_end(&mut body)
        .map_err(|e| FetchError::Body(e.to_string()))?;
    Ok(body)
}

// ---------------------------------------------------------------------------
// robots
// ---------------------------------------------------------------------------

/// What a site's `robots.txt` says, kept for reference. Rules are recorded,
/// not enforced; `status` and `inspect` report downloads that break them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RobotsInfo {
    pub url: String,
    pub exists: bool,
    pub disallow_patterns: Vec<String>,
    pub crawl_delay: Option<f64>,
    pub sitemaps: Vec<String>,
}

impl RobotsInfo {
    pub fn missing(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exists: false,
            disallow_patterns: Vec::new(),
            crawl_delay: None,
            sitemaps: Vec::new(),
        }
    }

    pub fn parse(url: impl Into<String>, content: &str) -> Self {
        let mut info = Self {
            exists: true,
            ..Self::missing(url)
        };
        for line in content.lines() {
            let Some((key, value)) = line.trim().split_once(':') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim().to_ascii_lowercase().as_str() {
                "disallow" => info.disallow_patterns.push(value.to_string()),
                "sitemap" => info.sitemaps.push(value.to_string()),
                "crawl-delay" if info.crawl_delay.is_none() => {
                    info.crawl_delay = value.parse::<f64>().ok();
                }
                _ => {}
            }
        }
        info
    }

    /// Result of fetching `url`. Any failure means "no robots.txt"; failures
    /// other than 404/410 also come back as an error-log message.
    pub fn from_fetch(url: &str, fetched: Result<Vec<u8>, FetchError>) -> (Self, Option<String>) {
        match fetched {
            Ok(body) => (Self::parse(url, &String::from_utf8_lossy(&body)), None),
            Err(err) if err.is_not_found() => (Self::missing(url), None),
            Err(err) => (
                Self::missing(url),
                Some(format!("robots.txt unavailable at {url}: {err}")),
            ),
        }
    }

    /// Crawl-delay as an interval, when it is usable.
    pub fn crawl_interval(&self) -> Option<Duration> {
        let secs = self.crawl_delay?;
        if !secs.is_finite() || secs <= 0.0 || secs > MAX_CRAWL_DELAY_SECS {
            return None;
        }
        Some(Duration::from_secs_f64(secs))
    }
}

pub struct RobotsHandler {
    client: HttpClient,
}

impl RobotsHandler {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PhaseHandler for RobotsHandler {
    async fn execute(&self, entity: &Entity, ctx: &PhaseContext) -> Outcome {
        let Some(url) = origin_join(&entity.url, "/robots.txt") else {
            return Outcome::permanent(format!("invalid site url: {}", entity.url));
        };
        let (info, unavailable) = RobotsInfo::from_fetch(&url, self.client.get(&url).await);
        if let Some(message) = unavailable {
            tracing::info!(slug = %entity.slug, %message, "continuing without robots.txt");
            ctx.log_error(message);
        }

        if let Some(interval) = info.crawl_interval() {
            let host = entity.host();
            if interval > ctx.limiter().min_interval(&host) {
                ctx.limiter().set_min_interval(&host, interval);
                tracing::info!(%host, ?interval, "honouring robots crawl-delay");
            }
        }
        tracing::debug!(
            slug = %entity.slug,
            exists = info.exists,
            disallow = info.disallow_patterns.len(),
            sitemaps = info.sitemaps.len(),
            "robots.txt checked"
        );
        ctx.set_phase_data(json!(info));
        Outcome::Done
    }
}

// ---------------------------------------------------------------------------
// Document downloads
// ---------------------------------------------------------------------------

/// Downloads the URLs discovery listed for the current phase.
pub struct DocumentFetch {
    client: HttpClient,
}

impl DocumentFetch {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

/// `<phase>_urls` from the discovery data, in order, without duplicates.
pub fn discovered_urls(discovery: Option<&serde_json::Value>, phase: Phase) -> Vec<String> {
    let key = format!("{phase}_urls");
    let mut urls: Vec<String> = Vec::new();
    let listed = discovery
        .and_then(|d| d.get(&key))
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str());
    for url in listed {
        let url = url.trim();
        if !url.is_empty() && !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
        }
    }
    urls
}

/// File name for the `index`-th document of a phase: a numeric prefix plus
/// the sanitised last path segment.
pub fn document_file_name(index: usize, url: &str) -> String {
    let segment = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let mut name: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(80)
        .collect();
    if !name.contains('.') || name.starts_with('.') {
        let stem = name.trim_matches(|c| c == '.' || c == '_');
        name = if stem.is_empty() {
            String::from("document.html")
        } else {
            format!("{stem}.html")
        };
    }
    format!("{index:03}-{name}")
}

#[async_trait]
impl PhaseHandler for DocumentFetch {
    async fn execute(&self, entity: &Entity, ctx: &PhaseContext) -> Outcome {
        let phase = ctx.phase();
        let urls = discovered_urls(ctx.phase_data(Phase::Discovery).as_ref(), phase);
        if urls.is_empty() {
            return Outcome::skipped(format!("discovery listed no {phase} urls"));
        }

        let entity_host = entity.host();
        let mut fetched = 0usize;
        let mut known = 0usize;
        let mut failures: Vec<(String, FetchError)> = Vec::new();
        for (index, url) in urls.iter().enumerate() {
            if ctx.is_downloaded(url) {
                known += 1;
                continue;
            }
            // The worker already waited for the entity host's first slot.
            let host = host_of(url).unwrap_or_else(|| entity_host.clone());
            if fetched + failures.len() > 0 || host != entity_host {
                ctx.limiter().acquire(&host).await;
            }
            match self.client.get(url).await {
                Ok(body) => {
                    let name = document_file_name(index, url);
                    if let Err(err) = ctx.save_download(url, &name, body).await {
                        return Outcome::permanent(err.to_string());
                    }
                    fetched += 1;
                }
                Err(err) => {
                    tracing::warn!(slug = %entity.slug, %phase, %url, ?err, "download failed");
                    failures.push((url.clone(), err));
                }
            }
        }

        ctx.set_phase_data(json!({
            "listed": urls.len(),
            "fetched": fetched,
            "already_downloaded": known,
            "failed": failures.iter().map(|(url, _)| url).collect::<Vec<_>>(),
        }));

        // Retrying only refetches what is still missing.
        let mut outcomes: Vec<Outcome> = failures
            .into_iter()
            .map(|(url, err)| err.into_outcome(&url))
            .collect();
        if let Some(pos) = outcomes
            .iter()
            .position(|o| matches!(o, Outcome::Failed { retryable: true, .. }))
        {
            return outcomes.swap_remove(pos);
        }
        if fetched + known == 0 {
            if let Some(first) = outcomes.into_iter().next() {
                return first;
            }
        }
        Outcome::Done
    }
}
