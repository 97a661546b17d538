//! Web crawling: seed classification, fetch workers, filtering.
//!
//! Given one seed URL the crawler produces a lazy stream of `{url, markdown, title}`
//! records over a bounded channel, so a slow consumer naturally throttles the fetchers.
//! Seeds are classified by shape: `sitemap.xml` enumerates its `<loc>` entries,
//! `llms-full.txt` is downloaded once and handed over whole, `llms.txt`-style link
//! collections crawl their listed targets, and anything else is crawled recursively up to
//! `max_depth` while staying on the seed's registered domain.
//!
//! Every candidate URL passes the SSRF guard and the include/exclude glob filter before it
//! is fetched. Per-URL failures abort that URL only, never the job.

/// Stealth fetch profile.
pub mod stealth;
/// URL validation, glob filtering and link extraction.
pub mod urls;

use crate::crawler::urls::{
    UrlFilter, extract_markdown_links, looks_like_link_collection, parse_sitemap,
    same_registered_domain, sanitize_glob_patterns, validate_url_against_ssrf,
};
use rand::Rng;
use reqwest::{Client, StatusCode};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Errors raised while crawling.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Bad input: dangerous URL, hostile glob pattern, unparsable seed.
    #[error("{0}")]
    Validation(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// A URL kept failing after its retry budget.
    #[error("Failed to fetch {url}: {reason}")]
    Fetch {
        /// URL that failed.
        url: String,
        /// Final failure description.
        reason: String,
    },
}

/// Per-URL retry attempts.
const MAX_ATTEMPTS: u32 = 3;

/// First backoff step; doubles per attempt with added jitter.
const BACKOFF_BASE_MS: u64 = 250;

/// Standard fetch timeout.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-wide cap on simultaneous fetches across all crawl jobs.
const GLOBAL_FETCH_LIMIT: usize = 32;

/// Capacity of the page channel handed to the consumer.
pub const CRAWL_CHANNEL_CAPACITY: usize = 16;

fn global_fetch_permits() -> Arc<Semaphore> {
    static PERMITS: OnceLock<Arc<Semaphore>> = OnceLock::new();
    PERMITS
        .get_or_init(|| Arc::new(Semaphore::new(GLOBAL_FETCH_LIMIT)))
        .clone()
}

/// Crawl tuning supplied per job.
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    /// Recursion depth for plain page seeds.
    pub max_depth: usize,
    /// In-flight fetches for this job.
    pub concurrency: usize,
    /// Include glob patterns (URL paths); empty means everything.
    pub include_patterns: Vec<String>,
    /// Exclude glob patterns; exclude beats include.
    pub exclude_patterns: Vec<String>,
    /// Browser-like fetch profile with humanised pacing.
    pub stealth: bool,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            max_depth: 2,
            concurrency: 3,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            stealth: false,
        }
    }
}

/// One fetched and converted document.
#[derive(Debug, Clone)]
pub struct CrawledPage {
    /// Final URL of the document.
    pub url: String,
    /// Markdown content (converted from HTML when needed).
    pub markdown: String,
    /// Page title, falling back to the last path segment.
    pub title: String,
}

/// Messages emitted while a crawl runs.
#[derive(Debug)]
pub enum CrawlEvent {
    /// Cumulative count of URLs known so far; re-sent as recursion discovers more.
    Discovered(usize),
    /// A completed page, in completion order.
    Page(CrawledPage),
}

/// Outcome counters for one crawl.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrawlStats {
    /// Pages fetched and delivered.
    pub fetched: usize,
    /// URLs that failed after retries.
    pub failed: usize,
    /// Whether the crawl stopped on cancellation.
    pub cancelled: bool,
}

/// Shape of a seed URL, driving the crawl strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedKind {
    /// XML sitemap enumerating page URLs.
    Sitemap,
    /// Single-file documentation digest; no crawling beyond the download.
    LlmsFull,
    /// Markdown link collection whose targets are crawled.
    LinkCollection,
    /// Ordinary page crawled recursively.
    Page,
}

/// Classify a seed by its filename conventions.
pub fn classify_seed(url: &str) -> SeedKind {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.ends_with("sitemap.xml") {
        SeedKind::Sitemap
    } else if path.ends_with("llms-full.txt") {
        SeedKind::LlmsFull
    } else if path.ends_with("llms.txt") {
        SeedKind::LinkCollection
    } else {
        SeedKind::Page
    }
}

/// Fetching crawler for one ingest job.
pub struct Crawler {
    http: Client,
    options: CrawlOptions,
    filter: UrlFilter,
}

impl Crawler {
    /// Build a crawler, sanitising the glob patterns up front.
    pub fn new(options: CrawlOptions) -> Result<Self, CrawlError> {
        let include = sanitize_glob_patterns(&options.include_patterns)?;
        let exclude = sanitize_glob_patterns(&options.exclude_patterns)?;
        let filter = UrlFilter::new(&include, &exclude)?;

        let timeout = if options.stealth {
            stealth::STEALTH_TIMEOUT
        } else {
            FETCH_TIMEOUT
        };
        let http = Client::builder()
            .user_agent("archon-crawler/0.3")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            options,
            filter,
        })
    }

    /// Download one URL's raw body (SSRF-guarded, with retries).
    pub async fn fetch_text(&self, raw_url: &str) -> Result<String, CrawlError> {
        let url = validate_url_against_ssrf(raw_url).await?;
        let fetched = fetch_with_retry(&self.http, &url, self.options.stealth).await?;
        Ok(fetched.body)
    }

    /// Run a crawl, streaming [`CrawlEvent`]s into `events`.
    ///
    /// Pages arrive in completion order. Cancellation is observed between fetches; pages
    /// already delivered stay delivered.
    pub async fn crawl(
        &self,
        seed: &str,
        events: mpsc::Sender<CrawlEvent>,
        cancel: CancellationToken,
    ) -> Result<CrawlStats, CrawlError> {
        let seed_url = validate_url_against_ssrf(seed).await?;

        match classify_seed(seed) {
            SeedKind::Sitemap => {
                let body = self.fetch_text(seed).await?;
                let candidates = parse_sitemap(&body)?;
                let targets = self.screen_candidates(&seed_url, candidates, false).await;
                let _ = events.send(CrawlEvent::Discovered(targets.len())).await;
                self.fetch_set(targets, &events, &cancel, None).await
            }
            SeedKind::LlmsFull => {
                let body = self.fetch_text(seed).await?;
                let _ = events.send(CrawlEvent::Discovered(1)).await;
                let page = CrawledPage {
                    url: seed.to_string(),
                    title: last_path_segment(&seed_url),
                    markdown: body,
                };
                let delivered = events.send(CrawlEvent::Page(page)).await.is_ok();
                Ok(CrawlStats {
                    fetched: usize::from(delivered),
                    failed: 0,
                    cancelled: cancel.is_cancelled(),
                })
            }
            SeedKind::LinkCollection => {
                let body = self.fetch_text(seed).await?;
                let candidates = extract_markdown_links(&body);
                let targets = self.screen_candidates(&seed_url, candidates, false).await;
                let _ = events.send(CrawlEvent::Discovered(targets.len())).await;
                self.fetch_set(targets, &events, &cancel, None).await
            }
            SeedKind::Page => {
                let seed_doc = fetch_with_retry(&self.http, &seed_url, self.options.stealth).await?;
                if looks_like_link_collection(&seed_doc.body) {
                    // A plain URL can still be an llms.txt-style index; crawl its targets
                    // instead of recursing.
                    let candidates = extract_markdown_links(&seed_doc.body);
                    let targets = self.screen_candidates(&seed_url, candidates, false).await;
                    let _ = events.send(CrawlEvent::Discovered(targets.len())).await;
                    return self.fetch_set(targets, &events, &cancel, None).await;
                }
                self.crawl_recursive(seed_url, seed_doc, events, cancel).await
            }
        }
    }

    /// SSRF-screen, glob-filter and deduplicate candidate URLs.
    async fn screen_candidates(
        &self,
        seed: &Url,
        candidates: Vec<String>,
        require_same_domain: bool,
    ) -> Vec<Url> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for candidate in candidates {
            let Ok(url) = validate_url_against_ssrf(&candidate).await else {
                tracing::debug!(url = %candidate, "Skipping candidate rejected by SSRF guard");
                continue;
            };
            if require_same_domain && !same_registered_domain(seed, &url) {
                continue;
            }
            if !self.filter.matches(&url) {
                continue;
            }
            if seen.insert(url.to_string()) {
                targets.push(url);
            }
        }
        targets
    }

    async fn crawl_recursive(
        &self,
        seed: Url,
        seed_doc: FetchedDoc,
        events: mpsc::Sender<CrawlEvent>,
        cancel: CancellationToken,
    ) -> Result<CrawlStats, CrawlError> {
        let mut stats = CrawlStats::default();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(seed.to_string());

        let mut discovered = 1;
        let _ = events.send(CrawlEvent::Discovered(discovered)).await;

        let seed_links = seed_doc.links.clone();
        let page = CrawledPage {
            url: seed.to_string(),
            title: seed_doc
                .title
                .clone()
                .unwrap_or_else(|| last_path_segment(&seed)),
            markdown: seed_doc.body,
        };
        if events.send(CrawlEvent::Page(page)).await.is_err() {
            stats.cancelled = true;
            return Ok(stats);
        }
        stats.fetched += 1;

        let mut pending_links = seed_links;
        for _depth in 1..=self.options.max_depth {
            if cancel.is_cancelled() {
                break;
            }
            let frontier = self
                .screen_candidates(&seed, std::mem::take(&mut pending_links), true)
                .await
                .into_iter()
                .filter(|url| !visited.contains(&url.to_string()))
                .collect::<Vec<_>>();
            if frontier.is_empty() {
                break;
            }
            visited.extend(frontier.iter().map(|url| url.to_string()));
            discovered += frontier.len();
            let _ = events.send(CrawlEvent::Discovered(discovered)).await;

            let mut links: Vec<String> = Vec::new();
            let level_stats = self
                .fetch_set(frontier, &events, &cancel, Some(&mut links))
                .await?;
            stats.fetched += level_stats.fetched;
            stats.failed += level_stats.failed;
            stats.cancelled |= level_stats.cancelled;
            if stats.cancelled {
                break;
            }
            pending_links = links;
        }

        stats.cancelled |= cancel.is_cancelled();
        Ok(stats)
    }

    /// Fetch a batch of URLs under the job and process concurrency caps.
    async fn fetch_set(
        &self,
        targets: Vec<Url>,
        events: &mpsc::Sender<CrawlEvent>,
        cancel: &CancellationToken,
        mut collect_links: Option<&mut Vec<String>>,
    ) -> Result<CrawlStats, CrawlError> {
        let mut stats = CrawlStats::default();
        let local = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for url in targets {
            let client = self.http.clone();
            let local = local.clone();
            let global = global_fetch_permits();
            let cancel = cancel.clone();
            let stealth = self.options.stealth;
            tasks.spawn(async move {
                let Ok(_local_permit) = local.acquire_owned().await else {
                    return None;
                };
                let Ok(_global_permit) = global.acquire_owned().await else {
                    return None;
                };
                if cancel.is_cancelled() {
                    return None;
                }
                if stealth {
                    stealth::humanized_delay().await;
                }
                Some((url.clone(), fetch_with_retry(&client, &url, stealth).await))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok(Some((url, result))) = joined else {
                stats.cancelled |= cancel.is_cancelled();
                continue;
            };
            match result {
                Ok(fetched) => {
                    if let Some(links) = collect_links.as_mut() {
                        links.extend(fetched.links);
                    }
                    if cancel.is_cancelled() {
                        stats.cancelled = true;
                        continue;
                    }
                    let page = CrawledPage {
                        url: url.to_string(),
                        markdown: fetched.body,
                        title: fetched.title.unwrap_or_else(|| last_path_segment(&url)),
                    };
                    if events.send(CrawlEvent::Page(page)).await.is_err() {
                        // Consumer hung up; treat like cancellation.
                        stats.cancelled = true;
                        continue;
                    }
                    stats.fetched += 1;
                }
                Err(error) => {
                    tracing::warn!(url = %url, error = %error, "URL failed; continuing crawl");
                    stats.failed += 1;
                }
            }
        }

        stats.cancelled |= cancel.is_cancelled();
        Ok(stats)
    }
}

#[derive(Debug)]
struct FetchedDoc {
    body: String,
    title: Option<String>,
    links: Vec<String>,
}

/// Fetch one URL with retries, converting HTML to markdown.
///
/// 429 honours `Retry-After` when present; 429 and 503 back off exponentially with jitter;
/// any other non-2xx aborts this URL without retrying.
async fn fetch_with_retry(
    client: &Client,
    url: &Url,
    stealth: bool,
) -> Result<FetchedDoc, CrawlError> {
    let mut last_reason = String::new();

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            backoff_delay(attempt, None).await;
        }

        let mut request = client.get(url.clone());
        if stealth {
            request = request.headers(stealth::stealth_headers());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                last_reason = error.to_string();
                continue;
            }
        };

        let status = response.status();
        let retryable = status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::SERVICE_UNAVAILABLE
            || (stealth && status == StatusCode::FORBIDDEN);
        if retryable {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok());
            last_reason = format!("status {status}");
            if stealth {
                let body = response.text().await.unwrap_or_default();
                if stealth::is_cloudflare_challenge(status, &body) {
                    tracing::debug!(url = %url, "Cloudflare challenge detected; waiting it out");
                    tokio::time::sleep(stealth::CHALLENGE_TIMEOUT / 6).await;
                    continue;
                }
            }
            backoff_delay(attempt + 1, retry_after).await;
            continue;
        }
        if !status.is_success() {
            return Err(CrawlError::Fetch {
                url: url.to_string(),
                reason: format!("status {status}"),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().await.map_err(|error| CrawlError::Fetch {
            url: url.to_string(),
            reason: error.to_string(),
        })?;

        if content_type.contains("html") || body.trim_start().starts_with("<!") {
            let (title, links) = scrape_title_and_links(url, &body);
            let markdown = htmd::convert(&body).map_err(|error| CrawlError::Fetch {
                url: url.to_string(),
                reason: format!("HTML conversion failed: {error}"),
            })?;
            return Ok(FetchedDoc {
                body: markdown,
                title,
                links,
            });
        }

        return Ok(FetchedDoc {
            body,
            title: None,
            links: Vec::new(),
        });
    }

    Err(CrawlError::Fetch {
        url: url.to_string(),
        reason: format!("gave up after {MAX_ATTEMPTS} attempts: {last_reason}"),
    })
}

/// Pull the title and absolutised link targets out of an HTML document.
fn scrape_title_and_links(base: &Url, html: &str) -> (Option<String>, Vec<String>) {
    let document = scraper::Html::parse_document(html);

    let title_selector = scraper::Selector::parse("title").expect("static selector");
    let title = document
        .select(&title_selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|title| !title.is_empty());

    let link_selector = scraper::Selector::parse("a[href]").expect("static selector");
    let links = document
        .select(&link_selector)
        .filter_map(|element| element.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .map(|mut url| {
            url.set_fragment(None);
            url.to_string()
        })
        .collect();

    (title, links)
}

async fn backoff_delay(attempt: u32, retry_after_seconds: Option<u64>) {
    let delay = match retry_after_seconds {
        Some(seconds) => Duration::from_secs(seconds.min(30)),
        None => {
            let base = BACKOFF_BASE_MS * 2u64.pow(attempt.min(6));
            let jitter = rand::thread_rng().gen_range(0..BACKOFF_BASE_MS);
            Duration::from_millis(base + jitter)
        }
    };
    tokio::time::sleep(delay).await;
}

fn last_path_segment(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|segment| !segment.is_empty()).next_back())
        .unwrap_or("document")
        .to_string()
}
