//! URL validation, glob filtering and link extraction for the crawler.
//!
//! Everything here runs before any network I/O: the SSRF guard rejects dangerous targets,
//! glob sanitisation rejects hostile patterns, and the parsers turn sitemaps and markdown
//! link collections into candidate URL lists.

use crate::crawler::CrawlError;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::net::IpAddr;
use url::{Host, Url};

/// Maximum number of glob patterns accepted per request.
const MAX_PATTERNS: usize = 50;

/// Maximum length of a single glob pattern.
const MAX_PATTERN_LENGTH: usize = 200;

/// Validate a URL against server-side request forgery.
///
/// Rejects non-HTTP schemes, localhost aliases, and any hostname that resolves to a
/// loopback, private (RFC 1918), link-local or unspecified address. DNS failures are let
/// through; the actual fetch will fail naturally and nothing sensitive is reachable via a
/// name that does not resolve.
pub async fn validate_url_against_ssrf(raw_url: &str) -> Result<Url, CrawlError> {
    let parsed = Url::parse(raw_url)
        .map_err(|error| CrawlError::Validation(format!("invalid URL '{raw_url}': {error}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CrawlError::Validation(format!(
                "invalid protocol '{other}': only http and https are allowed"
            )));
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| CrawlError::Validation("URL has no hostname".into()))?;

    match host {
        Host::Ipv4(ip) => reject_forbidden_ip(IpAddr::V4(ip))?,
        Host::Ipv6(ip) => reject_forbidden_ip(IpAddr::V6(ip))?,
        Host::Domain(domain) => {
            let lowered = domain.to_ascii_lowercase();
            if matches!(
                lowered.as_str(),
                "localhost" | "localhost.localdomain" | "0.0.0.0"
            ) {
                return Err(CrawlError::Validation(
                    "access to localhost is not allowed".into(),
                ));
            }
            // Resolve and screen every address the name points at.
            if let Ok(addresses) = tokio::net::lookup_host((lowered.as_str(), 80)).await {
                for address in addresses {
                    reject_forbidden_ip(address.ip())?;
                }
            }
        }
    }

    Ok(parsed)
}

fn reject_forbidden_ip(ip: IpAddr) -> Result<(), CrawlError> {
    let forbidden = match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 link-local and fc00::/7 unique-local.
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    };
    if forbidden {
        return Err(CrawlError::Validation(format!(
            "access to private or internal addresses is not allowed: {ip}"
        )));
    }
    Ok(())
}

/// Sanitise user-supplied glob patterns.
///
/// Empty entries are dropped; anything outside the safe character set, longer than 200
/// characters, containing `..`, or beyond 50 patterns total is rejected outright.
pub fn sanitize_glob_patterns(patterns: &[String]) -> Result<Vec<String>, CrawlError> {
    if patterns.len() > MAX_PATTERNS {
        return Err(CrawlError::Validation(format!(
            "too many patterns; maximum {MAX_PATTERNS} allowed"
        )));
    }

    let mut sanitized = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            continue;
        }
        if pattern.len() > MAX_PATTERN_LENGTH {
            return Err(CrawlError::Validation(format!(
                "pattern too long (max {MAX_PATTERN_LENGTH} characters): {}...",
                &pattern[..pattern.len().min(50)]
            )));
        }
        let safe = pattern
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '/' | '*' | '?' | '.' | '{' | '}' | ','));
        if !safe {
            return Err(CrawlError::Validation(format!(
                "invalid characters in pattern: {pattern}"
            )));
        }
        if pattern.contains("..") {
            return Err(CrawlError::Validation(format!(
                "path traversal not allowed in pattern: {pattern}"
            )));
        }
        sanitized.push(pattern.to_string());
    }
    Ok(sanitized)
}

/// Compiled include/exclude URL filter with Unix glob semantics.
///
/// `*` matches any characters including `/`. When include patterns are present, a URL must
/// match at least one of them; a URL matching any exclude pattern is always dropped.
pub struct UrlFilter {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl UrlFilter {
    /// Build a filter from already-sanitised pattern lists.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, CrawlError> {
        Ok(Self {
            include: build_globset(include)?,
            exclude: build_globset(exclude)?,
        })
    }

    /// Whether the URL's path survives the include/exclude rules.
    pub fn matches(&self, url: &Url) -> bool {
        let path = url.path();
        if let Some(exclude) = &self.exclude
            && exclude.is_match(path)
        {
            return false;
        }
        match &self.include {
            Some(include) => include.is_match(path),
            None => true,
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>, CrawlError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|error| CrawlError::Validation(format!("bad glob '{pattern}': {error}")))?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|error| CrawlError::Validation(format!("glob set failed to build: {error}")))?;
    Ok(Some(set))
}

/// Whether `candidate` stays on the registered domain of `seed`.
///
/// Exact host matches pass, as do subdomains of the seed's registrable base (the last two
/// labels), so `docs.example.com` and `www.example.com` crawl together.
pub fn same_registered_domain(seed: &Url, candidate: &Url) -> bool {
    let (Some(seed_host), Some(candidate_host)) = (seed.host_str(), candidate.host_str()) else {
        return false;
    };
    let seed_host = seed_host.to_ascii_lowercase();
    let candidate_host = candidate_host.to_ascii_lowercase();
    if seed_host == candidate_host {
        return true;
    }

    let base: Vec<&str> = seed_host.rsplit('.').take(2).collect();
    if base.len() < 2 {
        return false;
    }
    let registered = format!("{}.{}", base[1], base[0]);
    candidate_host == registered || candidate_host.ends_with(&format!(".{registered}"))
}

/// Extract `<loc>` URLs from a sitemap.xml body.
pub fn parse_sitemap(xml: &str) -> Result<Vec<String>, CrawlError> {
    use quick_xml::Reader;
    use quick_xml::events::Event;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut urls = Vec::new();
    let mut in_loc = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) if element.name().as_ref() == b"loc" => in_loc = true,
            Ok(Event::End(element)) if element.name().as_ref() == b"loc" => in_loc = false,
            Ok(Event::Text(text)) if in_loc => {
                let value = text
                    .unescape()
                    .map_err(|error| CrawlError::Validation(format!("bad sitemap text: {error}")))?;
                let value = value.trim().to_string();
                if !value.is_empty() {
                    urls.push(value);
                }
            }
            Ok(Event::Eof) => break,
            Err(error) => {
                return Err(CrawlError::Validation(format!(
                    "sitemap parse failed: {error}"
                )));
            }
            _ => {}
        }
    }
    Ok(urls)
}

/// Extract absolute link targets from a markdown link collection (llms.txt style).
pub fn extract_markdown_links(markdown: &str) -> Vec<String> {
    let mut links = Vec::new();
    let mut rest = markdown;
    while let Some(open) = rest.find("](") {
        let after = &rest[open + 2..];
        match after.find(')') {
            Some(close) => {
                let target = after[..close].trim();
                if target.starts_with("http://") || target.starts_with("https://") {
                    links.push(target.to_string());
                }
                rest = &after[close + 1..];
            }
            None => break,
        }
    }
    links
}

/// Heuristic: does this markdown read as a link collection rather than an article?
pub fn looks_like_link_collection(markdown: &str) -> bool {
    let links = extract_markdown_links(markdown).len();
    if links < 5 {
        return false;
    }
    let lines = markdown
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count();
    links * 2 >= lines
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn rejects(url: &str) {
        let error = validate_url_against_ssrf(url).await.unwrap_err();
        assert!(matches!(error, CrawlError::Validation(_)), "{url}");
    }

    #[tokio::test]
    async fn ssrf_guard_blocks_local_and_private_targets() {
        rejects("http://localhost/admin").await;
        rejects("http://127.0.0.1:8080/").await;
        rejects("http://0.0.0.0/").await;
        rejects("http://[::1]/").await;
        rejects("http://10.0.0.8/internal").await;
        rejects("http://192.168.1.1/router").await;
        rejects("http://172.16.5.5/").await;
        rejects("http://169.254.169.254/latest/meta-data").await;
    }

    #[tokio::test]
    async fn ssrf_guard_blocks_non_http_schemes() {
        rejects("file:///etc/passwd").await;
        rejects("ftp://203.0.113.7/archive").await;
    }

    #[tokio::test]
    async fn ssrf_guard_allows_public_addresses() {
        assert!(validate_url_against_ssrf("https://203.0.113.7/docs").await.is_ok());
    }

    #[test]
    fn glob_sanitizer_accepts_common_patterns() {
        let patterns = vec!["**/en/**".to_string(), "*.{js,ts}".to_string()];
        let sanitized = sanitize_glob_patterns(&patterns).expect("valid patterns");
        assert_eq!(sanitized, patterns);
    }

    #[test]
    fn glob_sanitizer_rejects_hostile_input() {
        for bad in [
            "../../etc",
            "a`b",
            "a$b",
            "a;b",
            "a|b",
            "bad\npattern",
        ] {
            assert!(
                sanitize_glob_patterns(&[bad.to_string()]).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn glob_sanitizer_rejects_oversized_input() {
        let long = "a".repeat(201);
        assert!(sanitize_glob_patterns(&[long]).is_err());

        let many: Vec<String> = (0..51).map(|i| format!("p{i}")).collect();
        assert!(sanitize_glob_patterns(&many).is_err());
    }

    #[test]
    fn glob_sanitizer_drops_empty_entries() {
        let sanitized =
            sanitize_glob_patterns(&["  ".to_string(), "docs/*".to_string()]).expect("valid");
        assert_eq!(sanitized, vec!["docs/*".to_string()]);
    }

    #[test]
    fn filter_applies_include_then_exclude() {
        let filter = UrlFilter::new(
            &["**/en/**".to_string()],
            &["**/api/**".to_string()],
        )
        .expect("filter");

        let en = Url::parse("https://docs.example.com/en/intro").unwrap();
        let fr = Url::parse("https://docs.example.com/fr/intro").unwrap();
        let en_api = Url::parse("https://docs.example.com/en/api/ref").unwrap();

        assert!(filter.matches(&en));
        assert!(!filter.matches(&fr));
        // Exclude beats include.
        assert!(!filter.matches(&en_api));
    }

    #[test]
    fn star_crosses_path_separators() {
        let filter = UrlFilter::new(&["*guide*".to_string()], &[]).expect("filter");
        let nested = Url::parse("https://example.com/docs/v2/guide/start").unwrap();
        assert!(filter.matches(&nested));
    }

    #[test]
    fn domain_scope_accepts_subdomains() {
        let seed = Url::parse("https://docs.example.com/start").unwrap();
        let same = Url::parse("https://docs.example.com/deep/page").unwrap();
        let sibling = Url::parse("https://www.example.com/other").unwrap();
        let foreign = Url::parse("https://evil.com/docs.example.com").unwrap();

        assert!(same_registered_domain(&seed, &same));
        assert!(same_registered_domain(&seed, &sibling));
        assert!(!same_registered_domain(&seed, &foreign));
    }

    #[test]
    fn sitemap_locs_are_extracted() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://example.com/a</loc></url>
  <url><loc>https://example.com/b</loc></url>
</urlset>"#;
        let urls = parse_sitemap(xml).expect("sitemap");
        assert_eq!(
            urls,
            vec![
                "https://example.com/a".to_string(),
                "https://example.com/b".to_string()
            ]
        );
    }

    #[test]
    fn markdown_links_are_collected() {
        let markdown = "# Docs\n\n- [Intro](https://example.com/intro)\n- [Guide](https://example.com/guide)\n- [Local](/relative/skipped)\n";
        assert_eq!(
            extract_markdown_links(markdown),
            vec![
                "https://example.com/intro".to_string(),
                "https://example.com/guide".to_string()
            ]
        );
    }

    #[test]
    fn link_collection_heuristic_needs_link_density() {
        let listing = (0..8)
            .map(|i| format!("- [Page {i}](https://example.com/p{i})"))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(looks_like_link_collection(&listing));

        let article = "Some prose.\n".repeat(40) + "[one link](https://example.com)";
        assert!(!looks_like_link_collection(&article));
    }
}
