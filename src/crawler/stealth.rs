//! Stealth crawling profile.
//!
//! Off by default and orthogonal to correctness: when enabled, each request carries a
//! browser-like identity (user agent with matching `sec-ch-ua` and `Accept-*` headers),
//! fetches are separated by a humanised delay, and timeouts stretch to ride out
//! Cloudflare-style interstitial challenges.

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue};
use std::time::Duration;

/// Rotating pool of desktop browser identities.
const USER_AGENTS: [(&str, &str); 4] = [
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\"",
    ),
    (
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
        "\"Google Chrome\";v=\"119\", \"Chromium\";v=\"119\", \"Not?A_Brand\";v=\"24\"",
    ),
    (
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\"",
    ),
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36",
        "\"Chromium\";v=\"118\", \"Google Chrome\";v=\"118\", \"Not=A?Brand\";v=\"99\"",
    ),
];

/// Base pause between stealth fetches, before the random component.
const BASE_DELAY_MS: u64 = 800;

/// Upper bound of the uniform random component added to the base delay.
const DELAY_VARIANCE_MS: u64 = 1200;

/// Fetch timeout while in stealth mode.
pub const STEALTH_TIMEOUT: Duration = Duration::from_secs(45);

/// Extended timeout applied while waiting out a Cloudflare challenge.
pub const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Pick a random browser identity and build the matching header set.
pub fn stealth_headers() -> HeaderMap {
    let pick = rand::thread_rng().gen_range(0..USER_AGENTS.len());
    let (user_agent, sec_ch_ua) = USER_AGENTS[pick];

    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_static(user_agent),
    );
    headers.insert("sec-ch-ua", HeaderValue::from_static(sec_ch_ua));
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
    headers.insert(
        reqwest::header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(
        reqwest::header::ACCEPT_ENCODING,
        HeaderValue::from_static("gzip, deflate, br"),
    );
    headers
}

/// Humanised inter-request delay: `base + U(0, variance)`.
pub async fn humanized_delay() {
    let jitter = rand::thread_rng().gen_range(0..DELAY_VARIANCE_MS);
    tokio::time::sleep(Duration::from_millis(BASE_DELAY_MS + jitter)).await;
}

/// Whether a response body looks like a Cloudflare interstitial challenge.
pub fn is_cloudflare_challenge(status: reqwest::StatusCode, body: &str) -> bool {
    if status.as_u16() != 403 && status.as_u16() != 503 {
        return false;
    }
    body.contains("cf-browser-verification")
        || body.contains("Checking your browser")
        || body.contains("Just a moment...")
}
