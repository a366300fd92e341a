//! Shared HTTP client for upstream fetches.
//!
//! Some of the public dashboards refuse default library user agents, so the
//! client announces a desktop browser. No client-side timeout: upstream
//! hangs are the embedding scheduler's concern.

use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/74.0.3729.131 Safari/537.36";

const ACCEPT_VALUE: &str =
    "text/html,application/xhtml+xml,application/xml,application/json;q=0.9,*/*;q=0.8";

static SHARED: Lazy<Client> = Lazy::new(|| {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_VALUE));
    Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .build()
        .expect("default http client")
});

/// Process-wide client handle; `reqwest::Client` clones share a pool.
pub fn client() -> Client {
    SHARED.clone()
}
