use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::Client;

const USER_AGENT: &str = concat!("virtual-photoshoot/", env!("CARGO_PKG_VERSION"));

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    build_http_client(Duration::from_secs(30)).expect("Failed to build HTTP client")
});

pub fn build_http_client(default_timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(default_timeout)
        .connect_timeout(Duration::from_secs(10))
        .user_agent(USER_AGENT)
        .build()
}

/// Shared client; callers override the timeout per request.
pub fn get_http_client() -> &'static Client {
    &HTTP_CLIENT
}
