//! Probing whether an app container answers HTTP.

use async_trait::async_trait;
use std::time::Duration;

/// Answers "is something serving at this URL".
#[async_trait]
pub trait AppProbe: Send + Sync {
    async fn is_responding(&self, url: &str) -> bool;
}

/// Probe that issues a GET and accepts any non-5xx answer.
///
/// A dev server answering 404 on `/` is up; a proxy answering 502 is not.
#[derive(Debug, Clone)]
pub struct HttpAppProbe {
    client: reqwest::Client,
}

impl HttpAppProbe {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AppProbe for HttpAppProbe {
    async fn is_responding(&self, url: &str) -> bool {
        self.client
            .get(url)
            .send()
            .await
            .map(|res| !res.status().is_server_error())
            .unwrap_or(false)
    }
}
