use std::io::Read;
use std::path::Path;
use std::time::Duration;

use iati_colab_core::{ColabError, Fetcher};

/// Fetches `http(s)://` URLs with a blocking agent and reads `file://` URLs
/// and plain paths from disk.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { agent: ureq::AgentBuilder::new().timeout(timeout).build() }
    }

    #[must_use]
    pub fn agent(&self) -> &ureq::Agent {
        &self.agent
    }

    fn fetch_url(&self, url: &str) -> Result<Vec<u8>, ColabError> {
        let fetch_error = |detail: String| ColabError::Fetch { locator: url.to_string(), detail };
        let response = self.agent.get(url).call().map_err(|err| fetch_error(err.to_string()))?;
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|err| fetch_error(format!("failed to read response body: {err}")))?;
        Ok(body)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, locator: &str) -> Result<Vec<u8>, ColabError> {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            return self.fetch_url(locator);
        }
        let path = locator.strip_prefix("file://").unwrap_or(locator);
        std::fs::read(Path::new(path)).map_err(|err| ColabError::Fetch {
            locator: locator.to_string(),
            detail: err.to_string(),
        })
    }
}
