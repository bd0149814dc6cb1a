use std::ops::Deref;

use reqwest::Client;

use crate::{config::IngestConfig, error::IngestResult};

/// Shared HTTP client carrying the TLS policy and user agent of a session.
///
/// Only the connect phase is bounded here: progressive and live bodies can
/// stream indefinitely, so whole-request timeouts are set per request.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(config: &IngestConfig) -> IngestResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent())
            .danger_accept_invalid_certs(!config.strict_tls)
            .connect_timeout(config.http_timeout())
            .build()?;
        Ok(Self { client })
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
