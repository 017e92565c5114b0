use backoff::{backoff::Backoff, ExponentialBackoff};
use log::info;
use reqwest::{Client, ClientBuilder, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use thiserror::Error;
use tokio::time::sleep;

static USER_AGENT: &str = "pilot-autopilot";

pub type Result<T> = std::result::Result<T, Error>;

/// Shared authenticated JSON client. Retries rate-limited requests with
/// exponential backoff; every other non-2xx surfaces as [`Error::Http`].
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    username: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new<U: Into<String>, T: Into<String>>(username: U, token: T) -> Self {
        let client = ClientBuilder::new().user_agent(USER_AGENT).build().unwrap();
        Self {
            client,
            username: username.into(),
            token: Some(token.into()),
        }
    }

    pub async fn get<O>(&self, endpoint: &str) -> Result<O>
    where
        O: DeserializeOwned + Debug,
    {
        self.execute(|| self.client.get(endpoint)).await
    }

    pub async fn post<I, O>(&self, endpoint: &str, body: &I) -> Result<O>
    where
        I: Serialize,
        O: DeserializeOwned + Debug,
    {
        self.execute(|| self.client.post(endpoint).json(body)).await
    }

    pub async fn put<I, O>(&self, endpoint: &str, body: &I) -> Result<O>
    where
        I: Serialize,
        O: DeserializeOwned + Debug,
    {
        self.execute(|| self.client.put(endpoint).json(body)).await
    }

    async fn execute<F, O>(&self, build: F) -> Result<O>
    where
        F: Fn() -> RequestBuilder,
        O: DeserializeOwned + Debug,
    {
        // TODO: make the backoff policy configurable
        let mut backoff = ExponentialBackoff::default();
        loop {
            let builder = build().basic_auth(&self.username, self.token.as_ref());
            let response = builder.send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response.json().await?);
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                match backoff.next_backoff() {
                    Some(delay) => {
                        info!("Rate limit hit, sleeping for {}s", delay.as_secs());
                        sleep(delay).await;
                    }
                    None => return Err(Error::RateLimitRetries),
                }
                continue;
            }
            return Err(Error::Http(status));
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("rate limited max attempts reached")]
    RateLimitRetries,

    #[error("request failed with status code {0}")]
    Http(StatusCode),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
}

impl Error {
    pub fn not_found(&self) -> bool {
        matches!(self, Self::Http(StatusCode::NOT_FOUND))
    }

    pub fn method_not_allowed(&self) -> bool {
        matches!(self, Self::Http(StatusCode::METHOD_NOT_ALLOWED))
    }

    pub fn conflict(&self) -> bool {
        matches!(self, Self::Http(StatusCode::CONFLICT))
    }

    pub fn unprocessable_entity(&self) -> bool {
        matches!(self, Self::Http(StatusCode::UNPROCESSABLE_ENTITY))
    }

    pub fn rate_limited(&self) -> bool {
        matches!(
            self,
            Self::RateLimitRetries | Self::Http(StatusCode::TOO_MANY_REQUESTS)
        )
    }

    /// Transient server-side failures worth retrying at the caller's pace.
    pub fn transient(&self) -> bool {
        match self {
            Self::Http(status) => status.is_server_error(),
            Self::Reqwest(e) => e.is_timeout() || e.is_connect(),
            Self::RateLimitRetries => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_predicates() {
        assert!(Error::Http(StatusCode::NOT_FOUND).not_found());
        assert!(Error::Http(StatusCode::METHOD_NOT_ALLOWED).method_not_allowed());
        assert!(Error::Http(StatusCode::CONFLICT).conflict());
        assert!(Error::Http(StatusCode::TOO_MANY_REQUESTS).rate_limited());
        assert!(Error::RateLimitRetries.rate_limited());
        assert!(Error::Http(StatusCode::BAD_GATEWAY).transient());
        assert!(!Error::Http(StatusCode::FORBIDDEN).transient());
    }
}
