//! Status-fetch collaborators.
//!
//! The poller only needs "give me the current status of operation X". That
//! seam is [`StatusFetcher`]; [`FnFetcher`] wraps a plain async closure and
//! [`HttpStatusFetcher`] talks to the remote API.

use std::future::Future;
use std::sync::Arc;

use numbox_core::ClassConfig;
use serde::de::DeserializeOwned;

use crate::model::StatusReport;

// ── Error ───────────────────────────────────────────────────────────

/// A failed status fetch. Always treated as transient by the poller.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP {status}: {message}")]
    Server { status: u16, message: String },

    #[error("network: {0}")]
    Network(#[from] reqwest::Error),

    #[error("auth: {0}")]
    Auth(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

// ── StatusFetcher ───────────────────────────────────────────────────

#[async_trait::async_trait]
pub trait StatusFetcher: Send + Sync + 'static {
    async fn fetch_status(&self, operation_id: &str) -> Result<StatusReport, FetchError>;
}

/// Adapts an async closure into a [`StatusFetcher`].
///
/// ```ignore
/// let fetcher = FnFetcher::new(|id| async move {
///     Ok(StatusReport::pending())
/// });
/// ```
pub struct FnFetcher<F> {
    f: F,
}

impl<F> FnFetcher<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait::async_trait]
impl<F, Fut> StatusFetcher for FnFetcher<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StatusReport, FetchError>> + Send + 'static,
{
    async fn fetch_status(&self, operation_id: &str) -> Result<StatusReport, FetchError> {
        (self.f)(operation_id.to_string()).await
    }
}

// ── TokenSource ─────────────────────────────────────────────────────

/// Pluggable bearer-token provider, called before every request.
/// `Ok(None)` sends the request anonymously.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn token(&self) -> Result<Option<String>, FetchError>;
}

pub struct NoAuth;

#[async_trait::async_trait]
impl TokenSource for NoAuth {
    async fn token(&self) -> Result<Option<String>, FetchError> {
        Ok(None)
    }
}

/// Bearer token obtained elsewhere (login flow, config file).
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait::async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<Option<String>, FetchError> {
        if self.0.is_empty() {
            return Err(FetchError::Auth("empty bearer token".into()));
        }
        Ok(Some(self.0.clone()))
    }
}

// ── HttpStatusFetcher ───────────────────────────────────────────────

/// `GET {base_url}{status_path}` with `{id}` replaced by the operation id.
pub struct HttpStatusFetcher {
    http: reqwest::Client,
    base_url: String,
    status_path: String,
    token_source: Arc<dyn TokenSource>,
}

impl HttpStatusFetcher {
    pub fn new(
        base_url: impl Into<String>,
        status_path: impl Into<String>,
        token_source: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            status_path: status_path.into(),
            token_source,
        }
    }

    /// Fetcher for one operation kind, using its configured status path.
    pub fn for_class(base_url: &str, class: &ClassConfig, token_source: Arc<dyn TokenSource>) -> Self {
        Self::new(base_url, class.status_path.clone(), token_source)
    }

    pub fn status_url(&self, operation_id: &str) -> String {
        let path = self.status_path.replace("{id}", operation_id);
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn authed(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, FetchError> {
        match self.token_source.token().await? {
            Some(token) => Ok(builder.bearer_auth(token)),
            None => Ok(builder),
        }
    }

    async fn parse<R: DeserializeOwned>(resp: reqwest::Response) -> Result<R, FetchError> {
        let status = resp.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Server { status: code, message: body });
        }
        resp.json::<R>()
            .await
            .map_err(|e| FetchError::Decode(format!("status body: {}", e)))
    }
}

#[async_trait::async_trait]
impl StatusFetcher for HttpStatusFetcher {
    async fn fetch_status(&self, operation_id: &str) -> Result<StatusReport, FetchError> {
        let req = self.http.get(self.status_url(operation_id));
        let req = self.authed(req).await?;
        let resp = req.send().await?;
        Self::parse(resp).await
    }
}
