use std::sync::Arc;

use anyhow::Context;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::error::ApiError;
use thiserror::Error;
use url::Url;

use crate::credentials::CredentialStore;

/// Outcome of a single service request before it is mapped onto an
/// operation-specific error type: the service said no, or the request never
/// produced a usable response.
#[derive(Debug, Error)]
pub(crate) enum RequestFailure {
    #[error("{0}")]
    Rejected(ApiError),
    #[error("{0}")]
    Transport(String),
}

impl From<reqwest::Error> for RequestFailure {
    fn from(err: reqwest::Error) -> Self {
        RequestFailure::Transport(err.to_string())
    }
}

/// HTTP access to the dashboard service. Holds the base URL, the shared
/// `reqwest` client, and read-only access to the persisted credentials for
/// bearer-header injection.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialStore>,
    ) -> anyhow::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Url::parse(&base_url)
            .with_context(|| format!("invalid service base url '{base_url}'"))?;
        Ok(Self {
            http: Client::new(),
            base_url,
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Builds a request with the persisted access token attached. Reads the
    /// credential store; never writes it.
    pub(crate) async fn bearer_request(
        &self,
        method: Method,
        path: &str,
    ) -> Result<RequestBuilder, RequestFailure> {
        let tokens = self
            .credentials
            .load()
            .await
            .map_err(|err| {
                RequestFailure::Transport(format!("failed to read persisted credentials: {err:#}"))
            })?
            .ok_or_else(|| {
                RequestFailure::Transport(format!(
                    "no persisted credentials for request to '{path}'"
                ))
            })?;
        Ok(self
            .http
            .request(method, self.url(path))
            .bearer_auth(tokens.access))
    }

    pub(crate) async fn bearer_get(&self, path: &str) -> Result<RequestBuilder, RequestFailure> {
        self.bearer_request(Method::GET, path).await
    }
}

/// Decodes a success body, or folds a non-2xx response into the service's
/// error shape.
pub(crate) async fn decode_json<T: DeserializeOwned>(
    response: Response,
) -> Result<T, RequestFailure> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RequestFailure::Rejected(ApiError::from_response(
            status.as_u16(),
            &body,
        )));
    }
    response.json::<T>().await.map_err(RequestFailure::from)
}
