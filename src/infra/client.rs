//! HTTP implementation of [`CoordinatorClient`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::json;
use uuid::Uuid;

use crate::application::coordinator::{LeaseGrant, StatusUpdate};
use crate::application::worker::{ClientError, CoordinatorClient};
use crate::domain::entities::JobTicket;

use super::error::InfraError;

#[derive(Clone, Debug)]
pub struct HttpCoordinatorClient {
    client: Client,
    base: Url,
    auth: Option<HeaderValue>,
}

impl HttpCoordinatorClient {
    pub fn new(
        base_url: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, InfraError> {
        let mut base = Url::parse(base_url).map_err(|err| {
            InfraError::configuration(format!("invalid coordinator url `{base_url}`: {err}"))
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let auth = token
            .filter(|token| !token.is_empty())
            .map(|token| HeaderValue::from_str(&format!("Bearer {token}")))
            .transpose()
            .map_err(|err| InfraError::configuration(format!("invalid api token: {err}")))?;

        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::configuration(format!("http client: {err}")))?;

        Ok(Self { client, base, auth })
    }

    pub fn user_agent() -> &'static str {
        concat!("render-lease/", env!("CARGO_PKG_VERSION"))
    }

    /// `GET /healthz`; any 2xx counts as healthy.
    pub async fn healthz(&self) -> Result<(), ClientError> {
        let response = self.request(Method::GET, "healthz")?.send().await;
        let response = response.map_err(transport)?;
        Self::check(response).await.map(|_| ())
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path)
            .map_err(|err| ClientError::Transport(format!("invalid url `{path}`: {err}")))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ClientError> {
        Ok(self.authorized(self.client.request(method, self.url(path)?)))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some(auth) => request.header(AUTHORIZATION, auth.clone()),
            None => request,
        }
    }

    async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.send().await.map_err(transport)?;
        let bytes = Self::check(response).await?;
        serde_json::from_slice(&bytes).map_err(|err| ClientError::Decode(err.to_string()))
    }

    async fn check(response: Response) -> Result<Vec<u8>, ClientError> {
        let status = response.status();
        let bytes = response.bytes().await.map_err(transport)?;
        if status.is_success() {
            return Ok(bytes.to_vec());
        }

        let body = String::from_utf8_lossy(&bytes).into_owned();
        Err(match status {
            StatusCode::NOT_FOUND => ClientError::NotFound(body),
            StatusCode::CONFLICT => ClientError::Conflict(body),
            StatusCode::GONE => ClientError::Gone(body),
            other => ClientError::Rejected {
                status: other.as_u16(),
                body,
            },
        })
    }
}

fn transport(err: reqwest::Error) -> ClientError {
    ClientError::Transport(err.to_string())
}

#[async_trait]
impl CoordinatorClient for HttpCoordinatorClient {
    async fn list_queued(&self, limit: u32) -> Result<Vec<JobTicket>, ClientError> {
        let mut url = self.url("render-jobs")?;
        url.query_pairs_mut()
            .append_pair("status", "queued")
            .append_pair("kind", "render_part")
            .append_pair("limit", &limit.to_string());

        Self::send_json(self.authorized(self.client.get(url))).await
    }

    async fn claim(&self, id: Uuid, lease_seconds: u32) -> Result<LeaseGrant, ClientError> {
        let request = self
            .request(Method::POST, &format!("render-jobs/{id}/claim"))?
            .json(&json!({ "lease_seconds": lease_seconds }));
        Self::send_json(request).await
    }

    async fn heartbeat(&self, id: Uuid, lease_token: Uuid) -> Result<LeaseGrant, ClientError> {
        let request = self
            .request(Method::POST, &format!("render-jobs/{id}/heartbeat"))?
            .json(&json!({ "lease_token": lease_token }));
        Self::send_json(request).await
    }

    async fn set_status(&self, id: Uuid, update: StatusUpdate) -> Result<(), ClientError> {
        let request = self
            .request(Method::POST, &format!("render-jobs/{id}/status"))?
            .json(&update);
        let response = request.send().await.map_err(transport)?;
        Self::check(response).await.map(|_| ())
    }
}
