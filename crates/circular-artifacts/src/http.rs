use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument, warn};

use crate::error::ArtifactError;
use crate::store::{check_filename, ArtifactRef, ArtifactStore};

/// Cap on how much of an error body is kept in the error message.
const MAX_ERROR_BODY: usize = 512;

/// Object-storage backend speaking plain `PUT`/`GET` against
/// `{endpoint}/{bucket}/{key}`.
pub struct HttpArtifactStore {
    client: Client,
    endpoint: String,
    bucket: String,
    token: Option<SecretString>,
}

impl HttpArtifactStore {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("circular/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            token,
        }
    }

    /// Reads the bearer token from the named environment variable. A missing
    /// or empty variable means unauthenticated requests.
    pub fn from_env(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        token_env: &str,
        timeout: Duration,
    ) -> Self {
        let token = std::env::var(token_env)
            .ok()
            .filter(|t| !t.is_empty())
            .map(SecretString::from);
        if token.is_none() {
            warn!(token_env, "storage token not set, uploading without credentials");
        }
        Self::new(endpoint, bucket, token, timeout)
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{key}", self.endpoint)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token.expose_secret()),
            None => req,
        }
    }
}

async fn error_body(resp: reqwest::Response) -> String {
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    fn backend(&self) -> &'static str {
        "remote"
    }

    #[instrument(skip(self, bytes), fields(bucket = %self.bucket, size = bytes.len()))]
    async fn persist(&self, bytes: Bytes, filename: &str) -> Result<ArtifactRef, ArtifactError> {
        check_filename(filename)?;
        let key = format!("{}/{filename}", self.bucket);
        let url = self.object_url(&key);

        let resp = self
            .authorize(self.client.put(&url))
            .header(reqwest::header::CONTENT_TYPE, "application/pdf")
            .body(bytes)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = error_body(resp).await;
            warn!(status = status.as_u16(), "upload rejected");
            return Err(ArtifactError::Upload {
                status: status.as_u16(),
                body,
            });
        }

        debug!(%url, "artifact uploaded");
        Ok(ArtifactRef {
            external_id: key,
            location: url,
            local_path: None,
        })
    }

    async fn fetch(&self, external_id: &str) -> Result<Bytes, ArtifactError> {
        if external_id.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return Err(ArtifactError::InvalidReference(external_id.to_string()));
        }
        let resp = self
            .authorize(self.client.get(self.object_url(external_id)))
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(resp.bytes().await?),
            StatusCode::NOT_FOUND => Err(ArtifactError::NotFound(external_id.to_string())),
            s => Err(ArtifactError::Upload {
                status: s.as_u16(),
                body: error_body(resp).await,
            }),
        }
    }
}
