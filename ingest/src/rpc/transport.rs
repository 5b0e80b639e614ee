use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use url::Url;

use super::TransportError;

/// Longest response body excerpt kept in an error.
const ERROR_BODY_EXCERPT: usize = 512;

/// Carries one JSON-RPC batch body to the node and returns the decoded reply.
pub trait RpcTransport: Send + Sync {
    fn send(&self, body: Value) -> impl Future<Output = Result<Value, TransportError>> + Send;
}

impl<T: RpcTransport> RpcTransport for Arc<T> {
    fn send(&self, body: Value) -> impl Future<Output = Result<Value, TransportError>> + Send {
        (**self).send(body)
    }
}

/// JSON-RPC over HTTP POST.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
}

impl HttpTransport {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl RpcTransport for HttpTransport {
    async fn send(&self, body: Value) -> Result<Value, TransportError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                url: self.url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<unreadable body: {e}>"));
            if body.len() > ERROR_BODY_EXCERPT {
                let cut = (0..=ERROR_BODY_EXCERPT)
                    .rev()
                    .find(|i| body.is_char_boundary(*i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            return Err(TransportError::Status {
                url: self.url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| TransportError::Malformed(e.to_string()))
    }
}
