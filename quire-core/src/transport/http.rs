use super::{Channel, Endpoint, Endpoints, Service, Transport};
use crate::error::{QuireError, Result};
use crate::rpc::{Envelope, Response};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Body of a `POST /rpc` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEnvelope {
    pub envelope: Envelope,
    /// Where the callee may push requests back to the caller.
    #[serde(default)]
    pub reply_to: Endpoints,
}

/// JSON-over-HTTP transport.
///
/// HTTP has no server push, so the "back channel" of a connection is a
/// second [`HttpTransport`] channel towards the caller's advertised
/// endpoints; pushes land on the caller's own `/rpc` route rather than on
/// the `inbound` service handed to [`Transport::connect`].
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    reply_to: Endpoints,
}

impl HttpTransport {
    pub fn new(reply_to: Endpoints, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| QuireError::Config(error.to_string()))?;
        Ok(Self { client, reply_to })
    }

    fn channel(&self, endpoints: &Endpoints) -> HttpChannel {
        HttpChannel {
            client: self.client.clone(),
            urls: endpoints.iter().map(rpc_url).collect(),
            reply_to: self.reply_to.clone(),
        }
    }

    /// Channel towards whoever sent `envelope`, if they said where.
    pub fn back_channel(&self, reply_to: &Endpoints) -> Option<Arc<dyn Channel>> {
        if reply_to.is_empty() {
            return None;
        }
        Some(Arc::new(self.channel(reply_to)))
    }

    /// Server half: hand an incoming body to `service`.
    pub async fn serve(&self, service: &Arc<dyn Service>, body: HttpEnvelope) -> Response {
        let back = self.back_channel(&body.reply_to);
        service.serve(body.envelope, back).await
    }
}

fn rpc_url(endpoint: &Endpoint) -> String {
    format!("http://{}/rpc", endpoint)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(
        &self,
        endpoints: &Endpoints,
        _inbound: Arc<dyn Service>,
    ) -> Result<Arc<dyn Channel>> {
        if endpoints.is_empty() {
            return Err(QuireError::Network("no endpoints to connect to".to_string()));
        }
        Ok(Arc::new(self.channel(endpoints)))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

struct HttpChannel {
    client: reqwest::Client,
    urls: Vec<String>,
    reply_to: Endpoints,
}

#[async_trait]
impl Channel for HttpChannel {
    async fn call(&self, envelope: Envelope) -> Result<Response> {
        let body = HttpEnvelope {
            envelope,
            reply_to: self.reply_to.clone(),
        };

        let mut last_error = None;
        for url in &self.urls {
            let response = match self.client.post(url).json(&body).send().await {
                Ok(response) => response,
                Err(error) => {
                    tracing::debug!("rpc to {} failed: {}", url, error);
                    last_error = Some(QuireError::from(error));
                    continue;
                }
            };

            if !response.status().is_success() {
                return Err(QuireError::Network(format!(
                    "rpc to {} failed: status={}",
                    url,
                    response.status()
                )));
            }
            return Ok(response.json::<Response>().await?);
        }

        Err(last_error.unwrap_or_else(|| QuireError::Network("no endpoints".to_string())))
    }

    // Each call is independent; failures surface per call.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }

    fn is_closed(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::rpc::Request;

    #[test]
    fn test_envelope_defaults_reply_to() {
        let envelope = Envelope::new(None, Request::KouncilFetchEntries);
        let json = serde_json::json!({ "envelope": envelope });
        let decoded: HttpEnvelope = serde_json::from_value(json).unwrap();
        assert!(decoded.reply_to.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_error() {
        let transport = HttpTransport::new(Endpoints::new(), Duration::from_millis(200)).unwrap();
        let endpoints: Endpoints = ["127.0.0.1:1"].into_iter().collect();
        struct Nothing;
        #[async_trait]
        impl Service for Nothing {
            async fn serve(&self, _: Envelope, _: Option<Arc<dyn Channel>>) -> Response {
                Response::Done
            }
        }

        let channel = transport.connect(&endpoints, Arc::new(Nothing)).await.unwrap();
        let result = channel
            .call(Envelope::new(
                Some(Address::hash(b"me")),
                Request::Fetch {
                    address: Address::null(),
                },
            ))
            .await;
        assert!(matches!(result, Err(error) if error.is_network()));
        assert!(transport.back_channel(&Endpoints::new()).is_none());
    }
}
