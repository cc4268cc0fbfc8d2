use std::{sync::Arc, time::Duration};

use {
    futures::future::join_all,
    parley_common::{Result, now_ms},
    parley_config::WebhookConfig,
    serde::Serialize,
    tracing::{debug, warn},
};

use crate::auth::{SIGNATURE_HEADER, WebhookAuthenticator};

/// Per-call delivery tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Posts sealed envelopes to every configured subscriber, once.
pub struct WebhookBroadcaster {
    client: reqwest::Client,
    auth: Arc<WebhookAuthenticator>,
    subscribers: Vec<String>,
}

impl WebhookBroadcaster {
    pub fn new(config: &WebhookConfig, auth: Arc<WebhookAuthenticator>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.delivery_timeout_ms))
            .build()
            .map_err(|e| parley_common::Error::external("building webhook client", e))?;
        Ok(Self {
            client,
            auth,
            subscribers: config.subscribers.clone(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub async fn broadcast(&self, event: &str, data: serde_json::Value) -> Result<BroadcastReport> {
        if self.subscribers.is_empty() {
            return Ok(BroadcastReport::default());
        }

        let envelope = self.auth.seal(event, data, now_ms())?;
        let body = serde_json::to_vec(&envelope)?;
        let body_sig = self.auth.sign(&body)?;

        let sends = self.subscribers.iter().map(|url| {
            let request = self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(SIGNATURE_HEADER, &body_sig)
                .body(body.clone());
            async move {
                match request.send().await.and_then(|r| r.error_for_status()) {
                    Ok(resp) => {
                        debug!(url = %url, status = %resp.status(), event, "webhook delivered");
                        true
                    },
                    Err(e) => {
                        warn!(url = %url, event, error = %e, "webhook delivery failed");
                        false
                    },
                }
            }
        });

        let results = join_all(sends).await;
        let delivered = results.iter().filter(|ok| **ok).count();
        Ok(BroadcastReport {
            delivered,
            failed: results.len() - delivered,
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        axum::{Router, body::Bytes, extract::State, http::HeaderMap, routing::post},
        secrecy::Secret,
        tokio::sync::mpsc,
    };

    async fn receiver() -> (String, mpsc::UnboundedReceiver<(HeaderMap, Bytes)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route(
                "/hook",
                post(
                    |State(tx): State<mpsc::UnboundedSender<(HeaderMap, Bytes)>>,
                     headers: HeaderMap,
                     body: Bytes| async move {
                        let _ = tx.send((headers, body));
                        "ok"
                    },
                ),
            )
            .with_state(tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), rx)
    }

    #[tokio::test]
    async fn delivers_signed_envelopes_and_counts_failures() {
        let (url, mut rx) = receiver().await;
        let config = WebhookConfig {
            secret: Secret::new("abc".into()),
            subscribers: vec![url, "http://127.0.0.1:1/unreachable".into()],
            delivery_timeout_ms: 2_000,
            ..Default::default()
        };
        let auth = Arc::new(WebhookAuthenticator::new(&config));
        let broadcaster = WebhookBroadcaster::new(&config, Arc::clone(&auth)).unwrap();

        let report = broadcaster
            .broadcast("session.connected", serde_json::json!({"attempt": 0}))
            .await
            .unwrap();
        assert_eq!(report, BroadcastReport {
            delivered: 1,
            failed: 1
        });

        let (headers, body) = rx.recv().await.unwrap();
        let sig = headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
        assert!(auth.verify(&body, sig));

        let env: crate::SealedEnvelope = serde_json::from_slice(&body).unwrap();
        let claims = auth
            .open_envelope(&env.token, &env.signature, now_ms())
            .unwrap();
        assert_eq!(claims.event, "session.connected");
    }

    #[tokio::test]
    async fn no_subscribers_is_a_noop() {
        let config = WebhookConfig::default();
        let auth = Arc::new(WebhookAuthenticator::new(&config));
        let broadcaster = WebhookBroadcaster::new(&config, auth).unwrap();
        assert!(broadcaster.is_empty());
        let report = broadcaster
            .broadcast("x", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(report, BroadcastReport::default());
    }
}
