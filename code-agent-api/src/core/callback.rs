//! Fire-and-forget webhook delivery for async execution results.
//!
//! The `secret` query parameter never travels in the URL we actually hit:
//! it is stripped and moved into the `X-Webhook-Secret` header. Delivery
//! problems are logged and swallowed; a broken callback target must not
//! disturb execution.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tracing::{debug, info, warn};

use crate::core::config::CallbackConfig;
use crate::models::result::ExecutionResult;

pub const SECRET_HEADER: &str = "X-Webhook-Secret";
const SECRET_PARAM: &str = "secret";

/// A callback URL with the secret separated out.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PreparedUrl {
    pub url: String,
    pub secret: Option<String>,
}

/// Pull the `secret` query parameter out of `raw`. Unparseable URLs pass
/// through untouched and fail later, at delivery, where the error gets
/// logged.
pub(crate) fn split_secret(raw: &str) -> PreparedUrl {
    let Ok(mut url) = Url::parse(raw) else {
        return PreparedUrl {
            url: raw.to_string(),
            secret: None,
        };
    };

    let mut secret = None;
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(key, value)| {
            if key == SECRET_PARAM {
                secret = Some(value.into_owned());
                None
            } else {
                Some((key.into_owned(), value.into_owned()))
            }
        })
        .collect();

    if secret.is_some() {
        if remaining.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(remaining);
        }
    }

    PreparedUrl {
        url: url.to_string(),
        secret,
    }
}

/// Redact the secret for log output.
pub(crate) fn mask_secret(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    let masked: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            let value = if key == SECRET_PARAM {
                "***".to_string()
            } else {
                value.into_owned()
            };
            (key.into_owned(), value)
        })
        .collect();
    if !masked.is_empty() {
        url.query_pairs_mut().clear().extend_pairs(masked);
    }
    url.to_string()
}

/// Posts execution results to webhook targets.
pub struct CallbackDispatcher {
    client: reqwest::Client,
    config: CallbackConfig,
}

impl CallbackDispatcher {
    pub fn new(config: CallbackConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }

    /// Build a callback URL from the configured base for requests that
    /// did not bring their own.
    pub fn synthesize_url(&self, request_id: &str) -> Option<String> {
        let base = self.config.base_url.as_deref()?;
        Some(format!("{}/{}", base.trim_end_matches('/'), request_id))
    }

    /// Deliver `payload` to `url` on a detached task. Never blocks, never
    /// fails from the caller's point of view.
    pub fn dispatch(self: &Arc<Self>, url: String, payload: ExecutionResult) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.deliver(url, payload).await;
        });
    }

    async fn deliver(&self, url: String, payload: ExecutionResult) {
        let request_id = payload.request_id.clone();

        if let Some(pattern) = self.config.suppress_pattern.as_deref()
            && url.contains(pattern)
        {
            info!(
                request_id,
                url = %mask_secret(&url),
                "callback suppressed by configured pattern"
            );
            return;
        }

        let prepared = split_secret(&url);
        let mut request = self.client.post(&prepared.url).json(&payload);
        if let Some(secret) = prepared.secret {
            request = request.header(SECRET_HEADER, secret);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(request_id, url = %prepared.url, "callback delivered");
            },
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(
                    request_id,
                    url = %prepared.url,
                    %status,
                    body,
                    "callback target rejected the result"
                );
            },
            Err(error) => {
                warn!(
                    request_id,
                    url = %prepared.url,
                    %error,
                    "callback delivery failed"
                );
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_moves_out_of_the_query_string() {
        let prepared = split_secret("http://cb.example/x?secret=s3cr3t");
        assert_eq!(prepared.url, "http://cb.example/x");
        assert_eq!(prepared.secret.as_deref(), Some("s3cr3t"));
    }

    #[test]
    fn other_query_parameters_survive() {
        let prepared = split_secret("http://cb.example/x?a=1&secret=s&b=2");
        assert_eq!(prepared.url, "http://cb.example/x?a=1&b=2");
        assert_eq!(prepared.secret.as_deref(), Some("s"));
    }

    #[test]
    fn url_without_secret_is_untouched() {
        let prepared = split_secret("http://cb.example/x?a=1");
        assert_eq!(prepared.url, "http://cb.example/x?a=1");
        assert_eq!(prepared.secret, None);
    }

    #[test]
    fn unparseable_url_passes_through() {
        let prepared = split_secret("not a url");
        assert_eq!(prepared.url, "not a url");
        assert_eq!(prepared.secret, None);
    }

    #[test]
    fn masking_redacts_only_the_secret() {
        let masked = mask_secret("http://cb.example/x?a=1&secret=s3cr3t");
        assert!(masked.contains("secret=***"));
        assert!(masked.contains("a=1"));
        assert!(!masked.contains("s3cr3t"));
    }

    #[test]
    fn synthesized_url_joins_base_and_request_id() {
        let dispatcher = CallbackDispatcher::new(CallbackConfig {
            base_url: Some("http://cb.example/results/".into()),
            timeout_ms: 1_000,
            suppress_pattern: None,
        })
        .unwrap();
        assert_eq!(
            dispatcher.synthesize_url("api-1-2").as_deref(),
            Some("http://cb.example/results/api-1-2")
        );
    }

    #[test]
    fn no_base_url_means_no_synthesized_callback() {
        let dispatcher = CallbackDispatcher::new(CallbackConfig {
            base_url: None,
            timeout_ms: 1_000,
            suppress_pattern: None,
        })
        .unwrap();
        assert_eq!(dispatcher.synthesize_url("api-1-2"), None);
    }
}
