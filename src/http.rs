use crate::error::{Error, Result};
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode, header, redirect};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// A response body read up to a byte cap.
#[derive(Debug)]
pub struct CappedBody {
    pub content_type: Option<String>,
    pub text: String,
    /// True when the body was longer than the cap.
    pub truncated: bool,
}

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    max_retries: u32,
    base_delay_ms: u64,
}

impl HttpClient {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        Self::with_redirect_policy(user_agent, timeout, redirect::Policy::limited(10))
    }

    pub fn with_redirect_policy(
        user_agent: &str,
        timeout: Duration,
        policy: redirect::Policy,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(policy)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::http(e.to_string()))?;

        Ok(Self {
            client,
            max_retries: 3,
            base_delay_ms: 1000,
        })
    }

    /// Override the retry budget for transient (connect/timeout) failures.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub async fn get_text_authed(&self, url: &str, token: &str) -> Result<String> {
        let resp = self
            .send_with_retry(|| {
                self.client
                    .get(url)
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
            })
            .await?;
        resp.text().await.map_err(|e| Error::http(e.to_string()))
    }

    /// GET `url`, reading at most `max_bytes` of the body and dropping the rest.
    pub async fn get_capped(&self, url: &str, max_bytes: usize) -> Result<CappedBody> {
        let resp = self.send_with_retry(|| self.client.get(url)).await?;
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase());

        let mut buf: Vec<u8> = Vec::new();
        let mut truncated = false;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::http(e.to_string()))?;
            let room = max_bytes - buf.len();
            if chunk.len() > room {
                buf.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            buf.extend_from_slice(&chunk);
        }
        debug!(url, bytes = buf.len(), truncated, "read capped body");

        Ok(CappedBody {
            content_type,
            text: String::from_utf8_lossy(&buf).into_owned(),
            truncated,
        })
    }

    pub async fn post_json_raw(
        &self,
        url: &str,
        body: &str,
        headers: &[(&str, &str)],
    ) -> Result<String> {
        let resp = self.post_stream(url, body, headers).await?;
        resp.text().await.map_err(|e| Error::http(e.to_string()))
    }

    /// POST a JSON body and hand back the live response once the status is known to be 2xx.
    ///
    /// The caller owns the body; used for server-sent event streams.
    pub async fn post_stream(
        &self,
        url: &str,
        body: &str,
        headers: &[(&str, &str)],
    ) -> Result<Response> {
        self.send_with_retry(|| {
            let mut req = self
                .client
                .post(url)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.to_string());
            for (k, v) in headers {
                req = req.header(*k, *v);
            }
            req
        })
        .await
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_error = Error::http("no attempts made");
        let mut delay = self.base_delay_ms;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                debug!(attempt, delay_ms = delay, "retrying request");
                sleep(Duration::from_millis(delay)).await;
                delay = (delay * 2).min(30_000);
            }

            match build().send().await {
                Ok(resp) => return check_status(resp).await,
                Err(e) => {
                    last_error = Error::http(e.to_string());
                    if e.is_timeout() || e.is_connect() {
                        warn!(attempt, "transient failure, will retry");
                        continue;
                    }
                    return Err(last_error);
                }
            }
        }

        Err(last_error)
    }
}

async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let url = resp.url().to_string();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        return Err(Error::RateLimit {
            platform: extract_domain(&url),
            retry_after_secs: retry_after,
        });
    }

    let body = resp.text().await.unwrap_or_default();
    Err(Error::api_with_status(
        extract_domain(&url),
        body,
        status.as_u16(),
    ))
}

pub(crate) fn extract_domain(url: &str) -> String {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_domain_strips_scheme_and_path() {
        assert_eq!(
            extract_domain("https://openrouter.ai/api/v1/chat/completions"),
            "openrouter.ai"
        );
        assert_eq!(extract_domain("http://127.0.0.1:7860/"), "127.0.0.1:7860");
        assert_eq!(extract_domain("garbage"), "unknown");
    }
}
