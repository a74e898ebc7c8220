//! Provider I/O stage: the single-shot upstream HTTP exchange.
//!
//! The terminal stage of every chain. Owns the retry-free network call:
//! builds the provider request with per-credential authentication, performs
//! it, and decodes failures into the error taxonomy (401 → 6001, 429 → 7001
//! with `Retry-After`, 5xx → 4005, transport → 5001/4002). Retry, failover,
//! and credential rotation live above in the scheduler.

use crate::context::ExecutionContext;
use crate::error::{ErrorCode, PipelineError, Result};
use crate::payload::{Payload, Reply, SseFrame};
use crate::stage::Stage;
use crate::stages::sse::SseDecoder;
use crate::token_cache::{AccessToken, TokenCache};
use async_trait::async_trait;
use futures::stream::Stream;
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How the provider authenticates requests.
pub enum ProviderAuth {
    /// No authentication (local inference servers).
    None,
    /// Static API keys sent as `Authorization: Bearer`; the active key is
    /// selected by the credential index and rotated on auth failure.
    ApiKeys(Vec<String>),
    /// OAuth access token from a [`TokenCache`], refreshed via the standard
    /// refresh grant when a token endpoint is configured.
    OAuth {
        cache: TokenCache,
        token_endpoint: Option<String>,
        client_id: Option<String>,
    },
}

impl std::fmt::Debug for ProviderAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderAuth::None => f.write_str("None"),
            ProviderAuth::ApiKeys(keys) => f
                .debug_tuple("ApiKeys")
                .field(&format!("{} key(s) ***", keys.len()))
                .finish(),
            ProviderAuth::OAuth { token_endpoint, .. } => f
                .debug_struct("OAuth")
                .field("token_endpoint", token_endpoint)
                .finish(),
        }
    }
}

/// Terminal stage performing the upstream HTTP exchange.
#[derive(Debug)]
pub struct ProviderStage {
    name: String,
    provider_id: String,
    base_url: String,
    /// Request path appended to the base URL (e.g. `/v1/chat/completions`).
    path: String,
    client: Client,
    auth: ProviderAuth,
    credential_index: AtomicUsize,
    extra_headers: Vec<(String, String)>,
}

impl ProviderStage {
    pub fn new(
        name: impl Into<String>,
        provider_id: impl Into<String>,
        base_url: impl Into<String>,
        path: impl Into<String>,
        auth: ProviderAuth,
    ) -> Self {
        Self {
            name: name.into(),
            provider_id: provider_id.into(),
            base_url: normalize_base_url(&base_url.into()),
            path: path.into(),
            client: Client::new(),
            auth,
            credential_index: AtomicUsize::new(0),
            extra_headers: Vec::new(),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Add a provider-quirk header (e.g. `anthropic-version`).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_credential_index(self, index: usize) -> Self {
        self.credential_index.store(index, Ordering::Relaxed);
        self
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn credential_index(&self) -> usize {
        self.credential_index.load(Ordering::Relaxed)
    }

    pub fn credential_count(&self) -> usize {
        match &self.auth {
            ProviderAuth::ApiKeys(keys) => keys.len(),
            _ => 1,
        }
    }

    /// Advance to the next credential: `(current + 1) mod N`. Returns the new
    /// index and whether the rotation wrapped past the last credential.
    pub fn rotate_credential(&self) -> (usize, bool) {
        let count = self.credential_count().max(1);
        let previous = self.credential_index.fetch_add(1, Ordering::Relaxed);
        let next = (previous + 1) % count;
        self.credential_index.store(next, Ordering::Relaxed);
        (next, next == 0)
    }

    async fn bearer(&self) -> Result<Option<String>> {
        match &self.auth {
            ProviderAuth::None => Ok(None),
            ProviderAuth::ApiKeys(keys) => {
                if keys.is_empty() {
                    return Err(PipelineError::new(
                        ErrorCode::CREDENTIALS_EXHAUSTED,
                        format!("provider '{}' has no credentials", self.provider_id),
                    ));
                }
                let index = self.credential_index.load(Ordering::Relaxed) % keys.len();
                Ok(Some(keys[index].clone()))
            }
            ProviderAuth::OAuth { cache, .. } => match cache.load_access().await? {
                Some(token) if !token.is_expired() => Ok(Some(token.access_token)),
                _ => Err(PipelineError::new(
                    ErrorCode::TOKEN_EXPIRED,
                    format!("provider '{}' access token missing or expired", self.provider_id),
                )),
            },
        }
    }

    /// Exchange the refresh token for a fresh access token and persist it.
    pub async fn refresh_auth(&self) -> Result<()> {
        let ProviderAuth::OAuth {
            cache,
            token_endpoint,
            client_id,
        } = &self.auth
        else {
            return Ok(());
        };
        let Some(endpoint) = token_endpoint else {
            return Err(PipelineError::new(
                ErrorCode::TOKEN_EXPIRED,
                format!("provider '{}' has no token endpoint configured", self.provider_id),
            ));
        };
        let Some(refresh) = cache.load_refresh().await? else {
            return Err(PipelineError::new(
                ErrorCode::TOKEN_EXPIRED,
                format!("provider '{}' has no refresh token", self.provider_id),
            ));
        };

        let mut form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh.refresh_token),
        ];
        if let Some(id) = client_id {
            form.push(("client_id".to_string(), id.clone()));
        }

        let resp = self.client.post(endpoint).form(&form).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::from_http_status(status, body, None)
                .with_instance(self.provider_id.clone()));
        }

        let body: Value = resp.json().await?;
        let access = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PipelineError::new(
                    ErrorCode::DECODE_FAILED,
                    "token endpoint response missing access_token",
                )
            })?;
        let token = AccessToken {
            access_token: access.to_string(),
            token_type: body
                .get("token_type")
                .and_then(|v| v.as_str())
                .unwrap_or("Bearer")
                .to_string(),
            expires_in: body.get("expires_in").and_then(|v| v.as_u64()).unwrap_or(3600),
            scope: body.get("scope").and_then(|v| v.as_str()).map(String::from),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        cache.store_access(&token).await
    }

    fn parse_retry_after(value: &str) -> Option<Duration> {
        value.trim().parse::<u64>().ok().map(Duration::from_secs)
    }

    async fn send(&self, payload: &Payload) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, self.path);
        let mut req = self.client.post(&url).json(&payload.body);
        if let Some(token) = self.bearer().await? {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        for (name, value) in &self.extra_headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(Self::parse_retry_after);
            let body = resp.text().await.unwrap_or_default();
            return Err(
                PipelineError::from_http_status(status, body, retry_after)
                    .with_instance(self.provider_id.clone()),
            );
        }
        Ok(resp)
    }
}

fn frame_stream(resp: reqwest::Response) -> crate::payload::FrameStream {
    struct State {
        body: Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>,
        decoder: SseDecoder,
        queue: VecDeque<SseFrame>,
        done: bool,
    }

    let body = resp
        .bytes_stream()
        .map(|chunk| match chunk {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(err) => Err(PipelineError::from(err)),
        });

    let state = State {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        queue: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(frame) = st.queue.pop_front() {
                return Some((Ok(frame), st));
            }
            if st.done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => st.queue.extend(st.decoder.decode(&chunk)),
                Some(Err(err)) => {
                    st.done = true;
                    return Some((Err(err), st));
                }
                None => {
                    st.done = true;
                    st.queue.extend(st.decoder.flush());
                }
            }
        }
    }))
}

#[async_trait]
impl Stage for ProviderStage {
    fn kind(&self) -> &'static str {
        "provider"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn rotate_credential(&self) -> Option<(usize, bool)> {
        match &self.auth {
            ProviderAuth::ApiKeys(_) => Some(ProviderStage::rotate_credential(self)),
            _ => None,
        }
    }

    async fn refresh_auth(&self) -> Result<()> {
        ProviderStage::refresh_auth(self).await
    }

    async fn process(&self, _ctx: &ExecutionContext, payload: Payload) -> Result<Payload> {
        Ok(payload)
    }

    async fn process_response(&self, _ctx: &ExecutionContext, reply: Reply) -> Result<Reply> {
        Ok(reply)
    }

    async fn call(&self, ctx: &ExecutionContext, payload: Payload) -> Result<Reply> {
        ctx.check_cancelled()?;
        let resp = self
            .send(&payload)
            .await
            .map_err(|e| e.with_virtual_model(ctx.virtual_model.as_str()))?;

        if payload.stream {
            Ok(Reply::Stream(frame_stream(resp)))
        } else {
            let body: Value = resp.json().await.map_err(PipelineError::from)?;
            Ok(Reply::Complete(body))
        }
    }

    async fn health_probe(&self) -> Result<()> {
        // Token validity is the one probe that costs nothing upstream.
        if let ProviderAuth::OAuth { cache, .. } = &self.auth {
            match cache.load_access().await? {
                Some(token) if !token.is_expired() => Ok(()),
                _ => Err(PipelineError::new(
                    ErrorCode::TOKEN_EXPIRED,
                    format!("provider '{}' access token missing or expired", self.provider_id),
                )),
            }
        } else {
            Ok(())
        }
    }
}

/// Strip known provider path suffixes so configured base URLs and per-stage
/// paths never double up.
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    for suffix in &["/v1/chat/completions", "/v1/messages", "/v1"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}
