//! Inbound operations: buffered and streaming chat completion.
//!
//! The full pipeline unit is token acquisition, quota check, challenge,
//! session, completion request and stream start; the retry supervisor
//! re-executes that unit from scratch on failure. Once normalized deltas
//! have reached the caller, failures degrade to an in-band terminal delta
//! instead of a second pipeline execution.

use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use chat2api_protocol::connect;
use chat2api_protocol::event::classify;
use chat2api_protocol::openai::{ChatCompletion, ChatCompletionChunk};
use chat2api_protocol::sse::{DONE_EVENT, SseParser};

use crate::challenge;
use crate::config::{UpstreamConfig, WireProtocol};
use crate::error::{CoreError, CoreResult};
use crate::identity::IdentitySet;
use crate::prompt::{self, ChatMessage};
use crate::retry::run_with_retry;
use crate::session::{SessionHandle, parse_conversation_ref};
use crate::solver::PowSolver;
use crate::token::{AccessToken, TokenCache};
use crate::transcode::{OutputPolicy, StreamTranscoder, chunk_to_sse};
use crate::transport::{ByteStream, UpstreamBody, UpstreamClient};
use crate::upstream::{COMPLETION_PATH, CompletionBody, Upstream, check_envelope};

/// Downstream byte stream of normalized deltas framed as SSE, ending with a
/// `stop` chunk followed by the literal `[DONE]` event.
pub type NormalizedStream = mpsc::Receiver<Bytes>;

const DEFAULT_APP_VERSION: &str = "20241129.1";
const STREAM_ERROR_NOTE: &str = "服务暂时不可用，第三方响应错误";

pub struct ChatCore {
    client: Arc<dyn UpstreamClient>,
    solver: Arc<dyn PowSolver>,
    cache: TokenCache,
    config: UpstreamConfig,
    app_version: RwLock<String>,
}

struct StreamContext {
    body: ByteStream,
    transcoder: StreamTranscoder,
    session: SessionHandle,
    identity: IdentitySet,
    token: AccessToken,
}

impl ChatCore {
    pub fn new(
        client: Arc<dyn UpstreamClient>,
        solver: Arc<dyn PowSolver>,
        config: UpstreamConfig,
    ) -> Self {
        Self {
            client,
            solver,
            cache: TokenCache::new(),
            config,
            app_version: RwLock::new(DEFAULT_APP_VERSION.to_string()),
        }
    }

    /// Splits a comma-joined authorization value into independent
    /// credentials; callers multiplex several accounts behind one key.
    pub fn split_credentials(authorization: &str) -> Vec<String> {
        authorization
            .trim()
            .trim_start_matches("Bearer ")
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Probes whether a credential can still obtain an access token.
    pub async fn check_credential(&self, credential: &str) -> bool {
        let identity = self
            .cache
            .identity(credential, self.config.identity_template.as_ref())
            .await;
        self.acquire_token(credential, &identity).await.is_ok()
    }

    /// Best-effort refresh of the app-version header replayed upstream.
    pub async fn refresh_app_version(&self) {
        if let Some(version) = self.upstream().fetch_app_version().await {
            info!(%version, "upstream app version updated");
            if let Ok(mut guard) = self.app_version.write() {
                *guard = version;
            }
        }
    }

    pub async fn create_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        credential: &str,
        reference: Option<&str>,
    ) -> CoreResult<ChatCompletion> {
        let prompt = prompt::prepare(messages);
        match self.config.wire {
            WireProtocol::ConnectRpc => {
                run_with_retry(
                    |_| async {
                        let (_, transcoder) =
                            self.rpc_transcode(model, &prompt, credential, reference).await?;
                        Ok(transcoder.into_completion())
                    },
                    self.config.max_attempts,
                    self.config.retry_delay,
                )
                .await
            }
            WireProtocol::EventStream => {
                run_with_retry(
                    |_| self.buffered_completion(model, &prompt, credential, reference),
                    self.config.max_attempts,
                    self.config.retry_delay,
                )
                .await
            }
        }
    }

    pub async fn create_completion_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        credential: &str,
        reference: Option<&str>,
    ) -> CoreResult<NormalizedStream> {
        let prompt = prompt::prepare(messages);
        let (tx, rx) = mpsc::channel::<Bytes>(16);
        match self.config.wire {
            WireProtocol::ConnectRpc => {
                // The framed body arrives complete; chunks still go out one
                // by one in arrival order.
                let (chunks, _) = run_with_retry(
                    |_| self.rpc_transcode(model, &prompt, credential, reference),
                    self.config.max_attempts,
                    self.config.retry_delay,
                )
                .await?;
                tokio::spawn(async move {
                    for chunk in &chunks {
                        if tx.send(chunk_to_sse(chunk)).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Bytes::from_static(DONE_EVENT.as_bytes())).await;
                });
            }
            WireProtocol::EventStream => {
                let ctx = run_with_retry(
                    |_| self.attempt_open(model, &prompt, credential, reference),
                    self.config.max_attempts,
                    self.config.retry_delay,
                )
                .await?;
                let client = Arc::clone(&self.client);
                let config = self.config.clone();
                let app_version = self.app_version();
                tokio::spawn(async move {
                    pump_stream(ctx, client, config, app_version, tx).await;
                });
            }
        }
        Ok(rx)
    }

    fn app_version(&self) -> String {
        self.app_version
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|_| DEFAULT_APP_VERSION.to_string())
    }

    fn upstream(&self) -> Upstream<'_> {
        Upstream {
            client: self.client.as_ref(),
            config: &self.config,
            app_version: self.app_version(),
        }
    }

    async fn acquire_token(
        &self,
        credential: &str,
        identity: &IdentitySet,
    ) -> CoreResult<AccessToken> {
        let upstream = self.upstream();
        self.cache
            .acquire(credential, || upstream.refresh_token(identity, credential))
            .await
    }

    /// One pipeline attempt; an auth failure evicts the cached token so the
    /// next attempt refreshes from scratch.
    async fn attempt_open(
        &self,
        model: &str,
        prompt: &str,
        credential: &str,
        reference: Option<&str>,
    ) -> CoreResult<StreamContext> {
        let outcome = self.open_stream(model, prompt, credential, reference).await;
        if let Err(CoreError::Auth(_)) = &outcome {
            self.cache.evict(credential).await;
        }
        outcome
    }

    async fn open_stream(
        &self,
        model: &str,
        prompt: &str,
        credential: &str,
        reference: Option<&str>,
    ) -> CoreResult<StreamContext> {
        let identity = self
            .cache
            .identity(credential, self.config.identity_template.as_ref())
            .await;
        let token = self.acquire_token(credential, &identity).await?;
        let upstream = self.upstream();

        let thinking_enabled = model.contains("think") || model.contains("r1");
        let search_enabled = model.contains("search");
        if thinking_enabled {
            let remaining = upstream.thinking_quota(&identity, &token).await;
            if remaining <= 0 {
                return Err(CoreError::Quota("thinking quota exhausted".to_string()));
            }
        }

        // Challenges are single-use; every attempt fetches a fresh one.
        let challenge = upstream
            .create_challenge(&identity, &token, COMPLETION_PATH)
            .await?;
        let pow_response = challenge::solve(
            self.solver.as_ref(),
            &self.config.pow_resource_path,
            challenge,
            COMPLETION_PATH,
        )
        .await?;

        let session = match parse_conversation_ref(reference) {
            Some((id, parent)) => SessionHandle {
                id,
                parent_message_id: Some(parent),
                fresh: false,
            },
            None => SessionHandle {
                id: upstream.create_session(&identity, &token).await?,
                parent_message_id: None,
                fresh: true,
            },
        };

        let body = CompletionBody {
            chat_session_id: session.id.clone(),
            parent_message_id: session.parent_message_id.clone(),
            prompt: prompt.to_string(),
            ref_file_ids: Vec::new(),
            search_enabled,
            thinking_enabled,
        };
        let response = upstream
            .start_completion(&identity, &token, &pow_response, &body)
            .await?;

        if let Err(err) = upstream.send_events(&identity, &token, &session.id).await {
            debug!("telemetry event report failed: {err}");
        }

        let content_type = response.content_type().unwrap_or_default().to_string();
        if !content_type.contains("text/event-stream") {
            let bytes = response.into_bytes().await.unwrap_or_default();
            // A 40003 envelope surfaces as an auth failure and evicts.
            check_envelope(&bytes)?;
            return Err(CoreError::Protocol(format!(
                "stream response content-type invalid: {content_type}"
            )));
        }
        let body = match response.body {
            UpstreamBody::Stream(rx) => rx,
            UpstreamBody::Bytes(bytes) => {
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.try_send(Ok(bytes));
                rx
            }
        };

        let transcoder = StreamTranscoder::new(
            model,
            &session.id,
            OutputPolicy::from_model(model),
            unix_now(),
        );
        Ok(StreamContext {
            body,
            transcoder,
            session,
            identity,
            token,
        })
    }

    /// Runs the state machine to completion without exposing partial output.
    async fn buffered_completion(
        &self,
        model: &str,
        prompt: &str,
        credential: &str,
        reference: Option<&str>,
    ) -> CoreResult<ChatCompletion> {
        let mut ctx = self.attempt_open(model, prompt, credential, reference).await?;
        let mut parser = SseParser::new();
        while let Some(item) = ctx.body.recv().await {
            let bytes = item?;
            for event in parser.push_bytes(&bytes) {
                for chat_event in classify(&event) {
                    ctx.transcoder.push(chat_event);
                }
            }
            if ctx.transcoder.is_finished() {
                break;
            }
        }
        for event in parser.finish() {
            for chat_event in classify(&event) {
                ctx.transcoder.push(chat_event);
            }
        }
        ctx.transcoder.finish();

        self.teardown(&ctx.identity, &ctx.token, &ctx.session).await;
        Ok(ctx.transcoder.into_completion())
    }

    async fn rpc_transcode(
        &self,
        model: &str,
        prompt: &str,
        credential: &str,
        reference: Option<&str>,
    ) -> CoreResult<(Vec<ChatCompletionChunk>, StreamTranscoder)> {
        let identity = self
            .cache
            .identity(credential, self.config.identity_template.as_ref())
            .await;
        let upstream = self.upstream();
        let thinking = model.contains("think") || model.contains("r1");
        let body = upstream
            .rpc_completion(&identity, credential, prompt, thinking)
            .await?;
        let messages = connect::parse_stream(&body);
        if messages.is_empty() {
            return Err(CoreError::Protocol(
                "rpc response held no complete frames".to_string(),
            ));
        }

        let session_id = parse_conversation_ref(reference)
            .map(|(id, _)| id)
            .or_else(|| connect::extract_chat_id(&messages).map(str::to_string))
            .unwrap_or_default();
        let mut transcoder = StreamTranscoder::new(
            model,
            &session_id,
            OutputPolicy::from_model(model),
            unix_now(),
        );
        let mut chunks = Vec::new();
        for message in &messages {
            chunks.extend(transcoder.push_rpc(message));
        }
        chunks.extend(transcoder.finish());
        Ok((chunks, transcoder))
    }

    async fn teardown(&self, identity: &IdentitySet, token: &AccessToken, session: &SessionHandle) {
        if !session.fresh {
            return;
        }
        let upstream = self.upstream();
        if let Err(err) = upstream.delete_session(identity, token, &session.id).await {
            debug!("session teardown failed: {err}");
        }
    }
}

async fn pump_stream(
    mut ctx: StreamContext,
    client: Arc<dyn UpstreamClient>,
    config: UpstreamConfig,
    app_version: String,
    tx: mpsc::Sender<Bytes>,
) {
    let mut parser = SseParser::new();
    'transfer: while let Some(item) = ctx.body.recv().await {
        match item {
            Ok(bytes) => {
                for event in parser.push_bytes(&bytes) {
                    for chat_event in classify(&event) {
                        for chunk in ctx.transcoder.push(chat_event) {
                            if tx.send(chunk_to_sse(&chunk)).await.is_err() {
                                break 'transfer;
                            }
                        }
                    }
                }
                if ctx.transcoder.is_finished() {
                    break;
                }
            }
            Err(err) => {
                // The caller already holds partial output; no silent retry.
                warn!("upstream stream failed mid-flight: {err}");
                for chunk in ctx.transcoder.interrupt(STREAM_ERROR_NOTE) {
                    if tx.send(chunk_to_sse(&chunk)).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    if !ctx.transcoder.is_finished() {
        for event in parser.finish() {
            for chat_event in classify(&event) {
                for chunk in ctx.transcoder.push(chat_event) {
                    let _ = tx.send(chunk_to_sse(&chunk)).await;
                }
            }
        }
        for chunk in ctx.transcoder.finish() {
            let _ = tx.send(chunk_to_sse(&chunk)).await;
        }
    }
    let _ = tx.send(Bytes::from_static(DONE_EVENT.as_bytes())).await;
    info!("stream transfer complete");

    let upstream = Upstream {
        client: client.as_ref(),
        config: &config,
        app_version,
    };
    if ctx.session.fresh
        && let Err(err) = upstream
            .delete_session(&ctx.identity, &ctx.token, &ctx.session.id)
            .await
    {
        debug!("session teardown failed: {err}");
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
