//! Upstream endpoint layer: request building and response envelopes.
//!
//! Every call wears the full browser header block plus the derived identity
//! material; the upstream cross-checks these against each other, so they
//! come from one [`IdentitySet`] rather than being assembled ad hoc.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use crate::challenge::Challenge;
use crate::config::UpstreamConfig;
use crate::error::{CoreError, CoreResult};
use crate::identity::IdentitySet;
use crate::token::AccessToken;
use crate::transport::{
    Headers, HttpMethod, UpstreamClient, UpstreamHttpRequest, UpstreamHttpResponse, header_set,
};

pub(crate) const COMPLETION_PATH: &str = "/api/v0/chat/completion";
const TOKEN_PATH: &str = "/api/v0/users/current";
const CHALLENGE_PATH: &str = "/api/v0/chat/create_pow_challenge";
const SESSION_CREATE_PATH: &str = "/api/v0/chat_session/create";
const SESSION_DELETE_PATH: &str = "/api/v0/chat_session/delete";
const QUOTA_PATH: &str = "/api/v0/users/feature_quota";
const EVENTS_PATH: &str = "/api/v0/events";
const VERSION_PATH: &str = "/version.txt";
const POW_HEADER: &str = "X-Ds-Pow-Response";

const CODE_TOKEN_INVALIDATED: i64 = 40003;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36";

#[derive(Debug, Serialize)]
pub(crate) struct CompletionBody {
    pub chat_session_id: String,
    pub parent_message_id: Option<String>,
    pub prompt: String,
    pub ref_file_ids: Vec<String>,
    pub search_enabled: bool,
    pub thinking_enabled: bool,
}

pub(crate) struct Upstream<'a> {
    pub client: &'a dyn UpstreamClient,
    pub config: &'a UpstreamConfig,
    pub app_version: String,
}

impl Upstream<'_> {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn browser_headers(&self, identity: &IdentitySet) -> Headers {
        let origin = self.config.base_url.trim_end_matches('/').to_string();
        let mut headers = Headers::new();
        header_set(&mut headers, "Accept", "*/*");
        header_set(&mut headers, "Accept-Encoding", "gzip, deflate, br, zstd");
        header_set(&mut headers, "Accept-Language", "zh-CN,zh;q=0.9,en;q=0.8");
        header_set(&mut headers, "Origin", origin.clone());
        header_set(&mut headers, "Pragma", "no-cache");
        header_set(&mut headers, "Priority", "u=1, i");
        header_set(&mut headers, "Referer", format!("{origin}/"));
        header_set(
            &mut headers,
            "Sec-Ch-Ua",
            "\"Chromium\";v=\"134\", \"Not:A-Brand\";v=\"24\", \"Google Chrome\";v=\"134\"",
        );
        header_set(&mut headers, "Sec-Ch-Ua-Mobile", "?0");
        header_set(&mut headers, "Sec-Ch-Ua-Platform", "\"macOS\"");
        header_set(&mut headers, "Sec-Fetch-Dest", "empty");
        header_set(&mut headers, "Sec-Fetch-Mode", "cors");
        header_set(&mut headers, "Sec-Fetch-Site", "same-origin");
        header_set(&mut headers, "User-Agent", USER_AGENT);
        header_set(&mut headers, "X-App-Version", self.app_version.clone());
        header_set(&mut headers, "X-Client-Locale", "zh-CN");
        header_set(&mut headers, "X-Client-Platform", "web");
        header_set(&mut headers, "X-Client-Version", "1.0.0-always");
        header_set(&mut headers, "Cookie", identity.cookie.clone());
        header_set(&mut headers, "x-flow-trace", identity.flow_trace_id.clone());
        headers
    }

    fn authed_headers(&self, identity: &IdentitySet, bearer: &str) -> Headers {
        let mut headers = self.browser_headers(identity);
        header_set(&mut headers, "Authorization", format!("Bearer {bearer}"));
        headers
    }

    async fn call_json(
        &self,
        method: HttpMethod,
        path: &str,
        headers: Headers,
        body: Option<Value>,
    ) -> CoreResult<Value> {
        let mut headers = headers;
        let body = match body {
            Some(value) => {
                header_set(&mut headers, "Content-Type", "application/json");
                Some(Bytes::from(serde_json::to_vec(&value).map_err(|err| {
                    CoreError::Protocol(err.to_string())
                })?))
            }
            None => None,
        };
        let response = self
            .client
            .send(UpstreamHttpRequest {
                method,
                url: self.url(path),
                headers,
                body,
                is_stream: false,
            })
            .await?;
        let bytes = response.into_bytes().await?;
        check_envelope(&bytes)
    }

    /// Exchanges the long-lived credential for a short-lived access token.
    pub async fn refresh_token(
        &self,
        identity: &IdentitySet,
        credential: &str,
    ) -> CoreResult<AccessToken> {
        let data = self
            .call_json(
                HttpMethod::Get,
                TOKEN_PATH,
                self.authed_headers(identity, credential),
                None,
            )
            .await?;
        let token = data
            .pointer("/biz_data/token")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::Auth("refresh response carried no token".to_string()))?;
        info!("access token refreshed");
        Ok(AccessToken {
            value: token.to_string(),
            refresh_time: unix_now() + self.config.token_ttl_secs,
        })
    }

    pub async fn create_session(
        &self,
        identity: &IdentitySet,
        token: &AccessToken,
    ) -> CoreResult<String> {
        let data = self
            .call_json(
                HttpMethod::Post,
                SESSION_CREATE_PATH,
                self.authed_headers(identity, &token.value),
                Some(json!({ "character_id": null })),
            )
            .await?;
        data.pointer("/biz_data/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                CoreError::Protocol(
                    "session create failed; the account or address may be restricted".to_string(),
                )
            })
    }

    /// Best-effort: callers swallow the error after logging it.
    pub async fn delete_session(
        &self,
        identity: &IdentitySet,
        token: &AccessToken,
        session_id: &str,
    ) -> CoreResult<()> {
        self.call_json(
            HttpMethod::Post,
            SESSION_DELETE_PATH,
            self.authed_headers(identity, &token.value),
            Some(json!({ "chat_session_id": session_id })),
        )
        .await?;
        Ok(())
    }

    pub async fn create_challenge(
        &self,
        identity: &IdentitySet,
        token: &AccessToken,
        target_path: &str,
    ) -> CoreResult<Challenge> {
        let data = self
            .call_json(
                HttpMethod::Post,
                CHALLENGE_PATH,
                self.authed_headers(identity, &token.value),
                Some(json!({ "target_path": target_path })),
            )
            .await
            .map_err(challenge_error)?;
        let challenge = data
            .pointer("/biz_data/challenge")
            .cloned()
            .ok_or_else(|| CoreError::Challenge("challenge response missing".to_string()))?;
        serde_json::from_value(challenge).map_err(|err| CoreError::Challenge(err.to_string()))
    }

    /// Remaining thinking-feature quota; failures degrade to zero.
    pub async fn thinking_quota(&self, identity: &IdentitySet, token: &AccessToken) -> i64 {
        let data = match self
            .call_json(
                HttpMethod::Get,
                QUOTA_PATH,
                self.authed_headers(identity, &token.value),
                None,
            )
            .await
        {
            Ok(data) => data,
            Err(err) => {
                debug!("thinking quota probe failed: {err}");
                return 0;
            }
        };
        let quota = data.pointer("/biz_data/thinking/quota").and_then(Value::as_i64);
        let used = data.pointer("/biz_data/thinking/used").and_then(Value::as_i64);
        match (quota, used) {
            (Some(quota), Some(used)) => quota - used,
            _ => 0,
        }
    }

    pub async fn start_completion(
        &self,
        identity: &IdentitySet,
        token: &AccessToken,
        pow_response: &str,
        body: &CompletionBody,
    ) -> CoreResult<UpstreamHttpResponse> {
        let mut headers = self.authed_headers(identity, &token.value);
        header_set(&mut headers, "Content-Type", "application/json");
        header_set(&mut headers, POW_HEADER, pow_response);
        let body =
            serde_json::to_vec(body).map_err(|err| CoreError::Protocol(err.to_string()))?;
        self.client
            .send(UpstreamHttpRequest {
                method: HttpMethod::Post,
                url: self.url(COMPLETION_PATH),
                headers,
                body: Some(Bytes::from(body)),
                is_stream: true,
            })
            .await
    }

    /// RPC variant: one encoded request envelope, one complete framed body.
    pub async fn rpc_completion(
        &self,
        identity: &IdentitySet,
        credential: &str,
        prompt: &str,
        thinking: bool,
    ) -> CoreResult<Bytes> {
        let envelope = json!({
            "scenario": self.config.rpc_scenario,
            "message": {
                "role": "user",
                "blocks": [{ "message_id": "", "text": { "content": prompt } }],
                "scenario": self.config.rpc_scenario,
            },
            "options": { "thinking": thinking },
        });
        let body = chat2api_protocol::connect::encode_message(&envelope)
            .map_err(|err| CoreError::Protocol(err.to_string()))?;

        let origin = self.config.base_url.trim_end_matches('/').to_string();
        let mut headers = Headers::new();
        header_set(&mut headers, "Content-Type", "application/connect+json");
        header_set(&mut headers, "Connect-Protocol-Version", "1");
        header_set(&mut headers, "Accept", "*/*");
        header_set(&mut headers, "Origin", origin.clone());
        header_set(&mut headers, "Referer", format!("{origin}/"));
        header_set(&mut headers, "User-Agent", USER_AGENT);
        header_set(&mut headers, "Authorization", format!("Bearer {credential}"));
        header_set(&mut headers, "X-Device-Id", identity.device_id.clone());
        header_set(&mut headers, "X-Session-Id", identity.web_id.clone());
        if let Some(room_id) = &identity.room_id {
            header_set(&mut headers, "X-Traffic-Id", room_id.clone());
        }

        let response = self
            .client
            .send(UpstreamHttpRequest {
                method: HttpMethod::Post,
                url: self.url(&self.config.rpc_chat_path),
                headers,
                body: Some(body),
                is_stream: false,
            })
            .await?;
        if response.status != 200 {
            let bytes = response.into_bytes().await.unwrap_or_default();
            return Err(CoreError::Protocol(format!(
                "rpc completion failed: {}",
                String::from_utf8_lossy(&bytes)
            )));
        }
        response.into_bytes().await
    }

    /// Browser-shaped telemetry batch; strictly best-effort.
    pub async fn send_events(
        &self,
        identity: &IdentitySet,
        token: &AccessToken,
        session_id: &str,
    ) -> CoreResult<()> {
        let report_session = format!("session_v0_{}", Uuid::new_v4().simple());
        let now_ms = unix_millis();
        let location = self.url(&format!("/a/chat/s/{session_id}"));
        let base_payload = json!({
            "__location": location,
            "__pageVisibility": "true",
            "__nodeEnv": "production",
            "__deployEnv": "production",
            "__appVersion": self.app_version,
            "__userAgent": USER_AGENT,
            "__referrer": "",
        });
        let mut events = Vec::new();
        for (offset, name, message) in [
            (0, "__reportEvent", "report event endpoint invoked".to_string()),
            (
                200,
                "createSessionAndStartCompletion",
                "session created, starting completion".to_string(),
            ),
            (
                700,
                "__httpRequest",
                format!("httpRequest POST {COMPLETION_PATH}"),
            ),
            (
                1400,
                "completionApiOk",
                "completion finished with a normal finish reason".to_string(),
            ),
        ] {
            let mut payload = base_payload.clone();
            if let Some(map) = payload.as_object_mut() {
                map.insert("logId".to_string(), json!(Uuid::new_v4().to_string()));
                map.insert(
                    "metricDuration".to_string(),
                    json!(fake_duration_ms()),
                );
                map.insert("chatSessionId".to_string(), json!(session_id));
            }
            events.push(json!({
                "session_id": report_session,
                "client_timestamp_ms": now_ms + offset,
                "event_name": name,
                "event_message": message,
                "payload": payload,
                "level": "info",
            }));
        }

        let mut headers = self.authed_headers(identity, &token.value);
        header_set(&mut headers, "Referer", location);
        self.call_json(
            HttpMethod::Post,
            EVENTS_PATH,
            headers,
            Some(json!({ "events": events })),
        )
        .await?;
        debug!("telemetry events reported");
        Ok(())
    }

    /// Current upstream web-app version; `None` on any failure.
    pub async fn fetch_app_version(&self) -> Option<String> {
        let response = self
            .client
            .send(UpstreamHttpRequest {
                method: HttpMethod::Get,
                url: self.url(VERSION_PATH),
                headers: Headers::new(),
                body: None,
                is_stream: false,
            })
            .await
            .ok()?;
        if response.status != 200 {
            return None;
        }
        let bytes = response.into_bytes().await.ok()?;
        let version = String::from_utf8_lossy(&bytes).trim().to_string();
        (!version.is_empty()).then_some(version)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// Unwraps the upstream `{ code, data, msg }` envelope.
///
/// Code `40003` means the token was invalidated upstream; it surfaces as an
/// auth failure so the cache entry gets evicted before the retry.
pub(crate) fn check_envelope(bytes: &[u8]) -> CoreResult<Value> {
    let value: Value = serde_json::from_slice(bytes).map_err(|err| {
        CoreError::Protocol(format!("upstream response is not JSON: {err}"))
    })?;
    let envelope: Envelope =
        serde_json::from_value(value.clone()).unwrap_or(Envelope {
            code: None,
            msg: None,
            data: None,
        });
    let Some(code) = envelope.code else {
        return Ok(value);
    };
    if code == 0 {
        return Ok(envelope.data.unwrap_or(Value::Null));
    }
    let msg = envelope.msg.unwrap_or_default();
    if code == CODE_TOKEN_INVALIDATED {
        return Err(CoreError::Auth(format!("token invalidated upstream: {msg}")));
    }
    Err(CoreError::Protocol(format!(
        "upstream request rejected (code {code}): {msg}"
    )))
}

fn challenge_error(err: CoreError) -> CoreError {
    match err {
        CoreError::Auth(_) => err,
        other => CoreError::Challenge(other.to_string()),
    }
}

fn fake_duration_ms() -> u64 {
    use rand::Rng;
    rand::rng().random_range(0..1000)
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_success_unwraps_data() {
        let data =
            check_envelope(br#"{"code":0,"data":{"biz_data":{"token":"t"}},"msg":""}"#).unwrap();
        assert_eq!(data.pointer("/biz_data/token"), Some(&json!("t")));
    }

    #[test]
    fn envelope_without_code_passes_through() {
        let data = check_envelope(br#"{"token":"raw"}"#).unwrap();
        assert_eq!(data["token"], json!("raw"));
    }

    #[test]
    fn invalidated_token_code_is_an_auth_failure() {
        let err = check_envelope(br#"{"code":40003,"msg":"expired"}"#).unwrap_err();
        assert!(matches!(err, CoreError::Auth(_)));
    }

    #[test]
    fn other_codes_are_protocol_errors() {
        let err = check_envelope(br#"{"code":500,"msg":"nope"}"#).unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
    }

    #[test]
    fn non_json_body_is_a_protocol_error() {
        assert!(matches!(
            check_envelope(b"<html>"),
            Err(CoreError::Protocol(_))
        ));
    }
}
