use std::time::Duration;

use crate::identity::IdentityTemplate;

/// Wire protocol the upstream completion endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    /// Textual server-sent events.
    EventStream,
    /// Connect-style length-prefixed binary frames in one response body.
    ConnectRpc,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub wire: WireProtocol,
    /// Identity material captured out of band; synthesized when absent.
    pub identity_template: Option<IdentityTemplate>,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub token_ttl_secs: u64,
    /// Resource handed to the proof-of-work solver's `init`.
    pub pow_resource_path: String,
    /// Connect-style chat endpoint, RPC variant only.
    pub rpc_chat_path: String,
    pub rpc_scenario: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://chat.deepseek.com".to_string(),
            wire: WireProtocol::EventStream,
            identity_template: None,
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            token_ttl_secs: 3600,
            pow_resource_path: "./sha3_wasm_bg.7b9ca65ddd.wasm".to_string(),
            rpc_chat_path: "/apiv2/chat.v1.ChatService/Chat".to_string(),
            rpc_scenario: "SCENARIO_K2".to_string(),
        }
    }
}
