//! Deterministic identity material.
//!
//! The upstream's anti-automation checks cross-reference device, web and
//! cookie identifiers, so everything it can correlate is derived from a hash
//! of the credential and therefore reproducible across requests and process
//! restarts. Only browser filler the upstream treats as opaque (msToken-like
//! values, tracing tags) is random, and even that is fixed at derivation
//! time because the derived set is cached per credential.

use rand::Rng;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::macros::format_description;

const SESSION_MAX_AGE_SECS: u64 = 2_592_000;
const NUMERIC_ID_BASE: u64 = 7_000_000_000_000_000_000;
const NUMERIC_ID_SPAN: u64 = 3_000_000_000_000_000_000;
const TAG_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_=";
const ALNUM_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySet {
    pub device_id: String,
    pub web_id: String,
    pub cookie: String,
    pub flow_trace_id: String,
    pub room_id: Option<String>,
}

/// Operator-provided identity material captured out of band from a real
/// browser session. Preferred over synthesis when present; only the
/// session-identifying fields are patched per credential.
#[derive(Debug, Clone, Default)]
pub struct IdentityTemplate {
    pub cookie: Option<String>,
    pub device_id: Option<String>,
    pub web_id: Option<String>,
    pub flow_trace_id: Option<String>,
    pub room_id: Option<String>,
}

pub fn derive_identity(credential: &str, template: Option<&IdentityTemplate>) -> IdentitySet {
    let now = unix_now();
    let device_id = template
        .and_then(|t| t.device_id.clone())
        .unwrap_or_else(|| derive_numeric_id(credential, "device"));
    let web_id = template
        .and_then(|t| t.web_id.clone())
        .unwrap_or_else(|| derive_numeric_id(credential, "web"));
    let cookie = match template.and_then(|t| t.cookie.as_deref()) {
        Some(template_cookie) => patch_cookie_session(template_cookie, credential),
        None => synthesize_cookie(credential, now),
    };
    let flow_trace_id = template
        .and_then(|t| t.flow_trace_id.clone())
        .filter(|value| is_valid_flow_trace(value))
        .unwrap_or_else(|| derive_flow_trace(credential));
    let room_id = template.and_then(|t| t.room_id.clone());

    IdentitySet {
        device_id,
        web_id,
        cookie,
        flow_trace_id,
        room_id,
    }
}

fn hex_digest(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// 19-digit decimal id in the range real device registrations occupy.
fn derive_numeric_id(credential: &str, purpose: &str) -> String {
    let hex = hex_digest(&format!("{credential}{purpose}"));
    let n = u64::from_str_radix(&hex[..15], 16).unwrap_or_default();
    (NUMERIC_ID_BASE + n % NUMERIC_ID_SPAN).to_string()
}

fn derive_flow_trace(credential: &str) -> String {
    let hex = hex_digest(&format!("{credential}trace"));
    format!("04-{}-{}-01", &hex[..32], &hex[32..48])
}

pub fn is_valid_flow_trace(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    parts.len() == 4
        && parts[0] == "04"
        && parts[3] == "01"
        && parts[1].len() == 32
        && parts[2].len() == 16
        && parts[1].chars().chain(parts[2].chars()).all(|c| c.is_ascii_hexdigit())
}

fn synthesize_cookie(credential: &str, now: u64) -> String {
    let uid = hex_digest(credential)[..32].to_string();
    let ttcid = hex_digest(&format!("{credential}ttcid"))[..32].to_string();
    let web_verify = hex_digest(&format!("{credential}webid"));
    let s_v_web_id = format!("verify_{}_{}", &web_verify[..20], &web_verify[20..32]);
    let csrf = hex_digest(&format!("{credential}csrf"))[..32].to_string();
    let odin = hex_digest(&format!("{credential}odin"));
    let ttwid = hex_digest(&format!("{credential}ttwid"))[..32].to_string();
    let sid_guard = build_sid_guard(credential, now, SESSION_MAX_AGE_SECS);

    [
        format!("hook_slardar_session_id={credential}"),
        "i18next=zh".to_string(),
        format!("passport_csrf_token={csrf}"),
        format!("passport_csrf_token_default={csrf}"),
        "is_staff_user=false".to_string(),
        format!("s_v_web_id={s_v_web_id}"),
        format!("ttcid={ttcid}"),
        format!("odin_tt={odin}"),
        format!("n_mh={}", random_string(ALNUM_CHARSET, 24)),
        format!("sid_guard={sid_guard}"),
        format!("uid_tt={uid}"),
        format!("uid_tt_ss={uid}"),
        format!("sid_tt={credential}"),
        format!("sessionid={credential}"),
        format!("sessionid_ss={credential}"),
        format!("session_tlb_tag={}", random_string(TAG_CHARSET, 64)),
        format!("sid_ucp_v1=1.0.0-{}", random_string(ALNUM_CHARSET, 64)),
        format!("ssid_ucp_v1=1.0.0-{}", random_string(ALNUM_CHARSET, 64)),
        format!("ttwid={ttwid}"),
        "passport_fe_beating_status=true".to_string(),
        format!("msToken={}", fake_ms_token()),
    ]
    .join("; ")
}

fn build_sid_guard(credential: &str, now: u64, max_age: u64) -> String {
    let date = OffsetDateTime::from_unix_timestamp((now + max_age) as i64)
        .ok()
        .and_then(|at| {
            at.format(format_description!(
                "[weekday repr:short], [day]-[month repr:short]-[year] [hour]:[minute]:[second] GMT"
            ))
            .ok()
        })
        .unwrap_or_default();
    format!("{credential}%7C{now}%7C{max_age}%7C{}", encode_cookie_date(&date))
}

fn encode_cookie_date(date: &str) -> String {
    let mut out = String::with_capacity(date.len());
    for c in date.chars() {
        match c {
            ' ' => out.push('+'),
            ',' => out.push_str("%2C"),
            ':' => out.push_str("%3A"),
            other => out.push(other),
        }
    }
    out
}

/// Replaces the session-identifying values in an operator template cookie,
/// leaving every other captured field intact.
fn patch_cookie_session(template: &str, credential: &str) -> String {
    let mut saw_session = false;
    let mut pairs: Vec<String> = template
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let key = pair.split('=').next().unwrap_or_default();
            if matches!(key, "sessionid" | "sessionid_ss" | "sid_tt") {
                saw_session = true;
                format!("{key}={credential}")
            } else {
                pair.to_string()
            }
        })
        .collect();
    if !saw_session {
        pairs.push(format!("sessionid={credential}"));
    }
    if !template.contains("msToken=") {
        pairs.push(format!("msToken={}", fake_ms_token()));
    }
    pairs.join("; ")
}

/// Browser-shaped opaque filler: base64url over random bytes, one padding
/// byte preserved.
fn fake_ms_token() -> String {
    use base64::Engine as _;
    let mut rng = rand::rng();
    let bytes: Vec<u8> = (0..95).map(|_| rng.random::<u8>()).collect();
    base64::engine::general_purpose::URL_SAFE.encode(bytes)
}

fn random_string(charset: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| charset[rng.random_range(0..charset.len())] as char)
        .collect()
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
