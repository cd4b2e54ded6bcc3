//! Authentication and session identity.
//!
//! Signed-in users carry an HMAC-signed session cookie naming their account.
//! Everyone else is a guest, told apart by a random guest id cookie. Accounts
//! are only available when a signing secret is configured.

use axum_extra::extract::CookieJar;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Session cookie name
pub const SESSION_COOKIE: &str = "sheets_session";

/// Guest id cookie name
pub const GUEST_COOKIE: &str = "sheets_guest";

/// Session time-to-live in hours
pub const SESSION_TTL_HOURS: i64 = 24 * 14;

// ============================================================================
// Session Structure
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Session {
    user: String,
    created: i64,
    expires: i64,
    nonce: String,
}

// ============================================================================
// Authentication Functions
// ============================================================================

/// Create a signed session token for `user`.
pub fn create_session(secret: &[u8], user: &str) -> Option<String> {
    let now = Utc::now().timestamp();
    let nonce: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();

    let session = Session {
        user: user.to_string(),
        created: now,
        expires: now + SESSION_TTL_HOURS * 3600,
        nonce,
    };
    let session_json = serde_json::to_string(&session).ok()?;
    let signature = sign(secret, &session_json)?;

    Some(format!("{}.{}", base64_encode(&session_json), signature))
}

/// Verify a session token and return the account it names.
pub fn verify_session(token: &str, secret: &[u8]) -> Option<String> {
    let (payload, signature) = token.split_once('.')?;
    let session_json = base64_decode(payload)?;

    let expected = sign(secret, &session_json)?;
    let given = signature.as_bytes();
    if given.len() != expected.len() || given.ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
        return None;
    }

    let session: Session = serde_json::from_str(&session_json).ok()?;
    if Utc::now().timestamp() >= session.expires {
        return None;
    }
    Some(session.user)
}

/// The signed-in account, if any. Always `None` with accounts disabled.
pub fn current_user(jar: &CookieJar, secret: Option<&[u8]>) -> Option<String> {
    let secret = secret?;
    let cookie = jar.get(SESSION_COOKIE)?;
    verify_session(cookie.value(), secret)
}

/// Constant-time password comparison.
pub fn check_password(expected: &str, given: &str) -> bool {
    let (expected, given) = (expected.as_bytes(), given.as_bytes());
    expected.len() == given.len() && expected.ct_eq(given).unwrap_u8() == 1
}

/// The guest id from the cookie jar, when it looks like one we issued.
pub fn guest_id(jar: &CookieJar) -> Option<String> {
    jar.get(GUEST_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|id| is_guest_id(id))
}

pub fn is_guest_id(id: &str) -> bool {
    id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit())
}

fn sign(secret: &[u8], payload: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(payload.as_bytes());
    Some(hex_encode(mac.finalize().into_bytes().as_slice()))
}

// ============================================================================
// Encoding Helpers
// ============================================================================

pub fn base64_encode(s: &str) -> String {
    STANDARD.encode(s.as_bytes())
}

pub fn base64_decode(s: &str) -> Option<String> {
    let bytes = STANDARD.decode(s).ok()?;
    String::from_utf8(bytes).ok()
}

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
