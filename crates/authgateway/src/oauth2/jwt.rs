//! Best-effort `exp` claim probe.
//!
//! Token lifetimes for the ID-token and refresh-token cookies come from
//! the tokens themselves when they happen to be JWTs. The payload is
//! decoded without any signature verification: the tokens were received
//! directly from the token endpoint over TLS and are otherwise opaque to
//! the filter.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

#[derive(Deserialize)]
struct ExpClaim {
	#[serde(default)]
	exp: u64,
}

/// Remaining lifetime of `token` in whole seconds, `0` when the `exp`
/// claim is already in the past. `None` when the token is not a
/// three-segment JWT, its payload is not JSON, or `exp` is absent or
/// zero; callers substitute their configured fallback.
pub fn remaining_lifetime(token: &str, now: SystemTime) -> Option<u64> {
	let mut segments = token.split('.');
	let payload = segments.nth(1)?;
	if segments.count() != 1 {
		return None;
	}
	let raw = URL_SAFE_NO_PAD.decode(payload.as_bytes()).ok()?;
	let claims: ExpClaim = serde_json::from_slice(&raw).ok()?;
	if claims.exp == 0 {
		return None;
	}
	let now = now.duration_since(UNIX_EPOCH).ok()?.as_secs();
	Some(claims.exp.saturating_sub(now))
}
