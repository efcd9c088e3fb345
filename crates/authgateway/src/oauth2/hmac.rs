//! HMAC-SHA256 signing for the session cookie envelope.
//!
//! Two encodings exist on the wire. Current sessions carry
//! `base64(hmac)`; sessions minted by earlier releases carry
//! `base64(hex(hmac))`. The signer only produces the former, the
//! validator accepts both.

use aws_lc_rs::hmac::{self, HMAC_SHA256};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use subtle::ConstantTimeEq;

/// Separator between the five payload slots. Always present, even for
/// empty slots.
const PAYLOAD_SEPARATOR: &str = "\n";

fn mac(secret: &[u8], payload: &str) -> hmac::Tag {
	let key = hmac::Key::new(HMAC_SHA256, secret);
	hmac::sign(&key, payload.as_bytes())
}

/// `base64(HMAC_SHA256(secret, payload))`.
pub fn sign(secret: &[u8], payload: &str) -> String {
	STANDARD.encode(mac(secret, payload).as_ref())
}

/// `base64(hex(HMAC_SHA256(secret, payload)))`, the legacy encoding.
pub fn sign_legacy(secret: &[u8], payload: &str) -> String {
	STANDARD.encode(hex::encode(mac(secret, payload).as_ref()))
}

/// The session HMAC payload: domain, expiry, access token, ID token and
/// refresh token joined by `"\n"`, absent fields as empty strings.
pub fn session_payload(
	domain: &str,
	expires: &str,
	access_token: &str,
	id_token: &str,
	refresh_token: &str,
) -> String {
	[domain, expires, access_token, id_token, refresh_token].join(PAYLOAD_SEPARATOR)
}

/// Constant-time string equality, used for every MAC comparison.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
	a.as_bytes().ct_eq(b.as_bytes()).into()
}
