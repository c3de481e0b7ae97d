//! HMAC-SHA256 signature construction/verification shared by channel-auth
//! (spec §4.3), `pusher:signin` (spec §4.5), and the HTTP control-plane
//! (spec §4.10). All comparisons are constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// `hex(hmac_sha256(secret, message))`, or `None` if `secret` is somehow
/// not a valid HMAC key (never happens for arbitrary-length keys, but the
/// underlying API is fallible).
pub fn sign_hex(secret: &str, message: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Byte-for-byte constant-time string comparison. Bails out early on length
/// mismatch (length itself is not secret), then XOR-folds every byte so the
/// comparison takes the same time regardless of where a mismatch occurs.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Builds the string to sign for a private/presence channel subscribe,
/// per spec §4.3: `"{socket_id}:{channel}"`, or with a trailing
/// `:{channel_data_json}` when channel_data is present (presence channels).
pub fn channel_auth_string(socket_id: &str, channel: &str, channel_data: Option<&str>) -> String {
    match channel_data {
        Some(data) => format!("{socket_id}:{channel}:{data}"),
        None => format!("{socket_id}:{channel}"),
    }
}

/// Verifies a channel-subscribe `auth` string of the form `"{app_key}:{hex}"`
/// against the expected signature. Returns `false` (never panics) on any
/// malformed input — callers surface `Unauthorized` uniformly.
pub fn verify_channel_auth(
    app_key: &str,
    app_secret: &str,
    socket_id: &str,
    channel: &str,
    channel_data: Option<&str>,
    auth: &str,
) -> bool {
    let Some(given_hex) = auth.strip_prefix(&format!("{app_key}:")) else {
        return false;
    };
    let to_sign = channel_auth_string(socket_id, channel, channel_data);
    match sign_hex(app_secret, &to_sign) {
        Some(expected) => constant_time_eq(&expected, given_hex),
        None => false,
    }
}

/// Builds the string to sign for `pusher:signin`, per spec §4.5:
/// `"{socket_id}::user::{user_data}"`.
pub fn signin_auth_string(socket_id: &str, user_data: &str) -> String {
    format!("{socket_id}::user::{user_data}")
}

pub fn verify_signin_auth(app_secret: &str, socket_id: &str, user_data: &str, auth: &str) -> bool {
    let to_sign = signin_auth_string(socket_id, user_data);
    match sign_hex(app_secret, &to_sign) {
        Some(expected) => constant_time_eq(&expected, auth),
        None => false,
    }
}

/// `md5(body)` hex-encoded, the body digest baked into the HTTP
/// control-plane signature string (spec §4.10).
pub fn md5_hex(body: &[u8]) -> String {
    format!("{:x}", md5::compute(body))
}

/// Builds the string to sign for an HTTP control-plane request, per spec
/// §4.10: `"{method}\n{path}\n{canonical_query}\n{md5(body)_hex}"`.
/// `canonical_query` is the caller's responsibility to produce (sorted
/// key=value pairs, `auth_signature` excluded) — see DESIGN.md for why
/// sorting is required even though the spec text does not spell it out.
pub fn control_plane_auth_string(method: &str, path: &str, canonical_query: &str, body: &[u8]) -> String {
    format!("{method}\n{path}\n{canonical_query}\n{}", md5_hex(body))
}

pub fn verify_control_plane_signature(
    app_secret: &str,
    method: &str,
    path: &str,
    canonical_query: &str,
    body: &[u8],
    signature_hex: &str,
) -> bool {
    let to_sign = control_plane_auth_string(method, path, canonical_query, body);
    match sign_hex(app_secret, &to_sign) {
        Some(expected) => constant_time_eq(&expected, signature_hex),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq("abcd", "abcd"));
    }

    #[test]
    fn constant_time_eq_rejects_different_length() {
        assert!(!constant_time_eq("abc", "abcd"));
    }

    #[test]
    fn constant_time_eq_rejects_mismatch() {
        assert!(!constant_time_eq("abcd", "abce"));
    }

    #[test]
    fn channel_auth_round_trips() {
        let secret = "s3cret";
        let key = "app-key";
        let to_sign = channel_auth_string("socket-1", "private-room", None);
        let sig = sign_hex(secret, &to_sign).unwrap();
        let auth = format!("{key}:{sig}");
        assert!(verify_channel_auth(
            key, secret, "socket-1", "private-room", None, &auth
        ));
    }

    #[test]
    fn channel_auth_rejects_tampered_signature() {
        let secret = "s3cret";
        let key = "app-key";
        let to_sign = channel_auth_string("socket-1", "private-room", None);
        let sig = sign_hex(secret, &to_sign).unwrap();
        let auth = format!("{key}:{}", sig.replace('a', "b").replace('0', "1"));
        assert!(!verify_channel_auth(
            key, secret, "socket-1", "private-room", None, &auth
        ));
    }

    #[test]
    fn channel_auth_includes_channel_data_for_presence() {
        let secret = "s3cret";
        let key = "app-key";
        let channel_data = r#"{"user_id":"u1"}"#;
        let to_sign = channel_auth_string("socket-1", "presence-chat", Some(channel_data));
        let sig = sign_hex(secret, &to_sign).unwrap();
        let auth = format!("{key}:{sig}");
        assert!(verify_channel_auth(
            key,
            secret,
            "socket-1",
            "presence-chat",
            Some(channel_data),
            &auth
        ));
        // Without the channel_data segment the signature must not verify.
        assert!(!verify_channel_auth(
            key, secret, "socket-1", "presence-chat", None, &auth
        ));
    }

    #[test]
    fn control_plane_signature_covers_body_digest() {
        let secret = "s3cret";
        let body = br#"{"name":"greet"}"#;
        let to_sign = control_plane_auth_string("POST", "/apps/1/events", "auth_key=k", body);
        let sig = sign_hex(secret, &to_sign).unwrap();
        assert!(verify_control_plane_signature(
            secret,
            "POST",
            "/apps/1/events",
            "auth_key=k",
            body,
            &sig
        ));
        assert!(!verify_control_plane_signature(
            secret,
            "POST",
            "/apps/1/events",
            "auth_key=k",
            b"different body",
            &sig
        ));
    }
}
