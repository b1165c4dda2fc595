//! URL signature verification with rolling time buckets
//!
//! A request URL carries a `token` query parameter holding the hex
//! HMAC-SHA-1 of the canonical URL under a time-bucket-derived key. The
//! canonical form keeps only the `page`, `token` and `token-ttl` query
//! parameters so that rendering options can vary without invalidating the
//! signature; the token itself is stripped before signing. Tokens from the
//! previous and next buckets are accepted to tolerate clock skew.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Bucket size used to derive signing keys.
pub const SIGNING_BUCKET_SIZE: Duration = Duration::from_secs(8 * 60 * 60);

/// Query parameters that survive canonicalization.
const SIGNED_PARAMS: [&str; 3] = ["page", "token", "token-ttl"];

#[derive(Debug, PartialEq, Eq)]
pub enum SignatureCheck {
    Valid,
    /// `token-ttl` lies in the past.
    Expired,
    Invalid,
}

/// Derive the signing secret for a bucket index.
fn timed_secret(secret: &[u8], bucket_index: i64) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(bucket_index.to_string().as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn sign(secret: &[u8], bucket_index: i64, canonical_url: &str) -> String {
    let derived = timed_secret(secret, bucket_index);
    let mut mac = HmacSha1::new_from_slice(&derived).expect("hmac accepts any key length");
    mac.update(canonical_url.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn unix_seconds(now: SystemTime) -> i64 {
    match now.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Generate a token for a URL, valid for the bucket containing `now`.
///
/// The URL is canonicalized the same way verification does, so callers can
/// pass the full request URL with rendering options attached.
pub fn generate_token(secret: &str, bucket_size: Duration, now: SystemTime, url: &str) -> String {
    let parts = CanonicalUrl::parse(url);
    let bucket = unix_seconds(now) / bucket_size.as_secs() as i64;
    sign(secret.as_bytes(), bucket, &parts.signed_url)
}

/// Check the `token` on a URL against the current, previous and next signing
/// buckets. An expired `token-ttl` fails regardless of the signature.
pub fn check_signature(
    secret: &str,
    bucket_size: Duration,
    now: SystemTime,
    url: &str,
) -> SignatureCheck {
    let parts = CanonicalUrl::parse(url);

    let now_secs = unix_seconds(now);
    if let Some(ttl) = parts.token_ttl {
        if ttl < now_secs {
            return SignatureCheck::Expired;
        }
    }

    let token = match parts.token {
        Some(token) if !token.is_empty() => token,
        _ => return SignatureCheck::Invalid,
    };

    let bucket = now_secs / bucket_size.as_secs() as i64;
    for candidate in [bucket, bucket - 1, bucket + 1] {
        let expected = sign(secret.as_bytes(), candidate, &parts.signed_url);
        // Hex strings are constant length, so a byte compare leaks nothing
        // beyond the (public) bucket size.
        if constant_time_eq(expected.as_bytes(), token.as_bytes()) {
            return SignatureCheck::Valid;
        }
    }
    SignatureCheck::Invalid
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// The canonical form of a request URL for signing purposes.
struct CanonicalUrl {
    /// Path plus the surviving query parameters, token removed, keys sorted.
    signed_url: String,
    token: Option<String>,
    token_ttl: Option<i64>,
}

impl CanonicalUrl {
    /// Accepts both absolute URLs and bare path-and-query strings; only the
    /// path and query take part in the signature.
    fn parse(raw: &str) -> Self {
        let without_scheme = match raw.find("://") {
            Some(idx) => {
                let rest = &raw[idx + 3..];
                match rest.find('/') {
                    Some(slash) => &rest[slash..],
                    None => "/",
                }
            }
            None => raw,
        };

        let (path, query) = match without_scheme.split_once('?') {
            Some((p, q)) => (p, q),
            None => (without_scheme, ""),
        };

        let mut token = None;
        let mut token_ttl = None;
        let mut kept: Vec<(String, String)> = Vec::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if !SIGNED_PARAMS.contains(&key.as_ref()) {
                continue;
            }
            match key.as_ref() {
                "token" => token = Some(value.into_owned()),
                "token-ttl" => {
                    token_ttl = value.parse().ok();
                    kept.push(("token-ttl".to_string(), value.into_owned()));
                }
                _ => kept.push((key.into_owned(), value.into_owned())),
            }
        }
        kept.sort();

        let signed_url = if kept.is_empty() {
            path.to_string()
        } else {
            let encoded: String = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(kept)
                .finish();
            format!("{path}?{encoded}")
        };

        CanonicalUrl {
            signed_url,
            token,
            token_ttl,
        }
    }
}
