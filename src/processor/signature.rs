// Webhook authentication.
//
// Header: `Stripe-Signature: t=<unix ts>,v1=<hex hmac>[,v1=...]`
// Signed payload: `{t}.{raw body}` with HMAC-SHA256 keyed by the endpoint secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::models::Event;
use crate::error::SignatureError;

type HmacSha256 = Hmac<Sha256>;

const SCHEME: &str = "v1";

/// Hex encoded HMAC-SHA256 of `{timestamp}.{payload}`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

struct SignatureHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Result<SignatureHeader<'_>, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for item in header.split(',') {
        let Some((key, value)) = item.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::SignatureInvalid)?,
                )
            }
            SCHEME => signatures.push(value),
            _ => {}
        }
    }

    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok(SignatureHeader {
            timestamp,
            signatures,
        }),
        _ => Err(SignatureError::SignatureInvalid),
    }
}

/// Authenticate a webhook body and decode it into an [`Event`].
///
/// `now` is the current unix time; signatures older or newer than `tolerance_seconds`
/// are rejected.
pub fn verify_webhook_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_seconds: i64,
    now: i64,
) -> Result<Event, SignatureError> {
    let header = parse_header(header)?;

    if (now - header.timestamp).abs() > tolerance_seconds {
        return Err(SignatureError::SignatureInvalid);
    }

    let expected = compute_signature(secret, header.timestamp, payload);
    let matched = header
        .signatures
        .iter()
        .any(|candidate| bool::from(candidate.as_bytes().ct_eq(expected.as_bytes())));
    if !matched {
        return Err(SignatureError::SignatureInvalid);
    }

    serde_json::from_slice::<Event>(payload)
        .map_err(|e| SignatureError::PayloadInvalid(e.to_string()))
}
