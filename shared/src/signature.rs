//! Telemetry signing and verification
//!
//! Devices sign the canonical serialization of their metrics with
//! HMAC-SHA256 and a per-deployment shared secret:
//!
//! ```text
//! {"cpu":<n>,"memory":<n>,"temperature":<n>}
//! ```
//!
//! Numbers are rendered exactly as JavaScript's `JSON.stringify` renders them,
//! so signatures produced by JavaScript devices verify here unchanged.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::Metrics;

type HmacSha256 = Hmac<Sha256>;

/// Canonical serialization of a metrics snapshot, fields in fixed order.
///
/// Returns `None` if any value is not finite.
pub fn canonical_metrics(metrics: &Metrics) -> Option<String> {
    Some(format!(
        r#"{{"cpu":{},"memory":{},"temperature":{}}}"#,
        js_number(metrics.cpu)?,
        js_number(metrics.memory)?,
        js_number(metrics.temperature)?,
    ))
}

/// Sign a metrics snapshot, returning the lowercase hex digest
pub fn sign(metrics: &Metrics, secret: &[u8]) -> Option<String> {
    let canonical = canonical_metrics(metrics)?;
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(canonical.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a hex signature over a metrics snapshot.
///
/// The digest comparison is constant time. Malformed metrics or a signature
/// that is not valid hex yield `false`.
pub fn verify(metrics: &Metrics, signature: &str, secret: &[u8]) -> bool {
    let Some(canonical) = canonical_metrics(metrics) else {
        return false;
    };
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(canonical.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Render a number the way ECMAScript `Number::toString` does
fn js_number(value: f64) -> Option<String> {
    if !value.is_finite() {
        return None;
    }
    // Covers -0 as well
    if value == 0.0 {
        return Some("0".to_string());
    }

    let abs = value.abs();
    if (1e-6..1e21).contains(&abs) {
        return Some(value.to_string());
    }

    let exp_form = format!("{:e}", value);
    let (mantissa, exponent) = exp_form.split_once('e')?;
    let exponent: i32 = exponent.parse().ok()?;
    let sign = if exponent < 0 { '-' } else { '+' };
    Some(format!("{}e{}{}", mantissa, sign, exponent.abs()))
}
