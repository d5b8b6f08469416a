//! Upload fingerprinting
//!
//! A fingerprint identifies one physical upload. Storage notifications are
//! delivered at least once, so repeated notifications for the same object must
//! hash to the same key in the record store.

use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest.
pub const FINGERPRINT_LEN: usize = 16;

/// Record store key of an upload.
pub type Fingerprint = String;

/// Compute the fingerprint of an upload from its object metadata.
///
/// The digest input is `"{bucket}-{name}-{size}-{created_at}"` where `created_at`
/// is rendered by [`render_created_at`], or is the empty string when the storage
/// backend did not report a creation time.
pub fn compute_fingerprint(
    bucket: &str,
    object_name: &str,
    size: u64,
    created_at: Option<DateTime<Utc>>,
) -> Fingerprint {
    let created = created_at.map(render_created_at).unwrap_or_default();
    let content = format!("{}-{}-{}-{}", bucket, object_name, size, created);
    let digest = Sha256::digest(content.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(FINGERPRINT_LEN);
    encoded
}

/// ISO 8601 with a `+00:00` offset. Sub-second precision is truncated to
/// microseconds and omitted entirely when zero, so `09:26:53+00:00` and
/// `09:26:53.120000+00:00` are the two shapes produced. Fingerprints of records
/// already stored depend on this exact text.
pub fn render_created_at(created_at: DateTime<Utc>) -> String {
    let format = if created_at.nanosecond() / 1_000 == 0 {
        SecondsFormat::Secs
    } else {
        SecondsFormat::Micros
    };
    created_at.to_rfc3339_opts(format, false)
}
