//! Rotating BLE service UUID derivation.
//!
//! The advertised service UUID changes every hour so a fixed UUID cannot
//! be used to track a device across time. Every device derives the same
//! UUID for the same hour from a fixed project-wide secret, so rotation
//! costs no coordination. Scanners overlap one bucket behind and, near
//! the boundary, one ahead, which keeps discovery working across clock
//! skew and the rotation instant itself.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use uuid::{uuid, Uuid};

/// Bucket width: one hour of unix time.
pub const BUCKET_MILLIS: u64 = 3_600_000;

/// Both current and next UUID are in play during the last 5 minutes of a
/// bucket.
pub const OVERLAP_MILLIS: u64 = 5 * 60 * 1000;

/// Pre-rotation service UUID, advertised and scanned only when legacy
/// compatibility is enabled.
pub const LEGACY_SERVICE_UUID: Uuid = uuid!("F47B5E2D-4A9E-4C5A-9B3F-8E1D2C3A4B5C");

/// The single message characteristic. Never rotates.
pub const CHARACTERISTIC_UUID: Uuid = uuid!("A1B2C3D4-E5F6-4A5B-8C9D-0E1F2A3B4C5D");

const DERIVATION_PREFIX: &str = "gap-mesh-ble-uuid-v1-";
const ROTATION_SECRET_SEED: &[u8] = b"gap-mesh-global-rotation-v1";

type HmacSha256 = Hmac<Sha256>;

/// The project-wide rotation secret: SHA-256 of a fixed ASCII string, so
/// every build of every app derives identical UUIDs.
pub fn rotation_secret() -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(ROTATION_SECRET_SEED);
    hasher.finalize().into()
}

/// Hour bucket for a wall-clock instant.
pub fn bucket_for(unix_millis: u64) -> u64 {
    unix_millis / BUCKET_MILLIS
}

/// Milliseconds remaining until the next bucket boundary.
pub fn millis_until_rotation(unix_millis: u64) -> u64 {
    BUCKET_MILLIS - (unix_millis % BUCKET_MILLIS)
}

/// Derive the service UUID for one bucket:
/// first 16 bytes of HMAC-SHA256(secret, prefix ‖ decimal bucket), with
/// RFC 4122 version-4 and variant bits forced so the result is a valid
/// random-form UUID.
pub fn uuid_for_bucket(bucket: u64) -> Uuid {
    let mut mac = HmacSha256::new_from_slice(&rotation_secret())
        .expect("HMAC accepts any key length");
    mac.update(DERIVATION_PREFIX.as_bytes());
    mac.update(bucket.to_string().as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    bytes[6] = (bytes[6] & 0x0F) | 0x40; // version 4
    bytes[8] = (bytes[8] & 0x3F) | 0x80; // RFC 4122 variant
    Uuid::from_bytes(bytes)
}

/// True inside the overlap window at the tail of the current bucket.
pub fn in_overlap_window(unix_millis: u64) -> bool {
    millis_until_rotation(unix_millis) <= OVERLAP_MILLIS
}

/// UUIDs to scan for right now: current bucket, previous bucket, the next
/// bucket during overlap, and optionally the legacy constant.
pub fn scan_uuids(unix_millis: u64, include_legacy: bool) -> Vec<Uuid> {
    let bucket = bucket_for(unix_millis);
    let mut uuids = vec![uuid_for_bucket(bucket)];
    if let Some(previous) = bucket.checked_sub(1) {
        uuids.push(uuid_for_bucket(previous));
    }
    if in_overlap_window(unix_millis) {
        uuids.push(uuid_for_bucket(bucket + 1));
    }
    if include_legacy {
        uuids.push(LEGACY_SERVICE_UUID);
    }
    uuids
}

/// UUIDs to advertise right now: current bucket, plus the next one during
/// overlap, and optionally the legacy constant.
pub fn advertise_uuids(unix_millis: u64, include_legacy: bool) -> Vec<Uuid> {
    let bucket = bucket_for(unix_millis);
    let mut uuids = vec![uuid_for_bucket(bucket)];
    if in_overlap_window(unix_millis) {
        uuids.push(uuid_for_bucket(bucket + 1));
    }
    if include_legacy {
        uuids.push(LEGACY_SERVICE_UUID);
    }
    uuids
}
