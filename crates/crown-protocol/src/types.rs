use std::fmt;
use std::sync::Arc;

/// Opaque device identity. Equality and ordering are by the unique id
/// string; the same ordering drives every deterministic tie-break in
/// the kingdom protocol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(Arc<str>);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(Arc::from(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 16-bit fold of the id for the frame source field.
    ///
    /// FNV-1a over the id bytes, xor-folded to 16 bits. Collisions only
    /// affect the informational source tag on frames; routing is always
    /// per-connection and admin payloads carry the full string id.
    pub fn short_id(&self) -> u16 {
        const FNV_OFFSET: u32 = 0x811c_9dc5;
        const FNV_PRIME: u32 = 0x0100_0193;
        let mut hash = FNV_OFFSET;
        for byte in self.0.as_bytes() {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        ((hash >> 16) ^ (hash & 0xFFFF)) as u16
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId::new(s)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        DeviceId::new(s)
    }
}

/// Current time in Unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_id_string() {
        assert_eq!(DeviceId::new("alpha"), DeviceId::from("alpha"));
        assert_ne!(DeviceId::new("alpha"), DeviceId::new("bravo"));
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(DeviceId::new("alpha") < DeviceId::new("bravo"));
        assert!(DeviceId::new("a10") < DeviceId::new("a2"));
    }

    #[test]
    fn short_id_is_stable() {
        let a = DeviceId::new("alpha");
        assert_eq!(a.short_id(), DeviceId::new("alpha").short_id());
        // Not a guarantee for every pair, but these must differ for the
        // tests that key on source ids to mean anything.
        assert_ne!(a.short_id(), DeviceId::new("bravo").short_id());
    }
}
