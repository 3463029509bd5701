//! Small shared helpers.

use chrono::Utc;

/// ISO-8601 UTC timestamp suitable for API payloads and storage.
pub fn now_ts() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Generate a prefixed opaque id (e.g. "sess_V1StGXR8Z5jd").
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, nanoid::nanoid!(12))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ts_shape() {
        let ts = now_ts();
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }

    #[test]
    fn test_new_id_prefix() {
        let id = new_id("sess");
        assert!(id.starts_with("sess_"));
        assert_eq!(id.len(), "sess_".len() + 12);
    }
}
