//! Helpers shared by the built-in channels.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum length of request/response bodies kept in a [`crate::SendResponse`].
pub const MAX_BODY_LENGTH: usize = 4000;

/// Truncates to at most `max_chars` characters, marking the cut.
pub fn truncate_string(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((idx, _)) => format!("{}... [truncated]", &s[..idx]),
    }
}

/// Truncates to at most `max_chars` characters without a marker.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        None => s,
        Some((idx, _)) => &s[..idx],
    }
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so this never fails.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// `7..=15` digits with an optional leading `+`.
pub fn is_valid_phone(phone: &str) -> bool {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    (7..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

/// Replaces values of keys that usually hold secrets with `"***"`, recursively:
/// password, passwd, pwd, token, secret, api_key/apikey, credentials.
pub fn redact_sensitive_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, val) in map {
                let key_lower = key.to_lowercase();
                let is_sensitive = ["password", "passwd", "pwd", "token", "secret", "api_key", "apikey", "credentials"]
                    .iter()
                    .any(|needle| key_lower.contains(needle));

                if is_sensitive {
                    redacted.insert(key.clone(), Value::String("***".to_string()));
                } else {
                    redacted.insert(key.clone(), redact_sensitive_json(val));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(redact_sensitive_json).collect()),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("hello", 10), "hello");
        assert_eq!(truncate_string("hello world", 5), "hello... [truncated]");
        // multi-byte characters are never split
        assert_eq!(truncate_string("告警通知", 2), "告警... [truncated]");
        assert_eq!(truncate_chars("告警通知", 3), "告警通");
    }

    #[test]
    fn test_phone_validation() {
        assert!(is_valid_phone("+8613800138000"));
        assert!(is_valid_phone("5551234"));
        assert!(!is_valid_phone("555-1234"));
        assert!(!is_valid_phone("123456"));
        assert!(!is_valid_phone("+1234567890123456"));
    }

    #[test]
    fn test_hmac_known_vector() {
        // RFC 4231 test case 2
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_redact_sensitive_json() {
        let json = serde_json::json!({
            "username": "admin",
            "smtp_password": "secret123",
            "api_key": "abc123",
            "smtp_host": "smtp.example.com",
            "headers": [{ "access_token": "xyz789", "public_value": "visible" }]
        });

        let redacted = redact_sensitive_json(&json);
        assert_eq!(redacted["username"], "admin");
        assert_eq!(redacted["smtp_password"], "***");
        assert_eq!(redacted["api_key"], "***");
        assert_eq!(redacted["smtp_host"], "smtp.example.com");
        assert_eq!(redacted["headers"][0]["access_token"], "***");
        assert_eq!(redacted["headers"][0]["public_value"], "visible");
    }
}
