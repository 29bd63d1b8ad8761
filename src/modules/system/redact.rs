use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::constants::SANITIZE_MAX_DEPTH;

// Key names whose values are always masked, compared after lowercasing and
// stripping punctuation ("refresh_token" and "refreshToken" both hit
// "refreshtoken" via the "refresh"/"token" fragments).
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "access",
    "refresh",
    "token",
    "authorization",
    "apikey",
    "secret",
    "password",
    "credential",
    "idtoken",
    "email",
    "accountid",
];

static JWT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]{4,}\.eyJ[A-Za-z0-9_-]{4,}(?:\.[A-Za-z0-9_-]+)?")
        .expect("invalid jwt regex")
});
static HEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[0-9a-fA-F]{40,}\b").expect("invalid hex regex"));
static BEARER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]{8,}").expect("invalid bearer regex")
});
static API_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bsk-[A-Za-z0-9_-]{8,}\b").expect("invalid api key regex"));
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("invalid email regex")
});

/// Mask a secret value: short values vanish entirely, long values keep a
/// recognizable prefix and suffix for correlation during debugging.
pub fn mask_secret(value: &str) -> String {
    if value.chars().count() <= 14 {
        "***MASKED***".to_string()
    } else {
        let chars: Vec<char> = value.chars().collect();
        let prefix: String = chars[..6].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}…{}", prefix, suffix)
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let normalized: String = key
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| normalized.contains(fragment))
}

/// Scrub secret-shaped substrings out of free text before it reaches any
/// sink. Applied to both the structured record and the console sideline.
pub fn scrub_text(text: &str) -> String {
    let mut out = JWT_RE
        .replace_all(text, |caps: &regex::Captures| mask_secret(&caps[0]))
        .into_owned();
    out = BEARER_RE
        .replace_all(&out, |caps: &regex::Captures| mask_secret(&caps[0]))
        .into_owned();
    out = API_KEY_RE
        .replace_all(&out, |caps: &regex::Captures| mask_secret(&caps[0]))
        .into_owned();
    out = HEX_RE
        .replace_all(&out, |caps: &regex::Captures| mask_secret(&caps[0]))
        .into_owned();
    out = EMAIL_RE
        .replace_all(&out, |caps: &regex::Captures| mask_secret(&caps[0]))
        .into_owned();
    out
}

/// Sanitize a structured value for logging. Sensitive keys are masked,
/// strings are scrubbed, and recursion stops at the depth cap so cyclic or
/// absurdly nested payloads cannot run away.
pub fn sanitize_value(value: &Value) -> Value {
    sanitize_at_depth(value, 0)
}

fn sanitize_at_depth(value: &Value, depth: usize) -> Value {
    if depth >= SANITIZE_MAX_DEPTH {
        return Value::String("[depth limit]".to_string());
    }
    match value {
        Value::String(s) => Value::String(scrub_text(s)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_at_depth(item, depth + 1))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                if is_sensitive_key(key) {
                    let masked = match val {
                        Value::String(s) => mask_secret(s),
                        other => mask_secret(&other.to_string()),
                    };
                    out.insert(key.clone(), Value::String(masked));
                } else {
                    out.insert(key.clone(), sanitize_at_depth(val, depth + 1));
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masks_short_and_long_secrets() {
        assert_eq!(mask_secret("hunter2"), "***MASKED***");
        let long = "abcdef0123456789TAIL";
        assert_eq!(mask_secret(long), "abcdef…TAIL");
    }

    #[test]
    fn scrubs_jwt_shaped_substrings() {
        let text = "token eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiIxMjMifQ.sig-part rejected";
        let scrubbed = scrub_text(text);
        assert!(!scrubbed.contains("eyJzdWIi"));
        assert!(scrubbed.contains("rejected"));
    }

    #[test]
    fn scrubs_bearer_headers_and_api_keys() {
        let scrubbed = scrub_text("Authorization: Bearer abcdefgh12345678 key sk-live0123456789");
        assert!(!scrubbed.contains("abcdefgh12345678"));
        assert!(!scrubbed.contains("sk-live0123456789"));
    }

    #[test]
    fn scrubs_long_hex_and_emails() {
        let hex = "a".repeat(40);
        let scrubbed = scrub_text(&format!("blob {} from user@example.com", hex));
        assert!(!scrubbed.contains(&hex));
        assert!(!scrubbed.contains("user@example.com"));
    }

    #[test]
    fn short_hex_survives() {
        let scrubbed = scrub_text("commit deadbeef1234");
        assert!(scrubbed.contains("deadbeef1234"));
    }

    #[test]
    fn sensitive_keys_are_masked_regardless_of_case_or_punctuation() {
        let value = json!({
            "refreshToken": "tok-very-secret-value-1",
            "refresh_token": "tok-very-secret-value-2",
            "Account-Id": "acct-123456",
            "note": "plain text stays",
        });
        let sanitized = sanitize_value(&value);
        assert_eq!(sanitized["note"], json!("plain text stays"));
        for key in ["refreshToken", "refresh_token", "Account-Id"] {
            let masked = sanitized[key].as_str().unwrap();
            assert!(masked == "***MASKED***" || masked.contains('…'), "key {key} not masked");
        }
    }

    #[test]
    fn sanitization_is_depth_bounded() {
        let mut value = json!("leaf");
        for _ in 0..20 {
            value = json!({ "nested": value });
        }
        let sanitized = sanitize_value(&value);
        let rendered = serde_json::to_string(&sanitized).unwrap();
        assert!(rendered.contains("[depth limit]"));
    }
}
