use serde_json::Value;

/// Field names whose values never reach logs or rendered output in clear.
pub const SENSITIVE_KEYS: &[&str] = &[
    "api_key",
    "token",
    "secret",
    "password",
    "oauth_token",
    "private_key",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase().replace('-', "_");
    SENSITIVE_KEYS.contains(&key.as_str())
}

/// Mask `value` when `key` is sensitive: first and last two characters are
/// kept, values of four characters or fewer become `***`.
pub fn redact(key: &str, value: &str) -> String {
    if !is_sensitive_key(key) {
        return value.to_string();
    }
    mask(value)
}

pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "***".to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - 4))
}

/// Redact sensitive string fields anywhere in a JSON tree, in place.
pub fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (k, v) in map.iter_mut() {
                if is_sensitive_key(k) {
                    if let Value::String(s) = v {
                        let masked = mask(s);
                        *s = masked;
                        continue;
                    }
                }
                redact_value(v);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_value),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn long_values_keep_two_chars_each_side() {
        assert_eq!(redact("api_key", "secret123456"), "se********56");
    }

    #[test]
    fn short_values_are_fully_masked() {
        assert_eq!(redact("token", "abc"), "***");
        assert_eq!(redact("password", "abcd"), "***");
        assert_eq!(redact("password", "abcde"), "ab*de");
    }

    #[test]
    fn non_sensitive_keys_pass_through() {
        assert_eq!(redact("username", "alice"), "alice");
        assert_eq!(redact("server_url", "https://x"), "https://x");
    }

    #[test]
    fn key_match_ignores_case_and_dashes() {
        assert!(is_sensitive_key("API-KEY"));
        assert!(is_sensitive_key("Private_Key"));
        assert!(!is_sensitive_key("tokens"));
    }

    #[test]
    fn nested_structures_are_redacted() {
        let mut v = json!({
            "provider": "jira",
            "auth": {"token": "abcdef123456", "user": "bob"},
            "list": [{"secret": "s3cr3tvalue"}]
        });
        redact_value(&mut v);
        assert_eq!(v["auth"]["token"], json!("ab********56"));
        assert_eq!(v["auth"]["user"], json!("bob"));
        assert_eq!(v["list"][0]["secret"], json!("s3*******ue"));
        assert_eq!(v["provider"], json!("jira"));
    }
}
