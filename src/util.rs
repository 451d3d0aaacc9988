//! Shared utility functions used across the codebase.

use serde_json::Value;

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else maps to `false`, unset maps to `default`.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

/// Quote a single argument for display in a copy-pasteable shell command line.
pub fn shell_escape(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    let safe = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        return value.to_string();
    }
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            escaped.push_str("'\"'\"'");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

/// String form of a variable value: strings are used verbatim, `null` is empty,
/// everything else is rendered as JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Normalise a relative path to `/` separators without leading `./` or `/`.
///
/// Returns `None` when the path tries to escape its root with `..`.
pub fn normalize_relative(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return None,
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shell_escape_leaves_plain_words() {
        assert_eq!(shell_escape("-Dpa.logs.home=/tmp/logs"), "-Dpa.logs.home=/tmp/logs");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn shell_escape_quotes_spaces_and_quotes() {
        assert_eq!(shell_escape("a b"), "'a b'");
        assert_eq!(shell_escape("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn value_to_string_renders_scalars() {
        assert_eq!(value_to_string(&json!("x")), "x");
        assert_eq!(value_to_string(&json!(3)), "3");
        assert_eq!(value_to_string(&Value::Null), "");
        assert_eq!(value_to_string(&json!({"a": 1})), "{\"a\":1}");
    }

    #[test]
    fn normalize_relative_rejects_parent_segments() {
        assert_eq!(normalize_relative("./a//b/c.txt").as_deref(), Some("a/b/c.txt"));
        assert_eq!(normalize_relative("/abs/x").as_deref(), Some("abs/x"));
        assert!(normalize_relative("a/../../etc").is_none());
    }
}
