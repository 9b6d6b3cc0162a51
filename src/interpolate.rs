//! Shell-style variable interpolation over raw configuration values.
//!
//! Walks a raw config tree and expands `${NAME}`, `${NAME:-default}` and
//! `${NAME:?error}` inside every string. Bare `$NAME` is left untouched.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::error::Error;

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([?-])([^}]*))?\}").unwrap()
    })
}

/// Expands variable references in `value` against the process environment.
pub fn interpolate(value: &Value) -> Result<Value, Error> {
    interpolate_with(value, &|name| std::env::var(name).ok())
}

/// Expands variable references using the supplied lookup function.
///
/// The lookup returning `None` or an empty string both count as "unset" for
/// the `:-` and `:?` operators.
pub fn interpolate_with(
    value: &Value,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Value, Error> {
    match value {
        Value::String(text) => Ok(Value::String(expand(text, lookup)?)),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(interpolate_with(item, lookup)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), interpolate_with(item, lookup)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn expand(text: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String, Error> {
    let re = token_regex();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        out.push_str(&text[last..whole.start()]);
        last = whole.end();

        let name = &caps[1];
        let current = lookup(name).filter(|v| !v.is_empty());
        match (current, caps.get(2).map(|m| m.as_str())) {
            (Some(value), _) => out.push_str(&value),
            (None, Some("-")) => out.push_str(caps.get(3).map_or("", |m| m.as_str())),
            (None, Some("?")) => {
                let message = caps.get(3).map_or("", |m| m.as_str());
                let message = if message.is_empty() {
                    format!("Required variable {} is not set", name)
                } else {
                    message.to_string()
                };
                return Err(Error::Interpolation(message));
            }
            (None, _) => {}
        }
    }
    out.push_str(&text[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    fn expand_str(text: &str, pairs: &[(&str, &str)]) -> Result<String, Error> {
        let lookup = env(pairs);
        match interpolate_with(&Value::String(text.to_string()), &lookup)? {
            Value::String(s) => Ok(s),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn substitutes_set_variables() {
        assert_eq!(
            expand_str("port=${PORT}", &[("PORT", "3000")]).unwrap(),
            "port=3000"
        );
    }

    #[test]
    fn unset_without_operator_becomes_empty() {
        assert_eq!(expand_str("x${NOPE}y", &[]).unwrap(), "xy");
    }

    #[test]
    fn default_applies_when_unset_or_empty() {
        assert_eq!(expand_str("${PORT:-3000}", &[]).unwrap(), "3000");
        assert_eq!(
            expand_str("${PORT:-3000}", &[("PORT", "")]).unwrap(),
            "3000"
        );
        assert_eq!(
            expand_str("${PORT:-3000}", &[("PORT", "8080")]).unwrap(),
            "8080"
        );
        assert_eq!(
            expand_str("${GREETING:-hello world}", &[]).unwrap(),
            "hello world"
        );
        assert_eq!(expand_str("${EMPTY:-}", &[]).unwrap(), "");
    }

    #[test]
    fn required_fails_with_supplied_message() {
        let err = expand_str("${NOPE:?must be set}", &[]).unwrap_err();
        assert_eq!(err.to_string(), "must be set");
    }

    #[test]
    fn required_fails_with_default_message() {
        let err = expand_str("${NOPE:?}", &[]).unwrap_err();
        assert_eq!(err.to_string(), "Required variable NOPE is not set");
    }

    #[test]
    fn required_passes_when_set() {
        assert_eq!(
            expand_str("${X:?must be set}", &[("X", "1")]).unwrap(),
            "1"
        );
    }

    #[test]
    fn bare_dollar_is_left_alone() {
        assert_eq!(
            expand_str("echo $HOME ${HOME}", &[("HOME", "/root")]).unwrap(),
            "echo $HOME /root"
        );
    }

    #[test]
    fn identity_on_token_free_strings() {
        let text = "plain text with $dollar and {braces}";
        assert_eq!(expand_str(text, &[]).unwrap(), text);
    }

    #[test]
    fn idempotent_on_plain_expansions() {
        let lookup = env(&[("A", "1")]);
        let input: Value = serde_json::json!({"cmd": "run ${A} ${B:-x}"});
        let once = interpolate_with(&input, &lookup).unwrap();
        let twice = interpolate_with(&once, &lookup).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn walks_objects_and_arrays() {
        let lookup = env(&[("PORT", "3000")]);
        let input: Value = serde_json::json!({
            "processes": {
                "api": {"command": "serve -p ${PORT}", "dependsOn": ["${PORT:-db}"]}
            },
            "count": 2,
            "flag": true,
        });
        let out = interpolate_with(&input, &lookup).unwrap();
        assert_eq!(
            out["processes"]["api"]["command"],
            Value::String("serve -p 3000".to_string())
        );
        assert_eq!(
            out["processes"]["api"]["dependsOn"][0],
            Value::String("3000".to_string())
        );
        assert_eq!(out["count"], Value::from(2));
    }
}
