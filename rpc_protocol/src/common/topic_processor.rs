// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The topic-pattern engine (`§4.1`): validates patterns at construction, resolves them to
//! concrete topics or subscription filters given a token map, and parses tokens back out of an
//! incoming topic.

use std::collections::HashMap;

use regex::Regex;

use crate::error::{RpcError, Value};

/// Wildcard level substituted for every unresolved token when deriving a subscription filter.
pub const WILDCARD: &str = "+";

/// Returns `true` if `s` contains a character outside the printable-ASCII topic-label grammar:
/// non-ASCII, outside `'!'..='~'`, or one of `+ # { }`.
#[must_use]
pub fn contains_invalid_char(s: &str) -> bool {
    s.chars()
        .any(|c| !c.is_ascii() || !('!'..='~').contains(&c) || matches!(c, '+' | '#' | '{' | '}'))
}

/// Returns `true` if `s` is valid as a topic-token replacement value or namespace: non-empty,
/// free of invalid characters, and not starting/ending with `/` or containing `//`.
#[must_use]
pub fn is_valid_replacement(s: &str) -> bool {
    !(s.is_empty() || contains_invalid_char(s) || s.starts_with('/') || s.ends_with('/') || s.contains("//"))
}

/// A validated topic pattern: a `/`-separated sequence of literals and `{token}` placeholders,
/// with an optional namespace prefix.
///
/// `pattern` always keeps every token as an unresolved `{name}` placeholder, even one supplied
/// at construction time: construction-time values are held separately in `construction_tokens`
/// so that [`Self::resolve`] can let a call-time value for the same key take precedence, and so
/// [`Self::parse_tokens`] can still recover a construction-time token's name from an incoming
/// topic.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    pattern: String,
    pattern_regex: Regex,
    construction_tokens: HashMap<String, String>,
}

static TOKEN_REGEX_SRC: &str = r"(?P<token>\{[^}]+\})";
static EMPTY_LEVEL_REGEX_SRC: &str = r"((^\s*/)|(/\s*/)|(/\s*$))";
static INVALID_CHAR_REGEX_SRC: &str = r"([^\x21-\x7E]|[+#{}])";

impl TopicPattern {
    /// Validates `pattern` (and `namespace`, if given) against the topic-label grammar and
    /// validates any construction-time token values found in `tokens`. Every token remains in
    /// the stored pattern as a `{name}` placeholder; construction-time values are consulted by
    /// [`Self::resolve`] (unless overridden by a call-time value for the same key) and by
    /// [`Self::as_filter`] (a token with no construction-time value is wildcarded instead).
    ///
    /// # Errors
    /// Returns [`crate::error::ErrorKind::ConfigurationInvalid`] if the pattern is empty, starts
    /// with `$`, contains non-ASCII characters, empty levels, adjacent tokens, or invalid
    /// characters, or if `namespace` or any construction-time replacement value is not a valid
    /// replacement string.
    pub fn new(
        pattern: &str,
        namespace: Option<&str>,
        tokens: &HashMap<String, String>,
    ) -> Result<Self, RpcError> {
        if pattern.trim().is_empty() {
            return Err(RpcError::configuration_invalid(
                "pattern",
                Value::String(pattern.to_string()),
                Some("topic pattern must not be empty".to_string()),
            ));
        }
        if pattern.starts_with('$') {
            return Err(RpcError::configuration_invalid(
                "pattern",
                Value::String(pattern.to_string()),
                Some("topic pattern starts with reserved character '$'".to_string()),
            ));
        }
        if !pattern.is_ascii() {
            return Err(RpcError::configuration_invalid(
                "pattern",
                Value::String(pattern.to_string()),
                Some("topic pattern contains non-ASCII characters".to_string()),
            ));
        }

        let empty_level_regex = Regex::new(EMPTY_LEVEL_REGEX_SRC).expect("static regex is valid");
        if empty_level_regex.is_match(pattern) {
            return Err(RpcError::configuration_invalid(
                "pattern",
                Value::String(pattern.to_string()),
                Some("topic pattern contains empty levels".to_string()),
            ));
        }

        let mut working_pattern = String::new();
        if let Some(namespace) = namespace {
            if !is_valid_replacement(namespace) {
                return Err(RpcError::configuration_invalid(
                    "namespace",
                    Value::String(namespace.to_string()),
                    Some("topic namespace is not a valid replacement string".to_string()),
                ));
            }
            working_pattern.push_str(namespace);
            working_pattern.push('/');
        }

        let pattern_as_bytes = pattern.as_bytes();
        let token_regex = Regex::new(TOKEN_REGEX_SRC).expect("static regex is valid");
        let invalid_regex = Regex::new(INVALID_CHAR_REGEX_SRC).expect("static regex is valid");

        let mut last_match = 0;
        for caps in token_regex.captures_iter(pattern) {
            let token_capture = caps.name("token").expect("capture group always present");
            let token = token_capture.as_str();

            if token.trim().is_empty() || token == "{}" {
                return Err(RpcError::configuration_invalid(
                    "pattern",
                    Value::String(pattern.to_string()),
                    Some("topic pattern contains an empty token".to_string()),
                ));
            }
            if let Some(c) = pattern_as_bytes.get(token_capture.end()) {
                if *c == b'{' {
                    return Err(RpcError::configuration_invalid(
                        "pattern",
                        Value::String(pattern.to_string()),
                        Some("topic pattern contains adjacent tokens".to_string()),
                    ));
                }
            }

            let literal_run = &pattern[last_match..token_capture.start()];
            if invalid_regex.is_match(literal_run) {
                return Err(RpcError::configuration_invalid(
                    "pattern",
                    Value::String(pattern.to_string()),
                    Some("topic pattern contains invalid characters".to_string()),
                ));
            }
            working_pattern.push_str(literal_run);

            let stripped_token = &token[1..token.len() - 1];
            if invalid_regex.is_match(stripped_token) || stripped_token.contains('/') {
                return Err(RpcError::configuration_invalid(
                    "pattern",
                    Value::String(stripped_token.to_string()),
                    Some(format!("topic pattern token '{token}' contains invalid characters")),
                ));
            }

            if let Some(val) = tokens.get(stripped_token) {
                if !is_valid_replacement(val) {
                    return Err(RpcError::configuration_invalid(
                        stripped_token,
                        Value::String(val.to_string()),
                        Some(format!("replacement value '{val}' for token '{token}' is not valid")),
                    ));
                }
            }
            working_pattern.push_str(token);
            last_match = token_capture.end();
        }

        let tail = &pattern[last_match..];
        if invalid_regex.is_match(tail) {
            return Err(RpcError::configuration_invalid(
                "pattern",
                Value::String(pattern.to_string()),
                Some("topic pattern contains invalid characters".to_string()),
            ));
        }
        working_pattern.push_str(tail);

        Ok(TopicPattern {
            pattern: working_pattern,
            pattern_regex: token_regex,
            construction_tokens: tokens.clone(),
        })
    }

    /// Derives a subscription filter: a token with a construction-time value is substituted with
    /// it, and every other (unresolved) token is replaced with [`WILDCARD`].
    #[must_use]
    pub fn as_filter(&self) -> String {
        let mut filter = String::with_capacity(self.pattern.len());
        let mut last_match = 0;

        for caps in self.pattern_regex.captures_iter(&self.pattern) {
            let key_capture = caps.name("token").expect("capture group always present");
            let key = &key_capture.as_str()[1..key_capture.as_str().len() - 1];
            filter.push_str(&self.pattern[last_match..key_capture.start()]);

            match self.construction_tokens.get(key) {
                Some(val) => filter.push_str(val),
                None => filter.push_str(WILDCARD),
            }
            last_match = key_capture.end();
        }
        filter.push_str(&self.pattern[last_match..]);
        filter
    }

    /// Resolves the pattern to a fully literal topic using `tokens` for call-time values, falling
    /// back to the construction-time value for a key when `tokens` does not supply one. A
    /// call-time value takes precedence over a construction-time value for the same key.
    ///
    /// # Errors
    /// Returns [`crate::error::ErrorKind::ArgumentInvalid`] if a token has no replacement value
    /// from either source, or the replacement value is not a valid replacement string.
    pub fn resolve(&self, tokens: &HashMap<String, String>) -> Result<String, RpcError> {
        let mut resolved = String::with_capacity(self.pattern.len());
        let mut last_match = 0;

        for caps in self.pattern_regex.captures_iter(&self.pattern) {
            let key_capture = caps.name("token").expect("capture group always present");
            let key = &key_capture.as_str()[1..key_capture.as_str().len() - 1];
            resolved.push_str(&self.pattern[last_match..key_capture.start()]);

            let value = tokens.get(key).or_else(|| self.construction_tokens.get(key));
            match value {
                Some(val) if is_valid_replacement(val) => resolved.push_str(val),
                Some(val) => {
                    return Err(RpcError::argument_invalid(
                        key,
                        Value::String(val.to_string()),
                        Some(format!("replacement value '{val}' for token '{key}' is not valid")),
                    ));
                }
                None => {
                    return Err(RpcError::argument_invalid(
                        key,
                        Value::String(String::new()),
                        Some(format!("no replacement value provided for token '{key}'")),
                    ));
                }
            }
            last_match = key_capture.end();
        }
        resolved.push_str(&self.pattern[last_match..]);

        debug_assert!(!resolved.contains('{'), "resolved topic must not contain unresolved tokens");
        Ok(resolved)
    }

    /// Recovers token values from an incoming concrete `topic` by comparing it against the
    /// original pattern's token positions. Tokens not present in the pattern are absent from
    /// the result; an incoming topic that does not structurally match the pattern yields a
    /// best-effort (possibly partial) map rather than an error, since the caller has already
    /// accepted this delivery via a matching subscription filter.
    #[must_use]
    pub fn parse_tokens(&self, topic: &str) -> HashMap<String, String> {
        let mut tokens = HashMap::new();

        let mut topic_ref = topic;
        let mut last_token_end = 0;

        for find in self.pattern_regex.find_iter(&self.pattern) {
            let token_start = find.start();
            let token_end = find.end();

            let value_start = token_start.saturating_sub(last_token_end);
            last_token_end = token_end + 1;

            if value_start > topic_ref.len() {
                break;
            }
            topic_ref = &topic_ref[value_start..];
            let (value, rest) = topic_ref.split_once('/').unwrap_or((topic_ref, ""));
            topic_ref = rest;

            let name = &find.as_str()[1..find.as_str().len() - 1];
            tokens.insert(name.to_string(), value.to_string());
        }

        tokens
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::error::ErrorKind;

    #[test_case("test"; "no token")]
    #[test_case("test/test"; "no token multiple levels")]
    #[test_case("{wildToken}"; "only wildcard")]
    #[test_case("{testToken}"; "only token")]
    #[test_case("test/{testToken}"; "token at end")]
    #[test_case("{testToken}/test"; "token at start")]
    #[test_case("test/{testToken}/test/{testToken}"; "multiple tokens")]
    fn new_pattern_valid(pattern: &str) {
        // A construction-time value for a recognized token is validated but never baked into the
        // stored pattern: it stays a `{name}` placeholder so `resolve` can still be overridden.
        let tokens = HashMap::from([("testToken".to_string(), "testRepl".to_string())]);
        let parsed = TopicPattern::new(pattern, None, &tokens).unwrap();
        assert_eq!(parsed.pattern, pattern);
    }

    #[test_case(""; "empty")]
    #[test_case("$reserved/{testToken}"; "starts with dollar")]
    #[test_case("/leading/{testToken}"; "starts with slash")]
    #[test_case("{testToken}/trailing/"; "ends with slash")]
    #[test_case("a//b/{testToken}"; "double slash")]
    #[test_case("a/{testToken}{testToken}"; "adjacent tokens")]
    fn new_pattern_invalid(pattern: &str) {
        let tokens = HashMap::from([("testToken".to_string(), "testRepl".to_string())]);
        let err = TopicPattern::new(pattern, None, &tokens).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationInvalid);
    }

    #[test]
    fn namespace_is_prepended() {
        let tokens = HashMap::new();
        let pattern = TopicPattern::new("svc/{cmd}", Some("ns"), &tokens).unwrap();
        assert_eq!(pattern.pattern, "ns/svc/{cmd}");
    }

    #[test]
    fn invalid_namespace_rejected() {
        let tokens = HashMap::new();
        let err = TopicPattern::new("svc/{cmd}", Some("bad ns"), &tokens).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationInvalid);
        assert_eq!(err.property_name, Some("namespace".to_string()));
    }

    #[test]
    fn as_filter_substitutes_wildcard() {
        let tokens = HashMap::new();
        let pattern = TopicPattern::new("svc/{modelId}/cmd/{commandName}", None, &tokens).unwrap();
        assert_eq!(pattern.as_filter(), "svc/+/cmd/+");
    }

    #[test]
    fn as_filter_substitutes_construction_time_value_and_wildcards_the_rest() {
        let tokens = HashMap::from([("modelId".to_string(), "thermostat".to_string())]);
        let pattern = TopicPattern::new("svc/{modelId}/cmd/{commandName}", None, &tokens).unwrap();
        assert_eq!(pattern.as_filter(), "svc/thermostat/cmd/+");
    }

    #[test]
    fn resolve_fills_call_time_tokens() {
        let tokens = HashMap::new();
        let pattern = TopicPattern::new("svc/{modelId}/cmd/{commandName}", None, &tokens).unwrap();
        let call_tokens = HashMap::from([
            ("modelId".to_string(), "thermostat".to_string()),
            ("commandName".to_string(), "setTemp".to_string()),
        ]);
        assert_eq!(pattern.resolve(&call_tokens).unwrap(), "svc/thermostat/cmd/setTemp");
    }

    #[test]
    fn resolve_missing_token_is_argument_invalid() {
        let tokens = HashMap::new();
        let pattern = TopicPattern::new("svc/{modelId}", None, &tokens).unwrap();
        let err = pattern.resolve(&HashMap::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ArgumentInvalid);
        assert_eq!(err.property_name, Some("modelId".to_string()));
    }

    #[test]
    fn resolve_invalid_replacement_is_argument_invalid() {
        let tokens = HashMap::new();
        let pattern = TopicPattern::new("svc/{modelId}", None, &tokens).unwrap();
        let call_tokens = HashMap::from([("modelId".to_string(), "has space".to_string())]);
        let err = pattern.resolve(&call_tokens).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ArgumentInvalid);
    }

    #[test]
    fn construction_time_tokens_used_unless_overridden() {
        let tokens = HashMap::from([("modelId".to_string(), "thermostat".to_string())]);
        let pattern = TopicPattern::new("svc/{modelId}/cmd/{commandName}", None, &tokens).unwrap();
        let call_tokens = HashMap::from([("commandName".to_string(), "setTemp".to_string())]);
        assert_eq!(pattern.resolve(&call_tokens).unwrap(), "svc/thermostat/cmd/setTemp");
    }

    #[test]
    fn call_time_token_overrides_construction_time_token_for_same_key() {
        let tokens = HashMap::from([("modelId".to_string(), "thermostat".to_string())]);
        let pattern = TopicPattern::new("svc/{modelId}/cmd/{commandName}", None, &tokens).unwrap();
        let call_tokens = HashMap::from([
            ("modelId".to_string(), "humidifier".to_string()),
            ("commandName".to_string(), "setTemp".to_string()),
        ]);
        assert_eq!(pattern.resolve(&call_tokens).unwrap(), "svc/humidifier/cmd/setTemp");
    }

    #[test]
    fn parse_tokens_recovers_values() {
        let tokens = HashMap::new();
        let pattern = TopicPattern::new("svc/{modelId}/cmd/{commandName}", None, &tokens).unwrap();
        let parsed = pattern.parse_tokens("svc/thermostat/cmd/setTemp");
        assert_eq!(parsed.get("modelId"), Some(&"thermostat".to_string()));
        assert_eq!(parsed.get("commandName"), Some(&"setTemp".to_string()));
    }

    #[test]
    fn round_trip_resolve_then_parse() {
        let tokens = HashMap::new();
        let pattern = TopicPattern::new("svc/{modelId}/cmd/{commandName}", None, &tokens).unwrap();
        let call_tokens = HashMap::from([
            ("modelId".to_string(), "thermostat".to_string()),
            ("commandName".to_string(), "setTemp".to_string()),
        ]);
        let resolved = pattern.resolve(&call_tokens).unwrap();
        let parsed = pattern.parse_tokens(&resolved);
        for (k, v) in &call_tokens {
            assert_eq!(parsed.get(k), Some(v));
        }
    }
}
