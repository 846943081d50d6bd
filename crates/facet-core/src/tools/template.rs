//! `{{variable}}` template substitution.

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}")
        .expect("placeholder regex must compile")
});

/// Replace `{{name}}` placeholders with values from `variables`.
///
/// Strings are inserted verbatim, every other value as compact JSON.
/// Placeholders without a matching variable are left untouched.
pub fn render(template: &str, variables: &Map<String, Value>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match variables.get(&caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}
