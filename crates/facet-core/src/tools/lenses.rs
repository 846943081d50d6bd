//! Text lenses: small, composable string transforms.
//!
//! A lens chain is a list of specs such as `["dedent", "trim", "limit(100)"]`,
//! applied left to right.

use crate::registry::ToolError;
use regex::Regex;
use std::str::FromStr;
use std::sync::LazyLock;

/// Longest accepted lens chain.
pub const MAX_LENS_CHAIN_LENGTH: usize = 10;

static HORIZONTAL_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("whitespace regex must compile"));
static MD_HEADING: LazyLock<Regex> =
    LazyLock::new(|| {
        Regex::new(r"(?m)^[ \t]{0,3}#{1,6}[ \t]+").expect("heading regex must compile")
    });
static MD_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!?\[([^\]]*)\]\([^)]*\)").expect("link regex must compile"));
static MD_EMPHASIS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\*\*|__|\*|_|~~)([^*_~\n]+)(\*\*|__|\*|_|~~)")
        .expect("emphasis regex must compile")
});
static MD_INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`\n]*)`").expect("code regex must compile"));
static MD_LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| {
        Regex::new(r"(?m)^([ \t]*)(?:[-*+]|\d+\.)[ \t]+").expect("list regex must compile")
    });

/// One parsed lens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lens {
    Trim,
    Dedent,
    SqueezeSpaces,
    NormalizeNewlines,
    JsonMinify,
    StripMarkdown,
    Lowercase,
    Uppercase,
    /// Keep at most this many characters.
    Limit(usize),
}

impl FromStr for Lens {
    type Err = ToolError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();
        let (name, arg) = match spec.split_once('(') {
            Some((name, rest)) => {
                let arg = rest
                    .strip_suffix(')')
                    .ok_or_else(|| ToolError::invalid(format!("Malformed lens: {}", spec)))?;
                (name.trim(), Some(arg.trim()))
            }
            None => (spec, None),
        };

        let lens = match (name, arg) {
            ("trim", None) => Lens::Trim,
            ("dedent", None) => Lens::Dedent,
            ("squeeze_spaces", None) => Lens::SqueezeSpaces,
            ("normalize_newlines", None) => Lens::NormalizeNewlines,
            ("json_minify", None) => Lens::JsonMinify,
            ("strip_markdown", None) => Lens::StripMarkdown,
            ("lowercase", None) => Lens::Lowercase,
            ("uppercase", None) => Lens::Uppercase,
            ("limit", Some(n)) => Lens::Limit(n.parse().map_err(|_| {
                ToolError::invalid(format!("limit expects a non-negative integer, got {:?}", n))
            })?),
            ("limit", None) => {
                return Err(ToolError::invalid(
                    "limit requires an argument, e.g. limit(100)",
                ))
            }
            (
                name @ ("trim" | "dedent" | "squeeze_spaces" | "normalize_newlines" | "json_minify"
                | "strip_markdown" | "lowercase" | "uppercase"),
                Some(_),
            ) => return Err(ToolError::invalid(format!("Lens {} takes no arguments", name))),
            _ => return Err(ToolError::invalid(format!("Unknown lens: {}", name))),
        };
        Ok(lens)
    }
}

impl Lens {
    pub fn apply(self, text: &str) -> Result<String, ToolError> {
        let out = match self {
            Lens::Trim => text.trim().to_string(),
            Lens::Dedent => dedent(text),
            Lens::SqueezeSpaces => HORIZONTAL_WHITESPACE.replace_all(text, " ").into_owned(),
            Lens::NormalizeNewlines => text.replace("\r\n", "\n").replace('\r', "\n"),
            Lens::JsonMinify => {
                let value: serde_json::Value = serde_json::from_str(text)
                    .map_err(|e| {
                        ToolError::failed(format!("json_minify: input is not JSON: {}", e))
                    })?;
                value.to_string()
            }
            Lens::StripMarkdown => strip_markdown(text),
            Lens::Lowercase => text.to_lowercase(),
            Lens::Uppercase => text.to_uppercase(),
            Lens::Limit(n) => text.chars().take(n).collect(),
        };
        Ok(out)
    }
}

/// Parse and apply a lens chain.
pub fn apply_lenses(text: &str, specs: &[String]) -> Result<String, ToolError> {
    if specs.len() > MAX_LENS_CHAIN_LENGTH {
        return Err(ToolError::invalid(format!(
            "Lens chain of {} exceeds maximum {}",
            specs.len(),
            MAX_LENS_CHAIN_LENGTH
        )));
    }

    // Parse everything first so a bad spec late in the chain fails before any work.
    let lenses = specs
        .iter()
        .map(|spec| spec.parse::<Lens>())
        .collect::<Result<Vec<_>, _>>()?;

    lenses
        .into_iter()
        .try_fold(text.to_string(), |acc, lens| lens.apply(&acc))
}

fn dedent(text: &str) -> String {
    let indent = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0);

    text.split('\n')
        .map(|line| {
            if line.trim().is_empty() {
                line.trim_start_matches([' ', '\t'])
            } else {
                &line[indent..]
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_markdown(text: &str) -> String {
    let text = MD_HEADING.replace_all(text, "");
    let text = MD_LINK.replace_all(&text, "$1");
    let text = MD_INLINE_CODE.replace_all(&text, "$1");
    let text = MD_EMPHASIS.replace_all(&text, "$2");
    MD_LIST_MARKER.replace_all(&text, "$1").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(specs: &[&str]) -> Vec<String> {
        specs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_lens_specs() {
        assert_eq!("trim".parse::<Lens>().unwrap(), Lens::Trim);
        assert_eq!(" limit( 12 ) ".parse::<Lens>().unwrap(), Lens::Limit(12));
        assert!("limit".parse::<Lens>().is_err());
        assert!("limit(x)".parse::<Lens>().is_err());
        assert!("trim(3)".parse::<Lens>().is_err());
        assert!("limit(3".parse::<Lens>().is_err());
        assert!("explode".parse::<Lens>().is_err());
    }

    #[test]
    fn test_dedent_trim_chain() {
        let text = "\n    def f():\n        return 1\n";
        let out = apply_lenses(text, &chain(&["dedent", "trim"])).unwrap();
        assert_eq!(out, "def f():\n    return 1");
    }

    #[test]
    fn test_squeeze_and_normalize() {
        let lenses = chain(&["normalize_newlines", "squeeze_spaces"]);
        let out = apply_lenses("a  \t b\r\nc\rd", &lenses).unwrap();
        assert_eq!(out, "a b\nc\nd");
    }

    #[test]
    fn test_limit_counts_chars() {
        let out = apply_lenses("héllo wörld", &chain(&["limit(4)"])).unwrap();
        assert_eq!(out, "héll");
    }

    #[test]
    fn test_json_minify() {
        let out = apply_lenses("{ \"a\" : [1, 2] }", &chain(&["json_minify"])).unwrap();
        assert_eq!(out, r#"{"a":[1,2]}"#);
        assert!(apply_lenses("{oops", &chain(&["json_minify"])).is_err());
    }

    #[test]
    fn test_strip_markdown() {
        let md = "# Title\n\nSome **bold** and `code` with a [link](http://x).\n- item";
        let out = apply_lenses(md, &chain(&["strip_markdown"])).unwrap();
        assert_eq!(out, "Title\n\nSome bold and code with a link.\nitem");
    }

    #[test]
    fn test_chain_too_long() {
        let specs = vec!["trim".to_string(); MAX_LENS_CHAIN_LENGTH + 1];
        let err = apply_lenses("x", &specs).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[test]
    fn test_unknown_lens_fails_whole_chain() {
        let err = apply_lenses("x", &chain(&["trim", "bogus"])).unwrap_err();
        assert_eq!(err, ToolError::invalid("Unknown lens: bogus"));
    }
}
