use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Glob-style restriction on the resources a token applies to.
///
/// `*` matches within one `/`-delimited segment, `**` crosses segments,
/// `?` matches a single non-`/` character. Everything else is literal.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourcePattern {
    raw: String,
    compiled: Regex,
}

impl ResourcePattern {
    pub fn new(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(anyhow!("resource pattern cannot be empty"));
        }
        let compiled = Regex::new(&glob_to_regex(raw))
            .map_err(|e| anyhow!("invalid resource pattern '{}': {}", raw, e))?;
        Ok(Self {
            raw: raw.to_string(),
            compiled,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, resource: &str) -> bool {
        self.compiled.is_match(resource)
    }
}

impl PartialEq for ResourcePattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for ResourcePattern {}

impl std::fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for ResourcePattern {
    type Error = anyhow::Error;

    fn try_from(raw: String) -> Result<Self> {
        Self::new(&raw)
    }
}

impl From<ResourcePattern> for String {
    fn from(pattern: ResourcePattern) -> Self {
        pattern.raw
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_stays_within_segment() {
        let p = ResourcePattern::new("/data/*").unwrap();
        assert!(p.matches("/data/x.txt"));
        assert!(!p.matches("/data/sub/x.txt"));
        assert!(!p.matches("/etc/passwd"));
    }

    #[test]
    fn double_star_crosses_segments() {
        let p = ResourcePattern::new("/data/**").unwrap();
        assert!(p.matches("/data/sub/x.txt"));
        assert!(!p.matches("/database"));
    }

    #[test]
    fn question_mark_is_one_character() {
        let p = ResourcePattern::new("/tmp/log?.txt").unwrap();
        assert!(p.matches("/tmp/log1.txt"));
        assert!(!p.matches("/tmp/log10.txt"));
        assert!(!p.matches("/tmp/log/.txt"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let p = ResourcePattern::new("https://api.example.com/v1/(x)").unwrap();
        assert!(p.matches("https://api.example.com/v1/(x)"));
        assert!(!p.matches("https://apiXexample.com/v1/(x)"));
    }

    #[test]
    fn empty_pattern_is_rejected() {
        assert!(ResourcePattern::new("").is_err());
    }
}
