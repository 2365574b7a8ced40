//! Path patterns — exact literals and trailing-wildcard prefixes
//!
//! ```text
//! /v1/messages      exact match only
//! /v1/messages/*    any path starting with "/v1/messages/"
//! /*                every path
//! ```

use std::fmt;

/// A compiled path pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathPattern {
    /// Matches one literal path
    Exact(String),
    /// Matches any path beginning with the prefix (the `*` is stripped)
    Prefix(String),
}

impl PathPattern {
    /// Parse a pattern string
    ///
    /// # Examples
    ///
    /// ```
    /// use a3s_topology::router::PathPattern;
    ///
    /// let pattern = PathPattern::parse("/v1/*").unwrap();
    /// assert!(pattern.matches("/v1/messages"));
    /// ```
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if !input.starts_with('/') {
            return Err(format!("path pattern '{}' must start with '/'", input));
        }
        if input.chars().any(char::is_whitespace) {
            return Err(format!("path pattern '{}' must not contain whitespace", input));
        }
        match input.find('*') {
            None => Ok(Self::Exact(input.to_string())),
            Some(pos) if pos == input.len() - 1 => {
                Ok(Self::Prefix(input[..pos].to_string()))
            }
            Some(_) => Err(format!(
                "path pattern '{}' may only use '*' as the last character",
                input
            )),
        }
    }

    /// Check whether a concrete request path matches
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(expected) => path == expected,
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }

    /// Whether this is an exact literal
    pub fn is_exact(&self) -> bool {
        matches!(self, Self::Exact(_))
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(path) => write!(f, "{}", path),
            Self::Prefix(prefix) => write!(f, "{}*", prefix),
        }
    }
}

/// A set of patterns; matches when any member matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternSet {
    patterns: Vec<PathPattern>,
}

impl PatternSet {
    /// Parse every pattern, failing on the first invalid one
    pub fn parse<S: AsRef<str>>(inputs: &[S]) -> Result<Self, String> {
        if inputs.is_empty() {
            return Err("pattern set must contain at least one pattern".to_string());
        }
        let patterns = inputs
            .iter()
            .map(|p| PathPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Check a concrete path against the set
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }

    pub fn patterns(&self) -> &[PathPattern] {
        &self.patterns
    }
}

impl fmt::Display for PatternSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.patterns.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exact() {
        let pattern = PathPattern::parse("/health").unwrap();
        assert_eq!(pattern, PathPattern::Exact("/health".into()));
        assert!(pattern.is_exact());
        assert!(pattern.matches("/health"));
        assert!(!pattern.matches("/health/live"));
    }

    #[test]
    fn test_parse_prefix() {
        let pattern = PathPattern::parse("/v1/*").unwrap();
        assert_eq!(pattern, PathPattern::Prefix("/v1/".into()));
        assert!(pattern.matches("/v1/messages"));
        assert!(pattern.matches("/v1/"));
        assert!(!pattern.matches("/v1"));
        assert!(!pattern.matches("/v2/messages"));
    }

    #[test]
    fn test_parse_catch_all() {
        let pattern = PathPattern::parse("/*").unwrap();
        assert!(pattern.matches("/"));
        assert!(pattern.matches("/anything/at/all"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(PathPattern::parse("v1/*").unwrap_err().contains("must start with '/'"));
        assert!(PathPattern::parse("/v1/*/x").unwrap_err().contains("last character"));
        assert!(PathPattern::parse("/v 1").unwrap_err().contains("whitespace"));
    }

    #[test]
    fn test_display_round_trip() {
        for input in ["/health", "/v1/*", "/*"] {
            assert_eq!(PathPattern::parse(input).unwrap().to_string(), input);
        }
    }

    #[test]
    fn test_pattern_set() {
        let set = PatternSet::parse(&["/v1/messages", "/v1/messages/*"]).unwrap();
        assert!(set.matches("/v1/messages"));
        assert!(set.matches("/v1/messages/count_tokens"));
        assert!(!set.matches("/v1/models"));
        assert_eq!(set.to_string(), "/v1/messages,/v1/messages/*");
        assert!(PatternSet::parse::<&str>(&[]).is_err());
    }
}
