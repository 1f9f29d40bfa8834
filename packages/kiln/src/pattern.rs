//! Shared glob/regex match-pattern compilation.
//!
//! Both the path resolver's exclude list (§4.1) and the builder registry's
//! match patterns (§4.5 `AssetRecognizer`) need the same two pattern
//! kinds — a glob and a regex — compiled down to something we can run a
//! match against a candidate path. This module is the one place that
//! translation happens.

use color_eyre::{Result, eyre::Context as _};
use kiln_protocol::PatternKind;
use lazy_regex::regex::Regex;

/// A compiled match pattern, along with the source text it was compiled
/// from (kept around for logging and for `BuilderRegistration` projections).
#[derive(Clone, Debug)]
pub struct CompiledPattern {
    source: String,
    kind: PatternKind,
    regex: Regex,
}

impl CompiledPattern {
    /// Compile a pattern. Glob patterns are translated to an equivalent
    /// anchored, case-insensitive regex; `*` matches within a path segment,
    /// `**` matches across segments, `?` matches a single non-separator
    /// character.
    pub fn compile(source: impl Into<String>, kind: PatternKind) -> Result<Self> {
        let source = source.into();
        let pattern = match kind {
            PatternKind::Regex => source.clone(),
            PatternKind::Glob => glob_to_regex(&source),
        };
        let regex = Regex::new(&pattern)
            .with_context(|| format!("compile {kind:?} pattern {source:?}"))?;
        Ok(Self {
            source,
            kind,
            regex,
        })
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(&candidate.replace('\\', "/"))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("(?i)^");
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
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' | '[' | ']' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn glob_star_matches_within_segment() {
        let p = CompiledPattern::compile("*.txt", PatternKind::Glob).unwrap();
        assert!(p.is_match("foo.txt"));
        assert!(!p.is_match("foo/bar.txt"));
    }

    #[test]
    fn glob_doublestar_matches_across_segments() {
        let p = CompiledPattern::compile("**/*.txt", PatternKind::Glob).unwrap();
        assert!(p.is_match("a/b/c.txt"));
        assert!(p.is_match("c.txt"));
    }

    #[test]
    fn glob_is_case_insensitive() {
        let p = CompiledPattern::compile("*.TXT", PatternKind::Glob).unwrap();
        assert!(p.is_match("foo.txt"));
    }

    #[test]
    fn regex_pattern_used_verbatim() {
        let p = CompiledPattern::compile(r"^cache/.*$", PatternKind::Regex).unwrap();
        assert_eq!(p.kind(), PatternKind::Regex);
        assert!(p.is_match("cache/foo"));
        assert!(!p.is_match("source/foo"));
    }
}
