//! ---
//! dbr_section: "02-tuple-space"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Wildcard templates selecting tuples by name."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::fmt;

use crate::error::{DbrError, Result};
use crate::types::validate_key;

/// Compiled wildcard pattern over tuple names.
///
/// Supports `*` (any run, including empty), `?` (any single character),
/// bracket classes (`[abc]`, `[a-z]`, negated with `!` or `^`) and `\` escapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchTemplate {
    pattern: String,
    tokens: Vec<Token>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    AnyRun,
    Class { negated: bool, items: Vec<ClassItem> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClassItem {
    Char(char),
    Range(char, char),
}

impl Token {
    fn accepts(&self, c: char) -> bool {
        match self {
            Token::Literal(expected) => *expected == c,
            Token::AnyChar => true,
            Token::AnyRun => false,
            Token::Class { negated, items } => {
                let hit = items.iter().any(|item| match item {
                    ClassItem::Char(expected) => *expected == c,
                    ClassItem::Range(lo, hi) => (*lo..=*hi).contains(&c),
                });
                hit != *negated
            }
        }
    }
}

impl MatchTemplate {
    /// Compile a non-empty template.
    pub fn parse(pattern: &str) -> Result<Self> {
        validate_key(pattern, "match template")?;
        let tokens = tokenize(pattern)?;
        Ok(Self {
            pattern: pattern.to_owned(),
            tokens,
        })
    }

    /// Compile a template, treating the empty string as "no template".
    pub fn parse_optional(pattern: &str) -> Result<Option<Self>> {
        if pattern.is_empty() {
            Ok(None)
        } else {
            Self::parse(pattern).map(Some)
        }
    }

    /// Template matching every name.
    pub fn any() -> Self {
        Self {
            pattern: "*".to_owned(),
            tokens: vec![Token::AnyRun],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Whether the template contains no wildcard at all.
    pub fn is_literal(&self) -> bool {
        self.tokens.iter().all(|t| matches!(t, Token::Literal(_)))
    }

    pub fn matches(&self, name: &str) -> bool {
        let text: Vec<char> = name.chars().collect();
        glob_match(&self.tokens, &text)
    }
}

impl fmt::Display for MatchTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

fn tokenize(pattern: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                // consecutive stars are equivalent to one
                if !matches!(tokens.last(), Some(Token::AnyRun)) {
                    tokens.push(Token::AnyRun);
                }
            }
            '?' => tokens.push(Token::AnyChar),
            '\\' => tokens.push(Token::Literal(chars.next().unwrap_or('\\'))),
            '[' => {
                let negated = matches!(chars.peek(), Some('!') | Some('^'));
                if negated {
                    chars.next();
                }
                let mut items = Vec::new();
                let mut closed = false;
                let mut first = true;
                while let Some(c) = chars.next() {
                    let c = match c {
                        ']' if !first => {
                            closed = true;
                            break;
                        }
                        '\\' => chars.next().unwrap_or('\\'),
                        other => other,
                    };
                    first = false;
                    if chars.peek() == Some(&'-') {
                        let mut lookahead = chars.clone();
                        lookahead.next();
                        match lookahead.peek() {
                            Some(&hi) if hi != ']' => {
                                chars.next();
                                chars.next();
                                let (lo, hi) = if c <= hi { (c, hi) } else { (hi, c) };
                                items.push(ClassItem::Range(lo, hi));
                                continue;
                            }
                            _ => {}
                        }
                    }
                    items.push(ClassItem::Char(c));
                }
                if !closed {
                    return Err(DbrError::Invalid(format!(
                        "unterminated character class in template {pattern:?}"
                    )));
                }
                tokens.push(Token::Class { negated, items });
            }
            other => tokens.push(Token::Literal(other)),
        }
    }
    Ok(tokens)
}

fn glob_match(tokens: &[Token], text: &[char]) -> bool {
    let (mut t, mut s) = (0usize, 0usize);
    // position of the last `*` and the text offset it is currently absorbing up to
    let mut backtrack: Option<(usize, usize)> = None;
    while s < text.len() {
        if let Some(token) = tokens.get(t) {
            if matches!(token, Token::AnyRun) {
                backtrack = Some((t, s));
                t += 1;
                continue;
            }
            if token.accepts(text[s]) {
                t += 1;
                s += 1;
                continue;
            }
        }
        match backtrack {
            Some((star, absorbed)) => {
                t = star + 1;
                s = absorbed + 1;
                backtrack = Some((star, absorbed + 1));
            }
            None => return false,
        }
    }
    tokens[t..].iter().all(|token| matches!(token, Token::AnyRun))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(pattern: &str, name: &str) -> bool {
        MatchTemplate::parse(pattern).expect("valid template").matches(name)
    }

    #[test]
    fn star_matches_any_run() {
        assert!(m("*", ""));
        assert!(m("*", "testTup"));
        assert!(m("test*", "testTup"));
        assert!(m("*Tup", "testTup"));
        assert!(m("t*t*p", "testTup"));
        assert!(m("**x", "x"));
        assert!(!m("test*", "tesTup"));
        assert!(!m("*x", "xy"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        assert!(m("k?", "k1"));
        assert!(!m("k?", "k"));
        assert!(!m("k?", "k12"));
    }

    #[test]
    fn bracket_classes() {
        assert!(m("k[12]", "k1"));
        assert!(!m("k[12]", "k3"));
        assert!(m("k[a-c]x", "kbx"));
        assert!(m("k[c-a]x", "kbx"));
        assert!(m("k[!0-9]", "ka"));
        assert!(!m("k[^0-9]", "k5"));
        assert!(m("k[]]", "k]"));
        assert!(m("k[a-]", "k-"));
    }

    #[test]
    fn escapes_make_metacharacters_literal() {
        assert!(m("a\\*b", "a*b"));
        assert!(!m("a\\*b", "aXb"));
        assert!(m("q\\?", "q?"));
    }

    #[test]
    fn rejects_malformed_templates() {
        assert!(MatchTemplate::parse("").is_err());
        assert!(MatchTemplate::parse("k[12").is_err());
        assert_eq!(MatchTemplate::parse_optional("").expect("empty is none"), None);
    }

    #[test]
    fn literal_detection() {
        assert!(MatchTemplate::parse("plain").unwrap().is_literal());
        assert!(!MatchTemplate::any().is_literal());
    }
}
