//! Best-effort source heuristics
//!
//! Nothing here is a parser. The scanners look for the handful of patterns
//! that reliably make a dbt source unparseable (unbalanced template
//! delimiters, mismatched block tags, unterminated quotes, unbalanced
//! parentheses) and report where they start.

use crate::rule::{cached_regex, line_of, RuleError};
use regex::Regex;
use std::sync::OnceLock;

/// A problem found in a unit's source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceIssue {
    pub reason: String,

    /// 1-indexed line where the problem starts
    pub line: usize,
}

impl SourceIssue {
    fn new(reason: impl Into<String>, line: usize) -> Self {
        Self {
            reason: reason.into(),
            line,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Expr,
    Stmt,
    Comment,
}

impl Tag {
    fn opening(pair: &[u8]) -> Option<Self> {
        match pair {
            b"{{" => Some(Self::Expr),
            b"{%" => Some(Self::Stmt),
            b"{#" => Some(Self::Comment),
            _ => None,
        }
    }

    fn closing(pair: &[u8]) -> Option<Self> {
        match pair {
            b"}}" => Some(Self::Expr),
            b"%}" => Some(Self::Stmt),
            b"#}" => Some(Self::Comment),
            _ => None,
        }
    }

    fn open(&self) -> &'static str {
        match self {
            Self::Expr => "{{",
            Self::Stmt => "{%",
            Self::Comment => "{#",
        }
    }

    fn close(&self) -> &'static str {
        match self {
            Self::Expr => "}}",
            Self::Stmt => "%}",
            Self::Comment => "#}",
        }
    }
}

static INERT_START: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
static RAW_END: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// Copy of `source` with `{# #}` comments and `{% raw %}` blocks blanked out
///
/// Newlines are kept so line numbers still line up. A span that is never
/// closed is left untouched for the scanners to report.
fn mask_inert_spans(source: &str) -> Result<String, RuleError> {
    let start = cached_regex(&INERT_START, r"\{#|\{%[-+]?\s*raw\s*[-+]?%\}")?;
    let raw_end = cached_regex(&RAW_END, r"\{%[-+]?\s*endraw\s*[-+]?%\}")?;

    let mut masked = String::with_capacity(source.len());
    let mut pos = 0;

    while let Some(open) = start.find_at(source, pos) {
        let end = if open.as_str() == "{#" {
            source[open.end()..].find("#}").map(|at| open.end() + at + 2)
        } else {
            raw_end.find_at(source, open.end()).map(|close| close.end())
        };
        let Some(end) = end else { break };

        masked.push_str(&source[pos..open.start()]);
        masked.extend(
            source[open.start()..end]
                .chars()
                .map(|c| if c == '\n' { '\n' } else { ' ' }),
        );
        pos = end;
    }

    masked.push_str(&source[pos..]);
    Ok(masked)
}

/// Unbalanced `{{ }}`, `{% %}` and `{# #}` delimiters
///
/// The body of a `{% raw %}` block is literal text and is not checked.
pub fn template_delimiter_issues(source: &str) -> Result<Vec<SourceIssue>, RuleError> {
    let masked = mask_inert_spans(source)?;
    let source = masked.as_str();
    let bytes = source.as_bytes();
    let mut issues = Vec::new();
    let mut open: Option<(Tag, usize)> = None;
    let mut i = 0;

    while i + 1 < bytes.len() {
        let pair = &bytes[i..i + 2];

        match open {
            // Comments swallow everything up to their closer
            Some((Tag::Comment, _)) => {
                if pair == b"#}" {
                    open = None;
                    i += 2;
                    continue;
                }
            }
            Some((tag, at)) => {
                if pair == tag.close().as_bytes() {
                    open = None;
                    i += 2;
                    continue;
                }
                if let Some(inner) = Tag::opening(pair) {
                    issues.push(SourceIssue::new(
                        format!("'{}' is not closed before the next '{}'", tag.open(), inner.open()),
                        line_of(source, at),
                    ));
                    open = Some((inner, i));
                    i += 2;
                    continue;
                }
                if let Some(other) = Tag::closing(pair) {
                    issues.push(SourceIssue::new(
                        format!("'{}' is closed by '{}'", tag.open(), other.close()),
                        line_of(source, at),
                    ));
                    open = None;
                    i += 2;
                    continue;
                }
            }
            None => {
                if let Some(tag) = Tag::opening(pair) {
                    open = Some((tag, i));
                    i += 2;
                    continue;
                }
                if let Some(tag) = Tag::closing(pair) {
                    issues.push(SourceIssue::new(
                        format!("'{}' has no matching '{}'", tag.close(), tag.open()),
                        line_of(source, i),
                    ));
                    i += 2;
                    continue;
                }
            }
        }

        i += 1;
    }

    if let Some((tag, at)) = open {
        issues.push(SourceIssue::new(
            format!("'{}' is never closed", tag.open()),
            line_of(source, at),
        ));
    }

    Ok(issues)
}

/// Tags that take a matching `{% end<tag> %}`
const BLOCK_TAGS: [&str; 16] = [
    "if", "for", "macro", "call", "filter", "set", "raw", "with", "block", "autoescape", "trans",
    "materialization", "test", "data_test", "snapshot", "docs",
];

static STMT_TAG: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// Block tags (`{% if %}` .. `{% endif %}`) that are not properly nested
///
/// Only meaningful once the delimiters themselves are balanced. Tags inside
/// comments and raw blocks are ignored, as are end tags of unknown extensions.
pub fn block_tag_issues(source: &str) -> Result<Vec<SourceIssue>, RuleError> {
    let re = cached_regex(&STMT_TAG, r"\{%[-+]?\s*(\w+)((?s:.*?))[-+]?%\}")?;
    let masked = mask_inert_spans(source)?;
    let source = masked.as_str();
    let mut stack: Vec<(String, usize)> = Vec::new();
    let mut issues = Vec::new();

    for caps in re.captures_iter(source) {
        let Some(whole) = caps.get(0) else { continue };
        let keyword = caps[1].to_ascii_lowercase();
        let line = line_of(source, whole.start());

        if BLOCK_TAGS.contains(&keyword.as_str()) {
            // `{% set x %}...{% endset %}` is a block, `{% set x = 1 %}` is not
            if keyword != "set" || !caps[2].contains('=') {
                stack.push((keyword, line));
            }
            continue;
        }

        let Some(closed) = keyword.strip_prefix("end") else { continue };
        if !BLOCK_TAGS.contains(&closed) {
            continue;
        }
        match stack.pop() {
            Some((opened, _)) if opened == closed => {}
            Some((opened, opened_line)) => issues.push(SourceIssue::new(
                format!("'{{% end{} %}}' closes '{{% {} %}}' opened on line {}", closed, opened, opened_line),
                line,
            )),
            None => issues.push(SourceIssue::new(
                format!("'{{% end{} %}}' has no opening tag", closed),
                line,
            )),
        }
    }

    for (opened, line) in stack {
        issues.push(SourceIssue::new(format!("'{{% {} %}}' is never closed", opened), line));
    }

    Ok(issues)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lex {
    Normal,
    /// Start offset, and whether `\` escapes the next character
    SingleQuote(usize, bool),
    DoubleQuote(usize, bool),
    LineComment,
    BlockComment(usize),
    JinjaComment,
}

/// Unterminated quotes or comments and unbalanced parentheses in SQL text
///
/// A backslash is literal in SQL strings and only escapes inside `{{ }}` and
/// `{% %}` tags.
pub fn sql_lexical_issues(source: &str) -> Vec<SourceIssue> {
    let bytes = source.as_bytes();
    let mut issues = Vec::new();
    let mut state = Lex::Normal;
    let mut in_tag = false;
    let mut parens: Vec<usize> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();

        match state {
            Lex::Normal => match (b, next) {
                (b'-', Some(b'-')) => {
                    state = Lex::LineComment;
                    i += 1;
                }
                (b'/', Some(b'*')) => {
                    state = Lex::BlockComment(i);
                    i += 1;
                }
                (b'{', Some(b'#')) => {
                    state = Lex::JinjaComment;
                    i += 1;
                }
                (b'{', Some(b'{' | b'%')) => {
                    in_tag = true;
                    i += 1;
                }
                (b'}' | b'%', Some(b'}')) if in_tag => {
                    in_tag = false;
                    i += 1;
                }
                (b'\'', _) => state = Lex::SingleQuote(i, in_tag),
                (b'"', _) => state = Lex::DoubleQuote(i, in_tag),
                (b'(', _) => parens.push(i),
                (b')', _) => {
                    if parens.pop().is_none() {
                        issues.push(SourceIssue::new("')' has no matching '('", line_of(source, i)));
                    }
                }
                _ => {}
            },
            Lex::SingleQuote(_, true) | Lex::DoubleQuote(_, true) if b == b'\\' => {
                // Skip the escaped character
                i += 1;
            }
            Lex::SingleQuote(..) if b == b'\'' => state = Lex::Normal,
            Lex::DoubleQuote(..) if b == b'"' => state = Lex::Normal,
            Lex::LineComment if b == b'\n' => state = Lex::Normal,
            Lex::BlockComment(_) if b == b'*' && next == Some(b'/') => {
                state = Lex::Normal;
                i += 1;
            }
            Lex::JinjaComment if b == b'#' && next == Some(b'}') => {
                state = Lex::Normal;
                i += 1;
            }
            _ => {}
        }

        i += 1;
    }

    match state {
        Lex::SingleQuote(at, _) => issues.push(SourceIssue::new(
            "string literal is never terminated",
            line_of(source, at),
        )),
        Lex::DoubleQuote(at, _) => issues.push(SourceIssue::new(
            "quoted identifier is never terminated",
            line_of(source, at),
        )),
        Lex::BlockComment(at) => issues.push(SourceIssue::new(
            "'/*' comment is never closed",
            line_of(source, at),
        )),
        _ => {}
    }

    if let Some(&first) = parens.first() {
        issues.push(SourceIssue::new(
            format!("{} '(' never closed", parens.len()),
            line_of(source, first),
        ));
    }

    issues
}

static REF_CALL: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// Model names passed to `ref('name')` / `ref('package', 'name')` / `dbt.ref("name")`
///
/// Returns `(name, line)` pairs in source order.
pub fn ref_targets(source: &str) -> Result<Vec<(String, usize)>, RuleError> {
    let re = cached_regex(
        &REF_CALL,
        r#"\bref\(\s*['"]([^'"]+)['"]\s*(?:,\s*['"]([^'"]+)['"])?"#,
    )?;

    Ok(re
        .captures_iter(source)
        .filter_map(|caps| {
            let at = caps.get(0)?.start();
            let name = caps.get(2).or_else(|| caps.get(1))?.as_str().to_string();
            Some((name, line_of(source, at)))
        })
        .collect())
}
