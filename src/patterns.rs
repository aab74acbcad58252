//! Declarative replacements applied to model output.
//!
//! A [`ResponsePattern`] rewrites matches of a literal or regex in the
//! response text. For whole responses use [`apply_patterns`]; for streams,
//! [`PatternFilter`] implements [`ChunkFilter`] and holds back a tail window
//! so a match is never split across two emitted chunks.

use crate::error::Result;
use crate::streaming::ChunkFilter;
use crate::PipelineError;
use regex::{Captures, Regex, RegexBuilder};
use std::fmt;
use std::sync::Arc;

/// Retained tail never shrinks below this many bytes.
const MIN_WINDOW: usize = 50;
/// Extra bytes kept beyond the longest pattern source.
const SAFETY_MARGIN: usize = 50;
/// Default cap on buffered bytes before a forced flush.
pub const DEFAULT_MAX_BUFFER: usize = 10_240;

type ReplaceFn = Arc<dyn Fn(&Captures<'_>) -> String + Send + Sync>;

#[derive(Clone)]
enum Replacement {
    Text(String),
    With(ReplaceFn),
}

/// One replacement rule.
///
/// # Example
///
/// ```
/// use textile::patterns::{apply_patterns, ResponsePattern};
///
/// let phone = ResponsePattern::literal("<PHONE_1>", "206-555-0100").unwrap();
/// let (text, n) = apply_patterns(&[phone], "Call <PHONE_1>.");
/// assert_eq!(text, "Call 206-555-0100.");
/// assert_eq!(n, 1);
/// ```
#[derive(Clone)]
pub struct ResponsePattern {
    source: String,
    regex: Regex,
    replacement: Replacement,
    max_replacements: Option<usize>,
}

fn compile(source: &str, ignore_case: bool) -> Result<Regex> {
    RegexBuilder::new(source)
        .case_insensitive(ignore_case)
        .build()
        .map_err(|e| PipelineError::InvalidConfig(format!("invalid pattern '{}': {}", source, e)))
}

impl ResponsePattern {
    /// Replace every occurrence of `needle` with `replacement`, verbatim.
    pub fn literal(needle: &str, replacement: impl Into<String>) -> Result<Self> {
        if needle.is_empty() {
            return Err(PipelineError::InvalidConfig("pattern must not be empty".into()));
        }
        let source = regex::escape(needle);
        Ok(Self {
            regex: compile(&source, false)?,
            source,
            replacement: Replacement::Text(replacement.into()),
            max_replacements: None,
        })
    }

    /// Replace regex matches with `replacement`, verbatim (no `$1` expansion).
    pub fn regex(pattern: &str, replacement: impl Into<String>) -> Result<Self> {
        Ok(Self {
            regex: compile(pattern, false)?,
            source: pattern.to_string(),
            replacement: Replacement::Text(replacement.into()),
            max_replacements: None,
        })
    }

    /// Replace regex matches with the output of `f`.
    pub fn with<F>(pattern: &str, f: F) -> Result<Self>
    where
        F: Fn(&Captures<'_>) -> String + Send + Sync + 'static,
    {
        Ok(Self {
            regex: compile(pattern, false)?,
            source: pattern.to_string(),
            replacement: Replacement::With(Arc::new(f)),
            max_replacements: None,
        })
    }

    /// Match case-insensitively.
    pub fn ignore_case(mut self) -> Result<Self> {
        self.regex = compile(&self.source, true)?;
        Ok(self)
    }

    /// Stop after `n` replacements (per response or per stream).
    pub fn max_replacements(mut self, n: usize) -> Self {
        self.max_replacements = Some(n);
        self
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Apply with a remaining budget; returns the new text and replacements made.
    fn apply_budgeted(&self, text: &str, budget: &mut Option<usize>) -> (String, usize) {
        if *budget == Some(0) {
            return (text.to_string(), 0);
        }
        let mut made = 0usize;
        let out = self.regex.replace_all(text, |caps: &Captures<'_>| {
            if budget.is_some_and(|b| made >= b) {
                return caps[0].to_string();
            }
            made += 1;
            match &self.replacement {
                Replacement::Text(s) => s.clone(),
                Replacement::With(f) => f(caps),
            }
        });
        if let Some(b) = budget.as_mut() {
            *b -= made;
        }
        (out.into_owned(), made)
    }
}

impl fmt::Debug for ResponsePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponsePattern")
            .field("pattern", &self.source)
            .field("max_replacements", &self.max_replacements)
            .finish()
    }
}

/// Apply every pattern, in order, to a complete text.
///
/// Returns the rewritten text and the total number of replacements.
pub fn apply_patterns(patterns: &[ResponsePattern], text: &str) -> (String, usize) {
    let mut budgets: Vec<Option<usize>> = patterns.iter().map(|p| p.max_replacements).collect();
    apply_all(patterns, &mut budgets, text)
}

fn apply_all(
    patterns: &[ResponsePattern],
    budgets: &mut [Option<usize>],
    text: &str,
) -> (String, usize) {
    let mut out = text.to_string();
    let mut total = 0;
    for (pattern, budget) in patterns.iter().zip(budgets.iter_mut()) {
        let (next, made) = pattern.apply_budgeted(&out, budget);
        out = next;
        total += made;
    }
    (out, total)
}

/// Counters kept by a [`PatternFilter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatternStats {
    pub chunks_processed: usize,
    pub replacements: usize,
    pub forced_flushes: usize,
}

/// Streaming pattern replacement.
///
/// Input is buffered; only text at least `window` bytes behind the newest
/// input is released, and the release point is moved back so it never
/// falls inside a match. Replacement budgets span the whole stream.
#[derive(Debug)]
pub struct PatternFilter {
    patterns: Vec<ResponsePattern>,
    budgets: Vec<Option<usize>>,
    buffer: String,
    window: usize,
    max_buffer: usize,
    stats: PatternStats,
}

impl PatternFilter {
    pub fn new(patterns: Vec<ResponsePattern>) -> Self {
        Self::with_max_buffer(patterns, DEFAULT_MAX_BUFFER)
    }

    pub fn with_max_buffer(patterns: Vec<ResponsePattern>, max_buffer: usize) -> Self {
        let longest = patterns
            .iter()
            .map(|p| p.source.len())
            .max()
            .unwrap_or(0)
            .max(MIN_WINDOW);
        let window = (longest + SAFETY_MARGIN).min(max_buffer / 2).max(1);
        Self {
            budgets: patterns.iter().map(|p| p.max_replacements).collect(),
            patterns,
            buffer: String::new(),
            window,
            max_buffer,
            stats: PatternStats::default(),
        }
    }

    pub fn stats(&self) -> PatternStats {
        self.stats
    }

    /// Bytes currently held back.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn safe_boundary(&mut self) -> usize {
        let len = self.buffer.len();
        if len < self.window {
            return 0;
        }
        let mut boundary = len - self.window;
        if len > self.max_buffer {
            self.stats.forced_flushes += 1;
            tracing::warn!(
                buffered = len,
                max = self.max_buffer,
                "pattern buffer full; forcing release"
            );
        } else {
            for pattern in &self.patterns {
                for m in pattern.regex.find_iter(&self.buffer) {
                    if m.start() < boundary && boundary < m.end() {
                        boundary = m.start();
                    }
                }
            }
        }
        while !self.buffer.is_char_boundary(boundary) {
            boundary -= 1;
        }
        boundary
    }

    fn release(&mut self, text: &str) -> String {
        let (out, made) = apply_all(&self.patterns, &mut self.budgets, text);
        self.stats.replacements += made;
        out
    }
}

impl ChunkFilter for PatternFilter {
    fn transform_chunk(&mut self, chunk: &str) -> String {
        if chunk.is_empty() {
            return String::new();
        }
        self.stats.chunks_processed += 1;
        self.buffer.push_str(chunk);
        let boundary = self.safe_boundary();
        if boundary == 0 {
            return String::new();
        }
        let ready: String = self.buffer.drain(..boundary).collect();
        self.release(&ready)
    }

    fn flush(&mut self) -> String {
        let rest = std::mem::take(&mut self.buffer);
        if rest.is_empty() {
            return rest;
        }
        self.release(&rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_stream(filter: &mut PatternFilter, chunks: &[&str]) -> String {
        let mut out: String = chunks.iter().map(|c| filter.transform_chunk(c)).collect();
        out.push_str(&filter.flush());
        out
    }

    #[test]
    fn test_literal_is_escaped() {
        let p = ResponsePattern::literal("a.b", "X").unwrap();
        assert_eq!(apply_patterns(&[p], "a.b axb").0, "X axb");
    }

    #[test]
    fn test_regex_with_closure() {
        let p = ResponsePattern::with(r"<PHONE_(\d+)>", |c| format!("[phone {}]", &c[1])).unwrap();
        let (text, n) = apply_patterns(&[p], "<PHONE_1> and <PHONE_22>");
        assert_eq!(text, "[phone 1] and [phone 22]");
        assert_eq!(n, 2);
    }

    #[test]
    fn test_ignore_case_and_max_replacements() {
        let p = ResponsePattern::literal("secret", "***")
            .unwrap()
            .ignore_case()
            .unwrap()
            .max_replacements(2);
        let (text, n) = apply_patterns(&[p], "Secret SECRET secret");
        assert_eq!(text, "*** *** secret");
        assert_eq!(n, 2);
    }

    #[test]
    fn test_invalid_regex_is_config_error() {
        assert!(matches!(
            ResponsePattern::regex("(unclosed", "x"),
            Err(PipelineError::InvalidConfig(_))
        ));
        assert!(ResponsePattern::literal("", "x").is_err());
    }

    #[test]
    fn test_stream_match_split_across_chunks() {
        let p = ResponsePattern::literal("<USER>", "Ada").unwrap();
        let mut filter = PatternFilter::new(vec![p]);
        let filler = "x".repeat(120);
        let out = run_stream(&mut filter, &["Hello <US", "ER>, ", &filler, " bye <", "USER>"]);
        assert_eq!(out, format!("Hello Ada, {} bye Ada", filler));
        assert_eq!(filter.stats().replacements, 2);
        assert_eq!(filter.buffered(), 0);
    }

    #[test]
    fn test_stream_releases_lazily() {
        let mut filter = PatternFilter::new(vec![ResponsePattern::literal("zz", "y").unwrap()]);
        assert_eq!(filter.transform_chunk("short"), "");
        let long = "a".repeat(200);
        let released = filter.transform_chunk(&long);
        assert!(!released.is_empty());
        assert!(filter.buffered() > 0);
        let rest = filter.flush();
        assert_eq!(format!("{}{}", released, rest), format!("short{}", long));
    }

    #[test]
    fn test_stream_budget_spans_chunks() {
        let p = ResponsePattern::literal("ab", "X").unwrap().max_replacements(1);
        let mut filter = PatternFilter::with_max_buffer(vec![p], 20);
        let out = run_stream(&mut filter, &["ab", &"-".repeat(30), "ab", &"-".repeat(30)]);
        assert_eq!(out.matches('X').count(), 1);
        assert_eq!(out.matches("ab").count(), 1);
    }

    #[test]
    fn test_multibyte_boundaries() {
        let patterns = vec![ResponsePattern::literal("é", "e").unwrap()];
        let mut filter = PatternFilter::with_max_buffer(patterns, 8);
        let out = run_stream(&mut filter, &["ééééé", "ééé"]);
        assert_eq!(out, "eeeeeeee");
    }
}
