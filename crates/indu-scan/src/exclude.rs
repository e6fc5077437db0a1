//! User exclusion patterns.
//!
//! Patterns are shell globs (`*`, `?`, `[...]`, with `*` crossing path
//! separators) compiled once into anchored regexes. A pattern excludes an
//! entry when it matches the entry's full path or any path suffix starting
//! after a slash, so `*.o` catches `/src/main.o` and `build/tmp` catches
//! `/home/x/build/tmp`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;

#[derive(Debug, Default)]
pub struct ExcludePatterns {
    patterns: Vec<Regex>,
}

impl ExcludePatterns {
    pub fn new() -> Self {
        ExcludePatterns::default()
    }

    pub fn add(&mut self, pattern: &str) -> Result<()> {
        let re = Regex::new(&glob_to_regex(pattern))
            .with_context(|| format!("invalid exclude pattern '{}'", pattern))?;
        self.patterns.push(re);
        Ok(())
    }

    /// Read patterns from a file, one per line; blank lines are skipped.
    pub fn add_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading exclude file {}", path.display()))?;
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            self.add(line)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(path))
    }
}

/// Translate one glob into a regex anchored at the path end and at a
/// component start (beginning of the path or right after a slash).
fn glob_to_regex(pattern: &str) -> String {
    let mut re = String::from("(?:^|/)");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => {
                let mut negation = None;
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    negation = chars.next();
                }
                let mut body = String::new();
                let mut closed = false;
                while let Some(&c) = chars.peek() {
                    // A ']' in first position is a literal member.
                    if c == ']' && !body.is_empty() {
                        chars.next();
                        closed = true;
                        break;
                    }
                    chars.next();
                    body.push(c);
                }
                if closed {
                    re.push('[');
                    if negation.is_some() {
                        re.push('^');
                    }
                    for c in body.chars() {
                        match c {
                            '\\' => re.push_str("\\\\"),
                            ']' => re.push_str("\\]"),
                            _ => re.push(c),
                        }
                    }
                    re.push(']');
                } else {
                    // No closing bracket: the whole run is literal text.
                    re.push_str(&regex::escape("["));
                    if let Some(neg) = negation {
                        re.push_str(&regex::escape(&neg.to_string()));
                    }
                    re.push_str(&regex::escape(&body));
                }
            }
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    re
}
