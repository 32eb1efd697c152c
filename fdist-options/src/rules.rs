// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The rename-rule table.
//!
//! `etc/rename.rule` holds `[header]` sections of `filter rename-to`
//! pairs. The table is built once at startup and passed around as an
//! immutable handle; within a rule the first matching filter wins, and an
//! inverse filter definitively rejects the file.

use crate::mask::{match_mask, MaskResult};
use crate::namegen;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RenamePair {
    pub filter: String,
    pub rename_to: String,
}

#[derive(Debug, Clone, Default)]
pub struct RuleBook {
    rules: HashMap<String, Vec<RenamePair>>,
}

impl RuleBook {
    pub fn empty() -> RuleBook {
        RuleBook::default()
    }

    /// Parse the rule file. A missing file yields an empty book; rename
    /// options will then be skipped with a warning at run time.
    pub fn load(path: &Path) -> RuleBook {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to read {}: {err}", path.display());
                }
                return RuleBook::empty();
            }
        };
        let mut rules: HashMap<String, Vec<RenamePair>> = HashMap::new();
        let mut current: Option<String> = None;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = Some(header.to_string());
                rules.entry(header.to_string()).or_default();
                continue;
            }
            let Some(ref header) = current else {
                warn!("rename rule line outside any [header], skipping: {line}");
                continue;
            };
            match line.split_once(char::is_whitespace) {
                Some((filter, rename_to)) => {
                    rules.entry(header.clone()).or_default().push(RenamePair {
                        filter: filter.to_string(),
                        rename_to: rename_to.trim().to_string(),
                    });
                }
                None => warn!("rename rule without rename-to part, skipping: {line}"),
            }
        }
        RuleBook { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, header: &str) -> Option<&[RenamePair]> {
        self.rules.get(header).map(Vec::as_slice)
    }

    /// Apply the named rule to a file name: the first matching filter
    /// produces the new name; an inverse match or no match leaves the
    /// name alone.
    pub fn apply(
        &self,
        header: &str,
        file_name: &str,
        now: DateTime<Utc>,
        counter_file: &Path,
    ) -> Option<String> {
        for pair in self.get(header)? {
            match match_mask(&pair.filter, file_name) {
                MaskResult::Match => {
                    return change_name(file_name, &pair.filter, &pair.rename_to, now, counter_file)
                }
                MaskResult::InverseMatch => return None,
                MaskResult::NoMatch => {}
            }
        }
        None
    }
}

/// Build the new name from a matched filter and a rename-to template.
///
/// Template escapes: `*` inserts the next captured wildcard part of the
/// filter (in order), `%n` and `%t<fmt>` behave as in assemble names.
pub fn change_name(
    file_name: &str,
    filter: &str,
    rename_to: &str,
    now: DateTime<Utc>,
    counter_file: &Path,
) -> Option<String> {
    let captures = capture_wildcards(filter, file_name)?;
    let mut capture_iter = captures.iter();
    let mut out = String::with_capacity(rename_to.len() + file_name.len());
    let mut chars = rename_to.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => match capture_iter.next() {
                Some(part) => out.push_str(part),
                None => {
                    warn!("rename-to `{rename_to}' wants more wildcards than `{filter}' captured");
                    return None;
                }
            },
            '%' => match chars.peek() {
                Some('n') => {
                    chars.next();
                    let counter = namegen::next_counter(counter_file).unwrap_or_else(|err| {
                        warn!("failed to advance name counter: {err}");
                        0
                    });
                    out.push_str(&format!("{counter:04}"));
                }
                Some('t') => {
                    chars.next();
                    let fmt = chars.next()?;
                    let expanded = namegen::expand_time_only(&format!("%t{fmt}"), now);
                    if expanded.starts_with('%') {
                        warn!("unknown time parameter `{fmt}' in rename-to {rename_to}");
                        return None;
                    }
                    out.push_str(&expanded);
                }
                _ => {
                    warn!("unknown escape in rename-to {rename_to}");
                    return None;
                }
            },
            c => out.push(c),
        }
    }
    Some(out)
}

/// Run the glob and record the substring each `*` and `?` consumed,
/// in pattern order.
fn capture_wildcards(pattern: &str, name: &str) -> Option<Vec<String>> {
    // Each wildcard records how many bytes it consumed, in pattern order;
    // backtracking truncates the tail.
    fn walk(pattern: &[u8], name: &[u8], lengths: &mut Vec<usize>) -> bool {
        if pattern.is_empty() {
            return name.is_empty();
        }
        match pattern[0] {
            b'?' => {
                if name.is_empty() {
                    return false;
                }
                lengths.push(1);
                if walk(&pattern[1..], &name[1..], lengths) {
                    return true;
                }
                lengths.pop();
                false
            }
            b'*' => {
                // Longest-first so `*` grabs as much as it can, like the
                // original renamer.
                for take in (0..=name.len()).rev() {
                    lengths.push(take);
                    if walk(&pattern[1..], &name[take..], lengths) {
                        return true;
                    }
                    lengths.pop();
                }
                false
            }
            literal => {
                if name.first() == Some(&literal) {
                    walk(&pattern[1..], &name[1..], lengths)
                } else {
                    false
                }
            }
        }
    }

    let mut lengths = Vec::new();
    if !walk(pattern.as_bytes(), name.as_bytes(), &mut lengths) {
        return None;
    }

    let mut parts = Vec::with_capacity(lengths.len());
    let mut cursor = 0usize;
    let mut length_iter = lengths.iter();
    for c in pattern.bytes() {
        match c {
            b'*' | b'?' => {
                let &len = length_iter.next()?;
                parts.push(name[cursor..cursor + len].to_string());
                cursor += len;
            }
            _ => cursor += 1,
        }
    }
    Some(parts)
}
