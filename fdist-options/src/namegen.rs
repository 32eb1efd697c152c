// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Name templates with `%`-escapes.
//!
//! `%n` inserts a four digit counter from a persistent sequence file,
//! `%t<fmt>` a GMT time field. Anything else after a `%` voids the whole
//! name with a warning, mirroring how a bad assemble rule behaves.

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::warn;

/// The ceiling of the `%n` sequence; four digits wrap at ten thousand.
const COUNTER_MODULUS: u32 = 10_000;

/// Fetch and advance the persistent counter.
pub fn next_counter(counter_file: &Path) -> std::io::Result<u32> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(counter_file)?;
    // Exclusive lock: the counter is shared between every worker of the
    // daemon family.
    let mut file = nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive)
        .map_err(|(_, errno)| std::io::Error::from(errno))?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let current: u32 = contents.trim().parse().unwrap_or(0);
    let next = (current + 1) % COUNTER_MODULUS;

    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    write!(file, "{next}")?;
    Ok(next)
}

/// Expand a name template. Returns `None` (and warns) on an unknown
/// escape, in which case the caller falls back to its fixed default.
pub fn expand_template(
    template: &str,
    now: DateTime<Utc>,
    counter_file: &Path,
) -> Option<String> {
    let mut out = String::with_capacity(template.len() + 8);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => {
                let counter = match next_counter(counter_file) {
                    Ok(counter) => counter,
                    Err(err) => {
                        warn!("failed to advance name counter: {err}");
                        0
                    }
                };
                out.push_str(&format!("{counter:04}"));
            }
            Some('t') => match chars.next() {
                Some(fmt) => match time_field(fmt, now) {
                    Some(field) => out.push_str(&field),
                    None => {
                        warn!("unknown time parameter `{fmt}' in name rule {template}");
                        return None;
                    }
                },
                None => {
                    warn!("time option without parameter in name rule {template}");
                    return None;
                }
            },
            other => {
                warn!(
                    "unknown format {} in name rule {template}",
                    other.map(String::from).unwrap_or_default()
                );
                return None;
            }
        }
    }
    Some(out)
}

/// Expand only the `%t` escapes of a template, leaving everything else in
/// place. Used to turn a time-templated file mask into a concrete name.
pub fn expand_time_only(template: &str, now: DateTime<Utc>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' && chars.peek() == Some(&'t') {
            chars.next();
            if let Some(fmt) = chars.next() {
                if let Some(field) = time_field(fmt, now) {
                    out.push_str(&field);
                    continue;
                }
                out.push('%');
                out.push('t');
                out.push(fmt);
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn time_field(fmt: char, now: DateTime<Utc>) -> Option<String> {
    Some(match fmt {
        'a' => now.format("%a").to_string(),
        'A' => now.format("%A").to_string(),
        'b' => now.format("%b").to_string(),
        'B' => now.format("%B").to_string(),
        'd' => format!("{:02}", now.day()),
        'j' => format!("{:03}", now.ordinal()),
        'y' => format!("{:02}", now.year() % 100),
        'Y' => format!("{}", now.year()),
        'm' => format!("{:02}", now.month()),
        'H' => format!("{:02}", now.hour()),
        'M' => format!("{:02}", now.minute()),
        'S' => format!("{:02}", now.second()),
        'U' => format!("{}", now.timestamp()),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 5).unwrap()
    }

    #[test]
    fn test_counter_advances_and_wraps() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("COUNTER");
        assert_eq!(next_counter(&counter).unwrap(), 1);
        assert_eq!(next_counter(&counter).unwrap(), 2);
        std::fs::write(&counter, "9999").unwrap();
        assert_eq!(next_counter(&counter).unwrap(), 0);
    }

    #[test]
    fn test_expand_literal_and_fields() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("COUNTER");
        let name = expand_template("msg_%tY%tm%td_%tH%tM", sample_time(), &counter).unwrap();
        assert_eq!(name, "msg_20200101_1200");
        let name = expand_template("seq-%n", sample_time(), &counter).unwrap();
        assert_eq!(name, "seq-0001");
    }

    #[test]
    fn test_unknown_escape_voids_name() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("COUNTER");
        assert!(expand_template("bad_%q", sample_time(), &counter).is_none());
        assert!(expand_template("bad_%tQ", sample_time(), &counter).is_none());
        assert!(expand_template("bad_%t", sample_time(), &counter).is_none());
    }

    #[test]
    fn test_expand_time_only_keeps_wildcards() {
        let mask = expand_time_only("data_%tY%tm%td_*.grib", sample_time());
        assert_eq!(mask, "data_20200101_*.grib");
        // Unknown fields stay verbatim rather than voiding the mask.
        assert_eq!(expand_time_only("x_%tQ", sample_time()), "x_%tQ");
    }

    #[test]
    fn test_unix_timestamp_field() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("COUNTER");
        let name = expand_template("%tU", sample_time(), &counter).unwrap();
        assert_eq!(name, sample_time().timestamp().to_string());
    }
}
