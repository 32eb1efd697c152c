// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Listing size fields: a bare number is bytes, `K`/`M`/`G`/`T`/`P`/`E`
//! are powers of 1024. `-` or anything non-numeric means unknown.

/// A size parsed from a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingSize {
    pub bytes: i64,
    /// False when a unit suffix rounded the value, in which case a HEAD
    /// request may refine it.
    pub exact: bool,
}

pub fn parse_listing_size(text: &str) -> Option<ListingSize> {
    let text = text.trim();
    let digits_end = text
        .char_indices()
        .take_while(|&(i, c)| c.is_ascii_digit() || (c == '.' && i > 0))
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    let number: f64 = text[..digits_end].parse().ok()?;
    let (multiplier, exact) = match text[digits_end..].trim_start().chars().next() {
        Some('K') => (1024f64, false),
        Some('M') => (1024f64.powi(2), false),
        Some('G') => (1024f64.powi(3), false),
        Some('T') => (1024f64.powi(4), false),
        Some('P') => (1024f64.powi(5), false),
        Some('E') => (1024f64.powi(6), false),
        _ => (1f64, true),
    };
    Some(ListingSize {
        bytes: (number * multiplier) as i64,
        exact,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_bytes_are_exact() {
        assert_eq!(
            parse_listing_size("12345"),
            Some(ListingSize {
                bytes: 12345,
                exact: true
            })
        );
    }

    #[test]
    fn test_suffixes_are_powers_of_1024() {
        assert_eq!(parse_listing_size("5K").unwrap().bytes, 5 * 1024);
        assert_eq!(parse_listing_size("2M").unwrap().bytes, 2 * 1024 * 1024);
        assert_eq!(parse_listing_size("1G").unwrap().bytes, 1024 * 1024 * 1024);
        assert!(!parse_listing_size("5K").unwrap().exact);
    }

    #[test]
    fn test_fractional_sizes() {
        assert_eq!(parse_listing_size("1.5K").unwrap().bytes, 1536);
    }

    #[test]
    fn test_unknown_sizes() {
        assert_eq!(parse_listing_size("-"), None);
        assert_eq!(parse_listing_size(""), None);
        assert_eq!(parse_listing_size("n/a"), None);
    }
}
