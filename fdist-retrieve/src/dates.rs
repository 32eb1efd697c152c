// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Tolerant parsing of the date formats remote listings actually serve.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Parse a listing date into unix seconds, treating zoneless forms as
/// GMT. `None` leaves the mtime unknown, which forces a HEAD request
/// later.
pub fn parse_listing_date(text: &str) -> Option<i64> {
    let text = text.trim();
    if text.is_empty() || text == "-" {
        return None;
    }

    // RFC 3339 / ISO with explicit zone.
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.timestamp());
    }
    // HTTP header style, e.g. "Sat, 01 Feb 2020 12:00:00 GMT".
    if let Ok(parsed) = DateTime::parse_from_rfc2822(&text.replace("GMT", "+0000")) {
        return Some(parsed.timestamp());
    }

    const ZONELESS: &[&str] = &[
        "%d-%b-%Y %H:%M:%S",
        "%d-%b-%Y %H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
    ];
    for format in ZONELESS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed.and_utc().timestamp());
        }
    }
    None
}

/// Unix seconds for "now", handy next to the parser.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_classic_apache_date() {
        let expected = Utc
            .with_ymd_and_hms(2020, 1, 1, 12, 0, 0)
            .unwrap()
            .timestamp();
        assert_eq!(parse_listing_date("01-Jan-2020 12:00"), Some(expected));
    }

    #[test]
    fn test_iso_dates() {
        let expected = Utc
            .with_ymd_and_hms(2021, 3, 4, 5, 6, 7)
            .unwrap()
            .timestamp();
        assert_eq!(parse_listing_date("2021-03-04 05:06:07"), Some(expected));
        assert_eq!(parse_listing_date("2021-03-04 05:06"), Some(expected - 7));
    }

    #[test]
    fn test_rfc3339_with_zone() {
        assert_eq!(
            parse_listing_date("2021-03-04T05:06:07+01:00"),
            Some(
                Utc.with_ymd_and_hms(2021, 3, 4, 4, 6, 7)
                    .unwrap()
                    .timestamp()
            )
        );
    }

    #[test]
    fn test_http_header_date() {
        assert_eq!(
            parse_listing_date("Sat, 01 Feb 2020 12:00:00 GMT"),
            Some(
                Utc.with_ymd_and_hms(2020, 2, 1, 12, 0, 0)
                    .unwrap()
                    .timestamp()
            )
        );
    }

    #[test]
    fn test_unparseable_is_none() {
        assert_eq!(parse_listing_date("yesterday-ish"), None);
        assert_eq!(parse_listing_date("-"), None);
        assert_eq!(parse_listing_date(""), None);
    }
}
