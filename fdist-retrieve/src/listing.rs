// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! HTML directory-listing parser.
//!
//! Remote servers disagree wildly about what an index page looks like;
//! the dispatch recognises the classic Apache `<h1>` + `<PRE>` layout,
//! the `<table>` layout, the NOAA `<PRE>` + `<HR>` variant, bare `<ul>`
//! lists, and an Atom feed fallback on an XML prolog. Anything else is
//! reported with its first bytes so an operator can send it in.

use crate::dates::parse_listing_date;
use crate::sizes::parse_listing_size;

/// One candidate from a listing. Unknown mtime or size gets resolved by a
/// later HEAD request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub name: String,
    pub mtime: Option<i64>,
    pub size: Option<i64>,
    /// False when the size came with a unit suffix and is rounded.
    pub size_exact: bool,
}

impl ListEntry {
    fn name_only(name: String) -> ListEntry {
        ListEntry {
            name,
            mtime: None,
            size: None,
            size_exact: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListingError {
    #[error("unknown HTML directory listing (starts: {0:?})")]
    UnknownLayout(String),
    #[error("unknown feed type")]
    UnknownFeed,
}

/// Parse a listing body into its entries.
pub fn parse_listing(body: &str) -> Result<Vec<ListEntry>, ListingError> {
    let trimmed = body.trim_start();
    if trimmed.starts_with("<?xml") {
        return parse_feed(body);
    }

    let lower = body.to_ascii_lowercase();
    let after_h1 = lower.find("<h1").map(|pos| {
        let end = lower[pos..].find("</h1>").map(|i| pos + i + 5).unwrap_or(pos);
        end
    });

    if let Some(start) = after_h1 {
        let tail = &body[start..];
        let tail_lower = &lower[start..];
        let candidates = [
            (tail_lower.find("<table"), Layout::Table),
            (tail_lower.find("<pre"), Layout::Pre),
            (tail_lower.find("<ul"), Layout::List),
        ];
        let layout = candidates
            .iter()
            .filter_map(|&(pos, layout)| pos.map(|pos| (pos, layout)))
            .min_by_key(|&(pos, _)| pos);
        return match layout {
            Some((pos, Layout::Table)) => Ok(parse_table(&tail[pos..])),
            Some((pos, Layout::Pre)) => Ok(parse_pre(&tail[pos..])),
            Some((pos, Layout::List)) => Ok(parse_list(&tail[pos..])),
            None => Err(unknown_layout(body)),
        };
    }

    // No heading at all: the NOAA variant starts straight with <PRE>.
    if let Some(pos) = lower.find("<pre") {
        return Ok(parse_pre(&body[pos..]));
    }
    Err(unknown_layout(body))
}

#[derive(Debug, Clone, Copy)]
enum Layout {
    Table,
    Pre,
    List,
}

fn unknown_layout(body: &str) -> ListingError {
    let head: String = body.chars().take(64).collect();
    tracing::error!(
        "unknown HTML directory listing, please report its layout (starts: {head:?})"
    );
    ListingError::UnknownLayout(head)
}

/// Drop `<...>` tags, decoding nothing; listings do not escape names in
/// practice.
fn strip_tags(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_tag = false;
    for c in line.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn is_noise_entry(name: &str) -> bool {
    name.is_empty()
        || name.ends_with('/')
        || name == "Parent Directory"
        || name == ".."
        || name == "."
}

/// One `<PRE>` row: anchor text is the name, then optionally a date and a
/// size, separated by runs of spaces.
fn parse_pre_row(line: &str) -> Option<ListEntry> {
    if !line.to_ascii_lowercase().contains("<a ") && !line.contains("<A ") {
        return None;
    }
    let text = strip_tags(line);
    let text = text.trim_end();
    let name_end = text.find("  ").unwrap_or(text.len());
    let name = text[..name_end].trim().to_string();
    if is_noise_entry(&name) {
        return None;
    }
    let mut entry = ListEntry::name_only(name);

    let rest = text[name_end..].trim();
    if rest.is_empty() {
        return Some(entry);
    }
    let mut fields: Vec<&str> = rest.split("  ").map(str::trim).filter(|f| !f.is_empty()).collect();
    if let Some(first) = fields.first() {
        if let Some(mtime) = parse_listing_date(first) {
            entry.mtime = Some(mtime);
            fields.remove(0);
        }
    }
    if let Some(size_field) = fields.first() {
        if let Some(size) = parse_listing_size(size_field) {
            entry.size = Some(size.bytes);
            entry.size_exact = size.exact;
        }
    }
    Some(entry)
}

fn parse_pre(section: &str) -> Vec<ListEntry> {
    let end = section
        .to_ascii_lowercase()
        .find("</pre>")
        .unwrap_or(section.len());
    section[..end]
        .lines()
        .filter_map(parse_pre_row)
        .collect()
}

/// `<tr><td>name</td><td>date</td><td>size</td></tr>` rows.
fn parse_table(section: &str) -> Vec<ListEntry> {
    let lower = section.to_ascii_lowercase();
    let end = lower.find("</table>").unwrap_or(section.len());
    let mut entries = Vec::new();

    let mut rest = &section[..end];
    loop {
        let rest_lower = rest.to_ascii_lowercase();
        let Some(row_start) = rest_lower.find("<tr") else {
            break;
        };
        let row_end = rest_lower[row_start..]
            .find("</tr>")
            .map(|i| row_start + i)
            .unwrap_or(rest.len());
        let row = &rest[row_start..row_end];

        let cells: Vec<String> = row
            .to_ascii_lowercase()
            .match_indices("<td")
            .map(|(pos, _)| {
                let cell_end = row[pos..]
                    .to_ascii_lowercase()
                    .find("</td>")
                    .map(|i| pos + i)
                    .unwrap_or(row.len());
                strip_tags(&row[pos..cell_end]).trim().to_string()
            })
            .collect();

        if let Some(name) = cells.first() {
            if !is_noise_entry(name) {
                let mut entry = ListEntry::name_only(name.clone());
                if let Some(date_cell) = cells.get(1) {
                    entry.mtime = parse_listing_date(date_cell);
                }
                if let Some(size_cell) = cells.get(2) {
                    if let Some(size) = parse_listing_size(size_cell) {
                        entry.size = Some(size.bytes);
                        entry.size_exact = size.exact;
                    }
                }
                entries.push(entry);
            }
        }
        rest = &rest[(row_end + 1).min(rest.len())..];
    }
    entries
}

/// `<ul>` of `<li><a ...>name</a>`: names only, no date, no size.
fn parse_list(section: &str) -> Vec<ListEntry> {
    let lower = section.to_ascii_lowercase();
    let end = lower.find("</ul>").unwrap_or(section.len());
    section[..end]
        .lines()
        .filter(|line| line.to_ascii_lowercase().contains("<li"))
        .filter_map(|line| {
            let name = strip_tags(line).trim().to_string();
            if is_noise_entry(&name) {
                None
            } else {
                Some(ListEntry::name_only(name))
            }
        })
        .collect()
}

/// Atom feed: one `<entry>` per file, `<title>` as the name, `<updated>`
/// as the mtime.
fn parse_feed(body: &str) -> Result<Vec<ListEntry>, ListingError> {
    if !body.contains("<entry>") {
        tracing::error!("unknown feed type, terminating this scan");
        return Err(ListingError::UnknownFeed);
    }
    let mut entries = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find("<entry>") {
        let end = rest[start..]
            .find("</entry>")
            .map(|i| start + i)
            .unwrap_or(rest.len());
        let block = &rest[start..end];
        if let Some(name) = text_between(block, "<title>", "</title>") {
            let mut entry = ListEntry::name_only(name.trim().to_string());
            if let Some(updated) = text_between(block, "<updated>", "</updated>") {
                entry.mtime = parse_listing_date(updated.trim());
            }
            if !is_noise_entry(&entry.name) {
                entries.push(entry);
            }
        }
        rest = &rest[end..];
        match rest.find("</entry>") {
            Some(i) => rest = &rest[i + 8..],
            None => break,
        }
    }
    Ok(entries)
}

fn text_between<'a>(haystack: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = haystack.find(open)? + open.len();
    let end = haystack[start..].find(close)? + start;
    Some(&haystack[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    #[test]
    fn test_classic_apache_listing() {
        let body = "<html><head></head><body><h1>Index of /</h1><PRE><HR>\n\
            <a href=\"../\">Parent Directory</a>\n\
            <a href=\"file.dat\">file.dat</a>   01-Jan-2020 12:00   5K\n\
            <a href=\"other.txt\">other.txt</a>   02-Jan-2020 08:30   123\n\
            </PRE></body></html>";
        let entries = parse_listing(body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "file.dat");
        assert_eq!(entries[0].size, Some(5 * 1024));
        assert!(!entries[0].size_exact);
        assert_eq!(
            entries[0].mtime,
            Some(
                Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0)
                    .unwrap()
                    .timestamp()
            )
        );
        assert_eq!(entries[1].name, "other.txt");
        assert_eq!(entries[1].size, Some(123));
        assert!(entries[1].size_exact);
    }

    #[test]
    fn test_table_listing() {
        let body = "<h1>Index of /data</h1>\n<table>\n\
            <tr><th>Name</th><th>Date</th><th>Size</th></tr>\n\
            <tr><td><a href=\"a.grb\">a.grb</a></td><td>2021-05-06 07:08</td><td>2M</td></tr>\n\
            <tr><td><a href=\"sub/\">sub/</a></td><td>2021-05-06 07:08</td><td>-</td></tr>\n\
            </table>";
        let entries = parse_listing(body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.grb");
        assert_eq!(entries[0].size, Some(2 * 1024 * 1024));
        assert!(entries[0].mtime.is_some());
    }

    #[test]
    fn test_noaa_pre_without_heading() {
        let body = "<PRE><HR>\n\
            header line one\n\
            header line two\n\
            <a href=\"sn.0001.txt\">sn.0001.txt</a>\n\
            </PRE>";
        let entries = parse_listing(body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "sn.0001.txt");
        assert_eq!(entries[0].mtime, None);
        assert_eq!(entries[0].size, None);
    }

    #[test]
    fn test_ul_listing_names_only() {
        let body = "<h1>files</h1><ul>\n\
            <li><a href=\"one.bin\">one.bin</a></li>\n\
            <li><a href=\"two.bin\">two.bin</a></li>\n\
            </ul>";
        let entries = parse_listing(body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ListEntry::name_only("one.bin".into()));
    }

    #[test]
    fn test_atom_feed() {
        let body = "<?xml version=\"1.0\"?>\n<feed>\n\
            <entry><title>obs1.bufr</title><updated>2021-03-04T05:06:07+00:00</updated></entry>\n\
            <entry><title>obs2.bufr</title><updated>2021-03-04T06:06:07+00:00</updated></entry>\n\
            </feed>";
        let entries = parse_listing(body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "obs1.bufr");
        assert!(entries[0].mtime.is_some());
    }

    #[test]
    fn test_unknown_layout_reports_head() {
        match parse_listing("<html><body>nothing structured</body></html>") {
            Err(ListingError::UnknownLayout(head)) => {
                assert!(head.starts_with("<html>"));
            }
            other => panic!("expected UnknownLayout, got {other:?}"),
        }
        assert!(matches!(
            parse_listing("<?xml version=\"1.0\"?><rss></rss>"),
            Err(ListingError::UnknownFeed)
        ));
    }
}
