// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! WMO message framing.
//!
//! A framed message is `SOH CR CR LF … CR CR LF ETX`; the wire header is
//! 8 ASCII digits of the length that follows plus a 2-digit type
//! indicator.

pub const SOH: u8 = 1;
pub const ETX: u8 = 3;
const CR: u8 = 13;
const LF: u8 = 10;

pub const START_FRAME: [u8; 4] = [SOH, CR, CR, LF];
pub const END_FRAME: [u8; 4] = [CR, CR, LF, ETX];

/// Write the 10-byte header: 8 length digits plus the type indicator.
fn push_header(out: &mut Vec<u8>, length: usize, type_indicator: &[u8; 2]) {
    out.extend_from_slice(format!("{length:08}").as_bytes());
    out.extend_from_slice(type_indicator);
}

fn has_start_frame(src: &[u8]) -> bool {
    src.len() >= 4 && src[..4] == START_FRAME
}

fn has_end_frame(src: &[u8]) -> bool {
    src.len() >= 4 && src[src.len() - 4..] == END_FRAME
}

/// Wrap with the SOH/ETX sentinels unless they are already there.
/// Applying it twice equals applying it once.
pub fn sohetx(src: &[u8]) -> Vec<u8> {
    if src.first() == Some(&SOH) && src.last() == Some(&ETX) {
        return src.to_vec();
    }
    let mut out = Vec::with_capacity(src.len() + 8);
    out.extend_from_slice(&START_FRAME);
    out.extend_from_slice(src);
    out.extend_from_slice(&END_FRAME);
    out
}

/// Prepend the 10-byte header, stripping an outer SOH/ETX frame first if
/// both halves are present.
pub fn wmo(src: &[u8]) -> Vec<u8> {
    let inner = if src.len() >= 8 && has_start_frame(src) && has_end_frame(src) {
        &src[4..src.len() - 4]
    } else {
        src
    };
    let mut out = Vec::with_capacity(inner.len() + 10);
    push_header(&mut out, inner.len(), b"01");
    out.extend_from_slice(inner);
    out
}

/// True when `src` starts with 8 digits, a 2-digit type indicator, and the
/// digits spell exactly the number of bytes that follow the header.
fn has_valid_wmo_header(src: &[u8]) -> bool {
    if src.len() < 10 || !src[..10].iter().all(u8::is_ascii_digit) {
        return false;
    }
    let digits = std::str::from_utf8(&src[..8]).expect("ascii digits");
    match digits.parse::<usize>() {
        Ok(length) => src.len() == length + 10,
        Err(_) => false,
    }
}

/// How many bytes of partial start framing to strip: the SOH plus any
/// CR/LF run that follows it.
fn start_frame_len(src: &[u8]) -> usize {
    if src.first() != Some(&SOH) {
        return 0;
    }
    let mut len = 1;
    while len < src.len() && len < 4 && (src[len] == CR || src[len] == LF) {
        let done = src[len] == LF;
        len += 1;
        if done {
            break;
        }
    }
    len
}

/// How many bytes of partial end framing precede the ETX (LF, CR LF or
/// CR CR LF), not counting the ETX itself.
fn end_frame_len(body: &[u8]) -> usize {
    if body.last() == Some(&LF) {
        let mut len = 1;
        while len < 3 && body.len() > len && body[body.len() - 1 - len] == CR {
            len += 1;
        }
        len
    } else {
        0
    }
}

/// Add the WMO header and ensure SOH/ETX framing, without double-wrapping
/// an input that is already framed or already carries a valid header.
pub fn sohetxwmo(src: &[u8]) -> Vec<u8> {
    // An input with a valid header and framed payload passes through.
    if has_valid_wmo_header(src) && src.get(10) == Some(&SOH) && src.last() == Some(&ETX) {
        return src.to_vec();
    }

    // Strip whatever partial framing is present, then re-frame cleanly.
    let body = &src[start_frame_len(src)..];
    let body = if body.last() == Some(&ETX) {
        let trailer = end_frame_len(&body[..body.len() - 1]) + 1;
        &body[..body.len() - trailer]
    } else {
        body
    };

    let mut out = Vec::with_capacity(body.len() + 18);
    push_header(&mut out, body.len() + 8, b"00");
    out.extend_from_slice(&START_FRAME);
    out.extend_from_slice(body);
    out.extend_from_slice(&END_FRAME);
    out
}

/// Split an input holding many `SOH…ETX` bulletins into framed WMO
/// messages. With `keep_frame` each message is header + `SOH CR CR LF` +
/// body + `CR CR LF ETX` (type indicator `00`); without, header + bare
/// body (type indicator `01`).
pub fn sohetx2wmo(src: &[u8], keep_frame: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + 64);
    let mut pos = 0usize;

    while pos < src.len() {
        // A bulletin start is an SOH with an LF within the next three
        // bytes.
        let Some(start) = find_soh(src, pos) else {
            break;
        };
        let body_start = start + start_frame_len(&src[start..]);

        // A bulletin end is an ETX directly preceded by an LF.
        let Some(etx) = find_etx(src, body_start) else {
            break;
        };
        let body_end = etx - end_frame_len(&src[body_start..etx]);
        let body = &src[body_start..body_end];

        if keep_frame {
            push_header(&mut out, body.len() + 8, b"00");
            out.extend_from_slice(&START_FRAME);
            out.extend_from_slice(body);
            out.extend_from_slice(&END_FRAME);
        } else {
            push_header(&mut out, body.len(), b"01");
            out.extend_from_slice(body);
        }
        pos = etx + 1;
    }
    out
}

fn find_soh(src: &[u8], from: usize) -> Option<usize> {
    let mut pos = from;
    while pos < src.len() {
        if src[pos] == SOH
            && pos + 3 < src.len()
            && (src[pos + 1] == LF || src[pos + 2] == LF || src[pos + 3] == LF)
        {
            return Some(pos);
        }
        pos += 1;
    }
    None
}

fn find_etx(src: &[u8], from: usize) -> Option<usize> {
    let mut pos = from;
    while pos < src.len() {
        if src[pos] == ETX && pos > from && src[pos - 1] == LF {
            return Some(pos);
        }
        pos += 1;
    }
    None
}
