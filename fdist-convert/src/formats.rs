// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! File-format conversions between GTS bulletins and their carrier
//! formats. Corrupt inputs are reported so the caller can remove them.

use crate::bulletin;
use crate::stream;
use crate::wmo::{self, ETX, SOH};
use crate::ConvertError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Tiff2Gts,
    Gts2Tiff,
    Fax2Gts,
    Wmo2Ascii,
    Afw2Wmo,
    Grib2Wmo,
}

pub fn apply(src: &[u8], kind: FormatKind) -> Result<Vec<u8>, ConvertError> {
    match kind {
        FormatKind::Tiff2Gts => tiff2gts(src),
        FormatKind::Gts2Tiff => gts2tiff(src),
        FormatKind::Fax2Gts => fax2gts(src),
        FormatKind::Wmo2Ascii => wmo2ascii(src),
        FormatKind::Afw2Wmo => Ok(wmo::sohetxwmo(src)),
        FormatKind::Grib2Wmo => bulletin::mrz2wmo(src),
    }
}

fn is_tiff(src: &[u8]) -> bool {
    src.len() >= 8 && (src.starts_with(b"II*\0") || src.starts_with(b"MM\0*"))
}

/// Pull the GTS bulletin (`SOH … ETX`) out of a TIFF fax file.
fn tiff2gts(src: &[u8]) -> Result<Vec<u8>, ConvertError> {
    if !is_tiff(src) {
        return Err(ConvertError::Corrupt("not a TIFF file"));
    }
    let start = src
        .iter()
        .position(|&b| b == SOH)
        .ok_or(ConvertError::Corrupt("no bulletin start in TIFF file"))?;
    let end = src[start..]
        .iter()
        .position(|&b| b == ETX)
        .map(|i| start + i)
        .ok_or(ConvertError::Corrupt("no bulletin end in TIFF file"))?;
    Ok(src[start..=end].to_vec())
}

/// Wrap a GTS bulletin in a minimal single-strip TIFF envelope: the
/// little-endian header, the raw bulletin as strip data, then an IFD
/// carrying only the strip location.
fn gts2tiff(src: &[u8]) -> Result<Vec<u8>, ConvertError> {
    if src.first() != Some(&SOH) || src.last() != Some(&ETX) {
        return Err(ConvertError::Corrupt("input carries no SOH/ETX bulletin"));
    }
    let mut out = Vec::with_capacity(src.len() + 64);
    out.extend_from_slice(b"II*\0");
    let ifd_offset = (8 + src.len()) as u32;
    out.extend_from_slice(&ifd_offset.to_le_bytes());
    out.extend_from_slice(src);

    out.extend_from_slice(&2u16.to_le_bytes()); // entry count
    let mut entry = |tag: u16, value: u32| {
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes()); // LONG
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    };
    entry(0x0111, 8); // StripOffsets
    entry(0x0117, src.len() as u32); // StripByteCounts
    out.extend_from_slice(&0u32.to_le_bytes()); // next IFD
    Ok(out)
}

/// Prefix a raw T.4 fax page with GTS framing.
fn fax2gts(src: &[u8]) -> Result<Vec<u8>, ConvertError> {
    if src.is_empty() {
        return Err(ConvertError::NoData);
    }
    Ok(wmo::sohetx(src))
}

/// Strip the WMO length indicators and framing, normalising line endings.
fn wmo2ascii(src: &[u8]) -> Result<Vec<u8>, ConvertError> {
    let bulletins = bulletin::extract(src, bulletin::ExtractKind::WmoStandard)?;
    if bulletins.is_empty() {
        return Err(ConvertError::NoData);
    }
    let mut out = Vec::with_capacity(src.len());
    for body in &bulletins {
        let body = strip_frame(body);
        out.extend_from_slice(&stream::crcrlf2lf(body));
    }
    Ok(out)
}

fn strip_frame(body: &[u8]) -> &[u8] {
    let body = match body.first() {
        Some(&SOH) => {
            let skip = body[1..]
                .iter()
                .take_while(|&&b| b == 13 || b == 10)
                .count();
            &body[1 + skip..]
        }
        _ => body,
    };
    match body.last() {
        Some(&ETX) => {
            let keep = body.len()
                - 1
                - body[..body.len() - 1]
                    .iter()
                    .rev()
                    .take_while(|&&b| b == 13 || b == 10)
                    .count();
            &body[..keep]
        }
        _ => body,
    }
}
