// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Bulletin containers: splitting a file into its bulletins and the
//! inverse, assembling many bulletins into one container file.

use crate::wmo::{END_FRAME, ETX, SOH, START_FRAME};
use crate::ConvertError;

/// Length-indicator formats understood by `extract`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractKind {
    /// Two byte length indicator, low byte first.
    Vax,
    /// Four byte length indicator, low byte first.
    Lbf,
    /// Four byte length indicator, high byte first.
    Hbf,
    /// Binary GRIB/BUFR/BLOK container.
    Mrz,
    /// Four byte length indicator as used by the MSS.
    Mss,
    /// 8 ASCII digits plus 2 digit type indicator.
    WmoStandard,
    /// Binary GRIB container.
    Grib,
    /// `SOH … ETX` delimited ASCII bulletins.
    Ascii,
    /// `ZCZC … NNNN` delimited bulletins.
    Zczc,
}

impl ExtractKind {
    /// An empty id stays the binary MRZ container, which is what ancient
    /// configurations relied on.
    pub fn parse(id: &str) -> Option<ExtractKind> {
        Some(match id {
            "VAX" => ExtractKind::Vax,
            "LBF" => ExtractKind::Lbf,
            "HBF" => ExtractKind::Hbf,
            "MRZ" | "" => ExtractKind::Mrz,
            "MSS" => ExtractKind::Mss,
            "WMO" => ExtractKind::WmoStandard,
            "GRIB" => ExtractKind::Grib,
            "ASCII" => ExtractKind::Ascii,
            "ZCZC" => ExtractKind::Zczc,
            _ => return None,
        })
    }
}

/// Container formats understood by `assemble`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssembleKind {
    Vax,
    Lbf,
    Hbf,
    /// Four byte length indicator repeated after the bulletin.
    Dwd,
    WmoStandard,
    /// `SOH CR CR LF … CR CR LF ETX` concatenation.
    Ascii,
    Mss,
}

impl AssembleKind {
    pub fn parse(id: &str) -> Option<AssembleKind> {
        Some(match id {
            "VAX" => AssembleKind::Vax,
            "LBF" => AssembleKind::Lbf,
            "HBF" => AssembleKind::Hbf,
            "DWD" => AssembleKind::Dwd,
            "WMO" => AssembleKind::WmoStandard,
            "ASCII" => AssembleKind::Ascii,
            "MSS" => AssembleKind::Mss,
            _ => return None,
        })
    }
}

/// Split a container into its bulletins.
pub fn extract(src: &[u8], kind: ExtractKind) -> Result<Vec<Vec<u8>>, ConvertError> {
    match kind {
        ExtractKind::Vax => split_length_prefixed(src, 2, false),
        ExtractKind::Lbf => split_length_prefixed(src, 4, false),
        ExtractKind::Hbf | ExtractKind::Mss => split_length_prefixed(src, 4, true),
        ExtractKind::WmoStandard => split_wmo_standard(src),
        ExtractKind::Mrz | ExtractKind::Grib => split_binary(src),
        ExtractKind::Ascii => Ok(split_sohetx(src)),
        ExtractKind::Zczc => Ok(split_zczc(src)),
    }
}

/// Concatenate bulletins into one container.
pub fn assemble(bulletins: &[Vec<u8>], kind: AssembleKind) -> Vec<u8> {
    let total: usize = bulletins.iter().map(|b| b.len() + 16).sum();
    let mut out = Vec::with_capacity(total);
    for bulletin in bulletins {
        match kind {
            AssembleKind::Vax => {
                out.extend_from_slice(&(bulletin.len() as u16).to_le_bytes());
                out.extend_from_slice(bulletin);
            }
            AssembleKind::Lbf => {
                out.extend_from_slice(&(bulletin.len() as u32).to_le_bytes());
                out.extend_from_slice(bulletin);
            }
            AssembleKind::Hbf | AssembleKind::Mss => {
                out.extend_from_slice(&(bulletin.len() as u32).to_be_bytes());
                out.extend_from_slice(bulletin);
            }
            AssembleKind::Dwd => {
                out.extend_from_slice(&(bulletin.len() as u32).to_be_bytes());
                out.extend_from_slice(bulletin);
                out.extend_from_slice(&(bulletin.len() as u32).to_be_bytes());
            }
            AssembleKind::WmoStandard => {
                out.extend_from_slice(format!("{:08}", bulletin.len()).as_bytes());
                out.extend_from_slice(b"01");
                out.extend_from_slice(bulletin);
            }
            AssembleKind::Ascii => {
                out.extend_from_slice(&START_FRAME);
                out.extend_from_slice(bulletin);
                out.extend_from_slice(&END_FRAME);
            }
        }
    }
    out
}

/// Re-emit every GRIB/BUFR/BLOK segment of a binary container as a framed
/// WMO message.
pub fn mrz2wmo(src: &[u8]) -> Result<Vec<u8>, ConvertError> {
    let segments = split_binary(src)?;
    if segments.is_empty() {
        return Err(ConvertError::NoData);
    }
    let mut out = Vec::with_capacity(src.len() + segments.len() * 18);
    for segment in &segments {
        out.extend_from_slice(format!("{:08}", segment.len() + 8).as_bytes());
        out.extend_from_slice(b"00");
        out.extend_from_slice(&START_FRAME);
        out.extend_from_slice(segment);
        out.extend_from_slice(&END_FRAME);
    }
    Ok(out)
}

fn split_length_prefixed(
    src: &[u8],
    width: usize,
    big_endian: bool,
) -> Result<Vec<Vec<u8>>, ConvertError> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + width <= src.len() {
        let mut length = 0usize;
        if big_endian {
            for &b in &src[pos..pos + width] {
                length = (length << 8) | b as usize;
            }
        } else {
            for &b in src[pos..pos + width].iter().rev() {
                length = (length << 8) | b as usize;
            }
        }
        pos += width;
        if length == 0 {
            continue;
        }
        if pos + length > src.len() {
            return Err(ConvertError::Corrupt("length indicator past end of file"));
        }
        out.push(src[pos..pos + length].to_vec());
        pos += length;
    }
    if pos != src.len() && !src.is_empty() {
        return Err(ConvertError::Corrupt("trailing bytes after last bulletin"));
    }
    Ok(out)
}

fn split_wmo_standard(src: &[u8]) -> Result<Vec<Vec<u8>>, ConvertError> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 10 <= src.len() {
        let header = &src[pos..pos + 10];
        if !header.iter().all(u8::is_ascii_digit) {
            return Err(ConvertError::Corrupt("bad WMO length indicator"));
        }
        let length: usize = std::str::from_utf8(&header[..8])
            .expect("ascii digits")
            .parse()
            .map_err(|_| ConvertError::Corrupt("bad WMO length indicator"))?;
        pos += 10;
        if pos + length > src.len() {
            return Err(ConvertError::Corrupt("WMO length past end of file"));
        }
        out.push(src[pos..pos + length].to_vec());
        pos += length;
    }
    if pos != src.len() {
        return Err(ConvertError::Corrupt("trailing bytes after last bulletin"));
    }
    Ok(out)
}

const BINARY_MAGICS: [&[u8; 4]; 3] = [b"GRIB", b"BUFR", b"BLOK"];

/// GRIB-style segments: 4 byte magic, then a 3 byte big-endian total
/// length covering the whole segment including the magic.
fn split_binary(src: &[u8]) -> Result<Vec<Vec<u8>>, ConvertError> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 7 <= src.len() {
        let window = &src[pos..pos + 4];
        if !BINARY_MAGICS.iter().any(|magic| window == magic.as_slice()) {
            pos += 1;
            continue;
        }
        let length =
            ((src[pos + 4] as usize) << 16) | ((src[pos + 5] as usize) << 8) | src[pos + 6] as usize;
        if length < 7 || pos + length > src.len() {
            return Err(ConvertError::Corrupt("bad binary segment length"));
        }
        out.push(src[pos..pos + length].to_vec());
        pos += length;
    }
    Ok(out)
}

fn split_sohetx(src: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < src.len() {
        let Some(start) = src[pos..].iter().position(|&b| b == SOH).map(|i| pos + i) else {
            break;
        };
        let Some(end) = src[start..].iter().position(|&b| b == ETX).map(|i| start + i) else {
            break;
        };
        out.push(src[start..=end].to_vec());
        pos = end + 1;
    }
    out
}

fn split_zczc(src: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= src.len() {
        let Some(start) = find(src, pos, b"ZCZC") else {
            break;
        };
        let Some(end) = find(src, start + 4, b"NNNN") else {
            break;
        };
        out.push(src[start..end + 4].to_vec());
        pos = end + 4;
    }
    out
}

fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| from + i)
}

/// Derive a file name for one extracted bulletin: the heading characters
/// with anything shell-hostile replaced, suffixed by the bulletin index.
pub fn bulletin_name(bulletin: &[u8], index: usize) -> String {
    let mut name = String::with_capacity(24);
    for &byte in bulletin
        .iter()
        .skip_while(|&&b| !b.is_ascii_alphanumeric())
        .take(18)
    {
        if byte.is_ascii_alphanumeric() {
            name.push(byte as char);
        } else if !name.ends_with('_') {
            name.push('_');
        }
    }
    let name = name.trim_matches('_');
    if name.is_empty() {
        format!("bulletin-{index:04}")
    } else {
        format!("{name}-{index:04}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_kind_parse_empty_is_mrz() {
        assert_eq!(ExtractKind::parse(""), Some(ExtractKind::Mrz));
        assert_eq!(ExtractKind::parse("WMO"), Some(ExtractKind::WmoStandard));
        assert_eq!(ExtractKind::parse("XXX"), None);
    }

    #[test]
    fn test_vax_round_trip() {
        let bulletins = vec![b"FIRST".to_vec(), b"SECOND ONE".to_vec()];
        let container = assemble(&bulletins, AssembleKind::Vax);
        assert_eq!(extract(&container, ExtractKind::Vax).unwrap(), bulletins);
    }

    #[test]
    fn test_hbf_and_lbf_disagree_on_byte_order() {
        let bulletins = vec![b"DATA".to_vec()];
        let hbf = assemble(&bulletins, AssembleKind::Hbf);
        let lbf = assemble(&bulletins, AssembleKind::Lbf);
        assert_eq!(&hbf[..4], &[0, 0, 0, 4]);
        assert_eq!(&lbf[..4], &[4, 0, 0, 0]);
        assert_eq!(extract(&hbf, ExtractKind::Hbf).unwrap(), bulletins);
        assert_eq!(extract(&lbf, ExtractKind::Lbf).unwrap(), bulletins);
    }

    #[test]
    fn test_wmo_standard_round_trip() {
        let bulletins = vec![b"TTAA01 EGRR".to_vec(), b"X".to_vec()];
        let container = assemble(&bulletins, AssembleKind::WmoStandard);
        assert_eq!(
            extract(&container, ExtractKind::WmoStandard).unwrap(),
            bulletins
        );
    }

    #[test]
    fn test_wmo_standard_rejects_corrupt_length() {
        let container = b"0000009901SHORT".to_vec();
        assert!(matches!(
            extract(&container, ExtractKind::WmoStandard),
            Err(ConvertError::Corrupt(_))
        ));
    }

    #[test]
    fn test_dwd_repeats_length() {
        let container = assemble(&[b"AB".to_vec()], AssembleKind::Dwd);
        assert_eq!(container, [0, 0, 0, 2, b'A', b'B', 0, 0, 0, 2]);
    }

    #[test]
    fn test_ascii_assemble_frames_each_bulletin() {
        let container = assemble(&[b"ONE".to_vec()], AssembleKind::Ascii);
        assert_eq!(container[0], SOH);
        assert_eq!(*container.last().unwrap(), ETX);
        // The framed form splits back out, frame included.
        let extracted = extract(&container, ExtractKind::Ascii).unwrap();
        assert_eq!(extracted.len(), 1);
        assert_eq!(extracted[0], container);
    }

    #[test]
    fn test_binary_split_finds_grib_segments() {
        let mut container = Vec::new();
        container.extend_from_slice(b"junk");
        let payload = b"GRIB\x00\x00\x0csssss"; // 12 byte segment
        container.extend_from_slice(payload);
        container.extend_from_slice(b"tail");
        let segments = split_binary(&container).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0], payload);
    }

    #[test]
    fn test_mrz2wmo_frames_each_segment() {
        let mut container = Vec::new();
        container.extend_from_slice(b"BUFR\x00\x00\x0axxx");
        let out = mrz2wmo(&container).unwrap();
        assert_eq!(&out[..8], b"00000018"); // 10 byte segment + 8 framing
        assert_eq!(&out[8..10], b"00");
        assert_eq!(out[10], SOH);
        assert_eq!(*out.last().unwrap(), ETX);
    }

    #[test]
    fn test_mrz2wmo_without_segments_is_no_data() {
        assert!(matches!(
            mrz2wmo(b"nothing in here"),
            Err(ConvertError::NoData)
        ));
    }

    #[test]
    fn test_zczc_split() {
        let container = b"ZCZC AAA NNNN garbage ZCZC BBB NNNN";
        let bulletins = split_zczc(container);
        assert_eq!(bulletins.len(), 2);
        assert_eq!(bulletins[0], b"ZCZC AAA NNNN");
        assert_eq!(bulletins[1], b"ZCZC BBB NNNN");
    }

    #[test]
    fn test_bulletin_name_sanitizes() {
        let name = bulletin_name(b"TTAA01 EGRR 121200\r\r\nbody", 3);
        assert_eq!(name, "TTAA01_EGRR_121200-0003");
        assert_eq!(bulletin_name(b"\x01\x02\x03", 0), "bulletin-0000");
    }
}
