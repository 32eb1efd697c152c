// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Format conversions between byte-stream encodings.
//!
//! All transforms are pure `&[u8] -> Vec<u8>` functions; the [`convert`]
//! wrapper applies one to a file by writing a sibling temp file and
//! atomically renaming it over the original, so a failed conversion never
//! damages the input.

pub mod bulletin;
pub mod formats;
pub mod iso8859;
pub mod stream;
pub mod wmo;

use std::io::Write;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("no data converted")]
    NoData,
    #[error("corrupt input: {0}")]
    Corrupt(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The conversions selectable from a handling option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    Sohetx,
    Wmo,
    SohetxWmo,
    Sohetx2Wmo0,
    Sohetx2Wmo1,
    Mrz2Wmo,
    Unix2Dos,
    Dos2Unix,
    Lf2CrCrLf,
    CrCrLf2Lf,
    Iso8859ToAscii,
}

impl Conversion {
    pub fn parse(id: &str) -> Option<Conversion> {
        Some(match id {
            "sohetx" => Conversion::Sohetx,
            "wmo" => Conversion::Wmo,
            "sohetxwmo" => Conversion::SohetxWmo,
            "sohetx2wmo0" => Conversion::Sohetx2Wmo0,
            "sohetx2wmo1" => Conversion::Sohetx2Wmo1,
            "mrz2wmo" => Conversion::Mrz2Wmo,
            "unix2dos" => Conversion::Unix2Dos,
            "dos2unix" => Conversion::Dos2Unix,
            "lf2crcrlf" => Conversion::Lf2CrCrLf,
            "crcrlf2lf" => Conversion::CrCrLf2Lf,
            "iso8859_2ascii" => Conversion::Iso8859ToAscii,
            _ => return None,
        })
    }

    /// Apply the transform to a byte slice.
    pub fn apply(self, src: &[u8]) -> Result<Vec<u8>, ConvertError> {
        Ok(match self {
            Conversion::Sohetx => wmo::sohetx(src),
            Conversion::Wmo => wmo::wmo(src),
            Conversion::SohetxWmo => wmo::sohetxwmo(src),
            Conversion::Sohetx2Wmo0 => wmo::sohetx2wmo(src, true),
            Conversion::Sohetx2Wmo1 => wmo::sohetx2wmo(src, false),
            Conversion::Mrz2Wmo => bulletin::mrz2wmo(src)?,
            Conversion::Unix2Dos => stream::unix2dos(src),
            Conversion::Dos2Unix => stream::dos2unix(src),
            Conversion::Lf2CrCrLf => stream::lf2crcrlf(src),
            Conversion::CrCrLf2Lf => stream::crcrlf2lf(src),
            Conversion::Iso8859ToAscii => iso8859::to_ascii(src),
        })
    }
}

/// Convert `file_name` inside `dir` in place. Returns the new length.
///
/// The output goes to `<name>.tmpnewname` first and replaces the original
/// only after a complete write, so the original survives any failure.
pub fn convert(dir: &Path, file_name: &str, conversion: Conversion) -> Result<u64, ConvertError> {
    let src_path = dir.join(file_name);
    let tmp_path = dir.join(format!("{file_name}.tmpnewname"));

    let src = std::fs::read(&src_path)?;
    let out = match conversion.apply(&src) {
        Ok(out) => out,
        Err(err) => {
            tracing::warn!("unable to convert {file_name}: {err}");
            return Err(err);
        }
    };
    if out.is_empty() && !src.is_empty() {
        tracing::warn!("no data converted in {file_name} ({} bytes)", src.len());
    }

    let mut tmp = std::fs::File::create(&tmp_path)?;
    if let Err(err) = tmp.write_all(&out).and_then(|()| tmp.flush()) {
        drop(tmp);
        _ = std::fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    drop(tmp);
    std::fs::rename(&tmp_path, &src_path)?;
    Ok(out.len() as u64)
}
