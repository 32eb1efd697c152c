// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! Line-ending conversions.

const CR: u8 = 13;
const LF: u8 = 10;

/// Every LF not already preceded by CR gains one.
pub fn unix2dos(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + src.len() / 16);
    let mut prev = 0u8;
    for &byte in src {
        if byte == LF && prev != CR {
            out.push(CR);
        }
        out.push(byte);
        prev = byte;
    }
    out
}

/// Every CR LF collapses to LF; a lone CR passes through.
pub fn dos2unix(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut pending_cr = false;
    for &byte in src {
        match byte {
            LF => {
                // CR LF or bare LF, either way a single LF comes out.
                pending_cr = false;
                out.push(LF);
            }
            CR => {
                if pending_cr {
                    out.push(CR);
                }
                pending_cr = true;
            }
            _ => {
                if pending_cr {
                    out.push(CR);
                    pending_cr = false;
                }
                out.push(byte);
            }
        }
    }
    if pending_cr {
        out.push(CR);
    }
    out
}

/// Every LF becomes part of a CR CR LF: bare LF gains two CRs, CR LF gains
/// one, CR CR LF passes through.
pub fn lf2crcrlf(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + src.len() / 8);
    let mut prev = 0u8;
    let mut prev_prev = 0u8;
    for &byte in src {
        if byte == LF && prev != CR && prev_prev != CR {
            out.push(CR);
            out.push(CR);
        } else if byte == LF && prev == CR && prev_prev != CR {
            out.push(CR);
        }
        out.push(byte);
        prev_prev = prev;
        prev = byte;
    }
    out
}

/// Every CR CR LF collapses to LF; other CR runs pass through.
pub fn crcrlf2lf(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut pending_crs = 0usize;
    for &byte in src {
        match byte {
            LF => {
                if pending_crs == 2 {
                    out.push(LF);
                } else {
                    for _ in 0..pending_crs {
                        out.push(CR);
                    }
                    out.push(LF);
                }
                pending_crs = 0;
            }
            CR => {
                if pending_crs == 2 {
                    // A run longer than two: the oldest CR can never be
                    // part of a CR CR LF anymore.
                    out.push(CR);
                } else {
                    pending_crs += 1;
                }
            }
            _ => {
                for _ in 0..pending_crs {
                    out.push(CR);
                }
                pending_crs = 0;
                out.push(byte);
            }
        }
    }
    for _ in 0..pending_crs {
        out.push(CR);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix2dos() {
        assert_eq!(unix2dos(b"a\nb\n"), b"a\r\nb\r\n");
        assert_eq!(unix2dos(b"a\r\nb"), b"a\r\nb");
        assert_eq!(unix2dos(b""), b"");
    }

    #[test]
    fn test_dos2unix() {
        assert_eq!(dos2unix(b"a\r\nb\r\n"), b"a\nb\n");
        assert_eq!(dos2unix(b"a\nb"), b"a\nb");
        // Lone CR passes through, trailing CR included.
        assert_eq!(dos2unix(b"a\rb"), b"a\rb");
        assert_eq!(dos2unix(b"a\r"), b"a\r");
        assert_eq!(dos2unix(b""), b"");
    }

    #[test]
    fn test_unix2dos_dos2unix_round_trip() {
        for input in [
            b"".as_slice(),
            b"plain text, no endings",
            b"one\ntwo\nthree\n",
            b"mixed\r\nand\nbare\n",
        ] {
            assert_eq!(dos2unix(&unix2dos(input)), dos2unix(input));
        }
        // Pure unix input survives exactly.
        let unix = b"one\ntwo\n";
        assert_eq!(dos2unix(&unix2dos(unix)), unix);
    }

    #[test]
    fn test_lf2crcrlf() {
        assert_eq!(lf2crcrlf(b"a\n"), b"a\r\r\n");
        assert_eq!(lf2crcrlf(b"a\r\n"), b"a\r\r\n");
        assert_eq!(lf2crcrlf(b"a\r\r\n"), b"a\r\r\n");
        assert_eq!(lf2crcrlf(b""), b"");
    }

    #[test]
    fn test_crcrlf2lf() {
        assert_eq!(crcrlf2lf(b"a\r\r\n"), b"a\n");
        // CR LF is not CR CR LF; it passes through.
        assert_eq!(crcrlf2lf(b"a\r\nb"), b"a\r\nb");
        // CR runs without LF pass through.
        assert_eq!(crcrlf2lf(b"a\r\rb"), b"a\r\rb");
        assert_eq!(crcrlf2lf(b"a\r"), b"a\r");
        assert_eq!(crcrlf2lf(b""), b"");
    }

    #[test]
    fn test_lf2crcrlf_crcrlf2lf_round_trip() {
        for input in [
            b"".as_slice(),
            b"one\ntwo\n",
            b"bulletin body\nwith lines\n",
        ] {
            assert_eq!(crcrlf2lf(&lf2crcrlf(input)), input);
        }
    }
}
