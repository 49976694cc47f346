// SPDX-License-Identifier: Apache-2.0

//! Text encodings a watched file may be written in.
//!
//! Record terminators are searched for in the file's own encoding, so a UTF-16 log is split on
//! the two-byte `\n` unit rather than on any 0x0A byte.

use std::str::FromStr;

use crate::receivers::logrt::error::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
    Utf16Le,
    Utf16Be,
    Utf32Le,
    Utf32Be,
}

impl Encoding {
    /// Width of one code unit in bytes. Terminators are only matched on unit boundaries.
    pub fn unit(&self) -> usize {
        match self {
            Encoding::Utf8 | Encoding::Latin1 => 1,
            Encoding::Utf16Le | Encoding::Utf16Be => 2,
            Encoding::Utf32Le | Encoding::Utf32Be => 4,
        }
    }

    fn encode_ascii(&self, c: u8) -> &'static [u8] {
        match (self, c) {
            (Encoding::Utf8 | Encoding::Latin1, b'\n') => b"\n",
            (Encoding::Utf8 | Encoding::Latin1, _) => b"\r",
            (Encoding::Utf16Le, b'\n') => b"\n\0",
            (Encoding::Utf16Le, _) => b"\r\0",
            (Encoding::Utf16Be, b'\n') => b"\0\n",
            (Encoding::Utf16Be, _) => b"\0\r",
            (Encoding::Utf32Le, b'\n') => b"\n\0\0\0",
            (Encoding::Utf32Le, _) => b"\r\0\0\0",
            (Encoding::Utf32Be, b'\n') => b"\0\0\0\n",
            (Encoding::Utf32Be, _) => b"\0\0\0\r",
        }
    }

    /// Find the first record terminator in `buf`.
    ///
    /// Returns `(content_end, record_end)`: the record's bytes are `buf[..content_end]` (with a
    /// trailing carriage return removed) and the next record starts at `record_end`.
    pub fn find_terminator(&self, buf: &[u8]) -> Option<(usize, usize)> {
        let unit = self.unit();
        let lf = self.encode_ascii(b'\n');
        let cr = self.encode_ascii(b'\r');

        let pos = if unit == 1 {
            buf.iter().position(|&b| b == b'\n')?
        } else {
            buf.chunks_exact(unit).position(|c| c == lf)? * unit
        };

        let mut content_end = pos;
        if content_end >= unit && &buf[content_end - unit..content_end] == cr {
            content_end -= unit;
        }
        Some((content_end, pos + unit))
    }

    /// Whether `buf` ends with a complete terminator unit.
    pub fn ends_with_terminator(&self, buf: &[u8]) -> bool {
        buf.ends_with(self.encode_ascii(b'\n'))
    }

    /// Round `len` down to a code unit boundary.
    pub fn align_down(&self, len: usize) -> usize {
        len - len % self.unit()
    }

    fn bom(&self) -> &'static [u8] {
        match self {
            Encoding::Utf8 => b"\xEF\xBB\xBF",
            Encoding::Latin1 => b"",
            Encoding::Utf16Le => b"\xFF\xFE",
            Encoding::Utf16Be => b"\xFE\xFF",
            Encoding::Utf32Le => b"\xFF\xFE\0\0",
            Encoding::Utf32Be => b"\0\0\xFE\xFF",
        }
    }

    /// Strip a byte order mark from the start of a file's first record.
    pub fn strip_bom<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        let bom = self.bom();
        if !bom.is_empty() && bytes.starts_with(bom) {
            &bytes[bom.len()..]
        } else {
            bytes
        }
    }

    /// Decode record bytes into text, replacing invalid sequences.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Encoding::Utf16Le | Encoding::Utf16Be => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| match self {
                        Encoding::Utf16Le => u16::from_le_bytes([c[0], c[1]]),
                        _ => u16::from_be_bytes([c[0], c[1]]),
                    })
                    .collect();
                String::from_utf16_lossy(&units)
            }
            Encoding::Utf32Le | Encoding::Utf32Be => bytes
                .chunks_exact(4)
                .map(|c| {
                    let raw = match self {
                        Encoding::Utf32Le => u32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                        _ => u32::from_be_bytes([c[0], c[1], c[2], c[3]]),
                    };
                    char::from_u32(raw).unwrap_or(char::REPLACEMENT_CHARACTER)
                })
                .collect(),
        }
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('_', "-").as_str() {
            "" | "UTF-8" | "UTF8" => Ok(Encoding::Utf8),
            "ISO-8859-1" | "LATIN1" | "LATIN-1" => Ok(Encoding::Latin1),
            "UTF-16LE" | "UCS-2LE" => Ok(Encoding::Utf16Le),
            "UTF-16" | "UTF-16BE" | "UCS-2BE" => Ok(Encoding::Utf16Be),
            "UTF-32LE" => Ok(Encoding::Utf32Le),
            "UTF-32" | "UTF-32BE" => Ok(Encoding::Utf32Be),
            other => Err(Error::Config(format!("unsupported encoding: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_terminator_utf8() {
        let enc = Encoding::Utf8;
        assert_eq!(enc.find_terminator(b"abc\ndef"), Some((3, 4)));
        assert_eq!(enc.find_terminator(b"abc\r\ndef"), Some((3, 5)));
        assert_eq!(enc.find_terminator(b"\n"), Some((0, 1)));
        assert_eq!(enc.find_terminator(b"abc"), None);
    }

    #[test]
    fn test_find_terminator_utf16le_respects_alignment() {
        let enc = Encoding::Utf16Le;
        // U+0A41 encodes as 0x41 0x0A and must not be taken for a newline
        let buf = [0x41, 0x0A, b'b', 0, b'\n', 0, b'c', 0];
        assert_eq!(enc.find_terminator(&buf), Some((4, 6)));
        assert_eq!(enc.decode(&buf[..4]), "\u{0A41}b");
    }

    #[test]
    fn test_find_terminator_utf16be_crlf() {
        let enc = Encoding::Utf16Be;
        let buf = [0, b'x', 0, b'\r', 0, b'\n'];
        assert_eq!(enc.find_terminator(&buf), Some((2, 6)));
    }

    #[test]
    fn test_decode_latin1_and_utf32() {
        assert_eq!(Encoding::Latin1.decode(&[0x63, 0x61, 0x66, 0xE9]), "café");
        assert_eq!(Encoding::Utf32Be.decode(&[0, 0, 0, b'o', 0, 0, 0, b'k']), "ok");
    }

    #[test]
    fn test_strip_bom() {
        assert_eq!(Encoding::Utf8.strip_bom(b"\xEF\xBB\xBFhi"), b"hi");
        assert_eq!(Encoding::Utf8.strip_bom(b"hi"), b"hi");
        assert_eq!(Encoding::Utf16Le.strip_bom(b"\xFF\xFEh\0"), b"h\0");
    }

    #[test]
    fn test_align_down() {
        assert_eq!(Encoding::Utf8.align_down(7), 7);
        assert_eq!(Encoding::Utf16Le.align_down(7), 6);
        assert_eq!(Encoding::Utf32Be.align_down(7), 4);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!("utf-16le".parse::<Encoding>().unwrap(), Encoding::Utf16Le);
        assert_eq!("ISO_8859-1".parse::<Encoding>().unwrap(), Encoding::Latin1);
        assert!("EBCDIC".parse::<Encoding>().is_err());
    }
}
