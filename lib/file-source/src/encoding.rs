use std::borrow::Cow;

use bytes::Bytes;
use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};

const BOM_UTF8: &str = "\u{feff}";

/// Decodes the raw bytes of a record into UTF-8.
///
/// Resolved once from the configured encoding name, see [`Decoder::for_label`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decoder {
    /// Pass bytes through untouched.
    Nop,
    Text(&'static Encoding),
}

/// The outcome of decoding a single record.
#[derive(Debug)]
pub struct Decoded {
    pub body: Bytes,
    /// Malformed sequences were replaced with U+FFFD.
    pub had_errors: bool,
    pub bom_removed: bool,
}

impl Decoder {
    /// Resolve an encoding name, case-insensitively.
    ///
    /// Besides `nop` and a handful of common aliases, every label from the
    /// [Encoding Standard](https://encoding.spec.whatwg.org/#names-and-labels)
    /// is accepted. Returns `None` for anything unknown.
    pub fn for_label(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase();
        match label.as_str() {
            "nop" => Some(Decoder::Nop),
            "" | "utf-8" | "utf8" | "ascii" | "us-ascii" => Some(Decoder::Text(UTF_8)),
            "utf-16" | "utf16" => Some(Decoder::Text(UTF_16LE)),
            other => Encoding::for_label_no_replacement(other.as_bytes()).map(Decoder::Text),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Decoder::Nop => "nop",
            Decoder::Text(encoding) => encoding.name(),
        }
    }

    /// The newline byte sequence in this encoding.
    pub fn newline(&self) -> &'static [u8] {
        match self {
            Decoder::Text(encoding) if *encoding == UTF_16LE => b"\n\x00",
            Decoder::Text(encoding) if *encoding == UTF_16BE => b"\x00\n",
            _ => b"\n",
        }
    }

    /// The carriage return byte sequence in this encoding.
    pub fn carriage_return(&self) -> &'static [u8] {
        match self {
            Decoder::Text(encoding) if *encoding == UTF_16LE => b"\r\x00",
            Decoder::Text(encoding) if *encoding == UTF_16BE => b"\x00\r",
            _ => b"\r",
        }
    }

    /// Decode `raw`. Never fails: malformed input is replaced and flagged in
    /// the returned [`Decoded`].
    pub fn decode(&self, raw: Bytes) -> Decoded {
        let encoding = match self {
            Decoder::Nop => {
                return Decoded {
                    body: raw,
                    had_errors: false,
                    bom_removed: false,
                }
            }
            Decoder::Text(encoding) => *encoding,
        };

        let (text, had_errors) = encoding.decode_without_bom_handling(&raw);
        let bom_removed = text.starts_with(BOM_UTF8);
        let body = match text {
            // Valid UTF-8 input without a BOM is already the output.
            Cow::Borrowed(_) if !bom_removed => raw.clone(),
            Cow::Borrowed(text) => Bytes::copy_from_slice(text[BOM_UTF8.len()..].as_bytes()),
            Cow::Owned(text) if bom_removed => {
                Bytes::copy_from_slice(text[BOM_UTF8.len()..].as_bytes())
            }
            Cow::Owned(text) => Bytes::from(text),
        };

        Decoded {
            body,
            had_errors,
            bom_removed,
        }
    }
}
