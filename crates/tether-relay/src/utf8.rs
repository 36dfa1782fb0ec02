//! Incremental UTF-8 decoding of process output

use encoding_rs::{CoderResult, Decoder, UTF_8};

/// Decodes a byte stream into text without splitting multi-byte characters
/// across chunk boundaries. Invalid sequences become U+FFFD.
pub struct Utf8Decoder {
    inner: Decoder,
}

impl std::fmt::Debug for Utf8Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Utf8Decoder").finish_non_exhaustive()
    }
}

impl Default for Utf8Decoder {
    fn default() -> Self {
        // A leading BOM is terminal output like any other
        Self {
            inner: UTF_8.new_decoder_without_bom_handling(),
        }
    }
}

impl Utf8Decoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk; an incomplete trailing character is held back
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.run(chunk, false)
    }

    /// Flush whatever is held back at end of stream and start over
    pub fn finish(&mut self) -> String {
        let rest = self.run(&[], true);
        self.inner = UTF_8.new_decoder_without_bom_handling();
        rest
    }

    fn run(&mut self, mut input: &[u8], last: bool) -> String {
        let mut out = String::new();
        loop {
            let needed = self
                .inner
                .max_utf8_buffer_length(input.len())
                .unwrap_or(input.len().saturating_mul(3).saturating_add(4));
            out.reserve(needed);

            let (result, read, _) = self.inner.decode_to_string(input, &mut out, last);
            input = &input[read..];
            match result {
                CoderResult::InputEmpty => return out,
                CoderResult::OutputFull => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_multibyte_character() {
        let text = "héllo → 世界";
        let bytes = text.as_bytes();
        let mut decoder = Utf8Decoder::new();

        let mut out = String::new();
        for byte in bytes {
            out.push_str(&decoder.decode(std::slice::from_ref(byte)));
        }
        out.push_str(&decoder.finish());

        assert_eq!(out, text);
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut decoder = Utf8Decoder::new();
        let out = decoder.decode(b"ok\xffok");
        assert_eq!(out, "ok\u{FFFD}ok");
    }

    #[test]
    fn test_truncated_tail_flushed_lossy() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xe4\xb8"), "a");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_control_bytes_pass_through() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"\x1b[31mred\x1b[0m\r\n\x07"), "\x1b[31mred\x1b[0m\r\n\x07");
    }

    #[test]
    fn test_leading_bom_is_kept() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"\xef\xbb\xbfhi"), "\u{FEFF}hi");
    }

    #[test]
    fn test_usable_after_finish() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"\xe2\x82"), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(decoder.decode("\u{20AC}".as_bytes()), "\u{20AC}");
    }
}
