/// Streaming decode of raw device chunks into text lines.
///
/// Reads arrive at arbitrary byte boundaries: a multi-byte UTF-8 character or
/// a text line may be split across two chunks. `Utf8Decoder` carries the
/// incomplete character tail forward, `LineAssembler` the incomplete line.

/// Incremental UTF-8 decoder; invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(bytes);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            // Truncated sequence at the end: wait for the next chunk.
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush a dangling partial character at end of stream.
    pub fn finish(&mut self) -> Option<char> {
        if self.pending.is_empty() {
            None
        } else {
            self.pending.clear();
            Some(char::REPLACEMENT_CHARACTER)
        }
    }

    #[cfg(test)]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Splits decoded text into lines, holding back a trailing partial line.
#[derive(Debug)]
pub struct LineAssembler {
    partial: String,
    reassemble: bool,
    max_line_bytes: usize,
}

impl LineAssembler {
    /// With `reassemble == false` each chunk is split on its own and no text is
    /// held back between chunks.
    pub fn new(reassemble: bool, max_line_bytes: usize) -> Self {
        Self {
            partial: String::new(),
            reassemble,
            max_line_bytes,
        }
    }

    pub fn push(&mut self, text: &str) -> Vec<String> {
        if !self.reassemble {
            return split_lines(text);
        }

        self.partial.push_str(text);
        let Some(last_end) = self.partial.rfind(is_line_end) else {
            self.enforce_limit();
            return Vec::new();
        };

        let rest = self.partial.split_off(last_end + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        self.enforce_limit();
        split_lines(&complete)
    }

    #[cfg(test)]
    pub fn pending(&self) -> &str {
        &self.partial
    }

    fn enforce_limit(&mut self) {
        if self.partial.len() > self.max_line_bytes {
            tracing::warn!(
                bytes = self.partial.len(),
                max_line_bytes = self.max_line_bytes,
                "discarding unterminated line"
            );
            self.partial.clear();
        }
    }
}

fn is_line_end(c: char) -> bool {
    c == '\n' || c == '\r'
}

/// Devices end readings with `\n`, `\r` or `\r\n`; the empty pieces between
/// terminators are dropped.
fn split_lines(text: &str) -> Vec<String> {
    text.split(is_line_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
