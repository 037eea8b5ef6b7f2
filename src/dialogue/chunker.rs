//! Token-to-chunk accumulation for TTS dispatch.

/// Accumulates streamed LLM tokens and cuts a chunk at the last configured
/// punctuation character, so TTS receives speakable clauses rather than
/// single tokens.
#[derive(Debug)]
pub struct TokenChunker {
    buffer: String,
    split_chars: Vec<char>,
}

impl TokenChunker {
    pub fn new(split_chars: Vec<char>) -> Self {
        Self {
            buffer: String::new(),
            split_chars,
        }
    }

    /// Append one token. Returns a chunk when the buffer now contains a
    /// split character; the chunk runs through the last one.
    pub fn push(&mut self, token: &str) -> Option<String> {
        self.buffer.push_str(token);

        let pos = self
            .buffer
            .char_indices()
            .filter(|(_, c)| self.split_chars.contains(c))
            .map(|(i, c)| i + c.len_utf8())
            .last()?;

        let rest = self.buffer.split_off(pos);
        let chunk = std::mem::replace(&mut self.buffer, rest);
        let chunk = chunk.trim().to_owned();
        if chunk.is_empty() { None } else { Some(chunk) }
    }

    /// Flush whatever remains when the generation terminates.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim().to_owned();
        if rest.is_empty() { None } else { Some(rest) }
    }

    /// Discard buffered text (cancelled generation).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
