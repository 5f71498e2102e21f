//! Splits streamed reply text into sentences for synthesis

/// Characters that end a sentence when followed by whitespace
const TERMINATORS: [char; 9] = ['.', '!', '?', ';', ':', '…', '。', '！', '？'];

/// Accumulates tokens and releases complete sentences
#[derive(Debug, Default)]
pub struct SentenceChunker {
    buffer: String,
}

impl SentenceChunker {
    /// Create an empty chunker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a token, returning any sentences it completed
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);

        let mut sentences = Vec::new();
        while let Some(end) = self.boundary() {
            let rest = self.buffer.split_off(end);
            let sentence = std::mem::replace(&mut self.buffer, rest);
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
        }
        sentences
    }

    /// Release whatever text is left at end of stream
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    /// Byte offset just past the first terminator followed by whitespace
    fn boundary(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();
        while let Some((idx, c)) = chars.next() {
            if TERMINATORS.contains(&c) && chars.peek().is_some_and(|(_, next)| next.is_whitespace()) {
                return Some(idx + c.len_utf8());
            }
        }
        None
    }
}
