//! Groups streamed text into sentence-sized units for synthesis.

const BOUNDARIES: [char; 5] = ['.', '!', '?', ';', '\n'];

/// Accumulates fragments and releases speakable units.
///
/// A unit ends at sentence punctuation followed by whitespace once at least
/// `min_chars` have accumulated. A buffer longer than `max_chars` without a
/// boundary is split at its last whitespace.
#[derive(Debug)]
pub struct SentenceBatcher {
    buf: String,
    min_chars: usize,
    max_chars: usize,
}

impl SentenceBatcher {
    pub fn new(min_chars: usize, max_chars: usize) -> Self {
        Self {
            buf: String::new(),
            min_chars,
            max_chars: max_chars.max(min_chars).max(1),
        }
    }

    /// Add text and return every unit it completes.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buf.push_str(text);
        let mut units = Vec::new();
        while let Some(end) = self.next_split() {
            let rest = self.buf.split_off(end);
            let unit = std::mem::replace(&mut self.buf, rest);
            let unit = unit.trim();
            if !unit.is_empty() {
                units.push(unit.to_string());
            }
        }
        units
    }

    /// Release whatever remains at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.buf.trim().is_empty()
    }

    /// Byte offset to split at, if a unit is complete.
    fn next_split(&self) -> Option<usize> {
        let mut chars = self.buf.char_indices().peekable();
        let mut count = 0;
        let mut last_space = None;
        let mut max_end = None;

        while let Some((idx, c)) = chars.next() {
            count += 1;
            let end = idx + c.len_utf8();
            if BOUNDARIES.contains(&c) && count >= self.min_chars {
                let followed_by_space = c == '\n'
                    || chars.peek().is_some_and(|(_, next)| next.is_whitespace());
                if followed_by_space {
                    return Some(end);
                }
            }
            if count <= self.max_chars {
                if c.is_whitespace() {
                    last_space = Some(end);
                }
                if count == self.max_chars {
                    max_end = Some(end);
                }
            }
        }

        if count > self.max_chars {
            return last_space.filter(|&e| e > 0).or(max_end);
        }
        None
    }
}
