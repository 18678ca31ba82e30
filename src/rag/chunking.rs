/// Fixed-size chunking on characters without overlap. A chunk ends at the
/// last whitespace inside its window when there is one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextChunking {
    pub max_chunk_size: usize,
}

impl Default for TextChunking {
    fn default() -> Self {
        Self { max_chunk_size: 500 }
    }
}

impl TextChunking {
    pub fn new(max_chunk_size: usize) -> Self {
        Self {
            max_chunk_size: max_chunk_size.max(1),
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        let size = self.max_chunk_size.max(1);

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < total {
            while start < total && chars[start].is_whitespace() {
                start += 1;
            }
            if start >= total {
                break;
            }

            let end = (start + size).min(total);
            let cut = if end < total && !chars[end].is_whitespace() {
                chars[start + 1..end]
                    .iter()
                    .rposition(|c| c.is_whitespace())
                    .map(|offset| start + 1 + offset)
                    .unwrap_or(end)
            } else {
                end
            };

            let chunk: String = chars[start..cut].iter().collect();
            let chunk = chunk.trim();
            if !chunk.is_empty() {
                chunks.push(chunk.to_string());
            }
            start = cut;
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = TextChunking::default().split("  A short note.  ");
        assert_eq!(chunks, vec!["A short note."]);
        assert!(TextChunking::default().split("   ").is_empty());
    }

    #[test]
    fn chunks_break_on_whitespace_and_respect_size() {
        let text = "alpha beta gamma delta epsilon";
        let chunks = TextChunking::new(12).split(text);

        assert_eq!(chunks, vec!["alpha beta", "gamma delta", "epsilon"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 12));
    }

    #[test]
    fn long_words_are_split_hard() {
        let chunks = TextChunking::new(4).split("abcdefghij");
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
    }
}
