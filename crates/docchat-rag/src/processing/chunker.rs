use crate::config::ChunkingConfig;
use crate::types::SourceDocument;

/// Separators tried in order: paragraph break, line break, word break, character.
const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Recursive, size-bounded splitter with overlap. Sizes are character counts.
#[derive(Debug, Clone)]
pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    /// Join every paragraph with newlines and re-split the whole text.
    /// Extraction paragraph boundaries carry no meaning for retrieval.
    pub fn split_documents(&self, documents: &[SourceDocument]) -> Vec<String> {
        let all_content = documents
            .iter()
            .map(|d| d.page_content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.split_text(&all_content)
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &SEPARATORS)
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let mut final_chunks = Vec::new();

        // First separator present in the text; the empty separator always matches
        let (separator, remaining) = separators
            .iter()
            .position(|s| s.is_empty() || text.contains(s))
            .map(|i| (separators[i], &separators[i + 1..]))
            .unwrap_or(("", &[][..]));

        let splits: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(separator).filter(|s| !s.is_empty()).collect()
        };

        let mut good_splits: Vec<&str> = Vec::new();
        for split in splits {
            if char_len(split) < self.chunk_size {
                good_splits.push(split);
                continue;
            }
            if !good_splits.is_empty() {
                final_chunks.extend(self.merge_splits(&good_splits, separator));
                good_splits.clear();
            }
            if remaining.is_empty() {
                final_chunks.push(split.to_string());
            } else {
                final_chunks.extend(self.split_recursive(split, remaining));
            }
        }
        if !good_splits.is_empty() {
            final_chunks.extend(self.merge_splits(&good_splits, separator));
        }

        final_chunks
    }

    /// Greedily pack small splits into chunks, carrying up to `chunk_overlap`
    /// characters of trailing splits into the next chunk.
    fn merge_splits(&self, splits: &[&str], separator: &str) -> Vec<String> {
        let separator_len = char_len(separator);
        let mut docs = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut total = 0usize;

        for &split in splits {
            let len = char_len(split);
            let joined_len = |current: &Vec<&str>| if current.is_empty() { 0 } else { separator_len };

            if total + len + joined_len(&current) > self.chunk_size && !current.is_empty() {
                if let Some(doc) = join_trimmed(&current, separator) {
                    docs.push(doc);
                }
                while total > self.chunk_overlap
                    || (total + len + joined_len(&current) > self.chunk_size && total > 0)
                {
                    let first_len = char_len(current[0]);
                    let sep = if current.len() > 1 { separator_len } else { 0 };
                    total -= first_len + sep;
                    current.remove(0);
                }
            }

            total += len + if current.is_empty() { 0 } else { separator_len };
            current.push(split);
        }

        if let Some(doc) = join_trimmed(&current, separator) {
            docs.push(doc);
        }
        docs
    }
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::from_config(&ChunkingConfig::default())
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn join_trimmed(parts: &[&str], separator: &str) -> Option<String> {
    let joined = parts.join(separator);
    let trimmed = joined.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
