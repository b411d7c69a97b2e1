//! Line-window chunking with fixed overlap.
//!
//! Chunks advance by `chunk_size - overlap` lines, so every chunk after the
//! first repeats the last `overlap` lines of its predecessor as leading
//! context. Line terminators are kept byte-for-byte.

use uuid::Uuid;

use crate::error::{IndexError, Result};

/// Namespace for deterministic chunk identifiers.
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x5f1e_7c2a_9d04_4b8e_a6c3_21d0_8f4b_e917);

/// One line window of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    pub content: String,
    pub content_hash: String,
}

/// Chunker configuration, measured in lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Lines per chunk (default: 50).
    pub chunk_size: usize,
    /// Lines repeated from the previous chunk (default: 10).
    pub overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            overlap: 10,
        }
    }
}

impl ChunkerConfig {
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `chunk_size` is zero or `overlap >= chunk_size`.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(IndexError::InvalidConfig("chunk_size must be > 0".into()));
        }
        if self.overlap >= self.chunk_size {
            return Err(IndexError::InvalidConfig(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    fn stride(&self) -> usize {
        self.chunk_size.saturating_sub(self.overlap).max(1)
    }
}

/// Split `source` into overlapping line windows.
///
/// An empty source yields no chunks; a source of at most `chunk_size` lines
/// yields exactly one spanning the whole file.
#[must_use]
pub fn chunk_text(source: &str, config: &ChunkerConfig) -> Vec<TextChunk> {
    let lines: Vec<&str> = source.split_inclusive('\n').collect();
    let size = config.chunk_size.max(1);
    if lines.is_empty() {
        return Vec::new();
    }
    if lines.len() <= size {
        return vec![window(&lines, 0, lines.len())];
    }

    let stride = config.stride();
    let mut chunks = Vec::with_capacity(lines.len() / stride + 1);
    let mut start = 0;
    while start < lines.len() {
        let end = (start + size).min(lines.len());
        chunks.push(window(&lines, start, end));
        start += stride;
    }
    chunks
}

fn window(lines: &[&str], start: usize, end: usize) -> TextChunk {
    let content = lines[start..end].concat();
    TextChunk {
        start_line: start + 1,
        end_line: end,
        content_hash: blake3_hex(content.as_bytes()),
        content,
    }
}

/// Stable chunk identifier: the same span of the same file in the same
/// project always maps to the same id.
#[must_use]
pub fn chunk_id(project_id: &str, file_path: &str, start_line: usize) -> String {
    let name = format!("{project_id}\0{file_path}\0{start_line}");
    Uuid::new_v5(&CHUNK_NAMESPACE, name.as_bytes()).to_string()
}

/// Whole-content hash used for change detection.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    blake3_hex(bytes)
}

fn blake3_hex(input: &[u8]) -> String {
    blake3::hash(input).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn numbered_lines(n: usize) -> String {
        (1..=n).map(|i| format!("line {i}\n")).collect()
    }

    fn spans(chunks: &[TextChunk]) -> Vec<(usize, usize)> {
        chunks.iter().map(|c| (c.start_line, c.end_line)).collect()
    }

    /// Rebuild the source from each chunk's non-overlapping tail.
    fn reconstruct(chunks: &[TextChunk]) -> String {
        let mut out = String::new();
        let mut covered: usize = 0;
        for chunk in chunks {
            let skip = (covered + 1).saturating_sub(chunk.start_line);
            for line in chunk.content.split_inclusive('\n').skip(skip) {
                out.push_str(line);
            }
            covered = covered.max(chunk.end_line);
        }
        out
    }

    #[test]
    fn fifty_lines_size_twenty_overlap_five() {
        let config = ChunkerConfig {
            chunk_size: 20,
            overlap: 5,
        };
        let chunks = chunk_text(&numbered_lines(50), &config);
        assert_eq!(spans(&chunks), vec![(1, 20), (16, 35), (31, 50), (46, 50)]);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.start_line, 1 + i * 15);
            assert_eq!(chunk.end_line, (chunk.start_line + 19).min(50));
        }
    }

    #[test]
    fn ten_lines_single_chunk() {
        let config = ChunkerConfig {
            chunk_size: 20,
            overlap: 5,
        };
        let source = numbered_lines(10);
        let chunks = chunk_text(&source, &config);
        assert_eq!(spans(&chunks), vec![(1, 10)]);
        assert_eq!(chunks[0].content, source);
    }

    #[test]
    fn file_within_one_window_is_one_chunk() {
        let config = ChunkerConfig {
            chunk_size: 20,
            overlap: 5,
        };
        for n in 11..=20 {
            let source = numbered_lines(n);
            let chunks = chunk_text(&source, &config);
            assert_eq!(spans(&chunks), vec![(1, n)], "{n} lines");
            assert_eq!(chunks[0].content, source);
        }
        let chunks = chunk_text(&numbered_lines(21), &config);
        assert_eq!(spans(&chunks), vec![(1, 20), (16, 21)]);
    }

    #[test]
    fn empty_source_yields_nothing() {
        assert!(chunk_text("", &ChunkerConfig::default()).is_empty());
    }

    #[test]
    fn missing_trailing_newline_kept() {
        let config = ChunkerConfig {
            chunk_size: 2,
            overlap: 0,
        };
        let chunks = chunk_text("a\nb\nc", &config);
        assert_eq!(spans(&chunks), vec![(1, 2), (3, 3)]);
        assert_eq!(chunks[1].content, "c");
    }

    #[test]
    fn crlf_preserved() {
        let config = ChunkerConfig {
            chunk_size: 1,
            overlap: 0,
        };
        let chunks = chunk_text("a\r\nb\r\n", &config);
        assert_eq!(chunks[0].content, "a\r\n");
        assert_eq!(chunks[1].content, "b\r\n");
    }

    #[test]
    fn overlap_repeats_predecessor_tail() {
        let config = ChunkerConfig {
            chunk_size: 4,
            overlap: 2,
        };
        let chunks = chunk_text(&numbered_lines(9), &config);
        for pair in chunks.windows(2) {
            let prev: Vec<&str> = pair[0].content.split_inclusive('\n').collect();
            let next: Vec<&str> = pair[1].content.split_inclusive('\n').collect();
            if prev.len() == config.chunk_size {
                assert_eq!(&prev[prev.len() - 2..], &next[..2]);
            }
        }
    }

    #[test]
    fn validate_rejects_bad_overlap() {
        let bad = ChunkerConfig {
            chunk_size: 5,
            overlap: 5,
        };
        assert!(bad.validate().is_err());
        let zero = ChunkerConfig {
            chunk_size: 0,
            overlap: 0,
        };
        assert!(zero.validate().is_err());
        assert!(ChunkerConfig::default().validate().is_ok());
    }

    #[test]
    fn chunk_id_deterministic_and_scoped() {
        let a = chunk_id("p1", "src/a.rs", 16);
        assert_eq!(a, chunk_id("p1", "src/a.rs", 16));
        assert_ne!(a, chunk_id("p2", "src/a.rs", 16));
        assert_ne!(a, chunk_id("p1", "src/b.rs", 16));
        assert_ne!(a, chunk_id("p1", "src/a.rs", 31));
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn content_hash_detects_single_byte_edit() {
        let h1 = content_hash(b"fn login() {}\n");
        let h2 = content_hash(b"fn login() {}\n");
        let h3 = content_hash(b"fn logon() {}\n");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
    }

    proptest! {
        #[test]
        fn chunks_reconstruct_source(
            lines in proptest::collection::vec("[a-z ]{0,12}", 0..80),
            trailing_newline in any::<bool>(),
            size in 1usize..25,
            overlap_seed in 0usize..25,
        ) {
            let overlap = overlap_seed % size;
            let mut source = lines.join("\n");
            if trailing_newline && !source.is_empty() {
                source.push('\n');
            }
            let config = ChunkerConfig { chunk_size: size, overlap };
            let chunks = chunk_text(&source, &config);

            prop_assert_eq!(reconstruct(&chunks), source.clone());

            let total = source.split_inclusive('\n').count();
            let mut covered = vec![false; total];
            for chunk in &chunks {
                prop_assert!(chunk.end_line - chunk.start_line < size);
                for line in chunk.start_line..=chunk.end_line {
                    covered[line - 1] = true;
                }
            }
            prop_assert!(covered.iter().all(|c| *c));

            if total <= size {
                prop_assert_eq!(chunks.len(), usize::from(total > 0));
            }
            for pair in chunks.windows(2) {
                prop_assert_eq!(pair[1].start_line - pair[0].start_line, size - overlap);
            }
        }
    }
}
