//! Paragraph-packing text chunker with forward overlap.
//!
//! Splits message bodies into retrieval-sized windows:
//!
//! 1. Trim the input; empty input yields no chunks.
//! 2. Split on blank lines into paragraphs.
//! 3. Greedily pack paragraphs (joined by `"\n\n"`) while the buffer stays
//!    within `max_chars`.
//! 4. A paragraph longer than `max_chars` is sliced into raw windows of
//!    `max_chars`, advancing by `max_chars - overlap_chars`.
//! 5. When `overlap_chars > 0`, every chunk after the first is prefixed
//!    with the last `overlap_chars` characters of the previous *output*
//!    chunk, so overlap compounds forward.
//!
//! All lengths are measured in `char`s, never bytes, so multi-byte text
//! cannot be split inside a code point. No chunk is longer than
//! `max_chars + overlap_chars`.

use anyhow::Result;

use crate::error::Error;

pub const DEFAULT_MAX_CHARS: usize = 2000;
pub const DEFAULT_OVERLAP_CHARS: usize = 200;

/// Validated chunking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    max_chars: usize,
    overlap_chars: usize,
}

impl ChunkParams {
    /// Rejects `max_chars == 0` and `overlap_chars >= max_chars`.
    pub fn new(max_chars: usize, overlap_chars: usize) -> Result<Self> {
        if max_chars == 0 {
            return Err(Error::InvalidConfig("chunk max_chars must be > 0".into()).into());
        }
        if overlap_chars >= max_chars {
            return Err(Error::InvalidConfig(format!(
                "chunk overlap_chars ({}) must be smaller than max_chars ({})",
                overlap_chars, max_chars
            ))
            .into());
        }
        Ok(Self {
            max_chars,
            overlap_chars,
        })
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }

    /// Split `text` into ordered chunks.
    pub fn split(&self, text: &str) -> Vec<String> {
        let clean = text.trim();
        if clean.is_empty() {
            return Vec::new();
        }

        let mut paragraphs: Vec<&str> = clean
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if paragraphs.is_empty() {
            paragraphs.push(clean);
        }

        let mut chunks: Vec<String> = Vec::new();
        let mut buffer = String::new();
        let mut buffer_len = 0usize;

        for para in paragraphs {
            let para_len = para.chars().count();

            if para_len > self.max_chars {
                flush(&mut chunks, &mut buffer, &mut buffer_len);
                self.slice_windows(para, &mut chunks);
                continue;
            }

            if buffer.is_empty() {
                buffer.push_str(para);
                buffer_len = para_len;
            } else if buffer_len + 2 + para_len <= self.max_chars {
                buffer.push_str("\n\n");
                buffer.push_str(para);
                buffer_len += 2 + para_len;
            } else {
                flush(&mut chunks, &mut buffer, &mut buffer_len);
                buffer.push_str(para);
                buffer_len = para_len;
            }
        }
        flush(&mut chunks, &mut buffer, &mut buffer_len);

        if self.overlap_chars > 0 && chunks.len() > 1 {
            return self.apply_overlap(chunks);
        }
        chunks
    }

    fn slice_windows(&self, para: &str, chunks: &mut Vec<String>) {
        let chars: Vec<char> = para.chars().collect();
        let step = self.max_chars.saturating_sub(self.overlap_chars).max(1);

        let mut start = 0usize;
        while start < chars.len() {
            let end = (start + self.max_chars).min(chars.len());
            let window: String = chars[start..end].iter().collect();
            let window = window.trim();
            if !window.is_empty() {
                chunks.push(window.to_string());
            }
            if end == chars.len() {
                break;
            }
            start += step;
        }
    }

    fn apply_overlap(&self, chunks: Vec<String>) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let next = match out.last() {
                Some(prev) => {
                    let combined = format!("{}{}", tail_chars(prev, self.overlap_chars), chunk);
                    combined.trim().to_string()
                }
                None => chunk,
            };
            out.push(next);
        }
        out
    }
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_CHARS,
            overlap_chars: DEFAULT_OVERLAP_CHARS,
        }
    }
}

/// Split text into overlapping chunks.
///
/// # Example
///
/// ```rust
/// use threadline_core::chunk::chunk_text;
///
/// let chunks = chunk_text("Hello.\n\nSecond paragraph.", 2000, 200).unwrap();
/// assert_eq!(chunks, vec!["Hello.\n\nSecond paragraph.".to_string()]);
/// assert!(chunk_text("  \n\n ", 2000, 200).unwrap().is_empty());
/// assert!(chunk_text("text", 100, 100).is_err());
/// ```
pub fn chunk_text(text: &str, max_chars: usize, overlap_chars: usize) -> Result<Vec<String>> {
    Ok(ChunkParams::new(max_chars, overlap_chars)?.split(text))
}

fn flush(chunks: &mut Vec<String>, buffer: &mut String, buffer_len: &mut usize) {
    let trimmed = buffer.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
    buffer.clear();
    *buffer_len = 0;
}

fn tail_chars(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    match s.char_indices().nth(count - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_ws(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    /// Deterministic pseudo-random prose with paragraphs of varying length.
    fn sample_text(seed: u64, paragraphs: usize) -> String {
        let words = ["alpha", "beta", "gamma", "delta", "wire", "transfer", "émigré", "日本"];
        let mut state = seed;
        let mut next = move || {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as usize
        };
        let mut paras = Vec::with_capacity(paragraphs);
        for _ in 0..paragraphs {
            let n = 1 + next() % 120;
            let mut para = Vec::with_capacity(n);
            for _ in 0..n {
                para.push(words[next() % words.len()]);
            }
            paras.push(para.join(" "));
        }
        paras.join("\n\n\n")
    }

    #[test]
    fn test_empty_and_whitespace_yield_nothing() {
        assert!(chunk_text("", 2000, 200).unwrap().is_empty());
        assert!(chunk_text(" \n\n ", 2000, 200).unwrap().is_empty());
        assert!(chunk_text("\t\n", 10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let err = chunk_text("abc", 0, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidConfig(_))
        ));
        assert!(chunk_text("abc", 100, 100).is_err());
        assert!(chunk_text("abc", 100, 150).is_err());
        assert!(chunk_text("abc", 100, 99).is_ok());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("  Hello, world!  ", 2000, 200).unwrap();
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_paragraphs_packed_with_blank_line() {
        let text = "First paragraph.\n\n\n\nSecond paragraph.\n\nThird.";
        let chunks = chunk_text(text, 2000, 200).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "First paragraph.\n\nSecond paragraph.\n\nThird.");
    }

    #[test]
    fn test_packing_flushes_when_full() {
        // 10 + 2 + 10 = 22 > 20, so each paragraph becomes its own chunk.
        let text = "aaaaaaaaaa\n\nbbbbbbbbbb\n\ncccccccccc";
        let chunks = chunk_text(text, 20, 0).unwrap();
        assert_eq!(chunks, vec!["aaaaaaaaaa", "bbbbbbbbbb", "cccccccccc"]);
    }

    #[test]
    fn test_overlap_prefixes_previous_output_tail() {
        let text = "aaaaaaaaaa\n\nbbbbbbbbbb\n\ncccccccccc";
        let chunks = chunk_text(text, 20, 4).unwrap();
        assert_eq!(chunks[0], "aaaaaaaaaa");
        assert_eq!(chunks[1], "aaaabbbbbbbbbb");
        // Tail of the *output* chunk 1, not of the original "bbbbbbbbbb".
        assert_eq!(chunks[2], "bbbbcccccccccc");
        let chunks = chunk_text("aa\n\nbbbbbbbbbbbbbbbbbbbb\n\nc", 20, 19).unwrap();
        // Compounding: chunk 2's prefix comes from chunk 1 after its own prefix.
        assert_eq!(chunks[2], format!("{}c", tail_chars(&chunks[1], 19)));
    }

    #[test]
    fn test_long_paragraph_raw_slicing_scenario() {
        let text = "A".repeat(5000);
        let chunks = chunk_text(&text, 2000, 200).unwrap();
        assert_eq!(chunks.len(), 3);
        for c in &chunks {
            assert!(c.chars().count() <= 2200, "chunk too long: {}", c.len());
        }
        for i in 1..chunks.len() {
            let prev = &chunks[i - 1];
            let prev_tail = tail_chars(prev, 200);
            assert!(chunks[i].starts_with(prev_tail));
        }
        assert_eq!(chunks[0].len(), 2000);
        assert_eq!(chunks[1].len(), 2200);
        assert_eq!(chunks[2].len(), 1600);
    }

    #[test]
    fn test_long_paragraph_flushes_pending_buffer() {
        let long = "x".repeat(50);
        let text = format!("short\n\n{}\n\ntail", long);
        let chunks = chunk_text(&text, 20, 0).unwrap();
        assert_eq!(chunks.first().map(String::as_str), Some("short"));
        assert_eq!(chunks.last().map(String::as_str), Some("tail"));
        assert_eq!(chunks.len(), 5); // short, 3 windows of x, tail
    }

    #[test]
    fn test_length_bound_holds_for_all_params() {
        for seed in 0..6u64 {
            let text = sample_text(seed, 12);
            for max in [16usize, 50, 200, 700, 2000] {
                for overlap in [0usize, 1, max / 4, max - 1] {
                    let chunks = chunk_text(&text, max, overlap).unwrap();
                    assert!(!chunks.is_empty());
                    for c in &chunks {
                        assert!(
                            c.chars().count() <= max + overlap,
                            "len {} > {} + {} (seed {})",
                            c.chars().count(),
                            max,
                            overlap,
                            seed
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_no_non_whitespace_dropped_without_overlap() {
        for seed in 0..6u64 {
            let text = sample_text(seed, 10);
            for max in [16usize, 64, 300, 5000] {
                let chunks = chunk_text(&text, max, 0).unwrap();
                assert_eq!(strip_ws(&chunks.concat()), strip_ws(&text));
            }
        }
    }

    #[test]
    fn test_overlap_only_adds_characters() {
        for seed in 0..4u64 {
            let text = sample_text(seed, 10);
            let plain = chunk_text(&text, 120, 0).unwrap();
            let overlapped = chunk_text(&text, 120, 30).unwrap();
            let plain_len = strip_ws(&plain.concat()).chars().count();
            let over_len = strip_ws(&overlapped.concat()).chars().count();
            assert!(over_len >= strip_ws(&text).chars().count());
            assert!(over_len >= plain_len);
        }
    }

    #[test]
    fn test_multibyte_text_is_not_split_inside_code_points() {
        let text = "日本語のテキスト".repeat(100);
        let chunks = chunk_text(&text, 37, 5).unwrap();
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 42);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = sample_text(42, 20);
        assert_eq!(
            chunk_text(&text, 300, 40).unwrap(),
            chunk_text(&text, 300, 40).unwrap()
        );
    }
}
