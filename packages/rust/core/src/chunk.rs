//! Paragraph-aware text chunking for ingestion.
//!
//! Splitting prefers paragraph boundaries, falls back to sentence
//! boundaries for oversized paragraphs, and hard-splits anything that is
//! still too long. Fragments under the minimum length are discarded as
//! noise (navigation crumbs, bylines, etc.).

use unicode_segmentation::UnicodeSegmentation;

/// Hard upper bound on chunk size, in characters (~500 tokens).
pub const MAX_CHUNK_CHARS: usize = 2000;

/// Chunks shorter than this are dropped as noise.
pub const MIN_CHUNK_CHARS: usize = 50;

/// Split `content` into chunks of at most `max_chars`, dropping any under
/// `min_chars`.
pub fn split_text(content: &str, max_chars: usize, min_chars: usize) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in content.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if char_len(para) > max_chars {
            // Oversized paragraph: flush what we have, then split it by
            // sentence boundaries.
            flush(&mut chunks, &mut current);
            split_paragraph(para, max_chars, &mut chunks);
        } else if char_len(&current) + char_len(para) > max_chars {
            flush(&mut chunks, &mut current);
            current.push_str(para);
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(para);
        }
    }
    flush(&mut chunks, &mut current);

    chunks
        .into_iter()
        .flat_map(|chunk| hard_split(&chunk, max_chars))
        .filter(|chunk| char_len(chunk) >= min_chars)
        .collect()
}

fn split_paragraph(para: &str, max_chars: usize, chunks: &mut Vec<String>) {
    let mut current = String::new();
    for (_, sentence) in para.split_sentence_bound_indices() {
        if char_len(&current) + char_len(sentence) > max_chars {
            flush(chunks, &mut current);
        }
        current.push_str(sentence);
    }
    flush(chunks, &mut current);
}

/// Last resort for a single sentence longer than the limit.
fn hard_split(chunk: &str, max_chars: usize) -> Vec<String> {
    if char_len(chunk) <= max_chars {
        return vec![chunk.to_string()];
    }
    let chars: Vec<char> = chunk.chars().collect();
    chars
        .chunks(max_chars)
        .map(|window| window.iter().collect::<String>().trim().to_string())
        .collect()
}

fn flush(chunks: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
    current.clear();
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_content_is_one_chunk() {
        let text = "Register your address within 14 days of moving. \
                    Bring your passport and rental contract.";
        let chunks = split_text(text, MAX_CHUNK_CHARS, MIN_CHUNK_CHARS);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], text);
    }

    #[test]
    fn paragraphs_are_packed_up_to_the_limit() {
        let para = "x".repeat(800);
        let text = format!("{para}\n\n{para}\n\n{para}");
        let chunks = split_text(&text, 2000, 50);
        // Two paragraphs fit together (1602 chars incl. separator), the
        // third starts a new chunk.
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].chars().count() <= 2000);
    }

    #[test]
    fn oversized_paragraph_splits_on_sentences() {
        let sentence = format!("{} sentence ends here. ", "word ".repeat(30));
        let para = sentence.repeat(20); // ~3600 chars, no blank lines
        let chunks = split_text(&para, 2000, 50);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 2000);
        }
    }

    #[test]
    fn unbroken_run_hard_splits() {
        let blob = "a".repeat(4500);
        let chunks = split_text(&blob, 2000, 50);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 2000);
        assert_eq!(chunks[2].chars().count(), 500);
    }

    #[test]
    fn noise_fragments_are_dropped() {
        let text = "Home > Visas\n\nA proper paragraph with enough substance \
                    to clear the minimum chunk length threshold easily.";
        let chunks = split_text(text, 2000, 50);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].starts_with("A proper paragraph"));
    }

    #[test]
    fn empty_content_yields_nothing() {
        assert!(split_text("", 2000, 50).is_empty());
        assert!(split_text("\n\n\n\n", 2000, 50).is_empty());
    }
}
