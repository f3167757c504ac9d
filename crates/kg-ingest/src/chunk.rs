//! Paragraph-aware document chunking (spec §4.3 step 2).

/// One chunk of a document's text, with its position in the source
/// document for provenance (`SourceRecord::paragraph`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position among this document's chunks.
    pub index: usize,
    /// The chunk's text.
    pub text: String,
}

/// Split `text` into overlapping chunks of roughly `chunk_size_chars`,
/// preferring to break on paragraph boundaries (blank lines) so a chunk
/// never splits a sentence mid-thought unless a single paragraph alone
/// exceeds `chunk_size_chars`, in which case that paragraph is hard-split.
///
/// `chunk_overlap_chars` of trailing text is repeated at the start of the
/// next chunk so concepts whose evidence spans a chunk boundary still have
/// a chunk that contains the full quote.
#[must_use]
pub fn chunk_document(text: &str, chunk_size_chars: usize, chunk_overlap_chars: usize) -> Vec<Chunk> {
    let chunk_size_chars = chunk_size_chars.max(1);
    let overlap = chunk_overlap_chars.min(chunk_size_chars.saturating_sub(1));

    let paragraphs: Vec<&str> = text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()).collect();
    if paragraphs.is_empty() {
        return Vec::new();
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for paragraph in paragraphs {
        if paragraph.chars().count() > chunk_size_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            chunks.extend(hard_split(paragraph, chunk_size_chars));
            continue;
        }

        let candidate_len = if current.is_empty() { paragraph.chars().count() } else { current.chars().count() + 2 + paragraph.chars().count() };
        if candidate_len > chunk_size_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    apply_overlap(chunks, overlap)
}

fn hard_split(paragraph: &str, chunk_size_chars: usize) -> Vec<String> {
    let chars: Vec<char> = paragraph.chars().collect();
    chars.chunks(chunk_size_chars).map(|slice| slice.iter().collect()).collect()
}

fn apply_overlap(chunks: Vec<String>, overlap: usize) -> Vec<Chunk> {
    let mut result = Vec::with_capacity(chunks.len());
    let mut previous_tail: Option<String> = None;
    for (index, body) in chunks.into_iter().enumerate() {
        let text = match (&previous_tail, overlap) {
            (Some(tail), o) if o > 0 => format!("{tail}\n\n{body}"),
            _ => body.clone(),
        };
        previous_tail = tail_chars(&body, overlap);
        result.push(Chunk { index, text });
    }
    result
}

fn tail_chars(text: &str, overlap: usize) -> Option<String> {
    if overlap == 0 {
        return None;
    }
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= overlap {
        return Some(text.to_string());
    }
    Some(chars[chars.len() - overlap..].iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_paragraph_boundaries_under_budget() {
        let text = "First paragraph here.\n\nSecond paragraph here.\n\nThird paragraph here.";
        let chunks = chunk_document(text, 1000, 0);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First"));
        assert!(chunks[0].text.contains("Third"));
    }

    #[test]
    fn breaks_into_multiple_chunks_when_over_budget() {
        let a = "a".repeat(50);
        let b = "b".repeat(50);
        let c = "c".repeat(50);
        let text = format!("{a}\n\n{b}\n\n{c}");
        let chunks = chunk_document(&text, 60, 0);
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn oversized_single_paragraph_is_hard_split() {
        let text = "x".repeat(250);
        let chunks = chunk_document(&text, 100, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text.chars().count(), 100);
    }

    #[test]
    fn overlap_repeats_trailing_characters_in_next_chunk() {
        let a = "a".repeat(50);
        let b = "b".repeat(50);
        let text = format!("{a}\n\n{b}");
        let chunks = chunk_document(&text, 55, 10);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].text.starts_with(&"a".repeat(10)));
    }

    #[test]
    fn empty_document_yields_no_chunks() {
        assert!(chunk_document("   \n\n  ", 500, 50).is_empty());
    }

    #[test]
    fn chunk_indices_are_sequential() {
        let text = "p1\n\np2\n\np3";
        let chunks = chunk_document(text, 2, 0);
        let indices: Vec<usize> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, (0..chunks.len()).collect::<Vec<_>>());
    }
}
