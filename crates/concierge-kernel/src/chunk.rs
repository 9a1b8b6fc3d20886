/// One window of a longer document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub index: usize,
    pub total: usize,
}

/// Split `text` into fixed-size character windows of `chunk_size` with `overlap`
/// characters shared between neighbours.
///
/// Windows are measured in chars, not bytes, so multi-byte text is never split inside
/// a code point. `overlap` is clamped below `chunk_size` so the window always advances.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<TextChunk> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() || chunk_size == 0 {
        return vec![];
    }

    let overlap = overlap.min(chunk_size - 1);
    let step = chunk_size - overlap;

    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(chars.len());
        windows.push(chars[start..end].iter().collect::<String>());
        if end == chars.len() {
            break;
        }
        start += step;
    }

    let total = windows.len();
    windows
        .into_iter()
        .enumerate()
        .map(|(index, text)| TextChunk { text, index, total })
        .collect()
}
