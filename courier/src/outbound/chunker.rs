//! Text chunkers: split long text into rune-bounded chunks.
//!
//! Contract: split by line (text) or by `\n\n` paragraph (markdown), pack
//! greedily until rune length plus separator would exceed the limit; a single
//! line/paragraph over the limit is rune-sliced. Text at or under the limit
//! comes back as one chunk equal to the input.

/// Line-based chunking for plain and rich text.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    pack(text, "\n", limit)
}

/// Paragraph-based chunking for markdown.
pub fn chunk_markdown_text(text: &str, limit: usize) -> Vec<String> {
    pack(text, "\n\n", limit)
}

/// Slices a string into pieces of at most `limit` runes.
fn rune_slice(text: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(limit)
        .map(|c| c.iter().collect())
        .collect()
}

fn pack(text: &str, separator: &str, limit: usize) -> Vec<String> {
    if limit == 0 {
        return vec![text.to_string()];
    }
    let sep_len = separator.chars().count();
    let mut chunks: Vec<String> = Vec::new();
    // current buffer; None distinguishes "nothing yet" from an empty segment
    let mut current: Option<(String, usize)> = None;

    for segment in text.split(separator) {
        let seg_len = segment.chars().count();

        if seg_len > limit {
            if let Some((buf, _)) = current.take() {
                chunks.push(buf);
            }
            let mut slices = rune_slice(segment, limit);
            if let Some(last) = slices.pop() {
                chunks.extend(slices);
                let last_len = last.chars().count();
                current = Some((last, last_len));
            }
            continue;
        }

        match current.take() {
            None => current = Some((segment.to_string(), seg_len)),
            Some((mut buf, buf_len)) => {
                if buf_len + sep_len + seg_len <= limit {
                    buf.push_str(separator);
                    buf.push_str(segment);
                    current = Some((buf, buf_len + sep_len + seg_len));
                } else {
                    chunks.push(buf);
                    current = Some((segment.to_string(), seg_len));
                }
            }
        }
    }

    if let Some((buf, _)) = current {
        chunks.push(buf);
    }
    chunks
}
