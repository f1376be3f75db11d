//! Text chunking for the voice engine.

/// Split text into chunks no longer than `max_len` characters.
///
/// Sentences end at `.`, `!` or `?` followed by whitespace (or end of text)
/// and at line breaks. A sentence that is still too long is wrapped on word
/// boundaries; a single word longer than `max_len` becomes its own chunk.
pub fn split_into_chunks(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    split_sentences(text)
        .into_iter()
        .flat_map(|sentence| wrap_words(&sentence, max_len))
        .collect()
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' || c == '\r' {
            flush(&mut sentences, &mut current);
            continue;
        }
        current.push(c);
        let ends_sentence =
            matches!(c, '.' | '!' | '?') && chars.peek().map_or(true, |n| n.is_whitespace());
        if ends_sentence {
            flush(&mut sentences, &mut current);
        }
    }
    flush(&mut sentences, &mut current);
    sentences
}

fn flush(sentences: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

fn wrap_words(sentence: &str, max_len: usize) -> Vec<String> {
    if sentence.chars().count() <= max_len {
        return vec![sentence.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in sentence.split_whitespace() {
        let word_len = word.chars().count();
        if current_len > 0 && current_len + 1 + word_len > max_len {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(word);
        current_len += word_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
