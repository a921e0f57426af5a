//! Token estimation for debugger output

/// Estimate BPE token count from text
///
/// Debugger output is dominated by hex columns, which tokenize far worse than prose:
/// - hex-dense tables: ~2.2 chars/token
/// - punctuation-heavy stacks and symbols: ~2.8 chars/token
/// - natural language: ~4.0 chars/token
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let total_chars = text.len();
    let mut hex_chars = 0usize;
    let mut symbol_chars = 0usize;
    for word in text.split_whitespace() {
        let bare = word.trim_start_matches("0x").trim_start_matches("0X");
        if bare.len() >= 8 && bare.chars().all(|c| c.is_ascii_hexdigit() || c == '`') {
            hex_chars += word.len();
        } else {
            symbol_chars += word
                .chars()
                .filter(|&c| "!:<>()[]{}.,;=+*&|$#@`".contains(c))
                .count();
        }
    }

    let hex_fraction = (hex_chars as f64 / total_chars as f64).min(1.0);
    let symbol_fraction = ((symbol_chars as f64 / total_chars as f64) * 6.0).min(1.0 - hex_fraction);
    let prose_fraction = 1.0 - hex_fraction - symbol_fraction;

    let chars_per_token = hex_fraction * 2.2 + symbol_fraction * 2.8 + prose_fraction * 4.0;
    (total_chars as f64 / chars_per_token).max(1.0) as usize
}

/// Longest prefix of `text` that fits in `budget` estimated tokens, cut at a line boundary.
///
/// Line costs are summed as they are read. When the first line alone is over
/// budget it is cut mid-line instead, so the result is only empty for a zero budget.
pub fn truncate_to_tokens(text: &str, budget: usize) -> &str {
    if estimate_tokens(text) <= budget {
        return text;
    }

    let mut end = 0;
    let mut used = 0;
    for line in text.split_inclusive('\n') {
        let cost = estimate_tokens(line);
        if used + cost > budget {
            break;
        }
        used += cost;
        end += line.len();
    }
    if end > 0 || budget == 0 {
        return &text[..end];
    }

    let first = text.split_inclusive('\n').next().unwrap_or(text);
    let mut cut = first.len() * budget / estimate_tokens(first).max(1);
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}
