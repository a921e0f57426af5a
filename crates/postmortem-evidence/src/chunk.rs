//! Line-boundary chunking of large outputs

/// Split `output` into consecutive slices of at most `max_bytes`, never cutting a line.
///
/// Every slice except possibly the last ends with `'\n'`, and concatenating the
/// slices yields `output` exactly. A single line longer than `max_bytes` becomes
/// its own oversized slice.
pub fn split_chunks(output: &str, max_bytes: usize) -> Vec<&str> {
    let max_bytes = max_bytes.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut len = 0;

    for line in output.split_inclusive('\n') {
        if len > 0 && len + line.len() > max_bytes {
            chunks.push(&output[start..start + len]);
            start += len;
            len = 0;
        }
        len += line.len();
    }
    if len > 0 {
        chunks.push(&output[start..start + len]);
    }
    chunks
}

/// Last `lines` lines of `text`, used as carried-forward context
pub fn tail_lines(text: &str, lines: usize) -> &str {
    if lines == 0 {
        return "";
    }
    let trimmed = text.strip_suffix('\n').unwrap_or(text);
    match trimmed.rmatch_indices('\n').nth(lines - 1) {
        Some((idx, _)) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(output: &str, max: usize) {
        let chunks = split_chunks(output, max);
        assert_eq!(chunks.concat(), output, "max={}", max);
        for chunk in &chunks[..chunks.len().saturating_sub(1)] {
            assert!(chunk.ends_with('\n'), "chunk cut mid-line: {:?}", chunk);
        }
        for chunk in &chunks {
            assert!(
                chunk.len() <= max || chunk.lines().count() == 1,
                "multi-line chunk over budget"
            );
        }
    }

    #[test]
    fn test_empty_output_has_no_chunks() {
        assert!(split_chunks("", 64).is_empty());
    }

    #[test]
    fn test_smaller_than_one_chunk() {
        let output = "ThreadCount: 3\nDeadThread: 0\n";
        assert_eq!(split_chunks(output, 1024), vec![output]);
        assert_covers(output, 1024);
    }

    #[test]
    fn test_exact_multiple_of_chunk_size() {
        let line = "012345678\n";
        let output = line.repeat(9);
        let chunks = split_chunks(&output, 30);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 30));
        assert_covers(&output, 30);
    }

    #[test]
    fn test_oversized_line_kept_whole() {
        let output = format!("short\n{}\nafter\n", "x".repeat(100));
        let chunks = split_chunks(&output, 16);
        assert_eq!(chunks[1].len(), 101);
        assert_covers(&output, 16);
    }

    #[test]
    fn test_coverage_over_many_shapes() {
        let mut output = String::new();
        for i in 0..500 {
            output.push_str(&format!("{:016x} {}\r\n", i * 7919, "y".repeat(i % 37)));
        }
        output.push_str("no trailing newline");
        for max in [1, 7, 64, 100, 333, 4096, 1 << 20] {
            assert_covers(&output, max);
        }
    }

    #[test]
    fn test_tail_lines() {
        let text = "a\nb\nc\nd\n";
        assert_eq!(tail_lines(text, 2), "c\nd");
        assert_eq!(tail_lines(text, 10), "a\nb\nc\nd");
        assert_eq!(tail_lines(text, 0), "");
    }
}
