//! File tool helpers
//!
//! - Binary detection for reads
//! - Exact-substring replacement for edit_file
//! - Unified diff parsing and application for patch_file
//! - Diff generation for file-change events

use anyhow::{anyhow, Result};
use similar::TextDiff;

/// Bytes scanned for NUL when deciding whether a file is binary.
const BINARY_SNIFF_LEN: usize = 8192;

/// A file is treated as binary if its leading bytes contain a NUL.
pub fn looks_binary(content: &[u8]) -> bool {
    content
        .iter()
        .take(BINARY_SNIFF_LEN)
        .any(|&b| b == 0)
}

/// Replace exactly one occurrence of `old` with `new`. Zero or multiple
/// matches are ambiguous and refused with the count.
pub fn replace_exact(content: &str, old: &str, new: &str) -> Result<String> {
    if old.is_empty() {
        return Err(anyhow!("old_text must not be empty"));
    }
    let count = content.matches(old).count();
    match count {
        1 => Ok(content.replacen(old, new, 1)),
        0 => Err(anyhow!("old_text not found (0 matches)")),
        n => Err(anyhow!(
            "old_text is ambiguous ({} matches); include more surrounding context",
            n
        )),
    }
}

/// Generate a unified diff between two strings
pub fn generate_diff(original: &str, modified: &str, filename: &str) -> String {
    let diff = TextDiff::from_lines(original, modified);

    diff.unified_diff()
        .context_radius(3)
        .header(&format!("a/{}", filename), &format!("b/{}", filename))
        .to_string()
}

// ═══════════════════════════════════════════════════════════════
// UNIFIED DIFF APPLICATION
// ═══════════════════════════════════════════════════════════════

#[derive(Debug)]
struct Hunk {
    old_start: usize, // 1-based
    lines: Vec<HunkLine>,
}

#[derive(Debug)]
enum HunkLine {
    Context(String),
    Delete(String),
    Insert(String),
}

/// Apply a unified diff to `original`. Context or deletion lines that don't
/// match the file produce an error naming the first failing hunk.
pub fn apply_unified_patch(original: &str, patch: &str) -> Result<String> {
    let hunks = parse_hunks(patch)?;
    if hunks.is_empty() {
        return Err(anyhow!("patch contains no hunks"));
    }

    let had_trailing_newline = original.is_empty() || original.ends_with('\n');
    let old_lines: Vec<&str> = original.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(old_lines.len());
    let mut cursor = 0usize; // index into old_lines

    for (i, hunk) in hunks.iter().enumerate() {
        let hunk_no = i + 1;
        let start = hunk.old_start.saturating_sub(1);
        if start < cursor {
            return Err(anyhow!("hunk {} overlaps a previous hunk", hunk_no));
        }
        if start > old_lines.len() {
            return Err(anyhow!(
                "hunk {} starts at line {} but the file has {} lines",
                hunk_no,
                hunk.old_start,
                old_lines.len()
            ));
        }

        // Copy unchanged region before the hunk.
        out.extend(old_lines[cursor..start].iter().map(|s| s.to_string()));
        cursor = start;

        for line in &hunk.lines {
            match line {
                HunkLine::Context(expected) => {
                    match old_lines.get(cursor) {
                        Some(actual) if *actual == expected => {
                            out.push(expected.clone());
                            cursor += 1;
                        }
                        Some(actual) => {
                            return Err(anyhow!(
                                "hunk {} context mismatch at line {}: expected {:?}, found {:?}",
                                hunk_no,
                                cursor + 1,
                                expected,
                                actual
                            ));
                        }
                        None => {
                            return Err(anyhow!(
                                "hunk {} context runs past end of file at line {}",
                                hunk_no,
                                cursor + 1
                            ));
                        }
                    }
                }
                HunkLine::Delete(expected) => match old_lines.get(cursor) {
                    Some(actual) if *actual == expected => {
                        cursor += 1;
                    }
                    Some(actual) => {
                        return Err(anyhow!(
                            "hunk {} deletion mismatch at line {}: expected {:?}, found {:?}",
                            hunk_no,
                            cursor + 1,
                            expected,
                            actual
                        ));
                    }
                    None => {
                        return Err(anyhow!(
                            "hunk {} deletes past end of file at line {}",
                            hunk_no,
                            cursor + 1
                        ));
                    }
                },
                HunkLine::Insert(text) => {
                    out.push(text.clone());
                }
            }
        }
    }

    // Copy the remainder.
    out.extend(old_lines[cursor..].iter().map(|s| s.to_string()));

    let mut result = out.join("\n");
    if had_trailing_newline && !result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

/// Parse `@@ -a,b +c,d @@` hunks; file headers (---/+++) and prose around
/// the diff are skipped.
fn parse_hunks(patch: &str) -> Result<Vec<Hunk>> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;

    for line in patch.lines() {
        if line.starts_with("@@") {
            if let Some(h) = current.take() {
                hunks.push(h);
            }
            let old_start = parse_hunk_header(line)
                .ok_or_else(|| anyhow!("malformed hunk header: {}", line))?;
            current = Some(Hunk {
                old_start,
                lines: Vec::new(),
            });
            continue;
        }

        let Some(hunk) = current.as_mut() else {
            // Headers / prose before the first hunk
            continue;
        };

        if line.starts_with("---") || line.starts_with("+++") {
            continue;
        }
        if line == "\\ No newline at end of file" {
            continue;
        }

        if let Some(rest) = line.strip_prefix('+') {
            hunk.lines.push(HunkLine::Insert(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('-') {
            hunk.lines.push(HunkLine::Delete(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix(' ') {
            hunk.lines.push(HunkLine::Context(rest.to_string()));
        } else if line.is_empty() {
            // Some producers emit empty context lines without the leading space
            hunk.lines.push(HunkLine::Context(String::new()));
        }
        // Anything else (trailing prose) ends up ignored, which matches
        // how models actually wrap diffs in commentary.
    }

    if let Some(h) = current.take() {
        hunks.push(h);
    }
    Ok(hunks)
}

/// Extract old_start from `@@ -old_start[,count] +new_start[,count] @@`.
fn parse_hunk_header(line: &str) -> Option<usize> {
    let after = line.strip_prefix("@@")?.trim_start();
    let old = after.strip_prefix('-')?;
    let end = old.find([',', ' '])?;
    old[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_binary() {
        assert!(looks_binary(b"ELF\x00\x01\x02"));
        assert!(!looks_binary(b"plain text\nwith lines\n"));
        assert!(!looks_binary(b""));
    }

    #[test]
    fn test_replace_exact_single() {
        let out = replace_exact("fn main() { foo(); }", "foo()", "bar()").unwrap();
        assert_eq!(out, "fn main() { bar(); }");
    }

    #[test]
    fn test_replace_exact_zero_matches() {
        let err = replace_exact("abc", "xyz", "q").unwrap_err();
        assert!(err.to_string().contains("0 matches"));
    }

    #[test]
    fn test_replace_exact_ambiguous() {
        let err = replace_exact("aa bb aa", "aa", "cc").unwrap_err();
        assert!(err.to_string().contains("2 matches"));
    }

    #[test]
    fn test_generate_diff() {
        let original = "line 1\nline 2\nline 3\n";
        let modified = "line 1\nline 2 modified\nline 3\n";

        let diff = generate_diff(original, modified, "test.txt");
        assert!(diff.contains("--- a/test.txt"));
        assert!(diff.contains("+++ b/test.txt"));
        assert!(diff.contains("-line 2"));
        assert!(diff.contains("+line 2 modified"));
    }

    #[test]
    fn test_apply_patch_simple() {
        let original = "one\ntwo\nthree\n";
        let patch = "--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n one\n-two\n+TWO\n three\n";
        let out = apply_unified_patch(original, patch).unwrap();
        assert_eq!(out, "one\nTWO\nthree\n");
    }

    #[test]
    fn test_apply_patch_insertion() {
        let original = "a\nc\n";
        let patch = "@@ -1,2 +1,3 @@\n a\n+b\n c\n";
        let out = apply_unified_patch(original, patch).unwrap();
        assert_eq!(out, "a\nb\nc\n");
    }

    #[test]
    fn test_apply_patch_deletion() {
        let original = "a\nb\nc\n";
        let patch = "@@ -1,3 +1,2 @@\n a\n-b\n c\n";
        let out = apply_unified_patch(original, patch).unwrap();
        assert_eq!(out, "a\nc\n");
    }

    #[test]
    fn test_apply_patch_context_mismatch_names_hunk() {
        let original = "a\nDIFFERENT\nc\n";
        let patch = "@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n";
        let err = apply_unified_patch(original, patch).unwrap_err();
        assert!(err.to_string().contains("hunk 1"));
    }

    #[test]
    fn test_apply_patch_multiple_hunks() {
        let original = "1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n";
        let patch = "@@ -1,2 +1,2 @@\n 1\n-2\n+two\n@@ -9,2 +9,2 @@\n 9\n-10\n+ten\n";
        let out = apply_unified_patch(original, patch).unwrap();
        assert_eq!(out, "1\ntwo\n3\n4\n5\n6\n7\n8\n9\nten\n");
    }

    #[test]
    fn test_apply_generated_diff_round_trip() {
        let original = "alpha\nbeta\ngamma\ndelta\n";
        let modified = "alpha\nbeta changed\ngamma\ndelta\nextra\n";
        let patch = generate_diff(original, modified, "f.txt");
        let out = apply_unified_patch(original, &patch).unwrap();
        assert_eq!(out, modified);
    }

    #[test]
    fn test_apply_patch_no_hunks() {
        assert!(apply_unified_patch("x\n", "this is not a diff").is_err());
    }

    #[test]
    fn test_apply_patch_second_hunk_mismatch_named() {
        let original = "1\n2\n3\n4\n5\n6\n7\n8\n9\nX\n";
        let patch = "@@ -1,2 +1,2 @@\n 1\n-2\n+two\n@@ -9,2 +9,2 @@\n 9\n-10\n+ten\n";
        let err = apply_unified_patch(original, patch).unwrap_err();
        assert!(err.to_string().contains("hunk 2"), "got: {}", err);
    }
}
