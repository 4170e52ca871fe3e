//! Unified-diff apply and produce.
//!
//! The applier is deliberately strict: context and deletion lines must match
//! the original exactly, and a malformed patch fails without touching the
//! file. Diff production uses `similar` with three lines of context.

use similar::TextDiff;

use memoh_core::{Error, Result};

/// Apply a unified-diff patch to `original`, returning the patched text.
pub fn apply_unified_patch(original: &str, patch: &str) -> Result<String> {
    let lines: Vec<&str> = original.split('\n').collect();
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut cursor = 0usize;
    let patch_lines: Vec<&str> = patch.split('\n').collect();
    let mut hunks_applied = 0usize;

    let mut i = 0usize;
    while i < patch_lines.len() {
        let line = patch_lines[i];
        if !line.starts_with("@@") {
            i += 1;
            continue;
        }

        let orig_start = parse_hunk_header(line)?;
        let target = orig_start.saturating_sub(1);
        if target > lines.len() {
            return Err(Error::PatchMismatch("patch out of range".to_string()));
        }
        if target > cursor {
            out.extend_from_slice(&lines[cursor..target]);
        }
        cursor = cursor.max(target);
        hunks_applied += 1;

        while i + 1 < patch_lines.len() {
            let next = patch_lines[i + 1];
            if next.starts_with("@@") {
                break;
            }
            i += 1;

            if next.is_empty() {
                if i == patch_lines.len() - 1 {
                    break;
                }
                return Err(Error::invalid("invalid patch line"));
            }
            let op = next.chars().next().unwrap_or('\0');
            let text = &next[op.len_utf8()..];
            match op {
                '\\' => continue,
                ' ' => {
                    if cursor >= lines.len() || lines[cursor] != text {
                        return Err(Error::PatchMismatch(
                            "patch context mismatch".to_string(),
                        ));
                    }
                    out.push(text);
                    cursor += 1;
                }
                '-' => {
                    if cursor >= lines.len() || lines[cursor] != text {
                        return Err(Error::PatchMismatch("patch delete mismatch".to_string()));
                    }
                    cursor += 1;
                }
                '+' => {
                    out.push(text);
                }
                _ => return Err(Error::invalid("invalid patch operation")),
            }
        }
        i += 1;
    }

    if hunks_applied == 0 {
        return Err(Error::invalid("patch contains no hunks"));
    }

    out.extend_from_slice(&lines[cursor..]);
    Ok(out.join("\n"))
}

/// Parse `@@ -orig_start[,orig_count] +new_start[,new_count] @@`, returning
/// the 1-indexed original start line.
fn parse_hunk_header(header: &str) -> Result<usize> {
    let trimmed = header.trim_start_matches("@@").trim();
    let rest = trimmed
        .strip_prefix('-')
        .ok_or_else(|| Error::invalid("invalid hunk header"))?;
    let orig_part = rest
        .split(' ')
        .next()
        .ok_or_else(|| Error::invalid("invalid hunk header"))?;
    let start_field = orig_part.split(',').next().unwrap_or_default();
    start_field
        .parse::<usize>()
        .map_err(|_| Error::invalid("invalid hunk header"))
}

/// Produce a unified diff between two texts with three lines of context and
/// `a<path>` / `b<path>` file headers.
pub fn unified_diff(container_path: &str, old: &str, new: &str) -> String {
    if old == new {
        return String::new();
    }
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(
            &format!("a{container_path}"),
            &format!("b{container_path}"),
        )
        .to_string()
}
