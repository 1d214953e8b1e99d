//! Three-way line-level content merge.
//!
//! Diffs base→ours and base→theirs, interleaves non-overlapping change
//! regions, and renders conflict markers where the regions overlap.

use arbor_diff::{diff_edits, split_lines, DiffAlgorithm, Edit, EditOp};

use crate::{ConflictStyle, ContentMergeResult};

/// Labels written into conflict markers.
#[derive(Debug, Clone)]
pub struct MergeLabels<'a> {
    pub base: &'a str,
    pub ours: &'a str,
    pub theirs: &'a str,
}

impl Default for MergeLabels<'_> {
    fn default() -> Self {
        Self {
            base: "BASE",
            ours: "OURS",
            theirs: "THEIRS",
        }
    }
}

/// Perform a three-way content merge.
pub fn merge_content(
    base: &[u8],
    ours: &[u8],
    theirs: &[u8],
    algorithm: DiffAlgorithm,
    style: ConflictStyle,
    labels: &MergeLabels<'_>,
) -> ContentMergeResult {
    // Equal sides need no merge.
    if ours == theirs {
        return ContentMergeResult::Clean(ours.to_vec());
    }
    // A side that matches the base concedes to the other.
    if base == ours {
        return ContentMergeResult::Clean(theirs.to_vec());
    }
    if base == theirs {
        return ContentMergeResult::Clean(ours.to_vec());
    }

    let base_lines = split_lines(base);
    let ours_lines = split_lines(ours);
    let theirs_lines = split_lines(theirs);

    let hunks_ours = collect_change_regions(&diff_edits(base, ours, algorithm));
    let hunks_theirs = collect_change_regions(&diff_edits(base, theirs, algorithm));

    merge_regions(
        &base_lines,
        &ours_lines,
        &theirs_lines,
        &hunks_ours,
        &hunks_theirs,
        style,
        labels,
    )
}

/// A contiguous region of changes relative to the base.
#[derive(Debug, Clone)]
struct ChangeRegion {
    /// Start line in base (0-indexed).
    base_start: usize,
    /// Number of lines removed from base.
    base_len: usize,
    /// Start line in the modified file (0-indexed).
    new_start: usize,
    /// Number of lines added.
    new_len: usize,
}

/// Collect contiguous change regions from an edit script.
fn collect_change_regions(edits: &[Edit]) -> Vec<ChangeRegion> {
    let mut regions = Vec::new();
    let mut i = 0;

    while i < edits.len() {
        if edits[i].op == EditOp::Equal {
            i += 1;
            continue;
        }

        let base_start = edits[i].old_index;
        let new_start = edits[i].new_index;
        let mut base_end = base_start;
        let mut new_end = new_start;

        while i < edits.len() && edits[i].op != EditOp::Equal {
            match edits[i].op {
                EditOp::Delete => base_end = edits[i].old_index + 1,
                EditOp::Insert => new_end = edits[i].new_index + 1,
                EditOp::Equal => unreachable!(),
            }
            i += 1;
        }

        regions.push(ChangeRegion {
            base_start,
            base_len: base_end - base_start,
            new_start,
            new_len: new_end - new_start,
        });
    }

    regions
}

/// Merge change regions from ours and theirs against the base.
fn merge_regions(
    base_lines: &[&[u8]],
    ours_lines: &[&[u8]],
    theirs_lines: &[&[u8]],
    hunks_ours: &[ChangeRegion],
    hunks_theirs: &[ChangeRegion],
    style: ConflictStyle,
    labels: &MergeLabels<'_>,
) -> ContentMergeResult {
    let mut output: Vec<u8> = Vec::new();
    let mut conflict_count = 0;

    let mut base_pos = 0;
    let mut oi = 0;
    let mut ti = 0;

    while oi < hunks_ours.len() || ti < hunks_theirs.len() {
        match (hunks_ours.get(oi), hunks_theirs.get(ti)) {
            (Some(o), Some(t)) => {
                let o_end = o.base_start + o.base_len;
                let t_end = t.base_start + t.base_len;

                if o_end < t.base_start || (o_end == t.base_start && o.base_start < t.base_start) {
                    // Ours comes strictly first.
                    emit_lines(&mut output, base_lines, base_pos, o.base_start - base_pos);
                    emit_lines(&mut output, ours_lines, o.new_start, o.new_len);
                    base_pos = o_end;
                    oi += 1;
                } else if t_end < o.base_start
                    || (t_end == o.base_start && t.base_start < o.base_start)
                {
                    // Theirs comes strictly first.
                    emit_lines(&mut output, base_lines, base_pos, t.base_start - base_pos);
                    emit_lines(&mut output, theirs_lines, t.new_start, t.new_len);
                    base_pos = t_end;
                    ti += 1;
                } else {
                    // Overlapping regions. Grow the base window until no
                    // further region from either side intrudes into it,
                    // then render each side's view of the whole window.
                    let overlap_start = o.base_start.min(t.base_start);
                    let mut overlap_end = o_end.max(t_end);
                    let mut o_hi = oi + 1;
                    let mut t_hi = ti + 1;
                    loop {
                        let mut grew = false;
                        while let Some(next) = hunks_ours.get(o_hi) {
                            if next.base_start >= overlap_end {
                                break;
                            }
                            overlap_end = overlap_end.max(next.base_start + next.base_len);
                            o_hi += 1;
                            grew = true;
                        }
                        while let Some(next) = hunks_theirs.get(t_hi) {
                            if next.base_start >= overlap_end {
                                break;
                            }
                            overlap_end = overlap_end.max(next.base_start + next.base_len);
                            t_hi += 1;
                            grew = true;
                        }
                        if !grew {
                            break;
                        }
                    }

                    let ours_content = side_view(
                        ours_lines,
                        &hunks_ours[oi..o_hi],
                        overlap_start,
                        overlap_end,
                    );
                    let theirs_content = side_view(
                        theirs_lines,
                        &hunks_theirs[ti..t_hi],
                        overlap_start,
                        overlap_end,
                    );

                    emit_lines(&mut output, base_lines, base_pos, overlap_start - base_pos);

                    if ours_content == theirs_content {
                        // Both sides made the same change.
                        output.extend_from_slice(&ours_content);
                    } else {
                        conflict_count += 1;
                        let base_content =
                            collect_lines(base_lines, overlap_start, overlap_end - overlap_start);
                        emit_conflict(
                            &mut output,
                            &ours_content,
                            &theirs_content,
                            &base_content,
                            style,
                            labels,
                        );
                    }

                    base_pos = overlap_end;
                    oi = o_hi;
                    ti = t_hi;
                }
            }
            (Some(o), None) => {
                emit_lines(&mut output, base_lines, base_pos, o.base_start - base_pos);
                emit_lines(&mut output, ours_lines, o.new_start, o.new_len);
                base_pos = o.base_start + o.base_len;
                oi += 1;
            }
            (None, Some(t)) => {
                emit_lines(&mut output, base_lines, base_pos, t.base_start - base_pos);
                emit_lines(&mut output, theirs_lines, t.new_start, t.new_len);
                base_pos = t.base_start + t.base_len;
                ti += 1;
            }
            (None, None) => unreachable!(),
        }
    }

    if base_pos < base_lines.len() {
        emit_lines(&mut output, base_lines, base_pos, base_lines.len() - base_pos);
    }

    if conflict_count > 0 {
        ContentMergeResult::Conflict {
            content: output,
            conflict_count,
        }
    } else {
        ContentMergeResult::Clean(output)
    }
}

/// Emit `count` lines starting at `start`. Lines keep their terminators.
fn emit_lines(output: &mut Vec<u8>, lines: &[&[u8]], start: usize, count: usize) {
    for line in lines.iter().skip(start).take(count) {
        output.extend_from_slice(line);
    }
}

/// Collect lines into one buffer.
fn collect_lines(lines: &[&[u8]], start: usize, count: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    for line in lines.iter().skip(start).take(count) {
        buf.extend_from_slice(line);
    }
    buf
}

/// One side's rendering of the base window `[overlap_start, overlap_end)`:
/// its change regions plus the unchanged lines between and around them,
/// mapped into the side's own line coordinates.
fn side_view(
    lines: &[&[u8]],
    regions: &[ChangeRegion],
    overlap_start: usize,
    overlap_end: usize,
) -> Vec<u8> {
    let first = &regions[0];
    let last = &regions[regions.len() - 1];
    let start = first.new_start + overlap_start - first.base_start;
    let end = last.new_start + last.new_len + (overlap_end - (last.base_start + last.base_len));
    collect_lines(lines, start, end - start)
}

/// Append a newline if the output does not already end on one, so marker
/// lines always start at a line boundary.
fn close_line(output: &mut Vec<u8>) {
    if output.last().is_some_and(|&b| b != b'\n') {
        output.push(b'\n');
    }
}

/// Render one conflict region.
fn emit_conflict(
    output: &mut Vec<u8>,
    ours_content: &[u8],
    theirs_content: &[u8],
    base_content: &[u8],
    style: ConflictStyle,
    labels: &MergeLabels<'_>,
) {
    output.extend_from_slice(b"<<<<<<< ");
    output.extend_from_slice(labels.ours.as_bytes());
    output.push(b'\n');

    output.extend_from_slice(ours_content);
    close_line(output);

    if style == ConflictStyle::Diff3 {
        output.extend_from_slice(b"||||||| ");
        output.extend_from_slice(labels.base.as_bytes());
        output.push(b'\n');
        output.extend_from_slice(base_content);
        close_line(output);
    }

    output.extend_from_slice(b"=======\n");

    output.extend_from_slice(theirs_content);
    close_line(output);

    output.extend_from_slice(b">>>>>>> ");
    output.extend_from_slice(labels.theirs.as_bytes());
    output.push(b'\n');
}
