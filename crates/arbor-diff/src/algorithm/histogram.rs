//! Histogram diff.
//!
//! A patience variant that pivots on the lowest-occurrence line shared by
//! both sides, recursing on the segments around it. Falls back to Myers at
//! excessive recursion depth.

use std::collections::HashMap;

use super::{line_hash, Edit, EditOp};

/// Maximum recursion depth before falling back to Myers.
const MAX_RECURSION: usize = 64;

/// Compute a diff using the histogram algorithm.
pub fn diff(old: &[&[u8]], new: &[&[u8]]) -> Vec<Edit> {
    let mut edits = Vec::new();
    recurse(old, new, 0, 0, &mut edits, 0);
    edits
}

fn recurse(
    old: &[&[u8]],
    new: &[&[u8]],
    old_offset: usize,
    new_offset: usize,
    edits: &mut Vec<Edit>,
    depth: usize,
) {
    if old.is_empty() && new.is_empty() {
        return;
    }

    if depth >= MAX_RECURSION {
        for mut e in super::myers::diff(old, new, false) {
            e.old_index += old_offset;
            e.new_index += new_offset;
            edits.push(e);
        }
        return;
    }

    if old.is_empty() {
        for j in 0..new.len() {
            edits.push(Edit {
                op: EditOp::Insert,
                old_index: old_offset,
                new_index: new_offset + j,
            });
        }
        return;
    }
    if new.is_empty() {
        for i in 0..old.len() {
            edits.push(Edit {
                op: EditOp::Delete,
                old_index: old_offset + i,
                new_index: new_offset,
            });
        }
        return;
    }

    let prefix_len = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let suffix_len = old[prefix_len..]
        .iter()
        .rev()
        .zip(new[prefix_len..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    for i in 0..prefix_len {
        edits.push(Edit {
            op: EditOp::Equal,
            old_index: old_offset + i,
            new_index: new_offset + i,
        });
    }

    let old_mid = &old[prefix_len..old.len() - suffix_len];
    let new_mid = &new[prefix_len..new.len() - suffix_len];
    let mid_old_offset = old_offset + prefix_len;
    let mid_new_offset = new_offset + prefix_len;

    match (old_mid.is_empty(), new_mid.is_empty()) {
        (true, true) => {}
        (true, false) => {
            for j in 0..new_mid.len() {
                edits.push(Edit {
                    op: EditOp::Insert,
                    old_index: mid_old_offset,
                    new_index: mid_new_offset + j,
                });
            }
        }
        (false, true) => {
            for i in 0..old_mid.len() {
                edits.push(Edit {
                    op: EditOp::Delete,
                    old_index: mid_old_offset + i,
                    new_index: mid_new_offset,
                });
            }
        }
        (false, false) => {
            split_on_pivot(old_mid, new_mid, mid_old_offset, mid_new_offset, edits, depth);
        }
    }

    for i in 0..suffix_len {
        edits.push(Edit {
            op: EditOp::Equal,
            old_index: old.len() - suffix_len + old_offset + i,
            new_index: new.len() - suffix_len + new_offset + i,
        });
    }
}

/// Find the lowest-occurrence shared line and recurse around it.
fn split_on_pivot(
    old: &[&[u8]],
    new: &[&[u8]],
    old_offset: usize,
    new_offset: usize,
    edits: &mut Vec<Edit>,
    depth: usize,
) {
    // Histogram of old lines: hash -> (count, indices).
    let mut histogram: HashMap<u64, (usize, Vec<usize>)> = HashMap::new();
    for (i, line) in old.iter().enumerate() {
        let slot = histogram.entry(line_hash(line)).or_insert((0, Vec::new()));
        slot.0 += 1;
        slot.1.push(i);
    }

    let mut best_count = usize::MAX;
    let mut best: Option<(usize, usize)> = None;

    for (j, line) in new.iter().enumerate() {
        if let Some((count, indices)) = histogram.get(&line_hash(line)) {
            for &oi in indices {
                // Content check guards against hash collisions.
                if old[oi] == *line && *count < best_count {
                    best_count = *count;
                    best = Some((oi, j));
                }
            }
        }
    }

    match best {
        Some((oi, ni)) => {
            recurse(&old[..oi], &new[..ni], old_offset, new_offset, edits, depth + 1);

            edits.push(Edit {
                op: EditOp::Equal,
                old_index: old_offset + oi,
                new_index: new_offset + ni,
            });

            recurse(
                &old[oi + 1..],
                &new[ni + 1..],
                old_offset + oi + 1,
                new_offset + ni + 1,
                edits,
                depth + 1,
            );
        }
        None => {
            // No shared line: the whole section is a replacement.
            for i in 0..old.len() {
                edits.push(Edit {
                    op: EditOp::Delete,
                    old_index: old_offset + i,
                    new_index: new_offset,
                });
            }
            for j in 0..new.len() {
                edits.push(Edit {
                    op: EditOp::Insert,
                    old_index: old_offset + old.len(),
                    new_index: new_offset + j,
                });
            }
        }
    }
}
