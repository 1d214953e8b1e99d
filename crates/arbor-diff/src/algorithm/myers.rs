//! Myers diff.
//!
//! Eugene Myers' O(ND) difference algorithm ("An O(ND) Difference Algorithm
//! and Its Variations", 1986), over hashed byte lines.

use super::{line_hash, Edit, EditOp};

/// Compute a diff using the Myers algorithm.
///
/// `minimal` requests the absolute minimum edit script; the non-minimal mode
/// is free to take shortcuts, though both currently search the full space.
pub fn diff(old: &[&[u8]], new: &[&[u8]], minimal: bool) -> Vec<Edit> {
    if old.is_empty() && new.is_empty() {
        return Vec::new();
    }
    if old.is_empty() {
        return all_inserts(new.len(), 0, 0);
    }
    if new.is_empty() {
        return all_deletes(old.len(), 0, 0);
    }

    let old_hashes: Vec<u64> = old.iter().map(|l| line_hash(l)).collect();
    let new_hashes: Vec<u64> = new.iter().map(|l| line_hash(l)).collect();

    // Trim the common prefix and suffix; the search space shrinks to the
    // middle section.
    let prefix_len = old_hashes
        .iter()
        .zip(new_hashes.iter())
        .zip(old.iter().zip(new.iter()))
        .take_while(|((oh, nh), (a, b))| oh == nh && a == b)
        .count();

    let suffix_len = old_hashes[prefix_len..]
        .iter()
        .rev()
        .zip(new_hashes[prefix_len..].iter().rev())
        .zip(
            old[prefix_len..]
                .iter()
                .rev()
                .zip(new[prefix_len..].iter().rev()),
        )
        .take_while(|((oh, nh), (a, b))| oh == nh && a == b)
        .count();

    let old_mid = &old[prefix_len..old.len() - suffix_len];
    let new_mid = &new[prefix_len..new.len() - suffix_len];
    let old_h = &old_hashes[prefix_len..old_hashes.len() - suffix_len];
    let new_h = &new_hashes[prefix_len..new_hashes.len() - suffix_len];

    let inner = myers_inner(old_mid, new_mid, old_h, new_h, minimal);

    let mut edits = Vec::with_capacity(old.len() + new.len());
    for i in 0..prefix_len {
        edits.push(Edit {
            op: EditOp::Equal,
            old_index: i,
            new_index: i,
        });
    }
    for edit in inner {
        edits.push(Edit {
            op: edit.op,
            old_index: edit.old_index + prefix_len,
            new_index: edit.new_index + prefix_len,
        });
    }
    for i in 0..suffix_len {
        edits.push(Edit {
            op: EditOp::Equal,
            old_index: old.len() - suffix_len + i,
            new_index: new.len() - suffix_len + i,
        });
    }

    edits
}

fn all_inserts(count: usize, old_index: usize, new_base: usize) -> Vec<Edit> {
    (0..count)
        .map(|j| Edit {
            op: EditOp::Insert,
            old_index,
            new_index: new_base + j,
        })
        .collect()
}

fn all_deletes(count: usize, old_base: usize, new_index: usize) -> Vec<Edit> {
    (0..count)
        .map(|i| Edit {
            op: EditOp::Delete,
            old_index: old_base + i,
            new_index,
        })
        .collect()
}

/// Core Myers search over the pre-trimmed middle.
fn myers_inner(
    old: &[&[u8]],
    new: &[&[u8]],
    old_h: &[u64],
    new_h: &[u64],
    _minimal: bool,
) -> Vec<Edit> {
    let n = old.len();
    let m = new.len();

    if n == 0 && m == 0 {
        return Vec::new();
    }
    if n == 0 {
        return all_inserts(m, 0, 0);
    }
    if m == 0 {
        return all_deletes(n, 0, 0);
    }

    let max_d = n + m;
    let v_size = 2 * max_d + 1;
    let v_offset = max_d as isize;

    // v[k + offset] = furthest reaching x on diagonal k. The full trace is
    // kept for backtracking.
    let mut trace: Vec<Vec<usize>> = Vec::new();
    let mut v = vec![0usize; v_size];

    'outer: for d in 0..=max_d {
        let mut v_next = v.clone();

        let k_min = -(d as isize);
        let k_max = d as isize;

        let mut k = k_min;
        while k <= k_max {
            let idx = (k + v_offset) as usize;

            let mut x = if k == k_min
                || (k != k_max
                    && v[((k - 1) + v_offset) as usize] < v[((k + 1) + v_offset) as usize])
            {
                // down (insert)
                v[((k + 1) + v_offset) as usize]
            } else {
                // right (delete)
                v[((k - 1) + v_offset) as usize] + 1
            };

            let mut y = (x as isize - k) as usize;

            // Follow the snake.
            while x < n && y < m && old_h[x] == new_h[y] && old[x] == new[y] {
                x += 1;
                y += 1;
            }

            v_next[idx] = x;

            if x >= n && y >= m {
                trace.push(v_next);
                break 'outer;
            }

            k += 2;
        }

        trace.push(v_next);
        v = trace.last().unwrap().clone();
    }

    backtrack(&trace, n, m, v_offset)
}

/// Walk the trace backwards to produce the edit script.
fn backtrack(trace: &[Vec<usize>], n: usize, m: usize, v_offset: isize) -> Vec<Edit> {
    let mut edits = Vec::new();
    let mut x = n;
    let mut y = m;

    for d in (0..trace.len()).rev() {
        let k = x as isize - y as isize;

        let prev_k = if d == 0 {
            k
        } else if k == -(d as isize)
            || (k != d as isize
                && trace[d - 1][((k - 1) + v_offset) as usize]
                    < trace[d - 1][((k + 1) + v_offset) as usize])
        {
            k + 1 // came from down (insert)
        } else {
            k - 1 // came from right (delete)
        };

        let prev_x = if d == 0 {
            0
        } else {
            trace[d - 1][(prev_k + v_offset) as usize]
        };
        let prev_y = (prev_x as isize - prev_k) as usize;

        // Snake: equal lines from the end back to the midpoint.
        while x > prev_x && y > prev_y && x > 0 && y > 0 {
            x -= 1;
            y -= 1;
            edits.push(Edit {
                op: EditOp::Equal,
                old_index: x,
                new_index: y,
            });
        }

        if d > 0 {
            if prev_k == k + 1 {
                if y > 0 {
                    y -= 1;
                    edits.push(Edit {
                        op: EditOp::Insert,
                        old_index: x,
                        new_index: y,
                    });
                }
            } else if x > 0 {
                x -= 1;
                edits.push(Edit {
                    op: EditOp::Delete,
                    old_index: x,
                    new_index: y,
                });
            }
        }
    }

    edits.reverse();
    edits
}
