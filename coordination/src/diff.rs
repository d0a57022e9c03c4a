//! Line-level diff between two model outputs.
//!
//! Classic LCS over `split('\n')`: an O(|a|·|b|) table, a backtrack that
//! recovers one longest common subsequence, then a three-pointer walk over
//! `a`, `b` and the LCS. When both sides mismatch at once the walk emits
//! `Removed` before `Added`, so identical inputs always render identically.
//!
//! Comparison is line-literal: trailing whitespace or reordered lines count
//! as changes. Two texts are identical for consensus purposes iff
//! [`diff_summary`] reports zero additions and zero deletions.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    Same,
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub kind: DiffKind,
    pub content: String,
}

impl DiffLine {
    fn new(kind: DiffKind, content: &str) -> Self {
        Self {
            kind,
            content: content.to_string(),
        }
    }
}

/// Count of added and removed lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub additions: usize,
    pub deletions: usize,
}

impl DiffSummary {
    pub fn is_identical(&self) -> bool {
        self.additions == 0 && self.deletions == 0
    }
}

/// Diff `a` (old) against `b` (new).
pub fn diff(a: &str, b: &str) -> Vec<DiffLine> {
    let old: Vec<&str> = a.split('\n').collect();
    let new: Vec<&str> = b.split('\n').collect();
    let lcs = longest_common_subsequence(&old, &new);

    let mut out = Vec::with_capacity(old.len().max(new.len()));
    let (mut i, mut j, mut k) = (0, 0, 0);

    while i < old.len() || j < new.len() {
        let anchor = lcs.get(k).copied();
        let old_line = old.get(i).copied();
        let new_line = new.get(j).copied();

        match (old_line, new_line, anchor) {
            (Some(x), Some(y), Some(c)) if x == c && y == c => {
                out.push(DiffLine::new(DiffKind::Same, x));
                i += 1;
                j += 1;
                k += 1;
            }
            (Some(x), _, _) if anchor != Some(x) => {
                out.push(DiffLine::new(DiffKind::Removed, x));
                i += 1;
            }
            (_, Some(y), _) if anchor != Some(y) => {
                out.push(DiffLine::new(DiffKind::Added, y));
                j += 1;
            }
            // Only reachable if the LCS were not a subsequence of both inputs.
            _ => break,
        }
    }
    out
}

/// Additions and deletions of [`diff`]`(a, b)`.
pub fn diff_summary(a: &str, b: &str) -> DiffSummary {
    summarize(&diff(a, b))
}

/// Count additions and deletions in an existing diff.
pub fn summarize(lines: &[DiffLine]) -> DiffSummary {
    lines
        .iter()
        .fold(DiffSummary::default(), |mut acc, line| {
            match line.kind {
                DiffKind::Added => acc.additions += 1,
                DiffKind::Removed => acc.deletions += 1,
                DiffKind::Same => {}
            }
            acc
        })
}

/// Render a diff with `+`, `-` and space prefixes for log output.
pub fn render_diff(lines: &[DiffLine]) -> String {
    lines
        .iter()
        .map(|line| {
            let prefix = match line.kind {
                DiffKind::Same => ' ',
                DiffKind::Added => '+',
                DiffKind::Removed => '-',
            };
            format!("{prefix} {}", line.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn longest_common_subsequence<'a>(a: &[&'a str], b: &[&str]) -> Vec<&'a str> {
    let (n, m) = (a.len(), b.len());
    // table[i][j] = LCS length of a[i..] and b[j..]
    let mut table = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut lcs = Vec::with_capacity(table[0][0]);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            lcs.push(a[i]);
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    lcs
}
