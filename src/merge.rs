use anyhow::{Context, Result};
use similar::{DiffOp, TextDiff};

/// Inputs larger than this are refused; the caller forks instead.
pub const MAX_MERGE_BYTES: usize = 2 * 1024 * 1024;

/// A base span both sides rewrote to different text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictSpan {
    pub base_start: usize,
    pub base_end: usize,
    pub local: String,
    pub remote: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged(Vec<u8>),
    Conflicted(Vec<ConflictSpan>),
}

/// One side's rewrite of a base line range. Zero-width ranges are pure
/// insertions.
#[derive(Debug, Clone)]
struct Hunk {
    base_start: usize,
    base_end: usize,
    lines: Vec<String>,
}

/// Line-level 3-way merge. Whitespace is significant and line endings are
/// preserved as found. Errors mean the inputs are unmergeable (not UTF-8,
/// or too large); a `Conflicted` outcome means the texts genuinely diverge.
pub fn three_way_merge(base: &[u8], local: &[u8], remote: &[u8]) -> Result<MergeOutcome> {
    for (name, bytes) in [("base", base), ("local", local), ("remote", remote)] {
        if bytes.len() > MAX_MERGE_BYTES {
            anyhow::bail!("{name} exceeds merge size limit ({} bytes)", bytes.len());
        }
    }
    let base_s = std::str::from_utf8(base).context("base is not valid utf-8")?;
    let local_s = std::str::from_utf8(local).context("local is not valid utf-8")?;
    let remote_s = std::str::from_utf8(remote).context("remote is not valid utf-8")?;

    let base_lines = split_lines(base_s);
    let local_hunks = hunks_against_base(&base_lines, &split_lines(local_s));
    let remote_hunks = hunks_against_base(&base_lines, &split_lines(remote_s));

    Ok(merge_hunks(&base_lines, &local_hunks, &remote_hunks))
}

fn merge_hunks(base: &[&str], local: &[Hunk], remote: &[Hunk]) -> MergeOutcome {
    let mut out = String::new();
    let mut conflicts = Vec::new();
    let mut pos = 0usize;
    let (mut li, mut ri) = (0usize, 0usize);

    while li < local.len() || ri < remote.len() {
        let lnext = local.get(li);
        let rnext = remote.get(ri);

        let overlapping = match (lnext, rnext) {
            (Some(l), Some(r)) => {
                (l.base_start < r.base_end && r.base_start < l.base_end)
                    || l.base_start == r.base_start
            }
            _ => false,
        };

        if overlapping {
            let l = lnext.unwrap();
            let r = rnext.unwrap();
            let span_start = l.base_start.min(r.base_start);
            let mut span_end = l.base_end.max(r.base_end);
            let (l_from, r_from) = (li, ri);
            li += 1;
            ri += 1;

            // Chain-expand: later hunks from either side that reach into the
            // combined span belong to the same unstable region.
            loop {
                let mut grew = false;
                if let Some(h) = local.get(li) {
                    if h.base_start < span_end {
                        span_end = span_end.max(h.base_end);
                        li += 1;
                        grew = true;
                    }
                }
                if let Some(h) = remote.get(ri) {
                    if h.base_start < span_end {
                        span_end = span_end.max(h.base_end);
                        ri += 1;
                        grew = true;
                    }
                }
                if !grew {
                    break;
                }
            }

            push_lines(&mut out, base, pos, span_start);
            let l_text = apply_span(base, &local[l_from..li], span_start, span_end);
            let r_text = apply_span(base, &remote[r_from..ri], span_start, span_end);
            let base_text: String = base[span_start..span_end].concat();

            if l_text == r_text {
                // Same rewrite on both sides (covers equal same-position
                // inserts: emitted once, remote ordering moot).
                out.push_str(&l_text);
            } else if l_text == base_text {
                out.push_str(&r_text);
            } else if r_text == base_text {
                out.push_str(&l_text);
            } else {
                conflicts.push(ConflictSpan {
                    base_start: span_start,
                    base_end: span_end,
                    local: l_text,
                    remote: r_text,
                });
            }
            pos = span_end;
        } else {
            let take_local = match (lnext, rnext) {
                (Some(l), Some(r)) => l.base_start < r.base_start,
                (Some(_), None) => true,
                _ => false,
            };
            let hunk = if take_local {
                li += 1;
                lnext.unwrap()
            } else {
                ri += 1;
                rnext.unwrap()
            };
            push_lines(&mut out, base, pos, hunk.base_start);
            for line in &hunk.lines {
                out.push_str(line);
            }
            pos = hunk.base_end;
        }
    }

    push_lines(&mut out, base, pos, base.len());

    if conflicts.is_empty() {
        MergeOutcome::Merged(out.into_bytes())
    } else {
        MergeOutcome::Conflicted(conflicts)
    }
}

/// Split keeping line terminators so reassembly is byte-exact.
fn split_lines(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, b) in s.bytes().enumerate() {
        if b == b'\n' {
            out.push(&s[start..=i]);
            start = i + 1;
        }
    }
    if start < s.len() {
        out.push(&s[start..]);
    }
    out
}

fn hunks_against_base(base: &[&str], side: &[&str]) -> Vec<Hunk> {
    let diff = TextDiff::from_slices(base, side);
    let mut out = Vec::new();
    for op in diff.ops() {
        match *op {
            DiffOp::Equal { .. } => {}
            DiffOp::Delete {
                old_index, old_len, ..
            } => out.push(Hunk {
                base_start: old_index,
                base_end: old_index + old_len,
                lines: Vec::new(),
            }),
            DiffOp::Insert {
                old_index,
                new_index,
                new_len,
            } => out.push(Hunk {
                base_start: old_index,
                base_end: old_index,
                lines: collect(side, new_index, new_len),
            }),
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => out.push(Hunk {
                base_start: old_index,
                base_end: old_index + old_len,
                lines: collect(side, new_index, new_len),
            }),
        }
    }
    out
}

fn collect(side: &[&str], from: usize, len: usize) -> Vec<String> {
    side[from..from + len].iter().map(|s| s.to_string()).collect()
}

fn push_lines(out: &mut String, base: &[&str], from: usize, to: usize) {
    for line in &base[from..to] {
        out.push_str(line);
    }
}

/// One side's text for `base[span_start..span_end]` with its hunks applied.
fn apply_span(base: &[&str], hunks: &[Hunk], span_start: usize, span_end: usize) -> String {
    let mut s = String::new();
    let mut pos = span_start;
    for h in hunks {
        for line in &base[pos..h.base_start] {
            s.push_str(line);
        }
        for line in &h.lines {
            s.push_str(line);
        }
        pos = h.base_end;
    }
    for line in &base[pos..span_end] {
        s.push_str(line);
    }
    s
}
