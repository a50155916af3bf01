//! Diff chunking: prompt-sized units with deterministic ids.
//!
//! Packing rules:
//! - files are packed greedily, in order, under the token budget;
//! - a file over the budget splits at hunk boundaries;
//! - a hunk over the budget splits at line boundaries, but a deletion run
//!   followed by its replacement insertion run is never torn apart;
//! - binary/submodule/hunkless changes are folded into one listing unit.
//!
//! Chunk ids hash `(review, ordinal, payload digest)`, so retries over the
//! same diff produce identical ids.

use sha2::{Digest, Sha256};

use llm_router::estimate_tokens;
use review_domain::{DiffFile, DiffHunk, DiffLine, FileStatus};

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub target_tokens: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        ChunkerConfig {
            target_tokens: 3000,
        }
    }
}

/// One prompt-sized slice of the diff.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub review_id: i64,
    pub ordinal: u32,
    pub files: Vec<String>,
    pub text_budget_tokens: u32,
    pub payload: String,
}

struct Unit {
    files: Vec<String>,
    text: String,
    tokens: u32,
}

/// Split a diff into ordered chunks. Empty diff ⇒ no chunks; a diff of
/// only binary/hunkless changes ⇒ one synthetic listing chunk.
pub fn chunk_diff(review_id: i64, files: &[DiffFile], cfg: &ChunkerConfig) -> Vec<Chunk> {
    let budget = cfg.target_tokens.max(64);
    let mut units: Vec<Unit> = Vec::new();
    let mut listed: Vec<&DiffFile> = Vec::new();

    for file in files {
        if file.is_binary || file.hunks.is_empty() {
            listed.push(file);
            continue;
        }
        let text = render_file(file);
        let tokens = estimate_tokens(&text);
        if tokens <= budget {
            units.push(Unit {
                files: vec![file.path.clone()],
                text,
                tokens,
            });
        } else {
            units.extend(split_file(file, budget));
        }
    }

    if !listed.is_empty() {
        let text = render_listing(&listed);
        units.push(Unit {
            tokens: estimate_tokens(&text),
            files: listed.iter().map(|f| f.path.clone()).collect(),
            text,
        });
    }

    pack(review_id, units, budget)
}

/// Render the whole diff as one prompt payload (analysis jobs use this when
/// it fits their single-call budget).
pub fn render_diff(files: &[DiffFile]) -> String {
    let mut out = String::new();
    let mut listed: Vec<&DiffFile> = Vec::new();
    for file in files {
        if file.is_binary || file.hunks.is_empty() {
            listed.push(file);
        } else {
            out.push_str(&render_file(file));
        }
    }
    if !listed.is_empty() {
        out.push_str(&render_listing(&listed));
    }
    out
}

/// Short digest of the change set, handed to every chunk's prompt as
/// cross-chunk context.
pub fn context_digest(files: &[DiffFile]) -> String {
    let added: u32 = files.iter().map(|f| f.added_lines).sum();
    let deleted: u32 = files.iter().map(|f| f.deleted_lines).sum();
    let mut out = format!(
        "{} files changed, +{added} -{deleted} lines:\n",
        files.len()
    );
    for f in files {
        out.push_str(&format!("- {} ({})\n", f.path, status_str(f.status)));
    }
    out
}

// --------------------------- rendering ------------------------------------

fn status_str(status: FileStatus) -> &'static str {
    match status {
        FileStatus::Added => "added",
        FileStatus::Modified => "modified",
        FileStatus::Deleted => "deleted",
        FileStatus::Renamed => "renamed",
    }
}

fn file_header(file: &DiffFile) -> String {
    format!(
        "### {} ({}) +{} -{}\n",
        file.path,
        status_str(file.status),
        file.added_lines,
        file.deleted_lines
    )
}

fn hunk_header(hunk: &DiffHunk) -> String {
    format!(
        "@@ -{},{} +{},{} @@\n",
        hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count
    )
}

fn render_line(line: &DiffLine) -> String {
    match line {
        DiffLine::Added { content, .. } => format!("+{content}\n"),
        DiffLine::Removed { content, .. } => format!("-{content}\n"),
        DiffLine::Context { content, .. } => format!(" {content}\n"),
    }
}

fn render_file(file: &DiffFile) -> String {
    let mut out = file_header(file);
    for hunk in &file.hunks {
        out.push_str(&hunk_header(hunk));
        for line in &hunk.lines {
            out.push_str(&render_line(line));
        }
    }
    out
}

fn render_listing(files: &[&DiffFile]) -> String {
    let mut out = String::from("### Binary or metadata-only changes\n");
    for f in files {
        out.push_str(&format!("- {} ({})\n", f.path, status_str(f.status)));
    }
    out
}

// --------------------------- splitting ------------------------------------

fn split_file(file: &DiffFile, budget: u32) -> Vec<Unit> {
    let header = file_header(file);
    let mut units = Vec::new();
    let mut current = header.clone();
    let mut current_tokens = estimate_tokens(&current);

    let mut flush = |text: &mut String, tokens: &mut u32, units: &mut Vec<Unit>| {
        if *tokens > estimate_tokens(&header) {
            units.push(Unit {
                files: vec![file.path.clone()],
                text: std::mem::replace(text, header.clone()),
                tokens: *tokens,
            });
            *tokens = estimate_tokens(&header);
        }
    };

    for hunk in &file.hunks {
        let rendered = {
            let mut s = hunk_header(hunk);
            for line in &hunk.lines {
                s.push_str(&render_line(line));
            }
            s
        };
        let hunk_tokens = estimate_tokens(&rendered);

        if hunk_tokens > budget {
            // Oversized hunk: emit what we have, then split it line-wise.
            flush(&mut current, &mut current_tokens, &mut units);
            units.extend(split_hunk(file, hunk, budget));
            continue;
        }
        if current_tokens + hunk_tokens > budget {
            flush(&mut current, &mut current_tokens, &mut units);
        }
        current.push_str(&rendered);
        current_tokens += hunk_tokens;
    }
    flush(&mut current, &mut current_tokens, &mut units);
    units
}

/// Line-level split of one oversized hunk. Lines are grouped into atoms
/// first: a run of removals immediately followed by a run of insertions is
/// one atom, so a `-`/`+` replacement pair cannot land in different chunks.
fn split_hunk(file: &DiffFile, hunk: &DiffHunk, budget: u32) -> Vec<Unit> {
    let prefix = format!("{}{}", file_header(file), hunk_header(hunk));
    let prefix_tokens = estimate_tokens(&prefix);

    let mut units = Vec::new();
    let mut current = prefix.clone();
    let mut current_tokens = prefix_tokens;

    for atom in atoms(&hunk.lines) {
        let rendered: String = atom.iter().map(|l| render_line(l)).collect();
        let atom_tokens = estimate_tokens(&rendered);
        if current_tokens + atom_tokens > budget && current_tokens > prefix_tokens {
            units.push(Unit {
                files: vec![file.path.clone()],
                text: std::mem::replace(&mut current, prefix.clone()),
                tokens: current_tokens,
            });
            current_tokens = prefix_tokens;
        }
        current.push_str(&rendered);
        current_tokens += atom_tokens;
    }
    if current_tokens > prefix_tokens {
        units.push(Unit {
            files: vec![file.path.clone()],
            text: current,
            tokens: current_tokens,
        });
    }
    units
}

fn atoms(lines: &[DiffLine]) -> Vec<Vec<&DiffLine>> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        match lines[i] {
            DiffLine::Removed { .. } => {
                let mut j = i;
                while j < lines.len() && matches!(lines[j], DiffLine::Removed { .. }) {
                    j += 1;
                }
                let mut k = j;
                while k < lines.len() && matches!(lines[k], DiffLine::Added { .. }) {
                    k += 1;
                }
                out.push(lines[i..k].iter().collect());
                i = k;
            }
            _ => {
                out.push(vec![&lines[i]]);
                i += 1;
            }
        }
    }
    out
}

// --------------------------- packing --------------------------------------

fn pack(review_id: i64, units: Vec<Unit>, budget: u32) -> Vec<Chunk> {
    let mut chunks: Vec<(Vec<String>, String, u32)> = Vec::new();
    let mut cur_files: Vec<String> = Vec::new();
    let mut cur_text = String::new();
    let mut cur_tokens = 0u32;

    for unit in units {
        if cur_tokens > 0 && cur_tokens + unit.tokens > budget {
            chunks.push((
                std::mem::take(&mut cur_files),
                std::mem::take(&mut cur_text),
                cur_tokens,
            ));
            cur_tokens = 0;
        }
        for f in unit.files {
            if !cur_files.contains(&f) {
                cur_files.push(f);
            }
        }
        cur_text.push_str(&unit.text);
        cur_tokens += unit.tokens;
    }
    if cur_tokens > 0 {
        chunks.push((cur_files, cur_text, cur_tokens));
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(ordinal, (files, payload, _))| {
            let ordinal = ordinal as u32;
            Chunk {
                id: chunk_id(review_id, ordinal, &payload),
                review_id,
                ordinal,
                files,
                text_budget_tokens: budget,
                payload,
            }
        })
        .collect()
}

fn chunk_id(review_id: i64, ordinal: u32, payload: &str) -> String {
    let content_digest = hex_digest(payload.as_bytes());
    hex_digest(format!("{review_id}:{ordinal}:{content_digest}").as_bytes())
}

fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_add(n: u32, text: &str) -> DiffLine {
        DiffLine::Added {
            new_line: n,
            content: text.to_string(),
        }
    }

    fn line_del(n: u32, text: &str) -> DiffLine {
        DiffLine::Removed {
            old_line: n,
            content: text.to_string(),
        }
    }

    fn small_file(path: &str) -> DiffFile {
        DiffFile {
            path: path.to_string(),
            status: FileStatus::Modified,
            added_lines: 2,
            deleted_lines: 0,
            is_binary: false,
            hunks: vec![DiffHunk {
                old_start: 1,
                old_count: 0,
                new_start: 1,
                new_count: 2,
                lines: vec![line_add(1, "let a = 1;"), line_add(2, "let b = 2;")],
            }],
        }
    }

    fn big_file(path: &str, pairs: u32) -> DiffFile {
        let mut lines = Vec::new();
        for i in 0..pairs {
            lines.push(line_del(i + 1, &format!("old_value_number_{i} = compute_old({i});")));
            lines.push(line_add(i + 1, &format!("new_value_number_{i} = compute_new({i});")));
        }
        DiffFile {
            path: path.to_string(),
            status: FileStatus::Modified,
            added_lines: pairs,
            deleted_lines: pairs,
            is_binary: false,
            hunks: vec![DiffHunk {
                old_start: 1,
                old_count: pairs,
                new_start: 1,
                new_count: pairs,
                lines,
            }],
        }
    }

    #[test]
    fn empty_diff_yields_no_chunks() {
        let cfg = ChunkerConfig::default();
        assert!(chunk_diff(1, &[], &cfg).is_empty());
    }

    #[test]
    fn small_files_pack_together() {
        let cfg = ChunkerConfig::default();
        let files = vec![small_file("a.rs"), small_file("b.rs")];
        let chunks = chunk_diff(1, &files, &cfg);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].files, vec!["a.rs".to_string(), "b.rs".to_string()]);
        assert!(chunks[0].payload.contains("### a.rs"));
        assert!(chunks[0].payload.contains("### b.rs"));
    }

    #[test]
    fn chunk_ids_are_deterministic() {
        let cfg = ChunkerConfig::default();
        let files = vec![small_file("a.rs"), big_file("b.rs", 400)];
        let first = chunk_diff(42, &files, &cfg);
        let second = chunk_diff(42, &files, &cfg);
        assert_eq!(
            first.iter().map(|c| c.id.clone()).collect::<Vec<_>>(),
            second.iter().map(|c| c.id.clone()).collect::<Vec<_>>()
        );
        // A different review produces different ids over the same diff.
        let other = chunk_diff(43, &files, &cfg);
        assert_ne!(first[0].id, other[0].id);
    }

    #[test]
    fn oversized_file_splits_under_budget() {
        let cfg = ChunkerConfig {
            target_tokens: 500,
        };
        // Roughly 10x the budget worth of diff text.
        let files = vec![big_file("huge.rs", 220)];
        let chunks = chunk_diff(7, &files, &cfg);
        assert!(chunks.len() >= 6, "expected a multi-way split, got {}", chunks.len());
        for c in &chunks {
            assert!(
                estimate_tokens(&c.payload) <= cfg.target_tokens,
                "chunk {} over budget",
                c.ordinal
            );
        }
        let ordinals: Vec<u32> = chunks.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, (0..chunks.len() as u32).collect::<Vec<_>>());
    }

    #[test]
    fn replacement_pairs_stay_together() {
        let cfg = ChunkerConfig {
            target_tokens: 120,
        };
        let chunks = chunk_diff(7, &[big_file("paired.rs", 60)], &cfg);
        assert!(chunks.len() > 1);
        for c in &chunks {
            let dels = c.payload.lines().filter(|l| l.starts_with('-')).count();
            let adds = c.payload.lines().filter(|l| l.starts_with('+')).count();
            assert_eq!(dels, adds, "chunk {} tore a -/+ pair apart", c.ordinal);
        }
    }

    #[test]
    fn all_binary_diff_yields_one_listing_chunk() {
        let cfg = ChunkerConfig::default();
        let files = vec![
            DiffFile {
                path: "logo.png".into(),
                status: FileStatus::Modified,
                added_lines: 0,
                deleted_lines: 0,
                is_binary: true,
                hunks: vec![],
            },
            DiffFile {
                path: "vendor.bin".into(),
                status: FileStatus::Added,
                added_lines: 0,
                deleted_lines: 0,
                is_binary: true,
                hunks: vec![],
            },
        ];
        let chunks = chunk_diff(1, &files, &cfg);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].payload.contains("logo.png"));
        assert!(chunks[0].payload.contains("vendor.bin"));
        assert_eq!(chunks[0].files.len(), 2);
    }

    #[test]
    fn digest_lists_every_file() {
        let files = vec![small_file("a.rs"), small_file("b.rs")];
        let digest = context_digest(&files);
        assert!(digest.contains("2 files changed"));
        assert!(digest.contains("- a.rs (modified)"));
        assert!(digest.contains("- b.rs (modified)"));
    }
}
