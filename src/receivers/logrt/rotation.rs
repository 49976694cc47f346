// SPDX-License-Identifier: Apache-2.0

//! Reconciling a fresh scan with the files tracked in the previous cycle.
//!
//! Every previously tracked file is related to the candidates that could be the same physical
//! file. Links are scored (identity, then name, then size and mtime) and assigned greedily from
//! the highest score down; a tie at the top is never guessed, the candidate is tracked as a new
//! file instead. Under `copytruncate` the candidates left over are then checked against the
//! digests of the previous files to find the copies made before truncation.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::receivers::logrt::config::RotationPolicy;
use crate::receivers::logrt::input::{Candidate, Encoding, PrefixDigest};
use crate::receivers::logrt::state::{LogFile, WatchState};

/// How a file changed between two consecutive cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Same file; it may have grown or been renamed.
    Unchanged,
    /// Same file, shrunk or rewritten in place; read again from the start.
    Truncated,
    /// A previously tracked file no candidate resolves to.
    RotatedAway,
    /// A new file holding a copy of a previously tracked file.
    RotatedCopy,
    /// A file with no previous counterpart.
    New,
}

/// Output of [`RotationResolver::resolve`].
#[derive(Debug, Default)]
pub struct Resolution {
    /// Identity list for this cycle, in processing order
    pub files: Vec<LogFile>,
    /// Transition of each entry of `files`
    pub transitions: Vec<Transition>,
    /// Previously tracked files without a successor, to be drained before `files`
    pub rotated_away: Vec<LogFile>,
    /// Candidates that matched more than one previous file, or vice versa
    pub ambiguous: Vec<PathBuf>,
}

impl Resolution {
    pub fn transition_of(&self, file_name: &str) -> Option<Transition> {
        self.files
            .iter()
            .position(|f| f.file_name() == Some(file_name))
            .map(|i| self.transitions[i])
    }
}

#[derive(Debug, Clone, Copy)]
struct Link {
    old: usize,
    cand: usize,
    truncated: bool,
    score: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Matched,
    Ambiguous,
}

/// RotationResolver decides which candidates continue which tracked files
#[derive(Debug, Clone, Copy)]
pub struct RotationResolver {
    policy: RotationPolicy,
    encoding: Encoding,
}

impl RotationResolver {
    pub fn new(policy: RotationPolicy, encoding: Encoding) -> Self {
        Self { policy, encoding }
    }

    /// Build the identity list for this cycle. `candidates` must be in processing order.
    pub fn resolve(&self, state: &WatchState, candidates: Vec<Candidate>) -> Resolution {
        let previous = &state.files;
        // Resuming from positions alone: no identity list, only the last file's mtime and size
        let resuming = previous.is_empty() && state.last_mtime > 0;

        let mut old_slots = vec![Slot::Free; previous.len()];
        let mut cand_slots = vec![Slot::Free; candidates.len()];
        let mut matched: Vec<Option<Link>> = vec![None; candidates.len()];
        let mut ambiguous = Vec::new();

        let mut links = Vec::new();
        for old_idx in 0..previous.len() {
            for (cand_idx, cand) in candidates.iter().enumerate() {
                if let Some(link) = self.relate(state.use_inode, previous, old_idx, cand_idx, cand) {
                    links.push(link);
                }
            }
        }
        links.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(a.old.cmp(&b.old))
                .then(a.cand.cmp(&b.cand))
        });

        for level in links.chunk_by(|a, b| a.score == b.score) {
            let open: Vec<Link> = level
                .iter()
                .filter(|l| old_slots[l.old] == Slot::Free && cand_slots[l.cand] == Slot::Free)
                .copied()
                .collect();

            for link in &open {
                let old_claims = open.iter().filter(|l| l.old == link.old).count();
                let cand_claims = open.iter().filter(|l| l.cand == link.cand).count();

                if old_claims == 1 && cand_claims == 1 {
                    old_slots[link.old] = Slot::Matched;
                    cand_slots[link.cand] = Slot::Matched;
                    matched[link.cand] = Some(*link);
                } else {
                    if cand_slots[link.cand] == Slot::Free {
                        ambiguous.push(candidates[link.cand].path.clone());
                    }
                    old_slots[link.old] = Slot::Ambiguous;
                    cand_slots[link.cand] = Slot::Ambiguous;
                }
            }
        }

        let copies = if self.policy.detects_copies() {
            self.find_copies(previous, &candidates, &cand_slots, &mut ambiguous)
        } else {
            vec![None; candidates.len()]
        };

        let mut resolution = Resolution {
            ambiguous,
            ..Default::default()
        };

        for (old_idx, old) in previous.iter().enumerate() {
            let copied = copies.contains(&Some(old_idx));
            if old_slots[old_idx] != Slot::Matched && !copied {
                info!(path = ?old.path, offset = old.processed_size, size = old.size, "File rotated away");
                resolution.rotated_away.push(old.clone());
            }
        }
        resolution.rotated_away.sort_by_key(|f| f.seq);
        for (seq, file) in resolution.rotated_away.iter_mut().enumerate() {
            file.seq = seq;
            file.copy_of = None;
        }

        let resume = if resuming {
            candidates
                .iter()
                .rposition(|c| c.mtime == state.last_mtime && c.size >= state.last_size)
        } else {
            None
        };

        let first_seq = resolution.rotated_away.len();
        for (cand_idx, cand) in candidates.iter().enumerate() {
            let seq = first_seq + cand_idx;

            let (file, transition) = match (matched[cand_idx], copies[cand_idx]) {
                (Some(link), _) => self.continue_file(&previous[link.old], cand, seq, link.truncated),
                (None, Some(source)) => {
                    (self.copy_file(&previous[source], source, cand, seq), Transition::RotatedCopy)
                }
                (None, None) => {
                    let mut file = track(cand, seq);
                    if state.skip_old_data {
                        file.processed_size = cand.size;
                    } else if resume == Some(cand_idx) {
                        file.processed_size = state.last_size;
                    } else if resuming && cand.mtime < state.last_mtime {
                        // Processed before the positions were saved; tracked so it stays consumed
                        debug!(path = ?cand.path, mtime = cand.mtime, "File older than last processed");
                        file.processed_size = cand.size;
                    }
                    debug!(path = ?file.path, offset = file.processed_size, size = file.size, "Tracking new file");
                    (file, Transition::New)
                }
            };

            resolution.files.push(file);
            resolution.transitions.push(transition);
        }

        resolution
    }

    /// Relate a tracked file to a candidate that may be the same physical file.
    fn relate(
        &self,
        use_inode: bool,
        previous: &[LogFile],
        old_idx: usize,
        cand_idx: usize,
        cand: &Candidate,
    ) -> Option<Link> {
        let old = &previous[old_idx];
        let same_name = old.path.file_name() == cand.path.file_name();
        let same_stat = old.size == cand.size && old.mtime == cand.mtime;

        let base = if use_inode {
            if old.file_id != cand.file_id {
                return None;
            }
            4
        } else if self.policy.detects_copies() {
            // Copies share content with their source, so only the name identifies the file
            if !same_name {
                return None;
            }
            // A name reused by a copy of another tracked file, as when rotations shift
            if !old.digest.matches_head(&cand.head) && exact_copy_source(previous, cand).is_some() {
                return None;
            }
            0
        } else if old.digest.is_empty() {
            if !same_name {
                return None;
            }
            0
        } else {
            if cand.mtime < old.mtime || !old.digest.matches_head(&cand.head) {
                return None;
            }
            4
        };

        let score = base + if same_name { 2 } else { 0 } + if same_stat { 1 } else { 0 };

        Some(Link {
            old: old_idx,
            cand: cand_idx,
            truncated: self.is_truncated(old, cand),
            score,
        })
    }

    /// Whether a file known to be the same one was truncated or rewritten in place.
    fn is_truncated(&self, old: &LogFile, cand: &Candidate) -> bool {
        if cand.size < old.processed_size {
            return true;
        }

        let size_changed = cand.size != old.size;
        let mtime_changed = cand.mtime != old.mtime;
        if size_changed || (mtime_changed && self.policy.recheck_on_mtime()) {
            return !old.digest.matches_head(&cand.head);
        }
        false
    }

    /// For every unmatched candidate, find the one previous file it is a copy of.
    fn find_copies(
        &self,
        previous: &[LogFile],
        candidates: &[Candidate],
        cand_slots: &[Slot],
        ambiguous: &mut Vec<PathBuf>,
    ) -> Vec<Option<usize>> {
        let mut copies = vec![None; candidates.len()];

        for (cand_idx, cand) in candidates.iter().enumerate() {
            if cand_slots[cand_idx] != Slot::Free {
                continue;
            }

            let sources: Vec<usize> = previous
                .iter()
                .enumerate()
                .filter(|(_, old)| !old.digest.is_empty() && old.digest.matches_head(&cand.head))
                .map(|(i, _)| i)
                .collect();

            // Prefer a source whose size and mtime the copy preserved
            let exact: Vec<usize> = sources
                .iter()
                .copied()
                .filter(|&i| previous[i].size == cand.size && previous[i].mtime == cand.mtime)
                .collect();

            let source = match (sources.as_slice(), exact.as_slice()) {
                ([], _) => continue,
                ([only], _) | (_, [only]) => *only,
                _ => {
                    warn!(path = ?cand.path, sources = sources.len(), "Copy matches several files");
                    ambiguous.push(cand.path.clone());
                    continue;
                }
            };
            copies[cand_idx] = Some(source);
        }

        // A source claimed by more than one copy cannot be resolved
        for source in 0..previous.len() {
            let claims: Vec<usize> = copies
                .iter()
                .enumerate()
                .filter(|(_, c)| **c == Some(source))
                .map(|(i, _)| i)
                .collect();
            if claims.len() > 1 {
                for cand_idx in claims {
                    warn!(path = ?candidates[cand_idx].path, source = ?previous[source].path, "Several files claim the same copy source");
                    ambiguous.push(candidates[cand_idx].path.clone());
                    copies[cand_idx] = None;
                }
            }
        }

        copies
    }

    fn continue_file(
        &self,
        old: &LogFile,
        cand: &Candidate,
        seq: usize,
        truncated: bool,
    ) -> (LogFile, Transition) {
        let mut file = LogFile {
            path: cand.path.clone(),
            mtime: cand.mtime,
            file_id: cand.file_id,
            size: cand.size,
            digest: PrefixDigest::of_bytes(&cand.head),
            seq,
            copy_of: None,
            ..old.clone()
        };

        if truncated {
            info!(path = ?file.path, old_offset = old.processed_size, size = cand.size, "File truncated, reading from the start");
            file.reset_progress();
            file.retry = 0;
            return (file, Transition::Truncated);
        }

        if old.path != cand.path {
            info!(from = ?old.path, to = ?cand.path, offset = file.processed_size, "File renamed");
        }
        (file, Transition::Unchanged)
    }

    /// Track a copy, inheriting the source's progress no further than the matched prefix.
    fn copy_file(&self, source: &LogFile, source_idx: usize, cand: &Candidate, seq: usize) -> LogFile {
        let mut file = track(cand, seq);
        file.copy_of = Some(source_idx);

        let matched = source.digest.len().min(cand.size);
        if source.processed_size <= matched {
            file.processed_size = source.processed_size;
            file.tail = source.tail.clone();
            file.incomplete = source.incomplete;
            file.big_rec = source.big_rec;
        } else if matched >= source.tail_start() {
            // The matched prefix ends inside the buffered record; read it again whole
            file.processed_size = source.tail_start();
        } else {
            file.processed_size = matched;
            let at_boundary = matched == 0
                || self
                    .encoding
                    .ends_with_terminator(&cand.head[..matched as usize]);
            // Discard the rest of a record that was already delivered from the source
            file.big_rec = !at_boundary;
        }

        info!(
            path = ?file.path,
            source = ?source.path,
            offset = file.processed_size,
            "File is a copy of a tracked file"
        );
        file
    }
}

/// A tracked file the candidate reproduces exactly: same size, mtime and leading bytes.
fn exact_copy_source(previous: &[LogFile], cand: &Candidate) -> Option<usize> {
    previous.iter().position(|old| {
        !old.digest.is_empty()
            && old.size == cand.size
            && old.mtime == cand.mtime
            && old.digest.matches_head(&cand.head)
    })
}

fn track(cand: &Candidate, seq: usize) -> LogFile {
    LogFile {
        path: cand.path.clone(),
        mtime: cand.mtime,
        file_id: cand.file_id,
        size: cand.size,
        processed_size: 0,
        digest: PrefixDigest::of_bytes(&cand.head),
        seq,
        retry: 0,
        incomplete: false,
        tail: Vec::new(),
        big_rec: false,
        copy_of: None,
    }
}
