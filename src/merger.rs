use crate::decoder::Token;

/// A token annotated with merge-time bookkeeping: a recomputed absolute
/// time (relative to the chunk it was observed in) and a vignette weight
/// favoring tokens near the center of their window.
#[derive(Debug, Clone)]
struct Annotated {
    token: Token,
    vignette: f32,
}

/// Combines consecutive window decode outputs into `confirmed` (stable)
/// and `pending` (still revisable) token streams via windowed LCS
/// followed by a physical-time plausibility check (spec §4.G).
/// Identifies a `process_chunk` call's inputs, so an exact repeat (the
/// controller retrying a tick whose decode didn't actually see new audio)
/// can be recognized as a no-op rather than re-run through the anchor
/// logic, which isn't inherently idempotent against its own prior output.
#[derive(PartialEq)]
struct ChunkSignature {
    ids: Vec<u32>,
    chunk_start_time: f32,
    overlap_duration: f32,
}

pub struct Merger {
    confirmed: Vec<Token>,
    pending: Vec<Token>,
    anchor_min_len: usize,
    time_tolerance_sec: f32,
    vignette_sigma_factor: f32,
    frame_time_stride: f32,
    last_chunk: Option<ChunkSignature>,
}

impl Merger {
    pub fn new(
        anchor_min_len: usize,
        time_tolerance_sec: f32,
        vignette_sigma_factor: f32,
        frame_time_stride: f32,
    ) -> Self {
        Self {
            confirmed: Vec::new(),
            pending: Vec::new(),
            anchor_min_len,
            time_tolerance_sec,
            vignette_sigma_factor,
            frame_time_stride,
            last_chunk: None,
        }
    }

    pub fn confirmed(&self) -> &[Token] {
        &self.confirmed
    }

    pub fn pending(&self) -> &[Token] {
        &self.pending
    }

    pub fn mature_cursor_time(&self) -> f32 {
        self.confirmed.last().map(|t| t.abs_time).unwrap_or(0.0)
    }

    fn annotate(&self, tokens: &[Token], chunk_start_time: f32) -> Vec<Annotated> {
        let n = tokens.len();
        let mid = (n as f32 - 1.0) / 2.0;
        let sigma = (n as f32 * self.vignette_sigma_factor).max(1e-6);
        tokens
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let mut token = t.clone();
                token.abs_time = chunk_start_time + token.frame_index as f32 * self.frame_time_stride;
                let d = i as f32 - mid;
                let vignette = (-(d * d) / (2.0 * sigma * sigma)).exp();
                Annotated { token, vignette }
            })
            .collect()
    }

    /// Merge a new window's decoded tokens. `chunk_start_time` is the
    /// window's start time in seconds; `overlap_duration` is how much of
    /// the window's start overlaps already-confirmed/pending audio.
    pub fn process_chunk(&mut self, tokens: &[Token], chunk_start_time: f32, overlap_duration: f32) {
        let overlap_duration = overlap_duration.max(0.0);

        let signature = ChunkSignature {
            ids: tokens.iter().map(|t| t.id).collect(),
            chunk_start_time,
            overlap_duration,
        };
        if self.last_chunk.as_ref() == Some(&signature) {
            return;
        }
        self.last_chunk = Some(signature);

        let annotated = self.annotate(tokens, chunk_start_time);

        if self.pending.is_empty() {
            self.pending = annotated.into_iter().map(|a| a.token).collect();
            return;
        }

        let split_time = chunk_start_time + overlap_duration;
        let (overlap_toks, new_toks): (Vec<Annotated>, Vec<Annotated>) = annotated
            .into_iter()
            .partition(|a| a.token.abs_time < split_time);

        let pending_ids: Vec<u32> = self.pending.iter().map(|t| t.id).collect();
        let overlap_ids: Vec<u32> = overlap_toks.iter().map(|a| a.token.id).collect();

        let (start_x, start_y, len) = longest_common_substring(&pending_ids, &overlap_ids);

        if len >= self.anchor_min_len && within_time_tolerance(&self.pending, &overlap_toks, start_x, start_y, len, self.time_tolerance_sec)
        {
            // Strong anchor: commit everything up to and including the match.
            let cut = start_x + len;
            self.confirmed.extend(self.pending.drain(..cut));
            self.pending.clear();
        } else if len > 0 {
            // Weak anchor: commit the unambiguous prefix, then resolve the
            // disputed span by weighted log-prob vote.
            self.confirmed.extend(self.pending.drain(..start_x));

            let pending_span = &self.pending[..len];
            let overlap_span = &overlap_toks[start_y..start_y + len];
            let pending_score: f32 = pending_span.iter().map(|t| t.log_prob).sum::<f32>();
            // pending tokens in this branch have no vignette weight (they
            // came from a prior chunk's confirmed pending list); weigh the
            // overlap candidate by its own vignette.
            let overlap_score: f32 = overlap_span.iter().map(|a| a.token.log_prob * a.vignette).sum();

            let use_overlap = if pending_score == 0.0 && overlap_score == 0.0 {
                false // uniformly zero log-probs: prefer the prior window's path
            } else {
                overlap_score > pending_score
            };

            if use_overlap {
                self.confirmed
                    .extend(overlap_span.iter().map(|a| a.token.clone()));
            } else {
                self.confirmed.extend(pending_span.iter().cloned());
            }
            self.pending.clear();
        } else {
            // No contiguous match at all: treat as a discontinuity and
            // commit everything pending outright.
            self.confirmed.append(&mut self.pending);
        }

        self.pending = new_toks.into_iter().map(|a| a.token).collect();
    }

    /// Force-commit all pending tokens, e.g. on a silence timeout.
    pub fn flush_pending(&mut self) -> &[Token] {
        self.confirmed.append(&mut self.pending);
        &self.confirmed
    }

    pub fn transcript(&self) -> Vec<Token> {
        let mut all = self.confirmed.clone();
        all.extend(self.pending.iter().cloned());
        all
    }
}

fn within_time_tolerance(
    pending: &[Token],
    overlap_toks: &[Annotated],
    start_x: usize,
    start_y: usize,
    len: usize,
    tolerance: f32,
) -> bool {
    (0..len).all(|i| {
        let p = &pending[start_x + i];
        let o = &overlap_toks[start_y + i].token;
        (p.abs_time - o.abs_time).abs() <= tolerance
    })
}

/// Longest contiguous common substring between two id sequences via 1-D
/// dynamic programming: `dp[j]` holds the match length ending at `x[i-1],
/// y[j-1]` using only the previous row. Returns `(start_x, start_y, len)`.
fn longest_common_substring(x: &[u32], y: &[u32]) -> (usize, usize, usize) {
    if x.is_empty() || y.is_empty() {
        return (0, 0, 0);
    }
    let mut dp = vec![0usize; y.len() + 1];
    let mut best_len = 0usize;
    let mut best_end_x = 0usize;
    let mut best_end_y = 0usize;

    for i in 1..=x.len() {
        let mut prev_diag = 0usize;
        for j in 1..=y.len() {
            let temp = dp[j];
            if x[i - 1] == y[j - 1] {
                dp[j] = prev_diag + 1;
                if dp[j] > best_len {
                    best_len = dp[j];
                    best_end_x = i;
                    best_end_y = j;
                }
            } else {
                dp[j] = 0;
            }
            prev_diag = temp;
        }
    }

    (best_end_x - best_len, best_end_y - best_len, best_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(id: u32, frame_index: u32, abs_time: f32, log_prob: f32) -> Token {
        Token {
            id,
            frame_index,
            abs_time,
            log_prob,
            text: String::new(),
            tdt_step: 0,
        }
    }

    #[test]
    fn lcs_finds_contiguous_match_not_subsequence() {
        let x = [1, 2, 3, 4, 5];
        let y = [9, 2, 3, 4, 8];
        let (sx, sy, len) = longest_common_substring(&x, &y);
        assert_eq!((sx, sy, len), (1, 1, 3));
    }

    #[test]
    fn lcs_empty_on_no_overlap() {
        let x = [1, 2, 3];
        let y = [4, 5, 6];
        let (_, _, len) = longest_common_substring(&x, &y);
        assert_eq!(len, 0);
    }

    #[test]
    fn first_chunk_becomes_pending_with_no_confirmation() {
        let mut m = Merger::new(3, 0.15, 0.25, 0.08);
        let tokens = vec![tok(1, 0, 0.0, -0.1), tok(2, 5, 0.5, -0.1)];
        m.process_chunk(&tokens, 0.0, 0.0);
        assert!(m.confirmed().is_empty());
        assert_eq!(m.pending().len(), 2);
    }

    #[test]
    fn process_chunk_is_idempotent_given_same_inputs() {
        let mut m = Merger::new(2, 0.15, 0.25, 0.08);
        let first = vec![tok(1, 0, 0.0, -0.1), tok(2, 10, 1.0, -0.1), tok(3, 20, 2.0, -0.1)];
        m.process_chunk(&first, 0.0, 0.0);

        let second = vec![tok(2, 0, 1.0, -0.1), tok(3, 10, 2.0, -0.1), tok(4, 20, 3.0, -0.1)];
        m.process_chunk(&second, 1.0, 2.0);
        let confirmed_after_first = m.confirmed().to_vec();
        let pending_after_first = m.pending().to_vec();

        // Re-processing the identical chunk (same tokens, same
        // chunk_start_time, same overlap_duration) a second time must not
        // advance state further.
        m.process_chunk(&second, 1.0, 2.0);
        assert_eq!(m.confirmed().len(), confirmed_after_first.len());
        assert_eq!(m.pending().len(), pending_after_first.len());
    }

    #[test]
    fn discontinuity_commits_all_pending_when_no_match() {
        let mut m = Merger::new(3, 0.15, 0.25, 0.08);
        m.process_chunk(&[tok(1, 0, 0.0, 0.0), tok(2, 10, 1.0, 0.0)], 0.0, 0.0);
        m.process_chunk(&[tok(7, 0, 2.0, 0.0), tok(8, 10, 3.0, 0.0)], 2.0, 0.0);
        assert_eq!(m.confirmed().len(), 2);
        assert_eq!(m.pending().len(), 2);
    }

    #[test]
    fn strong_anchor_commits_pending_through_the_match_and_keeps_the_tail_pending() {
        // Pending covers [0, 5s) from window 0; the new window covers
        // [3.5, 8.5) and shares a 4-token contiguous id match with
        // pending's tail, all within the time tolerance.
        let mut m = Merger::new(4, 0.15, 0.25, 0.1);
        let pending = vec![
            tok(1, 5, 0.0, 0.0),   // t = 0.5s, not part of the overlap match
            tok(2, 35, 0.0, 0.0),  // t = 3.5s
            tok(3, 38, 0.0, 0.0),  // t = 3.8s
            tok(4, 41, 0.0, 0.0),  // t = 4.1s
            tok(5, 44, 0.0, 0.0),  // t = 4.4s
        ];
        m.process_chunk(&pending, 0.0, 0.0);

        let new_window = vec![
            tok(2, 0, 0.0, 0.0),  // t = 3.5 + 0*0.1 = 3.5s
            tok(3, 3, 0.0, 0.0),  // t = 3.8s
            tok(4, 6, 0.0, 0.0),  // t = 4.1s
            tok(5, 9, 0.0, 0.0),  // t = 4.4s
            tok(6, 25, 0.0, 0.0), // t = 6.0s, beyond the 5.0s overlap split
            tok(7, 35, 0.0, 0.0), // t = 7.0s
        ];
        m.process_chunk(&new_window, 3.5, 1.5);

        let confirmed_ids: Vec<u32> = m.confirmed().iter().map(|t| t.id).collect();
        let pending_ids: Vec<u32> = m.pending().iter().map(|t| t.id).collect();
        assert_eq!(confirmed_ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(pending_ids, vec![6, 7]);
    }

    #[test]
    fn flush_pending_moves_all_pending_into_confirmed() {
        let mut m = Merger::new(3, 0.15, 0.25, 0.08);
        m.process_chunk(&[tok(1, 0, 0.0, 0.0)], 0.0, 0.0);
        assert_eq!(m.pending().len(), 1);
        let confirmed = m.flush_pending();
        assert_eq!(confirmed.len(), 1);
        assert!(m.pending().is_empty());
    }
}
