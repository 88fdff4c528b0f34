//! Embedding-guided semantic chunker.
//!
//! Splits text into sentence-coherent [`Chunk`]s by looking for large
//! semantic jumps between consecutive sentences.
//!
//! # Algorithm
//!
//! 1. Split text into sentences. A curated abbreviation set ("Dr.", "e.g.",
//!    "vs.", "U.S.", …) and single-letter initials never end a sentence.
//! 2. With at most one sentence, return the whole text as one chunk with
//!    coherence `1.0`.
//! 3. Embed all sentences in batches and compute the cosine distance of
//!    each consecutive pair.
//! 4. Take the `breakpoint_percentile` of the distances as the threshold.
//!    A pair whose distance exceeds it becomes a chunk boundary, provided
//!    at least `min_sentences_between_breaks` sentences have passed since
//!    the previous boundary.
//! 5. Merge groups shorter than `min_chunk_size` chars into a neighbour,
//!    then split groups longer than `max_chunk_size`, carrying
//!    `overlap_sentences` sentences into each following piece.
//! 6. Coherence is the mean pairwise cosine similarity of the member
//!    sentence embeddings.
//!
//! Any embedding failure switches to greedy fixed-size chunking with a
//! placeholder coherence. The chunker never fails its caller.
//!
//! # Example
//!
//! ```rust
//! use knowledge_harness::chunk::split_sentences;
//!
//! let sentences = split_sentences("Dr. Smith prefers Redis, e.g. for caching. It is fast.");
//! assert_eq!(sentences.len(), 2);
//! ```

use std::collections::HashSet;
use std::ops::Range;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::config::ChunkingConfig;
use crate::embedding::{cosine_distance, cosine_similarity, embed_batched, EmbeddingGateway};
use crate::models::{Chunk, Metadata};
use crate::text::snap_to_char_boundary;

/// Sentence-final punctuation, optional closing quotes/brackets, then whitespace.
static SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[.!?]+["'”’)\]]*\s+"#).expect("sentence boundary regex is valid")
});

static ABBREVIATIONS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "dr.", "mr.", "mrs.", "ms.", "prof.", "sr.", "jr.", "st.", "mt.", "vs.", "e.g.", "i.e.",
        "cf.", "al.", "approx.", "inc.", "ltd.", "co.", "corp.", "dept.", "fig.", "figs.", "eq.",
        "no.", "vol.", "p.", "pp.", "ch.", "sec.", "ver.", "min.", "max.", "est.", "a.m.", "p.m.",
        "u.s.", "u.k.", "e.u.", "ph.d.", "b.sc.", "m.sc.", "jan.", "feb.", "mar.", "apr.",
        "jun.", "jul.", "aug.", "sep.", "sept.", "oct.", "nov.", "dec.",
    ]
    .into_iter()
    .collect()
});

/// Split text into trimmed, non-empty sentences.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;

    for m in SENTENCE_END.find_iter(text) {
        if is_abbreviation(&text[start..m.start()], &text[m.start()..m.end()]) {
            continue;
        }
        let sentence = text[start..m.end()].trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        start = m.end();
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Whether the token ending at a `.` boundary is an abbreviation rather
/// than the end of a sentence.
fn is_abbreviation(before: &str, terminator: &str) -> bool {
    if !terminator.starts_with('.') || terminator.trim_end().len() > 1 {
        return false;
    }
    let word = match before.split_whitespace().last() {
        Some(w) => w.trim_start_matches(|c: char| "\"'(“‘[".contains(c)),
        None => return false,
    };
    let candidate = format!("{}.", word.to_lowercase());
    if ABBREVIATIONS.contains(candidate.as_str()) {
        return true;
    }
    // Single-letter initials ("J. Smith").
    let mut chars = word.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_uppercase())
}

/// Linear-interpolated percentile (`p` in `[0, 100]`) of `values`.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Sentence indices after which a new chunk starts.
///
/// `distances[i]` is the distance between sentences `i` and `i + 1`.
pub fn find_breakpoints(distances: &[f64], threshold: f64, min_gap: usize) -> Vec<usize> {
    let mut breaks = Vec::new();
    let mut group_start = 0;
    for (i, d) in distances.iter().enumerate() {
        if *d > threshold && i + 1 - group_start >= min_gap.max(1) {
            breaks.push(i);
            group_start = i + 1;
        }
    }
    breaks
}

/// Turn breakpoints into sentence ranges, then enforce size bounds.
///
/// `lengths[i]` is the char length of sentence `i`.
pub fn assemble_ranges(
    lengths: &[usize],
    breakpoints: &[usize],
    config: &ChunkingConfig,
) -> Vec<Range<usize>> {
    let n = lengths.len();
    if n == 0 {
        return Vec::new();
    }

    let mut groups = Vec::new();
    let mut start = 0;
    for &b in breakpoints {
        if b + 1 > start && b + 1 < n {
            groups.push(start..b + 1);
            start = b + 1;
        }
    }
    groups.push(start..n);

    let size = |r: &Range<usize>| -> usize {
        let chars: usize = lengths[r.clone()].iter().sum();
        chars + r.len().saturating_sub(1)
    };

    // Merge undersized groups forward; a trailing undersized group merges back.
    let mut merged: Vec<Range<usize>> = Vec::new();
    let mut pending: Option<Range<usize>> = None;
    for g in groups {
        let current = match pending.take() {
            Some(p) => p.start..g.end,
            None => g,
        };
        if size(&current) < config.min_chunk_size {
            pending = Some(current);
        } else {
            merged.push(current);
        }
    }
    if let Some(p) = pending {
        match merged.last_mut() {
            Some(last) => last.end = p.end,
            None => merged.push(p),
        }
    }

    // Split oversized groups, carrying overlap sentences forward.
    let mut out = Vec::new();
    for g in merged {
        if size(&g) <= config.max_chunk_size || g.len() <= 1 {
            out.push(g);
            continue;
        }
        let mut piece_start = g.start;
        while piece_start < g.end {
            let mut end = piece_start + 1;
            while end < g.end && size(&(piece_start..end + 1)) <= config.max_chunk_size {
                end += 1;
            }
            out.push(piece_start..end);
            if end >= g.end {
                break;
            }
            let overlap = config.overlap_sentences.min(end - piece_start - 1);
            piece_start = end - overlap;
        }
    }
    out
}

/// Mean pairwise cosine similarity, clamped to `[0, 1]`. A single
/// embedding is perfectly coherent.
pub fn coherence(embeddings: &[Vec<f32>]) -> f64 {
    if embeddings.len() < 2 {
        return 1.0;
    }
    let mut total = 0.0f64;
    let mut pairs = 0usize;
    for i in 0..embeddings.len() {
        for j in (i + 1)..embeddings.len() {
            total += cosine_similarity(&embeddings[i], &embeddings[j]) as f64;
            pairs += 1;
        }
    }
    (total / pairs as f64).clamp(0.0, 1.0)
}

/// Embedding-guided chunker.
pub struct SemanticChunker {
    gateway: Arc<dyn EmbeddingGateway>,
    config: ChunkingConfig,
    batch_size: usize,
}

impl SemanticChunker {
    pub fn new(gateway: Arc<dyn EmbeddingGateway>, config: ChunkingConfig) -> Self {
        let batch_size = gateway.max_batch_size();
        Self {
            gateway,
            config,
            batch_size,
        }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<dyn EmbeddingGateway> {
        &self.gateway
    }

    /// Split `text` into chunks, copying `metadata` onto each one.
    pub async fn chunk(&self, text: &str, metadata: &Metadata) -> Vec<Chunk> {
        let sentences = split_sentences(text);
        if sentences.len() <= 1 {
            return vec![make_chunk(
                text.trim().to_string(),
                sentences,
                0,
                1.0,
                metadata,
                0,
                "semantic",
            )];
        }

        let embeddings =
            match embed_batched(self.gateway.as_ref(), &sentences, self.batch_size).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "sentence embedding failed, using fixed-size chunking");
                    return fallback_chunks(
                        &sentences,
                        metadata,
                        self.config.fallback_chunk_size,
                        self.config.fallback_coherence,
                    );
                }
            };

        let distances: Vec<f64> = embeddings
            .windows(2)
            .map(|w| cosine_distance(&w[0], &w[1]))
            .collect();
        let threshold = percentile(&distances, self.config.breakpoint_percentile);
        let breakpoints = find_breakpoints(
            &distances,
            threshold,
            self.config.min_sentences_between_breaks,
        );
        let lengths: Vec<usize> = sentences.iter().map(|s| s.chars().count()).collect();
        let ranges = assemble_ranges(&lengths, &breakpoints, &self.config);

        tracing::trace!(
            sentences = sentences.len(),
            threshold,
            breakpoints = breakpoints.len(),
            chunks = ranges.len(),
            "semantic chunking"
        );

        ranges
            .into_iter()
            .enumerate()
            .map(|(index, r)| {
                let members = sentences[r.clone()].to_vec();
                make_chunk(
                    members.join(" "),
                    members,
                    r.start,
                    coherence(&embeddings[r]),
                    metadata,
                    index,
                    "semantic",
                )
            })
            .collect()
    }
}

/// Greedy fixed-size chunking used when embeddings are unavailable.
///
/// Sentences are packed until adding the next would exceed `max_chars`.
/// A sentence longer than `max_chars` is hard-split at the nearest
/// whitespace boundary.
pub fn fallback_chunks(
    sentences: &[String],
    metadata: &Metadata,
    max_chars: usize,
    placeholder_coherence: f64,
) -> Vec<Chunk> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut buf: Vec<String> = Vec::new();
    let mut buf_len = 0usize;
    let mut buf_start = 0usize;

    let mut flush = |buf: &mut Vec<String>, buf_len: &mut usize, start: usize, end: usize| {
        if buf.is_empty() {
            return;
        }
        let members = std::mem::take(buf);
        let index = chunks.len();
        let mut chunk = make_chunk(
            members.join(" "),
            members,
            start,
            placeholder_coherence,
            metadata,
            index,
            "fixed",
        );
        chunk.end_sentence = end;
        chunks.push(chunk);
        *buf_len = 0;
    };

    for (i, sentence) in sentences.iter().enumerate() {
        let len = sentence.len();
        let would_be = if buf.is_empty() { len } else { buf_len + 1 + len };

        if would_be > max_chars && !buf.is_empty() {
            flush(&mut buf, &mut buf_len, buf_start, i);
        }

        if len > max_chars {
            let mut remaining = sentence.as_str();
            while !remaining.is_empty() {
                let split_at = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
                let split_at = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind(char::is_whitespace)
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let split_at = if split_at == 0 {
                    remaining
                        .char_indices()
                        .nth(1)
                        .map(|(i, _)| i)
                        .unwrap_or(remaining.len())
                } else {
                    split_at
                };
                let piece = remaining[..split_at].trim();
                if !piece.is_empty() {
                    buf.push(piece.to_string());
                    flush(&mut buf, &mut buf_len, i, i + 1);
                }
                remaining = &remaining[split_at..];
            }
            buf_start = i + 1;
            continue;
        }

        if buf.is_empty() {
            buf_start = i;
            buf_len = len;
        } else {
            buf_len += 1 + len;
        }
        buf.push(sentence.clone());
    }
    flush(&mut buf, &mut buf_len, buf_start, sentences.len());

    if chunks.is_empty() {
        chunks.push(make_chunk(
            String::new(),
            Vec::new(),
            0,
            placeholder_coherence,
            metadata,
            0,
            "fixed",
        ));
    }
    chunks
}

fn make_chunk(
    content: String,
    sentences: Vec<String>,
    start: usize,
    coherence: f64,
    metadata: &Metadata,
    index: usize,
    method: &str,
) -> Chunk {
    let mut meta = metadata.clone();
    meta.insert("chunk_index".into(), index.into());
    meta.insert("sentence_count".into(), sentences.len().into());
    meta.insert("chunking".into(), method.into());
    let end = start + sentences.len().max(1);
    Chunk {
        content,
        sentences,
        start_sentence: start,
        end_sentence: end,
        coherence,
        metadata: meta,
    }
}
