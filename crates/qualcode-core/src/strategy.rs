//! Coding strategy interface.
//!
//! A strategy bundles the three capabilities that vary between coding
//! approaches: how big a window to request, how to phrase the prompts, and
//! how to read the oracle's answer back. The scheduler and the
//! [`CodingSession`](crate::session::CodingSession) depend only on this
//! trait.

use std::collections::BTreeMap;

use crate::error::CodingError;
use crate::models::{CodedThread, DataItem};
use crate::scheduler::{shrinking_window, ChunkSize};

/// A system + user prompt pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prompts {
    pub system: String,
    pub user: String,
}

/// What a parser extracted from one oracle response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedResponse {
    /// 1-based position among the coded items → raw code string.
    Codes(BTreeMap<usize, String>),
    /// The response did not line up with the request; move the cursor by
    /// this much relative to the window size.
    Shift(isize),
}

/// The window a strategy is asked to prompt for or parse.
#[derive(Debug, Clone, Copy)]
pub struct ChunkContext<'a> {
    /// Every item in the window, context included.
    pub items: &'a [DataItem],
    /// Index of the first item to code.
    pub chunk_start: usize,
    /// Number of items to code.
    pub size: usize,
    pub iteration: usize,
    pub tries: usize,
    pub is_first: bool,
}

impl<'a> ChunkContext<'a> {
    pub fn coded(&self) -> &'a [DataItem] {
        let end = (self.chunk_start + self.size).min(self.items.len());
        &self.items[self.chunk_start..end]
    }

    pub fn before(&self) -> &'a [DataItem] {
        &self.items[..self.chunk_start]
    }

    pub fn after(&self) -> &'a [DataItem] {
        let end = (self.chunk_start + self.size).min(self.items.len());
        &self.items[end..]
    }
}

/// Per-approach chunk sizing, prompting, and parsing.
pub trait CodingStrategy: Send + Sync {
    /// Short identifier used in logs and output file names.
    fn name(&self) -> &str;

    /// Number of full passes over each thread.
    fn iterations(&self) -> usize {
        1
    }

    /// Temperature for an attempt. Retries get progressively warmer.
    fn temperature(&self, base: f32, tries: usize) -> f32 {
        (base + 0.2 * tries as f32).min(1.0)
    }

    /// Window for the next chunk. Halves on every retry by default.
    fn chunk_size(&self, recommended: usize, _remaining: usize, _iteration: usize, tries: usize) -> ChunkSize {
        ChunkSize::fixed(shrinking_window(recommended, tries))
    }

    /// Reorder or drop items before a pass.
    fn preprocess(&self, _thread: &CodedThread, items: Vec<DataItem>, _iteration: usize) -> Vec<DataItem> {
        items
    }

    /// Whether an item is coded in this pass.
    fn filter(&self, _item: &DataItem, _iteration: usize) -> bool {
        true
    }

    /// Build the prompts for one window.
    fn build_prompts(&self, thread: &CodedThread, chunk: &ChunkContext<'_>) -> Result<Prompts, CodingError>;

    /// Read an oracle response (already split by [`normalize_lines`]).
    ///
    /// May update the thread's narrative fields. Must fail with
    /// [`CodingError::InvalidResponse`] when the response is unusable.
    fn parse_response(
        &self,
        thread: &mut CodedThread,
        lines: &[String],
        chunk: &ChunkContext<'_>,
    ) -> Result<ParsedResponse, CodingError>;
}

/// Split an oracle response into trimmed, non-empty lines with markdown
/// emphasis removed.
pub fn normalize_lines(response: &str) -> Vec<String> {
    response
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .lines()
        .map(|line| line.replace("**", "").replace("__", "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Parse `12. text` or `12) text` into `(12, "text")`.
pub fn numbered_line(line: &str) -> Option<(usize, &str)> {
    let digits = line.len() - line.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    let index: usize = line[..digits].parse().ok()?;
    let rest = line[digits..].strip_prefix(['.', ')'])?;
    Some((index, rest.trim()))
}
