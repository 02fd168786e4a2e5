//! Built-in item-level coding strategy.
//!
//! Every coded item receives one line of codes. The oracle keeps a running
//! reflection, plan, and summary that are fed back into the next chunk's
//! prompt so context survives across windows.
//!
//! # Response Format
//!
//! ```text
//! ## Reflection
//! What stood out in these messages.
//! ## Plan
//! What to look for next.
//! ## Items
//! 1. greeting; asking for help
//! 2. sharing a workaround
//! ## Summary
//! Running summary of the conversation so far.
//! ```
//!
//! Headings are matched case-insensitively and may use any number of `#`.
//! Item lines may use `1.` or `1)`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::CodingError;
use crate::models::{CodedThread, DataItem};
use crate::registry::install_codes;
use crate::scheduler::{shrinking_window, ChunkSize};
use crate::strategy::{numbered_line, ChunkContext, CodingStrategy, ParsedResponse, Prompts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Reflection,
    Plan,
    Items,
    Summary,
}

fn section_of(line: &str) -> Option<Section> {
    let heading = line.strip_prefix('#')?.trim_start_matches('#').trim().to_lowercase();
    if heading.starts_with("reflection") {
        Some(Section::Reflection)
    } else if heading.starts_with("plan") {
        Some(Section::Plan)
    } else if heading.starts_with("summary") {
        Some(Section::Summary)
    } else if heading.starts_with("item") || heading.starts_with("code") {
        Some(Section::Items)
    } else {
        None
    }
}

/// Item-level coder configured with the study's research question.
#[derive(Debug, Clone)]
pub struct ItemLevelStrategy {
    pub research_question: String,
    pub coding_notes: String,
    /// Accept a response that codes only a leading prefix of the items.
    pub allow_truncation: bool,
    pub prefetch: usize,
    pub postfetch: usize,
    pub iterations: usize,
}

impl Default for ItemLevelStrategy {
    fn default() -> Self {
        Self {
            research_question: String::new(),
            coding_notes: String::new(),
            allow_truncation: false,
            prefetch: 0,
            postfetch: 0,
            iterations: 1,
        }
    }
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl CodingStrategy for ItemLevelStrategy {
    fn name(&self) -> &str {
        "item-level"
    }

    fn iterations(&self) -> usize {
        self.iterations
    }

    fn chunk_size(&self, recommended: usize, _remaining: usize, _iteration: usize, tries: usize) -> ChunkSize {
        ChunkSize::Window {
            size: shrinking_window(recommended, tries),
            prefetch: self.prefetch,
            postfetch: self.postfetch,
        }
    }

    fn filter(&self, item: &DataItem, _iteration: usize) -> bool {
        !item.content.trim().is_empty()
    }

    fn build_prompts(&self, thread: &CodedThread, chunk: &ChunkContext<'_>) -> Result<Prompts, CodingError> {
        let coded = chunk.coded();
        if coded.is_empty() {
            return Ok(Prompts::default());
        }

        let mut system = String::new();
        system.push_str(
            "You are an expert in qualitative research. Code each message with short, \
             reusable labels that speak to the research question.\n",
        );
        if !self.research_question.trim().is_empty() {
            let _ = writeln!(system, "\nResearch question: {}", self.research_question.trim());
        }
        if !self.coding_notes.trim().is_empty() {
            let _ = writeln!(system, "\nNotes: {}", self.coding_notes.trim());
        }
        if !thread.codes.is_empty() {
            let labels: Vec<&str> = thread.codes.keys().map(String::as_str).collect();
            let _ = writeln!(system, "\nCodes used so far: {}", labels.join("; "));
        }
        if !chunk.is_first && !thread.summary.is_empty() {
            let _ = writeln!(system, "\nSummary so far: {}", thread.summary);
        }
        if !chunk.is_first && !thread.plan.is_empty() {
            let _ = writeln!(system, "\nYour previous plan: {}", thread.plan);
        }
        let _ = write!(
            system,
            "\nAlways answer in this format:\n\
             ## Reflection\n(what stood out)\n\
             ## Plan\n(what to look for next)\n\
             ## Items\n\
             1. code; code\n\
             ... one line per numbered message, {} line(s) in total ...\n\
             ## Summary\n(running summary of the conversation)\n",
            coded.len()
        );

        let mut user = String::new();
        let before = chunk.before();
        if !before.is_empty() {
            user.push_str("Earlier messages (context only, do not code):\n");
            for item in before {
                let _ = writeln!(user, "- [{}] {}", item.uid, one_line(&item.content));
            }
            user.push('\n');
        }
        user.push_str("Messages to code:\n");
        for (i, item) in coded.iter().enumerate() {
            let _ = writeln!(user, "{}. [{}] {}", i + 1, item.uid, one_line(&item.content));
        }
        let after = chunk.after();
        if !after.is_empty() {
            user.push_str("\nLater messages (context only, do not code):\n");
            for item in after {
                let _ = writeln!(user, "- [{}] {}", item.uid, one_line(&item.content));
            }
        }

        Ok(Prompts { system, user })
    }

    fn parse_response(
        &self,
        thread: &mut CodedThread,
        lines: &[String],
        chunk: &ChunkContext<'_>,
    ) -> Result<ParsedResponse, CodingError> {
        let mut section = Section::Preamble;
        let mut reflection: Vec<&str> = Vec::new();
        let mut plan: Vec<&str> = Vec::new();
        let mut summary: Vec<&str> = Vec::new();
        let mut codes: BTreeMap<usize, String> = BTreeMap::new();
        let mut item_lines = 0usize;

        for line in lines {
            if let Some(next) = section_of(line) {
                section = next;
                continue;
            }
            match section {
                Section::Preamble => {}
                Section::Reflection => reflection.push(line),
                Section::Plan => plan.push(line),
                Section::Summary => summary.push(line),
                Section::Items => {
                    if let Some((index, text)) = numbered_line(line) {
                        item_lines += 1;
                        codes.insert(index, text.to_string());
                    }
                }
            }
        }

        for (name, body) in [("reflection", &reflection), ("plan", &plan), ("summary", &summary)] {
            if body.is_empty() {
                return Err(CodingError::invalid(format!("missing {} section", name)));
            }
        }
        if item_lines != codes.len() {
            return Err(CodingError::invalid("duplicate item numbers"));
        }

        let expected = chunk.coded().len();
        let returned = codes.len();
        let contiguous = codes.keys().copied().eq(1..=returned);

        let outcome = if returned == expected && contiguous {
            ParsedResponse::Codes(codes)
        } else if self.allow_truncation && contiguous && returned >= 1 && returned < expected {
            install_codes(thread, chunk.items, chunk.chunk_start, &codes);
            ParsedResponse::Shift(returned as isize - expected as isize)
        } else {
            return Err(CodingError::invalid(format!(
                "expected {} coded item(s), got {}",
                expected, returned
            )));
        };

        thread.reflection = reflection.join("\n");
        thread.plan = plan.join("\n");
        thread.summary = summary.join("\n");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::normalize_lines;
    use chrono::{TimeZone, Utc};

    fn items(n: usize) -> Vec<DataItem> {
        (1..=n)
            .map(|i| DataItem {
                id: i.to_string(),
                uid: format!("u{}", i % 2),
                time: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, i as u32).unwrap(),
                content: format!("message {}", i),
                mentions: vec![],
                tags: vec![],
                chunk: None,
            })
            .collect()
    }

    fn ctx(items: &[DataItem], chunk_start: usize, size: usize) -> ChunkContext<'_> {
        ChunkContext {
            items,
            chunk_start,
            size,
            iteration: 0,
            tries: 0,
            is_first: chunk_start == 0,
        }
    }

    fn response(item_lines: &[&str]) -> Vec<String> {
        let mut text = String::from("## Reflection\nThoughtful.\n## Plan\nKeep going.\n## Items\n");
        for line in item_lines {
            text.push_str(line);
            text.push('\n');
        }
        text.push_str("## Summary\nPeople greet each other.\n");
        normalize_lines(&text)
    }

    #[test]
    fn parses_complete_response() {
        let items = items(2);
        let mut thread = CodedThread::new("t");
        let strategy = ItemLevelStrategy::default();
        let parsed = strategy
            .parse_response(&mut thread, &response(&["1. greeting", "2) asking help; question"]), &ctx(&items, 0, 2))
            .unwrap();
        match parsed {
            ParsedResponse::Codes(codes) => {
                assert_eq!(codes[&1], "greeting");
                assert_eq!(codes[&2], "asking help; question");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(thread.plan, "Keep going.");
        assert_eq!(thread.summary, "People greet each other.");
        assert_eq!(thread.reflection, "Thoughtful.");
    }

    #[test]
    fn missing_section_is_invalid() {
        let items = items(1);
        let mut thread = CodedThread::new("t");
        let lines = normalize_lines("## Items\n1. greeting\n## Summary\nx");
        let err = ItemLevelStrategy::default()
            .parse_response(&mut thread, &lines, &ctx(&items, 0, 1))
            .unwrap_err();
        assert!(matches!(err, CodingError::InvalidResponse(_)));
        assert!(thread.summary.is_empty());
    }

    #[test]
    fn count_mismatch_is_invalid_without_truncation() {
        let items = items(3);
        let mut thread = CodedThread::new("t");
        let err = ItemLevelStrategy::default()
            .parse_response(&mut thread, &response(&["1. a", "2. b"]), &ctx(&items, 0, 3))
            .unwrap_err();
        assert!(err.to_string().contains("expected 3"));
    }

    #[test]
    fn truncated_prefix_installs_and_shifts() {
        let items = items(6);
        let mut thread = CodedThread::new("t");
        let strategy = ItemLevelStrategy {
            allow_truncation: true,
            ..Default::default()
        };
        // one context item before, five to code, model stopped after three
        let parsed = strategy
            .parse_response(&mut thread, &response(&["1. a", "2. b", "3. c"]), &ctx(&items, 1, 5))
            .unwrap();
        assert_eq!(parsed, ParsedResponse::Shift(-2));
        assert_eq!(thread.items["2"].codes, vec!["a"]);
        assert_eq!(thread.items["4"].codes, vec!["c"]);
        assert!(!thread.items.contains_key("1"));
        assert!(!thread.items.contains_key("5"));
    }

    #[test]
    fn non_contiguous_indices_are_invalid_even_with_truncation() {
        let items = items(3);
        let mut thread = CodedThread::new("t");
        let strategy = ItemLevelStrategy {
            allow_truncation: true,
            ..Default::default()
        };
        assert!(strategy
            .parse_response(&mut thread, &response(&["1. a", "3. c"]), &ctx(&items, 0, 3))
            .is_err());
    }

    #[test]
    fn duplicate_indices_are_invalid() {
        let items = items(2);
        let mut thread = CodedThread::new("t");
        assert!(ItemLevelStrategy::default()
            .parse_response(&mut thread, &response(&["1. a", "1. b", "2. c"]), &ctx(&items, 0, 2))
            .is_err());
    }

    #[test]
    fn prompts_number_only_coded_items() {
        let items = items(4);
        let mut thread = CodedThread::new("t");
        thread.summary = "So far so good".into();
        let strategy = ItemLevelStrategy {
            research_question: "How do people ask for help?".into(),
            ..Default::default()
        };
        let prompts = strategy.build_prompts(&thread, &ctx(&items, 1, 2)).unwrap();
        assert!(prompts.system.contains("How do people ask for help?"));
        assert!(prompts.system.contains("So far so good"));
        assert!(prompts.user.contains("- [u1] message 1"));
        assert!(prompts.user.contains("1. [u0] message 2"));
        assert!(prompts.user.contains("2. [u1] message 3"));
        assert!(prompts.user.contains("Later messages"));
        assert!(!prompts.user.contains("3. "));
    }
}
