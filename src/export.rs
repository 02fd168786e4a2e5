//! Export coded items as a flat table.
//!
//! Produces one row per item (`thread`, `id`, `uid`, `content`, `codes`)
//! in dataset order, suitable for spreadsheets or downstream scripts.

use anyhow::Result;
use qualcode_core::models::CodedThreads;
use serde::Serialize;
use std::path::Path;

use crate::dataset::{save_json, Dataset};

#[derive(Debug, Serialize, PartialEq)]
pub struct ItemRow {
    pub thread: String,
    pub id: String,
    pub uid: String,
    pub content: String,
    pub codes: Vec<String>,
}

/// Join the dataset's items with their coded labels.
///
/// Items without codes are kept with an empty list; threads missing from
/// the analysis are skipped.
pub fn items_table(dataset: &Dataset, analysis: &CodedThreads) -> Vec<ItemRow> {
    let mut rows = Vec::new();
    for (thread_id, chunk) in &dataset.chunks {
        let Some(thread) = analysis.threads.get(thread_id) else {
            continue;
        };
        for item in chunk.flatten() {
            let codes = thread
                .items
                .get(&item.id)
                .map(|coded| coded.codes.clone())
                .unwrap_or_default();
            rows.push(ItemRow {
                thread: thread_id.clone(),
                id: item.id.clone(),
                uid: item.uid.clone(),
                content: item.content.clone(),
                codes,
            });
        }
    }
    rows
}

/// Write the item table as JSON.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub fn write_items(dataset: &Dataset, analysis: &CodedThreads, output: Option<&Path>) -> Result<usize> {
    let rows = items_table(dataset, analysis);
    match output {
        Some(path) => save_json(path, &rows)?,
        None => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use qualcode_core::models::{CodedItem, CodedThread, DataChunk, DataEntry, DataItem};

    #[test]
    fn rows_follow_dataset_order_and_keep_uncoded_items() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let item = |id: &str| {
            DataEntry::Item(DataItem {
                id: id.into(),
                uid: "u".into(),
                time: t,
                content: format!("message {}", id),
                mentions: vec![],
                tags: vec![],
                chunk: None,
            })
        };
        let mut dataset = Dataset::default();
        dataset.chunks.insert(
            "t1".into(),
            DataChunk {
                id: "t1".into(),
                start: t,
                end: t,
                items: vec![item("2"), item("1")],
            },
        );
        dataset.chunks.insert(
            "t2".into(),
            DataChunk {
                id: "t2".into(),
                start: t,
                end: t,
                items: vec![item("3")],
            },
        );

        let mut thread = CodedThread::new("t1");
        thread.items.insert(
            "1".into(),
            CodedItem {
                id: "1".into(),
                codes: vec!["greeting".into()],
            },
        );
        let mut analysis = CodedThreads::default();
        analysis.threads.insert("t1".into(), thread);

        let rows = items_table(&dataset, &analysis);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "2");
        assert!(rows[0].codes.is_empty());
        assert_eq!(rows[1].codes, vec!["greeting"]);
    }
}
