//! Structural counts for a recognition payload.

use std::collections::{BTreeSet, HashMap};

use schemars::JsonSchema;

use super::payload::{Block, BlockKind, RecognitionPayload};
use crate::prelude::*;

/// How many blocks the OCR service returns per result page.
const BLOCKS_PER_SHARD: usize = 1000;

/// Per-document totals.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DocumentMetrics {
    /// All blocks, of every type.
    pub blocks: usize,
    /// Characters in all words.
    pub characters: usize,
    /// Words belonging to lines.
    pub words: usize,
    /// `LINE` blocks.
    pub lines: usize,
    /// `TABLE` blocks.
    pub tables: usize,
    /// Form fields, counted as `KEY_VALUE_SET` blocks with a `KEY` entity
    /// type.
    pub forms: usize,
    /// Distinct pages.
    pub pages: usize,
    /// The size of the payload JSON as received, in bytes.
    pub size: usize,
    /// How many result pages a consumer will need to fetch the payload.
    pub shards: usize,
}

impl DocumentMetrics {
    /// Compute the totals for `payload`.
    pub fn for_payload(payload: &RecognitionPayload) -> Self {
        let by_id: HashMap<&str, &Block> = payload
            .blocks
            .iter()
            .filter(|b| !b.id.is_empty())
            .map(|b| (b.id.as_str(), b))
            .collect();

        let mut metrics = DocumentMetrics {
            blocks: payload.blocks.len(),
            size: payload.raw_json().len(),
            ..Default::default()
        };
        let mut pages = BTreeSet::new();
        for block in &payload.blocks {
            pages.insert(block.page);
            match &block.kind {
                BlockKind::Line(_) => {
                    metrics.lines += 1;
                    for child in block.child_ids().filter_map(|id| by_id.get(id)) {
                        if let BlockKind::Word(word) = &child.kind {
                            metrics.words += 1;
                            metrics.characters += word.text.chars().count();
                        }
                    }
                }
                BlockKind::Table => metrics.tables += 1,
                BlockKind::KeyValueSet(kv) if kv.is_key() => metrics.forms += 1,
                _ => {}
            }
        }
        metrics.pages = pages.len();
        metrics.shards = metrics.blocks.div_ceil(BLOCKS_PER_SHARD);
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = br#"{
        "Blocks": [
            {"BlockType": "PAGE", "Id": "p1", "Page": 1,
             "Geometry": {"Polygon": [{"X": 0, "Y": 0}, {"X": 1, "Y": 0}]}},
            {"BlockType": "LINE", "Id": "l1", "Page": 1, "Text": "Hi there",
             "Relationships": [{"Type": "CHILD", "Ids": ["w1", "w2"]}]},
            {"BlockType": "WORD", "Id": "w1", "Page": 1, "Text": "Hi"},
            {"BlockType": "WORD", "Id": "w2", "Page": 1, "Text": "there"},
            {"BlockType": "PAGE", "Id": "p2", "Page": 2,
             "Geometry": {"Polygon": [{"X": 0, "Y": 0}, {"X": 1, "Y": 0}]}},
            {"BlockType": "TABLE", "Id": "t1", "Page": 2},
            {"BlockType": "CELL", "Id": "c1", "Page": 2, "RowIndex": 1, "ColumnIndex": 1},
            {"BlockType": "KEY_VALUE_SET", "Id": "k1", "Page": 2, "EntityTypes": ["KEY"]},
            {"BlockType": "KEY_VALUE_SET", "Id": "v1", "Page": 2, "EntityTypes": ["VALUE"]}
        ]
    }"#;

    #[test]
    fn test_counts() {
        let payload = RecognitionPayload::from_json(SAMPLE).unwrap();
        let metrics = DocumentMetrics::for_payload(&payload);
        assert_eq!(metrics.blocks, 9);
        assert_eq!(metrics.lines, 1);
        assert_eq!(metrics.words, 2);
        assert_eq!(metrics.characters, 7);
        assert_eq!(metrics.tables, 1);
        assert_eq!(metrics.forms, 1);
        assert_eq!(metrics.pages, 2);
        assert_eq!(metrics.shards, 1);
        assert_eq!(metrics.size, SAMPLE.len());
    }

    #[test]
    fn test_no_tables_or_forms_is_zero() {
        let payload = RecognitionPayload::from_json(
            br#"{"Blocks": [{"BlockType": "PAGE", "Id": "p", "Geometry": {"Polygon": []}}]}"#,
        )
        .unwrap();
        let metrics = DocumentMetrics::for_payload(&payload);
        assert_eq!(metrics.tables, 0);
        assert_eq!(metrics.forms, 0);
        assert_eq!(metrics.pages, 1);
    }

    #[test]
    fn test_size_counts_fields_we_do_not_parse() {
        let json = br#"{"JobStatus": "SUCCEEDED", "Blocks": [
            {"BlockType": "SELECTION_ELEMENT", "Id": "s", "Confidence": 97.5,
             "SelectionStatus": "NOT_SELECTED"}]}"#;
        let payload = RecognitionPayload::from_json(json).unwrap();
        assert_eq!(DocumentMetrics::for_payload(&payload).size, json.len());
    }

    #[test]
    fn test_shards_round_up() {
        let block = RecognitionPayload::from_json(br#"{"Blocks": [{"BlockType": "WORD"}]}"#)
            .unwrap()
            .blocks
            .remove(0);
        let payload = RecognitionPayload::from_blocks(vec![block; 1001]);
        assert_eq!(DocumentMetrics::for_payload(&payload).shards, 2);
        assert_eq!(DocumentMetrics::for_payload(&RecognitionPayload::default()).shards, 0);
    }
}
