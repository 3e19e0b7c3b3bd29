//! The recognition payload returned by the OCR service.
//!
//! This mirrors the JSON written by Textract: a flat list of blocks, each
//! tagged with a `BlockType`. We only parse the fields we actually read, but
//! keep the original JSON. Unknown block types are parsed as
//! [`BlockKind::Other`] so they still count towards the totals.

use serde_json::{Map, Value};

use crate::{errors::MalformedPayloadError, prelude::*};

/// A complete recognition result for one document, all pages.
///
/// We keep the JSON exactly as we received it alongside the parsed blocks, so
/// it can be saved and measured without losing the fields we don't model.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognitionPayload {
    /// Every block from every page, in service order.
    pub blocks: Vec<Block>,

    /// The JSON this payload was parsed from.
    raw: Vec<u8>,
}

/// The parts of the top-level document we read.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PayloadDocument {
    #[serde(default)]
    blocks: Vec<Block>,
}

impl RecognitionPayload {
    /// Parse a payload from JSON.
    pub fn from_json(data: &[u8]) -> Result<Self, MalformedPayloadError> {
        let document = serde_json::from_slice::<PayloadDocument>(data)
            .map_err(|err| MalformedPayloadError::Unparseable(err.to_string()))?;
        Ok(Self {
            blocks: document.blocks,
            raw: data.to_vec(),
        })
    }

    /// Assemble a payload from the blocks of every result page, each in the
    /// service's own JSON form.
    pub fn from_service_blocks(
        document_metadata: Option<Value>,
        blocks: Vec<Value>,
    ) -> Result<Self, MalformedPayloadError> {
        let mut document = Map::new();
        if let Some(metadata) = document_metadata {
            document.insert("DocumentMetadata".to_owned(), metadata);
        }
        document.insert("Blocks".to_owned(), Value::Array(blocks));
        let data = serde_json::to_vec(&document)
            .map_err(|err| MalformedPayloadError::Unparseable(err.to_string()))?;
        Self::from_json(&data)
    }

    /// Build a payload from parsed blocks.
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        let raw = serde_json::to_vec(&PayloadDocument {
            blocks: blocks.clone(),
        })
        .unwrap_or_default();
        Self { blocks, raw }
    }

    /// The JSON this payload came from.
    pub fn raw_json(&self) -> &[u8] {
        &self.raw
    }
}

impl Default for RecognitionPayload {
    fn default() -> Self {
        Self::from_blocks(vec![])
    }
}

fn first_page() -> u32 {
    1
}

/// A single recognized element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Block {
    /// Service-assigned block ID. Referenced by [`Relationship::ids`].
    #[serde(default)]
    pub id: String,

    /// 1-based page number. Single-page results often omit it.
    #[serde(default = "first_page")]
    pub page: u32,

    /// Where the block is on the page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,

    /// Links to other blocks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<Relationship>,

    /// Type-specific fields.
    #[serde(flatten)]
    pub kind: BlockKind,
}

impl Block {
    /// IDs of this block's children.
    pub fn child_ids(&self) -> impl Iterator<Item = &str> {
        self.relationships
            .iter()
            .filter(|rel| rel.kind == "CHILD")
            .flat_map(|rel| rel.ids.iter().map(String::as_str))
    }

    /// The bounding box, if there is one.
    pub fn bounding_box(&self) -> Option<&BoundingBox> {
        self.geometry.as_ref()?.bounding_box.as_ref()
    }
}

/// The kinds of block we care about, keyed by `BlockType`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "BlockType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockKind {
    /// One per page. Its polygon is the page's reference geometry.
    Page,
    /// A line of text.
    Line(TextBlock),
    /// A single word. Normally a child of a `LINE`.
    Word(TextBlock),
    /// A table. Cells are its children.
    Table,
    /// A table cell.
    Cell,
    /// Half of a form field: either the key or the value.
    KeyValueSet(KeyValueSetBlock),
    /// Anything else: selection elements, layout blocks, signatures, ...
    #[serde(other)]
    Other,
}

/// Fields for `LINE` and `WORD` blocks.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TextBlock {
    #[serde(default)]
    pub text: String,
}

/// Fields for `KEY_VALUE_SET` blocks.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyValueSetBlock {
    /// `KEY` or `VALUE`.
    #[serde(default)]
    pub entity_types: Vec<String>,
}

impl KeyValueSetBlock {
    /// Is this the key half of a form field?
    pub fn is_key(&self) -> bool {
        self.entity_types.iter().any(|t| t == "KEY")
    }
}

/// Position of a block, normalized to the page.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Geometry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    #[serde(default)]
    pub polygon: Vec<Point>,
}

/// An axis-aligned box. All values are fractions of the page size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BoundingBox {
    pub width: f64,
    pub height: f64,
    pub left: f64,
    pub top: f64,
}

impl BoundingBox {
    fn is_finite(&self) -> bool {
        [self.width, self.height, self.left, self.top]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Are all coordinates real numbers?
    pub fn check_finite(&self, page: u32) -> Result<(), MalformedPayloadError> {
        if self.is_finite() {
            Ok(())
        } else {
            Err(MalformedPayloadError::NonFiniteGeometry { page })
        }
    }
}

/// A polygon vertex.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// A link from one block to others.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Relationship {
    /// `CHILD`, `VALUE`, `TITLE`, ...
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default)]
    pub ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_textract_json() {
        let json = br#"{
            "DocumentMetadata": {"Pages": 1},
            "JobStatus": "SUCCEEDED",
            "Blocks": [
                {"BlockType": "PAGE", "Id": "p", "Page": 1,
                 "Geometry": {"Polygon": [{"X": 0, "Y": 0}, {"X": 1, "Y": 0}]},
                 "Relationships": [{"Type": "CHILD", "Ids": ["l"]}]},
                {"BlockType": "LINE", "Id": "l", "Text": "Hello world", "Confidence": 99.1,
                 "Geometry": {"BoundingBox": {"Width": 0.2, "Height": 0.01, "Left": 0.1, "Top": 0.1},
                              "Polygon": []}},
                {"BlockType": "KEY_VALUE_SET", "Id": "k", "EntityTypes": ["KEY"]},
                {"BlockType": "SELECTION_ELEMENT", "Id": "s", "SelectionStatus": "SELECTED"}
            ]
        }"#;
        let payload = RecognitionPayload::from_json(json).unwrap();
        assert_eq!(payload.blocks.len(), 4);
        assert_eq!(payload.blocks[0].kind, BlockKind::Page);
        assert_eq!(payload.blocks[0].child_ids().collect::<Vec<_>>(), vec!["l"]);
        assert_eq!(
            payload.blocks[1].kind,
            BlockKind::Line(TextBlock {
                text: "Hello world".to_owned()
            })
        );
        assert_eq!(payload.blocks[1].page, 1);
        assert_eq!(payload.blocks[1].bounding_box().unwrap().left, 0.1);
        match &payload.blocks[2].kind {
            BlockKind::KeyValueSet(kv) => assert!(kv.is_key()),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(payload.blocks[3].kind, BlockKind::Other);
        assert_eq!(payload.raw_json(), json);
    }

    #[test]
    fn test_service_blocks_keep_unmodeled_fields() {
        let payload = RecognitionPayload::from_service_blocks(
            Some(serde_json::json!({"Pages": 1})),
            vec![
                serde_json::json!({"BlockType": "PAGE", "Id": "p", "Page": 1}),
                serde_json::json!({
                    "BlockType": "SELECTION_ELEMENT",
                    "Id": "s",
                    "Confidence": 97.5,
                    "SelectionStatus": "SELECTED"
                }),
            ],
        )
        .unwrap();
        assert_eq!(payload.blocks.len(), 2);
        assert_eq!(payload.blocks[1].kind, BlockKind::Other);
        let raw = String::from_utf8(payload.raw_json().to_vec()).unwrap();
        assert!(raw.contains(r#""BlockType":"SELECTION_ELEMENT""#));
        assert!(raw.contains(r#""SelectionStatus":"SELECTED""#));
        assert!(raw.contains(r#""DocumentMetadata":{"Pages":1}"#));
        assert_eq!(RecognitionPayload::from_json(payload.raw_json()).unwrap(), payload);
    }

    #[test]
    fn test_unparseable() {
        let err = RecognitionPayload::from_json(b"[1, 2").unwrap_err();
        assert!(matches!(err, MalformedPayloadError::Unparseable(_)));
    }
}
