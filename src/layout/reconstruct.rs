//! Rebuild reading-order text from recognized line boxes.
//!
//! The OCR service gives us each line's bounding box, but not which lines sit
//! side by side on the same visual row. We recover rows like this:
//!
//! 1. Estimate the page's skew from the first edge of its reference polygon.
//! 2. Deskew each line's `top` by `left · tan(skew)`.
//! 3. Sort lines by deskewed top, and use the median gap between neighbors
//!    (at least [`MIN_ROW_THRESHOLD`]) as the row threshold.
//! 4. Greedily group lines into rows, comparing each line against the first
//!    line of the current row.
//! 5. Sort each row left to right, and emit tab-separated text.
//!
//! Everything here is pure and deterministic.

use std::collections::BTreeMap;

use super::payload::{Block, BlockKind, BoundingBox, Point, RecognitionPayload};
use crate::errors::MalformedPayloadError;

/// The smallest row threshold we'll use, in normalized page-height units.
pub const MIN_ROW_THRESHOLD: f64 = 0.01;

/// Separator between pages in the rendered document.
const PAGE_SEPARATOR: &str = "\n\n";

/// A line of text with its position on the page.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognizedLine {
    /// The ID of the `LINE` block this came from.
    pub block_id: String,

    /// The recognized text.
    pub text: String,

    /// Where the line is, normalized to the page.
    pub bounding_box: BoundingBox,

    /// `bounding_box.top` after deskewing. Equal to `top` until
    /// [`deskew`] runs.
    pub deskewed_top: f64,
}

impl RecognizedLine {
    /// Create a line which has not been deskewed yet.
    pub fn new(block_id: impl Into<String>, text: impl Into<String>, bounding_box: BoundingBox) -> Self {
        Self {
            block_id: block_id.into(),
            text: text.into(),
            deskewed_top: bounding_box.top,
            bounding_box,
        }
    }

    /// Build from a `LINE` block. Returns `None` for other block types.
    fn from_block(block: &Block) -> Option<Result<Self, MalformedPayloadError>> {
        let BlockKind::Line(line) = &block.kind else {
            return None;
        };
        let result = match block.bounding_box() {
            Some(bbox) => bbox
                .check_finite(block.page)
                .map(|()| Self::new(&block.id, &line.text, *bbox)),
            None => Err(MalformedPayloadError::LineWithoutGeometry {
                page: block.page,
                block_id: block.id.clone(),
            }),
        };
        Some(result)
    }
}

/// One page, laid out.
#[derive(Clone, Debug, PartialEq)]
pub struct PageLayout {
    /// 1-based page number.
    pub page: u32,

    /// The skew angle we corrected for, in radians.
    pub skew_angle: f64,

    /// The row threshold we used.
    pub row_threshold: f64,

    /// Rows in top-to-bottom order, each sorted left to right.
    pub rows: Vec<Vec<RecognizedLine>>,

    /// The rendered text of this page.
    pub text: String,
}

/// A whole document, laid out.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconstructedDocument {
    /// Pages in page order.
    pub pages: Vec<PageLayout>,

    /// The rendered text of every page.
    pub text: String,
}

impl ReconstructedDocument {
    /// Every line in reading order, for callers that need geometry rather than
    /// flat text.
    pub fn lines(&self) -> impl Iterator<Item = &RecognizedLine> {
        self.pages.iter().flat_map(|p| p.rows.iter().flatten())
    }
}

/// Estimate a page's skew, in radians, from its reference polygon.
///
/// We use the first edge `p1 → p2`, which runs along the top of the page. A
/// vertical first edge gives a skew of 0. An edge running right-to-left means
/// the page is rotated beyond ±90° or its vertices are out of order, and we
/// refuse to guess.
pub fn estimate_skew(page: u32, polygon: &[Point]) -> Result<f64, MalformedPayloadError> {
    let [p1, p2, ..] = polygon else {
        return Err(MalformedPayloadError::TooFewPolygonVertices {
            page,
            vertices: polygon.len(),
        });
    };
    if ![p1.x, p1.y, p2.x, p2.y].iter().all(|v| v.is_finite()) {
        return Err(MalformedPayloadError::NonFiniteGeometry { page });
    }
    let dx = p1.x - p2.x;
    let dy = p1.y - p2.y;
    if dy == 0.0 || dx == 0.0 {
        return Ok(0.0);
    }
    if dx > 0.0 {
        return Err(MalformedPayloadError::UnsupportedOrientation { page });
    }
    Ok((dy / dx).atan())
}

/// Correct each line's `deskewed_top` for `skew_angle`.
pub fn deskew(lines: &mut [RecognizedLine], skew_angle: f64) {
    let slope = skew_angle.tan();
    for line in lines {
        line.deskewed_top = line.bounding_box.top - line.bounding_box.left * slope;
    }
}

/// The median gap between consecutive values of `sorted_tops`, but never less
/// than [`MIN_ROW_THRESHOLD`].
pub fn row_threshold(sorted_tops: &[f64]) -> f64 {
    let mut gaps = sorted_tops
        .windows(2)
        .map(|w| w[1] - w[0])
        .collect::<Vec<_>>();
    if gaps.is_empty() {
        return MIN_ROW_THRESHOLD;
    }
    gaps.sort_by(f64::total_cmp);
    let mid = gaps.len() / 2;
    let median = if gaps.len() % 2 == 0 {
        (gaps[mid - 1] + gaps[mid]) / 2.0
    } else {
        gaps[mid]
    };
    median.max(MIN_ROW_THRESHOLD)
}

/// Sort lines by deskewed top, then group them into rows.
///
/// A line joins the current row if its deskewed top is within `threshold` of
/// the row's first line. Rows come out top to bottom, each sorted left to
/// right. Both sorts are stable, so ties keep their input order.
pub fn cluster_rows(mut lines: Vec<RecognizedLine>, threshold: f64) -> Vec<Vec<RecognizedLine>> {
    lines.sort_by(|a, b| a.deskewed_top.total_cmp(&b.deskewed_top));
    let mut rows: Vec<Vec<RecognizedLine>> = Vec::new();
    for line in lines {
        match rows.last_mut() {
            Some(row) if (line.deskewed_top - row[0].deskewed_top).abs() < threshold => {
                row.push(line);
            }
            _ => rows.push(vec![line]),
        }
    }
    for row in &mut rows {
        row.sort_by(|a, b| a.bounding_box.left.total_cmp(&b.bounding_box.left));
    }
    rows
}

/// Render rows as text: a tab after every line, a newline after every row,
/// and no trailing whitespace.
pub fn render_rows(rows: &[Vec<RecognizedLine>]) -> String {
    let mut text = String::new();
    for row in rows {
        for line in row {
            text.push_str(&line.text);
            text.push('\t');
        }
        text.push('\n');
    }
    let trimmed = text.trim_end().len();
    text.truncate(trimmed);
    text
}

/// Lay out a single page, given its reference polygon and lines.
pub fn reconstruct_page(
    page: u32,
    reference_polygon: &[Point],
    mut lines: Vec<RecognizedLine>,
) -> Result<PageLayout, MalformedPayloadError> {
    let skew_angle = estimate_skew(page, reference_polygon)?;
    deskew(&mut lines, skew_angle);

    let mut tops = lines.iter().map(|l| l.deskewed_top).collect::<Vec<_>>();
    tops.sort_by(f64::total_cmp);
    let row_threshold = row_threshold(&tops);

    let rows = cluster_rows(lines, row_threshold);
    let text = render_rows(&rows);
    Ok(PageLayout {
        page,
        skew_angle,
        row_threshold,
        rows,
        text,
    })
}

/// Lay out every page of `payload`, in page order.
///
/// Every page with lines needs a `PAGE` block, and every `PAGE` block needs a
/// usable polygon, even if the page has no text.
pub fn reconstruct_document(
    payload: &RecognitionPayload,
) -> Result<ReconstructedDocument, MalformedPayloadError> {
    // Page results may arrive in any order, so key everything by page number.
    let mut references: BTreeMap<u32, &[Point]> = BTreeMap::new();
    let mut lines: BTreeMap<u32, Vec<RecognizedLine>> = BTreeMap::new();
    for block in &payload.blocks {
        if block.kind == BlockKind::Page {
            let polygon = block
                .geometry
                .as_ref()
                .map(|g| g.polygon.as_slice())
                .unwrap_or_default();
            references.entry(block.page).or_insert(polygon);
        } else if let Some(line) = RecognizedLine::from_block(block) {
            lines.entry(block.page).or_default().push(line?);
        }
    }
    if references.is_empty() {
        return Err(MalformedPayloadError::NoPages);
    }
    if let Some(&page) = lines.keys().find(|page| !references.contains_key(page)) {
        return Err(MalformedPayloadError::MissingPageBlock { page });
    }

    let pages = references
        .into_iter()
        .map(|(page, polygon)| {
            reconstruct_page(page, polygon, lines.remove(&page).unwrap_or_default())
        })
        .collect::<Result<Vec<_>, _>>()?;
    let text = pages
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join(PAGE_SEPARATOR);
    Ok(ReconstructedDocument { pages, text })
}
