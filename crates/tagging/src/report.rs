use crate::error::{Result, TaggerError};
use crate::metrics::ConfusionCounts;
use crate::vocab::TagVocabulary;
use serde::Serialize;
use std::fmt::Write as _;

/// Column names of the flattened confusion table.
pub const TABLE_COLUMNS: [&str; 3] = ["target", "prediction", "value"];

const CELL_PX: usize = 28;
const MARGIN_PX: usize = 160;

/// One flattened cell of the normalised matrix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfusionRow {
    pub target: String,
    pub prediction: String,
    pub value: f64,
}

/// Row-normalised confusion matrix with its tag labels.
#[derive(Debug, Clone)]
pub struct ConfusionReport {
    tags: TagVocabulary,
    /// Row-major `n x n`.
    cells: Vec<f64>,
}

impl ConfusionReport {
    /// Divide each row by its sum. Rows with no counts stay all zero.
    pub fn new(counts: &ConfusionCounts, tags: &TagVocabulary) -> Result<Self> {
        let n = counts.n();
        if n != tags.len() {
            return Err(TaggerError::Shape(format!(
                "confusion matrix is {n}x{n} but the vocabulary has {} tags",
                tags.len()
            )));
        }

        let mut cells = Vec::with_capacity(n * n);
        for i in 0..n {
            let row = counts.row(i);
            let total: u64 = row.iter().sum();
            if total == 0 {
                cells.extend(std::iter::repeat_n(0.0, n));
            } else {
                cells.extend(row.iter().map(|&c| c as f64 / total as f64));
            }
        }

        Ok(Self {
            tags: tags.clone(),
            cells,
        })
    }

    pub fn n(&self) -> usize {
        self.tags.len()
    }

    pub fn get(&self, target: usize, predicted: usize) -> f64 {
        self.cells[target * self.n() + predicted]
    }

    pub fn row(&self, target: usize) -> &[f64] {
        let n = self.n();
        &self.cells[target * n..(target + 1) * n]
    }

    /// `(target, prediction, value)` for every cell, row-major.
    pub fn rows(&self) -> Vec<ConfusionRow> {
        let n = self.n();
        let mut rows = Vec::with_capacity(n * n);
        for (i, target) in self.tags.iter().enumerate() {
            for (j, prediction) in self.tags.iter().enumerate() {
                rows.push(ConfusionRow {
                    target: target.to_string(),
                    prediction: prediction.to_string(),
                    value: self.get(i, j),
                });
            }
        }
        rows
    }

    /// Heatmap as a standalone SVG document.
    ///
    /// Rows are targets and columns predictions, both labelled from the
    /// vocabulary; column labels are rotated 45 degrees. Every cell carries
    /// its value rounded to two decimals.
    pub fn to_svg(&self) -> String {
        let n = self.n();
        let size = MARGIN_PX + n * CELL_PX + 20;
        let mut svg = String::new();

        // writing into a String cannot fail
        let _ = writeln!(
            svg,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{size}" height="{size}" font-family="sans-serif">"#
        );
        let _ = writeln!(
            svg,
            r#"<text x="{}" y="20" font-size="16" text-anchor="middle">Confusion matrix</text>"#,
            size / 2
        );

        for (i, tag) in self.tags.iter().enumerate() {
            let y = MARGIN_PX + i * CELL_PX + CELL_PX / 2;
            let _ = writeln!(
                svg,
                r#"<text x="{}" y="{y}" font-size="10" text-anchor="end" dominant-baseline="middle">{}</text>"#,
                MARGIN_PX - 4,
                escape(tag)
            );
            let x = MARGIN_PX + i * CELL_PX + CELL_PX / 2;
            let _ = writeln!(
                svg,
                r#"<text x="{x}" y="{}" font-size="10" text-anchor="end" transform="rotate(-45 {x} {})">{}</text>"#,
                MARGIN_PX - 4,
                MARGIN_PX - 4,
                escape(tag)
            );
        }

        for i in 0..n {
            for j in 0..n {
                let value = self.get(i, j);
                let x = MARGIN_PX + j * CELL_PX;
                let y = MARGIN_PX + i * CELL_PX;
                let _ = writeln!(
                    svg,
                    r#"<rect x="{x}" y="{y}" width="{CELL_PX}" height="{CELL_PX}" fill="{}"/>"#,
                    heat_color(value)
                );
                let _ = writeln!(
                    svg,
                    r#"<text x="{}" y="{}" font-size="8" fill="white" text-anchor="middle" dominant-baseline="middle">{:.2}</text>"#,
                    x + CELL_PX / 2,
                    y + CELL_PX / 2,
                    value
                );
            }
        }

        svg.push_str("</svg>\n");
        svg
    }

    /// Rows as JSON arrays in `TABLE_COLUMNS` order.
    pub fn table_data(&self) -> Vec<serde_json::Value> {
        self.rows()
            .into_iter()
            .map(|row| serde_json::json!([row.target, row.prediction, row.value]))
            .collect()
    }
}

/// Dark blue (0.0) through teal to yellow (1.0), close to viridis.
fn heat_color(value: f64) -> String {
    const STOPS: [(f64, [u8; 3]); 3] = [(0.0, [68, 1, 84]), (0.5, [33, 145, 140]), (1.0, [253, 231, 37])];
    let v = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    let (lo, hi) = if v <= 0.5 { (STOPS[0], STOPS[1]) } else { (STOPS[1], STOPS[2]) };
    let t = (v - lo.0) / (hi.0 - lo.0);
    let mix = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * t).round() as u8;
    format!(
        "#{:02x}{:02x}{:02x}",
        mix(lo.1[0], hi.1[0]),
        mix(lo.1[1], hi.1[1]),
        mix(lo.1[2], hi.1[2])
    )
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
