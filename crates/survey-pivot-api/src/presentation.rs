//! Chart and table shapes handed to the rendering layer.
//!
//! Both models follow the series order of [`PivotView::groups`] and the row
//! order of [`PivotView::rows`]. A group with no data for an item becomes an
//! empty placeholder rather than a zero.

use serde::Serialize;
use survey_pivot_core::{GroupStats, PivotView};

/// Placeholder for a table cell whose group has no record for the item.
pub const EMPTY_CELL: &str = "—";

const ITEM_COLUMN: &str = "Item";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BarPoint {
    pub mean: f64,
    pub ci: [f64; 2],
    pub n: f64,
    pub sd: f64,
}

impl From<&GroupStats> for BarPoint {
    fn from(stats: &GroupStats) -> Self {
        Self { mean: stats.mean, ci: stats.ci(), n: stats.n, sd: stats.sd }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChartSeries {
    pub group: String,
    pub points: Vec<Option<BarPoint>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChartModel {
    pub categories: Vec<String>,
    pub series: Vec<ChartSeries>,
}

impl ChartModel {
    #[must_use]
    pub fn from_view(view: &PivotView) -> Self {
        let categories = view.rows.iter().map(|row| row.label.clone()).collect();
        let series = view
            .groups
            .iter()
            .map(|group| ChartSeries {
                group: group.clone(),
                points: view
                    .rows
                    .iter()
                    .map(|row| row.stats(group).map(BarPoint::from))
                    .collect(),
            })
            .collect();
        Self { categories, series }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TableModel {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TableModel {
    #[must_use]
    pub fn from_view(view: &PivotView) -> Self {
        let mut columns = Vec::with_capacity(view.groups.len() + 1);
        columns.push(ITEM_COLUMN.to_string());
        columns.extend(view.groups.iter().cloned());

        let rows = view
            .rows
            .iter()
            .map(|row| {
                let mut cells = Vec::with_capacity(columns.len());
                cells.push(row.label.clone());
                cells.extend(view.groups.iter().map(|group| {
                    row.stats(group).map_or_else(|| EMPTY_CELL.to_string(), format_cell)
                }));
                cells
            })
            .collect();

        Self { columns, rows }
    }

    /// Plain-text rendering with left-aligned, padded columns.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut widths =
            self.columns.iter().map(|column| column.chars().count()).collect::<Vec<_>>();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let mut lines = Vec::with_capacity(self.rows.len() + 2);
        lines.push(render_line(&self.columns, &widths));
        lines.push(widths.iter().map(|width| "-".repeat(*width)).collect::<Vec<_>>().join("  "));
        for row in &self.rows {
            lines.push(render_line(row, &widths));
        }
        lines.join("\n")
    }
}

fn render_line(cells: &[String], widths: &[usize]) -> String {
    cells
        .iter()
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_string()
}

fn format_cell(stats: &GroupStats) -> String {
    format!(
        "{:.2} [{:.2}, {:.2}] (n={}, sd={:.2})",
        stats.mean, stats.ci_lower, stats.ci_upper, stats.n, stats.sd
    )
}
