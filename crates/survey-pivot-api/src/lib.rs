use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use survey_pivot_core::{
    discover_groups, filter_by_demographic, partition_by_category, recompute, CategoryView,
    DriftReport, PivotView, Selection,
};
use survey_pivot_store::RecordStore;
use time::OffsetDateTime;

pub mod presentation;

pub use presentation::{BarPoint, ChartModel, ChartSeries, TableModel, EMPTY_CELL};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetadataSummary {
    pub sample_size: f64,
    pub demographics: Vec<String>,
    pub item_count: usize,
    pub scale_count: usize,
    pub record_count: usize,
    pub snapshot_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub loaded_at: OffsetDateTime,
    pub drift: DriftReport,
}

/// Selection as it arrives from a query string or command line; omitted fields take defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ViewRequest {
    pub demographic: Option<String>,
    pub view: Option<String>,
}

impl ViewRequest {
    /// Resolve against the default selection (`Overall`, `items`). Empty values count as omitted.
    ///
    /// # Errors
    /// Returns an error when `view` is neither `items` nor `scales`.
    pub fn into_selection(self) -> Result<Selection> {
        let defaults = Selection::default();
        let view = match non_empty(self.view) {
            Some(view) => view.parse::<CategoryView>().context("invalid view selection")?,
            None => defaults.view,
        };
        Ok(Selection::new(non_empty(self.demographic).unwrap_or(defaults.demographic), view))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Clone)]
pub struct SurveyPivotApi {
    store: Arc<RecordStore>,
}

impl SurveyPivotApi {
    #[must_use]
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    #[must_use]
    pub fn metadata_summary(&self) -> MetadataSummary {
        let metadata = self.store.metadata();
        MetadataSummary {
            sample_size: metadata.sample_size,
            demographics: metadata.demographics.clone(),
            item_count: metadata.category_keys(CategoryView::Items).len(),
            scale_count: metadata.category_keys(CategoryView::Scales).len(),
            record_count: self.store.records().len(),
            snapshot_id: self.store.snapshot_id().to_string(),
            loaded_at: self.store.loaded_at(),
            drift: self.store.drift().clone(),
        }
    }

    #[must_use]
    pub fn view(&self, selection: &Selection) -> PivotView {
        build_view(&self.store, selection)
    }

    /// Series order for a selection without building the rows.
    #[must_use]
    pub fn groups(&self, selection: &Selection) -> Vec<String> {
        let subset = filter_by_demographic(self.store.records(), &selection.demographic);
        let partition = partition_by_category(&subset, self.store.metadata());
        discover_groups(partition.select(selection.view))
    }

    #[must_use]
    pub fn drift(&self) -> &DriftReport {
        self.store.drift()
    }

    #[must_use]
    pub fn dashboard(&self) -> Dashboard {
        Dashboard { store: Arc::clone(&self.store), selection: Selection::default() }
    }
}

fn build_view(store: &RecordStore, selection: &Selection) -> PivotView {
    let view = recompute(store.records(), store.metadata(), selection);
    tracing::debug!(
        demographic = %selection.demographic,
        view = %selection.view,
        groups = view.groups.len(),
        rows = view.rows.len(),
        "recomputed pivot view"
    );
    view
}

/// Interactive selection state. Every change recomputes the view from the store.
#[derive(Debug, Clone)]
pub struct Dashboard {
    store: Arc<RecordStore>,
    selection: Selection,
}

impl Dashboard {
    #[must_use]
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    #[must_use]
    pub fn demographics(&self) -> &[String] {
        &self.store.metadata().demographics
    }

    pub fn select_demographic(&mut self, demographic: impl Into<String>) -> PivotView {
        self.selection.demographic = demographic.into();
        self.current()
    }

    pub fn select_view(&mut self, view: CategoryView) -> PivotView {
        self.selection.view = view;
        self.current()
    }

    #[must_use]
    pub fn current(&self) -> PivotView {
        build_view(&self.store, &self.selection)
    }
}
