use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Demographic key every metadata descriptor is expected to declare.
pub const OVERALL_DEMOGRAPHIC: &str = "Overall";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PivotError {
    #[error("unknown category view `{0}` (expected `items` or `scales`)")]
    UnknownView(String),
    #[error("failed to decode {what}: {message}")]
    Decode { what: &'static str, message: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum CategoryView {
    #[default]
    Items,
    Scales,
}

impl CategoryView {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Items => "items",
            Self::Scales => "scales",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "items" => Some(Self::Items),
            "scales" => Some(Self::Scales),
            _ => None,
        }
    }
}

impl Display for CategoryView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CategoryView {
    type Err = PivotError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| PivotError::UnknownView(value.to_string()))
    }
}

/// One precomputed statistic row for an (item, group, demographic) triple.
///
/// Statistical fields are carried as-is, `n` included, so `150.0` survives as
/// written. A JSON `null` in any of them decodes to NaN and serializes back to `null`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryRecord {
    #[serde(deserialize_with = "string_key")]
    pub item: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_label: Option<String>,
    #[serde(deserialize_with = "string_key")]
    pub demographic: String,
    #[serde(deserialize_with = "string_key")]
    pub group: String,
    #[serde(deserialize_with = "nullable_f64")]
    pub mean: f64,
    #[serde(deserialize_with = "nullable_f64")]
    pub sd: f64,
    #[serde(deserialize_with = "nullable_f64")]
    pub n: f64,
    #[serde(deserialize_with = "nullable_f64")]
    pub ci_lower: f64,
    #[serde(deserialize_with = "nullable_f64")]
    pub ci_upper: f64,
}

impl SummaryRecord {
    /// Display label, falling back to the item key.
    #[must_use]
    pub fn label(&self) -> &str {
        self.item_label.as_deref().unwrap_or(&self.item)
    }
}

fn nullable_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KeyRepr {
    Text(String),
    Integer(i64),
    Float(f64),
    Flag(bool),
}

// Upstream exports sometimes emit numeric group codes; keys are compared as strings.
fn string_key<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match KeyRepr::deserialize(deserializer)? {
        KeyRepr::Text(value) => value,
        KeyRepr::Integer(value) => value.to_string(),
        KeyRepr::Float(value) => value.to_string(),
        KeyRepr::Flag(value) => value.to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ScoreTypes {
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub scales: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Metadata {
    #[serde(default, deserialize_with = "nullable_f64")]
    pub sample_size: f64,
    #[serde(default)]
    pub demographics: Vec<String>,
    #[serde(default)]
    pub score_types: ScoreTypes,
}

impl Metadata {
    /// Category an item key belongs to. Item membership wins when a key is listed twice.
    #[must_use]
    pub fn category_of(&self, item: &str) -> Option<CategoryView> {
        if self.score_types.items.iter().any(|key| key == item) {
            return Some(CategoryView::Items);
        }
        if self.score_types.scales.iter().any(|key| key == item) {
            return Some(CategoryView::Scales);
        }
        None
    }

    #[must_use]
    pub fn category_keys(&self, view: CategoryView) -> &[String] {
        match view {
            CategoryView::Items => &self.score_types.items,
            CategoryView::Scales => &self.score_types.scales,
        }
    }
}

/// Decode the summary-records payload (a JSON array of flat objects).
///
/// # Errors
/// Returns [`PivotError::Decode`] when the payload is not a JSON array of records.
pub fn parse_summary_records(body: &str) -> Result<Vec<SummaryRecord>, PivotError> {
    serde_json::from_str(body).map_err(|err| PivotError::Decode {
        what: "summary records",
        message: err.to_string(),
    })
}

/// Decode the metadata payload (one JSON object).
///
/// # Errors
/// Returns [`PivotError::Decode`] when the payload is not a metadata object.
pub fn parse_metadata(body: &str) -> Result<Metadata, PivotError> {
    let decode_error = |message: String| PivotError::Decode { what: "metadata", message };
    let value: Value = serde_json::from_str(body).map_err(|err| decode_error(err.to_string()))?;
    // Every field has a default, so a bare array would otherwise decode as empty metadata.
    if !value.is_object() {
        return Err(decode_error(format!("expected a JSON object, found {}", json_kind(&value))));
    }
    serde_json::from_value(value).map_err(|err| decode_error(err.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// The two selection variables that drive recomputation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Selection {
    pub demographic: String,
    pub view: CategoryView,
}

impl Selection {
    #[must_use]
    pub fn new(demographic: impl Into<String>, view: CategoryView) -> Self {
        Self { demographic: demographic.into(), view }
    }
}

impl Default for Selection {
    fn default() -> Self {
        Self::new(OVERALL_DEMOGRAPHIC, CategoryView::Items)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GroupStats {
    pub mean: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub n: f64,
    pub sd: f64,
}

impl GroupStats {
    #[must_use]
    pub fn ci(&self) -> [f64; 2] {
        [self.ci_lower, self.ci_upper]
    }
}

impl From<&SummaryRecord> for GroupStats {
    fn from(record: &SummaryRecord) -> Self {
        Self {
            mean: record.mean,
            ci_lower: record.ci_lower,
            ci_upper: record.ci_upper,
            n: record.n,
            sd: record.sd,
        }
    }
}

/// One output row per item; groups without data are absent from `groups`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PivotedRow {
    pub item: String,
    pub label: String,
    pub groups: BTreeMap<String, GroupStats>,
}

impl PivotedRow {
    fn seeded_from(record: &SummaryRecord) -> Self {
        Self {
            item: record.item.clone(),
            label: record.label().to_string(),
            groups: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn stats(&self, group: &str) -> Option<&GroupStats> {
        self.groups.get(group)
    }

    /// Dynamically keyed form: `{item, label, G, G_ci, G_n, G_sd, ...}`.
    #[must_use]
    pub fn to_flat_json(&self) -> Map<String, Value> {
        let mut object = Map::new();
        object.insert("item".to_string(), Value::String(self.item.clone()));
        object.insert("label".to_string(), Value::String(self.label.clone()));
        for (group, stats) in &self.groups {
            object.insert(group.clone(), Value::from(stats.mean));
            object.insert(
                format!("{group}_ci"),
                Value::Array(vec![Value::from(stats.ci_lower), Value::from(stats.ci_upper)]),
            );
            object.insert(format!("{group}_n"), Value::from(stats.n));
            object.insert(format!("{group}_sd"), Value::from(stats.sd));
        }
        object
    }
}

/// Result of one full recomputation for a selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PivotView {
    pub demographic: String,
    pub view: CategoryView,
    pub groups: Vec<String>,
    pub rows: Vec<PivotedRow>,
}

impl PivotView {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn flat_rows(&self) -> Vec<Value> {
        self.rows.iter().map(|row| Value::Object(row.to_flat_json())).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategoryPartition<'a> {
    pub items: Vec<&'a SummaryRecord>,
    pub scales: Vec<&'a SummaryRecord>,
}

impl<'a> CategoryPartition<'a> {
    #[must_use]
    pub fn select(&self, view: CategoryView) -> &[&'a SummaryRecord] {
        match view {
            CategoryView::Items => &self.items,
            CategoryView::Scales => &self.scales,
        }
    }
}

/// Records whose `demographic` equals `demographic` exactly, in input order.
#[must_use]
pub fn filter_by_demographic<'a>(
    records: &'a [SummaryRecord],
    demographic: &str,
) -> Vec<&'a SummaryRecord> {
    records.iter().filter(|record| record.demographic == demographic).collect()
}

/// Split a filtered subset by category membership.
///
/// Records whose item is in neither category list are dropped from both outputs.
#[must_use]
pub fn partition_by_category<'a>(
    subset: &[&'a SummaryRecord],
    metadata: &Metadata,
) -> CategoryPartition<'a> {
    let item_keys = metadata.score_types.items.iter().map(String::as_str).collect::<BTreeSet<_>>();
    let scale_keys =
        metadata.score_types.scales.iter().map(String::as_str).collect::<BTreeSet<_>>();

    let mut partition = CategoryPartition::default();
    for record in subset {
        if item_keys.contains(record.item.as_str()) {
            partition.items.push(*record);
        } else if scale_keys.contains(record.item.as_str()) {
            partition.scales.push(*record);
        }
    }
    partition
}

/// Distinct group keys in first-occurrence order.
#[must_use]
pub fn discover_groups(subset: &[&SummaryRecord]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut groups = Vec::new();
    for record in subset {
        if seen.insert(record.group.as_str()) {
            groups.push(record.group.clone());
        }
    }
    groups
}

/// Reshape item x group records into one row per item, in first-occurrence order.
///
/// The label comes from the first record seen for an item. A repeated
/// (item, group) pair overwrites the earlier stats.
#[must_use]
pub fn pivot(subset: &[&SummaryRecord]) -> Vec<PivotedRow> {
    let mut rows: Vec<PivotedRow> = Vec::new();
    let mut row_index: BTreeMap<&str, usize> = BTreeMap::new();

    for record in subset {
        let index = *row_index.entry(record.item.as_str()).or_insert_with(|| {
            rows.push(PivotedRow::seeded_from(record));
            rows.len() - 1
        });
        rows[index].groups.insert(record.group.clone(), GroupStats::from(*record));
    }

    rows
}

/// Run filter, partition, group discovery and pivot from scratch for one selection.
#[must_use]
pub fn recompute(
    records: &[SummaryRecord],
    metadata: &Metadata,
    selection: &Selection,
) -> PivotView {
    let subset = filter_by_demographic(records, &selection.demographic);
    let partition = partition_by_category(&subset, metadata);
    let selected = partition.select(selection.view);

    PivotView {
        demographic: selection.demographic.clone(),
        view: selection.view,
        groups: discover_groups(selected),
        rows: pivot(selected),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct RecordKey {
    pub item: String,
    pub group: String,
    pub demographic: String,
}

/// Mismatches between the records and the metadata. Reported, never enforced.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct DriftReport {
    pub unclassified_items: Vec<String>,
    pub duplicate_triples: Vec<RecordKey>,
    pub undeclared_demographics: Vec<String>,
    pub missing_overall: bool,
}

impl DriftReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.unclassified_items.is_empty()
            && self.duplicate_triples.is_empty()
            && self.undeclared_demographics.is_empty()
            && !self.missing_overall
    }
}

#[must_use]
pub fn detect_schema_drift(records: &[SummaryRecord], metadata: &Metadata) -> DriftReport {
    let declared = metadata.demographics.iter().map(String::as_str).collect::<BTreeSet<_>>();
    let mut seen_items = BTreeSet::new();
    let mut seen_demographics = BTreeSet::new();
    let mut seen_triples = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    let mut report = DriftReport {
        missing_overall: !declared.contains(OVERALL_DEMOGRAPHIC),
        ..DriftReport::default()
    };

    for record in records {
        if seen_items.insert(record.item.as_str()) && metadata.category_of(&record.item).is_none() {
            report.unclassified_items.push(record.item.clone());
        }

        if seen_demographics.insert(record.demographic.as_str())
            && !declared.contains(record.demographic.as_str())
        {
            report.undeclared_demographics.push(record.demographic.clone());
        }

        let key = RecordKey {
            item: record.item.clone(),
            group: record.group.clone(),
            demographic: record.demographic.clone(),
        };
        if !seen_triples.insert(key.clone()) {
            duplicates.insert(key);
        }
    }

    report.duplicate_triples = duplicates.into_iter().collect();
    report
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn mk_record(
        item: &str,
        label: Option<&str>,
        demographic: &str,
        group: &str,
        mean: f64,
        n: u32,
    ) -> SummaryRecord {
        SummaryRecord {
            item: item.to_string(),
            item_label: label.map(str::to_string),
            demographic: demographic.to_string(),
            group: group.to_string(),
            mean,
            sd: 0.5,
            n: f64::from(n),
            ci_lower: mean - 0.2,
            ci_upper: mean + 0.2,
        }
    }

    fn mk_metadata(items: &[&str], scales: &[&str]) -> Metadata {
        Metadata {
            sample_size: 300.0,
            demographics: vec!["Overall".to_string(), "Gender".to_string()],
            score_types: ScoreTypes {
                items: items.iter().map(|key| (*key).to_string()).collect(),
                scales: scales.iter().map(|key| (*key).to_string()).collect(),
            },
        }
    }

    fn items_of(rows: &[PivotedRow]) -> Vec<&str> {
        rows.iter().map(|row| row.item.as_str()).collect()
    }

    // Test IDs: TFLT-001
    #[test]
    fn filter_matches_demographic_exactly_and_keeps_order() {
        let records = vec![
            mk_record("i1", None, "Gender", "Male", 3.0, 10),
            mk_record("i1", None, "Overall", "All", 3.1, 20),
            mk_record("i2", None, "Gender", "Female", 3.2, 11),
            mk_record("i2", None, "gender", "Female", 3.3, 12),
        ];

        let subset = filter_by_demographic(&records, "Gender");
        assert_eq!(subset.len(), 2);
        assert_eq!(subset[0].group, "Male");
        assert_eq!(subset[1].group, "Female");
    }

    // Test IDs: TFLT-002
    #[test]
    fn filter_with_unknown_demographic_is_empty_not_an_error() {
        let records = vec![mk_record("i1", None, "Overall", "All", 3.0, 10)];
        assert!(filter_by_demographic(&records, "Region").is_empty());
    }

    // Test IDs: TFLT-003
    #[test]
    fn partition_drops_unclassified_items_silently() {
        let records = vec![
            mk_record("i1", None, "Overall", "All", 3.0, 10),
            mk_record("s1", None, "Overall", "All", 2.0, 10),
            mk_record("ghost", None, "Overall", "All", 1.0, 10),
        ];
        let metadata = mk_metadata(&["i1"], &["s1"]);
        let subset = filter_by_demographic(&records, "Overall");

        let partition = partition_by_category(&subset, &metadata);
        assert_eq!(partition.items.len(), 1);
        assert_eq!(partition.items[0].item, "i1");
        assert_eq!(partition.scales.len(), 1);
        assert_eq!(partition.scales[0].item, "s1");
    }

    // Test IDs: TFLT-004
    #[test]
    fn partition_assigns_doubly_listed_item_to_items_only() {
        let records = vec![mk_record("both", None, "Overall", "All", 3.0, 10)];
        let metadata = mk_metadata(&["both"], &["both"]);
        let subset = filter_by_demographic(&records, "Overall");

        let partition = partition_by_category(&subset, &metadata);
        assert_eq!(partition.items.len(), 1);
        assert!(partition.scales.is_empty());
        assert_eq!(metadata.category_of("both"), Some(CategoryView::Items));
    }

    // Test IDs: TGRP-001
    #[test]
    fn discover_groups_is_distinct_in_first_occurrence_order() {
        let records = vec![
            mk_record("i1", None, "Gender", "Male", 3.0, 10),
            mk_record("i1", None, "Gender", "Female", 3.0, 10),
            mk_record("i2", None, "Gender", "Male", 3.0, 10),
        ];
        let subset = filter_by_demographic(&records, "Gender");

        assert_eq!(discover_groups(&subset), vec!["Male".to_string(), "Female".to_string()]);
    }

    // Test IDs: TPIV-001
    #[test]
    fn pivot_later_duplicate_overwrites_earlier() {
        let records = vec![
            mk_record("a", None, "Overall", "X", 1.0, 10),
            mk_record("a", None, "Overall", "X", 2.0, 20),
        ];
        let subset = filter_by_demographic(&records, "Overall");

        let rows = pivot(&subset);
        assert_eq!(rows.len(), 1);
        let stats = rows[0].stats("X").unwrap_or_else(|| panic!("group X should be present"));
        assert!((stats.mean - 2.0).abs() < f64::EPSILON);
        assert!((stats.n - 20.0).abs() < f64::EPSILON);
    }

    // Test IDs: TPIV-002
    #[test]
    fn pivot_leaves_missing_groups_absent() {
        let records = vec![
            mk_record("a", None, "Gender", "Male", 3.0, 10),
            mk_record("a", None, "Gender", "Female", 3.5, 12),
            mk_record("b", None, "Gender", "Female", 4.0, 9),
        ];
        let subset = filter_by_demographic(&records, "Gender");

        let rows = pivot(&subset);
        assert_eq!(items_of(&rows), vec!["a", "b"]);
        assert!(rows[1].stats("Male").is_none());
        assert!(rows[1].stats("Female").is_some());

        let flat = rows[1].to_flat_json();
        for key in ["Male", "Male_ci", "Male_n", "Male_sd"] {
            assert!(!flat.contains_key(key), "unexpected key {key} in {flat:?}");
        }
        for key in ["Female", "Female_ci", "Female_n", "Female_sd"] {
            assert!(flat.contains_key(key), "missing key {key} in {flat:?}");
        }
    }

    // Test IDs: TPIV-003
    #[test]
    fn pivot_label_comes_from_first_record_with_item_key_fallback() {
        let records = vec![
            mk_record("a", None, "Gender", "Male", 3.0, 10),
            mk_record("a", Some("Later Label"), "Gender", "Female", 3.0, 10),
            mk_record("b", Some("Item B"), "Gender", "Male", 3.0, 10),
        ];
        let subset = filter_by_demographic(&records, "Gender");

        let rows = pivot(&subset);
        assert_eq!(rows[0].label, "a");
        assert_eq!(rows[1].label, "Item B");
    }

    // Test IDs: TPIV-004
    #[test]
    fn pivot_of_empty_subset_is_empty() {
        assert!(pivot(&[]).is_empty());
        assert!(discover_groups(&[]).is_empty());
    }

    // Test IDs: TE2E-001
    #[test]
    fn overall_items_view_end_to_end() {
        let records = match parse_summary_records(
            r#"[{"item":"i1","item_label":"Item One","demographic":"Overall","group":"All",
                 "mean":3.2,"sd":0.8,"n":150,"ci_lower":3.0,"ci_upper":3.4}]"#,
        ) {
            Ok(records) => records,
            Err(err) => panic!("records fixture should decode: {err}"),
        };
        let metadata = match parse_metadata(
            r#"{"demographics":["Overall"],"score_types":{"items":["i1"],"scales":[]}}"#,
        ) {
            Ok(metadata) => metadata,
            Err(err) => panic!("metadata fixture should decode: {err}"),
        };

        let view = recompute(&records, &metadata, &Selection::default());
        assert_eq!(view.groups, vec!["All".to_string()]);
        assert_eq!(view.rows.len(), 1);

        let flat = Value::Object(view.rows[0].to_flat_json());
        assert_eq!(
            flat,
            serde_json::json!({
                "item": "i1",
                "label": "Item One",
                "All": 3.2,
                "All_ci": [3.0, 3.4],
                "All_n": 150.0,
                "All_sd": 0.8
            })
        );
    }

    // Test IDs: TE2E-002
    #[test]
    fn recompute_switches_views_without_carrying_state() {
        let records = vec![
            mk_record("i1", Some("Item One"), "Overall", "All", 3.0, 10),
            mk_record("s1", Some("Scale One"), "Overall", "All", 2.0, 10),
            mk_record("s1", Some("Scale One"), "Gender", "Male", 2.5, 5),
        ];
        let metadata = mk_metadata(&["i1"], &["s1"]);

        let items = recompute(&records, &metadata, &Selection::default());
        let scales =
            recompute(&records, &metadata, &Selection::new("Overall", CategoryView::Scales));
        let gender_items =
            recompute(&records, &metadata, &Selection::new("Gender", CategoryView::Items));
        let items_again = recompute(&records, &metadata, &Selection::default());

        assert_eq!(items_of(&items.rows), vec!["i1"]);
        assert_eq!(items_of(&scales.rows), vec!["s1"]);
        assert!(gender_items.is_empty());
        assert!(gender_items.groups.is_empty());
        assert_eq!(items, items_again);
    }

    // Test IDs: TDEC-001
    #[test]
    fn null_statistics_decode_as_nan_and_flatten_to_null() {
        let records = match parse_summary_records(
            r#"[{"item":"i1","demographic":"Age","group":25,"mean":4.0,"sd":null,"n":1,
                 "ci_lower":null,"ci_upper":null}]"#,
        ) {
            Ok(records) => records,
            Err(err) => panic!("records fixture should decode: {err}"),
        };

        assert_eq!(records[0].group, "25");
        assert!(records[0].sd.is_nan());
        assert_eq!(records[0].label(), "i1");

        let subset = filter_by_demographic(&records, "Age");
        let flat = pivot(&subset)[0].to_flat_json();
        assert_eq!(flat.get("25_sd"), Some(&Value::Null));
        assert_eq!(flat.get("25_ci"), Some(&serde_json::json!([null, null])));
    }

    // Test IDs: TDEC-002
    #[test]
    fn malformed_payloads_report_decode_errors() {
        let err = match parse_summary_records(r#"{"not":"a list"}"#) {
            Ok(records) => panic!("expected decode error, got {records:?}"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("summary records"));

        let err = match parse_metadata("[]") {
            Ok(metadata) => panic!("expected decode error, got {metadata:?}"),
            Err(err) => err,
        };
        assert!(matches!(err, PivotError::Decode { what: "metadata", .. }));
        assert!(err.to_string().contains("expected a JSON object, found an array"));

        for body in ["null", "\"metadata\"", "240"] {
            match parse_metadata(body) {
                Ok(metadata) => panic!("`{body}` should not decode as metadata: {metadata:?}"),
                Err(err) => assert!(matches!(err, PivotError::Decode { what: "metadata", .. })),
            }
        }
    }

    // Test IDs: TDEC-003
    #[test]
    fn float_and_null_counts_pass_through_unchanged() {
        let records = match parse_summary_records(
            r#"[{"item":"i1","demographic":"Overall","group":"All","mean":3.0,"sd":0.4,
                 "n":150.0,"ci_lower":2.9,"ci_upper":3.1},
                {"item":"i2","demographic":"Overall","group":"All","mean":2.0,"sd":0.4,
                 "n":null,"ci_lower":1.9,"ci_upper":2.1},
                {"item":"i3","demographic":"Overall","group":"All","mean":2.5,"sd":0.4,
                 "n":12.5,"ci_lower":2.4,"ci_upper":2.6}]"#,
        ) {
            Ok(records) => records,
            Err(err) => panic!("records with float and null counts should decode: {err}"),
        };
        assert!((records[0].n - 150.0).abs() < f64::EPSILON);
        assert!(records[1].n.is_nan());
        assert!((records[2].n - 12.5).abs() < f64::EPSILON);

        let subset = records.iter().collect::<Vec<_>>();
        let rows = pivot(&subset);
        assert_eq!(rows[0].to_flat_json().get("All_n"), Some(&serde_json::json!(150.0)));
        assert_eq!(rows[1].to_flat_json().get("All_n"), Some(&Value::Null));

        let metadata = match parse_metadata(r#"{"sample_size":240.0,"demographics":["Overall"]}"#)
        {
            Ok(metadata) => metadata,
            Err(err) => panic!("float sample size should decode: {err}"),
        };
        assert!((metadata.sample_size - 240.0).abs() < f64::EPSILON);

        let metadata = match parse_metadata(r#"{"sample_size":null}"#) {
            Ok(metadata) => metadata,
            Err(err) => panic!("null sample size should decode: {err}"),
        };
        assert!(metadata.sample_size.is_nan());
        let defaulted = parse_metadata("{}");
        assert!(defaulted.is_ok_and(|metadata| metadata.sample_size.abs() < f64::EPSILON));
    }

    // Test IDs: TSEL-001
    #[test]
    fn category_view_parses_known_names_only() {
        assert_eq!("scales".parse::<CategoryView>(), Ok(CategoryView::Scales));
        assert_eq!(CategoryView::parse("items"), Some(CategoryView::Items));
        assert_eq!(
            "Scales".parse::<CategoryView>(),
            Err(PivotError::UnknownView("Scales".to_string()))
        );
        assert_eq!(Selection::default().demographic, OVERALL_DEMOGRAPHIC);
    }

    // Test IDs: TDRF-001
    #[test]
    fn drift_report_lists_mismatches_without_touching_pivot() {
        let records = vec![
            mk_record("i1", None, "Overall", "All", 3.0, 10),
            mk_record("ghost", None, "Overall", "All", 1.0, 10),
            mk_record("i1", None, "Overall", "All", 3.5, 11),
            mk_record("i1", None, "Region", "North", 3.5, 11),
        ];
        let mut metadata = mk_metadata(&["i1"], &[]);
        metadata.demographics = vec!["Gender".to_string()];

        let report = detect_schema_drift(&records, &metadata);
        assert!(!report.is_clean());
        assert_eq!(report.unclassified_items, vec!["ghost".to_string()]);
        assert_eq!(
            report.duplicate_triples,
            vec![RecordKey {
                item: "i1".to_string(),
                group: "All".to_string(),
                demographic: "Overall".to_string(),
            }]
        );
        assert_eq!(
            report.undeclared_demographics,
            vec!["Overall".to_string(), "Region".to_string()]
        );
        assert!(report.missing_overall);

        let clean = detect_schema_drift(&records[..1], &mk_metadata(&["i1"], &[]));
        assert!(clean.is_clean());
    }

    fn arb_record() -> impl Strategy<Value = SummaryRecord> {
        (
            prop::sample::select(vec!["i1", "i2", "i3", "s1", "s2", "x9"]),
            prop::sample::select(vec!["Overall", "Gender", "Age"]),
            prop::sample::select(vec!["All", "Male", "Female", "18-34", "35+"]),
            0.0_f64..5.0,
            0_u32..500,
        )
            .prop_map(|(item, demographic, group, mean, n)| {
                mk_record(item, None, demographic, group, mean, n)
            })
    }

    fn first_occurrence<'a>(values: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
        let mut seen = BTreeSet::new();
        values.filter(|value| seen.insert(*value)).collect()
    }

    proptest! {
        #[test]
        fn property_filter_is_an_order_preserving_exact_subset(
            records in prop::collection::vec(arb_record(), 0..40),
            key in prop::sample::select(vec!["Overall", "Gender", "Age", "Region"]),
        ) {
            let subset = filter_by_demographic(&records, key);
            prop_assert!(subset.iter().all(|record| record.demographic == key));
            let expected =
                records.iter().filter(|record| record.demographic == key).collect::<Vec<_>>();
            prop_assert_eq!(subset, expected);
        }

        #[test]
        fn property_partition_is_complete_and_exclusive(
            records in prop::collection::vec(arb_record(), 0..40),
        ) {
            let metadata = mk_metadata(&["i1", "i2", "i3"], &["s1", "s2"]);
            let subset = filter_by_demographic(&records, "Gender");
            let partition = partition_by_category(&subset, &metadata);

            prop_assert!(partition.items.iter().all(|record| record.item.starts_with('i')));
            prop_assert!(partition.scales.iter().all(|record| record.item.starts_with('s')));
            let classified = subset.iter().filter(|record| record.item != "x9").count();
            prop_assert_eq!(partition.items.len() + partition.scales.len(), classified);
        }

        #[test]
        fn property_pivot_has_one_row_per_item_in_first_occurrence_order(
            records in prop::collection::vec(arb_record(), 0..40),
        ) {
            let subset = records.iter().collect::<Vec<_>>();
            let rows = pivot(&subset);
            let expected = first_occurrence(records.iter().map(|record| record.item.as_str()));
            prop_assert_eq!(items_of(&rows), expected);
        }

        #[test]
        fn property_pivot_cells_hold_last_record_per_item_and_group(
            records in prop::collection::vec(arb_record(), 0..40),
        ) {
            let subset = filter_by_demographic(&records, "Gender");
            let rows = pivot(&subset);
            for row in &rows {
                for (group, stats) in &row.groups {
                    let last = subset
                        .iter()
                        .rev()
                        .find(|record| record.item == row.item && &record.group == group);
                    prop_assert_eq!(last.map(|record| GroupStats::from(*record)), Some(*stats));
                }
                let present = subset.iter().filter(|record| record.item == row.item).count();
                prop_assert!(row.groups.len() <= present);
            }
        }

        #[test]
        fn property_discovered_groups_are_distinct_first_occurrences(
            records in prop::collection::vec(arb_record(), 0..40),
        ) {
            let subset = records.iter().collect::<Vec<_>>();
            let groups = discover_groups(&subset);
            let expected = first_occurrence(records.iter().map(|record| record.group.as_str()));
            prop_assert_eq!(groups.iter().map(String::as_str).collect::<Vec<_>>(), expected);
        }
    }
}
