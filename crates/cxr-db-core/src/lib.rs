use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::{Display, Formatter};

use rand::Rng;
use serde::{Deserialize, Serialize};

pub const QUERY_KEY_FILE: &str = "file";
pub const QUERY_KEY_FINDING: &str = "finding";
pub const QUERY_KEY_VIEW_POSITION: &str = "view_position";

/// Label carried by records without any positive finding.
pub const NO_FINDING_LABEL: &str = "No Finding";

pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum BrowseError {
    #[error("data load error: {0}")]
    DataLoad(String),
    #[error("record not found: {0}")]
    RecordNotFound(String),
    #[error("no records match the selected filters")]
    EmptyFilterResult,
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Image filename; primary key of the metadata table.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ImageId(pub String);

impl ImageId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ImageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Borrow<str> for ImageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PatientGender {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
}

impl PatientGender {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Male => "M",
            Self::Female => "F",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "M" => Some(Self::Male),
            "F" => Some(Self::Female),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ViewPosition {
    #[serde(rename = "PA")]
    PosteroAnterior,
    #[serde(rename = "AP")]
    AnteroPosterior,
}

impl ViewPosition {
    pub const ALL: [Self; 2] = [Self::PosteroAnterior, Self::AnteroPosterior];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PosteroAnterior => "PA",
            Self::AnteroPosterior => "AP",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PA" => Some(Self::PosteroAnterior),
            "AP" => Some(Self::AnteroPosterior),
            _ => None,
        }
    }
}

/// View-position choice offered to the user; `Any` disables the predicate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub enum ViewFilter {
    #[default]
    Any,
    #[serde(rename = "PA")]
    PosteroAnterior,
    #[serde(rename = "AP")]
    AnteroPosterior,
}

impl ViewFilter {
    pub const ALL: [Self; 3] = [Self::Any, Self::PosteroAnterior, Self::AnteroPosterior];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "Any",
            Self::PosteroAnterior => "PA",
            Self::AnteroPosterior => "AP",
        }
    }

    /// Case-insensitive, so hand-edited links still resolve.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ANY" => Some(Self::Any),
            "PA" => Some(Self::PosteroAnterior),
            "AP" => Some(Self::AnteroPosterior),
            _ => None,
        }
    }

    #[must_use]
    pub fn position(self) -> Option<ViewPosition> {
        match self {
            Self::Any => None,
            Self::PosteroAnterior => Some(ViewPosition::PosteroAnterior),
            Self::AnteroPosterior => Some(ViewPosition::AnteroPosterior),
        }
    }
}

impl From<ViewPosition> for ViewFilter {
    fn from(value: ViewPosition) -> Self {
        match value {
            ViewPosition::PosteroAnterior => Self::PosteroAnterior,
            ViewPosition::AnteroPosterior => Self::AnteroPosterior,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CxrRecord {
    pub image_id: ImageId,
    pub patient_id: u64,
    pub follow_up: u32,
    pub age: u32,
    pub gender: PatientGender,
    pub view_position: ViewPosition,
    #[serde(default)]
    pub findings: Vec<String>,
}

impl CxrRecord {
    #[must_use]
    pub fn has_any_finding(&self, tags: &BTreeSet<String>) -> bool {
        self.findings.iter().any(|finding| tags.contains(finding))
    }

    /// Findings joined for display, underscores rendered as spaces.
    #[must_use]
    pub fn findings_display(&self) -> String {
        if self.findings.is_empty() {
            return NO_FINDING_LABEL.to_string();
        }
        self.findings.iter().map(|tag| finding_label(tag)).collect::<Vec<_>>().join(", ")
    }
}

#[must_use]
pub fn finding_label(tag: &str) -> String {
    tag.replace('_', " ")
}

/// Immutable metadata table keyed by image identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    records: Vec<CxrRecord>,
    index: HashMap<ImageId, usize>,
    vocabulary: Vec<String>,
    source_digest: String,
}

impl Table {
    /// Build a table from rows in source order.
    ///
    /// # Errors
    /// Returns [`BrowseError::DataLoad`] when two rows share an image identifier.
    pub fn from_records(
        records: Vec<CxrRecord>,
        source_digest: impl Into<String>,
    ) -> Result<Self, BrowseError> {
        let mut index = HashMap::with_capacity(records.len());
        let mut vocabulary = Vec::new();
        let mut seen_tags = BTreeSet::new();

        for (position, record) in records.iter().enumerate() {
            if index.insert(record.image_id.clone(), position).is_some() {
                return Err(BrowseError::DataLoad(format!(
                    "duplicate image identifier {}",
                    record.image_id
                )));
            }
            for tag in &record.findings {
                if seen_tags.insert(tag.as_str()) {
                    vocabulary.push(tag.clone());
                }
            }
        }

        Ok(Self { records, index, vocabulary, source_digest: source_digest.into() })
    }

    #[must_use]
    pub fn get(&self, image_id: &str) -> Option<&CxrRecord> {
        self.index.get(image_id).map(|position| &self.records[*position])
    }

    #[must_use]
    pub fn contains(&self, image_id: &str) -> bool {
        self.index.contains_key(image_id)
    }

    #[must_use]
    pub fn records(&self) -> &[CxrRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct finding tags in order of first appearance.
    #[must_use]
    pub fn vocabulary(&self) -> &[String] {
        &self.vocabulary
    }

    #[must_use]
    pub fn source_digest(&self) -> &str {
        &self.source_digest
    }

    #[must_use]
    pub fn count_by_view(&self, view_position: ViewPosition) -> usize {
        self.records.iter().filter(|record| record.view_position == view_position).count()
    }
}

/// Active predicates plus the optional pinned record.
///
/// `pinned == None` is the "awaiting selection" state: the next cycle draws a
/// random record and pins it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct FilterState {
    pub view_position: Option<ViewFilter>,
    #[serde(default)]
    pub findings: BTreeSet<String>,
    pub pinned: Option<ImageId>,
}

impl FilterState {
    #[must_use]
    pub fn effective_view(&self) -> ViewFilter {
        self.view_position.unwrap_or_default()
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    #[must_use]
    pub fn matches(&self, record: &CxrRecord) -> bool {
        let view_ok = self
            .effective_view()
            .position()
            .map_or(true, |position| record.view_position == position);
        let findings_ok = self.findings.is_empty() || record.has_any_finding(&self.findings);
        view_ok && findings_ok
    }
}

/// Rows of a [`Table`] satisfying a [`FilterState`], in table order.
#[derive(Debug, Clone, Default)]
pub struct FilteredView<'a> {
    records: Vec<&'a CxrRecord>,
}

impl<'a> FilteredView<'a> {
    #[must_use]
    pub fn records(&self) -> &[&'a CxrRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn contains(&self, image_id: &str) -> bool {
        self.records.iter().any(|record| record.image_id.as_str() == image_id)
    }
}

/// Conjunction of the view-position and match-any finding predicates.
#[must_use]
pub fn apply<'a>(table: &'a Table, filter: &FilterState) -> FilteredView<'a> {
    FilteredView { records: table.records().iter().filter(|record| filter.matches(record)).collect() }
}

/// Pick the record to display.
///
/// A pinned identifier is looked up in the full table so shared links
/// resolve regardless of the active predicates. Without a pin, one row of
/// `filtered` is drawn uniformly and pinned into `filter`.
///
/// # Errors
/// Returns [`BrowseError::RecordNotFound`] for a pin absent from `table`, and
/// [`BrowseError::EmptyFilterResult`] when a draw is needed but `filtered` is empty.
pub fn resolve<'a, R>(
    filtered: &FilteredView<'a>,
    table: &'a Table,
    filter: &mut FilterState,
    rng: &mut R,
) -> Result<&'a CxrRecord, BrowseError>
where
    R: Rng + ?Sized,
{
    if let Some(pinned) = &filter.pinned {
        return table
            .get(pinned.as_str())
            .ok_or_else(|| BrowseError::RecordNotFound(pinned.to_string()));
    }

    if filtered.is_empty() {
        return Err(BrowseError::EmptyFilterResult);
    }
    let record = filtered.records[rng.gen_range(0..filtered.len())];
    filter.pinned = Some(record.image_id.clone());
    Ok(record)
}

/// Most-recent-first list of viewed identifiers without duplicates.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct History {
    entries: VecDeque<ImageId>,
    limit: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl History {
    /// A limit of zero is raised to one.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self { entries: VecDeque::new(), limit: limit.max(1) }
    }

    pub fn visit(&mut self, image_id: &ImageId) {
        if let Some(position) = self.entries.iter().position(|entry| entry == image_id) {
            self.entries.remove(position);
        }
        self.entries.push_front(image_id.clone());
        self.entries.truncate(self.limit);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageId> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[must_use]
    pub fn contains(&self, image_id: &str) -> bool {
        self.entries.iter().any(|entry| entry.as_str() == image_id)
    }
}

/// Discrete interactions that mutate filter state between cycles.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum UserAction {
    NewRandom,
    ToggleFinding(String),
    SetFindings(BTreeSet<String>),
    SetViewPosition(ViewFilter),
    Pin(ImageId),
}

#[derive(Debug, Clone, Copy)]
pub struct Resolution<'a> {
    pub record: &'a CxrRecord,
    pub filtered_count: usize,
}

/// Result of one browse cycle; the count is reported even when resolution fails.
#[derive(Debug, Clone)]
pub struct CycleOutcome<'a> {
    pub filtered_count: usize,
    pub result: Result<&'a CxrRecord, BrowseError>,
}

impl<'a> CycleOutcome<'a> {
    /// # Errors
    /// Returns the resolution error of this cycle.
    pub fn into_resolution(self) -> Result<Resolution<'a>, BrowseError> {
        let filtered_count = self.filtered_count;
        self.result.map(|record| Resolution { record, filtered_count })
    }
}

/// Per-session mutable state; one per browser session.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SessionContext {
    pub filter: FilterState,
    pub history: History,
}

impl SessionContext {
    #[must_use]
    pub fn new(history_limit: usize) -> Self {
        Self { filter: FilterState::default(), history: History::new(history_limit) }
    }

    /// Blank finding tags and blank pins are ignored; they have no query form.
    pub fn apply(&mut self, action: UserAction) {
        match action {
            UserAction::NewRandom => self.filter.pinned = None,
            UserAction::ToggleFinding(tag) => {
                if !tag.is_empty() && !self.filter.findings.remove(&tag) {
                    self.filter.findings.insert(tag);
                }
            }
            UserAction::SetFindings(findings) => {
                self.filter.findings = findings.into_iter().filter(|tag| !tag.is_empty()).collect();
            }
            UserAction::SetViewPosition(view) => self.filter.view_position = Some(view),
            UserAction::Pin(image_id) => {
                if !image_id.as_str().is_empty() {
                    self.filter.pinned = Some(image_id);
                }
            }
        }
    }

    /// Filter, reject an empty subset, resolve, then record the visit.
    ///
    /// The empty check precedes resolution, so a pinned record is not shown
    /// while the active predicates match nothing.
    pub fn run_cycle<'a, R>(&mut self, table: &'a Table, rng: &mut R) -> CycleOutcome<'a>
    where
        R: Rng + ?Sized,
    {
        let filtered = apply(table, &self.filter);
        let filtered_count = filtered.len();
        if filtered.is_empty() {
            return CycleOutcome { filtered_count, result: Err(BrowseError::EmptyFilterResult) };
        }

        let result = resolve(&filtered, table, &mut self.filter, rng);
        if let Ok(record) = result {
            self.history.visit(&record.image_id);
        }
        CycleOutcome { filtered_count, result }
    }
}

/// Inbound or outbound query parameters; keys map to one or many values.
pub type QueryParams = BTreeMap<String, Vec<String>>;

/// Rebuild filter state from query parameters. Unknown keys and
/// unrecognized view positions are ignored.
#[must_use]
pub fn decode_query(params: &QueryParams) -> FilterState {
    let pinned = params
        .get(QUERY_KEY_FILE)
        .and_then(|values| values.iter().find(|value| !value.is_empty()))
        .map(|value| ImageId::new(value.as_str()));

    let findings = params
        .get(QUERY_KEY_FINDING)
        .map(|values| {
            values.iter().filter(|value| !value.is_empty()).cloned().collect::<BTreeSet<_>>()
        })
        .unwrap_or_default();

    let view_position = params
        .get(QUERY_KEY_VIEW_POSITION)
        .and_then(|values| values.first())
        .and_then(|value| ViewFilter::parse(value));

    FilterState { view_position, findings, pinned }
}

#[must_use]
pub fn encode_query(filter: &FilterState) -> QueryParams {
    let mut params = QueryParams::new();
    if let Some(pinned) = &filter.pinned {
        params.insert(QUERY_KEY_FILE.to_string(), vec![pinned.to_string()]);
    }
    if !filter.findings.is_empty() {
        params.insert(QUERY_KEY_FINDING.to_string(), filter.findings.iter().cloned().collect());
    }
    if let Some(view) = filter.view_position {
        params.insert(QUERY_KEY_VIEW_POSITION.to_string(), vec![view.as_str().to_string()]);
    }
    params
}

#[must_use]
pub fn parse_query_string(raw: &str) -> QueryParams {
    let raw = raw.strip_prefix('?').unwrap_or(raw);
    let mut params = QueryParams::new();
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        params.entry(key.into_owned()).or_default().push(value.into_owned());
    }
    params
}

#[must_use]
pub fn to_query_string(params: &QueryParams) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, values) in params {
        for value in values {
            serializer.append_pair(key, value);
        }
    }
    serializer.finish()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn mk_record(id: &str, view_position: ViewPosition, findings: &[&str]) -> CxrRecord {
        CxrRecord {
            image_id: ImageId::new(id),
            patient_id: 1,
            follow_up: 0,
            age: 42,
            gender: PatientGender::Female,
            view_position,
            findings: findings.iter().map(ToString::to_string).collect(),
        }
    }

    fn fixture_table() -> Table {
        let records = vec![
            mk_record("A", ViewPosition::PosteroAnterior, &["Effusion"]),
            mk_record("B", ViewPosition::AnteroPosterior, &[]),
            mk_record("C", ViewPosition::PosteroAnterior, &["Nodule"]),
        ];
        Table::from_records(records, "sha256:fixture")
            .unwrap_or_else(|err| panic!("fixture table should build: {err}"))
    }

    fn ids(view: &FilteredView<'_>) -> Vec<String> {
        view.records().iter().map(|record| record.image_id.to_string()).collect()
    }

    fn findings(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(ToString::to_string).collect()
    }

    // Test IDs: TFLT-001
    #[test]
    fn view_position_filter_selects_matching_rows() {
        let table = fixture_table();
        let filter = FilterState {
            view_position: Some(ViewFilter::PosteroAnterior),
            ..FilterState::default()
        };
        assert_eq!(ids(&apply(&table, &filter)), vec!["A", "C"]);
    }

    // Test IDs: TFLT-002
    #[test]
    fn finding_filter_selects_rows_with_any_tag() {
        let table = fixture_table();
        let filter = FilterState { findings: findings(&["Nodule"]), ..FilterState::default() };
        assert_eq!(ids(&apply(&table, &filter)), vec!["C"]);

        let either = FilterState {
            findings: findings(&["Nodule", "Effusion"]),
            ..FilterState::default()
        };
        assert_eq!(ids(&apply(&table, &either)), vec!["A", "C"]);
    }

    // Test IDs: TFLT-003
    #[test]
    fn conflicting_predicates_yield_empty_view_not_error() {
        let table = fixture_table();
        let filter = FilterState {
            view_position: Some(ViewFilter::AnteroPosterior),
            findings: findings(&["Nodule"]),
            pinned: None,
        };
        let filtered = apply(&table, &filter);
        assert!(filtered.is_empty());

        let mut session = SessionContext { filter, history: History::default() };
        let mut rng = StdRng::seed_from_u64(7);
        let outcome = session.run_cycle(&table, &mut rng);
        assert_eq!(outcome.filtered_count, 0);
        assert_eq!(outcome.result, Err(BrowseError::EmptyFilterResult));
        assert!(session.history.is_empty());
    }

    // Test IDs: TFLT-004
    #[test]
    fn empty_filter_returns_whole_table() {
        let table = fixture_table();
        assert_eq!(apply(&table, &FilterState::default()).len(), table.len());

        let any = FilterState { view_position: Some(ViewFilter::Any), ..FilterState::default() };
        assert_eq!(ids(&apply(&table, &any)), vec!["A", "B", "C"]);
    }

    // Test IDs: TFLT-005
    #[test]
    fn unknown_finding_tag_matches_nothing() {
        let table = fixture_table();
        let filter = FilterState { findings: findings(&["Hernia"]), ..FilterState::default() };
        assert!(apply(&table, &filter).is_empty());
    }

    // Test IDs: TSEL-001
    #[test]
    fn pinned_record_bypasses_active_filter() {
        let table = fixture_table();
        let mut filter = FilterState {
            view_position: Some(ViewFilter::PosteroAnterior),
            findings: BTreeSet::new(),
            pinned: Some(ImageId::new("B")),
        };
        let filtered = apply(&table, &filter);
        assert!(!filtered.contains("B"));

        let mut rng = StdRng::seed_from_u64(1);
        let record = resolve(&filtered, &table, &mut filter, &mut rng)
            .unwrap_or_else(|err| panic!("pinned record should resolve: {err}"));
        assert_eq!(record.image_id.as_str(), "B");
        assert_eq!(filter.pinned, Some(ImageId::new("B")));
    }

    // Test IDs: TSEL-002
    #[test]
    fn absent_pin_reports_record_not_found() {
        let table = fixture_table();
        let mut filter =
            FilterState { pinned: Some(ImageId::new("missing.png")), ..FilterState::default() };
        let filtered = apply(&table, &filter);
        let mut rng = StdRng::seed_from_u64(1);
        let result = resolve(&filtered, &table, &mut filter, &mut rng);
        assert_eq!(result, Err(BrowseError::RecordNotFound("missing.png".to_string())));
    }

    // Test IDs: TSEL-003
    #[test]
    fn random_draw_pins_record_from_filtered_subset() {
        let table = fixture_table();
        for seed in 0..32 {
            let mut filter = FilterState {
                view_position: Some(ViewFilter::PosteroAnterior),
                ..FilterState::default()
            };
            let filtered = apply(&table, &filter);
            let mut rng = StdRng::seed_from_u64(seed);
            let record = resolve(&filtered, &table, &mut filter, &mut rng)
                .unwrap_or_else(|err| panic!("draw should succeed: {err}"));
            assert_eq!(record.view_position, ViewPosition::PosteroAnterior);
            assert_eq!(filter.pinned.as_ref(), Some(&record.image_id));
        }
    }

    // Test IDs: TSEL-004
    #[test]
    fn seeded_draw_is_deterministic() {
        let table = fixture_table();
        let draw = |seed| {
            let mut filter = FilterState::default();
            let filtered = apply(&table, &filter);
            let mut rng = StdRng::seed_from_u64(seed);
            resolve(&filtered, &table, &mut filter, &mut rng)
                .map(|record| record.image_id.clone())
                .unwrap_or_else(|err| panic!("draw should succeed: {err}"))
        };
        assert_eq!(draw(99), draw(99));
    }

    // Test IDs: TSEL-005
    #[test]
    fn draw_from_empty_subset_is_rejected() {
        let table = fixture_table();
        let mut filter = FilterState { findings: findings(&["Hernia"]), ..FilterState::default() };
        let filtered = apply(&table, &filter);
        let mut rng = StdRng::seed_from_u64(3);
        let result = resolve(&filtered, &table, &mut filter, &mut rng);
        assert_eq!(result, Err(BrowseError::EmptyFilterResult));
        assert!(filter.pinned.is_none());
    }

    // Test IDs: THIS-001
    #[test]
    fn revisiting_moves_entry_to_front_without_growing() {
        let mut history = History::new(10);
        for id in ["A", "B", "C"] {
            history.visit(&ImageId::new(id));
        }
        assert_eq!(history.len(), 3);

        history.visit(&ImageId::new("A"));
        let order = history.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(order, vec!["A", "C", "B"]);
        assert_eq!(history.len(), 3);
    }

    // Test IDs: THIS-002
    #[test]
    fn history_is_bounded_by_limit() {
        let mut history = History::new(2);
        for id in ["A", "B", "C"] {
            history.visit(&ImageId::new(id));
        }
        let order = history.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(order, vec!["C", "B"]);
        assert_eq!(History::new(0).limit(), 1);
    }

    // Test IDs: TSES-001
    #[test]
    fn session_cycle_pins_then_keeps_record_until_new_random() {
        let table = fixture_table();
        let mut session = SessionContext::new(DEFAULT_HISTORY_LIMIT);
        let mut rng = StdRng::seed_from_u64(11);

        let first = session
            .run_cycle(&table, &mut rng)
            .into_resolution()
            .unwrap_or_else(|err| panic!("first cycle should resolve: {err}"));
        assert_eq!(first.filtered_count, 3);
        let pinned = first.record.image_id.clone();

        for _ in 0..5 {
            let again = session
                .run_cycle(&table, &mut rng)
                .into_resolution()
                .unwrap_or_else(|err| panic!("pinned cycle should resolve: {err}"));
            assert_eq!(again.record.image_id, pinned);
        }
        assert_eq!(session.history.len(), 1);

        session.apply(UserAction::NewRandom);
        assert!(!session.filter.is_pinned());
        let _ = session.run_cycle(&table, &mut rng);
        assert!(session.filter.is_pinned());
    }

    // Test IDs: TSES-002
    #[test]
    fn session_actions_mutate_filter_state() {
        let mut session = SessionContext::default();
        session.apply(UserAction::ToggleFinding("Nodule".to_string()));
        session.apply(UserAction::ToggleFinding("Effusion".to_string()));
        session.apply(UserAction::ToggleFinding("Nodule".to_string()));
        assert_eq!(session.filter.findings, findings(&["Effusion"]));

        session.apply(UserAction::SetViewPosition(ViewFilter::AnteroPosterior));
        assert_eq!(session.filter.effective_view(), ViewFilter::AnteroPosterior);

        session.apply(UserAction::Pin(ImageId::new("C")));
        assert_eq!(session.filter.pinned, Some(ImageId::new("C")));

        session.apply(UserAction::SetFindings(BTreeSet::new()));
        assert!(session.filter.findings.is_empty());
    }

    // Test IDs: TSES-004
    #[test]
    fn blank_tags_and_pins_are_ignored_so_links_reproduce_state() {
        let table = fixture_table();
        let mut session = SessionContext::default();
        session.apply(UserAction::ToggleFinding(String::new()));
        session.apply(UserAction::Pin(ImageId::new("")));
        assert_eq!(session.filter, FilterState::default());

        session.apply(UserAction::SetFindings(findings(&["", "Nodule"])));
        session.apply(UserAction::Pin(ImageId::new("C")));
        session.apply(UserAction::Pin(ImageId::new("")));
        assert_eq!(session.filter.findings, findings(&["Nodule"]));
        assert_eq!(session.filter.pinned, Some(ImageId::new("C")));

        let raw = to_query_string(&encode_query(&session.filter));
        let decoded = decode_query(&parse_query_string(&raw));
        assert_eq!(decoded, session.filter);
        assert_eq!(apply(&table, &decoded).len(), apply(&table, &session.filter).len());
    }

    // Test IDs: TSES-003
    #[test]
    fn user_action_json_uses_tagged_layout() {
        let action = UserAction::SetViewPosition(ViewFilter::PosteroAnterior);
        let json = match serde_json::to_string(&action) {
            Ok(json) => json,
            Err(err) => panic!("action should serialize: {err}"),
        };
        assert_eq!(json, r#"{"action":"set_view_position","value":"PA"}"#);

        let parsed: UserAction = match serde_json::from_str(r#"{"action":"new_random"}"#) {
            Ok(parsed) => parsed,
            Err(err) => panic!("action should parse: {err}"),
        };
        assert_eq!(parsed, UserAction::NewRandom);
    }

    // Test IDs: TSYN-001
    #[test]
    fn decode_reads_recognized_keys_and_ignores_the_rest() {
        let params = parse_query_string(
            "?file=00000013_005.png&finding=Nodule&finding=Mass&view_position=pa&utm_source=x",
        );
        let filter = decode_query(&params);
        assert_eq!(filter.pinned, Some(ImageId::new("00000013_005.png")));
        assert_eq!(filter.findings, findings(&["Mass", "Nodule"]));
        assert_eq!(filter.view_position, Some(ViewFilter::PosteroAnterior));
    }

    // Test IDs: TSYN-002
    #[test]
    fn absent_keys_decode_as_unset() {
        let filter = decode_query(&QueryParams::new());
        assert_eq!(filter, FilterState::default());
        assert_eq!(filter.view_position, None);
        assert_eq!(filter.effective_view(), ViewFilter::Any);

        let blank = decode_query(&parse_query_string("file=&view_position=LL"));
        assert_eq!(blank, FilterState::default());
    }

    // Test IDs: TSYN-003
    #[test]
    fn encode_emits_only_set_fields() {
        assert!(encode_query(&FilterState::default()).is_empty());

        let filter = FilterState {
            view_position: Some(ViewFilter::Any),
            findings: findings(&["Pleural_Thickening", "No Finding"]),
            pinned: Some(ImageId::new("00000001_000.png")),
        };
        assert_eq!(
            to_query_string(&encode_query(&filter)),
            "file=00000001_000.png&finding=No+Finding&finding=Pleural_Thickening&view_position=Any"
        );
    }

    // Test IDs: TSYN-004
    #[test]
    fn record_display_replaces_underscores() {
        let record = mk_record("X", ViewPosition::PosteroAnterior, &["Pleural_Thickening", "Mass"]);
        assert_eq!(record.findings_display(), "Pleural Thickening, Mass");
        let clear = mk_record("Y", ViewPosition::PosteroAnterior, &[]);
        assert_eq!(clear.findings_display(), NO_FINDING_LABEL);
    }

    // Test IDs: TTBL-001
    #[test]
    fn table_rejects_duplicate_identifiers_and_collects_vocabulary() {
        let duplicate = Table::from_records(
            vec![
                mk_record("A", ViewPosition::PosteroAnterior, &[]),
                mk_record("A", ViewPosition::AnteroPosterior, &[]),
            ],
            "sha256:dup",
        );
        assert!(matches!(duplicate, Err(BrowseError::DataLoad(message)) if message.contains("A")));

        let table = Table::from_records(
            vec![
                mk_record("A", ViewPosition::PosteroAnterior, &["Mass", "Nodule"]),
                mk_record("B", ViewPosition::AnteroPosterior, &["Nodule", "Hernia"]),
            ],
            "sha256:vocab",
        )
        .unwrap_or_else(|err| panic!("table should build: {err}"));
        assert_eq!(table.vocabulary(), ["Mass", "Nodule", "Hernia"]);
        assert_eq!(table.count_by_view(ViewPosition::AnteroPosterior), 1);
        assert!(table.contains("B"));
    }

    const VOCAB: [&str; 5] = ["Effusion", "Nodule", "Mass", "Hernia", "No Finding"];

    fn view_filter_strategy() -> impl Strategy<Value = Option<ViewFilter>> {
        prop_oneof![
            Just(None),
            Just(Some(ViewFilter::Any)),
            Just(Some(ViewFilter::PosteroAnterior)),
            Just(Some(ViewFilter::AnteroPosterior)),
        ]
    }

    fn action_strategy() -> impl Strategy<Value = UserAction> {
        prop_oneof![
            Just(UserAction::NewRandom),
            "[A-Za-z_ ]{0,12}".prop_map(UserAction::ToggleFinding),
            prop::collection::btree_set("[A-Za-z_ ]{0,12}", 0..4).prop_map(UserAction::SetFindings),
            prop::sample::select(ViewFilter::ALL.to_vec()).prop_map(UserAction::SetViewPosition),
            "([0-9]{8}_[0-9]{3}\\.png)?".prop_map(|id| UserAction::Pin(ImageId::new(id))),
        ]
    }

    fn filter_strategy() -> impl Strategy<Value = FilterState> {
        let direct = (
            view_filter_strategy(),
            prop::collection::btree_set("[A-Za-z_ ]{1,12}", 0..4),
            prop::option::of("[0-9]{8}_[0-9]{3}\\.png"),
        )
            .prop_map(|(view_position, findings, pinned)| FilterState {
                view_position,
                findings,
                pinned: pinned.map(ImageId::new),
            });
        let through_actions =
            prop::collection::vec(action_strategy(), 0..8).prop_map(|actions| {
                let mut session = SessionContext::default();
                for action in actions {
                    session.apply(action);
                }
                session.filter
            });
        prop_oneof![direct, through_actions]
    }

    fn table_strategy() -> impl Strategy<Value = Table> {
        prop::collection::vec((any::<bool>(), prop::collection::vec(0..VOCAB.len(), 0..3)), 0..24)
            .prop_map(|rows| {
                let records = rows
                    .into_iter()
                    .enumerate()
                    .map(|(index, (is_pa, tags))| {
                        let mut tags = tags.into_iter().map(|tag| VOCAB[tag]).collect::<Vec<_>>();
                        tags.dedup();
                        let view =
                            if is_pa { ViewPosition::PosteroAnterior } else { ViewPosition::AnteroPosterior };
                        mk_record(&format!("{index:08}_000.png"), view, &tags)
                    })
                    .collect();
                Table::from_records(records, "sha256:prop").unwrap_or_else(|_| unreachable!())
            })
    }

    // Test IDs: TSYN-005
    proptest! {
        #[test]
        fn property_decode_inverts_encode(filter in filter_strategy()) {
            prop_assert_eq!(decode_query(&encode_query(&filter)), filter.clone());
            let raw = to_query_string(&encode_query(&filter));
            prop_assert_eq!(decode_query(&parse_query_string(&raw)), filter);
        }
    }

    // Test IDs: TFLT-006
    proptest! {
        #[test]
        fn property_apply_is_sound_and_complete(
            table in table_strategy(),
            view_position in view_filter_strategy(),
            picked in prop::collection::btree_set(0..VOCAB.len(), 0..3),
        ) {
            let filter = FilterState {
                view_position,
                findings: picked.into_iter().map(|tag| VOCAB[tag].to_string()).collect(),
                pinned: None,
            };
            let expected = table
                .records()
                .iter()
                .filter(|record| {
                    let view_ok = match view_position {
                        None | Some(ViewFilter::Any) => true,
                        Some(ViewFilter::PosteroAnterior) => {
                            record.view_position == ViewPosition::PosteroAnterior
                        }
                        Some(ViewFilter::AnteroPosterior) => {
                            record.view_position == ViewPosition::AnteroPosterior
                        }
                    };
                    let finding_ok = filter.findings.is_empty()
                        || record.findings.iter().any(|tag| filter.findings.contains(tag));
                    view_ok && finding_ok
                })
                .map(|record| record.image_id.to_string())
                .collect::<BTreeSet<_>>();
            let actual = ids(&apply(&table, &filter)).into_iter().collect::<BTreeSet<_>>();
            prop_assert_eq!(actual, expected);
        }
    }

    // Test IDs: THIS-003
    proptest! {
        #[test]
        fn property_history_has_no_duplicates(
            visits in prop::collection::vec(0_u8..8, 1..64),
            limit in 1_usize..10,
        ) {
            let mut history = History::new(limit);
            for visit in &visits {
                history.visit(&ImageId::new(format!("{visit}.png")));
            }
            let entries = history.iter().collect::<Vec<_>>();
            let unique = entries.iter().collect::<BTreeSet<_>>();
            prop_assert_eq!(entries.len(), unique.len());
            prop_assert!(history.len() <= limit);
            let last = visits.last().map(|visit| format!("{visit}.png"));
            prop_assert_eq!(entries.first().map(ToString::to_string), last);
        }
    }
}
