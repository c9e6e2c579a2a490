use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cxr_db_core::{
    decode_query, encode_query, finding_label, to_query_string, BrowseError, CxrRecord,
    FilterState, ImageId, PatientGender, QueryParams, SessionContext, Table, UserAction,
    ViewFilter, ViewPosition, DEFAULT_HISTORY_LIMIT,
};
use cxr_db_store_csv::{TableCache, DEFAULT_CACHE_TTL};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub const DEFAULT_MAX_SESSIONS: usize = 1024;

const IMAGE_ROUTE_PREFIX: &str = "/v1/images/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserConfig {
    pub csv_path: PathBuf,
    pub image_dir: PathBuf,
    pub cache_ttl: Duration,
    pub history_limit: usize,
    pub max_sessions: usize,
}

impl BrowserConfig {
    #[must_use]
    pub fn new(csv_path: PathBuf, image_dir: PathBuf) -> Self {
        Self {
            csv_path,
            image_dir,
            cache_ttl: DEFAULT_CACHE_TTL,
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SessionId(pub Ulid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value.trim()).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BrowseStatus {
    Resolved,
    NoMatches,
    RecordNotFound,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrowseRequest {
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub query: QueryParams,
    #[serde(default)]
    pub actions: Vec<UserAction>,
}

/// Submission of the filter form ("Random CXR").
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RandomRequest {
    #[serde(default)]
    pub view_position: ViewFilter,
    #[serde(default)]
    pub findings: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordView {
    pub image_id: ImageId,
    pub patient_id: u64,
    pub follow_up: u32,
    pub age: u32,
    pub gender: PatientGender,
    pub view_position: ViewPosition,
    pub findings: Vec<String>,
    pub findings_display: String,
    pub image_url: String,
}

impl RecordView {
    fn from_record(record: &CxrRecord) -> Self {
        Self {
            image_id: record.image_id.clone(),
            patient_id: record.patient_id,
            follow_up: record.follow_up,
            age: record.age,
            gender: record.gender,
            view_position: record.view_position,
            findings: record.findings.clone(),
            findings_display: record.findings_display(),
            image_url: format!("{IMAGE_ROUTE_PREFIX}{}", record.image_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub image_id: ImageId,
    pub findings_display: String,
    pub link: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FindingOption {
    pub tag: String,
    pub label: String,
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewPositionOption {
    pub value: ViewFilter,
    pub selected: bool,
}

/// Render-ready bundle for one interaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrowseResult {
    pub session_id: SessionId,
    pub status: BrowseStatus,
    pub message: Option<String>,
    pub record: Option<RecordView>,
    pub filtered_count: usize,
    pub history: Vec<HistoryEntry>,
    pub query: QueryParams,
    pub share_query: String,
    pub finding_options: Vec<FindingOption>,
    pub view_position_options: Vec<ViewPositionOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetSummary {
    pub source_path: String,
    pub rows: usize,
    pub findings: usize,
    pub source_digest: String,
    #[serde(with = "time::serde::rfc3339")]
    pub loaded_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub view_positions: BTreeMap<String, usize>,
}

#[derive(Debug)]
struct BrowserInner {
    config: BrowserConfig,
    cache: TableCache,
    sessions: Mutex<SessionRegistry>,
    rng: Mutex<StdRng>,
}

/// Browse façade shared by the service and CLI; cheap to clone.
#[derive(Debug, Clone)]
pub struct BrowserApi {
    inner: Arc<BrowserInner>,
}

impl BrowserApi {
    #[must_use]
    pub fn new(config: BrowserConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Use a caller-supplied random source, e.g. a seeded one for reproducible draws.
    #[must_use]
    pub fn with_rng(config: BrowserConfig, rng: StdRng) -> Self {
        let cache = TableCache::new(config.csv_path.clone(), config.cache_ttl);
        Self {
            inner: Arc::new(BrowserInner {
                config,
                cache,
                sessions: Mutex::new(SessionRegistry::default()),
                rng: Mutex::new(rng),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BrowserConfig {
        &self.inner.config
    }

    fn table(&self) -> Result<Arc<Table>> {
        self.inner.cache.get_or_load().context("failed to load metadata table")
    }

    /// Run one browse cycle: decode the inbound query, apply user actions,
    /// resolve a record and re-encode the resulting state.
    ///
    /// # Errors
    /// Returns an error only when the metadata table cannot be loaded;
    /// empty results and unknown pins are reported through [`BrowseStatus`].
    pub fn browse(&self, request: BrowseRequest) -> Result<BrowseResult> {
        let table = self.table()?;
        let mut sessions = self.inner.sessions.lock();
        let session_id = request
            .session_id
            .filter(|session_id| sessions.entries.contains_key(session_id))
            .unwrap_or_default();
        let session = sessions.touch(session_id, self.inner.config.history_limit);

        session.filter = decode_query(&request.query);
        for action in request.actions {
            session.apply(action);
        }

        let outcome = {
            let mut rng = self.inner.rng.lock();
            session.run_cycle(&table, &mut *rng)
        };
        let filtered_count = outcome.filtered_count;
        let (status, message, record) = match outcome.result {
            Ok(record) => (BrowseStatus::Resolved, None, Some(RecordView::from_record(record))),
            Err(BrowseError::RecordNotFound(image_id)) => {
                tracing::warn!(
                    session = %session_id,
                    image_id = %image_id,
                    "pinned record not found"
                );
                (BrowseStatus::RecordNotFound, Some(format!("Record not found: {image_id}")), None)
            }
            Err(BrowseError::EmptyFilterResult) => (
                BrowseStatus::NoMatches,
                Some("No CXRs found with the selected filters.".to_string()),
                None,
            ),
            Err(err) => return Err(err).context("browse cycle failed"),
        };
        tracing::debug!(session = %session_id, filtered_count, ?status, "browse cycle");

        let query = encode_query(&session.filter);
        let result = BrowseResult {
            session_id,
            status,
            message,
            record,
            filtered_count,
            history: history_entries(&table, session),
            share_query: to_query_string(&query),
            finding_options: finding_options(&table, &session.filter.findings),
            view_position_options: view_position_options(session.filter.effective_view()),
            query,
        };

        sessions.evict_least_recent(self.inner.config.max_sessions, session_id);
        Ok(result)
    }

    /// Submit the filter form: replace the filters, drop any pin and draw anew.
    ///
    /// # Errors
    /// Returns an error when the metadata table cannot be loaded.
    pub fn random(
        &self,
        session_id: Option<SessionId>,
        request: RandomRequest,
    ) -> Result<BrowseResult> {
        self.browse(BrowseRequest {
            session_id,
            query: QueryParams::new(),
            actions: vec![
                UserAction::SetViewPosition(request.view_position),
                UserAction::SetFindings(request.findings),
                UserAction::NewRandom,
            ],
        })
    }

    /// Finding vocabulary for the filter form, none selected.
    ///
    /// # Errors
    /// Returns an error when the metadata table cannot be loaded.
    pub fn findings(&self) -> Result<Vec<FindingOption>> {
        let table = self.table()?;
        Ok(finding_options(&table, &BTreeSet::new()))
    }

    /// # Errors
    /// Returns an error when the metadata table cannot be loaded.
    pub fn dataset_summary(&self) -> Result<DatasetSummary> {
        let cached = self.inner.cache.snapshot().context("failed to load metadata table")?;
        let table = &cached.table;
        let view_positions = ViewPosition::ALL
            .iter()
            .map(|position| (position.as_str().to_string(), table.count_by_view(*position)))
            .collect();

        Ok(DatasetSummary {
            source_path: self.inner.cache.path().display().to_string(),
            rows: table.len(),
            findings: table.vocabulary().len(),
            source_digest: table.source_digest().to_string(),
            loaded_at: cached.loaded_at,
            expires_at: cached.expires_at,
            view_positions,
        })
    }

    /// Location of the image for a known record; `None` for identifiers
    /// absent from the table, so arbitrary paths are never served.
    ///
    /// # Errors
    /// Returns an error when the metadata table cannot be loaded.
    pub fn image_path(&self, image_id: &str) -> Result<Option<PathBuf>> {
        let table = self.table()?;
        if !table.contains(image_id) || Path::new(image_id).components().count() != 1 {
            return Ok(None);
        }
        Ok(Some(self.inner.config.image_dir.join(image_id)))
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().entries.len()
    }
}

fn history_entries(table: &Table, session: &SessionContext) -> Vec<HistoryEntry> {
    session
        .history
        .iter()
        .filter_map(|image_id| table.get(image_id.as_str()))
        .map(|record| {
            let pin = FilterState { pinned: Some(record.image_id.clone()), ..FilterState::default() };
            HistoryEntry {
                image_id: record.image_id.clone(),
                findings_display: record.findings_display(),
                link: format!("?{}", to_query_string(&encode_query(&pin))),
            }
        })
        .collect()
}

fn finding_options(table: &Table, selected: &BTreeSet<String>) -> Vec<FindingOption> {
    table
        .vocabulary()
        .iter()
        .map(|tag| FindingOption {
            tag: tag.clone(),
            label: finding_label(tag),
            selected: selected.contains(tag),
        })
        .collect()
}

fn view_position_options(current: ViewFilter) -> Vec<ViewPositionOption> {
    ViewFilter::ALL
        .iter()
        .map(|value| ViewPositionOption { value: *value, selected: *value == current })
        .collect()
}

#[derive(Debug)]
struct SessionSlot {
    context: SessionContext,
    last_used: u64,
}

/// Live sessions keyed by id; `clock` orders them by most recent use.
#[derive(Debug, Default)]
struct SessionRegistry {
    entries: BTreeMap<SessionId, SessionSlot>,
    clock: u64,
}

impl SessionRegistry {
    fn touch(&mut self, session_id: SessionId, history_limit: usize) -> &mut SessionContext {
        self.clock += 1;
        let clock = self.clock;
        let slot = self.entries.entry(session_id).or_insert_with(|| SessionSlot {
            context: SessionContext::new(history_limit),
            last_used: clock,
        });
        slot.last_used = clock;
        &mut slot.context
    }

    /// Drop the least recently used sessions beyond `max_sessions`, never `keep`.
    fn evict_least_recent(&mut self, max_sessions: usize, keep: SessionId) {
        while self.entries.len() > max_sessions.max(1) {
            let Some(idle) = self
                .entries
                .iter()
                .filter(|(session_id, _)| **session_id != keep)
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(session_id, _)| *session_id)
            else {
                break;
            };
            self.entries.remove(&idle);
            tracing::debug!(session = %idle, "evicted idle session");
        }
    }
}
