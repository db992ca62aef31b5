use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use survey_pivot_core::{
    detect_schema_drift, parse_metadata, parse_summary_records, DriftReport, Metadata,
    SummaryRecord,
};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use ulid::Ulid;

pub const RECORDS_FILE: &str = "summary_stats.json";
pub const METADATA_FILE: &str = "metadata.json";
/// Upper bound for connecting to and reading from a URL source.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const REMEDIATION: &str = "Regenerate summary_stats.json and metadata.json by re-running \
     the data preparation step, then reload.";

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum SourceLocation {
    Path(PathBuf),
    Url(String),
}

impl SourceLocation {
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.starts_with("http://") || value.starts_with("https://") {
            Self::Url(value.to_string())
        } else {
            Self::Path(PathBuf::from(value))
        }
    }

    #[must_use]
    pub fn join(&self, relative: &str) -> Self {
        match self {
            Self::Path(base) => Self::Path(base.join(relative)),
            Self::Url(base) => Self::Url(format!("{}/{relative}", base.trim_end_matches('/'))),
        }
    }
}

impl Display for SourceLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Url(url) => f.write_str(url),
        }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct DataSources {
    pub records: SourceLocation,
    pub metadata: SourceLocation,
}

impl DataSources {
    /// Resolve the two fixed data files against a base directory or base URL.
    #[must_use]
    pub fn relative_to(base: &SourceLocation) -> Self {
        Self { records: base.join(RECORDS_FILE), metadata: base.join(METADATA_FILE) }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Records,
    Metadata,
}

impl SourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Records => "summary records",
            Self::Metadata => "metadata",
        }
    }
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Either data source was unreachable or unparseable. There is no partial store.
#[derive(Debug, Clone, thiserror::Error, Serialize, Eq, PartialEq)]
#[error("failed to load {kind} from {location}: {cause}. {}", REMEDIATION)]
pub struct LoadFailure {
    pub kind: SourceKind,
    pub location: String,
    pub cause: String,
}

impl LoadFailure {
    fn new(kind: SourceKind, location: &SourceLocation, cause: impl Display) -> Self {
        Self { kind, location: location.to_string(), cause: cause.to_string() }
    }

    #[must_use]
    pub fn remediation(&self) -> &'static str {
        REMEDIATION
    }
}

/// The loaded records and metadata. Immutable once built.
#[derive(Debug, Clone)]
pub struct RecordStore {
    records: Vec<SummaryRecord>,
    metadata: Metadata,
    drift: DriftReport,
    snapshot_id: String,
    loaded_at: OffsetDateTime,
}

impl RecordStore {
    /// Decode both payloads into a store.
    ///
    /// # Errors
    /// Returns [`LoadFailure`] naming the payload that failed to decode.
    pub fn from_payloads(
        records_body: &str,
        metadata_body: &str,
        sources: &DataSources,
    ) -> Result<Self, LoadFailure> {
        let records = parse_summary_records(records_body)
            .map_err(|err| LoadFailure::new(SourceKind::Records, &sources.records, err))?;
        let metadata = parse_metadata(metadata_body)
            .map_err(|err| LoadFailure::new(SourceKind::Metadata, &sources.metadata, err))?;

        let drift = detect_schema_drift(&records, &metadata);
        if !drift.is_clean() {
            tracing::warn!(
                unclassified_items = ?drift.unclassified_items,
                duplicate_triples = drift.duplicate_triples.len(),
                undeclared_demographics = ?drift.undeclared_demographics,
                missing_overall = drift.missing_overall,
                "survey data drifted from metadata; affected rows degrade silently"
            );
        }

        Ok(Self {
            snapshot_id: compute_snapshot_id(records_body, metadata_body),
            records,
            metadata,
            drift,
            loaded_at: OffsetDateTime::now_utc(),
        })
    }

    #[must_use]
    pub fn records(&self) -> &[SummaryRecord] {
        &self.records
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    #[must_use]
    pub fn drift(&self) -> &DriftReport {
        &self.drift
    }

    #[must_use]
    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    #[must_use]
    pub fn loaded_at(&self) -> OffsetDateTime {
        self.loaded_at
    }
}

fn compute_snapshot_id(records_body: &str, metadata_body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(records_body.as_bytes());
    hasher.update([0_u8]);
    hasher.update(metadata_body.as_bytes());
    let digest_hex = format!("{:x}", hasher.finalize());
    format!("snap_{}", &digest_hex[..16])
}

fn fetch_url(url: &str, timeout: Duration) -> Result<String, String> {
    let agent = ureq::AgentBuilder::new().timeout_connect(timeout).timeout(timeout).build();
    let response = agent.get(url).call().map_err(|err| err.to_string())?;
    response.into_string().map_err(|err| err.to_string())
}

async fn read_source(
    kind: SourceKind,
    location: &SourceLocation,
    fetch_timeout: Duration,
) -> Result<String, LoadFailure> {
    match location {
        SourceLocation::Path(path) => tokio::fs::read_to_string(path)
            .await
            .map_err(|err| LoadFailure::new(kind, location, err)),
        SourceLocation::Url(url) => {
            let url = url.clone();
            tokio::task::spawn_blocking(move || fetch_url(&url, fetch_timeout))
                .await
                .map_err(|err| LoadFailure::new(kind, location, err))?
                .map_err(|err| LoadFailure::new(kind, location, err))
        }
    }
}

/// Read both sources concurrently and build a store only if both succeed.
///
/// # Errors
/// Returns the first [`LoadFailure`] from either read or from decoding.
pub async fn load_record_store(sources: &DataSources) -> Result<RecordStore, LoadFailure> {
    load_record_store_within(sources, FETCH_TIMEOUT).await
}

/// [`load_record_store`] with an explicit bound on each URL fetch.
///
/// # Errors
/// Returns the first [`LoadFailure`] from either read or from decoding. A fetch
/// that exceeds `fetch_timeout` fails its source.
pub async fn load_record_store_within(
    sources: &DataSources,
    fetch_timeout: Duration,
) -> Result<RecordStore, LoadFailure> {
    tracing::debug!(
        records = %sources.records,
        metadata = %sources.metadata,
        "loading survey data"
    );
    let (records_body, metadata_body) = tokio::try_join!(
        read_source(SourceKind::Records, &sources.records, fetch_timeout),
        read_source(SourceKind::Metadata, &sources.metadata, fetch_timeout),
    )?;
    RecordStore::from_payloads(&records_body, &metadata_body, sources)
}

#[derive(Debug, Clone)]
pub enum LoadState {
    Loading,
    Ready(Arc<RecordStore>),
    Failed(LoadFailure),
}

impl LoadState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Ready(_) => "ready",
            Self::Failed(_) => "failed",
        }
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Loading)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LoadTicket {
    pub id: Ulid,
    pub generation: u64,
}

#[derive(Debug)]
struct SharedState {
    state: watch::Sender<LoadState>,
    generation: AtomicU64,
}

impl SharedState {
    fn apply(&self, ticket: LoadTicket, result: Result<RecordStore, LoadFailure>) -> bool {
        let next = match result {
            Ok(store) => LoadState::Ready(Arc::new(store)),
            Err(failure) => LoadState::Failed(failure),
        };
        let outcome = next.as_str();

        let applied = self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != ticket.generation {
                return false;
            }
            *state = next;
            true
        });

        if applied {
            tracing::info!(load_id = %ticket.id, state = outcome, "survey data load settled");
        } else {
            tracing::debug!(load_id = %ticket.id, "discarding superseded load result");
        }
        applied
    }
}

/// Owner of the load state. Results for stale tickets or dropped handles are discarded.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    shared: Arc<SharedState>,
}

#[derive(Debug, Clone)]
pub struct WeakStoreHandle {
    shared: Weak<SharedState>,
}

impl WeakStoreHandle {
    /// Apply a finished load if the handle is still alive and the ticket is current.
    #[must_use = "false means the result was discarded"]
    pub fn complete(&self, ticket: LoadTicket, result: Result<RecordStore, LoadFailure>) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            tracing::debug!(load_id = %ticket.id, "store handle dropped before load finished");
            return false;
        };
        shared.apply(ticket, result)
    }
}

impl Default for StoreHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreHandle {
    #[must_use]
    pub fn new() -> Self {
        let (state, _receiver) = watch::channel(LoadState::Loading);
        Self { shared: Arc::new(SharedState { state, generation: AtomicU64::new(0) }) }
    }

    #[must_use]
    pub fn with_store(store: Arc<RecordStore>) -> Self {
        let handle = Self::new();
        handle.shared.state.send_replace(LoadState::Ready(store));
        handle
    }

    #[must_use]
    pub fn state(&self) -> LoadState {
        self.shared.state.borrow().clone()
    }

    #[must_use]
    pub fn store(&self) -> Option<Arc<RecordStore>> {
        match &*self.shared.state.borrow() {
            LoadState::Ready(store) => Some(Arc::clone(store)),
            LoadState::Loading | LoadState::Failed(_) => None,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LoadState> {
        self.shared.state.subscribe()
    }

    /// Wait until the current load settles into `Ready` or `Failed`.
    pub async fn wait_settled(&self) -> LoadState {
        let mut receiver = self.subscribe();
        // The `watch::Ref` borrows `receiver`; clone out of it before the receiver drops.
        let settled =
            receiver.wait_for(LoadState::is_settled).await.map(|state| (*state).clone());
        settled.unwrap_or_else(|_| self.state())
    }

    /// Start a new load cycle; earlier tickets become stale.
    pub fn begin_load(&self) -> LoadTicket {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.state.send_replace(LoadState::Loading);
        LoadTicket { id: Ulid::new(), generation }
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakStoreHandle {
        WeakStoreHandle { shared: Arc::downgrade(&self.shared) }
    }

    /// Load in the background. The task resolves to whether its result was applied.
    pub fn spawn_load(&self, sources: DataSources) -> JoinHandle<bool> {
        self.spawn_load_within(sources, FETCH_TIMEOUT)
    }

    /// [`StoreHandle::spawn_load`] with an explicit bound on each URL fetch.
    pub fn spawn_load_within(
        &self,
        sources: DataSources,
        fetch_timeout: Duration,
    ) -> JoinHandle<bool> {
        let ticket = self.begin_load();
        let weak = self.downgrade();
        tracing::info!(
            load_id = %ticket.id,
            generation = ticket.generation,
            "survey data load started"
        );
        tokio::spawn(async move {
            let result = load_record_store_within(&sources, fetch_timeout).await;
            weak.complete(ticket, result)
        })
    }
}
