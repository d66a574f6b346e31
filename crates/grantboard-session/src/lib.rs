//! Session orchestration: startup load, the view controller handlers and the
//! view handed to a presentation layer after every change.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use grantboard_core::{CategoryFilter, FilterState, NotFound, Opportunity, OpportunityId, OpportunityStore};
use grantboard_storage::{
    is_admin, load_opportunities, resolve_admin, source_for_location, AdminToggle, DiscardLedger,
    FileKeyValueStore, HttpClientConfig, KeyValueStore, LoadError, OpportunitySource, StorageError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "grantboard-session";

#[derive(Debug, Clone)]
pub struct BoardConfig {
    pub source: String,
    pub state_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub web_port: u16,
}

impl BoardConfig {
    pub fn from_env() -> Self {
        Self {
            source: std::env::var("GRANTBOARD_SOURCE")
                .unwrap_or_else(|_| "editais_raspados.json".to_string()),
            state_dir: std::env::var("GRANTBOARD_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_state_dir()),
            http_timeout_secs: std::env::var("GRANTBOARD_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("GRANTBOARD_USER_AGENT")
                .unwrap_or_else(|_| "grantboard/0.1".to_string()),
            web_port: std::env::var("GRANTBOARD_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|p| p.join("grantboard"))
        .unwrap_or_else(|| PathBuf::from(".grantboard"))
}

/// Everything a presentation layer needs after a recompute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardView {
    pub visible: Vec<Opportunity>,
    pub saved_count: usize,
    pub is_admin: bool,
    pub search: String,
    pub category: String,
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("discarding requires the admin capability")]
    Forbidden,
    #[error("persisting discard: {0}")]
    Storage(#[from] StorageError),
}

/// Explicit per-session state threaded through every handler.
pub struct Session {
    store: OpportunityStore,
    ledger: DiscardLedger,
    filter: FilterState,
    is_admin: bool,
    persistence: Box<dyn KeyValueStore>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("records", &self.store.len())
            .field("discarded", &self.ledger.len())
            .field("filter", &self.filter)
            .field("is_admin", &self.is_admin)
            .finish()
    }
}

impl Session {
    /// Builds the session from a loaded store, reading the ledger and applying
    /// the startup admin toggle.
    pub fn new(
        store: OpportunityStore,
        mut persistence: Box<dyn KeyValueStore>,
        admin: AdminToggle,
    ) -> Self {
        let is_admin = resolve_admin(&mut *persistence, admin).unwrap_or_else(|err| {
            warn!(%err, "could not persist admin toggle");
            is_admin(&*persistence)
        });
        let ledger = DiscardLedger::load(&*persistence);
        info!(
            records = store.len(),
            discarded = ledger.len(),
            is_admin,
            "session ready"
        );
        Self {
            store,
            ledger,
            filter: FilterState::default(),
            is_admin,
            persistence,
        }
    }

    pub fn store(&self) -> &OpportunityStore {
        &self.store
    }

    pub fn ledger(&self) -> &DiscardLedger {
        &self.ledger
    }

    pub fn filter(&self) -> &FilterState {
        &self.filter
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    /// Re-applies an `admin=` argument, as a fresh page load does.
    pub fn apply_admin_toggle(&mut self, toggle: AdminToggle) -> bool {
        if toggle != AdminToggle::Keep {
            self.is_admin = resolve_admin(&mut *self.persistence, toggle).unwrap_or_else(|err| {
                warn!(%err, "could not persist admin toggle");
                toggle == AdminToggle::Grant
            });
        }
        self.is_admin
    }

    /// Id of the loaded record `raw` names; unknown text falls back to
    /// [`OpportunityId::parse`].
    pub fn resolve_id(&self, raw: &str) -> OpportunityId {
        self.store
            .resolve(raw)
            .unwrap_or_else(|| OpportunityId::parse(raw))
    }

    /// Full recomputation over the whole collection.
    pub fn view(&self) -> BoardView {
        BoardView {
            visible: self
                .store
                .visible(&self.ledger, &self.filter)
                .into_iter()
                .cloned()
                .collect(),
            saved_count: self.store.saved_count(),
            is_admin: self.is_admin,
            search: self.filter.search.clone(),
            category: self.filter.category.as_str().to_string(),
        }
    }

    pub fn on_search_changed(&mut self, text: impl Into<String>) -> BoardView {
        self.filter.search = text.into();
        self.view()
    }

    pub fn on_category_selected(&mut self, category: CategoryFilter) -> BoardView {
        self.filter.category = category;
        self.view()
    }

    pub fn on_toggle_save(&mut self, id: &OpportunityId) -> BoardView {
        match self.store.toggle_saved(id) {
            Ok(saved) => debug!(%id, saved, "toggled bookmark"),
            Err(NotFound(id)) => debug!(%id, "toggle ignored: unknown opportunity"),
        }
        self.view()
    }

    /// Hides `id` for good and clears its bookmark. Confirmation is the
    /// caller's job.
    pub fn on_discard(&mut self, id: &OpportunityId) -> Result<BoardView, ActionError> {
        if !self.is_admin {
            return Err(ActionError::Forbidden);
        }

        let persisted = self.ledger.add(id.clone(), &mut *self.persistence);
        if let Err(NotFound(id)) = self.store.set_saved(id, false) {
            debug!(%id, "discarded id is not in the loaded collection");
        }

        match persisted {
            Ok(added) => {
                info!(%id, added, "discarded opportunity");
                Ok(self.view())
            }
            Err(err) => {
                warn!(%id, %err, "discard kept for this session but not persisted");
                Err(ActionError::Storage(err))
            }
        }
    }

    pub fn on_record_selected(&self, id: &OpportunityId) -> Result<&Opportunity, NotFound> {
        self.store.find_by_id(id)
    }
}

/// Outcome of startup: either a usable session or the load failure to show.
#[derive(Debug)]
pub enum BoardState {
    Ready(Session),
    LoadFailed(LoadError),
}

impl BoardState {
    pub fn session(&self) -> Option<&Session> {
        match self {
            Self::Ready(session) => Some(session),
            Self::LoadFailed(_) => None,
        }
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        match self {
            Self::Ready(session) => Some(session),
            Self::LoadFailed(_) => None,
        }
    }

    pub fn load_error(&self) -> Option<&LoadError> {
        match self {
            Self::Ready(_) => None,
            Self::LoadFailed(err) => Some(err),
        }
    }
}

/// Loads once; a failure is terminal for this session.
pub async fn start(
    source: &dyn OpportunitySource,
    persistence: Box<dyn KeyValueStore>,
    admin: AdminToggle,
) -> BoardState {
    match load_opportunities(source).await {
        Ok(store) => BoardState::Ready(Session::new(store, persistence, admin)),
        Err(err) => {
            warn!(source = %source.describe(), %err, "opportunity load failed");
            BoardState::LoadFailed(err)
        }
    }
}

pub async fn start_from_config(config: &BoardConfig, admin: AdminToggle) -> Result<BoardState> {
    let persistence = FileKeyValueStore::open(&config.state_dir)?;
    let source = match source_for_location(&config.source, &config.http_client_config()) {
        Ok(source) => source,
        Err(err) => return Ok(BoardState::LoadFailed(err)),
    };
    Ok(start(source.as_ref(), Box::new(persistence), admin).await)
}
