pub mod aggregation;
pub mod api;
pub mod batch;
pub mod cache;
pub mod config;
pub mod db;
pub mod errors;
pub mod gazetteer;
pub mod geocoder;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod resolver;
pub mod sheets;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::api::ServiceHealth;
use crate::batch::BatchRunner;
use crate::cache::ResolutionCache;
use crate::config::AppConfig;
use crate::db::SqliteHistoryStore;
use crate::errors::AppResult;
use crate::gazetteer::Gazetteer;
use crate::geocoder::{GeocoderAdapter, HttpGeocoder};
use crate::pipeline::ResolutionPipeline;
use crate::resolver::AddressResolver;
use crate::sheets::{CsvSheetStore, SheetStore};

pub use crate::aggregation::{AggregatedDataRow, AggregationEngine, AggregationSettings};
pub use crate::errors::AppError;
pub use crate::models::{ParsedAddress, ResolutionSource, ResolutionStatus};

/// Process-wide context.
///
/// Built once at startup and shared by reference with every caller. The cache it
/// owns lives as long as the state does and is never reset behind a caller's back.
pub struct AppState {
    config: AppConfig,
    resolver: AddressResolver,
    sheets: Arc<dyn SheetStore>,
    history_store: Option<Arc<SqliteHistoryStore>>,
}

impl AppState {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let history_store = Arc::new(SqliteHistoryStore::open(
            &config.data_dir,
            &config.database_file_name,
        )?);
        let cache = ResolutionCache::with_store(config.cache_freshness(), history_store.clone());
        match cache.hydrate() {
            Ok(report) => info!(
                loaded = report.loaded,
                reset = report.reset,
                "resolution cache hydrated"
            ),
            Err(err) => warn!(?err, "failed to hydrate resolution cache; starting empty"),
        }

        let provider = Arc::new(HttpGeocoder::new(&config)?);
        let geocoder = Arc::new(GeocoderAdapter::new(provider, &config));
        let pipeline = ResolutionPipeline::new(
            Gazetteer::default(),
            Some(geocoder),
            config.fuzzy_similarity_floor,
        );
        let resolver = AddressResolver::new(Arc::new(pipeline), cache);
        let sheets: Arc<dyn SheetStore> = Arc::new(CsvSheetStore::new(config.sheets_dir.clone()));

        Ok(Self::from_parts(config, resolver, sheets, Some(history_store)))
    }

    pub fn from_parts(
        config: AppConfig,
        resolver: AddressResolver,
        sheets: Arc<dyn SheetStore>,
        history_store: Option<Arc<SqliteHistoryStore>>,
    ) -> Self {
        Self {
            config,
            resolver,
            sheets,
            history_store,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn resolver(&self) -> &AddressResolver {
        &self.resolver
    }

    pub fn batch_runner(&self) -> BatchRunner {
        BatchRunner::new(self.resolver.clone(), Arc::clone(&self.sheets), &self.config)
    }

    pub fn health(&self) -> ServiceHealth {
        ServiceHealth {
            history_store_path: self
                .history_store
                .as_ref()
                .and_then(|store| store.path())
                .map(|path| path.to_string_lossy().to_string()),
            cache_entries: self.resolver.cache().len(),
            stats: self.resolver.stats(),
            config: self.config.public_profile(),
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,address_growth_lib=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}

/// Runs one yearly batch from the configured sheets directory.
pub async fn run(year: i32) -> AppResult<batch::BatchReport> {
    let state = AppState::initialize(AppConfig::from_env())?;
    info!(year, config = ?state.config().public_profile(), "starting batch");
    state.batch_runner().run(year).await
}
