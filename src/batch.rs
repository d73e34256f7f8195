use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::aggregation::{AggregatedDataRow, AggregationEngine, AggregationSettings, ResolvedRow};
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::models::ParsedAddress;
use crate::resolver::{AddressResolver, ResolverStats};
use crate::sheets::{collect_sales_rows, load_reference, SheetStore};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub year: i32,
    pub reference_rows: usize,
    pub reference_rejected: usize,
    pub files: usize,
    pub sales_rows: usize,
    pub sales_rejected: usize,
    pub unresolved_rows: usize,
    pub stats: ResolverStats,
    pub summaries: Vec<AggregatedDataRow>,
}

/// Runs one yearly batch: reference load, ingestion, resolution, aggregation.
pub struct BatchRunner {
    resolver: AddressResolver,
    store: Arc<dyn SheetStore>,
    settings: AggregationSettings,
    concurrency: usize,
    page_size: usize,
}

impl BatchRunner {
    pub fn new(resolver: AddressResolver, store: Arc<dyn SheetStore>, config: &AppConfig) -> Self {
        Self {
            resolver,
            store,
            settings: AggregationSettings {
                baseline_client_volume: config.baseline_client_volume,
            },
            concurrency: config.resolver_concurrency.max(1),
            page_size: config.sheet_page_size.max(1),
        }
    }

    pub fn with_settings(mut self, settings: AggregationSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Fails without output when the reference dataset or the sales files cannot be read.
    pub async fn run(&self, year: i32) -> AppResult<BatchReport> {
        let reference = load_reference(self.store.as_ref()).await?;
        self.resolver.pipeline().extend_gazetteer(&reference.rows);

        let ingest = collect_sales_rows(self.store.as_ref(), year, self.page_size).await?;
        info!(
            year,
            files = ingest.files,
            rows = ingest.rows.len(),
            rejected = ingest.rejected,
            "sales rows collected"
        );
        let sales_rows = ingest.rows.len();

        // Aggregation starts only once every row has a resolution.
        let resolved: Vec<ResolvedRow> = stream::iter(ingest.rows)
            .map(|sale| async move {
                let parsed = match self.resolver.resolve(&sale.rm, &sale.address).await {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(?err, rm = %sale.rm, "row could not be resolved");
                        ParsedAddress::unresolved()
                    }
                };
                ResolvedRow { sale, parsed }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let unresolved_rows = resolved.iter().filter(|row| !row.parsed.is_resolved()).count();
        let engine = AggregationEngine::new(&reference.rows, self.settings);
        let summaries = engine.aggregate(resolved);
        info!(
            year,
            groups = summaries.len(),
            unresolved = unresolved_rows,
            "batch aggregated"
        );

        Ok(BatchReport {
            year,
            reference_rows: reference.rows.len(),
            reference_rejected: reference.rejected,
            files: ingest.files,
            sales_rows,
            sales_rejected: ingest.rejected,
            unresolved_rows,
            stats: self.resolver.stats(),
            summaries,
        })
    }
}
