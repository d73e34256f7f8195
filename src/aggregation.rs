use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::ser::{Serialize, SerializeStruct, Serializer};
use tracing::debug;

use crate::models::ParsedAddress;
use crate::normalizer::normalize_entity_name;
use crate::sheets::{ReferenceRow, SalesRow};

const DEFAULT_BASELINE_CLIENT_VOLUME: f64 = 0.0;
const FACT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Geography {
    Known(String),
    /// Bucket for rows whose address did not resolve.
    Unknown,
}

impl Geography {
    fn of(parsed: &ParsedAddress) -> Self {
        parsed
            .geography()
            .map(|name| fold_geography(&name))
            .filter(|name| !name.is_empty())
            .map(Geography::Known)
            .unwrap_or(Geography::Unknown)
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Geography::Known(name) => Some(name),
            Geography::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub rm: String,
    pub brand: String,
    pub geography: Geography,
}

/// Sales row paired with its resolution.
#[derive(Debug, Clone)]
pub struct ResolvedRow {
    pub sale: SalesRow,
    pub parsed: ParsedAddress,
}

#[derive(Debug, Clone, Copy)]
pub struct AggregationSettings {
    /// Volume assumed for an under-served reference entry when nothing better is known.
    pub baseline_client_volume: f64,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            baseline_client_volume: DEFAULT_BASELINE_CLIENT_VOLUME,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PotentialClient {
    pub name: String,
    pub activity: Option<String>,
    pub potential: Option<f64>,
}

/// One group summary. Growth figures are derived on read from fact and potential.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedDataRow {
    key: GroupKey,
    region: Option<String>,
    fact: f64,
    clients: BTreeMap<String, String>,
    potential_clients: Vec<PotentialClient>,
    baseline_client_volume: f64,
}

impl AggregatedDataRow {
    fn new(key: GroupKey, settings: &AggregationSettings) -> Self {
        Self {
            key,
            region: None,
            fact: 0.0,
            clients: BTreeMap::new(),
            potential_clients: Vec::new(),
            baseline_client_volume: settings.baseline_client_volume,
        }
    }

    fn add_sale(&mut self, sale: &SalesRow, parsed: &ParsedAddress) {
        self.fact += sale.fact;
        let normalized = normalize_entity_name(&sale.client_name);
        if !normalized.is_empty() {
            self.clients
                .entry(normalized)
                .or_insert_with(|| sale.client_name.trim().to_string());
        }
        if self.region.is_none() && parsed.is_resolved() && !parsed.region.trim().is_empty() {
            self.region = Some(parsed.region.trim().to_string());
        }
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn rm(&self) -> &str {
        &self.key.rm
    }

    pub fn brand(&self) -> &str {
        &self.key.brand
    }

    pub fn geography(&self) -> &Geography {
        &self.key.geography
    }

    pub fn fact(&self) -> f64 {
        self.fact
    }

    pub fn clients(&self) -> impl Iterator<Item = &str> {
        self.clients.values().map(String::as_str)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn potential_clients(&self) -> &[PotentialClient] {
        &self.potential_clients
    }

    fn mean_fact_per_client(&self) -> Option<f64> {
        (!self.clients.is_empty() && self.fact > FACT_EPSILON)
            .then(|| self.fact / self.clients.len() as f64)
    }

    /// Realized fact plus the estimated volume of every under-served entry.
    pub fn potential(&self) -> f64 {
        let fallback = self
            .mean_fact_per_client()
            .unwrap_or(self.baseline_client_volume);
        let untapped: f64 = self
            .potential_clients
            .iter()
            .map(|client| client.potential.unwrap_or(fallback).max(0.0))
            .sum();
        self.fact + untapped
    }

    pub fn growth_potential(&self) -> f64 {
        (self.potential() - self.fact).max(0.0)
    }

    /// Zero when there is no positive fact to compare against.
    pub fn growth_percentage(&self) -> f64 {
        if self.fact <= FACT_EPSILON {
            return 0.0;
        }
        self.growth_potential() / self.fact.max(FACT_EPSILON) * 100.0
    }
}

impl Serialize for AggregatedDataRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("AggregatedDataRow", 11)?;
        state.serialize_field("rm", &self.key.rm)?;
        state.serialize_field("brand", &self.key.brand)?;
        state.serialize_field("geography", &self.key.geography.name())?;
        state.serialize_field(
            "unknownGeography",
            &matches!(self.key.geography, Geography::Unknown),
        )?;
        state.serialize_field("region", &self.region)?;
        state.serialize_field("fact", &self.fact)?;
        state.serialize_field("potential", &self.potential())?;
        state.serialize_field("growthPotential", &self.growth_potential())?;
        state.serialize_field("growthPercentage", &self.growth_percentage())?;
        state.serialize_field("clients", &self.clients().collect::<Vec<_>>())?;
        state.serialize_field("potentialClients", &self.potential_clients)?;
        state.end()
    }
}

/// Groups resolved sales by `(rm, brand, geography)` against the reference dataset.
pub struct AggregationEngine {
    settings: AggregationSettings,
    reference_by_geography: BTreeMap<String, Vec<ReferenceRow>>,
}

impl AggregationEngine {
    pub fn new(reference: &[ReferenceRow], settings: AggregationSettings) -> Self {
        let mut reference_by_geography: BTreeMap<String, Vec<ReferenceRow>> = BTreeMap::new();
        for row in reference.iter().filter(|row| row.is_active()) {
            let Some(geography) = reference_geography(row) else {
                continue;
            };
            reference_by_geography
                .entry(geography)
                .or_default()
                .push(row.clone());
        }
        Self {
            settings,
            reference_by_geography,
        }
    }

    /// Consumes a complete batch. Every input row lands in exactly one group.
    pub fn aggregate<I>(&self, rows: I) -> Vec<AggregatedDataRow>
    where
        I: IntoIterator<Item = ResolvedRow>,
    {
        let mut groups: BTreeMap<GroupKey, AggregatedDataRow> = BTreeMap::new();
        let mut consumed = 0usize;
        for ResolvedRow { sale, parsed } in rows {
            let key = GroupKey {
                rm: sale.rm.trim().to_string(),
                brand: sale.brand.trim().to_string(),
                geography: Geography::of(&parsed),
            };
            groups
                .entry(key.clone())
                .or_insert_with(|| AggregatedDataRow::new(key, &self.settings))
                .add_sale(&sale, &parsed);
            consumed += 1;
        }

        let mut summaries: Vec<AggregatedDataRow> = groups
            .into_values()
            .map(|mut row| {
                row.potential_clients = self.under_served(&row);
                row
            })
            .collect();
        summaries.sort_by(compare_rows);
        debug!(
            rows = consumed,
            groups = summaries.len(),
            "aggregation finished"
        );
        summaries
    }

    fn under_served(&self, row: &AggregatedDataRow) -> Vec<PotentialClient> {
        let Geography::Known(name) = &row.key.geography else {
            return Vec::new();
        };
        let Some(candidates) = self.reference_by_geography.get(name) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        candidates
            .iter()
            .filter(|entry| !row.clients.contains_key(&entry.normalized_name))
            .filter(|entry| seen.insert(entry.normalized_name.clone()))
            .map(|entry| PotentialClient {
                name: entry.name.clone(),
                activity: entry.activity.clone(),
                potential: entry.potential,
            })
            .collect()
    }
}

fn compare_rows(a: &AggregatedDataRow, b: &AggregatedDataRow) -> Ordering {
    b.growth_potential()
        .total_cmp(&a.growth_potential())
        .then_with(|| a.key.cmp(&b.key))
}

fn reference_geography(row: &ReferenceRow) -> Option<String> {
    row.city
        .as_deref()
        .or(row.region.as_deref())
        .map(fold_geography)
        .filter(|name| !name.is_empty())
}

fn fold_geography(name: &str) -> String {
    name.trim().to_lowercase().replace('ё', "е")
}
