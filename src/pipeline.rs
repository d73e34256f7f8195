use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use strsim::jaro_winkler;
use tracing::{debug, trace, warn};

use crate::gazetteer::{Gazetteer, GazetteerEntry};
use crate::geocoder::{GeocodeCandidate, GeocodeQuery, GeocoderAdapter, StructuredQuery};
use crate::models::{ParsedAddress, ResolutionSource, ResolutionStatus};
use crate::normalizer::{classify_marker, content_tokens, MarkerKind, NormalizedAddress};
use crate::sheets::ReferenceRow;

const AMBIGUITY_PENALTY: f64 = 0.05;
const MAX_AMBIGUOUS: usize = 5;
const NEAR_EQUAL_OVERLAP: f64 = 0.05;
const NEAR_EQUAL_SIMILARITY: f64 = 0.02;
const NEAR_EQUAL_IMPORTANCE: f64 = 0.05;
const MIN_TOKEN_OVERLAP: f64 = 0.5;
const MIN_FUZZY_TOKEN_CHARS: usize = 4;

/// Resolution stages in fallback order. `Unknown` is terminal and always accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Explicit,
    Postal,
    CityLookup,
    Fuzzy,
    Unknown,
}

impl Stage {
    pub const ORDER: [Stage; 5] = [
        Stage::Explicit,
        Stage::Postal,
        Stage::CityLookup,
        Stage::Fuzzy,
        Stage::Unknown,
    ];

    pub fn source(&self) -> ResolutionSource {
        match self {
            Stage::Explicit => ResolutionSource::Explicit,
            Stage::Postal => ResolutionSource::Postal,
            Stage::CityLookup => ResolutionSource::CityLookup,
            Stage::Fuzzy => ResolutionSource::Fuzzy,
            Stage::Unknown => ResolutionSource::Unknown,
        }
    }
}

#[derive(Debug)]
enum StageOutcome {
    Accepted(ParsedAddress),
    Miss,
}

/// Runs the stage state machine over one normalized address.
pub struct ResolutionPipeline {
    gazetteer: RwLock<Arc<Gazetteer>>,
    geocoder: Option<Arc<GeocoderAdapter>>,
    stages: Vec<Stage>,
    fuzzy_floor: f64,
}

impl ResolutionPipeline {
    pub fn new(gazetteer: Gazetteer, geocoder: Option<Arc<GeocoderAdapter>>, fuzzy_floor: f64) -> Self {
        Self {
            gazetteer: RwLock::new(Arc::new(gazetteer)),
            geocoder,
            stages: Stage::ORDER.to_vec(),
            fuzzy_floor: fuzzy_floor.clamp(0.0, 1.0),
        }
    }

    /// Replaces the stage order. `Unknown` is appended when missing so every run terminates.
    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        let mut ordered: Vec<Stage> = Vec::with_capacity(stages.len() + 1);
        for stage in stages {
            if stage != Stage::Unknown && !ordered.contains(&stage) {
                ordered.push(stage);
            }
        }
        ordered.push(Stage::Unknown);
        self.stages = ordered;
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Merges reference rows into the live gazetteer. Entries are only ever added, so
    /// batches extending it at the same time each keep what they contributed.
    pub fn extend_gazetteer(&self, rows: &[ReferenceRow]) {
        let mut current = self.gazetteer.write();
        let mut merged = (**current).clone();
        merged.extend_from_reference(rows);
        *current = Arc::new(merged);
    }

    pub fn gazetteer(&self) -> Arc<Gazetteer> {
        Arc::clone(&self.gazetteer.read())
    }

    pub fn geocoder(&self) -> Option<&Arc<GeocoderAdapter>> {
        self.geocoder.as_ref()
    }

    /// Always yields a record; unresolved is the universal fallback.
    pub async fn resolve(&self, address: &NormalizedAddress) -> ParsedAddress {
        if address.is_empty() {
            return ParsedAddress::unresolved();
        }

        let gazetteer = self.gazetteer();
        let structure = StructuralParse::from_address(address, &gazetteer);
        let mut position = 0;
        loop {
            let stage = self.stages[position];
            let outcome = self.attempt(stage, address, &structure, &gazetteer).await;
            match outcome {
                StageOutcome::Accepted(parsed) => {
                    debug!(
                        stage = ?stage,
                        confidence = parsed.confidence,
                        ambiguous = parsed.ambiguous_candidates.len(),
                        "address resolved"
                    );
                    if parsed.is_resolved() {
                        return self.enrich(parsed).await;
                    }
                    return parsed;
                }
                StageOutcome::Miss => {
                    trace!(stage = ?stage, "stage missed");
                    position += 1;
                    if position >= self.stages.len() {
                        return ParsedAddress::unresolved();
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        stage: Stage,
        address: &NormalizedAddress,
        structure: &StructuralParse,
        gazetteer: &Gazetteer,
    ) -> StageOutcome {
        let accepted = match stage {
            Stage::Explicit => explicit_stage(address, structure, gazetteer),
            Stage::Postal => self.postal_stage(address, structure, gazetteer).await,
            Stage::CityLookup => city_lookup_stage(address, structure, gazetteer),
            Stage::Fuzzy => self.fuzzy_stage(address, structure, gazetteer).await,
            Stage::Unknown => return StageOutcome::Accepted(ParsedAddress::unresolved()),
        };
        match accepted {
            Some(parsed) if parsed.confidence >= stage.source().threshold() => {
                StageOutcome::Accepted(parsed)
            }
            _ => StageOutcome::Miss,
        }
    }

    async fn postal_stage(
        &self,
        address: &NormalizedAddress,
        structure: &StructuralParse,
        gazetteer: &Gazetteer,
    ) -> Option<ParsedAddress> {
        let code = address.postal_code.as_deref()?;
        let tokens = address.tokens();

        let exact = gazetteer.postal_exact(code);
        let (entries, specificity) = if exact.is_empty() {
            (gazetteer.postal_prefix(code), 0.66)
        } else {
            (exact, 0.75)
        };

        if !entries.is_empty() {
            let ordered = prefer_mentioned(entries, &tokens);
            let (best, rest) = ordered.split_first()?;
            let mut parsed = record_from_entry(
                ResolutionSource::Postal,
                best,
                structure,
                gazetteer.country(),
                specificity,
            );
            parsed.postal_code = Some(code.to_string());
            apply_ambiguity(&mut parsed, rest.iter().map(|entry| entry.label()));
            return Some(parsed);
        }

        let query = GeocodeQuery::Structured(StructuredQuery {
            country: Some(gazetteer.country().to_string()),
            postal_code: Some(code.to_string()),
            ..StructuredQuery::default()
        });
        let candidates = self.lookup(Stage::Postal, &query).await?;
        let (best, rest) = candidates.split_first()?;
        if best.city.is_none() && best.region.is_none() {
            return None;
        }
        let mut parsed = record_from_candidate(ResolutionSource::Postal, best, structure, gazetteer, 0.7);
        parsed.postal_code = Some(code.to_string());
        apply_ambiguity(&mut parsed, near_equal_candidates(best, rest));
        Some(parsed)
    }

    async fn fuzzy_stage(
        &self,
        address: &NormalizedAddress,
        structure: &StructuralParse,
        gazetteer: &Gazetteer,
    ) -> Option<ParsedAddress> {
        let terms = fuzzy_terms(&address.tokens());
        if terms.is_empty() {
            return None;
        }

        let mut scored: Vec<(f64, GazetteerEntry)> = gazetteer
            .entities()
            .filter_map(|(name, entry)| {
                let similarity = best_similarity(&terms, name);
                (similarity >= self.fuzzy_floor).then_some((similarity, entry))
            })
            .collect();
        drop_covered_regions(&mut scored);

        if !scored.is_empty() {
            scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
            let (best_score, best) = scored[0].clone();
            let confidence = self.fuzzy_confidence(best_score);
            let mut parsed = record_from_entry(
                ResolutionSource::Fuzzy,
                &best,
                structure,
                gazetteer.country(),
                confidence,
            );
            let alternatives = scored[1..]
                .iter()
                .filter(|(score, _)| best_score - score <= NEAR_EQUAL_SIMILARITY)
                .map(|(_, entry)| entry.label());
            apply_ambiguity(&mut parsed, alternatives);
            parsed.postal_code = address.postal_code.clone();
            return Some(parsed);
        }

        let query = GeocodeQuery::FreeText(address.text.clone());
        let candidates = self.lookup(Stage::Fuzzy, &query).await?;
        let (best, rest) = candidates.split_first()?;
        let names = [best.city.as_deref(), best.region.as_deref()]
            .into_iter()
            .flatten()
            .map(|name| name.to_lowercase())
            .collect::<Vec<_>>();
        let similarity = names
            .iter()
            .map(|name| best_similarity(&terms, name))
            .fold(0.0_f64, f64::max);
        if similarity < self.fuzzy_floor {
            trace!(similarity, "geocoder hit below similarity floor");
            return None;
        }
        let confidence = self.fuzzy_confidence(similarity);
        let mut parsed =
            record_from_candidate(ResolutionSource::Fuzzy, best, structure, gazetteer, confidence);
        apply_ambiguity(&mut parsed, near_equal_candidates(best, rest));
        if parsed.postal_code.is_none() {
            parsed.postal_code = address.postal_code.clone();
        }
        Some(parsed)
    }

    fn fuzzy_confidence(&self, similarity: f64) -> f64 {
        let (floor, ceiling) = ResolutionSource::Fuzzy.band();
        let span = (1.0 - self.fuzzy_floor).max(f64::EPSILON);
        let scaled = ((similarity - self.fuzzy_floor) / span).clamp(0.0, 1.0);
        floor + (ceiling - floor) * scaled
    }

    /// Geocoder call for a stage; any failure counts as a stage miss.
    async fn lookup(&self, stage: Stage, query: &GeocodeQuery) -> Option<Vec<GeocodeCandidate>> {
        let geocoder = self.geocoder.as_ref()?;
        match geocoder.search(query).await {
            Ok(candidates) if candidates.is_empty() => None,
            Ok(candidates) => Some(candidates),
            Err(err) => {
                warn!(?err, stage = ?stage, "geocoder lookup failed; treating stage as a miss");
                None
            }
        }
    }

    /// Adds coordinates to an accepted record. Failure leaves coordinates empty.
    async fn enrich(&self, mut parsed: ParsedAddress) -> ParsedAddress {
        if parsed.has_coordinates() {
            return parsed;
        }
        let Some(geocoder) = self.geocoder.as_ref() else {
            return parsed;
        };

        let street = match (&parsed.street, &parsed.house) {
            (Some(street), Some(house)) => Some(format!("{house} {street}")),
            (Some(street), None) => Some(street.clone()),
            _ => None,
        };
        let query = GeocodeQuery::Structured(StructuredQuery {
            country: Some(parsed.country.clone()).filter(|c| !c.is_empty()),
            state: Some(parsed.region.clone()).filter(|r| !r.is_empty()),
            city: parsed.city.clone(),
            street,
            postal_code: parsed.postal_code.clone(),
        });

        match geocoder.search(&query).await {
            Ok(candidates) => {
                if let Some((best, rest)) = candidates.split_first() {
                    parsed.lat = Some(best.lat);
                    parsed.lon = Some(best.lon);
                    if parsed.postal_code.is_none() {
                        parsed.postal_code = best.postal_code.clone();
                    }
                    apply_ambiguity(&mut parsed, near_equal_candidates(best, rest));
                }
            }
            Err(err) => {
                warn!(?err, "coordinate lookup failed; keeping resolution without coordinates");
            }
        }
        parsed
    }
}

/// Components recovered from address markers (`г.`, `ул.`, `д.` ...).
#[derive(Debug, Clone, Default, PartialEq)]
struct StructuralParse {
    country: Option<String>,
    region: Option<String>,
    city: Option<String>,
    street: Option<String>,
    house: Option<String>,
    city_marked: bool,
    unclassified: usize,
}

impl StructuralParse {
    fn from_address(address: &NormalizedAddress, gazetteer: &Gazetteer) -> Self {
        let mut parse = Self::default();
        for segment in address.segments() {
            if address.postal_code.as_deref() == Some(segment) {
                continue;
            }
            let runs = marker_runs(segment);
            let whole_segment = runs.len() == 1;
            for (kind, words) in runs {
                let rest: Vec<&str> = words.iter().map(String::as_str).collect();
                let value = rest.join(" ");
                let region_source = if whole_segment { segment } else { value.as_str() };
                parse.apply(kind, &rest, &value, region_source, gazetteer);
            }
        }
        parse
    }

    fn apply(
        &mut self,
        kind: Option<MarkerKind>,
        rest: &[&str],
        value: &str,
        region_source: &str,
        gazetteer: &Gazetteer,
    ) {
        match kind {
            Some(MarkerKind::Country) => {
                self.country.get_or_insert_with(|| gazetteer.country().to_string());
            }
            Some(MarkerKind::Region) => {
                if self.region.is_none() && !value.is_empty() {
                    self.region = Some(region_display(region_source, value, gazetteer));
                }
            }
            Some(MarkerKind::City) => {
                if self.city.is_none() && !value.is_empty() {
                    self.city = Some(value.to_string());
                    self.city_marked = true;
                }
            }
            Some(MarkerKind::Street) => {
                let (street, house) = split_trailing_number(rest);
                if self.house.is_none() {
                    self.house = house;
                }
                if self.street.is_none() && !street.is_empty() {
                    self.street = Some(street);
                }
            }
            Some(MarkerKind::House) => {
                if self.house.is_none() && !value.is_empty() {
                    self.house = Some(value.to_string());
                }
            }
            None => {
                if !value.is_empty() {
                    self.classify_bare(value, gazetteer);
                }
            }
        }
    }

    fn classify_bare(&mut self, value: &str, gazetteer: &Gazetteer) {
        let starts_with_digit = value.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false);
        if starts_with_digit && self.street.is_some() && self.house.is_none() {
            self.house = Some(value.to_string());
        } else if self.city.is_none() && !gazetteer.cities_named(value).is_empty() {
            self.city = Some(value.to_string());
        } else if self.region.is_none() && gazetteer.region_named(value).is_some() {
            self.region = gazetteer.region_named(value).map(str::to_string);
        } else {
            self.unclassified += 1;
        }
    }
}

fn explicit_stage(
    address: &NormalizedAddress,
    structure: &StructuralParse,
    gazetteer: &Gazetteer,
) -> Option<ParsedAddress> {
    if !structure.city_marked {
        return None;
    }
    let city = structure.city.as_deref()?;

    let mut confidence = 1.0;
    if structure.street.is_none() {
        confidence -= 0.1;
    }
    if structure.house.is_none() {
        confidence -= 0.1;
    }
    confidence -= 0.05 * structure.unclassified as f64;

    let known = gazetteer.cities_named(city);
    let mut alternatives = Vec::new();
    let (city_display, region) = match &structure.region {
        Some(region) => {
            let display = known
                .iter()
                .find(|entry| entry.region.eq_ignore_ascii_case(region))
                .or(known.first())
                .and_then(|entry| entry.city.clone())
                .unwrap_or_else(|| display_case(city));
            (display, region.clone())
        }
        None => match known.split_first() {
            Some((best, rest)) => {
                alternatives.extend(rest.iter().map(|entry| entry.label()));
                (
                    best.city.clone().unwrap_or_else(|| display_case(city)),
                    best.region.clone(),
                )
            }
            None => {
                confidence -= 0.1;
                let display = display_case(city);
                (display.clone(), display)
            }
        },
    };

    if confidence < ResolutionSource::Explicit.threshold() {
        return None;
    }

    let mut parsed = ParsedAddress {
        country: structure
            .country
            .clone()
            .unwrap_or_else(|| gazetteer.country().to_string()),
        region,
        city: Some(city_display),
        street: structure.street.as_deref().map(display_case),
        house: structure.house.clone(),
        postal_code: address.postal_code.clone(),
        lat: None,
        lon: None,
        confidence: ResolutionSource::Explicit.clamp_confidence(confidence),
        source: ResolutionSource::Explicit,
        ambiguous_candidates: Vec::new(),
        status: ResolutionStatus::Resolved,
    };
    apply_ambiguity(&mut parsed, alternatives);
    Some(parsed)
}

fn city_lookup_stage(
    address: &NormalizedAddress,
    structure: &StructuralParse,
    gazetteer: &Gazetteer,
) -> Option<ParsedAddress> {
    let tokens = address.tokens();
    if tokens.is_empty() {
        return None;
    }

    let mut scored: Vec<(f64, GazetteerEntry)> = gazetteer
        .entities()
        .filter_map(|(name, entry)| {
            let name_tokens = content_tokens(name);
            if name_tokens.is_empty() {
                return None;
            }
            let matched = name_tokens.iter().filter(|t| tokens.contains(t)).count();
            let overlap = matched as f64 / name_tokens.len() as f64;
            (overlap >= MIN_TOKEN_OVERLAP).then_some((overlap, entry))
        })
        .collect();
    drop_covered_regions(&mut scored);
    if scored.is_empty() {
        return None;
    }

    scored.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then_with(|| b.1.city.is_some().cmp(&a.1.city.is_some()))
            .then_with(|| a.1.cmp(&b.1))
    });
    let (best_overlap, best) = scored[0].clone();
    let (floor, ceiling) = ResolutionSource::CityLookup.band();
    let confidence = floor + (ceiling - floor) * best_overlap;
    let mut parsed = record_from_entry(
        ResolutionSource::CityLookup,
        &best,
        structure,
        gazetteer.country(),
        confidence,
    );
    parsed.postal_code = address.postal_code.clone();
    let alternatives = scored[1..]
        .iter()
        .filter(|(overlap, _)| best_overlap - overlap <= NEAR_EQUAL_OVERLAP)
        .map(|(_, entry)| entry.label());
    apply_ambiguity(&mut parsed, alternatives);
    Some(parsed)
}

fn record_from_entry(
    source: ResolutionSource,
    entry: &GazetteerEntry,
    structure: &StructuralParse,
    country: &str,
    confidence: f64,
) -> ParsedAddress {
    ParsedAddress {
        country: country.to_string(),
        region: entry.region.clone(),
        city: entry.city.clone(),
        street: structure.street.as_deref().map(display_case),
        house: structure.house.clone(),
        postal_code: None,
        lat: None,
        lon: None,
        confidence: source.clamp_confidence(confidence),
        source,
        ambiguous_candidates: Vec::new(),
        status: ResolutionStatus::Resolved,
    }
}

fn record_from_candidate(
    source: ResolutionSource,
    candidate: &GeocodeCandidate,
    structure: &StructuralParse,
    gazetteer: &Gazetteer,
    confidence: f64,
) -> ParsedAddress {
    let region = candidate
        .region
        .clone()
        .or_else(|| structure.region.clone())
        .or_else(|| candidate.city.clone())
        .unwrap_or_default();
    ParsedAddress {
        country: candidate
            .country
            .clone()
            .unwrap_or_else(|| gazetteer.country().to_string()),
        region,
        city: candidate.city.clone(),
        street: candidate
            .street
            .clone()
            .or_else(|| structure.street.as_deref().map(display_case)),
        house: candidate.house.clone().or_else(|| structure.house.clone()),
        postal_code: candidate.postal_code.clone(),
        lat: Some(candidate.lat),
        lon: Some(candidate.lon),
        confidence: source.clamp_confidence(confidence),
        source,
        ambiguous_candidates: Vec::new(),
        status: ResolutionStatus::Resolved,
    }
}

/// Records alternatives and lowers confidence inside the record's own band.
fn apply_ambiguity(parsed: &mut ParsedAddress, alternatives: impl IntoIterator<Item = String>) {
    let primary = parsed.summary_line();
    for alternative in alternatives {
        if parsed.ambiguous_candidates.len() >= MAX_AMBIGUOUS {
            break;
        }
        if alternative.is_empty()
            || alternative == primary
            || parsed.ambiguous_candidates.contains(&alternative)
        {
            continue;
        }
        parsed.ambiguous_candidates.push(alternative);
        parsed.confidence = parsed
            .source
            .clamp_confidence(parsed.confidence - AMBIGUITY_PENALTY);
    }
}

/// Provider alternatives ranked close to the first hit. Missing importance counts as equal.
fn near_equal_candidates<'a>(
    best: &'a GeocodeCandidate,
    rest: &'a [GeocodeCandidate],
) -> impl Iterator<Item = String> + 'a {
    rest.iter()
        .filter(move |candidate| match (best.importance, candidate.importance) {
            (Some(top), Some(other)) => top - other <= NEAR_EQUAL_IMPORTANCE,
            _ => true,
        })
        .map(|candidate| candidate.display_name.clone())
}

/// Keeps only entries the address names outright, when there are any.
fn prefer_mentioned<'a>(entries: Vec<&'a GazetteerEntry>, tokens: &[&str]) -> Vec<&'a GazetteerEntry> {
    let mentioned = |entry: &GazetteerEntry| {
        let name = entry
            .city
            .as_deref()
            .unwrap_or(entry.region.as_str())
            .to_lowercase();
        let name_tokens = content_tokens(&name);
        !name_tokens.is_empty() && name_tokens.iter().all(|t| tokens.contains(t))
    };
    let (named, others): (Vec<_>, Vec<_>) =
        entries.into_iter().partition(|entry| mentioned(*entry));
    if named.is_empty() {
        others
    } else {
        named
    }
}

/// Region-only matches are redundant when a matched city lies in that region.
fn drop_covered_regions(scored: &mut Vec<(f64, GazetteerEntry)>) {
    let city_regions: BTreeSet<String> = scored
        .iter()
        .filter(|(_, entry)| entry.city.is_some())
        .map(|(_, entry)| entry.region.to_lowercase())
        .collect();
    scored.retain(|(_, entry)| {
        entry.city.is_some() || !city_regions.contains(&entry.region.to_lowercase())
    });
}

fn fuzzy_terms(tokens: &[&str]) -> Vec<String> {
    let mut terms: Vec<String> = tokens
        .iter()
        .filter(|token| token.chars().count() >= MIN_FUZZY_TOKEN_CHARS)
        .map(|token| token.to_string())
        .collect();
    terms.extend(tokens.windows(2).map(|pair| pair.join(" ")));
    terms
}

fn best_similarity(terms: &[String], name: &str) -> f64 {
    let folded_name = content_tokens(name).join(" ");
    if folded_name.is_empty() {
        return 0.0;
    }
    terms
        .iter()
        .map(|term| jaro_winkler(term, &folded_name))
        .fold(0.0_f64, f64::max)
}

/// Splits a segment into runs that each start at a marker word.
///
/// Words before the first marker form an unmarked run. A marker with nothing after
/// it labels the unmarked run in front of it (`самарская обл`), and a house marker
/// that follows a house run stays inside it (`5 корп 2`).
fn marker_runs(segment: &str) -> Vec<(Option<MarkerKind>, Vec<String>)> {
    let mut runs: Vec<(Option<MarkerKind>, Vec<String>)> = Vec::new();
    for word in segment.replace('.', ". ").split_whitespace() {
        match classify_marker(word) {
            Some(MarkerKind::House) => match runs.last_mut() {
                Some((Some(MarkerKind::House), words)) if !words.is_empty() => {
                    words.push(word.trim_end_matches('.').to_string());
                }
                _ => runs.push((Some(MarkerKind::House), Vec::new())),
            },
            Some(found) => runs.push((Some(found), Vec::new())),
            None => {
                let word = word.trim_end_matches('.');
                if word.is_empty() {
                    continue;
                }
                match runs.last_mut() {
                    Some((_, words)) => words.push(word.to_string()),
                    None => runs.push((None, vec![word.to_string()])),
                }
            }
        }
    }

    let mut labelled: Vec<(Option<MarkerKind>, Vec<String>)> = Vec::with_capacity(runs.len());
    for (kind, words) in runs {
        match labelled.last_mut() {
            Some((previous, previous_words))
                if words.is_empty() && previous.is_none() && !previous_words.is_empty() =>
            {
                *previous = kind;
            }
            _ => labelled.push((kind, words)),
        }
    }
    labelled
}

fn split_trailing_number(words: &[&str]) -> (String, Option<String>) {
    match words.split_last() {
        Some((last, head))
            if !head.is_empty() && last.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) =>
        {
            (head.join(" "), Some(last.to_string()))
        }
        _ => (words.join(" "), None),
    }
}

fn region_display(segment: &str, value: &str, gazetteer: &Gazetteer) -> String {
    if let Some(known) = gazetteer.region_named(segment) {
        return known.to_string();
    }
    let wanted = content_tokens(value);
    gazetteer
        .entities()
        .filter(|(_, entry)| entry.city.is_none())
        .find(|(name, _)| content_tokens(name) == wanted)
        .map(|(_, entry)| entry.region)
        .unwrap_or_else(|| display_case(segment))
}

fn display_case(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
