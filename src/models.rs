use serde::{Deserialize, Serialize};

/// Which pipeline stage produced a resolution. Variants are declared in tier order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Explicit,
    Postal,
    CityLookup,
    Fuzzy,
    Unknown,
}

impl ResolutionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionSource::Explicit => "explicit",
            ResolutionSource::Postal => "postal",
            ResolutionSource::CityLookup => "city_lookup",
            ResolutionSource::Fuzzy => "fuzzy",
            ResolutionSource::Unknown => "unknown",
        }
    }

    /// Inclusive confidence band `(floor, ceiling)` owned by this tier.
    /// Bands do not overlap, so any explicit result outranks any postal one and so on.
    pub fn band(&self) -> (f64, f64) {
        match self {
            ResolutionSource::Explicit => (0.75, 1.0),
            ResolutionSource::Postal => (0.6, 0.75),
            ResolutionSource::CityLookup => (0.4, 0.6),
            ResolutionSource::Fuzzy => (0.2, 0.4),
            ResolutionSource::Unknown => (0.0, 0.0),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.band().0
    }

    pub fn clamp_confidence(&self, value: f64) -> f64 {
        let (floor, ceiling) = self.band();
        if value.is_nan() {
            return floor;
        }
        value.clamp(floor, ceiling)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Resolved,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedAddress {
    pub country: String,
    pub region: String,
    pub city: Option<String>,
    pub street: Option<String>,
    pub house: Option<String>,
    pub postal_code: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub confidence: f64,
    pub source: ResolutionSource,
    #[serde(default)]
    pub ambiguous_candidates: Vec<String>,
    pub status: ResolutionStatus,
}

impl ParsedAddress {
    pub fn unresolved() -> Self {
        Self {
            country: String::new(),
            region: String::new(),
            city: None,
            street: None,
            house: None,
            postal_code: None,
            lat: None,
            lon: None,
            confidence: 0.0,
            source: ResolutionSource::Unknown,
            ambiguous_candidates: Vec::new(),
            status: ResolutionStatus::Unresolved,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == ResolutionStatus::Resolved
    }

    pub fn has_coordinates(&self) -> bool {
        self.lat.is_some() && self.lon.is_some()
    }

    /// City when known, otherwise region, case-folded. `None` for unresolved records.
    pub fn geography(&self) -> Option<String> {
        if !self.is_resolved() {
            return None;
        }
        self.city
            .as_deref()
            .filter(|city| !city.trim().is_empty())
            .or_else(|| Some(self.region.as_str()).filter(|region| !region.trim().is_empty()))
            .map(|value| value.trim().to_lowercase())
    }

    /// Single-line rendering used for history entries and candidate lists.
    pub fn summary_line(&self) -> String {
        if !self.is_resolved() {
            return "unresolved".to_string();
        }
        let mut parts: Vec<&str> = Vec::new();
        for part in [
            self.postal_code.as_deref(),
            Some(self.country.as_str()),
            Some(self.region.as_str()),
            self.city.as_deref(),
            self.street.as_deref(),
            self.house.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            let trimmed = part.trim();
            if !trimmed.is_empty() && !parts.contains(&trimmed) {
                parts.push(trimmed);
            }
        }
        parts.join(", ")
    }
}
