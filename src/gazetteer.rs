use std::collections::{BTreeMap, BTreeSet};

use crate::normalizer::extract_postal_code;
use crate::sheets::ReferenceRow;

pub const DEFAULT_COUNTRY: &str = "Россия";
const POSTAL_PREFIX_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GazetteerEntry {
    pub city: Option<String>,
    pub region: String,
}

impl GazetteerEntry {
    pub fn label(&self) -> String {
        match &self.city {
            Some(city) if !self.region.is_empty() && !city.eq_ignore_ascii_case(&self.region) => {
                format!("{city}, {}", self.region)
            }
            Some(city) => city.clone(),
            None => self.region.clone(),
        }
    }
}

/// Known places the offline stages match against.
#[derive(Debug, Clone)]
pub struct Gazetteer {
    country: String,
    cities: BTreeMap<String, BTreeSet<GazetteerEntry>>,
    regions: BTreeMap<String, String>,
    postal: BTreeMap<String, BTreeSet<GazetteerEntry>>,
}

impl Default for Gazetteer {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTRY)
    }
}

impl Gazetteer {
    pub fn new(country: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            cities: BTreeMap::new(),
            regions: BTreeMap::new(),
            postal: BTreeMap::new(),
        }
    }

    pub fn from_reference(rows: &[ReferenceRow]) -> Self {
        let mut gazetteer = Self::default();
        gazetteer.extend_from_reference(rows);
        gazetteer
    }

    /// Adds the cities, regions and legal-address postal codes of `rows`.
    pub fn extend_from_reference(&mut self, rows: &[ReferenceRow]) {
        for row in rows {
            let region = row.region.clone().unwrap_or_default();
            match row.city.as_deref() {
                Some(city) => self.add_city(city, &region),
                None if !region.is_empty() => self.add_region(&region),
                None => continue,
            }
            if let Some(code) = row.legal_address.as_deref().and_then(extract_postal_code) {
                self.add_postal(&code, row.city.as_deref(), &region);
            }
        }
    }

    pub fn with_city(mut self, city: &str, region: &str) -> Self {
        self.add_city(city, region);
        self
    }

    pub fn with_postal(mut self, code: &str, city: Option<&str>, region: &str) -> Self {
        self.add_postal(code, city, region);
        self
    }

    pub fn add_city(&mut self, city: &str, region: &str) {
        let city = city.trim();
        if city.is_empty() {
            return;
        }
        let region = if region.trim().is_empty() {
            city
        } else {
            region.trim()
        };
        self.add_region(region);
        self.cities
            .entry(fold(city))
            .or_default()
            .insert(GazetteerEntry {
                city: Some(city.to_string()),
                region: region.to_string(),
            });
    }

    pub fn add_region(&mut self, region: &str) {
        let region = region.trim();
        if region.is_empty() {
            return;
        }
        self.regions
            .entry(fold(region))
            .or_insert_with(|| region.to_string());
    }

    pub fn add_postal(&mut self, code: &str, city: Option<&str>, region: &str) {
        let code = code.trim();
        if !(5..=6).contains(&code.len()) || !code.chars().all(|c| c.is_ascii_digit()) {
            return;
        }
        if let Some(city) = city {
            self.add_city(city, region);
        } else {
            self.add_region(region);
        }
        let region = region.trim();
        let city = city.map(str::trim).filter(|c| !c.is_empty());
        let region = if region.is_empty() {
            city.unwrap_or_default()
        } else {
            region
        };
        if region.is_empty() {
            return;
        }
        self.postal
            .entry(code.to_string())
            .or_default()
            .insert(GazetteerEntry {
                city: city.map(str::to_string),
                region: region.to_string(),
            });
    }

    pub fn country(&self) -> &str {
        &self.country
    }

    pub fn is_empty(&self) -> bool {
        self.cities.is_empty() && self.regions.is_empty()
    }

    pub fn cities_named(&self, name: &str) -> Vec<&GazetteerEntry> {
        self.cities
            .get(&fold(name))
            .map(|entries| entries.iter().collect())
            .unwrap_or_default()
    }

    pub fn region_named(&self, name: &str) -> Option<&str> {
        self.regions.get(&fold(name)).map(String::as_str)
    }

    pub fn postal_exact(&self, code: &str) -> Vec<&GazetteerEntry> {
        self.postal
            .get(code)
            .map(|entries| entries.iter().collect())
            .unwrap_or_default()
    }

    /// Entries sharing the leading sorting-office digits of `code`.
    pub fn postal_prefix(&self, code: &str) -> Vec<&GazetteerEntry> {
        let Some(prefix) = code.get(..POSTAL_PREFIX_LEN) else {
            return Vec::new();
        };
        let found: BTreeSet<&GazetteerEntry> = self
            .postal
            .range(prefix.to_string()..)
            .take_while(|(known, _)| known.starts_with(prefix))
            .flat_map(|(_, entries)| entries.iter())
            .collect();
        found.into_iter().collect()
    }

    /// Every named entity as `(folded name, entry)`: cities first, then bare regions.
    pub fn entities(&self) -> impl Iterator<Item = (&str, GazetteerEntry)> + '_ {
        let cities = self.cities.iter().flat_map(|(folded, entries)| {
            entries
                .iter()
                .map(move |entry| (folded.as_str(), entry.clone()))
        });
        let regions = self.regions.iter().map(|(folded, display)| {
            (
                folded.as_str(),
                GazetteerEntry {
                    city: None,
                    region: display.clone(),
                },
            )
        });
        cities.chain(regions)
    }
}

fn fold(value: &str) -> String {
    value.trim().to_lowercase().replace('ё', "е")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheets::{RawSheetRow, ReferenceRow};

    fn reference(name: &str, city: Option<&str>, region: &str, address: &str) -> ReferenceRow {
        let mut raw = RawSheetRow::new();
        raw.insert("name".into(), name.into());
        raw.insert("region".into(), region.into());
        raw.insert("legal_address".into(), address.into());
        if let Some(city) = city {
            raw.insert("city".into(), city.into());
        }
        ReferenceRow::from_raw(&raw).unwrap()
    }

    #[test]
    fn builds_from_reference_rows() {
        let gazetteer = Gazetteer::from_reference(&[
            reference("A", Some("Казань"), "Татарстан", "420111, г. Казань, ул. Баумана 1"),
            reference("B", None, "Московская область", "141400, Химки"),
        ]);

        assert_eq!(gazetteer.cities_named("КАЗАНЬ").len(), 1);
        assert_eq!(gazetteer.region_named("татарстан"), Some("Татарстан"));
        assert_eq!(
            gazetteer.postal_exact("420111")[0].city.as_deref(),
            Some("Казань")
        );
        assert_eq!(gazetteer.postal_prefix("420999").len(), 1);
        assert_eq!(gazetteer.postal_exact("141400")[0].city, None);
    }

    #[test]
    fn same_city_name_in_two_regions() {
        let gazetteer = Gazetteer::default()
            .with_city("Троицк", "Москва")
            .with_city("Троицк", "Челябинская область");
        let entries = gazetteer.cities_named("троицк");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].label(), "Троицк, Москва");
    }
}
