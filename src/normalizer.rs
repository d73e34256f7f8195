use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static POSTAL_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{5,6})\b").expect("postal code pattern compiles"));
static WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern compiles"));
static DELIMITER_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*,[\s,]*").expect("delimiter pattern compiles"));

const LEGAL_FORMS: &[&str] = &[
    "ооо", "оао", "зао", "пао", "ао", "ип", "нко", "llc", "ltd", "inc",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Country,
    Region,
    City,
    Street,
    House,
}

/// Address text after cleanup. `text` is the cache key component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedAddress {
    pub raw: String,
    pub text: String,
    pub postal_code: Option<String>,
}

impl NormalizedAddress {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.text
            .split(',')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
    }

    /// Content words: no digits, no single letters, no address markers.
    pub fn tokens(&self) -> Vec<&str> {
        content_tokens(&self.text)
    }
}

pub fn content_tokens(text: &str) -> Vec<&str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .map(|word| word.trim_matches('-'))
        .filter(|word| word.chars().count() > 1)
        .filter(|word| !word.chars().all(|c| c.is_ascii_digit()))
        .filter(|word| classify_marker(word).is_none())
        .collect()
}

/// Trims, case-folds and unifies delimiters. Pure; never fails.
pub fn normalize_address(raw: &str) -> NormalizedAddress {
    let folded = raw.trim().to_lowercase().replace('ё', "е");
    let unified: String = folded
        .chars()
        .map(|c| match c {
            ';' | '|' | '\n' | '\r' | '\t' => ',',
            '«' | '»' | '"' | '“' | '”' => ' ',
            other => other,
        })
        .collect();
    let collapsed = WHITESPACE.replace_all(&unified, " ");
    let delimited = DELIMITER_RUN.replace_all(&collapsed, ", ");
    let text = delimited
        .trim_matches(|c: char| c == ',' || c.is_whitespace())
        .to_string();
    let postal_code = extract_postal_code(&text);

    NormalizedAddress {
        raw: raw.trim().to_string(),
        text,
        postal_code,
    }
}

pub fn extract_postal_code(text: &str) -> Option<String> {
    POSTAL_CODE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Folds a client or reference entity name so the same company matches across sheets.
pub fn normalize_entity_name(name: &str) -> String {
    let folded = name.to_lowercase().replace('ё', "е");
    folded
        .split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '.'))
        .map(|word| word.trim_matches('.'))
        .filter(|word| !word.is_empty())
        .filter(|word| !LEGAL_FORMS.contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn classify_marker(word: &str) -> Option<MarkerKind> {
    let word = word.trim_end_matches('.');
    match word {
        "россия" | "рф" => Some(MarkerKind::Country),
        "обл" | "область" | "край" | "респ" | "республика" | "округ" | "ао" => {
            Some(MarkerKind::Region)
        }
        "г" | "город" | "гор" | "пгт" | "пос" | "поселок" | "с" | "село" | "дер"
        | "деревня" | "ст-ца" | "станица" => Some(MarkerKind::City),
        "ул" | "улица" | "пр" | "пр-т" | "проспект" | "пр-кт" | "пер" | "переулок" | "ш"
        | "шоссе" | "б-р" | "бульвар" | "наб" | "набережная" | "пл" | "площадь" | "мкр"
        | "микрорайон" | "проезд" | "тракт" => Some(MarkerKind::Street),
        "д" | "дом" | "стр" | "строение" | "корп" | "к" | "зд" | "вл" | "владение" => {
            Some(MarkerKind::House)
        }
        _ => None,
    }
}
