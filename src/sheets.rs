use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::normalizer::normalize_entity_name;

const OKB_FILE_NAME: &str = "okb.csv";

pub type RawSheetRow = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: String,
    pub name: String,
    pub year: i32,
}

#[derive(Debug, Clone, Default)]
pub struct RowPage {
    pub rows: Vec<RawSheetRow>,
    pub has_more: bool,
}

/// Read-only spreadsheet backend. Pages may come back shorter than `limit`.
#[async_trait]
pub trait SheetStore: Send + Sync {
    async fn get_okb_data(&self) -> AppResult<Vec<RawSheetRow>>;
    async fn list_files_for_year(&self, year: i32) -> AppResult<Vec<FileDescriptor>>;
    async fn fetch_rows(&self, file_id: &str, offset: usize, limit: usize) -> AppResult<RowPage>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceRow {
    pub name: String,
    pub normalized_name: String,
    pub legal_address: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub activity: Option<String>,
    pub status: Option<String>,
    pub potential: Option<f64>,
}

impl ReferenceRow {
    pub fn from_raw(raw: &RawSheetRow) -> AppResult<Self> {
        let fields = FoldedRow::new(raw);
        let name = fields
            .get(&["name", "наименование", "название", "клиент"])
            .ok_or_else(|| AppError::validation("reference row missing name"))?;
        let region = fields.get(&["region", "регион", "область", "субъект"]);
        let city = fields.get(&["city", "город", "населенный пункт"]);
        let legal_address = fields.get(&["legal_address", "legal address", "юридический адрес", "адрес"]);
        if region.is_none() && city.is_none() && legal_address.is_none() {
            return Err(AppError::validation(format!(
                "reference row '{name}' has no region, city or legal address"
            )));
        }
        let potential = match fields.get(&["potential", "потенциал"]) {
            Some(value) => Some(parse_amount(&value).ok_or_else(|| {
                AppError::validation(format!("reference row '{name}' has invalid potential"))
            })?),
            None => None,
        };

        Ok(Self {
            normalized_name: normalize_entity_name(&name),
            name,
            legal_address,
            region,
            city,
            activity: fields.get(&["activity", "вид деятельности", "оквэд"]),
            status: fields.get(&["status", "статус"]),
            potential,
        })
    }

    pub fn is_active(&self) -> bool {
        let Some(status) = self.status.as_deref() else {
            return true;
        };
        let folded = status.to_lowercase();
        !["ликвид", "закрыт", "прекращ", "банкрот", "inactive", "closed", "liquidated"]
            .iter()
            .any(|marker| folded.contains(marker))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceDataset {
    pub rows: Vec<ReferenceRow>,
    pub rejected: usize,
}

impl ReferenceDataset {
    pub fn from_raw_rows(raw_rows: &[RawSheetRow]) -> Self {
        let mut dataset = Self::default();
        for raw in raw_rows {
            match ReferenceRow::from_raw(raw) {
                Ok(row) => dataset.rows.push(row),
                Err(err) => {
                    warn!(?err, "rejected reference row");
                    dataset.rejected += 1;
                }
            }
        }
        dataset
    }
}

/// Transactional row from a yearly sales sheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SalesRow {
    pub rm: String,
    pub brand: String,
    pub client_name: String,
    pub address: String,
    pub fact: f64,
}

impl SalesRow {
    pub fn from_raw(raw: &RawSheetRow) -> AppResult<Self> {
        let fields = FoldedRow::new(raw);
        let rm = fields
            .get(&["rm", "рм", "менеджер", "rm_name"])
            .ok_or_else(|| AppError::validation("sales row missing rm"))?;
        let brand = fields
            .get(&["brand", "бренд"])
            .ok_or_else(|| AppError::validation("sales row missing brand"))?;
        let client_name = fields
            .get(&["client", "клиент", "наименование", "client_name"])
            .ok_or_else(|| AppError::validation("sales row missing client"))?;
        let fact_raw = fields
            .get(&["fact", "факт", "объем", "volume"])
            .ok_or_else(|| AppError::validation("sales row missing fact"))?;
        let fact = parse_amount(&fact_raw)
            .ok_or_else(|| AppError::validation(format!("invalid fact value '{fact_raw}'")))?;

        Ok(Self {
            rm,
            brand,
            client_name,
            address: fields.get(&["address", "адрес"]).unwrap_or_default(),
            fact,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SalesIngest {
    pub rows: Vec<SalesRow>,
    pub rejected: usize,
    pub files: usize,
}

/// Loads and validates the reference dataset. Any store failure is fatal to the caller's batch.
pub async fn load_reference(store: &dyn SheetStore) -> AppResult<ReferenceDataset> {
    let raw = match store.get_okb_data().await {
        Ok(rows) => rows,
        Err(err) if err.is_transient() => {
            warn!(?err, "reference fetch failed; retrying once");
            store
                .get_okb_data()
                .await
                .map_err(|err| AppError::ReferenceLoad(err.to_string()))?
        }
        Err(err) => return Err(AppError::ReferenceLoad(err.to_string())),
    };
    let dataset = ReferenceDataset::from_raw_rows(&raw);
    debug!(
        accepted = dataset.rows.len(),
        rejected = dataset.rejected,
        "reference dataset loaded"
    );
    Ok(dataset)
}

/// Walks every file of `year` page by page until the store reports no more rows.
pub async fn collect_sales_rows(
    store: &dyn SheetStore,
    year: i32,
    page_size: usize,
) -> AppResult<SalesIngest> {
    let limit = page_size.max(1);
    let files = store.list_files_for_year(year).await?;
    let mut ingest = SalesIngest {
        files: files.len(),
        ..SalesIngest::default()
    };

    for file in files {
        let mut offset = 0;
        loop {
            let page = fetch_page_with_retry(store, &file.id, offset, limit).await?;
            if page.rows.is_empty() {
                if page.has_more {
                    warn!(file = %file.id, offset, "empty page reported more rows; stopping");
                }
                break;
            }
            offset += page.rows.len();
            for raw in &page.rows {
                match SalesRow::from_raw(raw) {
                    Ok(row) => ingest.rows.push(row),
                    Err(err) => {
                        warn!(?err, file = %file.id, "rejected sales row");
                        ingest.rejected += 1;
                    }
                }
            }
            if !page.has_more {
                break;
            }
        }
    }

    Ok(ingest)
}

async fn fetch_page_with_retry(
    store: &dyn SheetStore,
    file_id: &str,
    offset: usize,
    limit: usize,
) -> AppResult<RowPage> {
    match store.fetch_rows(file_id, offset, limit).await {
        Err(err) if err.is_transient() => {
            warn!(?err, file = %file_id, offset, "sheet page fetch failed; retrying once");
            store.fetch_rows(file_id, offset, limit).await
        }
        other => other,
    }
}

/// Sheet store over a directory: `okb.csv` at the root and `<year>/*.csv` sales files.
pub struct CsvSheetStore {
    root: PathBuf,
}

impl CsvSheetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve_file(&self, file_id: &str) -> AppResult<PathBuf> {
        let relative = Path::new(file_id);
        let escapes = relative
            .components()
            .any(|part| !matches!(part, Component::Normal(_)));
        if file_id.trim().is_empty() || escapes {
            return Err(AppError::validation(format!("invalid file id '{file_id}'")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl SheetStore for CsvSheetStore {
    async fn get_okb_data(&self) -> AppResult<Vec<RawSheetRow>> {
        read_csv_rows(&self.root.join(OKB_FILE_NAME))
    }

    async fn list_files_for_year(&self, year: i32) -> AppResult<Vec<FileDescriptor>> {
        let dir = self.root.join(year.to_string());
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|ext| ext == "csv").unwrap_or(false))
            .filter_map(|path| {
                let name = path.file_name()?.to_string_lossy().to_string();
                Some(FileDescriptor {
                    id: format!("{year}/{name}"),
                    name,
                    year,
                })
            })
            .collect::<Vec<_>>();
        files.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(files)
    }

    async fn fetch_rows(&self, file_id: &str, offset: usize, limit: usize) -> AppResult<RowPage> {
        let path = self.resolve_file(file_id)?;
        let rows = read_csv_rows(&path)?;
        let end = offset.saturating_add(limit).min(rows.len());
        let page = rows.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        Ok(RowPage {
            has_more: end < rows.len(),
            rows: page,
        })
    }
}

fn read_csv_rows(path: &Path) -> AppResult<Vec<RawSheetRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(header, value)| (header.to_string(), value.to_string()))
            .collect::<RawSheetRow>();
        rows.push(row);
    }
    Ok(rows)
}

/// Sheet store held entirely in memory. `page_cap` simulates a backend returning short pages.
#[derive(Debug, Clone, Default)]
pub struct InMemorySheetStore {
    reference: Vec<RawSheetRow>,
    files: Vec<(FileDescriptor, Vec<RawSheetRow>)>,
    page_cap: Option<usize>,
}

impl InMemorySheetStore {
    pub fn new(reference: Vec<RawSheetRow>) -> Self {
        Self {
            reference,
            ..Self::default()
        }
    }

    pub fn with_file(mut self, year: i32, name: &str, rows: Vec<RawSheetRow>) -> Self {
        let descriptor = FileDescriptor {
            id: format!("{year}/{name}"),
            name: name.to_string(),
            year,
        };
        self.files.push((descriptor, rows));
        self
    }

    pub fn with_page_cap(mut self, cap: usize) -> Self {
        self.page_cap = Some(cap.max(1));
        self
    }
}

#[async_trait]
impl SheetStore for InMemorySheetStore {
    async fn get_okb_data(&self) -> AppResult<Vec<RawSheetRow>> {
        Ok(self.reference.clone())
    }

    async fn list_files_for_year(&self, year: i32) -> AppResult<Vec<FileDescriptor>> {
        Ok(self
            .files
            .iter()
            .filter(|(descriptor, _)| descriptor.year == year)
            .map(|(descriptor, _)| descriptor.clone())
            .collect())
    }

    async fn fetch_rows(&self, file_id: &str, offset: usize, limit: usize) -> AppResult<RowPage> {
        let (_, rows) = self
            .files
            .iter()
            .find(|(descriptor, _)| descriptor.id == file_id)
            .ok_or_else(|| AppError::validation(format!("unknown file id '{file_id}'")))?;
        let limit = self.page_cap.map(|cap| cap.min(limit)).unwrap_or(limit);
        let end = offset.saturating_add(limit).min(rows.len());
        let page = rows.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        Ok(RowPage {
            has_more: end < rows.len(),
            rows: page,
        })
    }
}

/// Header-insensitive view over a raw row; blank cells read as missing.
struct FoldedRow {
    fields: BTreeMap<String, String>,
}

impl FoldedRow {
    fn new(raw: &RawSheetRow) -> Self {
        let fields = raw
            .iter()
            .map(|(key, value)| {
                (
                    key.trim().to_lowercase().replace('ё', "е"),
                    value.trim().to_string(),
                )
            })
            .collect();
        Self { fields }
    }

    fn get(&self, aliases: &[&str]) -> Option<String> {
        aliases
            .iter()
            .filter_map(|alias| self.fields.get(*alias))
            .find(|value| !value.is_empty())
            .cloned()
    }
}

/// Parses spreadsheet amounts such as `1 234,50` or `1234.5`.
pub fn parse_amount(value: &str) -> Option<f64> {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    cleaned.parse::<f64>().ok().filter(|amount| amount.is_finite())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn row(pairs: &[(&str, &str)]) -> RawSheetRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn validates_reference_schema() {
        let accepted = ReferenceRow::from_raw(&row(&[
            ("Наименование", "ООО Ромашка"),
            ("Город", "Казань"),
            ("Статус", "Действующее"),
        ]))
        .unwrap();
        assert_eq!(accepted.normalized_name, "ромашка");
        assert!(accepted.is_active());

        let nameless = ReferenceRow::from_raw(&row(&[("city", "Казань")]));
        assert!(matches!(nameless, Err(AppError::Validation(_))));

        let placeless = ReferenceRow::from_raw(&row(&[("name", "Nowhere Ltd")]));
        assert!(matches!(placeless, Err(AppError::Validation(_))));

        let liquidated = ReferenceRow::from_raw(&row(&[
            ("name", "Old Co"),
            ("region", "Татарстан"),
            ("status", "Ликвидировано"),
        ]))
        .unwrap();
        assert!(!liquidated.is_active());
    }

    #[test]
    fn parses_sales_amounts() {
        let sale = SalesRow::from_raw(&row(&[
            ("РМ", "Ivanov"),
            ("Бренд", "Acme"),
            ("Клиент", "Ромашка"),
            ("Адрес", "г. Казань"),
            ("Факт", "1 234,5"),
        ]))
        .unwrap();
        assert_eq!(sale.fact, 1234.5);
        assert!(SalesRow::from_raw(&row(&[("rm", "A"), ("brand", "B"), ("client", "C"), ("fact", "n/a")])).is_err());
    }

    #[tokio::test]
    async fn collects_rows_across_short_pages() {
        let rows = (0..7)
            .map(|i| {
                row(&[
                    ("rm", "Ivanov"),
                    ("brand", "Acme"),
                    ("client", &format!("Client {i}")),
                    ("fact", "10"),
                ])
            })
            .collect::<Vec<_>>();
        let mut with_bad = rows.clone();
        with_bad.push(row(&[("rm", "Ivanov")]));
        let store = InMemorySheetStore::new(Vec::new())
            .with_file(2024, "north.csv", with_bad)
            .with_file(2023, "old.csv", rows)
            .with_page_cap(3);

        let ingest = collect_sales_rows(&store, 2024, 100).await.unwrap();
        assert_eq!(ingest.files, 1);
        assert_eq!(ingest.rows.len(), 7);
        assert_eq!(ingest.rejected, 1);
    }

    #[tokio::test]
    async fn reads_csv_directory_layout() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(OKB_FILE_NAME),
            "name,city,region\nООО Вектор,Казань,Татарстан\n,Казань,\n",
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("2024")).unwrap();
        fs::write(
            dir.path().join("2024").join("sales.csv"),
            "rm,brand,client,address,fact\nIvanov,Acme,Ромашка,г. Казань,100\nIvanov,Acme,Лютик,,50\n",
        )
        .unwrap();

        let store = CsvSheetStore::new(dir.path());
        let reference = load_reference(&store).await.unwrap();
        assert_eq!(reference.rows.len(), 1);
        assert_eq!(reference.rejected, 1);

        let files = store.list_files_for_year(2024).await.unwrap();
        assert_eq!(files[0].id, "2024/sales.csv");
        let page = store.fetch_rows(&files[0].id, 0, 1).await.unwrap();
        assert_eq!(page.rows.len(), 1);
        assert!(page.has_more);

        assert!(store.fetch_rows("../okb.csv", 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn missing_reference_file_is_fatal() {
        let dir = tempdir().unwrap();
        let store = CsvSheetStore::new(dir.path());
        let err = load_reference(&store).await.unwrap_err();
        assert!(matches!(err, AppError::ReferenceLoad(_)));
    }
}
