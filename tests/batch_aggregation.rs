use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use tempfile::tempdir;

use address_growth_lib::aggregation::Geography;
use address_growth_lib::batch::BatchRunner;
use address_growth_lib::cache::ResolutionCache;
use address_growth_lib::config::AppConfig;
use address_growth_lib::gazetteer::Gazetteer;
use address_growth_lib::pipeline::ResolutionPipeline;
use address_growth_lib::resolver::AddressResolver;
use address_growth_lib::sheets::{CsvSheetStore, InMemorySheetStore, RawSheetRow};
use address_growth_lib::AppError;

const OKB: &str = "\
Наименование,Город,Регион,Юридический адрес,Статус,Потенциал
ООО Ромашка,Казань,Татарстан,\"420111, г. Казань, ул. Баумана 1\",действующая,
Тюльпан,Казань,Татарстан,\"420021, г. Казань, ул. Тукая 3\",действующая,400
Астра,Самара,Самарская область,\"443001, г. Самара, ул. Ленина 2\",,250
Лилия,Казань,Татарстан,,ликвидирована,900
";

const SALES: &str = "\
РМ,Бренд,Клиент,Адрес,Факт
Иванов,Acme,ООО Ромашка,\"г. Казань, ул. Баумана, д. 1\",100
Иванов,Acme,Лютик,\"г. Казань; ул. Пушкина; д. 7\",\"50,5\"
Иванов,Acme,Вишня,кхъгрзщ впрлмн,25
Иванов,Beta,Ромашка,\"443001, Самара\",10
Петров,Acme,Гвоздика,,5
Петров,Acme,,г. Казань,999
";

fn offline_resolver() -> AddressResolver {
    let config = AppConfig::default();
    let pipeline = ResolutionPipeline::new(Gazetteer::default(), None, config.fuzzy_similarity_floor);
    AddressResolver::new(
        Arc::new(pipeline),
        ResolutionCache::new(config.cache_freshness()),
    )
}

#[tokio::test]
async fn batch_conserves_fact_per_rm() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("okb.csv"), OKB).unwrap();
    fs::create_dir_all(dir.path().join("2024")).unwrap();
    fs::write(dir.path().join("2024").join("sales.csv"), SALES).unwrap();

    let config = AppConfig {
        sheet_page_size: 2,
        resolver_concurrency: 3,
        ..AppConfig::default()
    };
    let runner = BatchRunner::new(
        offline_resolver(),
        Arc::new(CsvSheetStore::new(dir.path())),
        &config,
    );
    let report = runner.run(2024).await.unwrap();

    assert_eq!(report.reference_rows, 4);
    assert_eq!(report.sales_rows, 5);
    assert_eq!(report.sales_rejected, 1);

    let mut per_rm: BTreeMap<&str, f64> = BTreeMap::new();
    for row in &report.summaries {
        *per_rm.entry(row.rm()).or_default() += row.fact();
        assert!(row.growth_potential() >= 0.0);
    }
    assert_eq!(per_rm["Иванов"], 185.5);
    assert_eq!(per_rm["Петров"], 5.0);

    let kazan = report
        .summaries
        .iter()
        .find(|row| row.rm() == "Иванов" && row.brand() == "Acme" && row.geography().name() == Some("казань"))
        .unwrap();
    assert_eq!(kazan.fact(), 150.5);
    assert_eq!(kazan.client_count(), 2);
    let untapped: Vec<&str> = kazan
        .potential_clients()
        .iter()
        .map(|client| client.name.as_str())
        .collect();
    assert_eq!(untapped, vec!["Тюльпан"]);
    assert_eq!(kazan.growth_potential(), 400.0);

    let unknown = report
        .summaries
        .iter()
        .find(|row| row.rm() == "Иванов" && *row.geography() == Geography::Unknown)
        .unwrap();
    assert_eq!(unknown.fact(), 25.0);

    // Highest opportunity first.
    assert_eq!(report.summaries[0].rm(), "Иванов");
    assert_eq!(report.summaries[0].growth_potential(), 400.0);
}

#[tokio::test]
async fn missing_reference_yields_no_output() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("2024")).unwrap();
    fs::write(dir.path().join("2024").join("sales.csv"), SALES).unwrap();

    let runner = BatchRunner::new(
        offline_resolver(),
        Arc::new(CsvSheetStore::new(dir.path())),
        &AppConfig::default(),
    );
    let err = runner.run(2024).await.unwrap_err();
    assert!(matches!(err, AppError::ReferenceLoad(_)));
}

#[tokio::test]
async fn short_pages_do_not_lose_rows() {
    let reference: Vec<RawSheetRow> = vec![[("name", "Тюльпан"), ("city", "Казань")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()];
    let sales: Vec<RawSheetRow> = (0..9)
        .map(|i| {
            [
                ("rm", "Иванов".to_string()),
                ("brand", "Acme".to_string()),
                ("client", format!("Клиент {i}")),
                ("address", "г. Казань".to_string()),
                ("fact", "10".to_string()),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
        })
        .collect();
    let store = InMemorySheetStore::new(reference)
        .with_file(2025, "q1.csv", sales)
        .with_page_cap(2);

    let runner = BatchRunner::new(offline_resolver(), Arc::new(store), &AppConfig::default());
    let report = runner.run(2025).await.unwrap();

    let total: f64 = report.summaries.iter().map(|row| row.fact()).sum();
    assert_eq!(report.sales_rows, 9);
    assert_eq!(total, 90.0);
    assert_eq!(report.summaries.len(), 1);
    assert_eq!(report.summaries[0].client_count(), 9);
}
