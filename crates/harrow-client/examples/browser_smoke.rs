/// Smoke-test for `BrowserBackend`.
///
/// Launches a headless Chromium, scrapes <https://example.com> through the
/// retrying scraper, and checks the extracted `<h1>`.
///
/// Run with:
///   cargo run -p harrow-client --example browser_smoke --features browser
use std::collections::BTreeMap;
use std::sync::Arc;

use harrow_client::{BrowserBackend, BrowserSettings};
use harrow_core::{FieldConfig, FieldSet, FieldValue, HostRegistry, Scraper, ScraperConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("Launching headless browser…");
    let backend = BrowserBackend::launch(BrowserSettings::default()).await?;
    let scraper = Scraper::new(
        backend.clone(),
        Arc::new(HostRegistry::direct()),
        ScraperConfig {
            wait_for: Some("h1".into()),
            timeout: 30.0,
            ..Default::default()
        },
    );

    let url = "https://example.com";
    println!("Fetching {url} …");
    let response = scraper.get(url).await?;

    let fields: BTreeMap<String, FieldConfig> =
        [("heading".to_string(), FieldConfig::from("h1::text"))].into();
    let extracted = FieldSet::html(&fields)?.extract(&response);

    assert_eq!(
        extracted["heading"],
        FieldValue::List(vec!["Example Domain".into()]),
        "Expected <h1> not found in rendered HTML"
    );
    println!(
        "OK: status {} and {} bytes of rendered HTML",
        response.status(),
        response.body().len()
    );

    backend.close().await;
    Ok(())
}
