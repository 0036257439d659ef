use std::collections::BTreeMap;

use harrow_core::{
    AppError, AttemptConfig, FieldConfig, FieldValue, Harvester, PoolConfig, Source, SourceRouter,
};

use crate::integration::common::{ScriptedBackend, fields, hosts, page, scraper};

const PRODUCT_PAGE: &str = r#"
    <html><body>
      <h1 class="name">Walnut Desk</h1>
      <p class="price">EUR 349.00</p>
      <img class="photo" src="/img/desk-1.jpg">
      <img class="photo" src="/img/desk-2.jpg">
    </body></html>
"#;

fn product_fields() -> BTreeMap<String, FieldConfig> {
    fields(&[
        ("name", "h1.name::text".into()),
        (
            "price",
            vec![
                AttemptConfig::new("span.sale::text").with_pattern(r"([\d.]+)"),
                AttemptConfig::new("p.price::text").with_pattern(r"([\d.]+)"),
            ]
            .into(),
        ),
        ("photos", AttemptConfig::new("img.photo::attr(src)").joined().into()),
    ])
}

fn list(values: &[&str]) -> FieldValue {
    FieldValue::List(values.iter().map(|s| s.to_string()).collect())
}

#[tokio::test]
async fn blocked_direct_host_is_rotated_out() {
    let backend = ScriptedBackend::new(|request| match request.proxy {
        None => Ok(page(request, 503, "blocked")),
        Some(_) => Ok(page(request, 200, PRODUCT_PAGE)),
    });
    let registry = hosts(&["10.0.0.1:3128"]);
    let source = Source::html(
        "shop",
        &["shop\\.example\\.com/p/".to_string()],
        scraper(backend.clone(), registry.clone()),
        &product_fields(),
    )
    .unwrap();
    let harvester = Harvester::new(
        SourceRouter::new().with(source).unwrap(),
        PoolConfig::sequential(),
    )
    .unwrap();

    let urls: Vec<String> = (1..=3)
        .map(|i| format!("https://shop.example.com/p/{i}"))
        .collect();
    let reports = harvester.scrape_many(urls.clone()).await.unwrap();

    assert_eq!(reports.len(), 3);
    for (report, url) in reports.iter().zip(&urls) {
        assert_eq!(&report.url, url);
        assert!(report.is_ok(), "{report:?}");
        assert_eq!(report.fields["name"], list(&["Walnut Desk"]));
        assert_eq!(report.fields["price"], list(&["349.00"]));
        assert_eq!(
            report.fields["photos"],
            FieldValue::Joined("/img/desk-1.jpg /img/desk-2.jpg".into())
        );
    }

    // One failed direct attempt, then everything goes through the proxy.
    let requests = backend.requests();
    assert_eq!(requests.len(), 4);
    assert!(requests[0].proxy.is_none());
    assert!(
        requests[1..]
            .iter()
            .all(|r| r.proxy.as_deref() == Some("http://10.0.0.1:3128"))
    );
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.current().use_count, 3);
}

#[tokio::test]
async fn endpoint_outranks_catch_all_and_extracts_json() {
    let backend = ScriptedBackend::new(|request| {
        if request.url.ends_with("/v2/items/42") {
            Ok(page(
                request,
                200,
                r#"{"item": {"id": 42, "title": "Lamp", "tags": ["home", "light"]}}"#,
            ))
        } else {
            Ok(page(request, 200, "<html><h1>Generic</h1></html>"))
        }
    });
    let registry = hosts(&[]);

    let catch_all = Source::html(
        "any",
        &["*".to_string()],
        scraper(backend.clone(), registry.clone()),
        &fields(&[("heading", "h1::text".into())]),
    )
    .unwrap();
    let items = Source::endpoint(
        "items",
        "https://api.example.com/v2/items/{id}",
        scraper(backend.clone(), registry.clone()),
        &fields(&[
            ("id", "item&&id".into()),
            ("title", "item&&title".into()),
            ("tags", AttemptConfig::new("item&&tags").joined().into()),
        ]),
    )
    .unwrap();
    let harvester = Harvester::new(
        SourceRouter::new().with(catch_all).unwrap().with(items).unwrap(),
        PoolConfig::sequential(),
    )
    .unwrap();

    let params: BTreeMap<String, String> = [("id".to_string(), "42".to_string())].into();
    let called = harvester.call_endpoint("items", &params).await.unwrap();
    assert_eq!(called["id"], list(&["42"]));
    assert_eq!(called["title"], list(&["Lamp"]));
    assert_eq!(called["tags"], FieldValue::Joined("home light".into()));

    let routed = harvester
        .scrape("https://API.example.com/v2/items/42")
        .await
        .unwrap();
    assert_eq!(routed, called);

    let generic = harvester.scrape("https://blog.example.org/").await.unwrap();
    assert_eq!(generic["heading"], list(&["Generic"]));
}

#[tokio::test]
async fn batch_isolates_failures_across_workers() {
    let backend = ScriptedBackend::new(|request| {
        if request.url.contains("missing") {
            Ok(page(request, 404, ""))
        } else if request.url.contains("guarded") {
            Ok(page(request, 200, "<div id=\"cf-challenge\"></div>"))
        } else if request.url.contains("flaky") {
            Err(AppError::Transport("connection reset by peer".into()))
        } else {
            Ok(page(request, 200, PRODUCT_PAGE))
        }
    });
    let registry = hosts(&["10.0.0.1:3128", "10.0.0.2:3128"]);
    let source = Source::html(
        "shop",
        &["shop\\.example\\.com".to_string()],
        scraper(backend.clone(), registry),
        &product_fields(),
    )
    .unwrap();
    let harvester = Harvester::new(
        SourceRouter::new().with(source).unwrap(),
        PoolConfig::default().with_workers(3),
    )
    .unwrap();

    let urls: Vec<String> = [
        "https://shop.example.com/p/1",
        "https://shop.example.com/missing",
        "https://elsewhere.example.net/p/2",
        "https://shop.example.com/guarded",
        "https://shop.example.com/flaky",
        "https://shop.example.com/p/3",
    ]
    .iter()
    .map(|u| u.to_string())
    .collect();

    let reports = harvester.scrape_many(urls.clone()).await.unwrap();

    let got: Vec<&str> = reports.iter().map(|r| r.url.as_str()).collect();
    let want: Vec<&str> = urls.iter().map(String::as_str).collect();
    assert_eq!(got, want);

    let errors: Vec<Option<&str>> = reports.iter().map(|r| r.error.as_deref()).collect();
    assert!(errors[0].is_none());
    assert!(errors[1].unwrap().starts_with("Nothing found at"));
    assert!(errors[2].unwrap().starts_with("No source configured"));
    assert!(errors[3].unwrap().starts_with("Captcha hit"));
    assert!(errors[4].unwrap().starts_with("Scrape failed"));
    assert!(errors[5].is_none());
    assert_eq!(reports[5].fields["name"], list(&["Walnut Desk"]));

    // The flaky URL spent its whole budget of 4 transport units.
    let flaky_attempts = backend
        .requests()
        .iter()
        .filter(|r| r.url.contains("flaky"))
        .count();
    assert_eq!(flaky_attempts, 4);
}
