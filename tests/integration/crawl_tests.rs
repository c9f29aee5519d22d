//! Integration tests for the crawler
//!
//! These tests use wiremock to create mock HTTP servers and drive full jobs
//! end-to-end: fetching, analysis, dives, retries, charsets, user agents and persistence
//! through the sink.

use botsbox::config::{FetchConfig, SinkConfig};
use botsbox::crawler::{Fetchers, Job, RunOutcome};
use botsbox::sink::Sink;
use botsbox::storage::{SqliteStore, Store};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetchers() -> Fetchers {
    Fetchers::from_config(&FetchConfig::default()).expect("Failed to build fetchers")
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_string(body.to_string())
        .insert_header("content-type", "text/html; charset=utf-8")
}

/// Creates a file-backed store in a fresh temporary directory
fn temp_store() -> (tempfile::TempDir, Arc<SqliteStore>) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = SqliteStore::new(&dir.path().join("botsbox.db")).expect("Failed to open store");
    (dir, Arc::new(store))
}

const SHELF: &str = r#"<html>
<head><title>Shelf</title></head>
<body>
  <ul>
    <li class="book"><a href="/book/1"><h2>Dune</h2></a><span class="year">1965</span></li>
    <li class="book"><a href="/book/2"><h2>Solaris</h2></a><span class="year">1961</span></li>
    <li class="book"><a href="/book/3"><h2>Ubik</h2></a><span class="year">1969</span></li>
  </ul>
</body>
</html>"#;

#[tokio::test]
async fn test_list_output_yields_one_record_per_match() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/shelf"))
        .respond_with(html(SHELF))
        .expect(1)
        .mount(&mock_server)
        .await;

    let rule = format!(
        r#"{{
            "$entries": [{{ "$name": "shelf", "$url": "{}/shelf" }}],
            "shelf": {{
                "$outputs": [{{
                    "$name": "book",
                    "$each": "li.book",
                    "$id": "$[a].$attr[href]",
                    "$data": {{ "title": "$[h2].$text", "year": "$[.year].$text" }}
                }}]
            }}
        }}"#,
        mock_server.uri()
    );

    let (_dir, store) = temp_store();
    let sink = Sink::open(store.clone(), &SinkConfig::default());
    let mut job = Job::from_content(1, "shelf", &rule, fetchers()).unwrap();
    job.connect_sink(sink.sender());

    assert_eq!(job.run().await, RunOutcome::Completed);
    drop(job);
    assert_eq!(sink.close().await, 3);

    let rows = store.query_all_data_objects("book").unwrap();
    assert_eq!(rows.len(), 3);

    let mut ids: Vec<&str> = rows.iter().map(|r| r.record_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["/book/1", "/book/2", "/book/3"]);

    let dune = rows.iter().find(|r| r.record_id == "/book/1").unwrap();
    let data: serde_json::Value = serde_json::from_str(&dune.data).unwrap();
    assert_eq!(data["title"], "Dune");
    assert_eq!(data["year"], "1965");
    assert_eq!(dune.url, format!("{}/shelf", mock_server.uri()));
}

#[tokio::test]
async fn test_global_timeout_ends_run() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(html(SHELF).set_delay(Duration::from_secs(3)))
        .mount(&mock_server)
        .await;

    let rule = format!(
        r#"{{
            "$timeout": "1s",
            "$entries": [{{ "$name": "p", "$url": "{}/slow" }}],
            "p": {{}}
        }}"#,
        mock_server.uri()
    );
    let job = Job::from_content(1, "slow", &rule, fetchers()).unwrap();

    let started = Instant::now();
    assert_eq!(job.run().await, RunOutcome::TimedOut);
    assert!(started.elapsed() < Duration::from_millis(2500));
    assert_eq!(job.crawled_targets_count(), 0);
}

#[tokio::test]
async fn test_failing_target_is_attempted_retry_plus_one_times() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&mock_server)
        .await;

    let rule = format!(
        r#"{{
            "$entries": [{{ "$name": "p", "$url": "{}/broken" }}],
            "p": {{ "$retry": 2, "$retryWait": "1s" }}
        }}"#,
        mock_server.uri()
    );
    let job = Job::from_content(1, "broken", &rule, fetchers()).unwrap();

    assert_eq!(job.run().await, RunOutcome::Completed);
    assert_eq!(job.crawled_targets_count(), 0);
    // expect(3) is verified when the mock server drops
}

#[tokio::test]
async fn test_dives_and_file_outputs() {
    let mock_server = MockServer::start().await;
    let base = mock_server.uri();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(
            r#"<html><body>
                <a class="item" href="/api/item/1">one</a>
                <a class="item" href="/api/item/2">two</a>
            </body></html>"#,
        ))
        .mount(&mock_server)
        .await;
    for n in 1..=2 {
        Mock::given(method("GET"))
            .and(path(format!("/api/item/{}", n)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!(
                        r#"{{ "item": {{ "id": {n}, "name": "Item {n}", "image": "/img/{n}.png" }} }}"#
                    ))
                    .insert_header("content-type", "application/json"),
            )
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/img/{}.png", n)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0x89, b'P', b'N', b'G', n as u8])
                    .insert_header("content-type", "image/png"),
            )
            .expect(1)
            .mount(&mock_server)
            .await;
    }

    let rule = format!(
        r#"{{
            "$entries": [{{ "$name": "index", "$url": "{base}/" }}],
            "index": {{
                "$dive": {{ "a.item": {{ "$name": "item", "$url": "$attr[href]", "$contentType": "json" }} }}
            }},
            "item": {{
                "$outputs": [{{
                    "$name": "item",
                    "$id": "$[item.id]",
                    "$data": {{ "name": "$[item.name]", "cover.png": "$[item.image]" }}
                }}]
            }}
        }}"#
    );

    let (dir, store) = temp_store();
    let files_dir = dir.path().join("files");
    let sink = Sink::open(
        store.clone(),
        &SinkConfig {
            buffer: 16,
            files_dir: Some(files_dir.to_string_lossy().into_owned()),
        },
    );
    let mut job = Job::from_content(1, "items", &rule, fetchers()).unwrap();
    job.connect_sink(sink.sender());

    assert_eq!(job.run().await, RunOutcome::Completed);
    assert_eq!(job.crawled_targets_count(), 5);
    drop(job);
    assert_eq!(sink.close().await, 4);

    let items = store.query_all_data_objects("item").unwrap();
    let records: Vec<_> = items.iter().filter(|r| r.file_path.is_none()).collect();
    let files: Vec<_> = items.iter().filter(|r| r.file_path.is_some()).collect();
    assert_eq!(records.len(), 2);
    assert_eq!(files.len(), 2);

    let first = records.iter().find(|r| r.record_id == "1").unwrap();
    let data: serde_json::Value = serde_json::from_str(&first.data).unwrap();
    assert_eq!(data["name"], "Item 1");
    assert_eq!(data["cover.png"], format!("{}/img/1.png", base));

    let image = files
        .iter()
        .find(|r| r.record_id == format!("{}/img/1.png", base))
        .unwrap();
    let path = image.file_path.as_ref().unwrap();
    assert!(path.ends_with(".png"));
    assert_eq!(std::fs::read(path).unwrap(), vec![0x89, b'P', b'N', b'G', 1]);
}

#[tokio::test]
async fn test_unchanged_page_is_not_stored_twice() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/shelf"))
        .respond_with(html(SHELF))
        .expect(2)
        .mount(&mock_server)
        .await;

    let rule = format!(
        r#"{{
            "$entries": [{{ "$name": "shelf", "$url": "{}/shelf" }}],
            "shelf": {{
                "$mtag": "$title",
                "$outputs": [{{ "$name": "book", "$each": "li.book", "$data": {{ "title": "$[h2].$text" }} }}]
            }}
        }}"#,
        mock_server.uri()
    );

    let (_dir, store) = temp_store();
    let sink = Sink::open(store.clone(), &SinkConfig::default());
    let mut job = Job::from_content(1, "shelf", &rule, fetchers())
        .unwrap()
        .with_store(store.clone());
    job.connect_sink(sink.sender());

    assert_eq!(job.run().await, RunOutcome::Completed);
    assert_eq!(job.run().await, RunOutcome::Completed);
    drop(job);
    assert_eq!(sink.close().await, 3);
    assert_eq!(store.query_all_data_objects("book").unwrap().len(), 3);
}

#[tokio::test]
async fn test_cookies_carry_over_to_dived_targets() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(
            html(r#"<html><body><a href="/private">in</a></body></html>"#)
                .insert_header("set-cookie", "session=abc; Path=/"),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/private"))
        .and(header("cookie", "session=abc"))
        .respond_with(html("<html><body>secret</body></html>"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let rule = format!(
        r#"{{
            "$entries": [{{ "$name": "login", "$url": "{}/login" }}],
            "login": {{ "$dive": {{ "a": {{ "$name": "private", "$url": "$attr[href]" }} }} }},
            "private": {{ "$retry": 0 }}
        }}"#,
        mock_server.uri()
    );
    let job = Job::from_content(1, "cookies", &rule, fetchers()).unwrap();

    assert_eq!(job.run().await, RunOutcome::Completed);
    assert_eq!(job.crawled_targets_count(), 2);
}

#[tokio::test]
async fn test_var_fan_out_posts_each_value() {
    let mock_server = MockServer::start().await;
    for word in ["rust", "go"] {
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_string_contains(format!("q={}", word)))
            .respond_with(html("<html><body>ok</body></html>"))
            .expect(1)
            .mount(&mock_server)
            .await;
    }

    let rule = format!(
        r#"{{
            "$entries": [{{
                "$name": "search",
                "$url": "{}/search",
                "$method": "post",
                "$form": {{ "q": "$var[word]" }},
                "$var": {{ "word": "$[rust, go]" }}
            }}],
            "search": {{}}
        }}"#,
        mock_server.uri()
    );
    let job = Job::from_content(1, "search", &rule, fetchers()).unwrap();

    assert_eq!(job.run().await, RunOutcome::Completed);
    assert_eq!(job.crawled_targets_count(), 2);
}

#[tokio::test]
async fn test_latin1_page_is_decoded_by_declared_charset() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/menu"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"<html><head><title>Caf\xE9 cr\xE8me</title></head></html>".to_vec())
                .insert_header("content-type", "text/html; charset=iso-8859-1"),
        )
        .mount(&mock_server)
        .await;

    let rule = format!(
        r#"{{
            "$entries": [{{ "$name": "menu", "$url": "{}/menu" }}],
            "menu": {{ "$outputs": [{{ "$name": "menu", "$data": {{ "t": "$title" }} }}] }}
        }}"#,
        mock_server.uri()
    );

    let (_dir, store) = temp_store();
    let sink = Sink::open(store.clone(), &SinkConfig::default());
    let mut job = Job::from_content(1, "menu", &rule, fetchers()).unwrap();
    job.connect_sink(sink.sender());

    assert_eq!(job.run().await, RunOutcome::Completed);
    drop(job);
    assert_eq!(sink.close().await, 1);

    let rows = store.query_all_data_objects("menu").unwrap();
    let data: serde_json::Value = serde_json::from_str(&rows[0].data).unwrap();
    assert_eq!(data["t"], "Caf\u{e9} cr\u{e8}me");
}

#[tokio::test]
async fn test_job_presents_agent_from_configured_pool() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .and(header("user-agent", "PoolAgent/1.0"))
        .respond_with(html("<html><body>hi</body></html>"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = FetchConfig {
        user_agents: vec!["PoolAgent/1.0".to_string()],
        ..FetchConfig::default()
    };
    let fetchers = Fetchers::from_config(&config).expect("Failed to build fetchers");
    let rule = format!(
        r#"{{ "$entries": [{{ "$name": "p", "$url": "{}/" }}], "p": {{ "$retry": 0 }} }}"#,
        mock_server.uri()
    );
    let job = Job::from_content(1, "agent", &rule, fetchers).unwrap();

    assert_eq!(job.user_agent(), Some("PoolAgent/1.0"));
    assert_eq!(job.run().await, RunOutcome::Completed);
    assert_eq!(job.crawled_targets_count(), 1);
}
