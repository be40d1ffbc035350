//! Client behaviour against a mock datatables API
//!
//! Covers pagination, retries, error classification, cancellation and streaming.

use chrono::NaiveDate;
use ndl_ingest::client::{ClientConfig, FetchError, NdlClient, Page, Params};
use ndl_ingest::models::{DailyPriceRecord, DAILY_TABLE, FUNDAMENTALS_TABLE};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path, query_param, query_param_is_missing},
    Mock, MockServer, ResponseTemplate,
};

const DAILY_PATH: &str = "/SHARADAR/DAILY.json";

fn config(server: &MockServer) -> ClientConfig {
    ClientConfig::new("test-key")
        .with_base_url(server.uri())
        .with_requests_per_second(1000)
        .with_backoff_base(Duration::from_millis(1))
}

fn client(server: &MockServer) -> NdlClient {
    NdlClient::new(config(server)).expect("client")
}

/// A DAILY page with `rows` rows for `ticker` and an optional next cursor
fn daily_page(ticker: &str, rows: usize, cursor: Option<&str>) -> Value {
    let data: Vec<Value> = (0..rows)
        .map(|i| {
            let day = NaiveDate::from_ymd_opt(2020, 1, 1).expect("date")
                + chrono::Duration::days(i as i64);
            json!([ticker, day.format("%Y-%m-%d").to_string(), 100.25])
        })
        .collect();

    json!({
        "datatable": {
            "data": data,
            "columns": [
                {"name": "ticker", "type": "String"},
                {"name": "date", "type": "Date"},
                {"name": "close", "type": "BigDecimal(34,12)"}
            ]
        },
        "meta": {"next_cursor_id": cursor}
    })
}

fn ticker_params(tickers: &str) -> Params {
    let mut params = Params::new();
    params.insert("ticker".to_string(), tickers.to_string());
    params
}

async fn collect_pages(
    mut rx: tokio::sync::mpsc::Receiver<Result<Page, FetchError>>,
) -> (Vec<Page>, Vec<FetchError>) {
    let mut pages = Vec::new();
    let mut errors = Vec::new();
    while let Some(item) = rx.recv().await {
        match item {
            Ok(page) => pages.push(page),
            Err(e) => errors.push(e),
        }
    }
    (pages, errors)
}

// ============================================================================
// Pagination
// ============================================================================

#[tokio::test]
async fn test_fetch_all_follows_cursor() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(DAILY_PATH))
        .and(query_param("api_key", "test-key"))
        .and(query_param_is_missing("qopts.cursor_id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(daily_page("AAPL", 1000, Some("abc"))))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(DAILY_PATH))
        .and(query_param("qopts.cursor_id", "abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(daily_page("AAPL", 500, Some(""))))
        .expect(1)
        .mount(&server)
        .await;

    let table = client(&server)
        .fetch_all(DAILY_TABLE, &ticker_params("AAPL"))
        .await
        .expect("fetch");

    assert_eq!(table.len(), 1500);
    assert_eq!(table.columns.len(), 3);
    assert_eq!(table.columns[0].name, "ticker");
}

#[tokio::test]
async fn test_fetch_all_single_page_without_meta() {
    let server = MockServer::start().await;

    let mut body = daily_page("MSFT", 3, None);
    body.as_object_mut().expect("object").remove("meta");

    Mock::given(method("GET"))
        .and(path(DAILY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(&server)
        .await;

    let table = client(&server)
        .fetch_all(DAILY_TABLE, &Params::new())
        .await
        .expect("fetch");
    assert_eq!(table.len(), 3);
}

#[tokio::test]
async fn test_incremental_filter_is_sent() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/SHARADAR/SF1.json"))
        .and(query_param("lastupdated.gte", "1970-01-01"))
        .and(query_param("dimension", "ARQ"))
        .and(query_param("ticker", "AAPL,MSFT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "datatable": {
                "data": [["AAPL", "ARQ", "2024-01-02", 1.5]],
                "columns": [
                    {"name": "ticker", "type": "String"},
                    {"name": "dimension", "type": "String"},
                    {"name": "datekey", "type": "Date"},
                    {"name": "pe", "type": "BigDecimal(34,12)"}
                ]
            },
            "meta": {"next_cursor_id": null}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let since = NaiveDate::from_ymd_opt(1970, 1, 1);
    let rows = client(&server)
        .fetch_fundamentals(&["AAPL".to_string(), "MSFT".to_string()], "ARQ", since)
        .await
        .expect("fetch");

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].report_period, rows[0].date_key);
    assert_eq!(FUNDAMENTALS_TABLE, "SHARADAR/SF1");
}

// ============================================================================
// Retries and error classification
// ============================================================================

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(DAILY_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream hiccup"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(DAILY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(daily_page("AAPL", 2, None)))
        .expect(1)
        .mount(&server)
        .await;

    let table = client(&server)
        .fetch_all(DAILY_TABLE, &Params::new())
        .await
        .expect("fetch after retry");
    assert_eq!(table.len(), 2);
}

#[tokio::test]
async fn test_rate_limited_response_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(DAILY_PATH))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(DAILY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(daily_page("AAPL", 1, None)))
        .expect(1)
        .mount(&server)
        .await;

    let table = client(&server)
        .fetch_all(DAILY_TABLE, &Params::new())
        .await
        .expect("third attempt succeeds");
    assert_eq!(table.len(), 1);
}

#[tokio::test]
async fn test_retries_exhausted_after_three_attempts() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(DAILY_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(3)
        .mount(&server)
        .await;

    let err = client(&server)
        .fetch_all(DAILY_TABLE, &Params::new())
        .await
        .expect_err("should give up");

    match err {
        FetchError::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 3);
            assert!(matches!(
                *last,
                FetchError::Http { status: 503, ref body, .. } if body == "maintenance"
            ));
        },
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_decode_error_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(DAILY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>not json</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server)
        .fetch_all(DAILY_TABLE, &Params::new())
        .await
        .expect_err("decode failure");
    assert!(matches!(err, FetchError::Decode { .. }));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancelled_client_sends_nothing() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(daily_page("AAPL", 1, None)))
        .expect(0)
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let client = NdlClient::with_cancellation(config(&server), cancel.clone()).expect("client");
    cancel.cancel();

    let err = client
        .fetch_all(DAILY_TABLE, &Params::new())
        .await
        .expect_err("cancelled");
    assert!(matches!(err, FetchError::Cancelled));
}

#[tokio::test]
async fn test_cancel_interrupts_backoff() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(DAILY_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let client = NdlClient::with_cancellation(
        config(&server).with_backoff_base(Duration::from_secs(30)),
        cancel.clone(),
    )
    .expect("client");

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client.fetch_all(DAILY_TABLE, &Params::new()),
    )
    .await
    .expect("cancellation should cut the 60s backoff short");

    assert!(matches!(result, Err(FetchError::Cancelled)));
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn test_stream_splits_tickers_into_chains() {
    let server = MockServer::start().await;

    // Group "A,B" spans two pages
    Mock::given(method("GET"))
        .and(path(DAILY_PATH))
        .and(query_param("ticker", "A,B"))
        .and(query_param_is_missing("qopts.cursor_id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(daily_page("A", 4, Some("next-ab"))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(DAILY_PATH))
        .and(query_param("ticker", "A,B"))
        .and(query_param("qopts.cursor_id", "next-ab"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "datatable": {"data": [["B", "2020-01-01", 1.0]], "columns": []},
            "meta": {"next_cursor_id": null}
        })))
        .expect(1)
        .mount(&server)
        .await;

    for (group, rows) in [("C,D", 3usize), ("E", 2usize)] {
        Mock::given(method("GET"))
            .and(path(DAILY_PATH))
            .and(query_param("ticker", group))
            .respond_with(ResponseTemplate::new(200).set_body_json(daily_page(group, rows, None)))
            .expect(1)
            .mount(&server)
            .await;
    }

    let client = NdlClient::new(config(&server).with_tickers_per_request(2)).expect("client");
    let rx = client.fetch_stream(DAILY_TABLE, &ticker_params("A,B,C,D,E"), 2);
    let (pages, errors) = collect_pages(rx).await;

    assert!(errors.is_empty());
    assert_eq!(pages.len(), 4);
    assert_eq!(pages.iter().map(|p| p.rows.len()).sum::<usize>(), 4 + 1 + 3 + 2);
    // Second page of the A,B chain reuses the first page's columns
    assert!(pages.iter().all(|p| p.columns.len() == 3));
}

#[tokio::test]
async fn test_stream_stops_starting_chains_after_failure() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(DAILY_PATH))
        .and(query_param("ticker", "A,B"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such table"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(DAILY_PATH))
        .and(query_param("ticker", "C,D"))
        .respond_with(ResponseTemplate::new(200).set_body_json(daily_page("C", 1, None)))
        .expect(0)
        .mount(&server)
        .await;

    let client = NdlClient::new(
        config(&server)
            .with_tickers_per_request(2)
            .with_max_attempts(1),
    )
    .expect("client");
    let rx = client.fetch_stream(DAILY_TABLE, &ticker_params("A,B,C,D"), 1);
    let (pages, errors) = collect_pages(rx).await;

    assert!(pages.is_empty());
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        FetchError::RetriesExhausted { last, .. } => {
            assert!(matches!(**last, FetchError::Http { status: 404, .. }));
        },
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_stream_rows_parses_pages() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(DAILY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(daily_page("AAPL", 5, None)))
        .expect(1)
        .mount(&server)
        .await;

    let mut rx = client(&server).stream_rows::<DailyPriceRecord>(DAILY_TABLE, &Params::new(), 3);

    let mut total = 0;
    while let Some(batch) = rx.recv().await {
        let batch = batch.expect("batch");
        assert!(batch.iter().all(|r| r.ticker == "AAPL" && r.close.is_some()));
        total += batch.len();
    }
    assert_eq!(total, 5);
}
