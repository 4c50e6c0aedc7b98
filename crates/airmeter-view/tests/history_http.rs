use airmeter_core::{Cursor, PublisherId, Reading};
use airmeter_view::{live, FetchError, HistoryFetcher, HttpReadingSource, ReadingSource, Store};
use axum::{
    extract::{Query, State},
    http::{header::ACCEPT, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use url::Url;

#[derive(Deserialize)]
struct ReadingsQuery {
    pub_id: u64,
    before: u64,
    limit: u16,
}

struct Archive {
    readings: Vec<Reading>,
    requests: AtomicUsize,
}

fn reading(pub_id: u64, read_time: u64) -> Reading {
    Reading {
        pub_id: PublisherId(pub_id),
        eco2: 430.0,
        evtoc: 6.0,
        read_time,
        start_time: 0,
        increment: "5m".to_string(),
    }
}

/// Mirrors the relay API: newest `limit` readings before `before`, returned
/// oldest first.
async fn readings(
    State(archive): State<Arc<Archive>>,
    headers: HeaderMap,
    Query(query): Query<ReadingsQuery>,
) -> Response {
    archive.requests.fetch_add(1, Ordering::SeqCst);
    if headers.get(ACCEPT).and_then(|v| v.to_str().ok()) != Some("application/json") {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }
    if query.pub_id == 500 {
        return (StatusCode::INTERNAL_SERVER_ERROR, "database unavailable").into_response();
    }
    let mut page: Vec<Reading> = archive
        .readings
        .iter()
        .filter(|r| r.pub_id.0 == query.pub_id && r.read_time < query.before)
        .rev()
        .take(usize::from(query.limit))
        .cloned()
        .collect();
    page.reverse();
    Json(page).into_response()
}

async fn spawn_api(times: &[u64]) -> (SocketAddr, Arc<Archive>) {
    let archive = Arc::new(Archive {
        readings: times.iter().map(|t| reading(42, *t)).collect(),
        requests: AtomicUsize::new(0),
    });
    let app = Router::new()
        .route("/api/sensors/readings", get(readings))
        .route("/api/garbage/sensors/readings", get(|| async { "not json" }))
        .with_state(Arc::clone(&archive));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, archive)
}

fn api_base(addr: SocketAddr, path: &str) -> Url {
    Url::parse(&format!("http://{addr}{path}")).expect("api url")
}

#[tokio::test]
async fn pages_walk_back_through_http_api() {
    let (addr, archive) = spawn_api(&[100, 200, 300, 400, 500, 600, 700]).await;
    let store = Arc::new(Store::new());
    live::apply_reading(
        &store,
        r#"{"pub_id":42,"eco2":400,"evtoc":1,"read_time":1000,"start_time":0,"increment":"5m"}"#,
    )
    .expect("live reading");
    let fetcher = HistoryFetcher::from_api(Arc::clone(&store), Some(&api_base(addr, "/api")))
        .expect("fetcher");
    let publisher = PublisherId(42);

    let page = fetcher.fetch_page(publisher, 3).await.expect("first page");
    let times: Vec<u64> = page.readings.iter().map(|r| r.read_time).collect();
    assert_eq!(times, vec![500, 600, 700]);
    assert_eq!(page.cursor, Cursor::page(publisher, 1000, 3));
    assert_eq!(store.earliest().get(&publisher), Some(500));

    let again = fetcher.fetch_page(publisher, 3).await.expect("second page");
    assert_eq!(again.cursor, Cursor::page(publisher, 500, 3));

    let rest = fetcher
        .fetch_earlier(publisher, 3, 5)
        .await
        .expect("remaining pages");
    let sizes: Vec<usize> = rest.iter().map(|p| p.readings.len()).collect();
    assert_eq!(sizes, vec![1]);
    assert_eq!(store.earliest().get(&publisher), Some(100));
    assert_eq!(archive.requests.load(Ordering::SeqCst), 3);

    let timeline: Vec<u64> = store
        .snapshot(publisher)
        .timeline()
        .iter()
        .map(|r| r.read_time)
        .collect();
    assert_eq!(timeline, vec![100, 200, 300, 400, 500, 600, 700, 1000]);
}

#[tokio::test]
async fn base_without_trailing_slash_keeps_its_path() {
    let source = HttpReadingSource::new(
        &Url::parse("http://127.0.0.1:9/api").expect("url"),
    )
    .expect("source");
    assert_eq!(
        source.endpoint().as_str(),
        "http://127.0.0.1:9/api/sensors/readings"
    );
}

#[tokio::test]
async fn server_error_surfaces_status_and_body() {
    let (addr, _archive) = spawn_api(&[]).await;
    let source = HttpReadingSource::new(&api_base(addr, "/api/")).expect("source");
    let err = source
        .readings_before(PublisherId(500), 1000, 10)
        .await
        .unwrap_err();
    match err {
        FetchError::Status { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "database unavailable");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn non_json_body_is_a_decode_error() {
    let (addr, _archive) = spawn_api(&[]).await;
    let store = Arc::new(Store::new());
    store.earliest().set(&PublisherId(42), Some(1000));
    let fetcher =
        HistoryFetcher::from_api(Arc::clone(&store), Some(&api_base(addr, "/api/garbage/")))
            .expect("fetcher");

    let err = fetcher.fetch_page(PublisherId(42), 5).await.unwrap_err();
    assert!(matches!(err, FetchError::Decode(_)));
    assert!(store
        .windows()
        .get(&Cursor::page(PublisherId(42), 1000, 5))
        .is_none());
    assert_eq!(store.cursors().get(&PublisherId(42)).len(), 1);
}
