//! PolygonFetcher against a local one-shot HTTP server.

use barvault_core::chunker::{parse_date, Interval};
use barvault_core::{
    BackoffPolicy, CompletionStatus, CsvSink, ErrorKind, FetchError, FetchOrchestrator, FetchRequest,
    Granularity, PageFetcher, PageToken, PolygonFetcher, RecordSink, Resolution, RunSpec,
    Timespan,
};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Canned {
    status: &'static str,
    headers: Vec<(&'static str, String)>,
    body: String,
}

impl Canned {
    fn ok(body: impl Into<String>) -> Self {
        Self {
            status: "200 OK",
            headers: Vec::new(),
            body: body.into(),
        }
    }

    fn status(status: &'static str, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

/// Serves `responses` one per connection, recording each request line.
struct TestServer {
    base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(responses: Vec<Canned>) -> Self {
        Self::start_with(|_| responses)
    }

    /// Build the script once the server's base URL is known.
    fn start_with(script: impl FnOnce(&str) -> Vec<Canned>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let responses = script(&base_url);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        let handle = thread::spawn(move || {
            for canned in responses {
                let (stream, _) = match listener.accept() {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let mut reader = BufReader::new(stream);
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                seen.lock().unwrap().push(request_line.trim().to_string());
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
                        break;
                    }
                }

                let mut stream = reader.into_inner();
                let mut head = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
                    canned.status,
                    canned.body.len()
                );
                for (name, value) in &canned.headers {
                    head.push_str(&format!("{name}: {value}\r\n"));
                }
                head.push_str("\r\n");
                stream.write_all(head.as_bytes()).unwrap();
                stream.write_all(canned.body.as_bytes()).unwrap();
                stream.flush().unwrap();
            }
        });

        Self {
            base_url,
            requests,
            handle: Some(handle),
        }
    }

    fn fetcher(&self) -> PolygonFetcher {
        PolygonFetcher::new(&self.base_url, "TESTKEY", Duration::from_secs(5), 50_000).unwrap()
    }

    fn requests(&mut self) -> Vec<String> {
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
        self.requests.lock().unwrap().clone()
    }
}

fn request() -> FetchRequest {
    let interval = Interval::new(
        parse_date("2023-01-03").unwrap(),
        parse_date("2023-01-03").unwrap(),
    )
    .unwrap();
    FetchRequest::new("AAPL", Resolution::one(Timespan::Minute), interval)
}

fn page_body(start_ts: i64, count: i64, next_url: Option<&str>) -> String {
    let results: Vec<String> = (0..count)
        .map(|i| {
            format!(
                r#"{{"t":{},"o":1.0,"h":2.0,"l":0.5,"c":1.5,"v":100,"vw":1.2,"n":3}}"#,
                start_ts + i * 60_000
            )
        })
        .collect();
    match next_url {
        Some(next) => format!(
            r#"{{"status":"OK","resultsCount":{count},"results":[{}],"next_url":"{next}"}}"#,
            results.join(",")
        ),
        None => format!(
            r#"{{"status":"OK","resultsCount":{count},"results":[{}]}}"#,
            results.join(",")
        ),
    }
}

#[test]
fn first_page_request_path_and_decode() {
    let mut server = TestServer::start(vec![Canned::ok(page_body(1_672_754_400_000, 3, None))]);
    let page = server.fetcher().fetch(&request(), None).unwrap();

    assert_eq!(page.bars.len(), 3);
    assert!(page.next.is_none());

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let line = &requests[0];
    assert!(line.starts_with("GET /v2/aggs/ticker/AAPL/range/1/minute/2023-01-03/2023-01-03?"));
    assert!(line.contains("adjusted=true"));
    assert!(line.contains("sort=asc"));
    assert!(line.contains("limit=50000"));
    assert!(line.contains("apiKey=TESTKEY"));
}

#[test]
fn continuation_uses_next_url_with_key() {
    let mut server = TestServer::start(vec![Canned::ok(page_body(0, 1, None))]);
    let next = format!(
        "{}/v2/aggs/ticker/AAPL/range/1/minute/1672704000000/1672790399999?cursor=abc",
        server.base_url
    );
    server
        .fetcher()
        .fetch(&request(), Some(&PageToken::new(next)))
        .unwrap();

    let requests = server.requests();
    assert!(requests[0].contains("cursor=abc"));
    assert!(requests[0].contains("apiKey=TESTKEY"));
}

#[test]
fn throttling_carries_retry_after() {
    let mut server = TestServer::start(vec![
        Canned::status("429 Too Many Requests", "{}").header("Retry-After", "7"),
    ]);
    let err = server.fetcher().fetch(&request(), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimited);
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    server.requests();
}

#[test]
fn server_errors_are_transient_and_client_errors_rejected() {
    let mut server = TestServer::start(vec![
        Canned::status("503 Service Unavailable", "busy"),
        Canned::status("403 Forbidden", r#"{"status":"NOT_AUTHORIZED"}"#),
    ]);
    let fetcher = server.fetcher();

    let err = fetcher.fetch(&request(), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);

    let err = fetcher.fetch(&request(), None).unwrap_err();
    assert!(matches!(err, FetchError::Rejected { status: 403, .. }));
    server.requests();
}

#[test]
fn garbage_body_is_malformed() {
    let mut server = TestServer::start(vec![Canned::ok("<html>gateway</html>")]);
    let err = server.fetcher().fetch(&request(), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Malformed);
    server.requests();
}

#[test]
fn connection_refused_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let fetcher =
        PolygonFetcher::new(format!("http://{addr}"), "K", Duration::from_secs(2), 10).unwrap();
    let err = fetcher.fetch(&request(), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
}

#[test]
fn orchestrated_run_over_http_recovers_from_a_503() {
    let mut server = TestServer::start_with(|base| {
        let next = format!("{base}/v2/aggs/next?cursor=p2");
        vec![
            Canned::ok(page_body(1_672_754_400_000, 2, Some(&next))),
            Canned::status("503 Service Unavailable", ""),
            Canned::ok(page_body(1_672_754_520_000, 2, None)),
        ]
    });

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("AAPL_minute_historical.csv");
    let spec = RunSpec::new(
        "AAPL",
        Resolution::one(Timespan::Minute),
        parse_date("2023-01-03").unwrap(),
        parse_date("2023-01-03").unwrap(),
    )
    .with_granularity(Granularity::Whole);

    let sink = CsvSink::create(&path).unwrap();
    assert_eq!(sink.written(), 0);
    let result = FetchOrchestrator::new(
        server.fetcher(),
        BackoffPolicy::new(Duration::from_millis(5), 3, 0.0),
    )
    .run(&spec, sink);

    assert_eq!(result.status, CompletionStatus::Complete);
    assert_eq!(result.records_written, 4);
    assert_eq!(result.retries, 1);

    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].contains("/v2/aggs/ticker/AAPL/"));
    assert!(requests[1].contains("cursor=p2"));
    assert!(requests[2].contains("cursor=p2"));
}
