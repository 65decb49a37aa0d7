use std::time::{Duration, Instant};

use pdfbatch_engine::{FailureKind, FetchSettings, PdfFetcher, ReqwestPdfFetcher};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn pdf_body() -> Vec<u8> {
    let mut body = b"%PDF-1.4\n".to_vec();
    body.resize(2048, b'x');
    body
}

fn fast_settings() -> FetchSettings {
    FetchSettings {
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(50),
        ..FetchSettings::default()
    }
}

fn fetcher(settings: FetchSettings) -> ReqwestPdfFetcher {
    ReqwestPdfFetcher::new(settings).expect("client")
}

#[tokio::test]
async fn fetcher_streams_pdf_to_disk() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/report.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(pdf_body(), "application/pdf"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let url = format!("{}/files/report.pdf", server.uri());
    let outcome = fetcher(fast_settings()).fetch(&url, 4, dir.path()).await;

    assert!(outcome.is_success(), "{:?}", outcome.result);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.filename(), Some("000004_report.pdf"));
    assert_eq!(outcome.bytes(), 2048);
    let written = std::fs::read(dir.path().join("000004_report.pdf")).unwrap();
    assert_eq!(written, pdf_body());
}

#[tokio::test]
async fn pdf_extension_accepts_generic_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/doc.pdf"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(pdf_body(), "application/octet-stream"),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let url = format!("{}/doc.pdf", server.uri());
    let outcome = fetcher(fast_settings()).fetch(&url, 1, dir.path()).await;
    assert!(outcome.is_success());
}

#[tokio::test]
async fn html_response_fails_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("<html>login</html>", "text/html; charset=utf-8"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let url = format!("{}/page", server.uri());
    let outcome = fetcher(fast_settings()).fetch(&url, 2, dir.path()).await;

    assert_eq!(outcome.attempts, 1);
    let err = outcome.result.unwrap_err();
    assert_eq!(
        err.kind,
        FailureKind::NotPdf {
            content_type: "text/html; charset=utf-8".to_string()
        }
    );
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn server_error_is_retried_with_exponential_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken.pdf"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let url = format!("{}/broken.pdf", server.uri());
    let started = Instant::now();
    let outcome = fetcher(FetchSettings::default())
        .fetch(&url, 1, dir.path())
        .await;

    // 1s after the first attempt, 2s after the second, none after the last.
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.result.unwrap_err().kind, FailureKind::HttpStatus(500));
}

#[tokio::test]
async fn client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.pdf"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let url = format!("{}/missing.pdf", server.uri());
    let outcome = fetcher(fast_settings()).fetch(&url, 1, dir.path()).await;

    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.error_class().as_deref(), Some("http status 404"));
}

#[tokio::test]
async fn transient_failure_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky.pdf"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(pdf_body(), "application/pdf"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let url = format!("{}/flaky.pdf", server.uri());
    let outcome = fetcher(fast_settings()).fetch(&url, 9, dir.path()).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.attempts, 2);
}

#[tokio::test]
async fn undersized_body_is_rejected_and_removed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tiny.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("%PDF", "application/pdf"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let url = format!("{}/tiny.pdf", server.uri());
    let outcome = fetcher(fast_settings()).fetch(&url, 3, dir.path()).await;

    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.result.unwrap_err().kind, FailureKind::TooSmall { bytes: 4 });
    assert!(!dir.path().join("000003_tiny.pdf").exists());
}

#[tokio::test]
async fn timeout_is_retried_then_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(500))
                .set_body_raw(pdf_body(), "application/pdf"),
        )
        .mount(&server)
        .await;

    let settings = FetchSettings {
        request_timeout: Some(Duration::from_millis(50)),
        max_retries: 2,
        ..fast_settings()
    };
    let dir = TempDir::new().unwrap();
    let url = format!("{}/slow.pdf", server.uri());
    let outcome = fetcher(settings).fetch(&url, 1, dir.path()).await;

    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.result.unwrap_err().kind, FailureKind::Timeout);
}

#[tokio::test]
async fn invalid_url_fails_immediately() {
    let dir = TempDir::new().unwrap();
    let outcome = fetcher(fast_settings())
        .fetch("not a url", 1, dir.path())
        .await;
    assert_eq!(outcome.attempts, 0);
    assert_eq!(outcome.result.unwrap_err().kind, FailureKind::InvalidUrl);
}

#[test]
fn backoff_doubles_up_to_the_cap() {
    let settings = FetchSettings::default();
    let delays: Vec<u64> = (0..6)
        .map(|attempt| settings.backoff_delay(attempt).as_secs())
        .collect();
    assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
}
