use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pdfbatch_core::{ProgressStatus, SessionDescriptor};
use pdfbatch_engine::{
    read_json, zip_entry_names, ArtifactRegistry, BatchDownloadEngine, EngineSettings,
    FetchSettings, OrchestratorConfig, ProgressStore, ReqwestPdfFetcher, SessionError,
    SessionOrchestrator, SESSION_DESCRIPTOR,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn pdf_body() -> Vec<u8> {
    let mut body = b"%PDF-1.4\n".to_vec();
    body.resize(1024, b'x');
    body
}

fn orchestrator(root: &Path) -> Arc<SessionOrchestrator> {
    let settings = FetchSettings {
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(20),
        ..FetchSettings::default()
    };
    let fetcher = Arc::new(ReqwestPdfFetcher::new(settings).expect("client"));
    let engine = BatchDownloadEngine::new(
        fetcher,
        EngineSettings {
            worker_count: 3,
            sub_batch_size: 5,
        },
    );
    SessionOrchestrator::new(
        OrchestratorConfig::new(root.to_path_buf()),
        engine,
        Arc::new(ProgressStore::in_memory()),
        Arc::new(ArtifactRegistry::new()),
    )
}

async fn document_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/ok/.*$"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(pdf_body(), "application/pdf"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/gone/.*$"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    server
}

fn ok_urls(server: &MockServer, n: usize) -> Vec<String> {
    (0..n)
        .map(|i| format!("{}/ok/doc{i}.pdf", server.uri()))
        .collect()
}

async fn join(orchestrator: &SessionOrchestrator, task_id: &str) {
    let result = orchestrator
        .supervisor()
        .join(task_id)
        .await
        .expect("task tracked");
    assert_eq!(result, Ok(()));
}

#[tokio::test]
async fn prepare_persists_a_descriptor_with_the_full_plan() {
    engine_logging::initialize_for_tests();
    let root = TempDir::new().unwrap();
    let orchestrator = orchestrator(root.path());
    let urls: Vec<String> = (0..7).map(|i| format!("https://example.com/{i}.pdf")).collect();

    let descriptor = orchestrator.prepare(&urls, Some(3)).unwrap();

    assert_eq!(descriptor.total_urls, 7);
    assert_eq!(descriptor.total_batches, 3);
    let counts: Vec<_> = descriptor.batches.iter().map(|b| b.spec.count).collect();
    assert_eq!(counts, vec![3, 3, 1]);

    let folder = root
        .path()
        .join(format!("session_{}", descriptor.session_id));
    let on_disk: SessionDescriptor = read_json(&folder.join(SESSION_DESCRIPTOR)).unwrap();
    assert_eq!(on_disk, descriptor);
}

#[tokio::test]
async fn prepare_rejects_blank_url_lists() {
    let root = TempDir::new().unwrap();
    let orchestrator = orchestrator(root.path());
    let err = orchestrator
        .prepare(&["  ".to_string(), String::new()], None)
        .unwrap_err();
    assert!(matches!(err, SessionError::EmptyUrlList));
}

#[tokio::test]
async fn reload_after_restart_reproduces_the_plan_exactly() {
    let root = TempDir::new().unwrap();
    let urls: Vec<String> = (0..8).map(|i| format!("https://example.com/{i}.pdf")).collect();
    let prepared = orchestrator(root.path()).prepare(&urls, Some(3)).unwrap();
    let descriptor_path = root
        .path()
        .join(format!("session_{}", prepared.session_id))
        .join(SESSION_DESCRIPTOR);
    let bytes_before = std::fs::read(&descriptor_path).unwrap();

    // A fresh orchestrator stands in for a restarted process.
    let restarted = orchestrator(root.path());
    let reloaded = restarted.reload(&prepared.session_id).unwrap();

    assert_eq!(reloaded, prepared);
    assert_eq!(
        serde_json::to_vec(&reloaded.batches).unwrap(),
        serde_json::to_vec(&prepared.batches).unwrap()
    );
    assert_eq!(std::fs::read(&descriptor_path).unwrap(), bytes_before);
}

#[tokio::test]
async fn download_batch_completes_and_persists_the_batch() {
    let server = document_server().await;
    let root = TempDir::new().unwrap();
    let orchestrator = orchestrator(root.path());
    let mut urls = ok_urls(&server, 5);
    urls[1] = format!("{}/gone/missing.pdf", server.uri());
    let descriptor = orchestrator.prepare(&urls, Some(3)).unwrap();
    let session_id = descriptor.session_id.clone();

    let progress_id = orchestrator.download_batch(&session_id, 1).unwrap();
    join(&orchestrator, &progress_id).await;

    let record = orchestrator.progress().get(&progress_id).unwrap();
    assert_eq!(record.status, ProgressStatus::Ready);
    assert_eq!(record.successful, 2);
    assert_eq!(record.failed, 1);
    assert_eq!(record.failed_urls.len(), 1);
    let download_id = record.download_id.clone().expect("download id");
    let filename = record.filename.clone().expect("filename");
    assert!(filename.starts_with("batch_001_"));

    let folder = orchestrator.session_folder(&session_id);
    assert_eq!(zip_entry_names(&folder.join(&filename)).unwrap().len(), 2);

    let on_disk: SessionDescriptor = read_json(&folder.join(SESSION_DESCRIPTOR)).unwrap();
    let batch = on_disk.batch(1).unwrap();
    assert!(batch.completed);
    assert_eq!(batch.download_id.as_deref(), Some(download_id.as_str()));
    assert!(!on_disk.batch(2).unwrap().completed);

    let artifact = orchestrator.artifacts().get(&download_id).unwrap();
    assert!(artifact.retain);
    assert!(!orchestrator.is_busy(&session_id));

    let again = orchestrator.download_batch(&session_id, 1).unwrap_err();
    assert!(matches!(again, SessionError::BatchCompleted { batch_number: 1, .. }));
}

#[tokio::test]
async fn unknown_references_are_client_errors() {
    let root = TempDir::new().unwrap();
    let orchestrator = orchestrator(root.path());
    let urls = vec!["https://example.com/a.pdf".to_string()];
    let descriptor = orchestrator.prepare(&urls, Some(10)).unwrap();

    let err = orchestrator.download_batch("nope", 1).unwrap_err();
    assert!(matches!(err, SessionError::InvalidSession(_)));
    assert!(err.is_client_error());

    let err = orchestrator.download_batch("../etc", 1).unwrap_err();
    assert!(matches!(err, SessionError::InvalidSession(_)));

    let err = orchestrator
        .download_batch(&descriptor.session_id, 2)
        .unwrap_err();
    assert!(matches!(err, SessionError::InvalidBatch { batch_number: 2, .. }));

    let err = orchestrator.auto_run("missing").unwrap_err();
    assert!(matches!(err, SessionError::InvalidSession(_)));

    let err = orchestrator
        .merge(&descriptor.session_id, &["unknown".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::UnknownArtifact(_)));
    assert!(err.is_client_error());

    assert!(orchestrator.progress().is_empty());
}

#[tokio::test]
async fn auto_run_continues_past_a_failed_batch() {
    let server = document_server().await;
    let root = TempDir::new().unwrap();
    let orchestrator = orchestrator(root.path());
    let mut urls = ok_urls(&server, 6);
    // Batch 2 (urls 3 and 4) only has missing documents.
    urls[2] = format!("{}/gone/a.pdf", server.uri());
    urls[3] = format!("{}/gone/b.pdf", server.uri());
    let descriptor = orchestrator.prepare(&urls, Some(2)).unwrap();
    let session_id = descriptor.session_id.clone();

    let progress_id = orchestrator.auto_run(&session_id).unwrap();
    join(&orchestrator, &progress_id).await;

    let record = orchestrator.progress().get(&progress_id).unwrap();
    assert_eq!(record.status, ProgressStatus::Completed);
    assert_eq!(record.batch_total, 3);
    assert_eq!(record.batch_current, 3);
    assert_eq!(record.total, 6);
    assert_eq!(record.successful, 4);
    assert_eq!(record.failed, 2);
    assert_eq!(record.failed_urls.len(), 2);

    let on_disk: SessionDescriptor = read_json(
        &orchestrator
            .session_folder(&session_id)
            .join(SESSION_DESCRIPTOR),
    )
    .unwrap();
    assert_eq!(on_disk.pending_batches(), vec![2]);
    assert_eq!(on_disk.completed_batches(), 2);
}

#[tokio::test]
async fn concurrent_runs_on_one_session_are_rejected() {
    let server = document_server().await;
    let root = TempDir::new().unwrap();
    let orchestrator = orchestrator(root.path());
    let descriptor = orchestrator.prepare(&ok_urls(&server, 4), Some(2)).unwrap();
    let session_id = descriptor.session_id.clone();

    let progress_id = orchestrator.auto_run(&session_id).unwrap();
    assert!(orchestrator.is_busy(&session_id));
    let err = orchestrator.auto_run(&session_id).unwrap_err();
    assert!(matches!(err, SessionError::SessionBusy(_)));
    let err = orchestrator.download_batch(&session_id, 2).unwrap_err();
    assert!(matches!(err, SessionError::SessionBusy(_)));

    join(&orchestrator, &progress_id).await;
    assert!(!orchestrator.is_busy(&session_id));
}

#[tokio::test]
async fn completed_batches_merge_into_one_archive() {
    let server = document_server().await;
    let root = TempDir::new().unwrap();
    let orchestrator = orchestrator(root.path());
    let descriptor = orchestrator.prepare(&ok_urls(&server, 8), Some(3)).unwrap();
    let session_id = descriptor.session_id.clone();

    let progress_id = orchestrator.auto_run(&session_id).unwrap();
    join(&orchestrator, &progress_id).await;

    let completed = orchestrator.session(&session_id).unwrap();
    let download_ids: Vec<String> = completed
        .batches
        .iter()
        .filter_map(|batch| batch.download_id.clone())
        .collect();
    assert_eq!(download_ids.len(), 3);

    let merged = orchestrator.merge(&session_id, &download_ids).await.unwrap();
    assert_eq!(merged.total_files, 8);
    assert!(merged.filename.starts_with("merged_"));

    let artifact = orchestrator.artifacts().get(&merged.download_id).unwrap();
    assert!(!artifact.retain);
    assert_eq!(zip_entry_names(&artifact.path).unwrap().len(), 8);

    let err = orchestrator.merge(&session_id, &[]).await.unwrap_err();
    assert!(matches!(err, SessionError::NothingToMerge));
}

#[tokio::test]
async fn merge_only_accepts_archives_of_the_same_session() {
    let server = document_server().await;
    let root = TempDir::new().unwrap();
    let orchestrator = orchestrator(root.path());
    let ours = orchestrator.prepare(&ok_urls(&server, 2), None).unwrap();
    let theirs = orchestrator.prepare(&ok_urls(&server, 2), None).unwrap();

    let mut download_ids = Vec::new();
    for session_id in [&ours.session_id, &theirs.session_id] {
        let progress_id = orchestrator.download_batch(session_id, 1).unwrap();
        join(&orchestrator, &progress_id).await;
        let record = orchestrator.progress().get(&progress_id).unwrap();
        download_ids.push(record.download_id.unwrap());
    }
    let one_shot = orchestrator.start_download(&ok_urls(&server, 1)).unwrap();
    join(&orchestrator, &one_shot).await;
    let one_shot_id = orchestrator
        .progress()
        .get(&one_shot)
        .and_then(|record| record.download_id)
        .unwrap();

    let foreign = vec![download_ids[0].clone(), download_ids[1].clone()];
    let err = orchestrator.merge(&ours.session_id, &foreign).await.unwrap_err();
    assert!(matches!(err, SessionError::UnknownArtifact(id) if id == download_ids[1]));

    let err = orchestrator
        .merge(&ours.session_id, &[one_shot_id.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::UnknownArtifact(id) if id == one_shot_id));
    assert!(orchestrator.artifacts().get(&one_shot_id).is_some());

    let merged = orchestrator
        .merge(&ours.session_id, &download_ids[..1])
        .await
        .unwrap();
    assert_eq!(merged.total_files, 2);
}

#[tokio::test]
async fn reload_reregisters_completed_archives() {
    let server = document_server().await;
    let root = TempDir::new().unwrap();
    let first = orchestrator(root.path());
    let descriptor = first.prepare(&ok_urls(&server, 4), Some(2)).unwrap();
    let session_id = descriptor.session_id.clone();
    let progress_id = first.download_batch(&session_id, 2).unwrap();
    join(&first, &progress_id).await;
    let download_id = first
        .progress()
        .get(&progress_id)
        .and_then(|record| record.download_id)
        .unwrap();

    let restarted = orchestrator(root.path());
    assert!(restarted.artifacts().get(&download_id).is_none());
    let reloaded = restarted.reload(&session_id).unwrap();

    assert_eq!(reloaded.pending_batches(), vec![1]);
    let artifact = restarted.artifacts().get(&download_id).expect("re-registered");
    assert!(artifact.path.is_file());
}

#[tokio::test]
async fn list_sessions_reports_batch_counts() {
    let server = document_server().await;
    let root = TempDir::new().unwrap();
    let orchestrator = orchestrator(root.path());
    let busy = orchestrator.prepare(&ok_urls(&server, 5), Some(2)).unwrap();
    let idle = orchestrator.prepare(&ok_urls(&server, 3), Some(3)).unwrap();

    let progress_id = orchestrator.download_batch(&busy.session_id, 1).unwrap();
    join(&orchestrator, &progress_id).await;

    let mut sessions = orchestrator.list_sessions().unwrap();
    sessions.sort_by_key(|summary| summary.total_urls);
    assert_eq!(sessions.len(), 2);

    assert_eq!(sessions[0].session_id, idle.session_id);
    assert_eq!(sessions[0].total_batches, 1);
    assert_eq!(sessions[0].completed_batches, 0);

    assert_eq!(sessions[1].session_id, busy.session_id);
    assert_eq!(sessions[1].total_batches, 3);
    assert_eq!(sessions[1].completed_batches, 1);
}

#[tokio::test]
async fn one_shot_download_ends_ready_with_a_single_use_artifact() {
    let server = document_server().await;
    let root = TempDir::new().unwrap();
    let orchestrator = orchestrator(root.path());

    let progress_id = orchestrator.start_download(&ok_urls(&server, 3)).unwrap();
    join(&orchestrator, &progress_id).await;

    let record = orchestrator.progress().get(&progress_id).unwrap();
    assert_eq!(record.status, ProgressStatus::Ready);
    assert_eq!(record.successful, 3);
    let download_id = record.download_id.unwrap();

    let artifact = orchestrator.artifacts().checkout(&download_id).unwrap();
    assert!(artifact.path.starts_with(root.path()));
    assert!(orchestrator.artifacts().checkout(&download_id).is_none());
}

#[tokio::test]
async fn one_shot_download_with_no_successes_ends_in_error() {
    let server = document_server().await;
    let root = TempDir::new().unwrap();
    let orchestrator = orchestrator(root.path());
    let urls = vec![format!("{}/gone/x.pdf", server.uri())];

    let progress_id = orchestrator.start_download(&urls).unwrap();
    join(&orchestrator, &progress_id).await;

    let record = orchestrator.progress().get(&progress_id).unwrap();
    assert_eq!(record.status, ProgressStatus::Error);
    assert_eq!(record.failed_urls.len(), 1);
    assert!(record.download_id.is_none());
    assert!(orchestrator.artifacts().is_empty());
}

#[tokio::test]
async fn cleanup_drops_old_sessions_and_records() {
    let root = TempDir::new().unwrap();
    let orchestrator = orchestrator(root.path());
    let urls = vec!["https://example.com/a.pdf".to_string()];
    let descriptor = orchestrator.prepare(&urls, None).unwrap();
    orchestrator.progress().create("stale");

    // Nothing is older than an hour yet.
    let report = orchestrator.cleanup(Duration::from_secs(3600)).unwrap();
    assert_eq!(report.temp_entries, 0);
    assert_eq!(report.progress_records, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = orchestrator.cleanup(Duration::from_millis(10)).unwrap();
    assert_eq!(report.temp_entries, 1);
    assert_eq!(report.progress_records, 1);
    assert!(!orchestrator.session_folder(&descriptor.session_id).exists());
    assert!(matches!(
        orchestrator.session(&descriptor.session_id),
        Err(SessionError::InvalidSession(_))
    ));
}
