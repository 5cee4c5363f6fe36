//! End-to-end tests driving the full pipeline over HTTP
//!
//! A wiremock server plays the SAS token function and hands out URLs pointing
//! at a second wiremock server playing blob storage.

use std::io::Read;
use std::time::Duration;

use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};
use zip_dl::{
    BlobReference, Config, DownloadErrorKind, DownloadInfo, DownloadStatus, RequestId,
    ZipDownloader, ZipRequest,
};

/// Issues signed URLs on the storage mock for whatever path is asked for
struct SasResponder {
    storage_uri: String,
}

impl Respond for SasResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = request.body_json().unwrap();
        let blob_path = body["blob_path"].as_str().unwrap();
        let access = body["access_type"].as_str().unwrap();
        ResponseTemplate::new(200).set_body_json(json!({
            "sas_url": format!("{}/{}?sp={}&sig=test", self.storage_uri, blob_path, access),
            "expires_at": "2030-01-01T00:00:00Z",
        }))
    }
}

struct Harness {
    downloader: ZipDownloader,
    _sas: MockServer,
    storage: MockServer,
    _temp_dir: TempDir,
}

async fn harness() -> Harness {
    let sas = MockServer::start().await;
    let storage = MockServer::start().await;
    let temp_dir = tempfile::tempdir().unwrap();

    Mock::given(method("POST"))
        .and(path("/api/get-blob-sas-token"))
        .respond_with(SasResponder {
            storage_uri: storage.uri(),
        })
        .mount(&sas)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/temp-zips/download_[0-9a-f-]+/.+\.zip$"))
        .and(header("x-ms-blob-type", "BlockBlob"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&storage)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&storage)
        .await;

    let mut config = Config::default();
    config.sas.function_url = Some(sas.uri());
    config.sas.retry_cooldown = Duration::from_millis(10);
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.storage.temp_dir = temp_dir.path().join("spool");

    let downloader = ZipDownloader::new(config).await.unwrap();
    Harness {
        downloader,
        _sas: sas,
        storage,
        _temp_dir: temp_dir,
    }
}

async fn serve_blob(storage: &MockServer, blob_path: &str, data: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/{blob_path}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(data.to_vec()))
        .mount(storage)
        .await;
}

async fn wait_until_finished(downloader: &ZipDownloader, id: RequestId) -> DownloadInfo {
    for _ in 0..1000 {
        let info = downloader.status(id).await.unwrap();
        if info.status.is_finished() {
            return info;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request {id} did not finish");
}

async fn uploads(storage: &MockServer) -> Vec<Request> {
    storage
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "PUT")
        .collect()
}

#[tokio::test]
async fn archive_is_built_and_uploaded_over_http() {
    let h = harness().await;
    let report = b"quarter,revenue\nq1,100\nq2,120\n".repeat(50);
    let photo = vec![0xAB_u8; 4096];
    serve_blob(&h.storage, "uploads/report.csv", &report).await;
    serve_blob(&h.storage, "uploads/photo.jpg", &photo).await;

    let hash = format!("{:x}", Sha256::digest(&photo));
    let id = h
        .downloader
        .submit(ZipRequest {
            archive_name: "quarterly".to_string(),
            blobs: vec![
                BlobReference::new("uploads/report.csv", report.len() as u64),
                BlobReference::new("uploads/photo.jpg", photo.len() as u64).with_hash(hash),
            ],
            compression_level: None,
        })
        .await
        .unwrap();

    let info = wait_until_finished(&h.downloader, id).await;
    assert_eq!(info.status, DownloadStatus::Completed, "{:?}", info.error);

    let result = info.result.unwrap();
    assert_eq!(result.destination, format!("temp-zips/download_{id}/quarterly.zip"));
    assert!(result.url.starts_with(&h.storage.uri()));
    assert!(result.url.contains("sp=READ"));
    assert_eq!(result.entry_count, 2);

    let puts = uploads(&h.storage).await;
    assert_eq!(puts.len(), 1);
    let archive = &puts[0].body;
    assert_eq!(archive.len() as u64, result.size_bytes);
    assert_eq!(
        puts[0].headers.get("content-type").unwrap(),
        "application/zip"
    );

    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive.clone())).unwrap();
    let mut names = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).unwrap();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        names.push(entry.name().to_string());
        let expected: &[u8] = if i == 0 { &report } else { &photo };
        assert_eq!(data, expected);
    }
    assert_eq!(names, vec!["uploads/report.csv", "uploads/photo.jpg"]);

    // Work directory is gone once the pipeline finishes
    let work_dir = h
        .downloader
        .get_config()
        .storage
        .temp_dir
        .join(format!("download_{id}"));
    for _ in 0..100 {
        if !work_dir.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!work_dir.exists());
}

#[tokio::test]
async fn missing_blob_fails_without_upload() {
    let h = harness().await;
    serve_blob(&h.storage, "uploads/present.txt", b"here").await;
    Mock::given(method("GET"))
        .and(path("/uploads/absent.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&h.storage)
        .await;

    let id = h
        .downloader
        .submit(ZipRequest {
            archive_name: "incomplete".to_string(),
            blobs: vec![
                BlobReference::new("uploads/present.txt", 4),
                BlobReference::new("uploads/absent.txt", 4),
            ],
            compression_level: None,
        })
        .await
        .unwrap();

    let info = wait_until_finished(&h.downloader, id).await;
    assert_eq!(info.status, DownloadStatus::Failed);
    let error = info.error.unwrap();
    assert_eq!(error.kind, DownloadErrorKind::FileNotFound);
    assert_eq!(error.blob.unwrap().path, "uploads/absent.txt");
    assert!(uploads(&h.storage).await.is_empty());
}

#[tokio::test]
async fn token_service_outage_fails_after_phase_retry() {
    let sas = MockServer::start().await;
    let temp_dir = tempfile::tempdir().unwrap();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&sas)
        .await;

    let mut config = Config::default();
    config.sas.function_url = Some(sas.uri());
    config.sas.retry_cooldown = Duration::from_millis(10);
    config.storage.temp_dir = temp_dir.path().join("spool");
    let downloader = ZipDownloader::new(config).await.unwrap();

    let id = downloader
        .submit(ZipRequest {
            archive_name: "offline".to_string(),
            blobs: vec![BlobReference::new("uploads/a.txt", 1)],
            compression_level: None,
        })
        .await
        .unwrap();

    let info = wait_until_finished(&downloader, id).await;
    assert_eq!(info.status, DownloadStatus::Failed);
    assert_eq!(info.error.unwrap().kind, DownloadErrorKind::SasService);
    assert_eq!(sas.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn missing_token_service_url_is_a_config_error() {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.temp_dir = temp_dir.path().join("spool");

    let err = ZipDownloader::new(config).await.err().unwrap();
    assert!(matches!(err, zip_dl::Error::Config { .. }), "{err:?}");
}
