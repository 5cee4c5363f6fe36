use super::test_helpers::*;
use super::*;
use crate::error::{DownloadError, DownloadErrorKind};
use crate::types::{BlobReference, DownloadInfo, DownloadStatus, ZipRequest};
use std::io::Read;
use std::time::Duration;


/// Store `files` and submit them as one request
async fn submit_files(
    downloader: &ZipDownloader,
    store: &MemoryBlobStore,
    archive_name: &str,
    files: &[(&str, &[u8])],
) -> RequestId {
    let blobs = files
        .iter()
        .map(|(path, data)| {
            store.put(path, data);
            BlobReference::new(*path, data.len() as u64)
        })
        .collect();

    downloader
        .submit(ZipRequest {
            archive_name: archive_name.to_string(),
            blobs,
            compression_level: None,
        })
        .await
        .unwrap()
}

/// Poll until the request reaches a status matching `done`
async fn wait_for(
    downloader: &ZipDownloader,
    id: RequestId,
    done: impl Fn(DownloadStatus) -> bool,
) -> DownloadInfo {
    for _ in 0..2000 {
        let info = downloader.status(id).await.unwrap();
        if done(info.status) {
            return info;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request {id} never reached the expected status");
}

async fn wait_until_finished(downloader: &ZipDownloader, id: RequestId) -> DownloadInfo {
    let info = wait_for(downloader, id, |s| s.is_finished()).await;
    wait_until_idle(downloader).await;
    info
}

/// Wait for every pipeline to finish its cleanup
async fn wait_until_idle(downloader: &ZipDownloader) {
    for _ in 0..2000 {
        if downloader.active.tokens.lock().await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pipelines still running");
}

/// Entry names and contents of a ZIP archive, in archive order
fn read_entries(archive: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
    (0..zip.len())
        .map(|i| {
            let mut entry = zip.by_index(i).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            (entry.name().to_string(), data)
        })
        .collect()
}
