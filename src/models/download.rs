use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::metadata::compute_sha256;
use super::resolver::{self, ResolvedSource, StoragePaths};
use super::spec::ModelSpec;

/// Per-file attempt budget; partial progress is kept across attempts.
pub const MAX_ATTEMPTS: u32 = 4;
const CHUNK_SIZE: usize = 32 * 1024;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Aggregate progress snapshot for one download run. `file_index` and
/// `file_count` are 1-based positions among files actually requiring
/// transfer; byte counters span the whole run, not just the current file.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub model_id: String,
    pub current_file: String,
    pub file_index: usize,
    pub file_count: usize,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
    pub overall_percent: f32,
}

/// Fatal downloader outcomes. Transient per-file failures are retried
/// internally and only surface here once the attempt budget is spent.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download of {file} failed after {attempts} attempts: {cause}")]
    Exhausted {
        file: String,
        attempts: u32,
        cause: anyhow::Error,
    },
    #[error("model {model_id} incomplete after download; missing or invalid: {files:?}")]
    Incomplete { model_id: String, files: Vec<String> },
}

#[derive(Debug)]
pub struct DownloadOutcome {
    pub model_id: String,
    pub source: ResolvedSource,
    pub entry_sha256: Option<String>,
}

/// Keeps `overall_percent` monotonically non-decreasing within one run even
/// when size probes failed and the byte arithmetic degrades.
#[derive(Debug, Default)]
struct ProgressTracker {
    last_percent: f32,
}

impl ProgressTracker {
    fn advance(&mut self, raw: f32) -> f32 {
        let clamped = raw.clamp(0.0, 100.0);
        if clamped > self.last_percent {
            self.last_percent = clamped;
        }
        self.last_percent
    }
}

pub struct ModelDownloader {
    client: Client,
    paths: StoragePaths,
}

impl ModelDownloader {
    pub fn new(paths: StoragePaths) -> Result<Self> {
        let client = Client::builder().build().context("create http client")?;
        Ok(Self { client, paths })
    }

    /// Materializes all of `spec.files` into the local model directory from
    /// whichever source the resolver selects, emitting progress along the
    /// way. Files transfer strictly sequentially.
    pub fn download<F>(&self, spec: &ModelSpec, mut progress: F) -> Result<DownloadOutcome>
    where
        F: FnMut(DownloadProgress),
    {
        spec.validate()?;
        let dest = self.paths.model_dir(&spec.id);
        fs::create_dir_all(&dest)
            .with_context(|| format!("create model directory {}", dest.display()))?;

        let source = resolver::resolve(spec, &self.paths);
        info!(model = %spec.id, source = ?source, "acquiring model artifact");

        let mut tracker = ProgressTracker::default();
        match &source {
            ResolvedSource::AlreadyLocal => {}
            ResolvedSource::ExternalStaged(dir) | ResolvedSource::Bundled(dir) => {
                self.copy_local(spec, dir, &dest, &mut tracker, &mut progress)?;
            }
            ResolvedSource::RemoteRequired => {
                self.fetch_remote(spec, &dest, &mut tracker, &mut progress)?;
            }
        }

        let entry = dest.join(&spec.entry_file);
        let missing = resolver::list_missing_or_invalid(spec, &dest);
        if resolver::file_is_invalid(&entry) || !missing.is_empty() {
            return Err(DownloadError::Incomplete {
                model_id: spec.id.clone(),
                files: missing,
            }
            .into());
        }

        progress(DownloadProgress {
            model_id: spec.id.clone(),
            current_file: "(done)".into(),
            file_index: 0,
            file_count: 0,
            bytes_downloaded: 0,
            bytes_total: 0,
            overall_percent: tracker.advance(100.0),
        });

        let entry_sha256 = compute_sha256(&entry).ok();
        if let Some(digest) = &entry_sha256 {
            debug!(model = %spec.id, entry = %spec.entry_file, %digest, "entry file digest");
        }

        Ok(DownloadOutcome {
            model_id: spec.id.clone(),
            source,
            entry_sha256,
        })
    }

    /// Side-loaded and bundled sources are plain byte copies. Totals are not
    /// pre-known here, so percent is coarse file-count position.
    fn copy_local<F>(
        &self,
        spec: &ModelSpec,
        src_dir: &Path,
        dest: &Path,
        tracker: &mut ProgressTracker,
        progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(DownloadProgress),
    {
        let pending = resolver::list_missing_or_invalid(spec, dest);
        let file_count = pending.len();
        let mut copied_bytes = 0u64;

        for (position, file) in pending.iter().enumerate() {
            let from = src_dir.join(file);
            let to = dest.join(file);
            copied_bytes += fs::copy(&from, &to)
                .with_context(|| format!("copy {} from {}", file, src_dir.display()))?;

            let file_index = position + 1;
            let percent = (file_index as f32 / file_count as f32) * 100.0;
            progress(DownloadProgress {
                model_id: spec.id.clone(),
                current_file: file.clone(),
                file_index,
                file_count,
                bytes_downloaded: copied_bytes,
                bytes_total: 0,
                overall_percent: tracker.advance(percent),
            });
        }
        Ok(())
    }

    fn fetch_remote<F>(
        &self,
        spec: &ModelSpec,
        dest: &Path,
        tracker: &mut ProgressTracker,
        progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(DownloadProgress),
    {
        let pending = resolver::list_missing_or_invalid(spec, dest);
        let file_count = pending.len();

        // Size pre-flight. A failed probe contributes zero, degrading the
        // percent estimate for that file without blocking the transfer.
        let mut bytes_total = 0u64;
        for file in &pending {
            bytes_total += self.probe_size(spec, file);
        }

        let mut completed_bytes = 0u64;
        for (position, file) in pending.iter().enumerate() {
            let file_index = position + 1;
            let final_path = dest.join(file.as_str());

            self.fetch_file(spec, dest, file, &mut |part_len| {
                let downloaded = completed_bytes + part_len;
                let percent = if bytes_total > 0 {
                    (downloaded as f64 / bytes_total as f64 * 100.0) as f32
                } else {
                    (position as f32 / file_count as f32) * 100.0
                };
                progress(DownloadProgress {
                    model_id: spec.id.clone(),
                    current_file: file.clone(),
                    file_index,
                    file_count,
                    bytes_downloaded: downloaded,
                    bytes_total,
                    overall_percent: tracker.advance(percent),
                });
            })?;

            completed_bytes += fs::metadata(&final_path).map(|meta| meta.len()).unwrap_or(0);
        }
        Ok(())
    }

    fn probe_size(&self, spec: &ModelSpec, file: &str) -> u64 {
        let url = spec.file_url(file);
        match self.client.head(&url).send() {
            Ok(response) if response.status().is_success() => response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok())
                .unwrap_or(0),
            Ok(response) => {
                warn!(%url, status = %response.status(), "size probe rejected");
                0
            }
            Err(error) => {
                warn!(%url, "size probe failed: {error:#}");
                0
            }
        }
    }

    fn fetch_file(
        &self,
        spec: &ModelSpec,
        dest: &Path,
        file: &str,
        on_chunk: &mut dyn FnMut(u64),
    ) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.transfer_attempt(spec, dest, file, on_chunk) {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(
                        model = %spec.id,
                        %file,
                        attempt,
                        "transfer attempt failed: {error:#}"
                    );
                    last_error = Some(error);
                    if attempt < MAX_ATTEMPTS {
                        thread::sleep(RETRY_BASE_DELAY * attempt);
                    }
                }
            }
        }

        Err(DownloadError::Exhausted {
            file: file.to_string(),
            attempts: MAX_ATTEMPTS,
            cause: last_error.unwrap_or_else(|| anyhow!("no attempt recorded")),
        }
        .into())
    }

    /// One transfer attempt: resume from the `.part` sibling when present,
    /// stream the body in chunks, then rename into place and re-check
    /// integrity. Any error leaves the `.part` file behind for the next
    /// attempt to resume from.
    fn transfer_attempt(
        &self,
        spec: &ModelSpec,
        dest: &Path,
        file: &str,
        on_chunk: &mut dyn FnMut(u64),
    ) -> Result<()> {
        let final_path = dest.join(file);
        if !resolver::file_is_invalid(&final_path) {
            return Ok(());
        }

        let part_path = dest.join(format!("{file}.part"));
        let mut offset = fs::metadata(&part_path).map(|meta| meta.len()).unwrap_or(0);

        let url = spec.file_url(file);
        let mut request = self.client.get(&url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let mut response = request.send().with_context(|| format!("request {url}"))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let final_url = response.url().to_string();

        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(anyhow!(
                "unexpected status {status} (content-type {content_type:?}) fetching {final_url}"
            ));
        }
        // Some hosts answer missing or throttled files with a 200 HTML page.
        if content_type.to_ascii_lowercase().starts_with("text/html") {
            return Err(anyhow!(
                "disguised error page: content-type {content_type:?} with status {status} from {final_url}"
            ));
        }
        if offset > 0 && status == StatusCode::OK {
            // Server ignored the range request; start over.
            let _ = fs::remove_file(&part_path);
            offset = 0;
        }

        let mut part = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&part_path)
            .with_context(|| format!("open partial file {}", part_path.display()))?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = response.read(&mut buffer).context("read download chunk")?;
            if read == 0 {
                break;
            }
            part.write_all(&buffer[..read])
                .context("write download chunk")?;
            offset += read as u64;
            on_chunk(offset);
        }
        part.flush().context("flush partial file")?;
        drop(part);

        fs::rename(&part_path, &final_path)
            .with_context(|| format!("finalize {}", final_path.display()))?;

        if resolver::file_is_invalid(&final_path) {
            let _ = fs::remove_file(&final_path);
            return Err(anyhow!(
                "{file} failed the integrity check after transfer; discarded"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::spec::MANIFEST_FILE;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct StubRequest {
        method: String,
        path: String,
        range_offset: Option<u64>,
    }

    struct StubResponse {
        status: &'static str,
        content_type: &'static str,
        body: Vec<u8>,
    }

    /// Minimal HTTP stub; enough for reqwest's blocking client in tests.
    fn spawn_server<H>(handler: H) -> String
    where
        H: Fn(&StubRequest) -> StubResponse + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let mut reader = BufReader::new(stream);
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).is_err() || request_line.is_empty() {
                    continue;
                }
                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or("").to_string();
                let path = parts.next().unwrap_or("").to_string();

                let mut range_offset = None;
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).is_err() {
                        break;
                    }
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        break;
                    }
                    if let Some(value) = trimmed
                        .to_ascii_lowercase()
                        .strip_prefix("range: bytes=")
                        .map(ToOwned::to_owned)
                    {
                        range_offset = value.trim_end_matches('-').parse::<u64>().ok();
                    }
                }

                let request = StubRequest {
                    method,
                    path,
                    range_offset,
                };
                let response = handler(&request);
                let head_only = request.method == "HEAD";

                let mut stream = reader.into_inner();
                let mut payload = format!(
                    "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    response.status,
                    response.content_type,
                    response.body.len()
                )
                .into_bytes();
                if !head_only {
                    payload.extend_from_slice(&response.body);
                }
                let _ = stream.write_all(&payload);
                let _ = stream.flush();
            }
        });
        format!("http://{addr}/models/test-vlm/resolve/main")
    }

    fn remote_spec(base_url: &str) -> ModelSpec {
        ModelSpec {
            id: "test-vlm".into(),
            display_name: "Test VLM".into(),
            base_url: base_url.into(),
            files: vec![MANIFEST_FILE.into(), "entry.nexa".into()],
            entry_file: "entry.nexa".into(),
            mmproj_file: None,
        }
    }

    fn downloader(root: &TempDir) -> ModelDownloader {
        let paths = StoragePaths::new(root.path().to_path_buf(), Vec::new(), None);
        ModelDownloader::new(paths).unwrap()
    }

    fn ok_body(body: &[u8]) -> StubResponse {
        StubResponse {
            status: "200 OK",
            content_type: "application/octet-stream",
            body: body.to_vec(),
        }
    }

    const MANIFEST_BODY: &[u8] = br#"{"modelName": "Test VLM"}"#;
    const ENTRY_BODY: &[u8] = b"NEXAWEIGHTS-0123456789-0123456789-0123456789";

    fn serve_spec_files(request: &StubRequest) -> StubResponse {
        if request.path.contains("nexa.manifest") {
            ok_body(MANIFEST_BODY)
        } else if request.path.contains("entry.nexa") {
            match request.range_offset {
                Some(offset) => StubResponse {
                    status: "206 Partial Content",
                    content_type: "application/octet-stream",
                    body: ENTRY_BODY[offset as usize..].to_vec(),
                },
                None => ok_body(ENTRY_BODY),
            }
        } else {
            StubResponse {
                status: "404 Not Found",
                content_type: "text/plain",
                body: b"missing".to_vec(),
            }
        }
    }

    #[test]
    fn already_local_emits_single_done_event() {
        let root = TempDir::new().unwrap();
        let spec = remote_spec("http://127.0.0.1:9/unreachable");
        let model_dir = root.path().join(&spec.id);
        fs::create_dir_all(&model_dir).unwrap();
        fs::write(model_dir.join(MANIFEST_FILE), MANIFEST_BODY).unwrap();
        fs::write(model_dir.join("entry.nexa"), ENTRY_BODY).unwrap();

        let mut events = Vec::new();
        let outcome = downloader(&root)
            .download(&spec, |event| events.push(event))
            .unwrap();

        assert_eq!(outcome.source, ResolvedSource::AlreadyLocal);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].current_file, "(done)");
        assert_eq!(events[0].overall_percent, 100.0);
    }

    #[test]
    fn staged_copy_emits_per_file_then_final_event() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let spec = remote_spec("http://127.0.0.1:9/unreachable");

        let staged_dir = staging.path().join(&spec.id);
        fs::create_dir_all(&staged_dir).unwrap();
        fs::write(staged_dir.join(MANIFEST_FILE), MANIFEST_BODY).unwrap();
        fs::write(staged_dir.join("entry.nexa"), ENTRY_BODY).unwrap();

        let paths = StoragePaths::new(
            root.path().to_path_buf(),
            vec![staging.path().to_path_buf()],
            None,
        );
        let downloader = ModelDownloader::new(paths).unwrap();

        let mut events = Vec::new();
        let outcome = downloader
            .download(&spec, |event| events.push(event))
            .unwrap();

        assert_eq!(outcome.source, ResolvedSource::ExternalStaged(staged_dir));
        assert_eq!(events.len(), 3);
        assert_eq!((events[0].file_index, events[0].file_count), (1, 2));
        assert_eq!((events[1].file_index, events[1].file_count), (2, 2));
        assert_eq!(events[2].overall_percent, 100.0);
        assert!(events
            .windows(2)
            .all(|pair| pair[0].overall_percent <= pair[1].overall_percent));
    }

    #[test]
    fn remote_download_completes_with_monotone_percent() {
        let root = TempDir::new().unwrap();
        let base = spawn_server(serve_spec_files);
        let spec = remote_spec(&base);

        let mut events = Vec::new();
        let outcome = downloader(&root)
            .download(&spec, |event| events.push(event))
            .unwrap();

        assert!(outcome.entry_sha256.is_some());
        let entry = root.path().join(&spec.id).join("entry.nexa");
        assert_eq!(fs::read(entry).unwrap(), ENTRY_BODY);

        assert!(events
            .windows(2)
            .all(|pair| pair[0].overall_percent <= pair[1].overall_percent));
        assert_eq!(events.last().unwrap().overall_percent, 100.0);
        let expected_total = (MANIFEST_BODY.len() + ENTRY_BODY.len()) as u64;
        assert_eq!(events[0].bytes_total, expected_total);
    }

    #[test]
    fn resume_extends_partial_file_to_probed_size() {
        let root = TempDir::new().unwrap();
        let ranged = Arc::new(AtomicUsize::new(0));
        let ranged_in_handler = ranged.clone();
        let base = spawn_server(move |request| {
            if request.range_offset.is_some() {
                ranged_in_handler.fetch_add(1, Ordering::SeqCst);
            }
            serve_spec_files(request)
        });
        let spec = remote_spec(&base);

        let model_dir = root.path().join(&spec.id);
        fs::create_dir_all(&model_dir).unwrap();
        fs::write(model_dir.join("entry.nexa.part"), &ENTRY_BODY[..17]).unwrap();

        downloader(&root).download(&spec, |_| {}).unwrap();

        assert_eq!(ranged.load(Ordering::SeqCst), 1);
        let entry = model_dir.join("entry.nexa");
        assert_eq!(fs::read(entry).unwrap(), ENTRY_BODY);
    }

    #[test]
    fn transient_failures_within_budget_still_succeed() {
        let root = TempDir::new().unwrap();
        let entry_gets = Arc::new(AtomicUsize::new(0));
        let counter = entry_gets.clone();
        let base = spawn_server(move |request| {
            if request.method == "GET" && request.path.contains("entry.nexa") {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= 3 {
                    return StubResponse {
                        status: "500 Internal Server Error",
                        content_type: "text/plain",
                        body: b"flaky".to_vec(),
                    };
                }
            }
            serve_spec_files(request)
        });
        let spec = remote_spec(&base);

        downloader(&root).download(&spec, |_| {}).unwrap();
        assert_eq!(entry_gets.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn exhausted_budget_is_fatal_and_stops_at_four_attempts() {
        let root = TempDir::new().unwrap();
        let entry_gets = Arc::new(AtomicUsize::new(0));
        let counter = entry_gets.clone();
        let base = spawn_server(move |request| {
            if request.method == "GET" && request.path.contains("entry.nexa") {
                counter.fetch_add(1, Ordering::SeqCst);
                return StubResponse {
                    status: "503 Service Unavailable",
                    content_type: "text/plain",
                    body: b"down".to_vec(),
                };
            }
            serve_spec_files(request)
        });
        let spec = remote_spec(&base);

        let error = downloader(&root).download(&spec, |_| {}).unwrap_err();
        assert_eq!(entry_gets.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
        let message = format!("{error:#}");
        assert!(message.contains("entry.nexa"), "unexpected error: {message}");
        assert!(message.contains("4 attempts"), "unexpected error: {message}");
    }

    #[test]
    fn html_content_type_on_data_file_is_rejected() {
        let root = TempDir::new().unwrap();
        let base = spawn_server(|request| {
            if request.method == "GET" && request.path.contains("entry.nexa") {
                return StubResponse {
                    status: "200 OK",
                    content_type: "text/html",
                    body: b"<html><body>Too Many Requests</body></html>".to_vec(),
                };
            }
            serve_spec_files(request)
        });
        let spec = remote_spec(&base);

        let error = downloader(&root).download(&spec, |_| {}).unwrap_err();
        let message = format!("{error:#}");
        assert!(message.contains("text/html"), "unexpected error: {message}");
    }

    #[test]
    fn failed_size_probe_still_reaches_full_percent() {
        let root = TempDir::new().unwrap();
        let base = spawn_server(|request| {
            if request.method == "HEAD" && request.path.contains("entry.nexa") {
                return StubResponse {
                    status: "500 Internal Server Error",
                    content_type: "text/plain",
                    body: Vec::new(),
                };
            }
            serve_spec_files(request)
        });
        let spec = remote_spec(&base);

        let mut events = Vec::new();
        downloader(&root)
            .download(&spec, |event| events.push(event))
            .unwrap();

        assert!(events
            .windows(2)
            .all(|pair| pair[0].overall_percent <= pair[1].overall_percent));
        assert_eq!(events.last().unwrap().overall_percent, 100.0);
    }
}
