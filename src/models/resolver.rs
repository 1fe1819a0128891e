use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::{ProjectDirs, UserDirs};

use super::spec::ModelSpec;

/// Markers that indicate a failed transfer served with a success status.
/// Certain hosts answer rate-limited or missing-file requests with HTTP 200
/// and an HTML or LFS-pointer body, so status-code validation alone is not
/// enough.
const ERROR_PAGE_MARKERS: &[&str] = &[
    "<html",
    "access denied",
    "forbidden",
    "too many requests",
    "rate limit",
    "not found",
    "expired",
    "error",
    "version https://git-lfs.github.com",
];

/// Files larger than this are never sniffed; a real weight shard is
/// multi-gigabyte while a disguised error page is tiny.
const SNIFF_MAX_LEN: u64 = 1024 * 1024;
const SNIFF_BYTES: usize = 4096;

/// Where a complete, valid copy of a model's files can be obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    AlreadyLocal,
    ExternalStaged(PathBuf),
    Bundled(PathBuf),
    RemoteRequired,
}

/// Filesystem roots the resolver searches, in priority order. Built once at
/// startup; individual resolutions always re-read the disk because downloads
/// and external mounts change state between calls.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    models_root: PathBuf,
    staging_roots: Vec<PathBuf>,
    bundled_root: Option<PathBuf>,
}

impl StoragePaths {
    pub fn new(
        models_root: PathBuf,
        staging_roots: Vec<PathBuf>,
        bundled_root: Option<PathBuf>,
    ) -> Self {
        Self {
            models_root,
            staging_roots,
            bundled_root,
        }
    }

    /// Default layout: app data dir for downloads, app-external and public
    /// `LifeLens/models` directories as side-loading staging areas.
    pub fn resolve_default() -> Result<Self> {
        let project_dirs = ProjectDirs::from("com", "LifeLens", "LifeLens")
            .context("missing project directories")?;
        let models_root = project_dirs.data_dir().join("models");
        fs::create_dir_all(&models_root).context("create models dir")?;

        let mut staging_roots = vec![project_dirs.data_local_dir().join("models")];
        if let Some(user_dirs) = UserDirs::new() {
            staging_roots.push(user_dirs.home_dir().join("LifeLens").join("models"));
        }

        Ok(Self {
            models_root,
            staging_roots,
            bundled_root: None,
        })
    }

    /// Points the resolver at packaged assets once the app handle knows its
    /// resource directory.
    pub fn set_bundled_root(&mut self, root: PathBuf) {
        self.bundled_root = Some(root);
    }

    #[must_use]
    pub fn model_dir(&self, spec_id: &str) -> PathBuf {
        self.models_root.join(spec_id)
    }

    #[must_use]
    pub fn staging_dirs(&self, spec_id: &str) -> Vec<PathBuf> {
        self.staging_roots
            .iter()
            .map(|root| root.join(spec_id))
            .collect()
    }

    #[must_use]
    pub fn bundled_dir(&self, spec_id: &str) -> Option<PathBuf> {
        self.bundled_root
            .as_ref()
            .map(|root| root.join("models").join(spec_id))
    }
}

/// Returns the subset of `spec.files` that is absent from `dir` or fails the
/// integrity heuristic, in spec order.
pub fn list_missing_or_invalid(spec: &ModelSpec, dir: &Path) -> Vec<String> {
    spec.files
        .iter()
        .filter(|file| file_is_invalid(&dir.join(file.as_str())))
        .cloned()
        .collect()
}

/// A file is invalid when it is missing, empty, or looks like an error page
/// that was written to disk as if it were model data.
pub fn file_is_invalid(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return true;
    };
    if !metadata.is_file() || metadata.len() == 0 {
        return true;
    }
    looks_like_error_page(path, metadata.len())
}

fn looks_like_error_page(path: &Path, len: u64) -> bool {
    if len >= SNIFF_MAX_LEN {
        return false;
    }
    let is_nexa = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("nexa"))
        .unwrap_or(false);
    if !is_nexa {
        return false;
    }

    let Ok(mut file) = File::open(path) else {
        return true;
    };
    let mut head = vec![0u8; SNIFF_BYTES.min(len as usize)];
    if file.read_exact(&mut head).is_err() {
        return true;
    }

    // Binary content never matches; only textual heads are sniffed.
    let Ok(text) = std::str::from_utf8(&head) else {
        return false;
    };
    let lowered = text.to_ascii_lowercase();
    ERROR_PAGE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Picks the cheapest complete source for a spec's files. Resolution never
/// fails; when nothing matches, the caller must fetch remotely.
pub fn resolve(spec: &ModelSpec, paths: &StoragePaths) -> ResolvedSource {
    if list_missing_or_invalid(spec, &paths.model_dir(&spec.id)).is_empty() {
        return ResolvedSource::AlreadyLocal;
    }

    for staged in paths.staging_dirs(&spec.id) {
        if staged.is_dir() && list_missing_or_invalid(spec, &staged).is_empty() {
            return ResolvedSource::ExternalStaged(staged);
        }
    }

    if let Some(bundled) = paths.bundled_dir(&spec.id) {
        if bundled.is_dir() && list_missing_or_invalid(spec, &bundled).is_empty() {
            return ResolvedSource::Bundled(bundled);
        }
    }

    ResolvedSource::RemoteRequired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::spec::MANIFEST_FILE;
    use std::io::Write;
    use tempfile::TempDir;

    fn test_spec() -> ModelSpec {
        ModelSpec {
            id: "test-vlm".into(),
            display_name: "Test VLM".into(),
            base_url: "https://example.test/models/test-vlm/resolve/main".into(),
            files: vec![MANIFEST_FILE.into(), "entry.nexa".into()],
            entry_file: "entry.nexa".into(),
            mmproj_file: None,
        }
    }

    fn write_file(dir: &Path, name: &str, contents: &[u8]) {
        let mut file = File::create(dir.join(name)).unwrap();
        file.write_all(contents).unwrap();
    }

    fn write_valid_set(dir: &Path, spec: &ModelSpec) {
        for name in &spec.files {
            write_file(dir, name, b"\x00\x01binary weights payload");
        }
    }

    #[test]
    fn missing_and_empty_files_are_listed() {
        let dir = TempDir::new().unwrap();
        let spec = test_spec();
        write_file(dir.path(), MANIFEST_FILE, b"{}");
        write_file(dir.path(), "entry.nexa", b"");

        let missing = list_missing_or_invalid(&spec, dir.path());
        assert_eq!(missing, vec!["entry.nexa".to_string()]);
    }

    #[test]
    fn complete_valid_set_yields_empty_list() {
        let dir = TempDir::new().unwrap();
        let spec = test_spec();
        write_valid_set(dir.path(), &spec);
        assert!(list_missing_or_invalid(&spec, dir.path()).is_empty());
    }

    #[test]
    fn disguised_html_error_page_is_invalid_despite_nonzero_length() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "entry.nexa",
            b"<html><body>Forbidden</body></html>",
        );
        assert!(file_is_invalid(&dir.path().join("entry.nexa")));
    }

    #[test]
    fn lfs_pointer_is_invalid() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "entry.nexa",
            b"version https://git-lfs.github.com/spec/v1\noid sha256:abc\nsize 123\n",
        );
        assert!(file_is_invalid(&dir.path().join("entry.nexa")));
    }

    #[test]
    fn small_binary_nexa_file_is_valid() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "entry.nexa", &[0u8, 159, 146, 150, 7, 9]);
        assert!(!file_is_invalid(&dir.path().join("entry.nexa")));
    }

    #[test]
    fn error_markers_only_apply_to_nexa_files() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "notes.txt", b"<html>error</html>");
        assert!(!file_is_invalid(&dir.path().join("notes.txt")));
    }

    #[test]
    fn large_nexa_file_is_never_sniffed() {
        let dir = TempDir::new().unwrap();
        let mut payload = b"<html>".to_vec();
        payload.resize(SNIFF_MAX_LEN as usize + 1, b'x');
        write_file(dir.path(), "entry.nexa", &payload);
        assert!(!file_is_invalid(&dir.path().join("entry.nexa")));
    }

    #[test]
    fn resolve_prefers_local_then_staged_then_bundled() {
        let local = TempDir::new().unwrap();
        let staged = TempDir::new().unwrap();
        let bundled = TempDir::new().unwrap();
        let spec = test_spec();

        let mut paths = StoragePaths::new(
            local.path().to_path_buf(),
            vec![staged.path().to_path_buf()],
            None,
        );
        paths.set_bundled_root(bundled.path().to_path_buf());

        assert_eq!(resolve(&spec, &paths), ResolvedSource::RemoteRequired);

        let bundled_dir = bundled.path().join("models").join(&spec.id);
        fs::create_dir_all(&bundled_dir).unwrap();
        write_valid_set(&bundled_dir, &spec);
        assert_eq!(
            resolve(&spec, &paths),
            ResolvedSource::Bundled(bundled_dir.clone())
        );

        let staged_dir = staged.path().join(&spec.id);
        fs::create_dir_all(&staged_dir).unwrap();
        write_valid_set(&staged_dir, &spec);
        assert_eq!(
            resolve(&spec, &paths),
            ResolvedSource::ExternalStaged(staged_dir)
        );

        let local_dir = paths.model_dir(&spec.id);
        fs::create_dir_all(&local_dir).unwrap();
        write_valid_set(&local_dir, &spec);
        assert_eq!(resolve(&spec, &paths), ResolvedSource::AlreadyLocal);
    }

    #[test]
    fn staged_set_with_invalid_member_is_skipped() {
        let local = TempDir::new().unwrap();
        let staged = TempDir::new().unwrap();
        let spec = test_spec();

        let staged_dir = staged.path().join(&spec.id);
        fs::create_dir_all(&staged_dir).unwrap();
        write_file(&staged_dir, MANIFEST_FILE, b"{}");
        write_file(&staged_dir, "entry.nexa", b"<html>rate limit</html>");

        let paths = StoragePaths::new(
            local.path().to_path_buf(),
            vec![staged.path().to_path_buf()],
            None,
        );
        assert_eq!(resolve(&spec, &paths), ResolvedSource::RemoteRequired);
    }
}
