mod download;
mod metadata;
mod resolver;
mod service;
mod spec;

#[allow(unused_imports)]
pub use download::{
    DownloadError, DownloadOutcome, DownloadProgress, ModelDownloader, MAX_ATTEMPTS,
};
#[allow(unused_imports)]
pub use metadata::{compute_sha256, read_manifest, ModelManifest};
#[allow(unused_imports)]
pub use resolver::{
    file_is_invalid, list_missing_or_invalid, resolve, ResolvedSource, StoragePaths,
};
pub use service::{DownloadJob, DownloadService, ModelState, ModelStatus, ModelStatusPayload};
#[allow(unused_imports)]
pub use spec::{default_specs, find_spec, ModelSpec, MANIFEST_FILE};
