use std::{
    fs::{self, File},
    io::{BufReader, Read},
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Metadata shipped alongside model weights by the artifact publisher.
/// `preferred_backend`, when declared, overrides the caller's backend request
/// at session creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelManifest {
    pub model_name: Option<String>,
    pub model_type: Option<String>,
    pub preferred_backend: Option<String>,
}

/// Reads the manifest from disk. The file is JSON in current artifacts but
/// older publishes used loose `key: value` lines, so a lenient scan backs up
/// the strict parse. Absence or garbage both yield `None`.
pub fn read_manifest(path: &Path) -> Option<ModelManifest> {
    let raw = fs::read_to_string(path).ok()?;
    if let Ok(manifest) = serde_json::from_str::<ModelManifest>(&raw) {
        return Some(manifest);
    }
    parse_loose(&raw)
}

fn parse_loose(raw: &str) -> Option<ModelManifest> {
    let mut manifest = ModelManifest::default();
    let mut matched = false;
    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().trim_matches('"').to_ascii_lowercase();
        let value = value
            .trim()
            .trim_matches(|c| c == '"' || c == ',')
            .to_string();
        if value.is_empty() {
            continue;
        }
        match key.as_str() {
            "modelname" | "model_name" | "name" => {
                manifest.model_name = Some(value);
                matched = true;
            }
            "modeltype" | "model_type" | "type" => {
                manifest.model_type = Some(value);
                matched = true;
            }
            "preferredbackend" | "preferred_backend" | "backend" => {
                manifest.preferred_backend = Some(value);
                matched = true;
            }
            _ => {}
        }
    }
    matched.then_some(manifest)
}

pub fn compute_sha256(path: &Path) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer).context("hash read")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let hash = hasher.finalize();
    Ok(format!("{:x}", hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn json_manifest_parses() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nexa.manifest");
        fs::write(
            &path,
            r#"{"modelName": "OmniNeural 4B", "modelType": "vlm", "preferredBackend": "npu"}"#,
        )
        .unwrap();

        let manifest = read_manifest(&path).unwrap();
        assert_eq!(manifest.model_name.as_deref(), Some("OmniNeural 4B"));
        assert_eq!(manifest.preferred_backend.as_deref(), Some("npu"));
    }

    #[test]
    fn loose_key_value_manifest_parses() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nexa.manifest");
        fs::write(&path, "name: Test Model\nbackend: cpu_gpu\n").unwrap();

        let manifest = read_manifest(&path).unwrap();
        assert_eq!(manifest.model_name.as_deref(), Some("Test Model"));
        assert_eq!(manifest.preferred_backend.as_deref(), Some("cpu_gpu"));
    }

    #[test]
    fn garbage_manifest_yields_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nexa.manifest");
        fs::write(&path, "\x00\x01no structure here").unwrap();
        assert!(read_manifest(&path).is_none());
    }

    #[test]
    fn sha256_matches_known_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.nexa");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"abc").unwrap();
        drop(file);

        let digest = compute_sha256(&path).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
