use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Conventional name of the metadata file shipped alongside model weights.
pub const MANIFEST_FILE: &str = "nexa.manifest";

/// Immutable descriptor of a downloadable vision-language model.
///
/// `entry_file` is the file handed to the engine to start loading; any
/// remaining files are weights or attachments the engine picks up from the
/// same directory. `mmproj_file`, when present, enables image projection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub id: String,
    pub display_name: String,
    pub base_url: String,
    pub files: Vec<String>,
    pub entry_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmproj_file: Option<String>,
}

impl ModelSpec {
    /// Remote URL for one of the spec's files.
    #[must_use]
    pub fn file_url(&self, file: &str) -> String {
        format!("{}/{}?download=true", self.base_url.trim_end_matches('/'), file)
    }

    /// Name of the manifest member, if the spec ships one.
    #[must_use]
    pub fn manifest_file(&self) -> Option<&str> {
        self.files
            .iter()
            .find(|name| name.as_str() == MANIFEST_FILE)
            .map(String::as_str)
    }

    /// Checks the structural invariant: entry and mmproj are members of `files`.
    pub fn validate(&self) -> Result<()> {
        if !self.files.iter().any(|file| file == &self.entry_file) {
            return Err(anyhow!(
                "spec {}: entry file {} is not listed in files",
                self.id,
                self.entry_file
            ));
        }
        if let Some(mmproj) = &self.mmproj_file {
            if !self.files.iter().any(|file| file == mmproj) {
                return Err(anyhow!(
                    "spec {}: mmproj file {} is not listed in files",
                    self.id,
                    mmproj
                ));
            }
        }
        Ok(())
    }
}

pub fn default_specs() -> Vec<ModelSpec> {
    vec![
        ModelSpec {
            id: "omnineural-4b".into(),
            display_name: "OmniNeural 4B".into(),
            base_url: "https://huggingface.co/NexaAI/OmniNeural-4B/resolve/main".into(),
            files: vec![
                MANIFEST_FILE.into(),
                "model.nexa".into(),
                "mmproj.nexa".into(),
                "weights-00001-of-00002.nexa".into(),
                "weights-00002-of-00002.nexa".into(),
            ],
            entry_file: "model.nexa".into(),
            mmproj_file: Some("mmproj.nexa".into()),
        },
        ModelSpec {
            id: "smolvlm2-2.2b-instruct".into(),
            display_name: "SmolVLM2 2.2B Instruct".into(),
            base_url: "https://huggingface.co/ggml-org/SmolVLM2-2.2B-Instruct-GGUF/resolve/main"
                .into(),
            files: vec![
                "SmolVLM2-2.2B-Instruct-Q4_K_M.gguf".into(),
                "mmproj-SmolVLM2-2.2B-Instruct-f16.gguf".into(),
            ],
            entry_file: "SmolVLM2-2.2B-Instruct-Q4_K_M.gguf".into(),
            mmproj_file: Some("mmproj-SmolVLM2-2.2B-Instruct-f16.gguf".into()),
        },
    ]
}

pub fn find_spec(id: &str) -> Option<ModelSpec> {
    default_specs().into_iter().find(|spec| spec.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_specs_are_structurally_valid() {
        for spec in default_specs() {
            spec.validate().expect("default spec invalid");
        }
    }

    #[test]
    fn file_url_appends_download_marker() {
        let spec = &default_specs()[0];
        let url = spec.file_url("model.nexa");
        assert!(url.ends_with("/model.nexa?download=true"));
        assert!(url.starts_with("https://"));
    }

    #[test]
    fn validate_rejects_unlisted_entry_file() {
        let mut spec = default_specs()[0].clone();
        spec.entry_file = "not-a-member.nexa".into();
        assert!(spec.validate().is_err());
    }
}
