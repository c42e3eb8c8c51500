use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SignError};

/// Fixed storage key for the persisted configuration.
pub const STORAGE_KEY: &str = "parallel_signing_form_data";

/// Overrides the directory the configuration is stored in.
pub const HOME_ENV: &str = "PARALLEL_SIGN_HOME";

pub const DEFAULT_NUM_SIGNATURES: i64 = 10;

/// How requests are stamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StamperType {
    /// Stamp directly with the configured API key pair.
    #[serde(rename = "API_KEY")]
    ApiKey,
    /// Inject the API key into an isolated context and stamp through it.
    #[serde(rename = "IFRAME")]
    Iframe,
    /// No choice made yet, or a value this version does not know.
    /// Resolved as [`StamperType::Iframe`] at run time.
    #[default]
    #[serde(rename = "", other)]
    Unset,
}

impl StamperType {
    pub fn is_delegated(self) -> bool {
        !matches!(self, StamperType::ApiKey)
    }
}

/// User-supplied configuration, stored verbatim between sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    #[serde(default)]
    pub organization_id: String,

    #[serde(default)]
    pub api_public_key: String,

    #[serde(default)]
    pub api_private_key: String,

    #[serde(default)]
    pub sign_with: String,

    #[serde(
        default = "default_num_signatures",
        deserialize_with = "de_i64_from_number_or_string"
    )]
    pub num_signatures: i64,

    #[serde(default)]
    pub stamper_type: StamperType,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            organization_id: String::new(),
            api_public_key: String::new(),
            api_private_key: String::new(),
            sign_with: String::new(),
            num_signatures: DEFAULT_NUM_SIGNATURES,
            stamper_type: StamperType::Unset,
        }
    }
}

impl Configuration {
    /// Number of requests a run issues. Non-positive counts are an empty run.
    pub fn request_count(&self) -> usize {
        usize::try_from(self.num_signatures.max(0)).unwrap_or(0)
    }

    /// Copy with the private key replaced by a mask, for display.
    pub fn masked(&self) -> Self {
        let mut out = self.clone();
        if !out.api_private_key.is_empty() {
            out.api_private_key = "*".repeat(out.api_private_key.len().min(16));
        }
        out
    }
}

fn default_num_signatures() -> i64 {
    DEFAULT_NUM_SIGNATURES
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    I64(i64),
    F64(f64),
    Str(String),
}

fn de_i64_from_number_or_string<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::I64(i) => Ok(i),
        StringOrNumber::F64(f) => Ok(f.trunc() as i64),
        StringOrNumber::Str(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(0);
            }
            trimmed.parse::<i64>().map_err(|_| {
                serde::de::Error::custom(format!(
                    "numSignatures must be an integer (got '{s}')"
                ))
            })
        }
    }
}

/// Client-local key-value storage for the configuration.
///
/// One JSON document named after [`STORAGE_KEY`] inside `dir`.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at `$PARALLEL_SIGN_HOME`, then `$HOME/.parallel-sign`,
    /// then `./.parallel-sign`.
    pub fn from_env() -> Self {
        if let Some(dir) = env::var_os(HOME_ENV) {
            return Self::new(PathBuf::from(dir));
        }
        let base = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join(".parallel-sign"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{STORAGE_KEY}.json"))
    }

    /// Read the stored configuration, or the defaults when nothing is stored.
    pub fn load(&self) -> Result<Configuration> {
        let path = self.path();
        if !path.exists() {
            return Ok(Configuration::default());
        }
        let raw = fs::read_to_string(&path).map_err(|err| {
            SignError::configuration(format!("failed to read '{}': {err}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            SignError::configuration(format!("failed to parse '{}': {err}", path.display()))
        })
    }

    pub fn save(&self, config: &Configuration) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            SignError::configuration(format!(
                "failed to create config directory '{}': {err}",
                self.dir.display()
            ))
        })?;
        let path = self.path();
        let json = serde_json::to_string_pretty(config)
            .map_err(|err| SignError::configuration(format!("failed to encode config: {err}")))?;
        fs::write(&path, json).map_err(|err| {
            SignError::configuration(format!("failed to write '{}': {err}", path.display()))
        })
    }

    /// Load, apply one edit, and write the result back.
    pub fn update<F>(&self, edit: F) -> Result<Configuration>
    where
        F: FnOnce(&mut Configuration),
    {
        let mut config = self.load()?;
        edit(&mut config);
        self.save(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_an_empty_form() {
        let cfg = Configuration::default();
        assert_eq!(cfg.num_signatures, 10);
        assert_eq!(cfg.stamper_type, StamperType::Unset);
        assert!(cfg.organization_id.is_empty());
    }

    #[test]
    fn parses_stored_form_with_string_count() {
        let raw = r#"{
            "organizationId": "org1",
            "apiPublicKey": "02ab",
            "apiPrivateKey": "cd",
            "signWith": "0xabc",
            "numSignatures": "25",
            "stamperType": "API_KEY"
        }"#;
        let cfg: Configuration = serde_json::from_str(raw).expect("parse");
        assert_eq!(cfg.num_signatures, 25);
        assert_eq!(cfg.stamper_type, StamperType::ApiKey);
        assert_eq!(cfg.sign_with, "0xabc");
    }

    #[test]
    fn rejects_non_numeric_count() {
        let raw = r#"{"numSignatures": "lots"}"#;
        let err = serde_json::from_str::<Configuration>(raw).unwrap_err();
        assert!(err.to_string().contains("numSignatures"), "{err}");
    }

    #[test]
    fn empty_stamper_type_is_unset_and_delegated() {
        let cfg: Configuration = serde_json::from_str(r#"{"stamperType": ""}"#).expect("parse");
        assert_eq!(cfg.stamper_type, StamperType::Unset);
        assert!(cfg.stamper_type.is_delegated());
        assert!(!StamperType::ApiKey.is_delegated());
    }

    #[test]
    fn unknown_stamper_type_falls_back_to_delegated() {
        let cfg: Configuration =
            serde_json::from_str(r#"{"organizationId": "org1", "stamperType": "PASSKEY"}"#)
                .expect("parse");
        assert_eq!(cfg.stamper_type, StamperType::Unset);
        assert!(cfg.stamper_type.is_delegated());
        assert_eq!(cfg.organization_id, "org1");
    }

    #[test]
    fn negative_count_is_an_empty_run() {
        let cfg = Configuration {
            num_signatures: -4,
            ..Configuration::default()
        };
        assert_eq!(cfg.request_count(), 0);
    }

    #[test]
    fn masked_hides_private_key() {
        let cfg = Configuration {
            api_private_key: "deadbeef".to_string(),
            ..Configuration::default()
        };
        let masked = cfg.masked();
        assert_eq!(masked.api_private_key, "********");
        assert_eq!(cfg.api_private_key, "deadbeef");
    }
}
