use issuebank_common::parse_flag;
use serde::Deserialize;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::archive::DEFAULT_BUCKET;
use crate::dataset::{DEFAULT_DATASET, DEFAULT_SPLITS};
use crate::error::ConfigError;
use crate::obfuscate::OpenAiConfig;
use crate::rotation::RotationConfig;
use crate::storage::StorageConfig;
use crate::store::DEFAULT_TABLE;

const DEFAULT_CONFIG_PATH: &str = "task-service.toml";
const DEFAULT_RPC_URL: &str = "https://entrypoint-finney.opentensor.ai:443";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres { database_url: String, table: String },
    Memory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatasetSourceKind {
    HuggingFace,
    JsonLines(PathBuf),
}

#[derive(Clone, Debug)]
pub struct DatasetConfig {
    pub source: DatasetSourceKind,
    pub name: String,
    pub config: String,
    pub splits: Vec<String>,
    pub page_size: u64,
}

#[derive(Clone, Debug)]
pub struct HeightConfig {
    pub rpc_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub port: u16,
    pub store: StoreBackend,
    pub import_on_start: bool,
    pub dataset: DatasetConfig,
    pub rotation: RotationConfig,
    pub openai: Option<OpenAiConfig>,
    pub height: HeightConfig,
    pub storage: StorageConfig,
    pub github_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    port: Option<u16>,
    database_url: Option<String>,
    database_table: Option<String>,
    store_backend: Option<String>,
    import_on_start: Option<bool>,
    dataset_source: Option<String>,
    dataset_name: Option<String>,
    dataset_config: Option<String>,
    dataset_splits: Option<Vec<String>>,
    dataset_page_size: Option<u64>,
    update_length: Option<u64>,
    poll_interval_secs: Option<u64>,
    error_backoff_secs: Option<u64>,
    openai_api_key: Option<String>,
    openai_base_url: Option<String>,
    openai_model: Option<String>,
    openai_timeout_secs: Option<u64>,
    subtensor_rpc_url: Option<String>,
    height_source_token: Option<String>,
    height_timeout_secs: Option<u64>,
    archive_bucket: Option<String>,
    s3_endpoint: Option<String>,
    s3_access_key: Option<String>,
    s3_secret_key: Option<String>,
    s3_region: Option<String>,
    s3_force_path_style: Option<bool>,
    github_token: Option<String>,
}

struct Lookup<'a> {
    env: &'a dyn Fn(&str) -> Option<String>,
}

impl Lookup<'_> {
    fn text(&self, key: &str, file: Option<String>) -> Option<String> {
        (self.env)(key)
            .or(file)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parsed<T: FromStr>(
        &self,
        key: &'static str,
        file: Option<T>,
    ) -> Result<Option<T>, ConfigError> {
        match (self.env)(key) {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| ConfigError::Invalid { key, value: raw }),
            None => Ok(file),
        }
    }

    fn flag(&self, key: &'static str, file: Option<bool>) -> Result<Option<bool>, ConfigError> {
        match (self.env)(key) {
            Some(raw) => match parse_flag(&raw) {
                Some(flag) => Ok(Some(flag)),
                None => Err(ConfigError::Invalid { key, value: raw }),
            },
            None => Ok(file),
        }
    }
}

impl ServiceConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = env::var("TASK_SERVICE_CONFIG").ok().map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let file = if explicit.is_some() || path.exists() {
            let content = std::fs::read_to_string(&path)?;
            toml::from_str::<FileConfig>(&content)?
        } else {
            FileConfig::default()
        };
        Self::from_sources(file, &|key: &str| env::var(key).ok())
    }

    pub fn from_sources(
        file: FileConfig,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let lookup = Lookup { env };

        let store = match lookup
            .text("STORE_BACKEND", file.store_backend)
            .as_deref()
            .unwrap_or("postgres")
        {
            "postgres" => StoreBackend::Postgres {
                database_url: lookup
                    .text("DATABASE_URL", file.database_url)
                    .ok_or(ConfigError::Missing("DATABASE_URL"))?,
                table: lookup
                    .text("DATABASE_TABLE", file.database_table)
                    .unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            },
            "memory" => StoreBackend::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    key: "STORE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let source = match lookup.text("DATASET_SOURCE", file.dataset_source) {
            None => DatasetSourceKind::HuggingFace,
            Some(value) if value == "huggingface" => DatasetSourceKind::HuggingFace,
            Some(path) => DatasetSourceKind::JsonLines(PathBuf::from(path)),
        };
        let splits = match (lookup.env)("DATASET_SPLITS") {
            Some(raw) => raw
                .split(',')
                .map(|split| split.trim().to_string())
                .filter(|split| !split.is_empty())
                .collect(),
            None => file
                .dataset_splits
                .unwrap_or_else(|| DEFAULT_SPLITS.iter().map(|split| split.to_string()).collect()),
        };
        let dataset = DatasetConfig {
            source,
            name: lookup
                .text("DATASET_NAME", file.dataset_name)
                .unwrap_or_else(|| DEFAULT_DATASET.to_string()),
            config: lookup
                .text("DATASET_CONFIG", file.dataset_config)
                .unwrap_or_else(|| "default".to_string()),
            splits,
            page_size: lookup
                .parsed("DATASET_PAGE_SIZE", file.dataset_page_size)?
                .unwrap_or(100),
        };

        let defaults = RotationConfig::default();
        let rotation = RotationConfig {
            threshold: lookup
                .parsed("UPDATE_LENGTH", file.update_length)?
                .unwrap_or(defaults.threshold),
            poll_interval: lookup
                .parsed("POLL_INTERVAL_SECS", file.poll_interval_secs)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            error_backoff: lookup
                .parsed("ERROR_BACKOFF_SECS", file.error_backoff_secs)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.error_backoff),
        };

        let openai_timeout = lookup
            .parsed("OPENAI_TIMEOUT_SECS", file.openai_timeout_secs)?
            .unwrap_or(60);
        let openai = lookup
            .text("OPENAI_API_KEY", file.openai_api_key)
            .map(|api_key| OpenAiConfig {
                api_key,
                base_url: lookup
                    .text("OPENAI_BASE_URL", file.openai_base_url)
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                model: lookup
                    .text("OPENAI_MODEL", file.openai_model)
                    .unwrap_or_else(|| "gpt-3.5-turbo".to_string()),
                timeout: Duration::from_secs(openai_timeout),
            });

        let height = HeightConfig {
            rpc_url: lookup
                .text("SUBTENSOR_RPC_URL", file.subtensor_rpc_url)
                .unwrap_or_else(|| DEFAULT_RPC_URL.to_string()),
            token: lookup.text("HEIGHT_SOURCE_TOKEN", file.height_source_token),
            timeout: Duration::from_secs(
                lookup
                    .parsed("HEIGHT_TIMEOUT_SECS", file.height_timeout_secs)?
                    .unwrap_or(10),
            ),
        };

        let storage = StorageConfig {
            endpoint: lookup.text("S3_ENDPOINT", file.s3_endpoint),
            access_key: lookup.text("S3_ACCESS_KEY", file.s3_access_key),
            secret_key: lookup.text("S3_SECRET_KEY", file.s3_secret_key),
            bucket: lookup
                .text("ARCHIVE_BUCKET", file.archive_bucket)
                .unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            region: lookup
                .text("S3_REGION", file.s3_region)
                .unwrap_or_else(|| "us-east-1".to_string()),
            force_path_style: lookup
                .flag("S3_FORCE_PATH_STYLE", file.s3_force_path_style)?
                .unwrap_or(false),
        };

        Ok(Self {
            port: lookup.parsed("PORT", file.port)?.unwrap_or(8080),
            store,
            import_on_start: lookup
                .flag("IMPORT_ON_START", file.import_on_start)?
                .unwrap_or(false),
            dataset,
            rotation,
            openai,
            height,
            storage,
            github_token: lookup.text("GITHUB_TOKEN", file.github_token),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with_env(vars: &[(&str, &str)], file: FileConfig) -> Result<ServiceConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        ServiceConfig::from_sources(file, &|key: &str| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_rotation_contract() {
        let config = with_env(&[("STORE_BACKEND", "memory")], FileConfig::default()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.rotation.threshold, 5);
        assert_eq!(config.rotation.poll_interval, Duration::from_secs(2));
        assert_eq!(config.rotation.error_backoff, Duration::from_secs(5));
        assert_eq!(config.dataset.source, DatasetSourceKind::HuggingFace);
        assert_eq!(config.dataset.splits, vec!["train", "dev", "test", "validation"]);
        assert_eq!(config.storage.bucket, "codeatcommits");
        assert!(config.openai.is_none());
        assert!(!config.import_on_start);
    }

    #[test]
    fn postgres_requires_database_url() {
        let err = with_env(&[], FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));

        let config = with_env(
            &[("DATABASE_URL", "postgres://issuebank@localhost/issuebank")],
            FileConfig::default(),
        )
        .unwrap();
        assert_eq!(
            config.store,
            StoreBackend::Postgres {
                database_url: "postgres://issuebank@localhost/issuebank".to_string(),
                table: "benchmark_entries".to_string(),
            }
        );
    }

    #[test]
    fn environment_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            store_backend = "memory"
            update_length = 10
            poll_interval_secs = 3
            openai_api_key = "from-file"
            dataset_splits = ["test"]
            "#,
        )
        .unwrap();
        let config = with_env(
            &[("UPDATE_LENGTH", "7"), ("OPENAI_MODEL", "gpt-4o-mini")],
            file,
        )
        .unwrap();
        assert_eq!(config.rotation.threshold, 7);
        assert_eq!(config.rotation.poll_interval, Duration::from_secs(3));
        assert_eq!(config.dataset.splits, vec!["test"]);
        let openai = config.openai.unwrap();
        assert_eq!(openai.api_key, "from-file");
        assert_eq!(openai.model, "gpt-4o-mini");
    }

    #[test]
    fn rejects_invalid_values() {
        let err = with_env(
            &[("STORE_BACKEND", "memory"), ("POLL_INTERVAL_SECS", "soon")],
            FileConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "POLL_INTERVAL_SECS", .. }));

        let err = with_env(&[("STORE_BACKEND", "sqlite")], FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "STORE_BACKEND", .. }));
    }

    #[test]
    fn dataset_file_source() {
        let config = with_env(
            &[
                ("STORE_BACKEND", "memory"),
                ("DATASET_SOURCE", "/data/swebench.jsonl"),
                ("DATASET_SPLITS", "dev, test"),
            ],
            FileConfig::default(),
        )
        .unwrap();
        assert_eq!(
            config.dataset.source,
            DatasetSourceKind::JsonLines(PathBuf::from("/data/swebench.jsonl"))
        );
        assert_eq!(config.dataset.splits, vec!["dev", "test"]);
    }
}
