use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Postgres {
        context: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },
    #[error("decode row failed: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn postgres(context: &'static str) -> impl FnOnce(tokio_postgres::Error) -> Self {
        move |source| Self::Postgres { context, source }
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("dataset request failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("dataset server returned {status} for split {split}")]
    Status { split: String, status: u16 },
    #[error("read dataset file failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse dataset row {position} failed: {message}")]
    Parse { position: String, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("no benchmark entries available after clearing consumed markers")]
    Exhausted,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ObfuscationError {
    #[error("rewrite request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("rewrite service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("rewrite service returned no content")]
    EmptyResponse,
}

#[derive(Debug, Error)]
pub enum HeightSourceError {
    #[error("height request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("height source returned {0}")]
    Status(u16),
    #[error("height source rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed block number: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Obfuscation(#[from] ObfuscationError),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct StorageError(pub String);

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("invalid repository reference: {0}")]
    InvalidRepository(String),
    #[error("archive download failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("archive download returned {status} for {url}")]
    Download { url: String, status: u16 },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("read config file failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse config file failed: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("dataset import failed: {0}")]
    Import(#[from] ImportError),
    #[error("row store is empty after import; no task can ever be served")]
    EmptyStore,
    #[error(transparent)]
    Obfuscation(#[from] ObfuscationError),
    #[error(transparent)]
    HeightSource(#[from] HeightSourceError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("archive storage: {0}")]
    Storage(#[from] StorageError),
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}
