use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::{collections::VecDeque, path::PathBuf, time::Duration};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use crate::error::ImportError;
use crate::models::BenchmarkEntry;
use crate::store::RowStore;

pub const DEFAULT_DATASET: &str = "princeton-nlp/SWE-bench_oracle";
pub const DEFAULT_SPLITS: [&str; 4] = ["train", "dev", "test", "validation"];
const DATASETS_SERVER_URL: &str = "https://datasets-server.huggingface.co";

#[async_trait]
pub trait DatasetSource: Send {
    async fn next_batch(&mut self) -> Result<Option<Vec<BenchmarkEntry>>, ImportError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub rows: u64,
    pub batches: u64,
}

pub async fn import_all(
    store: &dyn RowStore,
    source: &mut dyn DatasetSource,
) -> Result<ImportSummary, ImportError> {
    store.ensure_schema().await?;
    let mut summary = ImportSummary::default();
    while let Some(batch) = source.next_batch().await? {
        if batch.is_empty() {
            continue;
        }
        store.upsert_entries(&batch).await?;
        summary.rows += batch.len() as u64;
        summary.batches += 1;
        if summary.batches % 20 == 0 {
            tracing::info!(rows = summary.rows, "import progress");
        }
    }
    tracing::info!(rows = summary.rows, batches = summary.batches, "dataset import finished");
    Ok(summary)
}

pub struct HuggingFaceRowsSource {
    client: Client,
    base_url: String,
    dataset: String,
    config: String,
    splits: VecDeque<String>,
    offset: u64,
    page_size: u64,
}

#[derive(Deserialize)]
struct RowsPage {
    #[serde(default)]
    rows: Vec<RowEnvelope>,
    num_rows_total: Option<u64>,
}

#[derive(Deserialize)]
struct RowEnvelope {
    row_idx: u64,
    row: serde_json::Value,
    #[serde(default)]
    truncated_cells: Vec<String>,
}

impl HuggingFaceRowsSource {
    pub fn new(
        dataset: impl Into<String>,
        config: impl Into<String>,
        splits: Vec<String>,
        page_size: u64,
    ) -> Result<Self, ImportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: DATASETS_SERVER_URL.to_string(),
            dataset: dataset.into(),
            config: config.into(),
            splits: splits.into(),
            offset: 0,
            // The rows endpoint caps pages at 100.
            page_size: page_size.clamp(1, 100),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn fetch_page(&self, split: &str) -> Result<RowsPage, ImportError> {
        let url = format!("{}/rows", self.base_url.trim_end_matches('/'));
        let offset = self.offset.to_string();
        let length = self.page_size.to_string();
        let response = self
            .client
            .get(url)
            .query(&[
                ("dataset", self.dataset.as_str()),
                ("config", self.config.as_str()),
                ("split", split),
                ("offset", offset.as_str()),
                ("length", length.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ImportError::Status {
                split: split.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl DatasetSource for HuggingFaceRowsSource {
    async fn next_batch(&mut self) -> Result<Option<Vec<BenchmarkEntry>>, ImportError> {
        loop {
            let Some(split) = self.splits.front().cloned() else {
                return Ok(None);
            };
            let page = self.fetch_page(&split).await?;
            let total = page.num_rows_total.unwrap_or(u64::MAX);
            if page.rows.is_empty() || self.offset >= total {
                tracing::info!(split = %split, rows = self.offset, "split imported");
                self.splits.pop_front();
                self.offset = 0;
                continue;
            }

            self.offset += page.rows.len() as u64;
            let entries = page
                .rows
                .into_iter()
                .map(|envelope| {
                    let position = format!("{split}:{}", envelope.row_idx);
                    // A truncated patch or statement would be served corrupted.
                    if !envelope.truncated_cells.is_empty() {
                        return Err(ImportError::Parse {
                            position,
                            message: format!(
                                "truncated cells: {}",
                                envelope.truncated_cells.join(", ")
                            ),
                        });
                    }
                    serde_json::from_value::<BenchmarkEntry>(envelope.row).map_err(|err| {
                        ImportError::Parse {
                            position,
                            message: err.to_string(),
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            if self.offset >= total {
                tracing::info!(split = %split, rows = self.offset, "split imported");
                self.splits.pop_front();
                self.offset = 0;
            }
            return Ok(Some(entries));
        }
    }
}

pub struct JsonLinesSource {
    path: PathBuf,
    lines: Option<Lines<BufReader<tokio::fs::File>>>,
    line_number: u64,
    batch_size: usize,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>, batch_size: usize) -> Self {
        Self {
            path: path.into(),
            lines: None,
            line_number: 0,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl DatasetSource for JsonLinesSource {
    async fn next_batch(&mut self) -> Result<Option<Vec<BenchmarkEntry>>, ImportError> {
        if self.lines.is_none() {
            let file = tokio::fs::File::open(&self.path).await?;
            self.lines = Some(BufReader::new(file).lines());
        }
        let Some(lines) = self.lines.as_mut() else {
            return Ok(None);
        };

        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            let Some(line) = lines.next_line().await? else {
                break;
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str::<BenchmarkEntry>(&line).map_err(|err| {
                ImportError::Parse {
                    position: format!("{}:{}", self.path.display(), self.line_number),
                    message: err.to_string(),
                }
            })?;
            batch.push(entry);
        }

        Ok(if batch.is_empty() { None } else { Some(batch) })
    }
}
