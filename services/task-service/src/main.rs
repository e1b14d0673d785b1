mod app;
mod archive;
mod config;
mod dataset;
mod error;
mod handlers;
mod height;
mod models;
mod obfuscate;
mod publisher;
mod rotation;
mod selector;
mod state;
mod storage;
mod store;

use issuebank_common::{bind_listener, init_tracing, shutdown_signal, StopSignal};
use std::{process::ExitCode, sync::Arc};

use crate::archive::ArchiveJob;
use crate::config::{DatasetConfig, DatasetSourceKind, ServiceConfig, StoreBackend};
use crate::dataset::{
    import_all, DatasetSource, HuggingFaceRowsSource, ImportSummary, JsonLinesSource,
};
use crate::error::{ImportError, StartupError};
use crate::height::{HeightSource, SubstrateHeightSource};
use crate::obfuscate::{Obfuscator, OpenAiObfuscator, PassthroughObfuscator};
use crate::publisher::TaskPublisher;
use crate::rotation::{RotationPoller, RotationState};
use crate::selector::EntrySelector;
use crate::state::AppState;
use crate::storage::StorageClient;
use crate::store::{InMemoryRowStore, PostgresRowStore, RowStore};

#[tokio::main]
async fn main() -> ExitCode {
    let _guards = init_tracing("task-service");

    let archive_mode = std::env::args().nth(1).as_deref() == Some("archive");
    let result = match ServiceConfig::load() {
        Ok(config) if archive_mode => run_archive(config).await,
        Ok(config) => run_service(config).await,
        Err(err) => Err(err.into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "task-service exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run_service(config: ServiceConfig) -> Result<(), StartupError> {
    let store = prepare_store(&config).await?;

    let heights: Arc<dyn HeightSource> = Arc::new(SubstrateHeightSource::new(
        config.height.rpc_url.clone(),
        config.height.token.clone(),
        config.height.timeout,
    )?);
    let obfuscator: Arc<dyn Obfuscator> = match config.openai.clone() {
        Some(openai) => Arc::new(OpenAiObfuscator::new(openai)?),
        None => {
            tracing::warn!("OPENAI_API_KEY not set; serving problem statements unmodified");
            Arc::new(PassthroughObfuscator)
        }
    };

    let publisher = Arc::new(TaskPublisher::new());
    let rotation = Arc::new(RotationState::new());
    let poller = RotationPoller::new(
        config.rotation.clone(),
        rotation.clone(),
        publisher.clone(),
        EntrySelector::new(store),
        heights,
        obfuscator,
    );

    let mut updates = publisher.subscribe();
    tokio::spawn(async move {
        if updates.wait_for(Option::is_some).await.is_ok() {
            tracing::info!("first task published; /task is ready");
        }
    });

    let stop = StopSignal::new();
    let poller_handle = {
        let stop = stop.clone();
        tokio::spawn(async move { poller.run(stop).await })
    };

    let app = app::build_router(AppState {
        publisher,
        rotation,
    });
    let listener = bind_listener(config.port).await?;
    tracing::info!(port = config.port, "task-service listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    stop.stop();
    if let Err(err) = poller_handle.await {
        tracing::warn!(error = %err, "rotation poller ended abnormally");
    }
    served?;
    tracing::info!("task-service stopped");
    Ok(())
}

async fn run_archive(config: ServiceConfig) -> Result<(), StartupError> {
    let store = prepare_store(&config).await?;
    let storage = StorageClient::new(config.storage.clone()).await;
    storage.ensure_bucket().await?;
    tracing::info!(bucket = storage.bucket(), "archiving repository snapshots");

    let job = ArchiveJob::new(store, Arc::new(storage), config.github_token.clone())?;
    let summary = job.run().await?;
    if summary.failed > 0 {
        tracing::warn!(failed = summary.failed, "some snapshots were not archived");
    }
    Ok(())
}

async fn prepare_store(config: &ServiceConfig) -> Result<Arc<dyn RowStore>, StartupError> {
    let store: Arc<dyn RowStore> = match &config.store {
        StoreBackend::Postgres {
            database_url,
            table,
        } => Arc::new(PostgresRowStore::new(database_url.clone()).with_table(table.clone())),
        StoreBackend::Memory => Arc::new(InMemoryRowStore::new()),
    };
    store.ensure_schema().await?;

    let mut rows = store.count().await?;
    if rows == 0 || config.import_on_start {
        tracing::info!(rows, forced = config.import_on_start, "importing dataset");
        import_dataset(store.as_ref(), &config.dataset).await?;
        rows = store.count().await?;
    }
    // The poller cannot recover from an empty store, so refuse to boot.
    if rows == 0 {
        return Err(StartupError::EmptyStore);
    }
    tracing::info!(rows, "row store ready");
    Ok(store)
}

async fn import_dataset(
    store: &dyn RowStore,
    dataset: &DatasetConfig,
) -> Result<ImportSummary, ImportError> {
    let mut source: Box<dyn DatasetSource> = match &dataset.source {
        DatasetSourceKind::HuggingFace => Box::new(HuggingFaceRowsSource::new(
            dataset.name.clone(),
            dataset.config.clone(),
            dataset.splits.clone(),
            dataset.page_size,
        )?),
        DatasetSourceKind::JsonLines(path) => Box::new(JsonLinesSource::new(
            path.clone(),
            dataset.page_size as usize,
        )),
    };
    import_all(store, source.as_mut()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;

    fn memory_config(dataset: &std::path::Path) -> ServiceConfig {
        let dataset = dataset.display().to_string();
        ServiceConfig::from_sources(FileConfig::default(), &|key: &str| match key {
            "STORE_BACKEND" => Some("memory".to_string()),
            "DATASET_SOURCE" => Some(dataset.clone()),
            _ => None,
        })
        .unwrap()
    }

    fn dataset_file(name: &str, body: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "issuebank-boot-{}-{name}.jsonl",
            std::process::id()
        ));
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn empty_dataset_is_fatal_at_boot() {
        let path = dataset_file("empty", "");
        let result = prepare_store(&memory_config(&path)).await;
        assert!(matches!(result, Err(StartupError::EmptyStore)));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn boot_imports_into_empty_store() {
        let row = serde_json::json!({
            "instance_id": "pallets__flask-1",
            "repo": "pallets/flask",
            "base_commit": "abc123",
            "problem_statement": "crash on startup"
        });
        let path = dataset_file("one-row", &row.to_string());

        let store = prepare_store(&memory_config(&path)).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_dataset_is_fatal_at_boot() {
        let path = std::env::temp_dir().join("issuebank-boot-does-not-exist.jsonl");
        let result = prepare_store(&memory_config(&path)).await;
        assert!(matches!(result, Err(StartupError::Import(ImportError::Read(_)))));
    }
}
