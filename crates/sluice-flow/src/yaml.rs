//! DAG definition loader.
//!
//! Reads a directory of YAML files at boot, one DAG per file, and upserts
//! them into the store. A definition without an id takes the file stem.
//!
//! ```yaml
//! name: nightly-etl
//! vars:
//!   env:
//!     defaultValue: dev
//! tasks:
//!   - id: extract
//!     actionName: http-pull
//!   - id: load
//!     actionName: http-push
//!     dependOn: [extract]
//! ```

use std::path::Path;
use std::sync::Arc;

use sluice_core::DagId;

use crate::dag::Dag;
use crate::error::{Error, Result};
use crate::store::Store;

/// Loads every `*.yaml` / `*.yml` file under `dir` into the store.
///
/// Existing DAGs (by id) are replaced; new ones are created. Each file must
/// hold exactly one DAG definition.
///
/// # Errors
///
/// Fails on unreadable files, malformed YAML, or invalid task graphs.
pub async fn load_dags_from_dir(store: &Arc<dyn Store>, dir: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|err| Error::storage_with_source(format!("read dir {}", dir.display()), err))?;

    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| Error::storage_with_source("read dir entry", err))?
    {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if is_yaml {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| Error::storage_with_source(format!("read {}", path.display()), err))?;

        let mut dag: Dag = serde_yaml::from_str(&text).map_err(|err| {
            Error::storage_with_source(format!("unmarshal {} failed", path.display()), err)
        })?;

        if dag.id.is_empty() {
            let stem = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default();
            dag.id = DagId::from(stem);
        }

        ensure_dag_latest(store, &dag).await?;
    }
    Ok(())
}

/// Creates the DAG, or replaces it when it already exists.
async fn ensure_dag_latest(store: &Arc<dyn Store>, dag: &Dag) -> Result<()> {
    match store.get_dag(&dag.id).await {
        Ok(_) => store.update_dag(dag).await,
        Err(err) if err.is_not_found() => store.create_dag(dag).await,
        Err(err) => Err(err),
    }
}
