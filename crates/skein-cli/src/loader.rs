//! DAG definition loading.
//!
//! A `DagBag` is the set of DAGs built from a directory of YAML files.
//! One broken file keeps that DAG out of the bag with its error recorded;
//! it never takes the scheduler down with it.

use skein_core::dag::{Dag, DagBuilder, DagDefinition};
use skein_core::{Error, Result};
use std::path::Path;
use tracing::{info, warn};

pub struct DagBag {
    pub dags: Vec<Dag>,
    /// Files that failed to load, with the load error.
    pub import_errors: Vec<(String, String)>,
}

impl DagBag {
    /// Build every `.yaml` / `.yml` file under `dir` into a DAG.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut bag = Self {
            dags: Vec::new(),
            import_errors: Vec::new(),
        };

        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        entries.sort();

        for path in entries {
            match load_file(&path) {
                Ok(dag) => {
                    info!(dag = %dag.id, file = %path.display(), "Loaded DAG");
                    bag.dags.push(dag);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Failed to load DAG file");
                    bag.import_errors
                        .push((path.display().to_string(), e.to_string()));
                }
            }
        }

        Ok(bag)
    }

    pub fn get(&self, dag_id: &str) -> Result<&Dag> {
        self.dags
            .iter()
            .find(|dag| dag.id == dag_id)
            .ok_or_else(|| Error::DagNotFound(dag_id.to_string()))
    }
}

/// Build one DAG from one definition file.
pub fn load_file(path: &Path) -> Result<Dag> {
    let content = std::fs::read_to_string(path)?;
    let definition: DagDefinition = serde_yaml::from_str(&content)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    DagBuilder::new().build(&definition)
}
