//! The `Data` collaborator interface (spec.md §1, out of scope beyond this
//! contract; Design Notes §9 "Dynamic collaborator dispatch"). Re-architected
//! from the original's class-per-provider hierarchy
//! (`dataprovider.py::{Custom,Local,NAS,MinIO,AWS}DataProvider`) into a
//! tagged variant evaluated in a fixed priority order, first match wins.
//!
//! The concrete mirroring logic (NAS rsync, MinIO/S3 client calls, custom
//! scripts) is out of this crate's core — spec.md §1 treats `Data` purely as
//! an external collaborator with a single `prepare` method. This module
//! implements only the dispatch contract so the orchestrator has something
//! concrete to call; real deployments supply their own provider behind the
//! same trait.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::Result;

/// One dataset mirrored into a container: host mount paths, environment
/// variables the workload needs to find it, and free-form diagnostics for
/// the build/run log.
#[derive(Debug, Clone, Default)]
pub struct DataPreparation {
    pub mount_paths: Vec<(String, String)>,
    pub env: BTreeMap<String, String>,
    pub diagnostics: Vec<String>,
}

/// Which concrete provider backs a dataset name. Checked in this fixed order
/// (`Custom` first, `Local` last) — the first one whose `check_source`
/// returns true wins and its result is memoized per dataset name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DataSourceKind {
    Custom,
    Minio,
    Aws,
    Nas,
    Local,
}

/// Priority order used by [`Data::resolve`]: first match wins.
pub const PRIORITY: &[DataSourceKind] = &[
    DataSourceKind::Custom,
    DataSourceKind::Minio,
    DataSourceKind::Aws,
    DataSourceKind::Nas,
    DataSourceKind::Local,
];

/// Shared interface every concrete data source implements.
pub trait DataSource: Send + Sync {
    fn kind(&self) -> DataSourceKind;
    /// True if this source can serve `dataname` given its configuration.
    fn check_source(&self, dataname: &str) -> bool;
    fn get_mount_paths(&self, dataname: &str) -> Vec<(String, String)>;
    /// Prepares `dataname` for `container`, mirroring it in if needed.
    fn prepare(&self, dataname: &str, container: &str) -> Result<DataPreparation>;
    fn env(&self, dataname: &str) -> BTreeMap<String, String>;
}

/// The `Data` collaborator: holds the registered sources in priority order
/// and memoizes the first-match resolution per dataset name.
pub struct Data {
    sources: Vec<Box<dyn DataSource>>,
    memo: Mutex<BTreeMap<String, usize>>,
}

impl Data {
    pub fn new(sources: Vec<Box<dyn DataSource>>) -> Self {
        Self {
            sources,
            memo: Mutex::new(BTreeMap::new()),
        }
    }

    /// Resolves `dataname` to the index of the first matching source in
    /// priority order, memoizing the result.
    fn resolve(&self, dataname: &str) -> Option<usize> {
        if let Some(idx) = self.memo.lock().expect("memo lock poisoned").get(dataname) {
            return Some(*idx);
        }
        let idx = self.sources.iter().position(|s| s.check_source(dataname))?;
        self.memo
            .lock()
            .expect("memo lock poisoned")
            .insert(dataname.to_string(), idx);
        Some(idx)
    }

    /// `prepare(model, container) -> (mountpaths, env, diagnostics)` per
    /// spec.md §1's single-method `Data` contract.
    pub fn prepare(&self, dataname: &str, container: &str) -> Result<DataPreparation> {
        match self.resolve(dataname) {
            Some(idx) => self.sources[idx].prepare(dataname, container),
            None => Ok(DataPreparation {
                diagnostics: vec![format!("no data source claimed dataset '{dataname}'")],
                ..Default::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubSource {
        kind: DataSourceKind,
        claims: Vec<&'static str>,
    }

    impl DataSource for StubSource {
        fn kind(&self) -> DataSourceKind {
            self.kind
        }
        fn check_source(&self, dataname: &str) -> bool {
            self.claims.contains(&dataname)
        }
        fn get_mount_paths(&self, _dataname: &str) -> Vec<(String, String)> {
            vec![]
        }
        fn prepare(&self, dataname: &str, _container: &str) -> Result<DataPreparation> {
            Ok(DataPreparation {
                diagnostics: vec![format!("prepared by {:?}", self.kind)],
                ..Default::default()
            })
        }
        fn env(&self, _dataname: &str) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
    }

    #[test]
    fn first_match_in_priority_order_wins() {
        let data = Data::new(vec![
            Box::new(StubSource {
                kind: DataSourceKind::Custom,
                claims: vec!["imagenet"],
            }),
            Box::new(StubSource {
                kind: DataSourceKind::Local,
                claims: vec!["imagenet"],
            }),
        ]);
        let prep = data.prepare("imagenet", "container1").unwrap();
        assert!(prep.diagnostics[0].contains("Custom"));
    }

    #[test]
    fn unclaimed_dataset_returns_diagnostic_not_error() {
        let data = Data::new(vec![Box::new(StubSource {
            kind: DataSourceKind::Local,
            claims: vec!["other"],
        })]);
        let prep = data.prepare("imagenet", "container1").unwrap();
        assert!(prep.diagnostics[0].contains("no data source"));
    }

    #[test]
    fn resolution_is_memoized_per_dataset_name() {
        let data = Data::new(vec![Box::new(StubSource {
            kind: DataSourceKind::Nas,
            claims: vec!["imagenet"],
        })]);
        assert_eq!(data.resolve("imagenet"), Some(0));
        assert_eq!(data.resolve("imagenet"), Some(0));
    }
}
