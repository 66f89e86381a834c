use std::sync::Arc;

use anyhow::anyhow;
use strum::Display;
use thiserror::Error;

use crate::cache::ObjectCache;
use crate::config::RuntimeConfig;
use crate::controller::MediaController;
use crate::datastore::{ConfigConnector, Connector, Datastore, DatastoreRegistry};
use crate::errors::ErrorReporter;
use crate::ids::{IdGenerator, MachineIdentity};
use crate::media::MediaService;
use crate::storage::{DatastoreKind, StartupCheck};
use crate::store::{MediaStore, MemoryStore};
use crate::thumbnail::ThumbnailService;

/// Everything that can go wrong while starting up.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum StartupCondition {
    IdentitySourceUnavailable,
    IdGeneratorBroken,
    MediaStoreUnavailable,
    DatastoreConstructionFailed,
    DatastoreListingFailed,
    DatastoreUnverifiable,
    BucketMissing,
    TempPathMissing,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Severity {
    /// The process must not serve traffic.
    Abort,

    /// Logged loudly, startup continues.
    Warn,
}

impl StartupCondition {
    pub const fn severity(&self) -> Severity {
        match self {
            Self::IdentitySourceUnavailable
            | Self::IdGeneratorBroken
            | Self::MediaStoreUnavailable
            | Self::DatastoreConstructionFailed
            | Self::DatastoreListingFailed => Severity::Abort,
            Self::DatastoreUnverifiable | Self::BucketMissing | Self::TempPathMissing => {
                Severity::Warn
            },
        }
    }
}

impl From<StartupCheck> for StartupCondition {
    fn from(check: StartupCheck) -> Self {
        match check {
            StartupCheck::BucketExists => Self::BucketMissing,
            StartupCheck::TempPathExists => Self::TempPathMissing,
        }
    }
}

#[derive(Debug, Error)]
#[error("{condition}: {cause:#}")]
pub struct StartupError {
    pub condition: StartupCondition,
    pub cause: anyhow::Error,
}

/// The outcome of the datastore verification step.
#[derive(Debug, Default)]
pub struct StartupReport {
    pub datastores: Vec<Datastore>,
    pub warnings: Vec<StartupCondition>,
}

/// Applies the policy table to a failed step.
fn classify(
    condition: StartupCondition,
    cause: anyhow::Error,
    warnings: &mut Vec<StartupCondition>,
) -> Result<(), StartupError> {
    match condition.severity() {
        Severity::Abort => Err(StartupError { condition, cause }),
        Severity::Warn => {
            warnings.push(condition);
            Ok(())
        },
    }
}

/// Generates a throwaway id to prove the generator works.
pub fn check_id_generator(ids: &IdGenerator) -> Result<(), StartupError> {
    ids.new_unique_id()
        .map(|_| ())
        .map_err(|e| StartupError {
            condition: StartupCondition::IdGeneratorBroken,
            cause: e.into(),
        })
}

fn check_warning(condition: StartupCondition) -> &'static str {
    match condition {
        StartupCondition::BucketMissing => "\t\tBucket does not exist!",
        StartupCondition::TempPathMissing => "\t\tTemporary path does not exist!",
        _ => "\t\tDatastore could not be verified!",
    }
}

/// Constructs every enabled datastore then verifies every known one.
///
/// This must complete before any request is served.
pub async fn load_datastores(registry: &DatastoreRegistry) -> Result<StartupReport, StartupError> {
    let mut report = StartupReport::default();

    for cfg in registry.unique_datastores() {
        let kind = cfg.backend.kind();
        let uri = cfg.backend.uri();

        if !cfg.enabled {
            debug!("Skipping disabled {} datastore {}", kind, uri);
            continue;
        }

        if let Err(e) = registry.get_or_create_datastore_of_type(kind, &uri).await {
            return Err(StartupError {
                condition: StartupCondition::DatastoreConstructionFailed,
                cause: e.context(format!("Failed to construct {} datastore {}", kind, uri)),
            });
        }
    }

    let datastores = registry
        .get_all_datastores()
        .await
        .map_err(|e| StartupError {
            condition: StartupCondition::DatastoreListingFailed,
            cause: e,
        })?;

    info!("Datastores:");
    for ds in datastores.iter() {
        info!("\t{} ({}): {}", ds.kind, ds.id, ds.uri);

        if ds.kind != DatastoreKind::S3 {
            continue;
        }

        let backend = match registry.backend(ds.kind, &ds.uri).await {
            Ok(backend) => backend,
            Err(e) => {
                warn!("{}", check_warning(StartupCondition::DatastoreUnverifiable));
                classify(StartupCondition::DatastoreUnverifiable, e, &mut report.warnings)?;
                continue;
            },
        };

        for (check, res) in backend.startup_checks().await {
            if let Err(e) = res {
                let condition = StartupCondition::from(check);
                warn!("{}", check_warning(condition));
                debug!("{} check failed for {}: {:#}", check, ds.id, e);
                classify(condition, e, &mut report.warnings)?;
            }
        }
    }

    report.datastores = datastores;
    Ok(report)
}

/// Runs the startup sequence and builds the controller.
pub async fn bootstrap(
    cfg: RuntimeConfig,
    reporter: Arc<dyn ErrorReporter>,
) -> Result<Arc<MediaController>, StartupError> {
    bootstrap_with_connector(cfg, reporter, Arc::new(ConfigConnector)).await
}

pub async fn bootstrap_with_connector(
    cfg: RuntimeConfig,
    reporter: Arc<dyn ErrorReporter>,
    connector: Arc<dyn Connector>,
) -> Result<Arc<MediaController>, StartupError> {
    let machine = MachineIdentity::new(cfg.machine_id).map_err(|e| StartupError {
        condition: StartupCondition::IdentitySourceUnavailable,
        cause: e.into(),
    })?;

    info!(
        "Running as machine {} for ID generation. This ID must be unique within your cluster.",
        machine.get()
    );

    let ids = IdGenerator::new(machine);
    check_id_generator(&ids)?;

    let store: Arc<dyn MediaStore> = Arc::new(
        MemoryStore::open(cfg.store_path.clone())
            .await
            .map_err(|e| StartupError {
                condition: StartupCondition::MediaStoreUnavailable,
                cause: e,
            })?,
    );

    let registry = Arc::new(DatastoreRegistry::with_connector(
        &cfg.datastores,
        store.clone(),
        ObjectCache::new(cfg.cache_size),
        connector,
    ));

    let report = load_datastores(&registry).await?;
    if report.datastores.is_empty() {
        return Err(StartupError {
            condition: StartupCondition::DatastoreListingFailed,
            cause: anyhow!("No datastores are known after startup"),
        });
    }

    let media = MediaService::new(
        store.clone(),
        registry.clone(),
        ids,
        cfg.downloads.max_bytes,
        cfg.uploads.max_bytes,
    );
    let thumbnails = ThumbnailService::new(store, registry.clone(), cfg.thumbnails);

    Ok(Arc::new(MediaController::new(media, thumbnails, registry, reporter)))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use anyhow::Result;
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::datastore::datastore_id;
    use crate::datastore::tests::{file_config, CountingConnector};
    use crate::errors::TracingReporter;
    use crate::storage::backends::{BackendConfigs, DatastoreConfig, FileSystemBackend};
    use crate::storage::StorageBackend;

    const FILESYSTEM_CONFIG: &str = include_str!("../tests/configs/filesystem.yaml");
    const S3_CONFIG: &str = include_str!("../tests/configs/s3.yaml");

    /// An object storage stand in whose bucket and temp path are both missing.
    struct UnprovisionedBucket;

    #[async_trait]
    impl StorageBackend for UnprovisionedBucket {
        fn kind(&self) -> DatastoreKind {
            DatastoreKind::S3
        }

        async fn store(&self, _data: Bytes, _content_type: &str) -> Result<String> {
            Err(anyhow!("bucket does not exist"))
        }

        async fn fetch(&self, _location: &str) -> Result<Option<Bytes>> {
            Ok(None)
        }

        async fn exists(&self, _location: &str) -> Result<bool> {
            Ok(false)
        }

        async fn startup_checks(&self) -> Vec<(StartupCheck, Result<()>)> {
            vec![
                (StartupCheck::BucketExists, Err(anyhow!("NoSuchBucket"))),
                (StartupCheck::TempPathExists, Err(anyhow!("not a directory"))),
            ]
        }
    }

    struct FakeConnector;

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, cfg: &BackendConfigs) -> Result<Arc<dyn StorageBackend>> {
            match cfg {
                BackendConfigs::File { directory } => {
                    Ok(Arc::new(FileSystemBackend::new(directory.clone())))
                },
                BackendConfigs::S3 { .. } => Ok(Arc::new(UnprovisionedBucket)),
            }
        }
    }

    fn s3_config(enabled: bool) -> DatastoreConfig {
        DatastoreConfig {
            enabled,
            backend: BackendConfigs::S3 {
                endpoint: "http://minio:9000".to_string(),
                region: "us-east-1".to_string(),
                bucket: "media".to_string(),
                access_key: None,
                secret_key: None,
                temp_path: PathBuf::from("/nonexistent"),
            },
        }
    }

    #[test]
    fn test_policy_table() {
        use StartupCondition::*;

        for condition in [
            IdentitySourceUnavailable,
            IdGeneratorBroken,
            MediaStoreUnavailable,
            DatastoreConstructionFailed,
            DatastoreListingFailed,
        ] {
            assert_eq!(condition.severity(), Severity::Abort, "{}", condition);
        }

        for condition in [DatastoreUnverifiable, BucketMissing, TempPathMissing] {
            assert_eq!(condition.severity(), Severity::Warn, "{}", condition);
        }

        assert_eq!(StartupCondition::from(StartupCheck::BucketExists), BucketMissing);
        assert_eq!(StartupCondition::from(StartupCheck::TempPathExists), TempPathMissing);
    }

    #[tokio::test]
    async fn test_failing_enabled_datastore_aborts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = DatastoreRegistry::with_connector(
            &[file_config(dir.path().to_path_buf(), true)],
            Arc::new(MemoryStore::default()),
            ObjectCache::disabled(),
            Arc::new(CountingConnector::new(true)),
        );

        let res = load_datastores(&registry).await;
        assert!(matches!(
            res,
            Err(StartupError {
                condition: StartupCondition::DatastoreConstructionFailed,
                ..
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_datastores_are_not_constructed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let connector = Arc::new(CountingConnector::new(false));
        let registry = DatastoreRegistry::with_connector(
            &[
                file_config(dir.path().join("enabled"), true),
                s3_config(false),
                file_config(dir.path().join("disabled"), false),
            ],
            Arc::new(MemoryStore::default()),
            ObjectCache::disabled(),
            connector.clone(),
        );

        let report = load_datastores(&registry).await?;
        assert_eq!(connector.connects.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(report.datastores.len(), 1);
        assert_eq!(report.datastores[0].kind, DatastoreKind::File);
        assert!(report.warnings.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_historical_datastore_warns() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let historical = s3_config(false);
        let uri = historical.backend.uri();

        let store = Arc::new(MemoryStore::default());
        store
            .upsert_datastore(Datastore {
                id: datastore_id(DatastoreKind::S3, &uri),
                kind: DatastoreKind::S3,
                uri,
                enabled: true,
            })
            .await?;

        let registry = DatastoreRegistry::with_connector(
            &[file_config(dir.path().to_path_buf(), true), historical],
            store,
            ObjectCache::disabled(),
            Arc::new(CountingConnector::new(false)),
        );

        let report = load_datastores(&registry).await?;
        assert_eq!(report.datastores.len(), 2);
        assert_eq!(report.warnings, vec![StartupCondition::DatastoreUnverifiable]);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_bucket_only_warns() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = DatastoreRegistry::with_connector(
            &[file_config(dir.path().to_path_buf(), true), s3_config(true)],
            Arc::new(MemoryStore::default()),
            ObjectCache::disabled(),
            Arc::new(FakeConnector),
        );

        let report = load_datastores(&registry).await?;
        assert_eq!(report.datastores.len(), 2);
        assert_eq!(
            report.warnings,
            vec![StartupCondition::BucketMissing, StartupCondition::TempPathMissing]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_machine_id_aborts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut cfg = RuntimeConfig::from_yaml(FILESYSTEM_CONFIG)?;
        cfg.machine_id = 4096;
        cfg.datastores = vec![file_config(dir.path().to_path_buf(), true)];

        let res = bootstrap(cfg, Arc::new(TracingReporter)).await;
        assert!(matches!(
            res,
            Err(StartupError {
                condition: StartupCondition::IdentitySourceUnavailable,
                ..
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_bootstrap_with_object_storage() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut cfg = RuntimeConfig::from_yaml(S3_CONFIG)?;
        cfg.store_path = Some(dir.path().join("index.json"));
        cfg.datastores = vec![
            file_config(dir.path().join("media"), true),
            s3_config(false),
            file_config(dir.path().join("media"), false),
        ];

        let controller = bootstrap_with_connector(cfg, Arc::new(TracingReporter), Arc::new(FakeConnector)).await?;

        assert_eq!(controller.registry().unique_datastores().len(), 2);
        assert_eq!(controller.registry().get_all_datastores().await?.len(), 1);
        Ok(())
    }
}
