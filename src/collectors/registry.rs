use log::{error, info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;

use super::traits::{Collector, CollectorInfo};
use crate::error::RegistryError;

/// Concurrent directory of collectors, keyed by name
///
/// The map lock is never held while a collector method runs: bulk operations
/// work on a snapshot of the registered collectors.
#[derive(Default)]
pub struct CollectorRegistry {
    collectors: RwLock<BTreeMap<String, Arc<dyn Collector>>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a collector
    ///
    /// # Errors
    ///
    /// Fails if the name is empty or already taken.
    pub fn register(&self, collector: Arc<dyn Collector>) -> Result<(), RegistryError> {
        let name = collector.name().to_string();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let mut collectors = self.collectors.write().unwrap();
        if collectors.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }

        info!("Registered collector {}: {}", name, collector.description());
        collectors.insert(name, collector);
        Ok(())
    }

    /// Remove a collector, stopping it first
    pub async fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let removed = self.collectors.write().unwrap().remove(name);
        let collector = removed.ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if let Err(e) = collector.stop(&CancellationToken::new()).await {
            warn!("Error stopping collector {} during unregister: {}", name, e);
        }
        info!("Unregistered collector {}", name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Collector>> {
        self.collectors.read().unwrap().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.collectors.read().unwrap().contains_key(name)
    }

    /// All registered collectors, ordered by name
    pub fn list(&self) -> Vec<Arc<dyn Collector>> {
        self.collectors.read().unwrap().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.collectors.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.collectors.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start every registered collector
    ///
    /// All collectors are attempted even if some fail; the failures are
    /// reported together.
    pub async fn start_all(&self, token: &CancellationToken) -> Result<(), RegistryError> {
        let collectors = self.list();
        info!("Starting {} collectors", collectors.len());

        let mut failures = Vec::new();
        for collector in collectors {
            match collector.start(token).await {
                Ok(()) => info!("Collector {} started", collector.name()),
                Err(e) => {
                    error!("Failed to start collector {}: {}", collector.name(), e);
                    failures.push((collector.name().to_string(), e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::StartFailed(failures))
        }
    }

    pub async fn stop_all(&self, token: &CancellationToken) -> Result<(), RegistryError> {
        let collectors = self.list();
        info!("Stopping {} collectors", collectors.len());

        let mut failures = Vec::new();
        for collector in collectors {
            if let Err(e) = collector.stop(token).await {
                error!("Failed to stop collector {}: {}", collector.name(), e);
                failures.push((collector.name().to_string(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::StopFailed(failures))
        }
    }

    /// Status of every collector, keyed by name
    pub fn status(&self) -> BTreeMap<String, CollectorInfo> {
        self.list()
            .into_iter()
            .map(|collector| (collector.name().to_string(), collector.info()))
            .collect()
    }
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("collectors", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::{CollectorConfig, CollectorStatus, FnCollector};
    use crate::events::MetricObservation;
    use crate::resilience::BoxError;
    use std::time::Duration;

    fn collector(name: &str, targets: &[&str]) -> Arc<dyn Collector> {
        let config = CollectorConfig {
            interval: Duration::from_secs(60),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            ..CollectorConfig::default()
        };
        Arc::new(FnCollector::new(name, "test collector", config, |_req| async {
            Ok::<Vec<MetricObservation>, BoxError>(Vec::new())
        }))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = CollectorRegistry::new();
        registry.register(collector("ec2", &["us-east-1"])).unwrap();
        registry.register(collector("ebs", &["us-east-1"])).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("ec2"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["ebs".to_string(), "ec2".to_string()]);
    }

    #[test]
    fn test_register_rejects_duplicates_and_empty_names() {
        let registry = CollectorRegistry::new();
        registry.register(collector("ec2", &["us-east-1"])).unwrap();

        assert!(matches!(
            registry.register(collector("ec2", &["us-west-2"])),
            Err(RegistryError::AlreadyRegistered(name)) if name == "ec2"
        ));
        assert!(matches!(
            registry.register(collector("", &["us-east-1"])),
            Err(RegistryError::EmptyName)
        ));
    }

    #[tokio::test]
    async fn test_start_all_reports_every_failure() {
        let registry = CollectorRegistry::new();
        registry.register(collector("good", &["us-east-1"])).unwrap();
        registry.register(collector("bad", &[])).unwrap();
        let token = CancellationToken::new();

        let err = registry.start_all(&token).await.unwrap_err();
        match err {
            RegistryError::StartFailed(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "bad");
                assert_eq!(failures[0].1.code, "NO_TARGETS");
            }
            other => panic!("unexpected error: {}", other),
        }

        let status = registry.status();
        assert_eq!(status["good"].status, CollectorStatus::Running);
        assert_eq!(status["bad"].status, CollectorStatus::Error);
    }

    #[tokio::test]
    async fn test_unregister_stops_collector() {
        let registry = CollectorRegistry::new();
        let ec2 = collector("ec2", &["us-east-1"]);
        registry.register(Arc::clone(&ec2)).unwrap();
        let token = CancellationToken::new();
        registry.start_all(&token).await.unwrap();

        registry.unregister("ec2").await.unwrap();

        assert!(registry.is_empty());
        assert_eq!(ec2.info().status, CollectorStatus::Stopped);
        assert!(matches!(
            registry.unregister("ec2").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_all_stops_everything() {
        let registry = CollectorRegistry::new();
        registry.register(collector("ec2", &["us-east-1"])).unwrap();
        registry.register(collector("ebs", &["us-east-1"])).unwrap();
        let token = CancellationToken::new();

        registry.start_all(&token).await.unwrap();
        registry.stop_all(&token).await.unwrap();

        assert!(registry
            .status()
            .values()
            .all(|info| info.status == CollectorStatus::Stopped));
    }
}
