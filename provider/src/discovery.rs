use crate::builder::ConfigurationBuilder;
use crate::cache::MetadataCache;
use crate::config::{ProviderConfig, ValidationError};
use crate::instance::Instance;
use crate::merge::{MergeConflict, Merged, merge};
use crate::metrics_defs::{
    CYCLE_DURATION, DISCOVERY_FETCH_ERRORS, DISCOVERY_INSTANCES, DISCOVERY_INSTANCES_SKIPPED,
};
use crate::port::PortPolicy;
use crate::rule::TemplateFunctions;
use async_trait::async_trait;
use dynamic::Configuration;
use shared::{counter, gauge, histogram};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid instance list: {0}")]
    Parse(String),

    #[error("discovery source unavailable: {0}")]
    Unavailable(String),
}

/// A platform that reports the instances to route to.
#[async_trait]
pub trait Discovery: Send + Sync {
    fn name(&self) -> &str;

    /// Which port specifiers the source supports.
    fn port_policy(&self) -> PortPolicy {
        PortPolicy::HOST_MAPPINGS
    }

    /// A fresh snapshot of the source's instances.
    async fn instances(&self) -> Result<Vec<Instance>, DiscoveryError>;
}

/// One published configuration of a source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub source: String,
    pub configuration: Configuration,
    pub conflicts: Vec<MergeConflict>,
}

/// The channel a single source publishes on. A slow consumer holds back the
/// next cycle.
pub fn channel() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
    mpsc::channel(1)
}

pub struct Provider<D> {
    discovery: D,
    builder: ConfigurationBuilder,
    refresh_interval: Duration,
}

impl<D: Discovery> Provider<D> {
    pub fn new(
        discovery: D,
        config: &ProviderConfig,
        functions: TemplateFunctions,
        cache: Arc<MetadataCache>,
    ) -> Result<Self, ValidationError> {
        let builder = ConfigurationBuilder::new(discovery.name(), config, functions, cache)?;
        Ok(Provider {
            discovery,
            builder,
            refresh_interval: config.refresh_interval(),
        })
    }

    pub fn source(&self) -> &str {
        self.builder.source()
    }

    /// Builds every instance in order and merges the results.
    pub fn build_configuration(&self, instances: &[Instance]) -> Merged {
        let policy = self.discovery.port_policy();
        let mut partials = BTreeMap::new();

        for instance in instances {
            let key = instance.key();
            match self.builder.build(instance, &policy) {
                Ok(Some(partial)) => match partials.entry(key) {
                    Entry::Vacant(entry) => {
                        entry.insert(partial);
                    }
                    Entry::Occupied(entry) => {
                        tracing::warn!(
                            source = %self.source(),
                            instance = %entry.key(),
                            "Skipping instance with the same name and ID as another one"
                        );
                        counter!(DISCOVERY_INSTANCES_SKIPPED, "source" => self.source().to_string())
                            .increment(1);
                    }
                },
                Ok(None) => {}
                Err(error) => {
                    tracing::error!(
                        source = %self.source(),
                        instance = %key,
                        %error,
                        "Skipping instance"
                    );
                    counter!(DISCOVERY_INSTANCES_SKIPPED, "source" => self.source().to_string())
                        .increment(1);
                }
            }
        }

        merge(partials)
    }

    /// Fetches a snapshot and builds its configuration.
    pub async fn cycle(&self) -> Result<Message, DiscoveryError> {
        let start = Instant::now();
        let instances = self.discovery.instances().await?;
        gauge!(DISCOVERY_INSTANCES, "source" => self.source().to_string())
            .set(instances.len() as f64);

        let Merged {
            configuration,
            conflicts,
        } = self.build_configuration(&instances);

        histogram!(CYCLE_DURATION, "source" => self.source().to_string())
            .record(start.elapsed().as_secs_f64());

        Ok(Message {
            source: self.source().to_string(),
            configuration,
            conflicts,
        })
    }

    /// Runs a cycle every refresh interval, starting immediately, and
    /// publishes each result on `tx`. A failed fetch skips the cycle. Stops
    /// between cycles once `shutdown` is cancelled, or when the receiver is
    /// dropped.
    pub async fn run(self, tx: mpsc::Sender<Message>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.cycle().await {
                Ok(message) => {
                    if tx.send(message).await.is_err() {
                        tracing::info!(source = %self.source(), "Configuration receiver dropped");
                        break;
                    }
                }
                Err(error) => {
                    tracing::error!(
                        source = %self.source(),
                        %error,
                        "Discovery failed, skipping cycle"
                    );
                    counter!(DISCOVERY_FETCH_ERRORS, "source" => self.source().to_string())
                        .increment(1);
                }
            }
        }

        tracing::info!(source = %self.source(), "Discovery loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{PortMapping, Transport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct StaticDiscovery {
        instances: Vec<Instance>,
    }

    #[async_trait]
    impl Discovery for StaticDiscovery {
        fn name(&self) -> &str {
            "static"
        }

        async fn instances(&self) -> Result<Vec<Instance>, DiscoveryError> {
            Ok(self.instances.clone())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl Discovery for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn instances(&self) -> Result<Vec<Instance>, DiscoveryError> {
            Err(DiscoveryError::Unavailable("connection refused".into()))
        }
    }

    /// Counts fetches and always returns the same instance.
    struct CountingDiscovery {
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Discovery for CountingDiscovery {
        fn name(&self) -> &str {
            "counting"
        }

        async fn instances(&self) -> Result<Vec<Instance>, DiscoveryError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(vec![instance("1", "10.0.0.1")])
        }
    }

    /// Blocks each fetch until `release` is notified.
    struct GatedDiscovery {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Discovery for GatedDiscovery {
        fn name(&self) -> &str {
            "gated"
        }

        async fn instances(&self) -> Result<Vec<Instance>, DiscoveryError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(vec![instance("1", "10.0.0.1")])
        }
    }

    fn instance(id: &str, address: &str) -> Instance {
        Instance {
            name: "Test".into(),
            id: id.into(),
            address: address.into(),
            labels: [(
                "traefik.http.services.Service1.loadbalancer.passhostheader".to_string(),
                "true".to_string(),
            )]
            .into(),
            ports: vec![PortMapping {
                logical: 80,
                reachable: 80,
                transport: Transport::Tcp,
            }],
            ..Default::default()
        }
    }

    fn provider<D: Discovery>(discovery: D) -> Provider<D> {
        Provider::new(
            discovery,
            &ProviderConfig::default(),
            TemplateFunctions::new(),
            Arc::new(MetadataCache::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_cycle_merges_instances() {
        let provider = provider(StaticDiscovery {
            instances: vec![instance("2", "10.0.0.2"), instance("1", "10.0.0.1")],
        });

        let message = provider.cycle().await.unwrap();
        assert_eq!(message.source, "static");
        assert!(message.conflicts.is_empty());

        let lb = message.configuration.http.services["Service1"]
            .load_balancer
            .as_ref()
            .unwrap();
        let urls: Vec<&str> = lb.servers.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, vec!["http://10.0.0.1:80", "http://10.0.0.2:80"]);
        assert_eq!(message.configuration.http.routers["Test"].service, "Service1");
    }

    #[tokio::test]
    async fn test_duplicate_instances_contribute_once() {
        let provider = provider(StaticDiscovery {
            instances: vec![instance("1", "10.0.0.1"), instance("1", "10.0.0.9")],
        });

        let merged = provider.build_configuration(&provider.discovery.instances().await.unwrap());
        let lb = merged.configuration.http.services["Service1"]
            .load_balancer
            .as_ref()
            .unwrap();
        assert_eq!(lb.servers.len(), 1);
        assert_eq!(lb.servers[0].url, "http://10.0.0.1:80");
    }

    #[tokio::test]
    async fn test_failed_fetch() {
        let provider = provider(Unreachable);
        assert!(matches!(
            provider.cycle().await,
            Err(DiscoveryError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_run_publishes_until_cancelled() {
        let provider = provider(StaticDiscovery {
            instances: vec![instance("1", "10.0.0.1")],
        });
        let (tx, mut rx) = channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(provider.run(tx, shutdown.clone()));

        let message = rx.recv().await.unwrap();
        assert!(message.configuration.http.services.contains_key("Service1"));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_consumer_holds_back_next_cycle() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let config = ProviderConfig {
            refresh_interval_secs: 1,
            ..Default::default()
        };
        let provider = Provider::new(
            CountingDiscovery {
                fetches: Arc::clone(&fetches),
            },
            &config,
            TemplateFunctions::new(),
            Arc::new(MetadataCache::default()),
        )
        .unwrap();
        let (tx, mut rx) = channel();
        let handle = tokio::spawn(provider.run(tx, CancellationToken::new()));

        // The first message fills the channel, the second send waits for the consumer.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 2);

        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 3);

        drop(rx);
        handle.await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_lets_current_cycle_publish() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let provider = provider(GatedDiscovery {
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        });
        let (tx, mut rx) = channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(provider.run(tx, shutdown.clone()));

        started.notified().await;
        shutdown.cancel();
        release.notify_one();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.source, "gated");
        assert!(message.configuration.http.services.contains_key("Service1"));

        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_run_stops_when_receiver_dropped() {
        let provider = provider(StaticDiscovery {
            instances: vec![instance("1", "10.0.0.1")],
        });
        let (tx, rx) = channel();
        drop(rx);

        provider.run(tx, CancellationToken::new()).await;
    }
}
