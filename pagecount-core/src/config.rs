//! Application configuration, read once at startup.

use bon::bon;
use thiserror::Error;

/// Errors raised when a configuration is rejected at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Partition counts are fixed at topology-definition time and zero is
    /// not a topology
    #[error("partition count must be at least 1")]
    ZeroPartitions,
    /// Topic names derive from the application name
    #[error("application name must not be empty")]
    EmptyAppName,
}

/// Immutable configuration for one process.
///
/// Built once at startup and passed by reference to each component at
/// construction; there is no process-wide application object. Changing
/// `partition_count` between deployments changes key placement and
/// requires a full state rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Application/service name; topic names derive from it
    pub app_name: String,
    /// Broker connection endpoint, consumed by transport adapters. The
    /// in-process runtime carries it for parity but connects to nothing.
    pub broker: String,
    /// Total partition count shared by the input topic, the repartitioned
    /// topic and the changelog
    pub partition_count: u32,
}

#[bon]
impl AppConfig {
    /// Validate and build a configuration
    #[builder(on(String, into))]
    pub fn new(
        app_name: String,
        #[builder(default = String::from("kafka://localhost:9092"))] broker: String,
        partition_count: u32,
    ) -> Result<Self, ConfigError> {
        if app_name.is_empty() {
            return Err(ConfigError::EmptyAppName);
        }
        if partition_count == 0 {
            return Err(ConfigError::ZeroPartitions);
        }
        Ok(Self {
            app_name,
            broker,
            partition_count,
        })
    }
}

impl AppConfig {
    /// Name of the input topic page-view events arrive on
    pub fn input_topic(&self) -> String {
        self.app_name.clone()
    }

    /// Name of the intermediate topic keyed by page id
    pub fn repartition_topic(&self) -> String {
        format!("{}-repartition", self.app_name)
    }

    /// Name of the count table's changelog topic
    pub fn changelog_topic(&self) -> String {
        format!("{}-changelog", self.app_name)
    }
}
