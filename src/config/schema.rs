use serde::{Deserialize, Serialize};

use crate::engine::{CHECKSUM_BLOCK_SIZE, CHUNK_SIZE, DEFAULT_REPLICATION_READ_SIZE};

use super::Properties;

/// Engine configuration.
///
/// Two update paths exist: structured TOML/env layers applied through
/// [`ConfigLayer::apply_to`] at startup, and live `Properties` batches
/// pushed by the metadata server and folded in with
/// [`Config::apply_properties`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub replicator: ReplicatorConfig,
    pub rs_reader: RsReaderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            replicator: ReplicatorConfig::default(),
            rs_reader: RsReaderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicatorConfig {
    /// Find peers through the node's shared connection pool instead of
    /// opening a dedicated connection per job.
    pub use_connection_pool: bool,
    /// Ask the source to skip its disk checksum verification on
    /// block-aligned reads; the blocks are verified here after the copy.
    pub read_skip_disk_verify: bool,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            use_connection_pool: false,
            read_skip_disk_verify: true,
        }
    }
}

/// Striped reader settings for the recovery path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RsReaderConfig {
    pub max_retry_count: i64,
    pub time_sec_between_retries: i64,
    pub op_timeout_sec: i64,
    pub idle_timeout_sec: i64,
    /// Per-stripe read size cap; kept aligned to the checksum block.
    pub max_read_size: i64,
    pub max_chunk_read_size: i64,
    pub lease_retry_timeout: i64,
    pub lease_wait_timeout: i64,
    /// Hard bound on reconstructed chunk growth; exceeding it is a
    /// programming error and aborts.
    pub max_recover_chunk_size: i64,
    pub panic_on_invalid_chunk: bool,
    pub max_recovery_threads: usize,
    pub meta: MetaClientConfig,
}

impl Default for RsReaderConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            time_sec_between_retries: 10,
            op_timeout_sec: 30,
            idle_timeout_sec: 5 * 30,
            max_read_size: DEFAULT_REPLICATION_READ_SIZE,
            max_chunk_read_size: DEFAULT_REPLICATION_READ_SIZE.max(1 << 20),
            lease_retry_timeout: 3,
            lease_wait_timeout: 30,
            max_recover_chunk_size: CHUNK_SIZE,
            panic_on_invalid_chunk: false,
            max_recovery_threads: 16,
            meta: MetaClientConfig::default(),
        }
    }
}

/// Metadata server client settings used by the striped reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaClientConfig {
    pub max_retry_count: i64,
    pub time_sec_between_retries: i64,
    pub op_timeout_sec: i64,
    pub idle_timeout_sec: i64,
    pub reset_connection_on_op_timeout: bool,
}

impl Default for MetaClientConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 2,
            time_sec_between_retries: 10,
            op_timeout_sec: 4 * 60,
            idle_timeout_sec: 5 * 60,
            reset_connection_on_op_timeout: true,
        }
    }
}

fn align_up_to_block(value: i64) -> i64 {
    (value.max(1) + CHECKSUM_BLOCK_SIZE - 1) / CHECKSUM_BLOCK_SIZE * CHECKSUM_BLOCK_SIZE
}

impl Config {
    /// Folds a live property batch into the configuration, using the
    /// wire names the metadata server sends. Unknown names are left for
    /// other subsystems; absent names keep their current values.
    ///
    /// `rsReader.auth.*` is not consumed here: authentication parameters
    /// are versioned separately by the engine so running jobs can detect
    /// staleness.
    pub fn apply_properties(&mut self, props: &Properties) {
        if let Some(v) = props.get_bool("replicator.useConnectionPool") {
            self.replicator.use_connection_pool = v;
        }
        if let Some(v) = props.get_bool("replicator.readSkipDiskVerify") {
            self.replicator.read_skip_disk_verify = v;
        }

        let rs = &mut self.rs_reader;
        if let Some(v) = props.get_i64("rsReader.maxRetryCount") {
            rs.max_retry_count = v;
        }
        if let Some(v) = props.get_i64("rsReader.timeSecBetweenRetries") {
            rs.time_sec_between_retries = v;
        }
        if let Some(v) = props.get_i64("rsReader.opTimeoutSec") {
            rs.op_timeout_sec = v;
        }
        if let Some(v) = props.get_i64("rsReader.idleTimeoutSec") {
            rs.idle_timeout_sec = v;
        }
        if let Some(v) = props.get_i64("rsReader.maxReadSize") {
            rs.max_read_size = align_up_to_block(v);
            rs.max_chunk_read_size = rs.max_chunk_read_size.max(rs.max_read_size);
        }
        if let Some(v) = props.get_i64("rsReader.maxChunkReadSize") {
            rs.max_chunk_read_size = v.max(rs.max_read_size);
        }
        if let Some(v) = props.get_i64("rsReader.leaseRetryTimeout") {
            rs.lease_retry_timeout = v;
        }
        if let Some(v) = props.get_i64("rsReader.leaseWaitTimeout") {
            rs.lease_wait_timeout = v;
        }
        if let Some(v) = props.get_i64("rsReader.maxRecoverChunkSize") {
            rs.max_recover_chunk_size = v;
        }
        if let Some(v) = props.get_bool("rsReader.panicOnInvalidChunk") {
            rs.panic_on_invalid_chunk = v;
        }
        if let Some(v) = props.get_usize("rsReader.maxRecoveryThreads") {
            rs.max_recovery_threads = v;
        }

        let meta = &mut rs.meta;
        if let Some(v) = props.get_i64("rsReader.meta.maxRetryCount") {
            meta.max_retry_count = v;
        }
        if let Some(v) = props.get_i64("rsReader.meta.timeSecBetweenRetries") {
            meta.time_sec_between_retries = v;
        }
        if let Some(v) = props.get_i64("rsReader.meta.opTimeoutSec") {
            meta.op_timeout_sec = v;
        }
        if let Some(v) = props.get_i64("rsReader.meta.idleTimeoutSec") {
            meta.idle_timeout_sec = v;
        }
        if let Some(v) = props.get_bool("meta.resetConnectionOnOpTimeout") {
            meta.reset_connection_on_op_timeout = v;
        }
    }
}

/// Partial configuration from a TOML file or the environment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigLayer {
    pub replicator: ReplicatorConfigOverride,
    pub rs_reader: RsReaderConfigOverride,
}

impl ConfigLayer {
    pub fn apply_to(&self, base: &mut Config) {
        self.replicator.apply_to(&mut base.replicator);
        self.rs_reader.apply_to(&mut base.rs_reader);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReplicatorConfigOverride {
    pub use_connection_pool: Option<bool>,
    pub read_skip_disk_verify: Option<bool>,
}

impl ReplicatorConfigOverride {
    pub fn apply_to(&self, target: &mut ReplicatorConfig) {
        if let Some(v) = self.use_connection_pool {
            target.use_connection_pool = v;
        }
        if let Some(v) = self.read_skip_disk_verify {
            target.read_skip_disk_verify = v;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RsReaderConfigOverride {
    pub max_retry_count: Option<i64>,
    pub time_sec_between_retries: Option<i64>,
    pub op_timeout_sec: Option<i64>,
    pub idle_timeout_sec: Option<i64>,
    pub max_read_size: Option<i64>,
    pub max_chunk_read_size: Option<i64>,
    pub lease_retry_timeout: Option<i64>,
    pub lease_wait_timeout: Option<i64>,
    pub max_recover_chunk_size: Option<i64>,
    pub panic_on_invalid_chunk: Option<bool>,
    pub max_recovery_threads: Option<usize>,
    pub meta: MetaClientConfigOverride,
}

impl RsReaderConfigOverride {
    pub fn apply_to(&self, target: &mut RsReaderConfig) {
        if let Some(v) = self.max_retry_count {
            target.max_retry_count = v;
        }
        if let Some(v) = self.time_sec_between_retries {
            target.time_sec_between_retries = v;
        }
        if let Some(v) = self.op_timeout_sec {
            target.op_timeout_sec = v;
        }
        if let Some(v) = self.idle_timeout_sec {
            target.idle_timeout_sec = v;
        }
        if let Some(v) = self.max_read_size {
            target.max_read_size = align_up_to_block(v);
        }
        if let Some(v) = self.max_chunk_read_size {
            target.max_chunk_read_size = v;
        }
        target.max_chunk_read_size = target.max_chunk_read_size.max(target.max_read_size);
        if let Some(v) = self.lease_retry_timeout {
            target.lease_retry_timeout = v;
        }
        if let Some(v) = self.lease_wait_timeout {
            target.lease_wait_timeout = v;
        }
        if let Some(v) = self.max_recover_chunk_size {
            target.max_recover_chunk_size = v;
        }
        if let Some(v) = self.panic_on_invalid_chunk {
            target.panic_on_invalid_chunk = v;
        }
        if let Some(v) = self.max_recovery_threads {
            target.max_recovery_threads = v;
        }
        self.meta.apply_to(&mut target.meta);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MetaClientConfigOverride {
    pub max_retry_count: Option<i64>,
    pub time_sec_between_retries: Option<i64>,
    pub op_timeout_sec: Option<i64>,
    pub idle_timeout_sec: Option<i64>,
    pub reset_connection_on_op_timeout: Option<bool>,
}

impl MetaClientConfigOverride {
    pub fn apply_to(&self, target: &mut MetaClientConfig) {
        if let Some(v) = self.max_retry_count {
            target.max_retry_count = v;
        }
        if let Some(v) = self.time_sec_between_retries {
            target.time_sec_between_retries = v;
        }
        if let Some(v) = self.op_timeout_sec {
            target.op_timeout_sec = v;
        }
        if let Some(v) = self.idle_timeout_sec {
            target.idle_timeout_sec = v;
        }
        if let Some(v) = self.reset_connection_on_op_timeout {
            target.reset_connection_on_op_timeout = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_documentation() {
        let config = Config::default();
        assert!(!config.replicator.use_connection_pool);
        assert!(config.replicator.read_skip_disk_verify);
        assert_eq!(config.rs_reader.max_retry_count, 3);
        assert_eq!(config.rs_reader.max_read_size % CHECKSUM_BLOCK_SIZE, 0);
        assert_eq!(config.rs_reader.max_recover_chunk_size, CHUNK_SIZE);
        assert_eq!(config.rs_reader.meta.op_timeout_sec, 240);
        assert!(config.rs_reader.meta.reset_connection_on_op_timeout);
    }

    #[test]
    fn properties_update_named_keys() {
        let mut config = Config::default();
        let props: Properties = [
            ("replicator.useConnectionPool", "1"),
            ("replicator.readSkipDiskVerify", "0"),
            ("rsReader.maxReadSize", "100000"),
            ("rsReader.maxRecoveryThreads", "4"),
            ("rsReader.meta.opTimeoutSec", "60"),
        ]
        .into_iter()
        .collect();
        config.apply_properties(&props);

        assert!(config.replicator.use_connection_pool);
        assert!(!config.replicator.read_skip_disk_verify);
        // 100000 rounds up to the next checksum block multiple.
        assert_eq!(config.rs_reader.max_read_size, 2 * CHECKSUM_BLOCK_SIZE);
        assert_eq!(config.rs_reader.max_recovery_threads, 4);
        assert_eq!(config.rs_reader.meta.op_timeout_sec, 60);
    }

    #[test]
    fn reset_on_op_timeout_has_its_own_key() {
        // The idle timeout must not leak into the reset flag.
        let mut config = Config::default();
        let props: Properties = [("rsReader.meta.idleTimeoutSec", "0")].into_iter().collect();
        config.apply_properties(&props);
        assert_eq!(config.rs_reader.meta.idle_timeout_sec, 0);
        assert!(config.rs_reader.meta.reset_connection_on_op_timeout);

        let props: Properties = [("meta.resetConnectionOnOpTimeout", "0")].into_iter().collect();
        config.apply_properties(&props);
        assert!(!config.rs_reader.meta.reset_connection_on_op_timeout);
    }

    #[test]
    fn layer_overrides_selected_fields() {
        let mut config = Config::default();
        let mut layer = ConfigLayer::default();
        layer.replicator.use_connection_pool = Some(true);
        layer.rs_reader.max_recovery_threads = Some(2);
        layer.rs_reader.meta.max_retry_count = Some(7);
        layer.apply_to(&mut config);

        assert!(config.replicator.use_connection_pool);
        assert_eq!(config.rs_reader.max_recovery_threads, 2);
        assert_eq!(config.rs_reader.meta.max_retry_count, 7);
        // Untouched fields keep their defaults.
        assert!(config.replicator.read_skip_disk_verify);
        assert_eq!(config.rs_reader.max_retry_count, 3);
    }

    #[test]
    fn max_chunk_read_size_never_below_read_size() {
        let mut config = Config::default();
        let props: Properties = [
            ("rsReader.maxReadSize", "4194304"),
            ("rsReader.maxChunkReadSize", "1024"),
        ]
        .into_iter()
        .collect();
        config.apply_properties(&props);
        assert!(config.rs_reader.max_chunk_read_size >= config.rs_reader.max_read_size);
    }
}
