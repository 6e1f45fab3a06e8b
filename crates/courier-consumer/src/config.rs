//! Consumer runtime settings

use serde::Deserialize;

/// Coalescing policy for queued failed events of one pkey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationPolicy {
    /// Append events as-is.
    #[default]
    Disabled,
    /// Merge added+modified and modified+modified pairs.
    Conservative,
    /// Conservative, plus annihilation of added+removed pairs and collapse
    /// of removed+added into a modified.
    Maximum,
}

/// Blocking rule applied when a foreign-key relative of an event has
/// pending errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeysPolicy {
    /// Never block.
    Disabled,
    /// Block removals of a parent while children have errors, and child
    /// events whose parent has errors.
    #[default]
    OnRemoveEvent,
    /// Block any event on an object whose parent has pending errors.
    OnEveryEvent,
}

fn default_update_interval_secs() -> u64 {
    5
}

fn default_trashbin_purge_interval_mins() -> u64 {
    60
}

fn default_error_queue_retry_interval_mins() -> u64 {
    30
}

/// Runtime settings of one consumer.
///
/// Kept flatten-friendly: the client embeds these fields directly under
/// its own configuration key.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerSettings {
    /// Idle poll interval of the main apply loop.
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,

    /// Days removed objects stay recoverable; 0 disables the trashbin.
    #[serde(default)]
    pub trashbin_retention_days: u32,

    /// Minutes between two trashbin purge sweeps.
    #[serde(default = "default_trashbin_purge_interval_mins")]
    pub trashbin_purge_interval_mins: u64,

    /// Minutes between two error-queue retry passes.
    #[serde(default = "default_error_queue_retry_interval_mins")]
    pub error_queue_retry_interval_mins: u64,

    #[serde(default)]
    pub autoremediation: RemediationPolicy,

    #[serde(default)]
    pub foreignkeys_policy: ForeignKeysPolicy,

    /// Bootstrap from the oldest initsync sequence on the bus rather than
    /// the newest.
    #[serde(default)]
    pub use_first_initsync_sequence: bool,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        ConsumerSettings {
            update_interval_secs: default_update_interval_secs(),
            trashbin_retention_days: 0,
            trashbin_purge_interval_mins: default_trashbin_purge_interval_mins(),
            error_queue_retry_interval_mins: default_error_queue_retry_interval_mins(),
            autoremediation: RemediationPolicy::default(),
            foreignkeys_policy: ForeignKeysPolicy::default(),
            use_first_initsync_sequence: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings: ConsumerSettings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(settings.update_interval_secs, 5);
        assert_eq!(settings.trashbin_retention_days, 0);
        assert_eq!(settings.autoremediation, RemediationPolicy::Disabled);
        assert_eq!(settings.foreignkeys_policy, ForeignKeysPolicy::OnRemoveEvent);
        assert!(!settings.use_first_initsync_sequence);
    }

    #[test]
    fn test_policies_parse() {
        let settings: ConsumerSettings = serde_yaml::from_str(
            "autoremediation: maximum\nforeignkeys_policy: on_every_event\ntrashbin_retention_days: 7",
        )
        .unwrap();
        assert_eq!(settings.autoremediation, RemediationPolicy::Maximum);
        assert_eq!(settings.foreignkeys_policy, ForeignKeysPolicy::OnEveryEvent);
        assert_eq!(settings.trashbin_retention_days, 7);
    }

    #[test]
    fn test_interval_override() {
        let settings: ConsumerSettings =
            serde_yaml::from_str("update_interval_secs: 2").unwrap();
        assert_eq!(settings.update_interval_secs, 2);
    }
}
