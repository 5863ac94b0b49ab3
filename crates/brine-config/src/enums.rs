//! Closed enumerations for string-valued mode switches.

use serde::Deserialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    /// In-process hub; only meaningful when master and minions share a process.
    Memory,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpcMode {
    #[default]
    Ipc,
    Tcp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MasterType {
    /// One master, or several masters at once.
    #[default]
    Str,
    Failover,
    /// Pick the preferred master from a hash of the minion id.
    Distributed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyndicFailover {
    #[default]
    Random,
    Ordered,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    None,
    Recurse,
    Aggregate,
    Overwrite,
    #[default]
    Smart,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateOutput {
    #[default]
    Full,
    Terse,
    Mixed,
    Changes,
    FullId,
    TerseId,
    MixedId,
    ChangesId,
}

impl StateOutput {
    /// `*_id` variants label terse lines with the state id instead of the name.
    pub fn uses_id(&self) -> bool {
        matches!(
            self,
            StateOutput::FullId | StateOutput::TerseId | StateOutput::MixedId | StateOutput::ChangesId
        )
    }
}

/// Backend for the job cache and the minion data cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Fs,
    Memory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_output_names() {
        let parsed: StateOutput = serde_yaml::from_str("changes_id").unwrap();
        assert_eq!(parsed, StateOutput::ChangesId);
        assert!(parsed.uses_id());
        assert!(!StateOutput::Mixed.uses_id());
        assert!(serde_yaml::from_str::<StateOutput>("filter").is_err());
    }

    #[test]
    fn merge_strategy_names() {
        for (name, want) in [
            ("none", MergeStrategy::None),
            ("recurse", MergeStrategy::Recurse),
            ("aggregate", MergeStrategy::Aggregate),
            ("overwrite", MergeStrategy::Overwrite),
            ("smart", MergeStrategy::Smart),
        ] {
            assert_eq!(serde_yaml::from_str::<MergeStrategy>(name).unwrap(), want);
        }
    }
}
