use std::env;
use std::str::FromStr;

use log::debug;

use crate::classifier::ClassifierConfig;
use crate::error::ConfigError;
use crate::protocol::SyncConfig;
use crate::rally::MatchRules;

/// Everything a match session needs to know, with defaults for every field.
#[derive(Debug, Clone, PartialEq)]
pub struct RallyConfig {
    pub classifier: ClassifierConfig,
    pub rules: MatchRules,
    pub sync: SyncConfig,
    /// Session housekeeping period: rally timers, retransmission, sensor gaps.
    pub tick_ms: u64,
}

const DEFAULT_TICK_MS: u64 = 10;

impl Default for RallyConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierConfig::default(),
            rules: MatchRules::default(),
            sync: SyncConfig::default(),
            tick_ms: DEFAULT_TICK_MS,
        }
    }
}

impl RallyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `AIRRALLY_*` variable that is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`RallyConfig::from_env`] with an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::new();
        let c = &mut cfg.classifier;
        set(&lookup, "AIRRALLY_LOOKAHEAD_SAMPLES", &mut c.lookahead_samples)?;
        set(&lookup, "AIRRALLY_MAX_WINDOW_MS", &mut c.max_window_ms)?;
        set(&lookup, "AIRRALLY_REFRACTORY_MS", &mut c.refractory_ms)?;
        set(&lookup, "AIRRALLY_IDLE_TIMEOUT_MS", &mut c.idle_timeout_ms)?;

        let r = &mut cfg.rules;
        set(&lookup, "AIRRALLY_TARGET_SCORE", &mut r.target_score)?;
        set(&lookup, "AIRRALLY_WIN_MARGIN", &mut r.win_margin)?;
        set(&lookup, "AIRRALLY_REACTION_WINDOW_MS", &mut r.reaction_window_ms)?;
        set(&lookup, "AIRRALLY_REMOTE_GRACE_MS", &mut r.remote_grace_ms)?;
        set(&lookup, "AIRRALLY_POINT_PAUSE_MS", &mut r.point_pause_ms)?;
        set(&lookup, "AIRRALLY_OUT_OF_BOUNDS_DEG", &mut r.out_of_bounds_deg)?;

        let s = &mut cfg.sync;
        set(&lookup, "AIRRALLY_ACK_TIMEOUT_MS", &mut s.ack_timeout_ms)?;
        set(&lookup, "AIRRALLY_MAX_RETRIES", &mut s.max_retries)?;
        set(&lookup, "AIRRALLY_PING_INTERVAL_MS", &mut s.ping_interval_ms)?;
        set(&lookup, "AIRRALLY_LIVENESS_TIMEOUT_MS", &mut s.liveness_timeout_ms)?;

        set(&lookup, "AIRRALLY_TICK_MS", &mut cfg.tick_ms)?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rules.target_score == 0 {
            return Err(ConfigError::Constraint("target score must be at least 1"));
        }
        if self.rules.win_margin == 0 {
            return Err(ConfigError::Constraint("win margin must be at least 1"));
        }
        if self.classifier.lookahead_samples == 0 {
            return Err(ConfigError::Constraint("lookahead must be at least one sample"));
        }
        if self.tick_ms == 0 {
            return Err(ConfigError::Constraint("tick period must be positive"));
        }
        if self.tick_ms > self.sync.ack_timeout_ms {
            return Err(ConfigError::Constraint("tick period longer than the ack timeout"));
        }
        if self.sync.liveness_timeout_ms <= self.sync.ping_interval_ms {
            return Err(ConfigError::Constraint("liveness timeout must exceed the ping interval"));
        }
        Ok(())
    }
}

fn set<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key: key.to_string(), value: raw.clone() })?;
        debug!("config override {}={}", key, raw.trim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_overrides() {
        let cfg = RallyConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, RallyConfig::new());
        assert_eq!(cfg.rules.target_score, 11);
        assert_eq!(cfg.tick_ms, DEFAULT_TICK_MS);
    }

    #[test]
    fn test_overrides_apply() {
        let cfg = RallyConfig::from_lookup(lookup(&[
            ("AIRRALLY_TARGET_SCORE", "5"),
            ("AIRRALLY_OUT_OF_BOUNDS_DEG", " 45.5 "),
            ("AIRRALLY_MAX_RETRIES", "8"),
        ]))
        .unwrap();
        assert_eq!(cfg.rules.target_score, 5);
        assert_eq!(cfg.rules.out_of_bounds_deg, 45.5);
        assert_eq!(cfg.sync.max_retries, 8);
    }

    #[test]
    fn test_unparsable_value_names_the_key() {
        let err = RallyConfig::from_lookup(lookup(&[("AIRRALLY_WIN_MARGIN", "two")])).unwrap_err();
        match err {
            ConfigError::Invalid { key, value } => {
                assert_eq!(key, "AIRRALLY_WIN_MARGIN");
                assert_eq!(value, "two");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_constraints() {
        assert!(matches!(
            RallyConfig::from_lookup(lookup(&[("AIRRALLY_TARGET_SCORE", "0")])),
            Err(ConfigError::Constraint(_))
        ));
        assert!(matches!(
            RallyConfig::from_lookup(lookup(&[("AIRRALLY_TICK_MS", "500")])),
            Err(ConfigError::Constraint(_))
        ));
    }
}
