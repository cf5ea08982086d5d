use std::collections::HashMap;
use std::time::Duration;

/// Per-backend settings resolved by the registry and handed to an adapter at
/// construction time.
///
/// Invariants: `path` is non-empty after defaulting; `timeout` and
/// `idle_timeout` are non-negative (guaranteed by `Duration`); an absent
/// `phases` map means "enabled for every phase".
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    /// Executable path; may be a multi-word prefix (e.g. `"npx claude"`),
    /// split on whitespace at spawn time.
    pub path: String,
    pub default_model: Option<String>,
    pub timeout: Duration,
    /// No activity on stdout/stderr/log-file for this long ⇒ kill.
    pub idle_timeout: Option<Duration>,
    pub phases: Option<HashMap<String, bool>>,
    pub reasoning_effort: Option<String>,
    pub reasoning_effort_phases: HashMap<String, String>,
    /// Multiplicative factor bounding how far a backend-reported token count
    /// may diverge from the length-based estimate before the estimate wins.
    pub token_discrepancy_threshold: f64,
    pub extra_env: HashMap<String, String>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        let name = name.into();
        let path = path.into();
        let path = if path.trim().is_empty() { name.clone() } else { path };
        Self {
            name,
            path,
            default_model: None,
            timeout: Duration::from_secs(300),
            idle_timeout: None,
            phases: None,
            reasoning_effort: None,
            reasoning_effort_phases: HashMap::new(),
            token_discrepancy_threshold: 5.0,
            extra_env: HashMap::new(),
        }
    }

    /// Returns `true` if this config admits the given workflow phase.
    /// A missing `phases` map admits every phase.
    pub fn is_enabled_for_phase(&self, phase: &str) -> bool {
        match &self.phases {
            None => true,
            Some(map) => map.get(phase).copied().unwrap_or(false),
        }
    }

    pub fn executable_parts(&self) -> Vec<String> {
        self.path
            .split_whitespace()
            .map(|part| part.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_with_phases(phases: Option<HashMap<String, bool>>) -> AgentConfig {
        let mut cfg = AgentConfig::new("claude", "claude");
        cfg.phases = phases;
        cfg
    }

    #[test]
    fn missing_phases_map_admits_every_phase() {
        let cfg = cfg_with_phases(None);
        assert!(cfg.is_enabled_for_phase("analyze"));
        assert!(cfg.is_enabled_for_phase("execute"));
    }

    #[test]
    fn explicit_phase_flags_are_honoured() {
        let mut map = HashMap::new();
        map.insert("analyze".to_string(), true);
        map.insert("plan".to_string(), false);
        let cfg = cfg_with_phases(Some(map));
        assert!(cfg.is_enabled_for_phase("analyze"));
        assert!(!cfg.is_enabled_for_phase("plan"));
        assert!(!cfg.is_enabled_for_phase("execute"));
    }

    #[test]
    fn empty_phases_map_admits_nothing() {
        let cfg = cfg_with_phases(Some(HashMap::new()));
        assert!(!cfg.is_enabled_for_phase("analyze"));
        assert!(!cfg.is_enabled_for_phase("plan"));
        assert!(!cfg.is_enabled_for_phase("execute"));
    }
}
