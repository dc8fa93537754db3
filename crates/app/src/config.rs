//! Runtime configuration for the streaming core.

use std::time::Duration;

use parley_connector_core::ModelConfig;

pub const DEFAULT_RENDER_TICK: Duration = Duration::from_millis(16);

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Upper bound on how long a non-forced update waits before it is flushed
    pub render_tick: Duration,
    /// Capacity of each session actor's command channel
    pub command_capacity: usize,
    /// Capacity of the persistence channel
    pub persist_capacity: usize,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    /// Initial value of the session-wide auto-approve policy
    pub always_approve: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            render_tick: DEFAULT_RENDER_TICK,
            command_capacity: 256,
            persist_capacity: 1000,
            model: None,
            system_prompt: None,
            always_approve: false,
        }
    }
}

impl CoreConfig {
    /// Model settings for one turn; a per-turn system prompt wins over the default.
    pub fn model_config(&self, system_override: Option<String>) -> ModelConfig {
        ModelConfig {
            model: self.model.clone(),
            system_prompt: system_override.or_else(|| self.system_prompt.clone()),
        }
    }
}
