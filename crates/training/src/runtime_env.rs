//! Process-wide accelerator settings exported before any worker thread starts.

pub const ALLOC_CONF_VAR: &str = "PYTORCH_CUDA_ALLOC_CONF";
pub const LAUNCH_BLOCKING_VAR: &str = "CUDA_LAUNCH_BLOCKING";

pub const DEFAULT_ALLOC_CONF: &str = "expandable_segments:True";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnv {
    /// Allocator behaviour, exported as `PYTORCH_CUDA_ALLOC_CONF`.
    pub alloc_conf: String,
    /// Synchronous kernel launches, exported as `CUDA_LAUNCH_BLOCKING=1`.
    pub launch_blocking: bool,
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        Self {
            alloc_conf: DEFAULT_ALLOC_CONF.to_string(),
            launch_blocking: true,
        }
    }
}

impl RuntimeEnv {
    /// Defaults, except for values the caller already exported.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut env = Self::default();
        if let Some(v) = lookup(ALLOC_CONF_VAR).filter(|v| !v.is_empty()) {
            env.alloc_conf = v;
        }
        if let Some(v) = lookup(LAUNCH_BLOCKING_VAR) {
            env.launch_blocking = matches!(v.trim(), "1" | "true" | "True");
        }
        env
    }

    pub fn vars(&self) -> [(&'static str, String); 2] {
        [
            (ALLOC_CONF_VAR, self.alloc_conf.clone()),
            (
                LAUNCH_BLOCKING_VAR,
                if self.launch_blocking { "1" } else { "0" }.to_string(),
            ),
        ]
    }

    /// Export both variables. Call from the main thread before spawning loader workers.
    pub fn apply(&self) {
        for (key, value) in self.vars() {
            std::env::set_var(key, &value);
            tracing::debug!(key, value = %value, "runtime env");
        }
    }
}
