use std::env;
use std::sync::OnceLock;

static NNDEV_STRICT: OnceLock<bool> = OnceLock::new();
static NNDEV_NUM_THREAD: OnceLock<Option<usize>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn strict_enabled() -> bool {
    *NNDEV_STRICT.get_or_init(|| match env::var("NNDEV_STRICT") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

pub(crate) fn num_thread_override() -> Option<usize> {
    *NNDEV_NUM_THREAD.get_or_init(|| {
        env::var("NNDEV_NUM_THREAD")
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|threads| *threads > 0)
    })
}

/// Device behaviour knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Panic on caller-ordering mistakes instead of returning an error.
    pub strict: bool,
    /// Thread count handed to engines when the host passes `0`.
    pub default_num_thread: usize,
}

impl DeviceOptions {
    /// Reads `NNDEV_STRICT` and `NNDEV_NUM_THREAD` (cached for the process lifetime).
    pub fn from_env() -> Self {
        Self {
            strict: strict_enabled(),
            default_num_thread: num_thread_override().unwrap_or(1),
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn default_num_thread(mut self, threads: usize) -> Self {
        self.default_num_thread = threads.max(1);
        self
    }
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            strict: false,
            default_num_thread: 1,
        }
    }
}
