//! VM configuration

use crate::vm::{VmError, VmResult};
use serde::Deserialize;

/// Tunables for the execution core and its scheduler
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VmOptions {
    /// Number of worker threads for [`Scheduler::run_workers`](crate::Scheduler::run_workers)
    /// (0 = number of CPUs)
    pub worker_count: usize,

    /// Maximum number of frames on one fiber before a
    /// `StackOverflowException` is raised
    pub max_frame_depth: usize,

    /// Emit a `trace!` event for every dispatched op
    pub trace_ops: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            worker_count: 0,
            max_frame_depth: 1024,
            trace_ops: false,
        }
    }
}

impl VmOptions {
    /// Parse options from a TOML document; missing keys take their defaults
    pub fn from_toml_str(source: &str) -> VmResult<Self> {
        let options: VmOptions =
            toml::from_str(source).map_err(|e| VmError::Config(e.to_string()))?;
        if options.max_frame_depth == 0 {
            return Err(VmError::Config("max_frame_depth must be positive".into()));
        }
        Ok(options)
    }

    /// Worker count with the CPU default applied
    pub fn effective_workers(&self) -> usize {
        if self.worker_count == 0 {
            num_cpus::get()
        } else {
            self.worker_count
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = VmOptions::default();
        assert_eq!(opts.max_frame_depth, 1024);
        assert!(!opts.trace_ops);
        assert!(opts.effective_workers() >= 1);
    }

    #[test]
    fn test_partial_toml() {
        let opts = VmOptions::from_toml_str("worker_count = 3\ntrace_ops = true\n").unwrap();
        assert_eq!(opts.worker_count, 3);
        assert_eq!(opts.effective_workers(), 3);
        assert!(opts.trace_ops);
        assert_eq!(opts.max_frame_depth, 1024);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            VmOptions::from_toml_str("max_frame_depth = \"deep\""),
            Err(VmError::Config(_))
        ));
        assert!(VmOptions::from_toml_str("max_frame_depth = 0").is_err());
    }
}
