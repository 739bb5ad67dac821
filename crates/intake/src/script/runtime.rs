//! Contract between the script engine and a concrete scripting runtime.

use std::time::Duration;

use serde_json::Value;

use super::types::EntryPoint;
use crate::error::ScriptError;

/// Resource limits applied to every script invocation.
#[derive(Debug, Clone)]
pub struct ScriptLimits {
    pub timeout: Duration,
    pub max_operations: u64,
    pub max_rows: usize,
    pub max_string_size: usize,
    pub max_collection_size: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5_000),
            max_operations: 1_000_000,
            max_rows: 5_000,
            max_string_size: 1 << 20,
            max_collection_size: 100_000,
        }
    }
}

/// A sandboxed interpreter for user scripts.
///
/// Implementations must not give scripts access to the filesystem, the
/// network or the host process, and must stop a script that runs past
/// `limits.timeout`. Calls are blocking; the engine runs them off the
/// async executor.
pub trait ScriptRuntime: Send + Sync + 'static {
    /// Checks that `source` parses and defines `entry`.
    fn check(&self, source: &str, entry: EntryPoint) -> Result<(), ScriptError>;

    /// Invokes `entry` with `args` converted to script values and returns
    /// the script's result as JSON.
    fn call(
        &self,
        source: &str,
        entry: EntryPoint,
        args: &[Value],
        limits: &ScriptLimits,
    ) -> Result<Value, ScriptError>;
}
