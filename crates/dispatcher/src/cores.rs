//! Core allocation
//!
//! Resolves which cores get a worker. The runtime environment variable
//! [`VISIBLE_CORES_ENV`] takes precedence over the configured value.

use coreloop_common::{CoreLoopError, Result};
use std::collections::BTreeSet;
use std::thread;
use tracing::debug;

/// Environment variable restricting the cores visible to the runtime
pub const VISIBLE_CORES_ENV: &str = "CORELOOP_VISIBLE_CORES";

/// Upper bound on the number of cores a single list may name
pub const MAX_CORES: usize = 4096;

/// Resolve the core list from the environment, falling back to `configured`
pub fn resolve_cores(configured: &str) -> Result<Vec<usize>> {
    match std::env::var(VISIBLE_CORES_ENV) {
        Ok(value) if !value.trim().is_empty() => {
            debug!(env = VISIBLE_CORES_ENV, value = %value, "Using cores from environment");
            parse_core_list(&value)
        }
        _ => parse_core_list(configured),
    }
}

/// Parse "auto", "0,2,5", "0-3" or a mix such as "0-1,4"
///
/// Order is preserved; duplicates, reversed ranges and empty lists are errors.
pub fn parse_core_list(spec: &str) -> Result<Vec<usize>> {
    let spec = spec.trim();
    if spec.eq_ignore_ascii_case("auto") {
        let count = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        return Ok((0..count).collect());
    }

    let mut cores = Vec::new();
    let mut seen = BTreeSet::new();

    for part in spec.split(',').map(str::trim) {
        if part.is_empty() {
            return Err(CoreLoopError::config(format!("Empty entry in core list '{}'", spec)));
        }

        let range = match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = parse_core(lo, spec)?;
                let hi: usize = parse_core(hi, spec)?;
                if lo > hi {
                    return Err(CoreLoopError::config(format!(
                        "Reversed core range '{}' in '{}'",
                        part, spec
                    )));
                }
                if hi - lo >= MAX_CORES {
                    return Err(CoreLoopError::config(format!(
                        "Core range '{}' in '{}' spans more than {} cores",
                        part, spec, MAX_CORES
                    )));
                }
                lo..=hi
            }
            None => {
                let core = parse_core(part, spec)?;
                core..=core
            }
        };

        for core in range {
            if !seen.insert(core) {
                return Err(CoreLoopError::config(format!(
                    "Core {} listed more than once in '{}'",
                    core, spec
                )));
            }
            cores.push(core);
        }
        if cores.len() > MAX_CORES {
            return Err(CoreLoopError::config(format!(
                "Core list '{}' names more than {} cores",
                spec, MAX_CORES
            )));
        }
    }

    Ok(cores)
}

fn parse_core(value: &str, spec: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| CoreLoopError::config(format!("Invalid core id '{}' in '{}'", value, spec)))
}
