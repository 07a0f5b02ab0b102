//! Small fixture helpers shared by the scenario tests.

use std::sync::atomic::{AtomicU32, Ordering};

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// A topic/group name unique within the test process.
pub fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{n}", std::process::id())
}

/// Key/value pairs `k0..kN` for produce calls.
pub fn keyed_entries(count: usize) -> Vec<(String, String)> {
    (0..count)
        .map(|i| (format!("k{i}"), format!("v{i}")))
        .collect()
}
