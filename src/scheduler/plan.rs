//! Sharding plan: tests to pod-groups.
//!
//! Each group becomes one pod holding one test container per entry.

/// Partition `tests` into consecutive groups of at most `max_per_pod`.
///
/// Groups preserve input order and jointly cover the input exactly. An empty
/// input yields an empty plan.
pub fn plan(tests: &[String], max_per_pod: usize) -> Vec<Vec<String>> {
    assert!(max_per_pod >= 1, "max_per_pod must be at least 1");

    if tests.is_empty() {
        return Vec::new();
    }

    tests
        .chunks(max_per_pod)
        .map(|chunk| chunk.to_vec())
        .collect()
}
