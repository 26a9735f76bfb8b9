//! Test enumeration.
//!
//! Runs a cut-down job whose single container executes the list command,
//! captures its output into a buffer, and splits it into test names.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterError, ClusterExecutor, LogSink};
use crate::config::{ConfigError, DistributedConfig, JobConfig};

use super::{spec, DiagnosticSink, Phase, RunFailure};

/// Enumerate the tests to shard.
///
/// The listing pod is derived from the job with prepare steps cleared and
/// distribution disabled; its entire output is buffered, split by the list
/// delimiter, and optionally filtered by the configured pattern. Entries
/// left empty by the split are dropped; order and duplicates are preserved.
/// An empty result is not an error.
pub(super) async fn list_tests<C>(
    executor: &C,
    job: &JobConfig,
    distributed: &DistributedConfig,
    token: Option<&str>,
    diag: &DiagnosticSink,
    cancel: &CancellationToken,
) -> Result<Vec<String>, RunFailure>
where
    C: ClusterExecutor,
{
    // An invalid pattern must fail before any pod runs.
    let pattern = match &distributed.pattern {
        Some(pattern) => Some(
            Regex::new(pattern)
                .map_err(|err| RunFailure::Config(ConfigError::InvalidPattern(err)))?,
        ),
        None => None,
    };

    let mut list_job = job.clone();
    list_job.prepare.steps.clear();
    list_job.distributed = None;

    let pod = spec::single_pod(&list_job, &distributed.list_command, token);

    let buffer = Arc::new(Mutex::new(String::new()));
    let sink: LogSink = {
        let buffer = Arc::clone(&buffer);
        Arc::new(move |event| {
            if !event.finished {
                let mut buffer = buffer.lock().unwrap();
                buffer.push_str(&event.chunk);
                buffer.push('\n');
            }
        })
    };

    let start = Instant::now();
    let outcome = executor.submit(&pod, sink, cancel).await;
    let _ = writeln!(
        diag.lock().unwrap(),
        "list: elapsed time {:.2} sec",
        start.elapsed().as_secs_f64()
    );

    match outcome {
        Ok(()) => {}
        Err(ClusterError::Cancelled) => return Err(RunFailure::Cancelled),
        Err(source) => {
            return Err(RunFailure::Infra {
                phase: Phase::List,
                source,
            })
        }
    }

    let output = buffer.lock().unwrap().clone();
    Ok(split_tests(
        &output,
        distributed.list_delimiter(),
        pattern.as_ref(),
    ))
}

fn split_tests(output: &str, delimiter: &str, pattern: Option<&Regex>) -> Vec<String> {
    output
        .trim_end_matches('\n')
        .split(delimiter)
        .filter(|entry| !entry.is_empty())
        .filter(|entry| pattern.map_or(true, |p| p.is_match(entry)))
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_newlines_by_default() {
        let tests = split_tests("a\nb\nc\n", "\n", None);
        assert_eq!(tests, vec!["a", "b", "c"]);
    }

    #[test]
    fn custom_delimiter() {
        let tests = split_tests("a b c\n", " ", None);
        assert_eq!(tests, vec!["a", "b", "c"]);
    }

    #[test]
    fn pattern_keeps_only_matches() {
        let pattern = Regex::new("^Test").unwrap();
        let tests = split_tests("TestA\nSkipMe\nTestB\n", "\n", Some(&pattern));
        assert_eq!(tests, vec!["TestA", "TestB"]);
    }

    #[test]
    fn empty_output_is_empty_list() {
        assert!(split_tests("", "\n", None).is_empty());
        assert!(split_tests("\n\n", "\n", None).is_empty());
    }

    #[test]
    fn duplicates_and_order_preserved() {
        let tests = split_tests("b\na\nb\n", "\n", None);
        assert_eq!(tests, vec!["b", "a", "b"]);
    }
}
