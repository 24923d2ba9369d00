//! Run-global aggregation of per-test results.
//!
//! [`JsonAggregator`] ingests the output of one [`Reporter`] at a time into
//! a single line-JSON file plus a per-platform / per-test tree of uploaded
//! files. The aggregated format is *not* the per-test record format: each
//! line is a top-level array with fixed field order
//!
//! ```text
//! [platform, status, test name, subtest name, files, note]
//! ```
//!
//! where `files` is a nested array of strings (`testout` first when
//! present, then the declared `files[].name`s) and missing fields become
//! nulls. Ingestion is all-or-nothing and at-most-once: the whole source
//! file is parsed before anything is written, a pre-existing per-test
//! destination refuses the ingest, and the source results file is deleted
//! afterwards (the aggregator moves, it does not copy).
//!
//! [`Reporter`]: crate::executor::Reporter

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    /// Target file, files root, or per-test destination already exists.
    #[error("{0} already exists")]
    Conflict(PathBuf),

    #[error("aggregator is not started")]
    NotStarted,

    /// A source line failed to parse; nothing was ingested.
    #[error("bad result line in {file}: {reason}")]
    BadRecord { file: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Thread-safe, append-only sink for per-test results and files.
pub struct JsonAggregator {
    target: PathBuf,
    files: PathBuf,
    output: Mutex<Option<File>>,
}

impl JsonAggregator {
    /// `target` is the aggregated line-JSON file, `files` the root of the
    /// per-platform / per-test uploaded-files tree.
    pub fn new(target: impl Into<PathBuf>, files: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            files: files.into(),
            output: Mutex::new(None),
        }
    }

    /// Creates the target file and files root; refuses leftovers.
    pub fn start(&self) -> Result<(), AggregatorError> {
        if self.target.exists() {
            return Err(AggregatorError::Conflict(self.target.clone()));
        }
        let output = File::create_new(&self.target)?;

        if self.files.exists() {
            return Err(AggregatorError::Conflict(self.files.clone()));
        }
        std::fs::create_dir(&self.files)?;

        *self.output.lock().unwrap() = Some(output);
        Ok(())
    }

    pub fn stop(&self) {
        self.output.lock().unwrap().take();
    }

    /// Where a given test's uploaded files end up.
    fn test_files_path(&self, platform: &str, test_name: &str) -> PathBuf {
        self.files
            .join(platform)
            .join(test_name.trim_start_matches('/'))
    }

    /// Ingests one test's results file and files directory.
    ///
    /// Appends the converted records to the aggregated output, deletes
    /// `results_file`, and moves a non-empty `files_dir` under
    /// `<files>/<platform>/<test>`. Any parse failure aborts before any
    /// output is written.
    pub fn ingest(
        &self,
        platform: &str,
        test_name: &str,
        results_file: &Path,
        files_dir: &Path,
    ) -> Result<(), AggregatorError> {
        let dest = self.test_files_path(platform, test_name);
        if dest.exists() {
            return Err(AggregatorError::Conflict(dest));
        }

        // parse everything before writing anything, so either all results
        // from the test are ingested or none at all
        let source = std::fs::read_to_string(results_file)?;
        let mut output_lines = String::new();
        for line in source.lines() {
            let row = convert_line(platform, test_name, line).map_err(|reason| {
                AggregatorError::BadRecord {
                    file: results_file.to_owned(),
                    reason,
                }
            })?;
            output_lines.push_str(&row);
            output_lines.push('\n');
        }

        {
            let mut guard = self.output.lock().unwrap();
            let output = guard.as_mut().ok_or(AggregatorError::NotStarted)?;
            output.write_all(output_lines.as_bytes())?;
            output.flush()?;
        }

        std::fs::remove_file(results_file)?;

        if files_dir.read_dir()?.next().is_some() {
            std::fs::create_dir_all(dest.parent().unwrap_or(&self.files))?;
            move_dir(files_dir, &dest)?;
        }
        Ok(())
    }
}

/// Converts one per-test record line into an aggregated row.
fn convert_line(platform: &str, test_name: &str, line: &str) -> Result<String, String> {
    let record: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let record = record.as_object().ok_or("record is not an object")?;

    let status = record.get("status").cloned().ok_or("record has no status")?;

    let mut file_names = Vec::new();
    if let Some(testout) = record.get("testout") {
        file_names.push(testout.clone());
    }
    if let Some(files) = record.get("files") {
        let files = files.as_array().ok_or("'files' is not a list")?;
        for file in files {
            file_names.push(file.get("name").cloned().ok_or("file entry has no name")?);
        }
    }

    let row = Value::Array(vec![
        Value::String(platform.to_owned()),
        status,
        Value::String(test_name.to_owned()),
        record.get("name").cloned().unwrap_or(Value::Null),
        Value::Array(file_names),
        record.get("note").cloned().unwrap_or(Value::Null),
    ]);
    Ok(row.to_string())
}

/// Renames `src` to `dst`, falling back to copy-and-unlink across devices.
fn move_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_tree(src, dst)?;
            std::fs::remove_dir_all(src)
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        tmp: tempfile::TempDir,
        aggregator: JsonAggregator,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let aggregator = JsonAggregator::new(
                tmp.path().join("results.json"),
                tmp.path().join("files"),
            );
            aggregator.start().unwrap();
            Self { tmp, aggregator }
        }

        /// Lays out one test's Reporter output on disk.
        fn test_output(&self, name: &str, results: &str, files: &[(&str, &[u8])]) -> (PathBuf, PathBuf) {
            let dir = self.tmp.path().join("out").join(name);
            let files_dir = dir.join("files");
            std::fs::create_dir_all(&files_dir).unwrap();
            let results_file = dir.join("results");
            std::fs::write(&results_file, results).unwrap();
            for (file_name, content) in files {
                let path = files_dir.join(file_name);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, content).unwrap();
            }
            (results_file, files_dir)
        }

        fn global_lines(&self) -> Vec<String> {
            std::fs::read_to_string(self.tmp.path().join("results.json"))
                .unwrap()
                .lines()
                .map(str::to_owned)
                .collect()
        }
    }

    #[test]
    fn ingest_converts_and_takes_ownership() {
        let f = Fixture::new();
        let (results, files) = f.test_output(
            "t1",
            "{\"status\":\"pass\",\"testout\":\"out.txt\",\"files\":[{\"name\":\"out.txt\",\"length\":11}]}\n",
            &[("out.txt", b"passing\nOK\n")],
        );

        f.aggregator
            .ingest("rhel-10-x86_64", "/pkgs/test_require", &results, &files)
            .unwrap();

        assert_eq!(
            f.global_lines(),
            vec![
                r#"["rhel-10-x86_64","pass","/pkgs/test_require",null,["out.txt","out.txt"],null]"#
            ]
        );
        // mv, not cp: source results gone, files relocated
        assert!(!results.exists());
        assert!(!files.exists());
        let moved = f
            .tmp
            .path()
            .join("files/rhel-10-x86_64/pkgs/test_require/out.txt");
        assert_eq!(std::fs::read(moved).unwrap(), b"passing\nOK\n");
    }

    #[test]
    fn subresults_and_notes_round_trip() {
        let f = Fixture::new();
        let (results, files) = f.test_output(
            "t1",
            concat!(
                "{\"status\":\"fail\",\"name\":\"sub/one\",\"note\":\"flaked\"}\n",
                "{\"status\":\"pass\"}\n",
            ),
            &[],
        );
        f.aggregator
            .ingest("fedora-42-aarch64", "/scan/test", &results, &files)
            .unwrap();
        assert_eq!(
            f.global_lines(),
            vec![
                r#"["fedora-42-aarch64","fail","/scan/test","sub/one",[],"flaked"]"#,
                r#"["fedora-42-aarch64","pass","/scan/test",null,[],null]"#,
            ]
        );
    }

    #[test]
    fn malformed_line_aborts_without_any_writes() {
        let f = Fixture::new();
        let (results, files) = f.test_output(
            "t1",
            concat!(
                "{\"status\":\"pass\"}\n",
                "{\"status\":\"fail\",\"name\":\"sub\"}\n",
                "{\"status\": oops\n",
            ),
            &[("log", b"data")],
        );

        let err = f
            .aggregator
            .ingest("p", "/test", &results, &files)
            .unwrap_err();
        assert!(matches!(err, AggregatorError::BadRecord { .. }));

        // nothing written, source untouched
        assert!(f.global_lines().is_empty());
        assert!(results.exists());
        assert!(files.join("log").exists());
    }

    #[test]
    fn missing_status_aborts_too() {
        let f = Fixture::new();
        let (results, files) = f.test_output("t1", "{\"name\":\"sub\"}\n", &[]);
        assert!(matches!(
            f.aggregator.ingest("p", "/test", &results, &files),
            Err(AggregatorError::BadRecord { .. })
        ));
        assert!(results.exists());
    }

    #[test]
    fn per_test_destination_is_at_most_once() {
        let f = Fixture::new();
        let (r1, d1) = f.test_output("t1", "{\"status\":\"pass\"}\n", &[("a", b"1")]);
        f.aggregator.ingest("p", "/test", &r1, &d1).unwrap();

        let (r2, d2) = f.test_output("t2", "{\"status\":\"fail\"}\n", &[("b", b"2")]);
        assert!(matches!(
            f.aggregator.ingest("p", "/test", &r2, &d2),
            Err(AggregatorError::Conflict(_))
        ));
        // the conflicting ingest wrote nothing
        assert_eq!(f.global_lines().len(), 1);
        assert!(r2.exists());
    }

    #[test]
    fn empty_files_dir_is_not_relocated() {
        let f = Fixture::new();
        let (results, files) = f.test_output("t1", "{\"status\":\"pass\"}\n", &[]);
        f.aggregator.ingest("p", "/test", &results, &files).unwrap();
        assert!(!f.tmp.path().join("files/p/test").exists());
    }

    #[test]
    fn start_refuses_existing_outputs_and_stop_closes() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("results.json"), "stale").unwrap();
        let aggregator =
            JsonAggregator::new(tmp.path().join("results.json"), tmp.path().join("files"));
        assert!(matches!(
            aggregator.start(),
            Err(AggregatorError::Conflict(_))
        ));

        let f = Fixture::new();
        f.aggregator.stop();
        let (results, files) = f.test_output("t1", "{\"status\":\"pass\"}\n", &[]);
        assert!(matches!(
            f.aggregator.ingest("p", "/test", &results, &files),
            Err(AggregatorError::NotStarted)
        ));
    }

    #[test]
    fn reverse_ingest_order_yields_the_same_line_set() {
        let make = |f: &Fixture, names: &[&str]| {
            for name in names {
                let (r, d) =
                    f.test_output(&name.replace('/', "_"), "{\"status\":\"pass\"}\n", &[]);
                f.aggregator.ingest("p", name, &r, &d).unwrap();
            }
        };

        let forward = Fixture::new();
        make(&forward, &["/a", "/b", "/c"]);
        let backward = Fixture::new();
        make(&backward, &["/c", "/b", "/a"]);

        let mut fwd = forward.global_lines();
        let mut bwd = backward.global_lines();
        assert!(!fwd.is_empty());
        fwd.sort();
        bwd.sort();
        assert_eq!(fwd, bwd);
    }
}
