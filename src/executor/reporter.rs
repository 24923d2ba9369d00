//! Per-test artifact sink on the orchestrator host.
//!
//! A [`Reporter`] owns one test's output directory: the line-JSON results
//! file, the uploaded-files tree, and the hidden live capture of the test's
//! output (`testout.temp`). The capture is hard-linked to its final name
//! when a result declares `testout`, so appends made after the report still
//! materialise under the chosen name; the temp name itself is deleted on
//! `stop()`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use serde_json::{Map, Value};

/// Internal capture name inside the output dir; hardlinked to
/// `testout`-specified result entries, deleted on stop.
const TESTOUT: &str = "testout.temp";

#[derive(Debug, thiserror::Error)]
pub enum ReporterError {
    #[error("{0} already exists")]
    AlreadyExists(PathBuf),

    #[error("reporter is not started")]
    NotStarted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Collects reported results and uploaded files for one test execution.
pub struct Reporter {
    output_dir: PathBuf,
    results_file: PathBuf,
    files_dir: PathBuf,
    testout_file: PathBuf,
    results: Mutex<Option<File>>,
}

impl Reporter {
    /// `results_file` and `files_dir` are names inside `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>, results_file: &str, files_dir: &str) -> Self {
        let output_dir = output_dir.into();
        Self {
            results_file: output_dir.join(results_file),
            files_dir: output_dir.join(files_dir),
            testout_file: output_dir.join(TESTOUT),
            output_dir,
            results: Mutex::new(None),
        }
    }

    pub fn results_file(&self) -> &Path {
        &self.results_file
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    /// Creates the output directory and its contents, refusing leftovers
    /// from a previous run.
    pub fn start(&self) -> Result<(), ReporterError> {
        std::fs::create_dir_all(&self.output_dir)?;

        if self.results_file.exists() {
            return Err(ReporterError::AlreadyExists(self.results_file.clone()));
        }
        let results = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&self.results_file)?;

        if self.testout_file.exists() {
            return Err(ReporterError::AlreadyExists(self.testout_file.clone()));
        }
        File::create(&self.testout_file)?;

        if self.files_dir.exists() {
            return Err(ReporterError::AlreadyExists(self.files_dir.clone()));
        }
        std::fs::create_dir(&self.files_dir)?;

        *self.results.lock().unwrap() = Some(results);
        Ok(())
    }

    /// Closes the results file and removes the testout capture.
    pub fn stop(&self) {
        self.results.lock().unwrap().take();
        match std::fs::remove_file(&self.testout_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("failed to remove {}: {e}", self.testout_file.display()),
        }
    }

    /// Persists one result record as a JSON line.
    pub fn report(&self, record: &Map<String, Value>) -> Result<(), ReporterError> {
        let mut guard = self.results.lock().unwrap();
        let results = guard.as_mut().ok_or(ReporterError::NotStarted)?;
        serde_json::to_writer(&mut *results, &Value::Object(record.clone()))
            .map_err(std::io::Error::other)?;
        results.write_all(b"\n")?;
        results.flush()?;
        Ok(())
    }

    fn dest_path(&self, file_name: &str, result_name: Option<&str>) -> Result<PathBuf, ReporterError> {
        // files_dir / path/to/subtest / path/to/file.log
        let mut path = self.files_dir.clone();
        if let Some(result_name) = result_name {
            path.push(normalize_path(result_name));
        }
        path.push(normalize_path(file_name));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    /// Opens a file named `file_name` in the directory of `result_name`
    /// (or of the test itself when `None`), creating parent directories.
    pub fn open_file(
        &self,
        file_name: &str,
        append: bool,
        result_name: Option<&str>,
    ) -> Result<File, ReporterError> {
        let path = self.dest_path(file_name, result_name)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        Ok(file)
    }

    /// Opens the live testout capture for appending.
    pub fn open_testout(&self) -> Result<File, ReporterError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.testout_file)?;
        Ok(file)
    }

    pub fn testout_exists(&self) -> bool {
        self.testout_file.exists()
    }

    /// Hard-links the testout capture under its result-declared name, so
    /// subsequent appends show up there too. A file already uploaded under
    /// that name wins over the capture.
    pub fn link_testout(&self, file_name: &str, result_name: Option<&str>) -> Result<(), ReporterError> {
        let path = self.dest_path(file_name, result_name)?;
        if path.exists() {
            return Ok(());
        }
        std::fs::hard_link(&self.testout_file, path)?;
        Ok(())
    }
}

/// Strips leading separators and any `..` component from a reported path.
fn normalize_path(path: &str) -> PathBuf {
    Path::new(path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}
