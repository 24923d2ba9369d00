//! The test-control protocol state machine.
//!
//! A running test talks to the executor over a line-JSON control stream,
//! with raw file payload bytes interleaved in exact declared counts:
//!
//! | frame | effect |
//! |-------|--------|
//! | `{"report": {…}}` | merge/emit a result record (see partial rules) |
//! | `{"file": {"name", "length", "append"?, "result"?}}` | receive payload bytes |
//! | `{"duration": {"op", "value"}}` | adjust the run deadline |
//! | `{"duration_save"}` / `{"duration_restore"}` | snapshot remaining time |
//! | `{"reboot"}` | announce an intentional disconnect |
//!
//! A record with `"partial": true` is merged into pending state for its
//! `name` instead of being emitted; a later non-partial record for the same
//! name merges on top and emits. Merging is by incoming value type:
//! scalars replace, lists concatenate, objects shallow-merge later-wins,
//! `null` deletes the key. Pending records still unemitted when the stream
//! ends are flushed in first-seen order.

use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use super::{Deadline, ExecutorError, Reporter};
use crate::util::LineReader;

/// Control lines are small; payloads bypass the line buffer entirely.
const CONTROL_LINE_MAX: usize = 4096;

const PAYLOAD_CHUNK: usize = 8192;

/// Why the control stream stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// End of stream: the test (or its transport) is gone.
    Eof,
    /// The test announced an intentional disconnect.
    Reboot,
}

/// Record state carried across transport reattaches within one execution.
#[derive(Default)]
pub struct ControlState {
    /// Pending partial records in first-seen order, keyed by subresult
    /// name (`None` is the test itself).
    pending: Vec<(Option<String>, Map<String, Value>)>,
    /// Whether a record for the test itself was emitted.
    reported_self: bool,
    /// Whether a `reboot` frame preceded the last disconnect.
    pub expect_reboot: bool,
}

impl ControlState {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending_index(&self, name: Option<&str>) -> Option<usize> {
        self.pending
            .iter()
            .position(|(n, _)| n.as_deref() == name)
    }
}

/// Reads control frames from `control` until the stream ends, a reboot is
/// announced, the deadline passes, or the test violates the protocol.
pub async fn process_stream<R: AsyncRead + Unpin>(
    control: R,
    state: &mut ControlState,
    reporter: &Reporter,
    deadline: &mut Deadline,
) -> Result<StreamEnd, ExecutorError> {
    // one byte per read call: payload bytes after a `file` frame must not
    // end up inside the line buffer
    let mut reader = LineReader::with_limits(control, CONTROL_LINE_MAX, 1);

    loop {
        let line = tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline.end().into()) => {
                return Err(ExecutorError::TestAborted("duration exceeded".into()));
            }
            line = reader.read_line() => {
                line.map_err(|e| ExecutorError::BadControl(e.to_string()))?
            }
        };
        let Some(line) = line else {
            return Ok(StreamEnd::Eof);
        };
        if line.is_empty() {
            continue;
        }

        let frame: Value = serde_json::from_slice(&line).map_err(|e| {
            ExecutorError::BadReportJson(format!(
                "{e}: {}",
                String::from_utf8_lossy(&line)
            ))
        })?;
        let Value::Object(frame) = frame else {
            return Err(ExecutorError::BadControl(format!(
                "control frame is not an object: {frame}"
            )));
        };

        if let Some(report) = frame.get("report") {
            handle_report(report, state, reporter)?;
        } else if let Some(file) = frame.get("file") {
            handle_file(file, &mut reader, reporter, deadline).await?;
        } else if let Some(adjust) = frame.get("duration") {
            handle_duration(adjust, deadline)?;
        } else if frame.contains_key("duration_save") {
            deadline.save();
        } else if frame.contains_key("duration_restore") {
            deadline.restore();
        } else if frame.contains_key("reboot") {
            debug!("test announced a reboot");
            state.expect_reboot = true;
            return Ok(StreamEnd::Reboot);
        } else {
            return Err(ExecutorError::BadControl(format!(
                "unknown control frame: {}",
                Value::Object(frame)
            )));
        }
    }
}

/// Finalizes the record state once the test is done: flushes pending
/// partial records and, unless suppressed or already reported, synthesises
/// the exit-code fallback result for the test itself.
pub fn finish(
    state: &mut ControlState,
    exit_code: i32,
    reporter: &Reporter,
    suppress_fallback: bool,
) -> Result<(), ExecutorError> {
    for (name, record) in std::mem::take(&mut state.pending) {
        emit_record(name, record, state, reporter)?;
    }

    if !state.reported_self && !suppress_fallback {
        let mut fallback = Map::new();
        let status = if exit_code == 0 { "pass" } else { "fail" };
        fallback.insert("status".into(), Value::String(status.into()));
        fallback.insert("testout".into(), Value::String("output.txt".into()));
        emit_record(None, fallback, state, reporter)?;
    }
    Ok(())
}

fn handle_report(
    report: &Value,
    state: &mut ControlState,
    reporter: &Reporter,
) -> Result<(), ExecutorError> {
    let Value::Object(record) = report else {
        return Err(ExecutorError::BadReportJson(format!(
            "report is not an object: {report}"
        )));
    };
    let mut record = record.clone();

    let partial = matches!(record.remove("partial"), Some(Value::Bool(true)));
    let name = match record.get("name") {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(ExecutorError::BadReportJson(format!(
                "'name' is not a string: {other}"
            )));
        }
    };

    if partial {
        match state.pending_index(name.as_deref()) {
            Some(idx) => merge_record(&mut state.pending[idx].1, record),
            None => state.pending.push((name, record)),
        }
        return Ok(());
    }

    let merged = match state.pending_index(name.as_deref()) {
        Some(idx) => {
            let (_, mut base) = state.pending.remove(idx);
            merge_record(&mut base, record);
            base
        }
        None => record,
    };
    emit_record(name, merged, state, reporter)
}

fn emit_record(
    name: Option<String>,
    record: Map<String, Value>,
    state: &mut ControlState,
    reporter: &Reporter,
) -> Result<(), ExecutorError> {
    match record.get("testout") {
        None => {}
        Some(Value::String(testout)) if !testout.is_empty() => {
            if reporter.testout_exists() {
                reporter.link_testout(testout, name.as_deref())?;
            }
        }
        Some(Value::String(_)) => {
            return Err(ExecutorError::BadReportJson(
                "'testout' specified, but empty".into(),
            ));
        }
        Some(other) => {
            return Err(ExecutorError::BadReportJson(format!(
                "'testout' is not a string: {other}"
            )));
        }
    }

    if name.is_none() {
        state.reported_self = true;
    }
    reporter.report(&record)?;
    Ok(())
}

async fn handle_file<R: AsyncRead + Unpin>(
    file: &Value,
    reader: &mut LineReader<R>,
    reporter: &Reporter,
    deadline: &Deadline,
) -> Result<(), ExecutorError> {
    let name = file
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ExecutorError::BadControl("file frame without a name".into()))?;
    let length = file
        .get("length")
        .and_then(Value::as_u64)
        .ok_or_else(|| ExecutorError::BadControl("file frame without a length".into()))?;
    let append = matches!(file.get("append"), Some(Value::Bool(true)));
    let result_name = match file.get("result") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.as_str()),
        Some(other) => {
            return Err(ExecutorError::BadControl(format!(
                "file frame 'result' is not a string: {other}"
            )));
        }
    };

    debug!("receiving file {name} ({length} bytes)");
    let mut dest = tokio::fs::File::from_std(reporter.open_file(name, append, result_name)?);

    // the declared byte count follows verbatim on the control stream
    let mut remaining = length as usize;
    let mut buf = [0u8; PAYLOAD_CHUNK];
    while remaining > 0 {
        let upto = remaining.min(PAYLOAD_CHUNK);
        let read = tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline.end().into()) => {
                return Err(ExecutorError::TestAborted("duration exceeded".into()));
            }
            n = reader.get_mut().read(&mut buf[..upto]) => n?,
        };
        if read == 0 {
            return Err(ExecutorError::BadControl("EOF when reading data".into()));
        }
        tokio::io::AsyncWriteExt::write_all(&mut dest, &buf[..read]).await?;
        remaining -= read;
    }
    tokio::io::AsyncWriteExt::flush(&mut dest).await?;
    Ok(())
}

fn handle_duration(adjust: &Value, deadline: &mut Deadline) -> Result<(), ExecutorError> {
    let op = adjust.get("op").and_then(Value::as_str).unwrap_or("");
    let value = adjust
        .get("value")
        .and_then(Value::as_str)
        .ok_or_else(|| ExecutorError::BadControl("duration frame without a value".into()))?;
    let applied = match op {
        "set" => deadline.set(value),
        "add" => deadline.add(value),
        "sub" => deadline.sub(value),
        other => {
            return Err(ExecutorError::BadControl(format!(
                "unknown duration op {other:?}"
            )));
        }
    };
    applied.map_err(|e| ExecutorError::BadControl(e.to_string()))
}

/// Merges `incoming` into `base`, dispatching on each incoming value type:
/// scalars replace, lists concatenate, objects shallow-merge with later
/// keys winning, and `null` deletes the key.
fn merge_record(base: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        match value {
            Value::Null => {
                base.remove(&key);
            }
            Value::Array(items) => match base.get_mut(&key) {
                Some(Value::Array(existing)) => existing.extend(items),
                _ => {
                    base.insert(key, Value::Array(items));
                }
            },
            Value::Object(fields) => match base.get_mut(&key) {
                Some(Value::Object(existing)) => existing.extend(fields),
                _ => {
                    base.insert(key, Value::Object(fields));
                }
            },
            scalar => {
                base.insert(key, scalar);
            }
        }
    }
}
