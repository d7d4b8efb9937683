// ABOUTME: Pipeline operator semantics for <==, ==>, ==>>, <=/= (spec.md §4.5)

use crate::error::RuntimeError;
use crate::io::formats;
use crate::security::SecurityPolicy;
use crate::value::{Dict, FileHandle, FormatKind, IoSource, PathValue, UrlValue, Value};
use std::io::Write;
use std::rc::Rc;

fn resolve_path(source: &IoSource) -> Result<String, RuntimeError> {
    match source {
        IoSource::Path(p) => Ok(p.raw.clone()),
        IoSource::Url(u) => Ok(u.raw.clone()),
        IoSource::Sftp { path, .. } => Ok(path.clone()),
    }
}

/// `<==`: reads a File handle's source fully and decodes per its format
/// (spec.md §4.5). Security is consulted for filesystem and SFTP sources;
/// network fetches go through `fetch` instead.
pub fn read(handle: &FileHandle, policy: Option<&SecurityPolicy>) -> Result<Value, RuntimeError> {
    match &handle.source {
        IoSource::Path(path) => {
            if let Some(policy) = policy {
                policy.check_read(&path.raw)?;
            }
            let bytes = std::fs::read(&path.raw).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RuntimeError::io_not_found(&path.raw)
                } else {
                    RuntimeError::io_failure(format!("read {} failed: {e}", path.raw))
                }
            })?;
            formats::decode(handle.format, &bytes, &handle.options)
        }
        IoSource::Sftp { connection, path } => {
            if let Some(policy) = policy {
                policy.check_read(path)?;
            }
            let bytes = connection.borrow().read_file(path)?;
            formats::decode(handle.format, &bytes, &handle.options)
        }
        IoSource::Url(_) => Err(RuntimeError::state_error(
            "use the <=/= fetch operator to read from a URL, not <==",
        )),
    }
}

/// `==>`: truncate-writes `value` encoded per the destination format.
pub fn write(handle: &FileHandle, value: &Value, policy: Option<&SecurityPolicy>) -> Result<(), RuntimeError> {
    write_impl(handle, value, policy, false)
}

/// `==>>`: append-writes, text/lines formats only concatenate sensibly.
pub fn append(handle: &FileHandle, value: &Value, policy: Option<&SecurityPolicy>) -> Result<(), RuntimeError> {
    write_impl(handle, value, policy, true)
}

fn write_impl(
    handle: &FileHandle,
    value: &Value,
    policy: Option<&SecurityPolicy>,
    append: bool,
) -> Result<(), RuntimeError> {
    let path = resolve_path(&handle.source)?;
    if let Some(policy) = policy {
        policy.check_write(&path)?;
    }
    let bytes = formats::encode(handle.format, value)?;
    match &handle.source {
        IoSource::Path(p) => {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(&p.raw)
                .map_err(|e| RuntimeError::io_failure(format!("write {} failed: {e}", p.raw)))?;
            file.write_all(&bytes)
                .map_err(|e| RuntimeError::io_failure(format!("write {} failed: {e}", p.raw)))
        }
        IoSource::Sftp { connection, path } => {
            let existing = if append {
                connection.borrow().read_file(path).unwrap_or_default()
            } else {
                Vec::new()
            };
            let mut combined = existing;
            combined.extend_from_slice(&bytes);
            connection.borrow().write_file(path, &combined)
        }
        IoSource::Url(_) => Err(RuntimeError::state_error("cannot write to a Url value directly")),
    }
}

/// `<=/=`: HTTP(S) fetch through `ureq`, gated by the network policy
/// (spec.md §4.5 "HTTP fetch").
pub fn fetch(url: &UrlValue, policy: Option<&SecurityPolicy>) -> Result<Value, RuntimeError> {
    if let Some(policy) = policy {
        policy.check_net(&url.raw)?;
    }
    let response = ureq::get(&url.raw)
        .call()
        .map_err(|e| RuntimeError::network_failure(format!("GET {} failed: {e}", url.raw)))?;
    let body = response
        .into_string()
        .map_err(|e| RuntimeError::network_failure(format!("reading response body failed: {e}")))?;
    Ok(Value::String(body))
}

pub fn file_handle_for(path: PathValue, format: FormatKind) -> FileHandle {
    FileHandle { source: IoSource::Path(path), format, options: Dict::new() }
}

fn io_source_from(value: &Value) -> Result<IoSource, RuntimeError> {
    match value {
        Value::Path(p) => Ok(IoSource::Path(p.clone())),
        Value::Url(u) => Ok(IoSource::Url(u.clone())),
        Value::String(s) => Ok(IoSource::Path(PathValue { raw: s.clone() })),
        other => Err(RuntimeError::type_mismatch("format factory", "Path/Url/String", &other.type_name())),
    }
}

/// Format factories (spec.md glossary "Format factory"): `JSON(@./u.json)`,
/// `CSV(@./u.csv, {header: false})`, etc. wrap a path/URL in a typed file
/// handle carrying the codec and any decode/encode options.
fn format_factory(args: &[Value], format: FormatKind) -> Result<Value, RuntimeError> {
    let source = args
        .first()
        .ok_or_else(|| RuntimeError::type_mismatch("format factory", "Path/Url/String argument", "nothing"))?;
    let source = io_source_from(source)?;
    let options = match args.get(1) {
        Some(Value::Dictionary(d)) => d.borrow().clone(),
        _ => Dict::new(),
    };
    Ok(Value::File(Rc::new(FileHandle { source, format, options })))
}

pub fn json_factory(args: &[Value]) -> Result<Value, RuntimeError> {
    format_factory(args, FormatKind::Json)
}
pub fn csv_factory(args: &[Value]) -> Result<Value, RuntimeError> {
    format_factory(args, FormatKind::Csv)
}
pub fn yaml_factory(args: &[Value]) -> Result<Value, RuntimeError> {
    format_factory(args, FormatKind::Yaml)
}
pub fn text_factory(args: &[Value]) -> Result<Value, RuntimeError> {
    format_factory(args, FormatKind::Text)
}
pub fn lines_factory(args: &[Value]) -> Result<Value, RuntimeError> {
    format_factory(args, FormatKind::Lines)
}
pub fn bytes_factory(args: &[Value]) -> Result<Value, RuntimeError> {
    format_factory(args, FormatKind::Bytes)
}
pub fn svg_factory(args: &[Value]) -> Result<Value, RuntimeError> {
    format_factory(args, FormatKind::Svg)
}
pub fn md_factory(args: &[Value]) -> Result<Value, RuntimeError> {
    format_factory(args, FormatKind::Md)
}
pub fn pln_factory(args: &[Value]) -> Result<Value, RuntimeError> {
    format_factory(args, FormatKind::Pln)
}
