// ABOUTME: Encode/decode between Value and the wire formats a File/Dir handle is bound to (spec.md §4.5)

use crate::error::RuntimeError;
use crate::value::{Dict, FormatKind, Value};
use std::cell::RefCell;
use std::rc::Rc;

pub fn decode(format: FormatKind, bytes: &[u8], options: &Dict) -> Result<Value, RuntimeError> {
    match format {
        FormatKind::Json => decode_json(bytes),
        FormatKind::Csv => decode_csv(bytes, options),
        FormatKind::Yaml => decode_yaml(bytes),
        FormatKind::Text | FormatKind::Svg | FormatKind::Md => {
            Ok(Value::String(String::from_utf8_lossy(bytes).to_string()))
        }
        FormatKind::Lines => {
            let text = String::from_utf8_lossy(bytes);
            let lines: Vec<Value> = text.lines().map(|l| Value::String(l.to_string())).collect();
            Ok(Value::Array(Rc::new(RefCell::new(lines))))
        }
        FormatKind::Bytes => {
            let ints: Vec<Value> = bytes.iter().map(|b| Value::Integer(*b as i64)).collect();
            Ok(Value::Array(Rc::new(RefCell::new(ints))))
        }
        FormatKind::Pln => crate::pln::parse(&String::from_utf8_lossy(bytes)),
        FormatKind::Dir | FormatKind::AutoFile => {
            Err(RuntimeError::io_failure("format requires a directory/auto-detect reader, not raw bytes"))
        }
    }
}

pub fn encode(format: FormatKind, value: &Value) -> Result<Vec<u8>, RuntimeError> {
    match format {
        FormatKind::Json => encode_json(value),
        FormatKind::Csv => encode_csv(value),
        FormatKind::Yaml => encode_yaml(value),
        FormatKind::Text | FormatKind::Svg | FormatKind::Md => Ok(value.to_string().into_bytes()),
        FormatKind::Lines => {
            let Value::Array(items) = value else {
                return Err(RuntimeError::type_mismatch("lines write", "Array", &value.type_name()));
            };
            let joined = items.borrow().iter().map(|v| v.to_string()).collect::<Vec<_>>().join("\n");
            Ok(joined.into_bytes())
        }
        FormatKind::Bytes => {
            let Value::Array(items) = value else {
                return Err(RuntimeError::type_mismatch("bytes write", "Array", &value.type_name()));
            };
            let mut out = Vec::new();
            for item in items.borrow().iter() {
                if let Value::Integer(n) = item {
                    out.push(*n as u8);
                }
            }
            Ok(out)
        }
        FormatKind::Pln => Ok(crate::pln::write(value).into_bytes()),
        FormatKind::Dir | FormatKind::AutoFile => {
            Err(RuntimeError::io_failure("format requires a directory/auto-detect writer, not raw bytes"))
        }
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as J;
    match value {
        Value::Integer(n) => J::Number((*n).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f).map(J::Number).unwrap_or(J::Null),
        Value::String(s) => J::String(s.clone()),
        Value::Boolean(b) => J::Bool(*b),
        Value::Null => J::Null,
        Value::Array(items) => J::Array(items.borrow().iter().map(value_to_json).collect()),
        Value::Dictionary(dict) => {
            let mut map = serde_json::Map::new();
            for (k, v) in dict.borrow().iter() {
                map.insert(k.clone(), value_to_json(v));
            }
            J::Object(map)
        }
        other => J::String(other.to_string()),
    }
}

fn json_to_value(json: &serde_json::Value) -> Value {
    use serde_json::Value as J;
    match json {
        J::Null => Value::Null,
        J::Bool(b) => Value::Boolean(*b),
        J::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        J::String(s) => Value::String(s.clone()),
        J::Array(items) => {
            Value::Array(Rc::new(RefCell::new(items.iter().map(json_to_value).collect())))
        }
        J::Object(map) => {
            let mut dict = Dict::new();
            for (k, v) in map {
                dict.insert(k.clone(), json_to_value(v));
            }
            Value::Dictionary(Rc::new(RefCell::new(dict)))
        }
    }
}

fn decode_json(bytes: &[u8]) -> Result<Value, RuntimeError> {
    let parsed: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| RuntimeError::value_decode_error("json", e.to_string()))?;
    Ok(json_to_value(&parsed))
}

fn encode_json(value: &Value) -> Result<Vec<u8>, RuntimeError> {
    serde_json::to_vec_pretty(&value_to_json(value))
        .map_err(|e| RuntimeError::io_failure(format!("json encode failed: {e}")))
}

fn decode_yaml(bytes: &[u8]) -> Result<Value, RuntimeError> {
    let parsed: serde_yaml::Value = serde_yaml::from_slice(bytes)
        .map_err(|e| RuntimeError::value_decode_error("yaml", e.to_string()))?;
    let json = serde_json::to_value(parsed)
        .map_err(|e| RuntimeError::value_decode_error("yaml", e.to_string()))?;
    Ok(json_to_value(&json))
}

fn encode_yaml(value: &Value) -> Result<Vec<u8>, RuntimeError> {
    let json = value_to_json(value);
    serde_yaml::to_string(&json)
        .map(|s| s.into_bytes())
        .map_err(|e| RuntimeError::io_failure(format!("yaml encode failed: {e}")))
}

/// Decodes CSV (spec.md §4.5). Unquoted fields that parse as integer,
/// float, `true`, or `false` convert to those types; everything else stays
/// a string. `{header: false}` treats every row as data, with columns
/// named positionally (`"0"`, `"1"`, ...) instead of reading a header row.
fn decode_csv(bytes: &[u8], options: &Dict) -> Result<Value, RuntimeError> {
    let has_header = match options.get("header") {
        Some(Value::Boolean(b)) => *b,
        _ => true,
    };
    let mut builder = csv::ReaderBuilder::new();
    builder.has_headers(has_header);
    let mut reader = builder.from_reader(bytes);

    let headers: Vec<String> = if has_header {
        reader
            .headers()
            .map_err(|e| RuntimeError::value_decode_error("csv", e.to_string()))?
            .iter()
            .map(|s| s.to_string())
            .collect()
    } else {
        Vec::new()
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| RuntimeError::value_decode_error("csv", e.to_string()))?;
        let mut dict = Dict::new();
        for (i, field) in record.iter().enumerate() {
            let key = headers.get(i).cloned().unwrap_or_else(|| i.to_string());
            dict.insert(key, csv_field_value(field));
        }
        rows.push(Value::Dictionary(Rc::new(RefCell::new(dict))));
    }
    Ok(Value::Array(Rc::new(RefCell::new(rows))))
}

fn csv_field_value(field: &str) -> Value {
    match field {
        "true" => return Value::Boolean(true),
        "false" => return Value::Boolean(false),
        _ => {}
    }
    if let Ok(n) = field.parse::<i64>() {
        return Value::Integer(n);
    }
    if let Ok(f) = field.parse::<f64>() {
        return Value::Float(f);
    }
    Value::String(field.to_string())
}

fn encode_csv(value: &Value) -> Result<Vec<u8>, RuntimeError> {
    let Value::Array(rows) = value else {
        return Err(RuntimeError::type_mismatch("csv write", "Array of Dictionary", &value.type_name()));
    };
    let rows = rows.borrow();
    let mut writer = csv::Writer::from_writer(Vec::new());
    if let Some(Value::Dictionary(first)) = rows.first() {
        let headers: Vec<String> = first.borrow().iter().map(|(k, _)| k.clone()).collect();
        writer
            .write_record(&headers)
            .map_err(|e| RuntimeError::io_failure(format!("csv encode failed: {e}")))?;
        for row in rows.iter() {
            if let Value::Dictionary(dict) = row {
                let dict = dict.borrow();
                let fields: Vec<String> = headers.iter().map(|h| dict.get(h).map(|v| v.to_string()).unwrap_or_default()).collect();
                writer
                    .write_record(&fields)
                    .map_err(|e| RuntimeError::io_failure(format!("csv encode failed: {e}")))?;
            }
        }
    }
    writer
        .into_inner()
        .map_err(|e| RuntimeError::io_failure(format!("csv encode failed: {e}")))
}
