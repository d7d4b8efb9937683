// ABOUTME: Managed database connections backing the @sqlite/@postgres/@mysql at-literals (spec.md §4.6)

use crate::error::RuntimeError;
use crate::value::{Dict, Value};
use std::cell::RefCell;
use std::rc::Rc;
use rusqlite::Connection as SqliteConn;
use std::collections::HashMap;

/// Which driver backs a connection. `postgres`/`mysql` are stored behind a
/// thin enum so `DbConnection` stays a single concrete type the way
/// `Value::DbConnection` expects, rather than a trait object per row type.
pub enum Driver {
    Sqlite(SqliteConn),
    Postgres(postgres::Client),
    MySql(mysql::PooledConn),
}

/// Opaque handle returned by `@sqlite(...)`/`@postgres(...)`/`@mysql(...)`.
/// Managed connections (owned by the engine, e.g. `ServerDB`) refuse
/// `.close()` (spec.md §4.6 "managed connection close-refusal").
pub struct DbConnection {
    driver: Driver,
    in_transaction: bool,
    last_error: Option<String>,
    managed: bool,
}

impl DbConnection {
    pub fn open_sqlite(path: &str) -> Result<Self, RuntimeError> {
        let conn = SqliteConn::open(path)
            .map_err(|e| RuntimeError::database_failure(format!("sqlite open failed: {e}")))?;
        Ok(DbConnection { driver: Driver::Sqlite(conn), in_transaction: false, last_error: None, managed: false })
    }

    pub fn open_postgres(conninfo: &str) -> Result<Self, RuntimeError> {
        let client = postgres::Client::connect(conninfo, postgres::NoTls)
            .map_err(|e| RuntimeError::database_failure(format!("postgres connect failed: {e}")))?;
        Ok(DbConnection { driver: Driver::Postgres(client), in_transaction: false, last_error: None, managed: false })
    }

    pub fn open_mysql(url: &str) -> Result<Self, RuntimeError> {
        use mysql::prelude::*;
        let pool = mysql::Pool::new(url)
            .map_err(|e| RuntimeError::database_failure(format!("mysql connect failed: {e}")))?;
        let conn = pool
            .get_conn()
            .map_err(|e| RuntimeError::database_failure(format!("mysql connect failed: {e}")))?;
        Ok(DbConnection { driver: Driver::MySql(conn), in_transaction: false, last_error: None, managed: false })
    }

    pub fn mark_managed(&mut self) {
        self.managed = true;
    }

    pub fn driver_name(&self) -> &'static str {
        match self.driver {
            Driver::Sqlite(_) => "sqlite",
            Driver::Postgres(_) => "postgres",
            Driver::MySql(_) => "mysql",
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn begin(&mut self) -> Result<(), RuntimeError> {
        if self.in_transaction {
            return Err(RuntimeError::database_in_transaction());
        }
        self.exec_raw("BEGIN", &[])?;
        self.in_transaction = true;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), RuntimeError> {
        self.exec_raw("COMMIT", &[])?;
        self.in_transaction = false;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), RuntimeError> {
        self.exec_raw("ROLLBACK", &[])?;
        self.in_transaction = false;
        Ok(())
    }

    pub fn close(&self) -> Result<(), RuntimeError> {
        if self.managed {
            return Err(RuntimeError::state_error(
                "cannot close a managed connection (e.g. @DB from ServerDB)",
            ));
        }
        Ok(())
    }

    pub fn ping(&mut self) -> Result<(), RuntimeError> {
        self.exec_raw("SELECT 1", &[]).map(|_| ())
    }

    /// Runs a parameterized statement returning at most one row, bound as a
    /// dictionary keyed by column name (spec.md §4.6 `<=?=>`).
    pub fn query_one(&mut self, sql: &str, params: &[Value]) -> Result<Value, RuntimeError> {
        let rows = self.query_rows(sql, params, Some(1))?;
        Ok(rows.into_iter().next().unwrap_or(Value::Null))
    }

    /// Runs a parameterized statement returning all matching rows
    /// (spec.md §4.6 `<=??=>`).
    pub fn query_many(&mut self, sql: &str, params: &[Value]) -> Result<Value, RuntimeError> {
        let rows = self.query_rows(sql, params, None)?;
        Ok(Value::Array(Rc::new(RefCell::new(rows))))
    }

    /// Runs a parameterized statement for effect only (spec.md §4.6 `<=!=>`).
    pub fn exec(&mut self, sql: &str, params: &[Value]) -> Result<Value, RuntimeError> {
        let affected = self.exec_raw(sql, params)?;
        Ok(Value::Integer(affected as i64))
    }

    fn exec_raw(&mut self, sql: &str, params: &[Value]) -> Result<usize, RuntimeError> {
        match &mut self.driver {
            Driver::Sqlite(conn) => {
                let bound = sqlite_params(params);
                let refs: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
                conn.execute(sql, refs.as_slice())
                    .map_err(|e| self.record_error(e.to_string()))
            }
            Driver::Postgres(client) => {
                let owned = postgres_params(params);
                let refs: Vec<&(dyn postgres::types::ToSql + Sync)> =
                    owned.iter().map(|p| p.as_ref()).collect();
                client
                    .execute(sql, refs.as_slice())
                    .map(|n| n as usize)
                    .map_err(|e| self.record_error(e.to_string()))
            }
            Driver::MySql(conn) => {
                use mysql::prelude::*;
                conn.exec_drop(sql, mysql_params(params))
                    .map(|_| conn.affected_rows() as usize)
                    .map_err(|e| self.record_error(e.to_string()))
            }
        }
    }

    fn query_rows(&mut self, sql: &str, params: &[Value], limit: Option<usize>) -> Result<Vec<Value>, RuntimeError> {
        match &mut self.driver {
            Driver::Sqlite(conn) => {
                let bound = sqlite_params(params);
                let refs: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
                let mut stmt = conn
                    .prepare(sql)
                    .map_err(|e| RuntimeError::database_failure(e.to_string()))?;
                let col_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
                let rows = stmt
                    .query_map(refs.as_slice(), |row| Ok(sqlite_row_to_dict(row, &col_names)))
                    .map_err(|e| RuntimeError::database_failure(e.to_string()))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(|e| RuntimeError::database_failure(e.to_string()))?);
                    if limit.map(|l| out.len() >= l).unwrap_or(false) {
                        break;
                    }
                }
                Ok(out)
            }
            Driver::Postgres(client) => {
                let owned = postgres_params(params);
                let refs: Vec<&(dyn postgres::types::ToSql + Sync)> =
                    owned.iter().map(|p| p.as_ref()).collect();
                let rows = client
                    .query(sql, refs.as_slice())
                    .map_err(|e| RuntimeError::database_failure(e.to_string()))?;
                let mut out = Vec::new();
                for row in rows.iter().take(limit.unwrap_or(usize::MAX)) {
                    out.push(postgres_row_to_dict(row));
                }
                Ok(out)
            }
            Driver::MySql(conn) => {
                use mysql::prelude::*;
                let rows: Vec<mysql::Row> = conn
                    .exec(sql, mysql_params(params))
                    .map_err(|e| RuntimeError::database_failure(e.to_string()))?;
                Ok(rows
                    .into_iter()
                    .take(limit.unwrap_or(usize::MAX))
                    .map(mysql_row_to_dict)
                    .collect())
            }
        }
    }

    fn record_error(&mut self, message: String) -> RuntimeError {
        self.last_error = Some(message.clone());
        RuntimeError::database_failure(message)
    }
}

fn sqlite_params(params: &[Value]) -> Vec<Box<dyn rusqlite::ToSql>> {
    params
        .iter()
        .map(|v| -> Box<dyn rusqlite::ToSql> {
            match v {
                Value::Integer(i) => Box::new(*i),
                Value::Float(f) => Box::new(*f),
                Value::String(s) => Box::new(s.clone()),
                Value::Boolean(b) => Box::new(*b),
                Value::Null => Box::new(rusqlite::types::Null),
                other => Box::new(other.to_string()),
            }
        })
        .collect()
}

fn sqlite_row_to_dict(row: &rusqlite::Row, col_names: &[String]) -> Value {
    let mut dict = Dict::new();
    for (i, name) in col_names.iter().enumerate() {
        let value: Value = match row.get_ref(i) {
            Ok(rusqlite::types::ValueRef::Integer(n)) => Value::Integer(n),
            Ok(rusqlite::types::ValueRef::Real(f)) => Value::Float(f),
            Ok(rusqlite::types::ValueRef::Text(t)) => {
                Value::String(String::from_utf8_lossy(t).to_string())
            }
            Ok(rusqlite::types::ValueRef::Blob(_)) | Ok(rusqlite::types::ValueRef::Null) | Err(_) => Value::Null,
        };
        dict.insert(name.clone(), value);
    }
    Value::Dictionary(Rc::new(RefCell::new(dict)))
}

fn postgres_params(params: &[Value]) -> Vec<Box<dyn postgres::types::ToSql + Sync>> {
    params
        .iter()
        .map(|v| -> Box<dyn postgres::types::ToSql + Sync> {
            match v {
                Value::Integer(i) => Box::new(*i),
                Value::Float(f) => Box::new(*f),
                Value::String(s) => Box::new(s.clone()),
                Value::Boolean(b) => Box::new(*b),
                other => Box::new(other.to_string()),
            }
        })
        .collect()
}

fn postgres_row_to_dict(row: &postgres::Row) -> Value {
    let mut dict = Dict::new();
    for (i, col) in row.columns().iter().enumerate() {
        let value: Value = row
            .try_get::<_, Option<String>>(i)
            .map(|opt| opt.map(Value::String).unwrap_or(Value::Null))
            .or_else(|_| row.try_get::<_, Option<i64>>(i).map(|opt| opt.map(Value::Integer).unwrap_or(Value::Null)))
            .or_else(|_| row.try_get::<_, Option<f64>>(i).map(|opt| opt.map(Value::Float).unwrap_or(Value::Null)))
            .unwrap_or(Value::Null);
        dict.insert(col.name().to_string(), value);
    }
    Value::Dictionary(Rc::new(RefCell::new(dict)))
}

fn mysql_params(params: &[Value]) -> mysql::Params {
    use mysql::Value as MValue;
    let values: Vec<MValue> = params
        .iter()
        .map(|v| match v {
            Value::Integer(i) => MValue::Int(*i),
            Value::Float(f) => MValue::Double(*f),
            Value::String(s) => MValue::Bytes(s.clone().into_bytes()),
            Value::Boolean(b) => MValue::Int(*b as i64),
            _ => MValue::NULL,
        })
        .collect();
    mysql::Params::Positional(values)
}

fn mysql_row_to_dict(row: mysql::Row) -> Value {
    let mut dict = Dict::new();
    let columns = row.columns();
    let mut row = row;
    for (i, col) in columns.iter().enumerate() {
        let value: Value = match row.take_opt::<String, usize>(i) {
            Some(Ok(s)) => Value::String(s),
            _ => Value::Null,
        };
        dict.insert(col.name_str().to_string(), value);
    }
    Value::Dictionary(Rc::new(RefCell::new(dict)))
}

pub fn params_from_dict(dict: &HashMap<String, Value>, order: &[String]) -> Vec<Value> {
    order.iter().map(|k| dict.get(k).cloned().unwrap_or(Value::Null)).collect()
}
