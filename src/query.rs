// ABOUTME: Query DSL -> parameterized SQL compiler (spec.md §4.7)

use crate::ast::{Aggregate, BatchInsert, Node, Projection, QueryForm, RelJoin, UnaryOp};
use crate::db::DbConnection;
use crate::error::RuntimeError;
use crate::eval::Evaluator;
use crate::value::{Dict, Value};
use regex::Regex;
use std::sync::OnceLock;

fn identifier_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").unwrap())
}

/// Validates a table/column name before it is ever interpolated into SQL
/// text, the one allowlist stopping the query compiler from being a SQL
/// injection vector (spec.md §4.7 VAL-0003, §8 invariant on identifier safety).
pub fn validate_identifier(name: &str) -> Result<(), RuntimeError> {
    if identifier_pattern().is_match(name) {
        Ok(())
    } else {
        Err(RuntimeError::bad_identifier(name))
    }
}

/// A `@schema`/`@table` declaration, held by a `Value::Schema` for
/// introspection and used by the compiler to validate column references
/// against a known shape (spec.md §4.7).
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub table: String,
    pub columns: Vec<String>,
}

impl Schema {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Result<Self, RuntimeError> {
        let table = table.into();
        validate_identifier(&table)?;
        for col in &columns {
            validate_identifier(col)?;
        }
        Ok(Schema { table, columns })
    }
}

/// A compiled statement, ready to hand to `DbConnection`.
pub struct Compiled {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Compiles one query-form AST node into parameterized SQL, evaluating any
/// expression sub-nodes (filters, field values) against `eval`.
pub fn compile(evaluator: &mut Evaluator, form: &QueryForm) -> Result<Compiled, RuntimeError> {
    match form {
        QueryForm::Select {
            table,
            alias,
            filter,
            order_by,
            limit,
            relations,
            group_by,
            aggregates,
            projection,
            proj_kind: _,
        } => compile_select(
            evaluator,
            table,
            alias.as_deref(),
            filter.as_deref(),
            order_by,
            limit.as_deref(),
            relations,
            group_by,
            aggregates,
            projection,
        ),
        QueryForm::Insert { table, update_on, fields, batch } => {
            compile_insert(evaluator, table, update_on, fields, batch.as_ref())
        }
        QueryForm::Update { table, fields, filter } => {
            compile_update(evaluator, table, fields, filter.as_deref())
        }
        QueryForm::Delete { table, filter } => compile_delete(evaluator, table, filter.as_deref()),
        QueryForm::Search { table, columns, term } => compile_search(evaluator, table, columns, term),
        QueryForm::Transaction { .. } => Err(RuntimeError::state_error(
            "@transaction must be executed directly, not compiled as a single statement",
        )),
    }
}

/// Resolves a projection's column list, validating every identifier
/// (spec.md §8 invariant 5, scenario S2's `VAL-0003`). `Projection::Dynamic`
/// evaluates its expression and accepts a single string or an array of
/// strings as column names — anything else, or any name failing the
/// identifier allowlist, fails compilation before any SQL is emitted.
fn resolve_projection(evaluator: &mut Evaluator, projection: &Projection) -> Result<Vec<String>, RuntimeError> {
    match projection {
        Projection::Star => Ok(Vec::new()),
        Projection::Columns(cols) => {
            for c in cols {
                validate_identifier(c)?;
            }
            Ok(cols.clone())
        }
        Projection::Dynamic(expr) => {
            let value = evaluator.eval(expr)?;
            let names: Vec<String> = match &value {
                Value::String(s) => vec![s.clone()],
                Value::Array(items) => items
                    .borrow()
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => Ok(s.clone()),
                        other => Err(RuntimeError::type_mismatch("query projection", "String", &other.type_name())),
                    })
                    .collect::<Result<_, _>>()?,
                other => return Err(RuntimeError::type_mismatch("query projection", "String/Array", &other.type_name())),
            };
            for n in &names {
                validate_identifier(n)?;
            }
            Ok(names)
        }
    }
}

fn compile_relations(relations: &[RelJoin], table: &str) -> Result<String, RuntimeError> {
    let mut sql = String::new();
    for rel in relations {
        validate_identifier(&rel.table)?;
        let fk = match &rel.fk_column {
            Some(col) => {
                validate_identifier(col)?;
                col.clone()
            }
            None => format!("{table}_id"),
        };
        sql.push_str(&format!(" JOIN {} ON {}.id = {}.{}", rel.table, table, rel.table, fk));
    }
    Ok(sql)
}

fn compile_aggregates(aggregates: &[Aggregate]) -> Result<Vec<String>, RuntimeError> {
    aggregates
        .iter()
        .map(|agg| {
            validate_identifier(&agg.alias)?;
            validate_identifier(&agg.column)?;
            if !matches!(agg.func.to_ascii_lowercase().as_str(), "sum" | "avg" | "count" | "min" | "max") {
                return Err(RuntimeError::bad_identifier(&agg.func));
            }
            Ok(format!("{}({}) AS {}", agg.func.to_ascii_uppercase(), agg.column, agg.alias))
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn compile_select(
    evaluator: &mut Evaluator,
    table: &str,
    alias: Option<&str>,
    filter: Option<&Node>,
    order_by: &[(String, bool)],
    limit: Option<&Node>,
    relations: &[RelJoin],
    group_by: &[String],
    aggregates: &[Aggregate],
    projection: &Projection,
) -> Result<Compiled, RuntimeError> {
    validate_identifier(table)?;
    if let Some(a) = alias {
        validate_identifier(a)?;
    }
    let columns = resolve_projection(evaluator, projection)?;
    let agg_cols = compile_aggregates(aggregates)?;
    let mut select_parts = if columns.is_empty() && agg_cols.is_empty() {
        vec!["*".to_string()]
    } else {
        columns.clone()
    };
    select_parts.extend(agg_cols);

    let table_ref = match alias {
        Some(a) => format!("{table} AS {a}"),
        None => table.to_string(),
    };
    let mut sql = format!("SELECT {} FROM {table_ref}", select_parts.join(", "));
    sql.push_str(&compile_relations(relations, table)?);
    let mut params = Vec::new();

    if let Some(cond) = filter {
        let (clause, bound) = compile_condition(evaluator, cond)?;
        sql.push_str(" WHERE ");
        sql.push_str(&clause);
        params.extend(bound);
    }
    if !group_by.is_empty() {
        for col in group_by {
            validate_identifier(col)?;
        }
        sql.push_str(" GROUP BY ");
        sql.push_str(&group_by.join(", "));
    }
    if !order_by.is_empty() {
        sql.push_str(" ORDER BY ");
        let parts: Result<Vec<String>, RuntimeError> = order_by
            .iter()
            .map(|(col, desc)| {
                validate_identifier(col)?;
                Ok(format!("{col}{}", if *desc { " DESC" } else { "" }))
            })
            .collect();
        sql.push_str(&parts?.join(", "));
    }
    if let Some(limit_node) = limit {
        let v = evaluator.eval(limit_node)?;
        sql.push_str(" LIMIT ?");
        params.push(v);
    }
    Ok(Compiled { sql, params })
}

/// `@SEARCH(table, [cols], term)` (spec.md §4.1 item 10): a plain
/// multi-column `LIKE` match, ORed across the given columns.
fn compile_search(
    evaluator: &mut Evaluator,
    table: &str,
    columns: &[String],
    term: &Node,
) -> Result<Compiled, RuntimeError> {
    validate_identifier(table)?;
    for c in columns {
        validate_identifier(c)?;
    }
    if columns.is_empty() {
        return Err(RuntimeError::state_error("@SEARCH requires at least one column"));
    }
    let term_value = evaluator.eval(term)?;
    let pattern = format!("%{}%", term_value);
    let clauses: Vec<String> = columns.iter().map(|c| format!("{c} LIKE ?")).collect();
    let params = vec![Value::String(pattern); columns.len()];
    let sql = format!("SELECT * FROM {table} WHERE {}", clauses.join(" OR "));
    Ok(Compiled { sql, params })
}

fn compile_insert(
    evaluator: &mut Evaluator,
    table: &str,
    update_on: &[String],
    fields: &[(String, Box<Node>)],
    batch: Option<&BatchInsert>,
) -> Result<Compiled, RuntimeError> {
    validate_identifier(table)?;
    for c in update_on {
        validate_identifier(c)?;
    }

    if let Some(batch) = batch {
        return compile_batch_insert(evaluator, table, update_on, batch);
    }

    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    let mut params = Vec::new();
    for (name, expr) in fields {
        validate_identifier(name)?;
        cols.push(name.clone());
        placeholders.push("?".to_string());
        params.push(evaluator.eval(expr)?);
    }
    let mut sql = format!("INSERT INTO {table} ({}) VALUES ({})", cols.join(", "), placeholders.join(", "));
    if !update_on.is_empty() {
        let assignments: Vec<String> = cols.iter().map(|c| format!("{c} = excluded.{c}")).collect();
        sql.push_str(&format!(" ON CONFLICT ({}) DO UPDATE SET {}", update_on.join(", "), assignments.join(", ")));
    }
    Ok(Compiled { sql, params })
}

/// `* each expr -> alias[, idx]` batch insert (spec.md §4.2): evaluates
/// `each` once, binding one row per element to `alias` (and its index to
/// `idx`) while compiling `batch.fields` once per row.
fn compile_batch_insert(
    evaluator: &mut Evaluator,
    table: &str,
    update_on: &[String],
    batch: &BatchInsert,
) -> Result<Compiled, RuntimeError> {
    let items = evaluator.eval(&batch.each)?;
    let Value::Array(items) = items else {
        return Err(RuntimeError::type_mismatch("@insert * each", "Array", &items.type_name()));
    };
    let items = items.borrow();

    let mut cols: Option<Vec<String>> = None;
    let mut all_values: Vec<Vec<Value>> = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        evaluator.env.define(&batch.alias, item.clone());
        if let Some(idx_alias) = &batch.index_alias {
            evaluator.env.define(idx_alias, Value::Integer(idx as i64));
        }
        let mut row_cols = Vec::new();
        let mut row_values = Vec::new();
        for (name, expr) in &batch.fields {
            validate_identifier(name)?;
            row_cols.push(name.clone());
            row_values.push(evaluator.eval(expr)?);
        }
        if let Some(existing) = &cols {
            if existing != &row_cols {
                return Err(RuntimeError::state_error("@insert * each rows must share the same fields"));
            }
        } else {
            cols = Some(row_cols);
        }
        all_values.push(row_values);
    }
    let cols = cols.unwrap_or_default();
    let placeholders = format!("({})", vec!["?"; cols.len()].join(", "));
    let rows_sql = vec![placeholders; all_values.len()].join(", ");
    let mut sql = format!("INSERT INTO {table} ({}) VALUES {rows_sql}", cols.join(", "));
    if !update_on.is_empty() {
        let assignments: Vec<String> = cols.iter().map(|c| format!("{c} = excluded.{c}")).collect();
        sql.push_str(&format!(" ON CONFLICT ({}) DO UPDATE SET {}", update_on.join(", "), assignments.join(", ")));
    }
    let params = all_values.into_iter().flatten().collect();
    Ok(Compiled { sql, params })
}

fn compile_update(
    evaluator: &mut Evaluator,
    table: &str,
    fields: &[(String, Box<Node>)],
    filter: Option<&Node>,
) -> Result<Compiled, RuntimeError> {
    validate_identifier(table)?;
    let mut sets = Vec::new();
    let mut params = Vec::new();
    for (name, expr) in fields {
        validate_identifier(name)?;
        sets.push(format!("{name} = ?"));
        params.push(evaluator.eval(expr)?);
    }
    let mut sql = format!("UPDATE {table} SET {}", sets.join(", "));
    if let Some(cond) = filter {
        let (clause, bound) = compile_condition(evaluator, cond)?;
        sql.push_str(" WHERE ");
        sql.push_str(&clause);
        params.extend(bound);
    }
    Ok(Compiled { sql, params })
}

fn compile_delete(
    evaluator: &mut Evaluator,
    table: &str,
    filter: Option<&Node>,
) -> Result<Compiled, RuntimeError> {
    validate_identifier(table)?;
    let mut sql = format!("DELETE FROM {table}");
    let mut params = Vec::new();
    if let Some(cond) = filter {
        let (clause, bound) = compile_condition(evaluator, cond)?;
        sql.push_str(" WHERE ");
        sql.push_str(&clause);
        params.extend(bound);
    }
    Ok(Compiled { sql, params })
}

/// Lowers a filter expression into a SQL boolean clause with `?`
/// placeholders. Only the comparison/logical shapes that make sense inside
/// a `WHERE` clause are handled; anything else evaluates to a bound
/// parameter compared for truthiness, matching how the DSL is documented
/// to fall back to host-side evaluation for exotic expressions.
fn compile_condition(evaluator: &mut Evaluator, node: &Node) -> Result<(String, Vec<Value>), RuntimeError> {
    use crate::ast::BinaryOp::*;
    if let Node::Unary { op: UnaryOp::Not, operand } = node {
        let (inner, params) = compile_condition(evaluator, operand)?;
        return Ok((format!("NOT ({inner})"), params));
    }
    if let Node::Binary { op, left, right } = node {
        if let Node::Ident(col) = left.as_ref() {
            validate_identifier(col)?;
            match op {
                Eq | NotEq | Lt | LtEq | Gt | GtEq => {
                    let sql_op = match op {
                        Eq => "=",
                        NotEq => "!=",
                        Lt => "<",
                        LtEq => "<=",
                        Gt => ">",
                        GtEq => ">=",
                        _ => unreachable!(),
                    };
                    if matches!(op, Eq | NotEq) && matches!(right.as_ref(), Node::NullLit) {
                        let kw = if matches!(op, Eq) { "IS NULL" } else { "IS NOT NULL" };
                        return Ok((format!("{col} {kw}"), Vec::new()));
                    }
                    let value = evaluator.eval(right)?;
                    return Ok((format!("{col} {sql_op} ?"), vec![value]));
                }
                Is | IsNot if matches!(right.as_ref(), Node::NullLit) => {
                    let kw = if matches!(op, Is) { "IS NULL" } else { "IS NOT NULL" };
                    return Ok((format!("{col} {kw}"), Vec::new()));
                }
                In | NotIn => {
                    if let Node::Query { .. } = right.as_ref() {
                        let (sub_sql, sub_params) = compile_subquery(evaluator, right)?;
                        let kw = if matches!(op, In) { "IN" } else { "NOT IN" };
                        return Ok((format!("{col} {kw} ({sub_sql})"), sub_params));
                    }
                    let value = evaluator.eval(right)?;
                    let Value::Array(items) = &value else {
                        return Err(RuntimeError::type_mismatch("in", "Array", &value.type_name()));
                    };
                    let items = items.borrow();
                    let placeholders = vec!["?"; items.len()].join(", ");
                    let kw = if matches!(op, In) { "IN" } else { "NOT IN" };
                    return Ok((format!("{col} {kw} ({placeholders})"), items.clone()));
                }
                Like => {
                    let value = evaluator.eval(right)?;
                    return Ok((format!("{col} LIKE ?"), vec![value]));
                }
                _ => {}
            }
        }
    }
    if let Node::Logical { op, left, right } = node {
        let (l_sql, mut l_params) = compile_condition(evaluator, left)?;
        let (r_sql, r_params) = compile_condition(evaluator, right)?;
        let joiner = match op {
            crate::ast::LogicalOp::And => "AND",
            crate::ast::LogicalOp::Or => "OR",
        };
        l_params.extend(r_params);
        return Ok((format!("({l_sql} {joiner} {r_sql})"), l_params));
    }
    let value = evaluator.eval(node)?;
    Ok(("? != 0".to_string(), vec![value]))
}

/// Compiles a correlated subquery (spec.md §4.2 `<-Other | cond ?-> col`)
/// embedded as the right-hand side of an `in`/`not in` condition.
fn compile_subquery(evaluator: &mut Evaluator, node: &Node) -> Result<(String, Vec<Value>), RuntimeError> {
    let Node::Query { form, .. } = node else {
        return Err(RuntimeError::state_error("expected a nested query form"));
    };
    let compiled = compile(evaluator, form)?;
    Ok((compiled.sql, compiled.params))
}

pub fn schema_to_dict(schema: &Schema) -> Dict {
    let mut dict = Dict::new();
    dict.insert("table", Value::String(schema.table.clone()));
    dict.insert(
        "columns",
        Value::Array(std::rc::Rc::new(std::cell::RefCell::new(
            schema.columns.iter().cloned().map(Value::String).collect(),
        ))),
    );
    dict
}

/// Runs a `@transaction { ... }` block: begin, evaluate the body, commit on
/// success, roll back and propagate on error (spec.md §4.6, §4.7).
pub fn run_transaction(
    evaluator: &mut Evaluator,
    conn: &mut DbConnection,
    body: &[Node],
) -> Result<Value, RuntimeError> {
    conn.begin()?;
    let mut last = Value::Null;
    for stmt in body {
        match evaluator.eval(stmt) {
            Ok(v) => last = v,
            Err(e) => {
                let _ = conn.rollback();
                return Err(e);
            }
        }
    }
    conn.commit()?;
    Ok(last)
}
