// ABOUTME: Query DSL compilation and managed-connection execution against sqlite

use parsley::ast::{Aggregate, BinaryOp, Node, Projection, ProjKind, QueryForm, RelJoin};
use parsley::db::DbConnection;
use parsley::env::Environment;
use parsley::eval::Evaluator;
use parsley::query::{self, compile, validate_identifier};
use parsley::value::Value;

fn evaluator() -> Evaluator {
    Evaluator::new(Environment::new())
}

fn select_form(table: &str, projection: Projection, filter: Option<Node>) -> QueryForm {
    QueryForm::Select {
        table: table.to_string(),
        alias: None,
        filter: filter.map(Box::new),
        order_by: vec![],
        limit: None,
        relations: vec![],
        group_by: vec![],
        aggregates: vec![],
        projection,
        proj_kind: ProjKind::Many,
    }
}

#[test]
fn identifier_allowlist_accepts_plain_names() {
    assert!(validate_identifier("users").is_ok());
    assert!(validate_identifier("_private").is_ok());
}

#[test]
fn identifier_allowlist_rejects_injection_attempts() {
    let err = validate_identifier("users; DROP TABLE users --").unwrap_err();
    assert_eq!(err.code, "VAL-0003");
}

#[test]
fn select_compiles_to_parameterized_sql() {
    let mut form = select_form(
        "users",
        Projection::Columns(vec!["id".to_string(), "name".to_string()]),
        Some(Node::Binary {
            op: BinaryOp::Gt,
            left: Box::new(Node::Ident("id".to_string())),
            right: Box::new(Node::IntegerLit(10)),
        }),
    );
    if let QueryForm::Select { order_by, limit, .. } = &mut form {
        *order_by = vec![("name".to_string(), false)];
        *limit = Some(Box::new(Node::IntegerLit(5)));
    }
    let compiled = compile(&mut evaluator(), &form).expect("compile failed");
    assert_eq!(compiled.sql, "SELECT id, name FROM users WHERE id > ? ORDER BY name LIMIT ?");
    assert_eq!(compiled.params.len(), 2);
    assert!(matches!(compiled.params[0], Value::Integer(10)));
}

#[test]
fn select_with_join_and_aggregate_groups_by_related_column() {
    let mut form = select_form("orders", Projection::Star, None);
    if let QueryForm::Select { relations, group_by, aggregates, .. } = &mut form {
        *relations = vec![RelJoin { table: "customers".to_string(), fk_column: None }];
        *group_by = vec!["customers.id".to_string()];
        *aggregates = vec![Aggregate { alias: "total".to_string(), func: "sum".to_string(), column: "amount".to_string() }];
    }
    let compiled = compile(&mut evaluator(), &form).expect("compile failed");
    assert!(compiled.sql.contains("JOIN customers ON orders.id = customers.orders_id"));
    assert!(compiled.sql.contains("SUM(amount) AS total"));
    assert!(compiled.sql.contains("GROUP BY customers.id"));
}

#[test]
fn insert_binds_every_field_as_a_parameter() {
    let form = QueryForm::Insert {
        table: "users".to_string(),
        update_on: vec![],
        fields: vec![
            ("name".to_string(), Box::new(Node::StringLit(vec![parsley::ast::StrSegment::Text("ada".to_string())]))),
            ("age".to_string(), Box::new(Node::IntegerLit(30))),
        ],
        batch: None,
    };
    let compiled = compile(&mut evaluator(), &form).expect("compile failed");
    assert_eq!(compiled.sql, "INSERT INTO users (name, age) VALUES (?, ?)");
    assert_eq!(compiled.params.len(), 2);
}

#[test]
fn insert_with_update_on_emits_upsert_clause() {
    let form = QueryForm::Insert {
        table: "users".to_string(),
        update_on: vec!["id".to_string()],
        fields: vec![
            ("id".to_string(), Box::new(Node::IntegerLit(1))),
            ("name".to_string(), Box::new(Node::StringLit(vec![parsley::ast::StrSegment::Text("ada".to_string())]))),
        ],
        batch: None,
    };
    let compiled = compile(&mut evaluator(), &form).expect("compile failed");
    assert!(compiled.sql.contains("ON CONFLICT (id) DO UPDATE SET id = excluded.id, name = excluded.name"));
}

#[test]
fn no_clause_ever_interpolates_a_literal_value() {
    let form = select_form(
        "users",
        Projection::Star,
        Some(Node::Binary {
            op: BinaryOp::Eq,
            left: Box::new(Node::Ident("name".to_string())),
            right: Box::new(Node::StringLit(vec![parsley::ast::StrSegment::Text(
                "'; DROP TABLE users; --".to_string(),
            )])),
        }),
    );
    let compiled = compile(&mut evaluator(), &form).expect("compile failed");
    assert!(!compiled.sql.contains("DROP TABLE"));
    assert!(compiled.sql.contains("name = ?"));
}

#[test]
fn dynamic_projection_rejects_names_that_fail_the_identifier_allowlist() {
    let form = select_form(
        "users",
        Projection::Dynamic(Box::new(Node::StringLit(vec![parsley::ast::StrSegment::Text(
            "id; DROP TABLE users".to_string(),
        )]))),
        None,
    );
    let err = compile(&mut evaluator(), &form).unwrap_err();
    assert_eq!(err.code, "VAL-0003");
}

#[test]
fn dynamic_projection_accepts_a_validated_array_of_column_names() {
    let form = select_form(
        "users",
        Projection::Dynamic(Box::new(Node::ArrayLit(vec![
            Node::StringLit(vec![parsley::ast::StrSegment::Text("id".to_string())]),
            Node::StringLit(vec![parsley::ast::StrSegment::Text("name".to_string())]),
        ]))),
        None,
    );
    let compiled = compile(&mut evaluator(), &form).expect("compile failed");
    assert_eq!(compiled.sql, "SELECT id, name FROM users");
}

#[test]
fn search_compiles_to_ored_like_clauses() {
    let form = QueryForm::Search {
        table: "users".to_string(),
        columns: vec!["name".to_string(), "email".to_string()],
        term: Box::new(Node::StringLit(vec![parsley::ast::StrSegment::Text("ada".to_string())])),
    };
    let compiled = compile(&mut evaluator(), &form).expect("compile failed");
    assert_eq!(compiled.sql, "SELECT * FROM users WHERE name LIKE ? OR email LIKE ?");
    assert_eq!(compiled.params.len(), 2);
    assert!(matches!(&compiled.params[0], Value::String(s) if s == "%ada%"));
}

#[test]
fn executes_a_compiled_insert_and_select_against_sqlite() {
    let mut conn = DbConnection::open_sqlite(":memory:").expect("open failed");
    conn.exec("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", &[]).unwrap();

    let insert = QueryForm::Insert {
        table: "users".to_string(),
        update_on: vec![],
        fields: vec![(
            "name".to_string(),
            Box::new(Node::StringLit(vec![parsley::ast::StrSegment::Text("grace".to_string())])),
        )],
        batch: None,
    };
    let compiled = compile(&mut evaluator(), &insert).unwrap();
    conn.exec(&compiled.sql, &compiled.params).unwrap();

    let select = select_form("users", Projection::Columns(vec!["name".to_string()]), None);
    let compiled = compile(&mut evaluator(), &select).unwrap();
    let result = conn.query_many(&compiled.sql, &compiled.params).unwrap();
    match result {
        Value::Array(rows) => {
            let rows = rows.borrow();
            assert_eq!(rows.len(), 1);
        }
        other => panic!("expected array of rows, got {other:?}"),
    }
}

#[test]
fn schema_validates_table_and_column_names_up_front() {
    let schema = query::Schema::new("orders", vec!["id".to_string(), "total".to_string()]);
    assert!(schema.is_ok());
    let bad = query::Schema::new("orders; --", vec![]);
    assert!(bad.is_err());
}
