//! In-process mock of the hosted record store. Speaks just enough of the
//! real API for the adapter under test: filter formulas, one-record probes,
//! schema 422s on unknown fields, the 10-record batch ceiling, continuation
//! offsets (with an optional sticky-offset malfunction mode) and per-record
//! CRUD.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, RawQuery, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Map, Value};

pub type Fields = Map<String, Value>;

pub const PAGE_SIZE_DEFAULT: usize = 100;
const MAX_BATCH: usize = 10;

#[derive(Clone)]
pub struct MockRecord {
    pub id: String,
    pub fields: Fields,
}

#[derive(Default)]
pub struct Table {
    pub schema: Vec<String>,
    pub rows: Vec<MockRecord>,
    next_id: usize,
}

#[derive(Clone, Default)]
pub struct MockStore {
    tables: Arc<Mutex<HashMap<String, Table>>>,
    pub list_calls: Arc<AtomicUsize>,
    pub batch_patch_calls: Arc<AtomicUsize>,
    pub batch_delete_calls: Arc<AtomicUsize>,
    /// When set, list responses always return the same continuation offset,
    /// simulating a malformed cursor.
    pub sticky_offset: Arc<AtomicBool>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, name: &str, schema: &[&str]) {
        let mut tables = self.tables.lock().unwrap();
        tables.insert(
            name.to_string(),
            Table { schema: schema.iter().map(|s| s.to_string()).collect(), rows: Vec::new(), next_id: 0 },
        );
    }

    pub fn insert(&self, table: &str, fields: Value) -> String {
        let mut tables = self.tables.lock().unwrap();
        let t = tables.get_mut(table).expect("unknown mock table");
        t.next_id += 1;
        let id = format!("rec{}", t.next_id);
        t.rows.push(MockRecord { id: id.clone(), fields: fields.as_object().cloned().unwrap_or_default() });
        id
    }

    pub fn rows(&self, table: &str) -> Vec<MockRecord> {
        self.tables.lock().unwrap().get(table).map(|t| t.rows.clone()).unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    /// Bind an ephemeral port, serve the mock and return its API root.
    pub async fn serve(&self) -> String {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.expect("bind 127.0.0.1:0");
        let port = listener.local_addr().unwrap().port();
        let app = router(self.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("mock store task error: {e:?}");
            }
        });
        format!("http://127.0.0.1:{port}/v0")
    }
}

fn router(store: MockStore) -> Router {
    Router::new()
        .route(
            "/v0/{base}/{table}",
            get(list_records).post(create_records).patch(patch_many).delete(delete_many),
        )
        .route(
            "/v0/{base}/{table}/{id}",
            get(get_record).patch(patch_one).delete(delete_one),
        )
        .with_state(store)
}

fn err422(kind: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "error": { "type": kind } })))
}

fn err404() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "NOT_FOUND" })))
}

fn unknown_write_field(schema: &[String], fields: &Fields) -> bool {
    fields.keys().any(|k| !schema.iter().any(|s| s == k))
}

async fn list_records(
    State(store): State<MockStore>,
    Path((_base, table)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    store.list_calls.fetch_add(1, Ordering::SeqCst);
    let tables = store.tables.lock().unwrap();
    let Some(t) = tables.get(&table) else { return err404() };

    let filter = match params.get("filterByFormula") {
        Some(raw) => match parse_formula(raw) {
            Ok(expr) => Some(expr),
            Err(()) => return err422("INVALID_FILTER_BY_FORMULA"),
        },
        None => None,
    };

    let mut matched: Vec<&MockRecord> = Vec::new();
    for row in &t.rows {
        let keep = match &filter {
            Some(expr) => match eval(expr, &row.fields, &t.schema) {
                Ok(b) => b,
                Err(()) => return err422("INVALID_FILTER_BY_FORMULA"),
            },
            None => true,
        };
        if keep {
            matched.push(row);
        }
    }

    if let Some(max) = params.get("maxRecords").and_then(|v| v.parse::<usize>().ok()) {
        matched.truncate(max);
    }
    let page_size = params
        .get("pageSize")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(PAGE_SIZE_DEFAULT);
    let start = params.get("offset").and_then(|v| v.parse::<usize>().ok()).unwrap_or(0);

    let page: Vec<Value> = matched
        .iter()
        .skip(start)
        .take(page_size)
        .map(|r| json!({ "id": r.id, "fields": r.fields }))
        .collect();
    let mut body = json!({ "records": page });
    if store.sticky_offset.load(Ordering::SeqCst) {
        body["offset"] = json!("0");
    } else if start + page_size < matched.len() {
        body["offset"] = json!((start + page_size).to_string());
    }
    (StatusCode::OK, Json(body))
}

async fn create_records(
    State(store): State<MockStore>,
    Path((_base, table)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let mut tables = store.tables.lock().unwrap();
    let Some(t) = tables.get_mut(&table) else { return err404() };
    let incoming = body["records"].as_array().cloned().unwrap_or_default();
    if incoming.len() > MAX_BATCH {
        return err422("BATCH_TOO_LARGE");
    }
    let mut created = Vec::new();
    for item in &incoming {
        let fields = item["fields"].as_object().cloned().unwrap_or_default();
        if unknown_write_field(&t.schema, &fields) {
            return err422("UNKNOWN_FIELD_NAME");
        }
        t.next_id += 1;
        let id = format!("rec{}", t.next_id);
        t.rows.push(MockRecord { id: id.clone(), fields: fields.clone() });
        created.push(json!({ "id": id, "fields": fields }));
    }
    (StatusCode::OK, Json(json!({ "records": created })))
}

async fn patch_many(
    State(store): State<MockStore>,
    Path((_base, table)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    store.batch_patch_calls.fetch_add(1, Ordering::SeqCst);
    let mut tables = store.tables.lock().unwrap();
    let Some(t) = tables.get_mut(&table) else { return err404() };
    let incoming = body["records"].as_array().cloned().unwrap_or_default();
    if incoming.len() > MAX_BATCH {
        return err422("BATCH_TOO_LARGE");
    }
    let mut out = Vec::new();
    for item in &incoming {
        let id = item["id"].as_str().unwrap_or_default().to_string();
        let fields = item["fields"].as_object().cloned().unwrap_or_default();
        if unknown_write_field(&t.schema, &fields) {
            return err422("UNKNOWN_FIELD_NAME");
        }
        let Some(row) = t.rows.iter_mut().find(|r| r.id == id) else { return err404() };
        for (k, v) in fields {
            row.fields.insert(k, v);
        }
        out.push(json!({ "id": row.id, "fields": row.fields }));
    }
    (StatusCode::OK, Json(json!({ "records": out })))
}

async fn delete_many(
    State(store): State<MockStore>,
    Path((_base, table)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    store.batch_delete_calls.fetch_add(1, Ordering::SeqCst);
    let mut ids: Vec<String> = Vec::new();
    for pair in query.unwrap_or_default().split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            let k = urlencoding::decode(k).unwrap_or_default();
            if k == "records[]" {
                ids.push(urlencoding::decode(v).unwrap_or_default().into_owned());
            }
        }
    }
    if ids.len() > MAX_BATCH {
        return err422("BATCH_TOO_LARGE");
    }
    let mut tables = store.tables.lock().unwrap();
    let Some(t) = tables.get_mut(&table) else { return err404() };
    t.rows.retain(|r| !ids.contains(&r.id));
    let out: Vec<Value> = ids.iter().map(|id| json!({ "id": id, "deleted": true })).collect();
    (StatusCode::OK, Json(json!({ "records": out })))
}

async fn get_record(
    State(store): State<MockStore>,
    Path((_base, table, id)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let tables = store.tables.lock().unwrap();
    let Some(t) = tables.get(&table) else { return err404() };
    match t.rows.iter().find(|r| r.id == id) {
        Some(r) => (StatusCode::OK, Json(json!({ "id": r.id, "fields": r.fields }))),
        None => err404(),
    }
}

async fn patch_one(
    State(store): State<MockStore>,
    Path((_base, table, id)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let mut tables = store.tables.lock().unwrap();
    let Some(t) = tables.get_mut(&table) else { return err404() };
    let fields = body["fields"].as_object().cloned().unwrap_or_default();
    if unknown_write_field(&t.schema, &fields) {
        return err422("UNKNOWN_FIELD_NAME");
    }
    let Some(row) = t.rows.iter_mut().find(|r| r.id == id) else { return err404() };
    for (k, v) in fields {
        row.fields.insert(k, v);
    }
    (StatusCode::OK, Json(json!({ "id": row.id, "fields": row.fields })))
}

async fn delete_one(
    State(store): State<MockStore>,
    Path((_base, table, id)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let mut tables = store.tables.lock().unwrap();
    let Some(t) = tables.get_mut(&table) else { return err404() };
    let before = t.rows.len();
    t.rows.retain(|r| r.id != id);
    if t.rows.len() == before {
        return err404();
    }
    (StatusCode::OK, Json(json!({ "id": id, "deleted": true })))
}

// ---- filter-formula evaluator ----
//
// Supports the shapes the service emits: AND(...)/OR(...), `lhs=rhs`
// comparisons, `{Field}` references, string literals with escaped quotes,
// numbers, TRUE(), LOWER(x) and SUBSTITUTE(x, "a", "b"). Referencing a
// field the table schema does not have is an evaluation error, which the
// handlers answer with 422 like the real store.

#[derive(Debug, Clone)]
enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Eq(Operand, Operand),
}

#[derive(Debug, Clone)]
enum Operand {
    Lit(String),
    Num(f64),
    True,
    Field(String),
    Lower(Box<Operand>),
    Substitute(Box<Operand>, String, String),
}

fn parse_formula(input: &str) -> Result<Expr, ()> {
    let mut p = Parser { chars: input.chars().collect(), i: 0 };
    let expr = p.expr()?;
    p.ws();
    if p.i == p.chars.len() { Ok(expr) } else { Err(()) }
}

struct Parser {
    chars: Vec<char>,
    i: usize,
}

impl Parser {
    fn ws(&mut self) {
        while self.i < self.chars.len() && self.chars[self.i].is_whitespace() {
            self.i += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.i).copied()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.i += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), ()> {
        if self.eat(c) { Ok(()) } else { Err(()) }
    }

    fn kw(&mut self, kw: &str) -> bool {
        let kw: Vec<char> = kw.chars().collect();
        if self.chars[self.i..].starts_with(&kw) {
            self.i += kw.len();
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<Expr, ()> {
        self.ws();
        if self.kw("AND(") {
            return Ok(Expr::And(self.expr_list()?));
        }
        if self.kw("OR(") {
            return Ok(Expr::Or(self.expr_list()?));
        }
        let lhs = self.operand()?;
        self.ws();
        self.expect('=')?;
        let rhs = self.operand()?;
        Ok(Expr::Eq(lhs, rhs))
    }

    fn expr_list(&mut self) -> Result<Vec<Expr>, ()> {
        let mut out = vec![self.expr()?];
        loop {
            self.ws();
            if self.eat(',') {
                out.push(self.expr()?);
            } else {
                self.expect(')')?;
                return Ok(out);
            }
        }
    }

    fn operand(&mut self) -> Result<Operand, ()> {
        self.ws();
        if self.kw("TRUE()") {
            return Ok(Operand::True);
        }
        if self.kw("LOWER(") {
            let inner = self.operand()?;
            self.ws();
            self.expect(')')?;
            return Ok(Operand::Lower(Box::new(inner)));
        }
        if self.kw("SUBSTITUTE(") {
            let inner = self.operand()?;
            self.ws();
            self.expect(',')?;
            self.ws();
            let from = self.string()?;
            self.ws();
            self.expect(',')?;
            self.ws();
            let to = self.string()?;
            self.ws();
            self.expect(')')?;
            return Ok(Operand::Substitute(Box::new(inner), from, to));
        }
        match self.peek() {
            Some('"') => Ok(Operand::Lit(self.string()?)),
            Some('{') => {
                self.i += 1;
                let mut name = String::new();
                while let Some(c) = self.peek() {
                    if c == '}' {
                        self.i += 1;
                        return Ok(Operand::Field(name));
                    }
                    name.push(c);
                    self.i += 1;
                }
                Err(())
            }
            Some(c) if c.is_ascii_digit() || c == '-' => {
                let mut num = String::new();
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() || c == '.' || c == '-' {
                        num.push(c);
                        self.i += 1;
                    } else {
                        break;
                    }
                }
                num.parse::<f64>().map(Operand::Num).map_err(|_| ())
            }
            _ => Err(()),
        }
    }

    fn string(&mut self) -> Result<String, ()> {
        self.expect('"')?;
        let mut out = String::new();
        while let Some(c) = self.peek() {
            match c {
                '\\' => {
                    self.i += 1;
                    let Some(escaped) = self.peek() else { return Err(()) };
                    out.push(escaped);
                    self.i += 1;
                }
                '"' => {
                    self.i += 1;
                    return Ok(out);
                }
                _ => {
                    out.push(c);
                    self.i += 1;
                }
            }
        }
        Err(())
    }
}

fn eval(expr: &Expr, row: &Fields, schema: &[String]) -> Result<bool, ()> {
    match expr {
        Expr::And(list) => {
            for e in list {
                if !eval(e, row, schema)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expr::Or(list) => {
            for e in list {
                if eval(e, row, schema)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Expr::Eq(a, b) => Ok(eval_operand(a, row, schema)? == eval_operand(b, row, schema)?),
    }
}

fn eval_operand(op: &Operand, row: &Fields, schema: &[String]) -> Result<String, ()> {
    match op {
        Operand::Lit(s) => Ok(s.clone()),
        Operand::Num(n) => Ok(fmt_num(*n)),
        Operand::True => Ok("true".to_string()),
        Operand::Field(name) => {
            if !schema.iter().any(|s| s == name) {
                return Err(());
            }
            Ok(stringify(row.get(name)))
        }
        Operand::Lower(inner) => Ok(eval_operand(inner, row, schema)?.to_lowercase()),
        Operand::Substitute(inner, from, to) => Ok(eval_operand(inner, row, schema)?.replace(from, to)),
    }
}

fn stringify(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(true)) => "true".to_string(),
        Some(Value::Bool(false)) => "false".to_string(),
        Some(Value::Number(n)) => n.as_f64().map(fmt_num).unwrap_or_default(),
        _ => String::new(),
    }
}

fn fmt_num(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}
