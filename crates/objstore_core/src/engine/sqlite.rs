//! SQLite-backed durable engine.
//!
//! # Responsibility
//! - Map one named store to one SQLite file (or a private in-memory db).
//! - Compile predicates and sort descriptors into parameterized SQL.
//!
//! # Invariants
//! - Compiled predicates are two-valued: every leaf yields 0 or 1, never
//!   NULL, so `NOT` agrees with `Predicate::evaluate`.
//! - Attribute paths are bound as parameters, never spliced into SQL.
//! - Unsorted queries return rows in insertion order (`seq`).

use crate::config::{StoreConfig, StoreLocation};
use crate::db::{open_db, open_db_in_memory};
use crate::engine::{
    ChangeSet, Engine, EngineError, EngineResult, PersistentContainer, StoreBackend,
};
use crate::model::entity::{is_valid_identifier, EntityKind};
use crate::model::predicate::{ComparisonOp, Predicate, SortDescriptor};
use crate::model::record::{AttributeValue, Attributes, RecordData, RecordId};
use log::info;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row, TransactionBehavior};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

const STORE_FILE_EXTENSION: &str = "sqlite";

/// Engine that opens `<directory>/<name>.sqlite` files.
#[derive(Debug, Clone)]
pub struct SqliteEngine {
    location: StoreLocation,
    busy_timeout: Duration,
}

impl SqliteEngine {
    pub fn new(location: StoreLocation, busy_timeout: Duration) -> Self {
        Self {
            location,
            busy_timeout,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.location.clone(), config.busy_timeout())
    }

    /// File backing store `name`; `None` for in-memory locations.
    pub fn store_path(&self, name: &str) -> Option<PathBuf> {
        match &self.location {
            StoreLocation::Directory(directory) => {
                Some(directory.join(format!("{name}.{STORE_FILE_EXTENSION}")))
            }
            StoreLocation::InMemory => None,
        }
    }
}

impl Engine for SqliteEngine {
    fn open_or_create_store(&self, name: &str) -> EngineResult<PersistentContainer> {
        if !is_valid_identifier(name) {
            return Err(EngineError::InvalidStoreName(name.to_string()));
        }

        let conn = match self.store_path(name) {
            Some(path) => open_db(path, self.busy_timeout)?,
            None => open_db_in_memory()?,
        };
        Ok(PersistentContainer::new(name, Arc::new(SqliteBackend::new(conn))))
    }
}

/// Store backend over one migrated connection.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StoreBackend for SqliteBackend {
    fn query(
        &self,
        kind: &EntityKind,
        filter: Option<&Predicate>,
        sort: Option<&SortDescriptor>,
    ) -> EngineResult<Vec<RecordData>> {
        let mut sql = String::from("SELECT id, attributes FROM records WHERE kind = ?");
        let mut bind_values = vec![Value::Text(kind.as_str().to_string())];

        if let Some(filter) = filter {
            sql.push_str(" AND ");
            compile_predicate(filter, &mut sql, &mut bind_values);
        }

        sql.push_str(" ORDER BY ");
        if let Some(sort) = sort {
            sql.push_str(&attribute_expr("json_extract", &sort.attribute, &mut bind_values));
            sql.push_str(if sort.ascending { " ASC, " } else { " DESC, " });
        }
        sql.push_str("seq ASC");

        let conn = self.connection();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_record_row(row, kind)?);
        }

        Ok(records)
    }

    fn delete_bulk(&self, kind: &EntityKind) -> EngineResult<Vec<RecordId>> {
        let conn = self.connection();
        let mut stmt = conn.prepare("DELETE FROM records WHERE kind = ?1 RETURNING id;")?;
        let mut rows = stmt.query([kind.as_str()])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            let id_text: String = row.get(0)?;
            ids.push(parse_record_id(&id_text)?);
        }

        info!(
            "event=bulk_delete module=sqlite status=ok kind={} deleted={}",
            kind,
            ids.len()
        );
        Ok(ids)
    }

    fn commit(&self, changes: &ChangeSet) -> EngineResult<()> {
        let mut conn = self.connection();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for record in &changes.inserts {
            tx.execute(
                "INSERT INTO records (id, kind, attributes) VALUES (?1, ?2, ?3);",
                params![
                    record.id.to_string(),
                    record.kind.as_str(),
                    serde_json::to_string(&record.attributes)?,
                ],
            )?;
        }

        for record in &changes.updates {
            let changed = tx.execute(
                "UPDATE records
                 SET attributes = ?2
                 WHERE id = ?1
                   AND kind = ?3;",
                params![
                    record.id.to_string(),
                    serde_json::to_string(&record.attributes)?,
                    record.kind.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(EngineError::Conflict(record.id));
            }
        }

        for id in &changes.deletes {
            tx.execute("DELETE FROM records WHERE id = ?1;", [id.to_string()])?;
        }

        tx.commit()?;
        Ok(())
    }
}

fn parse_record_row(row: &Row<'_>, kind: &EntityKind) -> EngineResult<RecordData> {
    let id_text: String = row.get("id")?;
    let attributes_text: String = row.get("attributes")?;
    let attributes: Attributes = serde_json::from_str(&attributes_text).map_err(|err| {
        EngineError::InvalidData(format!("records.attributes of {id_text}: {err}"))
    })?;

    Ok(RecordData {
        id: parse_record_id(&id_text)?,
        kind: kind.as_str().to_string(),
        attributes,
    })
}

fn parse_record_id(value: &str) -> EngineResult<RecordId> {
    Uuid::parse_str(value)
        .map_err(|_| EngineError::InvalidData(format!("invalid uuid `{value}` in records.id")))
}

/// Appends a 0/1-valued SQL expression for `predicate`.
fn compile_predicate(predicate: &Predicate, sql: &mut String, bind_values: &mut Vec<Value>) {
    match predicate {
        Predicate::True => sql.push('1'),
        Predicate::Compare {
            attribute,
            op,
            value,
        } => compile_comparison(attribute, *op, value, sql, bind_values),
        Predicate::IsNull(attribute) => {
            sql.push('(');
            sql.push_str(&attribute_expr("json_extract", attribute, bind_values));
            sql.push_str(" IS NULL)");
        }
        Predicate::And(parts) => compile_group(parts, " AND ", '1', sql, bind_values),
        Predicate::Or(parts) => compile_group(parts, " OR ", '0', sql, bind_values),
        Predicate::Not(inner) => {
            sql.push_str("(NOT ");
            compile_predicate(inner, sql, bind_values);
            sql.push(')');
        }
    }
}

fn compile_group(
    parts: &[Predicate],
    joiner: &str,
    empty: char,
    sql: &mut String,
    bind_values: &mut Vec<Value>,
) {
    if parts.is_empty() {
        sql.push(empty);
        return;
    }
    sql.push('(');
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            sql.push_str(joiner);
        }
        compile_predicate(part, sql, bind_values);
    }
    sql.push(')');
}

fn compile_comparison(
    attribute: &str,
    op: ComparisonOp,
    value: &AttributeValue,
    sql: &mut String,
    bind_values: &mut Vec<Value>,
) {
    if value.is_null() {
        let test = match op {
            ComparisonOp::Eq => " IS NULL)",
            ComparisonOp::Ne => " IS NOT NULL)",
            _ => {
                sql.push('0');
                return;
            }
        };
        sql.push('(');
        sql.push_str(&attribute_expr("json_extract", attribute, bind_values));
        sql.push_str(test);
        return;
    }

    let text_only = matches!(op, ComparisonOp::Contains | ComparisonOp::BeginsWith);
    let (family, bound) = match value {
        AttributeValue::Bool(flag) if !text_only => {
            ("('true', 'false')", Value::Integer(i64::from(*flag)))
        }
        AttributeValue::Integer(number) if !text_only => {
            ("('integer', 'real')", Value::Integer(*number))
        }
        AttributeValue::Real(number) if !text_only => ("('integer', 'real')", Value::Real(*number)),
        AttributeValue::Text(text) => ("('text')", Value::Text(text.clone())),
        _ => {
            sql.push('0');
            return;
        }
    };

    let negate = op == ComparisonOp::Ne;
    if negate {
        sql.push_str("(NOT ");
    }
    sql.push_str("COALESCE((");
    sql.push_str(&attribute_expr("json_type", attribute, bind_values));
    sql.push_str(" IN ");
    sql.push_str(family);
    sql.push_str(" AND ");
    let extracted = attribute_expr("json_extract", attribute, bind_values);
    match op {
        ComparisonOp::Eq | ComparisonOp::Ne => sql.push_str(&format!("{extracted} = ?")),
        ComparisonOp::Lt => sql.push_str(&format!("{extracted} < ?")),
        ComparisonOp::Le => sql.push_str(&format!("{extracted} <= ?")),
        ComparisonOp::Gt => sql.push_str(&format!("{extracted} > ?")),
        ComparisonOp::Ge => sql.push_str(&format!("{extracted} >= ?")),
        ComparisonOp::Contains => sql.push_str(&format!("instr({extracted}, ?) > 0")),
        ComparisonOp::BeginsWith => sql.push_str(&format!("instr({extracted}, ?) = 1")),
    }
    bind_values.push(bound);
    sql.push_str("), 0)");
    if negate {
        sql.push(')');
    }
}

/// Returns `function(attributes, ?)` with the JSON path bound, or `NULL` for
/// names that can never be stored.
fn attribute_expr(function: &str, attribute: &str, bind_values: &mut Vec<Value>) -> String {
    if !is_valid_identifier(attribute) {
        return "NULL".to_string();
    }
    bind_values.push(Value::Text(format!("$.{attribute}")));
    format!("{function}(attributes, ?)")
}
