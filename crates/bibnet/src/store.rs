//! Tabular sink for pipeline outputs, backed by SQLite.
//!
//! The pipeline only needs three things from storage: create a schema, create-or-replace a
//! table from a result set, and query a table back. [`TabularStore`] offers exactly that on top
//! of a single async SQLite connection. Schemas are attached databases living next to the main
//! file (`project_data.db` + schema `project` → `project_data.project.db`), so SQL such as
//! `SELECT * FROM project.records` works as written.
//!
//! Rows travel as [`Table`]s of SQLite [`Value`]s. Typed rows produced by the normalizer and the
//! network builder implement [`TableRow`] and convert with [`Table::from_rows`].
//!
//! # Examples
//!
//! ```no_run
//! use bibnet::store::{Table, TabularStore, Value};
//!
//! # async fn example() -> Result<(), bibnet::errors::BibnetError> {
//! let store = TabularStore::open("project_data.db").await?;
//! store.create_schema("project").await?;
//!
//! let mut table = Table::new(["org_id", "name"]);
//! table.push(vec![Value::Integer(0), Value::Text("unknown".into())])?;
//! store.create_or_replace_table("project", "organisations", &table).await?;
//!
//! let back = store.query("SELECT * FROM project.organisations").await?;
//! assert_eq!(back.len(), 1);
//! # Ok(())
//! # }
//! ```

use lazy_static::lazy_static;
use regex::Regex;
pub use rusqlite::types::Value;
use rusqlite::params_from_iter;
use tokio_rusqlite::Connection;

use super::*;

lazy_static! {
  static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Checks that `name` can be used as an unquoted SQL identifier.
pub fn validate_identifier(name: &str) -> Result<(), BibnetError> {
  if IDENTIFIER.is_match(name) {
    Ok(())
  } else {
    Err(BibnetError::InvalidIdentifier(name.to_string()))
  }
}

/// A typed row that knows its column layout.
pub trait TableRow {
  /// Column names, in the order [`TableRow::values`] yields them.
  const COLUMNS: &'static [&'static str];

  /// The row's cells.
  fn values(&self) -> Vec<Value>;
}

/// An in-memory result set: named columns and rows of SQLite values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
  columns: Vec<String>,
  rows:    Vec<Vec<Value>>,
}

impl Table {
  /// Creates an empty table with the given columns.
  pub fn new<I, S>(columns: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>, {
    Self { columns: columns.into_iter().map(Into::into).collect(), rows: Vec::new() }
  }

  /// Builds a table from typed rows. An empty slice still yields the full column layout.
  pub fn from_rows<R: TableRow>(rows: &[R]) -> Self {
    Self {
      columns: R::COLUMNS.iter().map(|c| c.to_string()).collect(),
      rows:    rows.iter().map(TableRow::values).collect(),
    }
  }

  /// Appends a row, checking its width.
  pub fn push(&mut self, row: Vec<Value>) -> Result<(), BibnetError> {
    if row.len() != self.columns.len() {
      return Err(BibnetError::Config(format!(
        "row has {} cells but table has {} columns",
        row.len(),
        self.columns.len()
      )));
    }
    self.rows.push(row);
    Ok(())
  }

  /// Column names.
  pub fn columns(&self) -> &[String] { &self.columns }

  /// All rows.
  pub fn rows(&self) -> &[Vec<Value>] { &self.rows }

  /// Number of rows.
  pub fn len(&self) -> usize { self.rows.len() }

  /// Whether the table has no rows.
  pub fn is_empty(&self) -> bool { self.rows.is_empty() }

  /// Position of a column, or a [`BibnetError::MalformedResponse`] naming what is missing.
  pub fn column_index(&self, name: &str) -> Result<usize, BibnetError> {
    self
      .columns
      .iter()
      .position(|c| c == name)
      .ok_or_else(|| BibnetError::MalformedResponse(format!("missing column `{name}`")))
  }

  /// The cell at `row` in column `name`, if both exist.
  pub fn get(&self, row: usize, name: &str) -> Option<&Value> {
    let index = self.columns.iter().position(|c| c == name)?;
    self.rows.get(row)?.get(index)
  }

  /// SQL column declarations, typed after the first non-null value of each column.
  fn column_declarations(&self) -> Vec<String> {
    self
      .columns
      .iter()
      .enumerate()
      .map(|(i, name)| {
        let affinity = self
          .rows
          .iter()
          .map(|row| &row[i])
          .find(|v| !matches!(v, Value::Null))
          .map(|v| match v {
            Value::Integer(_) => " INTEGER",
            Value::Real(_) => " REAL",
            Value::Text(_) => " TEXT",
            Value::Blob(_) => " BLOB",
            Value::Null => "",
          })
          .unwrap_or("");
        format!("\"{name}\"{affinity}")
      })
      .collect()
  }
}

/// Converts a JSON scalar into a cell. Arrays and objects are stored as their JSON text.
pub fn json_value(json: &Json) -> Value {
  match json {
    Json::Null => Value::Null,
    Json::Bool(b) => Value::from(*b),
    Json::Number(n) => match n.as_i64() {
      Some(i) => Value::Integer(i),
      None => n.as_f64().map(Value::Real).unwrap_or(Value::Null),
    },
    Json::String(s) => Value::Text(s.clone()),
    other => Value::Text(other.to_string()),
  }
}

/// Reads a text cell.
pub fn as_text(value: &Value) -> Option<&str> {
  match value {
    Value::Text(s) => Some(s.as_str()),
    _ => None,
  }
}

/// Reads an integer cell.
pub fn as_integer(value: &Value) -> Option<i64> {
  match value {
    Value::Integer(i) => Some(*i),
    _ => None,
  }
}

/// Reads a numeric cell as a float; integers are widened.
pub fn as_real(value: &Value) -> Option<f64> {
  match value {
    Value::Real(f) => Some(*f),
    Value::Integer(i) => Some(*i as f64),
    _ => None,
  }
}

/// Where the main database lives; attached schemas follow it.
#[derive(Debug, Clone)]
enum Location {
  /// A file on disk.
  File(PathBuf),
  /// A private in-memory database.
  Memory,
}

impl Location {
  /// Path handed to `ATTACH DATABASE` for `schema`.
  fn schema_path(&self, schema: &str) -> String {
    match self {
      Location::Memory => ":memory:".to_string(),
      Location::File(path) => {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("store");
        path.with_file_name(format!("{stem}.{schema}.db")).to_string_lossy().into_owned()
      },
    }
  }
}

/// Handle to a SQLite-backed tabular store.
pub struct TabularStore {
  conn:     Connection,
  location: Location,
}

impl TabularStore {
  /// Opens or creates a store at the specified path, creating parent directories.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self, BibnetError> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)?;
    }
    debug!("Opening tabular store at {}", path.display());
    let conn = Connection::open(&path).await?;
    Ok(Self { conn, location: Location::File(path) })
  }

  /// Opens a private in-memory store; schemas are in-memory too.
  pub async fn open_in_memory() -> Result<Self, BibnetError> {
    let conn = Connection::open_in_memory().await?;
    Ok(Self { conn, location: Location::Memory })
  }

  /// Makes `schema` available for qualified table names. Calling it twice is harmless.
  pub async fn create_schema(&self, schema: &str) -> Result<(), BibnetError> {
    validate_identifier(schema)?;
    if schema == "main" {
      return Ok(());
    }
    let schema = schema.to_string();
    let path = self.location.schema_path(&schema);
    self
      .conn
      .call(move |conn| {
        let attached = {
          let mut stmt = conn.prepare("PRAGMA database_list")?;
          let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
          names.collect::<Result<Vec<_>, _>>()?
        };
        if !attached.iter().any(|name| *name == schema) {
          trace!("Attaching schema {schema} from {path}");
          conn.execute(&format!("ATTACH DATABASE ?1 AS \"{schema}\""), [path])?;
        }
        Ok(())
      })
      .await
      .map_err(BibnetError::from)
  }

  /// Drops `schema.name` if present and recreates it from `table`.
  pub async fn create_or_replace_table(
    &self,
    schema: &str,
    name: &str,
    table: &Table,
  ) -> Result<(), BibnetError> {
    self.replace_tables(schema, vec![(name.to_string(), table.clone())]).await
  }

  /// Replaces several tables in one transaction: either all of them land or none does.
  pub async fn replace_tables(
    &self,
    schema: &str,
    tables: Vec<(String, Table)>,
  ) -> Result<(), BibnetError> {
    validate_identifier(schema)?;
    for (name, table) in &tables {
      validate_identifier(name)?;
      for column in table.columns() {
        if column.contains('"') {
          return Err(BibnetError::InvalidIdentifier(column.clone()));
        }
      }
    }
    let schema = schema.to_string();
    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        for (name, table) in &tables {
          tx.execute(&format!("DROP TABLE IF EXISTS \"{schema}\".\"{name}\""), [])?;
          tx.execute(
            &format!(
              "CREATE TABLE \"{schema}\".\"{name}\" ({})",
              table.column_declarations().join(", ")
            ),
            [],
          )?;
          if !table.is_empty() {
            let placeholders = vec!["?"; table.columns().len()].join(", ");
            let mut stmt = tx
              .prepare(&format!("INSERT INTO \"{schema}\".\"{name}\" VALUES ({placeholders})"))?;
            for row in table.rows() {
              stmt.execute(params_from_iter(row.iter()))?;
            }
          }
          debug!("Wrote {}.{} ({} rows)", schema, name, table.len());
        }
        tx.commit()?;
        Ok(())
      })
      .await
      .map_err(BibnetError::from)
  }

  /// Runs a query and returns its full result set.
  pub async fn query(&self, sql: &str) -> Result<Table, BibnetError> {
    let sql = sql.to_string();
    self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();
        let mut table = Table { columns, rows: Vec::new() };
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
          let mut values = Vec::with_capacity(width);
          for i in 0..width {
            values.push(row.get::<_, Value>(i)?);
          }
          table.rows.push(values);
        }
        Ok(table)
      })
      .await
      .map_err(BibnetError::from)
  }

  /// Whether `schema.name` exists.
  pub async fn table_exists(&self, schema: &str, name: &str) -> Result<bool, BibnetError> {
    validate_identifier(schema)?;
    let sql = format!("SELECT count(*) FROM \"{schema}\".sqlite_master WHERE type = 'table' AND name = ?1");
    let name = name.to_string();
    self
      .conn
      .call(move |conn| {
        let count: i64 = conn.query_row(&sql, [name], |row| row.get(0))?;
        Ok(count > 0)
      })
      .await
      .map_err(BibnetError::from)
  }
}

#[cfg(test)]
mod tests {
  use tempfile::tempdir;

  use super::*;

  fn sample_table() -> Table {
    let mut table = Table::new(["org_id", "name", "share"]);
    table.push(vec![Value::Integer(0), Value::Text("unknown".into()), Value::Real(0.5)]).unwrap();
    table.push(vec![Value::Integer(1), Value::Null, Value::Real(1.0)]).unwrap();
    table
  }

  #[test]
  fn test_identifier_validation() {
    assert!(validate_identifier("net_org_edges").is_ok());
    assert!(validate_identifier("v2_records").is_ok());
    assert!(validate_identifier("records; DROP TABLE x").is_err());
    assert!(validate_identifier("1records").is_err());
    assert!(validate_identifier("").is_err());
  }

  #[test]
  fn test_push_rejects_wrong_width() {
    let mut table = Table::new(["a", "b"]);
    assert!(table.push(vec![Value::Integer(1)]).is_err());
    assert!(table.is_empty());
  }

  #[tokio::test]
  async fn test_create_query_roundtrip() -> Result<(), BibnetError> {
    let store = TabularStore::open_in_memory().await?;
    store.create_schema("project").await?;
    store.create_or_replace_table("project", "organisations", &sample_table()).await?;

    let back = store.query("SELECT * FROM project.organisations ORDER BY org_id").await?;
    assert_eq!(back.columns(), &["org_id", "name", "share"]);
    assert_eq!(back.len(), 2);
    assert_eq!(back.get(0, "name"), Some(&Value::Text("unknown".into())));
    assert_eq!(back.get(1, "name"), Some(&Value::Null));
    Ok(())
  }

  #[tokio::test]
  async fn test_replace_overwrites_previous_table() -> Result<(), BibnetError> {
    let store = TabularStore::open_in_memory().await?;
    store.create_schema("project").await?;
    store.create_or_replace_table("project", "organisations", &sample_table()).await?;

    let mut smaller = Table::new(["org_id"]);
    smaller.push(vec![Value::Integer(7)])?;
    store.create_or_replace_table("project", "organisations", &smaller).await?;

    let back = store.query("SELECT * FROM project.organisations").await?;
    assert_eq!(back.columns(), &["org_id"]);
    assert_eq!(back.len(), 1);
    Ok(())
  }

  #[tokio::test]
  async fn test_empty_table_keeps_columns() -> Result<(), BibnetError> {
    let store = TabularStore::open_in_memory().await?;
    store.create_schema("project").await?;
    store.create_or_replace_table("project", "funding", &Table::new(["record_id", "org"])).await?;

    assert!(store.table_exists("project", "funding").await?);
    let back = store.query("SELECT * FROM project.funding").await?;
    assert_eq!(back.columns(), &["record_id", "org"]);
    assert!(back.is_empty());
    Ok(())
  }

  #[tokio::test]
  async fn test_replace_tables_is_all_or_nothing() -> Result<(), BibnetError> {
    let store = TabularStore::open_in_memory().await?;
    store.create_schema("project").await?;

    // A duplicated column name makes the second CREATE fail inside the transaction.
    let broken = Table::new(["x", "x"]);
    let result = store
      .replace_tables(
        "project",
        vec![("records".to_string(), sample_table()), ("broken".to_string(), broken)],
      )
      .await;

    assert!(result.is_err());
    assert!(!store.table_exists("project", "records").await?);
    Ok(())
  }

  #[tokio::test]
  async fn test_schema_file_next_to_main_file() -> Result<(), BibnetError> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data").join("project_data.db");
    let store = TabularStore::open(&path).await?;
    store.create_schema("project").await?;
    store.create_schema("project").await?;
    store.create_or_replace_table("project", "organisations", &sample_table()).await?;

    assert!(path.exists());
    assert!(dir.path().join("data").join("project_data.project.db").exists());
    Ok(())
  }

  #[tokio::test]
  async fn test_invalid_names_rejected() {
    let store = TabularStore::open_in_memory().await.unwrap();
    assert!(store.create_schema("bad name").await.is_err());
    assert!(store.create_or_replace_table("main", "x;--", &sample_table()).await.is_err());
  }
}
