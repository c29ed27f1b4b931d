use crate::error::{EnsembleError, Result};
use crate::layout::{EnsembleLayout, RunDir};
use crate::store::TableBundle;
use crate::types::RunIdentity;
use polars::prelude::*;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The parsed tables of one run, as read from its result store.
#[derive(Debug, Clone)]
pub struct RunResult {
    identity: RunIdentity,
    source: PathBuf,
    tables: BTreeMap<String, DataFrame>,
}

impl RunResult {
    pub fn new(
        identity: RunIdentity,
        source: impl Into<PathBuf>,
        tables: BTreeMap<String, DataFrame>,
    ) -> Self {
        RunResult {
            identity,
            source: source.into(),
            tables,
        }
    }

    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn table(&self, name: &str) -> Option<&DataFrame> {
        self.tables.get(name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Gene identifiers assigned to `cluster` in this run, sorted.
    ///
    /// Membership comes from `row_members`, restricted to its last iteration
    /// when the table records iterations. Gene names are read from a `name`
    /// column if present, otherwise resolved through `row_names` by
    /// `order_num`.
    pub fn cluster_genes(&self, cluster: u32) -> Result<Vec<String>> {
        let members = self.table("row_members").ok_or_else(|| {
            EnsembleError::not_found(format!("row_members table in run {}", self.identity))
        })?;

        let mut lf = members.clone().lazy();
        if has_column(members, "iteration") {
            lf = lf.filter(col("iteration").eq(col("iteration").max()));
        }
        lf = lf.filter(
            col("cluster")
                .cast(DataType::Int64)
                .eq(lit(cluster as i64)),
        );
        if !has_column(members, "name") {
            let names = self.table("row_names").ok_or_else(|| {
                EnsembleError::not_found(format!("row_names table in run {}", self.identity))
            })?;
            lf = lf.join(
                names
                    .clone()
                    .lazy()
                    .select([col("order_num"), col("name")]),
                [col("order_num")],
                [col("order_num")],
                JoinArgs::new(JoinType::Inner),
            );
        }

        let genes = lf
            .select([col("name").cast(DataType::String)])
            .sort(["name"], SortMultipleOptions::default())
            .collect()?;
        let genes = genes
            .column("name")?
            .str()?
            .into_iter()
            .flatten()
            .map(str::to_string)
            .collect();
        Ok(genes)
    }

    pub fn to_bundle(&self) -> TableBundle {
        TableBundle {
            provenance: vec![self.source.display().to_string()],
            tables: self.tables.clone(),
        }
    }

    pub fn from_bundle(identity: RunIdentity, bundle: TableBundle) -> Self {
        let source = bundle.provenance.into_iter().next().unwrap_or_default();
        RunResult {
            identity,
            source: PathBuf::from(source),
            tables: bundle.tables,
        }
    }
}

pub(crate) fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_index(name).is_some()
}

/// Parses one run's result store.
pub trait RunLoader: Send + Sync {
    fn load(&self, run: &RunDir) -> Result<RunResult>;
}

/// Reads every table of a run's SQLite result store into DataFrames.
#[derive(Debug, Clone)]
pub struct SqliteRunLoader {
    layout: EnsembleLayout,
}

impl SqliteRunLoader {
    pub fn new(layout: &EnsembleLayout) -> Self {
        SqliteRunLoader {
            layout: layout.clone(),
        }
    }
}

impl RunLoader for SqliteRunLoader {
    fn load(&self, run: &RunDir) -> Result<RunResult> {
        let path = self.layout.result_db_path(run);
        if !path.is_file() {
            return Err(EnsembleError::not_found(format!(
                "result store {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let mut tables = BTreeMap::new();
        for name in table_names(&conn)? {
            let df = read_table(&conn, &name)?;
            log::debug!("run {}: {} has {} rows", run.identity, name, df.height());
            tables.insert(name, df);
        }
        if tables.is_empty() {
            return Err(EnsembleError::InvalidFileFormat(format!(
                "{} contains no tables",
                path.display()
            )));
        }
        Ok(RunResult::new(run.identity.clone(), path, tables))
    }
}

fn table_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut names = Vec::new();
    for name in rows {
        names.push(name?);
    }
    Ok(names)
}

fn read_table(conn: &Connection, name: &str) -> Result<DataFrame> {
    let sql = format!("SELECT * FROM \"{}\"", name.replace('"', "\"\""));
    let mut stmt = conn.prepare(&sql)?;
    let columns: Vec<(String, Option<String>)> = stmt
        .columns()
        .iter()
        .map(|c| (c.name().to_string(), c.decl_type().map(str::to_string)))
        .collect();

    let mut values: Vec<Vec<Value>> = vec![Vec::new(); columns.len()];
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        for (i, column) in values.iter_mut().enumerate() {
            column.push(row.get::<_, Value>(i)?);
        }
    }

    let columns = columns
        .iter()
        .zip(values)
        .map(|((name, decl_type), values)| sqlite_column(name, decl_type.as_deref(), values))
        .collect();
    Ok(DataFrame::new(columns)?)
}

/// Column type implied by a declared SQLite type, following SQLite's
/// affinity rules. `None` when the declaration says nothing useful.
fn declared_dtype(decl_type: Option<&str>) -> Option<DataType> {
    let decl = decl_type?.to_ascii_uppercase();
    if decl.contains("INT") {
        Some(DataType::Int64)
    } else if decl.contains("CHAR") || decl.contains("CLOB") || decl.contains("TEXT") {
        Some(DataType::String)
    } else if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") {
        Some(DataType::Float64)
    } else {
        None
    }
}

/// Text form of a stored value; `None` for NULL.
pub(crate) fn value_to_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(f) => Some(f.to_string()),
        Value::Text(s) => Some(s),
        Value::Blob(b) => Some(String::from_utf8_lossy(&b).into_owned()),
    }
}

/// Picks the narrowest column type that holds every stored value.
///
/// A column without any value (empty table, or all NULL) takes its declared
/// type instead, so it does not widen the same column of other runs when
/// tables are concatenated. Without a usable declaration it is typed `Null`.
fn sqlite_column(name: &str, decl_type: Option<&str>, values: Vec<Value>) -> Column {
    let non_null = values.iter().any(|v| !matches!(v, Value::Null));
    if !non_null {
        let dtype = declared_dtype(decl_type).unwrap_or(DataType::Null);
        return Column::full_null(name.into(), values.len(), &dtype);
    }

    let all_int = values
        .iter()
        .all(|v| matches!(v, Value::Null | Value::Integer(_)));
    let all_numeric = values
        .iter()
        .all(|v| matches!(v, Value::Null | Value::Integer(_) | Value::Real(_)));

    if all_int {
        let data: Vec<Option<i64>> = values
            .into_iter()
            .map(|v| match v {
                Value::Integer(i) => Some(i),
                _ => None,
            })
            .collect();
        Column::new(name.into(), data)
    } else if all_numeric {
        let data: Vec<Option<f64>> = values
            .into_iter()
            .map(|v| match v {
                Value::Integer(i) => Some(i as f64),
                Value::Real(f) => Some(f),
                _ => None,
            })
            .collect();
        Column::new(name.into(), data)
    } else {
        let data: Vec<Option<String>> = values.into_iter().map(value_to_text).collect();
        Column::new(name.into(), data)
    }
}
