// SQL rendering that differs between the MySQL and PostgreSQL backends.

use sqlx::any::{AnyArguments, AnyQueryResult};
use sqlx::query::Query;
use sqlx::{Any, Executor};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Postgres,
}

#[derive(Debug, Error)]
pub enum DialectError {
    #[error("unsupported DB_URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("empty {0} columns")]
    EmptyColumns(&'static str),
    #[error("args mismatch: got {got}, want {want}")]
    ArgumentCount { got: usize, want: usize },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

const MYSQL_DUPLICATE_KEY: u16 = 1062;
const POSTGRES_UNIQUE_VIOLATION: &str = "23505";

impl Dialect {
    /// Accepts a full database URL or a bare scheme, with an optional `jdbc:` prefix.
    pub fn from_scheme(url: &str) -> Result<Self, DialectError> {
        let trimmed = url.trim();
        let lowered = trimmed.to_ascii_lowercase();
        let without_jdbc = lowered.strip_prefix("jdbc:").unwrap_or(&lowered);
        let scheme = match without_jdbc.split_once("://") {
            Some((scheme, _)) => scheme,
            None => without_jdbc.split(':').next().unwrap_or_default(),
        };

        match scheme {
            "mysql" => Ok(Self::MySql),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            _ => Err(DialectError::UnsupportedScheme(scheme.to_owned())),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
        }
    }

    /// Rewrites `?` placeholders into the dialect's positional form.
    pub fn rebind(self, sql: &str) -> String {
        match self {
            Self::MySql => sql.to_owned(),
            Self::Postgres => rebind_dollar(sql),
        }
    }

    pub const fn bool_literal(self, value: bool) -> &'static str {
        match (self, value) {
            (Self::MySql, true) => "1",
            (Self::MySql, false) => "0",
            (Self::Postgres, true) => "TRUE",
            (Self::Postgres, false) => "FALSE",
        }
    }

    pub fn is_duplicate_key(self, error: &sqlx::Error) -> bool {
        let Some(db_error) = error.as_database_error() else {
            return false;
        };
        match self {
            Self::MySql => db_error
                .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                .map(|mysql| mysql.number() == MYSQL_DUPLICATE_KEY)
                .unwrap_or_else(|| db_error.is_unique_violation()),
            Self::Postgres => db_error.code().as_deref() == Some(POSTGRES_UNIQUE_VIOLATION),
        }
    }

    pub fn render_insert_ignore(
        self,
        table: &str,
        cols: &[&str],
        conflict_cols: &[&str],
    ) -> Result<String, DialectError> {
        let cols = non_blank(cols);
        if cols.is_empty() {
            return Err(DialectError::EmptyColumns("insert"));
        }
        let col_list = cols.join(", ");
        let values = placeholders(cols.len());

        match self {
            Self::MySql => Ok(format!("INSERT IGNORE INTO {table} ({col_list}) VALUES ({values})")),
            Self::Postgres => {
                let conflict = non_blank(conflict_cols);
                if conflict.is_empty() {
                    return Err(DialectError::EmptyColumns("conflict"));
                }
                Ok(format!(
                    "INSERT INTO {table} ({col_list}) VALUES ({values}) ON CONFLICT ({}) DO NOTHING",
                    conflict.join(", ")
                ))
            }
        }
    }

    /// `update_cols` overwrite on conflict; `coalesce_cols` keep the stored value when the new one is NULL.
    pub fn render_upsert(
        self,
        table: &str,
        cols: &[&str],
        conflict_cols: &[&str],
        update_cols: &[&str],
        coalesce_cols: &[&str],
    ) -> Result<String, DialectError> {
        let insert_cols = non_blank(cols);
        if insert_cols.is_empty() {
            return Err(DialectError::EmptyColumns("insert"));
        }
        let update = non_blank(update_cols);
        let coalesce = non_blank(coalesce_cols);
        if update.is_empty() && coalesce.is_empty() {
            return self.render_insert_ignore(table, cols, conflict_cols);
        }

        let col_list = insert_cols.join(", ");
        let values = placeholders(insert_cols.len());

        match self {
            Self::MySql => {
                let assignments = update
                    .iter()
                    .map(|col| format!("{col} = VALUES({col})"))
                    .chain(coalesce.iter().map(|col| format!("{col} = COALESCE(VALUES({col}), {col})")))
                    .collect::<Vec<_>>()
                    .join(", ");
                Ok(format!(
                    "INSERT INTO {table} ({col_list}) VALUES ({values}) ON DUPLICATE KEY UPDATE {assignments}"
                ))
            }
            Self::Postgres => {
                let conflict = non_blank(conflict_cols);
                if conflict.is_empty() {
                    return Err(DialectError::EmptyColumns("conflict"));
                }
                let assignments = update
                    .iter()
                    .map(|col| format!("{col} = EXCLUDED.{col}"))
                    .chain(
                        coalesce
                            .iter()
                            .map(|col| format!("{col} = COALESCE(EXCLUDED.{col}, {table}.{col})")),
                    )
                    .collect::<Vec<_>>()
                    .join(", ");
                Ok(format!(
                    "INSERT INTO {table} ({col_list}) VALUES ({values}) ON CONFLICT ({}) DO UPDATE SET {assignments}",
                    conflict.join(", ")
                ))
            }
        }
    }
}

/// `?` to `$1..$N`, leaving single-quoted literals untouched.
pub fn rebind_dollar(sql: &str) -> String {
    if !sql.contains('?') {
        return sql.to_owned();
    }

    let mut out = String::with_capacity(sql.len() + 8);
    let mut chars = sql.chars().peekable();
    let mut in_literal = false;
    let mut position = 0usize;

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                out.push(ch);
                if in_literal && chars.peek() == Some(&'\'') {
                    // escaped quote inside a literal
                    out.push('\'');
                    chars.next();
                } else {
                    in_literal = !in_literal;
                }
            }
            '?' if !in_literal => {
                position += 1;
                out.push('$');
                out.push_str(&position.to_string());
            }
            _ => out.push(ch),
        }
    }

    out
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for SqlArg {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for SqlArg {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for SqlArg {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for SqlArg {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<SqlArg>> From<Option<T>> for SqlArg {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

fn bind_args<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    args: &[SqlArg],
) -> Query<'q, Any, AnyArguments<'q>> {
    for arg in args {
        query = match arg {
            SqlArg::Null => query.bind(Option::<String>::None),
            SqlArg::Bool(value) => query.bind(*value),
            SqlArg::Int(value) => query.bind(*value),
            SqlArg::Float(value) => query.bind(*value),
            SqlArg::Text(value) => query.bind(value.clone()),
        };
    }
    query
}

fn check_arity(cols: &[&str], args: &[SqlArg]) -> Result<(), DialectError> {
    let want = non_blank(cols).len();
    if args.len() != want {
        return Err(DialectError::ArgumentCount { got: args.len(), want });
    }
    Ok(())
}

pub async fn exec_insert_ignore<'c, E>(
    executor: E,
    dialect: Dialect,
    table: &str,
    cols: &[&str],
    conflict_cols: &[&str],
    args: &[SqlArg],
) -> Result<AnyQueryResult, DialectError>
where
    E: Executor<'c, Database = Any>,
{
    check_arity(cols, args)?;
    let sql = dialect.rebind(&dialect.render_insert_ignore(table, cols, conflict_cols)?);
    Ok(bind_args(sqlx::query(&sql), args).execute(executor).await?)
}

#[allow(clippy::too_many_arguments)]
pub async fn exec_upsert<'c, E>(
    executor: E,
    dialect: Dialect,
    table: &str,
    cols: &[&str],
    conflict_cols: &[&str],
    update_cols: &[&str],
    coalesce_cols: &[&str],
    args: &[SqlArg],
) -> Result<AnyQueryResult, DialectError>
where
    E: Executor<'c, Database = Any>,
{
    check_arity(cols, args)?;
    let sql = dialect.rebind(&dialect.render_upsert(
        table,
        cols,
        conflict_cols,
        update_cols,
        coalesce_cols,
    )?);
    Ok(bind_args(sqlx::query(&sql), args).execute(executor).await?)
}

fn non_blank<'a>(cols: &[&'a str]) -> Vec<&'a str> {
    cols.iter().map(|col| col.trim()).filter(|col| !col.is_empty()).collect()
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
