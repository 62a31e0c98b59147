#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, Row, params_from_iter};

use super::super::StoreError;

/// Closed set of values a statement can bind.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Json(serde_json::Value),
    Blob(Vec<u8>),
    /// Bound as a JSON array, read back with `json_each`.
    TextArray(Vec<String>),
    IntegerArray(Vec<i64>),
}

impl SqlValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Json(_) => "json",
            Self::Blob(_) => "blob",
            Self::TextArray(_) => "text[]",
            Self::IntegerArray(_) => "integer[]",
        }
    }
}

fn json_text(encoded: serde_json::Result<String>) -> rusqlite::Result<ToSqlOutput<'static>> {
    encoded
        .map(|text| ToSqlOutput::Owned(Value::Text(text)))
        .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Self::Null => Ok(ToSqlOutput::Owned(Value::Null)),
            Self::Bool(v) => Ok(ToSqlOutput::Owned(Value::Integer(i64::from(*v)))),
            Self::Integer(v) => Ok(ToSqlOutput::Owned(Value::Integer(*v))),
            Self::Real(v) => Ok(ToSqlOutput::Owned(Value::Real(*v))),
            Self::Text(v) => Ok(ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes()))),
            Self::Blob(v) => Ok(ToSqlOutput::Borrowed(ValueRef::Blob(v))),
            Self::Json(v) => json_text(serde_json::to_string(v)),
            Self::TextArray(v) => json_text(serde_json::to_string(v)),
            Self::IntegerArray(v) => json_text(serde_json::to_string(v)),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<Vec<String>> for SqlValue {
    fn from(v: Vec<String>) -> Self {
        Self::TextArray(v)
    }
}

impl From<Vec<i64>> for SqlValue {
    fn from(v: Vec<i64>) -> Self {
        Self::IntegerArray(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A statement template.
///
/// Placeholders:
/// - `?` positional parameters, bound in order;
/// - `#{name}` named parameters, rewritten to `?`;
/// - `${name}` variables, replaced by a quoted identifier;
/// - `${{name}}` fragments, replaced by another `SqlQuery`.
///
/// Named and positional parameters cannot be mixed in one statement, and a
/// fragment may only carry named parameters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SqlQuery {
    text: String,
    parameters: Vec<SqlValue>,
    named: BTreeMap<String, SqlValue>,
    variables: BTreeMap<String, String>,
    fragments: BTreeMap<String, SqlQuery>,
    query_id: Option<String>,
    timeout: Option<Duration>,
    max_retries: Option<u32>,
}

/// Output of [`SqlQuery::substitute`]: plain SQL with positional parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedSql {
    pub text: String,
    pub parameters: Vec<SqlValue>,
}

impl SqlQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.parameters.push(value.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    pub fn variable(mut self, name: impl Into<String>, identifier: impl Into<String>) -> Self {
        self.variables.insert(name.into(), identifier.into());
        self
    }

    pub fn fragment(mut self, name: impl Into<String>, fragment: SqlQuery) -> Self {
        self.fragments.insert(name.into(), fragment);
        self
    }

    pub fn with_query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn query_id(&self) -> Option<&str> {
        self.query_id.as_deref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    /// Joins statements or fragments, optionally wrapping each in brackets.
    /// Parameters of every part are carried over in order.
    pub fn join(queries: impl IntoIterator<Item = SqlQuery>, delimiter: &str, enclose: bool) -> Self {
        let mut out = SqlQuery::default();
        for (index, query) in queries.into_iter().enumerate() {
            if index > 0 {
                out.text.push_str(delimiter);
            }
            if enclose {
                out.text.push('(');
            }
            out.text.push_str(&query.text);
            if enclose {
                out.text.push(')');
            }
            out.parameters.extend(query.parameters);
            out.named.extend(query.named);
            out.variables.extend(query.variables);
            out.fragments.extend(query.fragments);
        }
        out
    }

    /// Expands variables, then fragments, then rewrites named parameters.
    pub fn substitute(&self) -> Result<PreparedSql, StoreError> {
        let (text, named) = self.expand_templates()?;
        let tokens = scan(&text)?;
        let has_named = tokens.iter().any(|t| matches!(t, Token::Named(_)));
        if !has_named {
            return Ok(PreparedSql {
                text,
                parameters: self.parameters.clone(),
            });
        }
        if !self.parameters.is_empty() || has_positional_marker(&tokens) {
            return Err(StoreError::InvalidStatement(
                "named and positional parameters cannot be mixed".to_string(),
            ));
        }

        let mut sql = String::with_capacity(text.len());
        let mut parameters = Vec::new();
        for token in tokens {
            match token {
                Token::Text(chunk) => sql.push_str(chunk),
                Token::Named(name) => {
                    let value = named.get(name).ok_or_else(|| {
                        StoreError::InvalidStatement(format!("missing named parameter #{{{name}}}"))
                    })?;
                    sql.push('?');
                    parameters.push(value.clone());
                }
                Token::Variable(name) | Token::Fragment(name) => {
                    return Err(StoreError::InvalidStatement(format!(
                        "unexpanded placeholder {name}"
                    )));
                }
            }
        }
        Ok(PreparedSql {
            text: sql,
            parameters,
        })
    }

    /// Variables and fragments expanded; `#{name}` left in place.
    fn expand_templates(&self) -> Result<(String, BTreeMap<String, SqlValue>), StoreError> {
        let mut named = self.named.clone();
        let mut out = String::with_capacity(self.text.len());
        for token in scan(&self.text)? {
            match token {
                Token::Text(chunk) => out.push_str(chunk),
                Token::Named(name) => {
                    out.push_str("#{");
                    out.push_str(name);
                    out.push('}');
                }
                Token::Variable(name) => {
                    let identifier = self.variables.get(name).ok_or_else(|| {
                        StoreError::InvalidStatement(format!("missing variable ${{{name}}}"))
                    })?;
                    out.push_str(&quote_identifier(identifier)?);
                }
                Token::Fragment(name) => {
                    let fragment = self.fragments.get(name).ok_or_else(|| {
                        StoreError::InvalidStatement(format!("missing fragment ${{{{{name}}}}}"))
                    })?;
                    if !fragment.parameters.is_empty() {
                        return Err(StoreError::InvalidStatement(format!(
                            "fragment {name} uses positional parameters"
                        )));
                    }
                    let (text, fragment_named) = fragment.expand_templates()?;
                    for (key, value) in fragment_named {
                        match named.get(&key) {
                            Some(existing) if existing != &value => {
                                return Err(StoreError::InvalidStatement(format!(
                                    "named parameter {key} is bound to different values"
                                )));
                            }
                            Some(_) => {}
                            None => {
                                named.insert(key, value);
                            }
                        }
                    }
                    out.push_str(&text);
                }
            }
        }
        Ok((out, named))
    }

    /// Runs the statement on `conn` without the retry machinery.
    pub fn execute_on(&self, conn: &Connection) -> Result<usize, StoreError> {
        let prepared = self.substitute()?;
        tracing::debug!(sql = %prepared.text, params = prepared.parameters.len(), "execute");
        let mut stmt = conn.prepare_cached(&prepared.text)?;
        Ok(stmt.execute(params_from_iter(prepared.parameters.iter()))?)
    }

    pub fn query_on<T, F>(&self, conn: &Connection, mut map: F) -> Result<Vec<T>, StoreError>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let prepared = self.substitute()?;
        tracing::debug!(sql = %prepared.text, params = prepared.parameters.len(), "query");
        let mut stmt = conn.prepare_cached(&prepared.text)?;
        let rows = stmt.query_map(params_from_iter(prepared.parameters.iter()), |row| map(row))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn quote_identifier(identifier: &str) -> Result<String, StoreError> {
    if identifier.is_empty() || identifier.contains(['{', '}', '\0']) {
        return Err(StoreError::InvalidStatement(format!(
            "invalid identifier {identifier:?}"
        )));
    }
    Ok(format!("\"{}\"", identifier.replace('"', "\"\"")))
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Text(&'a str),
    Variable(&'a str),
    Fragment(&'a str),
    Named(&'a str),
}

fn scan(text: &str) -> Result<Vec<Token<'_>>, StoreError> {
    let mut tokens = Vec::new();
    let mut literal_start = 0;
    let mut pos = 0;
    while pos < text.len() {
        let rest = &text[pos..];
        let (open, close): (&str, &str) = if rest.starts_with("${{") {
            ("${{", "}}")
        } else if rest.starts_with("${") {
            ("${", "}")
        } else if rest.starts_with("#{") {
            ("#{", "}")
        } else {
            pos += rest.chars().next().map_or(1, char::len_utf8);
            continue;
        };

        let body = &rest[open.len()..];
        let end = body.find(close).ok_or_else(|| {
            StoreError::InvalidStatement(format!("unterminated placeholder at byte {pos}"))
        })?;
        let name = &body[..end];
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::InvalidStatement(format!(
                "invalid placeholder name {name:?}"
            )));
        }
        if literal_start < pos {
            tokens.push(Token::Text(&text[literal_start..pos]));
        }
        tokens.push(match open {
            "${{" => Token::Fragment(name),
            "${" => Token::Variable(name),
            _ => Token::Named(name),
        });
        pos += open.len() + end + close.len();
        literal_start = pos;
    }
    if literal_start < text.len() {
        tokens.push(Token::Text(&text[literal_start..]));
    }
    Ok(tokens)
}

/// A `?` outside quoted literals and identifiers in the plain-text chunks.
fn has_positional_marker(tokens: &[Token<'_>]) -> bool {
    let mut quote: Option<char> = None;
    for token in tokens {
        let Token::Text(chunk) = token else {
            continue;
        };
        for c in chunk.chars() {
            match quote {
                Some(open) if c == open => quote = None,
                Some(_) => {}
                None if matches!(c, '\'' | '"') => quote = Some(c),
                None if c == '?' => return true,
                None => {}
            }
        }
    }
    false
}

/// Statements run in one transaction, optionally under an advisory lock.
#[derive(Clone, Debug, Default)]
pub struct SqlBatch {
    statements: Vec<SqlQuery>,
    lock: Option<String>,
    query_id: Option<String>,
    timeout: Option<Duration>,
    max_retries: Option<u32>,
}

impl SqlBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, statement: SqlQuery) -> Self {
        self.statements.push(statement);
        self
    }

    pub fn with_lock(mut self, name: impl Into<String>) -> Self {
        self.lock = Some(name.into());
        self
    }

    pub fn with_query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn statements(&self) -> &[SqlQuery] {
        &self.statements
    }

    pub fn lock(&self) -> Option<&str> {
        self.lock.as_deref()
    }

    pub fn query_id(&self) -> Option<&str> {
        self.query_id.as_deref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}
