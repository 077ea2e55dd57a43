//! SQL text and parameter rendering for every CRUD shape.
//!
//! The builder never touches a connection. Identifiers go through the
//! provider's quoting and parameters through its parameter factory, so one
//! builder renders correctly for any backend.
//!
//! Placeholder names are positional: conditions are `condition{i}`, inserted
//! and assigned values are `value{i}`. The same call shape therefore always
//! yields the same placeholder sequence, which is what lets a batch reuse one
//! parameter set while only the values change.

use std::borrow::Cow;
use std::sync::Arc;

use crate::error::{CommanderError, Result};
use crate::provider::Provider;
use crate::value::{coerce, DbType, Value};

const CONDITION: &str = "condition";
const VALUE: &str = "value";

/// A named, typed statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub db_type: Option<DbType>,
    pub value: Value,
}

impl Parameter {
    /// Parameter typed after its value (untyped when NULL).
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        Self {
            name: name.into(),
            db_type: value.db_type(),
            value,
        }
    }

    pub fn typed(name: impl Into<String>, db_type: DbType, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            db_type: Some(db_type),
            value: value.into(),
        }
    }

    /// The value to hand the backend, converted to `db_type` when it carries
    /// a different tag.
    pub fn bound_value(&self) -> Result<Cow<'_, Value>> {
        self.bind(&self.value)
    }

    /// `value` converted to this parameter's type, for rebinding batch rows.
    pub fn bind<'v>(&self, value: &'v Value) -> Result<Cow<'v, Value>> {
        match self.db_type {
            Some(tag) if !value.is_null() && value.db_type() != Some(tag) => {
                Ok(Cow::Owned(coerce(value.clone(), tag)?))
            }
            _ => Ok(Cow::Borrowed(value)),
        }
    }
}

/// Rendered statement text plus its ordered parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub parameters: Vec<Parameter>,
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<Parameter>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Same text and parameter names, new values in parameter order.
    pub fn rebind(&self, values: &[Value]) -> Result<Statement> {
        if values.len() != self.parameters.len() {
            return Err(CommanderError::arity(
                "parameter values",
                self.parameters.len(),
                values.len(),
            ));
        }
        let parameters = self
            .parameters
            .iter()
            .zip(values)
            .map(|(p, v)| Parameter {
                name: p.name.clone(),
                db_type: p.db_type.or_else(|| v.db_type()),
                value: v.clone(),
            })
            .collect();
        Ok(Statement {
            text: self.text.clone(),
            parameters,
        })
    }
}

/// One statement text executed once per row with rebound values.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStatement {
    pub text: String,
    /// Parameter names and types; values are NULL placeholders.
    pub parameters: Vec<Parameter>,
    pub rows: Vec<Vec<Value>>,
}

impl BatchStatement {
    /// The statement for one row.
    pub fn row_statement(&self, row: usize) -> Result<Statement> {
        let values = self.rows.get(row).ok_or(CommanderError::RowOutOfRange {
            table: String::new(),
            row,
        })?;
        Statement::new(self.text.clone())
            .with_parameters(self.parameters.clone())
            .rebind(values)
    }
}

/// What a SELECT returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// `*`
    All,
    Fields(Vec<String>),
    /// A single scalar column.
    Field(String),
    /// `1`, for existence checks.
    One,
    /// `COUNT(1)`
    Count,
    Max(String),
}

impl Projection {
    pub fn fields<S: AsRef<str>>(fields: &[S]) -> Self {
        Projection::Fields(fields.iter().map(|f| f.as_ref().to_string()).collect())
    }
}

/// Row selection for select/update/delete/count/exists.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    /// No WHERE clause.
    #[default]
    All,
    /// Equality conditions ANDed together, as parallel name/value lists.
    Equals {
        fields: Vec<String>,
        values: Vec<Value>,
    },
    /// `field IN (...)`, one parameter per value.
    In { field: String, values: Vec<Value> },
    /// Caller-written condition with caller-named parameters.
    Raw {
        clause: String,
        parameters: Vec<Parameter>,
    },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Equals {
            fields: vec![field.into()],
            values: vec![value.into()],
        }
    }

    /// Parallel condition arrays. Lengths are checked when rendered.
    pub fn all_of<S: AsRef<str>>(fields: &[S], values: &[Value]) -> Self {
        Filter::Equals {
            fields: fields.iter().map(|f| f.as_ref().to_string()).collect(),
            values: values.to_vec(),
        }
    }

    /// Conditions from a name→value mapping, in iteration order.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let (fields, values) = pairs
            .into_iter()
            .map(|(k, v)| -> (String, Value) { (k.into(), v.into()) })
            .unzip();
        Filter::Equals { fields, values }
    }

    pub fn any_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In {
            field: field.into(),
            values,
        }
    }

    pub fn raw(clause: impl Into<String>, parameters: Vec<Parameter>) -> Self {
        Filter::Raw {
            clause: clause.into(),
            parameters,
        }
    }

    /// True when the filter selects every row.
    pub fn is_all(&self) -> bool {
        match self {
            Filter::All => true,
            Filter::Equals { fields, values } => fields.is_empty() && values.is_empty(),
            Filter::Raw { clause, .. } => clause.trim().is_empty(),
            Filter::In { .. } => false,
        }
    }

    pub fn check_arity(&self) -> Result<()> {
        if let Filter::Equals { fields, values } = self {
            if fields.len() != values.len() {
                return Err(CommanderError::arity(
                    "condition values",
                    fields.len(),
                    values.len(),
                ));
            }
        }
        Ok(())
    }

    /// Column→value pairs of an equality filter.
    pub fn pairs(&self) -> Vec<(&str, &Value)> {
        match self {
            Filter::Equals { fields, values } => fields
                .iter()
                .map(String::as_str)
                .zip(values.iter())
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn check_pairs(what: &'static str, fields: usize, values: usize) -> Result<()> {
    if fields != values {
        return Err(CommanderError::arity(what, fields, values));
    }
    Ok(())
}

/// Renders statements for one provider.
#[derive(Clone)]
pub struct StatementBuilder {
    provider: Arc<dyn Provider>,
}

impl std::fmt::Debug for StatementBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementBuilder")
            .field("provider", &self.provider.name())
            .finish()
    }
}

impl StatementBuilder {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    pub fn quote(&self, identifier: &str) -> Result<String> {
        self.provider.quote_identifier(identifier)
    }

    fn quote_list<S: AsRef<str>>(&self, identifiers: &[S], sep: &str) -> Result<String> {
        let quoted = identifiers
            .iter()
            .map(|i| self.quote(i.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(quoted.join(sep))
    }

    fn parameter(&self, base: &str, index: usize, value: Value) -> Parameter {
        self.provider
            .create_parameter(&format!("{}{}", base, index), value)
    }

    /// Placeholder names for `count` positions of `base` (e.g. `@value0..`).
    pub fn parameter_names(&self, base: &str, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| self.parameter(base, i, Value::Null).name)
            .collect()
    }

    fn projection(&self, projection: &Projection) -> Result<String> {
        Ok(match projection {
            Projection::All => "*".to_string(),
            Projection::Fields(fields) if fields.is_empty() => "*".to_string(),
            Projection::Fields(fields) => self.quote_list(fields, ", ")?,
            Projection::Field(field) => self.quote(field)?,
            Projection::One => "1".to_string(),
            Projection::Count => "COUNT(1)".to_string(),
            Projection::Max(field) => format!("MAX({})", self.quote(field)?),
        })
    }

    /// WHERE body for `filter`, appending its parameters; `None` for no clause.
    fn condition(&self, filter: &Filter, params: &mut Vec<Parameter>) -> Result<Option<String>> {
        filter.check_arity()?;
        if filter.is_all() {
            return Ok(None);
        }

        let clause = match filter {
            Filter::All => return Ok(None),
            Filter::Equals { fields, values } => {
                let mut parts = Vec::with_capacity(fields.len());
                for (i, (field, value)) in fields.iter().zip(values).enumerate() {
                    let param = self.parameter(CONDITION, i, value.clone());
                    parts.push(format!("{} = {}", self.quote(field)?, param.name));
                    params.push(param);
                }
                parts.join(" AND ")
            }
            Filter::In { values, .. } if values.is_empty() => "1 = 0".to_string(),
            Filter::In { field, values } => {
                let mut names = Vec::with_capacity(values.len());
                for (i, value) in values.iter().enumerate() {
                    let param = self.parameter(CONDITION, i, value.clone());
                    names.push(param.name.clone());
                    params.push(param);
                }
                format!("{} IN ({})", self.quote(field)?, names.join(", "))
            }
            Filter::Raw { clause, parameters } => {
                params.extend(parameters.iter().cloned());
                clause.clone()
            }
        };
        Ok(Some(clause))
    }

    fn with_where(text: String, condition: Option<String>) -> String {
        match condition {
            Some(condition) => format!("{} WHERE {}", text, condition),
            None => text,
        }
    }

    /// `SELECT <projection> FROM <table> [WHERE ...]`
    pub fn select(&self, table: &str, projection: &Projection, filter: &Filter) -> Result<Statement> {
        let mut params = Vec::new();
        let condition = self.condition(filter, &mut params)?;
        let text = format!(
            "SELECT {} FROM {}",
            self.projection(projection)?,
            self.quote(table)?
        );
        Ok(Statement::new(Self::with_where(text, condition)).with_parameters(params))
    }

    /// Single-row INSERT.
    pub fn insert<S: AsRef<str>>(&self, table: &str, fields: &[S], values: &[Value]) -> Result<Statement> {
        check_pairs("insert values", fields.len(), values.len())?;
        let params: Vec<Parameter> = values
            .iter()
            .enumerate()
            .map(|(i, v)| self.parameter(VALUE, i, v.clone()))
            .collect();
        let text = self.insert_text(table, fields, &params)?;
        Ok(Statement::new(text).with_parameters(params))
    }

    fn insert_text<S: AsRef<str>>(&self, table: &str, fields: &[S], params: &[Parameter]) -> Result<String> {
        let placeholders: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote(table)?,
            self.quote_list(fields, ", ")?,
            placeholders.join(", ")
        ))
    }

    /// INSERT rendered once for a homogeneous batch of rows.
    ///
    /// Parameter types come from the first non-null value of each column.
    pub fn insert_batch<S: AsRef<str>>(
        &self,
        table: &str,
        fields: &[S],
        rows: &[Vec<Value>],
    ) -> Result<BatchStatement> {
        for row in rows {
            check_pairs("row values", fields.len(), row.len())?;
        }

        let params: Vec<Parameter> = (0..fields.len())
            .map(|i| {
                let sample = rows
                    .iter()
                    .map(|row| &row[i])
                    .find(|v| !v.is_null())
                    .cloned()
                    .unwrap_or_default();
                let mut param = self.parameter(VALUE, i, sample);
                param.value = Value::Null;
                param
            })
            .collect();

        Ok(BatchStatement {
            text: self.insert_text(table, fields, &params)?,
            parameters: params,
            rows: rows.to_vec(),
        })
    }

    /// `UPDATE <table> SET ... [WHERE ...]`
    pub fn update<S: AsRef<str>>(
        &self,
        table: &str,
        fields: &[S],
        values: &[Value],
        filter: &Filter,
    ) -> Result<Statement> {
        check_pairs("update values", fields.len(), values.len())?;
        filter.check_arity()?;

        let mut params = Vec::with_capacity(values.len());
        let mut assignments = Vec::with_capacity(fields.len());
        for (i, (field, value)) in fields.iter().zip(values).enumerate() {
            let param = self.parameter(VALUE, i, value.clone());
            assignments.push(format!("{} = {}", self.quote(field.as_ref())?, param.name));
            params.push(param);
        }

        let condition = self.condition(filter, &mut params)?;
        let text = format!("UPDATE {} SET {}", self.quote(table)?, assignments.join(", "));
        Ok(Statement::new(Self::with_where(text, condition)).with_parameters(params))
    }

    /// `DELETE FROM <table> [WHERE ...]`; `Filter::All` deletes every row.
    pub fn delete(&self, table: &str, filter: &Filter) -> Result<Statement> {
        let mut params = Vec::new();
        let condition = self.condition(filter, &mut params)?;
        let text = format!("DELETE FROM {}", self.quote(table)?);
        Ok(Statement::new(Self::with_where(text, condition)).with_parameters(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteProvider;

    fn builder() -> StatementBuilder {
        StatementBuilder::new(Arc::new(SqliteProvider::new()))
    }

    fn names(stmt: &Statement) -> Vec<&str> {
        stmt.parameters.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_select_shapes() {
        let b = builder();
        let stmt = b.select("users", &Projection::All, &Filter::All).unwrap();
        assert_eq!(stmt.text, r#"SELECT * FROM "users""#);
        assert!(stmt.parameters.is_empty());

        let stmt = b
            .select("users", &Projection::fields(&["id", "name"]), &Filter::eq("id", 7i64))
            .unwrap();
        assert_eq!(
            stmt.text,
            r#"SELECT "id", "name" FROM "users" WHERE "id" = @condition0"#
        );
        assert_eq!(stmt.parameters[0].value, Value::I64(7));
        assert_eq!(stmt.parameters[0].db_type, Some(DbType::Int64));

        let filter = Filter::all_of(&["a", "b"], &[Value::I32(1), "x".into()]);
        let stmt = b.select("t", &Projection::Count, &filter).unwrap();
        assert_eq!(
            stmt.text,
            r#"SELECT COUNT(1) FROM "t" WHERE "a" = @condition0 AND "b" = @condition1"#
        );
    }

    #[test]
    fn test_in_list_names_every_value() {
        let b = builder();
        let filter = Filter::any_of("id", vec![Value::I32(1), Value::I32(2), Value::I32(3)]);
        let stmt = b.select("t", &Projection::One, &filter).unwrap();
        assert_eq!(
            stmt.text,
            r#"SELECT 1 FROM "t" WHERE "id" IN (@condition0, @condition1, @condition2)"#
        );
        assert_eq!(names(&stmt), vec!["@condition0", "@condition1", "@condition2"]);

        let empty = b.delete("t", &Filter::any_of("id", Vec::new())).unwrap();
        assert_eq!(empty.text, r#"DELETE FROM "t" WHERE 1 = 0"#);
    }

    #[test]
    fn test_same_shape_same_placeholders() {
        let b = builder();
        let first = b.insert("t", &["id", "name"], &[Value::I32(1), "a".into()]).unwrap();
        let second = b.insert("t", &["id", "name"], &[Value::I32(2), "b".into()]).unwrap();
        assert_eq!(first.text, second.text);
        assert_eq!(names(&first), names(&second));
        assert_eq!(
            first.text,
            r#"INSERT INTO "t" ("id", "name") VALUES (@value0, @value1)"#
        );
    }

    #[test]
    fn test_update_sets_then_conditions() {
        let b = builder();
        let filter = Filter::all_of(&["k1", "k2"], &[Value::I32(1), Value::I32(2)]);
        let stmt = b
            .update("t", &["name", "age"], &["z".into(), Value::I32(40)], &filter)
            .unwrap();
        assert_eq!(
            stmt.text,
            r#"UPDATE "t" SET "name" = @value0, "age" = @value1 WHERE "k1" = @condition0 AND "k2" = @condition1"#
        );
        assert_eq!(
            names(&stmt),
            vec!["@value0", "@value1", "@condition0", "@condition1"]
        );
    }

    #[test]
    fn test_delete_shapes() {
        let b = builder();
        assert_eq!(b.delete("t", &Filter::All).unwrap().text, r#"DELETE FROM "t""#);
        let stmt = b
            .delete("t", &Filter::raw("age > @min", vec![Parameter::new("@min", 18i32)]))
            .unwrap();
        assert_eq!(stmt.text, r#"DELETE FROM "t" WHERE age > @min"#);
        assert_eq!(names(&stmt), vec!["@min"]);
    }

    #[test]
    fn test_arity_mismatch_is_rejected() {
        let b = builder();
        let bad = Filter::all_of(&["a", "b"], &[Value::I32(1)]);
        for result in [
            b.select("t", &Projection::All, &bad),
            b.delete("t", &bad),
            b.update("t", &["x"], &[Value::I32(1)], &bad),
            b.insert("t", &["x", "y"], &[Value::I32(1)]),
            b.update("t", &["x", "y"], &[Value::I32(1)], &Filter::All),
        ] {
            assert!(matches!(result, Err(CommanderError::ArityMismatch { .. })));
        }
        let rows = vec![vec![Value::I32(1), Value::I32(2)], vec![Value::I32(3)]];
        assert!(matches!(
            b.insert_batch("t", &["a", "b"], &rows),
            Err(CommanderError::ArityMismatch { .. })
        ));
    }

    #[test]
    fn test_batch_types_from_first_non_null() {
        let b = builder();
        let rows = vec![
            vec![Value::I64(1), Value::Null],
            vec![Value::I64(2), "two".into()],
        ];
        let batch = b.insert_batch("t", &["id", "name"], &rows).unwrap();
        assert_eq!(batch.parameters[0].db_type, Some(DbType::Int64));
        assert_eq!(batch.parameters[1].db_type, Some(DbType::Text));
        assert!(batch.parameters.iter().all(|p| p.value.is_null()));

        let second = batch.row_statement(1).unwrap();
        assert_eq!(second.parameters[1].value, Value::from("two"));
        assert_eq!(second.text, batch.text);
    }

    #[test]
    fn test_bound_value_follows_parameter_type() {
        let id = uuid::Uuid::from_u128(7);
        let typed = Parameter::typed("@id", DbType::Uuid, id.to_string());
        assert_eq!(typed.bound_value().unwrap().into_owned(), Value::Uuid(id));

        let plain = Parameter::new("@n", 3i32);
        assert!(matches!(plain.bound_value().unwrap(), Cow::Borrowed(Value::I32(3))));
        assert_eq!(
            Parameter::typed("@n", DbType::Int64, Value::Null).bound_value().unwrap().into_owned(),
            Value::Null
        );

        let wide = Parameter::typed("@n", DbType::Int64, Value::Null);
        assert_eq!(wide.bind(&Value::I32(5)).unwrap().into_owned(), Value::I64(5));

        let err = Parameter::typed("@n", DbType::Int32, "twelve").bound_value().unwrap_err();
        assert!(matches!(err, CommanderError::UnsupportedType { target: DbType::Int32, .. }));
    }

    #[test]
    fn test_rebind_checks_arity() {
        let b = builder();
        let stmt = b.insert("t", &["id"], &[Value::I32(1)]).unwrap();
        assert!(stmt.rebind(&[]).is_err());
        let again = stmt.rebind(&[Value::I32(5)]).unwrap();
        assert_eq!(again.parameters[0].value, Value::I32(5));
    }

    #[test]
    fn test_filter_from_pairs_and_all() {
        let filter = Filter::from_pairs(vec![("a", Value::I32(1)), ("b", Value::I32(2))]);
        assert_eq!(filter.pairs(), vec![("a", &Value::I32(1)), ("b", &Value::I32(2))]);
        assert!(Filter::from_pairs(Vec::<(String, Value)>::new()).is_all());
        assert!(!Filter::any_of("x", Vec::new()).is_all());
    }
}
