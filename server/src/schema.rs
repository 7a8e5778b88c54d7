//! Input schemas for procedures.
//!
//! A [`Schema`] is checked against the caller's JSON input before a resolver
//! runs. Errors name the offending location, rooted at `input`.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Any,
    Null,
    Bool,
    Number,
    Integer,
    String,
    /// A string restricted to the listed literals.
    OneOf(Vec<String>),
    Array(Box<Schema>),
    Object(Vec<Field>),
    /// `null` or the inner schema.
    Optional(Box<Schema>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
    pub required: bool,
}

impl Schema {
    pub fn object() -> Self {
        Schema::Object(Vec::new())
    }

    pub fn array(item: Schema) -> Self {
        Schema::Array(Box::new(item))
    }

    pub fn optional(inner: Schema) -> Self {
        Schema::Optional(Box::new(inner))
    }

    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Schema::OneOf(values.into_iter().map(Into::into).collect())
    }

    /// Adds a required field. Only meaningful on [`Schema::Object`].
    pub fn field(self, name: &str, schema: Schema) -> Self {
        self.push_field(name, schema, true)
    }

    /// Adds a field that may be absent or `null`.
    pub fn optional_field(self, name: &str, schema: Schema) -> Self {
        self.push_field(name, schema, false)
    }

    fn push_field(self, name: &str, schema: Schema, required: bool) -> Self {
        match self {
            Schema::Object(mut fields) => {
                fields.push(Field {
                    name: name.to_string(),
                    schema,
                    required,
                });
                Schema::Object(fields)
            }
            other => other,
        }
    }

    pub fn validate(&self, value: &Value) -> Result<(), String> {
        self.check(value, "input")
    }

    fn check(&self, value: &Value, at: &str) -> Result<(), String> {
        match (self, value) {
            (Schema::Any, _) => Ok(()),
            (Schema::Null, Value::Null) => Ok(()),
            (Schema::Bool, Value::Bool(_)) => Ok(()),
            (Schema::Number, Value::Number(_)) => Ok(()),
            (Schema::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(()),
            (Schema::String, Value::String(_)) => Ok(()),
            (Schema::OneOf(allowed), Value::String(s)) => {
                if allowed.iter().any(|a| a == s) {
                    Ok(())
                } else {
                    Err(format!(
                        "{}: expected one of [{}], got \"{}\"",
                        at,
                        allowed.join(", "),
                        s
                    ))
                }
            }
            (Schema::Optional(_), Value::Null) => Ok(()),
            (Schema::Optional(inner), other) => inner.check(other, at),
            (Schema::Array(item), Value::Array(items)) => {
                for (i, element) in items.iter().enumerate() {
                    item.check(element, &format!("{}[{}]", at, i))?;
                }
                Ok(())
            }
            (Schema::Object(fields), Value::Object(map)) => {
                for field in fields {
                    let location = format!("{}.{}", at, field.name);
                    match map.get(&field.name) {
                        None | Some(Value::Null) if !field.required => {}
                        None => return Err(format!("{}: missing required field", location)),
                        Some(v) => field.schema.check(v, &location)?,
                    }
                }
                Ok(())
            }
            (expected, got) => Err(format!(
                "{}: expected {}, got {}",
                at,
                expected.describe(),
                describe_value(got)
            )),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Schema::Any => "anything",
            Schema::Null => "null",
            Schema::Bool => "boolean",
            Schema::Number => "number",
            Schema::Integer => "integer",
            Schema::String | Schema::OneOf(_) => "string",
            Schema::Array(_) => "array",
            Schema::Object(_) => "object",
            Schema::Optional(_) => "optional value",
        }
    }
}

fn describe_value(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn viewpoint_schema() -> Schema {
        Schema::object()
            .field("viewpoint", Schema::String)
            .optional_field("simulation", Schema::String)
    }

    #[test]
    fn test_any_accepts_everything() {
        for value in [json!(null), json!(1), json!("x"), json!([1]), json!({})] {
            assert!(Schema::Any.validate(&value).is_ok());
        }
    }

    #[test]
    fn test_object_with_required_and_optional() {
        let schema = viewpoint_schema();
        assert!(schema.validate(&json!({"viewpoint": "station-1"})).is_ok());
        assert!(schema
            .validate(&json!({"viewpoint": "station-1", "simulation": null}))
            .is_ok());
        assert!(schema
            .validate(&json!({"viewpoint": "station-1", "simulation": "sol"}))
            .is_ok());
    }

    #[test]
    fn test_missing_required_field_names_location() {
        let err = viewpoint_schema().validate(&json!({})).unwrap_err();
        assert_eq!(err, "input.viewpoint: missing required field");
    }

    #[test]
    fn test_wrong_type_names_location() {
        let err = viewpoint_schema()
            .validate(&json!({"viewpoint": 4}))
            .unwrap_err();
        assert_eq!(err, "input.viewpoint: expected string, got number");
    }

    #[test]
    fn test_integer_rejects_fraction() {
        assert!(Schema::Integer.validate(&json!(3)).is_ok());
        assert!(Schema::Integer.validate(&json!(3.5)).is_err());
    }

    #[test]
    fn test_array_reports_index() {
        let schema = Schema::array(Schema::String);
        let err = schema.validate(&json!(["a", 2])).unwrap_err();
        assert_eq!(err, "input[1]: expected string, got number");
    }

    #[test]
    fn test_one_of_literals() {
        let schema = Schema::one_of(["sol", "vega"]);
        assert!(schema.validate(&json!("sol")).is_ok());
        let err = schema.validate(&json!("andromeda")).unwrap_err();
        assert!(err.contains("expected one of [sol, vega]"));
    }

    #[test]
    fn test_optional_top_level() {
        let schema = Schema::optional(Schema::object().field("id", Schema::String));
        assert!(schema.validate(&json!(null)).is_ok());
        assert!(schema.validate(&json!({"id": "a"})).is_ok());
        assert!(schema.validate(&json!({"id": 1})).is_err());
    }
}
