//! Runtime values for the plan interpreter.
//!
//! Arrays and objects are shared references (mutations through one binding
//! are visible through another, as the source language expects). Everything
//! is `Send` so plan execution can ride an ordinary tokio task; interior
//! mutability goes through mutexes whose guards are never held across an
//! await point.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use crate::ast::Function;

pub type ArrayRef = Arc<Mutex<Vec<Value>>>;
pub type ObjectRef = Arc<Mutex<BTreeMap<String, Value>>>;

/// Built-in callables. Tools go through the host; the rest are pure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Native {
    /// Host tool, asynchronous (search, bash, LLM, MCP imports, …).
    Tool(String),
    /// Bounded-concurrency fan-out primitive.
    Map,
    Chunk,
    Range,
    Flatten,
    GroupBy,
    Log,
    JsonParse,
    JsonStringify,
    MathFn(&'static str),
    ObjectKeys,
    ObjectValues,
    ObjectEntries,
    ArrayIsArray,
    StringCast,
    NumberCast,
    BooleanCast,
    ErrorCtor,
    ParseInt,
    ParseFloat,
    IsNan,
}

impl Native {
    pub fn name(&self) -> &str {
        match self {
            Native::Tool(name) => name,
            Native::Map => "map",
            Native::Chunk => "chunk",
            Native::Range => "range",
            Native::Flatten => "flatten",
            Native::GroupBy => "groupBy",
            Native::Log => "log",
            Native::JsonParse => "JSON.parse",
            Native::JsonStringify => "JSON.stringify",
            Native::MathFn(name) => name,
            Native::ObjectKeys => "Object.keys",
            Native::ObjectValues => "Object.values",
            Native::ObjectEntries => "Object.entries",
            Native::ArrayIsArray => "Array.isArray",
            Native::StringCast => "String",
            Native::NumberCast => "Number",
            Native::BooleanCast => "Boolean",
            Native::ErrorCtor => "Error",
            Native::ParseInt => "parseInt",
            Native::ParseFloat => "parseFloat",
            Native::IsNan => "isNaN",
        }
    }
}

pub struct Closure {
    pub function: Arc<Function>,
    pub scope: Arc<Scope>,
}

#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(ArrayRef),
    Object(ObjectRef),
    Function(Arc<Closure>),
    Native(Native),
}

impl Value {
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(Mutex::new(items)))
    }

    pub fn object(map: BTreeMap<String, Value>) -> Value {
        Value::Object(Arc::new(Mutex::new(map)))
    }

    pub fn str(s: impl Into<String>) -> Value {
        Value::Str(s.into())
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Native(_) => true,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) | Value::Object(_) => "object",
            Value::Function(_) | Value::Native(_) => "function",
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
            Value::Number(n) => *n,
            Value::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
            _ => f64::NAN,
        }
    }

    /// Strict (`===`) equality. `==` in plan code gets the same treatment;
    /// the coercing forms of loose equality are not worth their surprises.
    pub fn strict_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => a == b,
            _ => false,
        }
    }

    /// `String(value)` semantics.
    pub fn to_display(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.clone(),
            Value::Array(items) => {
                let items = match items.lock() {
                    Ok(guard) => guard.clone(),
                    Err(_) => Vec::new(),
                };
                items
                    .iter()
                    .map(|v| match v {
                        Value::Undefined | Value::Null => String::new(),
                        other => other.to_display(),
                    })
                    .collect::<Vec<_>>()
                    .join(",")
            }
            Value::Object(map) => {
                // `Error` objects read as "name: message" like hosts print them.
                if let Ok(guard) = map.lock() {
                    if let (Some(Value::Str(name)), Some(message)) =
                        (guard.get("name"), guard.get("message"))
                    {
                        if name == "Error" || name.ends_with("Error") {
                            return format!("{name}: {}", message.to_display());
                        }
                    }
                }
                "[object Object]".to_string()
            }
            Value::Function(_) => "[function]".to_string(),
            Value::Native(native) => format!("[function {}]", native.name()),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value, String> {
        match self {
            Value::Undefined | Value::Null => Ok(serde_json::Value::Null),
            Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Value::Number(n) => {
                // Whole numbers serialize as JSON integers.
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 9e15 {
                    Ok(serde_json::Value::Number(serde_json::Number::from(
                        *n as i64,
                    )))
                } else {
                    Ok(serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null))
                }
            }
            Value::Str(s) => Ok(serde_json::Value::String(s.clone())),
            Value::Array(items) => {
                let items = items
                    .lock()
                    .map_err(|_| "array is locked".to_string())?
                    .clone();
                items
                    .iter()
                    .map(Value::to_json)
                    .collect::<Result<Vec<_>, _>>()
                    .map(serde_json::Value::Array)
            }
            Value::Object(map) => {
                let map = map
                    .lock()
                    .map_err(|_| "object is locked".to_string())?
                    .clone();
                let mut out = serde_json::Map::new();
                for (key, value) in map.iter() {
                    if matches!(value, Value::Undefined) {
                        continue;
                    }
                    out.insert(key.clone(), value.to_json()?);
                }
                Ok(serde_json::Value::Object(out))
            }
            Value::Function(_) | Value::Native(_) => {
                Err("cannot serialize a function value".to_string())
            }
        }
    }
}

pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Closure({:?})", self.function.name)
    }
}

#[derive(Debug)]
struct Binding {
    value: Value,
    constant: bool,
}

/// Lexical scope chain.
#[derive(Debug)]
pub struct Scope {
    vars: Mutex<HashMap<String, Binding>>,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    pub fn root() -> Arc<Scope> {
        Arc::new(Scope {
            vars: Mutex::new(HashMap::new()),
            parent: None,
        })
    }

    pub fn child(parent: &Arc<Scope>) -> Arc<Scope> {
        Arc::new(Scope {
            vars: Mutex::new(HashMap::new()),
            parent: Some(Arc::clone(parent)),
        })
    }

    pub fn declare(&self, name: &str, value: Value, constant: bool) {
        if let Ok(mut vars) = self.vars.lock() {
            vars.insert(name.to_string(), Binding { value, constant });
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        if let Ok(vars) = self.vars.lock() {
            if let Some(binding) = vars.get(name) {
                return Some(binding.value.clone());
            }
        }
        self.parent.as_ref().and_then(|p| p.get(name))
    }

    pub fn assign(&self, name: &str, value: Value) -> Result<(), String> {
        if let Ok(mut vars) = self.vars.lock() {
            if let Some(binding) = vars.get_mut(name) {
                if binding.constant {
                    return Err(format!("Assignment to constant variable '{name}'"));
                }
                binding.value = value;
                return Ok(());
            }
        }
        match &self.parent {
            Some(parent) => parent.assign(name, value),
            None => Err(format!("'{name}' is not defined")),
        }
    }

    pub fn has(&self, name: &str) -> bool {
        if let Ok(vars) = self.vars.lock() {
            if vars.contains_key(name) {
                return true;
            }
        }
        self.parent.as_ref().is_some_and(|p| p.has(name))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn truthiness_follows_host_language_rules() {
        assert!(!Value::Undefined.truthy());
        assert!(!Value::Null.truthy());
        assert!(!Value::Number(0.0).truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(Value::Str("x".to_string()).truthy());
        assert!(Value::array(vec![]).truthy());
    }

    #[test]
    fn number_display_drops_integral_fraction() {
        assert_eq!(format_number(5.0), "5");
        assert_eq!(format_number(5.25), "5.25");
        assert_eq!(format_number(-3.0), "-3");
    }

    #[test]
    fn json_round_trip() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a": [1, "two", null], "b": true}"#).unwrap();
        let value = Value::from_json(&json);
        assert_eq!(value.to_json().unwrap(), json);
    }

    #[test]
    fn functions_do_not_serialize() {
        assert!(Value::Native(Native::Map).to_json().is_err());
    }

    #[test]
    fn scope_chain_resolves_and_assigns() {
        let root = Scope::root();
        root.declare("a", Value::Number(1.0), false);
        let inner = Scope::child(&root);
        inner.declare("b", Value::Number(2.0), true);

        assert_eq!(inner.get("a").unwrap().to_number(), 1.0);
        inner.assign("a", Value::Number(9.0)).unwrap();
        assert_eq!(root.get("a").unwrap().to_number(), 9.0);

        assert!(inner.assign("b", Value::Number(0.0)).is_err());
        assert!(inner.assign("missing", Value::Null).is_err());
    }

    #[test]
    fn array_references_are_shared() {
        let array = Value::array(vec![Value::Number(1.0)]);
        let alias = array.clone();
        if let Value::Array(items) = &array {
            items.lock().unwrap().push(Value::Number(2.0));
        }
        if let Value::Array(items) = &alias {
            assert_eq!(items.lock().unwrap().len(), 2);
        }
        assert!(array.strict_eq(&alias));
    }
}
