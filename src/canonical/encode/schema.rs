use serde_json::{Map, Value};

const ALLOWED_SCHEMA_KEYS: &[&str] = &[
    "type",
    "properties",
    "required",
    "additionalProperties",
    "items",
    "enum",
    "const",
    "description",
    "default",
    "anyOf",
    "oneOf",
    "$ref",
    "$schema",
    "title",
    "nullable",
];

type ConstraintFormatter = fn(&Value) -> Option<String>;

// Order matters: notes are appended to the description in this order.
const CONSTRAINT_FORMATTERS: &[(&str, ConstraintFormatter)] = &[
    ("format", |v| Some(format!("Format: {}", render(v)))),
    ("pattern", |v| Some(format!("Pattern: {}", render(v)))),
    ("minLength", |v| Some(format!("Min length: {}", render(v)))),
    ("maxLength", |v| Some(format!("Max length: {}", render(v)))),
    ("minimum", |v| Some(format!("Minimum: {}", render(v)))),
    ("maximum", |v| Some(format!("Maximum: {}", render(v)))),
    ("exclusiveMinimum", |v| Some(format!("Must be > {}", render(v)))),
    ("exclusiveMaximum", |v| Some(format!("Must be < {}", render(v)))),
    ("minItems", |v| Some(format!("Min items: {}", render(v)))),
    ("maxItems", |v| Some(format!("Max items: {}", render(v)))),
    ("multipleOf", |v| Some(format!("Multiple of: {}", render(v)))),
    ("propertyNames", |v| match v.get("type") {
        Some(t) if is_truthy(t) => Some(format!("Property names must be {}", render(t))),
        _ => Some("Has property name constraints".to_string()),
    }),
    ("uniqueItems", |v| {
        is_truthy(v).then(|| "Items must be unique".to_string())
    }),
];

fn render(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Rewrites a tool parameter schema into the strict form: every property is
/// required, optional properties become nullable, undeclared properties are
/// forbidden, and constraint keywords the strict form cannot carry are folded
/// into `description`.
pub fn strictify(schema: &Value) -> Value {
    match schema {
        Value::Object(obj) => Value::Object(strictify_object(obj)),
        Value::Array(items) => Value::Array(items.iter().map(strictify).collect()),
        other => other.clone(),
    }
}

fn strictify_object(schema: &Map<String, Value>) -> Map<String, Value> {
    let notes = constraint_notes(schema);
    let existing_required: Vec<&str> = schema
        .get("required")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    let has_properties = schema.get("properties").is_some_and(|v| v.is_object());

    let mut result = Map::new();
    for (key, value) in schema {
        if !ALLOWED_SCHEMA_KEYS.contains(&key.as_str()) {
            continue;
        }
        match key.as_str() {
            "properties" => {
                let Some(props) = value.as_object() else {
                    result.insert(key.clone(), value.clone());
                    continue;
                };
                let mut strict_props = Map::new();
                for (name, prop) in props {
                    let mut prop = strictify(prop);
                    if !existing_required.contains(&name.as_str()) {
                        widen_with_null(&mut prop);
                    }
                    strict_props.insert(name.clone(), prop);
                }
                let names = props.keys().cloned().map(Value::String).collect();
                result.insert("properties".to_string(), Value::Object(strict_props));
                result.insert("required".to_string(), Value::Array(names));
                result.insert("additionalProperties".to_string(), Value::Bool(false));
            }
            "required" => {}
            "additionalProperties" if has_properties => {}
            "anyOf" | "oneOf" => {
                let mapped = match value.as_array() {
                    Some(arr) => Value::Array(arr.iter().map(strictify).collect()),
                    None => value.clone(),
                };
                result.insert(key.clone(), mapped);
            }
            "items" => {
                result.insert(key.clone(), strictify(value));
            }
            _ => {
                result.insert(key.clone(), value.clone());
            }
        }
    }

    if !notes.is_empty() {
        let constraint = format!("{}.", notes.join(". "));
        let description = match schema.get("description").and_then(|v| v.as_str()) {
            Some(desc) if !desc.is_empty() => format!("{} ({})", desc, constraint),
            _ => constraint,
        };
        result.insert("description".to_string(), Value::String(description));
    }

    result
}

fn constraint_notes(schema: &Map<String, Value>) -> Vec<String> {
    CONSTRAINT_FORMATTERS
        .iter()
        .filter_map(|(key, formatter)| schema.get(*key).and_then(formatter))
        .collect()
}

fn widen_with_null(prop: &mut Value) {
    let Some(obj) = prop.as_object_mut() else {
        return;
    };
    let Some(current) = obj.get("type") else {
        return;
    };
    if !is_truthy(current) {
        return;
    }
    let widened = match current {
        Value::Array(types) => {
            let mut types = types.clone();
            if !types.iter().any(|t| t.as_str() == Some("null")) {
                types.push(Value::String("null".to_string()));
            }
            Value::Array(types)
        }
        other => Value::Array(vec![other.clone(), Value::String("null".to_string())]),
    };
    obj.insert("type".to_string(), widened);
}

/// Removes every `cache_control` key at every nesting level.
pub fn strip_cache_control(value: &Value) -> Value {
    match value {
        Value::Object(obj) => Value::Object(
            obj.iter()
                .filter(|(k, _)| k.as_str() != "cache_control")
                .map(|(k, v)| (k.clone(), strip_cache_control(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_cache_control).collect()),
        other => other.clone(),
    }
}
