//! Parameter rendering.
//!
//! Template task params may contain text-template placeholders in string
//! leaves. When the parser materializes task instances it renders those
//! leaves against the DAG instance, with the root bindings
//! `{"vars": {name -> {Value: ...}}, "shareData": {key -> value}}`:
//!
//! - `{{.vars.X.Value}}` resolves to the value of instance variable `X`
//! - `{{.shareData.Y}}` resolves to the share-data entry `Y`
//!
//! Only string leaves are rewritten; maps and arrays are walked recursively,
//! and other leaf types pass through untouched. An unresolvable placeholder
//! (unknown root, missing variable or key, or a malformed path) is an error,
//! which fails the task before it ever runs.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::dag_instance::DagInstance;
use crate::error::{Error, Result};

/// Root binding for the instance variables.
const ROOT_VARS: &str = "vars";
/// Root binding for the share-data map.
const ROOT_SHARE_DATA: &str = "shareData";
/// Field selecting a variable's value under the `vars` root.
const VAR_VALUE_FIELD: &str = "Value";

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*\.([A-Za-z0-9_][A-Za-z0-9_.-]*)\s*\}\}")
            .expect("placeholder pattern is valid")
    })
}

/// Renders a params map against a DAG instance.
///
/// # Errors
///
/// Returns [`Error::Render`] when a placeholder has an unknown root binding,
/// a malformed path, or references a missing variable or share-data key.
pub fn render_params(params: &Map<String, Value>, dag_ins: &DagInstance) -> Result<Map<String, Value>> {
    let mut rendered = Map::with_capacity(params.len());
    for (key, value) in params {
        rendered.insert(key.clone(), render_value(value, dag_ins)?);
    }
    Ok(rendered)
}

fn render_value(value: &Value, dag_ins: &DagInstance) -> Result<Value> {
    match value {
        Value::String(text) => Ok(Value::String(render_text(text, dag_ins)?)),
        Value::Object(map) => Ok(Value::Object(render_params(map, dag_ins)?)),
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| render_value(item, dag_ins))
                .collect::<Result<Vec<_>>>()?,
        )),
        other => Ok(other.clone()),
    }
}

fn render_text(text: &str, dag_ins: &DagInstance) -> Result<String> {
    let pattern = placeholder_pattern();
    let mut result = String::with_capacity(text.len());
    let mut last_end = 0;

    for captures in pattern.captures_iter(text) {
        let whole = captures.get(0).expect("capture 0 always exists");
        let path = captures
            .get(1)
            .map(|m| m.as_str())
            .unwrap_or_default();

        result.push_str(&text[last_end..whole.start()]);
        result.push_str(&resolve_path(path, dag_ins)?);
        last_end = whole.end();
    }
    result.push_str(&text[last_end..]);
    Ok(result)
}

/// Resolves a dot-path against the root bindings.
fn resolve_path(path: &str, dag_ins: &DagInstance) -> Result<String> {
    let (root, rest) = path
        .split_once('.')
        .ok_or_else(|| Error::render(format!("'.{path}' does not select a field")))?;

    match root {
        ROOT_VARS => {
            // The binding shape is {name -> {Value: ...}}, so a variable
            // reference must end in the Value field.
            let (name, field) = rest
                .rsplit_once('.')
                .ok_or_else(|| Error::render(format!("'.vars.{rest}' does not select a field")))?;
            if field != VAR_VALUE_FIELD {
                return Err(Error::render(format!(
                    "'.vars.{rest}': unknown field '{field}'"
                )));
            }
            dag_ins
                .var_value(name)
                .ok_or_else(|| Error::render(format!("var '{name}' not found")))
        }
        ROOT_SHARE_DATA => dag_ins
            .share_data
            .get(rest)
            .ok_or_else(|| Error::render(format!("share data key '{rest}' not found"))),
        other => Err(Error::render(format!("unknown root binding '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Dag;
    use crate::dag_instance::Trigger;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn dag_ins() -> DagInstance {
        let dag = Dag::new("d").with_var("env", "prod").with_var("region", "eu");
        dag.run(Trigger::Manually, &BTreeMap::new()).unwrap()
    }

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn renders_var_placeholders() {
        let params = obj(json!({"target": "{{.vars.env.Value}}-cluster"}));
        let rendered = render_params(&params, &dag_ins()).unwrap();
        assert_eq!(rendered["target"], json!("prod-cluster"));
    }

    #[test]
    fn renders_multiple_placeholders_in_one_leaf() {
        let params = obj(json!({"path": "/data/{{.vars.env.Value}}/{{.vars.region.Value}}"}));
        let rendered = render_params(&params, &dag_ins()).unwrap();
        assert_eq!(rendered["path"], json!("/data/prod/eu"));
    }

    #[tokio::test]
    async fn renders_share_data_placeholders() {
        let ins = dag_ins();
        ins.share_data.set("upstream", "batch-7").await;

        let params = obj(json!({"input": "{{.shareData.upstream}}"}));
        let rendered = render_params(&params, &ins).unwrap();
        assert_eq!(rendered["input"], json!("batch-7"));
    }

    #[test]
    fn walks_nested_maps_and_arrays() {
        let params = obj(json!({
            "outer": {"inner": "{{.vars.env.Value}}"},
            "list": ["{{.vars.region.Value}}", 42, true],
        }));
        let rendered = render_params(&params, &dag_ins()).unwrap();
        assert_eq!(rendered["outer"]["inner"], json!("prod"));
        assert_eq!(rendered["list"], json!(["eu", 42, true]));
    }

    #[test]
    fn non_string_leaves_pass_through() {
        let params = obj(json!({"count": 3, "enabled": false, "ratio": 0.5}));
        let rendered = render_params(&params, &dag_ins()).unwrap();
        assert_eq!(rendered["count"], json!(3));
        assert_eq!(rendered["enabled"], json!(false));
        assert_eq!(rendered["ratio"], json!(0.5));
    }

    #[test]
    fn missing_var_is_an_error() {
        let params = obj(json!({"target": "{{.vars.ghost.Value}}"}));
        let err = render_params(&params, &dag_ins()).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn missing_share_data_key_is_an_error() {
        let params = obj(json!({"input": "{{.shareData.ghost}}"}));
        assert!(render_params(&params, &dag_ins()).is_err());
    }

    #[test]
    fn unknown_root_binding_is_an_error() {
        let params = obj(json!({"target": "{{.secrets.env}}"}));
        let err = render_params(&params, &dag_ins()).unwrap_err();
        assert!(err.to_string().contains("unknown root binding"));
    }

    #[test]
    fn var_reference_without_value_field_is_an_error() {
        let params = obj(json!({"target": "{{.vars.env}}"}));
        assert!(render_params(&params, &dag_ins()).is_err());

        let params = obj(json!({"target": "{{.vars.env.Desc}}"}));
        let err = render_params(&params, &dag_ins()).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn text_without_placeholders_is_unchanged() {
        let params = obj(json!({"plain": "no templates here"}));
        let rendered = render_params(&params, &dag_ins()).unwrap();
        assert_eq!(rendered["plain"], json!("no templates here"));
    }

    #[test]
    fn undotted_braces_are_left_alone() {
        // Only root-binding paths are template syntax; plain braces pass
        // through untouched.
        let params = obj(json!({"plain": "{{not a template}}"}));
        let rendered = render_params(&params, &dag_ins()).unwrap();
        assert_eq!(rendered["plain"], json!("{{not a template}}"));
    }

    #[test]
    fn whitespace_inside_braces_is_tolerated() {
        let params = obj(json!({"target": "{{ .vars.env.Value }}"}));
        let rendered = render_params(&params, &dag_ins()).unwrap();
        assert_eq!(rendered["target"], json!("prod"));
    }
}
