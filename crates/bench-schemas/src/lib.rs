use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

static SCHEMAS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/schemas");

pub const TASK_SCHEMA: &str = "task_v1.jsonschema";
pub const MANIFEST_SCHEMA: &str = "manifest_v1.jsonschema";

pub fn schema_names() -> Vec<String> {
    SCHEMAS_DIR
        .files()
        .filter_map(|f| {
            f.path()
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .collect()
}

pub fn load_schema(name: &str) -> Result<Value> {
    let file = SCHEMAS_DIR
        .get_file(name)
        .ok_or_else(|| anyhow!("schema not found: {}", name))?;
    let data = std::str::from_utf8(file.contents())?;
    Ok(serde_json::from_str(data)?)
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let schema = load_schema(name)?;
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
        .map_err(|e| anyhow!("schema {} does not compile: {}", name, e))
}

/// Validates `value` against the named schema, joining every violation into one error.
pub fn validate_value(name: &str, value: &Value) -> Result<()> {
    let compiled = compile_schema(name)?;
    let outcome = compiled.validate(value);
    if let Err(errors) = outcome {
        let details: Vec<String> = errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();
        return Err(anyhow!(
            "{} validation failed: {}",
            name,
            details.join("; ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn embedded_schemas_compile() {
        let names = schema_names();
        assert!(names.contains(&TASK_SCHEMA.to_string()));
        assert!(names.contains(&MANIFEST_SCHEMA.to_string()));
        for name in names {
            compile_schema(&name).expect("schema should compile");
        }
    }

    #[test]
    fn schema_ids_are_absolute_urls() {
        for name in schema_names() {
            let schema = load_schema(&name).expect("load");
            let id = schema["$id"].as_str().unwrap_or_default();
            assert!(id.starts_with("https://"), "{} has id {:?}", name, id);
            assert!(id.ends_with(&name), "{} has id {:?}", name, id);
        }
    }

    #[test]
    fn task_schema_rejects_missing_verification() {
        let task = json!({
            "domain": "swe-verified",
            "topic": "bugfix",
            "train_or_test": "test",
            "task_name": "t1",
            "repo": "",
            "revision": "",
            "task": [{"role": "user", "content": "hello"}]
        });
        let err = validate_value(TASK_SCHEMA, &task).expect_err("must fail");
        assert!(err.to_string().contains("verification"));

        let mut ok = task.clone();
        ok["verification"] = json!({"run_python": "verify.py"});
        validate_value(TASK_SCHEMA, &ok).expect("valid task");
    }

    #[test]
    fn manifest_schema_requires_version_tag() {
        let manifest = json!({"schema_version": "other"});
        assert!(validate_value(MANIFEST_SCHEMA, &manifest).is_err());
    }
}
