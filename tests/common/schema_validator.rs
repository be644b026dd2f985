use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

/// Compile a schema from `tests/schemas/<name>.json`
pub fn load_test_schema(schema_name: &str) -> JSONSchema {
    let schema_path = format!(
        "{}/tests/schemas/{}.json",
        env!("CARGO_MANIFEST_DIR"),
        schema_name
    );
    let schema_content = std::fs::read_to_string(&schema_path)
        .unwrap_or_else(|_| panic!("Failed to read schema file: {}", schema_path));
    let schema_json: Value = serde_json::from_str(&schema_content)
        .unwrap_or_else(|_| panic!("Failed to parse schema JSON: {}", schema_path));

    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema_json)
        .expect("Failed to compile schema")
}

/// Validate a document, collecting every violation with its location
pub fn validate_against_schema(data: &Value, schema: &JSONSchema) -> Result<(), Vec<String>> {
    match schema.validate(data) {
        Ok(()) => Ok(()),
        Err(errors) => Err(errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect()),
    }
}

/// Panic with all violations when `data` does not match `tests/schemas/<name>.json`
pub fn assert_matches_schema(data: &Value, schema_name: &str) {
    let schema = load_test_schema(schema_name);
    if let Err(errors) = validate_against_schema(data, &schema) {
        panic!(
            "{} does not match schema:\n{}\n{}",
            schema_name,
            errors.join("\n"),
            serde_json::to_string_pretty(data).unwrap_or_default()
        );
    }
}
