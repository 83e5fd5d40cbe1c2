use std::path::Path;
use std::sync::OnceLock;

use include_dir::{include_dir, Dir};
use jsonschema::JSONSchema;
use serde_json::Value;

use crate::error::{LedgerError, Result};
use crate::record::LedgerDocument;

static SCHEMAS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/schemas");

pub const LEDGER_DOCUMENT_SCHEMA: &str = "ledger_document_v1.jsonschema";

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let raw = SCHEMAS
        .get_file(name)
        .and_then(|f| f.contents_utf8())
        .ok_or_else(|| LedgerError::Config {
            message: format!("schema not bundled: {}", name),
        })?;
    let schema_json: Value = serde_json::from_str(raw)?;
    JSONSchema::compile(&schema_json).map_err(|e| LedgerError::Config {
        message: format!("schema {} does not compile: {}", name, e),
    })
}

/// The ledger document schema, compiled on first use.
fn ledger_schema() -> Result<&'static JSONSchema> {
    static COMPILED: OnceLock<JSONSchema> = OnceLock::new();
    if let Some(schema) = COMPILED.get() {
        return Ok(schema);
    }
    let schema = compile_schema(LEDGER_DOCUMENT_SCHEMA)?;
    Ok(COMPILED.get_or_init(|| schema))
}

/// Validates raw ledger bytes against the bundled schema, then decodes them.
///
/// `path` only labels errors; nothing is read from it.
pub fn parse_document(path: &Path, bytes: &[u8]) -> Result<LedgerDocument> {
    let raw: Value = serde_json::from_slice(bytes)
        .map_err(|e| LedgerError::validation(path, format!("not valid JSON: {}", e)))?;
    let schema = compile_schema(LEDGER_DOCUMENT_SCHEMA)?;
    if let Err(errors) = schema.validate(&raw) {
        let mut msgs = Vec::new();
        for e in errors {
            let at = e.instance_path.to_string();
            if at.is_empty() {
                msgs.push(e.to_string());
            } else {
                msgs.push(format!("{}: {}", at, e));
            }
        }
        return Err(LedgerError::validation(path, msgs.join("; ")));
    }
    serde_json::from_value(raw).map_err(|e| LedgerError::validation(path, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn label() -> &'static Path {
        Path::new("metadata.json")
    }

    fn valid_record() -> Value {
        json!({
            "status": "running",
            "param_hash": -42,
            "relpath": "sweeps/a",
            "status_time": "2025-01-02T03:04:05.123456Z",
            "start_time": "2025-01-02T03:04:05.123456Z",
            "end_time": null,
            "files": {"data": "/tmp/data.json"}
        })
    }

    #[test]
    fn bundled_schema_compiles() {
        compile_schema(LEDGER_DOCUMENT_SCHEMA).expect("bundled schema");
        assert!(compile_schema("missing.jsonschema").is_err());
    }

    #[test]
    fn ledger_schema_is_compiled_once() {
        let first = ledger_schema().expect("schema");
        let second = ledger_schema().expect("schema");
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn accepts_well_formed_document() {
        let doc = json!({"calibration": {"000": valid_record()}, "empty": {}});
        let bytes = serde_json::to_vec(&doc).expect("bytes");
        let parsed = parse_document(label(), &bytes).expect("valid");
        assert_eq!(parsed.len(), 2);
        let record = &parsed["calibration"]["000"];
        assert_eq!(record.param_hash, Some(-42));
        assert_eq!(record.files["data"], "/tmp/data.json");
        assert!(parsed["empty"].is_empty());
    }

    #[test]
    fn rejects_unknown_status() {
        let mut record = valid_record();
        record["status"] = json!("finished");
        let bytes = serde_json::to_vec(&json!({"id": {"000": record}})).expect("bytes");
        let err = parse_document(label(), &bytes).expect_err("bad status");
        assert!(matches!(err, LedgerError::Validation { .. }), "{}", err);
        assert!(err.to_string().contains("/id/000/status"), "{}", err);
    }

    #[test]
    fn rejects_missing_and_extra_fields() {
        let mut record = valid_record();
        record.as_object_mut().expect("object").remove("relpath");
        let bytes = serde_json::to_vec(&json!({"id": {"000": record}})).expect("bytes");
        assert!(parse_document(label(), &bytes).is_err());

        let mut record = valid_record();
        record["surprise"] = json!(1);
        let bytes = serde_json::to_vec(&json!({"id": {"000": record}})).expect("bytes");
        assert!(parse_document(label(), &bytes).is_err());
    }

    #[test]
    fn rejects_wrong_nesting_and_truncation() {
        let bytes = serde_json::to_vec(&json!({"id": ["000"]})).expect("bytes");
        assert!(parse_document(label(), &bytes).is_err());

        let truncated = br#"{"id": {"000": {"status": "pend"#;
        let err = parse_document(label(), truncated).expect_err("truncated");
        assert!(err.to_string().contains("not valid JSON"), "{}", err);

        assert!(parse_document(label(), b"").is_err());
    }

    #[test]
    fn rejects_unparseable_timestamp() {
        let mut record = valid_record();
        record["status_time"] = json!("yesterday");
        let bytes = serde_json::to_vec(&json!({"id": {"000": record}})).expect("bytes");
        let err = parse_document(label(), &bytes).expect_err("bad timestamp");
        assert!(matches!(err, LedgerError::Validation { .. }));
    }
}
