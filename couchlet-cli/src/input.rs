//! Reading documents from arguments, files and stdin

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::io::Read;
use std::path::Path;

/// Read a file, or stdin when `path` is `-`
pub fn read_source(path: &str) -> Result<Vec<u8>> {
    if path == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("Failed to read stdin")?;
        Ok(buf)
    } else {
        std::fs::read(Path::new(path)).with_context(|| format!("Failed to read {}", path))
    }
}

/// Parse a JSON document given inline
pub fn parse_doc(text: &str) -> Result<Value> {
    let doc: Value = serde_json::from_str(text).with_context(|| "Document is not valid JSON")?;
    if !doc.is_object() {
        bail!("Document must be a JSON object");
    }
    Ok(doc)
}

/// Parse a bulk input: either `[doc, ...]` or `{"docs": [doc, ...]}`
pub fn parse_batch(data: &[u8]) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_slice(data).with_context(|| "Batch is not valid JSON")?;
    match value {
        Value::Array(docs) => Ok(docs),
        Value::Object(mut map) => match map.remove("docs") {
            Some(Value::Array(docs)) => Ok(docs),
            _ => Err(anyhow!("Batch object must carry a \"docs\" array")),
        },
        _ => Err(anyhow!("Batch must be an array of documents")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_batch_forms() {
        assert_eq!(parse_batch(br#"[{"_id": "a"}]"#).unwrap().len(), 1);
        assert_eq!(parse_batch(br#"{"docs": [{"_id": "a"}, {"_id": "b"}]}"#).unwrap().len(), 2);
        assert!(parse_batch(br#"{"rows": []}"#).is_err());
        assert!(parse_batch(b"42").is_err());
    }

    #[test]
    fn test_parse_doc_requires_object() {
        assert!(parse_doc(r#"{"_id": "a"}"#).is_ok());
        assert!(parse_doc("[1]").is_err());
        assert!(parse_doc("{").is_err());
    }
}
