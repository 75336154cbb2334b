//! Multimedia externalization.
//!
//! Inline media values look like `{"data:image/png;base64": "<bytes>"}`.
//! Before a record is serialized into an artifact file, each such value is
//! written out to a file in the run folder and replaced by a path marker of
//! the form `{"data:image/png;path": "<relative file>"}`.

use std::path::Path;

use base64::Engine as _;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

const DATA_PREFIX: &str = "data:";
const BASE64_SUFFIX: &str = ";base64";
const PATH_SUFFIX: &str = ";path";

/// Recursively externalize inline media under `dir`. Values that fail to
/// decode or write are kept inline rather than lost.
pub fn externalize_media(value: &Value, dir: &Path) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                let (key, inline) = map.iter().next().expect("len checked");
                if let Some(mime) = key
                    .strip_prefix(DATA_PREFIX)
                    .and_then(|rest| rest.strip_suffix(BASE64_SUFFIX))
                {
                    if let Some(encoded) = inline.as_str() {
                        match write_media(mime, encoded, dir) {
                            Ok(filename) => {
                                let marker = format!("{DATA_PREFIX}{mime}{PATH_SUFFIX}");
                                return serde_json::json!({ marker: filename });
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to externalize media, keeping inline");
                            }
                        }
                    }
                }
            }
            Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), externalize_media(v, dir)))
                    .collect(),
            )
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| externalize_media(v, dir)).collect())
        }
        other => other.clone(),
    }
}

fn write_media(mime: &str, encoded: &str, dir: &Path) -> anyhow::Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded)?;
    let extension = mime.rsplit('/').next().unwrap_or("bin");
    let filename = format!("{}.{extension}", Uuid::new_v4());
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(&filename), bytes)?;
    Ok(filename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inline_image_is_replaced_with_path_marker() {
        let dir = tempfile::tempdir().unwrap();
        let value = json!({
            "answer": "ok",
            "chart": {"data:image/png;base64": base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3])},
        });
        let externalized = externalize_media(&value, dir.path());

        assert_eq!(externalized["answer"], json!("ok"));
        let marker = externalized["chart"].as_object().unwrap();
        let (key, filename) = marker.iter().next().unwrap();
        assert_eq!(key, "data:image/png;path");
        let file = dir.path().join(filename.as_str().unwrap());
        assert_eq!(std::fs::read(file).unwrap(), vec![1u8, 2, 3]);
    }

    #[test]
    fn non_media_values_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let value = json!({"a": [1, 2], "b": {"nested": "x"}});
        assert_eq!(externalize_media(&value, dir.path()), value);
    }

    #[test]
    fn undecodable_media_stays_inline() {
        let dir = tempfile::tempdir().unwrap();
        let value = json!({"data:image/png;base64": "not-base64!!!"});
        assert_eq!(externalize_media(&value, dir.path()), value);
    }
}
