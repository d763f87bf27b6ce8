//! Path-addressed view of the configuration document.
//!
//! Paths look like `/`, `/routes/0/action` or `/listeners/*:8080`. Empty
//! segments are ignored, so `/` and the empty path both address the root.
//! Array elements are addressed by decimal index.

use basalt_notify::EngineError;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("invalid JSON")]
    InvalidJson(#[source] serde_json::Error),

    #[error("value doesn't exist at '{path}'")]
    NotFound { path: String },

    #[error("invalid configuration: {0}")]
    Rejected(#[from] EngineError),

    #[error("failed to encode the configuration")]
    Encode(#[source] serde_json::Error),
}

/// Read access plus staging of whole-document replacements.
///
/// `stage_*` never modify `self`: they return the bytes of the complete
/// document as it would be after the edit. The caller broadcasts them, and
/// the local copy changes only when that broadcast is applied here.
pub trait ConfigDocument {
    fn read(&self, path: &str) -> Result<Vec<u8>, DocumentError>;
    fn stage_put(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, DocumentError>;
    fn stage_delete(&self, path: &str) -> Result<Vec<u8>, DocumentError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonDocument {
    root: Value,
}

impl Default for JsonDocument {
    fn default() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn child<'a>(node: &'a Value, seg: &str) -> Option<&'a Value> {
    match node {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

fn child_mut<'a>(node: &'a mut Value, seg: &str) -> Option<&'a mut Value> {
    match node {
        Value::Object(map) => map.get_mut(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    }
}

fn walk_mut<'a>(mut node: &'a mut Value, segs: &[&str]) -> Option<&'a mut Value> {
    for seg in segs {
        node = child_mut(node, seg)?;
    }
    Some(node)
}

impl JsonDocument {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn get(&self, path: &str) -> Result<&Value, DocumentError> {
        segments(path)
            .into_iter()
            .try_fold(&self.root, |node, seg| child(node, seg))
            .ok_or_else(|| DocumentError::NotFound { path: path.to_owned() })
    }

    /// Copy of the document with `value` stored at `path`.
    ///
    /// The parent must exist. Object members are inserted or replaced; array
    /// elements are replaced, or appended when the index equals the length.
    pub fn with_put(&self, path: &str, value: Value) -> Result<JsonDocument, DocumentError> {
        let segs = segments(path);
        let Some((last, parents)) = segs.split_last() else {
            return Ok(JsonDocument::new(value));
        };
        let not_found = || DocumentError::NotFound { path: path.to_owned() };

        let mut root = self.root.clone();
        match walk_mut(&mut root, parents).ok_or_else(not_found)? {
            Value::Object(map) => {
                map.insert((*last).to_owned(), value);
            }
            Value::Array(items) => {
                let idx = last
                    .parse::<usize>()
                    .ok()
                    .filter(|&i| i <= items.len())
                    .ok_or_else(not_found)?;
                if idx == items.len() {
                    items.push(value);
                } else {
                    items[idx] = value;
                }
            }
            _ => return Err(not_found()),
        }
        Ok(JsonDocument::new(root))
    }

    /// Copy of the document without the value at `path`. Deleting the root
    /// leaves an empty object.
    pub fn with_delete(&self, path: &str) -> Result<JsonDocument, DocumentError> {
        let segs = segments(path);
        let Some((last, parents)) = segs.split_last() else {
            return Ok(JsonDocument::default());
        };
        let not_found = || DocumentError::NotFound { path: path.to_owned() };

        let mut root = self.root.clone();
        let removed = match walk_mut(&mut root, parents).ok_or_else(not_found)? {
            Value::Object(map) => map.remove(*last).is_some(),
            Value::Array(items) => match last.parse::<usize>() {
                Ok(i) if i < items.len() => {
                    items.remove(i);
                    true
                }
                _ => false,
            },
            _ => false,
        };
        if !removed {
            return Err(not_found());
        }
        Ok(JsonDocument::new(root))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DocumentError> {
        serde_json::to_vec(&self.root).map_err(DocumentError::Encode)
    }
}

impl ConfigDocument for JsonDocument {
    fn read(&self, path: &str) -> Result<Vec<u8>, DocumentError> {
        serde_json::to_vec_pretty(self.get(path)?).map_err(DocumentError::Encode)
    }

    fn stage_put(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let value: Value = serde_json::from_slice(body).map_err(DocumentError::InvalidJson)?;
        self.with_put(path, value)?.to_bytes()
    }

    fn stage_delete(&self, path: &str) -> Result<Vec<u8>, DocumentError> {
        self.with_delete(path)?.to_bytes()
    }
}
