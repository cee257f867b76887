//! Compiled manifest
//!
//! A manifest is the ordered list of documents for one app plus their
//! serialized multi-document YAML. Serialization happens once, so the
//! bytes handed to the applier are stable for equal inputs.

use super::error::CompileError;

/// Ordered deployment documents for one app
#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    documents: Vec<serde_json::Value>,
    yaml: String,
}

impl Manifest {
    /// Serialize documents into a manifest
    ///
    /// Slots are already bound by the engine, so string values are taken
    /// verbatim even when they look like `${ ... }`.
    pub fn from_documents(documents: Vec<serde_json::Value>) -> Result<Self, CompileError> {
        let mut yaml = String::new();
        for (index, doc) in documents.iter().enumerate() {
            let rendered = serde_yaml::to_string(doc).map_err(|e| {
                CompileError::data(format!("document {index} does not serialize: {e}"))
            })?;
            if index > 0 {
                yaml.push_str("---\n");
            }
            yaml.push_str(&rendered);
        }

        Ok(Self { documents, yaml })
    }

    /// Parsed documents in apply order
    pub fn documents(&self) -> &[serde_json::Value] {
        &self.documents
    }

    /// Multi-document YAML
    pub fn as_yaml(&self) -> &str {
        &self.yaml
    }

    /// Multi-document YAML bytes, as handed to an applier
    pub fn as_bytes(&self) -> &[u8] {
        self.yaml.as_bytes()
    }

    /// `(kind, name)` of every document, in order
    pub fn resources(&self) -> Vec<(String, String)> {
        self.documents
            .iter()
            .map(|doc| {
                (
                    doc["kind"].as_str().unwrap_or_default().to_string(),
                    doc["metadata"]["name"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    /// First document of the given kind and name
    pub fn find(&self, kind: &str, name: &str) -> Option<&serde_json::Value> {
        self.documents
            .iter()
            .find(|doc| doc["kind"] == kind && doc["metadata"]["name"] == name)
    }

    /// Number of documents
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// True when the manifest holds no documents
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn documents_are_joined_with_separators() {
        let manifest = Manifest::from_documents(vec![
            json!({ "kind": "Secret", "metadata": { "name": "a" } }),
            json!({ "kind": "ServiceAccount", "metadata": { "name": "b" } }),
        ])
        .unwrap();

        assert_eq!(manifest.as_yaml().matches("---\n").count(), 1);
        assert_eq!(
            manifest.resources(),
            vec![
                ("Secret".to_string(), "a".to_string()),
                ("ServiceAccount".to_string(), "b".to_string()),
            ]
        );
        assert!(manifest.find("ServiceAccount", "b").is_some());
        assert!(manifest.find("ServiceAccount", "a").is_none());
    }

    #[test]
    fn slot_shaped_strings_are_kept_verbatim() {
        let manifest = Manifest::from_documents(vec![json!({
            "kind": "Secret",
            "metadata": { "name": "a", "labels": { "team": "${x}" } },
            "stringData": { "github_token": "${GH_TOKEN}" },
        })])
        .unwrap();
        assert_eq!(manifest.documents()[0]["stringData"]["github_token"], "${GH_TOKEN}");
        assert!(manifest.as_yaml().contains("${GH_TOKEN}"));
    }

    #[test]
    fn equal_documents_serialize_identically() {
        let docs = vec![json!({ "kind": "A", "metadata": { "name": "x", "labels": { "b": "1", "a": "2" } } })];
        let first = Manifest::from_documents(docs.clone()).unwrap();
        let second = Manifest::from_documents(docs).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }
}
