use std::collections::BTreeMap;

/// One output record produced by an analyzer
#[derive(Debug, Clone, PartialEq)]
pub struct SinkPack {
    /// Destination dataset (the output name)
    pub name: String,

    /// Record identity within the dataset
    pub id: String,

    /// Fetch fingerprint of the target the record came from
    pub hash: String,

    /// URL of the document the record came from
    pub url: String,

    /// Extracted fields
    pub data: BTreeMap<String, String>,

    /// Raw payload for file-like outputs
    pub file: Option<FilePayload>,
}

/// A fetched file
#[derive(Debug, Clone, PartialEq)]
pub struct FilePayload {
    pub bytes: Vec<u8>,
    /// Extension including the leading dot, for example `.webp`
    pub ext: String,
}

impl SinkPack {
    /// A structured record
    pub fn record(
        name: impl Into<String>,
        id: impl Into<String>,
        hash: impl Into<String>,
        url: impl Into<String>,
        data: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            hash: hash.into(),
            url: url.into(),
            data,
            file: None,
        }
    }

    /// A file record, identified by its URL
    pub fn file(
        name: impl Into<String>,
        url: impl Into<String>,
        hash: impl Into<String>,
        bytes: Vec<u8>,
        ext: &str,
    ) -> Self {
        let url = url.into();
        Self {
            name: name.into(),
            id: url.clone(),
            hash: hash.into(),
            url,
            data: BTreeMap::new(),
            file: Some(FilePayload {
                bytes,
                ext: format!(".{}", ext.trim_start_matches('.')),
            }),
        }
    }

    pub fn is_file(&self) -> bool {
        self.file.is_some()
    }
}
