use serde::Serialize;

/// Kind of payload an upload was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadKind {
    /// A JavaScript game module (`.js` / `.mjs`).
    Js,
    /// A single HTML page (`.html` / `.htm`).
    Html,
    /// A zipped HTML bundle containing an `index.html`.
    Zip,
}

/// What the validator learned about an accepted upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadMetadata {
    /// Payload classification.
    pub file_type: UploadKind,
    /// Number of files in the payload (1 except for archives).
    pub file_count: usize,
    /// Total payload size in bytes; for archives, the uncompressed sum.
    pub total_size: u64,
    /// Archive path of the chosen `index.html`, for ZIP uploads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_html_path: Option<String>,
}
