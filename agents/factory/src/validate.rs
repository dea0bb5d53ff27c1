//! Upload validation: decides whether a byte blob may proceed to analysis.
//!
//! Checks run in a fixed order and stop at the first failure: non-empty,
//! size ceiling, extension, then per-kind structure (UTF-8 for source
//! files, archive layout for ZIP bundles). Error strings are short and
//! user-facing.

use std::io::{Cursor, Read};
use std::path::Path;

use tracing::warn;

use roomforge_core::{UploadKind, UploadMetadata};

/// Size ceiling for HTML pages and ZIP bundles.
pub const BUNDLE_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;
/// Ceiling on the summed uncompressed size of a ZIP bundle.
pub const MAX_EXTRACT_SIZE: u64 = 100 * 1024 * 1024;

/// Patterns in HTML content worth flagging. Hits are logged, not rejected;
/// HTML games legitimately use several of these.
const HTML_DANGEROUS_PATTERNS: &[&str] = &[
    "eval(",
    "Function(",
    "setTimeout(function",
    "setInterval(function",
    "document.write",
    "innerHTML",
    "dangerouslySetInnerHTML",
];

/// Decoded payload of an accepted upload, ready for the image builder.
#[derive(Debug, Clone)]
pub enum ValidatedUpload {
    /// A JavaScript game module.
    Js {
        /// The module source.
        source: String,
    },
    /// A single HTML page.
    Html {
        /// The page, served as `index.html`.
        index_html: String,
    },
    /// A zipped bundle with an `index.html` plus auxiliary files.
    Zip {
        /// Content of the chosen `index.html`.
        index_html: String,
        /// Remaining archive entries, preserved verbatim.
        other_files: Vec<(String, Vec<u8>)>,
    },
}

impl ValidatedUpload {
    /// The kind tag for this payload.
    pub fn kind(&self) -> UploadKind {
        match self {
            ValidatedUpload::Js { .. } => UploadKind::Js,
            ValidatedUpload::Html { .. } => UploadKind::Html,
            ValidatedUpload::Zip { .. } => UploadKind::Zip,
        }
    }
}

/// An accepted upload: what it is plus what the validator learned.
#[derive(Debug, Clone)]
pub struct Validation {
    /// The decoded payload.
    pub payload: ValidatedUpload,
    /// File-type tag, counts and sizes.
    pub metadata: UploadMetadata,
}

/// Stateless validator configured with the factory's upload limits.
#[derive(Debug, Clone)]
pub struct UploadValidator {
    max_file_size: u64,
    allowed_extensions: Vec<String>,
}

impl UploadValidator {
    /// A validator enforcing `max_file_size` for JavaScript payloads and
    /// accepting the given extensions.
    pub fn new(max_file_size: u64, allowed_extensions: Vec<String>) -> Self {
        Self {
            max_file_size,
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Validate an upload; `Err` carries the user-facing rejection message.
    pub fn validate(&self, content: &[u8], filename: &str) -> Result<Validation, String> {
        if content.is_empty() {
            return Err("file is empty".to_owned());
        }

        let extension = Path::new(filename)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
            .unwrap_or_default();
        let kind = match extension.as_str() {
            ".js" | ".mjs" => Some(UploadKind::Js),
            ".html" | ".htm" => Some(UploadKind::Html),
            ".zip" => Some(UploadKind::Zip),
            _ => None,
        };

        let size_limit = match kind {
            Some(UploadKind::Js) | None => self.max_file_size,
            Some(UploadKind::Html) | Some(UploadKind::Zip) => BUNDLE_MAX_FILE_SIZE,
        };
        if content.len() as u64 > size_limit {
            return Err(format!(
                "file too large ({} > {} bytes)",
                content.len(),
                size_limit
            ));
        }

        let Some(kind) = kind.filter(|_| self.allowed_extensions.contains(&extension)) else {
            return Err(format!(
                "unsupported file type, allowed: {}",
                self.allowed_extensions.join(", ")
            ));
        };

        match kind {
            UploadKind::Js => self.validate_js(content),
            UploadKind::Html => self.validate_html(content, filename),
            UploadKind::Zip => self.validate_zip(content),
        }
    }

    fn validate_js(&self, content: &[u8]) -> Result<Validation, String> {
        let source = std::str::from_utf8(content)
            .map_err(|_| "invalid file encoding, use UTF-8".to_owned())?;
        if source.trim().is_empty() {
            return Err("file content is empty".to_owned());
        }
        Ok(Validation {
            payload: ValidatedUpload::Js {
                source: source.to_owned(),
            },
            metadata: UploadMetadata {
                file_type: UploadKind::Js,
                file_count: 1,
                total_size: content.len() as u64,
                index_html_path: None,
            },
        })
    }

    fn validate_html(&self, content: &[u8], filename: &str) -> Result<Validation, String> {
        let html = std::str::from_utf8(content)
            .map_err(|_| "invalid HTML file encoding, use UTF-8".to_owned())?;
        if html.trim().is_empty() {
            return Err("HTML file is empty".to_owned());
        }
        note_html_patterns(html, filename);
        Ok(Validation {
            payload: ValidatedUpload::Html {
                index_html: html.to_owned(),
            },
            metadata: UploadMetadata {
                file_type: UploadKind::Html,
                file_count: 1,
                total_size: content.len() as u64,
                index_html_path: None,
            },
        })
    }

    fn validate_zip(&self, content: &[u8]) -> Result<Validation, String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(content))
            .map_err(|_| "file is not a valid ZIP archive".to_owned())?;
        if archive.len() == 0 {
            return Err("ZIP archive is empty".to_owned());
        }

        let mut total_size = 0u64;
        let mut index_html_path = None;
        let mut entry_names = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let entry = archive
                .by_index(i)
                .map_err(|_| "ZIP archive is corrupt".to_owned())?;
            total_size += entry.size();
            let name = entry.name().to_owned();
            if index_html_path.is_none() && !entry.is_dir() {
                let basename = name.rsplit('/').next().unwrap_or(&name);
                if basename.eq_ignore_ascii_case("index.html") {
                    index_html_path = Some(name.clone());
                }
            }
            entry_names.push(name);
        }

        let Some(index_path) = index_html_path else {
            return Err("no index.html found in ZIP archive".to_owned());
        };
        if total_size > MAX_EXTRACT_SIZE {
            return Err(format!(
                "extracted size too large ({total_size} > {MAX_EXTRACT_SIZE} bytes)"
            ));
        }

        let mut index_bytes = Vec::new();
        archive
            .by_name(&index_path)
            .map_err(|_| "ZIP archive is corrupt".to_owned())?
            .read_to_end(&mut index_bytes)
            .map_err(|_| "ZIP archive is corrupt".to_owned())?;
        let index_html = String::from_utf8(index_bytes)
            .map_err(|_| "index.html has invalid encoding, use UTF-8".to_owned())?;
        note_html_patterns(&index_html, &index_path);

        let mut other_files = Vec::new();
        for name in &entry_names {
            if name == &index_path || name.ends_with('/') {
                continue;
            }
            let mut bytes = Vec::new();
            if let Ok(mut entry) = archive.by_name(name) {
                if entry.is_dir() {
                    continue;
                }
                if entry.read_to_end(&mut bytes).is_ok() {
                    other_files.push((name.clone(), bytes));
                }
            }
        }

        Ok(Validation {
            payload: ValidatedUpload::Zip {
                index_html,
                other_files,
            },
            metadata: UploadMetadata {
                file_type: UploadKind::Zip,
                file_count: entry_names.len(),
                total_size,
                index_html_path: Some(index_path),
            },
        })
    }
}

fn note_html_patterns(html: &str, source: &str) {
    let lowered = html.to_lowercase();
    for pattern in HTML_DANGEROUS_PATTERNS {
        if lowered.contains(&pattern.to_lowercase()) {
            warn!(source, pattern, "potentially dangerous pattern in HTML upload");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    use super::*;

    fn validator() -> UploadValidator {
        UploadValidator::new(
            1024 * 1024,
            vec![
                ".js".into(),
                ".mjs".into(),
                ".html".into(),
                ".htm".into(),
                ".zip".into(),
            ],
        )
    }

    fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn empty_file_is_rejected() {
        assert_eq!(
            validator().validate(b"", "game.js").unwrap_err(),
            "file is empty"
        );
    }

    #[test]
    fn size_boundary_is_exact() {
        let validator = UploadValidator::new(64, vec![".js".into()]);
        let at_limit = vec![b'a'; 64];
        assert!(validator.validate(&at_limit, "game.js").is_ok());

        let over_limit = vec![b'a'; 65];
        let err = validator.validate(&over_limit, "game.js").unwrap_err();
        assert!(err.contains("too large"));
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = validator().validate(b"hi", "game.exe").unwrap_err();
        assert!(err.contains("unsupported file type"));
    }

    #[test]
    fn extension_matching_is_case_insensitive() {
        let upload = validator()
            .validate(b"module.exports = {};", "Game.JS")
            .unwrap();
        assert_eq!(upload.metadata.file_type, UploadKind::Js);
    }

    #[test]
    fn invalid_utf8_js_is_rejected() {
        let err = validator().validate(&[0xff, 0xfe, 0x00], "game.js").unwrap_err();
        assert!(err.contains("UTF-8"));
    }

    #[test]
    fn blank_html_is_rejected() {
        let err = validator().validate(b"   \n\t ", "game.html").unwrap_err();
        assert!(err.contains("empty"));
    }

    #[test]
    fn html_upload_passes_through() {
        let upload = validator()
            .validate(b"<html><body>hi</body></html>", "game.html")
            .unwrap();
        assert_eq!(upload.metadata.file_type, UploadKind::Html);
        match upload.payload {
            ValidatedUpload::Html { index_html } => assert!(index_html.contains("hi")),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn zip_without_index_html_is_rejected() {
        let archive = zip_with(&[("main.js", b"console.log(1);")]);
        let err = validator().validate(&archive, "game.zip").unwrap_err();
        assert!(err.contains("index.html"));
    }

    #[test]
    fn garbage_zip_is_rejected() {
        let err = validator()
            .validate(b"definitely not a zip", "game.zip")
            .unwrap_err();
        assert!(err.contains("ZIP"));
    }

    #[test]
    fn zip_bundle_is_unpacked() {
        let archive = zip_with(&[
            ("assets/sprite.png", b"\x89PNG".as_slice()),
            ("web/index.html", b"<html>game</html>".as_slice()),
        ]);
        let upload = validator().validate(&archive, "game.zip").unwrap();
        assert_eq!(upload.metadata.file_type, UploadKind::Zip);
        assert_eq!(upload.metadata.file_count, 2);
        assert_eq!(
            upload.metadata.index_html_path.as_deref(),
            Some("web/index.html")
        );
        match upload.payload {
            ValidatedUpload::Zip {
                index_html,
                other_files,
            } => {
                assert!(index_html.contains("game"));
                assert_eq!(other_files.len(), 1);
                assert_eq!(other_files[0].0, "assets/sprite.png");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn index_html_basename_match_is_case_insensitive() {
        let archive = zip_with(&[("dist/Index.HTML", b"<html></html>".as_slice())]);
        assert!(validator().validate(&archive, "game.zip").is_ok());
    }
}
