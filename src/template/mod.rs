//! DOCX template rendering.
//!
//! A template is loaded into a [`TemplateDocument`] that owns every package
//! part. Only `word/document.xml` is parsed; other parts are carried
//! byte-for-byte. Serialization is deterministic: the same template and
//! replacement map always produce the same bytes.

pub mod body;
pub mod mutate;

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

use body::{for_each_paragraph, paragraph_text, XmlPart};
pub use mutate::{PruneStats, ReplaceStats, UnitLayout};

const DOCUMENT_PART: &str = "word/document.xml";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid docx package: {0}")]
    Package(#[from] zip::result::ZipError),
    #[error("package has no word/document.xml")]
    MissingDocument,
    #[error("document has no body")]
    MissingBody,
    #[error("invalid document xml: {0}")]
    Xml(String),
    #[error("document part is not UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone, PartialEq)]
struct PackagePart {
    name: String,
    compression: CompressionMethod,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderReport {
    pub replace: ReplaceStats,
    pub prune: PruneStats,
}

impl RenderReport {
    pub fn unresolved(&self) -> &BTreeSet<String> {
        &self.replace.unresolved
    }
}

/// An exclusively owned, mutable DOCX. Each output variant loads its own.
#[derive(Debug, Clone)]
pub struct TemplateDocument {
    parts: Vec<PackagePart>,
    document_index: usize,
    document: XmlPart,
}

impl TemplateDocument {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TemplateError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let mut parts = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data).map_err(|source| TemplateError::Io {
                path: PathBuf::from(file.name()),
                source,
            })?;
            parts.push(PackagePart {
                name: file.name().to_string(),
                compression: file.compression(),
                data,
            });
        }

        let document_index = parts
            .iter()
            .position(|p| p.name == DOCUMENT_PART)
            .ok_or(TemplateError::MissingDocument)?;
        let xml = String::from_utf8(parts[document_index].data.clone())?;
        let document = XmlPart::parse(&xml)?;
        // Fail early on templates without a body.
        document.body()?;

        Ok(Self {
            parts,
            document_index,
            document,
        })
    }

    /// Replace placeholders from `map` in one pass, then prune units above
    /// `populated` when a layout is given.
    pub fn render(
        &mut self,
        map: &BTreeMap<String, String>,
        populated: usize,
        layout: Option<&UnitLayout>,
    ) -> Result<RenderReport, TemplateError> {
        let body = self.document.body_mut()?;
        let replace = mutate::replace_placeholders(body, map);
        let prune = match layout {
            Some(layout) => mutate::prune_units(body, layout, populated),
            None => PruneStats::default(),
        };
        tracing::debug!(
            replaced = replace.replaced,
            rebuilt = replace.rebuilt_paragraphs,
            unresolved = replace.unresolved.len(),
            removed_units = prune.removed_units.len(),
            "template rendered"
        );
        Ok(RenderReport { replace, prune })
    }

    /// Paragraph text in body order, one paragraph per line.
    pub fn text(&self) -> Result<String, TemplateError> {
        let mut lines = Vec::new();
        for_each_paragraph(self.document.body()?, &mut |p| lines.push(paragraph_text(p)));
        Ok(lines.join("\n"))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TemplateError> {
        let document = self.document.to_bytes()?;
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (i, part) in self.parts.iter().enumerate() {
            let compression = match part.compression {
                CompressionMethod::Stored => CompressionMethod::Stored,
                _ => CompressionMethod::Deflated,
            };
            let options = SimpleFileOptions::default()
                .compression_method(compression)
                .last_modified_time(DateTime::default());
            if part.name.ends_with('/') {
                writer.add_directory(part.name.as_str(), options)?;
                continue;
            }
            writer.start_file(part.name.as_str(), options)?;
            let data = if i == self.document_index {
                &document
            } else {
                &part.data
            };
            writer.write_all(data).map_err(|source| TemplateError::Io {
                path: PathBuf::from(&part.name),
                source,
            })?;
        }
        Ok(writer.finish()?.into_inner())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TemplateError> {
        let path = path.as_ref();
        let io_err = |source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, self.to_bytes()?).map_err(io_err)
    }
}

/// `<dir>/<run_id>_<variant>.docx`
pub fn output_path(dir: &Path, run_id: &str, variant: &str) -> PathBuf {
    dir.join(format!("{run_id}_{variant}.docx"))
}

/// Read a solution description: paragraph text for `.docx`, UTF-8 otherwise.
pub fn extract_input_text(path: &Path) -> Result<String, TemplateError> {
    let is_docx = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("docx"));
    if is_docx {
        return TemplateDocument::load(path)?.text();
    }
    std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
        path: path.to_path_buf(),
        source,
    })
}
