//! On-disk artifacts for converted papers.
//!
//! ```text
//! {output_root}/
//!   source/{stem}/…             extracted members + manifest.json
//!   markdown/{stem}/{stem}.md   YAML front matter + markup
//!   metadata/{stem}.json        PaperMetadata + quality + method
//! ```

use crate::error::PipelineError;
use crate::identifier::ItemIdentifier;
use crate::output::{
    ConversionIssue, ConversionMethod, ConversionResult, DocumentKind, PaperMetadata,
    QualityReport,
};
use crate::pipeline::extract::{AuxiliaryKind, ExtractedDocument};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

const SOURCE_DIR: &str = "source";
const MARKDOWN_DIR: &str = "markdown";
const METADATA_DIR: &str = "metadata";

/// Where one item's artifacts live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub source_dir: PathBuf,
    pub manifest: PathBuf,
    pub markdown: PathBuf,
    pub metadata: PathBuf,
}

/// `manifest.json` beside the extracted source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceManifest {
    pub identifier: String,
    pub primary: String,
    pub kind: DocumentKind,
    pub members: Vec<ManifestMember>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMember {
    pub path: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<AuxiliaryKind>,
}

/// `metadata/{stem}.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(flatten)]
    pub metadata: PaperMetadata,
    pub quality: QualityReport,
    pub method: ConversionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub source_kind: DocumentKind,
    pub issues: Vec<ConversionIssue>,
}

impl From<&ConversionResult> for MetadataRecord {
    fn from(r: &ConversionResult) -> Self {
        Self {
            metadata: r.metadata.clone(),
            quality: r.quality.clone(),
            method: r.method,
            tool: r.tool.clone(),
            source_kind: r.source_kind,
            issues: r.issues.clone(),
        }
    }
}

/// Writes and prunes the artifact tree under one root.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, id: &ItemIdentifier) -> ArtifactPaths {
        let stem = id.file_stem();
        let source_dir = self.root.join(SOURCE_DIR).join(&stem);
        ArtifactPaths {
            manifest: source_dir.join("manifest.json"),
            source_dir,
            markdown: self
                .root
                .join(MARKDOWN_DIR)
                .join(&stem)
                .join(format!("{stem}.md")),
            metadata: self.root.join(METADATA_DIR).join(format!("{stem}.json")),
        }
    }

    /// Write all three artifacts for a fresh conversion. Previous artifacts
    /// of the same item are replaced.
    pub async fn write(
        &self,
        doc: &ExtractedDocument,
        result: &ConversionResult,
    ) -> Result<ArtifactPaths, PipelineError> {
        let paths = self.paths(&result.identifier);

        // ── Step 1: source members ──
        match tokio::fs::remove_dir_all(&paths.source_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(PipelineError::OutputWriteFailed {
                    path: paths.source_dir.clone(),
                    source,
                })
            }
        }
        let mut members = Vec::with_capacity(doc.member_count());
        for (i, rel) in doc.member_paths().into_iter().enumerate() {
            let dest = paths.source_dir.join(rel);
            create_parent(&dest).await?;
            let size = tokio::fs::copy(doc.root().join(rel), &dest)
                .await
                .map_err(|source| PipelineError::OutputWriteFailed {
                    path: dest.clone(),
                    source,
                })?;
            let kind = if i == 0 {
                None
            } else {
                doc.auxiliary().get(i - 1).map(|a| a.kind)
            };
            members.push(ManifestMember {
                path: rel.to_string(),
                size,
                kind,
            });
        }
        let manifest = SourceManifest {
            identifier: result.identifier.to_string(),
            primary: doc.primary().name.clone(),
            kind: doc.kind(),
            members,
            warnings: doc.warnings().iter().map(ToString::to_string).collect(),
        };
        write_json(&paths.manifest, &manifest).await?;

        // ── Step 2: markdown with front matter ──
        let mut document = front_matter(result);
        document.push_str(&result.markdown);
        write_atomically(&paths.markdown, document.as_bytes()).await?;

        // ── Step 3: metadata record ──
        write_json(&paths.metadata, &MetadataRecord::from(result)).await?;

        debug!(
            "{}: artifacts written under {}",
            result.identifier,
            self.root.display()
        );
        Ok(paths)
    }

    /// Remove per-item artifacts last modified more than `age` ago.
    /// Returns how many entries were removed.
    pub async fn cleanup_older_than(&self, age: Duration) -> Result<usize, PipelineError> {
        let root = self.root.clone();
        let cutoff = SystemTime::now().checked_sub(age).unwrap_or(SystemTime::UNIX_EPOCH);
        let removed = tokio::task::spawn_blocking(move || {
            let mut removed = 0;
            for section in [SOURCE_DIR, MARKDOWN_DIR, METADATA_DIR] {
                removed += prune_section(&root.join(section), cutoff)?;
            }
            Ok::<_, PipelineError>(removed)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("cleanup task: {e}")))??;
        info!("removed {} artifact entries", removed);
        Ok(removed)
    }
}

/// YAML front matter. Strings are emitted as JSON literals, which YAML
/// reads as double-quoted scalars.
pub fn front_matter(result: &ConversionResult) -> String {
    let meta = &result.metadata;
    let quote = |s: &str| serde_json::Value::String(s.to_string()).to_string();
    let mut yaml = String::from("---\n");
    yaml.push_str(&format!("arxiv_id: {}\n", quote(result.identifier.as_str())));
    if let Some(ref t) = meta.title {
        yaml.push_str(&format!("title: {}\n", quote(t)));
    }
    if !meta.authors.is_empty() {
        yaml.push_str("authors:\n");
        for a in &meta.authors {
            yaml.push_str(&format!("  - {}\n", quote(a)));
        }
    }
    if !meta.categories.is_empty() {
        let cats: Vec<String> = meta.categories.iter().map(|c| quote(c)).collect();
        yaml.push_str(&format!("categories: [{}]\n", cats.join(", ")));
    }
    if let Some(ref d) = meta.submitted {
        yaml.push_str(&format!("submitted: {}\n", quote(d)));
    }
    if !meta.keywords.is_empty() {
        let kws: Vec<String> = meta.keywords.iter().map(|k| quote(k)).collect();
        yaml.push_str(&format!("keywords: [{}]\n", kws.join(", ")));
    }
    yaml.push_str(&format!("source: {}\n", result.source_kind));
    yaml.push_str(&format!("method: {}\n", result.method));
    if let Some(ref tool) = result.tool {
        yaml.push_str(&format!("tool: {}\n", quote(tool)));
    }
    yaml.push_str(&format!("quality: {:.3}\n", result.quality.score));
    yaml.push_str("---\n\n");
    yaml
}

fn write_error(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
    move |source| PipelineError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    }
}

async fn create_parent(path: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(write_error(parent))?;
    }
    Ok(())
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PipelineError> {
    let mut json = serde_json::to_vec_pretty(value)
        .map_err(|e| PipelineError::Internal(format!("encode {}: {e}", path.display())))?;
    json.push(b'\n');
    write_atomically(path, &json).await
}

/// Temp file + rename, so readers never see a partial artifact.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    create_parent(path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));
    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(write_error(path))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(write_error(path))
}

fn prune_section(dir: &Path, cutoff: SystemTime) -> Result<usize, PipelineError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(source) => return Err(write_error(dir)(source)),
    };
    let mut removed = 0;
    for entry in entries {
        let path = entry.map_err(write_error(dir))?.path();
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map_err(write_error(&path))?;
        if modified > cutoff {
            continue;
        }
        let outcome = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        outcome.map_err(write_error(&path))?;
        removed += 1;
    }
    Ok(removed)
}
