//! Safe unpacking of arXiv source bundles.
//!
//! An e-print download is one of: a gzipped tar, a plain tar, a gzipped
//! single `.tex` file, a bare `.tex` file, or a PDF. Detection is by magic
//! bytes, never by the declared content type.
//!
//! Every member is written into a private [`TempDir`]. Paths are validated
//! component by component before anything touches the filesystem: absolute
//! paths, `..` and drive prefixes are rejected, links are never created. The
//! workspace disappears when the [`ExtractedDocument`] is dropped.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::identifier::ItemIdentifier;
use crate::output::DocumentKind;
use crate::pipeline::pdf_text::PdfText;
use crate::pipeline::remote::RawArchive;
use flate2::read::GzDecoder;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, warn};

const TAR_MAGIC_OFFSET: usize = 257;

/// Conventional main-file names, tried in order.
const MAIN_NAMES: [&str; 4] = ["main.tex", "paper.tex", "manuscript.tex", "article.tex"];

/// Resource caps applied while unpacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionLimits {
    pub max_members: usize,
    pub max_bytes: u64,
}

impl Default for ExtractionLimits {
    fn default() -> Self {
        Self {
            max_members: 1000,
            max_bytes: 200 * 1024 * 1024,
        }
    }
}

impl ExtractionLimits {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_members: config.max_archive_members,
            max_bytes: config.max_extracted_bytes,
        }
    }
}

/// A non-fatal event recorded while unpacking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionWarning {
    PathTraversal { path: String },
    LinkSkipped { path: String },
    MemberCountCapped { limit: usize },
    ByteBudgetExceeded { path: String, size: u64 },
    Truncated { detail: String },
}

impl fmt::Display for ExtractionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PathTraversal { path } => write!(f, "rejected unsafe path `{path}`"),
            Self::LinkSkipped { path } => write!(f, "skipped link `{path}`"),
            Self::MemberCountCapped { limit } => {
                write!(f, "member limit of {limit} reached, remaining members ignored")
            }
            Self::ByteBudgetExceeded { path, size } => {
                write!(f, "skipped `{path}` ({size} bytes): byte budget exhausted")
            }
            Self::Truncated { detail } => write!(f, "archive truncated: {detail}"),
        }
    }
}

/// Role of a non-primary member, guessed from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxiliaryKind {
    Figure,
    Section,
    Bibliography,
    Style,
    Other,
}

impl AuxiliaryKind {
    fn from_path(path: &str) -> Self {
        match extension(path).as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "pdf" | "eps" | "ps" | "svg" | "tif" | "tiff" => {
                Self::Figure
            }
            "tex" | "ltx" => Self::Section,
            "bib" | "bbl" => Self::Bibliography,
            "sty" | "cls" | "bst" | "clo" => Self::Style,
            _ => Self::Other,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct PrimaryDocument {
    /// Path relative to the workspace root.
    pub name: String,
    pub kind: DocumentKind,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for PrimaryDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryDocument")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliaryFile {
    pub path: String,
    pub size: u64,
    pub kind: AuxiliaryKind,
}

/// An unpacked bundle: the chosen primary document, its companions, and the
/// workspace that holds them on disk.
#[derive(Debug)]
pub struct ExtractedDocument {
    identifier: ItemIdentifier,
    primary: PrimaryDocument,
    auxiliary: Vec<AuxiliaryFile>,
    warnings: Vec<ExtractionWarning>,
    workspace: TempDir,
    parsed_pdf: OnceCell<Result<Arc<PdfText>, String>>,
}

impl ExtractedDocument {
    pub fn identifier(&self) -> &ItemIdentifier {
        &self.identifier
    }

    pub fn primary(&self) -> &PrimaryDocument {
        &self.primary
    }

    pub fn kind(&self) -> DocumentKind {
        self.primary.kind
    }

    pub fn auxiliary(&self) -> &[AuxiliaryFile] {
        &self.auxiliary
    }

    pub fn warnings(&self) -> &[ExtractionWarning] {
        &self.warnings
    }

    /// Parse result of a PDF primary, shared by analysis and conversion.
    pub(crate) fn parsed_pdf(&self) -> &OnceCell<Result<Arc<PdfText>, String>> {
        &self.parsed_pdf
    }

    /// Workspace directory holding every extracted member.
    pub fn root(&self) -> &Path {
        self.workspace.path()
    }

    pub fn primary_path(&self) -> PathBuf {
        self.root().join(&self.primary.name)
    }

    /// Primary document plus auxiliary files.
    pub fn member_count(&self) -> usize {
        self.auxiliary.len() + 1
    }

    /// Relative paths of all members, primary first.
    pub fn member_paths(&self) -> Vec<&str> {
        std::iter::once(self.primary.name.as_str())
            .chain(self.auxiliary.iter().map(|a| a.path.as_str()))
            .collect()
    }

    /// Read a member by relative path. Paths that would leave the workspace
    /// are refused.
    pub fn read_member(&self, rel: &str) -> Result<Vec<u8>, PipelineError> {
        let rel = match classify_path(rel) {
            MemberPath::Safe(p) => p,
            _ => {
                return Err(PipelineError::Extraction {
                    identifier: self.identifier.to_string(),
                    reason: format!("refusing to read `{rel}`"),
                })
            }
        };
        fs::read(self.root().join(&rel)).map_err(|e| PipelineError::Extraction {
            identifier: self.identifier.to_string(),
            reason: format!("cannot read `{rel}`: {e}"),
        })
    }

    pub fn has_member(&self, rel: &str) -> bool {
        self.members().contains(rel)
    }

    /// Owned handle on the workspace, for readers that outlive a borrow.
    /// Reads fail once the document is dropped.
    pub fn members(&self) -> MemberFiles {
        MemberFiles {
            root: self.root().to_path_buf(),
        }
    }
}

/// Path-checked read access to an extracted workspace.
#[derive(Debug, Clone)]
pub struct MemberFiles {
    root: PathBuf,
}

impl MemberFiles {
    pub fn contains(&self, rel: &str) -> bool {
        match classify_path(rel) {
            MemberPath::Safe(p) => self.root.join(p).is_file(),
            _ => false,
        }
    }

    pub fn read(&self, rel: &str) -> Option<Vec<u8>> {
        match classify_path(rel) {
            MemberPath::Safe(p) => fs::read(self.root.join(p)).ok(),
            _ => None,
        }
    }
}

/// Unpack a downloaded archive.
pub fn extract(
    raw: &RawArchive,
    limits: &ExtractionLimits,
) -> Result<ExtractedDocument, PipelineError> {
    extract_bytes(&raw.identifier, &raw.bytes, limits)
}

/// Unpack raw bytes belonging to `id`.
pub fn extract_bytes(
    id: &ItemIdentifier,
    bytes: &[u8],
    limits: &ExtractionLimits,
) -> Result<ExtractedDocument, PipelineError> {
    let workspace = tempfile::Builder::new()
        .prefix("arxiv2md-")
        .tempdir()
        .map_err(|e| fail(id, format!("cannot create workspace: {e}")))?;
    let mut sink = MemberSink::new(workspace.path(), *limits);

    // ── Step 1: detect container format ──
    if is_gzip(bytes) {
        let mut head = Vec::with_capacity(512);
        GzDecoder::new(bytes)
            .take(512)
            .read_to_end(&mut head)
            .map_err(|e| fail(id, format!("corrupt gzip stream: {e}")))?;
        if is_tar(&head) {
            debug!("{}: gzipped tar", id);
            unpack_tar(id, GzDecoder::new(bytes), &mut sink)?;
        } else {
            let mut body = Vec::new();
            GzDecoder::new(bytes)
                .take(limits.max_bytes.saturating_add(1))
                .read_to_end(&mut body)
                .map_err(|e| fail(id, format!("corrupt gzip stream: {e}")))?;
            if body.len() as u64 > limits.max_bytes {
                return Err(fail(
                    id,
                    format!("decompressed stream exceeds {} bytes", limits.max_bytes),
                ));
            }
            debug!("{}: gzipped single file ({} bytes)", id, body.len());
            write_single(id, &body, &mut sink)?;
        }
    } else if is_tar(bytes) {
        debug!("{}: plain tar", id);
        unpack_tar(id, bytes, &mut sink)?;
    } else {
        if bytes.len() as u64 > limits.max_bytes {
            return Err(fail(id, format!("document exceeds {} bytes", limits.max_bytes)));
        }
        write_single(id, bytes, &mut sink)?;
    }

    let MemberSink {
        members, warnings, ..
    } = sink;

    if members.is_empty() {
        return Err(fail(id, "archive contained no usable members".to_string()));
    }

    // ── Step 2: choose the primary document ──
    let root = workspace.path();
    let (primary_name, kind) = choose_primary(&members, root)
        .ok_or_else(|| fail(id, "no LaTeX or PDF document in archive".to_string()))?;
    let primary_bytes = fs::read(root.join(&primary_name))
        .map_err(|e| fail(id, format!("cannot read `{primary_name}`: {e}")))?;

    let auxiliary = members
        .iter()
        .filter(|(path, _)| **path != primary_name)
        .map(|(path, &size)| AuxiliaryFile {
            path: path.clone(),
            size,
            kind: AuxiliaryKind::from_path(path),
        })
        .collect();

    debug!(
        "{}: primary `{}` ({}), {} members, {} warnings",
        id,
        primary_name,
        kind,
        members.len(),
        warnings.len()
    );

    Ok(ExtractedDocument {
        identifier: id.clone(),
        primary: PrimaryDocument {
            name: primary_name,
            kind,
            bytes: primary_bytes,
        },
        auxiliary,
        warnings,
        workspace,
        parsed_pdf: OnceCell::new(),
    })
}

// ── Unpacking ────────────────────────────────────────────────────────────

struct MemberSink<'a> {
    root: &'a Path,
    limits: ExtractionLimits,
    members: BTreeMap<String, u64>,
    total_bytes: u64,
    warnings: Vec<ExtractionWarning>,
}

impl<'a> MemberSink<'a> {
    fn new(root: &'a Path, limits: ExtractionLimits) -> Self {
        Self {
            root,
            limits,
            members: BTreeMap::new(),
            total_bytes: 0,
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, w: ExtractionWarning) {
        warn!("extract: {}", w);
        self.warnings.push(w);
    }

    fn record(&mut self, rel: String, size: u64) {
        if let Some(old) = self.members.insert(rel, size) {
            self.total_bytes -= old;
        }
        self.total_bytes += size;
    }
}

fn unpack_tar<R: Read>(
    id: &ItemIdentifier,
    reader: R,
    sink: &mut MemberSink<'_>,
) -> Result<(), PipelineError> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| fail(id, format!("corrupt tar archive: {e}")))?;

    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) if !sink.members.is_empty() => {
                sink.warn(ExtractionWarning::Truncated {
                    detail: e.to_string(),
                });
                break;
            }
            Err(e) => return Err(fail(id, format!("corrupt tar archive: {e}"))),
        };

        let raw_path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let entry_type = entry.header().entry_type();

        if entry_type.is_symlink() || entry_type.is_hard_link() {
            sink.warn(ExtractionWarning::LinkSkipped { path: raw_path });
            continue;
        }
        if !entry_type.is_file() {
            continue;
        }

        let rel = match classify_path(&raw_path) {
            MemberPath::Safe(rel) => rel,
            MemberPath::Hidden => {
                debug!("{}: skipping hidden member `{}`", id, raw_path);
                continue;
            }
            MemberPath::Unsafe => {
                sink.warn(ExtractionWarning::PathTraversal { path: raw_path });
                continue;
            }
        };

        if sink.members.len() >= sink.limits.max_members && !sink.members.contains_key(&rel) {
            let limit = sink.limits.max_members;
            sink.warn(ExtractionWarning::MemberCountCapped { limit });
            break;
        }

        let size = entry.size();
        let budget_used = sink.total_bytes - sink.members.get(&rel).copied().unwrap_or(0);
        if budget_used.saturating_add(size) > sink.limits.max_bytes {
            sink.warn(ExtractionWarning::ByteBudgetExceeded { path: rel, size });
            continue;
        }

        let dest = sink.root.join(&rel);
        let mut file = match create_member(&dest) {
            Ok(f) => f,
            Err(e) => {
                warn!("{}: cannot create `{}`: {}", id, rel, e);
                continue;
            }
        };

        match io::copy(&mut entry, &mut file) {
            Ok(written) if written == size => sink.record(rel, written),
            outcome => {
                drop(file);
                let _ = fs::remove_file(&dest);
                let detail = match outcome {
                    Ok(written) => format!("`{rel}` ended after {written} of {size} bytes"),
                    Err(e) => format!("`{rel}`: {e}"),
                };
                if sink.members.is_empty() {
                    return Err(fail(id, format!("corrupt tar archive: {detail}")));
                }
                sink.warn(ExtractionWarning::Truncated { detail });
                break;
            }
        }
    }
    Ok(())
}

fn create_member(dest: &Path) -> io::Result<fs::File> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::File::create(dest)
}

fn write_single(
    id: &ItemIdentifier,
    bytes: &[u8],
    sink: &mut MemberSink<'_>,
) -> Result<(), PipelineError> {
    let ext = if bytes.starts_with(b"%PDF") {
        "pdf"
    } else if looks_like_latex(bytes) {
        "tex"
    } else {
        return Err(fail(id, "unrecognised source format".to_string()));
    };
    let name = format!("{}.{}", id.file_stem(), ext);
    fs::write(sink.root.join(&name), bytes)
        .map_err(|e| fail(id, format!("cannot write `{name}`: {e}")))?;
    sink.record(name, bytes.len() as u64);
    Ok(())
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&[0x1f, 0x8b])
}

fn is_tar(bytes: &[u8]) -> bool {
    bytes.get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5) == Some(b"ustar".as_slice())
}

fn looks_like_latex(bytes: &[u8]) -> bool {
    let text = String::from_utf8_lossy(bytes);
    text.contains("\\documentclass")
        || text.contains("\\documentstyle")
        || text.contains("\\begin{document}")
        || text.contains("\\input")
}

fn has_preamble(bytes: &[u8]) -> bool {
    let text = String::from_utf8_lossy(bytes);
    text.contains("\\documentclass") || text.contains("\\documentstyle")
}

// ── Path validation ──────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum MemberPath {
    Safe(String),
    Hidden,
    Unsafe,
}

fn classify_path(raw: &str) -> MemberPath {
    if raw.starts_with('/') || raw.starts_with('\\') {
        return MemberPath::Unsafe;
    }
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return MemberPath::Unsafe;
    }

    let normalized = raw.replace('\\', "/");
    let mut parts = Vec::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => return MemberPath::Unsafe,
            p if p.contains(':') => return MemberPath::Unsafe,
            p => parts.push(p),
        }
    }

    if parts.is_empty() || parts.iter().any(|p| p.starts_with('.') || p.starts_with("__")) {
        return MemberPath::Hidden;
    }
    MemberPath::Safe(parts.join("/"))
}

// ── Primary selection ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    path: &'a str,
    size: u64,
    depth: usize,
}

impl<'a> Candidate<'a> {
    fn new(path: &'a str, size: u64) -> Self {
        Self {
            path,
            size,
            depth: path.matches('/').count(),
        }
    }

    fn file_name(&self) -> String {
        self.path.rsplit('/').next().unwrap_or(self.path).to_lowercase()
    }
}

fn choose_primary(members: &BTreeMap<String, u64>, root: &Path) -> Option<(String, DocumentKind)> {
    let tex: Vec<Candidate<'_>> = members
        .iter()
        .filter(|(p, _)| matches!(extension(p).as_str(), "tex" | "ltx"))
        .map(|(p, &s)| Candidate::new(p, s))
        .collect();

    if !tex.is_empty() {
        let preamble = |path: &str| {
            fs::read(root.join(path))
                .map(|b| has_preamble(&b))
                .unwrap_or(false)
        };
        return select_primary(&tex, &preamble).map(|p| (p, DocumentKind::Latex));
    }

    let pdf: Vec<Candidate<'_>> = members
        .iter()
        .filter(|(p, _)| extension(p) == "pdf")
        .map(|(p, &s)| Candidate::new(p, s))
        .collect();
    select_primary(&pdf, &|_| false).map(|p| (p, DocumentKind::Pdf))
}

/// Deterministic main-document choice:
/// conventional names, then a lone root candidate, then the largest file.
/// Files carrying a `\documentclass` preamble are preferred for the last
/// two rules when any exist.
fn select_primary(candidates: &[Candidate<'_>], has_preamble: &dyn Fn(&str) -> bool) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }

    let shallowest = |matches: Vec<&Candidate<'_>>| {
        matches
            .into_iter()
            .min_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.path.cmp(b.path)))
            .map(|c| c.path.to_string())
    };

    for name in MAIN_NAMES {
        let hits: Vec<_> = candidates.iter().filter(|c| c.file_name() == name).collect();
        if let Some(path) = shallowest(hits) {
            return Some(path);
        }
    }
    let hits: Vec<_> = candidates
        .iter()
        .filter(|c| {
            let name = c.file_name();
            name.contains("main") && name.ends_with(".tex")
        })
        .collect();
    if let Some(path) = shallowest(hits) {
        return Some(path);
    }

    let with_preamble: Vec<Candidate<'_>> = candidates
        .iter()
        .copied()
        .filter(|c| has_preamble(c.path))
        .collect();
    let pool = if with_preamble.is_empty() {
        candidates.to_vec()
    } else {
        with_preamble
    };

    let at_root: Vec<&Candidate<'_>> = pool.iter().filter(|c| c.depth == 0).collect();
    if at_root.len() == 1 {
        return Some(at_root[0].path.to_string());
    }

    let field: Vec<&Candidate<'_>> = if at_root.is_empty() {
        pool.iter().collect()
    } else {
        at_root
    };
    field
        .into_iter()
        .min_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(b.path)))
        .map(|c| c.path.to_string())
}

fn extension(path: &str) -> String {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

fn fail(id: &ItemIdentifier, reason: String) -> PipelineError {
    PipelineError::Extraction {
        identifier: id.to_string(),
        reason,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tar::{EntryType, Header};

    /// Build a tar with raw member names, bypassing the builder's own path
    /// checks so hostile names can be produced.
    pub(crate) fn tar_with(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in members {
            let mut header = Header::new_gnu();
            let raw = name.as_bytes();
            header.as_old_mut().name[..raw.len()].copy_from_slice(raw);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(EntryType::Regular);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub(crate) fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(bytes).unwrap();
        enc.finish().unwrap()
    }

    fn id() -> ItemIdentifier {
        ItemIdentifier::parse("2301.00001").unwrap()
    }

    const MAIN: &[u8] = b"\\documentclass{article}\\begin{document}Hi\\end{document}";

    #[test]
    fn unpacks_gzipped_tar_and_picks_main() {
        let tar = tar_with(&[
            ("./sections/intro.tex", b"Intro text that is longer than main"),
            ("./main.tex", MAIN),
            ("./figs/plot.png", b"\x89PNG"),
            ("./refs.bib", b"@article{x}"),
        ]);
        let doc = extract_bytes(&id(), &gzip(&tar), &ExtractionLimits::default()).unwrap();
        assert_eq!(doc.primary().name, "main.tex");
        assert_eq!(doc.kind(), DocumentKind::Latex);
        assert_eq!(doc.member_count(), 4);
        assert!(doc.warnings().is_empty());

        let kinds: Vec<_> = doc.auxiliary().iter().map(|a| (a.path.as_str(), a.kind)).collect();
        assert!(kinds.contains(&("figs/plot.png", AuxiliaryKind::Figure)));
        assert!(kinds.contains(&("sections/intro.tex", AuxiliaryKind::Section)));
        assert!(kinds.contains(&("refs.bib", AuxiliaryKind::Bibliography)));
        assert_eq!(doc.read_member("sections/intro.tex").unwrap(), b"Intro text that is longer than main");
    }

    #[test]
    fn traversal_is_rejected_and_recorded() {
        let tar = tar_with(&[("../../etc/passwd", b"root:x:0:0"), ("paper.tex", MAIN)]);
        let doc = extract_bytes(&id(), &tar, &ExtractionLimits::default()).unwrap();
        assert_eq!(doc.member_count(), 1);
        assert_eq!(
            doc.warnings(),
            &[ExtractionWarning::PathTraversal {
                path: "../../etc/passwd".into()
            }]
        );
        assert!(doc.read_member("../../etc/passwd").is_err());
        assert!(!doc.root().join("etc").exists());
    }

    #[test]
    fn absolute_paths_are_rejected() {
        let tar = tar_with(&[("/tmp/evil.tex", b"x"), ("C:/evil.tex", b"x"), ("main.tex", MAIN)]);
        let doc = extract_bytes(&id(), &tar, &ExtractionLimits::default()).unwrap();
        assert_eq!(doc.warnings().len(), 2);
        assert_eq!(doc.member_count(), 1);
    }

    #[test]
    fn links_are_skipped() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_path("link.tex").unwrap();
        header.set_entry_type(EntryType::Symlink);
        header.set_link_name("/etc/passwd").unwrap();
        header.set_size(0);
        header.set_cksum();
        builder.append(&header, io::empty()).unwrap();
        let mut header = Header::new_gnu();
        header.set_path("main.tex").unwrap();
        header.set_size(MAIN.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append(&header, MAIN).unwrap();
        let tar = builder.into_inner().unwrap();

        let doc = extract_bytes(&id(), &tar, &ExtractionLimits::default()).unwrap();
        assert_eq!(
            doc.warnings(),
            &[ExtractionWarning::LinkSkipped {
                path: "link.tex".into()
            }]
        );
        assert!(!doc.root().join("link.tex").exists());
    }

    #[test]
    fn every_member_rejected_is_an_error() {
        let tar = tar_with(&[("../a.tex", MAIN), ("/b.tex", MAIN)]);
        let err = extract_bytes(&id(), &tar, &ExtractionLimits::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Extraction { .. }));
    }

    #[test]
    fn member_count_is_capped() {
        let names: Vec<String> = (0..10_000).map(|i| format!("f{i:05}.txt")).collect();
        let mut members: Vec<(&str, &[u8])> = vec![("main.tex", MAIN)];
        members.extend(names.iter().map(|n| (n.as_str(), b"x".as_slice())));
        let tar = gzip(&tar_with(&members));

        let limits = ExtractionLimits {
            max_members: 500,
            ..ExtractionLimits::default()
        };
        let doc = extract_bytes(&id(), &tar, &limits).unwrap();
        assert!(doc.member_count() <= 500, "extracted {}", doc.member_count());
        assert!(doc
            .warnings()
            .contains(&ExtractionWarning::MemberCountCapped { limit: 500 }));
        let on_disk = fs::read_dir(doc.root()).unwrap().count();
        assert!(on_disk <= 500);
    }

    #[test]
    fn byte_budget_skips_large_members() {
        let big = vec![b'a'; 4096];
        let tar = tar_with(&[("main.tex", MAIN), ("data.bin", &big), ("small.txt", b"ok")]);
        let limits = ExtractionLimits {
            max_bytes: 1024,
            ..ExtractionLimits::default()
        };
        let doc = extract_bytes(&id(), &tar, &limits).unwrap();
        assert!(doc.has_member("small.txt"));
        assert!(!doc.has_member("data.bin"));
        assert!(matches!(
            doc.warnings()[0],
            ExtractionWarning::ByteBudgetExceeded { size: 4096, .. }
        ));
    }

    #[test]
    fn oversized_gzip_single_file_is_refused() {
        let mut body = MAIN.to_vec();
        body.extend(vec![b' '; 8192]);
        let limits = ExtractionLimits {
            max_bytes: 1024,
            ..ExtractionLimits::default()
        };
        assert!(extract_bytes(&id(), &gzip(&body), &limits).is_err());
    }

    #[test]
    fn hidden_members_are_skipped_silently() {
        let tar = tar_with(&[("__MACOSX/._main.tex", b"junk"), (".git/config", b"x"), ("ms.tex", MAIN)]);
        let doc = extract_bytes(&id(), &tar, &ExtractionLimits::default()).unwrap();
        assert_eq!(doc.primary().name, "ms.tex");
        assert_eq!(doc.member_count(), 1);
        assert!(doc.warnings().is_empty());
    }

    #[test]
    fn truncated_tar_keeps_good_members() {
        let long = vec![b'z'; 4096];
        let tar = tar_with(&[("main.tex", MAIN), ("appendix.tex", &long)]);
        let cut = &tar[..tar.len() - 3000];
        let doc = extract_bytes(&id(), cut, &ExtractionLimits::default()).unwrap();
        assert_eq!(doc.primary().name, "main.tex");
        assert!(doc
            .warnings()
            .iter()
            .any(|w| matches!(w, ExtractionWarning::Truncated { .. })));
        assert!(!doc.has_member("appendix.tex"));
    }

    #[test]
    fn single_documents_are_named_after_the_identifier() {
        let doc = extract_bytes(&id(), &gzip(MAIN), &ExtractionLimits::default()).unwrap();
        assert_eq!(doc.primary().name, "2301.00001.tex");

        let legacy = ItemIdentifier::parse("hep-th/9901001").unwrap();
        let doc = extract_bytes(&legacy, b"%PDF-1.4 fake", &ExtractionLimits::default()).unwrap();
        assert_eq!(doc.primary().name, "hep-th_9901001.pdf");
        assert_eq!(doc.kind(), DocumentKind::Pdf);
    }

    #[test]
    fn unknown_bytes_are_an_error() {
        let err = extract_bytes(&id(), b"<html>nope</html>", &ExtractionLimits::default()).unwrap_err();
        assert!(err.to_string().contains("unrecognised"), "got: {err}");
    }

    #[test]
    fn pdf_only_archive_selects_pdf() {
        let tar = tar_with(&[("paper.pdf", b"%PDF-1.4"), ("fig.png", b"png")]);
        let doc = extract_bytes(&id(), &tar, &ExtractionLimits::default()).unwrap();
        assert_eq!(doc.primary().name, "paper.pdf");
        assert_eq!(doc.kind(), DocumentKind::Pdf);
    }

    #[test]
    fn classify_path_cases() {
        assert_eq!(classify_path("./a/b.tex"), MemberPath::Safe("a/b.tex".into()));
        assert_eq!(classify_path("a/../../b"), MemberPath::Unsafe);
        assert_eq!(classify_path("..\\..\\b"), MemberPath::Unsafe);
        assert_eq!(classify_path("D:\\x"), MemberPath::Unsafe);
        assert_eq!(classify_path("/abs"), MemberPath::Unsafe);
        assert_eq!(classify_path("a/.hidden"), MemberPath::Hidden);
        assert_eq!(classify_path("./"), MemberPath::Hidden);
    }

    fn pick(cands: &[(&str, u64)], preamble: &[&str]) -> Option<String> {
        let cands: Vec<Candidate<'_>> = cands.iter().map(|&(p, s)| Candidate::new(p, s)).collect();
        select_primary(&cands, &|p| preamble.contains(&p))
    }

    #[test]
    fn selection_prefers_conventional_names_in_order() {
        assert_eq!(
            pick(&[("paper.tex", 10), ("sub/main.tex", 5), ("x.tex", 99)], &[]),
            Some("sub/main.tex".into())
        );
        assert_eq!(
            pick(&[("a/main.tex", 1), ("b/c/main.tex", 1), ("a/MAIN.tex", 1)], &[]),
            Some("a/MAIN.tex".into())
        );
        assert_eq!(
            pick(&[("mymain.tex", 1), ("manuscript.tex", 1)], &[]),
            Some("manuscript.tex".into())
        );
        assert_eq!(pick(&[("mainpaper.tex", 1), ("z.tex", 100)], &[]), Some("mainpaper.tex".into()));
    }

    #[test]
    fn selection_falls_back_to_root_then_size() {
        assert_eq!(
            pick(&[("ms.tex", 10), ("sec/a.tex", 100)], &[]),
            Some("ms.tex".into())
        );
        assert_eq!(
            pick(&[("a.tex", 10), ("b.tex", 30), ("sec/c.tex", 100)], &[]),
            Some("b.tex".into())
        );
        assert_eq!(
            pick(&[("x/b.tex", 30), ("y/a.tex", 30)], &[]),
            Some("x/b.tex".into())
        );
        assert_eq!(
            pick(&[("b.tex", 30), ("a.tex", 30)], &[]),
            Some("a.tex".into())
        );
    }

    #[test]
    fn selection_prefers_files_with_preamble() {
        assert_eq!(
            pick(&[("intro.tex", 500), ("ms.tex", 100)], &["ms.tex"]),
            Some("ms.tex".into())
        );
    }
}
