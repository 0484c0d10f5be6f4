//! Built-in LaTeX → Markdown transformer.
//!
//! This is the fallback when pandoc is unavailable or fails. It is not a TeX
//! engine: it scans the source once, brace-aware, and maps the constructs
//! papers actually use onto Markdown. Anything it does not understand keeps
//! its visible text and is recorded as an issue, so quality scoring can
//! account for it.
//!
//! Inline and display math are copied verbatim (display math normalised to
//! `$$` blocks); Markdown renderers with MathJax/KaTeX handle the rest.

use crate::output::{ConversionIssue, IssueKind, IssueLog};
use crate::pipeline::extract::{ExtractedDocument, MemberFiles};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;

const MAX_INPUT_DEPTH: usize = 8;
const MAX_MACRO_DEPTH: usize = 16;
/// Macro expansions per document before further uses are left unexpanded.
const MAX_MACRO_EXPANSIONS: usize = 10_000;
/// Bytes of macro bodies substituted per document.
const MAX_EXPANDED_BYTES: usize = 8 * 1024 * 1024;
/// Nested argument and environment renders before the rest is flattened.
const MAX_RENDER_DEPTH: usize = 32;

/// Environments whose bodies are copied without interpretation.
const VERBATIM_ENVS: [&str; 8] = [
    "verbatim", "verbatim*", "Verbatim", "lstlisting", "minted", "alltt", "comment", "filecontents",
];

const MATH_ENVS: [&str; 9] = [
    "equation", "displaymath", "math", "align", "alignat", "flalign", "eqnarray", "gather", "multline",
];

const TABLE_ENVS: [&str; 7] = [
    "tabular", "tabular*", "tabularx", "longtable", "tabu", "tabulary", "array",
];

const THEOREM_ENVS: [&str; 18] = [
    "theorem", "lemma", "proposition", "corollary", "definition", "remark", "example",
    "conjecture", "claim", "assumption", "observation", "fact", "note", "problem", "exercise",
    "hypothesis", "notation", "question",
];

/// Environments that only affect layout: their content is rendered as-is.
/// The second field is the number of leading `{}` arguments to discard.
const LAYOUT_ENVS: [(&str, usize); 20] = [
    ("center", 0), ("flushleft", 0), ("flushright", 0), ("minipage", 1), ("small", 0),
    ("footnotesize", 0), ("scriptsize", 0), ("landscape", 0), ("sloppypar", 0), ("spacing", 1),
    ("singlespace", 0), ("onehalfspace", 0), ("doublespace", 0), ("samepage", 0),
    ("raggedright", 0), ("multicols", 1), ("adjustbox", 1), ("titlepage", 0), ("appendices", 0),
    ("document", 0),
];

const DROPPED_ENVS: [&str; 4] = ["keywords", "IEEEkeywords", "CCSXML", "frontmatter"];

const DIAGRAM_ENVS: [&str; 4] = ["tikzpicture", "picture", "pgfpicture", "tikzcd"];

/// Commands dropped silently: (name, optional args, required args).
const DROPPED_COMMANDS: [(&str, usize, usize); 42] = [
    ("label", 0, 1), ("vspace", 0, 1), ("hspace", 0, 1), ("pagestyle", 0, 1),
    ("thispagestyle", 0, 1), ("setcounter", 0, 2), ("addtocounter", 0, 2), ("setlength", 0, 2),
    ("addtolength", 0, 2), ("usepackage", 1, 1), ("RequirePackage", 1, 1),
    ("documentclass", 1, 1), ("graphicspath", 0, 1), ("bibliographystyle", 0, 1),
    ("bibliography", 0, 1), ("input", 0, 1), ("include", 0, 1), ("fontsize", 0, 2),
    ("color", 1, 1), ("phantom", 0, 1), ("hphantom", 0, 1), ("vphantom", 0, 1),
    ("newtheorem", 2, 2), ("crefname", 0, 3), ("Crefname", 0, 3), ("DeclareMathOperator", 0, 2),
    ("title", 1, 1), ("author", 1, 1), ("date", 0, 1), ("thanks", 0, 1), ("affiliation", 1, 1),
    ("affil", 1, 1), ("institute", 0, 1), ("email", 0, 1), ("address", 0, 1),
    ("keywords", 0, 1), ("icmltitle", 0, 1), ("icmlauthor", 0, 2), ("icmlaffiliation", 0, 2),
    ("icmlcorrespondingauthor", 0, 2), ("hypersetup", 0, 1), ("definecolor", 0, 3),
];

const SILENT_COMMANDS: [&str; 58] = [
    "centering", "raggedright", "raggedleft", "noindent", "indent", "small", "footnotesize",
    "scriptsize", "tiny", "large", "Large", "LARGE", "huge", "Huge", "normalsize", "bfseries",
    "itshape", "ttfamily", "rmfamily", "sffamily", "scshape", "normalfont", "em", "bf", "it",
    "rm", "tt", "sc", "sl", "clearpage", "newpage", "cleardoublepage", "pagebreak",
    "nopagebreak", "hfill", "vfill", "hline", "toprule", "midrule", "bottomrule", "protect",
    "relax", "smallskip", "medskip", "bigskip", "maketitle", "frontmatter", "mainmatter",
    "backmatter", "nobreak", "allowbreak", "onecolumn", "sloppy", "appendix",
    "tableofcontents", "selectfont", "balance", "footnotemark",
];

/// Wrapper commands whose visible text is one argument:
/// (name, optional args, required args, index of the kept required arg).
const WRAPPER_COMMANDS: [(&str, usize, usize, usize); 24] = [
    ("textsc", 0, 1, 0), ("textrm", 0, 1, 0), ("textsf", 0, 1, 0), ("textup", 0, 1, 0),
    ("textmd", 0, 1, 0), ("textnormal", 0, 1, 0), ("mbox", 0, 1, 0), ("hbox", 0, 1, 0),
    ("text", 0, 1, 0), ("underline", 0, 1, 0), ("uline", 0, 1, 0), ("makebox", 2, 1, 0),
    ("fbox", 0, 1, 0), ("framebox", 2, 1, 0), ("textcolor", 0, 2, 1), ("colorbox", 0, 2, 1),
    ("hyperlink", 0, 2, 1), ("hypertarget", 0, 2, 1), ("resizebox", 0, 3, 2),
    ("scalebox", 0, 2, 1), ("rotatebox", 1, 2, 1), ("parbox", 3, 2, 1), ("multirow", 1, 3, 2),
    ("foreignlanguage", 1, 2, 1),
];

const CITE_COMMANDS: [&str; 11] = [
    "cite", "citep", "citet", "citealp", "citealt", "citeauthor", "citeyear", "parencite",
    "textcite", "autocite", "footcite",
];

const REF_COMMANDS: [&str; 7] = ["ref", "autoref", "cref", "Cref", "pageref", "nameref", "vref"];

/// Result of the built-in transformer, before post-processing.
#[derive(Debug, Clone, PartialEq)]
pub struct LatexOutput {
    pub markdown: String,
    pub title: Option<String>,
    pub issues: Vec<ConversionIssue>,
}

/// Owned inputs for converting a bundle's primary document, so the work
/// can move onto a blocking thread.
#[derive(Debug, Clone)]
pub struct LatexJob {
    primary: String,
    source: String,
    members: MemberFiles,
}

impl LatexJob {
    pub fn new(doc: &ExtractedDocument) -> Self {
        Self {
            primary: doc.primary().name.clone(),
            source: String::from_utf8_lossy(&doc.primary().bytes).into_owned(),
            members: doc.members(),
        }
    }

    pub fn convert(&self) -> LatexOutput {
        let resolve = member_resolver(&self.primary, &self.members);
        convert_source(&self.source, &resolve, Some(&bbl_fallback(&self.primary)))
    }

    /// Primary source with comments stripped and `\input` files inlined.
    pub fn expanded_source(&self) -> String {
        let resolve = member_resolver(&self.primary, &self.members);
        let mut log = IssueLog::default();
        let text = expand_inputs(&strip_comments(&self.source), &resolve, 0, &mut log);
        expand_bibliography(&text, &resolve, Some(&bbl_fallback(&self.primary)))
    }
}

/// Convert LaTeX text; `resolve` maps an `\input` target to file contents.
pub fn convert_source(
    source: &str,
    resolve: &dyn Fn(&str) -> Option<String>,
    bbl_fallback: Option<&str>,
) -> LatexOutput {
    let mut issues = IssueLog::default();
    let text = expand_inputs(&strip_comments(source), resolve, 0, &mut issues);
    let text = expand_bibliography(&text, resolve, bbl_fallback);
    let mut renderer = Renderer::new(collect_macros(&text));
    renderer.issues = issues;

    let title = command_args(&text, "title")
        .into_iter()
        .chain(command_args(&text, "icmltitle"))
        .map(|t| to_plain_text(&t))
        .find(|t| !t.is_empty());

    let body = document_body(&text);
    let rendered = renderer.render(body);

    let mut markdown = String::with_capacity(rendered.len() + 128);
    if let Some(t) = &title {
        markdown.push_str("# ");
        markdown.push_str(t);
        markdown.push_str("\n\n");
    }
    markdown.push_str(&RE_BLANK_RUN.replace_all(rendered.trim(), "\n\n"));
    markdown.push('\n');

    LatexOutput {
        markdown,
        title,
        issues: renderer.issues.into_issues(),
    }
}

static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t]*(?:\n[ \t]*)+\n").unwrap());

fn member_resolver<'a>(
    primary: &str,
    members: &'a MemberFiles,
) -> impl Fn(&str) -> Option<String> + 'a {
    let base_dir = primary
        .rsplit_once('/')
        .map(|(dir, _)| dir.to_string())
        .unwrap_or_default();
    move |name: &str| {
        let name = name.trim();
        let mut tries = Vec::with_capacity(4);
        for stem in [
            if base_dir.is_empty() { name.to_string() } else { format!("{base_dir}/{name}") },
            name.to_string(),
        ] {
            tries.push(stem.clone());
            if !stem.ends_with(".tex") {
                tries.push(format!("{stem}.tex"));
            }
        }
        tries
            .iter()
            .find(|p| members.contains(p))
            .and_then(|p| members.read(p))
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn bbl_fallback(name: &str) -> String {
    let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
    format!("{stem}.bbl")
}

// ── Preprocessing ────────────────────────────────────────────────────────

/// Drop `%` comments and leading indentation outside verbatim-like
/// environments. A comment swallows its line ending, as in TeX.
pub(crate) fn strip_comments(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut verbatim: Option<&str> = None;

    for line in src.lines() {
        if let Some(env) = verbatim {
            out.push_str(line);
            out.push('\n');
            if line.contains(&format!("\\end{{{env}}}")) {
                verbatim = None;
            }
            continue;
        }

        let trimmed = line.trim_start();
        match unescaped_percent(trimmed) {
            Some(i) => out.push_str(&trimmed[..i]),
            None => {
                out.push_str(trimmed);
                out.push('\n');
            }
        }

        verbatim = VERBATIM_ENVS.iter().copied().find(|env| {
            let open = format!("\\begin{{{env}}}");
            trimmed
                .find(&open)
                .is_some_and(|at| !trimmed[at..].contains(&format!("\\end{{{env}}}")))
        });
    }
    out
}

fn unescaped_percent(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut backslashes = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'\\' => backslashes += 1,
            b'%' if backslashes % 2 == 0 => return Some(i),
            _ => backslashes = 0,
        }
        if b != b'\\' {
            backslashes = 0;
        }
    }
    None
}

static RE_INPUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\(?:input|include|subfile)(?:\s*\{([^}]*)\}|\s+([A-Za-z0-9_./-]+))").unwrap()
});

fn expand_inputs(
    text: &str,
    resolve: &dyn Fn(&str) -> Option<String>,
    depth: usize,
    issues: &mut IssueLog,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in RE_INPUT.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let Some(target) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        out.push_str(&text[last..whole.start()]);
        last = whole.end();

        let target = target.as_str().trim();
        if depth >= MAX_INPUT_DEPTH {
            issues.record(IssueKind::MissingInput, target);
            continue;
        }
        match resolve(target) {
            Some(content) => {
                debug!("inlining `{}`", target);
                let content = strip_comments(&content);
                out.push_str(&expand_inputs(&content, resolve, depth + 1, issues));
                out.push('\n');
            }
            None => issues.record(IssueKind::MissingInput, target),
        }
    }
    out.push_str(&text[last..]);
    out
}

static RE_BIBLIOGRAPHY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\bibliography\s*\{([^}]*)\}").unwrap());

/// Inline `\bibliography{x}` from `x.bbl`, or from the main file's `.bbl`.
fn expand_bibliography(
    text: &str,
    resolve: &dyn Fn(&str) -> Option<String>,
    fallback: Option<&str>,
) -> String {
    RE_BIBLIOGRAPHY
        .replace(text, |caps: &regex::Captures<'_>| {
            let named = caps[1]
                .split(',')
                .map(|n| format!("{}.bbl", n.trim().trim_end_matches(".bib")))
                .find_map(|n| resolve(&n));
            named
                .or_else(|| fallback.and_then(resolve))
                .map(|bbl| strip_comments(&bbl))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

static RE_MACRO_DEF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\(?:(?:re|provide)?newcommand\*?\s*\{?\s*\\([A-Za-z@]+)\s*\}?|g?def\s*\\([A-Za-z@]+))\s*(\[\d\])?\s*\{")
        .unwrap()
});

/// Zero-argument `\newcommand`/`\def` macros, name → body.
fn collect_macros(text: &str) -> BTreeMap<String, String> {
    let mut macros = BTreeMap::new();
    for caps in RE_MACRO_DEF.captures_iter(text) {
        if caps.get(3).is_some() {
            continue;
        }
        let (Some(name), Some(whole)) = (caps.get(1).or_else(|| caps.get(2)), caps.get(0)) else {
            continue;
        };
        let open = whole.end() - 1;
        if let Some(close) = matching_brace(text, open) {
            macros.insert(name.as_str().to_string(), text[open + 1..close].to_string());
        }
    }
    macros
}

pub(crate) fn document_body(text: &str) -> &str {
    const BEGIN: &str = "\\begin{document}";
    const END: &str = "\\end{document}";
    match text.find(BEGIN) {
        Some(start) => {
            let from = start + BEGIN.len();
            let to = text.rfind(END).filter(|&e| e >= from).unwrap_or(text.len());
            &text[from..to]
        }
        None => text,
    }
}

// ── Argument scanning ────────────────────────────────────────────────────

/// Skip spaces, tabs, and at most one newline.
fn skip_ws(src: &str, mut pos: usize) -> usize {
    let bytes = src.as_bytes();
    let mut newline_seen = false;
    while pos < bytes.len() {
        match bytes[pos] {
            b' ' | b'\t' => pos += 1,
            b'\n' if !newline_seen => {
                newline_seen = true;
                pos += 1;
            }
            _ => break,
        }
    }
    pos
}

fn skip_blanks(src: &str, mut pos: usize) -> usize {
    let bytes = src.as_bytes();
    while pos < bytes.len() && matches!(bytes[pos], b' ' | b'\t') {
        pos += 1;
    }
    pos
}

/// Index of the `}` closing the `{` at `open`.
pub(crate) fn matching_brace(src: &str, open: usize) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Index of the `]` closing the `[` at `open`, ignoring brackets in braces.
fn matching_bracket(src: &str, open: usize) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut braces = 0usize;
    let mut i = open + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'{' => braces += 1,
            b'}' => braces = braces.saturating_sub(1),
            b']' if braces == 0 => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

fn group_arg(src: &str, pos: usize) -> Option<(&str, usize)> {
    let p = skip_ws(src, pos);
    if src.as_bytes().get(p) != Some(&b'{') {
        return None;
    }
    let end = matching_brace(src, p)?;
    Some((&src[p + 1..end], end + 1))
}

fn opt_arg(src: &str, pos: usize) -> Option<(&str, usize)> {
    let p = skip_blanks(src, pos);
    if src.as_bytes().get(p) != Some(&b'[') {
        return None;
    }
    let end = matching_bracket(src, p)?;
    Some((&src[p + 1..end], end + 1))
}

/// A braced group, or a single token (`\name` or one character).
fn req_arg(src: &str, pos: usize) -> Option<(&str, usize)> {
    if let Some(found) = group_arg(src, pos) {
        return Some(found);
    }
    let p = skip_ws(src, pos);
    let rest = src.get(p..)?;
    let first = rest.chars().next()?;
    if first == '\\' {
        let name_len = rest[1..]
            .bytes()
            .take_while(|b| b.is_ascii_alphabetic())
            .count();
        let len = if name_len > 0 {
            1 + name_len
        } else {
            1 + rest[1..].chars().next().map(char::len_utf8).unwrap_or(0)
        };
        return Some((&rest[..len], p + len));
    }
    if first == '}' {
        return None;
    }
    Some((&rest[..first.len_utf8()], p + first.len_utf8()))
}

type Args<'s> = (Vec<&'s str>, Vec<&'s str>, usize);

/// Up to `opts` optional arguments followed by exactly `reqs` required ones.
fn take_args(src: &str, pos: usize, opts: usize, reqs: usize) -> Option<Args<'_>> {
    let mut p = pos;
    let mut optional = Vec::new();
    for _ in 0..opts {
        match opt_arg(src, p) {
            Some((a, np)) => {
                optional.push(a);
                p = np;
            }
            None => break,
        }
    }
    let mut required = Vec::with_capacity(reqs);
    for _ in 0..reqs {
        let (a, np) = req_arg(src, p)?;
        required.push(a);
        p = np;
    }
    Some((optional, required, p))
}

/// Raw first required argument of every `\name` occurrence.
pub(crate) fn command_args(text: &str, name: &str) -> Vec<String> {
    let needle = format!("\\{name}");
    let mut out = Vec::new();
    let mut from = 0;
    while let Some(off) = text[from..].find(&needle) {
        let mut pos = from + off + needle.len();
        from = pos;
        if text[pos..].starts_with(|c: char| c.is_ascii_alphabetic()) {
            continue;
        }
        if text[pos..].starts_with('*') {
            pos += 1;
        }
        while let Some((_, p)) = opt_arg(text, pos) {
            pos = p;
        }
        if let Some((arg, p)) = group_arg(text, pos) {
            out.push(arg.to_string());
            from = p;
        }
    }
    out
}

/// Content of every `\begin{name}…\end{name}` block.
pub(crate) fn environment_bodies<'s>(text: &'s str, name: &str) -> Vec<&'s str> {
    let open = format!("\\begin{{{name}}}");
    let mut out = Vec::new();
    let mut from = 0;
    while let Some(off) = text[from..].find(&open) {
        let start = from + off + open.len();
        match environment_content(text, start, name) {
            Some((body, after)) => {
                out.push(body);
                from = after;
            }
            None => break,
        }
    }
    out
}

/// Body of the environment opened just before `pos`, honouring nesting.
fn environment_content<'s>(src: &'s str, pos: usize, env: &str) -> Option<(&'s str, usize)> {
    let open = format!("\\begin{{{env}}}");
    let close = format!("\\end{{{env}}}");
    let mut depth = 1usize;
    let mut cursor = pos;
    loop {
        let next_close = src[cursor..].find(&close)? + cursor;
        match src[cursor..].find(&open).map(|o| o + cursor) {
            Some(o) if o < next_close => {
                depth += 1;
                cursor = o + open.len();
            }
            _ => {
                depth -= 1;
                if depth == 0 {
                    return Some((&src[pos..next_close], next_close + close.len()));
                }
                cursor = next_close + close.len();
            }
        }
    }
}

/// Strip leading `[..]` and `{..}` environment arguments from a body.
fn strip_env_args(content: &str, opts: usize, reqs: usize) -> &str {
    let mut pos = 0;
    for _ in 0..opts {
        if let Some((_, p)) = opt_arg(content, pos) {
            pos = p;
        }
    }
    for _ in 0..reqs {
        if let Some((_, p)) = group_arg(content, pos) {
            pos = p;
        }
    }
    if let Some((_, p)) = opt_arg(content, pos) {
        pos = p;
    }
    &content[pos..]
}

/// Split at top-level occurrences of `sep` (`&` or `\\`), skipping braces.
fn split_top_level<'s>(src: &'s str, row_breaks: bool) -> Vec<&'s str> {
    let bytes = src.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                if row_breaks && depth == 0 && bytes.get(i + 1) == Some(&b'\\') {
                    parts.push(&src[start..i]);
                    start = i + 2;
                }
                i += 2;
                continue;
            }
            b'{' => depth += 1,
            b'}' => depth = depth.saturating_sub(1),
            b'&' if !row_breaks && depth == 0 => {
                parts.push(&src[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&src[start.min(src.len())..]);
    parts
}

/// Split a list body at top-level `\item`s; text before the first is dropped.
fn split_items(src: &str) -> Vec<&str> {
    let bytes = src.as_bytes();
    let mut starts = Vec::new();
    let mut braces = 0usize;
    let mut envs = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                let rest = &src[i + 1..];
                let name_len = rest.bytes().take_while(|b| b.is_ascii_alphabetic()).count();
                let name = &rest[..name_len];
                match name {
                    "begin" => envs += 1,
                    "end" => envs = envs.saturating_sub(1),
                    "item" if braces == 0 && envs == 0 => starts.push(i + 1 + name_len),
                    _ => {}
                }
                i += 1 + name_len.max(1);
                continue;
            }
            b'{' => braces += 1,
            b'}' => braces = braces.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }

    let mut items = Vec::with_capacity(starts.len());
    for (n, &s) in starts.iter().enumerate() {
        let end = starts
            .get(n + 1)
            .map(|&next| next - "\\item".len())
            .unwrap_or(src.len());
        items.push(&src[s..end]);
    }
    items
}

// ── Rendering ────────────────────────────────────────────────────────────

struct Renderer {
    issues: IssueLog,
    macros: BTreeMap<String, String>,
    macro_depth: usize,
    expansions: usize,
    expanded_bytes: usize,
    depth: usize,
}

impl Renderer {
    fn new(macros: BTreeMap<String, String>) -> Self {
        Self {
            issues: IssueLog::default(),
            macros,
            macro_depth: 0,
            expansions: 0,
            expanded_bytes: 0,
            depth: 0,
        }
    }

    fn render(&mut self, src: &str) -> String {
        if self.depth >= MAX_RENDER_DEPTH {
            self.issues.record(IssueKind::LimitExceeded, "nesting depth");
            return flatten_markup(src);
        }
        self.depth += 1;
        let out = self.render_flat(src);
        self.depth -= 1;
        out
    }

    /// One level of rendering. Bare groups are transparent; only command
    /// arguments and environments descend.
    fn render_flat(&mut self, src: &str) -> String {
        let mut out = String::with_capacity(src.len());
        let bytes = src.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i = self.backslash(src, i, &mut out),
                b'$' => i = copy_math(src, i, &mut out),
                b'{' | b'}' => i += 1,
                b'~' => {
                    out.push(' ');
                    i += 1;
                }
                b'`' if src[i..].starts_with("``") => {
                    out.push('"');
                    i += 2;
                }
                b'\'' if src[i..].starts_with("''") => {
                    out.push('"');
                    i += 2;
                }
                b'-' if src[i..].starts_with("---") => {
                    out.push('\u{2014}');
                    i += 3;
                }
                b'-' if src[i..].starts_with("--") => {
                    out.push('\u{2013}');
                    i += 2;
                }
                _ => {
                    let Some(ch) = src[i..].chars().next() else { break };
                    out.push(ch);
                    i += ch.len_utf8();
                }
            }
        }
        out
    }

    fn render_inline(&mut self, src: &str) -> String {
        collapse_whitespace(&self.render(src))
    }

    fn backslash(&mut self, src: &str, i: usize, out: &mut String) -> usize {
        let rest = &src[i + 1..];
        let Some(next) = rest.chars().next() else {
            return i + 1;
        };

        if next.is_ascii_alphabetic() || next == '@' {
            let name_len = rest
                .bytes()
                .take_while(|b| b.is_ascii_alphabetic() || *b == b'@')
                .count();
            let name = &rest[..name_len];
            let mut pos = i + 1 + name_len;
            let star = src[pos..].starts_with('*');
            if star {
                pos += 1;
            }
            return self.command(src, name, pos, out);
        }

        match next {
            '\\' => {
                out.push('\n');
                let mut p = i + 2;
                if src[p..].starts_with('*') {
                    p += 1;
                }
                if src[p..].starts_with('[') {
                    if let Some(end) = matching_bracket(src, p) {
                        p = end + 1;
                    }
                }
                p
            }
            '[' => match src[i + 2..].find("\\]") {
                Some(off) => {
                    let body = &src[i + 2..i + 2 + off];
                    push_block(out, &format!("$$\n{}\n$$", body.trim()));
                    i + 2 + off + 2
                }
                None => i + 2,
            },
            '(' => match src[i + 2..].find("\\)") {
                Some(off) => {
                    out.push('$');
                    out.push_str(src[i + 2..i + 2 + off].trim());
                    out.push('$');
                    i + 2 + off + 2
                }
                None => i + 2,
            },
            '&' | '%' | '#' | '_' | '{' | '}' => {
                out.push(next);
                i + 2
            }
            '$' => {
                out.push_str("\\$");
                i + 2
            }
            ',' | ';' | ':' | '>' | ' ' => {
                out.push(' ');
                i + 2
            }
            '!' | '/' | '-' | '@' => i + 2,
            '\'' | '`' | '"' | '^' | '~' | '=' | '.' => {
                let Some((arg, p)) = req_arg(src, i + 2) else {
                    return i + 2;
                };
                out.push(accented(next, arg));
                p
            }
            other => {
                out.push(other);
                i + 1 + other.len_utf8()
            }
        }
    }

    fn command(&mut self, src: &str, name: &str, pos: usize, out: &mut String) -> usize {
        if let Some(body) = self.macros.get(name).cloned() {
            if self.expansions >= MAX_MACRO_EXPANSIONS
                || self.expanded_bytes + body.len() > MAX_EXPANDED_BYTES
            {
                self.issues.record(IssueKind::LimitExceeded, format!("\\{name}"));
                return pos;
            }
            if self.macro_depth < MAX_MACRO_DEPTH {
                self.expansions += 1;
                self.expanded_bytes += body.len();
                self.macro_depth += 1;
                let expanded = self.render(&body);
                self.macro_depth -= 1;
                out.push_str(&expanded);
            }
            return pos;
        }

        if SILENT_COMMANDS.contains(&name) {
            return pos;
        }
        if let Some(&(_, opts, reqs)) = DROPPED_COMMANDS.iter().find(|(n, _, _)| *n == name) {
            return take_args(src, pos, opts, reqs).map(|(_, _, p)| p).unwrap_or(pos);
        }
        if let Some(&(_, opts, reqs, keep)) =
            WRAPPER_COMMANDS.iter().find(|(n, _, _, _)| *n == name)
        {
            return match take_args(src, pos, opts, reqs) {
                Some((_, args, p)) => {
                    let text = self.render(args[keep]);
                    out.push_str(&text);
                    p
                }
                None => pos,
            };
        }
        if CITE_COMMANDS.contains(&name) {
            return match take_args(src, pos, 2, 1) {
                Some((_, args, p)) => {
                    let keys: Vec<String> = split_keys(args[0]).map(|k| format!("@{k}")).collect();
                    out.push_str(&format!("[{}]", keys.join("; ")));
                    p
                }
                None => pos,
            };
        }
        if REF_COMMANDS.contains(&name) {
            return match take_args(src, pos, 0, 1) {
                Some((_, args, p)) => {
                    let refs: Vec<String> = split_keys(args[0]).map(|k| format!("[{k}](#{k})")).collect();
                    out.push_str(&refs.join(", "));
                    p
                }
                None => pos,
            };
        }

        match name {
            "part" | "chapter" | "section" | "subsection" | "subsubsection" | "paragraph"
            | "subparagraph" => match take_args(src, pos, 1, 1) {
                Some((_, args, p)) => {
                    let title = self.render_inline(args[0]);
                    push_block(out, &format!("{} {}", "#".repeat(heading_level(name)), title));
                    p
                }
                None => pos,
            },
            "textbf" | "mathbf" | "bm" => self.wrap(src, pos, out, "**"),
            "textit" | "emph" | "textsl" => self.wrap(src, pos, out, "*"),
            "texttt" => self.wrap(src, pos, out, "`"),
            "url" | "nolinkurl" => match take_args(src, pos, 0, 1) {
                Some((_, args, p)) => {
                    out.push_str(&format!("<{}>", args[0].trim()));
                    p
                }
                None => pos,
            },
            "href" => match take_args(src, pos, 0, 2) {
                Some((_, args, p)) => {
                    let text = self.render_inline(args[1]);
                    out.push_str(&format!("[{}]({})", text, args[0].trim()));
                    p
                }
                None => pos,
            },
            "nocite" => take_args(src, pos, 0, 1).map(|(_, _, p)| p).unwrap_or(pos),
            "eqref" => match take_args(src, pos, 0, 1) {
                Some((_, args, p)) => {
                    let k = args[0].trim();
                    out.push_str(&format!("([{k}](#{k}))"));
                    p
                }
                None => pos,
            },
            "footnote" | "footnotetext" => match take_args(src, pos, 1, 1) {
                Some((_, args, p)) => {
                    let note = self.render_inline(args[0]);
                    out.push_str(&format!("^[{note}]"));
                    p
                }
                None => pos,
            },
            "item" | "bibitem" => {
                let p = take_args(src, pos, 1, 0).map(|(_, _, p)| p).unwrap_or(pos);
                let p = if name == "bibitem" {
                    take_args(src, p, 0, 1).map(|(_, _, p)| p).unwrap_or(p)
                } else {
                    p
                };
                out.push_str("\n- ");
                p
            }
            "includegraphics" => match take_args(src, pos, 1, 1) {
                Some((_, args, p)) => {
                    push_block(out, &format!("![]({})", args[0].trim()));
                    p
                }
                None => pos,
            },
            "caption" => match take_args(src, pos, 1, 1) {
                Some((_, args, p)) => {
                    let caption = self.render_inline(args[0]);
                    push_block(out, &format!("*{caption}*"));
                    p
                }
                None => pos,
            },
            "verb" => {
                let Some(delim) = src[pos..].chars().next() else {
                    return pos;
                };
                let from = pos + delim.len_utf8();
                match src[from..].find(delim) {
                    Some(off) => {
                        out.push_str(&format!("`{}`", &src[from..from + off]));
                        from + off + delim.len_utf8()
                    }
                    None => pos,
                }
            }
            "par" => {
                out.push_str("\n\n");
                pos
            }
            "newline" | "linebreak" => {
                out.push('\n');
                pos
            }
            "newblock" | "quad" | "qquad" | "enspace" | "thinspace" | "and" => {
                out.push_str(if name == "and" { ", " } else { " " });
                pos
            }
            "newcommand" | "renewcommand" | "providecommand" | "DeclareRobustCommand" => {
                let p = req_arg(src, pos).map(|(_, p)| p).unwrap_or(pos);
                take_args(src, p, 2, 1).map(|(_, _, p)| p).unwrap_or(p)
            }
            "newenvironment" | "renewenvironment" => {
                let p = req_arg(src, pos).map(|(_, p)| p).unwrap_or(pos);
                take_args(src, p, 2, 2).map(|(_, _, p)| p).unwrap_or(p)
            }
            "def" | "gdef" | "edef" | "xdef" => {
                let p = req_arg(src, pos).map(|(_, p)| p).unwrap_or(pos);
                match src[p..].find('{') {
                    Some(off) => matching_brace(src, p + off).map(|e| e + 1).unwrap_or(p),
                    None => p,
                }
            }
            "c" | "v" | "u" | "H" | "r" | "k" | "d" | "b" => match take_args(src, pos, 0, 1) {
                Some((_, args, p)) => {
                    out.push(accented(command_accent(name), args[0]));
                    p
                }
                None => pos,
            },
            "begin" => match group_arg(src, pos) {
                Some((env, p)) => self.environment(src, env.trim(), p, out),
                None => pos,
            },
            "end" => group_arg(src, pos).map(|(_, p)| p).unwrap_or(pos),
            _ => {
                if let Some(text) = symbol(name) {
                    out.push_str(text);
                    return pos;
                }
                self.unknown_command(src, name, pos, out)
            }
        }
    }

    fn wrap(&mut self, src: &str, pos: usize, out: &mut String, marker: &str) -> usize {
        match take_args(src, pos, 0, 1) {
            Some((_, args, p)) => {
                let inner = self.render_inline(args[0]);
                if !inner.is_empty() {
                    out.push_str(marker);
                    out.push_str(&inner);
                    out.push_str(marker);
                }
                p
            }
            None => pos,
        }
    }

    /// Keep the text of the last braced argument and record the command.
    fn unknown_command(&mut self, src: &str, name: &str, pos: usize, out: &mut String) -> usize {
        self.issues.record(IssueKind::UnresolvedCommand, format!("\\{name}"));
        let mut p = pos;
        while let Some((_, np)) = opt_arg(src, p) {
            p = np;
        }
        let mut last = None;
        loop {
            let q = skip_blanks(src, p);
            if src.as_bytes().get(q) != Some(&b'{') {
                break;
            }
            match matching_brace(src, q) {
                Some(end) => {
                    last = Some(&src[q + 1..end]);
                    p = end + 1;
                }
                None => break,
            }
        }
        if let Some(arg) = last {
            let text = self.render(arg);
            out.push_str(&text);
        }
        p
    }

    // ── Environments ──

    fn environment(&mut self, src: &str, env: &str, pos: usize, out: &mut String) -> usize {
        if VERBATIM_ENVS.contains(&env) {
            let close = format!("\\end{{{env}}}");
            let (body, after) = match src[pos..].find(&close) {
                Some(off) => (&src[pos..pos + off], pos + off + close.len()),
                None => (&src[pos..], src.len()),
            };
            if env != "comment" && env != "filecontents" {
                self.code_block(env, body, out);
            }
            return after;
        }

        let (content, after) =
            environment_content(src, pos, env).unwrap_or((&src[pos..], src.len()));
        let base = env.trim_end_matches('*');

        if let Some(&(_, reqs)) = LAYOUT_ENVS.iter().find(|(n, _)| *n == base) {
            let text = self.render(strip_env_args(content, 1, reqs));
            out.push_str(&text);
            return after;
        }
        if DROPPED_ENVS.contains(&env) || DROPPED_ENVS.contains(&base) {
            return after;
        }
        if MATH_ENVS.contains(&base) {
            push_block(out, &display_math(base, content));
            return after;
        }
        if TABLE_ENVS.contains(&env) {
            let table = self.tabular(env, content);
            push_block(out, &table);
            return after;
        }
        if THEOREM_ENVS.contains(&base) {
            self.theorem(base, content, out);
            return after;
        }
        if DIAGRAM_ENVS.contains(&base) {
            self.issues.record(IssueKind::UnhandledEnvironment, base);
            push_block(out, "*[diagram omitted]*");
            return after;
        }

        match base {
            "abstract" => {
                push_block(out, "## Abstract");
                let text = self.render(content);
                out.push_str(text.trim());
                out.push_str("\n\n");
            }
            "itemize" | "enumerate" | "description" | "compactitem" | "compactenum" => {
                let list = self.list(base, strip_env_args(content, 1, 0));
                push_block(out, &list);
            }
            "figure" | "wrapfigure" | "subfigure" | "SCfigure" => {
                let figure = self.figure(content);
                push_block(out, &figure);
            }
            "table" | "wraptable" => {
                let table = self.table_float(content);
                push_block(out, &table);
            }
            "quote" | "quotation" | "verse" => {
                let text = self.render(content);
                let quoted: Vec<String> = text
                    .trim()
                    .lines()
                    .map(|l| if l.trim().is_empty() { ">".to_string() } else { format!("> {}", l.trim()) })
                    .collect();
                push_block(out, &quoted.join("\n"));
            }
            "proof" => {
                let (label, body) = match opt_arg(content, 0) {
                    Some((l, p)) => (self.render_inline(l), &content[p..]),
                    None => ("Proof".to_string(), content),
                };
                let text = self.render(body);
                push_block(out, &format!("*{}.* {} \u{220E}", label, text.trim()));
            }
            "thebibliography" => {
                let list = self.bibliography(strip_env_args(content, 0, 1));
                push_block(out, &format!("## References\n\n{list}"));
            }
            "acknowledgments" | "acknowledgements" | "acks" => {
                push_block(out, "## Acknowledgments");
                let text = self.render(content);
                out.push_str(text.trim());
                out.push_str("\n\n");
            }
            _ => {
                self.issues.record(IssueKind::UnhandledEnvironment, base);
                let text = self.render(content);
                out.push_str(&text);
            }
        }
        after
    }

    fn code_block(&mut self, env: &str, body: &str, out: &mut String) {
        let (lang, body) = match env {
            "lstlisting" => match opt_arg(body, 0) {
                Some((opts, p)) => (listing_language(opts), &body[p..]),
                None => (String::new(), body),
            },
            "minted" => {
                let p = opt_arg(body, 0).map(|(_, p)| p).unwrap_or(0);
                match group_arg(body, p) {
                    Some((lang, p)) => (lang.trim().to_string(), &body[p..]),
                    None => (String::new(), &body[p..]),
                }
            }
            _ => (String::new(), body),
        };
        let body = body.trim_start_matches([' ', '\t']).trim_start_matches('\n').trim_end();
        push_block(out, &format!("```{lang}\n{body}\n```"));
    }

    fn list(&mut self, kind: &str, content: &str) -> String {
        let items = split_items(content);
        if items.is_empty() {
            return self.render(content).trim().to_string();
        }
        let mut lines = Vec::new();
        for (n, item) in items.into_iter().enumerate() {
            let (label, body) = match opt_arg(item, 0) {
                Some((l, p)) => (Some(self.render_inline(l)), &item[p..]),
                None => (None, item),
            };
            let text = self.render(body);
            let text = text.trim();
            let marker = match kind {
                "enumerate" | "compactenum" => format!("{}. ", n + 1),
                _ => "- ".to_string(),
            };
            let text = match (kind, label) {
                ("description", Some(l)) if !l.is_empty() => format!("**{l}** {text}"),
                _ => text.to_string(),
            };
            let indent = " ".repeat(marker.len());
            for (k, line) in text.lines().enumerate() {
                if k == 0 {
                    lines.push(format!("{marker}{line}"));
                } else if line.trim().is_empty() {
                    lines.push(String::new());
                } else {
                    lines.push(format!("{indent}{line}"));
                }
            }
            if text.is_empty() {
                lines.push(marker.trim_end().to_string());
            }
        }
        lines.join("\n")
    }

    fn figure(&mut self, content: &str) -> String {
        static RE_GRAPHICS: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"\\includegraphics\*?\s*(?:\[[^\]]*\])?\s*\{([^}]*)\}").unwrap()
        });
        let caption = command_args(content, "caption")
            .last()
            .map(|c| self.render_inline(c))
            .unwrap_or_default();
        let alt = caption.replace('[', "\\[").replace(']', "\\]");
        let images: Vec<String> = RE_GRAPHICS
            .captures_iter(content)
            .map(|c| format!("![{}]({})", alt, c[1].trim()))
            .collect();

        let mut parts = images;
        if DIAGRAM_ENVS.iter().any(|d| content.contains(&format!("\\begin{{{d}}}"))) {
            self.issues.record(IssueKind::UnhandledEnvironment, "tikzpicture");
            parts.push("*[diagram omitted]*".to_string());
        }
        if !caption.is_empty() && !parts.iter().any(|p| p.starts_with("![")) {
            parts.push(format!("*Figure: {caption}*"));
        }
        parts.join("\n\n")
    }

    fn table_float(&mut self, content: &str) -> String {
        let mut parts = Vec::new();
        if let Some(caption) = command_args(content, "caption").last() {
            let caption = self.render_inline(caption);
            parts.push(format!("*Table: {caption}*"));
        }
        let mut found = false;
        for env in TABLE_ENVS {
            for body in environment_bodies(content, env) {
                found = true;
                let table = self.tabular(env, body);
                parts.push(table);
            }
        }
        if !found {
            self.issues.record(IssueKind::MalformedTable, "table");
        }
        parts.join("\n\n")
    }

    fn tabular(&mut self, env: &str, content: &str) -> String {
        let body = match env {
            "tabular*" | "tabularx" | "tabulary" => strip_env_args(content, 0, 2),
            "tabu" => content
                .find('{')
                .and_then(|o| matching_brace(content, o))
                .map(|e| &content[e + 1..])
                .unwrap_or(content),
            _ => strip_env_args(content, 1, 1),
        };

        static RE_RULES: Lazy<Regex> = Lazy::new(|| {
            Regex::new(
                r"\\(?:hline|toprule|midrule|bottomrule|endhead|endfirsthead|endfoot|endlastfoot|noalign\{[^}]*\}|hhline\{[^}]*\}|cline\{[^}]*\}|cmidrule(?:\([^)]*\))?\{[^}]*\}|addlinespace(?:\[[^\]]*\])?|specialrule\{[^}]*\}\{[^}]*\}\{[^}]*\}|rowcolor(?:\[[^\]]*\])?\{[^}]*\})",
            )
            .unwrap()
        });

        let mut rows: Vec<Vec<String>> = Vec::new();
        for raw_row in split_top_level(body, true) {
            let row = RE_RULES.replace_all(raw_row, "");
            let mut row = row.trim();
            if let Some((_, p)) = opt_arg(row, 0) {
                row = row[p..].trim();
            }
            if row.is_empty() {
                continue;
            }
            let mut cells = Vec::new();
            for cell in split_top_level(row, false) {
                let cell = cell.trim();
                if let Some(rest) = cell.strip_prefix("\\multicolumn") {
                    if let Some((_, args, _)) = take_args(rest, 0, 0, 3) {
                        let span = args[0].trim().parse::<usize>().unwrap_or(1).max(1);
                        cells.push(self.cell(args[2]));
                        cells.extend(std::iter::repeat(String::new()).take(span - 1));
                        continue;
                    }
                }
                cells.push(self.cell(cell));
            }
            rows.push(cells);
        }

        if rows.is_empty() {
            self.issues.record(IssueKind::MalformedTable, env);
            return self.render(body).trim().to_string();
        }

        let cols = rows.iter().map(Vec::len).max().unwrap_or(1).max(1);
        let line = |cells: &[String]| {
            let mut padded: Vec<&str> = cells.iter().map(String::as_str).collect();
            padded.resize(cols, "");
            format!("| {} |", padded.join(" | "))
        };
        let mut lines = Vec::with_capacity(rows.len() + 1);
        lines.push(line(&rows[0]));
        lines.push(format!("|{}", " --- |".repeat(cols)));
        for row in &rows[1..] {
            lines.push(line(row));
        }
        lines.join("\n")
    }

    fn cell(&mut self, src: &str) -> String {
        self.render_inline(src).replace('|', "\\|")
    }

    fn theorem(&mut self, env: &str, content: &str, out: &mut String) {
        let mut label = capitalize(env);
        let body = match opt_arg(content, 0) {
            Some((name, p)) => {
                label = format!("{label} ({})", self.render_inline(name));
                &content[p..]
            }
            None => content,
        };
        let text = self.render(body);
        push_block(out, &format!("**{label}.** {}", text.trim()));
    }

    fn bibliography(&mut self, content: &str) -> String {
        static RE_BIBITEM: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"\\bibitem\s*(?:\[[^\]]*\])?\s*\{([^}]*)\}").unwrap());
        let mut entries = Vec::new();
        let matches: Vec<_> = RE_BIBITEM.captures_iter(content).collect();
        for (n, caps) in matches.iter().enumerate() {
            let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let end = matches
                .get(n + 1)
                .and_then(|c| c.get(0))
                .map(|m| m.start())
                .unwrap_or(content.len());
            let text = self.render_inline(&content[whole.end()..end]);
            entries.push(format!("- [{}] {}", key.as_str().trim(), text));
        }
        entries.join("\n")
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Copy `$…$` verbatim; turn `$$…$$` into a display block.
fn copy_math(src: &str, i: usize, out: &mut String) -> usize {
    if src[i..].starts_with("$$") {
        return match find_unescaped(src, i + 2, "$$") {
            Some(end) => {
                push_block(out, &format!("$$\n{}\n$$", src[i + 2..end].trim()));
                end + 2
            }
            None => {
                out.push_str("$$");
                i + 2
            }
        };
    }
    match find_unescaped(src, i + 1, "$") {
        Some(end) => {
            out.push_str(&src[i..=end]);
            end + 1
        }
        None => {
            out.push_str("\\$");
            i + 1
        }
    }
}

fn find_unescaped(src: &str, from: usize, needle: &str) -> Option<usize> {
    let bytes = src.as_bytes();
    let needle = needle.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i..].starts_with(needle) {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Visible text of `src` with braces and control words dropped. Used past
/// the nesting limit, so it must not recurse.
fn flatten_markup(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' | '}' => {}
            '\\' => match chars.next() {
                Some(n) if n.is_ascii_alphabetic() => {
                    while chars.next_if(char::is_ascii_alphabetic).is_some() {}
                }
                Some('\\') => out.push('\n'),
                Some(n) if "&%#_{}$".contains(n) => out.push(n),
                Some(_) | None => {}
            },
            '~' => out.push(' '),
            other => out.push(other),
        }
    }
    out
}

static RE_MATH_LABELS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\label\s*\{[^}]*\}|\\nonumber\b|\\notag\b").unwrap());

fn display_math(env: &str, content: &str) -> String {
    let content = if env == "alignat" {
        strip_env_args(content, 0, 1)
    } else {
        content
    };
    let body = RE_MATH_LABELS.replace_all(content, "");
    let body = body.trim();
    let body = match env {
        "align" | "alignat" | "flalign" | "eqnarray" => {
            format!("\\begin{{aligned}}\n{body}\n\\end{{aligned}}")
        }
        "gather" => format!("\\begin{{gathered}}\n{body}\n\\end{{gathered}}"),
        _ => body.to_string(),
    };
    format!("$$\n{body}\n$$")
}

/// Append a block separated from its neighbours by blank lines.
fn push_block(out: &mut String, block: &str) {
    let trimmed_len = out.trim_end_matches([' ', '\t']).len();
    out.truncate(trimmed_len);
    if !out.is_empty() && !out.ends_with("\n\n") {
        out.push_str(if out.ends_with('\n') { "\n" } else { "\n\n" });
    }
    out.push_str(block);
    out.push_str("\n\n");
}

fn heading_level(name: &str) -> usize {
    match name {
        "part" | "chapter" | "section" => 2,
        "subsection" => 3,
        "subsubsection" => 4,
        "paragraph" => 5,
        _ => 6,
    }
}

fn split_keys(arg: &str) -> impl Iterator<Item = &str> {
    arg.split(',').map(str::trim).filter(|k| !k.is_empty())
}

fn listing_language(opts: &str) -> String {
    opts.split(',')
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| k.trim() == "language")
        .map(|(_, v)| v.trim().trim_matches(|c| c == '{' || c == '}').to_lowercase())
        .unwrap_or_default()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Plain text of a LaTeX fragment, for metadata fields.
pub(crate) fn to_plain_text(fragment: &str) -> String {
    let mut renderer = Renderer::new(BTreeMap::new());
    let text = renderer.render(fragment);
    collapse_whitespace(&text.replace(['*', '`'], ""))
}

fn symbol(name: &str) -> Option<&'static str> {
    Some(match name {
        "ldots" | "dots" | "textellipsis" => "\u{2026}",
        "LaTeX" => "LaTeX",
        "LaTeXe" => "LaTeX2e",
        "TeX" => "TeX",
        "BibTeX" => "BibTeX",
        "today" => "",
        "textendash" => "\u{2013}",
        "textemdash" => "\u{2014}",
        "S" => "\u{A7}",
        "P" => "\u{B6}",
        "copyright" => "\u{A9}",
        "textregistered" => "\u{AE}",
        "texttrademark" => "\u{2122}",
        "dag" => "\u{2020}",
        "ddag" => "\u{2021}",
        "textbar" => "|",
        "textless" => "<",
        "textgreater" => ">",
        "textasciitilde" => "~",
        "textunderscore" => "_",
        "textbullet" => "\u{2022}",
        "textdegree" => "\u{B0}",
        "ss" => "\u{DF}",
        "ae" => "\u{E6}",
        "AE" => "\u{C6}",
        "oe" => "\u{153}",
        "OE" => "\u{152}",
        "aa" => "\u{E5}",
        "AA" => "\u{C5}",
        "o" => "\u{F8}",
        "O" => "\u{D8}",
        "l" => "\u{142}",
        "L" => "\u{141}",
        "i" => "i",
        "j" => "j",
        "xspace" | "ignorespaces" | "unskip" => "",
        _ => return None,
    })
}

fn command_accent(name: &str) -> char {
    match name {
        "c" => ',',
        "v" => 'v',
        "r" => 'o',
        "H" => 'H',
        "u" => 'u',
        _ => ' ',
    }
}

/// Precomposed letter for `mark` applied to the first letter of `arg`.
fn accented(mark: char, arg: &str) -> char {
    let base = arg
        .trim()
        .trim_start_matches('\\')
        .chars()
        .next()
        .unwrap_or(' ');
    let table: &[(char, char)] = match mark {
        '\'' => &[
            ('a', 'á'), ('e', 'é'), ('i', 'í'), ('o', 'ó'), ('u', 'ú'), ('y', 'ý'),
            ('A', 'Á'), ('E', 'É'), ('I', 'Í'), ('O', 'Ó'), ('U', 'Ú'), ('Y', 'Ý'),
            ('c', 'ć'), ('n', 'ń'), ('s', 'ś'), ('z', 'ź'), ('C', 'Ć'), ('N', 'Ń'),
            ('S', 'Ś'), ('Z', 'Ź'),
        ],
        '`' => &[
            ('a', 'à'), ('e', 'è'), ('i', 'ì'), ('o', 'ò'), ('u', 'ù'),
            ('A', 'À'), ('E', 'È'), ('I', 'Ì'), ('O', 'Ò'), ('U', 'Ù'),
        ],
        '"' => &[
            ('a', 'ä'), ('e', 'ë'), ('i', 'ï'), ('o', 'ö'), ('u', 'ü'), ('y', 'ÿ'),
            ('A', 'Ä'), ('E', 'Ë'), ('I', 'Ï'), ('O', 'Ö'), ('U', 'Ü'),
        ],
        '^' => &[
            ('a', 'â'), ('e', 'ê'), ('i', 'î'), ('o', 'ô'), ('u', 'û'),
            ('A', 'Â'), ('E', 'Ê'), ('I', 'Î'), ('O', 'Ô'), ('U', 'Û'),
        ],
        '~' => &[('a', 'ã'), ('n', 'ñ'), ('o', 'õ'), ('A', 'Ã'), ('N', 'Ñ'), ('O', 'Õ')],
        ',' => &[('c', 'ç'), ('C', 'Ç'), ('s', 'ş'), ('S', 'Ş')],
        'v' => &[
            ('c', 'č'), ('s', 'š'), ('z', 'ž'), ('r', 'ř'), ('e', 'ě'), ('n', 'ň'),
            ('C', 'Č'), ('S', 'Š'), ('Z', 'Ž'), ('R', 'Ř'),
        ],
        'o' => &[('a', 'å'), ('A', 'Å'), ('u', 'ů')],
        'H' => &[('o', 'ő'), ('u', 'ű'), ('O', 'Ő'), ('U', 'Ű')],
        'u' => &[('a', 'ă'), ('g', 'ğ'), ('A', 'Ă'), ('G', 'Ğ')],
        _ => &[],
    };
    table
        .iter()
        .find(|(b, _)| *b == base)
        .map(|(_, c)| *c)
        .unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(src: &str) -> LatexOutput {
        convert_source(src, &|_| None, None)
    }

    fn issue_count(out: &LatexOutput, kind: IssueKind, construct: &str) -> usize {
        out.issues
            .iter()
            .find(|i| i.kind == kind && i.construct == construct)
            .map(|i| i.count)
            .unwrap_or(0)
    }

    #[test]
    fn title_and_sections() {
        let out = convert(
            "\\documentclass{article}\n\\title{A Study\\thanks{Funded.}}\n\\begin{document}\n\\maketitle\n\\section{Intro}\nHello \\textbf{bold} and \\emph{it}.\n\\subsection*{Deeper}\nText.\n\\end{document}",
        );
        assert_eq!(out.title.as_deref(), Some("A Study"));
        assert!(out.markdown.starts_with("# A Study\n\n"), "got: {}", out.markdown);
        assert!(out.markdown.contains("## Intro\n\nHello **bold** and *it*."));
        assert!(out.markdown.contains("### Deeper"));
        assert!(out.issues.is_empty(), "issues: {:?}", out.issues);
    }

    #[test]
    fn comments_are_stripped() {
        assert_eq!(strip_comments("a % note\nb\\% c %x\n  d"), "a b\\% c d\n");
        assert_eq!(unescaped_percent("50\\% off"), None);
        assert_eq!(unescaped_percent("x\\\\% y"), Some(3));
    }

    #[test]
    fn comments_survive_in_verbatim() {
        let out = strip_comments("\\begin{verbatim}\n  x = 1 % keep\n\\end{verbatim}\n% gone\n");
        assert!(out.contains("  x = 1 % keep"));
        assert!(!out.contains("gone"));
    }

    #[test]
    fn math_is_kept_verbatim() {
        let out = convert("Let $x_{1} + y$ be. \\[ E = mc^2 \\label{e} \\] And $$a$$.");
        assert!(out.markdown.contains("$x_{1} + y$"));
        assert!(out.markdown.contains("$$\nE = mc^2 \\label{e}\n$$"));
        assert!(out.markdown.contains("$$\na\n$$"));
    }

    #[test]
    fn align_becomes_aligned_block() {
        let out = convert("\\begin{align}\na &= b \\label{x}\\\\\nc &= d \\nonumber\n\\end{align}");
        assert!(out
            .markdown
            .contains("$$\n\\begin{aligned}\na &= b \\\\\nc &= d\n\\end{aligned}\n$$"), "got: {}", out.markdown);
    }

    #[test]
    fn citations_and_references() {
        let out = convert("See \\citep[p.~3]{smith20, doe21} and Fig.~\\ref{fig:a}, Eq.~\\eqref{eq:1}.\\label{sec}");
        assert!(out.markdown.contains("[@smith20; @doe21]"));
        assert!(out.markdown.contains("Fig. [fig:a](#fig:a)"));
        assert!(out.markdown.contains("Eq. ([eq:1](#eq:1))"));
        assert!(!out.markdown.contains("sec"));
    }

    #[test]
    fn links_and_footnotes() {
        let out = convert("\\url{https://a.b} \\href{https://c.d}{site}\\footnote{A note.}");
        assert!(out.markdown.contains("<https://a.b>"));
        assert!(out.markdown.contains("[site](https://c.d)"));
        assert!(out.markdown.contains("^[A note.]"));
    }

    #[test]
    fn nested_lists() {
        let out = convert(
            "\\begin{itemize}\n\\item One\n\\item Two\n\\begin{enumerate}\n\\item A\n\\item B\n\\end{enumerate}\n\\end{itemize}",
        );
        assert!(out.markdown.contains("- One\n- Two"), "got: {}", out.markdown);
        assert!(out.markdown.contains("  1. A\n  2. B"), "got: {}", out.markdown);
    }

    #[test]
    fn description_list_uses_labels() {
        let out = convert("\\begin{description}\\item[Key] Value\\end{description}");
        assert!(out.markdown.contains("- **Key** Value"));
    }

    #[test]
    fn figure_becomes_image() {
        let out = convert(
            "\\begin{figure}[t]\\centering\\includegraphics[width=\\linewidth]{figs/plot.png}\\caption{A plot.}\\label{fig:p}\\end{figure}",
        );
        assert!(out.markdown.contains("![A plot.](figs/plot.png)"), "got: {}", out.markdown);
    }

    #[test]
    fn table_becomes_gfm() {
        let out = convert(
            "\\begin{table}\\caption{Results}\\begin{tabular}{l|cc}\\toprule\nName & A & B \\\\\\midrule\nx & 1 & 2 \\\\\n\\multicolumn{2}{c}{wide} & 3 \\\\\\bottomrule\\end{tabular}\\end{table}",
        );
        assert!(out.markdown.contains("*Table: Results*"));
        assert!(
            out.markdown.contains("| Name | A | B |\n| --- | --- | --- |\n| x | 1 | 2 |\n| wide |  | 3 |"),
            "got: {}",
            out.markdown
        );
    }

    #[test]
    fn pipes_in_cells_are_escaped() {
        let out = convert("\\begin{tabular}{ll} a|b & c \\\\ \\end{tabular}");
        assert!(out.markdown.contains("| a\\|b | c |"), "got: {}", out.markdown);
    }

    #[test]
    fn verbatim_becomes_code() {
        let out = convert("\\begin{lstlisting}[language=Python]\nprint('%d' % 1)\n\\end{lstlisting}");
        assert!(out.markdown.contains("```python\nprint('%d' % 1)\n```"), "got: {}", out.markdown);
    }

    #[test]
    fn theorem_and_proof() {
        let out = convert("\\begin{theorem}[Main]All good.\\end{theorem}\\begin{proof}Trivial.\\end{proof}");
        assert!(out.markdown.contains("**Theorem (Main).** All good."));
        assert!(out.markdown.contains("*Proof.* Trivial. \u{220E}"));
    }

    #[test]
    fn abstract_and_quote() {
        let out = convert("\\begin{abstract}We do X.\\end{abstract}\\begin{quote}Wise words.\\end{quote}");
        assert!(out.markdown.contains("## Abstract\n\nWe do X."));
        assert!(out.markdown.contains("> Wise words."));
    }

    #[test]
    fn bibliography_environment() {
        let out = convert(
            "\\begin{thebibliography}{9}\\bibitem{a} A. Author, \\newblock Title.\\bibitem[B]{b} B. Writer.\\end{thebibliography}",
        );
        assert!(out.markdown.contains("## References\n\n- [a] A. Author, Title.\n- [b] B. Writer."), "got: {}", out.markdown);
    }

    #[test]
    fn unknown_constructs_are_recorded() {
        let out = convert("\\mystery{kept} and \\mystery{again}. \\begin{weird}inside\\end{weird}");
        assert!(out.markdown.contains("kept and again."));
        assert!(out.markdown.contains("inside"));
        assert_eq!(issue_count(&out, IssueKind::UnresolvedCommand, "\\mystery"), 2);
        assert_eq!(issue_count(&out, IssueKind::UnhandledEnvironment, "weird"), 1);
    }

    #[test]
    fn diagrams_leave_placeholder() {
        let out = convert("\\begin{tikzpicture}\\draw (0,0) -- (1,1);\\end{tikzpicture}");
        assert!(out.markdown.contains("*[diagram omitted]*"));
        assert_eq!(issue_count(&out, IssueKind::UnhandledEnvironment, "tikzpicture"), 1);
    }

    #[test]
    fn inputs_are_inlined() {
        let resolve = |name: &str| match name {
            "sections/intro" => Some("\\section{Intro}\nFrom file. % c\n".to_string()),
            _ => None,
        };
        let out = convert_source("\\input{sections/intro}\n\\input{missing}", &resolve, None);
        assert!(out.markdown.contains("## Intro\n\nFrom file."));
        assert_eq!(issue_count(&out, IssueKind::MissingInput, "missing"), 1);
    }

    #[test]
    fn self_inclusion_stops_at_depth_limit() {
        let resolve = |_: &str| Some("x\\input{self}".to_string());
        let out = convert_source("\\input{self}", &resolve, None);
        assert_eq!(out.markdown.matches('x').count(), MAX_INPUT_DEPTH);
        assert_eq!(issue_count(&out, IssueKind::MissingInput, "self"), 1);
    }

    #[test]
    fn includegraphics_is_not_an_input() {
        let resolve = |_: &str| -> Option<String> { panic!("must not resolve") };
        let out = convert_source("\\includegraphics{a.png}", &resolve, None);
        assert!(out.markdown.contains("![](a.png)"));
    }

    #[test]
    fn bibliography_is_inlined_from_bbl() {
        let resolve = |name: &str| match name {
            "refs.bbl" => Some("\\begin{thebibliography}{1}\\bibitem{k} Ref.\\end{thebibliography}".to_string()),
            _ => None,
        };
        let out = convert_source("Text \\cite{k}.\n\\bibliography{refs}", &resolve, None);
        assert!(out.markdown.contains("## References"));
        assert!(out.markdown.contains("- [k] Ref."));
    }

    #[test]
    fn simple_macros_expand() {
        let out = convert("\\newcommand{\\method}{FooNet}\n\\begin{document}We use \\method{}.\\end{document}");
        assert!(out.markdown.contains("We use FooNet."), "got: {}", out.markdown);
        assert!(out.issues.is_empty());
    }

    #[test]
    fn runaway_macro_stops_at_expansion_budget() {
        let out = convert("\\newcommand{\\x}{\\x\\x\\x\\x\\x\\x\\x\\x}\\begin{document}\\x\\end{document}");
        assert!(issue_count(&out, IssueKind::LimitExceeded, "\\x") > 0, "issues: {:?}", out.issues);
    }

    #[test]
    fn large_macro_bodies_stop_at_byte_budget() {
        let body = "w".repeat(1024 * 1024);
        let src = format!("\\newcommand{{\\blob}}{{{body}}}\\begin{{document}}{}\\end{{document}}", "\\blob ".repeat(12));
        let out = convert(&src);
        assert_eq!(out.markdown.matches(&body).count(), MAX_EXPANDED_BYTES / body.len());
        assert_eq!(issue_count(&out, IssueKind::LimitExceeded, "\\blob"), 12 - MAX_EXPANDED_BYTES / body.len());
    }

    #[test]
    fn deeply_nested_groups_are_flat() {
        let src = format!("{}x{}", "{".repeat(100_000), "}".repeat(100_000));
        let out = convert(&src);
        assert_eq!(out.markdown.trim(), "x");
        assert!(out.issues.is_empty(), "issues: {:?}", out.issues);
    }

    #[test]
    fn deeply_nested_arguments_are_flattened() {
        let src = format!("{}deep{}", "\\emph{".repeat(20_000), "}".repeat(20_000));
        let out = convert(&src);
        assert!(out.markdown.contains("deep"), "got: {}", &out.markdown[..out.markdown.len().min(200)]);
        assert_eq!(issue_count(&out, IssueKind::LimitExceeded, "nesting depth"), 1);
    }

    #[test]
    fn escaped_non_ascii_in_math() {
        let out = convert("Energy $x \\\u{e9} y$ here, and $\u{e9}$ too.");
        assert!(out.markdown.contains("$x \\\u{e9} y$"), "got: {}", out.markdown);
        assert!(out.markdown.contains("$\u{e9}$ too."), "got: {}", out.markdown);
    }

    #[test]
    fn flatten_keeps_visible_text() {
        assert_eq!(flatten_markup("{\\bf a}~b \\& c\\\\d"), "a b & c\nd");
    }

    #[test]
    fn text_symbols() {
        let out = convert("``Quoted''---dash--range~ok \\& 50\\% \\ldots caf\\'e na\\\"ive \\c{c}a");
        assert!(out
            .markdown
            .contains("\"Quoted\"\u{2014}dash\u{2013}range ok & 50% \u{2026} café naïve ça"), "got: {}", out.markdown);
    }

    #[test]
    fn conversion_is_deterministic() {
        let src = "\\section{A}\\mystery{x}\\begin{odd}y\\end{odd}\\another z";
        assert_eq!(convert(src), convert(src));
    }

    #[test]
    fn plain_text_strips_markup() {
        assert_eq!(to_plain_text("A \\textbf{Bold}\\\\ Title"), "A Bold Title");
    }

    #[test]
    fn command_args_skips_optional() {
        assert_eq!(command_args("\\title[short]{Long}", "title"), vec!["Long"]);
        assert!(command_args("\\titlecase{x}", "title").is_empty());
    }
}
