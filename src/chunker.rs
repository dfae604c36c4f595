//! Source chunking with tree-sitter
//!
//! Splits a source file into typed chunks (functions, classes, methods, …)
//! with a stable identity, extracts the references each chunk makes (calls,
//! imports, inheritance) for the graph builder, and computes lightweight
//! complexity metrics per chunk.
//!
//! Failures inside a single declaration are localized: the broken declaration
//! becomes a `chunking_error` issue and traversal continues with the next
//! top-level node. Every file additionally yields one whole-file chunk, which
//! anchors top-level references (imports above all declarations) in the graph.

use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tree_sitter::StreamingIterator;

use crate::errors::ErrorKind;
use crate::graph::EdgeKind;
pub use crate::language::{ChunkKind, Language, SignatureStyle};

/// Errors that abort chunking of a whole file
#[derive(Error, Debug)]
pub enum ChunkerError {
    /// File extension not recognized as a supported language
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),
    /// File exceeds the configured size cap
    #[error("File too large to parse: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },
    /// Tree-sitter failed to parse the file contents
    #[error("Failed to parse: {0}")]
    ParseFailed(String),
    /// Tree-sitter query compilation failed (indicates a bug in the query string)
    #[error("Failed to compile query for {0}: {1}")]
    QueryCompileFailed(String, String),
    /// File read error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChunkerError {
    /// Taxonomy classification for the error log.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            ChunkerError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ErrorKind::FileNotFound
            }
            _ => ErrorKind::ParseError,
        }
    }
}

/// Lightweight per-chunk complexity metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetrics {
    /// Decision points + 1
    pub cyclomatic: u32,
    /// Decision points weighted by nesting depth
    pub cognitive: u32,
    /// Lines of code spanned by the chunk
    pub loc: u32,
}

/// A reference made inside a chunk, resolved later by the graph builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReference {
    /// Referenced identifier as written in the source
    pub name: String,
    /// Edge kind inferred from the syntactic context
    pub kind: EdgeKind,
    /// 1-indexed line of the reference site
    pub line: u32,
}

/// A contiguous, typed unit of source code with stable identity.
///
/// The identity tuple is `(repository, file_path, kind, name, line_start)`;
/// re-indexing unchanged code reproduces the same identities and hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub repository: String,
    /// Path relative to the repository root, forward slashes
    pub file_path: String,
    pub language: Language,
    pub kind: ChunkKind,
    /// Declared name, or `<kind>@<line>` for unnameable chunks
    pub name: String,
    /// False for anonymous constructs (IIFEs, unnamed default exports);
    /// unnameable chunks are excluded from graph edge construction
    pub nameable: bool,
    /// Source body, byte-exact
    pub source: String,
    pub byte_start: usize,
    pub byte_end: usize,
    /// 1-indexed, inclusive
    pub line_start: u32,
    pub line_end: u32,
    /// blake3 hex digest of the body
    pub content_hash: String,
    /// Normalized declaration signature, if any
    pub signature: Option<String>,
    /// Leading doc comment or docstring, if any
    pub doc: Option<String>,
    pub metrics: ChunkMetrics,
    /// References made inside this chunk's span
    pub references: Vec<RawReference>,
}

impl Chunk {
    /// Deterministic chunk id derived from the identity tuple.
    pub fn chunk_id(&self) -> String {
        let key = format!(
            "{}\x1f{}\x1f{}\x1f{}\x1f{}",
            self.repository, self.file_path, self.kind, self.name, self.line_start
        );
        blake3::hash(key.as_bytes()).to_hex()[..16].to_string()
    }

    /// Fully-qualified name within the repository.
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.file_path, self.name)
    }

    /// Directory portion of the file path ("" for top-level files).
    pub fn dir_path(&self) -> &str {
        self.file_path.rsplit_once('/').map_or("", |(d, _)| d)
    }
}

/// A localized failure inside an otherwise chunked file.
#[derive(Debug, Clone)]
pub struct ChunkIssue {
    pub error_kind: ErrorKind,
    pub message: String,
    pub line: Option<u32>,
}

/// Chunks plus the localized failures captured along the way.
#[derive(Debug, Default)]
pub struct ChunkOutcome {
    pub chunks: Vec<Chunk>,
    pub issues: Vec<ChunkIssue>,
}

/// Chunker over the registered language grammars.
///
/// Queries are compiled lazily per language on first use.
pub struct Chunker {
    queries: HashMap<Language, OnceCell<tree_sitter::Query>>,
    reference_queries: HashMap<Language, OnceCell<tree_sitter::Query>>,
    max_file_size: u64,
}

/// Capture names in chunk queries mapped to chunk kinds.
const CAPTURE_KINDS: &[(&str, ChunkKind)] = &[
    ("function", ChunkKind::Function),
    ("method", ChunkKind::Method),
    ("class", ChunkKind::Class),
    ("interface", ChunkKind::Interface),
    ("trait", ChunkKind::Trait),
    ("type_alias", ChunkKind::TypeAlias),
    ("enum", ChunkKind::Enum),
];

/// Callee names that are noise rather than references
const SKIP_REFERENCES: &[&str] = &[
    "self", "this", "super", "parent", "cls", "require", "import", "print", "println",
];

/// Node kinds counted as decision points for complexity metrics
const BRANCH_KINDS: &[&str] = &[
    "if_statement",
    "elif_clause",
    "else_if_clause",
    "conditional_expression",
    "ternary_expression",
    "for_statement",
    "for_in_statement",
    "foreach_statement",
    "while_statement",
    "do_statement",
    "switch_case",
    "case_statement",
    "match_statement",
    "catch_clause",
    "except_clause",
];

impl Chunker {
    /// Create a chunker with the given file-size cap in bytes.
    pub fn new(max_file_size: u64) -> Self {
        let mut queries = HashMap::new();
        let mut reference_queries = HashMap::new();
        for def in crate::language::REGISTRY.all() {
            let lang: Language = def.name.parse().expect("registry/enum mismatch");
            queries.insert(lang, OnceCell::new());
            reference_queries.insert(lang, OnceCell::new());
        }
        Self {
            queries,
            reference_queries,
            max_file_size,
        }
    }

    /// Chunk a file on disk. `file_path` is the repository-relative path used
    /// for chunk identity; `abs_path` is where the bytes live.
    pub fn chunk_file(
        &self,
        repository: &str,
        abs_path: &Path,
        file_path: &str,
    ) -> Result<ChunkOutcome, ChunkerError> {
        let meta = std::fs::metadata(abs_path)?;
        if meta.len() > self.max_file_size {
            return Err(ChunkerError::FileTooLarge {
                size: meta.len(),
                max: self.max_file_size,
            });
        }

        let source = match std::fs::read_to_string(abs_path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(ChunkerError::ParseFailed(format!(
                    "invalid utf-8 in {}",
                    file_path
                )));
            }
            Err(e) => return Err(e.into()),
        };

        // Normalize line endings for consistent hashing across platforms
        let source = source.replace("\r\n", "\n");

        let ext = abs_path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let language = Language::from_extension(ext)
            .ok_or_else(|| ChunkerError::UnsupportedFileType(ext.to_string()))?;

        self.chunk_source(repository, file_path, &source, language)
    }

    /// Chunk in-memory source.
    pub fn chunk_source(
        &self,
        repository: &str,
        file_path: &str,
        source: &str,
        language: Language,
    ) -> Result<ChunkOutcome, ChunkerError> {
        let _span =
            tracing::info_span!("chunk_source", file = file_path, lang = %language).entered();

        if (source.len() as u64) > self.max_file_size {
            return Err(ChunkerError::FileTooLarge {
                size: source.len() as u64,
                max: self.max_file_size,
            });
        }

        match language {
            Language::Vue => self.chunk_vue(repository, file_path, source),
            _ => self.chunk_grammar(repository, file_path, source, language, 0, 0),
        }
    }

    /// Chunk source through a tree-sitter grammar. `line_offset` and
    /// `byte_offset` shift positions for embedded sources (Vue script
    /// blocks) so spans stay file-relative.
    fn chunk_grammar(
        &self,
        repository: &str,
        file_path: &str,
        source: &str,
        language: Language,
        line_offset: u32,
        byte_offset: usize,
    ) -> Result<ChunkOutcome, ChunkerError> {
        let def = language
            .def()
            .ok_or_else(|| ChunkerError::UnsupportedFileType(language.to_string()))?;

        let grammar = (def.grammar)();
        let mut parser = tree_sitter::Parser::new();
        parser
            .set_language(&grammar)
            .map_err(|e| ChunkerError::ParseFailed(format!("{:?}", e)))?;

        let tree = parser
            .parse(source, None)
            .ok_or_else(|| ChunkerError::ParseFailed(file_path.to_string()))?;

        let query = self.get_query(language)?;
        let mut cursor = tree_sitter::QueryCursor::new();
        let mut matches = cursor.matches(query, tree.root_node(), source.as_bytes());

        let mut outcome = ChunkOutcome::default();

        while let Some(m) = matches.next() {
            match self.extract_chunk(
                repository,
                file_path,
                source,
                m,
                query,
                language,
                line_offset,
                byte_offset,
            ) {
                Ok(chunk) => outcome.chunks.push(chunk),
                Err(e) => {
                    let line = m
                        .captures
                        .first()
                        .map(|c| c.node.start_position().row as u32 + 1 + line_offset);
                    tracing::warn!(file = file_path, error = %e, "Failed to extract chunk");
                    outcome.issues.push(ChunkIssue {
                        error_kind: ErrorKind::ChunkingError,
                        message: e.to_string(),
                        line,
                    });
                }
            }
        }

        // Source order, then enclosing-before-enclosed for equal starts
        outcome
            .chunks
            .sort_by_key(|c| (c.byte_start, std::cmp::Reverse(c.byte_end)));

        // Whole-file chunk anchors top-level references and keeps files with
        // no extractable declarations searchable
        let file_chunk =
            self.file_chunk(repository, file_path, source, language, line_offset, byte_offset);
        outcome.chunks.insert(0, file_chunk);

        self.attach_references(source, language, line_offset, byte_offset, &mut outcome.chunks)?;

        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn extract_chunk(
        &self,
        repository: &str,
        file_path: &str,
        source: &str,
        m: &tree_sitter::QueryMatch<'_, '_>,
        query: &tree_sitter::Query,
        language: Language,
        line_offset: u32,
        byte_offset: usize,
    ) -> Result<Chunk, ChunkerError> {
        // Find which definition capture matched and get its node
        let (node, base_kind) = CAPTURE_KINDS
            .iter()
            .find_map(|(name, kind)| {
                query
                    .capture_index_for_name(name)
                    .and_then(|idx| m.captures.iter().find(|c| c.index == idx))
                    .map(|c| (c.node, *kind))
            })
            .ok_or_else(|| {
                ChunkerError::ParseFailed("No definition capture found in match".into())
            })?;

        let line_start = node.start_position().row as u32 + 1 + line_offset;
        let line_end = node.end_position().row as u32 + 1 + line_offset;

        // Name capture is absent for anonymous constructs
        let name_node = query
            .capture_index_for_name("name")
            .and_then(|idx| m.captures.iter().find(|c| c.index == idx));
        let (name, nameable) = match name_node {
            Some(c) => (source[c.node.byte_range()].to_string(), true),
            None => (format!("{}@{}", base_kind, line_start), false),
        };

        let kind = if base_kind == ChunkKind::Function {
            self.infer_method(node, language)
        } else {
            base_kind
        };

        let content = source[node.byte_range()].to_string();
        let signature = extract_signature(&content, language);
        let doc = extract_doc(node, source, language);
        let metrics = compute_metrics(node, line_start, line_end);
        let content_hash = blake3::hash(content.as_bytes()).to_hex().to_string();

        Ok(Chunk {
            repository: repository.to_string(),
            file_path: file_path.to_string(),
            language,
            kind,
            name,
            nameable,
            source: content,
            byte_start: node.start_byte() + byte_offset,
            byte_end: node.end_byte() + byte_offset,
            line_start,
            line_end,
            content_hash,
            signature,
            doc,
            metrics,
            references: Vec::new(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn file_chunk(
        &self,
        repository: &str,
        file_path: &str,
        source: &str,
        language: Language,
        line_offset: u32,
        byte_offset: usize,
    ) -> Chunk {
        let name = file_path
            .rsplit('/')
            .next()
            .and_then(|f| f.split('.').next())
            .unwrap_or(file_path)
            .to_string();
        let line_end = source.lines().count().max(1) as u32 + line_offset;
        Chunk {
            repository: repository.to_string(),
            file_path: file_path.to_string(),
            language,
            kind: ChunkKind::File,
            name,
            nameable: true,
            source: source.to_string(),
            byte_start: byte_offset,
            byte_end: byte_offset + source.len(),
            line_start: 1 + line_offset,
            line_end,
            content_hash: blake3::hash(source.as_bytes()).to_hex().to_string(),
            signature: None,
            doc: None,
            metrics: ChunkMetrics {
                cyclomatic: 1,
                cognitive: 0,
                loc: line_end - line_offset,
            },
            references: Vec::new(),
        }
    }

    /// Run the reference query over the file and attach each reference to the
    /// smallest enclosing chunk (the whole-file chunk catches top-level
    /// imports outside any declaration).
    fn attach_references(
        &self,
        source: &str,
        language: Language,
        line_offset: u32,
        byte_offset: usize,
        chunks: &mut [Chunk],
    ) -> Result<(), ChunkerError> {
        let Some(def) = language.def() else {
            return Ok(());
        };

        let grammar = (def.grammar)();
        let mut parser = tree_sitter::Parser::new();
        if parser.set_language(&grammar).is_err() {
            return Ok(());
        }
        let Some(tree) = parser.parse(source, None) else {
            return Ok(());
        };

        let query = self.get_reference_query(language)?;
        let capture_names = query.capture_names();
        let mut cursor = tree_sitter::QueryCursor::new();
        let mut matches = cursor.matches(query, tree.root_node(), source.as_bytes());

        while let Some(m) = matches.next() {
            for cap in m.captures {
                let kind = match capture_names[cap.index as usize] {
                    "call" => EdgeKind::Calls,
                    "import" => EdgeKind::Imports,
                    "inherit" => EdgeKind::Inherits,
                    "implement" => EdgeKind::Implements,
                    _ => EdgeKind::References,
                };
                let name = source[cap.node.byte_range()].to_string();
                if SKIP_REFERENCES.contains(&name.as_str()) {
                    continue;
                }
                let byte = cap.node.start_byte() + byte_offset;
                let line = cap.node.start_position().row as u32 + 1 + line_offset;

                // Smallest enclosing chunk wins; the file chunk spans everything
                let target = chunks
                    .iter_mut()
                    .filter(|c| c.byte_start <= byte && byte < c.byte_end)
                    .min_by_key(|c| c.byte_end - c.byte_start);
                if let Some(chunk) = target {
                    chunk.references.push(RawReference { name, kind, line });
                }
            }
        }

        Ok(())
    }

    /// Split a Vue single-file component into template/script/style section
    /// chunks; the script body is additionally chunked with the JS/TS grammar.
    fn chunk_vue(
        &self,
        repository: &str,
        file_path: &str,
        source: &str,
    ) -> Result<ChunkOutcome, ChunkerError> {
        let mut outcome = ChunkOutcome::default();

        let file_chunk = self.file_chunk(repository, file_path, source, Language::Vue, 0, 0);
        outcome.chunks.push(file_chunk);

        for section in split_vue_sections(source) {
            let content_hash = blake3::hash(section.body.as_bytes()).to_hex().to_string();
            outcome.chunks.push(Chunk {
                repository: repository.to_string(),
                file_path: file_path.to_string(),
                language: Language::Vue,
                kind: ChunkKind::ComponentBlock,
                name: section.tag.to_string(),
                nameable: true,
                source: section.body.clone(),
                byte_start: section.byte_start,
                byte_end: section.byte_end,
                line_start: section.line_start,
                line_end: section.line_end,
                content_hash,
                signature: None,
                doc: None,
                metrics: ChunkMetrics {
                    cyclomatic: 1,
                    cognitive: 0,
                    loc: section.line_end - section.line_start + 1,
                },
                references: Vec::new(),
            });

            if section.tag == "script" {
                let script_lang = if section.lang.as_deref() == Some("ts") {
                    Language::TypeScript
                } else {
                    Language::JavaScript
                };
                match self.chunk_grammar(
                    repository,
                    file_path,
                    &section.body,
                    script_lang,
                    section.line_start - 1,
                    section.byte_start,
                ) {
                    Ok(mut inner) => {
                        // The embedded file chunk duplicates the component_block
                        inner.chunks.retain(|c| c.kind != ChunkKind::File);
                        outcome.chunks.extend(inner.chunks);
                        outcome.issues.extend(inner.issues);
                    }
                    Err(e) => outcome.issues.push(ChunkIssue {
                        error_kind: ErrorKind::ChunkingError,
                        message: format!("vue script block: {}", e),
                        line: Some(section.line_start),
                    }),
                }
            }
        }

        Ok(outcome)
    }

    fn infer_method(&self, node: tree_sitter::Node, language: Language) -> ChunkKind {
        let Some(def) = language.def() else {
            return ChunkKind::Function;
        };
        let mut current = node.parent();
        while let Some(parent) = current {
            if def.method_containers.contains(&parent.kind()) {
                return ChunkKind::Method;
            }
            current = parent.parent();
        }
        ChunkKind::Function
    }

    fn get_query(&self, language: Language) -> Result<&tree_sitter::Query, ChunkerError> {
        let cell = self.queries.get(&language).ok_or_else(|| {
            ChunkerError::QueryCompileFailed(language.to_string(), "not registered".into())
        })?;
        cell.get_or_try_init(|| {
            let def = language
                .def()
                .ok_or_else(|| ChunkerError::UnsupportedFileType(language.to_string()))?;
            tree_sitter::Query::new(&(def.grammar)(), def.chunk_query).map_err(|e| {
                ChunkerError::QueryCompileFailed(language.to_string(), format!("{:?}", e))
            })
        })
    }

    fn get_reference_query(&self, language: Language) -> Result<&tree_sitter::Query, ChunkerError> {
        let cell = self.reference_queries.get(&language).ok_or_else(|| {
            ChunkerError::QueryCompileFailed(language.to_string(), "not registered".into())
        })?;
        cell.get_or_try_init(|| {
            let def = language
                .def()
                .ok_or_else(|| ChunkerError::UnsupportedFileType(language.to_string()))?;
            tree_sitter::Query::new(&(def.grammar)(), def.reference_query).map_err(|e| {
                ChunkerError::QueryCompileFailed(
                    format!("{}_references", language),
                    format!("{:?}", e),
                )
            })
        })
    }
}

fn extract_signature(content: &str, language: Language) -> Option<String> {
    let style = language
        .def()
        .map(|d| d.signature_style)
        .unwrap_or_default();
    let sig_end = match style {
        SignatureStyle::UntilBrace => content.find('{')?,
        SignatureStyle::UntilColon => content.find(':')?,
    };
    let sig = content[..sig_end]
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if sig.is_empty() {
        None
    } else {
        Some(sig)
    }
}

fn extract_doc(node: tree_sitter::Node, source: &str, language: Language) -> Option<String> {
    // Python docstring: first statement of the body
    if language == Language::Python {
        if let Some(body) = node.child_by_field_name("body") {
            if let Some(first) = body.named_child(0) {
                if first.kind() == "expression_statement" {
                    if let Some(string) = first.named_child(0) {
                        if string.kind() == "string" {
                            return Some(source[string.byte_range()].to_string());
                        }
                    }
                }
            }
        }
        return None;
    }

    let doc_nodes = language.def().map(|d| d.doc_nodes).unwrap_or(&[]);

    // Comments attach to the export wrapper, not the inner declaration
    let anchor = match node.parent() {
        Some(parent) if parent.kind() == "export_statement" => parent,
        _ => node,
    };

    let mut comments = Vec::new();
    let mut current = anchor.prev_sibling();
    while let Some(sibling) = current {
        if doc_nodes.contains(&sibling.kind()) {
            comments.push(source[sibling.byte_range()].to_string());
            current = sibling.prev_sibling();
        } else {
            break;
        }
    }
    if comments.is_empty() {
        return None;
    }
    comments.reverse();
    Some(comments.join("\n"))
}

/// Cyclomatic and cognitive complexity from the declaration subtree.
fn compute_metrics(node: tree_sitter::Node, line_start: u32, line_end: u32) -> ChunkMetrics {
    fn walk(node: tree_sitter::Node, depth: u32, cyclomatic: &mut u32, cognitive: &mut u32) {
        let is_branch = BRANCH_KINDS.contains(&node.kind());
        if is_branch {
            *cyclomatic += 1;
            *cognitive += 1 + depth;
        }
        let child_depth = depth + u32::from(is_branch);
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            walk(child, child_depth, cyclomatic, cognitive);
        }
    }

    let mut cyclomatic = 1;
    let mut cognitive = 0;
    walk(node, 0, &mut cyclomatic, &mut cognitive);
    ChunkMetrics {
        cyclomatic,
        cognitive,
        loc: line_end.saturating_sub(line_start) + 1,
    }
}

struct VueSection {
    tag: &'static str,
    lang: Option<String>,
    body: String,
    byte_start: usize,
    byte_end: usize,
    line_start: u32,
    line_end: u32,
}

/// Section-split a Vue SFC by scanning for top-level `<template>`, `<script>`
/// and `<style>` blocks. Attribute parsing is limited to `lang="…"`, which is
/// all the chunker needs to pick a grammar for the script body.
fn split_vue_sections(source: &str) -> Vec<VueSection> {
    let mut sections = Vec::new();
    for tag in ["template", "script", "style"] {
        let open_prefix = format!("<{}", tag);
        let close_tag = format!("</{}>", tag);

        let mut search_from = 0;
        while let Some(rel) = source[search_from..].find(&open_prefix) {
            let open_at = search_from + rel;
            // Top-level tags start at column 0
            let at_line_start = open_at == 0 || source.as_bytes()[open_at - 1] == b'\n';
            let Some(tag_end_rel) = source[open_at..].find('>') else {
                break;
            };
            let tag_end = open_at + tag_end_rel + 1;
            if !at_line_start {
                search_from = tag_end;
                continue;
            }

            let attrs = &source[open_at..tag_end];
            let lang = attrs
                .split_once("lang=\"")
                .and_then(|(_, rest)| rest.split_once('"'))
                .map(|(l, _)| l.to_string());

            let Some(close_rel) = source[tag_end..].find(&close_tag) else {
                break;
            };
            let raw_start = tag_end;
            let raw_end = tag_end + close_rel;

            // Trim surrounding newlines but keep offsets file-relative
            let raw = &source[raw_start..raw_end];
            let leading = raw.len() - raw.trim_start_matches('\n').len();
            let body = raw.trim_matches('\n').to_string();
            let byte_start = raw_start + leading;
            let byte_end = byte_start + body.len();

            let line_start = source[..byte_start].matches('\n').count() as u32 + 1;
            let line_end = line_start + body.matches('\n').count() as u32;

            sections.push(VueSection {
                tag,
                lang,
                body,
                byte_start,
                byte_end,
                line_start,
                line_end,
            });
            search_from = raw_end + close_tag.len();
        }
    }
    sections.sort_by_key(|s| s.byte_start);
    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> Chunker {
        Chunker::new(1_048_576)
    }

    #[test]
    fn test_python_function_and_class() {
        let source = r#"
import os

def greet(name):
    """Say hello."""
    return f"hello {name}"

class Greeter:
    def shout(self, name):
        if name:
            return greet(name).upper()
        return ""
"#;
        let outcome = chunker()
            .chunk_source("repo", "src/greet.py", source, Language::Python)
            .unwrap();
        assert!(outcome.issues.is_empty());

        let file = &outcome.chunks[0];
        assert_eq!(file.kind, ChunkKind::File);
        assert_eq!(file.name, "greet");
        // Top-level import lands on the file chunk
        assert!(file
            .references
            .iter()
            .any(|r| r.name == "os" && r.kind == EdgeKind::Imports));

        let greet = outcome
            .chunks
            .iter()
            .find(|c| c.name == "greet" && c.kind == ChunkKind::Function)
            .expect("greet function");
        assert_eq!(greet.doc.as_deref(), Some("\"\"\"Say hello.\"\"\""));
        assert!(greet.nameable);

        let shout = outcome
            .chunks
            .iter()
            .find(|c| c.name == "shout")
            .expect("shout method");
        assert_eq!(shout.kind, ChunkKind::Method);
        assert!(shout
            .references
            .iter()
            .any(|r| r.name == "greet" && r.kind == EdgeKind::Calls));
        assert_eq!(shout.metrics.cyclomatic, 2);
    }

    #[test]
    fn test_typescript_declarations() {
        let source = r#"
interface Parser {
  parse(input: string): Tree;
}

export class TreeParser implements Parser {
  parse(input: string): Tree {
    return buildTree(input);
  }
}

export const parseTree = (input: string) => {
  return new TreeParser().parse(input);
};

enum Mode { Fast, Slow }

type Tree = { root: string };
"#;
        let outcome = chunker()
            .chunk_source("repo", "src/parse.ts", source, Language::TypeScript)
            .unwrap();

        let kinds: Vec<(ChunkKind, &str)> = outcome
            .chunks
            .iter()
            .map(|c| (c.kind, c.name.as_str()))
            .collect();
        assert!(kinds.contains(&(ChunkKind::Interface, "Parser")));
        assert!(kinds.contains(&(ChunkKind::Class, "TreeParser")));
        assert!(kinds.contains(&(ChunkKind::Function, "parseTree")));
        assert!(kinds.contains(&(ChunkKind::Enum, "Mode")));
        assert!(kinds.contains(&(ChunkKind::TypeAlias, "Tree")));

        let class = outcome
            .chunks
            .iter()
            .find(|c| c.name == "TreeParser")
            .unwrap();
        assert!(class
            .references
            .iter()
            .any(|r| r.name == "Parser" && r.kind == EdgeKind::Implements));

        let parse = outcome
            .chunks
            .iter()
            .find(|c| c.name == "parse" && c.kind == ChunkKind::Method)
            .expect("parse method");
        assert!(parse
            .references
            .iter()
            .any(|r| r.name == "buildTree" && r.kind == EdgeKind::Calls));
    }

    #[test]
    fn test_anonymous_chunks_flagged_unnameable() {
        let source = r#"
(function () {
  setup();
})();
"#;
        let outcome = chunker()
            .chunk_source("repo", "src/iife.js", source, Language::JavaScript)
            .unwrap();
        let anon = outcome
            .chunks
            .iter()
            .find(|c| !c.nameable)
            .expect("anonymous chunk");
        assert_eq!(anon.kind, ChunkKind::Function);
        assert_eq!(anon.name, format!("function@{}", anon.line_start));
    }

    #[test]
    fn test_identity_stable_across_reindex() {
        let source = "def alpha():\n    return 1\n";
        let c = chunker();
        let first = c
            .chunk_source("repo", "a.py", source, Language::Python)
            .unwrap();
        let second = c
            .chunk_source("repo", "a.py", source, Language::Python)
            .unwrap();

        let ids1: Vec<String> = first.chunks.iter().map(|c| c.chunk_id()).collect();
        let ids2: Vec<String> = second.chunks.iter().map(|c| c.chunk_id()).collect();
        assert_eq!(ids1, ids2);

        let hashes1: Vec<&str> = first.chunks.iter().map(|c| c.content_hash.as_str()).collect();
        let hashes2: Vec<&str> = second.chunks.iter().map(|c| c.content_hash.as_str()).collect();
        assert_eq!(hashes1, hashes2);
    }

    #[test]
    fn test_php_class_and_methods() {
        let source = r#"<?php
class OrderService extends BaseService {
    public function total(array $items): float {
        return array_sum($items);
    }
}
"#;
        let outcome = chunker()
            .chunk_source("repo", "src/Order.php", source, Language::Php)
            .unwrap();

        let class = outcome
            .chunks
            .iter()
            .find(|c| c.name == "OrderService")
            .expect("class chunk");
        assert_eq!(class.kind, ChunkKind::Class);
        assert!(class
            .references
            .iter()
            .any(|r| r.name == "BaseService" && r.kind == EdgeKind::Inherits));

        let total = outcome.chunks.iter().find(|c| c.name == "total").unwrap();
        assert_eq!(total.kind, ChunkKind::Method);
    }

    #[test]
    fn test_vue_section_split() {
        let source = "<template>\n  <div>{{ count }}</div>\n</template>\n\n<script lang=\"ts\">\nexport function increment(n: number): number {\n  return n + 1;\n}\n</script>\n\n<style>\n.counter { color: red; }\n</style>\n";
        let outcome = chunker()
            .chunk_source("repo", "src/Counter.vue", source, Language::Vue)
            .unwrap();

        let blocks: Vec<&str> = outcome
            .chunks
            .iter()
            .filter(|c| c.kind == ChunkKind::ComponentBlock)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(blocks, vec!["template", "script", "style"]);

        // Script body is chunked with the TypeScript grammar
        let inc = outcome
            .chunks
            .iter()
            .find(|c| c.name == "increment")
            .expect("script function");
        assert_eq!(inc.kind, ChunkKind::Function);
        assert_eq!(inc.language, Language::TypeScript);
        // Line numbers are file-relative, not script-relative
        assert!(inc.line_start > 4, "line {} should be offset", inc.line_start);
    }

    #[test]
    fn test_oversize_file_rejected() {
        let c = Chunker::new(16);
        let err = c
            .chunk_source("repo", "big.py", "def f():\n    return 12345\n", Language::Python)
            .unwrap_err();
        assert!(matches!(err, ChunkerError::FileTooLarge { .. }));
        assert_eq!(err.error_kind(), ErrorKind::ParseError);
    }

    #[test]
    fn test_chunks_in_source_order() {
        let source = "def b():\n    pass\n\ndef a():\n    pass\n";
        let outcome = chunker()
            .chunk_source("repo", "o.py", source, Language::Python)
            .unwrap();
        let starts: Vec<u32> = outcome.chunks.iter().map(|c| c.line_start).collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
    }
}
