//! Language registry for the chunker
//!
//! Each supported language ships a tree-sitter grammar, a chunk-extraction
//! query and a reference-extraction query. Vue is the exception: single-file
//! components are section-split by the chunker itself and their `<script>`
//! block is delegated to the JavaScript/TypeScript grammar, so Vue carries no
//! grammar of its own.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

mod javascript;
mod php;
mod python;
mod typescript;

/// A language definition with all parsing configuration
pub struct LanguageDef {
    /// Language name (e.g., "python")
    pub name: &'static str,
    /// Function to get the tree-sitter grammar
    pub grammar: fn() -> tree_sitter::Language,
    /// File extensions for this language
    pub extensions: &'static [&'static str],
    /// Tree-sitter query for extracting code chunks
    pub chunk_query: &'static str,
    /// Tree-sitter query for extracting references (capture name = edge kind)
    pub reference_query: &'static str,
    /// How to extract signatures
    pub signature_style: SignatureStyle,
    /// Ancestor node kinds that turn a function into a method
    pub method_containers: &'static [&'static str],
    /// Node types that carry doc comments
    pub doc_nodes: &'static [&'static str],
}

/// How to extract declaration signatures
#[derive(Debug, Clone, Copy, Default)]
pub enum SignatureStyle {
    /// Extract until opening brace `{` (JS, TS, PHP)
    #[default]
    UntilBrace,
    /// Extract until colon `:` (Python)
    UntilColon,
}

/// Supported source languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Php,
    Vue,
}

impl Language {
    /// Resolve a language from a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "py" | "pyi" => Some(Language::Python),
            "js" | "jsx" | "mjs" | "cjs" => Some(Language::JavaScript),
            "ts" | "tsx" => Some(Language::TypeScript),
            "php" => Some(Language::Php),
            "vue" => Some(Language::Vue),
            _ => None,
        }
    }

    /// Grammar-backed definition; `None` for Vue (section-split instead).
    pub fn def(self) -> Option<&'static LanguageDef> {
        match self {
            Language::Vue => None,
            other => REGISTRY.get(other.as_str()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Php => "php",
            Language::Vue => "vue",
        }
    }

    /// All extensions the indexing pipeline accepts by default.
    pub fn supported_extensions() -> &'static [&'static str] {
        &["py", "pyi", "js", "jsx", "mjs", "cjs", "ts", "tsx", "php", "vue"]
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(Language::Python),
            "javascript" => Ok(Language::JavaScript),
            "typescript" => Ok(Language::TypeScript),
            "php" => Ok(Language::Php),
            "vue" => Ok(Language::Vue),
            other => Err(format!("unknown language: '{}'", other)),
        }
    }
}

/// Type of code element extracted by the chunker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// Whole-file chunk (fallback for files with no extractable declarations)
    File,
    Class,
    Function,
    Method,
    Interface,
    Trait,
    TypeAlias,
    Enum,
    /// Vue SFC section (template / script / style)
    ComponentBlock,
}

impl ChunkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkKind::File => "file",
            ChunkKind::Class => "class",
            ChunkKind::Function => "function",
            ChunkKind::Method => "method",
            ChunkKind::Interface => "interface",
            ChunkKind::Trait => "trait",
            ChunkKind::TypeAlias => "type_alias",
            ChunkKind::Enum => "enum",
            ChunkKind::ComponentBlock => "component_block",
        }
    }
}

impl std::fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChunkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(ChunkKind::File),
            "class" => Ok(ChunkKind::Class),
            "function" => Ok(ChunkKind::Function),
            "method" => Ok(ChunkKind::Method),
            "interface" => Ok(ChunkKind::Interface),
            "trait" => Ok(ChunkKind::Trait),
            "type_alias" => Ok(ChunkKind::TypeAlias),
            "enum" => Ok(ChunkKind::Enum),
            "component_block" => Ok(ChunkKind::ComponentBlock),
            other => Err(format!("unknown chunk kind: '{}'", other)),
        }
    }
}

/// Global language registry
pub static REGISTRY: LazyLock<LanguageRegistry> = LazyLock::new(LanguageRegistry::new);

/// Registry of grammar-backed languages, indexed by name and extension.
pub struct LanguageRegistry {
    by_name: HashMap<&'static str, &'static LanguageDef>,
}

impl LanguageRegistry {
    fn new() -> Self {
        let mut reg = Self {
            by_name: HashMap::new(),
        };
        reg.register(python::definition());
        reg.register(javascript::definition());
        reg.register(typescript::definition());
        reg.register(php::definition());
        reg
    }

    fn register(&mut self, def: &'static LanguageDef) {
        self.by_name.insert(def.name, def);
    }

    /// Get a language definition by name
    pub fn get(&self, name: &str) -> Option<&'static LanguageDef> {
        self.by_name.get(name).copied()
    }

    /// Iterate over all registered languages
    pub fn all(&self) -> impl Iterator<Item = &'static LanguageDef> + '_ {
        self.by_name.values().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_extension() {
        assert_eq!(Language::from_extension("py"), Some(Language::Python));
        assert_eq!(Language::from_extension("tsx"), Some(Language::TypeScript));
        assert_eq!(Language::from_extension("php"), Some(Language::Php));
        assert_eq!(Language::from_extension("vue"), Some(Language::Vue));
        assert_eq!(Language::from_extension("rs"), None);
    }

    #[test]
    fn test_vue_has_no_grammar() {
        assert!(Language::Vue.def().is_none());
        assert!(Language::Python.def().is_some());
        assert!(Language::Php.def().is_some());
    }

    #[test]
    fn test_chunk_queries_compile() {
        for def in REGISTRY.all() {
            let grammar = (def.grammar)();
            tree_sitter::Query::new(&grammar, def.chunk_query)
                .unwrap_or_else(|e| panic!("{} chunk query: {:?}", def.name, e));
            tree_sitter::Query::new(&grammar, def.reference_query)
                .unwrap_or_else(|e| panic!("{} reference query: {:?}", def.name, e));
        }
    }

    #[test]
    fn test_chunk_kind_round_trip() {
        for kind in [
            ChunkKind::File,
            ChunkKind::Class,
            ChunkKind::Function,
            ChunkKind::Method,
            ChunkKind::Interface,
            ChunkKind::Trait,
            ChunkKind::TypeAlias,
            ChunkKind::Enum,
            ChunkKind::ComponentBlock,
        ] {
            let parsed: ChunkKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
