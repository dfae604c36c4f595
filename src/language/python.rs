//! Python language definition

use super::{LanguageDef, SignatureStyle};

/// Tree-sitter query for extracting Python code chunks
const CHUNK_QUERY: &str = r#"
(function_definition
  name: (identifier) @name) @function

(class_definition
  name: (identifier) @name) @class
"#;

/// Tree-sitter query for extracting references.
///
/// Capture names map onto edge kinds: @call, @import, @inherit, @reference.
const REFERENCE_QUERY: &str = r#"
(call
  function: (identifier) @call)

(call
  function: (attribute
    attribute: (identifier) @call))

(import_statement
  name: (dotted_name
    (identifier) @import))

(import_from_statement
  name: (dotted_name
    (identifier) @import))

(class_definition
  superclasses: (argument_list
    (identifier) @inherit))

(decorator
  (identifier) @reference)
"#;

/// Doc comment node types (docstrings are handled separately by the chunker)
const DOC_NODES: &[&str] = &["comment"];

static DEFINITION: LanguageDef = LanguageDef {
    name: "python",
    grammar: || tree_sitter_python::LANGUAGE.into(),
    extensions: &["py", "pyi"],
    chunk_query: CHUNK_QUERY,
    reference_query: REFERENCE_QUERY,
    signature_style: SignatureStyle::UntilColon,
    method_containers: &["class_definition"],
    doc_nodes: DOC_NODES,
};

pub fn definition() -> &'static LanguageDef {
    &DEFINITION
}
