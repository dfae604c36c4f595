//! PHP language definition

use super::{LanguageDef, SignatureStyle};

/// Tree-sitter query for extracting PHP code chunks
const CHUNK_QUERY: &str = r#"
(function_definition
  name: (name) @name) @function

(method_declaration
  name: (name) @name) @method

(class_declaration
  name: (name) @name) @class

(interface_declaration
  name: (name) @name) @interface

(trait_declaration
  name: (name) @name) @trait

(enum_declaration
  name: (name) @name) @enum
"#;

/// Tree-sitter query for extracting references
const REFERENCE_QUERY: &str = r#"
(function_call_expression
  function: (name) @call)

(member_call_expression
  name: (name) @call)

(scoped_call_expression
  name: (name) @call)

(object_creation_expression
  (name) @call)

(namespace_use_clause
  (qualified_name
    (name) @import))

(base_clause
  (name) @inherit)

(class_interface_clause
  (name) @implement)
"#;

/// Doc comment node types (PHPDoc blocks)
const DOC_NODES: &[&str] = &["comment"];

static DEFINITION: LanguageDef = LanguageDef {
    name: "php",
    grammar: || tree_sitter_php::LANGUAGE_PHP.into(),
    extensions: &["php"],
    chunk_query: CHUNK_QUERY,
    reference_query: REFERENCE_QUERY,
    signature_style: SignatureStyle::UntilBrace,
    method_containers: &["declaration_list"],
    doc_nodes: DOC_NODES,
};

pub fn definition() -> &'static LanguageDef {
    &DEFINITION
}
