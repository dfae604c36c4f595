//! TypeScript language definition

use super::{LanguageDef, SignatureStyle};

/// Tree-sitter query for extracting TypeScript code chunks
const CHUNK_QUERY: &str = r#"
(function_declaration
  name: (identifier) @name) @function

(method_definition
  name: (property_identifier) @name) @method

;; Arrow function assigned to variable: const foo = () => {}
(lexical_declaration
  (variable_declarator
    name: (identifier) @name
    value: (arrow_function) @function))

;; Arrow function assigned with var/let
(variable_declaration
  (variable_declarator
    name: (identifier) @name
    value: (arrow_function) @function))

(class_declaration
  name: (type_identifier) @name) @class

(interface_declaration
  name: (type_identifier) @name) @interface

(enum_declaration
  name: (identifier) @name) @enum

(type_alias_declaration
  name: (type_identifier) @name) @type_alias

;; Immediately-invoked expressions: (() => {})() / (function () {})()
(call_expression
  function: (parenthesized_expression
    [(arrow_function) (function_expression)] @function))

;; Unnamed default-exported class: export default class { }
(export_statement
  (class) @class)
"#;

/// Tree-sitter query for extracting references
const REFERENCE_QUERY: &str = r#"
(call_expression
  function: (identifier) @call)

(call_expression
  function: (member_expression
    property: (property_identifier) @call))

(new_expression
  constructor: (identifier) @call)

(import_specifier
  name: (identifier) @import)

(import_clause
  (identifier) @import)

(extends_clause
  value: (identifier) @inherit)

(implements_clause
  (type_identifier) @implement)
"#;

/// Doc comment node types
const DOC_NODES: &[&str] = &["comment"];

static DEFINITION: LanguageDef = LanguageDef {
    name: "typescript",
    grammar: || tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
    extensions: &["ts", "tsx"],
    chunk_query: CHUNK_QUERY,
    reference_query: REFERENCE_QUERY,
    signature_style: SignatureStyle::UntilBrace,
    method_containers: &["class_body"],
    doc_nodes: DOC_NODES,
};

pub fn definition() -> &'static LanguageDef {
    &DEFINITION
}
