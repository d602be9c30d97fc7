//! Symbol Extraction
//!
//! Declarations pulled out of source files with tree-sitter, so nested and
//! multi-line declarations are found the way the compiler sees them. The
//! grammar is picked from the file extension; files in other languages yield
//! no symbols.

use std::path::Path;

use tree_sitter::{Language, Node, Parser};

/// Languages with a bundled grammar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLanguage {
    Rust,
    Python,
    TypeScript,
    /// TSX grammar, also used for plain JavaScript
    Tsx,
    Go,
    Java,
}

impl SourceLanguage {
    pub fn from_path(path: &str) -> Option<Self> {
        let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "rs" => Some(Self::Rust),
            "py" => Some(Self::Python),
            "ts" => Some(Self::TypeScript),
            "tsx" | "js" | "jsx" | "mjs" | "cjs" => Some(Self::Tsx),
            "go" => Some(Self::Go),
            "java" => Some(Self::Java),
            _ => None,
        }
    }

    fn grammar(self) -> Language {
        match self {
            Self::Rust => tree_sitter_rust::LANGUAGE.into(),
            Self::Python => tree_sitter_python::LANGUAGE.into(),
            Self::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Self::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
            Self::Go => tree_sitter_go::LANGUAGE.into(),
            Self::Java => tree_sitter_java::LANGUAGE.into(),
        }
    }

    /// Kind recorded for a declaring node, `None` for anything else
    fn symbol_kind(self, node_kind: &str) -> Option<SymbolKind> {
        use SymbolKind::*;
        match (self, node_kind) {
            (Self::Rust, "function_item" | "function_signature_item") => Some(Function),
            (Self::Rust, "struct_item" | "union_item") => Some(Struct),
            (Self::Rust, "enum_item") => Some(Enum),
            (Self::Rust, "trait_item") => Some(Interface),
            (Self::Rust, "type_item") => Some(Type),
            (Self::Rust, "mod_item") => Some(Module),
            (Self::Rust, "const_item" | "static_item") => Some(Const),

            (Self::Python, "function_definition") => Some(Function),
            (Self::Python, "class_definition") => Some(Class),

            (Self::TypeScript | Self::Tsx, "function_declaration" | "method_definition") => {
                Some(Function)
            }
            (Self::TypeScript | Self::Tsx, "class_declaration" | "abstract_class_declaration") => {
                Some(Class)
            }
            (Self::TypeScript | Self::Tsx, "interface_declaration") => Some(Interface),
            (Self::TypeScript | Self::Tsx, "type_alias_declaration") => Some(Type),
            (Self::TypeScript | Self::Tsx, "enum_declaration") => Some(Enum),
            (Self::TypeScript | Self::Tsx, "lexical_declaration") => Some(Const),

            (Self::Go, "function_declaration" | "method_declaration") => Some(Function),
            (Self::Go, "type_declaration") => Some(Type),

            (Self::Java, "method_declaration" | "constructor_declaration") => Some(Function),
            (Self::Java, "class_declaration" | "record_declaration") => Some(Class),
            (Self::Java, "interface_declaration") => Some(Interface),
            (Self::Java, "enum_declaration") => Some(Enum),
            _ => None,
        }
    }

    /// Nodes whose nested declarations are qualified by the node's name
    fn is_scope(self, node_kind: &str) -> bool {
        match self {
            Self::Rust => matches!(
                node_kind,
                "struct_item" | "enum_item" | "trait_item" | "impl_item" | "mod_item"
            ),
            Self::Python => node_kind == "class_definition",
            Self::TypeScript | Self::Tsx => matches!(
                node_kind,
                "class_declaration" | "abstract_class_declaration" | "interface_declaration"
            ),
            Self::Go => false,
            Self::Java => matches!(
                node_kind,
                "class_declaration" | "record_declaration" | "interface_declaration" | "enum_declaration"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Struct,
    Class,
    Enum,
    Interface,
    Type,
    Module,
    Const,
}

/// One declaration found in a source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSymbol {
    pub name: String,
    pub kind: SymbolKind,
    /// Enclosing type, impl target or Go receiver
    pub parent: Option<String>,
    /// 1-based
    pub line: usize,
    /// The declaring line, trimmed
    pub signature: String,
}

impl CodeSymbol {
    /// `Parent.name` for nested declarations, the bare name otherwise
    pub fn qualified_name(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{}.{}", parent, self.name),
            None => self.name.clone(),
        }
    }
}

/// Declarations in `content`, in source order and unique by qualified name.
///
/// The grammar comes from `path`'s extension. At most `max_symbols` are
/// returned.
pub fn parse_symbols(path: &str, content: &str, max_symbols: usize) -> Vec<CodeSymbol> {
    let Some(language) = SourceLanguage::from_path(path) else {
        return Vec::new();
    };
    let mut parser = Parser::new();
    if let Err(e) = parser.set_language(&language.grammar()) {
        tracing::warn!(path, error = %e, "Grammar rejected by parser");
        return Vec::new();
    }
    let Some(tree) = parser.parse(content, None) else {
        return Vec::new();
    };

    let mut walk = SymbolWalk {
        language,
        source: content,
        lines: content.lines().collect(),
        max_symbols,
        symbols: Vec::new(),
    };
    walk.visit(tree.root_node(), None);
    walk.symbols
}

struct SymbolWalk<'a> {
    language: SourceLanguage,
    source: &'a str,
    lines: Vec<&'a str>,
    max_symbols: usize,
    symbols: Vec<CodeSymbol>,
}

impl SymbolWalk<'_> {
    fn full(&self) -> bool {
        self.symbols.len() >= self.max_symbols
    }

    fn visit(&mut self, node: Node, parent: Option<&str>) {
        if self.full() {
            return;
        }
        if let Some(symbol) = self.symbol_at(node, parent) {
            if !self
                .symbols
                .iter()
                .any(|s| s.qualified_name() == symbol.qualified_name())
            {
                self.symbols.push(symbol);
            }
        }

        let scope = if self.language.is_scope(node.kind()) {
            self.scope_name(node)
        } else {
            None
        };
        let child_parent = scope.as_deref().or(parent);
        for i in 0..node.child_count() {
            if self.full() {
                return;
            }
            if let Some(child) = node.child(i) {
                self.visit(child, child_parent);
            }
        }
    }

    fn symbol_at(&self, node: Node, parent: Option<&str>) -> Option<CodeSymbol> {
        let kind = self.language.symbol_kind(node.kind())?;
        let (name, kind, parent) = match node.kind() {
            "lexical_declaration" => {
                // Only module-level constants; locals inside bodies are noise
                let outer = node.parent()?;
                if !matches!(outer.kind(), "program" | "export_statement") {
                    return None;
                }
                let declarator = named_children(node)
                    .into_iter()
                    .find(|c| c.kind() == "variable_declarator")?;
                let name = self.field_text(declarator, "name")?;
                (name, kind, parent.map(str::to_string))
            }
            "type_declaration" => {
                let spec = named_children(node)
                    .into_iter()
                    .find(|c| c.kind() == "type_spec")?;
                let name = self.field_text(spec, "name")?;
                let kind = match spec.child_by_field_name("type").map(|t| t.kind()) {
                    Some("struct_type") => SymbolKind::Struct,
                    Some("interface_type") => SymbolKind::Interface,
                    _ => SymbolKind::Type,
                };
                (name, kind, parent.map(str::to_string))
            }
            "method_declaration" if self.language == SourceLanguage::Go => {
                let name = self.field_text(node, "name")?;
                let receiver = node
                    .child_by_field_name("receiver")
                    .and_then(|r| self.text(r))
                    .and_then(|r| go_receiver_type(&r));
                (name, kind, receiver.or_else(|| parent.map(str::to_string)))
            }
            _ => (self.field_text(node, "name")?, kind, parent.map(str::to_string)),
        };

        let line = node.start_position().row + 1;
        let signature = self
            .lines
            .get(line - 1)
            .map(|l| l.trim().to_string())
            .unwrap_or_default();
        Some(CodeSymbol {
            name,
            kind,
            parent,
            line,
            signature,
        })
    }

    /// Name that nested declarations are qualified with
    fn scope_name(&self, node: Node) -> Option<String> {
        match node.kind() {
            // `impl Trait for Type` scopes under the implementing type
            "impl_item" => {
                let target = self.field_text(node, "type")?;
                Some(strip_generics(&target).to_string())
            }
            _ => self.field_text(node, "name"),
        }
    }

    fn field_text(&self, node: Node, field: &str) -> Option<String> {
        self.text(node.child_by_field_name(field)?)
    }

    fn text(&self, node: Node) -> Option<String> {
        let text = node.utf8_text(self.source.as_bytes()).ok()?.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    (0..node.named_child_count())
        .filter_map(|i| node.named_child(i))
        .collect()
}

fn strip_generics(type_name: &str) -> &str {
    type_name.split('<').next().unwrap_or(type_name).trim()
}

/// `(s *Server)` -> `Server`
fn go_receiver_type(receiver: &str) -> Option<String> {
    let inner = receiver.trim_start_matches('(').trim_end_matches(')');
    let ty = inner.split_whitespace().last()?.trim_start_matches('*');
    let ty = strip_generics(ty);
    (!ty.is_empty()).then(|| ty.to_string())
}
