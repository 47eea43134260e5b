//! Static validator for generated CAD scripts.
//!
//! The candidate is parsed into a Python syntax tree with tree-sitter and
//! walked once against the [`ValidationPolicy`]. Every violation found is
//! collected before a verdict is produced, so one rejection carries the
//! complete list. No I/O happens here.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};
use tree_sitter::{Node, Parser, Tree};

use super::error::{Rejection, RejectionKind};
use super::policy::ValidationPolicy;

/// Longest snippet quoted back in a syntax error detail.
const SNIPPET_CHARS: usize = 40;

/// Statement forms the grammar still accepts but Python 3 does not.
const PYTHON2_STATEMENTS: &[(&str, &str)] =
    &[("print_statement", "print"), ("exec_statement", "exec")];

/// A source that passed validation. Only the validator constructs it,
/// so holding one proves the verdict was `Accepted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSource {
    code: String,
    binding: String,
    synthesized_binding: bool,
    observations: Observations,
}

impl NormalizedSource {
    pub fn as_str(&self) -> &str {
        &self.code
    }

    /// Name of the terminal binding the executor should export.
    pub fn binding(&self) -> &str {
        &self.binding
    }

    /// True when the binding was appended because the script lacked it.
    pub fn synthesized_binding(&self) -> bool {
        self.synthesized_binding
    }

    pub fn observations(&self) -> &Observations {
        &self.observations
    }
}

/// Findings that do not reject under the current policy but are kept
/// with the accepted source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Observations {
    /// Export calls the generator made itself (e.g. `exportStl`).
    pub self_export_calls: Vec<String>,
    /// 1-indexed lines holding string literals that look like host paths.
    pub absolute_path_literals: Vec<usize>,
}

impl Observations {
    pub fn self_export_detected(&self) -> bool {
        !self.self_export_calls.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted(NormalizedSource),
    Rejected(Rejection),
}

impl Verdict {
    pub fn into_result(self) -> Result<NormalizedSource, Rejection> {
        match self {
            Verdict::Accepted(source) => Ok(source),
            Verdict::Rejected(rejection) => Err(rejection),
        }
    }
}

/// One policy breach found during the tree walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    BannedImport(String),
    BannedCall(String),
    BannedAttributeCall(String),
    SelfExport(String),
    SuspiciousNullAssignment(String),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::BannedImport(module) => write!(f, "Banned import detected: {module}"),
            Violation::BannedCall(name) => write!(f, "Banned function call detected: {name}()"),
            Violation::BannedAttributeCall(name) => {
                write!(f, "Banned attribute call detected: {name}")
            }
            Violation::SelfExport(name) => {
                write!(f, "Export call detected: {name} (export is handled by the executor)")
            }
            Violation::SuspiciousNullAssignment(name) => {
                write!(f, "None assigned to shape variable: {name}")
            }
        }
    }
}

/// Validates a candidate script against `policy`.
///
/// Checks run in a fixed order: length, emptiness, syntax, policy walk,
/// then terminal-binding synthesis. Calling it twice with the same
/// inputs yields the same verdict.
pub fn validate(candidate: &str, policy: &ValidationPolicy) -> Verdict {
    let code = candidate.replace("\r\n", "\n").trim().to_string();

    let line_count = code.split('\n').count();
    if line_count > policy.max_lines {
        return reject(
            RejectionKind::TooLong,
            format!(
                "Actual length: {line_count} lines (maximum {})",
                policy.max_lines
            ),
        );
    }

    if code.is_empty() {
        return reject(RejectionKind::Empty, "");
    }

    let tree = match parse(&code) {
        Ok(tree) => tree,
        Err(detail) => return reject(RejectionKind::SyntaxInvalid, detail),
    };

    let mut visitor = SecurityVisitor::new(code.as_bytes(), policy);
    visitor.walk(tree.root_node());

    if !visitor.violations.is_empty() {
        for violation in &visitor.violations {
            debug!("Policy violation: {violation}");
        }
        let only_null_assignments = visitor
            .violations
            .iter()
            .all(|v| matches!(v, Violation::SuspiciousNullAssignment(_)));
        let kind = if only_null_assignments {
            RejectionKind::SuspiciousNullAssignment
        } else {
            RejectionKind::SecurityViolation
        };
        let detail = visitor
            .violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        return reject(kind, detail);
    }

    let observations = visitor.observations;
    if observations.self_export_detected() {
        warn!(
            "Script calls {} itself; the executor export will still run",
            observations.self_export_calls.join(", ")
        );
    }
    if !observations.absolute_path_literals.is_empty() {
        warn!(
            "Hardcoded absolute path literal on line(s) {:?}, allowing",
            observations.absolute_path_literals
        );
    }

    let binding = policy.terminal_binding.clone();
    let mut synthesized_binding = false;
    let mut code = code;
    if !code.contains(&binding) {
        match last_assignment_target(&tree, code.as_bytes()) {
            Some(target) => {
                warn!("Script is missing '{binding}', aliasing it to '{target}'");
                code = format!("{code}\n{binding} = {target}");
                synthesized_binding = true;
            }
            None => {
                warn!("Script is missing '{binding}' and has no assignment to alias");
            }
        }
    }

    info!("Script validation passed ({line_count} lines)");
    Verdict::Accepted(NormalizedSource {
        code,
        binding,
        synthesized_binding,
        observations,
    })
}

fn reject(kind: RejectionKind, detail: impl Into<String>) -> Verdict {
    let rejection = Rejection::new(kind, detail);
    warn!("Script rejected ({:?}): {}", rejection.kind, rejection.detail);
    Verdict::Rejected(rejection)
}

/// Parses `code`; any error or missing node fails the whole parse.
fn parse(code: &str) -> Result<Tree, String> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| format!("Python grammar unavailable: {e}"))?;
    let tree = parser
        .parse(code, None)
        .ok_or_else(|| "Parser produced no syntax tree".to_string())?;

    let root = tree.root_node();
    if root.has_error() {
        return Err(describe_syntax_error(root, code.as_bytes()));
    }
    let python2 = first_node(root, |n| python2_keyword(n).is_some(), |_| true);
    if let Some(node) = python2 {
        let pos = node.start_position();
        return Err(format!(
            "line {}, column {}: `{}` statement is not valid in Python 3",
            pos.row + 1,
            pos.column + 1,
            python2_keyword(node).unwrap_or_default()
        ));
    }
    Ok(tree)
}

fn python2_keyword(node: Node) -> Option<&'static str> {
    PYTHON2_STATEMENTS
        .iter()
        .find(|(kind, _)| node.kind() == *kind)
        .map(|(_, keyword)| *keyword)
}

fn describe_syntax_error(root: Node, source: &[u8]) -> String {
    // Only subtrees that contain an error are worth entering
    let first_error = first_node(root, |n| n.is_error() || n.is_missing(), |n| n.has_error());
    let Some(node) = first_error else {
        return "invalid syntax".to_string();
    };
    let pos = node.start_position();
    let (line, column) = (pos.row + 1, pos.column + 1);

    if node.is_missing() {
        return format!("line {line}, column {column}: expected `{}`", node.kind());
    }

    let snippet: String = node
        .utf8_text(source)
        .unwrap_or("")
        .lines()
        .next()
        .unwrap_or("")
        .chars()
        .take(SNIPPET_CHARS)
        .collect();
    if snippet.trim().is_empty() {
        format!("line {line}, column {column}: invalid syntax")
    } else {
        format!("line {line}, column {column}: invalid syntax near `{}`", snippet.trim())
    }
}

/// First node matching `target` in document order, entering only
/// subtrees accepted by `descend`.
fn first_node<'t>(
    root: Node<'t>,
    target: impl Fn(Node) -> bool,
    descend: impl Fn(Node) -> bool,
) -> Option<Node<'t>> {
    let mut cursor = root.walk();
    loop {
        let node = cursor.node();
        if target(node) {
            return Some(node);
        }
        if descend(node) && cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return None;
            }
        }
    }
}

/// Target of the last module-level `name = ...` statement.
fn last_assignment_target<'s>(tree: &Tree, source: &'s [u8]) -> Option<&'s str> {
    let root = tree.root_node();
    let mut cursor = root.walk();
    let statements: Vec<Node> = root.named_children(&mut cursor).collect();

    statements.iter().rev().find_map(|statement| {
        if statement.kind() != "expression_statement" {
            return None;
        }
        let mut inner = statement.walk();
        let expr = statement.named_children(&mut inner).next()?;
        if expr.kind() != "assignment" {
            return None;
        }
        let left = expr.child_by_field_name("left")?;
        if left.kind() != "identifier" {
            return None;
        }
        left.utf8_text(source).ok()
    })
}

struct SecurityVisitor<'a> {
    source: &'a [u8],
    policy: &'a ValidationPolicy,
    violations: Vec<Violation>,
    observations: Observations,
}

impl<'a> SecurityVisitor<'a> {
    fn new(source: &'a [u8], policy: &'a ValidationPolicy) -> Self {
        Self {
            source,
            policy,
            violations: Vec::new(),
            observations: Observations::default(),
        }
    }

    /// Pre-order walk over the whole tree. Iterative, since generated
    /// input can nest arbitrarily deep.
    fn walk(&mut self, root: Node) {
        let mut cursor = root.walk();
        loop {
            self.visit(cursor.node());
            if cursor.goto_first_child() {
                continue;
            }
            loop {
                if cursor.goto_next_sibling() {
                    break;
                }
                if !cursor.goto_parent() {
                    return;
                }
            }
        }
    }

    fn visit(&mut self, node: Node) {
        match node.kind() {
            "import_statement" => self.visit_import(node),
            "import_from_statement" => self.visit_import_from(node),
            "call" => self.visit_call(node),
            "assignment" => self.visit_assignment(node),
            "string" => self.visit_string(node),
            _ => {}
        }
    }

    fn text(&self, node: Node) -> &'a str {
        node.utf8_text(self.source).unwrap_or("")
    }

    fn visit_import(&mut self, node: Node) {
        let mut cursor = node.walk();
        let names: Vec<Node> = node.children_by_field_name("name", &mut cursor).collect();
        for name in names {
            // `import os.path as p` nests the dotted name one level down
            let module = match name.kind() {
                "aliased_import" => name
                    .child_by_field_name("name")
                    .map(|n| self.text(n))
                    .unwrap_or(""),
                _ => self.text(name),
            };
            if self.policy.is_banned_module(module) {
                self.violations
                    .push(Violation::BannedImport(module.to_string()));
            }
        }
    }

    fn visit_import_from(&mut self, node: Node) {
        let Some(module) = node.child_by_field_name("module_name") else {
            return;
        };
        let module = self.text(module);
        if self.policy.is_banned_module(module) {
            self.violations
                .push(Violation::BannedImport(module.to_string()));
        }
    }

    fn visit_call(&mut self, node: Node) {
        let Some(function) = node.child_by_field_name("function").map(unwrap_parens) else {
            return;
        };
        match function.kind() {
            "identifier" => {
                let name = self.text(function);
                if self.policy.banned_calls.contains(name) {
                    self.violations.push(Violation::BannedCall(name.to_string()));
                }
            }
            "attribute" => {
                let Some(attribute) = function.child_by_field_name("attribute") else {
                    return;
                };
                let name = self.text(attribute);
                if self.policy.banned_calls.contains(name) {
                    self.violations
                        .push(Violation::BannedAttributeCall(name.to_string()));
                }
                if self.policy.export_calls.contains(name) {
                    self.observations.self_export_calls.push(name.to_string());
                    if self.policy.reject_self_export {
                        self.violations.push(Violation::SelfExport(name.to_string()));
                    }
                }
            }
            _ => {}
        }
    }

    fn visit_assignment(&mut self, node: Node) {
        // `a = b = None` nests assignments on the right; each level checks its own target
        let mut value = node.child_by_field_name("right").map(unwrap_parens);
        while let Some(v) = value.filter(|v| v.kind() == "assignment") {
            value = v.child_by_field_name("right").map(unwrap_parens);
        }
        if value.map(|v| v.kind()) != Some("none") {
            return;
        }
        let Some(left) = node.child_by_field_name("left").map(unwrap_parens) else {
            return;
        };
        if left.kind() == "identifier" {
            let name = self.text(left);
            if name.to_lowercase().contains("shape") {
                self.violations
                    .push(Violation::SuspiciousNullAssignment(name.to_string()));
            }
        }
    }

    fn visit_string(&mut self, node: Node) {
        let literal = self
            .text(node)
            .trim_start_matches(|c: char| c.is_ascii_alphabetic())
            .trim_matches(|c: char| c == '\'' || c == '"');
        if looks_like_absolute_path(literal) {
            self.observations
                .absolute_path_literals
                .push(node.start_position().row + 1);
        }
    }
}

/// Strips grouping parentheses: `((eval))` is `eval`, `(shape)` as a
/// target is `shape`. One-element tuples such as `(a,)` are kept.
fn unwrap_parens(mut node: Node) -> Node {
    loop {
        let grouping = match node.kind() {
            "parenthesized_expression" => true,
            "tuple_pattern" => (0..node.child_count())
                .filter_map(|i| node.child(i as _))
                .all(|c| c.kind() != ","),
            _ => false,
        };
        if !grouping {
            return node;
        }
        let mut cursor = node.walk();
        let inner: Vec<Node> = node
            .named_children(&mut cursor)
            .filter(|c| c.kind() != "comment")
            .collect();
        match inner.as_slice() {
            [only] => node = *only,
            _ => return node,
        }
    }
}

fn looks_like_absolute_path(literal: &str) -> bool {
    let bytes = literal.as_bytes();
    if bytes.len() > 1 && bytes[0] == b'/' {
        return true;
    }
    bytes.len() > 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'\\'
}
