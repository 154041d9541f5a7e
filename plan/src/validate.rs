//! Plan validation: allow-listed syntax, block-listed names.
//!
//! The parser already confines the language to the supported node kinds and
//! surfaces everything else as `Unsupported` nodes carrying the conventional
//! kind name; this pass turns those into errors and enforces the identifier
//! and property blocklist. The rule is an allow-list: a construct that is
//! not explicitly supported is rejected, with its location and source line.

use serde::Serialize;

use crate::ast::CatchClause;
use crate::ast::Declarator;
use crate::ast::Element;
use crate::ast::Expr;
use crate::ast::ExprKind;
use crate::ast::FnBody;
use crate::ast::Function;
use crate::ast::Lit;
use crate::ast::MemberProp;
use crate::ast::ObjectProperty;
use crate::ast::Program;
use crate::ast::PropKey;
use crate::ast::Stmt;
use crate::ast::StmtKind;
use crate::parser;
use crate::token::Span;

/// Names that would reach the host process, the module loader, the
/// prototype chain, timers, or reflection.
pub const BLOCKED_IDENTIFIERS: &[&str] = &[
    "process",
    "require",
    "module",
    "exports",
    "global",
    "globalThis",
    "eval",
    "Function",
    "AsyncFunction",
    "GeneratorFunction",
    "constructor",
    "prototype",
    "__proto__",
    "__defineGetter__",
    "__defineSetter__",
    "__lookupGetter__",
    "__lookupSetter__",
    "setTimeout",
    "setInterval",
    "setImmediate",
    "clearTimeout",
    "clearInterval",
    "clearImmediate",
    "queueMicrotask",
    "Reflect",
    "Proxy",
    "WeakRef",
    "FinalizationRegistry",
];

pub fn is_blocked(name: &str) -> bool {
    BLOCKED_IDENTIFIERS.contains(&name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub message: String,
    pub line: u32,
    pub column: u32,
    /// The offending source line.
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

/// Parse and validate a plan source. Syntax errors come back as a
/// single-error report.
pub fn validate(source: &str) -> ValidationReport {
    match parser::parse(source) {
        Ok(program) => {
            let errors = check_program(&program, source);
            ValidationReport {
                valid: errors.is_empty(),
                errors,
            }
        }
        Err(error) => ValidationReport {
            valid: false,
            errors: vec![ValidationError {
                message: error.message.clone(),
                line: error.span.line,
                column: error.span.column,
                snippet: snippet_for(source, error.span),
            }],
        },
    }
}

/// Validate an already-parsed program.
pub fn check_program(program: &Program, source: &str) -> Vec<ValidationError> {
    let mut walker = Walker {
        source,
        errors: Vec::new(),
    };
    for stmt in &program.body {
        walker.stmt(stmt);
    }
    walker.errors
}

fn snippet_for(source: &str, span: Span) -> String {
    source
        .lines()
        .nth(span.line.saturating_sub(1) as usize)
        .unwrap_or("")
        .trim_end()
        .to_string()
}

struct Walker<'a> {
    source: &'a str,
    errors: Vec<ValidationError>,
}

impl Walker<'_> {
    fn error(&mut self, span: Span, message: impl Into<String>) {
        self.errors.push(ValidationError {
            message: message.into(),
            line: span.line,
            column: span.column,
            snippet: snippet_for(self.source, span),
        });
    }

    fn blocked_name(&mut self, span: Span, name: &str) -> bool {
        if is_blocked(name) {
            self.error(span, format!("Blocked identifier: '{name}'"));
            true
        } else {
            false
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expression(expr) => self.expr(expr),
            StmtKind::Block(body) => {
                for s in body {
                    self.stmt(s);
                }
            }
            StmtKind::VarDecl { declarators, .. } => {
                for declarator in declarators {
                    self.declarator(declarator);
                }
            }
            StmtKind::FunctionDecl(function) => self.function(function),
            StmtKind::If {
                test,
                consequent,
                alternate,
            } => {
                self.expr(test);
                self.stmt(consequent);
                if let Some(alternate) = alternate {
                    self.stmt(alternate);
                }
            }
            StmtKind::Switch {
                discriminant,
                cases,
            } => {
                self.expr(discriminant);
                for case in cases {
                    if let Some(test) = &case.test {
                        self.expr(test);
                    }
                    for s in &case.body {
                        self.stmt(s);
                    }
                }
            }
            StmtKind::ForOf {
                binding,
                binding_span,
                iterable,
                body,
                ..
            } => {
                self.blocked_name(*binding_span, binding);
                self.expr(iterable);
                self.stmt(body);
            }
            StmtKind::ForIn {
                binding,
                binding_span,
                object,
                body,
                ..
            } => {
                self.blocked_name(*binding_span, binding);
                self.expr(object);
                self.stmt(body);
            }
            StmtKind::For {
                init,
                test,
                update,
                body,
            } => {
                if let Some(init) = init {
                    self.stmt(init);
                }
                if let Some(test) = test {
                    self.expr(test);
                }
                if let Some(update) = update {
                    self.expr(update);
                }
                self.stmt(body);
            }
            StmtKind::While { test, body } => {
                self.expr(test);
                self.stmt(body);
            }
            StmtKind::Try {
                block,
                handler,
                finalizer,
            } => {
                for s in block {
                    self.stmt(s);
                }
                if let Some(handler) = handler {
                    self.catch_clause(handler);
                }
                if let Some(finalizer) = finalizer {
                    for s in finalizer {
                        self.stmt(s);
                    }
                }
            }
            StmtKind::Throw(expr) => self.expr(expr),
            StmtKind::Return(expr) => {
                if let Some(expr) = expr {
                    self.expr(expr);
                }
            }
            StmtKind::Break | StmtKind::Continue => {}
            StmtKind::Empty => {
                self.error(stmt.span, "Disallowed syntax: EmptyStatement");
            }
            StmtKind::Unsupported { kind } => {
                self.error(stmt.span, format!("Disallowed syntax: {kind}"));
            }
        }
    }

    fn declarator(&mut self, declarator: &Declarator) {
        self.blocked_name(declarator.span, &declarator.name);
        if let Some(init) = &declarator.init {
            self.expr(init);
        }
    }

    fn catch_clause(&mut self, clause: &CatchClause) {
        if let Some(param) = &clause.param {
            self.blocked_name(clause.param_span, param);
        }
        for s in &clause.body {
            self.stmt(s);
        }
    }

    fn function(&mut self, function: &Function) {
        if function.is_async {
            self.error(
                function.span,
                "Disallowed syntax: async function modifier",
            );
        }
        if function.is_generator {
            self.error(
                function.span,
                "Disallowed syntax: generator function modifier",
            );
        }
        for (span, kind) in &function.param_faults {
            self.error(*span, format!("Disallowed syntax: {kind}"));
        }
        if let Some(name) = &function.name {
            self.blocked_name(function.span, name);
        }
        for param in &function.params {
            self.blocked_name(param.span, &param.name);
        }
        match &function.body {
            FnBody::Block(body) => {
                for s in body {
                    self.stmt(s);
                }
            }
            FnBody::Expr(expr) => self.expr(expr),
        }
    }

    fn elements(&mut self, elements: &[Element]) {
        for element in elements {
            match element {
                Element::Item(expr) => self.expr(expr),
                Element::Spread { argument, .. } => self.expr(argument),
            }
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Identifier(name) => {
                self.blocked_name(expr.span, name);
            }
            ExprKind::Literal(_) => {}
            ExprKind::Template { exprs, .. } => {
                for e in exprs {
                    self.expr(e);
                }
            }
            ExprKind::TaggedTemplate { tag, exprs, .. } => {
                self.expr(tag);
                for e in exprs {
                    self.expr(e);
                }
            }
            ExprKind::Array(elements) => self.elements(elements),
            ExprKind::Object(properties) => {
                for property in properties {
                    match property {
                        ObjectProperty::Property { span, key, value, .. } => {
                            match key {
                                PropKey::Ident(name) | PropKey::Str(name) => {
                                    self.blocked_name(*span, name);
                                }
                                PropKey::Number(_) => {}
                                PropKey::Computed(key_expr) => self.expr(key_expr),
                            }
                            self.expr(value);
                        }
                        ObjectProperty::Spread { argument, .. } => self.expr(argument),
                    }
                }
            }
            ExprKind::Function(function) => self.function(function),
            ExprKind::Call { callee, args, .. } => {
                self.expr(callee);
                self.elements(args);
            }
            ExprKind::New { callee, args } => {
                self.expr(callee);
                self.elements(args);
            }
            ExprKind::Member {
                object, property, ..
            } => {
                self.expr(object);
                match property {
                    MemberProp::Ident(name) => {
                        if is_blocked(name) {
                            self.error(expr.span, format!("Blocked property: '{name}'"));
                        }
                    }
                    MemberProp::Computed(key) => {
                        if let ExprKind::Literal(Lit::Str(name)) = &key.kind {
                            if is_blocked(name) {
                                self.error(expr.span, format!("Blocked property: '{name}'"));
                            }
                        }
                        self.expr(key);
                    }
                }
            }
            ExprKind::Conditional {
                test,
                consequent,
                alternate,
            } => {
                self.expr(test);
                self.expr(consequent);
                self.expr(alternate);
            }
            ExprKind::Assignment { target, value, .. } => {
                self.expr(target);
                self.expr(value);
            }
            ExprKind::Update { target, .. } => self.expr(target),
            ExprKind::Binary { left, right, .. } | ExprKind::Logical { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            ExprKind::Unary { operand, .. } => self.expr(operand),
            ExprKind::Sequence(exprs) => {
                for e in exprs {
                    self.expr(e);
                }
            }
            ExprKind::Unsupported { kind } => {
                self.error(expr.span, format!("Disallowed syntax: {kind}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    fn first_error(source: &str) -> ValidationError {
        let report = validate(source);
        assert!(!report.valid, "expected {source:?} to be rejected");
        report.errors.into_iter().next().unwrap()
    }

    #[test]
    fn accepts_a_typical_plan() {
        let report = validate(
            r#"
            const files = search("TODO", { path: "src" });
            const results = map(chunk(files, 10), batch => LLM("summarize", batch));
            let out = [];
            for (const r of results) {
                if (r) { out.push(r) }
            }
            return out;
            "#,
        );
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn accepts_top_level_return_with_loop() {
        let report = validate("const x = []; for (const i of [1,2]) x.push(i); return x;");
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn rejects_blocked_identifier_with_location() {
        let error = first_error("process.exit(1)");
        assert_eq!(error.message, "Blocked identifier: 'process'");
        assert_eq!(error.line, 1);
        assert_eq!(error.column, 1);
        assert_eq!(error.snippet, "process.exit(1)");
    }

    #[test]
    fn rejects_blocked_property_access() {
        let error = first_error("x.constructor('return 1')()");
        assert_eq!(error.message, "Blocked property: 'constructor'");
    }

    #[test]
    fn rejects_blocked_computed_string_key() {
        let error = first_error("x['__proto__']");
        assert_eq!(error.message, "Blocked property: '__proto__'");
    }

    #[test]
    fn rejects_binding_a_blocked_name() {
        let error = first_error("let process = 1;");
        assert_eq!(error.message, "Blocked identifier: 'process'");
    }

    #[test]
    fn rejects_async_and_generator_functions() {
        assert_eq!(
            first_error("async function f() {}").message,
            "Disallowed syntax: async function modifier"
        );
        assert_eq!(
            first_error("function* g() {}").message,
            "Disallowed syntax: generator function modifier"
        );
        assert_eq!(
            first_error("const f = async () => 1;").message,
            "Disallowed syntax: async function modifier"
        );
    }

    #[test]
    fn rejects_classes_imports_and_labels() {
        assert_eq!(
            first_error("class Foo {}").message,
            "Disallowed syntax: ClassDeclaration"
        );
        assert_eq!(
            first_error("import fs from 'fs';").message,
            "Disallowed syntax: ImportDeclaration"
        );
        assert_eq!(
            first_error("outer: for (;;) {}").message,
            "Disallowed syntax: LabeledStatement"
        );
    }

    #[test]
    fn rejects_explicit_await_and_yield() {
        assert_eq!(
            first_error("await search('x')").message,
            "Disallowed syntax: AwaitExpression"
        );
    }

    #[test]
    fn rejects_destructuring() {
        assert_eq!(
            first_error("const { a } = x;").message,
            "Disallowed syntax: ObjectPattern"
        );
        assert_eq!(
            first_error("const f = ({ a }) => a;").message,
            "Disallowed syntax: ObjectPattern"
        );
    }

    #[test]
    fn rejects_timers_and_reflection() {
        assert_eq!(
            first_error("setTimeout(() => 1, 10)").message,
            "Blocked identifier: 'setTimeout'"
        );
        assert_eq!(
            first_error("Reflect.get(x, 'y')").message,
            "Blocked identifier: 'Reflect'"
        );
    }

    #[test]
    fn syntax_error_reports_location() {
        let report = validate("const = 1;");
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].line, 1);
    }

    #[test]
    fn collects_multiple_errors() {
        let report = validate("process.exit(1); require('fs');");
        assert!(report.errors.len() >= 2);
    }
}
