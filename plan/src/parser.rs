//! Recursive-descent parser for the plan scripting language.
//!
//! Semicolons are optional; newlines carry no significance. Constructs the
//! validator must reject (classes, imports, labels, `await`, patterns) parse
//! into `Unsupported` nodes rather than hard syntax errors so diagnostics
//! can name the offending construct at its location.

use std::sync::Arc;

use crate::ast::CatchClause;
use crate::ast::DeclKind;
use crate::ast::Declarator;
use crate::ast::Element;
use crate::ast::Expr;
use crate::ast::ExprKind;
use crate::ast::FnBody;
use crate::ast::Function;
use crate::ast::Lit;
use crate::ast::MemberProp;
use crate::ast::NodeId;
use crate::ast::ObjectProperty;
use crate::ast::Param;
use crate::ast::Program;
use crate::ast::PropKey;
use crate::ast::Stmt;
use crate::ast::StmtKind;
use crate::ast::SwitchCase;
use crate::token::Keyword;
use crate::token::Span;
use crate::token::SyntaxError;
use crate::token::Tok;
use crate::token::Token;
use crate::token::lex;

pub fn parse(source: &str) -> Result<Program, SyntaxError> {
    let tokens = lex(source)?;
    let mut parser = Parser::new(tokens, 1);
    parser.parse_program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    next_id: NodeId,
}

const BINARY_LEVELS: &[&[&str]] = &[
    &["??"],
    &["||"],
    &["&&"],
    &["|"],
    &["^"],
    &["&"],
    &["==", "!=", "===", "!=="],
    &["<", ">", "<=", ">="],
    &["<<", ">>", ">>>"],
    &["+", "-"],
    &["*", "/", "%"],
    &["**"],
];

/// Level index of the relational operators, where `in`/`instanceof` join.
const RELATIONAL_LEVEL: usize = 7;

const ASSIGN_OPS: &[&str] = &["=", "+=", "-=", "*=", "/=", "%=", "&&=", "||=", "??="];

impl Parser {
    fn new(tokens: Vec<Token>, first_id: NodeId) -> Self {
        Self {
            tokens,
            pos: 0,
            next_id: first_id,
        }
    }

    fn id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn current(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn peek_ahead(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .map(|t| t.span)
            .or_else(|| self.tokens.last().map(|t| t.span))
            .unwrap_or(Span::new(1, 1))
    }

    fn bump(&mut self) -> Token {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .unwrap_or(Token {
                tok: Tok::Eof,
                span: self.span(),
            });
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn at_punct(&self, p: &str) -> bool {
        matches!(self.current(), Tok::Punct(q) if *q == p)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.at_punct(p) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<Span, SyntaxError> {
        let span = self.span();
        if self.eat_punct(p) {
            Ok(span)
        } else {
            Err(SyntaxError::new(
                format!("Expected '{p}', found {}", describe(self.current())),
                span,
            ))
        }
    }

    fn at_keyword(&self, k: Keyword) -> bool {
        matches!(self.current(), Tok::Keyword(q) if *q == k)
    }

    fn eat_keyword(&mut self, k: Keyword) -> bool {
        if self.at_keyword(k) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, k: Keyword) -> Result<Span, SyntaxError> {
        let span = self.span();
        if self.eat_keyword(k) {
            Ok(span)
        } else {
            Err(SyntaxError::new(
                format!("Expected '{}', found {}", k.as_str(), describe(self.current())),
                span,
            ))
        }
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(message, self.span())
    }

    // ----- program / statements -----

    fn parse_program(&mut self) -> Result<Program, SyntaxError> {
        let id = self.id();
        let mut body = Vec::new();
        while !matches!(self.current(), Tok::Eof) {
            body.push(self.parse_statement()?);
        }
        Ok(Program { id, body })
    }

    fn parse_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let span = self.span();
        match self.current().clone() {
            Tok::Punct("{") => {
                let id = self.id();
                let body = self.parse_block()?;
                Ok(Stmt {
                    id,
                    span,
                    kind: StmtKind::Block(body),
                })
            }
            Tok::Punct(";") => {
                let id = self.id();
                self.bump();
                Ok(Stmt {
                    id,
                    span,
                    kind: StmtKind::Empty,
                })
            }
            Tok::Keyword(Keyword::Var) => self.parse_var_decl(DeclKind::Var, span),
            Tok::Keyword(Keyword::Let) => self.parse_var_decl(DeclKind::Let, span),
            Tok::Keyword(Keyword::Const) => self.parse_var_decl(DeclKind::Const, span),
            Tok::Keyword(Keyword::Function) => {
                let id = self.id();
                let function = self.parse_function(false, span)?;
                if function.name.is_none() {
                    return Err(SyntaxError::new("Function declaration requires a name", span));
                }
                Ok(Stmt {
                    id,
                    span,
                    kind: StmtKind::FunctionDecl(function),
                })
            }
            Tok::Keyword(Keyword::Async) if matches!(self.peek_ahead(1), Tok::Keyword(Keyword::Function)) => {
                let id = self.id();
                self.bump(); // async
                let function = self.parse_function(true, span)?;
                Ok(Stmt {
                    id,
                    span,
                    kind: StmtKind::FunctionDecl(function),
                })
            }
            Tok::Keyword(Keyword::If) => self.parse_if(span),
            Tok::Keyword(Keyword::Switch) => self.parse_switch(span),
            Tok::Keyword(Keyword::For) => self.parse_for(span),
            Tok::Keyword(Keyword::While) => self.parse_while(span),
            Tok::Keyword(Keyword::Try) => self.parse_try(span),
            Tok::Keyword(Keyword::Throw) => {
                let id = self.id();
                self.bump();
                let argument = self.parse_expression()?;
                self.eat_punct(";");
                Ok(Stmt {
                    id,
                    span,
                    kind: StmtKind::Throw(argument),
                })
            }
            Tok::Keyword(Keyword::Return) => {
                let id = self.id();
                self.bump();
                let argument = if self.at_punct(";")
                    || self.at_punct("}")
                    || matches!(self.current(), Tok::Eof)
                {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.eat_punct(";");
                Ok(Stmt {
                    id,
                    span,
                    kind: StmtKind::Return(argument),
                })
            }
            Tok::Keyword(Keyword::Break) => {
                let id = self.id();
                self.bump();
                self.eat_punct(";");
                Ok(Stmt {
                    id,
                    span,
                    kind: StmtKind::Break,
                })
            }
            Tok::Keyword(Keyword::Continue) => {
                let id = self.id();
                self.bump();
                self.eat_punct(";");
                Ok(Stmt {
                    id,
                    span,
                    kind: StmtKind::Continue,
                })
            }
            Tok::Keyword(Keyword::Class) => self.unsupported_statement(span, "ClassDeclaration"),
            Tok::Keyword(Keyword::Import) => self.unsupported_statement(span, "ImportDeclaration"),
            Tok::Keyword(Keyword::Export) => {
                self.unsupported_statement(span, "ExportNamedDeclaration")
            }
            Tok::Keyword(Keyword::With) => self.unsupported_statement(span, "WithStatement"),
            Tok::Keyword(Keyword::Do) => self.unsupported_statement(span, "DoWhileStatement"),
            Tok::Ident(_) if matches!(self.peek_ahead(1), Tok::Punct(":")) => {
                self.unsupported_statement(span, "LabeledStatement")
            }
            _ => {
                let id = self.id();
                let expr = self.parse_expression()?;
                self.eat_punct(";");
                Ok(Stmt {
                    id,
                    span,
                    kind: StmtKind::Expression(expr),
                })
            }
        }
    }

    fn unsupported_statement(
        &mut self,
        span: Span,
        kind: &'static str,
    ) -> Result<Stmt, SyntaxError> {
        let id = self.id();
        self.skip_statement();
        Ok(Stmt {
            id,
            span,
            kind: StmtKind::Unsupported { kind },
        })
    }

    /// Best-effort recovery: consume tokens through the end of the current
    /// statement, balancing brackets and stopping after a top-level block.
    fn skip_statement(&mut self) {
        let mut depth: usize = 0;
        loop {
            let punct: Option<&'static str> = match self.current() {
                Tok::Eof => return,
                Tok::Punct(p) => Some(*p),
                _ => None,
            };
            match punct {
                Some("{" | "(" | "[") => {
                    depth += 1;
                    self.bump();
                }
                Some(close @ ("}" | ")" | "]")) => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                    self.bump();
                    if depth == 0 && close == "}" {
                        self.eat_punct(";");
                        return;
                    }
                }
                Some(";") if depth == 0 => {
                    self.bump();
                    return;
                }
                _ => {
                    self.bump();
                }
            }
        }
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.at_punct("}") {
            if matches!(self.current(), Tok::Eof) {
                return Err(self.error("Unexpected end of input in block"));
            }
            body.push(self.parse_statement()?);
        }
        self.expect_punct("}")?;
        Ok(body)
    }

    fn parse_var_decl(&mut self, kind: DeclKind, span: Span) -> Result<Stmt, SyntaxError> {
        let id = self.id();
        self.bump(); // var/let/const
        let mut declarators = Vec::new();
        loop {
            let decl_span = self.span();
            match self.current().clone() {
                Tok::Ident(name) => {
                    let decl_id = self.id();
                    self.bump();
                    let init = if self.eat_punct("=") {
                        Some(self.parse_assignment()?)
                    } else {
                        None
                    };
                    declarators.push(Declarator {
                        id: decl_id,
                        span: decl_span,
                        name,
                        init,
                    });
                }
                Tok::Punct("{") => {
                    self.skip_balanced("{", "}");
                    return self.unsupported_statement(span, "ObjectPattern");
                }
                Tok::Punct("[") => {
                    self.skip_balanced("[", "]");
                    return self.unsupported_statement(span, "ArrayPattern");
                }
                other => {
                    return Err(SyntaxError::new(
                        format!("Expected binding name, found {}", describe(&other)),
                        decl_span,
                    ));
                }
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        self.eat_punct(";");
        Ok(Stmt {
            id,
            span,
            kind: StmtKind::VarDecl { kind, declarators },
        })
    }

    fn parse_if(&mut self, span: Span) -> Result<Stmt, SyntaxError> {
        let id = self.id();
        self.bump();
        self.expect_punct("(")?;
        let test = self.parse_expression()?;
        self.expect_punct(")")?;
        let consequent = Box::new(self.parse_statement()?);
        let alternate = if self.eat_keyword(Keyword::Else) {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt {
            id,
            span,
            kind: StmtKind::If {
                test,
                consequent,
                alternate,
            },
        })
    }

    fn parse_switch(&mut self, span: Span) -> Result<Stmt, SyntaxError> {
        let id = self.id();
        self.bump();
        self.expect_punct("(")?;
        let discriminant = self.parse_expression()?;
        self.expect_punct(")")?;
        self.expect_punct("{")?;
        let mut cases = Vec::new();
        while !self.at_punct("}") {
            let case_span = self.span();
            let case_id = self.id();
            let test = if self.eat_keyword(Keyword::Case) {
                let test = self.parse_expression()?;
                Some(test)
            } else if self.eat_keyword(Keyword::Default) {
                None
            } else {
                return Err(self.error("Expected 'case' or 'default' in switch body"));
            };
            self.expect_punct(":")?;
            let mut body = Vec::new();
            while !self.at_punct("}")
                && !self.at_keyword(Keyword::Case)
                && !self.at_keyword(Keyword::Default)
            {
                if matches!(self.current(), Tok::Eof) {
                    return Err(self.error("Unexpected end of input in switch"));
                }
                body.push(self.parse_statement()?);
            }
            cases.push(SwitchCase {
                id: case_id,
                span: case_span,
                test,
                body,
            });
        }
        self.expect_punct("}")?;
        Ok(Stmt {
            id,
            span,
            kind: StmtKind::Switch {
                discriminant,
                cases,
            },
        })
    }

    fn parse_for(&mut self, span: Span) -> Result<Stmt, SyntaxError> {
        let id = self.id();
        self.bump();
        self.expect_punct("(")?;

        // for (decl name of/in …)
        let decl = match self.current() {
            Tok::Keyword(Keyword::Var) => Some(DeclKind::Var),
            Tok::Keyword(Keyword::Let) => Some(DeclKind::Let),
            Tok::Keyword(Keyword::Const) => Some(DeclKind::Const),
            _ => None,
        };
        let binding_offset = if decl.is_some() { 1 } else { 0 };
        if let Tok::Ident(binding) = self.peek_ahead(binding_offset).clone() {
            let is_of = matches!(self.peek_ahead(binding_offset + 1), Tok::Keyword(Keyword::Of));
            let is_in = matches!(self.peek_ahead(binding_offset + 1), Tok::Keyword(Keyword::In));
            if is_of || is_in {
                if decl.is_some() {
                    self.bump(); // decl keyword
                }
                let binding_span = self.span();
                self.bump(); // binding
                self.bump(); // of / in
                let expr = self.parse_expression()?;
                self.expect_punct(")")?;
                let body = Box::new(self.parse_statement()?);
                let kind = if is_of {
                    StmtKind::ForOf {
                        decl,
                        binding,
                        binding_span,
                        iterable: expr,
                        body,
                    }
                } else {
                    StmtKind::ForIn {
                        decl,
                        binding,
                        binding_span,
                        object: expr,
                        body,
                    }
                };
                return Ok(Stmt { id, span, kind });
            }
        }

        // Classic for(;;)
        let init = if self.at_punct(";") {
            self.bump();
            None
        } else if let Some(kind) = decl {
            let init_span = self.span();
            Some(Box::new(self.parse_var_decl(kind, init_span)?))
        } else {
            let init_span = self.span();
            let init_id = self.id();
            let expr = self.parse_expression()?;
            self.expect_punct(";")?;
            Some(Box::new(Stmt {
                id: init_id,
                span: init_span,
                kind: StmtKind::Expression(expr),
            }))
        };
        let test = if self.at_punct(";") {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(";")?;
        let update = if self.at_punct(")") {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(")")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt {
            id,
            span,
            kind: StmtKind::For {
                init,
                test,
                update,
                body,
            },
        })
    }

    fn parse_while(&mut self, span: Span) -> Result<Stmt, SyntaxError> {
        let id = self.id();
        self.bump();
        self.expect_punct("(")?;
        let test = self.parse_expression()?;
        self.expect_punct(")")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt {
            id,
            span,
            kind: StmtKind::While { test, body },
        })
    }

    fn parse_try(&mut self, span: Span) -> Result<Stmt, SyntaxError> {
        let id = self.id();
        self.bump();
        let block = self.parse_block()?;
        let handler = if self.at_keyword(Keyword::Catch) {
            let clause_span = self.span();
            let clause_id = self.id();
            self.bump();
            let mut param = None;
            let mut param_span = clause_span;
            if self.eat_punct("(") {
                param_span = self.span();
                match self.current().clone() {
                    Tok::Ident(name) => {
                        self.bump();
                        param = Some(name);
                    }
                    other => {
                        return Err(SyntaxError::new(
                            format!("Expected catch binding, found {}", describe(&other)),
                            param_span,
                        ));
                    }
                }
                self.expect_punct(")")?;
            }
            let body = self.parse_block()?;
            Some(CatchClause {
                id: clause_id,
                span: clause_span,
                param,
                param_span,
                body,
            })
        } else {
            None
        };
        let finalizer = if self.eat_keyword(Keyword::Finally) {
            Some(self.parse_block()?)
        } else {
            None
        };
        if handler.is_none() && finalizer.is_none() {
            return Err(SyntaxError::new(
                "Missing catch or finally after try",
                span,
            ));
        }
        Ok(Stmt {
            id,
            span,
            kind: StmtKind::Try {
                block,
                handler,
                finalizer,
            },
        })
    }

    // ----- expressions -----

    fn parse_expression(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        let first = self.parse_assignment()?;
        if !self.at_punct(",") {
            return Ok(first);
        }
        let id = self.id();
        let mut exprs = vec![first];
        while self.eat_punct(",") {
            exprs.push(self.parse_assignment()?);
        }
        Ok(Expr {
            id,
            span,
            kind: ExprKind::Sequence(exprs),
        })
    }

    fn parse_assignment(&mut self) -> Result<Expr, SyntaxError> {
        if let Some(expr) = self.try_parse_arrow()? {
            return Ok(expr);
        }
        let span = self.span();
        let left = self.parse_conditional()?;
        let op = match self.current() {
            Tok::Punct(p) if ASSIGN_OPS.contains(p) => *p,
            _ => return Ok(left),
        };
        if !matches!(
            left.kind,
            ExprKind::Identifier(_) | ExprKind::Member { .. }
        ) {
            return Err(SyntaxError::new("Invalid assignment target", span));
        }
        let id = self.id();
        self.bump();
        let value = self.parse_assignment()?;
        Ok(Expr {
            id,
            span,
            kind: ExprKind::Assignment {
                op,
                target: Box::new(left),
                value: Box::new(value),
            },
        })
    }

    /// Arrow functions need unbounded lookahead to tell `(a, b) => …` from a
    /// parenthesized expression; scan for the `=>` before committing.
    fn try_parse_arrow(&mut self) -> Result<Option<Expr>, SyntaxError> {
        let is_async = self.at_keyword(Keyword::Async)
            && !matches!(self.peek_ahead(1), Tok::Keyword(Keyword::Function));
        let offset = if is_async { 1 } else { 0 };

        let arrow_ahead = match self.peek_ahead(offset) {
            Tok::Ident(_) => matches!(self.peek_ahead(offset + 1), Tok::Punct("=>")),
            Tok::Punct("(") => {
                let mut depth = 0usize;
                let mut i = offset;
                loop {
                    match self.peek_ahead(i) {
                        Tok::Eof => break false,
                        Tok::Punct("(") => depth += 1,
                        Tok::Punct(")") => {
                            depth -= 1;
                            if depth == 0 {
                                break matches!(self.peek_ahead(i + 1), Tok::Punct("=>"));
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
            }
            _ => false,
        };
        if !arrow_ahead {
            return Ok(None);
        }

        let span = self.span();
        let id = self.id();
        if is_async {
            self.bump();
        }
        let (params, param_faults) = if matches!(self.current(), Tok::Ident(_)) {
            let param_span = self.span();
            let name = match self.bump().tok {
                Tok::Ident(name) => name,
                _ => String::new(),
            };
            (
                vec![Param {
                    name,
                    span: param_span,
                }],
                Vec::new(),
            )
        } else {
            self.parse_params()?
        };
        self.expect_punct("=>")?;
        let body = if self.at_punct("{") {
            FnBody::Block(self.parse_block()?)
        } else {
            FnBody::Expr(Box::new(self.parse_assignment()?))
        };
        Ok(Some(Expr {
            id,
            span,
            kind: ExprKind::Function(Arc::new(Function {
                id,
                span,
                name: None,
                params,
                param_faults,
                body,
                is_arrow: true,
                is_async,
                is_generator: false,
            })),
        }))
    }

    fn parse_conditional(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        let test = self.parse_binary(0)?;
        if !self.at_punct("?") || self.at_punct("?.") {
            return Ok(test);
        }
        let id = self.id();
        self.bump();
        let consequent = self.parse_assignment()?;
        self.expect_punct(":")?;
        let alternate = self.parse_assignment()?;
        Ok(Expr {
            id,
            span,
            kind: ExprKind::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            },
        })
    }

    fn parse_binary(&mut self, level: usize) -> Result<Expr, SyntaxError> {
        if level == BINARY_LEVELS.len() {
            return self.parse_unary();
        }
        let span = self.span();
        let mut left = self.parse_binary(level + 1)?;
        loop {
            let op = match self.current() {
                Tok::Punct(p) if BINARY_LEVELS[level].contains(p) => *p,
                Tok::Keyword(Keyword::In) if level == RELATIONAL_LEVEL => "in",
                Tok::Keyword(Keyword::Instanceof) if level == RELATIONAL_LEVEL => "instanceof",
                _ => return Ok(left),
            };
            let id = self.id();
            self.bump();
            let right = self.parse_binary(level + 1)?;
            let logical = matches!(op, "&&" | "||" | "??");
            let kind = if logical {
                ExprKind::Logical {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                }
            } else {
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                }
            };
            left = Expr { id, span, kind };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        let op: Option<&'static str> = match self.current() {
            Tok::Punct(p @ ("!" | "~" | "+" | "-")) => Some(*p),
            Tok::Keyword(Keyword::Typeof) => Some("typeof"),
            Tok::Keyword(Keyword::Void) => Some("void"),
            Tok::Keyword(Keyword::Delete) => Some("delete"),
            _ => None,
        };
        if let Some(op) = op {
            let id = self.id();
            self.bump();
            let operand = self.parse_unary()?;
            return Ok(Expr {
                id,
                span,
                kind: ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
            });
        }
        if self.at_punct("++") || self.at_punct("--") {
            let op: &'static str = if self.at_punct("++") { "++" } else { "--" };
            let id = self.id();
            self.bump();
            let target = self.parse_unary()?;
            return Ok(Expr {
                id,
                span,
                kind: ExprKind::Update {
                    op,
                    prefix: true,
                    target: Box::new(target),
                },
            });
        }
        if self.at_keyword(Keyword::Await) {
            let id = self.id();
            self.bump();
            let _ = self.parse_unary()?;
            return Ok(Expr {
                id,
                span,
                kind: ExprKind::Unsupported {
                    kind: "AwaitExpression",
                },
            });
        }
        if self.at_keyword(Keyword::Yield) {
            let id = self.id();
            self.bump();
            if !self.at_punct(";") && !self.at_punct(")") && !self.at_punct("}") {
                let _ = self.parse_assignment()?;
            }
            return Ok(Expr {
                id,
                span,
                kind: ExprKind::Unsupported {
                    kind: "YieldExpression",
                },
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        let expr = self.parse_call_member()?;
        if self.at_punct("++") || self.at_punct("--") {
            let op: &'static str = if self.at_punct("++") { "++" } else { "--" };
            let id = self.id();
            self.bump();
            return Ok(Expr {
                id,
                span,
                kind: ExprKind::Update {
                    op,
                    prefix: false,
                    target: Box::new(expr),
                },
            });
        }
        Ok(expr)
    }

    fn parse_call_member(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        let mut expr = if self.at_keyword(Keyword::New) {
            let id = self.id();
            self.bump();
            let mut callee = self.parse_primary()?;
            // Member accesses bind tighter than `new`'s argument list.
            loop {
                if self.eat_punct(".") {
                    let property = self.parse_property_name()?;
                    let member_id = self.id();
                    callee = Expr {
                        id: member_id,
                        span,
                        kind: ExprKind::Member {
                            object: Box::new(callee),
                            property: MemberProp::Ident(property),
                            optional: false,
                        },
                    };
                } else {
                    break;
                }
            }
            let args = if self.at_punct("(") {
                self.parse_arguments()?
            } else {
                Vec::new()
            };
            Expr {
                id,
                span,
                kind: ExprKind::New {
                    callee: Box::new(callee),
                    args,
                },
            }
        } else {
            self.parse_primary()?
        };

        loop {
            if self.eat_punct(".") {
                let property = self.parse_property_name()?;
                let id = self.id();
                expr = Expr {
                    id,
                    span,
                    kind: ExprKind::Member {
                        object: Box::new(expr),
                        property: MemberProp::Ident(property),
                        optional: false,
                    },
                };
            } else if self.at_punct("?.") {
                self.bump();
                let id = self.id();
                if self.at_punct("(") {
                    let args = self.parse_arguments()?;
                    expr = Expr {
                        id,
                        span,
                        kind: ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                            optional: true,
                        },
                    };
                } else if self.eat_punct("[") {
                    let key = self.parse_expression()?;
                    self.expect_punct("]")?;
                    expr = Expr {
                        id,
                        span,
                        kind: ExprKind::Member {
                            object: Box::new(expr),
                            property: MemberProp::Computed(Box::new(key)),
                            optional: true,
                        },
                    };
                } else {
                    let property = self.parse_property_name()?;
                    expr = Expr {
                        id,
                        span,
                        kind: ExprKind::Member {
                            object: Box::new(expr),
                            property: MemberProp::Ident(property),
                            optional: true,
                        },
                    };
                }
            } else if self.eat_punct("[") {
                let key = self.parse_expression()?;
                self.expect_punct("]")?;
                let id = self.id();
                expr = Expr {
                    id,
                    span,
                    kind: ExprKind::Member {
                        object: Box::new(expr),
                        property: MemberProp::Computed(Box::new(key)),
                        optional: false,
                    },
                };
            } else if self.at_punct("(") {
                let args = self.parse_arguments()?;
                let id = self.id();
                expr = Expr {
                    id,
                    span,
                    kind: ExprKind::Call {
                        callee: Box::new(expr),
                        args,
                        optional: false,
                    },
                };
            } else if let Tok::Template { .. } = self.current() {
                let template_span = self.span();
                let (quasis, exprs) = self.parse_template_parts()?;
                let id = self.id();
                expr = Expr {
                    id,
                    span: template_span,
                    kind: ExprKind::TaggedTemplate {
                        tag: Box::new(expr),
                        quasis,
                        exprs,
                    },
                };
            } else {
                return Ok(expr);
            }
        }
    }

    /// Property name after `.` — keywords are legal here (`x.catch`).
    fn parse_property_name(&mut self) -> Result<String, SyntaxError> {
        match self.bump().tok {
            Tok::Ident(name) => Ok(name),
            Tok::Keyword(kw) => Ok(kw.as_str().to_string()),
            other => Err(self.error(format!(
                "Expected property name, found {}",
                describe(&other)
            ))),
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Element>, SyntaxError> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        while !self.at_punct(")") {
            if self.at_punct("...") {
                let spread_span = self.span();
                self.bump();
                args.push(Element::Spread {
                    span: spread_span,
                    argument: self.parse_assignment()?,
                });
            } else {
                args.push(Element::Item(self.parse_assignment()?));
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(args)
    }

    fn parse_template_parts(&mut self) -> Result<(Vec<String>, Vec<Expr>), SyntaxError> {
        let token = self.bump();
        let Tok::Template { quasis, exprs } = token.tok else {
            return Err(SyntaxError::new("Expected template literal", token.span));
        };
        let mut parsed = Vec::with_capacity(exprs.len());
        for source in exprs {
            parsed.push(self.parse_embedded_expression(&source, token.span)?);
        }
        Ok((quasis, parsed))
    }

    /// Parse a `${…}` body. Node ids keep flowing from this parser so the
    /// ids stay unique across the whole program.
    fn parse_embedded_expression(
        &mut self,
        source: &str,
        base: Span,
    ) -> Result<Expr, SyntaxError> {
        let tokens = lex(source).map_err(|e| {
            SyntaxError::new(format!("In template expression: {}", e.message), base)
        })?;
        let mut sub = Parser::new(tokens, self.next_id);
        let expr = sub.parse_expression().map_err(|e| {
            SyntaxError::new(format!("In template expression: {}", e.message), base)
        })?;
        if !matches!(sub.current(), Tok::Eof) {
            return Err(SyntaxError::new(
                "Trailing tokens in template expression",
                base,
            ));
        }
        self.next_id = sub.next_id;
        Ok(expr)
    }

    fn parse_params(&mut self) -> Result<(Vec<Param>, Vec<(Span, &'static str)>), SyntaxError> {
        self.expect_punct("(")?;
        let mut params = Vec::new();
        let mut faults = Vec::new();
        while !self.at_punct(")") {
            let param_span = self.span();
            match self.current().clone() {
                Tok::Ident(name) => {
                    self.bump();
                    if self.eat_punct("=") {
                        let _ = self.parse_assignment()?;
                        faults.push((param_span, "AssignmentPattern"));
                    }
                    params.push(Param {
                        name,
                        span: param_span,
                    });
                }
                Tok::Punct("...") => {
                    self.bump();
                    let _ = self.parse_assignment()?;
                    faults.push((param_span, "RestElement"));
                }
                Tok::Punct("{") => {
                    self.skip_balanced("{", "}");
                    faults.push((param_span, "ObjectPattern"));
                }
                Tok::Punct("[") => {
                    self.skip_balanced("[", "]");
                    faults.push((param_span, "ArrayPattern"));
                }
                other => {
                    return Err(SyntaxError::new(
                        format!("Expected parameter name, found {}", describe(&other)),
                        param_span,
                    ));
                }
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok((params, faults))
    }

    fn skip_balanced(&mut self, open: &str, close: &str) {
        let mut depth = 0usize;
        loop {
            let punct: Option<&'static str> = match self.current() {
                Tok::Eof => return,
                Tok::Punct(p) => Some(*p),
                _ => None,
            };
            match punct {
                Some(p) if p == open => {
                    depth += 1;
                    self.bump();
                }
                Some(p) if p == close => {
                    depth = depth.saturating_sub(1);
                    self.bump();
                    if depth == 0 {
                        return;
                    }
                }
                _ => {
                    self.bump();
                }
            }
        }
    }

    fn parse_function(
        &mut self,
        is_async: bool,
        span: Span,
    ) -> Result<Arc<Function>, SyntaxError> {
        let id = self.id();
        self.expect_keyword(Keyword::Function)?;
        let is_generator = self.eat_punct("*");
        let name = match self.current().clone() {
            Tok::Ident(name) => {
                self.bump();
                Some(name)
            }
            _ => None,
        };
        let (params, param_faults) = self.parse_params()?;
        let body = FnBody::Block(self.parse_block()?);
        Ok(Arc::new(Function {
            id,
            span,
            name,
            params,
            param_faults,
            body,
            is_arrow: false,
            is_async,
            is_generator,
        }))
    }

    fn parse_primary(&mut self) -> Result<Expr, SyntaxError> {
        let span = self.span();
        match self.current().clone() {
            Tok::Number(value) => {
                let id = self.id();
                self.bump();
                Ok(Expr {
                    id,
                    span,
                    kind: ExprKind::Literal(Lit::Number(value)),
                })
            }
            Tok::Str(value) => {
                let id = self.id();
                self.bump();
                Ok(Expr {
                    id,
                    span,
                    kind: ExprKind::Literal(Lit::Str(value)),
                })
            }
            Tok::Template { .. } => {
                let (quasis, exprs) = self.parse_template_parts()?;
                let id = self.id();
                Ok(Expr {
                    id,
                    span,
                    kind: ExprKind::Template { quasis, exprs },
                })
            }
            Tok::Keyword(Keyword::True) => {
                let id = self.id();
                self.bump();
                Ok(Expr {
                    id,
                    span,
                    kind: ExprKind::Literal(Lit::Bool(true)),
                })
            }
            Tok::Keyword(Keyword::False) => {
                let id = self.id();
                self.bump();
                Ok(Expr {
                    id,
                    span,
                    kind: ExprKind::Literal(Lit::Bool(false)),
                })
            }
            Tok::Keyword(Keyword::Null) => {
                let id = self.id();
                self.bump();
                Ok(Expr {
                    id,
                    span,
                    kind: ExprKind::Literal(Lit::Null),
                })
            }
            Tok::Keyword(Keyword::Undefined) => {
                let id = self.id();
                self.bump();
                Ok(Expr {
                    id,
                    span,
                    kind: ExprKind::Literal(Lit::Undefined),
                })
            }
            Tok::Ident(name) => {
                let id = self.id();
                self.bump();
                Ok(Expr {
                    id,
                    span,
                    kind: ExprKind::Identifier(name),
                })
            }
            Tok::Punct("(") => {
                self.bump();
                let expr = self.parse_expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            Tok::Punct("[") => self.parse_array(span),
            Tok::Punct("{") => self.parse_object(span),
            Tok::Keyword(Keyword::Function) => {
                let function = self.parse_function(false, span)?;
                let id = self.id();
                Ok(Expr {
                    id,
                    span,
                    kind: ExprKind::Function(function),
                })
            }
            Tok::Keyword(Keyword::Async)
                if matches!(self.peek_ahead(1), Tok::Keyword(Keyword::Function)) =>
            {
                self.bump();
                let function = self.parse_function(true, span)?;
                let id = self.id();
                Ok(Expr {
                    id,
                    span,
                    kind: ExprKind::Function(function),
                })
            }
            Tok::Keyword(Keyword::This) => {
                let id = self.id();
                self.bump();
                Ok(Expr {
                    id,
                    span,
                    kind: ExprKind::Unsupported {
                        kind: "ThisExpression",
                    },
                })
            }
            Tok::Keyword(Keyword::Class) => {
                let id = self.id();
                self.skip_statement();
                Ok(Expr {
                    id,
                    span,
                    kind: ExprKind::Unsupported {
                        kind: "ClassExpression",
                    },
                })
            }
            other => Err(SyntaxError::new(
                format!("Unexpected token: {}", describe(&other)),
                span,
            )),
        }
    }

    fn parse_array(&mut self, span: Span) -> Result<Expr, SyntaxError> {
        let id = self.id();
        self.expect_punct("[")?;
        let mut elements = Vec::new();
        while !self.at_punct("]") {
            if self.at_punct(",") {
                // Elision: treat the hole as undefined.
                let hole_id = self.id();
                elements.push(Element::Item(Expr {
                    id: hole_id,
                    span: self.span(),
                    kind: ExprKind::Literal(Lit::Undefined),
                }));
                self.bump();
                continue;
            }
            if self.at_punct("...") {
                let spread_span = self.span();
                self.bump();
                elements.push(Element::Spread {
                    span: spread_span,
                    argument: self.parse_assignment()?,
                });
            } else {
                elements.push(Element::Item(self.parse_assignment()?));
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct("]")?;
        Ok(Expr {
            id,
            span,
            kind: ExprKind::Array(elements),
        })
    }

    fn parse_object(&mut self, span: Span) -> Result<Expr, SyntaxError> {
        let id = self.id();
        self.expect_punct("{")?;
        let mut properties = Vec::new();
        while !self.at_punct("}") {
            let prop_span = self.span();
            if self.at_punct("...") {
                let prop_id = self.id();
                self.bump();
                properties.push(ObjectProperty::Spread {
                    id: prop_id,
                    span: prop_span,
                    argument: self.parse_assignment()?,
                });
            } else {
                let prop_id = self.id();
                let key = match self.current().clone() {
                    Tok::Ident(name) => {
                        self.bump();
                        PropKey::Ident(name)
                    }
                    Tok::Keyword(kw) => {
                        self.bump();
                        PropKey::Ident(kw.as_str().to_string())
                    }
                    Tok::Str(value) => {
                        self.bump();
                        PropKey::Str(value)
                    }
                    Tok::Number(value) => {
                        self.bump();
                        PropKey::Number(value)
                    }
                    Tok::Punct("[") => {
                        self.bump();
                        let key = self.parse_assignment()?;
                        self.expect_punct("]")?;
                        PropKey::Computed(Box::new(key))
                    }
                    other => {
                        return Err(SyntaxError::new(
                            format!("Expected property key, found {}", describe(&other)),
                            prop_span,
                        ));
                    }
                };
                let value = if self.eat_punct(":") {
                    self.parse_assignment()?
                } else if self.at_punct("(") {
                    // Shorthand method.
                    let (params, param_faults) = self.parse_params()?;
                    let body = FnBody::Block(self.parse_block()?);
                    let fn_id = self.id();
                    Expr {
                        id: fn_id,
                        span: prop_span,
                        kind: ExprKind::Function(Arc::new(Function {
                            id: fn_id,
                            span: prop_span,
                            name: None,
                            params,
                            param_faults,
                            body,
                            is_arrow: false,
                            is_async: false,
                            is_generator: false,
                        })),
                    }
                } else {
                    // Shorthand property.
                    let name = match &key {
                        PropKey::Ident(name) => name.clone(),
                        _ => {
                            return Err(SyntaxError::new(
                                "Expected ':' after property key",
                                prop_span,
                            ));
                        }
                    };
                    let value_id = self.id();
                    Expr {
                        id: value_id,
                        span: prop_span,
                        kind: ExprKind::Identifier(name),
                    }
                };
                properties.push(ObjectProperty::Property {
                    id: prop_id,
                    span: prop_span,
                    key,
                    value,
                });
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct("}")?;
        Ok(Expr {
            id,
            span,
            kind: ExprKind::Object(properties),
        })
    }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Ident(name) => format!("identifier '{name}'"),
        Tok::Keyword(kw) => format!("'{}'", kw.as_str()),
        Tok::Number(n) => format!("number {n}"),
        Tok::Str(_) => "string literal".to_string(),
        Tok::Template { .. } => "template literal".to_string(),
        Tok::Punct(p) => format!("'{p}'"),
        Tok::Eof => "end of input".to_string(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn parse_ok(source: &str) -> Program {
        parse(source).unwrap()
    }

    fn first_expr(program: &Program) -> &Expr {
        match &program.body[0].kind {
            StmtKind::Expression(expr) => expr,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn parses_variable_declarations() {
        let program = parse_ok("const a = 1, b = 'two';");
        match &program.body[0].kind {
            StmtKind::VarDecl { kind, declarators } => {
                assert_eq!(*kind, DeclKind::Const);
                assert_eq!(declarators.len(), 2);
                assert_eq!(declarators[0].name, "a");
                assert_eq!(declarators[1].name, "b");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_call_chains() {
        let program = parse_ok("search(\"query\", { path: \"src\" }).length");
        let expr = first_expr(&program);
        assert_eq!(expr.kind_name(), "MemberExpression");
    }

    #[test]
    fn parses_arrow_functions() {
        let program = parse_ok("const f = (a, b) => a + b;");
        match &program.body[0].kind {
            StmtKind::VarDecl { declarators, .. } => {
                let init = declarators[0].init.as_ref().unwrap();
                match &init.kind {
                    ExprKind::Function(f) => {
                        assert!(f.is_arrow);
                        assert!(!f.is_async);
                        assert_eq!(f.params.len(), 2);
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_single_param_arrow_without_parens() {
        let program = parse_ok("map(items, item => item.name)");
        let expr = first_expr(&program);
        assert_eq!(expr.kind_name(), "CallExpression");
    }

    #[test]
    fn distinguishes_parenthesized_expression_from_arrow() {
        let program = parse_ok("(a + b) * c");
        assert_eq!(first_expr(&program).kind_name(), "BinaryExpression");
    }

    #[test]
    fn parses_for_of_and_for_in() {
        let program = parse_ok("for (const x of xs) { log(x) }\nfor (k in obj) {}");
        assert!(matches!(program.body[0].kind, StmtKind::ForOf { .. }));
        assert!(matches!(program.body[1].kind, StmtKind::ForIn { .. }));
    }

    #[test]
    fn parses_classic_for() {
        let program = parse_ok("for (let i = 0; i < 10; i++) { total += i }");
        match &program.body[0].kind {
            StmtKind::For { init, test, update, .. } => {
                assert!(init.is_some());
                assert!(test.is_some());
                assert!(update.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_try_catch_finally() {
        let program = parse_ok("try { risky() } catch (e) { log(e) } finally { done() }");
        match &program.body[0].kind {
            StmtKind::Try {
                handler, finalizer, ..
            } => {
                assert_eq!(handler.as_ref().unwrap().param.as_deref(), Some("e"));
                assert!(finalizer.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn template_expressions_are_parsed() {
        let program = parse_ok("`found ${results.length} results`");
        match &first_expr(&program).kind {
            ExprKind::Template { quasis, exprs } => {
                assert_eq!(quasis.len(), 2);
                assert_eq!(exprs.len(), 1);
                assert_eq!(exprs[0].kind_name(), "MemberExpression");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn await_parses_to_unsupported_node() {
        let program = parse_ok("await search('x')");
        assert_eq!(first_expr(&program).kind_name(), "AwaitExpression");
    }

    #[test]
    fn class_and_import_parse_to_unsupported_nodes() {
        let program = parse_ok("class Foo { bar() {} }\nlet after = 1;");
        assert_eq!(program.body[0].kind_name(), "ClassDeclaration");
        // Recovery resumes at the statement after the class body.
        assert_eq!(program.body[1].kind_name(), "VariableDeclaration");

        let program = parse_ok("import fs from 'fs';");
        assert_eq!(program.body[0].kind_name(), "ImportDeclaration");
    }

    #[test]
    fn labeled_statement_is_unsupported() {
        let program = parse_ok("outer: while (true) { break }");
        assert_eq!(program.body[0].kind_name(), "LabeledStatement");
    }

    #[test]
    fn destructuring_binding_is_unsupported() {
        let program = parse_ok("const { a, b } = load();");
        assert_eq!(program.body[0].kind_name(), "ObjectPattern");
    }

    #[test]
    fn optional_chaining_parses() {
        let program = parse_ok("result?.items?.[0]?.name");
        assert_eq!(first_expr(&program).kind_name(), "MemberExpression");
    }

    #[test]
    fn spread_in_calls_and_arrays() {
        let program = parse_ok("flatten([...xs, ...ys])");
        assert_eq!(first_expr(&program).kind_name(), "CallExpression");
    }

    #[test]
    fn semicolons_are_optional() {
        let program = parse_ok("let a = 1\nlet b = 2\nlog(a + b)");
        assert_eq!(program.body.len(), 3);
    }

    #[test]
    fn node_ids_are_unique() {
        let program = parse_ok("const x = `a ${f(1)} b`; g(x)");
        let mut seen = std::collections::HashSet::new();
        fn walk_expr(expr: &Expr, seen: &mut std::collections::HashSet<NodeId>) {
            assert!(seen.insert(expr.id), "duplicate id {}", expr.id);
            if let ExprKind::Template { exprs, .. } = &expr.kind {
                for e in exprs {
                    walk_expr(e, seen);
                }
            }
        }
        for stmt in &program.body {
            match &stmt.kind {
                StmtKind::VarDecl { declarators, .. } => {
                    for d in declarators {
                        if let Some(init) = &d.init {
                            walk_expr(init, &mut seen);
                        }
                    }
                }
                StmtKind::Expression(expr) => walk_expr(expr, &mut seen),
                _ => {}
            }
        }
    }

    #[test]
    fn missing_paren_is_a_syntax_error() {
        assert!(parse("if (x { }").is_err());
        assert!(parse("f(1, 2").is_err());
    }
}
