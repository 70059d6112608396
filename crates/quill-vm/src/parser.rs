//! Recursive-descent parser for Quill.
//!
//! Newlines terminate statements. They are skipped after binary operators,
//! inside parentheses, list and map literals and argument lists, and before a
//! `.` that continues a method chain on the next line.

use crate::ast::*;
use crate::error::{CompileError, CompileResult};
use crate::lexer::{tokenize, Spanned, Token};
use std::cell::Cell;
use std::rc::Rc;

/// Parses a whole module.
pub fn parse(source: &str) -> CompileResult<Block> {
    Parser::new(tokenize(source)?).module()
}

/// The method whose body is being parsed, for bare `super` calls.
#[derive(Clone)]
struct MethodContext {
    kind: MethodKind,
    name: String,
}

pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    in_class: bool,
    method: Option<MethodContext>,
}

type Operators<'a> = &'a [(Token, &'static str)];

impl Parser {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            pos: 0,
            in_class: false,
            method: None,
        }
    }

    // ========================================================================
    // Token helpers
    // ========================================================================

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.line)
            .unwrap_or(1)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let spanned = self.tokens.get(self.pos).cloned();
        if spanned.is_some() {
            self.pos += 1;
        }
        spanned
    }

    fn matches(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, message: &str) -> CompileResult<u32> {
        let line = self.line();
        if self.matches(token) {
            Ok(line)
        } else {
            Err(self.error(message))
        }
    }

    fn expect_name(&mut self, message: &str) -> CompileResult<(String, u32)> {
        let line = self.line();
        match self.peek() {
            Some(Token::Name(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok((name, line))
            }
            _ => Err(self.error(message)),
        }
    }

    fn skip_newlines(&mut self) {
        while self.matches(&Token::Newline) {}
    }

    /// The first token after any run of newlines, without consuming anything.
    fn peek_past_newlines(&self) -> Option<&Token> {
        self.tokens[self.pos.min(self.tokens.len())..]
            .iter()
            .map(|s| &s.token)
            .find(|t| **t != Token::Newline)
    }

    fn error(&self, message: &str) -> CompileError {
        CompileError::new(self.line(), message)
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn module(mut self) -> CompileResult<Block> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if self.at_end() {
                break;
            }
            stmts.push(self.definition(true)?);
            self.end_of_statement()?;
        }
        Ok(stmts)
    }

    fn end_of_statement(&mut self) -> CompileResult<()> {
        if self.at_end() || self.check(&Token::RightBrace) {
            return Ok(());
        }
        self.expect(&Token::Newline, "Expect newline after statement.")?;
        Ok(())
    }

    fn definition(&mut self, top_level: bool) -> CompileResult<Stmt> {
        let line = self.line();
        match self.peek() {
            Some(Token::Class) | Some(Token::Foreign) => {
                if !top_level {
                    return Err(self.error("Classes must be defined at the top level of a module."));
                }
                let is_foreign = self.matches(&Token::Foreign);
                let decl = self.class_definition(is_foreign)?;
                Ok(Stmt {
                    kind: StmtKind::Class(Rc::new(decl)),
                    line,
                })
            }
            Some(Token::Import) => {
                if !top_level {
                    return Err(self.error("Imports must appear at the top level of a module."));
                }
                self.import()
            }
            Some(Token::Var) => {
                self.pos += 1;
                let (name, _) = self.expect_name("Expect variable name.")?;
                let init = if self.matches(&Token::Equal) {
                    self.skip_newlines();
                    Some(self.expression()?)
                } else {
                    None
                };
                Ok(Stmt {
                    kind: StmtKind::Var { name, init },
                    line,
                })
            }
            _ => self.statement(),
        }
    }

    fn import(&mut self) -> CompileResult<Stmt> {
        let line = self.expect(&Token::Import, "Expect 'import'.")?;
        let module = match self.advance() {
            Some(Spanned {
                token: Token::Str(bytes),
                ..
            }) => String::from_utf8_lossy(&bytes).into_owned(),
            _ => return Err(CompileError::new(line, "Expect a string after 'import'.")),
        };
        let mut names = Vec::new();
        if self.matches(&Token::For) {
            loop {
                self.skip_newlines();
                let (name, _) = self.expect_name("Expect variable name.")?;
                let alias = if self.matches(&Token::As) {
                    Some(self.expect_name("Expect variable name after 'as'.")?.0)
                } else {
                    None
                };
                names.push(ImportName { name, alias });
                if !self.matches(&Token::Comma) {
                    break;
                }
            }
        }
        Ok(Stmt {
            kind: StmtKind::Import { module, names },
            line,
        })
    }

    fn statement(&mut self) -> CompileResult<Stmt> {
        let line = self.line();
        let kind = match self.peek() {
            Some(Token::If) => {
                self.pos += 1;
                let cond = self.parenthesized("if")?;
                let then_branch = Box::new(self.statement()?);
                let else_branch = if self.peek_past_newlines() == Some(&Token::Else) {
                    self.skip_newlines();
                    self.pos += 1;
                    self.skip_newlines();
                    Some(Box::new(self.statement()?))
                } else {
                    None
                };
                StmtKind::If {
                    cond,
                    then_branch,
                    else_branch,
                }
            }
            Some(Token::While) => {
                self.pos += 1;
                let cond = self.parenthesized("while")?;
                let body = Box::new(self.statement()?);
                StmtKind::While { cond, body }
            }
            Some(Token::For) => {
                self.pos += 1;
                self.expect(&Token::LeftParen, "Expect '(' after 'for'.")?;
                self.skip_newlines();
                let (var, _) = self.expect_name("Expect for loop variable name.")?;
                self.expect(&Token::In, "Expect 'in' after loop variable.")?;
                self.skip_newlines();
                let seq = self.expression()?;
                self.skip_newlines();
                self.expect(&Token::RightParen, "Expect ')' after loop expression.")?;
                let body = Box::new(self.statement()?);
                StmtKind::For { var, seq, body }
            }
            Some(Token::Return) => {
                self.pos += 1;
                if self.at_end() || self.check(&Token::Newline) || self.check(&Token::RightBrace) {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.expression()?))
                }
            }
            Some(Token::Break) => {
                self.pos += 1;
                StmtKind::Break
            }
            Some(Token::Continue) => {
                self.pos += 1;
                StmtKind::Continue
            }
            Some(Token::LeftBrace) => {
                self.pos += 1;
                StmtKind::Block(self.body()?.stmts)
            }
            _ => StmtKind::Expr(self.expression()?),
        };
        Ok(Stmt { kind, line })
    }

    fn parenthesized(&mut self, keyword: &str) -> CompileResult<Expr> {
        self.expect(&Token::LeftParen, &format!("Expect '(' after '{keyword}'."))?;
        self.skip_newlines();
        let expr = self.expression()?;
        self.skip_newlines();
        self.expect(&Token::RightParen, "Expect ')' after condition.")?;
        Ok(expr)
    }

    /// Parses the rest of a `{ ... }` body; the brace is already consumed.
    fn body(&mut self) -> CompileResult<Body> {
        if self.matches(&Token::RightBrace) {
            return Ok(Body {
                stmts: Vec::new(),
                is_expression: false,
            });
        }
        if !self.check(&Token::Newline) {
            let stmt = self.definition(false)?;
            self.expect(&Token::RightBrace, "Expect '}' at end of block.")?;
            let is_expression = matches!(stmt.kind, StmtKind::Expr(_));
            return Ok(Body {
                stmts: vec![stmt],
                is_expression,
            });
        }
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if self.matches(&Token::RightBrace) {
                break;
            }
            if self.at_end() {
                return Err(self.error("Expect '}' at end of block."));
            }
            stmts.push(self.definition(false)?);
            self.end_of_statement()?;
        }
        Ok(Body {
            stmts,
            is_expression: false,
        })
    }

    // ========================================================================
    // Classes
    // ========================================================================

    fn class_definition(&mut self, is_foreign: bool) -> CompileResult<ClassDecl> {
        let line = self.expect(&Token::Class, "Expect 'class' after 'foreign'.")?;
        let (name, _) = self.expect_name("Expect class name.")?;
        let superclass = if self.matches(&Token::Is) {
            Some(self.expect_name("Expect superclass name.")?.0)
        } else {
            None
        };
        self.expect(&Token::LeftBrace, "Expect '{' after class declaration.")?;

        let was_in_class = std::mem::replace(&mut self.in_class, true);
        let mut methods = Vec::new();
        loop {
            self.skip_newlines();
            if self.matches(&Token::RightBrace) {
                break;
            }
            if self.at_end() {
                return Err(self.error("Expect '}' after class body."));
            }
            methods.push(Rc::new(self.method()?));
            if !self.check(&Token::RightBrace) {
                self.expect(&Token::Newline, "Expect newline after definition in class.")?;
            }
        }
        self.in_class = was_in_class;

        Ok(ClassDecl {
            name,
            superclass,
            is_foreign,
            methods,
            line,
        })
    }

    fn method(&mut self) -> CompileResult<MethodDecl> {
        let line = self.line();
        let is_foreign = self.matches(&Token::Foreign);
        let is_static = self.matches(&Token::Static);
        let kind = if self.matches(&Token::Construct) {
            if is_static {
                return Err(self.error("A constructor cannot be static."));
            }
            if is_foreign {
                return Err(self.error("A constructor cannot be foreign."));
            }
            MethodKind::Constructor
        } else if is_static {
            MethodKind::Static
        } else {
            MethodKind::Instance
        };

        let (name, signature, params) = self.method_signature()?;
        if kind == MethodKind::Constructor && !signature.contains('(') {
            return Err(CompileError::new(line, "A constructor cannot be a getter."));
        }

        let body = if is_foreign {
            None
        } else {
            self.expect(&Token::LeftBrace, "Expect '{' to begin method body.")?;
            let outer = self.method.replace(MethodContext { kind, name });
            let body = self.body();
            self.method = outer;
            Some(body?)
        };

        Ok(MethodDecl {
            kind,
            signature,
            params,
            body,
            is_foreign,
            bound: Cell::new(None),
            line,
        })
    }

    /// Returns `(name, signature, parameter names)`.
    fn method_signature(&mut self) -> CompileResult<(String, String, Vec<String>)> {
        let operator = match self.peek() {
            Some(Token::Plus) => Some("+"),
            Some(Token::Minus) => Some("-"),
            Some(Token::Star) => Some("*"),
            Some(Token::Slash) => Some("/"),
            Some(Token::Percent) => Some("%"),
            Some(Token::Less) => Some("<"),
            Some(Token::Greater) => Some(">"),
            Some(Token::LessEqual) => Some("<="),
            Some(Token::GreaterEqual) => Some(">="),
            Some(Token::EqualEqual) => Some("=="),
            Some(Token::BangEqual) => Some("!="),
            Some(Token::Amp) => Some("&"),
            Some(Token::Pipe) => Some("|"),
            Some(Token::Caret) => Some("^"),
            Some(Token::LessLess) => Some("<<"),
            Some(Token::GreaterGreater) => Some(">>"),
            Some(Token::DotDot) => Some(".."),
            Some(Token::DotDotDot) => Some("..."),
            Some(Token::Bang) => Some("!"),
            Some(Token::Tilde) => Some("~"),
            _ => None,
        };

        if let Some(op) = operator {
            self.pos += 1;
            if self.matches(&Token::LeftParen) {
                let params = self.parameter_list(&Token::RightParen)?;
                if params.len() != 1 {
                    return Err(self.error("An infix operator takes exactly one parameter."));
                }
                return Ok((op.to_string(), format!("{op}(_)"), params));
            }
            if !matches!(op, "-" | "!" | "~") {
                return Err(self.error("Expect '(' after infix operator."));
            }
            return Ok((op.to_string(), op.to_string(), Vec::new()));
        }

        if self.matches(&Token::LeftBracket) {
            let mut params = self.parameter_list(&Token::RightBracket)?;
            if params.is_empty() {
                return Err(self.error("A subscript must take at least one parameter."));
            }
            let mut signature = format!("[{}]", vec!["_"; params.len()].join(","));
            if self.matches(&Token::Equal) {
                self.expect(&Token::LeftParen, "Expect '(' after '='.")?;
                let value = self.parameter_list(&Token::RightParen)?;
                if value.len() != 1 {
                    return Err(self.error("A subscript setter takes exactly one value."));
                }
                params.extend(value);
                signature.push_str("=(_)");
            }
            return Ok(("[]".to_string(), signature, params));
        }

        let (name, _) = self.expect_name("Expect method definition.")?;
        if self.matches(&Token::Equal) {
            self.expect(&Token::LeftParen, "Expect '(' after '='.")?;
            let params = self.parameter_list(&Token::RightParen)?;
            if params.len() != 1 {
                return Err(self.error("A setter takes exactly one parameter."));
            }
            let signature = format!("{name}=(_)");
            return Ok((name, signature, params));
        }
        if self.matches(&Token::LeftParen) {
            let params = self.parameter_list(&Token::RightParen)?;
            let signature = call_signature(&name, params.len());
            return Ok((name, signature, params));
        }
        Ok((name.clone(), name, Vec::new()))
    }

    /// Parameter names up to and including `close`.
    fn parameter_list(&mut self, close: &Token) -> CompileResult<Vec<String>> {
        let mut params = Vec::new();
        self.skip_newlines();
        if self.matches(close) {
            return Ok(params);
        }
        loop {
            self.skip_newlines();
            let (name, _) = self.expect_name("Expect parameter name.")?;
            params.push(name);
            self.skip_newlines();
            if !self.matches(&Token::Comma) {
                break;
            }
        }
        self.expect(close, "Expect closing delimiter after parameters.")?;
        Ok(params)
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    pub fn expression(&mut self) -> CompileResult<Expr> {
        let target = self.conditional()?;
        if self.check(&Token::Equal) {
            let line = self.line();
            self.pos += 1;
            self.skip_newlines();
            let value = self.expression()?;
            return assignment(target, value, line);
        }
        Ok(target)
    }

    fn conditional(&mut self) -> CompileResult<Expr> {
        let cond = self.logical_or()?;
        if !self.check(&Token::Question) {
            return Ok(cond);
        }
        let line = self.line();
        self.pos += 1;
        self.skip_newlines();
        let then_value = self.expression()?;
        self.skip_newlines();
        self.expect(&Token::Colon, "Expect ':' after then branch of conditional operator.")?;
        self.skip_newlines();
        let else_value = self.expression()?;
        Ok(Expr {
            kind: ExprKind::Conditional {
                cond: Box::new(cond),
                then_value: Box::new(then_value),
                else_value: Box::new(else_value),
            },
            line,
        })
    }

    fn logical_or(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.logical_and()?;
        while self.check(&Token::PipePipe) {
            let line = self.line();
            self.pos += 1;
            self.skip_newlines();
            let rhs = self.logical_and()?;
            lhs = Expr {
                kind: ExprKind::Or(Box::new(lhs), Box::new(rhs)),
                line,
            };
        }
        Ok(lhs)
    }

    fn logical_and(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.equality()?;
        while self.check(&Token::AmpAmp) {
            let line = self.line();
            self.pos += 1;
            self.skip_newlines();
            let rhs = self.equality()?;
            lhs = Expr {
                kind: ExprKind::And(Box::new(lhs), Box::new(rhs)),
                line,
            };
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> CompileResult<Expr> {
        self.binary(
            &[(Token::EqualEqual, "=="), (Token::BangEqual, "!=")],
            Self::is_test,
        )
    }

    fn is_test(&mut self) -> CompileResult<Expr> {
        let mut lhs = self.comparison()?;
        while self.check(&Token::Is) {
            let line = self.line();
            self.pos += 1;
            self.skip_newlines();
            let rhs = self.comparison()?;
            lhs = Expr {
                kind: ExprKind::Is(Box::new(lhs), Box::new(rhs)),
                line,
            };
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> CompileResult<Expr> {
        self.binary(
            &[
                (Token::Less, "<"),
                (Token::Greater, ">"),
                (Token::LessEqual, "<="),
                (Token::GreaterEqual, ">="),
            ],
            Self::bitwise_or,
        )
    }

    fn bitwise_or(&mut self) -> CompileResult<Expr> {
        self.binary(&[(Token::Pipe, "|")], Self::bitwise_xor)
    }

    fn bitwise_xor(&mut self) -> CompileResult<Expr> {
        self.binary(&[(Token::Caret, "^")], Self::bitwise_and)
    }

    fn bitwise_and(&mut self) -> CompileResult<Expr> {
        self.binary(&[(Token::Amp, "&")], Self::shift)
    }

    fn shift(&mut self) -> CompileResult<Expr> {
        self.binary(
            &[(Token::LessLess, "<<"), (Token::GreaterGreater, ">>")],
            Self::range,
        )
    }

    fn range(&mut self) -> CompileResult<Expr> {
        self.binary(
            &[(Token::DotDot, ".."), (Token::DotDotDot, "...")],
            Self::term,
        )
    }

    fn term(&mut self) -> CompileResult<Expr> {
        self.binary(&[(Token::Plus, "+"), (Token::Minus, "-")], Self::factor)
    }

    fn factor(&mut self) -> CompileResult<Expr> {
        self.binary(
            &[(Token::Star, "*"), (Token::Slash, "/"), (Token::Percent, "%")],
            Self::unary,
        )
    }

    /// Left-associative infix operators, desugared to one-argument method calls.
    fn binary(
        &mut self,
        operators: Operators<'_>,
        next: fn(&mut Self) -> CompileResult<Expr>,
    ) -> CompileResult<Expr> {
        let mut lhs = next(self)?;
        'operators: loop {
            for (token, op) in operators {
                if self.check(token) {
                    let line = self.line();
                    self.pos += 1;
                    self.skip_newlines();
                    let rhs = next(self)?;
                    lhs = Expr {
                        kind: ExprKind::Call {
                            receiver: Some(Box::new(lhs)),
                            signature: format!("{op}(_)"),
                            args: vec![rhs],
                        },
                        line,
                    };
                    continue 'operators;
                }
            }
            return Ok(lhs);
        }
    }

    fn unary(&mut self) -> CompileResult<Expr> {
        let op = match self.peek() {
            Some(Token::Minus) => "-",
            Some(Token::Bang) => "!",
            Some(Token::Tilde) => "~",
            _ => return self.call(),
        };
        let line = self.line();
        self.pos += 1;
        let operand = self.unary()?;
        Ok(Expr {
            kind: ExprKind::Call {
                receiver: Some(Box::new(operand)),
                signature: op.to_string(),
                args: Vec::new(),
            },
            line,
        })
    }

    fn call(&mut self) -> CompileResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.check(&Token::Newline) && self.peek_past_newlines() == Some(&Token::Dot) {
                self.skip_newlines();
            }
            if self.matches(&Token::Dot) {
                self.skip_newlines();
                let (name, line) = self.expect_name("Expect method name after '.'.")?;
                let (signature, args) = self.call_arguments(&name)?;
                expr = Expr {
                    kind: ExprKind::Call {
                        receiver: Some(Box::new(expr)),
                        signature,
                        args,
                    },
                    line,
                };
            } else if self.check(&Token::LeftBracket) {
                let line = self.line();
                self.pos += 1;
                let args = self.argument_list(&Token::RightBracket)?;
                if args.is_empty() {
                    return Err(self.error("Expect subscript arguments."));
                }
                expr = Expr {
                    kind: ExprKind::Call {
                        receiver: Some(Box::new(expr)),
                        signature: format!("[{}]", vec!["_"; args.len()].join(",")),
                        args,
                    },
                    line,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    /// Parses optional `(args)` and an optional block argument after a method name.
    fn call_arguments(&mut self, name: &str) -> CompileResult<(String, Vec<Expr>)> {
        let mut has_parens = false;
        let mut args = Vec::new();
        if self.matches(&Token::LeftParen) {
            has_parens = true;
            args = self.argument_list(&Token::RightParen)?;
        }
        if self.check(&Token::LeftBrace) {
            let line = self.line();
            self.pos += 1;
            has_parens = true;
            let decl = self.block_argument(line)?;
            args.push(Expr {
                kind: ExprKind::Fn(Rc::new(decl)),
                line,
            });
        }
        let signature = if has_parens {
            call_signature(name, args.len())
        } else {
            name.to_string()
        };
        Ok((signature, args))
    }

    fn block_argument(&mut self, line: u32) -> CompileResult<FnDecl> {
        let mut params = Vec::new();
        if self.matches(&Token::Pipe) {
            loop {
                let (name, _) = self.expect_name("Expect parameter name.")?;
                params.push(name);
                if !self.matches(&Token::Comma) {
                    break;
                }
            }
            self.expect(&Token::Pipe, "Expect '|' after function parameters.")?;
        }
        let body = self.body()?;
        Ok(FnDecl { params, body, line })
    }

    /// Comma-separated expressions up to and including `close`.
    fn argument_list(&mut self, close: &Token) -> CompileResult<Vec<Expr>> {
        let mut args = Vec::new();
        self.skip_newlines();
        if self.matches(close) {
            return Ok(args);
        }
        loop {
            self.skip_newlines();
            args.push(self.expression()?);
            self.skip_newlines();
            if !self.matches(&Token::Comma) {
                break;
            }
        }
        self.expect(close, "Expect closing delimiter after arguments.")?;
        Ok(args)
    }

    fn primary(&mut self) -> CompileResult<Expr> {
        let line = self.line();
        let Some(spanned) = self.advance() else {
            return Err(self.error("Expect expression."));
        };
        let kind = match spanned.token {
            Token::Number(n) => ExprKind::Num(n),
            Token::Str(bytes) => ExprKind::Str(bytes.into()),
            Token::True => ExprKind::Bool(true),
            Token::False => ExprKind::Bool(false),
            Token::Null => ExprKind::Null,
            Token::This => {
                if self.method.is_none() {
                    return Err(CompileError::new(line, "Cannot use 'this' outside of a method."));
                }
                ExprKind::This
            }
            Token::Field(name) => {
                if !self.in_class {
                    return Err(CompileError::new(
                        line,
                        "Cannot reference a field outside of a class definition.",
                    ));
                }
                if name.starts_with("__") {
                    ExprKind::StaticField(name)
                } else {
                    ExprKind::Field(name)
                }
            }
            Token::Name(name) => {
                if self.check(&Token::LeftParen) {
                    let (signature, args) = self.call_arguments(&name)?;
                    ExprKind::Call {
                        receiver: None,
                        signature,
                        args,
                    }
                } else {
                    ExprKind::Name(name)
                }
            }
            Token::LeftParen => {
                self.skip_newlines();
                let expr = self.expression()?;
                self.skip_newlines();
                self.expect(&Token::RightParen, "Expect ')' after expression.")?;
                return Ok(expr);
            }
            Token::LeftBracket => ExprKind::List(self.list_elements()?),
            Token::LeftBrace => ExprKind::Map(self.map_entries()?),
            Token::Super => return self.super_call(line),
            _ => return Err(CompileError::new(line, "Expect expression.")),
        };
        Ok(Expr { kind, line })
    }

    fn list_elements(&mut self) -> CompileResult<Vec<Expr>> {
        let mut elements = Vec::new();
        loop {
            self.skip_newlines();
            if self.matches(&Token::RightBracket) {
                return Ok(elements);
            }
            elements.push(self.expression()?);
            self.skip_newlines();
            if !self.matches(&Token::Comma) {
                self.skip_newlines();
                self.expect(&Token::RightBracket, "Expect ']' after list elements.")?;
                return Ok(elements);
            }
        }
    }

    fn map_entries(&mut self) -> CompileResult<Vec<(Expr, Expr)>> {
        let mut entries = Vec::new();
        loop {
            self.skip_newlines();
            if self.matches(&Token::RightBrace) {
                return Ok(entries);
            }
            let key = self.conditional()?;
            self.skip_newlines();
            self.expect(&Token::Colon, "Expect ':' after map key.")?;
            self.skip_newlines();
            let value = self.expression()?;
            entries.push((key, value));
            self.skip_newlines();
            if !self.matches(&Token::Comma) {
                self.skip_newlines();
                self.expect(&Token::RightBrace, "Expect '}' after map entries.")?;
                return Ok(entries);
            }
        }
    }

    fn super_call(&mut self, line: u32) -> CompileResult<Expr> {
        let Some(method) = self.method.clone() else {
            return Err(CompileError::new(line, "Cannot use 'super' outside of a method."));
        };
        let (signature, args) = if self.matches(&Token::Dot) {
            let (name, _) = self.expect_name("Expect method name after 'super.'.")?;
            self.call_arguments(&name)?
        } else {
            let (signature, args) = self.call_arguments(&method.name)?;
            if method.kind == MethodKind::Constructor {
                (format!("init {signature}"), args)
            } else {
                (signature, args)
            }
        };
        Ok(Expr {
            kind: ExprKind::SuperCall { signature, args },
            line,
        })
    }
}

/// Turns `target = value` into a variable store or a setter call.
fn assignment(target: Expr, value: Expr, line: u32) -> CompileResult<Expr> {
    let kind = match target.kind {
        ExprKind::Name(_) | ExprKind::Field(_) | ExprKind::StaticField(_) => ExprKind::Assign {
            target: Box::new(target),
            value: Box::new(value),
        },
        ExprKind::Call {
            receiver: Some(receiver),
            signature,
            mut args,
        } => {
            if signature.starts_with('[') && signature.ends_with(']') {
                args.push(value);
                ExprKind::Call {
                    receiver: Some(receiver),
                    signature: format!("{signature}=(_)"),
                    args,
                }
            } else if is_getter(&signature) {
                ExprKind::Call {
                    receiver: Some(receiver),
                    signature: format!("{signature}=(_)"),
                    args: vec![value],
                }
            } else {
                return Err(CompileError::new(line, "Invalid assignment target."));
            }
        }
        _ => return Err(CompileError::new(line, "Invalid assignment target.")),
    };
    Ok(Expr { kind, line })
}

fn is_getter(signature: &str) -> bool {
    signature
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && signature.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_expr(source: &str) -> Expr {
        let mut block = parse(source).unwrap();
        match block.remove(0).kind {
            StmtKind::Expr(expr) => expr,
            other => panic!("expected expression statement, got {:?}", other),
        }
    }

    fn signature_of(expr: &Expr) -> &str {
        match &expr.kind {
            ExprKind::Call { signature, .. } => signature,
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_method_call_signatures() {
        assert_eq!(signature_of(&first_expr("a.b(1, 2)")), "b(_,_)");
        assert_eq!(signature_of(&first_expr("a.count")), "count");
        assert_eq!(signature_of(&first_expr("a.clear()")), "clear()");
        assert_eq!(signature_of(&first_expr("a[1]")), "[_]");
        assert_eq!(signature_of(&first_expr("-a")), "-");
    }

    #[test]
    fn test_setters_and_subscript_setters() {
        assert_eq!(signature_of(&first_expr("a.b = 1")), "b=(_)");
        assert_eq!(signature_of(&first_expr("a[1] = 2")), "[_]=(_)");
    }

    #[test]
    fn test_block_argument() {
        let expr = first_expr("Fn.new { |a, b| a + b }");
        match &expr.kind {
            ExprKind::Call {
                signature, args, ..
            } => {
                assert_eq!(signature, "new(_)");
                match &args[0].kind {
                    ExprKind::Fn(decl) => {
                        assert_eq!(decl.params, vec!["a", "b"]);
                        assert!(decl.body.is_expression);
                    }
                    other => panic!("expected block argument, got {:?}", other),
                }
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        let expr = first_expr("1 + 2 * 3");
        match &expr.kind {
            ExprKind::Call {
                signature, args, ..
            } => {
                assert_eq!(signature, "+(_)");
                assert_eq!(signature_of(&args[0]), "*(_)");
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_foreign_class() {
        let source = "foreign class Counter {\n  construct new() {}\n  foreign increment(by)\n  \
                      foreign static total\n}";
        let block = parse(source).unwrap();
        let StmtKind::Class(decl) = &block[0].kind else {
            panic!("expected class");
        };
        assert!(decl.is_foreign);
        assert_eq!(decl.methods.len(), 3);
        assert_eq!(decl.methods[0].kind, MethodKind::Constructor);
        assert_eq!(decl.methods[1].signature, "increment(_)");
        assert!(decl.methods[1].is_foreign);
        assert_eq!(decl.methods[2].kind, MethodKind::Static);
        assert_eq!(decl.methods[2].signature, "total");
    }

    #[test]
    fn test_operator_and_setter_methods() {
        let block = parse(
            "class V {\n  +(o) { o }\n  - { this }\n  [i]=(v) { v }\n  x=(v) { _x = v }\n}",
        )
        .unwrap();
        let StmtKind::Class(decl) = &block[0].kind else {
            panic!("expected class");
        };
        let signatures: Vec<_> = decl.methods.iter().map(|m| m.signature.as_str()).collect();
        assert_eq!(signatures, vec!["+(_)", "-", "[_]=(_)", "x=(_)"]);
    }

    #[test]
    fn test_multiline_literals() {
        let block = parse("var m = {\n  \"a\": 1,\n  2: [1,\n 2,],\n}\n").unwrap();
        let StmtKind::Var {
            init: Some(expr), ..
        } = &block[0].kind
        else {
            panic!("expected var");
        };
        assert!(matches!(&expr.kind, ExprKind::Map(entries) if entries.len() == 2));
    }

    #[test]
    fn test_else_on_next_line() {
        let block = parse("if (a) {\n  b\n}\nelse c").unwrap();
        assert_eq!(block.len(), 1);
        assert!(matches!(
            &block[0].kind,
            StmtKind::If {
                else_branch: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn test_errors_carry_lines() {
        let err = parse("var a = 1\nvar b = )").unwrap_err();
        assert_eq!(err.line, 2);
        let err = parse("_x = 1").unwrap_err();
        assert!(err.message.contains("field"));
    }
}
