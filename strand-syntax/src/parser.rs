//! Recursive-descent parser for strand.
//!
//! The precedence cascade (loosest to tightest) is: assignment, ternary,
//! `||`, `&&`, `|>`, equality, comparison, `+ -`, `* / %`, unary, postfix.

use crate::ast::*;
use crate::error::ParseError;
use crate::lexer::{tokenize, Token};

/// Parse a whole source file.
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut statements = Vec::new();
    while !parser.at_end() {
        statements.push(parser.statement()?);
    }
    Ok(Program { statements })
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_at(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|(t, _)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        match self.tokens.get(self.pos) {
            Some((tok, offset)) => ParseError::UnexpectedToken {
                found: format!("{:?}", tok),
                expected: expected.to_string(),
                offset: *offset,
            },
            None => ParseError::UnexpectedEof {
                expected: expected.to_string(),
            },
        }
    }

    fn expect(&mut self, token: &Token, expected: &str) -> Result<(), ParseError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_ident(&mut self, expected: &str) -> Result<String, ParseError> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    // ----- statements -----

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        match self.peek() {
            Some(Token::Ident(_)) if self.peek_at(1) == Some(&Token::Declare) => {
                let name = self.expect_ident("identifier")?;
                self.pos += 1; // :=
                let value = self.expression()?;
                Ok(Stmt::Let { name, value })
            }
            Some(Token::LBrace) => self.block(),
            Some(Token::If) => self.if_statement(),
            Some(Token::While) => {
                self.pos += 1;
                let cond = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::While {
                    cond,
                    body: Box::new(body),
                })
            }
            Some(Token::For) => self.for_statement(),
            Some(Token::Match) => self.match_statement(),
            Some(Token::Return) => {
                self.pos += 1;
                let expr = self.expression()?;
                Ok(Stmt::Return(expr))
            }
            Some(Token::Break) => {
                self.pos += 1;
                Ok(Stmt::Break)
            }
            Some(Token::Continue) => {
                self.pos += 1;
                Ok(Stmt::Continue)
            }
            Some(_) => Ok(Stmt::Expr(self.expression()?)),
            None => Err(self.unexpected("statement")),
        }
    }

    fn block(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&Token::LBrace, "`{`")?;
        let mut statements = Vec::new();
        while !self.eat(&Token::RBrace) {
            if self.at_end() {
                return Err(self.unexpected("`}`"));
            }
            statements.push(self.statement()?);
        }
        Ok(Stmt::Block(statements))
    }

    fn if_statement(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&Token::If, "`if`")?;
        let cond = self.expression()?;
        let body = self.block()?;
        let alt = if self.eat(&Token::Else) {
            let alt = if self.peek() == Some(&Token::If) {
                self.if_statement()?
            } else {
                self.block()?
            };
            Some(Box::new(alt))
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            body: Box::new(body),
            alt,
        })
    }

    fn for_statement(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&Token::For, "`for`")?;

        if matches!(self.peek(), Some(Token::Ident(_))) && self.peek_at(1) == Some(&Token::In) {
            let name = self.expect_ident("identifier")?;
            self.pos += 1; // in
            let start = self.expression()?;
            self.expect(&Token::DotDot, "`..`")?;
            let end = self.expression()?;
            let body = self.block()?;
            return Ok(Stmt::ForRange {
                name,
                start,
                end,
                body: Box::new(body),
            });
        }

        let init = self.statement()?;
        self.expect(&Token::Semicolon, "`;`")?;
        let cond = self.expression()?;
        self.expect(&Token::Semicolon, "`;`")?;
        let incr = self.expression()?;
        let body = self.block()?;
        Ok(Stmt::For {
            init: Box::new(init),
            cond,
            incr,
            body: Box::new(body),
        })
    }

    fn match_statement(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&Token::Match, "`match`")?;
        let expr = self.expression()?;
        self.expect(&Token::LBrace, "`{`")?;

        let mut cases = Vec::new();
        let mut default = None;
        loop {
            if self.eat(&Token::RBrace) {
                break;
            }
            if self.eat(&Token::Else) {
                self.expect(&Token::FatArrow, "`=>`")?;
                default = Some(Box::new(self.statement()?));
            } else {
                let pattern = self.pattern()?;
                let guard = if self.eat(&Token::If) {
                    Some(self.expression()?)
                } else {
                    None
                };
                self.expect(&Token::FatArrow, "`=>`")?;
                let body = self.statement()?;
                cases.push(MatchCase {
                    pattern,
                    guard,
                    body,
                });
            }
            if !self.eat(&Token::Comma) {
                self.expect(&Token::RBrace, "`}` or `,`")?;
                break;
            }
        }

        Ok(Stmt::Match {
            expr,
            cases,
            default,
        })
    }

    fn pattern(&mut self) -> Result<Pattern, ParseError> {
        match self.advance() {
            Some(Token::Int(v)) => Ok(Pattern::Int(v)),
            Some(Token::Float(v)) => Ok(Pattern::Float(v)),
            Some(Token::Str(v)) => Ok(Pattern::Str(v)),
            Some(Token::True) => Ok(Pattern::Bool(true)),
            Some(Token::False) => Ok(Pattern::Bool(false)),
            Some(Token::Nil) => Ok(Pattern::Nil),
            Some(Token::Ident(name)) => Ok(Pattern::Ident(name)),
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                while !self.eat(&Token::RBracket) {
                    if !items.is_empty() {
                        self.expect(&Token::Comma, "`,`")?;
                    }
                    items.push(self.pattern()?);
                }
                Ok(Pattern::Array(items))
            }
            Some(Token::LBrace) => {
                let mut fields = Vec::new();
                while !self.eat(&Token::RBrace) {
                    if !fields.is_empty() {
                        self.expect(&Token::Comma, "`,`")?;
                    }
                    let key = self.expect_ident("field name")?;
                    self.expect(&Token::Colon, "`:`")?;
                    fields.push((key, self.pattern()?));
                }
                Ok(Pattern::Object(fields))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("pattern"))
            }
        }
    }

    // ----- expressions -----

    fn expression(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Try) {
            return Ok(Expr::Try(Box::new(self.expression()?)));
        }
        if self.eat(&Token::Raise) {
            return Ok(Expr::Raise(Box::new(self.expression()?)));
        }
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr, ParseError> {
        let target = self.ternary()?;
        if self.eat(&Token::Assign) {
            let value = self.assignment()?;
            return Ok(Expr::Assign {
                target: Box::new(target),
                value: Box::new(value),
            });
        }
        Ok(target)
    }

    fn ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.binary(0)?;
        if self.eat(&Token::Question) {
            let then = self.expression()?;
            self.expect(&Token::Colon, "`:`")?;
            let alt = self.expression()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                alt: Box::new(alt),
            });
        }
        Ok(cond)
    }

    /// Binary levels in cascade order; each folds left-associatively.
    const LEVELS: &'static [&'static [(Token, BinaryOp)]] = &[
        &[(Token::OrOr, BinaryOp::Or)],
        &[(Token::AndAnd, BinaryOp::And)],
        &[(Token::PipeArrow, BinaryOp::Pipe)],
        &[(Token::EqEq, BinaryOp::Eq), (Token::NotEq, BinaryOp::Ne)],
        &[
            (Token::Lt, BinaryOp::Lt),
            (Token::Le, BinaryOp::Le),
            (Token::Gt, BinaryOp::Gt),
            (Token::Ge, BinaryOp::Ge),
        ],
        &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
        &[
            (Token::Star, BinaryOp::Mul),
            (Token::Slash, BinaryOp::Div),
            (Token::Percent, BinaryOp::Mod),
        ],
    ];

    fn binary(&mut self, level: usize) -> Result<Expr, ParseError> {
        if level == Self::LEVELS.len() {
            return self.unary();
        }

        let mut left = self.binary(level + 1)?;
        loop {
            let Some(op) = Self::LEVELS[level]
                .iter()
                .find(|(tok, _)| self.peek() == Some(tok))
                .map(|(_, op)| *op)
            else {
                break;
            };
            self.pos += 1;
            let right = self.binary(level + 1)?;
            left = Expr::Binary {
                op,
                operands: vec![left, right],
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(self.unary()?),
            });
        }
        if self.eat(&Token::Minus) {
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(self.unary()?),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let atom = self.atom()?;
        let mut ops = Vec::new();
        loop {
            match self.peek() {
                Some(Token::LParen) => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    while !self.eat(&Token::RParen) {
                        if !args.is_empty() {
                            self.expect(&Token::Comma, "`,`")?;
                        }
                        args.push(self.expression()?);
                    }
                    ops.push(PostfixOp::Call(args));
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.expression()?;
                    self.expect(&Token::RBracket, "`]`")?;
                    ops.push(PostfixOp::Index(index));
                }
                Some(Token::Dot) => {
                    self.pos += 1;
                    let name = self.expect_ident("field name")?;
                    ops.push(PostfixOp::Field(name));
                }
                _ => break,
            }
        }

        if ops.is_empty() {
            Ok(atom)
        } else {
            Ok(Expr::Postfix {
                expr: Box::new(atom),
                ops,
            })
        }
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Int(v)) => {
                let v = *v;
                self.pos += 1;
                Ok(Expr::Int(v))
            }
            Some(Token::Float(v)) => {
                let v = *v;
                self.pos += 1;
                Ok(Expr::Float(v))
            }
            Some(Token::Str(_)) => {
                let Some(Token::Str(s)) = self.advance() else {
                    unreachable!()
                };
                Ok(Expr::Str(s))
            }
            Some(Token::True) => {
                self.pos += 1;
                Ok(Expr::Bool(true))
            }
            Some(Token::False) => {
                self.pos += 1;
                Ok(Expr::Bool(false))
            }
            Some(Token::Nil) => {
                self.pos += 1;
                Ok(Expr::Nil)
            }
            Some(Token::Ident(_)) => Ok(Expr::Ident(self.expect_ident("identifier")?)),
            Some(Token::LParen) => {
                self.pos += 1;
                let expr = self.expression()?;
                self.expect(&Token::RParen, "`)`")?;
                Ok(expr)
            }
            Some(Token::LBracket) => {
                self.pos += 1;
                let mut items = Vec::new();
                while !self.eat(&Token::RBracket) {
                    if !items.is_empty() {
                        self.expect(&Token::Comma, "`,`")?;
                    }
                    items.push(self.expression()?);
                }
                Ok(Expr::Array(items))
            }
            Some(Token::LBrace) => {
                self.pos += 1;
                let mut fields = Vec::new();
                while !self.eat(&Token::RBrace) {
                    if !fields.is_empty() {
                        self.expect(&Token::Comma, "`,`")?;
                    }
                    let key = match self.advance() {
                        Some(Token::Ident(name)) => name,
                        Some(Token::Str(s)) => s,
                        _ => {
                            self.pos = self.pos.saturating_sub(1);
                            return Err(self.unexpected("object key"));
                        }
                    };
                    self.expect(&Token::Colon, "`:`")?;
                    fields.push((key, self.expression()?));
                }
                Ok(Expr::Object(fields))
            }
            Some(Token::Pipe) => self.function_literal(false),
            // `||` where an atom is expected is an empty parameter list.
            Some(Token::OrOr) => self.function_literal(true),
            _ => Err(self.unexpected("expression")),
        }
    }

    fn function_literal(&mut self, empty_params: bool) -> Result<Expr, ParseError> {
        let mut params = Vec::new();
        if empty_params {
            self.pos += 1; // ||
        } else {
            self.pos += 1; // |
            while !self.eat(&Token::Pipe) {
                if !params.is_empty() {
                    self.expect(&Token::Comma, "`,`")?;
                }
                params.push(self.expect_ident("parameter name")?);
            }
        }

        let body = if self.peek() == Some(&Token::LBrace) {
            let Stmt::Block(statements) = self.block()? else {
                unreachable!()
            };
            FunctionBody::Block(statements)
        } else {
            FunctionBody::Expr(Box::new(self.expression()?))
        };

        Ok(Expr::Function { params, body })
    }
}
