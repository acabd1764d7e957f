//! Expression recursive descent parser.
//!
//! Grammar:
//!
//! ```text
//! assignment := "y" "=" expr EOF
//! expr       := term (("+" | "-") term)*
//! term       := power (("*" | "/" | "%") power)*
//! power      := unary ("^" power)?
//! unary      := "-" unary | primary
//! primary    := NUMBER | source | func "(" expr ("," expr)* ")" | "(" expr ")"
//! source     := "x" | "x$" DIGITS
//! ```

use crate::{Error, Result};
use super::ast::*;
use super::lexer::{Token, TokenKind};

/// Parser state: a token slice and a cursor.
struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn advance(&mut self) -> &Token {
        let tok = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind) -> Result<&Token> {
        let tok = self.peek();
        if tok.kind == kind {
            Ok(self.advance())
        } else {
            Err(self.error(format!("Expected {:?}, got {:?} '{}'", kind, tok.kind, tok.text)))
        }
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, msg: String) -> Error {
        Error::Expression {
            position: self.peek().span.start,
            message: msg,
        }
    }
}

/// Parse `y = <expr>` and return the right-hand side.
pub fn parse_assignment(tokens: &[Token]) -> Result<Expr> {
    if tokens.is_empty() {
        return Err(Error::Expression { position: 0, message: "Empty expression".into() });
    }
    let mut p = Parser::new(tokens);
    let target = p.expect(TokenKind::Identifier)?;
    if target.text != "y" {
        return Err(Error::Expression {
            position: target.span.start,
            message: format!("Assignment target must be 'y', got '{}'", target.text),
        });
    }
    p.expect(TokenKind::Eq)?;
    let expr = parse_expr(&mut p)?;
    if !p.at(TokenKind::Eof) {
        return Err(p.error(format!("Unexpected trailing '{}'", p.peek().text)));
    }
    Ok(expr)
}

fn parse_expr(p: &mut Parser) -> Result<Expr> {
    let mut left = parse_term(p)?;
    loop {
        let op = match p.peek_kind() {
            TokenKind::Plus => BinaryOp::Add,
            TokenKind::Minus => BinaryOp::Sub,
            _ => break,
        };
        p.advance();
        let right = parse_term(p)?;
        left = Expr::Binary { left: Box::new(left), op, right: Box::new(right) };
    }
    Ok(left)
}

fn parse_term(p: &mut Parser) -> Result<Expr> {
    let mut left = parse_power(p)?;
    loop {
        let op = match p.peek_kind() {
            TokenKind::Star => BinaryOp::Mul,
            TokenKind::Slash => BinaryOp::Div,
            TokenKind::Percent => BinaryOp::Mod,
            _ => break,
        };
        p.advance();
        let right = parse_power(p)?;
        left = Expr::Binary { left: Box::new(left), op, right: Box::new(right) };
    }
    Ok(left)
}

fn parse_power(p: &mut Parser) -> Result<Expr> {
    let left = parse_unary(p)?;
    if p.eat(TokenKind::Caret) {
        let right = parse_power(p)?; // right-associative
        Ok(Expr::Binary { left: Box::new(left), op: BinaryOp::Pow, right: Box::new(right) })
    } else {
        Ok(left)
    }
}

fn parse_unary(p: &mut Parser) -> Result<Expr> {
    if p.eat(TokenKind::Minus) {
        let expr = parse_unary(p)?;
        Ok(Expr::Unary { op: UnaryOp::Negate, expr: Box::new(expr) })
    } else {
        parse_primary(p)
    }
}

fn parse_primary(p: &mut Parser) -> Result<Expr> {
    match p.peek_kind() {
        TokenKind::Number => {
            let tok = p.advance();
            let val = tok.text.parse::<f64>().map_err(|_| {
                Error::Expression { position: tok.span.start, message: format!("Invalid number '{}'", tok.text) }
            })?;
            Ok(Expr::Literal(val))
        }
        TokenKind::LParen => {
            p.advance();
            let expr = parse_expr(p)?;
            p.expect(TokenKind::RParen)?;
            Ok(expr)
        }
        TokenKind::Identifier => {
            let tok = p.advance().clone();
            if let Some(slot) = parse_source(&tok)? {
                return Ok(Expr::Source(slot));
            }
            let func = Func::from_name(&tok.text).ok_or_else(|| Error::Expression {
                position: tok.span.start,
                message: format!("Unknown identifier '{}'", tok.text),
            })?;
            p.expect(TokenKind::LParen)?;
            let mut args = vec![parse_expr(p)?];
            while p.eat(TokenKind::Comma) {
                args.push(parse_expr(p)?);
            }
            p.expect(TokenKind::RParen)?;
            if args.len() != func.arity() {
                return Err(Error::Expression {
                    position: tok.span.start,
                    message: format!("'{}' takes {} argument(s), got {}", tok.text, func.arity(), args.len()),
                });
            }
            Ok(Expr::Call { func, args })
        }
        _ => Err(p.error(format!("Unexpected token: {:?} '{}'", p.peek_kind(), p.peek().text))),
    }
}

/// `x` or `x$<n>`; anything else is not a source reference.
fn parse_source(tok: &Token) -> Result<Option<usize>> {
    if tok.text == "x" {
        return Ok(Some(0));
    }
    let Some(digits) = tok.text.strip_prefix("x$") else { return Ok(None) };
    digits.parse::<usize>().map(Some).map_err(|_| Error::Expression {
        position: tok.span.start,
        message: format!("Invalid source reference '{}'", tok.text),
    })
}
