//! Expression lexer — tokenizes a map expression.

use crate::{Error, Result};

/// A token from the lexer.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub text: String,
}

/// Source span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Number,
    /// `y`, `x`, `x$3`, or a function name.
    Identifier,

    LParen, RParen, Comma, Eq,
    Plus, Minus, Star, Slash, Percent, Caret,

    Eof,
}

/// Tokenize an expression string.
pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => { chars.next(); }

            c if c.is_ascii_digit() || (c == '.' && matches!(chars.clone().nth(1), Some((_, d)) if d.is_ascii_digit())) => {
                let mut num = String::new();
                let mut seen_dot = false;
                let mut seen_exp = false;
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() {
                        num.push(c);
                    } else if c == '.' && !seen_dot && !seen_exp {
                        seen_dot = true;
                        num.push(c);
                    } else if (c == 'e' || c == 'E') && !seen_exp {
                        seen_exp = true;
                        num.push(c);
                        chars.next();
                        if let Some(&(_, sign)) = chars.peek() {
                            if sign == '+' || sign == '-' {
                                num.push(sign);
                                chars.next();
                            }
                        }
                        continue;
                    } else {
                        break;
                    }
                    chars.next();
                }
                tokens.push(Token {
                    kind: TokenKind::Number,
                    span: Span { start: pos, end: pos + num.len() },
                    text: num,
                });
            }

            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '$' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Identifier,
                    span: Span { start: pos, end: pos + ident.len() },
                    text: ident,
                });
            }

            '(' => { chars.next(); tokens.push(punct(TokenKind::LParen, pos, "(")); }
            ')' => { chars.next(); tokens.push(punct(TokenKind::RParen, pos, ")")); }
            ',' => { chars.next(); tokens.push(punct(TokenKind::Comma, pos, ",")); }
            '=' => { chars.next(); tokens.push(punct(TokenKind::Eq, pos, "=")); }
            '+' => { chars.next(); tokens.push(punct(TokenKind::Plus, pos, "+")); }
            '-' => { chars.next(); tokens.push(punct(TokenKind::Minus, pos, "-")); }
            '*' => { chars.next(); tokens.push(punct(TokenKind::Star, pos, "*")); }
            '/' => { chars.next(); tokens.push(punct(TokenKind::Slash, pos, "/")); }
            '%' => { chars.next(); tokens.push(punct(TokenKind::Percent, pos, "%")); }
            '^' => { chars.next(); tokens.push(punct(TokenKind::Caret, pos, "^")); }

            other => {
                return Err(Error::Expression {
                    position: pos,
                    message: format!("Unexpected character: '{other}'"),
                });
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        span: Span { start: input.len(), end: input.len() },
        text: String::new(),
    });

    Ok(tokens)
}

fn punct(kind: TokenKind, pos: usize, text: &str) -> Token {
    Token {
        kind,
        span: Span { start: pos, end: pos + text.len() },
        text: text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment() {
        let tokens = tokenize("y=x$0*1000").unwrap();
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![
            TokenKind::Identifier, // y
            TokenKind::Eq,
            TokenKind::Identifier, // x$0
            TokenKind::Star,
            TokenKind::Number,
            TokenKind::Eof,
        ]);
        assert_eq!(tokens[2].text, "x$0");
    }

    #[test]
    fn test_numbers() {
        let tokens = tokenize("1.5 .25 2e3 4E-2").unwrap();
        let texts: Vec<_> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["1.5", ".25", "2e3", "4E-2", ""]);
    }

    #[test]
    fn test_unexpected_character() {
        let err = tokenize("y = x # 2").unwrap_err();
        assert!(matches!(err, Error::Expression { position: 6, .. }));
    }

    #[test]
    fn test_spans() {
        let tokens = tokenize("y = sin(x)").unwrap();
        assert_eq!(tokens[2].span, Span { start: 4, end: 7 });
    }
}
