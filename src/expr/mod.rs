//! # Map Expressions
//!
//! `y = <expr>` over source slots `x$0..x$9`, compiled once and evaluated
//! element-wise for every routed value.
//! Pure functions with no I/O, state or graph dependency.

pub mod ast;
pub mod eval;
pub mod lexer;
pub mod parser;

use crate::{Error, Result};
use ast::Expr;

/// Most signals a single expression may reference.
pub const MAX_SIGNALS: usize = 10;

/// Role of a `%x` / `%y` placeholder in a user-facing expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// The n-th distinct `%x`.
    Source(usize),
    Destination,
}

/// Rewrite `%x` / `%y` placeholders into internal names (`x$<n>`, `y`).
///
/// Returns the rewritten text and the placeholder roles in order of
/// appearance; the i-th role binds the i-th signal handed to the map.
pub fn substitute(text: &str) -> (String, Vec<Slot>) {
    let mut out = String::with_capacity(text.len() + 8);
    let mut slots = Vec::new();
    let mut sources = 0;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('%', Some('x')) => {
                chars.next();
                out.push_str(&format!("x${sources}"));
                slots.push(Slot::Source(sources));
                sources += 1;
            }
            ('%', Some('y')) => {
                chars.next();
                out.push('y');
                slots.push(Slot::Destination);
            }
            _ => out.push(c),
        }
    }
    (out, slots)
}

/// A compiled expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    text: String,
    expr: Expr,
    num_sources: usize,
}

impl Program {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn num_sources(&self) -> usize {
        self.num_sources
    }

    /// Evaluate against one f64 vector per source slot.
    pub fn eval(&self, inputs: &[&[f64]]) -> Result<Vec<f64>> {
        if inputs.len() < self.num_sources {
            return Err(Error::Expression {
                position: 0,
                message: format!("expected {} inputs, got {}", self.num_sources, inputs.len()),
            });
        }
        eval::eval(&self.expr, inputs)
    }
}

/// Compile `y = <expr>` for a map with `num_sources` sources. Referencing a
/// slot at or beyond `num_sources` is an error.
pub fn compile(text: &str, num_sources: usize) -> Result<Program> {
    let tokens = lexer::tokenize(text)?;
    let expr = parser::parse_assignment(&tokens)?;
    if let Some(max) = expr.max_source() {
        if max >= num_sources {
            return Err(Error::Expression {
                position: text.find(&format!("x${max}")).unwrap_or(0),
                message: format!("x${max} refers to an undeclared source (map has {num_sources})"),
            });
        }
    }
    Ok(Program { text: text.to_owned(), expr, num_sources })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_substitute_placeholders() {
        let (text, slots) = substitute("%y=%x*1000");
        assert_eq!(text, "y=x$0*1000");
        assert_eq!(slots, vec![Slot::Destination, Slot::Source(0)]);

        let (text, slots) = substitute("%y = %x + %x % 3");
        assert_eq!(text, "y = x$0 + x$1 % 3");
        assert_eq!(slots.len(), 3);
    }

    #[test]
    fn test_compile_and_eval() {
        let prog = compile("y=x$0*1000", 1).unwrap();
        let out = prog.eval(&[&[0.1]]).unwrap();
        assert!((out[0] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_undeclared_slot() {
        let err = compile("y = x$0 + x$2", 2).unwrap_err();
        assert!(matches!(err, Error::Expression { position: 10, .. }));
    }

    #[test]
    fn test_alias_x_is_slot_zero() {
        let prog = compile("y = -x", 1).unwrap();
        assert_eq!(prog.eval(&[&[2.0, -3.0]]).unwrap(), vec![-2.0, 3.0]);
    }
}
