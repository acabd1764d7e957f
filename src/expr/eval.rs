//! Element-wise evaluation over f64 vectors. Scalars broadcast.

use super::ast::{BinaryOp, Expr, Func, UnaryOp};
use crate::{Error, Result};

pub fn eval(expr: &Expr, inputs: &[&[f64]]) -> Result<Vec<f64>> {
    match expr {
        Expr::Literal(v) => Ok(vec![*v]),
        Expr::Source(n) => inputs
            .get(*n)
            .map(|s| s.to_vec())
            .ok_or_else(|| Error::Expression { position: 0, message: format!("missing input for x${n}") }),
        Expr::Unary { op: UnaryOp::Negate, expr } => Ok(eval(expr, inputs)?.into_iter().map(|v| -v).collect()),
        Expr::Binary { left, op, right } => {
            let l = eval(left, inputs)?;
            let r = eval(right, inputs)?;
            zip(&l, &r, |a, b| binary(*op, a, b))
        }
        Expr::Call { func, args } => {
            let vals: Vec<Vec<f64>> = args.iter().map(|a| eval(a, inputs)).collect::<Result<_>>()?;
            match vals.as_slice() {
                [a] => Ok(a.iter().map(|v| unary_func(*func, *v)).collect()),
                [a, b] => zip(a, b, |x, y| binary_func(*func, x, y)),
                _ => Err(Error::Expression { position: 0, message: format!("bad arity for {func:?}") }),
            }
        }
    }
}

fn zip(l: &[f64], r: &[f64], f: impl Fn(f64, f64) -> f64) -> Result<Vec<f64>> {
    match (l.len(), r.len()) {
        (1, _) => Ok(r.iter().map(|b| f(l[0], *b)).collect()),
        (_, 1) => Ok(l.iter().map(|a| f(*a, r[0])).collect()),
        (a, b) if a == b => Ok(l.iter().zip(r).map(|(a, b)| f(*a, *b)).collect()),
        (a, b) => Err(Error::Expression {
            position: 0,
            message: format!("vector length mismatch: {a} vs {b}"),
        }),
    }
}

fn binary(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Mod => a % b,
        BinaryOp::Pow => a.powf(b),
    }
}

fn unary_func(func: Func, v: f64) -> f64 {
    match func {
        Func::Abs => v.abs(),
        Func::Sqrt => v.sqrt(),
        Func::Sin => v.sin(),
        Func::Cos => v.cos(),
        Func::Tan => v.tan(),
        Func::Exp => v.exp(),
        Func::Log => v.ln(),
        Func::Floor => v.floor(),
        Func::Ceil => v.ceil(),
        Func::Round => v.round(),
        Func::Min | Func::Max | Func::Pow => f64::NAN,
    }
}

fn binary_func(func: Func, a: f64, b: f64) -> f64 {
    match func {
        Func::Min => a.min(b),
        Func::Max => a.max(b),
        Func::Pow => a.powf(b),
        _ => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(v: f64) -> Box<Expr> {
        Box::new(Expr::Literal(v))
    }

    #[test]
    fn test_broadcast_scalar() {
        let expr = Expr::Binary { left: Box::new(Expr::Source(0)), op: BinaryOp::Mul, right: lit(2.0) };
        assert_eq!(eval(&expr, &[&[1.0, 2.0, 3.0]]).unwrap(), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_length_mismatch() {
        let expr = Expr::Binary { left: Box::new(Expr::Source(0)), op: BinaryOp::Add, right: Box::new(Expr::Source(1)) };
        assert!(eval(&expr, &[&[1.0, 2.0], &[1.0, 2.0, 3.0]]).is_err());
        assert_eq!(eval(&expr, &[&[1.0, 2.0], &[10.0, 20.0]]).unwrap(), vec![11.0, 22.0]);
    }

    #[test]
    fn test_functions() {
        let expr = Expr::Call { func: Func::Max, args: vec![Expr::Source(0), Expr::Literal(0.0)] };
        assert_eq!(eval(&expr, &[&[-1.0, 2.0]]).unwrap(), vec![0.0, 2.0]);
        let expr = Expr::Call { func: Func::Floor, args: vec![Expr::Literal(2.7)] };
        assert_eq!(eval(&expr, &[]).unwrap(), vec![2.0]);
    }
}
