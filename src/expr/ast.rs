//! Expression AST. Pure data.

/// A numeric expression over source slots.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(f64),
    /// Source slot `x$n`; `x` is slot 0.
    Source(usize),
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { left: Box<Expr>, op: BinaryOp, right: Box<Expr> },
    Call { func: Func, args: Vec<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add, Sub, Mul, Div, Mod, Pow,
}

/// Built-in pure functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Abs, Sqrt, Sin, Cos, Tan, Exp, Log, Floor, Ceil, Round,
    Min, Max, Pow,
}

impl Func {
    pub fn from_name(name: &str) -> Option<Func> {
        Some(match name {
            "abs" => Func::Abs,
            "sqrt" => Func::Sqrt,
            "sin" => Func::Sin,
            "cos" => Func::Cos,
            "tan" => Func::Tan,
            "exp" => Func::Exp,
            "log" => Func::Log,
            "floor" => Func::Floor,
            "ceil" => Func::Ceil,
            "round" => Func::Round,
            "min" => Func::Min,
            "max" => Func::Max,
            "pow" => Func::Pow,
            _ => return None,
        })
    }

    pub fn arity(self) -> usize {
        match self {
            Func::Min | Func::Max | Func::Pow => 2,
            _ => 1,
        }
    }
}

impl Expr {
    /// Highest source slot referenced, if any.
    pub fn max_source(&self) -> Option<usize> {
        match self {
            Expr::Literal(_) => None,
            Expr::Source(n) => Some(*n),
            Expr::Unary { expr, .. } => expr.max_source(),
            Expr::Binary { left, right, .. } => left.max_source().max(right.max_source()),
            Expr::Call { args, .. } => args.iter().filter_map(Expr::max_source).max(),
        }
    }
}
