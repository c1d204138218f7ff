//! Expression IR for operator bodies
//!
//! Axis references are positional: `AxisRef::Spatial(i)` is the i-th spatial
//! axis of the operator that owns the expression, `AxisRef::Reduce(j)` the
//! j-th reduction axis. Rebuilding a body over the same iteration domain is
//! therefore a pure tensor-id remap.

use std::fmt;
use std::ops::{Add, Div, Mul, Rem, Sub};

use serde::{Deserialize, Serialize};

use crate::error::TensorizeResult;

/// Element data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    F16,
    F32,
    I8,
    I32,
}

impl DType {
    pub fn bits(&self) -> usize {
        match self {
            DType::F16 => 16,
            DType::F32 => 32,
            DType::I8 => 8,
            DType::I32 => 32,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F16 => "float16",
            DType::F32 => "float32",
            DType::I8 => "int8",
            DType::I32 => "int32",
        };
        write!(f, "{}", name)
    }
}

/// Kind of an iteration axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IterKind {
    Spatial,
    Reduce,
}

/// Positional reference to an axis of the owning operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AxisRef {
    Spatial(usize),
    Reduce(usize),
}

impl AxisRef {
    pub fn kind(&self) -> IterKind {
        match self {
            AxisRef::Spatial(_) => IterKind::Spatial,
            AxisRef::Reduce(_) => IterKind::Reduce,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            AxisRef::Spatial(i) | AxisRef::Reduce(i) => *i,
        }
    }
}

/// Index of a tensor inside a `ComputeGraph`, or of an input slot inside a
/// capability node expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Max,
    Min,
}

impl BinOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Max => "max",
            BinOp::Min => "min",
        }
    }
}

/// Operator body expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Axis(AxisRef),
    Load {
        tensor: TensorId,
        indices: Vec<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Cast {
        dtype: DType,
        value: Box<Expr>,
    },
    /// Sum over every reduction axis of the owning operator
    Sum(Box<Expr>),
}

impl Expr {
    pub fn spatial(i: usize) -> Self {
        Expr::Axis(AxisRef::Spatial(i))
    }

    pub fn reduce(i: usize) -> Self {
        Expr::Axis(AxisRef::Reduce(i))
    }

    pub fn load(tensor: TensorId, indices: Vec<Expr>) -> Self {
        Expr::Load { tensor, indices }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn cast(dtype: DType, value: Expr) -> Self {
        Expr::Cast {
            dtype,
            value: Box::new(value),
        }
    }

    pub fn sum(source: Expr) -> Self {
        Expr::Sum(Box::new(source))
    }

    pub fn max(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(BinOp::Max, lhs, rhs)
    }

    /// Tensors read by this expression, deduplicated, in encounter order
    pub fn tensors(&self) -> Vec<TensorId> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Load { tensor, .. } = e {
                if !out.contains(tensor) {
                    out.push(*tensor);
                }
            }
        });
        out
    }

    /// Every load in this expression, outermost first
    pub fn loads(&self) -> Vec<(TensorId, &[Expr])> {
        let mut out = Vec::new();
        self.collect_loads(&mut out);
        out
    }

    fn collect_loads<'a>(&'a self, out: &mut Vec<(TensorId, &'a [Expr])>) {
        match self {
            Expr::Load { tensor, indices } => {
                out.push((*tensor, indices.as_slice()));
                for idx in indices {
                    idx.collect_loads(out);
                }
            }
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_loads(out);
                rhs.collect_loads(out);
            }
            Expr::Cast { value, .. } => value.collect_loads(out),
            Expr::Sum(source) => source.collect_loads(out),
            Expr::Int(_) | Expr::Float(_) | Expr::Axis(_) => {}
        }
    }

    /// Every axis referenced by this expression
    pub fn axes(&self) -> Vec<AxisRef> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Axis(a) = e {
                if !out.contains(a) {
                    out.push(*a);
                }
            }
        });
        out
    }

    pub fn is_reduction(&self) -> bool {
        matches!(self, Expr::Sum(_))
    }

    fn visit<F: FnMut(&Expr)>(&self, f: &mut F) {
        f(self);
        match self {
            Expr::Load { indices, .. } => {
                for idx in indices {
                    idx.visit(f);
                }
            }
            Expr::Binary { lhs, rhs, .. } => {
                lhs.visit(f);
                rhs.visit(f);
            }
            Expr::Cast { value, .. } => value.visit(f),
            Expr::Sum(source) => source.visit(f),
            Expr::Int(_) | Expr::Float(_) | Expr::Axis(_) => {}
        }
    }

    /// Rebuild every load bottom-up: indices are rewritten first, then `f`
    /// produces the replacement for the load itself.
    pub fn rewrite_loads<F>(&self, f: &mut F) -> TensorizeResult<Expr>
    where
        F: FnMut(TensorId, Vec<Expr>) -> TensorizeResult<Expr>,
    {
        Ok(match self {
            Expr::Load { tensor, indices } => {
                let indices = indices
                    .iter()
                    .map(|idx| idx.rewrite_loads(f))
                    .collect::<TensorizeResult<Vec<_>>>()?;
                f(*tensor, indices)?
            }
            Expr::Binary { op, lhs, rhs } => {
                Expr::binary(*op, lhs.rewrite_loads(f)?, rhs.rewrite_loads(f)?)
            }
            Expr::Cast { dtype, value } => Expr::cast(*dtype, value.rewrite_loads(f)?),
            Expr::Sum(source) => Expr::sum(source.rewrite_loads(f)?),
            Expr::Int(_) | Expr::Float(_) | Expr::Axis(_) => self.clone(),
        })
    }

    /// Replace tensor ids, keeping indices as they are
    pub fn map_tensors<F>(&self, f: &mut F) -> TensorizeResult<Expr>
    where
        F: FnMut(TensorId) -> TensorizeResult<TensorId>,
    {
        self.rewrite_loads(&mut |tensor, indices| Ok(Expr::load(f(tensor)?, indices)))
    }

    /// Replace every axis reference by an arbitrary expression
    pub fn substitute_axes<F>(&self, f: &F) -> Expr
    where
        F: Fn(AxisRef) -> Expr,
    {
        match self {
            Expr::Axis(a) => f(*a),
            Expr::Load { tensor, indices } => Expr::load(
                *tensor,
                indices.iter().map(|idx| idx.substitute_axes(f)).collect(),
            ),
            Expr::Binary { op, lhs, rhs } => {
                Expr::binary(*op, lhs.substitute_axes(f), rhs.substitute_axes(f))
            }
            Expr::Cast { dtype, value } => Expr::cast(*dtype, value.substitute_axes(f)),
            Expr::Sum(source) => Expr::sum(source.substitute_axes(f)),
            Expr::Int(_) | Expr::Float(_) => self.clone(),
        }
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::Int(v)
    }
}

impl From<AxisRef> for Expr {
    fn from(a: AxisRef) -> Self {
        Expr::Axis(a)
    }
}

macro_rules! impl_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait for Expr {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, self, rhs)
            }
        }
    };
}

impl_binop!(Add, add, BinOp::Add);
impl_binop!(Sub, sub, BinOp::Sub);
impl_binop!(Mul, mul, BinOp::Mul);
impl_binop!(Div, div, BinOp::Div);
impl_binop!(Rem, rem, BinOp::Mod);

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(v) => write!(f, "{}", v),
            Expr::Float(v) => write!(f, "{:?}", v),
            Expr::Axis(AxisRef::Spatial(i)) => write!(f, "s{}", i),
            Expr::Axis(AxisRef::Reduce(i)) => write!(f, "r{}", i),
            Expr::Load { tensor, indices } => {
                write!(f, "t{}[", tensor.0)?;
                for (i, idx) in indices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", idx)?;
                }
                write!(f, "]")
            }
            Expr::Binary { op: op @ (BinOp::Max | BinOp::Min), lhs, rhs } => {
                write!(f, "{}({}, {})", op.symbol(), lhs, rhs)
            }
            Expr::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
            Expr::Cast { dtype, value } => write!(f, "{}({})", dtype, value),
            Expr::Sum(source) => write!(f, "sum({})", source),
        }
    }
}
