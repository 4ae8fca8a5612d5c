//! The standard operator library: structural-info inference for each
//! operator, and the gradient rules an embedder registers before
//! differentiating.

use sorrel::{id, Attrs, DType, Op, OpError, Opset, Ty, Types};
use sorrel_grad::{Grad, Registry, Vjp};

pub use sorrel::op::{ADD, ONES, ZEROS};

/// Elementwise subtraction.
pub const SUB: Op = Op::new("sub");
/// Elementwise multiplication.
pub const MUL: Op = Op::new("mul");
/// Elementwise division.
pub const DIV: Op = Op::new("div");
/// Elementwise negation.
pub const NEG: Op = Op::new("neg");
/// Elementwise exponential.
pub const EXP: Op = Op::new("exp");
/// Elementwise square root.
pub const SQRT: Op = Op::new("sqrt");
/// Full reduction to a scalar.
pub const SUM: Op = Op::new("sum");
/// Broadcast to the shape in attrs.
pub const BROADCAST_TO: Op = Op::new("broadcast_to");
/// Sum along broadcast axes down to the shape in attrs.
pub const COLLAPSE_SUM_TO: Op = Op::new("collapse_sum_to");
/// Rank-2 matrix product.
pub const MATMUL: Op = Op::new("matmul");
/// Rank-2 transposition.
pub const TRANSPOSE: Op = Op::new("transpose");

/// Broadcast of two shapes, aligned from the trailing dimension.
pub fn broadcast(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut shape = vec![0; rank];
    for (i, dim) in shape.iter_mut().enumerate() {
        let x = if i + a.len() >= rank {
            a[i + a.len() - rank]
        } else {
            1
        };
        let y = if i + b.len() >= rank {
            b[i + b.len() - rank]
        } else {
            1
        };
        *dim = if x == y || y == 1 {
            x
        } else if x == 1 {
            y
        } else {
            return None;
        };
    }
    Some(shape)
}

/// Whether a value of shape `from` broadcasts to exactly `to`.
pub fn expands_to(from: &[usize], to: &[usize]) -> bool {
    from.len() <= to.len() && broadcast(from, to).as_deref() == Some(to)
}

fn tensor(types: &Types, op: Op, args: &[id::Ty], i: usize) -> Result<(Vec<usize>, DType), OpError> {
    match args.get(i) {
        Some(&t) => match types.get(t) {
            Ty::Tensor { shape, dtype } => Ok((shape.to_vec(), *dtype)),
            Ty::Tuple { .. } => Err(OpError::Arg(op, i)),
        },
        None => Err(OpError::Arity(op)),
    }
}

/// The standard operator set.
pub struct Builtins;

impl Opset for Builtins {
    fn result(
        &self,
        types: &mut Types,
        op: Op,
        args: &[id::Ty],
        attrs: &Attrs,
    ) -> Result<id::Ty, OpError> {
        match op {
            ADD | SUB | MUL | DIV => {
                if args.len() != 2 {
                    return Err(OpError::Arity(op));
                }
                let (ls, ld) = tensor(types, op, args, 0)?;
                let (rs, rd) = tensor(types, op, args, 1)?;
                if rd != ld {
                    return Err(OpError::Arg(op, 1));
                }
                let shape = broadcast(&ls, &rs).ok_or(OpError::Arg(op, 1))?;
                Ok(types.tensor(&shape, ld))
            }
            NEG | EXP | SQRT => {
                if args.len() != 1 {
                    return Err(OpError::Arity(op));
                }
                let (shape, dtype) = tensor(types, op, args, 0)?;
                Ok(types.tensor(&shape, dtype))
            }
            SUM => {
                if args.len() != 1 {
                    return Err(OpError::Arity(op));
                }
                let (_, dtype) = tensor(types, op, args, 0)?;
                Ok(types.scalar(dtype))
            }
            BROADCAST_TO => {
                if args.len() != 1 {
                    return Err(OpError::Arity(op));
                }
                let (shape, dtype) = tensor(types, op, args, 0)?;
                let target = attrs.shape.as_deref().ok_or(OpError::Attrs(op))?;
                if !expands_to(&shape, target) {
                    return Err(OpError::Arg(op, 0));
                }
                Ok(types.tensor(target, dtype))
            }
            COLLAPSE_SUM_TO => {
                if args.len() != 1 {
                    return Err(OpError::Arity(op));
                }
                let (shape, dtype) = tensor(types, op, args, 0)?;
                let target = attrs.shape.as_deref().ok_or(OpError::Attrs(op))?;
                if !expands_to(target, &shape) {
                    return Err(OpError::Arg(op, 0));
                }
                Ok(types.tensor(target, dtype))
            }
            ZEROS | ONES => {
                if !args.is_empty() {
                    return Err(OpError::Arity(op));
                }
                match (&attrs.shape, attrs.dtype) {
                    (Some(shape), Some(dtype)) => Ok(types.tensor(shape, dtype)),
                    _ => Err(OpError::Attrs(op)),
                }
            }
            MATMUL => {
                if args.len() != 2 {
                    return Err(OpError::Arity(op));
                }
                let (ls, ld) = tensor(types, op, args, 0)?;
                let (rs, rd) = tensor(types, op, args, 1)?;
                match (&ls[..], &rs[..]) {
                    (&[m, k], &[k2, n]) if k == k2 && ld == rd => Ok(types.tensor(&[m, n], ld)),
                    _ => Err(OpError::Arg(op, 1)),
                }
            }
            TRANSPOSE => {
                if args.len() != 1 {
                    return Err(OpError::Arity(op));
                }
                let (shape, dtype) = tensor(types, op, args, 0)?;
                match &shape[..] {
                    &[m, n] => Ok(types.tensor(&[n, m], dtype)),
                    _ => Err(OpError::Arg(op, 0)),
                }
            }
            _ => Err(OpError::Unknown(op)),
        }
    }
}

pub fn add(left: Grad, right: Grad) -> Grad {
    Grad::add(left, right)
}

pub fn sub(left: Grad, right: Grad) -> Grad {
    Grad::call(SUB, [left, right], Attrs::default())
}

pub fn mul(left: Grad, right: Grad) -> Grad {
    Grad::call(MUL, [left, right], Attrs::default())
}

pub fn div(left: Grad, right: Grad) -> Grad {
    Grad::call(DIV, [left, right], Attrs::default())
}

pub fn neg(x: Grad) -> Grad {
    Grad::call(NEG, [x], Attrs::default())
}

pub fn broadcast_to(x: Grad, shape: &[usize]) -> Grad {
    Grad::call(BROADCAST_TO, [x], Attrs::shape(shape))
}

pub fn collapse_sum_to(x: Grad, shape: &[usize]) -> Grad {
    Grad::call(COLLAPSE_SUM_TO, [x], Attrs::shape(shape))
}

pub fn matmul(left: Grad, right: Grad) -> Grad {
    Grad::call(MATMUL, [left, right], Attrs::default())
}

pub fn transpose(x: Grad) -> Grad {
    Grad::call(TRANSPOSE, [x], Attrs::default())
}

// Rules reduce their partials to the argument's own shape; broadcasting
// introduced by the forward operator is summed back out here, not by the
// differentiation core.

fn add_grad(v: &Vjp) -> Vec<Grad> {
    vec![
        collapse_sum_to(v.out(), v.shape(v.args[0])),
        collapse_sum_to(v.out(), v.shape(v.args[1])),
    ]
}

fn sub_grad(v: &Vjp) -> Vec<Grad> {
    vec![
        collapse_sum_to(v.out(), v.shape(v.args[0])),
        collapse_sum_to(neg(v.out()), v.shape(v.args[1])),
    ]
}

fn mul_grad(v: &Vjp) -> Vec<Grad> {
    vec![
        collapse_sum_to(mul(v.out(), Grad::Var(v.args[1])), v.shape(v.args[0])),
        collapse_sum_to(mul(v.out(), Grad::Var(v.args[0])), v.shape(v.args[1])),
    ]
}

fn div_grad(v: &Vjp) -> Vec<Grad> {
    let y = Grad::Var(v.args[1]);
    vec![
        collapse_sum_to(div(v.out(), y.clone()), v.shape(v.args[0])),
        // d(x/y)/dy = -x/y^2, reusing the forward quotient
        collapse_sum_to(
            neg(div(mul(v.out(), Grad::Var(v.result)), y)),
            v.shape(v.args[1]),
        ),
    ]
}

fn neg_grad(v: &Vjp) -> Vec<Grad> {
    vec![neg(v.out())]
}

fn exp_grad(v: &Vjp) -> Vec<Grad> {
    vec![mul(v.out(), Grad::Var(v.result))]
}

fn sqrt_grad(v: &Vjp) -> Vec<Grad> {
    let root = Grad::Var(v.result);
    vec![div(v.out(), add(root.clone(), root))]
}

fn sum_grad(v: &Vjp) -> Vec<Grad> {
    vec![broadcast_to(v.out(), v.shape(v.args[0]))]
}

fn broadcast_to_grad(v: &Vjp) -> Vec<Grad> {
    vec![collapse_sum_to(v.out(), v.shape(v.args[0]))]
}

fn collapse_sum_to_grad(v: &Vjp) -> Vec<Grad> {
    vec![broadcast_to(v.out(), v.shape(v.args[0]))]
}

fn matmul_grad(v: &Vjp) -> Vec<Grad> {
    vec![
        matmul(v.out(), transpose(Grad::Var(v.args[1]))),
        matmul(transpose(Grad::Var(v.args[0])), v.out()),
    ]
}

fn transpose_grad(v: &Vjp) -> Vec<Grad> {
    vec![transpose(v.out())]
}

/// Installs the gradient rules for every builtin operator.
pub fn register(rules: &mut Registry) {
    rules.insert(ADD, add_grad);
    rules.insert(SUB, sub_grad);
    rules.insert(MUL, mul_grad);
    rules.insert(DIV, div_grad);
    rules.insert(NEG, neg_grad);
    rules.insert(EXP, exp_grad);
    rules.insert(SQRT, sqrt_grad);
    rules.insert(SUM, sum_grad);
    rules.insert(BROADCAST_TO, broadcast_to_grad);
    rules.insert(COLLAPSE_SUM_TO, collapse_sum_to_grad);
    rules.insert(MATMUL, matmul_grad);
    rules.insert(TRANSPOSE, transpose_grad);
    // constructors read nothing, so they contribute no partials
    rules.insert(ZEROS, |_| vec![]);
    rules.insert(ONES, |_| vec![]);
}

/// A registry populated with the builtin rules.
pub fn registry() -> Registry {
    let mut rules = Registry::new();
    register(&mut rules);
    rules
}
