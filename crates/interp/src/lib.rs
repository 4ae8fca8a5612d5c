use sorrel::{Expr, Function, Instr, Op};
use sorrel_ops::{
    broadcast, ADD, BROADCAST_TO, COLLAPSE_SUM_TO, DIV, EXP, MATMUL, MUL, NEG, ONES, SQRT, SUB,
    SUM, TRANSPOSE, ZEROS,
};
use std::rc::Rc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A tensor value: a shape and row-major elements. Evaluation is carried out
/// in `f64` regardless of the static dtype.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub shape: Box<[usize]>,
    pub data: Vec<f64>,
}

impl Tensor {
    pub fn new(shape: &[usize], data: Vec<f64>) -> Self {
        assert_eq!(data.len(), shape.iter().product::<usize>());
        Tensor {
            shape: shape.into(),
            data,
        }
    }

    pub fn scalar(val: f64) -> Self {
        Tensor {
            shape: Box::new([]),
            data: vec![val],
        }
    }

    pub fn fill(shape: &[usize], val: f64) -> Self {
        Tensor {
            shape: shape.into(),
            data: vec![val; shape.iter().product()],
        }
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum Val {
    Tensor(Rc<Tensor>),
    Tuple(Rc<Vec<Val>>),
}

impl Val {
    pub fn scalar(val: f64) -> Self {
        Val::Tensor(Rc::new(Tensor::scalar(val)))
    }

    pub fn tensor(t: Tensor) -> Self {
        Val::Tensor(Rc::new(t))
    }

    pub fn tuple(vals: Vec<Val>) -> Self {
        Val::Tuple(Rc::new(vals))
    }

    fn as_tensor(&self) -> &Tensor {
        match self {
            Val::Tensor(t) => t,
            Val::Tuple(_) => unreachable!(),
        }
    }
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Flat index into `shape` for the multi-index `idx`, where `shape` is
/// aligned to the trailing dimensions of `idx` and size-1 dimensions repeat.
fn project(idx: &[usize], shape: &[usize], strides: &[usize]) -> usize {
    let offset = idx.len() - shape.len();
    shape
        .iter()
        .zip(strides)
        .enumerate()
        .map(|(i, (&dim, &stride))| if dim == 1 { 0 } else { idx[offset + i] * stride })
        .sum()
}

fn for_each_index(shape: &[usize], mut f: impl FnMut(&[usize])) {
    let mut idx = vec![0; shape.len()];
    loop {
        f(&idx);
        let mut i = shape.len();
        loop {
            if i == 0 {
                return;
            }
            i -= 1;
            idx[i] += 1;
            if idx[i] < shape[i] {
                break;
            }
            idx[i] = 0;
        }
    }
}

fn map1(x: &Tensor, f: impl Fn(f64) -> f64) -> Tensor {
    Tensor {
        shape: x.shape.clone(),
        data: x.data.iter().map(|&v| f(v)).collect(),
    }
}

fn map2(a: &Tensor, b: &Tensor, f: impl Fn(f64, f64) -> f64) -> Tensor {
    let shape = broadcast(&a.shape, &b.shape).unwrap();
    let (sa, sb) = (strides(&a.shape), strides(&b.shape));
    let mut data = Vec::with_capacity(shape.iter().product());
    for_each_index(&shape, |idx| {
        data.push(f(
            a.data[project(idx, &a.shape, &sa)],
            b.data[project(idx, &b.shape, &sb)],
        ));
    });
    Tensor {
        shape: shape.into(),
        data,
    }
}

fn broadcast_to(x: &Tensor, shape: &[usize]) -> Tensor {
    let sx = strides(&x.shape);
    let mut data = Vec::with_capacity(shape.iter().product());
    for_each_index(shape, |idx| {
        data.push(x.data[project(idx, &x.shape, &sx)]);
    });
    Tensor {
        shape: shape.into(),
        data,
    }
}

fn collapse_sum_to(x: &Tensor, shape: &[usize]) -> Tensor {
    let st = strides(shape);
    let mut out = Tensor::fill(shape, 0.);
    let mut flat = 0;
    for_each_index(&x.shape, |idx| {
        out.data[project(idx, shape, &st)] += x.data[flat];
        flat += 1;
    });
    out
}

fn matmul(a: &Tensor, b: &Tensor) -> Tensor {
    let (&[m, k], &[_, n]) = (&a.shape[..], &b.shape[..]) else {
        unreachable!()
    };
    let mut out = Tensor::fill(&[m, n], 0.);
    for i in 0..m {
        for j in 0..n {
            for l in 0..k {
                out.data[i * n + j] += a.data[i * k + l] * b.data[l * n + j];
            }
        }
    }
    out
}

fn transpose(x: &Tensor) -> Tensor {
    let &[m, n] = &x.shape[..] else { unreachable!() };
    let mut out = Tensor::fill(&[n, m], 0.);
    for i in 0..m {
        for j in 0..n {
            out.data[j * m + i] = x.data[i * n + j];
        }
    }
    out
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("wrong number of arguments")]
    ArgCount,

    #[error("operator `{0}` has no evaluation rule")]
    UnknownOp(Op),
}

struct Interpreter<'a> {
    f: &'a Function,
    vars: Vec<Option<Val>>,
}

impl Interpreter<'_> {
    fn get(&self, var: sorrel::id::Var) -> &Val {
        self.vars[var.var()].as_ref().unwrap()
    }

    fn expr(&self, expr: &Expr) -> Result<Val, Error> {
        match expr {
            &Expr::Const { val } => Ok(Val::scalar(val)),
            &Expr::Var { var } => Ok(self.get(var).clone()),
            Expr::Tuple { members } => Ok(Val::tuple(
                members.iter().map(|&x| self.get(x).clone()).collect(),
            )),
            &Expr::Member { tuple, member } => match self.get(tuple) {
                Val::Tuple(vals) => Ok(vals[member.member()].clone()),
                Val::Tensor(_) => unreachable!(),
            },
            Expr::Call { op, args, attrs } => {
                let op = *op;
                let arg = |i: usize| self.get(args[i]).as_tensor();
                let out = match op {
                    ADD => map2(arg(0), arg(1), |x, y| x + y),
                    SUB => map2(arg(0), arg(1), |x, y| x - y),
                    MUL => map2(arg(0), arg(1), |x, y| x * y),
                    DIV => map2(arg(0), arg(1), |x, y| x / y),
                    NEG => map1(arg(0), |x| -x),
                    EXP => map1(arg(0), f64::exp),
                    SQRT => map1(arg(0), f64::sqrt),
                    SUM => Tensor::scalar(arg(0).data.iter().sum()),
                    BROADCAST_TO => broadcast_to(arg(0), attrs.shape.as_deref().unwrap()),
                    COLLAPSE_SUM_TO => collapse_sum_to(arg(0), attrs.shape.as_deref().unwrap()),
                    MATMUL => matmul(arg(0), arg(1)),
                    TRANSPOSE => transpose(arg(0)),
                    ZEROS => Tensor::fill(attrs.shape.as_deref().unwrap(), 0.),
                    ONES => Tensor::fill(attrs.shape.as_deref().unwrap(), 1.),
                    op => return Err(Error::UnknownOp(op)),
                };
                Ok(Val::tensor(out))
            }
        }
    }
}

/// Evaluate `f` on `args`. Guaranteed not to panic if `f` is valid for the
/// builtin operator set and `args` match the parameter types.
pub fn interp(f: &Function, args: Vec<Val>) -> Result<Val, Error> {
    if args.len() != f.params.len() {
        return Err(Error::ArgCount);
    }
    let mut it = Interpreter {
        f,
        vars: vec![None; f.vars.len()],
    };
    for (&p, arg) in f.params.iter().zip(args) {
        it.vars[p.var()] = Some(arg);
    }
    for Instr { var, expr } in it.f.body.iter() {
        let val = it.expr(expr)?;
        it.vars[var.var()] = Some(val);
    }
    Ok(it.get(f.ret).clone())
}
