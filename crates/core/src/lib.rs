pub mod build;
pub mod id;

use indexmap::{IndexMap, IndexSet};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Element type of a tensor.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DType {
    F32,
    F64,
    I32,
    Bool,
}

impl DType {
    /// Whether values of this dtype live in a differentiable domain.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }
}

/// A structural type.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Ty {
    /// A tensor with a static shape. A scalar is a rank-zero tensor.
    Tensor {
        shape: Box<[usize]>,
        dtype: DType,
    },
    Tuple {
        /// Must all be strictly smaller type IDs than this type's own ID.
        members: Box<[id::Ty]>,
    },
}

/// An operator, identified by the name it was registered under.
///
/// Equality is by name, so independently declared constants for the same
/// operator compare equal and can key the same registry entry.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Op(&'static str);

impl Op {
    pub const fn new(name: &'static str) -> Self {
        Op(name)
    }

    pub fn name(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[cfg(feature = "serde")]
impl Serialize for Op {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for Op {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // operator names are interned for the lifetime of the process
        let name = String::deserialize(deserializer)?;
        Ok(Op(Box::leak(name.into_boxed_str())))
    }
}

/// Operators that synthesized adjoint code relies on.
///
/// Every operator library must provide these with the conventional semantics;
/// everything else belongs to the library itself.
pub mod op {
    use super::Op;

    /// Elementwise addition.
    pub const ADD: Op = Op::new("add");
    /// Constant tensor of zeros, shaped by attrs.
    pub const ZEROS: Op = Op::new("zeros");
    /// Constant tensor of ones, shaped by attrs.
    pub const ONES: Op = Op::new("ones");
}

/// Static attributes carried by a call.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Attrs {
    /// Target shape for shape-changing operators and constructors.
    pub shape: Option<Box<[usize]>>,
    /// Element type for constructors.
    pub dtype: Option<DType>,
}

impl Attrs {
    pub fn shape(shape: &[usize]) -> Self {
        Attrs {
            shape: Some(shape.into()),
            dtype: None,
        }
    }

    pub fn filled(shape: &[usize], dtype: DType) -> Self {
        Attrs {
            shape: Some(shape.into()),
            dtype: Some(dtype),
        }
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct Instr {
    pub var: id::Var,
    pub expr: Expr,
}

/// The right-hand side of a binding.
///
/// Bodies are kept normalized: every argument of a `Call` or `Tuple` is a
/// variable, and a `Member`'s operand is a variable, so projections never
/// nest.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// A scalar constant; the bound variable's type gives its dtype.
    Const { val: f64 },
    /// Aliases another variable.
    Var { var: id::Var },
    Tuple {
        members: Box<[id::Var]>,
    },
    Member {
        tuple: id::Var,
        member: id::Member,
    },
    Call {
        op: Op,
        args: Box<[id::Var]>,
        attrs: Attrs,
    },
}

/// A function definition: a straight-line dataflow region in SSA form.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    /// Types used in this function definition, topologically ordered.
    pub types: Box<[Ty]>,
    /// Local variable types.
    pub vars: Box<[id::Ty]>,
    /// Parameter variables.
    pub params: Box<[id::Var]>,
    /// Return variable.
    pub ret: id::Var,
    /// Function body.
    pub body: Box<[Instr]>,
}

/// A collection of named functions.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub funcs: IndexMap<String, Function>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.funcs.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, f: Function) {
        self.funcs.insert(name.into(), f);
    }
}

/// A deduplicating table of the types used by one function.
#[derive(Clone, Debug, Default)]
pub struct Types {
    types: IndexSet<Ty>,
}

impl Types {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn get(&self, t: id::Ty) -> &Ty {
        &self.types[t.ty()]
    }

    pub fn intern(&mut self, ty: Ty) -> id::Ty {
        let (i, _) = self.types.insert_full(ty);
        id::ty(i)
    }

    pub fn tensor(&mut self, shape: &[usize], dtype: DType) -> id::Ty {
        self.intern(Ty::Tensor {
            shape: shape.into(),
            dtype,
        })
    }

    pub fn scalar(&mut self, dtype: DType) -> id::Ty {
        self.tensor(&[], dtype)
    }

    /// The member IDs must already be interned in this table.
    pub fn tuple(&mut self, members: impl Into<Box<[id::Ty]>>) -> id::Ty {
        self.intern(Ty::Tuple {
            members: members.into(),
        })
    }

    /// Copies every type of `old` into this table, returning a mapping from
    /// old type IDs to new ones. Tuple members resolve through earlier
    /// entries, so `old` must be topologically ordered.
    pub fn import(&mut self, old: &[Ty]) -> Vec<id::Ty> {
        let mut mapping = vec![];
        for ty in old.iter() {
            let resolved = match ty {
                Ty::Tensor { shape, dtype } => Ty::Tensor {
                    shape: shape.clone(),
                    dtype: *dtype,
                },
                Ty::Tuple { members } => Ty::Tuple {
                    members: members.iter().map(|&t| mapping[t.ty()]).collect(),
                },
            };
            mapping.push(self.intern(resolved));
        }
        mapping
    }

    pub fn finish(self) -> Box<[Ty]> {
        self.types.into_iter().collect()
    }
}

/// Failure to infer the result type of a call.
#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error("unknown operator `{0}`")]
    Unknown(Op),

    #[error("wrong number of arguments for `{0}`")]
    Arity(Op),

    #[error("argument {1} of `{0}` has the wrong structural type")]
    Arg(Op, usize),

    #[error("missing or invalid attributes for `{0}`")]
    Attrs(Op),
}

/// Operator library hook: structural-info inference for call results.
pub trait Opset {
    /// Returns the type of applying `op` to arguments of the given types,
    /// interning any type it needs to construct.
    fn result(
        &self,
        types: &mut Types,
        op: Op,
        args: &[id::Ty],
        attrs: &Attrs,
    ) -> Result<id::Ty, OpError>;
}

impl<O: Opset + ?Sized> Opset for &O {
    fn result(
        &self,
        types: &mut Types,
        op: Op,
        args: &[id::Ty],
        attrs: &Attrs,
    ) -> Result<id::Ty, OpError> {
        (**self).result(types, op, args, attrs)
    }
}
