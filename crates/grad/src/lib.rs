use indexmap::IndexMap;
use sorrel::{id, op, Attrs, Expr, Function, Instr, Module, Op, OpError, Opset, Ty, Types};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("`{0}` does not name a function")]
    NotAFunction(String),

    #[error("instruction {0} breaks the straight-line single-assignment form")]
    UnsupportedBody(usize),

    #[error("return value is not a scalar floating-point tensor")]
    NonScalarReturn,

    #[error("gradient requested for variable {} which is not a floating-point parameter", .0.var())]
    BadRequireGrads(id::Var),

    #[error("operator `{0}` has no registered gradient rule")]
    UnknownGradient(Op),

    #[error("gradient rule for `{0}` returned a partial of the wrong structural type for argument {1}")]
    GradientShapeMismatch(Op, usize),

    #[error("structural-info inference rejected synthesized adjoint code")]
    Emit(#[source] OpError),

    #[error("internal invariant violated: {0}")]
    Invariant(&'static str),
}

/// An adjoint expression under accumulation.
///
/// Unlike [`Expr`], subtrees may nest; the emitter flattens them into named
/// bindings, so a tree leaf is only ever referenced through the variable that
/// names it in the output function.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Grad {
    /// Names a variable of the function being built.
    Var(id::Var),
    /// Structural zero of a tensor type.
    Zero(id::Ty),
    Tuple(Box<[Grad]>),
    Member {
        tuple: Box<Grad>,
        member: id::Member,
    },
    Call {
        op: Op,
        args: Box<[Grad]>,
        attrs: Attrs,
    },
}

impl Grad {
    pub fn call(op: Op, args: impl Into<Box<[Grad]>>, attrs: Attrs) -> Self {
        Grad::Call {
            op,
            args: args.into(),
            attrs,
        }
    }

    /// Elementwise sum of two adjoint contributions of the same shape.
    pub fn add(left: Grad, right: Grad) -> Self {
        Grad::call(op::ADD, [left, right], Attrs::default())
    }
}

/// Everything a gradient rule may inspect about one forward call.
pub struct Vjp<'a> {
    /// Operator of the forward call.
    pub op: Op,
    /// Arguments of the forward call.
    pub args: &'a [id::Var],
    /// Attributes of the forward call.
    pub attrs: &'a Attrs,
    /// Variable bound to the forward call's result.
    pub result: id::Var,
    /// Named adjoint of the result.
    pub out_grad: id::Var,
    types: &'a Types,
    vars: &'a [id::Ty],
}

impl Vjp<'_> {
    pub fn ty(&self, x: id::Var) -> &Ty {
        self.types.get(self.vars[x.var()])
    }

    /// Shape of a tensor-typed variable. Only called by rules for operators
    /// whose arguments are tensors, which a valid input function guarantees.
    pub fn shape(&self, x: id::Var) -> &[usize] {
        match self.ty(x) {
            Ty::Tensor { shape, .. } => shape,
            Ty::Tuple { .. } => unreachable!(),
        }
    }

    pub fn dtype(&self, x: id::Var) -> sorrel::DType {
        match self.ty(x) {
            Ty::Tensor { dtype, .. } => *dtype,
            Ty::Tuple { .. } => unreachable!(),
        }
    }

    /// The named output adjoint as an expression leaf.
    pub fn out(&self) -> Grad {
        Grad::Var(self.out_grad)
    }
}

/// A gradient rule: builds one partial adjoint expression per argument of the
/// forward call, each with the argument's own structural type. Rules are pure
/// expression builders; they never emit bindings.
pub type Rule = fn(&Vjp) -> Vec<Grad>;

/// Gradient rules keyed by operator identity.
///
/// Populated once during pass setup and read-only afterwards; scoping the
/// registry to the caller keeps the pass free of process-wide state.
#[derive(Default)]
pub struct Registry {
    rules: IndexMap<Op, Rule>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, op: Op, rule: Rule) {
        self.rules.insert(op, rule);
    }

    pub fn get(&self, op: Op) -> Option<Rule> {
        self.rules.get(&op).copied()
    }
}

/// Structural zero with the same tree shape as `t`.
fn skeleton(types: &Types, t: id::Ty) -> Grad {
    match types.get(t) {
        Ty::Tensor { .. } => Grad::Zero(t),
        Ty::Tuple { members } => Grad::Tuple(members.iter().map(|&m| skeleton(types, m)).collect()),
    }
}

fn has_float_leaf(types: &[Ty], t: id::Ty) -> bool {
    match &types[t.ty()] {
        Ty::Tensor { dtype, .. } => dtype.is_float(),
        Ty::Tuple { members } => members.iter().any(|&m| has_float_leaf(types, m)),
    }
}

struct Reverse<'a, O> {
    ops: &'a O,
    rules: &'a Registry,
    old_body: &'a [Instr],
    types: Types,
    vars: Vec<id::Ty>,
    body: Vec<Instr>,
    /// Accumulated adjoint expression per original variable; absent means no
    /// downstream use has contributed yet.
    adjoint: Vec<Option<Grad>>,
    /// Output variable naming the final adjoint of an original variable.
    named: Vec<Option<id::Var>>,
    /// Emitted adjoint expression to the variable naming its result.
    memo: IndexMap<Grad, id::Var>,
}

impl<O: Opset> Reverse<'_, O> {
    fn newvar(&mut self, t: id::Ty) -> id::Var {
        let var = id::var(self.vars.len());
        self.vars.push(t);
        var
    }

    fn emit(&mut self, t: id::Ty, expr: Expr) -> id::Var {
        let var = self.newvar(t);
        self.body.push(Instr { var, expr });
        var
    }

    fn ty_of(&self, x: id::Var) -> id::Ty {
        self.vars[x.var()]
    }

    /// Names `g`, emitting bindings for any subcomputation not already named.
    fn name(&mut self, g: Grad) -> Result<id::Var, Error> {
        if let Grad::Var(x) = g {
            return Ok(x);
        }
        if let Some(&x) = self.memo.get(&g) {
            return Ok(x);
        }
        let (t, expr) = self.lower(&g)?;
        let var = self.emit(t, expr);
        self.memo.insert(g, var);
        Ok(var)
    }

    /// Flattens the top level of `g` into a bindable expression, naming every
    /// nested subtree.
    fn lower(&mut self, g: &Grad) -> Result<(id::Ty, Expr), Error> {
        match g {
            &Grad::Var(x) => Ok((self.ty_of(x), Expr::Var { var: x })),
            &Grad::Zero(t) => match self.types.get(t).clone() {
                Ty::Tensor { shape, dtype } => Ok((
                    t,
                    Expr::Call {
                        op: op::ZEROS,
                        args: [].into(),
                        attrs: Attrs {
                            shape: Some(shape),
                            dtype: Some(dtype),
                        },
                    },
                )),
                Ty::Tuple { members } => {
                    let mut vars = vec![];
                    for &m in members.iter() {
                        vars.push(self.name(Grad::Zero(m))?);
                    }
                    Ok((t, Expr::Tuple { members: vars.into() }))
                }
            },
            Grad::Tuple(members) => {
                let mut vars = vec![];
                for m in members.iter() {
                    vars.push(self.name(m.clone())?);
                }
                let ts: Vec<id::Ty> = vars.iter().map(|&v| self.ty_of(v)).collect();
                let t = self.types.tuple(ts);
                Ok((t, Expr::Tuple { members: vars.into() }))
            }
            Grad::Member { tuple, member } => {
                let x = self.name((**tuple).clone())?;
                let t = match self.types.get(self.ty_of(x)) {
                    Ty::Tuple { members } => match members.get(member.member()) {
                        Some(&t) => t,
                        None => return Err(Error::Invariant("projection member out of range")),
                    },
                    Ty::Tensor { .. } => {
                        return Err(Error::Invariant("projection from a non-tuple adjoint"))
                    }
                };
                Ok((
                    t,
                    Expr::Member {
                        tuple: x,
                        member: *member,
                    },
                ))
            }
            Grad::Call { op, args, attrs } => {
                let mut vars = vec![];
                for a in args.iter() {
                    vars.push(self.name(a.clone())?);
                }
                let ts: Vec<id::Ty> = vars.iter().map(|&v| self.ty_of(v)).collect();
                let t = self
                    .ops
                    .result(&mut self.types, *op, &ts, attrs)
                    .map_err(Error::Emit)?;
                Ok((
                    t,
                    Expr::Call {
                        op: *op,
                        args: vars.into(),
                        attrs: attrs.clone(),
                    },
                ))
            }
        }
    }

    /// Emits the binding that names the final adjoint of original variable
    /// `x`. Always emits fresh so every walked variable gets its own adjoint
    /// binding, but registers the expression so later increments reuse it.
    fn emit_adjoint(&mut self, x: id::Var, g: Grad) -> Result<id::Var, Error> {
        let t = self.ty_of(x);
        let (lowered, expr) = self.lower(&g)?;
        if lowered != t {
            return Err(Error::Invariant("adjoint type differs from its primal"));
        }
        let var = self.emit(t, expr);
        if !matches!(g, Grad::Var(_)) {
            self.memo.insert(g, var);
        }
        self.named[x.var()] = Some(var);
        Ok(var)
    }

    /// Folds `inc` into the accumulated adjoint of `x`.
    fn accumulate(&mut self, x: id::Var, inc: Grad) -> Result<(), Error> {
        let base = match self.adjoint[x.var()].take() {
            Some(g) => g,
            None => skeleton(&self.types, self.ty_of(x)),
        };
        let merged = self.nested_add(base, inc)?;
        self.adjoint[x.var()] = Some(merged);
        Ok(())
    }

    /// Generalized addition: elementwise on tensors, structural on tuples.
    /// Tuples must be literal on both sides; an increment is named before it
    /// is referenced so that a variable with many uses accumulates linearly.
    fn nested_add(&mut self, base: Grad, inc: Grad) -> Result<Grad, Error> {
        match base {
            Grad::Tuple(members) => {
                let Grad::Tuple(incs) = inc else {
                    return Err(Error::Invariant(
                        "structural add requires literal tuple structure on the increment",
                    ));
                };
                if members.len() != incs.len() {
                    return Err(Error::Invariant("structural add arity mismatch"));
                }
                let merged = members
                    .into_vec()
                    .into_iter()
                    .zip(incs.into_vec())
                    .map(|(b, i)| self.nested_add(b, i))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Grad::Tuple(merged.into()))
            }
            // first update: adding into zero is the increment itself
            Grad::Zero(_) => Ok(inc),
            base => {
                let v = self.name(inc)?;
                Ok(Grad::add(base, Grad::Var(v)))
            }
        }
    }

    /// Positional fold for a projection binding `v = x[k]`: only slot `k` of
    /// `x`'s adjoint changes, and the tuple is rebuilt around it.
    fn fold_member(&mut self, x: id::Var, k: id::Member, a: id::Var) -> Result<(), Error> {
        let base = match self.adjoint[x.var()].take() {
            Some(g) => g,
            None => skeleton(&self.types, self.ty_of(x)),
        };
        let Grad::Tuple(members) = base else {
            return Err(Error::Invariant("tuple projection into a non-tuple adjoint"));
        };
        let mut members = members.into_vec();
        let i = k.member();
        if i >= members.len() {
            return Err(Error::Invariant("projection member out of range"));
        }
        let prev = std::mem::replace(&mut members[i], Grad::Var(a));
        members[i] = self.nested_add(prev, Grad::Var(a))?;
        self.adjoint[x.var()] = Some(Grad::Tuple(members.into()));
        Ok(())
    }

    fn call(
        &mut self,
        result: id::Var,
        out_grad: id::Var,
        op: Op,
        args: &[id::Var],
        attrs: &Attrs,
    ) -> Result<(), Error> {
        let rule = self.rules.get(op).ok_or(Error::UnknownGradient(op))?;
        let vjp = Vjp {
            op,
            args,
            attrs,
            result,
            out_grad,
            types: &self.types,
            vars: &self.vars,
        };
        let partials = rule(&vjp);
        if partials.len() != args.len() {
            return Err(Error::Invariant(
                "gradient rule returned the wrong number of partials",
            ));
        }
        #[cfg(debug_assertions)]
        self.check_partials(op, args, &partials)?;
        for (&x, p) in args.iter().zip(partials) {
            self.accumulate(x, p)?;
        }
        Ok(())
    }

    #[cfg(debug_assertions)]
    fn check_partials(&mut self, op: Op, args: &[id::Var], partials: &[Grad]) -> Result<(), Error> {
        for (i, (&x, p)) in args.iter().zip(partials).enumerate() {
            match self.grad_ty(p) {
                Ok(t) if t == self.ty_of(x) => {}
                _ => return Err(Error::GradientShapeMismatch(op, i)),
            }
        }
        Ok(())
    }

    #[cfg(debug_assertions)]
    fn grad_ty(&mut self, g: &Grad) -> Result<id::Ty, Error> {
        match g {
            &Grad::Var(x) => Ok(self.ty_of(x)),
            &Grad::Zero(t) => Ok(t),
            Grad::Tuple(members) => {
                let ts = members
                    .iter()
                    .map(|m| self.grad_ty(m))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.types.tuple(ts))
            }
            Grad::Member { tuple, member } => {
                let t = self.grad_ty(tuple)?;
                match self.types.get(t) {
                    Ty::Tuple { members } => members
                        .get(member.member())
                        .copied()
                        .ok_or(Error::Invariant("projection member out of range")),
                    Ty::Tensor { .. } => {
                        Err(Error::Invariant("projection from a non-tuple adjoint"))
                    }
                }
            }
            Grad::Call { op, args, attrs } => {
                let ts = args
                    .iter()
                    .map(|a| self.grad_ty(a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.ops
                    .result(&mut self.types, *op, &ts, attrs)
                    .map_err(Error::Emit)
            }
        }
    }

    /// Walks the forward bindings in reverse, naming each relevant variable's
    /// adjoint and propagating contributions to the variables it was computed
    /// from. A variable with no accumulated adjoint is skipped outright.
    fn backward(&mut self) -> Result<(), Error> {
        let body = self.old_body;
        for instr in body.iter().rev() {
            let var = instr.var;
            let Some(g) = self.adjoint[var.var()].clone() else {
                continue;
            };
            let a = self.emit_adjoint(var, g.clone())?;
            match &instr.expr {
                Expr::Const { .. } => {}
                // the increment here is the accumulated expression, not the
                // named variable: a tuple-typed adjoint must stay literal for
                // the structural merge into `x`
                &Expr::Var { var: x } => self.accumulate(x, g)?,
                Expr::Tuple { members } => {
                    for (i, &x) in members.iter().enumerate() {
                        self.accumulate(
                            x,
                            Grad::Member {
                                tuple: Box::new(Grad::Var(a)),
                                member: id::member(i),
                            },
                        )?;
                    }
                }
                &Expr::Member { tuple, member } => self.fold_member(tuple, member, a)?,
                Expr::Call { op, args, attrs } => self.call(var, a, *op, args, attrs)?,
            }
        }
        Ok(())
    }
}

/// Differentiates `module[name]`, returning a module extended with a new
/// function named `<name>_adjoint`.
///
/// The new function reproduces the forward computation and returns
/// `(original_return, (d_p1, …, d_pn))` for the parameters in `require`
/// (all parameters, in declaration order, when `None`). The input module is
/// never mutated.
pub fn differentiate<O: Opset>(
    module: &Module,
    name: &str,
    require: Option<&[id::Var]>,
    rules: &Registry,
    ops: &O,
) -> Result<Module, Error> {
    let f = module
        .get(name)
        .ok_or_else(|| Error::NotAFunction(name.to_string()))?;

    // single straight-line region in single-assignment form
    let mut defined = vec![false; f.vars.len()];
    for &p in f.params.iter() {
        match defined.get_mut(p.var()) {
            Some(d) if !*d => *d = true,
            _ => return Err(Error::UnsupportedBody(0)),
        }
    }
    for (i, Instr { var, expr }) in f.body.iter().enumerate() {
        let ok = match expr {
            Expr::Const { .. } => true,
            Expr::Var { var: x } => defined.get(x.var()).copied().unwrap_or(false),
            Expr::Tuple { members } => members
                .iter()
                .all(|&x| defined.get(x.var()).copied().unwrap_or(false)),
            Expr::Member { tuple, .. } => defined.get(tuple.var()).copied().unwrap_or(false),
            Expr::Call { args, .. } => args
                .iter()
                .all(|&x| defined.get(x.var()).copied().unwrap_or(false)),
        };
        if !ok {
            return Err(Error::UnsupportedBody(i));
        }
        match defined.get_mut(var.var()) {
            Some(d) if !*d => *d = true,
            _ => return Err(Error::UnsupportedBody(i)),
        }
    }
    if !defined.get(f.ret.var()).copied().unwrap_or(false) {
        return Err(Error::UnsupportedBody(f.body.len()));
    }

    let ret_dtype = match &f.types[f.vars[f.ret.var()].ty()] {
        Ty::Tensor { shape, dtype } if shape.is_empty() && dtype.is_float() => *dtype,
        _ => return Err(Error::NonScalarReturn),
    };

    let require: Vec<id::Var> = match require {
        Some(rs) => rs.to_vec(),
        None => f.params.to_vec(),
    };
    for &p in require.iter() {
        if !f.params.contains(&p) || !has_float_leaf(&f.types, f.vars[p.var()]) {
            return Err(Error::BadRequireGrads(p));
        }
    }

    let mut types = Types::new();
    let mapping = types.import(&f.types);
    let vars: Vec<id::Ty> = f.vars.iter().map(|&t| mapping[t.ty()]).collect();

    let mut rev = Reverse {
        ops,
        rules,
        old_body: &f.body,
        types,
        vars,
        body: f.body.to_vec(),
        adjoint: vec![None; f.vars.len()],
        named: vec![None; f.vars.len()],
        memo: IndexMap::new(),
    };

    // seed: the return value's adjoint with respect to itself
    rev.adjoint[f.ret.var()] = Some(Grad::Call {
        op: op::ONES,
        args: [].into(),
        attrs: Attrs::filled(&[], ret_dtype),
    });

    rev.backward()?;

    // named adjoints for the requested parameters; a parameter the return
    // never depended on gets its structural zero
    let mut grads = vec![];
    for &p in require.iter() {
        if let Some(a) = rev.named[p.var()] {
            grads.push(a);
            continue;
        }
        let g = match rev.adjoint[p.var()].clone() {
            Some(g) => g,
            None => skeleton(&rev.types, rev.ty_of(p)),
        };
        grads.push(rev.emit_adjoint(p, g)?);
    }

    let ts: Vec<id::Ty> = grads.iter().map(|&v| rev.ty_of(v)).collect();
    let inner_t = rev.types.tuple(ts);
    let inner = rev.emit(
        inner_t,
        Expr::Tuple {
            members: grads.into(),
        },
    );
    let ret_t = rev.types.tuple(vec![rev.ty_of(f.ret), inner_t]);
    let ret = rev.emit(
        ret_t,
        Expr::Tuple {
            members: Box::new([f.ret, inner]),
        },
    );

    let g = Function {
        types: rev.types.finish(),
        vars: rev.vars.into(),
        params: f.params.clone(),
        ret,
        body: rev.body.into(),
    };
    let mut out = module.clone();
    out.insert(format!("{name}_adjoint"), g);
    Ok(out)
}
