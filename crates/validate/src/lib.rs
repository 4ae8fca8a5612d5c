use sorrel::{id, Expr, Function, Instr, Module, OpError, Opset, Ty, Types};

#[derive(Debug, thiserror::Error)]
pub enum InstrError {
    #[error("variable ID is out of range")]
    InvalidVar,

    #[error("variable was already declared")]
    Redeclare,

    #[error("constant type is not a scalar tensor")]
    ConstType,

    #[error("variable ID for alias is not in scope")]
    AliasInvalidVar,

    #[error("alias type does not match its variable")]
    AliasType,

    #[error("type is not a tuple")]
    TupleType,

    #[error("tuple has the wrong number of members")]
    TupleSize,

    #[error("variable ID for tuple member {} is not in scope", .0.member())]
    TupleInvalidMember(id::Member),

    #[error("tuple member {} does not match its type", .0.member())]
    TupleMemberType(id::Member),

    #[error("tuple variable ID for member instruction is not in scope")]
    MemberInvalidTuple,

    #[error("tuple variable for member instruction is not a tuple")]
    MemberNotTuple,

    #[error("member ID for member instruction is out of range")]
    MemberInvalidMember,

    #[error("member does not match its type")]
    MemberType,

    #[error("variable ID for argument {0} is not in scope")]
    CallInvalidArg(usize),

    #[error("operator rejected the call")]
    CallOp(#[source] OpError),

    #[error("call result does not match the operator's result type")]
    CallType,
}

fn check(p: bool, e: InstrError) -> Result<(), InstrError> {
    if p {
        Ok(())
    } else {
        Err(e)
    }
}

#[derive(Clone, Copy)]
enum Scope {
    Undefined,
    Defined,
}

struct Validator<'a, O> {
    ops: &'a O,
    f: &'a Function,
    /// Deduplicated types, shared with operator inference so result types
    /// compare by ID.
    types: Types,
    /// Indices from `self.f.types` into `self.types`.
    mapping: Vec<id::Ty>,
    /// Same length as `self.f.vars`.
    vars: Vec<Scope>,
}

impl<O: Opset> Validator<'_, O> {
    fn var_ty_id(&self, x: id::Var) -> id::Ty {
        self.mapping[self.f.vars[x.var()].ty()]
    }

    fn get_ty_id(&self, x: id::Var) -> Option<id::Ty> {
        match self.vars.get(x.var()) {
            Some(Scope::Defined) => Some(self.var_ty_id(x)),
            _ => None,
        }
    }

    fn instr(&mut self, instr: &Instr) -> Result<(), InstrError> {
        use InstrError::*;

        let Instr { var, expr } = instr;
        match self.vars.get(var.var()) {
            None => return Err(InvalidVar),
            Some(Scope::Defined) => return Err(Redeclare),
            Some(Scope::Undefined) => {} // will set to `Defined` after processing `expr`
        }
        let t = self.var_ty_id(*var);

        match expr {
            Expr::Const { .. } => match self.types.get(t) {
                Ty::Tensor { shape, .. } => check(shape.is_empty(), ConstType),
                Ty::Tuple { .. } => Err(ConstType),
            },
            &Expr::Var { var: x } => {
                let tx = self.get_ty_id(x).ok_or(AliasInvalidVar)?;
                check(tx == t, AliasType)
            }
            Expr::Tuple { members } => match self.types.get(t) {
                Ty::Tuple { members: types } => {
                    if members.len() != types.len() {
                        return Err(TupleSize);
                    }
                    for (i, (&x, &xt)) in members.iter().zip(types.iter()).enumerate() {
                        let id = id::member(i);
                        match self.get_ty_id(x) {
                            Some(tx) => check(tx == xt, TupleMemberType(id))?,
                            None => return Err(TupleInvalidMember(id)),
                        }
                    }
                    Ok(())
                }
                Ty::Tensor { .. } => Err(TupleType),
            },
            &Expr::Member { tuple, member } => {
                let tup = self.get_ty_id(tuple).ok_or(MemberInvalidTuple)?;
                match self.types.get(tup) {
                    Ty::Tuple { members } => match members.get(member.member()) {
                        Some(&mem) => check(t == mem, MemberType),
                        None => Err(MemberInvalidMember),
                    },
                    Ty::Tensor { .. } => Err(MemberNotTuple),
                }
            }
            Expr::Call { op, args, attrs } => {
                let mut arg_tys = vec![];
                for (i, &x) in args.iter().enumerate() {
                    arg_tys.push(self.get_ty_id(x).ok_or(CallInvalidArg(i))?);
                }
                let result = self
                    .ops
                    .result(&mut self.types, *op, &arg_tys, attrs)
                    .map_err(CallOp)?;
                check(result == t, CallType)
            }
        }?;

        self.vars[var.var()] = Scope::Defined;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("member {} type ID for type {} is not strictly less", .1.member(), .0.ty())]
    InvalidMember(id::Ty, id::Member),

    #[error("type ID for variable {} is out of range", .0.var())]
    InvalidVar(id::Var),

    #[error("variable ID for parameter {0} is out of range")]
    InvalidParam(usize),

    #[error("parameter {0} is declared twice")]
    RedeclareParam(usize),

    #[error("instruction {0} is invalid")]
    InvalidBody(usize, #[source] InstrError),

    #[error("return variable ID is not in scope")]
    InvalidRet,
}

/// Validate `f` against the operator set `ops`.
pub fn validate(f: &Function, ops: &impl Opset) -> Result<(), Error> {
    for (i, ty) in f.types.iter().enumerate() {
        let t = id::ty(i);
        if let Ty::Tuple { members } = ty {
            for (j, &member) in members.iter().enumerate() {
                if member >= t {
                    return Err(Error::InvalidMember(t, id::member(j)));
                }
            }
        }
    }

    let mut types = Types::new();
    let mapping = types.import(&f.types);

    for (i, ty) in f.vars.iter().enumerate() {
        if ty.ty() >= f.types.len() {
            return Err(Error::InvalidVar(id::var(i)));
        }
    }

    let mut vars = vec![Scope::Undefined; f.vars.len()];
    for (i, param) in f.params.iter().enumerate() {
        match vars.get_mut(param.var()) {
            None => return Err(Error::InvalidParam(i)),
            Some(Scope::Defined) => return Err(Error::RedeclareParam(i)),
            Some(scope) => {
                *scope = Scope::Defined;
            }
        }
    }

    let mut validator = Validator {
        ops,
        f,
        types,
        mapping,
        vars,
    };
    for (i, instr) in f.body.iter().enumerate() {
        validator
            .instr(instr)
            .map_err(|e| Error::InvalidBody(i, e))?;
    }

    match validator.vars.get(f.ret.var()) {
        Some(Scope::Defined) => Ok(()),
        _ => Err(Error::InvalidRet),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("function `{0}` is invalid")]
    Function(String, #[source] Error),
}

/// Validate every function in `m`.
pub fn validate_module(m: &Module, ops: &impl Opset) -> Result<(), ModuleError> {
    for (name, f) in m.funcs.iter() {
        validate(f, ops).map_err(|e| ModuleError::Function(name.clone(), e))?;
    }
    Ok(())
}
