use crate::{id, DType, Expr, Instr, Types};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("return variable ID is out of range")]
    InvalidRet,
}

/// A function definition under construction. Not guaranteed to be well-formed.
#[derive(Debug, Default)]
pub struct Function {
    types: Types,
    vars: Vec<id::Ty>,
    params: Vec<id::Var>,
    body: Vec<Instr>,
}

impl Function {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tensor(&mut self, shape: &[usize], dtype: DType) -> id::Ty {
        self.types.tensor(shape, dtype)
    }

    pub fn scalar(&mut self, dtype: DType) -> id::Ty {
        self.types.scalar(dtype)
    }

    pub fn tuple(&mut self, members: impl Into<Box<[id::Ty]>>) -> id::Ty {
        self.types.tuple(members)
    }

    fn newvar(&mut self, t: id::Ty) -> id::Var {
        let var = id::var(self.vars.len());
        self.vars.push(t);
        var
    }

    pub fn param(&mut self, t: id::Ty) -> id::Var {
        let var = self.newvar(t);
        self.params.push(var);
        var
    }

    pub fn bind(&mut self, t: id::Ty, expr: Expr) -> id::Var {
        let var = self.newvar(t);
        self.body.push(Instr { var, expr });
        var
    }

    pub fn check(self, ret: id::Var) -> Result<crate::Function, Error> {
        if ret.var() >= self.vars.len() {
            return Err(Error::InvalidRet);
        }
        Ok(crate::Function {
            types: self.types.finish(),
            vars: self.vars.into(),
            params: self.params.into(),
            ret,
            body: self.body.into(),
        })
    }
}
