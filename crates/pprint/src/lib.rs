use sorrel::{Attrs, DType, Expr, Function, Instr, Module, Ty};
use std::fmt;

fn dtype(d: DType) -> &'static str {
    match d {
        DType::F32 => "f32",
        DType::F64 => "f64",
        DType::I32 => "i32",
        DType::Bool => "bool",
    }
}

fn write_shape(f: &mut fmt::Formatter<'_>, shape: &[usize]) -> fmt::Result {
    write!(f, "[")?;
    let mut first = true;
    for dim in shape {
        if first {
            first = false;
        } else {
            write!(f, " x ")?;
        }
        write!(f, "{dim}")?;
    }
    write!(f, "]")
}

fn write_elems(
    f: &mut fmt::Formatter<'_>,
    prefix: char,
    items: impl Iterator<Item = usize>,
) -> fmt::Result {
    let mut first = true;
    for item in items {
        if first {
            first = false;
        } else {
            write!(f, ", ")?;
        }
        write!(f, "{}{}", prefix, item)?;
    }
    Ok(())
}

fn write_types(f: &mut fmt::Formatter<'_>, types: &[Ty]) -> fmt::Result {
    for (i, ty) in types.iter().enumerate() {
        write!(f, "  type T{i} = ")?;
        match ty {
            Ty::Tensor { shape, dtype: d } => {
                write!(f, "{}", dtype(*d))?;
                write_shape(f, shape)?;
                writeln!(f)?;
            }
            Ty::Tuple { members } => {
                write!(f, "(")?;
                write_elems(f, 'T', members.iter().map(|member| member.ty()))?;
                writeln!(f, ")")?;
            }
        }
    }
    Ok(())
}

fn write_attrs(f: &mut fmt::Formatter<'_>, attrs: &Attrs) -> fmt::Result {
    if attrs.shape.is_none() && attrs.dtype.is_none() {
        return Ok(());
    }
    write!(f, "{{")?;
    let mut first = true;
    if let Some(shape) = &attrs.shape {
        write!(f, "shape = ")?;
        write_shape(f, shape)?;
        first = false;
    }
    if let Some(d) = attrs.dtype {
        if !first {
            write!(f, ", ")?;
        }
        write!(f, "dtype = {}", dtype(d))?;
    }
    write!(f, "}}")
}

fn write_instr(f: &mut fmt::Formatter<'_>, def: &Function, instr: &Instr) -> fmt::Result {
    let x = instr.var.var();
    write!(f, "    let x{}: T{} = ", x, def.vars[x].ty())?;
    match &instr.expr {
        Expr::Const { val } => writeln!(f, "{val}")?,
        Expr::Var { var } => writeln!(f, "x{}", var.var())?,
        Expr::Tuple { members } => {
            write!(f, "(")?;
            write_elems(f, 'x', members.iter().map(|member| member.var()))?;
            writeln!(f, ")")?;
        }
        Expr::Member { tuple, member } => writeln!(f, "x{}[{}]", tuple.var(), member.member())?,
        Expr::Call { op, args, attrs } => {
            write!(f, "{op}")?;
            write_attrs(f, attrs)?;
            write!(f, "(")?;
            write_elems(f, 'x', args.iter().map(|arg| arg.var()))?;
            writeln!(f, ")")?;
        }
    }
    Ok(())
}

pub fn write_function(f: &mut fmt::Formatter<'_>, def: &Function) -> fmt::Result {
    writeln!(f, "{{")?;
    write_types(f, &def.types)?;
    write!(f, "  (")?;
    let mut first = true;
    for param in def.params.iter() {
        if first {
            first = false;
        } else {
            write!(f, ", ")?;
        }
        write!(f, "x{}: T{}", param.var(), def.vars[param.var()].ty())?;
    }
    writeln!(f, ") -> T{} {{", def.vars[def.ret.var()].ty())?;
    for instr in def.body.iter() {
        write_instr(f, def, instr)?;
    }
    writeln!(f, "    x{}", def.ret.var())?;
    writeln!(f, "  }}")?;
    writeln!(f, "}}")
}

pub fn write_module(f: &mut fmt::Formatter<'_>, m: &Module) -> fmt::Result {
    for (name, def) in m.funcs.iter() {
        write!(f, "fn {name} = ")?;
        write_function(f, def)?;
        writeln!(f)?;
    }
    Ok(())
}

struct FunctionDisplay<'a>(&'a Function);

impl fmt::Display for FunctionDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_function(f, self.0)
    }
}

struct ModuleDisplay<'a>(&'a Module);

impl fmt::Display for ModuleDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_module(f, self.0)
    }
}

pub fn function(def: &Function) -> String {
    FunctionDisplay(def).to_string()
}

pub fn module(m: &Module) -> String {
    ModuleDisplay(m).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sorrel::{build, id, op, DType};

    #[test]
    fn test_function_rendering() {
        let mut b = build::Function::new();
        let t = b.tensor(&[2, 2], DType::F32);
        let s = b.scalar(DType::F32);
        let x = b.param(t);
        let y = b.bind(
            s,
            Expr::Call {
                op: sorrel::Op::new("sum"),
                args: Box::new([x]),
                attrs: Attrs::default(),
            },
        );
        let z = b.bind(
            s,
            Expr::Call {
                op: op::ONES,
                args: Box::new([]),
                attrs: Attrs::filled(&[], DType::F32),
            },
        );
        let pair = b.tuple([s, s]);
        let w = b.bind(
            pair,
            Expr::Tuple {
                members: Box::new([y, z]),
            },
        );
        let m = b.bind(
            s,
            Expr::Member {
                tuple: w,
                member: id::member(0),
            },
        );
        let out = function(&b.check(m).unwrap());
        assert!(out.contains("type T0 = f32[2 x 2]"));
        assert!(out.contains("let x1: T1 = sum(x0)"));
        assert!(out.contains("ones{shape = [], dtype = f32}()"));
        assert!(out.contains("let x3: T2 = (x1, x2)"));
        assert!(out.contains("let x4: T1 = x3[0]"));
    }
}
