use clap::Parser;
use sorrel::{build, id, Attrs, DType, Expr, Module};
use sorrel_ops::{registry, Builtins, ADD, SUM};

/// Differentiate a demo function and print the result.
#[derive(Parser)]
struct Args {
    /// Comma-separated parameter positions to differentiate with respect to
    /// (all parameters when omitted).
    #[arg(long)]
    grads: Option<String>,
}

fn main() {
    let args = Args::parse();

    // f(x, y) = sum(add(x, y)) over 5x5 float32 tensors
    let mut b = build::Function::new();
    let t = b.tensor(&[5, 5], DType::F32);
    let s = b.scalar(DType::F32);
    let x = b.param(t);
    let y = b.param(t);
    let l = b.bind(
        t,
        Expr::Call {
            op: ADD,
            args: Box::new([x, y]),
            attrs: Attrs::default(),
        },
    );
    let g = b.bind(
        s,
        Expr::Call {
            op: SUM,
            args: Box::new([l]),
            attrs: Attrs::default(),
        },
    );
    let params = [x, y];
    let mut module = Module::new();
    module.insert("main", b.check(g).unwrap());

    let require: Option<Vec<id::Var>> = args.grads.map(|grads| {
        grads
            .split(',')
            .map(|p| params[p.trim().parse::<usize>().expect("parameter position")])
            .collect()
    });
    let out = sorrel_grad::differentiate(
        &module,
        "main",
        require.as_deref(),
        &registry(),
        &Builtins,
    )
    .unwrap();
    print!("{}", sorrel_pprint::module(&out));
}
