use proptest::prelude::*;
use sorrel::{build, id, Attrs, DType, Expr, Module, Op};
use sorrel_grad::differentiate;
use sorrel_interp::{interp, Tensor, Val};
use sorrel_ops::{registry, Builtins, ADD, EXP, MATMUL, MUL, SUM};

fn call(op: Op, args: &[id::Var]) -> Expr {
    Expr::Call {
        op,
        args: args.into(),
        attrs: Attrs::default(),
    }
}

fn scalar_of(v: &Val) -> f64 {
    match v {
        Val::Tensor(t) => t.data[0],
        Val::Tuple(_) => panic!("expected a scalar"),
    }
}

fn tensor_of(v: &Val) -> &Tensor {
    match v {
        Val::Tensor(t) => t,
        Val::Tuple(_) => panic!("expected a tensor"),
    }
}

/// Evaluates the adjoint of `name` and splits the result into the primal
/// value and the per-parameter gradients.
fn run(m: &Module, name: &str, inputs: Vec<Val>) -> (Val, Vec<Val>) {
    let out = differentiate(m, name, None, &registry(), &Builtins).unwrap();
    let g = out.get(&format!("{name}_adjoint")).unwrap();
    let Val::Tuple(pair) = interp(g, inputs).unwrap() else {
        panic!("expected (primal, grads)")
    };
    let Val::Tuple(grads) = &pair[1] else {
        panic!("expected the gradient tuple")
    };
    (pair[0].clone(), grads.to_vec())
}

/// Central finite differences of `name` with respect to the elements of the
/// tensor parameter at position `p`.
fn finite_diff(m: &Module, name: &str, inputs: &[Val], p: usize) -> Vec<f64> {
    let f = m.get(name).unwrap();
    let base = tensor_of(&inputs[p]).clone();
    let h = 1e-5;
    (0..base.data.len())
        .map(|i| {
            let nudge = |delta: f64| {
                let mut t = base.clone();
                t.data[i] += delta;
                let mut inputs = inputs.to_vec();
                inputs[p] = Val::tensor(t);
                scalar_of(&interp(f, inputs).unwrap())
            };
            (nudge(h) - nudge(-h)) / (2. * h)
        })
        .collect()
}

fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < tol, "{a} vs {e}");
    }
}

/// `f(x, y) = sum(mul(x, y))` over 2x2 tensors.
fn mul_sum() -> Module {
    let mut b = build::Function::new();
    let t = b.tensor(&[2, 2], DType::F64);
    let s = b.scalar(DType::F64);
    let x = b.param(t);
    let y = b.param(t);
    let l = b.bind(t, call(MUL, &[x, y]));
    let g = b.bind(s, call(SUM, &[l]));
    let mut m = Module::new();
    m.insert("main", b.check(g).unwrap());
    m
}

#[test]
fn test_mul_gradients() {
    let m = mul_sum();
    let x = Val::tensor(Tensor::new(&[2, 2], vec![1., 2., 3., 4.]));
    let y = Val::tensor(Tensor::new(&[2, 2], vec![5., 6., 7., 8.]));
    let (primal, grads) = run(&m, "main", vec![x.clone(), y.clone()]);
    assert_eq!(scalar_of(&primal), 5. + 12. + 21. + 32.);
    // d(sum(x*y))/dx = y and vice versa
    assert_eq!(tensor_of(&grads[0]).data, tensor_of(&y).data);
    assert_eq!(tensor_of(&grads[1]).data, tensor_of(&x).data);

    let inputs = [x, y];
    for p in 0..2 {
        assert_close(
            &tensor_of(&grads[p]).data,
            &finite_diff(&m, "main", &inputs, p),
            1e-4,
        );
    }
}

#[test]
fn test_exp_gradient() {
    let mut b = build::Function::new();
    let t = b.tensor(&[3], DType::F64);
    let s = b.scalar(DType::F64);
    let x = b.param(t);
    let e = b.bind(t, call(EXP, &[x]));
    let g = b.bind(s, call(SUM, &[e]));
    let mut m = Module::new();
    m.insert("main", b.check(g).unwrap());

    let x = Val::tensor(Tensor::new(&[3], vec![0., 0.5, -1.]));
    let (_, grads) = run(&m, "main", vec![x.clone()]);
    let expected: Vec<f64> = tensor_of(&x).data.iter().map(|v| v.exp()).collect();
    assert_close(&tensor_of(&grads[0]).data, &expected, 1e-12);
    assert_close(
        &tensor_of(&grads[0]).data,
        &finite_diff(&m, "main", &[x], 0),
        1e-4,
    );
}

#[test]
fn test_matmul_gradients() {
    let mut b = build::Function::new();
    let ta = b.tensor(&[2, 3], DType::F64);
    let tb = b.tensor(&[3, 2], DType::F64);
    let tc = b.tensor(&[2, 2], DType::F64);
    let s = b.scalar(DType::F64);
    let a = b.param(ta);
    let bb = b.param(tb);
    let c = b.bind(tc, call(MATMUL, &[a, bb]));
    let g = b.bind(s, call(SUM, &[c]));
    let mut m = Module::new();
    m.insert("main", b.check(g).unwrap());

    let a = Val::tensor(Tensor::new(&[2, 3], vec![1., -2., 3., 0.5, 2., -1.]));
    let bv = Val::tensor(Tensor::new(&[3, 2], vec![2., 1., 0., -1., 1., 3.]));
    let (_, grads) = run(&m, "main", vec![a.clone(), bv.clone()]);
    let inputs = [a, bv];
    for p in 0..2 {
        assert_close(
            &tensor_of(&grads[p]).data,
            &finite_diff(&m, "main", &inputs, p),
            1e-4,
        );
    }
}

#[test]
fn test_tuple_parameter_gradient() {
    // f(t) = sum(add(t[0], t[1]))
    let mut b = build::Function::new();
    let t = b.tensor(&[2], DType::F64);
    let s = b.scalar(DType::F64);
    let pair = b.tuple([t, t]);
    let tp = b.param(pair);
    let u = b.bind(
        t,
        Expr::Member {
            tuple: tp,
            member: id::member(0),
        },
    );
    let v = b.bind(
        t,
        Expr::Member {
            tuple: tp,
            member: id::member(1),
        },
    );
    let l = b.bind(t, call(ADD, &[u, v]));
    let g = b.bind(s, call(SUM, &[l]));
    let mut m = Module::new();
    m.insert("main", b.check(g).unwrap());

    let arg = Val::tuple(vec![
        Val::tensor(Tensor::new(&[2], vec![1., 2.])),
        Val::tensor(Tensor::new(&[2], vec![3., 4.])),
    ]);
    let (primal, grads) = run(&m, "main", vec![arg]);
    assert_eq!(scalar_of(&primal), 10.);
    let Val::Tuple(parts) = &grads[0] else {
        panic!("expected a tuple adjoint")
    };
    assert_eq!(tensor_of(&parts[0]).data, vec![1., 1.]);
    assert_eq!(tensor_of(&parts[1]).data, vec![1., 1.]);
}

#[test]
fn test_shared_variable_gradient() {
    // l1 = x; l2 = add(l1, x); l3 = add(l2, l1); sum(l3) computes sum(3x)
    let mut b = build::Function::new();
    let t = b.tensor(&[3], DType::F64);
    let s = b.scalar(DType::F64);
    let x = b.param(t);
    let l1 = b.bind(t, Expr::Var { var: x });
    let l2 = b.bind(t, call(ADD, &[l1, x]));
    let l3 = b.bind(t, call(ADD, &[l2, l1]));
    let g = b.bind(s, call(SUM, &[l3]));
    let mut m = Module::new();
    m.insert("main", b.check(g).unwrap());

    let x = Val::tensor(Tensor::new(&[3], vec![0.1, -0.2, 0.3]));
    let (_, grads) = run(&m, "main", vec![x]);
    assert_eq!(tensor_of(&grads[0]).data, vec![3., 3., 3.]);
}

proptest! {
    #[test]
    fn prop_mul_gradients_match_finite_differences(
        xs in proptest::collection::vec(-2.0f64..2.0, 4),
        ys in proptest::collection::vec(-2.0f64..2.0, 4),
    ) {
        let m = mul_sum();
        let x = Val::tensor(Tensor::new(&[2, 2], xs));
        let y = Val::tensor(Tensor::new(&[2, 2], ys));
        let (_, grads) = run(&m, "main", vec![x.clone(), y.clone()]);
        let inputs = [x, y];
        for p in 0..2 {
            let fd = finite_diff(&m, "main", &inputs, p);
            for (a, e) in tensor_of(&grads[p]).data.iter().zip(&fd) {
                prop_assert!((a - e).abs() < 1e-4, "{} vs {}", a, e);
            }
        }
    }
}
