use std::sync::Arc;

use tensor_ir::graph::{Module, PlaceholderId, VariableId, Visibility};
use tensor_ir::runtime::{CompilationMode, Context, ExecutionEngine};
use tensor_ir::tensor::{ElemKind, Tensor, TensorData, TensorType};
use tensor_ir::train::TrainingConfig;
use tensor_ir::Error;
use tensor_ir_backend_ref_cpu::CpuBackend;

fn engine(module: Module) -> ExecutionEngine<CpuBackend> {
    ExecutionEngine::with_module(module, Arc::new(CpuBackend::new()))
}

fn floats(tensor: &Tensor) -> Vec<f32> {
    match tensor.data() {
        TensorData::Float(values) => values.clone(),
        TensorData::Index(_) => panic!("expected a float tensor"),
    }
}

fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tol, "element {idx}: {a} vs {e}");
    }
}

#[test]
fn batched_matmul_with_shared_rhs() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let lhs = module.create_placeholder(ElemKind::Float, &[1, 2, 3], "lhs", false);
    let rhs = module.create_placeholder(ElemKind::Float, &[3, 2], "rhs", false);
    let main = module.create_function("main");
    let out = {
        let mut builder = module.function_mut(main)?;
        let product = builder.create_batched_matmul("matmul", lhs, rhs)?;
        builder.create_save_output("result", product)?
    };

    let mut engine = engine(module);
    let key = engine.compile(CompilationMode::Infer, main, None)?;
    let mut ctx = Context::new();
    ctx.bind(lhs, Tensor::from_f32(&[1, 2, 3], vec![1., 2., 3., 4., 5., 6.])?);
    ctx.bind(rhs, Tensor::from_f32(&[3, 2], vec![7., 8., 9., 10., 11., 12.])?);
    ctx.allocate(engine.module(), out)?;

    engine.run(&key, &mut ctx)?;
    let first = ctx.get(out).expect("output bound").clone();
    assert_eq!(first.dims(), &[1, 2, 2]);
    assert_eq!(floats(&first), vec![58., 64., 139., 154.]);

    // Inference leaves inputs and weights alone, so a second run agrees bit for bit.
    engine.run(&key, &mut ctx)?;
    assert!(ctx.get(out).expect("output bound").bitwise_eq(&first));
    Ok(())
}

#[test]
fn batched_reduce_add_sums_the_leading_axis() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let batch = module.create_placeholder(ElemKind::Float, &[2, 4], "batch", false);
    let main = module.create_function("main");
    let out = {
        let mut builder = module.function_mut(main)?;
        let reduced = builder.create_batched_reduce_add("reduce", batch)?;
        builder.create_save_output("result", reduced)?
    };

    let mut engine = engine(module);
    let key = engine.compile(CompilationMode::Infer, main, None)?;
    let mut ctx = Context::new();
    ctx.bind(
        batch,
        Tensor::from_f32(&[2, 4], vec![10., 20., 30., 40., 1., 2., 3., 4.])?,
    );
    ctx.allocate(engine.module(), out)?;
    engine.run(&key, &mut ctx)?;

    assert_eq!(floats(ctx.get(out).expect("output bound")), vec![11., 22., 33., 44.]);
    Ok(())
}

#[test]
fn batched_add_broadcasts_the_slice() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let batch = module.create_placeholder(ElemKind::Float, &[2, 3, 3], "batch", false);
    let main = module.create_function("main");
    let out = {
        let mut builder = module.function_mut(main)?;
        let slice = builder.create_splat("slice", TensorType::float(&[3, 3]), -1.0)?;
        let sum = builder.create_batched_add("add", batch, slice)?;
        builder.create_save_output("result", sum)?
    };

    let mut engine = engine(module);
    let key = engine.compile(CompilationMode::Infer, main, None)?;
    let mut ctx = Context::new();
    let values: Vec<f32> = (0..18).map(|i| 11.0 - i as f32).collect();
    ctx.bind(batch, Tensor::from_f32(&[2, 3, 3], values)?);
    ctx.allocate(engine.module(), out)?;
    engine.run(&key, &mut ctx)?;

    let result = floats(ctx.get(out).expect("output bound"));
    assert_eq!(&result[..4], &[10., 9., 8., 7.]);
    let expected: Vec<f32> = (0..18).map(|i| 10.0 - i as f32).collect();
    assert_eq!(result, expected);
    Ok(())
}

#[test]
fn training_updates_persist_across_runs() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let w = module.create_variable_from(
        "w",
        Tensor::from_f32(&[1], vec![1.0])?,
        Visibility::Private,
        true,
    );
    let x = module.create_placeholder(ElemKind::Float, &[1], "x", false);
    let expected = module.create_placeholder(ElemKind::Float, &[1], "expected", false);
    let main = module.create_function("main");
    let out = {
        let mut builder = module.function_mut(main)?;
        let y = builder.create_mul("y", w, x)?;
        let reg = builder.create_regression("reg", y, expected)?;
        builder.create_save_output("out", reg)?
    };

    let mut engine = engine(module);
    let config = TrainingConfig {
        momentum: 0.5,
        ..TrainingConfig::new(0.1)
    };
    let key = engine.compile(CompilationMode::Train, main, Some(&config))?;
    assert_eq!(key, "main_grad");

    let mut ctx = Context::new();
    ctx.bind(x, Tensor::from_f32(&[1], vec![1.0])?);
    ctx.bind(expected, Tensor::from_f32(&[1], vec![0.0])?);
    ctx.allocate(engine.module(), out)?;

    // grad = w; gsum = 0.5 * gsum - 0.1 * grad; w += gsum
    engine.run(&key, &mut ctx)?;
    assert_close(&floats(engine.module().variable(w)?.payload()), &[0.9], 1e-6);
    engine.run(&key, &mut ctx)?;
    assert_close(&floats(engine.module().variable(w)?.payload()), &[0.76], 1e-6);
    Ok(())
}

#[test]
fn trainable_placeholders_are_updated_in_the_context() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let p = module.create_placeholder(ElemKind::Float, &[2], "p", true);
    let target = module.create_placeholder(ElemKind::Float, &[2], "target", false);
    let main = module.create_function("main");
    let out = {
        let mut builder = module.function_mut(main)?;
        let reg = builder.create_regression("reg", p, target)?;
        builder.create_save_output("out", reg)?
    };
    assert_eq!(module.storage_users(p), 1);

    let mut engine = engine(module);
    engine.compile(CompilationMode::Infer, main, None)?;
    assert_eq!(engine.module().storage_users(p), 1);
    let key = engine.compile(CompilationMode::Train, main, Some(&TrainingConfig::new(0.5)))?;
    assert!(engine.module().storage_users(p) > 1);

    let mut ctx = Context::new();
    ctx.bind(p, Tensor::from_f32(&[2], vec![2.0, 4.0])?);
    ctx.bind(target, Tensor::from_f32(&[2], vec![0.0, 0.0])?);
    ctx.allocate(engine.module(), out)?;
    engine.run(&key, &mut ctx)?;

    assert_close(&floats(ctx.get(p).expect("bound")), &[1.0, 2.0], 1e-6);
    Ok(())
}

#[test]
fn elementwise_gradients_match_finite_differences() -> anyhow::Result<()> {
    let w0 = [0.5f32, -0.3, 0.8];
    let x0 = [1.0f32, 2.0, -1.5];
    let e0 = [0.2f32, -0.1, 0.4];

    let mut module = Module::with_seed(0);
    let w = module.create_variable_from(
        "w",
        Tensor::from_f32(&[3], w0.to_vec())?,
        Visibility::Private,
        true,
    );
    let x = module.create_placeholder(ElemKind::Float, &[3], "x", false);
    let expected = module.create_placeholder(ElemKind::Float, &[3], "expected", false);
    let main = module.create_function("main");
    let out = {
        let mut builder = module.function_mut(main)?;
        let wx = builder.create_mul("wx", w, x)?;
        let sig = builder.create_sigmoid("sig", wx)?;
        let th = builder.create_tanh("tanh", sig)?;
        let shifted = builder.create_sub("shifted", th, x)?;
        let reg = builder.create_regression("reg", shifted, expected)?;
        builder.create_save_output("out", reg)?
    };

    let loss = |w: &[f64]| -> f64 {
        (0..3)
            .map(|i| {
                let s = 1.0 / (1.0 + (-(w[i] * x0[i] as f64)).exp());
                let y = s.tanh() - x0[i] as f64;
                0.5 * (y - e0[i] as f64).powi(2)
            })
            .sum()
    };
    let eps = 1e-4;
    let numeric: Vec<f32> = (0..3)
        .map(|i| {
            let mut plus: Vec<f64> = w0.iter().map(|&v| v as f64).collect();
            let mut minus = plus.clone();
            plus[i] += eps;
            minus[i] -= eps;
            ((loss(&plus) - loss(&minus)) / (2.0 * eps)) as f32
        })
        .collect();

    let mut engine = engine(module);
    let key = engine.compile(CompilationMode::Train, main, Some(&TrainingConfig::new(1.0)))?;
    let mut ctx = Context::new();
    ctx.bind(x, Tensor::from_f32(&[3], x0.to_vec())?);
    ctx.bind(expected, Tensor::from_f32(&[3], e0.to_vec())?);
    ctx.allocate(engine.module(), out)?;
    engine.run(&key, &mut ctx)?;

    let after = floats(engine.module().variable(w)?.payload());
    let analytic: Vec<f32> = w0.iter().zip(&after).map(|(b, a)| b - a).collect();
    assert_close(&analytic, &numeric, 1e-4);
    Ok(())
}

fn softmax_loss(
    engine: &mut ExecutionEngine<CpuBackend>,
    key: &str,
    ctx: &mut Context,
    probs: PlaceholderId,
    class: usize,
) -> anyhow::Result<f32> {
    engine.run(key, ctx)?;
    let p = floats(ctx.get(probs).expect("output bound"));
    Ok(-p[class].ln())
}

fn nudge(
    engine: &mut ExecutionEngine<CpuBackend>,
    var: VariableId,
    index: usize,
    delta: f32,
) -> anyhow::Result<()> {
    let payload = engine.module_mut().variable_mut(var)?.payload_mut();
    payload.handle_mut::<f32>()?.raw_mut()[index] += delta;
    Ok(())
}

#[test]
fn conv_network_gradients_match_finite_differences() -> anyhow::Result<()> {
    let mut module = Module::with_seed(42);
    let input = module.create_placeholder(ElemKind::Float, &[1, 4, 4, 1], "input", false);
    let selected = module.create_placeholder(ElemKind::Index, &[1, 1], "selected", false);
    let main = module.create_function("main");
    let probs = {
        let mut builder = module.function_mut(main)?;
        let conv = builder.create_conv("conv", input, 2, 3, 1, 1)?;
        let pool = builder.create_max_pool("pool", conv, 2, 2, 0)?;
        let fc = builder.create_fully_connected("fc", pool, 3)?;
        let sm = builder.create_softmax("sm", fc, selected)?;
        builder.create_save_output("probs", sm)?
    };
    let lookup = |name: &str| {
        module
            .storage()
            .variable_by_name(name)
            .expect("layer variable exists")
    };
    let targets = [lookup("conv.bias"), lookup("fc.weights"), lookup("fc.bias")];

    let mut engine = engine(module);
    let infer = engine.compile(CompilationMode::Infer, main, None)?;
    let train = engine.compile(CompilationMode::Train, main, Some(&TrainingConfig::new(1.0)))?;

    let mut ctx = Context::new();
    let pixels: Vec<f32> = (0..16).map(|i| ((i * 7) % 11) as f32 / 5.0 - 1.0).collect();
    ctx.bind(input, Tensor::from_f32(&[1, 4, 4, 1], pixels)?);
    ctx.bind(selected, Tensor::from_i64(&[1, 1], vec![1])?);
    ctx.allocate(engine.module(), probs)?;

    let eps = 1e-2f32;
    let mut numeric = Vec::new();
    for &var in &targets {
        let len = engine.module().variable(var)?.ty().num_elements();
        let mut grads = Vec::with_capacity(len);
        for index in 0..len {
            nudge(&mut engine, var, index, eps)?;
            let plus = softmax_loss(&mut engine, &infer, &mut ctx, probs, 1)?;
            nudge(&mut engine, var, index, -2.0 * eps)?;
            let minus = softmax_loss(&mut engine, &infer, &mut ctx, probs, 1)?;
            nudge(&mut engine, var, index, eps)?;
            grads.push((plus - minus) / (2.0 * eps));
        }
        numeric.push(grads);
    }

    let mut before = Vec::with_capacity(targets.len());
    for &var in &targets {
        before.push(floats(engine.module().variable(var)?.payload()));
    }
    engine.run(&train, &mut ctx)?;

    for ((&var, before), numeric) in targets.iter().zip(&before).zip(&numeric) {
        let after = floats(engine.module().variable(var)?.payload());
        for (idx, ((b, a), n)) in before.iter().zip(&after).zip(numeric).enumerate() {
            let analytic = b - a;
            let tol = 2e-3 + 2e-2 * analytic.abs();
            assert!(
                (analytic - n).abs() <= tol,
                "{} [{idx}]: analytic {analytic} numeric {n}",
                engine.module().variable(var)?.name()
            );
        }
    }
    Ok(())
}

#[test]
fn run_checks_bindings_before_executing() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let x = module.create_placeholder(ElemKind::Float, &[2], "x", false);
    let main = module.create_function("main");
    let out = {
        let mut builder = module.function_mut(main)?;
        let relu = builder.create_relu("relu", x)?;
        builder.create_save_output("out", relu)?
    };

    let mut engine = engine(module);
    let key = engine.compile(CompilationMode::Infer, main, None)?;
    let mut ctx = Context::new();
    ctx.allocate(engine.module(), out)?;

    match engine.run(&key, &mut ctx) {
        Err(Error::UnboundPlaceholder { name }) => assert_eq!(name, "x"),
        other => panic!("expected an unbound placeholder error, got {other:?}"),
    }

    ctx.bind(x, Tensor::from_f32(&[3], vec![1.0, 2.0, 3.0])?);
    match engine.run(&key, &mut ctx) {
        Err(Error::BindingMismatch { name, .. }) => assert_eq!(name, "x"),
        other => panic!("expected a binding mismatch, got {other:?}"),
    }
    // Nothing ran, so the output still holds its zero initialisation.
    assert_eq!(floats(ctx.get(out).expect("bound")), vec![0.0, 0.0]);

    ctx.bind(x, Tensor::from_f32(&[2], vec![-1.0, 3.0])?);
    engine.run(&key, &mut ctx)?;
    assert_eq!(floats(ctx.get(out).expect("bound")), vec![0.0, 3.0]);
    Ok(())
}

#[test]
fn compile_and_run_report_missing_inputs() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let w = module.create_variable(ElemKind::Float, &[2], "w", Visibility::Private);
    let main = module.create_function("main");
    {
        let mut builder = module.function_mut(main)?;
        let relu = builder.create_relu("relu", w)?;
        builder.create_save_output("out", relu)?;
    }

    let mut engine = engine(module);
    let err = engine
        .compile(CompilationMode::Train, main, None)
        .expect_err("training needs a configuration");
    assert!(matches!(err, Error::MissingTrainingConfig), "{err}");
    assert_eq!(engine.module().num_functions(), 1);

    let mut ctx = Context::new();
    let err = engine.run("missing", &mut ctx).expect_err("nothing compiled");
    assert!(matches!(err, Error::NotCompiled(ref key) if key == "missing"), "{err}");
    Ok(())
}

#[test]
fn repeated_training_compiles_get_distinct_keys() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let w = module.create_variable_from(
        "w",
        Tensor::from_f32(&[1], vec![1.0])?,
        Visibility::Private,
        true,
    );
    let expected = module.create_placeholder(ElemKind::Float, &[1], "expected", false);
    let main = module.create_function("main");
    let out = {
        let mut builder = module.function_mut(main)?;
        let reg = builder.create_regression("reg", w, expected)?;
        builder.create_save_output("out", reg)?
    };

    let mut engine = engine(module);
    assert_eq!(engine.compile(CompilationMode::Infer, main, None)?, "main");
    assert_eq!(engine.compile(CompilationMode::Infer, main, None)?, "main");
    assert_eq!(engine.module().num_functions(), 1);

    let config = TrainingConfig::new(0.1);
    let first = engine.compile(CompilationMode::Train, main, Some(&config))?;
    let second = engine.compile(CompilationMode::Train, main, Some(&config))?;
    assert_eq!(first, "main_grad");
    assert_eq!(second, "main_grad__1");
    assert_eq!(engine.module().num_functions(), 3);
    assert_ne!(engine.compiled_function(&first), engine.compiled_function(&second));

    let mut ctx = Context::new();
    ctx.bind(expected, Tensor::from_f32(&[1], vec![0.0])?);
    ctx.allocate(engine.module(), out)?;
    engine.run(&first, &mut ctx)?;
    assert_close(&floats(engine.module().variable(w)?.payload()), &[0.9], 1e-6);
    engine.run(&second, &mut ctx)?;
    assert_close(&floats(engine.module().variable(w)?.payload()), &[0.81], 1e-6);
    Ok(())
}
