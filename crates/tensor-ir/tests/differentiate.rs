use std::sync::Arc;

use tensor_ir::graph::{
    FunctionId, Module, NodeKind, PlaceholderId, StorageRef, Value, VariableId, Visibility,
};
use tensor_ir::runtime::{CompilationMode, Context, ExecutionEngine};
use tensor_ir::tensor::{ElemKind, Tensor, TensorData};
use tensor_ir::train::{differentiate, TrainingConfig};
use tensor_ir::Error;
use tensor_ir_backend_ref_cpu::CpuBackend;

fn sgd_targets(module: &Module, id: FunctionId) -> Vec<StorageRef> {
    module
        .function(id)
        .expect("function exists")
        .nodes()
        .iter()
        .filter(|node| matches!(node.kind(), NodeKind::Sgd(_)))
        .filter_map(|node| node.input(1).and_then(Value::as_storage))
        .collect()
}

#[test]
fn only_used_trainable_variables_receive_updates() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let main = module.create_function("main");
    let a = module.create_variable(ElemKind::Float, &[1], "A", Visibility::Private);
    let b = module.create_variable(ElemKind::Float, &[1], "B", Visibility::Private);
    let a_plus_b = module.function_mut(main)?.create_add("AplusB", a, b)?;
    assert_eq!(module.variables().len(), 2);

    let g = module.clone_function(main, "G")?;
    assert_eq!(module.variables().len(), 2);
    assert_eq!(module.function(g)?.len(), 1);

    let c = module.create_variable(ElemKind::Float, &[1], "C", Visibility::Private);
    {
        let mut builder = module.function_mut(g)?;
        let last = builder.function().node_ids().next_back().expect("cloned node");
        builder.create_add("totalSum", last, c)?;
    }
    assert_eq!(module.variables().len(), 3);

    let label = module.create_placeholder(ElemKind::Float, &[1], "label", false);
    {
        let mut builder = module.function_mut(main)?;
        let reg = builder.create_regression("reg", a_plus_b, label)?;
        builder.create_save_output("return", reg)?;
    }
    assert_eq!(module.placeholders().len(), 2);
    assert_eq!(module.variables().len(), 3);

    let grad = differentiate(&mut module, main, &TrainingConfig::default())?;
    module.verify_function(grad)?;

    assert_eq!(module.num_functions(), 3);
    assert_eq!(module.placeholders().len(), 2);
    assert_eq!(module.variables().len(), 3);

    let targets = sgd_targets(&module, grad);
    assert_eq!(targets.len(), 2);
    assert_eq!(
        targets.iter().filter(|t| **t == StorageRef::Variable(a)).count(),
        1
    );
    assert_eq!(
        targets.iter().filter(|t| **t == StorageRef::Variable(b)).count(),
        1
    );
    assert_eq!(module.function(grad)?.name(), "main_grad");
    Ok(())
}

#[test]
fn source_function_is_left_untouched() -> anyhow::Result<()> {
    let mut module = Module::with_seed(3);
    let input = module.create_placeholder(ElemKind::Float, &[2, 6], "input", false);
    let selected = module.create_placeholder(ElemKind::Index, &[2, 1], "selected", false);
    let main = module.create_function("main");
    {
        let mut builder = module.function_mut(main)?;
        let fc = builder.create_fully_connected("fc", input, 3)?;
        let act = builder.create_tanh("act", fc)?;
        let sm = builder.create_softmax("sm", act, selected)?;
        builder.create_save_output("probs", sm)?;
    }
    let before = module.function(main)?.to_string();
    let users_before = module.storage_users(input);

    let grad = differentiate(&mut module, main, &TrainingConfig::new(0.1))?;

    assert_eq!(module.function(main)?.to_string(), before);
    module.verify_function(main)?;
    assert!(module.storage_users(input) > users_before);
    let function = module.function(grad)?;
    assert_eq!(function.count_nodes(|k| matches!(k, NodeKind::FullyConnectedGrad)), 1);
    assert_eq!(function.count_nodes(|k| matches!(k, NodeKind::SoftMaxGrad)), 1);
    assert_eq!(sgd_targets(&module, grad).len(), 2);
    Ok(())
}

#[test]
fn shared_operands_accumulate_gradients() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let w = module.create_variable(ElemKind::Float, &[3], "w", Visibility::Private);
    let expected = module.create_placeholder(ElemKind::Float, &[3], "expected", false);
    let main = module.create_function("main");
    {
        let mut builder = module.function_mut(main)?;
        let twice = builder.create_add("twice", w, w)?;
        let squared = builder.create_mul("squared", twice, w)?;
        let reg = builder.create_regression("reg", squared, expected)?;
        builder.create_save_output("out", reg)?;
    }

    let grad = differentiate(&mut module, main, &TrainingConfig::default())?;
    let function = module.function(grad)?;
    let sums = function
        .nodes()
        .iter()
        .filter(|node| node.name().ends_with("_grad_sum"))
        .count();
    assert!(sums >= 1, "{function}");
    assert_eq!(sgd_targets(&module, grad), vec![StorageRef::Variable(w)]);
    Ok(())
}

fn variable_values(module: &Module, id: VariableId) -> anyhow::Result<Vec<f32>> {
    match module.variable(id)?.payload().data() {
        TensorData::Float(values) => Ok(values.clone()),
        TensorData::Index(_) => anyhow::bail!("expected a float variable"),
    }
}

/// Compiles `main` for training, runs one step with `bindings`, and returns the engine.
fn train_once(
    module: Module,
    main: FunctionId,
    config: &TrainingConfig,
    bindings: Vec<(PlaceholderId, Tensor)>,
    out: PlaceholderId,
) -> anyhow::Result<ExecutionEngine<CpuBackend>> {
    let mut engine = ExecutionEngine::with_module(module, Arc::new(CpuBackend::new()));
    let key = engine.compile(CompilationMode::Train, main, Some(config))?;
    let mut ctx = Context::new();
    for (placeholder, tensor) in bindings {
        ctx.bind(placeholder, tensor);
    }
    ctx.allocate(engine.module(), out)?;
    engine.run(&key, &mut ctx)?;
    Ok(engine)
}

#[test]
fn summed_gradient_drives_a_single_update() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let w = module.create_variable_from(
        "w",
        Tensor::from_f32(&[1], vec![2.0])?,
        Visibility::Private,
        true,
    );
    let x = module.create_placeholder(ElemKind::Float, &[1], "x", false);
    let expected = module.create_placeholder(ElemKind::Float, &[1], "expected", false);
    let main = module.create_function("main");
    let out = {
        let mut builder = module.function_mut(main)?;
        let inner = builder.create_add("inner", w, x)?;
        let outer = builder.create_add("outer", inner, w)?;
        let reg = builder.create_regression("reg", outer, expected)?;
        builder.create_save_output("out", reg)?
    };

    // y = 2w + x = 5, dL/dy = 5, and both uses of w contribute: dL/dw = 10.
    let engine = train_once(
        module,
        main,
        &TrainingConfig::new(0.01),
        vec![
            (x, Tensor::from_f32(&[1], vec![1.0])?),
            (expected, Tensor::from_f32(&[1], vec![0.0])?),
        ],
        out,
    )?;
    let updated = variable_values(engine.module(), w)?;
    assert!((updated[0] - 1.9).abs() < 1e-6, "{updated:?}");
    Ok(())
}

#[test]
fn accumulation_order_does_not_change_the_update() -> anyhow::Result<()> {
    let run = |direct_first: bool| -> anyhow::Result<Tensor> {
        let mut module = Module::with_seed(0);
        let w = module.create_variable_from(
            "w",
            Tensor::from_f32(&[2], vec![0.5, -1.5])?,
            Visibility::Private,
            true,
        );
        let x = module.create_placeholder(ElemKind::Float, &[2], "x", false);
        let expected = module.create_placeholder(ElemKind::Float, &[2], "expected", false);
        let main = module.create_function("main");
        let out = {
            let mut builder = module.function_mut(main)?;
            // Node order decides the order contributions to `w` are recorded in.
            let (scaled, shifted) = if direct_first {
                let shifted = builder.create_add("shifted", w, x)?;
                (builder.create_mul("scaled", w, x)?, shifted)
            } else {
                let scaled = builder.create_mul("scaled", w, x)?;
                (scaled, builder.create_add("shifted", w, x)?)
            };
            let y = builder.create_add("y", scaled, shifted)?;
            let reg = builder.create_regression("reg", y, expected)?;
            builder.create_save_output("out", reg)?
        };
        let engine = train_once(
            module,
            main,
            &TrainingConfig::new(0.1),
            vec![
                (x, Tensor::from_f32(&[2], vec![3.0, 0.25])?),
                (expected, Tensor::from_f32(&[2], vec![1.0, 2.0])?),
            ],
            out,
        )?;
        Ok(engine.module().variable(w)?.payload().clone())
    };

    let direct_first = run(true)?;
    let scaled_first = run(false)?;
    assert!(direct_first.bitwise_eq(&scaled_first));

    // y = w * x + w + x, dL/dw = (y - expected) * (x + 1).
    let expected: [f32; 2] = [-1.1, -1.046875];
    match direct_first.data() {
        TensorData::Float(values) => {
            for (actual, expected) in values.iter().zip(expected) {
                assert!((actual - expected).abs() < 1e-5, "{actual} vs {expected}");
            }
        }
        TensorData::Index(_) => panic!("expected a float variable"),
    }
    Ok(())
}

#[test]
fn frozen_variables_get_no_update() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let w = module.create_variable_from(
        "w",
        Tensor::from_f32(&[1], vec![1.0])?,
        Visibility::Private,
        true,
    );
    let frozen = module.create_variable_from(
        "frozen",
        Tensor::from_f32(&[1], vec![2.0])?,
        Visibility::Private,
        false,
    );
    let expected = module.create_placeholder(ElemKind::Float, &[1], "expected", false);
    let main = module.create_function("main");
    let out = {
        let mut builder = module.function_mut(main)?;
        let y = builder.create_mul("y", w, frozen)?;
        let reg = builder.create_regression("reg", y, expected)?;
        builder.create_save_output("out", reg)?
    };

    let grad = differentiate(&mut module, main, &TrainingConfig::new(0.1))?;
    assert_eq!(sgd_targets(&module, grad), vec![StorageRef::Variable(w)]);
    module.erase_function(grad)?;

    // dL/dy = 2, dL/dw = 2 * frozen = 4.
    let engine = train_once(
        module,
        main,
        &TrainingConfig::new(0.1),
        vec![(expected, Tensor::from_f32(&[1], vec![0.0])?)],
        out,
    )?;
    let updated = variable_values(engine.module(), w)?;
    assert!((updated[0] - 0.6).abs() < 1e-6, "{updated:?}");
    assert_eq!(variable_values(engine.module(), frozen)?, vec![2.0]);
    Ok(())
}

#[test]
fn gradient_functions_cannot_be_differentiated_again() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let w = module.create_variable(ElemKind::Float, &[2], "w", Visibility::Private);
    let expected = module.create_placeholder(ElemKind::Float, &[2], "expected", false);
    let main = module.create_function("main");
    {
        let mut builder = module.function_mut(main)?;
        let act = builder.create_relu("act", w)?;
        let reg = builder.create_regression("reg", act, expected)?;
        builder.create_save_output("out", reg)?;
    }
    let grad = differentiate(&mut module, main, &TrainingConfig::default())?;
    assert_eq!(module.num_functions(), 2);

    let err = differentiate(&mut module, grad, &TrainingConfig::default())
        .expect_err("sgd and gradient nodes have no gradient rule");
    assert!(
        matches!(err, Error::Differentiation { ref reason, .. } if reason.contains("no gradient rule")),
        "{err}"
    );
    assert_eq!(module.num_functions(), 2);
    Ok(())
}

#[test]
fn conv_pool_network_differentiates_every_layer() -> anyhow::Result<()> {
    let mut module = Module::with_seed(11);
    let input = module.create_placeholder(ElemKind::Float, &[2, 8, 8, 1], "input", false);
    let selected = module.create_placeholder(ElemKind::Index, &[2, 1], "selected", false);
    let main = module.create_function("main");
    {
        let mut builder = module.function_mut(main)?;
        let conv = builder.create_conv("conv1", input, 4, 3, 1, 1)?;
        let relu = builder.create_relu("relu1", conv)?;
        let pool = builder.create_max_pool("pool1", relu, 2, 2, 0)?;
        let lrn = builder.create_local_response_normalization("lrn", pool, Default::default())?;
        let fc = builder.create_fully_connected("fc", lrn, 10)?;
        let sm = builder.create_softmax("sm", fc, selected)?;
        builder.create_save_output("return", sm)?;
    }

    let config = TrainingConfig {
        learning_rate: 0.001,
        momentum: 0.9,
        l1_decay: 0.001,
        l2_decay: 0.001,
        batch_size: 2,
    };
    let grad = differentiate(&mut module, main, &config)?;
    let function = module.function(grad)?;
    for kind in [
        NodeKind::ReluGrad,
        NodeKind::FullyConnectedGrad,
        NodeKind::SoftMaxGrad,
    ] {
        assert_eq!(function.count_nodes(|k| *k == kind), 1, "{kind:?}");
    }
    assert_eq!(function.count_nodes(|k| matches!(k, NodeKind::ConvGrad(_))), 1);
    assert_eq!(function.count_nodes(|k| matches!(k, NodeKind::MaxPoolGrad(_))), 1);
    assert_eq!(
        function.count_nodes(|k| matches!(k, NodeKind::LocalResponseNormalizationGrad(_))),
        1
    );
    // conv filter and bias, fc weights and bias
    assert_eq!(sgd_targets(&module, grad).len(), 4);
    Ok(())
}

#[test]
fn trainable_placeholders_are_updated() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let input = module.create_placeholder(ElemKind::Float, &[2, 4, 4, 1], "input", true);
    let main = module.create_function("main");
    {
        let mut builder = module.function_mut(main)?;
        let relu = builder.create_relu("relu", input)?;
        builder.create_save_output("return", relu)?;
    }
    assert_eq!(module.storage_users(input), 1);

    let grad = differentiate(&mut module, main, &TrainingConfig::default())?;
    assert_eq!(
        sgd_targets(&module, grad),
        vec![StorageRef::Placeholder(input)]
    );
    assert!(module.storage_users(input) > 1);
    Ok(())
}

#[test]
fn invalid_configuration_leaves_module_unchanged() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let w = module.create_variable(ElemKind::Float, &[2], "w", Visibility::Private);
    let main = module.create_function("main");
    {
        let mut builder = module.function_mut(main)?;
        let relu = builder.create_relu("relu", w)?;
        builder.create_save_output("out", relu)?;
    }

    let config = TrainingConfig {
        momentum: 1.5,
        ..TrainingConfig::default()
    };
    let err = differentiate(&mut module, main, &config).expect_err("momentum out of range");
    assert!(matches!(err, Error::Differentiation { .. }), "{err}");
    assert_eq!(module.num_functions(), 1);
    Ok(())
}

#[test]
fn unverifiable_functions_are_rejected() -> anyhow::Result<()> {
    let mut module = Module::with_seed(0);
    let w = module.create_variable(ElemKind::Float, &[2], "w", Visibility::Private);
    let main = module.create_function("main");
    module.function_mut(main)?.create_relu("orphan", w)?;

    let err = differentiate(&mut module, main, &TrainingConfig::default())
        .expect_err("dead node fails verification");
    assert!(matches!(err, Error::Verification { .. }), "{err}");
    assert_eq!(module.num_functions(), 1);
    Ok(())
}
