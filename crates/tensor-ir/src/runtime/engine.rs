use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::context::Context;
use crate::backend::{Backend, ExecutionMemory};
use crate::env;
use crate::error::{Error, Result};
use crate::graph::{FunctionId, Module, StorageRef};
use crate::ir::{lower_function, BufferId, LowerOptions, LoweredFunction};
use crate::tensor::Tensor;
use crate::train::{differentiate, TrainingConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompilationMode {
    Infer,
    Train,
}

/// Compiled form of one function: the lowered stream plus its persistent optimizer state.
#[derive(Debug)]
struct Artifact {
    function: FunctionId,
    lowered: LoweredFunction,
    state: BTreeMap<BufferId, Tensor>,
}

/// Owns a module, compiles its functions, and runs them on a backend.
pub struct ExecutionEngine<B: Backend> {
    module: Module,
    backend: Arc<B>,
    options: LowerOptions,
    artifacts: HashMap<String, Artifact>,
}

impl<B: Backend> ExecutionEngine<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_module(Module::new(), backend)
    }

    pub fn with_module(module: Module, backend: Arc<B>) -> Self {
        Self {
            module,
            backend,
            options: LowerOptions::default(),
            artifacts: HashMap::new(),
        }
    }

    pub fn with_lower_options(mut self, options: LowerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Mutable access for building graphs. Artifacts compiled earlier are not affected.
    pub fn module_mut(&mut self) -> &mut Module {
        &mut self.module
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Compiles `function` and returns the key to run it under.
    ///
    /// In [`CompilationMode::Train`] the function is differentiated first and the
    /// key names the generated `<name>_grad` function.
    pub fn compile(
        &mut self,
        mode: CompilationMode,
        function: FunctionId,
        config: Option<&TrainingConfig>,
    ) -> Result<String> {
        let target = match mode {
            CompilationMode::Infer => function,
            CompilationMode::Train => {
                let config = config.ok_or(Error::MissingTrainingConfig)?;
                differentiate(&mut self.module, function, config)?
            }
        };

        let lowered = match lower_function(&self.module, target, &self.options) {
            Ok(lowered) => lowered,
            Err(err) => {
                // A derived training function is dropped together with the failed compile.
                if target != function {
                    self.module.erase_function(target)?;
                }
                return Err(err);
            }
        };
        if env::dump_ir() {
            debug!(function = %lowered.name, "lowered IR\n{lowered}");
        }
        let state = lowered
            .state_buffers()
            .map(|buffer| (buffer.id, Tensor::zeros(buffer.ty.clone())))
            .collect();
        let key = lowered.name.clone();
        debug!(key = %key, ?mode, backend = self.backend.backend_name(), "compiled function");
        self.artifacts.insert(
            key.clone(),
            Artifact {
                function: target,
                lowered,
                state,
            },
        );
        Ok(key)
    }

    pub fn lowered(&self, key: &str) -> Option<&LoweredFunction> {
        self.artifacts.get(key).map(|artifact| &artifact.lowered)
    }

    /// Graph function an artifact was lowered from.
    pub fn compiled_function(&self, key: &str) -> Option<FunctionId> {
        self.artifacts.get(key).map(|artifact| artifact.function)
    }

    /// Executes a compiled artifact. Every placeholder the artifact touches must be
    /// bound in `context` with its declared type; this is checked before any
    /// instruction runs.
    pub fn run(&mut self, key: &str, context: &mut Context) -> Result<()> {
        let artifact = self
            .artifacts
            .get_mut(key)
            .ok_or_else(|| Error::NotCompiled(key.to_string()))?;

        for (_, storage) in artifact.lowered.weights() {
            let StorageRef::Placeholder(id) = storage else {
                continue;
            };
            let placeholder = self.module.placeholder(id)?;
            match context.get(id) {
                None => {
                    return Err(Error::UnboundPlaceholder {
                        name: placeholder.name().to_string(),
                    })
                }
                Some(bound) if bound.ty() != placeholder.ty() => {
                    return Err(Error::BindingMismatch {
                        name: placeholder.name().to_string(),
                        expected: placeholder.ty().clone(),
                        found: bound.ty().clone(),
                    })
                }
                Some(_) => {}
            }
        }

        trace!(key, instructions = artifact.lowered.instructions.len(), "running artifact");
        let mut memory = ExecutionMemory::new(
            &artifact.lowered,
            self.module.storage_mut(),
            context,
            &mut artifact.state,
        );
        self.backend.run_function(&artifact.lowered, &mut memory)?;
        Ok(())
    }
}
