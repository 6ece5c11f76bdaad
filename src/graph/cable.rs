// Copyright (c) 2024 Mike Tsao

use crate::types::ModuleId;
use derive_builder::Builder;

/// A patch cable: one module's output port feeding another module's input
/// port. An input port accepts at most one cable; an output port fans out to
/// any number. Cables may form cycles through modules; each cable costs one
/// sample of latency, which is what makes such cycles well defined.
#[derive(Builder, Clone, Debug, PartialEq)]
pub struct Cable {
    /// The producing module.
    pub output_module: ModuleId,
    /// Port index on the producing module.
    pub output_port: usize,
    /// The consuming module.
    pub input_module: ModuleId,
    /// Port index on the consuming module.
    pub input_port: usize,
    /// Cosmetic tag carried through serialization untouched.
    #[builder(default)]
    pub color: Option<String>,
}
impl Cable {
    /// A cable from `output_module.output_port` to `input_module.input_port`.
    pub fn new(
        output_module: ModuleId,
        output_port: usize,
        input_module: ModuleId,
        input_port: usize,
    ) -> Self {
        Self {
            output_module,
            output_port,
            input_module,
            input_port,
            color: None,
        }
    }
}
