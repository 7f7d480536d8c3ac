use std::env;
use std::sync::OnceLock;

static TENSOR_IR_SEED: OnceLock<u64> = OnceLock::new();
static TENSOR_IR_REUSE_BUFFERS: OnceLock<bool> = OnceLock::new();
static TENSOR_IR_DUMP_IR: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => default,
    }
}

/// Seed for weight initialisation of variables created by `create_conv` and friends.
pub(crate) fn init_seed() -> u64 {
    *TENSOR_IR_SEED.get_or_init(|| {
        env::var("TENSOR_IR_SEED")
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    })
}

/// Whether lowering may place non-overlapping activations in the same slot.
pub(crate) fn reuse_buffers() -> bool {
    *TENSOR_IR_REUSE_BUFFERS.get_or_init(|| flag("TENSOR_IR_REUSE_BUFFERS", true))
}

/// Whether compilation logs the lowered instruction stream.
pub(crate) fn dump_ir() -> bool {
    *TENSOR_IR_DUMP_IR.get_or_init(|| flag("TENSOR_IR_DUMP_IR", false))
}
