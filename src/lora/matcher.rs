//! Pairs model tensors with adapter factors

use std::collections::HashMap;

use super::format::{TensorRecord, LORA_A_SUFFIX, LORA_B_SUFFIX};

/// Down and up factors for one model tensor
#[derive(Debug, Clone, Copy)]
pub struct FactorPair<'a> {
    /// `<name>.loraA`
    pub down: &'a TensorRecord,
    /// `<name>.loraB`
    pub up: &'a TensorRecord,
}

/// Find both factors for `tensor_name`
///
/// Returns `None` unless both `<name>.loraA` and `<name>.loraB` are present;
/// a tensor without a complete pair is left alone.
#[must_use]
pub fn find_pair<'a>(
    records: &'a HashMap<String, TensorRecord>,
    tensor_name: &str,
) -> Option<FactorPair<'a>> {
    let down = records.get(&format!("{tensor_name}{LORA_A_SUFFIX}"))?;
    let up = records.get(&format!("{tensor_name}{LORA_B_SUFFIX}"))?;
    Some(FactorPair { down, up })
}
