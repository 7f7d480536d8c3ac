//! Live ranges and slot assignment for activation buffers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::instr::{Buffer, BufferId, BufferKind, Instruction, Op};
use crate::tensor::ElemKind;

/// Inclusive instruction positions of an activation's alloc and dealloc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveRange {
    pub start: usize,
    pub end: usize,
}

impl LiveRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &LiveRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Whether `position` lies strictly between the alloc and the dealloc.
    pub fn covers(&self, position: usize) -> bool {
        self.start < position && position < self.end
    }
}

/// Region of the activation arena shared by buffers with disjoint live ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSlot {
    pub id: usize,
    pub elem: ElemKind,
    pub len: usize,
    pub byte_offset: usize,
    pub byte_len: usize,
}

impl BufferSlot {
    fn byte_end(&self) -> usize {
        self.byte_offset + self.byte_len
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferPlan {
    pub live_ranges: BTreeMap<BufferId, LiveRange>,
    /// Slot of every activation and of every view rooted in an activation.
    pub assignments: BTreeMap<BufferId, usize>,
    /// View buffer to the non-view buffer whose bytes it aliases.
    pub view_roots: BTreeMap<BufferId, BufferId>,
    pub slots: Vec<BufferSlot>,
    pub total_bytes: usize,
}

impl BufferPlan {
    pub fn slot_for(&self, buffer: BufferId) -> Option<&BufferSlot> {
        self.assignments
            .get(&buffer)
            .and_then(|slot| self.slots.get(*slot))
    }

    /// Live range of an activation, or of the activation a view aliases.
    pub fn live_range(&self, buffer: BufferId) -> Option<LiveRange> {
        let root = self.root(buffer);
        self.live_ranges.get(&root).copied()
    }

    pub fn root(&self, buffer: BufferId) -> BufferId {
        self.view_roots.get(&buffer).copied().unwrap_or(buffer)
    }

    /// Checks that no two activations alive at the same time share bytes.
    pub fn verify(&self) -> Result<(), BufferizeError> {
        let entries: Vec<(BufferId, LiveRange, &BufferSlot)> = self
            .live_ranges
            .iter()
            .filter_map(|(buffer, range)| Some((*buffer, *range, self.slot_for(*buffer)?)))
            .collect();
        if entries.len() != self.live_ranges.len() {
            return Err(BufferizeError::Unassigned);
        }
        for (idx, (lhs, lhs_range, lhs_slot)) in entries.iter().enumerate() {
            for (rhs, rhs_range, rhs_slot) in &entries[idx + 1..] {
                let bytes_overlap = lhs_slot.byte_offset < rhs_slot.byte_end()
                    && rhs_slot.byte_offset < lhs_slot.byte_end();
                if bytes_overlap && lhs_range.overlaps(rhs_range) {
                    return Err(BufferizeError::Overlap {
                        lhs: *lhs,
                        rhs: *rhs,
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct BufferizeOptions {
    /// Let activations with disjoint live ranges share a slot.
    pub reuse_slots: bool,
}

#[derive(Debug, Error)]
pub enum BufferizeError {
    #[error("activation {0:?} is allocated more than once")]
    DuplicateAlloc(BufferId),
    #[error("activation {0:?} is deallocated without a matching alloc")]
    UnmatchedDealloc(BufferId),
    #[error("activation {0:?} is never deallocated")]
    MissingDealloc(BufferId),
    #[error("alloc/dealloc names non-activation buffer {0:?}")]
    NotAnActivation(BufferId),
    #[error("buffer {0:?} is not declared")]
    UnknownBuffer(BufferId),
    #[error("activation without a slot")]
    Unassigned,
    #[error("activations {lhs:?} and {rhs:?} are alive together in overlapping bytes")]
    Overlap { lhs: BufferId, rhs: BufferId },
}

pub fn plan_buffers(
    buffers: &[Buffer],
    instructions: &[Instruction],
    options: &BufferizeOptions,
) -> Result<BufferPlan, BufferizeError> {
    let mut plan = BufferPlan {
        live_ranges: compute_live_ranges(buffers, instructions)?,
        view_roots: compute_view_roots(buffers)?,
        ..BufferPlan::default()
    };
    assign_slots(&mut plan, buffers, options);
    Ok(plan)
}

pub(crate) fn compute_live_ranges(
    buffers: &[Buffer],
    instructions: &[Instruction],
) -> Result<BTreeMap<BufferId, LiveRange>, BufferizeError> {
    let mut open: BTreeMap<BufferId, usize> = BTreeMap::new();
    let mut ranges = BTreeMap::new();
    for (pos, inst) in instructions.iter().enumerate() {
        let Some(buffer) = inst.operands.first().map(|operand| operand.buffer) else {
            continue;
        };
        match inst.op {
            Op::AllocActivation => {
                let declared = buffers
                    .get(buffer.index())
                    .ok_or(BufferizeError::UnknownBuffer(buffer))?;
                if !declared.is_activation() {
                    return Err(BufferizeError::NotAnActivation(buffer));
                }
                if open.contains_key(&buffer) || ranges.contains_key(&buffer) {
                    return Err(BufferizeError::DuplicateAlloc(buffer));
                }
                open.insert(buffer, pos);
            }
            Op::DeallocActivation => {
                let start = open
                    .remove(&buffer)
                    .ok_or(BufferizeError::UnmatchedDealloc(buffer))?;
                ranges.insert(buffer, LiveRange::new(start, pos));
            }
            _ => {}
        }
    }
    if let Some(buffer) = open.keys().next() {
        return Err(BufferizeError::MissingDealloc(*buffer));
    }
    Ok(ranges)
}

fn compute_view_roots(buffers: &[Buffer]) -> Result<BTreeMap<BufferId, BufferId>, BufferizeError> {
    let mut roots = BTreeMap::new();
    for buffer in buffers {
        let BufferKind::View { of } = buffer.kind else {
            continue;
        };
        // Views are declared after their source, so the source is already resolved.
        let root = roots.get(&of).copied().unwrap_or(of);
        if buffers.get(root.index()).is_none() {
            return Err(BufferizeError::UnknownBuffer(root));
        }
        roots.insert(buffer.id, root);
    }
    Ok(roots)
}

fn assign_slots(plan: &mut BufferPlan, buffers: &[Buffer], options: &BufferizeOptions) {
    let mut groups: BTreeMap<(ElemKind, usize), Vec<BufferId>> = BTreeMap::new();
    for buffer in plan.live_ranges.keys() {
        if let Some(declared) = buffers.get(buffer.index()) {
            let key = (declared.ty.elem, declared.ty.num_elements());
            groups.entry(key).or_default().push(*buffer);
        }
    }

    let mut slots: Vec<BufferSlot> = Vec::new();
    let mut slot_end: Vec<usize> = Vec::new();
    for ((elem, len), mut members) in groups {
        members.sort_by_key(|buffer| (plan.live_ranges[buffer].start, *buffer));
        let mut local_slots: Vec<usize> = Vec::new();
        for buffer in members {
            let range = plan.live_ranges[&buffer];
            let reusable = if options.reuse_slots {
                local_slots
                    .iter()
                    .copied()
                    .find(|slot| slot_end[*slot] < range.start)
            } else {
                None
            };
            let slot = match reusable {
                Some(slot) => slot,
                None => {
                    let id = slots.len();
                    slots.push(BufferSlot {
                        id,
                        elem,
                        len,
                        byte_offset: 0,
                        byte_len: len * elem.size_in_bytes(),
                    });
                    slot_end.push(0);
                    local_slots.push(id);
                    id
                }
            };
            slot_end[slot] = slot_end[slot].max(range.end);
            plan.assignments.insert(buffer, slot);
        }
    }

    let mut offset = 0usize;
    for slot in &mut slots {
        slot.byte_offset = offset;
        offset += slot.byte_len;
    }
    plan.total_bytes = offset;

    for (view, root) in &plan.view_roots {
        if let Some(slot) = plan.assignments.get(root).copied() {
            plan.assignments.insert(*view, slot);
        }
    }
    plan.slots = slots;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instr::Operand;
    use crate::tensor::TensorType;

    fn activation(id: u32, dims: &[usize]) -> Buffer {
        Buffer {
            id: BufferId(id),
            name: format!("a{id}"),
            ty: TensorType::float(dims),
            kind: BufferKind::Activation,
        }
    }

    fn marker(op: Op, id: u32) -> Instruction {
        Instruction::new(op, vec![Operand::write(BufferId(id))])
    }

    #[test]
    fn disjoint_ranges_share_a_slot_when_reuse_is_enabled() {
        let buffers = vec![activation(0, &[4]), activation(1, &[4])];
        let instructions = vec![
            marker(Op::AllocActivation, 0),
            marker(Op::Splat { value: 1.0 }, 0),
            marker(Op::DeallocActivation, 0),
            marker(Op::AllocActivation, 1),
            marker(Op::Splat { value: 2.0 }, 1),
            marker(Op::DeallocActivation, 1),
        ];
        let shared = plan_buffers(
            &buffers,
            &instructions,
            &BufferizeOptions { reuse_slots: true },
        )
        .expect("plan");
        assert_eq!(shared.slots.len(), 1);
        assert_eq!(shared.total_bytes, 16);
        shared.verify().expect("no overlap");

        let separate = plan_buffers(&buffers, &instructions, &BufferizeOptions::default())
            .expect("plan");
        assert_eq!(separate.slots.len(), 2);
        assert_eq!(separate.total_bytes, 32);
    }

    #[test]
    fn overlapping_ranges_never_share() {
        let buffers = vec![activation(0, &[4]), activation(1, &[4])];
        let instructions = vec![
            marker(Op::AllocActivation, 0),
            marker(Op::AllocActivation, 1),
            marker(Op::DeallocActivation, 0),
            marker(Op::DeallocActivation, 1),
        ];
        let plan = plan_buffers(
            &buffers,
            &instructions,
            &BufferizeOptions { reuse_slots: true },
        )
        .expect("plan");
        assert_ne!(plan.assignments[&BufferId(0)], plan.assignments[&BufferId(1)]);
        plan.verify().expect("no overlap");
    }

    #[test]
    fn missing_dealloc_is_reported() {
        let buffers = vec![activation(0, &[1])];
        let instructions = vec![marker(Op::AllocActivation, 0)];
        let err = plan_buffers(&buffers, &instructions, &BufferizeOptions::default())
            .expect_err("unterminated activation");
        assert!(matches!(err, BufferizeError::MissingDealloc(BufferId(0))));
    }

    #[test]
    fn verify_detects_forced_overlap() {
        let buffers = vec![activation(0, &[2]), activation(1, &[2])];
        let instructions = vec![
            marker(Op::AllocActivation, 0),
            marker(Op::AllocActivation, 1),
            marker(Op::DeallocActivation, 1),
            marker(Op::DeallocActivation, 0),
        ];
        let mut plan = plan_buffers(&buffers, &instructions, &BufferizeOptions::default())
            .expect("plan");
        plan.assignments.insert(BufferId(1), 0);
        assert!(matches!(plan.verify(), Err(BufferizeError::Overlap { .. })));
    }
}
