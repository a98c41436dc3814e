//! System V AMD64 classification
//!
//! Scalars take the next free register of their class. Aggregates are cut
//! into eightbytes; an eightbyte is INTEGER when any field in it is
//! integer-class and SSE otherwise. Aggregates larger than 16 bytes, those
//! holding a pointer field, and those whose eightbytes no longer fit in the
//! remaining registers are copied whole onto the stack.

use super::{chunk_pieces, stack_pieces, Assignment, Placement, RegisterFile};
use crate::abi::Convention;
use crate::types::{ParamKind, StructLayout};

/// Register class of one eightbyte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EightbyteClass {
    Integer,
    Sse,
}

/// Classify the eightbytes of an aggregate
///
/// `None` means the aggregate is passed in memory.
pub fn classify_struct(layout: &StructLayout) -> Option<Vec<EightbyteClass>> {
    if layout.size() > 16 || layout.has_pointer() {
        return None;
    }

    let mut classes = vec![None; layout.size().div_ceil(8)];
    for (offset, scalar) in layout.scalars() {
        let slot = &mut classes[offset / 8];
        *slot = match (*slot, scalar.is_float()) {
            (Some(EightbyteClass::Integer), _) | (_, false) => Some(EightbyteClass::Integer),
            _ => Some(EightbyteClass::Sse),
        };
    }
    Some(
        classes
            .into_iter()
            .map(|class| class.unwrap_or(EightbyteClass::Integer))
            .collect(),
    )
}

pub(crate) fn classify(params: &[ParamKind]) -> Assignment {
    let mut regs = RegisterFile::new(Convention::SysV);
    let placements = params
        .iter()
        .map(|kind| match kind {
            ParamKind::Struct(layout) => place_struct(layout, &mut regs),
            kind if kind.is_float() => Placement::Scalar(regs.float()),
            _ => Placement::Scalar(regs.int()),
        })
        .collect();

    Assignment {
        placements,
        stack_slots: regs.stack_slots(),
    }
}

fn place_struct(layout: &StructLayout, regs: &mut RegisterFile) -> Placement {
    if layout.size() == 0 {
        return Placement::Empty;
    }

    let Some(classes) = classify_struct(layout) else {
        return stack_pieces(layout, regs);
    };

    // Commit eightbytes one at a time; restore the snapshot if any misses
    let snapshot = *regs;
    let mut locs = Vec::with_capacity(classes.len());
    for class in classes {
        let loc = match class {
            EightbyteClass::Integer => regs.take_int(),
            EightbyteClass::Sse => regs.take_float(),
        };
        match loc {
            Some(loc) => locs.push(loc),
            None => {
                *regs = snapshot;
                return stack_pieces(layout, regs);
            }
        }
    }
    Placement::Pieces(chunk_pieces(layout, locs))
}
