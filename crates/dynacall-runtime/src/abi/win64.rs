//! Microsoft x64 classification
//!
//! The Nth argument occupies the Nth register (integer or float by its
//! class) while positions remain, then consecutive stack words. Aggregates
//! of 1, 2, 4 or 8 bytes travel as an integer; all others are copied and
//! passed by address.

use super::{Assignment, Location, Piece, Placement};
use crate::abi::Convention;
use crate::types::ParamKind;

/// Whether an aggregate of `size` bytes is passed by value
pub fn passed_by_value(size: usize) -> bool {
    matches!(size, 1 | 2 | 4 | 8)
}

pub(crate) fn classify(params: &[ParamKind]) -> Assignment {
    let registers = Convention::Win64.int_registers();
    let mut position = 0;
    let mut stack = 0;

    let placements = params
        .iter()
        .map(|kind| {
            if let ParamKind::Struct(layout) = kind {
                if layout.size() == 0 {
                    return Placement::Empty;
                }
            }

            let loc = if position < registers {
                if kind.is_float() {
                    Location::Float(position)
                } else {
                    Location::Int(position)
                }
            } else {
                stack += 1;
                Location::Stack(stack - 1)
            };
            position += 1;

            match kind {
                ParamKind::Struct(layout) if passed_by_value(layout.size()) => {
                    Placement::Pieces(vec![Piece {
                        offset: 0,
                        size: layout.size(),
                        loc,
                    }])
                }
                ParamKind::Struct(_) => Placement::Indirect(loc),
                _ => Placement::Scalar(loc),
            }
        })
        .collect();

    Assignment {
        placements,
        stack_slots: stack,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::CallPlan;
    use crate::types::{ScalarKind, Signature, StructLayout};
    use pretty_assertions::assert_eq;

    fn plan(params: Vec<ParamKind>) -> CallPlan {
        CallPlan::new(Convention::Win64, &Signature::of(params)).unwrap()
    }

    #[test]
    fn test_positional_registers() {
        let plan = plan(vec![
            ParamKind::F64,
            ParamKind::I32,
            ParamKind::F32,
            ParamKind::Pointer,
            ParamKind::F64,
        ]);
        assert_eq!(
            plan.placements(),
            &[
                Placement::Scalar(Location::Float(0)),
                Placement::Scalar(Location::Int(1)),
                Placement::Scalar(Location::Float(2)),
                Placement::Scalar(Location::Int(3)),
                Placement::Scalar(Location::Stack(0)),
            ]
        );
    }

    #[test]
    fn test_float_struct_travels_as_integer() {
        let layout = StructLayout::of_scalars(&[ScalarKind::F32, ScalarKind::F32]);
        let plan = plan(vec![ParamKind::F64, ParamKind::Struct(layout)]);
        assert_eq!(
            plan.placements()[1],
            Placement::Pieces(vec![Piece {
                offset: 0,
                size: 8,
                loc: Location::Int(1)
            }])
        );
    }

    #[test]
    fn test_odd_sized_struct_by_reference() {
        let layout = StructLayout::of_scalars(&[ScalarKind::U8; 3]);
        let plan = plan(vec![ParamKind::Struct(layout)]);
        assert_eq!(plan.placements()[0], Placement::Indirect(Location::Int(0)));
    }

    #[test]
    fn test_by_reference_struct_on_stack() {
        let layout = StructLayout::of_scalars(&[ScalarKind::U64; 2]);
        let mut params = vec![ParamKind::I32; 4];
        params.push(ParamKind::Struct(layout));
        let plan = plan(params);
        assert_eq!(plan.placements()[4], Placement::Indirect(Location::Stack(0)));
        assert_eq!(plan.stack_slots(), 1);
    }
}
