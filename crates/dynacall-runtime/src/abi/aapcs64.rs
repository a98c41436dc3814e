//! AAPCS64 classification
//!
//! Homogeneous floating-point aggregates (HFAs) take one float register per
//! member. Other aggregates up to 16 bytes take one integer register per
//! 8-byte chunk. An aggregate that does not fit entirely goes to the stack
//! and exhausts that register file. Larger non-HFA aggregates are copied and
//! passed by address.
//!
//! Stack words are 8 bytes each; Apple's arm64 variant packs small stack
//! arguments by natural size and is not modeled.

use super::{chunk_pieces, stack_pieces, Assignment, Placement, RegisterFile};
use crate::abi::{Convention, Piece};
use crate::types::{IntWidth, ParamKind, ScalarKind, StructLayout};

/// How an aggregate is passed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateClass {
    /// 1 to 4 members of one float kind
    Hfa { member: ScalarKind, count: usize },
    /// 8 or 16 bytes of one small integer kind
    Hva,
    /// Any other aggregate of at most 16 bytes
    Composite,
    /// Larger than 16 bytes: passed by reference
    Indirect,
}

pub fn aggregate_class(layout: &StructLayout) -> AggregateClass {
    let scalars = layout.scalars();

    if let Some((_, first)) = scalars.first() {
        if first.is_float() && scalars.len() <= 4 && scalars.iter().all(|(_, s)| s == first) {
            return AggregateClass::Hfa {
                member: *first,
                count: scalars.len(),
            };
        }
    }

    if layout.size() > 16 {
        return AggregateClass::Indirect;
    }

    let small_int = |s: &ScalarKind| match s {
        ScalarKind::Int(w) | ScalarKind::UInt(w) => w.bits() <= IntWidth::W32.bits(),
        _ => false,
    };
    if let Some((_, first)) = scalars.first() {
        if matches!(layout.size(), 8 | 16)
            && small_int(first)
            && scalars.iter().all(|(_, s)| s == first)
        {
            return AggregateClass::Hva;
        }
    }

    AggregateClass::Composite
}

pub(crate) fn classify(params: &[ParamKind]) -> Assignment {
    let mut regs = RegisterFile::new(Convention::Aapcs64);
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

    match aggregate_class(layout) {
        AggregateClass::Hfa { member, count } => {
            if regs.floats_free() < count {
                regs.exhaust_floats();
                return stack_pieces(layout, regs);
            }
            Placement::Pieces(
                layout
                    .scalars()
                    .into_iter()
                    .filter_map(|(offset, _)| {
                        regs.take_float().map(|loc| Piece {
                            offset,
                            size: member.size(),
                            loc,
                        })
                    })
                    .collect(),
            )
        }
        AggregateClass::Hva | AggregateClass::Composite => {
            let words = layout.size().div_ceil(8);
            if regs.ints_free() < words {
                regs.exhaust_ints();
                return stack_pieces(layout, regs);
            }
            let locs: Vec<_> = (0..words).filter_map(|_| regs.take_int()).collect();
            Placement::Pieces(chunk_pieces(layout, locs))
        }
        AggregateClass::Indirect => Placement::Indirect(regs.int()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{CallPlan, Location};
    use crate::marshal::KeepAlive;
    use crate::types::{FieldKind, Signature, Value};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn plan(params: Vec<ParamKind>) -> CallPlan {
        CallPlan::new(Convention::Aapcs64, &Signature::of(params)).unwrap()
    }

    #[rstest]
    #[case(vec![ScalarKind::F32, ScalarKind::F32], AggregateClass::Hfa { member: ScalarKind::F32, count: 2 })]
    #[case(vec![ScalarKind::F64; 4], AggregateClass::Hfa { member: ScalarKind::F64, count: 4 })]
    #[case(vec![ScalarKind::F32, ScalarKind::F64], AggregateClass::Composite)]
    #[case(vec![ScalarKind::I16; 4], AggregateClass::Hva)]
    #[case(vec![ScalarKind::U32; 4], AggregateClass::Hva)]
    #[case(vec![ScalarKind::U8, ScalarKind::U32], AggregateClass::Composite)]
    #[case(vec![ScalarKind::F32, ScalarKind::U32], AggregateClass::Composite)]
    #[case(vec![ScalarKind::F32; 5], AggregateClass::Indirect)]
    #[case(vec![ScalarKind::F64; 5], AggregateClass::Indirect)]
    #[case(vec![ScalarKind::I64; 3], AggregateClass::Indirect)]
    fn test_aggregate_class(#[case] fields: Vec<ScalarKind>, #[case] expected: AggregateClass) {
        assert_eq!(aggregate_class(&StructLayout::of_scalars(&fields)), expected);
    }

    #[test]
    fn test_hfa_flattens_arrays() {
        let layout = StructLayout::new(vec![FieldKind::array(ScalarKind::F32, 3)]);
        assert_eq!(
            aggregate_class(&layout),
            AggregateClass::Hfa {
                member: ScalarKind::F32,
                count: 3
            }
        );
    }

    #[test]
    fn test_hfa_one_register_per_member() {
        let hfa = StructLayout::of_scalars(&[ScalarKind::F32; 3]);
        let plan = plan(vec![ParamKind::F64, ParamKind::Struct(hfa)]);
        assert_eq!(
            plan.placements()[1],
            Placement::Pieces(vec![
                Piece {
                    offset: 0,
                    size: 4,
                    loc: Location::Float(1)
                },
                Piece {
                    offset: 4,
                    size: 4,
                    loc: Location::Float(2)
                },
                Piece {
                    offset: 8,
                    size: 4,
                    loc: Location::Float(3)
                },
            ])
        );
    }

    #[test]
    fn test_hfa_that_does_not_fit_exhausts_floats() {
        let hfa = StructLayout::of_scalars(&[ScalarKind::F64; 4]);
        let mut params = vec![ParamKind::F64; 6];
        params.push(ParamKind::Struct(hfa));
        params.push(ParamKind::F64);
        let plan = plan(params);

        assert_eq!(plan.placements()[6], Placement::Pieces(vec![
            Piece { offset: 0, size: 8, loc: Location::Stack(0) },
            Piece { offset: 8, size: 8, loc: Location::Stack(1) },
            Piece { offset: 16, size: 8, loc: Location::Stack(2) },
            Piece { offset: 24, size: 8, loc: Location::Stack(3) },
        ]));
        // v6 and v7 were free but the file is now exhausted
        assert_eq!(plan.placements()[7], Placement::Scalar(Location::Stack(4)));
    }

    #[test]
    fn test_small_composite_in_int_registers() {
        let layout = StructLayout::of_scalars(&[ScalarKind::U8, ScalarKind::F64]);
        let plan = plan(vec![ParamKind::Struct(layout)]);
        assert_eq!(
            plan.placements()[0],
            Placement::Pieces(vec![
                Piece {
                    offset: 0,
                    size: 8,
                    loc: Location::Int(0)
                },
                Piece {
                    offset: 8,
                    size: 8,
                    loc: Location::Int(1)
                },
            ])
        );
    }

    #[test]
    fn test_composite_that_does_not_fit_exhausts_ints() {
        let layout = StructLayout::of_scalars(&[ScalarKind::I64, ScalarKind::I64]);
        let mut params = vec![ParamKind::I64; 7];
        params.push(ParamKind::Struct(layout));
        params.push(ParamKind::I32);
        let plan = plan(params);
        assert!(matches!(&plan.placements()[7], Placement::Pieces(p) if p[0].loc == Location::Stack(0)));
        assert_eq!(plan.placements()[8], Placement::Scalar(Location::Stack(2)));
    }

    #[test]
    fn test_large_struct_by_reference() {
        let layout = StructLayout::of_scalars(&[ScalarKind::I64; 3]);
        let plan = plan(vec![ParamKind::I32, ParamKind::Struct(layout)]);
        assert_eq!(plan.placements()[1], Placement::Indirect(Location::Int(1)));

        let value = Value::Struct(vec![Value::Int(-1), Value::Int(2), Value::Int(-3)]);
        let mut keep = KeepAlive::new();
        let image = plan
            .build_image(&[Value::Int(0), value.clone()], &mut keep)
            .unwrap();
        assert_eq!(keep.len(), 1);
        assert_eq!(plan.decode_args(&image)[1], value);
    }

    #[test]
    fn test_hfa_round_trip_through_image() {
        let hfa = StructLayout::of_scalars(&[ScalarKind::F32, ScalarKind::F32]);
        let plan = plan(vec![ParamKind::Struct(hfa)]);
        let value = Value::Struct(vec![Value::F32(1.25), Value::F32(-8.0)]);
        let mut keep = KeepAlive::new();
        let image = plan.build_image(std::slice::from_ref(&value), &mut keep).unwrap();
        assert_eq!(image.floats()[0], 1.25f32.to_bits() as u64);
        assert_eq!(image.floats()[1], (-8.0f32).to_bits() as u64);
        assert_eq!(plan.decode_args(&image), vec![value]);
    }
}
