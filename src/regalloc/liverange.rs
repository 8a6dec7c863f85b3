//! Phase 2: live ranges.
//!
//! For each vreg we record the ordered positions of the instructions that
//! reference it. Argument and upvalue vregs additionally begin at position
//! zero, where the caller loaded them, regardless of their first read.
//!
//! A loop body read of a value written later in the body must keep the
//! value alive around the back edge. Whenever a jump targets an earlier
//! label, every range with a position inside the jump's span is extended to
//! cover the jump origin, repeated to a fixpoint so nested loops converge.

use crate::fx::FxHashMap;
use crate::ir::entities::Label;
use crate::ir::inst::{Arg, Inst, Op, TmpKind};
use crate::writer::CodeOffset;
use cranelift_entity::SecondaryMap;

use super::virtregs::{VReg, VirtRegs};

/// Live ranges of every vreg in one function.
#[derive(Default)]
pub struct LiveRanges {
    positions: SecondaryMap<VReg, Vec<CodeOffset>>,
    len: usize,
}

impl LiveRanges {
    /// Create an empty set of ranges.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute ranges for one function's IR.
    pub fn compute(&mut self, insts: &[Inst], virtregs: &VirtRegs) {
        self.positions.clear();
        self.len = virtregs.len();

        // Arguments and upvalues are live from the function entry.
        for index in 0..virtregs.pinned_count() {
            self.positions[VReg::from_u32(index)].push(0);
        }

        let mut label_pos: FxHashMap<Label, CodeOffset> = FxHashMap::default();
        let mut back_edges: Vec<(CodeOffset, CodeOffset)> = Vec::new();

        for (pos, inst) in insts.iter().enumerate() {
            let pos = pos as CodeOffset;
            if let Op::Label = inst.op {
                if let Some(Arg::Label(label)) = inst.args.first() {
                    label_pos.insert(*label, pos);
                }
                continue;
            }
            for arg in &inst.args {
                if let Arg::Tmp(t) = arg {
                    let vreg = virtregs.vreg_of(*t);
                    let list = &mut self.positions[vreg];
                    if list.last() != Some(&pos) {
                        list.push(pos);
                    }
                }
            }
            // A link instruction also references the named symbol's vreg,
            // even when the destination did not coalesce with it.
            if let Op::Tmp { kind, .. } = inst.op {
                let symbol = match (kind, inst.args.get(1)) {
                    (TmpKind::Arg, Some(Arg::Byte(i))) => Some(virtregs.arg_vreg(u16::from(*i))),
                    (TmpKind::Upvalue, Some(Arg::Byte(i))) => {
                        Some(virtregs.upvalue_vreg(u16::from(*i)))
                    }
                    (TmpKind::Local, Some(Arg::Uid(index))) => virtregs.local_vreg(*index),
                    _ => None,
                };
                if let Some(vreg) = symbol {
                    let list = &mut self.positions[vreg];
                    if list.last() != Some(&pos) {
                        list.push(pos);
                    }
                }
            }
            if let Some(target) = inst.branch_target() {
                if let Some(&target_pos) = label_pos.get(&target) {
                    // The target label is already recorded, so this jump
                    // goes backwards.
                    back_edges.push((target_pos, pos));
                }
            }
        }

        // Fixpoint over back edges: a range that overlaps the span of a
        // backwards jump must survive until the jump origin.
        let mut changed = true;
        while changed {
            changed = false;
            for &(target, origin) in &back_edges {
                for index in 0..self.len as u32 {
                    let vreg = VReg::from_u32(index);
                    let list = &mut self.positions[vreg];
                    let (Some(&min), Some(&max)) = (list.first(), list.last()) else {
                        continue;
                    };
                    if min <= origin && max >= target && max < origin {
                        list.push(origin);
                        changed = true;
                    }
                }
            }
        }
    }

    /// The ordered reference positions of a vreg.
    pub fn positions(&self, vreg: VReg) -> &[CodeOffset] {
        &self.positions[vreg]
    }

    /// The `[min, max]` interval of a vreg, if it is referenced at all.
    pub fn interval(&self, vreg: VReg) -> Option<(CodeOffset, CodeOffset)> {
        let list = &self.positions[vreg];
        Some((*list.first()?, *list.last()?))
    }

    /// True when two vregs' intervals overlap.
    pub fn interfere(&self, a: VReg, b: VReg) -> bool {
        match (self.interval(a), self.interval(b)) {
            (Some((amin, amax)), Some((bmin, bmax))) => amin <= bmax && bmin <= amax,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::entities::Temp;
    use crate::ir::inst::{AluOp, TmpKind};
    use crate::ir::types::{NumTy, Width};
    use crate::srcmap::Loc;
    use cranelift_entity::EntityRef;

    fn t(n: usize) -> Arg {
        Arg::Tmp(Temp::new(n))
    }

    #[test]
    fn back_edges_extend_ranges() {
        // 0: fn
        // 1: tmp_0 <- local 0
        // 2: label L
        // 3: add tmp_1, tmp_0, tmp_0
        // 4: j L            <- tmp_0 must stay live across the back edge
        let label = Label::new(0);
        let loc = Loc::unknown();
        let insts = vec![
            Inst::new(Op::FnEntry, [], loc.clone()),
            Inst::new(
                Op::Tmp { width: Width::B4, ptr: false, kind: TmpKind::Local },
                [t(0), Arg::Uid(0)],
                loc.clone(),
            ),
            Inst::new(Op::Label, [Arg::Label(label)], loc.clone()),
            Inst::new(
                Op::Bin { op: AluOp::Add, ty: NumTy::I32 },
                [t(1), t(0), t(0)],
                loc.clone(),
            ),
            Inst::new(Op::J, [Arg::Label(label)], loc),
        ];
        let mut virtregs = VirtRegs::new();
        virtregs.compute(&insts, 0, 0);
        let mut ranges = LiveRanges::new();
        ranges.compute(&insts, &virtregs);

        let local = virtregs.vreg_of(Temp::new(0));
        let (min, max) = ranges.interval(local).unwrap();
        assert_eq!(min, 1);
        assert_eq!(max, 4, "range must be extended to the jump origin");
    }

    #[test]
    fn arguments_begin_at_zero() {
        let loc = Loc::unknown();
        let insts = vec![
            Inst::new(Op::FnEntry, [], loc.clone()),
            Inst::new(
                Op::Tmp { width: Width::B4, ptr: false, kind: TmpKind::Arg },
                [t(0), Arg::Byte(0)],
                loc,
            ),
        ];
        let mut virtregs = VirtRegs::new();
        virtregs.compute(&insts, 1, 0);
        let mut ranges = LiveRanges::new();
        ranges.compute(&insts, &virtregs);
        let (min, _) = ranges.interval(virtregs.arg_vreg(0)).unwrap();
        assert_eq!(min, 0);
    }
}
