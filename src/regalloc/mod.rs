//! Register allocation.
//!
//! The allocator runs four phases over one function's IR:
//!
//! 1. **Virtual registers** ([`virtregs`]): every temporary is mapped to a
//!    vreg; `tmp_*` link instructions coalesce temporaries with the symbol
//!    they read, following the priority argument > local > upvalue >
//!    temporary.
//! 2. **Live ranges** ([`liverange`]): the ordered positions referencing
//!    each vreg, with a fixpoint extension over loop back edges.
//! 3. **Interference**: vreg ranges collapse to intervals; two vregs
//!    interfere iff their intervals overlap.
//! 4. **Coloring** ([`coloring`]): smallest-free-color over the
//!    interference graph, pinned argument/upvalue registers first. When the
//!    palette empties, the failing vreg is spilled and coloring retries
//!    without it.
//!
//! The result is the same instruction list with spill traffic inserted,
//! spilled operands rewritten to their per-interval scratch registers, and
//! a register assignment for every surviving temporary.

pub mod coloring;
pub mod liverange;
pub mod virtregs;

use crate::fx::FxHashMap;
use crate::ir::entities::Temp;
use crate::ir::inst::{Arg, Inst, Op, TmpKind};
use crate::result::CodegenResult;
use crate::writer::CodeOffset;

use self::coloring::{ColorAssignment, Coloring};
use self::liverange::LiveRanges;
use self::virtregs::{VReg, VirtRegs};

/// The allocator's output for one function.
pub struct Allocation {
    /// The rewritten instruction list.
    pub insts: Vec<Inst>,
    /// Physical register of every non-spilled temporary.
    pub colors: FxHashMap<Temp, u8>,
    /// Number of spill slots the frame needs.
    pub spill_slots: u32,
}

/// Persistent data structures for register allocation, reusable across
/// functions to avoid repeated allocations.
#[derive(Default)]
pub struct Context {
    virtregs: VirtRegs,
    liveness: LiveRanges,
    coloring: Coloring,
}

impl Context {
    /// Create a new allocation context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate registers for one function's IR.
    pub fn run(
        &mut self,
        func_name: &str,
        insts: Vec<Inst>,
        arg_count: u16,
        upvalue_count: u16,
    ) -> CodegenResult<Allocation> {
        log::debug!(
            "regalloc `{func_name}`: {} instructions, {arg_count} args, {upvalue_count} upvalues",
            insts.len()
        );

        // Phase 1: virtual registers and coalescing.
        self.virtregs.compute(&insts, arg_count, upvalue_count);

        // Phase 2: live ranges with back-edge extension.
        self.liveness.compute(&insts, &self.virtregs);

        // Phases 3 and 4: interference and coloring, retrying with spills.
        let assignment = self
            .coloring
            .run(func_name, &self.virtregs, &self.liveness)?;

        verify_disjoint_colors(&self.virtregs, &self.liveness, &assignment);

        Ok(self.rewrite(insts, assignment))
    }

    /// Rewrite the IR with the finished assignment: insert spill traffic,
    /// resolve symbol operands and spilled temporaries to registers.
    fn rewrite(&self, insts: Vec<Inst>, assignment: ColorAssignment) -> Allocation {
        let mut colors: FxHashMap<Temp, u8> = FxHashMap::default();
        for (temp, vreg) in self.virtregs.temp_bindings() {
            if let Some(color) = assignment.color_of(vreg) {
                colors.insert(temp, color);
            }
        }

        let mut out = Vec::with_capacity(insts.len() + 2 * assignment.spills.len() + 1);
        for (pos, mut inst) in insts.into_iter().enumerate() {
            let pos = pos as CodeOffset;

            for spill in &assignment.spills {
                for run in &spill.runs {
                    if run.start == pos {
                        out.push(Inst::new(
                            Op::Unspill,
                            [Arg::Reg(run.scratch), Arg::Uid(spill.slot)],
                            inst.loc.clone(),
                        ));
                    }
                }
            }

            self.resolve_operands(&mut inst, &assignment, pos);
            let is_entry = matches!(inst.op, Op::FnEntry);
            let loc = inst.loc.clone();
            out.push(inst);

            if is_entry && assignment.slot_count > 0 {
                out.push(Inst::new(
                    Op::AllocSpill,
                    [Arg::Uid(assignment.slot_count)],
                    loc.clone(),
                ));
                // Argument-originated spills save the incoming register
                // right at function entry.
                for spill in &assignment.spills {
                    if let Some(incoming) = spill.incoming_reg {
                        out.push(Inst::new(
                            Op::Spill,
                            [Arg::Uid(spill.slot), Arg::Reg(incoming)],
                            loc.clone(),
                        ));
                    }
                }
            }

            for spill in &assignment.spills {
                for run in &spill.runs {
                    if run.end == pos {
                        out.push(Inst::new(
                            Op::Spill,
                            [Arg::Uid(spill.slot), Arg::Reg(run.scratch)],
                            out.last().map(|i| i.loc.clone()).unwrap_or_default(),
                        ));
                    }
                }
            }
        }

        Allocation {
            insts: out,
            colors,
            spill_slots: assignment.slot_count,
        }
    }

    /// Replace spilled temporaries and symbolic `tmp_*` sources with the
    /// physical register that holds the value at `pos`.
    fn resolve_operands(&self, inst: &mut Inst, assignment: &ColorAssignment, pos: CodeOffset) {
        // The symbol operand of a link instruction becomes the symbol
        // vreg's register.
        if let Op::Tmp { kind, .. } = inst.op {
            let symbol_vreg = match (kind, inst.args.get(1)) {
                (TmpKind::Arg, Some(Arg::Byte(i))) => Some(self.virtregs.arg_vreg(*i as u16)),
                (TmpKind::Upvalue, Some(Arg::Byte(i))) => {
                    Some(self.virtregs.upvalue_vreg(*i as u16))
                }
                (TmpKind::Local, Some(Arg::Uid(index))) => self.virtregs.local_vreg(*index),
                _ => None,
            };
            if let Some(vreg) = symbol_vreg {
                inst.args[1] = Arg::Reg(assignment.reg_at(vreg, pos));
            }
        }
        for arg in inst.args.iter_mut() {
            if let Arg::Tmp(t) = arg {
                let vreg = self.virtregs.vreg_of(*t);
                if assignment.is_spilled(vreg) {
                    *arg = Arg::Reg(assignment.reg_at(vreg, pos));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::inst::Imm;
    use crate::ir::types::Width;
    use crate::isa::ALLOC_LIMIT;
    use crate::srcmap::Loc;
    use cranelift_entity::EntityRef;

    /// Exhaust the palette: the rewritten IR must carry exactly one
    /// `alloc_spill`, and one `unspill`/`spill` pair per maximal interval
    /// of every spilled vreg.
    #[test]
    fn spill_protocol_in_rewritten_ir() {
        let n = usize::from(ALLOC_LIMIT) + 2;
        let loc = Loc::unknown();
        let mut insts = vec![Inst::new(Op::FnEntry, [], loc.clone())];
        for i in 0..n {
            insts.push(Inst::new(
                Op::MvImm { width: Width::B4 },
                [Arg::Tmp(Temp::new(i)), Arg::Imm(Imm::Uint(i as u64))],
                loc.clone(),
            ));
        }
        for i in 0..n {
            insts.push(Inst::new(Op::DebugReg, [Arg::Tmp(Temp::new(i))], loc.clone()));
        }

        let allocation = Context::new()
            .run("pressure", insts, 0, 0)
            .expect("spilling must succeed");
        assert!(allocation.spill_slots >= 1);

        let allocs: Vec<_> = allocation
            .insts
            .iter()
            .filter(|inst| matches!(inst.op, Op::AllocSpill))
            .collect();
        assert_eq!(allocs.len(), 1, "exactly one alloc_spill per frame");
        assert_eq!(allocs[0].args[0], Arg::Uid(allocation.spill_slots));
        // alloc_spill sits right after the fn entry.
        assert!(matches!(allocation.insts[0].op, Op::FnEntry));
        assert!(matches!(allocation.insts[1].op, Op::AllocSpill));

        let spills = allocation
            .insts
            .iter()
            .filter(|inst| matches!(inst.op, Op::Spill))
            .count();
        let unspills = allocation
            .insts
            .iter()
            .filter(|inst| matches!(inst.op, Op::Unspill))
            .count();
        assert_eq!(spills, unspills);
        // Each spilled vreg here has two single-position intervals: its
        // definition and its use.
        assert_eq!(spills, 2 * allocation.spill_slots as usize);

        // Spilled operands were rewritten to scratch registers.
        for inst in &allocation.insts {
            if let Op::DebugReg = inst.op {
                match inst.args[0] {
                    Arg::Tmp(t) => assert!(allocation.colors.contains_key(&t)),
                    Arg::Reg(_) => {}
                    ref other => panic!("unexpected operand {other:?}"),
                }
            }
        }
    }

    /// Values live across a loop back edge keep their registers.
    #[test]
    fn loop_carried_values_share_one_register() {
        use crate::ir::inst::{AluOp, TmpKind};
        use crate::ir::types::NumTy;
        use crate::ir::Label;

        let loc = Loc::unknown();
        let head = Label::new(0);
        // i = 0; loop { t = i; t2 = t + t; t2 -> i }
        let insts = vec![
            Inst::new(Op::FnEntry, [], loc.clone()),
            Inst::new(
                Op::MvImm { width: Width::B4 },
                [Arg::Tmp(Temp::new(0)), Arg::Imm(Imm::Uint(0))],
                loc.clone(),
            ),
            Inst::new(
                Op::Tmp { width: Width::B4, ptr: false, kind: TmpKind::Local },
                [Arg::Tmp(Temp::new(0)), Arg::Uid(0)],
                loc.clone(),
            ),
            Inst::new(Op::Label, [Arg::Label(head)], loc.clone()),
            Inst::new(
                Op::Tmp { width: Width::B4, ptr: false, kind: TmpKind::Local },
                [Arg::Tmp(Temp::new(1)), Arg::Uid(0)],
                loc.clone(),
            ),
            Inst::new(
                Op::Bin { op: AluOp::Add, ty: NumTy::I32 },
                [Arg::Tmp(Temp::new(2)), Arg::Tmp(Temp::new(1)), Arg::Tmp(Temp::new(1))],
                loc.clone(),
            ),
            Inst::new(
                Op::Tmp { width: Width::B4, ptr: false, kind: TmpKind::Local },
                [Arg::Tmp(Temp::new(2)), Arg::Uid(0)],
                loc.clone(),
            ),
            Inst::new(Op::J, [Arg::Label(head)], loc),
        ];
        let allocation = Context::new().run("looped", insts, 0, 0).unwrap();
        assert_eq!(allocation.spill_slots, 0);
        // All three temporaries coalesced into the local's register.
        let r0 = allocation.colors[&Temp::new(0)];
        assert_eq!(allocation.colors[&Temp::new(1)], r0);
        assert_eq!(allocation.colors[&Temp::new(2)], r0);
    }
}

/// Debug check of the coloring invariant: two vregs sharing a color must
/// have disjoint live intervals unless both were spilled.
fn verify_disjoint_colors(virtregs: &VirtRegs, liveness: &LiveRanges, assignment: &ColorAssignment) {
    if cfg!(debug_assertions) {
        let vregs: Vec<VReg> = virtregs.iter().collect();
        for (i, &a) in vregs.iter().enumerate() {
            for &b in &vregs[i + 1..] {
                let (Some(ca), Some(cb)) = (assignment.color_of(a), assignment.color_of(b)) else {
                    continue;
                };
                if ca != cb {
                    continue;
                }
                let (Some(ra), Some(rb)) = (liveness.interval(a), liveness.interval(b)) else {
                    continue;
                };
                debug_assert!(
                    ra.0 > rb.1 || rb.0 > ra.1,
                    "{a} and {b} share register {ca} with overlapping live ranges"
                );
            }
        }
    }
}
