//! Phases 3 and 4: interference and coloring, with the spill protocol.
//!
//! Ranges collapse to `[min, max]` intervals, and two vregs interfere iff
//! their intervals overlap. Coloring walks vregs in index order: pinned
//! arguments and upvalues take their incoming register, everyone else takes
//! the smallest color not used by an interfering neighbor, drawn from the
//! palette minus all pinned colors and minus the reserved return-register
//! file.
//!
//! When a vreg finds no color, it is marked for spilling: it receives the
//! next spill slot, the partial coloring is thrown away and coloring
//! retries without it. Spilled vregs live in their slot except across each
//! maximal contiguous interval of use positions, where they borrow a
//! scratch register: the reserved top register when free, otherwise any
//! register no live neighbor holds. A spill that makes no progress is a
//! terminal "function too complex".

use crate::fx::{FxHashMap, FxHashSet};
use crate::isa::{ALLOC_LIMIT, RET_REG};
use crate::result::{CodegenError, CodegenResult};
use crate::writer::CodeOffset;
use cranelift_entity::EntityRef;

use super::liverange::LiveRanges;
use super::virtregs::{VReg, VRegClass, VirtRegs};

/// One maximal contiguous interval of a spilled vreg's use positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpillRun {
    /// First position of the run; an `unspill` lands right before it.
    pub start: CodeOffset,
    /// Last position of the run; a `spill` lands right after it.
    pub end: CodeOffset,
    /// The register borrowed across the run.
    pub scratch: u8,
}

/// Where one spilled vreg lives.
pub struct SpillPlacement {
    /// The spilled vreg.
    pub vreg: VReg,
    /// Its frame slot, in spill order.
    pub slot: u32,
    /// Its use runs, each with a scratch register.
    pub runs: Vec<SpillRun>,
    /// For argument-originated spills, the incoming register that must be
    /// saved at position zero.
    pub incoming_reg: Option<u8>,
}

/// The finished coloring of one function.
pub struct ColorAssignment {
    colors: FxHashMap<VReg, u8>,
    spilled: FxHashSet<VReg>,
    /// Spill placements, in slot order.
    pub spills: Vec<SpillPlacement>,
    /// Total number of spill slots the frame needs.
    pub slot_count: u32,
}

impl ColorAssignment {
    /// The color of a non-spilled vreg.
    pub fn color_of(&self, vreg: VReg) -> Option<u8> {
        self.colors.get(&vreg).copied()
    }

    /// True when `vreg` was spilled.
    pub fn is_spilled(&self, vreg: VReg) -> bool {
        self.spilled.contains(&vreg)
    }

    /// The register holding `vreg` at instruction position `pos`.
    pub fn reg_at(&self, vreg: VReg, pos: CodeOffset) -> u8 {
        if let Some(color) = self.color_of(vreg) {
            return color;
        }
        let placement = self
            .spills
            .iter()
            .find(|s| s.vreg == vreg)
            .expect("vreg is colored or spilled");
        placement
            .runs
            .iter()
            .find(|run| run.start <= pos && pos <= run.end)
            .expect("spilled vreg is only referenced inside its runs")
            .scratch
    }
}

/// The coloring pass.
#[derive(Default)]
pub struct Coloring;

impl Coloring {
    /// Create the pass.
    pub fn new() -> Self {
        Self
    }

    /// Color every vreg or fail with "function too complex".
    pub fn run(
        &mut self,
        func_name: &str,
        virtregs: &VirtRegs,
        liveness: &LiveRanges,
    ) -> CodegenResult<ColorAssignment> {
        let pinned = virtregs.pinned_count();
        if pinned > u32::from(ALLOC_LIMIT) {
            return Err(CodegenError::FunctionTooComplex(func_name.to_string()));
        }

        let mut spilled: FxHashSet<VReg> = FxHashSet::default();
        let mut spill_order: Vec<VReg> = Vec::new();
        let mut colors: FxHashMap<VReg, u8> = FxHashMap::default();

        loop {
            colors.clear();
            let mut failure = None;
            for vreg in virtregs.iter() {
                if spilled.contains(&vreg) {
                    continue;
                }
                let index = vreg.index() as u32;
                if index < pinned {
                    colors.insert(vreg, index as u8);
                    continue;
                }
                let Some(interval) = liveness.interval(vreg) else {
                    // Never referenced; no register needed.
                    continue;
                };
                let mut used = [false; 256];
                for p in 0..pinned {
                    used[p as usize] = true;
                }
                for (&other, &color) in &colors {
                    if other != vreg && overlap(interval, liveness.interval(other)) {
                        used[color as usize] = true;
                    }
                }
                match (0..ALLOC_LIMIT).find(|&c| !used[c as usize]) {
                    Some(color) => {
                        colors.insert(vreg, color);
                    }
                    None => {
                        failure = Some(vreg);
                        break;
                    }
                }
            }

            let Some(victim) = failure else { break };
            if virtregs.class_of(victim) == VRegClass::Argument || !spilled.insert(victim) {
                // Spilling cannot free anything up any more.
                return Err(CodegenError::FunctionTooComplex(func_name.to_string()));
            }
            log::debug!("`{func_name}`: spilling {victim}");
            spill_order.push(victim);
        }

        let spills =
            self.place_spills(func_name, virtregs, liveness, &colors, &spilled, &spill_order)?;

        Ok(ColorAssignment {
            colors,
            spilled,
            slot_count: spills.len() as u32,
            spills,
        })
    }

    /// Split each spilled vreg into maximal runs of consecutive use
    /// positions and find a scratch register for every run.
    fn place_spills(
        &self,
        func_name: &str,
        virtregs: &VirtRegs,
        liveness: &LiveRanges,
        colors: &FxHashMap<VReg, u8>,
        spilled: &FxHashSet<VReg>,
        spill_order: &[VReg],
    ) -> CodegenResult<Vec<SpillPlacement>> {
        let mut placements: Vec<SpillPlacement> = Vec::with_capacity(spill_order.len());
        for (slot, &vreg) in spill_order.iter().enumerate() {
            let mut runs: Vec<SpillRun> = Vec::new();
            for &pos in liveness.positions(vreg) {
                match runs.last_mut() {
                    Some(run) if pos == run.end + 1 => run.end = pos,
                    Some(run) if pos <= run.end => {}
                    _ => runs.push(SpillRun { start: pos, end: pos, scratch: 0 }),
                }
            }
            for run in &mut runs {
                run.scratch = self.scratch_for(
                    func_name, virtregs, liveness, colors, spilled, &placements, run,
                )?;
            }
            let incoming_reg = (virtregs.class_of(vreg) == VRegClass::Argument)
                .then(|| vreg.index() as u8);
            placements.push(SpillPlacement {
                vreg,
                slot: slot as u32,
                runs,
                incoming_reg,
            });
        }
        Ok(placements)
    }

    fn scratch_for(
        &self,
        func_name: &str,
        virtregs: &VirtRegs,
        liveness: &LiveRanges,
        colors: &FxHashMap<VReg, u8>,
        spilled: &FxHashSet<VReg>,
        placed: &[SpillPlacement],
        run: &SpillRun,
    ) -> CodegenResult<u8> {
        let pinned = virtregs.pinned_count();
        let span = (run.start, run.end);
        'candidates: for candidate in (0..=RET_REG).rev() {
            if u32::from(candidate) < pinned {
                continue;
            }
            for (&other, &color) in colors {
                if color == candidate
                    && !spilled.contains(&other)
                    && overlap(span, liveness.interval(other))
                {
                    continue 'candidates;
                }
            }
            for placement in placed {
                for other in &placement.runs {
                    if other.scratch == candidate
                        && span.0 <= other.end
                        && other.start <= span.1
                    {
                        continue 'candidates;
                    }
                }
            }
            return Ok(candidate);
        }
        Err(CodegenError::FunctionTooComplex(func_name.to_string()))
    }
}

fn overlap(a: (CodeOffset, CodeOffset), b: Option<(CodeOffset, CodeOffset)>) -> bool {
    match b {
        Some((bmin, bmax)) => a.0 <= bmax && bmin <= a.1,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::entities::Temp;
    use crate::ir::inst::{Arg, Imm, Inst, Op};
    use crate::ir::types::Width;
    use crate::srcmap::Loc;

    /// Build a function with `n` mutually overlapping temporaries: `n`
    /// definitions followed by `n` uses in the same order.
    fn overlapping_temps(n: usize) -> Vec<Inst> {
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
        insts
    }

    fn color(n: usize) -> (VirtRegs, LiveRanges, ColorAssignment) {
        let insts = overlapping_temps(n);
        let mut virtregs = VirtRegs::new();
        virtregs.compute(&insts, 0, 0);
        let mut liveness = LiveRanges::new();
        liveness.compute(&insts, &virtregs);
        let assignment = Coloring::new()
            .run("test", &virtregs, &liveness)
            .expect("colorable");
        (virtregs, liveness, assignment)
    }

    #[test]
    fn distinct_colors_for_interfering_vregs() {
        let (virtregs, _, assignment) = color(4);
        let mut seen = std::collections::BTreeSet::new();
        for vreg in virtregs.iter() {
            seen.insert(assignment.color_of(vreg).unwrap());
        }
        assert_eq!(seen.len(), 4);
        assert!(assignment.spills.is_empty());
    }

    #[test]
    fn pressure_beyond_the_palette_spills() {
        // More simultaneously live temporaries than allocatable registers.
        let n = usize::from(ALLOC_LIMIT) + 2;
        let (_, _, assignment) = color(n);
        assert!(!assignment.spills.is_empty());
        for placement in &assignment.spills {
            // Two single-position runs: the definition and the use.
            assert_eq!(placement.runs.len(), 2);
            for run in &placement.runs {
                assert_eq!(run.scratch, RET_REG);
            }
        }
    }
}
