//! Phase 1: virtual registers and coalescing.
//!
//! Every temporary belongs to exactly one virtual register. Arguments and
//! upvalues own the first vregs, in that order, matching the registers the
//! caller loaded them into; locals get a vreg on first touch; everything
//! else is a plain temporary vreg.
//!
//! A `tmp_*` link instruction is a coalescing hint: its destination
//! temporary inherits the vreg of the named symbol unless the temporary is
//! already bound to a higher-priority class. `reg_copy` links always mint a
//! fresh vreg, because a re-typed value must not alias its source.

use crate::fx::FxHashMap;
use crate::ir::entities::Temp;
use crate::ir::inst::{Arg, Inst, Op, TmpKind};
use cranelift_entity::{entity_impl, PrimaryMap};

/// An opaque reference to a virtual register.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(u32);
entity_impl!(VReg, "vreg");

/// The storage class a vreg represents, in ascending coalescing priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum VRegClass {
    /// An anonymous temporary.
    Temp,
    /// A captured upvalue.
    Upvalue,
    /// A local variable.
    Local,
    /// A function argument.
    Argument,
}

/// The temp-to-vreg mapping of one function.
#[derive(Default)]
pub struct VirtRegs {
    vregs: PrimaryMap<VReg, VRegClass>,
    bindings: FxHashMap<Temp, VReg>,
    locals: FxHashMap<u32, VReg>,
    arg_count: u16,
    upvalue_count: u16,
}

impl VirtRegs {
    /// Create an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the mapping for one function's IR.
    pub fn compute(&mut self, insts: &[Inst], arg_count: u16, upvalue_count: u16) {
        self.vregs.clear();
        self.bindings.clear();
        self.locals.clear();
        self.arg_count = arg_count;
        self.upvalue_count = upvalue_count;

        for _ in 0..arg_count {
            self.vregs.push(VRegClass::Argument);
        }
        for _ in 0..upvalue_count {
            self.vregs.push(VRegClass::Upvalue);
        }

        for inst in insts {
            if let Op::Tmp { kind, .. } = inst.op {
                let (Some(Arg::Tmp(dst)), src) = (inst.args.first().copied(), inst.args.get(1))
                else {
                    continue;
                };
                match (kind, src) {
                    (TmpKind::RegCopy, _) => {
                        let fresh = self.vregs.push(VRegClass::Temp);
                        self.bindings.insert(dst, fresh);
                    }
                    (TmpKind::Reg, Some(&Arg::Tmp(src))) => {
                        let sv = self.bind_fresh_if_unbound(src);
                        self.inherit(dst, sv);
                    }
                    (TmpKind::Arg, Some(&Arg::Byte(index))) => {
                        self.inherit(dst, self.arg_vreg(u16::from(index)));
                    }
                    (TmpKind::Upvalue, Some(&Arg::Byte(index))) => {
                        self.inherit(dst, self.upvalue_vreg(u16::from(index)));
                    }
                    (TmpKind::Local, Some(&Arg::Uid(index))) => {
                        let sv = match self.locals.get(&index) {
                            Some(&sv) => sv,
                            None => {
                                let sv = self.vregs.push(VRegClass::Local);
                                self.locals.insert(index, sv);
                                sv
                            }
                        };
                        self.inherit(dst, sv);
                    }
                    // Global and function loads have no register source.
                    _ => {
                        self.bind_fresh_if_unbound(dst);
                    }
                }
            }
            // Any other unseen temporary mints a fresh vreg at its first
            // occurrence.
            for arg in &inst.args {
                if let Arg::Tmp(t) = arg {
                    self.bind_fresh_if_unbound(*t);
                }
            }
        }
    }

    fn bind_fresh_if_unbound(&mut self, t: Temp) -> VReg {
        if let Some(&v) = self.bindings.get(&t) {
            return v;
        }
        let v = self.vregs.push(VRegClass::Temp);
        self.bindings.insert(t, v);
        v
    }

    /// Let `dst` inherit `symbol`'s vreg unless it is already bound to a
    /// strictly higher-priority class. A tie rebinds: the later link wins,
    /// which is what turns `x = y` into a move into `x`'s register.
    fn inherit(&mut self, dst: Temp, symbol: VReg) {
        match self.bindings.get(&dst) {
            Some(&current) if self.vregs[current] > self.vregs[symbol] => {}
            _ => {
                self.bindings.insert(dst, symbol);
            }
        }
    }

    /// The vreg of a bound temporary.
    pub fn vreg_of(&self, t: Temp) -> VReg {
        self.bindings[&t]
    }

    /// The pinned vreg of argument `index`.
    pub fn arg_vreg(&self, index: u16) -> VReg {
        debug_assert!(index < self.arg_count);
        VReg::from_u32(u32::from(index))
    }

    /// The pinned vreg of upvalue `index`.
    pub fn upvalue_vreg(&self, index: u16) -> VReg {
        debug_assert!(index < self.upvalue_count);
        VReg::from_u32(u32::from(self.arg_count + index))
    }

    /// The vreg of a local, if it was ever touched.
    pub fn local_vreg(&self, index: u32) -> Option<VReg> {
        self.locals.get(&index).copied()
    }

    /// Number of pinned vregs: arguments then upvalues.
    pub fn pinned_count(&self) -> u32 {
        u32::from(self.arg_count) + u32::from(self.upvalue_count)
    }

    /// The storage class of a vreg.
    pub fn class_of(&self, v: VReg) -> VRegClass {
        self.vregs[v]
    }

    /// Number of vregs.
    pub fn len(&self) -> usize {
        self.vregs.len()
    }

    /// True when no vregs exist.
    pub fn is_empty(&self) -> bool {
        self.vregs.is_empty()
    }

    /// Iterate all vregs in index order.
    pub fn iter(&self) -> impl Iterator<Item = VReg> {
        (0..self.vregs.len() as u32).map(VReg::from_u32)
    }

    /// Iterate `(temp, vreg)` bindings.
    pub fn temp_bindings(&self) -> impl Iterator<Item = (Temp, VReg)> + '_ {
        self.bindings.iter().map(|(&t, &v)| (t, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::Width;
    use crate::srcmap::Loc;
    use cranelift_entity::EntityRef;

    fn link(kind: TmpKind, dst: u32, src: Arg) -> Inst {
        Inst::new(
            Op::Tmp { width: Width::B4, ptr: false, kind },
            [Arg::Tmp(Temp::new(dst as usize)), src],
            Loc::unknown(),
        )
    }

    #[test]
    fn arguments_own_the_first_vregs() {
        let insts = vec![link(TmpKind::Arg, 0, Arg::Byte(1))];
        let mut virtregs = VirtRegs::new();
        virtregs.compute(&insts, 2, 1);
        assert_eq!(virtregs.len(), 3);
        assert_eq!(virtregs.vreg_of(Temp::new(0)), virtregs.arg_vreg(1));
        assert_eq!(virtregs.class_of(virtregs.upvalue_vreg(0)), VRegClass::Upvalue);
    }

    #[test]
    fn local_links_coalesce() {
        // tmp_0 <- local 0; tmp_1 <- local 0: one local vreg for both.
        let insts = vec![
            link(TmpKind::Local, 0, Arg::Uid(0)),
            link(TmpKind::Local, 1, Arg::Uid(0)),
        ];
        let mut virtregs = VirtRegs::new();
        virtregs.compute(&insts, 0, 0);
        assert_eq!(virtregs.vreg_of(Temp::new(0)), virtregs.vreg_of(Temp::new(1)));
        assert_eq!(
            virtregs.class_of(virtregs.vreg_of(Temp::new(0))),
            VRegClass::Local
        );
    }

    #[test]
    fn argument_binding_beats_local() {
        // tmp_0 <- arg 0, then tmp_0 <- local 0: the argument class has
        // higher priority, so the local link becomes a move instead of a
        // coalesce.
        let insts = vec![
            link(TmpKind::Arg, 0, Arg::Byte(0)),
            link(TmpKind::Local, 0, Arg::Uid(0)),
        ];
        let mut virtregs = VirtRegs::new();
        virtregs.compute(&insts, 1, 0);
        assert_eq!(virtregs.vreg_of(Temp::new(0)), virtregs.arg_vreg(0));
        // The local still got its own vreg.
        assert!(virtregs.local_vreg(0).is_some());
        assert_ne!(virtregs.local_vreg(0).unwrap(), virtregs.arg_vreg(0));
    }

    #[test]
    fn equal_priority_rebinds_to_the_later_symbol() {
        // x = y: the read link binds the temp to y, the write link rebinds
        // it to x.
        let insts = vec![
            link(TmpKind::Local, 0, Arg::Uid(1)), // read y
            link(TmpKind::Local, 0, Arg::Uid(0)), // write x
        ];
        let mut virtregs = VirtRegs::new();
        virtregs.compute(&insts, 0, 0);
        assert_eq!(
            virtregs.vreg_of(Temp::new(0)),
            virtregs.local_vreg(0).unwrap()
        );
        assert_ne!(virtregs.local_vreg(0), virtregs.local_vreg(1));
    }

    #[test]
    fn reg_copy_always_mints_fresh() {
        let insts = vec![
            link(TmpKind::Local, 0, Arg::Uid(0)),
            link(TmpKind::RegCopy, 1, Arg::Tmp(Temp::new(0))),
        ];
        let mut virtregs = VirtRegs::new();
        virtregs.compute(&insts, 0, 0);
        assert_ne!(virtregs.vreg_of(Temp::new(1)), virtregs.vreg_of(Temp::new(0)));
        assert_eq!(
            virtregs.class_of(virtregs.vreg_of(Temp::new(1))),
            VRegClass::Temp
        );
    }
}
