//! Register-file snapshot, indexed by DWARF register number.
//!
//! The unwinder works entirely in DWARF numbering: the CFI row names the
//! registers it restores by their DWARF numbers, so storing the snapshot in
//! the same numbering avoids a translation table on every rule. Providers
//! translate once, at capture time (from `user_regs_struct` for a live
//! thread, or from the `pr_reg` block of an `NT_PRSTATUS` note for a core).

use gimli::Register;

/// Target machine of a register snapshot.
///
/// Derived from `e_machine` of the image that supplied the registers; the
/// unwinder uses it only for the handful of per-architecture constants
/// below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine
{
    /// AMD64 / x86-64 (`EM_X86_64`).
    X86_64,
    /// AArch64 (`EM_AARCH64`).
    Aarch64,
    /// Anything else; registers cannot be decoded.
    Other(u16),
}

impl Machine
{
    pub fn from_elf(e_machine: u16) -> Self
    {
        match e_machine {
            62 => Machine::X86_64,
            183 => Machine::Aarch64,
            other => Machine::Other(other),
        }
    }

    /// DWARF number of the stack pointer.
    pub fn sp_register(self) -> Option<Register>
    {
        match self {
            Machine::X86_64 => Some(Register(7)),
            Machine::Aarch64 => Some(Register(31)),
            Machine::Other(_) => None,
        }
    }

    /// DWARF number of the conventional frame pointer.
    pub fn fp_register(self) -> Option<Register>
    {
        match self {
            Machine::X86_64 => Some(Register(6)),
            Machine::Aarch64 => Some(Register(29)),
            Machine::Other(_) => None,
        }
    }

    pub fn pointer_size(self) -> u8
    {
        8
    }
}

/// Snapshot of a thread's general-purpose registers.
///
/// At most 32 DWARF-numbered slots are tracked, which covers the integer
/// register files of both supported architectures. The program counter is
/// held separately because it has no DWARF number of its own on x86-64
/// (number 16 is the *return address* column there).
#[derive(Debug, Clone)]
pub struct RegisterFile
{
    machine: Machine,
    pc: u64,
    regs: [u64; 32],
    valid: u32,
}

impl RegisterFile
{
    pub fn new(machine: Machine) -> Self
    {
        Self {
            machine,
            pc: 0,
            regs: [0; 32],
            valid: 0,
        }
    }

    pub fn machine(&self) -> Machine
    {
        self.machine
    }

    pub fn pc(&self) -> u64
    {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64)
    {
        self.pc = pc;
    }

    /// Value of a register by DWARF number, if it was captured and not
    /// invalidated by an `undefined` CFI rule.
    pub fn get(&self, reg: Register) -> Option<u64>
    {
        let n = reg.0 as usize;
        if n < 32 && self.valid & (1 << n) != 0 {
            Some(self.regs[n])
        } else {
            None
        }
    }

    pub fn set(&mut self, reg: Register, value: u64)
    {
        let n = reg.0 as usize;
        if n < 32 {
            self.regs[n] = value;
            self.valid |= 1 << n;
        }
    }

    pub fn clear(&mut self, reg: Register)
    {
        let n = reg.0 as usize;
        if n < 32 {
            self.valid &= !(1 << n);
        }
    }

    pub fn sp(&self) -> Option<u64>
    {
        self.machine.sp_register().and_then(|r| self.get(r))
    }

    pub fn fp(&self) -> Option<u64>
    {
        self.machine.fp_register().and_then(|r| self.get(r))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn set_get_clear()
    {
        let mut regs = RegisterFile::new(Machine::X86_64);
        assert_eq!(regs.get(Register(7)), None);
        regs.set(Register(7), 0x7fff_0000);
        assert_eq!(regs.sp(), Some(0x7fff_0000));
        regs.clear(Register(7));
        assert_eq!(regs.sp(), None);
        // Out-of-range numbers are ignored rather than panicking.
        regs.set(Register(99), 1);
        assert_eq!(regs.get(Register(99)), None);
    }

    #[test]
    fn machine_constants()
    {
        assert_eq!(Machine::from_elf(62), Machine::X86_64);
        assert_eq!(Machine::from_elf(183), Machine::Aarch64);
        assert_eq!(Machine::X86_64.fp_register(), Some(Register(6)));
        assert_eq!(Machine::Aarch64.sp_register(), Some(Register(31)));
    }
}
