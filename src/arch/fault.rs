//! # Fault Reporting
//!
//! Decodes the Cortex-M fault status registers into named bits. The
//! configurable fault status register (CFSR) packs three sub-registers:
//!
//! ```text
//!   31            16 15      8 7       0
//!  ┌────────────────┬─────────┬─────────┐
//!  │      UFSR      │  BFSR   │  MMFSR  │
//!  └────────────────┴─────────┴─────────┘
//! ```
//!
//! The decoding is plain bit arithmetic so it runs on the host too; the
//! Cortex-M7 port reads the registers and calls [`report`].

use core::fmt;

/// Which handler caught the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    MemoryManagement,
    BusFault,
    UsageFault,
    HardFault,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::MemoryManagement => "memory management fault",
            FaultKind::BusFault => "bus fault",
            FaultKind::UsageFault => "usage fault",
            FaultKind::HardFault => "hard fault",
        };
        f.write_str(name)
    }
}

// MMFSR
pub const IACCVIOL: u32 = 1 << 0;
pub const DACCVIOL: u32 = 1 << 1;
pub const MUNSTKERR: u32 = 1 << 3;
pub const MSTKERR: u32 = 1 << 4;
pub const MLSPERR: u32 = 1 << 5;
pub const MMARVALID: u32 = 1 << 7;

// BFSR
pub const IBUSERR: u32 = 1 << 8;
pub const PRECISERR: u32 = 1 << 9;
pub const IMPRECISERR: u32 = 1 << 10;
pub const UNSTKERR: u32 = 1 << 11;
pub const STKERR: u32 = 1 << 12;
pub const LSPERR: u32 = 1 << 13;
pub const BFARVALID: u32 = 1 << 15;

// UFSR
pub const UNDEFINSTR: u32 = 1 << 16;
pub const INVSTATE: u32 = 1 << 17;
pub const INVPC: u32 = 1 << 18;
pub const NOCP: u32 = 1 << 19;
pub const UNALIGNED: u32 = 1 << 24;
pub const DIVBYZERO: u32 = 1 << 25;

// HFSR
pub const VECTTBL: u32 = 1 << 1;
pub const FORCED: u32 = 1 << 30;
pub const DEBUGEVT: u32 = 1 << 31;

static CFSR_BITS: [(u32, &str); 19] = [
    (IACCVIOL, "IACCVIOL"),
    (DACCVIOL, "DACCVIOL"),
    (MUNSTKERR, "MUNSTKERR"),
    (MSTKERR, "MSTKERR"),
    (MLSPERR, "MLSPERR"),
    (MMARVALID, "MMARVALID"),
    (IBUSERR, "IBUSERR"),
    (PRECISERR, "PRECISERR"),
    (IMPRECISERR, "IMPRECISERR"),
    (UNSTKERR, "UNSTKERR"),
    (STKERR, "STKERR"),
    (LSPERR, "LSPERR"),
    (BFARVALID, "BFARVALID"),
    (UNDEFINSTR, "UNDEFINSTR"),
    (INVSTATE, "INVSTATE"),
    (INVPC, "INVPC"),
    (NOCP, "NOCP"),
    (UNALIGNED, "UNALIGNED"),
    (DIVBYZERO, "DIVBYZERO"),
];

static HFSR_BITS: [(u32, &str); 3] = [
    (VECTTBL, "VECTTBL"),
    (FORCED, "FORCED"),
    (DEBUGEVT, "DEBUGEVT"),
];

/// Snapshot of the fault status and address registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStatus {
    pub cfsr: u32,
    pub hfsr: u32,
    pub mmfar: u32,
    pub bfar: u32,
}

impl FaultStatus {
    /// Names of the CFSR and HFSR bits that are set, CFSR first.
    pub fn flags(&self) -> impl Iterator<Item = &'static str> + '_ {
        let cfsr = CFSR_BITS
            .iter()
            .filter(move |(bit, _)| self.cfsr & bit != 0);
        let hfsr = HFSR_BITS
            .iter()
            .filter(move |(bit, _)| self.hfsr & bit != 0);
        cfsr.chain(hfsr).map(|&(_, name)| name)
    }

    /// Faulting data address, when MMFAR holds one.
    pub fn memory_address(&self) -> Option<u32> {
        (self.cfsr & MMARVALID != 0).then_some(self.mmfar)
    }

    /// Faulting bus address, when BFAR holds one.
    pub fn bus_address(&self) -> Option<u32> {
        (self.cfsr & BFARVALID != 0).then_some(self.bfar)
    }

    /// A configurable fault escalated to HardFault.
    pub fn escalated(&self) -> bool {
        self.hfsr & FORCED != 0
    }
}

impl fmt::Display for FaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cfsr={:#010x} hfsr={:#010x} [", self.cfsr, self.hfsr)?;
        for (i, name) in self.flags().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(name)?;
        }
        f.write_str("]")?;
        if let Some(address) = self.memory_address() {
            write!(f, " mmfar={:#010x}", address)?;
        }
        if let Some(address) = self.bus_address() {
            write!(f, " bfar={:#010x}", address)?;
        }
        Ok(())
    }
}

/// Log a fault. `pc` is the stacked program counter when the handler has
/// the exception frame.
pub fn report(kind: FaultKind, status: &FaultStatus, pc: Option<u32>) {
    match pc {
        Some(pc) => log::error!("{} at pc={:#010x}: {}", kind, pc, status),
        None => log::error!("{}: {}", kind, status),
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::format;
    use std::vec::Vec;

    #[test]
    fn test_data_access_violation() {
        let status = FaultStatus {
            cfsr: DACCVIOL | MMARVALID,
            hfsr: 0,
            mmfar: 0x2040_0000,
            bfar: 0xDEAD_BEEF,
        };
        assert_eq!(status.flags().collect::<Vec<_>>(), ["DACCVIOL", "MMARVALID"]);
        assert_eq!(status.memory_address(), Some(0x2040_0000));
        assert_eq!(status.bus_address(), None);
        assert_eq!(
            format!("{}", status),
            "cfsr=0x00000082 hfsr=0x00000000 [DACCVIOL MMARVALID] mmfar=0x20400000"
        );
    }

    #[test]
    fn test_precise_bus_error_address() {
        let status = FaultStatus {
            cfsr: PRECISERR | BFARVALID,
            bfar: 0x6000_0010,
            ..FaultStatus::default()
        };
        assert_eq!(status.bus_address(), Some(0x6000_0010));
        assert_eq!(status.memory_address(), None);
        assert!(format!("{}", status).ends_with("[PRECISERR BFARVALID] bfar=0x60000010"));
    }

    #[test]
    fn test_usage_fault_bits_in_upper_halfword() {
        let status = FaultStatus {
            cfsr: UNDEFINSTR | INVSTATE | INVPC | NOCP | UNALIGNED | DIVBYZERO,
            ..FaultStatus::default()
        };
        assert_eq!(
            status.flags().collect::<Vec<_>>(),
            ["UNDEFINSTR", "INVSTATE", "INVPC", "NOCP", "UNALIGNED", "DIVBYZERO"]
        );
        assert_eq!(status.cfsr & 0xFFFF, 0);
    }

    #[test]
    fn test_escalated_stacking_fault() {
        let status = FaultStatus {
            cfsr: STKERR | MSTKERR,
            hfsr: FORCED,
            ..FaultStatus::default()
        };
        assert!(status.escalated());
        assert_eq!(
            status.flags().collect::<Vec<_>>(),
            ["MSTKERR", "STKERR", "FORCED"]
        );
    }

    #[test]
    fn test_clear_status_has_no_flags() {
        let status = FaultStatus::default();
        assert_eq!(status.flags().count(), 0);
        assert!(!status.escalated());
        assert_eq!(format!("{}", status), "cfsr=0x00000000 hfsr=0x00000000 []");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(format!("{}", FaultKind::UsageFault), "usage fault");
        assert_eq!(format!("{}", FaultKind::HardFault), "hard fault");
    }
}
