//! The register file handed to the fuzzer alongside `mem.dmp`.
//!
//! Every numeric field is a `0x`-prefixed hex string; the consumer parses
//! them with `strtoull(.., 0)` and rejects the snapshot if any is missing.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::CaptureResult;

pub const APIC_BASE_DEFAULT: u64 = 0xfee0_0900;
pub const SFMASK_DEFAULT: u64 = 0x4700;
pub const FPCW_DEFAULT: u64 = 0x27f;
/// Marks an empty x87 slot; the consumer then resets the tag word itself.
pub const FPST_EMPTY: &str = "0x-Infinity";

/// Type field value of a busy 64-bit TSS.
pub const BUSY_TSS64: u64 = 0xb;

mod hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:#x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let text = String::deserialize(d)?;
        qsnap_config::parse_u64(&text).map_err(serde::de::Error::custom)
    }
}

/// Descriptor flags as the host keeps them, turned into the attribute word
/// of a descriptor-table entry: bits 8..16 of the flags, with bits 16..20
/// of the limit folded in as the high nibble.
pub fn recode_segment_attr(flags: u32, limit: u32) -> u64 {
    ((flags >> 8) | ((limit & 0xF0000) >> 8)) as u64
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub present: bool,
    #[serde(with = "hex")]
    pub selector: u64,
    #[serde(with = "hex")]
    pub base: u64,
    #[serde(with = "hex")]
    pub limit: u64,
    #[serde(with = "hex")]
    pub attr: u64,
}

impl Segment {
    pub fn from_raw(selector: u32, base: u64, limit: u32, flags: u32) -> Self {
        Self {
            present: true,
            selector: selector as u64,
            base,
            limit: limit as u64,
            attr: recode_segment_attr(flags, limit),
        }
    }

    /// Same as [`Segment::from_raw`], with the busy 64-bit TSS type forced on.
    pub fn task_register(selector: u32, base: u64, limit: u32, flags: u32) -> Self {
        let mut seg = Self::from_raw(selector, base, limit, flags);
        seg.attr |= BUSY_TSS64;
        seg
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalSegment {
    #[serde(with = "hex")]
    pub base: u64,
    #[serde(with = "hex")]
    pub limit: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    #[serde(with = "hex")]
    pub rax: u64,
    #[serde(with = "hex")]
    pub rcx: u64,
    #[serde(with = "hex")]
    pub rdx: u64,
    #[serde(with = "hex")]
    pub rbx: u64,
    #[serde(with = "hex")]
    pub rsp: u64,
    #[serde(with = "hex")]
    pub rbp: u64,
    #[serde(with = "hex")]
    pub rsi: u64,
    #[serde(with = "hex")]
    pub rdi: u64,
    #[serde(with = "hex")]
    pub r8: u64,
    #[serde(with = "hex")]
    pub r9: u64,
    #[serde(with = "hex")]
    pub r10: u64,
    #[serde(with = "hex")]
    pub r11: u64,
    #[serde(with = "hex")]
    pub r12: u64,
    #[serde(with = "hex")]
    pub r13: u64,
    #[serde(with = "hex")]
    pub r14: u64,
    #[serde(with = "hex")]
    pub r15: u64,
    #[serde(with = "hex")]
    pub rip: u64,
    #[serde(with = "hex")]
    pub rflags: u64,

    #[serde(with = "hex")]
    pub dr0: u64,
    #[serde(with = "hex")]
    pub dr1: u64,
    #[serde(with = "hex")]
    pub dr2: u64,
    #[serde(with = "hex")]
    pub dr3: u64,
    #[serde(with = "hex")]
    pub dr6: u64,
    #[serde(with = "hex")]
    pub dr7: u64,

    pub es: Segment,
    pub cs: Segment,
    pub ss: Segment,
    pub ds: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub tr: Segment,
    pub ldtr: Segment,

    #[serde(with = "hex")]
    pub tsc: u64,
    #[serde(with = "hex")]
    pub sysenter_cs: u64,
    #[serde(with = "hex")]
    pub sysenter_esp: u64,
    #[serde(with = "hex")]
    pub sysenter_eip: u64,
    #[serde(with = "hex")]
    pub pat: u64,
    #[serde(with = "hex")]
    pub efer: u64,
    #[serde(with = "hex")]
    pub star: u64,
    #[serde(with = "hex")]
    pub lstar: u64,
    #[serde(with = "hex")]
    pub cstar: u64,
    #[serde(with = "hex")]
    pub fmask: u64,
    #[serde(with = "hex")]
    pub kernel_gs_base: u64,
    #[serde(with = "hex")]
    pub tsc_aux: u64,
    #[serde(with = "hex")]
    pub mxcsr: u64,

    #[serde(with = "hex")]
    pub cr0: u64,
    #[serde(with = "hex")]
    pub cr2: u64,
    #[serde(with = "hex")]
    pub cr3: u64,
    #[serde(with = "hex")]
    pub cr4: u64,
    #[serde(with = "hex")]
    pub cr8: u64,
    #[serde(with = "hex")]
    pub xcr0: u64,

    pub gdtr: GlobalSegment,
    pub idtr: GlobalSegment,

    #[serde(with = "hex")]
    pub fpop: u64,
    #[serde(with = "hex")]
    pub apic_base: u64,
    #[serde(with = "hex")]
    pub sfmask: u64,
    #[serde(with = "hex")]
    pub fpcw: u64,
    #[serde(with = "hex")]
    pub fpsw: u64,
    #[serde(with = "hex")]
    pub fptw: u64,
    #[serde(with = "hex")]
    pub mxcsr_mask: u64,
    pub fpst: [String; 8],
}

impl RegisterFile {
    /// Write as JSON through a temporary file, so a reader watching `path`
    /// never sees a partial object.
    pub fn write_to(&self, path: &Path) -> CaptureResult<()> {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn from_file(path: &Path) -> CaptureResult<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_recoding_flat_data_segment() {
        assert_eq!(
            recode_segment_attr(0x0093, 0xFFFFF),
            (0x0093 >> 8) | ((0xFFFFF & 0xF0000) >> 8)
        );
        assert_eq!(recode_segment_attr(0x0093, 0xFFFFF), 0xF00);
    }

    #[test]
    fn test_attr_recoding_long_mode_code() {
        // DESC_P | DESC_S | DESC_L | DESC_G | code/read/accessed, DPL 3
        let flags = 0x00a0_fb00;
        let attr = recode_segment_attr(flags, 0xffff_ffff);
        assert_eq!(attr, 0xa0fb | 0xf00);
        // bits 8..12 of the attribute mirror bits 16..20 of the limit
        assert_eq!((attr >> 8) & 0xf, 0xf);
    }

    #[test]
    fn test_task_register_forces_busy_tss() {
        let tr = Segment::task_register(0x40, 0xfffffe0000003000, 0x4087, 0x8900);
        assert_eq!(tr.attr & 0xf, BUSY_TSS64);
        assert_eq!(tr.attr, 0x89 | BUSY_TSS64);
        assert!(tr.present);
    }

    #[test]
    fn test_segment_serializes_as_hex_strings() {
        let seg = Segment::from_raw(0x2b, 0, 0xffff_ffff, 0x00c0_f300);
        let json = serde_json::to_value(seg).unwrap();
        assert_eq!(json["present"], true);
        assert_eq!(json["selector"], "0x2b");
        assert_eq!(json["base"], "0x0");
        assert_eq!(json["limit"], "0xffffffff");
        assert_eq!(json["attr"], "0xcff3");
    }
}
