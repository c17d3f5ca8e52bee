//! Native module header inspection.
//!
//! Reads the first few kilobytes of a file and classifies it as an ELF, PE or
//! Mach-O image, without loading it. Used to reject files that are not native
//! code modules before the loader or the signing verifier look at them.

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PluginHostError, Result};

/// How much of a file is read for inspection.
const HEADER_LEN: u64 = 4096;

/// Container format of a native module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKind {
    Elf,
    Pe,
    MachO,
}

/// Target machine of a native module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    X86,
    X86_64,
    Arm,
    Aarch64,
    Other(u32),
}

impl Arch {
    /// Architecture of the running host.
    pub fn host() -> Option<Self> {
        match std::env::consts::ARCH {
            "x86" => Some(Arch::X86),
            "x86_64" => Some(Arch::X86_64),
            "arm" => Some(Arch::Arm),
            "aarch64" => Some(Arch::Aarch64),
            _ => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86 => f.write_str("x86"),
            Arch::X86_64 => f.write_str("x86_64"),
            Arch::Arm => f.write_str("arm"),
            Arch::Aarch64 => f.write_str("aarch64"),
            Arch::Other(code) => write!(f, "machine 0x{:x}", code),
        }
    }
}

/// Format facts read from a module header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleFormat {
    pub kind: ModuleKind,
    pub arch: Arch,
    pub bits: u8,
}

impl ModuleFormat {
    /// Inspect the file at `path`.
    pub fn inspect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                PluginHostError::ModuleNotFound(path.display().to_string())
            }
            _ => PluginHostError::Io(e),
        })?;

        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        file.take(HEADER_LEN).read_to_end(&mut header)?;

        Self::parse(&header).map_err(|reason| PluginHostError::bad_format(path, reason))
    }

    /// Classify a header. `bytes` should hold at least the first 4 KiB of the file.
    pub fn parse(bytes: &[u8]) -> std::result::Result<Self, String> {
        match bytes {
            [0x7f, b'E', b'L', b'F', ..] => parse_elf(bytes),
            [b'M', b'Z', ..] => parse_pe(bytes),
            _ => match read_u32(bytes, 0, Endian::Big) {
                Some(MH_MAGIC | MH_MAGIC_64 | MH_CIGAM | MH_CIGAM_64) => parse_macho(bytes),
                Some(FAT_MAGIC) => parse_fat(bytes),
                _ => Err("unrecognized file header".to_string()),
            },
        }
    }

    /// Whether the host could load this module.
    pub fn matches_host(&self) -> bool {
        let kind = if cfg!(target_os = "windows") {
            ModuleKind::Pe
        } else if cfg!(target_vendor = "apple") {
            ModuleKind::MachO
        } else {
            ModuleKind::Elf
        };

        self.kind == kind
            && Some(self.arch) == Arch::host()
            && u32::from(self.bits) == usize::BITS
    }
}

impl fmt::Display for ModuleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} ({}-bit)", self.kind, self.arch, self.bits)
    }
}

#[derive(Clone, Copy)]
enum Endian {
    Little,
    Big,
}

fn read_u16(bytes: &[u8], offset: usize, endian: Endian) -> Option<u16> {
    let raw: [u8; 2] = bytes.get(offset..offset + 2)?.try_into().ok()?;
    Some(match endian {
        Endian::Little => u16::from_le_bytes(raw),
        Endian::Big => u16::from_be_bytes(raw),
    })
}

fn read_u32(bytes: &[u8], offset: usize, endian: Endian) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
    Some(match endian {
        Endian::Little => u32::from_le_bytes(raw),
        Endian::Big => u32::from_be_bytes(raw),
    })
}

// ELF
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_386: u16 = 3;
const EM_ARM: u16 = 40;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

fn parse_elf(bytes: &[u8]) -> std::result::Result<ModuleFormat, String> {
    let bits = match bytes.get(4) {
        Some(1) => 32,
        Some(2) => 64,
        _ => return Err("invalid ELF class".to_string()),
    };
    let endian = match bytes.get(5) {
        Some(1) => Endian::Little,
        Some(2) => Endian::Big,
        _ => return Err("invalid ELF data encoding".to_string()),
    };

    let e_type = read_u16(bytes, 16, endian).ok_or("truncated ELF header")?;
    if e_type != ET_DYN && e_type != ET_EXEC {
        return Err(format!("ELF object type {} is not loadable", e_type));
    }

    let machine = read_u16(bytes, 18, endian).ok_or("truncated ELF header")?;
    let arch = match machine {
        EM_386 => Arch::X86,
        EM_X86_64 => Arch::X86_64,
        EM_ARM => Arch::Arm,
        EM_AARCH64 => Arch::Aarch64,
        other => Arch::Other(u32::from(other)),
    };

    Ok(ModuleFormat {
        kind: ModuleKind::Elf,
        arch,
        bits,
    })
}

// PE
const PE_SIGNATURE: u32 = 0x0000_4550;
const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
const IMAGE_FILE_MACHINE_ARMNT: u16 = 0x01c4;
const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;
const IMAGE_FILE_MACHINE_ARM64: u16 = 0xaa64;
const PE32_MAGIC: u16 = 0x010b;
const PE32_PLUS_MAGIC: u16 = 0x020b;

fn parse_pe(bytes: &[u8]) -> std::result::Result<ModuleFormat, String> {
    let pe_offset = read_u32(bytes, 0x3c, Endian::Little).ok_or("truncated DOS header")? as usize;
    if read_u32(bytes, pe_offset, Endian::Little) != Some(PE_SIGNATURE) {
        return Err("missing PE signature".to_string());
    }

    let coff = pe_offset + 4;
    let machine = read_u16(bytes, coff, Endian::Little).ok_or("truncated COFF header")?;
    let optional_magic =
        read_u16(bytes, coff + 20, Endian::Little).ok_or("missing optional header")?;

    let bits = match optional_magic {
        PE32_MAGIC => 32,
        PE32_PLUS_MAGIC => 64,
        other => return Err(format!("unknown optional header magic 0x{:x}", other)),
    };

    let arch = match machine {
        IMAGE_FILE_MACHINE_I386 => Arch::X86,
        IMAGE_FILE_MACHINE_AMD64 => Arch::X86_64,
        IMAGE_FILE_MACHINE_ARMNT => Arch::Arm,
        IMAGE_FILE_MACHINE_ARM64 => Arch::Aarch64,
        other => Arch::Other(u32::from(other)),
    };

    Ok(ModuleFormat {
        kind: ModuleKind::Pe,
        arch,
        bits,
    })
}

// Mach-O, magic read big-endian
const MH_MAGIC: u32 = 0xfeed_face;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_CIGAM: u32 = 0xcefa_edfe;
const MH_CIGAM_64: u32 = 0xcffa_edfe;
const FAT_MAGIC: u32 = 0xcafe_babe;
const CPU_ARCH_ABI64: u32 = 0x0100_0000;
const CPU_TYPE_X86: u32 = 7;
const CPU_TYPE_ARM: u32 = 12;
const MAX_FAT_ARCHS: u32 = 32;

fn macho_arch(cputype: u32) -> Arch {
    match cputype {
        CPU_TYPE_X86 => Arch::X86,
        t if t == CPU_TYPE_X86 | CPU_ARCH_ABI64 => Arch::X86_64,
        CPU_TYPE_ARM => Arch::Arm,
        t if t == CPU_TYPE_ARM | CPU_ARCH_ABI64 => Arch::Aarch64,
        other => Arch::Other(other),
    }
}

fn parse_macho(bytes: &[u8]) -> std::result::Result<ModuleFormat, String> {
    let magic = read_u32(bytes, 0, Endian::Big).ok_or("truncated Mach-O header")?;
    let (endian, bits) = match magic {
        MH_MAGIC => (Endian::Big, 32),
        MH_MAGIC_64 => (Endian::Big, 64),
        MH_CIGAM => (Endian::Little, 32),
        _ => (Endian::Little, 64),
    };

    let cputype = read_u32(bytes, 4, endian).ok_or("truncated Mach-O header")?;
    Ok(ModuleFormat {
        kind: ModuleKind::MachO,
        arch: macho_arch(cputype),
        bits,
    })
}

/// Universal binary: reports the host's slice if present, else the first one.
fn parse_fat(bytes: &[u8]) -> std::result::Result<ModuleFormat, String> {
    let count = read_u32(bytes, 4, Endian::Big).ok_or("truncated fat header")?;
    // Java class files share the magic; their version field is far above this
    if count == 0 || count > MAX_FAT_ARCHS {
        return Err("not a universal binary".to_string());
    }

    let mut slices = Vec::new();
    for i in 0..count as usize {
        let cputype = read_u32(bytes, 8 + i * 20, Endian::Big).ok_or("truncated fat header")?;
        slices.push(macho_arch(cputype));
    }

    let host = Arch::host();
    let arch = slices
        .iter()
        .copied()
        .find(|arch| Some(*arch) == host)
        .unwrap_or(slices[0]);

    let bits = match arch {
        Arch::X86 | Arch::Arm => 32,
        _ => 64,
    };

    Ok(ModuleFormat {
        kind: ModuleKind::MachO,
        arch,
        bits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elf_header(class: u8, machine: u16, e_type: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; 64];
        bytes[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        bytes[4] = class;
        bytes[5] = 1;
        bytes[16..18].copy_from_slice(&e_type.to_le_bytes());
        bytes[18..20].copy_from_slice(&machine.to_le_bytes());
        bytes
    }

    #[test]
    fn test_parse_elf() {
        let format = ModuleFormat::parse(&elf_header(2, EM_X86_64, ET_DYN)).unwrap();
        assert_eq!(format.kind, ModuleKind::Elf);
        assert_eq!(format.arch, Arch::X86_64);
        assert_eq!(format.bits, 64);

        let format = ModuleFormat::parse(&elf_header(1, EM_ARM, ET_DYN)).unwrap();
        assert_eq!(format.arch, Arch::Arm);
        assert_eq!(format.bits, 32);
    }

    #[test]
    fn test_relocatable_elf_is_rejected() {
        assert!(ModuleFormat::parse(&elf_header(2, EM_X86_64, 1)).is_err());
    }

    #[test]
    fn test_parse_pe() {
        let mut bytes = vec![0u8; 512];
        bytes[..2].copy_from_slice(b"MZ");
        bytes[0x3c..0x40].copy_from_slice(&0x80u32.to_le_bytes());
        bytes[0x80..0x84].copy_from_slice(b"PE\0\0");
        bytes[0x84..0x86].copy_from_slice(&IMAGE_FILE_MACHINE_AMD64.to_le_bytes());
        bytes[0x98..0x9a].copy_from_slice(&PE32_PLUS_MAGIC.to_le_bytes());

        let format = ModuleFormat::parse(&bytes).unwrap();
        assert_eq!(format.kind, ModuleKind::Pe);
        assert_eq!(format.arch, Arch::X86_64);
        assert_eq!(format.bits, 64);
    }

    #[test]
    fn test_parse_macho() {
        let mut bytes = vec![0u8; 32];
        bytes[..4].copy_from_slice(&MH_MAGIC_64.to_le_bytes());
        bytes[4..8].copy_from_slice(&(CPU_TYPE_ARM | CPU_ARCH_ABI64).to_le_bytes());

        let format = ModuleFormat::parse(&bytes).unwrap();
        assert_eq!(format.kind, ModuleKind::MachO);
        assert_eq!(format.arch, Arch::Aarch64);
        assert_eq!(format.bits, 64);
    }

    #[test]
    fn test_text_is_not_a_module() {
        assert!(ModuleFormat::parse(b"#!/bin/sh\necho hi\n").is_err());
        assert!(ModuleFormat::parse(b"").is_err());
        assert!(ModuleFormat::parse(&[0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 52]).is_err());
    }

    #[test]
    fn test_running_binary_matches_host() {
        let exe = std::env::current_exe().unwrap();
        let format = ModuleFormat::inspect(&exe).unwrap();
        assert!(format.matches_host(), "{}", format);
    }

    #[test]
    fn test_inspect_text_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.so");
        std::fs::write(&path, "not a library").unwrap();
        assert!(matches!(
            ModuleFormat::inspect(&path),
            Err(PluginHostError::BadModuleFormat { .. })
        ));
    }
}
