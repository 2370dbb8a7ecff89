use std::io::{self, Read};
use std::path::Path;

use super::release::Arch;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_LSB: u8 = 1;

/// ELF 头检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfCheck {
    Valid,
    NotElf,
    Not64Bit,
    WrongMachine(u16),
}

/// 检查文件头是否为目标架构的 64 位小端 ELF
///
/// 这只是格式检查，用来拒绝错误页、截断文件和同名脚本；
/// 它不能证明文件来自发布者。
pub fn inspect(header: &[u8], arch: Arch) -> ElfCheck {
    if header.len() < 20 || header[..4] != ELF_MAGIC {
        return ElfCheck::NotElf;
    }
    if header[4] != ELF_CLASS_64 || header[5] != ELF_DATA_LSB {
        return ElfCheck::Not64Bit;
    }
    let machine = u16::from_le_bytes([header[18], header[19]]);
    if machine != arch.elf_machine() {
        return ElfCheck::WrongMachine(machine);
    }
    ElfCheck::Valid
}

pub fn inspect_file(path: &Path, arch: Arch) -> io::Result<ElfCheck> {
    let mut header = [0u8; 20];
    let mut file = std::fs::File::open(path)?;
    let mut filled = 0;
    while filled < header.len() {
        let n = file.read(&mut header[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(inspect(&header[..filled], arch))
}

#[cfg(test)]
pub(crate) fn fake_elf(arch: Arch) -> Vec<u8> {
    let mut bytes = vec![0u8; 64];
    bytes[..4].copy_from_slice(&ELF_MAGIC);
    bytes[4] = ELF_CLASS_64;
    bytes[5] = ELF_DATA_LSB;
    bytes[18..20].copy_from_slice(&arch.elf_machine().to_le_bytes());
    bytes
}
