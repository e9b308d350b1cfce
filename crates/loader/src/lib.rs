use anyhow::{Context, Result};
use goblin::elf::section_header::SHN_UNDEF;
use goblin::elf::sym::STT_FUNC;
use goblin::elf::Elf;
use qsnap_core::kernel::KERNEL_HANDLERS;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

fn with_elf<T>(path: &Path, f: impl FnOnce(&Elf) -> Result<T>) -> Result<T> {
    let buffer = fs::read(path).with_context(|| format!("Failed to read ELF file: {:?}", path))?;
    let elf = Elf::parse(&buffer).context("Failed to parse ELF binary")?;
    f(&elf)
}

/// Every defined function symbol with its value. For a position independent
/// executable the values are offsets from the load base.
pub fn load_function_symbols(path: &Path) -> Result<BTreeMap<String, u64>> {
    with_elf(path, |elf| {
        let mut symbols = BTreeMap::new();
        let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
        for (syms, strtab) in tables {
            for sym in syms.iter() {
                if sym.st_type() != STT_FUNC
                    || sym.st_shndx == SHN_UNDEF as usize
                    || sym.st_value == 0
                {
                    continue;
                }
                if let Some(name) = strtab.get_at(sym.st_name).filter(|n| !n.is_empty()) {
                    symbols.entry(name.to_string()).or_insert(sym.st_value);
                }
            }
        }

        if symbols.is_empty() {
            warn!("No function symbols found in {:?}", path);
        } else {
            info!("Loaded {} function symbols from {:?}", symbols.len(), path);
        }
        Ok(symbols)
    })
}

/// Look up specific symbols of any type. Missing names are left out.
pub fn resolve_symbols(path: &Path, names: &[&str]) -> Result<BTreeMap<String, u64>> {
    with_elf(path, |elf| {
        let mut found = BTreeMap::new();
        for sym in elf.syms.iter() {
            let Some(name) = elf.strtab.get_at(sym.st_name) else {
                continue;
            };
            if names.contains(&name) && sym.st_shndx != SHN_UNDEF as usize {
                debug!("{} = {:#x}", name, sym.st_value);
                found.insert(name.to_string(), sym.st_value);
            }
        }
        for name in names.iter().filter(|n| !found.contains_key(**n)) {
            warn!("Symbol {} not found in {:?}", name, path);
        }
        Ok(found)
    })
}

/// Address-store entries for the guest kernel's fault and syscall handlers.
pub fn kernel_handler_addresses(image: &Path) -> Result<BTreeMap<String, u64>> {
    let names: Vec<&str> = KERNEL_HANDLERS.iter().map(|(_, sym)| *sym).collect();
    let resolved = resolve_symbols(image, &names)?;
    Ok(KERNEL_HANDLERS
        .iter()
        .filter_map(|(key, sym)| resolved.get(*sym).map(|addr| (key.to_string(), *addr)))
        .collect())
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_functions_of_own_executable() {
        let exe = std::env::current_exe().unwrap();
        let symbols = load_function_symbols(&exe).unwrap();
        assert!(symbols.contains_key("main"));
        assert!(symbols.values().all(|&v| v != 0));

        let found = resolve_symbols(&exe, &["main", "no_such_symbol_here"]).unwrap();
        assert_eq!(found.get("main"), symbols.get("main"));
        assert!(!found.contains_key("no_such_symbol_here"));
    }

    #[test]
    fn test_kernel_handlers_missing_from_userspace_binary() {
        let exe = std::env::current_exe().unwrap();
        assert!(kernel_handler_addresses(&exe).unwrap().is_empty());
    }

    #[test]
    fn test_not_an_elf() {
        let path = std::env::temp_dir().join(format!("qsnap-loader-{}", std::process::id()));
        std::fs::write(&path, b"not an elf").unwrap();
        assert!(load_function_symbols(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
