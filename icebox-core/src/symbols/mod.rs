//! Per-module symbol indexes.
//!
//! A [`ModuleSymbols`] is an immutable index built once per guest module:
//! every string lives in a single flat arena and entries reference it by
//! slice index, symbols are kept sorted both by name and by offset, and
//! structure members sit in one contiguous table. Parsers for the on-disk
//! debug formats (PDB, DWARF, kallsyms-style text) only ever talk to
//! [`ModuleSymbolsBuilder`].

#[cfg(all(feature = "std", feature = "symbol_files"))]
pub mod dwarf;
#[cfg(all(feature = "std", feature = "symbol_files"))]
pub mod pdb;
pub mod symbols_file;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::ops::ControlFlow;
use core::{fmt, str};

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

use crate::{IceError, IceResult, VirtualAddress};

#[derive(Debug, Clone, Copy)]
struct StrIdx {
    start: u32,
    len: u32,
}

#[derive(Debug, Clone, Copy)]
struct Sym {
    name: StrIdx,
    offset: u64,
}

#[derive(Debug, Clone, Copy)]
struct Struc {
    name: StrIdx,
    size: u64,
    member_start: u32,
    member_end: u32,
}

#[derive(Debug, Clone, Copy)]
struct Member {
    name: StrIdx,
    offset: u64,
}

/// Immutable symbol index of one guest module.
pub struct ModuleSymbols {
    name: Box<str>,
    id: Box<str>,
    arena: Box<[u8]>,
    by_name: Box<[Sym]>,
    by_offset: Box<[Sym]>,
    strucs: Box<[Struc]>,
    members: Box<[Member]>,
}

impl ModuleSymbols {
    #[inline]
    fn string(&self, idx: StrIdx) -> &str {
        let bytes = &self.arena[idx.start as usize..(idx.start + idx.len) as usize];
        str::from_utf8(bytes).expect("the string arena only ever holds UTF-8")
    }

    /// Module name, e.g. `ntkrnlmp.pdb`.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable build id: PDB GUID+age or DWARF build-id.
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn symbol_offset(&self, symbol: &str) -> Option<u64> {
        let i = self
            .by_name
            .binary_search_by(|sym| self.string(sym.name).cmp(symbol))
            .ok()?;
        Some(self.by_name[i].offset)
    }

    pub fn require_symbol(&self, symbol: &str) -> IceResult<u64> {
        self.symbol_offset(symbol)
            .ok_or_else(|| IceError::missing_symbol(symbol))
    }

    /// Nearest symbol at or below `offset`, with the remaining delta.
    pub fn find_symbol(&self, offset: u64) -> Option<(&str, u64)> {
        let i = self.by_offset.partition_point(|sym| sym.offset <= offset);
        let sym = &self.by_offset[i.checked_sub(1)?];
        Some((self.string(sym.name), offset - sym.offset))
    }

    /// Walks symbols in offset order until the callback breaks.
    pub fn list_symbols(&self, mut f: impl FnMut(&str, u64) -> ControlFlow<()>) {
        for sym in &*self.by_offset {
            if f(self.string(sym.name), sym.offset).is_break() {
                break;
            }
        }
    }

    #[inline]
    pub fn symbols_count(&self) -> usize {
        self.by_name.len()
    }

    fn find_struc(&self, name: &str) -> Option<&Struc> {
        let i = self
            .strucs
            .binary_search_by(|struc| self.string(struc.name).cmp(name))
            .ok()?;
        Some(&self.strucs[i])
    }

    pub fn struc(&self, name: &str) -> Option<StructRef> {
        let struc = self.find_struc(name)?;
        Some(StructRef { syms: self, struc })
    }

    pub fn require_struc(&self, name: &str) -> IceResult<StructRef> {
        self.struc(name)
            .ok_or_else(|| IceError::missing_symbol(name))
    }

    pub fn struc_size(&self, name: &str) -> Option<u64> {
        Some(self.find_struc(name)?.size)
    }

    pub fn member_offset(&self, struc: &str, member: &str) -> Option<u64> {
        self.struc(struc)?.find_offset(member)
    }

    pub fn for_each_struc_name(&self, mut f: impl FnMut(&str)) {
        for struc in &*self.strucs {
            f(self.string(struc.name));
        }
    }
}

impl fmt::Debug for ModuleSymbols {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ModuleSymbols")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("symbols", &self.by_name.len())
            .field("strucs", &self.strucs.len())
            .finish()
    }
}

/// Borrowed view of one structure layout.
#[derive(Clone, Copy)]
pub struct StructRef<'a> {
    syms: &'a ModuleSymbols,
    struc: &'a Struc,
}

impl<'a> StructRef<'a> {
    #[inline]
    pub fn name(self) -> &'a str {
        self.syms.string(self.struc.name)
    }

    #[inline]
    pub fn size(self) -> u64 {
        self.struc.size
    }

    fn members(self) -> &'a [Member] {
        &self.syms.members[self.struc.member_start as usize..self.struc.member_end as usize]
    }

    /// Member lookup is case-insensitive, mirroring the way compilers emit
    /// anonymous unions and NT field casing drifts across builds.
    pub fn find_offset(self, member: &str) -> Option<u64> {
        self.members()
            .iter()
            .find(|m| self.syms.string(m.name).eq_ignore_ascii_case(member))
            .map(|m| m.offset)
    }

    pub fn require_offset(self, member: &str) -> IceResult<u64> {
        self.find_offset(member)
            .ok_or_else(|| IceError::missing_field(member, self.name()))
    }

    pub fn for_each_member(self, mut f: impl FnMut(&str, u64)) {
        for m in self.members() {
            f(self.syms.string(m.name), m.offset);
        }
    }
}

impl fmt::Debug for StructRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StructRef")
            .field("name", &self.name())
            .field("size", &self.size())
            .finish()
    }
}

/// Accumulates strings and entries, then freezes them into a
/// [`ModuleSymbols`].
#[derive(Debug, Default)]
pub struct ModuleSymbolsBuilder {
    name: Box<str>,
    id: Box<str>,
    arena: Vec<u8>,
    symbols: Vec<Sym>,
    strucs: Vec<Struc>,
    members: Vec<Member>,
}

impl ModuleSymbolsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(name: &str, id: &str) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn set_identity(&mut self, name: &str, id: &str) {
        self.name = name.into();
        self.id = id.into();
    }

    fn intern(&mut self, s: &str) -> StrIdx {
        let start = self.arena.len() as u32;
        self.arena.extend_from_slice(s.as_bytes());
        StrIdx {
            start,
            len: s.len() as u32,
        }
    }

    pub fn push(&mut self, offset: VirtualAddress, symbol: &str) {
        let name = self.intern(symbol);
        self.symbols.push(Sym {
            name,
            offset: offset.0,
        });
    }

    pub fn add_struc<S, I>(&mut self, name: &str, size: u64, members: I)
    where
        S: AsRef<str>,
        I: IntoIterator<Item = (S, u64)>,
    {
        let name = self.intern(name);
        let member_start = self.members.len() as u32;
        for (member, offset) in members {
            let name = self.intern(member.as_ref());
            self.members.push(Member { name, offset });
        }
        let member_end = self.members.len() as u32;
        self.strucs.push(Struc {
            name,
            size,
            member_start,
            member_end,
        });
    }

    pub fn build(self) -> ModuleSymbols {
        let arena = self.arena.into_boxed_slice();
        let string = |idx: StrIdx| {
            let bytes = &arena[idx.start as usize..(idx.start + idx.len) as usize];
            str::from_utf8(bytes).expect("the string arena only ever holds UTF-8")
        };

        let mut by_name = self.symbols;
        by_name.sort_unstable_by(|a, b| string(a.name).cmp(string(b.name)));

        let mut by_offset = by_name.clone();
        by_offset.sort_by_key(|sym| sym.offset);

        let mut strucs = self.strucs;
        strucs.sort_unstable_by(|a, b| string(a.name).cmp(string(b.name)));

        ModuleSymbols {
            name: self.name,
            id: self.id,
            arena,
            by_name: by_name.into_boxed_slice(),
            by_offset: by_offset.into_boxed_slice(),
            strucs: strucs.into_boxed_slice(),
            members: self.members.into_boxed_slice(),
        }
    }
}

impl<S: AsRef<str>> Extend<(VirtualAddress, S)> for ModuleSymbolsBuilder {
    fn extend<I: IntoIterator<Item = (VirtualAddress, S)>>(&mut self, iter: I) {
        for (offset, symbol) in iter {
            self.push(offset, symbol.as_ref());
        }
    }
}

/// Loads a module's debug data given its name and build id.
pub trait SymbolLoader {
    fn load(&self, name: &str, id: &str) -> IceResult<Option<ModuleSymbols>>;
}

/// Loader that never finds anything; useful without a symbol cache.
#[derive(Debug)]
pub struct EmptyLoader;

impl SymbolLoader for EmptyLoader {
    fn load(&self, _name: &str, _id: &str) -> IceResult<Option<ModuleSymbols>> {
        Ok(None)
    }
}

/// All known modules of a guest, filled lazily as they are encountered.
#[derive(Debug, Default)]
pub struct SymbolsIndexer {
    modules: RefCell<HashMap<Box<str>, Option<Arc<ModuleSymbols>>>>,
}

impl SymbolsIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, module: Arc<ModuleSymbols>) {
        self.modules
            .borrow_mut()
            .insert(name.into(), Some(module));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModuleSymbols>> {
        self.modules.borrow().get(name)?.clone()
    }

    pub fn require(&self, name: &str) -> IceResult<Arc<ModuleSymbols>> {
        match self.modules.borrow().get(name) {
            Some(Some(module)) => Ok(module.clone()),
            _ => Err(IceError::missing_module(name)),
        }
    }

    /// Returns the module, calling `load` at most once per name to fill the
    /// entry. A load that finds nothing is remembered as absent.
    pub fn load_module(
        &self,
        name: &str,
        load: &mut dyn FnMut(&str) -> IceResult<Option<Arc<ModuleSymbols>>>,
    ) -> IceResult<Option<Arc<ModuleSymbols>>> {
        if let Some(module) = self.modules.borrow().get(name) {
            return Ok(module.clone());
        }

        // The borrow is not held across `load`: loaders may consult the
        // indexer themselves.
        let module = load(name)?;
        match self.modules.borrow_mut().entry(name.into()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => Ok(entry.insert(module).clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
struct Guid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

/// The CodeView record a PE image embeds to reference its PDB.
#[derive(Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
pub struct Codeview {
    magic: [u8; 4],
    guid: Guid,
    age: u32,
    name: [u8; 24],
}

impl Codeview {
    /// `GUID` in upper hex (first three fields endian-swapped) followed by
    /// the age in decimal; the key used by symbol servers.
    pub fn pdb_id(&self) -> String {
        use fmt::Write;

        let mut s = String::with_capacity(33);
        (|| {
            let Guid {
                data1,
                data2,
                data3,
                data4,
            } = self.guid;
            write!(s, "{data1:08X}{data2:04X}{data3:04X}")?;
            for x in data4 {
                write!(s, "{x:02X}")?;
            }
            write!(s, "{}", self.age)
        })()
        .expect("Failed to format GUID");
        s
    }

    pub fn name(&self) -> Option<&str> {
        let i = memchr::memchr(0, &self.name)?;
        let name = str::from_utf8(&self.name[..i]).ok()?;
        if !name.as_bytes().iter().all(|c| (0x20..0x80).contains(c)) {
            return None;
        }
        Some(name)
    }
}

impl fmt::Debug for Codeview {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Codeview")
            .field("name", &self.name())
            .field("id", &self.pdb_id())
            .finish()
    }
}

/// Scans an image for its RSDS record with a rolling two-page window, so the
/// whole image never has to sit in memory at once.
pub fn scan_codeview<E>(
    addr: VirtualAddress,
    size: u64,
    try_read_memory: impl Fn(VirtualAddress, &mut [u8]) -> Result<(), E>,
) -> Result<Option<Codeview>, E> {
    let mut buffer = [0; 0x1008];
    try_read_memory(addr, &mut buffer[8..])?;

    for offset in (0..size).step_by(0x1000) {
        for index in memchr::memmem::find_iter(&buffer, b"RSDS") {
            let codeview: Codeview = match &buffer.get(index..index + core::mem::size_of::<Codeview>())
            {
                Some(bytes) => bytemuck::pod_read_unaligned(bytes),
                None => {
                    let mut codeview = bytemuck::Zeroable::zeroed();
                    try_read_memory(
                        addr + offset + index as u64,
                        bytemuck::bytes_of_mut(&mut codeview),
                    )?;
                    codeview
                }
            };

            if codeview.name().is_some() {
                return Ok(Some(codeview));
            }
        }

        buffer.copy_within(0x1000.., 0);
        try_read_memory(addr + offset, &mut buffer[8..])?;
    }

    Ok(None)
}

/// Slice-level variant of [`scan_codeview`] for images already in memory.
pub fn find_codeview(image: &[u8]) -> Option<Codeview> {
    for index in memchr::memmem::find_iter(image, b"RSDS") {
        let bytes = image.get(index..index + core::mem::size_of::<Codeview>())?;
        let codeview: Codeview = bytemuck::pod_read_unaligned(bytes);
        if codeview.name().is_some() {
            return Some(codeview);
        }
    }
    None
}

#[cfg(all(feature = "std", feature = "symbol_files"))]
mod loaders {
    use std::path::{Path, PathBuf};

    use super::{ModuleSymbols, SymbolLoader};
    use crate::{IceResult, ResultExt};

    fn default_cache_root() -> IceResult<PathBuf> {
        match std::env::var_os("_NT_SYMBOL_PATH") {
            Some(path) => Ok(PathBuf::from(path)),

            #[cfg(target_os = "windows")]
            None => Ok(PathBuf::from(r"C:\ProgramData\Dbg\sym")),

            #[cfg(not(target_os = "windows"))]
            None => match std::env::var_os("XDG_CACHE_HOME") {
                Some(cache) => {
                    let mut cache = PathBuf::from(cache);
                    cache.push("PDB");
                    Ok(cache)
                }
                None => {
                    let home =
                        std::env::var_os("HOME").context("cannot find home directory")?;
                    let mut cache = PathBuf::from(home);
                    cache.push(".cache/PDB/");
                    Ok(cache)
                }
            },
        }
    }

    /// Loader over a Microsoft-style symbol cache:
    /// `<root>/<name>/<build-id>/<name>`.
    #[derive(Debug)]
    pub struct PdbLoader {
        root: PathBuf,
    }

    impl PdbLoader {
        pub fn with_default_root() -> IceResult<Self> {
            let root = default_cache_root()?;
            log::info!("Using PDB cache directory at {}", root.display());
            Ok(Self { root })
        }

        pub fn with_root(root: PathBuf) -> Self {
            Self { root }
        }
    }

    impl SymbolLoader for PdbLoader {
        fn load(&self, name: &str, id: &str) -> IceResult<Option<ModuleSymbols>> {
            let components = [&*self.root, name.as_ref(), id.as_ref(), name.as_ref()];
            let path: PathBuf = components.iter().collect();

            if path.exists() {
                log::debug!("Using {}", path.display());
                super::pdb::from_file(&path, name, id).map(Some)
            } else {
                log::debug!("No PDB for {name} ({id}) in cache");
                Ok(None)
            }
        }
    }

    /// Loader over a debuginfo cache keyed by build id:
    /// `<root>/<build-id>/debug`.
    #[derive(Debug)]
    pub struct DwarfLoader {
        root: PathBuf,
    }

    impl DwarfLoader {
        pub fn with_default_root() -> IceResult<Self> {
            Ok(Self {
                root: default_cache_root()?,
            })
        }

        pub fn with_root(root: PathBuf) -> Self {
            Self { root }
        }
    }

    impl SymbolLoader for DwarfLoader {
        fn load(&self, name: &str, id: &str) -> IceResult<Option<ModuleSymbols>> {
            let path: PathBuf = [&*self.root, id.as_ref(), "debug".as_ref()].iter().collect();

            if path.exists() {
                log::debug!("Using {}", path.display());
                super::dwarf::from_file(&path, name, id).map(Some)
            } else {
                Ok(None)
            }
        }
    }

    impl ModuleSymbols {
        /// Reads any supported debug file, sniffing the format from its
        /// magic.
        pub fn from_file<P: AsRef<Path>>(path: P, name: &str, id: &str) -> IceResult<Self> {
            let path = path.as_ref();
            let content = std::fs::read(path)?;

            if content.starts_with(b"Microsoft C/C++ MSF 7.00") {
                super::pdb::from_bytes(&content, name, id)
            } else if content.starts_with(b"\x7fELF") {
                super::dwarf::from_bytes(&content, name, id)
            } else {
                let mut builder = super::ModuleSymbolsBuilder::with_identity(name, id);
                super::symbols_file::read_from_bytes(&content, &mut builder)?;
                Ok(builder.build())
            }
        }
    }
}

#[cfg(all(feature = "std", feature = "symbol_files"))]
pub use loaders::{DwarfLoader, PdbLoader};

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModuleSymbols {
        let mut builder = ModuleSymbolsBuilder::with_identity("sample.pdb", "ABC1");
        builder.push(VirtualAddress(0x400), "PsActiveProcessHead");
        builder.push(VirtualAddress(0x100), "KiSystemCall64");
        builder.push(VirtualAddress(0x250), "PsLoadedModuleList");
        builder.add_struc(
            "_EPROCESS",
            0x500,
            [("UniqueProcessId", 0x1d0u64), ("ActiveProcessLinks", 0x1d8)],
        );
        builder.build()
    }

    #[test]
    fn ordered_lookups() {
        let syms = sample();

        assert_eq!(syms.symbol_offset("KiSystemCall64"), Some(0x100));
        assert_eq!(syms.symbol_offset("PsActiveProcessHead"), Some(0x400));
        assert_eq!(syms.symbol_offset("kisystemcall64"), None);

        let mut offsets = Vec::new();
        syms.list_symbols(|_, offset| {
            offsets.push(offset);
            ControlFlow::Continue(())
        });
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn nearest_symbol() {
        let syms = sample();

        assert_eq!(syms.find_symbol(0x100), Some(("KiSystemCall64", 0)));
        assert_eq!(syms.find_symbol(0x24f), Some(("KiSystemCall64", 0x14f)));
        assert_eq!(syms.find_symbol(0x250), Some(("PsLoadedModuleList", 0)));
        assert_eq!(syms.find_symbol(0x99), None);
    }

    #[test]
    fn struc_members() {
        let syms = sample();

        assert_eq!(syms.struc_size("_EPROCESS"), Some(0x500));
        assert_eq!(syms.member_offset("_EPROCESS", "UniqueProcessId"), Some(0x1d0));
        // Member lookup mirrors compiler conventions: case-insensitive
        assert_eq!(syms.member_offset("_EPROCESS", "uniqueprocessid"), Some(0x1d0));
        assert_eq!(syms.member_offset("_EPROCESS", "Missing"), None);
    }

    #[test]
    fn arena_is_stable() {
        let syms = sample();

        let (first, _) = syms.find_symbol(0x100).unwrap();
        let (second, _) = syms.find_symbol(0x100).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_ptr(), second.as_ptr());
    }

    #[test]
    fn codeview_blob() {
        let mut image = alloc::vec![0u8; 0x300];
        image[0x100..0x104].copy_from_slice(b"RSDS");
        // GUID fields are stored little-endian in the image
        image[0x104..0x108].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        image[0x108..0x10a].copy_from_slice(&0x9abcu16.to_le_bytes());
        image[0x10a..0x10c].copy_from_slice(&0xdef0u16.to_le_bytes());
        image[0x10c..0x114].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        image[0x114..0x118].copy_from_slice(&2u32.to_le_bytes());
        image[0x118..0x125].copy_from_slice(b"ntkrnlmp.pdb\0");

        let codeview = find_codeview(&image).unwrap();
        assert_eq!(codeview.name(), Some("ntkrnlmp.pdb"));
        let id = codeview.pdb_id();
        assert_eq!(id, "123456789ABCDEF001020304050607082");
        assert_eq!(id.len(), 33);
    }

    #[test]
    fn indexer_loads_once() {
        let indexer = SymbolsIndexer::new();
        let mut calls = 0;

        for _ in 0..2 {
            let module = indexer
                .load_module("sample.pdb", &mut |_| {
                    calls += 1;
                    Ok(Some(Arc::new(sample())))
                })
                .unwrap();
            assert!(module.is_some());
        }

        assert_eq!(calls, 1);
        assert!(indexer.require("sample.pdb").is_ok());
        assert!(indexer.require("other.pdb").is_err());
    }
}
