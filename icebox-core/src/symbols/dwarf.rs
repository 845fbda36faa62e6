//! Glue over `object` and `gimli`: symbol tables and structure layouts from
//! ELF debug info.
//!
//! Only structure names, sizes and member offsets are extracted; full type
//! resolution is out of scope for guest introspection.

use alloc::borrow::Cow;
use alloc::string::String;
use alloc::vec::Vec;

use object::{Object, ObjectSection, ObjectSymbol};

use super::{ModuleSymbols, ModuleSymbolsBuilder};
use crate::{IceError, IceResult, VirtualAddress};

type Reader<'a> = gimli::EndianSlice<'a, gimli::RunTimeEndian>;

fn load_symbols(obj: &object::File, builder: &mut ModuleSymbolsBuilder) {
    for symbol in obj.symbols() {
        if let Ok(name) = symbol.name() {
            if !name.is_empty() {
                builder.push(VirtualAddress(symbol.address()), name);
            }
        }
    }
}

fn attr_name<'a>(
    dwarf: &gimli::Dwarf<Reader<'a>>,
    unit: &gimli::Unit<Reader<'a>>,
    entry: &gimli::DebuggingInformationEntry<Reader<'a>>,
) -> gimli::Result<Option<String>> {
    let Some(attr) = entry.attr(gimli::DW_AT_name)? else {
        return Ok(None);
    };
    let name = dwarf.attr_string(unit, attr.value())?;
    Ok(Some(name.to_string()?.to_owned()))
}

fn load_types<'a>(
    dwarf: &gimli::Dwarf<Reader<'a>>,
    builder: &mut ModuleSymbolsBuilder,
) -> gimli::Result<()> {
    let mut units = dwarf.units();

    while let Some(header) = units.next()? {
        let unit = dwarf.unit(header)?;
        let mut entries = unit.entries();

        while let Some((_, entry)) = entries.next_dfs()? {
            if entry.tag() != gimli::DW_TAG_structure_type {
                continue;
            }

            let Some(name) = attr_name(dwarf, &unit, entry)? else {
                continue;
            };
            let Some(size) = entry
                .attr(gimli::DW_AT_byte_size)?
                .and_then(|attr| attr.udata_value())
            else {
                continue;
            };

            let mut members = Vec::new();
            let mut children = unit.entries_at_offset(entry.offset())?;
            children.next_dfs()?;

            // next_dfs yields depth deltas, so track the absolute depth to
            // stop once the structure's subtree is exhausted
            let mut depth = 0isize;
            while let Some((delta, child)) = children.next_dfs()? {
                depth += delta;
                if depth <= 0 {
                    break;
                }
                if depth != 1 || child.tag() != gimli::DW_TAG_member {
                    continue;
                }

                let Some(member) = attr_name(dwarf, &unit, child)? else {
                    continue;
                };
                let Some(offset) = child
                    .attr(gimli::DW_AT_data_member_location)?
                    .and_then(|attr| attr.udata_value())
                else {
                    continue;
                };
                members.push((member, offset));
            }

            if !members.is_empty() {
                builder.add_struc(&name, size, members);
            }
        }
    }

    Ok(())
}

fn load(obj: &object::File, name: &str, id: &str) -> IceResult<ModuleSymbols> {
    let endian = if obj.is_little_endian() {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    };

    // Sections are loaded as Cow first so decompressed data outlives the
    // borrowed parse below.
    let sections = gimli::Dwarf::load(|id| -> Result<Cow<[u8]>, gimli::Error> {
        Ok(match obj.section_by_name(id.name()) {
            Some(section) => section
                .uncompressed_data()
                .unwrap_or(Cow::Borrowed(&[][..])),
            None => Cow::Borrowed(&[][..]),
        })
    });

    let mut builder = ModuleSymbolsBuilder::with_identity(name, id);
    load_symbols(obj, &mut builder);

    match sections {
        Ok(sections) => {
            let dwarf = sections.borrow(|section| gimli::EndianSlice::new(section, endian));
            if let Err(err) = load_types(&dwarf, &mut builder) {
                log::warn!("Failed to parse DWARF types of {name}: {err}");
            }
        }
        Err(err) => log::warn!("Failed to load DWARF sections of {name}: {err}"),
    }

    Ok(builder.build())
}

/// Hex build-id of an ELF, the key of the Linux symbol cache.
pub fn build_id(obj: &object::File) -> Option<String> {
    use core::fmt::Write;

    let id = obj.build_id().ok()??;
    let mut s = String::with_capacity(id.len() * 2);
    for byte in id {
        write!(s, "{byte:02x}").ok()?;
    }
    Some(s)
}

pub fn from_bytes(content: &[u8], name: &str, id: &str) -> IceResult<ModuleSymbols> {
    let obj = object::File::parse(content).map_err(IceError::new)?;
    load(&obj, name, id)
}

pub fn from_file(path: &std::path::Path, name: &str, id: &str) -> IceResult<ModuleSymbols> {
    let content = std::fs::read(path)?;
    from_bytes(&content, name, id)
}
