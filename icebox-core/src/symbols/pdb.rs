//! Glue over the `pdb` crate: global symbols and structure layouts.

use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::vec::Vec;

use pdb::FallibleIterator;

use super::{ModuleSymbols, ModuleSymbolsBuilder};
use crate::{IceError, IceResult, VirtualAddress};

struct TypeList<'t> {
    offset: usize,
    types: Vec<pdb::TypeData<'t>>,
}

impl<'t> TypeList<'t> {
    fn get(&self, index: pdb::TypeIndex) -> Option<&pdb::TypeData<'t>> {
        match self.types.get(index.0 as usize - self.offset) {
            Some(ty) => Some(ty),
            None => {
                log::warn!("Unable to resolve index {index:?}");
                None
            }
        }
    }
}

fn collect_fields(struct_name: &str, fields: &pdb::FieldList) -> Vec<(String, u64)> {
    fields
        .fields
        .iter()
        .filter_map(|item| match item {
            pdb::TypeData::Member(member) => {
                let name = core::str::from_utf8(member.name.as_bytes())
                    .ok()?
                    .to_owned();
                Some((name, member.offset))
            }
            _ => {
                log::debug!("Struct \"{struct_name}\" has unsupported field: {item:?}");
                None
            }
        })
        .collect()
}

fn load_types<'s, S: pdb::Source<'s> + 's>(
    pdb: &mut pdb::PDB<'s, S>,
    module: &mut ModuleSymbolsBuilder,
) -> Result<(), pdb::Error> {
    let types = pdb.type_information()?;

    let mut offset = None;

    // The type stream is indexed from an arbitrary base, so collect it first
    let types = types
        .iter()
        .enumerate()
        .map(|(i, ty)| {
            let index = ty.index().0 as usize;
            let offset = *offset.get_or_insert(index);
            assert_eq!(index, offset + i);
            ty.parse()
        })
        .collect()?;

    let type_list = TypeList {
        offset: offset.unwrap_or(0x1000),
        types,
    };

    for item in &type_list.types {
        let pdb::TypeData::Class(ty) = item else {
            continue;
        };
        if !matches!(ty.kind, pdb::ClassKind::Struct) || ty.properties.forward_reference() {
            continue;
        }

        let Ok(name) = core::str::from_utf8(ty.name.as_bytes()) else {
            continue;
        };

        let Some(fields) = ty.fields else { continue };
        let fields = match type_list.get(fields) {
            Some(pdb::TypeData::FieldList(fields)) => collect_fields(name, fields),
            Some(members) => {
                log::warn!("Struct \"{name}\" has weird field list: {members:?}");
                continue;
            }
            None => continue,
        };

        module.add_struc(name, ty.size, fields);
    }

    Ok(())
}

fn load_syms<'s, S: pdb::Source<'s> + 's>(
    pdb: &mut pdb::PDB<'s, S>,
    module: &mut ModuleSymbolsBuilder,
) -> Result<(), pdb::Error> {
    let symbols = pdb.global_symbols()?;
    let address_map = pdb.address_map()?;

    symbols.iter().for_each(|sym| match sym.parse()? {
        pdb::SymbolData::Public(sym) => {
            if let Some(addr) = sym.offset.to_rva(&address_map) {
                if let Ok(name) = core::str::from_utf8(sym.name.as_bytes()) {
                    module.push(VirtualAddress(addr.0 as u64), name);
                }
            }
            Ok(())
        }
        _ => Ok(()),
    })?;

    Ok(())
}

fn load<'s, S: pdb::Source<'s> + 's>(
    mut pdb: pdb::PDB<'s, S>,
    name: &str,
    id: &str,
) -> IceResult<ModuleSymbols> {
    let mut builder = ModuleSymbolsBuilder::with_identity(name, id);
    load_syms(&mut pdb, &mut builder).map_err(IceError::new)?;
    load_types(&mut pdb, &mut builder).map_err(IceError::new)?;
    Ok(builder.build())
}

pub fn from_bytes(content: &[u8], name: &str, id: &str) -> IceResult<ModuleSymbols> {
    let pdb = pdb::PDB::open(std::io::Cursor::new(content)).map_err(IceError::new)?;
    load(pdb, name, id)
}

pub fn from_file(
    path: &std::path::Path,
    name: &str,
    id: &str,
) -> IceResult<ModuleSymbols> {
    let file = std::fs::File::open(path)?;
    let pdb = pdb::PDB::open(file).map_err(IceError::new)?;
    load(pdb, name, id)
}
