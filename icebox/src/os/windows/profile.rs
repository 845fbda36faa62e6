//! NT kernel structure layouts, pulled from the kernel PDB.

#![allow(non_snake_case)]

use std::sync::Arc;

use ibc::symbols::ModuleSymbols;
use ibc::{IceResult, PhysicalAddress, VirtualAddress};

use crate::os::pointer::{ListLayout, Ptr, StructOffset};

/// Defines one Rust mirror per kernel structure, each field being the
/// PDB-provided offset tagged with the field's type. `[opt]` fields may be
/// absent from older kernels.
macro_rules! layouts {
    ($(
        struct $name:ident ($kname:literal) {
            $( $( [ $opt:ident ] )? $field:ident : $typ:ty, )*
        }
    )*) => {
        $(
            pub(crate) struct $name {
                $( pub $field: layouts!(@typ $( [$opt] )? $typ), )*
            }

            impl $name {
                fn new(layout: ibc::symbols::StructRef) -> IceResult<Self> {
                    Ok(Self {
                        $( $field: layouts!(@init layout, $field, $( [$opt] )? $typ), )*
                    })
                }
            }
        )*

        pub(crate) struct Layouts {
            $( pub $name: $name, )*
        }

        impl Layouts {
            fn new(syms: &ModuleSymbols) -> IceResult<Self> {
                Ok(Self {
                    $( $name: $name::new(syms.require_struc($kname)?)?, )*
                })
            }
        }
    };

    (@typ [opt] $typ:ty) => { Option<StructOffset<$typ>> };
    (@typ $typ:ty) => { StructOffset<$typ> };

    (@init $layout:ident, $field:ident, [opt] $typ:ty) => {
        $layout.find_offset(stringify!($field)).map(StructOffset::from_offset)
    };
    (@init $layout:ident, $field:ident, $typ:ty) => {
        StructOffset::new($layout, stringify!($field))?
    };
}

layouts! {
    struct ListEntry("_LIST_ENTRY") {
        Flink: Ptr<ListEntry>,
        Blink: Ptr<ListEntry>,
    }

    struct UnicodeString("_UNICODE_STRING") {
        Length: u16,
        Buffer: Ptr<u16>,
    }

    struct Kpcr("_KPCR") {
        Prcb: Kprcb,
    }

    struct Kprcb("_KPRCB") {
        CurrentThread: Ptr<Ethread>,
    }

    struct Kprocess("_KPROCESS") {
        DirectoryTableBase: PhysicalAddress,
        [opt] UserDirectoryTableBase: PhysicalAddress,
    }

    struct Eprocess("_EPROCESS") {
        Pcb: Kprocess,
        ActiveProcessLinks: ListEntry,
        UniqueProcessId: u64,
        InheritedFromUniqueProcessId: u64,
        ImageFileName: [u8; 15],
        ThreadListHead: ListEntry,
        Peb: Ptr<Peb>,
        [opt] Wow64Process: Ptr<()>,
    }

    struct Kthread("_KTHREAD") {
        Process: Ptr<Eprocess>,
    }

    struct ClientId("_CLIENT_ID") {
        UniqueProcess: u64,
        UniqueThread: u64,
    }

    struct Ethread("_ETHREAD") {
        Tcb: Kthread,
        Cid: ClientId,
        ThreadListEntry: ListEntry,
        [opt] ThreadName: Ptr<UnicodeString>,
    }

    struct Peb("_PEB") {
        Ldr: Ptr<PebLdrData>,
    }

    struct PebLdrData("_PEB_LDR_DATA") {
        InLoadOrderModuleList: ListEntry,
    }

    struct LdrDataTableEntry("_LDR_DATA_TABLE_ENTRY") {
        InLoadOrderLinks: ListEntry,
        DllBase: VirtualAddress,
        SizeOfImage: u32,
        BaseDllName: UnicodeString,
        FullDllName: UnicodeString,
    }
}

impl ListLayout for ListEntry {
    #[inline]
    fn next_offset(&self) -> u64 {
        self.Flink.offset
    }
}

/// Globals resolved once from the kernel PDB.
pub(crate) struct FastSymbols {
    pub PsActiveProcessHead: u64,
    pub PsInitialSystemProcess: u64,
    pub PsLoadedModuleList: u64,
}

pub(crate) struct Profile {
    pub syms: Arc<ModuleSymbols>,
    pub fast_syms: FastSymbols,
    pub layouts: Layouts,
}

impl Profile {
    pub fn new(syms: Arc<ModuleSymbols>) -> IceResult<Profile> {
        let fast_syms = FastSymbols {
            PsActiveProcessHead: syms.require_symbol("PsActiveProcessHead")?,
            PsInitialSystemProcess: syms.require_symbol("PsInitialSystemProcess")?,
            PsLoadedModuleList: syms.require_symbol("PsLoadedModuleList")?,
        };
        let layouts = Layouts::new(&syms)?;

        Ok(Profile {
            syms,
            fast_syms,
            layouts,
        })
    }
}
