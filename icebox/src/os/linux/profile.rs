//! Offsets into Linux kernel structures, from vmlinux debug info.

use std::sync::Arc;

use ibc::symbols::ModuleSymbols;
use ibc::IceResult;

pub(crate) struct FastSymbols {
    pub linux_banner: u64,
    pub init_task: u64,
    pub per_cpu_start: u64,
    pub current_task: u64,
    pub modules: Option<u64>,
}

pub(crate) struct FastOffsets {
    pub list_head_next: u64,

    pub task_struct_tasks: u64,
    pub task_struct_pid: u64,
    pub task_struct_tgid: u64,
    pub task_struct_comm: u64,
    pub task_struct_real_parent: u64,
    pub task_struct_group_leader: u64,
    pub task_struct_mm: u64,
    pub task_struct_active_mm: u64,
    pub task_struct_thread_group: u64,

    pub mm_struct_pgd: u64,
    pub mm_struct_mmap: Option<u64>,

    pub vma_start: Option<u64>,
    pub vma_end: Option<u64>,
    pub vma_next: Option<u64>,
    pub vma_pgoff: Option<u64>,
    pub vma_file: Option<u64>,

    pub file_f_path: Option<u64>,
    pub path_dentry: Option<u64>,
    pub dentry_d_name: Option<u64>,
    pub qstr_name: Option<u64>,

    pub module_list: Option<u64>,
    pub module_name: Option<u64>,
    pub module_core_layout: Option<u64>,
    pub module_layout_base: Option<u64>,
    pub module_layout_size: Option<u64>,
}

pub(crate) struct Profile {
    pub syms: Arc<ModuleSymbols>,
    pub fast_syms: FastSymbols,
    pub fast_offsets: FastOffsets,
}

impl Profile {
    pub fn new(syms: Arc<ModuleSymbols>) -> IceResult<Profile> {
        let fast_syms = FastSymbols {
            linux_banner: syms.require_symbol("linux_banner")?,
            init_task: syms.require_symbol("init_task")?,
            per_cpu_start: syms.require_symbol("__per_cpu_start")?,
            current_task: syms.require_symbol("current_task")?,
            modules: syms.symbol_offset("modules"),
        };

        let list_head = syms.require_struc("list_head")?;
        let task_struct = syms.require_struc("task_struct")?;
        let mm_struct = syms.require_struc("mm_struct")?;

        let vma = syms.struc("vm_area_struct");
        let file = syms.struc("file");
        let path = syms.struc("path");
        let dentry = syms.struc("dentry");
        let qstr = syms.struc("qstr");
        let module = syms.struc("module");
        let module_layout = syms.struc("module_layout");

        let fast_offsets = FastOffsets {
            list_head_next: list_head.require_offset("next")?,

            task_struct_tasks: task_struct.require_offset("tasks")?,
            task_struct_pid: task_struct.require_offset("pid")?,
            task_struct_tgid: task_struct.require_offset("tgid")?,
            task_struct_comm: task_struct.require_offset("comm")?,
            task_struct_real_parent: task_struct.require_offset("real_parent")?,
            task_struct_group_leader: task_struct.require_offset("group_leader")?,
            task_struct_mm: task_struct.require_offset("mm")?,
            task_struct_active_mm: task_struct.require_offset("active_mm")?,
            task_struct_thread_group: task_struct.require_offset("thread_group")?,

            mm_struct_pgd: mm_struct.require_offset("pgd")?,
            mm_struct_mmap: mm_struct.find_offset("mmap"),

            vma_start: vma.and_then(|s| s.find_offset("vm_start")),
            vma_end: vma.and_then(|s| s.find_offset("vm_end")),
            vma_next: vma.and_then(|s| s.find_offset("vm_next")),
            vma_pgoff: vma.and_then(|s| s.find_offset("vm_pgoff")),
            vma_file: vma.and_then(|s| s.find_offset("vm_file")),

            file_f_path: file.and_then(|s| s.find_offset("f_path")),
            path_dentry: path.and_then(|s| s.find_offset("dentry")),
            dentry_d_name: dentry.and_then(|s| s.find_offset("d_name")),
            qstr_name: qstr.and_then(|s| s.find_offset("name")),

            module_list: module.and_then(|s| s.find_offset("list")),
            module_name: module.and_then(|s| s.find_offset("name")),
            module_core_layout: module.and_then(|s| s.find_offset("core_layout")),
            module_layout_base: module_layout.and_then(|s| s.find_offset("base")),
            module_layout_size: module_layout.and_then(|s| s.find_offset("size")),
        };

        Ok(Profile {
            syms,
            fast_syms,
            fast_offsets,
        })
    }
}
