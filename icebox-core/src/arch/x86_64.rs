use bytemuck::{Pod, Zeroable};

use crate::VirtualAddress;

/// Base of the canonical kernel half.
pub const KERNEL_START: u64 = 0xffff_8000_0000_0000;

/// General purpose registers, laid out the way the channel transports them.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

macro_rules! registers {
    ( $( $variant:ident => $field:ident, )* ) => {
        /// Selector for scalar register access over the channel.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum Register {
            $( $variant, )*
        }

        impl Registers {
            #[inline]
            pub fn get(&self, register: Register) -> u64 {
                match register {
                    $( Register::$variant => self.$field, )*
                }
            }

            #[inline]
            pub fn set(&mut self, register: Register, value: u64) {
                match register {
                    $( Register::$variant => self.$field = value, )*
                }
            }
        }
    };
}

registers! {
    Rax => rax,
    Rbx => rbx,
    Rcx => rcx,
    Rdx => rdx,
    Rsi => rsi,
    Rdi => rdi,
    Rsp => rsp,
    Rbp => rbp,
    R8 => r8,
    R9 => r9,
    R10 => r10,
    R11 => r11,
    R12 => r12,
    R13 => r13,
    R14 => r14,
    R15 => r15,
    Rip => rip,
    Rflags => rflags,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
    pub unusable: u8,
    pub padding: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Dtable {
    pub base: u64,
    pub limit: u16,
    pub padding: [u16; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SpecialRegisters {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub tr: Segment,
    pub ldt: Segment,
    pub gdt: Dtable,
    pub idt: Dtable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub kernel_gs_base: u64,
    pub apic_base: u64,
}

/// Model-specific registers the OS layers care about.
pub mod msr {
    pub const IA32_EFER: u32 = 0xc000_0080;
    pub const IA32_LSTAR: u32 = 0xc000_0082;
    pub const IA32_FS_BASE: u32 = 0xc000_0100;
    pub const IA32_GS_BASE: u32 = 0xc000_0101;
    pub const IA32_KERNEL_GS_BASE: u32 = 0xc000_0102;
}

/// Picks the GS base half that points into kernel space, if any.
///
/// While the guest runs user code, the kernel half sits in
/// `IA32_KERNEL_GS_BASE` waiting for the next `swapgs`.
#[inline]
pub fn kernel_per_cpu(gs_base: u64, kernel_gs_base: u64) -> Option<VirtualAddress> {
    let per_cpu = VirtualAddress(gs_base);
    if per_cpu.is_kernel() {
        return Some(per_cpu);
    }

    let per_cpu = VirtualAddress(kernel_gs_base);
    if per_cpu.is_kernel() {
        return Some(per_cpu);
    }

    None
}
