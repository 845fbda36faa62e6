//! The declarative hook schema: every traced function, its module and its
//! typed parameter list. `hook_functions!` turns each entry into a
//! registration stub.

hook_functions! {
    /// The ntdll heap family, the surface the heap sanitizer instruments.
    pub mod heaps (module = "ntdll") {
        family "heap_alloc" {
            fn RtlpAllocateHeapInternal(HeapHandle: Handle, Size: USize);
            fn RtlpReAllocateHeapInternal(HeapHandle: Handle, Flags: U32, BaseAddress: Ptr, Size: USize);
        }
        family "heap_free" {
            fn RtlFreeHeap(HeapHandle: Handle, Flags: U32, BaseAddress: Ptr);
            fn RtlSetUserValueHeap(HeapHandle: Handle, Flags: U32, BaseAddress: Ptr, UserValue: Ptr);
            fn RtlGetUserInfoHeap(HeapHandle: Handle, Flags: U32, BaseAddress: Ptr, UserValue: Ptr, UserFlags: Ptr);
        }
        family "heap_size" {
            fn RtlSizeHeap(HeapHandle: Handle, Flags: U32, BaseAddress: Ptr);
        }
    }

    /// Linux kernel system call entries.
    pub mod syscalls (module = "vmlinux") {
        family "syscall" {
            fn __x64_sys_openat(dfd: U64, filename: CStr<256>, flags: U32, mode: U32);
        }
    }
}
