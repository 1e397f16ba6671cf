use std::ptr::NonNull;

use super::{CompileError, CompileResult};

// The protocol between the interpreter and emitted code: a 24-byte view of
// a Vec<u64> with the data pointer at offset 0, the logical length at
// offset 8 and the capacity at offset 16. Backends read and write these
// offsets by contract; verify_descriptor_layout checks it at startup.
#[repr(C)]
#[derive(Debug)]
pub struct SliceDescriptor {
    pub ptr: *mut u64,
    pub len: u64,
    pub cap: u64,
}

impl SliceDescriptor {
    pub fn from_vec(vec: &mut Vec<u64>) -> Self {
        Self {
            ptr: vec.as_mut_ptr(),
            len: vec.len() as u64,
            cap: vec.capacity() as u64,
        }
    }
}

/// Validates the descriptor layout the backend hard-codes. Failure means
/// native compilation must stay disabled.
pub fn verify_descriptor_layout() -> CompileResult<()> {
    if std::mem::size_of::<SliceDescriptor>() != 24 {
        return Err(CompileError::LayoutAssumption("descriptor is not 24 bytes"));
    }
    if std::mem::offset_of!(SliceDescriptor, ptr) != 0 {
        return Err(CompileError::LayoutAssumption("data pointer is not at offset 0"));
    }
    if std::mem::offset_of!(SliceDescriptor, len) != 8 {
        return Err(CompileError::LayoutAssumption("length word is not at offset 8"));
    }
    if std::mem::offset_of!(SliceDescriptor, cap) != 16 {
        return Err(CompileError::LayoutAssumption("capacity word is not at offset 16"));
    }

    // Probe the bytes the way emitted code will read them.
    let mut probe: Vec<u64> = Vec::with_capacity(5);
    probe.push(11);
    probe.push(22);
    let desc = SliceDescriptor::from_vec(&mut probe);
    let bytes =
        unsafe { std::slice::from_raw_parts(&desc as *const SliceDescriptor as *const u8, 24) };
    let word = |offset: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[offset..offset + 8]);
        u64::from_le_bytes(buf)
    };
    if word(0) != desc.ptr as u64 {
        return Err(CompileError::LayoutAssumption("data pointer bytes mismatch"));
    }
    if word(8) != 2 {
        return Err(CompileError::LayoutAssumption("length bytes mismatch"));
    }
    if word(16) != probe.capacity() as u64 {
        return Err(CompileError::LayoutAssumption("capacity bytes mismatch"));
    }
    Ok(())
}

// Opaque handle to the entry point of a compiled region. The region is
// owned by the allocator that produced the handle and stays valid for as
// long as that allocator lives.
#[derive(Clone, Copy, Debug)]
pub struct NativeCodeUnit {
    entry: NonNull<u8>,
}

impl NativeCodeUnit {
    pub fn new(entry: NonNull<u8>) -> Self {
        Self { entry }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.entry.as_ptr()
    }

    /// Transfers control into the compiled region; the single point where
    /// an executable pointer becomes a callable.
    ///
    /// # Safety
    ///
    /// `self` must point at code emitted by a backend of this crate, still
    /// mapped executable, and both descriptors must describe live buffers.
    pub unsafe fn enter(&self, stack: *mut SliceDescriptor, locals: *mut SliceDescriptor) {
        let f: unsafe extern "C" fn(*mut SliceDescriptor, *mut SliceDescriptor) =
            unsafe { std::mem::transmute::<*mut u8, _>(self.entry.as_ptr()) };
        unsafe { f(stack, locals) }
    }
}

#[derive(Debug)]
pub struct ContractViolation(pub &'static str);

impl std::fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "native block contract violation: {}", self.0)
    }
}

impl std::error::Error for ContractViolation {}

/// A compiled region plus the bytecode offset at which interpretation
/// resumes after it returns.
#[derive(Clone, Copy, Debug)]
pub struct NativeBlock {
    pub unit: NativeCodeUnit,
    pub resume_pc: usize,
}

impl NativeBlock {
    // On return the logical stack length reflects the block's pushes and
    // pops; the data pointers and capacities must be untouched.
    pub fn invoke(
        &self,
        stack: &mut Vec<u64>,
        locals: &mut Vec<u64>,
    ) -> Result<(), ContractViolation> {
        let mut stack_desc = SliceDescriptor::from_vec(stack);
        let mut locals_desc = SliceDescriptor::from_vec(locals);
        let stack_ptr = stack_desc.ptr;
        let stack_cap = stack_desc.cap;
        let locals_ptr = locals_desc.ptr;
        let locals_len = locals_desc.len;
        let locals_cap = locals_desc.cap;

        unsafe { self.unit.enter(&mut stack_desc, &mut locals_desc) };

        if stack_desc.ptr != stack_ptr || stack_desc.cap != stack_cap {
            return Err(ContractViolation("stack pointer or capacity changed"));
        }
        if stack_desc.len > stack_desc.cap {
            return Err(ContractViolation("stack length exceeds capacity"));
        }
        if locals_desc.ptr != locals_ptr
            || locals_desc.len != locals_len
            || locals_desc.cap != locals_cap
        {
            return Err(ContractViolation("locals descriptor changed"));
        }

        // Every slot below the new length was either live before the call or
        // written by the block within capacity.
        unsafe { stack.set_len(stack_desc.len as usize) };
        Ok(())
    }
}
