use super::allocator::MmapAllocator;
use super::scanner::Scanner;
use super::trampoline;
use super::{
    BytecodeMetadata, CompilationCandidate, CompileError, CompileResult, InstructionBuilder,
    InstructionMetadata, NativeCompiler,
};
use crate::ops::Op;

// Register discipline of this backend:
//  - R10 - address of the stack descriptor {ptr, len, cap}
//  - R11 - address of the locals descriptor, same shape
//  - R12 - stack data pointer, loaded on first use
//  - R13 - logical stack length, loaded on first use, flushed when dirty
// Scratch: RAX, RCX, RDX, R8, R9 (caller-saved under SysV).
// R12/R13 are callee-saved, so the preamble spills them and the postamble
// restores them. Emission makes no attempt to optimize; every sequence is
// translated independently.

const RAX: u8 = 0;
const R8: u8 = 8;
const R9: u8 = 9;

/// The native compiler backend for x86-64 hosts.
pub struct Amd64Backend;

impl Amd64Backend {
    // Opcodes this backend can both scan for and emit.
    pub fn supported_opcodes() -> [Op; 7] {
        [
            Op::I64Const,
            Op::I64Add,
            Op::I64Sub,
            Op::I64And,
            Op::I64Or,
            Op::I64Mul,
            Op::GetLocal,
        ]
    }

    /// A scanner whose supported set mirrors this backend's emitter.
    pub fn scanner(&self) -> Scanner {
        Scanner::new(Self::supported_opcodes())
    }
}

// Backend factory consulted by the registry.
pub(super) fn native_compiler() -> CompileResult<NativeCompiler> {
    trampoline::verify_descriptor_layout()?;
    Ok(NativeCompiler {
        scanner: Box::new(Amd64Backend.scanner()),
        builder: Box::new(Amd64Backend),
        allocator: Box::new(MmapAllocator::new()),
    })
}

impl InstructionBuilder for Amd64Backend {
    fn build(
        &self,
        candidate: &CompilationCandidate,
        code: &[u8],
        meta: &BytecodeMetadata,
    ) -> CompileResult<Vec<u8>> {
        let mut asm = Emitter::new();
        asm.preamble();

        for i in candidate.start_instruction..=candidate.end_instruction {
            let inst = meta.instructions.get(i).ok_or_else(|| {
                CompileError::Emit(format!("instruction index {i} out of metadata bounds"))
            })?;
            match Op::from_byte(inst.op) {
                Some(Op::I64Const) => {
                    let value = read_int_immediate(code, inst)?;
                    asm.push_imm64(value);
                }
                Some(Op::GetLocal) => {
                    let index = read_int_immediate(code, inst)? as u32;
                    asm.push_local(index)?;
                }
                Some(
                    op @ (Op::I64Add | Op::I64Sub | Op::I64And | Op::I64Or | Op::I64Mul),
                ) => {
                    asm.binary_i64(op);
                }
                _ => {
                    return Err(CompileError::UnsupportedOpcode {
                        instruction: i,
                        op: inst.op,
                    });
                }
            }
        }

        asm.postamble();
        Ok(asm.into_code())
    }
}

// A 5-byte instruction carries a zero-extended u32 immediate; the
// full-width form carries a u64.
fn read_int_immediate(code: &[u8], inst: &InstructionMetadata) -> CompileResult<u64> {
    let bytes = code
        .get(inst.start + 1..inst.start + inst.size)
        .ok_or_else(|| {
            CompileError::Emit(format!("immediate out of code bounds at {}", inst.start))
        })?;
    match bytes.len() {
        4 => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(bytes);
            Ok(u64::from(u32::from_le_bytes(buf)))
        }
        8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            Ok(u64::from_le_bytes(buf))
        }
        other => Err(CompileError::Emit(format!(
            "unsupported immediate width {other} at {}",
            inst.start
        ))),
    }
}

fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | (b as u8)
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    mode << 6 | (reg & 7) << 3 | (rm & 7)
}

// Encodes the machine instructions for one candidate. Tracks which
// reserved registers currently hold live state so descriptor loads happen
// once per candidate and the length word is flushed only when it changed.
struct Emitter {
    code: Vec<u8>,
    stack_ptr_loaded: bool,
    stack_len_loaded: bool,
    stack_len_dirty: bool,
}

impl Emitter {
    fn new() -> Self {
        Self {
            code: Vec::with_capacity(256),
            stack_ptr_loaded: false,
            stack_len_loaded: false,
            stack_len_dirty: false,
        }
    }

    fn into_code(self) -> Vec<u8> {
        self.code
    }

    // Spills the callee-saved scratch registers and captures the two
    // descriptor addresses handed over in the argument registers.
    fn preamble(&mut self) {
        self.code.extend_from_slice(&[0x41, 0x54]); // push r12
        self.code.extend_from_slice(&[0x41, 0x55]); // push r13
        self.code.extend_from_slice(&[0x49, 0x89, 0xFA]); // mov r10, rdi
        self.code.extend_from_slice(&[0x49, 0x89, 0xF3]); // mov r11, rsi
        self.stack_ptr_loaded = false;
        self.stack_len_loaded = false;
        self.stack_len_dirty = false;
    }

    // Flushes the length word when it changed and returns to the caller.
    fn postamble(&mut self) {
        if self.stack_len_dirty {
            self.code.extend_from_slice(&[0x4D, 0x89, 0x6A, 0x08]); // mov [r10+8], r13
        }
        self.code.extend_from_slice(&[0x41, 0x5D]); // pop r13
        self.code.extend_from_slice(&[0x41, 0x5C]); // pop r12
        self.code.push(0xC3); // ret
    }

    fn ensure_stack_regs(&mut self) {
        if !self.stack_ptr_loaded {
            self.code.extend_from_slice(&[0x4D, 0x8B, 0x22]); // mov r12, [r10]
            self.stack_ptr_loaded = true;
        }
        if !self.stack_len_loaded {
            self.code.extend_from_slice(&[0x4D, 0x8B, 0x6A, 0x08]); // mov r13, [r10+8]
            self.stack_len_loaded = true;
        }
    }

    // mov [r12 + r13*8], reg
    fn store_stack_slot(&mut self, reg: u8) {
        self.code.push(rex(true, reg >= 8, true, true));
        self.code.push(0x89);
        self.code.push(modrm(0b00, reg, 0b100));
        self.code.push(0xEC); // sib: base r12, index r13, scale 8
    }

    // mov reg, [r12 + r13*8]
    fn load_stack_slot(&mut self, reg: u8) {
        self.code.push(rex(true, reg >= 8, true, true));
        self.code.push(0x8B);
        self.code.push(modrm(0b00, reg, 0b100));
        self.code.push(0xEC); // sib: base r12, index r13, scale 8
    }

    fn push_reg(&mut self, reg: u8) {
        self.ensure_stack_regs();
        self.store_stack_slot(reg);
        self.code.extend_from_slice(&[0x49, 0xFF, 0xC5]); // inc r13
        self.stack_len_dirty = true;
    }

    fn pop_reg(&mut self, reg: u8) {
        self.ensure_stack_regs();
        self.code.extend_from_slice(&[0x49, 0xFF, 0xCD]); // dec r13
        self.load_stack_slot(reg);
        self.stack_len_dirty = true;
    }

    // Values that fit 32 bits use the zero-extending move form.
    fn push_imm64(&mut self, value: u64) {
        if let Ok(small) = u32::try_from(value) {
            self.code.push(0xB8); // mov eax, imm32
            self.code.extend_from_slice(&small.to_le_bytes());
        } else {
            self.code.extend_from_slice(&[0x48, 0xB8]); // mov rax, imm64
            self.code.extend_from_slice(&value.to_le_bytes());
        }
        self.push_reg(RAX);
    }

    fn push_local(&mut self, index: u32) -> CompileResult<()> {
        let displacement = i32::try_from(index as u64 * 8).map_err(|_| {
            CompileError::Emit(format!("local index {index} exceeds displacement range"))
        })?;
        self.code.extend_from_slice(&[0x4D, 0x8B, 0x03]); // mov r8, [r11]
        self.code.push(rex(true, false, false, true));
        self.code.push(0x8B);
        self.code.push(modrm(0b10, RAX, R8)); // mov rax, [r8+disp32]
        self.code.extend_from_slice(&displacement.to_le_bytes());
        self.push_reg(RAX);
        Ok(())
    }

    // Pops two operands, applies op and pushes the result. The second pop
    // yields the left-hand operand.
    fn binary_i64(&mut self, op: Op) {
        self.pop_reg(R9);
        self.pop_reg(RAX);
        match op {
            Op::I64Add => self.code.extend_from_slice(&[0x4C, 0x01, 0xC8]), // add rax, r9
            Op::I64Sub => self.code.extend_from_slice(&[0x4C, 0x29, 0xC8]), // sub rax, r9
            Op::I64And => self.code.extend_from_slice(&[0x4C, 0x21, 0xC8]), // and rax, r9
            Op::I64Or => self.code.extend_from_slice(&[0x4C, 0x09, 0xC8]),  // or rax, r9
            // Single-operand form: rdx:rax = rax * r9, low half pushed.
            _ => self.code.extend_from_slice(&[0x49, 0xF7, 0xE1]), // mul r9
        }
        self.push_reg(RAX);
    }
}
