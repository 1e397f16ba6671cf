use crate::bytecode::FuncBody;
use crate::compile::trampoline::NativeBlock;
use crate::compile::{self, BytecodeMetadata, CompileError, NativeCompiler};
use crate::ops::Op;

/// Bytes rewritten at the start of every compiled region: the trampoline
/// opcode plus a u32 block index.
pub const NATIVE_PROLOGUE_SIZE: usize = 5;

const MAX_CALL_DEPTH: usize = 1024;

#[derive(Debug)]
pub enum VmError {
    StackUnderflow,
    BytecodeBounds,
    InvalidOpcode(u8),
    InvalidLocal(u32),
    InvalidGlobal(u32),
    InvalidBranch(usize),
    InvalidCall(u32),
    InvalidCallArity {
        func: u32,
        expected: usize,
        got: usize,
    },
    CallDepthExceeded,
    UnreachableExecuted {
        pc: usize,
    },
    InvalidNativeBlock(u32),
    NativeContract(&'static str),
    NativeScan {
        func: usize,
        source: CompileError,
    },
    NativeCompile {
        func: usize,
        beginning: usize,
        end: usize,
        source: CompileError,
    },
    NativeAlloc {
        func: usize,
        source: CompileError,
    },
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::StackUnderflow => write!(f, "stack underflow"),
            VmError::BytecodeBounds => write!(f, "bytecode bounds"),
            VmError::InvalidOpcode(opcode) => write!(f, "invalid opcode 0x{opcode:02X}"),
            VmError::InvalidLocal(index) => write!(f, "invalid local {index}"),
            VmError::InvalidGlobal(index) => write!(f, "invalid global {index}"),
            VmError::InvalidBranch(target) => write!(f, "branch target {target} out of bounds"),
            VmError::InvalidCall(index) => write!(f, "invalid call target {index}"),
            VmError::InvalidCallArity {
                func,
                expected,
                got,
            } => write!(
                f,
                "invalid call arity for funcs[{func}]: expected {expected}, got {got}"
            ),
            VmError::CallDepthExceeded => write!(f, "call depth exceeded"),
            VmError::UnreachableExecuted { pc } => {
                write!(f, "unreachable executed at offset {pc}")
            }
            VmError::InvalidNativeBlock(index) => {
                write!(f, "native block index {index} out of range")
            }
            VmError::NativeContract(message) => {
                write!(f, "native block contract violation: {message}")
            }
            VmError::NativeScan { func, source } => {
                write!(f, "native scan failed on funcs[{func}]: {source}")
            }
            VmError::NativeCompile {
                func,
                beginning,
                end,
                source,
            } => write!(
                f,
                "native compilation failed on funcs[{func}].code[{beginning}..{end}]: {source}"
            ),
            VmError::NativeAlloc { func, source } => {
                write!(f, "executable allocation failed on funcs[{func}]: {source}")
            }
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::NativeScan { source, .. }
            | VmError::NativeCompile { source, .. }
            | VmError::NativeAlloc { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type VmResult<T> = Result<T, VmError>;

/// Parameters which decide when a sequence is worth compiling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileConfig {
    pub enabled: bool,
    // Minimum candidate width in bytecode bytes. Never effectively less
    // than NATIVE_PROLOGUE_SIZE; the patched prologue must fit.
    pub min_inst_bytes: usize,
    // Minimum number of arithmetic instructions in a candidate.
    pub min_arith_ops: usize,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_inst_bytes: NATIVE_PROLOGUE_SIZE,
            min_arith_ops: 2,
        }
    }
}

// A guest function: bytecode, its immutable metadata and the native blocks
// compiled out of it. The block list index is what a patched trampoline
// prologue refers to.
pub struct CompiledFunction {
    pub code: Vec<u8>,
    pub meta: BytecodeMetadata,
    pub num_params: usize,
    pub num_locals: usize,
    pub max_stack: usize,
    native: Vec<NativeBlock>,
}

impl CompiledFunction {
    pub fn new(body: FuncBody, num_params: usize, num_locals: usize) -> Self {
        Self {
            code: body.code,
            meta: body.meta,
            num_params,
            num_locals,
            max_stack: body.max_stack,
            native: Vec::new(),
        }
    }
}

// Host functions are never candidates for native compilation.
pub struct HostFunc {
    pub arity: usize,
    pub handler: Box<dyn FnMut(&[u64]) -> Option<u64>>,
}

pub enum FuncInstance {
    Compiled(CompiledFunction),
    Host(HostFunc),
}

struct Frame {
    stack: Vec<u64>,
    locals: Vec<u64>,
}

pub struct Vm {
    funcs: Vec<FuncInstance>,
    globals: Vec<u64>,
    config: CompileConfig,
    compiler: Option<NativeCompiler>,
}

impl Vm {
    pub fn new(funcs: Vec<FuncInstance>, globals: Vec<u64>) -> VmResult<Self> {
        Self::with_config(funcs, globals, CompileConfig::default())
    }

    /// Builds a VM, selecting the host's native backend and compiling every
    /// eligible sequence. A compile error means no VM is produced at all;
    /// half-patched bytecode must never run.
    pub fn with_config(
        funcs: Vec<FuncInstance>,
        globals: Vec<u64>,
        config: CompileConfig,
    ) -> VmResult<Self> {
        let compiler = if config.enabled {
            match compile::native_backend() {
                Some(Ok(compiler)) => Some(compiler),
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "native compilation disabled");
                    None
                }
                None => None,
            }
        } else {
            None
        };
        let mut vm = Self {
            funcs,
            globals,
            config,
            compiler,
        };
        vm.try_native_compile()?;
        Ok(vm)
    }

    /// Builds a VM around a caller-supplied backend instead of consulting
    /// the host registry.
    pub fn with_native_compiler(
        funcs: Vec<FuncInstance>,
        globals: Vec<u64>,
        config: CompileConfig,
        compiler: NativeCompiler,
    ) -> VmResult<Self> {
        let mut vm = Self {
            funcs,
            globals,
            config,
            compiler: Some(compiler),
        };
        vm.try_native_compile()?;
        Ok(vm)
    }

    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    pub fn native_enabled(&self) -> bool {
        self.compiler.is_some()
    }

    pub fn function_code(&self, func: usize) -> Option<&[u8]> {
        match self.funcs.get(func) {
            Some(FuncInstance::Compiled(function)) => Some(&function.code),
            _ => None,
        }
    }

    pub fn native_block_count(&self, func: usize) -> usize {
        match self.funcs.get(func) {
            Some(FuncInstance::Compiled(function)) => function.native.len(),
            _ => 0,
        }
    }

    pub fn global(&self, index: u32) -> Option<u64> {
        self.globals.get(index as usize).copied()
    }

    // Scans every guest function for compilable sequences, emits native
    // code for the survivors and patches trampolines over the original
    // bytecode. Running it again is a no-op: the trampoline opcode is not
    // in any backend's supported set, so patched regions never rescan into
    // candidates.
    pub fn try_native_compile(&mut self) -> VmResult<()> {
        let Some(compiler) = self.compiler.as_mut() else {
            return Ok(());
        };
        let min_inst_bytes = self.config.min_inst_bytes.max(NATIVE_PROLOGUE_SIZE);
        let min_arith_ops = self.config.min_arith_ops;

        for (index, instance) in self.funcs.iter_mut().enumerate() {
            let FuncInstance::Compiled(function) = instance else {
                continue;
            };
            let candidates = compiler
                .scanner
                .scan_func(&function.code, &function.meta)
                .map_err(|source| VmError::NativeScan {
                    func: index,
                    source,
                })?;

            for candidate in candidates {
                if candidate.metrics.integer_ops + candidate.metrics.float_ops < min_arith_ops {
                    continue;
                }
                let (beginning, end) = candidate.bounds();
                if end - beginning < min_inst_bytes {
                    continue;
                }

                let asm = compiler
                    .builder
                    .build(&candidate, &function.code, &function.meta)
                    .map_err(|source| VmError::NativeCompile {
                        func: index,
                        beginning,
                        end,
                        source,
                    })?;
                let unit = compiler
                    .allocator
                    .allocate_exec(&asm)
                    .map_err(|source| VmError::NativeAlloc {
                        func: index,
                        source,
                    })?;

                function.native.push(NativeBlock {
                    unit,
                    resume_pc: end,
                });
                let block_index = (function.native.len() - 1) as u32;

                // Patch the opcode stream to call into the native section,
                // then trap-fill the remainder of the rewritten range: a
                // branch landing inside it must surface as a guest trap,
                // never as silent mis-execution.
                function.code[beginning] = Op::NativeExec as u8;
                function.code[beginning + 1..beginning + NATIVE_PROLOGUE_SIZE]
                    .copy_from_slice(&block_index.to_le_bytes());
                for byte in &mut function.code[beginning + NATIVE_PROLOGUE_SIZE..end] {
                    *byte = Op::Unreachable as u8;
                }

                tracing::debug!(
                    func = index,
                    beginning,
                    end,
                    code_bytes = asm.len(),
                    "compiled native block"
                );
            }
        }
        Ok(())
    }

    /// Runs a function to completion and returns the top of its operand
    /// stack, if any.
    pub fn invoke(&mut self, func: u32, args: &[u64]) -> VmResult<Option<u64>> {
        self.call_function(func, args, 0)
    }

    fn call_function(&mut self, func: u32, args: &[u64], depth: usize) -> VmResult<Option<u64>> {
        if depth >= MAX_CALL_DEPTH {
            return Err(VmError::CallDepthExceeded);
        }
        let index = func as usize;

        enum Target {
            Host,
            Compiled {
                params: usize,
                locals: usize,
                max_stack: usize,
            },
        }

        let target = match self.funcs.get(index) {
            None => return Err(VmError::InvalidCall(func)),
            Some(FuncInstance::Host(host)) => {
                if args.len() != host.arity {
                    return Err(VmError::InvalidCallArity {
                        func,
                        expected: host.arity,
                        got: args.len(),
                    });
                }
                Target::Host
            }
            Some(FuncInstance::Compiled(function)) => {
                if args.len() != function.num_params {
                    return Err(VmError::InvalidCallArity {
                        func,
                        expected: function.num_params,
                        got: args.len(),
                    });
                }
                Target::Compiled {
                    params: function.num_params,
                    locals: function.num_locals,
                    max_stack: function.max_stack,
                }
            }
        };

        match target {
            Target::Host => match self.funcs.get_mut(index) {
                Some(FuncInstance::Host(host)) => Ok((host.handler)(args)),
                _ => Err(VmError::InvalidCall(func)),
            },
            Target::Compiled {
                params,
                locals,
                max_stack,
            } => {
                let mut local_slots = args.to_vec();
                local_slots.resize(params + locals, 0);
                let mut frame = Frame {
                    stack: Vec::with_capacity(max_stack),
                    locals: local_slots,
                };
                self.run(index, &mut frame, depth)
            }
        }
    }

    fn run(&mut self, func: usize, frame: &mut Frame, depth: usize) -> VmResult<Option<u64>> {
        let mut pc = 0usize;
        loop {
            if pc >= self.code_len(func)? {
                return Ok(frame.stack.pop());
            }
            let opcode = self.code_u8(func, pc)?;
            let op = Op::from_byte(opcode).ok_or(VmError::InvalidOpcode(opcode))?;
            pc += 1;
            match op {
                Op::Unreachable => return Err(VmError::UnreachableExecuted { pc: pc - 1 }),
                Op::Nop => {}
                Op::Return => return Ok(frame.stack.pop()),
                Op::Br => {
                    let target = self.code_u32(func, pc)? as usize;
                    pc = self.branch_target(func, target)?;
                }
                Op::BrIf => {
                    let target = self.code_u32(func, pc)? as usize;
                    pc += 4;
                    if pop(&mut frame.stack)? != 0 {
                        pc = self.branch_target(func, target)?;
                    }
                }
                Op::Call => {
                    let callee = self.code_u32(func, pc)?;
                    pc += 4;
                    let arity = self.callee_arity(callee)?;
                    let mut args = vec![0u64; arity];
                    for slot in args.iter_mut().rev() {
                        *slot = pop(&mut frame.stack)?;
                    }
                    if let Some(value) = self.call_function(callee, &args, depth + 1)? {
                        frame.stack.push(value);
                    }
                }
                Op::Drop => {
                    pop(&mut frame.stack)?;
                }
                Op::Select => {
                    let condition = pop(&mut frame.stack)?;
                    let if_zero = pop(&mut frame.stack)?;
                    let if_nonzero = pop(&mut frame.stack)?;
                    frame
                        .stack
                        .push(if condition != 0 { if_nonzero } else { if_zero });
                }
                Op::GetLocal => {
                    let index = self.code_u32(func, pc)?;
                    pc += 4;
                    let value = *frame
                        .locals
                        .get(index as usize)
                        .ok_or(VmError::InvalidLocal(index))?;
                    frame.stack.push(value);
                }
                Op::SetLocal => {
                    let index = self.code_u32(func, pc)?;
                    pc += 4;
                    let value = pop(&mut frame.stack)?;
                    let slot = frame
                        .locals
                        .get_mut(index as usize)
                        .ok_or(VmError::InvalidLocal(index))?;
                    *slot = value;
                }
                Op::TeeLocal => {
                    let index = self.code_u32(func, pc)?;
                    pc += 4;
                    let value = *frame.stack.last().ok_or(VmError::StackUnderflow)?;
                    let slot = frame
                        .locals
                        .get_mut(index as usize)
                        .ok_or(VmError::InvalidLocal(index))?;
                    *slot = value;
                }
                Op::GetGlobal => {
                    let index = self.code_u32(func, pc)?;
                    pc += 4;
                    let value = *self
                        .globals
                        .get(index as usize)
                        .ok_or(VmError::InvalidGlobal(index))?;
                    frame.stack.push(value);
                }
                Op::SetGlobal => {
                    let index = self.code_u32(func, pc)?;
                    pc += 4;
                    let value = pop(&mut frame.stack)?;
                    let slot = self
                        .globals
                        .get_mut(index as usize)
                        .ok_or(VmError::InvalidGlobal(index))?;
                    *slot = value;
                }
                Op::I32Const => {
                    let value = self.code_u32(func, pc)?;
                    pc += 4;
                    frame.stack.push(u64::from(value));
                }
                Op::I64Const => {
                    let value = self.code_u64(func, pc)?;
                    pc += 8;
                    frame.stack.push(value);
                }
                Op::I64Add => binary(frame, u64::wrapping_add)?,
                Op::I64Sub => binary(frame, u64::wrapping_sub)?,
                Op::I64Mul => binary(frame, u64::wrapping_mul)?,
                Op::I64And => binary(frame, |a, b| a & b)?,
                Op::I64Or => binary(frame, |a, b| a | b)?,
                Op::I64Xor => binary(frame, |a, b| a ^ b)?,
                Op::NativeExec => {
                    let index = self.code_u32(func, pc)?;
                    let block = self
                        .compiled(func)?
                        .native
                        .get(index as usize)
                        .copied()
                        .ok_or(VmError::InvalidNativeBlock(index))?;
                    block
                        .invoke(&mut frame.stack, &mut frame.locals)
                        .map_err(|violation| VmError::NativeContract(violation.0))?;
                    pc = block.resume_pc;
                }
            }
        }
    }

    fn compiled(&self, func: usize) -> VmResult<&CompiledFunction> {
        match self.funcs.get(func) {
            Some(FuncInstance::Compiled(function)) => Ok(function),
            _ => Err(VmError::InvalidCall(func as u32)),
        }
    }

    fn code_len(&self, func: usize) -> VmResult<usize> {
        Ok(self.compiled(func)?.code.len())
    }

    fn code_u8(&self, func: usize, pc: usize) -> VmResult<u8> {
        self.compiled(func)?
            .code
            .get(pc)
            .copied()
            .ok_or(VmError::BytecodeBounds)
    }

    fn code_u32(&self, func: usize, pc: usize) -> VmResult<u32> {
        let code = &self.compiled(func)?.code;
        let bytes = code.get(pc..pc + 4).ok_or(VmError::BytecodeBounds)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(buf))
    }

    fn code_u64(&self, func: usize, pc: usize) -> VmResult<u64> {
        let code = &self.compiled(func)?.code;
        let bytes = code.get(pc..pc + 8).ok_or(VmError::BytecodeBounds)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn branch_target(&self, func: usize, target: usize) -> VmResult<usize> {
        if target > self.code_len(func)? {
            return Err(VmError::InvalidBranch(target));
        }
        Ok(target)
    }

    fn callee_arity(&self, callee: u32) -> VmResult<usize> {
        match self.funcs.get(callee as usize) {
            Some(FuncInstance::Compiled(function)) => Ok(function.num_params),
            Some(FuncInstance::Host(host)) => Ok(host.arity),
            None => Err(VmError::InvalidCall(callee)),
        }
    }
}

fn pop(stack: &mut Vec<u64>) -> VmResult<u64> {
    stack.pop().ok_or(VmError::StackUnderflow)
}

fn binary(frame: &mut Frame, apply: impl Fn(u64, u64) -> u64) -> VmResult<()> {
    let rhs = pop(&mut frame.stack)?;
    let lhs = pop(&mut frame.stack)?;
    frame.stack.push(apply(lhs, rhs));
    Ok(())
}
