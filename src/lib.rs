pub mod bytecode;
pub mod compile;
pub mod ops;
pub mod vm;

pub use bytecode::{FuncBody, FuncBuilder};
pub use compile::{
    BytecodeMetadata, CompilationCandidate, CompileError, CompileResult, InstructionMetadata,
    Metrics, NativeCompiler,
};
pub use ops::Op;
pub use vm::{
    CompileConfig, CompiledFunction, FuncInstance, HostFunc, Vm, VmError, VmResult,
    NATIVE_PROLOGUE_SIZE,
};
