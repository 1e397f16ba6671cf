use stave::{
    CompileConfig, CompiledFunction, FuncBuilder, FuncInstance, HostFunc, Op, Vm, VmError,
};

fn interpreted_config() -> CompileConfig {
    CompileConfig {
        enabled: false,
        ..CompileConfig::default()
    }
}

fn vm_with(funcs: Vec<FuncInstance>, globals: Vec<u64>) -> Vm {
    Vm::with_config(funcs, globals, interpreted_config()).expect("vm should build")
}

fn compiled(body: stave::FuncBody, num_params: usize, num_locals: usize) -> FuncInstance {
    FuncInstance::Compiled(CompiledFunction::new(body, num_params, num_locals))
}

#[test]
fn arithmetic_and_bitwise_ops() {
    let mut f = FuncBuilder::new();
    f.i64_const(12);
    f.i64_const(3);
    f.op(Op::I64Sub); // 9
    f.i64_const(2);
    f.op(Op::I64Mul); // 18
    f.i64_const(0xFF);
    f.op(Op::I64And); // 18
    f.i64_const(0x20);
    f.op(Op::I64Or); // 0x32 = 50
    f.i64_const(0x02);
    f.op(Op::I64Xor); // 48
    let mut vm = vm_with(vec![compiled(f.finish(), 0, 0)], vec![]);
    assert_eq!(vm.invoke(0, &[]).unwrap(), Some(48));
}

#[test]
fn locals_and_params() {
    let mut f = FuncBuilder::new();
    f.get_local(0);
    f.get_local(1);
    f.op(Op::I64Add);
    f.set_local(2);
    f.get_local(2);
    let mut vm = vm_with(vec![compiled(f.finish(), 2, 1)], vec![]);
    assert_eq!(vm.invoke(0, &[40, 2]).unwrap(), Some(42));
}

#[test]
fn globals_are_shared_state() {
    let mut f = FuncBuilder::new();
    f.get_global(0);
    f.i64_const(1);
    f.op(Op::I64Add);
    f.set_global(0);
    f.get_global(0);
    let mut vm = vm_with(vec![compiled(f.finish(), 0, 0)], vec![7]);
    assert_eq!(vm.invoke(0, &[]).unwrap(), Some(8));
    assert_eq!(vm.global(0), Some(8));
    assert_eq!(vm.invoke(0, &[]).unwrap(), Some(9));
}

#[test]
fn select_and_drop() {
    let mut f = FuncBuilder::new();
    f.i64_const(100);
    f.op(Op::Drop);
    f.i64_const(1); // picked when condition is non-zero
    f.i64_const(2);
    f.get_local(0);
    f.op(Op::Select);
    let mut vm = vm_with(vec![compiled(f.finish(), 1, 0)], vec![]);
    assert_eq!(vm.invoke(0, &[1]).unwrap(), Some(1));
    assert_eq!(vm.invoke(0, &[0]).unwrap(), Some(2));
}

#[test]
fn backward_branch_loops_until_counter_drains() {
    // locals: 0 = countdown, 1 = accumulator
    let mut f = FuncBuilder::new();
    f.i64_const(5);
    f.set_local(0);
    let top = f.here();
    f.get_local(1);
    f.get_local(0);
    f.op(Op::I64Add);
    f.set_local(1);
    f.get_local(0);
    f.i64_const(1);
    f.op(Op::I64Sub);
    f.tee_local(0);
    f.br_if(top);
    f.get_local(1);
    let mut vm = vm_with(vec![compiled(f.finish(), 0, 2)], vec![]);
    assert_eq!(vm.invoke(0, &[]).unwrap(), Some(15));
}

#[test]
fn forward_branch_skips_dead_code() {
    let mut f = FuncBuilder::new();
    f.br(14); // over the constant below
    f.i64_const(1);
    f.i64_const(2); // offset 14
    let body = f.finish();
    assert_eq!(body.meta.instructions[2].start, 14);
    let mut vm = vm_with(vec![compiled(body, 0, 0)], vec![]);
    assert_eq!(vm.invoke(0, &[]).unwrap(), Some(2));
}

#[test]
fn calls_between_guest_functions() {
    // funcs[1](a, b) = a + b
    let mut callee = FuncBuilder::new();
    callee.get_local(0);
    callee.get_local(1);
    callee.op(Op::I64Add);

    let mut caller = FuncBuilder::new();
    caller.i64_const(40);
    caller.i64_const(2);
    caller.call(1, 2, true);

    let mut vm = vm_with(
        vec![
            compiled(caller.finish(), 0, 0),
            compiled(callee.finish(), 2, 0),
        ],
        vec![],
    );
    assert_eq!(vm.invoke(0, &[]).unwrap(), Some(42));
}

#[test]
fn calls_into_host_functions() {
    let host = FuncInstance::Host(HostFunc {
        arity: 2,
        handler: Box::new(|args| Some(args[0] * args[1])),
    });

    let mut caller = FuncBuilder::new();
    caller.i64_const(6);
    caller.i64_const(7);
    caller.call(0, 2, true);

    let mut vm = vm_with(vec![host, compiled(caller.finish(), 0, 0)], vec![]);
    assert_eq!(vm.invoke(1, &[]).unwrap(), Some(42));
}

#[test]
fn unreachable_traps() {
    let mut f = FuncBuilder::new();
    f.i64_const(1);
    f.op(Op::Unreachable);
    let mut vm = vm_with(vec![compiled(f.finish(), 0, 0)], vec![]);
    match vm.invoke(0, &[]) {
        Err(VmError::UnreachableExecuted { pc }) => assert_eq!(pc, 9),
        other => panic!("expected unreachable trap, got {other:?}"),
    }
}

#[test]
fn stack_underflow_is_reported() {
    let mut f = FuncBuilder::new();
    f.op(Op::I64Add);
    let mut vm = vm_with(vec![compiled(f.finish(), 0, 0)], vec![]);
    assert!(matches!(vm.invoke(0, &[]), Err(VmError::StackUnderflow)));
}

#[test]
fn arity_mismatch_is_reported() {
    let mut f = FuncBuilder::new();
    f.get_local(0);
    let mut vm = vm_with(vec![compiled(f.finish(), 1, 0)], vec![]);
    assert!(matches!(
        vm.invoke(0, &[]),
        Err(VmError::InvalidCallArity { expected: 1, got: 0, .. })
    ));
}

#[test]
fn unknown_function_is_reported() {
    let mut vm = vm_with(vec![], vec![]);
    assert!(matches!(vm.invoke(3, &[]), Err(VmError::InvalidCall(3))));
}
