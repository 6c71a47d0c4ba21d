//! Tests for the fasan IR builder, display, editing helpers and verifier.

use crate::builder::Builder;
use crate::display::display_function;
use crate::function::Function;
use crate::global::{GlobalVar, Initializer};
use crate::instruction::{ICmpOp, Op, Origin};
use crate::metadata::{MdNode, MdOperand};
use crate::module::{CtorEntry, Module};
use crate::types::Type;
use crate::verifier::{verify_function, verify_module};

fn o() -> Origin {
    Origin::synthetic()
}

#[test]
fn build_add_function() {
    let mut module = Module::new("m");
    let name = module.intern("add");
    let mut func = Function::new(name, vec![Type::Int, Type::Int], Some(Type::Int));
    let mut builder = Builder::new(&mut func);

    let entry = builder.create_block();
    builder.switch_to_block(entry);

    let a = builder.param(0, Type::Int, o());
    let b = builder.param(1, Type::Int, o());
    let sum = builder.add(a, b, o());
    builder.ret(Some(sum), o());

    assert_eq!(func.instructions.len(), 4);
    assert_eq!(func.blocks.len(), 1);
    assert_eq!(func.block_insts(entry).len(), 4);
    assert!(matches!(func.instructions[2].op, Op::Add(_, _)));
    assert!(matches!(func.instructions[3].op, Op::Ret(Some(_))));
    assert_eq!(func.param_prologue_len(), 2);
    assert!(verify_function(&func, &module.symbols).is_ok());
}

#[test]
fn display_add_function() {
    let mut module = Module::new("m");
    let name = module.intern("add");
    let mut func = Function::new(name, vec![Type::Int, Type::Int], Some(Type::Int));
    let mut builder = Builder::new(&mut func);
    let entry = builder.create_block();
    builder.switch_to_block(entry);
    let a = builder.param(0, Type::Int, o());
    let b = builder.param(1, Type::Int, o());
    let sum = builder.add(a, b, o());
    builder.ret(Some(sum), o());

    let output = display_function(&func, &module.symbols);
    assert_eq!(
        output,
        "func @add(int, int) -> int {\n\
         \x20\x20bb0:\n\
         \x20\x20\x20\x20v0 = param 0\n\
         \x20\x20\x20\x20v1 = param 1\n\
         \x20\x20\x20\x20v2 = add v0, v1\n\
         \x20\x20\x20\x20ret v2\n\
         }"
    );
}

#[test]
fn position_at_inserts_before_existing_instructions() {
    let mut module = Module::new("m");
    let name = module.intern("f");
    let mut func = Function::new(name, vec![Type::PTR], None);
    let mut builder = Builder::new(&mut func);
    let entry = builder.create_block();
    builder.switch_to_block(entry);
    let p = builder.param(0, Type::PTR, o());
    let v = builder.load(p, 4, Type::Int, o());
    builder.ret(None, o());

    // Insert an address computation right before the load.
    let mut builder = Builder::new(&mut func);
    builder.position_at(entry, 1);
    let addr = builder.ptr_to_addr(p, o());
    let four = builder.iconst(4, o());
    builder.add(addr, four, o());

    let order: Vec<_> = func
        .block_insts(entry)
        .iter()
        .map(|&i| func.inst(i).op.clone())
        .collect();
    assert!(matches!(order[0], Op::Param(0)));
    assert!(matches!(order[1], Op::PtrToAddr(_)));
    assert!(matches!(order[2], Op::Const(4)));
    assert!(matches!(order[3], Op::Add(..)));
    assert!(matches!(order[4], Op::Load(..)));
    assert_eq!(func.locate(v.inst().unwrap()), Some((entry, 4)));
    assert!(verify_function(&func, &module.symbols).is_ok());
}

#[test]
fn split_block_moves_tail_and_terminator() {
    let mut module = Module::new("m");
    let name = module.intern("f");
    let mut func = Function::new(name, vec![Type::PTR], None);
    let mut builder = Builder::new(&mut func);
    let entry = builder.create_block();
    builder.switch_to_block(entry);
    let p = builder.param(0, Type::PTR, o());
    let load = builder.load(p, 8, Type::Int, o());
    builder.ret(None, o());

    let tail = func.split_block(entry, 1);
    assert_eq!(func.block_insts(entry).len(), 1);
    assert_eq!(func.block_insts(tail).len(), 2);
    assert_eq!(func.locate(load.inst().unwrap()), Some((tail, 0)));
    assert!(func.terminator(entry).is_none());

    // Without a branch the head block is malformed.
    assert!(!verify_function(&func, &module.symbols).is_ok());

    let mut builder = Builder::new(&mut func);
    builder.switch_to_block(entry);
    builder.br(tail, vec![], o());
    assert!(verify_function(&func, &module.symbols).is_ok());
}

#[test]
fn display_branches_with_block_args() {
    let mut module = Module::new("m");
    let name = module.intern("max");
    let mut func = Function::new(name, vec![Type::Int, Type::Int], Some(Type::Int));
    let mut builder = Builder::new(&mut func);
    let entry = builder.create_block();
    let join = builder.create_block_with_args(&[Type::Int]);
    builder.switch_to_block(entry);
    let a = builder.param(0, Type::Int, o());
    let b = builder.param(1, Type::Int, o());
    let gt = builder.icmp(ICmpOp::Gt, a, b, o());
    builder.brif(gt, join, vec![a], join, vec![b], o());
    builder.switch_to_block(join);
    let r = func.block_arg_values(join)[0];
    let mut builder = Builder::new(&mut func);
    builder.switch_to_block(join);
    builder.ret(Some(r), o());

    let text = display_function(&func, &module.symbols);
    assert!(text.contains("brif v2, bb1(v0), bb1(v1)"), "{text}");
    assert!(text.contains("bb1(v4: int):"), "{text}");
    assert!(verify_function(&func, &module.symbols).is_ok());
}

#[test]
fn verifier_reports_zero_width_access_and_bad_types() {
    let mut module = Module::new("m");
    let name = module.intern("bad");
    let mut func = Function::new(name, vec![Type::Int], None);
    let mut builder = Builder::new(&mut func);
    let entry = builder.create_block();
    builder.switch_to_block(entry);
    let x = builder.param(0, Type::Int, o());
    builder.load(x, 0, Type::Int, o());
    builder.ret(None, o());

    let result = verify_function(&func, &module.symbols);
    assert_eq!(result.errors.len(), 2, "{result}");
    let text = result.to_string();
    assert!(text.contains("expected Ptr"));
    assert!(text.contains("access width must be > 0"));
}

#[test]
fn verifier_checks_globals_metadata_and_ctors() {
    let mut module = Module::new("m");
    let g = module.intern("g");
    let mut global = GlobalVar::new(g, 4, 3);
    global.init = Some(Initializer::Bytes(vec![0; 8]));
    let gid = module.add_global(global);

    let node = module.add_metadata(MdNode::new(vec![
        MdOperand::Global(gid),
        MdOperand::Global(crate::global::GlobalId(42)),
    ]));
    module.add_named_metadata("fasan.globals", node);
    let ctor = module.intern("missing_ctor");
    module.global_ctors.push(CtorEntry {
        priority: 1,
        function: ctor,
    });

    let result = verify_module(&module);
    let text = result.to_string();
    assert!(text.contains("not a power of two"), "{text}");
    assert!(text.contains("exceeds size"), "{text}");
    assert!(text.contains("dangling operand"), "{text}");
    assert!(text.contains("unknown function @missing_ctor"), "{text}");
}

#[test]
fn module_lookups_and_declarations() {
    let mut module = Module::new("m");
    let g = module.intern("counter");
    let gid = module.add_global(GlobalVar::new(g, 8, 8));
    assert_eq!(module.global_by_name("counter"), Some(gid));
    assert_eq!(module.global_by_name("nope"), None);

    let sym = module.declare_function("__asan_init", vec![], None);
    let again = module.declare_function("__asan_init", vec![], None);
    assert_eq!(sym, again);
    assert_eq!(module.functions.len(), 1);
    assert!(module.functions[0].is_declaration());
    assert!(verify_module(&module).is_ok());

    let text = module.to_string();
    assert!(text.contains("global @counter: size 8, align 8, external = zeroinitializer"));
    assert!(text.contains("declare @__asan_init()"));
}
