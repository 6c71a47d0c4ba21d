//! The full pipeline over a small program.

mod common;

use common::{assert_verifies, define, o, Machine, Stop};
use fasan_instrument::{AnalysisKind, InstrumentError, Pipeline, SanitizerConfig};
use fasan_ir::global::{GlobalVar, Initializer};
use fasan_ir::metadata::{MdNode, MdOperand};
use fasan_ir::module::Module;
use fasan_ir::types::Type;

/// `g` is a 12-byte global; `put(i)` writes `g[i]` and a 4-byte local.
fn program() -> Module {
    let mut module = Module::new("app.c");
    let g = module.intern("g");
    let mut var = GlobalVar::new(g, 12, 4);
    var.init = Some(Initializer::Bytes(vec![7; 12]));
    module.add_global(var);
    define(&mut module, "put", vec![Type::Int], Some(Type::Int), |b, p| {
        let local = b.stack_slot(4, 4, o());
        let base = b.symbol_addr(g, o());
        let at = b.ptr_add(base, p[0], o());
        let one = b.iconst(1, o());
        b.store(one, at, 1, o());
        let local_at = b.ptr_add(local, p[0], o());
        let v = b.load(local_at, 1, Type::Int, o());
        b.ret(Some(v), o());
    });
    module
}

#[test]
fn pipeline_instruments_globals_and_functions() {
    let config = SanitizerConfig::default();
    let mut module = program();
    let mut pipeline = Pipeline::new(config.clone());
    let report = pipeline.run(&mut module).unwrap();
    assert!(report.changed());
    assert_eq!(report.module.stats.instrumented_globals, 1);
    let put = report.function("put").unwrap();
    assert_eq!(put.stats.instrumented_accesses, 2);
    assert_eq!(put.stats.stack_variables, 1);
    // Generated functions are not instrumented again.
    assert!(!report.function("asan.module_ctor").unwrap().changed);
    assert!(report.preserved.is_preserved(AnalysisKind::GlobalsMetadata));
    assert!(!report.preserved.is_preserved(AnalysisKind::Cfg));
    assert_eq!(pipeline.cache().computations(), 1);
    assert!(pipeline.cache().cached_globals_metadata().is_some());
    assert_eq!(report.diagnostics().count(), 0);
    assert_verifies(&module);

    let mut machine = Machine::new(&module, &config);
    machine.run_ctors().unwrap();
    assert_eq!(machine.registered.len(), 1);
    let g = machine.address_of("g");
    assert_eq!(machine.call("put", &[3]), Ok(Some(0)));
    assert_eq!(machine.read(g, 4), [7, 7, 7, 1]);
    assert!(machine.reports.is_empty());
    assert!(machine.stack_shadow_clean());

    // g[12] is the first redzone byte.
    assert_eq!(machine.call("put", &[12]), Err(Stop::Unreachable));
    assert_eq!(machine.reports[0].routine, "__asan_report_store1");
    assert_eq!(machine.reports[0].addr, g + 12);
}

#[test]
fn local_overflow_is_caught() {
    let config = SanitizerConfig::default();
    let mut module = program();
    Pipeline::new(config.clone()).run(&mut module).unwrap();

    let mut machine = Machine::new(&module, &config);
    machine.run_ctors().unwrap();
    // Reading local[4] hits the right redzone of the frame.
    assert_eq!(machine.call("put", &[4]), Err(Stop::Unreachable));
    assert_eq!(machine.reports[0].routine, "__asan_report_load1");
}

#[test]
fn second_run_changes_nothing() {
    let config = SanitizerConfig::default();
    let mut module = program();
    let mut pipeline = Pipeline::new(config);
    pipeline.run(&mut module).unwrap();
    let functions = module.functions.len();
    let globals = module.globals.len();
    let instructions: usize = module.functions.iter().map(|f| f.instructions.len()).sum();

    let report = pipeline.run(&mut module).unwrap();
    assert!(!report.changed());
    assert!(report.preserved.are_all_preserved());
    // One analysis per run.
    assert_eq!(pipeline.cache().computations(), 2);
    assert_eq!(module.functions.len(), functions);
    assert_eq!(module.globals.len(), globals);
    let after: usize = module.functions.iter().map(|f| f.instructions.len()).sum();
    assert_eq!(after, instructions);
}

#[test]
fn annotations_do_not_leak_between_modules() {
    let mut pipeline = Pipeline::new(SanitizerConfig::default());

    let mut first = program();
    let g = first.global_by_name("g").unwrap();
    let node = first.add_metadata(MdNode::new(vec![
        MdOperand::Global(g),
        MdOperand::Null,
        MdOperand::String("g".to_string()),
        MdOperand::Int(0),
        MdOperand::Int(1),
    ]));
    first.add_named_metadata("fasan.globals", node);
    let report = pipeline.run(&mut first).unwrap();
    assert_eq!(report.module.stats.instrumented_globals, 0);

    // Same global ids, no annotations: `g` must not inherit the exclusion.
    let mut second = program();
    let report = pipeline.run(&mut second).unwrap();
    assert_eq!(report.module.stats.instrumented_globals, 1);
    assert_eq!(pipeline.cache().computations(), 2);
}

#[test]
fn diagnostics_are_collected() {
    let mut module = program();
    let sym = module.intern("pinned");
    let mut var = GlobalVar::new(sym, 8, 8);
    var.fixed_address = true;
    let pinned = module.add_global(var);
    let node = module.add_metadata(MdNode::new(vec![
        MdOperand::Global(pinned),
        MdOperand::Null,
        MdOperand::String("pinned".to_string()),
        MdOperand::Int(1),
        MdOperand::Int(0),
    ]));
    module.add_named_metadata("fasan.globals", node);

    let report = Pipeline::new(SanitizerConfig::default())
        .run(&mut module)
        .unwrap();
    let diags: Vec<_> = report.diagnostics().collect();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].symbol, "pinned");
    assert_eq!(
        diags[0].to_string(),
        "@pinned: dynamic initialization of a fixed-address global is not checked"
    );
}

#[test]
fn unsupported_scale_is_an_error() {
    let config = SanitizerConfig {
        mapping_scale: 64,
        ..SanitizerConfig::default()
    };
    let mut module = program();
    let err = Pipeline::new(config).run(&mut module).unwrap_err();
    assert!(matches!(err, InstrumentError::UnsupportedScale(64)));
    assert_eq!(module.global(module.global_by_name("g").unwrap()).size, 12);
}

#[test]
fn config_from_json_drives_the_pipeline() {
    let config = SanitizerConfig::from_json(r#"{ "instrument_globals": false, "recover": true }"#)
        .unwrap();
    let mut module = program();
    let report = Pipeline::new(config.clone()).run(&mut module).unwrap();
    assert_eq!(report.module.stats.instrumented_globals, 0);
    assert_eq!(
        module.global(module.global_by_name("g").unwrap()).size,
        12
    );
    assert!(module.function_by_name("__asan_report_store1_noabort").is_some());

    let mut machine = Machine::new(&module, &config);
    machine.run_ctors().unwrap();
    assert!(machine.registered.is_empty());
    // The global has no redzone; only the local read is out of bounds.
    assert_eq!(machine.call("put", &[12]), Ok(Some(0)));
    assert_eq!(machine.reports.len(), 1);
    assert_eq!(machine.reports[0].routine, "__asan_report_load1_noabort");
}
