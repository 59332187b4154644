mod utils;

use std::cell::RefCell;
use std::rc::Rc;

use utils::*;
use wasmite::{
    execute, exported_function, exported_global, exported_memory, exported_table, instantiate,
    parse, resolve_imported_functions, resolve_instantiate, Error, ExecutionResult,
    ExternalFunction, FuncType, GlobalCell, GlobalType, ImportedFunction, Memory, Table, ValType,
    Value, DEFAULT_MEMORY_PAGES_LIMIT,
};

fn instantiate_simple(bytes: &[u8]) -> Rc<wasmite::Instance> {
    instantiate(
        parse(bytes).unwrap(),
        vec![],
        vec![],
        vec![],
        vec![],
        DEFAULT_MEMORY_PAGES_LIMIT,
    )
    .unwrap()
}

fn host_const_i32(v: i32) -> ExternalFunction {
    ExternalFunction {
        ty: FuncType::new(vec![], Some(ValType::I32)),
        func: Rc::new(move |_, _, _| ExecutionResult::Value(Value::from_i32(v))),
    }
}

#[test]
fn memory_is_zero_initialised() {
    let inst = instantiate_simple(&load8_module());
    assert_eq!(inst.memory_size(), 65536);
    let mem = inst.memory.as_ref().unwrap().borrow();
    assert!(mem.data().iter().all(|&b| b == 0));
}

#[test]
fn data_segments_are_applied() {
    let bytes = module(&[
        memory_section(1, None),
        export_section(&[export_entry("memory", 2, 0)]),
        data_section(&[
            data_entry(&i32_const(0), b"abc"),
            data_entry(&i32_const(100), &[0xff]),
        ]),
    ]);
    let inst = instantiate_simple(&bytes);
    let mem = inst.memory.as_ref().unwrap().borrow();
    assert_eq!(&mem.data()[0..3], b"abc");
    assert_eq!(mem.data()[100], 0xff);
}

#[test]
fn globals_evaluate_their_initialisers() {
    let bytes = module(&[
        global_section(&[
            global_entry(I32, false, &i32_const(42)),
            global_entry(F64, true, &f64_const(2.5)),
        ]),
        export_section(&[export_entry("a", 3, 0), export_entry("b", 3, 1)]),
    ]);
    let inst = instantiate_simple(&bytes);
    let a = exported_global(&inst, "a").unwrap();
    let b = exported_global(&inst, "b").unwrap();
    assert_eq!(a.borrow().value.as_i32(), 42);
    assert_eq!(b.borrow().value.as_f64(), 2.5);
    assert!(b.borrow().ty.mutable);
}

#[test]
fn global_init_can_read_imported_global() {
    let bytes = module(&[
        import_section(&[import_entry("env", "base", &import_global_desc(I32, false))]),
        global_section(&[global_entry(I32, false, &[op::GLOBAL_GET, 0])]),
        export_section(&[export_entry("derived", 3, 1)]),
    ]);
    let cell = Rc::new(RefCell::new(GlobalCell {
        ty: GlobalType { value_type: ValType::I32, mutable: false },
        value: Value::from_i32(17),
    }));
    let inst = instantiate(
        parse(&bytes).unwrap(),
        vec![],
        vec![],
        vec![],
        vec![cell],
        DEFAULT_MEMORY_PAGES_LIMIT,
    )
    .unwrap();
    let derived = exported_global(&inst, "derived").unwrap();
    assert_eq!(derived.borrow().value.as_i32(), 17);
}

#[test]
fn import_counts_must_match() {
    let bytes = module(&[
        type_section(&[func_type(&[], Some(I32))]),
        import_section(&[import_entry("env", "f", &import_func_desc(0))]),
    ]);
    // Nothing supplied
    let err = instantiate(
        parse(&bytes).unwrap(),
        vec![],
        vec![],
        vec![],
        vec![],
        DEFAULT_MEMORY_PAGES_LIMIT,
    )
    .unwrap_err();
    assert_eq!(err, Error::Link("unknown import"));

    // Surplus supplied
    let err = instantiate(
        parse(&bytes).unwrap(),
        vec![host_const_i32(1), host_const_i32(2)],
        vec![],
        vec![],
        vec![],
        DEFAULT_MEMORY_PAGES_LIMIT,
    )
    .unwrap_err();
    assert_eq!(err, Error::Link("unknown import"));
}

#[test]
fn imported_function_signature_must_match() {
    let bytes = module(&[
        type_section(&[func_type(&[I64], Some(I64))]),
        import_section(&[import_entry("env", "f", &import_func_desc(0))]),
    ]);
    let err = instantiate(
        parse(&bytes).unwrap(),
        vec![host_const_i32(1)],
        vec![],
        vec![],
        vec![],
        DEFAULT_MEMORY_PAGES_LIMIT,
    )
    .unwrap_err();
    assert_eq!(err, Error::Link("incompatible import type"));
}

#[test]
fn imported_memory_limits_are_checked() {
    let bytes = module(&[import_section(&[import_entry(
        "env",
        "mem",
        &import_memory_desc(2, Some(4)),
    )])]);

    // Too small
    let small = Rc::new(RefCell::new(Memory::new(1, 4)));
    let err = instantiate(
        parse(&bytes).unwrap(),
        vec![],
        vec![],
        vec![small],
        vec![],
        DEFAULT_MEMORY_PAGES_LIMIT,
    )
    .unwrap_err();
    assert_eq!(err, Error::Link("incompatible import type"));

    // Cap above the declared maximum
    let roomy = Rc::new(RefCell::new(Memory::new(2, 8)));
    let err = instantiate(
        parse(&bytes).unwrap(),
        vec![],
        vec![],
        vec![roomy],
        vec![],
        DEFAULT_MEMORY_PAGES_LIMIT,
    )
    .unwrap_err();
    assert_eq!(err, Error::Link("incompatible import type"));

    // Compatible
    let fitting = Rc::new(RefCell::new(Memory::new(2, 4)));
    assert!(instantiate(
        parse(&bytes).unwrap(),
        vec![],
        vec![],
        vec![fitting],
        vec![],
        DEFAULT_MEMORY_PAGES_LIMIT,
    )
    .is_ok());
}

#[test]
fn imported_global_type_must_match() {
    let bytes = module(&[import_section(&[import_entry(
        "env",
        "g",
        &import_global_desc(I32, false),
    )])]);
    let wrong_mutability = Rc::new(RefCell::new(GlobalCell {
        ty: GlobalType { value_type: ValType::I32, mutable: true },
        value: Value::from_i32(0),
    }));
    let err = instantiate(
        parse(&bytes).unwrap(),
        vec![],
        vec![],
        vec![],
        vec![wrong_mutability],
        DEFAULT_MEMORY_PAGES_LIMIT,
    )
    .unwrap_err();
    assert_eq!(err, Error::Link("incompatible import type"));
}

#[test]
fn element_segments_fill_the_table() {
    let bytes = module(&[
        type_section(&[func_type(&[], Some(I32))]),
        function_section(&[0]),
        table_section(3, None),
        export_section(&[export_entry("table", 1, 0)]),
        element_section(&[element_entry(&i32_const(1), &[0])]),
        code_section(&[code_entry(&[], &concat(&[&i32_const(9), &[op::END]]))]),
    ]);
    let inst = instantiate_simple(&bytes);
    let shared = exported_table(&inst, "table").unwrap();
    let table = shared.borrow();
    assert_eq!(table.size(), 3);
    assert!(table.get(0).unwrap().is_none());
    assert!(table.get(2).unwrap().is_none());
    let f = table.get(1).unwrap().clone().unwrap();
    drop(table);
    assert_eq!((f.func)(&inst, &[], 0), ExecutionResult::Value(Value::from_i32(9)));
}

#[test]
fn out_of_range_element_segment_leaves_table_untouched() {
    let bytes = module(&[
        type_section(&[func_type(&[], Some(I32))]),
        import_section(&[import_entry("env", "tab", &import_table_desc(2, None))]),
        function_section(&[0]),
        element_section(&[
            element_entry(&i32_const(0), &[0]),
            element_entry(&i32_const(5), &[0]),
        ]),
        code_section(&[code_entry(&[], &concat(&[&i32_const(1), &[op::END]]))]),
    ]);
    let shared = Rc::new(RefCell::new(Table::new(2, u32::MAX)));
    let err = instantiate(
        parse(&bytes).unwrap(),
        vec![],
        vec![shared.clone()],
        vec![],
        vec![],
        DEFAULT_MEMORY_PAGES_LIMIT,
    )
    .unwrap_err();
    assert_eq!(err, Error::Link("elements segment does not fit"));
    // The in-range first segment must not have been written either
    assert!(shared.borrow().get(0).unwrap().is_none());
}

#[test]
fn out_of_range_data_segment_leaves_memory_untouched() {
    let bytes = module(&[
        import_section(&[import_entry("env", "mem", &import_memory_desc(1, None))]),
        data_section(&[
            data_entry(&i32_const(0), b"xyz"),
            data_entry(&i32_const(65535), b"overflow"),
        ]),
    ]);
    let shared = Rc::new(RefCell::new(Memory::new(1, 1)));
    let err = instantiate(
        parse(&bytes).unwrap(),
        vec![],
        vec![],
        vec![shared.clone()],
        vec![],
        DEFAULT_MEMORY_PAGES_LIMIT,
    )
    .unwrap_err();
    assert_eq!(err, Error::Link("data segment does not fit"));
    assert_eq!(shared.borrow().data()[0], 0);
}

#[test]
fn trapping_start_function_fails_instantiation() {
    let bytes = module(&[
        type_section(&[func_type(&[], None)]),
        function_section(&[0]),
        start_section(0),
        code_section(&[code_entry(&[], &[op::UNREACHABLE, op::END])]),
    ]);
    let err = instantiate(
        parse(&bytes).unwrap(),
        vec![],
        vec![],
        vec![],
        vec![],
        DEFAULT_MEMORY_PAGES_LIMIT,
    )
    .unwrap_err();
    assert_eq!(err, Error::Uninstantiable("start function trapped"));
}

#[test]
fn start_function_runs_after_segments() {
    // start reads the byte a data segment wrote and stores it doubled
    let body = concat(&[
        &i32_const(1),
        &i32_const(0),
        &[op::I32_LOAD8_U, 0, 0],
        &i32_const(2),
        &[op::I32_MUL, op::I32_STORE8, 0, 0, op::END],
    ]);
    let bytes = module(&[
        type_section(&[func_type(&[], None)]),
        function_section(&[0]),
        memory_section(1, None),
        export_section(&[export_entry("memory", 2, 0)]),
        start_section(0),
        code_section(&[code_entry(&[], &body)]),
        data_section(&[data_entry(&i32_const(0), &[21])]),
    ]);
    let inst = instantiate_simple(&bytes);
    assert_eq!(inst.memory.as_ref().unwrap().borrow().data()[1], 42);
}

#[test]
fn declared_memory_above_pages_limit_fails() {
    let bytes = module(&[memory_section(4, None)]);
    let err = instantiate(parse(&bytes).unwrap(), vec![], vec![], vec![], vec![], 2).unwrap_err();
    assert_eq!(err, Error::Link("maximum memory page limit exceeded"));
}

#[test]
fn resolver_is_order_independent() {
    let bytes = module(&[
        type_section(&[func_type(&[], Some(I32)), func_type(&[], Some(I64))]),
        import_section(&[
            import_entry("env", "a", &import_func_desc(0)),
            import_entry("env", "b", &import_func_desc(1)),
        ]),
    ]);

    let candidates = || {
        vec![
            ImportedFunction {
                module: "env".into(),
                name: "b".into(),
                inputs: vec![],
                output: Some(ValType::I64),
                func: Rc::new(|_, _, _| ExecutionResult::Value(Value::from_i64(64))),
            },
            ImportedFunction {
                module: "env".into(),
                name: "a".into(),
                inputs: vec![],
                output: Some(ValType::I32),
                func: Rc::new(|_, _, _| ExecutionResult::Value(Value::from_i32(32))),
            },
        ]
    };

    let module_parsed = parse(&bytes).unwrap();
    let resolved = resolve_imported_functions(&module_parsed, candidates()).unwrap();
    assert_eq!(resolved.len(), 2);
    // Position 0 must be "a" regardless of candidate order
    assert_eq!(resolved[0].ty.output, Some(ValType::I32));
    assert_eq!(resolved[1].ty.output, Some(ValType::I64));

    let inst = instantiate(
        module_parsed,
        resolved,
        vec![],
        vec![],
        vec![],
        DEFAULT_MEMORY_PAGES_LIMIT,
    )
    .unwrap();
    assert_eq!(execute(&inst, 0, &[], 0), ExecutionResult::Value(Value::from_i32(32)));
    assert_eq!(execute(&inst, 1, &[], 0), ExecutionResult::Value(Value::from_i64(64)));
}

#[test]
fn resolver_reports_missing_and_mismatched_imports() {
    let bytes = module(&[
        type_section(&[func_type(&[], Some(I32))]),
        import_section(&[import_entry("env", "f", &import_func_desc(0))]),
    ]);
    let m = parse(&bytes).unwrap();

    assert_eq!(
        resolve_imported_functions(&m, vec![]).unwrap_err(),
        Error::Link("unknown import")
    );

    let wrong_sig = vec![ImportedFunction {
        module: "env".into(),
        name: "f".into(),
        inputs: vec![ValType::I32],
        output: Some(ValType::I32),
        func: Rc::new(|_, _, _| ExecutionResult::Void),
    }];
    assert_eq!(
        resolve_imported_functions(&m, wrong_sig).unwrap_err(),
        Error::Link("incompatible import type")
    );
}

#[test]
fn resolver_ignores_surplus_candidates() {
    let m = parse(&add_module()).unwrap();
    let surplus = vec![ImportedFunction {
        module: "env".into(),
        name: "unused".into(),
        inputs: vec![],
        output: None,
        func: Rc::new(|_, _, _| ExecutionResult::Void),
    }];
    let inst = resolve_instantiate(m, surplus, DEFAULT_MEMORY_PAGES_LIMIT).unwrap();
    let add = exported_function(&inst, "add").unwrap();
    let r = (add.func)(&inst, &[Value::from_i32(2), Value::from_i32(3)], 0);
    assert_eq!(r, ExecutionResult::Value(Value::from_i32(5)));
}

#[test]
fn exported_memory_handle_is_shared() {
    let inst = instantiate_simple(&load8_module());
    let mem = exported_memory(&inst, "memory").unwrap();
    mem.borrow_mut().store_u8(10, 0, 0xab).unwrap();
    assert_eq!(inst.memory.as_ref().unwrap().borrow().load_u8(10, 0).unwrap(), 0xab);
}
