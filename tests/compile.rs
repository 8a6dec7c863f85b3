//! End-to-end tests: build small checked programs by hand, compile them to
//! images and check the bytes that come out.

use cranelift_entity::{EntityRef, PrimaryMap};
use sable_codegen::sema::{
    BasicType, Callee, Capture, ClassType, CoroutineSource, EnumField, EnumType, Expr, ExprKind,
    FuncDecl, FuncId, FuncKind, GlobalDecl, LValue, Literal, LocalId, Method, Pattern, Program,
    Signature, Stmt, StmtKind, StructField, StructType, TypeData, TypeId, TypeStore,
};
use sable_codegen::srcmap::Loc;
use sable_codegen::{CodegenError, Context, Image};

fn loc() -> Loc {
    Loc::unknown()
}

fn expr(kind: ExprKind, ty: TypeId) -> Expr {
    Expr::new(kind, ty, loc())
}

fn stmt(kind: StmtKind) -> Stmt {
    Stmt { kind, loc: loc() }
}

fn func(name: &str, ret: Option<TypeId>, body: Vec<Stmt>) -> FuncDecl {
    FuncDecl {
        name: name.to_string(),
        params: Vec::new(),
        upvalues: Vec::new(),
        locals: PrimaryMap::new(),
        ret,
        body,
        kind: FuncKind::Plain,
        loc: loc(),
    }
}

fn compile(program: &Program) -> Image {
    let _ = env_logger::builder().is_test(true).try_init();
    Context::new().compile(program).expect("compilation succeeds")
}

/// The five segments of an image, in header order.
fn segments(image: &Image) -> [&[u8]; 5] {
    let [c, g, t, k, code] = image.segment_offsets();
    let bytes = &image.bytes;
    [
        &bytes[c as usize..g as usize],
        &bytes[g as usize..t as usize],
        &bytes[t as usize..k as usize],
        &bytes[k as usize..code as usize],
        &bytes[code as usize..],
    ]
}

fn find_pattern(haystack: &[u8], pattern: &[Option<u8>]) -> bool {
    haystack.windows(pattern.len()).any(|window| {
        window
            .iter()
            .zip(pattern)
            .all(|(byte, want)| want.map_or(true, |w| w == *byte))
    })
}

#[test]
fn empty_main_image_layout() {
    let types = TypeStore::new();
    let mut program = Program::new(types);
    let main = program.funcs.push(func("main", None, Vec::new()));
    program.main = Some(main);

    let image = compile(&program);
    let [constants, globals, templates, keys, code] = image.segment_offsets();
    assert_eq!(constants, 40);
    assert_eq!(globals, 40);
    assert_eq!(templates, 40);
    assert_eq!(keys, 40);
    // Only `$tag` is interned.
    assert_eq!(code, 40 + "$tag=0\n".len() as u64);
    // Round-trip size: segments plus the header account for every byte.
    assert_eq!(image.bytes.len() as u64, code + image.code().len() as u64);

    // fn_alloc; fn_calli <main>; halt 255 -- then main: fn_ret.
    assert_eq!(
        image.code(),
        &[0xb0, 0xb4, 8, 0, 0, 0, 0xf2, 0xff, 0xb5]
    );
}

#[test]
fn forward_call_is_patched() {
    let mut types = TypeStore::new();
    let unreachable = types.push(TypeData::Unreachable);
    let mut program = Program::new(types);
    let callee_id = FuncId::new(1);
    let main = program.funcs.push(func(
        "main",
        None,
        vec![stmt(StmtKind::Expr(expr(
            ExprKind::Call { callee: Callee::Direct(callee_id), args: Vec::new() },
            unreachable,
        )))],
    ));
    let pushed = program.funcs.push(func("helper", None, Vec::new()));
    assert_eq!(pushed, callee_id);
    program.main = Some(main);

    let image = compile(&program);
    // Prologue calls main at 8; main's body calls helper at 15, a forward
    // reference patched by the linker.
    assert_eq!(
        image.code(),
        &[
            0xb0, 0xb4, 8, 0, 0, 0, 0xf2, 0xff, // prologue
            0xb0, 0xb4, 15, 0, 0, 0, 0xb5, // main
            0xb5, // helper
        ]
    );
}

#[test]
fn main_call_prologue_with_argv_and_return() {
    let mut types = TypeStore::new();
    let u8_ty = types.push(TypeData::Basic(BasicType::U8));
    let argv_ty = types.push(TypeData::Array { elem: u8_ty });
    let i32_ty = types.push(TypeData::Basic(BasicType::I32));
    let mut program = Program::new(types);
    let mut main = func(
        "main",
        Some(i32_ty),
        vec![stmt(StmtKind::Return(Some(expr(
            ExprKind::Literal(Literal::Int(0)),
            i32_ty,
        ))))],
    );
    main.params.push(argv_ty);
    let main = program.funcs.push(main);
    program.main = Some(main);

    let image = compile(&program);
    // fn_alloc; fn_set_reg_ptr 0,0; fn_calli <main>; fn_get_ret_reg
    // 255,255,4; halt 255.
    assert_eq!(
        &image.code()[..15],
        &[0xb0, 0xb2, 0, 0, 0xb4, 15, 0, 0, 0, 0xb6, 0xff, 0xff, 4, 0xf2, 0xff]
    );
    // main: argument pinned in register 0, the literal gets register 1.
    assert_eq!(
        &image.code()[15..],
        &[0x03, 1, 1, 0, 0x01, 0xff, 1, 4, 0xb5]
    );
}

#[test]
fn enum_member_loads_resolved_value() {
    let mut types = TypeStore::new();
    let enum_ty = types.push(TypeData::Enum(EnumType {
        fields: vec![
            EnumField { name: "A".into(), value: None, loc: loc() },
            EnumField { name: "B".into(), value: None, loc: loc() },
            EnumField { name: "C".into(), value: None, loc: loc() },
        ],
        backing: None,
    }));
    let mut program = Program::new(types);
    let mut main = func("main", None, Vec::new());
    let x = main.locals.push(enum_ty);
    main.body.push(stmt(StmtKind::Let {
        pattern: Pattern::Name(x),
        init: expr(ExprKind::EnumMember { index: 2 }, enum_ty),
    }));
    let main = program.funcs.push(main);
    program.main = Some(main);

    let image = compile(&program);
    // mv_reg_i r0, 2 with a one-byte variable-width immediate; C = 2.
    assert_eq!(&image.code()[8..], &[0x03, 0, 1, 2, 0xb5]);
}

#[test]
fn mixed_assigned_enum_values() {
    let e = EnumType {
        fields: vec![
            EnumField { name: "A".into(), value: Some(0x10), loc: loc() },
            EnumField { name: "B".into(), value: None, loc: loc() },
            EnumField { name: "C".into(), value: None, loc: loc() },
        ],
        backing: None,
    };
    assert_eq!(e.resolve_values().unwrap(), vec![16, 17, 18]);
}

#[test]
fn duplicate_enum_values_are_fatal() {
    let mut types = TypeStore::new();
    let enum_ty = types.push(TypeData::Enum(EnumType {
        fields: vec![
            EnumField { name: "A".into(), value: Some(1), loc: loc() },
            EnumField { name: "B".into(), value: Some(1), loc: loc() },
        ],
        backing: None,
    }));
    let mut program = Program::new(types);
    let mut main = func("main", None, Vec::new());
    let x = main.locals.push(enum_ty);
    main.body.push(stmt(StmtKind::Let {
        pattern: Pattern::Name(x),
        init: expr(ExprKind::EnumMember { index: 0 }, enum_ty),
    }));
    let main = program.funcs.push(main);
    program.main = Some(main);

    let err = Context::new().compile(&program).unwrap_err();
    assert!(err.to_string().contains("Enum fields values must be unique"));
}

#[test]
fn field_ids_are_stable_across_structs() {
    let mut types = TypeStore::new();
    let i64_ty = types.push(TypeData::Basic(BasicType::I64));
    let field = |name: &str| StructField { name: name.into(), ty: i64_ty, loc: loc() };
    let s1 = StructType { fields: vec![field("x"), field("y"), field("z")] };
    let s2 = StructType { fields: vec![field("y"), field("w"), field("x")] };
    let s1_ty = types.push(TypeData::Struct(s1));
    let s2_ty = types.push(TypeData::Struct(s2));

    let mut program = Program::new(types);
    let mut main = func("main", None, Vec::new());
    let a = main.locals.push(s1_ty);
    let b = main.locals.push(s2_ty);
    let int = |v: i64| expr(ExprKind::Literal(Literal::Int(v)), i64_ty);
    main.body.push(stmt(StmtKind::Let {
        pattern: Pattern::Name(a),
        init: expr(
            ExprKind::StructLit {
                fields: vec![("x".into(), int(1)), ("y".into(), int(2)), ("z".into(), int(3))],
            },
            s1_ty,
        ),
    }));
    main.body.push(stmt(StmtKind::Let {
        pattern: Pattern::Name(b),
        init: expr(
            ExprKind::StructLit {
                fields: vec![("y".into(), int(1)), ("w".into(), int(2)), ("x".into(), int(3))],
            },
            s2_ty,
        ),
    }));
    let main = program.funcs.push(main);
    program.main = Some(main);

    let image = compile(&program);
    let [_, _, templates, keys, _] = segments(&image);
    // x=1, y=2, z=3 from the first struct; w=4 from the second.
    assert_eq!(keys, b"$tag=0\nx=1\ny=2\nz=3\nw=4\n");
    // Both templates sort their fields by field ID with 8-byte slots.
    #[rustfmt::skip]
    let expected: Vec<u8> = vec![
        // struct one: x@0, y@8, z@16, 24 bytes total
        3, 24, 0,
        1, 0, 0, 0, 0, 0, 0,
        2, 0, 0, 0, 8, 0, 0,
        3, 0, 0, 0, 16, 0, 0,
        // struct two sorts to x@0, y@8, w@16
        3, 24, 0,
        1, 0, 0, 0, 0, 0, 0,
        2, 0, 0, 0, 8, 0, 0,
        4, 0, 0, 0, 16, 0, 0,
    ];
    assert_eq!(templates, &expected[..]);
}

fn deconstruction_program(bindings: Vec<&str>, with_rest: bool) -> Program {
    let mut types = TypeStore::new();
    let i32_ty = types.push(TypeData::Basic(BasicType::I32));
    let field = |name: &str| StructField { name: name.into(), ty: i32_ty, loc: loc() };
    let strukt = StructType { fields: vec![field("a"), field("b"), field("c")] };
    let struct_ty = types.push(TypeData::Struct(strukt));

    let mut program = Program::new(types);
    let source_id = FuncId::new(1);
    let mut main = func("main", None, Vec::new());
    let bindings: Vec<(String, LocalId)> = bindings
        .into_iter()
        .map(|name| (name.to_string(), main.locals.push(i32_ty)))
        .collect();
    let rest = with_rest.then(|| main.locals.push(struct_ty));
    main.body.push(stmt(StmtKind::Let {
        pattern: Pattern::Struct { bindings, rest },
        init: expr(
            ExprKind::Call { callee: Callee::Direct(source_id), args: Vec::new() },
            struct_ty,
        ),
    }));
    let main = program.funcs.push(main);

    let int = |v: i64| expr(ExprKind::Literal(Literal::Int(v)), i32_ty);
    let source = FuncDecl {
        ret: Some(struct_ty),
        body: vec![stmt(StmtKind::Return(Some(expr(
            ExprKind::StructLit {
                fields: vec![("a".into(), int(1)), ("b".into(), int(2)), ("c".into(), int(3))],
            },
            struct_ty,
        ))))],
        ..func("source", Some(struct_ty), Vec::new())
    };
    let pushed = program.funcs.push(source);
    assert_eq!(pushed, source_id);
    program.main = Some(main);
    program
}

#[test]
fn deconstruction_rest_synthesizes_a_struct() {
    let program = deconstruction_program(vec!["a"], true);
    let image = compile(&program);
    // The rest struct {b, c} of two 4-byte fields goes through the
    // registration path: s_alloc dst, 2, 8.
    assert!(find_pattern(image.code(), &[Some(0x10), None, Some(2), Some(8), Some(0)]));
    // Two s_reg_field registrations follow, for field IDs 2 (b) and 3 (c).
    assert!(find_pattern(
        image.code(),
        &[Some(0x12), None, Some(0), Some(2), Some(0), Some(0), Some(0)],
    ));
    assert!(find_pattern(
        image.code(),
        &[Some(0x12), None, Some(1), Some(3), Some(0), Some(0), Some(0)],
    ));
}

#[test]
fn deconstructing_every_field_rejects_rest() {
    let program = deconstruction_program(vec!["a", "b", "c"], true);
    let err = Context::new().compile(&program).unwrap_err();
    assert!(err.to_string().contains("All fields"));
    assert!(matches!(err, CodegenError::Resolution { .. }));
}

#[test]
fn string_literals_fill_from_the_pool() {
    let mut types = TypeStore::new();
    let u8_ty = types.push(TypeData::Basic(BasicType::U8));
    let str_ty = types.push(TypeData::Array { elem: u8_ty });
    let mut program = Program::new(types);
    let mut main = func("main", None, Vec::new());
    let s = main.locals.push(str_ty);
    main.body.push(stmt(StmtKind::Let {
        pattern: Pattern::Name(s),
        init: expr(ExprKind::Literal(Literal::Str("hi".into())), str_ty),
    }));
    let main = program.funcs.push(main);
    program.main = Some(main);

    let image = compile(&program);
    let [constants, _, _, _, code] = segments(&image);
    assert_eq!(constants, b"hi");
    // a_alloc dst, scalar elements, length 2, element size 1.
    assert!(find_pattern(
        code,
        &[
            Some(0x26), None, Some(0),
            Some(2), Some(0), Some(0), Some(0), Some(0), Some(0), Some(0), Some(0),
            Some(1),
        ],
    ));
    // Element-wise a_storef_const from pool offsets 0 and 1.
    assert!(find_pattern(
        code,
        &[Some(0x2b), None, Some(0), Some(0), Some(0), Some(0), Some(1), Some(0), Some(1)],
    ));
    assert!(find_pattern(
        code,
        &[Some(0x2b), None, Some(1), Some(0), Some(0), Some(0), Some(1), Some(1), Some(1)],
    ));
}

#[test]
fn globals_get_slots_and_moves() {
    let mut types = TypeStore::new();
    let i64_ty = types.push(TypeData::Basic(BasicType::I64));
    let mut program = Program::new(types);
    program.globals.push(GlobalDecl {
        name: "counter".into(),
        uid: 42,
        ty: i64_ty,
        loc: loc(),
    });
    let mut main = func("main", None, Vec::new());
    let x = main.locals.push(i64_ty);
    main.body.push(stmt(StmtKind::Assign {
        target: LValue::Global(42),
        value: expr(ExprKind::Literal(Literal::Int(5)), i64_ty),
    }));
    main.body.push(stmt(StmtKind::Let {
        pattern: Pattern::Name(x),
        init: expr(ExprKind::Global(42), i64_ty),
    }));
    let main = program.funcs.push(main);
    program.main = Some(main);

    let image = compile(&program);
    let [_, globals, _, _, code] = segments(&image);
    assert_eq!(globals.len(), 8);
    // mv_global_reg 0, r, 8 and mv_reg_global r, 0, 8.
    assert!(find_pattern(
        code,
        &[Some(0x08), Some(0), Some(0), Some(0), Some(0), None, Some(8)],
    ));
    assert!(find_pattern(
        code,
        &[Some(0x06), None, Some(0), Some(0), Some(0), Some(0), Some(8)],
    ));
}

#[test]
fn while_loops_compile_deterministically() {
    fn build() -> Program {
        let mut types = TypeStore::new();
        let i32_ty = types.push(TypeData::Basic(BasicType::I32));
        let bool_ty = types.push(TypeData::Basic(BasicType::Bool));
        let mut program = Program::new(types);
        let mut main = func("main", None, Vec::new());
        let i = main.locals.push(i32_ty);
        let int = |v: i64| expr(ExprKind::Literal(Literal::Int(v)), i32_ty);
        main.body.push(stmt(StmtKind::Let { pattern: Pattern::Name(i), init: int(0) }));
        main.body.push(stmt(StmtKind::While {
            cond: expr(
                ExprKind::Binary {
                    op: sable_codegen::sema::BinaryOp::Lt,
                    lhs: Box::new(expr(ExprKind::Local(i), i32_ty)),
                    rhs: Box::new(int(10)),
                },
                bool_ty,
            ),
            body: vec![stmt(StmtKind::Assign {
                target: LValue::Local(i),
                value: expr(
                    ExprKind::Binary {
                        op: sable_codegen::sema::BinaryOp::Add,
                        lhs: Box::new(expr(ExprKind::Local(i), i32_ty)),
                        rhs: Box::new(int(1)),
                    },
                    i32_ty,
                ),
            })],
        }));
        let main = program.funcs.push(main);
        program.main = Some(main);
        program
    }

    let first = compile(&build());
    let second = compile(&build());
    assert_eq!(first.bytes, second.bytes);
    assert_eq!(first.source_map, second.source_map);
    // The loop produced an inverted compare-and-jump over i32.
    assert!(first.code().contains(&0x85));
}

#[test]
fn class_templates_point_at_method_code() {
    let mut types = TypeStore::new();
    let method_id = FuncId::new(1);
    let class_ty = types.push(TypeData::Class(ClassType {
        id: 9,
        attributes: Vec::new(),
        methods: vec![Method { name: "poke".into(), uid: 7, func: method_id }],
        interfaces: Vec::new(),
    }));
    let unreachable = types.push(TypeData::Unreachable);
    let mut program = Program::new(types);
    let mut main = func("main", None, Vec::new());
    let c = main.locals.push(class_ty);
    main.body.push(stmt(StmtKind::Let {
        pattern: Pattern::Name(c),
        init: expr(ExprKind::NewClass, class_ty),
    }));
    main.body.push(stmt(StmtKind::Expr(expr(
        ExprKind::MethodCall {
            recv: Box::new(expr(ExprKind::Local(c), class_ty)),
            uid: 7,
            args: Vec::new(),
        },
        unreachable,
    ))));
    let main = program.funcs.push(main);
    let mut method = func("poke", None, Vec::new());
    method.kind = FuncKind::Method { uid: 7 };
    method.params.push(class_ty);
    let pushed = program.funcs.push(method);
    assert_eq!(pushed, method_id);
    program.main = Some(main);

    let image = compile(&program);
    let [_, _, templates, _, code] = segments(&image);
    // attr_count, method_count, attrs_size, class_id, then one method
    // entry: uid 7 plus the patched code offset.
    assert_eq!(&templates[..9], &[0, 1, 0, 0, 0, 9, 0, 0, 0]);
    assert_eq!(&templates[9..13], &7u32.to_le_bytes());
    let method_offset = u32::from_le_bytes(templates[13..17].try_into().unwrap()) as usize;
    // The method body starts with fn_ret and is prefixed by its 4-byte
    // interface-method UID for the dispatch cache.
    assert_eq!(code[method_offset], 0xb5);
    assert_eq!(&code[method_offset - 4..method_offset], &7u32.to_le_bytes());
    // Dispatch goes through c_loadm with the same UID.
    assert!(find_pattern(code, &[Some(0x1d), None, None, Some(7), Some(0), Some(0), Some(0)]));
}

#[test]
fn closures_and_coroutines_lower() {
    let mut types = TypeStore::new();
    let i64_ty = types.push(TypeData::Basic(BasicType::I64));
    let closure_ty = types.push(TypeData::Closure(Signature { params: Vec::new(), ret: None }));
    let coroutine_ty =
        types.push(TypeData::Coroutine(Signature { params: Vec::new(), ret: None }));
    let unreachable = types.push(TypeData::Unreachable);
    let mut program = Program::new(types);

    let closure_id = FuncId::new(1);
    let coroutine_id = FuncId::new(2);
    let mut main = func("main", None, Vec::new());
    let x = main.locals.push(i64_ty);
    let cl = main.locals.push(closure_ty);
    let co = main.locals.push(coroutine_ty);
    main.body.push(stmt(StmtKind::Let {
        pattern: Pattern::Name(x),
        init: expr(ExprKind::Literal(Literal::Int(3)), i64_ty),
    }));
    main.body.push(stmt(StmtKind::Let {
        pattern: Pattern::Name(cl),
        init: expr(
            ExprKind::ClosureLit { func: closure_id, captures: vec![Capture::Local(x)] },
            closure_ty,
        ),
    }));
    main.body.push(stmt(StmtKind::Expr(expr(
        ExprKind::Call {
            callee: Callee::Value(Box::new(expr(ExprKind::Local(cl), closure_ty))),
            args: Vec::new(),
        },
        unreachable,
    ))));
    main.body.push(stmt(StmtKind::Let {
        pattern: Pattern::Name(co),
        init: expr(
            ExprKind::NewCoroutine(CoroutineSource::Direct(coroutine_id)),
            coroutine_ty,
        ),
    }));
    main.body.push(stmt(StmtKind::Expr(expr(
        ExprKind::Call {
            callee: Callee::Value(Box::new(expr(ExprKind::Local(co), coroutine_ty))),
            args: Vec::new(),
        },
        unreachable,
    ))));
    let main = program.funcs.push(main);

    let mut closure = func("adder", None, Vec::new());
    closure.upvalues.push(i64_ty);
    let pushed = program.funcs.push(closure);
    assert_eq!(pushed, closure_id);

    let mut coroutine = func("ticker", None, vec![stmt(StmtKind::Yield(None))]);
    coroutine.kind = FuncKind::Coroutine;
    let pushed = program.funcs.push(coroutine);
    assert_eq!(pushed, coroutine_id);
    program.main = Some(main);

    let image = compile(&program);
    let code = image.code();
    for opcode in [
        0xc0, // closure_alloc
        0xc1, // closure_push_env
        0xc3, // closure_call
        0xc8, // coroutine_alloc
        0xcb, // coroutine_call
        0xcc, // coroutine_yield
        0xcd, // coroutine_ret
    ] {
        assert!(code.contains(&opcode), "missing opcode {opcode:#04x}");
    }
}

#[test]
fn source_map_lines_follow_instruction_positions() {
    let mut types = TypeStore::new();
    let i32_ty = types.push(TypeData::Basic(BasicType::I32));
    let mut program = Program::new(types);
    let mut main = func("main", None, Vec::new());
    let x = main.locals.push(i32_ty);
    main.body.push(Stmt {
        kind: StmtKind::Let {
            pattern: Pattern::Name(x),
            init: expr(ExprKind::Literal(Literal::Int(1)), i32_ty),
        },
        loc: Loc::new("main.sb", 2, 5),
    });
    let main = program.funcs.push(main);
    program.main = Some(main);

    let image = compile(&program);
    let lines: Vec<&str> = image.source_map.lines().collect();
    // Three prologue instructions with no source, then the literal load.
    assert_eq!(lines[..3], ["", "", ""]);
    assert!(lines[3].starts_with("main.sb,2,5,main"));
}
