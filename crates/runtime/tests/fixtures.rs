//! Fixture-driven end-to-end harness, in the discovery-runner style of a
//! batch test tool: a static table of named fixtures is iterated and
//! reported as one summary rather than expanded into one `#[test]` per
//! case. Each fixture builds the `Program` a parser would have produced
//! (no lexer/parser is wired into this crate), drives it through
//! [`Runtime::execute_program`], and checks the resulting pattern tree.

use std::collections::HashMap;
use std::rc::Rc;

use pattern_core::{Literal, PatternError};
use pattern_lang::ast::*;
use pattern_lang::PatternKind;
use pattern_runtime::{EvaluatorConfig, Runtime};

fn loc() -> SourceLocation {
    SourceLocation::new("<fixture>", 1)
}

fn ident(name: &str) -> Expr {
    Expr::Rvalue(RvalueRoot::Identifier(name.into()))
}

fn member(base: Expr, name: &str) -> Expr {
    Expr::Member { base: Box::new(base), name: name.into() }
}

fn index(base: Expr, i: u128) -> Expr {
    Expr::Index { base: Box::new(base), index: Box::new(Expr::Literal(Literal::U128(i))) }
}

fn eq(lhs: Expr, rhs: i128) -> Expr {
    Expr::Binary { op: BinaryOp::Eq, lhs: Box::new(lhs), rhs: Box::new(Expr::Literal(Literal::I128(rhs))) }
}

fn assert_item(cond: Expr, message: &str) -> Item {
    Item::Statement(Stmt::Expr(Expr::Call {
        name: "std::assert".into(),
        args: vec![cond, Expr::Literal(Literal::String(message.into()))],
    }))
}

fn byte_reader(bytes: Vec<u8>) -> impl Fn(u64, &mut [u8]) + Send + Sync + 'static {
    move |off, buf| {
        let off = off as usize;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = bytes.get(off + i).copied().unwrap_or(0);
        }
    }
}

/// One named byte/AST/expected-value fixture. `run` builds its own
/// `Runtime`, executes its own `Program`, and checks the result,
/// returning the failure message a mismatch would otherwise `panic!`
/// with.
struct Fixture {
    name: &'static str,
    run: fn() -> Result<(), String>,
}

macro_rules! check_eq {
    ($left:expr, $right:expr) => {{
        let (left, right) = (&$left, &$right);
        if left != right {
            return Err(format!("{} != {} ({left:?} vs {right:?})", stringify!($left), stringify!($right)));
        }
    }};
}

/// A bare `u32` read back out as the little-endian PNG magic.
fn png_header_reads_little_endian_u32() -> Result<(), String> {
    let mut rt = Runtime::new();
    rt.set_data_source(0, 8, byte_reader(vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]), None);

    let program = Program {
        items: vec![Item::Variable(VariableDecl {
            name: "x".into(),
            ty: TypedExpr { ty: TypeExpr::Builtin(BuiltinType::U32), endian: None },
            placement: Some(Placement { offset: Expr::Literal(Literal::U128(0)), section: None }),
            in_out: None,
            attributes: AttributeMap::new(),
            loc: loc(),
        })],
    };

    let ok = rt.execute_program(&program, HashMap::new(), HashMap::new(), true);
    if !ok {
        return Err(format!("{:?}", rt.get_error()));
    }
    let value = rt.get_patterns()[0].value(rt.io()).unwrap();
    check_eq!(value.as_u128(), Some(0x474E5089));
    Ok(())
}

/// An `Auto`/`Single`/`Range` enum read big-endian, whose raw value falls
/// into an auto-numbered entry immediately after an explicit one.
fn enum_auto_numbering_resumes_after_explicit_value() -> Result<(), String> {
    let mut rt = Runtime::new();
    let mut bytes = vec![0u8; 16];
    bytes[8..12].copy_from_slice(&[0x00, 0x00, 0x00, 0x0D]);
    rt.set_data_source(0, bytes.len() as u64, byte_reader(bytes), None);

    let enum_decl = EnumDecl {
        name: "E".into(),
        underlying: TypeExpr::Builtin(BuiltinType::U32),
        entries: vec![
            EnumEntry { name: "A".into(), value: EnumValue::Auto },
            EnumEntry { name: "B".into(), value: EnumValue::Single(Expr::Literal(Literal::U128(0x0C))) },
            EnumEntry { name: "C".into(), value: EnumValue::Auto },
            EnumEntry { name: "D".into(), value: EnumValue::Auto },
            EnumEntry {
                name: "E".into(),
                value: EnumValue::Range(Expr::Literal(Literal::U128(0xAA)), Expr::Literal(Literal::U128(0xBB))),
            },
        ],
        loc: loc(),
    };

    let var = VariableDecl {
        name: "v".into(),
        ty: TypedExpr { ty: TypeExpr::Named { name: "E".into(), args: vec![] }, endian: Some(Endian::Big) },
        placement: Some(Placement { offset: Expr::Literal(Literal::U128(8)), section: None }),
        in_out: None,
        attributes: AttributeMap::new(),
        loc: loc(),
    };

    let program = Program { items: vec![Item::Enum(enum_decl), Item::Variable(var)] };

    let ok = rt.execute_program(&program, HashMap::new(), HashMap::new(), true);
    if !ok {
        return Err(format!("{:?}", rt.get_error()));
    }
    let pattern = &rt.get_patterns()[0];
    check_eq!(pattern.value(rt.io()).unwrap().as_u128(), Some(13));
    check_eq!(pattern.formatted_value(rt.io()), "E::C (0x0000000D)");
    Ok(())
}

fn nested_bitfield_decl(name: &str) -> BitfieldDecl {
    BitfieldDecl {
        name: name.into(),
        fields: vec![
            BitfieldMember::Field { name: "nestedA".into(), sign: BitfieldFieldSign::Unsigned, bit_size: Expr::Literal(Literal::U128(4)), enum_type: None },
            BitfieldMember::Field { name: "nestedB".into(), sign: BitfieldFieldSign::Unsigned, bit_size: Expr::Literal(Literal::U128(4)), enum_type: None },
        ],
        attributes: AttributeMap::new(),
        loc: loc(),
    }
}

/// A big-endian bitfield with a nested bitfield member and a
/// nested-bitfield array, whose members span byte boundaries. `f`'s
/// element count is given as a literal rather than a sibling field
/// reference, since this fixture builds the AST directly rather than
/// through a resolver that could see `c`'s already-evaluated value while
/// still laying out `f`.
fn nested_bitfield_spans_byte_boundaries_big_endian() -> Result<(), String> {
    let mut rt = Runtime::with_config(pattern_runtime::builtins::with_minimal_std(EvaluatorConfig::new()));
    let mut bytes = vec![0u8; 0x30];
    bytes[0x25..0x2A].copy_from_slice(&[0x49, 0x44, 0x41, 0x54, 0x78]);
    rt.set_data_source(0, bytes.len() as u64, byte_reader(bytes), None);

    let test_bitfield = BitfieldDecl {
        name: "TestBitfield".into(),
        fields: vec![
            BitfieldMember::Field { name: "a".into(), sign: BitfieldFieldSign::Unsigned, bit_size: Expr::Literal(Literal::U128(2)), enum_type: None },
            BitfieldMember::Field { name: "b".into(), sign: BitfieldFieldSign::Unsigned, bit_size: Expr::Literal(Literal::U128(3)), enum_type: None },
            BitfieldMember::Nested(nested_bitfield_decl("c")),
            BitfieldMember::Field { name: "d".into(), sign: BitfieldFieldSign::Unsigned, bit_size: Expr::Literal(Literal::U128(4)), enum_type: None },
            BitfieldMember::Field { name: "e".into(), sign: BitfieldFieldSign::Signed, bit_size: Expr::Literal(Literal::U128(4)), enum_type: None },
            BitfieldMember::NestedArray { name: "f".into(), element: nested_bitfield_decl("NestedBitfield"), count: Expr::Literal(Literal::U128(2)) },
        ],
        attributes: AttributeMap::new(),
        loc: loc(),
    };

    let var = VariableDecl {
        name: "testBitfield".into(),
        ty: TypedExpr { ty: TypeExpr::Named { name: "TestBitfield".into(), args: vec![] }, endian: Some(Endian::Big) },
        placement: Some(Placement { offset: Expr::Literal(Literal::U128(0x25)), section: None }),
        in_out: None,
        attributes: AttributeMap::new(),
        loc: loc(),
    };

    let program = Program {
        items: vec![
            Item::Bitfield(test_bitfield),
            Item::Variable(var),
            assert_item(eq(member(ident("testBitfield"), "a"), 1), "Field A invalid"),
            assert_item(eq(member(ident("testBitfield"), "b"), 1), "Field B invalid"),
            assert_item(eq(member(member(ident("testBitfield"), "c"), "nestedA"), 2), "Nested field A invalid"),
            assert_item(eq(member(member(ident("testBitfield"), "c"), "nestedB"), 8), "Nested field B invalid"),
            assert_item(eq(member(ident("testBitfield"), "d"), 8), "Field D invalid"),
            assert_item(eq(member(ident("testBitfield"), "e"), -8), "Field E invalid"),
            assert_item(eq(member(index(member(ident("testBitfield"), "f"), 0), "nestedA"), 2), "Nested array[0] field A invalid"),
            assert_item(eq(member(index(member(ident("testBitfield"), "f"), 0), "nestedB"), 10), "Nested array[0] field B invalid"),
            assert_item(eq(member(index(member(ident("testBitfield"), "f"), 1), "nestedA"), 8), "Nested array[1] field A invalid"),
            assert_item(eq(member(index(member(ident("testBitfield"), "f"), 1), "nestedB"), 15), "Nested array[1] field B invalid"),
        ],
    };

    let ok = rt.execute_program(&program, HashMap::new(), HashMap::new(), true);
    if !ok {
        return Err(format!("{:?}", rt.get_error()));
    }
    Ok(())
}

/// `[[pointer_base("Rel")]]` rebases the pointee's offset through a
/// host-registered function, independent of the raw pointer value read
/// from the underlying `s8`.
fn pointer_base_rebases_pointee_offset() -> Result<(), String> {
    let config = EvaluatorConfig::new().with_pointer_base("Rel", Rc::new(|_raw: i128| Ok(0x1D_i128)));
    let mut rt = Runtime::with_config(config);
    let mut bytes = vec![0u8; 0x40];
    bytes[0x1D] = 0x05;
    rt.set_data_source(0, bytes.len() as u64, byte_reader(bytes), None);

    let mut attributes = AttributeMap::new();
    attributes.insert("pointer_base".into(), vec![Literal::String("Rel".into())]);

    let program = Program {
        items: vec![Item::PointerVariable(PointerVariableDecl {
            name: "p".into(),
            pointee_ty: TypedExpr { ty: TypeExpr::Builtin(BuiltinType::U32), endian: None },
            underlying_ty: TypeExpr::Builtin(BuiltinType::S8),
            placement: Some(Placement { offset: Expr::Literal(Literal::U128(0x1D)), section: None }),
            attributes,
            loc: loc(),
        })],
    };

    let ok = rt.execute_program(&program, HashMap::new(), HashMap::new(), true);
    if !ok {
        return Err(format!("{:?}", rt.get_error()));
    }
    match &rt.get_patterns()[0].kind {
        PatternKind::Pointer { pointee, .. } => check_eq!(pointee.header.offset, 0x1D),
        other => return Err(format!("expected a pointer pattern, got {other:?}")),
    }
    Ok(())
}

/// `[[fixed_size]]` pads a struct's footprint and the top-level cursor
/// lands exactly at the padded end, not the struct's natural size.
fn fixed_size_struct_advances_cursor_past_padding() -> Result<(), String> {
    let mut rt = Runtime::new();
    rt.set_data_source(0, 0x60, byte_reader(vec![0u8; 0x60]), None);

    let mut struct_attributes = AttributeMap::new();
    struct_attributes.insert("fixed_size".into(), vec![Literal::U128(4)]);

    let struct_decl = StructDecl {
        name: "S".into(),
        template_params: vec![],
        members: vec![StructMember::Variable(VariableDecl {
            name: "x".into(),
            ty: TypedExpr { ty: TypeExpr::Builtin(BuiltinType::U8), endian: None },
            placement: None,
            in_out: None,
            attributes: AttributeMap::new(),
            loc: loc(),
        })],
        attributes: struct_attributes,
        loc: loc(),
    };

    let var = VariableDecl {
        name: "s".into(),
        ty: TypedExpr { ty: TypeExpr::Named { name: "S".into(), args: vec![] }, endian: None },
        placement: Some(Placement { offset: Expr::Literal(Literal::U128(0x50)), section: None }),
        in_out: None,
        attributes: AttributeMap::new(),
        loc: loc(),
    };

    let program = Program { items: vec![Item::Struct(struct_decl), Item::Variable(var)] };

    let ok = rt.execute_program(&program, HashMap::new(), HashMap::new(), true);
    if !ok {
        return Err(format!("{:?}", rt.get_error()));
    }
    check_eq!(rt.get_patterns()[0].header.size, 4);
    check_eq!(rt.io().cursor().byte, 0x54);
    Ok(())
}

/// A failing `std::assert` reports a nonzero/error result and logs its
/// message, rather than panicking the evaluator.
fn failing_assert_surfaces_as_an_error_not_a_panic() -> Result<(), String> {
    let mut rt = Runtime::with_config(pattern_runtime::builtins::with_minimal_std(EvaluatorConfig::new()));
    let program = Program {
        items: vec![assert_item(Expr::Literal(Literal::Bool(false)), "always false")],
    };

    let ok = rt.execute_program(&program, HashMap::new(), HashMap::new(), true);
    if ok {
        return Err("expected execute_program to report failure".into());
    }
    let err: &PatternError = rt.get_error().ok_or("a failing assert must record an error")?;
    check_eq!(err.code, "E_ASSERT");
    if !rt.get_console_log().iter().any(|(_, msg)| msg == "always false") {
        return Err("console log missing the assert message".into());
    }
    Ok(())
}

const FIXTURES: &[Fixture] = &[
    Fixture { name: "png_header_reads_little_endian_u32", run: png_header_reads_little_endian_u32 },
    Fixture { name: "enum_auto_numbering_resumes_after_explicit_value", run: enum_auto_numbering_resumes_after_explicit_value },
    Fixture { name: "nested_bitfield_spans_byte_boundaries_big_endian", run: nested_bitfield_spans_byte_boundaries_big_endian },
    Fixture { name: "pointer_base_rebases_pointee_offset", run: pointer_base_rebases_pointee_offset },
    Fixture { name: "fixed_size_struct_advances_cursor_past_padding", run: fixed_size_struct_advances_cursor_past_padding },
    Fixture { name: "failing_assert_surfaces_as_an_error_not_a_panic", run: failing_assert_surfaces_as_an_error_not_a_panic },
];

struct FixtureOutcome {
    name: &'static str,
    error: Option<String>,
}

fn run_fixtures() -> Vec<FixtureOutcome> {
    FIXTURES
        .iter()
        .map(|f| FixtureOutcome { name: f.name, error: (f.run)().err() })
        .collect()
}

fn print_results(results: &[FixtureOutcome]) {
    for r in results {
        println!("  {} ... {}", r.name, if r.error.is_none() { "ok" } else { "FAILED" });
    }
    let failed: Vec<&FixtureOutcome> = results.iter().filter(|r| r.error.is_some()).collect();
    println!("\nResults: {} passed, {} failed", results.len() - failed.len(), failed.len());
    if !failed.is_empty() {
        println!("\nFAILURES:\n");
        for r in &failed {
            println!("{}", r.name);
            if let Some(e) = &r.error {
                println!("  {e}");
            }
        }
    }
}

#[test]
fn all_fixtures_pass() {
    let results = run_fixtures();
    print_results(&results);
    let failed: Vec<&str> = results.iter().filter(|r| r.error.is_some()).map(|r| r.name).collect();
    assert!(failed.is_empty(), "failed fixtures: {failed:?}");
}
