//! Tree-walking dispatch: `create_patterns` / `evaluate`
//! / `execute` as free functions over [`pattern_lang::ast`] types, kept
//! out of the `pattern-lang` crate so the AST stays pure data (see that
//! crate's module doc).

use pattern_core::io::ReadCursor;
use pattern_core::section::{HEAP, MAIN};
use pattern_core::{Literal, PatternError, SectionId};
use pattern_lang::ast::*;
use pattern_lang::{
    AttributeEffects, AttributeHost, BitfieldFieldSign as PatSign, EnumEntry as PatEnumEntry, FormatterFn, LeafKind, Pattern,
    PatternHeader, PatternKind, PointerBaseFn, TransformFn,
};

use crate::control::ControlFlow;
use crate::evaluator::Evaluator;

type CoreEndian = pattern_core::Endian;

fn to_core_endian(e: Endian) -> CoreEndian {
    match e {
        Endian::Little => CoreEndian::Little,
        Endian::Big => CoreEndian::Big,
    }
}

fn leaf_kind_of(ty: BuiltinType) -> Result<LeafKind, PatternError> {
    use BuiltinType::*;
    Ok(match ty {
        U8 | U16 | U24 | U32 | U48 | U64 | U96 | U128 => LeafKind::Unsigned,
        S8 | S16 | S24 | S32 | S48 | S64 | S96 | S128 => LeafKind::Signed,
        Float => LeafKind::Float32,
        Double => LeafKind::Float64,
        Bool => LeafKind::Boolean,
        Char => LeafKind::Character,
        Char16 => LeafKind::Character16,
        Str => LeafKind::Str,
        Padding => LeafKind::Padding,
        Auto => return Err(PatternError::eval("E_AUTO_UNRESOLVED", "'auto' requires an initializer to resolve its type")),
    })
}

// ============================================================================
//                          ATTRIBUTE-HOST WIRING
// ============================================================================

/// Resolves `[[format]]`/`[[transform]]`/`[[pointer_base]]` function names
/// against the host-registered closures on [`crate::config::EvaluatorConfig`]
/// — the evaluator is the seam the attribute engine
/// calls back through, per that crate's module doc.
struct EvaluatorAttributeHost<'a> {
    config: &'a crate::config::EvaluatorConfig,
}

impl AttributeHost for EvaluatorAttributeHost<'_> {
    fn resolve_formatter(&self, name: &str) -> Result<FormatterFn, PatternError> {
        self.config
            .formatters
            .get(name)
            .cloned()
            .ok_or_else(|| PatternError::eval("E_UNKNOWN_FORMATTER", format!("no formatter function named '{name}'")))
    }

    fn resolve_transform(&self, name: &str) -> Result<TransformFn, PatternError> {
        self.config
            .transforms
            .get(name)
            .cloned()
            .ok_or_else(|| PatternError::eval("E_UNKNOWN_TRANSFORM", format!("no transform function named '{name}'")))
    }

    fn resolve_pointer_base(&self, name: &str) -> Result<PointerBaseFn, PatternError> {
        self.config
            .pointer_bases
            .get(name)
            .cloned()
            .ok_or_else(|| PatternError::eval("E_UNKNOWN_POINTER_BASE", format!("no pointer_base function named '{name}'")))
    }
}

fn apply_cursor_delta(ev: &mut Evaluator, effects: AttributeEffects) {
    if effects.cursor_delta_bytes != 0 {
        let cursor = ev.io.cursor();
        let byte = (cursor.byte as i64 + effects.cursor_delta_bytes).max(0) as u64;
        ev.io.set_cursor(ReadCursor::new(byte));
    }
}

/// Apply a type's own attributes.
fn apply_as_type(ev: &mut Evaluator, pattern: &mut Pattern, attrs: &AttributeMap) -> Result<(), PatternError> {
    if attrs.is_empty() {
        return Ok(());
    }
    let host = EvaluatorAttributeHost { config: &ev.config };
    let effects = pattern_lang::attribute::apply_type_attributes(pattern, attrs, &host, &ev.io)?;
    apply_cursor_delta(ev, effects);
    Ok(())
}

/// Apply the attributes attached at a variable's placement site, after the
/// type's own attributes have already run.
fn apply_as_variable(ev: &mut Evaluator, pattern: &mut Pattern, attrs: &AttributeMap) -> Result<(), PatternError> {
    if attrs.is_empty() {
        return Ok(());
    }
    let host = EvaluatorAttributeHost { config: &ev.config };
    let effects = pattern_lang::attribute::apply_variable_attributes(pattern, attrs, &host, &ev.io)?;
    apply_cursor_delta(ev, effects);
    Ok(())
}

// ============================================================================
//                                EXPRESSIONS
// ============================================================================

pub fn evaluate(ev: &mut Evaluator, expr: &Expr) -> Result<Literal, PatternError> {
    match expr {
        Expr::Literal(l) => Ok(l.clone()),
        Expr::Rvalue(root) => evaluate_rvalue(ev, root),
        Expr::Unary { op, expr } => {
            let v = evaluate(ev, expr)?;
            Ok(match op {
                UnaryOp::Neg => match v {
                    Literal::Double(d) => Literal::Double(-d),
                    _ => Literal::I128(-v.as_i128().unwrap_or(0)),
                },
                UnaryOp::Not => Literal::Bool(!v.as_bool()),
                UnaryOp::BitNot => Literal::I128(!v.as_i128().unwrap_or(0)),
            })
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = evaluate(ev, lhs)?;
            let r = evaluate(ev, rhs)?;
            evaluate_binary(*op, &l, &r)
        }
        Expr::Logical { op, lhs, rhs } => {
            let l = evaluate(ev, lhs)?.as_bool();
            match op {
                LogicalOp::And => {
                    if !l {
                        return Ok(Literal::Bool(false));
                    }
                    Ok(Literal::Bool(evaluate(ev, rhs)?.as_bool()))
                }
                LogicalOp::Or => {
                    if l {
                        return Ok(Literal::Bool(true));
                    }
                    Ok(Literal::Bool(evaluate(ev, rhs)?.as_bool()))
                }
            }
        }
        Expr::Ternary { cond, then_expr, else_expr } => {
            if evaluate(ev, cond)?.as_bool() {
                evaluate(ev, then_expr)
            } else {
                evaluate(ev, else_expr)
            }
        }
        Expr::Cast { expr, ty } => {
            let v = evaluate(ev, expr)?;
            cast_literal(&v, *ty)
        }
        Expr::Call { name, args } => evaluate_call(ev, name, args),
        Expr::Index { base, index } => {
            if let Expr::Rvalue(RvalueRoot::Identifier(name)) = base.as_ref() {
                if ev.current_scope().parameter_pack.as_ref().is_some_and(|pack| pack.name == *name) {
                    let idx = evaluate(ev, index)?.as_u128().unwrap_or(0) as usize;
                    return ev
                        .current_scope()
                        .parameter_pack
                        .as_ref()
                        .and_then(|pack| pack.get(idx))
                        .cloned()
                        .ok_or_else(|| PatternError::eval("E_OUT_OF_BOUNDS", format!("parameter pack index {idx} out of bounds")));
                }
            }
            let pattern = resolve_path(ev, expr)?;
            pattern.value(&ev.io)
        }
        Expr::Member { .. } => {
            let pattern = resolve_path(ev, expr)?;
            pattern.value(&ev.io)
        }
        Expr::ScopeResolution { base, member } => evaluate_scope_resolution(ev, base, member),
        Expr::SizeOf(ty) => {
            let bytes = type_size_hint(ev, ty)?;
            Ok(Literal::U128(bytes as u128))
        }
        Expr::AddressOf(expr) => {
            let pattern = resolve_path(ev, expr)?;
            Ok(Literal::U128(pattern.header.offset as u128))
        }
    }
}

fn evaluate_rvalue(ev: &Evaluator, root: &RvalueRoot) -> Result<Literal, PatternError> {
    match root {
        RvalueRoot::CurrentOffset => Ok(Literal::U128(ev.io.cursor().byte as u128)),
        RvalueRoot::Null => Ok(Literal::U128(0)),
        RvalueRoot::This => match current_container(ev) {
            Some(p) => p.value(&ev.io),
            None => Ok(Literal::U128(0)),
        },
        RvalueRoot::Parent => match ev.current_scope().patterns.iter().rev().nth(1) {
            Some(p) => p.value(&ev.io),
            None => Ok(Literal::U128(0)),
        },
        RvalueRoot::Identifier(name) => {
            if let Some(p) = ev.resolve_template_param(name) {
                return p.value(&ev.io);
            }
            if let Some(p) = ev.resolve_local(name) {
                return p.value(&ev.io);
            }
            if let Some(p) = ev.current_scope().patterns.iter().rev().find(|p| p.header.var_name.as_deref() == Some(name.as_str())) {
                return p.value(&ev.io);
            }
            if let Some(v) = ev.in_vars.get(name).or_else(|| ev.env_vars.get(name)) {
                return Ok(v.clone());
            }
            Err(PatternError::eval("E_UNKNOWN_IDENT", format!("'{name}' is not defined")))
        }
    }
}

fn current_container(ev: &Evaluator) -> Option<&Pattern> {
    ev.current_scope().patterns.last()
}

fn evaluate_binary(op: BinaryOp, l: &Literal, r: &Literal) -> Result<Literal, PatternError> {
    use BinaryOp::*;
    if matches!(op, Eq | Ne | Lt | Le | Gt | Ge) {
        let ord = l.partial_cmp(r);
        return Ok(Literal::Bool(match (op, ord) {
            (Eq, Some(std::cmp::Ordering::Equal)) => true,
            (Ne, o) => o != Some(std::cmp::Ordering::Equal),
            (Lt, Some(std::cmp::Ordering::Less)) => true,
            (Le, Some(o)) => o != std::cmp::Ordering::Greater,
            (Gt, Some(std::cmp::Ordering::Greater)) => true,
            (Ge, Some(o)) => o != std::cmp::Ordering::Less,
            _ => false,
        }));
    }
    if matches!(l, Literal::Double(_)) || matches!(r, Literal::Double(_)) {
        let a = l.as_f64().unwrap_or(0.0);
        let b = r.as_f64().unwrap_or(0.0);
        return Ok(Literal::Double(match op {
            Add => a + b,
            Sub => a - b,
            Mul => a * b,
            Div => a / b,
            Mod => a % b,
            _ => return Err(PatternError::eval("E_BAD_OPERAND", "bitwise operator on a floating-point operand")),
        }));
    }
    let a = l.as_i128().unwrap_or(0);
    let b = r.as_i128().unwrap_or(0);
    Ok(Literal::I128(match op {
        Add => a.wrapping_add(b),
        Sub => a.wrapping_sub(b),
        Mul => a.wrapping_mul(b),
        Div => {
            if b == 0 {
                return Err(PatternError::eval("E_DIV_ZERO", "division by zero"));
            }
            a.wrapping_div(b)
        }
        Mod => {
            if b == 0 {
                return Err(PatternError::eval("E_DIV_ZERO", "modulo by zero"));
            }
            a.wrapping_rem(b)
        }
        Shl => a.wrapping_shl(b as u32),
        Shr => a.wrapping_shr(b as u32),
        BitAnd => a & b,
        BitOr => a | b,
        BitXor => a ^ b,
        Eq | Ne | Lt | Le | Gt | Ge => unreachable!("handled above"),
    }))
}

fn cast_literal(v: &Literal, ty: BuiltinType) -> Result<Literal, PatternError> {
    if ty == BuiltinType::Bool {
        return Ok(Literal::Bool(v.as_bool()));
    }
    if ty == BuiltinType::Double || ty == BuiltinType::Float {
        return Ok(Literal::Double(v.as_f64().unwrap_or(0.0)));
    }
    if ty == BuiltinType::Str {
        return Ok(Literal::String(v.to_string()));
    }
    let bits = ty.bit_width().unwrap_or(128);
    if ty.is_signed() {
        Ok(Literal::I128(v.cast_signed(bits).unwrap_or(0)))
    } else {
        Ok(Literal::U128(v.truncate_to_bits(bits).unwrap_or(0)))
    }
}

pub(crate) fn evaluate_call(ev: &mut Evaluator, name: &str, arg_exprs: &[Expr]) -> Result<Literal, PatternError> {
    let mut args = Vec::with_capacity(arg_exprs.len());
    for a in arg_exprs {
        args.push(evaluate(ev, a)?);
    }
    if let Some(def) = ev.user_functions.get(name).cloned() {
        return call_user_function(ev, &def, args, arg_exprs.len());
    }
    let (namespace, fname) = name.rsplit_once("::").unwrap_or(("", name));
    let function = ev
        .lookup_function(namespace, fname)
        .cloned()
        .ok_or_else(|| PatternError::eval("E_UNKNOWN_FUNCTION", format!("unknown function '{name}'")))?;
    if !function.arity.accepts(args.len()) {
        return Err(PatternError::eval("E_ARITY", format!("'{name}' called with {} arguments", args.len())));
    }
    if function.dangerous && !ev.permits_dangerous_call(&function.qualified_name()) {
        return Err(PatternError::eval("E_DANGEROUS_DENIED", format!("call to dangerous function '{name}' was denied")));
    }
    match (function.callback)(ev, &args)? {
        Some(v) => Ok(v),
        None => Ok(Literal::Bool(true)),
    }
}

/// Call a user-defined `FunctionDefinition`. Each parameter
/// is materialized as a heap-backed local of its declared type, default
/// expressions are evaluated lazily in the callee's own scope (so a later
/// default can see an earlier bound parameter), and any trailing `auto
/// ...pack` args are captured by name on the scope.
fn call_user_function(ev: &mut Evaluator, def: &FunctionDefinition, args: Vec<Literal>, passed: usize) -> Result<Literal, PatternError> {
    let required = def.params.iter().take_while(|p| p.default.is_none()).count();
    if passed < required || (def.pack.is_none() && passed > def.params.len()) {
        return Err(PatternError::eval("E_ARITY", format!("'{}' called with {passed} arguments", def.name)));
    }
    ev.push_scope()?;
    let result = call_user_function_body(ev, def, args);
    ev.pop_scope();
    result
}

fn call_user_function_body(ev: &mut Evaluator, def: &FunctionDefinition, args: Vec<Literal>) -> Result<Literal, PatternError> {
    for (i, param) in def.params.iter().enumerate() {
        let value = match args.get(i) {
            Some(v) => v.clone(),
            None => match &param.default {
                Some(expr) => evaluate(ev, expr)?,
                None => return Err(PatternError::eval("E_ARITY", format!("missing argument '{}'", param.name))),
            },
        };
        let offset = ev.io.sections_mut().heap_push(&[]);
        let pattern = materialize_type(ev, &param.ty, None, HEAP, offset, Some(param.name.clone()))?;
        pattern.set_value(&mut ev.io, value)?;
        ev.current_scope_mut().declare_local(param.name.clone(), pattern)?;
    }
    if let Some(pack_name) = &def.pack {
        let extra = args.get(def.params.len()..).map(<[Literal]>::to_vec).unwrap_or_default();
        ev.current_scope_mut().parameter_pack = Some(crate::scope::ParameterPack { name: pack_name.clone(), values: extra });
    }
    match execute_block(ev, &def.body)? {
        Some(ControlFlow::Return(value)) => Ok(value.unwrap_or(Literal::Bool(true))),
        _ => Ok(Literal::Bool(true)),
    }
}

fn evaluate_scope_resolution(ev: &Evaluator, base: &str, member: &str) -> Result<Literal, PatternError> {
    let decl = ev
        .enum_decls
        .get(base)
        .ok_or_else(|| PatternError::eval("E_UNKNOWN_TYPE", format!("'{base}' is not a known enum")))?;
    let entries = build_enum_entries(decl)?;
    let value = entries
        .iter()
        .find(|e| e.name == member)
        .ok_or_else(|| PatternError::eval("E_UNKNOWN_VARIANT", format!("'{base}' has no variant '{member}'")))?;
    Ok(Literal::I128(value.min))
}

fn type_size_hint(ev: &Evaluator, ty: &TypeExpr) -> Result<u64, PatternError> {
    match ty {
        TypeExpr::Builtin(b) => b
            .bit_width()
            .map(|w| w.div_ceil(8) as u64)
            .ok_or_else(|| PatternError::eval("E_SIZE_UNKNOWN", "this type has no fixed size")),
        TypeExpr::Pointer { underlying, .. } => type_size_hint(ev, underlying),
        TypeExpr::Array { .. } => Err(PatternError::eval("E_SIZE_UNKNOWN", "sizeof on an unsized array is not supported")),
        TypeExpr::Named { name, .. } => {
            if let Some(d) = ev.struct_decls.get(name) {
                return Ok(struct_size_hint(ev, d));
            }
            if let Some(d) = ev.enum_decls.get(name) {
                return type_size_hint(ev, &d.underlying);
            }
            Err(PatternError::eval("E_UNKNOWN_TYPE", format!("'{name}' is not a known type")))
        }
    }
}

fn struct_size_hint(ev: &Evaluator, decl: &StructDecl) -> u64 {
    decl.members
        .iter()
        .map(|m| match m {
            StructMember::Variable(v) => type_size_hint(ev, &v.ty.ty).unwrap_or(0),
            _ => 0,
        })
        .sum()
}

// ============================================================================
//                           PATTERN PATH RESOLUTION
// ============================================================================

fn resolve_path(ev: &mut Evaluator, expr: &Expr) -> Result<Pattern, PatternError> {
    match expr {
        Expr::Rvalue(RvalueRoot::Identifier(name)) => ev
            .resolve_local(name)
            .or_else(|| ev.current_scope().patterns.iter().rev().find(|p| p.header.var_name.as_deref() == Some(name.as_str())))
            .cloned()
            .ok_or_else(|| PatternError::eval("E_UNKNOWN_IDENT", format!("'{name}' is not defined"))),
        Expr::Rvalue(RvalueRoot::This) => {
            current_container(ev).cloned().ok_or_else(|| PatternError::eval("E_NO_CONTAINER", "'this' used outside a pattern context"))
        }
        Expr::Member { base, name } => {
            let base_pattern = resolve_path(ev, base)?;
            base_pattern
                .children()
                .iter()
                .find(|c| c.header.var_name.as_deref() == Some(name.as_str()))
                .cloned()
                .ok_or_else(|| PatternError::eval("E_NO_MEMBER", format!("'{}' has no member '{name}'", base_pattern.display_name())))
        }
        Expr::Index { base, index } => {
            let base_pattern = resolve_path(ev, base)?;
            let idx = evaluate(ev, index)?.as_u128().unwrap_or(0) as u64;
            index_pattern(&base_pattern, idx)
        }
        other => Err(PatternError::eval("E_NOT_A_PATH", format!("{other:?} does not resolve to a pattern"))),
    }
}

fn index_pattern(base: &Pattern, idx: u64) -> Result<Pattern, PatternError> {
    match &base.kind {
        PatternKind::StaticArray { template, count, .. } => {
            if idx >= *count {
                return Err(PatternError::eval("E_OUT_OF_BOUNDS", format!("index {idx} out of bounds for array of length {count}")));
            }
            let mut entry = (**template).clone();
            entry.set_offset(base.header.offset + idx * template.header.size);
            entry.header.var_name = Some(format!("[{idx}]"));
            Ok(entry)
        }
        PatternKind::DynamicArray { children } => children
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| PatternError::eval("E_OUT_OF_BOUNDS", format!("index {idx} out of bounds"))),
        PatternKind::BitfieldArray { template, count } => {
            if idx >= *count {
                return Err(PatternError::eval("E_OUT_OF_BOUNDS", format!("index {idx} out of bounds for bitfield array of length {count}")));
            }
            let mut entry = (**template).clone();
            let bit_size = bitfield_pattern_bit_size(&entry);
            shift_bitfield_offset(&mut entry, idx * bit_size);
            entry.header.var_name = Some(format!("[{idx}]"));
            Ok(entry)
        }
        _ => Err(PatternError::eval("E_NOT_INDEXABLE", format!("'{}' is not an array", base.display_name()))),
    }
}

fn bitfield_pattern_bit_size(p: &Pattern) -> u64 {
    match &p.kind {
        PatternKind::BitfieldField { bit_size, .. } => *bit_size,
        PatternKind::Bitfield { total_bit_size, .. } => *total_bit_size,
        _ => 0,
    }
}

/// Shift a cloned bitfield-array template by `bit_delta` bits, carrying any
/// byte overflow into `header.offset`.
fn shift_bitfield_offset(p: &mut Pattern, bit_delta: u64) {
    let byte_delta = bit_delta / 8;
    let bit_delta_rem = (bit_delta % 8) as u8;
    match &mut p.kind {
        PatternKind::BitfieldField { bit_offset, .. } => {
            let total = *bit_offset as u64 + bit_delta_rem as u64;
            p.header.offset += byte_delta + total / 8;
            *bit_offset = (total % 8) as u8;
        }
        PatternKind::Bitfield { first_bit_offset, children, .. } => {
            let total = *first_bit_offset as u64 + bit_delta_rem as u64;
            let extra_bytes = total / 8;
            *first_bit_offset = (total % 8) as u8;
            p.header.offset += byte_delta + extra_bytes;
            for child in children {
                shift_bitfield_offset(child, bit_delta);
            }
        }
        _ => {}
    }
}

// ============================================================================
//                                STATEMENTS
// ============================================================================

pub fn execute(ev: &mut Evaluator, stmt: &Stmt) -> Result<Option<ControlFlow>, PatternError> {
    match stmt {
        Stmt::Expr(e) => {
            evaluate(ev, e)?;
            Ok(None)
        }
        Stmt::VariableDecl(decl) => {
            let pattern = create_local_variable(ev, decl)?;
            if decl.name != "_" {
                ev.current_scope_mut().declare_local(decl.name.clone(), pattern)?;
            }
            Ok(None)
        }
        Stmt::ArrayVariableDecl(decl) => {
            let pattern = create_local_array(ev, decl)?;
            ev.current_scope_mut().declare_local(decl.name.clone(), pattern)?;
            Ok(None)
        }
        Stmt::Assign { target, value } => {
            let literal = evaluate(ev, value)?;
            assign_to(ev, target, literal)?;
            Ok(None)
        }
        Stmt::Conditional { cond, then_branch, else_branch } => {
            let branch = if evaluate(ev, cond)?.as_bool() { then_branch } else { else_branch };
            execute_block(ev, branch)
        }
        Stmt::While { cond, body } => {
            let mut iterations: u64 = 0;
            while evaluate(ev, cond)?.as_bool() {
                let line = ev.current_line;
                ev.update_runtime(line)?;
                iterations += 1;
                if iterations > ev.config.max_loop_iterations {
                    return Err(PatternError::eval("E_LOOP_LIMIT", "loop iteration limit exceeded"));
                }
                match execute_block(ev, body)? {
                    Some(ControlFlow::Break) => break,
                    Some(ControlFlow::Continue) | None => {}
                    signal @ Some(ControlFlow::Return(_)) => return Ok(signal),
                }
            }
            Ok(None)
        }
        Stmt::For { init, cond, post, body } => {
            ev.push_scope()?;
            let result = (|| -> Result<Option<ControlFlow>, PatternError> {
                execute(ev, init)?;
                let mut iterations: u64 = 0;
                while evaluate(ev, cond)?.as_bool() {
                    iterations += 1;
                    if iterations > ev.config.max_loop_iterations {
                        return Err(PatternError::eval("E_LOOP_LIMIT", "loop iteration limit exceeded"));
                    }
                    match execute_block(ev, body)? {
                        Some(ControlFlow::Break) => break,
                        Some(ControlFlow::Continue) | None => {}
                        signal @ Some(ControlFlow::Return(_)) => return Ok(signal),
                    }
                    execute(ev, post)?;
                }
                Ok(None)
            })();
            ev.pop_scope();
            result
        }
        Stmt::Match { scrutinees, arms } => {
            let values: Vec<Literal> = scrutinees.iter().map(|e| evaluate(ev, e)).collect::<Result<_, _>>()?;
            for arm in arms {
                if match_arm(ev, &values, arm)? {
                    return execute_block(ev, &arm.body);
                }
            }
            Ok(None)
        }
        Stmt::TryCatch { try_body, catch_body } => match execute_block(ev, try_body) {
            Ok(signal) => Ok(signal),
            Err(e) if e.kind != pattern_core::error::ErrorKind::Eval || e.code == "E_ABORTED" => Err(e),
            Err(_) => execute_block(ev, catch_body),
        },
        Stmt::Break => Ok(Some(ControlFlow::Break)),
        Stmt::Continue => Ok(Some(ControlFlow::Continue)),
        Stmt::Return(expr) => {
            let value = expr.as_ref().map(|e| evaluate(ev, e)).transpose()?;
            Ok(Some(ControlFlow::Return(value)))
        }
        Stmt::Compound(stmts) => execute_block(ev, stmts),
    }
}

fn execute_block(ev: &mut Evaluator, stmts: &[Stmt]) -> Result<Option<ControlFlow>, PatternError> {
    for stmt in stmts {
        if let Some(signal) = execute(ev, stmt)? {
            return Ok(Some(signal));
        }
    }
    Ok(None)
}

fn match_arm(ev: &mut Evaluator, values: &[Literal], arm: &MatchArm) -> Result<bool, PatternError> {
    if arm.patterns.len() != values.len() {
        return Ok(false);
    }
    for (pattern, value) in arm.patterns.iter().zip(values) {
        let matches = match pattern {
            MatchPattern::Any => true,
            MatchPattern::Value(e) => evaluate(ev, e)?.partial_cmp(value) == Some(std::cmp::Ordering::Equal),
            MatchPattern::Range(lo, hi) => {
                let lo = evaluate(ev, lo)?;
                let hi = evaluate(ev, hi)?;
                value.partial_cmp(&lo) != Some(std::cmp::Ordering::Less) && value.partial_cmp(&hi) != Some(std::cmp::Ordering::Greater)
            }
            MatchPattern::Alternation(options) => {
                let mut any = false;
                for o in options {
                    if evaluate(ev, o)?.partial_cmp(value) == Some(std::cmp::Ordering::Equal) {
                        any = true;
                        break;
                    }
                }
                any
            }
        };
        if !matches {
            return Ok(false);
        }
    }
    Ok(true)
}

fn assign_to(ev: &mut Evaluator, target: &LValueTarget, value: Literal) -> Result<(), PatternError> {
    match target {
        LValueTarget::CurrentOffset => {
            let offset = value.as_u128().unwrap_or(0) as u64;
            ev.io.set_cursor(ReadCursor::new(offset));
            Ok(())
        }
        LValueTarget::Name(name) => {
            let Evaluator { io, scopes, .. } = ev;
            let pattern = scopes
                .iter_mut()
                .rev()
                .find_map(|s| s.locals.get_mut(name.as_str()))
                .ok_or_else(|| PatternError::eval("E_UNKNOWN_IDENT", format!("'{name}' is not defined")))?;
            pattern.set_value(io, value)
        }
        LValueTarget::Member { base, name } => {
            let base_pattern = resolve_path(ev, &lvalue_to_expr(base))?;
            let child = base_pattern
                .children()
                .iter()
                .find(|c| c.header.var_name.as_deref() == Some(name.as_str()))
                .cloned()
                .ok_or_else(|| PatternError::eval("E_NO_MEMBER", format!("no member '{name}'")))?;
            child.set_value(&mut ev.io, value)
        }
        LValueTarget::Index { base, index } => {
            let base_pattern = resolve_path(ev, &lvalue_to_expr(base))?;
            let idx = evaluate(ev, index)?.as_u128().unwrap_or(0) as u64;
            let entry = index_pattern(&base_pattern, idx)?;
            entry.set_value(&mut ev.io, value)
        }
    }
}

fn lvalue_to_expr(target: &LValueTarget) -> Expr {
    match target {
        LValueTarget::Name(n) => Expr::Rvalue(RvalueRoot::Identifier(n.clone())),
        LValueTarget::CurrentOffset => Expr::Rvalue(RvalueRoot::CurrentOffset),
        LValueTarget::Member { base, name } => Expr::Member { base: Box::new(lvalue_to_expr(base)), name: name.clone() },
        LValueTarget::Index { base, index } => Expr::Index { base: Box::new(lvalue_to_expr(base)), index: Box::new(index.clone()) },
    }
}

fn create_local_variable(ev: &mut Evaluator, decl: &VariableDecl) -> Result<Pattern, PatternError> {
    let offset = ev.io.sections_mut().heap_push(&[]);
    let mut pattern = materialize_type(ev, &decl.ty.ty, decl.ty.endian, HEAP, offset, Some(decl.name.clone()))?;
    apply_as_variable(ev, &mut pattern, &decl.attributes)?;
    Ok(pattern)
}

fn create_local_array(ev: &mut Evaluator, decl: &ArrayVariableDecl) -> Result<Pattern, PatternError> {
    let offset = ev.io.sections().heap_len();
    let mut pattern = create_array_at(ev, &decl.element_ty, &decl.size, HEAP, offset, decl.name.clone())?;
    apply_as_variable(ev, &mut pattern, &decl.attributes)?;
    Ok(pattern)
}

// ============================================================================
//                          TYPE / PATTERN MATERIALIZATION
// ============================================================================

fn materialize_type(
    ev: &mut Evaluator,
    ty: &TypeExpr,
    endian: Option<Endian>,
    section: SectionId,
    offset: u64,
    var_name: Option<String>,
) -> Result<Pattern, PatternError> {
    match ty {
        TypeExpr::Builtin(b) => {
            let leaf = leaf_kind_of(*b)?;
            let size = b.bit_width().map(|w| w.div_ceil(8) as u64).unwrap_or(1);
            let id = ev.alloc_pattern_id();
            let mut header = PatternHeader::new(id, offset, size, section);
            header.endian = endian.map(to_core_endian);
            header.var_name = var_name;
            header.type_name = Some(format!("{b:?}").to_lowercase());
            ev.account_pattern_created()?;
            Ok(Pattern::new(header, PatternKind::Leaf(leaf)))
        }
        TypeExpr::Named { name, .. } => materialize_named(ev, name, endian, section, offset, var_name),
        TypeExpr::Array { element, size } => {
            create_array_at(ev, &TypedExpr { ty: (**element).clone(), endian }, size, section, offset, var_name.unwrap_or_default())
        }
        TypeExpr::Pointer { pointee, underlying } => materialize_pointer(ev, pointee, underlying, endian, section, offset, var_name),
    }
}

fn materialize_named(
    ev: &mut Evaluator,
    name: &str,
    endian: Option<Endian>,
    section: SectionId,
    offset: u64,
    var_name: Option<String>,
) -> Result<Pattern, PatternError> {
    if let Some(decl) = ev.struct_decls.get(name).cloned() {
        return materialize_struct(ev, &decl, endian, section, offset, var_name);
    }
    if let Some(decl) = ev.union_decls.get(name).cloned() {
        return materialize_union(ev, &decl, endian, section, offset, var_name);
    }
    if let Some(decl) = ev.enum_decls.get(name).cloned() {
        return materialize_enum(ev, &decl, endian, section, offset, var_name);
    }
    if let Some(decl) = ev.bitfield_decls.get(name).cloned() {
        return materialize_bitfield(ev, &decl, endian, section, offset, var_name);
    }
    if let Some(decl) = ev.type_decls.get(name).cloned() {
        let target = decl
            .target
            .as_ref()
            .ok_or_else(|| PatternError::eval("E_FORWARD_UNRESOLVED", format!("'{name}' is only forward-declared")))?;
        let mut p = materialize_type(ev, target, endian, section, offset, var_name)?;
        p.header.type_name = Some(name.to_string());
        return Ok(p);
    }
    Err(PatternError::eval("E_UNKNOWN_TYPE", format!("unknown type '{name}'")))
}

fn materialize_struct(
    ev: &mut Evaluator,
    decl: &StructDecl,
    endian: Option<Endian>,
    section: SectionId,
    offset: u64,
    var_name: Option<String>,
) -> Result<Pattern, PatternError> {
    let saved_cursor = ev.io.cursor();
    ev.io.set_cursor(ReadCursor::new(offset));
    let mut children = Vec::new();
    for member in &decl.members {
        create_struct_member(ev, member, section, &mut children)?;
    }
    let end = ev.io.cursor().byte;
    ev.io.set_cursor(saved_cursor);

    let id = ev.alloc_pattern_id();
    let mut header = PatternHeader::new(id, offset, end.saturating_sub(offset), section);
    header.endian = endian.map(to_core_endian);
    header.var_name = var_name;
    header.type_name = Some(decl.name.clone());
    let mut pattern = Pattern::new(header, PatternKind::Struct { children });
    apply_as_type(ev, &mut pattern, &decl.attributes)?;
    ev.account_pattern_created()?;
    Ok(pattern)
}

fn create_struct_member(ev: &mut Evaluator, member: &StructMember, section: SectionId, out: &mut Vec<Pattern>) -> Result<(), PatternError> {
    match member {
        StructMember::Variable(v) => {
            let offset = placement_offset(ev, v.placement.as_ref())?;
            let mut p = materialize_type(ev, &v.ty.ty, v.ty.endian, section, offset, Some(v.name.clone()))?;
            if v.placement.is_none() {
                ev.io.set_cursor(ReadCursor::new(offset + p.header.size));
            }
            apply_as_variable(ev, &mut p, &v.attributes)?;
            out.push(p);
        }
        StructMember::ArrayVariable(a) => {
            let offset = placement_offset(ev, a.placement.as_ref())?;
            let mut p = create_array_at(ev, &a.element_ty, &a.size, section, offset, a.name.clone())?;
            if a.placement.is_none() {
                ev.io.set_cursor(ReadCursor::new(offset + p.header.size));
            }
            apply_as_variable(ev, &mut p, &a.attributes)?;
            out.push(p);
        }
        StructMember::PointerVariable(pv) => {
            let offset = placement_offset(ev, pv.placement.as_ref())?;
            let mut p = materialize_pointer(ev, &pv.pointee_ty.ty, &pv.underlying_ty, pv.pointee_ty.endian, section, offset, Some(pv.name.clone()))?;
            if pv.placement.is_none() {
                let ptr_size = p.header.size;
                ev.io.set_cursor(ReadCursor::new(offset + ptr_size));
            }
            apply_as_variable(ev, &mut p, &pv.attributes)?;
            out.push(p);
        }
        StructMember::MultiVariable(mv) => {
            for name in &mv.names {
                let offset = ev.io.cursor().byte;
                let mut p = materialize_type(ev, &mv.ty.ty, mv.ty.endian, section, offset, Some(name.clone()))?;
                ev.io.set_cursor(ReadCursor::new(offset + p.header.size));
                apply_as_variable(ev, &mut p, &mv.attributes)?;
                out.push(p);
            }
        }
        StructMember::Conditional { cond, then_branch, else_branch } => {
            let branch = if evaluate(ev, cond)?.as_bool() { then_branch } else { else_branch };
            for m in branch {
                create_struct_member(ev, m, section, out)?;
            }
        }
    }
    Ok(())
}

fn placement_offset(ev: &mut Evaluator, placement: Option<&Placement>) -> Result<u64, PatternError> {
    match placement {
        Some(p) => Ok(evaluate(ev, &p.offset)?.as_u128().unwrap_or(0) as u64),
        None => Ok(ev.io.cursor().byte),
    }
}

fn materialize_union(
    ev: &mut Evaluator,
    decl: &UnionDecl,
    endian: Option<Endian>,
    section: SectionId,
    offset: u64,
    var_name: Option<String>,
) -> Result<Pattern, PatternError> {
    let mut children = Vec::new();
    for member in &decl.members {
        let saved = ev.io.cursor();
        ev.io.set_cursor(ReadCursor::new(offset));
        create_struct_member(ev, member, section, &mut children)?;
        ev.io.set_cursor(saved);
    }
    let size = children.iter().map(|c| c.header.size).max().unwrap_or(0);
    let id = ev.alloc_pattern_id();
    let mut header = PatternHeader::new(id, offset, size, section);
    header.endian = endian.map(to_core_endian);
    header.var_name = var_name;
    header.type_name = Some(decl.name.clone());
    let mut pattern = Pattern::new(header, PatternKind::Union { children });
    apply_as_type(ev, &mut pattern, &decl.attributes)?;
    ev.account_pattern_created()?;
    Ok(pattern)
}

fn build_enum_entries(decl: &EnumDecl) -> Result<Vec<PatEnumEntry>, PatternError> {
    let mut entries = Vec::with_capacity(decl.entries.len());
    let mut next_auto: i128 = 0;
    for e in &decl.entries {
        let (min, max) = match &e.value {
            EnumValue::Auto => (next_auto, next_auto),
            EnumValue::Single(expr) => {
                let v = literal_const(expr)?;
                (v, v)
            }
            EnumValue::Range(a, b) => (literal_const(a)?, literal_const(b)?),
        };
        next_auto = max + 1;
        entries.push(PatEnumEntry { min, max, name: e.name.clone() });
    }
    Ok(entries)
}

/// Enum entry values must be compile-time constants; only literal
/// expressions (and negation of one) are supported, consistent with
/// declaring enumerators directly in source rather than computing them.
fn literal_const(expr: &Expr) -> Result<i128, PatternError> {
    match expr {
        Expr::Literal(l) => l.as_i128().ok_or_else(|| PatternError::validate("E_NOT_CONST", "enum value must be an integer constant")),
        Expr::Unary { op: UnaryOp::Neg, expr } => literal_const(expr).map(|v| -v),
        _ => Err(PatternError::validate("E_NOT_CONST", "enum value must be a constant expression")),
    }
}

fn materialize_enum(
    ev: &mut Evaluator,
    decl: &EnumDecl,
    endian: Option<Endian>,
    section: SectionId,
    offset: u64,
    var_name: Option<String>,
) -> Result<Pattern, PatternError> {
    let size = type_size_hint(ev, &decl.underlying).unwrap_or(4);
    let entries = build_enum_entries(decl)?;
    let id = ev.alloc_pattern_id();
    let mut header = PatternHeader::new(id, offset, size, section);
    header.endian = endian.map(to_core_endian);
    header.var_name = var_name;
    header.type_name = Some(decl.name.clone());
    ev.account_pattern_created()?;
    Ok(Pattern::new(header, PatternKind::Enum { entries }))
}

fn materialize_bitfield(
    ev: &mut Evaluator,
    decl: &BitfieldDecl,
    endian: Option<Endian>,
    section: SectionId,
    offset: u64,
    var_name: Option<String>,
) -> Result<Pattern, PatternError> {
    let core_endian = endian.map(to_core_endian);
    let mut children = Vec::new();
    let mut bit_cursor: u64 = 0;
    for field in &decl.fields {
        create_bitfield_member(ev, field, section, offset, &mut bit_cursor, core_endian, &mut children)?;
    }
    let total_bit_size = bit_cursor;
    let size = total_bit_size.div_ceil(8);
    let id = ev.alloc_pattern_id();
    let mut header = PatternHeader::new(id, offset, size, section);
    header.endian = core_endian;
    header.var_name = var_name;
    header.type_name = Some(decl.name.clone());
    let mut pattern = Pattern::new(header, PatternKind::Bitfield { children, first_bit_offset: 0, total_bit_size, reversed: false });
    apply_as_type(ev, &mut pattern, &decl.attributes)?;
    ev.account_pattern_created()?;
    Ok(pattern)
}

fn sign_of(sign: BitfieldFieldSign) -> PatSign {
    match sign {
        BitfieldFieldSign::Unsigned => PatSign::Unsigned,
        BitfieldFieldSign::Signed => PatSign::Signed,
        BitfieldFieldSign::Bool => PatSign::Bool,
    }
}

fn create_bitfield_member(
    ev: &mut Evaluator,
    member: &BitfieldMember,
    section: SectionId,
    container_offset: u64,
    bit_cursor: &mut u64,
    endian: Option<CoreEndian>,
    out: &mut Vec<Pattern>,
) -> Result<(), PatternError> {
    match member {
        BitfieldMember::Field { name, sign, bit_size, enum_type } => {
            let bit_size_v = evaluate(ev, bit_size)?.as_u128().unwrap_or(0) as u64;
            let byte_offset = container_offset + *bit_cursor / 8;
            let bit_offset = (*bit_cursor % 8) as u8;
            let enum_entries = match enum_type {
                Some(name) => {
                    let decl = ev
                        .enum_decls
                        .get(name)
                        .cloned()
                        .ok_or_else(|| PatternError::eval("E_UNKNOWN_TYPE", format!("unknown enum type '{name}'")))?;
                    Some(build_enum_entries(&decl)?)
                }
                None => None,
            };
            let id = ev.alloc_pattern_id();
            let mut header = PatternHeader::new(id, byte_offset, bit_size_v.div_ceil(8).max(1), section);
            header.endian = endian;
            header.var_name = Some(name.clone());
            let pattern = Pattern::new(header, PatternKind::BitfieldField { sign: sign_of(*sign), bit_offset, bit_size: bit_size_v, enum_entries });
            *bit_cursor += bit_size_v;
            ev.account_pattern_created()?;
            out.push(pattern);
        }
        BitfieldMember::Array { name, sign, bit_size, count } => {
            let bit_size_v = evaluate(ev, bit_size)?.as_u128().unwrap_or(0) as u64;
            let count_v = evaluate(ev, count)?.as_u128().unwrap_or(0) as u64;
            let byte_offset = container_offset + *bit_cursor / 8;
            let bit_offset = (*bit_cursor % 8) as u8;
            let id = ev.alloc_pattern_id();
            let mut tmpl_header = PatternHeader::new(id, byte_offset, bit_size_v.div_ceil(8).max(1), section);
            tmpl_header.endian = endian;
            tmpl_header.var_name = Some(format!("{name}[0]"));
            let template = Pattern::new(tmpl_header, PatternKind::BitfieldField { sign: sign_of(*sign), bit_offset, bit_size: bit_size_v, enum_entries: None });
            let array_id = ev.alloc_pattern_id();
            let mut header = PatternHeader::new(array_id, byte_offset, (bit_size_v * count_v).div_ceil(8).max(1), section);
            header.var_name = Some(name.clone());
            *bit_cursor += bit_size_v * count_v;
            ev.account_pattern_created()?;
            out.push(Pattern::new(header, PatternKind::BitfieldArray { template: Box::new(template), count: count_v }));
        }
        BitfieldMember::Nested(nested) => {
            let byte_offset = container_offset + *bit_cursor / 8;
            let bit_offset_in_byte = (*bit_cursor % 8) as u8;
            let mut pattern = materialize_nested_bitfield(ev, nested, section, byte_offset, bit_offset_in_byte, endian)?;
            pattern.header.var_name = Some(nested.name.clone());
            *bit_cursor += bitfield_pattern_bit_size(&pattern);
            out.push(pattern);
        }
        BitfieldMember::NestedArray { name, element, count } => {
            let count_v = evaluate(ev, count)?.as_u128().unwrap_or(0) as u64;
            let byte_offset = container_offset + *bit_cursor / 8;
            let bit_offset_in_byte = (*bit_cursor % 8) as u8;
            let template = materialize_nested_bitfield(ev, element, section, byte_offset, bit_offset_in_byte, endian)?;
            let element_bits = bitfield_pattern_bit_size(&template);
            let array_id = ev.alloc_pattern_id();
            let mut header = PatternHeader::new(array_id, byte_offset, (element_bits * count_v + bit_offset_in_byte as u64).div_ceil(8), section);
            header.var_name = Some(name.clone());
            *bit_cursor += element_bits * count_v;
            ev.account_pattern_created()?;
            out.push(Pattern::new(header, PatternKind::BitfieldArray { template: Box::new(template), count: count_v }));
        }
    }
    Ok(())
}

/// Build a nested bitfield container whose own fields start at
/// `bit_offset_in_byte` within `byte_offset`.
fn materialize_nested_bitfield(
    ev: &mut Evaluator,
    decl: &BitfieldDecl,
    section: SectionId,
    byte_offset: u64,
    bit_offset_in_byte: u8,
    endian: Option<CoreEndian>,
) -> Result<Pattern, PatternError> {
    let mut children = Vec::new();
    let mut bit_cursor: u64 = bit_offset_in_byte as u64;
    for field in &decl.fields {
        create_bitfield_member(ev, field, section, byte_offset, &mut bit_cursor, endian, &mut children)?;
    }
    let total_bit_size = bit_cursor - bit_offset_in_byte as u64;
    let size = (bit_offset_in_byte as u64 + total_bit_size).div_ceil(8);
    let id = ev.alloc_pattern_id();
    let mut header = PatternHeader::new(id, byte_offset, size, section);
    header.endian = endian;
    header.type_name = Some(decl.name.clone());
    ev.account_pattern_created()?;
    Ok(Pattern::new(header, PatternKind::Bitfield { children, first_bit_offset: bit_offset_in_byte, total_bit_size, reversed: false }))
}

fn materialize_pointer(
    ev: &mut Evaluator,
    pointee_ty: &TypeExpr,
    underlying_ty: &TypeExpr,
    endian: Option<Endian>,
    section: SectionId,
    offset: u64,
    var_name: Option<String>,
) -> Result<Pattern, PatternError> {
    let pointer_type = materialize_type(ev, underlying_ty, None, section, offset, None)?;
    let raw = pointer_type.value(&ev.io)?.as_i128().unwrap_or(0);
    let pointee_offset = raw.max(0) as u64;
    let mut pointee = materialize_type(ev, pointee_ty, endian, section, pointee_offset, Some("*".to_string()))?;
    pointee.set_offset(pointee_offset);
    let id = ev.alloc_pattern_id();
    let mut header = PatternHeader::new(id, offset, pointer_type.header.size, section);
    header.endian = endian.map(to_core_endian);
    header.var_name = var_name;
    header.type_name = pointee.header.type_name.clone();
    ev.account_pattern_created()?;
    Ok(Pattern::new(header, PatternKind::Pointer { pointer_type: Box::new(pointer_type), pointee: Box::new(pointee), pointer_base: None }))
}

fn create_array_at(
    ev: &mut Evaluator,
    element_ty: &TypedExpr,
    size: &ArraySize,
    section: SectionId,
    offset: u64,
    name: String,
) -> Result<Pattern, PatternError> {
    match size {
        ArraySize::Static(expr) => {
            let count = evaluate(ev, expr)?.as_u128().unwrap_or(0) as u64;
            if count > ev.config.max_array_length {
                return Err(PatternError::eval("E_ARRAY_LIMIT", format!("array length {count} exceeds the configured limit")));
            }
            let template = materialize_type(ev, &element_ty.ty, element_ty.endian, section, offset, Some(format!("{name}[0]")))?;
            let entry_size = template.header.size.max(1);
            let id = ev.alloc_pattern_id();
            let mut header = PatternHeader::new(id, offset, entry_size * count, section);
            header.type_name = template.header.type_name.clone();
            header.var_name = Some(name);
            ev.account_pattern_created()?;
            Ok(Pattern::new(header, PatternKind::StaticArray { template: Box::new(template), count, format_entries_fn: None, transform_entries_fn: None }))
        }
        ArraySize::WhileCondition(cond) => {
            let mut children = Vec::new();
            let mut cursor_offset = offset;
            let mut guard: u64 = 0;
            while evaluate(ev, cond)?.as_bool() {
                guard += 1;
                if guard > ev.config.max_array_length {
                    return Err(PatternError::eval("E_ARRAY_LIMIT", "while-sized array exceeded the configured length limit"));
                }
                let entry = materialize_type(ev, &element_ty.ty, element_ty.endian, section, cursor_offset, Some(format!("[{}]", children.len())))?;
                cursor_offset += entry.header.size.max(1);
                children.push(entry);
            }
            let total_size = cursor_offset - offset;
            let id = ev.alloc_pattern_id();
            let mut header = PatternHeader::new(id, offset, total_size, section);
            header.var_name = Some(name);
            ev.account_pattern_created()?;
            Ok(Pattern::new(header, PatternKind::DynamicArray { children }))
        }
    }
}

// ============================================================================
//                           TOP-LEVEL ITEM CREATION
// ============================================================================

/// Register or place one top-level item. Declarative items
/// that only add a named type (`TypeDecl`, `Struct`, `Union`, `Enum`,
/// `Bitfield`, `Function`) return no patterns of their own.
pub fn create_patterns(ev: &mut Evaluator, item: &Item) -> Result<Vec<Pattern>, PatternError> {
    match item {
        Item::TypeDecl(d) => {
            ev.type_decls.insert(d.name.clone(), d.clone());
            Ok(Vec::new())
        }
        Item::Struct(d) => {
            ev.struct_decls.insert(d.name.clone(), d.clone());
            Ok(Vec::new())
        }
        Item::Union(d) => {
            ev.union_decls.insert(d.name.clone(), d.clone());
            Ok(Vec::new())
        }
        Item::Enum(d) => {
            ev.enum_decls.insert(d.name.clone(), d.clone());
            Ok(Vec::new())
        }
        Item::Bitfield(d) => {
            ev.bitfield_decls.insert(d.name.clone(), d.clone());
            Ok(Vec::new())
        }
        Item::Function(f) => {
            ev.user_functions.insert(f.name.clone(), f.clone());
            Ok(Vec::new())
        }
        Item::Statement(stmt) => {
            execute(ev, stmt)?;
            Ok(Vec::new())
        }
        Item::Variable(v) => Ok(vec![create_placed_or_local(ev, v)?]),
        Item::ArrayVariable(a) => {
            let section = if a.placement.is_some() { MAIN } else { HEAP };
            let offset = placement_offset(ev, a.placement.as_ref())?;
            let mut p = create_array_at(ev, &a.element_ty, &a.size, section, offset, a.name.clone())?;
            apply_as_variable(ev, &mut p, &a.attributes)?;
            if section == MAIN {
                ev.io.set_cursor(ReadCursor::new(offset + p.header.size));
            }
            Ok(vec![p])
        }
        Item::PointerVariable(pv) => {
            let section = if pv.placement.is_some() { MAIN } else { HEAP };
            let offset = placement_offset(ev, pv.placement.as_ref())?;
            let mut p = materialize_pointer(ev, &pv.pointee_ty.ty, &pv.underlying_ty, pv.pointee_ty.endian, section, offset, Some(pv.name.clone()))?;
            apply_as_variable(ev, &mut p, &pv.attributes)?;
            if section == MAIN {
                ev.io.set_cursor(ReadCursor::new(offset + p.header.size));
            }
            Ok(vec![p])
        }
        Item::MultiVariable(mv) => {
            let mut out = Vec::with_capacity(mv.names.len());
            for name in &mv.names {
                let offset = ev.io.cursor().byte;
                let mut p = materialize_type(ev, &mv.ty.ty, mv.ty.endian, MAIN, offset, Some(name.clone()))?;
                ev.io.set_cursor(ReadCursor::new(offset + p.header.size));
                apply_as_variable(ev, &mut p, &mv.attributes)?;
                out.push(p);
            }
            Ok(out)
        }
    }
}

fn create_placed_or_local(ev: &mut Evaluator, v: &VariableDecl) -> Result<Pattern, PatternError> {
    let section = if v.placement.is_some() { MAIN } else { HEAP };
    let offset = placement_offset(ev, v.placement.as_ref())?;
    let mut pattern = materialize_type(ev, &v.ty.ty, v.ty.endian, section, offset, Some(v.name.clone()))?;
    apply_as_variable(ev, &mut pattern, &v.attributes)?;
    if section == MAIN {
        ev.io.set_cursor(ReadCursor::new(offset + pattern.header.size));
    }
    if v.in_out == Some(InOut::Out) {
        let value = pattern.value(&ev.io)?;
        ev.out_vars.insert(v.name.clone(), value);
    }
    Ok(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvaluatorConfig;
    use pattern_core::section::CallbackSection;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn new_evaluator() -> Evaluator {
        let mut ev = Evaluator::new(EvaluatorConfig::new(), Arc::new(AtomicBool::new(false)));
        ev.io.sections_mut().set_main(CallbackSection::new(0, 0x40, |_, buf| buf.fill(0), None));
        ev
    }

    fn var(name: &str, ty: TypeExpr, offset: u64) -> VariableDecl {
        VariableDecl {
            name: name.into(),
            ty: TypedExpr { ty, endian: None },
            placement: Some(Placement { offset: Expr::Literal(Literal::U128(offset as u128)), section: None }),
            in_out: None,
            attributes: AttributeMap::new(),
            loc: SourceLocation::new("<test>", 1),
        }
    }

    /// A struct/union member with no placement of its own, so it takes
    /// its offset from the container's cursor.
    fn member_var(name: &str, ty: TypeExpr) -> VariableDecl {
        VariableDecl {
            name: name.into(),
            ty: TypedExpr { ty, endian: None },
            placement: None,
            in_out: None,
            attributes: AttributeMap::new(),
            loc: SourceLocation::new("<test>", 1),
        }
    }

    /// A static array's size is its element size times its declared
    /// count.
    #[test]
    fn static_array_size_is_element_size_times_count() {
        let mut ev = new_evaluator();
        let decl = ArrayVariableDecl {
            name: "arr".into(),
            element_ty: TypedExpr { ty: TypeExpr::Builtin(BuiltinType::U32), endian: None },
            size: ArraySize::Static(Expr::Literal(Literal::U128(5))),
            placement: Some(Placement { offset: Expr::Literal(Literal::U128(0)), section: None }),
            attributes: AttributeMap::new(),
            loc: SourceLocation::new("<test>", 1),
        };
        let patterns = create_patterns(&mut ev, &Item::ArrayVariable(decl)).unwrap();
        assert_eq!(patterns[0].header.size, 4 * 5);
        match &patterns[0].kind {
            PatternKind::StaticArray { count, .. } => assert_eq!(*count, 5),
            other => panic!("expected a static array, got {other:?}"),
        }
    }

    /// Every union member starts at the union's own offset, and the
    /// union's size is its largest member.
    #[test]
    fn union_members_share_offset_and_size_is_the_largest_member() {
        let mut ev = new_evaluator();
        let union_decl = UnionDecl {
            name: "U".into(),
            template_params: vec![],
            members: vec![
                StructMember::Variable(member_var("small", TypeExpr::Builtin(BuiltinType::U8))),
                StructMember::Variable(member_var("big", TypeExpr::Builtin(BuiltinType::U32))),
            ],
            attributes: AttributeMap::new(),
            loc: SourceLocation::new("<test>", 1),
        };
        create_patterns(&mut ev, &Item::Union(union_decl)).unwrap();
        let patterns = create_patterns(&mut ev, &Item::Variable(var("u", TypeExpr::Named { name: "U".into(), args: vec![] }, 0x10))).unwrap();
        let u = &patterns[0];
        assert_eq!(u.header.size, 4);
        for child in u.children() {
            assert_eq!(child.header.offset, 0x10);
        }
    }

    /// A bitfield's total byte footprint rounds the summed bit widths up
    /// to the next whole byte.
    #[test]
    fn bitfield_byte_size_rounds_bit_width_up_to_a_whole_byte() {
        let mut ev = new_evaluator();
        let decl = BitfieldDecl {
            name: "Bf".into(),
            fields: vec![
                BitfieldMember::Field { name: "a".into(), sign: BitfieldFieldSign::Unsigned, bit_size: Expr::Literal(Literal::U128(3)), enum_type: None },
                BitfieldMember::Field { name: "b".into(), sign: BitfieldFieldSign::Unsigned, bit_size: Expr::Literal(Literal::U128(6)), enum_type: None },
            ],
            attributes: AttributeMap::new(),
            loc: SourceLocation::new("<test>", 1),
        };
        create_patterns(&mut ev, &Item::Bitfield(decl)).unwrap();
        let patterns = create_patterns(&mut ev, &Item::Variable(var("bf", TypeExpr::Named { name: "Bf".into(), args: vec![] }, 0))).unwrap();
        assert_eq!(patterns[0].header.size, (3u64 + 6).div_ceil(8));
    }

    /// `[[inline]]` is idempotent: applying it to an already-inlined
    /// pattern changes nothing further.
    #[test]
    fn inline_attribute_is_idempotent() {
        let mut ev = new_evaluator();
        let mut attrs = AttributeMap::new();
        attrs.insert("inline".into(), vec![]);
        let decl = StructDecl {
            name: "S".into(),
            template_params: vec![],
            members: vec![StructMember::Variable(member_var("x", TypeExpr::Builtin(BuiltinType::U8)))],
            attributes: attrs,
            loc: SourceLocation::new("<test>", 1),
        };
        create_patterns(&mut ev, &Item::Struct(decl)).unwrap();
        let mut patterns = create_patterns(&mut ev, &Item::Variable(var("s", TypeExpr::Named { name: "S".into(), args: vec![] }, 0))).unwrap();
        assert!(patterns[0].header.flags.inline_);
        let size_before = patterns[0].header.size;
        let mut reapply = AttributeMap::new();
        reapply.insert("inline".into(), vec![]);
        apply_as_variable(&mut ev, &mut patterns[0], &reapply).unwrap();
        assert!(patterns[0].header.flags.inline_);
        assert_eq!(patterns[0].header.size, size_before);
    }

    /// The configured pattern count cap, exercised through the real
    /// tree-walk rather than by calling `account_pattern_created`
    /// directly: a large static array trips the limit mid-materialization.
    #[test]
    fn pattern_count_limit_is_enforced_during_materialization() {
        let mut ev = Evaluator::new(EvaluatorConfig::new().with_max_pattern_count(3), Arc::new(AtomicBool::new(false)));
        ev.io.sections_mut().set_main(CallbackSection::new(0, 0x40, |_, buf| buf.fill(0), None));
        let decl = ArrayVariableDecl {
            name: "arr".into(),
            element_ty: TypedExpr { ty: TypeExpr::Builtin(BuiltinType::U32), endian: None },
            size: ArraySize::Static(Expr::Literal(Literal::U128(5))),
            placement: Some(Placement { offset: Expr::Literal(Literal::U128(0)), section: None }),
            attributes: AttributeMap::new(),
            loc: SourceLocation::new("<test>", 1),
        };
        for _ in 0..3 {
            ev.account_pattern_created().unwrap();
        }
        let err = create_patterns(&mut ev, &Item::ArrayVariable(decl)).unwrap_err();
        assert_eq!(err.code, "E_PATTERN_LIMIT");
    }
}
