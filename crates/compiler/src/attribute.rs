//! Attribute engine: maps `[[name(args)]]` annotations onto
//! pattern and evaluator state.
//!
//! Resolving a `fn-name` argument into something callable requires the
//! function registry, which lives in `pattern-runtime` above this crate.
//! [`AttributeHost`] is the seam: the evaluator implements it, this crate
//! only calls it, so this crate declares the shape and the runtime
//! extension supplies the symbol.

use crate::ast::AttributeMap;
use crate::pattern::{FormatterFn, Pattern, PatternKind, PointerBaseFn, TransformFn};
use pattern_core::error::PatternError;
use pattern_core::io::ByteIo;

/// Resolves a `[[attr("fn_name")]]` argument to a callable. Implemented
/// by the evaluator, which owns the function table.
pub trait AttributeHost {
    fn resolve_formatter(&self, name: &str) -> Result<FormatterFn, PatternError>;
    fn resolve_transform(&self, name: &str) -> Result<TransformFn, PatternError>;
    fn resolve_pointer_base(&self, name: &str) -> Result<PointerBaseFn, PatternError>;
}

/// What the evaluator's read cursor must still do after attribute
/// application, since only the evaluator owns the cursor.
/// Positive values skip the cursor forward (`fixed_size` padding);
/// negative values rewind it (`no_unique_address`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributeEffects {
    pub cursor_delta_bytes: i64,
}

fn string_arg(attrs: &AttributeMap, name: &str) -> Option<String> {
    attrs.get(name)?.first()?.as_str().map(str::to_owned)
}

fn int_arg(attrs: &AttributeMap, name: &str) -> Option<i128> {
    attrs.get(name)?.first()?.as_i128()
}

fn parse_color(hex: &str) -> Option<u32> {
    u32::from_str_radix(hex.trim_start_matches('#'), 16).ok()
}

/// Apply `[[attr]]`s that belong to the *type*: everything except
/// `no_unique_address`, which only makes sense once a variable has been
/// placed.
pub fn apply_type_attributes(
    pattern: &mut Pattern,
    attrs: &AttributeMap,
    host: &dyn AttributeHost,
    io: &ByteIo,
) -> Result<AttributeEffects, PatternError> {
    apply_common(pattern, attrs, host, io)?;
    let mut effects = AttributeEffects::default();
    if let Some(size) = int_arg(attrs, "fixed_size") {
        effects.cursor_delta_bytes += apply_fixed_size(pattern, size as u64)?;
    }
    Ok(effects)
}

/// Apply the attributes attached directly to a variable placement, after
/// the type's own attributes have already run.
pub fn apply_variable_attributes(
    pattern: &mut Pattern,
    attrs: &AttributeMap,
    host: &dyn AttributeHost,
    io: &ByteIo,
) -> Result<AttributeEffects, PatternError> {
    apply_common(pattern, attrs, host, io)?;
    let mut effects = AttributeEffects::default();
    if let Some(size) = int_arg(attrs, "fixed_size") {
        effects.cursor_delta_bytes += apply_fixed_size(pattern, size as u64)?;
    }
    // Resolved unconditionally last, after fixed_size.
    if attrs.contains_key("no_unique_address") {
        effects.cursor_delta_bytes -= pattern.header.size as i64;
    }
    Ok(effects)
}

fn apply_common(
    pattern: &mut Pattern,
    attrs: &AttributeMap,
    host: &dyn AttributeHost,
    io: &ByteIo,
) -> Result<(), PatternError> {
    if attrs.contains_key("inline") {
        pattern.header.flags.inline_ = true;
    }
    if attrs.contains_key("hidden") {
        pattern.set_visibility(true);
    }
    if attrs.contains_key("highlight_hidden") {
        pattern.header.flags.highlight_hidden = true;
    }
    if attrs.contains_key("sealed") {
        pattern.header.flags.sealed = true;
    }
    if let Some(hex) = string_arg(attrs, "color") {
        let color = parse_color(&hex)
            .ok_or_else(|| PatternError::eval("E_BAD_COLOR", format!("invalid color literal '{hex}'")))?;
        pattern.set_color(color, false);
    }
    if attrs.contains_key("single_color") {
        if let Some(color) = pattern.header.color {
            pattern.set_color(color, true);
        }
    }
    if let Some(name) = string_arg(attrs, "name") {
        pattern.header.var_name = Some(name);
    }
    if let Some(comment) = string_arg(attrs, "comment") {
        pattern.header.comment = Some(comment);
    }
    if let Some(fn_name) = string_arg(attrs, "format").or_else(|| string_arg(attrs, "format_read")) {
        pattern.header.format_read_fn = Some(host.resolve_formatter(&fn_name)?);
    }
    if let Some(fn_name) = string_arg(attrs, "format_write") {
        pattern.header.format_write_fn = Some(host.resolve_formatter(&fn_name)?);
    }
    if let Some(fn_name) = string_arg(attrs, "transform") {
        pattern.header.transform_fn = Some(host.resolve_transform(&fn_name)?);
    }
    apply_entry_attributes(pattern, attrs, host)?;
    if let Some(fn_name) = string_arg(attrs, "pointer_base") {
        apply_pointer_base(pattern, &fn_name, host, io)?;
    }
    Ok(())
}

fn apply_entry_attributes(pattern: &mut Pattern, attrs: &AttributeMap, host: &dyn AttributeHost) -> Result<(), PatternError> {
    let format_entries = string_arg(attrs, "format_entries").or_else(|| string_arg(attrs, "format_read_entries"));
    let format_write_entries = string_arg(attrs, "format_write_entries");
    let transform_entries = string_arg(attrs, "transform_entries");
    if format_entries.is_none() && format_write_entries.is_none() && transform_entries.is_none() {
        return Ok(());
    }
    match &mut pattern.kind {
        PatternKind::StaticArray {
            format_entries_fn,
            transform_entries_fn,
            ..
        } => {
            if let Some(name) = &format_entries {
                *format_entries_fn = Some(host.resolve_formatter(name)?);
            }
            if let Some(name) = &transform_entries {
                *transform_entries_fn = Some(host.resolve_transform(name)?);
            }
        }
        PatternKind::DynamicArray { children } => {
            for child in children.iter_mut() {
                if let Some(name) = &format_entries {
                    child.header.format_read_fn = Some(host.resolve_formatter(name)?);
                }
                if let Some(name) = &format_write_entries {
                    child.header.format_write_fn = Some(host.resolve_formatter(name)?);
                }
                if let Some(name) = &transform_entries {
                    child.header.transform_fn = Some(host.resolve_transform(name)?);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn apply_pointer_base(
    pattern: &mut Pattern,
    fn_name: &str,
    host: &dyn AttributeHost,
    io: &ByteIo,
) -> Result<(), PatternError> {
    let PatternKind::Pointer { pointer_type, pointee, pointer_base } = &mut pattern.kind else {
        return Err(PatternError::validate(
            "E_BAD_ATTR_TARGET",
            "[[pointer_base]] only applies to pointer declarations",
        ));
    };
    let rebase = host.resolve_pointer_base(fn_name)?;
    let raw = pointer_type.value(io)?.as_i128().unwrap_or(0);
    let rebased = rebase(raw)?;
    pointee.set_offset(rebased as u64);
    *pointer_base = Some(rebase);
    Ok(())
}

/// Pad `pattern` up to `target_size`, erroring if its natural size is
/// already larger. Returns the number of bytes the cursor must still
/// advance by (the padding added).
fn apply_fixed_size(pattern: &mut Pattern, target_size: u64) -> Result<i64, PatternError> {
    if pattern.header.size > target_size {
        return Err(PatternError::eval(
            "E_FIXED_SIZE_TOO_SMALL",
            format!(
                "'{}' has natural size {} which exceeds fixed_size({target_size})",
                pattern.display_name(),
                pattern.header.size
            ),
        ));
    }
    let delta = (target_size - pattern.header.size) as i64;
    pattern.header.size = target_size;
    Ok(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{LeafKind, PatternHeader};
    use pattern_core::Literal;

    struct NoopHost;
    impl AttributeHost for NoopHost {
        fn resolve_formatter(&self, _name: &str) -> Result<FormatterFn, PatternError> {
            unreachable!("not exercised in these tests")
        }
        fn resolve_transform(&self, _name: &str) -> Result<TransformFn, PatternError> {
            unreachable!("not exercised in these tests")
        }
        fn resolve_pointer_base(&self, _name: &str) -> Result<PointerBaseFn, PatternError> {
            unreachable!("not exercised in these tests")
        }
    }

    fn scalar(size: u64) -> Pattern {
        Pattern::new(
            PatternHeader::new(1, 0x50, size, pattern_core::section::MAIN),
            PatternKind::Leaf(LeafKind::Unsigned),
        )
    }

    #[test]
    fn fixed_size_pads_and_reports_cursor_delta() {
        let io = ByteIo::new();
        let mut pattern = scalar(1);
        let mut attrs = AttributeMap::new();
        attrs.insert("fixed_size".into(), vec![Literal::U128(4)]);
        let effects = apply_variable_attributes(&mut pattern, &attrs, &NoopHost, &io).unwrap();
        assert_eq!(pattern.header.size, 4);
        assert_eq!(effects.cursor_delta_bytes, 3);
    }

    #[test]
    fn fixed_size_too_small_errors() {
        let io = ByteIo::new();
        let mut pattern = scalar(8);
        let mut attrs = AttributeMap::new();
        attrs.insert("fixed_size".into(), vec![Literal::U128(4)]);
        assert!(apply_variable_attributes(&mut pattern, &attrs, &NoopHost, &io).is_err());
    }

    #[test]
    fn no_unique_address_applies_after_fixed_size() {
        let io = ByteIo::new();
        let mut pattern = scalar(1);
        let mut attrs = AttributeMap::new();
        attrs.insert("fixed_size".into(), vec![Literal::U128(4)]);
        attrs.insert("no_unique_address".into(), vec![]);
        let effects = apply_variable_attributes(&mut pattern, &attrs, &NoopHost, &io).unwrap();
        // +3 from fixed_size padding, then -4 (the now-padded size) from
        // no_unique_address rewinding the cursor back over the field.
        assert_eq!(effects.cursor_delta_bytes, 3 - 4);
    }

    #[test]
    fn sealed_hides_children() {
        let io = ByteIo::new();
        let child = scalar(1);
        let mut pattern = Pattern::new(
            PatternHeader::new(2, 0, 1, pattern_core::section::MAIN),
            PatternKind::Struct { children: vec![child] },
        );
        let mut attrs = AttributeMap::new();
        attrs.insert("sealed".into(), vec![]);
        apply_type_attributes(&mut pattern, &attrs, &NoopHost, &io).unwrap();
        assert!(pattern.children().is_empty());
    }
}
