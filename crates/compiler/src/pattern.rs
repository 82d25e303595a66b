//! The pattern tree: the interpreter's output model.
//!
//! A class-per-kind hierarchy is flattened here into one tagged
//! [`PatternKind`] behind a shared [`PatternHeader`], since this
//! language has no virtual dispatch to lean on.
//!
//! A pattern holds no back-reference to the evaluator that built it:
//! every operation that needs to touch bytes takes a `&ByteIo` (or
//! `&mut ByteIo`) explicitly. This keeps `Pattern` plain data that can
//! be cloned, sent around, and inspected without threading
//! `Rc<RefCell<Evaluator>>` through the whole tree.

use pattern_core::{Endian, Literal, PatternId, SectionId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use pattern_core::error::PatternError;
use pattern_core::io::ByteIo;

pub type FormatterFn = Rc<dyn Fn(&Literal) -> Result<String, PatternError>>;
pub type TransformFn = Rc<dyn Fn(&Literal) -> Result<Literal, PatternError>>;
pub type PointerBaseFn = Rc<dyn Fn(i128) -> Result<i128, PatternError>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatternFlags {
    pub sealed: bool,
    pub constant: bool,
    pub initialized: bool,
    pub reference: bool,
    pub manual_color: bool,
    pub hidden: bool,
    pub highlight_hidden: bool,
    /// Splice this composite's children into its parent during traversal
    /// instead of showing the composite itself (`[[inline]]`).
    pub inline_: bool,
}

/// Fields shared by every pattern variant.
#[derive(Clone)]
pub struct PatternHeader {
    pub id: PatternId,
    pub offset: u64,
    pub size: u64,
    pub section: SectionId,
    pub color: Option<u32>,
    pub endian: Option<Endian>,
    pub type_name: Option<String>,
    pub var_name: Option<String>,
    pub attributes: HashMap<String, Vec<Literal>>,
    pub doc_comment: Option<String>,
    pub comment: Option<String>,
    pub flags: PatternFlags,
    formatted_cache: RefCell<Option<String>>,
    pub transform_fn: Option<TransformFn>,
    pub format_read_fn: Option<FormatterFn>,
    pub format_write_fn: Option<FormatterFn>,
}

impl fmt::Debug for PatternHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternHeader")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("section", &self.section)
            .field("type_name", &self.type_name)
            .field("var_name", &self.var_name)
            .field("flags", &self.flags)
            .finish()
    }
}

impl PatternHeader {
    pub fn new(id: PatternId, offset: u64, size: u64, section: SectionId) -> Self {
        Self {
            id,
            offset,
            size,
            section,
            color: None,
            endian: None,
            type_name: None,
            var_name: None,
            attributes: HashMap::new(),
            doc_comment: None,
            comment: None,
            flags: PatternFlags::default(),
            formatted_cache: RefCell::new(None),
            transform_fn: None,
            format_read_fn: None,
            format_write_fn: None,
        }
    }

    fn clear_cache(&self) {
        *self.formatted_cache.borrow_mut() = None;
    }
}

/// `(min, max, name)` — a single enum entry. `min == max` for a scalar
/// value; ranges may overlap, first match wins.
#[derive(Debug, Clone)]
pub struct EnumEntry {
    pub min: i128,
    pub max: i128,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    Unsigned,
    Signed,
    Float32,
    Float64,
    Boolean,
    Character,
    Character16,
    Str,
    WideString,
    Padding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitfieldFieldSign {
    Unsigned,
    Signed,
    Bool,
}

#[derive(Clone)]
pub enum PatternKind {
    Leaf(LeafKind),
    Enum {
        entries: Vec<EnumEntry>,
    },
    Pointer {
        pointer_type: Box<Pattern>,
        pointee: Box<Pattern>,
        pointer_base: Option<PointerBaseFn>,
    },
    Struct {
        children: Vec<Pattern>,
    },
    Union {
        children: Vec<Pattern>,
    },
    /// One template entry cloned per index; `template` carries entry 0's
    /// pattern and is re-offset on read.
    StaticArray {
        template: Box<Pattern>,
        count: u64,
        format_entries_fn: Option<FormatterFn>,
        transform_entries_fn: Option<TransformFn>,
    },
    DynamicArray {
        children: Vec<Pattern>,
    },
    BitfieldField {
        sign: BitfieldFieldSign,
        bit_offset: u8,
        bit_size: u64,
        enum_entries: Option<Vec<EnumEntry>>,
    },
    BitfieldArray {
        template: Box<Pattern>,
        count: u64,
    },
    Bitfield {
        children: Vec<Pattern>,
        first_bit_offset: u8,
        total_bit_size: u64,
        reversed: bool,
    },
}

impl std::fmt::Debug for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PatternKind::Leaf(_) => "Leaf",
            PatternKind::Enum { .. } => "Enum",
            PatternKind::Pointer { .. } => "Pointer",
            PatternKind::Struct { .. } => "Struct",
            PatternKind::Union { .. } => "Union",
            PatternKind::StaticArray { .. } => "StaticArray",
            PatternKind::DynamicArray { .. } => "DynamicArray",
            PatternKind::BitfieldField { .. } => "BitfieldField",
            PatternKind::BitfieldArray { .. } => "BitfieldArray",
            PatternKind::Bitfield { .. } => "Bitfield",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct Pattern {
    pub header: PatternHeader,
    pub kind: PatternKind,
}

/// The only extension point on the tree.
pub trait PatternVisitor {
    fn visit(&mut self, pattern: &Pattern);
}

impl Pattern {
    pub fn new(header: PatternHeader, kind: PatternKind) -> Self {
        Self { header, kind }
    }

    pub fn display_name(&self) -> &str {
        self.header
            .var_name
            .as_deref()
            .or(self.header.type_name.as_deref())
            .unwrap_or("<anonymous>")
    }

    /// Direct children for traversal purposes, honoring `sealed`.
    pub fn children(&self) -> &[Pattern] {
        if self.header.flags.sealed {
            return &[];
        }
        match &self.kind {
            PatternKind::Struct { children } | PatternKind::Union { children } => children,
            PatternKind::DynamicArray { children } => children,
            PatternKind::Bitfield { children, .. } => children,
            _ => &[],
        }
    }

    /// Whether this pattern should be skipped entirely in a rendered
    /// tree: `$padding$`-style bitfield fields, or the explicit `hidden`
    /// attribute.
    pub fn is_display_hidden(&self) -> bool {
        self.header.flags.hidden || self.header.var_name.as_deref().is_some_and(|n| n.starts_with('$'))
    }

    /// Evaluate this pattern's value from section bytes, routing through
    /// `[[transform]]` if installed.
    pub fn value(&self, io: &ByteIo) -> Result<Literal, PatternError> {
        let raw = self.raw_value(io)?;
        match &self.header.transform_fn {
            Some(f) => f(&raw),
            None => Ok(raw),
        }
    }

    fn raw_value(&self, io: &ByteIo) -> Result<Literal, PatternError> {
        match &self.kind {
            PatternKind::Leaf(leaf) => self.read_leaf(io, *leaf),
            PatternKind::Enum { .. } => self.read_integer(io, false),
            PatternKind::Pointer { pointer_type, .. } => pointer_type.raw_value(io),
            PatternKind::BitfieldField { sign, bit_offset, bit_size, .. } => {
                self.read_bitfield_scalar(io, *sign, *bit_offset, *bit_size)
            }
            PatternKind::Struct { .. }
            | PatternKind::Union { .. }
            | PatternKind::StaticArray { .. }
            | PatternKind::DynamicArray { .. }
            | PatternKind::BitfieldArray { .. }
            | PatternKind::Bitfield { .. } => Ok(Literal::Pattern(self.header.id)),
        }
    }

    fn read_leaf(&self, io: &ByteIo, leaf: LeafKind) -> Result<Literal, PatternError> {
        let endian = self.header.endian.unwrap_or(Endian::Little);
        match leaf {
            LeafKind::Unsigned => self.read_integer(io, false),
            LeafKind::Signed => self.read_integer(io, true),
            LeafKind::Float32 => {
                let bits = io.read_bits(self.header.section, self.header.offset, 0, 32, endian)? as u32;
                Ok(Literal::Double(f32::from_bits(bits) as f64))
            }
            LeafKind::Float64 => {
                let bits = io.read_bits(self.header.section, self.header.offset, 0, 64, endian)? as u64;
                Ok(Literal::Double(f64::from_bits(bits)))
            }
            LeafKind::Boolean => {
                let v = io.read_bits(self.header.section, self.header.offset, 0, 8, endian)?;
                Ok(Literal::Bool(v != 0))
            }
            LeafKind::Character => {
                let v = io.read_bits(self.header.section, self.header.offset, 0, 8, endian)?;
                Ok(Literal::Char(v as u8 as char))
            }
            LeafKind::Character16 => {
                let v = io.read_bits(self.header.section, self.header.offset, 0, 16, endian)?;
                Ok(Literal::Char(char::from_u32(v as u32).unwrap_or('\u{FFFD}')))
            }
            LeafKind::Str => {
                let s = io.read_string(self.header.section, self.header.offset, self.header.size)?;
                Ok(Literal::String(s))
            }
            LeafKind::WideString => {
                let mut out = String::new();
                let units = self.header.size / 2;
                for i in 0..units {
                    let v = io.read_bits(self.header.section, self.header.offset + i * 2, 0, 16, endian)?;
                    if v == 0 {
                        break;
                    }
                    out.push(char::from_u32(v as u32).unwrap_or('\u{FFFD}'));
                }
                Ok(Literal::String(out))
            }
            LeafKind::Padding => Ok(Literal::U128(0)),
        }
    }

    fn read_integer(&self, io: &ByteIo, signed: bool) -> Result<Literal, PatternError> {
        let endian = self.header.endian.unwrap_or(Endian::Little);
        let bits = (self.header.size * 8) as u64;
        let v = io.read_bits(self.header.section, self.header.offset, 0, bits, endian)?;
        if signed {
            let sign_bit = 1u128 << (bits - 1);
            let signed_v = if bits < 128 && v & sign_bit != 0 {
                (v | !((1u128 << bits) - 1)) as i128
            } else {
                v as i128
            };
            Ok(Literal::I128(signed_v))
        } else {
            Ok(Literal::U128(v))
        }
    }

    fn read_bitfield_scalar(
        &self,
        io: &ByteIo,
        sign: BitfieldFieldSign,
        bit_offset: u8,
        bit_size: u64,
    ) -> Result<Literal, PatternError> {
        let endian = self.header.endian.unwrap_or(Endian::Little);
        let v = io.read_bits(self.header.section, self.header.offset, bit_offset, bit_size, endian)?;
        match sign {
            BitfieldFieldSign::Unsigned => Ok(Literal::U128(v)),
            BitfieldFieldSign::Bool => Ok(Literal::Bool(v != 0)),
            BitfieldFieldSign::Signed => {
                let sign_bit = 1u128 << (bit_size.saturating_sub(1).min(127));
                let signed_v = if bit_size < 128 && v & sign_bit != 0 {
                    (v | !((1u128 << bit_size) - 1)) as i128
                } else {
                    v as i128
                };
                Ok(Literal::I128(signed_v))
            }
        }
    }

    /// Textual form, running `[[format]]`/`[[format_read]]` if installed,
    /// with a one-level memoizing cache.
    pub fn formatted_value(&self, io: &ByteIo) -> String {
        if let Some(cached) = self.formatted_cache_get() {
            return cached;
        }
        let computed = self.compute_formatted_value(io);
        *self.header.formatted_cache.borrow_mut() = Some(computed.clone());
        computed
    }

    fn formatted_cache_get(&self) -> Option<String> {
        self.header.formatted_cache.borrow().clone()
    }

    fn compute_formatted_value(&self, io: &ByteIo) -> String {
        let value = match self.value(io) {
            Ok(v) => v,
            Err(e) => return format!("<error: {e}>"),
        };
        if let Some(formatter) = &self.header.format_read_fn {
            return match formatter(&value) {
                Ok(s) => s,
                Err(e) => format!("<error: {e}>"),
            };
        }
        match &self.kind {
            PatternKind::Enum { entries } => format_enum(&value, entries, self.header.type_name.as_deref()),
            PatternKind::BitfieldField {
                sign: BitfieldFieldSign::Unsigned | BitfieldFieldSign::Signed,
                enum_entries: Some(entries),
                ..
            } => format_enum(&value, entries, self.header.type_name.as_deref()),
            _ => value.to_string(),
        }
    }

    /// Serialize `literal` back through a section write, honoring
    /// `[[format_write]]`, and clear the formatted-value cache.
    pub fn set_value(&self, io: &mut ByteIo, literal: Literal) -> Result<(), PatternError> {
        if self.header.flags.constant {
            return Err(PatternError::eval("E_CONST_WRITE", format!("'{}' is constant", self.display_name())));
        }
        if let Some(writer) = &self.header.format_write_fn {
            writer(&literal)?;
        }
        let endian = self.header.endian.unwrap_or(Endian::Little);
        match &self.kind {
            PatternKind::Leaf(LeafKind::Float32) => {
                let f = literal.as_f64().unwrap_or(0.0) as f32;
                io.write_bits(self.header.section, self.header.offset, 0, 32, endian, f.to_bits() as u128)?;
            }
            PatternKind::Leaf(LeafKind::Float64) => {
                let f = literal.as_f64().unwrap_or(0.0);
                io.write_bits(self.header.section, self.header.offset, 0, 64, endian, f.to_bits() as u128)?;
            }
            PatternKind::BitfieldField { bit_offset, bit_size, .. } => {
                let v = literal.truncate_to_bits(*bit_size as u32).unwrap_or(0);
                io.write_bits(self.header.section, self.header.offset, *bit_offset, *bit_size, endian, v)?;
            }
            PatternKind::Leaf(LeafKind::Str) => {
                let s = literal.as_str().unwrap_or_default();
                let mut bytes = s.as_bytes().to_vec();
                bytes.resize(self.header.size as usize, 0);
                io.write_data(self.header.section, self.header.offset, &bytes)?;
            }
            _ => {
                let bits = (self.header.size * 8) as u32;
                let v = literal.truncate_to_bits(bits).unwrap_or(0);
                io.write_bits(self.header.section, self.header.offset, 0, bits as u64, endian, v)?;
            }
        }
        self.header.clear_cache();
        Ok(())
    }

    /// Raw byte image, honoring a transform function if one is set for
    /// byte-level (not value-level) reinterpretation.
    pub fn bytes(&self, io: &ByteIo) -> Result<Vec<u8>, PatternError> {
        let mut buf = vec![0u8; self.header.size as usize];
        io.read_data(self.header.section, self.header.offset, &mut buf)?;
        Ok(buf)
    }

    /// Shift this pattern and, if composite, every child whose section
    /// matches the parent's, by `new_offset - old_offset`.
    pub fn set_offset(&mut self, new_offset: u64) {
        let delta = new_offset as i128 - self.header.offset as i128;
        self.shift_offset(delta);
    }

    fn shift_offset(&mut self, delta: i128) {
        let section = self.header.section;
        self.header.offset = (self.header.offset as i128 + delta) as u64;
        self.header.clear_cache();
        let shift_children = |children: &mut [Pattern]| {
            for child in children {
                if child.header.section == section {
                    child.shift_offset(delta);
                }
            }
        };
        match &mut self.kind {
            PatternKind::Struct { children } | PatternKind::Union { children } => shift_children(children),
            PatternKind::DynamicArray { children } => shift_children(children),
            PatternKind::Bitfield { children, .. } => shift_children(children),
            PatternKind::StaticArray { template, .. } | PatternKind::BitfieldArray { template, .. } => {
                if template.header.section == section {
                    template.shift_offset(delta);
                }
            }
            PatternKind::Pointer { pointer_type, .. } => {
                if pointer_type.header.section == section {
                    pointer_type.shift_offset(delta);
                }
            }
            _ => {}
        }
    }

    pub fn set_section(&mut self, section: SectionId) {
        self.header.section = section;
        self.header.clear_cache();
        self.for_each_child_mut(|c| c.set_section(section));
    }

    pub fn set_endian(&mut self, endian: Endian) {
        self.header.endian = Some(endian);
        self.header.clear_cache();
        self.for_each_child_mut(|c| c.set_endian(endian));
    }

    pub fn set_color(&mut self, color: u32, recurse_single_color: bool) {
        self.header.color = Some(color);
        self.header.flags.manual_color = true;
        if recurse_single_color {
            self.for_each_child_mut(|c| c.set_color(color, true));
        }
    }

    pub fn set_local(&mut self, section: SectionId) {
        self.set_section(section);
    }

    pub fn set_reference(&mut self, reference: bool) {
        self.header.flags.reference = reference;
    }

    pub fn set_visibility(&mut self, hidden: bool) {
        self.header.flags.hidden = hidden;
    }

    fn for_each_child_mut(&mut self, mut f: impl FnMut(&mut Pattern)) {
        match &mut self.kind {
            PatternKind::Struct { children } | PatternKind::Union { children } => {
                children.iter_mut().for_each(&mut f)
            }
            PatternKind::DynamicArray { children } => children.iter_mut().for_each(&mut f),
            PatternKind::Bitfield { children, .. } => children.iter_mut().for_each(&mut f),
            PatternKind::StaticArray { template, .. } | PatternKind::BitfieldArray { template, .. } => {
                f(template)
            }
            PatternKind::Pointer { pointer_type, pointee, .. } => {
                f(pointer_type);
                f(pointee);
            }
            _ => {}
        }
    }

    pub fn accept(&self, visitor: &mut dyn PatternVisitor) {
        visitor.visit(self);
        for child in self.children() {
            child.accept(visitor);
        }
    }
}

/// Linear scan of `(min, max, name)` tuples; first match wins, otherwise
/// `"???"`.
pub fn lookup_enum_name<'a>(value: i128, entries: &'a [EnumEntry]) -> &'a str {
    entries
        .iter()
        .find(|e| value >= e.min && value <= e.max)
        .map(|e| e.name.as_str())
        .unwrap_or("???")
}

fn format_enum(value: &Literal, entries: &[EnumEntry], type_name: Option<&str>) -> String {
    let raw = value.as_i128().unwrap_or(0);
    let name = lookup_enum_name(raw, entries);
    let width = entries
        .iter()
        .map(|e| e.max)
        .max()
        .map(|max| if max > 0xFFFF_FFFF { 16 } else { 8 })
        .unwrap_or(8);
    match type_name {
        Some(ty) => format!("{ty}::{name} (0x{raw:0width$X})"),
        None => format!("{name} (0x{raw:0width$X})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pattern_core::section::CallbackSection;

    fn io_with_bytes(bytes: Vec<u8>) -> ByteIo {
        let mut io = ByteIo::new();
        io.sections_mut().set_main(CallbackSection::new(
            0,
            bytes.len() as u64,
            move |offset, buf| {
                let offset = offset as usize;
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = bytes.get(offset + i).copied().unwrap_or(0);
                }
            },
            None,
        ));
        io
    }

    #[test]
    fn leaf_unsigned_little_endian() {
        let io = io_with_bytes(vec![0x89, 0x50, 0x4E, 0x47]);
        let mut header = PatternHeader::new(1, 0, 4, pattern_core::section::MAIN);
        header.type_name = Some("u32".into());
        let p = Pattern::new(header, PatternKind::Leaf(LeafKind::Unsigned));
        assert_eq!(p.value(&io).unwrap(), Literal::U128(0x474E5089));
    }

    #[test]
    fn enum_lookup_formats_with_hex_value() {
        let entries = vec![
            EnumEntry { min: 0, max: 0, name: "A".into() },
            EnumEntry { min: 0x0C, max: 0x0C, name: "B".into() },
            EnumEntry { min: 0x0D, max: 0x0D, name: "C".into() },
        ];
        assert_eq!(lookup_enum_name(0x0D, &entries), "C");
        assert_eq!(lookup_enum_name(99, &entries), "???");
        assert_eq!(format_enum(&Literal::I128(0x0D), &entries, Some("E")), "E::C (0x0000000D)");
    }

    #[test]
    fn sealed_container_hides_children_but_keeps_size() {
        let inner = Pattern::new(
            PatternHeader::new(2, 0, 1, pattern_core::section::MAIN),
            PatternKind::Leaf(LeafKind::Unsigned),
        );
        let mut header = PatternHeader::new(1, 0, 1, pattern_core::section::MAIN);
        header.flags.sealed = true;
        let outer = Pattern::new(header, PatternKind::Struct { children: vec![inner] });
        assert!(outer.children().is_empty());
        assert_eq!(outer.header.size, 1);
    }

    #[test]
    fn set_offset_shifts_same_section_children() {
        let child = Pattern::new(
            PatternHeader::new(2, 4, 1, pattern_core::section::MAIN),
            PatternKind::Leaf(LeafKind::Unsigned),
        );
        let mut parent = Pattern::new(
            PatternHeader::new(1, 0, 5, pattern_core::section::MAIN),
            PatternKind::Struct { children: vec![child] },
        );
        parent.set_offset(10);
        assert_eq!(parent.header.offset, 10);
        match &parent.kind {
            PatternKind::Struct { children } => assert_eq!(children[0].header.offset, 14),
            _ => unreachable!(),
        }
    }

    /// Writing a value through `set_value` and reading it back through
    /// `value` round-trips, and clears the formatted-value cache so a
    /// stale string never survives the write.
    #[test]
    fn set_value_then_value_round_trips_and_clears_the_formatted_cache() {
        let mut io = ByteIo::new();
        let header = PatternHeader::new(1, 0, 4, pattern_core::section::HEAP);
        let p = Pattern::new(header, PatternKind::Leaf(LeafKind::Unsigned));

        p.set_value(&mut io, Literal::U128(0x1234)).unwrap();
        assert_eq!(p.value(&io).unwrap(), Literal::U128(0x1234));

        let first_formatted = p.formatted_value(&io);
        p.set_value(&mut io, Literal::U128(0x5678)).unwrap();
        assert_ne!(p.formatted_value(&io), first_formatted);
        assert_eq!(p.value(&io).unwrap(), Literal::U128(0x5678));
    }
}
