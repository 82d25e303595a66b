//! Tagged literal value and its coercion/ordering rules.
//!
//! A small tagged union plus a separate "what kind of value is this"
//! type used for checking, kept deliberately simple since the pattern
//! language has no user-defined product types at the literal level
//! (those live in the pattern tree).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A pattern handle: an opaque reference to an already-materialized
/// pattern, used when an expression yields "the pattern itself" rather
/// than its value (e.g. `this`, a struct member access).
pub type PatternId = u64;

/// The tagged value every PL expression evaluates to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    U128(u128),
    I128(i128),
    Double(f64),
    Bool(bool),
    Char(char),
    String(String),
    Pattern(PatternId),
}

/// The synthetic "value type" a [`Literal`] infers to, used for coercion
/// and for attribute/builtin argument checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Unsigned,
    Signed,
    Double,
    Bool,
    Char,
    String,
    Pattern,
}

impl Literal {
    pub fn value_type(&self) -> ValueType {
        match self {
            Literal::U128(_) => ValueType::Unsigned,
            Literal::I128(_) => ValueType::Signed,
            Literal::Double(_) => ValueType::Double,
            Literal::Bool(_) => ValueType::Bool,
            Literal::Char(_) => ValueType::Char,
            Literal::String(_) => ValueType::String,
            Literal::Pattern(_) => ValueType::Pattern,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Literal::U128(_) | Literal::I128(_) | Literal::Double(_) | Literal::Bool(_) | Literal::Char(_)
        )
    }

    /// Coerce to `bool` via "!= 0". Strings and pattern handles have no
    /// numeric interpretation and are always truthy.
    pub fn as_bool(&self) -> bool {
        match self {
            Literal::U128(v) => *v != 0,
            Literal::I128(v) => *v != 0,
            Literal::Double(v) => *v != 0.0,
            Literal::Bool(v) => *v,
            Literal::Char(c) => *c != '\0',
            Literal::String(_) | Literal::Pattern(_) => true,
        }
    }

    /// Widen any numeric variant to `i128`, sign-extending as needed.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Literal::U128(v) => Some(*v as i128),
            Literal::I128(v) => Some(*v),
            Literal::Double(v) => Some(*v as i128),
            Literal::Bool(v) => Some(*v as i128),
            Literal::Char(c) => Some(*c as i128),
            _ => None,
        }
    }

    /// Widen any numeric variant to `u128`, masking negative values the
    /// way a reinterpret-cast would.
    pub fn as_u128(&self) -> Option<u128> {
        match self {
            Literal::U128(v) => Some(*v),
            Literal::I128(v) => Some(*v as u128),
            Literal::Double(v) => Some(*v as u128),
            Literal::Bool(v) => Some(*v as u128),
            Literal::Char(c) => Some(*c as u128),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::U128(v) => Some(*v as f64),
            Literal::I128(v) => Some(*v as f64),
            Literal::Double(v) => Some(*v),
            Literal::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Literal::Char(c) => Some(*c as u32 as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Truncate a numeric literal into an unsigned integer of `bits` width,
    /// sign/zero-extending first. Used by `Cast` (§4.3) and by bitfield
    /// writes re-packing a literal into its declared width.
    pub fn truncate_to_bits(&self, bits: u32) -> Option<u128> {
        let v = self.as_u128()?;
        if bits >= 128 {
            Some(v)
        } else {
            Some(v & ((1u128 << bits) - 1))
        }
    }

    /// Cast to a signed integer of `bits` width, sign-extending the result
    /// so callers see the "real" negative value rather than the raw bits.
    pub fn cast_signed(&self, bits: u32) -> Option<i128> {
        let raw = self.truncate_to_bits(bits)?;
        if bits == 0 || bits >= 128 {
            return Some(raw as i128);
        }
        let sign_bit = 1u128 << (bits - 1);
        if raw & sign_bit != 0 {
            Some((raw | !((1u128 << bits) - 1)) as i128)
        } else {
            Some(raw as i128)
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::U128(v) => write!(f, "{v}"),
            Literal::I128(v) => write!(f, "{v}"),
            Literal::Double(v) => write!(f, "{v}"),
            Literal::Bool(v) => write!(f, "{v}"),
            Literal::Char(c) => write!(f, "{c}"),
            Literal::String(s) => write!(f, "{s}"),
            Literal::Pattern(id) => write!(f, "<pattern #{id}>"),
        }
    }
}

/// Ordering rules:
///
/// - same-type values order naturally
/// - numeric variants (including bool/char) compare cross-type by value
/// - a string compared against a non-string is unordered; by convention
///   the string is treated as "less" so a total order still exists for
///   sorting, though this ordering is otherwise implementation-defined
/// - pattern handles compare by id only against other pattern handles
impl PartialOrd for Literal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Literal::String(a), Literal::String(b)) => a.partial_cmp(b),
            (Literal::Pattern(a), Literal::Pattern(b)) => a.partial_cmp(b),
            (Literal::String(_), _) => Some(Ordering::Less),
            (_, Literal::String(_)) => Some(Ordering::Greater),
            (Literal::Pattern(_), _) | (_, Literal::Pattern(_)) => None,
            _ => {
                let (a, b) = (self.as_f64()?, other.as_f64()?);
                a.partial_cmp(&b)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_coercion_widens_and_masks() {
        let v = Literal::I128(-1);
        assert_eq!(v.truncate_to_bits(8), Some(0xFF));
        assert_eq!(v.cast_signed(8), Some(-1));
    }

    #[test]
    fn non_zero_is_truthy() {
        assert!(Literal::U128(5).as_bool());
        assert!(!Literal::U128(0).as_bool());
        assert!(Literal::String(String::new()).as_bool());
    }

    #[test]
    fn string_vs_numeric_is_ordered_by_convention() {
        assert_eq!(
            Literal::String("x".into()).partial_cmp(&Literal::U128(1)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn cross_type_numeric_orders_by_value() {
        assert_eq!(
            Literal::U128(2).partial_cmp(&Literal::Double(1.5)),
            Some(Ordering::Greater)
        );
    }
}
