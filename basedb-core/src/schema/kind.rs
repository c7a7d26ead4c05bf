use serde::{Deserialize, Serialize};

/// Property kind tag, also the `type_index` written into byte-code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum PropKind {
    Boolean = 1,
    Int8 = 2,
    Uint8 = 3,
    Int16 = 4,
    Uint16 = 5,
    Int32 = 6,
    Uint32 = 7,
    Number = 8,
    Timestamp = 9,
    Enum = 10,
    String = 11,
    Binary = 12,
    Alias = 13,
    Cardinality = 14,
    Vector = 15,
    Text = 16,
    Json = 17,
    Reference = 18,
    References = 19,
    Object = 20,
}

impl PropKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "boolean" => PropKind::Boolean,
            "int8" => PropKind::Int8,
            "uint8" => PropKind::Uint8,
            "int16" => PropKind::Int16,
            "uint16" => PropKind::Uint16,
            "int32" => PropKind::Int32,
            "uint32" => PropKind::Uint32,
            "number" => PropKind::Number,
            "timestamp" => PropKind::Timestamp,
            "enum" => PropKind::Enum,
            "string" => PropKind::String,
            "binary" => PropKind::Binary,
            "alias" => PropKind::Alias,
            "cardinality" => PropKind::Cardinality,
            "vector" => PropKind::Vector,
            "text" => PropKind::Text,
            "json" => PropKind::Json,
            "reference" => PropKind::Reference,
            "references" => PropKind::References,
            "object" => PropKind::Object,
            _ => return None,
        })
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => PropKind::Boolean,
            2 => PropKind::Int8,
            3 => PropKind::Uint8,
            4 => PropKind::Int16,
            5 => PropKind::Uint16,
            6 => PropKind::Int32,
            7 => PropKind::Uint32,
            8 => PropKind::Number,
            9 => PropKind::Timestamp,
            10 => PropKind::Enum,
            11 => PropKind::String,
            12 => PropKind::Binary,
            13 => PropKind::Alias,
            14 => PropKind::Cardinality,
            15 => PropKind::Vector,
            16 => PropKind::Text,
            17 => PropKind::Json,
            18 => PropKind::Reference,
            19 => PropKind::References,
            20 => PropKind::Object,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            PropKind::Boolean => "boolean",
            PropKind::Int8 => "int8",
            PropKind::Uint8 => "uint8",
            PropKind::Int16 => "int16",
            PropKind::Uint16 => "uint16",
            PropKind::Int32 => "int32",
            PropKind::Uint32 => "uint32",
            PropKind::Number => "number",
            PropKind::Timestamp => "timestamp",
            PropKind::Enum => "enum",
            PropKind::String => "string",
            PropKind::Binary => "binary",
            PropKind::Alias => "alias",
            PropKind::Cardinality => "cardinality",
            PropKind::Vector => "vector",
            PropKind::Text => "text",
            PropKind::Json => "json",
            PropKind::Reference => "reference",
            PropKind::References => "references",
            PropKind::Object => "object",
        }
    }

    /// Bytes taken in the main record; `0` for separately stored kinds.
    pub fn main_size(&self) -> usize {
        match self {
            PropKind::Boolean | PropKind::Enum | PropKind::Int8 | PropKind::Uint8 => 1,
            PropKind::Int16 | PropKind::Uint16 => 2,
            PropKind::Int32 | PropKind::Uint32 => 4,
            PropKind::Number | PropKind::Timestamp => 8,
            _ => 0,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            PropKind::Int8
                | PropKind::Uint8
                | PropKind::Int16
                | PropKind::Uint16
                | PropKind::Int32
                | PropKind::Uint32
                | PropKind::Number
                | PropKind::Timestamp
        )
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, PropKind::Reference | PropKind::References)
    }

    /// Kinds whose content is a string for search and filtering.
    pub fn is_stringy(&self) -> bool {
        matches!(self, PropKind::String | PropKind::Alias | PropKind::Text)
    }

    /// Integer range of a fixed-width kind.
    pub fn int_bounds(&self) -> Option<(i64, i64)> {
        Some(match self {
            PropKind::Int8 => (i8::MIN as i64, i8::MAX as i64),
            PropKind::Uint8 => (0, u8::MAX as i64),
            PropKind::Int16 => (i16::MIN as i64, i16::MAX as i64),
            PropKind::Uint16 => (0, u16::MAX as i64),
            PropKind::Int32 => (i32::MIN as i64, i32::MAX as i64),
            PropKind::Uint32 => (0, u32::MAX as i64),
            _ => return None,
        })
    }
}

impl std::fmt::Display for PropKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        for v in 1..=20u8 {
            let kind = PropKind::from_u8(v).unwrap();
            assert_eq!(kind as u8, v);
            assert_eq!(PropKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(PropKind::from_u8(0), None);
        assert_eq!(PropKind::from_name("float"), None);
    }

    #[test]
    fn test_size_table() {
        assert_eq!(PropKind::Boolean.main_size(), 1);
        assert_eq!(PropKind::Enum.main_size(), 1);
        assert_eq!(PropKind::Uint16.main_size(), 2);
        assert_eq!(PropKind::Int32.main_size(), 4);
        assert_eq!(PropKind::Timestamp.main_size(), 8);
        assert_eq!(PropKind::String.main_size(), 0);
        assert_eq!(PropKind::References.main_size(), 0);
    }
}
