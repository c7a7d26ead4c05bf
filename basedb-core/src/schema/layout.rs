//! Main record layout: fixed-width fields at schema-assigned offsets.

use super::compile::{PropDef, TypeDef};
use super::kind::PropKind;
use crate::codec::*;
use crate::error::{Error, Result};
use crate::string::{decode_fixed, encode_fixed};
use crate::value::Value;

fn invalid(def: &PropDef, message: String) -> Error {
    Error::InvalidValue {
        type_name: String::new(),
        path: def.path.clone(),
        message,
    }
}

/// Write one main field into the type's main record.
pub fn encode_main(def: &PropDef, value: &Value, main: &mut [u8]) -> Result<()> {
    if def.separate || main.len() < def.start + def.len {
        return Err(invalid(def, "not a main field of this record".to_string()));
    }
    def.check(value).map_err(|m| invalid(def, m))?;

    if value.is_null() {
        main[def.start..def.start + def.len].fill(0);
        return Ok(());
    }

    let off = def.start;
    let int = || value.as_i64().ok_or_else(|| invalid(def, format!("expected integer, got {}", value.kind_name())));
    match def.kind {
        PropKind::Boolean => write_u8(main, off, value.as_bool().map(u8::from).unwrap_or(0)),
        PropKind::Int8 => write_i8(main, off, int()? as i8),
        PropKind::Uint8 => write_u8(main, off, int()? as u8),
        PropKind::Int16 => write_i16(main, off, int()? as i16),
        PropKind::Uint16 => write_u16(main, off, int()? as u16),
        PropKind::Int32 => write_i32(main, off, int()? as i32),
        PropKind::Uint32 => write_u32(main, off, int()? as u32),
        PropKind::Timestamp => write_i64(main, off, int()?),
        PropKind::Number => write_f64(main, off, value.as_f64().unwrap_or(0.0)),
        PropKind::Enum => {
            let member = value.as_str().unwrap_or_default();
            let index = def
                .enum_index(member)
                .ok_or_else(|| invalid(def, format!("{:?} is not an enum member", member)))?;
            write_u8(main, off, index);
        }
        PropKind::String if def.fixed_string => {
            let s = value.as_str().unwrap_or_default();
            encode_fixed(s, def.len - 1, &mut main[off..off + def.len]).map_err(|e| invalid(def, e.to_string()))?;
        }
        kind => return Err(invalid(def, format!("{} has no main encoding", kind))),
    }
    Ok(())
}

/// Read one main field from a main record.
pub fn decode_main(def: &PropDef, main: &[u8]) -> Result<Value> {
    if main.len() < def.start + def.len {
        return Err(Error::malformed("main record", format!("{} too short for {}", main.len(), def.path)));
    }
    let off = def.start;
    Ok(match def.kind {
        PropKind::Boolean => Value::Bool(read_u8(main, off) != 0),
        PropKind::Int8 => Value::Int(read_i8(main, off) as i64),
        PropKind::Uint8 => Value::Int(read_u8(main, off) as i64),
        PropKind::Int16 => Value::Int(read_i16(main, off) as i64),
        PropKind::Uint16 => Value::Int(read_u16(main, off) as i64),
        PropKind::Int32 => Value::Int(read_i32(main, off) as i64),
        PropKind::Uint32 => Value::Int(read_u32(main, off) as i64),
        PropKind::Timestamp => Value::Timestamp(read_i64(main, off)),
        PropKind::Number => Value::Number(read_f64(main, off)),
        PropKind::Enum => match read_u8(main, off) {
            0 => Value::Null,
            i => def
                .enum_values
                .get(i as usize - 1)
                .map(|s| Value::String(s.clone()))
                .unwrap_or(Value::Null),
        },
        PropKind::String if def.fixed_string => Value::String(decode_fixed(&main[off..off + def.len])?),
        _ => Value::Null,
    })
}

/// Main record with every field at its default.
pub fn default_main(def: &TypeDef) -> Vec<u8> {
    let mut main = vec![0u8; def.main_len];
    for p in def.main_props() {
        if let Some(default) = &p.default {
            // Defaults were validated at compile time.
            let _ = encode_main(p, default, &mut main);
        }
    }
    main
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchemaConfig;
    use crate::schema::{compile, PropSchema as P, Schema, TypeSchema as T};
    use crate::timestamp::MAX_TIMESTAMP;

    fn boundary_type() -> crate::schema::TypeDefs {
        let schema = Schema::new().with_type(
            T::new("bounds")
                .prop(P::int8("i8"))
                .prop(P::uint8("u8"))
                .prop(P::int16("i16"))
                .prop(P::uint16("u16"))
                .prop(P::int32("i32"))
                .prop(P::uint32("u32"))
                .prop(P::number("num"))
                .prop(P::timestamp("ts"))
                .prop(P::boolean("flag"))
                .prop(P::enumeration("level", ["low", "high"]).default(serde_json::json!("high")))
                .prop(P::string("code").max_bytes(4).compression("none")),
        );
        compile(&schema, &SchemaConfig::default()).unwrap()
    }

    #[test]
    fn test_boundary_roundtrip() {
        let defs = boundary_type();
        let t = defs.get("bounds").unwrap();
        let cases: Vec<(&str, Vec<Value>)> = vec![
            ("i8", vec![Value::Int(-128), Value::Int(127)]),
            ("u8", vec![Value::Int(0), Value::Int(255)]),
            ("i16", vec![Value::Int(-32768), Value::Int(32767)]),
            ("u16", vec![Value::Int(0), Value::Int(65535)]),
            ("i32", vec![Value::Int(i32::MIN as i64), Value::Int(i32::MAX as i64)]),
            ("u32", vec![Value::Int(0), Value::Int(4_294_967_295)]),
            ("num", vec![Value::Number(-1.5), Value::Number(f64::MAX)]),
            ("ts", vec![Value::Timestamp(0), Value::Timestamp(MAX_TIMESTAMP)]),
            ("flag", vec![Value::Bool(true), Value::Bool(false)]),
            ("level", vec![Value::from("low"), Value::from("high")]),
            ("code", vec![Value::from(""), Value::from("NL")]),
        ];
        let mut main = default_main(t);
        for (path, values) in cases {
            let p = t.prop(path).unwrap();
            for v in values {
                encode_main(p, &v, &mut main).unwrap();
                assert_eq!(decode_main(p, &main).unwrap(), v, "{}", path);
            }
        }
    }

    #[test]
    fn test_out_of_range_is_rejected_not_truncated() {
        let defs = boundary_type();
        let t = defs.get("bounds").unwrap();
        let mut main = default_main(t);
        let p = t.prop("u8").unwrap();
        encode_main(p, &Value::Int(7), &mut main).unwrap();
        assert!(encode_main(p, &Value::Int(256), &mut main).is_err());
        assert_eq!(decode_main(p, &main).unwrap(), Value::Int(7));
        assert!(encode_main(t.prop("code").unwrap(), &Value::from("TOOLONG"), &mut main).is_err());
    }

    #[test]
    fn test_default_main() {
        let defs = boundary_type();
        let t = defs.get("bounds").unwrap();
        let main = default_main(t);
        assert_eq!(main.len(), t.main_len);
        assert_eq!(decode_main(t.prop("level").unwrap(), &main).unwrap(), Value::from("high"));
        assert_eq!(decode_main(t.prop("u32").unwrap(), &main).unwrap(), Value::Int(0));
    }
}
