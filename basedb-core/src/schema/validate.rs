use super::compile::PropDef;
use super::kind::PropKind;
use crate::timestamp::MAX_TIMESTAMP;
use crate::value::Value;

/// Declared bounds of a property.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validation {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    pub max_bytes: Option<usize>,
    /// Vector dimension
    pub size: Option<usize>,
}

impl Validation {
    fn check_number(&self, v: f64) -> Result<(), String> {
        if let Some(min) = self.min {
            if v < min {
                return Err(format!("{} is below min {}", v, min));
            }
        }
        if let Some(max) = self.max {
            if v > max {
                return Err(format!("{} is above max {}", v, max));
            }
        }
        if let Some(step) = self.step {
            if step > 0.0 {
                let base = self.min.unwrap_or(0.0);
                let n = (v - base) / step;
                if (n - n.round()).abs() > 1e-9 {
                    return Err(format!("{} is not a multiple of step {}", v, step));
                }
            }
        }
        Ok(())
    }
}

impl PropDef {
    /// Check that `value` is legal for this property. Nothing is coerced:
    /// a value of the wrong shape is rejected.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        let v = &self.validation;
        match (self.kind, value) {
            (_, Value::Null) => Ok(()),
            (PropKind::Boolean, Value::Bool(_)) => Ok(()),
            (PropKind::Number, Value::Number(n)) => {
                if n.is_nan() {
                    return Err("NaN is not a number".to_string());
                }
                v.check_number(*n)
            }
            (PropKind::Number, Value::Int(n)) => v.check_number(*n as f64),
            (PropKind::Timestamp, Value::Timestamp(n) | Value::Int(n)) => {
                if n.unsigned_abs() > MAX_TIMESTAMP.unsigned_abs() {
                    return Err(format!("timestamp {} out of range", n));
                }
                v.check_number(*n as f64)
            }
            (kind, Value::Int(n)) if kind.int_bounds().is_some() => {
                let (lo, hi) = kind.int_bounds().unwrap_or((0, 0));
                if *n < lo || *n > hi {
                    return Err(format!("{} does not fit in {}", n, kind));
                }
                v.check_number(*n as f64)
            }
            (kind, Value::Number(n)) if kind.int_bounds().is_some() && n.fract() == 0.0 => {
                self.check(&Value::Int(*n as i64))
            }
            (PropKind::Enum, Value::String(s)) => {
                if self.enum_values.iter().any(|m| m == s) {
                    Ok(())
                } else {
                    Err(format!("{:?} is not one of {:?}", s, self.enum_values))
                }
            }
            (PropKind::String | PropKind::Alias, Value::String(s)) => match v.max_bytes {
                Some(max) if s.len() > max => Err(format!("{} bytes exceeds max {}", s.len(), max)),
                _ => Ok(()),
            },
            (PropKind::Text, Value::String(_)) => Ok(()),
            (PropKind::Text, Value::Text(_)) => Ok(()),
            (PropKind::Binary, Value::Binary(_)) => Ok(()),
            (PropKind::Vector, Value::Vector(vec)) => match v.size {
                Some(size) if vec.len() != size => {
                    Err(format!("vector of {} does not match size {}", vec.len(), size))
                }
                _ => Ok(()),
            },
            (PropKind::Cardinality, Value::String(_)) => Ok(()),
            (PropKind::Cardinality, Value::Binary(b)) if b.len() == 8 => Ok(()),
            (PropKind::Cardinality, Value::List(items)) => {
                for item in items {
                    match item {
                        Value::String(_) => {}
                        Value::Binary(b) if b.len() == 8 => {}
                        other => return Err(format!("cardinality item {} is not a string or 8-byte hash", other.kind_name())),
                    }
                }
                Ok(())
            }
            (PropKind::Json, _) => Ok(()),
            (kind, other) => Err(format!("expected {}, got {}", kind, other.kind_name())),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SchemaConfig;
    use crate::schema::{compile, PropSchema as P, Schema, TypeSchema as T};
    use crate::value::Value;

    #[test]
    fn test_integer_bounds() {
        let schema = Schema::new().with_type(
            T::new("t")
                .prop(P::int8("a"))
                .prop(P::uint32("b"))
                .prop(P::timestamp("c"))
                .prop(P::enumeration("d", ["x", "y"]))
                .prop(P::vector("v", 3))
                .prop(P::cardinality("u")),
        );
        let defs = compile(&schema, &SchemaConfig::default()).unwrap();
        let t = defs.get("t").unwrap();
        let a = t.prop("a").unwrap();
        assert!(a.check(&Value::Int(-128)).is_ok());
        assert!(a.check(&Value::Int(127)).is_ok());
        assert!(a.check(&Value::Int(128)).is_err());
        assert!(a.check(&Value::from("1")).is_err());

        let b = t.prop("b").unwrap();
        assert!(b.check(&Value::Int(4_294_967_295)).is_ok());
        assert!(b.check(&Value::Int(-1)).is_err());
        assert!(b.check(&Value::Number(1.5)).is_err());

        let c = t.prop("c").unwrap();
        assert!(c.check(&Value::Timestamp(8_640_000_000_000_000)).is_ok());
        assert!(c.check(&Value::Timestamp(8_640_000_000_000_001)).is_err());
        assert!(c.check(&Value::Timestamp(-8_640_000_000_000_000)).is_ok());
        assert!(c.check(&Value::Timestamp(i64::MIN)).is_err());
        assert!(c.check(&Value::Int(i64::MIN)).is_err());

        let d = t.prop("d").unwrap();
        assert!(d.check(&Value::from("y")).is_ok());
        assert!(d.check(&Value::from("z")).is_err());

        let v = t.prop("v").unwrap();
        assert!(v.check(&Value::Vector(vec![1.0, 2.0, 3.0])).is_ok());
        assert!(v.check(&Value::Vector(vec![1.0])).is_err());

        let u = t.prop("u").unwrap();
        assert!(u.check(&Value::List(vec!["a".into(), Value::Binary(vec![0; 8])])).is_ok());
        assert!(u.check(&Value::List(vec![Value::Int(1)])).is_err());
    }
}
