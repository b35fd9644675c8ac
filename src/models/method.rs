use serde::{Deserialize, Serialize};

/// Sentinel for class-level attributes when the owning class is unknown.
pub const UNRESOLVED: i64 = -1;

/// One dataset row: static metrics of a method plus inherited class attributes.
///
/// Field names are the on-disk cache format and must not change.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodRecord {
    #[serde(rename = "filePath", deserialize_with = "lenient::string")]
    pub file_path: String,
    #[serde(rename = "methodName", deserialize_with = "lenient::string")]
    pub method_name: String,
    #[serde(rename = "className", deserialize_with = "lenient::string")]
    pub class_name: String,
    #[serde(deserialize_with = "lenient::int")]
    pub loc: i64,
    #[serde(deserialize_with = "lenient::int")]
    pub wmc: i64,
    #[serde(rename = "qtyAssigment", deserialize_with = "lenient::int")]
    pub qty_assignment: i64,
    #[serde(rename = "qtyMathOperations", deserialize_with = "lenient::int")]
    pub qty_math_operations: i64,
    #[serde(rename = "qtyTryCatch", deserialize_with = "lenient::int")]
    pub qty_try_catch: i64,
    #[serde(rename = "qtyReturn", deserialize_with = "lenient::int")]
    pub qty_return: i64,
    #[serde(deserialize_with = "lenient::int")]
    pub fanin: i64,
    #[serde(deserialize_with = "lenient::int")]
    pub fanout: i64,
    #[serde(deserialize_with = "lenient::int")]
    pub age: i64,
    #[serde(rename = "nAuth", deserialize_with = "lenient::int")]
    pub n_auth: i64,
    #[serde(deserialize_with = "lenient::int")]
    pub nr: i64,
    #[serde(rename = "nSmells", deserialize_with = "lenient::int")]
    pub n_smells: i64,
    #[serde(deserialize_with = "lenient::boolean")]
    pub buggy: bool,
    /// Release the producing commit belongs to; assigned when a dataset is assembled.
    #[serde(skip)]
    pub release: String,
}

impl MethodRecord {
    /// `className#methodName`
    pub fn key(&self) -> String {
        method_key(&self.class_name, &self.method_name)
    }

    /// Method name without the `/arity[types]` signature suffix.
    pub fn simple_name(&self) -> &str {
        simple_name(&self.method_name)
    }
}

pub fn method_key(class_name: &str, method_name: &str) -> String {
    format!("{class_name}#{method_name}")
}

pub fn simple_name(signature: &str) -> &str {
    signature.split('/').next().unwrap_or(signature)
}

/// Deserializers that never fail on a wrong or missing leaf type.
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn int<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            Value::String(s) => s.trim().parse().unwrap_or(0),
            Value::Bool(b) => i64::from(b),
            _ => 0,
        })
    }

    pub fn boolean<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Bool(b) => b,
            Value::String(s) => s.eq_ignore_ascii_case("true"),
            Value::Number(n) => n.as_i64().is_some_and(|v| v != 0),
            _ => false,
        })
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_and_simple_name() {
        let r = MethodRecord {
            class_name: "src/main/java/org/a/Foo.java".into(),
            method_name: "bar/2[int,String]".into(),
            ..Default::default()
        };
        assert_eq!(r.key(), "src/main/java/org/a/Foo.java#bar/2[int,String]");
        assert_eq!(r.simple_name(), "bar");
    }

    #[test]
    fn test_serializes_cache_field_names() {
        let r = MethodRecord {
            qty_assignment: 3,
            n_auth: 2,
            n_smells: 1,
            buggy: true,
            release: "1.0".into(),
            ..Default::default()
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["qtyAssigment"], 3);
        assert_eq!(v["nAuth"], 2);
        assert_eq!(v["nSmells"], 1);
        assert_eq!(v["buggy"], true);
        assert!(v.get("release").is_none());
        assert_eq!(v.as_object().unwrap().len(), 16);
    }

    #[test]
    fn test_missing_and_null_fields_default() {
        let r: MethodRecord =
            serde_json::from_str(r#"{"methodName":"m/0","loc":null,"wmc":"4","extra":1}"#)
                .unwrap();
        assert_eq!(r.method_name, "m/0");
        assert_eq!(r.loc, 0);
        assert_eq!(r.wmc, 4);
        assert_eq!(r.file_path, "");
        assert!(!r.buggy);
    }
}
