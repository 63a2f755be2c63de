//! Pure predicates and assertions shared by every layer.
//!
//! The special-float scan walks any `Serialize` value without building JSON:
//! serde_json silently turns NaN and infinities into `null`, so the check has to
//! run on the caller's value before conversion.

use serde::Serialize;
use serde::ser::{self, SerializeMap, SerializeSeq, SerializeStruct};

use crate::error::BridgeError;

pub fn is_finite_number(value: f64) -> bool {
    value.is_finite()
}

pub fn assert_finite_number(value: f64, name: &str) -> Result<f64, BridgeError> {
    if is_finite_number(value) {
        Ok(value)
    } else {
        Err(BridgeError::protocol(format!(
            "{name} must be a finite number, got {value}"
        )))
    }
}

pub fn is_non_empty_string(value: &str) -> bool {
    !value.trim().is_empty()
}

pub fn assert_non_empty_string<'a>(value: &'a str, name: &str) -> Result<&'a str, BridgeError> {
    if is_non_empty_string(value) {
        Ok(value)
    } else {
        Err(BridgeError::protocol(format!("{name} must be a non-empty string")))
    }
}

/// Detects `..` segments, encoded dots/slashes and NUL bytes.
pub fn contains_path_traversal(path: &str) -> bool {
    if path.contains('\0') {
        return true;
    }
    let lower = path.to_ascii_lowercase();
    if lower.contains("%2e") || lower.contains("%2f") || lower.contains("%5c") {
        return true;
    }
    path.split(['/', '\\']).any(|segment| segment == "..")
}

pub fn assert_no_path_traversal<'a>(path: &'a str, name: &str) -> Result<&'a str, BridgeError> {
    if contains_path_traversal(path) {
        Err(BridgeError::protocol(format!(
            "{name} contains a path traversal sequence: {path:?}"
        )))
    } else {
        Ok(path)
    }
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

pub fn assert_identifier<'a>(name: &'a str, what: &str) -> Result<&'a str, BridgeError> {
    if is_identifier(name) {
        Ok(name)
    } else {
        Err(BridgeError::protocol(format!(
            "{what} must be an identifier, got {name:?}"
        )))
    }
}

/// Dotted module path: identifier segments separated by single dots.
pub fn assert_module_name(module: &str) -> Result<&str, BridgeError> {
    assert_non_empty_string(module, "module")?;
    assert_no_path_traversal(module, "module")?;
    if module.split('.').all(is_identifier) {
        Ok(module)
    } else {
        Err(BridgeError::protocol(format!(
            "module must be a dotted identifier path, got {module:?}"
        )))
    }
}

/// Location and value of the first non-finite float found in a value.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecialFloat {
    pub path: String,
    pub value: f64,
}

pub fn find_special_float<T: Serialize + ?Sized>(value: &T) -> Option<SpecialFloat> {
    match value.serialize(Probe) {
        Err(ProbeError::NonFinite { value, mut path }) => {
            path.reverse();
            Some(SpecialFloat {
                path: render_path(&path),
                value,
            })
        }
        _ => None,
    }
}

pub fn contains_special_floats<T: Serialize + ?Sized>(value: &T) -> bool {
    find_special_float(value).is_some()
}

pub fn assert_no_special_floats<T: Serialize + ?Sized>(
    value: &T,
    name: &str,
) -> Result<(), BridgeError> {
    match find_special_float(value) {
        Some(found) => Err(BridgeError::protocol(format!(
            "{name}{} contains non-finite number {} which cannot be transported",
            found.path, found.value
        ))),
        None => Ok(()),
    }
}

#[derive(Debug)]
enum Segment {
    Index(usize),
    Key(String),
}

fn render_path(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Index(i) => out.push_str(&format!("[{i}]")),
            Segment::Key(k) => {
                out.push('.');
                out.push_str(k);
            }
        }
    }
    out
}

#[derive(Debug, thiserror::Error)]
enum ProbeError {
    #[error("non-finite number {value}")]
    NonFinite { value: f64, path: Vec<Segment> },
    #[error("{0}")]
    Custom(String),
}

impl ProbeError {
    /// Path segments are pushed innermost first while unwinding.
    fn within(self, segment: Segment) -> Self {
        match self {
            Self::NonFinite { value, mut path } => {
                path.push(segment);
                Self::NonFinite { value, path }
            }
            other => other,
        }
    }
}

impl ser::Error for ProbeError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Self::Custom(msg.to_string())
    }
}

struct Probe;

impl ser::Serializer for Probe {
    type Ok = ();
    type Error = ProbeError;
    type SerializeSeq = SeqProbe;
    type SerializeTuple = SeqProbe;
    type SerializeTupleStruct = SeqProbe;
    type SerializeTupleVariant = SeqProbe;
    type SerializeMap = MapProbe;
    type SerializeStruct = MapProbe;
    type SerializeStructVariant = MapProbe;

    fn serialize_bool(self, _: bool) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_i8(self, _: i8) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_i16(self, _: i16) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_i32(self, _: i32) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_i64(self, _: i64) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_i128(self, _: i128) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_u8(self, _: u8) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_u16(self, _: u16) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_u32(self, _: u32) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_u64(self, _: u64) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_u128(self, _: u128) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_f32(self, v: f32) -> Result<(), ProbeError> {
        self.serialize_f64(f64::from(v))
    }
    fn serialize_f64(self, v: f64) -> Result<(), ProbeError> {
        if v.is_finite() {
            Ok(())
        } else {
            Err(ProbeError::NonFinite {
                value: v,
                path: Vec::new(),
            })
        }
    }
    fn serialize_char(self, _: char) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_str(self, _: &str) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_bytes(self, _: &[u8]) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_none(self) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), ProbeError> {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_unit_struct(self, _: &'static str) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_unit_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
    ) -> Result<(), ProbeError> {
        Ok(())
    }
    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), ProbeError> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        _: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<(), ProbeError> {
        value
            .serialize(Probe)
            .map_err(|e| e.within(Segment::Key(variant.to_string())))
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<SeqProbe, ProbeError> {
        Ok(SeqProbe { index: 0 })
    }
    fn serialize_tuple(self, _: usize) -> Result<SeqProbe, ProbeError> {
        Ok(SeqProbe { index: 0 })
    }
    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<SeqProbe, ProbeError> {
        Ok(SeqProbe { index: 0 })
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<SeqProbe, ProbeError> {
        Ok(SeqProbe { index: 0 })
    }
    fn serialize_map(self, _: Option<usize>) -> Result<MapProbe, ProbeError> {
        Ok(MapProbe { key: None })
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<MapProbe, ProbeError> {
        Ok(MapProbe { key: None })
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<MapProbe, ProbeError> {
        Ok(MapProbe { key: None })
    }
}

struct SeqProbe {
    index: usize,
}

impl SeqProbe {
    fn probe<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ProbeError> {
        let index = self.index;
        self.index += 1;
        value
            .serialize(Probe)
            .map_err(|e| e.within(Segment::Index(index)))
    }
}

impl SerializeSeq for SeqProbe {
    type Ok = ();
    type Error = ProbeError;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ProbeError> {
        self.probe(value)
    }
    fn end(self) -> Result<(), ProbeError> {
        Ok(())
    }
}

impl ser::SerializeTuple for SeqProbe {
    type Ok = ();
    type Error = ProbeError;
    fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ProbeError> {
        self.probe(value)
    }
    fn end(self) -> Result<(), ProbeError> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for SeqProbe {
    type Ok = ();
    type Error = ProbeError;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ProbeError> {
        self.probe(value)
    }
    fn end(self) -> Result<(), ProbeError> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for SeqProbe {
    type Ok = ();
    type Error = ProbeError;
    fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ProbeError> {
        self.probe(value)
    }
    fn end(self) -> Result<(), ProbeError> {
        Ok(())
    }
}

struct MapProbe {
    key: Option<String>,
}

fn key_label<T: ?Sized + Serialize>(key: &T) -> String {
    match serde_json::to_value(key) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => "?".to_string(),
    }
}

impl SerializeMap for MapProbe {
    type Ok = ();
    type Error = ProbeError;
    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), ProbeError> {
        let label = key_label(key);
        key.serialize(Probe)
            .map_err(|e| e.within(Segment::Key(label.clone())))?;
        self.key = Some(label);
        Ok(())
    }
    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), ProbeError> {
        let label = self.key.take().unwrap_or_default();
        value
            .serialize(Probe)
            .map_err(|e| e.within(Segment::Key(label)))
    }
    fn end(self) -> Result<(), ProbeError> {
        Ok(())
    }
}

impl SerializeStruct for MapProbe {
    type Ok = ();
    type Error = ProbeError;
    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), ProbeError> {
        value
            .serialize(Probe)
            .map_err(|e| e.within(Segment::Key(key.to_string())))
    }
    fn end(self) -> Result<(), ProbeError> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for MapProbe {
    type Ok = ();
    type Error = ProbeError;
    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), ProbeError> {
        value
            .serialize(Probe)
            .map_err(|e| e.within(Segment::Key(key.to_string())))
    }
    fn end(self) -> Result<(), ProbeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct Point {
        x: f64,
        y: f64,
    }

    #[derive(Serialize)]
    struct Series {
        name: String,
        points: Vec<Point>,
    }

    #[test]
    fn finite_numbers() {
        assert!(is_finite_number(1.5));
        assert!(!is_finite_number(f64::NAN));
        assert!(assert_finite_number(f64::NEG_INFINITY, "scale").is_err());
        assert_eq!(assert_finite_number(2.0, "scale").unwrap(), 2.0);
    }

    #[test]
    fn non_empty_strings() {
        assert!(assert_non_empty_string("math", "module").is_ok());
        assert!(assert_non_empty_string("   ", "module").is_err());
        assert!(assert_non_empty_string("", "module").is_err());
    }

    #[test]
    fn special_floats_are_located() {
        let clean = vec![1.0, 2.0, 3.0];
        assert!(!contains_special_floats(&clean));

        let dirty = vec![1.0, f64::NAN];
        let found = find_special_float(&dirty).unwrap();
        assert_eq!(found.path, "[1]");
        assert!(found.value.is_nan());

        let nested = Series {
            name: "s".to_string(),
            points: vec![Point { x: 0.0, y: 1.0 }, Point { x: 2.0, y: f64::INFINITY }],
        };
        let found = find_special_float(&nested).unwrap();
        assert_eq!(found.path, ".points[1].y");
    }

    #[test]
    fn special_floats_in_maps_and_options() {
        let mut map = BTreeMap::new();
        map.insert("ok", Some(1.0f32));
        map.insert("bad", Some(f32::NEG_INFINITY));
        let found = find_special_float(&map).unwrap();
        assert_eq!(found.path, ".bad");

        let err = assert_no_special_floats(&(1, f64::NAN), "args").unwrap_err();
        assert!(err.to_string().contains("args[1]"));
    }

    #[test]
    fn path_traversal_detection() {
        assert!(contains_path_traversal("../etc/passwd"));
        assert!(contains_path_traversal("a/../../b"));
        assert!(contains_path_traversal("..\\windows"));
        assert!(contains_path_traversal("%2e%2e/secret"));
        assert!(contains_path_traversal("name\0"));
        assert!(!contains_path_traversal("numpy.linalg"));
        assert!(!contains_path_traversal("/opt/venv"));
    }

    #[test]
    fn module_and_identifier_names() {
        assert!(assert_module_name("numpy.linalg").is_ok());
        assert!(assert_module_name("math").is_ok());
        assert!(assert_module_name("os..path").is_err());
        assert!(assert_module_name("../math").is_err());
        assert!(assert_module_name(".math").is_err());
        assert!(is_identifier("sqrt"));
        assert!(is_identifier("_private2"));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("has space"));
        assert!(!is_identifier(""));
    }
}
