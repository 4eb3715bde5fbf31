//! Wire value decoding
//!
//! Every value a backend hands us is turned into a [`Cell`]: either the
//! distinguished [`Cell::Null`] sentinel or a display string. Decoding is keyed
//! by the declared column type name and resolved through a [`TypeRegistry`],
//! which callers can extend at runtime (Postgres enums and domains are
//! registered as they are discovered).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

#[cfg(feature = "postgres")]
pub mod postgres;
pub mod sqlite;

/// Maximum number of domain-to-base hops followed while resolving a type
const MAX_DOMAIN_DEPTH: usize = 8;

/// A decoded result cell
///
/// Serializes as JSON `null` or as a string, so the NULL sentinel can never be
/// confused with an empty string or the text `"null"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Text(String),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Display text, `None` for NULL
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Null => None,
            Cell::Text(text) => Some(text),
        }
    }
}

impl From<String> for Cell {
    fn from(text: String) -> Self {
        Cell::Text(text)
    }
}

/// A raw SQLite value, by storage class
#[derive(Debug, Clone, Copy)]
pub enum SqliteWire<'a> {
    Null,
    Integer(i64),
    Real(f64),
    Text(&'a str),
    Blob(&'a [u8]),
}

/// A raw value from either backend
#[derive(Clone)]
pub enum WireValue<'a> {
    #[cfg(feature = "postgres")]
    Postgres(sqlx::postgres::PgValueRef<'a>),
    Sqlite(SqliteWire<'a>),
}

/// How values of a declared type are decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeCategory {
    Bool,
    Int2,
    Int4,
    Int8,
    Oid,
    Float4,
    Float8,
    Numeric,
    Money,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    TimeTz,
    Interval,
    Binary,
    Inet,
    Cidr,
    MacAddr,
    MacAddr8,
    Uuid,
    Json,
    Jsonb,
    Text,
    /// User-defined enum; the wire payload is the label
    Enum,
    /// Domain over the named base type
    Domain(String),
    /// One-dimensional or multi-dimensional array of the element category
    Array(Box<TypeCategory>),
}

/// Extensible mapping from declared type names to decoding categories
///
/// Built-in names match case-insensitively. Registered types keep their
/// exact catalog name, so `"MyEnum"` and `myenum` stay distinct.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    builtins: HashMap<String, TypeCategory>,
    registered: HashMap<String, TypeCategory>,
    /// Names already looked up in a catalog without a match
    unresolvable: HashSet<String>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl TypeRegistry {
    /// An empty registry; every type renders as unsupported
    pub fn empty() -> Self {
        Self {
            builtins: HashMap::new(),
            registered: HashMap::new(),
            unresolvable: HashSet::new(),
        }
    }

    /// Registry preloaded with the Postgres and SQLite built-in type names
    pub fn with_builtins() -> Self {
        use TypeCategory::*;

        let builtins: &[(&str, TypeCategory)] = &[
            ("BOOL", Bool),
            ("BOOLEAN", Bool),
            ("INT2", Int2),
            ("SMALLINT", Int2),
            ("SMALLSERIAL", Int2),
            ("INT4", Int4),
            ("INT", Int4),
            ("INTEGER", Int4),
            ("SERIAL", Int4),
            ("INT8", Int8),
            ("BIGINT", Int8),
            ("BIGSERIAL", Int8),
            ("OID", Oid),
            ("FLOAT4", Float4),
            ("REAL", Float4),
            ("FLOAT8", Float8),
            ("FLOAT", Float8),
            ("DOUBLE", Float8),
            ("DOUBLE PRECISION", Float8),
            ("NUMERIC", Numeric),
            ("DECIMAL", Numeric),
            ("MONEY", Money),
            ("TIMESTAMP", Timestamp),
            ("TIMESTAMP WITHOUT TIME ZONE", Timestamp),
            ("DATETIME", Timestamp),
            ("TIMESTAMPTZ", TimestampTz),
            ("TIMESTAMP WITH TIME ZONE", TimestampTz),
            ("DATE", Date),
            ("TIME", Time),
            ("TIME WITHOUT TIME ZONE", Time),
            ("TIMETZ", TimeTz),
            ("TIME WITH TIME ZONE", TimeTz),
            ("INTERVAL", Interval),
            ("BYTEA", Binary),
            ("BLOB", Binary),
            ("INET", Inet),
            ("CIDR", Cidr),
            ("MACADDR", MacAddr),
            ("MACADDR8", MacAddr8),
            ("UUID", Uuid),
            ("JSON", Json),
            ("JSONB", Jsonb),
            ("TEXT", Text),
            ("VARCHAR", Text),
            ("CHARACTER VARYING", Text),
            ("CHAR", Text),
            ("CHARACTER", Text),
            ("BPCHAR", Text),
            ("NAME", Text),
            ("CITEXT", Text),
            ("CLOB", Text),
            ("XML", Text),
            ("UNKNOWN", Text),
        ];

        let builtins = builtins
            .iter()
            .map(|(name, category)| ((*name).to_string(), category.clone()))
            .collect();

        Self {
            builtins,
            ..Self::empty()
        }
    }

    /// Register (or replace) the category for an exact type name
    pub fn register(&mut self, type_name: &str, category: TypeCategory) {
        let name = exact_type_name(type_name);
        self.unresolvable.remove(&name);
        self.registered.insert(name, category);
    }

    pub fn register_enum(&mut self, type_name: &str) {
        self.register(type_name, TypeCategory::Enum);
    }

    pub fn register_domain(&mut self, type_name: &str, base_type: &str) {
        self.register(type_name, TypeCategory::Domain(exact_type_name(base_type)));
    }

    /// Remember that a catalog has no entry for this name
    pub fn mark_unresolvable(&mut self, type_name: &str) {
        self.unresolvable.insert(exact_type_name(type_name));
    }

    /// Whether a catalog lookup for this name already came back empty
    pub fn is_unresolvable(&self, type_name: &str) -> bool {
        self.unresolvable.contains(&exact_type_name(type_name))
    }

    /// Whether the registry can resolve this declared type
    pub fn knows(&self, type_name: &str) -> bool {
        self.resolve(type_name).is_some()
    }

    /// Resolve a declared type name to its decoding category
    ///
    /// Domains are followed to their base type; `[]` suffixes resolve to an
    /// array of the element category.
    pub fn resolve(&self, type_name: &str) -> Option<TypeCategory> {
        self.resolve_at(&exact_type_name(type_name), 0)
    }

    fn resolve_at(&self, name: &str, depth: usize) -> Option<TypeCategory> {
        if depth > MAX_DOMAIN_DEPTH {
            return None;
        }

        if let Some(element) = name.strip_suffix("[]") {
            return self
                .resolve_at(element.trim_end(), depth + 1)
                .map(|category| TypeCategory::Array(Box::new(category)));
        }

        let category = self
            .registered
            .get(name)
            .or_else(|| self.builtins.get(&normalize_type_name(name)))?;
        match category {
            TypeCategory::Domain(base) => self.resolve_at(base, depth + 1),
            category => Some(category.clone()),
        }
    }

    /// Decode one wire value of the given declared type
    pub fn decode(&self, declared_type: &str, value: WireValue<'_>) -> Cell {
        match value {
            #[cfg(feature = "postgres")]
            WireValue::Postgres(value) => {
                use sqlx::ValueRef;

                if value.is_null() {
                    return Cell::Null;
                }
                let decoded = self
                    .resolve(declared_type)
                    .and_then(|category| postgres::decode(&category, value));
                Cell::Text(decoded.unwrap_or_else(|| unsupported(declared_type)))
            }
            WireValue::Sqlite(wire) => {
                sqlite::decode(self.resolve(declared_type).as_ref(), wire)
            }
        }
    }
}

/// Decode with the built-in registry
pub fn decode(declared_type: &str, value: WireValue<'_>) -> Cell {
    static BUILTINS: OnceLock<TypeRegistry> = OnceLock::new();
    BUILTINS
        .get_or_init(TypeRegistry::with_builtins)
        .decode(declared_type, value)
}

/// Placeholder shown for values whose type cannot be rendered
pub fn unsupported(declared_type: &str) -> String {
    format!("<{}>", declared_type.trim().to_lowercase())
}

/// Registered type key: modifiers removed, whitespace collapsed, case kept
fn exact_type_name(type_name: &str) -> String {
    let mut stripped = String::with_capacity(type_name.len());
    let mut depth = 0usize;

    for character in type_name.chars() {
        match character {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => stripped.push(character),
            _ => {}
        }
    }

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical built-in key: upper case, modifiers such as `(10,2)` removed,
/// whitespace collapsed
pub fn normalize_type_name(type_name: &str) -> String {
    exact_type_name(type_name).to_uppercase()
}

/// Lowercase hex without prefix
pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_null_is_sentinel_for_every_type() {
        for type_name in ["INTEGER", "TEXT", "BLOB", "REAL", "BOOLEAN", "", "GEOMETRY"] {
            assert_eq!(decode(type_name, WireValue::Sqlite(SqliteWire::Null)), Cell::Null);
        }
    }

    #[test]
    fn test_null_serializes_as_json_null() {
        let cells = vec![Cell::Null, Cell::Text(String::new())];
        let json = serde_json::to_string(&cells).unwrap();
        assert_eq!(json, r#"[null,""]"#);
    }

    #[test]
    fn test_normalize_type_name() {
        assert_eq!(normalize_type_name("character varying(20)"), "CHARACTER VARYING");
        assert_eq!(
            normalize_type_name("timestamp(3)  with time zone"),
            "TIMESTAMP WITH TIME ZONE"
        );
        assert_eq!(normalize_type_name("numeric(10, 2)"), "NUMERIC");
        assert_eq!(normalize_type_name("int4[]"), "INT4[]");
    }

    #[test]
    fn test_builtins_resolve_case_insensitively() {
        let registry = TypeRegistry::default();
        assert_eq!(registry.resolve("int4"), Some(TypeCategory::Int4));
        assert_eq!(registry.resolve("Numeric(10,2)"), Some(TypeCategory::Numeric));
        assert_eq!(registry.resolve("CIDR"), Some(TypeCategory::Cidr));
        assert_eq!(registry.resolve("point"), None);
    }

    #[test]
    fn test_unknown_type_renders_bracketed_name() {
        assert_eq!(unsupported("POINT"), "<point>");
        assert_eq!(unsupported(" MyEnum "), "<myenum>");
    }

    #[test]
    fn test_registered_enum_resolves() {
        let mut registry = TypeRegistry::default();
        assert!(!registry.knows("mood"));

        registry.register_enum("mood");
        assert_eq!(registry.resolve("mood"), Some(TypeCategory::Enum));
        assert_eq!(
            registry.resolve("mood[]"),
            Some(TypeCategory::Array(Box::new(TypeCategory::Enum)))
        );
    }

    #[test]
    fn test_registered_names_keep_their_case() {
        let mut registry = TypeRegistry::default();
        registry.register_enum("MyEnum");

        assert_eq!(registry.resolve("MyEnum"), Some(TypeCategory::Enum));
        assert_eq!(registry.resolve("myenum"), None);
        assert_eq!(registry.resolve("MYENUM"), None);
    }

    #[test]
    fn test_unresolvable_names_are_remembered() {
        let mut registry = TypeRegistry::default();
        registry.mark_unresolvable("ltree");
        assert!(registry.is_unresolvable("ltree"));
        assert!(!registry.is_unresolvable("LTREE"));

        // A later registration wins over the negative entry
        registry.register_enum("ltree");
        assert!(!registry.is_unresolvable("ltree"));
        assert!(registry.knows("ltree"));
    }

    #[test]
    fn test_domain_resolves_to_base_type() {
        let mut registry = TypeRegistry::default();
        registry.register_domain("positive_int", "int4");
        assert_eq!(registry.resolve("positive_int"), Some(TypeCategory::Int4));

        registry.register_enum("Mood");
        registry.register_domain("Feeling", "Mood");
        assert_eq!(registry.resolve("Feeling"), Some(TypeCategory::Enum));
    }

    #[test]
    fn test_domain_cycle_does_not_recurse_forever() {
        let mut registry = TypeRegistry::empty();
        registry.register_domain("a", "b");
        registry.register_domain("b", "a");
        assert_eq!(registry.resolve("a"), None);
    }

    #[test]
    fn test_array_resolution() {
        let registry = TypeRegistry::default();
        assert_eq!(
            registry.resolve("TEXT[]"),
            Some(TypeCategory::Array(Box::new(TypeCategory::Text)))
        );
        assert_eq!(registry.resolve("point[]"), None);
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0xde, 0xad, 0x00, 0x0f]), "dead000f");
        assert_eq!(hex(&[]), "");
    }
}
