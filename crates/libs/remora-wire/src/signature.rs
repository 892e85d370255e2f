//! Method signatures of the form `Name(T1;T2;...) Ret`.
//!
//! A signature string is the only thing client and server compare to bind a
//! call to an operation, so [`Signature`] formatting and parsing are exact
//! inverses. Primitive types render as small numeric codes; everything else
//! renders as a structural name:
//!
//! | type             | rendering |
//! |------------------|-----------|
//! | primitive        | `3`..`18` |
//! | nothing          | `void`    |
//! | byte stream      | `stream`  |
//! | byte buffer      | `bytes`   |
//! | structured value | `Name`    |
//! | remote contract  | `@Name`   |
//!
//! By-ref and out parameters carry a trailing `&`.

use std::fmt;
use std::str::FromStr;

use crate::WireError;

const VOID: &str = "void";
const STREAM: &str = "stream";
const BYTES: &str = "bytes";
const CONTRACT_SIGIL: char = '@';
const BY_REF_SUFFIX: char = '&';

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Bool,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    String,
    Void,
    Stream,
    Bytes,
    /// A structured value carried through the serde codec.
    Named(String),
    /// A remote service reference.
    Contract(String),
}

impl TypeTag {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn contract(name: impl Into<String>) -> Self {
        Self::Contract(name.into())
    }

    /// Numeric wire code for primitives.
    pub fn code(&self) -> Option<u8> {
        Some(match self {
            Self::Bool => 3,
            Self::Char => 4,
            Self::I8 => 5,
            Self::U8 => 6,
            Self::I16 => 7,
            Self::U16 => 8,
            Self::I32 => 9,
            Self::U32 => 10,
            Self::I64 => 11,
            Self::U64 => 12,
            Self::F32 => 13,
            Self::F64 => 14,
            Self::String => 18,
            _ => return None,
        })
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            3 => Self::Bool,
            4 => Self::Char,
            5 => Self::I8,
            6 => Self::U8,
            7 => Self::I16,
            8 => Self::U16,
            9 => Self::I32,
            10 => Self::U32,
            11 => Self::I64,
            12 => Self::U64,
            13 => Self::F32,
            14 => Self::F64,
            18 => Self::String,
            _ => return None,
        })
    }

    pub fn is_primitive(&self) -> bool {
        self.code().is_some()
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code() {
            return write!(f, "{code}");
        }
        match self {
            Self::Void => f.write_str(VOID),
            Self::Stream => f.write_str(STREAM),
            Self::Bytes => f.write_str(BYTES),
            Self::Named(name) => f.write_str(name),
            Self::Contract(name) => write!(f, "{CONTRACT_SIGIL}{name}"),
            _ => Ok(()),
        }
    }
}

impl FromStr for TypeTag {
    type Err = WireError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(WireError::signature(raw, "empty type"));
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            let code = raw
                .parse::<u8>()
                .map_err(|_| WireError::signature(raw, "type code out of range"))?;
            return Self::from_code(code)
                .ok_or_else(|| WireError::signature(raw, format!("unknown type code {code}")));
        }
        match raw {
            VOID => return Ok(Self::Void),
            STREAM => return Ok(Self::Stream),
            BYTES => return Ok(Self::Bytes),
            _ => {}
        }
        if let Some(name) = raw.strip_prefix(CONTRACT_SIGIL) {
            validate_type_name(raw, name)?;
            return Ok(Self::Contract(name.to_string()));
        }
        validate_type_name(raw, raw)?;
        Ok(Self::Named(raw.to_string()))
    }
}

fn validate_type_name(input: &str, name: &str) -> Result<(), WireError> {
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_alphabetic() || c == '_');
    if !first_ok || !chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
        return Err(WireError::signature(input, format!("`{name}` is not a valid type name")));
    }
    if matches!(name, VOID | STREAM | BYTES) {
        return Err(WireError::signature(input, format!("`{name}` is reserved")));
    }
    Ok(())
}

/// One parameter position: its type and whether it is passed by reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParamType {
    pub ty: TypeTag,
    pub by_ref: bool,
}

impl ParamType {
    pub fn value(ty: TypeTag) -> Self {
        Self { ty, by_ref: false }
    }

    pub fn by_ref(ty: TypeTag) -> Self {
        Self { ty, by_ref: true }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ty)?;
        if self.by_ref {
            write!(f, "{BY_REF_SUFFIX}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Signature {
    pub name: String,
    pub params: Vec<ParamType>,
    pub returns: TypeTag,
}

impl Signature {
    pub fn new(name: impl Into<String>, params: Vec<ParamType>, returns: TypeTag) -> Self {
        Self { name: name.into(), params, returns }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (index, param) in self.params.iter().enumerate() {
            if index > 0 {
                f.write_str(";")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ") {}", self.returns)
    }
}

impl FromStr for Signature {
    type Err = WireError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let open = input.find('(').ok_or_else(|| WireError::signature(input, "missing `(`"))?;
        let close = input.rfind(')').ok_or_else(|| WireError::signature(input, "missing `)`"))?;
        if close < open {
            return Err(WireError::signature(input, "`)` before `(`"));
        }

        let name = input[..open].trim();
        let mut chars = name.chars();
        let name_ok = chars.next().is_some_and(|c| c.is_alphabetic() || c == '_')
            && chars.all(|c| c.is_alphanumeric() || c == '_');
        if !name_ok {
            return Err(WireError::signature(input, "invalid method name"));
        }

        let inner = input[open + 1..close].trim();
        let mut params = Vec::new();
        if !inner.is_empty() {
            for part in inner.split(';') {
                let part = part.trim();
                let (raw, by_ref) = match part.strip_suffix(BY_REF_SUFFIX) {
                    Some(raw) => (raw, true),
                    None => (part, false),
                };
                let ty: TypeTag = raw.parse()?;
                if ty.is_void() {
                    return Err(WireError::signature(input, "parameters cannot be void"));
                }
                params.push(ParamType { ty, by_ref });
            }
        }

        let ret = input[close + 1..].trim();
        if ret.is_empty() {
            return Err(WireError::signature(input, "missing return type"));
        }
        let returns = ret.parse()?;
        Ok(Self { name: name.to_string(), params, returns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_render_as_codes() {
        let sig = Signature::new(
            "Add",
            vec![ParamType::value(TypeTag::I32), ParamType::value(TypeTag::I32)],
            TypeTag::I32,
        );
        assert_eq!(sig.to_string(), "Add(9;9) 9");

        let sig = Signature::new(
            "RefTest",
            vec![
                ParamType::value(TypeTag::String),
                ParamType::by_ref(TypeTag::String),
                ParamType::value(TypeTag::String),
            ],
            TypeTag::String,
        );
        assert_eq!(sig.to_string(), "RefTest(18;18&;18) 18");

        let sig = Signature::new("GetInterface", vec![], TypeTag::contract("ValueSource"));
        assert_eq!(sig.to_string(), "GetInterface() @ValueSource");
    }

    #[test]
    fn structural_types_survive_a_parse() {
        for text in [
            "Upload(stream;bytes) void",
            "Move(geo.Point_3&;@Mover) 11",
            "GetInterface(18) @ValueSource",
            "OutTest(18&) void",
        ] {
            let parsed: Signature = text.parse().expect("parse");
            assert_eq!(parsed.to_string(), text);
        }
        let parsed: Signature = "Move(geo.Point_3&;@Mover) 11".parse().expect("parse");
        assert_eq!(parsed.params[0], ParamType::by_ref(TypeTag::named("geo.Point_3")));
        assert_eq!(parsed.params[1], ParamType::value(TypeTag::contract("Mover")));
    }

    fn primitive_tags() -> Vec<TypeTag> {
        [3u8, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 18]
            .into_iter()
            .map(|code| TypeTag::from_code(code).expect("primitive code"))
            .collect()
    }

    #[test]
    fn every_type_round_trips_in_every_position() {
        let mut value_types = primitive_tags();
        value_types.extend([
            TypeTag::Stream,
            TypeTag::Bytes,
            TypeTag::named("geo.Point"),
            TypeTag::contract("Mover"),
        ]);
        let params: Vec<ParamType> = value_types
            .iter()
            .flat_map(|ty| [ParamType::value(ty.clone()), ParamType::by_ref(ty.clone())])
            .collect();
        let mut returns = value_types.clone();
        returns.push(TypeTag::Void);

        // 11 is coprime with the 34 params, so every param visits every slot.
        let stride = 11;
        let mut checked = 0;
        for arity in 0..=3 {
            for ret in &returns {
                for offset in 0..params.len() {
                    let picked = (0..arity)
                        .map(|slot| params[(offset + slot * stride) % params.len()].clone())
                        .collect();
                    let sig = Signature::new("Call", picked, ret.clone());
                    let parsed: Signature = sig.to_string().parse().expect("parse");
                    assert_eq!(parsed, sig, "{sig}");
                    checked += 1;
                }
            }
        }
        assert_eq!(checked, 4 * returns.len() * params.len());
    }

    #[test]
    fn parse_tolerates_surrounding_whitespace() {
        let parsed: Signature = "  Add ( 9 ; 9 )   9 ".parse().expect("parse");
        assert_eq!(parsed.name, "Add");
        assert_eq!(parsed.params.len(), 2);
        assert_eq!(parsed.returns, TypeTag::I32);
    }

    #[test]
    fn parse_rejects_malformed_input() {
        for bad in [
            "Add",
            "Add(9;9)",
            "(9) 9",
            "Add(9;;9) 9",
            "Add(99) 9",
            "Add(void) 9",
            "Add(9) @",
            "Add(9) 9&",
            "1Add(9) 9",
            "Add)9( 9",
        ] {
            assert!(bad.parse::<Signature>().is_err(), "{bad} should not parse");
        }
    }
}
