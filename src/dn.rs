//! distinguished names (DNs) and relative distinguished names (RDNs) as they
//! appear in audit log messages and LDIF change records
//!
//! the parsers follow RFC 4514 but are lenient about whitespace around the
//! separators, the way most directory servers are

use chumsky::prelude::*;
use ldap_types::basic::ChumskyError;

use std::fmt::Display;
use std::str::FromStr;

/// one attribute type and value pair of a relative distinguished name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeTypeAndValue {
    /// the attribute type, either a name or a numeric OID
    pub attribute_type: String,
    /// the attribute value with all escapes resolved
    pub value: String,
}

impl AttributeTypeAndValue {
    /// create a new attribute type and value pair
    pub fn new(attribute_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute_type: attribute_type.into(),
            value: value.into(),
        }
    }

    /// check if this pair names the given attribute and value
    ///
    /// the attribute type is compared ASCII case insensitively, the value
    /// case insensitively since nearly all naming attributes use a case
    /// ignoring equality matching rule
    pub fn matches(&self, attribute_type: &str, value: &str) -> bool {
        self.attribute_type.eq_ignore_ascii_case(attribute_type)
            && self.value.to_lowercase() == value.to_lowercase()
    }
}

impl Display for AttributeTypeAndValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}={}",
            self.attribute_type,
            ldap3::dn_escape(self.value.as_str())
        )
    }
}

/// a relative distinguished name, one or more attribute type and value pairs
/// joined by `+`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelativeDistinguishedName {
    /// the components in the order they were written
    components: Vec<AttributeTypeAndValue>,
}

impl RelativeDistinguishedName {
    /// create an RDN from its components, returns None if there are none
    pub fn new(components: Vec<AttributeTypeAndValue>) -> Option<Self> {
        if components.is_empty() {
            None
        } else {
            Some(Self { components })
        }
    }

    /// the components of this RDN
    pub fn components(&self) -> &[AttributeTypeAndValue] {
        &self.components
    }

    /// check if one of the components names the given attribute and value
    pub fn contains(&self, attribute_type: &str, value: &str) -> bool {
        self.components
            .iter()
            .any(|ava| ava.matches(attribute_type, value))
    }

    /// the components of this RDN which do not occur in the other RDN
    pub fn difference<'a>(
        &'a self,
        other: &'a RelativeDistinguishedName,
    ) -> impl Iterator<Item = &'a AttributeTypeAndValue> + 'a {
        self.components
            .iter()
            .filter(move |ava| !other.contains(&ava.attribute_type, &ava.value))
    }

    /// check if both RDNs denote the same set of attribute values,
    /// ignoring component order and case
    pub fn same_values_as(&self, other: &RelativeDistinguishedName) -> bool {
        self.difference(other).next().is_none() && other.difference(self).next().is_none()
    }
}

impl Display for RelativeDistinguishedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", itertools::join(self.components.iter(), "+"))
    }
}

impl FromStr for RelativeDistinguishedName {
    type Err = ChumskyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_rdn(s)
    }
}

/// a distinguished name, the RDNs from the entry itself up to the naming context
///
/// the root DN has no RDNs at all
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DistinguishedName {
    /// the RDNs, leftmost (the entry's own RDN) first
    rdns: Vec<RelativeDistinguishedName>,
}

impl DistinguishedName {
    /// create a DN from its RDNs, leftmost first
    pub fn new(rdns: Vec<RelativeDistinguishedName>) -> Self {
        Self { rdns }
    }

    /// the RDNs of this DN, leftmost first
    pub fn rdns(&self) -> &[RelativeDistinguishedName] {
        &self.rdns
    }

    /// is this the empty root DN
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// the entry's own RDN, None for the root DN
    pub fn rdn(&self) -> Option<&RelativeDistinguishedName> {
        self.rdns.first()
    }

    /// the DN of the parent entry, None for the root DN
    pub fn parent(&self) -> Option<DistinguishedName> {
        if self.is_root() {
            None
        } else {
            Some(Self {
                rdns: self.rdns[1..].to_vec(),
            })
        }
    }

    /// the DN of a child entry with the given RDN below this DN
    pub fn child(&self, rdn: RelativeDistinguishedName) -> DistinguishedName {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend(self.rdns.iter().cloned());
        Self { rdns }
    }
}

impl Display for DistinguishedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", itertools::join(self.rdns.iter(), ","))
    }
}

impl FromStr for DistinguishedName {
    type Err = ChumskyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_dn(s)
    }
}

/// the pieces an attribute value is assembled from
#[derive(Debug, Clone)]
enum ValuePiece {
    /// a literal character
    Char(char),
    /// a character preceded by a backslash
    Escaped(char),
    /// a hex escaped byte, possibly part of a multi-byte UTF-8 sequence
    Byte(u8),
}

/// turn the parsed pieces of a value into a string, dropping unescaped
/// leading and trailing whitespace
fn assemble_value(pieces: Vec<ValuePiece>) -> Result<String, std::string::FromUtf8Error> {
    let is_padding = |p: &ValuePiece| matches!(p, ValuePiece::Char(c) if c.is_whitespace());
    let start = pieces
        .iter()
        .position(|p| !is_padding(p))
        .unwrap_or(pieces.len());
    let end = pieces
        .iter()
        .rposition(|p| !is_padding(p))
        .map(|i| i + 1)
        .unwrap_or(start);
    let mut bytes = Vec::new();
    for piece in &pieces[start..end] {
        match piece {
            ValuePiece::Char(c) | ValuePiece::Escaped(c) => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            ValuePiece::Byte(b) => bytes.push(*b),
        }
    }
    String::from_utf8(bytes)
}

/// parses two hex digits into a byte
fn hex_pair_parser() -> impl Parser<char, u8, Error = Simple<char>> + Clone {
    filter(|c: &char| c.is_ascii_hexdigit())
        .then(filter(|c: &char| c.is_ascii_hexdigit()))
        .map(|(high, low)| {
            (high.to_digit(16).unwrap_or_default() * 16 + low.to_digit(16).unwrap_or_default())
                as u8
        })
}

/// parses an attribute type, either a keystring or a numeric OID
pub fn attribute_type_parser() -> impl Parser<char, String, Error = Simple<char>> + Clone {
    let keystring = filter(|c: &char| c.is_ascii_alphabetic())
        .chain(filter(|c: &char| c.is_ascii_alphanumeric() || *c == '-').repeated())
        .collect::<String>();
    let numericoid = text::int(10)
        .separated_by(just('.'))
        .at_least(1)
        .map(|arcs: Vec<String>| arcs.join("."));
    keystring.or(numericoid).labelled("attribute type")
}

/// parses an attribute value, either a `#` prefixed hex string or a string
/// with backslash escapes
pub fn attribute_value_parser() -> impl Parser<char, String, Error = Simple<char>> + Clone {
    let hex_string = just('#')
        .ignore_then(hex_pair_parser().repeated().at_least(1))
        .try_map(|bytes, span| {
            String::from_utf8(bytes).map_err(|err| Simple::custom(span, err.to_string()))
        });
    let escape = just('\\').ignore_then(
        hex_pair_parser()
            .map(ValuePiece::Byte)
            .or(any().map(ValuePiece::Escaped)),
    );
    let plain = filter(|c: &char| !matches!(c, ',' | '+' | ';' | '"' | '\\' | '<' | '>'))
        .map(ValuePiece::Char);
    let string = escape
        .or(plain)
        .repeated()
        .try_map(|pieces, span| {
            assemble_value(pieces).map_err(|err| Simple::custom(span, err.to_string()))
        });
    hex_string.or(string).labelled("attribute value")
}

/// parses an attribute type and value pair
pub fn attribute_type_and_value_parser(
) -> impl Parser<char, AttributeTypeAndValue, Error = Simple<char>> + Clone {
    attribute_type_parser()
        .then_ignore(just('=').padded())
        .then(attribute_value_parser())
        .map(|(attribute_type, value)| AttributeTypeAndValue {
            attribute_type,
            value,
        })
}

/// parses a relative distinguished name without consuming the rest of the input
pub fn rdn_parser() -> impl Parser<char, RelativeDistinguishedName, Error = Simple<char>> + Clone
{
    attribute_type_and_value_parser()
        .separated_by(just('+').padded())
        .at_least(1)
        .map(|components| RelativeDistinguishedName { components })
        .labelled("relative distinguished name")
}

/// parses a complete distinguished name, the empty string being the root DN
pub fn dn_parser() -> impl Parser<char, DistinguishedName, Error = Simple<char>> {
    rdn_parser()
        .separated_by(one_of(",;").padded())
        .map(|rdns| DistinguishedName { rdns })
        .padded()
        .then_ignore(end())
        .labelled("distinguished name")
}

/// parse a distinguished name
pub fn parse_dn(src: &str) -> Result<DistinguishedName, ChumskyError> {
    match dn_parser().parse_recovery(src) {
        (Some(dn), _) => Ok(dn),
        (_, errs) => Err(ChumskyError {
            description: "distinguished name".to_string(),
            source: src.to_string(),
            errors: errs,
        }),
    }
}

/// parse a relative distinguished name, the whole input has to be consumed
pub fn parse_rdn(src: &str) -> Result<RelativeDistinguishedName, ChumskyError> {
    match rdn_parser().padded().then_ignore(end()).parse_recovery(src) {
        (Some(rdn), _) => Ok(rdn),
        (_, errs) => Err(ChumskyError {
            description: "relative distinguished name".to_string(),
            source: src.to_string(),
            errors: errs,
        }),
    }
}
