//! decoding and rendering of single LDIF change records (RFC 2849)

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

use std::fmt::Display;

use crate::modification::{Modification, ModificationType, UnknownModificationType};

/// the kind of change a change record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeType {
    /// a new entry was added
    Add,
    /// an entry was deleted
    Delete,
    /// attributes of an entry were modified
    Modify,
    /// an entry was renamed and/or moved
    ModifyDn,
}

impl Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Add => write!(f, "add"),
            ChangeType::Delete => write!(f, "delete"),
            ChangeType::Modify => write!(f, "modify"),
            ChangeType::ModifyDn => write!(f, "moddn"),
        }
    }
}

/// an attribute with its values in the order they were given
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// the attribute name
    pub name: String,
    /// the attribute values
    pub values: Vec<String>,
}

/// group name/value pairs into attributes, keeping the order in which each
/// attribute first appeared
pub fn group_attributes<I>(pairs: I) -> Vec<Attribute>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut attributes: Vec<Attribute> = vec![];
    for (name, value) in pairs {
        match attributes
            .iter_mut()
            .find(|a| a.name.eq_ignore_ascii_case(&name))
        {
            Some(attribute) => attribute.values.push(value),
            None => attributes.push(Attribute {
                name,
                values: vec![value],
            }),
        }
    }
    attributes
}

/// the payload of a modify DN change record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDn {
    /// the new RDN of the entry
    pub new_rdn: String,
    /// whether the attribute values of the old RDN are removed from the entry
    pub delete_old_rdn: bool,
    /// the DN of the new parent entry if the entry was moved
    pub new_superior: Option<String>,
}

/// the change type specific part of a change record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// add an entry with the given attributes
    Add {
        /// the attributes of the new entry
        attributes: Vec<Attribute>,
    },
    /// delete the entry
    Delete,
    /// apply the modifications in order
    Modify {
        /// the modifications
        modifications: Vec<Modification>,
    },
    /// rename and/or move the entry
    ModifyDn(ModifyDn),
}

/// a single LDIF change record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// the DN of the entry the change applies to
    pub dn: String,
    /// the change itself
    pub change: Change,
}

impl ChangeRecord {
    /// a change record adding an entry
    pub fn add(dn: impl Into<String>, attributes: Vec<Attribute>) -> Self {
        Self {
            dn: dn.into(),
            change: Change::Add { attributes },
        }
    }

    /// a change record deleting an entry
    pub fn delete(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            change: Change::Delete,
        }
    }

    /// a change record modifying an entry
    pub fn modify(dn: impl Into<String>, modifications: Vec<Modification>) -> Self {
        Self {
            dn: dn.into(),
            change: Change::Modify { modifications },
        }
    }

    /// a change record renaming and/or moving an entry
    pub fn modify_dn(
        dn: impl Into<String>,
        new_rdn: impl Into<String>,
        delete_old_rdn: bool,
        new_superior: Option<String>,
    ) -> Self {
        Self {
            dn: dn.into(),
            change: Change::ModifyDn(ModifyDn {
                new_rdn: new_rdn.into(),
                delete_old_rdn,
                new_superior,
            }),
        }
    }

    /// the kind of change
    pub fn change_type(&self) -> ChangeType {
        match self.change {
            Change::Add { .. } => ChangeType::Add,
            Change::Delete => ChangeType::Delete,
            Change::Modify { .. } => ChangeType::Modify,
            Change::ModifyDn(_) => ChangeType::ModifyDn,
        }
    }

    /// render the change record as unfolded LDIF lines
    pub fn to_ldif_lines(&self) -> Vec<String> {
        let mut lines = vec![ldif_line("dn", &self.dn)];
        lines.push(format!("changetype: {}", self.change_type()));
        match &self.change {
            Change::Add { attributes } => {
                for attribute in attributes {
                    for value in &attribute.values {
                        lines.push(ldif_line(&attribute.name, value));
                    }
                }
            }
            Change::Delete => {}
            Change::Modify { modifications } => {
                for m in modifications {
                    lines.push(format!("{}: {}", m.modification_type, m.attribute));
                    for value in &m.values {
                        lines.push(ldif_line(&m.attribute, value));
                    }
                    lines.push("-".to_string());
                }
            }
            Change::ModifyDn(modify_dn) => {
                lines.push(ldif_line("newrdn", &modify_dn.new_rdn));
                lines.push(format!(
                    "deleteoldrdn: {}",
                    if modify_dn.delete_old_rdn { 1 } else { 0 }
                ));
                if let Some(new_superior) = &modify_dn.new_superior {
                    lines.push(ldif_line("newsuperior", new_superior));
                }
            }
        }
        lines
    }
}

impl Display for ChangeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", itertools::join(self.to_ldif_lines(), "\n"))
    }
}

/// values which can be written after a single colon without base64 encoding
fn is_safe_string(value: &str) -> bool {
    let starts_safe = !value.starts_with([' ', ':', '<']);
    let ends_safe = !value.ends_with(' ');
    starts_safe
        && ends_safe
        && value
            .chars()
            .all(|c| c.is_ascii() && !matches!(c, '\0' | '\n' | '\r'))
}

/// render one attribute value line, base64 encoding the value when needed
pub fn ldif_line(name: &str, value: &str) -> String {
    if value.is_empty() {
        format!("{}:", name)
    } else if is_safe_string(value) {
        format!("{}: {}", name, value)
    } else {
        format!("{}:: {}", name, STANDARD.encode(value.as_bytes()))
    }
}

/// errors which can happen while decoding an LDIF change record
#[derive(Debug, Error)]
pub enum LdifError {
    /// there were no LDIF lines at all
    #[error("the change record does not contain any LDIF lines")]
    Empty,
    /// a line without a colon which is not a modify separator
    #[error("malformed LDIF line: {0}")]
    MalformedLine(String),
    /// the record did not start with a dn line
    #[error("expected the dn line, found: {0}")]
    MissingDn(String),
    /// a base64 encoded value could not be decoded
    #[error("base64 decoding error: {0}")]
    Base64Error(#[from] base64::DecodeError),
    /// a base64 encoded value was not valid UTF-8
    #[error("UTF-8 decoding error: {0}")]
    Utf8Error(#[from] std::string::FromUtf8Error),
    /// values loaded from URLs are not supported
    #[error("URL values are not supported: {0}")]
    UrlValue(String),
    /// the changetype line named an unknown change type
    #[error("unknown change type {0}")]
    UnknownChangeType(String),
    /// a modify block started with an unknown modification type
    #[error("modification type error: {0}")]
    UnknownModificationType(#[from] UnknownModificationType),
    /// a line which does not belong in a change record of this type
    #[error("unexpected line in {change_type} change record: {line}")]
    UnexpectedLine {
        /// the change type of the record
        change_type: ChangeType,
        /// the offending line
        line: String,
    },
    /// a required field of a modify DN record is missing
    #[error("modify DN change record is missing {0}")]
    MissingField(&'static str),
    /// deleteoldrdn must be 0 or 1
    #[error("invalid deleteoldrdn value {0}")]
    InvalidDeleteOldRdn(String),
    /// a modify record without modifications
    #[error("modify change record without modifications")]
    NoModifications,
    /// an increment needs exactly one value
    #[error("increment of attribute {0} needs exactly one value")]
    InvalidIncrement(String),
}

/// one logical (unfolded) LDIF line
#[derive(Debug, Clone, PartialEq, Eq)]
enum LdifLine {
    /// a name and its decoded value
    Value(String, String),
    /// the `-` line terminating a modify block
    Separator,
}

impl LdifLine {
    /// render the line again for error messages
    fn describe(&self) -> String {
        match self {
            LdifLine::Value(name, value) => format!("{}: {}", name, value),
            LdifLine::Separator => "-".to_string(),
        }
    }
}

/// join folded lines and drop comments and empty lines
fn unfold<S: AsRef<str>>(lines: &[S]) -> Vec<String> {
    let mut result: Vec<String> = vec![];
    let mut in_comment = false;
    for line in lines {
        let line = line.as_ref().trim_end_matches(['\r', '\n']);
        if let Some(continuation) = line.strip_prefix(' ') {
            if in_comment {
                continue;
            }
            if let Some(last) = result.last_mut() {
                last.push_str(continuation);
                continue;
            }
        }
        in_comment = line.starts_with('#');
        if in_comment || line.trim().is_empty() {
            continue;
        }
        result.push(line.to_string());
    }
    result
}

/// split a logical line into its name and decoded value
fn parse_line(line: &str) -> Result<LdifLine, LdifError> {
    if line.trim() == "-" {
        return Ok(LdifLine::Separator);
    }
    let Some((name, rest)) = line.split_once(':') else {
        return Err(LdifError::MalformedLine(line.to_string()));
    };
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(LdifError::MalformedLine(line.to_string()));
    }
    if let Some(encoded) = rest.strip_prefix(':') {
        let bytes = STANDARD.decode(encoded.trim())?;
        Ok(LdifLine::Value(name, String::from_utf8(bytes)?))
    } else if rest.starts_with('<') {
        Err(LdifError::UrlValue(line.to_string()))
    } else {
        Ok(LdifLine::Value(name, rest.trim_start_matches(' ').to_string()))
    }
}

/// decode a single change record from LDIF lines
///
/// comment lines are skipped, so the complete body of an audit log message
/// can be passed in; a record without a changetype line is an add
#[instrument(skip(lines))]
pub fn parse_change_record<S: AsRef<str>>(lines: &[S]) -> Result<ChangeRecord, LdifError> {
    let mut parsed = unfold(lines)
        .iter()
        .map(|l| parse_line(l))
        .collect::<Result<Vec<LdifLine>, LdifError>>()?
        .into_iter()
        .peekable();

    if let Some(LdifLine::Value(name, _)) = parsed.peek() {
        if name.eq_ignore_ascii_case("version") {
            parsed.next();
        }
    }

    let dn = match parsed.next() {
        None => return Err(LdifError::Empty),
        Some(LdifLine::Value(name, value)) if name.eq_ignore_ascii_case("dn") => value,
        Some(other) => return Err(LdifError::MissingDn(other.describe())),
    };

    while let Some(LdifLine::Value(name, _)) = parsed.peek() {
        if name.eq_ignore_ascii_case("control") {
            tracing::trace!("Skipping control line in change record for {}", dn);
            parsed.next();
        } else {
            break;
        }
    }

    let change_type = match parsed.peek() {
        Some(LdifLine::Value(name, value)) if name.eq_ignore_ascii_case("changetype") => {
            let change_type = match value.trim().to_lowercase().as_str() {
                "add" => ChangeType::Add,
                "delete" => ChangeType::Delete,
                "modify" => ChangeType::Modify,
                "moddn" | "modrdn" => ChangeType::ModifyDn,
                other => return Err(LdifError::UnknownChangeType(other.to_string())),
            };
            parsed.next();
            change_type
        }
        _ => ChangeType::Add,
    };
    tracing::trace!("Decoding {} change record for {}", change_type, dn);

    let rest: Vec<LdifLine> = parsed.collect();
    let change = match change_type {
        ChangeType::Add => Change::Add {
            attributes: parse_add(rest)?,
        },
        ChangeType::Delete => {
            if let Some(line) = rest.first() {
                return Err(LdifError::UnexpectedLine {
                    change_type,
                    line: line.describe(),
                });
            }
            Change::Delete
        }
        ChangeType::Modify => Change::Modify {
            modifications: parse_modifications(rest)?,
        },
        ChangeType::ModifyDn => Change::ModifyDn(parse_modify_dn(rest)?),
    };
    Ok(ChangeRecord { dn, change })
}

/// the attributes of an add record
fn parse_add(lines: Vec<LdifLine>) -> Result<Vec<Attribute>, LdifError> {
    let pairs = lines
        .into_iter()
        .map(|line| match line {
            LdifLine::Value(name, value) => Ok((name, value)),
            LdifLine::Separator => Err(LdifError::UnexpectedLine {
                change_type: ChangeType::Add,
                line: "-".to_string(),
            }),
        })
        .collect::<Result<Vec<_>, LdifError>>()?;
    Ok(group_attributes(pairs))
}

/// the modification blocks of a modify record
fn parse_modifications(lines: Vec<LdifLine>) -> Result<Vec<Modification>, LdifError> {
    let mut modifications = vec![];
    let mut lines = lines.into_iter().peekable();
    while let Some(line) = lines.next() {
        let LdifLine::Value(modification_type, attribute) = line else {
            return Err(LdifError::UnexpectedLine {
                change_type: ChangeType::Modify,
                line: "-".to_string(),
            });
        };
        let modification_type: ModificationType = modification_type.parse()?;
        let attribute = attribute.trim().to_string();
        let mut values = vec![];
        loop {
            match lines.next() {
                None | Some(LdifLine::Separator) => break,
                Some(LdifLine::Value(name, value)) if name.eq_ignore_ascii_case(&attribute) => {
                    values.push(value)
                }
                Some(other) => {
                    return Err(LdifError::UnexpectedLine {
                        change_type: ChangeType::Modify,
                        line: other.describe(),
                    })
                }
            }
        }
        if modification_type == ModificationType::Increment && values.len() != 1 {
            return Err(LdifError::InvalidIncrement(attribute));
        }
        modifications.push(Modification::new(modification_type, attribute, values));
    }
    if modifications.is_empty() {
        return Err(LdifError::NoModifications);
    }
    Ok(modifications)
}

/// the fields of a modify DN record
fn parse_modify_dn(lines: Vec<LdifLine>) -> Result<ModifyDn, LdifError> {
    let mut new_rdn = None;
    let mut delete_old_rdn = None;
    let mut new_superior = None;
    for line in lines {
        match line {
            LdifLine::Value(name, value) if name.eq_ignore_ascii_case("newrdn") => {
                new_rdn = Some(value)
            }
            LdifLine::Value(name, value) if name.eq_ignore_ascii_case("deleteoldrdn") => {
                delete_old_rdn = Some(match value.trim() {
                    "1" => true,
                    "0" => false,
                    v if v.eq_ignore_ascii_case("true") => true,
                    v if v.eq_ignore_ascii_case("false") => false,
                    _ => return Err(LdifError::InvalidDeleteOldRdn(value)),
                })
            }
            LdifLine::Value(name, value) if name.eq_ignore_ascii_case("newsuperior") => {
                new_superior = Some(value)
            }
            other => {
                return Err(LdifError::UnexpectedLine {
                    change_type: ChangeType::ModifyDn,
                    line: other.describe(),
                })
            }
        }
    }
    Ok(ModifyDn {
        new_rdn: new_rdn.ok_or(LdifError::MissingField("newrdn"))?,
        delete_old_rdn: delete_old_rdn.ok_or(LdifError::MissingField("deleteoldrdn"))?,
        new_superior,
    })
}
