//! attribute modifications as found in modify change records and in the
//! attribute modification comments of audit log messages

use std::collections::HashSet;
use std::fmt::Display;
use std::str::FromStr;

use thiserror::Error;

/// the four ways an LDAP modify operation can change the values of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModificationType {
    /// add values to the attribute
    Add,
    /// delete the given values, or the whole attribute if no values are given
    Delete,
    /// replace all values of the attribute with the given values
    Replace,
    /// add an integer amount to the single value of the attribute
    Increment,
}

impl ModificationType {
    /// the name used for this modification type in LDIF
    pub fn ldif_name(&self) -> &'static str {
        match self {
            ModificationType::Add => "add",
            ModificationType::Delete => "delete",
            ModificationType::Replace => "replace",
            ModificationType::Increment => "increment",
        }
    }
}

impl Display for ModificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.ldif_name())
    }
}

/// error returned when parsing an unknown modification type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown modification type {0}")]
pub struct UnknownModificationType(pub String);

impl FromStr for ModificationType {
    type Err = UnknownModificationType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "add" => Ok(ModificationType::Add),
            "delete" => Ok(ModificationType::Delete),
            "replace" => Ok(ModificationType::Replace),
            "increment" => Ok(ModificationType::Increment),
            _ => Err(UnknownModificationType(s.to_string())),
        }
    }
}

/// reasons why a modification has no inverse
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InversionError {
    /// a replace discards the previous values which can not be recovered
    #[error("the replace of attribute {0} discarded values which can not be recovered")]
    Replace(String),
    /// a delete without values removed the whole attribute
    #[error("the values removed from attribute {0} by deleting it are unknown")]
    UnknownDeletedValues(String),
    /// an increment without a single integer amount
    #[error("the increment of attribute {attribute} by {amount:?} can not be negated")]
    InvalidIncrementAmount {
        /// the incremented attribute
        attribute: String,
        /// the values of the increment modification
        amount: Vec<String>,
    },
}

/// a single attribute modification with its values in the order they were logged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    /// how the attribute was modified
    pub modification_type: ModificationType,
    /// the name of the modified attribute
    pub attribute: String,
    /// the values used in the modification, for an increment the amount
    pub values: Vec<String>,
}

impl Modification {
    /// create a new modification
    pub fn new(
        modification_type: ModificationType,
        attribute: impl Into<String>,
        values: Vec<String>,
    ) -> Self {
        Self {
            modification_type,
            attribute: attribute.into(),
            values,
        }
    }

    /// check if this modification applies to the given attribute
    pub fn is_for_attribute(&self, attribute: &str) -> bool {
        self.attribute.eq_ignore_ascii_case(attribute)
    }

    /// compute the modification which undoes this one
    ///
    /// adds and deletes swap with the same values, increments negate their
    /// amount, replaces and value-less deletes have no inverse
    pub fn inverse(&self) -> Result<Modification, InversionError> {
        match self.modification_type {
            ModificationType::Add => Ok(Modification::new(
                ModificationType::Delete,
                self.attribute.clone(),
                self.values.clone(),
            )),
            ModificationType::Delete => {
                if self.values.is_empty() {
                    Err(InversionError::UnknownDeletedValues(self.attribute.clone()))
                } else {
                    Ok(Modification::new(
                        ModificationType::Add,
                        self.attribute.clone(),
                        self.values.clone(),
                    ))
                }
            }
            ModificationType::Replace => Err(InversionError::Replace(self.attribute.clone())),
            ModificationType::Increment => {
                let invalid = || InversionError::InvalidIncrementAmount {
                    attribute: self.attribute.clone(),
                    amount: self.values.clone(),
                };
                let [amount] = self.values.as_slice() else {
                    return Err(invalid());
                };
                let negated = amount
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .and_then(i64::checked_neg)
                    .ok_or_else(invalid)?;
                Ok(Modification::new(
                    ModificationType::Increment,
                    self.attribute.clone(),
                    vec![negated.to_string()],
                ))
            }
        }
    }

    /// convert into the modification type used by ldap3 to send modify requests
    pub fn to_ldap3_mod(&self) -> ldap3::Mod<String> {
        let attribute = self.attribute.clone();
        let values = || self.values.iter().cloned().collect::<HashSet<String>>();
        match self.modification_type {
            ModificationType::Add => ldap3::Mod::Add(attribute, values()),
            ModificationType::Delete => ldap3::Mod::Delete(attribute, values()),
            ModificationType::Replace => ldap3::Mod::Replace(attribute, values()),
            ModificationType::Increment => ldap3::Mod::Increment(
                attribute,
                self.values.first().cloned().unwrap_or_default(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn modification(t: ModificationType, attribute: &str, values: &[&str]) -> Modification {
        Modification::new(t, attribute, values.iter().map(|v| v.to_string()).collect())
    }

    #[test]
    fn parses_modification_types_case_insensitively() {
        assert_eq!("ADD".parse(), Ok(ModificationType::Add));
        assert_eq!(" delete ".parse(), Ok(ModificationType::Delete));
        assert_eq!("Increment".parse(), Ok(ModificationType::Increment));
        assert_eq!(
            "modify".parse::<ModificationType>(),
            Err(UnknownModificationType("modify".to_string()))
        );
    }

    #[test]
    fn add_and_delete_swap() {
        let add = modification(ModificationType::Add, "mail", &["a@example.com", "b@example.com"]);
        let inverse = add.inverse().unwrap();
        assert_eq!(
            inverse,
            modification(ModificationType::Delete, "mail", &["a@example.com", "b@example.com"])
        );
        assert_eq!(inverse.inverse().unwrap(), add);
    }

    #[test]
    fn increment_negates_amount() {
        let increment = modification(ModificationType::Increment, "loginCount", &["5"]);
        assert_eq!(
            increment.inverse().unwrap(),
            modification(ModificationType::Increment, "loginCount", &["-5"])
        );
        let decrement = modification(ModificationType::Increment, "loginCount", &["-3"]);
        assert_eq!(
            decrement.inverse().unwrap(),
            modification(ModificationType::Increment, "loginCount", &["3"])
        );
    }

    #[test]
    fn non_invertible_modifications() {
        assert_eq!(
            modification(ModificationType::Replace, "sn", &["Smith"]).inverse(),
            Err(InversionError::Replace("sn".to_string()))
        );
        assert_eq!(
            modification(ModificationType::Delete, "description", &[]).inverse(),
            Err(InversionError::UnknownDeletedValues("description".to_string()))
        );
        assert!(modification(ModificationType::Increment, "loginCount", &["many"])
            .inverse()
            .is_err());
        assert!(modification(ModificationType::Increment, "loginCount", &["1", "2"])
            .inverse()
            .is_err());
    }

    #[test]
    fn converts_to_ldap3_mods() {
        let m = modification(ModificationType::Add, "mail", &["a@example.com"]);
        assert_eq!(
            m.to_ldap3_mod(),
            ldap3::Mod::Add(
                "mail".to_string(),
                HashSet::from(["a@example.com".to_string()])
            )
        );
        let m = modification(ModificationType::Increment, "loginCount", &["2"]);
        assert_eq!(
            m.to_ldap3_mod(),
            ldap3::Mod::Increment("loginCount".to_string(), "2".to_string())
        );
    }
}
