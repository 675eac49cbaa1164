//! deciding whether an audit logged change can be reverted and computing the
//! change records which revert it
//!
//! everything here is a pure function of already decoded values

use thiserror::Error;
use tracing::instrument;

use crate::comments::AttributeModificationsBlock;
use crate::dn::{parse_dn, parse_rdn, AttributeTypeAndValue, DistinguishedName};
use crate::ldif::{Attribute, ChangeRecord, ModifyDn};
use crate::modification::{InversionError, Modification, ModificationType};

/// why an audit log message can not be reverted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NonRevertibleReason {
    /// the DN of the entry is not a valid distinguished name
    #[error("the DN {0:?} is not a valid distinguished name")]
    InvalidDn(String),
    /// the root DN can not be renamed
    #[error("the root DN can not be renamed")]
    RootDn,
    /// the new RDN is not a valid relative distinguished name
    #[error("the new RDN {0:?} is not a valid relative distinguished name")]
    InvalidNewRdn(String),
    /// the new superior is not a valid distinguished name
    #[error("the new superior DN {0:?} is not a valid distinguished name")]
    InvalidNewSuperior(String),
    /// there was no attribute modifications comment
    #[error("the message does not describe the attribute modifications of the operation")]
    MissingAttributeModifications,
    /// the attribute modifications comment could not be parsed
    #[error("the attribute modifications of the operation could not be parsed")]
    UnparsableAttributeModifications,
    /// one of the modifications has no inverse
    #[error("modification can not be inverted: {0}")]
    NotInvertible(#[from] InversionError),
    /// the old RDN value was deleted without the modifications recording it
    #[error("the old RDN value {0} was deleted but the modifications do not record it")]
    UnrecoverableOldRdnValue(String),
    /// a delete message which did not record the attributes of the entry
    #[error("the attributes of the deleted entry were not recorded")]
    MissingDeletedEntryAttributes,
}

/// errors returned when asking for the revert of a message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RevertError {
    /// the message can not be reverted
    #[error("the audit log message is not revertible: {0}")]
    NotRevertible(#[from] NonRevertibleReason),
}

/// parse the DN of the changed entry
fn entry_dn(dn: &str) -> Result<DistinguishedName, NonRevertibleReason> {
    parse_dn(dn).map_err(|err| {
        tracing::debug!("Could not parse DN {:?}: {}", dn, err);
        NonRevertibleReason::InvalidDn(dn.to_string())
    })
}

/// check if a modification of the given type covers the attribute value
fn covered_by(
    modifications: &[Modification],
    modification_type: ModificationType,
    ava: &AttributeTypeAndValue,
) -> bool {
    modifications.iter().any(|m| {
        m.modification_type == modification_type
            && m.is_for_attribute(&ava.attribute_type)
            && m.values.iter().any(|v| ava.matches(&ava.attribute_type, v))
    })
}

/// compute the change records reverting a modify DN operation
///
/// the first record renames the entry back, the second one (if present)
/// undoes the attribute modifications the rename alone does not undo; it
/// targets the original DN since it is applied after the rename
#[instrument(skip(modify_dn, attribute_modifications))]
pub fn revert_modify_dn(
    dn: &str,
    modify_dn: &ModifyDn,
    attribute_modifications: &AttributeModificationsBlock,
) -> Result<Vec<ChangeRecord>, NonRevertibleReason> {
    let current_dn = entry_dn(dn)?;
    let (old_rdn, parent) = match (current_dn.rdn(), current_dn.parent()) {
        (Some(old_rdn), Some(parent)) => (old_rdn.clone(), parent),
        _ => return Err(NonRevertibleReason::RootDn),
    };
    let new_rdn = parse_rdn(&modify_dn.new_rdn).map_err(|err| {
        tracing::debug!("Could not parse new RDN {:?}: {}", modify_dn.new_rdn, err);
        NonRevertibleReason::InvalidNewRdn(modify_dn.new_rdn.clone())
    })?;
    let new_superior = match &modify_dn.new_superior {
        Some(new_superior) => Some(parse_dn(new_superior).map_err(|err| {
            tracing::debug!("Could not parse new superior {:?}: {}", new_superior, err);
            NonRevertibleReason::InvalidNewSuperior(new_superior.clone())
        })?),
        None => None,
    };
    let modifications = match attribute_modifications {
        AttributeModificationsBlock::Absent => {
            return Err(NonRevertibleReason::MissingAttributeModifications)
        }
        AttributeModificationsBlock::Unparsable => {
            return Err(NonRevertibleReason::UnparsableAttributeModifications)
        }
        AttributeModificationsBlock::Declared(modifications) => modifications,
    };
    for m in modifications {
        m.inverse()?;
    }

    // values of the old RDN which are not part of the new one were lost if
    // deleteoldrdn was set, only the modifications can tell us they existed
    if modify_dn.delete_old_rdn && !old_rdn.same_values_as(&new_rdn) {
        if let Some(lost) = old_rdn
            .difference(&new_rdn)
            .find(|ava| !covered_by(modifications, ModificationType::Delete, ava))
        {
            return Err(NonRevertibleReason::UnrecoverableOldRdnValue(
                lost.to_string(),
            ));
        }
    }

    let introduced: Vec<&AttributeTypeAndValue> = new_rdn.difference(&old_rdn).collect();
    let revert_delete_old_rdn = if introduced.is_empty() {
        modify_dn.delete_old_rdn
    } else {
        introduced
            .iter()
            .all(|ava| covered_by(modifications, ModificationType::Add, ava))
    };
    tracing::trace!(
        "Reverting rename of {} to {} with deleteoldrdn {}",
        dn,
        new_rdn,
        revert_delete_old_rdn
    );

    // drop the values the reverse rename restores or removes by itself
    let mut remaining = vec![];
    for m in modifications {
        let restored_by_rename = |value: &String| match m.modification_type {
            ModificationType::Delete => old_rdn.contains(&m.attribute, value),
            ModificationType::Add => {
                revert_delete_old_rdn
                    && introduced
                        .iter()
                        .any(|ava| ava.matches(&m.attribute, value))
            }
            ModificationType::Replace | ModificationType::Increment => false,
        };
        let values: Vec<String> = m
            .values
            .iter()
            .filter(|v| !restored_by_rename(*v))
            .cloned()
            .collect();
        if !values.is_empty() {
            remaining.push(Modification::new(
                m.modification_type,
                m.attribute.clone(),
                values,
            ));
        }
    }
    let revert_modifications = remaining
        .iter()
        .rev()
        .map(Modification::inverse)
        .collect::<Result<Vec<_>, _>>()?;

    let resulting_dn = new_superior
        .as_ref()
        .unwrap_or(&parent)
        .child(new_rdn.clone());
    let mut records = vec![ChangeRecord::modify_dn(
        resulting_dn.to_string(),
        old_rdn.to_string(),
        revert_delete_old_rdn,
        new_superior.map(|_| parent.to_string()),
    )];
    if !revert_modifications.is_empty() {
        records.push(ChangeRecord::modify(dn, revert_modifications));
    }
    Ok(records)
}

/// compute the change record reverting an add, deleting the entry again
#[instrument]
pub fn revert_add(dn: &str) -> Result<Vec<ChangeRecord>, NonRevertibleReason> {
    entry_dn(dn)?;
    Ok(vec![ChangeRecord::delete(dn)])
}

/// compute the change record reverting a delete from the recorded attributes
#[instrument(skip(deleted_entry_attributes))]
pub fn revert_delete(
    dn: &str,
    deleted_entry_attributes: Option<&[Attribute]>,
) -> Result<Vec<ChangeRecord>, NonRevertibleReason> {
    entry_dn(dn)?;
    let attributes =
        deleted_entry_attributes.ok_or(NonRevertibleReason::MissingDeletedEntryAttributes)?;
    Ok(vec![ChangeRecord::add(dn, attributes.to_vec())])
}

/// compute the change record reverting a modify, the inverted modifications
/// in reverse order
#[instrument(skip(modifications))]
pub fn revert_modify(
    dn: &str,
    modifications: &[Modification],
) -> Result<Vec<ChangeRecord>, NonRevertibleReason> {
    entry_dn(dn)?;
    let revert_modifications = modifications
        .iter()
        .rev()
        .map(Modification::inverse)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(vec![ChangeRecord::modify(dn, revert_modifications)])
}
