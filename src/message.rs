//! the audit log message, a decoded and immutable view of the lines the
//! directory server logged for one change operation

use chrono::{DateTime, FixedOffset};
use thiserror::Error;
use tracing::instrument;

use std::fmt::Display;

use crate::comments::{
    decode_attribute_modifications, decode_deleted_entry_attributes, AttributeModificationsBlock,
};
use crate::header::{AuditLogHeader, HeaderError};
use crate::ldif::{parse_change_record, Attribute, Change, ChangeRecord, ChangeType, LdifError, ModifyDn};
use crate::modification::Modification;
use crate::revert::{
    revert_add, revert_delete, revert_modify, revert_modify_dn, NonRevertibleReason, RevertError,
};

/// errors which prevent an audit log message from being decoded
#[derive(Debug, Error)]
pub enum AuditLogMessageError {
    /// no lines were given
    #[error("an audit log message needs at least one line")]
    EmptyMessage,
    /// the header line could not be decoded
    #[error("malformed audit log message header: {0}")]
    MalformedHeader(#[from] HeaderError),
    /// the LDIF lines are not a valid change record
    #[error("invalid change record lines: {0}")]
    InvalidChangeRecord(#[from] LdifError),
    /// the change record is of a different type than expected
    #[error("expected a {expected} change record but found a {found} change record")]
    UnexpectedChangeType {
        /// the expected change type
        expected: ChangeType,
        /// the change type found in the message
        found: ChangeType,
    },
}

/// an audit log message for one add, delete, modify or modify DN operation
///
/// the original lines are kept verbatim, everything else is decoded from them
/// once at construction; optional parts which fail to decode are simply absent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLogMessage {
    /// the lines as they were logged
    raw_lines: Vec<String>,
    /// the decoded header line
    header: AuditLogHeader,
    /// the change the operation made
    change_record: ChangeRecord,
    /// the attribute modifications comment
    attribute_modifications: AttributeModificationsBlock,
    /// the attributes of a deleted entry if they were logged
    deleted_entry_attributes: Option<Vec<Attribute>>,
}

impl AuditLogMessage {
    /// decode a message from its lines
    ///
    /// the first line is the header, the `#` comment lines after it carry the
    /// attribute modifications and the remaining lines the LDIF change record
    #[instrument(skip(lines))]
    pub fn decode<S: AsRef<str>>(lines: &[S]) -> Result<Self, AuditLogMessageError> {
        let raw_lines = Self::raw_lines_from(lines)?;
        let change_record = parse_change_record(&raw_lines[1..])?;
        Self::assemble(raw_lines, change_record)
    }

    /// decode a message, failing if it is not of the expected change type
    #[instrument(skip(lines))]
    pub fn decode_expecting<S: AsRef<str>>(
        lines: &[S],
        expected: ChangeType,
    ) -> Result<Self, AuditLogMessageError> {
        let message = Self::decode(lines)?;
        let found = message.change_type();
        if found != expected {
            return Err(AuditLogMessageError::UnexpectedChangeType { expected, found });
        }
        Ok(message)
    }

    /// build a message from its lines and a change record which was already
    /// decoded from them, the LDIF lines are not parsed again
    #[instrument(skip(lines, change_record))]
    pub fn with_change_record<S: AsRef<str>>(
        lines: &[S],
        change_record: ChangeRecord,
    ) -> Result<Self, AuditLogMessageError> {
        Self::assemble(Self::raw_lines_from(lines)?, change_record)
    }

    /// copy the lines, there has to be at least one
    fn raw_lines_from<S: AsRef<str>>(lines: &[S]) -> Result<Vec<String>, AuditLogMessageError> {
        if lines.is_empty() {
            return Err(AuditLogMessageError::EmptyMessage);
        }
        Ok(lines.iter().map(|l| l.as_ref().to_string()).collect())
    }

    /// decode header and comments and combine them with the change record
    fn assemble(
        raw_lines: Vec<String>,
        change_record: ChangeRecord,
    ) -> Result<Self, AuditLogMessageError> {
        let header = AuditLogHeader::parse(&raw_lines[0])?;
        let comment_lines: Vec<&str> = raw_lines[1..]
            .iter()
            .map(String::as_str)
            .filter(|l| l.starts_with('#'))
            .collect();
        let attribute_modifications = decode_attribute_modifications(&comment_lines);
        let deleted_entry_attributes = match change_record.change_type() {
            ChangeType::Delete => decode_deleted_entry_attributes(&comment_lines),
            ChangeType::Add | ChangeType::Modify | ChangeType::ModifyDn => None,
        };
        tracing::trace!(
            "Decoded {} audit log message for {}",
            change_record.change_type(),
            change_record.dn
        );
        Ok(Self {
            raw_lines,
            header,
            change_record,
            attribute_modifications,
            deleted_entry_attributes,
        })
    }

    /// the lines exactly as they were logged
    pub fn raw_lines(&self) -> &[String] {
        &self.raw_lines
    }

    /// all decoded header fields
    pub fn header(&self) -> &AuditLogHeader {
        &self.header
    }

    /// when the operation was processed
    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.header.timestamp
    }

    /// the name of the directory server product
    pub fn product_name(&self) -> Option<&str> {
        self.header.product_name.as_deref()
    }

    /// the name of the server instance
    pub fn instance_name(&self) -> Option<&str> {
        self.header.instance_name.as_deref()
    }

    /// identifies the server startup the message was logged in
    pub fn startup_id(&self) -> Option<&str> {
        self.header.startup_id.as_deref()
    }

    /// the thread which processed the operation
    pub fn thread_id(&self) -> Option<i64> {
        self.header.thread_id
    }

    /// the DN of the user which requested the operation
    pub fn requester_dn(&self) -> Option<&str> {
        self.header.requester_dn.as_deref()
    }

    /// the IP address of the client which requested the operation
    pub fn requester_ip(&self) -> Option<&str> {
        self.header.requester_ip.as_deref()
    }

    /// the connection the operation was requested on
    pub fn connection_id(&self) -> Option<i64> {
        self.header.connection_id
    }

    /// the operation id within the connection
    pub fn operation_id(&self) -> Option<i64> {
        self.header.operation_id
    }

    /// the connection of the operation which triggered this one
    pub fn triggered_by_connection_id(&self) -> Option<i64> {
        self.header.triggered_by_connection_id
    }

    /// the operation which triggered this one
    pub fn triggered_by_operation_id(&self) -> Option<i64> {
        self.header.triggered_by_operation_id
    }

    /// the replication change id if the operation was replicated
    pub fn replication_change_id(&self) -> Option<&str> {
        self.header.replication_change_id.as_deref()
    }

    /// the DN the operation was authorized as
    pub fn alternate_authorization_dn(&self) -> Option<&str> {
        self.header.alternate_authorization_dn.as_deref()
    }

    /// the transaction the operation was part of
    pub fn transaction_id(&self) -> Option<&str> {
        self.header.transaction_id.as_deref()
    }

    /// where the operation originated
    pub fn origin(&self) -> Option<&str> {
        self.header.origin.as_deref()
    }

    /// whether an administrative session worker thread processed the operation
    pub fn uses_admin_session_worker_thread(&self) -> Option<bool> {
        self.header.uses_admin_session_worker_thread
    }

    /// the OIDs of the request controls
    pub fn request_control_oids(&self) -> Option<&[String]> {
        self.header.request_control_oids.as_deref()
    }

    /// the operation purpose request control
    pub fn operation_purpose(&self) -> Option<&str> {
        self.header.operation_purpose.as_deref()
    }

    /// the intermediate client request control
    pub fn intermediate_client_request_control(&self) -> Option<&str> {
        self.header.intermediate_client_request_control.as_deref()
    }

    /// a header field this library has no accessor for
    pub fn unknown_header_field(&self, key: &str) -> Option<&str> {
        self.header.unknown_fields.get(key).map(String::as_str)
    }

    /// the change the operation made
    pub fn change_record(&self) -> &ChangeRecord {
        &self.change_record
    }

    /// the kind of change
    pub fn change_type(&self) -> ChangeType {
        self.change_record.change_type()
    }

    /// the DN of the changed entry
    pub fn dn(&self) -> &str {
        &self.change_record.dn
    }

    /// the rename details of a modify DN message
    pub fn modify_dn(&self) -> Option<&ModifyDn> {
        match &self.change_record.change {
            Change::ModifyDn(modify_dn) => Some(modify_dn),
            Change::Add { .. } | Change::Delete | Change::Modify { .. } => None,
        }
    }

    /// the attribute modifications declared in the comments, None if the
    /// comment block is missing or could not be parsed
    pub fn attribute_modifications(&self) -> Option<&[Modification]> {
        self.attribute_modifications.modifications()
    }

    /// the attribute modifications comment including why it is unavailable
    pub fn attribute_modifications_block(&self) -> &AttributeModificationsBlock {
        &self.attribute_modifications
    }

    /// the attributes of the deleted entry, for delete messages which logged them
    pub fn deleted_entry_attributes(&self) -> Option<&[Attribute]> {
        self.deleted_entry_attributes.as_deref()
    }

    /// compute the revert, or the first reason preventing it
    fn revert(&self) -> Result<Vec<ChangeRecord>, NonRevertibleReason> {
        let dn = self.dn();
        match &self.change_record.change {
            Change::Add { .. } => revert_add(dn),
            Change::Delete => revert_delete(dn, self.deleted_entry_attributes()),
            Change::Modify { modifications } => revert_modify(dn, modifications),
            Change::ModifyDn(modify_dn) => {
                revert_modify_dn(dn, modify_dn, &self.attribute_modifications)
            }
        }
    }

    /// whether the change records reverting this message can be computed
    pub fn is_revertible(&self) -> bool {
        self.revert().is_ok()
    }

    /// why the message can not be reverted, None if it can
    pub fn non_revertible_reason(&self) -> Option<NonRevertibleReason> {
        self.revert().err()
    }

    /// the change records which, applied in order, undo this message's change
    pub fn revert_change_records(&self) -> Result<Vec<ChangeRecord>, RevertError> {
        Ok(self.revert()?)
    }

    /// the message as logged, one line per original line
    pub fn to_multi_line_string(&self) -> String {
        itertools::join(&self.raw_lines, "\n")
    }

    /// the message on a single line, the original lines separated by spaces
    pub fn to_single_line_string(&self) -> String {
        itertools::join(&self.raw_lines, " ")
    }
}

impl Display for AuditLogMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_single_line_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modification::ModificationType;
    use pretty_assertions::assert_eq;

    const HEADER: &str = "# 24/Mar/2024:10:11:12.345 -0500; conn=5; op=12; productName=\"Example Directory Server\"; requesterDN=\"cn=Directory Manager\"";

    fn rename_lines() -> Vec<&'static str> {
        vec![
            HEADER,
            "# ModifyDN attribute modifications (count=2)",
            "# delete: uid",
            "# uid: jdoe",
            "# -",
            "# add: uid",
            "# uid: john.doe",
            "dn: uid=jdoe,ou=People,dc=example,dc=com",
            "changetype: moddn",
            "newrdn: uid=john.doe",
            "deleteoldrdn: 1",
        ]
    }

    #[test]
    fn decodes_modify_dn_message() {
        let message = AuditLogMessage::decode(&rename_lines()).unwrap();
        assert_eq!(message.change_type(), ChangeType::ModifyDn);
        assert_eq!(message.dn(), "uid=jdoe,ou=People,dc=example,dc=com");
        assert_eq!(message.connection_id(), Some(5));
        assert_eq!(message.operation_id(), Some(12));
        assert_eq!(message.product_name(), Some("Example Directory Server"));
        assert_eq!(message.requester_dn(), Some("cn=Directory Manager"));
        assert_eq!(message.thread_id(), None);
        assert_eq!(
            message.modify_dn(),
            Some(&ModifyDn {
                new_rdn: "uid=john.doe".to_string(),
                delete_old_rdn: true,
                new_superior: None,
            })
        );
        assert_eq!(
            message.attribute_modifications().map(|m| m.len()),
            Some(2)
        );
        assert_eq!(
            message.attribute_modifications().unwrap()[0].modification_type,
            ModificationType::Delete
        );
        assert!(message.is_revertible());
        assert_eq!(message.non_revertible_reason(), None);
    }

    #[test]
    fn renders_original_lines() {
        let lines = rename_lines();
        let message = AuditLogMessage::decode(&lines).unwrap();
        assert_eq!(message.raw_lines(), lines.as_slice());
        assert_eq!(message.to_multi_line_string(), lines.join("\n"));
        assert_eq!(message.to_single_line_string(), lines.join(" "));
        assert_eq!(message.to_string(), lines.join(" "));
    }

    #[test]
    fn construction_failures() {
        assert!(matches!(
            AuditLogMessage::decode::<&str>(&[]),
            Err(AuditLogMessageError::EmptyMessage)
        ));
        let mut lines = rename_lines();
        lines[0] = "# not a timestamp; conn=5";
        assert!(matches!(
            AuditLogMessage::decode(&lines),
            Err(AuditLogMessageError::MalformedHeader(_))
        ));
        let mut lines = rename_lines();
        lines[8] = "changetype: rename";
        assert!(matches!(
            AuditLogMessage::decode(&lines),
            Err(AuditLogMessageError::InvalidChangeRecord(_))
        ));
        assert!(matches!(
            AuditLogMessage::decode_expecting(&rename_lines(), ChangeType::Modify),
            Err(AuditLogMessageError::UnexpectedChangeType {
                expected: ChangeType::Modify,
                found: ChangeType::ModifyDn,
            })
        ));
        assert!(AuditLogMessage::decode_expecting(&rename_lines(), ChangeType::ModifyDn).is_ok());
    }

    #[test]
    fn with_precomputed_change_record() {
        let lines = rename_lines();
        let record = ChangeRecord::modify_dn(
            "uid=jdoe,ou=People,dc=example,dc=com",
            "uid=john.doe",
            true,
            None,
        );
        let message = AuditLogMessage::with_change_record(&lines, record.clone()).unwrap();
        assert_eq!(message.change_record(), &record);
        assert_eq!(message, AuditLogMessage::decode(&lines).unwrap());
    }

    #[test]
    fn malformed_modification_comment_is_not_fatal() {
        let mut lines = rename_lines();
        lines[2] = "# rename: uid";
        let message = AuditLogMessage::decode(&lines).unwrap();
        assert_eq!(message.attribute_modifications(), None);
        assert_eq!(
            message.attribute_modifications_block(),
            &AttributeModificationsBlock::Unparsable
        );
        assert!(!message.is_revertible());
        assert_eq!(
            message.revert_change_records(),
            Err(RevertError::NotRevertible(
                NonRevertibleReason::UnparsableAttributeModifications
            ))
        );
    }

    #[test]
    fn delete_message_with_recorded_attributes() {
        let message = AuditLogMessage::decode(&[
            HEADER,
            "# Deleted entry attributes",
            "# objectClass: top",
            "# objectClass: account",
            "# uid: jdoe",
            "dn: uid=jdoe,ou=People,dc=example,dc=com",
            "changetype: delete",
        ])
        .unwrap();
        assert_eq!(message.change_type(), ChangeType::Delete);
        let records = message.revert_change_records().unwrap();
        assert_eq!(
            records,
            vec![ChangeRecord::add(
                "uid=jdoe,ou=People,dc=example,dc=com",
                vec![
                    Attribute {
                        name: "objectClass".to_string(),
                        values: vec!["top".to_string(), "account".to_string()],
                    },
                    Attribute {
                        name: "uid".to_string(),
                        values: vec!["jdoe".to_string()],
                    },
                ]
            )]
        );
    }

    #[test]
    fn delete_message_without_recorded_attributes() {
        let message = AuditLogMessage::decode(&[
            HEADER,
            "dn: uid=jdoe,ou=People,dc=example,dc=com",
            "changetype: delete",
        ])
        .unwrap();
        assert_eq!(
            message.non_revertible_reason(),
            Some(NonRevertibleReason::MissingDeletedEntryAttributes)
        );
    }
}
