//! the header line of an audit log message
//!
//! the header is a timestamp followed by `; key=value` pairs, e.g.
//!
//! ```text
//! # 24/Mar/2024:10:11:12.345 -0500; conn=5; op=12; requesterDN="cn=Directory Manager"
//! ```
//!
//! values are either unquoted runs up to the next unescaped `;`, double
//! quoted strings or brace delimited blocks which may nest and contain
//! quoted strings of their own

use chrono::{DateTime, FixedOffset};
use oid::ObjectIdentifier;
use thiserror::Error;
use tracing::instrument;

use std::collections::BTreeMap;
use std::str::FromStr;

/// the format of the timestamp at the start of the header
pub const TIMESTAMP_FORMAT: &str = "%d/%b/%Y:%H:%M:%S%.3f %z";

/// errors which make a header line unusable
#[derive(Debug, Error)]
pub enum HeaderError {
    /// the header line is empty
    #[error("the audit log header line is empty")]
    EmptyHeader,
    /// the timestamp could not be parsed
    #[error("malformed audit log header timestamp {timestamp:?}: {source}")]
    MalformedTimestamp {
        /// the text which should have been a timestamp
        timestamp: String,
        /// the error from the timestamp parser
        #[source]
        source: chrono::ParseError,
    },
}

/// a raw key and value from the header, quotes removed but otherwise uninterpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderToken {
    /// the key in front of the `=`
    pub key: String,
    /// the value after the `=`
    pub value: String,
}

/// a header split into its timestamp and the key/value tokens following it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedHeader {
    /// the unparsed timestamp text
    pub timestamp: String,
    /// the well formed key/value pairs in the order they appeared
    pub tokens: Vec<HeaderToken>,
}

/// the index of the next `;` outside of double quotes at or after `pos`
fn find_separator(chars: &[char], mut pos: usize) -> usize {
    let mut in_quotes = false;
    while pos < chars.len() {
        match chars[pos] {
            '\\' => pos += 1,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => return pos,
            _ => {}
        }
        pos += 1;
    }
    chars.len()
}

/// skip whitespace starting at `pos`
fn skip_whitespace(chars: &[char], mut pos: usize) -> usize {
    while pos < chars.len() && chars[pos].is_whitespace() {
        pos += 1;
    }
    pos
}

/// scan a double quoted string whose opening quote is at `open`
///
/// returns the unescaped content and the index after the closing quote
fn scan_quoted(chars: &[char], open: usize) -> Option<(String, usize)> {
    let mut value = String::new();
    let mut pos = open + 1;
    while pos < chars.len() {
        match chars[pos] {
            '\\' if matches!(chars.get(pos + 1), Some('"') | Some('\\')) => {
                value.push(chars[pos + 1]);
                pos += 2;
                continue;
            }
            '"' => return Some((value, pos + 1)),
            c => value.push(c),
        }
        pos += 1;
    }
    None
}

/// find the brace matching the one at `open` by counting depth, skipping
/// over quoted strings inside the block
///
/// returns the index after the closing brace
fn scan_braces(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut pos = open;
    while pos < chars.len() {
        match (chars[pos], in_quotes) {
            ('\\', _) => pos += 1,
            ('"', _) => in_quotes = !in_quotes,
            ('{', false) => depth += 1,
            ('}', false) => {
                depth -= 1;
                if depth == 0 {
                    return Some(pos + 1);
                }
            }
            _ => {}
        }
        pos += 1;
    }
    None
}

/// scan an unquoted value up to the next unescaped `;`, resolving `\;`
fn scan_unquoted(chars: &[char], start: usize) -> (String, usize) {
    let mut value = String::new();
    let mut pos = start;
    while pos < chars.len() {
        match chars[pos] {
            '\\' if chars.get(pos + 1) == Some(&';') => {
                value.push(';');
                pos += 2;
                continue;
            }
            ';' => break,
            c => value.push(c),
        }
        pos += 1;
    }
    (value.trim_end().to_string(), pos)
}

/// scan one `key=value` pair starting after a `;` at `start`
///
/// returns the token, if it was well formed, and the index of the `;`
/// terminating it (or the end of the line)
fn scan_pair(chars: &[char], start: usize) -> (Option<HeaderToken>, usize) {
    let key_start = skip_whitespace(chars, start);
    let mut pos = key_start;
    while pos < chars.len() && chars[pos] != '=' && chars[pos] != ';' {
        pos += 1;
    }
    let key: String = chars[key_start..pos].iter().collect::<String>().trim().to_string();
    if pos >= chars.len() || chars[pos] == ';' || key.is_empty() {
        if !key.is_empty() {
            tracing::trace!("Dropping header element {:?} without a value", key);
        }
        return (None, find_separator(chars, pos));
    }
    let value_start = skip_whitespace(chars, pos + 1);
    let (value, value_end) = match chars.get(value_start) {
        Some('"') => match scan_quoted(chars, value_start) {
            Some(scanned) => scanned,
            None => {
                tracing::trace!("Dropping header element {} with unterminated quote", key);
                return (None, chars.len());
            }
        },
        Some('{') => match scan_braces(chars, value_start) {
            Some(end) => (chars[value_start..end].iter().collect(), end),
            None => {
                tracing::trace!("Dropping header element {} with unbalanced braces", key);
                return (None, chars.len());
            }
        },
        _ => {
            let (value, end) = scan_unquoted(chars, value_start);
            return (Some(HeaderToken { key, value }), end);
        }
    };
    let after = skip_whitespace(chars, value_end);
    if after < chars.len() && chars[after] != ';' {
        tracing::trace!(
            "Dropping header element {} with trailing characters after its value",
            key
        );
        return (None, find_separator(chars, after));
    }
    (Some(HeaderToken { key, value }), after)
}

/// split a header line into its timestamp and key/value tokens
///
/// the line may or may not carry the leading `#` of the commented rendering,
/// both decode identically; malformed key/value pairs are dropped
#[instrument]
pub fn tokenize_header(line: &str) -> Result<TokenizedHeader, HeaderError> {
    let line = line.trim();
    let line = line.strip_prefix('#').unwrap_or(line).trim();
    if line.is_empty() {
        return Err(HeaderError::EmptyHeader);
    }
    let chars: Vec<char> = line.chars().collect();
    let mut pos = find_separator(&chars, 0);
    let timestamp = chars[..pos].iter().collect::<String>().trim().to_string();
    let mut tokens = vec![];
    while pos < chars.len() {
        let (token, next) = scan_pair(&chars, pos + 1);
        if let Some(token) = token {
            tokens.push(token);
        }
        pos = next;
    }
    Ok(TokenizedHeader { timestamp, tokens })
}

/// the typed fields of an audit log message header
///
/// every field except the timestamp is optional, fields which are absent or
/// could not be parsed are None
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLogHeader {
    /// when the operation was processed
    pub timestamp: DateTime<FixedOffset>,
    /// the name of the directory server product
    pub product_name: Option<String>,
    /// the name of the server instance
    pub instance_name: Option<String>,
    /// identifies the server startup the message was logged in
    pub startup_id: Option<String>,
    /// the thread which processed the operation
    pub thread_id: Option<i64>,
    /// the DN of the user which requested the operation
    pub requester_dn: Option<String>,
    /// the IP address of the client which requested the operation
    pub requester_ip: Option<String>,
    /// the connection the operation was requested on
    pub connection_id: Option<i64>,
    /// the operation id within the connection
    pub operation_id: Option<i64>,
    /// the connection of the operation which triggered this one
    pub triggered_by_connection_id: Option<i64>,
    /// the operation which triggered this one
    pub triggered_by_operation_id: Option<i64>,
    /// the replication change id if the operation was replicated
    pub replication_change_id: Option<String>,
    /// the DN the operation was authorized as, if different from the requester
    pub alternate_authorization_dn: Option<String>,
    /// the transaction the operation was part of
    pub transaction_id: Option<String>,
    /// where the operation originated, e.g. replication
    pub origin: Option<String>,
    /// whether the operation was processed by an administrative session worker thread
    pub uses_admin_session_worker_thread: Option<bool>,
    /// the OIDs of the request controls in the order they were sent
    pub request_control_oids: Option<Vec<String>>,
    /// the operation purpose request control, uninterpreted
    pub operation_purpose: Option<String>,
    /// the intermediate client request control, uninterpreted
    pub intermediate_client_request_control: Option<String>,
    /// keys this library does not know about
    pub unknown_fields: BTreeMap<String, String>,
}

/// parse an integer header value, dropping it if it is malformed
fn integer_field(key: &str, value: &str) -> Option<i64> {
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(err) => {
            tracing::debug!("Ignoring malformed header field {}={:?}: {}", key, value, err);
            None
        }
    }
}

/// parse a boolean header value, dropping it if it is malformed
fn boolean_field(key: &str, value: &str) -> Option<bool> {
    match value.trim() {
        v if v.eq_ignore_ascii_case("true") => Some(true),
        v if v.eq_ignore_ascii_case("false") => Some(false),
        _ => {
            tracing::debug!("Ignoring malformed header field {}={:?}", key, value);
            None
        }
    }
}

/// parse the comma separated request control OIDs, dropping the whole list
/// if any of them is not a valid OID
fn oid_list_field(key: &str, value: &str) -> Option<Vec<String>> {
    let oids: Vec<String> = value.split(',').map(|s| s.trim().to_string()).collect();
    for oid in &oids {
        if let Err(err) = ObjectIdentifier::try_from(oid.as_str()) {
            tracing::debug!(
                "Ignoring header field {}={:?} with invalid OID {}: {:?}",
                key,
                value,
                oid,
                err
            );
            return None;
        }
    }
    Some(oids)
}

impl AuditLogHeader {
    /// map the raw tokens of a header to typed fields
    pub fn from_tokens(tokenized: TokenizedHeader) -> Result<Self, HeaderError> {
        let timestamp = DateTime::parse_from_str(&tokenized.timestamp, TIMESTAMP_FORMAT)
            .map_err(|source| HeaderError::MalformedTimestamp {
                timestamp: tokenized.timestamp.clone(),
                source,
            })?;
        let mut header = AuditLogHeader {
            timestamp,
            product_name: None,
            instance_name: None,
            startup_id: None,
            thread_id: None,
            requester_dn: None,
            requester_ip: None,
            connection_id: None,
            operation_id: None,
            triggered_by_connection_id: None,
            triggered_by_operation_id: None,
            replication_change_id: None,
            alternate_authorization_dn: None,
            transaction_id: None,
            origin: None,
            uses_admin_session_worker_thread: None,
            request_control_oids: None,
            operation_purpose: None,
            intermediate_client_request_control: None,
            unknown_fields: BTreeMap::new(),
        };
        for HeaderToken { key, value } in tokenized.tokens {
            match key.as_str() {
                "productName" => header.product_name = Some(value),
                "instanceName" => header.instance_name = Some(value),
                "startupID" => header.startup_id = Some(value),
                "threadID" => header.thread_id = integer_field(&key, &value),
                "requesterDN" => header.requester_dn = Some(value),
                "clientIP" => header.requester_ip = Some(value),
                "conn" => header.connection_id = integer_field(&key, &value),
                "op" => header.operation_id = integer_field(&key, &value),
                "triggeredByConn" => {
                    header.triggered_by_connection_id = integer_field(&key, &value)
                }
                "triggeredByOp" => header.triggered_by_operation_id = integer_field(&key, &value),
                "replicationChangeID" => header.replication_change_id = Some(value),
                "authzDN" => header.alternate_authorization_dn = Some(value),
                "txnID" => header.transaction_id = Some(value),
                "origin" => header.origin = Some(value),
                "usingAdminSessionWorkerThread" => {
                    header.uses_admin_session_worker_thread = boolean_field(&key, &value)
                }
                "requestControlOIDs" => header.request_control_oids = oid_list_field(&key, &value),
                "operationPurpose" => header.operation_purpose = Some(value),
                "intermediateClientRequestControl" => {
                    header.intermediate_client_request_control = Some(value)
                }
                _ => {
                    tracing::trace!("Keeping unknown header field {}", key);
                    header.unknown_fields.insert(key, value);
                }
            }
        }
        Ok(header)
    }

    /// tokenize and map a header line
    pub fn parse(line: &str) -> Result<Self, HeaderError> {
        Self::from_tokens(tokenize_header(line)?)
    }
}

impl FromStr for AuditLogHeader {
    type Err = HeaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const INTERMEDIATE_CLIENT: &str = r#"{ clientIdentity="dn:uid=app,ou=Apps,dc=example,dc=com"; downstreamRequest={ clientIP="10.0.0.1"; clientName="proxy; {internal}" }; clientName="app" }"#;

    fn full_header() -> String {
        format!(
            concat!(
                "# 24/Mar/2024:10:11:12.345 -0500; conn=5; op=12; ",
                r#"productName="Example Directory Server"; instanceName="ds1"; "#,
                "startupID=ABC123; threadID=42; clientIP=192.0.2.7; ",
                r#"requesterDN="cn=Directory Manager,cn=Root DNs,cn=config"; "#,
                r#"replicationChangeID="0001018e7a1b2c3d"; authzDN="uid=proxied,dc=example,dc=com"; "#,
                r#"requestControlOIDs="1.3.6.1.4.1.4203.1.10.2,2.16.840.1.113730.3.4.2"; "#,
                "usingAdminSessionWorkerThread=true; someFutureKey=42; ",
                "intermediateClientRequestControl={}"
            ),
            INTERMEDIATE_CLIENT
        )
    }

    #[test]
    fn decodes_all_fields() {
        let header = AuditLogHeader::parse(&full_header()).unwrap();
        assert_eq!(
            header.timestamp,
            DateTime::parse_from_rfc3339("2024-03-24T10:11:12.345-05:00").unwrap()
        );
        assert_eq!(header.connection_id, Some(5));
        assert_eq!(header.operation_id, Some(12));
        assert_eq!(header.product_name.as_deref(), Some("Example Directory Server"));
        assert_eq!(header.instance_name.as_deref(), Some("ds1"));
        assert_eq!(header.startup_id.as_deref(), Some("ABC123"));
        assert_eq!(header.thread_id, Some(42));
        assert_eq!(header.requester_ip.as_deref(), Some("192.0.2.7"));
        assert_eq!(
            header.requester_dn.as_deref(),
            Some("cn=Directory Manager,cn=Root DNs,cn=config")
        );
        assert_eq!(header.replication_change_id.as_deref(), Some("0001018e7a1b2c3d"));
        assert_eq!(
            header.alternate_authorization_dn.as_deref(),
            Some("uid=proxied,dc=example,dc=com")
        );
        assert_eq!(
            header.request_control_oids,
            Some(vec![
                "1.3.6.1.4.1.4203.1.10.2".to_string(),
                "2.16.840.1.113730.3.4.2".to_string()
            ])
        );
        assert_eq!(header.uses_admin_session_worker_thread, Some(true));
        assert_eq!(
            header.intermediate_client_request_control.as_deref(),
            Some(INTERMEDIATE_CLIENT)
        );
        assert_eq!(header.transaction_id, None);
        assert_eq!(header.origin, None);
        assert_eq!(header.operation_purpose, None);
        assert_eq!(
            header.unknown_fields.get("someFutureKey").map(String::as_str),
            Some("42")
        );
    }

    #[test]
    fn commented_and_uncommented_headers_decode_identically() {
        let commented = full_header();
        let uncommented = commented.trim_start_matches("# ").to_string();
        assert_eq!(
            AuditLogHeader::parse(&commented).unwrap(),
            AuditLogHeader::parse(&uncommented).unwrap()
        );
    }

    #[test]
    fn malformed_timestamp_is_an_error() {
        assert!(matches!(
            AuditLogHeader::parse("# yesterday; conn=1; op=2"),
            Err(HeaderError::MalformedTimestamp { .. })
        ));
        assert!(matches!(
            AuditLogHeader::parse("#"),
            Err(HeaderError::EmptyHeader)
        ));
    }

    #[test]
    fn malformed_optional_fields_are_dropped() {
        let header = AuditLogHeader::parse(
            "24/Mar/2024:10:11:12.345 +0000; conn=abc; op=7; threadID; requestControlOIDs=\"1.2.3,not-an-oid\"; usingAdminSessionWorkerThread=maybe; productName=\"unterminated",
        )
        .unwrap();
        assert_eq!(header.connection_id, None);
        assert_eq!(header.operation_id, Some(7));
        assert_eq!(header.thread_id, None);
        assert_eq!(header.request_control_oids, None);
        assert_eq!(header.uses_admin_session_worker_thread, None);
        assert_eq!(header.product_name, None);

        let header = AuditLogHeader::parse(
            "24/Mar/2024:10:11:12.345 +0000; productName=\"Directory\" Server; instanceName=\"ds1\"; intermediateClientRequestControl={ clientName=\"app\"",
        )
        .unwrap();
        assert_eq!(header.product_name, None);
        assert_eq!(header.instance_name, Some("ds1".to_string()));
        assert_eq!(header.intermediate_client_request_control, None);
        assert!(header.unknown_fields.is_empty());
    }

    #[test]
    fn tokenizer_handles_escapes() {
        let tokenized = tokenize_header(
            r#"# 24/Mar/2024:10:11:12.345 +0000; a="say \"hi\"; now"; b=x\;y; c={ "}" }"#,
        )
        .unwrap();
        assert_eq!(
            tokenized.tokens,
            vec![
                HeaderToken {
                    key: "a".to_string(),
                    value: r#"say "hi"; now"#.to_string()
                },
                HeaderToken {
                    key: "b".to_string(),
                    value: "x;y".to_string()
                },
                HeaderToken {
                    key: "c".to_string(),
                    value: r#"{ "}" }"#.to_string()
                },
            ]
        );
    }

    proptest! {
        /// the leading comment marker never changes the decoded fields
        #[test]
        fn comment_marker_is_irrelevant(
            conn in 0i64..1_000_000,
            op in 0i64..1_000_000,
            instance in "[a-zA-Z0-9 ;={}]{0,20}",
            client_name in "[a-zA-Z0-9 ;=]{0,20}",
        ) {
            let body = format!(
                "01/Jan/2024:00:00:00.000 +0000; conn={}; op={}; instanceName=\"{}\"; intermediateClientRequestControl={{ clientName=\"{}\" }}",
                conn, op, instance, client_name
            );
            let commented = AuditLogHeader::parse(&format!("# {}", body)).unwrap();
            let uncommented = AuditLogHeader::parse(&body).unwrap();
            prop_assert_eq!(&commented, &uncommented);
            prop_assert_eq!(commented.connection_id, Some(conn));
            prop_assert_eq!(commented.operation_id, Some(op));
            prop_assert_eq!(commented.instance_name, Some(instance));
        }
    }
}
