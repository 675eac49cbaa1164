//! reading audit log files, one message after the other

use derive_builder::Builder;
use dirs2::home_dir;
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

use std::io::BufRead;

use crate::ldif::ChangeType;
use crate::message::{AuditLogMessage, AuditLogMessageError};

/// the name of the reader config file in the user home dir
pub const HOME_CONFIG_FILE_NAME: &str = ".ldap-audit-log.toml";

/// default for [AuditLogReaderConfig::skip_invalid_messages]
fn default_skip_invalid_messages() -> bool {
    true
}

/// settings for reading audit log files
#[derive(Debug, Clone, PartialEq, Eq, Builder, Deserialize)]
pub struct AuditLogReaderConfig {
    /// log and skip messages which can not be decoded instead of returning
    /// an error for them
    #[builder(default = "true")]
    #[serde(default = "default_skip_invalid_messages")]
    pub skip_invalid_messages: bool,
    /// only return messages of these change types, all if not set
    #[builder(setter(strip_option), default)]
    #[serde(default)]
    pub change_types: Option<Vec<ChangeType>>,
}

impl Default for AuditLogReaderConfig {
    fn default() -> Self {
        Self {
            skip_invalid_messages: default_skip_invalid_messages(),
            change_types: None,
        }
    }
}

impl AuditLogReaderConfig {
    /// check the change type filter
    fn wants(&self, change_type: ChangeType) -> bool {
        self.change_types
            .as_ref()
            .map_or(true, |change_types| change_types.contains(&change_type))
    }
}

/// error which can happen while reading the reader config from a file
#[derive(Debug, Error)]
pub enum TomlConfigError {
    /// an I/O error
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    /// an error deserializing the TOML file
    #[error("Toml deserialization error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// load the reader config from a toml file
#[instrument]
pub fn toml_reader_config(
    filename: std::path::PathBuf,
) -> Result<AuditLogReaderConfig, TomlConfigError> {
    let config = std::fs::read_to_string(filename)?;
    let result: AuditLogReaderConfig = toml::from_str(&config)?;

    Ok(result)
}

/// load the reader config from the file in the user home dir if there is one,
/// the defaults otherwise
#[instrument]
pub fn home_reader_config() -> Result<AuditLogReaderConfig, TomlConfigError> {
    if let Some(d) = home_dir() {
        let mut filename = d;
        filename.push(HOME_CONFIG_FILE_NAME);
        if filename.exists() {
            tracing::debug!("Using audit log reader config at {:?}", filename);
            return toml_reader_config(filename);
        }
    }
    Ok(AuditLogReaderConfig::default())
}

/// errors returned while reading messages
#[derive(Debug, Error)]
pub enum AuditLogReaderError {
    /// an I/O error
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    /// a message could not be decoded
    #[error("Invalid audit log message starting at line {line_number}: {source}")]
    InvalidMessage {
        /// the line number of the first line of the message, starting at 1
        line_number: usize,
        /// why the message could not be decoded
        #[source]
        source: AuditLogMessageError,
    },
}

/// reads audit log messages, which are separated by blank lines, from a
/// buffered reader
#[derive(Debug)]
pub struct AuditLogReader<R> {
    /// the line source
    lines: std::io::Lines<R>,
    /// the settings
    config: AuditLogReaderConfig,
    /// number of lines read so far
    line_number: usize,
}

impl<R: BufRead> AuditLogReader<R> {
    /// a reader with the default settings
    pub fn new(reader: R) -> Self {
        Self::with_config(reader, AuditLogReaderConfig::default())
    }

    /// a reader with the given settings
    pub fn with_config(reader: R, config: AuditLogReaderConfig) -> Self {
        Self {
            lines: reader.lines(),
            config,
            line_number: 0,
        }
    }

    /// collect the lines of the next message and the line number it starts at
    fn next_message_lines(&mut self) -> Result<Option<(usize, Vec<String>)>, std::io::Error> {
        let mut start = 0;
        let mut message_lines = vec![];
        for line in self.lines.by_ref() {
            let line = line?;
            self.line_number += 1;
            if line.trim().is_empty() {
                if message_lines.is_empty() {
                    continue;
                }
                break;
            }
            if message_lines.is_empty() {
                start = self.line_number;
            }
            message_lines.push(line);
        }
        if message_lines.is_empty() {
            Ok(None)
        } else {
            Ok(Some((start, message_lines)))
        }
    }
}

impl<R: BufRead> Iterator for AuditLogReader<R> {
    type Item = Result<AuditLogMessage, AuditLogReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (line_number, lines) = match self.next_message_lines() {
                Ok(Some(message)) => message,
                Ok(None) => return None,
                Err(err) => return Some(Err(err.into())),
            };
            match AuditLogMessage::decode(&lines) {
                Ok(message) => {
                    if self.config.wants(message.change_type()) {
                        return Some(Ok(message));
                    }
                    tracing::trace!(
                        "Skipping {} message at line {}",
                        message.change_type(),
                        line_number
                    );
                }
                Err(err) if self.config.skip_invalid_messages => {
                    tracing::warn!(
                        "Skipping invalid audit log message at line {}: {}",
                        line_number,
                        err
                    );
                }
                Err(source) => {
                    return Some(Err(AuditLogReaderError::InvalidMessage {
                        line_number,
                        source,
                    }))
                }
            }
        }
    }
}
