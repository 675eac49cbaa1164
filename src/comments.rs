//! decoders for the comment blocks audit log messages use to describe the
//! side effects of an operation which the change record itself does not show

use base64::{engine::general_purpose::STANDARD, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::instrument;

use crate::ldif::{group_attributes, Attribute};
use crate::modification::{Modification, ModificationType};

lazy_static! {
    /// `# ModifyDN attribute modifications (count=2)` or `# 2 attribute modifications`
    static ref MODIFICATIONS_MARKER: Regex =
        Regex::new(r"^(.*?)\s*attribute modifications\s*(?:\(count=(\d+)\))?$").unwrap();
    /// `# Deleted entry attributes`
    static ref DELETED_ENTRY_MARKER: Regex =
        Regex::new(r"(?i)^deleted entry attributes:?$").unwrap();
}

/// what an audit log message says about the attribute modifications an
/// operation caused
///
/// a missing block, a block that could not be parsed and a block declaring
/// zero modifications are three different things for revertibility
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeModificationsBlock {
    /// the message has no attribute modifications comment
    Absent,
    /// the comment is there but does not have the expected structure
    Unparsable,
    /// the modifications declared by the comment, possibly none
    Declared(Vec<Modification>),
}

impl AttributeModificationsBlock {
    /// the declared modifications, None if the block is absent or unparsable
    pub fn modifications(&self) -> Option<&[Modification]> {
        match self {
            AttributeModificationsBlock::Declared(modifications) => Some(modifications),
            AttributeModificationsBlock::Absent | AttributeModificationsBlock::Unparsable => None,
        }
    }
}

/// the text of a comment line after the `#` and one optional space
fn comment_content(line: &str) -> Option<&str> {
    let content = line.strip_prefix('#')?;
    Some(content.strip_prefix(' ').unwrap_or(content).trim_end())
}

/// split `name: value` or `name:: base64` comment content
fn comment_value(content: &str) -> Option<(&str, String)> {
    let (name, rest) = content.split_once(':')?;
    let name = name.trim();
    if name.is_empty() || name.contains(' ') {
        return None;
    }
    let value = match rest.strip_prefix(':') {
        Some(encoded) => {
            let bytes = STANDARD.decode(encoded.trim()).ok()?;
            String::from_utf8(bytes).ok()?
        }
        None => rest.trim_start_matches(' ').to_string(),
    };
    Some((name, value))
}

/// the number of modifications the marker line declares
fn declared_count(captures: &regex::Captures<'_>) -> Option<usize> {
    match captures.get(2) {
        Some(count) => count.as_str().parse().ok(),
        None => captures.get(1)?.as_str().trim().parse().ok(),
    }
}

/// decode the modification blocks following the marker, None on any deviation
fn decode_blocks(contents: &[&str], count: usize) -> Option<Vec<Modification>> {
    // every block takes at least two lines
    if count > contents.len() / 2 {
        tracing::trace!(
            "Declared {} modifications in only {} lines",
            count,
            contents.len()
        );
        return None;
    }
    let mut modifications = Vec::with_capacity(count);
    let mut pos = 0;
    while modifications.len() < count {
        if !modifications.is_empty() {
            if contents.get(pos) != Some(&"-") {
                tracing::trace!("Missing separator before modification {}", modifications.len());
                return None;
            }
            pos += 1;
        }
        let (modification_type, attribute) = contents.get(pos)?.split_once(':')?;
        let modification_type: ModificationType = match modification_type.parse() {
            Ok(t) => t,
            Err(err) => {
                tracing::trace!("{}", err);
                return None;
            }
        };
        let attribute = attribute.trim();
        if attribute.is_empty() {
            return None;
        }
        pos += 1;
        let mut values = vec![];
        while let Some((name, value)) = contents.get(pos).and_then(|c| comment_value(c)) {
            if !name.eq_ignore_ascii_case(attribute) {
                break;
            }
            values.push(value);
            pos += 1;
        }
        if values.is_empty()
            || (modification_type == ModificationType::Increment && values.len() != 1)
        {
            tracing::trace!(
                "Unexpected number of values {} for {} of {}",
                values.len(),
                modification_type,
                attribute
            );
            return None;
        }
        modifications.push(Modification::new(modification_type, attribute, values));
    }
    if let Some(next) = contents.get(pos) {
        let starts_block = next
            .split_once(':')
            .is_some_and(|(modification_type, _)| {
                modification_type.parse::<ModificationType>().is_ok()
            });
        if *next == "-" || starts_block {
            tracing::trace!("More modification blocks than the declared {}", count);
            return None;
        }
    }
    Some(modifications)
}

/// decode the attribute modifications comment block from the comment lines
/// of an audit log message
///
/// the block is all or nothing, any structural deviation makes the whole
/// block [AttributeModificationsBlock::Unparsable]
#[instrument(skip(comment_lines))]
pub fn decode_attribute_modifications<S: AsRef<str>>(
    comment_lines: &[S],
) -> AttributeModificationsBlock {
    let contents: Vec<&str> = comment_lines
        .iter()
        .filter_map(|l| comment_content(l.as_ref()))
        .collect();
    let Some((marker, captures)) = contents
        .iter()
        .enumerate()
        .find_map(|(i, c)| MODIFICATIONS_MARKER.captures(c).map(|captures| (i, captures)))
    else {
        return AttributeModificationsBlock::Absent;
    };
    let Some(count) = declared_count(&captures) else {
        tracing::debug!(
            "Attribute modifications comment {:?} does not declare a count",
            contents[marker]
        );
        return AttributeModificationsBlock::Unparsable;
    };
    match decode_blocks(&contents[marker + 1..], count) {
        Some(modifications) => AttributeModificationsBlock::Declared(modifications),
        None => {
            tracing::debug!(
                "Attribute modifications comment declaring {} modifications could not be parsed",
                count
            );
            AttributeModificationsBlock::Unparsable
        }
    }
}

/// decode the attributes a delete audit log message recorded for the
/// deleted entry, None if there is no such block or it is empty
#[instrument(skip(comment_lines))]
pub fn decode_deleted_entry_attributes<S: AsRef<str>>(
    comment_lines: &[S],
) -> Option<Vec<Attribute>> {
    let contents: Vec<&str> = comment_lines
        .iter()
        .filter_map(|l| comment_content(l.as_ref()))
        .collect();
    let marker = contents.iter().position(|c| DELETED_ENTRY_MARKER.is_match(c))?;
    let pairs: Vec<(String, String)> = contents[marker + 1..]
        .iter()
        .map_while(|c| comment_value(c))
        .map(|(name, value)| (name.to_string(), value))
        .collect();
    if pairs.is_empty() {
        tracing::debug!("Deleted entry attributes comment without attributes");
        return None;
    }
    Some(group_attributes(pairs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn values(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn decodes_declared_modifications() {
        let block = decode_attribute_modifications(&[
            "# 24/Mar/2024:10:11:12.345 -0500; conn=5; op=12",
            "# ModifyDN attribute modifications (count=3)",
            "# delete: uid",
            "# uid: jdoe",
            "# -",
            "# add: uid",
            "# uid: john.doe",
            "# -",
            "# add: description",
            "# description: first",
            "# description:: c2Vjb25k",
        ]);
        assert_eq!(
            block,
            AttributeModificationsBlock::Declared(vec![
                Modification::new(ModificationType::Delete, "uid", values(&["jdoe"])),
                Modification::new(ModificationType::Add, "uid", values(&["john.doe"])),
                Modification::new(
                    ModificationType::Add,
                    "description",
                    values(&["first", "second"])
                ),
            ])
        );
    }

    #[test]
    fn zero_declared_modifications_differ_from_absent_block() {
        let declared =
            decode_attribute_modifications(&["# ModifyDN attribute modifications (count=0)"]);
        assert_eq!(declared, AttributeModificationsBlock::Declared(vec![]));
        assert_eq!(declared.modifications(), Some(&[][..]));

        let absent = decode_attribute_modifications(&["# some unrelated comment"]);
        assert_eq!(absent, AttributeModificationsBlock::Absent);
        assert_eq!(absent.modifications(), None);
    }

    #[test]
    fn accepts_count_prefix_form() {
        let block = decode_attribute_modifications(&[
            "# 1 attribute modifications",
            "# increment: loginCount",
            "# loginCount: 2",
        ]);
        assert_eq!(
            block,
            AttributeModificationsBlock::Declared(vec![Modification::new(
                ModificationType::Increment,
                "loginCount",
                values(&["2"])
            )])
        );
    }

    #[test]
    fn structural_deviations_make_the_block_unparsable() {
        let cases: Vec<Vec<&str>> = vec![
            // fewer blocks than declared
            vec!["# ModifyDN attribute modifications (count=2)", "# add: uid", "# uid: a"],
            // more blocks than declared
            vec![
                "# ModifyDN attribute modifications (count=1)",
                "# add: uid",
                "# uid: a",
                "# -",
                "# add: cn",
                "# cn: b",
            ],
            // unknown modification type
            vec!["# ModifyDN attribute modifications (count=1)", "# rename: uid", "# uid: a"],
            // block without values
            vec!["# ModifyDN attribute modifications (count=1)", "# delete: uid"],
            // missing separator
            vec![
                "# ModifyDN attribute modifications (count=2)",
                "# add: uid",
                "# uid: a",
                "# add: cn",
                "# cn: b",
            ],
            // more blocks than declared without a separator
            vec![
                "# ModifyDN attribute modifications (count=2)",
                "# delete: uid",
                "# uid: jdoe",
                "# -",
                "# add: uid",
                "# uid: john.doe",
                "# replace: description",
                "# description: renamed",
            ],
            // no count at all
            vec!["# ModifyDN attribute modifications"],
            // count larger than the lines could hold
            vec![
                "# ModifyDN attribute modifications (count=18446744073709551615)",
                "# add: uid",
                "# uid: a",
            ],
            vec![
                "# ModifyDN attribute modifications (count=100000000000)",
                "# add: uid",
                "# uid: a",
            ],
        ];
        for case in cases {
            assert_eq!(
                decode_attribute_modifications(&case),
                AttributeModificationsBlock::Unparsable,
                "{:?}",
                case
            );
        }
    }

    #[test]
    fn decodes_deleted_entry_attributes() {
        let attributes = decode_deleted_entry_attributes(&[
            "# Deleted entry attributes",
            "# objectClass: top",
            "# objectClass: person",
            "# cn: John Doe",
            "# sn: Doe",
        ])
        .unwrap();
        assert_eq!(
            attributes,
            vec![
                Attribute {
                    name: "objectClass".to_string(),
                    values: values(&["top", "person"]),
                },
                Attribute {
                    name: "cn".to_string(),
                    values: values(&["John Doe"]),
                },
                Attribute {
                    name: "sn".to_string(),
                    values: values(&["Doe"]),
                },
            ]
        );
        assert_eq!(
            decode_deleted_entry_attributes(&["# Deleted entry attributes"]),
            None
        );
        assert_eq!(decode_deleted_entry_attributes::<&str>(&[]), None);
    }
}
