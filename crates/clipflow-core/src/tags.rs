//! Material tags and their two wire encodings.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A category node. Only leaves can be attached to submitted material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Tag>,
}

impl Tag {
    pub fn leaf(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Depth-first list of every leaf in `tree`.
pub fn leaf_tags(tree: &[Tag]) -> Vec<&Tag> {
    let mut out = Vec::new();
    let mut stack: Vec<&Tag> = tree.iter().rev().collect();
    while let Some(tag) = stack.pop() {
        if tag.is_leaf() {
            out.push(tag);
        } else {
            stack.extend(tag.children.iter().rev());
        }
    }
    out
}

/// Characters accepted in the name encoding: ASCII letters and digits,
/// CJK ideographs, and the `,` separator.
pub fn is_allowed_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || c == ','
        || ('\u{4e00}'..='\u{9fff}').contains(&c)
        || ('\u{3400}'..='\u{4dbf}').contains(&c)
        || ('\u{f900}'..='\u{faff}').contains(&c)
}

/// The selected leaf tags for one submission batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    tags: Vec<Tag>,
}

impl TagSet {
    pub fn new(tags: impl IntoIterator<Item = Tag>) -> Self {
        Self {
            tags: tags.into_iter().collect(),
        }
    }

    /// Pick `selected` ids out of `tree`, rejecting ids that are unknown or
    /// not leaves.
    pub fn from_tree(tree: &[Tag], selected: &[u64]) -> Result<Self> {
        let leaves = leaf_tags(tree);
        let mut tags = Vec::with_capacity(selected.len());
        for id in selected {
            let tag = leaves
                .iter()
                .find(|t| t.id == *id)
                .ok_or_else(|| Error::validation(format!("tag {id} is not a selectable leaf")))?;
            tags.push((*tag).clone());
        }
        Ok(Self { tags })
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Comma-joined numeric ids, e.g. `"12,40"`.
    pub fn id_encoding(&self) -> String {
        self.tags
            .iter()
            .map(|t| t.id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Comma-joined display names, validated against the allow-list.
    ///
    /// `,` is only valid as the separator; a name containing one would split
    /// into two tags downstream.
    pub fn name_encoding(&self) -> Result<String> {
        let mut names = Vec::with_capacity(self.tags.len());
        for tag in &self.tags {
            let name = tag.name.trim();
            if name.is_empty() {
                return Err(Error::validation(format!("tag {} has an empty name", tag.id)));
            }
            if let Some(bad) = name.chars().find(|c| *c == ',' || !is_allowed_tag_char(*c)) {
                return Err(Error::validation(format!(
                    "tag names may only contain letters, digits and CJK characters (found {bad:?} in {name:?})"
                )));
            }
            names.push(name);
        }
        Ok(names.join(","))
    }
}
