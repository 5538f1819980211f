//! Identity codec
//!
//! Turns the declared identity fields of an entity into a stable, opaque
//! string and back. Fields are joined in declaration order with `|`; the
//! characters `\`, `|` and `~` inside values are escaped with `\`, which
//! keeps the mapping lossless and guarantees codec output never starts with
//! an unescaped `~` (reserved for pending identities).

use crate::entity::{Entity, RowId};
use crate::error::{EngineError, Result};
use std::collections::BTreeMap;

/// Identity field values keyed by field name
pub type IdFields = BTreeMap<String, String>;

const SEPARATOR: char = '|';
const ESCAPE: char = '\\';
const PENDING_MARKER: char = '~';

/// Build an [`IdFields`] map from `(name, value)` pairs.
pub fn fields_from<I, K, V>(pairs: I) -> IdFields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Two-way mapping between a kind's identity fields and its identity string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityCodec {
    kind: &'static str,
    fields: &'static [&'static str],
}

impl IdentityCodec {
    pub const fn new(kind: &'static str, fields: &'static [&'static str]) -> Self {
        Self { kind, fields }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Declared identity fields, in encoding order
    pub fn fields(&self) -> &'static [&'static str] {
        self.fields
    }

    /// Encode a field set. The set must contain exactly the declared fields.
    pub fn generate_id(&self, fields: &IdFields) -> Result<String> {
        if fields.len() != self.fields.len()
            || !self.fields.iter().all(|f| fields.contains_key(*f))
        {
            return Err(EngineError::invalid_identity(
                self.kind,
                format!(
                    "valid fields are: {}. Received: {}",
                    self.fields.join(", "),
                    fields.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
            ));
        }

        let mut out = String::new();
        for (i, name) in self.fields.iter().enumerate() {
            let value = &fields[*name];
            if value.is_empty() {
                return Err(EngineError::invalid_identity(
                    self.kind,
                    format!("field '{}' is empty", name),
                ));
            }
            if i > 0 {
                out.push(SEPARATOR);
            }
            for c in value.chars() {
                if c == ESCAPE || c == SEPARATOR || c == PENDING_MARKER {
                    out.push(ESCAPE);
                }
                out.push(c);
            }
        }
        Ok(out)
    }

    /// Decode an identity string produced by [`IdentityCodec::generate_id`].
    pub fn id_fields(&self, id: &str) -> Result<IdFields> {
        if Self::is_pending(id) {
            return Err(EngineError::invalid_identity(
                self.kind,
                format!("'{}' is a pending identity", id),
            ));
        }

        let mut values = Vec::with_capacity(self.fields.len());
        let mut current = String::new();
        let mut chars = id.chars();
        while let Some(c) = chars.next() {
            match c {
                ESCAPE => match chars.next() {
                    Some(next @ (ESCAPE | SEPARATOR | PENDING_MARKER)) => current.push(next),
                    _ => {
                        return Err(EngineError::invalid_identity(
                            self.kind,
                            format!("invalid escape sequence in '{}'", id),
                        ));
                    }
                },
                SEPARATOR => values.push(std::mem::take(&mut current)),
                _ => current.push(c),
            }
        }
        values.push(current);

        if values.len() != self.fields.len() {
            return Err(EngineError::invalid_identity(
                self.kind,
                format!(
                    "expected {} fields ({}), found {} in '{}'",
                    self.fields.len(),
                    self.fields.join(", "),
                    values.len(),
                    id
                ),
            ));
        }

        Ok(self
            .fields
            .iter()
            .map(|f| f.to_string())
            .zip(values)
            .collect())
    }

    /// Identity used for a declared row whose identity fields are not assigned yet
    pub fn pending_id(row: RowId) -> String {
        format!("{}{}", PENDING_MARKER, row)
    }

    pub fn is_pending(id: &str) -> bool {
        id.starts_with(PENDING_MARKER)
    }

    /// Identity of `entity`, or its pending identity when the identity
    /// fields are not assigned yet.
    pub fn entity_id<E: Entity>(&self, entity: &E) -> Result<String> {
        match (entity.identity(), entity.row_id()) {
            (Some(fields), _) => self.generate_id(&fields),
            (None, Some(row)) => Ok(Self::pending_id(row)),
            (None, None) => Err(EngineError::invalid_identity(
                self.kind,
                "identity fields are unassigned and the entity has no row",
            )),
        }
    }
}
