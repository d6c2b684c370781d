//! Exposes binary columns as strings.
//!
//! Each binary column travels either as a base64 data URI
//! (`data:image/png;base64,...`) or as lowercase hex. Keys default to hex
//! so they stay usable in URLs, everything else to data URIs.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use parking_lot::RwLock;
use quarry_core::schema::ValidationRule;
use quarry_core::{
    AggregateResult, Aggregation, Caller, CollectionSchema, ColumnSchema, ConditionTree, FieldSchema, Filter,
    Operator, PaginatedFilter, PrimitiveType, Projection, Record, Result, ToolkitError, Value,
};

use super::{DatasourceDecorator, DecoratorBase, DecoratorFactory};
use crate::collection::{Collection, CollectionRef};
use crate::validators::validate_field;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryMode {
    Datauri,
    Hex,
}

/// Operators whose value is a payload of the column, to be converted.
const CONVERTED_OPERATORS: [Operator; 12] = [
    Operator::After,
    Operator::Before,
    Operator::Contains,
    Operator::EndsWith,
    Operator::Equal,
    Operator::GreaterThan,
    Operator::In,
    Operator::LessThan,
    Operator::NotContains,
    Operator::NotEqual,
    Operator::NotIn,
    Operator::StartsWith,
];

const OCTET_STREAM: &str = "application/octet-stream";

/// Content type guessed from leading magic bytes.
#[must_use]
pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"%PDF-", "application/pdf"),
        (b"BM", "image/bmp"),
        (b"II*\x00", "image/tiff"),
        (b"MM\x00*", "image/tiff"),
        (b"\x00\x00\x01\x00", "image/x-icon"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b", "application/gzip"),
        (b"7z\xbc\xaf\x27\x1c", "application/x-7z-compressed"),
        (b"ID3", "audio/mpeg"),
        (b"OggS", "audio/ogg"),
        (b"fLaC", "audio/x-flac"),
        (b"\x1a\x45\xdf\xa3", "video/webm"),
        (b"wOFF", "application/font-woff"),
        (b"wOF2", "application/font-woff"),
    ];
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" {
        match &bytes[8..12] {
            b"WEBP" => return "image/webp",
            b"WAVE" => return "audio/x-wav",
            b"AVI " => return "video/x-msvideo",
            _ => {}
        }
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return "video/mp4";
    }
    SIGNATURES
        .iter()
        .find(|(magic, _)| bytes.starts_with(magic))
        .map_or(OCTET_STREAM, |(_, mime)| mime)
}

fn is_binary(field: &FieldSchema) -> bool {
    field.as_column().is_some_and(|column| column.column_type.as_primitive() == Some(PrimitiveType::Binary))
}

fn decode(mode: BinaryMode, text: &str) -> Result<Vec<u8>> {
    match mode {
        BinaryMode::Hex => hex::decode(text).map_err(|err| ToolkitError::Unprocessable(format!("invalid hex: {err}"))),
        BinaryMode::Datauri => {
            let (_, payload) = text
                .split_once("base64,")
                .ok_or_else(|| ToolkitError::Unprocessable(format!("not a base64 data uri: {text}")))?;
            STANDARD
                .decode(payload)
                .map_err(|err| ToolkitError::Unprocessable(format!("invalid base64: {err}")))
        }
    }
}

fn encode(mode: BinaryMode, bytes: &[u8]) -> String {
    match mode {
        BinaryMode::Hex => hex::encode(bytes),
        BinaryMode::Datauri => format!("data:{};base64,{}", sniff_mime(bytes), STANDARD.encode(bytes)),
    }
}

fn convert_payload(to_backend: bool, mode: BinaryMode, value: Value) -> Result<Value> {
    match value {
        Value::Array(items) => {
            let items = items.into_iter().map(|item| convert_payload(to_backend, mode, item));
            items.collect::<Result<Vec<_>>>().map(Value::Array)
        }
        Value::String(text) if to_backend => decode(mode, &text).map(Value::Bytes),
        Value::Bytes(bytes) if !to_backend => Ok(Value::String(encode(mode, &bytes))),
        other => Ok(other),
    }
}

pub struct BinaryCollection {
    base: DecoratorBase<BinaryCollection>,
    modes: RwLock<BTreeMap<String, BinaryMode>>,
}

impl DecoratorFactory for BinaryCollection {
    fn wrap(child: CollectionRef, datasource: Weak<DatasourceDecorator<Self>>) -> Self {
        Self { base: DecoratorBase::new(child, datasource), modes: RwLock::new(BTreeMap::new()) }
    }
}

impl BinaryCollection {
    /// Picks how the binary column `name` is represented.
    ///
    /// # Errors
    ///
    /// Fails when `name` is not a binary column.
    pub fn set_binary_mode(&self, name: &str, mode: BinaryMode) -> Result<()> {
        let child = self.base.child();
        validate_field(self.base.datasource()?.child().as_ref(), child.as_ref(), name, &[])?;
        if !is_binary(child.schema().field(name)?) {
            return Err(ToolkitError::schema(format!("expected a binary field: {}.{name}", self.name())));
        }
        self.modes.write().insert(name.to_string(), mode);
        self.base.mark_schema_as_dirty();
        Ok(())
    }

    fn mode(&self, schema: &CollectionSchema, name: &str) -> BinaryMode {
        if let Some(mode) = self.modes.read().get(name) {
            return *mode;
        }
        let is_key = schema.column(name).is_ok_and(|column| column.is_primary_key) || schema.is_foreign_key(name);
        if is_key {
            BinaryMode::Hex
        } else {
            BinaryMode::Datauri
        }
    }

    fn convert_record(&self, to_backend: bool, record: Record) -> Result<Record> {
        record
            .into_iter()
            .map(|(key, value)| {
                let value = self.convert_value(to_backend, &key, value)?;
                Ok((key, value))
            })
            .collect()
    }

    /// Converts a value found at `path`, following relations.
    fn convert_value(&self, to_backend: bool, path: &str, value: Value) -> Result<Value> {
        let schema = self.base.child().schema();
        let (head, rest) = match path.split_once(':') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let Some(field) = schema.fields.get(head) else {
            return Ok(value);
        };
        if field.is_column() {
            if !is_binary(field) {
                return Ok(value);
            }
            return convert_payload(to_backend, self.mode(&schema, head), value);
        }

        let Some(foreign) = field.foreign_collection() else {
            return Ok(value);
        };
        let foreign = self.base.collection(foreign)?;
        match (rest, value) {
            (Some(rest), value) => foreign.convert_value(to_backend, rest, value),
            (None, Value::Record(record)) => foreign.convert_record(to_backend, record).map(Value::Record),
            (None, value) => Ok(value),
        }
    }

    fn convert_tree(&self, tree: Option<&ConditionTree>) -> Result<Option<ConditionTree>> {
        tree.map(|tree| {
            tree.replace_leafs(|leaf| {
                if !CONVERTED_OPERATORS.contains(&leaf.operator) {
                    return Ok(ConditionTree::Leaf(leaf.clone()));
                }
                let mut leaf = leaf.clone();
                leaf.value = self.convert_value(true, &leaf.field, std::mem::take(&mut leaf.value))?;
                Ok(ConditionTree::Leaf(leaf))
            })
        })
        .transpose()
    }

    /// Validation rules of a binary column seen as a string.
    fn string_validations(&self, schema: &CollectionSchema, name: &str, column: &ColumnSchema) -> Vec<ValidationRule> {
        let bound = |operator: Operator| {
            column
                .validations
                .iter()
                .find(|rule| rule.operator == operator)
                .and_then(|rule| rule.value.as_ref()?.as_i64())
        };
        let mut rules = Vec::new();
        match self.mode(schema, name) {
            BinaryMode::Hex => {
                rules.push(ValidationRule::new(Operator::Match, Some(Value::from("^[0-9a-f]+$"))));
                if let Some(min) = bound(Operator::LongerThan) {
                    let min = min.saturating_mul(2).saturating_add(1);
                    rules.push(ValidationRule::new(Operator::LongerThan, Some(Value::from(min))));
                }
                if let Some(max) = bound(Operator::ShorterThan) {
                    let max = max.saturating_mul(2).saturating_sub(1);
                    rules.push(ValidationRule::new(Operator::ShorterThan, Some(Value::from(max))));
                }
            }
            BinaryMode::Datauri => {
                rules.push(ValidationRule::new(Operator::Match, Some(Value::from("^data:.*;base64,.*"))));
            }
        }
        if column.validations.iter().any(|rule| rule.operator == Operator::Present) {
            rules.push(ValidationRule::new(Operator::Present, None));
        }
        rules
    }
}

#[async_trait]
impl Collection for BinaryCollection {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn schema(&self) -> Arc<CollectionSchema> {
        self.base.schema_with(|child| {
            let mut schema = child.clone();
            for (name, field) in &mut schema.fields {
                if !is_binary(field) {
                    continue;
                }
                let Some(column) = field.as_column_mut() else {
                    continue;
                };
                column.validations = self.string_validations(child, name, column);
                column.column_type = PrimitiveType::String.into();
            }
            schema
        })
    }

    fn schema_version(&self) -> u64 {
        self.base.schema_version()
    }

    async fn list(&self, caller: &Caller, filter: PaginatedFilter, projection: Projection) -> Result<Vec<Record>> {
        let tree = self.convert_tree(filter.condition_tree())?;
        let records = self.base.child().list(caller, filter.with_condition_tree(tree), projection).await?;
        records.into_iter().map(|record| self.convert_record(false, record)).collect()
    }

    async fn create(&self, caller: &Caller, records: Vec<Record>) -> Result<Vec<Record>> {
        let records = records
            .into_iter()
            .map(|record| self.convert_record(true, record))
            .collect::<Result<Vec<_>>>()?;
        let created = self.base.child().create(caller, records).await?;
        created.into_iter().map(|record| self.convert_record(false, record)).collect()
    }

    async fn update(&self, caller: &Caller, filter: Filter, patch: Record) -> Result<()> {
        let tree = self.convert_tree(filter.condition_tree.as_ref())?;
        let patch = self.convert_record(true, patch)?;
        self.base.child().update(caller, filter.with_condition_tree(tree), patch).await
    }

    async fn delete(&self, caller: &Caller, filter: Filter) -> Result<()> {
        let tree = self.convert_tree(filter.condition_tree.as_ref())?;
        self.base.child().delete(caller, filter.with_condition_tree(tree)).await
    }

    async fn aggregate(
        &self,
        caller: &Caller,
        filter: Filter,
        aggregation: Aggregation,
        limit: Option<usize>,
    ) -> Result<Vec<AggregateResult>> {
        let tree = self.convert_tree(filter.condition_tree.as_ref())?;
        let rows = self
            .base
            .child()
            .aggregate(caller, filter.with_condition_tree(tree), aggregation, limit)
            .await?;
        rows.into_iter()
            .map(|row| Ok(AggregateResult { value: row.value, group: self.convert_record(false, row.group)? }))
            .collect()
    }
}
