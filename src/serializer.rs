//! # User-Data Validation and Wire Projection
//!
//! This module turns user-facing writes into wire form. Each surface write
//! splits into two phases:
//!
//! 1. **Validation**, run eagerly at the enqueue site. A write that fails
//!    validation never enters a batch.
//! 2. **Projection**, deferred into a pure thunk ([`PayloadFn`]) invoked at
//!    send time. The thunk walks the validated data and produces the wire
//!    [`Write`]: the document fields, the update mask, and the extracted
//!    field transforms.
//!
//! Deferring projection keeps retry cheap (the thunk is re-invocable) and
//! lets the mask computation see the final shape of the data: a field
//! consumed entirely by a transform is excluded from the mask it would
//! otherwise occupy.
//!
//! ## Sentinel Placement Rules
//!
//! - No sentinel may appear inside an array, or inside the element lists of
//!   `ArrayUnion` / `ArrayRemove`.
//! - Arrays may not nest directly.
//! - `Delete` is legal only as the whole value of an `update` entry, or at a
//!   map position under `set` with merge; never in `create` or plain `set`.
//! - `Increment` operands must be integers or doubles.
//!
//! ## Preconditions
//!
//! - `create` always asserts `exists: false`.
//! - `update` accepts only an update-time precondition from the caller and
//!   otherwise asserts `exists: true`, so an update always carries a
//!   precondition on the wire.
//! - `delete` passes the caller's precondition through; `set` carries none.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::types::{DocumentPath, FieldPath, Precondition, Value};
use crate::wire::{Document, DocumentMask, FieldTransform, TransformKind, Write, WriteOp};

// =============================================================================
// Serialized Output
// =============================================================================

/// The wire form of one operation, as produced by its payload thunk.
///
/// The precondition is carried alongside the write; the batch attaches it to
/// `write.current_document` at send time.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    /// The wire write, without its precondition.
    pub write: Write,
    /// The precondition to attach, if any.
    pub precondition: Option<Precondition>,
}

/// A deferred, pure producer of an operation's wire form.
///
/// Invoked once per send attempt; must be idempotent so a transactional
/// retry can serialize the same operation again.
pub type PayloadFn = Box<dyn Fn() -> PendingWrite + Send + Sync>;

// =============================================================================
// Set Options
// =============================================================================

/// Merge behavior for `set`.
///
/// `merge` and `merge_fields` are mutually exclusive; specifying both is a
/// validation error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    /// Merge all fields present in the data instead of replacing the
    /// document.
    pub merge: bool,
    /// Merge only the named fields; data outside these paths is ignored.
    pub merge_fields: Option<Vec<FieldPath>>,
}

impl SetOptions {
    /// Merge every field present in the data.
    pub fn merge() -> Self {
        Self {
            merge: true,
            merge_fields: None,
        }
    }

    /// Merge only the named fields.
    pub fn merge_fields(paths: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            merge: false,
            merge_fields: Some(paths.into_iter().collect()),
        }
    }

    fn is_merge(&self) -> bool {
        self.merge || self.merge_fields.is_some()
    }
}

// =============================================================================
// Serializer
// =============================================================================

/// Validates user data and builds the per-operation payload thunks.
///
/// Stateless; the writer and the commit coordinator each hold one as their
/// serialization collaborator.
#[derive(Debug, Clone, Default)]
pub struct Serializer;

impl Serializer {
    /// Creates a serializer.
    pub fn new() -> Self {
        Self
    }

    /// Validates `create` data and builds its thunk.
    ///
    /// The write asserts `exists: false`: creating an existing document
    /// fails at the backend.
    pub fn serialize_create(&self, path: &DocumentPath, data: &Value) -> Result<PayloadFn> {
        let map = require_map(data, "create")?;
        validate_map(&mut Vec::new(), map, DeletePolicy::Forbidden, false)?;

        let path = path.clone();
        let data = map.clone();
        Ok(Box::new(move || {
            let mut out = Decomposed::default();
            let fields = decompose_map(&mut Vec::new(), &data, &mut out);
            PendingWrite {
                write: Write {
                    operation: WriteOp::Update(Document {
                        name: path.clone(),
                        fields,
                    }),
                    update_mask: None,
                    update_transforms: out.into_wire_transforms(),
                    current_document: None,
                },
                precondition: Some(Precondition::Exists(false)),
            }
        }))
    }

    /// Validates `set` data and options and builds its thunk.
    pub fn serialize_set(
        &self,
        path: &DocumentPath,
        data: &Value,
        options: Option<SetOptions>,
    ) -> Result<PayloadFn> {
        let map = require_map(data, "set")?;
        let options = options.unwrap_or_default();
        if options.merge && options.merge_fields.is_some() {
            return Err(Error::validation(
                "set() cannot specify both merge and merge_fields",
            ));
        }

        let delete_policy = if options.is_merge() {
            DeletePolicy::MergeField
        } else {
            DeletePolicy::Forbidden
        };
        validate_map(&mut Vec::new(), map, delete_policy, false)?;

        if let Some(paths) = &options.merge_fields {
            if paths.is_empty() {
                return Err(Error::validation(
                    "merge_fields must name at least one field",
                ));
            }
            check_path_conflicts(paths)?;
            for p in paths {
                if !data_contains_path(map, p.segments()) {
                    return Err(Error::validation(format!(
                        "merge field '{}' is not present in the data",
                        p
                    )));
                }
            }
        }

        let path = path.clone();
        let data = map.clone();
        Ok(Box::new(move || {
            let mut out = Decomposed::default();
            let fields = decompose_map(&mut Vec::new(), &data, &mut out);

            let (fields, mask, transforms) = match &options.merge_fields {
                Some(paths) => {
                    let fields = filter_fields(&fields, &mut Vec::new(), paths);
                    let transforms = out
                        .transforms
                        .into_iter()
                        .filter(|(p, _)| paths.iter().any(|m| m == p || m.is_prefix_of(p)))
                        .collect();
                    let mut mask = paths.clone();
                    mask.sort();
                    (fields, Some(mask), transforms)
                }
                None if options.merge => {
                    let mut mask = out.mask;
                    mask.sort();
                    (fields, Some(mask), out.transforms)
                }
                None => (fields, None, out.transforms),
            };

            PendingWrite {
                write: Write {
                    operation: WriteOp::Update(Document {
                        name: path.clone(),
                        fields,
                    }),
                    update_mask: mask.map(|paths| DocumentMask {
                        field_paths: paths.iter().map(FieldPath::canonical).collect(),
                    }),
                    update_transforms: wire_transforms(transforms),
                    current_document: None,
                },
                precondition: None,
            }
        }))
    }

    /// Validates `update` entries and builds its thunk.
    ///
    /// The update mask is the set of updated field paths, including deleted
    /// ones and excluding paths whose value is entirely a transform. The
    /// write always carries a precondition: the caller's update-time
    /// assertion, or `exists: true`.
    pub fn serialize_update(
        &self,
        path: &DocumentPath,
        updates: &[(FieldPath, Value)],
        precondition: Option<Precondition>,
    ) -> Result<PayloadFn> {
        if updates.is_empty() {
            return Err(Error::validation("update() requires at least one field"));
        }
        if let Some(Precondition::Exists(_)) = precondition {
            return Err(Error::validation(
                "update() only supports an update-time precondition",
            ));
        }

        let paths: Vec<FieldPath> = updates.iter().map(|(p, _)| p.clone()).collect();
        check_path_conflicts(&paths)?;

        for (field_path, value) in updates {
            // Delete is legal as the whole entry value; anything nested is
            // validated with deletes forbidden.
            if matches!(value, Value::Delete) {
                continue;
            }
            let mut prefix = field_path.segments().to_vec();
            validate_value(&mut prefix, value, DeletePolicy::Forbidden, false)?;
        }

        let path = path.clone();
        let updates = updates.to_vec();
        Ok(Box::new(move || {
            let mut fields = BTreeMap::new();
            let mut transforms: Vec<(FieldPath, TransformKind)> = Vec::new();
            let mut mask: Vec<FieldPath> = Vec::new();

            for (field_path, value) in &updates {
                if matches!(value, Value::Delete) {
                    mask.push(field_path.clone());
                    continue;
                }
                if let Some(kind) = transform_kind(value) {
                    transforms.push((field_path.clone(), kind));
                    continue;
                }
                let projected = match value {
                    Value::Map(inner) => {
                        let mut out = Decomposed::default();
                        let mut prefix = field_path.segments().to_vec();
                        let nested = decompose_map(&mut prefix, inner, &mut out);
                        transforms.extend(out.transforms);
                        Value::Map(nested)
                    }
                    other => other.clone(),
                };
                insert_at(&mut fields, field_path.segments(), projected);
                mask.push(field_path.clone());
            }
            mask.sort();

            PendingWrite {
                write: Write {
                    operation: WriteOp::Update(Document {
                        name: path.clone(),
                        fields,
                    }),
                    update_mask: Some(DocumentMask {
                        field_paths: mask.iter().map(FieldPath::canonical).collect(),
                    }),
                    update_transforms: wire_transforms(transforms),
                    current_document: None,
                },
                precondition: Some(precondition.unwrap_or(Precondition::Exists(true))),
            }
        }))
    }

    /// Builds the thunk for a document delete.
    pub fn serialize_delete(
        &self,
        path: &DocumentPath,
        precondition: Option<Precondition>,
    ) -> Result<PayloadFn> {
        let path = path.clone();
        Ok(Box::new(move || PendingWrite {
            write: Write {
                operation: WriteOp::Delete(path.clone()),
                update_mask: None,
                update_transforms: Vec::new(),
                current_document: None,
            },
            precondition,
        }))
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Where `Delete` sentinels are legal in the current walk.
#[derive(Debug, Clone, Copy, PartialEq)]
enum DeletePolicy {
    /// No deletes anywhere (`create`, plain `set`, nested update values).
    Forbidden,
    /// Deletes are legal at map positions (`set` with merge).
    MergeField,
}

fn validate_map(
    prefix: &mut Vec<String>,
    map: &BTreeMap<String, Value>,
    delete: DeletePolicy,
    in_array: bool,
) -> Result<()> {
    for (key, value) in map {
        if key.is_empty() {
            return Err(Error::validation(format!(
                "empty field name under '{}'",
                dotted(prefix)
            )));
        }
        prefix.push(key.clone());
        validate_value(prefix, value, delete, in_array)?;
        prefix.pop();
    }
    Ok(())
}

fn validate_value(
    prefix: &mut Vec<String>,
    value: &Value,
    delete: DeletePolicy,
    in_array: bool,
) -> Result<()> {
    if in_array && value.is_sentinel() {
        return Err(Error::validation(format!(
            "sentinel values cannot appear inside an array (at '{}')",
            dotted(prefix)
        )));
    }
    match value {
        Value::Delete => {
            if delete == DeletePolicy::Forbidden {
                return Err(Error::validation(format!(
                    "delete() can only be used in update() or set() with merge (at '{}')",
                    dotted(prefix)
                )));
            }
            Ok(())
        }
        Value::Increment(operand) => match operand.as_ref() {
            Value::Integer(_) | Value::Double(_) => Ok(()),
            _ => Err(Error::validation(format!(
                "increment() operand must be an integer or a double (at '{}')",
                dotted(prefix)
            ))),
        },
        Value::ArrayUnion(elements) | Value::ArrayRemove(elements) => {
            for element in elements {
                validate_value(prefix, element, DeletePolicy::Forbidden, true)?;
            }
            Ok(())
        }
        Value::Array(elements) => {
            if in_array {
                return Err(Error::validation(format!(
                    "nested arrays are not supported (at '{}')",
                    dotted(prefix)
                )));
            }
            for element in elements {
                validate_value(prefix, element, delete, true)?;
            }
            Ok(())
        }
        Value::Map(map) => validate_map(prefix, map, delete, in_array),
        _ => Ok(()),
    }
}

/// Rejects duplicate paths and prefix conflicts (`a` together with `a.b`).
///
/// Relies on the segment-wise ordering of [`FieldPath`]: after sorting, a
/// prefix conflict is always between adjacent paths.
fn check_path_conflicts(paths: &[FieldPath]) -> Result<()> {
    let mut sorted: Vec<&FieldPath> = paths.iter().collect();
    sorted.sort();
    for pair in sorted.windows(2) {
        if pair[0] == pair[1] {
            return Err(Error::validation(format!(
                "field path '{}' is specified more than once",
                pair[0]
            )));
        }
        if pair[0].is_prefix_of(pair[1]) {
            return Err(Error::validation(format!(
                "field path '{}' conflicts with '{}'",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

/// Returns true if the data tree has a value (of any kind, sentinels
/// included) at exactly this path.
fn data_contains_path(map: &BTreeMap<String, Value>, segments: &[String]) -> bool {
    match segments {
        [] => false,
        [head] => map.contains_key(head),
        [head, rest @ ..] => match map.get(head) {
            Some(Value::Map(inner)) => data_contains_path(inner, rest),
            _ => false,
        },
    }
}

// =============================================================================
// Projection
// =============================================================================

/// Accumulator for a decomposition walk: extracted transforms and the mask
/// contributions (leaf values, empty maps, and delete positions, but not
/// transform paths).
#[derive(Debug, Default)]
struct Decomposed {
    transforms: Vec<(FieldPath, TransformKind)>,
    mask: Vec<FieldPath>,
}

impl Decomposed {
    fn into_wire_transforms(self) -> Vec<FieldTransform> {
        wire_transforms(self.transforms)
    }
}

fn wire_transforms(transforms: Vec<(FieldPath, TransformKind)>) -> Vec<FieldTransform> {
    transforms
        .into_iter()
        .map(|(path, transform)| FieldTransform {
            field_path: path.canonical(),
            transform,
        })
        .collect()
}

/// Walks a validated map, removing sentinels: transforms are collected at
/// their paths, delete positions contribute to the mask only, and plain
/// values are cloned into the returned wire fields.
fn decompose_map(
    prefix: &mut Vec<String>,
    map: &BTreeMap<String, Value>,
    out: &mut Decomposed,
) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    for (key, value) in map {
        prefix.push(key.clone());
        if let Some(kind) = transform_kind(value) {
            out.transforms.push((path_at(prefix), kind));
        } else {
            match value {
                Value::Delete => {
                    out.mask.push(path_at(prefix));
                }
                Value::Map(inner) => {
                    if inner.is_empty() {
                        out.mask.push(path_at(prefix));
                        fields.insert(key.clone(), Value::Map(BTreeMap::new()));
                    } else {
                        let nested = decompose_map(prefix, inner, out);
                        fields.insert(key.clone(), Value::Map(nested));
                    }
                }
                other => {
                    out.mask.push(path_at(prefix));
                    fields.insert(key.clone(), other.clone());
                }
            }
        }
        prefix.pop();
    }
    fields
}

/// Keeps only the fields at or under the allowed paths, descending into maps
/// that lie on the way to an allowed path.
fn filter_fields(
    fields: &BTreeMap<String, Value>,
    prefix: &mut Vec<String>,
    allowed: &[FieldPath],
) -> BTreeMap<String, Value> {
    let mut result = BTreeMap::new();
    for (key, value) in fields {
        prefix.push(key.clone());
        let current = path_at(prefix);
        if allowed.iter().any(|a| *a == current || a.is_prefix_of(&current)) {
            result.insert(key.clone(), value.clone());
        } else if allowed.iter().any(|a| current.is_prefix_of(a)) {
            if let Value::Map(inner) = value {
                result.insert(key.clone(), Value::Map(filter_fields(inner, prefix, allowed)));
            }
        }
        prefix.pop();
    }
    result
}

/// Inserts a value at a nested path, creating intermediate maps.
///
/// Paths are conflict-checked before projection, so an intermediate segment
/// never collides with a previously inserted leaf.
fn insert_at(fields: &mut BTreeMap<String, Value>, segments: &[String], value: Value) {
    match segments {
        [] => {}
        [leaf] => {
            fields.insert(leaf.clone(), value);
        }
        [head, rest @ ..] => {
            let entry = fields
                .entry(head.clone())
                .or_insert_with(|| Value::Map(BTreeMap::new()));
            if let Value::Map(inner) = entry {
                insert_at(inner, rest, value);
            }
        }
    }
}

fn transform_kind(value: &Value) -> Option<TransformKind> {
    match value {
        Value::ServerTimestamp => Some(TransformKind::RequestTime),
        Value::ArrayUnion(elements) => Some(TransformKind::ArrayUnion(elements.clone())),
        Value::ArrayRemove(elements) => Some(TransformKind::ArrayRemove(elements.clone())),
        Value::Increment(operand) => Some(TransformKind::Increment((**operand).clone())),
        _ => None,
    }
}

fn path_at(segments: &[String]) -> FieldPath {
    FieldPath::from_segments(segments.to_vec())
}

fn dotted(segments: &[String]) -> String {
    if segments.is_empty() {
        "<root>".to_string()
    } else {
        segments.join(".")
    }
}

fn require_map<'a>(data: &'a Value, method: &str) -> Result<&'a BTreeMap<String, Value>> {
    match data {
        Value::Map(map) => Ok(map),
        _ => Err(Error::validation(format!(
            "{}() data must be a map of fields",
            method
        ))),
    }
}

// =============================================================================
// Tests
// =============================================================================
