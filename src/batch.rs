use chrono::{DateTime, TimeZone, Utc};
use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    iter,
};
use uuid::Uuid;

use crate::{interval::Interval, DATE_FORMAT, MARKER_DATE_FORMAT};

/// The reserved top-level "directory" in the own validation bucket under
/// which task markers are stored. No real aggregation may use this name.
pub const TASK_MARKERS_PREFIX: &str = "task-markers";

/// The kind of batch stored under an object key prefix: an ingestion batch,
/// or a peer validation batch produced by the first or second data share
/// processor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BatchKind {
    Intake,
    PeerValidation { is_first: bool },
}

impl BatchKind {
    /// The peer validation batches a data share processor should aggregate
    /// are the ones produced by the *other* data share processor, so a first
    /// processor looks for validity_1 and vice versa.
    pub fn peer_validation_for(is_first: bool) -> BatchKind {
        BatchKind::PeerValidation { is_first: !is_first }
    }

    /// The infix that appears in object keys for batches of this kind, e.g.
    /// "batch" or "validity_0".
    pub fn infix(&self) -> &'static str {
        match self {
            BatchKind::Intake => "batch",
            BatchKind::PeerValidation { is_first: true } => "validity_0",
            BatchKind::PeerValidation { is_first: false } => "validity_1",
        }
    }
}

impl Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.infix())
    }
}

/// Splits a path in two parts, containing the base path with filename and its
/// file extensions. The extension part, if non-empty, includes the leading
/// `.`, and compound extensions (".batch.avro") are returned whole.
pub fn split_path_extensions(path: &str) -> (&str, &str) {
    path.rmatch_indices(['.', '/'].as_ref())
        // Isolate the last path component by stopping at the first
        // (right-most) '/'
        .take_while(|(_, c)| *c != "/")
        // Pick the last (left-most) '.' as the end of the prefix
        .last()
        .map_or((path, ""), |(i, c)| {
            assert_eq!(c, ".");
            path.split_at(i)
        })
}

/// The role an individual object plays within a batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BatchFilePart {
    /// The metadata header (extension `.<infix>`)
    Header,
    /// The packet file payload (extension `.<infix>.avro`)
    Payload,
    /// The signature over the header (extension `.<infix>.sig`)
    Signature,
}

impl BatchFilePart {
    /// Classifies an extension (as returned by `split_path_extensions`) for
    /// the provided batch kind. Returns None for extensions belonging to
    /// other batch kinds or to foreign objects.
    fn from_extension(extension: &str, kind: BatchKind) -> Option<BatchFilePart> {
        let rest = extension
            .strip_prefix('.')
            .and_then(|e| e.strip_prefix(kind.infix()))?;
        match rest {
            "" => Some(BatchFilePart::Header),
            ".avro" => Some(BatchFilePart::Payload),
            ".sig" => Some(BatchFilePart::Signature),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchPathParseError {
    #[error("component `{0}` is missing")]
    MissingComponent(&'static str),
    #[error("extra trailing components at the end of path: `{0}`")]
    ExtraComponents(String),
    #[error("failed to parse timestamp (at component {})", .field.unwrap_or("[unknown]"))]
    InvalidTimestamp {
        #[source]
        source: chrono::format::ParseError,
        field: Option<&'static str>,
    },
    #[error("invalid uuid")]
    InvalidUuid(#[source] uuid::Error),
}

/// The identity of a batch, as derived from the object keys under which its
/// parts are stored: `<aggregation-id>/YYYY/MM/DD/HH/mm/<uuid>.<suffixes>`.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct BatchPath {
    pub aggregation_id: String,
    pub time: DateTime<Utc>,
    pub batch_id: Uuid,
}

impl BatchPath {
    /// Parses a batch path from an object key prefix with its extensions
    /// already stripped (see `split_path_extensions`).
    pub fn parse_from_prefix(path_prefix: &str) -> Result<Self, BatchPathParseError> {
        use chrono::format::{self, Item, Numeric, Pad, Parsed};
        use BatchPathParseError::*;

        fn text_component<'a>(
            components: &mut impl Iterator<Item = &'a str>,
            component_label: &'static str,
        ) -> Result<&'a str, BatchPathParseError> {
            components.next().ok_or(MissingComponent(component_label))
        }

        fn datetime_component<'a>(
            components: &mut impl Iterator<Item = &'a str>,
            partial_datetime: &mut Parsed,
            numeric_field_type: Numeric,
            component_label: &'static str,
        ) -> Result<(), BatchPathParseError> {
            format::parse(
                partial_datetime,
                text_component(components, component_label)?,
                iter::once(Item::Numeric(numeric_field_type, Pad::None)),
            )
            .map_err(|e| InvalidTimestamp {
                source: e,
                field: Some(component_label),
            })
        }

        // Path format: `{aggregation_id}/YYYY/mm/dd/HH/MM/{batch_id}`
        let mut components = path_prefix.splitn(8, '/');
        let c = &mut components;

        let aggregation_id = text_component(c, "aggregation_id")?.to_owned();

        let mut partial_datetime = Parsed::new();
        let dt = &mut partial_datetime;
        datetime_component(c, dt, Numeric::Year, "year")?;
        datetime_component(c, dt, Numeric::Month, "month")?;
        datetime_component(c, dt, Numeric::Day, "day")?;
        datetime_component(c, dt, Numeric::Hour, "hour")?;
        datetime_component(c, dt, Numeric::Minute, "minute")?;
        let time = partial_datetime
            .to_naive_date()
            .and_then(|date| {
                partial_datetime
                    .to_naive_time()
                    .map(|time| date.and_time(time))
            })
            .map(|naive| Utc.from_utc_datetime(&naive))
            .map_err(|e| InvalidTimestamp {
                source: e,
                field: None,
            })?;

        let batch_id = text_component(c, "batch_id")?
            .parse()
            .map_err(InvalidUuid)?;

        if let Some(remainder) = components.next() {
            assert!(components.next().is_none());
            return Err(ExtraComponents(remainder.to_owned()));
        }

        Ok(BatchPath {
            aggregation_id,
            time,
            batch_id,
        })
    }

    /// The object key prefix for this batch, without any extensions.
    pub fn key_prefix(&self) -> String {
        format!(
            "{}/{}/{}",
            self.aggregation_id,
            self.time.format(DATE_FORMAT),
            self.batch_id
        )
    }

    /// The name of the marker object recording that an intake task was
    /// scheduled for this batch.
    pub fn intake_task_marker(&self) -> String {
        format!(
            "intake-{}-{}-{}",
            self.aggregation_id,
            self.time.format(MARKER_DATE_FORMAT),
            self.batch_id
        )
    }
}

impl Display for BatchPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.key_prefix())
    }
}

/// The name of the marker object recording that an aggregate task was
/// scheduled for the aggregation window beginning at `window_begin`.
pub fn aggregate_task_marker(aggregation_id: &str, window_begin: DateTime<Utc>) -> String {
    format!(
        "aggregate-{}-{}",
        aggregation_id,
        window_begin.format(MARKER_DATE_FORMAT)
    )
}

/// An intake task marker name, decomposed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IntakeMarker {
    pub aggregation_id: String,
    pub time: DateTime<Utc>,
    pub batch_id: Uuid,
}

/// An aggregate task marker name, decomposed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AggregateMarker {
    pub aggregation_id: String,
    pub window_begin: DateTime<Utc>,
}

const MARKER_UUID_LEN: usize = 36;
const MARKER_DATE_LEN: usize = 16;

/// Parses an intake task marker name
/// (`intake-<aggregation-id>-YYYY-MM-DD-HH-mm-<uuid>`). Aggregation ids may
/// themselves contain `-`, so the name is dissected from the right: the last
/// 36 characters are the batch UUID and the 16 characters before it are the
/// timestamp. Returns None for names that do not match the pattern.
pub fn parse_intake_marker(marker_name: &str) -> Option<IntakeMarker> {
    let rest = marker_name.strip_prefix("intake-")?;
    if rest.len() <= MARKER_UUID_LEN + 1 + MARKER_DATE_LEN + 1 {
        return None;
    }
    let (rest, uuid) = rest.split_at(rest.len() - MARKER_UUID_LEN);
    let batch_id = Uuid::parse_str(uuid).ok()?;
    let rest = rest.strip_suffix('-')?;
    let (aggregation_id, date) = rest.split_at(rest.len() - MARKER_DATE_LEN);
    let aggregation_id = aggregation_id.strip_suffix('-')?;
    if aggregation_id.is_empty() {
        return None;
    }
    Some(IntakeMarker {
        aggregation_id: aggregation_id.to_owned(),
        time: parse_marker_date(date)?,
        batch_id,
    })
}

/// Parses an aggregate task marker name
/// (`aggregate-<aggregation-id>-YYYY-MM-DD-HH-mm`), dissected from the right
/// like `parse_intake_marker`.
pub fn parse_aggregate_marker(marker_name: &str) -> Option<AggregateMarker> {
    let rest = marker_name.strip_prefix("aggregate-")?;
    if rest.len() <= MARKER_DATE_LEN + 1 {
        return None;
    }
    let (aggregation_id, date) = rest.split_at(rest.len() - MARKER_DATE_LEN);
    let aggregation_id = aggregation_id.strip_suffix('-')?;
    if aggregation_id.is_empty() {
        return None;
    }
    Some(AggregateMarker {
        aggregation_id: aggregation_id.to_owned(),
        window_begin: parse_marker_date(date)?,
    })
}

fn parse_marker_date(date: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(date, MARKER_DATE_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// A batch discovered by listing an ingestion or validation bucket, along
/// with which of its constituent objects were seen.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiscoveredBatch {
    pub path: BatchPath,
    pub kind: BatchKind,
    pub has_header: bool,
    pub has_payload: bool,
    pub has_signature: bool,
}

impl DiscoveredBatch {
    fn new(path: BatchPath, kind: BatchKind) -> DiscoveredBatch {
        DiscoveredBatch {
            path,
            kind,
            has_header: false,
            has_payload: false,
            has_signature: false,
        }
    }

    /// True if enough of the batch is present for a task to be scheduled
    /// over it. Ingestion batches need the header, the packet file and the
    /// signature. Peer validation batches are ready once the signature is
    /// present, as the other objects may not have been mirrored yet.
    pub fn is_ready(&self) -> bool {
        match self.kind {
            BatchKind::Intake => self.has_header && self.has_payload && self.has_signature,
            BatchKind::PeerValidation { .. } => self.has_signature,
        }
    }
}

/// Groups the provided object keys into batches of the provided kind. Keys
/// whose extension does not belong to `kind`, and keys that do not parse as
/// batch paths, are ignored: buckets may contain foreign objects and batches
/// of other kinds, and it is not this function's job to reject them.
pub fn gather_batches(keys: &[String], kind: BatchKind) -> Vec<DiscoveredBatch> {
    let mut batches: BTreeMap<BatchPath, DiscoveredBatch> = BTreeMap::new();
    for key in keys {
        let (prefix, extension) = split_path_extensions(key);
        let part = match BatchFilePart::from_extension(extension, kind) {
            Some(part) => part,
            None => continue,
        };
        let path = match BatchPath::parse_from_prefix(prefix) {
            Ok(path) => path,
            Err(_) => continue,
        };
        let batch = batches
            .entry(path.clone())
            .or_insert_with(|| DiscoveredBatch::new(path, kind));
        match part {
            BatchFilePart::Header => batch.has_header = true,
            BatchFilePart::Payload => batch.has_payload = true,
            BatchFilePart::Signature => batch.has_signature = true,
        }
    }
    batches.into_values().collect()
}

/// Filters discovered batches down to the ready ones whose timestamp falls
/// within `interval`.
pub fn ready_batches_in(
    batches: Vec<DiscoveredBatch>,
    interval: &Interval,
) -> Vec<DiscoveredBatch> {
    batches
        .into_iter()
        .filter(|batch| batch.is_ready() && interval.contains(batch.path.time))
        .collect()
}
