use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::format_description::BorrowedFormatItem;
use time::macros::{datetime, format_description};
use time::{OffsetDateTime, PrimitiveDateTime, Time};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WishError {
    #[error("unsupported archive structure: {0}")]
    UnsupportedSchema(String),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("cannot merge {attribute}: master has `{master}`, branch has `{branch}`")]
    MergeConflict { attribute: String, master: String, branch: String },
    #[error("category mismatch: expected `{expected}`, found `{found}`")]
    CategoryMismatch { expected: String, found: String },
    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(String),
}

/// Wall-clock layout shared by every archive dialect and the vendor API.
pub const WALL_CLOCK_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Interchange schema version stamped into exported archives.
pub const UIGF_VERSION: &str = "v2.2";

// Identifier timestamps switched from zeroed to fixed minutes on this day.
const MINUTE_FIX_CUTOVER: PrimitiveDateTime = datetime!(2020-12-31 00:00:00);
// From this instant the uid tail is folded into the disambiguation offset.
const UID_EMBED_CUTOVER: PrimitiveDateTime = datetime!(2021-11-24 07:00:00);
// Day zero of the live service, used as the epoch for patched identifiers.
const LAUNCH_EPOCH: PrimitiveDateTime = datetime!(2020-09-28 00:00:00);

/// Parse a `"YYYY-MM-DD HH:MM:SS"` wall-clock string.
///
/// # Errors
/// Returns [`WishError::InvalidTimestamp`] when the input does not match the
/// uniform layout. No correction of malformed inputs is attempted.
pub fn parse_wall_clock(value: &str) -> Result<PrimitiveDateTime, WishError> {
    PrimitiveDateTime::parse(value, WALL_CLOCK_FORMAT)
        .map_err(|_| WishError::InvalidTimestamp(value.to_string()))
}

#[must_use]
pub fn format_wall_clock(stamp: PrimitiveDateTime) -> String {
    stamp.format(WALL_CLOCK_FORMAT).unwrap_or_default()
}

/// Unix seconds of a wall-clock stamp, pinned to UTC so identifier synthesis
/// does not depend on the host timezone.
#[must_use]
pub fn unix_seconds(stamp: PrimitiveDateTime) -> i64 {
    stamp.assume_utc().unix_timestamp()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum GachaType {
    #[serde(rename = "100")]
    Beginner,
    #[serde(rename = "200")]
    Standard,
    #[serde(rename = "301")]
    CharacterEvent,
    #[serde(rename = "302")]
    WeaponEvent,
    #[serde(rename = "400")]
    CharacterEvent2,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GachaTypeMeta {
    pub code: &'static str,
    pub label: &'static str,
    pub pity_ceiling: u32,
    pub interchange_code: &'static str,
}

impl GachaType {
    pub const ALL: [Self; 5] = [
        Self::Beginner,
        Self::Standard,
        Self::CharacterEvent,
        Self::WeaponEvent,
        Self::CharacterEvent2,
    ];

    #[must_use]
    pub fn meta(self) -> GachaTypeMeta {
        match self {
            Self::Beginner => GachaTypeMeta {
                code: "100",
                label: "Beginners' Wish",
                pity_ceiling: 90,
                interchange_code: "100",
            },
            Self::Standard => GachaTypeMeta {
                code: "200",
                label: "Wanderlust Invocation",
                pity_ceiling: 90,
                interchange_code: "200",
            },
            Self::CharacterEvent => GachaTypeMeta {
                code: "301",
                label: "Character Event Wish",
                pity_ceiling: 90,
                interchange_code: "301",
            },
            Self::WeaponEvent => GachaTypeMeta {
                code: "302",
                label: "Weapon Event Wish",
                pity_ceiling: 80,
                interchange_code: "302",
            },
            Self::CharacterEvent2 => GachaTypeMeta {
                code: "400",
                label: "Character Event Wish-2",
                pity_ceiling: 90,
                interchange_code: "301",
            },
        }
    }

    #[must_use]
    pub fn code(self) -> &'static str {
        self.meta().code
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        self.meta().label
    }

    #[must_use]
    pub fn pity_ceiling(self) -> u32 {
        self.meta().pity_ceiling
    }

    #[must_use]
    pub fn interchange_code(self) -> &'static str {
        self.meta().interchange_code
    }

    /// The category this one is folded into by the interchange dialect.
    #[must_use]
    pub fn interchange_group(self) -> Self {
        match self {
            Self::CharacterEvent2 => Self::CharacterEvent,
            other => other,
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "100" => Some(Self::Beginner),
            "200" => Some(Self::Standard),
            "301" => Some(Self::CharacterEvent),
            "302" => Some(Self::WeaponEvent),
            "400" => Some(Self::CharacterEvent2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Item {
    pub name: String,
    pub item_type: String,
    pub rank: u8,
    pub lang: String,
    pub item_id: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Record {
    pub id: String,
    pub time: Option<PrimitiveDateTime>,
    pub gacha_type: GachaType,
    pub uigf_type: Option<GachaType>,
    pub item: Item,
    pub count: u32,
    pub uid: String,
}

impl Record {
    /// The interchange category: the declared one when present, otherwise
    /// the canonical grouping of the internal category.
    #[must_use]
    pub fn interchange_type(&self) -> GachaType {
        self.uigf_type
            .unwrap_or_else(|| self.gacha_type.interchange_group())
    }
}

/// Serialize one record into the flat field-keyed row shape used by archives.
/// Empty player scope fields (`uid`, `lang`) are omitted rather than emitted
/// blank; `uigf_gacha_type` is emitted only when the record declares one.
#[must_use]
pub fn record_to_row(record: &Record) -> Value {
    let mut row = Map::new();
    if !record.uid.is_empty() {
        row.insert("uid".to_string(), Value::String(record.uid.clone()));
    }
    row.insert(
        "gacha_type".to_string(),
        Value::String(record.gacha_type.code().to_string()),
    );
    row.insert("item_id".to_string(), Value::String(record.item.item_id.clone()));
    row.insert("count".to_string(), Value::String(record.count.to_string()));
    if let Some(time) = record.time {
        row.insert("time".to_string(), Value::String(format_wall_clock(time)));
    }
    row.insert("name".to_string(), Value::String(record.item.name.clone()));
    if !record.item.lang.is_empty() {
        row.insert("lang".to_string(), Value::String(record.item.lang.clone()));
    }
    row.insert("item_type".to_string(), Value::String(record.item.item_type.clone()));
    row.insert("rank_type".to_string(), Value::String(record.item.rank.to_string()));
    row.insert("id".to_string(), Value::String(record.id.clone()));
    if let Some(uigf) = record.uigf_type {
        row.insert("uigf_gacha_type".to_string(), Value::String(uigf.code().to_string()));
    }
    Value::Object(row)
}

/// Parse one archive row back into a typed record.
///
/// Textual number fields (`count`, `rank_type`) accept either JSON strings or
/// numbers. `id`, `uid`, `item_id` default to empty, `count` to 1 and `lang`
/// to `zh-cn` when absent; an unknown `uigf_gacha_type` is dropped rather
/// than rejected.
///
/// # Errors
/// Returns [`WishError::SchemaMismatch`] when a required field is missing or
/// malformed, and [`WishError::InvalidTimestamp`] when `time` does not parse.
pub fn record_from_row(row: &Value) -> Result<Record, WishError> {
    let map = row
        .as_object()
        .ok_or_else(|| WishError::SchemaMismatch("record row is not an object".to_string()))?;

    let gacha_code = text_field(map, "gacha_type")
        .ok_or_else(|| WishError::SchemaMismatch("record row is missing gacha_type".to_string()))?;
    let gacha_type = GachaType::parse(&gacha_code)
        .ok_or_else(|| WishError::SchemaMismatch(format!("unknown gacha_type code `{gacha_code}`")))?;

    let time_text = text_field(map, "time")
        .ok_or_else(|| WishError::SchemaMismatch("record row is missing time".to_string()))?;
    let time = Some(parse_wall_clock(&time_text)?);

    let name = text_field(map, "name")
        .ok_or_else(|| WishError::SchemaMismatch("record row is missing name".to_string()))?;
    let item_type = text_field(map, "item_type")
        .ok_or_else(|| WishError::SchemaMismatch("record row is missing item_type".to_string()))?;
    let rank_text = text_field(map, "rank_type")
        .ok_or_else(|| WishError::SchemaMismatch("record row is missing rank_type".to_string()))?;
    let rank = rank_text
        .parse::<u8>()
        .map_err(|_| WishError::SchemaMismatch(format!("rank_type `{rank_text}` is not a small integer")))?;

    let count = match text_field(map, "count") {
        Some(count_text) => count_text
            .parse::<u32>()
            .map_err(|_| WishError::SchemaMismatch(format!("count `{count_text}` is not an integer")))?,
        None => 1,
    };

    Ok(Record {
        id: text_field(map, "id").unwrap_or_default(),
        time,
        gacha_type,
        uigf_type: text_field(map, "uigf_gacha_type").and_then(|code| GachaType::parse(&code)),
        item: Item {
            name,
            item_type,
            rank,
            lang: text_field(map, "lang").unwrap_or_else(|| "zh-cn".to_string()),
            item_id: text_field(map, "item_id").unwrap_or_default(),
        },
        count,
        uid: text_field(map, "uid").unwrap_or_default(),
    })
}

fn text_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn integer_field(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

/// Clear the per-record player scope before exporting rows that already
/// carry uid/language at collection level.
#[must_use]
pub fn strip_player_scope(mut record: Record) -> Record {
    record.uid = String::new();
    record.item.lang = String::new();
    record
}

/// Recover a wall-clock timestamp from the leading ten digits of a
/// decimal-fit identifier. The recovered value is a bucket boundary, not the
/// exact pull time. Records whose identifier has no usable prefix are
/// returned unchanged.
#[must_use]
pub fn fix_time_from_id(mut record: Record) -> Record {
    let recovered = record
        .id
        .get(..10)
        .and_then(|prefix| prefix.parse::<i64>().ok())
        .and_then(|stamp| OffsetDateTime::from_unix_timestamp(stamp).ok());
    if let Some(utc) = recovered {
        record.time = Some(PrimitiveDateTime::new(utc.date(), utc.time()));
    }
    record
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RecordField {
    Uid,
    GachaType,
    ItemId,
    Count,
    Time,
    Name,
    Lang,
    ItemType,
    Rank,
    Id,
    InterchangeType,
}

impl RecordField {
    #[must_use]
    pub fn extract(self, record: &Record) -> String {
        match self {
            Self::Uid => record.uid.clone(),
            Self::GachaType => record.gacha_type.code().to_string(),
            Self::ItemId => record.item.item_id.clone(),
            Self::Count => record.count.to_string(),
            Self::Time => record.time.map(format_wall_clock).unwrap_or_default(),
            Self::Name => record.item.name.clone(),
            Self::Lang => record.item.lang.clone(),
            Self::ItemType => record.item.item_type.clone(),
            Self::Rank => record.item.rank.to_string(),
            Self::Id => record.id.clone(),
            Self::InterchangeType => record.interchange_type().code().to_string(),
        }
    }
}

/// One level of a multi-level grouping: a field selector plus an optional
/// transform applied to the rendered field value before it is used as a key.
#[derive(Debug, Clone, Copy)]
pub struct GroupKey {
    field: RecordField,
    transform: Option<fn(&str) -> String>,
}

impl GroupKey {
    #[must_use]
    pub fn field(field: RecordField) -> Self {
        Self { field, transform: None }
    }

    #[must_use]
    pub fn mapped(field: RecordField, transform: fn(&str) -> String) -> Self {
        Self { field, transform: Some(transform) }
    }

    fn apply(self, record: &Record) -> String {
        let raw = self.field.extract(record);
        match self.transform {
            Some(transform) => transform(&raw),
            None => raw,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Grouped {
    Records(Vec<Record>),
    Groups(BTreeMap<String, Grouped>),
}

impl Grouped {
    #[must_use]
    pub fn total(&self) -> usize {
        match self {
            Self::Records(records) => records.len(),
            Self::Groups(groups) => groups.values().map(Grouped::total).sum(),
        }
    }

    #[must_use]
    pub fn as_records(&self) -> Option<&[Record]> {
        match self {
            Self::Records(records) => Some(records),
            Self::Groups(_) => None,
        }
    }

    #[must_use]
    pub fn as_groups(&self) -> Option<&BTreeMap<String, Grouped>> {
        match self {
            Self::Records(_) => None,
            Self::Groups(groups) => Some(groups),
        }
    }
}

fn group_records(records: Vec<Record>, keys: &[GroupKey]) -> Grouped {
    let Some((first, rest)) = keys.split_first() else {
        return Grouped::Records(records);
    };
    let mut buckets: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for record in records {
        buckets.entry(first.apply(&record)).or_default().push(record);
    }
    Grouped::Groups(
        buckets
            .into_iter()
            .map(|(key, bucket)| (key, group_records(bucket, rest)))
            .collect(),
    )
}

/// An ordered record sequence plus collection-level metadata, optionally
/// scoped to a single category.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Wish {
    pub gacha_type: Option<GachaType>,
    pub uid: String,
    pub region: String,
    pub language: String,
    pub records: Vec<Record>,
}

impl Wish {
    #[must_use]
    pub fn scoped(gacha_type: GachaType) -> Self {
        Self { gacha_type: Some(gacha_type), ..Self::default() }
    }

    #[must_use]
    pub fn pity_ceiling(&self) -> u32 {
        self.gacha_type.map_or(0, GachaType::pity_ceiling)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn extend(&mut self, records: Vec<Record>) {
        self.records.extend(records);
    }

    /// Concatenate another collection's records into this one and back-fill
    /// empty collection metadata from the absorbed side.
    ///
    /// # Errors
    /// Returns [`WishError::CategoryMismatch`] when both collections are
    /// scoped to different categories; nothing is appended in that case.
    pub fn append(&mut self, other: Wish) -> Result<(), WishError> {
        if let (Some(expected), Some(found)) = (self.gacha_type, other.gacha_type) {
            if expected != found {
                return Err(WishError::CategoryMismatch {
                    expected: expected.code().to_string(),
                    found: found.code().to_string(),
                });
            }
        }
        self.records.extend(other.records);
        if self.uid.is_empty() {
            self.uid = other.uid;
        }
        if self.region.is_empty() {
            self.region = other.region;
        }
        if self.language.is_empty() {
            self.language = other.language;
        }
        Ok(())
    }

    /// Stable ascending sort by `(time, id)`.
    pub fn sort(&mut self) {
        self.records
            .sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));
    }

    /// Stable sort under a caller-supplied total key.
    pub fn sort_with<K, F>(&mut self, key: F)
    where
        K: Ord,
        F: FnMut(&Record) -> K,
    {
        self.records.sort_by_key(key);
    }

    /// Stable ascending sort by `(interchange category code, time, id)`,
    /// the order used when migrating across dialects.
    pub fn sort_by_interchange(&mut self) {
        self.records.sort_by(|a, b| {
            a.interchange_type()
                .code()
                .cmp(b.interchange_type().code())
                .then_with(|| a.time.cmp(&b.time))
                .then_with(|| a.id.cmp(&b.id))
        });
    }

    /// Remove every record whose identifier equals the immediately preceding
    /// record's identifier, keeping the first of each run.
    ///
    /// Precondition: the list is sorted with the identifier as an at least
    /// secondary key. This is a single adjacency scan; non-adjacent
    /// duplicates survive. Records with equal empty identifiers collapse
    /// like any other run.
    pub fn deduplicate(&mut self) {
        self.records.dedup_by(|current, previous| current.id == previous.id);
    }

    /// Apply a pure transform to every record, replacing the contents.
    pub fn maps<F: FnMut(Record) -> Record>(&mut self, mapping: F) {
        let records = std::mem::take(&mut self.records);
        self.records = records.into_iter().map(mapping).collect();
    }

    /// Multi-level classification keyed by successive [`GroupKey`] levels.
    #[must_use]
    pub fn group_by(&self, keys: &[GroupKey]) -> Grouped {
        group_records(self.records.clone(), keys)
    }

    /// Back-fill empty collection uid/language from the most recent record
    /// that carries them. Used after a fetch, where metadata arrives
    /// embedded per record rather than collection-level.
    pub fn pad(&mut self) {
        if self.uid.is_empty() {
            if let Some(record) = self.records.iter().rev().find(|record| !record.uid.is_empty()) {
                self.uid = record.uid.clone();
            }
        }
        if self.language.is_empty() {
            let filled = self.records.iter().rev().find(|record| !record.item.lang.is_empty());
            if let Some(record) = filled {
                self.language = record.item.lang.clone();
            }
        }
    }
}

/// Synthesize a decimal-fit identifier shaped like the vendor's own.
///
/// The timestamp is truncated to a coarse bucket (minutes and seconds zeroed
/// before the minute-fix cutover, minute pinned to 6 afterwards) and rendered
/// as ten zero-padded Unix-second digits. The nine-digit right part is the
/// offset, with the last two uid digits folded in from the uid-embed cutover
/// onward. Out-of-range offsets wrap modulo 10^9; no range check is applied.
///
/// # Errors
/// Returns [`WishError::InvalidTimestamp`] when `wish_time` does not parse.
pub fn fit_id(wish_time: &str, offset: u64, uid: u64) -> Result<String, WishError> {
    let stamp = parse_wall_clock(wish_time)?;
    let minute = if stamp <= MINUTE_FIX_CUTOVER { 0 } else { 6 };
    let clock = Time::from_hms(stamp.hour(), minute, 0).unwrap_or(Time::MIDNIGHT);
    let left = format!("{:010}", unix_seconds(stamp.replace_time(clock)));

    let disambiguator = if stamp >= UID_EMBED_CUTOVER {
        // reduce before widening so the uid recombination cannot overflow
        (offset % 10_000_000) * 100 + uid % 100
    } else {
        offset
    };
    let right = format!("{:09}", disambiguator % 1_000_000_000);

    Ok(format!("{left}{right}"))
}

/// Synthesize a bit-packed identifier: Unix seconds shifted left by 30
/// (masked `0x7FFF_FFFF_C000_0000`), a 14-bit generator tag, a 12-bit player
/// tag and a 4-bit offset. Out-of-range tags are masked, never rejected; the
/// top bit stays clear so the value is always a non-negative `i64`.
///
/// # Errors
/// Returns [`WishError::InvalidTimestamp`] when `wish_time` does not parse.
pub fn make_id(wish_time: &str, generator: u16, player: u16, offset: u8) -> Result<i64, WishError> {
    let stamp = unix_seconds(parse_wall_clock(wish_time)?);
    let stamp_bits = u64::try_from(stamp).unwrap_or(0);
    let packed = (0x7FFF_FFFF_C000_0000 & (stamp_bits << 30))
        | (0x3FFF_0000 & (u64::from(generator) << 16))
        | (0xFFF0 & (u64::from(player) << 4))
        | (0xF & u64::from(offset));
    Ok(i64::try_from(packed).unwrap_or(i64::MAX))
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PatchSummary {
    pub missing: usize,
    pub patched: usize,
}

/// Fill absent identifiers across every category of a shelf.
///
/// Records are grouped by consecutive runs of identical timestamps; each run
/// is re-sorted by identifier (empties first) and its id-less records receive
/// `<seconds since launch><uid padded to 9><run offset>`. The offset is a
/// single unpadded digit that overflows into further digits from the
/// eleventh same-timestamp record onward. Records with no timestamp are
/// re-sorted but never filled. Returns how many identifiers were missing on
/// entry and how many were actually filled.
pub fn patch_id64(shelf: &mut PlayerShelf, fallback_uid: Option<&str>) -> PatchSummary {
    let shelf_uid = shelf.uid.clone();
    let mut summary = PatchSummary::default();

    for wish in shelf.wishes.values() {
        summary.missing += wish.records.iter().filter(|record| record.id.is_empty()).count();
    }

    for wish in shelf.wishes.values_mut() {
        let records = std::mem::take(&mut wish.records);
        let mut results = Vec::with_capacity(records.len());
        let mut remaining = records.into_iter().peekable();

        while let Some(first) = remaining.next() {
            let group_time = first.time;
            let mut group = vec![first];
            while let Some(record) = remaining.next_if(|record| record.time == group_time) {
                group.push(record);
            }
            group.sort_by(|a, b| a.id.cmp(&b.id));

            if let Some(time) = group_time {
                let seconds = unix_seconds(time) - unix_seconds(LAUNCH_EPOCH);
                let mut offset = 0_u32;
                for record in &mut group {
                    if !record.id.is_empty() {
                        continue;
                    }
                    let uid = if record.uid.is_empty() {
                        if shelf_uid.is_empty() {
                            fallback_uid.unwrap_or_default()
                        } else {
                            shelf_uid.as_str()
                        }
                    } else {
                        record.uid.as_str()
                    };
                    record.id = format!("{seconds}{uid:0>9}{offset}");
                    offset += 1;
                    summary.patched += 1;
                }
            }
            results.append(&mut group);
        }
        wish.records = results;
    }

    summary
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    Allow,
    Ignore,
    #[default]
    Reject,
}

impl MergePolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Ignore => "ignore",
            Self::Reject => "reject",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allow" => Some(Self::Allow),
            "ignore" => Some(Self::Ignore),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct MergePolicySet {
    pub uid: MergePolicy,
    pub region: MergePolicy,
    pub language: MergePolicy,
}

impl MergePolicySet {
    #[must_use]
    pub fn uniform(policy: MergePolicy) -> Self {
        Self { uid: policy, region: policy, language: policy }
    }
}

/// Reconcile one identity attribute between master and branch. Equal values
/// always pass. `Allow` overwrites master, `Ignore` keeps it, `Reject`
/// surfaces the disagreement.
///
/// # Errors
/// Returns [`WishError::MergeConflict`] naming the attribute and both values
/// under the `Reject` policy.
pub fn reconcile_field(
    attribute: &str,
    master: &mut String,
    branch: &str,
    policy: MergePolicy,
) -> Result<(), WishError> {
    if master.as_str() == branch {
        return Ok(());
    }
    match policy {
        MergePolicy::Allow => {
            branch.clone_into(master);
            Ok(())
        }
        MergePolicy::Ignore => Ok(()),
        MergePolicy::Reject => Err(WishError::MergeConflict {
            attribute: attribute.to_string(),
            master: master.clone(),
            branch: branch.to_string(),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct ExportMeta {
    pub app: String,
    pub app_version: String,
    pub exported_at: PrimitiveDateTime,
}

impl ExportMeta {
    #[must_use]
    pub fn new(app: &str, app_version: &str, exported_at: PrimitiveDateTime) -> Self {
        Self {
            app: app.to_string(),
            app_version: app_version.to_string(),
            exported_at,
        }
    }
}

/// Info-block fields an archive carries but the collection does not use.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ArchiveExtra {
    pub export_time: Option<PrimitiveDateTime>,
    pub export_timestamp: Option<i64>,
}

fn info_block(uid: &str, region: &str, language: &str, meta: &ExportMeta) -> Value {
    json!({
        "uid": uid,
        "lang": language,
        "region": region,
        "export_time": format_wall_clock(meta.exported_at),
        "export_timestamp": unix_seconds(meta.exported_at),
        "export_app": meta.app,
        "export_app_version": meta.app_version,
        "uigf_version": UIGF_VERSION,
    })
}

fn require_archive_object<'a>(
    archive: &'a Value,
    keys: &[&str],
) -> Result<&'a Map<String, Value>, WishError> {
    let root = archive.as_object().ok_or_else(|| {
        WishError::UnsupportedSchema("archive root must be a JSON object".to_string())
    })?;
    let missing = keys
        .iter()
        .copied()
        .filter(|key| !root.contains_key(*key))
        .map(str::to_string)
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(WishError::UnsupportedSchema(format!(
            "archive is missing keys: {}",
            missing.join(", ")
        )));
    }
    Ok(root)
}

fn info_text(info: Option<&Map<String, Value>>, key: &str) -> String {
    info.and_then(|map| text_field(map, key)).unwrap_or_default()
}

fn extra_from_info(info: Option<&Map<String, Value>>) -> ArchiveExtra {
    let export_time = info
        .and_then(|map| text_field(map, "export_time"))
        .and_then(|text| parse_wall_clock(&text).ok());
    let export_timestamp = info
        .and_then(|map| map.get("export_timestamp"))
        .and_then(integer_field);
    ArchiveExtra { export_time, export_timestamp }
}

/// Whole-player aggregate with all categories pooled into one collection.
#[derive(Debug, Clone, Default)]
pub struct PlayerPool {
    pub uid: String,
    pub region: String,
    pub language: String,
    pub policy: MergePolicySet,
    pub wish: Wish,
}

impl PlayerPool {
    #[must_use]
    pub fn new(uid: &str, region: &str, language: &str) -> Self {
        Self {
            uid: uid.to_string(),
            region: region.to_string(),
            language: language.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn nonempty(&self) -> bool {
        !self.wish.is_empty()
    }

    /// Reconcile identity attributes in the order uid, region, language,
    /// then append the branch's records. The attribute checks are not
    /// transactional as a unit: an earlier `Allow` overwrite persists even
    /// when a later attribute rejects. No deduplication is performed;
    /// callers sort and deduplicate afterwards.
    ///
    /// # Errors
    /// Returns [`WishError::MergeConflict`] from the first rejecting
    /// attribute; the branch's records are not appended in that case.
    pub fn merge(&mut self, branch: PlayerPool) -> Result<(), WishError> {
        reconcile_field("uid", &mut self.uid, &branch.uid, self.policy.uid)?;
        reconcile_field("region", &mut self.region, &branch.region, self.policy.region)?;
        reconcile_field("language", &mut self.language, &branch.language, self.policy.language)?;
        self.wish.extend(branch.wish.records);
        Ok(())
    }

    /// Export as the single-pool archive shape `{"info": .., "list": [..]}`.
    #[must_use]
    pub fn dump(&self, meta: &ExportMeta) -> Value {
        json!({
            "info": info_block(&self.uid, &self.region, &self.language, meta),
            "list": self.wish.records.iter().map(record_to_row).collect::<Vec<_>>(),
        })
    }

    /// Replace this aggregate's contents from a single-pool archive.
    ///
    /// # Errors
    /// Returns [`WishError::UnsupportedSchema`] when the top level is not an
    /// object, lacks `info`/`list`, or `list` is not an array; row-level
    /// failures propagate as [`WishError::SchemaMismatch`] or
    /// [`WishError::InvalidTimestamp`].
    pub fn load(&mut self, archive: &Value) -> Result<ArchiveExtra, WishError> {
        let root = require_archive_object(archive, &["info", "list"])?;
        let info = root.get("info").and_then(Value::as_object);
        let rows = root.get("list").and_then(Value::as_array).ok_or_else(|| {
            WishError::UnsupportedSchema("archive `list` must be an array".to_string())
        })?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(record_from_row(row)?);
        }
        self.uid = info_text(info, "uid");
        self.language = info_text(info, "lang");
        self.region = info_text(info, "region");
        self.wish = Wish { records, ..Wish::default() };
        Ok(extra_from_info(info))
    }

    /// Re-bucket into a per-category shelf keyed by each record's category.
    #[must_use]
    pub fn into_shelf(self) -> PlayerShelf {
        self.into_shelf_by(|record| record.gacha_type)
    }

    /// Re-bucket into a per-category shelf under a caller-supplied key.
    #[must_use]
    pub fn into_shelf_by<F: Fn(&Record) -> GachaType>(self, bucket_key: F) -> PlayerShelf {
        let mut shelf = PlayerShelf {
            uid: self.uid,
            region: self.region,
            language: self.language,
            policy: self.policy,
            wishes: BTreeMap::new(),
        };
        for record in self.wish.records {
            shelf.bucket(bucket_key(&record)).records.push(record);
        }
        shelf
    }
}

/// Whole-player aggregate with one scoped collection per category.
#[derive(Debug, Clone, Default)]
pub struct PlayerShelf {
    pub uid: String,
    pub region: String,
    pub language: String,
    pub policy: MergePolicySet,
    pub wishes: BTreeMap<GachaType, Wish>,
}

impl PlayerShelf {
    #[must_use]
    pub fn new(uid: &str, region: &str, language: &str) -> Self {
        Self {
            uid: uid.to_string(),
            region: region.to_string(),
            language: language.to_string(),
            ..Self::default()
        }
    }

    /// The collection for one category, materialized empty on first access.
    pub fn bucket(&mut self, gacha_type: GachaType) -> &mut Wish {
        self.wishes
            .entry(gacha_type)
            .or_insert_with(|| Wish::scoped(gacha_type))
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.wishes.values().map(Wish::len).sum()
    }

    #[must_use]
    pub fn nonempty(&self) -> bool {
        self.wishes.values().any(|wish| !wish.is_empty())
    }

    /// Absorb a fetched collection: back-fill empty shelf metadata, then
    /// bucket the records (by collection scope when present, else by each
    /// record's own category).
    pub fn absorb(&mut self, wish: Wish) {
        if self.uid.is_empty() {
            self.uid.clone_from(&wish.uid);
        }
        if self.region.is_empty() {
            self.region.clone_from(&wish.region);
        }
        if self.language.is_empty() {
            self.language.clone_from(&wish.language);
        }
        match wish.gacha_type {
            Some(gacha_type) => self.bucket(gacha_type).extend(wish.records),
            None => {
                for record in wish.records {
                    self.bucket(record.gacha_type).records.push(record);
                }
            }
        }
    }

    /// Per-category variant of [`PlayerPool::merge`]; same attribute order,
    /// same non-transactional note.
    ///
    /// # Errors
    /// Returns [`WishError::MergeConflict`] from the first rejecting
    /// attribute; no branch records are appended in that case.
    pub fn merge(&mut self, branch: PlayerShelf) -> Result<(), WishError> {
        reconcile_field("uid", &mut self.uid, &branch.uid, self.policy.uid)?;
        reconcile_field("region", &mut self.region, &branch.region, self.policy.region)?;
        reconcile_field("language", &mut self.language, &branch.language, self.policy.language)?;
        for (gacha_type, wish) in branch.wishes {
            self.bucket(gacha_type).extend(wish.records);
        }
        Ok(())
    }

    /// Export as the multi-pool archive shape
    /// `{"info": .., "records": {code: [..]}}` in category-code order.
    #[must_use]
    pub fn dump(&self, meta: &ExportMeta) -> Value {
        let mut buckets = Map::new();
        for (gacha_type, wish) in &self.wishes {
            buckets.insert(
                gacha_type.code().to_string(),
                Value::Array(wish.records.iter().map(record_to_row).collect()),
            );
        }
        json!({
            "info": info_block(&self.uid, &self.region, &self.language, meta),
            "records": Value::Object(buckets),
        })
    }

    /// Replace this aggregate's contents from a multi-pool archive.
    ///
    /// # Errors
    /// Returns [`WishError::UnsupportedSchema`] when the top level is not an
    /// object, lacks `info`/`records`, a category key is unknown, or a
    /// bucket is not an array; row-level failures propagate as
    /// [`WishError::SchemaMismatch`] or [`WishError::InvalidTimestamp`].
    pub fn load(&mut self, archive: &Value) -> Result<ArchiveExtra, WishError> {
        let root = require_archive_object(archive, &["info", "records"])?;
        let info = root.get("info").and_then(Value::as_object);
        let buckets = root.get("records").and_then(Value::as_object).ok_or_else(|| {
            WishError::UnsupportedSchema("archive `records` must be an object".to_string())
        })?;

        let mut wishes = BTreeMap::new();
        for (code, rows) in buckets {
            let gacha_type = GachaType::parse(code).ok_or_else(|| {
                WishError::UnsupportedSchema(format!("unknown category code `{code}` in archive records"))
            })?;
            let rows = rows.as_array().ok_or_else(|| {
                WishError::UnsupportedSchema(format!("category `{code}` rows must be an array"))
            })?;
            let mut wish = Wish::scoped(gacha_type);
            for row in rows {
                wish.records.push(record_from_row(row)?);
            }
            wishes.insert(gacha_type, wish);
        }
        self.uid = info_text(info, "uid");
        self.language = info_text(info, "lang");
        self.region = info_text(info, "region");
        self.wishes = wishes;
        Ok(extra_from_info(info))
    }

    /// Flatten every bucket into one pooled collection, category-code order.
    #[must_use]
    pub fn into_pool(self) -> PlayerPool {
        let mut pool = PlayerPool {
            uid: self.uid,
            region: self.region,
            language: self.language,
            policy: self.policy,
            wish: Wish::default(),
        };
        for wish in self.wishes.into_values() {
            pool.wish.records.extend(wish.records);
        }
        pool
    }
}
