use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use wishkit_core::{
    format_wall_clock, parse_wall_clock, record_from_row, ExportMeta, GachaType, Item,
    PlayerShelf, Record, Wish, WishError,
};

/// Result of loading one archive through a dialect adapter. Malformed rows
/// are skipped, not fatal; the counters surface how many rows were seen and
/// how many survived.
#[derive(Debug)]
pub struct LoadOutcome {
    pub shelf: PlayerShelf,
    pub rows_read: usize,
    pub rows_loaded: usize,
}

/// One JSON archive dialect. `sniff` is a cheap shape probe used for
/// auto-detection; `load`/`dump` convert between the dialect and the
/// per-category shelf aggregate.
pub trait JsonFormat {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn sniff(&self, archive: &Value) -> bool;

    /// # Errors
    /// Fails when the archive's top-level structure does not match the
    /// dialect. Row-level problems are skipped and reported through the
    /// [`LoadOutcome`] counters instead.
    fn load(&self, archive: &Value) -> Result<LoadOutcome>;

    /// # Errors
    /// Fails when the shelf cannot be represented in the dialect.
    fn dump(&self, shelf: &PlayerShelf, meta: &ExportMeta) -> Result<Value>;
}

/// Every registered dialect, in auto-detection order.
#[must_use]
pub fn formats() -> [&'static dyn JsonFormat; 2] {
    [&UigfFormat, &BiuuuFormat]
}

#[must_use]
pub fn find_format(name: &str) -> Option<&'static dyn JsonFormat> {
    formats().into_iter().find(|format| format.name() == name)
}

/// First registered dialect whose `sniff` accepts the archive.
#[must_use]
pub fn detect(archive: &Value) -> Option<&'static dyn JsonFormat> {
    formats().into_iter().find(|format| format.sniff(archive))
}

fn text_entry(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// UIGF.J interchange archives, versions v2.0 through v2.2.
pub struct UigfFormat;

impl JsonFormat for UigfFormat {
    fn name(&self) -> &'static str {
        "uigf"
    }

    fn description(&self) -> &'static str {
        "UIGF.J interchange archive (v2.0 - v2.2)"
    }

    fn sniff(&self, archive: &Value) -> bool {
        archive
            .as_object()
            .is_some_and(|root| root.contains_key("info") && root.contains_key("list"))
    }

    fn load(&self, archive: &Value) -> Result<LoadOutcome> {
        let root = archive.as_object().ok_or_else(|| {
            WishError::UnsupportedSchema("UIGF archive root must be a JSON object".to_string())
        })?;
        let rows = root.get("list").and_then(Value::as_array).ok_or_else(|| {
            WishError::UnsupportedSchema("UIGF archive is missing the `list` array".to_string())
        })?;
        let info = root.get("info").and_then(Value::as_object);

        let uid = info.and_then(|map| text_entry(map, "uid")).unwrap_or_default();
        let language = info.and_then(|map| text_entry(map, "lang")).unwrap_or_default();
        let region = info.and_then(|map| text_entry(map, "region")).unwrap_or_default();

        let mut shelf = PlayerShelf::new(&uid, &region, &language);
        let mut rows_read = 0;
        let mut rows_loaded = 0;
        for row in rows {
            rows_read += 1;
            let Ok(mut record) = record_from_row(row) else {
                continue;
            };
            if record.uid.is_empty() {
                record.uid.clone_from(&uid);
            }
            shelf.bucket(record.gacha_type).records.push(record);
            rows_loaded += 1;
        }
        for wish in shelf.wishes.values_mut() {
            wish.sort();
        }

        Ok(LoadOutcome { shelf, rows_read, rows_loaded })
    }

    fn dump(&self, shelf: &PlayerShelf, meta: &ExportMeta) -> Result<Value> {
        let mut pool = shelf.clone().into_pool();
        pool.wish.maps(|mut record| {
            record.uigf_type = Some(record.interchange_type());
            record
        });
        Ok(pool.dump(meta))
    }
}

/// Save files written by genshin-wish-export (the "biuuu" exporter): row
/// arrays instead of field-keyed rows, pools keyed by interchange code.
pub struct BiuuuFormat;

impl JsonFormat for BiuuuFormat {
    fn name(&self) -> &'static str {
        "biuuu"
    }

    fn description(&self) -> &'static str {
        "genshin-wish-export save file"
    }

    fn sniff(&self, archive: &Value) -> bool {
        archive.as_object().is_some_and(|root| {
            root.contains_key("result") && root.contains_key("uid") && root.contains_key("time")
        })
    }

    fn load(&self, archive: &Value) -> Result<LoadOutcome> {
        let root = archive.as_object().ok_or_else(|| {
            WishError::UnsupportedSchema("biuuu archive root must be a JSON object".to_string())
        })?;
        let uid = match root.get("uid") {
            Some(Value::String(uid)) => uid.clone(),
            _ => {
                return Err(WishError::UnsupportedSchema(
                    "biuuu archive is missing the string `uid` field".to_string(),
                )
                .into())
            }
        };
        if root.get("time").and_then(Value::as_i64).is_none() {
            return Err(WishError::UnsupportedSchema(
                "biuuu archive is missing the integer `time` field".to_string(),
            )
            .into());
        }
        let pools = root.get("result").and_then(Value::as_array).ok_or_else(|| {
            WishError::UnsupportedSchema("biuuu archive is missing the `result` array".to_string())
        })?;
        let language = root.get("lang").and_then(Value::as_str).unwrap_or_default().to_string();

        let mut shelf = PlayerShelf::new(&uid, "", &language);
        let mut rows_read = 0;
        let mut rows_loaded = 0;
        for pool in pools {
            let Some(pair) = pool.as_array() else {
                continue;
            };
            let (Some(code), Some(rows)) = (
                pair.first().and_then(Value::as_str),
                pair.get(1).and_then(Value::as_array),
            ) else {
                continue;
            };
            let Some(interchange) = GachaType::parse(code) else {
                continue;
            };
            for row in rows {
                rows_read += 1;
                let Some(record) = parse_result_row(row, interchange, &language) else {
                    continue;
                };
                shelf.bucket(record.gacha_type).records.push(record);
                rows_loaded += 1;
            }
        }
        for wish in shelf.wishes.values_mut() {
            wish.sort();
        }

        Ok(LoadOutcome { shelf, rows_read, rows_loaded })
    }

    fn dump(&self, shelf: &PlayerShelf, meta: &ExportMeta) -> Result<Value> {
        let type_map = GachaType::ALL
            .iter()
            .map(|gacha_type| json!([gacha_type.code(), gacha_type.label()]))
            .collect::<Vec<_>>();
        let mut result = Vec::new();
        for (gacha_type, wish) in &shelf.wishes {
            let rows = wish.records.iter().map(result_row).collect::<Vec<_>>();
            result.push(json!([gacha_type.interchange_code(), rows]));
        }

        Ok(json!({
            "uid": shelf.uid,
            "lang": shelf.language,
            "time": wishkit_core::unix_seconds(meta.exported_at),
            "typeMap": type_map,
            "result": result,
        }))
    }
}

// Row cells: [time, name, item_type, rank] plus [gacha_type, id] when the
// source carried an identifier. Rows shorter than six cells are the basic
// shape: any fifth cell is ignored and the pool's category applies.
fn parse_result_row(row: &Value, interchange: GachaType, language: &str) -> Option<Record> {
    let cells = row.as_array()?;
    let time_text = cells.first()?.as_str()?;
    let time = parse_wall_clock(time_text).ok()?;
    let name = cells.get(1)?.as_str()?.to_string();
    let item_type = cells.get(2)?.as_str()?.to_string();
    let rank = cell_text(cells.get(3)?)?.parse::<u8>().ok()?;
    let (gacha_type, id) = if cells.len() >= 6 {
        (GachaType::parse(&cell_text(cells.get(4)?)?)?, cell_text(cells.get(5)?)?)
    } else {
        (interchange, String::new())
    };

    Some(Record {
        id,
        time: Some(time),
        gacha_type,
        uigf_type: Some(interchange),
        item: Item {
            name,
            item_type,
            rank,
            lang: language.to_string(),
            item_id: String::new(),
        },
        count: 1,
        uid: String::new(),
    })
}

fn result_row(record: &Record) -> Value {
    let time = record.time.map(format_wall_clock).unwrap_or_default();
    if record.id.is_empty() {
        json!([time, record.item.name, record.item.item_type, record.item.rank])
    } else {
        json!([
            time,
            record.item.name,
            record.item.item_type,
            record.item.rank,
            record.gacha_type.code(),
            record.id,
        ])
    }
}

/// Upgrade a legacy `{"infos": .., "records": {code: [..]}}` archive into a
/// single flattened collection. Each row is re-tagged with its pool's
/// category, an empty external item id, a count of one and the pool key as
/// declared interchange category, then the whole collection is sorted by
/// (interchange code, time, id).
///
/// # Errors
/// Returns [`WishError::SchemaMismatch`] when the top level, `infos`,
/// `records` or any row does not have the legacy shape. Unlike the dialect
/// adapters, migration has no row-level recovery.
pub fn migrate_legacy(archive: &Value) -> Result<Wish> {
    let root = archive.as_object().ok_or_else(|| {
        WishError::SchemaMismatch("legacy archive root must be a JSON object".to_string())
    })?;
    let infos = root.get("infos").and_then(Value::as_object).ok_or_else(|| {
        WishError::SchemaMismatch("legacy archive is missing the `infos` object".to_string())
    })?;
    let buckets = root.get("records").and_then(Value::as_object).ok_or_else(|| {
        WishError::SchemaMismatch("legacy archive is missing the `records` object".to_string())
    })?;

    let mut wish = Wish {
        uid: text_entry(infos, "uid").unwrap_or_default(),
        region: text_entry(infos, "region").unwrap_or_default(),
        language: text_entry(infos, "lang").unwrap_or_default(),
        ..Wish::default()
    };

    for (code, rows) in buckets {
        if GachaType::parse(code).is_none() {
            return Err(WishError::SchemaMismatch(format!(
                "unknown category code `{code}` in legacy records"
            ))
            .into());
        }
        let rows = rows.as_array().ok_or_else(|| {
            WishError::SchemaMismatch(format!("legacy category `{code}` rows must be an array"))
        })?;
        for row in rows {
            let mut augmented = match row {
                Value::Object(map) => map.clone(),
                _ => {
                    return Err(WishError::SchemaMismatch(
                        "legacy record row is not an object".to_string(),
                    )
                    .into())
                }
            };
            augmented.insert("gacha_type".to_string(), Value::String(code.clone()));
            augmented.insert("item_id".to_string(), Value::String(String::new()));
            augmented.insert("count".to_string(), Value::String("1".to_string()));
            augmented.insert("uigf_gacha_type".to_string(), Value::String(code.clone()));

            let record = record_from_row(&Value::Object(augmented))
                .with_context(|| format!("invalid legacy record in category {code}"))?;
            wish.records.push(record);
        }
    }

    wish.sort_by_interchange();
    Ok(wish)
}

/// # Errors
/// Fails when the file cannot be read or does not contain valid JSON.
pub fn read_json(path: &Path) -> Result<Value> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read archive file {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("failed to parse JSON archive {}", path.display()))
}

/// Serialize to disk, compact when `minimum`. Whole-file write, no atomic
/// rename.
///
/// # Errors
/// Fails when serialization or the filesystem write fails.
pub fn write_json(path: &Path, value: &Value, minimum: bool) -> Result<()> {
    let body = if minimum {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    }
    .context("failed to serialize archive")?;
    fs::write(path, body)
        .with_context(|| format!("failed to write archive file {}", path.display()))
}
