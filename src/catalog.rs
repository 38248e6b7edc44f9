//! Read-only exercises catalog: row mapping and the diacritic-insensitive
//! search used by the listing endpoint. Paging is passed through to the
//! store untouched (page size 48, opaque continuation offset).

use serde::Serialize;
use serde_json::Value;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::store::Record;

pub const PAGE_SIZE: u32 = 48;

const NAME_FIELD: &str = "Ejercicio";
const CATEGORY_FIELD: &str = "Categoría";
const NOTES_FIELD: &str = "Indicaciones";
const VIDEO_FIELD: &str = "Vídeo";
const MUSCLE_FIELD: &str = "Músculo objetivo";

#[derive(Debug, Clone, Serialize)]
pub struct Exercise {
    pub id: String,
    #[serde(rename = "ejercicio")]
    pub name: String,
    #[serde(rename = "categoria")]
    pub category: String,
    #[serde(rename = "indicaciones")]
    pub notes: String,
    pub video: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExerciseDetail {
    pub id: String,
    #[serde(rename = "ejercicio")]
    pub name: String,
    #[serde(rename = "categoria")]
    pub category: String,
    #[serde(rename = "musculo")]
    pub muscle: String,
    #[serde(rename = "indicaciones")]
    pub notes: String,
    pub video: String,
}

/// Case- and diacritic-insensitive normalization: NFD, strip combining
/// marks, lowercase.
pub fn normalize(s: &str) -> String {
    s.nfd().filter(|c| !is_combining_mark(*c)).collect::<String>().to_lowercase()
}

fn text(rec: &Record, name: &str) -> String {
    rec.fields.get(name).and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Video cells are either a plain URL or an attachment list; take the first
/// attachment's URL.
fn video_url(rec: &Record) -> String {
    match rec.fields.get(VIDEO_FIELD) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .first()
            .and_then(|v| v.get("url"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

pub fn exercise_from_record(rec: &Record) -> Exercise {
    Exercise {
        id: rec.id.clone(),
        name: text(rec, NAME_FIELD),
        category: text(rec, CATEGORY_FIELD),
        notes: text(rec, NOTES_FIELD),
        video: video_url(rec),
    }
}

pub fn detail_from_record(rec: &Record) -> ExerciseDetail {
    ExerciseDetail {
        id: rec.id.clone(),
        name: text(rec, NAME_FIELD),
        category: text(rec, CATEGORY_FIELD),
        muscle: text(rec, MUSCLE_FIELD),
        notes: text(rec, NOTES_FIELD),
        video: video_url(rec),
    }
}

/// `query` is expected pre-normalized; matches name, category or notes.
pub fn matches_query(ex: &Exercise, query: &str) -> bool {
    if query.is_empty() {
        return true;
    }
    normalize(&ex.name).contains(query)
        || normalize(&ex.category).contains(query)
        || normalize(&ex.notes).contains(query)
}
