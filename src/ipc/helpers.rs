use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;

use crate::conflict::ExistingSession;
use crate::domain::{SessionStatus, SessionType};
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, JsonValue> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, JsonValue> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn parse_opt_string(v: Option<&JsonValue>) -> Result<Option<String>, &'static str> {
    match v {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v.as_str().ok_or("must be string or null")?.trim().to_string();
            if s.is_empty() {
                Ok(None)
            } else {
                Ok(Some(s))
            }
        }
    }
}

pub fn parse_opt_i64(v: Option<&JsonValue>) -> Result<Option<i64>, &'static str> {
    match v {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or("must be integer or null"),
    }
}

pub fn parse_bool(v: Option<&JsonValue>, default: bool) -> Result<bool, &'static str> {
    match v {
        None => Ok(default),
        Some(v) if v.is_null() => Ok(default),
        Some(v) => v.as_bool().ok_or("must be boolean"),
    }
}

pub fn parse_string_array(v: Option<&JsonValue>) -> Result<Vec<String>, &'static str> {
    match v {
        None => Ok(Vec::new()),
        Some(v) if v.is_null() => Ok(Vec::new()),
        Some(v) => {
            let arr = v.as_array().ok_or("must be array of strings")?;
            let mut out = Vec::with_capacity(arr.len());
            for item in arr {
                let s = item
                    .as_str()
                    .ok_or("must be array of strings")?
                    .trim()
                    .to_string();
                if !s.is_empty() && !out.contains(&s) {
                    out.push(s);
                }
            }
            Ok(out)
        }
    }
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn format_instant(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Accepts RFC 3339, "YYYY-MM-DD HH:MM[:SS]" / "YYYY-MM-DDTHH:MM[:SS]"
/// (read as UTC), or a bare "YYYY-MM-DD" (midnight UTC).
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let t = raw.trim();
    if let Ok(v) = DateTime::parse_from_rfc3339(t) {
        return Some(v.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(t, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// Mutation results carry the record scopes the caller should refresh,
/// replacing the web app's ambient query-cache invalidation.
pub fn invalidate(scopes: &[&str]) -> JsonValue {
    json!(scopes)
}

pub fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

pub fn teacher_exists(conn: &Connection, teacher_id: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row("SELECT 1 FROM teachers WHERE id = ?", [teacher_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

/// Materializes stored sessions (with participants) for conflict screening.
/// Rows with unknown status or unparseable timestamps are skipped rather
/// than failing the whole check.
pub fn load_sessions_for_conflict(
    conn: &Connection,
    teacher_id: Option<&str>,
) -> Result<Vec<ExistingSession>, rusqlite::Error> {
    let base = "SELECT id, teacher_id, session_type, date_time, duration_minutes, status
                FROM sessions";
    let mut raw: Vec<(String, String, String, String, i64, String)> = Vec::new();
    if let Some(tid) = teacher_id {
        let mut stmt = conn.prepare(&format!("{} WHERE teacher_id = ?", base))?;
        let rows = stmt.query_map([tid], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
        })?;
        for row in rows {
            raw.push(row?);
        }
    } else {
        let mut stmt = conn.prepare(base)?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
        })?;
        for row in rows {
            raw.push(row?);
        }
    }

    let mut students_by_session: HashMap<String, Vec<String>> = HashMap::new();
    let mut stmt = conn.prepare("SELECT session_id, student_id FROM session_students")?;
    let links = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
    for link in links {
        let (session_id, student_id) = link?;
        students_by_session.entry(session_id).or_default().push(student_id);
    }

    let mut out = Vec::with_capacity(raw.len());
    for (id, tid, session_type, date_time, duration_minutes, status) in raw {
        let Some(session_type) = SessionType::parse(&session_type) else {
            continue;
        };
        let Some(status) = SessionStatus::parse(&status) else {
            continue;
        };
        let Some(starts_at) = parse_instant(&date_time) else {
            continue;
        };
        let student_ids = students_by_session.remove(&id).unwrap_or_default();
        out.push(ExistingSession {
            id,
            teacher_id: tid,
            student_ids,
            session_type,
            starts_at,
            duration_minutes,
            status,
        });
    }
    Ok(out)
}
