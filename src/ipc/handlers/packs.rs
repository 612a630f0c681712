use crate::domain::{Location, SessionType, Subject, PACK_SIZES};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, format_instant, invalidate, now_iso, parse_bool, parse_instant, parse_opt_i64,
    parse_opt_string, required_str, student_exists,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, types::Value, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_packs_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match student_exists(conn, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let size = match req.params.get("size").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing size", None),
    };
    if !PACK_SIZES.contains(&size) {
        return err(
            &req.id,
            "bad_params",
            format!("size must be one of {:?}", PACK_SIZES),
            None,
        );
    }

    let subject = match required_str(req, "subject") {
        Ok(v) => match Subject::parse(&v) {
            Some(s) => s,
            None => return err(&req.id, "bad_params", format!("unknown subject: {}", v), None),
        },
        Err(e) => return e,
    };
    let session_type = match required_str(req, "sessionType") {
        Ok(v) => match SessionType::parse(&v) {
            Some(s) => s,
            None => return err(&req.id, "bad_params", format!("unknown sessionType: {}", v), None),
        },
        Err(e) => return e,
    };
    let location = match required_str(req, "location") {
        Ok(v) => match Location::parse(&v) {
            Some(s) => s,
            None => return err(&req.id, "bad_params", format!("unknown location: {}", v), None),
        },
        Err(e) => return e,
    };
    let weekly_frequency = match parse_opt_i64(req.params.get("weeklyFrequency")) {
        Ok(Some(v)) if v > 0 => Some(v),
        Ok(Some(_)) => return err(&req.id, "bad_params", "weeklyFrequency must be > 0", None),
        Ok(None) => None,
        Err(m) => return err(&req.id, "bad_params", format!("weeklyFrequency {}", m), None),
    };
    let purchased_date = match parse_opt_string(req.params.get("purchasedDate")) {
        Ok(Some(raw)) => match parse_instant(&raw) {
            Some(t) => Some(format_instant(t)),
            None => return err(&req.id, "bad_params", "purchasedDate is not a valid date", None),
        },
        Ok(None) => Some(now_iso()),
        Err(m) => return err(&req.id, "bad_params", format!("purchasedDate {}", m), None),
    };
    let expiry_date = match parse_opt_string(req.params.get("expiryDate")) {
        Ok(Some(raw)) => match parse_instant(&raw) {
            Some(t) => Some(format_instant(t)),
            None => return err(&req.id, "bad_params", "expiryDate is not a valid date", None),
        },
        Ok(None) => None,
        Err(m) => return err(&req.id, "bad_params", format!("expiryDate {}", m), None),
    };

    let pack_id = Uuid::new_v4().to_string();
    let ts = now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO session_packs(
            id, student_id, size, subject, session_type, location,
            purchased_date, expiry_date, remaining_sessions, weekly_frequency, is_active,
            created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        params![
            pack_id,
            student_id,
            size,
            subject.as_str(),
            session_type.as_str(),
            location.as_str(),
            purchased_date,
            expiry_date,
            size,
            weekly_frequency,
            ts,
            ts
        ],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "session_packs" })),
        );
    }

    ok(
        &req.id,
        json!({ "packId": pack_id, "remainingSessions": size, "invalidate": invalidate(&["sessionPacks"]) }),
    )
}

fn handle_packs_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match parse_opt_string(req.params.get("studentId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("studentId {}", m), None),
    };
    let active_only = match parse_bool(req.params.get("activeOnly"), false) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("activeOnly {}", m), None),
    };

    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    if let Some(sid) = &student_id {
        clauses.push("student_id = ?");
        values.push(Value::Text(sid.clone()));
    }
    if active_only {
        clauses.push("is_active = 1");
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    // Expiring packs list first; open-ended packs sort last.
    let sql = format!(
        "SELECT id, student_id, size, subject, session_type, location,
                purchased_date, expiry_date, remaining_sessions, weekly_frequency, is_active
         FROM session_packs {}
         ORDER BY expiry_date IS NULL, expiry_date, purchased_date",
        where_sql
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(values), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "studentId": row.get::<_, String>(1)?,
                "size": row.get::<_, i64>(2)?,
                "subject": row.get::<_, String>(3)?,
                "sessionType": row.get::<_, String>(4)?,
                "location": row.get::<_, String>(5)?,
                "purchasedDate": row.get::<_, Option<String>>(6)?,
                "expiryDate": row.get::<_, Option<String>>(7)?,
                "remainingSessions": row.get::<_, i64>(8)?,
                "weeklyFrequency": row.get::<_, Option<i64>>(9)?,
                "isActive": row.get::<_, i64>(10)? != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(packs) => ok(&req.id, json!({ "packs": packs })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_packs_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let pack_id = match required_str(req, "packId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch", None);
    };

    let exists = match conn
        .query_row("SELECT 1 FROM session_packs WHERE id = ?", [&pack_id], |_r| Ok(()))
        .optional()
    {
        Ok(v) => v.is_some(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !exists {
        return err(&req.id, "not_found", "session pack not found", None);
    }

    let mut fields: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "expiryDate" => {
                fields.push("expiry_date = ?".to_string());
                if v.is_null() {
                    values.push(Value::Null);
                } else if let Some(t) = v.as_str().and_then(parse_instant) {
                    values.push(Value::Text(format_instant(t)));
                } else {
                    return err(&req.id, "bad_params", "patch.expiryDate is not a valid date", None);
                }
            }
            "weeklyFrequency" => {
                fields.push("weekly_frequency = ?".to_string());
                if v.is_null() {
                    values.push(Value::Null);
                } else if let Some(n) = v.as_i64().filter(|n| *n > 0) {
                    values.push(Value::Integer(n));
                } else {
                    return err(&req.id, "bad_params", "patch.weeklyFrequency must be > 0", None);
                }
            }
            "isActive" => {
                let Some(active) = v.as_bool() else {
                    return err(&req.id, "bad_params", "patch.isActive must be boolean", None);
                };
                fields.push("is_active = ?".to_string());
                values.push(Value::Integer(if active { 1 } else { 0 }));
            }
            other => {
                return err(&req.id, "bad_params", format!("unknown patch field: {}", other), None)
            }
        }
    }
    if fields.is_empty() {
        return err(&req.id, "bad_params", "patch must not be empty", None);
    }

    fields.push("updated_at = ?".to_string());
    values.push(Value::Text(now_iso()));
    values.push(Value::Text(pack_id));
    let sql = format!("UPDATE session_packs SET {} WHERE id = ?", fields.join(", "));
    if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(values)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "session_packs" })),
        );
    }

    ok(
        &req.id,
        json!({ "ok": true, "invalidate": invalidate(&["sessionPacks"]) }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessionPacks.create" => Some(handle_packs_create(state, req)),
        "sessionPacks.list" => Some(handle_packs_list(state, req)),
        "sessionPacks.update" => Some(handle_packs_update(state, req)),
        _ => None,
    }
}
