use crate::domain::Subject;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, invalidate, now_iso, parse_bool, parse_opt_string, parse_string_array, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, types::Value, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn canonical_subjects(id: &str, raw: &[String]) -> Result<String, serde_json::Value> {
    let mut out: Vec<&'static str> = Vec::with_capacity(raw.len());
    for item in raw {
        match Subject::parse(item) {
            Some(s) => {
                if !out.contains(&s.as_str()) {
                    out.push(s.as_str());
                }
            }
            None => return Err(err(id, "bad_params", format!("unknown subject: {}", item), None)),
        }
    }
    Ok(out.join(","))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(e) => return e,
    };
    let preferred = match parse_string_array(req.params.get("preferredSubjects")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("preferredSubjects {}", m), None),
    };
    let preferred = match canonical_subjects(&req.id, &preferred) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let notes = match parse_opt_string(req.params.get("notes")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("notes {}", m), None),
    };

    let existing: Option<String> = match conn
        .query_row("SELECT id FROM students WHERE email = ?", [&email], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(id) = existing {
        return err(
            &req.id,
            "duplicate",
            "a student with this email already exists",
            Some(json!({ "studentId": id })),
        );
    }

    let student_id = Uuid::new_v4().to_string();
    let ts = now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, name, email, preferred_subjects, notes, active, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 1, ?, ?)",
        params![student_id, name, email, preferred, notes, ts, ts],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "invalidate": invalidate(&["students"]) }),
    )
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let include_inactive = match parse_bool(req.params.get("includeInactive"), false) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("includeInactive {}", m), None),
    };

    let sql = format!(
        "SELECT
           st.id, st.name, st.email, st.preferred_subjects, st.notes, st.active,
           (SELECT COUNT(*) FROM session_packs p WHERE p.student_id = st.id AND p.is_active = 1) AS active_packs,
           (SELECT COUNT(*) FROM session_students ss WHERE ss.student_id = st.id) AS session_count
         FROM students st
         {}
         ORDER BY st.name",
        if include_inactive { "" } else { "WHERE st.active = 1" }
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let email: String = row.get(2)?;
            let preferred: String = row.get(3)?;
            let notes: Option<String> = row.get(4)?;
            let active: i64 = row.get(5)?;
            let active_packs: i64 = row.get(6)?;
            let session_count: i64 = row.get(7)?;
            Ok(json!({
                "id": id,
                "name": name,
                "email": email,
                "preferredSubjects": preferred.split(',').filter(|s| !s.is_empty()).collect::<Vec<_>>(),
                "notes": notes,
                "active": active != 0,
                "activePackCount": active_packs,
                "sessionCount": session_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch", None);
    };

    let exists = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |_r| Ok(()))
        .optional()
    {
        Ok(v) => v.is_some(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !exists {
        return err(&req.id, "not_found", "student not found", None);
    }

    let mut fields: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "name" => {
                let Some(name) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return err(&req.id, "bad_params", "patch.name must not be empty", None);
                };
                fields.push("name = ?".to_string());
                values.push(Value::Text(name.to_string()));
            }
            "email" => {
                let Some(email) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return err(&req.id, "bad_params", "patch.email must not be empty", None);
                };
                let email = email.to_ascii_lowercase();
                let taken = match conn
                    .query_row(
                        "SELECT 1 FROM students WHERE email = ? AND id != ?",
                        params![email, student_id],
                        |_r| Ok(()),
                    )
                    .optional()
                {
                    Ok(v) => v.is_some(),
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                };
                if taken {
                    return err(&req.id, "duplicate", "email already in use", None);
                }
                fields.push("email = ?".to_string());
                values.push(Value::Text(email));
            }
            "preferredSubjects" => {
                let raw = match parse_string_array(Some(v)) {
                    Ok(v) => v,
                    Err(m) => {
                        return err(&req.id, "bad_params", format!("patch.preferredSubjects {}", m), None)
                    }
                };
                let joined = match canonical_subjects(&req.id, &raw) {
                    Ok(v) => v,
                    Err(e) => return e,
                };
                fields.push("preferred_subjects = ?".to_string());
                values.push(Value::Text(joined));
            }
            "notes" => {
                fields.push("notes = ?".to_string());
                match parse_opt_string(Some(v)) {
                    Ok(Some(s)) => values.push(Value::Text(s)),
                    Ok(None) => values.push(Value::Null),
                    Err(m) => return err(&req.id, "bad_params", format!("patch.notes {}", m), None),
                }
            }
            "active" => {
                let Some(active) = v.as_bool() else {
                    return err(&req.id, "bad_params", "patch.active must be boolean", None);
                };
                fields.push("active = ?".to_string());
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
    values.push(Value::Text(student_id.clone()));
    let sql = format!("UPDATE students SET {} WHERE id = ?", fields.join(", "));
    if let Err(e) = conn.execute(&sql, rusqlite::params_from_iter(values)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({ "ok": true, "invalidate": invalidate(&["students"]) }),
    )
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |_r| Ok(()))
        .optional()
    {
        Ok(v) => v.is_some(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !exists {
        return err(&req.id, "not_found", "student not found", None);
    }

    // Sessions, packs, plans and payments are history, never hard-deleted;
    // a student with any of them is deactivated instead.
    let referenced: i64 = match conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM session_students WHERE student_id = ?1)
         + (SELECT COUNT(*) FROM session_packs WHERE student_id = ?1)
         + (SELECT COUNT(*) FROM fee_plans WHERE student_id = ?1)
         + (SELECT COUNT(*) FROM payments WHERE student_id = ?1)",
        [&student_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if referenced > 0 {
        if let Err(e) = conn.execute(
            "UPDATE students SET active = 0, updated_at = ? WHERE id = ?",
            params![now_iso(), student_id],
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        return ok(
            &req.id,
            json!({ "deleted": false, "deactivated": true, "invalidate": invalidate(&["students"]) }),
        );
    }

    if let Err(e) = conn.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    ok(
        &req.id,
        json!({ "deleted": true, "deactivated": false, "invalidate": invalidate(&["students"]) }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
