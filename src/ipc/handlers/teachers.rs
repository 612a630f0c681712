use crate::domain::Subject;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, invalidate, now_iso, parse_string_array, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_teachers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let subjects = match parse_string_array(req.params.get("subjects")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("subjects {}", m), None),
    };
    let mut canonical: Vec<&'static str> = Vec::with_capacity(subjects.len());
    for raw in &subjects {
        match Subject::parse(raw) {
            Some(s) => {
                if !canonical.contains(&s.as_str()) {
                    canonical.push(s.as_str());
                }
            }
            None => return err(&req.id, "bad_params", format!("unknown subject: {}", raw), None),
        }
    }

    let existing: Option<String> = match conn
        .query_row("SELECT id FROM teachers WHERE email = ?", [&email], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(id) = existing {
        return err(
            &req.id,
            "duplicate",
            "a teacher with this email already exists",
            Some(json!({ "teacherId": id })),
        );
    }

    let teacher_id = Uuid::new_v4().to_string();
    let ts = now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, name, email, subjects, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&teacher_id, &name, &email, &canonical.join(","), &ts, &ts),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teachers" })),
        );
    }

    ok(
        &req.id,
        json!({ "teacherId": teacher_id, "invalidate": invalidate(&["teachers"]) }),
    )
}

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT
           t.id, t.name, t.email, t.subjects,
           (SELECT COUNT(*) FROM sessions s WHERE s.teacher_id = t.id) AS session_count
         FROM teachers t
         ORDER BY t.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let email: String = row.get(2)?;
            let subjects: String = row.get(3)?;
            let session_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "email": email,
                "subjects": subjects.split(',').filter(|s| !s.is_empty()).collect::<Vec<_>>(),
                "sessionCount": session_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.create" => Some(handle_teachers_create(state, req)),
        "teachers.list" => Some(handle_teachers_list(state, req)),
        _ => None,
    }
}
