use crate::conflict::{self, Candidate, ConflictRule};
use crate::db;
use crate::domain::{Location, SessionStatus, SessionType, Subject, DUO_CAPACITY};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, format_instant, invalidate, load_sessions_for_conflict, now_iso, parse_instant,
    parse_opt_i64, parse_opt_string, parse_string_array, required_str, student_exists,
    teacher_exists,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, types::Value, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

fn conflict_response(req: &Request, rule: &str, check: conflict::ConflictCheck) -> serde_json::Value {
    err(
        &req.id,
        "conflict",
        format!("session overlaps an existing booking ({} rule)", rule),
        Some(json!({
            "rule": rule,
            "conflictingSessionId": check.conflicting_session_id
        })),
    )
}

fn handle_sessions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match teacher_exists(conn, &teacher_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let student_ids = match parse_string_array(req.params.get("studentIds")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("studentIds {}", m), None),
    };
    if student_ids.is_empty() {
        return err(&req.id, "bad_params", "studentIds must not be empty", None);
    }
    for sid in &student_ids {
        match student_exists(conn, sid) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    "student not found",
                    Some(json!({ "studentId": sid })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
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
    if session_type == SessionType::Duo && student_ids.len() > DUO_CAPACITY {
        return err(
            &req.id,
            "conflict",
            format!("Duo sessions are capped at {} students", DUO_CAPACITY),
            Some(json!({ "rule": "duo" })),
        );
    }
    if session_type != SessionType::Duo && student_ids.len() > 1 {
        return err(&req.id, "bad_params", "only Duo sessions take multiple students", None);
    }
    let location = match required_str(req, "location") {
        Ok(v) => match Location::parse(&v) {
            Some(s) => s,
            None => return err(&req.id, "bad_params", format!("unknown location: {}", v), None),
        },
        Err(e) => return e,
    };
    let starts_at = match required_str(req, "dateTime") {
        Ok(v) => match parse_instant(&v) {
            Some(t) => t,
            None => return err(&req.id, "bad_params", "dateTime is not a valid instant", None),
        },
        Err(e) => return e,
    };
    let duration_minutes = match req.params.get("durationMinutes").and_then(|v| v.as_i64()) {
        Some(v) if v > 0 => v,
        Some(_) => return err(&req.id, "bad_params", "durationMinutes must be > 0", None),
        None => return err(&req.id, "bad_params", "missing durationMinutes", None),
    };
    let notes = match parse_opt_string(req.params.get("notes")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("notes {}", m), None),
    };
    let pack_id = match parse_opt_string(req.params.get("packId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("packId {}", m), None),
    };

    if let Some(pid) = &pack_id {
        let row: Option<(String, String, String)> = match conn
            .query_row(
                "SELECT student_id, subject, session_type FROM session_packs WHERE id = ?",
                [pid],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let Some((pack_student, pack_subject, pack_type)) = row else {
            return err(&req.id, "not_found", "session pack not found", None);
        };
        if !student_ids.contains(&pack_student) {
            return err(&req.id, "bad_params", "pack belongs to a different student", None);
        }
        if pack_subject != subject.as_str() || pack_type != session_type.as_str() {
            return err(&req.id, "bad_params", "pack does not match subject/sessionType", None);
        }
        // Outside the booking transaction so the retirement survives a
        // failed create.
        match db::retire_expired_pack(conn, pid, &now_iso()) {
            Ok(true) => {
                return err(
                    &req.id,
                    "no_active_pack",
                    "pack has expired",
                    Some(json!({ "packId": pid })),
                );
            }
            Ok(false) => {}
            Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
        }
    }

    let existing = match load_sessions_for_conflict(conn, None) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let candidate = Candidate {
        id: None,
        teacher_id: Some(teacher_id.clone()),
        student_ids: student_ids.clone(),
        session_type: Some(session_type),
        starts_at: Some(starts_at),
        duration_minutes: Some(duration_minutes),
    };
    let teacher_check = conflict::check(&candidate, &existing, ConflictRule::Teacher);
    if teacher_check.has_conflict {
        return conflict_response(req, "teacher", teacher_check);
    }
    let student_check = conflict::check(&candidate, &existing, ConflictRule::Student);
    if student_check.has_conflict {
        return conflict_response(req, "student", student_check);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let session_id = Uuid::new_v4().to_string();
    let ts = now_iso();
    if let Err(e) = tx.execute(
        "INSERT INTO sessions(
            id, teacher_id, pack_id, subject, session_type, location,
            date_time, duration_minutes, status, notes, reschedule_count,
            created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        params![
            session_id,
            teacher_id,
            pack_id,
            subject.as_str(),
            session_type.as_str(),
            location.as_str(),
            format_instant(starts_at),
            duration_minutes,
            SessionStatus::Scheduled.as_str(),
            notes,
            ts,
            ts
        ],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    for sid in &student_ids {
        if let Err(e) = tx.execute(
            "INSERT INTO session_students(session_id, student_id) VALUES(?, ?)",
            params![session_id, sid],
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "session_students" })),
            );
        }
    }
    if let Some(pid) = &pack_id {
        match db::consume_pack_session(&tx, pid, &ts) {
            Ok(true) => {}
            Ok(false) => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "no_active_pack",
                    "pack is exhausted or expired",
                    Some(json!({ "packId": pid })),
                );
            }
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "sessionId": session_id,
            "invalidate": invalidate(&["sessions", "sessionPacks"])
        }),
    )
}

fn handle_sessions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let teacher_id = match parse_opt_string(req.params.get("teacherId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("teacherId {}", m), None),
    };
    let student_id = match parse_opt_string(req.params.get("studentId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("studentId {}", m), None),
    };
    let status = match parse_opt_string(req.params.get("status")) {
        Ok(Some(raw)) => match SessionStatus::parse(&raw) {
            Some(s) => Some(s),
            None => return err(&req.id, "bad_params", format!("unknown status: {}", raw), None),
        },
        Ok(None) => None,
        Err(m) => return err(&req.id, "bad_params", format!("status {}", m), None),
    };
    let from = match parse_opt_string(req.params.get("from")) {
        Ok(Some(raw)) => match parse_instant(&raw) {
            Some(t) => Some(t),
            None => return err(&req.id, "bad_params", "from is not a valid instant", None),
        },
        Ok(None) => None,
        Err(m) => return err(&req.id, "bad_params", format!("from {}", m), None),
    };
    let to = match parse_opt_string(req.params.get("to")) {
        Ok(Some(raw)) => match parse_instant(&raw) {
            Some(t) => Some(t),
            None => return err(&req.id, "bad_params", "to is not a valid instant", None),
        },
        Ok(None) => None,
        Err(m) => return err(&req.id, "bad_params", format!("to {}", m), None),
    };

    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    if let Some(tid) = &teacher_id {
        clauses.push("teacher_id = ?");
        values.push(Value::Text(tid.clone()));
    }
    if let Some(sid) = &student_id {
        clauses.push("id IN (SELECT session_id FROM session_students WHERE student_id = ?)");
        values.push(Value::Text(sid.clone()));
    }
    if let Some(status) = status {
        clauses.push("status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(from) = from {
        clauses.push("date_time >= ?");
        values.push(Value::Text(format_instant(from)));
    }
    if let Some(to) = to {
        clauses.push("date_time < ?");
        values.push(Value::Text(format_instant(to)));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT id, teacher_id, pack_id, subject, session_type, location,
                date_time, duration_minutes, status, notes, reschedule_count,
                original_session_id, rescheduled_from
         FROM sessions {} ORDER BY date_time",
        where_sql
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(values), |row| {
            Ok((
                row.get::<_, String>(0)?,
                json!({
                    "id": row.get::<_, String>(0)?,
                    "teacherId": row.get::<_, String>(1)?,
                    "packId": row.get::<_, Option<String>>(2)?,
                    "subject": row.get::<_, String>(3)?,
                    "sessionType": row.get::<_, String>(4)?,
                    "location": row.get::<_, String>(5)?,
                    "dateTime": row.get::<_, String>(6)?,
                    "durationMinutes": row.get::<_, i64>(7)?,
                    "status": row.get::<_, String>(8)?,
                    "notes": row.get::<_, Option<String>>(9)?,
                    "rescheduleCount": row.get::<_, i64>(10)?,
                    "originalSessionId": row.get::<_, Option<String>>(11)?,
                    "rescheduledFrom": row.get::<_, Option<String>>(12)?
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut links: HashMap<String, Vec<String>> = HashMap::new();
    let mut link_stmt = match conn.prepare("SELECT session_id, student_id FROM session_students") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let link_rows = link_stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match link_rows {
        Ok(pairs) => {
            for (session_id, sid) in pairs {
                links.entry(session_id).or_default().push(sid);
            }
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let sessions: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(id, mut v)| {
            v["studentIds"] = json!(links.remove(&id).unwrap_or_default());
            v
        })
        .collect();
    ok(&req.id, json!({ "sessions": sessions }))
}

fn handle_sessions_update_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let session_id = match required_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status = match required_str(req, "status") {
        Ok(v) => match SessionStatus::parse(&v) {
            Some(s) => s,
            None => return err(&req.id, "invalid_status", format!("unknown status: {}", v), None),
        },
        Err(e) => return e,
    };
    let notes = match parse_opt_string(req.params.get("notes")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("notes {}", m), None),
    };

    let exists = match conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?", [&session_id], |_r| Ok(()))
        .optional()
    {
        Ok(v) => v.is_some(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !exists {
        return err(&req.id, "not_found", "session not found", None);
    }

    // Status transitions are intentionally unvalidated; attendance marking
    // and cancellations both come through here.
    let res = match notes {
        Some(n) => conn.execute(
            "UPDATE sessions SET status = ?, notes = ?, updated_at = ? WHERE id = ?",
            params![status.as_str(), n, now_iso(), session_id],
        ),
        None => conn.execute(
            "UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?",
            params![status.as_str(), now_iso(), session_id],
        ),
    };
    if let Err(e) = res {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "ok": true, "invalidate": invalidate(&["sessions"]) }),
    )
}

struct StoredSession {
    teacher_id: String,
    pack_id: Option<String>,
    subject: String,
    session_type: String,
    location: String,
    date_time: String,
    duration_minutes: i64,
    notes: Option<String>,
    reschedule_count: i64,
    original_session_id: Option<String>,
}

fn load_session(conn: &Connection, session_id: &str) -> Result<Option<StoredSession>, rusqlite::Error> {
    conn.query_row(
        "SELECT teacher_id, pack_id, subject, session_type, location, date_time,
                duration_minutes, notes, reschedule_count, original_session_id
         FROM sessions WHERE id = ?",
        [session_id],
        |r| {
            Ok(StoredSession {
                teacher_id: r.get(0)?,
                pack_id: r.get(1)?,
                subject: r.get(2)?,
                session_type: r.get(3)?,
                location: r.get(4)?,
                date_time: r.get(5)?,
                duration_minutes: r.get(6)?,
                notes: r.get(7)?,
                reschedule_count: r.get(8)?,
                original_session_id: r.get(9)?,
            })
        },
    )
    .optional()
}

fn handle_sessions_reschedule(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let session_id = match required_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let new_start = match required_str(req, "newDateTime") {
        Ok(v) => match parse_instant(&v) {
            Some(t) => t,
            None => return err(&req.id, "bad_params", "newDateTime is not a valid instant", None),
        },
        Err(e) => return e,
    };
    let new_duration = match parse_opt_i64(req.params.get("newDurationMinutes")) {
        Ok(Some(v)) if v > 0 => Some(v),
        Ok(Some(_)) => return err(&req.id, "bad_params", "newDurationMinutes must be > 0", None),
        Ok(None) => None,
        Err(m) => return err(&req.id, "bad_params", format!("newDurationMinutes {}", m), None),
    };
    let mark_old_as = match parse_opt_string(req.params.get("markOldAs")) {
        Ok(Some(raw)) => match SessionStatus::parse(&raw) {
            Some(s) if s.is_cancelled() => s,
            Some(_) => {
                return err(&req.id, "bad_params", "markOldAs must be a cancelled status", None)
            }
            None => return err(&req.id, "invalid_status", format!("unknown status: {}", raw), None),
        },
        Ok(None) => SessionStatus::CancelledByStudent,
        Err(m) => return err(&req.id, "bad_params", format!("markOldAs {}", m), None),
    };

    let old = match load_session(conn, &session_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "session not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let student_ids: Vec<String> = {
        let mut stmt = match conn
            .prepare("SELECT student_id FROM session_students WHERE session_id = ?")
        {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match stmt
            .query_map([&session_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let duration = new_duration.unwrap_or(old.duration_minutes);
    let existing = match load_sessions_for_conflict(conn, None) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    // The predecessor is cancelled in the same transaction, so it is
    // self-excluded from the overlap screen via the candidate id.
    let candidate = Candidate {
        id: Some(session_id.clone()),
        teacher_id: Some(old.teacher_id.clone()),
        student_ids: student_ids.clone(),
        session_type: SessionType::parse(&old.session_type),
        starts_at: Some(new_start),
        duration_minutes: Some(duration),
    };
    let teacher_check = conflict::check(&candidate, &existing, ConflictRule::Teacher);
    if teacher_check.has_conflict {
        return conflict_response(req, "teacher", teacher_check);
    }
    let student_check = conflict::check(&candidate, &existing, ConflictRule::Student);
    if student_check.has_conflict {
        return conflict_response(req, "student", student_check);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let new_id = Uuid::new_v4().to_string();
    let ts = now_iso();
    let original_id = old.original_session_id.clone().unwrap_or_else(|| session_id.clone());
    if let Err(e) = tx.execute(
        "INSERT INTO sessions(
            id, teacher_id, pack_id, subject, session_type, location,
            date_time, duration_minutes, status, notes, reschedule_count,
            original_session_id, rescheduled_from, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            new_id,
            old.teacher_id,
            old.pack_id,
            old.subject,
            old.session_type,
            old.location,
            format_instant(new_start),
            duration,
            SessionStatus::Scheduled.as_str(),
            old.notes,
            old.reschedule_count + 1,
            original_id,
            session_id,
            ts,
            ts
        ],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    for sid in &student_ids {
        if let Err(e) = tx.execute(
            "INSERT INTO session_students(session_id, student_id) VALUES(?, ?)",
            params![new_id, sid],
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "session_students" })),
            );
        }
    }
    // No pack re-consumption: the slot was already paid for by the original
    // booking.
    if let Err(e) = tx.execute(
        "UPDATE sessions SET status = ?, updated_at = ? WHERE id = ?",
        params![mark_old_as.as_str(), ts, session_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "sessionId": new_id,
            "rescheduleCount": old.reschedule_count + 1,
            "originalSessionId": original_id,
            "invalidate": invalidate(&["sessions"])
        }),
    )
}

fn handle_sessions_add_students(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let session_id = match required_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let added = match parse_string_array(req.params.get("studentIds")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("studentIds {}", m), None),
    };
    if added.is_empty() {
        return err(&req.id, "bad_params", "studentIds must not be empty", None);
    }
    for sid in &added {
        match student_exists(conn, sid) {
            Ok(true) => {}
            Ok(false) => {
                return err(
                    &req.id,
                    "not_found",
                    "student not found",
                    Some(json!({ "studentId": sid })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let stored = match load_session(conn, &session_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "session not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let existing = match load_sessions_for_conflict(conn, None) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let already: Vec<String> = existing
        .iter()
        .find(|s| s.id == session_id)
        .map(|s| s.student_ids.clone())
        .unwrap_or_default();
    let new_students: Vec<String> = added
        .into_iter()
        .filter(|sid| !already.contains(sid))
        .collect();
    if new_students.is_empty() {
        return ok(
            &req.id,
            json!({ "added": 0, "invalidate": invalidate(&["sessions"]) }),
        );
    }
    if SessionType::parse(&stored.session_type) != Some(SessionType::Duo)
        && already.len() + new_students.len() > 1
    {
        return err(&req.id, "bad_params", "only Duo sessions take multiple students", None);
    }

    let candidate = Candidate {
        id: Some(session_id.clone()),
        teacher_id: Some(stored.teacher_id.clone()),
        student_ids: new_students.clone(),
        session_type: SessionType::parse(&stored.session_type),
        starts_at: parse_instant(&stored.date_time),
        duration_minutes: Some(stored.duration_minutes),
    };
    let duo_check = conflict::check(&candidate, &existing, ConflictRule::DuoCapacity);
    if duo_check.has_conflict {
        return conflict_response(req, "duo", duo_check);
    }
    let student_check = conflict::check(&candidate, &existing, ConflictRule::Student);
    if student_check.has_conflict {
        return conflict_response(req, "student", student_check);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for sid in &new_students {
        if let Err(e) = tx.execute(
            "INSERT INTO session_students(session_id, student_id) VALUES(?, ?)",
            params![session_id, sid],
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "session_students" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "added": new_students.len(), "invalidate": invalidate(&["sessions"]) }),
    )
}

fn handle_sessions_check_conflict(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let rule_raw = match required_str(req, "conflictType") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(rule) = ConflictRule::parse(&rule_raw) else {
        return err(
            &req.id,
            "bad_params",
            "conflictType must be one of: teacher, student, duo",
            None,
        );
    };

    let p = &req.params;
    let candidate = Candidate {
        id: match parse_opt_string(p.get("sessionId")) {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("sessionId {}", m), None),
        },
        teacher_id: match parse_opt_string(p.get("teacherId")) {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("teacherId {}", m), None),
        },
        student_ids: match parse_string_array(p.get("studentIds")) {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("studentIds {}", m), None),
        },
        session_type: match parse_opt_string(p.get("sessionType")) {
            Ok(Some(raw)) => match SessionType::parse(&raw) {
                Some(s) => Some(s),
                None => {
                    return err(&req.id, "bad_params", format!("unknown sessionType: {}", raw), None)
                }
            },
            Ok(None) => None,
            Err(m) => return err(&req.id, "bad_params", format!("sessionType {}", m), None),
        },
        starts_at: match parse_opt_string(p.get("dateTime")) {
            Ok(Some(raw)) => match parse_instant(&raw) {
                Some(t) => Some(t),
                None => return err(&req.id, "bad_params", "dateTime is not a valid instant", None),
            },
            Ok(None) => None,
            Err(m) => return err(&req.id, "bad_params", format!("dateTime {}", m), None),
        },
        duration_minutes: match parse_opt_i64(p.get("durationMinutes")) {
            Ok(v) => v,
            Err(m) => return err(&req.id, "bad_params", format!("durationMinutes {}", m), None),
        },
    };

    let existing = match load_sessions_for_conflict(conn, None) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let check = conflict::check(&candidate, &existing, rule);
    ok(
        &req.id,
        json!({
            "hasConflict": check.has_conflict,
            "conflictingSessionId": check.conflicting_session_id
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.create" => Some(handle_sessions_create(state, req)),
        "sessions.list" => Some(handle_sessions_list(state, req)),
        "sessions.updateStatus" => Some(handle_sessions_update_status(state, req)),
        "sessions.reschedule" => Some(handle_sessions_reschedule(state, req)),
        "sessions.addStudents" => Some(handle_sessions_add_students(state, req)),
        "sessions.checkConflict" => Some(handle_sessions_check_conflict(state, req)),
        _ => None,
    }
}
