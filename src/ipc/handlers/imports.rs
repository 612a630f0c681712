use crate::conflict::{self, Candidate, ConflictRule};
use crate::csvfile::{self, CsvRow};
use crate::db;
use crate::domain::{Location, SessionStatus, SessionType, Subject, PACK_SIZES};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, format_instant, invalidate, load_sessions_for_conflict, now_iso, parse_instant,
    parse_opt_string, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;
use uuid::Uuid;

/// Outcome of one data row. A skipped row (duplicate student) is neither a
/// success nor a failure; a created-with-warning row still counts as a
/// success.
enum RowOutcome {
    Created { id: String, warning: Option<String> },
    Skipped { warning: String },
    Failed { message: String },
}

#[derive(Default)]
struct ImportReport {
    successes: Vec<serde_json::Value>,
    errors: Vec<serde_json::Value>,
    warnings: Vec<serde_json::Value>,
}

impl ImportReport {
    fn record(&mut self, row_number: usize, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Created { id, warning } => {
                self.successes.push(json!({ "row": row_number, "id": id }));
                if let Some(message) = warning {
                    self.warnings.push(json!({ "row": row_number, "message": message }));
                }
            }
            RowOutcome::Skipped { warning } => {
                self.warnings.push(json!({ "row": row_number, "message": warning }));
            }
            RowOutcome::Failed { message } => {
                self.errors.push(json!({ "row": row_number, "message": message }));
            }
        }
    }

    fn summary(&self) -> serde_json::Value {
        json!({
            "successes": self.successes,
            "errors": self.errors,
            "warnings": self.warnings
        })
    }

    fn terminal_status(&self) -> &'static str {
        if !self.errors.is_empty() && self.successes.is_empty() {
            "failed"
        } else {
            "completed"
        }
    }
}

fn row_failed(message: impl Into<String>) -> RowOutcome {
    RowOutcome::Failed {
        message: message.into(),
    }
}

fn lookup_student(conn: &Connection, row: &CsvRow) -> Result<Result<String, String>, rusqlite::Error> {
    if let Some(id) = row.get("student_id") {
        let found: Option<String> = conn
            .query_row("SELECT id FROM students WHERE id = ?", [id], |r| r.get(0))
            .optional()?;
        return Ok(found.ok_or_else(|| format!("student_id not found: {}", id)));
    }
    if let Some(email) = row.get("student_email") {
        let email = email.to_ascii_lowercase();
        let found: Option<String> = conn
            .query_row("SELECT id FROM students WHERE email = ?", [&email], |r| r.get(0))
            .optional()?;
        return Ok(found.ok_or_else(|| format!("student_email not found: {}", email)));
    }
    Ok(Err("missing student_id / student_email".to_string()))
}

fn lookup_teacher(conn: &Connection, row: &CsvRow) -> Result<Result<String, String>, rusqlite::Error> {
    if let Some(id) = row.get("teacher_id") {
        let found: Option<String> = conn
            .query_row("SELECT id FROM teachers WHERE id = ?", [id], |r| r.get(0))
            .optional()?;
        return Ok(found.ok_or_else(|| format!("teacher_id not found: {}", id)));
    }
    if let Some(email) = row.get("teacher_email") {
        let email = email.to_ascii_lowercase();
        let found: Option<String> = conn
            .query_row("SELECT id FROM teachers WHERE email = ?", [&email], |r| r.get(0))
            .optional()?;
        return Ok(found.ok_or_else(|| format!("teacher_email not found: {}", email)));
    }
    Ok(Err("missing teacher_id / teacher_email".to_string()))
}

fn import_student_row(conn: &Connection, row: &CsvRow) -> Result<RowOutcome, rusqlite::Error> {
    let Some(name) = row.get("name") else {
        return Ok(row_failed("missing name"));
    };
    let Some(email) = row.get("email") else {
        return Ok(row_failed("missing email"));
    };
    let email = email.to_ascii_lowercase();

    let existing: Option<String> = conn
        .query_row("SELECT id FROM students WHERE email = ?", [&email], |r| r.get(0))
        .optional()?;
    if existing.is_some() {
        return Ok(RowOutcome::Skipped {
            warning: format!("student already exists: {}", email),
        });
    }

    let mut preferred: Vec<&'static str> = Vec::new();
    if let Some(raw) = row.get("preferred_subjects") {
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match Subject::parse(part) {
                Some(s) => {
                    if !preferred.contains(&s.as_str()) {
                        preferred.push(s.as_str());
                    }
                }
                None => return Ok(row_failed(format!("unknown subject: {}", part))),
            }
        }
    }

    let student_id = Uuid::new_v4().to_string();
    let ts = now_iso();
    conn.execute(
        "INSERT INTO students(id, name, email, preferred_subjects, notes, active, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 1, ?, ?)",
        params![student_id, name, email, preferred.join(","), row.get("notes"), ts, ts],
    )?;
    Ok(RowOutcome::Created {
        id: student_id,
        warning: None,
    })
}

fn import_pack_row(conn: &Connection, row: &CsvRow) -> Result<RowOutcome, rusqlite::Error> {
    let student_id = match lookup_student(conn, row)? {
        Ok(id) => id,
        Err(message) => return Ok(row_failed(message)),
    };
    let size = match row.get("size").and_then(|v| v.parse::<i64>().ok()) {
        Some(v) if PACK_SIZES.contains(&v) => v,
        Some(v) => return Ok(row_failed(format!("size must be one of {:?}, got {}", PACK_SIZES, v))),
        None => return Ok(row_failed("missing or non-numeric size")),
    };
    let Some(subject) = row.get("subject").and_then(Subject::parse) else {
        return Ok(row_failed("missing or unknown subject"));
    };
    let Some(session_type) = row.get("session_type").and_then(SessionType::parse) else {
        return Ok(row_failed("missing or unknown session_type"));
    };
    let Some(location) = row.get("location").and_then(Location::parse) else {
        return Ok(row_failed("missing or unknown location"));
    };
    let weekly_frequency = match row.get("weekly_frequency").and_then(|v| v.parse::<i64>().ok()) {
        Some(v) if v > 0 => v,
        _ => return Ok(row_failed("missing or invalid weekly_frequency")),
    };
    let purchased_date = match row.get("purchased_date") {
        Some(raw) => match parse_instant(raw) {
            Some(t) => format_instant(t),
            None => return Ok(row_failed(format!("invalid purchased_date: {}", raw))),
        },
        None => now_iso(),
    };
    let expiry_date = match row.get("expiry_date") {
        Some(raw) => match parse_instant(raw) {
            Some(t) => Some(format_instant(t)),
            None => return Ok(row_failed(format!("invalid expiry_date: {}", raw))),
        },
        None => None,
    };

    let pack_id = Uuid::new_v4().to_string();
    let ts = now_iso();
    conn.execute(
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
    )?;
    Ok(RowOutcome::Created {
        id: pack_id,
        warning: None,
    })
}

fn import_session_row(conn: &Connection, row: &CsvRow) -> Result<RowOutcome, rusqlite::Error> {
    let teacher_id = match lookup_teacher(conn, row)? {
        Ok(id) => id,
        Err(message) => return Ok(row_failed(message)),
    };
    let student_id = match lookup_student(conn, row)? {
        Ok(id) => id,
        Err(message) => return Ok(row_failed(message)),
    };
    let Some(starts_at) = row.get("date_time").and_then(parse_instant) else {
        return Ok(row_failed("missing or invalid date_time"));
    };
    let Some(subject) = row.get("subject").and_then(Subject::parse) else {
        return Ok(row_failed("missing or unknown subject"));
    };
    let Some(session_type) = row.get("session_type").and_then(SessionType::parse) else {
        return Ok(row_failed("missing or unknown session_type"));
    };
    let Some(location) = row.get("location").and_then(Location::parse) else {
        return Ok(row_failed("missing or unknown location"));
    };
    let duration_minutes = match row.get("duration").and_then(|v| v.parse::<i64>().ok()) {
        Some(v) if v > 0 => v,
        _ => return Ok(row_failed("missing or invalid duration")),
    };

    // Packs that expire soonest are drawn down first; open-ended packs last.
    // Already-expired packs are never candidates.
    let now = now_iso();
    let pack_id: Option<String> = conn
        .query_row(
            "SELECT id FROM session_packs
             WHERE student_id = ? AND subject = ? AND session_type = ?
               AND is_active = 1 AND remaining_sessions > 0
               AND (expiry_date IS NULL OR expiry_date > ?)
             ORDER BY expiry_date IS NULL, expiry_date, purchased_date
             LIMIT 1",
            params![student_id, subject.as_str(), session_type.as_str(), now],
            |r| r.get(0),
        )
        .optional()?;
    let Some(pack_id) = pack_id else {
        return Ok(row_failed(format!(
            "no active pack for student with {} {}",
            subject.as_str(),
            session_type.as_str()
        )));
    };

    let existing = load_sessions_for_conflict(conn, Some(&teacher_id))?;
    let candidate = Candidate {
        id: None,
        teacher_id: Some(teacher_id.clone()),
        student_ids: vec![student_id.clone()],
        session_type: Some(session_type),
        starts_at: Some(starts_at),
        duration_minutes: Some(duration_minutes),
    };
    let check = conflict::check(&candidate, &existing, ConflictRule::Teacher);
    if check.has_conflict {
        return Ok(row_failed(format!(
            "teacher already booked (session {})",
            check.conflicting_session_id.unwrap_or_default()
        )));
    }

    let tx = conn.unchecked_transaction()?;
    let session_id = Uuid::new_v4().to_string();
    let ts = now_iso();
    tx.execute(
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
            row.get("notes"),
            ts,
            ts
        ],
    )?;
    tx.execute(
        "INSERT INTO session_students(session_id, student_id) VALUES(?, ?)",
        params![session_id, student_id],
    )?;
    // A concurrent writer may have drained the pack between selection and
    // decrement; the session stands either way.
    let warning = if db::consume_pack_session(&tx, &pack_id, &ts)? {
        None
    } else {
        Some(format!("pack {} had no remaining capacity to decrement", pack_id))
    };
    tx.commit()?;

    Ok(RowOutcome::Created {
        id: session_id,
        warning,
    })
}

fn handle_imports_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let upload_type = match required_str(req, "uploadType") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !matches!(upload_type.as_str(), "students" | "session_packs" | "sessions") {
        return err(
            &req.id,
            "bad_params",
            "uploadType must be one of: students, session_packs, sessions",
            None,
        );
    }
    let file_path = match required_str(req, "filePath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };
    let admin_id = match parse_opt_string(req.params.get("adminId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("adminId {}", m), None),
    };

    let table = match csvfile::read_rows(&file_path) {
        Ok(t) => t,
        Err(e) => {
            let code = if e.downcast_ref::<std::io::Error>().is_some() {
                "file_read_failed"
            } else {
                "csv_parse_failed"
            };
            return err(&req.id, code, format!("{e:#}"), None);
        }
    };

    let upload_id = Uuid::new_v4().to_string();
    let ts = now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO bulk_uploads(
            id, admin_id, upload_type, file_path, status, total_rows,
            successful_rows, failed_rows, created_at, updated_at
         ) VALUES(?, ?, ?, ?, 'processing', ?, 0, 0, ?, ?)",
        params![
            upload_id,
            admin_id,
            upload_type,
            file_path.to_string_lossy(),
            table.rows.len() as i64,
            ts,
            ts
        ],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "bulk_uploads" })),
        );
    }

    let mut report = ImportReport::default();
    for row in &table.rows {
        let outcome = match upload_type.as_str() {
            "students" => import_student_row(conn, row),
            "session_packs" => import_pack_row(conn, row),
            _ => import_session_row(conn, row),
        };
        match outcome {
            Ok(outcome) => report.record(row.row_number, outcome),
            Err(e) => report.record(row.row_number, row_failed(e.to_string())),
        }
    }

    let status = report.terminal_status();
    let summary = report.summary();
    if let Err(e) = conn.execute(
        "UPDATE bulk_uploads
         SET status = ?, successful_rows = ?, failed_rows = ?, result_summary = ?, updated_at = ?
         WHERE id = ?",
        params![
            status,
            report.successes.len() as i64,
            report.errors.len() as i64,
            summary.to_string(),
            now_iso(),
            upload_id
        ],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "uploadId": upload_id,
            "status": status,
            "totalRows": table.rows.len(),
            "successfulRows": report.successes.len(),
            "failedRows": report.errors.len(),
            "summary": summary,
            "invalidate": invalidate(&["students", "sessionPacks", "sessions", "imports"])
        }),
    )
}

fn handle_imports_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, admin_id, upload_type, file_path, status, total_rows,
                successful_rows, failed_rows, created_at
         FROM bulk_uploads ORDER BY created_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "adminId": row.get::<_, Option<String>>(1)?,
                "uploadType": row.get::<_, String>(2)?,
                "filePath": row.get::<_, String>(3)?,
                "status": row.get::<_, String>(4)?,
                "totalRows": row.get::<_, i64>(5)?,
                "successfulRows": row.get::<_, i64>(6)?,
                "failedRows": row.get::<_, i64>(7)?,
                "createdAt": row.get::<_, Option<String>>(8)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(uploads) => ok(&req.id, json!({ "uploads": uploads })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_imports_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let upload_id = match required_str(req, "uploadId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let row = match conn
        .query_row(
            "SELECT id, admin_id, upload_type, file_path, status, total_rows,
                    successful_rows, failed_rows, result_summary, created_at, updated_at
             FROM bulk_uploads WHERE id = ?",
            [&upload_id],
            |row| {
                let raw_summary: Option<String> = row.get(8)?;
                Ok(json!({
                    "id": row.get::<_, String>(0)?,
                    "adminId": row.get::<_, Option<String>>(1)?,
                    "uploadType": row.get::<_, String>(2)?,
                    "filePath": row.get::<_, String>(3)?,
                    "status": row.get::<_, String>(4)?,
                    "totalRows": row.get::<_, i64>(5)?,
                    "successfulRows": row.get::<_, i64>(6)?,
                    "failedRows": row.get::<_, i64>(7)?,
                    "summary": raw_summary
                        .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok()),
                    "createdAt": row.get::<_, Option<String>>(9)?,
                    "updatedAt": row.get::<_, Option<String>>(10)?
                }))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match row {
        Some(upload) => ok(&req.id, json!({ "upload": upload })),
        None => err(&req.id, "not_found", "upload not found", None),
    }
}

fn handle_imports_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let upload_id = match required_str(req, "uploadId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let file_path: Option<String> = match conn
        .query_row(
            "SELECT file_path FROM bulk_uploads WHERE id = ?",
            [&upload_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(file_path) = file_path else {
        return err(&req.id, "not_found", "upload not found", None);
    };

    if let Err(e) = conn.execute("DELETE FROM bulk_uploads WHERE id = ?", [&upload_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "bulk_uploads" })),
        );
    }
    // Best-effort; the record is gone even if the file lingers.
    let file_removed = std::fs::remove_file(&file_path).is_ok();

    ok(
        &req.id,
        json!({ "deleted": true, "fileRemoved": file_removed, "invalidate": invalidate(&["imports"]) }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "imports.run" => Some(handle_imports_run(state, req)),
        "imports.list" => Some(handle_imports_list(state, req)),
        "imports.get" => Some(handle_imports_get(state, req)),
        "imports.delete" => Some(handle_imports_delete(state, req)),
        _ => None,
    }
}
