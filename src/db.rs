use rusqlite::{params, Connection};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("maestro.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            subjects TEXT NOT NULL DEFAULT '',
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            preferred_subjects TEXT NOT NULL DEFAULT '',
            notes TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_packs(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            size INTEGER NOT NULL,
            subject TEXT NOT NULL,
            session_type TEXT NOT NULL,
            location TEXT NOT NULL,
            purchased_date TEXT,
            expiry_date TEXT,
            remaining_sessions INTEGER NOT NULL,
            weekly_frequency INTEGER,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_packs_student ON session_packs(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            pack_id TEXT,
            subject TEXT NOT NULL,
            session_type TEXT NOT NULL,
            location TEXT NOT NULL,
            date_time TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL,
            status TEXT NOT NULL,
            notes TEXT,
            reschedule_count INTEGER NOT NULL DEFAULT 0,
            original_session_id TEXT,
            rescheduled_from TEXT,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(pack_id) REFERENCES session_packs(id)
        )",
        [],
    )?;
    ensure_sessions_reschedule_links(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_teacher ON sessions(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_pack ON sessions(pack_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_date_time ON sessions(date_time)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_students(
            session_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(session_id, student_id),
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_session_students_student ON session_students(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_plans(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            plan_title TEXT NOT NULL,
            total_amount REAL NOT NULL,
            late_fee_rate_per_day REAL,
            late_fee_maximum REAL,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_plans_student ON fee_plans(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_due_dates(
            id TEXT PRIMARY KEY,
            fee_plan_id TEXT NOT NULL,
            due_date TEXT NOT NULL,
            amount REAL NOT NULL,
            description TEXT,
            FOREIGN KEY(fee_plan_id) REFERENCES fee_plans(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_due_dates_plan ON fee_due_dates(fee_plan_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS payments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            fee_plan_id TEXT NOT NULL,
            amount_paid REAL NOT NULL,
            paid_at TEXT NOT NULL,
            payment_mode TEXT NOT NULL,
            notes TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(fee_plan_id) REFERENCES fee_plans(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_plan ON payments(fee_plan_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_payments_student ON payments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bulk_uploads(
            id TEXT PRIMARY KEY,
            admin_id TEXT,
            upload_type TEXT NOT NULL,
            file_path TEXT NOT NULL,
            status TEXT NOT NULL,
            total_rows INTEGER NOT NULL DEFAULT 0,
            successful_rows INTEGER NOT NULL DEFAULT 0,
            failed_rows INTEGER NOT NULL DEFAULT 0,
            result_summary TEXT,
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    ensure_session_packs_weekly_frequency(&conn)?;

    Ok(conn)
}

/// Retires a pack whose expiry has passed. Expiry is enforced lazily at the
/// points a pack is about to be used, not by a background sweep. Must be
/// called outside any transaction that may roll back, so the retirement
/// sticks even when the surrounding booking fails. Returns true if the pack
/// was flipped inactive.
pub fn retire_expired_pack(conn: &Connection, pack_id: &str, now: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE session_packs SET is_active = 0
         WHERE id = ? AND is_active = 1 AND expiry_date IS NOT NULL AND expiry_date <= ?",
        params![pack_id, now],
    )?;
    Ok(changed > 0)
}

/// Consumes one session from a pack. The conditional UPDATE keeps the
/// decrement atomic under concurrent writers; a pack that hits zero is
/// deactivated in the same statement. Returns false when the pack had no
/// remaining capacity (or does not exist / is inactive / has expired).
pub fn consume_pack_session(conn: &Connection, pack_id: &str, now: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE session_packs
         SET remaining_sessions = remaining_sessions - 1,
             is_active = CASE WHEN remaining_sessions - 1 <= 0 THEN 0 ELSE is_active END
         WHERE id = ? AND is_active = 1 AND remaining_sessions > 0
           AND (expiry_date IS NULL OR expiry_date > ?)",
        params![pack_id, now],
    )?;
    Ok(changed > 0)
}

fn ensure_sessions_reschedule_links(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces predate the reschedule chain.
    if !table_has_column(conn, "sessions", "original_session_id")? {
        conn.execute("ALTER TABLE sessions ADD COLUMN original_session_id TEXT", [])?;
    }
    if !table_has_column(conn, "sessions", "rescheduled_from")? {
        conn.execute("ALTER TABLE sessions ADD COLUMN rescheduled_from TEXT", [])?;
    }
    if !table_has_column(conn, "sessions", "reschedule_count")? {
        conn.execute(
            "ALTER TABLE sessions ADD COLUMN reschedule_count INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

fn ensure_session_packs_weekly_frequency(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "session_packs", "weekly_frequency")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE session_packs ADD COLUMN weekly_frequency INTEGER",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
