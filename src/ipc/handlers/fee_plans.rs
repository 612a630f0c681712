use crate::domain::PaymentMode;
use crate::fees::{self, DueDate, LateFeePolicy, PlanTerms};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, format_instant, invalidate, now_iso, parse_instant, parse_opt_string, required_str,
    student_exists,
};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_fee_plans_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let plan_title = match required_str(req, "planTitle") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let total_amount = match req.params.get("totalAmount").and_then(|v| v.as_f64()) {
        Some(v) if v > 0.0 => v,
        Some(_) => return err(&req.id, "bad_params", "totalAmount must be > 0", None),
        None => return err(&req.id, "bad_params", "missing totalAmount", None),
    };

    let Some(raw_dates) = req.params.get("dueDates").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing dueDates", None);
    };
    if raw_dates.is_empty() {
        return err(&req.id, "bad_params", "dueDates must not be empty", None);
    }
    let mut due_dates: Vec<(DateTime<Utc>, f64, Option<String>)> = Vec::with_capacity(raw_dates.len());
    for (i, entry) in raw_dates.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            return err(&req.id, "bad_params", format!("dueDates[{}] must be an object", i), None);
        };
        let date = match obj.get("date").and_then(|v| v.as_str()).and_then(parse_instant) {
            Some(t) => t,
            None => {
                return err(&req.id, "bad_params", format!("dueDates[{}].date is not a valid date", i), None)
            }
        };
        let amount = match obj.get("amount").and_then(|v| v.as_f64()) {
            Some(v) if v > 0.0 => v,
            _ => {
                return err(&req.id, "bad_params", format!("dueDates[{}].amount must be > 0", i), None)
            }
        };
        let description = match parse_opt_string(obj.get("description")) {
            Ok(v) => v,
            Err(m) => {
                return err(&req.id, "bad_params", format!("dueDates[{}].description {}", i, m), None)
            }
        };
        due_dates.push((date, amount, description));
    }

    let late_fee = match req.params.get("lateFeePolicy") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(obj) = v.as_object() else {
                return err(&req.id, "bad_params", "lateFeePolicy must be an object", None);
            };
            let rate = match obj.get("ratePerDay").and_then(|v| v.as_f64()) {
                Some(r) if r >= 0.0 => r,
                _ => return err(&req.id, "bad_params", "lateFeePolicy.ratePerDay must be >= 0", None),
            };
            let maximum = match obj.get("maximum").and_then(|v| v.as_f64()) {
                Some(m) if m >= 0.0 => m,
                _ => return err(&req.id, "bad_params", "lateFeePolicy.maximum must be >= 0", None),
            };
            Some((rate, maximum))
        }
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let plan_id = Uuid::new_v4().to_string();
    let ts = now_iso();
    if let Err(e) = tx.execute(
        "INSERT INTO fee_plans(
            id, student_id, plan_title, total_amount,
            late_fee_rate_per_day, late_fee_maximum, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            plan_id,
            student_id,
            plan_title,
            total_amount,
            late_fee.map(|(r, _)| r),
            late_fee.map(|(_, m)| m),
            ts,
            ts
        ],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "fee_plans" })),
        );
    }
    for (date, amount, description) in &due_dates {
        if let Err(e) = tx.execute(
            "INSERT INTO fee_due_dates(id, fee_plan_id, due_date, amount, description)
             VALUES(?, ?, ?, ?, ?)",
            params![
                Uuid::new_v4().to_string(),
                plan_id,
                format_instant(*date),
                amount,
                description
            ],
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "fee_due_dates" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "feePlanId": plan_id, "invalidate": invalidate(&["feePlans"]) }),
    )
}

struct StoredPlan {
    student_id: String,
    plan_title: String,
    terms: PlanTerms,
}

fn load_plan(conn: &Connection, plan_id: &str) -> Result<Option<StoredPlan>, rusqlite::Error> {
    let head: Option<(String, String, f64, Option<f64>, Option<f64>)> = conn
        .query_row(
            "SELECT student_id, plan_title, total_amount, late_fee_rate_per_day, late_fee_maximum
             FROM fee_plans WHERE id = ?",
            [plan_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()?;
    let Some((student_id, plan_title, total_amount, rate, maximum)) = head else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT due_date, amount, description FROM fee_due_dates
         WHERE fee_plan_id = ? ORDER BY due_date",
    )?;
    let rows = stmt.query_map([plan_id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, f64>(1)?,
            r.get::<_, Option<String>>(2)?,
        ))
    })?;
    let mut due_dates = Vec::new();
    for row in rows {
        let (raw_date, amount, description) = row?;
        let Some(date) = parse_instant(&raw_date) else {
            continue;
        };
        due_dates.push(DueDate {
            date,
            amount,
            description,
        });
    }

    let late_fee = match (rate, maximum) {
        (Some(rate_per_day), Some(maximum)) => Some(LateFeePolicy {
            rate_per_day,
            maximum,
        }),
        _ => None,
    };
    Ok(Some(StoredPlan {
        student_id,
        plan_title,
        terms: PlanTerms {
            total_amount,
            due_dates,
            late_fee,
        },
    }))
}

fn handle_fee_plans_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match parse_opt_string(req.params.get("studentId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("studentId {}", m), None),
    };

    let sql = format!(
        "SELECT
           fp.id, fp.student_id, fp.plan_title, fp.total_amount,
           fp.late_fee_rate_per_day, fp.late_fee_maximum,
           (SELECT COALESCE(SUM(p.amount_paid), 0) FROM payments p WHERE p.fee_plan_id = fp.id) AS paid,
           (SELECT COUNT(*) FROM fee_due_dates d WHERE d.fee_plan_id = fp.id) AS due_date_count
         FROM fee_plans fp
         {}
         ORDER BY fp.created_at",
        if student_id.is_some() { "WHERE fp.student_id = ?" } else { "" }
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        let rate: Option<f64> = row.get(4)?;
        let maximum: Option<f64> = row.get(5)?;
        Ok(json!({
            "id": row.get::<_, String>(0)?,
            "studentId": row.get::<_, String>(1)?,
            "planTitle": row.get::<_, String>(2)?,
            "totalAmount": row.get::<_, f64>(3)?,
            "lateFeePolicy": match (rate, maximum) {
                (Some(r), Some(m)) => json!({ "ratePerDay": r, "maximum": m }),
                _ => serde_json::Value::Null,
            },
            "amountPaid": row.get::<_, f64>(6)?,
            "dueDateCount": row.get::<_, i64>(7)?
        }))
    };
    let rows = match &student_id {
        Some(sid) => stmt
            .query_map([sid], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    };

    match rows {
        Ok(plans) => ok(&req.id, json!({ "plans": plans })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_fee_plans_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let plan_id = match required_str(req, "feePlanId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    // asOf pins "now" so callers get reproducible summaries.
    let as_of = match parse_opt_string(req.params.get("asOf")) {
        Ok(Some(raw)) => match parse_instant(&raw) {
            Some(t) => t,
            None => return err(&req.id, "bad_params", "asOf is not a valid instant", None),
        },
        Ok(None) => Utc::now(),
        Err(m) => return err(&req.id, "bad_params", format!("asOf {}", m), None),
    };

    let plan = match load_plan(conn, &plan_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "fee plan not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let payments: Vec<f64> = {
        let mut stmt = match conn
            .prepare("SELECT amount_paid FROM payments WHERE fee_plan_id = ? ORDER BY paid_at")
        {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match stmt
            .query_map([&plan_id], |r| r.get::<_, f64>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let summary = fees::payment_summary(&plan.terms, &payments, as_of);
    let schedule: Vec<serde_json::Value> = plan
        .terms
        .due_dates
        .iter()
        .map(|d| {
            json!({
                "date": format_instant(d.date),
                "amount": d.amount,
                "description": d.description
            })
        })
        .collect();
    ok(
        &req.id,
        json!({
            "feePlanId": plan_id,
            "studentId": plan.student_id,
            "planTitle": plan.plan_title,
            "dueDates": schedule,
            "totalAmount": summary.total_amount,
            "amountPaid": summary.amount_paid,
            "remainingAmount": summary.remaining_amount,
            "nextDueDate": summary.next_due_date.map(format_instant),
            "nextDueAmount": summary.next_due_amount,
            "lateFee": summary.late_fee,
            "daysOverdue": summary.days_overdue,
            "status": summary.status.as_str()
        }),
    )
}

fn handle_payments_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let plan_id = match required_str(req, "feePlanId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id: Option<String> = match conn
        .query_row("SELECT student_id FROM fee_plans WHERE id = ?", [&plan_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(student_id) = student_id else {
        return err(&req.id, "not_found", "fee plan not found", None);
    };

    let amount_paid = match req.params.get("amountPaid").and_then(|v| v.as_f64()) {
        Some(v) if v > 0.0 => v,
        Some(_) => return err(&req.id, "bad_params", "amountPaid must be > 0", None),
        None => return err(&req.id, "bad_params", "missing amountPaid", None),
    };
    let payment_mode = match required_str(req, "paymentMode") {
        Ok(v) => match PaymentMode::parse(&v) {
            Some(m) => m,
            None => return err(&req.id, "bad_params", format!("unknown paymentMode: {}", v), None),
        },
        Err(e) => return e,
    };
    let paid_at = match parse_opt_string(req.params.get("paidAt")) {
        Ok(Some(raw)) => match parse_instant(&raw) {
            Some(t) => format_instant(t),
            None => return err(&req.id, "bad_params", "paidAt is not a valid instant", None),
        },
        Ok(None) => now_iso(),
        Err(m) => return err(&req.id, "bad_params", format!("paidAt {}", m), None),
    };
    let notes = match parse_opt_string(req.params.get("notes")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("notes {}", m), None),
    };

    let payment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO payments(id, student_id, fee_plan_id, amount_paid, paid_at, payment_mode, notes)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        params![
            payment_id,
            student_id,
            plan_id,
            amount_paid,
            paid_at,
            payment_mode.as_str(),
            notes
        ],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "payments" })),
        );
    }

    ok(
        &req.id,
        json!({ "paymentId": payment_id, "invalidate": invalidate(&["feePlans", "payments"]) }),
    )
}

fn handle_payments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let plan_id = match parse_opt_string(req.params.get("feePlanId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("feePlanId {}", m), None),
    };
    let student_id = match parse_opt_string(req.params.get("studentId")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("studentId {}", m), None),
    };

    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(pid) = &plan_id {
        clauses.push("fee_plan_id = ?");
        values.push(rusqlite::types::Value::Text(pid.clone()));
    }
    if let Some(sid) = &student_id {
        clauses.push("student_id = ?");
        values.push(rusqlite::types::Value::Text(sid.clone()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT id, student_id, fee_plan_id, amount_paid, paid_at, payment_mode, notes
         FROM payments {} ORDER BY paid_at",
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
                "feePlanId": row.get::<_, String>(2)?,
                "amountPaid": row.get::<_, f64>(3)?,
                "paidAt": row.get::<_, String>(4)?,
                "paymentMode": row.get::<_, String>(5)?,
                "notes": row.get::<_, Option<String>>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(payments) => ok(&req.id, json!({ "payments": payments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "feePlans.create" => Some(handle_fee_plans_create(state, req)),
        "feePlans.list" => Some(handle_fee_plans_list(state, req)),
        "feePlans.summary" => Some(handle_fee_plans_summary(state, req)),
        "payments.record" => Some(handle_payments_record(state, req)),
        "payments.list" => Some(handle_payments_list(state, req)),
        _ => None,
    }
}
