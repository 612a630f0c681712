mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{request_err, request_ok, spawn_sidecar, temp_dir};

fn setup_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "setup-1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = request_ok(
        stdin,
        reader,
        "setup-2",
        "students.create",
        json!({ "name": "River", "email": "river@school.test" }),
    );
    s.get("studentId").and_then(|v| v.as_str()).expect("studentId").to_string()
}

#[test]
fn partial_payment_against_past_due_installment_reads_overdue() {
    let workspace = temp_dir("maestro-fees-overdue");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let student_id = setup_student(&mut stdin, &mut reader, &workspace);

    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "feePlans.create",
        json!({
            "studentId": student_id,
            "planTitle": "Spring term",
            "totalAmount": 1000.0,
            "dueDates": [{ "date": "2026-02-13T12:00:00Z", "amount": 1000.0 }]
        }),
    );
    let plan_id = plan.get("feePlanId").and_then(|v| v.as_str()).expect("feePlanId").to_string();

    for (i, amount) in [250.0, 150.0].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("2-{}", i),
            "payments.record",
            json!({ "feePlanId": plan_id, "amountPaid": amount, "paymentMode": "Cash" }),
        );
    }

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "feePlans.summary",
        json!({ "feePlanId": plan_id, "asOf": "2026-03-15T12:00:00Z" }),
    );
    assert_eq!(summary.get("amountPaid").and_then(|v| v.as_f64()), Some(400.0));
    assert_eq!(summary.get("remainingAmount").and_then(|v| v.as_f64()), Some(600.0));
    assert_eq!(summary.get("nextDueAmount").and_then(|v| v.as_f64()), Some(600.0));
    assert_eq!(summary.get("status").and_then(|v| v.as_str()), Some("overdue"));
    assert_eq!(summary.get("daysOverdue").and_then(|v| v.as_i64()), Some(30));
    assert_eq!(summary.get("lateFee").and_then(|v| v.as_f64()), Some(0.0));
}

#[test]
fn late_fee_is_capped_by_the_policy_maximum() {
    let workspace = temp_dir("maestro-fees-cap");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let student_id = setup_student(&mut stdin, &mut reader, &workspace);

    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "feePlans.create",
        json!({
            "studentId": student_id,
            "planTitle": "Spring term",
            "totalAmount": 1000.0,
            "dueDates": [
                { "date": "2026-03-05T12:00:00Z", "amount": 1000.0, "description": "Term balance" }
            ],
            "lateFeePolicy": { "ratePerDay": 0.01, "maximum": 50.0 }
        }),
    );
    let plan_id = plan.get("feePlanId").and_then(|v| v.as_str()).expect("feePlanId").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "payments.record",
        json!({ "feePlanId": plan_id, "amountPaid": 400.0, "paymentMode": "Card" }),
    );

    // 10 days * 0.01 * 600 = 60, capped at 50.
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "feePlans.summary",
        json!({ "feePlanId": plan_id, "asOf": "2026-03-15T12:00:00Z" }),
    );
    assert_eq!(summary.get("lateFee").and_then(|v| v.as_f64()), Some(50.0));
    assert_eq!(summary.get("daysOverdue").and_then(|v| v.as_i64()), Some(10));
    assert_eq!(summary.get("status").and_then(|v| v.as_str()), Some("overdue"));

    // The summary carries the full schedule, descriptions included.
    let schedule = summary.get("dueDates").and_then(|v| v.as_array()).expect("dueDates");
    assert_eq!(schedule.len(), 1);
    assert_eq!(
        schedule[0].get("date").and_then(|v| v.as_str()),
        Some("2026-03-05T12:00:00Z")
    );
    assert_eq!(
        schedule[0].get("description").and_then(|v| v.as_str()),
        Some("Term balance")
    );
}

#[test]
fn full_payment_settles_the_plan() {
    let workspace = temp_dir("maestro-fees-paid");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let student_id = setup_student(&mut stdin, &mut reader, &workspace);

    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "feePlans.create",
        json!({
            "studentId": student_id,
            "planTitle": "Summer intensive",
            "totalAmount": 600.0,
            "dueDates": [
                { "date": "2026-06-01", "amount": 300.0 },
                { "date": "2026-07-01", "amount": 300.0 }
            ]
        }),
    );
    let plan_id = plan.get("feePlanId").and_then(|v| v.as_str()).expect("feePlanId").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "payments.record",
        json!({ "feePlanId": plan_id, "amountPaid": 600.0, "paymentMode": "Bank Transfer" }),
    );

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "feePlans.summary",
        json!({ "feePlanId": plan_id, "asOf": "2026-08-01T00:00:00Z" }),
    );
    assert_eq!(summary.get("status").and_then(|v| v.as_str()), Some("paid"));
    assert_eq!(summary.get("remainingAmount").and_then(|v| v.as_f64()), Some(0.0));
    assert!(summary.get("nextDueDate").map(|v| v.is_null()).unwrap_or(false));
}

#[test]
fn payment_validation_and_ledger_listing() {
    let workspace = temp_dir("maestro-fees-payments");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let student_id = setup_student(&mut stdin, &mut reader, &workspace);

    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "feePlans.create",
        json!({
            "studentId": student_id,
            "planTitle": "Autumn term",
            "totalAmount": 500.0,
            "dueDates": [{ "date": "2026-10-01", "amount": 500.0 }]
        }),
    );
    let plan_id = plan.get("feePlanId").and_then(|v| v.as_str()).expect("feePlanId").to_string();

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "payments.record",
        json!({ "feePlanId": plan_id, "amountPaid": 0.0, "paymentMode": "Cash" }),
    );
    assert_eq!(code, "bad_params");
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "payments.record",
        json!({ "feePlanId": plan_id, "amountPaid": 100.0, "paymentMode": "IOU" }),
    );
    assert_eq!(code, "bad_params");
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "payments.record",
        json!({ "feePlanId": "missing", "amountPaid": 100.0, "paymentMode": "Cash" }),
    );
    assert_eq!(code, "not_found");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "payments.record",
        json!({
            "feePlanId": plan_id,
            "amountPaid": 100.0,
            "paymentMode": "UPI",
            "paidAt": "2026-09-01T09:00:00Z"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "payments.record",
        json!({ "feePlanId": plan_id, "amountPaid": 150.0, "paymentMode": "Cash" }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "payments.list",
        json!({ "feePlanId": plan_id }),
    );
    let payments = listed.get("payments").and_then(|v| v.as_array()).expect("payments");
    assert_eq!(payments.len(), 2);
    assert_eq!(
        payments[0].get("studentId").and_then(|v| v.as_str()),
        Some(student_id.as_str())
    );

    let plans = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "feePlans.list",
        json!({ "studentId": student_id }),
    );
    let rows = plans.get("plans").and_then(|v| v.as_array()).expect("plans");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("amountPaid").and_then(|v| v.as_f64()), Some(250.0));
}
