mod test_support;

use serde_json::json;
use test_support::{request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn same_teacher_overlap_conflicts_and_touching_endpoints_do_not() {
    let workspace = temp_dir("maestro-conflict-teacher");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "name": "Mira", "email": "mira@school.test", "subjects": ["Piano"] }),
    );
    let teacher_id = teacher.get("teacherId").and_then(|v| v.as_str()).expect("teacherId").to_string();
    let a = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "name": "River", "email": "river@school.test" }),
    );
    let student_a = a.get("studentId").and_then(|v| v.as_str()).expect("studentId").to_string();
    let b = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "name": "Kai", "email": "kai@school.test" }),
    );
    let student_b = b.get("studentId").and_then(|v| v.as_str()).expect("studentId").to_string();

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "sessions.create",
        json!({
            "teacherId": teacher_id,
            "studentIds": [student_a],
            "subject": "Piano",
            "sessionType": "Solo",
            "location": "Online",
            "dateTime": "2026-09-01T10:00:00Z",
            "durationMinutes": 60
        }),
    );
    let first_id = first.get("sessionId").and_then(|v| v.as_str()).expect("sessionId").to_string();

    // Same teacher, half-overlapping slot.
    let (code, error) = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "sessions.create",
        json!({
            "teacherId": teacher_id,
            "studentIds": [student_b],
            "subject": "Piano",
            "sessionType": "Solo",
            "location": "Online",
            "dateTime": "2026-09-01T10:30:00Z",
            "durationMinutes": 60
        }),
    );
    assert_eq!(code, "conflict");
    assert_eq!(
        error.pointer("/details/conflictingSessionId").and_then(|v| v.as_str()),
        Some(first_id.as_str())
    );
    assert_eq!(error.pointer("/details/rule").and_then(|v| v.as_str()), Some("teacher"));

    // Back-to-back is fine: the window is half-open.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sessions.create",
        json!({
            "teacherId": teacher_id,
            "studentIds": [student_b],
            "subject": "Piano",
            "sessionType": "Solo",
            "location": "Online",
            "dateTime": "2026-09-01T11:00:00Z",
            "durationMinutes": 60
        }),
    );

    // Cancelled sessions no longer block the slot.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "sessions.updateStatus",
        json!({ "sessionId": first_id, "status": "Cancelled by Teacher" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "sessions.create",
        json!({
            "teacherId": teacher_id,
            "studentIds": [student_b],
            "subject": "Piano",
            "sessionType": "Solo",
            "location": "Online",
            "dateTime": "2026-09-01T10:15:00Z",
            "durationMinutes": 30
        }),
    );
}

#[test]
fn student_overlap_across_teachers_conflicts() {
    let workspace = temp_dir("maestro-conflict-student");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let t1 = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "name": "Mira", "email": "mira@school.test", "subjects": ["Piano"] }),
    );
    let teacher_one = t1.get("teacherId").and_then(|v| v.as_str()).expect("teacherId").to_string();
    let t2 = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({ "name": "Sol", "email": "sol@school.test", "subjects": ["Guitar"] }),
    );
    let teacher_two = t2.get("teacherId").and_then(|v| v.as_str()).expect("teacherId").to_string();
    let a = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "name": "River", "email": "river@school.test" }),
    );
    let student = a.get("studentId").and_then(|v| v.as_str()).expect("studentId").to_string();

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "sessions.create",
        json!({
            "teacherId": teacher_one,
            "studentIds": [student],
            "subject": "Piano",
            "sessionType": "Solo",
            "location": "Online",
            "dateTime": "2026-09-02T10:00:00Z",
            "durationMinutes": 60
        }),
    );
    let first_id = first.get("sessionId").and_then(|v| v.as_str()).expect("sessionId").to_string();

    let (code, error) = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "sessions.create",
        json!({
            "teacherId": teacher_two,
            "studentIds": [student],
            "subject": "Guitar",
            "sessionType": "Solo",
            "location": "Online",
            "dateTime": "2026-09-02T10:30:00Z",
            "durationMinutes": 60
        }),
    );
    assert_eq!(code, "conflict");
    assert_eq!(error.pointer("/details/rule").and_then(|v| v.as_str()), Some("student"));

    // The pure checker over stored sessions agrees.
    let check = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sessions.checkConflict",
        json!({
            "conflictType": "student",
            "studentIds": [student],
            "dateTime": "2026-09-02T10:30:00Z",
            "durationMinutes": 60
        }),
    );
    assert_eq!(check.get("hasConflict").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        check.get("conflictingSessionId").and_then(|v| v.as_str()),
        Some(first_id.as_str())
    );

    // The stored session never conflicts with itself.
    let check_self = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "sessions.checkConflict",
        json!({
            "conflictType": "student",
            "sessionId": first_id,
            "studentIds": [student],
            "dateTime": "2026-09-02T10:30:00Z",
            "durationMinutes": 60
        }),
    );
    assert_eq!(check_self.get("hasConflict").and_then(|v| v.as_bool()), Some(false));
}

#[test]
fn solo_sessions_never_grow_past_one_participant() {
    let workspace = temp_dir("maestro-solo-append");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let t = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "name": "Mira", "email": "mira@school.test", "subjects": ["Violin"] }),
    );
    let teacher_id = t.get("teacherId").and_then(|v| v.as_str()).expect("teacherId").to_string();
    let a = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "name": "River", "email": "river@school.test" }),
    );
    let student_a = a.get("studentId").and_then(|v| v.as_str()).expect("studentId").to_string();
    let b = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "name": "Kai", "email": "kai@school.test" }),
    );
    let student_b = b.get("studentId").and_then(|v| v.as_str()).expect("studentId").to_string();

    let solo = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "sessions.create",
        json!({
            "teacherId": teacher_id,
            "studentIds": [student_a],
            "subject": "Violin",
            "sessionType": "Solo",
            "location": "Offline",
            "dateTime": "2026-09-04T10:00:00Z",
            "durationMinutes": 45
        }),
    );
    let solo_id = solo.get("sessionId").and_then(|v| v.as_str()).expect("sessionId").to_string();

    // The single-participant rule holds after creation too.
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "sessions.addStudents",
        json!({ "sessionId": solo_id, "studentIds": [student_b] }),
    );
    assert_eq!(code, "bad_params");

    // Re-adding the existing participant stays a no-op.
    let added = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sessions.addStudents",
        json!({ "sessionId": solo_id, "studentIds": [student_a] }),
    );
    assert_eq!(added.get("added").and_then(|v| v.as_i64()), Some(0));

    let listed = request_ok(&mut stdin, &mut reader, "8", "sessions.list", json!({}));
    let sessions = listed.get("sessions").and_then(|v| v.as_array()).expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(
        sessions[0].get("studentIds").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );
}

#[test]
fn duo_capacity_fires_only_on_the_same_session() {
    let workspace = temp_dir("maestro-conflict-duo");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let t = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "name": "Mira", "email": "mira@school.test", "subjects": ["Drums"] }),
    );
    let teacher_id = t.get("teacherId").and_then(|v| v.as_str()).expect("teacherId").to_string();
    let mut students = Vec::new();
    for (i, (name, email)) in [
        ("River", "river@school.test"),
        ("Kai", "kai@school.test"),
        ("Noa", "noa@school.test"),
    ]
    .iter()
    .enumerate()
    {
        let s = request_ok(
            &mut stdin,
            &mut reader,
            &format!("3-{}", i),
            "students.create",
            json!({ "name": name, "email": email }),
        );
        students.push(s.get("studentId").and_then(|v| v.as_str()).expect("studentId").to_string());
    }

    let duo = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "sessions.create",
        json!({
            "teacherId": teacher_id,
            "studentIds": [students[0]],
            "subject": "Drums",
            "sessionType": "Duo",
            "location": "Offline",
            "dateTime": "2026-09-03T10:00:00Z",
            "durationMinutes": 45
        }),
    );
    let duo_id = duo.get("sessionId").and_then(|v| v.as_str()).expect("sessionId").to_string();

    let added = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "sessions.addStudents",
        json!({ "sessionId": duo_id, "studentIds": [students[1]] }),
    );
    assert_eq!(added.get("added").and_then(|v| v.as_i64()), Some(1));

    let (code, error) = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "sessions.addStudents",
        json!({ "sessionId": duo_id, "studentIds": [students[2]] }),
    );
    assert_eq!(code, "conflict");
    assert_eq!(error.pointer("/details/rule").and_then(|v| v.as_str()), Some("duo"));

    // The capacity rule only ever matches the candidate's own session.
    let check = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sessions.checkConflict",
        json!({
            "conflictType": "duo",
            "sessionId": "some-other-session",
            "studentIds": [students[2]],
            "sessionType": "Duo",
            "dateTime": "2026-09-03T10:00:00Z",
            "durationMinutes": 45
        }),
    );
    assert_eq!(check.get("hasConflict").and_then(|v| v.as_bool()), Some(false));
}
